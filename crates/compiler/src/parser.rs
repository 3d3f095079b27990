//! Recursive-descent parser: tokens to typed AST.
//!
//! The grammar follows C99 declarations and statements. Every expression
//! leaves here with a resolved type; implicit conversions and pointer
//! scaling are inserted during parsing so the lowering pass never guesses.
//! Non-fatal problems are reported and parsing continues; structural
//! failures (a missing `;`, an unclosed brace) abort the translation unit.

use std::rc::Rc;

use tracing::debug;

use crate::ast::{
    BinOp, CaseInfo, Declaration, Expr, ExprKind, Function, InitKind, Initializer, Stmt, UnOp,
};
use crate::diag::CompileError;
use crate::lexer::{Lexer, Token, TokenKind};
use crate::symbols::{GLOBAL_SCOPE, Name, ScopeId, Session, Storage, VarPlace};
use crate::types::{
    ARRAY_LEN_UNSIZED, FixnumKind, FlonumKind, FuncType, MemberInfo, StructInfo, StructRef, Type,
    arith_result, can_cast, ptrof, same_type,
};

type R<T> = Result<T, CompileError>;

/// Function body being parsed.
struct FuncContext {
    name: Name,
    ty: Rc<FuncType>,
    params: Vec<(Name, Type)>,
    param_scope: ScopeId,
    scopes: Vec<ScopeId>,
    labels: Vec<Name>,
    gotos: Vec<(Name, Token)>,
}

pub struct Parser<'a> {
    lexer: &'a mut Lexer,
    session: &'a mut Session,
    curscope: ScopeId,
    curfunc: Option<FuncContext>,
    /// Case lists of the enclosing switches, innermost last.
    switch_stack: Vec<Vec<CaseInfo>>,
    break_ok: u32,
    continue_ok: u32,
    /// Named parameter list of the declarator just parsed, for function
    /// definitions (the type alone only keeps parameter types).
    last_funparams: Option<Vec<(Option<Name>, Type)>>,
}

/// Result of a declarator: base type with modifiers/suffixes applied,
/// plus the declared identifier if present.
struct VarDef {
    raw: Type,
    ty: Type,
    storage: Storage,
    ident: Option<Token>,
}

impl<'a> Parser<'a> {
    pub fn new(lexer: &'a mut Lexer, session: &'a mut Session) -> Parser<'a> {
        Parser {
            lexer,
            session,
            curscope: GLOBAL_SCOPE,
            curfunc: None,
            switch_stack: Vec::new(),
            break_ok: 0,
            continue_ok: 0,
            last_funparams: None,
        }
    }

    /// Parse the whole translation unit, appending to `decls`.
    pub fn parse(&mut self, decls: &mut Vec<Declaration>) -> R<()> {
        self.curscope = GLOBAL_SCOPE;
        while self.matches(TokenKind::Eof)?.is_none() {
            if let Some(decl) = self.parse_declaration()? {
                decls.push(decl);
            }
        }
        Ok(())
    }

    // ---- token plumbing ----

    fn fetch(&mut self) -> R<Token> {
        self.lexer.fetch()
    }

    fn unget(&mut self, token: Token) {
        self.lexer.unget(token);
    }

    fn matches(&mut self, kind: TokenKind) -> R<Option<Token>> {
        self.lexer.matches(&kind)
    }

    fn match_ident(&mut self) -> R<Option<Token>> {
        self.lexer.match_ident()
    }

    fn consume(&mut self, kind: TokenKind, message: &str) -> R<Token> {
        match self.matches(kind)? {
            Some(token) => Ok(token),
            None => {
                let token = self.fetch()?;
                self.fatal(Some(&token), message.to_string())
            }
        }
    }

    fn nofatal(&mut self, token: Option<&Token>, message: String) -> R<()> {
        self.session.diags.borrow_mut().error_at(token, message)
    }

    fn fatal<T>(&mut self, token: Option<&Token>, message: String) -> R<T> {
        self.session.diags.borrow_mut().error_at(token, message)?;
        Err(CompileError::Fatal)
    }

    fn name_str(&self, name: Name) -> String {
        self.session.name_str(name)
    }

    // ---- scopes ----

    fn enter_scope(&mut self) -> ScopeId {
        let scope = self.session.new_scope(self.curscope);
        self.curscope = scope;
        if let Some(func) = self.curfunc.as_mut() {
            func.scopes.push(scope);
        }
        scope
    }

    fn exit_scope(&mut self) {
        debug_assert!(!self.curscope.is_global());
        self.curscope = self.session.scope(self.curscope).parent.unwrap_or(GLOBAL_SCOPE);
    }

    /// Add a variable, reporting a duplicate unless one side is extern.
    fn add_var_to_scope(
        &mut self,
        scope: ScopeId,
        ident: &Token,
        ty: Type,
        storage: Storage,
    ) -> R<usize> {
        let name = ident.ident().expect("identifier token");
        if let Some(index) = self.session.var_find(scope, name) {
            let existing = self.session.var(scope, index);
            if !existing.storage.is_extern && !storage.is_extern {
                self.nofatal(
                    Some(ident),
                    format!("`{}' already defined", self.name_str(name)),
                )?;
                return Ok(index);
            }
            if !storage.is_extern {
                // The definition replaces the extern declaration.
                let var = self.session.var_mut(scope, index);
                var.ty = ty;
                var.storage = storage;
            }
            return Ok(index);
        }
        let index = self.session.add_var(scope, name, ty.clone(), storage);
        if !scope.is_global() && storage.is_static {
            // A static local shadows a hidden global that carries the data.
            let label = self.session.alloc_label();
            self.session.add_var(GLOBAL_SCOPE, label, ty, storage);
            if let VarPlace::Local { static_gvar } = &mut self.session.var_mut(scope, index).place {
                *static_gvar = Some(label);
            }
        }
        Ok(index)
    }

    // ---- types ----

    /// Storage-class specifiers and a base type, or `None` when the next
    /// tokens do not start a declaration.
    fn parse_raw_type(&mut self) -> R<Option<(Type, Storage)>> {
        let mut storage = Storage::default();
        let mut unsigned: Option<bool> = None;
        let mut longs = 0usize;
        let mut base: Option<Type> = None;
        let mut saw_int_keyword = false;

        loop {
            let token = self.fetch()?;
            match &token.kind {
                TokenKind::Typedef => storage.is_typedef = true,
                TokenKind::Extern => storage.is_extern = true,
                TokenKind::Static => storage.is_static = true,
                TokenKind::Inline | TokenKind::Const | TokenKind::Volatile => {}
                TokenKind::Unsigned => unsigned = Some(true),
                TokenKind::Signed => unsigned = Some(false),
                TokenKind::Void => base = Some(Type::Void),
                TokenKind::Char => {
                    base = Some(Type::Fixnum { kind: FixnumKind::Char, unsigned: false })
                }
                TokenKind::Short => {
                    base = Some(Type::Fixnum { kind: FixnumKind::Short, unsigned: false })
                }
                TokenKind::Int => saw_int_keyword = true,
                TokenKind::Long => longs += 1,
                TokenKind::Float => base = Some(Type::Flonum(FlonumKind::Float)),
                TokenKind::Double => base = Some(Type::Flonum(FlonumKind::Double)),
                TokenKind::Struct | TokenKind::Union => {
                    let is_union = token.kind == TokenKind::Union;
                    base = Some(self.parse_struct_union(is_union, &token)?);
                }
                TokenKind::Enum => {
                    base = Some(self.parse_enum()?);
                }
                TokenKind::Ident(name) => {
                    let usable = base.is_none()
                        && longs == 0
                        && !saw_int_keyword
                        && unsigned.is_none();
                    if usable {
                        if let Some((_, ty)) = self.session.find_typedef(self.curscope, *name) {
                            base = Some(ty);
                            continue;
                        }
                    }
                    self.unget(token);
                    break;
                }
                _ => {
                    self.unget(token);
                    break;
                }
            }
        }

        if base.is_none() && longs == 0 && !saw_int_keyword && unsigned.is_none() {
            if storage != Storage::default() {
                // Storage class without a type; C89 implicit int.
                return Ok(Some((Type::INT, storage)));
            }
            return Ok(None);
        }

        let ty = match base {
            Some(Type::Fixnum { kind, unsigned: base_unsigned }) => Type::Fixnum {
                kind,
                unsigned: unsigned.unwrap_or(base_unsigned),
            },
            // Typedefs pass through whole; `long double` stays double.
            Some(ty) => ty,
            None => {
                let kind = match longs {
                    0 => FixnumKind::Int,
                    1 => FixnumKind::Long,
                    _ => FixnumKind::LongLong,
                };
                Type::Fixnum { kind, unsigned: unsigned.unwrap_or(false) }
            }
        };
        Ok(Some((ty, storage)))
    }

    fn parse_struct_union(&mut self, is_union: bool, token: &Token) -> R<Type> {
        let tag = self.match_ident()?;
        let tag_name = tag.as_ref().and_then(|t| t.ident());

        if self.matches(TokenKind::LBrace)?.is_some() {
            let members = self.parse_struct_members()?;
            let info = StructInfo::layout(members, is_union);
            let sref = match tag_name {
                Some(name) => {
                    // Reuse an incomplete tag declared in this scope chain
                    // if it has no body yet; otherwise define fresh here.
                    let existing = self.session.find_struct_tag(self.curscope, name);
                    match existing {
                        Some(sref) if !sref.completed() && sref.is_union == is_union => sref,
                        _ => {
                            let sref = StructRef::new(Some(name), is_union);
                            self.session.add_struct_tag(self.curscope, name, sref.clone());
                            sref
                        }
                    }
                }
                None => StructRef::new(None, is_union),
            };
            if sref.completed() {
                self.nofatal(
                    Some(token),
                    format!(
                        "`{}' already defined",
                        tag_name.map(|n| self.name_str(n)).unwrap_or_default()
                    ),
                )?;
            } else {
                *sref.info.borrow_mut() = Some(info);
            }
            Ok(Type::Struct(sref))
        } else {
            let Some(name) = tag_name else {
                return self.fatal(Some(token), "Illegal struct/union usage".to_string());
            };
            match self.session.find_struct_tag(self.curscope, name) {
                Some(sref) => Ok(Type::Struct(sref)),
                None => {
                    let sref = StructRef::new(Some(name), is_union);
                    self.session.add_struct_tag(self.curscope, name, sref.clone());
                    Ok(Type::Struct(sref))
                }
            }
        }
    }

    fn parse_struct_members(&mut self) -> R<Vec<MemberInfo>> {
        let mut members = Vec::new();
        while self.matches(TokenKind::RBrace)?.is_none() {
            let Some(def) = self.parse_var_def()? else {
                let token = self.fetch()?;
                return self.fatal(Some(&token), "Member expected".to_string());
            };
            let mut def = def;
            loop {
                if let Some(colon) = self.matches(TokenKind::Colon)? {
                    self.nofatal(Some(&colon), "bit-fields are not supported".to_string())?;
                    let _ = self.parse_const()?;
                }
                let name = def.ident.as_ref().and_then(|t| t.ident());
                if name.is_none() && !def.ty.is_struct() {
                    let token = self.fetch()?;
                    self.fatal::<()>(Some(&token), "Member name expected".to_string())?;
                }
                members.push(MemberInfo { name, ty: def.ty.clone(), offset: 0 });

                if self.matches(TokenKind::Comma)?.is_none() {
                    break;
                }
                let ty = self.parse_type_modifier(def.raw.clone())?;
                let (ty, ident) = self.parse_declarator(ty, false)?;
                def = VarDef { raw: def.raw, ty, storage: def.storage, ident };
            }
            self.consume(TokenKind::Semicolon, "`;' expected")?;
        }
        Ok(members)
    }

    fn parse_enum(&mut self) -> R<Type> {
        let _tag = self.match_ident()?;
        let ty = Type::Fixnum { kind: FixnumKind::Enum, unsigned: false };
        if self.matches(TokenKind::LBrace)?.is_some() {
            let mut value: i64 = 0;
            if self.matches(TokenKind::RBrace)?.is_none() {
                loop {
                    let ident = self.consume_ident("`ident' expected")?;
                    let name = ident.ident().unwrap();
                    if self.matches(TokenKind::Assign)?.is_some() {
                        value = self.parse_const()?;
                    }
                    if self.session.find_enum_const(self.curscope, name).is_some()
                        || self.session.var_find(self.curscope, name).is_some()
                    {
                        self.nofatal(
                            Some(&ident),
                            format!("`{}' already defined", self.name_str(name)),
                        )?;
                    }
                    self.session.add_enum_const(self.curscope, name, value);
                    value += 1;
                    if self.matches(TokenKind::Comma)?.is_some() {
                        if self.matches(TokenKind::RBrace)?.is_some() {
                            break;
                        }
                    } else {
                        self.consume(TokenKind::RBrace, "`}' or `,' expected")?;
                        break;
                    }
                }
            }
        }
        Ok(ty)
    }

    fn consume_ident(&mut self, message: &str) -> R<Token> {
        match self.match_ident()? {
            Some(token) => Ok(token),
            None => {
                let token = self.fetch()?;
                self.fatal(Some(&token), message.to_string())
            }
        }
    }

    /// Apply leading `*` and qualifiers.
    fn parse_type_modifier(&mut self, mut ty: Type) -> R<Type> {
        loop {
            let token = self.fetch()?;
            match token.kind {
                TokenKind::Mul => ty = ptrof(&ty),
                TokenKind::Const | TokenKind::Volatile => {}
                _ => {
                    self.unget(token);
                    return Ok(ty);
                }
            }
        }
    }

    /// `[N]` suffixes, innermost first.
    fn parse_type_suffix(&mut self, ty: Type) -> R<Type> {
        if self.matches(TokenKind::LBracket)?.is_none() {
            return Ok(ty);
        }
        let mut len = ARRAY_LEN_UNSIZED;
        if self.matches(TokenKind::RBracket)?.is_none() {
            let tok = self.fetch()?;
            self.unget(tok.clone());
            let value = self.parse_const()?;
            if value <= 0 {
                self.nofatal(Some(&tok), "Array size must be greater than 0".to_string())?;
            }
            len = value.max(1) as isize;
            self.consume(TokenKind::RBracket, "`]' expected")?;
        }
        let elem = self.parse_type_suffix(ty)?;
        Ok(Type::Array { elem: Box::new(elem), len })
    }

    /// Declarator after the base type and leading `*`s: the identifier,
    /// array suffixes, function parameter lists, and the parenthesized
    /// `(*name)` form.
    fn parse_declarator(&mut self, ty: Type, allow_funcs: bool) -> R<(Type, Option<Token>)> {
        if let Some(lpar) = self.matches(TokenKind::LParen)? {
            if self.matches(TokenKind::Mul)?.is_some() {
                let mut depth = 1usize;
                while self.matches(TokenKind::Mul)?.is_some() {
                    depth += 1;
                }
                let ident = self.match_ident()?;
                self.consume(TokenKind::RParen, "`)' expected")?;
                let inner = if self.matches(TokenKind::LParen)?.is_some() {
                    let (params, vaargs) = self.parse_funparams()?;
                    let params = params
                        .map(|v| v.into_iter().map(|(_, ty)| ty).collect::<Vec<_>>());
                    Type::Func(Rc::new(FuncType { ret: ty, params, vaargs }))
                } else {
                    self.parse_type_suffix(ty)?
                };
                let mut wrapped = inner;
                for _ in 0..depth {
                    wrapped = ptrof(&wrapped);
                }
                return Ok((wrapped, ident));
            }
            self.unget(lpar);
        }

        let ident = self.match_ident()?;
        if allow_funcs && self.matches(TokenKind::LParen)?.is_some() {
            let (params, vaargs) = self.parse_funparams()?;
            if ty.is_struct() {
                let at = ident.clone();
                self.nofatal(at.as_ref(), "returning a struct is not supported".to_string())?;
            }
            self.last_funparams = params.clone();
            let params = params.map(|v| v.into_iter().map(|(_, ty)| ty).collect::<Vec<_>>());
            return Ok((Type::Func(Rc::new(FuncType { ret: ty, params, vaargs })), ident));
        }
        let ty = self.parse_type_suffix(ty)?;
        Ok((ty, ident))
    }

    /// Full `storage base *decl` sequence; `None` when no declaration
    /// starts here.
    fn parse_var_def(&mut self) -> R<Option<VarDef>> {
        let Some((raw, storage)) = self.parse_raw_type()? else {
            return Ok(None);
        };
        let ty = self.parse_type_modifier(raw.clone())?;
        let (ty, ident) = self.parse_declarator(ty, true)?;
        Ok(Some(VarDef { raw, ty, storage, ident }))
    }

    /// Parameter list after `(`. `None` marks an old-style empty list.
    fn parse_funparams(&mut self) -> R<(Option<Vec<(Option<Name>, Type)>>, bool)> {
        if self.matches(TokenKind::RParen)?.is_some() {
            return Ok((None, false));
        }
        let mut params = Vec::new();
        let mut vaargs = false;
        loop {
            if self.matches(TokenKind::Ellipsis)?.is_some() {
                if params.is_empty() {
                    let token = self.fetch()?;
                    self.fatal::<()>(Some(&token), "`...' cannot be the first".to_string())?;
                }
                vaargs = true;
                self.consume(TokenKind::RParen, "`)' expected")?;
                break;
            }
            let Some(def) = self.parse_var_def()? else {
                let token = self.fetch()?;
                return self.fatal(Some(&token), "type expected".to_string());
            };
            if def.ty.is_void() && def.ident.is_none() && params.is_empty() {
                // `(void)`
                self.consume(TokenKind::RParen, "`)' expected")?;
                break;
            }
            let mut ty = def.ty;
            if ty.is_array() {
                ty = ty.array_to_ptr();
            } else if ty.is_func() {
                ty = ptrof(&ty);
            } else if ty.is_struct() {
                self.nofatal(
                    def.ident.as_ref(),
                    "passing a struct by value is not supported".to_string(),
                )?;
            } else if ty.is_void() {
                self.nofatal(def.ident.as_ref(), "`void' not allowed".to_string())?;
                ty = Type::INT;
            }
            params.push((def.ident.and_then(|t| t.ident()), ty));
            if self.matches(TokenKind::Comma)?.is_none() {
                self.consume(TokenKind::RParen, "`)' expected")?;
                break;
            }
        }
        Ok((Some(params), vaargs))
    }

    /// Abstract type for casts and `sizeof`: base, `*`s, and suffixes,
    /// no identifier.
    fn parse_full_type(&mut self) -> R<Option<Type>> {
        let Some((raw, _storage)) = self.parse_raw_type()? else {
            return Ok(None);
        };
        let ty = self.parse_type_modifier(raw)?;
        let (ty, ident) = self.parse_declarator(ty, false)?;
        if let Some(ident) = &ident {
            self.nofatal(Some(ident), "Unexpected identifier in type name".to_string())?;
        }
        Ok(Some(ty))
    }

    // ---- declarations ----

    fn parse_declaration(&mut self) -> R<Option<Declaration>> {
        let Some(def) = self.parse_var_def()? else {
            let token = self.fetch()?;
            return self.fatal(Some(&token), "Unexpected token".to_string());
        };

        let Some(ident) = def.ident.clone() else {
            let bare_ok = def.ty.is_struct()
                || matches!(def.ty, Type::Fixnum { kind: FixnumKind::Enum, .. });
            if bare_ok && self.matches(TokenKind::Semicolon)?.is_some() {
                // Just a struct/union/enum definition.
                return Ok(None);
            }
            let token = self.fetch()?;
            return self.fatal(Some(&token), "Ident expected".to_string());
        };

        if def.ty.is_func() {
            if def.storage.is_typedef {
                self.consume(TokenKind::Semicolon, "`;' expected")?;
                self.def_type(&def.ty, &ident)?;
                return Ok(None);
            }
            return self.parse_defun(def, ident);
        }

        self.parse_global_var_decl(def, ident)
    }

    fn def_type(&mut self, ty: &Type, ident: &Token) -> R<()> {
        let name = ident.ident().unwrap();
        if let Some((scope, conflict)) = self.session.find_typedef(self.curscope, name) {
            if scope == self.curscope && !same_type(ty, &conflict) {
                return self.fatal(Some(ident), "Conflict typedef".to_string());
            }
        }
        self.session.add_typedef(self.curscope, name, ty.clone());
        Ok(())
    }

    fn parse_defun(&mut self, def: VarDef, ident: Token) -> R<Option<Declaration>> {
        let name = ident.ident().unwrap();
        let functype = match &def.ty {
            Type::Func(ft) => ft.clone(),
            _ => unreachable!(),
        };

        if self.matches(TokenKind::Semicolon)?.is_some() {
            // Prototype declaration.
            self.declare_function(&ident, def.ty.clone(), def.storage, false)?;
            return Ok(None);
        }

        // Old-style empty parameter list on a definition means zero
        // parameters.
        let functype = if functype.params.is_none() {
            Rc::new(FuncType { ret: functype.ret.clone(), params: Some(Vec::new()), vaargs: false })
        } else {
            functype
        };
        let def_ty = Type::Func(functype.clone());

        self.consume(TokenKind::LBrace, "`;' or `{' expected")?;
        self.declare_function(&ident, def_ty, def.storage, true)?;

        debug!(func = %self.name_str(name), "parsing function body");

        // Scope for parameters.
        debug_assert!(self.curfunc.is_none());
        debug_assert!(self.curscope.is_global());
        let param_scope = self.session.new_scope(GLOBAL_SCOPE);
        self.curscope = param_scope;

        let mut params = Vec::new();
        if let Some(param_list) = self.last_funparams.take() {
            for (pname, pty) in param_list {
                // An unnamed parameter still occupies its argument slot.
                let pname = match pname {
                    Some(name) => name,
                    None => self.session.alloc_label(),
                };
                self.session.add_var(param_scope, pname, pty.clone(), Storage::default());
                params.push((pname, pty));
            }
        }

        self.curfunc = Some(FuncContext {
            name,
            ty: functype.clone(),
            params,
            param_scope,
            scopes: vec![param_scope],
            labels: Vec::new(),
            gotos: Vec::new(),
        });

        let stmts = self.parse_stmts()?;
        self.consume(TokenKind::RBrace, "`}' expected")?;
        self.exit_scope();
        debug_assert!(self.curscope.is_global());

        let ctx = self.curfunc.take().unwrap();

        // Check goto labels.
        for (label, token) in &ctx.gotos {
            if !ctx.labels.contains(label) {
                let token = token.clone();
                let label = *label;
                self.nofatal(Some(&token), format!("`{}' not found", self.name_str(label)))?;
            }
        }

        Ok(Some(Declaration::Defun(Function {
            name: ctx.name,
            ty: ctx.ty,
            params: ctx.params,
            param_scope: ctx.param_scope,
            scopes: ctx.scopes,
            stmts,
            labels: ctx.labels,
            gotos: ctx.gotos,
        })))
    }

    fn declare_function(
        &mut self,
        ident: &Token,
        ty: Type,
        storage: Storage,
        defining: bool,
    ) -> R<()> {
        let name = ident.ident().unwrap();
        match self.session.var_find(GLOBAL_SCOPE, name) {
            None => {
                let index = self.session.add_var(GLOBAL_SCOPE, name, ty, storage);
                if defining {
                    if let VarPlace::Global { func_defined, .. } =
                        &mut self.session.var_mut(GLOBAL_SCOPE, index).place
                    {
                        *func_defined = true;
                    }
                }
            }
            Some(index) => {
                let existing = self.session.var(GLOBAL_SCOPE, index);
                let compatible = match (existing.ty.func_type(), ty.func_type()) {
                    (Some(a), Some(b)) => {
                        same_type(&a.ret, &b.ret)
                            && (a.params.is_none()
                                || b.params.is_none()
                                || a.params == b.params)
                    }
                    _ => false,
                };
                if !compatible {
                    self.nofatal(
                        Some(ident),
                        format!("Definition conflict: `{}'", self.name_str(name)),
                    )?;
                    return Ok(());
                }
                let was_defined = matches!(
                    existing.place,
                    VarPlace::Global { func_defined: true, .. }
                );
                if defining {
                    if was_defined {
                        self.nofatal(
                            Some(ident),
                            format!("`{}' function already defined", self.name_str(name)),
                        )?;
                    } else {
                        let var = self.session.var_mut(GLOBAL_SCOPE, index);
                        var.ty = ty;
                        if let VarPlace::Global { func_defined, .. } = &mut var.place {
                            *func_defined = true;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn parse_global_var_decl(&mut self, def: VarDef, ident: Token) -> R<Option<Declaration>> {
        let raw = def.raw.clone();
        let storage = def.storage;
        let mut ty = def.ty;
        let mut ident = ident;
        let mut names = Vec::new();
        loop {
            if storage.is_typedef {
                self.def_type(&ty, &ident)?;
            } else if ty.is_func() {
                // A prototype in a comma list.
                self.declare_function(&ident, ty.clone(), storage, false)?;
            } else {
                if ty.is_void() {
                    self.fatal::<()>(Some(&ident), "`void' not allowed".to_string())?;
                }
                let index = self.add_var_to_scope(GLOBAL_SCOPE, &ident, ty.clone(), storage)?;

                let mut init = None;
                if self.matches(TokenKind::Assign)?.is_some() {
                    init = Some(self.parse_initializer()?);
                }
                let init = self.check_vardecl(&mut ty, &ident, storage, init)?;
                let var = self.session.var_mut(GLOBAL_SCOPE, index);
                var.ty = ty.clone();
                if init.is_some() {
                    // A bare redeclaration must not wipe an earlier
                    // initializer.
                    if let VarPlace::Global { init: slot, .. } = &mut var.place {
                        *slot = init;
                    }
                }
                names.push(ident.ident().unwrap());
            }

            if self.matches(TokenKind::Comma)?.is_none() {
                break;
            }
            // Next declarator on the same base type.
            let next_ty = self.parse_type_modifier(raw.clone())?;
            let (next_ty, next_ident) = self.parse_declarator(next_ty, true)?;
            ty = next_ty;
            ident = match next_ident {
                Some(t) => t,
                None => {
                    let token = self.fetch()?;
                    return self.fatal(Some(&token), "`ident' expected".to_string());
                }
            };
        }
        self.consume(TokenKind::Semicolon, "`;' or `,' expected")?;
        if names.is_empty() {
            return Ok(None);
        }
        Ok(Some(Declaration::VarDecl(names)))
    }

    /// Array-size fixup, struct completeness, and initializer checking
    /// shared by globals and locals.
    fn check_vardecl(
        &mut self,
        ty: &mut Type,
        ident: &Token,
        storage: Storage,
        init: Option<Initializer>,
    ) -> R<Option<Initializer>> {
        let mut init = init;
        if ty.is_array() {
            if let Some(init_ref) = init.as_ref() {
                *ty = self.fix_array_size(ty.clone(), init_ref)?;
            }
        }
        if !storage.is_extern {
            self.ensure_complete(ty, ident)?;
        }
        if storage.is_extern && init.is_some() {
            self.nofatal(Some(ident), "extern with initializer".to_string())?;
            return Ok(None);
        }

        if self.curfunc.is_some() {
            if storage.is_static {
                // Handled like a global; the shadow global carries it.
                let checked = match init.take() {
                    Some(init) => Some(self.check_global_initializer(ty, init)?),
                    None => None,
                };
                return Ok(checked);
            }
            return Ok(init);
        }

        match init.take() {
            Some(init) => Ok(Some(self.check_global_initializer(ty, init)?)),
            None => Ok(None),
        }
    }

    fn ensure_complete(&mut self, ty: &Type, token: &Token) -> R<()> {
        match ty {
            Type::Struct(sref) => {
                if !sref.completed() {
                    // A forward tag may have been completed in some scope
                    // since this reference was created.
                    if let Some(name) = sref.name {
                        if let Some(found) = self.session.find_struct_tag(self.curscope, name) {
                            if found.completed() && !Rc::ptr_eq(&found.info, &sref.info) {
                                let body = found.info.borrow().clone();
                                *sref.info.borrow_mut() = body;
                            }
                        }
                    }
                }
                if !sref.completed() {
                    self.nofatal(Some(token), "Incomplete struct".to_string())?;
                }
                Ok(())
            }
            Type::Array { elem, len } => {
                if *len < 0 {
                    self.nofatal(Some(token), "Array size undetermined".to_string())?;
                }
                self.ensure_complete(elem, token)
            }
            _ => Ok(()),
        }
    }

    // ---- initializers ----

    fn parse_initializer(&mut self) -> R<Initializer> {
        if let Some(lbrace) = self.matches(TokenKind::LBrace)? {
            let mut multi = Vec::new();
            if self.matches(TokenKind::RBrace)?.is_none() {
                loop {
                    let init;
                    if self.matches(TokenKind::Dot)?.is_some() {
                        let ident =
                            self.consume_ident("`ident' expected for dotted initializer")?;
                        self.consume(TokenKind::Assign, "`=' expected for dotted initializer")?;
                        let value = self.parse_initializer()?;
                        init = Initializer {
                            kind: InitKind::Dot {
                                name: ident.ident().unwrap(),
                                value: Box::new(value),
                            },
                            token: ident,
                        };
                    } else if let Some(lbracket) = self.matches(TokenKind::LBracket)? {
                        let index = self.parse_const()?;
                        self.consume(TokenKind::RBracket, "`]' expected")?;
                        // Both accepted: `[1] = 2` and `[1] 2`.
                        let _ = self.matches(TokenKind::Assign)?;
                        let value = self.parse_initializer()?;
                        init = Initializer {
                            kind: InitKind::Arr { index, value: Box::new(value) },
                            token: lbracket,
                        };
                    } else {
                        init = self.parse_initializer()?;
                    }
                    multi.push(Some(init));

                    if self.matches(TokenKind::Comma)?.is_some() {
                        if self.matches(TokenKind::RBrace)?.is_some() {
                            break;
                        }
                    } else {
                        self.consume(TokenKind::RBrace, "`}' or `,' expected")?;
                        break;
                    }
                }
            }
            Ok(Initializer { kind: InitKind::Multi(multi), token: lbrace })
        } else {
            let single = self.parse_assign()?;
            let token = single.token.clone();
            Ok(Initializer { kind: InitKind::Single(single), token })
        }
    }

    /// Give an unsized array its length from the initializer: the string
    /// size, or the maximum designated index plus one.
    fn fix_array_size(&mut self, ty: Type, init: &Initializer) -> R<Type> {
        let Type::Array { elem, len } = &ty else { return Ok(ty) };

        let str_len = match &init.kind {
            InitKind::Single(expr) if elem.is_char_type() => match &expr.kind {
                ExprKind::Str(bytes) => Some(bytes.len() as isize),
                _ => None,
            },
            _ => None,
        };
        let multi = match &init.kind {
            InitKind::Multi(items) => Some(items),
            _ => None,
        };
        if str_len.is_none() && multi.is_none() {
            // The error is reported when the value is assigned.
            return Ok(ty);
        }

        if *len == ARRAY_LEN_UNSIZED {
            let new_len = if let Some(n) = str_len {
                n
            } else {
                let mut index: i64 = 0;
                let mut max_index: i64 = 0;
                for item in multi.unwrap().iter().flatten() {
                    if let InitKind::Arr { index: designated, .. } = &item.kind {
                        index = *designated;
                    }
                    index += 1;
                    max_index = max_index.max(index);
                }
                max_index as isize
            };
            Ok(Type::Array { elem: elem.clone(), len: new_len })
        } else {
            let init_len = str_len.unwrap_or_else(|| multi.unwrap().len() as isize);
            let is_str = str_len.is_some();
            if init_len > *len && (!is_str || init_len - 1 > *len) {
                // A string may exactly drop its terminating NUL.
                self.fatal::<()>(
                    Some(&init.token),
                    "Initializer more than array size".to_string(),
                )?;
            }
            Ok(ty)
        }
    }

    /// Member path to `name`, descending into anonymous struct members.
    fn search_from_anonymous(sref: &StructRef, name: Name) -> Option<Vec<usize>> {
        let info = sref.info.borrow();
        let info = info.as_ref()?;
        for (i, member) in info.members.iter().enumerate() {
            if member.name == Some(name) {
                return Some(vec![i]);
            }
            if member.name.is_none() {
                if let Type::Struct(inner) = &member.ty {
                    if let Some(mut path) = Self::search_from_anonymous(inner, name) {
                        path.insert(0, i);
                        return Some(path);
                    }
                }
            }
        }
        None
    }

    fn flatten_array_initializer(&mut self, init: Initializer) -> R<Initializer> {
        let token = init.token.clone();
        let items = match init.kind {
            InitKind::Multi(items) => items,
            kind => return Ok(Initializer { kind, token }),
        };
        let items: Vec<Initializer> = items.into_iter().flatten().collect();

        for item in &items {
            if matches!(item.kind, InitKind::Dot { .. }) {
                return self.fatal(Some(&item.token), "dot initializer for array".to_string());
            }
        }
        if !items.iter().any(|i| matches!(i.kind, InitKind::Arr { .. })) {
            let items = items.into_iter().map(Some).collect();
            return Ok(Initializer { kind: InitKind::Multi(items), token });
        }

        // Split into runs headed by a designator:
        // (logical start, first source index, count).
        let mut ranges: Vec<(i64, usize, usize)> = Vec::new();
        let mut run_start_logical: i64 = 0;
        let mut run_start_source: usize = 0;
        for (i, item) in items.iter().enumerate() {
            if let InitKind::Arr { index, .. } = &item.kind {
                if i > run_start_source {
                    ranges.push((run_start_logical, run_start_source, i - run_start_source));
                }
                run_start_logical = *index;
                run_start_source = i;
            }
        }
        if items.len() > run_start_source {
            ranges.push((run_start_logical, run_start_source, items.len() - run_start_source));
        }

        ranges.sort_by_key(|r| r.0);
        for window in ranges.windows(2) {
            let (prev_start, _, prev_count) = window[0];
            let (start, _, _) = window[1];
            if start < prev_start + prev_count as i64 {
                return self.fatal(
                    Some(&token),
                    "Initializer for array overlapped".to_string(),
                );
            }
        }

        let mut reordered: Vec<Option<Initializer>> = Vec::new();
        for (start, source, count) in ranges {
            for j in 0..count {
                let mut elem = items[source + j].clone();
                if j == 0 && !matches!(elem.kind, InitKind::Arr { .. }) {
                    // A displaced run keeps its position via an explicit
                    // designator on its first element.
                    let elem_token = elem.token.clone();
                    elem = Initializer {
                        kind: InitKind::Arr { index: start, value: Box::new(elem) },
                        token: elem_token,
                    };
                }
                reordered.push(Some(elem));
            }
        }
        Ok(Initializer { kind: InitKind::Multi(reordered), token })
    }

    /// Canonicalize: structs become positional (member-count slots with
    /// holes); arrays get designated runs sorted and checked.
    fn flatten_initializer(&mut self, ty: &Type, init: Initializer) -> R<Initializer> {
        match ty {
            Type::Struct(sref) => {
                let token = init.token.clone();
                let items = match init.kind {
                    InitKind::Multi(items) => items,
                    kind => return Ok(Initializer { kind, token }),
                };
                let (member_count, is_union) = {
                    let info = sref.info.borrow();
                    match info.as_ref() {
                        Some(info) => (info.members.len(), info.is_union),
                        None => (0, false),
                    }
                };
                let items: Vec<Initializer> = items.into_iter().flatten().collect();
                if member_count == 0 {
                    if !items.is_empty() {
                        self.nofatal(Some(&token), "Initializer for empty struct".to_string())?;
                    }
                    return Ok(Initializer { kind: InitKind::Multi(Vec::new()), token });
                }
                if is_union && items.len() > 1 {
                    return self.fatal(
                        Some(&items[1].token),
                        "Initializer for union more than 1".to_string(),
                    );
                }

                let mut values: Vec<Option<Initializer>> = vec![None; member_count];
                let mut index = 0usize;
                for item in items {
                    let mut value = item;
                    if matches!(value.kind, InitKind::Arr { .. }) {
                        return self.fatal(
                            Some(&value.token),
                            "indexed initializer for struct".to_string(),
                        );
                    }
                    if let InitKind::Dot { name, value: dotted } = value.kind {
                        let dot_token = value.token.clone();
                        let direct = sref
                            .info
                            .borrow()
                            .as_ref()
                            .and_then(|info| info.find_member(name));
                        match direct {
                            Some(found) => {
                                index = found;
                                value = *dotted;
                            }
                            None => match Self::search_from_anonymous(sref, name) {
                                Some(path) => {
                                    index = path[0];
                                    // Re-wrap so the anonymous member's own
                                    // flattening resolves the remaining path.
                                    value = Initializer {
                                        kind: InitKind::Multi(vec![Some(Initializer {
                                            kind: InitKind::Dot { name, value: dotted },
                                            token: dot_token.clone(),
                                        })]),
                                        token: dot_token,
                                    };
                                }
                                None => {
                                    self.nofatal(
                                        Some(&dot_token),
                                        format!(
                                            "`{}' is not member of struct",
                                            self.name_str(name)
                                        ),
                                    )?;
                                    continue;
                                }
                            },
                        }
                    }
                    if index >= member_count {
                        return self.fatal(
                            Some(&value.token),
                            "Too many init values".to_string(),
                        );
                    }

                    // A string literal for a char* member becomes a pointer
                    // to a hidden char array.
                    let member_ty = sref.info.borrow().as_ref().unwrap().members[index].ty.clone();
                    if let InitKind::Single(expr) = &value.kind {
                        if let ExprKind::Str(_) = &expr.kind {
                            if member_ty.is_ptr()
                                && member_ty.pointee().is_some_and(|p| p.is_char_type())
                            {
                                value = self.string_to_pointer_initializer(value)?;
                            }
                        }
                    }

                    values[index] = Some(value);
                    index += 1;
                }
                Ok(Initializer { kind: InitKind::Multi(values), token })
            }
            Type::Array { .. } => match init.kind {
                InitKind::Multi(_) => self.flatten_array_initializer(init),
                _ => Ok(init),
            },
            Type::Ptr(_) => {
                let peeled = match &init.kind {
                    InitKind::Arr { value, .. } => value.as_ref(),
                    _ => &init,
                };
                match &peeled.kind {
                    InitKind::Single(expr) => {
                        if !can_cast(ty, &expr.ty, expr.is_zero(), false) {
                            self.nofatal(
                                Some(&init.token),
                                "Initializer type error".to_string(),
                            )?;
                        }
                        Ok(init)
                    }
                    _ => {
                        self.nofatal(Some(&init.token), "Initializer type error".to_string())?;
                        Ok(init)
                    }
                }
            }
            _ => Ok(init),
        }
    }

    /// Replace a string-literal initializer with a reference to a hidden
    /// global char array holding the bytes.
    fn string_to_pointer_initializer(&mut self, init: Initializer) -> R<Initializer> {
        let InitKind::Single(expr) = &init.kind else { return Ok(init) };
        let ExprKind::Str(bytes) = &expr.kind else { return Ok(init) };
        let token = init.token.clone();
        let name = self.define_string_global(bytes.clone(), &token);
        let arr_ty = Type::Array { elem: Box::new(Type::CHAR), len: bytes.len() as isize };
        let var = Expr::new(ExprKind::Var { name, scope: GLOBAL_SCOPE }, arr_ty, token.clone());
        Ok(Initializer { kind: InitKind::Single(var), token })
    }

    /// Hidden static global char array for a string literal.
    fn define_string_global(&mut self, bytes: Rc<Vec<u8>>, token: &Token) -> Name {
        let label = self.session.alloc_label();
        let arr_ty = Type::Array { elem: Box::new(Type::CHAR), len: bytes.len() as isize };
        let storage = Storage { is_static: true, ..Storage::default() };
        let index = self.session.add_var(GLOBAL_SCOPE, label, arr_ty.clone(), storage);
        self.session.var_mut(GLOBAL_SCOPE, index).literal = true;
        let init = Initializer {
            kind: InitKind::Single(Expr::new(ExprKind::Str(bytes), arr_ty, token.clone())),
            token: token.clone(),
        };
        if let VarPlace::Global { init: slot, .. } =
            &mut self.session.var_mut(GLOBAL_SCOPE, index).place
        {
            *slot = Some(init);
        }
        label
    }

    /// Convert a bare string-literal expression into a reference to its
    /// hidden global array.
    fn str_to_char_array_var(&mut self, expr: Expr) -> R<Expr> {
        let ExprKind::Str(bytes) = &expr.kind else { return Ok(expr) };
        let token = expr.token.clone();
        let name = self.define_string_global(bytes.clone(), &token);
        let ty = expr.ty.clone();
        Ok(Expr::new(ExprKind::Var { name, scope: GLOBAL_SCOPE }, ty, token))
    }

    /// Constant-expression analysis for global scalar initializers.
    /// Returns the (possibly rewritten) value and whether it is constant.
    fn check_global_initializer_scalar(&mut self, value: Expr) -> R<(Expr, bool)> {
        match &value.kind {
            ExprKind::Fixnum(_) | ExprKind::Flonum(_) => Ok((value, true)),
            ExprKind::Str(_) => {
                // Create the string and point at it.
                let var = self.str_to_char_array_var(value)?;
                Ok((var, true))
            }
            ExprKind::Var { name, scope } => {
                let found = self.session.scope_find(*scope, *name);
                let is_const = match found {
                    Some((scope, index)) => {
                        let var = self.session.var(scope, index);
                        if !scope.is_global() && !var.storage.is_static {
                            self.fatal::<()>(
                                Some(&value.token),
                                "Allowed global reference only".to_string(),
                            )?;
                        }
                        value.ty.is_array()
                            || value.ty.is_func()
                            || value.ty.pointee().is_some_and(|p| p.is_func())
                    }
                    None => false,
                };
                Ok((value, is_const))
            }
            ExprKind::Bop { op: BinOp::Add | BinOp::Sub, .. } => {
                let Expr { kind: ExprKind::Bop { op, lhs, rhs }, ty, token } = value else {
                    unreachable!()
                };
                let (lhs, lconst) = self.check_global_initializer_scalar(*lhs)?;
                let (rhs, rconst) = self.check_global_initializer_scalar(*rhs)?;
                let rebuilt = Expr::new(
                    ExprKind::Bop { op, lhs: Box::new(lhs), rhs: Box::new(rhs) },
                    ty,
                    token,
                );
                Ok((rebuilt, lconst && rconst))
            }
            ExprKind::Unary { op: UnOp::Ref, .. } => {
                let Expr { kind: ExprKind::Unary { op, sub }, ty, token } = value else {
                    unreachable!()
                };
                let (sub, _) = self.check_global_initializer_scalar(*sub)?;
                Ok((Expr::new(ExprKind::Unary { op, sub: Box::new(sub) }, ty, token), true))
            }
            ExprKind::Unary { op: UnOp::Deref | UnOp::Cast, .. } => {
                let Expr { kind: ExprKind::Unary { op, sub }, ty, token } = value else {
                    unreachable!()
                };
                let (sub, is_const) = self.check_global_initializer_scalar(*sub)?;
                Ok((Expr::new(ExprKind::Unary { op, sub: Box::new(sub) }, ty, token), is_const))
            }
            ExprKind::Member { .. } => {
                let Expr { kind: ExprKind::Member { target, index }, ty, token } = value else {
                    unreachable!()
                };
                let (target, _) = self.check_global_initializer_scalar(*target)?;
                let is_const = ty.is_array();
                let rebuilt =
                    Expr::new(ExprKind::Member { target: Box::new(target), index }, ty, token);
                Ok((rebuilt, is_const))
            }
            _ => Ok((value, false)),
        }
    }

    /// Validate and canonicalize a global (or static local) initializer:
    /// everything must reduce to compile-time constants.
    fn check_global_initializer(&mut self, ty: &Type, init: Initializer) -> R<Initializer> {
        let init = self.flatten_initializer(ty, init)?;
        match ty {
            Type::Flonum(_) => {
                if let InitKind::Single(expr) = &init.kind {
                    match &expr.kind {
                        ExprKind::Fixnum(v) => {
                            let token = init.token.clone();
                            let value = Expr::new(
                                ExprKind::Flonum(*v as f64),
                                ty.clone(),
                                expr.token.clone(),
                            );
                            return Ok(Initializer { kind: InitKind::Single(value), token });
                        }
                        ExprKind::Flonum(_) => return Ok(init),
                        _ => {}
                    }
                }
                self.nofatal(Some(&init.token), "Constant expression expected".to_string())?;
                Ok(init)
            }
            Type::Fixnum { .. } | Type::Ptr(_) => {
                let token = init.token.clone();
                let expr = match init.kind {
                    InitKind::Single(expr) => expr,
                    kind => {
                        self.nofatal(Some(&token), "Initializer type error".to_string())?;
                        return Ok(Initializer { kind, token });
                    }
                };
                let expr_token = expr.token.clone();
                let (value, is_const) = self.check_global_initializer_scalar(expr)?;
                let value = self.make_cast(ty.clone(), &expr_token, value, false)?;
                if !is_const && value.as_fixnum().is_none() {
                    self.nofatal(Some(&expr_token), "Initializer must be constant".to_string())?;
                }
                Ok(Initializer { kind: InitKind::Single(value), token })
            }
            Type::Array { elem, .. } => match init.kind {
                InitKind::Multi(items) => {
                    let token = init.token;
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        match item {
                            Some(Initializer { kind: InitKind::Arr { index, value }, token }) => {
                                let value = self.check_global_initializer(elem, *value)?;
                                out.push(Some(Initializer {
                                    kind: InitKind::Arr { index, value: Box::new(value) },
                                    token,
                                }));
                            }
                            Some(item) => {
                                out.push(Some(self.check_global_initializer(elem, item)?));
                            }
                            None => out.push(None),
                        }
                    }
                    Ok(Initializer { kind: InitKind::Multi(out), token })
                }
                InitKind::Single(ref expr) if elem.is_char_type() => {
                    if let ExprKind::Str(bytes) = &expr.kind {
                        if let Type::Array { len, .. } = ty {
                            if bytes.len() as isize - 1 > *len {
                                self.nofatal(
                                    Some(&init.token),
                                    "Array size shorter than initializer".to_string(),
                                )?;
                            }
                        }
                        return Ok(init);
                    }
                    self.nofatal(Some(&init.token), "Array initializer requires `{'".to_string())?;
                    Ok(init)
                }
                _ => {
                    self.nofatal(Some(&init.token), "Array initializer requires `{'".to_string())?;
                    Ok(init)
                }
            },
            Type::Struct(sref) => {
                let token = init.token.clone();
                let init = match init.kind {
                    InitKind::Single(expr) => {
                        // A constant compound literal can initialize a
                        // global struct; its hidden variable already
                        // carries the braced form.
                        let mut inner = None;
                        if let ExprKind::Complit { var, .. } = &expr.kind {
                            if can_cast(ty, &expr.ty, false, false) {
                                if let ExprKind::Var { name, .. } = var.kind {
                                    if let Some((scope, index)) =
                                        self.session.scope_find(GLOBAL_SCOPE, name)
                                    {
                                        inner = self
                                            .session
                                            .var(scope, index)
                                            .global_init()
                                            .cloned();
                                    }
                                }
                            }
                        }
                        match inner {
                            Some(inner) => return self.check_global_initializer(ty, inner),
                            None => {
                                self.nofatal(
                                    Some(&token),
                                    "Struct initializer requires `{'".to_string(),
                                )?;
                                return Ok(Initializer { kind: InitKind::Single(expr), token });
                            }
                        }
                    }
                    kind => Initializer { kind, token: token.clone() },
                };
                let items = match init.kind {
                    InitKind::Multi(items) => items,
                    kind => return Ok(Initializer { kind, token }),
                };
                let member_types: Vec<Type> = sref
                    .info
                    .borrow()
                    .as_ref()
                    .map(|info| info.members.iter().map(|m| m.ty.clone()).collect())
                    .unwrap_or_default();
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.into_iter().enumerate() {
                    match item {
                        Some(item) if i < member_types.len() => {
                            out.push(Some(self.check_global_initializer(&member_types[i], item)?));
                        }
                        other => out.push(other),
                    }
                }
                Ok(Initializer { kind: InitKind::Multi(out), token })
            }
            _ => {
                self.nofatal(
                    Some(&init.token),
                    format!("Global initial value for type {} not implemented", ty.describe()),
                )?;
                Ok(init)
            }
        }
    }

    /// Expand a local initializer into assignment statements.
    fn assign_initial_value(
        &mut self,
        expr: Expr,
        init: Initializer,
        inits: &mut Vec<Stmt>,
    ) -> R<()> {
        let org_multi_len = match &init.kind {
            InitKind::Multi(items) => items.len(),
            _ => 0,
        };
        let init = self.flatten_initializer(&expr.ty, init)?;

        match expr.ty.clone() {
            Type::Array { elem, len } => match init.kind {
                InitKind::Multi(items) => {
                    debug_assert!(len > 0);
                    let items: Vec<Initializer> = items.into_iter().flatten().collect();
                    if items.len() as isize > len {
                        return self.fatal(
                            Some(&init.token),
                            "Initializer more than array size".to_string(),
                        );
                    }

                    // Elements the initializer skips must read as zero.
                    let has_holes = (items.len() as isize) < len
                        || items.iter().any(|i| matches!(i.kind, InitKind::Arr { .. }));
                    if has_holes {
                        inits.push(Stmt::Clear(expr.clone()));
                    }

                    // Walk a cursor pointer over the elements.
                    let ptr_ty = expr.ty.array_to_ptr();
                    let token = init.token.clone();
                    let ptr_var = self.add_hidden_local(ptr_ty.clone(), &token)?;
                    inits.push(Stmt::Expr(self.new_assign_raw(
                        ptr_var.clone(),
                        expr.clone(),
                        &token,
                    )?));

                    // The cursor sits on the element assigned last; before
                    // each store it advances by the index delta.
                    let elem_size = elem.size() as i64;
                    let mut prev_index: i64 = 0;
                    let mut index: i64 = 0;
                    for item in items {
                        let mut item = item;
                        if let InitKind::Arr { index: designated, value } = item.kind {
                            index = designated;
                            item = *value;
                        }
                        let advance = index - prev_index;
                        if advance > 0 {
                            let amount = Expr::new(
                                ExprKind::Fixnum(advance * elem_size),
                                Type::SIZE_T,
                                token.clone(),
                            );
                            let add = Expr::new(
                                ExprKind::Bop {
                                    op: BinOp::Add,
                                    lhs: Box::new(ptr_var.clone()),
                                    rhs: Box::new(amount),
                                },
                                ptr_ty.clone(),
                                token.clone(),
                            );
                            inits.push(Stmt::Expr(Expr::new(
                                ExprKind::Unary { op: UnOp::Modify, sub: Box::new(add) },
                                ptr_ty.clone(),
                                token.clone(),
                            )));
                        }
                        let deref = Expr::new(
                            ExprKind::Unary { op: UnOp::Deref, sub: Box::new(ptr_var.clone()) },
                            (*elem).clone(),
                            token.clone(),
                        );
                        self.assign_initial_value(deref, item, inits)?;
                        prev_index = index;
                        index += 1;
                    }
                    Ok(())
                }
                InitKind::Single(single) if elem.is_char_type() => {
                    if let ExprKind::Str(_) = &single.kind {
                        let token = single.token.clone();
                        let init = Initializer {
                            kind: InitKind::Single(single),
                            token: token.clone(),
                        };
                        let stmt = self.init_char_array_by_string(expr, init)?;
                        inits.push(stmt);
                        return Ok(());
                    }
                    self.nofatal(
                        Some(&single.token),
                        "Array initializer requires `{'".to_string(),
                    )
                }
                _ => self.nofatal(
                    Some(&init.token),
                    "Array initializer requires `{'".to_string(),
                ),
            },
            Type::Struct(sref) => {
                if let InitKind::Single(e) = &init.kind {
                    if can_cast(&expr.ty, &e.ty, false, false) {
                        let token = init.token.clone();
                        let InitKind::Single(e) = init.kind else { unreachable!() };
                        let assign = self.new_assign_raw(expr, e, &token)?;
                        inits.push(Stmt::Expr(assign));
                        return Ok(());
                    }
                }
                let InitKind::Multi(items) = init.kind else {
                    return self.nofatal(
                        Some(&init.token),
                        "Struct initializer requires `{'".to_string(),
                    );
                };
                let (member_types, is_union): (Vec<Type>, bool) = {
                    let info = sref.info.borrow();
                    match info.as_ref() {
                        Some(info) => (
                            info.members.iter().map(|m| m.ty.clone()).collect(),
                            info.is_union,
                        ),
                        None => (Vec::new(), false),
                    }
                };
                if is_union && org_multi_len > 1 {
                    return self.fatal(
                        Some(&init.token),
                        "More than one initializer for union".to_string(),
                    );
                }
                if items.iter().any(|i| i.is_none()) {
                    // Omitted members must read as zero.
                    inits.push(Stmt::Clear(expr.clone()));
                }
                for (i, item) in items.into_iter().enumerate() {
                    let Some(item) = item else { continue };
                    let member = Expr::new(
                        ExprKind::Member { target: Box::new(expr.clone()), index: i },
                        member_types[i].clone(),
                        expr.token.clone(),
                    );
                    self.assign_initial_value(member, item, inits)?;
                    if is_union {
                        break;
                    }
                }
                Ok(())
            }
            _ => {
                let init = match init.kind {
                    InitKind::Multi(mut items) => {
                        if items.len() != 1
                            || !matches!(
                                items[0].as_ref().map(|i| &i.kind),
                                Some(InitKind::Single(_))
                            )
                        {
                            return self.nofatal(
                                Some(&init.token),
                                "Requires scalar".to_string(),
                            );
                        }
                        items.remove(0).unwrap()
                    }
                    kind => Initializer { kind, token: init.token },
                };
                let InitKind::Single(value) = init.kind else {
                    return self.fatal(Some(&init.token), "Error initializer".to_string());
                };
                let token = value.token.clone();
                let value = self.str_to_char_array_var(value)?;
                let value = self.make_cast(expr.ty.clone(), &token, value, false)?;
                let assign = self.new_assign_raw(expr, value, &token)?;
                inits.push(Stmt::Expr(assign));
                Ok(())
            }
        }
    }

    /// `char s[N] = "...";` copies the bytes element by element from the
    /// hidden global, never past the bound (the NUL may be dropped
    /// exactly).
    fn init_char_array_by_string(&mut self, dst: Expr, src: Initializer) -> R<Stmt> {
        let InitKind::Single(str_expr) = &src.kind else { unreachable!() };
        let ExprKind::Str(bytes) = &str_expr.kind else { unreachable!() };
        let token = src.token.clone();

        let size = bytes.len() as i64;
        let Type::Array { len: dst_len, .. } = &dst.ty else { unreachable!() };
        let copy_len = size.min(*dst_len as i64);
        if (*dst_len as i64) < size - 1 {
            self.nofatal(
                Some(&token),
                format!("Buffer is shorter than string: {} for {}", dst_len, size),
            )?;
        }

        let dst_len = *dst_len as i64;
        let InitKind::Single(str_expr) = src.kind else { unreachable!() };
        let src_var = self.str_to_char_array_var(str_expr)?;
        let copy = self.build_copy_loop(dst.clone(), src_var, copy_len, &token)?;
        if copy_len < dst_len {
            // Zero the tail beyond the string bytes.
            return Ok(Stmt::Block { scope: None, stmts: vec![Stmt::Clear(dst), copy] });
        }
        Ok(copy)
    }

    /// `for (n = size; n > 0; --n) *d++ = *s++;` over hidden locals.
    fn build_copy_loop(&mut self, dst: Expr, src: Expr, size: i64, token: &Token) -> R<Stmt> {
        let charptr = ptrof(&Type::CHAR);
        let dst_var = self.add_hidden_local(charptr.clone(), token)?;
        let src_var = self.add_hidden_local(charptr.clone(), token)?;
        let size_var = self.add_hidden_local(Type::SIZE_T, token)?;

        let mut stmts = Vec::new();
        stmts.push(Stmt::Expr(self.new_assign_raw(dst_var.clone(), dst, token)?));
        stmts.push(Stmt::Expr(self.new_assign_raw(src_var.clone(), src, token)?));

        let size_lit = Expr::new(ExprKind::Fixnum(size), Type::SIZE_T, token.clone());
        let zero = Expr::new(ExprKind::Fixnum(0), Type::SIZE_T, token.clone());
        let pre = self.new_assign_raw(size_var.clone(), size_lit, token)?;
        let cond = Expr::new(
            ExprKind::Bop {
                op: BinOp::Gt,
                lhs: Box::new(size_var.clone()),
                rhs: Box::new(zero),
            },
            Type::INT,
            token.clone(),
        );
        let post = Expr::new(
            ExprKind::Unary { op: UnOp::PreDec, sub: Box::new(size_var) },
            Type::SIZE_T,
            token.clone(),
        );
        let deref = |e: Expr, token: &Token| {
            Expr::new(
                ExprKind::Unary {
                    op: UnOp::Deref,
                    sub: Box::new(Expr::new(
                        ExprKind::Unary { op: UnOp::PostInc, sub: Box::new(e) },
                        charptr.clone(),
                        token.clone(),
                    )),
                },
                Type::CHAR,
                token.clone(),
            )
        };
        let body = Stmt::Expr(Expr::new(
            ExprKind::Bop {
                op: BinOp::Assign,
                lhs: Box::new(deref(dst_var, token)),
                rhs: Box::new(deref(src_var, token)),
            },
            Type::CHAR,
            token.clone(),
        ));
        stmts.push(Stmt::For {
            pre: Some(pre),
            cond: Some(cond),
            post: Some(post),
            body: Box::new(body),
        });
        Ok(Stmt::Block { scope: None, stmts })
    }

    /// A compiler-introduced local in the current scope.
    fn add_hidden_local(&mut self, ty: Type, token: &Token) -> R<Expr> {
        debug_assert!(!self.curscope.is_global());
        let name = self.session.alloc_label();
        self.session.add_var(self.curscope, name, ty.clone(), Storage::default());
        Ok(Expr::new(
            ExprKind::Var { name, scope: self.curscope },
            ty,
            token.clone(),
        ))
    }

    /// Assignment without lvalue re-checking (internal construction).
    fn new_assign_raw(&mut self, lhs: Expr, rhs: Expr, token: &Token) -> R<Expr> {
        let ty = lhs.ty.clone();
        let rhs = self.make_cast(ty.clone(), token, rhs, false)?;
        Ok(Expr::new(
            ExprKind::Bop { op: BinOp::Assign, lhs: Box::new(lhs), rhs: Box::new(rhs) },
            ty,
            token.clone(),
        ))
    }

    // ---- statements ----

    /// Block-scope declaration attempt. `None`: not a declaration.
    fn parse_vardecl(&mut self) -> R<Option<Option<Stmt>>> {
        let Some(def) = self.parse_var_def()? else { return Ok(None) };

        let Some(ident) = def.ident.clone() else {
            let bare_ok = def.ty.is_struct()
                || matches!(def.ty, Type::Fixnum { kind: FixnumKind::Enum, .. });
            if bare_ok && self.matches(TokenKind::Semicolon)?.is_some() {
                return Ok(Some(None));
            }
            let token = self.fetch()?;
            return self.fatal(Some(&token), "Ident expected".to_string());
        };

        let stmt = self.parse_vardecl_cont(def, ident)?;
        self.consume(TokenKind::Semicolon, "`;' expected")?;
        Ok(Some(stmt))
    }

    fn parse_vardecl_cont(&mut self, def: VarDef, ident: Token) -> R<Option<Stmt>> {
        let raw = def.raw.clone();
        let base_storage = def.storage;
        let mut ty = def.ty;
        let mut ident = ident;
        let mut inits: Vec<Stmt> = Vec::new();
        let mut first = true;
        loop {
            if !first {
                let next_ty = self.parse_type_modifier(raw.clone())?;
                let (next_ty, next_ident) = self.parse_declarator(next_ty, true)?;
                ty = next_ty;
                ident = match next_ident {
                    Some(t) => t,
                    None => {
                        let token = self.fetch()?;
                        return self.fatal(Some(&token), "`ident' expected".to_string());
                    }
                };
            }
            first = false;

            let mut storage = base_storage;
            if ty.is_func() {
                // Local prototype; it registers the global symbol.
                storage.is_extern = true;
                self.declare_function(&ident, ty.clone(), storage, false)?;
                if self.matches(TokenKind::Comma)?.is_none() {
                    break;
                }
                continue;
            }
            if !storage.is_extern && ty.is_void() {
                self.fatal::<()>(Some(&ident), "`void' not allowed".to_string())?;
            }

            if storage.is_typedef {
                self.def_type(&ty, &ident)?;
                if self.matches(TokenKind::Comma)?.is_none() {
                    break;
                }
                continue;
            }

            let index = self.add_var_to_scope(self.curscope, &ident, ty.clone(), storage)?;

            let mut init = None;
            if self.matches(TokenKind::Assign)?.is_some() {
                init = Some(self.parse_initializer()?);
            }
            let init = self.check_vardecl(&mut ty, &ident, storage, init)?;
            self.session.var_mut(self.curscope, index).ty = ty.clone();

            if storage.is_static {
                // The shadow global carries data and initializer.
                let label = match &self.session.var(self.curscope, index).place {
                    VarPlace::Local { static_gvar: Some(label) } => Some(*label),
                    _ => None,
                };
                if let Some(label) = label {
                    if let Some((gscope, gindex)) = self.session.scope_find(GLOBAL_SCOPE, label) {
                        let var = self.session.var_mut(gscope, gindex);
                        var.ty = ty.clone();
                        if let VarPlace::Global { init: slot, .. } = &mut var.place {
                            *slot = init;
                        }
                    }
                }
            } else if let Some(init) = init {
                let name = ident.ident().unwrap();
                let var_expr = Expr::new(
                    ExprKind::Var { name, scope: self.curscope },
                    ty.clone(),
                    ident.clone(),
                );
                self.assign_initial_value(var_expr, init, &mut inits)?;
            }

            if self.matches(TokenKind::Comma)?.is_none() {
                break;
            }
        }
        Ok(Some(Stmt::VarDecl { inits }))
    }

    fn parse_stmts(&mut self) -> R<Vec<Stmt>> {
        let mut stmts = Vec::new();
        loop {
            if let Some(decl) = self.parse_vardecl()? {
                if let Some(stmt) = decl {
                    stmts.push(stmt);
                }
                continue;
            }
            if let Some(tok) = self.matches(TokenKind::Case)? {
                stmts.push(self.parse_case(&tok)?);
                continue;
            }
            if let Some(tok) = self.matches(TokenKind::Default)? {
                stmts.push(self.parse_default(&tok)?);
                continue;
            }
            match self.parse_stmt()? {
                Some(stmt) => stmts.push(stmt),
                None => return Ok(stmts),
            }
        }
    }

    fn parse_block(&mut self) -> R<Stmt> {
        let scope = self.enter_scope();
        let stmts = self.parse_stmts()?;
        self.consume(TokenKind::RBrace, "`}' expected")?;
        self.exit_scope();
        Ok(Stmt::Block { scope: Some(scope), stmts })
    }

    fn parse_stmt(&mut self) -> R<Option<Stmt>> {
        let token = self.fetch()?;
        match token.kind {
            TokenKind::RBrace | TokenKind::Eof => {
                self.unget(token);
                return Ok(None);
            }
            TokenKind::Ident(name) => {
                if self.matches(TokenKind::Colon)?.is_some() {
                    return Ok(Some(self.parse_label(name, &token)?));
                }
            }
            TokenKind::Semicolon => return Ok(Some(Stmt::Block { scope: None, stmts: vec![] })),
            TokenKind::LBrace => return Ok(Some(self.parse_block()?)),
            TokenKind::If => return Ok(Some(self.parse_if()?)),
            TokenKind::Switch => return Ok(Some(self.parse_switch()?)),
            TokenKind::While => return Ok(Some(self.parse_while()?)),
            TokenKind::Do => return Ok(Some(self.parse_do_while()?)),
            TokenKind::For => return Ok(Some(self.parse_for()?)),
            TokenKind::Break | TokenKind::Continue => {
                let is_break = token.kind == TokenKind::Break;
                self.consume(TokenKind::Semicolon, "`;' expected")?;
                let allowed = if is_break { self.break_ok > 0 } else { self.continue_ok > 0 };
                if !allowed {
                    let what = if is_break { "break" } else { "continue" };
                    self.nofatal(
                        Some(&token),
                        format!("`{}' cannot be used outside of loop", what),
                    )?;
                }
                return Ok(Some(if is_break { Stmt::Break } else { Stmt::Continue }));
            }
            TokenKind::Goto => return Ok(Some(self.parse_goto()?)),
            TokenKind::Return => return Ok(Some(self.parse_return(&token)?)),
            TokenKind::Asm => return Ok(Some(self.parse_asm()?)),
            _ => {}
        }

        self.unget(token);
        let value = self.parse_expr()?;
        self.consume(TokenKind::Semicolon, "`;' expected")?;
        let value = self.str_to_char_array_var(value)?;
        Ok(Some(Stmt::Expr(value)))
    }

    fn parse_label(&mut self, name: Name, token: &Token) -> R<Stmt> {
        if let Some(func) = self.curfunc.as_mut() {
            if func.labels.contains(&name) {
                let token = token.clone();
                self.nofatal(
                    Some(&token),
                    format!("Label `{}' already defined", self.name_str(name)),
                )?;
            } else {
                func.labels.push(name);
            }
        }
        let stmt = match self.parse_stmt()? {
            Some(stmt) => stmt,
            None => Stmt::Block { scope: None, stmts: vec![] },
        };
        Ok(Stmt::Label { name, stmt: Box::new(stmt) })
    }

    fn parse_if(&mut self) -> R<Stmt> {
        self.consume(TokenKind::LParen, "`(' expected")?;
        let cond = self.parse_expr()?;
        let cond = self.make_cond(cond)?;
        self.consume(TokenKind::RParen, "`)' expected")?;
        let then_stmt = self.parse_stmt_required()?;
        let else_stmt = if self.matches(TokenKind::Else)?.is_some() {
            Some(Box::new(self.parse_stmt_required()?))
        } else {
            None
        };
        Ok(Stmt::If { cond, then_stmt: Box::new(then_stmt), else_stmt })
    }

    fn parse_stmt_required(&mut self) -> R<Stmt> {
        match self.parse_stmt()? {
            Some(stmt) => Ok(stmt),
            None => {
                let token = self.fetch()?;
                self.fatal(Some(&token), "statement expected".to_string())
            }
        }
    }

    fn parse_switch(&mut self) -> R<Stmt> {
        self.consume(TokenKind::LParen, "`(' expected")?;
        let value = self.parse_expr()?;
        if value.ty.is_void() {
            let token = value.token.clone();
            self.nofatal(Some(&token), "Cannot use `void' as a value".to_string())?;
        }
        self.consume(TokenKind::RParen, "`)' expected")?;

        self.switch_stack.push(Vec::new());
        self.break_ok += 1;
        let body = self.parse_stmt_required();
        self.break_ok -= 1;
        let cases = self.switch_stack.pop().unwrap();
        let body = body?;

        Ok(Stmt::Switch { value, body: Box::new(body), cases })
    }

    fn parse_case(&mut self, token: &Token) -> R<Stmt> {
        let value = self.parse_const()?;
        self.consume(TokenKind::Colon, "`:' expected")?;
        match self.switch_stack.last_mut() {
            None => {
                self.fatal(Some(token), "`case' cannot use outside of `switch`".to_string())
            }
            Some(cases) => {
                if cases.iter().any(|c| c.value == Some(value)) {
                    let token = token.clone();
                    self.nofatal(
                        Some(&token),
                        format!("Case value `{}' already defined", value),
                    )?;
                }
                let cases = self.switch_stack.last_mut().unwrap();
                cases.push(CaseInfo { value: Some(value) });
                Ok(Stmt::Case { index: cases.len() - 1 })
            }
        }
    }

    fn parse_default(&mut self, token: &Token) -> R<Stmt> {
        self.consume(TokenKind::Colon, "`:' expected")?;
        match self.switch_stack.last_mut() {
            None => {
                self.nofatal(Some(token), "`default' cannot use outside of `switch'".to_string())?;
                Ok(Stmt::Block { scope: None, stmts: vec![] })
            }
            Some(cases) => {
                if cases.iter().any(|c| c.value.is_none()) {
                    let token = token.clone();
                    self.nofatal(
                        Some(&token),
                        "`default' already defined in `switch'".to_string(),
                    )?;
                    return Ok(Stmt::Block { scope: None, stmts: vec![] });
                }
                cases.push(CaseInfo { value: None });
                Ok(Stmt::Case { index: cases.len() - 1 })
            }
        }
    }

    fn parse_while(&mut self) -> R<Stmt> {
        self.consume(TokenKind::LParen, "`(' expected")?;
        let cond = self.parse_expr()?;
        let cond = self.make_cond(cond)?;
        self.consume(TokenKind::RParen, "`)' expected")?;

        self.break_ok += 1;
        self.continue_ok += 1;
        let body = self.parse_stmt_required();
        self.break_ok -= 1;
        self.continue_ok -= 1;
        Ok(Stmt::While { cond, body: Box::new(body?) })
    }

    fn parse_do_while(&mut self) -> R<Stmt> {
        self.break_ok += 1;
        self.continue_ok += 1;
        let body = self.parse_stmt_required();
        self.break_ok -= 1;
        self.continue_ok -= 1;
        let body = body?;

        self.consume(TokenKind::While, "`while' expected")?;
        self.consume(TokenKind::LParen, "`(' expected")?;
        let cond = self.parse_expr()?;
        let cond = self.make_cond(cond)?;
        self.consume(TokenKind::RParen, "`)' expected")?;
        self.consume(TokenKind::Semicolon, "`;' expected")?;
        Ok(Stmt::DoWhile { body: Box::new(body), cond })
    }

    fn parse_for(&mut self) -> R<Stmt> {
        self.consume(TokenKind::LParen, "`(' expected")?;
        let mut pre = None;
        let mut decl_stmt = None;
        let mut scope = None;
        if self.matches(TokenKind::Semicolon)?.is_none() {
            // A declaration in the init clause opens its own scope.
            let def = self.parse_var_def()?;
            match def {
                Some(def) => {
                    let Some(ident) = def.ident.clone() else {
                        let token = self.fetch()?;
                        return self.fatal(Some(&token), "Ident expected".to_string());
                    };
                    scope = Some(self.enter_scope());
                    decl_stmt = self.parse_vardecl_cont(def, ident)?;
                    self.consume(TokenKind::Semicolon, "`;' expected")?;
                }
                None => {
                    pre = Some(self.parse_expr()?);
                    self.consume(TokenKind::Semicolon, "`;' expected")?;
                }
            }
        }

        let mut cond = None;
        let mut post = None;
        if self.matches(TokenKind::Semicolon)?.is_none() {
            let c = self.parse_expr()?;
            cond = Some(self.make_cond(c)?);
            self.consume(TokenKind::Semicolon, "`;' expected")?;
        }
        if self.matches(TokenKind::RParen)?.is_none() {
            post = Some(self.parse_expr()?);
            self.consume(TokenKind::RParen, "`)' expected")?;
        }

        self.break_ok += 1;
        self.continue_ok += 1;
        let body = self.parse_stmt_required();
        self.break_ok -= 1;
        self.continue_ok -= 1;
        let body = body?;

        if scope.is_some() {
            self.exit_scope();
        }

        let for_stmt = Stmt::For { pre, cond, post, body: Box::new(body) };
        let mut stmts = Vec::new();
        if let Some(decl) = decl_stmt {
            stmts.push(decl);
        }
        stmts.push(for_stmt);
        Ok(Stmt::Block { scope, stmts })
    }

    fn parse_goto(&mut self) -> R<Stmt> {
        let label = self.consume_ident("label for goto expected")?;
        self.consume(TokenKind::Semicolon, "`;' expected")?;
        let name = label.ident().unwrap();
        if let Some(func) = self.curfunc.as_mut() {
            func.gotos.push((name, label.clone()));
        }
        Ok(Stmt::Goto { label: name, token: label })
    }

    fn parse_return(&mut self, token: &Token) -> R<Stmt> {
        let mut value = None;
        if self.matches(TokenKind::Semicolon)?.is_none() {
            let expr = self.parse_expr()?;
            self.consume(TokenKind::Semicolon, "`;' expected")?;
            value = Some(self.str_to_char_array_var(expr)?);
        }

        let rettype = self.curfunc.as_ref().map(|f| f.ty.ret.clone()).unwrap_or(Type::Void);
        match value {
            None => {
                if !rettype.is_void() {
                    self.nofatal(Some(token), "`return' required a value".to_string())?;
                }
                Ok(Stmt::Return { value: None })
            }
            Some(expr) => {
                if rettype.is_void() {
                    let tok = expr.token.clone();
                    self.nofatal(Some(&tok), "void function `return' a value".to_string())?;
                    Ok(Stmt::Return { value: None })
                } else {
                    let tok = expr.token.clone();
                    let expr = self.make_cast(rettype, &tok, expr, false)?;
                    Ok(Stmt::Return { value: Some(expr) })
                }
            }
        }
    }

    fn parse_asm(&mut self) -> R<Stmt> {
        self.consume(TokenKind::LParen, "`(' expected")?;
        let template = self.fetch()?;
        let TokenKind::Str(template_bytes) = &template.kind else {
            return self.fatal(Some(&template), "`__asm' expected string literal".to_string());
        };
        let template_bytes = template_bytes.clone();

        let mut output = None;
        if self.matches(TokenKind::Colon)?.is_some() {
            let constraint = self.fetch()?;
            if !matches!(constraint.kind, TokenKind::Str(_)) {
                return self.fatal(Some(&constraint), "string literal expected".to_string());
            }
            self.consume(TokenKind::LParen, "`(' expected")?;
            let var = self.parse_expr()?;
            if !matches!(var.kind, ExprKind::Var { .. }) {
                let tok = var.token.clone();
                self.fatal::<()>(Some(&tok), "lvalue expected".to_string())?;
            }
            self.consume(TokenKind::RParen, "`)' expected")?;
            output = Some(var);
        }
        self.consume(TokenKind::RParen, "`)' expected")?;
        self.consume(TokenKind::Semicolon, "`;' expected")?;
        Ok(Stmt::Asm { template: template_bytes, output })
    }

    // ---- expressions ----

    pub fn parse_expr(&mut self) -> R<Expr> {
        let mut expr = self.parse_assign()?;
        while let Some(token) = self.matches(TokenKind::Comma)? {
            let rhs = self.parse_assign()?;
            let ty = rhs.ty.clone();
            expr = Expr::new(
                ExprKind::Bop { op: BinOp::Comma, lhs: Box::new(expr), rhs: Box::new(rhs) },
                ty,
                token,
            );
        }
        Ok(expr)
    }

    /// Constant expression reduced to a fixnum.
    pub fn parse_const(&mut self) -> R<i64> {
        let expr = self.parse_conditional()?;
        match expr.as_fixnum() {
            Some(value) => Ok(value),
            None => {
                let token = expr.token.clone();
                self.nofatal(Some(&token), "Constant value expected".to_string())?;
                Ok(0)
            }
        }
    }

    fn parse_assign(&mut self) -> R<Expr> {
        let lhs = self.parse_conditional()?;
        let token = self.fetch()?;
        let compound = match token.kind {
            TokenKind::Assign => None,
            TokenKind::AddAssign => Some(BinOp::Add),
            TokenKind::SubAssign => Some(BinOp::Sub),
            TokenKind::MulAssign => Some(BinOp::Mul),
            TokenKind::DivAssign => Some(BinOp::Div),
            TokenKind::ModAssign => Some(BinOp::Mod),
            TokenKind::AndAssign => Some(BinOp::BitAnd),
            TokenKind::OrAssign => Some(BinOp::BitOr),
            TokenKind::HatAssign => Some(BinOp::BitXor),
            TokenKind::LShiftAssign => Some(BinOp::LShift),
            TokenKind::RShiftAssign => Some(BinOp::RShift),
            _ => {
                self.unget(token);
                return Ok(lhs);
            }
        };

        self.check_lvalue(&lhs)?;
        let rhs = self.parse_assign()?;
        let rhs = self.str_to_char_array_var(rhs)?;
        match compound {
            None => {
                let ty = lhs.ty.clone();
                let rhs = self.make_cast(ty.clone(), &token, rhs, false)?;
                Ok(Expr::new(
                    ExprKind::Bop { op: BinOp::Assign, lhs: Box::new(lhs), rhs: Box::new(rhs) },
                    ty,
                    token,
                ))
            }
            Some(op) => {
                let ty = lhs.ty.clone();
                let inner = match op {
                    BinOp::Add | BinOp::Sub => self.new_expr_addsub(op, &token, lhs, rhs, true)?,
                    _ => self.new_expr_numeric_bop(op, &token, lhs, rhs, true)?,
                };
                Ok(Expr::new(
                    ExprKind::Unary { op: UnOp::Modify, sub: Box::new(inner) },
                    ty,
                    token,
                ))
            }
        }
    }

    fn parse_conditional(&mut self) -> R<Expr> {
        let cond = self.parse_logior()?;
        let Some(token) = self.matches(TokenKind::Question)? else { return Ok(cond) };
        let cond = self.make_cond(cond)?;
        let then_expr = self.parse_expr()?;
        self.consume(TokenKind::Colon, "`:' expected")?;
        let else_expr = self.parse_conditional()?;
        let then_expr = self.str_to_char_array_var(then_expr)?;
        let else_expr = self.str_to_char_array_var(else_expr)?;

        let ty = if then_expr.ty.is_number() && else_expr.ty.is_number() {
            arith_result(&then_expr.ty, &else_expr.ty)
        } else if then_expr.ty.is_void() || else_expr.ty.is_void() {
            Type::Void
        } else {
            then_expr.ty.array_to_ptr()
        };
        let (then_expr, else_expr) = if ty.is_void() {
            (then_expr, else_expr)
        } else {
            let t = self.make_cast(ty.clone(), &token, then_expr, false)?;
            let e = self.make_cast(ty.clone(), &token, else_expr, false)?;
            (t, e)
        };
        Ok(Expr::new(
            ExprKind::Ternary {
                cond: Box::new(cond),
                then_expr: Box::new(then_expr),
                else_expr: Box::new(else_expr),
            },
            ty,
            token,
        ))
    }

    fn parse_logior(&mut self) -> R<Expr> {
        let mut expr = self.parse_logand()?;
        while let Some(token) = self.matches(TokenKind::LogOr)? {
            let lhs = self.make_cond(expr)?;
            let rhs = self.parse_logand()?;
            let rhs = self.make_cond(rhs)?;
            expr = self.fold_logical(BinOp::LogOr, lhs, rhs, token);
        }
        Ok(expr)
    }

    fn parse_logand(&mut self) -> R<Expr> {
        let mut expr = self.parse_bitor()?;
        while let Some(token) = self.matches(TokenKind::LogAnd)? {
            let lhs = self.make_cond(expr)?;
            let rhs = self.parse_bitor()?;
            let rhs = self.make_cond(rhs)?;
            expr = self.fold_logical(BinOp::LogAnd, lhs, rhs, token);
        }
        Ok(expr)
    }

    fn fold_logical(&mut self, op: BinOp, lhs: Expr, rhs: Expr, token: Token) -> Expr {
        if let (Some(l), Some(r)) = (lhs.as_fixnum(), rhs.as_fixnum()) {
            let value = match op {
                BinOp::LogAnd => (l != 0 && r != 0) as i64,
                _ => (l != 0 || r != 0) as i64,
            };
            return Expr::new(ExprKind::Fixnum(value), Type::INT, token);
        }
        Expr::new(
            ExprKind::Bop { op, lhs: Box::new(lhs), rhs: Box::new(rhs) },
            Type::INT,
            token,
        )
    }

    fn parse_bitor(&mut self) -> R<Expr> {
        let mut expr = self.parse_bitxor()?;
        while let Some(token) = self.matches(TokenKind::Or)? {
            let rhs = self.parse_bitxor()?;
            expr = self.new_expr_numeric_bop(BinOp::BitOr, &token, expr, rhs, false)?;
        }
        Ok(expr)
    }

    fn parse_bitxor(&mut self) -> R<Expr> {
        let mut expr = self.parse_bitand()?;
        while let Some(token) = self.matches(TokenKind::Hat)? {
            let rhs = self.parse_bitand()?;
            expr = self.new_expr_numeric_bop(BinOp::BitXor, &token, expr, rhs, false)?;
        }
        Ok(expr)
    }

    fn parse_bitand(&mut self) -> R<Expr> {
        let mut expr = self.parse_eq()?;
        while let Some(token) = self.matches(TokenKind::Amp)? {
            let rhs = self.parse_eq()?;
            expr = self.new_expr_numeric_bop(BinOp::BitAnd, &token, expr, rhs, false)?;
        }
        Ok(expr)
    }

    fn parse_eq(&mut self) -> R<Expr> {
        let mut expr = self.parse_cmp()?;
        loop {
            let op = if let Some(token) = self.matches(TokenKind::Eq)? {
                (BinOp::Eq, token)
            } else if let Some(token) = self.matches(TokenKind::Ne)? {
                (BinOp::Ne, token)
            } else {
                return Ok(expr);
            };
            let rhs = self.parse_cmp()?;
            expr = self.new_expr_cmp(op.0, &op.1, expr, rhs)?;
        }
    }

    fn parse_cmp(&mut self) -> R<Expr> {
        let mut expr = self.parse_shift()?;
        loop {
            let op = if let Some(token) = self.matches(TokenKind::Lt)? {
                (BinOp::Lt, token)
            } else if let Some(token) = self.matches(TokenKind::Le)? {
                (BinOp::Le, token)
            } else if let Some(token) = self.matches(TokenKind::Ge)? {
                (BinOp::Ge, token)
            } else if let Some(token) = self.matches(TokenKind::Gt)? {
                (BinOp::Gt, token)
            } else {
                return Ok(expr);
            };
            let rhs = self.parse_shift()?;
            expr = self.new_expr_cmp(op.0, &op.1, expr, rhs)?;
        }
    }

    fn parse_shift(&mut self) -> R<Expr> {
        let mut expr = self.parse_add()?;
        loop {
            let op = if let Some(token) = self.matches(TokenKind::LShift)? {
                (BinOp::LShift, token)
            } else if let Some(token) = self.matches(TokenKind::RShift)? {
                (BinOp::RShift, token)
            } else {
                return Ok(expr);
            };
            let rhs = self.parse_add()?;
            expr = self.new_expr_numeric_bop(op.0, &op.1, expr, rhs, false)?;
        }
    }

    fn parse_add(&mut self) -> R<Expr> {
        let mut expr = self.parse_mul()?;
        loop {
            let op = if let Some(token) = self.matches(TokenKind::Add)? {
                (BinOp::Add, token)
            } else if let Some(token) = self.matches(TokenKind::Sub)? {
                (BinOp::Sub, token)
            } else {
                return Ok(expr);
            };
            let rhs = self.parse_mul()?;
            expr = self.new_expr_addsub(op.0, &op.1, expr, rhs, false)?;
        }
    }

    fn parse_mul(&mut self) -> R<Expr> {
        let mut expr = self.parse_cast()?;
        loop {
            let op = if let Some(token) = self.matches(TokenKind::Mul)? {
                (BinOp::Mul, token)
            } else if let Some(token) = self.matches(TokenKind::Div)? {
                (BinOp::Div, token)
            } else if let Some(token) = self.matches(TokenKind::Mod)? {
                (BinOp::Mod, token)
            } else {
                return Ok(expr);
            };
            let rhs = self.parse_cast()?;
            expr = self.new_expr_numeric_bop(op.0, &op.1, expr, rhs, false)?;
        }
    }

    fn parse_cast(&mut self) -> R<Expr> {
        if let Some(lpar) = self.matches(TokenKind::LParen)? {
            if let Some(ty) = self.parse_full_type()? {
                self.consume(TokenKind::RParen, "`)' expected")?;
                if let Some(lbrace) = self.matches(TokenKind::LBrace)? {
                    self.unget(lbrace);
                    return self.parse_compound_literal(ty, &lpar);
                }
                let sub = self.parse_cast()?;
                return self.make_cast(ty, &lpar, sub, true);
            }
            self.unget(lpar);
        }
        self.parse_unary()
    }

    fn parse_compound_literal(&mut self, ty: Type, token: &Token) -> R<Expr> {
        let init = self.parse_initializer()?;
        let mut ty = ty;
        if ty.is_array() {
            ty = self.fix_array_size(ty, &init)?;
        }

        if self.curscope.is_global() {
            let label = self.session.alloc_label();
            let storage = Storage { is_static: true, ..Storage::default() };
            let index = self.session.add_var(GLOBAL_SCOPE, label, ty.clone(), storage);
            let init = self.check_global_initializer(&ty, init)?;
            if let VarPlace::Global { init: slot, .. } =
                &mut self.session.var_mut(GLOBAL_SCOPE, index).place
            {
                *slot = Some(init);
            }
            let var = Expr::new(
                ExprKind::Var { name: label, scope: GLOBAL_SCOPE },
                ty.clone(),
                token.clone(),
            );
            Ok(Expr::new(
                ExprKind::Complit { var: Box::new(var.clone()), inits: vec![] },
                ty,
                token.clone(),
            ))
        } else {
            let var = self.add_hidden_local(ty.clone(), token)?;
            let mut inits = Vec::new();
            self.assign_initial_value(var.clone(), init, &mut inits)?;
            Ok(Expr::new(
                ExprKind::Complit { var: Box::new(var), inits },
                ty,
                token.clone(),
            ))
        }
    }

    fn parse_unary(&mut self) -> R<Expr> {
        let token = self.fetch()?;
        match token.kind {
            TokenKind::Add => {
                let sub = self.parse_cast()?;
                self.require_number(&sub)?;
                return Ok(sub);
            }
            TokenKind::Sub => {
                let sub = self.parse_cast()?;
                self.require_number(&sub)?;
                if let Some(v) = sub.as_fixnum() {
                    let ty = sub.ty.promoted();
                    return Ok(Expr::new(
                        ExprKind::Fixnum(wrap_fixnum(v.wrapping_neg(), &ty)),
                        ty,
                        token,
                    ));
                }
                if let ExprKind::Flonum(v) = sub.kind {
                    return Ok(Expr::new(ExprKind::Flonum(-v), sub.ty, token));
                }
                let ty = sub.ty.promoted();
                let sub = self.make_cast(ty.clone(), &token, sub, false)?;
                return Ok(Expr::new(
                    ExprKind::Unary { op: UnOp::Neg, sub: Box::new(sub) },
                    ty,
                    token,
                ));
            }
            TokenKind::Not => {
                let sub = self.parse_cast()?;
                let cond = self.make_cond(sub)?;
                if let Some(v) = cond.as_fixnum() {
                    return Ok(Expr::new(ExprKind::Fixnum((v == 0) as i64), Type::INT, token));
                }
                return Ok(Expr::new(
                    ExprKind::Unary { op: UnOp::Not, sub: Box::new(cond) },
                    Type::INT,
                    token,
                ));
            }
            TokenKind::Tilde => {
                let sub = self.parse_cast()?;
                if !sub.ty.is_fixnum() {
                    let tok = sub.token.clone();
                    self.nofatal(Some(&tok), "Cannot use `~' except integer".to_string())?;
                }
                if let Some(v) = sub.as_fixnum() {
                    let ty = sub.ty.promoted();
                    return Ok(Expr::new(ExprKind::Fixnum(wrap_fixnum(!v, &ty)), ty, token));
                }
                let ty = sub.ty.promoted();
                let sub = self.make_cast(ty.clone(), &token, sub, false)?;
                return Ok(Expr::new(
                    ExprKind::Unary { op: UnOp::BitNot, sub: Box::new(sub) },
                    ty,
                    token,
                ));
            }
            TokenKind::Amp => {
                let sub = self.parse_cast()?;
                return self.make_refer(&token, sub);
            }
            TokenKind::Mul => {
                let sub = self.parse_cast()?;
                let ty = match sub.ty.pointee() {
                    Some(p) => p.clone(),
                    None => {
                        let tok = sub.token.clone();
                        self.nofatal(
                            Some(&tok),
                            "Cannot dereference raw type".to_string(),
                        )?;
                        Type::INT
                    }
                };
                return Ok(Expr::new(
                    ExprKind::Unary { op: UnOp::Deref, sub: Box::new(sub) },
                    ty,
                    token,
                ));
            }
            TokenKind::Inc | TokenKind::Dec => {
                let op =
                    if token.kind == TokenKind::Inc { UnOp::PreInc } else { UnOp::PreDec };
                let sub = self.parse_unary()?;
                self.check_lvalue(&sub)?;
                let ty = sub.ty.clone();
                return Ok(Expr::new(ExprKind::Unary { op, sub: Box::new(sub) }, ty, token));
            }
            TokenKind::Sizeof => {
                return self.parse_sizeof(&token);
            }
            TokenKind::Alignof => {
                self.consume(TokenKind::LParen, "`(' expected")?;
                let Some(ty) = self.parse_full_type()? else {
                    let tok = self.fetch()?;
                    return self.fatal(Some(&tok), "type expected".to_string());
                };
                self.consume(TokenKind::RParen, "`)' expected")?;
                return Ok(Expr::new(
                    ExprKind::Fixnum(ty.align() as i64),
                    Type::SIZE_T,
                    token,
                ));
            }
            _ => {}
        }
        self.unget(token);
        self.parse_postfix()
    }

    fn parse_sizeof(&mut self, token: &Token) -> R<Expr> {
        // `sizeof(type)` or `sizeof expr`; the operand is not evaluated.
        let ty = if let Some(lpar) = self.matches(TokenKind::LParen)? {
            if let Some(ty) = self.parse_full_type()? {
                self.consume(TokenKind::RParen, "`)' expected")?;
                ty
            } else {
                self.unget(lpar);
                let expr = self.parse_unary()?;
                expr.ty
            }
        } else {
            let expr = self.parse_unary()?;
            expr.ty
        };
        Ok(Expr::new(
            ExprKind::Fixnum(ty.size() as i64),
            Type::SIZE_T,
            token.clone(),
        ))
    }

    fn make_refer(&mut self, token: &Token, sub: Expr) -> R<Expr> {
        self.check_referable(&sub)?;
        // Mark the variable as address-taken; it must live in memory.
        if let ExprKind::Var { name, scope } = &sub.kind {
            if let Some((scope, index)) = self.session.scope_find(*scope, *name) {
                if !scope.is_global() {
                    self.session.var_mut(scope, index).ref_taken = true;
                }
            }
        }
        let ty = ptrof(&sub.ty);
        Ok(Expr::new(
            ExprKind::Unary { op: UnOp::Ref, sub: Box::new(sub) },
            ty,
            token.clone(),
        ))
    }

    fn check_referable(&mut self, expr: &Expr) -> R<()> {
        match &expr.kind {
            ExprKind::Var { .. } | ExprKind::Member { .. } | ExprKind::Complit { .. } => Ok(()),
            ExprKind::Unary { op: UnOp::Deref, .. } => Ok(()),
            _ => {
                let token = expr.token.clone();
                self.nofatal(Some(&token), "Cannot take reference".to_string())
            }
        }
    }

    fn check_lvalue(&mut self, expr: &Expr) -> R<()> {
        let ok = match &expr.kind {
            ExprKind::Var { .. } => !expr.ty.is_func() && !expr.ty.is_array(),
            ExprKind::Unary { op: UnOp::Deref, .. } => true,
            ExprKind::Member { .. } => true,
            _ => false,
        };
        if !ok {
            let token = expr.token.clone();
            self.nofatal(Some(&token), "Cannot assign".to_string())?;
        }
        Ok(())
    }

    fn require_number(&mut self, expr: &Expr) -> R<()> {
        if !expr.ty.is_number() {
            let token = expr.token.clone();
            self.nofatal(Some(&token), "Cannot apply except number type".to_string())?;
        }
        Ok(())
    }

    fn parse_postfix(&mut self) -> R<Expr> {
        let mut expr = self.parse_prim()?;
        loop {
            if let Some(token) = self.matches(TokenKind::LParen)? {
                expr = self.parse_funcall(expr, token)?;
            } else if let Some(token) = self.matches(TokenKind::LBracket)? {
                // a[i] => *(a + i)
                let index = self.parse_expr()?;
                self.consume(TokenKind::RBracket, "`]' expected")?;
                let sum = self.new_expr_addsub(BinOp::Add, &token, expr, index, false)?;
                let ty = match sum.ty.pointee() {
                    Some(p) => p.clone(),
                    None => {
                        self.nofatal(Some(&token), "Cannot index".to_string())?;
                        Type::INT
                    }
                };
                expr = Expr::new(
                    ExprKind::Unary { op: UnOp::Deref, sub: Box::new(sum) },
                    ty,
                    token,
                );
            } else if let Some(token) = self.matches(TokenKind::Dot)? {
                expr = self.parse_member_access(expr, &token, false)?;
            } else if let Some(token) = self.matches(TokenKind::Arrow)? {
                expr = self.parse_member_access(expr, &token, true)?;
            } else if let Some(token) = self.matches(TokenKind::Inc)? {
                self.check_lvalue(&expr)?;
                let ty = expr.ty.clone();
                expr = Expr::new(
                    ExprKind::Unary { op: UnOp::PostInc, sub: Box::new(expr) },
                    ty,
                    token,
                );
            } else if let Some(token) = self.matches(TokenKind::Dec)? {
                self.check_lvalue(&expr)?;
                let ty = expr.ty.clone();
                expr = Expr::new(
                    ExprKind::Unary { op: UnOp::PostDec, sub: Box::new(expr) },
                    ty,
                    token,
                );
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_member_access(&mut self, target: Expr, token: &Token, arrow: bool) -> R<Expr> {
        let ident = self.consume_ident("`ident' expected")?;
        let name = ident.ident().unwrap();

        let struct_ty = if arrow {
            match target.ty.pointee() {
                Some(p) => p.clone(),
                None => {
                    self.nofatal(Some(token), "`->' for non pointer value".to_string())?;
                    return Ok(Expr::new(ExprKind::Fixnum(0), Type::INT, token.clone()));
                }
            }
        } else {
            target.ty.clone()
        };
        let Some(sref) = struct_ty.struct_ref().cloned() else {
            self.nofatal(
                Some(token),
                "Accessing non struct value with `.' or `->'".to_string(),
            )?;
            return Ok(Expr::new(ExprKind::Fixnum(0), Type::INT, token.clone()));
        };
        if !sref.completed() {
            self.nofatal(Some(token), "Incomplete struct".to_string())?;
            return Ok(Expr::new(ExprKind::Fixnum(0), Type::INT, token.clone()));
        }

        // `->` is sugar for deref-then-member.
        let base = if arrow {
            Expr::new(
                ExprKind::Unary { op: UnOp::Deref, sub: Box::new(target) },
                struct_ty.clone(),
                token.clone(),
            )
        } else {
            target
        };

        let Some(path) = Self::search_from_anonymous(&sref, name) else {
            self.nofatal(
                Some(&ident),
                format!("`{}' is not member of struct", self.name_str(name)),
            )?;
            return Ok(Expr::new(ExprKind::Fixnum(0), Type::INT, token.clone()));
        };
        let mut expr = base;
        let mut cur_ref = sref;
        for step in path {
            let (member_ty, next_ref) = {
                let info = cur_ref.info.borrow();
                let member = &info.as_ref().unwrap().members[step];
                let next = member.ty.struct_ref().cloned();
                (member.ty.clone(), next)
            };
            expr = Expr::new(
                ExprKind::Member { target: Box::new(expr), index: step },
                member_ty,
                token.clone(),
            );
            if let Some(next) = next_ref {
                cur_ref = next;
            }
        }
        Ok(expr)
    }

    fn parse_funcall(&mut self, func: Expr, token: Token) -> R<Expr> {
        let mut args = Vec::new();
        if self.matches(TokenKind::RParen)?.is_none() {
            loop {
                let arg = self.parse_assign()?;
                let arg = self.str_to_char_array_var(arg)?;
                args.push(arg);
                if self.matches(TokenKind::Comma)?.is_none() {
                    self.consume(TokenKind::RParen, "`)' expected")?;
                    break;
                }
            }
        }

        let Some(functype) = func.ty.func_type().cloned() else {
            let tok = func.token.clone();
            self.nofatal(Some(&tok), "Cannot call except function".to_string())?;
            return Ok(Expr::new(ExprKind::Fixnum(0), Type::INT, token));
        };

        // Check and convert arguments.
        if let Some(param_types) = &functype.params {
            let required = param_types.len();
            let ok = if functype.vaargs { args.len() >= required } else { args.len() == required };
            if !ok {
                self.nofatal(
                    Some(&token),
                    format!("function expects {} arguments, but got {}", required, args.len()),
                )?;
            }
            for (i, arg) in args.iter_mut().enumerate() {
                let target = if i < required {
                    param_types[i].clone()
                } else {
                    // Default argument promotions for the variadic tail.
                    match &arg.ty {
                        Type::Flonum(FlonumKind::Float) => Type::DOUBLE,
                        ty if ty.is_fixnum() => ty.promoted(),
                        ty => ty.array_to_ptr(),
                    }
                };
                let tok = arg.token.clone();
                let converted = self.make_cast(target, &tok, arg.clone(), false)?;
                *arg = converted;
            }
        }

        let ret = functype.ret.clone();
        Ok(Expr::new(
            ExprKind::Funcall { func: Box::new(func), args },
            ret,
            token,
        ))
    }

    fn parse_prim(&mut self) -> R<Expr> {
        let token = self.fetch()?;
        match &token.kind {
            TokenKind::LParen => {
                let expr = self.parse_expr()?;
                self.consume(TokenKind::RParen, "No close paren")?;
                Ok(expr)
            }
            TokenKind::IntLit { value, kind, unsigned } => {
                let ty = Type::Fixnum { kind: *kind, unsigned: *unsigned };
                let value = *value;
                Ok(Expr::new(ExprKind::Fixnum(value), ty, token))
            }
            TokenKind::FloatLit { value, single } => {
                let ty = Type::Flonum(if *single { FlonumKind::Float } else { FlonumKind::Double });
                let value = *value;
                Ok(Expr::new(ExprKind::Flonum(value), ty, token))
            }
            TokenKind::Str(bytes) => {
                let ty = Type::Array {
                    elem: Box::new(Type::CHAR),
                    len: bytes.len() as isize,
                };
                let bytes = bytes.clone();
                Ok(Expr::new(ExprKind::Str(bytes), ty, token))
            }
            TokenKind::Ident(name) => {
                let name = *name;
                if let Some((scope, index)) = self.session.scope_find(self.curscope, name) {
                    let ty = self.session.var(scope, index).ty.clone();
                    return Ok(Expr::new(ExprKind::Var { name, scope: self.curscope }, ty, token));
                }
                if let Some(value) = self.session.find_enum_const(self.curscope, name) {
                    let ty = Type::Fixnum { kind: FixnumKind::Enum, unsigned: false };
                    return Ok(Expr::new(ExprKind::Fixnum(value), ty, token));
                }
                self.nofatal(
                    Some(&token),
                    format!("`{}' undeclared", self.name_str(name)),
                )?;
                // Recover: pretend it is an int variable.
                self.session.add_var(self.curscope, name, Type::INT, Storage::default());
                Ok(Expr::new(
                    ExprKind::Var { name, scope: self.curscope },
                    Type::INT,
                    token,
                ))
            }
            _ => self.fatal(Some(&token), "Number or Ident or open paren expected".to_string()),
        }
    }

    // ---- expression construction ----

    /// Scalar condition: comparisons pass through, everything else
    /// becomes `expr != 0`.
    fn make_cond(&mut self, expr: Expr) -> R<Expr> {
        match &expr.kind {
            ExprKind::Bop { op, .. }
                if op.is_comparison() || matches!(op, BinOp::LogAnd | BinOp::LogOr) =>
            {
                Ok(expr)
            }
            ExprKind::Unary { op: UnOp::Not, .. } => Ok(expr),
            ExprKind::Fixnum(_) => Ok(expr),
            _ => {
                if !expr.ty.is_number() && !expr.ty.is_ptr() && !expr.ty.is_array() {
                    let token = expr.token.clone();
                    self.nofatal(Some(&token), "Cannot use as condition".to_string())?;
                    return Ok(expr);
                }
                let token = expr.token.clone();
                let ty = expr.ty.array_to_ptr();
                let zero = if ty.is_flonum() {
                    Expr::new(ExprKind::Flonum(0.0), ty.clone(), token.clone())
                } else {
                    Expr::new(ExprKind::Fixnum(0), ty.clone(), token.clone())
                };
                Ok(Expr::new(
                    ExprKind::Bop { op: BinOp::Ne, lhs: Box::new(expr), rhs: Box::new(zero) },
                    Type::INT,
                    token,
                ))
            }
        }
    }

    /// `+`/`-` with pointer scaling made explicit.
    fn new_expr_addsub(
        &mut self,
        op: BinOp,
        token: &Token,
        lhs: Expr,
        rhs: Expr,
        keep_left: bool,
    ) -> R<Expr> {
        let ltype = lhs.ty.clone();
        let rtype = rhs.ty.clone();

        if ltype.is_number() && rtype.is_number() {
            return self.new_expr_numeric_bop(op, token, lhs, rhs, keep_left);
        }

        // Pointer arithmetic: scale the integer operand by the element
        // size during parsing.
        let (ptr, num) = if ltype.is_ptr() || ltype.is_array() {
            if rtype.is_ptr() || rtype.is_array() {
                if op != BinOp::Sub {
                    self.nofatal(Some(token), "Cannot add pointers".to_string())?;
                }
                // p - q => (p - q) / sizeof(*p)
                let elem_size = ltype.pointee().map(|p| p.size()).unwrap_or(1).max(1) as i64;
                let lhs = self.make_cast(Type::SSIZE_T, token, lhs, true)?;
                let rhs = self.make_cast(Type::SSIZE_T, token, rhs, true)?;
                let diff = Expr::new(
                    ExprKind::Bop {
                        op: BinOp::Sub,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                    Type::SSIZE_T,
                    token.clone(),
                );
                let size = Expr::new(
                    ExprKind::Fixnum(elem_size),
                    Type::SSIZE_T,
                    token.clone(),
                );
                return Ok(Expr::new(
                    ExprKind::Bop { op: BinOp::Div, lhs: Box::new(diff), rhs: Box::new(size) },
                    Type::SSIZE_T,
                    token.clone(),
                ));
            }
            (lhs, rhs)
        } else if rtype.is_ptr() || rtype.is_array() {
            if op == BinOp::Sub {
                self.nofatal(Some(token), "Cannot sub pointer".to_string())?;
            }
            (rhs, lhs)
        } else {
            self.nofatal(Some(token), "Cannot apply `+'/`-'".to_string())?;
            return Ok(lhs);
        };

        if !num.ty.is_fixnum() {
            let tok = num.token.clone();
            self.nofatal(Some(&tok), "Must be integer".to_string())?;
        }
        let ptr_ty = ptr.ty.array_to_ptr();
        let elem_size = ptr_ty.pointee().map(|p| p.size()).unwrap_or(1).max(1) as i64;
        let num = self.cast_to(num, Type::SSIZE_T, token)?;
        let scaled = match num.as_fixnum() {
            Some(v) => Expr::new(
                ExprKind::Fixnum(v.wrapping_mul(elem_size)),
                Type::SSIZE_T,
                token.clone(),
            ),
            None => {
                let size = Expr::new(ExprKind::Fixnum(elem_size), Type::SSIZE_T, token.clone());
                Expr::new(
                    ExprKind::Bop { op: BinOp::Mul, lhs: Box::new(num), rhs: Box::new(size) },
                    Type::SSIZE_T,
                    token.clone(),
                )
            }
        };
        Ok(Expr::new(
            ExprKind::Bop { op, lhs: Box::new(ptr), rhs: Box::new(scaled) },
            ptr_ty,
            token.clone(),
        ))
    }

    /// Arithmetic/bitwise/shift on numbers, with the usual conversions
    /// and constant folding.
    fn new_expr_numeric_bop(
        &mut self,
        op: BinOp,
        token: &Token,
        lhs: Expr,
        rhs: Expr,
        keep_left: bool,
    ) -> R<Expr> {
        let is_bitwise = matches!(
            op,
            BinOp::BitAnd
                | BinOp::BitOr
                | BinOp::BitXor
                | BinOp::LShift
                | BinOp::RShift
                | BinOp::Mod
        );
        if !lhs.ty.is_number()
            || !rhs.ty.is_number()
            || (is_bitwise && (!lhs.ty.is_fixnum() || !rhs.ty.is_fixnum()))
        {
            self.nofatal(Some(token), "Cannot apply the operator".to_string())?;
            return Ok(lhs);
        }

        let ty = if keep_left {
            lhs.ty.clone()
        } else if matches!(op, BinOp::LShift | BinOp::RShift) {
            lhs.ty.promoted()
        } else {
            arith_result(&lhs.ty, &rhs.ty)
        };

        // Fold constants.
        if let (Some(l), Some(r)) = (lhs.as_fixnum(), rhs.as_fixnum()) {
            if ty.is_fixnum() {
                let divisor_ok = !matches!(op, BinOp::Div | BinOp::Mod) || r != 0;
                if divisor_ok {
                    let unsigned = ty.is_unsigned();
                    let value = fold_fixnum_bop(op, l, r, unsigned);
                    return Ok(Expr::new(
                        ExprKind::Fixnum(wrap_fixnum(value, &ty)),
                        ty,
                        token.clone(),
                    ));
                }
            }
        }
        if let (ExprKind::Flonum(l), ExprKind::Flonum(r)) = (&lhs.kind, &rhs.kind) {
            if ty.is_flonum() && matches!(op, BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div) {
                let value = match op {
                    BinOp::Add => l + r,
                    BinOp::Sub => l - r,
                    BinOp::Mul => l * r,
                    _ => l / r,
                };
                return Ok(Expr::new(ExprKind::Flonum(value), ty, token.clone()));
            }
        }

        let lhs = self.cast_to(lhs, ty.clone(), token)?;
        let rhs = if matches!(op, BinOp::LShift | BinOp::RShift) {
            let shift_ty = rhs.ty.promoted();
            self.cast_to(rhs, shift_ty, token)?
        } else {
            self.cast_to(rhs, ty.clone(), token)?
        };
        Ok(Expr::new(
            ExprKind::Bop { op, lhs: Box::new(lhs), rhs: Box::new(rhs) },
            ty,
            token.clone(),
        ))
    }

    fn new_expr_cmp(&mut self, op: BinOp, token: &Token, lhs: Expr, rhs: Expr) -> R<Expr> {
        let (lhs, rhs) = if lhs.ty.is_number() && rhs.ty.is_number() {
            let ty = arith_result(&lhs.ty, &rhs.ty);
            (self.cast_to(lhs, ty.clone(), token)?, self.cast_to(rhs, ty, token)?)
        } else {
            // Pointer comparison; a constant zero converts.
            let lt = lhs.ty.array_to_ptr();
            let rt = rhs.ty.array_to_ptr();
            if lt.is_ptr() && (rt.is_ptr() || rhs.is_zero()) {
                let rhs = self.make_cast(lt.clone(), token, rhs, false)?;
                (self.cast_to(lhs, lt, token)?, rhs)
            } else if rt.is_ptr() && lhs.is_zero() {
                let lhs = self.make_cast(rt.clone(), token, lhs, false)?;
                (lhs, self.cast_to(rhs, rt, token)?)
            } else {
                self.nofatal(Some(token), "Cannot compare".to_string())?;
                (lhs, rhs)
            }
        };

        if let (Some(l), Some(r)) = (lhs.as_fixnum(), rhs.as_fixnum()) {
            let unsigned = lhs.ty.is_unsigned();
            let value = fold_fixnum_cmp(op, l, r, unsigned);
            return Ok(Expr::new(ExprKind::Fixnum(value), Type::INT, token.clone()));
        }
        Ok(Expr::new(
            ExprKind::Bop { op, lhs: Box::new(lhs), rhs: Box::new(rhs) },
            Type::INT,
            token.clone(),
        ))
    }

    fn cast_to(&mut self, expr: Expr, ty: Type, token: &Token) -> R<Expr> {
        self.make_cast(ty, token, expr, false)
    }

    /// Insert a cast (or fold it) after checking convertibility.
    fn make_cast(&mut self, ty: Type, token: &Token, sub: Expr, is_explicit: bool) -> R<Expr> {
        if same_type(&ty, &sub.ty) {
            return Ok(sub);
        }
        if !can_cast(&ty, &sub.ty, sub.is_zero(), is_explicit) {
            self.nofatal(
                Some(token),
                format!(
                    "Cannot convert value from type `{}' to `{}'",
                    sub.ty.describe(),
                    ty.describe()
                ),
            )?;
            return Ok(sub);
        }

        // Fold literal casts.
        match (&sub.kind, &ty) {
            (ExprKind::Fixnum(v), Type::Fixnum { .. }) => {
                return Ok(Expr::new(
                    ExprKind::Fixnum(wrap_fixnum(*v, &ty)),
                    ty,
                    token.clone(),
                ));
            }
            (ExprKind::Fixnum(v), Type::Flonum(_)) => {
                return Ok(Expr::new(ExprKind::Flonum(*v as f64), ty, token.clone()));
            }
            (ExprKind::Flonum(v), Type::Fixnum { .. }) => {
                return Ok(Expr::new(
                    ExprKind::Fixnum(wrap_fixnum(*v as i64, &ty)),
                    ty,
                    token.clone(),
                ));
            }
            (ExprKind::Flonum(v), Type::Flonum(_)) => {
                return Ok(Expr::new(ExprKind::Flonum(*v), ty, token.clone()));
            }
            _ => {}
        }
        Ok(Expr::new(
            ExprKind::Unary { op: UnOp::Cast, sub: Box::new(sub) },
            ty,
            token.clone(),
        ))
    }
}

/// Truncate a folded value to its type's width, preserving two's
/// complement semantics.
pub fn wrap_fixnum(value: i64, ty: &Type) -> i64 {
    let Type::Fixnum { kind, unsigned } = ty else { return value };
    match (kind.size(), unsigned) {
        (1, false) => value as i8 as i64,
        (1, true) => value as u8 as i64,
        (2, false) => value as i16 as i64,
        (2, true) => value as u16 as i64,
        (4, false) => value as i32 as i64,
        (4, true) => value as u32 as i64,
        _ => value,
    }
}

fn fold_fixnum_bop(op: BinOp, l: i64, r: i64, unsigned: bool) -> i64 {
    match op {
        BinOp::Add => l.wrapping_add(r),
        BinOp::Sub => l.wrapping_sub(r),
        BinOp::Mul => l.wrapping_mul(r),
        BinOp::Div => {
            if unsigned {
                ((l as u64).wrapping_div(r as u64)) as i64
            } else {
                l.wrapping_div(r)
            }
        }
        BinOp::Mod => {
            if unsigned {
                ((l as u64).wrapping_rem(r as u64)) as i64
            } else {
                l.wrapping_rem(r)
            }
        }
        BinOp::BitAnd => l & r,
        BinOp::BitOr => l | r,
        BinOp::BitXor => l ^ r,
        BinOp::LShift => l.wrapping_shl(r as u32),
        BinOp::RShift => {
            if unsigned {
                ((l as u64).wrapping_shr(r as u32)) as i64
            } else {
                l.wrapping_shr(r as u32)
            }
        }
        _ => 0,
    }
}

fn fold_fixnum_cmp(op: BinOp, l: i64, r: i64, unsigned: bool) -> i64 {
    let result = if unsigned {
        let (l, r) = (l as u64, r as u64);
        match op {
            BinOp::Eq => l == r,
            BinOp::Ne => l != r,
            BinOp::Lt => l < r,
            BinOp::Le => l <= r,
            BinOp::Ge => l >= r,
            _ => l > r,
        }
    } else {
        match op {
            BinOp::Eq => l == r,
            BinOp::Ne => l != r,
            BinOp::Lt => l < r,
            BinOp::Le => l <= r,
            BinOp::Ge => l >= r,
            _ => l > r,
        }
    };
    result as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::Diagnostics;
    use crate::symbols::NameTable;
    use std::cell::RefCell;

    struct Parsed {
        session: Session,
        decls: Vec<Declaration>,
        errors: usize,
    }

    fn parse_source(source: &str) -> Parsed {
        let names = Rc::new(RefCell::new(NameTable::new()));
        let diags = Rc::new(RefCell::new(Diagnostics::new()));
        let mut lexer = Lexer::new(source, "test.c", names.clone(), diags.clone());
        let mut session = Session::new(names, diags.clone());
        let mut decls = Vec::new();
        let mut parser = Parser::new(&mut lexer, &mut session);
        let result = parser.parse(&mut decls);
        assert!(result.is_ok(), "fatal parse error: {:?}", result.err());
        let errors = diags.borrow().error_count();
        Parsed { session, decls, errors }
    }

    fn first_func(parsed: &Parsed) -> &Function {
        parsed
            .decls
            .iter()
            .find_map(|d| match d {
                Declaration::Defun(f) => Some(f),
                _ => None,
            })
            .expect("no function parsed")
    }

    #[test]
    fn test_simple_function() {
        let parsed = parse_source("int main() { return 42; }");
        assert_eq!(parsed.errors, 0);
        let func = first_func(&parsed);
        assert_eq!(parsed.session.name_str(func.name), "main");
        assert!(matches!(
            func.stmts.as_slice(),
            [Stmt::Return { value: Some(_) }]
        ));
    }

    #[test]
    fn test_every_expr_has_type() {
        let parsed = parse_source("int f(int a) { return a * 2 + 1; }");
        assert_eq!(parsed.errors, 0);
        let func = first_func(&parsed);
        let Stmt::Return { value: Some(expr) } = &func.stmts[0] else { panic!() };
        assert_eq!(expr.ty, Type::INT);
    }

    #[test]
    fn test_constant_folding() {
        let parsed = parse_source("int x = 2 * 3 + 4;");
        assert_eq!(parsed.errors, 0);
        let (_, index) = parsed.session.scope_find(GLOBAL_SCOPE, parsed.session.intern("x")).unwrap();
        let var = parsed.session.var(GLOBAL_SCOPE, index);
        let init = var.global_init().unwrap();
        let InitKind::Single(expr) = &init.kind else { panic!() };
        assert_eq!(expr.as_fixnum(), Some(10));
    }

    #[test]
    fn test_pointer_arith_scaling() {
        let parsed = parse_source("long f(long *p) { return *(p + 2); }");
        assert_eq!(parsed.errors, 0);
        let func = first_func(&parsed);
        let Stmt::Return { value: Some(expr) } = &func.stmts[0] else { panic!() };
        let ExprKind::Unary { op: UnOp::Deref, sub } = &expr.kind else { panic!() };
        let ExprKind::Bop { rhs, .. } = &sub.kind else { panic!() };
        // 2 * sizeof(long) folded.
        assert_eq!(rhs.as_fixnum(), Some(16));
    }

    #[test]
    fn test_sizeof_matches_layout() {
        let parsed = parse_source(
            "struct S { char c; int i; long l; };\n\
             long a = sizeof(struct S);\n\
             long b = sizeof(long);\n",
        );
        assert_eq!(parsed.errors, 0);
        let get = |name: &str| {
            let name = parsed.session.intern(name);
            let (_, index) = parsed.session.scope_find(GLOBAL_SCOPE, name).unwrap();
            let var = parsed.session.var(GLOBAL_SCOPE, index);
            let InitKind::Single(e) = &var.global_init().unwrap().kind else { panic!() };
            e.as_fixnum().unwrap()
        };
        assert_eq!(get("a"), 16);
        assert_eq!(get("b"), 8);
    }

    #[test]
    fn test_unsized_array_from_initializer() {
        let parsed = parse_source("int a[] = {1, 2, 3};");
        assert_eq!(parsed.errors, 0);
        let name = parsed.session.intern("a");
        let (_, index) = parsed.session.scope_find(GLOBAL_SCOPE, name).unwrap();
        let var = parsed.session.var(GLOBAL_SCOPE, index);
        assert_eq!(var.ty, Type::Array { elem: Box::new(Type::INT), len: 3 });
    }

    #[test]
    fn test_unsized_array_with_designators() {
        // Max designated index + 1.
        let parsed = parse_source("int a[] = {[2] = 7, 1, 2, [0] = 9};");
        assert_eq!(parsed.errors, 0);
        let name = parsed.session.intern("a");
        let (_, index) = parsed.session.scope_find(GLOBAL_SCOPE, name).unwrap();
        let var = parsed.session.var(GLOBAL_SCOPE, index);
        assert_eq!(var.ty, Type::Array { elem: Box::new(Type::INT), len: 5 });
    }

    #[test]
    fn test_array_designator_overlap_rejected() {
        let names = Rc::new(RefCell::new(NameTable::new()));
        let diags = Rc::new(RefCell::new(Diagnostics::new()));
        let mut lexer =
            Lexer::new("int a[4] = {[1] = 1, 2, [2] = 3};", "t.c", names.clone(), diags.clone());
        let mut session = Session::new(names, diags);
        let mut decls = Vec::new();
        let mut parser = Parser::new(&mut lexer, &mut session);
        assert!(parser.parse(&mut decls).is_err());
    }

    #[test]
    fn test_struct_initializer_flattened_to_member_count() {
        let parsed = parse_source("struct P { int x, y; }; struct P p = {.y = 3, .x = 2};");
        assert_eq!(parsed.errors, 0);
        let name = parsed.session.intern("p");
        let (_, index) = parsed.session.scope_find(GLOBAL_SCOPE, name).unwrap();
        let var = parsed.session.var(GLOBAL_SCOPE, index);
        let InitKind::Multi(items) = &var.global_init().unwrap().kind else { panic!() };
        assert_eq!(items.len(), 2);
        let x = items[0].as_ref().unwrap();
        let InitKind::Single(e) = &x.kind else { panic!() };
        assert_eq!(e.as_fixnum(), Some(2));
    }

    #[test]
    fn test_global_initializer_must_be_constant() {
        let parsed = parse_source("int f(void); int x = f();");
        assert!(parsed.errors > 0);
    }

    #[test]
    fn test_global_address_initializer_ok() {
        let parsed = parse_source("int g; int *p = &g; char *s = \"hi\";");
        assert_eq!(parsed.errors, 0);
    }

    #[test]
    fn test_duplicate_case_nonfatal() {
        let parsed = parse_source(
            "int f(int n) { switch (n) { case 1: return 1; case 1: return 2; } return 0; }",
        );
        assert_eq!(parsed.errors, 1);
    }

    #[test]
    fn test_goto_undefined_label_nonfatal() {
        let parsed = parse_source("int f(void) { goto nowhere; return 0; }");
        assert_eq!(parsed.errors, 1);
    }

    #[test]
    fn test_break_outside_loop_nonfatal() {
        let parsed = parse_source("int f(void) { break; return 0; }");
        assert_eq!(parsed.errors, 1);
    }

    #[test]
    fn test_char_array_string_initializer_sizes() {
        // Exactly dropping the NUL is allowed.
        let parsed = parse_source("char a[2] = \"ab\"; char b[3] = \"ab\";");
        assert_eq!(parsed.errors, 0);
    }

    #[test]
    fn test_char_array_too_short_for_string() {
        let names = Rc::new(RefCell::new(NameTable::new()));
        let diags = Rc::new(RefCell::new(Diagnostics::new()));
        let mut lexer = Lexer::new("char c[1] = \"ab\";", "t.c", names.clone(), diags.clone());
        let mut session = Session::new(names, diags);
        let mut decls = Vec::new();
        let mut parser = Parser::new(&mut lexer, &mut session);
        assert!(parser.parse(&mut decls).is_err());
    }

    #[test]
    fn test_typedef() {
        let parsed = parse_source("typedef long myint; myint x = 3;");
        assert_eq!(parsed.errors, 0);
        let name = parsed.session.intern("x");
        let (_, index) = parsed.session.scope_find(GLOBAL_SCOPE, name).unwrap();
        assert_eq!(parsed.session.var(GLOBAL_SCOPE, index).ty, Type::LONG);
    }

    #[test]
    fn test_enum_constants() {
        let parsed = parse_source("enum E { A, B = 5, C }; int x = C;");
        assert_eq!(parsed.errors, 0);
        let name = parsed.session.intern("x");
        let (_, index) = parsed.session.scope_find(GLOBAL_SCOPE, name).unwrap();
        let var = parsed.session.var(GLOBAL_SCOPE, index);
        let InitKind::Single(e) = &var.global_init().unwrap().kind else { panic!() };
        assert_eq!(e.as_fixnum(), Some(6));
    }

    #[test]
    fn test_bitfields_rejected() {
        let parsed = parse_source("struct B { int x : 3; };");
        assert!(parsed.errors > 0);
    }

    #[test]
    fn test_address_taken_marks_variable() {
        let parsed = parse_source("int f(void) { int x = 0; int *p = &x; return *p; }");
        assert_eq!(parsed.errors, 0);
        let func = first_func(&parsed);
        let mut found = false;
        for scope in &func.scopes {
            for var in &parsed.session.scope(*scope).vars {
                if parsed.session.name_str(var.name) == "x" {
                    assert!(var.ref_taken);
                    found = true;
                }
            }
        }
        assert!(found);
    }

    #[test]
    fn test_undeclared_identifier_recovers() {
        let parsed = parse_source("int f(void) { return nope; }");
        assert_eq!(parsed.errors, 1);
    }

    #[test]
    fn test_function_redefinition_reported() {
        let parsed = parse_source("int f(void) { return 0; } int f(void) { return 1; }");
        assert_eq!(parsed.errors, 1);
    }

    #[test]
    fn test_anonymous_struct_member_access() {
        let parsed = parse_source(
            "struct Outer { struct { int inner; }; int tail; };\n\
             int f(struct Outer *o) { return o->inner + o->tail; }",
        );
        assert_eq!(parsed.errors, 0);
    }

    #[test]
    fn test_string_in_struct_char_ptr_member() {
        let parsed = parse_source("struct S { char *s; }; struct S v = { \"hey\" };");
        assert_eq!(parsed.errors, 0);
    }

    #[test]
    fn test_compound_literal() {
        let parsed = parse_source(
            "struct P { int x, y; };\n\
             int f(void) { struct P p = (struct P){1, 2}; return p.x; }",
        );
        assert_eq!(parsed.errors, 0);
    }

    #[test]
    fn test_static_local_gets_shadow_global() {
        let parsed = parse_source("int counter(void) { static int n = 3; return ++n; }");
        assert_eq!(parsed.errors, 0);
        let func = first_func(&parsed);
        let mut shadow = None;
        for scope in &func.scopes {
            for var in &parsed.session.scope(*scope).vars {
                if let VarPlace::Local { static_gvar: Some(label) } = &var.place {
                    shadow = Some(*label);
                }
            }
        }
        let label = shadow.expect("static local has no shadow global");
        let (scope, index) = parsed.session.scope_find(GLOBAL_SCOPE, label).unwrap();
        assert!(scope.is_global());
        assert!(parsed.session.var(scope, index).global_init().is_some());
    }
}
