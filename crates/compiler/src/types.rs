//! C type model and layout.
//!
//! Types are structural values; struct/union bodies live behind a shared,
//! lazily completed cell so a forward-declared tag and every pointer to it
//! resolve together when the definition is finally seen. Layout (size,
//! align, member offsets) is computed when a struct body is installed.

use std::cell::RefCell;
use std::rc::Rc;

use crate::symbols::Name;

/// Integer kinds, narrowest to widest. `Enum` lays out as `int`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FixnumKind {
    Char,
    Short,
    Int,
    Long,
    LongLong,
    Enum,
}

impl FixnumKind {
    pub fn size(self) -> usize {
        match self {
            FixnumKind::Char => 1,
            FixnumKind::Short => 2,
            FixnumKind::Int | FixnumKind::Enum => 4,
            FixnumKind::Long | FixnumKind::LongLong => 8,
        }
    }

    /// Conversion rank; `Enum` ranks as `Int`.
    pub(crate) fn rank(self) -> u32 {
        match self {
            FixnumKind::Char => 0,
            FixnumKind::Short => 1,
            FixnumKind::Int | FixnumKind::Enum => 2,
            FixnumKind::Long => 3,
            FixnumKind::LongLong => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlonumKind {
    Float,
    Double,
}

impl FlonumKind {
    pub fn size(self) -> usize {
        match self {
            FlonumKind::Float => 4,
            FlonumKind::Double => 8,
        }
    }
}

/// One struct/union member. Offsets are filled in by [`StructInfo::layout`].
#[derive(Debug, Clone)]
pub struct MemberInfo {
    pub name: Option<Name>,
    pub ty: Type,
    pub offset: usize,
}

/// Completed struct or union body.
#[derive(Debug, Clone)]
pub struct StructInfo {
    pub members: Vec<MemberInfo>,
    pub is_union: bool,
    pub size: usize,
    pub align: usize,
}

impl StructInfo {
    /// Lay members out in order: unions overlap at offset 0; structs round
    /// each member up to its alignment, and the total up to the max.
    pub fn layout(mut members: Vec<MemberInfo>, is_union: bool) -> StructInfo {
        let mut size = 0usize;
        let mut align = 1usize;
        for member in &mut members {
            let msize = member.ty.size();
            let malign = member.ty.align().max(1);
            align = align.max(malign);
            if is_union {
                member.offset = 0;
                size = size.max(msize);
            } else {
                size = (size + malign - 1) / malign * malign;
                member.offset = size;
                size += msize;
            }
        }
        size = (size + align - 1) / align * align;
        StructInfo { members, is_union, size, align }
    }

    pub fn find_member(&self, name: Name) -> Option<usize> {
        self.members.iter().position(|m| m.name == Some(name))
    }
}

/// Reference to a (possibly not yet completed) struct body. Cloning
/// shares the cell; completing the tag completes every reference.
#[derive(Debug, Clone)]
pub struct StructRef {
    pub name: Option<Name>,
    pub info: Rc<RefCell<Option<StructInfo>>>,
    pub is_union: bool,
}

impl StructRef {
    pub fn new(name: Option<Name>, is_union: bool) -> StructRef {
        StructRef { name, info: Rc::new(RefCell::new(None)), is_union }
    }

    pub fn completed(&self) -> bool {
        self.info.borrow().is_some()
    }
}

impl PartialEq for StructRef {
    fn eq(&self, other: &Self) -> bool {
        if Rc::ptr_eq(&self.info, &other.info) {
            return true;
        }
        match (self.name, other.name) {
            (Some(a), Some(b)) => a == b && self.is_union == other.is_union,
            _ => false,
        }
    }
}

/// Function signature. `params` holds declared parameter types after
/// array/function decay; `None` marks an old-style declaration with an
/// unspecified parameter list.
#[derive(Debug, Clone, PartialEq)]
pub struct FuncType {
    pub ret: Type,
    pub params: Option<Vec<Type>>,
    pub vaargs: bool,
}

/// An unsized array carries this in place of a length.
pub const ARRAY_LEN_UNSIZED: isize = -1;

#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    Void,
    Fixnum { kind: FixnumKind, unsigned: bool },
    Flonum(FlonumKind),
    Ptr(Box<Type>),
    Array { elem: Box<Type>, len: isize },
    Func(Rc<FuncType>),
    Struct(StructRef),
}

pub fn ptrof(ty: &Type) -> Type {
    Type::Ptr(Box::new(ty.clone()))
}

impl Type {
    pub const CHAR: Type = Type::Fixnum { kind: FixnumKind::Char, unsigned: false };
    pub const INT: Type = Type::Fixnum { kind: FixnumKind::Int, unsigned: false };
    pub const LONG: Type = Type::Fixnum { kind: FixnumKind::Long, unsigned: false };
    /// Type used for sizes and pointer differences.
    pub const SIZE_T: Type = Type::Fixnum { kind: FixnumKind::Long, unsigned: true };
    pub const SSIZE_T: Type = Type::Fixnum { kind: FixnumKind::Long, unsigned: false };
    pub const DOUBLE: Type = Type::Flonum(FlonumKind::Double);

    pub fn size(&self) -> usize {
        match self {
            Type::Void => 1,
            Type::Fixnum { kind, .. } => kind.size(),
            Type::Flonum(kind) => kind.size(),
            Type::Ptr(_) => 8,
            Type::Array { elem, len } => {
                if *len < 0 { 0 } else { elem.size() * (*len as usize) }
            }
            Type::Func(_) => 1,
            Type::Struct(sref) => sref.info.borrow().as_ref().map_or(0, |i| i.size),
        }
    }

    pub fn align(&self) -> usize {
        match self {
            Type::Void => 1,
            Type::Fixnum { kind, .. } => kind.size(),
            Type::Flonum(kind) => kind.size(),
            Type::Ptr(_) => 8,
            Type::Array { elem, .. } => elem.align(),
            Type::Func(_) => 1,
            Type::Struct(sref) => sref.info.borrow().as_ref().map_or(1, |i| i.align),
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Type::Void)
    }

    pub fn is_fixnum(&self) -> bool {
        matches!(self, Type::Fixnum { .. })
    }

    pub fn is_flonum(&self) -> bool {
        matches!(self, Type::Flonum(_))
    }

    pub fn is_number(&self) -> bool {
        self.is_fixnum() || self.is_flonum()
    }

    pub fn is_unsigned(&self) -> bool {
        matches!(self, Type::Fixnum { unsigned: true, .. })
    }

    pub fn is_char_type(&self) -> bool {
        matches!(self, Type::Fixnum { kind: FixnumKind::Char, .. })
    }

    pub fn is_ptr(&self) -> bool {
        matches!(self, Type::Ptr(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Type::Array { .. })
    }

    pub fn is_func(&self) -> bool {
        matches!(self, Type::Func(_))
    }

    pub fn is_struct(&self) -> bool {
        matches!(self, Type::Struct(_))
    }

    /// Pointee / element type for pointers and arrays.
    pub fn pointee(&self) -> Option<&Type> {
        match self {
            Type::Ptr(inner) => Some(inner),
            Type::Array { elem, .. } => Some(elem),
            _ => None,
        }
    }

    pub fn struct_ref(&self) -> Option<&StructRef> {
        match self {
            Type::Struct(sref) => Some(sref),
            _ => None,
        }
    }

    pub fn func_type(&self) -> Option<&Rc<FuncType>> {
        match self {
            Type::Func(ft) => Some(ft),
            Type::Ptr(inner) => match inner.as_ref() {
                Type::Func(ft) => Some(ft),
                _ => None,
            },
            _ => None,
        }
    }

    /// `T[]`/`T[n]` used as a value: `T*`.
    pub fn array_to_ptr(&self) -> Type {
        match self {
            Type::Array { elem, .. } => Type::Ptr(elem.clone()),
            _ => self.clone(),
        }
    }

    /// Integer promotion: anything narrower than `int` becomes `int`;
    /// enum values compute as `int`.
    pub fn promoted(&self) -> Type {
        match self {
            Type::Fixnum { kind, .. } => {
                if kind.rank() <= FixnumKind::Int.rank() && *kind != FixnumKind::Int {
                    // Both char and short fit in int, so the promoted type
                    // is signed regardless of the source signedness.
                    Type::INT
                } else {
                    self.clone()
                }
            }
            _ => self.clone(),
        }
    }

    /// Short human-readable description for diagnostics.
    pub fn describe(&self) -> String {
        match self {
            Type::Void => "void".to_string(),
            Type::Fixnum { kind, unsigned } => {
                let base = match kind {
                    FixnumKind::Char => "char",
                    FixnumKind::Short => "short",
                    FixnumKind::Int => "int",
                    FixnumKind::Long => "long",
                    FixnumKind::LongLong => "long long",
                    FixnumKind::Enum => "enum",
                };
                if *unsigned { format!("unsigned {}", base) } else { base.to_string() }
            }
            Type::Flonum(FlonumKind::Float) => "float".to_string(),
            Type::Flonum(FlonumKind::Double) => "double".to_string(),
            Type::Ptr(inner) => format!("{}*", inner.describe()),
            Type::Array { elem, len } => {
                if *len < 0 {
                    format!("{}[]", elem.describe())
                } else {
                    format!("{}[{}]", elem.describe(), len)
                }
            }
            Type::Func(_) => "function".to_string(),
            Type::Struct(sref) => {
                if sref.is_union { "union".to_string() } else { "struct".to_string() }
            }
        }
    }
}

/// Structural type equality. `PartialEq` on [`Type`] already compares
/// structurally; this name keeps call sites aligned with the rest of the
/// front end.
pub fn same_type(a: &Type, b: &Type) -> bool {
    a == b
}

/// Whether `src` converts to `dst`. `src_zero` marks a constant-zero
/// source (valid as any pointer); `is_explicit` marks a cast written in
/// the source.
pub fn can_cast(dst: &Type, src: &Type, src_zero: bool, is_explicit: bool) -> bool {
    if same_type(dst, src) {
        return true;
    }
    match (dst, src) {
        (Type::Void, _) => is_explicit,
        (_, Type::Void) => false,
        (Type::Fixnum { .. }, Type::Fixnum { .. }) => true,
        (Type::Fixnum { .. }, Type::Flonum(_)) => true,
        (Type::Flonum(_), Type::Fixnum { .. }) => true,
        (Type::Flonum(_), Type::Flonum(_)) => true,
        (Type::Fixnum { .. }, Type::Ptr(_))
        | (Type::Fixnum { .. }, Type::Array { .. })
        | (Type::Fixnum { .. }, Type::Func(_)) => is_explicit,
        (Type::Ptr(_), Type::Fixnum { .. }) => is_explicit || src_zero,
        (Type::Ptr(d), Type::Ptr(s)) => {
            is_explicit
                || d.is_void()
                || s.is_void()
                || same_type(d, s)
                || (d.is_func() && s.is_func())
        }
        (Type::Ptr(d), Type::Array { elem, .. }) => {
            is_explicit || d.is_void() || same_type(d, elem)
        }
        (Type::Ptr(d), Type::Func(_)) => is_explicit || d.is_void() || same_type(d, src),
        (Type::Array { .. }, Type::Ptr(_)) => is_explicit,
        (Type::Struct(a), Type::Struct(b)) => a == b,
        _ => false,
    }
}

/// Usual arithmetic conversions for a binary operator's operands.
pub fn arith_result(lhs: &Type, rhs: &Type) -> Type {
    match (lhs, rhs) {
        (Type::Flonum(a), Type::Flonum(b)) => {
            if a.size() >= b.size() { lhs.clone() } else { rhs.clone() }
        }
        (Type::Flonum(_), _) => lhs.clone(),
        (_, Type::Flonum(_)) => rhs.clone(),
        _ => {
            let l = lhs.promoted();
            let r = rhs.promoted();
            let (Type::Fixnum { kind: lk, unsigned: lu }, Type::Fixnum { kind: rk, unsigned: ru }) =
                (&l, &r)
            else {
                return Type::INT;
            };
            if lu == ru {
                return if lk.rank() >= rk.rank() { l.clone() } else { r.clone() };
            }
            // Mixed signedness: unsigned wins at equal or greater rank,
            // otherwise the wider signed type absorbs the unsigned one.
            let (unsig, sig) = if *lu { (&l, &r) } else { (&r, &l) };
            let (Type::Fixnum { kind: uk, .. }, Type::Fixnum { kind: sk, .. }) = (unsig, sig)
            else {
                return Type::INT;
            };
            if uk.rank() >= sk.rank() {
                unsig.clone()
            } else if sk.size() > uk.size() {
                sig.clone()
            } else {
                Type::Fixnum { kind: *sk, unsigned: true }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_ty() -> Type {
        Type::INT
    }

    fn uint_ty() -> Type {
        Type::Fixnum { kind: FixnumKind::Int, unsigned: true }
    }

    #[test]
    fn test_scalar_layout() {
        assert_eq!(Type::CHAR.size(), 1);
        assert_eq!(Type::INT.size(), 4);
        assert_eq!(Type::LONG.size(), 8);
        assert_eq!(ptrof(&Type::CHAR).size(), 8);
        assert_eq!(Type::DOUBLE.align(), 8);
    }

    #[test]
    fn test_struct_layout_padding() {
        // struct { char c; int i; long l; } => offsets 0, 4, 8; size 16.
        let info = StructInfo::layout(
            vec![
                MemberInfo { name: None, ty: Type::CHAR, offset: 0 },
                MemberInfo { name: None, ty: Type::INT, offset: 0 },
                MemberInfo { name: None, ty: Type::LONG, offset: 0 },
            ],
            false,
        );
        assert_eq!(info.members[0].offset, 0);
        assert_eq!(info.members[1].offset, 4);
        assert_eq!(info.members[2].offset, 8);
        assert_eq!(info.size, 16);
        assert_eq!(info.align, 8);
    }

    #[test]
    fn test_union_layout() {
        let info = StructInfo::layout(
            vec![
                MemberInfo { name: None, ty: Type::CHAR, offset: 0 },
                MemberInfo { name: None, ty: Type::LONG, offset: 0 },
            ],
            true,
        );
        assert_eq!(info.members[1].offset, 0);
        assert_eq!(info.size, 8);
        assert_eq!(info.align, 8);
    }

    #[test]
    fn test_struct_tail_padding() {
        // struct { long l; char c; } => size rounds up to 16.
        let info = StructInfo::layout(
            vec![
                MemberInfo { name: None, ty: Type::LONG, offset: 0 },
                MemberInfo { name: None, ty: Type::CHAR, offset: 0 },
            ],
            false,
        );
        assert_eq!(info.size, 16);
    }

    #[test]
    fn test_promotion() {
        assert_eq!(Type::CHAR.promoted(), Type::INT);
        let ushort = Type::Fixnum { kind: FixnumKind::Short, unsigned: true };
        assert_eq!(ushort.promoted(), Type::INT);
        assert_eq!(Type::LONG.promoted(), Type::LONG);
    }

    #[test]
    fn test_usual_arith_widest_wins() {
        assert_eq!(arith_result(&int_ty(), &Type::LONG), Type::LONG);
        assert_eq!(arith_result(&Type::CHAR, &int_ty()), Type::INT);
        assert_eq!(arith_result(&int_ty(), &Type::DOUBLE), Type::DOUBLE);
    }

    #[test]
    fn test_usual_arith_signedness() {
        // unsigned int vs int: unsigned wins.
        assert_eq!(arith_result(&uint_ty(), &int_ty()), uint_ty());
        // unsigned int vs long: long can hold every unsigned int.
        assert_eq!(arith_result(&uint_ty(), &Type::LONG), Type::LONG);
        // unsigned long vs long: unsigned long wins.
        let ulong = Type::SIZE_T;
        assert_eq!(arith_result(&ulong, &Type::LONG), ulong);
    }

    #[test]
    fn test_can_cast_pointers() {
        let charp = ptrof(&Type::CHAR);
        let voidp = ptrof(&Type::Void);
        let intp = ptrof(&Type::INT);
        assert!(can_cast(&charp, &voidp, false, false));
        assert!(can_cast(&voidp, &intp, false, false));
        assert!(!can_cast(&charp, &intp, false, false));
        assert!(can_cast(&charp, &intp, false, true));
        // Constant zero converts to any pointer.
        assert!(can_cast(&charp, &Type::INT, true, false));
        assert!(!can_cast(&charp, &Type::INT, false, false));
    }

    #[test]
    fn test_incomplete_struct_resolves_through_clones() {
        let sref = StructRef::new(None, false);
        let ty = Type::Struct(sref.clone());
        let cloned = ty.clone();
        assert_eq!(cloned.size(), 0);
        *sref.info.borrow_mut() = Some(StructInfo::layout(
            vec![MemberInfo { name: None, ty: Type::INT, offset: 0 }],
            false,
        ));
        assert_eq!(cloned.size(), 4);
        assert!(same_type(&ty, &cloned));
    }
}
