//! Value types for the loop IR.
//!
//! Two layers:
//! - **`BasicType`**: primitive element types that can occupy a vector lane
//! - **`ValueType`**: what a node produces (a scalar, a vector, an address,
//!   or one of the non-value tokens used for ordering)
//!
//! Element sizes drive alignment arithmetic in the vectorizer, so they are
//! exposed as plain integers rather than hidden behind the lattice.

use std::fmt;

// =============================================================================
// Basic (Element) Types
// =============================================================================

/// A primitive type that fits in one vector lane.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum BasicType {
    Boolean = 0,
    Byte = 1,
    Char = 2,
    Short = 3,
    Int = 4,
    Long = 5,
    Float = 6,
    Double = 7,
}

impl BasicType {
    /// Every element type, smallest first.
    pub const ALL: [BasicType; 8] = [
        BasicType::Boolean,
        BasicType::Byte,
        BasicType::Char,
        BasicType::Short,
        BasicType::Int,
        BasicType::Long,
        BasicType::Float,
        BasicType::Double,
    ];

    /// Size of one lane in bytes.
    #[inline]
    pub const fn size_in_bytes(self) -> i32 {
        match self {
            BasicType::Boolean | BasicType::Byte => 1,
            BasicType::Char | BasicType::Short => 2,
            BasicType::Int | BasicType::Float => 4,
            BasicType::Long | BasicType::Double => 8,
        }
    }

    /// log2 of the lane size.
    #[inline]
    pub const fn log2_size(self) -> u32 {
        self.size_in_bytes().trailing_zeros()
    }

    /// Narrower than `Int`; arithmetic on these happens in `Int` registers.
    #[inline]
    pub const fn is_subword(self) -> bool {
        matches!(
            self,
            BasicType::Boolean | BasicType::Byte | BasicType::Char | BasicType::Short
        )
    }

    #[inline]
    pub const fn is_integral(self) -> bool {
        !self.is_floating()
    }

    #[inline]
    pub const fn is_floating(self) -> bool {
        matches!(self, BasicType::Float | BasicType::Double)
    }

    /// The register type scalar arithmetic on this element uses.
    #[inline]
    pub const fn promoted(self) -> BasicType {
        if self.is_subword() {
            BasicType::Int
        } else {
            self
        }
    }

    /// Short lowercase name used in traces.
    pub const fn name(self) -> &'static str {
        match self {
            BasicType::Boolean => "bool",
            BasicType::Byte => "byte",
            BasicType::Char => "char",
            BasicType::Short => "short",
            BasicType::Int => "int",
            BasicType::Long => "long",
            BasicType::Float => "float",
            BasicType::Double => "double",
        }
    }
}

impl fmt::Display for BasicType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Vector Types
// =============================================================================

/// `lanes` elements of type `elem` in one register.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VectorType {
    pub elem: BasicType,
    pub lanes: u8,
}

impl VectorType {
    #[inline]
    pub const fn new(elem: BasicType, lanes: u8) -> Self {
        Self { elem, lanes }
    }

    /// Total register footprint.
    #[inline]
    pub const fn size_in_bytes(self) -> i32 {
        self.elem.size_in_bytes() * self.lanes as i32
    }
}

impl fmt::Display for VectorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} x {}>", self.lanes, self.elem)
    }
}

// =============================================================================
// Node Output Types
// =============================================================================

/// What a node produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum ValueType {
    /// No value (dead or not yet typed).
    #[default]
    Top,
    /// Control token.
    Control,
    /// Memory state for one alias slice.
    Memory,
    /// Raw or derived pointer.
    Address,
    /// Condition codes produced by a compare.
    Flags,
    /// A primitive value.
    Scalar(BasicType),
    /// A packed vector.
    Vector(VectorType),
}

impl ValueType {
    pub const INT: ValueType = ValueType::Scalar(BasicType::Int);
    pub const LONG: ValueType = ValueType::Scalar(BasicType::Long);
    pub const BOOL: ValueType = ValueType::Scalar(BasicType::Boolean);

    /// Element type for scalars and vectors.
    #[inline]
    pub const fn basic_type(self) -> Option<BasicType> {
        match self {
            ValueType::Scalar(bt) => Some(bt),
            ValueType::Vector(vt) => Some(vt.elem),
            _ => None,
        }
    }

    #[inline]
    pub const fn is_vector(self) -> bool {
        matches!(self, ValueType::Vector(_))
    }

    #[inline]
    pub const fn is_memory(self) -> bool {
        matches!(self, ValueType::Memory)
    }

    #[inline]
    pub const fn is_control(self) -> bool {
        matches!(self, ValueType::Control)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Top => f.write_str("top"),
            ValueType::Control => f.write_str("ctrl"),
            ValueType::Memory => f.write_str("mem"),
            ValueType::Address => f.write_str("ptr"),
            ValueType::Flags => f.write_str("flags"),
            ValueType::Scalar(bt) => write!(f, "{}", bt),
            ValueType::Vector(vt) => write!(f, "{}", vt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        assert_eq!(BasicType::Byte.size_in_bytes(), 1);
        assert_eq!(BasicType::Char.size_in_bytes(), 2);
        assert_eq!(BasicType::Float.size_in_bytes(), 4);
        assert_eq!(BasicType::Long.size_in_bytes(), 8);
        assert_eq!(BasicType::Long.log2_size(), 3);
        assert_eq!(BasicType::Byte.log2_size(), 0);
    }

    #[test]
    fn test_subword_promotion() {
        assert!(BasicType::Short.is_subword());
        assert!(!BasicType::Int.is_subword());
        assert_eq!(BasicType::Byte.promoted(), BasicType::Int);
        assert_eq!(BasicType::Double.promoted(), BasicType::Double);
        assert!(BasicType::Char.is_integral());
        assert!(BasicType::Float.is_floating());
    }

    #[test]
    fn test_vector_type() {
        let vt = VectorType::new(BasicType::Int, 8);
        assert_eq!(vt.size_in_bytes(), 32);
        assert_eq!(vt.to_string(), "<8 x int>");
        assert_eq!(ValueType::Vector(vt).basic_type(), Some(BasicType::Int));
        assert_eq!(ValueType::Memory.basic_type(), None);
    }
}
