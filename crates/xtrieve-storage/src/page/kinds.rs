//! Page kinds.

use std::fmt;

/// The closed set of page kinds a file may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PageKind {
    /// On the free chain, available for reallocation.
    Free = 0,
    /// File Control Record: always page 0, never anywhere else.
    Fcr = 1,
    /// Slotted page holding record fixed portions.
    Data = 2,
    /// B+ tree node, internal or leaf.
    Index = 3,
    /// Overflow fragment of a variable-length record tail.
    Variable = 4,
}

impl PageKind {
    /// Decodes a raw kind tag.
    #[inline]
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Free),
            1 => Some(Self::Fcr),
            2 => Some(Self::Data),
            3 => Some(Self::Index),
            4 => Some(Self::Variable),
            _ => None,
        }
    }

    /// True for pages that hold user record bytes.
    #[inline]
    #[must_use]
    pub const fn holds_records(self) -> bool {
        matches!(self, Self::Data | Self::Variable)
    }
}

impl fmt::Display for PageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Free => "Free",
            Self::Fcr => "FCR",
            Self::Data => "Data",
            Self::Index => "Index",
            Self::Variable => "Variable",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip() {
        for kind in [
            PageKind::Free,
            PageKind::Fcr,
            PageKind::Data,
            PageKind::Index,
            PageKind::Variable,
        ] {
            assert_eq!(PageKind::from_u8(kind as u8), Some(kind));
        }
        assert_eq!(PageKind::from_u8(9), None);
    }

    #[test]
    fn test_holds_records() {
        assert!(PageKind::Data.holds_records());
        assert!(PageKind::Variable.holds_records());
        assert!(!PageKind::Index.holds_records());
        assert!(!PageKind::Fcr.holds_records());
    }
}
