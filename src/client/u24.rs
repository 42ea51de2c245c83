//! Minimal u24 representation, just enough to model RFC 7641 Observe sequence numbers.

use std::fmt::{Debug, Display, Formatter};

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[allow(non_camel_case_types)]
pub struct u24(u32);

impl Display for u24 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Debug for u24 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

impl TryFrom<u32> for u24 {
    type Error = TryFromCustomIntError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        if value > 0xffffff {
            Err(TryFromCustomIntError)
        } else {
            Ok(u24(value))
        }
    }
}

impl From<u24> for u32 {
    fn from(value: u24) -> Self {
        value.0
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TryFromCustomIntError;

impl Display for TryFromCustomIntError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("out of range integral type conversion attempted")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range() {
        assert!(u24::try_from(0x1000000u32).is_err());
        assert_eq!(u32::from(u24::try_from(0xffffffu32).unwrap()), 0xffffff);
        assert_eq!(u32::from(u24::try_from(0u32).unwrap()), 0);
    }

    #[test]
    fn test_display_matches_inner() {
        let value = u24::try_from(12345u32).unwrap();
        assert_eq!(value.to_string(), "12345");
        assert_eq!(format!("{value:?}"), "12345");
    }
}
