//! Register specifiers: `"0x10[7:6]"`
//!
//! A specifier names a register address and an inclusive bit range inside it.
//! The address is decimal or `0x`-prefixed hexadecimal; bit indices are
//! decimal and zero-based. Parsing either yields a fully validated
//! [`RegisterSpec`] or fails, so nothing malformed ever reaches the bus.

use crate::bus::RegisterAddress;
use crate::error::{AppResult, LabError};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::str::FromStr;

static SPEC_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(0[xX][0-9a-fA-F]+|[0-9]+)\[([0-9]+):([0-9]+)\]$")
        .expect("Invalid register specifier regex")
});

/// Bit width assumed by [`RegisterSpec::parse`].
pub const BYTE_REGISTER_BITS: u32 = 8;

/// Inclusive, zero-based bit range `[high:low]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BitRange {
    high: u32,
    low: u32,
}

/// All ones in the lowest `bits` bits.
pub(crate) fn low_ones(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

impl BitRange {
    /// Range covering bits `low..=high`.
    pub fn new(high: u32, low: u32) -> AppResult<Self> {
        if low > high {
            return Err(LabError::InvalidRegisterSpec {
                spec: format!("[{}:{}]", high, low),
                reason: "low bit index is greater than high bit index".to_string(),
            });
        }
        if high >= 64 {
            return Err(LabError::InvalidRegisterSpec {
                spec: format!("[{}:{}]", high, low),
                reason: "bit index exceeds 63".to_string(),
            });
        }
        Ok(Self { high, low })
    }

    /// Highest bit index.
    pub fn high(&self) -> u32 {
        self.high
    }

    /// Lowest bit index.
    pub fn low(&self) -> u32 {
        self.low
    }

    /// Number of bits in the range.
    pub fn bits(&self) -> u32 {
        self.high - self.low + 1
    }

    /// Largest value the field can hold.
    pub fn max_value(&self) -> u64 {
        low_ones(self.bits())
    }

    /// Ones exactly on `[low, high]`, restricted to a `width_bits`-wide register.
    pub fn field_mask(&self, width_bits: u32) -> u64 {
        (self.max_value() << self.low) & low_ones(width_bits)
    }

    /// Ones everywhere in a `width_bits`-wide register except `[low, high]`.
    pub fn preserve_mask(&self, width_bits: u32) -> u64 {
        !self.field_mask(width_bits) & low_ones(width_bits)
    }

    /// Whether the whole range lies inside a `width_bits`-wide register.
    pub fn fits(&self, width_bits: u32) -> bool {
        self.high < width_bits
    }
}

impl fmt::Display for BitRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}]", self.high, self.low)
    }
}

/// A register address plus a bit range inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegisterSpec {
    /// Register address
    pub address: RegisterAddress,
    /// Field inside the register
    pub range: BitRange,
}

impl RegisterSpec {
    /// Spec for `range` inside register `address`.
    pub fn new(address: RegisterAddress, range: BitRange) -> Self {
        Self { address, range }
    }

    /// Parse a specifier for a byte-wide register.
    pub fn parse(text: &str) -> AppResult<Self> {
        Self::parse_with_width(text, BYTE_REGISTER_BITS)
    }

    /// Parse a specifier for a register `width_bits` wide.
    ///
    /// Surrounding whitespace is ignored. Fails with
    /// [`LabError::InvalidRegisterSpec`] on any other deviation from
    /// `<address>[<high>:<low>]`, when `low > high`, or when `high` does not fit
    /// the register.
    pub fn parse_with_width(text: &str, width_bits: u32) -> AppResult<Self> {
        let invalid = |reason: String| LabError::InvalidRegisterSpec {
            spec: text.to_string(),
            reason,
        };

        let trimmed = text.trim();
        let caps = SPEC_PATTERN
            .captures(trimmed)
            .ok_or_else(|| invalid("expected <address>[<high>:<low>], e.g. 0x10[7:6]".into()))?;

        let address = parse_address(&caps[1])
            .ok_or_else(|| invalid(format!("register address '{}' is out of range", &caps[1])))?;
        let high: u32 = caps[2]
            .parse()
            .map_err(|_| invalid(format!("bit index '{}' is out of range", &caps[2])))?;
        let low: u32 = caps[3]
            .parse()
            .map_err(|_| invalid(format!("bit index '{}' is out of range", &caps[3])))?;

        if low > high {
            return Err(invalid(format!(
                "low bit {} is greater than high bit {}",
                low, high
            )));
        }
        if high >= width_bits {
            return Err(invalid(format!(
                "bit {} is outside a {}-bit register",
                high, width_bits
            )));
        }

        let range = BitRange::new(high, low).map_err(|e| invalid(e.to_string()))?;
        Ok(Self { address, range })
    }
}

fn parse_address(text: &str) -> Option<RegisterAddress> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => RegisterAddress::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

impl FromStr for RegisterSpec {
    type Err = LabError;

    fn from_str(s: &str) -> AppResult<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for RegisterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}{}", self.address, self.range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_address() {
        let spec: RegisterSpec = "0x10[7:6]".parse().unwrap();
        assert_eq!(spec.address, 0x10);
        assert_eq!(spec.range.high(), 7);
        assert_eq!(spec.range.low(), 6);
    }

    #[test]
    fn test_parse_decimal_address() {
        let spec = RegisterSpec::parse("16[3:0]").unwrap();
        assert_eq!(spec.address, 16);
        assert_eq!(spec.range.bits(), 4);
    }

    #[test]
    fn test_parse_ignores_surrounding_whitespace() {
        let spec = RegisterSpec::parse("  0X1f[0:0]\n").unwrap();
        assert_eq!(spec.address, 0x1F);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for text in [
            "0x10[3:5]",
            "0x10",
            "0x10[7:6",
            "reg[7:6]",
            "0x10[7:6]x",
            "0x10 [7:6]",
            "0x10[8:0]",
            "0x[1:0]",
            "",
        ] {
            let err = RegisterSpec::parse(text).unwrap_err();
            assert!(
                matches!(err, LabError::InvalidRegisterSpec { .. }),
                "{:?} should be rejected",
                text
            );
        }
    }

    #[test]
    fn test_parse_with_wider_register() {
        assert!(RegisterSpec::parse("0x02[15:8]").is_err());
        let spec = RegisterSpec::parse_with_width("0x02[15:8]", 16).unwrap();
        assert_eq!(spec.range.max_value(), 0xFF);
    }

    #[test]
    fn test_masks_are_complementary() {
        for high in 0..8 {
            for low in 0..=high {
                let range = BitRange::new(high, low).unwrap();
                let field = range.field_mask(8);
                let preserve = range.preserve_mask(8);
                assert_eq!(field | preserve, 0xFF);
                assert_eq!(field & preserve, 0);
                assert_eq!(field.count_ones(), high - low + 1);
                // Contiguous: shifting out the low zeros leaves a run of ones.
                assert_eq!((field >> low) + 1, 1 << (high - low + 1));
            }
        }
    }

    #[test]
    fn test_full_width_64_bit_masks() {
        let range = BitRange::new(63, 0).unwrap();
        assert_eq!(range.field_mask(64), u64::MAX);
        assert_eq!(range.preserve_mask(64), 0);
    }

    #[test]
    fn test_display() {
        let spec = RegisterSpec::parse("0x10[7:6]").unwrap();
        assert_eq!(spec.to_string(), "0x10[7:6]");
    }
}
