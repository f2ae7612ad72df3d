use std::fmt;

/// Reasons a size or address string is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SizeError {
    /// Nothing but whitespace.
    Empty,
    /// Digits or suffix did not parse.
    Malformed(String),
    /// The value does not fit in 64 bits.
    Overflow(String),
}

impl fmt::Display for SizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("empty size"),
            Self::Malformed(text) => write!(f, "malformed size `{text}`"),
            Self::Overflow(text) => write!(f, "size `{text}` overflows 64 bits"),
        }
    }
}

impl std::error::Error for SizeError {}

/// Parses a byte count: plain decimal, `0x` hex, or decimal with a binary
/// `K`/`M`/`G`/`T` suffix (an optional trailing `B` or `iB` is accepted).
///
/// # Errors
///
/// Returns [`SizeError`] for empty, malformed, or overflowing input.
pub fn parse_size(text: &str) -> Result<u64, SizeError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(SizeError::Empty);
    }
    let malformed = || SizeError::Malformed(trimmed.to_owned());
    if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        return u64::from_str_radix(&hex.replace('_', ""), 16).map_err(|_| malformed());
    }

    let upper = trimmed.to_ascii_uppercase();
    let unit = upper
        .strip_suffix("IB")
        .or_else(|| upper.strip_suffix('B'))
        .unwrap_or(&upper);
    let (digits, shift) = match unit.chars().last() {
        Some('K') => (&unit[..unit.len() - 1], 10),
        Some('M') => (&unit[..unit.len() - 1], 20),
        Some('G') => (&unit[..unit.len() - 1], 30),
        Some('T') => (&unit[..unit.len() - 1], 40),
        _ => (unit, 0),
    };
    let digits = digits.replace('_', "");
    if digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(malformed());
    }
    let value: u64 = digits
        .parse()
        .map_err(|_| SizeError::Overflow(trimmed.to_owned()))?;
    value
        .checked_mul(1_u64 << shift)
        .ok_or_else(|| SizeError::Overflow(trimmed.to_owned()))
}
