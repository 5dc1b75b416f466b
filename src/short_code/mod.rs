mod emoji;
pub use emoji::*;

/// Number of SAS bytes derived from the shared secret.
pub const SAS_BYTES_LENGTH: usize = 6;

/// The format a short authentication string is rendered in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SasMode {
    /// Three four-digit numbers.
    Decimal,
    /// Seven emoji.
    Emoji,
}

impl SasMode {
    /// Returns the wire value of this mode.
    pub fn value(&self) -> &'static str {
        match self {
            Self::Decimal => "decimal",
            Self::Emoji => "emoji",
        }
    }

    /// Parses a wire value.
    pub fn from_value(value: &str) -> Option<Self> {
        match value {
            "decimal" => Some(Self::Decimal),
            "emoji" => Some(Self::Emoji),
            _ => None,
        }
    }
}

/// Renders the first five SAS bytes as three numbers between 1000 and 9191.
///
/// Each number carries 13 bits; the last bit of the fifth byte is unused.
pub fn decimal_code(bytes: &[u8]) -> Option<String> {
    let prefix: [u8; 5] = bytes.get(..5)?.try_into().ok()?;
    let [b0, b1, b2, b3, b4] = prefix.map(u16::from);

    let first = (b0 << 5 | b1 >> 3) + 1000;
    let second = ((b1 & 0x7) << 10 | b2 << 2 | b3 >> 6) + 1000;
    let third = ((b3 & 0x3f) << 7 | b4 >> 1) + 1000;

    Some(format!("{first} {second} {third}"))
}

/// Renders the first six SAS bytes as seven emoji, one per 6-bit group.
pub fn emoji_code(bytes: &[u8]) -> Option<Vec<EmojiRepresentation>> {
    let bytes = bytes.get(..SAS_BYTES_LENGTH)?;
    let bits = bytes
        .iter()
        .fold(0u64, |acc, byte| acc << 8 | u64::from(*byte));

    // 48 bits, the first 42 are used.
    let emojis = (0..7)
        .map(|i| {
            let index = (bits >> (42 - 6 * i)) & 0x3f;
            EMOJI_TABLE[index as usize]
        })
        .collect();

    Some(emojis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decimal_code_bounds() {
        assert_eq!(decimal_code(&[0x00; 5]).unwrap(), "1000 1000 1000");
        assert_eq!(decimal_code(&[0xFF; 5]).unwrap(), "9191 9191 9191");
    }

    #[test]
    fn test_decimal_code_mixed_bits() {
        // 0b00000001 0b00000010 ... exercises every shift boundary.
        let code = decimal_code(&[0x01, 0x02, 0x03, 0x04, 0x05]).unwrap();
        let expected = format!(
            "{} {} {}",
            (1 << 5 | 2 >> 3) + 1000,
            ((2 & 7) << 10 | 3 << 2 | 4 >> 6) + 1000,
            ((4 & 0x3f) << 7 | 5 >> 1) + 1000
        );
        assert_eq!(code, expected);
        assert_eq!(code, "1032 3060 1514");
    }

    #[test]
    fn test_decimal_code_needs_five_bytes() {
        assert!(decimal_code(&[1, 2, 3, 4]).is_none());
        assert!(decimal_code(&[1, 2, 3, 4, 5, 6]).is_some());
    }

    #[test]
    fn test_emoji_code() {
        let all_dogs = emoji_code(&[0x00; 6]).unwrap();
        assert_eq!(all_dogs.len(), 7);
        assert!(all_dogs.iter().all(|e| e.name == "Dog"));

        let all_pins = emoji_code(&[0xFF; 6]).unwrap();
        assert!(all_pins.iter().all(|e| e.name == "Pin"));

        // 000001 000010 000011 ... first groups pick Cat, Lion, Horse.
        let code = emoji_code(&[0x04, 0x20, 0xC4, 0x00, 0x00, 0x00]).unwrap();
        let names: Vec<_> = code.iter().take(4).map(|e| e.name).collect();
        assert_eq!(names, ["Cat", "Lion", "Horse", "Unicorn"]);

        assert!(emoji_code(&[0; 5]).is_none());
    }

    #[test]
    fn test_sas_mode_values() {
        assert_eq!(SasMode::from_value("emoji"), Some(SasMode::Emoji));
        assert_eq!(SasMode::from_value(SasMode::Decimal.value()), Some(SasMode::Decimal));
        assert_eq!(SasMode::from_value("hex"), None);
    }
}
