//! Generators for deliberately malformed UTF-8 byte sequences.
//!
//! Mock responses sometimes need to exercise a client's handling of broken
//! encodings. Each [`InvalidUtf8Kind`] produces a short byte sequence that
//! fails UTF-8 validation in a specific way; [`generate_valid_utf8`] is the
//! well-formed counterpart used when no kind is requested.

use rand::Rng;

/// The kinds of malformed sequences the `invalidUTF8` helper can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidUtf8Kind {
    /// A lead byte with no continuation bytes.
    IncompleteSequence,
    /// A lone continuation byte.
    ContinuationByteOnly,
    /// An overlong two-byte encoding of a one-byte code point.
    OverlongSequence,
    /// A byte outside any valid UTF-8 range (0xF5..=0xFF).
    InvalidByteRange,
    /// An encoded UTF-16 surrogate half.
    SurrogateHalf,
    /// Random bytes re-rolled until invalid.
    RandomInvalid,
}

impl std::str::FromStr for InvalidUtf8Kind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incomplete" => Ok(InvalidUtf8Kind::IncompleteSequence),
            "continuation" => Ok(InvalidUtf8Kind::ContinuationByteOnly),
            "overlong" => Ok(InvalidUtf8Kind::OverlongSequence),
            "invalid_range" => Ok(InvalidUtf8Kind::InvalidByteRange),
            "surrogate" => Ok(InvalidUtf8Kind::SurrogateHalf),
            "random" => Ok(InvalidUtf8Kind::RandomInvalid),
            _ => Err(()),
        }
    }
}

/// Generate a byte sequence that is not valid UTF-8.
pub fn generate_invalid_utf8(kind: InvalidUtf8Kind) -> Vec<u8> {
    let mut rng = rand::thread_rng();

    let bytes = match kind {
        InvalidUtf8Kind::IncompleteSequence => vec![0xC0 + rng.gen_range(0..0x20) as u8],
        InvalidUtf8Kind::ContinuationByteOnly => vec![0x80 + rng.gen_range(0..0x40) as u8],
        InvalidUtf8Kind::OverlongSequence => vec![0xC0, 0x81],
        InvalidUtf8Kind::InvalidByteRange => vec![0xF5 + rng.gen_range(0..0x0B) as u8],
        InvalidUtf8Kind::SurrogateHalf => vec![0xED, 0xA0 + rng.gen_range(0..0x20) as u8],
        InvalidUtf8Kind::RandomInvalid => {
            let len = rng.gen_range(1..=4);
            let mut bytes: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            while std::str::from_utf8(&bytes).is_ok() {
                bytes[0] = rng.gen();
            }
            bytes
        }
    };

    // Every arm above must stay invalid; 0xC0 0x80 is the safety net.
    if std::str::from_utf8(&bytes).is_ok() {
        return vec![0xC0, 0x80];
    }
    bytes
}

/// Look up a kind by its descriptor name; unknown names map to `random`.
pub fn generate_by_type_name(name: &str) -> Vec<u8> {
    let kind = name
        .parse::<InvalidUtf8Kind>()
        .unwrap_or(InvalidUtf8Kind::RandomInvalid);
    generate_invalid_utf8(kind)
}

/// Generate a random well-formed UTF-8 string of 5 to 24 characters.
pub fn generate_valid_utf8() -> String {
    const CHARS: &[char] = &[
        'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R',
        'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j',
        'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1',
        '2', '3', '4', '5', '6', '7', '8', '9', ' ', '!', '@', '#', '$', '%', '^', '&', '*', '(',
        ')', '-', '_', '=', '+', 'á', 'é', 'í', 'ó', 'ú', 'ñ', 'Ñ', 'ü', 'Ü', '€', '£', '¥', '©',
        '®', '™',
    ];

    let mut rng = rand::thread_rng();
    let len = rng.gen_range(5..25);
    (0..len).map(|_| CHARS[rng.gen_range(0..CHARS.len())]).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_kinds_produce_invalid_utf8() {
        let kinds = [
            InvalidUtf8Kind::IncompleteSequence,
            InvalidUtf8Kind::ContinuationByteOnly,
            InvalidUtf8Kind::OverlongSequence,
            InvalidUtf8Kind::InvalidByteRange,
            InvalidUtf8Kind::SurrogateHalf,
            InvalidUtf8Kind::RandomInvalid,
        ];
        for kind in kinds {
            for _ in 0..50 {
                let bytes = generate_invalid_utf8(kind);
                assert!(
                    std::str::from_utf8(&bytes).is_err(),
                    "{kind:?} produced valid UTF-8: {bytes:x?}"
                );
            }
        }
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!(
            "overlong".parse::<InvalidUtf8Kind>(),
            Ok(InvalidUtf8Kind::OverlongSequence)
        );
        assert_eq!(
            "surrogate".parse::<InvalidUtf8Kind>(),
            Ok(InvalidUtf8Kind::SurrogateHalf)
        );
        assert!("bogus".parse::<InvalidUtf8Kind>().is_err());
    }

    #[test]
    fn test_unknown_name_falls_back_to_random() {
        let bytes = generate_by_type_name("definitely-not-a-kind");
        assert!(std::str::from_utf8(&bytes).is_err());
    }

    #[test]
    fn test_valid_utf8_is_valid() {
        for _ in 0..20 {
            let s = generate_valid_utf8();
            assert!(s.chars().count() >= 5);
            assert!(s.chars().count() < 25);
        }
    }
}
