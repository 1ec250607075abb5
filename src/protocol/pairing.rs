//! Pairing helpers: phone number checks, pairing code formatting and QR
//! rendering for terminal display.

use qrcode::{render::unicode, QrCode};
use thiserror::Error;

/// Number used when no usable owner number is configured.
pub const FALLBACK_PHONE_NUMBER: &str = "911234567890";

/// QR code errors.
#[derive(Debug, Clone, Error)]
pub enum QRError {
    #[error("QR generation failed: {0}")]
    GenerationFailed(String),
}

/// A phone number reduced to digits, with a flag telling whether it had to be
/// replaced by the fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoneNumber {
    pub digits: String,
    pub used_fallback: bool,
}

/// Whether a digit string looks like an E.164 number without the `+`.
pub fn is_valid_phone_number(digits: &str) -> bool {
    (8..=15).contains(&digits.len())
        && digits.bytes().all(|b| b.is_ascii_digit())
        && !digits.starts_with('0')
}

/// Strip everything but digits; invalid numbers fall back to
/// [`FALLBACK_PHONE_NUMBER`].
pub fn normalize_phone_number(raw: &str) -> PhoneNumber {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if is_valid_phone_number(&digits) {
        PhoneNumber {
            digits,
            used_fallback: false,
        }
    } else {
        log::warn!("phone number {raw:?} is invalid, using fallback");
        PhoneNumber {
            digits: FALLBACK_PHONE_NUMBER.to_string(),
            used_fallback: true,
        }
    }
}

/// Group a pairing code into blocks of four: `ABCD1234` becomes `ABCD-1234`.
pub fn format_pairing_code(code: &str) -> String {
    let chars: Vec<char> = code.chars().collect();
    if chars.is_empty() {
        return String::new();
    }
    chars
        .chunks(4)
        .map(|chunk| chunk.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join("-")
}

/// Render QR data as unicode blocks for terminal display.
pub fn render_qr_terminal(data: &str) -> Result<String, QRError> {
    let code = QrCode::new(data.as_bytes())
        .map_err(|e| QRError::GenerationFailed(e.to_string()))?;

    let image = code
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .build();

    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_formatting() {
        let number = normalize_phone_number("+91 (123) 456-7890");
        assert_eq!(number.digits, "911234567890");
        assert!(!number.used_fallback);
    }

    #[test]
    fn test_invalid_number_falls_back() {
        for raw in ["", "12345", "0123456789", "1234567890123456"] {
            let number = normalize_phone_number(raw);
            assert!(number.used_fallback, "{raw} should be rejected");
            assert_eq!(number.digits, FALLBACK_PHONE_NUMBER);
        }
    }

    #[test]
    fn test_format_pairing_code() {
        assert_eq!(format_pairing_code("ABCD1234"), "ABCD-1234");
        assert_eq!(format_pairing_code("ABCDE"), "ABCD-E");
        assert_eq!(format_pairing_code("ABC"), "ABC");
        assert_eq!(format_pairing_code(""), "");
    }

    #[test]
    fn test_qr_render() {
        let rendered = render_qr_terminal("2@abc,def,ghi").unwrap();
        assert!(!rendered.is_empty());
        assert!(rendered.lines().count() > 5);
    }
}
