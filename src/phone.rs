//! MSISDN validation and normalization for Kenyan mobile numbers.

use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[error("Invalid phone number: {reason}")]
pub struct InvalidMsisdn {
    pub reason: String,
}

fn msisdn_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^2547\d{8}$").expect("static pattern compiles"))
}

/// Validate a phone number already in E.164 form without the `+` prefix
/// (2547XXXXXXXX). Only Safaricom mobile ranges are accepted.
pub fn validate_msisdn(phone: &str) -> Result<String, InvalidMsisdn> {
    let phone = phone.trim();
    if phone.is_empty() {
        return Err(InvalidMsisdn {
            reason: "phone number cannot be empty".to_string(),
        });
    }
    if !msisdn_pattern().is_match(phone) {
        return Err(InvalidMsisdn {
            reason: "expected format 2547XXXXXXXX (Kenyan mobile number)".to_string(),
        });
    }
    Ok(phone.to_string())
}

/// Normalize common entry formats to 2547XXXXXXXX, then validate:
/// `+254712345678`, `0712345678` and `712345678` all normalize to
/// `254712345678`.
pub fn normalize_msisdn(phone: &str) -> Result<String, InvalidMsisdn> {
    let mut phone = phone.trim().to_string();
    if phone.is_empty() {
        return Err(InvalidMsisdn {
            reason: "phone number cannot be empty".to_string(),
        });
    }

    if let Some(stripped) = phone.strip_prefix('+') {
        phone = stripped.to_string();
    }
    if phone.starts_with('0') && phone.len() == 10 {
        phone = format!("254{}", &phone[1..]);
    }
    if !phone.starts_with("254") && phone.len() == 9 && phone.starts_with('7') {
        phone = format!("254{}", phone);
    }

    validate_msisdn(&phone)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_canonical_form() {
        assert_eq!(validate_msisdn("254712345678").unwrap(), "254712345678");
    }

    #[test]
    fn rejects_non_safaricom_prefix() {
        assert!(validate_msisdn("254112345678").is_err());
    }

    #[test]
    fn rejects_empty_and_garbage() {
        assert!(validate_msisdn("").is_err());
        assert!(validate_msisdn("hello").is_err());
        assert!(validate_msisdn("25471234567").is_err());
        assert!(validate_msisdn("2547123456789").is_err());
    }

    #[test]
    fn normalizes_common_formats() {
        for input in ["254712345678", "+254712345678", "0712345678", "712345678"] {
            assert_eq!(normalize_msisdn(input).unwrap(), "254712345678", "{input}");
        }
    }

    #[test]
    fn normalization_trims_whitespace() {
        assert_eq!(
            normalize_msisdn("  +254712345678  ").unwrap(),
            "254712345678"
        );
    }

    #[test]
    fn normalization_rejects_invalid_local_number() {
        assert!(normalize_msisdn("0112345678").is_err());
    }
}
