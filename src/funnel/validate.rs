//! Input validation helpers shared by the step catalog and the driver.
//!
//! Each helper returns `Some(message)` with a user-facing error, or `None`
//! when the input is acceptable.

use std::sync::LazyLock;

use regex::Regex;

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email regex"));

static ZIP_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[0-9]{5}$").expect("zip regex"));

pub const MIN_AGE: u32 = 18;
pub const MAX_AGE: u32 = 85;

pub fn name(value: &str) -> Option<String> {
    value
        .trim()
        .is_empty()
        .then(|| "Please enter your name.".to_string())
}

pub fn email(value: &str) -> Option<String> {
    (!EMAIL_RE.is_match(value.trim())).then(|| "Please enter a valid email address.".to_string())
}

pub fn phone(value: &str) -> Option<String> {
    (digits(value).len() < 10).then(|| "Please enter a valid 10-digit phone number.".to_string())
}

pub fn zip(value: &str) -> Option<String> {
    (!ZIP_RE.is_match(value.trim())).then(|| "Please enter a valid 5-digit ZIP code.".to_string())
}

pub fn age(value: &str) -> Option<String> {
    match value.trim().parse::<u32>() {
        Ok(n) if (MIN_AGE..=MAX_AGE).contains(&n) => None,
        _ => Some(format!("Please enter an age between {MIN_AGE} and {MAX_AGE}.")),
    }
}

/// Keep only ASCII digits.
pub fn digits(value: &str) -> String {
    value.chars().filter(char::is_ascii_digit).collect()
}

/// Format a US number as `(555) 123-4567`. Anything that is not ten digits
/// (after dropping a leading country code 1) is returned unchanged.
pub fn format_phone(value: &str) -> String {
    let d = digits(value);
    let d = match d.len() {
        11 if d.starts_with('1') => &d[1..],
        _ => d.as_str(),
    };
    if d.len() != 10 {
        return value.to_string();
    }
    format!("({}) {}-{}", &d[..3], &d[3..6], &d[6..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_rules() {
        assert!(email("notanemail").is_some());
        assert!(email("a@b").is_some());
        assert!(email("has space@b.co").is_some());
        assert!(email("test@dadinsurance.com").is_none());
    }

    #[test]
    fn phone_needs_ten_digits() {
        assert!(phone("123").is_some());
        assert!(phone("(555) 123-4567").is_none());
        assert!(phone("5551234567").is_none());
    }

    #[test]
    fn age_bounds() {
        assert!(age("17").is_some());
        assert!(age("86").is_some());
        assert!(age("abc").is_some());
        assert!(age("-3").is_some());
        assert!(age("18").is_none());
        assert!(age(" 85 ").is_none());
        assert_eq!(age("99").unwrap(), "Please enter an age between 18 and 85.");
    }

    #[test]
    fn zip_and_name() {
        assert!(zip("1234").is_some());
        assert!(zip("12345").is_none());
        assert!(zip("1234a").is_some());
        // Arabic-Indic digits are not a US ZIP.
        assert!(zip("١٢٣٤٥").is_some());
        assert!(name("   ").is_some());
        assert!(name("Sam").is_none());
    }

    #[test]
    fn phone_formatting() {
        assert_eq!(format_phone("5559991234"), "(555) 999-1234");
        assert_eq!(format_phone("1-555-999-1234"), "(555) 999-1234");
        assert_eq!(format_phone("12345"), "12345");
    }
}
