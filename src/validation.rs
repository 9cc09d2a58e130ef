//! Request validation.
//!
//! Every check is a pure function returning a tagged result, so the API
//! layer can compose them before anything touches the pool or the ledger.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Invalid {field}: {reason}")]
    FormatInvalid { field: &'static str, reason: String },

    #[error("Email address {0} is not deliverable")]
    Undeliverable(String),

    #[error("Captcha answer does not match")]
    CaptchaMismatch,

    #[error("{field} {value} is out of range: {reason}")]
    OutOfRange {
        field: &'static str,
        value: i64,
        reason: String,
    },
}

impl ValidationError {
    fn format(field: &'static str, reason: impl Into<String>) -> Self {
        Self::FormatInvalid {
            field,
            reason: reason.into(),
        }
    }
}

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]+@[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?)+$",
    )
    .expect("email pattern compiles")
});

/// Check a router hostname.
///
/// RFC 952 style labels: ASCII letters, digits and `-`, 3 to 63 characters,
/// starting with a letter and not ending with `-`.
pub fn validate_hostname(name: &str) -> Result<(), ValidationError> {
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(ValidationError::format(
            "hostname",
            "only letters (A-z), digits (0-9) and a minus sign (-) are allowed",
        ));
    }

    if name.len() < 3 || name.len() > 63 {
        return Err(ValidationError::format(
            "hostname",
            "must be at least 3 and at most 63 characters long",
        ));
    }

    if !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return Err(ValidationError::format("hostname", "must start with a letter"));
    }

    if name.ends_with('-') {
        return Err(ValidationError::format(
            "hostname",
            "must not end with a minus sign",
        ));
    }

    Ok(())
}

/// Check the shape of an email address. Deliverability is a separate, async check.
pub fn validate_email(email: &str) -> Result<(), ValidationError> {
    if email.len() > 254 {
        return Err(ValidationError::format("email", "address is too long"));
    }

    let Some((local, _domain)) = email.rsplit_once('@') else {
        return Err(ValidationError::format("email", "missing @"));
    };

    if local.is_empty() || local.len() > 64 {
        return Err(ValidationError::format(
            "email",
            "local part must be 1 to 64 characters",
        ));
    }

    if local.starts_with('.') || local.ends_with('.') || local.contains("..") {
        return Err(ValidationError::format(
            "email",
            "local part has misplaced dots",
        ));
    }

    if !EMAIL_RE.is_match(email) {
        return Err(ValidationError::format("email", "not a valid address"));
    }

    Ok(())
}

/// Check that the domain of an already well-formed address resolves to a host.
///
/// This is a host (A/AAAA) lookup, not an MX lookup: a domain that only
/// publishes MX records is reported as undeliverable.
pub async fn check_deliverability(email: &str) -> Result<(), ValidationError> {
    let domain = email
        .rsplit_once('@')
        .map(|(_, d)| d)
        .ok_or_else(|| ValidationError::format("email", "missing @"))?;

    match tokio::net::lookup_host((domain, 25)).await {
        Ok(mut addrs) => {
            if addrs.next().is_some() {
                Ok(())
            } else {
                Err(ValidationError::Undeliverable(email.to_string()))
            }
        }
        Err(_) => Err(ValidationError::Undeliverable(email.to_string())),
    }
}

/// Compare the captcha answer against the configured one.
pub fn validate_captcha(answer: &str, expected: &str) -> Result<(), ValidationError> {
    if answer != expected {
        return Err(ValidationError::CaptchaMismatch);
    }
    Ok(())
}

/// Check a constituency code; 0 means no IPv6 prefix is wanted.
pub fn validate_constituency(code: u8) -> Result<Constituency, ValidationError> {
    if code == 0 {
        return Ok(Constituency::NONE);
    }
    if !Constituency::DISTRICTS.contains(&code) {
        return Err(ValidationError::OutOfRange {
            field: "constituency",
            value: code.into(),
            reason: "cannot assign IPv6 prefix: no valid constituency in Berlin".to_string(),
        });
    }
    Ok(Constituency(code))
}

/// IPv4 size class for the simple mode.
pub fn validate_simple_ipv4_size(size: u8) -> Result<u8, ValidationError> {
    if !(27..=28).contains(&size) {
        return Err(ValidationError::OutOfRange {
            field: "size4",
            value: size.into(),
            reason: "only /27 and /28 prefixes are handed out".to_string(),
        });
    }
    Ok(size)
}

/// IPv4 size class for the expert mode. `None` means no IPv4 prefix.
pub fn validate_expert_ipv4_size(size: u8) -> Result<Option<u8>, ValidationError> {
    match size {
        0 => Ok(None),
        23..=32 => Ok(Some(size)),
        _ => Err(ValidationError::OutOfRange {
            field: "size4",
            value: size.into(),
            reason: "only /23 to /32 allowed, or 0 for no IPv4 prefix".to_string(),
        }),
    }
}

/// Berlin election district code gating IPv6 eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Constituency(u8);

impl Constituency {
    /// No IPv6 prefix requested.
    pub const NONE: Constituency = Constituency(0);

    const DISTRICTS: std::ops::RangeInclusive<u8> = 75..=86;

    const NAMES: [&'static str; 12] = [
        "Wahlkreis 75, Mitte",
        "Wahlkreis 76, Pankow",
        "Wahlkreis 77, Reinickendorf",
        "Wahlkreis 78, Spandau - Charlottenburg Nord",
        "Wahlkreis 79, Steglitz - Zehlendorf",
        "Wahlkreis 80, Charlottenburg - Wilmersdorf",
        "Wahlkreis 81, Tempelhof - Schoeneberg",
        "Wahlkreis 82, Neukölln",
        "Wahlkreis 83, Friedrichshain - Kreuzberg - Prenzlauer Berg Ost",
        "Wahlkreis 84, Treptow - Köpenick",
        "Wahlkreis 85, Marzahn - Hellersdorf",
        "Wahlkreis 86, Lichtenberg",
    ];

    pub fn code(self) -> u8 {
        self.0
    }

    pub fn wants_ipv6(self) -> bool {
        self.0 != 0
    }

    pub fn name(self) -> Option<&'static str> {
        if Self::DISTRICTS.contains(&self.0) {
            Some(Self::NAMES[usize::from(self.0 - 75)])
        } else {
            None
        }
    }
}

impl TryFrom<u8> for Constituency {
    type Error = ValidationError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        validate_constituency(code)
    }
}

impl From<Constituency> for u8 {
    fn from(c: Constituency) -> u8 {
        c.0
    }
}

impl fmt::Display for Constituency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hostname_valid() {
        assert!(validate_hostname("mynode").is_ok());
        assert!(validate_hostname("freifunk-router").is_ok());
        assert!(validate_hostname("ab1").is_ok());
        assert!(validate_hostname("A-b-C-9").is_ok());
        assert!(validate_hostname(&format!("a{}", "b".repeat(62))).is_ok());
    }

    #[test]
    fn test_hostname_invalid() {
        assert!(validate_hostname("ab").is_err());
        assert!(validate_hostname(&format!("a{}", "b".repeat(63))).is_err());
        assert!(validate_hostname("1router").is_err());
        assert!(validate_hostname("-router").is_err());
        assert!(validate_hostname("router-").is_err());
        assert!(validate_hostname("my.router").is_err());
        assert!(validate_hostname("my_router").is_err());
        assert!(validate_hostname("räuber").is_err());
        assert!(validate_hostname("").is_err());
    }

    #[test]
    fn test_email() {
        assert!(validate_email("a@example.org").is_ok());
        assert!(validate_email("first.last+tag@mail.example.org").is_ok());
        assert!(validate_email("no-at-sign").is_err());
        assert!(validate_email("@example.org").is_err());
        assert!(validate_email("a@localhost").is_err());
        assert!(validate_email(".a@example.org").is_err());
        assert!(validate_email("a..b@example.org").is_err());
        assert!(validate_email("a@-example.org").is_err());
        assert!(validate_email("a@example.org\r\nBcc: x@y.z").is_err());
    }

    #[tokio::test]
    async fn test_deliverability_resolves_host() {
        assert!(check_deliverability("a@localhost").await.is_ok());
        assert_eq!(
            check_deliverability("a@nowhere.invalid").await,
            Err(ValidationError::Undeliverable("a@nowhere.invalid".to_string()))
        );
        assert!(matches!(
            check_deliverability("no-at-sign").await,
            Err(ValidationError::FormatInvalid { field: "email", .. })
        ));
    }

    #[test]
    fn test_captcha() {
        assert!(validate_captcha("Berlin", "Berlin").is_ok());
        assert_eq!(
            validate_captcha("Charlottenburg", "Berlin"),
            Err(ValidationError::CaptchaMismatch)
        );
        assert!(validate_captcha("berlin", "Berlin").is_err());
    }

    #[test]
    fn test_constituency() {
        assert_eq!(validate_constituency(0).unwrap(), Constituency::NONE);
        assert!(!Constituency::NONE.wants_ipv6());
        assert_eq!(Constituency::NONE.name(), None);

        let mitte = validate_constituency(75).unwrap();
        assert!(mitte.wants_ipv6());
        assert_eq!(mitte.name(), Some("Wahlkreis 75, Mitte"));
        assert_eq!(
            validate_constituency(86).unwrap().name(),
            Some("Wahlkreis 86, Lichtenberg")
        );

        assert!(matches!(
            validate_constituency(74),
            Err(ValidationError::OutOfRange { field: "constituency", value: 74, .. })
        ));
        assert!(validate_constituency(87).is_err());
        assert!(validate_constituency(42).is_err());
    }

    #[test]
    fn test_constituency_serde() {
        let c: Constituency = serde_json::from_str("80").unwrap();
        assert_eq!(c.code(), 80);
        assert_eq!(serde_json::to_string(&c).unwrap(), "80");
        assert!(serde_json::from_str::<Constituency>("42").is_err());
    }

    #[test]
    fn test_ipv4_sizes() {
        assert_eq!(validate_simple_ipv4_size(27), Ok(27));
        assert_eq!(validate_simple_ipv4_size(28), Ok(28));
        assert!(validate_simple_ipv4_size(26).is_err());
        assert!(validate_simple_ipv4_size(29).is_err());

        assert_eq!(validate_expert_ipv4_size(0), Ok(None));
        assert_eq!(validate_expert_ipv4_size(23), Ok(Some(23)));
        assert_eq!(validate_expert_ipv4_size(32), Ok(Some(32)));
        assert!(validate_expert_ipv4_size(22).is_err());
        assert!(validate_expert_ipv4_size(33).is_err());
    }
}
