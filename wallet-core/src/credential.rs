//! Credential handling: strength rules and fixed-time comparison.
//!
//! Nothing in this module logs or formats credential content.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use subtle::{Choice, ConstantTimeEq};

/// Minimum number of characters accepted by [`CredentialPolicy::default`].
pub const MIN_CREDENTIAL_LENGTH: usize = 8;

// Anything other than an ASCII letter, digit or space counts as a symbol.
static SYMBOL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9 ]").expect("symbol pattern compiles"));

/// In-memory user secret. Zeroized when dropped, redacted in `Debug`.
pub struct Credential(SecretString);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(SecretString::from(secret.into()))
    }

    pub(crate) fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    pub fn is_empty(&self) -> bool {
        self.expose().is_empty()
    }
}

impl From<&str> for Credential {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Credential {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential([REDACTED])")
    }
}

/// Why a candidate credential was rejected, in rule evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WeaknessReason {
    TooShort,
    SurroundingWhitespace,
    MissingDigit,
    MissingUppercase,
    MissingLowercase,
    MissingSymbol,
}

impl WeaknessReason {
    /// Stable code the presentation layer maps to localized feedback.
    pub fn code(&self) -> &'static str {
        match self {
            WeaknessReason::TooShort => "credential.too_short",
            WeaknessReason::SurroundingWhitespace => "credential.surrounding_whitespace",
            WeaknessReason::MissingDigit => "credential.missing_digit",
            WeaknessReason::MissingUppercase => "credential.missing_uppercase",
            WeaknessReason::MissingLowercase => "credential.missing_lowercase",
            WeaknessReason::MissingSymbol => "credential.missing_symbol",
        }
    }
}

impl fmt::Display for WeaknessReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            WeaknessReason::TooShort => "must be at least 8 characters",
            WeaknessReason::SurroundingWhitespace => "must not start or end with whitespace",
            WeaknessReason::MissingDigit => "must contain a digit",
            WeaknessReason::MissingUppercase => "must contain an uppercase letter",
            WeaknessReason::MissingLowercase => "must contain a lowercase letter",
            WeaknessReason::MissingSymbol => "must contain a symbol",
        };
        f.write_str(text)
    }
}

/// Result handed back across the credential-entry boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CredentialOutcome {
    Accepted,
    RejectedWeak(WeaknessReason),
    RejectedMismatch,
}

impl CredentialOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, CredentialOutcome::Accepted)
    }
}

/// Strength rules and comparison for user credentials.
#[derive(Debug, Clone)]
pub struct CredentialPolicy {
    min_length: usize,
}

impl Default for CredentialPolicy {
    fn default() -> Self {
        Self {
            min_length: MIN_CREDENTIAL_LENGTH,
        }
    }
}

impl CredentialPolicy {
    pub fn new(min_length: usize) -> Self {
        Self { min_length }
    }

    /// Check every rule and report the first failure in rule order.
    pub fn validate_strength(&self, candidate: &Credential) -> Result<(), WeaknessReason> {
        match self.weaknesses(candidate).first() {
            Some(reason) => Err(*reason),
            None => Ok(()),
        }
    }

    /// All failing rules. Every rule is evaluated regardless of earlier failures.
    pub fn weaknesses(&self, candidate: &Credential) -> Vec<WeaknessReason> {
        let secret = candidate.expose();
        let mut reasons = Vec::new();

        if secret.chars().count() < self.min_length {
            reasons.push(WeaknessReason::TooShort);
        }

        let leading = secret.chars().next().map_or(false, char::is_whitespace);
        let trailing = secret.chars().last().map_or(false, char::is_whitespace);
        if leading || trailing {
            reasons.push(WeaknessReason::SurroundingWhitespace);
        }

        let mut has_digit = false;
        let mut has_upper = false;
        let mut has_lower = false;
        for c in secret.chars() {
            has_digit |= c.is_ascii_digit();
            has_upper |= c.is_ascii_uppercase();
            has_lower |= c.is_ascii_lowercase();
        }
        if !has_digit {
            reasons.push(WeaknessReason::MissingDigit);
        }
        if !has_upper {
            reasons.push(WeaknessReason::MissingUppercase);
        }
        if !has_lower {
            reasons.push(WeaknessReason::MissingLowercase);
        }

        if !SYMBOL_PATTERN.is_match(secret) {
            reasons.push(WeaknessReason::MissingSymbol);
        }

        reasons
    }

    /// Fixed-time equality over characters.
    ///
    /// Unequal lengths return `false` straight away, so the length of a
    /// secret is observable through timing. Equal-length inputs are always
    /// walked to the end.
    pub fn compare(a: &str, b: &str) -> bool {
        if a.chars().count() != b.chars().count() {
            return false;
        }

        let mut equal = Choice::from(1u8);
        for (x, y) in a.chars().zip(b.chars()) {
            equal &= (x as u32).ct_eq(&(y as u32));
        }
        bool::from(equal)
    }

    pub fn compare_credentials(a: &Credential, b: &Credential) -> bool {
        Self::compare(a.expose(), b.expose())
    }

    /// Check a new credential entered twice.
    pub fn confirm(&self, first: &Credential, second: &Credential) -> CredentialOutcome {
        if first.is_empty() || second.is_empty() || !Self::compare_credentials(first, second) {
            return CredentialOutcome::RejectedMismatch;
        }
        match self.validate_strength(first) {
            Ok(()) => CredentialOutcome::Accepted,
            Err(reason) => CredentialOutcome::RejectedWeak(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(candidate: &str) -> Result<(), WeaknessReason> {
        CredentialPolicy::default().validate_strength(&Credential::from(candidate))
    }

    #[test]
    fn minimal_strong_credential_accepted() {
        assert_eq!(check("Abc123!x"), Ok(()));
        assert_eq!(check("Xyz789!q"), Ok(()));
    }

    #[test]
    fn each_rule_has_its_own_reason() {
        assert_eq!(check("Ab1!xyz"), Err(WeaknessReason::TooShort));
        assert_eq!(check(" Abc123!x"), Err(WeaknessReason::SurroundingWhitespace));
        assert_eq!(check("Abc123!x\t"), Err(WeaknessReason::SurroundingWhitespace));
        assert_eq!(check("Abcdefg!x"), Err(WeaknessReason::MissingDigit));
        assert_eq!(check("abc123!xy"), Err(WeaknessReason::MissingUppercase));
        assert_eq!(check("ABC123!XY"), Err(WeaknessReason::MissingLowercase));
        assert_eq!(check("Abc123xyz"), Err(WeaknessReason::MissingSymbol));
    }

    #[test]
    fn non_ascii_letters_count_as_symbols() {
        // KELVIN SIGN folds to 'k' case-insensitively but is not ASCII.
        assert_eq!(check("Abc1234\u{212A}"), Ok(()));
        assert_eq!(check("Abc1234é"), Ok(()));
    }

    #[test]
    fn inner_space_is_not_a_symbol() {
        assert_eq!(check("Abc 123 xyz"), Err(WeaknessReason::MissingSymbol));
        assert_eq!(check("Abc 123 xy#"), Ok(()));
    }

    #[test]
    fn all_failures_are_reported() {
        let reasons = CredentialPolicy::default().weaknesses(&Credential::from("  "));
        assert_eq!(
            reasons,
            vec![
                WeaknessReason::TooShort,
                WeaknessReason::SurroundingWhitespace,
                WeaknessReason::MissingDigit,
                WeaknessReason::MissingUppercase,
                WeaknessReason::MissingLowercase,
                WeaknessReason::MissingSymbol,
            ]
        );
    }

    #[test]
    fn compare_requires_every_character() {
        assert!(CredentialPolicy::compare("Abc123!x", "Abc123!x"));
        assert!(!CredentialPolicy::compare("Abc123!x", "Xbc123!x"));
        assert!(!CredentialPolicy::compare("Abc123!x", "Abc123!y"));
        assert!(!CredentialPolicy::compare("Abc123!x", "Abc123!"));
        assert!(CredentialPolicy::compare("", ""));
    }

    #[test]
    fn compare_counts_characters_not_bytes() {
        assert!(!CredentialPolicy::compare("é", "e\u{301}"));
        assert!(CredentialPolicy::compare("pässwörd", "pässwörd"));
        assert!(!CredentialPolicy::compare("pässwörd", "passwörd"));
    }

    #[test]
    fn confirm_reports_mismatch_before_weakness() {
        let policy = CredentialPolicy::default();
        assert_eq!(
            policy.confirm(&"short".into(), &"other".into()),
            CredentialOutcome::RejectedMismatch
        );
        assert_eq!(
            policy.confirm(&"".into(), &"".into()),
            CredentialOutcome::RejectedMismatch
        );
        assert_eq!(
            policy.confirm(&"short".into(), &"short".into()),
            CredentialOutcome::RejectedWeak(WeaknessReason::TooShort)
        );
        assert_eq!(
            policy.confirm(&"Abc123!x".into(), &"Abc123!x".into()),
            CredentialOutcome::Accepted
        );
    }

    #[test]
    fn debug_output_is_redacted() {
        let rendered = format!("{:?}", Credential::from("Abc123!x"));
        assert!(!rendered.contains("Abc123"));
    }

    #[test]
    fn reason_codes_are_stable() {
        assert_eq!(WeaknessReason::MissingSymbol.code(), "credential.missing_symbol");
        assert_eq!(WeaknessReason::TooShort.code(), "credential.too_short");
    }
}
