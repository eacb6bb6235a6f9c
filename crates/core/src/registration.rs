//! Vehicle registration number (validated value object).

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::value_object::ValueObject;

const MIN_LEN: usize = 2;
const MAX_LEN: usize = 8;

/// A normalised vehicle registration number.
///
/// Normalisation strips whitespace and upper-cases, so `"ab12 cde"` and
/// `"AB12CDE"` are the same value. Only the shape is checked here; whether the
/// vehicle exists is the downstream API's concern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RegistrationNumber(String);

impl RegistrationNumber {
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let normalised: String = raw
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| c.to_ascii_uppercase())
            .collect();

        if normalised.is_empty() {
            return Err(DomainError::MissingField("registrationNumber"));
        }
        if !(MIN_LEN..=MAX_LEN).contains(&normalised.len()) {
            return Err(DomainError::validation(format!(
                "registrationNumber must be {MIN_LEN}-{MAX_LEN} characters"
            )));
        }
        if !normalised.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(DomainError::validation(
                "registrationNumber may only contain letters and digits",
            ));
        }
        if !normalised.chars().any(|c| c.is_ascii_digit()) {
            return Err(DomainError::validation(
                "registrationNumber must contain at least one digit",
            ));
        }

        Ok(Self(normalised))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ValueObject for RegistrationNumber {}

impl core::fmt::Display for RegistrationNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RegistrationNumber {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RegistrationNumber {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RegistrationNumber> for String {
    fn from(value: RegistrationNumber) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn normalises_case_and_whitespace() {
        let a = RegistrationNumber::parse("ab12 cde").unwrap();
        let b = RegistrationNumber::parse("AB12CDE").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "AB12CDE");
    }

    #[test]
    fn rejects_malformed_values() {
        assert_eq!(
            RegistrationNumber::parse("  "),
            Err(DomainError::MissingField("registrationNumber"))
        );
        assert!(RegistrationNumber::parse("A").is_err());
        assert!(RegistrationNumber::parse("ABCDEFGHI1").is_err());
        assert!(RegistrationNumber::parse("AB-12").is_err());
        assert!(RegistrationNumber::parse("ABCDEF").is_err());
    }

    #[test]
    fn deserialises_through_validation() {
        let ok: RegistrationNumber = serde_json::from_str("\"ab12cde\"").unwrap();
        assert_eq!(ok.as_str(), "AB12CDE");
        assert!(serde_json::from_str::<RegistrationNumber>("\"!!\"").is_err());
    }

    proptest! {
        #[test]
        fn parsing_is_idempotent(raw in "[a-zA-Z0-9 ]{0,12}") {
            if let Ok(first) = RegistrationNumber::parse(&raw) {
                let second = RegistrationNumber::parse(first.as_str()).unwrap();
                prop_assert_eq!(first, second);
            }
        }
    }
}
