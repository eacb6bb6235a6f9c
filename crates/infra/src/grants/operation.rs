//! Typed grant operations, validated once at the boundary.

use serde::{Deserialize, Serialize};

use handoff_core::{DomainError, DomainResult, RegistrationNumber};

/// Longest free-text purpose accepted on a grant.
pub const MAX_PURPOSE_LEN: usize = 200;

/// One operation against the grant API. Serialised as the request payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum GrantOperation {
    Grant {
        #[serde(rename = "registrationNumber")]
        registration_number: RegistrationNumber,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        purpose: Option<String>,
    },
    Revoke {
        #[serde(rename = "registrationNumber")]
        registration_number: RegistrationNumber,
    },
    Lookup {
        #[serde(rename = "registrationNumber")]
        registration_number: RegistrationNumber,
    },
}

impl GrantOperation {
    pub fn grant(registration_number: &str, purpose: Option<&str>) -> DomainResult<Self> {
        let purpose = purpose.map(str::trim).filter(|p| !p.is_empty());
        if let Some(p) = purpose {
            if p.chars().count() > MAX_PURPOSE_LEN {
                return Err(DomainError::validation(format!(
                    "purpose must be at most {MAX_PURPOSE_LEN} characters"
                )));
            }
        }
        Ok(Self::Grant {
            registration_number: RegistrationNumber::parse(registration_number)?,
            purpose: purpose.map(str::to_string),
        })
    }

    pub fn revoke(registration_number: &str) -> DomainResult<Self> {
        Ok(Self::Revoke {
            registration_number: RegistrationNumber::parse(registration_number)?,
        })
    }

    pub fn lookup(registration_number: &str) -> DomainResult<Self> {
        Ok(Self::Lookup {
            registration_number: RegistrationNumber::parse(registration_number)?,
        })
    }

    pub fn registration_number(&self) -> &RegistrationNumber {
        match self {
            Self::Grant {
                registration_number,
                ..
            }
            | Self::Revoke {
                registration_number,
            }
            | Self::Lookup {
                registration_number,
            } => registration_number,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Grant { .. } => "grant",
            Self::Revoke { .. } => "revoke",
            Self::Lookup { .. } => "lookup",
        }
    }

    /// Completed grants are backed by a permanent receipt, so their request
    /// record is kept for the audit period.
    pub fn is_audit_critical(&self) -> bool {
        matches!(self, Self::Grant { .. })
    }

    pub fn to_payload(&self) -> serde_json::Value {
        // Serialising a plain enum of strings cannot fail.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn from_payload(payload: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(payload.clone())
    }
}
