use sha2::{Digest, Sha256};

use handoff_core::OwnerId;

/// Domain separator so owner hashes never collide with other SHA-256 uses of
/// the same subject string.
const OWNER_HASH_PREFIX: &[u8] = b"handoff.owner.v1:";

/// An authenticated caller.
///
/// Only the hashed owner identity is retained; the raw subject is dropped at
/// this boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    owner_id: OwnerId,
}

impl Principal {
    pub fn from_subject(subject: &str) -> Self {
        Self {
            owner_id: owner_for_subject(subject),
        }
    }

    pub fn owner_id(&self) -> &OwnerId {
        &self.owner_id
    }
}

/// Derive the opaque owner identity for a token subject (hex SHA-256).
pub fn owner_for_subject(subject: &str) -> OwnerId {
    let mut hasher = Sha256::new();
    hasher.update(OWNER_HASH_PREFIX);
    hasher.update(subject.as_bytes());
    OwnerId::from_hashed(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_hash_is_stable_and_opaque() {
        let a = owner_for_subject("alice");
        let b = owner_for_subject("alice");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert!(!a.as_str().contains("alice"));
    }

    #[test]
    fn different_subjects_get_different_owners() {
        assert_ne!(owner_for_subject("alice"), owner_for_subject("bob"));
    }
}
