use handoff_core::{DomainError, DomainResult, OwnerId, RequestId};

/// Owner context for a request.
///
/// Derived from the verified bearer token; every record and grant is scoped by it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerContext {
    owner_id: OwnerId,
}

impl OwnerContext {
    pub fn new(owner_id: OwnerId) -> Self {
        Self { owner_id }
    }

    pub fn owner_id(&self) -> &OwnerId {
        &self.owner_id
    }
}

/// The idempotency key for a request, resolved before authentication so every
/// response can echo it.
///
/// A malformed `x-request-id` is carried as a rejection rather than answered
/// on the spot, so unauthenticated callers still get 401 first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIdContext {
    resolved: Resolved,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Resolved {
    Supplied(RequestId),
    Generated(RequestId),
    Invalid(DomainError),
}

impl RequestIdContext {
    pub fn supplied(request_id: RequestId) -> Self {
        Self {
            resolved: Resolved::Supplied(request_id),
        }
    }

    pub fn generated() -> Self {
        Self {
            resolved: Resolved::Generated(RequestId::generate()),
        }
    }

    pub fn invalid(err: DomainError) -> Self {
        Self {
            resolved: Resolved::Invalid(err),
        }
    }

    /// The id to echo, if one was resolved.
    pub fn request_id(&self) -> Option<&RequestId> {
        match &self.resolved {
            Resolved::Supplied(id) | Resolved::Generated(id) => Some(id),
            Resolved::Invalid(_) => None,
        }
    }

    /// The id to process under, or the validation error for a malformed header.
    pub fn resolve(&self) -> DomainResult<&RequestId> {
        match &self.resolved {
            Resolved::Supplied(id) | Resolved::Generated(id) => Ok(id),
            Resolved::Invalid(err) => Err(err.clone()),
        }
    }

    /// True when the server minted the id, so no prior record can exist.
    pub fn is_generated(&self) -> bool {
        matches!(self.resolved, Resolved::Generated(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_id_is_deferred_as_a_validation_error() {
        let ctx = RequestIdContext::invalid(DomainError::InvalidId("not valid!".into()));
        assert!(ctx.request_id().is_none());
        assert!(!ctx.is_generated());
        assert!(matches!(ctx.resolve(), Err(DomainError::InvalidId(_))));

        let ctx = RequestIdContext::generated();
        assert!(ctx.is_generated());
        assert_eq!(ctx.resolve().ok(), ctx.request_id());
    }
}
