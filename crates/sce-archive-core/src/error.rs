use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::policy::DenyReason;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Account,
    ContentRecord,
    Post,
}

impl EntityKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Account => "account",
            Self::ContentRecord => "content_record",
            Self::Post => "post",
        }
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure taxonomy shared by the store, the API layer, and both binaries.
///
/// Every variant is recoverable. Callers render `to_string()` to users and
/// branch on [`ArchiveError::code`].
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ArchiveError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("{entity} {field} is already in use")]
    DuplicateKey { entity: EntityKind, field: String },
    #[error("{entity} not found: {id}")]
    NotFound { entity: EntityKind, id: String },
    #[error("forbidden: {0}")]
    Forbidden(DenyReason),
    #[error("invalid email or password")]
    Credential,
    #[error("storage error: {0}")]
    Storage(String),
}

impl ArchiveError {
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    #[must_use]
    pub fn not_found(entity: EntityKind, id: impl Display) -> Self {
        Self::NotFound { entity, id: id.to_string() }
    }

    #[must_use]
    pub fn duplicate(entity: EntityKind, field: impl Into<String>) -> Self {
        Self::DuplicateKey { entity, field: field.into() }
    }

    /// Stable machine-readable code for clients.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_FAILED",
            Self::DuplicateKey { .. } => "DUPLICATE_KEY",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Forbidden(reason) => reason.code(),
            Self::Credential => "CREDENTIAL_INVALID",
            Self::Storage(_) => "STORAGE_FAILED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ClearanceLevel;

    #[test]
    fn forbidden_messages_distinguish_authentication_clearance_and_self_guard() {
        let anonymous = ArchiveError::Forbidden(DenyReason::NotAuthenticated);
        let clearance = ArchiveError::Forbidden(DenyReason::InsufficientClearance {
            required: ClearanceLevel::Level3,
        });
        let self_guard =
            ArchiveError::Forbidden(DenyReason::SelfModification { field: "role".to_string() });

        assert_eq!(anonymous.to_string(), "forbidden: authentication required");
        assert_eq!(clearance.to_string(), "forbidden: clearance level 3 required");
        assert_eq!(self_guard.to_string(), "forbidden: you cannot change your own role");
        assert_ne!(anonymous.code(), clearance.code());
        assert_ne!(clearance.code(), self_guard.code());
    }

    #[test]
    fn duplicate_key_names_the_conflicting_field() {
        let err = ArchiveError::duplicate(EntityKind::Account, "email");
        assert_eq!(err.to_string(), "account email is already in use");
        assert_eq!(err.code(), "DUPLICATE_KEY");
    }
}
