//! Access policy evaluation.
//!
//! Every function here is pure and total: the requester is passed explicitly
//! (`None` for anonymous) and the result is a [`Decision`] or a plain `bool`.
//! Turning a denial into an [`ArchiveError`] is the caller's job.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::{AccountId, AccountPatch, ArchiveError, ClearanceLevel, Principal, Role};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenyReason {
    NotAuthenticated,
    EmailNotVerified,
    InsufficientRole { required: Role },
    InsufficientClearance { required: ClearanceLevel },
    SelfModification { field: String },
    NotOwner,
    AdminOnlyField { field: String },
    AdminAlreadyProvisioned,
}

impl DenyReason {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotAuthenticated => "FORBIDDEN_NOT_AUTHENTICATED",
            Self::EmailNotVerified => "FORBIDDEN_EMAIL_NOT_VERIFIED",
            Self::InsufficientRole { .. } => "FORBIDDEN_INSUFFICIENT_ROLE",
            Self::InsufficientClearance { .. } => "FORBIDDEN_INSUFFICIENT_CLEARANCE",
            Self::SelfModification { .. } => "FORBIDDEN_SELF_MODIFICATION",
            Self::NotOwner => "FORBIDDEN_NOT_OWNER",
            Self::AdminOnlyField { .. } => "FORBIDDEN_ADMIN_ONLY_FIELD",
            Self::AdminAlreadyProvisioned => "FORBIDDEN_ADMIN_ALREADY_PROVISIONED",
        }
    }
}

impl Display for DenyReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotAuthenticated => f.write_str("authentication required"),
            Self::EmailNotVerified => {
                f.write_str("email address must be verified before signing in")
            }
            Self::InsufficientRole { required } => write!(f, "role {required} required"),
            Self::InsufficientClearance { required } => {
                write!(f, "clearance level {required} required")
            }
            Self::SelfModification { field } => write!(f, "you cannot change your own {field}"),
            Self::NotOwner => f.write_str("you may only edit your own profile"),
            Self::AdminOnlyField { field } => write!(f, "only administrators may change {field}"),
            Self::AdminAlreadyProvisioned => f.write_str("an administrator already exists"),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    /// # Errors
    /// Returns [`ArchiveError::Forbidden`] carrying the denial reason.
    pub fn into_result(self) -> Result<(), ArchiveError> {
        match self {
            Self::Allow => Ok(()),
            Self::Deny(reason) => Err(ArchiveError::Forbidden(reason)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum MutationAction {
    CreateContent,
    UpdateContent,
    DeleteContent,
    AccountRoleChange { target: AccountId },
    AccountClearanceChange { target: AccountId },
    AccountPositionChange { target: AccountId },
    ViewAllAccounts,
    /// Wipe every collection and session.
    ResetArchive,
}

#[must_use]
pub fn authorize_view(
    requester: Option<&Principal>,
    required_clearance: Option<ClearanceLevel>,
) -> Decision {
    let Some(required) = required_clearance else {
        return Decision::Allow;
    };

    match requester {
        None if required == ClearanceLevel::LOWEST => Decision::Allow,
        None => Decision::Deny(DenyReason::NotAuthenticated),
        Some(principal) if principal.clearance >= required => Decision::Allow,
        Some(_) => Decision::Deny(DenyReason::InsufficientClearance { required }),
    }
}

#[must_use]
pub fn can_view(requester: Option<&Principal>, required_clearance: Option<ClearanceLevel>) -> bool {
    authorize_view(requester, required_clearance).is_allowed()
}

/// Keep the resources `requester` may read, in their original order.
pub fn filter_visible<T, F>(requester: Option<&Principal>, resources: &[T], clearance_of: F) -> Vec<T>
where
    T: Clone,
    F: Fn(&T) -> Option<ClearanceLevel>,
{
    resources
        .iter()
        .filter(|resource| can_view(requester, clearance_of(resource)))
        .cloned()
        .collect()
}

#[must_use]
pub fn authorize_mutation(requester: Option<&Principal>, action: MutationAction) -> Decision {
    let Some(principal) = requester else {
        return Decision::Deny(DenyReason::NotAuthenticated);
    };

    if !principal.is_admin() {
        return Decision::Deny(DenyReason::InsufficientRole { required: Role::Admin });
    }

    match action {
        MutationAction::AccountRoleChange { target } if target == principal.id => {
            Decision::Deny(DenyReason::SelfModification { field: "role".to_string() })
        }
        MutationAction::AccountClearanceChange { target } if target == principal.id => {
            Decision::Deny(DenyReason::SelfModification { field: "clearance".to_string() })
        }
        _ => Decision::Allow,
    }
}

#[must_use]
pub fn can_mutate(requester: Option<&Principal>, action: MutationAction) -> bool {
    authorize_mutation(requester, action).is_allowed()
}

#[must_use]
pub fn can_edit_profile(requester: Option<&Principal>, target: AccountId) -> bool {
    match requester {
        Some(principal) => principal.id == target || principal.is_admin(),
        None => false,
    }
}

/// Authorize a profile edit including its admin-only fields.
///
/// Role, clearance, and verification state may only be set by an Admin, and
/// an Admin may not change their own role or clearance through this path
/// either.
#[must_use]
pub fn authorize_profile_update(
    requester: Option<&Principal>,
    target: AccountId,
    patch: &AccountPatch,
) -> Decision {
    let Some(principal) = requester else {
        return Decision::Deny(DenyReason::NotAuthenticated);
    };

    if !can_edit_profile(requester, target) {
        return Decision::Deny(DenyReason::NotOwner);
    }

    let admin_fields = [
        ("role", patch.role.is_some()),
        ("clearance", patch.clearance.is_some()),
        ("email_verified", patch.email_verified.is_some()),
    ];
    for (field, present) in admin_fields {
        if !present {
            continue;
        }
        if !principal.is_admin() {
            return Decision::Deny(DenyReason::AdminOnlyField { field: field.to_string() });
        }
        if field != "email_verified" && principal.id == target {
            return Decision::Deny(DenyReason::SelfModification { field: field.to_string() });
        }
    }

    Decision::Allow
}
