use std::path::PathBuf;

use sce_archive_core::{
    authorize_mutation, authorize_profile_update, authorize_view, filter_visible,
    normalize_email, validate_email, validate_username, Account, AccountId, AccountPatch,
    AccountProfile, ArchiveError, Classification, ClearanceGated, ClearanceLevel, ContentRecord,
    ContentRecordId, ContentRecordPatch, Department, DenyReason, DiscoveryMeta, EntityKind,
    MutationAction, Post, PostCategory, PostId, PostPatch, Principal, Role,
};
use sce_archive_store_sqlite::{CollectionCounts, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

pub mod credentials;

use credentials::{
    generate_token, hash_password, validate_password, verify_password, verify_without_account,
};

pub const API_CONTRACT_VERSION: &str = "api.v1";

const ADMIN_POSITION: &str = "Foundation Director";
const NEW_STAFF_POSITION: &str = "New Staff Member";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BootstrapAdminRequest {
    pub email: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterRequest {
    pub email: String,
    pub username: String,
    pub password: String,
    pub confirm_password: String,
}

/// A new account plus the one-time token that verifies its email address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Registration {
    pub account: AccountProfile,
    pub verification_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionGrant {
    pub token: String,
    pub account: AccountProfile,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateObjectRequest {
    pub external_number: String,
    pub title: String,
    pub classification: Classification,
    pub body: String,
    pub procedures: String,
    #[serde(default)]
    pub required_clearance: ClearanceLevel,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub discovery: DiscoveryMeta,
    #[serde(default)]
    pub associated_threats: Vec<String>,
    #[serde(default)]
    pub related_objects: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreatePostRequest {
    pub title: String,
    pub body: String,
    pub category: PostCategory,
    #[serde(default)]
    pub required_clearance: Option<ClearanceLevel>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub related_objects: Vec<String>,
    #[serde(default)]
    pub related_posts: Vec<String>,
    #[serde(default)]
    pub featured_image: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ArchiveApi {
    db_path: PathBuf,
}

impl ArchiveApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore, ArchiveError> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    /// Open a migrated store, run `op`, and log the failure class.
    fn with_store<T>(
        &self,
        operation: &'static str,
        op: impl FnOnce(&mut SqliteStore) -> Result<T, ArchiveError>,
    ) -> Result<T, ArchiveError> {
        let result = self.open_store().and_then(|mut store| op(&mut store));
        if let Err(err) = &result {
            match err {
                ArchiveError::Storage(_) => warn!(operation, error = %err, "storage failure"),
                _ => debug!(operation, code = err.code(), error = %err, "operation rejected"),
            }
        }
        result
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus, ArchiveError> {
        let store = SqliteStore::open(&self.db_path)?;
        Ok(store.schema_status()?)
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult, ArchiveError> {
        let mut store = SqliteStore::open(&self.db_path)?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        store.migrate()?;
        let after = store.schema_status()?;
        info!(from = before.current_version, to = after.current_version, "schema migrated");
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: before.pending_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Provision the first Admin. Refused once any Admin exists.
    ///
    /// The password is hashed up front; the Admin check and the insert then
    /// run in one store transaction, so racing callers provision one Admin.
    ///
    /// # Errors
    /// Returns [`DenyReason::AdminAlreadyProvisioned`] as `Forbidden`, or a
    /// validation, duplicate, or storage error.
    pub fn bootstrap_admin(
        &self,
        input: BootstrapAdminRequest,
    ) -> Result<AccountProfile, ArchiveError> {
        validate_password(&input.password)?;
        let mut account =
            new_account(&input.email, &input.username, hash_password(&input.password)?);
        account.role = Role::Admin;
        account.clearance = ClearanceLevel::HIGHEST;
        account.email_verified = true;
        account.department = Some(Department::Administration);
        account.position = Some(ADMIN_POSITION.to_string());

        self.with_store("bootstrap_admin", |store| {
            let Some(account) = store.insert_first_admin(account)? else {
                return Err(ArchiveError::Forbidden(DenyReason::AdminAlreadyProvisioned));
            };
            info!(account_id = %account.id, "admin account provisioned");
            Ok(account.profile())
        })
    }

    /// Create an unverified Reader account and issue its verification token.
    ///
    /// Email collisions are reported before username collisions.
    ///
    /// # Errors
    /// Returns a validation error for malformed fields or mismatched
    /// passwords, [`ArchiveError::DuplicateKey`] for a taken email or
    /// username, or a storage error.
    pub fn register(&self, input: RegisterRequest) -> Result<Registration, ArchiveError> {
        if input.password != input.confirm_password {
            return Err(ArchiveError::validation("passwords do not match"));
        }
        validate_password(&input.password)?;

        self.with_store("register", |store| {
            let mut account =
                new_account(&input.email, &input.username, hash_password(&input.password)?);
            account.position = Some(NEW_STAFF_POSITION.to_string());
            account.validate()?;
            ensure_identity_free(store, &account)?;

            let account = store.insert(account)?;
            let verification_token = generate_token();
            store.create_verification(account.id, &verification_token)?;
            info!(account_id = %account.id, "account registered");
            Ok(Registration { account: account.profile(), verification_token })
        })
    }

    /// Consume a verification token, mark the account verified, and open a session.
    ///
    /// # Errors
    /// Returns a validation error for an unknown or spent token.
    pub fn verify_email(&self, token: &str) -> Result<SessionGrant, ArchiveError> {
        self.with_store("verify_email", |store| {
            let Some(account_id) = store.consume_verification(token.trim())? else {
                return Err(ArchiveError::validation("invalid or expired verification token"));
            };
            let account = store.update::<Account>(
                account_id,
                AccountPatch { email_verified: Some(true), ..AccountPatch::default() },
            )?;
            info!(account_id = %account.id, "email verified");
            open_session(store, &account)
        })
    }

    /// Check credentials and open a session.
    ///
    /// Unknown email and wrong password produce the same error and both pay
    /// for one Argon2 verification. The verification check runs only after
    /// the password matched.
    ///
    /// # Errors
    /// Returns [`ArchiveError::Credential`] or `Forbidden(EmailNotVerified)`.
    pub fn login(&self, input: LoginRequest) -> Result<SessionGrant, ArchiveError> {
        self.with_store("login", |store| {
            let email = normalize_email(&input.email);
            let Some(account) = store.find_by_unique::<Account>("email", &email)? else {
                verify_without_account(&input.password)?;
                return Err(ArchiveError::Credential);
            };
            if !verify_password(&input.password, &account.password_hash)? {
                return Err(ArchiveError::Credential);
            }
            if !account.email_verified {
                return Err(ArchiveError::Forbidden(DenyReason::EmailNotVerified));
            }
            info!(account_id = %account.id, "session opened");
            open_session(store, &account)
        })
    }

    /// Returns whether the session existed.
    ///
    /// # Errors
    /// Returns a storage error when the session table cannot be written.
    pub fn logout(&self, token: &str) -> Result<bool, ArchiveError> {
        self.with_store("logout", |store| Ok(store.revoke_session(token)?))
    }

    /// Account behind a session token, or `None` for an unknown token.
    ///
    /// # Errors
    /// Returns a storage error when lookup fails.
    pub fn resolve_session(&self, token: &str) -> Result<Option<Account>, ArchiveError> {
        self.with_store("resolve_session", |store| {
            let Some(account_id) = store.session_account(token)? else {
                return Ok(None);
            };
            Ok(store.find_by_id::<Account>(account_id)?)
        })
    }

    /// Principal for an optional bearer token. No token means anonymous; an
    /// unknown token is rejected rather than silently downgraded.
    ///
    /// # Errors
    /// Returns `Forbidden(NotAuthenticated)` for an unknown token.
    pub fn resolve_principal(&self, token: Option<&str>) -> Result<Option<Principal>, ArchiveError> {
        let Some(token) = token else {
            return Ok(None);
        };
        match self.resolve_session(token)? {
            Some(account) => Ok(Some(account.principal())),
            None => Err(ArchiveError::Forbidden(DenyReason::NotAuthenticated)),
        }
    }

    /// Store `token` in the local current-session slot, or clear the slot.
    ///
    /// # Errors
    /// Returns a storage error when `token` is not a live session.
    pub fn remember_session(&self, token: Option<&str>) -> Result<(), ArchiveError> {
        self.with_store("remember_session", |store| Ok(store.set_current_session(token)?))
    }

    /// # Errors
    /// Returns a storage error when lookup fails.
    pub fn current_account(&self) -> Result<Option<Account>, ArchiveError> {
        self.with_store("current_account", |store| {
            let Some(account_id) = store.current_session_account()? else {
                return Ok(None);
            };
            Ok(store.find_by_id::<Account>(account_id)?)
        })
    }

    /// # Errors
    /// Returns a storage error when lookup fails.
    pub fn current_principal(&self) -> Result<Option<Principal>, ArchiveError> {
        Ok(self.current_account()?.map(|account| account.principal()))
    }

    /// Revoke the session held in the current-session slot.
    ///
    /// # Errors
    /// Returns a storage error when the revoke fails.
    pub fn logout_current(&self) -> Result<bool, ArchiveError> {
        self.with_store("logout_current", |store| Ok(store.revoke_current_session()?))
    }

    /// Edit a profile as its owner or as an Admin.
    ///
    /// # Errors
    /// Returns `Forbidden` when the requester may not make this edit,
    /// `NotFound` for an unknown target, or a validation/duplicate error.
    pub fn update_profile(
        &self,
        requester: Option<&Principal>,
        target: AccountId,
        patch: AccountPatch,
    ) -> Result<AccountProfile, ArchiveError> {
        self.with_store("update_profile", |store| {
            authorize_profile_update(requester, target, &patch).into_result()?;
            if store.find_by_id::<Account>(target)?.is_none() {
                return Err(ArchiveError::not_found(EntityKind::Account, target));
            }
            let account = store.update::<Account>(target, patch)?;
            info!(account_id = %account.id, "profile updated");
            Ok(account.profile())
        })
    }

    /// # Errors
    /// Returns `Forbidden` unless the requester is an Admin.
    pub fn list_accounts(
        &self,
        requester: Option<&Principal>,
    ) -> Result<Vec<AccountProfile>, ArchiveError> {
        self.with_store("list_accounts", |store| {
            authorize_mutation(requester, MutationAction::ViewAllAccounts).into_result()?;
            Ok(store.find_all::<Account>()?.iter().map(Account::profile).collect())
        })
    }

    /// # Errors
    /// Returns `Forbidden` for a non-Admin or for an Admin targeting themselves.
    pub fn set_account_role(
        &self,
        requester: Option<&Principal>,
        target: AccountId,
        role: Role,
    ) -> Result<AccountProfile, ArchiveError> {
        self.admin_account_update(
            "set_account_role",
            requester,
            target,
            MutationAction::AccountRoleChange { target },
            AccountPatch { role: Some(role), ..AccountPatch::default() },
        )
    }

    /// # Errors
    /// Returns `Forbidden` for a non-Admin or for an Admin targeting themselves.
    pub fn set_account_clearance(
        &self,
        requester: Option<&Principal>,
        target: AccountId,
        clearance: ClearanceLevel,
    ) -> Result<AccountProfile, ArchiveError> {
        self.admin_account_update(
            "set_account_clearance",
            requester,
            target,
            MutationAction::AccountClearanceChange { target },
            AccountPatch { clearance: Some(clearance), ..AccountPatch::default() },
        )
    }

    /// # Errors
    /// Returns `Forbidden` for a non-Admin.
    pub fn set_account_position(
        &self,
        requester: Option<&Principal>,
        target: AccountId,
        position: String,
    ) -> Result<AccountProfile, ArchiveError> {
        self.admin_account_update(
            "set_account_position",
            requester,
            target,
            MutationAction::AccountPositionChange { target },
            AccountPatch { position: Some(Some(position)), ..AccountPatch::default() },
        )
    }

    fn admin_account_update(
        &self,
        operation: &'static str,
        requester: Option<&Principal>,
        target: AccountId,
        action: MutationAction,
        patch: AccountPatch,
    ) -> Result<AccountProfile, ArchiveError> {
        self.with_store(operation, |store| {
            authorize_mutation(requester, action).into_result()?;
            let account = store.update::<Account>(target, patch)?;
            info!(operation, account_id = %account.id, "account updated by admin");
            Ok(account.profile())
        })
    }

    /// Content records the requester may read, in creation order.
    ///
    /// # Errors
    /// Returns a storage error when the collection cannot be read.
    pub fn list_objects(
        &self,
        requester: Option<&Principal>,
    ) -> Result<Vec<ContentRecord>, ArchiveError> {
        self.with_store("list_objects", |store| {
            let records = store.find_all::<ContentRecord>()?;
            Ok(filter_visible(requester, &records, ClearanceGated::required_clearance))
        })
    }

    /// # Errors
    /// Returns `NotFound` for an unknown id or `Forbidden` naming what the
    /// requester lacks.
    pub fn get_object(
        &self,
        requester: Option<&Principal>,
        id: ContentRecordId,
    ) -> Result<ContentRecord, ArchiveError> {
        self.with_store("get_object", |store| {
            let record = store
                .find_by_id::<ContentRecord>(id)?
                .ok_or_else(|| ArchiveError::not_found(EntityKind::ContentRecord, id))?;
            authorize_view(requester, record.required_clearance()).into_result()?;
            Ok(record)
        })
    }

    /// Look a content record up by its external number.
    ///
    /// # Errors
    /// Same as [`Self::get_object`].
    pub fn get_object_by_number(
        &self,
        requester: Option<&Principal>,
        external_number: &str,
    ) -> Result<ContentRecord, ArchiveError> {
        self.with_store("get_object_by_number", |store| {
            let number = external_number.trim();
            let record = store
                .find_by_unique::<ContentRecord>("external_number", number)?
                .ok_or_else(|| ArchiveError::not_found(EntityKind::ContentRecord, number))?;
            authorize_view(requester, record.required_clearance()).into_result()?;
            Ok(record)
        })
    }

    /// # Errors
    /// Returns `Forbidden` for a non-Admin, or a validation/duplicate error.
    pub fn create_object(
        &self,
        requester: Option<&Principal>,
        input: CreateObjectRequest,
    ) -> Result<ContentRecord, ArchiveError> {
        self.with_store("create_object", |store| {
            let principal = authorized_principal(requester, MutationAction::CreateContent)?;
            let now = OffsetDateTime::now_utc();
            let record = ContentRecord {
                id: ContentRecordId::new(),
                external_number: input.external_number.trim().to_string(),
                title: input.title,
                classification: input.classification,
                body: input.body,
                procedures: input.procedures,
                required_clearance: input.required_clearance,
                notes: input.notes,
                images: input.images,
                discovery: input.discovery,
                associated_threats: input.associated_threats,
                related_objects: input.related_objects,
                created_by: principal.id,
                created_at: now,
                updated_at: now,
            };
            let record = store.insert(record)?;
            info!(record_id = %record.id, external_number = %record.external_number, "content record created");
            Ok(record)
        })
    }

    /// # Errors
    /// Returns `Forbidden` for a non-Admin, `NotFound`, or a validation/duplicate error.
    pub fn update_object(
        &self,
        requester: Option<&Principal>,
        id: ContentRecordId,
        patch: ContentRecordPatch,
    ) -> Result<ContentRecord, ArchiveError> {
        self.with_store("update_object", |store| {
            authorize_mutation(requester, MutationAction::UpdateContent).into_result()?;
            let record = store.update::<ContentRecord>(id, patch)?;
            info!(record_id = %record.id, "content record updated");
            Ok(record)
        })
    }

    /// # Errors
    /// Returns `Forbidden` for a non-Admin or `NotFound`.
    pub fn delete_object(
        &self,
        requester: Option<&Principal>,
        id: ContentRecordId,
    ) -> Result<(), ArchiveError> {
        self.with_store("delete_object", |store| {
            authorize_mutation(requester, MutationAction::DeleteContent).into_result()?;
            store.delete::<ContentRecord>(id)?;
            info!(record_id = %id, "content record deleted");
            Ok(())
        })
    }

    /// Posts the requester may read, in creation order.
    ///
    /// # Errors
    /// Returns a storage error when the collection cannot be read.
    pub fn list_posts(&self, requester: Option<&Principal>) -> Result<Vec<Post>, ArchiveError> {
        self.with_store("list_posts", |store| {
            let posts = store.find_all::<Post>()?;
            Ok(filter_visible(requester, &posts, ClearanceGated::required_clearance))
        })
    }

    /// # Errors
    /// Returns `NotFound` or `Forbidden`.
    pub fn get_post(&self, requester: Option<&Principal>, id: PostId) -> Result<Post, ArchiveError> {
        self.with_store("get_post", |store| {
            let post = store
                .find_by_id::<Post>(id)?
                .ok_or_else(|| ArchiveError::not_found(EntityKind::Post, id))?;
            authorize_view(requester, post.required_clearance()).into_result()?;
            Ok(post)
        })
    }

    /// # Errors
    /// Returns `Forbidden` for a non-Admin, or a validation error.
    pub fn create_post(
        &self,
        requester: Option<&Principal>,
        input: CreatePostRequest,
    ) -> Result<Post, ArchiveError> {
        self.with_store("create_post", |store| {
            let principal = authorized_principal(requester, MutationAction::CreateContent)?;
            let author = store
                .find_by_id::<Account>(principal.id)?
                .ok_or_else(|| ArchiveError::not_found(EntityKind::Account, principal.id))?;
            let now = OffsetDateTime::now_utc();
            let post = Post {
                id: PostId::new(),
                title: input.title,
                body: input.body,
                category: input.category,
                author_id: author.id,
                author_name: author.username,
                required_clearance: input.required_clearance,
                summary: input.summary,
                tags: input.tags,
                related_objects: input.related_objects,
                related_posts: input.related_posts,
                featured_image: input.featured_image,
                created_at: now,
                updated_at: now,
            };
            let post = store.insert(post)?;
            info!(post_id = %post.id, "post created");
            Ok(post)
        })
    }

    /// # Errors
    /// Returns `Forbidden` for a non-Admin, `NotFound`, or a validation error.
    pub fn update_post(
        &self,
        requester: Option<&Principal>,
        id: PostId,
        patch: PostPatch,
    ) -> Result<Post, ArchiveError> {
        self.with_store("update_post", |store| {
            authorize_mutation(requester, MutationAction::UpdateContent).into_result()?;
            let post = store.update::<Post>(id, patch)?;
            info!(post_id = %post.id, "post updated");
            Ok(post)
        })
    }

    /// # Errors
    /// Returns `Forbidden` for a non-Admin or `NotFound`.
    pub fn delete_post(&self, requester: Option<&Principal>, id: PostId) -> Result<(), ArchiveError> {
        self.with_store("delete_post", |store| {
            authorize_mutation(requester, MutationAction::DeleteContent).into_result()?;
            store.delete::<Post>(id)?;
            info!(post_id = %id, "post deleted");
            Ok(())
        })
    }

    /// Wipe every collection and session. Returns the counts that were removed.
    ///
    /// # Errors
    /// Returns `Forbidden` unless the requester is an Admin.
    pub fn reset_database(
        &self,
        requester: Option<&Principal>,
    ) -> Result<CollectionCounts, ArchiveError> {
        self.with_store("reset_database", |store| {
            authorize_mutation(requester, MutationAction::ResetArchive).into_result()?;
            let removed = store.counts()?;
            store.reset()?;
            warn!(
                accounts = removed.accounts,
                content_records = removed.content_records,
                posts = removed.posts,
                "database reset"
            );
            Ok(removed)
        })
    }
}

fn authorized_principal(
    requester: Option<&Principal>,
    action: MutationAction,
) -> Result<Principal, ArchiveError> {
    authorize_mutation(requester, action).into_result()?;
    requester.copied().ok_or(ArchiveError::Forbidden(DenyReason::NotAuthenticated))
}

fn new_account(email: &str, username: &str, password_hash: String) -> Account {
    let now = OffsetDateTime::now_utc();
    Account {
        id: AccountId::new(),
        email: normalize_email(email),
        username: username.trim().to_string(),
        password_hash,
        role: Role::Reader,
        clearance: ClearanceLevel::LOWEST,
        email_verified: false,
        position: None,
        department: None,
        avatar_url: None,
        bio: None,
        created_at: now,
        updated_at: now,
    }
}

/// Email first, then username, so callers see a deterministic conflict field.
fn ensure_identity_free(store: &SqliteStore, account: &Account) -> Result<(), ArchiveError> {
    validate_email(&account.email)?;
    validate_username(&account.username)?;
    if store.find_by_unique::<Account>("email", &account.email)?.is_some() {
        return Err(ArchiveError::duplicate(EntityKind::Account, "email"));
    }
    if store.find_by_unique::<Account>("username", &account.username)?.is_some() {
        return Err(ArchiveError::duplicate(EntityKind::Account, "username"));
    }
    Ok(())
}

fn open_session(store: &mut SqliteStore, account: &Account) -> Result<SessionGrant, ArchiveError> {
    let token = generate_token();
    store.create_session(account.id, &token)?;
    Ok(SessionGrant { token, account: account.profile() })
}

#[cfg(test)]
mod tests {
    use anyhow::{anyhow, Result};
    use ulid::Ulid;

    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("sce-archive-api-{}.sqlite3", Ulid::new()))
    }

    fn expect_err<T: std::fmt::Debug>(result: Result<T, ArchiveError>) -> Result<ArchiveError> {
        match result {
            Ok(value) => Err(anyhow!("expected an error, got {value:?}")),
            Err(err) => Ok(err),
        }
    }

    fn admin(api: &ArchiveApi) -> Result<Principal> {
        api.bootstrap_admin(BootstrapAdminRequest {
            email: "director@sce.example".to_string(),
            username: "director".to_string(),
            password: "director-password".to_string(),
        })?;
        let grant = api.login(LoginRequest {
            email: "director@sce.example".to_string(),
            password: "director-password".to_string(),
        })?;
        api.resolve_principal(Some(&grant.token))?.ok_or_else(|| anyhow!("admin session missing"))
    }

    fn verified_reader(api: &ArchiveApi, name: &str) -> Result<(Principal, String)> {
        let registration = api.register(RegisterRequest {
            email: format!("{name}@sce.example"),
            username: name.to_string(),
            password: "reader-password".to_string(),
            confirm_password: "reader-password".to_string(),
        })?;
        let grant = api.verify_email(&registration.verification_token)?;
        let principal = api
            .resolve_principal(Some(&grant.token))?
            .ok_or_else(|| anyhow!("reader session missing"))?;
        Ok((principal, grant.token))
    }

    fn object_request(number: &str, clearance: ClearanceLevel) -> CreateObjectRequest {
        CreateObjectRequest {
            external_number: number.to_string(),
            title: format!("Object {number}"),
            classification: Classification::Safe,
            body: "An unremarkable brass key.".to_string(),
            procedures: "Store in locker 12.".to_string(),
            required_clearance: clearance,
            notes: None,
            images: Vec::new(),
            discovery: DiscoveryMeta::default(),
            associated_threats: Vec::new(),
            related_objects: Vec::new(),
        }
    }

    fn post_request(title: &str, clearance: Option<ClearanceLevel>) -> CreatePostRequest {
        CreatePostRequest {
            title: title.to_string(),
            body: "Body text.".to_string(),
            category: PostCategory::News,
            required_clearance: clearance,
            summary: None,
            tags: Vec::new(),
            related_objects: Vec::new(),
            related_posts: Vec::new(),
            featured_image: None,
        }
    }

    #[test]
    fn register_verify_and_login_flow() -> Result<()> {
        let api = ArchiveApi::new(unique_temp_db_path());
        let registration = api.register(RegisterRequest {
            email: " New.Agent@SCE.example ".to_string(),
            username: "new-agent".to_string(),
            password: "agent-password".to_string(),
            confirm_password: "agent-password".to_string(),
        })?;
        assert_eq!(registration.account.email, "new.agent@sce.example");
        assert_eq!(registration.account.role, Role::Reader);
        assert_eq!(registration.account.clearance, ClearanceLevel::Level1);
        assert!(!registration.account.email_verified);

        let login = LoginRequest {
            email: "new.agent@sce.example".to_string(),
            password: "agent-password".to_string(),
        };
        let err = expect_err(api.login(login.clone()))?;
        assert_eq!(err, ArchiveError::Forbidden(DenyReason::EmailNotVerified));

        let grant = api.verify_email(&registration.verification_token)?;
        assert!(grant.account.email_verified);
        assert!(api.verify_email(&registration.verification_token).is_err());

        let grant = api.login(login)?;
        let account = api.resolve_session(&grant.token)?.ok_or_else(|| anyhow!("no session"))?;
        assert_eq!(account.id, registration.account.id);

        assert!(api.logout(&grant.token)?);
        assert!(api.resolve_session(&grant.token)?.is_none());
        Ok(())
    }

    #[test]
    fn login_failures_share_one_error() -> Result<()> {
        let api = ArchiveApi::new(unique_temp_db_path());
        verified_reader(&api, "known")?;

        let unknown = expect_err(api.login(LoginRequest {
            email: "nobody@sce.example".to_string(),
            password: "reader-password".to_string(),
        }))?;
        let wrong = expect_err(api.login(LoginRequest {
            email: "known@sce.example".to_string(),
            password: "not-the-password".to_string(),
        }))?;
        assert_eq!(unknown, ArchiveError::Credential);
        assert_eq!(unknown.to_string(), wrong.to_string());
        Ok(())
    }

    #[test]
    fn register_reports_email_before_username_and_checks_confirmation() -> Result<()> {
        let api = ArchiveApi::new(unique_temp_db_path());
        verified_reader(&api, "taken")?;

        let both = expect_err(api.register(RegisterRequest {
            email: "taken@sce.example".to_string(),
            username: "taken".to_string(),
            password: "reader-password".to_string(),
            confirm_password: "reader-password".to_string(),
        }))?;
        assert_eq!(both, ArchiveError::duplicate(EntityKind::Account, "email"));

        let username = expect_err(api.register(RegisterRequest {
            email: "fresh@sce.example".to_string(),
            username: "taken".to_string(),
            password: "reader-password".to_string(),
            confirm_password: "reader-password".to_string(),
        }))?;
        assert_eq!(username, ArchiveError::duplicate(EntityKind::Account, "username"));

        let mismatch = expect_err(api.register(RegisterRequest {
            email: "other@sce.example".to_string(),
            username: "other".to_string(),
            password: "reader-password".to_string(),
            confirm_password: "different-password".to_string(),
        }))?;
        assert!(matches!(mismatch, ArchiveError::Validation(_)));
        Ok(())
    }

    #[test]
    fn bootstrap_admin_runs_once() -> Result<()> {
        let api = ArchiveApi::new(unique_temp_db_path());
        let principal = admin(&api)?;
        assert!(principal.is_admin());
        assert_eq!(principal.clearance, ClearanceLevel::HIGHEST);

        let again = expect_err(api.bootstrap_admin(BootstrapAdminRequest {
            email: "second@sce.example".to_string(),
            username: "second".to_string(),
            password: "second-password".to_string(),
        }))?;
        assert_eq!(again, ArchiveError::Forbidden(DenyReason::AdminAlreadyProvisioned));
        Ok(())
    }

    #[test]
    fn racing_bootstrap_calls_provision_one_admin() -> Result<()> {
        let db_path = unique_temp_db_path();
        ArchiveApi::new(db_path.clone()).migrate(false)?;

        let mut handles = Vec::new();
        for index in 0..4 {
            let api = ArchiveApi::new(db_path.clone());
            handles.push(std::thread::spawn(move || {
                api.bootstrap_admin(BootstrapAdminRequest {
                    email: format!("director-{index}@sce.example"),
                    username: format!("director-{index}"),
                    password: "director-password".to_string(),
                })
            }));
        }

        let mut provisioned = 0;
        for handle in handles {
            let Ok(result) = handle.join() else {
                return Err(anyhow!("bootstrap thread panicked"));
            };
            match result {
                Ok(profile) => {
                    assert_eq!(profile.role, Role::Admin);
                    provisioned += 1;
                }
                Err(err) => {
                    assert_eq!(err, ArchiveError::Forbidden(DenyReason::AdminAlreadyProvisioned));
                }
            }
        }
        assert_eq!(provisioned, 1);
        Ok(())
    }

    #[test]
    fn first_registrant_is_not_promoted() -> Result<()> {
        let api = ArchiveApi::new(unique_temp_db_path());
        let (first, _) = verified_reader(&api, "first")?;
        assert_eq!(first.role, Role::Reader);
        assert_eq!(first.clearance, ClearanceLevel::Level1);
        Ok(())
    }

    #[test]
    fn object_reads_are_filtered_by_clearance() -> Result<()> {
        let api = ArchiveApi::new(unique_temp_db_path());
        let admin = admin(&api)?;
        let (reader, _) = verified_reader(&api, "reader")?;

        let public = api.create_object(Some(&admin), object_request("001", ClearanceLevel::Level1))?;
        let secret = api.create_object(Some(&admin), object_request("002", ClearanceLevel::Level3))?;

        let anonymous = api.list_objects(None)?;
        assert_eq!(anonymous.iter().map(|r| r.id).collect::<Vec<_>>(), vec![public.id]);
        let as_reader = api.list_objects(Some(&reader))?;
        assert_eq!(as_reader.len(), 1);
        let as_admin = api.list_objects(Some(&admin))?;
        assert_eq!(as_admin.iter().map(|r| r.id).collect::<Vec<_>>(), vec![public.id, secret.id]);

        let denied = expect_err(api.get_object(Some(&reader), secret.id))?;
        assert_eq!(
            denied,
            ArchiveError::Forbidden(DenyReason::InsufficientClearance {
                required: ClearanceLevel::Level3
            })
        );
        let anonymous_denied = expect_err(api.get_object_by_number(None, "002"))?;
        assert_eq!(anonymous_denied, ArchiveError::Forbidden(DenyReason::NotAuthenticated));
        assert_eq!(api.get_object_by_number(None, "001")?.id, public.id);
        Ok(())
    }

    #[test]
    fn only_admins_mutate_content() -> Result<()> {
        let api = ArchiveApi::new(unique_temp_db_path());
        let admin = admin(&api)?;
        let (reader, _) = verified_reader(&api, "curious")?;

        let denied = expect_err(api.create_object(Some(&reader), object_request("003", ClearanceLevel::Level1)))?;
        assert_eq!(
            denied,
            ArchiveError::Forbidden(DenyReason::InsufficientRole { required: Role::Admin })
        );
        let anonymous = expect_err(api.create_post(None, post_request("Leak", None)))?;
        assert_eq!(anonymous, ArchiveError::Forbidden(DenyReason::NotAuthenticated));

        let record = api.create_object(Some(&admin), object_request("003", ClearanceLevel::Level1))?;
        let duplicate = expect_err(api.create_object(Some(&admin), object_request("003", ClearanceLevel::Level2)))?;
        assert_eq!(duplicate, ArchiveError::duplicate(EntityKind::ContentRecord, "external_number"));

        let updated = api.update_object(
            Some(&admin),
            record.id,
            ContentRecordPatch { classification: Some(Classification::Keter), ..ContentRecordPatch::default() },
        )?;
        assert_eq!(updated.classification, Classification::Keter);
        assert!(updated.updated_at > record.updated_at);

        assert!(api.delete_object(Some(&reader), record.id).is_err());
        api.delete_object(Some(&admin), record.id)?;
        let gone = expect_err(api.delete_object(Some(&admin), record.id))?;
        assert!(matches!(gone, ArchiveError::NotFound { entity: EntityKind::ContentRecord, .. }));
        Ok(())
    }

    #[test]
    fn posts_record_author_and_respect_optional_clearance() -> Result<()> {
        let api = ArchiveApi::new(unique_temp_db_path());
        let admin = admin(&api)?;

        let open = api.create_post(Some(&admin), post_request("Open day", None))?;
        let restricted =
            api.create_post(Some(&admin), post_request("Incident 7", Some(ClearanceLevel::Level2)))?;
        assert_eq!(open.author_name, "director");

        let anonymous = api.list_posts(None)?;
        assert_eq!(anonymous.iter().map(|p| p.id).collect::<Vec<_>>(), vec![open.id]);
        assert!(api.get_post(None, restricted.id).is_err());
        assert_eq!(api.get_post(Some(&admin), restricted.id)?.title, "Incident 7");

        let edited = api.update_post(
            Some(&admin),
            open.id,
            PostPatch { summary: Some(Some("Visitors welcome".to_string())), ..PostPatch::default() },
        )?;
        assert_eq!(edited.summary.as_deref(), Some("Visitors welcome"));
        api.delete_post(Some(&admin), restricted.id)?;
        assert_eq!(api.list_posts(Some(&admin))?.len(), 1);
        Ok(())
    }

    #[test]
    fn clearing_post_restriction_makes_it_public_again() -> Result<()> {
        let api = ArchiveApi::new(unique_temp_db_path());
        let admin = admin(&api)?;
        let mut request = post_request("Site closure", None);
        request.summary = Some("Temporary".to_string());
        let post = api.create_post(Some(&admin), request)?;

        api.update_post(
            Some(&admin),
            post.id,
            PostPatch {
                required_clearance: Some(Some(ClearanceLevel::Level3)),
                ..PostPatch::default()
            },
        )?;
        assert!(api.list_posts(None)?.is_empty());

        let reopened = api.update_post(
            Some(&admin),
            post.id,
            PostPatch {
                required_clearance: Some(None),
                summary: Some(None),
                ..PostPatch::default()
            },
        )?;
        assert_eq!(reopened.required_clearance, None);
        assert_eq!(reopened.summary, None);
        assert_eq!(reopened.title, "Site closure");
        assert_eq!(api.list_posts(None)?.iter().map(|p| p.id).collect::<Vec<_>>(), vec![post.id]);
        Ok(())
    }

    #[test]
    fn profile_updates_enforce_ownership_and_admin_fields() -> Result<()> {
        let api = ArchiveApi::new(unique_temp_db_path());
        let admin = admin(&api)?;
        let (alice, _) = verified_reader(&api, "alice")?;
        let (bob, _) = verified_reader(&api, "bob")?;

        let own = api.update_profile(
            Some(&alice),
            alice.id,
            AccountPatch { bio: Some(Some("Archivist".to_string())), ..AccountPatch::default() },
        )?;
        assert_eq!(own.bio.as_deref(), Some("Archivist"));

        let other = expect_err(api.update_profile(Some(&bob), alice.id, AccountPatch::default()))?;
        assert_eq!(other, ArchiveError::Forbidden(DenyReason::NotOwner));

        let escalate = expect_err(api.update_profile(
            Some(&alice),
            alice.id,
            AccountPatch { clearance: Some(ClearanceLevel::Level5), ..AccountPatch::default() },
        ))?;
        assert!(matches!(escalate, ArchiveError::Forbidden(DenyReason::AdminOnlyField { .. })));

        let self_demote = expect_err(api.set_account_role(Some(&admin), admin.id, Role::Reader))?;
        assert!(matches!(self_demote, ArchiveError::Forbidden(DenyReason::SelfModification { .. })));

        let promoted = api.set_account_clearance(Some(&admin), alice.id, ClearanceLevel::Level4)?;
        assert_eq!(promoted.clearance, ClearanceLevel::Level4);
        let role = api.set_account_role(Some(&admin), bob.id, Role::Researcher)?;
        assert_eq!(role.role, Role::Researcher);
        let position = api.set_account_position(Some(&admin), bob.id, "Senior Researcher".to_string())?;
        assert_eq!(position.position.as_deref(), Some("Senior Researcher"));

        assert!(api.list_accounts(Some(&alice)).is_err());
        assert_eq!(api.list_accounts(Some(&admin))?.len(), 3);
        Ok(())
    }

    #[test]
    fn unknown_bearer_token_is_rejected() -> Result<()> {
        let api = ArchiveApi::new(unique_temp_db_path());
        let err = expect_err(api.resolve_principal(Some("not-a-session")))?;
        assert_eq!(err, ArchiveError::Forbidden(DenyReason::NotAuthenticated));
        assert_eq!(api.resolve_principal(None)?, None);
        Ok(())
    }

    #[test]
    fn current_session_slot_tracks_login_and_logout() -> Result<()> {
        let api = ArchiveApi::new(unique_temp_db_path());
        let (reader, token) = verified_reader(&api, "slot")?;

        api.remember_session(Some(&token))?;
        assert_eq!(api.current_principal()?.map(|p| p.id), Some(reader.id));
        assert!(api.logout_current()?);
        assert_eq!(api.current_principal()?, None);
        Ok(())
    }

    #[test]
    fn reset_requires_admin_and_empties_everything() -> Result<()> {
        let api = ArchiveApi::new(unique_temp_db_path());
        let admin = admin(&api)?;
        let (reader, _) = verified_reader(&api, "bystander")?;
        api.create_object(Some(&admin), object_request("999", ClearanceLevel::Level5))?;

        assert!(api.reset_database(Some(&reader)).is_err());
        let removed = api.reset_database(Some(&admin))?;
        assert_eq!(removed.accounts, 2);
        assert_eq!(removed.content_records, 1);
        assert!(api.list_objects(None)?.is_empty());
        Ok(())
    }

    #[test]
    fn migrate_dry_run_plans_without_applying() -> Result<()> {
        let api = ArchiveApi::new(unique_temp_db_path());
        let planned = api.migrate(true)?;
        assert_eq!(planned.current_version, 0);
        assert_eq!(planned.would_apply_versions, vec![1, 2]);
        assert_eq!(api.schema_status()?.current_version, 0);

        let applied = api.migrate(false)?;
        assert_eq!(applied.after_version, Some(2));
        assert_eq!(applied.up_to_date, Some(true));
        Ok(())
    }
}
