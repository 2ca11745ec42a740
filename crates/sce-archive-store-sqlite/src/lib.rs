use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Context};
use rusqlite::{
    params, params_from_iter, Connection, DatabaseName, OptionalExtension, TransactionBehavior,
};
use sce_archive_core::{
    Account, AccountId, AccountPatch, ArchiveError, ContentRecord, ContentRecordId,
    ContentRecordPatch, EntityKind, Post, PostId, PostPatch,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};

const LATEST_SCHEMA_VERSION: i64 = 2;

const ACCOUNTS_FILE: &str = "accounts.ndjson";
const CONTENT_RECORDS_FILE: &str = "content_records.ndjson";
const POSTS_FILE: &str = "posts.ndjson";
const MANIFEST_FILE: &str = "manifest.json";

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS accounts (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  id TEXT NOT NULL UNIQUE,
  email TEXT NOT NULL UNIQUE,
  username TEXT NOT NULL UNIQUE,
  document_json TEXT NOT NULL CHECK (json_valid(document_json))
);

CREATE TABLE IF NOT EXISTS content_records (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  id TEXT NOT NULL UNIQUE,
  external_number TEXT NOT NULL UNIQUE,
  document_json TEXT NOT NULL CHECK (json_valid(document_json))
);

CREATE TABLE IF NOT EXISTS posts (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  id TEXT NOT NULL UNIQUE,
  document_json TEXT NOT NULL CHECK (json_valid(document_json))
);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS sessions (
  token_hash TEXT PRIMARY KEY,
  account_id TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (account_id) REFERENCES accounts(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS current_session (
  slot INTEGER PRIMARY KEY CHECK (slot = 1),
  token_hash TEXT NOT NULL,
  FOREIGN KEY (token_hash) REFERENCES sessions(token_hash) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS email_verifications (
  token_hash TEXT PRIMARY KEY,
  account_id TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (account_id) REFERENCES accounts(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_sessions_account ON sessions(account_id);
CREATE INDEX IF NOT EXISTS idx_email_verifications_account ON email_verifications(account_id);
";

const RESET_SQL: &str = r"
DELETE FROM current_session;
DELETE FROM sessions;
DELETE FROM email_verifications;
DELETE FROM posts;
DELETE FROM content_records;
DELETE FROM accounts;
";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} {field} is already in use")]
    DuplicateKey { entity: EntityKind, field: String },
    #[error("{entity} not found: {id}")]
    NotFound { entity: EntityKind, id: String },
    #[error("validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Backend(anyhow::Error::new(err))
    }
}

impl From<StoreError> for ArchiveError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateKey { entity, field } => Self::DuplicateKey { entity, field },
            StoreError::NotFound { entity, id } => Self::NotFound { entity, id },
            StoreError::Validation(message) => Self::Validation(message),
            StoreError::Backend(err) => Self::Storage(format!("{err:#}")),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A document kept in one of the named collections.
///
/// Each collection is a table of `(seq, id, <unique columns>, document_json)`.
/// `seq` preserves insertion order and the unique columns mirror the fields
/// that must not collide.
pub trait StoredEntity: Serialize + DeserializeOwned + Clone {
    type Id: Copy + Display;
    type Patch;

    const KIND: EntityKind;
    const TABLE: &'static str;
    const UNIQUE_COLUMNS: &'static [&'static str];

    fn id(&self) -> Self::Id;

    /// Values for [`Self::UNIQUE_COLUMNS`], in the same order.
    fn unique_values(&self) -> Vec<String>;

    /// # Errors
    /// Returns [`ArchiveError::Validation`] when the document is not storable.
    fn validate(&self) -> Result<(), ArchiveError>;

    fn apply_patch(&mut self, patch: Self::Patch);

    fn updated_at(&self) -> OffsetDateTime;

    fn set_updated_at(&mut self, at: OffsetDateTime);
}

impl StoredEntity for Account {
    type Id = AccountId;
    type Patch = AccountPatch;

    const KIND: EntityKind = EntityKind::Account;
    const TABLE: &'static str = "accounts";
    const UNIQUE_COLUMNS: &'static [&'static str] = &["email", "username"];

    fn id(&self) -> AccountId {
        self.id
    }

    fn unique_values(&self) -> Vec<String> {
        vec![self.email.clone(), self.username.clone()]
    }

    fn validate(&self) -> Result<(), ArchiveError> {
        Account::validate(self)
    }

    fn apply_patch(&mut self, patch: AccountPatch) {
        patch.apply_to(self);
    }

    fn updated_at(&self) -> OffsetDateTime {
        self.updated_at
    }

    fn set_updated_at(&mut self, at: OffsetDateTime) {
        self.updated_at = at;
    }
}

impl StoredEntity for ContentRecord {
    type Id = ContentRecordId;
    type Patch = ContentRecordPatch;

    const KIND: EntityKind = EntityKind::ContentRecord;
    const TABLE: &'static str = "content_records";
    const UNIQUE_COLUMNS: &'static [&'static str] = &["external_number"];

    fn id(&self) -> ContentRecordId {
        self.id
    }

    fn unique_values(&self) -> Vec<String> {
        vec![self.external_number.clone()]
    }

    fn validate(&self) -> Result<(), ArchiveError> {
        ContentRecord::validate(self)
    }

    fn apply_patch(&mut self, patch: ContentRecordPatch) {
        patch.apply_to(self);
    }

    fn updated_at(&self) -> OffsetDateTime {
        self.updated_at
    }

    fn set_updated_at(&mut self, at: OffsetDateTime) {
        self.updated_at = at;
    }
}

impl StoredEntity for Post {
    type Id = PostId;
    type Patch = PostPatch;

    const KIND: EntityKind = EntityKind::Post;
    const TABLE: &'static str = "posts";
    const UNIQUE_COLUMNS: &'static [&'static str] = &[];

    fn id(&self) -> PostId {
        self.id
    }

    fn unique_values(&self) -> Vec<String> {
        Vec::new()
    }

    fn validate(&self) -> Result<(), ArchiveError> {
        Post::validate(self)
    }

    fn apply_patch(&mut self, patch: PostPatch) {
        patch.apply_to(self);
    }

    fn updated_at(&self) -> OffsetDateTime {
        self.updated_at
    }

    fn set_updated_at(&mut self, at: OffsetDateTime) {
        self.updated_at = at;
    }
}

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported_accounts: usize,
    pub skipped_existing_accounts: usize,
    pub imported_content_records: usize,
    pub skipped_existing_content_records: usize,
    pub imported_posts: usize,
    pub skipped_existing_posts: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollectionCounts {
    pub accounts: usize,
    pub content_records: usize,
    pub posts: usize,
}

impl SqliteStore {
    /// Open a SQLite-backed archive store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> StoreResult<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when a migration step fails or the database is newer
    /// than this build understands.
    pub fn migrate(&mut self) -> StoreResult<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected at most {LATEST_SCHEMA_VERSION}"
            )
            .into());
        }

        for (target, sql) in [(1_i64, MIGRATION_001_SQL), (2_i64, MIGRATION_002_SQL)] {
            if version < target {
                self.apply_migration(target, sql)?;
            }
        }

        Ok(())
    }

    fn apply_migration(&mut self, version: i64, sql: &str) -> StoreResult<()> {
        let tx = self
            .conn
            .transaction()
            .with_context(|| format!("failed to start migration v{version} transaction"))?;
        tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
        record_schema_version(&tx, version)?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        Ok(())
    }

    /// Insert one document into its collection.
    ///
    /// The id and every unique column are checked inside one `IMMEDIATE`
    /// transaction, so a concurrent writer on another connection waits for
    /// this one to finish before running its own checks.
    ///
    /// # Errors
    /// Returns [`StoreError::Validation`] for an invalid document,
    /// [`StoreError::DuplicateKey`] naming the colliding field, or a backend error.
    pub fn insert<E: StoredEntity>(&mut self, entity: E) -> StoreResult<E> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start insert transaction")?;
        insert_document(&tx, &entity)?;
        tx.commit().context("failed to commit insert transaction")?;
        Ok(entity)
    }

    /// Insert an Admin account only while no Admin exists yet.
    ///
    /// The existence check and the insert share one `IMMEDIATE` transaction,
    /// so concurrent callers provision at most one Admin. Returns `None` when
    /// an Admin was already present.
    ///
    /// # Errors
    /// Same as [`Self::insert`].
    pub fn insert_first_admin(&mut self, account: Account) -> StoreResult<Option<Account>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start admin provisioning transaction")?;
        let admin_exists = tx
            .query_row(
                "SELECT EXISTS(
                   SELECT 1 FROM accounts WHERE json_extract(document_json, '$.role') = 'admin'
                 )",
                [],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to check for an existing admin")?;
        if admin_exists == 1 {
            return Ok(None);
        }
        insert_document(&tx, &account)?;
        tx.commit().context("failed to commit admin provisioning transaction")?;
        Ok(Some(account))
    }

    /// Every document in the collection, in insertion order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn find_all<E: StoredEntity>(&self) -> StoreResult<Vec<E>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT document_json FROM {} ORDER BY seq ASC", E::TABLE))?;
        let mut rows = stmt.query([])?;
        let mut documents = Vec::new();
        while let Some(row) = rows.next()? {
            let json: String = row.get(0)?;
            documents.push(decode_document::<E>(&json)?);
        }
        Ok(documents)
    }

    /// # Errors
    /// Returns an error when lookup or decoding fails.
    pub fn find_by_id<E: StoredEntity>(&self, id: E::Id) -> StoreResult<Option<E>> {
        load_document::<E>(&self.conn, &id.to_string())
    }

    /// Look a document up by one of its unique columns.
    ///
    /// # Errors
    /// Returns an error when `column` is not a unique column of the collection,
    /// or lookup fails.
    pub fn find_by_unique<E: StoredEntity>(
        &self,
        column: &str,
        value: &str,
    ) -> StoreResult<Option<E>> {
        let Some(column) = E::UNIQUE_COLUMNS.iter().find(|candidate| **candidate == column) else {
            return Err(anyhow!("{column} is not a unique column of {}", E::TABLE).into());
        };
        let json = self
            .conn
            .query_row(
                &format!("SELECT document_json FROM {} WHERE {column} = ?1", E::TABLE),
                params![value],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        json.map(|json| decode_document::<E>(&json)).transpose()
    }

    /// Merge `patch` into the stored document and bump `updated_at`.
    ///
    /// The new `updated_at` is strictly later than the previous one even when
    /// the wall clock has not advanced.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] for an unknown id, a validation or
    /// duplicate-key error for the merged document, or a backend error.
    pub fn update<E: StoredEntity>(&mut self, id: E::Id, patch: E::Patch) -> StoreResult<E> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start update transaction")?;

        let id = id.to_string();
        let Some(mut entity) = load_document::<E>(&tx, &id)? else {
            return Err(StoreError::NotFound { entity: E::KIND, id });
        };

        let previous = entity.updated_at();
        entity.apply_patch(patch);
        entity.set_updated_at(next_timestamp(previous));
        entity.validate().map_err(validation_error)?;
        ensure_unique(&tx, &entity, Some(&id))?;

        let document = serde_json::to_string(&entity)
            .with_context(|| format!("failed to serialize {}", E::KIND))?;
        let mut values = entity.unique_values();
        values.push(document);
        values.push(id);

        let assignments = E::UNIQUE_COLUMNS
            .iter()
            .copied()
            .chain(std::iter::once("document_json"))
            .enumerate()
            .map(|(index, column)| format!("{column} = ?{}", index + 1))
            .collect::<Vec<_>>();
        let sql = format!(
            "UPDATE {} SET {} WHERE id = ?{}",
            E::TABLE,
            assignments.join(", "),
            values.len()
        );

        tx.execute(&sql, params_from_iter(values.iter()))
            .map_err(unique_violation::<E>)?;
        tx.commit().context("failed to commit update transaction")?;
        Ok(entity)
    }

    /// # Errors
    /// Returns [`StoreError::NotFound`] when no document has this id, including
    /// when it was already deleted.
    pub fn delete<E: StoredEntity>(&mut self, id: E::Id) -> StoreResult<()> {
        let id = id.to_string();
        let removed = self
            .conn
            .execute(&format!("DELETE FROM {} WHERE id = ?1", E::TABLE), params![id])
            .with_context(|| format!("failed to delete {}", E::KIND))?;
        if removed == 0 {
            return Err(StoreError::NotFound { entity: E::KIND, id });
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count<E: StoredEntity>(&self) -> StoreResult<usize> {
        let count = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", E::TABLE),
            [],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// # Errors
    /// Returns an error when any count query fails.
    pub fn counts(&self) -> StoreResult<CollectionCounts> {
        Ok(CollectionCounts {
            accounts: self.count::<Account>()?,
            content_records: self.count::<ContentRecord>()?,
            posts: self.count::<Post>()?,
        })
    }

    /// Remove every document, session, and pending verification. The schema
    /// and its migration history are kept.
    ///
    /// # Errors
    /// Returns an error when the reset transaction fails.
    pub fn reset(&mut self) -> StoreResult<()> {
        let tx = self.conn.transaction().context("failed to start reset transaction")?;
        tx.execute_batch(RESET_SQL).context("failed to clear collections")?;
        tx.commit().context("failed to commit reset transaction")?;
        Ok(())
    }

    /// Record a session for `account_id`. Only the digest of `token` is kept.
    ///
    /// # Errors
    /// Returns an error when the account does not exist or the insert fails.
    pub fn create_session(&mut self, account_id: AccountId, token: &str) -> StoreResult<()> {
        self.conn
            .execute(
                "INSERT INTO sessions(token_hash, account_id, created_at) VALUES (?1, ?2, ?3)",
                params![token_digest(token), account_id.to_string(), now_rfc3339()?],
            )
            .context("failed to persist session")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the lookup fails or the stored id is malformed.
    pub fn session_account(&self, token: &str) -> StoreResult<Option<AccountId>> {
        let raw = self
            .conn
            .query_row(
                "SELECT account_id FROM sessions WHERE token_hash = ?1",
                params![token_digest(token)],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        raw.map(|raw| parse_account_id(&raw)).transpose()
    }

    /// Revoke one session. Returns whether it existed.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn revoke_session(&mut self, token: &str) -> StoreResult<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM sessions WHERE token_hash = ?1", params![token_digest(token)])
            .context("failed to revoke session")?;
        Ok(removed > 0)
    }

    /// Revoke whichever session the current-session slot points at. The slot
    /// is cleared by the cascade.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn revoke_current_session(&mut self) -> StoreResult<bool> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM sessions
                 WHERE token_hash = (SELECT token_hash FROM current_session WHERE slot = 1)",
                [],
            )
            .context("failed to revoke current session")?;
        Ok(removed > 0)
    }

    /// Point the single current-session slot at `token`, or clear it.
    ///
    /// # Errors
    /// Returns an error when `token` is not a live session or the write fails.
    pub fn set_current_session(&mut self, token: Option<&str>) -> StoreResult<()> {
        let tx = self.conn.transaction().context("failed to start session slot transaction")?;
        tx.execute("DELETE FROM current_session", []).context("failed to clear session slot")?;
        if let Some(token) = token {
            tx.execute(
                "INSERT INTO current_session(slot, token_hash) VALUES (1, ?1)",
                params![token_digest(token)],
            )
            .context("failed to write session slot")?;
        }
        tx.commit().context("failed to commit session slot transaction")?;
        Ok(())
    }

    /// Account behind the current-session slot, if the slot holds a live session.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn current_session_account(&self) -> StoreResult<Option<AccountId>> {
        let raw = self
            .conn
            .query_row(
                "SELECT sessions.account_id
                 FROM current_session
                 JOIN sessions ON sessions.token_hash = current_session.token_hash
                 WHERE current_session.slot = 1",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        raw.map(|raw| parse_account_id(&raw)).transpose()
    }

    /// # Errors
    /// Returns an error when the account does not exist or the insert fails.
    pub fn create_verification(&mut self, account_id: AccountId, token: &str) -> StoreResult<()> {
        self.conn
            .execute(
                "INSERT INTO email_verifications(token_hash, account_id, created_at)
                 VALUES (?1, ?2, ?3)",
                params![token_digest(token), account_id.to_string(), now_rfc3339()?],
            )
            .context("failed to persist email verification token")?;
        Ok(())
    }

    /// Consume a verification token, returning the account it was issued for.
    /// A token can be consumed once.
    ///
    /// # Errors
    /// Returns an error when the lookup or delete fails.
    pub fn consume_verification(&mut self, token: &str) -> StoreResult<Option<AccountId>> {
        let digest = token_digest(token);
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start verification transaction")?;
        let raw = tx
            .query_row(
                "SELECT account_id FROM email_verifications WHERE token_hash = ?1",
                params![digest],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        if raw.is_some() {
            tx.execute("DELETE FROM email_verifications WHERE token_hash = ?1", params![digest])
                .context("failed to consume verification token")?;
        }
        tx.commit().context("failed to commit verification transaction")?;
        raw.map(|raw| parse_account_id(&raw)).transpose()
    }

    /// Export all three collections as deterministic NDJSON plus a manifest.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or serialized.
    pub fn export_snapshot(&self, out_dir: &Path) -> StoreResult<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let accounts = self.find_all::<Account>()?;
        let content_records = self.find_all::<ContentRecord>()?;
        let posts = self.find_all::<Post>()?;

        let files = vec![
            export_file(out_dir, ACCOUNTS_FILE, &accounts)?,
            export_file(out_dir, CONTENT_RECORDS_FILE, &content_records)?,
            export_file(out_dir, POSTS_FILE, &posts)?,
        ];

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            exported_at: now_rfc3339()?,
            files,
        };

        let manifest_path = out_dir.join(MANIFEST_FILE);
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        Ok(manifest)
    }

    /// Import an exported snapshot directory into this database.
    ///
    /// All three collections are written in one transaction: on any error
    /// nothing from the snapshot is kept.
    ///
    /// # Errors
    /// Returns an error when the manifest does not match the files, a document
    /// collides with an existing one, or a write fails.
    pub fn import_snapshot(&mut self, in_dir: &Path, skip_existing: bool) -> StoreResult<ImportSummary> {
        self.migrate()?;
        let manifest = read_export_manifest(&in_dir.join(MANIFEST_FILE))?;
        validate_import_manifest(in_dir, &manifest)?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start import transaction")?;
        let mut summary = ImportSummary::default();
        (summary.imported_accounts, summary.skipped_existing_accounts) =
            import_collection::<Account>(&tx, &in_dir.join(ACCOUNTS_FILE), skip_existing)?;
        (summary.imported_content_records, summary.skipped_existing_content_records) =
            import_collection::<ContentRecord>(&tx, &in_dir.join(CONTENT_RECORDS_FILE), skip_existing)?;
        (summary.imported_posts, summary.skipped_existing_posts) =
            import_collection::<Post>(&tx, &in_dir.join(POSTS_FILE), skip_existing)?;
        tx.commit().context("failed to commit import transaction")?;
        Ok(summary)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> StoreResult<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))?;
        Ok(())
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> StoreResult<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()).into());
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()
    }

    /// Run quick-check, foreign-key-check, and schema status health checks.
    ///
    /// # Errors
    /// Returns an error when any integrity check query fails.
    pub fn integrity_check(&self) -> StoreResult<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status: self.schema_status()?,
        })
    }
}

fn validation_error(err: ArchiveError) -> StoreError {
    match err {
        ArchiveError::Validation(message) => StoreError::Validation(message),
        other => StoreError::Validation(other.to_string()),
    }
}

/// Validate and write one document on an open transaction. The id and every
/// unique column are checked before the write.
fn insert_document<E: StoredEntity>(conn: &Connection, entity: &E) -> StoreResult<()> {
    entity.validate().map_err(validation_error)?;

    let id = entity.id().to_string();
    if document_exists::<E>(conn, &id)? {
        return Err(StoreError::DuplicateKey { entity: E::KIND, field: "id".to_string() });
    }
    ensure_unique(conn, entity, None)?;

    let document = serde_json::to_string(entity)
        .with_context(|| format!("failed to serialize {}", E::KIND))?;
    let mut values = vec![id];
    values.extend(entity.unique_values());
    values.push(document);

    let columns = std::iter::once("id")
        .chain(E::UNIQUE_COLUMNS.iter().copied())
        .chain(std::iter::once("document_json"))
        .collect::<Vec<_>>();
    let placeholders =
        (1..=columns.len()).map(|index| format!("?{index}")).collect::<Vec<_>>().join(", ");
    let sql =
        format!("INSERT INTO {}({}) VALUES ({placeholders})", E::TABLE, columns.join(", "));

    conn.execute(&sql, params_from_iter(values.iter())).map_err(unique_violation::<E>)?;
    Ok(())
}

fn import_collection<E: StoredEntity>(
    conn: &Connection,
    path: &Path,
    skip_existing: bool,
) -> StoreResult<(usize, usize)> {
    let mut imported = 0_usize;
    let mut skipped = 0_usize;
    for entity in read_ndjson_file::<E>(path)? {
        if document_exists::<E>(conn, &entity.id().to_string())? {
            if skip_existing {
                skipped += 1;
                continue;
            }
            return Err(anyhow!("{} already exists for id {}", E::KIND, entity.id()).into());
        }
        insert_document(conn, &entity)?;
        imported += 1;
    }
    Ok((imported, skipped))
}

fn document_exists<E: StoredEntity>(conn: &Connection, id: &str) -> StoreResult<bool> {
    let exists = conn.query_row(
        &format!("SELECT EXISTS(SELECT 1 FROM {} WHERE id = ?1)", E::TABLE),
        params![id],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(exists == 1)
}

fn load_document<E: StoredEntity>(conn: &Connection, id: &str) -> StoreResult<Option<E>> {
    let json = conn
        .query_row(
            &format!("SELECT document_json FROM {} WHERE id = ?1", E::TABLE),
            params![id],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    json.map(|json| decode_document::<E>(&json)).transpose()
}

fn decode_document<E: StoredEntity>(json: &str) -> StoreResult<E> {
    Ok(serde_json::from_str(json).with_context(|| format!("failed to decode stored {}", E::KIND))?)
}

/// Fail with the first unique column whose value already belongs to another document.
fn ensure_unique<E: StoredEntity>(
    conn: &Connection,
    entity: &E,
    exclude_id: Option<&str>,
) -> StoreResult<()> {
    for (column, value) in E::UNIQUE_COLUMNS.iter().zip(entity.unique_values()) {
        let owner = conn
            .query_row(
                &format!("SELECT id FROM {} WHERE {column} = ?1", E::TABLE),
                params![value],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        match owner {
            Some(owner) if Some(owner.as_str()) != exclude_id => {
                return Err(StoreError::DuplicateKey {
                    entity: E::KIND,
                    field: (*column).to_string(),
                });
            }
            _ => {}
        }
    }
    Ok(())
}

/// Map a `UNIQUE constraint failed: table.column` error onto the column name.
fn unique_violation<E: StoredEntity>(err: rusqlite::Error) -> StoreError {
    if err.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation) {
        if let rusqlite::Error::SqliteFailure(_, Some(message)) = &err {
            let prefix = format!("UNIQUE constraint failed: {}.", E::TABLE);
            if let Some(column) = message.strip_prefix(&prefix) {
                return StoreError::DuplicateKey { entity: E::KIND, field: column.to_string() };
            }
        }
    }
    StoreError::from(err)
}

fn next_timestamp(previous: OffsetDateTime) -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    if now > previous {
        now
    } else {
        previous + Duration::microseconds(1)
    }
}

fn token_digest(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

fn current_schema_version(conn: &Connection) -> anyhow::Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
        row.get::<_, i64>(0)
    })
    .context("failed to read current schema version")
}

fn record_schema_version(conn: &Connection, version: i64) -> anyhow::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now_rfc3339()?],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> anyhow::Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_account_id(raw: &str) -> StoreResult<AccountId> {
    AccountId::parse(raw).map_err(|err| StoreError::Backend(anyhow!("corrupt account id: {err}")))
}

fn export_file<T: Serialize>(out_dir: &Path, name: &str, values: &[T]) -> anyhow::Result<ExportFileDigest> {
    let (sha256, records) = write_ndjson_file(&out_dir.join(name), values)?;
    Ok(ExportFileDigest { path: name.to_string(), sha256, records })
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> anyhow::Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write NDJSON row to {}", path.display()))?;
        writer
            .write_all(b"\n")
            .with_context(|| format!("failed to write NDJSON newline to {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;
    Ok((format!("{:x}", hasher.finalize()), values.len()))
}

fn read_ndjson_file<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Vec<T>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut values = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = serde_json::from_str(trimmed).with_context(|| {
            format!("failed to parse NDJSON row {} from {}", index + 1, path.display())
        })?;
        values.push(value);
    }

    Ok(values)
}

fn read_export_manifest(path: &Path) -> anyhow::Result<ExportManifest> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read manifest file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse manifest JSON {}", path.display()))
}

fn ndjson_digest_and_records(path: &Path) -> anyhow::Result<(String, usize)> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut records = 0_usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
        if !line.trim().is_empty() {
            records += 1;
        }
    }

    Ok((format!("{:x}", hasher.finalize()), records))
}

fn validate_import_manifest(in_dir: &Path, manifest: &ExportManifest) -> anyhow::Result<()> {
    if manifest.schema_version <= 0 || manifest.schema_version > LATEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported export schema version {}; supported range is 1..={}",
            manifest.schema_version,
            LATEST_SCHEMA_VERSION
        ));
    }

    let mut by_path: BTreeMap<&str, &ExportFileDigest> = BTreeMap::new();
    for file in &manifest.files {
        if by_path.insert(file.path.as_str(), file).is_some() {
            return Err(anyhow!("manifest contains duplicate file entry: {}", file.path));
        }
    }

    for required in [ACCOUNTS_FILE, CONTENT_RECORDS_FILE, POSTS_FILE] {
        let Some(expected) = by_path.get(required) else {
            return Err(anyhow!("manifest is missing required file entry: {required}"));
        };
        let file_path = in_dir.join(required);
        if !file_path.exists() {
            return Err(anyhow!("manifest references missing file {}", file_path.display()));
        }

        let (actual_sha256, actual_records) = ndjson_digest_and_records(&file_path)?;
        if actual_sha256 != expected.sha256 {
            return Err(anyhow!(
                "manifest digest mismatch for {required}: expected {}, got {}",
                expected.sha256,
                actual_sha256
            ));
        }
        if actual_records != expected.records {
            return Err(anyhow!(
                "manifest record count mismatch for {required}: expected {}, got {}",
                expected.records,
                actual_records
            ));
        }
    }

    Ok(())
}
