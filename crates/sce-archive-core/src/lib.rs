use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

mod error;
pub mod policy;

pub use error::{ArchiveError, EntityKind};
pub use policy::{
    authorize_mutation, authorize_profile_update, authorize_view, can_edit_profile, can_mutate,
    can_view, filter_visible, Decision, DenyReason, MutationAction,
};

const MAX_USERNAME_LEN: usize = 64;
const MAX_EMAIL_LEN: usize = 254;

macro_rules! entity_id {
    ($name:ident, $kind:expr) => {
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Parse an identifier received from a caller.
            ///
            /// # Errors
            /// Returns [`ArchiveError::Validation`] when `raw` is not a ULID.
            pub fn parse(raw: &str) -> Result<Self, ArchiveError> {
                Ulid::from_string(raw.trim()).map(Self).map_err(|err| {
                    ArchiveError::Validation(format!("invalid {} id `{raw}`: {err}", $kind))
                })
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

entity_id!(AccountId, "account");
entity_id!(ContentRecordId, "content record");
entity_id!(PostId, "post");

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Researcher,
    Security,
    Explorer,
    Reader,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Researcher => "researcher",
            Self::Security => "security",
            Self::Explorer => "explorer",
            Self::Reader => "reader",
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered clearance scale. Declaration order is rank order, so the derived
/// `Ord` compares levels numerically.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
#[serde(try_from = "u8", into = "u8")]
pub enum ClearanceLevel {
    #[default]
    Level1,
    Level2,
    Level3,
    Level4,
    Level5,
}

impl ClearanceLevel {
    pub const LOWEST: Self = Self::Level1;
    pub const HIGHEST: Self = Self::Level5;

    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Level1 => 1,
            Self::Level2 => 2,
            Self::Level3 => 3,
            Self::Level4 => 4,
            Self::Level5 => 5,
        }
    }

    #[must_use]
    pub fn from_rank(rank: u8) -> Option<Self> {
        match rank {
            1 => Some(Self::Level1),
            2 => Some(Self::Level2),
            3 => Some(Self::Level3),
            4 => Some(Self::Level4),
            5 => Some(Self::Level5),
            _ => None,
        }
    }

    #[must_use]
    pub fn all() -> [Self; 5] {
        [Self::Level1, Self::Level2, Self::Level3, Self::Level4, Self::Level5]
    }
}

impl TryFrom<u8> for ClearanceLevel {
    type Error = String;

    fn try_from(rank: u8) -> Result<Self, Self::Error> {
        Self::from_rank(rank).ok_or_else(|| format!("clearance level must be in 1..=5, got {rank}"))
    }
}

impl From<ClearanceLevel> for u8 {
    fn from(level: ClearanceLevel) -> Self {
        level.rank()
    }
}

impl Display for ClearanceLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.rank())
    }
}

/// Handling taxonomy for content records. Descriptive only, never an access gate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Safe,
    Euclid,
    Keter,
    Thaumiel,
    Neutralized,
    Explained,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PostCategory {
    News,
    Article,
    Report,
    Memo,
    Briefing,
    Event,
    Interview,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Department {
    Research,
    Security,
    Operations,
    Administration,
    Ethics,
    Containment,
    Exploration,
}

/// The acting identity handed to the policy evaluator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct Principal {
    pub id: AccountId,
    pub role: Role,
    pub clearance: ClearanceLevel,
}

impl Principal {
    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Anything whose read visibility is gated by a clearance requirement.
pub trait ClearanceGated {
    /// `None` means public.
    fn required_clearance(&self) -> Option<ClearanceLevel>;
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Account {
    pub id: AccountId,
    pub email: String,
    pub username: String,
    pub password_hash: String,
    pub role: Role,
    #[serde(default)]
    pub clearance: ClearanceLevel,
    #[serde(default)]
    pub email_verified: bool,
    pub position: Option<String>,
    pub department: Option<Department>,
    pub avatar_url: Option<String>,
    pub bio: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Account {
    #[must_use]
    pub fn principal(&self) -> Principal {
        Principal { id: self.id, role: self.role, clearance: self.clearance }
    }

    /// Public projection with the credential removed.
    #[must_use]
    pub fn profile(&self) -> AccountProfile {
        AccountProfile {
            id: self.id,
            email: self.email.clone(),
            username: self.username.clone(),
            role: self.role,
            clearance: self.clearance,
            email_verified: self.email_verified,
            position: self.position.clone(),
            department: self.department,
            avatar_url: self.avatar_url.clone(),
            bio: self.bio.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Validate identity fields before persistence.
    ///
    /// # Errors
    /// Returns [`ArchiveError::Validation`] for a malformed email, an empty or
    /// oversized username, or a missing credential.
    pub fn validate(&self) -> Result<(), ArchiveError> {
        validate_email(&self.email)?;
        validate_username(&self.username)?;
        if self.password_hash.trim().is_empty() {
            return Err(ArchiveError::validation("password credential MUST be provided"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AccountProfile {
    pub id: AccountId,
    pub email: String,
    pub username: String,
    pub role: Role,
    pub clearance: ClearanceLevel,
    pub email_verified: bool,
    pub position: Option<String>,
    pub department: Option<Department>,
    pub avatar_url: Option<String>,
    pub bio: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Patch fields over optional values: absent keeps, `null` clears, a value sets.
#[allow(clippy::option_option)]
fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: serde::Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[allow(clippy::option_option)]
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct AccountPatch {
    pub email: Option<String>,
    pub username: Option<String>,
    pub role: Option<Role>,
    pub clearance: Option<ClearanceLevel>,
    pub email_verified: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "double_option")]
    pub position: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "double_option")]
    pub department: Option<Option<Department>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "double_option")]
    pub avatar_url: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "double_option")]
    pub bio: Option<Option<String>>,
}

impl AccountPatch {
    pub fn apply_to(self, account: &mut Account) {
        if let Some(email) = self.email {
            account.email = normalize_email(&email);
        }
        if let Some(username) = self.username {
            account.username = username.trim().to_string();
        }
        if let Some(role) = self.role {
            account.role = role;
        }
        if let Some(clearance) = self.clearance {
            account.clearance = clearance;
        }
        if let Some(email_verified) = self.email_verified {
            account.email_verified = email_verified;
        }
        if let Some(position) = self.position {
            account.position = position;
        }
        if let Some(department) = self.department {
            account.department = department;
        }
        if let Some(avatar_url) = self.avatar_url {
            account.avatar_url = avatar_url;
        }
        if let Some(bio) = self.bio {
            account.bio = bio;
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct DiscoveryMeta {
    pub location: Option<String>,
    pub date: Option<String>,
    pub discovered_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ContentRecord {
    pub id: ContentRecordId,
    pub external_number: String,
    pub title: String,
    pub classification: Classification,
    pub body: String,
    pub procedures: String,
    #[serde(default)]
    pub required_clearance: ClearanceLevel,
    pub notes: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub discovery: DiscoveryMeta,
    #[serde(default)]
    pub associated_threats: Vec<String>,
    #[serde(default)]
    pub related_objects: Vec<String>,
    pub created_by: AccountId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl ContentRecord {
    /// # Errors
    /// Returns [`ArchiveError::Validation`] when a required text field is blank.
    pub fn validate(&self) -> Result<(), ArchiveError> {
        require_text("external_number", &self.external_number)?;
        require_text("title", &self.title)?;
        require_text("body", &self.body)?;
        require_text("procedures", &self.procedures)?;
        Ok(())
    }
}

impl ClearanceGated for ContentRecord {
    fn required_clearance(&self) -> Option<ClearanceLevel> {
        Some(self.required_clearance)
    }
}

#[allow(clippy::option_option)]
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ContentRecordPatch {
    pub external_number: Option<String>,
    pub title: Option<String>,
    pub classification: Option<Classification>,
    pub body: Option<String>,
    pub procedures: Option<String>,
    pub required_clearance: Option<ClearanceLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "double_option")]
    pub notes: Option<Option<String>>,
    pub images: Option<Vec<String>>,
    pub discovery: Option<DiscoveryMeta>,
    pub associated_threats: Option<Vec<String>>,
    pub related_objects: Option<Vec<String>>,
}

impl ContentRecordPatch {
    pub fn apply_to(self, record: &mut ContentRecord) {
        if let Some(external_number) = self.external_number {
            record.external_number = external_number.trim().to_string();
        }
        if let Some(title) = self.title {
            record.title = title;
        }
        if let Some(classification) = self.classification {
            record.classification = classification;
        }
        if let Some(body) = self.body {
            record.body = body;
        }
        if let Some(procedures) = self.procedures {
            record.procedures = procedures;
        }
        if let Some(required_clearance) = self.required_clearance {
            record.required_clearance = required_clearance;
        }
        if let Some(notes) = self.notes {
            record.notes = notes;
        }
        if let Some(images) = self.images {
            record.images = images;
        }
        if let Some(discovery) = self.discovery {
            record.discovery = discovery;
        }
        if let Some(associated_threats) = self.associated_threats {
            record.associated_threats = associated_threats;
        }
        if let Some(related_objects) = self.related_objects {
            record.related_objects = related_objects;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Post {
    pub id: PostId,
    pub title: String,
    pub body: String,
    pub category: PostCategory,
    pub author_id: AccountId,
    pub author_name: String,
    pub required_clearance: Option<ClearanceLevel>,
    pub summary: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub related_objects: Vec<String>,
    #[serde(default)]
    pub related_posts: Vec<String>,
    pub featured_image: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Post {
    /// # Errors
    /// Returns [`ArchiveError::Validation`] when title, body, or author name is blank.
    pub fn validate(&self) -> Result<(), ArchiveError> {
        require_text("title", &self.title)?;
        require_text("body", &self.body)?;
        require_text("author_name", &self.author_name)?;
        Ok(())
    }
}

impl ClearanceGated for Post {
    fn required_clearance(&self) -> Option<ClearanceLevel> {
        self.required_clearance
    }
}

#[allow(clippy::option_option)]
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct PostPatch {
    pub title: Option<String>,
    pub body: Option<String>,
    pub category: Option<PostCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "double_option")]
    pub required_clearance: Option<Option<ClearanceLevel>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "double_option")]
    pub summary: Option<Option<String>>,
    pub tags: Option<Vec<String>>,
    pub related_objects: Option<Vec<String>>,
    pub related_posts: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "double_option")]
    pub featured_image: Option<Option<String>>,
}

impl PostPatch {
    pub fn apply_to(self, post: &mut Post) {
        if let Some(title) = self.title {
            post.title = title;
        }
        if let Some(body) = self.body {
            post.body = body;
        }
        if let Some(category) = self.category {
            post.category = category;
        }
        if let Some(required_clearance) = self.required_clearance {
            post.required_clearance = required_clearance;
        }
        if let Some(summary) = self.summary {
            post.summary = summary;
        }
        if let Some(tags) = self.tags {
            post.tags = tags;
        }
        if let Some(related_objects) = self.related_objects {
            post.related_objects = related_objects;
        }
        if let Some(related_posts) = self.related_posts {
            post.related_posts = related_posts;
        }
        if let Some(featured_image) = self.featured_image {
            post.featured_image = featured_image;
        }
    }
}

#[must_use]
pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

/// # Errors
/// Returns [`ArchiveError::Validation`] unless `email` has one `@` with text on both sides.
pub fn validate_email(email: &str) -> Result<(), ArchiveError> {
    let trimmed = email.trim();
    if trimmed.is_empty() {
        return Err(ArchiveError::validation("email MUST be provided"));
    }
    if trimmed.len() > MAX_EMAIL_LEN {
        return Err(ArchiveError::validation(format!(
            "email MUST be at most {MAX_EMAIL_LEN} characters"
        )));
    }
    match trimmed.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') && !domain.contains('@') => {
            Ok(())
        }
        _ => Err(ArchiveError::validation(format!("email is not a valid address: {trimmed}"))),
    }
}

/// # Errors
/// Returns [`ArchiveError::Validation`] for an empty, oversized, or whitespace-containing name.
pub fn validate_username(username: &str) -> Result<(), ArchiveError> {
    let trimmed = username.trim();
    if trimmed.is_empty() {
        return Err(ArchiveError::validation("username MUST be provided"));
    }
    if trimmed.chars().count() > MAX_USERNAME_LEN {
        return Err(ArchiveError::validation(format!(
            "username MUST be at most {MAX_USERNAME_LEN} characters"
        )));
    }
    if trimmed.chars().any(char::is_whitespace) {
        return Err(ArchiveError::validation("username MUST NOT contain whitespace"));
    }
    Ok(())
}

fn require_text(field: &str, value: &str) -> Result<(), ArchiveError> {
    if value.trim().is_empty() {
        return Err(ArchiveError::Validation(format!("{field} MUST be provided")));
    }
    Ok(())
}
