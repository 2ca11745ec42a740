use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use sce_archive_api::{
    ArchiveApi, BootstrapAdminRequest, CreateObjectRequest, CreatePostRequest, LoginRequest,
    RegisterRequest,
};
use sce_archive_core::{
    AccountId, AccountPatch, Classification, ClearanceLevel, ContentRecordId, ContentRecordPatch,
    Department, DiscoveryMeta, PostCategory, PostId, PostPatch, Principal, Role,
};
use sce_archive_store_sqlite::SqliteStore;
use serde::Serialize;
use serde_json::Value;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "sce")]
#[command(about = "SCE archive CLI")]
struct Cli {
    #[arg(long, default_value = "./sce_archive.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Admin {
        #[command(subcommand)]
        command: Box<AdminCommand>,
    },
    Auth {
        #[command(subcommand)]
        command: Box<AuthCommand>,
    },
    Account {
        #[command(subcommand)]
        command: Box<AccountCommand>,
    },
    Object {
        #[command(subcommand)]
        command: Box<ObjectCommand>,
    },
    Post {
        #[command(subcommand)]
        command: Box<PostCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Export(DbExportArgs),
    Import(DbImportArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbExportArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
    /// Fail instead of skipping documents whose id already exists
    #[arg(long, default_value_t = false)]
    fail_on_existing: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum AdminCommand {
    Bootstrap(CredentialArgs),
    /// Wipe every collection and session
    Reset,
}

#[derive(Debug, Args)]
struct CredentialArgs {
    #[arg(long)]
    email: String,
    #[arg(long)]
    username: String,
    #[arg(long)]
    password: String,
}

#[derive(Debug, Subcommand)]
enum AuthCommand {
    Register(RegisterArgs),
    Verify(VerifyArgs),
    Login(LoginArgs),
    Logout,
    Whoami,
}

#[derive(Debug, Args)]
struct RegisterArgs {
    #[command(flatten)]
    credentials: CredentialArgs,
    #[arg(long)]
    confirm_password: String,
}

#[derive(Debug, Args)]
struct VerifyArgs {
    #[arg(long)]
    token: String,
}

#[derive(Debug, Args)]
struct LoginArgs {
    #[arg(long)]
    email: String,
    #[arg(long)]
    password: String,
}

#[derive(Debug, Subcommand)]
enum AccountCommand {
    List,
    Update(AccountUpdateArgs),
    SetRole(SetRoleArgs),
    SetClearance(SetClearanceArgs),
    SetPosition(SetPositionArgs),
}

#[derive(Debug, Args)]
struct AccountUpdateArgs {
    /// Defaults to the logged-in account
    #[arg(long)]
    id: Option<String>,
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    username: Option<String>,
    #[arg(long, value_enum)]
    department: Option<DepartmentArg>,
    #[arg(long)]
    avatar_url: Option<String>,
    #[arg(long)]
    bio: Option<String>,
}

#[derive(Debug, Args)]
struct SetRoleArgs {
    #[arg(long)]
    id: String,
    #[arg(long, value_enum)]
    role: RoleArg,
}

#[derive(Debug, Args)]
struct SetClearanceArgs {
    #[arg(long)]
    id: String,
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=5))]
    level: u8,
}

#[derive(Debug, Args)]
struct SetPositionArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    position: String,
}

#[derive(Debug, Subcommand)]
enum ObjectCommand {
    List,
    Show(ObjectShowArgs),
    Create(ObjectCreateArgs),
    Update(ObjectUpdateArgs),
    Delete(IdArgs),
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
struct ObjectShowArgs {
    #[arg(long)]
    id: Option<String>,
    #[arg(long)]
    number: Option<String>,
}

#[derive(Debug, Args)]
struct ObjectCreateArgs {
    #[arg(long)]
    number: String,
    #[arg(long)]
    title: String,
    #[arg(long, value_enum)]
    classification: ClassificationArg,
    #[arg(long)]
    body: String,
    #[arg(long)]
    procedures: String,
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=5))]
    clearance: u8,
    #[arg(long)]
    notes: Option<String>,
    #[arg(long = "image")]
    images: Vec<String>,
    #[arg(long)]
    discovery_location: Option<String>,
    #[arg(long)]
    discovery_date: Option<String>,
    #[arg(long)]
    discovered_by: Option<String>,
    #[arg(long = "threat")]
    associated_threats: Vec<String>,
    #[arg(long = "related")]
    related_objects: Vec<String>,
}

#[derive(Debug, Args)]
struct ObjectUpdateArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    number: Option<String>,
    #[arg(long)]
    title: Option<String>,
    #[arg(long, value_enum)]
    classification: Option<ClassificationArg>,
    #[arg(long)]
    body: Option<String>,
    #[arg(long)]
    procedures: Option<String>,
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=5))]
    clearance: Option<u8>,
    #[arg(long)]
    notes: Option<String>,
}

#[derive(Debug, Subcommand)]
enum PostCommand {
    List,
    Show(IdArgs),
    Create(PostCreateArgs),
    Update(PostUpdateArgs),
    Delete(IdArgs),
}

#[derive(Debug, Args)]
struct IdArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
struct PostCreateArgs {
    #[arg(long)]
    title: String,
    #[arg(long)]
    body: String,
    #[arg(long, value_enum)]
    category: PostCategoryArg,
    /// Omit for a public post
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=5))]
    clearance: Option<u8>,
    #[arg(long)]
    summary: Option<String>,
    #[arg(long = "tag")]
    tags: Vec<String>,
    #[arg(long = "related-object")]
    related_objects: Vec<String>,
    #[arg(long = "related-post")]
    related_posts: Vec<String>,
    #[arg(long)]
    featured_image: Option<String>,
}

#[derive(Debug, Args)]
struct PostUpdateArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    body: Option<String>,
    #[arg(long, value_enum)]
    category: Option<PostCategoryArg>,
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=5))]
    clearance: Option<u8>,
    /// Drop the clearance restriction so anyone can read the post
    #[arg(long, conflicts_with = "clearance")]
    public: bool,
    #[arg(long)]
    summary: Option<String>,
    #[arg(long = "tag")]
    tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RoleArg {
    Admin,
    Researcher,
    Security,
    Explorer,
    Reader,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ClassificationArg {
    Safe,
    Euclid,
    Keter,
    Thaumiel,
    Neutralized,
    Explained,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PostCategoryArg {
    News,
    Article,
    Report,
    Memo,
    Briefing,
    Event,
    Interview,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DepartmentArg {
    Research,
    Security,
    Operations,
    Administration,
    Ethics,
    Containment,
    Exploration,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit<T: Serialize>(value: &T) -> Result<()> {
    emit_json(serde_json::to_value(value).context("failed to serialize command output")?)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(*command, &mut store)
        }
        Command::Admin { command } => run_admin(*command, &ArchiveApi::new(cli.db)),
        Command::Auth { command } => run_auth(*command, &ArchiveApi::new(cli.db)),
        Command::Account { command } => run_account(*command, &ArchiveApi::new(cli.db)),
        Command::Object { command } => run_object(*command, &ArchiveApi::new(cli.db)),
        Command::Post { command } => run_post(*command, &ArchiveApi::new(cli.db)),
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::Export(args) => {
            store.migrate()?;
            let manifest = store.export_snapshot(&args.out)?;
            emit_json(serde_json::json!({ "out_dir": args.out, "manifest": manifest }))
        }
        DbCommand::Import(args) => {
            let skip_existing = !args.fail_on_existing;
            let summary = store.import_snapshot(&args.input, skip_existing)?;
            emit_json(serde_json::json!({
                "in_dir": args.input,
                "skip_existing": skip_existing,
                "summary": summary
            }))
        }
        DbCommand::Backup(args) => {
            store.migrate()?;
            store.backup_database(&args.out)?;
            emit_json(serde_json::json!({ "backup_path": args.out, "status": "ok" }))
        }
        DbCommand::Restore(args) => {
            store.restore_database(&args.input)?;
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "restored_from": args.input,
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions
            }))
        }
        DbCommand::IntegrityCheck => emit(&store.integrity_check()?),
    }
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }));
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_admin(command: AdminCommand, api: &ArchiveApi) -> Result<()> {
    match command {
        AdminCommand::Bootstrap(args) => emit(&api.bootstrap_admin(BootstrapAdminRequest {
            email: args.email,
            username: args.username,
            password: args.password,
        })?),
        AdminCommand::Reset => {
            let requester = api.current_principal()?;
            let removed = api.reset_database(requester.as_ref())?;
            emit_json(serde_json::json!({ "removed": removed }))
        }
    }
}

fn run_auth(command: AuthCommand, api: &ArchiveApi) -> Result<()> {
    match command {
        AuthCommand::Register(args) => emit(&api.register(RegisterRequest {
            email: args.credentials.email,
            username: args.credentials.username,
            password: args.credentials.password,
            confirm_password: args.confirm_password,
        })?),
        AuthCommand::Verify(args) => {
            let grant = api.verify_email(&args.token)?;
            api.remember_session(Some(&grant.token))?;
            emit_json(serde_json::json!({ "account": grant.account, "session": "stored" }))
        }
        AuthCommand::Login(args) => {
            let grant =
                api.login(LoginRequest { email: args.email, password: args.password })?;
            api.remember_session(Some(&grant.token))?;
            emit_json(serde_json::json!({ "account": grant.account, "session": "stored" }))
        }
        AuthCommand::Logout => {
            let revoked = api.logout_current()?;
            emit_json(serde_json::json!({ "revoked": revoked }))
        }
        AuthCommand::Whoami => {
            let account = api.current_account()?.map(|account| account.profile());
            emit_json(serde_json::json!({ "account": account }))
        }
    }
}

fn run_account(command: AccountCommand, api: &ArchiveApi) -> Result<()> {
    let requester = api.current_principal()?;
    match command {
        AccountCommand::List => {
            let accounts = api.list_accounts(requester.as_ref())?;
            emit_json(serde_json::json!({ "accounts": accounts }))
        }
        AccountCommand::Update(args) => {
            let target = match args.id.as_deref() {
                Some(raw) => AccountId::parse(raw)?,
                None => require_login(requester.as_ref())?.id,
            };
            let patch = AccountPatch {
                email: args.email,
                username: args.username,
                department: args.department.map(|department| Some(department.into_department())),
                avatar_url: args.avatar_url.map(Some),
                bio: args.bio.map(Some),
                ..AccountPatch::default()
            };
            emit(&api.update_profile(requester.as_ref(), target, patch)?)
        }
        AccountCommand::SetRole(args) => emit(&api.set_account_role(
            requester.as_ref(),
            AccountId::parse(&args.id)?,
            args.role.into_role(),
        )?),
        AccountCommand::SetClearance(args) => emit(&api.set_account_clearance(
            requester.as_ref(),
            AccountId::parse(&args.id)?,
            parse_clearance(args.level)?,
        )?),
        AccountCommand::SetPosition(args) => emit(&api.set_account_position(
            requester.as_ref(),
            AccountId::parse(&args.id)?,
            args.position,
        )?),
    }
}

fn run_object(command: ObjectCommand, api: &ArchiveApi) -> Result<()> {
    let requester = api.current_principal()?;
    match command {
        ObjectCommand::List => {
            let objects = api.list_objects(requester.as_ref())?;
            emit_json(serde_json::json!({ "objects": objects }))
        }
        ObjectCommand::Show(args) => {
            let record = match (args.id, args.number) {
                (Some(id), _) => api.get_object(requester.as_ref(), ContentRecordId::parse(&id)?)?,
                (None, Some(number)) => api.get_object_by_number(requester.as_ref(), &number)?,
                (None, None) => return Err(anyhow!("either --id or --number is required")),
            };
            emit(&record)
        }
        ObjectCommand::Create(args) => {
            let request = CreateObjectRequest {
                external_number: args.number,
                title: args.title,
                classification: args.classification.into_classification(),
                body: args.body,
                procedures: args.procedures,
                required_clearance: parse_clearance(args.clearance)?,
                notes: args.notes,
                images: args.images,
                discovery: DiscoveryMeta {
                    location: args.discovery_location,
                    date: args.discovery_date,
                    discovered_by: args.discovered_by,
                },
                associated_threats: args.associated_threats,
                related_objects: args.related_objects,
            };
            emit(&api.create_object(requester.as_ref(), request)?)
        }
        ObjectCommand::Update(args) => {
            let patch = ContentRecordPatch {
                external_number: args.number,
                title: args.title,
                classification: args.classification.map(ClassificationArg::into_classification),
                body: args.body,
                procedures: args.procedures,
                required_clearance: args.clearance.map(parse_clearance).transpose()?,
                notes: args.notes.map(Some),
                ..ContentRecordPatch::default()
            };
            emit(&api.update_object(requester.as_ref(), ContentRecordId::parse(&args.id)?, patch)?)
        }
        ObjectCommand::Delete(args) => {
            let id = ContentRecordId::parse(&args.id)?;
            api.delete_object(requester.as_ref(), id)?;
            emit_json(serde_json::json!({ "deleted": id.to_string() }))
        }
    }
}

fn run_post(command: PostCommand, api: &ArchiveApi) -> Result<()> {
    let requester = api.current_principal()?;
    match command {
        PostCommand::List => {
            let posts = api.list_posts(requester.as_ref())?;
            emit_json(serde_json::json!({ "posts": posts }))
        }
        PostCommand::Show(args) => emit(&api.get_post(requester.as_ref(), PostId::parse(&args.id)?)?),
        PostCommand::Create(args) => {
            let request = CreatePostRequest {
                title: args.title,
                body: args.body,
                category: args.category.into_category(),
                required_clearance: args.clearance.map(parse_clearance).transpose()?,
                summary: args.summary,
                tags: args.tags,
                related_objects: args.related_objects,
                related_posts: args.related_posts,
                featured_image: args.featured_image,
            };
            emit(&api.create_post(requester.as_ref(), request)?)
        }
        PostCommand::Update(args) => {
            let patch = PostPatch {
                title: args.title,
                body: args.body,
                category: args.category.map(PostCategoryArg::into_category),
                required_clearance: if args.public {
                    Some(None)
                } else {
                    args.clearance.map(parse_clearance).transpose()?.map(Some)
                },
                summary: args.summary.map(Some),
                tags: args.tags,
                ..PostPatch::default()
            };
            emit(&api.update_post(requester.as_ref(), PostId::parse(&args.id)?, patch)?)
        }
        PostCommand::Delete(args) => {
            let id = PostId::parse(&args.id)?;
            api.delete_post(requester.as_ref(), id)?;
            emit_json(serde_json::json!({ "deleted": id.to_string() }))
        }
    }
}

fn require_login(requester: Option<&Principal>) -> Result<&Principal> {
    requester.ok_or_else(|| anyhow!("not logged in; run `sce auth login` first"))
}

fn parse_clearance(level: u8) -> Result<ClearanceLevel> {
    ClearanceLevel::try_from(level).map_err(|err| anyhow!(err))
}

impl RoleArg {
    fn into_role(self) -> Role {
        match self {
            Self::Admin => Role::Admin,
            Self::Researcher => Role::Researcher,
            Self::Security => Role::Security,
            Self::Explorer => Role::Explorer,
            Self::Reader => Role::Reader,
        }
    }
}

impl ClassificationArg {
    fn into_classification(self) -> Classification {
        match self {
            Self::Safe => Classification::Safe,
            Self::Euclid => Classification::Euclid,
            Self::Keter => Classification::Keter,
            Self::Thaumiel => Classification::Thaumiel,
            Self::Neutralized => Classification::Neutralized,
            Self::Explained => Classification::Explained,
        }
    }
}

impl PostCategoryArg {
    fn into_category(self) -> PostCategory {
        match self {
            Self::News => PostCategory::News,
            Self::Article => PostCategory::Article,
            Self::Report => PostCategory::Report,
            Self::Memo => PostCategory::Memo,
            Self::Briefing => PostCategory::Briefing,
            Self::Event => PostCategory::Event,
            Self::Interview => PostCategory::Interview,
        }
    }
}

impl DepartmentArg {
    fn into_department(self) -> Department {
        match self {
            Self::Research => Department::Research,
            Self::Security => Department::Security,
            Self::Operations => Department::Operations,
            Self::Administration => Department::Administration,
            Self::Ethics => Department::Ethics,
            Self::Containment => Department::Containment,
            Self::Exploration => Department::Exploration,
        }
    }
}
