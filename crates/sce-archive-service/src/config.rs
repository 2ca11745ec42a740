//! Service configuration: command-line flags layered over an optional YAML file.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

const DEFAULT_DB: &str = "./sce_archive.sqlite3";
const DEFAULT_BIND: &str = "127.0.0.1:4020";
const DEFAULT_LOG_FILTER: &str = "sce_archive=info";

#[derive(Debug, Clone, Parser)]
#[command(name = "sce-archive-service")]
#[command(about = "Local HTTP service for the SCE archive")]
pub struct Args {
    /// YAML file supplying any setting not given as a flag
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// SQLite database path
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    pub bind: Option<SocketAddr>,

    /// tracing filter directive, overridden by RUST_LOG
    #[arg(long)]
    pub log_filter: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub db: Option<PathBuf>,
    pub bind: Option<SocketAddr>,
    pub log_filter: Option<String>,
}

impl FileConfig {
    /// # Errors
    /// Returns an error for malformed YAML or unknown keys.
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// # Errors
    /// Returns an error when the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub db: PathBuf,
    pub bind: SocketAddr,
    pub log_filter: String,
}

impl ServiceConfig {
    /// Flags win over the file; the file wins over built-in defaults.
    ///
    /// # Errors
    /// Returns an error when the config file is unreadable or invalid.
    pub fn resolve(args: Args) -> Result<Self> {
        let file = match &args.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::merge(args, file)
    }

    fn merge(args: Args, file: FileConfig) -> Result<Self> {
        let bind = match args.bind.or(file.bind) {
            Some(bind) => bind,
            None => DEFAULT_BIND.parse().context("invalid default bind address")?,
        };
        Ok(Self {
            db: args.db.or(file.db).unwrap_or_else(|| PathBuf::from(DEFAULT_DB)),
            bind,
            log_filter: args
                .log_filter
                .or(file.log_filter)
                .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_args() -> Args {
        Args { config: None, db: None, bind: None, log_filter: None }
    }

    #[test]
    fn defaults_apply_without_flags_or_file() -> Result<()> {
        let config = ServiceConfig::merge(bare_args(), FileConfig::default())?;
        assert_eq!(config.db, PathBuf::from(DEFAULT_DB));
        assert_eq!(config.bind.port(), 4020);
        assert_eq!(config.log_filter, DEFAULT_LOG_FILTER);
        Ok(())
    }

    #[test]
    fn flags_override_file_values() -> Result<()> {
        let file = FileConfig::from_yaml(
            "db: /var/lib/sce/archive.sqlite3\nbind: 0.0.0.0:8080\nlog_filter: sce_archive=debug\n",
        )?;
        let args = Args { bind: Some("127.0.0.1:9000".parse()?), ..bare_args() };

        let config = ServiceConfig::merge(args, file)?;
        assert_eq!(config.db, PathBuf::from("/var/lib/sce/archive.sqlite3"));
        assert_eq!(config.bind.port(), 9000);
        assert_eq!(config.log_filter, "sce_archive=debug");
        Ok(())
    }

    #[test]
    fn unknown_file_keys_are_rejected() {
        assert!(FileConfig::from_yaml("database: archive.sqlite3\n").is_err());
    }
}
