use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::info;

use crate::adapters::pop3::{AuthMethod, Crypto, Pop3Options};
use crate::types::error::EddieError;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub sync: SyncSettings,
    pub pop3: Pop3Settings,
    /// Map of account id to account configuration
    pub accounts: BTreeMap<String, AccountConfig>,
}

/// Engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub max_op_try_count: u32,
    pub op_unknown_error_try_count_increment: u32,
    pub deferred_op_delay_ms: u64,
    pub max_mutations_for_undo: usize,
    pub start_online: bool,
    pub start_interactive: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_op_try_count: 10,
            op_unknown_error_try_count_increment: 5,
            deferred_op_delay_ms: 30_000,
            max_mutations_for_undo: 10,
            start_online: true,
            start_interactive: false,
        }
    }
}

/// Settings shared by every POP3 account
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Pop3Settings {
    pub snippet_size_goal: usize,
    /// Messages at least this big are assumed to carry attachments
    pub infer_attachments_size: usize,
    pub save_state_every_n_messages: usize,
    pub max_messages_per_sync: usize,
    pub conn_timeout_ms: u64,
}

impl Default for Pop3Settings {
    fn default() -> Self {
        Self {
            snippet_size_goal: 4096,
            infer_attachments_size: 512 * 1024,
            save_state_every_n_messages: 50,
            max_messages_per_sync: 100,
            conn_timeout_ms: 30_000,
        }
    }
}

/// One POP3 mailbox
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    pub enabled: bool,
    pub host: String,

    /// POP3 port (default: 995 for ssl, 110 otherwise)
    pub port: Option<u16>,

    pub crypto: Crypto,
    pub user: String,

    /// Password (can use command for keychain integration)
    pub password: PasswordSource,

    /// Tried first; the rest follow in the usual order
    pub preferred_auth: Option<AuthMethod>,

    /// SQLite file for this account's state
    pub database: Option<PathBuf>,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: String::new(),
            port: None,
            crypto: Crypto::default(),
            user: String::new(),
            password: PasswordSource::Raw(String::new()),
            preferred_auth: None,
            database: None,
        }
    }
}

/// Password source - can be raw value or command to execute
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PasswordSource {
    /// Raw password value
    Raw(String),
    /// Command to execute to get password
    Command { command: String },
}

impl PasswordSource {
    pub async fn resolve(&self) -> Result<String, EddieError> {
        match self {
            PasswordSource::Raw(password) => Ok(password.clone()),
            PasswordSource::Command { command } => {
                info!("Executing password command");
                let output = Command::new("sh")
                    .arg("-c")
                    .arg(command)
                    .output()
                    .await
                    .map_err(|e| EddieError::Config(format!("Failed to run password command: {}", e)))?;

                if !output.status.success() {
                    return Err(EddieError::Config("Password command failed".to_string()));
                }

                Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
            }
        }
    }
}

impl AppConfig {
    pub fn from_toml(content: &str) -> Result<Self, EddieError> {
        let config: AppConfig = toml::from_str(content)
            .map_err(|e| EddieError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EddieError> {
        if self.sync.max_op_try_count == 0 {
            return Err(EddieError::Config("sync.max_op_try_count must be at least 1".to_string()));
        }
        for (id, account) in &self.accounts {
            if id.is_empty() || id.contains('/') {
                return Err(EddieError::Config(format!("Invalid account id {:?}", id)));
            }
            if account.host.is_empty() {
                return Err(EddieError::Config(format!("Account {} has no host", id)));
            }
            if account.user.is_empty() {
                return Err(EddieError::Config(format!("Account {} has no user", id)));
            }
        }
        Ok(())
    }
}

impl AccountConfig {
    /// Where this account's SQLite state lives
    pub fn database_path(&self, account_id: &str) -> Result<PathBuf, EddieError> {
        if let Some(path) = &self.database {
            return Ok(path.clone());
        }
        dirs::data_dir()
            .map(|dir| dir.join("eddie-sync").join(format!("{}.db", account_id)))
            .ok_or_else(|| EddieError::Config("No data directory for the account database".to_string()))
    }

    pub fn pop3_options(&self, password: String, settings: &Pop3Settings) -> Pop3Options {
        let mut options = Pop3Options::new(&self.host, &self.user, password);
        options.port = self.port;
        options.crypto = self.crypto;
        options.preferred_auth_method = self.preferred_auth;
        options.conn_timeout = Duration::from_millis(settings.conn_timeout_ms);
        options.snippet_size_goal = settings.snippet_size_goal;
        options.infer_attachments_size = settings.infer_attachments_size;
        options
    }
}

/// Get the default config path
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("eddie-sync").join("config.toml"))
}

/// Load configuration from a specific path
pub fn load_config(path: &Path) -> Result<AppConfig, EddieError> {
    info!("Loading configuration from: {:?}", path);

    let content = fs::read_to_string(path)
        .map_err(|e| EddieError::Config(format!("Failed to read config: {}", e)))?;

    AppConfig::from_toml(&content)
}

/// Load from `path`, or the default location; no file means an empty config.
pub fn load_config_or_default(path: Option<&Path>) -> Result<AppConfig, EddieError> {
    if let Some(path) = path {
        return load_config(path);
    }
    match default_config_path() {
        Some(path) if path.exists() => load_config(&path),
        _ => {
            info!("No config file found, using empty config");
            Ok(AppConfig::default())
        }
    }
}
