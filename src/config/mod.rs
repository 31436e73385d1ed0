use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::types::{MailError, Result};

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    pub imap: ImapConfig,
    pub smtp: SmtpConfig,
    /// Own outgoing address; inbound mail from it is ignored
    pub system_address: String,
    pub check_interval_seconds: u64,
    pub db_path: PathBuf,
    /// Acknowledge every inbound message
    pub auto_reply: bool,
}

/// IMAP server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImapConfig {
    pub host: String,
    /// 993 (implicit TLS) by default
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub mailbox: String,
}

/// SMTP server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    /// 465 uses implicit TLS, anything else STARTTLS
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
}

/// Optional config file. Keys mirror the environment variable names in
/// lowercase; the environment wins over the file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub imap_server: Option<String>,
    pub imap_port: Option<u16>,
    pub smtp_server: Option<String>,
    pub smtp_port: Option<u16>,
    pub email_username: Option<String>,
    pub email_password: Option<String>,
    pub email_mailbox: Option<String>,
    pub check_interval_seconds: Option<u64>,
    pub system_address: Option<String>,
    pub db_path: Option<PathBuf>,
    pub auto_reply: Option<bool>,
}

fn default_imap_port() -> u16 {
    993
}

fn default_smtp_port() -> u16 {
    465
}

fn default_check_interval() -> u64 {
    60
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/mailweave.db")
}

/// Config file locations, in lookup order
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("mailweave").join("config.toml"));
    }

    if let Some(home_dir) = dirs::home_dir() {
        paths.push(home_dir.join(".mailweave.toml"));
    }

    paths
}

impl AppConfig {
    /// Load from `MAILWEAVE_CONFIG` (or the first default path that exists),
    /// then apply the environment.
    pub fn load() -> Result<Self> {
        let explicit = std::env::var("MAILWEAVE_CONFIG").ok().map(PathBuf::from);
        let file = match explicit {
            Some(path) => Some(read_config_file(&path)?),
            None => match default_config_paths().into_iter().find(|p| p.exists()) {
                Some(path) => Some(read_config_file(&path)?),
                None => None,
            },
        };

        Self::resolve(file.unwrap_or_default(), |key| std::env::var(key).ok())
    }

    /// Merge `file` with values from `env`, applying defaults.
    pub fn resolve<F>(file: FileConfig, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let required = |key: &str, fallback: Option<String>| {
            get(key)
                .or(fallback)
                .ok_or_else(|| MailError::Config(format!("{} is not set", key)))
        };

        let username = required("EMAIL_USERNAME", file.email_username)?;
        let password = required("EMAIL_PASSWORD", file.email_password)?;

        let imap = ImapConfig {
            host: required("IMAP_SERVER", file.imap_server)?,
            port: parse_var(get("IMAP_PORT"), "IMAP_PORT")?
                .or(file.imap_port)
                .unwrap_or_else(default_imap_port),
            username: username.clone(),
            password: password.clone(),
            mailbox: get("EMAIL_MAILBOX")
                .or(file.email_mailbox)
                .unwrap_or_else(|| "INBOX".to_string()),
        };

        let smtp = SmtpConfig {
            host: required("SMTP_SERVER", file.smtp_server)?,
            port: parse_var(get("SMTP_PORT"), "SMTP_PORT")?
                .or(file.smtp_port)
                .unwrap_or_else(default_smtp_port),
            username: username.clone(),
            password,
        };

        let check_interval_seconds = parse_var(get("CHECK_INTERVAL_SECONDS"), "CHECK_INTERVAL_SECONDS")?
            .or(file.check_interval_seconds)
            .unwrap_or_else(default_check_interval);
        if check_interval_seconds == 0 {
            return Err(MailError::Config(
                "CHECK_INTERVAL_SECONDS must be at least 1".to_string(),
            ));
        }

        let auto_reply = match get("AUTO_REPLY") {
            Some(value) => parse_bool(&value).ok_or_else(|| {
                MailError::Config(format!("AUTO_REPLY must be true or false, got '{}'", value))
            })?,
            None => file.auto_reply.unwrap_or(true),
        };

        Ok(Self {
            imap,
            smtp,
            system_address: get("SYSTEM_ADDRESS")
                .or(file.system_address)
                .unwrap_or(username),
            check_interval_seconds,
            db_path: get("DB_PATH")
                .map(PathBuf::from)
                .or(file.db_path)
                .unwrap_or_else(default_db_path),
            auto_reply,
        })
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds)
    }
}

pub fn read_config_file(path: &Path) -> Result<FileConfig> {
    info!("Loading configuration from: {:?}", path);

    let content = fs::read_to_string(path)
        .map_err(|e| MailError::Config(format!("Failed to read config {:?}: {}", path, e)))?;

    let config: FileConfig = toml::from_str(&content)?;
    Ok(config)
}

fn parse_var<T: std::str::FromStr>(value: Option<String>, key: &str) -> Result<Option<T>> {
    value
        .map(|v| {
            v.parse::<T>()
                .map_err(|_| MailError::Config(format!("{} has an invalid value '{}'", key, v)))
        })
        .transpose()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
