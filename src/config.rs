//! Service configuration: an optional TOML file plus environment overrides.

use serde::Deserialize;
use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};

pub const DEV_SECRET: &str = "dev-secret-change-me";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Must be absolute; checked by [`Config::validate`].
    #[serde(default = "default_upload_root")]
    pub upload_root: PathBuf,
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: BTreeSet<String>,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,
    #[serde(default = "default_token_expiry_hours")]
    pub token_expiry_hours: i64,
    #[serde(default = "default_bcrypt_cost")]
    pub bcrypt_cost: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:5050".to_string()
}

fn default_db_path() -> String {
    "instance/sharevault.db".to_string()
}

fn default_upload_root() -> PathBuf {
    env::current_dir()
        .map(|dir| dir.join("uploads"))
        .unwrap_or_else(|_| PathBuf::from("uploads"))
}

fn default_allowed_extensions() -> BTreeSet<String> {
    [
        "txt", "log", "md", "json", "xml", "csv", "pdf", "doc", "docx", "xls", "xlsx", "ppt",
        "pptx", "hwp", "png", "jpg", "jpeg", "gif", "bmp", "svg", "ico", "mp4", "mov", "avi",
        "wmv", "mkv", "webm", "mp3", "wav", "ogg", "flac", "zip", "tar", "gz", "7z",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_max_upload_bytes() -> u64 {
    256 * 1024 * 1024
}

fn default_jwt_secret() -> String {
    DEV_SECRET.to_string()
}

fn default_token_expiry_hours() -> i64 {
    24
}

fn default_bcrypt_cost() -> u32 {
    bcrypt::DEFAULT_COST
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_root: default_upload_root(),
            allowed_extensions: default_allowed_extensions(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: default_jwt_secret(),
            token_expiry_hours: default_token_expiry_hours(),
            bcrypt_cost: default_bcrypt_cost(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| AppError::Config(format!("{key} must be a number, got {value:?}")))
}

impl Config {
    /// Load from `SHAREVAULT_CONFIG` (or `sharevault.toml` if present) and apply
    /// environment overrides. Call [`Config::validate`] once logging is up.
    pub fn load() -> Result<Self> {
        let path = env::var("SHAREVAULT_CONFIG").unwrap_or_else(|_| "sharevault.toml".to_string());
        let mut config = if Path::new(&path).exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            AppError::Config(format!("cannot read {}: {e}", path.as_ref().display()))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(content).map_err(|e| AppError::Config(e.to_string()))?;
        config.storage.allowed_extensions = config
            .storage
            .allowed_extensions
            .iter()
            .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
            .collect();
        Ok(config)
    }

    /// Apply `SECRET_KEY`, `UPLOAD_FOLDER`, `DATABASE_PATH`, `BIND_ADDR`,
    /// `JWT_EXPIRATION_HOURS` and `MAX_CONTENT_LENGTH` from `lookup`.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(secret) = lookup("SECRET_KEY") {
            self.auth.jwt_secret = secret;
        }
        if let Some(root) = lookup("UPLOAD_FOLDER") {
            self.storage.upload_root = PathBuf::from(root);
        }
        if let Some(path) = lookup("DATABASE_PATH") {
            self.database.path = path;
        }
        if let Some(addr) = lookup("BIND_ADDR") {
            self.server.bind_addr = addr;
        }
        if let Some(hours) = lookup("JWT_EXPIRATION_HOURS") {
            self.auth.token_expiry_hours = parse_number("JWT_EXPIRATION_HOURS", &hours)?;
        }
        if let Some(bytes) = lookup("MAX_CONTENT_LENGTH") {
            self.storage.max_upload_bytes = parse_number("MAX_CONTENT_LENGTH", &bytes)?;
        }
        Ok(())
    }

    /// A relative upload root is fatal: the service refuses to start.
    pub fn validate(&self) -> Result<()> {
        if !self.storage.upload_root.is_absolute() {
            return Err(AppError::Config(format!(
                "upload root {} is not an absolute path",
                self.storage.upload_root.display()
            )));
        }
        if self.storage.allowed_extensions.is_empty() {
            return Err(AppError::Config("no allowed file extensions".to_string()));
        }
        if self.storage.max_upload_bytes == 0 {
            return Err(AppError::Config("max upload size must be positive".to_string()));
        }
        if self.auth.token_expiry_hours <= 0 {
            return Err(AppError::Config("token expiry must be positive".to_string()));
        }
        if self.auth.jwt_secret.is_empty() {
            return Err(AppError::Config("token signing secret is empty".to_string()));
        }
        if self.auth.jwt_secret == DEV_SECRET {
            tracing::warn!("using the development token secret; set SECRET_KEY in production");
        }
        Ok(())
    }
}
