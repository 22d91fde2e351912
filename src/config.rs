//! Configuration for the safeprag-sync service

use anyhow::{Context, Result, bail};
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_ENV: &str = "SAFEPRAG_SYNC_CONFIG";

/// Service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Hosted backend; sync is off while this is absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteConfig>,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub downloads: DownloadsConfig,
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Project URL, e.g. `https://xyz.supabase.co`
    pub url: String,
    /// Anonymous or service key sent as `apikey` and bearer token
    pub api_key: String,
    #[serde(default = "default_remote_timeout")]
    pub timeout_secs: u64,
}

impl RemoteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between background push/pull rounds
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    /// Outbox tasks delivered per round
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Failed deliveries before a task is dead-lettered
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_retry_delay")]
    pub base_retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadsConfig {
    /// Directory for generated and downloaded files
    #[serde(default = "default_downloads_dir")]
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Human-readable name for the token
    pub name: String,
    /// The hashed API token (argon2 hash, or plain text for older configs)
    pub token_hash: String,
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3040
}

fn default_db_path() -> PathBuf {
    PathBuf::from("safeprag-sync.sqlite")
}

fn default_remote_timeout() -> u64 {
    15
}

fn default_true() -> bool {
    true
}

fn default_interval() -> u64 {
    60
}

fn default_batch_size() -> usize {
    50
}

fn default_max_attempts() -> u32 {
    8
}

fn default_base_retry_delay() -> u64 {
    5_000
}

fn default_max_retry_delay() -> u64 {
    3_600_000
}

fn default_downloads_dir() -> PathBuf {
    PathBuf::from("downloads")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
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

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_interval(),
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            base_retry_delay_ms: default_base_retry_delay(),
            max_retry_delay_ms: default_max_retry_delay(),
        }
    }
}

impl Default for DownloadsConfig {
    fn default() -> Self {
        Self {
            dir: default_downloads_dir(),
        }
    }
}

impl Config {
    /// Default config path
    pub fn default_path() -> Result<PathBuf> {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            return Ok(PathBuf::from(env_path));
        }

        let local = PathBuf::from("config.toml");
        if local.exists() {
            return Ok(local);
        }

        // Docker volume
        let data_config = PathBuf::from("/data/config.toml");
        if data_config.exists() {
            return Ok(data_config);
        }

        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("safeprag-sync");

        Ok(config_dir.join("config.toml"))
    }

    /// Load config from default path
    pub fn load() -> Result<Self> {
        let path = Self::default_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).context("Failed to read config file")?;
        let config: Self = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let with_comments = format!(
            "# safeprag-sync configuration\n\
             #\n\
             # Enable the backend by adding:\n\
             # [remote]\n\
             # url = \"https://<project>.supabase.co\"\n\
             # api_key = \"<key>\"\n\n\
             {}\n\n\
             # Add tokens with: safeprag-sync token --name <device-name>\n",
            content
        );

        std::fs::write(path, with_comments).context("Failed to write config file")?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.sync.batch_size == 0 {
            bail!("sync.batch_size must be at least 1");
        }
        if self.sync.max_attempts == 0 {
            bail!("sync.max_attempts must be at least 1");
        }
        if self.sync.base_retry_delay_ms > self.sync.max_retry_delay_ms {
            bail!("sync.base_retry_delay_ms cannot exceed sync.max_retry_delay_ms");
        }
        if let Some(remote) = &self.remote
            && remote.url.trim().is_empty()
        {
            bail!("remote.url is empty");
        }
        Ok(())
    }

    /// Background sync runs only with a backend configured
    pub fn sync_active(&self) -> bool {
        self.sync.enabled && self.remote.is_some()
    }

    /// Adds a named token hash; false when the name is taken
    pub fn add_token(&mut self, name: &str, token_hash: String) -> bool {
        if self.tokens.iter().any(|t| t.name == name) {
            return false;
        }
        self.tokens.push(TokenConfig {
            name: name.to_string(),
            token_hash,
        });
        true
    }

    /// Removes the named token; false when nothing matched
    pub fn revoke_token(&mut self, name: &str) -> bool {
        let before = self.tokens.len();
        self.tokens.retain(|t| t.name != name);
        self.tokens.len() != before
    }

    /// Check if a token is valid (supports both hashed and plain tokens)
    pub fn validate_token(&self, token: &str) -> bool {
        let argon2 = Argon2::default();

        for t in &self.tokens {
            if let Ok(parsed_hash) = PasswordHash::new(&t.token_hash) {
                if argon2
                    .verify_password(token.as_bytes(), &parsed_hash)
                    .is_ok()
                {
                    return true;
                }
            } else if t.token_hash == token {
                return true;
            }
        }
        false
    }
}

/// Hash a token using argon2
pub fn hash_token(token: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(token.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Failed to hash token: {}", e))?;
    Ok(hash.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_sections_take_defaults() {
        let config: Config = toml::from_str("[server]\nport = 8080\n").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.database.path, PathBuf::from("safeprag-sync.sqlite"));
        assert_eq!(config.sync.max_attempts, 8);
        assert!(config.remote.is_none());
        assert!(!config.sync_active());
    }

    #[test]
    fn remote_section_enables_sync() {
        let config: Config = toml::from_str(
            "[remote]\nurl = \"https://demo.supabase.co\"\napi_key = \"anon\"\n\n[sync]\ninterval_secs = 30\n",
        )
        .unwrap();
        assert!(config.sync_active());
        assert_eq!(config.sync.interval_secs, 30);
        assert_eq!(config.remote.unwrap().timeout(), Duration::from_secs(15));
    }

    #[test]
    fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.tokens.push(TokenConfig {
            name: "tablet".into(),
            token_hash: hash_token("sps_secret").unwrap(),
        });
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.tokens.len(), 1);
        assert!(loaded.validate_token("sps_secret"));
        assert!(!loaded.validate_token("sps_other"));
    }

    #[test]
    fn token_names_are_unique_and_revocable() {
        let mut config = Config::default();
        assert!(config.add_token("tablet", "h1".into()));
        assert!(!config.add_token("tablet", "h2".into()));
        assert_eq!(config.tokens.len(), 1);
        assert!(config.revoke_token("tablet"));
        assert!(!config.revoke_token("tablet"));
        assert!(config.tokens.is_empty());
    }

    #[test]
    fn plain_tokens_still_validate() {
        let config = Config {
            tokens: vec![TokenConfig {
                name: "legacy".into(),
                token_hash: "plain-token".into(),
            }],
            ..Default::default()
        };
        assert!(config.validate_token("plain-token"));
        assert!(!config.validate_token("nope"));
    }

    #[test]
    fn inconsistent_retry_settings_are_rejected() {
        let config = Config {
            sync: SyncConfig {
                base_retry_delay_ms: 10_000,
                max_retry_delay_ms: 1_000,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
