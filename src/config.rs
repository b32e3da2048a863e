use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable consulted when `remote.api_key` is absent.
pub const API_KEY_ENV: &str = "SUPABASE_ANON_KEY";

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub remote: RemoteConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RemoteConfig {
    pub url: String,
    pub api_key: Option<String>,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_bounds_rpc")]
    pub bounds_rpc: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    pub static_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_geojson")]
    pub geojson: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            static_dir: None,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            geojson: default_geojson(),
        }
    }
}

fn default_table() -> String {
    "manzanas".to_string()
}

fn default_bounds_rpc() -> String {
    "get_manzanas_in_bounds".to_string()
}

fn default_page_size() -> usize {
    1000
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_port() -> u16 {
    8080
}

fn default_geojson() -> PathBuf {
    PathBuf::from("manzanas.geojson")
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "Failed to parse TOML configuration")?;
        if config.remote.page_size == 0 {
            return Err(anyhow!("remote.page_size must be greater than zero"));
        }
        Ok(config)
    }
}

impl RemoteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Key from the file, falling back to the environment.
    pub fn resolve_api_key(&self) -> Result<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.is_empty()) {
            return Ok(key.clone());
        }
        std::env::var(API_KEY_ENV)
            .with_context(|| format!("No remote.api_key configured and {} is not set", API_KEY_ENV))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [remote]
            url = "https://example.supabase.co"
            api_key = "anon"
            "#,
        )
        .unwrap();
        assert_eq!(config.remote.table, "manzanas");
        assert_eq!(config.remote.bounds_rpc, "get_manzanas_in_bounds");
        assert_eq!(config.remote.page_size, 1000);
        assert_eq!(config.remote.timeout(), Duration::from_secs(30));
        assert_eq!(config.remote.max_retries, 3);
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.remote.resolve_api_key().unwrap(), "anon");
    }

    #[test]
    fn zero_page_size_is_rejected() {
        let err = AppConfig::from_toml(
            r#"
            [remote]
            url = "https://example.supabase.co"
            page_size = 0
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("page_size"));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            concat!(
                "[remote]\nurl = \"http://localhost:54321\"\npage_size = 250\n\n",
                "[server]\nport = 9000\n\n",
                "[output]\ngeojson = \"out.geojson\""
            )
        )
        .unwrap();
        let config = AppConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.remote.page_size, 250);
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.output.geojson, PathBuf::from("out.geojson"));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = AppConfig::load_from_file(Path::new("/nonexistent/config.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
