use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{PhishError, Result};
use crate::scoring::ScoringConfig;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub gmail: GmailConfig,
    #[serde(default)]
    pub intel: IntelConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            environment: default_environment(),
            cors_origins: default_cors_origins(),
            log_format: default_log_format(),
        }
    }
}

impl ServerConfig {
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub jwt_secret: String,
    #[serde(default = "default_token_ttl_hours")]
    pub token_ttl_hours: i64,
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            token_ttl_hours: default_token_ttl_hours(),
            cookie_name: default_cookie_name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GmailConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    #[serde(default = "default_frontend_url")]
    pub frontend_url: String,
    /// Google console download (`credentials.json`); used when client id/secret are empty
    #[serde(default)]
    pub credentials_file: Option<PathBuf>,
    #[serde(default = "default_max_results")]
    pub max_results: u32,
    #[serde(default = "default_refresh_buffer_secs")]
    pub refresh_buffer_secs: i64,
    #[serde(default = "default_refresh_max_retries")]
    pub refresh_max_retries: u32,
    #[serde(default = "default_refresh_backoff_ms")]
    pub refresh_backoff_ms: u64,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl Default for GmailConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            redirect_uri: default_redirect_uri(),
            frontend_url: default_frontend_url(),
            credentials_file: None,
            max_results: default_max_results(),
            refresh_buffer_secs: default_refresh_buffer_secs(),
            refresh_max_retries: default_refresh_max_retries(),
            refresh_backoff_ms: default_refresh_backoff_ms(),
            auth_uri: default_auth_uri(),
            token_uri: default_token_uri(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntelConfig {
    #[serde(default)]
    pub virustotal_api_key: Option<String>,
    #[serde(default)]
    pub abuseipdb_api_key: Option<String>,
    #[serde(default)]
    pub ipinfo_token: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_concurrent_lookups")]
    pub max_concurrent_lookups: usize,
    #[serde(default = "default_virustotal_per_minute")]
    pub virustotal_per_minute: u32,
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
}

impl Default for IntelConfig {
    fn default() -> Self {
        Self {
            virustotal_api_key: None,
            abuseipdb_api_key: None,
            ipinfo_token: None,
            request_timeout_secs: default_request_timeout_secs(),
            max_concurrent_lookups: default_max_concurrent_lookups(),
            virustotal_per_minute: default_virustotal_per_minute(),
            cache_size: default_cache_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_circuit_breaker_enabled")]
    pub enabled: bool,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_reset_timeout_secs")]
    pub reset_timeout_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: default_circuit_breaker_enabled(),
            failure_threshold: default_failure_threshold(),
            reset_timeout_secs: default_reset_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Pending sandbox jobs buffered before submissions wait
    #[serde(default = "default_sandbox_queue")]
    pub sandbox_queue: usize,
    #[serde(default = "default_sandbox_timeout_secs")]
    pub sandbox_timeout_secs: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            sandbox_queue: default_sandbox_queue(),
            sandbox_timeout_secs: default_sandbox_timeout_secs(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:5000".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_cors_origins() -> Vec<String> {
    vec!["http://localhost:3000".to_string()]
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_token_ttl_hours() -> i64 {
    24
}

fn default_cookie_name() -> String {
    "token".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("phishguard.db")
}

fn default_redirect_uri() -> String {
    "http://localhost:5000/api/gmail/callback".to_string()
}

fn default_frontend_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_max_results() -> u32 {
    10
}

fn default_refresh_buffer_secs() -> i64 {
    300
}

fn default_refresh_max_retries() -> u32 {
    3
}

fn default_refresh_backoff_ms() -> u64 {
    1000
}

fn default_auth_uri() -> String {
    "https://accounts.google.com/o/oauth2/v2/auth".to_string()
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

fn default_request_timeout_secs() -> u64 {
    5
}

fn default_max_concurrent_lookups() -> usize {
    8
}

fn default_virustotal_per_minute() -> u32 {
    4
}

fn default_cache_size() -> usize {
    512
}

fn default_circuit_breaker_enabled() -> bool {
    true
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_secs() -> u64 {
    60
}

fn default_batch_size() -> usize {
    5
}

fn default_sandbox_queue() -> usize {
    64
}

fn default_sandbox_timeout_secs() -> u64 {
    30
}

/// Read a non-empty environment variable
fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            let mut config = Self::default();
            config.apply_env_overrides();
            config.validate()?;
            return Ok(config);
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| PhishError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let mut config: Self = toml::from_str(&content)
            .map_err(|e| PhishError::ConfigError(format!("Failed to parse config file: {}", e)))?;

        config.apply_env_overrides();
        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                PhishError::ConfigError(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| PhishError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        tokio::fs::write(path, content)
            .await
            .map_err(|e| PhishError::ConfigError(format!("Failed to write config file: {}", e)))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Overlay deployment environment variables on top of file values
    pub fn apply_env_overrides(&mut self) {
        if let Some(port) = env_var("PORT") {
            let host = self
                .server
                .bind
                .rsplit_once(':')
                .map(|(host, _)| host.to_string())
                .unwrap_or_else(|| "0.0.0.0".to_string());
            self.server.bind = format!("{}:{}", host, port);
        }
        if let Some(env) = env_var("PHISHGUARD_ENV").or_else(|| env_var("NODE_ENV")) {
            self.server.environment = env;
        }
        if let Some(secret) = env_var("JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }
        if let Some(path) = env_var("DATABASE_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(id) = env_var("GOOGLE_CLIENT_ID") {
            self.gmail.client_id = id;
        }
        if let Some(secret) = env_var("GOOGLE_CLIENT_SECRET") {
            self.gmail.client_secret = secret;
        }
        if let Some(uri) = env_var("REDIRECT_URI") {
            self.gmail.redirect_uri = uri;
        }
        if let Some(url) = env_var("FRONTEND_URL") {
            self.gmail.frontend_url = url;
        }
        if let Some(key) = env_var("VIRUSTOTAL_API_KEY") {
            self.intel.virustotal_api_key = Some(key);
        }
        if let Some(key) = env_var("ABUSEIPDB_API_KEY") {
            self.intel.abuseipdb_api_key = Some(key);
        }
        if let Some(token) = env_var("IPINFO_API_KEY") {
            self.intel.ipinfo_token = Some(token);
        }

        tracing::debug!(
            environment = %self.server.environment,
            jwt_secret_set = !self.auth.jwt_secret.is_empty(),
            virustotal_key_set = self.intel.virustotal_api_key.is_some(),
            abuseipdb_key_set = self.intel.abuseipdb_api_key.is_some(),
            "Applied environment overrides"
        );
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        match self.server.log_format.as_str() {
            "text" | "json" => {}
            other => {
                return Err(PhishError::ConfigError(format!(
                    "Invalid server.log_format: '{}'. Must be 'text' or 'json'",
                    other
                )));
            }
        }

        if self.server.environment != "development" && self.auth.jwt_secret.is_empty() {
            return Err(PhishError::ConfigError(
                "auth.jwt_secret must be set outside development".to_string(),
            ));
        }
        if self.auth.token_ttl_hours <= 0 {
            return Err(PhishError::ConfigError(
                "auth.token_ttl_hours must be greater than 0".to_string(),
            ));
        }
        if self.auth.cookie_name.is_empty() {
            return Err(PhishError::ConfigError(
                "auth.cookie_name cannot be empty".to_string(),
            ));
        }

        if self.gmail.max_results == 0 || self.gmail.max_results > 500 {
            return Err(PhishError::ConfigError(
                "gmail.max_results must be between 1 and 500".to_string(),
            ));
        }
        if self.gmail.refresh_buffer_secs < 0 {
            return Err(PhishError::ConfigError(
                "gmail.refresh_buffer_secs cannot be negative".to_string(),
            ));
        }

        if self.intel.max_concurrent_lookups == 0 {
            return Err(PhishError::ConfigError(
                "intel.max_concurrent_lookups must be at least 1".to_string(),
            ));
        }
        if self.intel.virustotal_per_minute == 0 {
            return Err(PhishError::ConfigError(
                "intel.virustotal_per_minute must be at least 1".to_string(),
            ));
        }
        if self.intel.cache_size == 0 {
            return Err(PhishError::ConfigError(
                "intel.cache_size must be at least 1".to_string(),
            ));
        }

        self.scoring.validate()?;

        if self.circuit_breaker.failure_threshold == 0 {
            return Err(PhishError::ConfigError(
                "circuit_breaker.failure_threshold must be greater than 0".to_string(),
            ));
        }
        if self.circuit_breaker.reset_timeout_secs == 0 {
            return Err(PhishError::ConfigError(
                "circuit_breaker.reset_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.analysis.batch_size == 0 {
            return Err(PhishError::ConfigError(
                "analysis.batch_size must be at least 1".to_string(),
            ));
        }
        if self.analysis.sandbox_queue == 0 || self.analysis.sandbox_timeout_secs == 0 {
            return Err(PhishError::ConfigError(
                "analysis.sandbox_queue and analysis.sandbox_timeout_secs must be at least 1"
                    .to_string(),
            ));
        }

        tracing::debug!("Configuration validation passed");
        Ok(())
    }

    /// Create an example configuration file
    pub async fn create_example(path: &Path) -> Result<()> {
        let config = Self::default();
        config.save(path).await
    }
}
