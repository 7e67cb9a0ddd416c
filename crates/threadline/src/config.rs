//! Configuration parsing and validation.
//!
//! Threadline reads an optional TOML file, then applies environment
//! overrides (after `.env` has been loaded by the binary). Every setting
//! except the database path has a default, so a bare `THREADLINE_DB=...`
//! is enough to run the pipeline.
//!
//! # Example
//!
//! ```toml
//! [db]
//! path = "./data/threadline.sqlite"
//!
//! [dataset]
//! dataset = "notesbymuneeb/epstein-emails"
//! page_size = 100
//!
//! [chunking]
//! max_chars = 2000
//! overlap_chars = 200
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! batch_size = 64
//!
//! [rate_limit]
//! salt = "change-me"
//! window_secs = 60
//! max_requests = 60
//!
//! [server]
//! bind = "127.0.0.1:7341"
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use threadline_core::chunk::ChunkParams;
use threadline_core::models::ChunkFilter;
use threadline_core::rate_limit::RateLimitRule;
use threadline_core::search::{RetrievalLimits, MAX_TOP_K};
use threadline_core::Error;

/// Config file used when `--config` is not given. Missing is fine.
pub const DEFAULT_CONFIG_PATH: &str = "config/threadline.toml";

/// Hard cap on rows per page imposed by the dataset API.
pub const MAX_PAGE_SIZE: usize = 100;

pub const RETRIEVE_BUCKET: &str = "retrieve";
pub const CHAT_BUCKET: &str = "chat";

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DbConfig {
    #[serde(default)]
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatasetConfig {
    pub base_url: String,
    pub dataset: String,
    pub config: String,
    pub split: String,
    pub page_size: usize,
    pub start_offset: u64,
    /// 0 means no cap.
    pub max_rows: u64,
    pub delay_ms: u64,
    pub max_attempts: u32,
    pub timeout_secs: u64,
    pub store_raw_message: bool,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            base_url: "https://datasets-server.huggingface.co".to_string(),
            dataset: "notesbymuneeb/epstein-emails".to_string(),
            config: "default".to_string(),
            split: "train".to_string(),
            page_size: MAX_PAGE_SIZE,
            start_offset: 0,
            max_rows: 0,
            delay_ms: 0,
            max_attempts: 6,
            timeout_secs: 60,
            store_raw_message: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChunkingConfig {
    pub max_chars: usize,
    pub overlap_chars: usize,
    pub batch_messages: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: threadline_core::chunk::DEFAULT_MAX_CHARS,
            overlap_chars: threadline_core::chunk::DEFAULT_OVERLAP_CHARS,
            batch_messages: 200,
        }
    }
}

impl ChunkingConfig {
    pub fn params(&self) -> Result<ChunkParams> {
        ChunkParams::new(self.max_chars, self.overlap_chars)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: String,
    pub base_url: String,
    pub batch_size: usize,
    pub delay_ms: u64,
    /// 0 means no cap.
    pub max_chunks: u64,
    /// JSON `ChunkFilter`, e.g. `{"threadKey":"..."}`.
    pub query_filter: Option<String>,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "text-embedding-3-small".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            batch_size: 64,
            delay_ms: 250,
            max_chunks: 0,
            query_filter: None,
            max_attempts: 8,
            base_delay_ms: 800,
            max_delay_ms: 60_000,
            timeout_secs: 30,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    /// Parse `query_filter` strictly. Unknown keys are an error.
    pub fn filter(&self) -> Result<ChunkFilter> {
        match self.query_filter.as_deref().map(str::trim) {
            None | Some("") => Ok(ChunkFilter::default()),
            Some(raw) => serde_json::from_str::<ChunkFilter>(raw).map_err(|e| {
                anyhow::Error::from(Error::InvalidConfig(format!(
                    "embedding.query_filter is not a valid filter: {e}"
                )))
            }),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub default_top_k: usize,
    pub max_top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        let limits = RetrievalLimits::default();
        Self {
            default_top_k: limits.default_top_k,
            max_top_k: limits.max_top_k,
        }
    }
}

impl RetrievalConfig {
    pub fn limits(&self) -> RetrievalLimits {
        RetrievalLimits {
            default_top_k: self.default_top_k,
            max_top_k: self.max_top_k,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RateLimitConfig {
    pub salt: Option<String>,
    pub window_secs: u64,
    pub max_requests: u32,
    pub chat_max_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            salt: None,
            window_secs: 60,
            max_requests: 60,
            chat_max_requests: 30,
        }
    }
}

impl RateLimitConfig {
    pub fn retrieve_rule(&self) -> Result<RateLimitRule> {
        RateLimitRule::new(RETRIEVE_BUCKET, self.window_secs, self.max_requests)
    }

    pub fn chat_rule(&self) -> Result<RateLimitRule> {
        RateLimitRule::new(CHAT_BUCKET, self.window_secs, self.chat_max_requests)
    }

    pub fn require_salt(&self) -> Result<&str> {
        match self.salt.as_deref().map(str::trim) {
            Some(s) if !s.is_empty() => Ok(s),
            _ => Err(Error::InvalidConfig(
                "rate_limit.salt (RATE_LIMIT_SALT) is required to serve".into(),
            )
            .into()),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GenerationConfig {
    pub model: String,
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model: "gpt-5.2".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7341".to_string(),
        }
    }
}

/// Read `OPENAI_API_KEY`, failing with a configuration error when unset.
pub fn openai_api_key() -> Result<String> {
    match std::env::var("OPENAI_API_KEY") {
        Ok(k) if !k.trim().is_empty() => Ok(k.trim().to_string()),
        _ => Err(Error::InvalidConfig("OPENAI_API_KEY is not set".into()).into()),
    }
}

/// Load, override, and validate the configuration.
///
/// An explicit `path` must exist. Without one, [`DEFAULT_CONFIG_PATH`] is
/// read if present and defaults are used otherwise.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(p) => read_config_file(p)?,
        None => {
            let default = Path::new(DEFAULT_CONFIG_PATH);
            if default.exists() {
                read_config_file(default)?
            } else {
                Config::default()
            }
        }
    };
    config.apply_env(|name| std::env::var(name).ok())?;
    config.validate()?;
    Ok(config)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse::<T>().map_err(|_| {
        anyhow::Error::from(Error::InvalidConfig(format!(
            "{name} has an invalid value: '{value}'"
        )))
    })
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(Error::InvalidConfig(format!("{name} has an invalid value: '{value}'")).into()),
    }
}

impl Config {
    /// Apply environment overrides. `lookup` abstracts `std::env::var` for tests.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("THREADLINE_DB") {
            self.db.path = PathBuf::from(v);
        }

        if let Some(v) = lookup("HF_DATASET") {
            self.dataset.dataset = v;
        }
        if let Some(v) = lookup("HF_CONFIG") {
            self.dataset.config = v;
        }
        if let Some(v) = lookup("HF_SPLIT") {
            self.dataset.split = v;
        }
        if let Some(v) = lookup("HF_PAGE_SIZE") {
            self.dataset.page_size = parse_env("HF_PAGE_SIZE", &v)?;
        }
        if let Some(v) = lookup("HF_START_OFFSET") {
            self.dataset.start_offset = parse_env("HF_START_OFFSET", &v)?;
        }
        if let Some(v) = lookup("HF_MAX_ROWS") {
            self.dataset.max_rows = parse_env("HF_MAX_ROWS", &v)?;
        }
        if let Some(v) = lookup("HF_DELAY_MS") {
            self.dataset.delay_ms = parse_env("HF_DELAY_MS", &v)?;
        }
        if let Some(v) = lookup("STORE_RAW_MESSAGE") {
            self.dataset.store_raw_message = parse_bool("STORE_RAW_MESSAGE", &v)?;
        }

        if let Some(v) = lookup("CHUNK_MAX_CHARS") {
            self.chunking.max_chars = parse_env("CHUNK_MAX_CHARS", &v)?;
        }
        if let Some(v) = lookup("CHUNK_OVERLAP_CHARS") {
            self.chunking.overlap_chars = parse_env("CHUNK_OVERLAP_CHARS", &v)?;
        }
        if let Some(v) = lookup("CHUNK_BATCH_MESSAGES") {
            self.chunking.batch_messages = parse_env("CHUNK_BATCH_MESSAGES", &v)?;
        }

        if let Some(v) = lookup("EMBED_MODEL") {
            self.embedding.model = v;
        }
        if let Some(v) = lookup("EMBED_BATCH_SIZE") {
            self.embedding.batch_size = parse_env("EMBED_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("EMBED_DELAY_MS") {
            self.embedding.delay_ms = parse_env("EMBED_DELAY_MS", &v)?;
        }
        if let Some(v) = lookup("EMBED_MAX_CHUNKS") {
            self.embedding.max_chunks = parse_env("EMBED_MAX_CHUNKS", &v)?;
        }
        if let Some(v) = lookup("EMBED_QUERY_FILTER") {
            self.embedding.query_filter = Some(v);
        }

        if let Some(v) = lookup("RATE_LIMIT_SALT") {
            self.rate_limit.salt = Some(v);
        }
        if let Some(v) = lookup("RATE_LIMIT_WINDOW_SECS") {
            self.rate_limit.window_secs = parse_env("RATE_LIMIT_WINDOW_SECS", &v)?;
        }
        if let Some(v) = lookup("RATE_LIMIT_MAX") {
            self.rate_limit.max_requests = parse_env("RATE_LIMIT_MAX", &v)?;
        }

        if let Some(v) = lookup("GENERATION_MODEL") {
            self.generation.model = v;
        }
        if let Some(v) = lookup("THREADLINE_BIND") {
            self.server.bind = v;
        }
        Ok(())
    }

    pub fn validate(&mut self) -> Result<()> {
        if self.db.path.as_os_str().is_empty() {
            return Err(Error::InvalidConfig(
                "db.path is required (set it in the config file or THREADLINE_DB)".into(),
            )
            .into());
        }

        if self.dataset.page_size == 0 {
            return Err(Error::InvalidConfig("dataset.page_size must be > 0".into()).into());
        }
        self.dataset.page_size = self.dataset.page_size.min(MAX_PAGE_SIZE);
        if self.dataset.max_attempts == 0 {
            return Err(Error::InvalidConfig("dataset.max_attempts must be > 0".into()).into());
        }

        self.chunking.params()?;
        if self.chunking.batch_messages == 0 {
            return Err(Error::InvalidConfig("chunking.batch_messages must be > 0".into()).into());
        }

        match self.embedding.provider.as_str() {
            "openai" | "disabled" => {}
            other => {
                return Err(Error::InvalidConfig(format!(
                    "Unknown embedding provider: '{other}'. Must be openai or disabled."
                ))
                .into())
            }
        }
        if self.embedding.batch_size == 0 {
            return Err(Error::InvalidConfig("embedding.batch_size must be > 0".into()).into());
        }
        if self.embedding.max_attempts == 0 {
            return Err(Error::InvalidConfig("embedding.max_attempts must be > 0".into()).into());
        }
        if self.embedding.model.trim().is_empty() {
            return Err(Error::InvalidConfig("embedding.model must not be empty".into()).into());
        }
        self.embedding.filter()?;

        let limits = self.retrieval.limits();
        if limits.max_top_k == 0 || limits.max_top_k > MAX_TOP_K {
            return Err(Error::InvalidConfig(format!(
                "retrieval.max_top_k must be between 1 and {MAX_TOP_K}"
            ))
            .into());
        }
        if limits.default_top_k == 0 || limits.default_top_k > limits.max_top_k {
            return Err(Error::InvalidConfig(
                "retrieval.default_top_k must be between 1 and retrieval.max_top_k".into(),
            )
            .into());
        }

        self.rate_limit.retrieve_rule()?;
        self.rate_limit.chat_rule()?;
        Ok(())
    }
}
