use std::{env, net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{bail, Result};

pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-pro";
pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendMode {
    Mock,
    Real,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub database_url: Option<String>,
    pub use_postgres: bool,
    pub allow_fallback: bool,
    pub sqlite_path: PathBuf,
    pub pg_max_connections: u32,
    pub backend_mode: BackendMode,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub gemini_base_url: String,
    pub generation_timeout: Duration,
    pub suggestion_count: usize,
    pub memory_turns: usize,
    pub memory_capacity: usize,
    pub cors_origins: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            database_url: None,
            use_postgres: true,
            allow_fallback: false,
            sqlite_path: PathBuf::from("data/app.db"),
            pg_max_connections: 5,
            backend_mode: BackendMode::Mock,
            gemini_api_key: None,
            gemini_model: DEFAULT_GEMINI_MODEL.to_string(),
            gemini_base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
            generation_timeout: Duration::from_secs(30),
            suggestion_count: crate::normalizer::SUGGESTION_COUNT,
            memory_turns: 5,
            memory_capacity: 1024,
            cors_origins: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let bind_raw = env::var("CORRECTION_API_BIND_ADDR").unwrap_or_default();
        let bind_normalized = bind_raw.trim().trim_matches('"').trim_matches('\'');
        let bind_addr = bind_normalized
            .parse::<SocketAddr>()
            .unwrap_or(defaults.bind_addr);

        let database_url = non_empty_var("DATABASE_URL");
        let use_postgres = flag_var("USE_POSTGRESQL").unwrap_or(defaults.use_postgres);
        let allow_fallback =
            flag_var("CORRECTION_ALLOW_FALLBACK").unwrap_or(defaults.allow_fallback);

        let sqlite_path = non_empty_var("CORRECTION_SQLITE_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.sqlite_path);

        let pg_max_connections = env::var("CORRECTION_PG_MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.trim().parse::<u32>().ok())
            .unwrap_or(defaults.pg_max_connections);

        let backend_mode = match non_empty_var("BACKEND_MODE")
            .map(|v| v.to_ascii_lowercase())
            .as_deref()
        {
            None | Some("mock") => BackendMode::Mock,
            Some("real") | Some("gemini") => BackendMode::Real,
            Some(other) => bail!("Unsupported BACKEND_MODE `{other}` (expected `mock` or `real`)"),
        };

        let gemini_api_key = non_empty_var("GEMINI_API_KEY");
        let gemini_model = non_empty_var("GEMINI_MODEL").unwrap_or(defaults.gemini_model);
        let gemini_base_url = non_empty_var("GEMINI_BASE_URL")
            .map(|v| v.trim_end_matches('/').to_string())
            .unwrap_or(defaults.gemini_base_url);

        let generation_timeout = env::var("GENERATION_TIMEOUT_SECONDS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.generation_timeout);

        let suggestion_count = env::var("SUGGESTION_COUNT")
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(defaults.suggestion_count);

        let memory_turns = env::var("CONVERSATION_MEMORY_TURNS")
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(defaults.memory_turns);

        let memory_capacity = env::var("CONVERSATION_MEMORY_CAPACITY")
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(defaults.memory_capacity);

        let cors_origins = env::var("ADDITIONAL_CORS_ORIGINS")
            .map(|v| parse_origins(&v))
            .unwrap_or_default();

        Ok(Self {
            bind_addr,
            database_url,
            use_postgres,
            allow_fallback,
            sqlite_path,
            pg_max_connections,
            backend_mode,
            gemini_api_key,
            gemini_model,
            gemini_base_url,
            generation_timeout,
            suggestion_count,
            memory_turns,
            memory_capacity,
            cors_origins,
        })
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn flag_var(name: &str) -> Option<bool> {
    env::var(name).ok().map(|v| parse_flag(&v))
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_accept_common_truthy_spellings() {
        for raw in ["1", "true", "YES", " on "] {
            assert!(parse_flag(raw), "{raw}");
        }
        for raw in ["0", "false", "off", ""] {
            assert!(!parse_flag(raw), "{raw}");
        }
    }

    #[test]
    fn origins_are_comma_separated() {
        assert_eq!(
            parse_origins("http://localhost:3000, https://app.example.com,,"),
            vec!["http://localhost:3000", "https://app.example.com"]
        );
        assert!(parse_origins("  ").is_empty());
    }

    #[test]
    fn defaults_select_postgres_without_fallback() {
        let config = Config::default();
        assert!(config.use_postgres);
        assert!(!config.allow_fallback);
        assert_eq!(config.backend_mode, BackendMode::Mock);
        assert_eq!(config.suggestion_count, 5);
        assert_eq!(config.bind_addr.port(), 8000);
    }
}
