use std::path::PathBuf;
use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

const DEFAULT_GEOCODER_BASE_URL: &str = "https://nominatim.openstreetmap.org";
const DEFAULT_CACHE_FRESHNESS_SECS: u64 = 24 * 60 * 60;
const DEFAULT_FUZZY_FLOOR: f64 = 0.86;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub geocoder_base_url: String,
    pub geocoder_user_agent: String,
    pub geocoder_api_key: Option<SecretString>,
    pub geocoder_timeout_ms: u64,
    pub geocoder_rate_limit_qps: u32,
    pub geocoder_retry_backoff_ms: u64,
    pub cache_freshness_secs: u64,
    pub resolver_concurrency: usize,
    pub fuzzy_similarity_floor: f64,
    pub database_file_name: String,
    pub sheets_dir: PathBuf,
    pub sheet_page_size: usize,
    pub data_dir: PathBuf,
    pub baseline_client_volume: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub geocoder_base_url: String,
    pub geocoder_user_agent: String,
    pub geocoder_timeout_ms: u64,
    pub geocoder_rate_limit_qps: u32,
    pub cache_freshness_secs: u64,
    pub resolver_concurrency: usize,
    pub fuzzy_similarity_floor: f64,
    pub database_file_name: String,
    pub sheet_page_size: usize,
    pub baseline_client_volume: f64,
    pub has_geocoder_key: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            geocoder_base_url: env::var("GEOCODER_BASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_GEOCODER_BASE_URL.to_string()),
            geocoder_user_agent: env::var("GEOCODER_USER_AGENT")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(default_user_agent),
            geocoder_api_key: env::var("GEOCODER_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            geocoder_timeout_ms: parse_u64("GEOCODER_TIMEOUT_MS", 5_000).max(100),
            geocoder_rate_limit_qps: parse_u32("GEOCODER_RATE_LIMIT_QPS", 1).max(1),
            geocoder_retry_backoff_ms: parse_u64("GEOCODER_RETRY_BACKOFF_MS", 250),
            cache_freshness_secs: parse_u64("CACHE_FRESHNESS_SECS", DEFAULT_CACHE_FRESHNESS_SECS),
            resolver_concurrency: parse_usize("RESOLVER_CONCURRENCY", 8).max(1),
            fuzzy_similarity_floor: parse_f64("FUZZY_SIMILARITY_FLOOR", DEFAULT_FUZZY_FLOOR)
                .clamp(0.5, 1.0),
            database_file_name: env::var("DATABASE_FILE_NAME")
                .unwrap_or_else(|_| "resolution-cache.db".to_string()),
            sheets_dir: env::var("SHEETS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./sheets")),
            sheet_page_size: parse_usize("SHEET_PAGE_SIZE", 500).max(1),
            data_dir: env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            baseline_client_volume: parse_f64("BASELINE_CLIENT_VOLUME", 0.0).max(0.0),
        }
    }

    pub fn geocoder_timeout(&self) -> Duration {
        Duration::from_millis(self.geocoder_timeout_ms)
    }

    pub fn cache_freshness(&self) -> Duration {
        Duration::from_secs(self.cache_freshness_secs)
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            geocoder_base_url: self.geocoder_base_url.clone(),
            geocoder_user_agent: self.geocoder_user_agent.clone(),
            geocoder_timeout_ms: self.geocoder_timeout_ms,
            geocoder_rate_limit_qps: self.geocoder_rate_limit_qps,
            cache_freshness_secs: self.cache_freshness_secs,
            resolver_concurrency: self.resolver_concurrency,
            fuzzy_similarity_floor: self.fuzzy_similarity_floor,
            database_file_name: self.database_file_name.clone(),
            sheet_page_size: self.sheet_page_size,
            baseline_client_volume: self.baseline_client_volume,
            has_geocoder_key: self.geocoder_api_key.is_some(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            geocoder_base_url: DEFAULT_GEOCODER_BASE_URL.to_string(),
            geocoder_user_agent: default_user_agent(),
            geocoder_api_key: None,
            geocoder_timeout_ms: 5_000,
            geocoder_rate_limit_qps: 1,
            geocoder_retry_backoff_ms: 250,
            cache_freshness_secs: DEFAULT_CACHE_FRESHNESS_SECS,
            resolver_concurrency: 8,
            fuzzy_similarity_floor: DEFAULT_FUZZY_FLOOR,
            database_file_name: "resolution-cache.db".to_string(),
            sheets_dir: PathBuf::from("./sheets"),
            sheet_page_size: 500,
            data_dir: PathBuf::from("./data"),
            baseline_client_volume: 0.0,
        }
    }
}

fn default_user_agent() -> String {
    format!("address-growth/{}", env!("CARGO_PKG_VERSION"))
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn parse_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_public_profile_without_secrets() {
        env::set_var("GEOCODER_API_KEY", "secret");
        env::set_var("DATABASE_FILE_NAME", "custom.db");
        env::set_var("RESOLVER_CONCURRENCY", "0");
        env::set_var("FUZZY_SIMILARITY_FLOOR", "7.5");

        let config = AppConfig::from_env();
        let public = config.public_profile();

        assert_eq!(public.database_file_name, "custom.db");
        assert!(public.has_geocoder_key);
        assert!(config.geocoder_api_key.is_some());
        assert_eq!(public.resolver_concurrency, 1);
        assert_eq!(public.fuzzy_similarity_floor, 1.0);
        assert!(public.geocoder_user_agent.starts_with("address-growth/"));
    }
}
