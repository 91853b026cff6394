use std::path::PathBuf;
use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

use crate::denylist::Denylist;
use crate::errors::{AppError, AppResult};

const DEFAULT_BATCH_SIZE: usize = 10;
const DEFAULT_BATCH_DELAY_MS: u64 = 1_000;
const DEFAULT_NOMINATIM_PACING_MS: u64 = 1_000;
const DEFAULT_RATE_LIMIT_MAX_ATTEMPTS: u32 = 10;
const DEFAULT_RATE_LIMIT_BASE_DELAY_MS: u64 = 3_000;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub input_path: PathBuf,
    pub cache_path: PathBuf,
    pub output_path: PathBuf,
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    pub nominatim_endpoint: String,
    pub nominatim_user_agent: String,
    pub nominatim_pacing_ms: u64,
    pub openai_base_url: String,
    pub openai_model: String,
    pub openai_api_key: Option<SecretString>,
    pub rate_limit_max_attempts: u32,
    pub rate_limit_base_delay_ms: u64,
    pub http_timeout_secs: u64,
    pub denylist: Denylist,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub input_path: String,
    pub cache_path: String,
    pub output_path: String,
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    pub nominatim_endpoint: String,
    pub nominatim_pacing_ms: u64,
    pub openai_base_url: String,
    pub openai_model: String,
    pub rate_limit_max_attempts: u32,
    pub has_openai_key: bool,
    pub denylist_patterns: usize,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let mut denylist = Denylist::default();
        if let Some(substrings) = parse_list("GEOCODE_DENYLIST_SUBSTRINGS") {
            denylist = denylist.with_substrings(substrings);
        }
        if let Some(words) = parse_list("GEOCODE_DENYLIST_WORDS") {
            denylist = denylist.with_words(words);
        }

        Self {
            input_path: parse_path("USERS_INPUT_PATH", "users_with_fields.json"),
            cache_path: parse_path("GEOCODE_CACHE_PATH", "geocode_cache.json"),
            output_path: parse_path("GEOCODE_OUTPUT_PATH", "geocoded_results.json"),
            batch_size: parse_usize("GEOCODE_BATCH_SIZE", DEFAULT_BATCH_SIZE).max(1),
            batch_delay_ms: parse_u64("GEOCODE_BATCH_DELAY_MS", DEFAULT_BATCH_DELAY_MS),
            nominatim_endpoint: env::var("NOMINATIM_ENDPOINT")
                .unwrap_or_else(|_| "https://nominatim.openstreetmap.org/search".to_string()),
            nominatim_user_agent: env::var("NOMINATIM_USER_AGENT")
                .unwrap_or_else(|_| "CommunityMap/1.0".to_string()),
            nominatim_pacing_ms: parse_u64("NOMINATIM_PACING_MS", DEFAULT_NOMINATIM_PACING_MS),
            openai_base_url: env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            openai_model: env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            openai_api_key: env::var("OPENAI_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(|v| SecretString::new(v.into())),
            rate_limit_max_attempts: parse_u32(
                "RATE_LIMIT_MAX_ATTEMPTS",
                DEFAULT_RATE_LIMIT_MAX_ATTEMPTS,
            )
            .max(1),
            rate_limit_base_delay_ms: parse_u64(
                "RATE_LIMIT_BASE_DELAY_MS",
                DEFAULT_RATE_LIMIT_BASE_DELAY_MS,
            ),
            http_timeout_secs: parse_u64("HTTP_TIMEOUT_SECS", 30).max(1),
            denylist,
        }
    }

    /// Fails before any work starts when the fallback credential is missing.
    pub fn require_openai_key(&self) -> AppResult<SecretString> {
        self.openai_api_key
            .clone()
            .ok_or_else(|| AppError::Config("OPENAI_KEY is not defined in environment variables.".into()))
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn nominatim_pacing(&self) -> Duration {
        Duration::from_millis(self.nominatim_pacing_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            input_path: self.input_path.display().to_string(),
            cache_path: self.cache_path.display().to_string(),
            output_path: self.output_path.display().to_string(),
            batch_size: self.batch_size,
            batch_delay_ms: self.batch_delay_ms,
            nominatim_endpoint: self.nominatim_endpoint.clone(),
            nominatim_pacing_ms: self.nominatim_pacing_ms,
            openai_base_url: self.openai_base_url.clone(),
            openai_model: self.openai_model.clone(),
            rate_limit_max_attempts: self.rate_limit_max_attempts,
            has_openai_key: self.openai_api_key.is_some(),
            denylist_patterns: self.denylist.len(),
        }
    }
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

fn parse_path(key: &str, default: &str) -> PathBuf {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(default))
}

fn parse_list(key: &str) -> Option<Vec<String>> {
    let raw = env::var(key).ok()?;
    Some(
        raw.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect(),
    )
}
