use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;

use crate::core::types::{Credential, FilterCriteria};

// ---------------------------------------------------------------------------
// SentinelConfig — file-based config loader (slot-sentinel.json) with
// env-var fallback
// ---------------------------------------------------------------------------

pub const ENV_CONFIG_PATH: &str = "SLOT_SENTINEL_CONFIG";
pub const ENV_CREDENTIAL_PATH: &str = "SLOT_SENTINEL_CREDENTIALS";
pub const ENV_PROFILE_DIR: &str = "SLOT_SENTINEL_PROFILE_DIR";
pub const ENV_TELEGRAM_BOT_TOKEN: &str = "TELEGRAM_BOT_TOKEN";
pub const ENV_TELEGRAM_CHAT_ID: &str = "TELEGRAM_CHAT_ID";

/// Filter section of slot-sentinel.json, in the operator-facing key names.
#[derive(Deserialize, Clone, Debug)]
pub struct FilterFileConfig {
    pub earliest_date: NaiveDate,
    #[serde(default)]
    pub latest_date: Option<NaiveDate>,
    #[serde(default)]
    pub excluded_dates: Vec<NaiveDate>,
    #[serde(default)]
    pub allowed_facilities: Option<Vec<String>>,
}

impl FilterFileConfig {
    pub fn into_criteria(self) -> FilterCriteria {
        FilterCriteria {
            earliest: self.earliest_date,
            latest: self.latest_date,
            excluded: self.excluded_dates.into_iter().collect(),
            facilities: self
                .allowed_facilities
                .map(|v| v.into_iter().collect()),
        }
    }
}

/// Captcha-solver sub-config (mirrors the `solver` key in slot-sentinel.json).
#[derive(Deserialize, Default, Clone, Debug)]
pub struct SolverConfig {
    /// Vision endpoint — e.g. `https://api.openai.com/v1` or an
    /// OpenAI-compatible local endpoint.
    pub llm_base_url: Option<String>,
    /// API key. Never logged. Leave blank for key-less local endpoints.
    pub llm_api_key: Option<String>,
    /// Model name — must support image inputs.
    pub llm_model: Option<String>,
}

impl SolverConfig {
    /// API key: JSON field → `OPENAI_API_KEY` env var → `None`.
    ///
    /// An explicit empty string in the config file means "no key required"
    /// (local endpoint); `None` means the solver cannot authenticate at all.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(k) = &self.llm_api_key {
            return Some(k.trim().to_string());
        }
        std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|v| !v.trim().is_empty())
    }

    /// Base URL: JSON field → `OPENAI_BASE_URL` env var → api.openai.com.
    pub fn resolve_base_url(&self) -> String {
        if let Some(u) = &self.llm_base_url {
            if !u.trim().is_empty() {
                return u.clone();
            }
        }
        std::env::var("OPENAI_BASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
    }

    /// Model name: JSON field → `CAPTCHA_LLM_MODEL` env var → `gpt-4o-mini`.
    pub fn resolve_model(&self) -> String {
        if let Some(m) = &self.llm_model {
            if !m.trim().is_empty() {
                return m.clone();
            }
        }
        std::env::var("CAPTCHA_LLM_MODEL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "gpt-4o-mini".to_string())
    }
}

/// Tuning knobs (mirrors the `tuning` key). Every field has a safe default so
/// the section can be omitted entirely.
#[derive(Deserialize, Default, Clone, Debug)]
pub struct TuningConfig {
    /// Base seconds between authenticated polls. Default 300.
    pub base_poll_secs: Option<u64>,
    /// Backoff ceiling in seconds. Default 3600.
    pub max_poll_secs: Option<u64>,
    /// Captcha attempts per login before giving up. Default 5.
    pub captcha_max_attempts: Option<u32>,
    /// Longest single waiting-room sleep in seconds. Default 60.
    pub waiting_room_max_secs: Option<u64>,
    /// Consecutive session expiries before escalating to fatal. Default 3.
    pub expiry_escalation: Option<u32>,
    /// Appointment/calendar entry URL.
    pub appointment_url: Option<String>,
    /// Run the browser headless. Default true.
    pub headless: Option<bool>,
}

impl TuningConfig {
    pub fn resolve_base_poll(&self) -> Duration {
        Duration::from_secs(self.base_poll_secs.unwrap_or(300))
    }

    pub fn resolve_max_poll(&self) -> Duration {
        Duration::from_secs(self.max_poll_secs.unwrap_or(3600))
    }

    pub fn resolve_captcha_max_attempts(&self) -> u32 {
        self.captcha_max_attempts.unwrap_or(5).max(1)
    }

    pub fn resolve_waiting_room_max(&self) -> Duration {
        Duration::from_secs(self.waiting_room_max_secs.unwrap_or(60).max(1))
    }

    pub fn resolve_expiry_escalation(&self) -> u32 {
        self.expiry_escalation.unwrap_or(3).max(1)
    }

    pub fn resolve_appointment_url(&self) -> String {
        self.appointment_url.clone().unwrap_or_else(|| {
            "https://www.usvisascheduling.com/schedule/?reschedule=true".to_string()
        })
    }

    pub fn resolve_headless(&self) -> bool {
        self.headless.unwrap_or(true)
    }
}

/// Top-level config loaded from `slot-sentinel.json`.
#[derive(Deserialize, Clone, Debug)]
pub struct SentinelConfig {
    pub filter: FilterFileConfig,
    #[serde(default)]
    pub solver: SolverConfig,
    #[serde(default)]
    pub tuning: TuningConfig,
}

/// Load `slot-sentinel.json` from standard locations.
///
/// Search order (first found wins):
/// 1. `SLOT_SENTINEL_CONFIG` env var path
/// 2. `./slot-sentinel.json`  (process cwd)
/// 3. `../slot-sentinel.json` (one level up)
///
/// Unlike tuning knobs, the filter section is mandatory — without an
/// earliest-acceptable date there is nothing to watch for — so a missing or
/// unparseable file is an error here, not a silent default.
pub fn load_config() -> Result<SentinelConfig> {
    let mut candidates = vec![
        PathBuf::from("slot-sentinel.json"),
        PathBuf::from("../slot-sentinel.json"),
    ];
    if let Ok(env_path) = std::env::var(ENV_CONFIG_PATH) {
        candidates.insert(0, PathBuf::from(env_path));
    }

    for path in &candidates {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let cfg: SentinelConfig = serde_json::from_str(&contents)
                    .with_context(|| format!("parse error in {}", path.display()))?;
                tracing::info!("slot-sentinel.json loaded from {}", path.display());
                return Ok(cfg);
            }
            Err(_) => continue, // not at this path — try next
        }
    }

    Err(anyhow!(
        "no slot-sentinel.json found (searched {:?}); set {} or create the file",
        candidates,
        ENV_CONFIG_PATH
    ))
}

// ---------------------------------------------------------------------------
// credential.json
// ---------------------------------------------------------------------------

/// On-disk credential file: the portal identity plus the Telegram endpoint
/// identifiers the notifier needs.
#[derive(Deserialize, Clone)]
pub struct CredentialFile {
    #[serde(flatten)]
    pub credential: Credential,
    #[serde(default)]
    pub telegram_bot_token: Option<String>,
    #[serde(default)]
    pub telegram_chat_id: Option<String>,
}

impl CredentialFile {
    /// Bot token: JSON field → `TELEGRAM_BOT_TOKEN` env var → `None`.
    pub fn resolve_bot_token(&self) -> Option<String> {
        self.telegram_bot_token
            .clone()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| {
                std::env::var(ENV_TELEGRAM_BOT_TOKEN)
                    .ok()
                    .filter(|v| !v.trim().is_empty())
            })
    }

    /// Chat id: JSON field → `TELEGRAM_CHAT_ID` env var → `None`.
    pub fn resolve_chat_id(&self) -> Option<String> {
        self.telegram_chat_id
            .clone()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| {
                std::env::var(ENV_TELEGRAM_CHAT_ID)
                    .ok()
                    .filter(|v| !v.trim().is_empty())
            })
    }
}

/// Load `credential.json` (path from `SLOT_SENTINEL_CREDENTIALS` env var,
/// falling back to the cwd). Credentials are mandatory; errors here are
/// startup failures, never silently defaulted.
pub fn load_credentials() -> Result<CredentialFile> {
    let path = std::env::var(ENV_CREDENTIAL_PATH)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("credential.json"));
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("could not read credentials at {}", path.display()))?;
    let file: CredentialFile = serde_json::from_str(&contents)
        .with_context(|| format!("parse error in {}", path.display()))?;
    if file.credential.username.trim().is_empty() || file.credential.password.trim().is_empty() {
        return Err(anyhow!("credential.json must set username and password"));
    }
    Ok(file)
}

/// Browser profile directory persisted across runs so the server-side session
/// cookie survives restarts: `SLOT_SENTINEL_PROFILE_DIR` env var →
/// `~/.slot-sentinel/profile`.
pub fn profile_dir() -> PathBuf {
    if let Ok(p) = std::env::var(ENV_PROFILE_DIR) {
        let p = p.trim();
        if !p.is_empty() {
            return PathBuf::from(p);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".slot-sentinel")
        .join("profile")
}
