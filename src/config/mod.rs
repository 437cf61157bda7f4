// =============================================================================
// Configuration — per-market env files + server settings
// =============================================================================
//
// Two INI-style `key=value` files (`tx.env`, `btc.env`) hold API credentials,
// Telegram settings, and trading parameters. Comments begin with `#`. A blank
// required field forces `LOGIN=0` so the gateway never half-connects with
// incomplete credentials.
//
// `port.txt` at the repository root optionally overrides the webhook port.
// =============================================================================

pub mod calendar;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};

// =============================================================================
// EnvFile
// =============================================================================

/// A parsed `key=value` configuration file.
#[derive(Debug, Clone, Default)]
pub struct EnvFile {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl EnvFile {
    /// Load and parse `path`. Lines are `KEY=VALUE`; `#` starts a comment;
    /// blank lines are skipped. Values keep embedded `=` characters.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read env file {}", path.display()))?;

        let mut values = BTreeMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                values.insert(key.trim().to_string(), value.trim().to_string());
            }
        }

        info!(path = %path.display(), keys = values.len(), "env file loaded");
        Ok(Self {
            path: path.to_path_buf(),
            values,
        })
    }

    /// An empty file, used when the env file is absent (login stays off).
    pub fn empty(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            values: BTreeMap::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// A required field; blank or missing is `ConfigMissing`.
    pub fn require(&self, key: &str) -> CoreResult<String> {
        self.get(key)
            .map(str::to_string)
            .ok_or_else(|| CoreError::ConfigMissing(key.to_string()))
    }

    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    pub fn get_u32(&self, key: &str, default: u32) -> u32 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    /// `0`/`1` flags; anything else falls back to `default`.
    pub fn get_flag(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some("1") => true,
            Some("0") => false,
            _ => default,
        }
    }

    /// Names of required keys that are blank or missing.
    pub fn blank_required(&self, required: &[&str]) -> Vec<String> {
        required
            .iter()
            .filter(|k| self.get(k).is_none())
            .map(|k| k.to_string())
            .collect()
    }
}

// =============================================================================
// Telegram settings (shared shape between the two markets)
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct TelegramSettings {
    pub bot_token: String,
    /// Comma-separated in the env file; parsed into individual chat ids.
    pub chat_ids: Vec<String>,
}

impl TelegramSettings {
    fn from_env(env: &EnvFile) -> Self {
        let bot_token = env.get_or("TELEGRAM_BOT_TOKEN", "").to_string();
        let chat_ids = env
            .get_or("TELEGRAM_CHAT_ID", "")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        Self { bot_token, chat_ids }
    }

    pub fn is_configured(&self) -> bool {
        !self.bot_token.is_empty() && !self.chat_ids.is_empty()
    }
}

// =============================================================================
// TX settings
// =============================================================================

/// Required credential fields for a TX login.
const TX_REQUIRED: &[&str] = &["API_KEY", "SECRET_KEY", "PERSON_ID", "CA_PASSWD"];

#[derive(Debug, Clone)]
pub struct TxSettings {
    pub api_key: String,
    pub secret_key: String,
    pub person_id: String,
    pub ca_path: String,
    pub ca_password: String,
    /// Base URL of the broker gateway.
    pub gateway_url: String,
    pub telegram: TelegramSettings,
    login_flag: bool,
    blank_fields: Vec<String>,
}

impl TxSettings {
    pub fn from_env(env: &EnvFile) -> Self {
        let blank_fields = env.blank_required(TX_REQUIRED);
        if !blank_fields.is_empty() {
            warn!(fields = ?blank_fields, "tx.env has blank required fields — login disabled");
        }

        Self {
            api_key: env.get_or("API_KEY", "").to_string(),
            secret_key: env.get_or("SECRET_KEY", "").to_string(),
            person_id: env.get_or("PERSON_ID", "").to_string(),
            ca_path: env.get_or("CA_PATH", "Sinopac.pfx").to_string(),
            ca_password: env.get_or("CA_PASSWD", "").to_string(),
            gateway_url: env
                .get_or("GATEWAY_URL", "https://tx-gateway.local")
                .trim_end_matches('/')
                .to_string(),
            telegram: TelegramSettings::from_env(env),
            login_flag: env.get_flag("LOGIN", false),
            blank_fields,
        }
    }

    /// `LOGIN=1` and no blank required fields.
    pub fn login_enabled(&self) -> bool {
        self.login_flag && self.blank_fields.is_empty()
    }

    pub fn blank_fields(&self) -> &[String] {
        &self.blank_fields
    }
}

// =============================================================================
// BTC settings
// =============================================================================

const BTC_REQUIRED: &[&str] = &["BINANCE_API_KEY", "BINANCE_SECRET_KEY"];

#[derive(Debug, Clone)]
pub struct BtcSettings {
    pub api_key: String,
    pub secret_key: String,
    /// Fixed perpetual symbol, e.g. "BTCUSDT".
    pub symbol: String,
    pub leverage: u32,
    /// Stored as a percentage in the env file (e.g. 80).
    risk_percent: f64,
    /// "CROSSED" or "ISOLATED".
    pub margin_type: String,
    /// "PERPETUAL" unless configured otherwise.
    pub contract_type: String,
    pub telegram: TelegramSettings,
    login_flag: bool,
    blank_fields: Vec<String>,
}

impl BtcSettings {
    pub fn from_env(env: &EnvFile) -> Self {
        let blank_fields = env.blank_required(BTC_REQUIRED);
        if !blank_fields.is_empty() {
            warn!(fields = ?blank_fields, "btc.env has blank required fields — login disabled");
        }

        Self {
            api_key: env.get_or("BINANCE_API_KEY", "").to_string(),
            secret_key: env.get_or("BINANCE_SECRET_KEY", "").to_string(),
            symbol: env.get_or("TRADING_PAIR", "BTCUSDT").to_uppercase(),
            leverage: env.get_u32("LEVERAGE", 20),
            risk_percent: env.get_f64("RISK_PERCENT", 80.0),
            margin_type: env.get_or("MARGIN_TYPE", "CROSSED").to_uppercase(),
            contract_type: env.get_or("CONTRACT_TYPE", "PERPETUAL").to_uppercase(),
            telegram: TelegramSettings::from_env(env),
            login_flag: env.get_flag("LOGIN", false),
            blank_fields,
        }
    }

    pub fn login_enabled(&self) -> bool {
        self.login_flag && self.blank_fields.is_empty()
    }

    pub fn blank_fields(&self) -> &[String] {
        &self.blank_fields
    }

    /// Risk percent as a fraction (80 → 0.8), clamped to (0, 1].
    pub fn risk_fraction(&self) -> f64 {
        (self.risk_percent / 100.0).clamp(0.001, 1.0)
    }
}

// =============================================================================
// Server settings (port.txt)
// =============================================================================

pub const DEFAULT_PORT: u16 = 5000;

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub port: u16,
    pub log_console: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            log_console: true,
        }
    }
}

impl ServerSettings {
    /// Parse `port.txt` (`port:NNNN` / `log_console:0|1`). A missing file or
    /// unparseable port falls back to defaults; out-of-range ports are
    /// rejected (ephemeral and privileged ranges).
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let Ok(content) = std::fs::read_to_string(path) else {
            return Self::default();
        };

        let mut settings = Self::default();
        for line in content.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            match key.trim() {
                "port" => match value.trim().parse::<u32>() {
                    Ok(p) if (1024..=65535).contains(&p) => settings.port = p as u16,
                    Ok(p) => {
                        warn!(port = p, "port.txt port out of range 1024-65535 — using default")
                    }
                    Err(_) => warn!(raw = value.trim(), "unparseable port in port.txt"),
                },
                "log_console" => settings.log_console = value.trim() != "0",
                _ => {}
            }
        }

        info!(port = settings.port, log_console = settings.log_console, "server settings loaded");
        settings
    }
}
