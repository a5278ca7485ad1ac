//! Battle core configuration
//!
//! Layering, lowest to highest: built-in defaults, optional TOML file,
//! `BATTLE_*` environment variables. Env values that fail to parse or fall
//! outside their valid range are ignored.

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};

use crate::{
    batch::BatchOptions,
    split::{validate_rake_rate, DEFAULT_RAKE_RATE},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// SQLite ledger file
    pub db_path: String,
    /// Platform share of each pot, in [0, 1)
    pub rake_rate: f64,

    pub scheduler_enabled: bool,
    pub scheduler_interval_secs: u64,

    pub payout_batch_size: usize,
    pub payout_concurrency: usize,
    /// Pause between payout chunks
    pub payout_batch_pause_ms: u64,
    /// Upper bound on a single payout attempt inside a batch
    pub payout_item_timeout_ms: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            db_path: "battlecore_ledger.db".to_string(),
            rake_rate: DEFAULT_RAKE_RATE,
            scheduler_enabled: true,
            scheduler_interval_secs: 60,
            payout_batch_size: 50,
            payout_concurrency: 5,
            payout_batch_pause_ms: 200,
            payout_item_timeout_ms: 10_000,
        }
    }
}

impl CoreConfig {
    /// Load from TOML file. Missing keys keep their defaults; a relative
    /// `db_path` is taken relative to the file's directory.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let mut config = Self::from_toml_str(&contents)
            .with_context(|| format!("parsing config {}", path.display()))?;
        if let Some(dir) = path.parent() {
            config.db_path = anchor(dir, &config.db_path);
        }
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults (or `BATTLE_CONFIG_PATH` when set) with env overrides applied
    pub fn from_env() -> anyhow::Result<Self> {
        let base = match std::env::var("BATTLE_CONFIG_PATH") {
            Ok(path) if !path.trim().is_empty() => Self::load(&path)?,
            _ => Self::default(),
        };
        let config = base.with_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `BATTLE_*` overrides from any key lookup
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("BATTLE_DB_PATH").filter(|v| !v.trim().is_empty()) {
            self.db_path = v;
        }
        self.rake_rate = lookup("BATTLE_RAKE_RATE")
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| validate_rake_rate(*v).is_ok())
            .unwrap_or(self.rake_rate);
        if let Some(v) = lookup("BATTLE_SCHEDULER_ENABLED") {
            self.scheduler_enabled = parse_flag(&v);
        }
        self.scheduler_interval_secs = lookup("BATTLE_SCHEDULER_INTERVAL_SECS")
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(self.scheduler_interval_secs);
        self.payout_batch_size = lookup("BATTLE_PAYOUT_BATCH_SIZE")
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(self.payout_batch_size);
        self.payout_concurrency = lookup("BATTLE_PAYOUT_CONCURRENCY")
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(self.payout_concurrency);
        self.payout_batch_pause_ms = lookup("BATTLE_PAYOUT_BATCH_PAUSE_MS")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(self.payout_batch_pause_ms);
        self.payout_item_timeout_ms = lookup("BATTLE_PAYOUT_ITEM_TIMEOUT_MS")
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(self.payout_item_timeout_ms);
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        validate_rake_rate(self.rake_rate).context("rake_rate")?;
        if self.db_path.trim().is_empty() {
            bail!("db_path must not be empty");
        }
        if self.scheduler_interval_secs == 0 {
            bail!("scheduler_interval_secs must be positive");
        }
        if self.payout_batch_size == 0 || self.payout_concurrency == 0 {
            bail!("payout batch size and concurrency must be positive");
        }
        if self.payout_item_timeout_ms == 0 {
            bail!("payout_item_timeout_ms must be positive");
        }
        Ok(())
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_interval_secs)
    }

    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.payout_batch_pause_ms)
    }

    pub fn item_timeout(&self) -> Duration {
        Duration::from_millis(self.payout_item_timeout_ms)
    }

    /// Dry-run options sized from this config
    pub fn batch_options(&self) -> BatchOptions {
        BatchOptions {
            apply: false,
            limit: 0,
            batch_size: self.payout_batch_size,
            concurrency: self.payout_concurrency,
        }
    }
}

fn anchor(dir: &Path, db_path: &str) -> String {
    let p = Path::new(db_path);
    if p.is_absolute() || dir.as_os_str().is_empty() {
        return db_path.to_string();
    }
    dir.join(p).to_string_lossy().to_string()
}

fn parse_flag(v: &str) -> bool {
    matches!(v.trim(), "1" | "true" | "TRUE" | "yes" | "on" | "ON")
}
