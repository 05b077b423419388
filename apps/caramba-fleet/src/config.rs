use anyhow::{Context, Result};
use caramba_db::models::groups::SelectionPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::time::Duration;

use crate::error::FleetError;
use crate::health::Thresholds;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub database_url: String,
    pub listen_addr: String,

    pub probe_interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub panel_timeout_secs: u64,
    pub store_timeout_secs: u64,
    pub worker_pool_size: usize,

    pub warning_pct: f64,
    pub critical_pct: f64,
    pub latency_ceiling_ms: u32,

    /// Consecutive critical/offline cycles before failover trips.
    pub trip_cycles: u32,
    /// Consecutive failed probes before a node is declared offline.
    pub offline_cycles: u32,
    /// Consecutive healthy cycles before offline/overloaded recovers.
    pub recovery_cycles: u32,
    pub uptime_window: usize,

    pub retention_days: i64,
    pub cleanup_interval_secs: u64,
    pub reconcile_interval_secs: u64,
    pub watchdog_interval_secs: u64,
    pub migration_timeout_secs: u64,

    /// Group name -> policy, overriding the stored policy.
    pub group_policies: HashMap<String, SelectionPolicy>,
    pub rng_seed: Option<u64>,

    pub telegram_bot_token: Option<String>,
    pub alert_chat_ids: Vec<i64>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            listen_addr: "127.0.0.1:8095".to_string(),
            probe_interval_secs: 300,
            probe_timeout_secs: 10,
            panel_timeout_secs: 15,
            store_timeout_secs: 15,
            worker_pool_size: 20,
            warning_pct: 70.0,
            critical_pct: 90.0,
            latency_ceiling_ms: 1500,
            trip_cycles: 2,
            offline_cycles: 2,
            recovery_cycles: 2,
            uptime_window: 288,
            retention_days: 7,
            cleanup_interval_secs: 86_400,
            reconcile_interval_secs: 1_800,
            watchdog_interval_secs: 60,
            migration_timeout_secs: 600,
            group_policies: HashMap::new(),
            rng_seed: None,
            telegram_bot_token: None,
            alert_chat_ids: Vec::new(),
        }
    }
}

impl FleetConfig {
    pub fn load() -> Result<Self> {
        let mut config_paths = vec![
            "/etc/caramba/fleet.toml".to_string(),
            "./fleet.toml".to_string(),
        ];
        if let Ok(explicit) = std::env::var("FLEET_CONFIG") {
            config_paths.insert(0, explicit);
        }

        for path in &config_paths {
            if let Ok(contents) = fs::read_to_string(path) {
                tracing::info!("Loading fleet config from {}", path);
                let mut config = Self::from_toml(&contents)
                    .with_context(|| format!("Failed to parse {}", path))?;
                if config.database_url.is_empty() {
                    config.database_url = std::env::var("DATABASE_URL").unwrap_or_default();
                }
                config.validate()?;
                return Ok(config);
            }
        }

        tracing::info!("Loading fleet config from environment");
        let config = Self::from_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            listen_addr: env_or("FLEET_LISTEN_ADDR", defaults.listen_addr),
            probe_interval_secs: env_parse("PROBE_INTERVAL_SECS", defaults.probe_interval_secs)?,
            probe_timeout_secs: env_parse("PROBE_TIMEOUT_SECS", defaults.probe_timeout_secs)?,
            panel_timeout_secs: env_parse("PANEL_TIMEOUT_SECS", defaults.panel_timeout_secs)?,
            store_timeout_secs: env_parse("STORE_TIMEOUT_SECS", defaults.store_timeout_secs)?,
            worker_pool_size: env_parse("PROBE_WORKERS", defaults.worker_pool_size)?,
            warning_pct: env_parse("HEALTH_WARNING_PCT", defaults.warning_pct)?,
            critical_pct: env_parse("HEALTH_CRITICAL_PCT", defaults.critical_pct)?,
            latency_ceiling_ms: env_parse("LATENCY_CEILING_MS", defaults.latency_ceiling_ms)?,
            trip_cycles: env_parse("FAILOVER_TRIP_CYCLES", defaults.trip_cycles)?,
            offline_cycles: env_parse("OFFLINE_CYCLES", defaults.offline_cycles)?,
            recovery_cycles: env_parse("RECOVERY_CYCLES", defaults.recovery_cycles)?,
            uptime_window: env_parse("UPTIME_WINDOW", defaults.uptime_window)?,
            retention_days: env_parse("SAMPLE_RETENTION_DAYS", defaults.retention_days)?,
            cleanup_interval_secs: env_parse("CLEANUP_INTERVAL_SECS", defaults.cleanup_interval_secs)?,
            reconcile_interval_secs: env_parse("RECONCILE_INTERVAL_SECS", defaults.reconcile_interval_secs)?,
            watchdog_interval_secs: env_parse("WATCHDOG_INTERVAL_SECS", defaults.watchdog_interval_secs)?,
            migration_timeout_secs: env_parse("MIGRATION_TIMEOUT_SECS", defaults.migration_timeout_secs)?,
            group_policies: parse_group_policies(&std::env::var("GROUP_POLICIES").unwrap_or_default())?,
            rng_seed: std::env::var("FLEET_RNG_SEED").ok().and_then(|s| s.parse().ok()),
            telegram_bot_token: std::env::var("TELEGRAM_BOT_TOKEN").ok().filter(|t| !t.is_empty()),
            alert_chat_ids: std::env::var("ALERT_CHAT_IDS")
                .unwrap_or_default()
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect(),
        })
    }

    pub fn validate(&self) -> Result<(), FleetError> {
        let positive = [
            ("probe_interval_secs", self.probe_interval_secs),
            ("probe_timeout_secs", self.probe_timeout_secs),
            ("panel_timeout_secs", self.panel_timeout_secs),
            ("store_timeout_secs", self.store_timeout_secs),
            ("cleanup_interval_secs", self.cleanup_interval_secs),
            ("reconcile_interval_secs", self.reconcile_interval_secs),
            ("watchdog_interval_secs", self.watchdog_interval_secs),
            ("migration_timeout_secs", self.migration_timeout_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(FleetError::Config(format!("{} must be greater than zero", name)));
            }
        }
        if self.worker_pool_size == 0 {
            return Err(FleetError::Config("worker_pool_size must be at least 1".into()));
        }
        if self.uptime_window == 0 {
            return Err(FleetError::Config("uptime_window must be at least 1".into()));
        }
        if self.trip_cycles == 0 || self.offline_cycles == 0 || self.recovery_cycles == 0 {
            return Err(FleetError::Config("cycle counts must be at least 1".into()));
        }
        if !(0.0..=100.0).contains(&self.warning_pct)
            || !(0.0..=100.0).contains(&self.critical_pct)
            || self.warning_pct >= self.critical_pct
        {
            return Err(FleetError::Config(format!(
                "thresholds must satisfy 0 <= warning ({}) < critical ({}) <= 100",
                self.warning_pct, self.critical_pct
            )));
        }
        if self.retention_days <= 0 {
            return Err(FleetError::Config("retention_days must be positive".into()));
        }
        if self.probe_timeout_secs > self.probe_interval_secs {
            return Err(FleetError::Config(
                "probe_timeout_secs must not exceed probe_interval_secs".into(),
            ));
        }
        Ok(())
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            warning_pct: self.warning_pct,
            critical_pct: self.critical_pct,
            latency_ceiling_ms: self.latency_ceiling_ms,
        }
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn panel_timeout(&self) -> Duration {
        Duration::from_secs(self.panel_timeout_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }

    pub fn migration_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.migration_timeout_secs as i64)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days)
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or(default)
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {}={:?}: {}", key, raw, e)),
        _ => Ok(default),
    }
}

/// `eu=least-loaded,asia=best-latency`
fn parse_group_policies(raw: &str) -> Result<HashMap<String, SelectionPolicy>> {
    let mut out = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (name, policy) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("Invalid GROUP_POLICIES entry {:?}", pair))?;
        out.insert(name.trim().to_string(), policy.parse()?);
    }
    Ok(out)
}
