use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use confidence_calibrator::DecayConfig;
use drift_intelligence::DriftConfig;
use model_lifecycle::LifecycleConfig;
use pattern_core::{Horizon, HorizonKey, Validate};
use similarity_scanner::{ScanConfig, ScanRequest};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    // Input data
    pub series_path: PathBuf,
    pub series_timeframe: String,
    pub predictions_path: Option<PathBuf>,
    pub symbol: String,
    pub horizons: Vec<Horizon>,

    // Model variants
    pub active_model_id: String,
    pub shadow_model_id: Option<String>,

    // Scanner parameters
    pub scan_window_len: usize,
    pub scan_top_k: usize,
    pub scan_forward_horizon: usize,
    pub scan_budget_ms: Option<u64>,

    // Calibration inputs
    pub base_confidence: f64,
    pub default_reliability: f64,

    // Scheduling
    pub eval_interval_seconds: u64,
    pub drift_window_days: i64,

    // Threshold document
    pub lifecycle_config_path: Option<PathBuf>,

    // Database (event stream and drift snapshots)
    pub database_url: Option<String>,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from any key/value source. `from_env` passes the process
    /// environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());

        let horizons = get("HORIZONS", "1d,7d,30d")
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.parse::<Horizon>())
            .collect::<Result<Vec<_>, _>>()
            .context("HORIZONS must be a comma-separated list like 1d,7d,30d")?;

        let config = Self {
            series_path: PathBuf::from(lookup("SERIES_PATH").context("SERIES_PATH not set")?),
            series_timeframe: get("SERIES_TIMEFRAME", "1d"),
            predictions_path: lookup("PREDICTIONS_PATH").map(PathBuf::from),
            symbol: get("SYMBOL", "SPY").trim().to_ascii_uppercase(),
            horizons,

            active_model_id: get("ACTIVE_MODEL_ID", "analog-v1"),
            shadow_model_id: lookup("SHADOW_MODEL_ID").filter(|s| !s.trim().is_empty()),

            scan_window_len: get("SCAN_WINDOW_LEN", "30")
                .parse::<usize>()
                .context("SCAN_WINDOW_LEN")?,
            scan_top_k: get("SCAN_TOP_K", "20").parse::<usize>().context("SCAN_TOP_K")?,
            scan_forward_horizon: get("SCAN_FORWARD_HORIZON", "7")
                .parse::<usize>()
                .context("SCAN_FORWARD_HORIZON")?,
            scan_budget_ms: lookup("SCAN_BUDGET_MS")
                .map(|v| v.parse::<u64>())
                .transpose()
                .context("SCAN_BUDGET_MS")?,

            base_confidence: get("BASE_CONFIDENCE", "1.0")
                .parse::<f64>()
                .context("BASE_CONFIDENCE")?,
            default_reliability: get("DEFAULT_RELIABILITY", "0.7")
                .parse::<f64>()
                .context("DEFAULT_RELIABILITY")?,

            eval_interval_seconds: get("EVAL_INTERVAL_SECONDS", "300")
                .parse::<u64>()
                .context("EVAL_INTERVAL_SECONDS")?,
            drift_window_days: get("DRIFT_WINDOW_DAYS", "14")
                .parse::<i64>()
                .context("DRIFT_WINDOW_DAYS")?,

            lifecycle_config_path: lookup("LIFECYCLE_CONFIG_PATH").map(PathBuf::from),

            database_url: lookup("DATABASE_URL").filter(|s| !s.trim().is_empty()),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.symbol.is_empty() {
            anyhow::bail!("SYMBOL must not be empty");
        }
        if self.horizons.is_empty() {
            anyhow::bail!("HORIZONS must name at least one horizon");
        }
        if self.scan_window_len == 0 || self.scan_top_k == 0 || self.scan_forward_horizon == 0 {
            anyhow::bail!("SCAN_WINDOW_LEN, SCAN_TOP_K and SCAN_FORWARD_HORIZON must be positive");
        }
        if !(0.0..=1.0).contains(&self.base_confidence) {
            anyhow::bail!("BASE_CONFIDENCE must be within [0, 1], got {}", self.base_confidence);
        }
        if !(0.0..=1.0).contains(&self.default_reliability) {
            anyhow::bail!(
                "DEFAULT_RELIABILITY must be within [0, 1], got {}",
                self.default_reliability
            );
        }
        if self.eval_interval_seconds == 0 {
            anyhow::bail!("EVAL_INTERVAL_SECONDS must be at least 1");
        }
        if self.drift_window_days < 1 {
            anyhow::bail!("DRIFT_WINDOW_DAYS must be at least 1");
        }
        if self.shadow_model_id.as_deref() == Some(self.active_model_id.as_str()) {
            anyhow::bail!("SHADOW_MODEL_ID must differ from ACTIVE_MODEL_ID");
        }
        Ok(())
    }

    pub fn keys(&self) -> Vec<HorizonKey> {
        self.horizons
            .iter()
            .map(|h| HorizonKey::new(self.symbol.clone(), *h))
            .collect()
    }

    pub fn scan_request(&self) -> ScanRequest {
        let request = ScanRequest::new(
            self.scan_window_len,
            self.scan_top_k,
            self.scan_forward_horizon,
        );
        match self.scan_budget_ms {
            Some(ms) => request.with_budget(Duration::from_millis(ms)),
            None => request,
        }
    }

    pub fn eval_interval(&self) -> Duration {
        Duration::from_secs(self.eval_interval_seconds)
    }
}

/// Threshold document loaded from `LIFECYCLE_CONFIG_PATH`. Every section
/// is optional and falls back to its defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub decay: DecayConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub drift: DriftConfig,
}

impl EngineSettings {
    pub fn from_json(raw: &str) -> Result<Self> {
        let settings: EngineSettings =
            serde_json::from_str(raw).context("invalid threshold document")?;
        settings.validate()?;
        Ok(settings)
    }

    /// Defaults when no path is configured.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            tracing::info!("No LIFECYCLE_CONFIG_PATH set, using default thresholds");
            let settings = EngineSettings::default();
            settings.validate()?;
            return Ok(settings);
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("in {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        self.scan.validate()?;
        self.decay.validate()?;
        self.lifecycle.validate()?;
        self.drift.validate()?;
        Ok(())
    }
}
