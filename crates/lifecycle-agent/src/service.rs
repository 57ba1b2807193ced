//! The lifecycle service: owns the registry, the engines and their
//! configuration handles, and runs the periodic jobs.
//!
//! Collaborators are injected through [`ServiceDeps`] so tests can run the
//! same jobs against in-memory series and ledgers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use confidence_calibrator::{CalibratedForecast, DecayCalibrator, DecayConfig};
use drift_intelligence::{DriftConfig, DriftEngine, DriftGovernance, DriftPayload, DriftSnapshotStore};
use model_lifecycle::{
    Decision, EvaluationLog, EventLog, LifecycleConfig, ModelRegistry, PromotionEngine,
    PromotionReport, RollbackEngine, RollbackReport, SqlEventStore,
};
use pattern_core::{
    ConfigHandle, CoreError, GovernanceGate, HorizonKey, InMemoryPredictionLedger,
    PredictionSource, ReliabilitySource, SeriesStore,
};
use similarity_scanner::{ScanConfig, SimilarityScanner};

use crate::calls::CallTracker;
use crate::config::{AgentConfig, EngineSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    Scan,
    Promotion,
    Rollback,
    Drift,
}

impl Job {
    pub const ALL: [Job; 4] = [Job::Scan, Job::Promotion, Job::Rollback, Job::Drift];
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Job::Scan => "scan",
            Job::Promotion => "promotion",
            Job::Rollback => "rollback",
            Job::Drift => "drift",
        };
        f.write_str(name)
    }
}

pub struct ServiceDeps {
    pub series: Arc<dyn SeriesStore>,
    pub ledger: Arc<InMemoryPredictionLedger>,
    pub reliability: Arc<dyn ReliabilitySource>,
    /// Enables event and drift snapshot persistence.
    pub pool: Option<sqlx::AnyPool>,
}

#[derive(Debug, Clone)]
pub struct ScanCycleReport {
    pub forecasts: Vec<(HorizonKey, CalibratedForecast)>,
    pub truncated: bool,
    pub calls_opened: usize,
    pub calls_resolved: usize,
}

pub struct LifecycleService {
    config: AgentConfig,
    series: Arc<dyn SeriesStore>,
    ledger: Arc<InMemoryPredictionLedger>,
    reliability: Arc<dyn ReliabilitySource>,
    calls: CallTracker,

    scan_config: ConfigHandle<ScanConfig>,
    decay_config: ConfigHandle<DecayConfig>,
    lifecycle_config: ConfigHandle<LifecycleConfig>,
    drift_config: ConfigHandle<DriftConfig>,

    registry: Arc<ModelRegistry>,
    evaluations: Arc<EvaluationLog>,
    /// Sequence number of the last evaluation window written to SQL.
    windows_persisted: AtomicU64,
    governance: Arc<DriftGovernance>,
    promotion: PromotionEngine,
    rollback: RollbackEngine,
    drift: DriftEngine,

    event_store: Option<Arc<SqlEventStore>>,
    snapshot_store: Option<DriftSnapshotStore>,

    shutdown: watch::Sender<bool>,
    jobs: Mutex<Vec<JoinHandle<()>>>,
    persister: Mutex<Option<JoinHandle<()>>>,
}

impl LifecycleService {
    /// Fails when any section of `settings` is invalid.
    pub fn new(config: AgentConfig, settings: EngineSettings, deps: ServiceDeps) -> Result<Self> {
        let scan_config = ConfigHandle::new(settings.scan)?;
        let decay_config = ConfigHandle::new(settings.decay)?;
        let lifecycle_config = ConfigHandle::new(settings.lifecycle)?;
        let drift_config = ConfigHandle::new(settings.drift)?;

        let registry = Arc::new(ModelRegistry::new(Arc::new(EventLog::default())));
        let evaluations = Arc::new(EvaluationLog::new());
        let governance = Arc::new(DriftGovernance::new(drift_config.clone()));
        let predictions: Arc<dyn PredictionSource> = deps.ledger.clone();
        let gate: Arc<dyn GovernanceGate> = governance.clone();

        let promotion = PromotionEngine::new(
            Arc::clone(&registry),
            Arc::clone(&predictions),
            Arc::clone(&gate),
            lifecycle_config.clone(),
            Arc::clone(&evaluations),
        );
        let rollback = RollbackEngine::new(
            Arc::clone(&registry),
            Arc::clone(&predictions),
            gate,
            lifecycle_config.clone(),
        );
        let drift = DriftEngine::new(predictions, drift_config.clone());

        let event_store = deps.pool.clone().map(|pool| Arc::new(SqlEventStore::new(pool)));
        let snapshot_store = deps.pool.map(DriftSnapshotStore::new);
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            series: deps.series,
            ledger: deps.ledger,
            reliability: deps.reliability,
            calls: CallTracker::new(),
            scan_config,
            decay_config,
            lifecycle_config,
            drift_config,
            registry,
            evaluations,
            windows_persisted: AtomicU64::new(0),
            governance,
            promotion,
            rollback,
            drift,
            event_store,
            snapshot_store,
            shutdown,
            jobs: Mutex::new(Vec::new()),
            persister: Mutex::new(None),
        })
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn governance(&self) -> &Arc<DriftGovernance> {
        &self.governance
    }

    pub fn calls(&self) -> &CallTracker {
        &self.calls
    }

    /// Prepare storage, register every configured horizon and spawn the
    /// periodic jobs.
    pub async fn start(self: &Arc<Self>, now: DateTime<Utc>) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        if !jobs.is_empty() {
            anyhow::bail!("lifecycle service already started");
        }
        self.shutdown.send_replace(false);
        self.prepare(now).await?;

        for job in Job::ALL {
            jobs.push(self.spawn_job(job));
        }
        tracing::info!(
            "Lifecycle service started for {} ({} horizons, every {}s)",
            self.config.symbol,
            self.config.horizons.len(),
            self.config.eval_interval_seconds
        );
        Ok(())
    }

    async fn prepare(&self, now: DateTime<Utc>) -> Result<()> {
        if let Some(store) = &self.event_store {
            store.init_schema().await?;
            let mut persister = self.persister.lock().await;
            if persister.is_none() {
                let rx = self.registry.events().subscribe();
                *persister = Some(Arc::clone(store).spawn_persister(rx));
            }
        }
        if let Some(store) = &self.snapshot_store {
            store.init_schema().await?;
        }
        self.register_horizons(now)
    }

    /// Stop the jobs, then flush any lifecycle event the persister has
    /// not written yet.
    pub async fn stop(&self) -> Result<()> {
        self.shutdown.send_replace(true);
        let handles: Vec<JoinHandle<()>> = self.jobs.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("Job ended abnormally: {}", e);
            }
        }

        // Appends are idempotent; this only fills what the persister missed.
        if let Some(store) = &self.event_store {
            let mut flushed = 0;
            for event in self.registry.events().events() {
                if store.append_event(&event).await? {
                    flushed += 1;
                }
            }
            if flushed > 0 {
                tracing::info!("Flushed {} unpersisted lifecycle events", flushed);
            }
        }
        self.persist_windows().await?;
        tracing::info!("Lifecycle service stopped");
        Ok(())
    }

    /// Swap in a new threshold document. The whole document is validated
    /// first, so a bad one changes nothing.
    pub fn reload(&self, settings: EngineSettings) -> Result<()> {
        settings.validate()?;
        self.scan_config.reload(settings.scan)?;
        self.decay_config.reload(settings.decay)?;
        self.lifecycle_config.reload(settings.lifecycle)?;
        self.drift_config.reload(settings.drift)?;
        Ok(())
    }

    /// Bootstrap missing horizons and attach the configured shadow.
    fn register_horizons(&self, now: DateTime<Utc>) -> Result<()> {
        for key in self.config.keys() {
            let row = match self.registry.snapshot(&key) {
                Ok(row) => row,
                Err(CoreError::UnknownHorizon(_)) => {
                    self.registry.bootstrap(&key, &self.config.active_model_id, now)?;
                    self.registry.snapshot(&key)?
                }
                Err(e) => return Err(e.into()),
            };

            let Some(shadow_id) = &self.config.shadow_model_id else {
                continue;
            };
            if row.shadow.is_some() {
                continue;
            }
            match self.registry.create_shadow(&key, shadow_id, row.revision, now) {
                Ok(_) => {}
                Err(e @ CoreError::ForbiddenTransition { .. }) => {
                    tracing::warn!("Not attaching shadow {} to {}: {}", shadow_id, key, e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn spawn_job(self: &Arc<Self>, job: Job) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let period = self.config.eval_interval();

        tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = service.run_job(job, Utc::now()).await {
                            tracing::error!("Error in {} job: {:#}", job, e);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!("{} job stopped", job);
        })
    }

    pub async fn run_job(&self, job: Job, now: DateTime<Utc>) -> Result<()> {
        match job {
            Job::Scan => self.run_scan_cycle().await.map(|_| ()),
            Job::Promotion => self.run_promotion_cycle(now).await.map(|_| ()),
            Job::Rollback => self.run_rollback_cycle(now).await.map(|_| ()),
            Job::Drift => self.run_drift_cycle(now).await.map(|_| ()),
        }
    }

    /// Scan the latest window, calibrate per horizon, open a call for each
    /// active variant and resolve calls whose horizon has elapsed.
    pub async fn run_scan_cycle(&self) -> Result<ScanCycleReport> {
        let series = self
            .series
            .get_all(&self.config.symbol, &self.config.series_timeframe)
            .await?;
        let scanner = SimilarityScanner::new(self.scan_config.snapshot().as_ref().clone())?;
        let result = scanner.scan(&series, &self.config.scan_request())?;
        let calibrator = DecayCalibrator::new(self.decay_config.snapshot().as_ref().clone())?;

        let mut forecasts = Vec::new();
        let mut calls_opened = 0;
        for key in self.config.keys() {
            let reliability = self.reliability.reliability(&key.to_string()).await;
            let (_, forecast) =
                calibrator.calibrate(&result.matches, reliability, self.config.base_confidence);
            let row = self.registry.snapshot(&key)?;
            if self.calls.open(&key, &row.active.model_id, &series, &forecast)? {
                calls_opened += 1;
            }
            tracing::info!(
                "{}: {} matches, n_eff={:.1}, mean={:+.2}% (p10 {:+.2} / p90 {:+.2}), confidence={:.2}",
                key,
                forecast.match_count,
                forecast.effective_n,
                forecast.weighted_mean,
                forecast.p10,
                forecast.p90,
                forecast.confidence_final
            );
            forecasts.push((key, forecast));
        }

        let calls_resolved = self.calls.resolve(&series, &self.ledger)?;
        Ok(ScanCycleReport {
            forecasts,
            truncated: result.current_window_stats.truncated,
            calls_opened,
            calls_resolved,
        })
    }

    pub async fn run_promotion_cycle(&self, now: DateTime<Utc>) -> Result<Vec<PromotionReport>> {
        let mut reports = Vec::new();
        for key in self.registry.keys() {
            let report = match self.promotion.evaluate_and_promote(&key, now).await {
                Ok(report) => report,
                Err(e) => {
                    tracing::warn!("Promotion evaluation failed for {}: {}", key, e);
                    continue;
                }
            };
            log_outcome("Promotion", &key, &report.outcome);
            reports.push(report);
        }
        if let Err(e) = self.persist_windows().await {
            tracing::warn!("Failed to persist evaluation windows: {:#}", e);
        }
        Ok(reports)
    }

    pub async fn run_rollback_cycle(&self, now: DateTime<Utc>) -> Result<Vec<RollbackReport>> {
        let mut reports = Vec::new();
        for key in self.registry.keys() {
            let report = match self.rollback.evaluate_and_rollback(&key, now).await {
                Ok(report) => report,
                Err(e) => {
                    tracing::warn!("Rollback evaluation failed for {}: {}", key, e);
                    continue;
                }
            };
            log_outcome("Rollback", &key, &report.outcome);
            reports.push(report);
        }
        Ok(reports)
    }

    /// Recompute drift, publish it to governance and save the day's
    /// snapshot.
    pub async fn run_drift_cycle(&self, now: DateTime<Utc>) -> Result<DriftPayload> {
        let payload = self
            .drift
            .compute_drift_intelligence(&self.config.symbol, self.config.drift_window_days, now)
            .await?;
        self.governance.update(payload.clone());
        if let Some(store) = &self.snapshot_store {
            store
                .save(&payload)
                .await
                .context("failed to save drift snapshot")?;
        }
        Ok(payload)
    }

    /// Write the evaluation windows recorded since the last call. Returns
    /// how many were sent.
    async fn persist_windows(&self) -> Result<usize> {
        let Some(store) = &self.event_store else {
            return Ok(0);
        };
        let after = self.windows_persisted.load(Ordering::Acquire);
        let pending = self.evaluations.recorded_after(after)?;
        let mut sent = 0;
        for (seq, window) in pending {
            store.record_window(&window).await?;
            self.windows_persisted.store(seq, Ordering::Release);
            sent += 1;
        }
        if sent > 0 {
            tracing::debug!("Persisted {} evaluation window(s)", sent);
        }
        Ok(sent)
    }
}

fn log_outcome(kind: &str, key: &HorizonKey, outcome: &Decision) {
    match outcome {
        Decision::Executed { event } => tracing::info!(
            "{} executed on {}: {:?} -> {:?} ({})",
            kind,
            key,
            event.from_model_id,
            event.to_model_id,
            event.reason
        ),
        Decision::Held { reasons } => {
            tracing::debug!("{} held on {}: {}", kind, key, reasons.join("; "))
        }
        Decision::GovernanceLocked { reason } => {
            tracing::warn!("{} on {} suppressed by governance: {}", kind, key, reason)
        }
        Decision::NoOp { reason } => tracing::info!("{} on {} had no effect: {}", kind, key, reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use model_lifecycle::{HorizonThresholds, LifecycleEventType, SustainedLiftConfig};
    use pattern_core::{
        Candle, Horizon, InMemorySeriesStore, LifecycleAction, PredictionRecord, Series,
        StaticReliability,
    };

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn agent_config() -> AgentConfig {
        AgentConfig {
            series_path: "unused.json".into(),
            series_timeframe: "1d".to_string(),
            predictions_path: None,
            symbol: "SPY".to_string(),
            horizons: vec![Horizon::days(7)],
            active_model_id: "analog-v1".to_string(),
            shadow_model_id: Some("analog-v2".to_string()),
            scan_window_len: 20,
            scan_top_k: 10,
            scan_forward_horizon: 5,
            scan_budget_ms: None,
            base_confidence: 1.0,
            default_reliability: 0.7,
            eval_interval_seconds: 3600,
            drift_window_days: 14,
            lifecycle_config_path: None,
            database_url: None,
        }
    }

    /// Gates loose enough that ten good shadow calls qualify.
    fn lenient_settings() -> EngineSettings {
        let mut settings = EngineSettings::default();
        settings.lifecycle.defaults = HorizonThresholds {
            min_samples: 5,
            min_win_rate_lift: 0.0,
            min_sharpe_lift: 0.0,
            max_dd_for_promo: 100.0,
            min_stability: 0.0,
            cooldown_days: 0,
            window_days: 30,
        };
        settings.lifecycle.sustained = SustainedLiftConfig {
            windows: 1,
            window_days: 30,
            min_predictions: 1,
            min_win_rate_lift: 0.0,
            min_sharpe_lift: 0.0,
        };
        settings
    }

    fn wave_series(n: usize) -> Series {
        let base = now() - Duration::days(n as i64);
        Series::new(
            (0..n)
                .map(|i| {
                    let x = i as f64;
                    Candle::point(
                        base + Duration::days(i as i64),
                        100.0 + 10.0 * (x / 9.0).sin() + 0.05 * x,
                    )
                })
                .collect(),
        )
        .unwrap()
    }

    async fn memory_pool() -> sqlx::AnyPool {
        sqlx::any::install_default_drivers();
        sqlx::any::AnyPoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory SQLite")
    }

    fn build(
        settings: EngineSettings,
        ledger: Arc<InMemoryPredictionLedger>,
        pool: Option<sqlx::AnyPool>,
    ) -> Arc<LifecycleService> {
        let store = Arc::new(InMemorySeriesStore::new());
        store.insert("SPY", "1d", wave_series(300)).unwrap();
        let deps = ServiceDeps {
            series: store,
            ledger,
            reliability: Arc::new(StaticReliability(0.7)),
            pool,
        };
        Arc::new(LifecycleService::new(agent_config(), settings, deps).unwrap())
    }

    fn record(id: usize, model: &str, days_ago: f64, hit: bool) -> PredictionRecord {
        let resolved_at = now() - Duration::minutes((days_ago * 1440.0) as i64);
        PredictionRecord {
            id: format!("{}-{}", model, id),
            key: HorizonKey::new("SPY", Horizon::days(7)),
            model_id: model.to_string(),
            made_at: resolved_at - Duration::days(7),
            resolved_at,
            confidence: 0.6,
            realized_return: if hit { 1.5 } else { -0.5 },
            hit,
        }
    }

    /// Shadow hits 8/10, active 3/10, all within the last ten days.
    fn seed_shadow_lift(ledger: &InMemoryPredictionLedger) {
        for i in 0..10 {
            ledger.record(record(i, "analog-v2", 1.0 + i as f64, i % 5 != 0)).unwrap();
            ledger.record(record(i, "analog-v1", 1.5 + i as f64, i % 3 == 0)).unwrap();
        }
    }

    #[tokio::test]
    async fn test_start_registers_horizons_and_stop_joins_jobs() {
        let service = build(lenient_settings(), Arc::new(InMemoryPredictionLedger::new()), None);
        service.start(now()).await.unwrap();
        assert!(service.start(now()).await.is_err());

        let key = HorizonKey::new("SPY", Horizon::days(7));
        let row = service.registry().snapshot(&key).unwrap();
        assert_eq!(row.active.model_id, "analog-v1");
        assert_eq!(row.shadow.as_ref().unwrap().model_id, "analog-v2");

        service.stop().await.unwrap();
        let kinds: Vec<LifecycleEventType> = service
            .registry()
            .events()
            .events()
            .iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(
            kinds,
            vec![LifecycleEventType::Bootstrapped, LifecycleEventType::ShadowCreated]
        );
    }

    #[tokio::test]
    async fn test_scan_cycle_opens_one_call_per_candle() {
        let service = build(lenient_settings(), Arc::new(InMemoryPredictionLedger::new()), None);
        service.register_horizons(now()).unwrap();

        let report = service.run_scan_cycle().await.unwrap();
        assert_eq!(report.forecasts.len(), 1);
        let forecast = &report.forecasts[0].1;
        assert!(forecast.match_count > 0);
        assert!(forecast.confidence_final > 0.0 && forecast.confidence_final <= 1.0);
        assert!(!report.truncated);

        let again = service.run_scan_cycle().await.unwrap();
        assert_eq!(again.calls_opened, 0);
        assert_eq!(service.calls().pending().unwrap(), report.calls_opened);
    }

    #[tokio::test]
    async fn test_promotion_cycle_promotes_and_persists() {
        let ledger = Arc::new(InMemoryPredictionLedger::new());
        seed_shadow_lift(&ledger);
        let pool = memory_pool().await;
        let service = build(lenient_settings(), ledger, Some(pool.clone()));
        service.prepare(now() - Duration::days(30)).await.unwrap();

        let reports = service.run_promotion_cycle(now()).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].outcome.executed(), "{:?}", reports[0].decision.reasons);

        let key = HorizonKey::new("SPY", Horizon::days(7));
        let row = service.registry().snapshot(&key).unwrap();
        assert_eq!(row.active.model_id, "analog-v2");
        assert!(row.shadow.is_none());

        service.stop().await.unwrap();
        let store = SqlEventStore::new(pool);
        let persisted = store.events_for(&key).await.unwrap();
        assert_eq!(persisted.len(), 3);
        assert_eq!(persisted[2].event_type, LifecycleEventType::Promoted);
        let windows = store.windows_for(&key).await.unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].active_model_id, "analog-v1");
        assert_eq!(windows[0].shadow_model_id, "analog-v2");
        assert!(windows[0].lift.win_rate > 0.0);
        // nothing new was recorded since
        assert_eq!(service.persist_windows().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_drift_lock_suppresses_promotion() {
        let ledger = Arc::new(InMemoryPredictionLedger::new());
        seed_shadow_lift(&ledger);
        // Baseline A: 40 calls, 36 hits, 40..80 days ago.
        for i in 0..40 {
            ledger
                .record(record(100 + i, "analog-v0", 40.0 + i as f64, i % 10 != 0))
                .unwrap();
        }
        let pool = memory_pool().await;
        let service = build(lenient_settings(), ledger, Some(pool.clone()));
        service.prepare(now() - Duration::days(30)).await.unwrap();

        let payload = service.run_drift_cycle(now()).await.unwrap();
        assert!(payload.blocks(LifecycleAction::Promote));
        let key = HorizonKey::new("SPY", Horizon::days(7));
        assert!(service
            .governance()
            .blocked_reason(&key, LifecycleAction::Promote)
            .await
            .is_some());

        let reports = service.run_promotion_cycle(now()).await.unwrap();
        assert!(matches!(reports[0].outcome, Decision::GovernanceLocked { .. }));
        assert_eq!(
            service.registry().snapshot(&key).unwrap().active.model_id,
            "analog-v1"
        );

        service.stop().await.unwrap();
        let saved = DriftSnapshotStore::new(pool)
            .load("SPY", now().date_naive())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(saved.severity, payload.severity);
    }

    #[tokio::test]
    async fn test_bad_reload_keeps_previous_thresholds() {
        let service = build(lenient_settings(), Arc::new(InMemoryPredictionLedger::new()), None);
        let mut bad = lenient_settings();
        bad.lifecycle.rollback.win_rate_floor = 2.0;
        assert!(service.reload(bad).is_err());
        assert_eq!(service.lifecycle_config.snapshot().defaults.min_samples, 5);

        let mut good = lenient_settings();
        good.lifecycle.defaults.min_samples = 25;
        service.reload(good).unwrap();
        assert_eq!(service.lifecycle_config.snapshot().defaults.min_samples, 25);
    }
}
