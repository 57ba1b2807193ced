//! SQL persistence for the lifecycle event stream and evaluation windows.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use pattern_core::{Horizon, HorizonKey, PerformanceMetrics};

use crate::evaluation::{EvaluationWindow, WindowLift};
use crate::events::{LifecycleEvent, LifecycleEventType};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS lifecycle_events (
        id TEXT PRIMARY KEY,
        event_type TEXT NOT NULL,
        symbol TEXT NOT NULL,
        horizon TEXT NOT NULL,
        from_model_id TEXT,
        to_model_id TEXT,
        reason TEXT NOT NULL,
        details TEXT NOT NULL,
        occurred_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_lifecycle_events_key
        ON lifecycle_events (symbol, horizon, occurred_at)",
    "CREATE TABLE IF NOT EXISTS evaluation_windows (
        symbol TEXT NOT NULL,
        horizon TEXT NOT NULL,
        end_date TEXT NOT NULL,
        window_index INTEGER NOT NULL,
        window_start TEXT NOT NULL,
        window_end TEXT NOT NULL,
        predictions INTEGER NOT NULL,
        active_model_id TEXT NOT NULL,
        shadow_model_id TEXT NOT NULL,
        active_metrics TEXT NOT NULL,
        shadow_metrics TEXT NOT NULL,
        win_rate_lift DOUBLE PRECISION NOT NULL,
        sharpe_lift DOUBLE PRECISION NOT NULL,
        PRIMARY KEY (symbol, horizon, end_date)
    )",
];

/// DB row with string timestamps (portable across `sqlx::Any` backends)
#[derive(Debug, FromRow)]
struct EventRow {
    id: String,
    event_type: String,
    symbol: String,
    horizon: String,
    from_model_id: Option<String>,
    to_model_id: Option<String>,
    reason: String,
    details: String,
    occurred_at: String,
}

impl EventRow {
    fn into_event(self) -> Result<LifecycleEvent> {
        let horizon: Horizon = self.horizon.parse()?;
        let event_type: LifecycleEventType = self.event_type.parse()?;
        let details: serde_json::Value = serde_json::from_str(&self.details)
            .with_context(|| format!("corrupt details json on event {}", self.id))?;
        Ok(LifecycleEvent {
            id: self.id.parse().context("event id is not a uuid")?,
            event_type,
            key: HorizonKey::new(self.symbol, horizon),
            from_model_id: self.from_model_id,
            to_model_id: self.to_model_id,
            reason: self.reason,
            details,
            timestamp: self
                .occurred_at
                .parse::<DateTime<Utc>>()
                .context("bad event timestamp")?,
        })
    }
}

#[derive(Debug, FromRow)]
struct WindowRow {
    symbol: String,
    horizon: String,
    window_index: i64,
    window_start: String,
    window_end: String,
    predictions: i64,
    active_model_id: String,
    shadow_model_id: String,
    active_metrics: String,
    shadow_metrics: String,
    win_rate_lift: f64,
    sharpe_lift: f64,
}

impl WindowRow {
    fn into_window(self) -> Result<EvaluationWindow> {
        let horizon: Horizon = self.horizon.parse()?;
        let active_metrics: PerformanceMetrics =
            serde_json::from_str(&self.active_metrics).context("bad active metrics json")?;
        let shadow_metrics: PerformanceMetrics =
            serde_json::from_str(&self.shadow_metrics).context("bad shadow metrics json")?;
        Ok(EvaluationWindow {
            key: HorizonKey::new(self.symbol, horizon),
            window_index: u32::try_from(self.window_index).context("bad window index")?,
            window_start: self.window_start.parse::<DateTime<Utc>>()?,
            window_end: self.window_end.parse::<DateTime<Utc>>()?,
            predictions: usize::try_from(self.predictions).context("bad prediction count")?,
            active_model_id: self.active_model_id,
            shadow_model_id: self.shadow_model_id,
            active_metrics,
            shadow_metrics,
            lift: WindowLift {
                win_rate: self.win_rate_lift,
                sharpe_like: self.sharpe_lift,
            },
        })
    }
}

pub struct SqlEventStore {
    pool: sqlx::AnyPool,
}

impl SqlEventStore {
    pub fn new(pool: sqlx::AnyPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("failed to create lifecycle tables")?;
        }
        Ok(())
    }

    /// Returns `false` if the event was already stored.
    pub async fn append_event(&self, event: &LifecycleEvent) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO lifecycle_events (
                id, event_type, symbol, horizon, from_model_id, to_model_id,
                reason, details, occurred_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(event.id.to_string())
        .bind(event.event_type.as_str())
        .bind(&event.key.symbol)
        .bind(event.key.horizon.to_string())
        .bind(event.from_model_id.clone())
        .bind(event.to_model_id.clone())
        .bind(&event.reason)
        .bind(event.details.to_string())
        .bind(event.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed to insert lifecycle event")?;

        Ok(result.rows_affected() > 0)
    }

    /// Oldest first.
    pub async fn events_for(&self, key: &HorizonKey) -> Result<Vec<LifecycleEvent>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT id, event_type, symbol, horizon, from_model_id, to_model_id,
                   reason, details, occurred_at
            FROM lifecycle_events
            WHERE symbol = ? AND horizon = ?
            ORDER BY occurred_at ASC
            "#,
        )
        .bind(&key.symbol)
        .bind(key.horizon.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EventRow::into_event).collect()
    }

    /// Returns `false` if a window with the same horizon and end date is
    /// already stored.
    pub async fn record_window(&self, window: &EvaluationWindow) -> Result<bool> {
        let active_metrics = serde_json::to_string(&window.active_metrics)?;
        let shadow_metrics = serde_json::to_string(&window.shadow_metrics)?;
        let result = sqlx::query(
            r#"
            INSERT INTO evaluation_windows (
                symbol, horizon, end_date, window_index, window_start, window_end,
                predictions, active_model_id, shadow_model_id,
                active_metrics, shadow_metrics, win_rate_lift, sharpe_lift
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (symbol, horizon, end_date) DO NOTHING
            "#,
        )
        .bind(&window.key.symbol)
        .bind(window.key.horizon.to_string())
        .bind(window.end_date().to_string())
        .bind(i64::from(window.window_index))
        .bind(window.window_start.to_rfc3339())
        .bind(window.window_end.to_rfc3339())
        .bind(window.predictions as i64)
        .bind(&window.active_model_id)
        .bind(&window.shadow_model_id)
        .bind(active_metrics)
        .bind(shadow_metrics)
        .bind(window.lift.win_rate)
        .bind(window.lift.sharpe_like)
        .execute(&self.pool)
        .await
        .context("failed to insert evaluation window")?;

        Ok(result.rows_affected() > 0)
    }

    /// Oldest end date first.
    pub async fn windows_for(&self, key: &HorizonKey) -> Result<Vec<EvaluationWindow>> {
        let rows: Vec<WindowRow> = sqlx::query_as(
            r#"
            SELECT symbol, horizon, window_index, window_start, window_end,
                   predictions, active_model_id, shadow_model_id,
                   active_metrics, shadow_metrics, win_rate_lift, sharpe_lift
            FROM evaluation_windows
            WHERE symbol = ? AND horizon = ?
            ORDER BY end_date ASC
            "#,
        )
        .bind(&key.symbol)
        .bind(key.horizon.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WindowRow::into_window).collect()
    }

    /// Drain a lifecycle event subscription into the table until the
    /// sender side is dropped.
    pub fn spawn_persister(
        self: Arc<Self>,
        mut rx: broadcast::Receiver<LifecycleEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Err(e) = self.append_event(&event).await {
                            tracing::error!("Failed to persist event {}: {:#}", event.id, e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Event persister lagged, {} events not persisted", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
