//! Daily drift snapshots, one row per (symbol, date).

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use sqlx::FromRow;

use crate::engine::DriftPayload;

#[derive(Debug, FromRow)]
struct SnapshotRow {
    payload: String,
}

pub struct DriftSnapshotStore {
    pool: sqlx::AnyPool,
}

impl DriftSnapshotStore {
    pub fn new(pool: sqlx::AnyPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS drift_snapshots (
                symbol TEXT NOT NULL,
                snapshot_date TEXT NOT NULL,
                severity TEXT NOT NULL,
                recommendation TEXT NOT NULL,
                payload TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (symbol, snapshot_date)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create drift_snapshots")?;
        Ok(())
    }

    /// Insert, or replace the row already saved for the same day.
    pub async fn save(&self, payload: &DriftPayload) -> Result<()> {
        let json = serde_json::to_string(payload)?;
        sqlx::query(
            r#"
            INSERT INTO drift_snapshots (
                symbol, snapshot_date, severity, recommendation, payload, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (symbol, snapshot_date) DO UPDATE SET
                severity = excluded.severity,
                recommendation = excluded.recommendation,
                payload = excluded.payload,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&payload.symbol)
        .bind(payload.snapshot_date().to_string())
        .bind(payload.severity.as_str())
        .bind(payload.recommendation.as_str())
        .bind(json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed to upsert drift snapshot")?;

        tracing::debug!(
            "Saved drift snapshot {} {} ({})",
            payload.symbol,
            payload.snapshot_date(),
            payload.severity
        );
        Ok(())
    }

    pub async fn load(&self, symbol: &str, date: NaiveDate) -> Result<Option<DriftPayload>> {
        let row: Option<SnapshotRow> = sqlx::query_as(
            "SELECT payload FROM drift_snapshots WHERE symbol = ? AND snapshot_date = ?",
        )
        .bind(symbol)
        .bind(date.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| serde_json::from_str(&r.payload).context("bad drift payload json"))
            .transpose()
    }

    /// Most recent first.
    pub async fn history(&self, symbol: &str, limit: i64) -> Result<Vec<DriftPayload>> {
        let rows: Vec<SnapshotRow> = sqlx::query_as(
            r#"
            SELECT payload FROM drift_snapshots
            WHERE symbol = ?
            ORDER BY snapshot_date DESC
            LIMIT ?
            "#,
        )
        .bind(symbol)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| serde_json::from_str(&r.payload).context("bad drift payload json"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cohort::CohortMetrics;
    use crate::engine::CalibrationDrift;
    use crate::severity::Severity;
    use chrono::{DateTime, Duration, TimeZone};

    async fn setup_store() -> DriftSnapshotStore {
        sqlx::any::install_default_drivers();
        let pool = sqlx::any::AnyPoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory SQLite");
        let store = DriftSnapshotStore::new(pool);
        store.init_schema().await.unwrap();
        store
    }

    fn payload(severity: Severity, as_of: DateTime<Utc>) -> DriftPayload {
        let recommendation = severity.recommendation();
        DriftPayload {
            symbol: "SPY".to_string(),
            as_of,
            window_days: 14,
            live: CohortMetrics::from_records("LIVE", as_of - Duration::days(14), as_of, &[]),
            baselines: Vec::new(),
            comparisons: Vec::new(),
            by_horizon: Vec::new(),
            calibration_drift: CalibrationDrift::default(),
            severity,
            flags: Vec::new(),
            recommendation,
            blocked_actions: recommendation.blocked_actions(false),
            reasons: vec!["test".to_string()],
        }
    }

    #[tokio::test]
    async fn test_same_day_save_replaces() {
        let store = setup_store().await;
        let morning = Utc.with_ymd_and_hms(2024, 7, 1, 8, 0, 0).unwrap();
        store.save(&payload(Severity::Watch, morning)).await.unwrap();
        store
            .save(&payload(Severity::Critical, morning + Duration::hours(6)))
            .await
            .unwrap();

        let loaded = store.load("SPY", morning.date_naive()).await.unwrap().unwrap();
        assert_eq!(loaded.severity, Severity::Critical);
        assert_eq!(store.history("SPY", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_history_newest_first() {
        let store = setup_store().await;
        let day = Utc.with_ymd_and_hms(2024, 7, 1, 8, 0, 0).unwrap();
        for i in 0..3 {
            store
                .save(&payload(Severity::Ok, day + Duration::days(i)))
                .await
                .unwrap();
        }
        let history = store.history("SPY", 2).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].as_of > history[1].as_of);
        assert!(store.load("QQQ", day.date_naive()).await.unwrap().is_none());
    }
}
