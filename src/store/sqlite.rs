//! SQLite-backed feature store.
//!
//! - WAL mode so the driver can read while import jobs write
//! - Feature values are append-only versions; "latest" and "as of" are queries
//! - A version is identified by (ref, observed_at, source); rewrites are ignored
//! - Pipeline runs are stored whole as JSON next to indexed lookup columns

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use tracing::{debug, info, warn};

use super::FeatureStore;
use crate::models::{
    EventRecord, FeatureRecord, FeatureRef, FeatureScope, FeatureSet, PipelineRun, Provenance,
    RawRecord, Window,
};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS events (
    entity_id TEXT PRIMARY KEY,
    home_team TEXT NOT NULL,
    away_team TEXT NOT NULL,
    event_start INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    source TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_events_start ON events(event_start);

CREATE TABLE IF NOT EXISTS feature_versions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_id TEXT NOT NULL,
    scope_kind TEXT NOT NULL,
    scope_subject TEXT NOT NULL,
    name TEXT NOT NULL,
    value REAL NOT NULL,
    observed_at INTEGER NOT NULL,
    source TEXT NOT NULL,
    lookback INTEGER,
    provenance TEXT NOT NULL DEFAULT 'original'
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_feature_versions_identity
    ON feature_versions(entity_id, scope_kind, scope_subject, name, observed_at, source);

CREATE TABLE IF NOT EXISTS contributing_records (
    entity_id TEXT NOT NULL,
    scope_kind TEXT NOT NULL,
    scope_subject TEXT NOT NULL,
    name TEXT NOT NULL,
    record_id TEXT NOT NULL,
    occurred_at INTEGER NOT NULL,
    recorded_at INTEGER NOT NULL,
    PRIMARY KEY (entity_id, scope_kind, scope_subject, name, record_id)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS pipeline_runs (
    run_id TEXT PRIMARY KEY,
    entity_id TEXT NOT NULL,
    window_name TEXT NOT NULL,
    status TEXT NOT NULL,
    executed_at INTEGER NOT NULL,
    run_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pipeline_runs_lookup
    ON pipeline_runs(entity_id, window_name, executed_at DESC);
"#;

fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single().ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Integer,
            format!("timestamp out of range: {}", ms).into(),
        )
    })
}

fn feature_from_row(row: &Row<'_>) -> rusqlite::Result<FeatureRecord> {
    let kind: String = row.get("scope_kind")?;
    let subject: String = row.get("scope_subject")?;
    let scope = FeatureScope::from_parts(&kind, &subject).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown feature scope: {}", kind).into(),
        )
    })?;
    let lookback: Option<i64> = row.get("lookback")?;
    let provenance: String = row.get("provenance")?;
    Ok(FeatureRecord {
        feature: FeatureRef {
            scope,
            name: row.get("name")?,
        },
        value: row.get("value")?,
        observed_at: from_millis(row.get("observed_at")?)?,
        source: row.get("source")?,
        lookback: lookback.map(|n| n.max(0) as u32),
        provenance: Provenance::parse(&provenance),
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<EventRecord> {
    Ok(EventRecord {
        entity_id: row.get("entity_id")?,
        home_team: row.get("home_team")?,
        away_team: row.get("away_team")?,
        event_start: from_millis(row.get("event_start")?)?,
        updated_at: from_millis(row.get("updated_at")?)?,
        source: row.get("source")?,
    })
}

pub struct SqliteFeatureStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteFeatureStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open feature store at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize feature store schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let events: i64 = conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
            .unwrap_or(0);
        info!(db_path, events, "feature store opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert or replace the primary record of an entity.
    pub fn upsert_event(&self, event: &EventRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO events
             (entity_id, home_team, away_team, event_start, updated_at, source)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                &event.entity_id,
                &event.home_team,
                &event.away_team,
                to_millis(event.event_start),
                to_millis(event.updated_at),
                &event.source,
            ],
        )?;
        Ok(())
    }

    /// Register the raw records behind an aggregate feature.
    pub fn insert_contributors(
        &self,
        entity_id: &str,
        feature: &FeatureRef,
        records: &[RawRecord],
    ) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut inserted = 0usize;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO contributing_records
                 (entity_id, scope_kind, scope_subject, name, record_id, occurred_at, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for record in records {
                inserted += stmt.execute(params![
                    entity_id,
                    feature.scope.kind(),
                    feature.scope.subject(),
                    &feature.name,
                    &record.record_id,
                    to_millis(record.occurred_at),
                    to_millis(record.recorded_at),
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    fn query_features(&self, entity_id: &str, as_of: Option<DateTime<Utc>>) -> Result<FeatureSet> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT scope_kind, scope_subject, name, value, observed_at, source, lookback, provenance
             FROM feature_versions
             WHERE entity_id = ?1 AND observed_at <= ?2
             ORDER BY observed_at ASC, id ASC",
        )?;
        let bound = as_of.map(to_millis).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![entity_id, bound], feature_from_row)?;

        // Ascending order: the last version seen for a ref is the latest.
        let mut set = FeatureSet::new();
        for row in rows {
            let record = row?;
            set.insert(record.feature.clone(), record);
        }
        Ok(set)
    }
}

#[async_trait]
impl FeatureStore for SqliteFeatureStore {
    async fn event(&self, entity_id: &str) -> Result<EventRecord> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT entity_id, home_team, away_team, event_start, updated_at, source
             FROM events WHERE entity_id = ?1",
            params![entity_id],
            event_from_row,
        )
        .optional()?
        .ok_or_else(|| anyhow!("no event record for {}", entity_id))
    }

    async fn features(&self, entity_id: &str) -> Result<FeatureSet> {
        self.query_features(entity_id, None)
    }

    async fn features_as_of(&self, entity_id: &str, as_of: DateTime<Utc>) -> Result<FeatureSet> {
        self.query_features(entity_id, Some(as_of))
    }

    async fn put_features(&self, entity_id: &str, records: &[FeatureRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut inserted = 0usize;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO feature_versions
                 (entity_id, scope_kind, scope_subject, name, value, observed_at, source, lookback, provenance)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for record in records {
                inserted += stmt.execute(params![
                    entity_id,
                    record.feature.scope.kind(),
                    record.feature.scope.subject(),
                    &record.feature.name,
                    record.value,
                    to_millis(record.observed_at),
                    &record.source,
                    record.lookback.map(i64::from),
                    record.provenance.as_str(),
                ])?;
            }
        }
        tx.commit()?;
        debug!(
            entity = entity_id,
            inserted,
            ignored = records.len() - inserted,
            "stored feature versions"
        );
        Ok(())
    }

    async fn contributing_records(
        &self,
        entity_id: &str,
        feature: &FeatureRef,
        limit: usize,
    ) -> Result<Vec<RawRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT record_id, occurred_at, recorded_at
             FROM contributing_records
             WHERE entity_id = ?1 AND scope_kind = ?2 AND scope_subject = ?3 AND name = ?4
             ORDER BY occurred_at DESC
             LIMIT ?5",
        )?;
        let rows = stmt.query_map(
            params![
                entity_id,
                feature.scope.kind(),
                feature.scope.subject(),
                &feature.name,
                limit as i64,
            ],
            |row| {
                Ok(RawRecord {
                    record_id: row.get(0)?,
                    occurred_at: from_millis(row.get(1)?)?,
                    recorded_at: from_millis(row.get(2)?)?,
                })
            },
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read contributing records")
    }

    async fn long_run_average(
        &self,
        entity_id: &str,
        feature: &FeatureRef,
        before: DateTime<Utc>,
    ) -> Result<Option<f64>> {
        let conn = self.conn.lock();
        let avg: Option<f64> = conn.query_row(
            "SELECT AVG(value) FROM feature_versions
             WHERE entity_id = ?1 AND scope_kind = ?2 AND scope_subject = ?3 AND name = ?4
               AND observed_at <= ?5",
            params![
                entity_id,
                feature.scope.kind(),
                feature.scope.subject(),
                &feature.name,
                to_millis(before),
            ],
            |row| row.get(0),
        )?;
        Ok(avg)
    }

    async fn save_run(&self, run: &PipelineRun) -> Result<()> {
        let run_json = serde_json::to_string(run)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO pipeline_runs
             (run_id, entity_id, window_name, status, executed_at, run_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                &run.run_id,
                &run.entity_id,
                run.window.as_str(),
                run.status.as_str(),
                to_millis(run.executed_at),
                &run_json,
            ],
        )?;
        Ok(())
    }

    async fn latest_run(&self, entity_id: &str, window: Window) -> Result<Option<PipelineRun>> {
        let run_json: Option<String> = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT run_json FROM pipeline_runs
                 WHERE entity_id = ?1 AND window_name = ?2
                 ORDER BY executed_at DESC, rowid DESC
                 LIMIT 1",
                params![entity_id, window.as_str()],
                |row| row.get(0),
            )
            .optional()?
        };
        run_json
            .map(|json| serde_json::from_str(&json).context("Corrupt pipeline run record"))
            .transpose()
    }

    async fn upcoming_events(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<EventRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT entity_id, home_team, away_team, event_start, updated_at, source
             FROM events
             WHERE event_start >= ?1 AND event_start <= ?2
             ORDER BY event_start ASC, entity_id ASC",
        )?;
        let rows = stmt.query_map(params![to_millis(from), to_millis(until)], event_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read upcoming events")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PipelineStatus;
    use chrono::Duration;
    use tempfile::TempDir;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 15, 0, 0).unwrap()
    }

    fn open() -> (TempDir, SqliteFeatureStore) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("features.db");
        let store = SqliteFeatureStore::new(path.to_str().unwrap()).unwrap();
        (dir, store)
    }

    fn event() -> EventRecord {
        EventRecord {
            entity_id: "fx-1".into(),
            home_team: "ARS".into(),
            away_team: "CHE".into(),
            event_start: t0(),
            updated_at: t0() - Duration::days(2),
            source: "historical_results".into(),
        }
    }

    #[tokio::test]
    async fn test_event_roundtrip_and_window_query() {
        let (_dir, store) = open();
        store.upsert_event(&event()).unwrap();

        let loaded = store.event("fx-1").await.unwrap();
        assert_eq!(loaded, event());

        let upcoming = store
            .upcoming_events(t0() - Duration::hours(1), t0() + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(upcoming.len(), 1);

        let none = store
            .upcoming_events(t0() + Duration::minutes(1), t0() + Duration::hours(1))
            .await
            .unwrap();
        assert!(none.is_empty());

        assert!(store.event("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_feature_history_latest_and_as_of() {
        let (_dir, store) = open();
        let feature = FeatureRef::team("ARS", "form_last5");
        store
            .put_features(
                "fx-1",
                &[
                    FeatureRecord::new(feature.clone(), 1.8, t0() - Duration::days(3), "team_stats")
                        .with_lookback(5),
                    FeatureRecord::new(feature.clone(), 2.4, t0() - Duration::hours(1), "team_stats")
                        .with_lookback(5),
                ],
            )
            .await
            .unwrap();

        let latest = store.features("fx-1").await.unwrap();
        assert_eq!(latest[&feature].value, 2.4);
        assert_eq!(latest[&feature].lookback, Some(5));

        let as_of = store
            .features_as_of("fx-1", t0() - Duration::days(1))
            .await
            .unwrap();
        assert_eq!(as_of[&feature].value, 1.8);

        let avg = store
            .long_run_average("fx-1", &feature, t0())
            .await
            .unwrap()
            .unwrap();
        assert!((avg - 2.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_rewritten_versions_are_ignored() {
        let (_dir, store) = open();
        let feature = FeatureRef::team("ARS", "xg_last5");
        let history = [
            FeatureRecord::new(feature.clone(), 1.0, t0() - Duration::days(10), "team_stats"),
            FeatureRecord::new(feature.clone(), 2.0, t0() - Duration::days(3), "team_stats"),
        ];
        store.put_features("fx-1", &history).await.unwrap();
        store.put_features("fx-1", &history).await.unwrap();

        let versions: i64 = store
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM feature_versions", [], |row| row.get(0))
            .unwrap();
        assert_eq!(versions, 2);
        let avg = store
            .long_run_average("fx-1", &feature, t0())
            .await
            .unwrap()
            .unwrap();
        assert!((avg - 1.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_contributors_limited_newest_first() {
        let (_dir, store) = open();
        let feature = FeatureRef::team("ARS", "goals_scored_last5");
        let records: Vec<RawRecord> = (0..7)
            .map(|i| RawRecord {
                record_id: format!("m{}", i),
                occurred_at: t0() - Duration::days(3 * i + 1),
                recorded_at: t0() - Duration::days(3 * i + 1) + Duration::hours(2),
            })
            .rev()
            .collect();
        assert_eq!(store.insert_contributors("fx-1", &feature, &records).unwrap(), 7);

        let last5 = store
            .contributing_records("fx-1", &feature, 5)
            .await
            .unwrap();
        assert_eq!(last5.len(), 5);
        let ids: Vec<&str> = last5.iter().map(|r| r.record_id.as_str()).collect();
        assert_eq!(ids, vec!["m0", "m1", "m2", "m3", "m4"]);
        assert_eq!(last5[0].occurred_at, t0() - Duration::days(1));
        assert_eq!(
            last5[0].recorded_at,
            t0() - Duration::days(1) + Duration::hours(2)
        );

        let other = FeatureRef::team("CHE", "goals_scored_last5");
        assert!(store
            .contributing_records("fx-1", &other, 5)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_latest_run_by_execution_time() {
        let (_dir, store) = open();
        let mut first = PipelineRun::new("fx-1", Window::T6h, t0(), t0() - Duration::hours(6));
        first.transition(PipelineStatus::TemporalViolation).unwrap();
        let mut second = PipelineRun::new("fx-1", Window::T6h, t0(), t0() - Duration::hours(5));
        second.transition(PipelineStatus::Running).unwrap();
        second.transition(PipelineStatus::Completed).unwrap();

        store.save_run(&first).await.unwrap();
        store.save_run(&second).await.unwrap();

        let latest = store.latest_run("fx-1", Window::T6h).await.unwrap().unwrap();
        assert_eq!(latest.run_id, second.run_id);
        assert_eq!(latest.status, PipelineStatus::Completed);
        assert!(store.latest_run("fx-1", Window::T90m).await.unwrap().is_none());
    }
}
