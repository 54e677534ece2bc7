use crate::access::{authorize, AccessContext, AccessMode, NODE_METRICS_TABLE, OPPORTUNITIES_TABLE};
use crate::db::{format_time, node_exists, now, parse_time, storable_time, Database};
use crate::errors::{classify_store_error, AppError, AppResult};
use crate::migrations::require_opportunity_schema;
use crate::models::{Measures, MetricWindow, NodeMetric};
use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::VecDeque;
use std::sync::Arc;
use uuid::Uuid;

static MEASURE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]{0,63}$").expect("measure name pattern compiles"));

const METRIC_COLUMNS: &str = "seq, id, node_id, observed_at, measures_json, recorded_at";

/// Append-only store of per-node observations.
#[derive(Debug, Clone)]
pub struct MetricsLedger {
    db: Arc<Database>,
    ctx: AccessContext,
}

impl MetricsLedger {
    pub fn new(db: Arc<Database>, ctx: AccessContext) -> Self {
        Self { db, ctx }
    }

    pub fn record(&self, node_id: &str, observed_at: DateTime<Utc>, measures: &Measures) -> AppResult<NodeMetric> {
        validate_measures(measures)?;
        let observed_at = storable_time(observed_at, "observed_at")?;
        let recorded_at = now();
        let id = Uuid::new_v4().to_string();
        let measures_json = serde_json::to_string(measures)?;

        let mut conn = self.db.writer()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        require_opportunity_schema(&tx)?;
        authorize(&tx, &self.ctx, NODE_METRICS_TABLE, AccessMode::Write)?;
        if !node_exists(&tx, node_id)? {
            return Err(AppError::NotFound(format!("taxonomy node {node_id}")));
        }

        tx.execute(
            "INSERT INTO node_metrics (id, node_id, observed_at, measures_json, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, node_id, format_time(observed_at), measures_json, format_time(recorded_at)],
        )
        .map_err(|err| classify_store_error(err, "record node metric"))?;
        let seq = tx.last_insert_rowid();
        tx.execute(
            "UPDATE taxonomy_nodes SET metrics_updated_at = ?1
             WHERE id = ?2 AND (metrics_updated_at IS NULL OR metrics_updated_at < ?1)",
            params![format_time(observed_at), node_id],
        )?;
        tx.commit()?;

        tracing::debug!(
            node_id,
            seq,
            measures = measures.len(),
            principal = %self.ctx.principal,
            "node metric recorded"
        );
        Ok(NodeMetric {
            seq,
            id,
            node_id: node_id.to_string(),
            observed_at,
            measures: measures.clone(),
            recorded_at,
        })
    }

    /// Ingestion entry point for untyped payloads: a JSON object whose values
    /// must all be numbers.
    pub fn record_payload(
        &self,
        node_id: &str,
        observed_at: DateTime<Utc>,
        payload: &serde_json::Value,
    ) -> AppResult<NodeMetric> {
        let object = payload
            .as_object()
            .ok_or_else(|| AppError::InvalidMeasure("measures payload must be an object".to_string()))?;
        let mut measures = Measures::new();
        for (name, value) in object {
            let number = value
                .as_f64()
                .ok_or_else(|| AppError::InvalidMeasure(format!("measure '{name}' is not numeric: {value}")))?;
            measures.insert(name.clone(), number);
        }
        self.record(node_id, observed_at, &measures)
    }

    /// Observations with `observed_at >= since`, oldest first. The returned
    /// series reads lazily and can be iterated again from the start.
    pub fn metrics_since(&self, node_id: &str, since: DateTime<Utc>) -> AppResult<MetricSeries> {
        let since = storable_time(since, "since")?;
        let conn = self.db.reader()?;
        require_opportunity_schema(&conn)?;
        authorize(&conn, &self.ctx, NODE_METRICS_TABLE, AccessMode::Read)?;
        if !node_exists(&conn, node_id)? {
            return Err(AppError::NotFound(format!("taxonomy node {node_id}")));
        }
        let page_size = self.db.get_settings()?.page_size();
        Ok(MetricSeries {
            db: self.db.clone(),
            node_id: node_id.to_string(),
            since: format_time(since),
            page_size,
        })
    }

    /// Reads everything one scoring pass needs inside a single read
    /// transaction, so the window and high-water mark agree with each other.
    pub(crate) fn snapshot_window(&self, node_id: &str, window_days: Option<u32>) -> AppResult<WindowSnapshot> {
        let conn = self.db.reader()?;
        let tx = conn.unchecked_transaction()?;
        require_opportunity_schema(&tx)?;
        authorize(&tx, &self.ctx, NODE_METRICS_TABLE, AccessMode::Read)?;
        authorize(&tx, &self.ctx, OPPORTUNITIES_TABLE, AccessMode::Write)?;
        if !node_exists(&tx, node_id)? {
            return Err(AppError::NotFound(format!("taxonomy node {node_id}")));
        }

        let scored_through: Option<i64> = tx
            .query_row(
                "SELECT last_metric_seq FROM opportunities WHERE node_id = ?1 AND active = 1",
                [node_id],
                |row| row.get(0),
            )
            .optional()?;
        let (high_water, latest): (Option<i64>, Option<String>) = tx.query_row(
            "SELECT MAX(seq), MAX(observed_at) FROM node_metrics WHERE node_id = ?1",
            [node_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let start = match latest {
            Some(latest) => window_floor(parse_time(&latest)?, window_days),
            None => String::new(),
        };

        let observations = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {METRIC_COLUMNS} FROM node_metrics
                 WHERE node_id = ?1 AND observed_at >= ?2
                 ORDER BY observed_at ASC, seq ASC"
            ))?;
            let rows = stmt.query_map(params![node_id, start], parse_metric_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        tx.finish()?;

        Ok(WindowSnapshot {
            scored_through,
            high_water,
            window: MetricWindow {
                node_id: node_id.to_string(),
                observations,
            },
        })
    }

    /// Nodes holding observations that a scoring pass would treat as new:
    /// ingested after the active opportunity and inside the node's window.
    pub(crate) fn pending_nodes(&self, window_days: Option<u32>) -> AppResult<Vec<String>> {
        let conn = self.db.reader()?;
        let tx = conn.unchecked_transaction()?;
        require_opportunity_schema(&tx)?;
        authorize(&tx, &self.ctx, NODE_METRICS_TABLE, AccessMode::Read)?;
        authorize(&tx, &self.ctx, OPPORTUNITIES_TABLE, AccessMode::Read)?;

        let candidates = {
            let mut stmt = tx.prepare(
                "SELECT n.id,
                        COALESCE(
                          (SELECT o.last_metric_seq FROM opportunities o WHERE o.node_id = n.id AND o.active = 1),
                          0),
                        (SELECT MAX(m.observed_at) FROM node_metrics m WHERE m.node_id = n.id)
                 FROM taxonomy_nodes n
                 WHERE EXISTS (SELECT 1 FROM node_metrics m WHERE m.node_id = n.id)
                 ORDER BY n.slug ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, String>(2)?))
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut pending = Vec::new();
        {
            let mut stmt = tx.prepare(
                "SELECT EXISTS (
                   SELECT 1 FROM node_metrics
                   WHERE node_id = ?1 AND seq > ?2 AND observed_at >= ?3
                 )",
            )?;
            for (node_id, scored_through, latest) in candidates {
                let floor = window_floor(parse_time(&latest)?, window_days);
                let has_new: bool = stmt.query_row(params![node_id, scored_through, floor], |row| row.get(0))?;
                if has_new {
                    pending.push(node_id);
                }
            }
        }
        tx.finish()?;
        Ok(pending)
    }
}

pub(crate) struct WindowSnapshot {
    /// High-water mark of the active opportunity, if any.
    pub scored_through: Option<i64>,
    /// Largest ingestion seq for the node at snapshot time.
    pub high_water: Option<i64>,
    pub window: MetricWindow,
}

impl WindowSnapshot {
    pub fn has_new_measures(&self) -> bool {
        let scored_through = self.scored_through.unwrap_or(0);
        self.window
            .observations
            .iter()
            .any(|metric| metric.seq > scored_through)
    }
}

/// Lazily paged, restartable view over a node's metrics.
#[derive(Debug, Clone)]
pub struct MetricSeries {
    db: Arc<Database>,
    node_id: String,
    since: String,
    page_size: u32,
}

impl MetricSeries {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn iter(&self) -> MetricCursor<'_> {
        MetricCursor {
            series: self,
            conn: None,
            after: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }
}

impl<'a> IntoIterator for &'a MetricSeries {
    type Item = AppResult<NodeMetric>;
    type IntoIter = MetricCursor<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct MetricCursor<'a> {
    series: &'a MetricSeries,
    conn: Option<Connection>,
    after: Option<(String, i64)>,
    buffer: VecDeque<NodeMetric>,
    exhausted: bool,
}

impl MetricCursor<'_> {
    /// Rewinds to the first observation of the series.
    pub fn restart(&mut self) {
        self.after = None;
        self.buffer.clear();
        self.exhausted = false;
    }

    fn fetch_page(&mut self) -> AppResult<()> {
        if self.conn.is_none() {
            self.conn = Some(self.series.db.reader()?);
        }
        let Some(conn) = self.conn.as_ref() else {
            return Err(AppError::Internal("metric cursor lost its connection".to_string()));
        };

        let (after_observed, after_seq) = self.after.clone().unwrap_or_default();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {METRIC_COLUMNS} FROM node_metrics
             WHERE node_id = ?1 AND observed_at >= ?2
               AND (observed_at > ?3 OR (observed_at = ?3 AND seq > ?4))
             ORDER BY observed_at ASC, seq ASC
             LIMIT ?5"
        ))?;
        let rows = stmt.query_map(
            params![
                self.series.node_id,
                self.series.since,
                after_observed,
                after_seq,
                self.series.page_size
            ],
            parse_metric_row,
        )?;
        let page = rows.collect::<Result<Vec<_>, _>>()?;

        if page.len() < self.series.page_size as usize {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.after = Some((format_time(last.observed_at), last.seq));
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for MetricCursor<'_> {
    type Item = AppResult<NodeMetric>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(error) = self.fetch_page() {
                self.exhausted = true;
                return Some(Err(error));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

/// Stored lower bound of the scoring window ending at `latest`. An unset
/// window, or one reaching before year 0000, covers the whole history.
fn window_floor(latest: DateTime<Utc>, window_days: Option<u32>) -> String {
    window_days
        .and_then(|days| latest.checked_sub_signed(Duration::days(i64::from(days))))
        .and_then(|start| storable_time(start, "window start").ok())
        .map(format_time)
        .unwrap_or_default()
}

pub fn validate_measures(measures: &Measures) -> AppResult<()> {
    if measures.is_empty() {
        return Err(AppError::InvalidMeasure("at least one measure is required".to_string()));
    }
    for (name, value) in measures {
        if !MEASURE_NAME.is_match(name) {
            return Err(AppError::InvalidMeasure(format!("measure name '{name}' is malformed")));
        }
        if !value.is_finite() {
            return Err(AppError::InvalidMeasure(format!("measure '{name}' is not a finite number")));
        }
    }
    Ok(())
}

fn parse_metric_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<NodeMetric> {
    let measures_raw: String = row.get(4)?;
    let measures = serde_json::from_str::<Measures>(&measures_raw).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(error))
    })?;
    Ok(NodeMetric {
        seq: row.get(0)?,
        id: row.get(1)?,
        node_id: row.get(2)?,
        observed_at: parse_time(&row.get::<_, String>(3)?)?,
        measures,
        recorded_at: parse_time(&row.get::<_, String>(5)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::{validate_measures, MetricsLedger};
    use crate::access::{AccessContext, Role};
    use crate::db::Database;
    use crate::errors::AppError;
    use crate::migrations::{SchemaManager, OPPORTUNITY_SCHEMA_VERSION};
    use crate::models::{CreateNodePayload, Measures};
    use crate::taxonomy::TaxonomyStore;
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::Arc;

    fn setup() -> (tempfile::TempDir, Arc<Database>, MetricsLedger, String) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(&dir.path().join("taxonomy.db")).expect("db"));
        SchemaManager::new(db.clone())
            .apply(OPPORTUNITY_SCHEMA_VERSION)
            .expect("apply schema");
        let node = TaxonomyStore::new(db.clone(), AccessContext::service())
            .create_node(CreateNodePayload {
                parent_id: None,
                name: "Shoes".to_string(),
                slug: "shoes".to_string(),
            })
            .expect("node");
        let ledger = MetricsLedger::new(db.clone(), AccessContext::new("collector", Role::Ingestor));
        (dir, db, ledger, node.id)
    }

    fn measures(pairs: &[(&str, f64)]) -> Measures {
        pairs.iter().map(|(name, value)| (name.to_string(), *value)).collect()
    }

    #[test]
    fn metrics_come_back_in_time_order_regardless_of_insert_order() {
        let (_dir, db, ledger, node_id) = setup();
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).single().expect("ts");
        let t2 = t + Duration::hours(1);

        ledger.record(&node_id, t2, &measures(&[("x", 7.0)])).expect("record t2");
        ledger.record(&node_id, t, &measures(&[("x", 5.0)])).expect("record t");

        let series = ledger
            .metrics_since(&node_id, t - Duration::milliseconds(1))
            .expect("series");
        let values = series
            .iter()
            .map(|metric| metric.expect("metric").measures["x"])
            .collect::<Vec<_>>();
        assert_eq!(values, vec![5.0, 7.0]);

        let node = TaxonomyStore::new(db, AccessContext::service())
            .get_node(&node_id)
            .expect("get")
            .expect("exists");
        assert_eq!(node.metrics_updated_at, Some(t2));
    }

    #[test]
    fn series_pages_lazily_and_restarts() {
        let (_dir, db, ledger, node_id) = setup();
        db.update_settings(serde_json::json!({ "metricsPageSize": 2 }))
            .expect("page size");
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().expect("ts");
        for offset in 0..5 {
            ledger
                .record(&node_id, base + Duration::minutes(offset), &measures(&[("x", offset as f64)]))
                .expect("record");
        }

        let series = ledger.metrics_since(&node_id, base + Duration::minutes(1)).expect("series");
        let mut cursor = series.iter();
        let first = cursor.next().expect("first").expect("ok");
        assert_eq!(first.measures["x"], 1.0);
        let rest = cursor.by_ref().map(|metric| metric.expect("ok").measures["x"]).collect::<Vec<_>>();
        assert_eq!(rest, vec![2.0, 3.0, 4.0]);
        assert!(cursor.next().is_none());

        cursor.restart();
        assert_eq!(cursor.count(), 4);
        assert_eq!((&series).into_iter().count(), 4);
    }

    #[test]
    fn invalid_payloads_are_rejected() {
        let (_dir, _db, ledger, node_id) = setup();
        let now = Utc::now();

        let empty = ledger.record(&node_id, now, &Measures::new()).expect_err("empty");
        assert!(matches!(empty, AppError::InvalidMeasure(_)));

        let nan = ledger
            .record(&node_id, now, &measures(&[("x", f64::NAN)]))
            .expect_err("nan");
        assert!(matches!(nan, AppError::InvalidMeasure(_)));

        let text = ledger
            .record_payload(&node_id, now, &serde_json::json!({ "traffic": "lots" }))
            .expect_err("non-numeric");
        assert!(matches!(text, AppError::InvalidMeasure(_)));

        let missing = ledger
            .record(&"missing".to_string(), now, &measures(&[("x", 1.0)]))
            .expect_err("missing node");
        assert!(matches!(missing, AppError::NotFound(_)));

        let ok = ledger
            .record_payload(&node_id, now, &serde_json::json!({ "traffic": 12, "cost": 1.5 }))
            .expect("numeric payload");
        assert_eq!(ok.measures["traffic"], 12.0);
    }

    #[test]
    fn measure_names_are_checked() {
        assert!(validate_measures(&measures(&[("conversion_rate", 0.1)])).is_ok());
        assert!(validate_measures(&measures(&[("Conversion Rate", 0.1)])).is_err());
        assert!(validate_measures(&measures(&[("1st", 0.1)])).is_err());
    }

    #[test]
    fn metrics_are_append_only_and_role_checked() {
        let (_dir, db, ledger, node_id) = setup();
        ledger
            .record(&node_id, Utc::now(), &measures(&[("x", 1.0)]))
            .expect("record");

        {
            let conn = db.writer().expect("conn");
            let err = conn
                .execute("UPDATE node_metrics SET measures_json = '{}'", [])
                .expect_err("update blocked");
            assert!(err.to_string().contains("append-only"));
        }

        let analyst = MetricsLedger::new(db.clone(), AccessContext::new("dana", Role::Analyst));
        let denied = analyst
            .record(&node_id, Utc::now(), &measures(&[("x", 2.0)]))
            .expect_err("analyst cannot write");
        assert!(matches!(denied, AppError::AccessDenied(_)));
        assert_eq!(
            analyst
                .metrics_since(&node_id, Utc::now() - Duration::days(1))
                .expect("analyst can read")
                .iter()
                .count(),
            1
        );
    }

    #[test]
    fn ledger_requires_the_opportunity_schema() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(&dir.path().join("taxonomy.db")).expect("db"));
        let ledger = MetricsLedger::new(db, AccessContext::service());
        let err = ledger
            .record("any", Utc::now(), &measures(&[("x", 1.0)]))
            .expect_err("schema missing");
        assert!(matches!(err, AppError::MigrationState(_)));
    }

    #[test]
    fn equal_timestamps_page_in_seq_order() {
        let (_dir, db, ledger, node_id) = setup();
        db.update_settings(serde_json::json!({ "metricsPageSize": 2 }))
            .expect("page size");
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).single().expect("ts");
        let later = ledger.record(&node_id, t + Duration::seconds(1), &measures(&[("x", 9.0)])).expect("later");
        let mut tied = Vec::new();
        for value in 0..5 {
            tied.push(ledger.record(&node_id, t, &measures(&[("x", value as f64)])).expect("tied").seq);
        }

        let series = ledger.metrics_since(&node_id, t).expect("series");
        let seqs = series.iter().map(|metric| metric.expect("metric").seq).collect::<Vec<_>>();
        let mut expected = tied.clone();
        expected.push(later.seq);
        assert_eq!(seqs, expected);
        assert_eq!(series.iter().count(), 6);
    }

    #[test]
    fn since_after_every_observation_yields_nothing() {
        let (_dir, _db, ledger, node_id) = setup();
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).single().expect("ts");
        ledger.record(&node_id, t, &measures(&[("x", 1.0)])).expect("record");

        let series = ledger
            .metrics_since(&node_id, t + Duration::microseconds(1))
            .expect("series");
        assert_eq!(series.iter().count(), 0);
        assert_eq!(ledger.metrics_since(&node_id, t).expect("inclusive").iter().count(), 1);
    }

    #[test]
    fn timestamps_outside_four_digit_years_are_rejected() {
        let (_dir, db, ledger, node_id) = setup();
        let far = Utc.with_ymd_and_hms(10000, 1, 1, 0, 0, 0).single().expect("year 10000");
        let err = ledger.record(&node_id, far, &measures(&[("x", 1.0)])).expect_err("year 10000");
        assert!(matches!(err, AppError::InvalidInput(_)), "{err}");

        let last = Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59).single().expect("year 9999");
        let recent = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().expect("2024");
        ledger.record(&node_id, last, &measures(&[("x", 1.0)])).expect("year 9999");
        ledger.record(&node_id, recent, &measures(&[("x", 2.0)])).expect("2024");

        let values = ledger
            .metrics_since(&node_id, recent - Duration::days(1))
            .expect("series")
            .iter()
            .map(|metric| metric.expect("metric").measures["x"])
            .collect::<Vec<_>>();
        assert_eq!(values, vec![2.0, 1.0]);
        let node = TaxonomyStore::new(db.clone(), AccessContext::service())
            .get_node(&node_id)
            .expect("get")
            .expect("exists");
        assert_eq!(node.metrics_updated_at, Some(last));
        db.validate_scoring_consistency().expect("consistent");

        let since = ledger.metrics_since(&node_id, far).expect_err("since out of range");
        assert!(matches!(since, AppError::InvalidInput(_)));
    }
}
