use crate::config::EngineSettings;
use crate::errors::{AppError, AppResult};
use crate::migrations;
use crate::models::{Opportunity, OptimizationStatus, TaxonomyNode};
use chrono::{DateTime, Datelike, SecondsFormat, SubsecRound, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const SCHEMA_SQL: &str = include_str!("schema.sql");
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const ENGINE_SETTINGS_KEY: &str = "engine";

const NODE_COLUMNS: &str = "id, parent_id, name, slug, created_at, updated_at";
const NODE_COLUMNS_SCORED: &str = "id, parent_id, name, slug, created_at, updated_at,
     opportunity_score, revenue_potential, optimization_status, last_scored_at, metrics_updated_at";
pub(crate) const OPPORTUNITY_COLUMNS: &str = "id, node_id, score, revenue_potential, status, scored_at,
     window_start, window_end, metric_count, last_metric_seq, active, superseded_at";

/// Single writer connection plus on-demand read-only connections. The file
/// runs in WAL mode so readers see a consistent snapshot without blocking
/// the writer.
#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;
        migrations::record_baseline(&conn)?;

        let db = Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        };
        db.ensure_default_settings()?;

        tracing::debug!(path = %db.db_path.display(), "opened taxonomy database");
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub(crate) fn writer(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    /// Fresh read-only connection; never contends for the writer mutex.
    pub(crate) fn reader(&self) -> AppResult<Connection> {
        let conn = Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    // ─── Settings ─────────────────────────────────────────────────────────────

    pub fn get_settings(&self) -> AppResult<EngineSettings> {
        let conn = self.writer()?;
        let raw = conn
            .query_row(
                "SELECT value_json FROM settings WHERE key = ?1",
                [ENGINE_SETTINGS_KEY],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        match raw {
            Some(raw) => Ok(serde_json::from_str::<EngineSettings>(&raw)?),
            None => Ok(EngineSettings::default()),
        }
    }

    pub fn update_settings(&self, update: serde_json::Value) -> AppResult<EngineSettings> {
        let current = self.get_settings()?;
        let mut merged = serde_json::to_value(current)?;
        merge_json(&mut merged, update);
        let settings: EngineSettings =
            serde_json::from_value(merged).map_err(|err| AppError::InvalidInput(err.to_string()))?;
        settings.scoring.build()?;
        self.save_settings(&settings)?;
        Ok(settings)
    }

    pub fn save_settings(&self, settings: &EngineSettings) -> AppResult<()> {
        let conn = self.writer()?;
        conn.execute(
            "INSERT INTO settings (key, value_json, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
            params![ENGINE_SETTINGS_KEY, serde_json::to_string(settings)?, format_time(now())],
        )?;
        Ok(())
    }

    fn ensure_default_settings(&self) -> AppResult<()> {
        let conn = self.writer()?;
        conn.execute(
            "INSERT INTO settings (key, value_json, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO NOTHING",
            params![
                ENGINE_SETTINGS_KEY,
                serde_json::to_string(&EngineSettings::default())?,
                format_time(now())
            ],
        )?;
        Ok(())
    }

    // ─── Diagnostics ──────────────────────────────────────────────────────────

    /// Verifies the node summary invariants and that no metric or
    /// opportunity row outlives its node.
    pub fn validate_scoring_consistency(&self) -> AppResult<()> {
        let conn = self.writer()?;
        if !migrations::opportunity_schema_applied(&conn)? {
            return Ok(());
        }

        let mismatched: Option<String> = conn
            .query_row(
                "SELECT n.id FROM taxonomy_nodes n
                 LEFT JOIN opportunities o ON o.node_id = n.id AND o.active = 1
                 WHERE (n.last_scored_at IS NULL) <> (o.id IS NULL)
                    OR (o.id IS NOT NULL AND n.last_scored_at <> o.scored_at)
                 LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(node_id) = mismatched {
            return Err(AppError::Internal(format!(
                "node {node_id} last_scored_at disagrees with its active opportunity"
            )));
        }

        let lagging: Option<String> = conn
            .query_row(
                "SELECT n.id FROM taxonomy_nodes n
                 LEFT JOIN (SELECT node_id, MAX(observed_at) AS latest FROM node_metrics GROUP BY node_id) m
                   ON m.node_id = n.id
                 WHERE (m.latest IS NULL AND n.metrics_updated_at IS NOT NULL)
                    OR (m.latest IS NOT NULL AND (n.metrics_updated_at IS NULL OR n.metrics_updated_at < m.latest))
                 LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(node_id) = lagging {
            return Err(AppError::Internal(format!(
                "node {node_id} metrics_updated_at does not cover its latest metric"
            )));
        }

        let orphans: i64 = conn.query_row(
            "SELECT
               (SELECT COUNT(1) FROM node_metrics WHERE node_id NOT IN (SELECT id FROM taxonomy_nodes))
             + (SELECT COUNT(1) FROM opportunities WHERE node_id NOT IN (SELECT id FROM taxonomy_nodes))",
            [],
            |row| row.get(0),
        )?;
        if orphans > 0 {
            return Err(AppError::Internal(format!("{orphans} metric/opportunity rows reference missing nodes")));
        }

        Ok(())
    }
}

pub(crate) fn load_node(conn: &Connection, node_id: &str) -> AppResult<Option<TaxonomyNode>> {
    let mut nodes = query_nodes(conn, "id = ?1", [node_id])?;
    Ok(nodes.pop())
}

pub(crate) fn node_exists(conn: &Connection, node_id: &str) -> AppResult<bool> {
    let count: i64 = conn.query_row("SELECT COUNT(1) FROM taxonomy_nodes WHERE id = ?1", [node_id], |row| {
        row.get(0)
    })?;
    Ok(count > 0)
}

pub(crate) fn query_nodes<P: rusqlite::Params>(conn: &Connection, filter: &str, params: P) -> AppResult<Vec<TaxonomyNode>> {
    let scored = migrations::opportunity_schema_applied(conn)?;
    let columns = if scored { NODE_COLUMNS_SCORED } else { NODE_COLUMNS };
    let query = format!("SELECT {columns} FROM taxonomy_nodes WHERE {filter} ORDER BY slug ASC");
    let mut stmt = conn.prepare(&query)?;
    let rows = stmt.query_map(params, |row| parse_node_row(row, scored))?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

pub(crate) fn load_active_opportunity(conn: &Connection, node_id: &str) -> AppResult<Option<Opportunity>> {
    conn.query_row(
        &format!("SELECT {OPPORTUNITY_COLUMNS} FROM opportunities WHERE node_id = ?1 AND active = 1"),
        [node_id],
        parse_opportunity_row,
    )
    .optional()
    .map_err(AppError::from)
}

fn parse_node_row(row: &rusqlite::Row<'_>, scored: bool) -> rusqlite::Result<TaxonomyNode> {
    let mut node = TaxonomyNode {
        id: row.get(0)?,
        parent_id: row.get(1)?,
        name: row.get(2)?,
        slug: row.get(3)?,
        created_at: parse_time(&row.get::<_, String>(4)?)?,
        updated_at: parse_time(&row.get::<_, String>(5)?)?,
        opportunity_score: None,
        revenue_potential: None,
        optimization_status: OptimizationStatus::Unscored,
        last_scored_at: None,
        metrics_updated_at: None,
    };
    if scored {
        node.opportunity_score = row.get(6)?;
        node.revenue_potential = row.get(7)?;
        node.optimization_status = row
            .get::<_, Option<String>>(8)?
            .map(|raw| parse_status(&raw))
            .transpose()?
            .unwrap_or(OptimizationStatus::Unscored);
        node.last_scored_at = parse_optional_time(row.get(9)?)?;
        node.metrics_updated_at = parse_optional_time(row.get(10)?)?;
    }
    Ok(node)
}

pub(crate) fn parse_opportunity_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Opportunity> {
    Ok(Opportunity {
        id: row.get(0)?,
        node_id: row.get(1)?,
        score: row.get(2)?,
        revenue_potential: row.get(3)?,
        status: parse_status(&row.get::<_, String>(4)?)?,
        scored_at: parse_time(&row.get::<_, String>(5)?)?,
        window_start: parse_time(&row.get::<_, String>(6)?)?,
        window_end: parse_time(&row.get::<_, String>(7)?)?,
        metric_count: row.get(8)?,
        last_metric_seq: row.get(9)?,
        active: row.get::<_, i32>(10)? != 0,
        superseded_at: parse_optional_time(row.get(11)?)?,
    })
}

fn parse_status(raw: &str) -> rusqlite::Result<OptimizationStatus> {
    OptimizationStatus::parse(raw).ok_or_else(|| invalid_data(format!("Unknown optimization status '{}'", raw)))
}

pub(crate) fn column_exists(conn: &Connection, table: &str, column: &str) -> AppResult<bool> {
    let pragma = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub(crate) fn table_exists(conn: &Connection, table: &str) -> AppResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(1) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Current time at the precision timestamps are stored with.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Truncates to stored precision and rejects instants outside years
/// 0000-9999, where the stored text would lose its fixed width.
pub(crate) fn storable_time(value: DateTime<Utc>, what: &str) -> AppResult<DateTime<Utc>> {
    if !(0..=9999).contains(&value.year()) {
        return Err(AppError::InvalidInput(format!(
            "{what} {value} is outside the storable range (years 0000-9999)"
        )));
    }
    Ok(value.trunc_subsecs(6))
}

/// Fixed-width RFC 3339 so that text comparison in SQL matches time order.
/// Callers keep values inside the range `storable_time` accepts.
pub(crate) fn format_time(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| invalid_data(error.to_string()))
}

fn parse_optional_time(raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|raw| parse_time(&raw)).transpose()
}

fn invalid_data(message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}
