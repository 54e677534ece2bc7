use crate::access;
use crate::db::{column_exists, format_time, now, parse_time, table_exists, Database};
use crate::errors::{AppError, AppResult};
use crate::models::{
    MigrationRecord, MigrationReport, MigrationState, RollbackConfirmation, RollbackPlan, SchemaStatus,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::sync::Arc;

pub const BASELINE_VERSION: &str = "0001_taxonomy_base";
pub const OPPORTUNITY_SCHEMA_VERSION: &str = "0002_node_opportunities";

struct Migration {
    version: &'static str,
    description: &'static str,
    added_columns: &'static [(&'static str, &'static str, &'static str)],
    up: &'static str,
    /// `None` marks a version that cannot be rolled back.
    down: Option<&'static str>,
    dropped_tables: &'static [&'static str],
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: BASELINE_VERSION,
        description: "Taxonomy node registry",
        added_columns: &[],
        up: "",
        down: None,
        dropped_tables: &[],
    },
    Migration {
        version: OPPORTUNITY_SCHEMA_VERSION,
        description: "Node metrics ledger, opportunities and node scoring columns",
        added_columns: &[
            ("taxonomy_nodes", "opportunity_score", "REAL"),
            ("taxonomy_nodes", "revenue_potential", "REAL"),
            ("taxonomy_nodes", "optimization_status", "TEXT DEFAULT 'unscored'"),
            ("taxonomy_nodes", "last_scored_at", "TEXT"),
            ("taxonomy_nodes", "metrics_updated_at", "TEXT"),
        ],
        up: OPPORTUNITY_SCHEMA_UP,
        down: Some(OPPORTUNITY_SCHEMA_DOWN),
        dropped_tables: &["node_metrics", "opportunities", "access_policies"],
    },
];

const OPPORTUNITY_SCHEMA_UP: &str = "
CREATE TABLE IF NOT EXISTS node_metrics (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  id TEXT NOT NULL UNIQUE,
  node_id TEXT NOT NULL REFERENCES taxonomy_nodes(id) ON DELETE CASCADE,
  observed_at TEXT NOT NULL,
  measures_json TEXT NOT NULL,
  recorded_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_node_metrics_node ON node_metrics(node_id);
CREATE INDEX IF NOT EXISTS idx_node_metrics_node_observed ON node_metrics(node_id, observed_at, seq);
CREATE INDEX IF NOT EXISTS idx_node_metrics_observed ON node_metrics(observed_at);
CREATE TRIGGER IF NOT EXISTS node_metrics_append_only
BEFORE UPDATE ON node_metrics
BEGIN
  SELECT RAISE(ABORT, 'node_metrics is append-only');
END;

CREATE TABLE IF NOT EXISTS opportunities (
  id TEXT PRIMARY KEY,
  node_id TEXT NOT NULL REFERENCES taxonomy_nodes(id) ON DELETE CASCADE,
  score REAL NOT NULL,
  revenue_potential REAL,
  status TEXT NOT NULL,
  scored_at TEXT NOT NULL,
  window_start TEXT NOT NULL,
  window_end TEXT NOT NULL,
  metric_count INTEGER NOT NULL,
  last_metric_seq INTEGER NOT NULL,
  active INTEGER NOT NULL DEFAULT 1,
  superseded_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_opportunities_node ON opportunities(node_id, scored_at DESC);
CREATE UNIQUE INDEX IF NOT EXISTS idx_opportunities_active_node ON opportunities(node_id) WHERE active = 1;

CREATE TABLE IF NOT EXISTS access_policies (
  table_name TEXT NOT NULL,
  role TEXT NOT NULL,
  can_read INTEGER NOT NULL DEFAULT 0,
  can_write INTEGER NOT NULL DEFAULT 0,
  PRIMARY KEY(table_name, role)
);
";

const OPPORTUNITY_SCHEMA_DOWN: &str = "
DROP TABLE IF EXISTS opportunities;
DROP TABLE IF EXISTS node_metrics;
DROP TABLE IF EXISTS access_policies;
";

/// Applies and rolls back schema versions. Version state lives in the
/// `schema_migrations` table so every session sees the same answer.
#[derive(Debug, Clone)]
pub struct SchemaManager {
    db: Arc<Database>,
}

impl SchemaManager {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn status(&self) -> AppResult<SchemaStatus> {
        let conn = self.db.writer()?;
        let mut migrations = Vec::with_capacity(MIGRATIONS.len());
        for migration in MIGRATIONS {
            let row = conn
                .query_row(
                    "SELECT state, applied_at, rolled_back_at FROM schema_migrations WHERE version = ?1",
                    [migration.version],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, Option<String>>(2)?,
                        ))
                    },
                )
                .optional()?;
            let record = match row {
                Some((state, applied_at, rolled_back_at)) => MigrationRecord {
                    version: migration.version.to_string(),
                    description: migration.description.to_string(),
                    state: parse_state(&state),
                    applied_at: applied_at.map(|raw| parse_time(&raw)).transpose()?,
                    rolled_back_at: rolled_back_at.map(|raw| parse_time(&raw)).transpose()?,
                },
                None => MigrationRecord {
                    version: migration.version.to_string(),
                    description: migration.description.to_string(),
                    state: MigrationState::Unapplied,
                    applied_at: None,
                    rolled_back_at: None,
                },
            };
            migrations.push(record);
        }

        let current_version = migrations
            .iter()
            .rev()
            .find(|record| record.state == MigrationState::Applied)
            .map(|record| record.version.clone());
        Ok(SchemaStatus {
            current_version,
            migrations,
        })
    }

    pub fn apply(&self, version: &str) -> AppResult<MigrationReport> {
        let (index, migration) = find_migration(version)?;
        let mut conn = self.db.writer()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if load_state(&tx, version)? == MigrationState::Applied {
            tx.commit()?;
            return Ok(MigrationReport {
                version: version.to_string(),
                state: MigrationState::Applied,
                changed: false,
                diagnostic: format!("{version} is already applied; nothing to do"),
            });
        }

        for earlier in &MIGRATIONS[..index] {
            if load_state(&tx, earlier.version)? != MigrationState::Applied {
                return Err(AppError::MigrationState(format!(
                    "{version} requires {} to be applied first",
                    earlier.version
                )));
            }
        }

        for (table, column, definition) in migration.added_columns {
            if !column_exists(&tx, table, column)? {
                tx.execute(&format!("ALTER TABLE {table} ADD COLUMN {column} {definition}"), [])?;
            }
        }
        if !migration.up.is_empty() {
            tx.execute_batch(migration.up)?;
        }
        if version == OPPORTUNITY_SCHEMA_VERSION {
            access::seed_default_policies(&tx)?;
        }
        write_state(&tx, migration, MigrationState::Applied)?;
        tx.commit()?;

        tracing::info!(version, "schema migration applied");
        Ok(MigrationReport {
            version: version.to_string(),
            state: MigrationState::Applied,
            changed: true,
            diagnostic: format!("{version} applied: {}", migration.description),
        })
    }

    /// Describes what rolling back `version` would discard, without doing it.
    pub fn rollback_plan(&self, version: &str) -> AppResult<RollbackPlan> {
        let (_, migration) = find_migration(version)?;
        let conn = self.db.writer()?;
        build_plan(&conn, migration)
    }

    /// Rolls back `version`. Destructive: every row in the dropped tables is
    /// lost, so the caller must pass `AcknowledgeDataLoss`.
    pub fn rollback(&self, version: &str, confirmation: RollbackConfirmation) -> AppResult<MigrationReport> {
        let (index, migration) = find_migration(version)?;
        let mut conn = self.db.writer()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if load_state(&tx, version)? == MigrationState::Unapplied {
            tx.commit()?;
            return Ok(MigrationReport {
                version: version.to_string(),
                state: MigrationState::Unapplied,
                changed: false,
                diagnostic: format!("{version} is not applied; nothing to roll back"),
            });
        }

        let Some(down) = migration.down else {
            return Err(AppError::MigrationState(format!("{version} is a baseline and cannot be rolled back")));
        };

        for later in &MIGRATIONS[index + 1..] {
            if load_state(&tx, later.version)? == MigrationState::Applied {
                return Err(AppError::MigrationState(format!(
                    "{} must be rolled back before {version}",
                    later.version
                )));
            }
        }

        let plan = build_plan(&tx, migration)?;
        if confirmation != RollbackConfirmation::AcknowledgeDataLoss {
            tracing::warn!(version, "rollback refused without data-loss acknowledgment");
            return Err(AppError::DestructiveActionRequiresConfirmation(plan.describe()));
        }

        tx.execute_batch(down)?;
        for (table, column, _) in migration.added_columns.iter().rev() {
            if column_exists(&tx, table, column)? {
                tx.execute(&format!("ALTER TABLE {table} DROP COLUMN {column}"), [])?;
            }
        }
        write_state(&tx, migration, MigrationState::Unapplied)?;
        tx.commit()?;

        tracing::warn!(
            version,
            metric_rows = plan.metric_rows,
            opportunity_rows = plan.opportunity_rows,
            "schema migration rolled back"
        );
        Ok(MigrationReport {
            version: version.to_string(),
            state: MigrationState::Unapplied,
            changed: true,
            diagnostic: plan.describe(),
        })
    }
}

pub(crate) fn record_baseline(conn: &Connection) -> AppResult<()> {
    conn.execute(
        "INSERT INTO schema_migrations (version, description, state, applied_at)
         VALUES (?1, ?2, 'applied', ?3)
         ON CONFLICT(version) DO NOTHING",
        params![BASELINE_VERSION, MIGRATIONS[0].description, format_time(now())],
    )?;
    Ok(())
}

pub(crate) fn opportunity_schema_applied(conn: &Connection) -> AppResult<bool> {
    Ok(load_state(conn, OPPORTUNITY_SCHEMA_VERSION)? == MigrationState::Applied)
}

pub(crate) fn require_opportunity_schema(conn: &Connection) -> AppResult<()> {
    if opportunity_schema_applied(conn)? {
        Ok(())
    } else {
        Err(AppError::MigrationState(format!(
            "schema version {OPPORTUNITY_SCHEMA_VERSION} is not applied"
        )))
    }
}

fn find_migration(version: &str) -> AppResult<(usize, &'static Migration)> {
    MIGRATIONS
        .iter()
        .enumerate()
        .find(|(_, migration)| migration.version == version)
        .ok_or_else(|| AppError::InvalidInput(format!("unknown schema version '{version}'")))
}

fn load_state(conn: &Connection, version: &str) -> AppResult<MigrationState> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT state FROM schema_migrations WHERE version = ?1",
            [version],
            |row| row.get(0),
        )
        .optional()?;
    Ok(raw.map(|raw| parse_state(&raw)).unwrap_or(MigrationState::Unapplied))
}

fn write_state(conn: &Connection, migration: &Migration, state: MigrationState) -> AppResult<()> {
    let at = format_time(now());
    match state {
        MigrationState::Applied => conn.execute(
            "INSERT INTO schema_migrations (version, description, state, applied_at, rolled_back_at)
             VALUES (?1, ?2, 'applied', ?3, NULL)
             ON CONFLICT(version) DO UPDATE SET
               state = 'applied', applied_at = excluded.applied_at, rolled_back_at = NULL",
            params![migration.version, migration.description, at],
        )?,
        MigrationState::Unapplied => conn.execute(
            "UPDATE schema_migrations SET state = 'unapplied', rolled_back_at = ?1 WHERE version = ?2",
            params![at, migration.version],
        )?,
    };
    Ok(())
}

fn build_plan(conn: &Connection, migration: &Migration) -> AppResult<RollbackPlan> {
    let count_rows = |table: &str| -> AppResult<i64> {
        if !table_exists(conn, table)? {
            return Ok(0);
        }
        Ok(conn.query_row(&format!("SELECT COUNT(1) FROM {table}"), [], |row| row.get(0))?)
    };

    Ok(RollbackPlan {
        version: migration.version.to_string(),
        dropped_tables: migration.dropped_tables.iter().map(ToString::to_string).collect(),
        dropped_columns: migration
            .added_columns
            .iter()
            .map(|(table, column, _)| format!("{table}.{column}"))
            .collect(),
        metric_rows: if migration.dropped_tables.contains(&"node_metrics") {
            count_rows("node_metrics")?
        } else {
            0
        },
        opportunity_rows: if migration.dropped_tables.contains(&"opportunities") {
            count_rows("opportunities")?
        } else {
            0
        },
        policy_overrides: if migration.dropped_tables.contains(&"access_policies") {
            access::count_policy_overrides(conn)?
        } else {
            0
        },
    })
}

fn parse_state(raw: &str) -> MigrationState {
    match raw {
        "applied" => MigrationState::Applied,
        _ => MigrationState::Unapplied,
    }
}
