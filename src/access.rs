use crate::db::table_exists;
use crate::errors::{AppError, AppResult};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

pub const NODE_METRICS_TABLE: &str = "node_metrics";
pub const OPPORTUNITIES_TABLE: &str = "opportunities";
pub const TAXONOMY_NODES_TABLE: &str = "taxonomy_nodes";
const POLICIES_TABLE: &str = "access_policies";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Service,
    Ingestor,
    Analyst,
    Operator,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Service => "service",
            Self::Ingestor => "ingestor",
            Self::Analyst => "analyst",
            Self::Operator => "operator",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

/// Who is calling. Checked against `access_policies` on every ledger and
/// engine operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessContext {
    pub principal: String,
    pub role: Role,
}

impl AccessContext {
    pub fn new(principal: impl Into<String>, role: Role) -> Self {
        Self {
            principal: principal.into(),
            role,
        }
    }

    pub fn service() -> Self {
        Self::new("opportunity-engine", Role::Service)
    }
}

/// Default grants written by the opportunity schema migration.
pub(crate) const DEFAULT_POLICIES: &[(&str, Role, bool, bool)] = &[
    (TAXONOMY_NODES_TABLE, Role::Service, true, true),
    (NODE_METRICS_TABLE, Role::Service, true, true),
    (OPPORTUNITIES_TABLE, Role::Service, true, true),
    (TAXONOMY_NODES_TABLE, Role::Ingestor, true, false),
    (NODE_METRICS_TABLE, Role::Ingestor, true, true),
    (TAXONOMY_NODES_TABLE, Role::Analyst, true, false),
    (NODE_METRICS_TABLE, Role::Analyst, true, false),
    (OPPORTUNITIES_TABLE, Role::Analyst, true, false),
    (TAXONOMY_NODES_TABLE, Role::Operator, true, true),
    (NODE_METRICS_TABLE, Role::Operator, true, false),
    (OPPORTUNITIES_TABLE, Role::Operator, true, false),
];

pub(crate) fn authorize(conn: &Connection, ctx: &AccessContext, table: &str, mode: AccessMode) -> AppResult<()> {
    let grant: Option<(bool, bool)> = conn
        .query_row(
            "SELECT can_read, can_write FROM access_policies WHERE table_name = ?1 AND role = ?2",
            [table, ctx.role.as_str()],
            |row| Ok((row.get::<_, i32>(0)? != 0, row.get::<_, i32>(1)? != 0)),
        )
        .optional()?;

    let allowed = match (grant, mode) {
        (Some((can_read, _)), AccessMode::Read) => can_read,
        (Some((_, can_write)), AccessMode::Write) => can_write,
        (None, _) => false,
    };
    if allowed {
        return Ok(());
    }

    tracing::warn!(
        principal = %ctx.principal,
        role = ctx.role.as_str(),
        table,
        mode = ?mode,
        "access denied"
    );
    Err(AppError::AccessDenied(format!(
        "{} ({}) may not {} {}",
        ctx.principal,
        ctx.role.as_str(),
        match mode {
            AccessMode::Read => "read",
            AccessMode::Write => "write",
        },
        table
    )))
}

/// Node access on a store still at the baseline version, before the policy
/// table exists, is unrestricted.
pub(crate) fn authorize_governed(
    conn: &Connection,
    ctx: &AccessContext,
    table: &str,
    mode: AccessMode,
) -> AppResult<()> {
    if !table_exists(conn, POLICIES_TABLE)? {
        return Ok(());
    }
    authorize(conn, ctx, table, mode)
}

/// Grants that differ from the seeded defaults, plus grants with no default.
pub(crate) fn count_policy_overrides(conn: &Connection) -> AppResult<i64> {
    if !table_exists(conn, POLICIES_TABLE)? {
        return Ok(0);
    }
    let mut stmt = conn.prepare("SELECT table_name, role, can_read, can_write FROM access_policies")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i32>(2)? != 0,
            row.get::<_, i32>(3)? != 0,
        ))
    })?;

    let mut overrides = 0;
    for row in rows {
        let (table, role, can_read, can_write) = row?;
        let seeded = DEFAULT_POLICIES
            .iter()
            .any(|(t, r, read, write)| *t == table && r.as_str() == role && *read == can_read && *write == can_write);
        if !seeded {
            overrides += 1;
        }
    }
    Ok(overrides)
}

pub(crate) fn seed_default_policies(conn: &Connection) -> AppResult<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO access_policies (table_name, role, can_read, can_write)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(table_name, role) DO NOTHING",
    )?;
    for (table, role, can_read, can_write) in DEFAULT_POLICIES {
        stmt.execute(rusqlite::params![table, role.as_str(), *can_read as i32, *can_write as i32])?;
    }
    Ok(())
}
