mod access;
mod config;
mod db;
mod engine;
mod errors;
mod ledger;
mod migrations;
mod models;
mod scoring;
mod taxonomy;

pub use crate::access::{
    AccessContext, AccessMode, Role, NODE_METRICS_TABLE, OPPORTUNITIES_TABLE, TAXONOMY_NODES_TABLE,
};
pub use crate::config::{EngineSettings, ScoringConfig, DEFAULT_METRICS_PAGE_SIZE};
pub use crate::db::Database;
pub use crate::engine::OpportunityEngine;
pub use crate::errors::{classify_store_error, AppError, AppResult};
pub use crate::ledger::{validate_measures, MetricCursor, MetricSeries, MetricsLedger};
pub use crate::migrations::{SchemaManager, BASELINE_VERSION, OPPORTUNITY_SCHEMA_VERSION};
pub use crate::models::{
    BatchEntry, BatchReport, BatchSummary, CreateNodePayload, Measures, MetricWindow, MigrationRecord,
    MigrationReport, MigrationState, NodeMetric, NodeOverview, Opportunity, OptimizationStatus, RescoreOutcome,
    RollbackConfirmation, RollbackPlan, SchemaStatus, ScoreOutcome, TaxonomyNode,
};
pub use crate::scoring::{
    MeanMeasureStrategy, ScoringError, ScoringStrategy, StatusThresholds, WeightedMeasureStrategy,
};
pub use crate::taxonomy::TaxonomyStore;

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Installs the JSON file subscriber. Safe to call more than once; later
/// calls report that a subscriber is already set.
pub fn init_tracing(log_dir: &Path) -> AppResult<()> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "opportunity.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| AppError::Internal(format!("install tracing subscriber: {error}")))
}
