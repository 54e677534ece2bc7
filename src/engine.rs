use crate::access::{authorize, AccessContext, AccessMode, OPPORTUNITIES_TABLE};
use crate::db::{
    format_time, load_active_opportunity, node_exists, now, parse_opportunity_row, Database, OPPORTUNITY_COLUMNS,
};
use crate::errors::{classify_store_error, AppError, AppResult};
use crate::ledger::{MetricsLedger, WindowSnapshot};
use crate::migrations::require_opportunity_schema;
use crate::models::{BatchEntry, BatchReport, Opportunity, OptimizationStatus, RescoreOutcome, ScoreOutcome};
use crate::scoring::ScoringStrategy;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

type NodeLock = Arc<Mutex<()>>;

/// Scores nodes from their metric windows and keeps the active opportunity
/// and the node summary columns in step.
pub struct OpportunityEngine {
    db: Arc<Database>,
    ledger: MetricsLedger,
    strategy: Arc<dyn ScoringStrategy>,
    window_days: Option<u32>,
    ctx: AccessContext,
    node_locks: Mutex<HashMap<String, NodeLock>>,
}

impl std::fmt::Debug for OpportunityEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpportunityEngine")
            .field("strategy", &self.strategy.name())
            .field("window_days", &self.window_days)
            .field("principal", &self.ctx.principal)
            .finish()
    }
}

impl OpportunityEngine {
    pub fn new(
        db: Arc<Database>,
        ctx: AccessContext,
        strategy: Arc<dyn ScoringStrategy>,
        window_days: Option<u32>,
    ) -> Self {
        Self {
            ledger: MetricsLedger::new(db.clone(), ctx.clone()),
            db,
            strategy,
            window_days,
            ctx,
            node_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Builds the engine from the persisted engine settings.
    pub fn from_settings(db: Arc<Database>, ctx: AccessContext) -> AppResult<Self> {
        let settings = db.get_settings()?;
        let strategy = settings.scoring.build()?;
        Ok(Self::new(db, ctx, strategy, settings.window_days))
    }

    pub fn rescore_node(&self, node_id: &str) -> AppResult<RescoreOutcome> {
        match self.score_node(node_id) {
            Ok(opportunity) => {
                tracing::info!(
                    node_id,
                    score = opportunity.score,
                    status = opportunity.status.as_str(),
                    metric_count = opportunity.metric_count,
                    last_metric_seq = opportunity.last_metric_seq,
                    strategy = self.strategy.name(),
                    "node rescored"
                );
                Ok(RescoreOutcome::Scored { opportunity })
            }
            Err(AppError::StaleMetrics(reason)) => {
                tracing::debug!(node_id, %reason, "rescore skipped");
                Ok(RescoreOutcome::Unchanged {
                    node_id: node_id.to_string(),
                    reason,
                })
            }
            Err(error) => {
                tracing::warn!(node_id, code = error.code(), error = %error, "rescore failed");
                Err(error)
            }
        }
    }

    /// Rescores each id independently; one failure never stops the rest.
    pub fn rescore_all<I, S>(&self, node_ids: I) -> BatchReport
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut report = BatchReport::default();
        for node_id in node_ids {
            let node_id = node_id.as_ref();
            report.entries.push(BatchEntry {
                node_id: node_id.to_string(),
                outcome: self.rescore_node(node_id),
            });
        }

        let summary = report.summary();
        tracing::info!(
            scored = summary.scored,
            unchanged = summary.unchanged,
            failed = summary.failed,
            "batch rescore finished"
        );
        report
    }

    /// Rescores every node holding metrics newer than its active opportunity
    /// that fall inside the configured window.
    pub fn rescore_pending(&self) -> AppResult<BatchReport> {
        let node_ids = self.ledger.pending_nodes(self.window_days)?;
        Ok(self.rescore_all(node_ids))
    }

    pub fn active_opportunity(&self, node_id: &str) -> AppResult<Option<Opportunity>> {
        let conn = self.db.reader()?;
        require_opportunity_schema(&conn)?;
        authorize(&conn, &self.ctx, OPPORTUNITIES_TABLE, AccessMode::Read)?;
        if !node_exists(&conn, node_id)? {
            return Err(AppError::NotFound(format!("taxonomy node {node_id}")));
        }
        load_active_opportunity(&conn, node_id)
    }

    /// Every opportunity recorded for the node, newest first.
    pub fn opportunity_history(&self, node_id: &str) -> AppResult<Vec<Opportunity>> {
        let conn = self.db.reader()?;
        require_opportunity_schema(&conn)?;
        authorize(&conn, &self.ctx, OPPORTUNITIES_TABLE, AccessMode::Read)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {OPPORTUNITY_COLUMNS} FROM opportunities WHERE node_id = ?1 ORDER BY scored_at DESC, active DESC"
        ))?;
        let rows = stmt.query_map([node_id], parse_opportunity_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    fn score_node(&self, node_id: &str) -> AppResult<Opportunity> {
        let lock = self.node_lock(node_id)?;
        let result = match lock.lock() {
            Ok(_guard) => self.score_locked(node_id),
            Err(_) => Err(AppError::Internal(format!("scoring lock for node {node_id} poisoned"))),
        };
        drop(lock);
        self.release_node_lock(node_id)?;
        result
    }

    fn score_locked(&self, node_id: &str) -> AppResult<Opportunity> {
        let snapshot = self.ledger.snapshot_window(node_id, self.window_days)?;
        if !snapshot.has_new_measures() {
            return Err(AppError::StaleMetrics(format!(
                "node {node_id} has no new metrics since its last scoring"
            )));
        }

        let outcome = self.strategy.compute_opportunity(&snapshot.window)?;
        check_outcome(&outcome)?;
        self.persist(node_id, &snapshot, outcome)
    }

    fn persist(&self, node_id: &str, snapshot: &WindowSnapshot, outcome: ScoreOutcome) -> AppResult<Opportunity> {
        let (Some(window_start), Some(window_end)) = (snapshot.window.start(), snapshot.window.end()) else {
            return Err(AppError::StaleMetrics(format!("node {node_id} has an empty metric window")));
        };
        let last_metric_seq = snapshot.high_water.unwrap_or(0);
        let scored_at = now();
        let opportunity = Opportunity {
            id: Uuid::new_v4().to_string(),
            node_id: node_id.to_string(),
            score: outcome.score,
            revenue_potential: outcome.revenue_potential,
            status: outcome.status,
            scored_at,
            window_start,
            window_end,
            metric_count: snapshot.window.observations.len() as i64,
            last_metric_seq,
            active: true,
            superseded_at: None,
        };

        let mut conn = self.db.writer()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        require_opportunity_schema(&tx)?;
        authorize(&tx, &self.ctx, OPPORTUNITIES_TABLE, AccessMode::Write)?;
        if !node_exists(&tx, node_id)? {
            return Err(AppError::NotFound(format!("taxonomy node {node_id}")));
        }

        let current: Option<i64> = tx
            .query_row(
                "SELECT last_metric_seq FROM opportunities WHERE node_id = ?1 AND active = 1",
                [node_id],
                |row| row.get(0),
            )
            .optional()?;
        if current != snapshot.scored_through {
            return Err(AppError::Conflict(format!(
                "node {node_id} was rescored by another pass while this window was being scored"
            )));
        }

        tx.execute(
            "UPDATE opportunities SET active = 0, superseded_at = ?1 WHERE node_id = ?2 AND active = 1",
            params![format_time(scored_at), node_id],
        )?;
        tx.execute(
            "INSERT INTO opportunities (
               id, node_id, score, revenue_potential, status, scored_at,
               window_start, window_end, metric_count, last_metric_seq, active
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1)",
            params![
                opportunity.id,
                node_id,
                opportunity.score,
                opportunity.revenue_potential,
                opportunity.status.as_str(),
                format_time(scored_at),
                format_time(window_start),
                format_time(window_end),
                opportunity.metric_count,
                last_metric_seq,
            ],
        )
        .map_err(|err| classify_store_error(err, "insert opportunity"))?;
        tx.execute(
            "UPDATE taxonomy_nodes SET
               opportunity_score = ?1,
               revenue_potential = ?2,
               optimization_status = ?3,
               last_scored_at = ?4
             WHERE id = ?5",
            params![
                opportunity.score,
                opportunity.revenue_potential,
                opportunity.status.as_str(),
                format_time(scored_at),
                node_id,
            ],
        )
        .map_err(|err| classify_store_error(err, "update node summary"))?;
        tx.commit()
            .map_err(|err| classify_store_error(err, "commit opportunity"))?;

        Ok(opportunity)
    }

    fn node_lock(&self, node_id: &str) -> AppResult<NodeLock> {
        let mut locks = self
            .node_locks
            .lock()
            .map_err(|_| AppError::Internal("node lock table poisoned".to_string()))?;
        let lock = locks.entry(node_id.to_string()).or_default().clone();
        Ok(lock)
    }

    /// Drops the node's lock entry once no other pass holds or awaits it.
    fn release_node_lock(&self, node_id: &str) -> AppResult<()> {
        let mut locks = self
            .node_locks
            .lock()
            .map_err(|_| AppError::Internal("node lock table poisoned".to_string()))?;
        if locks.get(node_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(node_id);
        }
        Ok(())
    }
}

fn check_outcome(outcome: &ScoreOutcome) -> AppResult<()> {
    if !outcome.score.is_finite() {
        return Err(AppError::ScoringPolicy(format!("score {} is not finite", outcome.score)));
    }
    if outcome.revenue_potential.is_some_and(|revenue| !revenue.is_finite()) {
        return Err(AppError::ScoringPolicy("revenue potential is not finite".to_string()));
    }
    if outcome.status == OptimizationStatus::Unscored {
        return Err(AppError::ScoringPolicy("strategy returned the unscored status".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::OpportunityEngine;
    use crate::access::{AccessContext, Role};
    use crate::db::Database;
    use crate::errors::AppError;
    use crate::ledger::MetricsLedger;
    use crate::migrations::{SchemaManager, OPPORTUNITY_SCHEMA_VERSION};
    use crate::models::{
        CreateNodePayload, Measures, MetricWindow, OptimizationStatus, RescoreOutcome, ScoreOutcome,
    };
    use crate::scoring::{MeanMeasureStrategy, ScoringError, ScoringStrategy, StatusThresholds};
    use crate::taxonomy::TaxonomyStore;
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::Arc;

    struct Harness {
        _dir: tempfile::TempDir,
        db: Arc<Database>,
        taxonomy: TaxonomyStore,
        ledger: MetricsLedger,
        engine: OpportunityEngine,
    }

    fn harness_with(strategy: Arc<dyn ScoringStrategy>, window_days: Option<u32>) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(&dir.path().join("taxonomy.db")).expect("db"));
        SchemaManager::new(db.clone())
            .apply(OPPORTUNITY_SCHEMA_VERSION)
            .expect("apply schema");
        Harness {
            taxonomy: TaxonomyStore::new(db.clone(), AccessContext::service()),
            ledger: MetricsLedger::new(db.clone(), AccessContext::new("collector", Role::Ingestor)),
            engine: OpportunityEngine::new(db.clone(), AccessContext::service(), strategy, window_days),
            db,
            _dir: dir,
        }
    }

    fn harness() -> Harness {
        let strategy = MeanMeasureStrategy::new("x", None, StatusThresholds::default()).expect("strategy");
        harness_with(Arc::new(strategy), None)
    }

    fn node(h: &Harness, slug: &str) -> String {
        h.taxonomy.create_node(CreateNodePayload {
            parent_id: None,
            name: slug.to_string(),
            slug: slug.to_string(),
        })
        .expect("node")
        .id
    }

    fn x(value: f64) -> Measures {
        Measures::from([("x".to_string(), value)])
    }

    fn at(seconds: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).single().expect("ts")
    }

    #[test]
    fn rescoring_tracks_the_growing_window() {
        let h = harness();
        let a = node(&h, "a");
        h.ledger.record(&a, at(1), &x(10.0)).expect("t1");
        h.ledger.record(&a, at(2), &x(20.0)).expect("t2");

        let first = h.engine.rescore_node(&a).expect("first rescore");
        let first = first.opportunity().expect("scored").clone();
        assert_eq!(first.score, 15.0);
        assert_eq!(first.metric_count, 2);

        h.ledger.record(&a, at(3), &x(50.0)).expect("t3");
        let second = h.engine.rescore_node(&a).expect("second rescore");
        let second = second.opportunity().expect("scored");
        assert!((second.score - 26.67).abs() < 0.01);
        assert_eq!(second.window_start, at(1));
        assert_eq!(second.window_end, at(3));

        let node = h.taxonomy.get_node(&a).expect("get").expect("exists");
        assert_eq!(node.last_scored_at, Some(second.scored_at));
        assert_eq!(node.opportunity_score, Some(second.score));
        assert_eq!(node.optimization_status, OptimizationStatus::NeedsAttention);

        let history = h.engine.opportunity_history(&a).expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history.iter().filter(|opportunity| opportunity.active).count(), 1);
        assert!(history.iter().any(|opportunity| opportunity.id == first.id && !opportunity.active));
        h.db.validate_scoring_consistency().expect("consistent");
    }

    #[test]
    fn second_rescore_without_new_metrics_is_a_no_op() {
        let h = harness();
        let a = node(&h, "a");
        h.ledger.record(&a, at(1), &x(10.0)).expect("record");

        h.engine.rescore_node(&a).expect("first");
        let before = h.taxonomy.node_overview(&a).expect("overview");

        let again = h.engine.rescore_node(&a).expect("second");
        assert!(again.is_unchanged());
        let after = h.taxonomy.node_overview(&a).expect("overview");
        assert_eq!(before, after);
    }

    #[test]
    fn node_without_metrics_is_unchanged_and_missing_node_is_not_found() {
        let h = harness();
        let a = node(&h, "a");
        assert!(h.engine.rescore_node(&a).expect("no metrics").is_unchanged());
        assert!(h.taxonomy.get_node(&a).expect("get").expect("exists").last_scored_at.is_none());

        let missing = h.engine.rescore_node("missing").expect_err("missing node");
        assert!(matches!(missing, AppError::NotFound(_)));
    }

    #[test]
    fn strategy_errors_surface_as_scoring_policy_errors() {
        let h = harness();
        let a = node(&h, "a");
        h.ledger
            .record(&a, at(1), &Measures::from([("cost".to_string(), 3.0)]))
            .expect("record");
        let err = h.engine.rescore_node(&a).expect_err("missing measure");
        assert!(matches!(err, AppError::ScoringPolicy(_)), "{err}");
        assert!(h.engine.active_opportunity(&a).expect("lookup").is_none());
        h.db.validate_scoring_consistency().expect("no partial state");
    }

    struct BrokenStrategy;

    impl ScoringStrategy for BrokenStrategy {
        fn name(&self) -> &str {
            "broken"
        }

        fn compute_opportunity(&self, _window: &MetricWindow) -> Result<ScoreOutcome, ScoringError> {
            Ok(ScoreOutcome {
                score: f64::INFINITY,
                revenue_potential: None,
                status: OptimizationStatus::Optimized,
            })
        }
    }

    #[test]
    fn non_finite_scores_are_rejected() {
        let h = harness_with(Arc::new(BrokenStrategy), None);
        let a = node(&h, "a");
        h.ledger.record(&a, at(1), &x(1.0)).expect("record");
        let err = h.engine.rescore_node(&a).expect_err("infinite score");
        assert_eq!(err.code(), "SCORING_POLICY_ERROR");
    }

    #[test]
    fn batch_collects_outcomes_without_aborting() {
        let h = harness();
        let a = node(&h, "a");
        let b = node(&h, "b");
        let c = node(&h, "c");
        h.ledger.record(&a, at(1), &x(80.0)).expect("a");
        h.ledger
            .record(&c, at(1), &Measures::from([("cost".to_string(), 1.0)]))
            .expect("c");

        let report = h.engine.rescore_all([a.as_str(), "ghost", b.as_str(), c.as_str()]);
        let summary = report.summary();
        assert_eq!(summary.scored, 1);
        assert_eq!(summary.unchanged, 1);
        assert_eq!(summary.failed, 2);
        assert!(matches!(report.outcome_for("ghost"), Some(Err(AppError::NotFound(_)))));
        assert!(matches!(report.outcome_for(&c), Some(Err(AppError::ScoringPolicy(_)))));
        assert!(matches!(
            report.outcome_for(&a),
            Some(Ok(RescoreOutcome::Scored { opportunity })) if opportunity.status == OptimizationStatus::Optimized
        ));
        assert_eq!(report.failures().count(), 2);
    }

    #[test]
    fn pending_rescore_only_touches_nodes_with_new_metrics() {
        let h = harness();
        let a = node(&h, "a");
        let b = node(&h, "b");
        h.ledger.record(&a, at(1), &x(10.0)).expect("a");
        h.ledger.record(&b, at(1), &x(10.0)).expect("b");
        h.engine.rescore_node(&a).expect("score a");

        let report = h.engine.rescore_pending().expect("pending");
        assert_eq!(report.entries.len(), 1);
        assert_eq!(report.entries[0].node_id, b);

        assert!(h.engine.rescore_pending().expect("nothing pending").entries.is_empty());
    }

    #[test]
    fn trailing_window_limits_the_observations_scored() {
        let strategy = MeanMeasureStrategy::new("x", None, StatusThresholds::default()).expect("strategy");
        let h = harness_with(Arc::new(strategy), Some(7));
        let a = node(&h, "a");
        let now = at(0);
        h.ledger.record(&a, now - Duration::days(30), &x(1_000.0)).expect("old");
        h.ledger.record(&a, now - Duration::days(2), &x(10.0)).expect("recent");
        h.ledger.record(&a, now, &x(20.0)).expect("latest");

        let outcome = h.engine.rescore_node(&a).expect("rescore");
        let opportunity = outcome.opportunity().expect("scored");
        assert_eq!(opportunity.score, 15.0);
        assert_eq!(opportunity.metric_count, 2);

        // A late observation outside the window brings nothing new to score.
        h.ledger.record(&a, now - Duration::days(60), &x(5.0)).expect("late");
        assert!(h.engine.rescore_node(&a).expect("late rescore").is_unchanged());
    }

    #[test]
    fn pending_rescore_ignores_backfill_outside_the_window() {
        let strategy = MeanMeasureStrategy::new("x", None, StatusThresholds::default()).expect("strategy");
        let h = harness_with(Arc::new(strategy), Some(7));
        let a = node(&h, "a");
        let now = at(0);
        h.ledger.record(&a, now, &x(20.0)).expect("latest");
        h.engine.rescore_node(&a).expect("rescore");

        h.ledger.record(&a, now - Duration::days(60), &x(5.0)).expect("backfill");
        assert!(h.engine.rescore_pending().expect("pending").entries.is_empty());

        h.ledger.record(&a, now - Duration::days(1), &x(40.0)).expect("in window");
        let report = h.engine.rescore_pending().expect("pending");
        assert_eq!(report.summary().scored, 1);
        let active = h.engine.active_opportunity(&a).expect("lookup").expect("active");
        assert_eq!(active.score, 30.0);
        assert_eq!(active.metric_count, 2);
    }

    #[test]
    fn analyst_cannot_rescore() {
        let h = harness();
        let a = node(&h, "a");
        h.ledger.record(&a, at(1), &x(10.0)).expect("record");
        let strategy = MeanMeasureStrategy::new("x", None, StatusThresholds::default()).expect("strategy");
        let analyst = OpportunityEngine::new(
            h.db.clone(),
            AccessContext::new("dana", Role::Analyst),
            Arc::new(strategy),
            None,
        );
        let err = analyst.rescore_node(&a).expect_err("denied");
        assert!(matches!(err, AppError::AccessDenied(_)));
        assert!(analyst.active_opportunity(&a).expect("analyst may read").is_none());
    }

    #[test]
    fn engine_builds_from_persisted_settings() {
        let h = harness();
        h.db.update_settings(serde_json::json!({
            "scoring": { "kind": "weighted", "weights": { "x": 2.0 }, "revenueFactors": ["x"] }
        }))
        .expect("settings");
        let engine = OpportunityEngine::from_settings(h.db.clone(), AccessContext::service()).expect("engine");
        let a = node(&h, "a");
        h.ledger.record(&a, at(1), &x(10.0)).expect("record");
        let outcome = engine.rescore_node(&a).expect("rescore");
        let opportunity = outcome.opportunity().expect("scored");
        assert_eq!(opportunity.score, 20.0);
        assert_eq!(opportunity.revenue_potential, Some(10.0));
    }
}
