use crate::errors::AppError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Measure name to value for one observation.
pub type Measures = BTreeMap<String, f64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationStatus {
    Unscored,
    Declining,
    NeedsAttention,
    Optimized,
}

impl OptimizationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unscored => "unscored",
            Self::Declining => "declining",
            Self::NeedsAttention => "needs_attention",
            Self::Optimized => "optimized",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "unscored" => Some(Self::Unscored),
            "declining" => Some(Self::Declining),
            "needs_attention" => Some(Self::NeedsAttention),
            "optimized" => Some(Self::Optimized),
            _ => None,
        }
    }

    /// Ordering used by the monotonic status check. `Unscored` never comes
    /// out of a scoring pass.
    pub fn rank(self) -> u8 {
        match self {
            Self::Unscored => 0,
            Self::Declining => 1,
            Self::NeedsAttention => 2,
            Self::Optimized => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxonomyNode {
    pub id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub slug: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub opportunity_score: Option<f64>,
    pub revenue_potential: Option<f64>,
    pub optimization_status: OptimizationStatus,
    pub last_scored_at: Option<DateTime<Utc>>,
    pub metrics_updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNodePayload {
    pub parent_id: Option<String>,
    pub name: String,
    pub slug: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetric {
    pub seq: i64,
    pub id: String,
    pub node_id: String,
    pub observed_at: DateTime<Utc>,
    pub measures: Measures,
    pub recorded_at: DateTime<Utc>,
}

/// The observations one scoring pass considers, oldest first.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricWindow {
    pub node_id: String,
    pub observations: Vec<NodeMetric>,
}

impl MetricWindow {
    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.observations.first().map(|metric| metric.observed_at)
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.observations.last().map(|metric| metric.observed_at)
    }

    pub fn values<'a>(&'a self, measure: &'a str) -> impl Iterator<Item = f64> + 'a {
        self.observations
            .iter()
            .filter_map(move |metric| metric.measures.get(measure).copied())
    }

    pub fn mean(&self, measure: &str) -> Option<f64> {
        let (sum, count) = self
            .values(measure)
            .fold((0.0_f64, 0usize), |(sum, count), value| (sum + value, count + 1));
        if count == 0 {
            None
        } else {
            Some(sum / count as f64)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreOutcome {
    pub score: f64,
    pub revenue_potential: Option<f64>,
    pub status: OptimizationStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Opportunity {
    pub id: String,
    pub node_id: String,
    pub score: f64,
    pub revenue_potential: Option<f64>,
    pub status: OptimizationStatus,
    pub scored_at: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub metric_count: i64,
    pub last_metric_seq: i64,
    pub active: bool,
    pub superseded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeOverview {
    pub node: TaxonomyNode,
    pub opportunity: Option<Opportunity>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum RescoreOutcome {
    Scored { opportunity: Opportunity },
    Unchanged { node_id: String, reason: String },
}

impl RescoreOutcome {
    pub fn opportunity(&self) -> Option<&Opportunity> {
        match self {
            Self::Scored { opportunity } => Some(opportunity),
            Self::Unchanged { .. } => None,
        }
    }

    pub fn is_unchanged(&self) -> bool {
        matches!(self, Self::Unchanged { .. })
    }
}

#[derive(Debug)]
pub struct BatchEntry {
    pub node_id: String,
    pub outcome: Result<RescoreOutcome, AppError>,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub entries: Vec<BatchEntry>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub scored: usize,
    pub unchanged: usize,
    pub failed: usize,
}

impl BatchReport {
    pub fn summary(&self) -> BatchSummary {
        let mut summary = BatchSummary::default();
        for entry in &self.entries {
            match &entry.outcome {
                Ok(RescoreOutcome::Scored { .. }) => summary.scored += 1,
                Ok(RescoreOutcome::Unchanged { .. }) => summary.unchanged += 1,
                Err(_) => summary.failed += 1,
            }
        }
        summary
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &AppError)> {
        self.entries.iter().filter_map(|entry| match &entry.outcome {
            Err(error) => Some((entry.node_id.as_str(), error)),
            Ok(_) => None,
        })
    }

    pub fn outcome_for(&self, node_id: &str) -> Option<&Result<RescoreOutcome, AppError>> {
        self.entries
            .iter()
            .find(|entry| entry.node_id == node_id)
            .map(|entry| &entry.outcome)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationState {
    Unapplied,
    Applied,
}

impl MigrationState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unapplied => "unapplied",
            Self::Applied => "applied",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRecord {
    pub version: String,
    pub description: String,
    pub state: MigrationState,
    pub applied_at: Option<DateTime<Utc>>,
    pub rolled_back_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaStatus {
    pub current_version: Option<String>,
    pub migrations: Vec<MigrationRecord>,
}

impl SchemaStatus {
    pub fn state_of(&self, version: &str) -> Option<MigrationState> {
        self.migrations
            .iter()
            .find(|record| record.version == version)
            .map(|record| record.state)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub version: String,
    pub state: MigrationState,
    pub changed: bool,
    pub diagnostic: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackPlan {
    pub version: String,
    pub dropped_tables: Vec<String>,
    pub dropped_columns: Vec<String>,
    pub metric_rows: i64,
    pub opportunity_rows: i64,
    /// Access grants changed from their seeded defaults. Re-applying the
    /// version restores the defaults, not these.
    pub policy_overrides: i64,
}

impl RollbackPlan {
    pub fn describe(&self) -> String {
        let mut message = format!(
            "rolling back {} drops tables [{}] and columns [{}], discarding {} metric rows and {} opportunity rows",
            self.version,
            self.dropped_tables.join(", "),
            self.dropped_columns.join(", "),
            self.metric_rows,
            self.opportunity_rows
        );
        if self.policy_overrides > 0 {
            message.push_str(&format!(
                "; {} customized access grants are lost and re-applying restores the defaults",
                self.policy_overrides
            ));
        }
        message
    }
}

/// Explicit operator acknowledgment that a rollback discards data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RollbackConfirmation {
    #[default]
    NotConfirmed,
    AcknowledgeDataLoss,
}
