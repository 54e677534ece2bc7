use crate::errors::AppError;
use crate::models::{MetricWindow, OptimizationStatus, ScoreOutcome};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ScoringError {
    #[error("window for node {0} has no observations")]
    EmptyWindow(String),
    #[error("measure '{measure}' is absent from every observation of node {node_id}")]
    MissingMeasure { node_id: String, measure: String },
    #[error("invalid strategy configuration: {0}")]
    Misconfigured(String),
}

impl From<ScoringError> for AppError {
    fn from(value: ScoringError) -> Self {
        Self::ScoringPolicy(value.to_string())
    }
}

/// Turns a metric window into a score. Implementations must be pure with
/// respect to the window so that rescoring the same window is reproducible.
pub trait ScoringStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn compute_opportunity(&self, window: &MetricWindow) -> Result<ScoreOutcome, ScoringError>;
}

/// Score cut-offs. Below `declining_below` is declining, at or above
/// `optimized_at` is optimized, anything between needs attention.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusThresholds {
    pub declining_below: f64,
    pub optimized_at: f64,
}

impl Default for StatusThresholds {
    fn default() -> Self {
        Self {
            declining_below: 25.0,
            optimized_at: 75.0,
        }
    }
}

impl StatusThresholds {
    pub fn new(declining_below: f64, optimized_at: f64) -> Result<Self, ScoringError> {
        let thresholds = Self {
            declining_below,
            optimized_at,
        };
        thresholds.validate()?;
        Ok(thresholds)
    }

    pub fn validate(&self) -> Result<(), ScoringError> {
        if !self.declining_below.is_finite() || !self.optimized_at.is_finite() {
            return Err(ScoringError::Misconfigured("thresholds must be finite".to_string()));
        }
        if self.declining_below > self.optimized_at {
            return Err(ScoringError::Misconfigured(format!(
                "declining threshold {} exceeds optimized threshold {}",
                self.declining_below, self.optimized_at
            )));
        }
        Ok(())
    }

    pub fn status_for(&self, score: f64) -> OptimizationStatus {
        if score >= self.optimized_at {
            OptimizationStatus::Optimized
        } else if score < self.declining_below {
            OptimizationStatus::Declining
        } else {
            OptimizationStatus::NeedsAttention
        }
    }
}

/// Mean of a single measure over the window.
#[derive(Debug, Clone)]
pub struct MeanMeasureStrategy {
    measure: String,
    revenue_measure: Option<String>,
    thresholds: StatusThresholds,
}

impl MeanMeasureStrategy {
    pub fn new(
        measure: impl Into<String>,
        revenue_measure: Option<String>,
        thresholds: StatusThresholds,
    ) -> Result<Self, ScoringError> {
        thresholds.validate()?;
        let measure = measure.into();
        if measure.trim().is_empty() {
            return Err(ScoringError::Misconfigured("measure name is empty".to_string()));
        }
        Ok(Self {
            measure,
            revenue_measure,
            thresholds,
        })
    }
}

impl ScoringStrategy for MeanMeasureStrategy {
    fn name(&self) -> &str {
        "mean"
    }

    fn compute_opportunity(&self, window: &MetricWindow) -> Result<ScoreOutcome, ScoringError> {
        if window.observations.is_empty() {
            return Err(ScoringError::EmptyWindow(window.node_id.clone()));
        }
        let score = window.mean(&self.measure).ok_or_else(|| ScoringError::MissingMeasure {
            node_id: window.node_id.clone(),
            measure: self.measure.clone(),
        })?;
        let revenue_potential = self
            .revenue_measure
            .as_deref()
            .and_then(|measure| window.mean(measure));

        Ok(ScoreOutcome {
            score,
            revenue_potential,
            status: self.thresholds.status_for(score),
        })
    }
}

/// Weighted sum of per-measure means. Measures absent from the window
/// contribute nothing; at least one weighted measure must be present.
/// Revenue potential is the product of the factor means when all are present.
#[derive(Debug, Clone)]
pub struct WeightedMeasureStrategy {
    weights: BTreeMap<String, f64>,
    revenue_factors: Vec<String>,
    thresholds: StatusThresholds,
}

impl WeightedMeasureStrategy {
    pub fn new(
        weights: BTreeMap<String, f64>,
        revenue_factors: Vec<String>,
        thresholds: StatusThresholds,
    ) -> Result<Self, ScoringError> {
        thresholds.validate()?;
        if weights.is_empty() {
            return Err(ScoringError::Misconfigured("no weighted measures".to_string()));
        }
        if let Some((name, _)) = weights.iter().find(|(_, weight)| !weight.is_finite()) {
            return Err(ScoringError::Misconfigured(format!("weight for '{name}' is not finite")));
        }
        Ok(Self {
            weights,
            revenue_factors,
            thresholds,
        })
    }
}

impl ScoringStrategy for WeightedMeasureStrategy {
    fn name(&self) -> &str {
        "weighted"
    }

    fn compute_opportunity(&self, window: &MetricWindow) -> Result<ScoreOutcome, ScoringError> {
        if window.observations.is_empty() {
            return Err(ScoringError::EmptyWindow(window.node_id.clone()));
        }

        let mut score = 0.0;
        let mut contributing = 0usize;
        for (measure, weight) in &self.weights {
            if let Some(mean) = window.mean(measure) {
                score += weight * mean;
                contributing += 1;
            }
        }
        if contributing == 0 {
            let names = self.weights.keys().cloned().collect::<Vec<_>>().join(", ");
            return Err(ScoringError::MissingMeasure {
                node_id: window.node_id.clone(),
                measure: names,
            });
        }

        let revenue_potential = if self.revenue_factors.is_empty() {
            None
        } else {
            self.revenue_factors
                .iter()
                .map(|factor| window.mean(factor))
                .try_fold(1.0, |product, mean| mean.map(|value| product * value))
        };

        Ok(ScoreOutcome {
            score,
            revenue_potential,
            status: self.thresholds.status_for(score),
        })
    }
}
