use crate::errors::AppResult;
use crate::scoring::{MeanMeasureStrategy, ScoringStrategy, StatusThresholds, WeightedMeasureStrategy};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

pub const DEFAULT_METRICS_PAGE_SIZE: u32 = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ScoringConfig {
    Mean {
        measure: String,
        #[serde(default)]
        revenue_measure: Option<String>,
        #[serde(default)]
        thresholds: StatusThresholds,
    },
    Weighted {
        weights: BTreeMap<String, f64>,
        #[serde(default)]
        revenue_factors: Vec<String>,
        #[serde(default)]
        thresholds: StatusThresholds,
    },
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self::Mean {
            measure: "traffic".to_string(),
            revenue_measure: Some("revenue".to_string()),
            thresholds: StatusThresholds::default(),
        }
    }
}

impl ScoringConfig {
    pub fn build(&self) -> AppResult<Arc<dyn ScoringStrategy>> {
        let strategy: Arc<dyn ScoringStrategy> = match self {
            Self::Mean {
                measure,
                revenue_measure,
                thresholds,
            } => Arc::new(MeanMeasureStrategy::new(
                measure.clone(),
                revenue_measure.clone(),
                *thresholds,
            )?),
            Self::Weighted {
                weights,
                revenue_factors,
                thresholds,
            } => Arc::new(WeightedMeasureStrategy::new(
                weights.clone(),
                revenue_factors.clone(),
                *thresholds,
            )?),
        };
        Ok(strategy)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    pub scoring: ScoringConfig,
    /// Trailing window ending at the newest observation. `None` scores the
    /// node's whole history.
    pub window_days: Option<u32>,
    pub metrics_page_size: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            scoring: ScoringConfig::default(),
            window_days: None,
            metrics_page_size: DEFAULT_METRICS_PAGE_SIZE,
        }
    }
}

impl EngineSettings {
    pub fn from_yaml_str(raw: &str) -> anyhow::Result<Self> {
        let settings: Self = serde_yaml::from_str(raw).context("parse engine settings")?;
        settings.scoring.build().map_err(|error| anyhow::anyhow!("{error}"))?;
        Ok(settings)
    }

    pub fn from_yaml_file(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read engine settings from {}", path.display()))?;
        Ok(Self::from_yaml_str(&raw)?)
    }

    pub fn page_size(&self) -> u32 {
        self.metrics_page_size.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::{EngineSettings, ScoringConfig};
    use std::io::Write;

    #[test]
    fn yaml_settings_fill_in_defaults() {
        let settings = EngineSettings::from_yaml_str(
            "scoring:\n  kind: mean\n  measure: x\nwindowDays: 30\n",
        )
        .expect("parse settings");
        assert_eq!(settings.window_days, Some(30));
        assert_eq!(settings.metrics_page_size, super::DEFAULT_METRICS_PAGE_SIZE);
        match settings.scoring {
            ScoringConfig::Mean {
                measure,
                revenue_measure,
                ..
            } => {
                assert_eq!(measure, "x");
                assert!(revenue_measure.is_none());
            }
            other => panic!("unexpected scoring config {other:?}"),
        }
    }

    #[test]
    fn yaml_with_inverted_thresholds_is_rejected() {
        let err = EngineSettings::from_yaml_str(
            "scoring:\n  kind: weighted\n  weights: { traffic: 1.0 }\n  thresholds: { decliningBelow: 90, optimizedAt: 10 }\n",
        )
        .expect_err("inverted thresholds");
        assert!(err.to_string().contains("SCORING_POLICY_ERROR"));
    }

    #[test]
    fn settings_load_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("engine.yaml");
        let mut file = std::fs::File::create(&path).expect("create");
        writeln!(file, "metricsPageSize: 2").expect("write");
        let settings = EngineSettings::from_yaml_file(&path).expect("load");
        assert_eq!(settings.page_size(), 2);

        let missing = EngineSettings::from_yaml_file(&dir.path().join("missing.yaml")).expect_err("missing");
        assert!(missing.to_string().contains("read engine settings"));
    }
}
