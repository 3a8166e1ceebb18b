use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::PredictionSettings;
use crate::error::{CoreError, CoreResult};
use crate::features::{is_major_hub, FeatureEngine, FeatureVector, FEATURE_ORDER};
use crate::models::*;
use crate::state::NetworkState;

/// Saved scaler + classifier produced by the offline training batch.
/// Probability = sigmoid(coefficients · scaled_features + intercept).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub feature_names: Vec<String>,
    pub scaler: ScalerArtifact,
    pub model: LinearModelArtifact,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalerArtifact {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearModelArtifact {
    pub coefficients: Vec<f64>,
    pub intercept: f64,
}

impl ModelArtifact {
    pub fn load(path: &Path) -> CoreResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let artifact: ModelArtifact = serde_json::from_str(&raw)?;
        artifact.validate()?;
        Ok(artifact)
    }

    fn validate(&self) -> CoreResult<()> {
        let n = FEATURE_ORDER.len();
        if self.feature_names.len() != n
            || self.scaler.mean.len() != n
            || self.scaler.scale.len() != n
            || self.model.coefficients.len() != n
        {
            return Err(CoreError::Snapshot(format!(
                "model artifact feature count mismatch (expected {})",
                n
            )));
        }
        if self.feature_names.iter().map(String::as_str).ne(FEATURE_ORDER) {
            return Err(CoreError::Snapshot(
                "model artifact feature order differs from training order".into(),
            ));
        }
        Ok(())
    }
}

/// Risk bucket is a pure function of probability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskBucket {
    Safe,
    LowRisk,
    HighRisk,
    Critical,
}

impl RiskBucket {
    pub fn from_probability(p: f64) -> Self {
        if p > 0.8 {
            RiskBucket::Critical
        } else if p >= 0.5 {
            RiskBucket::HighRisk
        } else if p >= 0.3 {
            RiskBucket::LowRisk
        } else {
            RiskBucket::Safe
        }
    }

    fn severity(&self) -> ConflictSeverity {
        match self {
            RiskBucket::Safe => ConflictSeverity::Low,
            RiskBucket::LowRisk => ConflictSeverity::Medium,
            RiskBucket::HighRisk => ConflictSeverity::High,
            RiskBucket::Critical => ConflictSeverity::Critical,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContributingFactor {
    pub feature: String,
    pub contribution: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictPrediction {
    pub prediction_id: String,
    pub train_id: String,
    pub probability: f64,
    pub risk: RiskBucket,
    pub predicted_conflict_type: ConflictType,
    pub predicted_time: DateTime<Utc>,
    pub predicted_location: Option<String>,
    pub prediction_horizon_min: u32,
    pub contributing_factors: Vec<ContributingFactor>,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

impl ConflictPrediction {
    /// Project into the shared conflict value, tagged as prediction-sourced.
    pub fn to_conflict(&self) -> Conflict {
        let location = self.predicted_location.clone().unwrap_or_default();
        Conflict {
            conflict_id: format!("PRED_{}", Uuid::new_v4()),
            source: ConflictSource::Prediction,
            conflict_type: self.predicted_conflict_type,
            severity: self.risk.severity(),
            probability: self.probability,
            location,
            location_type: LocationType::Station,
            involved_trains: vec![self.train_id.clone()],
            explanation: format!(
                "Predicted {} for {} within {} min (p={:.2})",
                self.predicted_conflict_type.as_str(),
                self.train_id,
                self.prediction_horizon_min,
                self.probability
            ),
            timestamp: self.timestamp,
            prediction_horizon_min: Some(self.prediction_horizon_min),
            rule_triggered: None,
            suggestions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionBatch {
    pub network_risk: f64,
    pub high_risk_trains: Vec<String>,
    pub critical_trains: Vec<String>,
    pub predictions: Vec<ConflictPrediction>,
}

/// Scores trains with the loaded classifier, or a deterministic heuristic
/// when no artifact is available. Never blocks the tick path.
pub struct Predictor {
    settings: PredictionSettings,
    feature_engine: FeatureEngine,
    artifact: Option<ModelArtifact>,
}

impl Predictor {
    pub fn new(settings: PredictionSettings) -> Self {
        let artifact = settings
            .model_artifact_path
            .as_deref()
            .and_then(|path| match ModelArtifact::load(Path::new(path)) {
                Ok(artifact) => {
                    debug!(path, "loaded conflict model artifact");
                    Some(artifact)
                }
                Err(e) => {
                    warn!(path, error = %e, "model artifact unavailable; using heuristic scoring");
                    None
                }
            });
        Self {
            settings,
            feature_engine: FeatureEngine::new(),
            artifact,
        }
    }

    pub fn has_model(&self) -> bool {
        self.artifact.is_some()
    }

    /// Smart-trigger gate: any one firing means the train is worth scoring.
    pub fn should_predict(&self, train: &Train, state: &NetworkState) -> bool {
        if train.delay_seconds > self.settings.trigger_delay_threshold_sec {
            return true;
        }

        let reference_station = match train.current_position_type {
            PositionType::Station => train.current_station.as_deref(),
            PositionType::Edge => train.route.get(train.route_index).map(|s| s.station_name.as_str()),
            PositionType::Unknown => None,
        };
        if let Some(station) = reference_station.and_then(|id| state.stations.get(id)) {
            if station.occupancy_ratio() > self.settings.trigger_congestion_threshold {
                return true;
            }
        }

        // Final leg of the route, heading into a major hub.
        if train.current_position_type == PositionType::Edge
            && train.route_index + 1 == train.route.len()
        {
            if let Some(target) = train.route.get(train.route_index) {
                if is_major_hub(&target.station_name) {
                    return true;
                }
            }
        }
        false
    }

    pub fn predict(
        &self,
        train: &Train,
        state: &NetworkState,
        horizon_min: u32,
    ) -> ConflictPrediction {
        let now = state.current_time;
        let features = self.feature_engine.extract(train, state, now);
        let (probability, mut factors) = match &self.artifact {
            Some(artifact) => Self::score_with_model(artifact, &features),
            None => Self::score_heuristic(train, state, &features),
        };

        factors.sort_by(|a, b| b.contribution.abs().total_cmp(&a.contribution.abs()));
        factors.truncate(3);

        let reference_station = match train.current_position_type {
            PositionType::Station => train.current_station.clone(),
            PositionType::Edge => train
                .route
                .get(train.route_index)
                .map(|s| s.station_name.clone()),
            PositionType::Unknown => None,
        };
        let congested = reference_station
            .as_deref()
            .and_then(|id| state.stations.get(id))
            .map(|s| s.occupancy_ratio() > self.settings.trigger_congestion_threshold)
            .unwrap_or(false);
        let predicted_conflict_type = if congested {
            ConflictType::PredictedCongestion
        } else {
            ConflictType::PredictedDelay
        };

        ConflictPrediction {
            prediction_id: format!("PRED_{}", Uuid::new_v4()),
            train_id: train.train_id.clone(),
            probability,
            risk: RiskBucket::from_probability(probability),
            predicted_conflict_type,
            predicted_time: now + Duration::minutes(horizon_min as i64),
            predicted_location: reference_station,
            prediction_horizon_min: horizon_min,
            contributing_factors: factors,
            confidence: 0.3 + 0.7 * features.completeness(),
            timestamp: now,
        }
    }

    /// Score every given train and aggregate network risk.
    pub fn predict_batch(
        &self,
        state: &NetworkState,
        train_ids: &[String],
        horizon_min: u32,
    ) -> PredictionBatch {
        let mut predictions = Vec::new();
        for train_id in train_ids {
            if let Some(train) = state.trains.get(train_id) {
                predictions.push(self.predict(train, state, horizon_min));
            }
        }

        let network_risk = if predictions.is_empty() {
            0.0
        } else {
            predictions.iter().map(|p| p.probability).sum::<f64>() / predictions.len() as f64
        };
        let high_risk_trains = predictions
            .iter()
            .filter(|p| p.risk == RiskBucket::HighRisk)
            .map(|p| p.train_id.clone())
            .collect();
        let critical_trains = predictions
            .iter()
            .filter(|p| p.risk == RiskBucket::Critical)
            .map(|p| p.train_id.clone())
            .collect();

        PredictionBatch {
            network_risk,
            high_risk_trains,
            critical_trains,
            predictions,
        }
    }

    fn score_with_model(
        artifact: &ModelArtifact,
        features: &FeatureVector,
    ) -> (f64, Vec<ContributingFactor>) {
        let mut z = artifact.model.intercept;
        let mut factors = Vec::with_capacity(FEATURE_ORDER.len());
        for (i, value) in features.values().iter().enumerate() {
            let scale = artifact.scaler.scale[i];
            let scaled = if scale != 0.0 {
                (value - artifact.scaler.mean[i]) / scale
            } else {
                0.0
            };
            let contribution = artifact.model.coefficients[i] * scaled;
            z += contribution;
            factors.push(ContributingFactor {
                feature: FEATURE_ORDER[i].to_string(),
                contribution,
            });
        }
        (sigmoid(z), factors)
    }

    /// Deterministic fallback: delay pressure, hub proximity and local
    /// congestion combined into a bounded probability.
    fn score_heuristic(
        train: &Train,
        state: &NetworkState,
        features: &FeatureVector,
    ) -> (f64, Vec<ContributingFactor>) {
        let delay_term = 0.5 * (train.delay_seconds as f64 / 900.0).min(1.0);
        let hub_term = 0.15 * features.get("is_major_hub").unwrap_or(0.0);

        let congestion = match train.current_position_type {
            PositionType::Station => train.current_station.as_deref(),
            PositionType::Edge => train.route.get(train.route_index).map(|s| s.station_name.as_str()),
            PositionType::Unknown => None,
        }
        .and_then(|id| state.stations.get(id))
        .map(|s| s.occupancy_ratio().min(1.0))
        .unwrap_or(0.0);
        let congestion_term = 0.3 * congestion;

        let probability = (0.05 + delay_term + hub_term + congestion_term).clamp(0.0, 0.95);
        let factors = vec![
            ContributingFactor {
                feature: "current_delay_sec".to_string(),
                contribution: delay_term,
            },
            ContributingFactor {
                feature: "competing_trains_estimate".to_string(),
                contribution: congestion_term,
            },
            ContributingFactor {
                feature: "is_major_hub".to_string(),
                contribution: hub_term,
            },
        ];
        (probability, factors)
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}
