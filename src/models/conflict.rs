use super::*;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Which pipeline produced the conflict. The rule engine and the predictor
/// keep separate taxonomies; this tag is what downstream consumers key on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSource {
    Detection,
    Prediction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    StationOvercapacity,
    EdgeOvercapacity,
    HeadwayViolation,
    BlockingIncident,
    ExcessiveDelay,
    PredictedCongestion,
    PredictedDelay,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::StationOvercapacity => "station_overcapacity",
            ConflictType::EdgeOvercapacity => "edge_overcapacity",
            ConflictType::HeadwayViolation => "headway_violation",
            ConflictType::BlockingIncident => "blocking_incident",
            ConflictType::ExcessiveDelay => "excessive_delay",
            ConflictType::PredictedCongestion => "predicted_congestion",
            ConflictType::PredictedDelay => "predicted_delay",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationType {
    Station,
    Edge,
}

/// A detected or predicted operational conflict. Immutable once emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub conflict_id: String,
    pub source: ConflictSource,
    pub conflict_type: ConflictType,
    pub severity: ConflictSeverity,
    pub probability: f64,
    pub location: String,
    pub location_type: LocationType,
    pub involved_trains: Vec<String>,
    pub explanation: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prediction_horizon_min: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_triggered: Option<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

impl Conflict {
    pub fn detected(
        conflict_type: ConflictType,
        severity: ConflictSeverity,
        location: String,
        location_type: LocationType,
        mut involved_trains: Vec<String>,
        explanation: String,
        timestamp: DateTime<Utc>,
        rule: &str,
    ) -> Self {
        involved_trains.sort();
        Self {
            conflict_id: format!("CONF_{}", Uuid::new_v4()),
            source: ConflictSource::Detection,
            conflict_type,
            severity,
            probability: 1.0,
            location,
            location_type,
            involved_trains,
            explanation,
            timestamp,
            prediction_horizon_min: None,
            rule_triggered: Some(rule.to_string()),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestions(mut self, suggestions: Vec<String>) -> Self {
        self.suggestions = suggestions;
        self
    }

    /// Key used for within-tick deduplication:
    /// `(type, location, sorted involved trains)`.
    pub fn dedup_key(&self) -> String {
        let mut trains = self.involved_trains.clone();
        trains.sort();
        format!(
            "{}|{}|{}",
            self.conflict_type.as_str(),
            self.location,
            trains.join(",")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_key_ignores_train_order() {
        let now = Utc::now();
        let a = Conflict::detected(
            ConflictType::StationOvercapacity,
            ConflictSeverity::Critical,
            "MILANO CENTRALE".into(),
            LocationType::Station,
            vec!["TEST_2".into(), "TEST_1".into()],
            "overcapacity".into(),
            now,
            "station_overcapacity",
        );
        let b = Conflict::detected(
            ConflictType::StationOvercapacity,
            ConflictSeverity::Critical,
            "MILANO CENTRALE".into(),
            LocationType::Station,
            vec!["TEST_1".into(), "TEST_2".into()],
            "overcapacity".into(),
            now,
            "station_overcapacity",
        );
        assert_eq!(a.dedup_key(), b.dedup_key());
        assert_ne!(a.conflict_id, b.conflict_id);
    }
}
