use super::*;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentType {
    Technical,
    Trespasser,
    Weather,
    Maintenance,
    Fire,
    PoliceIntervention,
    Other,
}

impl IncidentType {
    /// All types, in the fixed order used by the feature one-hot encoding.
    pub const ALL: [IncidentType; 7] = [
        IncidentType::Technical,
        IncidentType::Trespasser,
        IncidentType::Weather,
        IncidentType::Maintenance,
        IncidentType::Fire,
        IncidentType::PoliceIntervention,
        IncidentType::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentType::Technical => "technical",
            IncidentType::Trespasser => "trespasser",
            IncidentType::Weather => "weather",
            IncidentType::Maintenance => "maintenance",
            IncidentType::Fire => "fire",
            IncidentType::PoliceIntervention => "police_intervention",
            IncidentType::Other => "other",
        }
    }
}

/// A disruption attached to exactly one station or edge for its active
/// lifetime. Resolved incidents are removed from every container within the
/// same tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub incident_id: String,
    #[serde(rename = "type")]
    pub incident_type: IncidentType,
    pub severity: f64,
    pub start_time: DateTime<Utc>,
    pub is_blocking: bool,
    #[serde(default)]
    pub description: String,
}

impl Incident {
    pub fn new(
        incident_id: String,
        incident_type: IncidentType,
        severity: f64,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            incident_id,
            incident_type,
            severity,
            start_time,
            is_blocking: severity > 70.0,
            description: format!("Generated {} incident", incident_type.as_str()),
        }
    }

    /// Age expressed in whole ticks of the given interval.
    pub fn age_ticks(&self, now: DateTime<Utc>, tick_interval_seconds: u64) -> f64 {
        let elapsed = (now - self.start_time).num_seconds().max(0) as f64;
        elapsed / tick_interval_seconds as f64
    }
}
