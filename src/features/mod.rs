use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::models::*;
use crate::state::NetworkState;

/// The saved training order. Scoring feeds the vector to the scaler in
/// exactly this order; changing it invalidates any saved model artifact.
pub const FEATURE_ORDER: [&str; 19] = [
    "competing_trains_estimate",
    "current_delay_sec",
    "day_of_week",
    "delay_category",
    "estimated_speed_kmh",
    "hour_of_day",
    "incident_type_fire",
    "incident_type_maintenance",
    "incident_type_other",
    "incident_type_police_intervention",
    "incident_type_technical",
    "incident_type_trespasser",
    "incident_type_weather",
    "is_major_hub",
    "is_peak_hour",
    "is_weekend",
    "network_hour_delay_avg",
    "progress_factor",
    "station_hash",
];

/// Stations with disproportionate traffic; arrivals here trigger prediction
/// and weigh into the heuristic score.
pub const MAJOR_HUBS: [&str; 8] = [
    "MILANO CENTRALE",
    "MILANO PORTA GARIBALDI",
    "MILANO CADORNA",
    "MILANO ROGOREDO",
    "BRESCIA",
    "BERGAMO",
    "MONZA",
    "COMO S. GIOVANNI",
];

pub fn is_major_hub(station: &str) -> bool {
    MAJOR_HUBS.contains(&station)
}

const PEAK_HOURS: [u32; 6] = [7, 8, 9, 17, 18, 19];

/// FNV-1a over the station name, folded to [0, 1). Stable across processes,
/// unlike the standard library hasher.
pub fn stable_station_hash(name: &str) -> f64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = FNV_OFFSET;
    for byte in name.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    (hash % 100) as f64 / 100.0
}

/// Feature vector in `FEATURE_ORDER`, with name-based access for
/// contribution reporting.
#[derive(Debug, Clone)]
pub struct FeatureVector {
    values: Vec<f64>,
}

impl FeatureVector {
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        FEATURE_ORDER
            .iter()
            .position(|&n| n == name)
            .map(|i| self.values[i])
    }

    /// Fraction of features carrying a signal. Used as the prediction
    /// confidence proxy.
    pub fn completeness(&self) -> f64 {
        let informative = self.values.iter().filter(|v| **v != 0.0).count();
        informative as f64 / self.values.len() as f64
    }
}

/// Builds the fixed-schema feature vector for a `(train, network)` pair.
/// Anything unknown contributes 0.
pub struct FeatureEngine;

impl FeatureEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn extract(
        &self,
        train: &Train,
        state: &NetworkState,
        at: DateTime<Utc>,
    ) -> FeatureVector {
        let reference_station = Self::reference_station(train);

        let delay_sec = train.delay_seconds as f64;
        let delay_category = match train.delay_seconds {
            d if d > 600 => 3.0,
            d if d > 300 => 2.0,
            d if d > 120 => 1.0,
            _ => 0.0,
        };

        let (hub, station_hash) = match reference_station {
            Some(name) => (
                if is_major_hub(name) { 1.0 } else { 0.0 },
                stable_station_hash(name),
            ),
            None => (0.0, 0.5),
        };

        let incident_type = Self::local_incident_type(train, state);
        let one_hot = |t: IncidentType| -> f64 {
            if incident_type == Some(t) {
                1.0
            } else {
                0.0
            }
        };

        let competing = reference_station
            .and_then(|name| state.stations.get(name))
            .map(|s| (s.current_trains.len() as f64).min(10.0))
            .unwrap_or(0.0);

        let values = vec![
            competing,
            delay_sec,
            at.weekday().num_days_from_monday() as f64,
            delay_category,
            train.current_speed_kmh,
            at.hour() as f64,
            one_hot(IncidentType::Fire),
            one_hot(IncidentType::Maintenance),
            one_hot(IncidentType::Other),
            one_hot(IncidentType::PoliceIntervention),
            one_hot(IncidentType::Technical),
            one_hot(IncidentType::Trespasser),
            one_hot(IncidentType::Weather),
            hub,
            if PEAK_HOURS.contains(&at.hour()) { 1.0 } else { 0.0 },
            if at.weekday().num_days_from_monday() >= 5 { 1.0 } else { 0.0 },
            state.average_delay_seconds() / 60.0,
            train.progress_on_edge,
            station_hash,
        ];
        debug_assert_eq!(values.len(), FEATURE_ORDER.len());
        FeatureVector { values }
    }

    /// Station the prediction is anchored to: where the train is, or the
    /// next stop while it is moving.
    fn reference_station(train: &Train) -> Option<&str> {
        match train.current_position_type {
            PositionType::Station => train.current_station.as_deref(),
            PositionType::Edge => train
                .route
                .get(train.route_index)
                .map(|s| s.station_name.as_str()),
            PositionType::Unknown => None,
        }
    }

    /// Type of the most severe incident at the train's location, if any.
    fn local_incident_type(train: &Train, state: &NetworkState) -> Option<IncidentType> {
        let incidents: Option<&Vec<Incident>> = match train.current_position_type {
            PositionType::Station => train
                .current_station
                .as_deref()
                .and_then(|id| state.stations.get(id))
                .map(|s| &s.active_incidents),
            PositionType::Edge => train
                .current_edge
                .as_deref()
                .and_then(|id| state.edges.get(id))
                .map(|e| &e.active_incidents),
            PositionType::Unknown => None,
        };
        incidents.and_then(|list| {
            list.iter()
                .max_by(|a, b| a.severity.total_cmp(&b.severity))
                .map(|i| i.incident_type)
        })
    }
}

impl Default for FeatureEngine {
    fn default() -> Self {
        Self::new()
    }
}
