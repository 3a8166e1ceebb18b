use super::*;
use crate::error::CoreError;
use geo::{HaversineDistance, Point};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Station {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub lat: f64,
    #[serde(default)]
    pub lon: f64,
    #[serde(default = "default_station_capacity")]
    pub max_trains_at_once: u32,
    #[serde(default)]
    pub blocking_behavior: BlockingBehavior,
    #[serde(default)]
    pub current_trains: Vec<String>,
    #[serde(default)]
    pub active_incidents: Vec<Incident>,
}

fn default_station_capacity() -> u32 {
    2
}

impl Station {
    pub fn is_over_capacity(&self) -> bool {
        self.current_trains.len() as u32 > self.max_trains_at_once
    }

    pub fn occupancy_ratio(&self) -> f64 {
        if self.max_trains_at_once == 0 {
            return 1.0;
        }
        self.current_trains.len() as f64 / self.max_trains_at_once as f64
    }

    pub fn has_blocking_incident(&self) -> bool {
        self.active_incidents.iter().any(|i| i.is_blocking)
    }
}

/// A directed or bidirectional track segment between two stations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rail {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub distance_km: f64,
    #[serde(default)]
    pub travel_time_min: f64,
    #[serde(default = "default_rail_capacity")]
    pub capacity: u32,
    #[serde(default)]
    pub current_load: u32,
    #[serde(default = "default_min_headway")]
    pub min_headway_sec: u32,
    #[serde(default = "default_max_speed")]
    pub max_speed_kmh: f64,
    #[serde(default)]
    pub direction: RailDirection,
    #[serde(default = "default_true")]
    pub reroutable: bool,
    #[serde(default)]
    pub priority_access: bool,
    #[serde(default)]
    pub risk_profile: RiskProfile,
    #[serde(default)]
    pub active_incidents: Vec<Incident>,
}

fn default_rail_capacity() -> u32 {
    2
}

fn default_min_headway() -> u32 {
    120
}

fn default_max_speed() -> f64 {
    100.0
}

fn default_true() -> bool {
    true
}

impl Rail {
    pub fn edge_id(&self) -> String {
        edge_key(&self.source, &self.target)
    }

    pub fn is_over_capacity(&self) -> bool {
        self.current_load > self.capacity
    }

    pub fn has_blocking_incident(&self) -> bool {
        self.active_incidents.iter().any(|i| i.is_blocking)
    }
}

/// Canonical edge identifier used as map key and conflict location.
pub fn edge_key(source: &str, target: &str) -> String {
    format!("{}->{}", source, target)
}

/// Typed view of the network snapshot JSON (`trains`, `stations`, `rails`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    pub trains: Vec<Train>,
    pub stations: Vec<Station>,
    pub rails: Vec<Rail>,
}

impl NetworkSnapshot {
    /// Parse and validate a raw snapshot document. Fails fast on schema
    /// problems so the simulation never starts half-initialized.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, CoreError> {
        for key in ["trains", "stations", "rails"] {
            if !value.get(key).map(|v| v.is_array()).unwrap_or(false) {
                return Err(CoreError::Snapshot(format!(
                    "missing or non-array top-level key `{}`",
                    key
                )));
            }
        }

        let mut snapshot: NetworkSnapshot = serde_json::from_value(value.clone())
            .map_err(|e| CoreError::Snapshot(e.to_string()))?;

        let mut seen = std::collections::BTreeSet::new();
        for station in &mut snapshot.stations {
            if station.id.is_empty() {
                return Err(CoreError::Snapshot("station with empty id".into()));
            }
            if !seen.insert(station.id.clone()) {
                return Err(CoreError::Snapshot(format!(
                    "duplicate station id `{}`",
                    station.id
                )));
            }
            if station.name.is_empty() {
                station.name = station.id.clone();
            }
        }

        for train in &snapshot.trains {
            if train.train_id.is_empty() {
                return Err(CoreError::Snapshot("train with empty train_id".into()));
            }
        }

        for rail in &mut snapshot.rails {
            if rail.source.is_empty() || rail.target.is_empty() {
                return Err(CoreError::Snapshot("rail with empty endpoint".into()));
            }
            // Segments without an explicit traversal time get one from
            // distance and line speed, floored at a minute.
            if rail.travel_time_min <= 0.0 {
                let speed = rail.max_speed_kmh.max(1.0);
                rail.travel_time_min = (rail.distance_km / speed * 60.0).max(1.0);
            }
        }

        snapshot.fill_route_distances();
        Ok(snapshot)
    }

    /// Fill in `distance_from_previous_km` for route stops that carry
    /// coordinates but no distance, using great-circle distance.
    fn fill_route_distances(&mut self) {
        for train in &mut self.trains {
            for i in 1..train.route.len() {
                if train.route[i].distance_from_previous_km > 0.0 {
                    continue;
                }
                let (prev, curr) = (&train.route[i - 1], &train.route[i]);
                if prev.lat == 0.0 && prev.lon == 0.0 {
                    continue;
                }
                if curr.lat == 0.0 && curr.lon == 0.0 {
                    continue;
                }
                let a = Point::new(prev.lon, prev.lat);
                let b = Point::new(curr.lon, curr.lat);
                train.route[i].distance_from_previous_km = a.haversine_distance(&b) / 1000.0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn snapshot_requires_top_level_keys() {
        let bad = json!({"trains": [], "stations": []});
        assert!(NetworkSnapshot::from_value(&bad).is_err());
    }

    #[test]
    fn snapshot_rejects_duplicate_stations() {
        let bad = json!({
            "trains": [],
            "rails": [],
            "stations": [
                {"id": "MILANO CENTRALE"},
                {"id": "MILANO CENTRALE"}
            ]
        });
        assert!(NetworkSnapshot::from_value(&bad).is_err());
    }

    #[test]
    fn travel_time_derived_when_missing() {
        let value = json!({
            "trains": [],
            "stations": [{"id": "A"}, {"id": "B"}],
            "rails": [
                {"source": "A", "target": "B", "distance_km": 50.0, "max_speed_kmh": 100.0}
            ]
        });
        let snapshot = NetworkSnapshot::from_value(&value).unwrap();
        assert!((snapshot.rails[0].travel_time_min - 30.0).abs() < 1e-9);
    }

    #[test]
    fn route_distances_filled_from_coordinates() {
        let value = json!({
            "stations": [{"id": "A"}, {"id": "B"}],
            "rails": [],
            "trains": [{
                "train_id": "T1",
                "route": [
                    {"station_name": "A", "lat": 45.4642, "lon": 9.19},
                    {"station_name": "B", "lat": 45.4842, "lon": 9.20}
                ]
            }]
        });
        let snapshot = NetworkSnapshot::from_value(&value).unwrap();
        let d = snapshot.trains[0].route[1].distance_from_previous_km;
        assert!(d > 1.0 && d < 5.0, "unexpected distance {}", d);
    }

    #[test]
    fn station_occupancy_helpers() {
        let mut station = Station {
            id: "MILANO CENTRALE".into(),
            name: "MILANO CENTRALE".into(),
            region: "Lombardy".into(),
            lat: 0.0,
            lon: 0.0,
            max_trains_at_once: 1,
            blocking_behavior: BlockingBehavior::Hard,
            current_trains: vec!["T1".into()],
            active_incidents: vec![],
        };
        assert!(!station.is_over_capacity());
        station.current_trains.push("T2".into());
        assert!(station.is_over_capacity());
        assert!((station.occupancy_ratio() - 2.0).abs() < f64::EPSILON);
    }
}
