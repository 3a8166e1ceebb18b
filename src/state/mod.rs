use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CoreError, CoreResult};
use crate::models::*;

/// One train entering an edge, kept for headway evaluation. The `(from, to)`
/// pair is the actual traversal direction, which may be the reverse of the
/// stored rail on bidirectional segments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeEntry {
    pub train_id: String,
    pub entered_at: DateTime<Utc>,
    pub from: String,
    pub to: String,
}

/// Live network state: the consistent store every other component reads.
/// Maps are ordered by key so per-tick iteration is deterministic for a
/// fixed snapshot.
#[derive(Debug, Clone)]
pub struct NetworkState {
    pub current_time: DateTime<Utc>,
    pub weather: Weather,
    pub stations: BTreeMap<String, Station>,
    pub edges: BTreeMap<String, Rail>,
    pub trains: BTreeMap<String, Train>,
    pub edge_entries: BTreeMap<String, Vec<EdgeEntry>>,
}

impl NetworkState {
    /// Resolve the stored edge for a traversal from `src` to `dst`,
    /// falling back to the reverse key when the rail is bidirectional.
    pub fn edge_key_for(&self, src: &str, dst: &str) -> Option<String> {
        let forward = edge_key(src, dst);
        if self.edges.contains_key(&forward) {
            return Some(forward);
        }
        let reverse = edge_key(dst, src);
        match self.edges.get(&reverse) {
            Some(rail) if rail.direction == RailDirection::Bidirectional => Some(reverse),
            _ => None,
        }
    }

    pub fn get_edge(&self, src: &str, dst: &str) -> Option<&Rail> {
        self.edge_key_for(src, dst)
            .and_then(|key| self.edges.get(&key))
    }

    pub fn average_delay_seconds(&self) -> f64 {
        let active: Vec<_> = self
            .trains
            .values()
            .filter(|t| t.current_position_type != PositionType::Unknown)
            .collect();
        if active.is_empty() {
            return 0.0;
        }
        active.iter().map(|t| t.delay_seconds as f64).sum::<f64>() / active.len() as f64
    }
}

/// Owns the live state and applies movement/weather/delay updates while
/// maintaining the data-model invariants. The tracker never evaluates rules.
#[derive(Debug)]
pub struct StateTracker {
    pub state: NetworkState,
}

impl StateTracker {
    pub fn new(snapshot: NetworkSnapshot, start_time: DateTime<Utc>) -> Self {
        let mut stations = BTreeMap::new();
        for station in snapshot.stations {
            stations.insert(station.id.clone(), station);
        }

        let mut edges = BTreeMap::new();
        for rail in snapshot.rails {
            edges.insert(rail.edge_id(), rail);
        }

        let mut trains = BTreeMap::new();
        for train in snapshot.trains {
            trains.insert(train.train_id.clone(), train);
        }

        Self {
            state: NetworkState {
                current_time: start_time,
                weather: Weather::Clear,
                stations,
                edges,
                trains,
                edge_entries: BTreeMap::new(),
            },
        }
    }

    pub fn update_time(&mut self, t: DateTime<Utc>) {
        self.state.current_time = t;
        self.prune_edge_entries();
    }

    pub fn update_weather(&mut self, weather: Weather) {
        self.state.weather = weather;
    }

    /// Move a train from its current station onto the edge toward `target`.
    /// Increments edge load, records the entry for headway evaluation and
    /// advances the route index to the stop being traveled to.
    pub fn train_departs_station(&mut self, train_id: &str, target: &str) -> CoreResult<()> {
        let (from, entered_at) = {
            let train = self
                .state
                .trains
                .get(train_id)
                .ok_or_else(|| CoreError::UnknownTrain(train_id.to_string()))?;
            let from = train
                .current_station
                .clone()
                .ok_or_else(|| CoreError::UnknownStation(format!("{} is not at a station", train_id)))?;
            (from, self.state.current_time)
        };

        let key = self
            .state
            .edge_key_for(&from, target)
            .ok_or_else(|| CoreError::UnknownEdge(edge_key(&from, target)))?;

        if let Some(station) = self.state.stations.get_mut(&from) {
            station.current_trains.retain(|id| id != train_id);
        }

        if let Some(rail) = self.state.edges.get_mut(&key) {
            rail.current_load += 1;
            if rail.is_over_capacity() {
                warn!(edge = %key, load = rail.current_load, capacity = rail.capacity,
                      "edge load exceeds capacity");
            }
        }

        self.state.edge_entries.entry(key.clone()).or_default().push(EdgeEntry {
            train_id: train_id.to_string(),
            entered_at,
            from: from.clone(),
            to: target.to_string(),
        });

        let train = self
            .state
            .trains
            .get_mut(train_id)
            .ok_or_else(|| CoreError::UnknownTrain(train_id.to_string()))?;
        train.current_station = None;
        train.current_edge = Some(key);
        train.current_position_type = PositionType::Edge;
        train.progress_on_edge = 0.0;
        train.route_index += 1;
        Ok(())
    }

    /// Release the train's current edge: decrement load and clear the
    /// back-reference. The occupation window of the edge ends here.
    pub fn train_exits_edge(&mut self, train_id: &str) -> CoreResult<()> {
        let train = self
            .state
            .trains
            .get_mut(train_id)
            .ok_or_else(|| CoreError::UnknownTrain(train_id.to_string()))?;
        if let Some(key) = train.current_edge.take() {
            train.progress_on_edge = 0.0;
            if let Some(rail) = self.state.edges.get_mut(&key) {
                rail.current_load = rail.current_load.saturating_sub(1);
            }
        }
        Ok(())
    }

    /// Append the train to the station's occupants. Overflow is permitted
    /// (the detection engine flags it) but logged here as the invariant
    /// violation it is.
    pub fn train_arrives_at_station(&mut self, train_id: &str, station_id: &str) -> CoreResult<()> {
        let station = self
            .state
            .stations
            .get_mut(station_id)
            .ok_or_else(|| CoreError::UnknownStation(station_id.to_string()))?;
        if !station.current_trains.iter().any(|id| id == train_id) {
            station.current_trains.push(train_id.to_string());
        }
        if station.is_over_capacity() {
            warn!(station = %station_id,
                  occupants = station.current_trains.len(),
                  capacity = station.max_trains_at_once,
                  "station occupancy exceeds capacity");
        }

        let train = self
            .state
            .trains
            .get_mut(train_id)
            .ok_or_else(|| CoreError::UnknownTrain(train_id.to_string()))?;
        train.current_station = Some(station_id.to_string());
        train.current_edge = None;
        train.current_position_type = PositionType::Station;
        train.progress_on_edge = 0.0;
        train.current_speed_kmh = 0.0;
        Ok(())
    }

    pub fn update_train_position_on_edge(&mut self, train_id: &str, progress: f64) -> CoreResult<()> {
        let train = self
            .state
            .trains
            .get_mut(train_id)
            .ok_or_else(|| CoreError::UnknownTrain(train_id.to_string()))?;
        train.progress_on_edge = progress.clamp(0.0, 1.0);
        Ok(())
    }

    pub fn update_train_speed(&mut self, train_id: &str, kmh: f64) -> CoreResult<()> {
        let train = self
            .state
            .trains
            .get_mut(train_id)
            .ok_or_else(|| CoreError::UnknownTrain(train_id.to_string()))?;
        train.current_speed_kmh = kmh.max(0.0);
        Ok(())
    }

    /// Set the train's accumulated delay to an absolute value.
    pub fn update_train_delay(&mut self, train_id: &str, seconds: u32) -> CoreResult<()> {
        let train = self
            .state
            .trains
            .get_mut(train_id)
            .ok_or_else(|| CoreError::UnknownTrain(train_id.to_string()))?;
        train.delay_seconds = seconds;
        if train.status != TrainStatus::Holding && train.status != TrainStatus::Stopped {
            train.status = if seconds > 0 {
                TrainStatus::Delayed
            } else {
                TrainStatus::OnTime
            };
        }
        Ok(())
    }

    pub fn set_train_holding(&mut self, train_id: &str, holding: bool) -> CoreResult<()> {
        let train = self
            .state
            .trains
            .get_mut(train_id)
            .ok_or_else(|| CoreError::UnknownTrain(train_id.to_string()))?;
        train.status = if holding {
            TrainStatus::Holding
        } else if train.delay_seconds > 0 {
            TrainStatus::Delayed
        } else {
            TrainStatus::OnTime
        };
        Ok(())
    }

    /// Drop edge entries too old to matter for any headway check.
    fn prune_edge_entries(&mut self) {
        let now = self.state.current_time;
        for (key, entries) in self.state.edge_entries.iter_mut() {
            let window = self
                .state
                .edges
                .get(key)
                .map(|r| 4 * r.min_headway_sec as i64)
                .unwrap_or(1800);
            entries.retain(|e| now - e.entered_at <= Duration::seconds(window));
        }
    }
}
