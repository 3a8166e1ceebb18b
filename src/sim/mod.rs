use std::collections::BTreeMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::*;
use crate::state::StateTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    Normal,
    RushHour,
    Disruption,
    StressTest,
}

impl Scenario {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scenario::Normal => "normal",
            Scenario::RushHour => "rush_hour",
            Scenario::Disruption => "disruption",
            Scenario::StressTest => "stress_test",
        }
    }

    /// Trains placed at their route origins when a run starts.
    pub fn initial_train_count(&self) -> usize {
        match self {
            Scenario::Normal => 15,
            Scenario::RushHour => 30,
            Scenario::Disruption => 20,
            Scenario::StressTest => 40,
        }
    }
}

impl Default for Scenario {
    fn default() -> Self {
        Scenario::Normal
    }
}

impl std::str::FromStr for Scenario {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Scenario::Normal),
            "rush_hour" => Ok(Scenario::RushHour),
            "disruption" => Ok(Scenario::Disruption),
            "stress_test" => Ok(Scenario::StressTest),
            other => Err(format!("unknown scenario `{}`", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub tick_interval_seconds: u64,
    pub max_ticks: u32,
    pub scenario: Scenario,
    pub random_seed: Option<u64>,

    // Probability settings, all in [0, 1].
    pub delay_probability: f64,
    pub speed_variation: f64,
    pub train_spawn_rate: f64,

    // Limits
    pub max_active_trains: usize,
    pub max_delay_seconds: u32,

    /// Fixed simulation epoch. Never wall clock, so change records are
    /// reproducible for a given seed.
    pub start_time: DateTime<Utc>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            tick_interval_seconds: 10,
            max_ticks: 100,
            scenario: Scenario::Normal,
            random_seed: None,
            delay_probability: 0.1,
            speed_variation: 0.2,
            train_spawn_rate: 0.3,
            max_active_trains: 50,
            max_delay_seconds: 600,
            start_time: default_start_time(),
        }
    }
}

pub fn default_start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 6, 0, 0).unwrap()
}

impl SimulationConfig {
    pub fn for_scenario(scenario: Scenario, max_ticks: u32, random_seed: Option<u64>) -> Self {
        let mut config = Self {
            scenario,
            max_ticks,
            random_seed,
            ..Self::default()
        };
        config.apply_scenario();
        config
    }

    /// Adjust probabilities and limits to the scenario baselines.
    pub fn apply_scenario(&mut self) {
        match self.scenario {
            Scenario::Normal => {}
            Scenario::RushHour => {
                self.train_spawn_rate = 0.6;
                self.delay_probability = 0.2;
                self.max_active_trains = 80;
            }
            Scenario::Disruption => {
                self.delay_probability = 0.4;
                self.max_delay_seconds = 1200;
            }
            Scenario::StressTest => {
                self.train_spawn_rate = 0.8;
                self.max_active_trains = 100;
                self.delay_probability = 0.3;
            }
        }
    }

    /// Scenario baseline for incident spawning, before weather coupling.
    pub fn base_incident_probability(&self) -> f64 {
        match self.scenario {
            Scenario::Normal => 0.05,
            Scenario::RushHour => 0.08,
            Scenario::Disruption => 0.30,
            Scenario::StressTest => 0.15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepartureChange {
    pub train: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArrivalChange {
    pub train: String,
    pub station: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayChange {
    pub train: String,
    pub delay_seconds: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeedChange {
    pub train: String,
    pub speed: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentChange {
    pub id: String,
    pub location: String,
}

/// Everything a single tick changed, in step order. The serialized form of
/// this record is the determinism contract: same snapshot + scenario + seed
/// produces the identical sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickChanges {
    pub tick: u32,
    pub time: DateTime<Utc>,
    pub departures: Vec<DepartureChange>,
    pub arrivals: Vec<ArrivalChange>,
    pub delays_added: Vec<DelayChange>,
    pub speed_changes: Vec<SpeedChange>,
    pub trains_spawned: Vec<String>,
    pub incidents_started: Vec<IncidentChange>,
    pub incidents_resolved: Vec<String>,
    pub weather: Weather,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationSummary {
    pub ticks_completed: u32,
    pub active_trains: usize,
    pub completed_trains: usize,
    pub current_time: DateTime<Utc>,
    pub scenario: Scenario,
}

#[derive(Debug, Clone)]
enum IncidentSite {
    Edge(String),
    Station(String),
}

/// Drives the live state forward one tick at a time. Holds the only mutable
/// reference to the tracker during a tick; detection and prediction read the
/// settled state afterwards.
pub struct Simulator {
    tracker: StateTracker,
    config: SimulationConfig,
    rng: SmallRng,
    current_time: DateTime<Utc>,
    tick_count: u32,
    active_trains: Vec<String>,
    completed_trains: Vec<String>,
    incident_sites: BTreeMap<String, IncidentSite>,
}

impl Simulator {
    pub fn new(tracker: StateTracker, mut config: SimulationConfig) -> Self {
        config.apply_scenario();
        let seed = config.random_seed.unwrap_or(0x5EED);
        let current_time = config.start_time;
        Self {
            tracker,
            rng: SmallRng::seed_from_u64(seed),
            current_time,
            tick_count: 0,
            active_trains: Vec::new(),
            completed_trains: Vec::new(),
            incident_sites: BTreeMap::new(),
            config,
        }
    }

    pub fn tracker(&self) -> &StateTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut StateTracker {
        &mut self.tracker
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn tick_count(&self) -> u32 {
        self.tick_count
    }

    pub fn current_time(&self) -> DateTime<Utc> {
        self.current_time
    }

    pub fn active_train_ids(&self) -> &[String] {
        &self.active_trains
    }

    /// Place up to `count` roster trains at their route origins.
    pub fn initialize_trains(&mut self, count: usize) {
        let mut candidates: Vec<String> = self
            .tracker
            .state
            .trains
            .values()
            .filter(|t| !t.route.is_empty())
            .map(|t| t.train_id.clone())
            .collect();
        candidates.shuffle(&mut self.rng);
        candidates.truncate(count);

        for train_id in candidates {
            self.activate_train(&train_id);
        }
        debug!(active = self.active_trains.len(), "initialized trains");
    }

    fn activate_train(&mut self, train_id: &str) {
        let first_station = {
            let train = match self.tracker.state.trains.get_mut(train_id) {
                Some(t) => t,
                None => return,
            };
            train.place_at_origin();
            match &train.current_station {
                Some(s) => s.clone(),
                None => return,
            }
        };
        if self
            .tracker
            .train_arrives_at_station(train_id, &first_station)
            .is_err()
        {
            warn!(train = %train_id, station = %first_station, "spawn station missing from network");
            return;
        }
        // Arrival bookkeeping leaves status untouched; a fresh spawn is on time.
        if let Some(train) = self.tracker.state.trains.get_mut(train_id) {
            train.status = TrainStatus::OnTime;
        }
        self.active_trains.push(train_id.to_string());
    }

    /// Advance the simulation by one tick. The step order is contractual:
    /// clock, weather, incident lifecycle, incident spawn, train movement,
    /// delay injection, train spawn.
    pub fn tick(&mut self) -> TickChanges {
        self.tick_count += 1;
        self.current_time =
            self.current_time + Duration::seconds(self.config.tick_interval_seconds as i64);
        self.tracker.update_time(self.current_time);

        let mut changes = TickChanges {
            tick: self.tick_count,
            time: self.current_time,
            departures: Vec::new(),
            arrivals: Vec::new(),
            delays_added: Vec::new(),
            speed_changes: Vec::new(),
            trains_spawned: Vec::new(),
            incidents_started: Vec::new(),
            incidents_resolved: Vec::new(),
            weather: self.tracker.state.weather,
        };

        self.update_weather(&mut changes);
        self.update_incidents(&mut changes);
        self.maybe_spawn_incident(&mut changes);

        for train_id in self.active_trains.clone() {
            let position = match self.tracker.state.trains.get(&train_id) {
                Some(t) => t.current_position_type,
                None => continue,
            };
            match position {
                PositionType::Station => self.step_station_train(&train_id, &mut changes),
                PositionType::Edge => self.step_edge_train(&train_id, &mut changes),
                PositionType::Unknown => {}
            }
        }

        self.introduce_random_delays(&mut changes);
        self.maybe_spawn_trains(&mut changes);

        changes
    }

    fn update_weather(&mut self, changes: &mut TickChanges) {
        if self.rng.gen::<f64>() > 0.05 {
            return;
        }
        const WEATHERS: [Weather; 5] = [
            Weather::Clear,
            Weather::Rain,
            Weather::Snow,
            Weather::Fog,
            Weather::Storm,
        ];
        let new_weather = *WEATHERS.choose(&mut self.rng).unwrap();
        if new_weather != self.tracker.state.weather {
            self.tracker.update_weather(new_weather);
            changes.weather = new_weather;
        }
    }

    /// Incident probability for this tick: scenario baseline, ×1.5 while the
    /// weather is severe.
    fn effective_incident_probability(&self) -> f64 {
        let base = self.config.base_incident_probability();
        if self.tracker.state.weather.is_severe() {
            base * 1.5
        } else {
            base
        }
    }

    fn update_incidents(&mut self, changes: &mut TickChanges) {
        let mut to_resolve = Vec::new();
        for (incident_id, site) in &self.incident_sites {
            let start_time = match site {
                IncidentSite::Edge(key) => self
                    .tracker
                    .state
                    .edges
                    .get(key)
                    .and_then(|e| e.active_incidents.iter().find(|i| &i.incident_id == incident_id))
                    .map(|i| i.start_time),
                IncidentSite::Station(id) => self
                    .tracker
                    .state
                    .stations
                    .get(id)
                    .and_then(|s| s.active_incidents.iter().find(|i| &i.incident_id == incident_id))
                    .map(|i| i.start_time),
            };
            let Some(start_time) = start_time else {
                to_resolve.push(incident_id.clone());
                continue;
            };
            let age_ticks = (self.current_time - start_time).num_seconds().max(0) as f64
                / self.config.tick_interval_seconds as f64;
            let resolve_chance = 0.05 + age_ticks * 0.01;
            if self.rng.gen::<f64>() < resolve_chance {
                to_resolve.push(incident_id.clone());
            }
        }

        for incident_id in to_resolve {
            self.incident_sites.remove(&incident_id);
            for rail in self.tracker.state.edges.values_mut() {
                rail.active_incidents.retain(|i| i.incident_id != incident_id);
            }
            for station in self.tracker.state.stations.values_mut() {
                station.active_incidents.retain(|i| i.incident_id != incident_id);
            }
            changes.incidents_resolved.push(incident_id);
        }
    }

    fn maybe_spawn_incident(&mut self, changes: &mut TickChanges) {
        if self.rng.gen::<f64>() > self.effective_incident_probability() {
            return;
        }

        let on_edge = self.rng.gen::<f64>() < 0.7;
        let incident_type = *IncidentType::ALL.choose(&mut self.rng).unwrap();
        let severity = self.rng.gen_range(20.0..95.0);
        let incident = Incident::new(
            format!("INC_{}_{}", self.tick_count, self.rng.gen_range(100..1000)),
            incident_type,
            severity,
            self.current_time,
        );

        if on_edge && !self.tracker.state.edges.is_empty() {
            let keys: Vec<String> = self.tracker.state.edges.keys().cloned().collect();
            let key = keys.choose(&mut self.rng).unwrap().clone();
            self.incident_sites
                .insert(incident.incident_id.clone(), IncidentSite::Edge(key.clone()));
            changes.incidents_started.push(IncidentChange {
                id: incident.incident_id.clone(),
                location: key.clone(),
            });
            if let Some(rail) = self.tracker.state.edges.get_mut(&key) {
                rail.active_incidents.push(incident);
            }
        } else if !self.tracker.state.stations.is_empty() {
            let ids: Vec<String> = self.tracker.state.stations.keys().cloned().collect();
            let id = ids.choose(&mut self.rng).unwrap().clone();
            self.incident_sites
                .insert(incident.incident_id.clone(), IncidentSite::Station(id.clone()));
            changes.incidents_started.push(IncidentChange {
                id: incident.incident_id.clone(),
                location: id.clone(),
            });
            if let Some(station) = self.tracker.state.stations.get_mut(&id) {
                station.active_incidents.push(incident);
            }
        }
    }

    fn should_train_depart(&mut self, train_id: &str) -> bool {
        let train = &self.tracker.state.trains[train_id];
        if train.next_station().is_none() {
            return false;
        }
        let base_chance = 0.3 + self.config.train_spawn_rate * 0.3;
        let priority_bonus = train.priority as f64 * 0.05;
        self.rng.gen::<f64>() < base_chance + priority_bonus
    }

    fn step_station_train(&mut self, train_id: &str, changes: &mut TickChanges) {
        if !self.should_train_depart(train_id) {
            return;
        }
        let (from, next) = {
            let train = &self.tracker.state.trains[train_id];
            let Some(from) = train.current_station.clone() else { return };
            let Some(next) = train.next_station().map(str::to_string) else { return };
            (from, next)
        };
        // A blocking incident on the outgoing edge holds the train in place.
        if let Some(edge) = self.tracker.state.get_edge(&from, &next) {
            if edge.has_blocking_incident() {
                return;
            }
        } else {
            return;
        }
        if self.tracker.train_departs_station(train_id, &next).is_ok() {
            changes.departures.push(DepartureChange {
                train: train_id.to_string(),
                from,
                to: next,
            });
        }
    }

    fn step_edge_train(&mut self, train_id: &str, changes: &mut TickChanges) {
        let (edge_key, progress, delay_seconds, current_speed) = {
            let train = &self.tracker.state.trains[train_id];
            let Some(key) = train.current_edge.clone() else { return };
            (
                key,
                train.progress_on_edge,
                train.delay_seconds,
                train.current_speed_kmh,
            )
        };
        let Some(rail) = self.tracker.state.edges.get(&edge_key) else { return };
        let (blocked, max_speed, travel_time_min) =
            (rail.has_blocking_incident(), rail.max_speed_kmh, rail.travel_time_min);

        if blocked {
            if current_speed > 0.0 {
                let _ = self.tracker.update_train_speed(train_id, 0.0);
                changes.speed_changes.push(SpeedChange {
                    train: train_id.to_string(),
                    speed: 0.0,
                });
            }
            return;
        }

        let variation = 1.0 + (self.rng.gen::<f64>() - 0.5) * self.config.speed_variation * 2.0;
        let weather_factor = self.tracker.state.weather.speed_factor();
        let delay_drag = 1.0 - delay_seconds as f64 / 3600.0;
        let actual_speed = (max_speed * variation * weather_factor * delay_drag)
            .clamp(20.0_f64.min(max_speed), max_speed);

        if (current_speed - actual_speed).abs() > 5.0 {
            let _ = self.tracker.update_train_speed(train_id, actual_speed);
            changes.speed_changes.push(SpeedChange {
                train: train_id.to_string(),
                speed: actual_speed,
            });
        }

        let progress_per_tick =
            self.config.tick_interval_seconds as f64 / (travel_time_min * 60.0);
        let new_progress = progress + progress_per_tick;

        if new_progress >= 1.0 {
            self.train_arrives(train_id, changes);
        } else {
            let _ = self.tracker.update_train_position_on_edge(train_id, new_progress);
        }
    }

    fn train_arrives(&mut self, train_id: &str, changes: &mut TickChanges) {
        let (route_index, route_len, station) = {
            let train = &self.tracker.state.trains[train_id];
            let station = train
                .route
                .get(train.route_index)
                .map(|s| s.station_name.clone());
            (train.route_index, train.route.len(), station)
        };
        let Some(station) = station else {
            self.complete_train(train_id);
            return;
        };

        let _ = self.tracker.train_exits_edge(train_id);
        if self.tracker.train_arrives_at_station(train_id, &station).is_ok() {
            changes.arrivals.push(ArrivalChange {
                train: train_id.to_string(),
                station,
            });
        }

        if route_index + 1 >= route_len {
            self.complete_train(train_id);
        }
    }

    fn complete_train(&mut self, train_id: &str) {
        self.active_trains.retain(|id| id != train_id);
        self.completed_trains.push(train_id.to_string());
        if let Some(train) = self.tracker.state.trains.get_mut(train_id) {
            train.status = TrainStatus::Stopped;
        }
    }

    fn introduce_random_delays(&mut self, changes: &mut TickChanges) {
        if self.rng.gen::<f64>() > self.config.delay_probability {
            return;
        }
        if self.active_trains.is_empty() {
            return;
        }

        let idx = self.rng.gen_range(0..self.active_trains.len());
        let train_id = self.active_trains[idx].clone();
        let Some(train) = self.tracker.state.trains.get(&train_id) else { return };

        let delay_increase = self.rng.gen_range(30..=(self.config.max_delay_seconds / 3).max(30));
        let new_delay = (train.delay_seconds + delay_increase).min(self.config.max_delay_seconds);
        let at_station = train.current_position_type == PositionType::Station;

        let _ = self.tracker.update_train_delay(&train_id, new_delay);
        changes.delays_added.push(DelayChange {
            train: train_id.clone(),
            delay_seconds: new_delay,
        });

        if at_station && new_delay > 180 && self.rng.gen::<f64>() < 0.3 {
            let _ = self.tracker.set_train_holding(&train_id, true);
        }
    }

    fn maybe_spawn_trains(&mut self, changes: &mut TickChanges) {
        if self.active_trains.len() >= self.config.max_active_trains {
            return;
        }
        if self.rng.gen::<f64>() > self.config.train_spawn_rate * 0.2 {
            return;
        }

        let inactive: Vec<String> = self
            .tracker
            .state
            .trains
            .values()
            .filter(|t| !t.route.is_empty())
            .map(|t| t.train_id.clone())
            .filter(|id| !self.active_trains.contains(id) && !self.completed_trains.contains(id))
            .collect();
        let Some(train_id) = inactive.choose(&mut self.rng).cloned() else { return };

        self.activate_train(&train_id);
        changes.trains_spawned.push(train_id);
    }

    /// Run to `max_ticks`, collecting every change record.
    pub fn run(&mut self) -> Vec<TickChanges> {
        let mut all = Vec::new();
        while self.tick_count < self.config.max_ticks {
            all.push(self.tick());
        }
        all
    }

    /// Paced variant: sleep `tick_real_seconds` between ticks and keep the
    /// loop alive across observer failures.
    pub async fn run_realtime<F>(&mut self, tick_real_seconds: u64, mut callback: F)
    where
        F: FnMut(&TickChanges) -> anyhow::Result<()>,
    {
        while self.tick_count < self.config.max_ticks {
            let changes = self.tick();
            if let Err(e) = callback(&changes) {
                warn!(error = %e, tick = changes.tick, "tick observer failed");
            }
            tokio::time::sleep(std::time::Duration::from_secs(tick_real_seconds)).await;
        }
    }

    pub fn summary(&self) -> SimulationSummary {
        SimulationSummary {
            ticks_completed: self.tick_count,
            active_trains: self.active_trains.len(),
            completed_trains: self.completed_trains.len(),
            current_time: self.current_time,
            scenario: self.config.scenario,
        }
    }
}
