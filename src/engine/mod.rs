use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{PredictionSettings, SimulationSettings};
use crate::detection::{DetectionEngine, DetectionStatistics};
use crate::error::CoreResult;
use crate::models::*;
use crate::prediction::{ConflictPrediction, Predictor, RiskBucket};
use crate::sim::{Scenario, SimulationConfig, Simulator, TickChanges};
use crate::state::StateTracker;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewMetadata {
    pub timestamp: DateTime<Utc>,
    pub tick_number: u32,
    pub simulation_time: DateTime<Utc>,
    pub total_trains: usize,
    pub active_trains: usize,
    pub total_detections: usize,
    pub total_predictions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainSummary {
    pub train_id: String,
    pub train_type: TrainType,
    pub status: TrainStatus,
    pub position_type: PositionType,
    pub current_station: Option<String>,
    pub current_edge: Option<String>,
    pub progress_on_edge: f64,
    pub current_speed_kmh: f64,
    pub delay_seconds: u32,
    pub risk: Option<RiskBucket>,
}

/// Full post-tick state exposed to consumers: this is the §6 conflict output
/// document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationStateView {
    pub metadata: ViewMetadata,
    pub predictions: Vec<ConflictPrediction>,
    pub detections: Vec<Conflict>,
    pub trains: Vec<TrainSummary>,
    pub statistics: DetectionStatistics,
    pub network_risk: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changes: Option<TickChanges>,
}

/// Wires the simulator, detection engine and predictor into the abstract
/// control surface. The simulator is the single writer per tick; detection
/// and prediction run strictly after the write window closes.
pub struct IntegrationEngine {
    raw_snapshot: serde_json::Value,
    simulator: Simulator,
    detection: DetectionEngine,
    predictor: Predictor,
    sim_settings: SimulationSettings,
    prediction_settings: PredictionSettings,
    last_view: SimulationStateView,
    last_continuous_run: Option<DateTime<Utc>>,
}

impl IntegrationEngine {
    pub fn new(
        raw_snapshot: serde_json::Value,
        sim_settings: SimulationSettings,
        prediction_settings: PredictionSettings,
    ) -> CoreResult<Self> {
        let simulator = build_simulator(&raw_snapshot, &sim_settings, None, None)?;
        let detection =
            DetectionEngine::new(prediction_settings.conflict_thresholds.clone());
        let predictor = Predictor::new(prediction_settings.clone());

        let mut engine = Self {
            raw_snapshot,
            simulator,
            detection,
            predictor,
            sim_settings,
            prediction_settings,
            last_view: empty_view(),
            last_continuous_run: None,
        };
        engine.last_view = engine.build_view(Vec::new(), Vec::new(), None);
        Ok(engine)
    }

    pub fn snapshot(&self) -> &serde_json::Value {
        &self.raw_snapshot
    }

    /// Swap in a patched snapshot (the Context Patcher's output) and restart
    /// the simulation from it. The patch happens between ticks; the running
    /// tick state is discarded.
    pub fn install_snapshot(&mut self, patched: serde_json::Value) -> CoreResult<()> {
        NetworkSnapshot::from_value(&patched)?;
        self.raw_snapshot = patched;
        self.start_simulation(None, None)
    }

    /// `start_simulation` RPC: reinitialize from the retained snapshot with
    /// an optional seed/scenario override.
    pub fn start_simulation(
        &mut self,
        seed: Option<u64>,
        scenario: Option<Scenario>,
    ) -> CoreResult<()> {
        self.simulator = build_simulator(&self.raw_snapshot, &self.sim_settings, seed, scenario)?;
        self.detection =
            DetectionEngine::new(self.prediction_settings.conflict_thresholds.clone());
        self.last_continuous_run = None;
        self.last_view = self.build_view(Vec::new(), Vec::new(), None);
        info!(
            scenario = self.simulator.config().scenario.as_str(),
            "simulation (re)initialized"
        );
        Ok(())
    }

    /// `tick` RPC: advance one tick, then run detection and triggered
    /// prediction on the settled state.
    pub fn tick(&mut self) -> &SimulationStateView {
        let changes = self.simulator.tick();

        let state = &self.simulator.tracker().state;
        let detections = self.detection.evaluate(state);

        // Smart triggers pick the trains worth scoring; the continuous
        // cadence sweeps everything active when it comes due.
        let now = state.current_time;
        let continuous_due = self
            .last_continuous_run
            .map(|last| {
                (now - last).num_seconds()
                    >= self.prediction_settings.continuous_interval_sec as i64
            })
            .unwrap_or(true);
        if continuous_due {
            self.last_continuous_run = Some(now);
        }

        // Triggered trains are scored on the near horizon; the periodic
        // sweep looks further out.
        let mut predictions = Vec::new();
        for train_id in self.simulator.active_train_ids() {
            let Some(train) = state.trains.get(train_id) else { continue };
            let triggered = self.predictor.should_predict(train, state);
            if triggered {
                predictions.push(self.predictor.predict(
                    train,
                    state,
                    self.prediction_settings.prediction_horizon_min,
                ));
            } else if continuous_due {
                predictions.push(self.predictor.predict(
                    train,
                    state,
                    self.prediction_settings.prediction_horizon_max,
                ));
            }
        }

        self.last_view = self.build_view(detections, predictions, Some(changes));
        &self.last_view
    }

    /// `get_state` RPC: last observed state without advancing.
    pub fn get_state(&self) -> &SimulationStateView {
        &self.last_view
    }

    /// `get_predictions_for(station)` RPC.
    pub fn predictions_for_station(&self, station: &str) -> Vec<ConflictPrediction> {
        self.last_view
            .predictions
            .iter()
            .filter(|p| p.predicted_location.as_deref() == Some(station))
            .cloned()
            .collect()
    }

    /// `get_predictions_for(region)` RPC.
    pub fn predictions_for_region(&self, region: &str) -> Vec<ConflictPrediction> {
        let state = &self.simulator.tracker().state;
        self.last_view
            .predictions
            .iter()
            .filter(|p| {
                p.predicted_location
                    .as_deref()
                    .and_then(|id| state.stations.get(id))
                    .map(|s| s.region.eq_ignore_ascii_case(region))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// `save_conflicts` RPC: persist the current view, returning the path.
    pub fn save_conflicts(&self, filename: Option<&str>) -> CoreResult<PathBuf> {
        let dir = Path::new(&self.sim_settings.conflict_output_dir);
        std::fs::create_dir_all(dir)?;
        let name = match filename {
            Some(name) => name.to_string(),
            None => format!("conflicts_tick_{}.json", self.last_view.metadata.tick_number),
        };
        let path = dir.join(name);
        let document = serde_json::to_string_pretty(&self.last_view)?;
        std::fs::write(&path, document)?;
        Ok(path)
    }

    pub fn simulator(&self) -> &Simulator {
        &self.simulator
    }

    pub fn detection_statistics(&self) -> &DetectionStatistics {
        self.detection.statistics()
    }

    fn build_view(
        &self,
        detections: Vec<Conflict>,
        predictions: Vec<ConflictPrediction>,
        changes: Option<TickChanges>,
    ) -> SimulationStateView {
        let state = &self.simulator.tracker().state;
        let active = self.simulator.active_train_ids();

        let trains: Vec<TrainSummary> = state
            .trains
            .values()
            .filter(|t| active.contains(&t.train_id))
            .map(|t| {
                let risk = predictions
                    .iter()
                    .find(|p| p.train_id == t.train_id)
                    .map(|p| p.risk);
                TrainSummary {
                    train_id: t.train_id.clone(),
                    train_type: t.train_type,
                    status: t.status,
                    position_type: t.current_position_type,
                    current_station: t.current_station.clone(),
                    current_edge: t.current_edge.clone(),
                    progress_on_edge: t.progress_on_edge,
                    current_speed_kmh: t.current_speed_kmh,
                    delay_seconds: t.delay_seconds,
                    risk,
                }
            })
            .collect();

        let network_risk = if predictions.is_empty() {
            0.0
        } else {
            predictions.iter().map(|p| p.probability).sum::<f64>() / predictions.len() as f64
        };

        SimulationStateView {
            metadata: ViewMetadata {
                timestamp: state.current_time,
                tick_number: self.simulator.tick_count(),
                simulation_time: state.current_time,
                total_trains: state.trains.len(),
                active_trains: active.len(),
                total_detections: detections.len(),
                total_predictions: predictions.len(),
            },
            predictions,
            detections,
            trains,
            statistics: self.detection.statistics().clone(),
            network_risk,
            changes,
        }
    }
}

fn build_simulator(
    raw_snapshot: &serde_json::Value,
    settings: &SimulationSettings,
    seed_override: Option<u64>,
    scenario_override: Option<Scenario>,
) -> CoreResult<Simulator> {
    let snapshot = NetworkSnapshot::from_value(raw_snapshot)?;
    let scenario = scenario_override.unwrap_or(settings.scenario);

    let mut config = SimulationConfig {
        tick_interval_seconds: settings.tick_interval_seconds,
        max_ticks: settings.max_ticks,
        scenario,
        random_seed: seed_override.or(settings.random_seed),
        delay_probability: settings.delay_probability,
        speed_variation: settings.speed_variation,
        train_spawn_rate: settings.train_spawn_rate,
        max_active_trains: settings.max_active_trains,
        max_delay_seconds: settings.max_delay_seconds,
        start_time: crate::sim::default_start_time(),
    };
    config.apply_scenario();

    let tracker = StateTracker::new(snapshot, config.start_time);
    let mut simulator = Simulator::new(tracker, config);
    simulator.initialize_trains(scenario.initial_train_count());
    Ok(simulator)
}

fn empty_view() -> SimulationStateView {
    SimulationStateView {
        metadata: ViewMetadata {
            timestamp: crate::sim::default_start_time(),
            tick_number: 0,
            simulation_time: crate::sim::default_start_time(),
            total_trains: 0,
            active_trains: 0,
            total_detections: 0,
            total_predictions: 0,
        },
        predictions: Vec::new(),
        detections: Vec::new(),
        trains: Vec::new(),
        statistics: DetectionStatistics::default(),
        network_risk: 0.0,
        changes: None,
    }
}

impl std::fmt::Debug for IntegrationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrationEngine")
            .field("tick", &self.simulator.tick_count())
            .field("scenario", &self.simulator.config().scenario)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConflictThresholds, PredictionSettings, SimulationSettings};
    use serde_json::json;

    fn snapshot() -> serde_json::Value {
        json!({
            "stations": [
                {"id": "MILANO CENTRALE", "region": "Lombardy", "max_trains_at_once": 3},
                {"id": "MILANO LAMBRATE", "region": "Lombardy", "max_trains_at_once": 3},
                {"id": "TREVIGLIO", "region": "Lombardy", "max_trains_at_once": 3}
            ],
            "rails": [
                {"source": "MILANO CENTRALE", "target": "MILANO LAMBRATE",
                 "distance_km": 5.0, "travel_time_min": 1.0, "capacity": 2,
                 "min_headway_sec": 120, "max_speed_kmh": 120.0},
                {"source": "MILANO LAMBRATE", "target": "TREVIGLIO",
                 "distance_km": 25.0, "travel_time_min": 2.0, "capacity": 2,
                 "min_headway_sec": 120, "max_speed_kmh": 140.0}
            ],
            "trains": [
                {"train_id": "REG_1", "train_type": "regional", "priority": 2,
                 "route": [{"station_name": "MILANO CENTRALE"},
                            {"station_name": "MILANO LAMBRATE"},
                            {"station_name": "TREVIGLIO"}]},
                {"train_id": "REG_2", "train_type": "regional", "priority": 1,
                 "route": [{"station_name": "TREVIGLIO"},
                            {"station_name": "MILANO LAMBRATE"}]}
            ]
        })
    }

    fn settings() -> (SimulationSettings, PredictionSettings) {
        (
            SimulationSettings {
                snapshot_path: String::new(),
                tick_interval_seconds: 10,
                max_ticks: 100,
                scenario: Scenario::Normal,
                random_seed: Some(42),
                delay_probability: 0.1,
                speed_variation: 0.2,
                train_spawn_rate: 0.3,
                max_active_trains: 50,
                max_delay_seconds: 600,
                conflict_output_dir: std::env::temp_dir()
                    .join("conflict-core-test")
                    .to_string_lossy()
                    .into_owned(),
            },
            PredictionSettings {
                model_artifact_path: None,
                prediction_horizon_min: 10,
                prediction_horizon_max: 30,
                trigger_delay_threshold_sec: 120,
                trigger_congestion_threshold: 0.8,
                continuous_interval_sec: 60,
                conflict_thresholds: ConflictThresholds::default(),
            },
        )
    }

    #[test]
    fn tick_produces_full_view() {
        let (sim, pred) = settings();
        let mut engine = IntegrationEngine::new(snapshot(), sim, pred).unwrap();
        let view = engine.tick();
        assert_eq!(view.metadata.tick_number, 1);
        assert_eq!(view.metadata.total_trains, 2);
        assert!(view.changes.is_some());
    }

    #[test]
    fn get_state_does_not_advance() {
        let (sim, pred) = settings();
        let mut engine = IntegrationEngine::new(snapshot(), sim, pred).unwrap();
        engine.tick();
        let before = engine.get_state().metadata.tick_number;
        let _ = engine.get_state();
        assert_eq!(engine.get_state().metadata.tick_number, before);
    }

    #[test]
    fn restart_resets_tick_counter() {
        let (sim, pred) = settings();
        let mut engine = IntegrationEngine::new(snapshot(), sim, pred).unwrap();
        engine.tick();
        engine.tick();
        engine.start_simulation(Some(7), Some(Scenario::RushHour)).unwrap();
        assert_eq!(engine.get_state().metadata.tick_number, 0);
        assert_eq!(engine.simulator().config().scenario, Scenario::RushHour);
    }

    #[test]
    fn save_conflicts_writes_document() {
        let (sim, pred) = settings();
        let mut engine = IntegrationEngine::new(snapshot(), sim, pred).unwrap();
        engine.tick();
        let path = engine.save_conflicts(Some("test_conflicts.json")).unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(doc.get("metadata").is_some());
        assert!(doc.get("predictions").is_some());
        assert!(doc.get("detections").is_some());
        assert!(doc.get("statistics").is_some());
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn bad_snapshot_fails_fast() {
        let (sim, pred) = settings();
        let result = IntegrationEngine::new(json!({"trains": []}), sim, pred);
        assert!(result.is_err());
    }

    #[test]
    fn install_snapshot_validates_before_restart() {
        let (sim, pred) = settings();
        let mut engine = IntegrationEngine::new(snapshot(), sim, pred).unwrap();
        assert!(engine.install_snapshot(json!({"nope": true})).is_err());
        assert!(engine.install_snapshot(snapshot()).is_ok());
    }
}
