use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ConflictThresholds;
use crate::error::CoreResult;
use crate::models::*;
use crate::state::NetworkState;

/// Cumulative counters over everything the engine has emitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectionStatistics {
    pub total: u64,
    pub by_type: BTreeMap<String, u64>,
    pub by_severity: BTreeMap<String, u64>,
}

impl DetectionStatistics {
    fn record(&mut self, conflict: &Conflict) {
        self.total += 1;
        *self
            .by_type
            .entry(conflict.conflict_type.as_str().to_string())
            .or_default() += 1;
        let severity = match conflict.severity {
            ConflictSeverity::Low => "low",
            ConflictSeverity::Medium => "medium",
            ConflictSeverity::High => "high",
            ConflictSeverity::Critical => "critical",
        };
        *self.by_severity.entry(severity.to_string()).or_default() += 1;
    }
}

/// Optional conflict sink: console line and/or JSONL file append.
#[derive(Debug, Default)]
pub struct ConflictEmitter {
    pub enable_console: bool,
    pub jsonl_path: Option<PathBuf>,
}

impl ConflictEmitter {
    pub fn new(enable_console: bool, jsonl_path: Option<PathBuf>) -> Self {
        Self {
            enable_console,
            jsonl_path,
        }
    }

    fn emit(&self, conflict: &Conflict) {
        if self.enable_console {
            println!(
                "[CONFLICT] {} | {:?} at {} | trains: {}",
                conflict.conflict_type.as_str(),
                conflict.severity,
                conflict.location,
                conflict.involved_trains.join(", ")
            );
        }
        if let Some(path) = &self.jsonl_path {
            let result = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .and_then(|mut f| {
                    let line = serde_json::to_string(conflict).unwrap_or_default();
                    writeln!(f, "{}", line)
                });
            if let Err(e) = result {
                warn!(error = %e, path = %path.display(), "failed to append conflict");
            }
        }
    }
}

/// Evaluates the fixed deterministic rule set against the post-tick state.
/// A failing rule is logged and skipped; no rule failure halts the tick.
pub struct DetectionEngine {
    thresholds: ConflictThresholds,
    emitter: ConflictEmitter,
    statistics: DetectionStatistics,
    last_tick_conflicts: Vec<Conflict>,
}

type RuleFn = fn(&DetectionEngine, &NetworkState, DateTime<Utc>) -> CoreResult<Vec<Conflict>>;

const RULES: [(&str, RuleFn); 5] = [
    ("station_overcapacity", DetectionEngine::rule_station_overcapacity),
    ("edge_overcapacity", DetectionEngine::rule_edge_overcapacity),
    ("headway_violation", DetectionEngine::rule_headway_violation),
    ("blocking_incident", DetectionEngine::rule_blocking_incident),
    ("excessive_delay", DetectionEngine::rule_excessive_delay),
];

impl DetectionEngine {
    pub fn new(thresholds: ConflictThresholds) -> Self {
        Self {
            thresholds,
            emitter: ConflictEmitter::default(),
            statistics: DetectionStatistics::default(),
            last_tick_conflicts: Vec::new(),
        }
    }

    pub fn with_emitter(mut self, emitter: ConflictEmitter) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn statistics(&self) -> &DetectionStatistics {
        &self.statistics
    }

    pub fn last_tick_conflicts(&self) -> &[Conflict] {
        &self.last_tick_conflicts
    }

    /// Run every rule against the settled state. Conflicts are deduplicated
    /// within the tick by `(type, location, sorted involved trains)`;
    /// re-emissions on later ticks are allowed and counted.
    pub fn evaluate(&mut self, state: &NetworkState) -> Vec<Conflict> {
        let now = state.current_time;
        let mut conflicts = Vec::new();
        let mut seen = BTreeSet::new();

        for (rule_name, rule) in RULES {
            match rule(self, state, now) {
                Ok(found) => {
                    for conflict in found {
                        if seen.insert(conflict.dedup_key()) {
                            conflicts.push(conflict);
                        }
                    }
                }
                Err(e) => {
                    warn!(rule = rule_name, error = %e, "detection rule failed; skipping");
                }
            }
        }

        for conflict in &conflicts {
            self.statistics.record(conflict);
            self.emitter.emit(conflict);
        }
        debug!(count = conflicts.len(), "detection pass complete");
        self.last_tick_conflicts = conflicts.clone();
        conflicts
    }

    fn rule_station_overcapacity(
        &self,
        state: &NetworkState,
        now: DateTime<Utc>,
    ) -> CoreResult<Vec<Conflict>> {
        let mut conflicts = Vec::new();
        for station in state.stations.values() {
            if !station.is_over_capacity() {
                continue;
            }
            let severity = match station.blocking_behavior {
                BlockingBehavior::Hard => ConflictSeverity::Critical,
                BlockingBehavior::Soft => ConflictSeverity::High,
            };
            let explanation = format!(
                "Station {} holds {} trains but allows at most {} ({:?} blocking)",
                station.name,
                station.current_trains.len(),
                station.max_trains_at_once,
                station.blocking_behavior
            );
            conflicts.push(
                Conflict::detected(
                    ConflictType::StationOvercapacity,
                    severity,
                    station.id.clone(),
                    LocationType::Station,
                    station.current_trains.clone(),
                    explanation,
                    now,
                    "station_overcapacity",
                )
                .with_suggestions(vec![
                    "Hold inbound trains at their previous stations".to_string(),
                    "Expedite departures of lowest-priority occupants".to_string(),
                ]),
            );
        }
        Ok(conflicts)
    }

    fn rule_edge_overcapacity(
        &self,
        state: &NetworkState,
        now: DateTime<Utc>,
    ) -> CoreResult<Vec<Conflict>> {
        let mut conflicts = Vec::new();
        for (key, rail) in &state.edges {
            if !rail.is_over_capacity() {
                continue;
            }
            let involved = trains_on_edge(state, key);
            let explanation = format!(
                "Edge {} carries {} trains over capacity {}",
                key, rail.current_load, rail.capacity
            );
            conflicts.push(
                Conflict::detected(
                    ConflictType::EdgeOvercapacity,
                    ConflictSeverity::High,
                    key.clone(),
                    LocationType::Edge,
                    involved,
                    explanation,
                    now,
                    "edge_overcapacity",
                )
                .with_suggestions(vec![
                    "Delay further entries onto the segment".to_string(),
                ]),
            );
        }
        Ok(conflicts)
    }

    /// One conflict per edge: the most recent pair of same-direction entries
    /// separated by less than the segment's minimum headway.
    fn rule_headway_violation(
        &self,
        state: &NetworkState,
        now: DateTime<Utc>,
    ) -> CoreResult<Vec<Conflict>> {
        let mut conflicts = Vec::new();
        for (key, entries) in &state.edge_entries {
            let Some(rail) = state.edges.get(key) else { continue };
            let headway = rail.min_headway_sec as i64;

            let mut by_direction: BTreeMap<(String, String), Vec<&crate::state::EdgeEntry>> =
                BTreeMap::new();
            for entry in entries {
                by_direction
                    .entry((entry.from.clone(), entry.to.clone()))
                    .or_default()
                    .push(entry);
            }

            let mut worst: Option<(i64, &crate::state::EdgeEntry, &crate::state::EdgeEntry)> = None;
            for group in by_direction.values_mut() {
                group.sort_by_key(|e| e.entered_at);
                for pair in group.windows(2) {
                    let gap = (pair[1].entered_at - pair[0].entered_at).num_seconds();
                    if gap < headway {
                        let newer = worst
                            .as_ref()
                            .map(|(_, _, b)| pair[1].entered_at > b.entered_at)
                            .unwrap_or(true);
                        if newer {
                            worst = Some((gap, pair[0], pair[1]));
                        }
                    }
                }
            }

            if let Some((gap, first, second)) = worst {
                let explanation = format!(
                    "Trains {} and {} entered {} towards {} only {}s apart (minimum headway {}s)",
                    first.train_id, second.train_id, key, second.to, gap, headway
                );
                conflicts.push(
                    Conflict::detected(
                        ConflictType::HeadwayViolation,
                        ConflictSeverity::High,
                        key.clone(),
                        LocationType::Edge,
                        vec![first.train_id.clone(), second.train_id.clone()],
                        explanation,
                        now,
                        "headway_violation",
                    )
                    .with_suggestions(vec![
                        "Apply a temporary speed restriction to the following train".to_string(),
                    ]),
                );
            }
        }
        Ok(conflicts)
    }

    fn rule_blocking_incident(
        &self,
        state: &NetworkState,
        now: DateTime<Utc>,
    ) -> CoreResult<Vec<Conflict>> {
        let mut conflicts = Vec::new();

        for station in state.stations.values() {
            if station.has_blocking_incident() && !station.current_trains.is_empty() {
                let Some(incident) = station.active_incidents.iter().find(|i| i.is_blocking)
                else {
                    continue;
                };
                let explanation = format!(
                    "Blocking {} incident (severity {:.0}) at station {} with {} trains present",
                    incident.incident_type.as_str(),
                    incident.severity,
                    station.name,
                    station.current_trains.len()
                );
                conflicts.push(
                    Conflict::detected(
                        ConflictType::BlockingIncident,
                        ConflictSeverity::Critical,
                        station.id.clone(),
                        LocationType::Station,
                        station.current_trains.clone(),
                        explanation,
                        now,
                        "blocking_incident",
                    )
                    .with_suggestions(vec![
                        "Divert arriving trains while the incident is active".to_string(),
                    ]),
                );
            }
        }

        for (key, rail) in &state.edges {
            let involved = trains_on_edge(state, key);
            if rail.has_blocking_incident() && !involved.is_empty() {
                let Some(incident) = rail.active_incidents.iter().find(|i| i.is_blocking) else {
                    continue;
                };
                let explanation = format!(
                    "Blocking {} incident (severity {:.0}) on edge {} with {} trains present",
                    incident.incident_type.as_str(),
                    incident.severity,
                    key,
                    involved.len()
                );
                conflicts.push(
                    Conflict::detected(
                        ConflictType::BlockingIncident,
                        ConflictSeverity::Critical,
                        key.clone(),
                        LocationType::Edge,
                        involved,
                        explanation,
                        now,
                        "blocking_incident",
                    )
                    .with_suggestions(vec![
                        "Hold trains at adjacent stations until the segment clears".to_string(),
                    ]),
                );
            }
        }

        Ok(conflicts)
    }

    /// Excessive accumulated delay at a station that is already full.
    fn rule_excessive_delay(
        &self,
        state: &NetworkState,
        now: DateTime<Utc>,
    ) -> CoreResult<Vec<Conflict>> {
        let threshold = self.thresholds.excessive_delay_sec;
        let escalation = self.thresholds.excessive_delay_escalation_sec;

        let mut per_station: BTreeMap<String, Vec<&Train>> = BTreeMap::new();
        for train in state.trains.values() {
            if train.delay_seconds <= threshold {
                continue;
            }
            let Some(station_id) = &train.current_station else { continue };
            let Some(station) = state.stations.get(station_id) else { continue };
            if station.occupancy_ratio() >= 1.0 {
                per_station.entry(station_id.clone()).or_default().push(train);
            }
        }

        let mut conflicts = Vec::new();
        for (station_id, trains) in per_station {
            let max_delay = trains.iter().map(|t| t.delay_seconds).max().unwrap_or(0);
            let severity = if max_delay >= escalation {
                ConflictSeverity::High
            } else {
                ConflictSeverity::Medium
            };
            let involved: Vec<String> = trains.iter().map(|t| t.train_id.clone()).collect();
            let explanation = format!(
                "{} delayed train(s) (worst {}s) occupying capacity-constrained station {}",
                involved.len(),
                max_delay,
                station_id
            );
            conflicts.push(
                Conflict::detected(
                    ConflictType::ExcessiveDelay,
                    severity,
                    station_id,
                    LocationType::Station,
                    involved,
                    explanation,
                    now,
                    "excessive_delay",
                )
                .with_suggestions(vec![
                    "Re-platform the delayed service or authorize overtaking".to_string(),
                ]),
            );
        }
        Ok(conflicts)
    }
}

fn trains_on_edge(state: &NetworkState, edge_id: &str) -> Vec<String> {
    state
        .trains
        .values()
        .filter(|t| t.current_edge.as_deref() == Some(edge_id))
        .map(|t| t.train_id.clone())
        .collect()
}
