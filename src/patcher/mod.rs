use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};
use crate::llm::ChatClient;
use crate::models::NormalizedResolution;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOperation {
    Set,
    Multiply,
    Add,
    Subtract,
    KeepSame,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldUpdate {
    pub field: String,
    pub operation: UpdateOperation,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RailUpdate {
    pub source: String,
    pub target: String,
    pub updates: Vec<FieldUpdate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainUpdate {
    pub train_id: String,
    pub updates: Vec<FieldUpdate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalUpdate {
    pub parameter: String,
    pub operation: UpdateOperation,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub description: String,
}

/// Value-level update plan produced by the interpreter (or the keyword
/// fallback). Applying it can only touch existing fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateInstructions {
    #[serde(default)]
    pub rail_updates: Vec<RailUpdate>,
    #[serde(default)]
    pub train_updates: Vec<TrainUpdate>,
    #[serde(default)]
    pub global_updates: Vec<GlobalUpdate>,
}

impl UpdateInstructions {
    pub fn is_empty(&self) -> bool {
        self.rail_updates.is_empty()
            && self.train_updates.is_empty()
            && self.global_updates.is_empty()
    }
}

/// Translates a chosen resolution's actions into value updates on the raw
/// network snapshot, preserving its schema exactly: no field is added or
/// removed and no list changes length. Any structural deviation discards the
/// whole patch.
pub struct ContextPatcher {
    client: Option<ChatClient>,
}

impl ContextPatcher {
    pub fn new(client: Option<ChatClient>) -> Self {
        Self { client }
    }

    pub async fn apply_resolution(
        &self,
        resolution: &NormalizedResolution,
        context: &Value,
    ) -> CoreResult<Value> {
        let instructions = match &self.client {
            Some(client) => match self.interpret_with_llm(client, resolution).await {
                Ok(instructions) => instructions,
                Err(e) => {
                    warn!(error = %e, "interpreter failed; using keyword fallback");
                    fallback_instructions(resolution)
                }
            },
            None => fallback_instructions(resolution),
        };
        self.apply_instructions(resolution, context, &instructions)
    }

    /// Apply a ready-made instruction set. Exposed separately so callers can
    /// review instructions before committing them.
    pub fn apply_instructions(
        &self,
        resolution: &NormalizedResolution,
        context: &Value,
        instructions: &UpdateInstructions,
    ) -> CoreResult<Value> {
        let mut updated = context.clone();

        for rail_update in &instructions.rail_updates {
            apply_rail_update(&mut updated, rail_update);
        }
        for train_update in &instructions.train_updates {
            apply_train_update(&mut updated, train_update);
        }
        if !instructions.global_updates.is_empty() {
            let pairs = affected_rail_pairs(context, &resolution.affected_trains);
            for global in &instructions.global_updates {
                apply_global_update(&mut updated, global, &pairs);
            }
        }

        validate_structure(context, &updated, "$")?;
        Ok(updated)
    }

    async fn interpret_with_llm(
        &self,
        client: &ChatClient,
        resolution: &NormalizedResolution,
    ) -> CoreResult<UpdateInstructions> {
        let prompt = interpretation_prompt(resolution);
        let response = client.complete(&prompt).await?;
        parse_instructions(&response)
    }
}

fn interpretation_prompt(resolution: &NormalizedResolution) -> String {
    let actions = resolution
        .actions
        .iter()
        .enumerate()
        .map(|(i, a)| format!("{}. {}", i + 1, a))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "You translate railway dispatch actions into parameter updates on a network model.\n\
         \n\
         RESOLUTION: {}\n\
         AFFECTED TRAINS: {}\n\
         ACTIONS:\n{}\n\
         \n\
         Translate each action into update instructions. Return ONLY JSON of the form:\n\
         {{\n\
           \"rail_updates\": [{{\"source\": \"...\", \"target\": \"...\",\n\
             \"updates\": [{{\"field\": \"max_speed_kmh\", \"operation\": \"multiply\",\n\
                            \"value\": 0.8, \"reason\": \"...\"}}]}}],\n\
           \"train_updates\": [{{\"train_id\": \"...\",\n\
             \"updates\": [{{\"field\": \"priority\", \"operation\": \"set\", \"value\": 3, \"reason\": \"...\"}}]}}],\n\
           \"global_updates\": [{{\"parameter\": \"travel_time_min\", \"operation\": \"add\",\n\
                                 \"value\": 1.5, \"description\": \"...\"}}]\n\
         }}\n\
         \n\
         Allowed operations: set, multiply, add, subtract, keep_same.\n\
         Only reference fields that already exist in the model (rails: max_speed_kmh,\n\
         travel_time_min, min_headway_sec, capacity; trains: priority). Never invent new fields.\n",
        resolution.strategy_name,
        resolution.affected_trains.join(", "),
        actions,
    )
}

/// Extract the instruction object from interpreter output: fenced JSON,
/// any fenced block, then the first top-level object.
fn parse_instructions(response: &str) -> CoreResult<UpdateInstructions> {
    let json_fence = Regex::new(r"(?s)```json\s*(.*?)\s*```").expect("static pattern");
    let any_fence = Regex::new(r"(?s)```\s*(.*?)\s*```").expect("static pattern");
    let bare_object = Regex::new(r"(?s)\{.*\}").expect("static pattern");

    let json_str = if let Some(m) = json_fence.captures(response) {
        m.get(1).unwrap().as_str().to_string()
    } else if let Some(m) = any_fence.captures(response) {
        m.get(1).unwrap().as_str().to_string()
    } else if let Some(m) = bare_object.find(response) {
        m.as_str().to_string()
    } else {
        return Err(CoreError::Interpretation(
            "no JSON object in interpreter output".into(),
        ));
    };

    serde_json::from_str(&json_str)
        .map_err(|e| CoreError::Interpretation(format!("invalid instruction JSON: {}", e)))
}

/// Keyword rules used when no interpreter is configured or its output could
/// not be parsed. All rules produce global updates scoped to the affected
/// trains' route segments.
pub fn fallback_instructions(resolution: &NormalizedResolution) -> UpdateInstructions {
    let percent = Regex::new(r"reduce speed by (\d+(?:\.\d+)?)\s*%").expect("static pattern");
    let mut instructions = UpdateInstructions::default();

    for action in &resolution.actions {
        let lower = action.to_lowercase();

        if let Some(caps) = percent.captures(&lower) {
            let pct: f64 = caps[1].parse().unwrap_or(0.0);
            instructions.global_updates.push(GlobalUpdate {
                parameter: "max_speed_kmh".to_string(),
                operation: UpdateOperation::Multiply,
                value: Some(1.0 - pct / 100.0),
                description: action.clone(),
            });
        } else if lower.contains("extend dwell") || lower.contains("extend travel") {
            instructions.global_updates.push(GlobalUpdate {
                parameter: "travel_time_min".to_string(),
                operation: UpdateOperation::Add,
                value: Some(1.5),
                description: action.clone(),
            });
        } else if lower.contains("speed restriction") || lower.contains("speed limit") {
            instructions.global_updates.push(GlobalUpdate {
                parameter: "max_speed_kmh".to_string(),
                operation: UpdateOperation::Set,
                value: Some(80.0),
                description: action.clone(),
            });
        } else if lower.contains("keep same") {
            instructions.global_updates.push(GlobalUpdate {
                parameter: "max_speed_kmh".to_string(),
                operation: UpdateOperation::KeepSame,
                value: None,
                description: action.clone(),
            });
        } else {
            debug!(action = %action, "no fallback rule matched action");
        }
    }

    instructions
}

/// Consecutive route-stop pairs for every affected train, matched against
/// rails direction-insensitively.
fn affected_rail_pairs(context: &Value, affected_trains: &[String]) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let Some(trains) = context.get("trains").and_then(Value::as_array) else {
        return pairs;
    };
    for train in trains {
        let id = train.get("train_id").and_then(Value::as_str).unwrap_or("");
        if !affected_trains.iter().any(|t| t == id) {
            continue;
        }
        let Some(route) = train.get("route").and_then(Value::as_array) else { continue };
        for window in route.windows(2) {
            let a = window[0].get("station_name").and_then(Value::as_str);
            let b = window[1].get("station_name").and_then(Value::as_str);
            if let (Some(a), Some(b)) = (a, b) {
                pairs.push((a.to_string(), b.to_string()));
            }
        }
    }
    pairs
}

fn rail_matches(rail: &Value, source: &str, target: &str) -> bool {
    let s = rail.get("source").and_then(Value::as_str).unwrap_or("");
    let t = rail.get("target").and_then(Value::as_str).unwrap_or("");
    (s == source && t == target) || (s == target && t == source)
}

fn apply_rail_update(context: &mut Value, update: &RailUpdate) {
    let Some(rails) = context.get_mut("rails").and_then(Value::as_array_mut) else { return };
    for rail in rails.iter_mut() {
        if !rail_matches(rail, &update.source, &update.target) {
            continue;
        }
        if let Some(obj) = rail.as_object_mut() {
            for field_update in &update.updates {
                apply_field_update(obj, field_update.field.as_str(), field_update.operation, field_update.value);
            }
        }
    }
}

fn apply_train_update(context: &mut Value, update: &TrainUpdate) {
    let Some(trains) = context.get_mut("trains").and_then(Value::as_array_mut) else { return };
    for train in trains.iter_mut() {
        let id = train.get("train_id").and_then(Value::as_str).unwrap_or("");
        if id != update.train_id {
            continue;
        }
        if let Some(obj) = train.as_object_mut() {
            for field_update in &update.updates {
                apply_field_update(obj, field_update.field.as_str(), field_update.operation, field_update.value);
            }
        }
    }
}

fn apply_global_update(context: &mut Value, update: &GlobalUpdate, pairs: &[(String, String)]) {
    let Some(rails) = context.get_mut("rails").and_then(Value::as_array_mut) else { return };
    for rail in rails.iter_mut() {
        let matched = pairs
            .iter()
            .any(|(a, b)| rail_matches(rail, a, b));
        if !matched {
            continue;
        }
        if let Some(obj) = rail.as_object_mut() {
            apply_field_update(obj, update.parameter.as_str(), update.operation, update.value);
        }
    }
}

/// The single mutation primitive: update the value of an existing numeric
/// field. Unknown fields are skipped, never created.
fn apply_field_update(
    obj: &mut Map<String, Value>,
    field: &str,
    operation: UpdateOperation,
    value: Option<f64>,
) {
    if operation == UpdateOperation::KeepSame {
        return;
    }
    let Some(current) = obj.get(field) else {
        warn!(field, "refusing to create field absent from the model");
        return;
    };
    let Some(current) = current.as_f64() else {
        warn!(field, "field is not numeric; skipping update");
        return;
    };
    let Some(operand) = value else {
        warn!(field, "update missing a value; skipping");
        return;
    };

    let new_value = match operation {
        UpdateOperation::Set => operand,
        UpdateOperation::Multiply => current * operand,
        UpdateOperation::Add => current + operand,
        UpdateOperation::Subtract => current - operand,
        UpdateOperation::KeepSame => unreachable!(),
    };
    if let Some(number) = serde_json::Number::from_f64(new_value) {
        obj.insert(field.to_string(), Value::Number(number));
    }
}

/// Recursive structural comparison: identical value kinds, identical object
/// key sets, identical array lengths. Values may differ; shape may not.
pub fn validate_structure(original: &Value, updated: &Value, path: &str) -> CoreResult<()> {
    match (original, updated) {
        (Value::Object(a), Value::Object(b)) => {
            if a.len() != b.len() || a.keys().any(|k| !b.contains_key(k)) {
                return Err(CoreError::StructureViolation(format!(
                    "object keys differ at {}",
                    path
                )));
            }
            for (key, value) in a {
                validate_structure(value, &b[key], &format!("{}.{}", path, key))?;
            }
            Ok(())
        }
        (Value::Array(a), Value::Array(b)) => {
            if a.len() != b.len() {
                return Err(CoreError::StructureViolation(format!(
                    "array length differs at {} ({} vs {})",
                    path,
                    a.len(),
                    b.len()
                )));
            }
            for (i, (left, right)) in a.iter().zip(b).enumerate() {
                validate_structure(left, right, &format!("{}[{}]", path, i))?;
            }
            Ok(())
        }
        (Value::Number(_), Value::Number(_))
        | (Value::String(_), Value::String(_))
        | (Value::Bool(_), Value::Bool(_))
        | (Value::Null, Value::Null) => Ok(()),
        _ => Err(CoreError::StructureViolation(format!(
            "value kind changed at {}",
            path
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> Value {
        json!({
            "trains": [
                {
                    "train_id": "REG_3053",
                    "train_type": "regional",
                    "priority": 2,
                    "route": [
                        {"station_name": "MILANO CENTRALE"},
                        {"station_name": "MILANO LAMBRATE"},
                        {"station_name": "TREVIGLIO"}
                    ]
                }
            ],
            "stations": [
                {"id": "MILANO CENTRALE", "max_trains_at_once": 2},
                {"id": "MILANO LAMBRATE", "max_trains_at_once": 2},
                {"id": "TREVIGLIO", "max_trains_at_once": 2}
            ],
            "rails": [
                {"source": "MILANO CENTRALE", "target": "MILANO LAMBRATE",
                 "distance_km": 5.0, "travel_time_min": 4.0, "capacity": 2,
                 "min_headway_sec": 180, "max_speed_kmh": 100.0},
                {"source": "TREVIGLIO", "target": "MILANO LAMBRATE",
                 "distance_km": 25.0, "travel_time_min": 15.0, "capacity": 2,
                 "min_headway_sec": 180, "max_speed_kmh": 140.0},
                {"source": "BRESCIA", "target": "TREVIGLIO",
                 "distance_km": 40.0, "travel_time_min": 22.0, "capacity": 2,
                 "min_headway_sec": 180, "max_speed_kmh": 160.0}
            ]
        })
    }

    fn resolution(actions: Vec<&str>) -> NormalizedResolution {
        NormalizedResolution {
            resolution_id: "res_1".to_string(),
            source_agent: "Mathematical Solver".to_string(),
            strategy_name: "Fast Constructive Heuristic".to_string(),
            actions: actions.into_iter().map(String::from).collect(),
            expected_outcome: String::new(),
            reasoning: String::new(),
            safety_score: 0.8,
            efficiency_score: 0.7,
            feasibility_score: 0.9,
            overall_fitness: 0.75,
            estimated_delay_min: 5.0,
            affected_trains: vec!["REG_3053".to_string()],
            side_effects: vec![],
            algorithm_type: "optimization_greedy".to_string(),
            raw_data: Value::Null,
        }
    }

    #[tokio::test]
    async fn keep_same_patch_is_byte_identical() {
        let patcher = ContextPatcher::new(None);
        let original = context();
        let updated = patcher
            .apply_resolution(&resolution(vec!["Keep same schedule for all trains"]), &original)
            .await
            .unwrap();
        assert_eq!(
            serde_json::to_vec(&original).unwrap(),
            serde_json::to_vec(&updated).unwrap()
        );
    }

    #[tokio::test]
    async fn speed_reduction_applies_to_route_rails_only() {
        let patcher = ContextPatcher::new(None);
        let original = context();
        let updated = patcher
            .apply_resolution(&resolution(vec!["Reduce speed by 20% for REG_3053"]), &original)
            .await
            .unwrap();

        // Both route segments are scaled, direction-insensitively.
        let scaled = updated["rails"][0]["max_speed_kmh"].as_f64().unwrap();
        assert!((scaled - 80.0).abs() < 1e-9);
        let scaled = updated["rails"][1]["max_speed_kmh"].as_f64().unwrap();
        assert!((scaled - 112.0).abs() < 1e-9);
        // The off-route rail is untouched.
        assert_eq!(updated["rails"][2]["max_speed_kmh"], json!(160.0));
    }

    #[tokio::test]
    async fn speed_restriction_sets_80() {
        let patcher = ContextPatcher::new(None);
        let updated = patcher
            .apply_resolution(
                &resolution(vec!["Apply speed restriction on the affected corridor"]),
                &context(),
            )
            .await
            .unwrap();
        assert_eq!(updated["rails"][0]["max_speed_kmh"], json!(80.0));
    }

    #[tokio::test]
    async fn extend_travel_adds_dwell_margin() {
        let patcher = ContextPatcher::new(None);
        let updated = patcher
            .apply_resolution(&resolution(vec!["Extend travel time on the approach"]), &context())
            .await
            .unwrap();
        assert_eq!(updated["rails"][0]["travel_time_min"], json!(5.5));
    }

    #[tokio::test]
    async fn structure_is_preserved_after_patch() {
        let patcher = ContextPatcher::new(None);
        let original = context();
        let updated = patcher
            .apply_resolution(&resolution(vec!["Reduce speed by 30% for REG_3053"]), &original)
            .await
            .unwrap();
        assert!(validate_structure(&original, &updated, "$").is_ok());
    }

    #[test]
    fn unknown_field_is_never_created() {
        let patcher = ContextPatcher::new(None);
        let original = context();
        let instructions = UpdateInstructions {
            rail_updates: vec![RailUpdate {
                source: "MILANO CENTRALE".to_string(),
                target: "MILANO LAMBRATE".to_string(),
                updates: vec![FieldUpdate {
                    field: "emergency_brake_force".to_string(),
                    operation: UpdateOperation::Set,
                    value: Some(1.0),
                    reason: String::new(),
                }],
            }],
            ..Default::default()
        };
        let updated = patcher
            .apply_instructions(&resolution(vec![]), &original, &instructions)
            .unwrap();
        assert!(updated["rails"][0].get("emergency_brake_force").is_none());
    }

    #[test]
    fn structural_deviation_is_a_hard_failure() {
        let original = context();
        let mut mutated = original.clone();
        mutated["rails"]
            .as_array_mut()
            .unwrap()
            .pop();
        assert!(validate_structure(&original, &mutated, "$").is_err());

        let mut extra_field = original.clone();
        extra_field["trains"][0]
            .as_object_mut()
            .unwrap()
            .insert("ghost".to_string(), json!(1));
        assert!(validate_structure(&original, &extra_field, "$").is_err());
    }

    #[test]
    fn interpreter_output_parse_ladder() {
        let fenced = r#"```json
{"rail_updates": [], "train_updates": [], "global_updates": [
  {"parameter": "max_speed_kmh", "operation": "set", "value": 80.0, "description": "limit"}
]}
```"#;
        let parsed = parse_instructions(fenced).unwrap();
        assert_eq!(parsed.global_updates.len(), 1);
        assert_eq!(parsed.global_updates[0].operation, UpdateOperation::Set);

        assert!(parse_instructions("no json here").is_err());
    }
}
