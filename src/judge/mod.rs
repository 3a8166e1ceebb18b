use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use crate::error::{CoreError, CoreResult};
use crate::llm::ChatClient;
use crate::models::{NormalizedResolution, RankedResolution};

/// The conflict being resolved, rendered into the evaluation prompt.
#[derive(Debug, Clone)]
pub struct ConflictContext {
    pub conflict_summary: String,
    pub location: String,
    pub severity_note: String,
    pub trains: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawRanking {
    rank: u32,
    resolution_number: u32,
    #[serde(default)]
    overall_score: f64,
    #[serde(default)]
    safety_rating: f64,
    #[serde(default)]
    efficiency_rating: f64,
    #[serde(default)]
    feasibility_rating: f64,
    #[serde(default)]
    robustness_rating: f64,
    #[serde(default)]
    justification: String,
}

/// Ranks normalized resolutions with an external generator over a
/// fairness-constrained prompt. Malformed output fails loudly; the judge
/// never silently picks a resolution.
pub struct LlmJudge {
    client: ChatClient,
}

impl LlmJudge {
    pub fn new(client: ChatClient) -> Self {
        Self { client }
    }

    pub async fn rank_resolutions(
        &self,
        resolutions: &[NormalizedResolution],
        context: &ConflictContext,
        top_k: usize,
    ) -> CoreResult<Vec<RankedResolution>> {
        let prompt = build_prompt(resolutions, context);
        let judgment = self.client.complete(&prompt).await?;
        parse_rankings(&judgment, resolutions, top_k)
    }
}

/// Every resolution is rendered identically: name, actions, outcome,
/// reasoning, the four numeric scores, delay and side effects. Equal
/// representation is the fairness constraint.
pub fn build_prompt(resolutions: &[NormalizedResolution], context: &ConflictContext) -> String {
    let mut prompt = format!(
        "You are an expert railway operations judge evaluating conflict resolution strategies.\n\
         \n\
         **CONFLICT CONTEXT:**\n\
         - Type: {}\n\
         - Location: {}\n\
         - Severity: {}\n\
         - Affected Trains: {}\n\
         \n\
         **YOUR TASK:**\n\
         Evaluate the following {} resolution strategies objectively and rank the TOP {}.\n\
         \n\
         **EVALUATION CRITERIA (Equal Weight):**\n\
         1. **Safety** (30%): Does it maintain operational safety and prevent cascading failures?\n\
         2. **Efficiency** (30%): How effectively does it reduce delays and restore normal operations?\n\
         3. **Feasibility** (25%): Can it be implemented quickly with available infrastructure?\n\
         4. **Robustness** (15%): How well does it handle uncertainty and side effects?\n\
         \n\
         **IMPORTANT GUIDELINES:**\n\
         - Mathematical optimization solutions are AS VALID as hybrid/historical approaches\n\
         - Simpler solutions with fewer actions are OFTEN more feasible in practice\n\
         - Lower delay metrics indicate BETTER performance\n\
         - Both verbal reasoning AND quantitative metrics matter equally\n\
         - Judge based on OBJECTIVE CRITERIA, not on verbosity of explanation\n\
         \n\
         ---\n\
         \n\
         **RESOLUTIONS TO EVALUATE:**\n",
        context.conflict_summary,
        context.location,
        context.severity_note,
        context.trains.join(", "),
        resolutions.len(),
        3.min(resolutions.len()),
    );

    for (i, res) in resolutions.iter().enumerate() {
        let actions = res
            .actions
            .iter()
            .enumerate()
            .map(|(j, a)| format!("  {}. {}", j + 1, a))
            .collect::<Vec<_>>()
            .join("\n");
        let side_effects = if res.side_effects.is_empty() {
            "  - None identified".to_string()
        } else {
            res.side_effects
                .iter()
                .map(|e| format!("  - {}", e))
                .collect::<Vec<_>>()
                .join("\n")
        };

        prompt.push_str(&format!(
            "\n### Resolution {}: {}\n\
             **Source:** {}\n\
             **Algorithm Type:** {}\n\
             \n\
             **Actions:**\n{}\n\
             \n\
             **Expected Outcome:**\n{}\n\
             \n\
             **Technical Reasoning:**\n{}\n\
             \n\
             **Quantitative Metrics:**\n\
             - Overall Fitness/Confidence: {:.3}\n\
             - Safety Score: {:.3}\n\
             - Efficiency Score: {:.3}\n\
             - Feasibility Score: {:.3}\n\
             - Estimated Delay: {:.1} minutes\n\
             - Affected Trains: {}\n\
             \n\
             **Side Effects:**\n{}\n\
             \n\
             ---\n",
            i + 1,
            res.strategy_name,
            res.source_agent,
            res.algorithm_type,
            actions,
            res.expected_outcome,
            res.reasoning,
            res.overall_fitness,
            res.safety_score,
            res.efficiency_score,
            res.feasibility_score,
            res.estimated_delay_min,
            res.affected_trains.len(),
            side_effects,
        ));
    }

    prompt.push_str(
        "\n**OUTPUT FORMAT:**\n\
         Return ONLY a JSON array with your top ranked resolutions:\n\
         \n\
         [\n\
           {\n\
             \"rank\": 1,\n\
             \"resolution_number\": <number>,\n\
             \"overall_score\": <0-100>,\n\
             \"safety_rating\": <0-10>,\n\
             \"efficiency_rating\": <0-10>,\n\
             \"feasibility_rating\": <0-10>,\n\
             \"robustness_rating\": <0-10>,\n\
             \"justification\": \"<2-3 sentence explanation focusing on objective strengths>\"\n\
           }\n\
         ]\n\
         \n\
         **CRITICAL:** Base your judgment on OBJECTIVE PERFORMANCE METRICS and PRACTICAL \
         VIABILITY, not on how detailed the explanation is.\n",
    );

    prompt
}

/// Extract the ranking array: fenced JSON first, then any fenced block,
/// then the first top-level JSON array in the text.
pub fn parse_rankings(
    judgment: &str,
    resolutions: &[NormalizedResolution],
    top_k: usize,
) -> CoreResult<Vec<RankedResolution>> {
    let json_fence = Regex::new(r"(?s)```json\s*(.*?)\s*```").expect("static pattern");
    let any_fence = Regex::new(r"(?s)```\s*(.*?)\s*```").expect("static pattern");
    let bare_array = Regex::new(r"(?s)\[.*\]").expect("static pattern");

    let json_str = if let Some(m) = json_fence.captures(judgment) {
        m.get(1).unwrap().as_str().to_string()
    } else if let Some(m) = any_fence.captures(judgment) {
        m.get(1).unwrap().as_str().to_string()
    } else if let Some(m) = bare_array.find(judgment) {
        m.as_str().to_string()
    } else {
        return Err(CoreError::Judgment("no JSON array in judge output".into()));
    };

    let raw: Vec<RawRanking> = serde_json::from_str(&json_str)
        .map_err(|e| CoreError::Judgment(format!("invalid JSON from judge: {}", e)))?;

    let mut rankings = Vec::new();
    for ranking in raw.into_iter().take(top_k) {
        let index = ranking.resolution_number.checked_sub(1).map(|i| i as usize);
        match index.and_then(|i| resolutions.get(i)) {
            Some(resolution) => rankings.push(RankedResolution {
                rank: ranking.rank,
                resolution_number: ranking.resolution_number,
                overall_score: ranking.overall_score,
                safety_rating: ranking.safety_rating,
                efficiency_rating: ranking.efficiency_rating,
                feasibility_rating: ranking.feasibility_rating,
                robustness_rating: ranking.robustness_rating,
                justification: ranking.justification,
                resolution: resolution.clone(),
            }),
            None => {
                warn!(
                    resolution_number = ranking.resolution_number,
                    "judge referenced a resolution that does not exist"
                );
            }
        }
    }

    if rankings.is_empty() {
        return Err(CoreError::Judgment(
            "judge output contained no valid rankings".into(),
        ));
    }
    Ok(rankings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolution(id: &str, fitness: f64) -> NormalizedResolution {
        NormalizedResolution {
            resolution_id: id.to_string(),
            source_agent: "Mathematical Solver".to_string(),
            strategy_name: "Large Neighborhood Search Refinement".to_string(),
            actions: vec!["Hold REG_3053 for 120 seconds".to_string()],
            expected_outcome: "Headway restored".to_string(),
            reasoning: "Maintains feasibility by design.".to_string(),
            safety_score: 0.9,
            efficiency_score: 0.7,
            feasibility_score: 0.8,
            overall_fitness: fitness,
            estimated_delay_min: 4.0,
            affected_trains: vec!["REG_3053".to_string()],
            side_effects: vec![],
            algorithm_type: "optimization_lns".to_string(),
            raw_data: serde_json::Value::Null,
        }
    }

    fn context() -> ConflictContext {
        ConflictContext {
            conflict_summary: "headway_violation".to_string(),
            location: "MILANO CENTRALE->MILANO LAMBRATE".to_string(),
            severity_note: "Critical headway violation (50s actual vs 180s required)".to_string(),
            trains: vec!["REG_3053".to_string(), "FR_8821".to_string()],
        }
    }

    #[test]
    fn parses_fenced_json() {
        let resolutions = vec![resolution("a", 0.8), resolution("b", 0.6)];
        let judgment = r#"Here is my ranking:
```json
[{"rank": 1, "resolution_number": 2, "overall_score": 88,
  "safety_rating": 9, "efficiency_rating": 8, "feasibility_rating": 9,
  "robustness_rating": 8, "justification": "Strong metrics."}]
```"#;
        let rankings = parse_rankings(judgment, &resolutions, 3).unwrap();
        assert_eq!(rankings.len(), 1);
        assert_eq!(rankings[0].resolution.resolution_id, "b");
        assert_eq!(rankings[0].overall_score, 88.0);
    }

    #[test]
    fn parses_bare_array() {
        let resolutions = vec![resolution("a", 0.8)];
        let judgment = r#"[{"rank": 1, "resolution_number": 1, "overall_score": 75,
            "safety_rating": 8, "efficiency_rating": 7, "feasibility_rating": 8,
            "robustness_rating": 7, "justification": "Solid."}]"#;
        let rankings = parse_rankings(judgment, &resolutions, 3).unwrap();
        assert_eq!(rankings[0].resolution.resolution_id, "a");
    }

    #[test]
    fn malformed_output_fails_loudly() {
        let resolutions = vec![resolution("a", 0.8)];
        assert!(parse_rankings("I prefer the first one.", &resolutions, 3).is_err());
        assert!(parse_rankings("```json\nnot json\n```", &resolutions, 3).is_err());
    }

    #[test]
    fn invalid_resolution_numbers_are_skipped() {
        let resolutions = vec![resolution("a", 0.8)];
        let judgment = r#"[
            {"rank": 1, "resolution_number": 7, "overall_score": 90,
             "safety_rating": 9, "efficiency_rating": 9, "feasibility_rating": 9,
             "robustness_rating": 9, "justification": "Ghost."},
            {"rank": 2, "resolution_number": 1, "overall_score": 80,
             "safety_rating": 8, "efficiency_rating": 8, "feasibility_rating": 8,
             "robustness_rating": 8, "justification": "Real."}
        ]"#;
        let rankings = parse_rankings(judgment, &resolutions, 3).unwrap();
        assert_eq!(rankings.len(), 1);
        assert_eq!(rankings[0].resolution.resolution_id, "a");
    }

    #[test]
    fn top_k_truncates() {
        let resolutions = vec![resolution("a", 0.8), resolution("b", 0.6)];
        let judgment = r#"[
            {"rank": 1, "resolution_number": 1, "justification": "x"},
            {"rank": 2, "resolution_number": 2, "justification": "y"}
        ]"#;
        let rankings = parse_rankings(judgment, &resolutions, 1).unwrap();
        assert_eq!(rankings.len(), 1);
    }

    #[test]
    fn prompt_renders_resolutions_uniformly() {
        let resolutions = vec![resolution("a", 0.8), resolution("b", 0.6)];
        let prompt = build_prompt(&resolutions, &context());
        assert!(prompt.contains("### Resolution 1:"));
        assert!(prompt.contains("### Resolution 2:"));
        // Both entries get exactly the same section headers.
        assert_eq!(prompt.matches("**Quantitative Metrics:**").count(), 2);
        assert_eq!(prompt.matches("**Technical Reasoning:**").count(), 2);
        assert_eq!(prompt.matches("**Side Effects:**").count(), 2);
    }

    #[test]
    fn prompt_is_order_symmetric_modulo_numbering() {
        let a = resolution("a", 0.8);
        let mut b = resolution("b", 0.6);
        b.strategy_name = "Probabilistic Annealing Optimization".to_string();

        let forward = build_prompt(&[a.clone(), b.clone()], &context());
        let reverse = build_prompt(&[b, a], &context());
        // Same rendered content in both orders, only the numbering moves.
        let strip = |s: &str| {
            s.replace("### Resolution 1:", "### Resolution N:")
                .replace("### Resolution 2:", "### Resolution N:")
        };
        let mut forward_sections: Vec<String> =
            strip(&forward).split("### Resolution N:").map(String::from).collect();
        let mut reverse_sections: Vec<String> =
            strip(&reverse).split("### Resolution N:").map(String::from).collect();
        forward_sections.sort();
        reverse_sections.sort();
        assert_eq!(forward_sections, reverse_sections);
    }
}
