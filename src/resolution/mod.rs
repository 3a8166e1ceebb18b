use regex::Regex;

use crate::models::*;

const REASONING_KEYWORDS: [&str; 6] = [
    "safety",
    "optimization",
    "constraint",
    "algorithm",
    "effective",
    "proven",
];

/// Projects both proposal formats onto `NormalizedResolution` so the judge
/// compares substance, not verbosity. Verbose proposals get their reasoning
/// condensed and their self-scores kept verbatim; optimizer output gets its
/// scores computed objectively from the reported solution metrics.
pub struct ResolutionNormalizer {
    train_id_pattern: Regex,
}

impl ResolutionNormalizer {
    pub fn new() -> Self {
        Self {
            train_id_pattern: Regex::new(r"[A-Z]+_\d+").expect("static pattern"),
        }
    }

    pub fn normalize(&self, proposal: &ResolutionProposal) -> NormalizedResolution {
        match proposal {
            ResolutionProposal::Verbose(v) => self.normalize_verbose(v),
            ResolutionProposal::Optimizer(o) => self.normalize_optimizer(o),
        }
    }

    pub fn normalize_all(&self, proposals: &[ResolutionProposal]) -> Vec<NormalizedResolution> {
        proposals.iter().map(|p| self.normalize(p)).collect()
    }

    fn normalize_verbose(&self, res: &VerboseProposal) -> NormalizedResolution {
        NormalizedResolution {
            resolution_id: res.resolution_id.clone(),
            source_agent: "Hybrid/Historical Planner".to_string(),
            strategy_name: res.strategy_name.clone(),
            actions: res.action_steps.clone(),
            expected_outcome: res.expected_outcome.clone(),
            reasoning: condense_reasoning(&res.reasoning),
            safety_score: res.safety_score,
            efficiency_score: res.efficiency_score,
            feasibility_score: res.feasibility_score,
            overall_fitness: res.confidence_score,
            estimated_delay_min: res.estimated_delay_reduction_sec.unwrap_or(0.0).abs() / 60.0,
            affected_trains: res.affected_trains.clone(),
            side_effects: res.side_effects.clone(),
            algorithm_type: res.source_type.clone(),
            raw_data: serde_json::to_value(res).unwrap_or_default(),
        }
    }

    fn normalize_optimizer(&self, res: &OptimizerProposal) -> NormalizedResolution {
        let metrics = &res.metrics;
        let original_delay = metrics
            .original_delay_min
            .unwrap_or(metrics.total_delay_min * 1.1);

        NormalizedResolution {
            resolution_id: format!("optimizer_{}", res.solver_name),
            source_agent: "Mathematical Solver".to_string(),
            strategy_name: professional_name(&res.solver_name),
            actions: res.actions.clone(),
            expected_outcome: enhanced_outcome(res, original_delay),
            reasoning: enhanced_reasoning(res),
            safety_score: safety_score(&res.solver_name, metrics),
            efficiency_score: efficiency_score(metrics.total_delay_min, original_delay),
            feasibility_score: feasibility_score(res),
            overall_fitness: metrics.fitness,
            estimated_delay_min: metrics.total_delay_min,
            affected_trains: self.extract_trains(&res.actions),
            side_effects: infer_side_effects(res),
            algorithm_type: format!("optimization_{}", res.solver_name),
            raw_data: serde_json::to_value(res).unwrap_or_default(),
        }
    }

    fn extract_trains(&self, actions: &[String]) -> Vec<String> {
        let mut trains: Vec<String> = actions
            .iter()
            .flat_map(|a| self.train_id_pattern.find_iter(a))
            .map(|m| m.as_str().to_string())
            .collect();
        trains.sort();
        trains.dedup();
        trains
    }
}

impl Default for ResolutionNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Keep at most the two sentences that carry the core of a verbose
/// justification.
fn condense_reasoning(verbose: &str) -> String {
    let key_points: Vec<&str> = verbose
        .split(". ")
        .filter(|sentence| {
            let lower = sentence.to_lowercase();
            REASONING_KEYWORDS.iter().any(|k| lower.contains(k))
        })
        .take(2)
        .collect();
    if key_points.is_empty() {
        // Nothing keyword-worthy; keep the first sentence as-is.
        let first = verbose.split(". ").next().unwrap_or("").trim_end_matches('.');
        return format!("{}.", first);
    }
    format!("{}.", key_points.join(". ").trim_end_matches('.'))
}

/// Efficiency from delay reduction: 50% improvement maps to 0.75.
fn efficiency_score(final_delay: f64, original_delay: f64) -> f64 {
    if original_delay == 0.0 {
        return 0.5;
    }
    let improvement = (original_delay - final_delay) / original_delay;
    (0.5 + improvement * 0.5).clamp(0.0, 1.0)
}

/// Safety from algorithm characteristics; constraint-respecting solvers
/// start high and earn bonuses for isolated, smooth recoveries.
fn safety_score(solver_name: &str, metrics: &OptimizerMetrics) -> f64 {
    let mut safety: f64 = match solver_name {
        "lns" => 0.90,
        "nsga2" => 0.88,
        "simulated_annealing" => 0.85,
        "genetic_algorithm" => 0.85,
        "greedy" => 0.80,
        _ => 0.80,
    };
    if metrics.propagation_depth == Some(0) {
        safety += 0.05;
    }
    if metrics.recovery_smoothness.unwrap_or(0.0) > 0.9 {
        safety += 0.05;
    }
    safety.min(1.0)
}

fn feasibility_score(res: &OptimizerProposal) -> f64 {
    let metrics = &res.metrics;
    let base = match res.solver_name.as_str() {
        "greedy" => 0.90,
        "lns" => 0.85,
        "simulated_annealing" => 0.80,
        "genetic_algorithm" => 0.80,
        "nsga2" => 0.75,
        _ => 0.75,
    };
    let num_actions = metrics.num_actions.unwrap_or(res.actions.len() as u32);
    let mut feasibility = base - 0.05 * num_actions as f64;
    if metrics.fitness > 0.7 {
        feasibility += 0.05;
    }
    feasibility.clamp(0.0, 1.0)
}

fn professional_name(solver_name: &str) -> String {
    match solver_name {
        "genetic_algorithm" => "Multi-Objective Evolutionary Optimization".to_string(),
        "simulated_annealing" => "Probabilistic Annealing Optimization".to_string(),
        "lns" => "Large Neighborhood Search Refinement".to_string(),
        "nsga2" => "Pareto-Optimal Multi-Criteria Solution".to_string(),
        "greedy" => "Fast Constructive Heuristic".to_string(),
        other => {
            let mut words: Vec<String> = other
                .split('_')
                .map(|w| {
                    let mut chars = w.chars();
                    match chars.next() {
                        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                        None => String::new(),
                    }
                })
                .collect();
            words.retain(|w| !w.is_empty());
            words.join(" ")
        }
    }
}

fn solver_description(solver_name: &str) -> String {
    match solver_name {
        "genetic_algorithm" => "Uses evolutionary optimization with population-based search to \
            balance multiple objectives simultaneously. Proven effective for multi-constraint \
            railway scheduling with mutation and crossover operators ensuring solution diversity."
            .to_string(),
        "simulated_annealing" => "Employs probabilistic hill-climbing with controlled randomness \
            to escape local optima. Temperature-based acceptance allows exploration of the \
            solution space while gradually focusing on high-quality regions."
            .to_string(),
        "lns" => "Large Neighborhood Search systematically destroys and repairs solution \
            components while maintaining feasibility constraints. Iterative refinement ensures \
            both local optimality and global solution quality."
            .to_string(),
        "nsga2" => "Multi-objective evolutionary algorithm using Pareto dominance to \
            simultaneously optimize conflicting goals. Non-dominated sorting keeps solutions \
            balanced across all objectives."
            .to_string(),
        "greedy" => "Fast constructive heuristic making locally optimal decisions at each step. \
            Low computational overhead enables real-time deployment while maintaining acceptable \
            solution quality."
            .to_string(),
        other => format!(
            "Mathematical optimization using the {} algorithm.",
            other.replace('_', " ")
        ),
    }
}

/// Synthesize reasoning for terse solver output so that ranking cannot
/// discriminate on verbosity alone.
fn enhanced_reasoning(res: &OptimizerProposal) -> String {
    let mut reasoning = solver_description(&res.solver_name);
    if let Some(smoothness) = res.metrics.recovery_smoothness {
        if smoothness > 0.0 {
            reasoning.push_str(&format!(
                " Achieves {:.1}% recovery smoothness, minimizing operational disruption.",
                smoothness * 100.0
            ));
        }
    }
    reasoning.push_str(&format!(
        " Implements {} coordinated action(s) with verified constraint satisfaction.",
        res.actions.len()
    ));
    reasoning
}

fn enhanced_outcome(res: &OptimizerProposal, original_delay: f64) -> String {
    let delay_min = res.metrics.total_delay_min;
    let improvement_pct = if original_delay > 0.0 {
        (original_delay - delay_min) / original_delay * 100.0
    } else {
        0.0
    };
    let mut outcome = format!(
        "Reduces total system delay to {:.1} minutes (improvement of {:.1}% from baseline). \
         Resolves the conflict through coordinated adjustments while maintaining safety \
         constraints and operational feasibility.",
        delay_min, improvement_pct
    );
    if let Some(passengers) = res.metrics.passenger_impact {
        outcome.push_str(&format!(
            " Affects {} passengers with minimal service disruption.",
            passengers
        ));
    }
    outcome
}

fn infer_side_effects(res: &OptimizerProposal) -> Vec<String> {
    let metrics = &res.metrics;
    let mut effects = Vec::new();

    match metrics.propagation_depth {
        Some(depth) if depth > 0 => {
            effects.push(format!("Affects {} downstream train(s)", depth));
        }
        _ => effects.push("Minimal cascading effects (isolated resolution)".to_string()),
    }

    match metrics.passenger_impact {
        Some(impact) if impact > 1500 => {
            effects.push(format!("High passenger impact ({} affected)", impact));
        }
        Some(impact) if impact > 0 => {
            effects.push(format!("Moderate passenger impact ({} affected)", impact));
        }
        _ => {}
    }

    if res.actions.len() > 2 {
        effects.push("Requires coordination of multiple simultaneous actions".to_string());
    } else {
        effects.push("Simple implementation with minimal coordination overhead".to_string());
    }

    if metrics.recovery_smoothness.unwrap_or(0.0) < 0.9 {
        effects.push("May require additional schedule adjustments".to_string());
    }

    effects
}

#[cfg(test)]
mod tests {
    use super::*;

    fn optimizer_proposal(solver: &str, fitness: f64, total: f64, original: f64) -> OptimizerProposal {
        OptimizerProposal {
            solver_name: solver.to_string(),
            actions: vec![
                "Reduce speed of REG_3053 by 20% on approach".to_string(),
                "Hold FR_8821 for 90 seconds".to_string(),
            ],
            metrics: OptimizerMetrics {
                fitness,
                total_delay_min: total,
                original_delay_min: Some(original),
                num_actions: Some(2),
                passenger_impact: Some(800),
                propagation_depth: Some(0),
                recovery_smoothness: Some(0.95),
            },
        }
    }

    #[test]
    fn optimizer_scores_are_bounded() {
        let normalizer = ResolutionNormalizer::new();
        for solver in ["lns", "nsga2", "simulated_annealing", "genetic_algorithm", "greedy", "exotic"] {
            let normalized = normalizer
                .normalize(&ResolutionProposal::Optimizer(optimizer_proposal(solver, 0.8, 10.0, 25.0)));
            for score in [
                normalized.safety_score,
                normalized.efficiency_score,
                normalized.feasibility_score,
                normalized.overall_fitness,
            ] {
                assert!((0.0..=1.0).contains(&score), "{} out of range", solver);
            }
        }
    }

    #[test]
    fn efficiency_monotone_in_delay_reduction() {
        let mut last = -1.0;
        for final_delay in [25.0, 20.0, 15.0, 10.0, 5.0, 0.0] {
            let score = efficiency_score(final_delay, 25.0);
            assert!(score >= last);
            last = score;
        }
    }

    #[test]
    fn efficiency_neutral_when_no_baseline() {
        assert_eq!(efficiency_score(10.0, 0.0), 0.5);
    }

    #[test]
    fn safety_bonuses_for_isolation_and_smoothness() {
        let metrics = OptimizerMetrics {
            fitness: 0.8,
            total_delay_min: 10.0,
            original_delay_min: Some(20.0),
            num_actions: Some(1),
            passenger_impact: None,
            propagation_depth: Some(0),
            recovery_smoothness: Some(0.95),
        };
        assert_eq!(safety_score("lns", &metrics), 1.0);
        let mut no_bonus = metrics.clone();
        no_bonus.propagation_depth = Some(2);
        no_bonus.recovery_smoothness = Some(0.5);
        assert!((safety_score("lns", &no_bonus) - 0.90).abs() < 1e-12);
    }

    #[test]
    fn overall_fitness_passes_through() {
        let normalizer = ResolutionNormalizer::new();
        let normalized = normalizer
            .normalize(&ResolutionProposal::Optimizer(optimizer_proposal("greedy", 0.63, 12.0, 20.0)));
        assert_eq!(normalized.overall_fitness, 0.63);
    }

    #[test]
    fn condense_reasoning_keeps_keyword_sentences() {
        let verbose = "This plan was chosen after long deliberation. It respects every safety \
                       constraint on the corridor. The weather was nice that day. The algorithm \
                       is proven in daily operation. Everyone agreed it looked reasonable.";
        let condensed = condense_reasoning(verbose);
        assert!(condensed.contains("safety"));
        assert!(condensed.contains("algorithm"));
        assert!(!condensed.contains("weather was nice"));
        assert!(condensed.split(". ").count() <= 2);
    }

    #[test]
    fn trains_extracted_from_action_text() {
        let normalizer = ResolutionNormalizer::new();
        let normalized = normalizer
            .normalize(&ResolutionProposal::Optimizer(optimizer_proposal("lns", 0.8, 10.0, 25.0)));
        assert_eq!(normalized.affected_trains, vec!["FR_8821", "REG_3053"]);
    }

    #[test]
    fn verbose_self_scores_kept_verbatim() {
        let normalizer = ResolutionNormalizer::new();
        let proposal = ResolutionProposal::Verbose(VerboseProposal {
            resolution_id: "hist_001".to_string(),
            strategy_name: "Priority Rescheduling".to_string(),
            action_steps: vec!["Hold REG_3053 at MILANO CENTRALE".to_string()],
            expected_outcome: "Headway restored within 5 minutes".to_string(),
            reasoning: "Proven approach with strong safety record. Also quite popular.".to_string(),
            safety_score: 0.77,
            efficiency_score: 0.61,
            feasibility_score: 0.9,
            confidence_score: 0.7,
            estimated_delay_reduction_sec: Some(-240.0),
            affected_trains: vec!["REG_3053".to_string()],
            side_effects: vec![],
            source_type: "hybrid".to_string(),
        });
        let normalized = normalizer.normalize(&proposal);
        assert_eq!(normalized.safety_score, 0.77);
        assert_eq!(normalized.efficiency_score, 0.61);
        assert_eq!(normalized.overall_fitness, 0.7);
        assert!((normalized.estimated_delay_min - 4.0).abs() < 1e-12);
    }
}
