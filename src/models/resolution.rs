use super::*;

/// Canonical schema every proposal format is projected into before ranking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedResolution {
    pub resolution_id: String,
    pub source_agent: String,
    pub strategy_name: String,

    pub actions: Vec<String>,
    pub expected_outcome: String,
    pub reasoning: String,

    // Quantitative metrics, all on a 0-1 scale.
    pub safety_score: f64,
    pub efficiency_score: f64,
    pub feasibility_score: f64,
    pub overall_fitness: f64,

    pub estimated_delay_min: f64,
    pub affected_trains: Vec<String>,
    pub side_effects: Vec<String>,

    pub algorithm_type: String,
    pub raw_data: serde_json::Value,
}

/// A proposal as produced by the narrative pipeline: self-scored, with
/// verbose reasoning that the normalizer condenses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerboseProposal {
    pub resolution_id: String,
    pub strategy_name: String,
    pub action_steps: Vec<String>,
    pub expected_outcome: String,
    pub reasoning: String,
    #[serde(default = "default_half")]
    pub safety_score: f64,
    #[serde(default = "default_half")]
    pub efficiency_score: f64,
    #[serde(default = "default_half")]
    pub feasibility_score: f64,
    #[serde(default = "default_half")]
    pub confidence_score: f64,
    #[serde(default)]
    pub estimated_delay_reduction_sec: Option<f64>,
    #[serde(default)]
    pub affected_trains: Vec<String>,
    #[serde(default)]
    pub side_effects: Vec<String>,
    #[serde(default = "default_hybrid")]
    pub source_type: String,
}

fn default_half() -> f64 {
    0.5
}

fn default_hybrid() -> String {
    "hybrid".to_string()
}

/// Solution metrics reported by a mathematical solver. Terse on purpose;
/// the normalizer derives the comparable scores objectively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerMetrics {
    pub fitness: f64,
    pub total_delay_min: f64,
    #[serde(default)]
    pub original_delay_min: Option<f64>,
    #[serde(default)]
    pub num_actions: Option<u32>,
    #[serde(default)]
    pub passenger_impact: Option<u32>,
    #[serde(default)]
    pub propagation_depth: Option<u32>,
    #[serde(default)]
    pub recovery_smoothness: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerProposal {
    pub solver_name: String,
    pub actions: Vec<String>,
    pub metrics: OptimizerMetrics,
}

/// The two proposal formats the ranking pipeline accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolutionProposal {
    Verbose(VerboseProposal),
    Optimizer(OptimizerProposal),
}

/// One entry of the judge's ranking, with the full normalized resolution
/// attached for downstream application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedResolution {
    pub rank: u32,
    pub resolution_number: u32,
    pub overall_score: f64,
    pub safety_rating: f64,
    pub efficiency_rating: f64,
    pub feasibility_rating: f64,
    pub robustness_rating: f64,
    pub justification: String,
    pub resolution: NormalizedResolution,
}
