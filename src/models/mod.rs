use serde::{Deserialize, Serialize};

pub mod conflict;
pub mod incident;
pub mod network;
pub mod resolution;
pub mod train;

pub use conflict::*;
pub use incident::*;
pub use network::*;
pub use resolution::*;
pub use train::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Weather {
    Clear,
    Rain,
    Snow,
    Fog,
    Storm,
}

impl Weather {
    /// Multiplier applied to effective train speed under this weather.
    pub fn speed_factor(&self) -> f64 {
        match self {
            Weather::Snow | Weather::Storm | Weather::Fog => 0.8,
            Weather::Rain => 0.95,
            Weather::Clear => 1.0,
        }
    }

    pub fn is_severe(&self) -> bool {
        matches!(self, Weather::Snow | Weather::Storm)
    }
}

impl Default for Weather {
    fn default() -> Self {
        Weather::Clear
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainType {
    Regional,
    Intercity,
    Highspeed,
    Freight,
    Other,
}

impl Default for TrainType {
    fn default() -> Self {
        TrainType::Regional
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainStatus {
    Stopped,
    OnTime,
    Delayed,
    Holding,
}

impl Default for TrainStatus {
    fn default() -> Self {
        TrainStatus::Stopped
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionType {
    Station,
    Edge,
    Unknown,
}

impl Default for PositionType {
    fn default() -> Self {
        PositionType::Unknown
    }
}

/// How a station treats arrivals beyond `max_trains_at_once`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockingBehavior {
    Hard,
    Soft,
}

impl Default for BlockingBehavior {
    fn default() -> Self {
        BlockingBehavior::Soft
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RailDirection {
    Directed,
    Bidirectional,
}

impl Default for RailDirection {
    fn default() -> Self {
        RailDirection::Bidirectional
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskProfile {
    Low,
    Medium,
    High,
}

impl Default for RiskProfile {
    fn default() -> Self {
        RiskProfile::Low
    }
}
