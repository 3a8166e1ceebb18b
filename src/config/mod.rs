use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::sim::Scenario;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub simulation: SimulationSettings,
    pub prediction: PredictionSettings,
    pub llm: LlmSettings,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationSettings {
    pub snapshot_path: String,
    pub tick_interval_seconds: u64,
    pub max_ticks: u32,
    pub scenario: Scenario,
    pub random_seed: Option<u64>,
    pub delay_probability: f64,
    pub speed_variation: f64,
    pub train_spawn_rate: f64,
    pub max_active_trains: usize,
    pub max_delay_seconds: u32,
    pub conflict_output_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionSettings {
    pub model_artifact_path: Option<String>,
    pub prediction_horizon_min: u32,
    pub prediction_horizon_max: u32,
    pub trigger_delay_threshold_sec: u32,
    pub trigger_congestion_threshold: f64,
    pub continuous_interval_sec: u64,
    pub conflict_thresholds: ConflictThresholds,
}

/// Detection rule thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictThresholds {
    pub excessive_delay_sec: u32,
    pub excessive_delay_escalation_sec: u32,
}

impl Default for ConflictThresholds {
    fn default() -> Self {
        Self {
            excessive_delay_sec: 300,
            excessive_delay_escalation_sec: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    pub api_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8000,
                cors_enabled: true,
            },
            simulation: SimulationSettings {
                snapshot_path: "data/network_snapshot.json".to_string(),
                tick_interval_seconds: 10,
                max_ticks: 100,
                scenario: Scenario::Normal,
                random_seed: None,
                delay_probability: 0.1,
                speed_variation: 0.2,
                train_spawn_rate: 0.3,
                max_active_trains: 50,
                max_delay_seconds: 600,
                conflict_output_dir: "output".to_string(),
            },
            prediction: PredictionSettings {
                model_artifact_path: Some("models/conflict_model.json".to_string()),
                prediction_horizon_min: 10,
                prediction_horizon_max: 30,
                trigger_delay_threshold_sec: 120,
                trigger_congestion_threshold: 0.8,
                continuous_interval_sec: 60,
                conflict_thresholds: ConflictThresholds::default(),
            },
            llm: LlmSettings {
                api_url: "https://openrouter.ai/api/v1/chat/completions".to_string(),
                api_key: None,
                model: "tngtech/deepseek-r1t2-chimera:free".to_string(),
                temperature: 0.1,
                max_tokens: 2000,
                timeout_seconds: 120,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&config_str)?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = AppConfig::default();

        if let Ok(host) = std::env::var("SERVER_HOST") {
            config.server.host = host;
        }
        if let Ok(port) = std::env::var("SERVER_PORT") {
            config.server.port = port.parse()?;
        }

        if let Ok(path) = std::env::var("SNAPSHOT_PATH") {
            config.simulation.snapshot_path = path;
        }
        if let Ok(scenario) = std::env::var("SCENARIO") {
            config.simulation.scenario = scenario
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))?;
        }
        if let Ok(seed) = std::env::var("RANDOM_SEED") {
            config.simulation.random_seed = Some(seed.parse()?);
        }

        if let Ok(path) = std::env::var("MODEL_ARTIFACT_PATH") {
            config.prediction.model_artifact_path = Some(path);
        }

        if let Ok(key) = std::env::var("LLM_API_KEY") {
            config.llm.api_key = Some(key);
        }
        if let Ok(model) = std::env::var("LLM_MODEL") {
            config.llm.model = model;
        }

        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.logging.level = level;
        }

        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let config_str = toml::to_string_pretty(self)?;
        std::fs::write(path, config_str)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }
        if self.simulation.tick_interval_seconds == 0 {
            return Err(anyhow::anyhow!("Tick interval must be greater than 0"));
        }
        for (name, p) in [
            ("delay_probability", self.simulation.delay_probability),
            ("speed_variation", self.simulation.speed_variation),
            ("train_spawn_rate", self.simulation.train_spawn_rate),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(anyhow::anyhow!("{} must be within [0, 1]", name));
            }
        }
        if self.prediction.prediction_horizon_min > self.prediction.prediction_horizon_max {
            return Err(anyhow::anyhow!(
                "prediction_horizon_min cannot exceed prediction_horizon_max"
            ));
        }
        if !(0.0..=1.0).contains(&self.prediction.trigger_congestion_threshold) {
            return Err(anyhow::anyhow!(
                "trigger_congestion_threshold must be within [0, 1]"
            ));
        }
        if self.llm.timeout_seconds == 0 {
            return Err(anyhow::anyhow!("LLM timeout must be greater than 0"));
        }
        Ok(())
    }

    pub fn server_bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
