use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("bad network snapshot: {0}")]
    Snapshot(String),

    #[error("unknown station: {0}")]
    UnknownStation(String),

    #[error("unknown edge: {0}")]
    UnknownEdge(String),

    #[error("unknown train: {0}")]
    UnknownTrain(String),

    #[error("LLM call failed: {0}")]
    Llm(String),

    #[error("could not parse judge output: {0}")]
    Judgment(String),

    #[error("action interpretation failed: {0}")]
    Interpretation(String),

    #[error("context patch changed document structure: {0}")]
    StructureViolation(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
