use thiserror::Error;

#[derive(Error, Debug)]
pub enum SolverError {
    #[error("Invalid rank: {0}")]
    InvalidRank(char),

    #[error("Invalid suit: {0}")]
    InvalidSuit(char),

    #[error("Invalid card notation: {0}")]
    InvalidCardNotation(String),

    #[error("Invalid board notation: {0}")]
    InvalidBoardNotation(String),

    #[error("Cannot deal {requested} cards, only {available} remaining")]
    NotEnoughDeck { requested: usize, available: usize },

    #[error("Illegal action: {0}")]
    Rules(String),

    #[error("Expansion failed: {0}")]
    Expansion(#[source] Box<SolverError>),

    #[error("No decision point found")]
    NoDecisionPointFound,

    #[error("No matching action for {0}")]
    NoMatchingAction(String),

    #[error("No policy for cluster {0}")]
    NoPolicy(u32),

    #[error("Resolve deadline elapsed before any epoch completed")]
    ResolveTimeout,

    #[error("Corrupted policy: {0}")]
    Corrupted(String),

    #[error("Abstraction id mismatch: tree {tree}, mapper {mapper}")]
    AbstractionMismatch { tree: String, mapper: String },

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Decode error: {0}")]
    Codec(String),

    #[error("Worker failed: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SolverError {
    /// Wrap a rule violation raised while materialising tree children.
    pub fn expansion(inner: SolverError) -> SolverError {
        SolverError::Expansion(Box::new(inner))
    }
}

pub type SolverResult<T> = Result<T, SolverError>;
