/// Typed error taxonomy for the suggestion pipeline.
///
/// None of these are fatal to a cycle: advisor errors collapse to "no
/// suggestion" at the advisor boundary, sink errors are logged by the driver,
/// and rule errors only surface while loading the registry at startup.
use thiserror::Error;

/// Registry loading / validation failures.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("rule registry parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("rule registry read error: {0}")]
    Io(#[from] std::io::Error),

    #[error("rule #{index} has an empty id")]
    EmptyId { index: usize },

    #[error("duplicate rule id '{0}'")]
    DuplicateId(String),

    #[error("rule '{id}' has priority {priority} (max 100)")]
    PriorityOutOfRange { id: String, priority: u32 },

    #[error("rule '{0}' has empty text")]
    EmptyText(String),

    #[error("rule '{id}': unknown field path '{path}'")]
    UnknownField { id: String, path: String },

    #[error("no embedded rule registry for game '{0}'")]
    UnknownGame(String),
}

/// Recoverable per-advisor failures. Logged, then treated as "no suggestion".
#[derive(Debug, Error)]
pub enum AdvisorError {
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("malformed model response: {0}")]
    MalformedResponse(String),

    #[error("frame unreadable: {0}")]
    Frame(#[from] std::io::Error),
}

/// Delivery failures of the overlay / session-log sinks.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("{0} sink is backed up — record dropped")]
    Full(&'static str),

    #[error("{0} sink is closed")]
    Closed(&'static str),

    #[error("{sink} sink I/O error: {source}")]
    Io {
        sink:   &'static str,
        #[source]
        source: std::io::Error,
    },
}
