use std::fmt;

use thiserror::Error;

/// Pipeline stage, used to tell the operator where a run died.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Load,
    Normalize,
    Rolling,
    Rest,
    TeamStrength,
    Assemble,
    Target,
    Impute,
    Write,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Load => "load",
            Stage::Normalize => "normalize",
            Stage::Rolling => "rolling",
            Stage::Rest => "rest",
            Stage::TeamStrength => "team_strength",
            Stage::Assemble => "assemble",
            Stage::Target => "target",
            Stage::Impute => "impute",
            Stage::Write => "write",
        };
        f.write_str(name)
    }
}

/// Fatal pipeline errors. Row-level and layer-level problems never end up
/// here; they are recovered where they occur.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("schema violation: {0}")]
    Schema(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// A fatal error tagged with the stage that raised it.
#[derive(Debug, Error)]
#[error("pipeline failed during {stage}: {source}")]
pub struct StageFailure {
    pub stage: Stage,
    #[source]
    pub source: PipelineError,
}

pub trait AtStage<T> {
    fn at(self, stage: Stage) -> std::result::Result<T, StageFailure>;
}

impl<T> AtStage<T> for Result<T> {
    fn at(self, stage: Stage) -> std::result::Result<T, StageFailure> {
        self.map_err(|source| StageFailure { stage, source })
    }
}

/// Why a single raw row was dropped during normalization.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum RowIssue {
    MissingField(&'static str),
    UnparseableDate(String),
    MalformedNumber { field: String, raw: String },
    SelfMatch,
    UnknownGame,
    OutOfRange { metric: String },
}

impl RowIssue {
    /// Stable bucket name for the run report.
    pub fn kind(&self) -> &'static str {
        match self {
            RowIssue::MissingField(_) => "missing_field",
            RowIssue::UnparseableDate(_) => "unparseable_date",
            RowIssue::MalformedNumber { .. } => "malformed_number",
            RowIssue::SelfMatch => "self_match",
            RowIssue::UnknownGame => "unknown_game",
            RowIssue::OutOfRange { .. } => "out_of_range",
        }
    }
}

impl fmt::Display for RowIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowIssue::MissingField(field) => write!(f, "missing {}", field),
            RowIssue::UnparseableDate(raw) => write!(f, "unparseable date {:?}", raw),
            RowIssue::MalformedNumber { field, raw } => {
                write!(f, "malformed number {:?} in {}", raw, field)
            }
            RowIssue::SelfMatch => write!(f, "home and away entity are the same"),
            RowIssue::UnknownGame => write!(f, "references an unknown game"),
            RowIssue::OutOfRange { metric } => write!(f, "{} outside configured range", metric),
        }
    }
}
