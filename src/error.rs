use thiserror::Error;

pub type Result<T> = std::result::Result<T, SurvError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SurvError {
    #[error("no cohort for {cancer}/{data_source}/{subtype}: {message}")]
    DataUnavailable {
        cancer: String,
        data_source: String,
        subtype: String,
        message: String,
    },

    #[error("nothing left after filtering: {message}")]
    EmptyResult { message: String },

    #[error("not enough data for a split: {message}")]
    InsufficientData { message: String },

    #[error("group '{group}' is degenerate: {message}")]
    DegenerateGroup { group: String, message: String },

    #[error("dimensions don't match: {message}")]
    InvalidDimensions { message: String },

    #[error("optimization blew up: {message}")]
    OptimizationFailed { message: String },

    #[error("model not fitted yet - call fit() first")]
    ModelNotFitted,

    #[error("bad parameter: {parameter} = {value}")]
    InvalidParameter { parameter: String, value: String },

    #[error("numerical issues: {message}")]
    NumericalError { message: String },

    #[error("survival data is broken: {message}")]
    InvalidSurvivalData { message: String },

    #[error("{origin}:{line} malformed: {message}")]
    MalformedData {
        origin: String,
        line: usize,
        message: String,
    },

    #[error("i/o on {path}: {message}")]
    Io { path: String, message: String },

    #[error("results already finalized - no more rows accepted")]
    AggregatorSealed,
}

impl SurvError {
    pub fn data_unavailable(
        cancer: impl Into<String>,
        data_source: impl Into<String>,
        subtype: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::DataUnavailable {
            cancer: cancer.into(),
            data_source: data_source.into(),
            subtype: subtype.into(),
            message: message.into(),
        }
    }

    pub fn empty_result(message: impl Into<String>) -> Self {
        Self::EmptyResult { message: message.into() }
    }

    pub fn insufficient_data(message: impl Into<String>) -> Self {
        Self::InsufficientData { message: message.into() }
    }

    pub fn degenerate_group(group: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DegenerateGroup {
            group: group.into(),
            message: message.into(),
        }
    }

    pub fn invalid_dimensions(message: impl Into<String>) -> Self {
        Self::InvalidDimensions { message: message.into() }
    }

    pub fn optimization_failed(message: impl Into<String>) -> Self {
        Self::OptimizationFailed { message: message.into() }
    }

    pub fn invalid_parameter(parameter: impl Into<String>, value: impl Into<String>) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            value: value.into(),
        }
    }

    pub fn numerical_error(message: impl Into<String>) -> Self {
        Self::NumericalError { message: message.into() }
    }

    pub fn invalid_survival_data(message: impl Into<String>) -> Self {
        Self::InvalidSurvivalData { message: message.into() }
    }

    pub fn malformed(origin: impl Into<String>, line: usize, message: impl Into<String>) -> Self {
        Self::MalformedData {
            origin: origin.into(),
            line,
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// errors a batch can absorb at subgroup granularity (logged + skipped)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::EmptyResult { .. }
                | Self::InsufficientData { .. }
                | Self::DegenerateGroup { .. }
                | Self::OptimizationFailed { .. }
                | Self::NumericalError { .. }
        )
    }

    /// short stable tag used in skip logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DataUnavailable { .. } => "data_unavailable",
            Self::EmptyResult { .. } => "empty_result",
            Self::InsufficientData { .. } => "insufficient_data",
            Self::DegenerateGroup { .. } => "degenerate_group",
            Self::InvalidDimensions { .. } => "invalid_dimensions",
            Self::OptimizationFailed { .. } => "optimization_failed",
            Self::ModelNotFitted => "model_not_fitted",
            Self::InvalidParameter { .. } => "invalid_parameter",
            Self::NumericalError { .. } => "numerical_error",
            Self::InvalidSurvivalData { .. } => "invalid_survival_data",
            Self::MalformedData { .. } => "malformed_data",
            Self::Io { .. } => "io",
            Self::AggregatorSealed => "aggregator_sealed",
        }
    }
}
