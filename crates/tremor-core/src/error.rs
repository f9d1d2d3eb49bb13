use thiserror::Error;

/// Failure to obtain the source chart bytes.
#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("network unreachable: {0}")]
    Network(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error("empty response body from {0}")]
    EmptyBody(String),
}

impl AcquisitionError {
    /// Whether another attempt might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::EmptyBody(_) => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Timeout(_) => "timeout",
            Self::Status { .. } => "http_status",
            Self::EmptyBody(_) => "empty_body",
        }
    }
}

/// Failure to turn chart bytes into samples.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("could not decode chart image: {0}")]
    Decode(String),

    #[error("plot area {0} lies outside the image")]
    PlotArea(String),

    #[error("no_curve_pixels: only {found} columns matched (need {required})")]
    NoCurvePixels { found: usize, required: usize },
}

impl ExtractionError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode",
            Self::PlotArea(_) => "plot_area",
            Self::NoCurvePixels { .. } => "no_curve_pixels",
        }
    }
}

/// Failure to deliver a single notification.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    #[error("transient delivery failure: {0}")]
    Transient(String),

    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[derive(Debug, Error)]
pub enum TremorError {
    #[error("not initialized: run 'tremor init'")]
    NotInitialized,

    #[error("a pipeline run is already in progress")]
    RunInProgress,

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("corrupt dataset row {row}: {reason}")]
    CorruptRow { row: usize, reason: String },

    #[error("pipeline database error: {0}")]
    Db(String),

    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TremorError>;
