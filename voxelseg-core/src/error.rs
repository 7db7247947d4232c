use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Precondition not met: {0}")]
    Precondition(String),

    #[error("Geometry contains no points")]
    GeometryEmpty,

    #[error("No geometry loaded")]
    NoGeometry,

    #[error("Unrecognized geometry format: {0}")]
    GeometryFormat(String),

    #[error("Artifact build failed at {path}: {message}")]
    ArtifactBuild { path: String, message: String },

    #[error("Model gateway error: {0}")]
    ModelGateway(String),

    #[error("Recognition failed for object {object_id}: {message}")]
    RecognitionTask { object_id: u32, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the failure is user-correctable (missing session, bad input)
    /// as opposed to an internal fault.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Error::Precondition(_)
                | Error::GeometryEmpty
                | Error::NoGeometry
                | Error::GeometryFormat(_)
        )
    }

    /// Short machine-readable code surfaced in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Precondition(_) => "PRECONDITION",
            Error::GeometryEmpty => "GEOMETRY_EMPTY",
            Error::NoGeometry => "NO_GEOMETRY",
            Error::GeometryFormat(_) => "GEOMETRY_FORMAT",
            Error::ArtifactBuild { .. } => "ARTIFACT_BUILD",
            Error::ModelGateway(_) => "MODEL_GATEWAY",
            Error::RecognitionTask { .. } => "RECOGNITION_TASK",
            Error::Config(_) => "CONFIG",
            Error::Io(_) => "IO",
            Error::Json(_) => "SERIALIZATION",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
