use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// One entry of a structured validation failure (spec §7: `{location, message, type}`).
#[derive(Debug, Clone, Serialize)]
pub struct ValidationIssue {
    pub location: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl ValidationIssue {
    pub fn new(location: impl Into<String>, message: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            message: message.into(),
            kind: kind.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum TileServerError {
    #[error("Source not found: {0}")]
    SourceNotFound(String),

    #[error("DataSource not found: {0}")]
    DataSourceNotFound(String),

    #[error("Tile not found: z={z}, x={x}, y={y}")]
    TileNotFound { z: u8, x: u32, y: u32 },

    #[error("Invalid tile coordinates: z={z}, x={x}, y={y}")]
    InvalidCoordinates { z: u8, x: u32, y: u32 },

    #[error("Invalid tile request format")]
    InvalidTileRequest,

    /// Input out of range, unknown enum, zoom > 20, malformed filter expression, ...
    #[error("Validation failed")]
    Validation(Vec<ValidationIssue>),

    /// Dataset file absent, sidecar db absent, upstream table missing.
    #[error("Missing prerequisite: {0}")]
    MissingPrerequisite(String),

    /// Preprocessing could not determine (or was given) a usable spatial reference.
    #[error("Unknown or unreferenced input SRS: {0}")]
    UnknownSrs(String),

    /// A pyramid build is already running for this datasource.
    #[error("Pyramid build already running for datasource: {0}")]
    JobAlreadyRunning(String),

    #[error("Failed to read file: {0}")]
    FileError(#[from] std::io::Error),

    #[error("Failed to parse metadata: {0}")]
    MetadataError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Raster error: {0}")]
    RasterError(String),

    #[error("Archive error: {0}")]
    ArchiveError(#[from] rusqlite::Error),

    #[error("PostgreSQL error: {0}")]
    PostgresError(String),

    #[error("PostgreSQL pool error: {0}")]
    PostgresPoolError(String),

    #[error("PostgreSQL/PostGIS version error: {0}")]
    PostgresVersionError(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    errors: Option<Vec<ValidationIssue>>,
}

impl IntoResponse for TileServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            TileServerError::SourceNotFound(_)
            | TileServerError::DataSourceNotFound(_)
            | TileServerError::TileNotFound { .. } => StatusCode::NOT_FOUND,

            TileServerError::InvalidCoordinates { .. }
            | TileServerError::InvalidTileRequest
            | TileServerError::Validation(_)
            | TileServerError::MissingPrerequisite(_) => StatusCode::BAD_REQUEST,

            TileServerError::JobAlreadyRunning(_) => StatusCode::ACCEPTED,

            TileServerError::FileError(_)
            | TileServerError::MetadataError(_)
            | TileServerError::ConfigError(_)
            | TileServerError::RasterError(_)
            | TileServerError::ArchiveError(_)
            | TileServerError::PostgresError(_)
            | TileServerError::PostgresPoolError(_)
            | TileServerError::PostgresVersionError(_)
            | TileServerError::UnknownSrs(_)
            | TileServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let errors = match &self {
            TileServerError::Validation(issues) => Some(issues.clone()),
            _ => None,
        };

        let body = ErrorBody {
            message: self.to_string(),
            detail: None,
            errors,
        };

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, TileServerError>;
