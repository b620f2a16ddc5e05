//! Error handling

/// Errors for the scenegen library, outside of per-scene upstream failures.
#[derive(Debug)]
pub enum ScenegenError {
    /// When DB operations fail
    DatabaseError(sea_orm::DbErr),
    /// Reading or writing local files failed
    Io(std::io::Error),
    /// Scene, character or vocabulary JSON was malformed
    Json(serde_json::Error),
    /// An endpoint URL could not be parsed
    InvalidUrl(url::ParseError),
    /// Building the HTTP client failed
    Http(reqwest::Error),
    /// Settings that can't produce a working pipeline
    Config(String),
    /// `run` was called while another run on the same pipeline is active
    RunInProgress,
}

impl std::fmt::Display for ScenegenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DatabaseError(err) => write!(f, "Database error: {err}"),
            Self::Io(err) => write!(f, "IO error: {err}"),
            Self::Json(err) => write!(f, "JSON error: {err}"),
            Self::InvalidUrl(err) => write!(f, "Invalid endpoint URL: {err}"),
            Self::Http(err) => write!(f, "HTTP client error: {err}"),
            Self::Config(message) => write!(f, "Configuration error: {message}"),
            Self::RunInProgress => write!(f, "A generation run is already in progress"),
        }
    }
}

impl std::error::Error for ScenegenError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::DatabaseError(err) => Some(err),
            Self::Io(err) => Some(err),
            Self::Json(err) => Some(err),
            Self::InvalidUrl(err) => Some(err),
            Self::Http(err) => Some(err),
            Self::Config(_) | Self::RunInProgress => None,
        }
    }
}

impl From<sea_orm::DbErr> for ScenegenError {
    fn from(err: sea_orm::DbErr) -> Self {
        ScenegenError::DatabaseError(err)
    }
}

impl From<std::io::Error> for ScenegenError {
    fn from(err: std::io::Error) -> Self {
        ScenegenError::Io(err)
    }
}

impl From<serde_json::Error> for ScenegenError {
    fn from(err: serde_json::Error) -> Self {
        ScenegenError::Json(err)
    }
}

impl From<url::ParseError> for ScenegenError {
    fn from(err: url::ParseError) -> Self {
        ScenegenError::InvalidUrl(err)
    }
}

impl From<reqwest::Error> for ScenegenError {
    fn from(err: reqwest::Error) -> Self {
        ScenegenError::Http(err)
    }
}
