use thiserror::Error;

#[derive(Debug, Error)]
/// Error taxonomy for the linking flows, mapped onto HTTP status codes at the
/// boundary.
///
/// `NotFound` is user-facing and instructs a restart of the flow; it is not a
/// provider failure and is never logged as an error. `Internal` shows a
/// generic message to the user; the detail is kept for logging only.
pub enum LinkError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Ineligible(String),
    #[error("{0}")]
    Provider(String),
    #[error("internal error, please contact the stewards")]
    Internal(String),
}

impl From<anyhow::Error> for LinkError {
    fn from(error: anyhow::Error) -> Self {
        Self::Internal(format!("{error:#}"))
    }
}

impl LinkError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::Ineligible(_) => 400,
            Self::Provider(_) | Self::Internal(_) => 500,
        }
    }

    /// The non-user-facing detail, present only for internal failures.
    pub fn detail(&self) -> Option<&str> {
        match self {
            Self::Internal(detail) => Some(detail),
            _ => None,
        }
    }

    pub fn not_found_restart(command: &str) -> Self {
        Self::NotFound(format!(
            "Not found in pending requests, try running {command} again"
        ))
    }
}
