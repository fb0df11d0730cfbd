use thiserror::Error;

pub type BrowserResult<T> = Result<T, BrowserError>;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error("cdp error: {0}")]
    Cdp(#[from] chromiumoxide::error::CdpError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timeout waiting for {0}")]
    Timeout(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("profile error: {0}")]
    Profile(String),
    #[error("page script failure: {0}")]
    Script(String),
    #[error("interrupted")]
    Interrupted,
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl BrowserError {
    pub fn is_timeout(&self) -> bool {
        match self {
            BrowserError::Timeout(_) => true,
            BrowserError::Cdp(err) => err.to_string().to_lowercase().contains("timeout"),
            _ => false,
        }
    }

    /// Errors raised by the evaluated script itself rather than by the
    /// transport carrying it.
    pub fn is_script_exception(&self) -> bool {
        matches!(
            self,
            BrowserError::Script(_)
                | BrowserError::Cdp(chromiumoxide::error::CdpError::JavascriptException(_))
        )
    }
}

impl From<tokio::task::JoinError> for BrowserError {
    fn from(err: tokio::task::JoinError) -> Self {
        BrowserError::Unexpected(err.to_string())
    }
}

impl From<serde_json::Error> for BrowserError {
    fn from(err: serde_json::Error) -> Self {
        BrowserError::Script(format!("malformed script result: {err}"))
    }
}
