use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("WebDriver error ({status}): {error}: {message}")]
    WebDriver {
        status: u16,
        error: String,
        message: String,
    },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Element detached from document: {0}")]
    Detached(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Browser session is dead: {0}")]
    SessionDead(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Unexpected script result: {0}")]
    ScriptResult(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl ScanError {
    /// Selector misses, detached elements and short timeouts: log and move on.
    pub fn is_transient(&self) -> bool {
        match self {
            ScanError::ElementNotFound(_) | ScanError::Detached(_) | ScanError::Timeout(_) => true,
            ScanError::WebDriver { error, .. } => matches!(
                error.as_str(),
                "stale element reference"
                    | "no such element"
                    | "element click intercepted"
                    | "element not interactable"
                    | "move target out of bounds"
                    | "timeout"
                    | "script timeout"
            ),
            _ => false,
        }
    }

    /// The page (or the whole session) stopped responding and must be replaced.
    pub fn is_session_dead(&self) -> bool {
        match self {
            ScanError::SessionDead(_) => true,
            ScanError::WebDriver { error, message, .. } => match error.as_str() {
                "invalid session id" | "no such window" | "session not created" => true,
                "unknown error" => {
                    let message = message.to_lowercase();
                    CRASH_MARKERS.iter().any(|marker| message.contains(marker))
                }
                _ => false,
            },
            // A renderer that hangs shows up as a client-side timeout.
            ScanError::HttpError(e) => e.is_connect() || e.is_timeout(),
            _ => false,
        }
    }
}

/// Driver messages for a tab or browser that crashed underneath the session.
const CRASH_MARKERS: [&str; 3] = ["page crash", "disconnected", "not reachable"];

pub type Result<T> = std::result::Result<T, ScanError>;
