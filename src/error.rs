use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Sql(#[from] rusqlite::Error),

    #[error(transparent)]
    Keyring(#[from] keyring::Error),

    #[error(transparent)]
    Layered(#[from] config::ConfigError),

    #[error(transparent)]
    TomlSer(#[from] toml::ser::Error),
}

/// Reasons the page text could not be turned into a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("page text is too short ({len} chars); the page may not be fully loaded, retry shortly")]
    PageNotReady { len: usize },

    #[error("usage data not found; make sure the usage page is fully loaded")]
    NotFound,
}

/// Failure of one fetch attempt. Cloned to every caller waiting on the attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("could not open the usage page: {0}")]
    Open(String),

    #[error("usage page did not respond: {0}")]
    Communication(String),

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("could not store usage data: {0}")]
    Storage(String),

    #[error("fetch attempt aborted: {0}")]
    Aborted(String),
}
