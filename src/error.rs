use thiserror::Error;

/// A time expression that could not be read as a clock time or instant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot interpret {input:?} as a time")]
pub struct TimeParseError {
    pub input: String,
}

impl TimeParseError {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// Network or transport failure, after local retries were exhausted.
    #[error("fetch failed for {url}: {reason}")]
    Fetch { url: String, reason: String },

    /// Markup did not match any pattern the adapter knows about.
    #[error("parse failed for {url}: {reason}")]
    Parse { url: String, reason: String },

    #[error(transparent)]
    TimeParse(#[from] TimeParseError),

    /// Missing or invalid endpoint, credential or setting. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("render failed for {url}: {reason}")]
    Render { url: String, reason: String },

    #[error("store error: {0}")]
    Store(String),
}

impl Error {
    pub fn fetch(url: &str, reason: impl ToString) -> Self {
        Error::Fetch {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn parse(url: &str, reason: impl ToString) -> Self {
        Error::Parse {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn render(url: &str, reason: impl ToString) -> Self {
        Error::Render {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl<'a> From<scraper::error::SelectorErrorKind<'a>> for Error {
    fn from(e: scraper::error::SelectorErrorKind<'a>) -> Self {
        Error::Parse {
            url: String::new(),
            reason: format!("invalid selector: {e}"),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
