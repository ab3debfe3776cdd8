use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Snapshot is malformed or missing a required collection.
    Validation,
    /// Payload encoding is outside the supported set.
    UnsupportedFormat,
    NotFound,
    Storage,
    /// Another driver currently holds the task lease.
    Busy,
    Config,
    Other,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Other, msg)
    }

    pub fn new<M: Into<String>>(kind: ErrorKind, msg: M) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    pub fn validation<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Validation, msg)
    }

    pub fn storage<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Storage, msg)
    }

    pub fn not_found<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::NotFound, msg)
    }

    pub fn config<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Config, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }

    /// Re-wrap with extra context, keeping the kind.
    pub fn context(self, ctx: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            msg: format!("{ctx}: {}", self.msg),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::storage(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::validation(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
