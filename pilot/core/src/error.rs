use std::fmt;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures reported by config stores and service registries.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The type is not part of the store's descriptor set, or the store
    /// refuses direct mutation of it.
    #[error("unknown type {0:?}")]
    UnknownType(String),

    #[error("invalid {ty}: {source}")]
    ValidationFailed {
        ty: String,
        #[source]
        source: ValidationError,
    },

    #[error("{ty} {key:?} not found")]
    NotFound { ty: String, key: String },

    #[error("{ty} {key:?} already exists")]
    AlreadyExists { ty: String, key: String },

    #[error("{ty} {key:?} has revision {actual:?}, not {expected:?}")]
    RevisionMismatch {
        ty: String,
        key: String,
        expected: String,
        actual: String,
    },

    /// The back-end could not be reached.
    #[error("back-end unavailable: {0}")]
    Unavailable(String),

    /// Two stores advertise the same type.
    #[error("type {0:?} is provided by more than one store")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// The error kinds, without payloads.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    UnknownType,
    ValidationFailed,
    NotFound,
    AlreadyExists,
    RevisionMismatch,
    Unavailable,
    Conflict,
    Internal,
}

/// A list of problems found while validating one object.
///
/// Validators keep going after the first problem so that callers see every
/// issue at once.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidationError {
    errors: Vec<String>,
}

// === impl Error ===

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownType(_) => ErrorKind::UnknownType,
            Self::ValidationFailed { .. } => ErrorKind::ValidationFailed,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::RevisionMismatch { .. } => ErrorKind::RevisionMismatch,
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn validation(ty: impl ToString, source: ValidationError) -> Self {
        Self::ValidationFailed {
            ty: ty.to_string(),
            source,
        }
    }

    pub fn not_found(ty: impl ToString, key: impl ToString) -> Self {
        Self::NotFound {
            ty: ty.to_string(),
            key: key.to_string(),
        }
    }

    pub fn already_exists(ty: impl ToString, key: impl ToString) -> Self {
        Self::AlreadyExists {
            ty: ty.to_string(),
            key: key.to_string(),
        }
    }
}

// === impl ValidationError ===

impl ValidationError {
    pub fn new(msg: impl ToString) -> Self {
        Self {
            errors: vec![msg.to_string()],
        }
    }

    pub fn push(&mut self, msg: impl ToString) {
        self.errors.push(msg.to_string());
    }

    /// Appends the problems of a nested validation, if any.
    pub fn merge(&mut self, res: Result<(), ValidationError>) {
        if let Err(e) = res {
            self.errors.extend(e.errors);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn into_result(self) -> Result<(), ValidationError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.as_slice() {
            [] => f.write_str("no errors"),
            [one] => f.write_str(one),
            many => {
                write!(f, "{} errors occurred:", many.len())?;
                for e in many {
                    write!(f, " {e};")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<String> for ValidationError {
    fn from(msg: String) -> Self {
        Self::new(msg)
    }
}

impl From<&str> for ValidationError {
    fn from(msg: &str) -> Self {
        Self::new(msg)
    }
}
