use std::fmt;

/// Classification of a validation diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Invalid,
    Required,
    NotFound,
    Forbidden,
    InternalError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Invalid => "Invalid value",
            ErrorKind::Required => "Required value",
            ErrorKind::NotFound => "Not found",
            ErrorKind::Forbidden => "Forbidden",
            ErrorKind::InternalError => "Internal error",
        };
        f.write_str(s)
    }
}

/// One validation diagnostic, carrying the structured field path it applies
/// to (e.g. `instance_group[api].job[router].consumes[nats]`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub path: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl ValidationError {
    pub fn invalid(path: impl Into<String>, value: &str, detail: &str) -> Self {
        Self {
            path: path.into(),
            kind: ErrorKind::Invalid,
            message: format!("Invalid value: '{value}': {detail}"),
        }
    }

    pub fn required(path: impl Into<String>, detail: &str) -> Self {
        Self {
            path: path.into(),
            kind: ErrorKind::Required,
            message: format!("Required value: {detail}"),
        }
    }

    pub fn not_found(path: impl Into<String>, detail: &str) -> Self {
        Self {
            path: path.into(),
            kind: ErrorKind::NotFound,
            message: detail.to_owned(),
        }
    }

    pub fn forbidden(path: impl Into<String>, detail: &str) -> Self {
        Self {
            path: path.into(),
            kind: ErrorKind::Forbidden,
            message: detail.to_owned(),
        }
    }

    pub fn internal(path: impl Into<String>, detail: &str) -> Self {
        Self {
            path: path.into(),
            kind: ErrorKind::InternalError,
            message: detail.to_owned(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}: {}", self.path, self.kind, self.message)
    }
}

/// Accumulating list of validation diagnostics, ordered by appearance.
///
/// Resolution stages append to one list rather than returning early, so a
/// user sees every problem in the manifest at once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorList(Vec<ValidationError>);

impl ErrorList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: ValidationError) {
        self.0.push(error);
    }

    pub fn extend(&mut self, other: ErrorList) {
        self.0.extend(other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ValidationError> {
        self.0.iter()
    }

    /// Ok when no diagnostics accumulated, Err(self) otherwise.
    pub fn into_result(self) -> Result<(), ErrorList> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorList {}

impl IntoIterator for ErrorList {
    type Item = ValidationError;
    type IntoIter = std::vec::IntoIter<ValidationError>;
    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl From<ValidationError> for ErrorList {
    fn from(error: ValidationError) -> Self {
        Self(vec![error])
    }
}
