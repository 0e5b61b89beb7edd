use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    MissingTemplate,
    NoFields,
    NoRows,
}

impl ValidationError {
    pub fn message(&self) -> &'static str {
        match self {
            ValidationError::MissingTemplate => "No template found. Upload template first.",
            ValidationError::NoFields => "No fields configured. Configure fields first.",
            ValidationError::NoRows => "No data uploaded. Upload data first.",
        }
    }
}

#[derive(Debug)]
pub enum CertStampError {
    Validation(ValidationError),
    Decode(String),
    SurfaceUnavailable(String),
    Encode(String),
    Packaging(String),
    Save(String),
    Cancelled { completed: usize, total: usize },
    InvalidConfiguration(String),
    Io(std::io::Error),
}

impl CertStampError {
    // Only these reach the user; row-level failures are absorbed by the batch.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            CertStampError::Validation(_)
                | CertStampError::Packaging(_)
                | CertStampError::Save(_)
                | CertStampError::Cancelled { .. }
        )
    }
}

impl fmt::Display for CertStampError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertStampError::Validation(err) => write!(f, "{}", err.message()),
            CertStampError::Decode(message) => write!(f, "template decode failed: {}", message),
            CertStampError::SurfaceUnavailable(message) => {
                write!(f, "drawing surface unavailable: {}", message)
            }
            CertStampError::Encode(message) => write!(f, "png encode failed: {}", message),
            CertStampError::Packaging(message) => write!(
                f,
                "failed to create ZIP ({}). Try generating smaller batches.",
                message
            ),
            CertStampError::Save(message) => write!(f, "save failed: {}", message),
            CertStampError::Cancelled { completed, total } => {
                write!(f, "batch cancelled after {} of {} rows", completed, total)
            }
            CertStampError::InvalidConfiguration(message) => {
                write!(f, "invalid configuration: {}", message)
            }
            CertStampError::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for CertStampError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CertStampError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CertStampError {
    fn from(value: std::io::Error) -> Self {
        CertStampError::Io(value)
    }
}

impl From<ValidationError> for CertStampError {
    fn from(value: ValidationError) -> Self {
        CertStampError::Validation(value)
    }
}
