use std::error::Error;
use std::fmt;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, ClassifierError>;

/// Errors raised while weighting, training, scoring or persisting classifiers.
#[derive(Debug)]
pub enum ClassifierError {
    /// Bad redshift bounds or bin count, negative multiplier, or a class
    /// missing from a user-supplied class weight mapping.
    InvalidWeightSpec(String),
    /// Unknown backend, architecture, sink, column, or an invalid fold count.
    Configuration(String),
    /// A class with non-zero weight has no prediction column.
    MissingPrediction { class: String },
    /// A classifier bundle already exists and overwriting was not requested.
    PersistenceConflict { path: PathBuf },
    /// Predict or write was called on a classifier that was never trained.
    NotTrained,
    /// An out-of-fold row was written twice or never written.
    FoldLeakage { row: usize },
    LengthMismatch { expected: usize, found: usize },
    Io(std::io::Error),
    Serialization(serde_json::Error),
    Tensor(candle_core::Error),
    Csv(csv::Error),
}

impl fmt::Display for ClassifierError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ClassifierError::InvalidWeightSpec(msg) => write!(f, "Invalid weight spec: {}", msg),
            ClassifierError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            ClassifierError::MissingPrediction { class } => write!(
                f,
                "No predictions available for class {}! Either compute them or set the weight for that class to 0.",
                class
            ),
            ClassifierError::PersistenceConflict { path } => {
                write!(f, "Classifier {} already exists! Can't write.", path.display())
            }
            ClassifierError::NotTrained => write!(f, "Classifier has not been trained"),
            ClassifierError::FoldLeakage { row } => write!(
                f,
                "Out-of-fold prediction row {} was not written exactly once",
                row
            ),
            ClassifierError::LengthMismatch { expected, found } => {
                write!(f, "Length mismatch: expected {}, found {}", expected, found)
            }
            ClassifierError::Io(e) => write!(f, "I/O error: {}", e),
            ClassifierError::Serialization(e) => write!(f, "Serialization error: {}", e),
            ClassifierError::Tensor(e) => write!(f, "Tensor error: {}", e),
            ClassifierError::Csv(e) => write!(f, "CSV error: {}", e),
        }
    }
}

impl Error for ClassifierError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ClassifierError::Io(e) => Some(e),
            ClassifierError::Serialization(e) => Some(e),
            ClassifierError::Tensor(e) => Some(e),
            ClassifierError::Csv(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ClassifierError {
    fn from(e: std::io::Error) -> Self {
        ClassifierError::Io(e)
    }
}

impl From<serde_json::Error> for ClassifierError {
    fn from(e: serde_json::Error) -> Self {
        ClassifierError::Serialization(e)
    }
}

impl From<candle_core::Error> for ClassifierError {
    fn from(e: candle_core::Error) -> Self {
        ClassifierError::Tensor(e)
    }
}

impl From<csv::Error> for ClassifierError {
    fn from(e: csv::Error) -> Self {
        ClassifierError::Csv(e)
    }
}
