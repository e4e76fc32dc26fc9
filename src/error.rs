//! Error types shared by all simulation phases.

use sensim_types::ConfigError;
use thiserror::Error;

use crate::data::ReturnData;

/// Failure reported by a user-supplied model callback
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct CallbackError(pub String);

impl CallbackError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Result type of model callbacks
pub type CallbackResult = std::result::Result<(), CallbackError>;

/// Failures of the linear algebra layer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinalgError {
    #[error("Matrix is singular")]
    Singular,

    #[error("Sparse factorization failed: {0}")]
    Factorization(String),

    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    Shape {
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("Entry ({row}, {col}) is not part of the sparsity pattern")]
    NotInPattern { row: usize, col: usize },
}

/// Errors that abort a simulation run
#[derive(Error, Debug)]
pub enum SimulationError {
    #[error("Setup failure: {0}")]
    Setup(String),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Integration failure at t = {t} (status {code})")]
    IntegrationFailure { code: i32, t: f64 },

    #[error("Backward integration failure at t = {t} (status {code})")]
    IntegrationFailureB { code: i32, t: f64 },

    #[error("Newton solver failed in {function} (status {code})")]
    NewtonFailure { code: i32, function: &'static str },

    #[error("The simulation is stuck in an event at t = {t}; try tighter tolerances")]
    EventStuck { t: f64 },

    #[error("Event {ie} has a root at the initial time")]
    StartedInEvent { ie: usize },

    #[error("Model function {function} failed: {message}")]
    Model {
        function: &'static str,
        message: String,
    },

    #[error("Model function {function} returned Inf at index {index}")]
    NonFinite { function: &'static str, index: usize },

    #[error("Dimension mismatch for {what}: expected {expected}, got {actual}")]
    Dimension {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error(transparent)]
    Linalg(#[from] LinalgError),
}

impl SimulationError {
    pub fn setup(message: impl Into<String>) -> Self {
        SimulationError::Setup(message.into())
    }

    pub(crate) fn model(function: &'static str, err: CallbackError) -> Self {
        SimulationError::Model {
            function,
            message: err.0,
        }
    }

    pub(crate) fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<()> {
        if expected == actual {
            Ok(())
        } else {
            Err(SimulationError::Dimension {
                what,
                expected,
                actual,
            })
        }
    }
}

pub type Result<T> = std::result::Result<T, SimulationError>;

/// A failed run together with the return data written so far.
///
/// Quantities that were not computed because of the failure are set to NaN.
#[derive(Error, Debug)]
#[error("{error}")]
pub struct SimulationFailure {
    #[source]
    pub error: SimulationError,
    pub rdata: Box<ReturnData>,
}
