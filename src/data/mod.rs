//! Measurements going into a run and results coming out of it.

mod edata;
mod rdata;

pub use edata::ExpData;
pub use rdata::{Diagnostics, ReturnData, SteadyStateInfo, SteadyStateMethod};

use serde::Serialize;

/// Non-fatal condition raised during a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Warning {
    /// Short machine-readable identifier, e.g. `TOO_MUCH_EVENT`
    pub id: &'static str,
    pub message: String,
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.id, self.message)
    }
}
