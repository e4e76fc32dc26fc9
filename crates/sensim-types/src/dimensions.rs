//! Model dimensions.

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Second-order sensitivity mode of an augmented model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecondOrderMode {
    /// Plain first-order model
    None,
    /// Full Hessian: one augmented block per model parameter
    Full,
    /// Hessian-vector product along a direction stored in the constants
    Directional,
}

impl Default for SecondOrderMode {
    fn default() -> Self {
        SecondOrderMode::None
    }
}

/// Problem dimensions, fixed for the lifetime of a model.
///
/// For augmented second-order models `nx`, `ny` and `nz` count all blocks
/// while the `*true` counts refer to the original system, so that
/// `nx = nxtrue * nj`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDimensions {
    /// Number of states
    pub nx: usize,
    /// Number of states of the non-augmented system
    pub nxtrue: usize,
    /// Number of observables
    pub ny: usize,
    pub nytrue: usize,
    /// Number of event observables
    pub nz: usize,
    pub nztrue: usize,
    /// Number of events (root functions)
    pub ne: usize,
    /// Number of model parameters
    pub np: usize,
    /// Number of constants
    pub nk: usize,
    /// Number of nonzeros of the sparse Jacobian
    pub nnz: usize,
    /// Dimension of the objective function
    pub nj: usize,
    /// Upper bandwidth of the Jacobian
    pub ubw: usize,
    /// Lower bandwidth of the Jacobian
    pub lbw: usize,
    /// Maximum number of recorded occurrences per event
    pub nmaxevent: usize,
    pub o2mode: SecondOrderMode,
}

impl ModelDimensions {
    /// Dimensions of a first-order model with `nx` states and `np` parameters
    pub fn new(nx: usize, np: usize) -> Self {
        Self {
            nx,
            nxtrue: nx,
            ny: 0,
            nytrue: 0,
            nz: 0,
            nztrue: 0,
            ne: 0,
            np,
            nk: 0,
            nnz: nx * nx,
            nj: 1,
            ubw: nx.saturating_sub(1),
            lbw: nx.saturating_sub(1),
            nmaxevent: 10,
            o2mode: SecondOrderMode::None,
        }
    }

    pub fn with_observables(mut self, ny: usize) -> Self {
        self.ny = ny;
        self.nytrue = ny;
        self
    }

    pub fn with_events(mut self, ne: usize, nz: usize) -> Self {
        self.ne = ne;
        self.nz = nz;
        self.nztrue = nz;
        self
    }

    pub fn with_constants(mut self, nk: usize) -> Self {
        self.nk = nk;
        self
    }

    pub fn with_nnz(mut self, nnz: usize) -> Self {
        self.nnz = nnz;
        self
    }

    pub fn with_bandwidth(mut self, ubw: usize, lbw: usize) -> Self {
        self.ubw = ubw;
        self.lbw = lbw;
        self
    }

    pub fn with_max_events(mut self, nmaxevent: usize) -> Self {
        self.nmaxevent = nmaxevent;
        self
    }

    /// Turn the dimensions into those of an augmented second-order model
    /// with `nj` objective components. The `*true` counts stay as they are.
    pub fn augmented(mut self, mode: SecondOrderMode, nj: usize) -> Self {
        self.o2mode = mode;
        self.nj = nj;
        self.nx = self.nxtrue * nj;
        self.ny = self.nytrue * nj;
        self.nz = self.nztrue * nj;
        self.nnz = self.nx * self.nx;
        self.ubw = self.nx.saturating_sub(1);
        self.lbw = self.nx.saturating_sub(1);
        self
    }

    /// Capacity of the discontinuity store
    pub fn max_discontinuities(&self) -> usize {
        self.nmaxevent * self.ne
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: String| ConfigError::InvalidValue { field, reason };
        if self.nj == 0 {
            return Err(invalid("nj", "objective dimension must be at least 1".into()));
        }
        if self.nx != self.nxtrue * self.nj {
            return Err(invalid(
                "nx",
                format!("nx = {} is not nxtrue * nj = {}", self.nx, self.nxtrue * self.nj),
            ));
        }
        if self.ny != self.nytrue * self.nj || self.nz != self.nztrue * self.nj {
            return Err(invalid("ny", "augmented observable counts must be multiples of nj".into()));
        }
        if self.nnz > self.nx * self.nx {
            return Err(invalid("nnz", format!("{} exceeds nx * nx", self.nnz)));
        }
        match self.o2mode {
            SecondOrderMode::None if self.nj != 1 => {
                Err(invalid("nj", "first-order models have nj = 1".into()))
            }
            SecondOrderMode::Full if self.nj != self.np + 1 => Err(invalid(
                "nj",
                format!("full second-order models need nj = np + 1 = {}", self.np + 1),
            )),
            SecondOrderMode::Directional if self.nj != 2 => {
                Err(invalid("nj", "directional second-order models need nj = 2".into()))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let dims = ModelDimensions::new(3, 2).with_observables(1).with_events(2, 1);
        assert_eq!(dims.nnz, 9);
        assert_eq!(dims.nmaxevent, 10);
        assert_eq!(dims.max_discontinuities(), 20);
        assert!(dims.validate().is_ok());
    }

    #[test]
    fn test_augmented_dimensions() {
        let dims = ModelDimensions::new(2, 2)
            .with_observables(1)
            .augmented(SecondOrderMode::Full, 3);
        assert_eq!(dims.nx, 6);
        assert_eq!(dims.nxtrue, 2);
        assert_eq!(dims.ny, 3);
        assert!(dims.validate().is_ok());

        let wrong = ModelDimensions::new(2, 2).augmented(SecondOrderMode::Directional, 3);
        assert!(wrong.validate().is_err());
    }
}
