//! sensim - ODE/DAE simulation with parameter sensitivities
//!
//! Simulates models given as plain callback structs with a stiff BDF
//! integrator and computes, on request, first- and second-order
//! sensitivities of states, observables and a Gaussian log-likelihood.
//!
//! # Architecture
//!
//! - [`model`]: the callback interface and [`ModelContext`], which supplies
//!   finite-difference defaults for every derivative a model leaves out
//! - [`solvers`]: the [`Integrator`](solvers::Integrator) contract and the
//!   built-in BDF engine with root finding and adjoint replay
//! - [`forward`] / [`backward`]: drivers for the forward pass with events
//!   and the adjoint backward pass
//! - [`steadystate`]: Newton and simulation-based preequilibration
//! - [`chain_rule`]: conversion to log-scaled parameters
//!
//! # Example
//!
//! ```rust,ignore
//! use sensim::*;
//!
//! let model = Model::builder("decay", ModelDimensions::new(1, 1), |x0, _, _, _| {
//!     x0[0] = 1.0;
//!     Ok(())
//! }, |xdot, pt| {
//!     xdot[0] = -pt.p[0] * pt.x[0];
//!     Ok(())
//! })
//! .build()?;
//! let conditions = Conditions::new(vec![0.0, 1.0, 2.0], vec![0.5]);
//! let rdata = run_simulation(&model, &conditions, &SimulationSettings::default(), None)?;
//! ```

pub mod backward;
pub mod chain_rule;
pub mod data;
pub mod error;
pub mod forward;
pub mod linalg;
pub mod model;
pub mod simulation;
pub mod solvers;
pub mod steadystate;
pub mod utils;

pub use data::{ExpData, ReturnData, Warning};
pub use error::{CallbackError, CallbackResult, Result, SimulationError, SimulationFailure};
pub use model::{EvalPoint, EventArgs, Model, ModelContext, NoiseArgs};
pub use sensim_types::*;
pub use simulation::run_simulation;
