//! Steady-state computation for preequilibration.

mod newton;
mod problem;

pub use newton::{get_solver, NewtonSolver, NewtonSolverDense, NewtonSolverSparse};
pub use problem::SteadyStateProblem;
