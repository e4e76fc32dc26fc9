//! Numerical constants shared by the solvers.

/// Machine epsilon used for tolerances on time comparisons
pub const UNIT_ROUNDOFF: f64 = f64::EPSILON;

/// Floor for error norms to avoid division by zero
pub const TOLERANCE: f64 = 1e-16;

/// Safety factor of the step size controller
pub const SOL_BETA: f64 = 0.9;

/// Smallest factor by which a step may shrink after an error test
pub const SOL_SCALE_MIN: f64 = 0.1;

/// Largest step growth for low orders
pub const SOL_SCALE_MAX: f64 = 2.0;

/// Largest step growth for BDF orders >= 3
pub const SOL_SCALE_MAX_HIGH_ORDER: f64 = 1.2;

/// Step size reduction after a corrector convergence failure
pub const SOL_SCALE_CONV_FAIL: f64 = 0.25;

/// Maximum number of corrector iterations per step
pub const NEWTON_MAX_CORRECTOR_ITERATIONS: usize = 4;

/// Corrector convergence threshold on the weighted update norm
pub const NEWTON_CORRECTOR_TOLERANCE: f64 = 0.1;

/// Maximum number of error test failures within one step
pub const MAX_ERROR_TEST_FAILURES: usize = 10;

/// Maximum number of corrector failures within one step
pub const MAX_CONVERGENCE_FAILURES: usize = 10;

/// Maximum number of secant iterations when locating a root
pub const ROOT_MAX_ITERATIONS: usize = 100;

/// Roots are located to `ROOT_TOLERANCE_FACTOR * eps * (|t| + |h|)`
pub const ROOT_TOLERANCE_FACTOR: f64 = 100.0;

/// Newton iterations for consistent algebraic states
pub const IC_MAX_ITERATIONS: usize = 10;

/// Convergence threshold of the algebraic state correction
pub const IC_TOLERANCE: f64 = 0.0033;

/// Relative perturbation of central finite differences
pub const FD_RELATIVE_STEP: f64 = 6.055454452393343e-6;

/// Time horizons tried when searching a steady state by simulation
pub const STEADY_STATE_MAX_TIME: f64 = 1e6;

/// Maximum number of integration chunks in the steady-state search
pub const STEADY_STATE_MAX_CHUNKS: usize = 100;

// Status codes reported by the integrator
pub const STATUS_TOO_MUCH_WORK: i32 = -1;
pub const STATUS_ERR_FAILURE: i32 = -3;
pub const STATUS_CONV_FAILURE: i32 = -4;
pub const STATUS_ILL_INPUT: i32 = -22;

// Status codes reported by the Newton solver
pub const NEWTON_FACTORIZATION_FAILED: i32 = -1;
pub const NEWTON_SOLVE_FAILED: i32 = -2;
pub const NEWTON_NOT_CONVERGED: i32 = -3;
pub const NEWTON_DAMPING_FAILED: i32 = -4;
pub const NEWTON_NOT_IMPLEMENTED: i32 = -999;
