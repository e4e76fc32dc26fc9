//! Model callback interface.
//!
//! A [`Model`] is a plain struct of boxed closures. Only the initial state
//! and the right-hand side are mandatory; everything else falls back to
//! finite differences or to the Gaussian noise model, see [`ModelContext`].
//!
//! Callbacks write into caller-provided output buffers and report failures
//! through [`CallbackResult`]. Parameter indices passed to callbacks are
//! model parameter indices, not positions in `plist`.

mod context;
mod finite_diff;
pub mod noise;

pub use context::ModelContext;

use nalgebra::DMatrix;
use sensim_types::{ModelDimensions, SecondOrderMode};

use crate::error::{CallbackError, CallbackResult, Result, SimulationError};
use crate::linalg::{BandMatrix, SparseMatrix};

/// Arguments shared by all state-dependent callbacks
#[derive(Debug, Clone, Copy)]
pub struct EvalPoint<'a> {
    pub t: f64,
    pub x: &'a [f64],
    /// Derivative of the state; only meaningful for DAE models
    pub dx: &'a [f64],
    /// Unscaled model parameters
    pub p: &'a [f64],
    pub k: &'a [f64],
    /// Heaviside indicators, one per event
    pub h: &'a [f64],
}

/// Additional arguments of event callbacks
#[derive(Debug, Clone, Copy)]
pub struct EventArgs<'a> {
    /// Right-hand side after the event
    pub xdot: &'a [f64],
    /// Right-hand side before the event
    pub xdot_old: &'a [f64],
    /// State sensitivity for the current parameter, empty if not applicable
    pub sx: &'a [f64],
    /// Event time sensitivity for the current parameter
    pub stau: f64,
    /// Adjoint state, empty outside the backward pass
    pub xb: &'a [f64],
}

/// Arguments of objective callbacks for one observable
#[derive(Debug, Clone, Copy)]
pub struct NoiseArgs<'a> {
    /// Simulated values of all observables (or event observables)
    pub values: &'a [f64],
    /// Standard deviations of all observables
    pub sigma: &'a [f64],
    /// Measurement of the current observable
    pub measurement: f64,
    pub p: &'a [f64],
    pub k: &'a [f64],
}

pub type InitialStateFn = Box<dyn Fn(&mut [f64], f64, &[f64], &[f64]) -> CallbackResult + Send + Sync>;
pub type InitialSensFn =
    Box<dyn Fn(&mut [f64], usize, f64, &[f64], &[f64], &[f64]) -> CallbackResult + Send + Sync>;
pub type VectorFn = Box<dyn Fn(&mut [f64], &EvalPoint<'_>) -> CallbackResult + Send + Sync>;
pub type MatrixFn = Box<dyn Fn(&mut DMatrix<f64>, &EvalPoint<'_>) -> CallbackResult + Send + Sync>;
pub type SparseFn = Box<dyn Fn(&mut SparseMatrix, &EvalPoint<'_>) -> CallbackResult + Send + Sync>;
pub type BandFn = Box<dyn Fn(&mut BandMatrix, &EvalPoint<'_>) -> CallbackResult + Send + Sync>;
pub type ParamVectorFn = Box<dyn Fn(&mut [f64], usize, &EvalPoint<'_>) -> CallbackResult + Send + Sync>;
pub type QuadratureFn =
    Box<dyn Fn(&mut [f64], usize, &EvalPoint<'_>, &[f64]) -> CallbackResult + Send + Sync>;
pub type SigmaFn = Box<dyn Fn(&mut [f64], f64, &[f64], &[f64]) -> CallbackResult + Send + Sync>;
pub type SigmaSensFn =
    Box<dyn Fn(&mut [f64], usize, f64, &[f64], &[f64]) -> CallbackResult + Send + Sync>;
pub type EventVectorFn = Box<dyn Fn(&mut [f64], usize, &EvalPoint<'_>) -> CallbackResult + Send + Sync>;
pub type EventMatrixFn =
    Box<dyn Fn(&mut DMatrix<f64>, usize, &EvalPoint<'_>) -> CallbackResult + Send + Sync>;
pub type EventParamFn =
    Box<dyn Fn(&mut [f64], usize, usize, &EvalPoint<'_>) -> CallbackResult + Send + Sync>;
pub type ObjectiveFn = Box<dyn Fn(&mut [f64], usize, &NoiseArgs<'_>) -> CallbackResult + Send + Sync>;
pub type ObjectiveGradFn =
    Box<dyn Fn(&mut DMatrix<f64>, usize, &NoiseArgs<'_>) -> CallbackResult + Send + Sync>;
pub type StauFn = Box<
    dyn Fn(usize, usize, &EvalPoint<'_>, &EventArgs<'_>) -> std::result::Result<f64, CallbackError>
        + Send
        + Sync,
>;
pub type JumpFn =
    Box<dyn Fn(&mut [f64], usize, &EvalPoint<'_>, &EventArgs<'_>) -> CallbackResult + Send + Sync>;
pub type ParamJumpFn = Box<
    dyn Fn(&mut [f64], usize, usize, &EvalPoint<'_>, &EventArgs<'_>) -> CallbackResult + Send + Sync,
>;

/// Capability struct of a concrete model
pub struct Model {
    pub(crate) name: String,
    pub(crate) dims: ModelDimensions,
    /// 1 for differential, 0 for algebraic states
    pub(crate) id: Vec<f64>,
    /// Event index of every event observable
    pub(crate) z2event: Vec<usize>,
    /// Pattern of the sparse Jacobian callback
    pub(crate) sparsity: Option<SparseMatrix>,
    /// `nx x np` pattern of the sparse parameter derivative callback
    pub(crate) dxdotdp_sparsity: Option<SparseMatrix>,

    pub(crate) x0: InitialStateFn,
    pub(crate) sx0: Option<InitialSensFn>,
    pub(crate) xdot: VectorFn,
    pub(crate) jacobian: Option<MatrixFn>,
    pub(crate) jacobian_sparse: Option<SparseFn>,
    pub(crate) jacobian_band: Option<BandFn>,
    pub(crate) jacobian_b: Option<MatrixFn>,
    pub(crate) dxdotdp: Option<ParamVectorFn>,
    pub(crate) dxdotdp_sparse: Option<SparseFn>,
    pub(crate) qbdot: Option<QuadratureFn>,
    pub(crate) root: Option<VectorFn>,

    pub(crate) y: Option<VectorFn>,
    pub(crate) dydx: Option<MatrixFn>,
    pub(crate) dydp: Option<ParamVectorFn>,
    pub(crate) sigma_y: Option<SigmaFn>,
    pub(crate) dsigma_ydp: Option<SigmaSensFn>,
    pub(crate) jy: Option<ObjectiveFn>,
    pub(crate) djydy: Option<ObjectiveGradFn>,
    pub(crate) djydsigma: Option<ObjectiveGradFn>,

    pub(crate) z: Option<EventVectorFn>,
    pub(crate) dzdx: Option<EventMatrixFn>,
    pub(crate) dzdp: Option<EventParamFn>,
    pub(crate) rz: Option<EventVectorFn>,
    pub(crate) drzdx: Option<EventMatrixFn>,
    pub(crate) drzdp: Option<EventParamFn>,
    pub(crate) sigma_z: Option<SigmaFn>,
    pub(crate) dsigma_zdp: Option<SigmaSensFn>,
    pub(crate) jz: Option<ObjectiveFn>,
    pub(crate) djzdz: Option<ObjectiveGradFn>,
    pub(crate) djzdsigma: Option<ObjectiveGradFn>,
    pub(crate) jrz: Option<ObjectiveFn>,
    pub(crate) djrzdz: Option<ObjectiveGradFn>,
    pub(crate) djrzdsigma: Option<ObjectiveGradFn>,

    pub(crate) stau: Option<StauFn>,
    pub(crate) deltax: Option<JumpFn>,
    pub(crate) deltasx: Option<ParamJumpFn>,
    pub(crate) deltaxb: Option<JumpFn>,
    pub(crate) deltaqb: Option<ParamJumpFn>,
}

impl Model {
    /// Start building a model from its mandatory callbacks
    pub fn builder<X0, F>(name: impl Into<String>, dims: ModelDimensions, x0: X0, xdot: F) -> ModelBuilder
    where
        X0: Fn(&mut [f64], f64, &[f64], &[f64]) -> CallbackResult + Send + Sync + 'static,
        F: Fn(&mut [f64], &EvalPoint<'_>) -> CallbackResult + Send + Sync + 'static,
    {
        let nx = dims.nx;
        ModelBuilder {
            model: Model {
                name: name.into(),
                dims,
                id: vec![1.0; nx],
                z2event: Vec::new(),
                sparsity: None,
                dxdotdp_sparsity: None,
                x0: Box::new(x0),
                sx0: None,
                xdot: Box::new(xdot),
                jacobian: None,
                jacobian_sparse: None,
                jacobian_band: None,
                jacobian_b: None,
                dxdotdp: None,
                dxdotdp_sparse: None,
                qbdot: None,
                root: None,
                y: None,
                dydx: None,
                dydp: None,
                sigma_y: None,
                dsigma_ydp: None,
                jy: None,
                djydy: None,
                djydsigma: None,
                z: None,
                dzdx: None,
                dzdp: None,
                rz: None,
                drzdx: None,
                drzdp: None,
                sigma_z: None,
                dsigma_zdp: None,
                jz: None,
                djzdz: None,
                djzdsigma: None,
                jrz: None,
                djrzdz: None,
                djrzdsigma: None,
                stau: None,
                deltax: None,
                deltasx: None,
                deltaxb: None,
                deltaqb: None,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dims(&self) -> &ModelDimensions {
        &self.dims
    }

    pub fn id(&self) -> &[f64] {
        &self.id
    }

    /// Whether any state is algebraic
    pub fn is_dae(&self) -> bool {
        self.id.iter().any(|&v| v == 0.0)
    }

    pub fn z2event(&self) -> &[usize] {
        &self.z2event
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.name)
            .field("dims", &self.dims)
            .field("dae", &self.is_dae())
            .finish_non_exhaustive()
    }
}

macro_rules! callback_setters {
    ($($(#[$doc:meta])* $name:ident: Fn($($arg:ty),*) -> $ret:ty;)*) => {
        $(
            $(#[$doc])*
            pub fn $name<F>(mut self, f: F) -> Self
            where
                F: Fn($($arg),*) -> $ret + Send + Sync + 'static,
            {
                self.model.$name = Some(Box::new(f));
                self
            }
        )*
    };
}

/// Builder for [`Model`]
pub struct ModelBuilder {
    model: Model,
}

impl ModelBuilder {
    /// Mark states as differential (1) or algebraic (0)
    pub fn state_ids(mut self, id: Vec<f64>) -> Self {
        self.model.id = id;
        self
    }

    /// Event index of every event observable
    pub fn z2event(mut self, z2event: Vec<usize>) -> Self {
        self.model.z2event = z2event;
        self
    }

    /// Sparse Jacobian callback together with its CSC pattern
    pub fn jacobian_sparse<F>(mut self, col_ptr: Vec<usize>, row_idx: Vec<usize>, f: F) -> Result<Self>
    where
        F: Fn(&mut SparseMatrix, &EvalPoint<'_>) -> CallbackResult + Send + Sync + 'static,
    {
        let nx = self.model.dims.nx;
        let pattern = SparseMatrix::new(nx, nx, col_ptr, row_idx)?;
        SimulationError::check_len("sparse Jacobian nonzeros", self.model.dims.nnz, pattern.nnz())?;
        self.model.sparsity = Some(pattern);
        self.model.jacobian_sparse = Some(Box::new(f));
        Ok(self)
    }

    /// Derivative of the right-hand side w.r.t. all model parameters as one
    /// `nx x np` CSC matrix
    pub fn dxdotdp_sparse<F>(mut self, col_ptr: Vec<usize>, row_idx: Vec<usize>, f: F) -> Result<Self>
    where
        F: Fn(&mut SparseMatrix, &EvalPoint<'_>) -> CallbackResult + Send + Sync + 'static,
    {
        let dims = &self.model.dims;
        let pattern = SparseMatrix::new(dims.nx, dims.np, col_ptr, row_idx)?;
        self.model.dxdotdp_sparsity = Some(pattern);
        self.model.dxdotdp_sparse = Some(Box::new(f));
        Ok(self)
    }

    callback_setters! {
        /// Initial state sensitivity for one model parameter
        sx0: Fn(&mut [f64], usize, f64, &[f64], &[f64], &[f64]) -> CallbackResult;
        /// Dense Jacobian of the right-hand side
        jacobian: Fn(&mut DMatrix<f64>, &EvalPoint<'_>) -> CallbackResult;
        jacobian_band: Fn(&mut BandMatrix, &EvalPoint<'_>) -> CallbackResult;
        /// Jacobian of the adjoint right-hand side (`-Jᵀ`)
        jacobian_b: Fn(&mut DMatrix<f64>, &EvalPoint<'_>) -> CallbackResult;
        /// Derivative of the right-hand side w.r.t. one model parameter
        dxdotdp: Fn(&mut [f64], usize, &EvalPoint<'_>) -> CallbackResult;
        /// Adjoint quadrature right-hand side for one parameter, `nj` values
        qbdot: Fn(&mut [f64], usize, &EvalPoint<'_>, &[f64]) -> CallbackResult;
        /// Root functions, one per event
        root: Fn(&mut [f64], &EvalPoint<'_>) -> CallbackResult;
        /// Observables
        y: Fn(&mut [f64], &EvalPoint<'_>) -> CallbackResult;
        dydx: Fn(&mut DMatrix<f64>, &EvalPoint<'_>) -> CallbackResult;
        dydp: Fn(&mut [f64], usize, &EvalPoint<'_>) -> CallbackResult;
        /// Observable standard deviations
        sigma_y: Fn(&mut [f64], f64, &[f64], &[f64]) -> CallbackResult;
        dsigma_ydp: Fn(&mut [f64], usize, f64, &[f64], &[f64]) -> CallbackResult;
        /// Negative log-likelihood of one observable, `nj` values
        jy: Fn(&mut [f64], usize, &NoiseArgs<'_>) -> CallbackResult;
        djydy: Fn(&mut DMatrix<f64>, usize, &NoiseArgs<'_>) -> CallbackResult;
        djydsigma: Fn(&mut DMatrix<f64>, usize, &NoiseArgs<'_>) -> CallbackResult;
        /// Event observables of one event
        z: Fn(&mut [f64], usize, &EvalPoint<'_>) -> CallbackResult;
        /// Total derivative of the event observables w.r.t. the state,
        /// including the dependence of the event time
        dzdx: Fn(&mut DMatrix<f64>, usize, &EvalPoint<'_>) -> CallbackResult;
        dzdp: Fn(&mut [f64], usize, usize, &EvalPoint<'_>) -> CallbackResult;
        /// Regularization of event observables at the final time
        rz: Fn(&mut [f64], usize, &EvalPoint<'_>) -> CallbackResult;
        drzdx: Fn(&mut DMatrix<f64>, usize, &EvalPoint<'_>) -> CallbackResult;
        drzdp: Fn(&mut [f64], usize, usize, &EvalPoint<'_>) -> CallbackResult;
        sigma_z: Fn(&mut [f64], f64, &[f64], &[f64]) -> CallbackResult;
        dsigma_zdp: Fn(&mut [f64], usize, f64, &[f64], &[f64]) -> CallbackResult;
        jz: Fn(&mut [f64], usize, &NoiseArgs<'_>) -> CallbackResult;
        djzdz: Fn(&mut DMatrix<f64>, usize, &NoiseArgs<'_>) -> CallbackResult;
        djzdsigma: Fn(&mut DMatrix<f64>, usize, &NoiseArgs<'_>) -> CallbackResult;
        jrz: Fn(&mut [f64], usize, &NoiseArgs<'_>) -> CallbackResult;
        djrzdz: Fn(&mut DMatrix<f64>, usize, &NoiseArgs<'_>) -> CallbackResult;
        djrzdsigma: Fn(&mut DMatrix<f64>, usize, &NoiseArgs<'_>) -> CallbackResult;
        /// Sensitivity of the event time for event `ie` and one parameter
        stau: Fn(usize, usize, &EvalPoint<'_>, &EventArgs<'_>) -> std::result::Result<f64, CallbackError>;
        /// State bolus of an event
        deltax: Fn(&mut [f64], usize, &EvalPoint<'_>, &EventArgs<'_>) -> CallbackResult;
        /// Sensitivity bolus of an event for one parameter
        deltasx: Fn(&mut [f64], usize, usize, &EvalPoint<'_>, &EventArgs<'_>) -> CallbackResult;
        /// Adjoint state jump of an event
        deltaxb: Fn(&mut [f64], usize, &EvalPoint<'_>, &EventArgs<'_>) -> CallbackResult;
        /// Adjoint quadrature jump of an event for one parameter, `nj` values
        deltaqb: Fn(&mut [f64], usize, usize, &EvalPoint<'_>, &EventArgs<'_>) -> CallbackResult;
    }

    pub fn build(self) -> Result<Model> {
        let model = self.model;
        let dims = &model.dims;
        dims.validate()?;
        SimulationError::check_len("state ids", dims.nx, model.id.len())?;
        if model.id.iter().any(|&v| v != 0.0 && v != 1.0) {
            return Err(SimulationError::setup("state ids must be 0 (algebraic) or 1 (differential)"));
        }
        if dims.ne > 0 && model.root.is_none() {
            return Err(SimulationError::setup("models with events need a root function"));
        }
        if dims.ny > 0 && model.y.is_none() {
            return Err(SimulationError::setup("models with observables need an observable function"));
        }
        if dims.nz > 0 {
            if model.z.is_none() {
                return Err(SimulationError::setup("models with event observables need a z function"));
            }
            SimulationError::check_len("z2event", dims.nz, model.z2event.len())?;
            if model.z2event.iter().any(|&ie| ie >= dims.ne) {
                return Err(SimulationError::setup("z2event refers to an unknown event"));
            }
        }
        if dims.o2mode != SecondOrderMode::None || dims.nj > 1 {
            let missing = [
                ("jy", dims.ny > 0 && model.jy.is_none()),
                ("djydy", dims.ny > 0 && model.djydy.is_none()),
                ("jz", dims.nz > 0 && model.jz.is_none()),
                ("qbdot", model.qbdot.is_none()),
            ];
            if let Some((name, _)) = missing.iter().find(|(_, m)| *m) {
                return Err(SimulationError::setup(format!(
                    "augmented models with nj > 1 must provide {name}"
                )));
            }
        }
        Ok(model)
    }
}
