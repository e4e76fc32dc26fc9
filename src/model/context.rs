use std::cell::RefCell;

use nalgebra::{DMatrix, DVector};
use sensim_types::ModelDimensions;

use super::{finite_diff, noise, EvalPoint, EventArgs, Model, NoiseArgs};
use crate::data::Warning;
use crate::error::{CallbackResult, Result, SimulationError};
use crate::linalg::{BandMatrix, SparseMatrix};

/// A model bound to the parameters and constants of one run.
///
/// All evaluations go through this type: it allocates output buffers,
/// checks dimensions, supplies default implementations for callbacks the
/// model leaves out, and applies the NaN/Inf policy to dynamic functions.
/// Sensitivity outputs have one column per entry of `plist`.
pub struct ModelContext<'m> {
    model: &'m Model,
    p: Vec<f64>,
    k: Vec<f64>,
    plist: Vec<usize>,
    nan_reported: RefCell<Vec<&'static str>>,
    warnings: RefCell<Vec<Warning>>,
}

impl<'m> ModelContext<'m> {
    /// Bind `model` to unscaled parameters `p` and constants `k`
    pub fn new(model: &'m Model, p: Vec<f64>, k: Vec<f64>, plist: Vec<usize>) -> Result<Self> {
        let dims = model.dims();
        SimulationError::check_len("parameters", dims.np, p.len())?;
        SimulationError::check_len("constants", dims.nk, k.len())?;
        if let Some(&ip) = plist.iter().find(|&&ip| ip >= dims.np) {
            return Err(SimulationError::setup(format!(
                "plist entry {ip} exceeds the number of parameters {}",
                dims.np
            )));
        }
        Ok(Self {
            model,
            p,
            k,
            plist,
            nan_reported: RefCell::new(Vec::new()),
            warnings: RefCell::new(Vec::new()),
        })
    }

    pub fn model(&self) -> &'m Model {
        self.model
    }

    pub fn dims(&self) -> &ModelDimensions {
        self.model.dims()
    }

    pub fn p(&self) -> &[f64] {
        &self.p
    }

    pub fn k(&self) -> &[f64] {
        &self.k
    }

    pub fn plist(&self) -> &[usize] {
        &self.plist
    }

    pub fn nplist(&self) -> usize {
        self.plist.len()
    }

    /// Log a warning and keep it for the return data
    pub fn warn(&self, id: &'static str, message: impl Into<String>) {
        let message = message.into();
        log::warn!("{id}: {message}");
        self.warnings.borrow_mut().push(Warning { id, message });
    }

    pub fn take_warnings(&self) -> Vec<Warning> {
        std::mem::take(&mut *self.warnings.borrow_mut())
    }

    pub fn point<'a>(&'a self, t: f64, x: &'a [f64], dx: &'a [f64], h: &'a [f64]) -> EvalPoint<'a> {
        EvalPoint {
            t,
            x,
            dx,
            p: &self.p,
            k: &self.k,
            h,
        }
    }

    /// NaN becomes zero with one warning per function; Inf is an error
    fn sanitize(&self, function: &'static str, values: &mut [f64]) -> Result<()> {
        for (index, v) in values.iter_mut().enumerate() {
            if v.is_nan() {
                *v = 0.0;
                let first = {
                    let mut reported = self.nan_reported.borrow_mut();
                    if reported.contains(&function) {
                        false
                    } else {
                        reported.push(function);
                        true
                    }
                };
                if first {
                    self.warn(
                        "NAN",
                        format!("{function} contains NaN at index {index}; replaced by zero"),
                    );
                }
            } else if v.is_infinite() {
                return Err(SimulationError::NonFinite { function, index });
            }
        }
        Ok(())
    }

    fn call(function: &'static str, result: CallbackResult) -> Result<()> {
        result.map_err(|e| SimulationError::model(function, e))
    }

    fn with_parameter<T>(&self, ip: usize, value: f64, f: impl FnOnce(&[f64]) -> Result<T>) -> Result<T> {
        let mut p = self.p.clone();
        p[ip] = value;
        f(&p)
    }

    /// Central difference over every parameter in `plist`
    fn parameter_fd<F>(&self, n_out: usize, mut f: F) -> Result<DMatrix<f64>>
    where
        F: FnMut(&[f64]) -> Result<DVector<f64>>,
    {
        let mut out = DMatrix::zeros(n_out, self.nplist());
        for (col, &ip) in self.plist.iter().enumerate() {
            let column =
                finite_diff::derivative(self.p[ip], |v| self.with_parameter(ip, v, |p| f(p)))?;
            out.set_column(col, &column);
        }
        Ok(out)
    }

    // ---------------------------------------------------------------------
    // Initial conditions
    // ---------------------------------------------------------------------

    pub fn x0(&self, t0: f64) -> Result<DVector<f64>> {
        self.x0_with(t0, &self.p)
    }

    fn x0_with(&self, t0: f64, p: &[f64]) -> Result<DVector<f64>> {
        let mut out = DVector::zeros(self.dims().nx);
        Self::call("x0", (self.model.x0)(out.as_mut_slice(), t0, p, &self.k))?;
        Ok(out)
    }

    /// Initial sensitivities, `nx x nplist`
    pub fn sx0(&self, t0: f64, x0: &DVector<f64>) -> Result<DMatrix<f64>> {
        let nx = self.dims().nx;
        match &self.model.sx0 {
            Some(sx0) => {
                let mut out = DMatrix::zeros(nx, self.nplist());
                let mut column = vec![0.0; nx];
                for (col, &ip) in self.plist.iter().enumerate() {
                    column.iter_mut().for_each(|v| *v = 0.0);
                    Self::call("sx0", sx0(&mut column, ip, t0, x0.as_slice(), &self.p, &self.k))?;
                    out.set_column(col, &DVector::from_column_slice(&column));
                }
                Ok(out)
            }
            None => self.parameter_fd(nx, |p| self.x0_with(t0, p)),
        }
    }

    // ---------------------------------------------------------------------
    // Dynamics
    // ---------------------------------------------------------------------

    pub fn xdot(&self, pt: &EvalPoint<'_>) -> Result<DVector<f64>> {
        let mut out = self.xdot_raw(pt)?;
        self.sanitize("xdot", out.as_mut_slice())?;
        Ok(out)
    }

    fn xdot_raw(&self, pt: &EvalPoint<'_>) -> Result<DVector<f64>> {
        let mut out = DVector::zeros(self.dims().nx);
        Self::call("xdot", (self.model.xdot)(out.as_mut_slice(), pt))?;
        Ok(out)
    }

    /// Dense Jacobian `∂xdot/∂x`
    pub fn jacobian(&self, pt: &EvalPoint<'_>) -> Result<DMatrix<f64>> {
        let nx = self.dims().nx;
        let mut jac = match &self.model.jacobian {
            Some(jacobian) => {
                let mut out = DMatrix::zeros(nx, nx);
                Self::call("J", jacobian(&mut out, pt))?;
                out
            }
            None => match &self.model.jacobian_sparse {
                Some(_) => self.jacobian_sparse(pt)?.to_dense(),
                None => finite_diff::jacobian(nx, pt.x, |x| self.xdot_raw(&EvalPoint { x, ..*pt }))?,
            },
        };
        self.sanitize("J", jac.as_mut_slice())?;
        Ok(jac)
    }

    pub fn jacobian_sparse(&self, pt: &EvalPoint<'_>) -> Result<SparseMatrix> {
        match (&self.model.jacobian_sparse, &self.model.sparsity) {
            (Some(jacobian), Some(pattern)) => {
                let mut out = pattern.clone();
                Self::call("JSparse", jacobian(&mut out, pt))?;
                self.sanitize("JSparse", out.values_mut())?;
                Ok(out)
            }
            _ => Ok(SparseMatrix::from_dense(&self.jacobian(pt)?)),
        }
    }

    pub fn jacobian_band(&self, pt: &EvalPoint<'_>) -> Result<BandMatrix> {
        let dims = self.dims();
        match &self.model.jacobian_band {
            Some(jacobian) => {
                let mut out = BandMatrix::zeros(dims.nx, dims.ubw, dims.lbw);
                Self::call("JBand", jacobian(&mut out, pt))?;
                Ok(out)
            }
            None => Ok(BandMatrix::from_dense(&self.jacobian(pt)?, dims.ubw, dims.lbw)),
        }
    }

    /// Jacobian of the adjoint right-hand side, `-Jᵀ` unless supplied
    pub fn jacobian_b(&self, pt: &EvalPoint<'_>) -> Result<DMatrix<f64>> {
        match &self.model.jacobian_b {
            Some(jacobian_b) => {
                let nx = self.dims().nx;
                let mut out = DMatrix::zeros(nx, nx);
                Self::call("JB", jacobian_b(&mut out, pt))?;
                self.sanitize("JB", out.as_mut_slice())?;
                Ok(out)
            }
            None => Ok(-self.jacobian(pt)?.transpose()),
        }
    }

    /// `∂xdot/∂p`, `nx x nplist`
    pub fn dxdotdp(&self, pt: &EvalPoint<'_>) -> Result<DMatrix<f64>> {
        let nx = self.dims().nx;
        let mut out = match &self.model.dxdotdp {
            Some(dxdotdp) => {
                let mut out = DMatrix::zeros(nx, self.nplist());
                let mut column = vec![0.0; nx];
                for (col, &ip) in self.plist.iter().enumerate() {
                    column.iter_mut().for_each(|v| *v = 0.0);
                    Self::call("dxdotdp", dxdotdp(&mut column, ip, pt))?;
                    out.set_column(col, &DVector::from_column_slice(&column));
                }
                out
            }
            None => match self.dxdotdp_sparse(pt)? {
                Some(full) => {
                    let mut out = DMatrix::zeros(nx, self.nplist());
                    for (col, &ip) in self.plist.iter().enumerate() {
                        for (row, value) in full.column_entries(ip) {
                            out[(row, col)] += value;
                        }
                    }
                    out
                }
                None => self.parameter_fd(nx, |p| self.xdot_raw(&EvalPoint { p, ..*pt }))?,
            },
        };
        self.sanitize("dxdotdp", out.as_mut_slice())?;
        Ok(out)
    }

    /// Sparse derivative of the right-hand side w.r.t. all model parameters,
    /// `None` if the model has no sparse callback
    pub fn dxdotdp_sparse(&self, pt: &EvalPoint<'_>) -> Result<Option<SparseMatrix>> {
        match (&self.model.dxdotdp_sparse, &self.model.dxdotdp_sparsity) {
            (Some(dxdotdp), Some(pattern)) => {
                let mut out = pattern.clone();
                Self::call("dxdotdp_sparse", dxdotdp(&mut out, pt))?;
                self.sanitize("dxdotdp_sparse", out.values_mut())?;
                Ok(Some(out))
            }
            _ => Ok(None),
        }
    }

    /// Adjoint quadrature right-hand side, stored at `iJ + ip * nj`
    pub fn qbdot(&self, pt: &EvalPoint<'_>, xb: &DVector<f64>) -> Result<DVector<f64>> {
        let nj = self.dims().nj;
        let nplist = self.nplist();
        let mut out = DVector::zeros(nj * nplist);
        match &self.model.qbdot {
            Some(qbdot) => {
                let mut block = vec![0.0; nj];
                for (col, &ip) in self.plist.iter().enumerate() {
                    block.iter_mut().for_each(|v| *v = 0.0);
                    Self::call("qBdot", qbdot(&mut block, ip, pt, xb.as_slice()))?;
                    out.rows_mut(col * nj, nj).copy_from_slice(&block);
                }
            }
            None => {
                let dxdotdp = self.dxdotdp(pt)?;
                for col in 0..nplist {
                    out[col * nj] = -xb.dot(&dxdotdp.column(col));
                }
            }
        }
        self.sanitize("qBdot", out.as_mut_slice())?;
        Ok(out)
    }

    pub fn root(&self, pt: &EvalPoint<'_>) -> Result<DVector<f64>> {
        let ne = self.dims().ne;
        let mut out = DVector::zeros(ne);
        if let Some(root) = &self.model.root {
            Self::call("root", root(out.as_mut_slice(), pt))?;
        }
        Ok(out)
    }

    /// Partial derivatives of root `ie` w.r.t. state, time and parameters
    fn root_partials(&self, ie: usize, pt: &EvalPoint<'_>) -> Result<(DVector<f64>, f64, DVector<f64>)> {
        let nx = self.dims().nx;
        let g = |pt: &EvalPoint<'_>| -> Result<DVector<f64>> {
            let values = self.root(pt)?;
            Ok(DVector::from_element(1, values[ie]))
        };
        let gx = finite_diff::jacobian(1, pt.x, |x| g(&EvalPoint { x, ..*pt }))?;
        let gt = finite_diff::derivative(pt.t, |t| g(&EvalPoint { t, ..*pt }))?[0];
        let gp = self.parameter_fd(1, |p| g(&EvalPoint { p, ..*pt }))?;
        Ok((
            DVector::from_iterator(nx, gx.row(0).iter().copied()),
            gt,
            DVector::from_iterator(self.nplist(), gp.row(0).iter().copied()),
        ))
    }

    // ---------------------------------------------------------------------
    // Observables
    // ---------------------------------------------------------------------

    pub fn y(&self, pt: &EvalPoint<'_>) -> Result<DVector<f64>> {
        let mut out = DVector::zeros(self.dims().ny);
        if let Some(y) = &self.model.y {
            Self::call("y", y(out.as_mut_slice(), pt))?;
        }
        Ok(out)
    }

    /// `∂y/∂x`, `ny x nx`
    pub fn dydx(&self, pt: &EvalPoint<'_>) -> Result<DMatrix<f64>> {
        let dims = self.dims();
        match &self.model.dydx {
            Some(dydx) => {
                let mut out = DMatrix::zeros(dims.ny, dims.nx);
                Self::call("dydx", dydx(&mut out, pt))?;
                Ok(out)
            }
            None => finite_diff::jacobian(dims.ny, pt.x, |x| self.y(&EvalPoint { x, ..*pt })),
        }
    }

    /// `∂y/∂p`, `ny x nplist`
    pub fn dydp(&self, pt: &EvalPoint<'_>) -> Result<DMatrix<f64>> {
        let ny = self.dims().ny;
        match &self.model.dydp {
            Some(dydp) => self.per_parameter(ny, |out, ip| Self::call("dydp", dydp(out, ip, pt))),
            None => self.parameter_fd(ny, |p| self.y(&EvalPoint { p, ..*pt })),
        }
    }

    fn per_parameter<F>(&self, n: usize, mut f: F) -> Result<DMatrix<f64>>
    where
        F: FnMut(&mut [f64], usize) -> Result<()>,
    {
        let mut out = DMatrix::zeros(n, self.nplist());
        let mut column = vec![0.0; n];
        for (col, &ip) in self.plist.iter().enumerate() {
            column.iter_mut().for_each(|v| *v = 0.0);
            f(&mut column, ip)?;
            out.set_column(col, &DVector::from_column_slice(&column));
        }
        Ok(out)
    }

    pub fn sigma_y(&self, t: f64) -> Result<DVector<f64>> {
        self.sigma_y_with(t, &self.p)
    }

    fn sigma_y_with(&self, t: f64, p: &[f64]) -> Result<DVector<f64>> {
        let ny = self.dims().ny;
        match &self.model.sigma_y {
            Some(sigma) => {
                let mut out = DVector::zeros(ny);
                Self::call("sigma_y", sigma(out.as_mut_slice(), t, p, &self.k))?;
                Ok(out)
            }
            None => Ok(DVector::from_element(ny, 1.0)),
        }
    }

    /// `∂σy/∂p`, `ny x nplist`
    pub fn dsigma_ydp(&self, t: f64) -> Result<DMatrix<f64>> {
        let ny = self.dims().ny;
        match (&self.model.dsigma_ydp, &self.model.sigma_y) {
            (Some(dsigma), _) => self.per_parameter(ny, |out, ip| {
                Self::call("dsigma_ydp", dsigma(out, ip, t, &self.p, &self.k))
            }),
            (None, Some(_)) => self.parameter_fd(ny, |p| self.sigma_y_with(t, p)),
            (None, None) => Ok(DMatrix::zeros(ny, self.nplist())),
        }
    }

    /// Objective contribution of observable `iy`, `nj` values
    pub fn jy(&self, iy: usize, args: &NoiseArgs<'_>) -> Result<DVector<f64>> {
        self.objective("Jy", self.model.jy.as_ref(), iy, args, noise::gaussian_nllh)
    }

    /// `∂Jy/∂y` for observable `iy`, `nj x ny`
    pub fn djydy(&self, iy: usize, args: &NoiseArgs<'_>) -> Result<DMatrix<f64>> {
        let ny = self.dims().ny;
        self.objective_gradient("dJydy", self.model.djydy.as_ref(), iy, ny, args, noise::gaussian_nllh_dy)
    }

    /// `∂Jy/∂σ` for observable `iy`, `nj x ny`
    pub fn djydsigma(&self, iy: usize, args: &NoiseArgs<'_>) -> Result<DMatrix<f64>> {
        let ny = self.dims().ny;
        self.objective_gradient(
            "dJydsigma",
            self.model.djydsigma.as_ref(),
            iy,
            ny,
            args,
            noise::gaussian_nllh_dsigma,
        )
    }

    fn objective(
        &self,
        function: &'static str,
        callback: Option<&super::ObjectiveFn>,
        index: usize,
        args: &NoiseArgs<'_>,
        default: fn(f64, f64, f64) -> f64,
    ) -> Result<DVector<f64>> {
        let nj = self.dims().nj;
        let mut out = DVector::zeros(nj);
        match callback {
            Some(f) => Self::call(function, f(out.as_mut_slice(), index, args))?,
            None => out[0] = default(args.values[index], args.sigma[index], args.measurement),
        }
        Ok(out)
    }

    fn objective_gradient(
        &self,
        function: &'static str,
        callback: Option<&super::ObjectiveGradFn>,
        index: usize,
        n: usize,
        args: &NoiseArgs<'_>,
        default: fn(f64, f64, f64) -> f64,
    ) -> Result<DMatrix<f64>> {
        let nj = self.dims().nj;
        let mut out = DMatrix::zeros(nj, n);
        match callback {
            Some(f) => Self::call(function, f(&mut out, index, args))?,
            None => out[(0, index)] = default(args.values[index], args.sigma[index], args.measurement),
        }
        Ok(out)
    }

    // ---------------------------------------------------------------------
    // Event observables
    // ---------------------------------------------------------------------

    pub fn z(&self, ie: usize, pt: &EvalPoint<'_>) -> Result<DVector<f64>> {
        let mut out = DVector::zeros(self.dims().nz);
        if let Some(z) = &self.model.z {
            Self::call("z", z(out.as_mut_slice(), ie, pt))?;
        }
        Ok(out)
    }

    /// Total derivative of the event observables w.r.t. the state, `nz x nx`.
    ///
    /// The default accounts for the shift of the event time:
    /// `z_x - (z_x f + z_t) g_x / (g_x f + g_t)`.
    pub fn dzdx(&self, ie: usize, pt: &EvalPoint<'_>) -> Result<DMatrix<f64>> {
        let dims = self.dims();
        if let Some(dzdx) = &self.model.dzdx {
            let mut out = DMatrix::zeros(dims.nz, dims.nx);
            Self::call("dzdx", dzdx(&mut out, ie, pt))?;
            return Ok(out);
        }
        let (zx, shift, _, gx, _, _) = self.event_observable_partials(ie, pt)?;
        Ok(zx - shift * gx.transpose())
    }

    /// Total derivative of the event observables w.r.t. the parameters, `nz x nplist`
    pub fn dzdp(&self, ie: usize, pt: &EvalPoint<'_>) -> Result<DMatrix<f64>> {
        let nz = self.dims().nz;
        if let Some(dzdp) = &self.model.dzdp {
            return self.per_parameter(nz, |out, ip| Self::call("dzdp", dzdp(out, ie, ip, pt)));
        }
        let (_, shift, zp, _, gp, _) = self.event_observable_partials(ie, pt)?;
        Ok(zp - shift * gp.transpose())
    }

    /// Partials of `z` and of the event time shift direction
    /// `(z_x f + z_t) / (g_x f + g_t)`
    #[allow(clippy::type_complexity)]
    fn event_observable_partials(
        &self,
        ie: usize,
        pt: &EvalPoint<'_>,
    ) -> Result<(DMatrix<f64>, DVector<f64>, DMatrix<f64>, DVector<f64>, DVector<f64>, f64)> {
        let nz = self.dims().nz;
        let f = self.xdot(pt)?;
        let zx = finite_diff::jacobian(nz, pt.x, |x| self.z(ie, &EvalPoint { x, ..*pt }))?;
        let zt = finite_diff::derivative(pt.t, |t| self.z(ie, &EvalPoint { t, ..*pt }))?;
        let zp = self.parameter_fd(nz, |p| self.z(ie, &EvalPoint { p, ..*pt }))?;
        let (gx, gt, gp) = self.root_partials(ie, pt)?;
        let denominator = gx.dot(&f) + gt;
        if denominator == 0.0 {
            return Err(SimulationError::Model {
                function: "dzdx",
                message: format!("root function {ie} crosses tangentially"),
            });
        }
        let shift = (&zx * &f + zt) / denominator;
        Ok((zx, shift, zp, gx, gp, denominator))
    }

    pub fn rz(&self, ie: usize, pt: &EvalPoint<'_>) -> Result<DVector<f64>> {
        let dims = self.dims();
        let mut out = DVector::zeros(dims.nz);
        match &self.model.rz {
            Some(rz) => Self::call("rz", rz(out.as_mut_slice(), ie, pt))?,
            None => {
                let root = self.root(pt)?;
                for (iz, &event) in self.model.z2event.iter().enumerate() {
                    if event == ie {
                        out[iz] = root[ie];
                    }
                }
            }
        }
        Ok(out)
    }

    /// `∂rz/∂x`, `nz x nx`
    pub fn drzdx(&self, ie: usize, pt: &EvalPoint<'_>) -> Result<DMatrix<f64>> {
        let dims = self.dims();
        match &self.model.drzdx {
            Some(drzdx) => {
                let mut out = DMatrix::zeros(dims.nz, dims.nx);
                Self::call("drzdx", drzdx(&mut out, ie, pt))?;
                Ok(out)
            }
            None => finite_diff::jacobian(dims.nz, pt.x, |x| self.rz(ie, &EvalPoint { x, ..*pt })),
        }
    }

    /// `∂rz/∂p`, `nz x nplist`
    pub fn drzdp(&self, ie: usize, pt: &EvalPoint<'_>) -> Result<DMatrix<f64>> {
        let nz = self.dims().nz;
        match &self.model.drzdp {
            Some(drzdp) => self.per_parameter(nz, |out, ip| Self::call("drzdp", drzdp(out, ie, ip, pt))),
            None => self.parameter_fd(nz, |p| self.rz(ie, &EvalPoint { p, ..*pt })),
        }
    }

    pub fn sigma_z(&self, t: f64) -> Result<DVector<f64>> {
        self.sigma_z_with(t, &self.p)
    }

    fn sigma_z_with(&self, t: f64, p: &[f64]) -> Result<DVector<f64>> {
        let nz = self.dims().nz;
        match &self.model.sigma_z {
            Some(sigma) => {
                let mut out = DVector::zeros(nz);
                Self::call("sigma_z", sigma(out.as_mut_slice(), t, p, &self.k))?;
                Ok(out)
            }
            None => Ok(DVector::from_element(nz, 1.0)),
        }
    }

    /// `∂σz/∂p`, `nz x nplist`
    pub fn dsigma_zdp(&self, t: f64) -> Result<DMatrix<f64>> {
        let nz = self.dims().nz;
        match (&self.model.dsigma_zdp, &self.model.sigma_z) {
            (Some(dsigma), _) => self.per_parameter(nz, |out, ip| {
                Self::call("dsigma_zdp", dsigma(out, ip, t, &self.p, &self.k))
            }),
            (None, Some(_)) => self.parameter_fd(nz, |p| self.sigma_z_with(t, p)),
            (None, None) => Ok(DMatrix::zeros(nz, self.nplist())),
        }
    }

    pub fn jz(&self, iz: usize, args: &NoiseArgs<'_>) -> Result<DVector<f64>> {
        self.objective("Jz", self.model.jz.as_ref(), iz, args, noise::gaussian_nllh)
    }

    pub fn djzdz(&self, iz: usize, args: &NoiseArgs<'_>) -> Result<DMatrix<f64>> {
        let nz = self.dims().nz;
        self.objective_gradient("dJzdz", self.model.djzdz.as_ref(), iz, nz, args, noise::gaussian_nllh_dy)
    }

    pub fn djzdsigma(&self, iz: usize, args: &NoiseArgs<'_>) -> Result<DMatrix<f64>> {
        let nz = self.dims().nz;
        self.objective_gradient(
            "dJzdsigma",
            self.model.djzdsigma.as_ref(),
            iz,
            nz,
            args,
            noise::gaussian_nllh_dsigma,
        )
    }

    /// Regularization objective; `args.values` holds `rz` and the target is zero
    pub fn jrz(&self, iz: usize, args: &NoiseArgs<'_>) -> Result<DVector<f64>> {
        let args = NoiseArgs { measurement: 0.0, ..*args };
        self.objective("Jrz", self.model.jrz.as_ref(), iz, &args, noise::gaussian_nllh)
    }

    pub fn djrzdz(&self, iz: usize, args: &NoiseArgs<'_>) -> Result<DMatrix<f64>> {
        let nz = self.dims().nz;
        let args = NoiseArgs { measurement: 0.0, ..*args };
        self.objective_gradient("dJrzdz", self.model.djrzdz.as_ref(), iz, nz, &args, noise::gaussian_nllh_dy)
    }

    pub fn djrzdsigma(&self, iz: usize, args: &NoiseArgs<'_>) -> Result<DMatrix<f64>> {
        let nz = self.dims().nz;
        let args = NoiseArgs { measurement: 0.0, ..*args };
        self.objective_gradient(
            "dJrzdsigma",
            self.model.djrzdsigma.as_ref(),
            iz,
            nz,
            &args,
            noise::gaussian_nllh_dsigma,
        )
    }

    // ---------------------------------------------------------------------
    // Event resets
    // ---------------------------------------------------------------------

    /// Event time sensitivities for event `ie`, one per entry of `plist`.
    ///
    /// `pt` is the pre-event point and `xdot` the pre-event right-hand side.
    pub fn stau(&self, ie: usize, pt: &EvalPoint<'_>, sx: &DMatrix<f64>, xdot: &DVector<f64>) -> Result<DVector<f64>> {
        let nplist = self.nplist();
        let mut out = DVector::zeros(nplist);
        match &self.model.stau {
            Some(stau) => {
                for (col, &ip) in self.plist.iter().enumerate() {
                    let sx_col: Vec<f64> = sx.column(col).iter().copied().collect();
                    let args = EventArgs {
                        xdot: xdot.as_slice(),
                        xdot_old: xdot.as_slice(),
                        sx: &sx_col,
                        stau: 0.0,
                        xb: &[],
                    };
                    out[col] = stau(ie, ip, pt, &args).map_err(|e| SimulationError::model("stau", e))?;
                }
            }
            None => {
                let (gx, gt, gp) = self.root_partials(ie, pt)?;
                let denominator = gx.dot(xdot) + gt;
                if denominator == 0.0 {
                    return Err(SimulationError::Model {
                        function: "stau",
                        message: format!("root function {ie} crosses tangentially"),
                    });
                }
                for col in 0..nplist {
                    out[col] = -(gx.dot(&sx.column(col)) + gp[col]) / denominator;
                }
            }
        }
        Ok(out)
    }

    /// State bolus of event `ie`
    pub fn deltax(&self, ie: usize, pt: &EvalPoint<'_>, xdot: &DVector<f64>, xdot_old: &DVector<f64>) -> Result<DVector<f64>> {
        let mut out = DVector::zeros(self.dims().nx);
        if let Some(deltax) = &self.model.deltax {
            let args = EventArgs {
                xdot: xdot.as_slice(),
                xdot_old: xdot_old.as_slice(),
                sx: &[],
                stau: 0.0,
                xb: &[],
            };
            Self::call("deltax", deltax(out.as_mut_slice(), ie, pt, &args))?;
        }
        Ok(out)
    }

    /// Partials of the bolus w.r.t. state, time and parameters
    #[allow(clippy::type_complexity)]
    fn bolus_partials(
        &self,
        ie: usize,
        pt: &EvalPoint<'_>,
        xdot: &DVector<f64>,
        xdot_old: &DVector<f64>,
    ) -> Result<(DMatrix<f64>, DVector<f64>, DMatrix<f64>)> {
        let nx = self.dims().nx;
        if self.model.deltax.is_none() {
            return Ok((DMatrix::zeros(nx, nx), DVector::zeros(nx), DMatrix::zeros(nx, self.nplist())));
        }
        let delta = |pt: &EvalPoint<'_>| self.deltax(ie, pt, xdot, xdot_old);
        let dx = finite_diff::jacobian(nx, pt.x, |x| delta(&EvalPoint { x, ..*pt }))?;
        let dt = finite_diff::derivative(pt.t, |t| delta(&EvalPoint { t, ..*pt }))?;
        let dp = self.parameter_fd(nx, |p| delta(&EvalPoint { p, ..*pt }))?;
        Ok((dx, dt, dp))
    }

    /// Jump of the state sensitivities at event `ie`, `nx x nplist`.
    ///
    /// `pt` is the pre-event point; `xdot` and `xdot_old` are the right-hand
    /// sides after and before the event.
    pub fn deltasx(
        &self,
        ie: usize,
        pt: &EvalPoint<'_>,
        xdot: &DVector<f64>,
        xdot_old: &DVector<f64>,
        sx: &DMatrix<f64>,
        stau: &DVector<f64>,
    ) -> Result<DMatrix<f64>> {
        let nx = self.dims().nx;
        let nplist = self.nplist();
        if let Some(deltasx) = &self.model.deltasx {
            let mut out = DMatrix::zeros(nx, nplist);
            let mut column = vec![0.0; nx];
            for (col, &ip) in self.plist.iter().enumerate() {
                let sx_col: Vec<f64> = sx.column(col).iter().copied().collect();
                let args = EventArgs {
                    xdot: xdot.as_slice(),
                    xdot_old: xdot_old.as_slice(),
                    sx: &sx_col,
                    stau: stau[col],
                    xb: &[],
                };
                column.iter_mut().for_each(|v| *v = 0.0);
                Self::call("deltasx", deltasx(&mut column, ie, ip, pt, &args))?;
                out.set_column(col, &DVector::from_column_slice(&column));
            }
            return Ok(out);
        }
        let (delta_x, delta_t, delta_p) = self.bolus_partials(ie, pt, xdot, xdot_old)?;
        let mut out = DMatrix::zeros(nx, nplist);
        for col in 0..nplist {
            let tau = stau[col];
            let moved = sx.column(col) + xdot_old * tau;
            let jump = &delta_x * moved + delta_p.column(col) + &delta_t * tau + (xdot_old - xdot) * tau;
            out.set_column(col, &jump);
        }
        Ok(out)
    }

    /// Jump of the adjoint state at event `ie`, given the adjoint state
    /// `xb` after the event (in forward time)
    pub fn deltaxb(
        &self,
        ie: usize,
        pt: &EvalPoint<'_>,
        xdot: &DVector<f64>,
        xdot_old: &DVector<f64>,
        xb: &DVector<f64>,
    ) -> Result<DVector<f64>> {
        let nx = self.dims().nx;
        if let Some(deltaxb) = &self.model.deltaxb {
            let mut out = DVector::zeros(nx);
            let args = EventArgs {
                xdot: xdot.as_slice(),
                xdot_old: xdot_old.as_slice(),
                sx: &[],
                stau: 0.0,
                xb: xb.as_slice(),
            };
            Self::call("deltaxB", deltaxb(out.as_mut_slice(), ie, pt, &args))?;
            return Ok(out);
        }
        let (delta_x, delta_t, _) = self.bolus_partials(ie, pt, xdot, xdot_old)?;
        let (gx, gt, _) = self.root_partials(ie, pt)?;
        let (v, denominator) = Self::jump_direction(ie, &delta_x, &delta_t, &gx, gt, xdot, xdot_old)?;
        Ok(delta_x.transpose() * xb - gx * (xb.dot(&v) / denominator))
    }

    /// Jump of the adjoint quadratures at event `ie`, stored at `iJ + ip * nj`
    pub fn deltaqb(
        &self,
        ie: usize,
        pt: &EvalPoint<'_>,
        xdot: &DVector<f64>,
        xdot_old: &DVector<f64>,
        xb: &DVector<f64>,
    ) -> Result<DVector<f64>> {
        let nj = self.dims().nj;
        let nplist = self.nplist();
        let mut out = DVector::zeros(nj * nplist);
        if let Some(deltaqb) = &self.model.deltaqb {
            let mut block = vec![0.0; nj];
            let args = EventArgs {
                xdot: xdot.as_slice(),
                xdot_old: xdot_old.as_slice(),
                sx: &[],
                stau: 0.0,
                xb: xb.as_slice(),
            };
            for (col, &ip) in self.plist.iter().enumerate() {
                block.iter_mut().for_each(|v| *v = 0.0);
                Self::call("deltaqB", deltaqb(&mut block, ie, ip, pt, &args))?;
                out.rows_mut(col * nj, nj).copy_from_slice(&block);
            }
            return Ok(out);
        }
        let (delta_x, delta_t, delta_p) = self.bolus_partials(ie, pt, xdot, xdot_old)?;
        let (gx, gt, gp) = self.root_partials(ie, pt)?;
        let (v, denominator) = Self::jump_direction(ie, &delta_x, &delta_t, &gx, gt, xdot, xdot_old)?;
        let shift = xb.dot(&v) / denominator;
        for col in 0..nplist {
            out[col * nj] = xb.dot(&delta_p.column(col)) - shift * gp[col];
        }
        Ok(out)
    }

    /// `v = f⁻ - f⁺ + Δx f⁻ + Δt` and `g_x f⁻ + g_t`
    fn jump_direction(
        ie: usize,
        delta_x: &DMatrix<f64>,
        delta_t: &DVector<f64>,
        gx: &DVector<f64>,
        gt: f64,
        xdot: &DVector<f64>,
        xdot_old: &DVector<f64>,
    ) -> Result<(DVector<f64>, f64)> {
        let denominator = gx.dot(xdot_old) + gt;
        if denominator == 0.0 {
            return Err(SimulationError::Model {
                function: "deltaxB",
                message: format!("root function {ie} crosses tangentially"),
            });
        }
        let v = xdot_old - xdot + delta_x * xdot_old + delta_t;
        Ok((v, denominator))
    }
}
