//! Conversion of sensitivities to the parameter scale.
//!
//! Sensitivities are computed w.r.t. unscaled parameters. For `log10` and
//! `ln` scaling, first-order sensitivities are multiplied by
//! `dp/dq = p * c` with `c = ln 10` or `1`. Second-order quantities pick up
//! the additional diagonal term `c * dL/dq`.

use std::f64::consts::LN_10;

use sensim_types::{ModelDimensions, ParameterScaling, SecondOrderMode, SensitivityOrder, SimulationSettings};

use crate::data::ReturnData;
use crate::linalg::NamedArray;

struct Scaling<'a> {
    mode: SecondOrderMode,
    plist: &'a [usize],
    /// `ln 10` or `1`
    coefficient: f64,
    /// `dp/dq` per entry of `plist`
    pcoef: Vec<f64>,
    /// `dp/dq` per model parameter
    augcoef: Vec<f64>,
    /// Weights of the directional second-order blocks per entry of `plist`
    direction: Vec<f64>,
}

impl Scaling<'_> {
    /// Scale one first-order value and the augmented values derived from it
    fn apply(&self, ip: usize, first: f64, block: usize, augmented: f64) -> f64 {
        match self.mode {
            SecondOrderMode::Full => {
                let aug = self.augcoef.get(block - 1).copied().unwrap_or(0.0);
                let diagonal = if self.plist[ip] == block - 1 { first * self.coefficient } else { 0.0 };
                augmented * self.pcoef[ip] * aug + diagonal
            }
            SecondOrderMode::Directional => augmented * self.pcoef[ip] + self.direction[ip] * first,
            SecondOrderMode::None => augmented,
        }
    }

    /// Scale `[outer, entry, parameter]` sensitivities whose first `ntrue`
    /// entries belong to the original model
    fn array(&self, array: &mut NamedArray<3>, ntrue: usize, nblocks: usize) {
        let [outer, n, np] = array.shape();
        if np == 0 || ntrue == 0 {
            return;
        }
        for i0 in 0..outer {
            for ip in 0..np {
                for i in 0..ntrue.min(n) {
                    let first = array[[i0, i, ip]] * self.pcoef[ip];
                    array[[i0, i, ip]] = first;
                    for block in 1..nblocks {
                        let idx = i + block * ntrue;
                        if idx < n {
                            array[[i0, idx, ip]] = self.apply(ip, first, block, array[[i0, idx, ip]]);
                        }
                    }
                }
            }
        }
    }
}

/// Fill the first-order state and output sensitivities of an adjoint
/// second-order run from the augmented blocks of the simulated states.
///
/// Only the full second-order mode carries one block per model parameter;
/// other runs are left unchanged.
pub fn recover_augmented_sensitivities(dims: &ModelDimensions, plist: &[usize], rdata: &mut ReturnData) {
    if dims.o2mode != SecondOrderMode::Full || !rdata.has_state_sensitivities() {
        return;
    }
    for (ip, &parameter) in plist.iter().enumerate() {
        let block = parameter + 1;
        for it in 0..rdata.nt() {
            for ix in 0..dims.nxtrue {
                rdata.sx[[it, ix, ip]] = rdata.x[[it, ix + block * dims.nxtrue]];
            }
            for iy in 0..dims.nytrue {
                rdata.sy[[it, iy, ip]] = rdata.y[[it, iy + block * dims.nytrue]];
            }
        }
        for ie in 0..dims.nmaxevent {
            for iz in 0..dims.nztrue {
                rdata.sz[[ie, iz, ip]] = rdata.z[[ie, iz + block * dims.nztrue]];
            }
        }
    }
}

/// Convert all sensitivities in `rdata` from unscaled parameters `p` to the
/// scale selected in `settings`
pub fn apply_chain_rule(
    settings: &SimulationSettings,
    dims: &ModelDimensions,
    p: &[f64],
    k: &[f64],
    plist: &[usize],
    has_data: bool,
    rdata: &mut ReturnData,
) {
    let coefficient = match settings.pscale {
        ParameterScaling::None => return,
        ParameterScaling::Log10 => LN_10,
        ParameterScaling::Ln => 1.0,
    };
    if !settings.computes_sensitivities() {
        return;
    }
    let nplist = plist.len();
    let direction = (0..nplist)
        .map(|ip| {
            let weight = (dims.nk + ip)
                .checked_sub(nplist)
                .and_then(|ik| k.get(ik))
                .copied()
                .unwrap_or(0.0);
            weight / p[plist[ip]]
        })
        .collect();
    let scaling = Scaling {
        mode: dims.o2mode,
        plist,
        coefficient,
        pcoef: plist.iter().map(|&ip| p[ip] * coefficient).collect(),
        augcoef: p.iter().map(|v| v * coefficient).collect(),
        direction,
    };
    log::trace!("chain rule with dp/dq = {:?}", scaling.pcoef);

    if has_data {
        for (ip, value) in rdata.sllh.iter_mut().enumerate() {
            *value *= scaling.pcoef[ip];
        }
        if settings.sensi == SensitivityOrder::Second {
            let [nrows, _] = rdata.s2llh.shape();
            for row in 0..nrows {
                for ip in 0..nplist {
                    let value = rdata.s2llh[[row, ip]];
                    rdata.s2llh[[row, ip]] = scaling.apply(ip, rdata.sllh[ip], row + 1, value);
                }
            }
        }
    }

    let nj = dims.nj;
    scaling.array(&mut rdata.sx, dims.nxtrue, nj);
    scaling.array(&mut rdata.sy, dims.nytrue, nj);
    scaling.array(&mut rdata.ssigmay, dims.nytrue, nj);
    scaling.array(&mut rdata.sz, dims.nztrue, nj);
    scaling.array(&mut rdata.ssigmaz, dims.nztrue, nj);
    scaling.array(&mut rdata.srz, dims.nztrue, nj);
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use sensim_types::SensitivityMethod;

    fn settings(pscale: ParameterScaling, sensi: SensitivityOrder) -> SimulationSettings {
        SimulationSettings {
            sensi,
            sensi_method: SensitivityMethod::Forward,
            pscale,
            ..SimulationSettings::default()
        }
    }

    fn rdata(dims: &ModelDimensions, settings: &SimulationSettings, nplist: usize) -> ReturnData {
        let mut rdata = ReturnData::new(dims, &[0.0, 1.0], nplist, settings, true);
        rdata.sx.map_inplace(|_| 1.5);
        rdata.sllh.iter_mut().for_each(|v| *v = 2.0);
        rdata
    }

    #[test]
    fn test_log10_scaling_is_invertible() {
        let dims = ModelDimensions::new(2, 2);
        let settings = settings(ParameterScaling::Log10, SensitivityOrder::First);
        let p = [3.0, 0.2];
        let mut rdata = rdata(&dims, &settings, 2);
        apply_chain_rule(&settings, &dims, &p, &[], &[0, 1], true, &mut rdata);

        for (ip, &pi) in p.iter().enumerate() {
            assert_relative_eq!(rdata.sllh[ip], 2.0 * pi * LN_10);
            assert_relative_eq!(rdata.sx[[1, 1, ip]], 1.5 * pi * LN_10);
            // dq/dp undoes the scaling
            assert_relative_eq!(rdata.sx[[1, 1, ip]] / (pi * LN_10), 1.5, max_relative = 1e-14);
        }
    }

    #[test]
    fn test_unscaled_is_untouched() {
        let dims = ModelDimensions::new(1, 1);
        let settings = settings(ParameterScaling::None, SensitivityOrder::First);
        let mut rdata = rdata(&dims, &settings, 1);
        apply_chain_rule(&settings, &dims, &[4.0], &[], &[0], true, &mut rdata);
        assert_eq!(rdata.sllh, vec![2.0]);
        assert_eq!(rdata.sx[[0, 0, 0]], 1.5);
    }

    #[test]
    fn test_gradient_stays_nan_without_data() {
        let dims = ModelDimensions::new(1, 1);
        let settings = settings(ParameterScaling::Ln, SensitivityOrder::First);
        let mut rdata = ReturnData::new(&dims, &[0.0], 1, &settings, false);
        apply_chain_rule(&settings, &dims, &[4.0], &[], &[0], false, &mut rdata);
        assert!(rdata.sllh[0].is_nan());
    }

    #[test]
    fn test_full_second_order_diagonal_term() {
        // L(p) with dL/dp = g and d2L/dp2 = H; in q = ln p:
        // dL/dq = g p and d2L/dq2 = H p^2 + g p
        let dims = ModelDimensions::new(1, 1).augmented(SecondOrderMode::Full, 2);
        let settings = settings(ParameterScaling::Ln, SensitivityOrder::Second);
        let (g, h, p) = (2.0, -0.7, 1.3);
        let mut rdata = ReturnData::new(&dims, &[0.0], 1, &settings, true);
        rdata.sllh[0] = g;
        rdata.s2llh[[0, 0]] = h;
        rdata.sx[[0, 0, 0]] = 0.5;
        rdata.sx[[0, 1, 0]] = 0.25;
        apply_chain_rule(&settings, &dims, &[p], &[], &[0], true, &mut rdata);

        assert_relative_eq!(rdata.sllh[0], g * p);
        assert_relative_eq!(rdata.s2llh[[0, 0]], h * p * p + g * p);
        assert_relative_eq!(rdata.sx[[0, 0, 0]], 0.5 * p);
        assert_relative_eq!(rdata.sx[[0, 1, 0]], 0.25 * p * p + 0.5 * p);
    }
}
