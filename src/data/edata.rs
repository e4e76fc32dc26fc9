use sensim_types::ModelDimensions;

use crate::error::{Result, SimulationError};
use crate::linalg::NamedArray;

/// Experimental data of one run.
///
/// Observable measurements are indexed `[time, observable]` and event
/// measurements `[event, eventobs]`, where the event axis counts
/// occurrences. `NaN` marks a missing measurement; a `NaN` standard
/// deviation means the model's own noise model is used.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpData {
    my: NamedArray<2>,
    sigmay: NamedArray<2>,
    mz: NamedArray<2>,
    sigmaz: NamedArray<2>,
}

impl ExpData {
    /// Empty data for `nt` timepoints: every measurement missing
    pub fn new(nt: usize, nytrue: usize, nmaxevent: usize, nztrue: usize) -> Self {
        Self {
            my: NamedArray::filled(["time", "observable"], [nt, nytrue], f64::NAN),
            sigmay: NamedArray::filled(["time", "observable"], [nt, nytrue], f64::NAN),
            mz: NamedArray::filled(["event", "eventobs"], [nmaxevent, nztrue], f64::NAN),
            sigmaz: NamedArray::filled(["event", "eventobs"], [nmaxevent, nztrue], f64::NAN),
        }
    }

    /// Empty data shaped after `dims`
    pub fn for_model(dims: &ModelDimensions, nt: usize) -> Self {
        Self::new(nt, dims.nytrue, dims.nmaxevent, dims.nztrue)
    }

    /// Data from row-major `[time][observable]` measurement tables
    pub fn from_observables(my: &[Vec<f64>], sigmay: &[Vec<f64>]) -> Result<Self> {
        let nt = my.len();
        let ny = my.first().map_or(0, Vec::len);
        SimulationError::check_len("sigmay timepoints", nt, sigmay.len())?;
        let mut data = Self::new(nt, ny, 0, 0);
        for (it, (row, sigma_row)) in my.iter().zip(sigmay).enumerate() {
            SimulationError::check_len("measurement row", ny, row.len())?;
            SimulationError::check_len("sigmay row", ny, sigma_row.len())?;
            for iy in 0..ny {
                data.my[[it, iy]] = row[iy];
                data.sigmay[[it, iy]] = sigma_row[iy];
            }
        }
        Ok(data)
    }

    pub fn nt(&self) -> usize {
        self.my.shape()[0]
    }

    pub fn nytrue(&self) -> usize {
        self.my.shape()[1]
    }

    pub fn nmaxevent(&self) -> usize {
        self.mz.shape()[0]
    }

    pub fn nztrue(&self) -> usize {
        self.mz.shape()[1]
    }

    pub fn set_measurement(&mut self, it: usize, iy: usize, value: f64, sigma: f64) {
        self.my[[it, iy]] = value;
        self.sigmay[[it, iy]] = sigma;
    }

    /// Measurement of the `ie`-th occurrence of event observable `iz`
    pub fn set_event_measurement(&mut self, ie: usize, iz: usize, value: f64, sigma: f64) {
        self.mz[[ie, iz]] = value;
        self.sigmaz[[ie, iz]] = sigma;
    }

    pub fn my(&self, it: usize, iy: usize) -> f64 {
        self.my[[it, iy]]
    }

    pub fn sigmay(&self, it: usize, iy: usize) -> f64 {
        self.sigmay[[it, iy]]
    }

    /// Event measurement; missing when the occurrence exceeds the table
    pub fn mz(&self, ie: usize, iz: usize) -> f64 {
        self.mz.get([ie, iz]).unwrap_or(f64::NAN)
    }

    pub fn sigmaz(&self, ie: usize, iz: usize) -> f64 {
        self.sigmaz.get([ie, iz]).unwrap_or(f64::NAN)
    }

    /// Check the table shapes against a model and a number of timepoints
    pub fn check(&self, dims: &ModelDimensions, nt: usize) -> Result<()> {
        SimulationError::check_len("data timepoints", nt, self.nt())?;
        SimulationError::check_len("data observables", dims.nytrue, self.nytrue())?;
        if dims.nztrue > 0 {
            SimulationError::check_len("data event observables", dims.nztrue, self.nztrue())?;
        }
        if self.sigmay.as_slice().iter().any(|&s| s <= 0.0)
            || self.sigmaz.as_slice().iter().any(|&s| s <= 0.0)
        {
            return Err(SimulationError::setup("measurement standard deviations must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_by_default() {
        let data = ExpData::new(3, 2, 1, 1);
        assert!(data.my(2, 1).is_nan());
        assert!(data.mz(0, 0).is_nan());
        assert!(data.mz(5, 0).is_nan());
    }

    #[test]
    fn test_from_observables() {
        let data = ExpData::from_observables(
            &[vec![1.0, 2.0], vec![3.0, f64::NAN]],
            &[vec![0.1, 0.1], vec![0.2, 0.2]],
        )
        .unwrap();
        assert_eq!(data.nt(), 2);
        assert_eq!(data.my(1, 0), 3.0);
        assert!(data.my(1, 1).is_nan());
        assert_eq!(data.sigmay(1, 1), 0.2);
    }

    #[test]
    fn test_check_rejects_shape_and_sigma() {
        let dims = ModelDimensions::new(1, 1).with_observables(1);
        let mut data = ExpData::for_model(&dims, 2);
        assert!(data.check(&dims, 2).is_ok());
        assert!(data.check(&dims, 3).is_err());
        data.set_measurement(0, 0, 1.0, -1.0);
        assert!(data.check(&dims, 2).is_err());
    }
}
