//! Iteration matrices of the corrector.
//!
//! The forward corrector solves with `M - γJ`, the backward one with
//! `I - γJB`. The Jacobian is requested in the storage the linear solver
//! works with.

use nalgebra::{DMatrix, DVector};
use sensim_types::LinearSolver;

use crate::error::{Result, SimulationError};
use crate::linalg::{Factorization, SparseMatrix};
use crate::model::{EvalPoint, ModelContext};

fn unsupported(kind: LinearSolver) -> SimulationError {
    SimulationError::setup(format!("linear solver {} is not supported", kind.as_str()))
}

/// Factorization of `M - γJ` with the Jacobian taken at `pt`.
///
/// A singular iteration matrix is reported as [`SimulationError::Linalg`].
pub(crate) fn assemble(
    ctx: &ModelContext<'_>,
    pt: &EvalPoint<'_>,
    mass: &DVector<f64>,
    gamma: f64,
    kind: LinearSolver,
) -> Result<Factorization> {
    match kind {
        LinearSolver::Dense => {
            let j = ctx.jacobian(pt)?;
            let matrix = DMatrix::from_diagonal(mass) - &j * gamma;
            Ok(Factorization::dense(matrix)?)
        }
        LinearSolver::Band => {
            let j = ctx.jacobian_band(pt)?;
            let matrix = DMatrix::from_diagonal(mass) - j.to_dense() * gamma;
            Ok(Factorization::dense(matrix)?)
        }
        LinearSolver::Diag => {
            let j = ctx.jacobian(pt)?;
            let diagonal = mass - j.diagonal() * gamma;
            Ok(Factorization::diagonal(diagonal)?)
        }
        LinearSolver::Klu => {
            let j = ctx.jacobian_sparse(pt)?;
            let matrix = j.shifted(mass, gamma);
            Ok(Factorization::sparse(&matrix)?)
        }
        other => Err(unsupported(other)),
    }
}

/// Factorization of `I - γJB` for the adjoint corrector
pub(crate) fn assemble_adjoint(
    jacobian_b: &DMatrix<f64>,
    gamma: f64,
    kind: LinearSolver,
) -> Result<Factorization> {
    let n = jacobian_b.nrows();
    let identity = DVector::from_element(n, 1.0);
    let factorization = match kind {
        LinearSolver::Dense | LinearSolver::Band => {
            Factorization::dense(DMatrix::identity(n, n) - jacobian_b * gamma)?
        }
        LinearSolver::Diag => Factorization::diagonal(identity - jacobian_b.diagonal() * gamma)?,
        LinearSolver::Klu => Factorization::sparse(&SparseMatrix::from_dense(jacobian_b).shifted(&identity, gamma))?,
        other => return Err(unsupported(other)),
    };
    Ok(factorization)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Model;
    use approx::assert_relative_eq;
    use sensim_types::ModelDimensions;

    fn coupled() -> Model {
        Model::builder(
            "coupled",
            ModelDimensions::new(2, 0).with_bandwidth(1, 1),
            |_, _, _, _| Ok(()),
            |xdot, pt| {
                xdot[0] = -2.0 * pt.x[0] + pt.x[1];
                xdot[1] = pt.x[0] - 3.0 * pt.x[1];
                Ok(())
            },
        )
        .build()
        .unwrap()
    }

    #[test]
    fn test_all_representations_agree() {
        let model = coupled();
        let ctx = ModelContext::new(&model, vec![], vec![], vec![]).unwrap();
        let x = [1.0, 2.0];
        let pt = ctx.point(0.0, &x, &[0.0, 0.0], &[]);
        let mass = DVector::from_element(2, 1.0);
        let rhs = DVector::from_vec(vec![1.0, -1.0]);

        let reference = assemble(&ctx, &pt, &mass, 0.1, LinearSolver::Dense).unwrap();
        let expected = reference.solve(&rhs).unwrap();
        for kind in [LinearSolver::Band, LinearSolver::Klu] {
            let factorization = assemble(&ctx, &pt, &mass, 0.1, kind).unwrap();
            assert_relative_eq!(factorization.solve(&rhs).unwrap(), expected, epsilon = 1e-8);
        }
        // diagonal approximation of [[1.2, -0.1], [-0.1, 1.3]]
        let diagonal = assemble(&ctx, &pt, &mass, 0.1, LinearSolver::Diag).unwrap();
        assert_relative_eq!(diagonal.solve(&rhs).unwrap()[0], 1.0 / 1.2, epsilon = 1e-8);
        assert!(assemble(&ctx, &pt, &mass, 0.1, LinearSolver::Spgmr).is_err());
    }

    #[test]
    fn test_adjoint_matrix() {
        let jb = DMatrix::from_row_slice(2, 2, &[2.0, -1.0, -1.0, 3.0]);
        let factorization = assemble_adjoint(&jb, -0.5, LinearSolver::Dense).unwrap();
        let x = factorization.solve(&DVector::from_vec(vec![1.0, 1.0])).unwrap();
        let matrix = DMatrix::identity(2, 2) - &jb * -0.5;
        assert_relative_eq!(matrix * x, DVector::from_vec(vec![1.0, 1.0]), epsilon = 1e-12);
    }
}
