use nalgebra::DVector;

use super::bdf::hermite;

/// Accepted forward point kept for the backward pass
#[derive(Debug, Clone)]
pub struct TrajectoryPoint {
    pub t: f64,
    pub x: DVector<f64>,
    pub dx: DVector<f64>,
}

/// Forward trajectory recorded for adjoint replay.
///
/// Every reinitialization (event) starts a new segment, so a time that
/// coincides with a discontinuity is stored twice: as the end of the segment
/// before the event and as the start of the one after it.
#[derive(Debug, Clone, Default)]
pub struct Trajectory {
    segments: Vec<Vec<TrajectoryPoint>>,
}

impl Trajectory {
    pub fn clear(&mut self) {
        self.segments.clear();
    }

    pub fn start_segment(&mut self, point: TrajectoryPoint) {
        self.segments.push(vec![point]);
    }

    pub fn push(&mut self, point: TrajectoryPoint) {
        match self.segments.last_mut() {
            Some(segment) => segment.push(point),
            None => self.segments.push(vec![point]),
        }
    }

    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }

    pub fn num_points(&self) -> usize {
        self.segments.iter().map(Vec::len).sum()
    }

    /// Segment containing the open interval between `ta` and `tb`
    pub fn segment_for(&self, ta: f64, tb: f64) -> Option<usize> {
        let mid = 0.5 * (ta + tb);
        self.segments.iter().rposition(|segment| match (segment.first(), segment.last()) {
            (Some(first), Some(last)) => first.t <= mid && mid <= last.t,
            _ => false,
        })
    }

    /// State and derivative at `t` within `segment`; times outside the
    /// segment are clamped to its ends
    pub fn interpolate(&self, segment: usize, t: f64) -> Option<(DVector<f64>, DVector<f64>)> {
        let points = self.segments.get(segment)?;
        let first = points.first()?;
        let last = points.last()?;
        if points.len() == 1 || t <= first.t {
            return Some((first.x.clone(), first.dx.clone()));
        }
        if t >= last.t {
            return Some((last.x.clone(), last.dx.clone()));
        }
        // first index with time >= t
        let upper = points.partition_point(|p| p.t < t);
        let (a, b) = (&points[upper - 1], &points[upper]);
        Some(hermite(t, (a.t, &a.x, &a.dx), (b.t, &b.x, &b.dx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn point(t: f64, x: f64, dx: f64) -> TrajectoryPoint {
        TrajectoryPoint {
            t,
            x: DVector::from_element(1, x),
            dx: DVector::from_element(1, dx),
        }
    }

    #[test]
    fn test_segments_split_at_events() {
        let mut trajectory = Trajectory::default();
        trajectory.start_segment(point(0.0, 0.0, 1.0));
        trajectory.push(point(1.0, 1.0, 1.0));
        trajectory.start_segment(point(1.0, 5.0, 1.0));
        trajectory.push(point(2.0, 6.0, 1.0));

        let before = trajectory.segment_for(0.5, 1.0).unwrap();
        let after = trajectory.segment_for(1.0, 2.0).unwrap();
        assert_eq!((before, after), (0, 1));
        assert_relative_eq!(trajectory.interpolate(before, 0.75).unwrap().0[0], 0.75, epsilon = 1e-12);
        assert_relative_eq!(trajectory.interpolate(after, 1.5).unwrap().0[0], 5.5, epsilon = 1e-12);
        assert_relative_eq!(trajectory.interpolate(before, 1.0).unwrap().0[0], 1.0);
        assert_eq!(trajectory.num_points(), 4);
    }
}
