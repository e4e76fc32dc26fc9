use std::fmt;
use std::ops::{Index, IndexMut};

/// Dense array with named axes.
///
/// Storage is column-major with the first axis running fastest, so a
/// `[time, state]` array of shape `[nt, nx]` stores entry `(it, ix)` at
/// flat position `it + nt * ix`, and a `[time, state, parameter]` array at
/// `it + nt * (ix + nx * ip)`.
#[derive(Clone, PartialEq)]
pub struct NamedArray<const N: usize> {
    axes: [&'static str; N],
    shape: [usize; N],
    data: Vec<f64>,
}

impl<const N: usize> NamedArray<N> {
    /// Zero-filled array
    pub fn zeros(axes: [&'static str; N], shape: [usize; N]) -> Self {
        Self::filled(axes, shape, 0.0)
    }

    pub fn filled(axes: [&'static str; N], shape: [usize; N], value: f64) -> Self {
        let len = shape.iter().product();
        Self {
            axes,
            shape,
            data: vec![value; len],
        }
    }

    pub fn shape(&self) -> [usize; N] {
        self.shape
    }

    pub fn axes(&self) -> [&'static str; N] {
        self.axes
    }

    /// Extent of the axis called `name`
    pub fn dim(&self, name: &str) -> Option<usize> {
        self.axes
            .iter()
            .position(|axis| *axis == name)
            .map(|i| self.shape[i])
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn fill(&mut self, value: f64) {
        self.data.iter_mut().for_each(|v| *v = value);
    }

    /// Flat offset of `index`, or `None` if any component is out of range
    pub fn offset(&self, index: [usize; N]) -> Option<usize> {
        let mut offset = 0;
        let mut stride = 1;
        for axis in 0..N {
            if index[axis] >= self.shape[axis] {
                return None;
            }
            offset += index[axis] * stride;
            stride *= self.shape[axis];
        }
        Some(offset)
    }

    pub fn get(&self, index: [usize; N]) -> Option<f64> {
        self.offset(index).map(|i| self.data[i])
    }

    pub fn get_mut(&mut self, index: [usize; N]) -> Option<&mut f64> {
        self.offset(index).map(move |i| &mut self.data[i])
    }

    /// Apply `f` to every element
    pub fn map_inplace(&mut self, mut f: impl FnMut(f64) -> f64) {
        self.data.iter_mut().for_each(|v| *v = f(*v));
    }

    fn checked_offset(&self, index: [usize; N]) -> usize {
        match self.offset(index) {
            Some(offset) => offset,
            None => panic!(
                "index {:?} out of bounds for array with axes {:?} and shape {:?}",
                index, self.axes, self.shape
            ),
        }
    }
}

impl<const N: usize> Index<[usize; N]> for NamedArray<N> {
    type Output = f64;

    fn index(&self, index: [usize; N]) -> &f64 {
        &self.data[self.checked_offset(index)]
    }
}

impl<const N: usize> IndexMut<[usize; N]> for NamedArray<N> {
    fn index_mut(&mut self, index: [usize; N]) -> &mut f64 {
        let offset = self.checked_offset(index);
        &mut self.data[offset]
    }
}

impl<const N: usize> fmt::Debug for NamedArray<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let axes: Vec<String> = self
            .axes
            .iter()
            .zip(self.shape.iter())
            .map(|(name, n)| format!("{name}={n}"))
            .collect();
        write!(f, "NamedArray[{}] {:?}", axes.join(", "), self.data)
    }
}
