//! Point layout and affine transformation — spec §4.B.
//!
//! A [`Layout`] is a flat row-major array of point coordinates; a point's
//! coordinates are all-NaN when it is disconnected.

use crate::err::{Error, Result};

/// Coordinates of all points (antigens followed by sera) in a projection.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Layout {
    /// Number of dimensions (2 or 3 in practice, but not restricted here).
    num_dims: usize,
    /// Row-major coordinates: point `p`'s coordinates are
    /// `data[p*num_dims .. p*num_dims+num_dims]`.
    data: Vec<f64>,
}

impl Layout {
    /// Create a new layout with all points disconnected (NaN coordinates).
    pub fn new(num_points: usize, num_dims: usize) -> Self {
        Self {
            num_dims,
            data: vec![f64::NAN; num_points * num_dims],
        }
    }

    /// Build a layout from already-known coordinates.
    ///
    /// # Errors
    /// Returns [`Error::StructureInvalid`] if `data.len()` is not a multiple
    /// of `num_dims`.
    pub fn from_data(data: Vec<f64>, num_dims: usize) -> Result<Self> {
        if num_dims == 0 || data.len() % num_dims != 0 {
            return Err(Error::StructureInvalid(format!(
                "layout data length {} is not a multiple of num_dims {}",
                data.len(),
                num_dims
            )));
        }
        Ok(Self { num_dims, data })
    }

    pub fn num_dims(&self) -> usize {
        self.num_dims
    }

    pub fn num_points(&self) -> usize {
        if self.num_dims == 0 {
            0
        } else {
            self.data.len() / self.num_dims
        }
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Coordinates of point `p`, `None` if `p` is out of range.
    pub fn point(&self, p: usize) -> Option<&[f64]> {
        let start = p.checked_mul(self.num_dims)?;
        self.data.get(start..start + self.num_dims)
    }

    pub fn point_mut(&mut self, p: usize) -> Option<&mut [f64]> {
        let start = p.checked_mul(self.num_dims)?;
        let dims = self.num_dims;
        self.data.get_mut(start..start + dims)
    }

    pub fn set_point(&mut self, p: usize, coords: &[f64]) {
        assert_eq!(coords.len(), self.num_dims);
        let dims = self.num_dims;
        self.data[p * dims..p * dims + dims].copy_from_slice(coords);
    }

    /// True iff every coordinate of point `p` is finite (not disconnected).
    pub fn point_has_coordinates(&self, p: usize) -> bool {
        match self.point(p) {
            Some(coords) => coords.iter().all(|c| c.is_finite()),
            None => false,
        }
    }

    pub fn set_disconnected(&mut self, p: usize) {
        let dims = self.num_dims;
        if let Some(slice) = self.point_mut(p) {
            slice.copy_from_slice(&vec![f64::NAN; dims]);
        }
    }

    /// Euclidean distance between two points, `NaN` if either is
    /// disconnected.
    pub fn distance(&self, p: usize, q: usize) -> f64 {
        match (self.point(p), self.point(q)) {
            (Some(a), Some(b)) => {
                if !self.point_has_coordinates(p) || !self.point_has_coordinates(q) {
                    return f64::NAN;
                }
                a.iter()
                    .zip(b.iter())
                    .map(|(x, y)| (x - y).powi(2))
                    .sum::<f64>()
                    .sqrt()
            }
            _ => f64::NAN,
        }
    }

    /// Apply an affine transformation, producing a new layout. NaN points
    /// remain NaN.
    pub fn transform(&self, t: &Transformation) -> Result<Layout> {
        if t.num_dims() != self.num_dims {
            return Err(Error::InvalidDimensionality(format!(
                "layout has {} dims, transformation has {}",
                self.num_dims,
                t.num_dims()
            )));
        }
        let mut out = Layout::new(self.num_points(), self.num_dims);
        for p in 0..self.num_points() {
            if !self.point_has_coordinates(p) {
                continue;
            }
            let coords = self.point(p).unwrap();
            let transformed = t.apply(coords);
            out.set_point(p, &transformed);
        }
        Ok(out)
    }

    /// Remove the listed points. `indexes` must be sorted descending so the
    /// layout stays contiguous as each removal shifts later indexes down.
    pub fn remove_points(&mut self, indexes_desc: &[usize]) {
        let dims = self.num_dims;
        for &idx in indexes_desc {
            let start = idx * dims;
            if start + dims <= self.data.len() {
                self.data.drain(start..start + dims);
            }
        }
    }

    /// Coordinates of the centroid over `points`, ignoring disconnected
    /// ones. Returns all-zero if none have coordinates.
    pub fn centroid(&self, points: &[usize]) -> Vec<f64> {
        let mut sum = vec![0.0; self.num_dims];
        let mut count = 0usize;
        for &p in points {
            if self.point_has_coordinates(p) {
                let coords = self.point(p).unwrap();
                for (s, c) in sum.iter_mut().zip(coords) {
                    *s += c;
                }
                count += 1;
            }
        }
        if count > 0 {
            for s in sum.iter_mut() {
                *s /= count as f64;
            }
        }
        sum
    }
}

/// D×D matrix + D translation, lazily applied to a [`Layout`].
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Transformation {
    num_dims: usize,
    /// Row-major D×D matrix.
    matrix: Vec<f64>,
    translation: Vec<f64>,
}

impl Transformation {
    /// The identity transformation in `num_dims` dimensions.
    pub fn identity(num_dims: usize) -> Self {
        let mut matrix = vec![0.0; num_dims * num_dims];
        for i in 0..num_dims {
            matrix[i * num_dims + i] = 1.0;
        }
        Self {
            num_dims,
            matrix,
            translation: vec![0.0; num_dims],
        }
    }

    pub fn new(matrix: Vec<f64>, translation: Vec<f64>) -> Result<Self> {
        let num_dims = translation.len();
        if matrix.len() != num_dims * num_dims {
            return Err(Error::StructureInvalid(
                "transformation matrix size does not match translation length".into(),
            ));
        }
        Ok(Self {
            num_dims,
            matrix,
            translation,
        })
    }

    pub fn num_dims(&self) -> usize {
        self.num_dims
    }

    pub fn matrix(&self) -> &[f64] {
        &self.matrix
    }

    pub fn translation(&self) -> &[f64] {
        &self.translation
    }

    /// Apply to a single point's coordinates: `matrix * p + translation`.
    pub fn apply(&self, point: &[f64]) -> Vec<f64> {
        let d = self.num_dims;
        let mut out = vec![0.0; d];
        for i in 0..d {
            let mut acc = self.translation[i];
            for j in 0..d {
                acc += self.matrix[i * d + j] * point[j];
            }
            out[i] = acc;
        }
        out
    }

    /// Right-multiply `self` by `other`: apply `other` first, then `self`.
    pub fn compose(&self, other: &Transformation) -> Result<Transformation> {
        if self.num_dims != other.num_dims {
            return Err(Error::InvalidDimensionality(
                "cannot compose transformations of different dimensionality".into(),
            ));
        }
        let d = self.num_dims;
        let mut matrix = vec![0.0; d * d];
        for i in 0..d {
            for j in 0..d {
                let mut acc = 0.0;
                for k in 0..d {
                    acc += self.matrix[i * d + k] * other.matrix[k * d + j];
                }
                matrix[i * d + j] = acc;
            }
        }
        let translation = self.apply(&other.translation);
        Ok(Transformation {
            num_dims: d,
            matrix,
            translation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::approx_eq;
    use pretty_assertions::assert_eq;

    #[test]
    fn new_layout_is_all_nan() {
        let layout = Layout::new(3, 2);
        assert_eq!(layout.num_points(), 3);
        for p in 0..3 {
            assert!(!layout.point_has_coordinates(p));
        }
    }

    #[test]
    fn distance_nan_if_disconnected() {
        let mut layout = Layout::new(2, 2);
        layout.set_point(0, &[0.0, 0.0]);
        // point 1 stays disconnected
        assert!(layout.distance(0, 1).is_nan());
    }

    #[test]
    fn distance_euclidean() {
        let mut layout = Layout::new(2, 2);
        layout.set_point(0, &[0.0, 0.0]);
        layout.set_point(1, &[3.0, 4.0]);
        assert_eq!(layout.distance(0, 1), 5.0);
    }

    #[test]
    fn transform_preserves_nan_points() {
        let mut layout = Layout::new(2, 2);
        layout.set_point(0, &[1.0, 1.0]);
        let t = Transformation::identity(2);
        let transformed = layout.transform(&t).unwrap();
        assert!(!transformed.point_has_coordinates(1));
        assert_eq!(transformed.point(0).unwrap(), &[1.0, 1.0]);
    }

    #[test]
    fn remove_points_descending_keeps_contiguous() {
        let mut layout = Layout::new(3, 1);
        layout.set_point(0, &[1.0]);
        layout.set_point(1, &[2.0]);
        layout.set_point(2, &[3.0]);
        layout.remove_points(&[1]);
        assert_eq!(layout.num_points(), 2);
        assert_eq!(layout.point(0).unwrap(), &[1.0]);
        assert_eq!(layout.point(1).unwrap(), &[3.0]);
    }

    #[test]
    fn composition_applies_right_first() {
        let scale = Transformation::new(vec![2.0, 0.0, 0.0, 2.0], vec![0.0, 0.0]).unwrap();
        let translate = Transformation::new(vec![1.0, 0.0, 0.0, 1.0], vec![1.0, 1.0]).unwrap();
        let composed = translate.compose(&scale).unwrap();
        let out = composed.apply(&[1.0, 1.0]);
        assert!(approx_eq!(f64, out[0], 3.0, epsilon = 1e-12));
        assert!(approx_eq!(f64, out[1], 3.0, epsilon = 1e-12));
    }
}
