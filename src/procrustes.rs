//! Procrustes alignment between two projections — spec §4.K.

use crate::err::{Error, Result};
use crate::layout::{Layout, Transformation};
use crate::optimize::kernel::{NalgebraSvd, Svd};

/// Outcome of [`align`]: the rigid (optionally scaled) transformation that
/// maps the secondary layout onto the primary one, plus the RMS residual.
#[derive(Debug, Clone)]
pub struct ProcrustesResult {
    pub transformation: Transformation,
    pub scale: f64,
    pub rms: f64,
}

fn centroid(layout: &Layout, pairs: &[(usize, usize)], primary: bool) -> Vec<f64> {
    let dims = layout.num_dims();
    let mut sum = vec![0.0; dims];
    let mut count = 0usize;
    for &(a, b) in pairs {
        let p = if primary { a } else { b };
        if let Some(coords) = layout.point(p) {
            if layout.point_has_coordinates(p) {
                for (s, c) in sum.iter_mut().zip(coords) {
                    *s += c;
                }
                count += 1;
            }
        }
    }
    if count > 0 {
        for s in sum.iter_mut() {
            *s /= count as f64;
        }
    }
    sum
}

/// Align `secondary` onto `primary` over the common point pairs
/// `(primary_index, secondary_index)`, excluding pairs where either side is
/// disconnected (spec §4.K steps 1-6).
pub fn align(
    primary: &Layout,
    secondary: &Layout,
    common_pairs: &[(usize, usize)],
    scaling: bool,
) -> Result<ProcrustesResult> {
    if primary.num_dims() != secondary.num_dims() {
        return Err(Error::InvalidDimensionality(format!(
            "{} vs {}",
            primary.num_dims(),
            secondary.num_dims()
        )));
    }
    let dims = primary.num_dims();
    let usable: Vec<(usize, usize)> = common_pairs
        .iter()
        .copied()
        .filter(|&(a, b)| primary.point_has_coordinates(a) && secondary.point_has_coordinates(b))
        .collect();
    if usable.len() < dims {
        return Err(Error::StructureInvalid(format!(
            "procrustes needs at least {dims} common non-disconnected points, got {}",
            usable.len()
        )));
    }

    let mean_x = centroid(primary, &usable, true);
    let mean_y = centroid(secondary, &usable, false);

    let n = usable.len();
    let mut cx = nalgebra::DMatrix::<f64>::zeros(n, dims);
    let mut cy = nalgebra::DMatrix::<f64>::zeros(n, dims);
    for (row, &(a, b)) in usable.iter().enumerate() {
        let xa = primary.point(a).unwrap();
        let yb = secondary.point(b).unwrap();
        for d in 0..dims {
            cx[(row, d)] = xa[d] - mean_x[d];
            cy[(row, d)] = yb[d] - mean_y[d];
        }
    }

    // M = (JY)^T (JX) = cy^T * cx
    let m = cy.transpose() * &cx;
    let svd = NalgebraSvd;
    let (u, _s, v_t) = svd.svd(&m);
    // R = V^T U (transpose-both form).
    let r = v_t.transpose() * u.transpose();

    let scale = if scaling {
        let numerator = (cx.transpose() * &cy * &r).trace();
        let denominator = (cy.transpose() * &cy).trace();
        if denominator.abs() < 1e-300 {
            1.0
        } else {
            numerator / denominator
        }
    } else {
        1.0
    };

    let mut matrix = vec![0.0; dims * dims];
    for i in 0..dims {
        for j in 0..dims {
            matrix[i * dims + j] = scale * r[(i, j)];
        }
    }
    let r_mean_y: Vec<f64> = (0..dims)
        .map(|i| (0..dims).map(|j| scale * r[(i, j)] * mean_y[j]).sum())
        .collect();
    let translation: Vec<f64> = mean_x
        .iter()
        .zip(&r_mean_y)
        .map(|(x, ry)| x - ry)
        .collect();

    let transformation = Transformation::new(matrix, translation)?;
    let transformed_secondary = secondary.transform(&transformation)?;

    let mut sq_sum = 0.0;
    let mut count = 0usize;
    for &(a, b) in &usable {
        let dist = primary_to_transformed_distance(primary, &transformed_secondary, a, b);
        if dist.is_finite() {
            sq_sum += dist * dist;
            count += 1;
        }
    }
    let rms = if count > 0 { (sq_sum / count as f64).sqrt() } else { 0.0 };

    Ok(ProcrustesResult {
        transformation,
        scale,
        rms,
    })
}

fn primary_to_transformed_distance(primary: &Layout, transformed_secondary: &Layout, a: usize, b: usize) -> f64 {
    match (primary.point(a), transformed_secondary.point(b)) {
        (Some(pa), Some(pb)) if primary.point_has_coordinates(a) && transformed_secondary.point_has_coordinates(b) => pa
            .iter()
            .zip(pb)
            .map(|(x, y)| (x - y).powi(2))
            .sum::<f64>()
            .sqrt(),
        _ => f64::NAN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::approx_eq;

    #[test]
    fn identical_layouts_align_with_zero_rms() {
        let mut primary = Layout::new(3, 2);
        primary.set_point(0, &[0.0, 0.0]);
        primary.set_point(1, &[1.0, 0.0]);
        primary.set_point(2, &[0.0, 1.0]);
        let result = align(&primary, &primary, &[(0, 0), (1, 1), (2, 2)], false).unwrap();
        assert!(approx_eq!(f64, result.rms, 0.0, epsilon = 1e-9));
    }

    #[test]
    fn recovers_known_rotation_and_translation() {
        let mut primary = Layout::new(3, 2);
        primary.set_point(0, &[0.0, 0.0]);
        primary.set_point(1, &[2.0, 0.0]);
        primary.set_point(2, &[0.0, 2.0]);

        // secondary = rotate primary by 90deg then translate by (5, 5).
        let mut secondary = Layout::new(3, 2);
        let rotate_90 = |x: f64, y: f64| (-y, x);
        for p in 0..3 {
            let coords = primary.point(p).unwrap();
            let (rx, ry) = rotate_90(coords[0], coords[1]);
            secondary.set_point(p, &[rx + 5.0, ry + 5.0]);
        }

        let result = align(&primary, &secondary, &[(0, 0), (1, 1), (2, 2)], false).unwrap();
        assert!(approx_eq!(f64, result.rms, 0.0, epsilon = 1e-6));
    }

    #[test]
    fn too_few_common_points_errors() {
        let layout = Layout::new(2, 3);
        let result = align(&layout, &layout, &[(0, 0)], false);
        assert!(result.is_err());
    }
}
