use std::cmp::Ordering;
use std::fmt;

use nalgebra::{Matrix3, Point3, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{AlignError, AlignResult};

/// Relative eigenvalue floor of the scatter matrix below which a point set is
/// treated as collinear (rigid/similarity) or coplanar (affine).
const DEGENERACY_TOLERANCE: f64 = 1e-10;

/// Spread below this many units of round-off at the coordinates' magnitude
/// counts as coincident points.
const COINCIDENCE_ROUNDOFF: f64 = 1e3;

/// Transform family used both for Procrustes superposition and for moving meshes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransformMode {
    /// Rotation and translation.
    Rigid,
    /// Rotation, translation and uniform scale.
    Similarity,
    /// General linear map and translation.
    Affine,
}

impl TransformMode {
    /// Minimum number of corresponding points for a well-posed fit in 3-D.
    pub fn min_points(self) -> usize {
        match self {
            TransformMode::Rigid | TransformMode::Similarity => 3,
            TransformMode::Affine => 4,
        }
    }

    /// Rank the centered point scatter must reach: non-collinear for
    /// rigid/similarity, non-coplanar for affine.
    fn required_rank(self) -> usize {
        match self {
            TransformMode::Rigid | TransformMode::Similarity => 2,
            TransformMode::Affine => 3,
        }
    }
}

impl fmt::Display for TransformMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransformMode::Rigid => "rigid",
            TransformMode::Similarity => "similarity",
            TransformMode::Affine => "affine",
        };
        write!(f, "{}", name)
    }
}

/// Arithmetic mean of a point set.
pub fn compute_centroid(points: &[Point3<f64>]) -> Point3<f64> {
    if points.is_empty() {
        return Point3::origin();
    }
    let sum = points
        .iter()
        .fold(Vector3::zeros(), |acc, p| acc + p.coords);
    Point3::from(sum / points.len() as f64)
}

/// Root of the summed squared distances from the centroid.
pub fn centroid_size(points: &[Point3<f64>]) -> f64 {
    let centroid = compute_centroid(points);
    points
        .iter()
        .map(|p| (p - centroid).norm_squared())
        .sum::<f64>()
        .sqrt()
}

/// Multiplies every coordinate by `factor` (scaling about the origin).
pub fn scale_shape(points: &mut [Point3<f64>], factor: f64) {
    for p in points.iter_mut() {
        p.coords *= factor;
    }
}

/// Returns a copy of the shape translated so its centroid sits at the origin.
pub fn center_shape(points: &[Point3<f64>]) -> Vec<Point3<f64>> {
    let centroid = compute_centroid(points);
    points.iter().map(|p| Point3::from(p - centroid)).collect()
}

/// Eigenvalues of the centered scatter matrix, largest first.
fn scatter_spectrum(points: &[Point3<f64>]) -> [f64; 3] {
    let centroid = compute_centroid(points);
    let mut scatter = Matrix3::zeros();
    for p in points {
        let d = p - centroid;
        scatter += d * d.transpose();
    }
    let mut values: Vec<f64> = scatter
        .symmetric_eigenvalues()
        .iter()
        .map(|v| v.max(0.0))
        .collect();
    values.sort_by(|a, b| b.partial_cmp(a).unwrap_or(Ordering::Equal));
    [values[0], values[1], values[2]]
}

fn check_conditioning(label: &str, points: &[Point3<f64>], mode: TransformMode) -> AlignResult<()> {
    let spectrum = scatter_spectrum(points);
    let magnitude = points.iter().map(|p| p.coords.amax()).fold(0.0, f64::max);
    let floor = (COINCIDENCE_ROUNDOFF * f64::EPSILON * magnitude).powi(2) * points.len() as f64;
    if spectrum[0] <= floor {
        return Err(AlignError::DegenerateConfiguration(format!(
            "{} landmarks are coincident",
            label
        )));
    }
    let rank = mode.required_rank();
    if spectrum[rank - 1] <= DEGENERACY_TOLERANCE * spectrum[0] {
        let shape = if rank == 2 { "collinear" } else { "coplanar" };
        return Err(AlignError::DegenerateConfiguration(format!(
            "{} landmarks are {} and cannot define a {} transform",
            label, shape, mode
        )));
    }
    Ok(())
}

/// Point-correspondence transform `p -> linear * p + translation`.
#[derive(Debug, Clone, PartialEq)]
pub struct LandmarkTransform {
    pub mode: TransformMode,
    pub linear: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl LandmarkTransform {
    /// Least-squares fit mapping `source[i]` onto `target[i]`.
    ///
    /// Rigid and similarity fits use the SVD of the cross-covariance (Kabsch) with
    /// reflection removal; the similarity scale is the ratio of the root summed
    /// squared spreads of target and source. Affine fits solve the normal
    /// equations of the centered correspondences.
    ///
    /// Fails with `DimensionMismatch` for unequal lengths and with
    /// `DegenerateConfiguration` when the points cannot pin down the transform.
    pub fn fit(
        source: &[Point3<f64>],
        target: &[Point3<f64>],
        mode: TransformMode,
    ) -> AlignResult<Self> {
        if source.len() != target.len() {
            return Err(AlignError::DimensionMismatch(format!(
                "source has {} landmarks but target has {}",
                source.len(),
                target.len()
            )));
        }
        if source.len() < mode.min_points() {
            return Err(AlignError::DegenerateConfiguration(format!(
                "{} transform needs at least {} landmarks, got {}",
                mode,
                mode.min_points(),
                source.len()
            )));
        }

        match mode {
            TransformMode::Rigid | TransformMode::Similarity => {
                Self::fit_orthogonal(source, target, mode)
            }
            TransformMode::Affine => Self::fit_affine(source, target),
        }
    }

    fn fit_orthogonal(
        source: &[Point3<f64>],
        target: &[Point3<f64>],
        mode: TransformMode,
    ) -> AlignResult<Self> {
        check_conditioning("source", source, mode)?;
        check_conditioning("target", target, mode)?;

        let source_centroid = compute_centroid(source);
        let target_centroid = compute_centroid(target);

        let mut h = Matrix3::zeros();
        let mut source_spread = 0.0;
        let mut target_spread = 0.0;
        for (s, t) in source.iter().zip(target.iter()) {
            let ds = s - source_centroid;
            let dt = t - target_centroid;
            h += ds * dt.transpose();
            source_spread += ds.norm_squared();
            target_spread += dt.norm_squared();
        }

        let svd = h.svd(true, true);
        let u = svd.u.ok_or_else(|| {
            AlignError::DegenerateConfiguration("SVD of the landmark covariance failed".into())
        })?;
        let v_t = svd.v_t.ok_or_else(|| {
            AlignError::DegenerateConfiguration("SVD of the landmark covariance failed".into())
        })?;

        let mut v = v_t.transpose();
        let mut rotation = v * u.transpose();
        if rotation.determinant() < 0.0 {
            // flip the axis of least variance to turn the reflection into a rotation
            let k = svd.singular_values.imin();
            for i in 0..3 {
                v[(i, k)] = -v[(i, k)];
            }
            rotation = v * u.transpose();
        }

        let scale = match mode {
            TransformMode::Similarity => (target_spread / source_spread).sqrt(),
            _ => 1.0,
        };

        let linear = rotation * scale;
        let translation = target_centroid.coords - linear * source_centroid.coords;
        Ok(LandmarkTransform {
            mode,
            linear,
            translation,
        })
    }

    fn fit_affine(source: &[Point3<f64>], target: &[Point3<f64>]) -> AlignResult<Self> {
        check_conditioning("source", source, TransformMode::Affine)?;

        let source_centroid = compute_centroid(source);
        let target_centroid = compute_centroid(target);

        let mut cross = Matrix3::zeros();
        let mut scatter = Matrix3::zeros();
        for (s, t) in source.iter().zip(target.iter()) {
            let ds = s - source_centroid;
            let dt = t - target_centroid;
            cross += dt * ds.transpose();
            scatter += ds * ds.transpose();
        }

        let inverse = scatter.try_inverse().ok_or_else(|| {
            AlignError::DegenerateConfiguration("source landmark scatter is singular".into())
        })?;
        let linear = cross * inverse;
        let translation = target_centroid.coords - linear * source_centroid.coords;
        Ok(LandmarkTransform {
            mode: TransformMode::Affine,
            linear,
            translation,
        })
    }

    pub fn apply(&self, point: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.linear * point.coords + self.translation)
    }

    pub fn apply_all(&self, points: &[Point3<f64>]) -> Vec<Point3<f64>> {
        points.iter().map(|p| self.apply(p)).collect()
    }

    /// Determinant of the linear part: `s^3` for similarity, 1 for rigid,
    /// close to zero or negative for a collapsed or mirrored fit.
    pub fn determinant(&self) -> f64 {
        self.linear.determinant()
    }

    /// Uniform scale implied by the determinant.
    pub fn scale(&self) -> f64 {
        self.determinant().cbrt()
    }

    /// Root mean square distance between transformed source and target.
    pub fn rms_residual(&self, source: &[Point3<f64>], target: &[Point3<f64>]) -> f64 {
        if source.is_empty() {
            return 0.0;
        }
        let sum: f64 = source
            .iter()
            .zip(target.iter())
            .map(|(s, t)| (self.apply(s) - t).norm_squared())
            .sum();
        (sum / source.len() as f64).sqrt()
    }

    /// Row-major homogeneous 4x4 matrix.
    pub fn to_rows(&self) -> [[f64; 4]; 4] {
        let mut rows = [[0.0; 4]; 4];
        for (r, row) in rows.iter_mut().take(3).enumerate() {
            for (c, value) in row.iter_mut().take(3).enumerate() {
                *value = self.linear[(r, c)];
            }
            row[3] = self.translation[r];
        }
        rows[3][3] = 1.0;
        rows
    }
}
