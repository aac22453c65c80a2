use nalgebra::{Point3, Vector3};
use tracing::{debug, warn};

use crate::error::{AlignError, AlignResult};
use crate::processing::transform::{
    center_shape, centroid_size, scale_shape, LandmarkTransform, TransformMode,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcrustesSettings {
    pub mode: TransformMode,
    /// Upper bound on mean re-estimation rounds.
    pub max_iterations: usize,
    /// Summed squared change of the mean below which the loop stops.
    pub tolerance: f64,
}

impl Default for ProcrustesSettings {
    fn default() -> Self {
        ProcrustesSettings {
            mode: TransformMode::Similarity,
            max_iterations: 5,
            tolerance: 1e-6,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcrustesResult {
    /// Subjects superimposed on the mean, in input order.
    pub aligned: Vec<Vec<Point3<f64>>>,
    pub mean: Vec<Point3<f64>>,
    pub iterations: usize,
    pub converged: bool,
    /// Average pre-alignment centroid size applied in similarity mode.
    pub scale_factor: Option<f64>,
}

/// Checks that every set has the same number of landmarks and enough of them
/// for the transform family. Returns the common landmark count.
pub fn validate_landmark_sets(
    landmark_sets: &[Vec<Point3<f64>>],
    mode: TransformMode,
) -> AlignResult<usize> {
    let first = landmark_sets.first().ok_or_else(|| {
        AlignError::DimensionMismatch("no landmark sets supplied".to_string())
    })?;
    let n_points = first.len();

    for (idx, set) in landmark_sets.iter().enumerate().skip(1) {
        if set.len() != n_points {
            return Err(AlignError::DimensionMismatch(format!(
                "subject {} has {} landmarks, expected {}",
                idx,
                set.len(),
                n_points
            )));
        }
    }

    if n_points < mode.min_points() {
        return Err(AlignError::DegenerateConfiguration(format!(
            "{} alignment needs at least {} landmarks per subject, got {}",
            mode,
            mode.min_points(),
            n_points
        )));
    }
    Ok(n_points)
}

/// Pointwise average of equally sized shapes.
pub fn mean_shape(shapes: &[Vec<Point3<f64>>], n_points: usize) -> Vec<Point3<f64>> {
    let n = shapes.len() as f64;
    (0..n_points)
        .map(|i| {
            let sum = shapes
                .iter()
                .fold(Vector3::zeros(), |acc, shape| acc + shape[i].coords);
            Point3::from(sum / n)
        })
        .collect()
}

fn sum_squared_distance(a: &[Point3<f64>], b: &[Point3<f64>]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(p, q)| (p - q).norm_squared())
        .sum()
}

fn normalize_size(shape: &mut [Point3<f64>]) -> AlignResult<()> {
    let size = centroid_size(shape);
    if size <= f64::EPSILON {
        return Err(AlignError::DegenerateConfiguration(
            "mean shape collapsed to a single point".to_string(),
        ));
    }
    scale_shape(shape, 1.0 / size);
    Ok(())
}

fn tag_subject(err: AlignError, idx: usize) -> AlignError {
    match err {
        AlignError::DegenerateConfiguration(msg) => {
            AlignError::DegenerateConfiguration(format!("subject {}: {}", idx, msg))
        }
        AlignError::DimensionMismatch(msg) => {
            AlignError::DimensionMismatch(format!("subject {}: {}", idx, msg))
        }
        other => other,
    }
}

/// Generalized Procrustes analysis over a batch of landmark sets.
///
/// The reference starts as subject 0 moved to the origin (and normalized to unit
/// centroid size in similarity mode). That first reference is kept as an anchor:
/// in rigid and similarity mode every new mean is registered back onto it so the
/// global pose stays fixed between rounds. Affine mode re-estimates the mean
/// without anchoring.
///
/// In similarity mode the output is rescaled post hoc by the average centroid
/// size of the *input* sets, so the mean and aligned sets keep a physical scale
/// instead of unit size.
pub fn procrustes_align(
    landmark_sets: &[Vec<Point3<f64>>],
    settings: &ProcrustesSettings,
) -> AlignResult<ProcrustesResult> {
    let mode = settings.mode;
    let n_points = validate_landmark_sets(landmark_sets, mode)?;

    let mut reference = center_shape(&landmark_sets[0]);
    if mode == TransformMode::Similarity {
        normalize_size(&mut reference)?;
    }
    let anchor = reference.clone();

    let max_iterations = settings.max_iterations.max(1);
    let mut aligned: Vec<Vec<Point3<f64>>> = Vec::with_capacity(landmark_sets.len());
    let mut iterations = 0;
    let mut converged = false;

    while iterations < max_iterations {
        aligned = landmark_sets
            .iter()
            .enumerate()
            .map(|(idx, set)| {
                LandmarkTransform::fit(set, &reference, mode)
                    .map(|transform| transform.apply_all(set))
                    .map_err(|e| tag_subject(e, idx))
            })
            .collect::<AlignResult<Vec<_>>>()?;

        let mut new_mean = mean_shape(&aligned, n_points);
        if mode != TransformMode::Affine {
            let to_anchor = LandmarkTransform::fit(&new_mean, &anchor, mode)?;
            new_mean = to_anchor.apply_all(&new_mean);
        }
        if mode == TransformMode::Similarity {
            new_mean = center_shape(&new_mean);
            normalize_size(&mut new_mean)?;
        }

        let difference = sum_squared_distance(&new_mean, &reference);
        reference = new_mean;
        iterations += 1;
        debug!("Procrustes iteration {}: mean moved by {:e}", iterations, difference);

        if difference <= settings.tolerance {
            converged = true;
            break;
        }
    }

    if !converged {
        warn!(
            "Procrustes mean did not settle within {} iterations (tolerance {:e})",
            max_iterations, settings.tolerance
        );
    }

    let mut mean = reference;
    let scale_factor = if mode == TransformMode::Similarity {
        let sizes: Vec<f64> = landmark_sets.iter().map(|set| centroid_size(set)).collect();
        let s = sizes.iter().sum::<f64>() / sizes.len() as f64;
        scale_shape(&mut mean, s);
        for shape in aligned.iter_mut() {
            scale_shape(shape, s);
        }
        debug!("Restored scale with average centroid size {:.4}", s);
        Some(s)
    } else {
        None
    };

    Ok(ProcrustesResult {
        aligned,
        mean,
        iterations,
        converged,
        scale_factor,
    })
}
