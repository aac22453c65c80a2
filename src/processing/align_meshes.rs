use nalgebra::Point3;

use crate::error::{AlignError, AlignResult};
use crate::io::Mesh;
use crate::processing::transform::{LandmarkTransform, TransformMode};

/// A mesh moved into the aligned frame together with the transform that moved it.
#[derive(Debug, Clone)]
pub struct TransformedMesh {
    pub mesh: Mesh,
    pub transform: LandmarkTransform,
    /// RMS distance between the transformed original landmarks and their aligned positions.
    pub residual: f64,
}

/// Fits `original -> aligned` once and applies it to every vertex of `mesh`.
/// Topology and attributes are copied; the input mesh is left untouched.
pub fn transform_mesh(
    original: &[Point3<f64>],
    aligned: &[Point3<f64>],
    mesh: &Mesh,
    mode: TransformMode,
) -> AlignResult<TransformedMesh> {
    if original.len() != aligned.len() {
        return Err(AlignError::DimensionMismatch(format!(
            "{} original landmarks but {} aligned landmarks",
            original.len(),
            aligned.len()
        )));
    }

    let transform = LandmarkTransform::fit(original, aligned, mode)?;
    let residual = transform.rms_residual(original, aligned);
    let vertices = transform.apply_all(&mesh.vertices);

    Ok(TransformedMesh {
        mesh: mesh.with_vertices(vertices),
        transform,
        residual,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::procrustes::{procrustes_align, ProcrustesSettings};
    use crate::utils::test_utils::{
        pairwise_distances, pose_points, random_pose, seeded_rng, tetra_mesh, unit_tetrahedron,
    };
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn subjects(seed: u64, scales: &[f64]) -> Vec<Vec<Point3<f64>>> {
        let mut rng = seeded_rng(seed);
        scales
            .iter()
            .map(|&s| {
                let (rotation, translation) = random_pose(&mut rng);
                pose_points(&unit_tetrahedron(), s, &rotation, &translation)
            })
            .collect()
    }

    #[test]
    fn test_landmark_vertices_land_on_aligned_landmarks() {
        let sets = subjects(11, &[1.0, 2.0, 3.0]);
        let result = procrustes_align(&sets, &ProcrustesSettings::default()).unwrap();

        for (original, aligned) in sets.iter().zip(result.aligned.iter()) {
            // mesh vertices coincide with the landmarks
            let mesh = tetra_mesh(original.clone());
            let moved =
                transform_mesh(original, aligned, &mesh, TransformMode::Similarity).unwrap();
            for (v, a) in moved.mesh.vertices.iter().zip(aligned.iter()) {
                assert_relative_eq!(v.x, a.x, epsilon = 1e-6);
                assert_relative_eq!(v.y, a.y, epsilon = 1e-6);
                assert_relative_eq!(v.z, a.z, epsilon = 1e-6);
            }
            assert!(moved.residual < 1e-6);
            assert_eq!(moved.mesh.cells, mesh.cells);
            assert_eq!(moved.mesh.attributes, mesh.attributes);
        }
    }

    #[test]
    fn test_rigid_mode_preserves_vertex_distances() {
        let mut rng = seeded_rng(17);
        let landmarks = unit_tetrahedron();
        let (rotation, translation) = random_pose(&mut rng);
        let target = pose_points(&landmarks, 1.0, &rotation, &translation);

        let mesh = tetra_mesh(vec![
            Point3::new(0.3, -1.0, 2.0),
            Point3::new(4.0, 0.5, 0.0),
            Point3::new(-2.0, 3.0, 1.0),
            Point3::new(0.0, 0.0, -5.0),
        ]);
        let moved = transform_mesh(&landmarks, &target, &mesh, TransformMode::Rigid).unwrap();

        for (a, b) in pairwise_distances(&mesh.vertices)
            .iter()
            .zip(pairwise_distances(&moved.mesh.vertices).iter())
        {
            assert_relative_eq!(*a, *b, epsilon = 1e-9);
        }
        assert_relative_eq!(moved.transform.determinant(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_similarity_mode_scales_uniformly() {
        let mut rng = seeded_rng(23);
        let landmarks = unit_tetrahedron();
        let (rotation, translation) = random_pose(&mut rng);
        let target = pose_points(&landmarks, 2.0, &rotation, &translation);

        let mesh = tetra_mesh(vec![
            Point3::new(1.0, 1.0, 1.0),
            Point3::new(2.0, 0.0, 0.0),
            Point3::new(0.0, -3.0, 0.5),
            Point3::new(0.0, 0.0, 0.0),
        ]);
        let moved = transform_mesh(&landmarks, &target, &mesh, TransformMode::Similarity).unwrap();

        for (a, b) in pairwise_distances(&mesh.vertices)
            .iter()
            .zip(pairwise_distances(&moved.mesh.vertices).iter())
        {
            assert_relative_eq!(*b, 2.0 * *a, epsilon = 1e-9);
        }
        assert_relative_eq!(moved.transform.scale(), 2.0, epsilon = 1e-9);
        assert_relative_eq!(moved.transform.determinant(), 8.0, epsilon = 1e-8);
    }

    #[test]
    fn test_input_mesh_is_not_mutated() {
        let landmarks = unit_tetrahedron();
        let shifted: Vec<_> = landmarks
            .iter()
            .map(|p| p + Vector3::new(10.0, 0.0, 0.0))
            .collect();
        let mesh = tetra_mesh(landmarks.clone());
        let moved = transform_mesh(&landmarks, &shifted, &mesh, TransformMode::Rigid).unwrap();

        assert_eq!(mesh.vertices, unit_tetrahedron());
        assert_relative_eq!(moved.mesh.vertices[1].x, 11.0, epsilon = 1e-9);
    }

    #[test]
    fn test_landmark_count_mismatch() {
        let landmarks = unit_tetrahedron();
        let mesh = tetra_mesh(landmarks.clone());
        let err =
            transform_mesh(&landmarks, &landmarks[..3], &mesh, TransformMode::Rigid).unwrap_err();
        assert!(matches!(err, AlignError::DimensionMismatch(_)));
    }
}
