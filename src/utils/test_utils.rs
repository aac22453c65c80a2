use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use nalgebra::{Point3, Rotation3, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{AlignError, AlignResult};
use crate::io::{CellBlock, CellKind, Mesh, MeshFormat, MeshStore};

/// Corner of the positive octant plus the three unit axis points.
pub fn unit_tetrahedron() -> Vec<Point3<f64>> {
    vec![
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(1.0, 0.0, 0.0),
        Point3::new(0.0, 1.0, 0.0),
        Point3::new(0.0, 0.0, 1.0),
    ]
}

pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Random proper rotation and a translation within a 50 unit box.
pub fn random_pose(rng: &mut StdRng) -> (Rotation3<f64>, Vector3<f64>) {
    let rotation = Rotation3::from_euler_angles(
        rng.random_range(-3.0..3.0),
        rng.random_range(-1.5..1.5),
        rng.random_range(-3.0..3.0),
    );
    let translation = Vector3::new(
        rng.random_range(-50.0..50.0),
        rng.random_range(-50.0..50.0),
        rng.random_range(-50.0..50.0),
    );
    (rotation, translation)
}

/// `rotation * (scale * p) + translation` for every point.
pub fn pose_points(
    points: &[Point3<f64>],
    scale: f64,
    rotation: &Rotation3<f64>,
    translation: &Vector3<f64>,
) -> Vec<Point3<f64>> {
    points
        .iter()
        .map(|p| rotation * Point3::from(p.coords * scale) + translation)
        .collect()
}

/// Adds uniform noise in `[-amplitude, amplitude)` to every coordinate.
pub fn jitter(points: &[Point3<f64>], amplitude: f64, rng: &mut StdRng) -> Vec<Point3<f64>> {
    points
        .iter()
        .map(|p| {
            p + Vector3::new(
                rng.random_range(-amplitude..amplitude),
                rng.random_range(-amplitude..amplitude),
                rng.random_range(-amplitude..amplitude),
            )
        })
        .collect()
}

/// Distances between all point pairs `(i, j)` with `i < j`, in a fixed order.
pub fn pairwise_distances(points: &[Point3<f64>]) -> Vec<f64> {
    let mut distances = Vec::new();
    for i in 0..points.len() {
        for j in (i + 1)..points.len() {
            distances.push((points[i] - points[j]).norm());
        }
    }
    distances
}

/// Closed tetrahedral surface over the given four vertices.
pub fn tetra_mesh(vertices: Vec<Point3<f64>>) -> Mesh {
    Mesh {
        format: MeshFormat::Vtk,
        title: "tetra".to_string(),
        vertices,
        vertex_extras: Vec::new(),
        cells: vec![CellBlock {
            kind: CellKind::Polygons,
            cells: vec![vec![0, 2, 1], vec![0, 1, 3], vec![0, 3, 2], vec![1, 2, 3]],
        }],
        fields: Vec::new(),
        attributes: vec![
            "POINT_DATA 4".to_string(),
            "SCALARS region int 1".to_string(),
            "LOOKUP_TABLE default".to_string(),
            "0 1 1 2".to_string(),
        ],
    }
}

/// `MeshStore` backed by maps instead of files. Written meshes are kept so tests
/// can inspect them; writes to a path whose file name contains `fail_writes_to`
/// fail with a permission error.
#[derive(Default)]
pub struct InMemoryStore {
    pub landmarks: HashMap<PathBuf, Vec<Point3<f64>>>,
    pub meshes: HashMap<PathBuf, Mesh>,
    pub written: Mutex<HashMap<PathBuf, Mesh>>,
    pub fail_writes_to: Option<String>,
}

impl InMemoryStore {
    pub fn written_mesh(&self, path: &Path) -> Option<Mesh> {
        self.written.lock().unwrap().get(path).cloned()
    }

    pub fn written_count(&self) -> usize {
        self.written.lock().unwrap().len()
    }
}

impl MeshStore for InMemoryStore {
    fn read_landmarks(&self, path: &Path) -> AlignResult<Vec<Point3<f64>>> {
        self.landmarks
            .get(path)
            .cloned()
            .ok_or_else(|| AlignError::NotFound(path.to_path_buf()))
    }

    fn read_mesh(&self, path: &Path) -> AlignResult<Mesh> {
        self.meshes
            .get(path)
            .cloned()
            .ok_or_else(|| AlignError::NotFound(path.to_path_buf()))
    }

    fn write_mesh(&self, path: &Path, mesh: &Mesh) -> AlignResult<()> {
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        if let Some(marker) = &self.fail_writes_to {
            if name.contains(marker.as_str()) {
                return Err(AlignError::from_io(
                    path,
                    std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
                ));
            }
        }
        self.written
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), mesh.clone());
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> AlignResult<()> {
        let mut written = self.written.lock().unwrap();
        let mesh = written
            .remove(from)
            .ok_or_else(|| AlignError::NotFound(from.to_path_buf()))?;
        written.insert(to.to_path_buf(), mesh);
        Ok(())
    }

    fn remove(&self, path: &Path) -> AlignResult<()> {
        self.written
            .lock()
            .unwrap()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| AlignError::NotFound(path.to_path_buf()))
    }
}
