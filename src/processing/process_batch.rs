use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use nalgebra::Point3;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::io::output::{write_json_report, write_mean_shape_csv};
use crate::io::pairing::{aligned_file_name, discover_subject_pairs, list_aligned_meshes, SubjectPair};
use crate::io::{FileStore, MeshStore};
use crate::processing::align_meshes::{transform_mesh, TransformedMesh};
use crate::processing::procrustes::{procrustes_align, ProcrustesSettings};
use crate::processing::transform::TransformMode;

/// Determinants at or below this are reported as degenerate or reflected fits.
const DETERMINANT_WARN_THRESHOLD: f64 = 1e-6;

#[derive(Debug, Clone)]
pub struct AlignmentSettings {
    pub procrustes: ProcrustesSettings,
    /// Appended to each mesh stem when naming outputs.
    pub suffix: String,
    pub parallel: bool,
}

impl Default for AlignmentSettings {
    fn default() -> Self {
        AlignmentSettings {
            procrustes: ProcrustesSettings::default(),
            suffix: "_a".to_string(),
            parallel: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubjectReport {
    pub id: String,
    pub mesh: PathBuf,
    pub landmarks: PathBuf,
    pub output: PathBuf,
    pub determinant: f64,
    pub rms_residual: f64,
    /// Homogeneous 4x4 matrix, row major.
    pub matrix: [[f64; 4]; 4],
    pub vertex_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlignmentReport {
    pub mode: TransformMode,
    pub iterations: usize,
    pub converged: bool,
    pub scale_factor: Option<f64>,
    pub mean_shape: Vec<[f64; 3]>,
    pub subjects: Vec<SubjectReport>,
}

struct AlignedSubject {
    output: PathBuf,
    moved: TransformedMesh,
}

/// Aligns every subject's mesh into the shared Procrustes frame.
///
/// Landmarks are superimposed first; each mesh is then moved by the transform
/// taking its original landmarks onto their aligned positions. All meshes are
/// transformed before any is written. Meshes are written under a staging name
/// and renamed into place only after every write succeeded; a failed write
/// removes the staged files again.
pub fn align_meshes_to_center<S: MeshStore>(
    store: &S,
    pairs: &[SubjectPair],
    settings: &AlignmentSettings,
    output_dir: &Path,
) -> anyhow::Result<AlignmentReport> {
    let landmark_sets = pairs
        .iter()
        .map(|pair| {
            store.read_landmarks(&pair.landmarks).with_context(|| {
                format!("Failed to read landmarks of subject {} from {:?}", pair.id, pair.landmarks)
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let result = procrustes_align(&landmark_sets, &settings.procrustes)
        .context("Procrustes alignment of the landmark sets failed")?;
    info!(
        "Procrustes ({}) finished after {} iteration(s), converged: {}",
        settings.procrustes.mode, result.iterations, result.converged
    );

    let align_subject = |(idx, pair): (usize, &SubjectPair)| -> anyhow::Result<AlignedSubject> {
        let mesh = store
            .read_mesh(&pair.mesh)
            .with_context(|| format!("Failed to read mesh of subject {} from {:?}", pair.id, pair.mesh))?;
        let moved = transform_mesh(
            &landmark_sets[idx],
            &result.aligned[idx],
            &mesh,
            settings.procrustes.mode,
        )
        .with_context(|| format!("Failed to transform mesh {:?} of subject {}", pair.mesh, pair.id))?;
        Ok(AlignedSubject {
            output: output_dir.join(aligned_file_name(&pair.mesh, &settings.suffix)),
            moved,
        })
    };

    let aligned: Vec<AlignedSubject> = if settings.parallel {
        pairs.par_iter().enumerate().map(align_subject).collect::<anyhow::Result<_>>()?
    } else {
        pairs.iter().enumerate().map(align_subject).collect::<anyhow::Result<_>>()?
    };

    let mut subjects = Vec::with_capacity(pairs.len());
    let mut staged: Vec<PathBuf> = Vec::with_capacity(pairs.len());
    for (pair, subject) in pairs.iter().zip(aligned) {
        let determinant = subject.moved.transform.determinant();
        info!(
            "moving {:?} towards center with landmarks {:?} -- determinant: {:.2}",
            pair.mesh, pair.landmarks, determinant
        );
        if determinant <= DETERMINANT_WARN_THRESHOLD {
            warn!(
                "Subject {} has determinant {:e}; the landmark fit is degenerate or reflected",
                pair.id, determinant
            );
        }

        debug!(
            "Subject {}: scale {:.4}, landmark rms residual {:.3e}",
            pair.id,
            subject.moved.transform.scale(),
            subject.moved.residual
        );

        let staging = staging_path(&subject.output);
        if let Err(e) = store.write_mesh(&staging, &subject.moved.mesh) {
            discard_staged(store, &staged);
            return Err(anyhow::Error::new(e)
                .context(format!("Failed to write aligned mesh {:?}", subject.output)));
        }
        staged.push(staging);

        subjects.push(SubjectReport {
            id: pair.id.clone(),
            mesh: pair.mesh.clone(),
            landmarks: pair.landmarks.clone(),
            output: subject.output,
            determinant,
            rms_residual: subject.moved.residual,
            matrix: subject.moved.transform.to_rows(),
            vertex_count: subject.moved.mesh.vertices.len(),
        });
    }

    for (staging, subject) in staged.iter().zip(subjects.iter()) {
        store
            .rename(staging, &subject.output)
            .with_context(|| format!("Failed to move {:?} into place", subject.output))?;
    }

    Ok(AlignmentReport {
        mode: settings.procrustes.mode,
        iterations: result.iterations,
        converged: result.converged,
        scale_factor: result.scale_factor,
        mean_shape: result.mean.iter().map(|p: &Point3<f64>| [p.x, p.y, p.z]).collect(),
        subjects,
    })
}

fn staging_path(output: &Path) -> PathBuf {
    let mut name = output.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    output.with_file_name(name)
}

fn discard_staged<S: MeshStore>(store: &S, staged: &[PathBuf]) {
    for path in staged {
        if let Err(e) = store.remove(path) {
            warn!("Could not remove staged mesh {:?}: {}", path, e);
        }
    }
}

/// Runs a whole batch as described by the configuration: pairs the input
/// directories, aligns, writes meshes and the optional side outputs.
pub fn process_batch(config: &AppConfig) -> anyhow::Result<AlignmentReport> {
    let general = &config.general;
    let pairs = discover_subject_pairs(&general.landmark_dir, &general.mesh_dir, &config.pairing_options())
        .context("Failed to pair landmark and mesh files")?;

    fs::create_dir_all(&general.output_dir)
        .with_context(|| format!("Failed to create output directory {:?}", general.output_dir))?;

    let settings = config.alignment_settings();
    let report = align_meshes_to_center(&FileStore, &pairs, &settings, &general.output_dir)?;

    if config.output.write_mean_shape {
        let path = general.output_dir.join(&config.output.mean_shape_file);
        let mean: Vec<Point3<f64>> = report
            .mean_shape
            .iter()
            .map(|&[x, y, z]| Point3::new(x, y, z))
            .collect();
        write_mean_shape_csv(&path, &mean)?;
        info!("Wrote mean shape to {:?}", path);
    }
    if config.output.write_report {
        let path = general.output_dir.join(&config.output.report_file);
        write_json_report(&path, &report)?;
        info!("Wrote alignment report to {:?}", path);
    }

    let manifest = list_aligned_meshes(
        &general.output_dir,
        &config.settings.suffix,
        &config.settings.mesh_extension,
        &config.settings.template_name,
    )?;
    let stale: Vec<&String> = manifest
        .iter()
        .filter(|name| {
            !report
                .subjects
                .iter()
                .any(|s| s.output.file_name().map(|n| n.to_string_lossy() == name.as_str()).unwrap_or(false))
        })
        .collect();
    if !stale.is_empty() {
        warn!("Output directory holds aligned meshes from an earlier run: {:?}", stale);
    }
    info!("Aligned meshes: {:?}", manifest);

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::error::AlignError;
    use crate::io::output::write_mesh;
    use crate::utils::test_utils::{
        pose_points, random_pose, seeded_rng, tetra_mesh, unit_tetrahedron, InMemoryStore,
    };
    use approx::assert_relative_eq;

    fn store_with_subjects(scales: &[f64]) -> (InMemoryStore, Vec<SubjectPair>) {
        let mut rng = seeded_rng(99);
        let mut store = InMemoryStore::default();
        let mut pairs = Vec::new();
        for (i, &s) in scales.iter().enumerate() {
            let (rotation, translation) = random_pose(&mut rng);
            let landmarks = pose_points(&unit_tetrahedron(), s, &rotation, &translation);
            let id = format!("s{:02}", i + 1);
            let pair = SubjectPair {
                id: id.clone(),
                landmarks: PathBuf::from(format!("landmarks/{}.mps", id)),
                mesh: PathBuf::from(format!("meshes/{}.vtk", id)),
            };
            store.landmarks.insert(pair.landmarks.clone(), landmarks.clone());
            store.meshes.insert(pair.mesh.clone(), tetra_mesh(landmarks));
            pairs.push(pair);
        }
        (store, pairs)
    }

    #[test]
    fn test_pipeline_moves_meshes_onto_aligned_landmarks() {
        let (store, pairs) = store_with_subjects(&[1.0, 2.0, 3.0]);
        let settings = AlignmentSettings::default();
        let report = align_meshes_to_center(&store, &pairs, &settings, Path::new("out")).unwrap();

        assert_eq!(store.written_count(), 3);
        assert_eq!(report.subjects.len(), 3);
        assert_relative_eq!(report.scale_factor.unwrap(), 3.0, epsilon = 1e-9);

        let sets: Vec<_> = pairs.iter().map(|p| store.landmarks[&p.landmarks].clone()).collect();
        let expected = procrustes_align(&sets, &settings.procrustes).unwrap();
        for (i, subject) in report.subjects.iter().enumerate() {
            assert_eq!(subject.output, Path::new("out").join(format!("s{:02}_a.vtk", i + 1)));
            assert!(subject.determinant > 0.0);
            let written = store.written_mesh(&subject.output).unwrap();
            for (v, a) in written.vertices.iter().zip(expected.aligned[i].iter()) {
                assert_relative_eq!((v - a).norm(), 0.0, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let (store, pairs) = store_with_subjects(&[0.8, 1.4, 2.1, 3.3]);
        let sequential =
            align_meshes_to_center(&store, &pairs, &AlignmentSettings::default(), Path::new("out"))
                .unwrap();
        let parallel_settings = AlignmentSettings {
            parallel: true,
            ..AlignmentSettings::default()
        };
        let parallel =
            align_meshes_to_center(&store, &pairs, &parallel_settings, Path::new("out")).unwrap();
        assert_eq!(sequential, parallel);
    }

    #[test]
    fn test_missing_mesh_aborts_without_output() {
        let (mut store, pairs) = store_with_subjects(&[1.0, 2.0, 3.0]);
        store.meshes.remove(&pairs[1].mesh);
        let settings = AlignmentSettings {
            parallel: true,
            ..AlignmentSettings::default()
        };

        let err = align_meshes_to_center(&store, &pairs, &settings, Path::new("out")).unwrap_err();
        assert!(matches!(err.downcast_ref::<AlignError>(), Some(AlignError::NotFound(_))));
        assert!(format!("{:#}", err).contains("s02"));
        assert_eq!(store.written_count(), 0);
    }

    #[test]
    fn test_failed_write_leaves_no_output() {
        let (mut store, pairs) = store_with_subjects(&[1.0, 2.0, 3.0]);
        store.fail_writes_to = Some("s03".to_string());

        let err = align_meshes_to_center(&store, &pairs, &AlignmentSettings::default(), Path::new("out"))
            .unwrap_err();
        assert!(format!("{:#}", err).contains("s03_a.vtk"));
        assert_eq!(store.written_count(), 0);
    }

    #[test]
    fn test_outputs_replace_staged_files() {
        let (store, pairs) = store_with_subjects(&[1.0, 2.0]);
        align_meshes_to_center(&store, &pairs, &AlignmentSettings::default(), Path::new("out")).unwrap();
        assert_eq!(store.written_count(), 2);
        assert!(store.written_mesh(Path::new("out/s01_a.vtk")).is_some());
        assert!(store.written_mesh(Path::new("out/s01_a.vtk.part")).is_none());
    }

    #[test]
    fn test_landmark_count_mismatch_is_typed() {
        let (mut store, pairs) = store_with_subjects(&[1.0, 2.0, 3.0]);
        if let Some(set) = store.landmarks.get_mut(&pairs[2].landmarks) {
            set.push(Point3::new(5.0, 5.0, 5.0));
        }
        let err = align_meshes_to_center(&store, &pairs, &AlignmentSettings::default(), Path::new("out"))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AlignError>(),
            Some(AlignError::DimensionMismatch(_))
        ));
        assert_eq!(store.written_count(), 0);
    }

    #[test]
    fn test_process_batch_on_disk() {
        let root = tempfile::tempdir().unwrap();
        let landmark_dir = root.path().join("landmarks");
        let mesh_dir = root.path().join("meshes");
        let output_dir = root.path().join("aligned");
        fs::create_dir_all(&landmark_dir).unwrap();
        fs::create_dir_all(&mesh_dir).unwrap();

        let mut rng = seeded_rng(5);
        for (i, s) in [1.0, 1.5, 2.5].iter().enumerate() {
            let (rotation, translation) = random_pose(&mut rng);
            let landmarks = pose_points(&unit_tetrahedron(), *s, &rotation, &translation);
            let rows: String = landmarks
                .iter()
                .map(|p| format!("{},{},{}\n", p.x, p.y, p.z))
                .collect();
            fs::write(landmark_dir.join(format!("s{}.csv", i)), format!("x,y,z\n{}", rows)).unwrap();
            write_mesh(&mesh_dir.join(format!("s{}.vtk", i)), &tetra_mesh(landmarks)).unwrap();
        }

        let text = format!(
            "[general]\nlandmark_dir = {:?}\nmesh_dir = {:?}\noutput_dir = {:?}\n\n[settings]\nlandmark_extension = \"csv\"\n",
            landmark_dir.to_string_lossy(),
            mesh_dir.to_string_lossy(),
            output_dir.to_string_lossy()
        );
        let config = parse_config(&text).unwrap();
        let report = process_batch(&config).unwrap();

        assert_eq!(report.subjects.len(), 3);
        assert!(output_dir.join("mean_shape.csv").is_file());
        assert!(output_dir.join("alignment_report.json").is_file());
        let manifest = list_aligned_meshes(&output_dir, "_a", "vtk", "initial_template.vtk").unwrap();
        assert_eq!(manifest, vec!["s0_a.vtk", "s1_a.vtk", "s2_a.vtk"]);
    }
}
