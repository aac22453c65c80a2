use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{AlignError, AlignResult};

/// One subject: its landmark annotation and its full-resolution mesh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectPair {
    pub id: String,
    pub landmarks: PathBuf,
    pub mesh: PathBuf,
}

#[derive(Debug, Clone)]
pub struct PairingOptions<'a> {
    pub landmark_extension: &'a str,
    pub mesh_extension: &'a str,
    /// Marker appended to aligned mesh names; inputs already carrying it are skipped.
    pub suffix: &'a str,
    /// Reserved template file that is never treated as a subject.
    pub template_name: &'a str,
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(extension.trim_start_matches('.')))
        .unwrap_or(false)
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Regular files in `dir` with the given extension, sorted by name.
pub fn list_files_with_extension(dir: &Path, extension: &str) -> AlignResult<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|e| AlignError::from_io(dir, e))?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| AlignError::from_io(dir, e))?.path();
        if path.is_file() && has_extension(&path, extension) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Builds the ordered subject list by pairing sorted landmark and mesh files
/// position by position. Fails before any work is done when the counts differ.
pub fn discover_subject_pairs(
    landmark_dir: &Path,
    mesh_dir: &Path,
    options: &PairingOptions<'_>,
) -> AlignResult<Vec<SubjectPair>> {
    let mesh_files: Vec<PathBuf> = list_files_with_extension(mesh_dir, options.mesh_extension)?
        .into_iter()
        .filter(|path| {
            let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
            let is_template = name == options.template_name;
            let is_aligned = !options.suffix.is_empty() && file_stem(path).ends_with(options.suffix);
            if is_template || is_aligned {
                debug!("Ignoring {:?}", path);
            }
            !(is_template || is_aligned)
        })
        .collect();
    let landmark_files = list_files_with_extension(landmark_dir, options.landmark_extension)?;

    info!("Number of mesh files: {}", mesh_files.len());
    info!("Number of landmark files: {}", landmark_files.len());

    if mesh_files.len() != landmark_files.len() {
        return Err(AlignError::DimensionMismatch(format!(
            "{} mesh files in {:?} but {} landmark files in {:?}",
            mesh_files.len(),
            mesh_dir,
            landmark_files.len(),
            landmark_dir
        )));
    }

    Ok(mesh_files
        .into_iter()
        .zip(landmark_files)
        .map(|(mesh, landmarks)| SubjectPair {
            id: file_stem(&mesh),
            landmarks,
            mesh,
        })
        .collect())
}

/// Output file name for an input mesh: `<stem><suffix>.<extension>`.
pub fn aligned_file_name(mesh: &Path, suffix: &str) -> String {
    let stem = file_stem(mesh);
    match mesh.extension() {
        Some(ext) => format!("{}{}.{}", stem, suffix, ext.to_string_lossy()),
        None => format!("{}{}", stem, suffix),
    }
}

/// Sorted names of the aligned meshes in `dir`, skipping the template. This is
/// the list the downstream data-set manifest is built from.
pub fn list_aligned_meshes(
    dir: &Path,
    suffix: &str,
    extension: &str,
    template_name: &str,
) -> AlignResult<Vec<String>> {
    Ok(list_files_with_extension(dir, extension)?
        .iter()
        .filter(|path| file_stem(path).ends_with(suffix))
        .filter_map(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()))
        .filter(|name| name != template_name)
        .collect())
}
