pub mod input;
pub mod load_mesh;
pub mod output;
pub mod pairing;

use std::path::Path;

use nalgebra::Point3;

use crate::error::{AlignError, AlignResult};

/// On-disk mesh encodings the tool can read and write back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshFormat {
    /// Legacy VTK ASCII POLYDATA.
    Vtk,
    /// Wavefront OBJ.
    Obj,
}

impl MeshFormat {
    pub fn from_path(path: &Path) -> AlignResult<Self> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match extension.as_deref() {
            Some("vtk") => Ok(MeshFormat::Vtk),
            Some("obj") => Ok(MeshFormat::Obj),
            other => Err(AlignError::parse(
                path,
                format!("unsupported mesh extension {:?}", other.unwrap_or("")),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    Vertices,
    Lines,
    Polygons,
    TriangleStrips,
}

impl CellKind {
    pub fn from_vtk_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "VERTICES" => Some(CellKind::Vertices),
            "LINES" => Some(CellKind::Lines),
            "POLYGONS" => Some(CellKind::Polygons),
            "TRIANGLE_STRIPS" => Some(CellKind::TriangleStrips),
            _ => None,
        }
    }

    pub fn vtk_keyword(self) -> &'static str {
        match self {
            CellKind::Vertices => "VERTICES",
            CellKind::Lines => "LINES",
            CellKind::Polygons => "POLYGONS",
            CellKind::TriangleStrips => "TRIANGLE_STRIPS",
        }
    }
}

/// One block of connectivity; every cell lists zero-based vertex indices.
#[derive(Debug, Clone, PartialEq)]
pub struct CellBlock {
    pub kind: CellKind,
    pub cells: Vec<Vec<usize>>,
}

/// One array of a VTK `FIELD` block.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldArray {
    pub name: String,
    pub components: usize,
    pub tuples: usize,
    pub data_type: String,
    /// `components * tuples` values as they appear in the file.
    pub values: Vec<String>,
}

/// Dataset-level VTK field data (`FIELD <name> <n arrays>`).
#[derive(Debug, Clone, PartialEq)]
pub struct FieldBlock {
    pub name: String,
    pub arrays: Vec<FieldArray>,
}

/// Surface mesh: vertex coordinates plus topology and attributes that alignment
/// never touches.
#[derive(Debug, Clone, PartialEq)]
pub struct Mesh {
    pub format: MeshFormat,
    pub title: String,
    pub vertices: Vec<Point3<f64>>,
    /// Tokens following `x y z` on each OBJ `v` record (colour, weight), joined
    /// by single spaces. Empty for VTK meshes.
    pub vertex_extras: Vec<String>,
    /// Parsed connectivity. For VTK this is what gets written back; for OBJ the
    /// face records are carried verbatim in `attributes` and this is a view.
    pub cells: Vec<CellBlock>,
    /// VTK field data found outside the point and cell data sections.
    pub fields: Vec<FieldBlock>,
    /// Lines carried verbatim. For VTK, everything from the first `POINT_DATA`
    /// or `CELL_DATA` on. For OBJ, every record in file order; `v` records keep
    /// their place and get their coordinates from `vertices` when written.
    pub attributes: Vec<String>,
}

impl Mesh {
    /// Copy of the mesh with new vertex coordinates and identical everything else.
    pub fn with_vertices(&self, vertices: Vec<Point3<f64>>) -> Mesh {
        Mesh {
            format: self.format,
            title: self.title.clone(),
            vertices,
            vertex_extras: self.vertex_extras.clone(),
            cells: self.cells.clone(),
            fields: self.fields.clone(),
            attributes: self.attributes.clone(),
        }
    }

    pub fn cell_count(&self) -> usize {
        self.cells.iter().map(|block| block.cells.len()).sum()
    }

    pub(crate) fn check_cell_indices(&self, path: &Path) -> AlignResult<()> {
        let n = self.vertices.len();
        for block in &self.cells {
            for cell in &block.cells {
                if let Some(&bad) = cell.iter().find(|&&idx| idx >= n) {
                    return Err(AlignError::parse(
                        path,
                        format!(
                            "{} cell references vertex {} but the mesh has {} vertices",
                            block.kind.vtk_keyword(),
                            bad,
                            n
                        ),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// File access used by the alignment pipeline.
pub trait MeshStore: Sync {
    fn read_landmarks(&self, path: &Path) -> AlignResult<Vec<Point3<f64>>>;
    fn read_mesh(&self, path: &Path) -> AlignResult<Mesh>;
    fn write_mesh(&self, path: &Path, mesh: &Mesh) -> AlignResult<()>;
    /// Moves a finished file into place, replacing any existing one.
    fn rename(&self, from: &Path, to: &Path) -> AlignResult<()>;
    fn remove(&self, path: &Path) -> AlignResult<()>;
}

/// Reads and writes real files on disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileStore;

impl MeshStore for FileStore {
    fn read_landmarks(&self, path: &Path) -> AlignResult<Vec<Point3<f64>>> {
        input::read_landmarks(path)
    }

    fn read_mesh(&self, path: &Path) -> AlignResult<Mesh> {
        load_mesh::read_mesh(path)
    }

    fn write_mesh(&self, path: &Path, mesh: &Mesh) -> AlignResult<()> {
        output::write_mesh(path, mesh)
    }

    fn rename(&self, from: &Path, to: &Path) -> AlignResult<()> {
        std::fs::rename(from, to).map_err(|e| AlignError::from_io(to, e))
    }

    fn remove(&self, path: &Path) -> AlignResult<()> {
        std::fs::remove_file(path).map_err(|e| AlignError::from_io(path, e))
    }
}
