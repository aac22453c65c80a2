use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use csv::Writer;
use nalgebra::Point3;
use serde::Serialize;

use crate::error::{AlignError, AlignResult};
use crate::io::{Mesh, MeshFormat};

/// Writes a mesh in the format it was read from.
pub fn write_mesh(path: &Path, mesh: &Mesh) -> AlignResult<()> {
    let file = File::create(path).map_err(|e| AlignError::from_io(path, e))?;
    let mut writer = BufWriter::new(file);
    let written = match mesh.format {
        MeshFormat::Vtk => write_vtk(&mut writer, mesh),
        MeshFormat::Obj => write_obj(&mut writer, mesh),
    };
    written
        .and_then(|_| writer.flush())
        .map_err(|e| AlignError::from_io(path, e))
}

/// Legacy VTK ASCII POLYDATA. Coordinates are written as doubles at full precision.
pub fn write_vtk<W: Write>(writer: &mut W, mesh: &Mesh) -> std::io::Result<()> {
    let title = if mesh.title.is_empty() {
        "vtk output"
    } else {
        mesh.title.as_str()
    };
    writeln!(writer, "# vtk DataFile Version 4.2")?;
    writeln!(writer, "{}", title)?;
    writeln!(writer, "ASCII")?;
    writeln!(writer, "DATASET POLYDATA")?;

    for field in &mesh.fields {
        writeln!(writer, "FIELD {} {}", field.name, field.arrays.len())?;
        for array in &field.arrays {
            writeln!(
                writer,
                "{} {} {} {}",
                array.name, array.components, array.tuples, array.data_type
            )?;
            for chunk in array.values.chunks(9) {
                writeln!(writer, "{}", chunk.join(" "))?;
            }
        }
    }

    writeln!(writer, "POINTS {} double", mesh.vertices.len())?;
    for p in &mesh.vertices {
        writeln!(writer, "{} {} {}", p.x, p.y, p.z)?;
    }

    for block in mesh.cells.iter().filter(|b| !b.cells.is_empty()) {
        let size: usize = block.cells.iter().map(|c| c.len() + 1).sum();
        writeln!(writer, "{} {} {}", block.kind.vtk_keyword(), block.cells.len(), size)?;
        for cell in &block.cells {
            write!(writer, "{}", cell.len())?;
            for idx in cell {
                write!(writer, " {}", idx)?;
            }
            writeln!(writer)?;
        }
    }

    for line in &mesh.attributes {
        writeln!(writer, "{}", line)?;
    }
    Ok(())
}

/// Wavefront OBJ. Records are written in their original order; each `v` record
/// takes the next vertex position, so relative face indices keep their meaning.
pub fn write_obj<W: Write>(writer: &mut W, mesh: &Mesh) -> std::io::Result<()> {
    if !mesh.title.is_empty() {
        writeln!(writer, "# {}", mesh.title)?;
    }
    let mut next = 0;
    for line in &mesh.attributes {
        if line.split_whitespace().next() == Some("v") {
            if next >= mesh.vertices.len() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("mesh has more v records than its {} vertices", mesh.vertices.len()),
                ));
            }
            write_obj_vertex(writer, mesh, next)?;
            next += 1;
        } else {
            writeln!(writer, "{}", line)?;
        }
    }
    for idx in next..mesh.vertices.len() {
        write_obj_vertex(writer, mesh, idx)?;
    }
    Ok(())
}

fn write_obj_vertex<W: Write>(writer: &mut W, mesh: &Mesh, idx: usize) -> std::io::Result<()> {
    let p = &mesh.vertices[idx];
    match mesh.vertex_extras.get(idx).filter(|e| !e.is_empty()) {
        Some(extra) => writeln!(writer, "v {} {} {} {}", p.x, p.y, p.z, extra),
        None => writeln!(writer, "v {} {} {}", p.x, p.y, p.z),
    }
}

/// Writes the mean configuration, one landmark per row.
pub fn write_mean_shape_csv(path: &Path, mean: &[Point3<f64>]) -> AlignResult<()> {
    let to_err = |e: csv::Error| match e.into_kind() {
        csv::ErrorKind::Io(io) => AlignError::from_io(path, io),
        other => AlignError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::Other, format!("{:?}", other)),
        },
    };

    let mut wtr = Writer::from_path(path).map_err(to_err)?;
    wtr.write_record(["landmark", "x", "y", "z"]).map_err(to_err)?;
    for (i, p) in mean.iter().enumerate() {
        wtr.write_record(&[
            i.to_string(),
            p.x.to_string(),
            p.y.to_string(),
            p.z.to_string(),
        ])
        .map_err(to_err)?;
    }
    wtr.flush().map_err(|e| AlignError::from_io(path, e))?;
    Ok(())
}

/// Serializes any report as pretty JSON.
pub fn write_json_report<T: Serialize>(path: &Path, report: &T) -> AlignResult<()> {
    let file = File::create(path).map_err(|e| AlignError::from_io(path, e))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, report).map_err(|e| AlignError::Io {
        path: path.to_path_buf(),
        source: e.into(),
    })?;
    writer.flush().map_err(|e| AlignError::from_io(path, e))
}
