use std::fs;
use std::iter::Peekable;
use std::path::Path;
use std::str::{FromStr, Lines};

use nalgebra::Point3;
use tracing::debug;

use crate::error::{AlignError, AlignResult};
use crate::io::{CellBlock, CellKind, FieldArray, FieldBlock, Mesh, MeshFormat};

/// Reads a mesh file, choosing the parser from its extension.
pub fn read_mesh(path: &Path) -> AlignResult<Mesh> {
    let format = MeshFormat::from_path(path)?;
    let content = fs::read_to_string(path).map_err(|e| AlignError::from_io(path, e))?;
    let mesh = match format {
        MeshFormat::Vtk => parse_vtk(&content, path)?,
        MeshFormat::Obj => parse_obj(&content, path)?,
    };
    debug!(
        "Read mesh {:?}: {} vertices, {} cells",
        path,
        mesh.vertices.len(),
        mesh.cell_count()
    );
    Ok(mesh)
}

/// Pulls whitespace separated values from the following lines until `count`
/// values are collected. Values may wrap over any number of lines.
fn take_values<T: FromStr>(
    lines: &mut Peekable<Lines<'_>>,
    count: usize,
    path: &Path,
    section: &str,
) -> AlignResult<Vec<T>> {
    let mut values = Vec::with_capacity(count);
    while values.len() < count {
        let line = lines.next().ok_or_else(|| {
            AlignError::parse(
                path,
                format!(
                    "{} section ended after {} of {} values",
                    section,
                    values.len(),
                    count
                ),
            )
        })?;
        for token in line.split_whitespace() {
            if values.len() == count {
                return Err(AlignError::parse(
                    path,
                    format!("{} section has more than {} values", section, count),
                ));
            }
            let value = token.parse::<T>().map_err(|_| {
                AlignError::parse(path, format!("invalid value {:?} in {} section", token, section))
            })?;
            values.push(value);
        }
    }
    Ok(values)
}

fn header_count(token: Option<&str>, path: &Path, section: &str) -> AlignResult<usize> {
    token
        .and_then(|t| t.parse::<usize>().ok())
        .ok_or_else(|| AlignError::parse(path, format!("{} header is missing its count", section)))
}

/// Splits a legacy `n k i0 .. ik-1 ...` cell list into cells.
fn split_legacy_cells(raw: &[usize], n_cells: usize, path: &Path, section: &str) -> AlignResult<Vec<Vec<usize>>> {
    let mut cells = Vec::with_capacity(n_cells);
    let mut pos = 0;
    while pos < raw.len() {
        let k = raw[pos];
        let end = pos + 1 + k;
        if end > raw.len() {
            return Err(AlignError::parse(
                path,
                format!("{} cell {} runs past the end of its section", section, cells.len()),
            ));
        }
        cells.push(raw[pos + 1..end].to_vec());
        pos = end;
    }
    if cells.len() != n_cells {
        return Err(AlignError::parse(
            path,
            format!("{} header announces {} cells, found {}", section, n_cells, cells.len()),
        ));
    }
    Ok(cells)
}

/// Reads the `OFFSETS` / `CONNECTIVITY` cell layout of VTK 5.x files.
fn read_offset_cells(
    lines: &mut Peekable<Lines<'_>>,
    n_offsets: usize,
    n_connectivity: usize,
    path: &Path,
    section: &str,
) -> AlignResult<Vec<Vec<usize>>> {
    lines.next();
    let offsets: Vec<usize> = take_values(lines, n_offsets, path, section)?;
    let keyword = lines.next().map(str::trim).unwrap_or_default();
    if !keyword.to_ascii_uppercase().starts_with("CONNECTIVITY") {
        return Err(AlignError::parse(
            path,
            format!("{} section is missing its CONNECTIVITY block", section),
        ));
    }
    let connectivity: Vec<usize> = take_values(lines, n_connectivity, path, section)?;

    offsets
        .windows(2)
        .map(|w| {
            if w[0] > w[1] || w[1] > connectivity.len() {
                Err(AlignError::parse(path, format!("{} offsets are not monotonic", section)))
            } else {
                Ok(connectivity[w[0]..w[1]].to_vec())
            }
        })
        .collect()
}

/// Drops a `METADATA` block; it ends at the first blank line.
fn skip_metadata(lines: &mut Peekable<Lines<'_>>) {
    for meta in lines.by_ref() {
        if meta.trim().is_empty() {
            break;
        }
    }
}

fn next_non_empty<'a>(lines: &mut Peekable<Lines<'a>>) -> Option<&'a str> {
    lines.by_ref().map(str::trim).find(|l| !l.is_empty())
}

/// Reads the arrays of a `FIELD <name> <n>` block whose header was already consumed.
fn read_field_block(
    lines: &mut Peekable<Lines<'_>>,
    name: &str,
    n_arrays: usize,
    path: &Path,
) -> AlignResult<FieldBlock> {
    let mut arrays = Vec::with_capacity(n_arrays);
    for i in 0..n_arrays {
        let header = next_non_empty(lines).ok_or_else(|| {
            AlignError::parse(path, format!("FIELD {} ended after {} of {} arrays", name, i, n_arrays))
        })?;
        let parts: Vec<&str> = header.split_whitespace().collect();
        let (components, tuples) = match parts.as_slice() {
            [_, c, t, _] => (c.parse::<usize>().ok(), t.parse::<usize>().ok()),
            _ => (None, None),
        };
        let (Some(components), Some(tuples)) = (components, tuples) else {
            return Err(AlignError::parse(
                path,
                format!("FIELD {} array header {:?} is not 'name components tuples type'", name, header),
            ));
        };
        let values: Vec<String> = take_values(lines, components * tuples, path, "FIELD")?;
        arrays.push(FieldArray {
            name: parts[0].to_string(),
            components,
            tuples,
            data_type: parts[3].to_string(),
            values,
        });
        if lines
            .peek()
            .map(|l| l.trim_start().to_ascii_uppercase().starts_with("METADATA"))
            .unwrap_or(false)
        {
            skip_metadata(lines);
        }
    }
    Ok(FieldBlock {
        name: name.to_string(),
        arrays,
    })
}

/// Parses a legacy VTK ASCII POLYDATA file.
///
/// Geometry, connectivity and dataset-level `FIELD` blocks are decoded;
/// everything from the first `POINT_DATA` or `CELL_DATA` section onwards is kept
/// verbatim so it can be written back unchanged.
pub fn parse_vtk(content: &str, path: &Path) -> AlignResult<Mesh> {
    let mut lines = content.lines().peekable();

    let version = lines.next().unwrap_or_default();
    if !version.trim_start().starts_with("# vtk DataFile") {
        return Err(AlignError::parse(path, "missing '# vtk DataFile' header"));
    }
    let title = lines.next().unwrap_or_default().trim().to_string();
    let encoding = lines.next().unwrap_or_default().trim();
    if !encoding.eq_ignore_ascii_case("ASCII") {
        return Err(AlignError::parse(
            path,
            format!("only ASCII VTK files are supported, found {:?}", encoding),
        ));
    }

    let dataset = loop {
        match lines.next() {
            Some(line) if line.trim().is_empty() => continue,
            Some(line) => break line.trim().to_ascii_uppercase(),
            None => return Err(AlignError::parse(path, "missing DATASET line")),
        }
    };
    if dataset.split_whitespace().collect::<Vec<_>>() != ["DATASET", "POLYDATA"] {
        return Err(AlignError::parse(
            path,
            format!("expected DATASET POLYDATA, found {:?}", dataset),
        ));
    }

    let mut vertices: Option<Vec<Point3<f64>>> = None;
    let mut cells: Vec<CellBlock> = Vec::new();
    let mut fields: Vec<FieldBlock> = Vec::new();
    let mut attributes: Vec<String> = Vec::new();

    while let Some(line) = lines.next() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut parts = trimmed.split_whitespace();
        let keyword = parts.next().unwrap_or_default().to_ascii_uppercase();

        if keyword == "POINTS" {
            let n = header_count(parts.next(), path, "POINTS")?;
            let coords: Vec<f64> = take_values(&mut lines, 3 * n, path, "POINTS")?;
            vertices = Some(
                coords
                    .chunks_exact(3)
                    .map(|c| Point3::new(c[0], c[1], c[2]))
                    .collect(),
            );
        } else if keyword == "METADATA" {
            skip_metadata(&mut lines);
        } else if keyword == "FIELD" {
            let name = parts.next().unwrap_or_default().to_string();
            let n_arrays = header_count(parts.next(), path, "FIELD")?;
            fields.push(read_field_block(&mut lines, &name, n_arrays, path)?);
        } else if let Some(kind) = CellKind::from_vtk_keyword(&keyword) {
            let section = kind.vtk_keyword();
            let first = header_count(parts.next(), path, section)?;
            let second = header_count(parts.next(), path, section)?;
            let offsets_layout = lines
                .peek()
                .map(|l| l.trim_start().to_ascii_uppercase().starts_with("OFFSETS"))
                .unwrap_or(false);
            let block_cells = if offsets_layout {
                read_offset_cells(&mut lines, first, second, path, section)?
            } else {
                let raw: Vec<usize> = take_values(&mut lines, second, path, section)?;
                split_legacy_cells(&raw, first, path, section)?
            };
            cells.push(CellBlock {
                kind,
                cells: block_cells,
            });
        } else if keyword == "POINT_DATA" || keyword == "CELL_DATA" {
            attributes.push(line.to_string());
            attributes.extend(lines.by_ref().map(str::to_string));
            break;
        } else {
            return Err(AlignError::parse(
                path,
                format!("unsupported POLYDATA section {:?}", keyword),
            ));
        }
    }

    let vertices = vertices.ok_or_else(|| AlignError::parse(path, "no POINTS section"))?;
    let mesh = Mesh {
        format: MeshFormat::Vtk,
        title,
        vertices,
        vertex_extras: Vec::new(),
        cells,
        fields,
        attributes,
    };
    mesh.check_cell_indices(path)?;
    Ok(mesh)
}

/// Resolves a one-based (or negative, relative) OBJ index to zero-based.
fn obj_index(token: &str, n_vertices: usize, path: &Path, line_no: usize) -> AlignResult<usize> {
    let raw = token.split('/').next().unwrap_or_default();
    let idx: i64 = raw.parse().map_err(|_| {
        AlignError::parse(path, format!("line {}: invalid vertex index {:?}", line_no, token))
    })?;
    let resolved = if idx > 0 {
        idx - 1
    } else {
        n_vertices as i64 + idx
    };
    if idx == 0 || resolved < 0 {
        return Err(AlignError::parse(
            path,
            format!("line {}: vertex index {} is out of range", line_no, idx),
        ));
    }
    Ok(resolved as usize)
}

/// Parses a Wavefront OBJ file. Every record is kept in order; `v` records also
/// become vertices and `f`, `l` and `p` records are decoded into cells.
pub fn parse_obj(content: &str, path: &Path) -> AlignResult<Mesh> {
    let mut vertices = Vec::new();
    let mut vertex_extras = Vec::new();
    let mut cells: Vec<CellBlock> = Vec::new();
    let mut attributes = Vec::new();

    for (i, line) in content.lines().enumerate() {
        let line_no = i + 1;
        let mut parts = line.split_whitespace();
        let kind = match parts.next() {
            Some("v") => {
                let coords: Vec<f64> = parts
                    .by_ref()
                    .take(3)
                    .map(|t| t.parse::<f64>())
                    .collect::<Result<_, _>>()
                    .map_err(|e| AlignError::parse(path, format!("line {}: {}", line_no, e)))?;
                if coords.len() != 3 {
                    return Err(AlignError::parse(
                        path,
                        format!("line {}: vertex has fewer than 3 coordinates", line_no),
                    ));
                }
                vertices.push(Point3::new(coords[0], coords[1], coords[2]));
                vertex_extras.push(parts.by_ref().collect::<Vec<_>>().join(" "));
                None
            }
            Some("f") => Some(CellKind::Polygons),
            Some("l") => Some(CellKind::Lines),
            Some("p") => Some(CellKind::Vertices),
            _ => None,
        };

        if let Some(kind) = kind {
            let cell = parts
                .map(|t| obj_index(t, vertices.len(), path, line_no))
                .collect::<AlignResult<Vec<_>>>()?;
            match cells.iter_mut().find(|b| b.kind == kind) {
                Some(block) => block.cells.push(cell),
                None => cells.push(CellBlock {
                    kind,
                    cells: vec![cell],
                }),
            }
        }
        attributes.push(line.to_string());
    }

    let mesh = Mesh {
        format: MeshFormat::Obj,
        title: String::new(),
        vertices,
        vertex_extras,
        cells,
        fields: Vec::new(),
        attributes,
    };
    mesh.check_cell_indices(path)?;
    Ok(mesh)
}
