use std::fs;
use std::path::Path;

use csv::{ReaderBuilder, Trim};
use nalgebra::Point3;
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::debug;

use crate::error::{AlignError, AlignResult};

/// Reads a landmark file into points in file order.
///
/// `.mps` files are MITK point sets (XML); `.csv` and `.txt` files hold one
/// `x y z` row per landmark, comma or space separated respectively.
pub fn read_landmarks(path: &Path) -> AlignResult<Vec<Point3<f64>>> {
    let content = fs::read_to_string(path).map_err(|e| AlignError::from_io(path, e))?;
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    let points = match extension.as_deref() {
        Some("mps") => parse_mps(&content, path)?,
        Some("csv") => parse_delimited(&content, b',', path)?,
        Some("txt") => parse_delimited(&content, b' ', path)?,
        other => {
            return Err(AlignError::parse(
                path,
                format!("unsupported landmark extension {:?}", other.unwrap_or("")),
            ))
        }
    };
    debug!("Read {} landmarks from {:?}", points.len(), path);
    Ok(points)
}

fn parse_coordinate(text: &str, path: &Path, what: &str) -> AlignResult<f64> {
    let value = text.trim().parse::<f64>().map_err(|e| {
        AlignError::parse(path, format!("invalid {} coordinate {:?}: {}", what, text, e))
    })?;
    if !value.is_finite() {
        return Err(AlignError::parse(
            path,
            format!("{} coordinate {:?} is not finite", what, text),
        ));
    }
    Ok(value)
}

/// Parses an MITK point-set document. Every `<point>` below the root element
/// yields one landmark from its `<x>`, `<y>` and `<z>` children.
pub fn parse_mps(content: &str, path: &Path) -> AlignResult<Vec<Point3<f64>>> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut points = Vec::new();
    let mut current: Option<[Option<f64>; 3]> = None;
    let mut axis: Option<usize> = None;
    let mut depth = 0usize;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                depth += 1;
                match e.local_name().as_ref() {
                    b"point" if depth > 1 => current = Some([None; 3]),
                    b"x" if current.is_some() => axis = Some(0),
                    b"y" if current.is_some() => axis = Some(1),
                    b"z" if current.is_some() => axis = Some(2),
                    _ => {}
                }
            }
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"point" && depth > 0 {
                    return Err(AlignError::parse(
                        path,
                        format!("point {} has no coordinates", points.len()),
                    ));
                }
            }
            Ok(Event::Text(t)) => {
                if let (Some(coords), Some(a)) = (current.as_mut(), axis) {
                    let text = String::from_utf8_lossy(&t);
                    let what = ["x", "y", "z"][a];
                    coords[a] = Some(parse_coordinate(&text, path, what)?);
                }
            }
            Ok(Event::End(e)) => {
                depth = depth.saturating_sub(1);
                match e.local_name().as_ref() {
                    b"point" => {
                        if let Some(coords) = current.take() {
                            points.push(finish_point(coords, points.len(), path)?);
                        }
                    }
                    b"x" | b"y" | b"z" => axis = None,
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(AlignError::parse(
                    path,
                    format!("XML error at byte {}: {}", reader.buffer_position(), e),
                ))
            }
            _ => {}
        }
    }

    if depth != 0 {
        return Err(AlignError::parse(path, "unexpected end of XML document"));
    }
    Ok(points)
}

fn finish_point(coords: [Option<f64>; 3], idx: usize, path: &Path) -> AlignResult<Point3<f64>> {
    match coords {
        [Some(x), Some(y), Some(z)] => Ok(Point3::new(x, y, z)),
        _ => {
            let missing: Vec<&str> = ["x", "y", "z"]
                .iter()
                .zip(coords.iter())
                .filter(|(_, c)| c.is_none())
                .map(|(name, _)| *name)
                .collect();
            Err(AlignError::parse(
                path,
                format!("point {} is missing coordinate(s) {}", idx, missing.join(", ")),
            ))
        }
    }
}

/// Parses delimited `x y z` rows. A leading header row is skipped when its
/// first field is not a number; extra columns are ignored.
pub fn parse_delimited(content: &str, delimiter: u8, path: &Path) -> AlignResult<Vec<Point3<f64>>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .delimiter(delimiter)
        .from_reader(content.as_bytes());

    let mut points = Vec::new();
    for (row, result) in rdr.records().enumerate() {
        let record = result.map_err(|e| AlignError::parse(path, format!("row {}: {}", row + 1, e)))?;
        let fields: Vec<&str> = record.iter().filter(|f| !f.is_empty()).collect();
        if fields.is_empty() {
            continue;
        }
        if row == 0 && fields[0].parse::<f64>().is_err() {
            continue;
        }
        if fields.len() < 3 {
            return Err(AlignError::parse(
                path,
                format!("row {} has {} field(s), expected x, y and z", row + 1, fields.len()),
            ));
        }
        let x = parse_coordinate(fields[0], path, "x")?;
        let y = parse_coordinate(fields[1], path, "y")?;
        let z = parse_coordinate(fields[2], path, "z")?;
        points.push(Point3::new(x, y, z));
    }
    Ok(points)
}
