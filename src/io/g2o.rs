use super::*;
use crate::core::variable::Variable;
use crate::factors::Factor;
use memmap2::Mmap;
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;
use tracing::warn;

/// Files with more lines than this are parsed in parallel
const PARALLEL_THRESHOLD: usize = 5000;

/// High-performance G2O file loader
pub struct G2oLoader;

impl G2oLoader {
    /// Load a g2o file through a read-only memory map.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<G2oGraph, IoError> {
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Self::parse_content("");
        }
        // SAFETY: the map is read-only and dropped before this function returns.
        let mmap = unsafe { Mmap::map(&file)? };
        let content = std::str::from_utf8(&mmap).map_err(|e| IoError::Parse {
            line: 0,
            message: format!("Invalid UTF-8: {e}"),
        })?;

        Self::parse_content(content)
    }

    /// Write `values` as vertices and every SE2/SE3 between factor of `graph` as an edge.
    ///
    /// Keys are written as their raw integer ID. Other factor types (priors) have no g2o edge
    /// record and are left out.
    pub fn write<P: AsRef<Path>>(
        graph: &FactorGraph,
        values: &Values,
        path: P,
    ) -> Result<(), IoError> {
        let mut writer = BufWriter::new(File::create(path)?);

        for (key, variable) in values.iter() {
            match variable {
                Variable::SE2(pose) => writeln!(
                    writer,
                    "VERTEX_SE2 {} {} {} {}",
                    key.0,
                    pose.x(),
                    pose.y(),
                    pose.angle()
                )?,
                Variable::SE3(pose) => {
                    let t = pose.translation();
                    let q = pose.rotation_quaternion();
                    writeln!(
                        writer,
                        "VERTEX_SE3:QUAT {} {} {} {} {} {} {} {}",
                        key.0, t.x, t.y, t.z, q.i, q.j, q.k, q.w
                    )?
                }
            }
        }

        for factor in graph.factors() {
            let any = factor.as_any();
            if let Some(edge) = any.downcast_ref::<BetweenFactor<SE2>>() {
                let z = edge.measured();
                write!(
                    writer,
                    "EDGE_SE2 {} {} {} {} {}",
                    edge.key_i().0,
                    edge.key_j().0,
                    z.x(),
                    z.y(),
                    z.angle()
                )?;
                write_upper_triangle(&mut writer, &edge.noise_model().information())?;
            } else if let Some(edge) = any.downcast_ref::<BetweenFactor<SE3>>() {
                let z = edge.measured();
                let t = z.translation();
                let q = z.rotation_quaternion();
                write!(
                    writer,
                    "EDGE_SE3:QUAT {} {} {} {} {} {} {} {} {}",
                    edge.key_i().0,
                    edge.key_j().0,
                    t.x,
                    t.y,
                    t.z,
                    q.i,
                    q.j,
                    q.k,
                    q.w
                )?;
                write_upper_triangle(&mut writer, &edge.noise_model().information())?;
            }
        }

        writer.flush()?;
        Ok(())
    }

    /// Parse G2O content, in parallel for large files
    pub fn parse_content(content: &str) -> Result<G2oGraph, IoError> {
        let lines: Vec<&str> = content.lines().collect();

        let parsed: Vec<Option<ParsedItem>> = if lines.len() > PARALLEL_THRESHOLD {
            lines
                .par_iter()
                .enumerate()
                .map(|(line_num, line)| Self::parse_line(line, line_num + 1))
                .collect::<Result<_, _>>()?
        } else {
            lines
                .iter()
                .enumerate()
                .map(|(line_num, line)| Self::parse_line(line, line_num + 1))
                .collect::<Result<_, _>>()?
        };

        // Sequential insertion keeps edge order and duplicate detection deterministic
        let mut graph = G2oGraph::new();
        let mut skipped: BTreeMap<&str, usize> = BTreeMap::new();
        for item in parsed.into_iter().flatten() {
            match item {
                ParsedItem::VertexSE2(vertex) => {
                    let id = vertex.id;
                    if graph.vertices_se2.insert(id, vertex).is_some() {
                        return Err(IoError::DuplicateVertex { id });
                    }
                }
                ParsedItem::VertexSE3(vertex) => {
                    let id = vertex.id;
                    if graph.vertices_se3.insert(id, vertex).is_some() {
                        return Err(IoError::DuplicateVertex { id });
                    }
                }
                ParsedItem::EdgeSE2(edge) => graph.edges_se2.push(edge),
                ParsedItem::EdgeSE3(edge) => graph.edges_se3.push(*edge),
                ParsedItem::Unknown(tag) => *skipped.entry(tag).or_default() += 1,
            }
        }

        for (tag, count) in skipped {
            warn!("Skipped {} unsupported g2o record(s) of type {}", count, tag);
        }
        Ok(graph)
    }

    /// Parse a single line; comments and blank lines yield `None`.
    fn parse_line(line: &str, line_num: usize) -> Result<Option<ParsedItem<'_>>, IoError> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        let item = match parts[0] {
            "VERTEX_SE2" => ParsedItem::VertexSE2(Self::parse_vertex_se2(&parts, line_num)?),
            "VERTEX_SE3:QUAT" => ParsedItem::VertexSE3(Self::parse_vertex_se3(&parts, line_num)?),
            "EDGE_SE2" => ParsedItem::EdgeSE2(Self::parse_edge_se2(&parts, line_num)?),
            "EDGE_SE3:QUAT" => {
                ParsedItem::EdgeSE3(Box::new(Self::parse_edge_se3(&parts, line_num)?))
            }
            tag => ParsedItem::Unknown(tag),
        };
        Ok(Some(item))
    }

    /// Parse VERTEX_SE2 line: `id x y theta`
    pub fn parse_vertex_se2(parts: &[&str], line_num: usize) -> Result<VertexSE2, IoError> {
        check_fields(parts, 5, line_num)?;
        let id = parse_field(parts[1], line_num)?;
        let [x, y, theta] = parse_floats(&parts[2..5], line_num)?;
        Ok(VertexSE2::new(id, x, y, theta))
    }

    /// Parse VERTEX_SE3:QUAT line: `id x y z qx qy qz qw`
    pub fn parse_vertex_se3(parts: &[&str], line_num: usize) -> Result<VertexSE3, IoError> {
        check_fields(parts, 9, line_num)?;
        let id = parse_field(parts[1], line_num)?;
        let [x, y, z, qx, qy, qz, qw] = parse_floats(&parts[2..9], line_num)?;
        check_quaternion(qx, qy, qz, qw, line_num)?;
        Ok(VertexSE3::new(
            id,
            Vector3::new(x, y, z),
            Quaternion::new(qw, qx, qy, qz),
        ))
    }

    /// Parse EDGE_SE2 line: `from to dx dy dtheta` and the upper triangle
    /// `i11 i12 i13 i22 i23 i33`
    fn parse_edge_se2(parts: &[&str], line_num: usize) -> Result<EdgeSE2, IoError> {
        check_fields(parts, 12, line_num)?;
        let from = parse_field(parts[1], line_num)?;
        let to = parse_field(parts[2], line_num)?;
        let [dx, dy, dtheta] = parse_floats(&parts[3..6], line_num)?;
        let upper: [f64; 6] = parse_floats(&parts[6..12], line_num)?;

        Ok(EdgeSE2 {
            from,
            to,
            measurement: SE2::from_xy_angle(dx, dy, dtheta),
            information: Matrix3::from_fn(|r, c| upper[upper_index::<3>(r, c)]),
        })
    }

    /// Parse EDGE_SE3:QUAT line: `from to tx ty tz qx qy qz qw` and the 21 upper-triangle
    /// information entries in row order
    fn parse_edge_se3(parts: &[&str], line_num: usize) -> Result<EdgeSE3, IoError> {
        check_fields(parts, 31, line_num)?;
        let from = parse_field(parts[1], line_num)?;
        let to = parse_field(parts[2], line_num)?;
        let [tx, ty, tz, qx, qy, qz, qw] = parse_floats(&parts[3..10], line_num)?;
        check_quaternion(qx, qy, qz, qw, line_num)?;
        let upper: [f64; 21] = parse_floats(&parts[10..31], line_num)?;

        Ok(EdgeSE3 {
            from,
            to,
            measurement: SE3::from_translation_quaternion(
                Vector3::new(tx, ty, tz),
                Quaternion::new(qw, qx, qy, qz),
            ),
            information: Matrix6::from_fn(|r, c| upper[upper_index::<6>(r, c)]),
        })
    }
}

/// Enum for parsed items
#[derive(Debug)]
enum ParsedItem<'a> {
    VertexSE2(VertexSE2),
    VertexSE3(VertexSE3),
    EdgeSE2(EdgeSE2),
    EdgeSE3(Box<EdgeSE3>),
    Unknown(&'a str),
}

fn check_fields(parts: &[&str], required: usize, line_num: usize) -> Result<(), IoError> {
    if parts.len() < required {
        return Err(IoError::MissingFields { line: line_num });
    }
    Ok(())
}

fn parse_field<T: FromStr>(value: &str, line_num: usize) -> Result<T, IoError> {
    value.parse::<T>().map_err(|_| IoError::InvalidNumber {
        line: line_num,
        value: value.to_string(),
    })
}

fn parse_floats<const N: usize>(parts: &[&str], line_num: usize) -> Result<[f64; N], IoError> {
    let mut out = [0.0; N];
    for (slot, value) in out.iter_mut().zip(parts) {
        *slot = parse_field(value, line_num)?;
    }
    Ok(out)
}

fn check_quaternion(qx: f64, qy: f64, qz: f64, qw: f64, line_num: usize) -> Result<(), IoError> {
    let norm = (qx * qx + qy * qy + qz * qz + qw * qw).sqrt();
    if !(norm > 1e-9) || !norm.is_finite() {
        return Err(IoError::Parse {
            line: line_num,
            message: format!("quaternion ({qx}, {qy}, {qz}, {qw}) cannot be normalized"),
        });
    }
    Ok(())
}

/// Position of `(r, c)` in a row-major upper triangle of an `N x N` symmetric matrix
fn upper_index<const N: usize>(r: usize, c: usize) -> usize {
    let (r, c) = if r <= c { (r, c) } else { (c, r) };
    r * N - r * (r + 1) / 2 + c
}

fn write_upper_triangle<W: Write>(
    writer: &mut W,
    information: &DMatrix<f64>,
) -> std::io::Result<()> {
    let n = information.nrows();
    for r in 0..n {
        for c in r..n {
            write!(writer, " {}", information[(r, c)])?;
        }
    }
    writeln!(writer)
}
