//! Extended-XYZ reader for ellipsoidal frames.
//!
//! Each frame is a particle count, a comment line of `key=value` pairs and one row per
//! particle. The `Properties` key lays out the columns as `name:type:count` triples, e.g.
//!
//! ```text
//! Properties=species:S:1:pos:R:3:c_q:R:4:c_diameter[1]:R:1:c_diameter[2]:R:1:c_diameter[3]:R:1
//! ```
//!
//! Recognized columns are `species` (symbol) or `Z` (atomic number), `pos`, the orientation
//! `c_q` and the semi-axes, either as `c_diameter:R:3` or as the three
//! `c_diameter[k]` scalar columns. Anything else is skipped.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use nalgebra::{DMatrix, Point3};
use regex::Regex;

use crate::core::chemistry;
use crate::core::domain::{Configuration, ORIENTATION_KEY, SEMI_AXES_KEY};

const DEFAULT_PROPERTIES: &str = "species:S:1:pos:R:3";

#[derive(Debug, Clone, PartialEq)]
struct Column {
    name: String,
    kind: char,
    width: usize,
}

/// Compiled header patterns; build once and reuse across files.
pub struct ExtXyzReader {
    pair: Regex,
    semi_axis: Regex,
}

impl ExtXyzReader {
    pub fn new() -> Result<Self> {
        Ok(Self {
            pair: Regex::new(r#"([A-Za-z_][\w\-]*)=(?:"([^"]*)"|(\S+))"#)?,
            semi_axis: Regex::new(r"^c_diameter\[([123])\]$")?,
        })
    }

    /// `key=value` pairs of a comment line; quoted values may contain spaces.
    pub fn parse_comment(&self, line: &str) -> HashMap<String, String> {
        self.pair
            .captures_iter(line)
            .filter_map(|c| {
                let key = c.get(1)?.as_str().to_string();
                let value = c.get(2).or_else(|| c.get(3))?.as_str().to_string();
                Some((key, value))
            })
            .collect()
    }

    /// Parses every frame in `text`.
    pub fn parse_frames(&self, text: &str) -> Result<Vec<Configuration>> {
        let mut lines = text.lines().enumerate();
        let mut frames = Vec::new();

        while let Some((lineno, header)) = lines.next() {
            if header.trim().is_empty() {
                continue;
            }
            let frame = frames.len();
            let n: usize = header.trim().parse().with_context(|| {
                format!("line {}: expected particle count, found '{}'", lineno + 1, header.trim())
            })?;
            let (_, comment) = lines
                .next()
                .ok_or_else(|| anyhow!("frame {}: missing comment line", frame))?;

            let info = self.parse_comment(comment);
            let properties = info
                .get("Properties")
                .map(String::as_str)
                .unwrap_or(DEFAULT_PROPERTIES);
            let columns = parse_properties(properties).with_context(|| format!("frame {}", frame))?;

            // The count is untrusted; rows grow as they are read.
            let mut rows = Vec::new();
            for _ in 0..n {
                let row = lines
                    .next()
                    .ok_or_else(|| anyhow!("frame {}: expected {} particle rows", frame, n))?;
                rows.push(row);
            }

            let config = self
                .parse_block(&columns, &rows)
                .with_context(|| format!("Malformed extended-XYZ frame {}", frame))?;
            frames.push(config);
        }

        Ok(frames)
    }

    fn parse_block(&self, columns: &[Column], rows: &[(usize, &str)]) -> Result<Configuration> {
        let n = rows.len();
        let mut species = Vec::with_capacity(n);
        let mut positions = Vec::with_capacity(n);
        let mut orientations: Option<DMatrix<f64>> = None;
        let mut semi_axes: Option<DMatrix<f64>> = None;
        // Which c_diameter[k] cells were written by a scalar column.
        let mut axis_filled: Option<Vec<[bool; 3]>> = None;

        for (i, (lineno, line)) in rows.iter().enumerate() {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let expected: usize = columns.iter().map(|c| c.width).sum();
            if tokens.len() < expected {
                bail!(
                    "line {}: expected {} fields, found {}",
                    lineno + 1,
                    expected,
                    tokens.len()
                );
            }

            let mut cursor = 0;
            for column in columns {
                let fields = &tokens[cursor..cursor + column.width];
                cursor += column.width;

                match (column.name.as_str(), column.kind, column.width) {
                    ("species", 'S', 1) => {
                        let z = chemistry::atomic_number(fields[0])
                            .ok_or_else(|| anyhow!("line {}: unknown species '{}'", lineno + 1, fields[0]))?;
                        species.push(z);
                    }
                    ("Z", 'I', 1) => {
                        // Z only fills in when no symbol column was given.
                        if !columns.iter().any(|c| c.name == "species") {
                            species.push(parse_field::<u32>(fields[0], *lineno)?);
                        }
                    }
                    ("pos", 'R', 3) => {
                        let v = parse_reals::<3>(fields, *lineno)?;
                        positions.push(Point3::new(v[0], v[1], v[2]));
                    }
                    (name, 'R', 4) if name == ORIENTATION_KEY => {
                        let v = parse_reals::<4>(fields, *lineno)?;
                        let m = orientations.get_or_insert_with(|| DMatrix::zeros(n, 4));
                        for (k, x) in v.iter().enumerate() {
                            m[(i, k)] = *x;
                        }
                    }
                    (name, 'R', 3) if name == SEMI_AXES_KEY => {
                        let v = parse_reals::<3>(fields, *lineno)?;
                        if let Some(x) = v.iter().find(|x| !x.is_finite()) {
                            bail!("line {}: non-finite semi-axis {}", lineno + 1, x);
                        }
                        let m = semi_axes.get_or_insert_with(|| DMatrix::zeros(n, 3));
                        for (k, x) in v.iter().enumerate() {
                            m[(i, k)] = *x;
                        }
                    }
                    (name, 'R', 1) => {
                        if let Some(c) = self.semi_axis.captures(name) {
                            let k: usize = c[1].parse::<usize>()? - 1;
                            let x = parse_field::<f64>(fields[0], *lineno)?;
                            if !x.is_finite() {
                                bail!("line {}: non-finite semi-axis {} in '{}'", lineno + 1, x, name);
                            }
                            semi_axes.get_or_insert_with(|| DMatrix::zeros(n, 3))[(i, k)] = x;
                            axis_filled.get_or_insert_with(|| vec![[false; 3]; n])[i][k] = true;
                        }
                    }
                    _ => {}
                }
            }
        }

        if species.len() != n {
            bail!("frame has no 'species' or 'Z' column");
        }
        if positions.len() != n {
            bail!("frame has no 'pos:R:3' column");
        }
        if let Some(filled) = &axis_filled {
            if filled.iter().flatten().any(|set| !set) {
                bail!("'{}' needs all three columns c_diameter[1..3]", SEMI_AXES_KEY);
            }
        }

        Ok(Configuration {
            species,
            positions,
            orientations,
            semi_axes,
        })
    }
}

fn parse_properties(layout: &str) -> Result<Vec<Column>> {
    let parts: Vec<&str> = layout.split(':').collect();
    if parts.len() % 3 != 0 {
        bail!("Properties '{}' is not a list of name:type:count triples", layout);
    }
    parts
        .chunks_exact(3)
        .map(|t| {
            let kind = t[1]
                .chars()
                .next()
                .filter(|k| matches!(k, 'S' | 'R' | 'I' | 'L'))
                .ok_or_else(|| anyhow!("unknown column type '{}' for '{}'", t[1], t[0]))?;
            let width: usize = t[2]
                .parse()
                .with_context(|| format!("invalid column count '{}' for '{}'", t[2], t[0]))?;
            Ok(Column {
                name: t[0].to_string(),
                kind,
                width,
            })
        })
        .collect()
}

fn parse_field<T: std::str::FromStr>(token: &str, lineno: usize) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    token
        .parse::<T>()
        .with_context(|| format!("line {}: cannot parse '{}'", lineno + 1, token))
}

fn parse_reals<const W: usize>(fields: &[&str], lineno: usize) -> Result<[f64; W]> {
    let mut out = [0.0; W];
    for (slot, token) in out.iter_mut().zip(fields) {
        *slot = parse_field::<f64>(token, lineno)?;
    }
    Ok(out)
}

pub fn parse_frames(text: &str) -> Result<Vec<Configuration>> {
    ExtXyzReader::new()?.parse_frames(text)
}

pub fn read_frames(path: &Path) -> Result<Vec<Configuration>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Could not read {}", path.display()))?;
    parse_frames(&text).with_context(|| format!("Failed to parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_FRAMES: &str = "\
2
Properties=species:S:1:pos:R:3:c_q:R:4:c_diameter[1]:R:1:c_diameter[2]:R:1:c_diameter[3]:R:1 pbc=\"F F F\"
C 0.0 0.0 0.0 1.0 0.0 0.0 0.0 3.0 1.0 1.0
H 1.5 0.0 0.0 0.7071067811865476 0.0 0.0 0.7071067811865476 2.0 2.0 1.0
1
Properties=Z:I:1:pos:R:3
8 0.5 0.5 0.5
";

    #[test]
    fn test_comment_pairs() {
        let reader = ExtXyzReader::new().unwrap();
        let info = reader.parse_comment(r#"Properties=species:S:1:pos:R:3 pbc="F F F" energy=-1.5"#);
        assert_eq!(info["Properties"], "species:S:1:pos:R:3");
        assert_eq!(info["pbc"], "F F F");
        assert_eq!(info["energy"], "-1.5");
    }

    #[test]
    fn test_ellipsoid_columns() {
        let frames = parse_frames(TWO_FRAMES).unwrap();
        assert_eq!(frames.len(), 2);

        let first = &frames[0];
        assert_eq!(first.species, vec![6, 1]);
        assert_eq!(first.positions[1], Point3::new(1.5, 0.0, 0.0));
        let q = first.orientations.as_ref().unwrap();
        assert_eq!(q.shape(), (2, 4));
        assert_eq!(q[(0, 0)], 1.0);
        let axes = first.semi_axes.as_ref().unwrap();
        assert_eq!(axes.shape(), (2, 3));
        assert_eq!(axes[(0, 0)], 3.0);
        assert_eq!(axes[(1, 1)], 2.0);

        let second = &frames[1];
        assert_eq!(second.species, vec![8]);
        assert!(second.orientations.is_none());
        assert!(second.semi_axes.is_none());
    }

    #[test]
    fn test_short_frame_is_an_error() {
        let err = parse_frames("3\nProperties=species:S:1:pos:R:3\nH 0 0 0\n").unwrap_err();
        assert!(format!("{err:#}").contains("expected 3 particle rows"));
    }

    #[test]
    fn test_oversized_particle_count_is_an_error() {
        let err = parse_frames("99999999999999999\nProperties=species:S:1:pos:R:3\nH 0 0 0\n").unwrap_err();
        assert!(format!("{err:#}").contains("expected 99999999999999999 particle rows"));
    }

    #[test]
    fn test_partial_semi_axes_are_rejected() {
        let text = "1\nProperties=species:S:1:pos:R:3:c_diameter[1]:R:1\nH 0 0 0 1.0\n";
        let err = parse_frames(text).unwrap_err();
        assert!(format!("{err:#}").contains("needs all three columns"));
    }

    #[test]
    fn test_non_finite_semi_axis_is_rejected() {
        let scalar = "1\nProperties=species:S:1:pos:R:3:c_diameter[1]:R:1:c_diameter[2]:R:1:c_diameter[3]:R:1\nH 0 0 0 1.0 nan 1.0\n";
        let msg = format!("{:#}", parse_frames(scalar).unwrap_err());
        assert!(msg.contains("line 3: non-finite semi-axis NaN"), "{msg}");
        assert!(!msg.contains("needs all three columns"));

        let packed = "1\nProperties=species:S:1:pos:R:3:c_diameter:R:3\nH 0 0 0 1.0 1.0 inf\n";
        let msg = format!("{:#}", parse_frames(packed).unwrap_err());
        assert!(msg.contains("non-finite semi-axis inf"), "{msg}");
    }
}
