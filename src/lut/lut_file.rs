//! Binary persistence of a [`LookupTable`].
//!
//! The file is a single little-endian record:
//!
//! ```text
//! +---------------------------+------------------------------------------+
//! | magic            8 bytes  | "QSCANLUT"                               |
//! | version          u32      | LUT_FORMAT_VERSION                       |
//! | origin           3 × f64  |                                          |
//! | spacing          3 × f64  |                                          |
//! | node count       3 × u64  |                                          |
//! | projection       u8 + 2×f64 | 0 = cartesian, 1 = local tangent plane |
//! | unit_conversion  f64      |                                          |
//! | fraction_tt      f64      |                                          |
//! | decimation       3 × u64  |                                          |
//! | phases           u32 + n × (u16 len, UTF-8)                          |
//! | fields           u32 + n × (station, phase, node_count × f64)        |
//! +---------------------------+------------------------------------------+
//! ```
//!
//! Travel times are stored as `f64`, so a save/load round trip is lossless.
//! [`LookupTable::load`] fails with a geometry mismatch when the persisted grid
//! differs from the grid declared by the caller; the table is never truncated
//! or resampled to fit.
use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufWriter, Read, Write},
};

use camino::Utf8Path;
use nalgebra::Vector3;
use nom::{
    bytes::complete::{tag, take},
    combinator::map_res,
    error::{make_error, ErrorKind},
    multi::count,
    number::complete::{le_f64, le_u16, le_u32, le_u64, u8 as le_u8},
    IResult,
};
use tracing::debug;

use crate::{
    constants::{LUT_FORMAT_VERSION, LUT_MAGIC},
    grid::{Grid, Projection},
    lut::{LookupTable, StationPhaseKey, TravelTimeField},
    quakescan_errors::QuakeScanError,
};

/// Raw content of a table file, before validation.
#[derive(Debug, PartialEq)]
struct LutRecord {
    origin: [f64; 3],
    spacing: [f64; 3],
    node_count: [u64; 3],
    projection: (u8, f64, f64),
    unit_conversion: f64,
    fraction_tt: f64,
    decimation: [u64; 3],
    phases: Vec<String>,
    fields: Vec<(String, String, Vec<f64>)>,
}

fn vec3_f64(input: &[u8]) -> IResult<&[u8], [f64; 3]> {
    let (input, x) = le_f64(input)?;
    let (input, y) = le_f64(input)?;
    let (input, z) = le_f64(input)?;
    Ok((input, [x, y, z]))
}

fn vec3_u64(input: &[u8]) -> IResult<&[u8], [u64; 3]> {
    let (input, x) = le_u64(input)?;
    let (input, y) = le_u64(input)?;
    let (input, z) = le_u64(input)?;
    Ok((input, [x, y, z]))
}

fn short_string(input: &[u8]) -> IResult<&[u8], String> {
    let (input, len) = le_u16(input)?;
    let (input, text) = map_res(take(len as usize), std::str::from_utf8)(input)?;
    Ok((input, text.to_owned()))
}

/// Fail unless `input` still holds `n` items of at least `item_size` bytes each.
fn announced(input: &[u8], n: usize, item_size: usize) -> IResult<&[u8], ()> {
    if n.saturating_mul(item_size) > input.len() {
        return Err(nom::Err::Failure(make_error(input, ErrorKind::Count)));
    }
    Ok((input, ()))
}

fn header(input: &[u8]) -> IResult<&[u8], u32> {
    let (input, _) = tag(&LUT_MAGIC[..])(input)?;
    le_u32(input)
}

fn body(input: &[u8]) -> IResult<&[u8], LutRecord> {
    let (input, origin) = vec3_f64(input)?;
    let (input, spacing) = vec3_f64(input)?;
    let (input, node_count) = vec3_u64(input)?;
    let (input, proj_tag) = le_u8(input)?;
    let (input, proj_a) = le_f64(input)?;
    let (input, proj_b) = le_f64(input)?;
    let (input, unit_conversion) = le_f64(input)?;
    let (input, fraction_tt) = le_f64(input)?;
    let (input, decimation) = vec3_u64(input)?;

    let (input, n_phases) = le_u32(input)?;
    let (input, _) = announced(input, n_phases as usize, 2)?;
    let (input, phases) = count(short_string, n_phases as usize)(input)?;

    let nodes = node_count.iter().fold(1u64, |acc, &n| acc.saturating_mul(n));
    let nodes = usize::try_from(nodes).unwrap_or(usize::MAX);
    let field_size = nodes.saturating_mul(8).saturating_add(4);
    let (input, n_fields) = le_u32(input)?;
    let (mut input, _) = announced(input, n_fields as usize, field_size)?;
    let mut fields = Vec::with_capacity(n_fields as usize);
    for _ in 0..n_fields {
        let (rest, station) = short_string(input)?;
        let (rest, phase) = short_string(rest)?;
        let (rest, _) = announced(rest, nodes, 8)?;
        let (rest, values) = count(le_f64, nodes)(rest)?;
        fields.push((station, phase, values));
        input = rest;
    }

    Ok((
        input,
        LutRecord {
            origin,
            spacing,
            node_count,
            projection: (proj_tag, proj_a, proj_b),
            unit_conversion,
            fraction_tt,
            decimation,
            phases,
            fields,
        },
    ))
}

fn parse_record(input: &[u8]) -> Result<LutRecord, QuakeScanError> {
    let (rest, version) = header(input)
        .map_err(|e| QuakeScanError::LutParsing(format!("invalid header: {e}")))?;
    if version != LUT_FORMAT_VERSION {
        return Err(QuakeScanError::UnsupportedLutVersion(version));
    }
    let (rest, record) =
        body(rest).map_err(|e| QuakeScanError::LutParsing(format!("invalid body: {e}")))?;
    if !rest.is_empty() {
        return Err(QuakeScanError::LutParsing(format!(
            "{} trailing bytes after the last field",
            rest.len()
        )));
    }
    Ok(record)
}

fn to_usize3(values: [u64; 3], what: &str) -> Result<[usize; 3], QuakeScanError> {
    let mut out = [0usize; 3];
    for (o, v) in out.iter_mut().zip(values) {
        *o = usize::try_from(v)
            .map_err(|_| QuakeScanError::LutParsing(format!("{what} {v} does not fit in usize")))?;
    }
    Ok(out)
}

impl LutRecord {
    fn into_table(self) -> Result<LookupTable, QuakeScanError> {
        let projection = match self.projection {
            (0, _, _) => Projection::Cartesian,
            (1, longitude, latitude) => Projection::LocalTangentPlane {
                longitude,
                latitude,
            },
            (other, _, _) => {
                return Err(QuakeScanError::LutParsing(format!(
                    "unknown projection tag {other}"
                )))
            }
        };
        let grid = Grid::new(
            Vector3::from(self.origin),
            Vector3::from(self.spacing),
            to_usize3(self.node_count, "node count")?,
            projection,
        )?;

        let mut fields = BTreeMap::new();
        for (station, phase, values) in self.fields {
            let key = StationPhaseKey::new(station, phase);
            let field = TravelTimeField::new(&key, values)?;
            if fields.contains_key(&key) {
                return Err(QuakeScanError::LutParsing(format!("duplicate key {key}")));
            }
            fields.insert(key, field);
        }

        let mut lut = LookupTable::from_fields(grid, fields);
        if lut.phases() != self.phases.as_slice() {
            return Err(QuakeScanError::LutParsing(format!(
                "phase list {:?} does not match the stored fields {:?}",
                self.phases,
                lut.phases()
            )));
        }
        lut.restore_metadata(
            self.unit_conversion,
            to_usize3(self.decimation, "decimation")?,
            self.fraction_tt,
        );
        Ok(lut)
    }
}

fn write_short_string<W: Write>(w: &mut W, s: &str) -> Result<(), QuakeScanError> {
    let len = u16::try_from(s.len()).map_err(|_| {
        QuakeScanError::InvalidScanParameter(format!("identifier too long to persist: {s}"))
    })?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

impl LookupTable {
    /// Serialize the table into `writer` using the versioned binary layout.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), QuakeScanError> {
        let grid = self.grid();
        writer.write_all(LUT_MAGIC)?;
        writer.write_all(&LUT_FORMAT_VERSION.to_le_bytes())?;
        for v in grid.origin().iter().chain(grid.spacing().iter()) {
            writer.write_all(&v.to_le_bytes())?;
        }
        for n in grid.node_count() {
            writer.write_all(&(n as u64).to_le_bytes())?;
        }
        let (proj_tag, a, b) = match grid.projection() {
            Projection::Cartesian => (0u8, 0.0, 0.0),
            Projection::LocalTangentPlane {
                longitude,
                latitude,
            } => (1u8, longitude, latitude),
        };
        writer.write_all(&[proj_tag])?;
        writer.write_all(&f64::to_le_bytes(a))?;
        writer.write_all(&f64::to_le_bytes(b))?;
        writer.write_all(&self.unit_conversion().to_le_bytes())?;
        writer.write_all(&self.fraction_tt().to_le_bytes())?;
        for d in self.decimation() {
            writer.write_all(&(d as u64).to_le_bytes())?;
        }

        writer.write_all(&(self.phases().len() as u32).to_le_bytes())?;
        for phase in self.phases() {
            write_short_string(writer, phase)?;
        }

        writer.write_all(&(self.len() as u32).to_le_bytes())?;
        for (key, field) in self.iter() {
            write_short_string(writer, &key.station)?;
            write_short_string(writer, &key.phase)?;
            for v in field.values() {
                writer.write_all(&v.to_le_bytes())?;
            }
        }
        Ok(())
    }

    /// Decode a table from an in-memory buffer.
    pub fn from_bytes(bytes: &[u8]) -> Result<LookupTable, QuakeScanError> {
        parse_record(bytes)?.into_table()
    }

    /// Persist the table at `path`, overwriting any existing file.
    pub fn save(&self, path: &Utf8Path) -> Result<(), QuakeScanError> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_to(&mut writer)?;
        writer.flush()?;
        debug!(%path, keys = self.len(), "travel-time table saved");
        Ok(())
    }

    /// Read a persisted table without any geometry expectation.
    pub fn read(path: &Utf8Path) -> Result<LookupTable, QuakeScanError> {
        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;
        let lut = Self::from_bytes(&bytes)?;
        debug!(%path, keys = lut.len(), "travel-time table read");
        Ok(lut)
    }

    /// Read a persisted table and check it was built for `grid`.
    ///
    /// Return
    /// ----------
    /// * The table, or [`QuakeScanError::GeometryMismatch`] when the persisted
    ///   geometry disagrees with `grid`.
    pub fn load(path: &Utf8Path, grid: &Grid) -> Result<LookupTable, QuakeScanError> {
        let lut = Self::read(path)?;
        grid.check_compatible(lut.grid())?;
        Ok(lut)
    }
}
