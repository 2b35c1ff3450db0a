//! World file encodings
//!
//! Two encodings are supported:
//! - JSON (`serde_json`), human-readable and the default
//! - Binary, a fixed little-endian layout for large worlds
//!
//! Binary layout:
//! ```text
//! magic    8 bytes   "HEATWRLD"
//! version  u32       1
//! width    u32
//! height   u32
//! alpha    f32
//! t        f32
//! props    u32 × width·height
//! state    f32 × width·height
//! ```
//!
//! [`read_world`] detects the encoding from the leading bytes.

use super::grid::{cells_in, HeatWorld};
use crate::error::HeatError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

const BINARY_MAGIC: &[u8; 8] = b"HEATWRLD";
const BINARY_VERSION: u32 = 1;
const BINARY_HEADER_LEN: usize = 8 + 4 * 5;

/// On-disk world encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorldFormat {
    /// `serde_json` text
    #[default]
    Json,
    /// Little-endian binary layout
    Binary,
}

/// Decode a world from a reader, detecting the encoding
///
/// The decoded world is checked for consistent dimensions but not for border
/// marking; callers step through [`crate::solver::StepOrchestrator`], which
/// validates before the first dispatch.
///
/// # Errors
///
/// Returns [`HeatError::Io`] if reading fails and [`HeatError::Format`] if the
/// bytes are not a valid world in either encoding.
pub fn read_world<R: Read>(mut reader: R) -> Result<HeatWorld, HeatError> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    decode_world(&bytes)
}

/// Decode a world from an in-memory buffer
///
/// # Errors
///
/// See [`read_world`].
pub fn decode_world(bytes: &[u8]) -> Result<HeatWorld, HeatError> {
    let world: HeatWorld = if bytes.starts_with(BINARY_MAGIC) {
        decode_binary(bytes)?
    } else {
        serde_json::from_slice(bytes)?
    };

    let cells = world.cell_count();
    if world.state.len() != cells || world.properties.len() != cells {
        return Err(HeatError::Format(format!(
            "{}x{} world carries {} state and {} property entries",
            world.width,
            world.height,
            world.state.len(),
            world.properties.len()
        )));
    }
    Ok(world)
}

/// Encode a world to a writer
///
/// # Errors
///
/// Returns [`HeatError::Io`] if writing fails.
pub fn write_world<W: Write>(
    mut writer: W,
    world: &HeatWorld,
    format: WorldFormat,
) -> Result<(), HeatError> {
    match format {
        WorldFormat::Json => {
            serde_json::to_writer(&mut writer, world)?;
            writer.write_all(b"\n")?;
        }
        WorldFormat::Binary => writer.write_all(&encode_binary(world))?,
    }
    writer.flush()?;
    Ok(())
}

/// Load a world file from disk
///
/// # Errors
///
/// See [`read_world`].
pub fn load_world<P: AsRef<Path>>(path: P) -> Result<HeatWorld, HeatError> {
    let path = path.as_ref();
    let bytes =
        fs::read(path).map_err(|e| HeatError::Io(format!("{}: {e}", path.display())))?;
    decode_world(&bytes)
}

/// Save a world file to disk
///
/// # Errors
///
/// See [`write_world`].
pub fn save_world<P: AsRef<Path>>(
    path: P,
    world: &HeatWorld,
    format: WorldFormat,
) -> Result<(), HeatError> {
    let path = path.as_ref();
    let file =
        fs::File::create(path).map_err(|e| HeatError::Io(format!("{}: {e}", path.display())))?;
    write_world(std::io::BufWriter::new(file), world, format)
}

fn encode_binary(world: &HeatWorld) -> Vec<u8> {
    let cells = world.cell_count();
    let mut out = Vec::with_capacity(BINARY_HEADER_LEN + cells * 8);
    out.extend_from_slice(BINARY_MAGIC);
    out.extend_from_slice(&BINARY_VERSION.to_le_bytes());
    out.extend_from_slice(&world.width.to_le_bytes());
    out.extend_from_slice(&world.height.to_le_bytes());
    out.extend_from_slice(&world.alpha.to_le_bytes());
    out.extend_from_slice(&world.t.to_le_bytes());
    for props in &world.properties {
        out.extend_from_slice(&props.to_le_bytes());
    }
    for value in &world.state {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Little-endian word cursor over a binary world
struct WordReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl WordReader<'_> {
    fn next_word(&mut self) -> Result<[u8; 4], HeatError> {
        let end = self.offset + 4;
        let word = self
            .bytes
            .get(self.offset..end)
            .ok_or_else(|| HeatError::Format(format!("truncated at byte {}", self.offset)))?;
        self.offset = end;
        Ok([word[0], word[1], word[2], word[3]])
    }

    fn u32(&mut self) -> Result<u32, HeatError> {
        self.next_word().map(u32::from_le_bytes)
    }

    fn f32(&mut self) -> Result<f32, HeatError> {
        self.next_word().map(f32::from_le_bytes)
    }
}

fn decode_binary(bytes: &[u8]) -> Result<HeatWorld, HeatError> {
    let mut reader = WordReader {
        bytes,
        offset: BINARY_MAGIC.len(),
    };

    let version = reader.u32()?;
    if version != BINARY_VERSION {
        return Err(HeatError::Format(format!(
            "unsupported binary world version {version}"
        )));
    }
    let width = reader.u32()?;
    let height = reader.u32()?;
    let alpha = reader.f32()?;
    let t = reader.f32()?;

    let cells = cells_in(width, height);
    let expected = BINARY_HEADER_LEN + cells * 8;
    if bytes.len() != expected {
        return Err(HeatError::Format(format!(
            "{width}x{height} binary world needs {expected} bytes, found {}",
            bytes.len()
        )));
    }

    let properties = (0..cells)
        .map(|_| reader.u32())
        .collect::<Result<Vec<_>, _>>()?;
    let state = (0..cells)
        .map(|_| reader.f32())
        .collect::<Result<Vec<_>, _>>()?;

    Ok(HeatWorld {
        width,
        height,
        state,
        properties,
        alpha,
        t,
    })
}
