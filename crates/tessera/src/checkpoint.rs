// Checkpoint — Save and load named arrays
//
// Binary checkpoint format (.tsra):
//
//   Header:
//     magic:   [u8; 4]  = b"TSRA"
//     version: u32 LE   = 1
//     count:   u32 LE   = number of arrays
//
//   For each array:
//     key_len:  u32 LE
//     key:      [u8; key_len]  (UTF-8)
//     ndim:     u32 LE
//     dims:     [u32 LE; ndim]
//     data_len: u64 LE         (in bytes, 4 * element count)
//     data:     [f32 LE; ...]
//
// Saving is a synchronization point: every array is waited for before its
// bytes are written, and a failure recorded on any of them aborts the save
// instead of writing stale data.
//
// Usage:
//   checkpoint::save("model.tsra", &executor.arg_arrays())?;
//   let arrays = checkpoint::load("model.tsra", &engine, Device::cpu())?;

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use tessera_core::{bail, Device, Error, Result, Shape};
use tessera_engine::Engine;

use crate::ndarray::NDArray;

const MAGIC: &[u8; 4] = b"TSRA";
const VERSION: u32 = 1;

// Low-level IO helpers

fn write_u32(w: &mut impl Write, v: u32) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_u64(w: &mut impl Write, v: u64) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn read_u32(r: &mut impl Read) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Read exactly `len` bytes. The buffer grows with the data actually read,
/// so a corrupt length cannot force a huge allocation up front.
fn read_bytes(r: &mut impl Read, len: u64) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    r.take(len).read_to_end(&mut buf)?;
    if (buf.len() as u64) < len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("expected {len} bytes, found {}", buf.len()),
        ));
    }
    Ok(buf)
}

fn to_u32(v: usize, what: &str) -> Result<u32> {
    u32::try_from(v).map_err(|_| Error::msg(format!("{what} too large for checkpoint: {v}")))
}

// Write

/// Write named arrays to `writer`, waiting for each one first.
pub fn write_checkpoint(writer: &mut impl Write, arrays: &[(String, NDArray)]) -> Result<()> {
    writer.write_all(MAGIC)?;
    write_u32(writer, VERSION)?;
    write_u32(writer, to_u32(arrays.len(), "array count")?)?;

    for (key, array) in arrays {
        let data = array.to_vec()?;

        let key_bytes = key.as_bytes();
        write_u32(writer, to_u32(key_bytes.len(), "key length")?)?;
        writer.write_all(key_bytes)?;

        write_u32(writer, to_u32(array.ndim(), "rank")?)?;
        for &d in array.dims() {
            write_u32(writer, to_u32(d, "dimension")?)?;
        }

        write_u64(writer, (data.len() * 4) as u64)?;
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        writer.write_all(&bytes)?;
    }
    log::debug!("wrote checkpoint with {} arrays", arrays.len());
    Ok(())
}

// Read

/// Read named arrays from `reader`, creating them on `device` of `engine`.
pub fn read_checkpoint(
    reader: &mut impl Read,
    engine: &Engine,
    device: Device,
) -> Result<Vec<(String, NDArray)>> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        bail!(
            "invalid checkpoint: expected magic {:?}, got {:?}",
            MAGIC,
            magic
        );
    }

    let version = read_u32(reader)?;
    if version != VERSION {
        bail!("unsupported checkpoint version: {version} (expected {VERSION})");
    }

    // Header counts are untrusted: nothing is sized from them up front
    let count = read_u32(reader)?;
    let mut arrays = Vec::new();
    for _ in 0..count {
        let key_len = read_u32(reader)?;
        let key = String::from_utf8(read_bytes(reader, u64::from(key_len))?)
            .map_err(|e| Error::msg(format!("invalid UTF-8 key: {e}")))?;

        let ndim = read_u32(reader)?;
        let mut dims = Vec::new();
        for _ in 0..ndim {
            dims.push(read_u32(reader)? as usize);
        }
        let shape = Shape::new(dims);

        let expected = shape
            .checked_elem_count()
            .and_then(|n| n.checked_mul(4))
            .and_then(|n| u64::try_from(n).ok())
            .ok_or_else(|| {
                Error::msg(format!(
                    "corrupt checkpoint entry '{key}': shape {shape} is too large"
                ))
            })?;
        let data_len = read_u64(reader)?;
        if data_len != expected {
            bail!(
                "corrupt checkpoint entry '{key}': shape {shape} needs {expected} bytes, \
                 found {data_len}"
            );
        }
        let data: Vec<f32> = read_bytes(reader, data_len)?
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        let array = NDArray::from_vec(data, shape, device, engine)?;
        arrays.push((key, array));
    }
    Ok(arrays)
}

// Files

/// Save named arrays to a file.
pub fn save(path: impl AsRef<Path>, arrays: &[(String, NDArray)]) -> Result<()> {
    // Materialize before touching the file so a failed array leaves no
    // truncated checkpoint behind.
    for (_, array) in arrays {
        array.wait_to_read()?;
    }
    let file = File::create(path.as_ref())?;
    let mut writer = BufWriter::new(file);
    write_checkpoint(&mut writer, arrays)?;
    writer.flush()?;
    Ok(())
}

/// Load named arrays from a file.
pub fn load(
    path: impl AsRef<Path>,
    engine: &Engine,
    device: Device,
) -> Result<Vec<(String, NDArray)>> {
    let file = File::open(path.as_ref())?;
    let mut reader = BufReader::new(file);
    read_checkpoint(&mut reader, engine, device)
}

// In-memory

pub fn to_bytes(arrays: &[(String, NDArray)]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    write_checkpoint(&mut buf, arrays)?;
    Ok(buf)
}

pub fn from_bytes(data: &[u8], engine: &Engine, device: Device) -> Result<Vec<(String, NDArray)>> {
    let mut cursor = std::io::Cursor::new(data);
    read_checkpoint(&mut cursor, engine, device)
}
