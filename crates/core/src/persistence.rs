//! Snapshot persistence.
//!
//! A snapshot is four independent little-endian blobs — samples, trees,
//! graph, deleted set — plus a `[Index]` config section, exactly as the
//! engine's `save_index_data`/`load_index_data` produce and consume them.
//! This module supplies the scalar encode/decode helpers the components
//! share, and directory-level convenience wrappers that write each blob with
//! an atomic temp-file + rename so a crash can't leave a torn snapshot.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::element::VectorValue;
use crate::engine::Index;
use crate::error::{EngineError, Result};

/// File names of the blobs inside a snapshot directory.
pub const CONFIG_FILE: &str = "config.ini";
pub const SAMPLES_FILE: &str = "samples.bin";
pub const TREES_FILE: &str = "trees.bin";
pub const GRAPH_FILE: &str = "graph.bin";
pub const DELETED_FILE: &str = "deleted.bin";

pub(crate) fn write_i32<W: Write + ?Sized>(w: &mut W, v: i32) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

pub(crate) fn write_f32<W: Write + ?Sized>(w: &mut W, v: f32) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

pub(crate) fn write_u64<W: Write + ?Sized>(w: &mut W, v: u64) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

pub(crate) fn write_u8<W: Write + ?Sized>(w: &mut W, v: u8) -> Result<()> {
    w.write_all(&[v])?;
    Ok(())
}

pub(crate) fn read_i32<R: Read + ?Sized>(r: &mut R) -> Result<i32> {
    let mut buf = [0u8; 4];
    read_exact_buf(r, &mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

pub(crate) fn read_f32<R: Read + ?Sized>(r: &mut R) -> Result<f32> {
    let mut buf = [0u8; 4];
    read_exact_buf(r, &mut buf)?;
    Ok(f32::from_le_bytes(buf))
}

pub(crate) fn read_u8<R: Read + ?Sized>(r: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    read_exact_buf(r, &mut buf)?;
    Ok(buf[0])
}

pub(crate) fn read_exact_buf<R: Read + ?Sized>(r: &mut R, buf: &mut [u8]) -> Result<()> {
    r.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            EngineError::FailedParseValue("blob truncated".into())
        } else {
            EngineError::Io(e)
        }
    })
}

/// Write a file atomically: temp file in the same directory, then rename.
fn write_atomic(path: &Path, write: impl FnOnce(&mut BufWriter<File>) -> Result<()>) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let mut w = BufWriter::new(File::create(&tmp)?);
    write(&mut w)?;
    w.flush()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Save an index snapshot (config + four blobs) into `dir`.
pub fn save_index<T: VectorValue>(index: &Index<T>, dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    write_atomic(&dir.join(CONFIG_FILE), |w| index.save_config(w))?;
    let mut samples = BufWriter::new(File::create(dir.join(SAMPLES_FILE).with_extension("tmp"))?);
    let mut trees = BufWriter::new(File::create(dir.join(TREES_FILE).with_extension("tmp"))?);
    let mut graph = BufWriter::new(File::create(dir.join(GRAPH_FILE).with_extension("tmp"))?);
    let mut deleted = BufWriter::new(File::create(dir.join(DELETED_FILE).with_extension("tmp"))?);
    index.save_index_data(&mut samples, &mut trees, &mut graph, &mut deleted)?;
    for (mut w, name) in [
        (samples, SAMPLES_FILE),
        (trees, TREES_FILE),
        (graph, GRAPH_FILE),
        (deleted, DELETED_FILE),
    ] {
        w.flush()?;
        drop(w);
        fs::rename(dir.join(name).with_extension("tmp"), dir.join(name))?;
    }
    tracing::info!("saved index snapshot to {}", dir.display());
    Ok(())
}

/// Load an index snapshot from `dir`. A missing deleted blob loads as an
/// empty deleted set.
pub fn load_index<T: VectorValue>(dir: &Path) -> Result<Index<T>> {
    let index = Index::<T>::new();
    let config = fs::read_to_string(dir.join(CONFIG_FILE))?;
    index.load_config(&config)?;
    let mut samples = BufReader::new(File::open(dir.join(SAMPLES_FILE))?);
    let mut trees = BufReader::new(File::open(dir.join(TREES_FILE))?);
    let mut graph = BufReader::new(File::open(dir.join(GRAPH_FILE))?);
    let deleted_path = dir.join(DELETED_FILE);
    if deleted_path.exists() {
        let mut deleted = BufReader::new(File::open(deleted_path)?);
        index.load_index_data(&mut samples, &mut trees, &mut graph, Some(&mut deleted))?;
    } else {
        index.load_index_data(&mut samples, &mut trees, &mut graph, None::<&mut BufReader<File>>)?;
    }
    tracing::info!(
        "loaded index snapshot from {} ({} rows)",
        dir.display(),
        index.rows()
    );
    Ok(index)
}
