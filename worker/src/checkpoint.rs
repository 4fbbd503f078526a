//! Durable snapshots of every variable plus the global step.
//!
//! A checkpoint file starts with the `CKPT` magic, a little endian `u32` version and a
//! little endian `u64` header length. The JSON header names the global step and every
//! variable with its length, the little endian `f32` values follow in header order.
//! The `checkpoint` index file names the latest and every retained checkpoint.

use std::{
    fs::{self, File},
    io::{self, BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::{Result, WorkerErr};

const MAGIC: &[u8; 4] = b"CKPT";
const VERSION: u32 = 1;
const INDEX_FILE: &str = "checkpoint";
const PREFIX: &str = "model.ckpt-";

/// A named block of values inside a checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedVariable {
    pub name: String,
    pub values: Vec<f32>,
}

/// The contents of a checkpoint file.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub global_step: u64,
    pub variables: Vec<SavedVariable>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    global_step: u64,
    variables: Vec<HeaderEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct HeaderEntry {
    name: String,
    len: usize,
}

/// The index of the checkpoints of a directory, oldest first.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Index {
    latest: Option<String>,
    all: Vec<String>,
}

/// Writes and reads the checkpoints of a single log directory.
///
/// Only the leader writes checkpoints, so a `Saver` assumes it's the only writer of its directory.
#[derive(Debug, Clone)]
pub struct Saver {
    dir: PathBuf,
    max_to_keep: usize,
}

impl Saver {
    /// Creates a new `Saver`.
    ///
    /// # Arguments
    /// * `dir` - The directory to keep checkpoints in.
    /// * `max_to_keep` - The amount of most recent checkpoints to retain.
    pub fn new(dir: impl Into<PathBuf>, max_to_keep: usize) -> Self {
        Self {
            dir: dir.into(),
            max_to_keep: max_to_keep.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Atomically writes a new checkpoint and prunes the oldest ones.
    ///
    /// # Arguments
    /// * `checkpoint` - The snapshot to write.
    ///
    /// # Returns
    /// The path of the new checkpoint or a `WorkerErr::Checkpoint` if it couldn't be written.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<PathBuf> {
        self.try_save(checkpoint)
            .map_err(|e| WorkerErr::Checkpoint(format!("saving to {}: {e}", self.dir.display())))
    }

    fn try_save(&self, checkpoint: &Checkpoint) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;

        let name = format!("{PREFIX}{}", checkpoint.global_step);
        let path = self.dir.join(&name);
        let tmp = self.dir.join(format!("{name}.tmp"));

        write_atomically(&tmp, &path, |w| encode(checkpoint, w))?;

        let mut index = self.read_index()?;
        index.all.retain(|other| *other != name);
        index.all.push(name.clone());
        index.latest = Some(name);

        let excess = index.all.len().saturating_sub(self.max_to_keep);
        let pruned: Vec<_> = index.all.drain(..excess).collect();

        let json = serde_json::to_vec_pretty(&index)?;
        let index_tmp = self.dir.join(format!("{INDEX_FILE}.tmp"));
        write_atomically(&index_tmp, &self.dir.join(INDEX_FILE), |w| w.write_all(&json))?;

        for old in pruned {
            match fs::remove_file(self.dir.join(&old)) {
                Ok(()) => debug!("pruned checkpoint {old}"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }

        info!(global_step = checkpoint.global_step; "saved checkpoint {}", path.display());
        Ok(path)
    }

    /// The path of the latest checkpoint, if any was written.
    pub fn latest(&self) -> Result<Option<PathBuf>> {
        let index = self
            .read_index()
            .map_err(|e| WorkerErr::Checkpoint(format!("reading the index: {e}")))?;

        Ok(index.latest.map(|name| self.dir.join(name)))
    }

    /// The paths of every retained checkpoint, oldest first.
    pub fn retained(&self) -> Result<Vec<PathBuf>> {
        let index = self
            .read_index()
            .map_err(|e| WorkerErr::Checkpoint(format!("reading the index: {e}")))?;

        Ok(index.all.iter().map(|name| self.dir.join(name)).collect())
    }

    /// Reads the checkpoint at `path`.
    pub fn restore(&self, path: impl AsRef<Path>) -> Result<Checkpoint> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| WorkerErr::Checkpoint(format!("opening {}: {e}", path.display())))?;
        let file_len = file
            .metadata()
            .map_err(|e| WorkerErr::Checkpoint(format!("inspecting {}: {e}", path.display())))?
            .len();

        decode(BufReader::new(file), file_len)
            .map_err(|e| WorkerErr::Checkpoint(format!("reading {}: {e}", path.display())))
    }

    fn read_index(&self) -> io::Result<Index> {
        match fs::read(self.dir.join(INDEX_FILE)) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Index::default()),
            Err(e) => Err(e),
        }
    }
}

/// Writes through a temporary file, syncs it and renames it over `path`.
fn write_atomically<F>(tmp: &Path, path: &Path, write: F) -> io::Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> io::Result<()>,
{
    let mut w = BufWriter::new(File::create(tmp)?);
    write(&mut w)?;
    w.flush()?;
    w.get_ref().sync_all()?;
    drop(w);
    fs::rename(tmp, path)
}

fn encode<W: Write>(checkpoint: &Checkpoint, w: &mut W) -> io::Result<()> {
    let header = Header {
        global_step: checkpoint.global_step,
        variables: checkpoint
            .variables
            .iter()
            .map(|var| HeaderEntry {
                name: var.name.clone(),
                len: var.values.len(),
            })
            .collect(),
    };

    let header = serde_json::to_vec(&header)?;

    w.write_all(MAGIC)?;
    w.write_all(&VERSION.to_le_bytes())?;
    w.write_all(&(header.len() as u64).to_le_bytes())?;
    w.write_all(&header)?;

    for var in &checkpoint.variables {
        for value in &var.values {
            w.write_all(&value.to_le_bytes())?;
        }
    }

    Ok(())
}

/// Decodes a checkpoint of `file_len` bytes.
///
/// Every length read from the file is checked against the bytes left before allocating.
fn decode<R: Read>(mut r: R, file_len: u64) -> io::Result<Checkpoint> {
    const PREAMBLE_LEN: u64 = 4 + size_of::<u32>() as u64 + size_of::<u64>() as u64;

    let mut remaining = file_len
        .checked_sub(PREAMBLE_LEN)
        .ok_or_else(|| invalid_data("shorter than the checkpoint preamble"))?;

    let mut magic = [0; 4];
    r.read_exact(&mut magic)?;

    if &magic != MAGIC {
        return Err(invalid_data("not a checkpoint file"));
    }

    let mut version = [0; 4];
    r.read_exact(&mut version)?;
    let version = u32::from_le_bytes(version);

    if version != VERSION {
        return Err(invalid_data(format!("unsupported version {version}")));
    }

    let mut header_len = [0; 8];
    r.read_exact(&mut header_len)?;
    let header_len = take(&mut remaining, u64::from_le_bytes(header_len), "header")?;

    let mut header = vec![0; header_len];
    r.read_exact(&mut header)?;
    let header: Header = serde_json::from_slice(&header)?;

    let mut variables = Vec::with_capacity(header.variables.len());

    for entry in header.variables {
        let byte_len = u64::try_from(entry.len)
            .ok()
            .and_then(|len| len.checked_mul(size_of::<f32>() as u64))
            .ok_or_else(|| invalid_data(format!("variable {} is too large", entry.name)))?;
        let byte_len = take(&mut remaining, byte_len, &entry.name)?;

        let mut raw = vec![0; byte_len];
        r.read_exact(&mut raw)?;

        let values = raw
            .chunks_exact(size_of::<f32>())
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        variables.push(SavedVariable {
            name: entry.name,
            values,
        });
    }

    let mut trailing = [0; 1];
    if remaining != 0 || r.read(&mut trailing)? != 0 {
        return Err(invalid_data("trailing bytes after the last variable"));
    }

    Ok(Checkpoint {
        global_step: header.global_step,
        variables,
    })
}

/// Consumes `len` bytes of the `remaining` ones, failing if the file is too short.
fn take(remaining: &mut u64, len: u64, what: &str) -> io::Result<usize> {
    *remaining = remaining.checked_sub(len).ok_or_else(|| {
        invalid_data(format!("{what} claims {len} bytes past the end of the file"))
    })?;

    usize::try_from(len).map_err(|_| invalid_data(format!("{what} is too large")))
}

fn invalid_data(detail: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, detail.into())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn checkpoint(global_step: u64) -> Checkpoint {
        Checkpoint {
            global_step,
            variables: vec![
                SavedVariable {
                    name: "w".into(),
                    values: vec![1.5, -2.0, global_step as f32],
                },
                SavedVariable {
                    name: "b".into(),
                    values: vec![0.25],
                },
            ],
        }
    }

    #[test]
    fn empty_directories_have_no_latest() {
        let dir = TempDir::new().unwrap();
        let saver = Saver::new(dir.path(), 5);

        assert_eq!(saver.latest().unwrap(), None);
    }

    #[test]
    fn saved_checkpoints_restore_identically() {
        let dir = TempDir::new().unwrap();
        let saver = Saver::new(dir.path(), 5);

        let path = saver.save(&checkpoint(120)).unwrap();
        assert_eq!(path, dir.path().join("model.ckpt-120"));
        assert_eq!(saver.latest().unwrap(), Some(path.clone()));
        assert_eq!(saver.restore(&path).unwrap(), checkpoint(120));
    }

    #[test]
    fn only_the_most_recent_are_retained() {
        let dir = TempDir::new().unwrap();
        let saver = Saver::new(dir.path(), 2);

        for step in [10, 20, 30] {
            saver.save(&checkpoint(step)).unwrap();
        }

        let retained = saver.retained().unwrap();
        assert_eq!(
            retained,
            [
                dir.path().join("model.ckpt-20"),
                dir.path().join("model.ckpt-30")
            ]
        );
        assert!(!dir.path().join("model.ckpt-10").exists());
        assert!(!dir.path().join("model.ckpt-30.tmp").exists());
    }

    #[test]
    fn corrupted_files_are_rejected() {
        let dir = TempDir::new().unwrap();
        let saver = Saver::new(dir.path(), 5);
        let path = saver.save(&checkpoint(1)).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        bytes.truncate(bytes.len() - 2);
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(saver.restore(&path), Err(WorkerErr::Checkpoint(_))));

        fs::write(&path, b"nope").unwrap();
        assert!(matches!(saver.restore(&path), Err(WorkerErr::Checkpoint(_))));
    }

    fn forged(header: &[u8], header_len: u64) -> Vec<u8> {
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&VERSION.to_le_bytes());
        bytes.extend_from_slice(&header_len.to_le_bytes());
        bytes.extend_from_slice(header);
        bytes
    }

    #[test]
    fn lengths_past_the_end_of_the_file_are_rejected() {
        let dir = TempDir::new().unwrap();
        let saver = Saver::new(dir.path(), 5);
        let path = dir.path().join("model.ckpt-1");

        let header = br#"{"global_step":1,"variables":[{"name":"w","len":4611686018427387904}]}"#;
        fs::write(&path, forged(header, header.len() as u64)).unwrap();
        assert!(matches!(saver.restore(&path), Err(WorkerErr::Checkpoint(_))));

        let header = br#"{"global_step":1,"variables":[{"name":"w","len":3}]}"#;
        let mut bytes = forged(header, header.len() as u64);
        bytes.extend_from_slice(&1f32.to_le_bytes());
        fs::write(&path, bytes).unwrap();
        assert!(matches!(saver.restore(&path), Err(WorkerErr::Checkpoint(_))));

        fs::write(&path, forged(b"{}", u64::MAX)).unwrap();
        assert!(matches!(saver.restore(&path), Err(WorkerErr::Checkpoint(_))));
    }
}
