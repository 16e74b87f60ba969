use crate::dedup::{DedupError, DedupOpener, DedupStore, Result};
use crate::protocol::JobId;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

/// Append-only URL log, one key per line, mirrored in memory.
///
/// A key is only added to the in-memory set after its line has been flushed, so a failed
/// append can simply be retried.
#[derive(Debug)]
pub struct FileDedupStore {
    path: PathBuf,
    file: File,
    keys: HashSet<String>,
}

impl FileDedupStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let keys = match std::fs::read_to_string(&path) {
            Ok(content) => content
                .lines()
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashSet::new(),
            Err(source) => return Err(DedupError::Read { path, source }),
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| DedupError::Open {
                path: path.clone(),
                source,
            })?;
        Ok(Self { path, file, keys })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DedupStore for FileDedupStore {
    fn insert(&mut self, key: &str) -> Result<bool> {
        if key.contains(['\n', '\r']) {
            return Err(DedupError::InvalidKey(key.to_string()));
        }
        if self.keys.contains(key) {
            return Ok(false);
        }
        writeln!(self.file, "{key}")
            .and_then(|_| self.file.flush())
            .map_err(|source| DedupError::Append {
                path: self.path.clone(),
                source,
            })?;
        self.keys.insert(key.to_string());
        Ok(true)
    }

    fn has(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    fn len(&self) -> usize {
        self.keys.len()
    }
}

/// Opens `<dir>/crawler_<job>.urls` per job.
#[derive(Debug, Clone)]
pub struct FileDedupOpener {
    dir: PathBuf,
}

impl FileDedupOpener {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| DedupError::CreateDir {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn path_for(&self, job: &JobId) -> PathBuf {
        self.dir
            .join(format!("crawler_{}.urls", sanitize_file_stem(job.as_str())))
    }
}

impl DedupOpener for FileDedupOpener {
    fn open(&self, job: &JobId) -> Result<Box<dyn DedupStore>> {
        Ok(Box::new(FileDedupStore::open(self.path_for(job))?))
    }
}

/// Percent-encodes every byte outside `[A-Za-z0-9._-]`. The mapping is one-to-one, so two
/// job ids never share a file.
fn sanitize_file_stem(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for b in raw.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}
