use anyhow::Context as _;
use fs2::FileExt as _;
use std::io::Write as _;
use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

/// Exclusive advisory lock guarding one crawler data dir.
///
/// Dedup files are append-only and in-flight markers assume a single uploader, so a second
/// crawler pointed at the same dir must refuse to start. The holder writes its pid into the
/// lock file so the refusal can name it.
#[derive(Debug)]
pub struct SingleInstanceLock {
    _file: File,
    path: PathBuf,
}

impl SingleInstanceLock {
    pub fn acquire(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open lock file {}", path.display()))?;

        // Released by the OS when the process dies, so a crash never leaves the dir locked.
        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                let holder = holder_pid(&path)
                    .map(|pid| format!("pid {pid}"))
                    .unwrap_or_else(|| "unknown pid".to_string());
                anyhow::bail!(
                    "another stager-link crawler ({holder}) is using this data dir (lock held at {})",
                    path.display()
                );
            }
            Err(e) => {
                return Err(anyhow::anyhow!(e))
                    .with_context(|| format!("failed to lock {}", path.display()));
            }
        }

        record_pid(&file).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn record_pid(mut file: &File) -> std::io::Result<()> {
    file.set_len(0)?;
    writeln!(file, "{}", std::process::id())?;
    file.flush()
}

fn holder_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}
