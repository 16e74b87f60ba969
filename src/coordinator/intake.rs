use crate::protocol::JobId;
use std::collections::HashSet;
use std::hash::Hash;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArchiveReport {
    pub job: JobId,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FinishedReport {
    pub job: JobId,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiscoveredReport {
    pub job: JobId,
    pub parent: String,
    pub url: String,
}

#[derive(Debug)]
struct Queue<T> {
    items: Mutex<Vec<T>>,
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone + Eq + Hash> Queue<T> {
    fn lock(&self) -> MutexGuard<'_, Vec<T>> {
        match self.items.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("intake queue lock poisoned; continuing with recovered state");
                poisoned.into_inner()
            }
        }
    }

    fn push(&self, item: T) {
        self.lock().push(item);
    }

    // Swap under the lock: appends racing with the drain land in the fresh vector.
    // Workers report with set semantics, so repeats within one batch collapse to the first.
    fn drain(&self) -> Vec<T> {
        let batch = std::mem::take(&mut *self.lock());
        let mut seen = HashSet::with_capacity(batch.len());
        batch
            .into_iter()
            .filter(|item| seen.insert(item.clone()))
            .collect()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

#[derive(Debug, Default)]
struct Shared {
    archives: Queue<ArchiveReport>,
    finished: Queue<FinishedReport>,
    discovered: Queue<DiscoveredReport>,
}

/// Producer side, handed to crawl workers.
#[derive(Debug, Clone)]
pub struct IntakeHandle {
    shared: Arc<Shared>,
}

impl IntakeHandle {
    pub fn report_archive(&self, job: JobId, path: impl Into<PathBuf>) {
        self.shared.archives.push(ArchiveReport {
            job,
            path: path.into(),
        });
    }

    pub fn report_finished(&self, job: JobId, url: impl Into<String>) {
        self.shared.finished.push(FinishedReport {
            job,
            url: url.into(),
        });
    }

    pub fn report_discovered(&self, job: JobId, parent: impl Into<String>, url: impl Into<String>) {
        self.shared.discovered.push(DiscoveredReport {
            job,
            parent: parent.into(),
            url: url.into(),
        });
    }
}

/// Consumer side, owned by the coordinator.
#[derive(Debug, Default)]
pub struct IntakeQueues {
    shared: Arc<Shared>,
}

impl IntakeQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> IntakeHandle {
        IntakeHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn drain_archives(&self) -> Vec<ArchiveReport> {
        self.shared.archives.drain()
    }

    pub fn drain_finished(&self) -> Vec<FinishedReport> {
        self.shared.finished.drain()
    }

    /// Puts a finished url back for the next drain.
    pub fn requeue_finished(&self, report: FinishedReport) {
        self.shared.finished.push(report);
    }

    pub fn drain_discovered(&self) -> Vec<DiscoveredReport> {
        self.shared.discovered.drain()
    }

    pub fn backlog(&self) -> (usize, usize, usize) {
        (
            self.shared.archives.len(),
            self.shared.finished.len(),
            self.shared.discovered.len(),
        )
    }
}
