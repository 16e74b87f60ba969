use crate::coordinator::jobs::JobTracker;
use crate::coordinator::peers::PeerRef;
use crate::coordinator::random_index;
use crate::net::{PeerId, Transport};
use crate::protocol::{JobId, OutboundMessage};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tokio::time::{Duration, Instant};

const IN_FLIGHT_SUFFIX: &str = ".uploading";

/// Result of evaluating the grant window of one archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadChoice {
    Undecided,
    /// The window closed without a single grant.
    Rejected,
    Chosen(PeerRef),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantOutcome {
    /// Never requested, or not tracked at all.
    Ignored,
    Recorded,
    /// The uploader was already picked and revokes went out; this granter must stand down too.
    Late,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStart {
    Started,
    AlreadyInFlight,
    Failed,
}

#[derive(Debug, Clone)]
pub struct PendingUpload {
    pub job: JobId,
    pub path: PathBuf,
    pub size: u64,
    pub requested: bool,
    pub revoked: bool,
    grants: Vec<PeerRef>,
    // Start of the grant window; moved forward by every grant.
    window_start: Option<Instant>,
    // Computed once, then fixed for the life of this upload.
    chosen: Option<PeerRef>,
    attempt: u32,
    retry_at: Option<Instant>,
}

impl PendingUpload {
    pub fn new(job: JobId, path: PathBuf, size: u64) -> Self {
        Self {
            job,
            path,
            size,
            requested: false,
            revoked: false,
            grants: Vec::new(),
            window_start: None,
            chosen: None,
            attempt: 0,
            retry_at: None,
        }
    }

    pub fn grants(&self) -> &[PeerRef] {
        &self.grants
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn grant(&mut self, peer: PeerRef, now: Instant) -> GrantOutcome {
        if !self.requested {
            return GrantOutcome::Ignored;
        }
        if self.revoked {
            if self.chosen.as_ref().is_some_and(|c| c.id == peer.id) {
                return GrantOutcome::Ignored;
            }
            return GrantOutcome::Late;
        }
        if !self.grants.iter().any(|g| g.id == peer.id) {
            self.grants.push(peer);
        }
        self.window_start = Some(now);
        GrantOutcome::Recorded
    }

    pub fn choice(&mut self, now: Instant, window: Duration) -> UploadChoice {
        if let Some(chosen) = &self.chosen {
            return UploadChoice::Chosen(chosen.clone());
        }
        let Some(start) = self.window_start else {
            self.window_start = Some(now);
            return UploadChoice::Undecided;
        };
        if now.saturating_duration_since(start) < window {
            return UploadChoice::Undecided;
        }
        let Some(idx) = random_index(self.grants.len()) else {
            return UploadChoice::Rejected;
        };
        let chosen = self.grants[idx].clone();
        self.chosen = Some(chosen.clone());
        UploadChoice::Chosen(chosen)
    }

    /// Granters other than the chosen one.
    pub fn to_revoke(&self) -> Vec<PeerRef> {
        self.grants
            .iter()
            .filter(|g| self.chosen.as_ref().is_none_or(|c| c.id != g.id))
            .cloned()
            .collect()
    }

    fn forget_peer(&mut self, peer: PeerId) {
        self.grants.retain(|g| g.id != peer);
    }

    fn uploading_to(&self, peer: PeerId) -> bool {
        self.revoked && self.chosen.as_ref().is_some_and(|c| c.id == peer)
    }

    fn reset_for_retry(&mut self, retry_at: Option<Instant>) {
        self.requested = false;
        self.revoked = false;
        self.grants.clear();
        self.window_start = None;
        self.chosen = None;
        self.attempt = self.attempt.saturating_add(1);
        self.retry_at = retry_at;
    }
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub grant_window: Duration,
    /// Zero-grant rounds tolerated before an archive is dropped.
    pub max_attempts: u32,
    pub retry_backoff: Duration,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UploadRound {
    pub requested: usize,
    pub transfers: usize,
    pub retried: usize,
    pub dropped: usize,
}

/// Per-archive upload permission negotiation.
#[derive(Debug)]
pub struct UploadNegotiator {
    cfg: UploadConfig,
    files: BTreeMap<PathBuf, PendingUpload>,
}

impl UploadNegotiator {
    pub fn new(cfg: UploadConfig) -> Self {
        Self {
            cfg,
            files: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn get(&self, path: &Path) -> Option<&PendingUpload> {
        self.files.get(path)
    }

    /// Starts tracking an archive reported by a worker. Returns false if it is already tracked
    /// or its size cannot be read.
    pub fn track(&mut self, job: JobId, path: PathBuf) -> bool {
        if self.files.contains_key(&path) {
            return false;
        }
        let size = match std::fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(err) => {
                tracing::warn!(%job, path = %path.display(), error = %err, "cannot stat archive; not uploading");
                return false;
            }
        };
        // Only this process uploads from the data dir, so a marker here is left over from a crash.
        remove_marker(&path);
        tracing::debug!(%job, path = %path.display(), size, "archive queued for upload");
        self.files
            .insert(path.clone(), PendingUpload::new(job, path, size));
        true
    }

    pub fn grant(&mut self, path: &Path, peer: PeerRef, now: Instant) -> GrantOutcome {
        match self.files.get_mut(path) {
            Some(file) => file.grant(peer, now),
            None => GrantOutcome::Ignored,
        }
    }

    /// Discards grants from a peer that went away. Archives that were being transferred to it
    /// lose their in-flight marker and are requested again, or dropped once out of attempts.
    pub fn forget_peer(&mut self, peer: PeerId) -> UploadRound {
        let mut round = UploadRound::default();
        let mut drop_paths = Vec::new();
        for (path, file) in self.files.iter_mut() {
            if !file.uploading_to(peer) {
                if !file.revoked {
                    file.forget_peer(peer);
                }
                continue;
            }
            remove_marker(path);
            if file.attempt + 1 >= self.cfg.max_attempts {
                tracing::warn!(job = %file.job, path = %path.display(), %peer, "uploader went away; giving up");
                drop_paths.push(path.clone());
                round.dropped += 1;
            } else {
                tracing::info!(job = %file.job, path = %path.display(), %peer, "uploader went away; requesting again");
                file.reset_for_retry(None);
                round.retried += 1;
            }
        }
        for path in drop_paths {
            self.files.remove(&path);
        }
        round
    }

    /// One negotiation step for every tracked archive.
    pub fn progress(
        &mut self,
        transport: &mut impl Transport,
        jobs: &JobTracker,
        now: Instant,
    ) -> UploadRound {
        let mut round = UploadRound::default();
        let mut drop_paths = Vec::new();

        for (path, file) in self.files.iter_mut() {
            if file.retry_at.is_some_and(|at| now < at) {
                continue;
            }

            if !file.requested {
                let Some(stagers) = jobs.stagers(&file.job) else {
                    tracing::warn!(job = %file.job, path = %path.display(), "archive for unknown job; dropping");
                    drop_paths.push(path.clone());
                    continue;
                };
                if stagers.is_empty() {
                    continue;
                }
                for stager in stagers {
                    transport.send_or_log(
                        stager.id,
                        OutboundMessage::RequestUploadPermission {
                            job: file.job.clone(),
                            path: path.clone(),
                            size: file.size,
                        },
                    );
                }
                file.requested = true;
                file.retry_at = None;
                round.requested += 1;
                continue;
            }

            match file.choice(now, self.cfg.grant_window) {
                UploadChoice::Undecided => {}
                UploadChoice::Rejected => {
                    if file.attempt + 1 >= self.cfg.max_attempts {
                        tracing::warn!(
                            job = %file.job,
                            path = %path.display(),
                            attempts = file.attempt + 1,
                            "no stager granted upload; giving up"
                        );
                        drop_paths.push(path.clone());
                        round.dropped += 1;
                    } else {
                        let backoff = self.cfg.retry_backoff.saturating_mul(1u32 << file.attempt.min(16));
                        tracing::info!(
                            job = %file.job,
                            path = %path.display(),
                            retry_in_secs = backoff.as_secs(),
                            "no stager granted upload; retrying later"
                        );
                        file.reset_for_retry(Some(now + backoff));
                        round.retried += 1;
                    }
                }
                UploadChoice::Chosen(chosen) => {
                    if file.revoked {
                        continue;
                    }
                    for peer in file.to_revoke() {
                        transport.send_or_log(
                            peer.id,
                            OutboundMessage::RequestUploadRevoke {
                                job: file.job.clone(),
                                path: path.clone(),
                            },
                        );
                    }
                    file.revoked = true;
                    match start_transfer(transport, &chosen, &file.job, path) {
                        TransferStart::Started => {
                            tracing::info!(job = %file.job, path = %path.display(), to = %chosen.addr, "uploading archive");
                            round.transfers += 1;
                        }
                        TransferStart::AlreadyInFlight => {}
                        TransferStart::Failed if file.attempt + 1 >= self.cfg.max_attempts => {
                            drop_paths.push(path.clone());
                            round.dropped += 1;
                        }
                        TransferStart::Failed => {
                            file.reset_for_retry(None);
                            round.retried += 1;
                        }
                    }
                }
            }
        }

        for path in drop_paths {
            self.files.remove(&path);
        }
        round
    }

    /// Stager confirmed receipt: forget the archive and delete it with its in-flight marker.
    /// Untracked paths are left alone.
    pub fn confirm_received(&mut self, job: &JobId, path: &Path) -> bool {
        match self.files.get(path) {
            Some(file) if &file.job == job => {}
            _ => return false,
        }
        self.files.remove(path);
        for p in [path.to_path_buf(), in_flight_marker(path)] {
            if let Err(err) = std::fs::remove_file(&p)
                && err.kind() != std::io::ErrorKind::NotFound
            {
                tracing::warn!(path = %p.display(), error = %err, "failed removing uploaded archive");
            }
        }
        tracing::info!(%job, path = %path.display(), "archive upload confirmed");
        true
    }
}

fn remove_marker(path: &Path) {
    let marker = in_flight_marker(path);
    if let Err(err) = std::fs::remove_file(&marker)
        && err.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(path = %marker.display(), error = %err, "failed removing in-flight marker");
    }
}

pub fn in_flight_marker(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(IN_FLIGHT_SUFFIX);
    PathBuf::from(name)
}

/// Sends the archive unless a transfer is already in flight for it.
pub fn start_transfer(
    transport: &mut impl Transport,
    to: &PeerRef,
    job: &JobId,
    path: &Path,
) -> TransferStart {
    let marker = in_flight_marker(path);
    match OpenOptions::new().write(true).create_new(true).open(&marker) {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            return TransferStart::AlreadyInFlight;
        }
        Err(err) => {
            tracing::warn!(path = %marker.display(), error = %err, "failed creating in-flight marker");
            return TransferStart::Failed;
        }
    }
    if let Err(err) = transport.send_file(to.id, job, path) {
        tracing::warn!(%job, path = %path.display(), to = %to.addr, error = %err, "failed queueing archive transfer");
        let _ = std::fs::remove_file(&marker);
        return TransferStart::Failed;
    }
    TransferStart::Started
}
