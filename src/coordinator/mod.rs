//! Crawler-side coordination of stagers, jobs and archive uploads.
//!
//! [`Coordinator`] owns all negotiation state. It is driven from a single task: [`Coordinator::tick`]
//! on a fixed period and [`Coordinator::handle_event`] for every inbound transport event. Crawl
//! workers only ever touch the intake queues through an [`IntakeHandle`].

pub mod intake;
pub mod jobs;
pub mod peers;
pub mod upload;

mod inbound;
#[cfg(test)]
mod tests;

pub use intake::{FinishedReport, IntakeHandle, IntakeQueues};
pub use jobs::{AddUrl, CreateJob, FinishUrl, Job, JobTracker};
pub use peers::{AddStager, PeerHandle, PeerRef, PeerRegistry, PeerRegistryConfig, PongOutcome};
pub use upload::{
    GrantOutcome, PendingUpload, TransferStart, UploadChoice, UploadConfig, UploadNegotiator,
    UploadRound,
};

use crate::crawl::CrawlEngine;
use crate::dedup::DedupOpener;
use crate::net::{PeerId, Transport};
use crate::protocol::{JobId, OutboundMessage, PeerAddr};
use peers::elapsed;
use std::collections::HashMap;
use tokio::time::{Duration, Instant};

const DRAIN_WARN_EVERY: Duration = Duration::from_secs(30);
/// Drains a finished url may stay queued while its dedup store keeps failing.
const MAX_FINISH_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub peers: PeerRegistryConfig,
    pub upload: UploadConfig,
    pub url_quota_every: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorStatus {
    pub ticks: u64,
    pub peers: usize,
    pub confirmed_peers: usize,
    pub jobs: usize,
    pub started_jobs: usize,
    pub owned_urls: usize,
    pub pending_uploads: usize,
    pub intake_archives: usize,
    pub intake_finished: usize,
    pub intake_discovered: usize,
}

pub struct Coordinator<T: Transport> {
    transport: T,
    peers: PeerRegistry,
    jobs: JobTracker,
    uploads: UploadNegotiator,
    intake: IntakeQueues,
    url_quota_every: Duration,
    last_quota_request: Option<Instant>,
    finish_failures: HashMap<FinishedReport, u32>,
    ticks: u64,
}

impl<T: Transport> Coordinator<T> {
    pub fn new(
        cfg: CoordinatorConfig,
        transport: T,
        opener: Box<dyn DedupOpener>,
        engine: Box<dyn CrawlEngine>,
    ) -> Self {
        Self {
            transport,
            peers: PeerRegistry::new(cfg.peers),
            jobs: JobTracker::new(opener, engine),
            uploads: UploadNegotiator::new(cfg.upload),
            intake: IntakeQueues::new(),
            url_quota_every: cfg.url_quota_every,
            last_quota_request: None,
            finish_failures: HashMap::new(),
            ticks: 0,
        }
    }

    pub fn intake_handle(&self) -> IntakeHandle {
        self.intake.handle()
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    pub fn jobs(&self) -> &JobTracker {
        &self.jobs
    }

    pub fn uploads(&self) -> &UploadNegotiator {
        &self.uploads
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Returns `None` if the connection could not even be queued.
    pub fn add_stager(&mut self, addr: &PeerAddr, extra: bool, now: Instant) -> Option<AddStager> {
        match self.peers.add_stager(&mut self.transport, addr, extra, now) {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                tracing::warn!(addr = %addr, error = %err, "failed adding stager");
                None
            }
        }
    }

    pub fn create_job(&mut self, id: &JobId, now: Instant) -> bool {
        match self.jobs.create_job(id, now) {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(job = %id, error = %err, "failed opening job dedup store");
                false
            }
        }
    }

    pub fn start_job(&mut self, id: &JobId) -> bool {
        self.jobs.start_job(id)
    }

    /// Removes a stager everywhere it is referenced and closes its connection.
    pub fn drop_peer(&mut self, id: PeerId) {
        let Some(peer) = self.peers.remove(id) else {
            return;
        };
        self.jobs.remove_stager(id);
        let uploads = self.uploads.forget_peer(id);
        self.transport.close(id);
        tracing::info!(
            peer = %id,
            addr = %peer.addr,
            remaining = self.peers.len(),
            uploads_retried = uploads.retried,
            uploads_dropped = uploads.dropped,
            "stager dropped"
        );
    }

    /// One scheduling round. Phase order is fixed: peer maintenance, liveness, uploads,
    /// finished urls, discovered urls, quota.
    pub fn tick(&mut self, now: Instant) {
        self.ticks += 1;
        self.peers.maintain_count(&mut self.transport, now);
        self.check_liveness(now);
        self.progress_uploads(now);
        self.drain_finished();
        self.drain_discovered();
        self.request_quota(now);
    }

    fn check_liveness(&mut self, now: Instant) {
        if !self.peers.ping_due(now) {
            return;
        }
        for id in self.peers.sweep_unresponsive() {
            self.drop_peer(id);
        }
        self.peers.ping_all(&mut self.transport, now);
    }

    fn progress_uploads(&mut self, now: Instant) {
        for report in self.intake.drain_archives() {
            self.uploads.track(report.job, report.path);
        }
        let round = self.uploads.progress(&mut self.transport, &self.jobs, now);
        if round != UploadRound::default() {
            tracing::debug!(
                requested = round.requested,
                transfers = round.transfers,
                retried = round.retried,
                dropped = round.dropped,
                "upload round"
            );
        }
    }

    fn drain_finished(&mut self) {
        for report in self.intake.drain_finished() {
            match self.jobs.finished_url(&report.job, &report.url) {
                FinishUrl::Recorded => {
                    self.finish_failures.remove(&report);
                }
                FinishUrl::UnknownJob => {
                    if crate::logging::warn_throttled("finished_url_unknown_job", DRAIN_WARN_EVERY) {
                        tracing::warn!(job = %report.job, url = %crate::logging::short_url(&report.url), "finished url for unknown job");
                    }
                    continue;
                }
                FinishUrl::NotRecorded => {
                    self.retry_finished(report);
                    continue;
                }
            }
            let (job, url) = (report.job, report.url);
            let Some(owner) = self.jobs.owner_of(&job, &url).cloned() else {
                tracing::debug!(%job, url = %crate::logging::short_url(&url), "finished url has no owner; not reporting");
                continue;
            };
            let stagers = self.jobs.stagers(&job).unwrap_or_default().to_vec();
            for stager in &stagers {
                self.transport.send_or_log(
                    stager.id,
                    OutboundMessage::JobUrlFinished {
                        job: job.clone(),
                        url: url.clone(),
                        owner: owner.addr.clone(),
                    },
                );
            }
            self.jobs.forget_owner(&job, &url);
            tracing::trace!(%job, url = %crate::logging::short_url(&url), owner = %owner.addr, stagers = stagers.len(), "url finished");
        }
    }

    // Not reported and still owned until the store takes it, so `archived_url` holds for every
    // url a stager was told about.
    fn retry_finished(&mut self, report: FinishedReport) {
        let attempts = self.finish_failures.entry(report.clone()).or_insert(0);
        *attempts += 1;
        if *attempts < MAX_FINISH_ATTEMPTS {
            self.intake.requeue_finished(report);
            return;
        }
        self.finish_failures.remove(&report);
        self.jobs.forget_owner(&report.job, &report.url);
        tracing::warn!(
            job = %report.job,
            url = %crate::logging::short_url(&report.url),
            attempts = MAX_FINISH_ATTEMPTS,
            "giving up on finished url that cannot be recorded"
        );
    }

    fn drain_discovered(&mut self) {
        for report in self.intake.drain_discovered() {
            if !self.jobs.contains(&report.job) {
                if crate::logging::warn_throttled("discovered_url_unknown_job", DRAIN_WARN_EVERY) {
                    tracing::warn!(job = %report.job, "discovered url for unknown job");
                }
                continue;
            }
            if self.jobs.archived_url(&report.job, &report.url) {
                continue;
            }
            let Some(stager) = self.jobs.random_stager(&report.job).map(|s| s.id) else {
                if crate::logging::warn_throttled("discovered_url_no_stager", DRAIN_WARN_EVERY) {
                    tracing::warn!(job = %report.job, "discovered url but job has no stager");
                }
                continue;
            };
            self.transport.send_or_log(
                stager,
                OutboundMessage::JobUrlDiscovered {
                    job: report.job,
                    parent: report.parent,
                    url: report.url,
                },
            );
        }
    }

    fn request_quota(&mut self, now: Instant) {
        if !elapsed(self.last_quota_request, now, self.url_quota_every) {
            return;
        }
        self.last_quota_request = Some(now);
        let Some(job) = self.jobs.stalest_job().cloned() else {
            return;
        };
        let Some(stager) = self.jobs.random_stager(&job).map(|s| s.id) else {
            return;
        };
        tracing::debug!(%job, peer = %stager, "requesting url quota");
        self.transport
            .send_or_log(stager, OutboundMessage::RequestUrlQuota { job });
    }

    pub fn status(&self) -> CoordinatorStatus {
        let (intake_archives, intake_finished, intake_discovered) = self.intake.backlog();
        CoordinatorStatus {
            ticks: self.ticks,
            peers: self.peers.len(),
            confirmed_peers: self.peers.confirmed_count(),
            jobs: self.jobs.len(),
            started_jobs: self
                .jobs
                .iter()
                .filter(|j| self.jobs.is_started(&j.id))
                .count(),
            owned_urls: self.jobs.iter().map(Job::owned_urls).sum(),
            pending_uploads: self.uploads.len(),
            intake_archives,
            intake_finished,
            intake_discovered,
        }
    }
}

/// Uniform index in `0..len`, `None` when `len == 0`.
pub(crate) fn random_index(len: usize) -> Option<usize> {
    if len == 0 {
        return None;
    }
    let mut b = [0u8; 8];
    let _ = getrandom::getrandom(&mut b);
    Some((u64::from_le_bytes(b) % len as u64) as usize)
}
