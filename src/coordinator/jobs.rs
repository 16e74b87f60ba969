use crate::coordinator::peers::PeerRef;
use crate::coordinator::random_index;
use crate::crawl::CrawlEngine;
use crate::dedup::{DedupError, DedupOpener, DedupStore};
use crate::net::PeerId;
use crate::protocol::JobId;
use std::collections::{BTreeMap, HashMap};
use tokio::time::Instant;

pub struct Job {
    pub id: JobId,
    stagers: Vec<PeerRef>,
    started: bool,
    last_quota_request: Instant,
    quota_received: u64,
    // url -> stager to credit when the url finishes
    owners: HashMap<String, PeerRef>,
    dedup: Box<dyn DedupStore>,
}

impl Job {
    pub fn stagers(&self) -> &[PeerRef] {
        &self.stagers
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn last_quota_request(&self) -> Instant {
        self.last_quota_request
    }

    pub fn quota_received(&self) -> u64 {
        self.quota_received
    }

    pub fn owned_urls(&self) -> usize {
        self.owners.len()
    }

    pub fn finished_urls(&self) -> usize {
        self.dedup.len()
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("stagers", &self.stagers)
            .field("started", &self.started)
            .field("owned_urls", &self.owners.len())
            .field("finished_urls", &self.dedup.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateJob {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishUrl {
    /// Stored, or already stored before.
    Recorded,
    UnknownJob,
    /// The dedup store failed; the url is not remembered as finished.
    NotRecorded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddUrl {
    Queued,
    AlreadyFinished,
    UnknownJob,
}

/// Per-job lifecycle, URL ownership and quota bookkeeping.
pub struct JobTracker {
    jobs: BTreeMap<JobId, Job>,
    opener: Box<dyn DedupOpener>,
    engine: Box<dyn CrawlEngine>,
}

impl JobTracker {
    pub fn new(opener: Box<dyn DedupOpener>, engine: Box<dyn CrawlEngine>) -> Self {
        Self {
            jobs: BTreeMap::new(),
            opener,
            engine,
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.jobs.contains_key(id)
    }

    pub fn get(&self, id: &JobId) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn create_job(&mut self, id: &JobId, now: Instant) -> Result<CreateJob, DedupError> {
        if self.jobs.contains_key(id) {
            return Ok(CreateJob::AlreadyExists);
        }
        let dedup = self.opener.open(id)?;
        self.engine.register(id);
        tracing::info!(job = %id, finished_urls = dedup.len(), "job created");
        self.jobs.insert(
            id.clone(),
            Job {
                id: id.clone(),
                stagers: Vec::new(),
                started: false,
                last_quota_request: now,
                quota_received: 0,
                owners: HashMap::new(),
                dedup,
            },
        );
        Ok(CreateJob::Created)
    }

    /// Returns false if the job is unknown or already started.
    pub fn start_job(&mut self, id: &JobId) -> bool {
        if !self.jobs.contains_key(id) || self.is_started(id) {
            return false;
        }
        let Some(job) = self.jobs.get_mut(id) else {
            return false;
        };
        job.started = true;
        self.engine.start(id);
        tracing::info!(job = %id, "job started");
        true
    }

    /// True if explicitly started, or if the crawl engine is still working on the job.
    pub fn is_started(&self, id: &JobId) -> bool {
        match self.jobs.get(id) {
            Some(job) => job.started || self.engine.is_running(id),
            None => false,
        }
    }

    /// Returns false for an unknown job.
    pub fn add_stager(&mut self, id: &JobId, peer: PeerRef) -> bool {
        let Some(job) = self.jobs.get_mut(id) else {
            return false;
        };
        if !job.stagers.iter().any(|s| s.id == peer.id) {
            tracing::debug!(job = %id, peer = %peer.id, addr = %peer.addr, "job stager added");
            job.stagers.push(peer);
        }
        true
    }

    pub fn add_url(&mut self, id: &JobId, peer: PeerRef, url: &str) -> AddUrl {
        let Some(job) = self.jobs.get_mut(id) else {
            return AddUrl::UnknownJob;
        };
        if job.dedup.has(url) {
            return AddUrl::AlreadyFinished;
        }
        job.owners.insert(url.to_string(), peer);
        self.engine.add_url(id, url);
        AddUrl::Queued
    }

    /// Returns false for an unknown job.
    pub fn increase_quota(&mut self, id: &JobId, amount: u64, now: Instant) -> bool {
        let Some(job) = self.jobs.get_mut(id) else {
            return false;
        };
        job.last_quota_request = now;
        job.quota_received = job.quota_received.saturating_add(amount);
        self.engine.increase_quota(id, amount);
        true
    }

    /// Records `url` as finished. Duplicates are absorbed by the store.
    pub fn finished_url(&mut self, id: &JobId, url: &str) -> FinishUrl {
        let Some(job) = self.jobs.get_mut(id) else {
            return FinishUrl::UnknownJob;
        };
        match job.dedup.insert(url) {
            Ok(_) => FinishUrl::Recorded,
            Err(err) => {
                tracing::warn!(
                    job = %id,
                    url = %crate::logging::short_url(url),
                    error = %err,
                    "failed recording finished url"
                );
                FinishUrl::NotRecorded
            }
        }
    }

    pub fn archived_url(&self, id: &JobId, url: &str) -> bool {
        self.jobs.get(id).is_some_and(|job| job.dedup.has(url))
    }

    pub fn owner_of(&self, id: &JobId, url: &str) -> Option<&PeerRef> {
        self.jobs.get(id)?.owners.get(url)
    }

    pub fn forget_owner(&mut self, id: &JobId, url: &str) -> Option<PeerRef> {
        self.jobs.get_mut(id)?.owners.remove(url)
    }

    pub fn stagers(&self, id: &JobId) -> Option<&[PeerRef]> {
        self.jobs.get(id).map(|job| job.stagers.as_slice())
    }

    pub fn random_stager(&self, id: &JobId) -> Option<&PeerRef> {
        let stagers = &self.jobs.get(id)?.stagers;
        stagers.get(random_index(stagers.len())?)
    }

    /// Job with the oldest quota timestamp among jobs that still have a stager to ask.
    pub fn stalest_job(&self) -> Option<&JobId> {
        self.jobs
            .values()
            .filter(|job| !job.stagers.is_empty())
            .min_by_key(|job| job.last_quota_request)
            .map(|job| &job.id)
    }

    /// Drops a disconnected stager from every job. Ownership entries keep its address so finish
    /// reports still credit it.
    pub fn remove_stager(&mut self, peer: PeerId) {
        for job in self.jobs.values_mut() {
            job.stagers.retain(|s| s.id != peer);
        }
    }
}
