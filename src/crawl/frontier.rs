use crate::crawl::CrawlEngine;
use crate::protocol::JobId;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct JobFrontier {
    started: bool,
    budget: u64,
    pending: VecDeque<String>,
    // Mirror of `pending` for O(1) duplicate checks.
    queued: HashSet<String>,
    in_flight: usize,
}

#[derive(Debug, Default)]
struct FrontierState {
    jobs: BTreeMap<JobId, JobFrontier>,
    // Last job served, so workers rotate across jobs.
    cursor: Option<JobId>,
}

/// In-process crawl engine state shared between the coordinator and crawl workers.
///
/// The coordinator feeds URLs and quota in; workers pull with [`Frontier::next_url`] and call
/// [`Frontier::mark_done`] once the URL has been reported back.
#[derive(Debug, Clone, Default)]
pub struct Frontier {
    inner: Arc<Mutex<FrontierState>>,
}

impl Frontier {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FrontierState> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("frontier lock poisoned; continuing with recovered state");
                poisoned.into_inner()
            }
        }
    }

    /// Next URL of a started job that still has budget, rotating across jobs.
    pub fn next_url(&self) -> Option<(JobId, String)> {
        let mut state = self.lock();
        let after = state.cursor.clone();
        let ready = |j: &JobFrontier| j.started && j.budget > 0 && !j.pending.is_empty();

        let pick = match &after {
            Some(cursor) => state
                .jobs
                .range::<JobId, _>((
                    std::ops::Bound::Excluded(cursor),
                    std::ops::Bound::Unbounded,
                ))
                .chain(state.jobs.range::<JobId, _>(..=cursor))
                .find(|(_, j)| ready(j))
                .map(|(id, _)| id.clone()),
            None => state
                .jobs
                .iter()
                .find(|(_, j)| ready(j))
                .map(|(id, _)| id.clone()),
        }?;

        let job = state.jobs.get_mut(&pick)?;
        let url = job.pending.pop_front()?;
        job.queued.remove(&url);
        job.budget -= 1;
        job.in_flight += 1;
        state.cursor = Some(pick.clone());
        Some((pick, url))
    }

    pub fn mark_done(&self, job: &JobId) {
        if let Some(j) = self.lock().jobs.get_mut(job) {
            j.in_flight = j.in_flight.saturating_sub(1);
        }
    }

    pub fn pending_len(&self, job: &JobId) -> usize {
        self.lock().jobs.get(job).map_or(0, |j| j.pending.len())
    }

    pub fn budget(&self, job: &JobId) -> u64 {
        self.lock().jobs.get(job).map_or(0, |j| j.budget)
    }
}

impl CrawlEngine for Frontier {
    fn register(&mut self, job: &JobId) {
        self.lock().jobs.entry(job.clone()).or_default();
    }

    fn start(&mut self, job: &JobId) {
        self.lock().jobs.entry(job.clone()).or_default().started = true;
    }

    fn add_url(&mut self, job: &JobId, url: &str) {
        let mut state = self.lock();
        let j = state.jobs.entry(job.clone()).or_default();
        if j.queued.insert(url.to_string()) {
            j.pending.push_back(url.to_string());
        }
    }

    fn increase_quota(&mut self, job: &JobId, amount: u64) {
        let mut state = self.lock();
        let j = state.jobs.entry(job.clone()).or_default();
        j.budget = j.budget.saturating_add(amount);
    }

    fn is_running(&self, job: &JobId) -> bool {
        self.lock().jobs.get(job).is_some_and(|j| j.in_flight > 0)
    }
}
