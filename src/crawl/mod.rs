//! Seam between the coordinator and the crawl engine that actually fetches pages.

pub mod frontier;

pub use frontier::Frontier;

use crate::protocol::JobId;

pub trait CrawlEngine: Send {
    fn register(&mut self, job: &JobId);

    /// Lets the job's queued URLs be handed to workers.
    fn start(&mut self, job: &JobId);

    fn add_url(&mut self, job: &JobId, url: &str);

    fn increase_quota(&mut self, job: &JobId, amount: u64);

    /// True if workers are currently processing URLs of this job.
    fn is_running(&self, job: &JobId) -> bool;
}
