use crate::protocol::{JobId, PeerAddr};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Messages a stager sends to this crawler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InboundMessage {
    Ping,
    Pong,
    /// Handshake ack; stage 0 is answered with our own `CONFIRMED(1)`.
    Confirmed {
        stage: u8,
    },
    AlreadyConfirmed,
    NewJobCrawl {
        job: JobId,
    },
    JobUrlCrawl {
        job: JobId,
        url: String,
    },
    JobStartCrawl {
        job: JobId,
    },
    AssignedUrlQuota {
        job: JobId,
        amount: u64,
    },
    UploadPermissionGranted {
        job: JobId,
        path: PathBuf,
    },
    UploadPermissionDenied {
        job: JobId,
        path: PathBuf,
    },
    WarcFileReceived {
        job: JobId,
        path: PathBuf,
    },
    AddStager {
        address: PeerAddr,
    },
}

impl InboundMessage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::Confirmed { .. } => "CONFIRMED",
            Self::AlreadyConfirmed => "ALREADY_CONFIRMED",
            Self::NewJobCrawl { .. } => "NEW_JOB_CRAWL",
            Self::JobUrlCrawl { .. } => "JOB_URL_CRAWL",
            Self::JobStartCrawl { .. } => "JOB_START_CRAWL",
            Self::AssignedUrlQuota { .. } => "ASSIGNED_URL_QUOTA",
            Self::UploadPermissionGranted { .. } => "UPLOAD_PERMISSION_GRANTED",
            Self::UploadPermissionDenied { .. } => "UPLOAD_PERMISSION_DENIED",
            Self::WarcFileReceived { .. } => "WARC_FILE_RECEIVED",
            Self::AddStager { .. } => "ADD_STAGER",
        }
    }
}

/// Messages this crawler sends to stagers.
///
/// `WarcFile` is only the header of a file transfer; the transport writes `size` raw bytes
/// right after it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboundMessage {
    AnnounceCrawler {
        address: PeerAddr,
    },
    AnnounceCrawlerExtra {
        address: PeerAddr,
    },
    RequestStager {
        count: usize,
        known: Vec<PeerAddr>,
    },
    Ping,
    Pong,
    Confirmed {
        stage: u8,
    },
    RequestUploadPermission {
        job: JobId,
        path: PathBuf,
        size: u64,
    },
    RequestUploadRevoke {
        job: JobId,
        path: PathBuf,
    },
    WarcFile {
        job: JobId,
        path: PathBuf,
        size: u64,
    },
    JobCrawlConfirmed {
        job: JobId,
    },
    JobStartedCrawl {
        job: JobId,
    },
    JobUrlFinished {
        job: JobId,
        url: String,
        owner: PeerAddr,
    },
    JobUrlDiscovered {
        job: JobId,
        parent: String,
        url: String,
    },
    RequestUrlQuota {
        job: JobId,
    },
}

impl OutboundMessage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AnnounceCrawler { .. } => "ANNOUNCE_CRAWLER",
            Self::AnnounceCrawlerExtra { .. } => "ANNOUNCE_CRAWLER_EXTRA",
            Self::RequestStager { .. } => "REQUEST_STAGER",
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::Confirmed { .. } => "CONFIRMED",
            Self::RequestUploadPermission { .. } => "REQUEST_UPLOAD_PERMISSION",
            Self::RequestUploadRevoke { .. } => "REQUEST_UPLOAD_REVOKE",
            Self::WarcFile { .. } => "WARC_FILE",
            Self::JobCrawlConfirmed { .. } => "JOB_CRAWL_CONFIRMED",
            Self::JobStartedCrawl { .. } => "JOB_STARTED_CRAWL",
            Self::JobUrlFinished { .. } => "JOB_URL_FINISHED",
            Self::JobUrlDiscovered { .. } => "JOB_URL_DISCOVERED",
            Self::RequestUrlQuota { .. } => "REQUEST_URL_QUOTA",
        }
    }
}
