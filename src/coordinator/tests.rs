use super::*;
use crate::crawl::Frontier;
use crate::dedup::{DedupError, DedupStore, MemoryDedupOpener};
use crate::net::{InboundEvent, PeerEventKind};
use crate::protocol::InboundMessage;
use std::path::{Path, PathBuf};

#[derive(Debug, Default)]
struct RecordingTransport {
    next_id: u64,
    sent: Vec<(PeerId, OutboundMessage)>,
    files: Vec<(PeerId, JobId, PathBuf)>,
    closed: Vec<PeerId>,
    dialed: Vec<PeerAddr>,
}

impl RecordingTransport {
    fn take(&mut self) -> Vec<(PeerId, OutboundMessage)> {
        std::mem::take(&mut self.sent)
    }
}

impl Transport for RecordingTransport {
    fn connect(&mut self, addr: &PeerAddr) -> crate::net::Result<PeerId> {
        self.next_id += 1;
        self.dialed.push(addr.clone());
        Ok(PeerId(self.next_id))
    }

    fn send(&mut self, peer: PeerId, msg: OutboundMessage) -> crate::net::Result<()> {
        self.sent.push((peer, msg));
        Ok(())
    }

    fn send_file(&mut self, peer: PeerId, job: &JobId, path: &Path) -> crate::net::Result<()> {
        self.files.push((peer, job.clone(), path.to_path_buf()));
        Ok(())
    }

    fn close(&mut self, peer: PeerId) {
        self.closed.push(peer);
    }
}

/// Dedup store whose every insert fails, like a full disk.
struct RejectingStore;

impl DedupStore for RejectingStore {
    fn insert(&mut self, key: &str) -> crate::dedup::Result<bool> {
        Err(DedupError::InvalidKey(key.to_string()))
    }

    fn has(&self, _key: &str) -> bool {
        false
    }

    fn len(&self) -> usize {
        0
    }
}

struct RejectingOpener;

impl DedupOpener for RejectingOpener {
    fn open(&self, _job: &JobId) -> crate::dedup::Result<Box<dyn DedupStore>> {
        Ok(Box::new(RejectingStore))
    }
}

const WINDOW: Duration = Duration::from_secs(10);

fn config(seeds: Vec<PeerAddr>) -> CoordinatorConfig {
    CoordinatorConfig {
        peers: PeerRegistryConfig {
            advertise_addr: PeerAddr::new("127.0.0.1:4100"),
            seed_stagers: seeds,
            max_stagers: 2,
            request_stager_every: Duration::from_secs(30),
            ping_every: Duration::from_secs(60),
            max_missed_pongs: 2,
        },
        upload: UploadConfig {
            grant_window: WINDOW,
            max_attempts: 2,
            retry_backoff: Duration::from_secs(30),
        },
        url_quota_every: Duration::from_secs(30),
    }
}

fn coordinator() -> (Coordinator<RecordingTransport>, Frontier) {
    let frontier = Frontier::new();
    let coord = Coordinator::new(
        config(Vec::new()),
        RecordingTransport::default(),
        Box::new(MemoryDedupOpener),
        Box::new(frontier.clone()),
    );
    (coord, frontier)
}

fn add(coord: &mut Coordinator<RecordingTransport>, addr: &str, now: Instant) -> PeerId {
    match coord.add_stager(&PeerAddr::new(addr), false, now) {
        Some(AddStager::Added(id)) => id,
        other => panic!("unexpected add_stager outcome: {other:?}"),
    }
}

fn deliver(
    coord: &mut Coordinator<RecordingTransport>,
    peer: PeerId,
    msg: InboundMessage,
    now: Instant,
) {
    coord.handle_event(
        InboundEvent {
            peer,
            kind: PeerEventKind::Message(msg),
        },
        now,
    );
}

fn job_with_stagers(
    coord: &mut Coordinator<RecordingTransport>,
    job: &str,
    stagers: &[PeerId],
    now: Instant,
) -> JobId {
    let id = JobId::new(job);
    for s in stagers {
        deliver(coord, *s, InboundMessage::NewJobCrawl { job: id.clone() }, now);
    }
    coord.transport_mut().take();
    id
}

fn count<F: Fn(&OutboundMessage) -> bool>(sent: &[(PeerId, OutboundMessage)], f: F) -> usize {
    sent.iter().filter(|(_, m)| f(m)).count()
}

fn temp_dir(tag: &str) -> PathBuf {
    let mut p = std::env::temp_dir();
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    p.push(format!("stager-link-coord-{tag}-{nanos}"));
    std::fs::create_dir_all(&p).expect("mkdir");
    p
}

#[test]
fn add_stager_is_idempotent_and_announces() {
    let (mut coord, _) = coordinator();
    let now = Instant::now();
    let id = add(&mut coord, "10.0.0.1:4000", now);

    assert_eq!(
        coord.add_stager(&PeerAddr::new("10.0.0.1:4000"), true, now),
        Some(AddStager::AlreadyPresent)
    );
    assert_eq!(coord.peers().len(), 1);

    let extra = match coord.add_stager(&PeerAddr::new("10.0.0.2:4000"), true, now) {
        Some(AddStager::Added(id)) => id,
        other => panic!("unexpected {other:?}"),
    };
    let sent = coord.transport_mut().take();
    assert_eq!(
        sent,
        vec![
            (
                id,
                OutboundMessage::AnnounceCrawler {
                    address: PeerAddr::new("127.0.0.1:4100")
                }
            ),
            (
                extra,
                OutboundMessage::AnnounceCrawlerExtra {
                    address: PeerAddr::new("127.0.0.1:4100")
                }
            ),
        ]
    );
}

#[test]
fn new_job_crawl_twice_keeps_one_job_and_one_stager() {
    let (mut coord, _) = coordinator();
    let now = Instant::now();
    let s1 = add(&mut coord, "10.0.0.1:4000", now);
    coord.transport_mut().take();

    let job = JobId::new("A");
    deliver(&mut coord, s1, InboundMessage::NewJobCrawl { job: job.clone() }, now);
    deliver(&mut coord, s1, InboundMessage::NewJobCrawl { job: job.clone() }, now);

    assert_eq!(coord.jobs().len(), 1);
    assert_eq!(coord.jobs().stagers(&job).map(<[PeerRef]>::len), Some(1));
    let sent = coord.transport_mut().take();
    assert_eq!(
        count(&sent, |m| matches!(m, OutboundMessage::JobCrawlConfirmed { .. })),
        2
    );

    deliver(&mut coord, s1, InboundMessage::JobStartCrawl { job: job.clone() }, now);
    deliver(&mut coord, s1, InboundMessage::JobStartCrawl { job: job.clone() }, now);
    assert!(coord.jobs().is_started(&job));
    let sent = coord.transport_mut().take();
    assert_eq!(
        count(&sent, |m| matches!(m, OutboundMessage::JobStartedCrawl { .. })),
        2
    );
}

#[test]
fn start_for_unknown_job_is_not_acked() {
    let (mut coord, _) = coordinator();
    let now = Instant::now();
    let s1 = add(&mut coord, "10.0.0.1:4000", now);
    coord.transport_mut().take();

    deliver(
        &mut coord,
        s1,
        InboundMessage::JobStartCrawl {
            job: JobId::new("nope"),
        },
        now,
    );
    assert!(coord.transport_mut().take().is_empty());
}

#[test]
fn finished_url_is_reported_with_owner_and_forgotten() {
    let (mut coord, _) = coordinator();
    let t0 = Instant::now();
    let p1 = add(&mut coord, "10.0.0.1:4000", t0);
    let job = job_with_stagers(&mut coord, "A", &[p1], t0);

    deliver(
        &mut coord,
        p1,
        InboundMessage::JobUrlCrawl {
            job: job.clone(),
            url: "http://x".to_string(),
        },
        t0,
    );
    assert!(coord.jobs().owner_of(&job, "http://x").is_some());

    coord
        .intake_handle()
        .report_finished(job.clone(), "http://x");
    coord.tick(t0);

    let sent = coord.transport_mut().take();
    let finished: Vec<_> = sent
        .iter()
        .filter(|(_, m)| matches!(m, OutboundMessage::JobUrlFinished { .. }))
        .collect();
    assert_eq!(
        finished,
        vec![&(
            p1,
            OutboundMessage::JobUrlFinished {
                job: job.clone(),
                url: "http://x".to_string(),
                owner: PeerAddr::new("10.0.0.1:4000"),
            }
        )]
    );
    assert_eq!(coord.jobs().owner_of(&job, "http://x"), None);
    assert!(coord.jobs().archived_url(&job, "http://x"));

    // The stager re-sends the same url after a restart: nothing is queued again.
    deliver(
        &mut coord,
        p1,
        InboundMessage::JobUrlCrawl {
            job: job.clone(),
            url: "http://x".to_string(),
        },
        t0,
    );
    assert_eq!(coord.jobs().owner_of(&job, "http://x"), None);
}

#[test]
fn finished_report_goes_to_every_job_stager() {
    let (mut coord, _) = coordinator();
    let t0 = Instant::now();
    let p1 = add(&mut coord, "10.0.0.1:4000", t0);
    let p2 = add(&mut coord, "10.0.0.2:4000", t0);
    let job = job_with_stagers(&mut coord, "A", &[p1, p2], t0);
    deliver(
        &mut coord,
        p2,
        InboundMessage::JobUrlCrawl {
            job: job.clone(),
            url: "http://y".to_string(),
        },
        t0,
    );

    coord
        .intake_handle()
        .report_finished(job.clone(), "http://y");
    coord.tick(t0);

    let sent = coord.transport_mut().take();
    let mut targets: Vec<PeerId> = sent
        .iter()
        .filter_map(|(p, m)| match m {
            OutboundMessage::JobUrlFinished { owner, .. } => {
                assert_eq!(owner, &PeerAddr::new("10.0.0.2:4000"));
                Some(*p)
            }
            _ => None,
        })
        .collect();
    targets.sort();
    assert_eq!(targets, vec![p1, p2]);
}

#[test]
fn discovered_urls_skip_archived_and_go_to_exactly_one_stager() {
    let (mut coord, _) = coordinator();
    let t0 = Instant::now();
    let p1 = add(&mut coord, "10.0.0.1:4000", t0);
    let p2 = add(&mut coord, "10.0.0.2:4000", t0);
    let job = job_with_stagers(&mut coord, "A", &[p1, p2], t0);

    let intake = coord.intake_handle();
    intake.report_finished(job.clone(), "http://old");
    coord.tick(t0);
    coord.transport_mut().take();

    intake.report_discovered(job.clone(), "http://parent", "http://old");
    intake.report_discovered(job.clone(), "http://parent", "http://new");
    coord.tick(t0 + Duration::from_secs(1));

    let sent = coord.transport_mut().take();
    let discovered: Vec<_> = sent
        .iter()
        .filter(|(_, m)| matches!(m, OutboundMessage::JobUrlDiscovered { .. }))
        .collect();
    assert_eq!(discovered.len(), 1);
    let (to, msg) = discovered[0];
    assert!([p1, p2].contains(to));
    assert_eq!(
        msg,
        &OutboundMessage::JobUrlDiscovered {
            job: job.clone(),
            parent: "http://parent".to_string(),
            url: "http://new".to_string(),
        }
    );

    // Queue was cleared even for the skipped entry.
    coord.tick(t0 + Duration::from_secs(2));
    let sent = coord.transport_mut().take();
    assert_eq!(
        count(&sent, |m| matches!(m, OutboundMessage::JobUrlDiscovered { .. })),
        0
    );
}

#[test]
fn repeated_discovery_in_one_drain_is_forwarded_once() {
    let (mut coord, _) = coordinator();
    let t0 = Instant::now();
    let p1 = add(&mut coord, "10.0.0.1:4000", t0);
    let p2 = add(&mut coord, "10.0.0.2:4000", t0);
    let job = job_with_stagers(&mut coord, "A", &[p1, p2], t0);

    let intake = coord.intake_handle();
    intake.report_discovered(job.clone(), "http://parent", "http://new");
    intake.report_discovered(job, "http://parent", "http://new");
    coord.tick(t0);

    let sent = coord.transport_mut().take();
    assert_eq!(
        count(&sent, |m| matches!(m, OutboundMessage::JobUrlDiscovered { .. })),
        1
    );
}

#[test]
fn unrecorded_finish_is_held_back_then_abandoned() {
    let mut coord = Coordinator::new(
        config(Vec::new()),
        RecordingTransport::default(),
        Box::new(RejectingOpener),
        Box::new(Frontier::new()),
    );
    let t0 = Instant::now();
    let p1 = add(&mut coord, "10.0.0.1:4000", t0);
    let job = job_with_stagers(&mut coord, "A", &[p1], t0);
    deliver(
        &mut coord,
        p1,
        InboundMessage::JobUrlCrawl {
            job: job.clone(),
            url: "http://x".to_string(),
        },
        t0,
    );
    coord.intake_handle().report_finished(job.clone(), "http://x");
    let is_finish = |m: &OutboundMessage| matches!(m, OutboundMessage::JobUrlFinished { .. });

    for n in 1..MAX_FINISH_ATTEMPTS {
        coord.tick(t0 + Duration::from_secs(u64::from(n)));
        assert_eq!(count(&coord.transport_mut().take(), is_finish), 0);
        assert!(coord.jobs().owner_of(&job, "http://x").is_some());
        assert!(!coord.jobs().archived_url(&job, "http://x"));
        assert_eq!(coord.status().intake_finished, 1);
    }

    coord.tick(t0 + Duration::from_secs(60));
    assert_eq!(count(&coord.transport_mut().take(), is_finish), 0);
    assert_eq!(coord.jobs().owner_of(&job, "http://x"), None);
    assert_eq!(coord.status().intake_finished, 0);
}

#[test]
fn pong_once_answers_and_twice_repings_everyone() {
    let (mut coord, _) = coordinator();
    let t0 = Instant::now();
    let p1 = add(&mut coord, "10.0.0.1:4000", t0);
    let p2 = add(&mut coord, "10.0.0.2:4000", t0);
    coord.tick(t0);
    let sent = coord.transport_mut().take();
    assert_eq!(count(&sent, |m| matches!(m, OutboundMessage::Ping)), 2);
    assert!(coord.peers().iter().all(|p| !p.pong));

    deliver(&mut coord, p1, InboundMessage::Pong, t0);
    assert!(coord.peers().get(p1).is_some_and(|p| p.pong));
    assert!(coord.peers().get(p2).is_some_and(|p| !p.pong));
    assert!(coord.transport_mut().take().is_empty());

    deliver(&mut coord, p1, InboundMessage::Pong, t0);
    let sent = coord.transport_mut().take();
    let mut pinged: Vec<PeerId> = sent
        .iter()
        .filter(|(_, m)| matches!(m, OutboundMessage::Ping))
        .map(|(p, _)| *p)
        .collect();
    pinged.sort();
    assert_eq!(pinged, vec![p1, p2]);
    assert!(coord.peers().iter().all(|p| !p.pong));
}

#[test]
fn unresponsive_stager_is_evicted_after_missed_pongs() {
    let (mut coord, _) = coordinator();
    let t0 = Instant::now();
    let alive = add(&mut coord, "10.0.0.1:4000", t0);
    let silent = add(&mut coord, "10.0.0.2:4000", t0);
    let job = job_with_stagers(&mut coord, "A", &[alive, silent], t0);

    let ping_every = Duration::from_secs(60);
    for cycle in 0..3u32 {
        let now = t0 + ping_every * cycle;
        coord.tick(now);
        deliver(&mut coord, alive, InboundMessage::Pong, now);
    }

    assert!(coord.peers().get(silent).is_none());
    assert!(coord.peers().get(alive).is_some());
    assert_eq!(coord.transport().closed, vec![silent]);
    assert_eq!(
        coord
            .jobs()
            .stagers(&job)
            .map(|s| s.iter().map(|p| p.id).collect::<Vec<_>>()),
        Some(vec![alive])
    );
}

#[test]
fn unsolicited_pongs_do_not_postpone_the_ping_cycle() {
    let (mut coord, _) = coordinator();
    let t0 = Instant::now();
    let noisy = add(&mut coord, "10.0.0.1:4000", t0);
    let silent = add(&mut coord, "10.0.0.2:4000", t0);

    // The noisy stager answers every ping and also sends an extra pong between cycles.
    for step in 0..=4u32 {
        coord.tick(t0 + Duration::from_secs(30) * step);
        if coord.peers().get(silent).is_none() {
            break;
        }
        deliver(&mut coord, noisy, InboundMessage::Pong, t0);
        if coord.peers().get(noisy).is_some_and(|p| !p.pong) {
            deliver(&mut coord, noisy, InboundMessage::Pong, t0);
        }
    }

    assert!(coord.peers().get(silent).is_none());
    assert!(coord.peers().get(noisy).is_some());
    assert_eq!(coord.transport().closed, vec![silent]);
}

#[test]
fn stager_request_is_rate_limited_and_lists_known_addresses() {
    let (mut coord, _) = coordinator();
    let t0 = Instant::now();
    let p1 = add(&mut coord, "10.0.0.1:4000", t0);
    coord.transport_mut().take();

    coord.tick(t0);
    coord.tick(t0 + Duration::from_secs(5));
    let sent = coord.transport_mut().take();
    let requests: Vec<_> = sent
        .iter()
        .filter(|(_, m)| matches!(m, OutboundMessage::RequestStager { .. }))
        .collect();
    assert_eq!(
        requests,
        vec![&(
            p1,
            OutboundMessage::RequestStager {
                count: 1,
                known: vec![PeerAddr::new("10.0.0.1:4000")],
            }
        )]
    );

    coord.tick(t0 + Duration::from_secs(30));
    let sent = coord.transport_mut().take();
    assert_eq!(
        count(&sent, |m| matches!(m, OutboundMessage::RequestStager { .. })),
        1
    );
}

#[test]
fn empty_registry_redials_seed_stagers() {
    let frontier = Frontier::new();
    let mut coord = Coordinator::new(
        config(vec![PeerAddr::new("10.0.0.9:4000")]),
        RecordingTransport::default(),
        Box::new(MemoryDedupOpener),
        Box::new(frontier),
    );
    let t0 = Instant::now();
    coord.tick(t0);
    assert_eq!(coord.peers().len(), 1);
    let id = coord.peers().iter().next().map(|p| p.id).expect("peer");

    coord.handle_event(
        InboundEvent {
            peer: id,
            kind: PeerEventKind::Closed,
        },
        t0,
    );
    assert!(coord.peers().is_empty());

    coord.tick(t0 + Duration::from_secs(30));
    assert_eq!(coord.peers().len(), 1);
    assert_eq!(
        coord.transport().dialed,
        vec![PeerAddr::new("10.0.0.9:4000"), PeerAddr::new("10.0.0.9:4000")]
    );
}

#[test]
fn two_grants_pick_one_uploader_and_revoke_the_other() {
    let dir = temp_dir("two-grants");
    let path = dir.join("a.warc");
    std::fs::write(&path, b"0123456789").expect("write warc");

    let (mut coord, _) = coordinator();
    let t0 = Instant::now();
    let s1 = add(&mut coord, "10.0.0.1:4000", t0);
    let s2 = add(&mut coord, "10.0.0.2:4000", t0);
    let job = job_with_stagers(&mut coord, "A", &[s1, s2], t0);

    coord.intake_handle().report_archive(job.clone(), &path);
    coord.tick(t0);
    let sent = coord.transport_mut().take();
    let requests: Vec<_> = sent
        .iter()
        .filter(|(_, m)| matches!(m, OutboundMessage::RequestUploadPermission { .. }))
        .collect();
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|(_, m)| matches!(
        m,
        OutboundMessage::RequestUploadPermission { size: 10, .. }
    )));

    for s in [s1, s2] {
        deliver(
            &mut coord,
            s,
            InboundMessage::UploadPermissionGranted {
                job: job.clone(),
                path: path.clone(),
            },
            t0 + Duration::from_secs(1),
        );
    }

    coord.tick(t0 + Duration::from_secs(2));
    assert!(coord.transport().files.is_empty());

    coord.tick(t0 + Duration::from_secs(1) + WINDOW);
    let files = coord.transport().files.clone();
    assert_eq!(files.len(), 1);
    let (chosen, _, sent_path) = &files[0];
    assert_eq!(sent_path, &path);
    assert!([s1, s2].contains(chosen));

    let sent = coord.transport_mut().take();
    let revokes: Vec<PeerId> = sent
        .iter()
        .filter(|(_, m)| matches!(m, OutboundMessage::RequestUploadRevoke { .. }))
        .map(|(p, _)| *p)
        .collect();
    assert_eq!(revokes.len(), 1);
    assert_ne!(revokes[0], *chosen);
    assert!(upload::in_flight_marker(&path).exists());

    // Later ticks neither re-send nor re-revoke.
    coord.tick(t0 + WINDOW * 3);
    assert_eq!(coord.transport().files.len(), 1);
    let sent = coord.transport_mut().take();
    assert_eq!(
        count(&sent, |m| matches!(m, OutboundMessage::RequestUploadRevoke { .. })),
        0
    );

    deliver(
        &mut coord,
        *chosen,
        InboundMessage::WarcFileReceived {
            job: job.clone(),
            path: path.clone(),
        },
        t0 + WINDOW * 3,
    );
    assert!(coord.uploads().is_empty());
    assert!(!path.exists());
    assert!(!upload::in_flight_marker(&path).exists());
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn late_grant_is_revoked_immediately() {
    let dir = temp_dir("late");
    let path = dir.join("a.warc");
    std::fs::write(&path, b"x").expect("write warc");

    let (mut coord, _) = coordinator();
    let t0 = Instant::now();
    let s1 = add(&mut coord, "10.0.0.1:4000", t0);
    let s2 = add(&mut coord, "10.0.0.2:4000", t0);
    let job = job_with_stagers(&mut coord, "A", &[s1, s2], t0);

    coord.intake_handle().report_archive(job.clone(), &path);
    coord.tick(t0);
    let grant = InboundMessage::UploadPermissionGranted {
        job: job.clone(),
        path: path.clone(),
    };
    deliver(&mut coord, s1, grant.clone(), t0);
    coord.tick(t0 + WINDOW);
    assert_eq!(coord.transport().files.len(), 1);
    coord.transport_mut().take();

    deliver(&mut coord, s2, grant, t0 + WINDOW);
    assert_eq!(
        coord.transport_mut().take(),
        vec![(
            s2,
            OutboundMessage::RequestUploadRevoke {
                job,
                path: path.clone()
            }
        )]
    );
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn duplicate_grant_from_chosen_uploader_is_ignored() {
    let dir = temp_dir("dup-grant");
    let path = dir.join("a.warc");
    std::fs::write(&path, b"x").expect("write warc");

    let (mut coord, _) = coordinator();
    let t0 = Instant::now();
    let s1 = add(&mut coord, "10.0.0.1:4000", t0);
    let s2 = add(&mut coord, "10.0.0.2:4000", t0);
    let job = job_with_stagers(&mut coord, "A", &[s1, s2], t0);

    coord.intake_handle().report_archive(job.clone(), &path);
    coord.tick(t0);
    let grant = InboundMessage::UploadPermissionGranted {
        job: job.clone(),
        path: path.clone(),
    };
    deliver(&mut coord, s1, grant.clone(), t0);
    deliver(&mut coord, s2, grant.clone(), t0);
    coord.tick(t0 + WINDOW);
    let chosen = coord.transport().files[0].0;
    coord.transport_mut().take();

    deliver(&mut coord, chosen, grant, t0 + WINDOW);
    assert!(coord.transport_mut().take().is_empty());
    assert_eq!(coord.transport().files.len(), 1);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn uploader_disconnect_requests_archive_again() {
    let dir = temp_dir("uploader-gone");
    let path = dir.join("a.warc");
    std::fs::write(&path, b"x").expect("write warc");

    let (mut coord, _) = coordinator();
    let t0 = Instant::now();
    let s1 = add(&mut coord, "10.0.0.1:4000", t0);
    let s2 = add(&mut coord, "10.0.0.2:4000", t0);
    let job = job_with_stagers(&mut coord, "A", &[s1, s2], t0);
    let grant = InboundMessage::UploadPermissionGranted {
        job: job.clone(),
        path: path.clone(),
    };

    coord.intake_handle().report_archive(job.clone(), &path);
    coord.tick(t0);
    deliver(&mut coord, s1, grant.clone(), t0);
    coord.tick(t0 + WINDOW);
    assert_eq!(coord.transport().files.len(), 1);
    assert!(upload::in_flight_marker(&path).exists());
    coord.transport_mut().take();

    coord.handle_event(
        InboundEvent {
            peer: s1,
            kind: PeerEventKind::Closed,
        },
        t0 + WINDOW,
    );
    assert!(!upload::in_flight_marker(&path).exists());
    assert_eq!(coord.uploads().get(&path).map(PendingUpload::attempt), Some(1));

    let t1 = t0 + WINDOW + Duration::from_secs(1);
    coord.tick(t1);
    let sent = coord.transport_mut().take();
    let requested: Vec<PeerId> = sent
        .iter()
        .filter(|(_, m)| matches!(m, OutboundMessage::RequestUploadPermission { .. }))
        .map(|(p, _)| *p)
        .collect();
    assert_eq!(requested, vec![s2]);

    deliver(&mut coord, s2, grant, t1);
    coord.tick(t1 + WINDOW);
    let files = &coord.transport().files;
    assert_eq!(files.len(), 2);
    assert_eq!(files[1].0, s2);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn leftover_marker_does_not_block_a_new_upload() {
    let dir = temp_dir("stale-marker");
    let path = dir.join("a.warc");
    std::fs::write(&path, b"x").expect("write warc");
    std::fs::write(upload::in_flight_marker(&path), b"").expect("write marker");

    let (mut coord, _) = coordinator();
    let t0 = Instant::now();
    let s1 = add(&mut coord, "10.0.0.1:4000", t0);
    let job = job_with_stagers(&mut coord, "A", &[s1], t0);

    coord.intake_handle().report_archive(job.clone(), &path);
    coord.tick(t0);
    deliver(
        &mut coord,
        s1,
        InboundMessage::UploadPermissionGranted {
            job,
            path: path.clone(),
        },
        t0,
    );
    coord.tick(t0 + WINDOW);
    assert_eq!(coord.transport().files.len(), 1);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn zero_grants_retry_with_backoff_then_drop() {
    let dir = temp_dir("zero");
    let path = dir.join("a.warc");
    std::fs::write(&path, b"x").expect("write warc");

    let (mut coord, _) = coordinator();
    let t0 = Instant::now();
    let s1 = add(&mut coord, "10.0.0.1:4000", t0);
    let job = job_with_stagers(&mut coord, "A", &[s1], t0);
    let is_request = |m: &OutboundMessage| matches!(m, OutboundMessage::RequestUploadPermission { .. });

    coord.intake_handle().report_archive(job.clone(), &path);
    coord.tick(t0);
    coord.tick(t0 + Duration::from_secs(1));
    coord.tick(t0 + Duration::from_secs(1) + WINDOW);
    assert_eq!(coord.uploads().get(&path).map(PendingUpload::attempt), Some(1));
    let sent = coord.transport_mut().take();
    assert_eq!(count(&sent, is_request), 1);

    // Backoff of 30s has not elapsed yet.
    coord.tick(t0 + Duration::from_secs(20));
    assert_eq!(count(&coord.transport_mut().take(), is_request), 0);

    let t1 = t0 + Duration::from_secs(1) + WINDOW + Duration::from_secs(30);
    coord.tick(t1);
    assert_eq!(count(&coord.transport_mut().take(), is_request), 1);
    coord.tick(t1 + Duration::from_secs(1));
    coord.tick(t1 + Duration::from_secs(1) + WINDOW);
    assert!(coord.uploads().is_empty());
    assert!(path.exists());
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn stale_grant_for_unrequested_file_is_ignored() {
    let (mut coord, _) = coordinator();
    let t0 = Instant::now();
    let s1 = add(&mut coord, "10.0.0.1:4000", t0);
    let job = job_with_stagers(&mut coord, "A", &[s1], t0);
    deliver(
        &mut coord,
        s1,
        InboundMessage::UploadPermissionGranted {
            job,
            path: PathBuf::from("/nonexistent/a.warc"),
        },
        t0,
    );
    assert!(coord.uploads().is_empty());
    assert!(coord.transport_mut().take().is_empty());
}

#[test]
fn concurrent_transfer_attempt_is_a_noop() {
    let dir = temp_dir("inflight");
    let path = dir.join("a.warc");
    std::fs::write(&path, b"x").expect("write warc");
    let to = PeerRef {
        id: PeerId(7),
        addr: PeerAddr::new("10.0.0.7:4000"),
    };
    let job = JobId::new("A");
    let mut transport = RecordingTransport::default();

    assert_eq!(
        upload::start_transfer(&mut transport, &to, &job, &path),
        TransferStart::Started
    );
    assert_eq!(
        upload::start_transfer(&mut transport, &to, &job, &path),
        TransferStart::AlreadyInFlight
    );
    assert_eq!(transport.files.len(), 1);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn quota_request_targets_least_recently_replenished_job() {
    let (mut coord, frontier) = coordinator();
    let t0 = Instant::now();
    let s1 = add(&mut coord, "10.0.0.1:4000", t0);
    let a = job_with_stagers(&mut coord, "A", &[s1], t0);
    let b = job_with_stagers(&mut coord, "B", &[s1], t0);

    deliver(
        &mut coord,
        s1,
        InboundMessage::AssignedUrlQuota {
            job: b.clone(),
            amount: 5,
        },
        t0 + Duration::from_secs(2),
    );
    deliver(
        &mut coord,
        s1,
        InboundMessage::AssignedUrlQuota {
            job: a.clone(),
            amount: 5,
        },
        t0 + Duration::from_secs(1),
    );
    assert_eq!(frontier.budget(&a), 5);

    coord.tick(t0 + Duration::from_secs(3));
    let sent = coord.transport_mut().take();
    let quota: Vec<_> = sent
        .iter()
        .filter(|(_, m)| matches!(m, OutboundMessage::RequestUrlQuota { .. }))
        .collect();
    assert_eq!(quota, vec![&(s1, OutboundMessage::RequestUrlQuota { job: a })]);

    // Rate limited until the next quota cycle.
    coord.tick(t0 + Duration::from_secs(4));
    let sent = coord.transport_mut().take();
    assert_eq!(
        count(&sent, |m| matches!(m, OutboundMessage::RequestUrlQuota { .. })),
        0
    );
}

#[test]
fn handshake_stage_zero_is_confirmed_back() {
    let (mut coord, _) = coordinator();
    let t0 = Instant::now();
    let s1 = add(&mut coord, "10.0.0.1:4000", t0);
    coord.transport_mut().take();

    deliver(&mut coord, s1, InboundMessage::Confirmed { stage: 0 }, t0);
    assert!(coord.peers().get(s1).is_some_and(|p| p.confirmed));
    assert_eq!(
        coord.transport_mut().take(),
        vec![(s1, OutboundMessage::Confirmed { stage: 1 })]
    );

    deliver(&mut coord, s1, InboundMessage::Confirmed { stage: 1 }, t0);
    deliver(&mut coord, s1, InboundMessage::Ping, t0);
    assert_eq!(coord.transport_mut().take(), vec![(s1, OutboundMessage::Pong)]);
}

#[test]
fn add_stager_message_adds_extra_peer() {
    let (mut coord, _) = coordinator();
    let t0 = Instant::now();
    let s1 = add(&mut coord, "10.0.0.1:4000", t0);
    coord.transport_mut().take();

    let address = PeerAddr::new("10.0.0.5:4000");
    deliver(&mut coord, s1, InboundMessage::AddStager { address: address.clone() }, t0);
    deliver(&mut coord, s1, InboundMessage::AddStager { address: address.clone() }, t0);
    assert_eq!(coord.peers().len(), 2);
    let sent = coord.transport_mut().take();
    assert_eq!(
        count(&sent, |m| matches!(m, OutboundMessage::AnnounceCrawlerExtra { .. })),
        1
    );
    assert!(coord.peers().iter().any(|p| p.addr == address && p.extra));
}

#[test]
fn messages_from_dropped_peer_are_ignored() {
    let (mut coord, _) = coordinator();
    let t0 = Instant::now();
    let s1 = add(&mut coord, "10.0.0.1:4000", t0);
    coord.handle_event(
        InboundEvent {
            peer: s1,
            kind: PeerEventKind::Closed,
        },
        t0,
    );
    coord.transport_mut().take();

    deliver(
        &mut coord,
        s1,
        InboundMessage::NewJobCrawl {
            job: JobId::new("A"),
        },
        t0,
    );
    assert!(coord.jobs().is_empty());
    assert!(coord.transport_mut().take().is_empty());
}

#[test]
fn status_reflects_state() {
    let (mut coord, _) = coordinator();
    let t0 = Instant::now();
    let s1 = add(&mut coord, "10.0.0.1:4000", t0);
    let job = job_with_stagers(&mut coord, "A", &[s1], t0);
    deliver(
        &mut coord,
        s1,
        InboundMessage::JobUrlCrawl {
            job: job.clone(),
            url: "http://x".to_string(),
        },
        t0,
    );
    deliver(&mut coord, s1, InboundMessage::JobStartCrawl { job }, t0);
    coord.intake_handle().report_finished(JobId::new("A"), "http://z");

    let status = coord.status();
    assert_eq!(status.peers, 1);
    assert_eq!(status.jobs, 1);
    assert_eq!(status.started_jobs, 1);
    assert_eq!(status.owned_urls, 1);
    assert_eq!(status.intake_finished, 1);
}
