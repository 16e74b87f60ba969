use super::*;
use crate::net::{InboundEvent, PeerEventKind};
use crate::protocol::InboundMessage;

impl<T: Transport> Coordinator<T> {
    pub fn handle_event(&mut self, event: InboundEvent, now: Instant) {
        match event.kind {
            PeerEventKind::Closed => self.drop_peer(event.peer),
            PeerEventKind::Message(msg) => self.handle_message(event.peer, msg, now),
        }
    }

    fn handle_message(&mut self, from: PeerId, msg: InboundMessage, now: Instant) {
        let Some(peer) = self.peers.peer_ref(from) else {
            tracing::trace!(peer = %from, command = msg.name(), "message from unregistered peer");
            return;
        };
        tracing::trace!(peer = %from, command = msg.name(), "inbound message");

        match msg {
            InboundMessage::Ping => {
                self.transport.send_or_log(from, OutboundMessage::Pong);
            }
            InboundMessage::Pong => {
                self.peers.on_pong(&mut self.transport, from);
            }
            InboundMessage::Confirmed { stage } => {
                self.peers.on_confirmed(from);
                if stage == 0 {
                    self.transport
                        .send_or_log(from, OutboundMessage::Confirmed { stage: 1 });
                }
            }
            InboundMessage::AlreadyConfirmed => {}
            InboundMessage::NewJobCrawl { job } => {
                if !self.create_job(&job, now) {
                    return;
                }
                self.jobs.add_stager(&job, peer);
                self.transport
                    .send_or_log(from, OutboundMessage::JobCrawlConfirmed { job });
            }
            InboundMessage::JobUrlCrawl { job, url } => match self.jobs.add_url(&job, peer, &url) {
                AddUrl::Queued => {}
                AddUrl::AlreadyFinished => {
                    tracing::debug!(%job, url = %crate::logging::short_url(&url), "stager re-sent finished url");
                }
                AddUrl::UnknownJob => {
                    tracing::debug!(%job, peer = %from, "url for unknown job");
                }
            },
            InboundMessage::JobStartCrawl { job } => {
                if !self.jobs.contains(&job) {
                    tracing::debug!(%job, peer = %from, "start for unknown job");
                    return;
                }
                self.jobs.start_job(&job);
                self.transport
                    .send_or_log(from, OutboundMessage::JobStartedCrawl { job });
            }
            InboundMessage::AssignedUrlQuota { job, amount } => {
                if self.jobs.increase_quota(&job, amount, now) {
                    tracing::debug!(%job, amount, "url quota assigned");
                }
            }
            InboundMessage::UploadPermissionGranted { job, path } => {
                match self.uploads.grant(&path, peer, now) {
                    GrantOutcome::Late => {
                        self.transport
                            .send_or_log(from, OutboundMessage::RequestUploadRevoke { job, path });
                    }
                    GrantOutcome::Recorded | GrantOutcome::Ignored => {}
                }
            }
            InboundMessage::UploadPermissionDenied { job, path } => {
                tracing::debug!(%job, path = %path.display(), peer = %from, "upload permission denied");
            }
            InboundMessage::WarcFileReceived { job, path } => {
                self.uploads.confirm_received(&job, &path);
            }
            InboundMessage::AddStager { address } => {
                self.add_stager(&address, true, now);
            }
        }
    }
}
