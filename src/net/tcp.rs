use crate::net::{InboundEvent, PeerEventKind, PeerId, Result, Transport, TransportError};
use crate::protocol::{
    JobId, MAX_LINE_LEN, OutboundMessage, PeerAddr, decode_inbound, encode_outbound,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};

#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    pub connect_timeout: Duration,
    /// Outbound messages buffered per peer before `send` reports `QueueFull`.
    pub queue_len: usize,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            queue_len: 1024,
        }
    }
}

#[derive(Debug)]
enum Outgoing {
    Message(OutboundMessage),
    File { job: JobId, path: PathBuf },
}

struct Connection {
    tx: mpsc::Sender<Outgoing>,
    task: JoinHandle<()>,
}

/// One tokio task per stager connection; inbound frames of every connection are funneled into
/// the single receiver returned by [`TcpTransport::new`].
pub struct TcpTransport {
    cfg: TcpTransportConfig,
    next_id: u64,
    conns: HashMap<PeerId, Connection>,
    events_tx: mpsc::Sender<InboundEvent>,
}

impl TcpTransport {
    pub fn new(cfg: TcpTransportConfig) -> (Self, mpsc::Receiver<InboundEvent>) {
        let (events_tx, events_rx) = mpsc::channel(cfg.queue_len.max(16));
        (
            Self {
                cfg,
                next_id: 1,
                conns: HashMap::new(),
                events_tx,
            },
            events_rx,
        )
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    fn queue(&mut self, peer: PeerId, out: Outgoing) -> Result<()> {
        let conn = self
            .conns
            .get(&peer)
            .ok_or(TransportError::UnknownPeer(peer))?;
        conn.tx.try_send(out).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull(peer),
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed(peer),
        })
    }
}

impl Transport for TcpTransport {
    fn connect(&mut self, addr: &PeerAddr) -> Result<PeerId> {
        let peer = PeerId(self.next_id);
        self.next_id += 1;
        let (tx, rx) = mpsc::channel(self.cfg.queue_len.max(1));
        let task = tokio::spawn(run_connection(
            peer,
            addr.clone(),
            self.cfg.connect_timeout,
            rx,
            self.events_tx.clone(),
        ));
        self.conns.insert(peer, Connection { tx, task });
        Ok(peer)
    }

    fn send(&mut self, peer: PeerId, msg: OutboundMessage) -> Result<()> {
        self.queue(peer, Outgoing::Message(msg))
    }

    fn send_file(&mut self, peer: PeerId, job: &JobId, path: &Path) -> Result<()> {
        self.queue(
            peer,
            Outgoing::File {
                job: job.clone(),
                path: path.to_path_buf(),
            },
        )
    }

    fn close(&mut self, peer: PeerId) {
        if let Some(conn) = self.conns.remove(&peer) {
            conn.task.abort();
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        for (_, conn) in self.conns.drain() {
            conn.task.abort();
        }
    }
}

async fn run_connection(
    peer: PeerId,
    addr: PeerAddr,
    connect_timeout: Duration,
    mut rx: mpsc::Receiver<Outgoing>,
    events: mpsc::Sender<InboundEvent>,
) {
    let stream = match timeout(connect_timeout, TcpStream::connect(addr.as_str())).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            tracing::warn!(%peer, %addr, error = %err, "stager connect failed");
            let _ = events
                .send(InboundEvent {
                    peer,
                    kind: PeerEventKind::Closed,
                })
                .await;
            return;
        }
        Err(_) => {
            tracing::warn!(%peer, %addr, ?connect_timeout, "stager connect timed out");
            let _ = events
                .send(InboundEvent {
                    peer,
                    kind: PeerEventKind::Closed,
                })
                .await;
            return;
        }
    };
    tracing::debug!(%peer, %addr, "stager connected");

    let (read_half, write_half) = stream.into_split();
    tokio::select! {
        res = read_frames(peer, BufReader::new(read_half), &events) => {
            if let Err(err) = res {
                tracing::debug!(%peer, %addr, error = %err, "stager read side closed");
            }
        }
        res = write_frames(write_half, &mut rx) => {
            if let Err(err) = res {
                tracing::debug!(%peer, %addr, error = %err, "stager write side closed");
            }
        }
    }

    tracing::info!(%peer, %addr, "stager connection closed");
    let _ = events
        .send(InboundEvent {
            peer,
            kind: PeerEventKind::Closed,
        })
        .await;
}

async fn read_frames<R: AsyncRead + Unpin>(
    peer: PeerId,
    mut reader: BufReader<R>,
    events: &mpsc::Sender<InboundEvent>,
) -> std::io::Result<()> {
    let mut line = Vec::with_capacity(256);
    loop {
        line.clear();
        let n = (&mut reader)
            .take(MAX_LINE_LEN as u64 + 2)
            .read_until(b'\n', &mut line)
            .await?;
        if n == 0 {
            return Ok(());
        }
        if line.last() != Some(&b'\n') && line.len() > MAX_LINE_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame exceeds {MAX_LINE_LEN} bytes"),
            ));
        }

        match decode_inbound(&line) {
            Ok(msg) => {
                tracing::trace!(%peer, command = msg.name(), "inbound frame");
                let event = InboundEvent {
                    peer,
                    kind: PeerEventKind::Message(msg),
                };
                if events.send(event).await.is_err() {
                    return Ok(());
                }
            }
            Err(err) => {
                if crate::logging::warn_throttled("undecodable_stager_frame", Duration::from_secs(30))
                {
                    tracing::warn!(%peer, error = %err, "dropping undecodable stager frame");
                }
            }
        }
    }
}

async fn write_frames<W: AsyncWrite + Unpin>(
    mut writer: W,
    rx: &mut mpsc::Receiver<Outgoing>,
) -> std::io::Result<()> {
    while let Some(out) = rx.recv().await {
        match out {
            Outgoing::Message(msg) => {
                let bytes = encode_outbound(&msg).map_err(std::io::Error::other)?;
                writer.write_all(&bytes).await?;
            }
            Outgoing::File { job, path } => {
                // A half-announced transfer cannot be skipped; closing makes the coordinator
                // re-request the archive.
                let data = tokio::fs::read(&path).await.map_err(|err| {
                    tracing::warn!(%job, path = %path.display(), error = %err, "failed reading archive for transfer");
                    err
                })?;
                let header = OutboundMessage::WarcFile {
                    job: job.clone(),
                    path: path.clone(),
                    size: data.len() as u64,
                };
                let bytes = encode_outbound(&header).map_err(std::io::Error::other)?;
                writer.write_all(&bytes).await?;
                writer.write_all(&data).await?;
                tracing::info!(%job, path = %path.display(), size = data.len(), "archive sent");
            }
        }
        writer.flush().await?;
    }
    Ok(())
}
