use crate::{
    config::Config,
    coordinator::Coordinator,
    crawl::Frontier,
    dedup::FileDedupOpener,
    net::{InboundEvent, TcpTransport, TcpTransportConfig, Transport},
    single_instance::SingleInstanceLock,
};
use anyhow::Context;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, MissedTickBehavior, interval};

const STATUS_EVERY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
pub struct ServiceConfig {
    pub tick_every: Duration,
    pub status_every: Duration,
    /// `None` runs until Ctrl-C.
    pub runtime: Option<Duration>,
}

impl ServiceConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tick_every: config.crawler.tick_every(),
            status_every: STATUS_EVERY,
            runtime: match config.crawler.runtime_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        log = %config.general.log_level,
        data_dir = %config.general.data_dir,
        advertise = %config.crawler.advertise_addr,
        "starting crawler"
    );

    let lock = SingleInstanceLock::acquire(config.lock_path())?;
    tracing::debug!(path = %lock.path().display(), "instance lock held");

    let opener = FileDedupOpener::new(config.dedup_dir())
        .with_context(|| format!("failed preparing {}", config.dedup_dir().display()))?;
    let frontier = Frontier::new();
    let (transport, mut events) = TcpTransport::new(TcpTransportConfig {
        connect_timeout: config.crawler.connect_timeout(),
        ..TcpTransportConfig::default()
    });

    let coordinator_cfg = config.crawler.coordinator_config();
    let seeds = coordinator_cfg.peers.seed_stagers.clone();
    let mut coordinator = Coordinator::new(
        coordinator_cfg,
        transport,
        Box::new(opener),
        Box::new(frontier),
    );

    let now = Instant::now();
    for seed in &seeds {
        coordinator.add_stager(seed, false, now);
    }
    if seeds.is_empty() {
        tracing::warn!("no seed stagers configured; crawler stays idle");
    }

    run_service(
        &mut coordinator,
        &mut events,
        ServiceConfig::from_config(&config),
    )
    .await?;

    drop(lock);
    Ok(())
}

/// Drives the coordinator: ticks on a fixed period and feeds every inbound transport event to
/// it. Both happen on this task, so they never overlap.
pub async fn run_service<T: Transport>(
    coordinator: &mut Coordinator<T>,
    events: &mut mpsc::Receiver<InboundEvent>,
    cfg: ServiceConfig,
) -> anyhow::Result<()> {
    let mut tick = interval(cfg.tick_every);
    let mut status_tick = interval(cfg.status_every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    status_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // Optional runtime deadline (None => forever).
    let deadline = cfg.runtime.map(|d| Instant::now() + d);

    loop {
        if let Some(d) = deadline
            && Instant::now() >= d
        {
            tracing::info!("crawler runtime deadline reached");
            break;
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received Ctrl-C");
                break;
            }

            _ = tick.tick() => {
                coordinator.tick(Instant::now());
            }

            _ = status_tick.tick() => {
                let s = coordinator.status();
                tracing::info!(
                    peers = s.peers,
                    confirmed = s.confirmed_peers,
                    jobs = s.jobs,
                    started = s.started_jobs,
                    owned_urls = s.owned_urls,
                    pending_uploads = s.pending_uploads,
                    backlog_archives = s.intake_archives,
                    backlog_finished = s.intake_finished,
                    backlog_discovered = s.intake_discovered,
                    "crawler status"
                );
            }

            event = events.recv() => {
                let Some(event) = event else {
                    anyhow::bail!("transport event channel closed");
                };
                coordinator.handle_event(event, Instant::now());
            }
        }
    }

    tracing::info!(ticks = coordinator.status().ticks, "crawler stopped");
    Ok(())
}
