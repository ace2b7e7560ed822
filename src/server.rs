//! HTTP tracker server.
//!
//! Peers announce to `/announce` and are handed a random sample of the other
//! live peers in their swarm; `/scrape` reports swarm statistics. Membership
//! lives in a [`SwarmRegistry`]; a sweeper task evicts peers that stopped
//! announcing.
//!
//! ```no_run
//! use bitswarm::config::TrackerConfig;
//! use bitswarm::server::TrackerServer;
//!
//! # async fn run() -> Result<(), bitswarm::server::ServerError> {
//! let tracker = TrackerServer::start(TrackerConfig::default()).await?;
//! println!("tracking on {}", tracker.local_addr());
//! tokio::signal::ctrl_c().await?;
//! tracker.stop().await;
//! # Ok(())
//! # }
//! ```

mod error;
mod http;
mod swarm;

pub use error::ServerError;
pub use swarm::{Announce, SwarmPeer, SwarmRegistry, SwarmView};

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::TrackerConfig;

/// A running tracker.
#[derive(Debug)]
pub struct TrackerServer {
    local_addr: SocketAddr,
    registry: Arc<SwarmRegistry>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl TrackerServer {
    /// Binds `config.bind_addr` and starts the accept loop and, if
    /// configured, the sweeper on the ambient tokio runtime.
    pub async fn start(config: TrackerConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let registry = Arc::new(SwarmRegistry::new(config.peer_expiry));
        let (shutdown, _) = watch::channel(false);

        let mut tasks = Vec::with_capacity(2);
        if let Some(period) = config.sweep_interval {
            tasks.push(tokio::spawn(sweep(
                Arc::clone(&registry),
                period,
                config.remove_peerless_torrents,
                shutdown.subscribe(),
            )));
        }
        tasks.push(tokio::spawn(serve(
            listener,
            Arc::clone(&registry),
            Arc::new(config),
            shutdown.subscribe(),
        )));

        info!(%local_addr, "tracker listening");
        Ok(Self {
            local_addr,
            registry,
            shutdown,
            tasks,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Announce URL for clients on this host.
    pub fn announce_url(&self) -> String {
        format!("http://{}/announce", self.local_addr)
    }

    pub fn registry(&self) -> &Arc<SwarmRegistry> {
        &self.registry
    }

    /// Stops accepting announces and waits for the background tasks.
    pub async fn stop(self) {
        self.shutdown.send_replace(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                debug!(error = %e, "tracker task ended abnormally");
            }
        }
        info!(local_addr = %self.local_addr, "tracker stopped");
    }
}

async fn serve(
    listener: TcpListener,
    registry: Arc<SwarmRegistry>,
    config: Arc<TrackerConfig>,
    mut shutdown: watch::Receiver<bool>,
) {
    while !*shutdown.borrow() {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "tracker accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };
                let registry = Arc::clone(&registry);
                let config = Arc::clone(&config);
                tokio::spawn(async move {
                    let service = service_fn(move |request: hyper::Request<hyper::body::Incoming>| {
                        let response = http::handle(request.uri(), remote, &registry, &config);
                        async move { Ok::<_, Infallible>(response) }
                    });
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        debug!(%remote, error = %e, "tracker connection failed");
                    }
                });
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}

async fn sweep(
    registry: Arc<SwarmRegistry>,
    period: Duration,
    remove_empty: bool,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = period.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    while !*shutdown.borrow() {
        tokio::select! {
            _ = ticker.tick() => {
                registry.sweep(Instant::now(), remove_empty);
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}
