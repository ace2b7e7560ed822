use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::error::TrackerError;
use super::http::HttpTracker;
use super::response::{AnnounceRequest, AnnounceResponse, TrackerEvent};
use crate::constants::{
    ANNOUNCE_JITTER, BACKOFF_EXPONENT_CAP, DEFAULT_NUMWANT, TRACKER_ANNOUNCE_INTERVAL,
    TRACKER_RETRY_BASE_DELAY,
};
use crate::metainfo::InfoHash;
use crate::peer::PeerId;

/// Byte counters reported in every announce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// The swarm participant an [`Announcer`] speaks for.
pub trait SwarmMember: Send + Sync {
    fn transfer_stats(&self) -> TransferStats;

    /// Called with the peers of every successful announce.
    fn on_peers(&self, peers: Vec<SocketAddr>);
}

/// Drives the announce cycle of one torrent against its trackers.
pub struct Announcer {
    trackers: Vec<HttpTracker>,
    info_hash: InfoHash,
    peer_id: PeerId,
    port: u16,
    member: Arc<dyn SwarmMember>,
    failures: u32,
}

impl Announcer {
    /// Builds an announcer over `urls`, in order. URLs that are not HTTP are
    /// skipped; [`TrackerError::NoTrackers`] is returned when none remain.
    pub fn new<S: AsRef<str>>(
        urls: &[S],
        info_hash: InfoHash,
        peer_id: PeerId,
        port: u16,
        member: Arc<dyn SwarmMember>,
    ) -> Result<Self, TrackerError> {
        let trackers: Vec<HttpTracker> = urls
            .iter()
            .filter_map(|url| match HttpTracker::new(url.as_ref()) {
                Ok(tracker) => Some(tracker),
                Err(e) => {
                    warn!(url = url.as_ref(), error = %e, "skipping tracker");
                    None
                }
            })
            .collect();
        if trackers.is_empty() {
            return Err(TrackerError::NoTrackers);
        }

        Ok(Self {
            trackers,
            info_hash,
            peer_id,
            port,
            member,
            failures: 0,
        })
    }

    pub fn trackers(&self) -> &[HttpTracker] {
        &self.trackers
    }

    /// Sends one announce, trying each tracker in order until one answers.
    /// Returns the last error when all of them fail.
    pub async fn announce(&self, event: TrackerEvent) -> Result<AnnounceResponse, TrackerError> {
        let stats = self.member.transfer_stats();
        let request = AnnounceRequest {
            info_hash: self.info_hash,
            peer_id: self.peer_id,
            port: self.port,
            uploaded: stats.uploaded,
            downloaded: stats.downloaded,
            left: stats.left,
            event,
            numwant: (event != TrackerEvent::Stopped).then_some(DEFAULT_NUMWANT),
        };

        let mut last_error = TrackerError::NoTrackers;
        for tracker in &self.trackers {
            match tracker.announce(&request).await {
                Ok(response) => {
                    if let Some(warning) = &response.warning_message {
                        warn!(url = tracker.url(), warning = %warning, "tracker warning");
                    }
                    return Ok(response);
                }
                Err(e) => {
                    debug!(url = tracker.url(), error = %e, "announce failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Runs until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// Sends `started` first and `completed` once when `completed` turns
    /// `true` after the start; a torrent that starts complete never sends it.
    /// `stopped` is sent on shutdown if `started` ever went through.
    pub async fn run(mut self, mut completed: watch::Receiver<bool>, mut shutdown: watch::Receiver<bool>) {
        let mut started = false;
        let mut completed_pending = false;
        let mut watch_completion = !*completed.borrow_and_update();

        while !*shutdown.borrow() {
            let event = if !started {
                TrackerEvent::Started
            } else if completed_pending {
                TrackerEvent::Completed
            } else {
                TrackerEvent::None
            };

            let delay = match self.announce(event).await {
                Ok(response) => {
                    self.failures = 0;
                    match event {
                        TrackerEvent::Started => started = true,
                        TrackerEvent::Completed => completed_pending = false,
                        _ => {}
                    }
                    info!(
                        info_hash = %self.info_hash,
                        event = event.as_str(),
                        peers = response.peers.len(),
                        interval = response.interval,
                        "announced"
                    );
                    self.member.on_peers(response.peers.clone());
                    next_interval(&response)
                }
                Err(e) => {
                    self.failures = self.failures.saturating_add(1);
                    let delay = backoff_delay(self.failures);
                    warn!(info_hash = %self.info_hash, error = %e, retry_in = ?delay, "announce failed");
                    delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = completed.changed(), if watch_completion => {
                    match changed {
                        Ok(()) if *completed.borrow_and_update() => {
                            watch_completion = false;
                            completed_pending = true;
                        }
                        Ok(()) => {}
                        Err(_) => watch_completion = false,
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        if started {
            match self.announce(TrackerEvent::Stopped).await {
                Ok(_) => debug!(info_hash = %self.info_hash, "announced stopped"),
                Err(e) => debug!(info_hash = %self.info_hash, error = %e, "stopped announce failed"),
            }
        }
    }
}

/// The tracker's interval, raised to its `min interval` and jittered.
pub(crate) fn next_interval(response: &AnnounceResponse) -> Duration {
    let secs = response.interval.max(response.min_interval.unwrap_or(0));
    let base = if secs == 0 {
        TRACKER_ANNOUNCE_INTERVAL
    } else {
        Duration::from_secs(u64::from(secs))
    };
    let factor = 1.0 + rand::rng().random_range(-ANNOUNCE_JITTER..=ANNOUNCE_JITTER);
    base.mul_f64(factor)
}

/// Exponential retry delay after `failures` consecutive failures.
pub(crate) fn backoff_delay(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(BACKOFF_EXPONENT_CAP);
    TRACKER_RETRY_BASE_DELAY * 2u32.pow(exponent)
}
