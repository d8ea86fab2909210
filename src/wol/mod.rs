//! Wake coordination — ensures at most one in-flight wake sequence per
//! target, with join semantics for concurrent callers.
//!
//! The in-flight registry maps `"host:port"` to a `broadcast` channel. The
//! first caller for a target registers the attempt, sends one magic packet,
//! and polls the prober until the target answers or the wake timeout
//! elapses; everyone who arrives while the attempt is active subscribes to
//! the same channel and observes the same outcome. The registration is
//! cleared before the outcome is published, so a later caller can never
//! join a finished attempt.

mod magic;

pub use magic::{magic_packet, send_magic_packet, MacAddr, MAGIC_PACKET_LEN};

use crate::probe::probe;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// How often the prober is polled while waiting for a woken target.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Per-poll connect timeout while waiting for a woken target.
const POLL_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Deduplicating wake-and-wait coordinator.
///
/// Owned by the supervisor and shared (`Arc`) with every TCP relay so that
/// concurrent connections to any proxy port funnel through one registry.
pub struct WakeCoordinator {
    /// Destination for magic packets.
    broadcast_addr: SocketAddr,
    /// Active wake attempts: `"host:port"` to the channel that will carry
    /// the attempt's outcome.
    in_flight: Mutex<HashMap<String, broadcast::Sender<bool>>>,
    poll_interval: Duration,
}

impl WakeCoordinator {
    pub fn new(broadcast_addr: SocketAddr) -> Self {
        Self {
            broadcast_addr,
            in_flight: Mutex::new(HashMap::new()),
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Test constructor with a compressed poll interval.
    #[cfg(test)]
    fn with_poll_interval(broadcast_addr: SocketAddr, poll_interval: Duration) -> Self {
        Self {
            broadcast_addr,
            in_flight: Mutex::new(HashMap::new()),
            poll_interval,
        }
    }

    /// Ensure `host:port` is awake, waking it via `mac` if necessary.
    ///
    /// Returns `true` once the target accepts connections, `false` if it
    /// never became reachable within `wake_timeout` (or the wake signal
    /// could not be sent). `false` means "target unavailable", never a
    /// fatal condition.
    ///
    /// At most one wake signal is emitted per target per attempt window:
    /// callers that arrive while an attempt is in flight wait on that
    /// attempt's outcome instead of sending their own signal.
    pub async fn ensure_awake(
        &self,
        mac: &MacAddr,
        host: &str,
        port: u16,
        wake_timeout: Duration,
    ) -> bool {
        let key = format!("{}:{}", host, port);

        // Membership check and insert under one lock acquisition, with no
        // await point in between.
        let mut join_rx = {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.get(&key) {
                Some(tx) => Some(tx.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    in_flight.insert(key.clone(), tx);
                    None
                }
            }
        };

        if let Some(rx) = join_rx.as_mut() {
            info!(target = %key, "wake attempt already in flight, waiting on its outcome");
            // A closed channel means the owning attempt went away without
            // publishing; report unavailable rather than guessing.
            return rx.recv().await.unwrap_or(false);
        }

        let woke = self.run_attempt(mac, host, port, wake_timeout).await;

        // Clear the registration first, then publish, so a new caller
        // observing the map either starts fresh or joins a live attempt.
        let tx = self.in_flight.lock().await.remove(&key);
        if let Some(tx) = tx {
            let _ = tx.send(woke);
        }
        woke
    }

    /// One wake sequence: probe, send a single magic packet, poll until
    /// reachable or timeout.
    async fn run_attempt(
        &self,
        mac: &MacAddr,
        host: &str,
        port: u16,
        wake_timeout: Duration,
    ) -> bool {
        if probe(host, port, POLL_PROBE_TIMEOUT).await {
            debug!(host, port, "target already awake, no wake signal needed");
            return true;
        }

        info!(mac = %mac, host, port, "sending wake signal");
        if let Err(e) = send_magic_packet(mac, self.broadcast_addr).await {
            warn!(mac = %mac, error = %e, "failed to send wake signal");
            return false;
        }

        info!(
            host,
            port,
            timeout_secs = wake_timeout.as_secs(),
            "waiting for target to become reachable"
        );
        let deadline = Instant::now() + wake_timeout;
        loop {
            if probe(host, port, POLL_PROBE_TIMEOUT).await {
                info!(host, port, "target is reachable");
                return true;
            }
            if Instant::now() + self.poll_interval > deadline {
                warn!(
                    host,
                    port,
                    timeout_secs = wake_timeout.as_secs(),
                    "target did not wake up in time"
                );
                return false;
            }
            sleep(self.poll_interval).await;
        }
    }
}
