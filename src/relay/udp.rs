//! UDP proxy relay: pseudo-sessions keyed by client address.
//!
//! One listening socket per proxy port. The first datagram from a new
//! client address creates a session: a dedicated task that owns the
//! upstream socket, drains queued client payloads, and relays target
//! replies back through the shared listening socket. The receive loop
//! only touches the session table and a bounded channel, so upstream
//! setup (including name resolution) never stalls other sessions.
//! Sessions are bounded per port and evicted by a periodic staleness
//! sweep. UDP traffic is never gated by wake logic; it forwards
//! unconditionally to the configured target.

use super::SHUTDOWN_GRACE;
use crate::config::ServiceConfig;
use crate::error::{ProxyError, ProxyResult};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

/// Maximum datagram payload accepted in either direction.
const MAX_DATAGRAM_SIZE: usize = 65536;

/// How often the staleness sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Sessions idle longer than this are evicted by the next sweep.
const STALE_AFTER: Duration = Duration::from_secs(300);

/// Outbound payloads queued per session; overflow drops the datagram.
const FORWARD_QUEUE: usize = 64;

/// One client's pseudo-session. The session task owns the upstream
/// socket; this entry is just the handles the receive loop and sweep
/// need.
struct UdpSession {
    forward_tx: mpsc::Sender<Vec<u8>>,
    /// Touched only by inbound client datagrams; upstream responses do not
    /// re-arm the idle timer.
    last_activity: Instant,
    /// Cancels the per-session task.
    cancel_tx: mpsc::Sender<()>,
}

/// UDP relay for one service: listening socket, session table, sweep task.
pub struct UdpRelay {
    service: Arc<ServiceConfig>,
    sessions: Arc<Mutex<HashMap<SocketAddr, UdpSession>>>,
    cancel_tx: Option<mpsc::Sender<()>>,
    recv_task: Option<JoinHandle<()>>,
    sweep_cancel_tx: Option<mpsc::Sender<()>>,
    sweep_task: Option<JoinHandle<()>>,
    sweep_interval: Duration,
    stale_after: Duration,
}

impl UdpRelay {
    pub fn new(service: ServiceConfig) -> Self {
        Self::with_timing(service, SWEEP_INTERVAL, STALE_AFTER)
    }

    /// Construct with explicit sweep timing (tests compress it).
    pub(crate) fn with_timing(
        service: ServiceConfig,
        sweep_interval: Duration,
        stale_after: Duration,
    ) -> Self {
        Self {
            service: Arc::new(service),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            cancel_tx: None,
            recv_task: None,
            sweep_cancel_tx: None,
            sweep_task: None,
            sweep_interval,
            stale_after,
        }
    }

    /// Bind `0.0.0.0:<proxy_port>` and spawn the receive loop and the
    /// staleness sweep.
    pub async fn start(&mut self) -> ProxyResult<()> {
        let port = self.service.proxy_port;
        let listen = UdpSocket::bind(("0.0.0.0", port))
            .await
            .map_err(|source| ProxyError::Bind { port, source })?;
        let listen = Arc::new(listen);

        info!(
            proxy_port = port,
            target = %self.service.target_addr(),
            "udp proxy listening"
        );

        let (cancel_tx, cancel_rx) = mpsc::channel::<()>(1);
        let service = self.service.clone();
        let sessions = self.sessions.clone();
        self.recv_task = Some(tokio::spawn(async move {
            recv_loop(listen, cancel_rx, service, sessions).await;
        }));
        self.cancel_tx = Some(cancel_tx);

        let (sweep_cancel_tx, sweep_cancel_rx) = mpsc::channel::<()>(1);
        let sessions = self.sessions.clone();
        let sweep_interval = self.sweep_interval;
        let stale_after = self.stale_after;
        self.sweep_task = Some(tokio::spawn(async move {
            sweep_loop(sessions, sweep_cancel_rx, sweep_interval, stale_after).await;
        }));
        self.sweep_cancel_tx = Some(sweep_cancel_tx);

        Ok(())
    }

    /// Stop the relay: listening loop first (so nothing can resurrect a
    /// removed session), then the sweep, then every session. Idempotent.
    pub async fn stop(&mut self) {
        let Some(cancel_tx) = self.cancel_tx.take() else {
            return;
        };
        let _ = cancel_tx.send(()).await;
        if let Some(task) = self.recv_task.take() {
            let abort = task.abort_handle();
            if timeout(SHUTDOWN_GRACE, task).await.is_err() {
                abort.abort();
            }
        }

        if let Some(tx) = self.sweep_cancel_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(task) = self.sweep_task.take() {
            let abort = task.abort_handle();
            if timeout(SHUTDOWN_GRACE, task).await.is_err() {
                abort.abort();
            }
        }

        let mut sessions = self.sessions.lock().await;
        for (client, session) in sessions.drain() {
            let _ = session.cancel_tx.try_send(());
            debug!(client = %client, "udp session closed on shutdown");
        }
        info!(proxy_port = self.service.proxy_port, "udp proxy stopped");
    }

    /// Number of live sessions on this relay.
    #[allow(dead_code)]
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

/// Receive loop: demultiplexes inbound client datagrams into sessions.
/// This loop is the only creator of sessions, so check-then-insert on the
/// table is naturally serialized.
async fn recv_loop(
    listen: Arc<UdpSocket>,
    mut cancel_rx: mpsc::Receiver<()>,
    service: Arc<ServiceConfig>,
    sessions: Arc<Mutex<HashMap<SocketAddr, UdpSession>>>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        tokio::select! {
            _ = cancel_rx.recv() => {
                debug!(proxy_port = service.proxy_port, "udp receive loop cancelled");
                break;
            }
            result = listen.recv_from(&mut buf) => {
                match result {
                    Ok((n, client)) => {
                        handle_datagram(&buf[..n], client, &listen, &service, &sessions).await;
                    }
                    Err(e) => {
                        warn!(proxy_port = service.proxy_port, error = %e, "udp recv failed");
                    }
                }
            }
        }
    }
}

/// One inbound client datagram: touch or create the session and hand the
/// payload to its task. The lock is only held across table bookkeeping,
/// never across upstream I/O, so a slow-resolving target cannot stall
/// the other sessions on the port.
async fn handle_datagram(
    data: &[u8],
    client: SocketAddr,
    listen: &Arc<UdpSocket>,
    service: &Arc<ServiceConfig>,
    sessions: &Arc<Mutex<HashMap<SocketAddr, UdpSession>>>,
) {
    let mut table = sessions.lock().await;
    match table.get_mut(&client) {
        Some(session) => {
            session.last_activity = Instant::now();
            if session.forward_tx.try_send(data.to_vec()).is_err() {
                debug!(client = %client, "udp session backlogged, dropping packet");
            }
        }
        None => {
            if table.len() >= service.max_udp_sessions {
                warn!(
                    client = %client,
                    limit = service.max_udp_sessions,
                    "udp session limit reached, dropping packet"
                );
                return;
            }
            let (forward_tx, forward_rx) = mpsc::channel::<Vec<u8>>(FORWARD_QUEUE);
            let (cancel_tx, cancel_rx) = mpsc::channel::<()>(1);
            // Fresh channel, cannot be full.
            let _ = forward_tx.try_send(data.to_vec());
            tokio::spawn(session_task(
                listen.clone(),
                client,
                service.clone(),
                forward_rx,
                cancel_rx,
                sessions.clone(),
            ));
            table.insert(
                client,
                UdpSession {
                    forward_tx,
                    last_activity: Instant::now(),
                    cancel_tx,
                },
            );
            debug!(
                client = %client,
                sessions = table.len(),
                "udp session created"
            );
        }
    }
}

/// Per-session task: bind and connect the upstream socket, then forward
/// queued client payloads and relay target replies back to the client
/// through the shared listening socket. Setup failure or an upstream
/// socket error tears the session down.
async fn session_task(
    listen: Arc<UdpSocket>,
    client: SocketAddr,
    service: Arc<ServiceConfig>,
    mut forward_rx: mpsc::Receiver<Vec<u8>>,
    mut cancel_rx: mpsc::Receiver<()>,
    sessions: Arc<Mutex<HashMap<SocketAddr, UdpSession>>>,
) {
    let upstream = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => socket,
        Err(e) => {
            warn!(client = %client, error = %e, "cannot bind upstream socket");
            sessions.lock().await.remove(&client);
            return;
        }
    };
    if let Err(e) = upstream
        .connect((service.target_host.as_str(), service.target_port))
        .await
    {
        warn!(
            client = %client,
            target = %service.target_addr(),
            error = %e,
            "cannot connect upstream socket"
        );
        sessions.lock().await.remove(&client);
        return;
    }

    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        tokio::select! {
            _ = cancel_rx.recv() => break,
            payload = forward_rx.recv() => {
                // None means the table entry is already gone.
                let Some(payload) = payload else { break };
                if let Err(e) = upstream.send(&payload).await {
                    warn!(
                        client = %client,
                        target = %service.target_addr(),
                        error = %e,
                        "udp forward failed"
                    );
                }
            }
            result = upstream.recv(&mut buf) => {
                match result {
                    Ok(n) => {
                        // Deliberately no last_activity touch here: only
                        // client-originated traffic keeps a session alive.
                        if let Err(e) = listen.send_to(&buf[..n], client).await {
                            debug!(client = %client, error = %e, "udp response send failed");
                        }
                    }
                    Err(e) => {
                        debug!(client = %client, error = %e, "upstream socket closed");
                        sessions.lock().await.remove(&client);
                        break;
                    }
                }
            }
        }
    }
}

/// Staleness sweep: on each tick, evict every session whose last client
/// activity is older than the threshold.
async fn sweep_loop(
    sessions: Arc<Mutex<HashMap<SocketAddr, UdpSession>>>,
    mut cancel_rx: mpsc::Receiver<()>,
    sweep_interval: Duration,
    stale_after: Duration,
) {
    loop {
        tokio::select! {
            _ = cancel_rx.recv() => break,
            _ = sleep(sweep_interval) => {
                let mut table = sessions.lock().await;
                let now = Instant::now();
                let stale: Vec<SocketAddr> = table
                    .iter()
                    .filter(|(_, s)| now.duration_since(s.last_activity) > stale_after)
                    .map(|(addr, _)| *addr)
                    .collect();
                for client in stale {
                    if let Some(session) = table.remove(&client) {
                        let _ = session.cancel_tx.try_send(());
                        debug!(client = %client, "evicted idle udp session");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;

    fn service(proxy_port: u16, target_port: u16, max_udp_sessions: usize) -> ServiceConfig {
        service_for_host("127.0.0.1", proxy_port, target_port, max_udp_sessions)
    }

    fn service_for_host(
        host: &str,
        proxy_port: u16,
        target_port: u16,
        max_udp_sessions: usize,
    ) -> ServiceConfig {
        ServiceConfig {
            target_host: host.to_string(),
            target_port,
            proxy_port,
            mac_address: "AA:BB:CC:DD:EE:FF".parse().unwrap(),
            protocol: Protocol::Udp,
            wake_timeout: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(10),
            connection_timeout: Duration::from_secs(1),
            max_udp_sessions,
        }
    }

    async fn free_udp_port() -> u16 {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = sock.local_addr().unwrap().port();
        drop(sock);
        port
    }

    /// UDP echo server standing in for the target.
    async fn spawn_echo_target() -> (u16, JoinHandle<()>) {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = sock.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                let Ok((n, peer)) = sock.recv_from(&mut buf).await else {
                    break;
                };
                let _ = sock.send_to(&buf[..n], peer).await;
            }
        });
        (port, task)
    }

    async fn recv_with_timeout(sock: &UdpSocket, wait: Duration) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        match timeout(wait, sock.recv_from(&mut buf)).await {
            Ok(Ok((n, _))) => Some(buf[..n].to_vec()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_forward_and_response() {
        let (target_port, echo) = spawn_echo_target().await;
        let proxy_port = free_udp_port().await;
        let mut relay = UdpRelay::new(service(proxy_port, target_port, 100));
        relay.start().await.unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(b"ping", ("127.0.0.1", proxy_port))
            .await
            .unwrap();
        let reply = recv_with_timeout(&client, Duration::from_secs(2)).await;
        assert_eq!(reply.as_deref(), Some(&b"ping"[..]));
        assert_eq!(relay.session_count().await, 1);

        relay.stop().await;
        echo.abort();
    }

    #[tokio::test]
    async fn test_session_limit_drops_new_clients() {
        let (target_port, echo) = spawn_echo_target().await;
        let proxy_port = free_udp_port().await;
        let mut relay = UdpRelay::new(service(proxy_port, target_port, 2));
        relay.start().await.unwrap();

        let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let third = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        first.send_to(b"a", ("127.0.0.1", proxy_port)).await.unwrap();
        second.send_to(b"b", ("127.0.0.1", proxy_port)).await.unwrap();
        assert!(recv_with_timeout(&first, Duration::from_secs(2)).await.is_some());
        assert!(recv_with_timeout(&second, Duration::from_secs(2)).await.is_some());

        // Table is at capacity: the third client's first packet is dropped.
        third.send_to(b"c", ("127.0.0.1", proxy_port)).await.unwrap();
        assert!(recv_with_timeout(&third, Duration::from_millis(500)).await.is_none());
        assert_eq!(relay.session_count().await, 2);

        // Existing sessions keep working.
        first.send_to(b"again", ("127.0.0.1", proxy_port)).await.unwrap();
        assert!(recv_with_timeout(&first, Duration::from_secs(2)).await.is_some());

        relay.stop().await;
        echo.abort();
    }

    #[tokio::test]
    async fn test_rapid_packets_share_one_session() {
        let (target_port, echo) = spawn_echo_target().await;
        let proxy_port = free_udp_port().await;
        let mut relay = UdpRelay::new(service(proxy_port, target_port, 100));
        relay.start().await.unwrap();

        // Burst from a new client before its session finishes setup:
        // everything queues behind the one session, nothing is lost.
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for payload in [&b"one"[..], b"two", b"three"] {
            client
                .send_to(payload, ("127.0.0.1", proxy_port))
                .await
                .unwrap();
        }
        let mut replies = Vec::new();
        for _ in 0..3 {
            replies.push(recv_with_timeout(&client, Duration::from_secs(2)).await);
        }
        assert_eq!(
            replies,
            vec![
                Some(b"one".to_vec()),
                Some(b"two".to_vec()),
                Some(b"three".to_vec()),
            ]
        );
        assert_eq!(relay.session_count().await, 1);

        relay.stop().await;
        echo.abort();
    }

    #[tokio::test]
    async fn test_failed_session_setup_releases_slot() {
        let proxy_port = free_udp_port().await;
        let mut relay = UdpRelay::new(service_for_host(
            "noexist.invalid",
            proxy_port,
            9,
            100,
        ));
        relay.start().await.unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(b"hello", ("127.0.0.1", proxy_port))
            .await
            .unwrap();

        // Resolution fails in the session task, which removes its own
        // table entry.
        let mut remaining = 1;
        for _ in 0..50 {
            remaining = relay.session_count().await;
            if remaining == 0 {
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(remaining, 0);

        relay.stop().await;
    }

    #[tokio::test]
    async fn test_idle_sessions_are_evicted() {
        let (target_port, echo) = spawn_echo_target().await;
        let proxy_port = free_udp_port().await;
        let mut relay = UdpRelay::with_timing(
            service(proxy_port, target_port, 100),
            Duration::from_millis(100),
            Duration::from_millis(200),
        );
        relay.start().await.unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(b"hello", ("127.0.0.1", proxy_port))
            .await
            .unwrap();
        assert!(recv_with_timeout(&client, Duration::from_secs(2)).await.is_some());
        assert_eq!(relay.session_count().await, 1);

        // No client traffic past the staleness threshold: the sweep
        // removes the session.
        sleep(Duration::from_millis(600)).await;
        assert_eq!(relay.session_count().await, 0);

        relay.stop().await;
        echo.abort();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let proxy_port = free_udp_port().await;
        let mut relay = UdpRelay::new(service(proxy_port, free_udp_port().await, 100));
        relay.start().await.unwrap();
        relay.stop().await;
        relay.stop().await;
        assert_eq!(relay.session_count().await, 0);
    }
}
