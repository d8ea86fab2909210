//! TCP proxy relay: accept loop, availability gate, bidirectional pump.
//!
//! Every accepted connection runs the gating sequence — probe the target,
//! wake it if necessary — and only on success is a target connection opened
//! and the two directional pumps started. A client whose target cannot be
//! woken is closed with no data exchanged; the proxy speaks no protocol of
//! its own.

use super::SHUTDOWN_GRACE;
use crate::config::ServiceConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::probe::probe;
use crate::wol::WakeCoordinator;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Per-direction chunk size; nothing is buffered beyond one in-flight chunk.
const RELAY_BUF_SIZE: usize = 8192;

/// TCP relay for one service: owns the accept loop and the per-connection
/// tasks spawned from it.
pub struct TcpRelay {
    service: Arc<ServiceConfig>,
    wol: Arc<WakeCoordinator>,
    /// Signals the accept loop to shut down.
    cancel_tx: Option<mpsc::Sender<()>>,
    accept_task: Option<JoinHandle<()>>,
}

impl TcpRelay {
    pub fn new(service: ServiceConfig, wol: Arc<WakeCoordinator>) -> Self {
        Self {
            service: Arc::new(service),
            wol,
            cancel_tx: None,
            accept_task: None,
        }
    }

    /// Bind `0.0.0.0:<proxy_port>` and spawn the accept loop.
    pub async fn start(&mut self) -> ProxyResult<()> {
        let port = self.service.proxy_port;
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|source| ProxyError::Bind { port, source })?;

        info!(
            proxy_port = port,
            target = %self.service.target_addr(),
            "tcp proxy listening"
        );

        let (cancel_tx, cancel_rx) = mpsc::channel::<()>(1);
        let service = self.service.clone();
        let wol = self.wol.clone();
        self.accept_task = Some(tokio::spawn(async move {
            accept_loop(listener, cancel_rx, service, wol).await;
        }));
        self.cancel_tx = Some(cancel_tx);
        Ok(())
    }

    /// Stop accepting and wait for active relays to drain, aborting any
    /// that outlive the grace period. Safe to call more than once.
    pub async fn stop(&mut self) {
        let Some(cancel_tx) = self.cancel_tx.take() else {
            return;
        };
        let _ = cancel_tx.send(()).await;
        if let Some(task) = self.accept_task.take() {
            let abort = task.abort_handle();
            if timeout(SHUTDOWN_GRACE, task).await.is_err() {
                warn!(
                    proxy_port = self.service.proxy_port,
                    "tcp relay did not drain in time, aborting"
                );
                abort.abort();
            }
        }
        info!(proxy_port = self.service.proxy_port, "tcp proxy stopped");
    }
}

/// Accept loop: spawns one gated connection task per client, tracked in a
/// `JoinSet` so shutdown can enumerate what is still draining.
async fn accept_loop(
    listener: TcpListener,
    mut cancel_rx: mpsc::Receiver<()>,
    service: Arc<ServiceConfig>,
    wol: Arc<WakeCoordinator>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel_rx.recv() => {
                debug!(proxy_port = service.proxy_port, "accept loop cancelled");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((client, peer)) => {
                        let service = service.clone();
                        let wol = wol.clone();
                        connections.spawn(async move {
                            handle_connection(client, peer, service, wol).await;
                        });
                    }
                    Err(e) => {
                        warn!(proxy_port = service.proxy_port, error = %e, "accept failed");
                    }
                }
            }
            // Reap finished connection tasks as they complete.
            Some(_) = connections.join_next() => {}
        }
    }

    // Stop accepting before draining: in-flight relays are expected to end
    // naturally when their sockets close.
    drop(listener);
    if !connections.is_empty() {
        debug!(
            proxy_port = service.proxy_port,
            active = connections.len(),
            "waiting for active relays to drain"
        );
        let drain = async {
            while connections.join_next().await.is_some() {}
        };
        if timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!(
                proxy_port = service.proxy_port,
                "shutdown grace elapsed, aborting remaining relays"
            );
            connections.abort_all();
        }
    }
}

/// One accepted client: gate, connect to the target, pump until both
/// directions end. Every exit path drops (and thereby closes) the client
/// socket.
async fn handle_connection(
    client: TcpStream,
    peer: SocketAddr,
    service: Arc<ServiceConfig>,
    wol: Arc<WakeCoordinator>,
) {
    debug!(peer = %peer, target = %service.target_addr(), "client connected");

    if !ensure_available(&service, &wol).await {
        warn!(
            peer = %peer,
            target = %service.target_addr(),
            "target unavailable, closing client connection"
        );
        return;
    }

    let target = match timeout(
        service.connection_timeout,
        TcpStream::connect((service.target_host.as_str(), service.target_port)),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(target = %service.target_addr(), error = %e, "target connect failed");
            return;
        }
        Err(_) => {
            warn!(target = %service.target_addr(), "target connect timed out");
            return;
        }
    };

    pump(client, target).await;
    debug!(peer = %peer, "tcp relay ended");
}

/// The gate: probe first, wake only if the probe fails.
async fn ensure_available(service: &ServiceConfig, wol: &WakeCoordinator) -> bool {
    if probe(
        &service.target_host,
        service.target_port,
        service.connection_timeout,
    )
    .await
    {
        return true;
    }
    info!(target = %service.target_addr(), "target not reachable, attempting wake");
    wol.ensure_awake(
        &service.mac_address,
        &service.target_host,
        service.target_port,
        service.wake_timeout,
    )
    .await
}

/// Bidirectional byte pump between two established streams.
///
/// Each direction runs independently; when one ends it half-closes its
/// destination, and the pump completes once both have ended.
pub(crate) async fn pump(client: TcpStream, target: TcpStream) {
    let (client_read, client_write) = client.into_split();
    let (target_read, target_write) = target.into_split();

    let client_to_target = tokio::spawn(forward(client_read, target_write, "client->target"));
    let target_to_client = tokio::spawn(forward(target_read, client_write, "target->client"));

    let _ = client_to_target.await;
    let _ = target_to_client.await;
}

/// One direction: read a chunk, write it through unmodified, repeat until
/// end-of-stream or error, then shut down the destination's write side.
async fn forward(mut read: OwnedReadHalf, mut write: OwnedWriteHalf, direction: &'static str) {
    let mut buf = vec![0u8; RELAY_BUF_SIZE];
    loop {
        match read.read(&mut buf).await {
            Ok(0) => {
                debug!(direction, "end of stream");
                break;
            }
            Ok(n) => {
                if let Err(e) = write.write_all(&buf[..n]).await {
                    debug!(direction, error = %e, "write failed");
                    break;
                }
            }
            Err(e) => {
                debug!(direction, error = %e, "read failed");
                break;
            }
        }
    }
    let _ = write.shutdown().await;
}
