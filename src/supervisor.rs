//! Service supervision: owns every configured service's relay and
//! health-check loop for the lifetime of the process.
//!
//! A bind failure is fatal only for that one service; the supervisor keeps
//! starting the rest and reports what failed. Health loops only update
//! observable status and never block traffic.

use crate::config::{Config, ServiceConfig};
use crate::error::ProxyResult;
use crate::probe::probe;
use crate::relay::{ServiceRelay, SHUTDOWN_GRACE};
use crate::wol::WakeCoordinator;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info};

/// Last-known target availability, written only by that service's
/// health-check loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Unknown,
    Up,
    Down,
}

/// Everything the supervisor holds for one started service.
struct ServiceRuntime {
    relay: ServiceRelay,
    health_cancel_tx: mpsc::Sender<()>,
    health_task: JoinHandle<()>,
    health_rx: watch::Receiver<Health>,
}

/// The supervisor: one per process, owns all service runtimes and the
/// shared wake coordinator.
pub struct ProxyServer {
    config: Config,
    wol: Arc<WakeCoordinator>,
    services: Mutex<HashMap<u16, ServiceRuntime>>,
}

impl ProxyServer {
    pub fn new(config: Config) -> Self {
        let wol = Arc::new(WakeCoordinator::new(config.broadcast_addr));
        Self {
            config,
            wol,
            services: Mutex::new(HashMap::new()),
        }
    }

    /// Start every configured service and its health-check loop. Returns
    /// how many services actually started; failures are logged per
    /// service and do not stop the others.
    pub async fn start(&self) -> usize {
        let mut started = 0;
        for service in self.config.services.clone() {
            let proxy_port = service.proxy_port;
            match self.start_service(service).await {
                Ok(runtime) => {
                    self.services.lock().await.insert(proxy_port, runtime);
                    started += 1;
                }
                Err(e) => {
                    error!(proxy_port, error = %e, "failed to start service");
                }
            }
        }
        info!(
            started,
            configured = self.config.services.len(),
            "proxy services started"
        );
        started
    }

    async fn start_service(&self, service: ServiceConfig) -> ProxyResult<ServiceRuntime> {
        let mut relay = ServiceRelay::for_service(service.clone(), self.wol.clone());
        relay.start().await?;

        let (health_tx, health_rx) = watch::channel(Health::Unknown);
        let (health_cancel_tx, health_cancel_rx) = mpsc::channel::<()>(1);
        let health_task = tokio::spawn(async move {
            health_check_loop(service, health_tx, health_cancel_rx).await;
        });

        Ok(ServiceRuntime {
            relay,
            health_cancel_tx,
            health_task,
            health_rx,
        })
    }

    /// Last-known availability of the service on `proxy_port`, or `None`
    /// if no such service is running. Exposed for operational tooling.
    #[allow(dead_code)]
    pub async fn status(&self, proxy_port: u16) -> Option<Health> {
        self.services
            .lock()
            .await
            .get(&proxy_port)
            .map(|runtime| *runtime.health_rx.borrow())
    }

    /// Stop everything: cancel health loops, stop relays, clear the
    /// service table. Idempotent, and each component wait is bounded so a
    /// stuck task cannot hang shutdown.
    pub async fn stop(&self) {
        let services: Vec<(u16, ServiceRuntime)> =
            self.services.lock().await.drain().collect();
        if services.is_empty() {
            return;
        }
        info!("stopping proxy server");

        // Health loops first so no status write races relay teardown.
        for (_, runtime) in &services {
            let _ = runtime.health_cancel_tx.send(()).await;
        }

        for (proxy_port, mut runtime) in services {
            runtime.relay.stop().await;
            let abort = runtime.health_task.abort_handle();
            if timeout(SHUTDOWN_GRACE, runtime.health_task).await.is_err() {
                abort.abort();
            }
            debug!(proxy_port, "service stopped");
        }
        info!("proxy server stopped");
    }
}

/// Health-check loop for one service: probe, record, sleep, repeat until
/// cancelled. Only transitions between known states are worth reporting.
async fn health_check_loop(
    service: ServiceConfig,
    status_tx: watch::Sender<Health>,
    mut cancel_rx: mpsc::Receiver<()>,
) {
    info!(target = %service.target_addr(), "health check started");
    loop {
        tokio::select! {
            _ = cancel_rx.recv() => {
                debug!(target = %service.target_addr(), "health check cancelled");
                break;
            }
            _ = health_tick(&service, &status_tx) => {}
        }
    }
}

async fn health_tick(service: &ServiceConfig, status_tx: &watch::Sender<Health>) {
    let up = probe(
        &service.target_host,
        service.target_port,
        service.connection_timeout,
    )
    .await;
    let next = if up { Health::Up } else { Health::Down };
    let prev = *status_tx.borrow();
    if prev != Health::Unknown && prev != next {
        info!(
            target = %service.target_addr(),
            status = if up { "available" } else { "unavailable" },
            "target status changed"
        );
    }
    let _ = status_tx.send(next);
    sleep(service.health_check_interval).await;
}
