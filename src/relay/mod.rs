//! Proxy relays — one per configured service, selected by protocol at
//! service-start time and driven through a single `start`/`stop` surface.

pub mod tcp;
pub mod udp;

use crate::config::{Protocol, ServiceConfig};
use crate::error::ProxyResult;
use crate::wol::WakeCoordinator;
use std::sync::Arc;
use std::time::Duration;
use tcp::TcpRelay;
use udp::UdpRelay;

/// How long a stopping relay waits for in-flight work to drain before
/// aborting whatever is left.
pub(crate) const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A started proxy listener for one service: either a TCP accept loop with
/// a wake gate, or a UDP pseudo-session relay.
pub enum ServiceRelay {
    Tcp(TcpRelay),
    Udp(UdpRelay),
}

impl ServiceRelay {
    /// Build the relay variant matching the service's configured protocol.
    pub fn for_service(service: ServiceConfig, wol: Arc<WakeCoordinator>) -> Self {
        match service.protocol {
            Protocol::Tcp => ServiceRelay::Tcp(TcpRelay::new(service, wol)),
            Protocol::Udp => ServiceRelay::Udp(UdpRelay::new(service)),
        }
    }

    /// Bind the proxy port and start serving. Errors here (port in use,
    /// permission denied) are fatal for this one service only.
    pub async fn start(&mut self) -> ProxyResult<()> {
        match self {
            ServiceRelay::Tcp(relay) => relay.start().await,
            ServiceRelay::Udp(relay) => relay.start().await,
        }
    }

    /// Stop serving and release the proxy port. Idempotent, bounded by
    /// [`SHUTDOWN_GRACE`].
    pub async fn stop(&mut self) {
        match self {
            ServiceRelay::Tcp(relay) => relay.stop().await,
            ServiceRelay::Udp(relay) => relay.stop().await,
        }
    }
}
