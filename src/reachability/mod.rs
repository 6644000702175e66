//! Host reachability
//!
//! Classifies the host network as IPv6-only or not, maps that to daemon
//! settings, and pushes the settings to a running daemon when the network
//! changes.

use crate::error::Result;
use crate::tor::TorController;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Network classification relevant to the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    /// IPv6 works and IPv4 does not
    Ipv6Only,
    /// Anything else, including no connectivity at all
    Default,
}

/// Classifies the host's current network
pub trait ConnectivityProbe: Send + Sync {
    fn classify(&self) -> Reachability;
}

/// Probe based on whether the kernel has a route to well-known addresses.
///
/// Connecting a UDP socket only performs a route lookup, nothing is sent.
#[derive(Debug, Clone)]
pub struct RouteProbe {
    v4_target: SocketAddr,
    v6_target: SocketAddr,
}

impl Default for RouteProbe {
    fn default() -> Self {
        Self {
            v4_target: SocketAddr::new(Ipv4Addr::new(9, 9, 9, 9).into(), 53),
            v6_target: SocketAddr::new(Ipv6Addr::new(0x2620, 0xfe, 0, 0, 0, 0, 0, 0xfe).into(), 53),
        }
    }
}

impl RouteProbe {
    fn has_route(target: SocketAddr) -> bool {
        let bind: SocketAddr = if target.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        UdpSocket::bind(bind)
            .and_then(|socket| socket.connect(target))
            .is_ok()
    }
}

impl ConnectivityProbe for RouteProbe {
    fn classify(&self) -> Reachability {
        let v4 = Self::has_route(self.v4_target);
        let v6 = Self::has_route(self.v6_target);
        debug!("Route probe: ipv4={} ipv6={}", v4, v6);
        classify_routes(v4, v6)
    }
}

pub fn classify_routes(v4: bool, v6: bool) -> Reachability {
    if v6 && !v4 {
        Reachability::Ipv6Only
    } else {
        Reachability::Default
    }
}

/// Daemon settings for a classification.
///
/// IPv4 is only switched off on IPv6-only networks when no bridges are
/// configured, since bridge lines commonly carry IPv4 addresses.
pub fn config_delta(reachability: Reachability, bridges_configured: bool) -> Vec<(String, String)> {
    let pairs: &[(&str, &str)] = match reachability {
        Reachability::Ipv6Only if !bridges_configured => {
            &[("ClientPreferIPv6ORPort", "1"), ("ClientUseIPv4", "0")]
        },
        Reachability::Ipv6Only => &[("ClientPreferIPv6ORPort", "1"), ("ClientUseIPv4", "1")],
        Reachability::Default => &[
            ("ClientPreferIPv6DirPort", "auto"),
            ("ClientPreferIPv6ORPort", "auto"),
            ("ClientUseIPv4", "1"),
        ],
    };
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// The same settings as launch arguments
pub fn launch_args(reachability: Reachability, bridges_configured: bool) -> Vec<String> {
    config_delta(reachability, bridges_configured)
        .into_iter()
        .flat_map(|(k, v)| [format!("--{}", k), v])
        .collect()
}

/// Applies reachability settings to a running daemon
pub struct ReachabilityAdapter {
    probe: Arc<dyn ConnectivityProbe>,
}

impl ReachabilityAdapter {
    pub fn new(probe: Arc<dyn ConnectivityProbe>) -> Self {
        Self { probe }
    }

    pub fn classify(&self) -> Reachability {
        self.probe.classify()
    }

    /// Push the current settings and rebuild circuits
    pub async fn apply(&self, controller: &TorController, bridges_configured: bool) -> Result<Reachability> {
        let reachability = self.classify();
        info!(
            "Network changed ({:?}, bridges: {}), reconfiguring Tor",
            reachability, bridges_configured
        );
        controller
            .set_conf(&config_delta(reachability, bridges_configured))
            .await?;
        controller.reset_connection().await?;
        Ok(reachability)
    }
}

/// Poll `probe` and send a notification whenever the classification changes.
///
/// Stops when the receiver is dropped.
pub fn spawn_monitor(
    probe: Arc<dyn ConnectivityProbe>,
    interval: Duration,
    changes: mpsc::Sender<Reachability>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last = probe.classify();
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let current = probe.classify();
            if current != last {
                debug!("Reachability {:?} -> {:?}", last, current);
                last = current;
                if changes.send(current).await.is_err() {
                    break;
                }
            }
        }
    })
}
