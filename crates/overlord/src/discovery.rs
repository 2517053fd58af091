//! UDP LAN discovery beacon. Peripheral to the core, kept
//! alive alongside it so agents on the local network can find the hub
//! without being told its address up front.

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{info, warn};

pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(5);

/// Broadcasts `OVERLORD :<agent_port>` on the IPv4 broadcast address every
/// [`DISCOVERY_INTERVAL`].
pub async fn run(agent_port: u16, discovery_port: u16) {
    let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!("discovery beacon disabled, could not bind UDP socket: {e}");
            return;
        }
    };

    if let Err(e) = socket.set_broadcast(true) {
        warn!("discovery beacon disabled, could not enable broadcast: {e}");
        return;
    }

    let payload = format!("OVERLORD :{agent_port}");
    let dest = (Ipv4Addr::BROADCAST, discovery_port);
    let mut ticker = tokio::time::interval(DISCOVERY_INTERVAL);

    info!("discovery beacon broadcasting \"{payload}\" on UDP :{discovery_port} every {DISCOVERY_INTERVAL:?}");
    loop {
        ticker.tick().await;
        if let Err(e) = socket.send_to(payload.as_bytes(), dest).await {
            warn!("discovery beacon send failed: {e}");
        }
    }
}
