//! Process startup flags: which app directory to serve, which ports to
//! listen on, and whether to run the LAN discovery beacon.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "overlordd", about = "Remote-agent coordination hub")]
pub struct Cli {
    /// Name of the static-asset app directory to serve for the operator UI.
    #[arg(long, default_value = "dashboard")]
    pub app: String,

    /// Root directory under which `<apps-dir>/<app>` is served.
    #[arg(long, default_value = "app")]
    pub apps_dir: PathBuf,

    /// TCP port ghost agents connect to.
    #[arg(long, env = "OVERLORD_PORT", default_value_t = 4455)]
    pub agent_port: u16,

    /// Bind address for the agent TCP listener.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub agent_bind: IpAddr,

    /// UDP port the discovery beacon broadcasts on.
    #[arg(long, env = "OVERLORD_LD_PORT", default_value_t = 4456)]
    pub discovery_port: u16,

    /// Bind address for the operator HTTP/WebSocket server.
    #[arg(long, env = "OVERLORD_WEB_ADDR", default_value = "127.0.0.1:9000")]
    pub web_addr: SocketAddr,

    /// Disable the UDP LAN discovery beacon.
    #[arg(long)]
    pub no_discovery: bool,
}
