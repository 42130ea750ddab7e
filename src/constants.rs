//! Protocol-wide constants.
//!
//! Centralizes the timeouts, ports, and buffer sizes shared by the agent and
//! the server so both sides stay in agreement.

use std::time::Duration;

/// Read buffer size for control channels and byte bridges.
pub const BUFSIZE: usize = 8192;

/// Block size for file transfer streaming.
pub const BLOCK_SIZE: usize = 4096;

/// Message separator on the control channel: exactly CR LF.
pub const SEPARATOR: &[u8] = b"\r\n";

/// Delay between reconnect attempts after the candidate list is exhausted.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// TCP connect timeout, also used for the TLS probe and forward targets.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// How often the agent pings the server once registered.
pub const PING_INTERVAL: Duration = Duration::from_secs(5);

/// How long a ping may go unanswered before the connection is torn down.
pub const PING_TIMEOUT_SECS: i64 = 10;

/// Default timeout for tracked requests.
pub const REQUEST_TIMEOUT_SECS: i64 = 60;

/// Default grace period before a server-side pending session is evicted.
pub const SESSION_GRACE: Duration = Duration::from_secs(30);

/// Ports probed on a bare host candidate (HTTPS first, then HTTP).
pub const DEFAULT_HTTPS_PORT: u16 = 443;
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Default listen port for agent connections on the server.
pub const DEFAULT_SERVER_PORT: u16 = 9000;

/// Default listen port for the server's operator endpoint.
pub const DEFAULT_OPERATOR_PORT: u16 = 9008;

/// Sentinel that, repeated twice, closes a shell session's stdin.
pub const STDIN_CLOSED: &str = "##STDIN_CLOSED##";

/// UDP port the agent listens on for LAN discovery beacons.
///
/// Overridable with `OVERLORD_LD_PORT` so test fixtures can avoid clashing.
pub fn lan_discovery_port() -> u16 {
    port_from_env("OVERLORD_LD_PORT", 4456)
}

/// Loopback TCP port for the agent's local IPC endpoint.
///
/// Overridable with `OVERLORD_AGENT_RPC_PORT`.
pub fn agent_rpc_port() -> u16 {
    port_from_env("OVERLORD_AGENT_RPC_PORT", 4500)
}

fn port_from_env(var: &str, default: u16) -> u16 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
