//! Server discovery.
//!
//! The agent builds an ordered, de-duplicated candidate list from several
//! sources: caller-supplied addresses (bare hosts get the default HTTPS and
//! HTTP ports), the loopback addresses, gateway IPs parsed from the OS
//! routing table, and LAN beacons.
//!
//! Beacons are UDP datagrams of the form `OVERLORD <host>:<port>` on a fixed
//! port; an empty host means "use the sender's source address". The listener
//! task publishes beacon addresses into the agent's event channel. While the
//! agent is registered the listener is paused: received beacons are buffered
//! locally and flushed when the control loop resumes discovery on
//! disconnect.

use std::net::{IpAddr, Ipv4Addr};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

use crate::constants::{BUFSIZE, DEFAULT_HTTPS_PORT, DEFAULT_HTTP_PORT};

/// One candidate server address.
pub type Candidate = (String, u16);

/// Expand a caller-supplied address: `host:port` stays as-is, a bare host
/// fans out to the default HTTPS and HTTP ports.
pub fn expand_addr(addr: &str) -> Vec<Candidate> {
    match addr.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => vec![(host.to_string(), port)],
            Err(_) => default_ports(addr),
        },
        None => default_ports(addr),
    }
}

fn default_ports(host: &str) -> Vec<Candidate> {
    vec![
        (host.to_string(), DEFAULT_HTTPS_PORT),
        (host.to_string(), DEFAULT_HTTP_PORT),
    ]
}

/// Build the full candidate list for one connect attempt, preserving
/// insertion order and dropping duplicates: fixed addresses, loopback,
/// gateways, then beacon-sourced addresses.
pub fn candidates(fixed: &[Candidate], beacons: &[Candidate]) -> Vec<Candidate> {
    let mut out: Vec<Candidate> = Vec::new();
    let mut push = |c: Candidate| {
        if !out.contains(&c) {
            out.push(c);
        }
    };

    for c in fixed {
        push(c.clone());
    }
    push(("127.0.0.1".to_string(), DEFAULT_HTTPS_PORT));
    push(("127.0.0.1".to_string(), DEFAULT_HTTP_PORT));
    for gw in gateway_ips() {
        push((gw.clone(), DEFAULT_HTTPS_PORT));
        push((gw, DEFAULT_HTTP_PORT));
    }
    for c in beacons {
        push(c.clone());
    }
    out
}

/// Gateway IPs from the OS routing table.
pub fn gateway_ips() -> Vec<String> {
    #[cfg(target_os = "linux")]
    {
        match std::fs::read_to_string("/proc/net/route") {
            Ok(table) => parse_route_table(&table),
            Err(_) => Vec::new(),
        }
    }
    #[cfg(target_os = "macos")]
    {
        let output = std::process::Command::new("route")
            .args(["-n", "get", "default"])
            .output();
        if let Ok(output) = output {
            let text = String::from_utf8_lossy(&output.stdout);
            for line in text.lines() {
                if let Some(gw) = line.trim().strip_prefix("gateway: ") {
                    return vec![gw.trim().to_string()];
                }
            }
        }
        Vec::new()
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        log::warn!("gateway discovery: unsupported platform");
        Vec::new()
    }
}

/// Parse `/proc/net/route` contents: every non-zero gateway column, decoded
/// from little-endian hex to dotted quad.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_route_table(table: &str) -> Vec<String> {
    let mut ips = Vec::new();
    for line in table.lines().skip(1) {
        let parts: Vec<&str> = line.split('\t').collect();
        let Some(gateway) = parts.get(2) else {
            continue;
        };
        if *gateway == "00000000" || gateway.len() != 8 {
            continue;
        }
        if let Ok(raw) = u32::from_str_radix(gateway, 16) {
            // The kernel prints the address little-endian.
            let bytes = raw.to_le_bytes();
            ips.push(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]).to_string());
        }
    }
    ips
}

/// Parse a beacon datagram. Empty host falls back to the packet's source.
pub fn parse_beacon(data: &[u8], source: IpAddr) -> Option<Candidate> {
    let text = std::str::from_utf8(data).ok()?;
    let mut parts = text.split_whitespace();
    if parts.next()? != "OVERLORD" {
        return None;
    }
    let (host, port) = parts.next()?.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    let host = if host.is_empty() {
        source.to_string()
    } else {
        host.to_string()
    };
    Some((host, port))
}

/// Listen for LAN beacons and publish them on `events`.
///
/// `paused` gates publishing: while true, beacons are buffered locally and
/// flushed on resume. Runs until the event channel closes.
pub async fn lan_discovery(
    port: u16,
    events: mpsc::UnboundedSender<Candidate>,
    mut paused: watch::Receiver<bool>,
) {
    let socket = match UdpSocket::bind(("0.0.0.0", port)).await {
        Ok(s) => s,
        Err(err) => {
            log::error!("LAN discovery: {err}, abort");
            return;
        }
    };
    if let Err(err) = socket.set_broadcast(true) {
        log::warn!("LAN discovery: set_broadcast: {err}");
    }
    log::info!("LAN discovery: started");

    let mut buffered: Vec<Candidate> = Vec::new();
    let mut buf = vec![0u8; BUFSIZE];
    loop {
        tokio::select! {
            recv = socket.recv_from(&mut buf) => {
                let Ok((n, source)) = recv else { continue };
                let Some(candidate) = parse_beacon(&buf[..n], source.ip()) else {
                    continue;
                };
                if *paused.borrow() {
                    if !buffered.contains(&candidate) {
                        buffered.push(candidate);
                    }
                } else if events.send(candidate).is_err() {
                    return;
                }
            }
            changed = paused.changed() => {
                if changed.is_err() {
                    return;
                }
                if *paused.borrow() {
                    log::info!("LAN discovery: paused");
                } else {
                    log::info!("LAN discovery: resumed");
                    for candidate in buffered.drain(..) {
                        if events.send(candidate).is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_bare_host_fans_out() {
        assert_eq!(
            expand_addr("overlord.example"),
            vec![
                ("overlord.example".to_string(), 443),
                ("overlord.example".to_string(), 80)
            ]
        );
    }

    #[test]
    fn expand_host_port_is_verbatim() {
        assert_eq!(
            expand_addr("10.0.0.1:9000"),
            vec![("10.0.0.1".to_string(), 9000)]
        );
    }

    #[test]
    fn candidates_dedup_preserving_order() {
        let fixed = vec![
            ("a".to_string(), 9000),
            ("127.0.0.1".to_string(), 443),
            ("a".to_string(), 9000),
        ];
        let beacons = vec![("a".to_string(), 9000), ("b".to_string(), 4455)];
        let list = candidates(&fixed, &beacons);
        assert_eq!(list[0], ("a".to_string(), 9000));
        assert_eq!(list[1], ("127.0.0.1".to_string(), 443));
        assert_eq!(list[2], ("127.0.0.1".to_string(), 80));
        assert!(list.contains(&("b".to_string(), 4455)));
        // No duplicates anywhere.
        let mut sorted = list.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), list.len());
    }

    #[test]
    fn parse_beacon_with_host() {
        let c = parse_beacon(b"OVERLORD 10.1.2.3:9000", "192.168.0.9".parse().unwrap());
        assert_eq!(c, Some(("10.1.2.3".to_string(), 9000)));
    }

    #[test]
    fn parse_beacon_empty_host_uses_source() {
        let c = parse_beacon(b"OVERLORD :9000", "192.168.0.9".parse().unwrap());
        assert_eq!(c, Some(("192.168.0.9".to_string(), 9000)));
    }

    #[test]
    fn parse_beacon_rejects_other_magic() {
        assert_eq!(
            parse_beacon(b"MINION 10.0.0.1:1", "127.0.0.1".parse().unwrap()),
            None
        );
        assert_eq!(parse_beacon(b"OVERLORD", "127.0.0.1".parse().unwrap()), None);
        assert_eq!(
            parse_beacon(b"OVERLORD 10.0.0.1:notaport", "127.0.0.1".parse().unwrap()),
            None
        );
    }

    #[tokio::test]
    async fn lan_discovery_publishes_beacons() {
        let probe = std::net::UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (pause_tx, pause_rx) = watch::channel(false);
        tokio::spawn(lan_discovery(port, events_tx, pause_rx));
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(b"OVERLORD 10.9.8.7:9000", ("127.0.0.1", port))
            .await
            .unwrap();

        let candidate =
            tokio::time::timeout(std::time::Duration::from_secs(5), events_rx.recv())
                .await
                .expect("no beacon published")
                .unwrap();
        assert_eq!(candidate, ("10.9.8.7".to_string(), 9000));
        drop(pause_tx);
    }

    #[tokio::test]
    async fn lan_discovery_buffers_while_paused() {
        let probe = std::net::UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (pause_tx, pause_rx) = watch::channel(true);
        tokio::spawn(lan_discovery(port, events_tx, pause_rx));
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(b"OVERLORD 10.1.1.1:9000", ("127.0.0.1", port))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        assert!(events_rx.try_recv().is_err(), "beacon leaked while paused");

        // Resume: the buffered beacon is flushed.
        pause_tx.send(false).unwrap();
        let candidate =
            tokio::time::timeout(std::time::Duration::from_secs(5), events_rx.recv())
                .await
                .expect("buffered beacon was not flushed")
                .unwrap();
        assert_eq!(candidate, ("10.1.1.1".to_string(), 9000));
    }

    #[test]
    fn route_table_parsing() {
        // Iface Destination Gateway Flags RefCnt Use Metric Mask ...
        let table = "Iface\tDestination\tGateway\tFlags\tRefCnt\tUse\tMetric\tMask\n\
                     eth0\t00000000\t0100A8C0\t0003\t0\t0\t100\t00000000\n\
                     eth0\t005AA8C0\t00000000\t0001\t0\t0\t100\t00FFFFFF\n";
        assert_eq!(parse_route_table(table), vec!["192.168.0.1".to_string()]);
    }

    #[test]
    fn route_table_skips_malformed_lines() {
        let table = "Iface\tDestination\tGateway\n\
                     eth0\t00000000\tzzzzzzzz\n\
                     short line\n";
        assert!(parse_route_table(table).is_empty());
    }
}
