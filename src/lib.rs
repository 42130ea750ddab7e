//! Overlord, a remote device management fabric.
//!
//! A central server accepts long-lived connections from agents running on
//! target devices and brokers interactive sessions (terminal, shell command,
//! file transfer, TCP port forward) between operators and those devices.
//!
//! # Architecture
//!
//! ```text
//! overlord-agent                          overlord-server
//!  ├── agent control loop ── framed JSON ──► broker (mid → control channel)
//!  │     └── session tasks ── register(sid) ─► pairing (sid → operator stream)
//!  │           ├── terminal (PTY)
//!  │           ├── shell (one-shot command)
//!  │           ├── file (download / upload)
//!  │           └── forward (TCP bridge)
//!  ├── LAN discovery task (UDP beacons)
//!  └── local IPC endpoint (reconnect / status / tty registry / downloads)
//! ```
//!
//! The control channel speaks line-delimited JSON (`wire`) over a hijacked
//! WebSocket upgrade (`connect`). Session connections reuse the same
//! machinery, then switch to raw byte streaming once registered; the
//! `stream::BufferedStream` head buffer is the hand-off point between the
//! two modes.

pub mod agent;
pub mod connect;
pub mod constants;
pub mod discovery;
pub mod identity;
pub mod properties;
pub mod rpc;
pub mod server;
pub mod stream;
pub mod tls;
pub mod wire;
