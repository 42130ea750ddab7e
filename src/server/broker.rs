//! Broker state: registered agents and pending session pairings.
//!
//! `mid → agent handle` with last-wins semantics: a duplicate registration
//! displaces the previous connection, which is told to close. `sid →
//! pending operator stream` entries are created when an operator asks for a
//! session and consumed by exactly one child registration; entries that are
//! never claimed are evicted after a grace period by the waiting operator
//! task itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use crate::stream::BufferedStream;

/// A paired child-session connection, delivered to the waiting operator.
pub type ChildStream = BufferedStream<TcpStream>;

/// Commands the broker sends into an agent's control-channel task.
pub enum AgentCommand {
    /// Forward a spawn request to the agent; `ack` resolves with the
    /// agent's response payload or an error.
    Request {
        name: String,
        payload: Value,
        ack: oneshot::Sender<Result<Value, String>>,
    },
    /// Close the connection (displaced by a newer registration).
    Close,
}

/// One registered control channel.
pub struct AgentHandle {
    pub mid: String,
    pub sid: String,
    pub properties: Value,
    pub commands: mpsc::UnboundedSender<AgentCommand>,
    conn_id: u64,
}

/// Shared broker state.
#[derive(Default)]
pub struct Broker {
    agents: Mutex<HashMap<String, AgentHandle>>,
    pending: Mutex<HashMap<String, oneshot::Sender<ChildStream>>>,
    next_conn: AtomicU64,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a control channel. Last registration wins; any displaced
    /// connection is told to close and its pending requests are dropped.
    ///
    /// Returns a token identifying this registration, for [`Self::remove_agent`].
    pub fn register_agent(
        &self,
        mid: &str,
        sid: &str,
        properties: Value,
        commands: mpsc::UnboundedSender<AgentCommand>,
    ) -> u64 {
        let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let handle = AgentHandle {
            mid: mid.to_string(),
            sid: sid.to_string(),
            properties,
            commands,
            conn_id,
        };
        let mut agents = self.agents.lock().expect("broker lock");
        if let Some(old) = agents.insert(mid.to_string(), handle) {
            log::warn!("agent {mid} re-registered; closing the previous connection");
            let _ = old.commands.send(AgentCommand::Close);
        }
        conn_id
    }

    /// Drop a registration, but only if it is still the current one: a
    /// displaced connection must not tear down its successor.
    pub fn remove_agent(&self, mid: &str, conn_id: u64) {
        let mut agents = self.agents.lock().expect("broker lock");
        if agents.get(mid).is_some_and(|h| h.conn_id == conn_id) {
            agents.remove(mid);
        }
    }

    /// Sender half of a registered agent's command channel.
    pub fn agent_commands(&self, mid: &str) -> Option<mpsc::UnboundedSender<AgentCommand>> {
        self.agents
            .lock()
            .expect("broker lock")
            .get(mid)
            .map(|h| h.commands.clone())
    }

    /// Summaries for the operator listing.
    pub fn list_agents(&self) -> Vec<Value> {
        self.agents
            .lock()
            .expect("broker lock")
            .values()
            .map(|h| {
                json!({
                    "mid": h.mid,
                    "sid": h.sid,
                    "properties": h.properties,
                })
            })
            .collect()
    }

    /// Create a pending pairing slot for `sid`. The returned receiver
    /// resolves with the child's stream when it registers.
    pub fn add_pending(&self, sid: &str) -> oneshot::Receiver<ChildStream> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("broker lock")
            .insert(sid.to_string(), tx);
        rx
    }

    /// Claim the pending slot for `sid`, if any. Each slot is consumed by
    /// at most one child registration.
    pub fn take_pending(&self, sid: &str) -> Option<oneshot::Sender<ChildStream>> {
        self.pending.lock().expect("broker lock").remove(sid)
    }

    /// Drop an unclaimed pending slot (grace period expired, or the spawn
    /// request failed).
    pub fn drop_pending(&self, sid: &str) {
        self.pending.lock().expect("broker lock").remove(sid);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("broker lock").len()
    }

    pub fn agent_count(&self) -> usize {
        self.agents.lock().expect("broker lock").len()
    }
}
