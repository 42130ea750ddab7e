//! Operator endpoint.
//!
//! A line-JSON surface for opening sessions and listing agents. An operator
//! connection sends one request line and, for spawns, then *becomes* the
//! session's byte pipe:
//!
//! ```text
//! {"op":"list"}                                     → agent summaries
//! {"op":"spawn","mid":…,"name":"shell",
//!  "payload":{"command":"uname -r"}}                → {"status":"success","sid":…}
//!                                                     …then raw session bytes
//! ```
//!
//! The connection is registered as the pending operator stream *before* the
//! spawn request goes out, and is paired with the child agent that
//! registers the minted sid. Unclaimed pendings are evicted after the
//! session grace period.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use bytes::BytesMut;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::constants::BUFSIZE;
use crate::stream::BufferedStream;
use crate::wire::{self, Message, Request};

use super::broker::{AgentCommand, Broker, ChildStream};
use super::read_frame;

/// Spawn request names operators may issue.
const SPAWN_NAMES: &[&str] = &["terminal", "shell", "file_download", "file_upload", "forward"];

/// Serve one operator connection.
pub async fn handle(stream: TcpStream, broker: Arc<Broker>, grace: Duration) -> Result<()> {
    stream.set_nodelay(true).ok();
    let mut stream = BufferedStream::new(stream, BytesMut::new());
    let line = read_line(&mut stream).await?;
    let op: Value = serde_json::from_str(&line).context("bad operator request")?;

    match op.get("op").and_then(Value::as_str) {
        Some("list") => {
            let reply = json!({"status": "success", "agents": broker.list_agents()});
            send_line(&mut stream, &reply).await
        }
        Some("spawn") => spawn(stream, broker, grace, &op).await,
        other => {
            let reply = json!({"status": "failed", "error": format!("unknown op {other:?}")});
            send_line(&mut stream, &reply).await
        }
    }
}

async fn spawn(
    mut stream: BufferedStream<TcpStream>,
    broker: Arc<Broker>,
    grace: Duration,
    op: &Value,
) -> Result<()> {
    let Some(mid) = op.get("mid").and_then(Value::as_str) else {
        return fail(&mut stream, "missing mid").await;
    };
    let Some(name) = op.get("name").and_then(Value::as_str) else {
        return fail(&mut stream, "missing name").await;
    };
    if !SPAWN_NAMES.contains(&name) {
        return fail(&mut stream, &format!("cannot spawn {name}")).await;
    }
    let Some(commands) = broker.agent_commands(mid) else {
        return fail(&mut stream, &format!("no agent registered as {mid}")).await;
    };

    let sid = Uuid::new_v4().to_string();
    let mut payload = op.get("payload").cloned().unwrap_or_else(|| json!({}));
    if !payload.is_object() {
        return fail(&mut stream, "payload must be an object").await;
    }
    payload["sid"] = json!(sid);

    // A writability check never spawns a child, so nothing will pair.
    let check_only = name == "file_upload"
        && payload
            .get("check_only")
            .and_then(Value::as_bool)
            .unwrap_or(false);

    // Pending slot first: the child may connect the moment the agent acks.
    let pending = if check_only {
        None
    } else {
        Some(broker.add_pending(&sid))
    };

    let (ack_tx, ack_rx) = oneshot::channel();
    if commands
        .send(AgentCommand::Request {
            name: name.to_string(),
            payload,
            ack: ack_tx,
        })
        .is_err()
    {
        broker.drop_pending(&sid);
        return fail(&mut stream, "agent connection lost").await;
    }

    match ack_rx.await {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => {
            broker.drop_pending(&sid);
            return fail(&mut stream, &format!("agent refused {name}: {err}")).await;
        }
        Err(_) => {
            broker.drop_pending(&sid);
            return fail(&mut stream, "agent connection lost").await;
        }
    }

    send_line(&mut stream, &json!({"status": "success", "sid": sid})).await?;
    let Some(pending) = pending else {
        return Ok(());
    };

    let child = match wait_for_child(pending, grace).await {
        Some(child) => child,
        None => {
            broker.drop_pending(&sid);
            log::warn!("session {sid}: no child registered within {grace:?}, evicting");
            return fail(&mut stream, "session expired").await;
        }
    };

    pair(stream, child, name).await
}

/// Wait for the child registration to claim the pending slot.
async fn wait_for_child(
    pending: oneshot::Receiver<ChildStream>,
    grace: Duration,
) -> Option<ChildStream> {
    match tokio::time::timeout(grace, pending).await {
        Ok(Ok(child)) => Some(child),
        Ok(Err(_)) | Err(_) => None,
    }
}

/// Relay raw bytes between operator and child. FILE sessions first run
/// their clear-to-send exchange on the child's framed channel.
async fn pair(
    mut operator: BufferedStream<TcpStream>,
    mut child: ChildStream,
    name: &str,
) -> Result<()> {
    match name {
        "file_download" => {
            // The child announces the transfer; surface it to the operator
            // and clear the child to stream.
            let announce = loop {
                match read_frame(&mut child).await? {
                    Message::Request(request) if request.name == "request_to_download" => {
                        break request;
                    }
                    Message::Request(request) => {
                        log::warn!("unexpected {} before download stream", request.name);
                    }
                    Message::Response(_) => {}
                }
            };
            send_line(
                &mut operator,
                &json!({"name": "request_to_download", "payload": announce.payload}),
            )
            .await?;

            let clear = Request {
                rid: Uuid::new_v4().to_string(),
                timeout: -1,
                name: "clear_to_download".to_string(),
                payload: json!({}),
            };
            child
                .send(&wire::encode(&Message::Request(clear)))
                .await
                .context("send failed")?;
        }
        "file_upload" => {
            // Wait for the child to be ready to receive bytes.
            loop {
                match read_frame(&mut child).await? {
                    Message::Request(request) if request.name == "clear_to_upload" => break,
                    Message::Request(request) => {
                        log::warn!("unexpected {} before upload stream", request.name);
                    }
                    Message::Response(_) => {}
                }
            }
        }
        _ => {}
    }

    match tokio::io::copy_bidirectional(&mut operator, &mut child).await {
        Ok((to_child, to_operator)) => {
            log::info!("session closed: {to_child} bytes to agent, {to_operator} to operator");
        }
        Err(err) => log::info!("session closed: {err}"),
    }
    Ok(())
}

async fn fail(stream: &mut BufferedStream<TcpStream>, error: &str) -> Result<()> {
    send_line(stream, &json!({"status": "failed", "error": error})).await
}

async fn send_line(stream: &mut BufferedStream<TcpStream>, value: &Value) -> Result<()> {
    let mut out = serde_json::to_vec(value)?;
    out.extend_from_slice(b"\r\n");
    stream.send(&out).await.context("operator write failed")
}

/// Read one `\n`-terminated line; bytes past it stay buffered (they are the
/// session payload for uploads).
async fn read_line(stream: &mut BufferedStream<TcpStream>) -> Result<String> {
    let mut line = Vec::new();
    loop {
        let data = stream.recv(BUFSIZE).await.context("operator read failed")?;
        if data.is_empty() {
            bail!("operator closed before sending a request");
        }
        match data.iter().position(|&b| b == b'\n') {
            Some(idx) => {
                line.extend_from_slice(&data[..idx]);
                stream.unrecv(&data[idx + 1..]);
                let text = String::from_utf8(line).context("request is not UTF-8")?;
                return Ok(text.trim_end_matches('\r').to_string());
            }
            None => {
                line.extend_from_slice(&data);
                if line.len() > BUFSIZE * 4 {
                    bail!("operator request line too long");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_names_cover_every_session_kind() {
        for name in ["terminal", "shell", "file_download", "file_upload", "forward"] {
            assert!(SPAWN_NAMES.contains(&name));
        }
        assert!(!SPAWN_NAMES.contains(&"register"));
        assert!(!SPAWN_NAMES.contains(&"ping"));
    }
}
