//! Local IPC endpoint.
//!
//! A small JSON-RPC-shaped line protocol on a loopback TCP port through
//! which other local processes poke the running agent: request a reconnect,
//! read the registration status, register a terminal's tty name or shell
//! pid, or enqueue a client-initiated download.
//!
//! One request per line: `{"method": "...", "params": [...], "id": N}`,
//! answered by `{"id": N, "result": ...}` or `{"id": N, "error": "..."}`.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use super::Event;

/// Serve the IPC endpoint on `127.0.0.1:port` until the process exits.
pub async fn serve(
    port: u16,
    events: mpsc::UnboundedSender<Event>,
    status: watch::Receiver<String>,
) -> Result<()> {
    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("IPC bind failed on 127.0.0.1:{port}"))?;
    log::info!("IPC: listening on 127.0.0.1:{port}");

    loop {
        let (stream, _) = listener.accept().await.context("IPC accept failed")?;
        let events = events.clone();
        let status = status.clone();
        tokio::spawn(async move {
            if let Err(err) = handle(stream, events, status).await {
                log::debug!("IPC connection: {err}");
            }
        });
    }
}

async fn handle(
    stream: TcpStream,
    events: mpsc::UnboundedSender<Event>,
    status: watch::Receiver<String>,
) -> Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<Value>(&line) {
            Ok(call) => dispatch(&call, &events, &status),
            Err(err) => json!({"id": Value::Null, "error": format!("bad request: {err}")}),
        };
        let mut out = serde_json::to_vec(&reply)?;
        out.push(b'\n');
        write.write_all(&out).await?;
    }
    Ok(())
}

fn dispatch(
    call: &Value,
    events: &mpsc::UnboundedSender<Event>,
    status: &watch::Receiver<String>,
) -> Value {
    let id = call.get("id").cloned().unwrap_or(Value::Null);
    let method = call.get("method").and_then(Value::as_str).unwrap_or("");
    let params = call
        .get("params")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let result = match method {
        "Reconnect" => {
            let _ = events.send(Event::Reconnect);
            Ok(Value::Null)
        }
        "GetStatus" => Ok(Value::String(status.borrow().clone())),
        "RegisterTTY" => match (param_str(&params, 0), param_str(&params, 1)) {
            (Some(sid), Some(ttyname)) => {
                let _ = events.send(Event::RegisterTty { sid, ttyname });
                Ok(Value::Null)
            }
            _ => Err("RegisterTTY expects [sid, ttyname]".to_string()),
        },
        "RegisterSession" => match (param_str(&params, 0), param_u32(&params, 1)) {
            (Some(sid), Some(pid)) => {
                let _ = events.send(Event::RegisterSession { sid, pid });
                Ok(Value::Null)
            }
            _ => Err("RegisterSession expects [sid, pid]".to_string()),
        },
        "AddToDownloadQueue" => match (param_str(&params, 0), param_str(&params, 1)) {
            (Some(ttyname), Some(filepath)) => {
                let _ = events.send(Event::Download {
                    ttyname,
                    path: PathBuf::from(filepath),
                });
                Ok(Value::Null)
            }
            _ => Err("AddToDownloadQueue expects [ttyname, filepath]".to_string()),
        },
        other => Err(format!("unknown method: {other}")),
    };

    match result {
        Ok(result) => json!({"id": id, "result": result}),
        Err(error) => json!({"id": id, "error": error}),
    }
}

fn param_str(params: &[Value], idx: usize) -> Option<String> {
    params.get(idx)?.as_str().map(str::to_string)
}

fn param_u32(params: &[Value], idx: usize) -> Option<u32> {
    params.get(idx)?.as_u64().map(|v| v as u32)
}

/// One-shot IPC client call, used by the agent binary's control flags.
pub async fn call(port: u16, method: &str, params: Value) -> Result<Value> {
    let mut stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .with_context(|| format!("cannot reach agent IPC on 127.0.0.1:{port}"))?;
    let request = json!({"method": method, "params": params, "id": 1});
    let mut out = serde_json::to_vec(&request)?;
    out.push(b'\n');
    stream.write_all(&out).await?;

    let (read, _write) = stream.split();
    let mut lines = BufReader::new(read).lines();
    let line = lines
        .next_line()
        .await?
        .context("agent IPC closed without a reply")?;
    let reply: Value = serde_json::from_str(&line)?;
    if let Some(error) = reply.get("error").and_then(Value::as_str) {
        anyhow::bail!("{error}");
    }
    Ok(reply.get("result").cloned().unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixtures() -> (
        mpsc::UnboundedSender<Event>,
        mpsc::UnboundedReceiver<Event>,
        watch::Receiver<String>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel("disconnected".to_string());
        // A dropped sender leaves the last value readable, which is all the
        // dispatcher needs.
        drop(status_tx);
        (tx, rx, status_rx)
    }

    #[test]
    fn reconnect_dispatch_sends_event() {
        let (tx, mut rx, status) = fixtures();
        let reply = dispatch(&json!({"method": "Reconnect", "id": 7}), &tx, &status);
        assert_eq!(reply["id"], 7);
        assert!(reply.get("error").is_none());
        assert!(matches!(rx.try_recv(), Ok(Event::Reconnect)));
    }

    #[test]
    fn get_status_returns_watch_value() {
        let (tx, _rx, status) = fixtures();
        let reply = dispatch(&json!({"method": "GetStatus", "id": 1}), &tx, &status);
        assert_eq!(reply["result"], "disconnected");
    }

    #[test]
    fn register_tty_roundtrip() {
        let (tx, mut rx, status) = fixtures();
        let call = json!({"method": "RegisterTTY", "params": ["s1", "/dev/pts/5"], "id": 2});
        let reply = dispatch(&call, &tx, &status);
        assert!(reply.get("error").is_none());
        match rx.try_recv() {
            Ok(Event::RegisterTty { sid, ttyname }) => {
                assert_eq!(sid, "s1");
                assert_eq!(ttyname, "/dev/pts/5");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn bad_params_report_error() {
        let (tx, _rx, status) = fixtures();
        let call = json!({"method": "RegisterSession", "params": ["only-sid"], "id": 3});
        let reply = dispatch(&call, &tx, &status);
        assert!(reply["error"].as_str().unwrap().contains("RegisterSession"));
    }

    #[test]
    fn unknown_method_reports_error() {
        let (tx, _rx, status) = fixtures();
        let reply = dispatch(&json!({"method": "Bogus", "id": 4}), &tx, &status);
        assert!(reply["error"].as_str().unwrap().contains("unknown method"));
    }

    #[tokio::test]
    async fn serve_and_call_roundtrip() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_status_tx, status_rx) = watch::channel("disconnected".to_string());
        tokio::spawn(serve(port, tx, status_rx));
        // Give the listener a beat to bind.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let result = call(
            port,
            "AddToDownloadQueue",
            json!(["/dev/pts/0", "/tmp/f.bin"]),
        )
        .await
        .unwrap();
        assert_eq!(result, Value::Null);
        match rx.recv().await {
            Some(Event::Download { ttyname, path }) => {
                assert_eq!(ttyname, "/dev/pts/0");
                assert_eq!(path, PathBuf::from("/tmp/f.bin"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
