//! The central server: accepts agent connections on `/connect`, keeps the
//! broker registry, and exposes the operator endpoint.
//!
//! Agent connections arrive as WebSocket upgrades; after the `101` response
//! the socket is hijacked and speaks the framed-JSON control protocol
//! directly. The first frame must be `register`: AGENT mode turns the
//! connection into a long-lived control channel, any other mode pairs the
//! connection with the operator stream waiting on the same sid.

pub mod broker;
pub mod operator;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;

use crate::connect::{find_header, read_header_block};
use crate::constants::{BUFSIZE, REQUEST_TIMEOUT_SECS, SESSION_GRACE};
use crate::rpc::{Handler, RequestMap};
use crate::stream::BufferedStream;
use crate::wire::{self, Message, Mode, Request, Response, Status};

use broker::{AgentCommand, Broker};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address for both listeners.
    pub bind: String,
    /// Agent `/connect` port.
    pub port: u16,
    /// Operator endpoint port.
    pub operator_port: u16,
    /// Grace period before an unclaimed pending session is evicted.
    pub session_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: crate::constants::DEFAULT_SERVER_PORT,
            operator_port: crate::constants::DEFAULT_OPERATOR_PORT,
            session_grace: SESSION_GRACE,
        }
    }
}

/// A bound server, ready to serve.
pub struct Server {
    broker: Arc<Broker>,
    connect_listener: TcpListener,
    operator_listener: TcpListener,
    session_grace: Duration,
}

impl Server {
    /// Bind both listeners. Port 0 picks ephemeral ports (used by tests).
    pub async fn bind(config: &ServerConfig) -> Result<Self> {
        let connect_listener = TcpListener::bind((config.bind.as_str(), config.port))
            .await
            .with_context(|| format!("cannot bind {}:{}", config.bind, config.port))?;
        let operator_listener = TcpListener::bind((config.bind.as_str(), config.operator_port))
            .await
            .with_context(|| format!("cannot bind {}:{}", config.bind, config.operator_port))?;
        Ok(Self {
            broker: Arc::new(Broker::new()),
            connect_listener,
            operator_listener,
            session_grace: config.session_grace,
        })
    }

    pub fn connect_addr(&self) -> Result<SocketAddr> {
        self.connect_listener.local_addr().context("no local addr")
    }

    pub fn operator_addr(&self) -> Result<SocketAddr> {
        self.operator_listener.local_addr().context("no local addr")
    }

    pub fn broker(&self) -> Arc<Broker> {
        Arc::clone(&self.broker)
    }

    /// Accept loops for both listeners; runs until the process exits.
    pub async fn serve(self) -> Result<()> {
        let Server {
            broker,
            connect_listener,
            operator_listener,
            session_grace,
        } = self;
        log::info!(
            "serving agents on {} and operators on {}",
            connect_listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            operator_listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
        );

        tokio::try_join!(
            accept_agents(connect_listener, Arc::clone(&broker)),
            accept_operators(operator_listener, broker, session_grace),
        )?;
        Ok(())
    }
}

async fn accept_agents(listener: TcpListener, broker: Arc<Broker>) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await.context("agent accept failed")?;
        let broker = Arc::clone(&broker);
        tokio::spawn(async move {
            if let Err(err) = handle_connect(stream, broker).await {
                log::info!("connection from {peer}: {err}");
            }
        });
    }
}

async fn accept_operators(
    listener: TcpListener,
    broker: Arc<Broker>,
    session_grace: Duration,
) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await.context("operator accept failed")?;
        let broker = Arc::clone(&broker);
        tokio::spawn(async move {
            if let Err(err) = operator::handle(stream, broker, session_grace).await {
                log::info!("operator {peer}: {err}");
            }
        });
    }
}

/// Serve one `/connect` upgrade: handshake, first-frame `register`, then
/// either the control loop or session pairing.
async fn handle_connect(mut stream: TcpStream, broker: Arc<Broker>) -> Result<()> {
    stream.set_nodelay(true).ok();
    let (header, leftover) = read_header_block(&mut stream).await?;
    let header = String::from_utf8_lossy(&header).into_owned();

    let request_line = header.lines().next().unwrap_or_default();
    let path = request_line.split_whitespace().nth(1).unwrap_or_default();
    if path != "/connect" {
        use tokio::io::AsyncWriteExt;
        let _ = stream
            .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
            .await;
        bail!("unexpected path {path}");
    }
    let key = find_header(&header, "sec-websocket-key").context("missing Sec-WebSocket-Key")?;

    let accept = derive_accept_key(key.as_bytes());
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\
         \r\n"
    );
    {
        use tokio::io::AsyncWriteExt;
        stream.write_all(response.as_bytes()).await?;
    }

    let mut stream = BufferedStream::new(stream, leftover);
    let register = tokio::time::timeout(
        Duration::from_secs(REQUEST_TIMEOUT_SECS as u64),
        read_frame(&mut stream),
    )
    .await
    .context("no register request")??;

    let Message::Request(register) = register else {
        bail!("expected a register request, got a response");
    };
    if register.name != "register" {
        bail!("expected register, got {}", register.name);
    }

    let mode: Mode = serde_json::from_value(
        register
            .payload
            .get("mode")
            .cloned()
            .unwrap_or(Value::Null),
    )
    .context("register without a valid mode")?;
    let mid = register
        .payload
        .get("mid")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let sid = register
        .payload
        .get("sid")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if mid.is_empty() || sid.is_empty() {
        let response = Response::error(&register, "register requires mid and sid");
        stream.send(&wire::encode(&Message::Response(response))).await?;
        bail!("register without mid/sid");
    }

    if mode == Mode::Agent {
        let properties = register
            .payload
            .get("properties")
            .cloned()
            .unwrap_or(Value::Null);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let conn_id = broker.register_agent(&mid, &sid, properties, commands_tx);
        log::info!("agent {mid} registered (sid {sid})");

        let ack = Response::to(&register, Status::Success, json!({ "sid": sid }));
        stream.send(&wire::encode(&Message::Response(ack))).await?;

        let result = control_loop(&mut stream, commands_rx).await;
        broker.remove_agent(&mid, conn_id);
        log::info!("agent {mid} disconnected");
        result
    } else {
        match broker.take_pending(&sid) {
            Some(slot) => {
                log::info!("{mode} session {sid} connected, pairing");
                let ack = Response::to(&register, Status::Success, json!({ "sid": sid }));
                stream.send(&wire::encode(&Message::Response(ack))).await?;
                // The waiting operator task owns the stream from here on.
                let _ = slot.send(stream);
                Ok(())
            }
            None => {
                log::warn!("{mode} session {sid} has no pending operator stream");
                let response = Response::error(&register, "no pending session");
                stream.send(&wire::encode(&Message::Response(response))).await?;
                Ok(())
            }
        }
    }
}

/// The server side of an AGENT control channel: answer pings, forward
/// operator-initiated spawn requests, and correlate their responses.
async fn control_loop(
    stream: &mut BufferedStream<TcpStream>,
    mut commands: mpsc::UnboundedReceiver<AgentCommand>,
) -> Result<()> {
    let mut requests = RequestMap::new();
    loop {
        // A complete frame already pushed back is served before blocking.
        if stream.head_contains(crate::constants::SEPARATOR) {
            let data = stream.take_head();
            process_agent_frames(stream, &mut requests, &data).await?;
            requests.scan_timeouts();
            continue;
        }
        tokio::select! {
            read = stream.fill(BUFSIZE) => {
                let data = read.context("read failed")?;
                if data.is_empty() {
                    return Ok(());
                }
                process_agent_frames(stream, &mut requests, &data).await?;
            }
            command = commands.recv() => match command {
                Some(AgentCommand::Request { name, payload, ack }) => {
                    let handler: Handler = Box::new(move |response| {
                        let result = match response {
                            None => Err("request timeout".to_string()),
                            Some(r) if r.status == Status::Success => Ok(r.payload),
                            Some(r) => Err(r.payload.to_string()),
                        };
                        let _ = ack.send(result);
                    });
                    let request =
                        requests.prepare(&name, payload, REQUEST_TIMEOUT_SECS, Some(handler));
                    stream
                        .send(&wire::encode(&Message::Request(request)))
                        .await
                        .context("send failed")?;
                }
                Some(AgentCommand::Close) | None => return Ok(()),
            },
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
        requests.scan_timeouts();
    }
}

/// Parse one read's worth of frames from an agent control channel.
async fn process_agent_frames(
    stream: &mut BufferedStream<TcpStream>,
    requests: &mut RequestMap,
    data: &[u8],
) -> Result<()> {
    let (frames, consumed) = wire::split_frames(data, false);
    let frames: Vec<Vec<u8>> = frames.into_iter().map(<[u8]>::to_vec).collect();
    stream.unrecv(&data[consumed..]);
    for frame in frames {
        match wire::decode_frame(&frame) {
            Some(Message::Request(request)) => {
                handle_agent_request(stream, &request).await?;
            }
            Some(Message::Response(response)) => requests.dispatch(response),
            None => {}
        }
    }
    Ok(())
}

async fn handle_agent_request(
    stream: &mut BufferedStream<TcpStream>,
    request: &Request,
) -> Result<()> {
    match request.name.as_str() {
        "ping" => {
            let pong = Response::to(request, Status::Success, Value::Null);
            stream
                .send(&wire::encode(&Message::Response(pong)))
                .await
                .context("send failed")
        }
        other => {
            log::warn!("unexpected control-channel request {other}, ignored");
            Ok(())
        }
    }
}

/// Read exactly one frame in single-message mode, leaving every byte after
/// it in the head buffer.
pub(crate) async fn read_frame(stream: &mut BufferedStream<TcpStream>) -> Result<Message> {
    loop {
        let data = if stream.head_contains(crate::constants::SEPARATOR) {
            stream.take_head()
        } else {
            stream.fill(BUFSIZE).await.context("read failed")?
        };
        if data.is_empty() {
            bail!("connection closed");
        }
        let (frames, consumed) = wire::split_frames(&data, true);
        let frames: Vec<Vec<u8>> = frames.into_iter().map(<[u8]>::to_vec).collect();
        stream.unrecv(&data[consumed..]);
        if let Some(frame) = frames.first() {
            if let Some(message) = wire::decode_frame(frame) {
                return Ok(message);
            }
        }
    }
}
