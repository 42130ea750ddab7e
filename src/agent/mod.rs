//! The device-side agent.
//!
//! One [`Agent`] value runs one session of any mode. In AGENT mode it is the
//! long-lived control channel: discover → connect → register → listen →
//! reconnect, forever. Every other mode is a short-lived session created in
//! response to a broker request; the session task builds a fresh `Agent`
//! with the assigned sid, connects to the one currently-known server
//! address, registers, and hands its socket to the mode-specific handler.
//!
//! The control loop is a single cooperative task. Cross-task pokes (LAN
//! beacons, local IPC calls, session-side tty registration) arrive on one
//! typed event channel and are applied between ticks; the request map and
//! the session tables are touched only here.

pub mod file;
pub mod forward;
pub mod fsops;
pub mod ipc;
pub mod shell;
pub mod tty;

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context as _, Result};
use bytes::Bytes;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};

use crate::constants::{
    BUFSIZE, PING_INTERVAL, PING_TIMEOUT_SECS, REQUEST_TIMEOUT_SECS, RETRY_INTERVAL,
};
use crate::discovery::{self, Candidate};
use crate::identity::{self, MidPolicy};
use crate::properties;
use crate::rpc::{Handler, RequestMap};
use crate::stream::{BufferedStream, Transport};
use crate::tls::{self, TlsSettings};
use crate::wire::{self, Message, Mode, Request, Response, Status};
use crate::{connect, constants};

/// Registration state, surfaced through the status watch.
pub const DISCONNECTED: &str = "disconnected";

/// File operation carried by a FILE-mode session.
#[derive(Debug, Clone)]
pub enum FileOp {
    Download { path: PathBuf },
    Upload { path: PathBuf, perm: Option<u32> },
}

/// Cross-task events consumed by the control loop.
#[derive(Debug)]
pub enum Event {
    /// A LAN beacon advertised a server address.
    Beacon(Candidate),
    /// Local IPC asked for a reconnect.
    Reconnect,
    /// A terminal session registered its tty device name.
    RegisterTty { sid: String, ttyname: String },
    /// A terminal session registered its shell's process id.
    RegisterSession { sid: String, pid: u32 },
    /// Local IPC enqueued a client-initiated download.
    Download { ttyname: String, path: PathBuf },
}

/// Signals produced by request-completion handlers, drained each tick.
#[derive(Debug)]
enum Signal {
    Registered,
    RegisterFailed(String),
    PingTimeout,
}

/// Configuration for one agent instance.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub mode: Mode,
    /// Candidate server addresses; for non-AGENT modes exactly the address
    /// of the server that requested the session.
    pub addrs: Vec<Candidate>,
    pub mid: MidPolicy,
    /// Session id. Assigned by the broker for non-AGENT modes.
    pub sid: String,
    /// Terminal session associated with a file download.
    pub terminal_sid: Option<String>,
    /// Explicit tty device for TERMINAL mode; a fresh pty otherwise.
    pub tty_device: Option<PathBuf>,
    /// Command line for SHELL mode.
    pub shell_command: Option<String>,
    /// Operation for FILE mode.
    pub file_op: Option<FileOp>,
    /// Target for FORWARD mode.
    pub forward: Option<(String, u16)>,
    /// Force TLS on/off; `None` probes (AGENT mode only).
    pub tls_mode: Option<bool>,
    pub tls: TlsSettings,
    pub prop_file: Option<PathBuf>,
    pub allowlist: Option<String>,
}

impl AgentOptions {
    /// Options for a long-lived control channel.
    pub fn control(addrs: Vec<Candidate>, mid: MidPolicy) -> Self {
        Self {
            mode: Mode::Agent,
            addrs,
            mid,
            sid: uuid::Uuid::new_v4().to_string(),
            terminal_sid: None,
            tty_device: None,
            shell_command: None,
            file_op: None,
            forward: None,
            tls_mode: None,
            tls: TlsSettings::new(None, true),
            prop_file: None,
            allowlist: None,
        }
    }
}

/// One agent instance. See the module docs for the lifecycle.
pub struct Agent {
    opts: AgentOptions,
    machine_id: String,
    properties: Value,
    requests: RequestMap,
    registered: bool,
    reset: bool,
    connected_addr: Option<Candidate>,
    /// Beacon-sourced addresses, folded into the candidate list on the next
    /// connect cycle.
    extra_addrs: Vec<Candidate>,
    tty_to_sid: HashMap<String, String>,
    sid_to_pid: HashMap<String, u32>,
    download_queue: VecDeque<(String, PathBuf)>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    signals_tx: mpsc::UnboundedSender<Signal>,
    signals_rx: mpsc::UnboundedReceiver<Signal>,
    status_tx: watch::Sender<String>,
    pause_tx: watch::Sender<bool>,
    /// Event channel of the parent control agent, for sessions that need to
    /// register tty names and pids with it.
    parent_events: Option<mpsc::UnboundedSender<Event>>,
}

impl Agent {
    pub fn new(opts: AgentOptions) -> Self {
        Self::with_parent(opts, None)
    }

    fn with_parent(
        opts: AgentOptions,
        parent_events: Option<mpsc::UnboundedSender<Event>>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(DISCONNECTED.to_string());
        let (pause_tx, _) = watch::channel(false);
        let machine_id = identity::machine_id(&opts.mid);
        Self {
            opts,
            machine_id,
            properties: Value::Null,
            requests: RequestMap::new(),
            registered: false,
            reset: false,
            connected_addr: None,
            extra_addrs: Vec::new(),
            tty_to_sid: HashMap::new(),
            sid_to_pid: HashMap::new(),
            download_queue: VecDeque::new(),
            events_tx,
            events_rx,
            signals_tx,
            signals_rx,
            status_tx,
            pause_tx,
            parent_events,
        }
    }

    /// Sender half of the event channel, for the discovery task, the IPC
    /// endpoint, and session tasks.
    pub fn events(&self) -> mpsc::UnboundedSender<Event> {
        self.events_tx.clone()
    }

    /// Watch of the registration status string.
    pub fn status(&self) -> watch::Receiver<String> {
        self.status_tx.subscribe()
    }

    /// Watch of the discovery pause flag (true while registered).
    pub fn pause(&self) -> watch::Receiver<bool> {
        self.pause_tx.subscribe()
    }

    pub fn mode(&self) -> Mode {
        self.opts.mode
    }

    pub fn sid(&self) -> &str {
        &self.opts.sid
    }

    /// Run the AGENT control loop: cycle through candidates, register,
    /// listen; on disconnect sleep the retry interval and start over.
    pub async fn run(&mut self) -> Result<()> {
        log::info!("{} started", self.opts.mode);
        log::info!("MID: {}", self.machine_id);
        log::info!("SID: {}", self.opts.sid);

        loop {
            self.drain_events();
            let fixed = self.fixed_candidates();
            let list = discovery::candidates(&fixed, &self.extra_addrs);
            for (host, port) in list {
                match self.attempt(&host, port).await {
                    Ok(()) => {}
                    Err(err) => log::info!("{host}:{port}: {err}"),
                }
                self.reset_state();
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    /// Run a single non-AGENT session to completion.
    pub async fn run_session(&mut self) -> Result<()> {
        let (host, port) = self
            .opts
            .addrs
            .first()
            .cloned()
            .context("session has no server address")?;
        log::info!("{} session started, sid {}", self.opts.mode, self.opts.sid);

        self.reset_state();
        let mut stream = connect::establish(&host, port, &self.opts.tls).await?;
        self.machine_id = identity::machine_id(&self.opts.mid);
        let response = self.register_and_wait(&mut stream).await?;
        if response.status != Status::Success {
            bail!("registration failed: {}", response.payload);
        }

        let result = match self.opts.mode {
            Mode::Terminal => tty::serve(self, stream).await,
            Mode::Shell => shell::serve(self, stream).await,
            Mode::File => file::serve(self, stream).await,
            Mode::Forward => forward::serve(self, stream).await,
            Mode::Agent => bail!("control channel cannot run as a session"),
        };
        log::info!("{} session terminated", self.opts.mode);
        result
    }

    /// One connect attempt against a single candidate.
    async fn attempt(&mut self, host: &str, port: u16) -> Result<()> {
        self.reset_state();
        log::info!("trying {host}:{port} ...");

        // Only the control channel probes; sessions reuse the settings they
        // were spawned with.
        if self.opts.mode == Mode::Agent {
            let enabled = match self.opts.tls_mode {
                Some(forced) => forced,
                None => tls::probe(host, port).await?,
            };
            self.opts.tls.set_enabled(enabled)?;
        }

        let mut stream = connect::establish(host, port, &self.opts.tls).await?;
        log::info!("connection established, registering...");

        // Machine id may change if MAC addresses are used (USB-ethernet
        // dongle plugged/unplugged).
        self.machine_id = identity::machine_id(&self.opts.mid);
        self.connected_addr = Some((host.to_string(), port));

        let payload = self.register_payload();
        let handler = self.register_handler(host, port);
        self.send_request(&mut stream, "register", payload, REQUEST_TIMEOUT_SECS, Some(handler))
            .await?;

        self.listen(&mut stream).await
    }

    fn register_payload(&self) -> Value {
        json!({
            "mode": self.opts.mode,
            "mid": self.machine_id,
            "sid": self.opts.sid,
            "properties": self.properties,
        })
    }

    fn register_handler(&self, host: &str, port: u16) -> Handler {
        let tx = self.signals_tx.clone();
        let addr = format!("{host}:{port}");
        Box::new(move |response| {
            let signal = match response {
                None => Signal::RegisterFailed("register request timeout".into()),
                Some(r) if r.status == Status::Success => Signal::Registered,
                Some(r) => Signal::RegisterFailed(format!("register failed: {}", r.payload)),
            };
            if matches!(signal, Signal::Registered) {
                log::info!("registered with server at {addr}");
            }
            let _ = tx.send(signal);
        })
    }

    /// Framed-message pump shared by the control loop: read, parse
    /// (single-message mode until registered), keep-alive, timeout scan,
    /// download dispatch. Exits on reset, EOF, or error.
    async fn listen(&mut self, stream: &mut BufferedStream<Transport>) -> Result<()> {
        let mut last_ping: Option<Instant> = None;

        loop {
            enum Tick {
                Data(Bytes),
                Eof,
                Event(Event),
                Idle,
            }

            // A complete frame pushed back by single-message parsing is
            // served before blocking on the socket again.
            let tick = if stream.head_contains(constants::SEPARATOR) {
                Tick::Data(stream.take_head())
            } else {
                tokio::select! {
                    read = stream.fill(BUFSIZE) => match read {
                        Ok(data) if data.is_empty() => Tick::Eof,
                        Ok(data) => Tick::Data(data),
                        Err(err) => bail!("connection dropped: {err}"),
                    },
                    event = self.events_rx.recv() => match event {
                        Some(event) => Tick::Event(event),
                        None => Tick::Idle,
                    },
                    _ = tokio::time::sleep(PING_INTERVAL / 2) => Tick::Idle,
                }
            };

            match tick {
                Tick::Eof => return Ok(()),
                Tick::Data(data) => {
                    let single = !self.registered;
                    self.parse_frames(stream, &data, single).await?;
                }
                Tick::Event(event) => self.handle_event(event),
                Tick::Idle => {}
            }

            if last_ping.map_or(true, |t| t.elapsed() >= PING_INTERVAL) {
                self.send_ping(stream).await?;
                last_ping = Some(Instant::now());
            }

            self.requests.scan_timeouts();
            self.drain_signals()?;

            if let Some((ttyname, path)) = self.download_queue.pop_front() {
                self.initiate_download(ttyname, path);
            }

            if self.reset {
                return Ok(());
            }
        }
    }

    /// Split a read into frames, push the remainder back, dispatch each.
    async fn parse_frames(
        &mut self,
        stream: &mut BufferedStream<Transport>,
        data: &[u8],
        single: bool,
    ) -> Result<()> {
        let (frames, consumed) = wire::split_frames(data, single);
        let rest = data[consumed..].to_vec();
        let frames: Vec<Vec<u8>> = frames.into_iter().map(<[u8]>::to_vec).collect();
        stream.unrecv(&rest);
        for frame in frames {
            match wire::decode_frame(&frame) {
                Some(Message::Request(request)) => self.handle_request(stream, request).await?,
                Some(Message::Response(response)) => self.requests.dispatch(response),
                None => {}
            }
        }
        Ok(())
    }

    /// Send `register` and pump frames until its response arrives. Used by
    /// session modes, where the response decides whether the socket turns
    /// into a raw byte stream.
    async fn register_and_wait(
        &mut self,
        stream: &mut BufferedStream<Transport>,
    ) -> Result<Response> {
        let (ack_tx, ack_rx) = std::sync::mpsc::channel::<Option<Response>>();
        let handler: Handler = Box::new(move |response| {
            let _ = ack_tx.send(response);
        });
        let payload = self.register_payload();
        self.send_request(stream, "register", payload, REQUEST_TIMEOUT_SECS, Some(handler))
            .await?;

        loop {
            match ack_rx.try_recv() {
                Ok(Some(response)) => return Ok(response),
                Ok(None) => bail!("register request timeout"),
                Err(_) => {}
            }
            let data = if stream.head_contains(constants::SEPARATOR) {
                stream.take_head()
            } else {
                match tokio::time::timeout(PING_INTERVAL / 2, stream.fill(BUFSIZE)).await {
                    Ok(read) => {
                        let data = read.context("connection dropped")?;
                        if data.is_empty() {
                            bail!("connection closed during registration");
                        }
                        data
                    }
                    Err(_) => {
                        self.requests.scan_timeouts();
                        continue;
                    }
                }
            };
            // Single-message mode: bytes past the response belong to the
            // session and stay in the head buffer. Requests cannot be
            // served yet; responses resolve the pending register.
            let (frames, consumed) = wire::split_frames(&data, true);
            let frames: Vec<Vec<u8>> = frames.into_iter().map(<[u8]>::to_vec).collect();
            stream.unrecv(&data[consumed..]);
            for frame in frames {
                match wire::decode_frame(&frame) {
                    Some(Message::Response(response)) => self.requests.dispatch(response),
                    Some(Message::Request(request)) => {
                        log::warn!("request {} before registration, ignored", request.name);
                    }
                    None => {}
                }
            }
            self.requests.scan_timeouts();
        }
    }

    /// Wait for a specific request from the server, pumping frames in
    /// single-message mode. Used by FILE sessions for the clear-to-send
    /// handshake.
    pub(crate) async fn wait_for_request(
        &mut self,
        stream: &mut BufferedStream<Transport>,
        name: &str,
    ) -> Result<Request> {
        loop {
            let data = if stream.head_contains(constants::SEPARATOR) {
                stream.take_head()
            } else {
                stream.fill(BUFSIZE).await.context("connection dropped")?
            };
            if data.is_empty() {
                bail!("connection closed while waiting for {name}");
            }
            let (frames, consumed) = wire::split_frames(&data, true);
            let frames: Vec<Vec<u8>> = frames.into_iter().map(<[u8]>::to_vec).collect();
            stream.unrecv(&data[consumed..]);
            for frame in frames {
                match wire::decode_frame(&frame) {
                    Some(Message::Request(request)) if request.name == name => {
                        return Ok(request);
                    }
                    Some(Message::Request(request)) => {
                        log::warn!("unexpected request {} while waiting for {name}", request.name);
                    }
                    Some(Message::Response(response)) => self.requests.dispatch(response),
                    None => {}
                }
            }
        }
    }

    async fn send_ping(&mut self, stream: &mut BufferedStream<Transport>) -> Result<()> {
        let tx = self.signals_tx.clone();
        let handler: Handler = Box::new(move |response| {
            if response.is_none() {
                let _ = tx.send(Signal::PingTimeout);
            }
        });
        self.send_request(stream, "ping", json!({}), PING_TIMEOUT_SECS, Some(handler))
            .await
    }

    /// Serialize and send a request, tracking it when the timeout is
    /// non-negative.
    pub(crate) async fn send_request(
        &mut self,
        stream: &mut BufferedStream<Transport>,
        name: &str,
        payload: Value,
        timeout_secs: i64,
        handler: Option<Handler>,
    ) -> Result<()> {
        let request = self.requests.prepare(name, payload, timeout_secs, handler);
        stream
            .send(&wire::encode(&Message::Request(request)))
            .await
            .context("send failed")
    }

    async fn send_response(
        stream: &mut BufferedStream<Transport>,
        response: Response,
    ) -> Result<()> {
        stream
            .send(&wire::encode(&Message::Response(response)))
            .await
            .context("send failed")
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Beacon(candidate) => {
                if !self.extra_addrs.contains(&candidate) {
                    log::info!(
                        "LAN discovery: got server address {}:{}",
                        candidate.0,
                        candidate.1
                    );
                    self.extra_addrs.push(candidate);
                }
            }
            Event::Reconnect => {
                log::info!("received reconnect request, reconnecting...");
                self.reset = true;
            }
            Event::RegisterTty { sid, ttyname } => {
                self.tty_to_sid.insert(ttyname, sid);
            }
            Event::RegisterSession { sid, pid } => {
                self.sid_to_pid.insert(sid, pid);
            }
            Event::Download { ttyname, path } => {
                self.download_queue.push_back((ttyname, path));
            }
        }
    }

    fn drain_signals(&mut self) -> Result<()> {
        while let Ok(signal) = self.signals_rx.try_recv() {
            match signal {
                Signal::Registered => {
                    self.registered = true;
                    let peer = self
                        .connected_addr
                        .as_ref()
                        .map(|(h, p)| format!("{h}:{p}"))
                        .unwrap_or_default();
                    let _ = self.status_tx.send(format!("success {peer}"));
                    let _ = self.pause_tx.send(true);
                }
                Signal::RegisterFailed(reason) => {
                    log::error!("{reason}");
                    self.reset = true;
                }
                Signal::PingTimeout => bail!("connection timeout"),
            }
        }
        Ok(())
    }

    fn reset_state(&mut self) {
        self.reset = false;
        self.registered = false;
        self.connected_addr = None;
        self.requests.clear();
        self.tty_to_sid.clear();
        self.sid_to_pid.clear();
        while self.signals_rx.try_recv().is_ok() {}
        self.properties =
            properties::load(self.opts.prop_file.as_deref(), self.opts.allowlist.as_deref());
        let _ = self.status_tx.send(DISCONNECTED.to_string());
        let _ = self.pause_tx.send(false);
    }

    fn fixed_candidates(&self) -> Vec<Candidate> {
        self.opts.addrs.clone()
    }

    /// Dispatch a request received on the control channel.
    async fn handle_request(
        &mut self,
        stream: &mut BufferedStream<Transport>,
        request: Request,
    ) -> Result<()> {
        match request.name.as_str() {
            "terminal" => {
                let Some(sid) = required_str(&request, "sid") else {
                    return Self::send_response(stream, Response::error(&request, "missing sid"))
                        .await;
                };
                let tty_device = request.payload.get("tty_device").and_then(Value::as_str);
                self.spawn_session(Mode::Terminal, |opts| {
                    opts.tty_device = tty_device.map(PathBuf::from);
                }, sid);
                Self::send_response(stream, Response::to(&request, Status::Success, Value::Null))
                    .await
            }
            "shell" => {
                let (Some(sid), Some(command)) = (
                    required_str(&request, "sid"),
                    required_str(&request, "command"),
                ) else {
                    return Self::send_response(
                        stream,
                        Response::error(&request, "missing sid or command"),
                    )
                    .await;
                };
                self.spawn_session(Mode::Shell, |opts| {
                    opts.shell_command = Some(command);
                }, sid);
                Self::send_response(stream, Response::to(&request, Status::Success, Value::Null))
                    .await
            }
            "forward" => {
                let Some(sid) = required_str(&request, "sid") else {
                    return Self::send_response(stream, Response::error(&request, "missing sid"))
                        .await;
                };
                let host = request
                    .payload
                    .get("host")
                    .and_then(Value::as_str)
                    .unwrap_or("127.0.0.1")
                    .to_string();
                let Some(port) = request.payload.get("port").and_then(Value::as_u64) else {
                    return Self::send_response(stream, Response::error(&request, "missing port"))
                        .await;
                };
                self.spawn_session(Mode::Forward, |opts| {
                    opts.forward = Some((host, port as u16));
                }, sid);
                Self::send_response(stream, Response::to(&request, Status::Success, Value::Null))
                    .await
            }
            "file_download" => {
                let response = self.handle_file_download(&request);
                Self::send_response(stream, response).await
            }
            "file_upload" => {
                let response = self.handle_file_upload(&request);
                Self::send_response(stream, response).await
            }
            "list_tree" => {
                let response = fsops::handle_list_tree(&request);
                Self::send_response(stream, response).await
            }
            "fstat" => {
                let response = fsops::handle_fstat(&request);
                Self::send_response(stream, response).await
            }
            "create_symlink" => {
                let response = fsops::handle_create_symlink(&request);
                Self::send_response(stream, response).await
            }
            "mkdir" => {
                let response = fsops::handle_mkdir(&request);
                Self::send_response(stream, response).await
            }
            "upgrade" => {
                log::info!("upgrade requested; self-upgrade is not supported in this build");
                Ok(())
            }
            other => {
                log::warn!("unknown request {other}, ignored");
                Ok(())
            }
        }
    }

    fn handle_file_download(&mut self, request: &Request) -> Response {
        let Some(sid) = request.payload.get("sid").and_then(Value::as_str) else {
            return Response::error(request, "missing sid");
        };
        let Some(filename) = request.payload.get("filename").and_then(Value::as_str) else {
            return Response::error(request, "missing filename");
        };
        let path = file::resolve_read_path(filename);
        if let Err(err) = std::fs::File::open(&path) {
            return Response::error(request, format!("{}: {err}", path.display()));
        }
        self.spawn_session(Mode::File, |opts| {
            opts.file_op = Some(FileOp::Download { path });
        }, sid.to_string());
        Response::to(request, Status::Success, Value::Null)
    }

    fn handle_file_upload(&mut self, request: &Request) -> Response {
        let Some(sid) = request.payload.get("sid").and_then(Value::as_str) else {
            return Response::error(request, "missing sid");
        };
        let Some(filename) = request.payload.get("filename").and_then(Value::as_str) else {
            return Response::error(request, "missing filename");
        };
        let dest = request.payload.get("dest").and_then(Value::as_str);
        let terminal_sid = request.payload.get("terminal_sid").and_then(Value::as_str);
        let terminal_cwd = terminal_sid
            .and_then(|tsid| self.sid_to_pid.get(tsid))
            .and_then(|pid| file::process_cwd(*pid).ok());

        let dest_path = file::resolve_upload_dest(filename, dest, terminal_cwd);
        if let Some(parent) = dest_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(err) = std::fs::File::create(&dest_path) {
            return Response::error(request, format!("{}: {err}", dest_path.display()));
        }

        let check_only = request
            .payload
            .get("check_only")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !check_only {
            let perm = request
                .payload
                .get("perm")
                .and_then(Value::as_u64)
                .map(|p| p as u32);
            self.spawn_session(Mode::File, |opts| {
                opts.file_op = Some(FileOp::Upload { path: dest_path, perm });
            }, sid.to_string());
        }
        Response::to(request, Status::Success, Value::Null)
    }

    /// Fork a session task: a fresh agent in `mode` pointed at the connected
    /// server only, with a random mid and the broker-assigned sid.
    fn spawn_session<F>(&mut self, mode: Mode, configure: F, sid: String)
    where
        F: FnOnce(&mut AgentOptions),
    {
        let Some(addr) = self.connected_addr.clone() else {
            log::error!("cannot spawn {mode} session: not connected");
            return;
        };
        let mut opts = AgentOptions {
            mode,
            addrs: vec![addr],
            mid: MidPolicy::random(),
            sid,
            terminal_sid: None,
            tty_device: None,
            shell_command: None,
            file_op: None,
            forward: None,
            tls_mode: Some(self.opts.tls.enabled()),
            tls: self.opts.tls.clone(),
            prop_file: None,
            allowlist: self.opts.allowlist.clone(),
        };
        configure(&mut opts);

        let parent = self.events_tx.clone();
        tokio::spawn(async move {
            let mode = opts.mode;
            let mut session = Agent::with_parent(opts, Some(parent));
            if let Err(err) = session.run_session().await {
                log::error!("{mode} session: {err}");
            }
        });
    }

    /// Pop of the client-initiated download queue: resolve the tty's sid
    /// and spawn a FILE/download session bound to that terminal.
    fn initiate_download(&mut self, ttyname: String, path: PathBuf) {
        let Some(terminal_sid) = self.tty_to_sid.get(&ttyname).cloned() else {
            log::warn!("download: no session registered for {ttyname}");
            return;
        };
        let sid = uuid::Uuid::new_v4().to_string();
        self.spawn_session(Mode::File, move |opts| {
            opts.terminal_sid = Some(terminal_sid);
            opts.file_op = Some(FileOp::Download { path });
        }, sid);
    }

    pub(crate) fn options(&self) -> &AgentOptions {
        &self.opts
    }

    pub(crate) fn parent_events(&self) -> Option<mpsc::UnboundedSender<Event>> {
        self.parent_events.clone()
    }
}

fn required_str(request: &Request, key: &str) -> Option<String> {
    request
        .payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Spawn the LAN discovery listener wired to this agent.
pub fn spawn_lan_discovery(agent: &Agent) {
    let events = agent.events();
    let paused = agent.pause();
    tokio::spawn(async move {
        let port = constants::lan_discovery_port();
        let (beacon_tx, mut beacon_rx) = mpsc::unbounded_channel();
        tokio::spawn(discovery::lan_discovery(port, beacon_tx, paused));
        while let Some(candidate) = beacon_rx.recv().await {
            if events.send(Event::Beacon(candidate)).is_err() {
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_agent() -> Agent {
        Agent::new(AgentOptions::control(
            vec![("127.0.0.1".into(), 9000)],
            MidPolicy::Fixed("alpha".into()),
        ))
    }

    #[test]
    fn beacon_events_dedup_into_extra_addrs() {
        let mut agent = test_agent();
        agent.handle_event(Event::Beacon(("10.0.0.2".into(), 9000)));
        agent.handle_event(Event::Beacon(("10.0.0.2".into(), 9000)));
        agent.handle_event(Event::Beacon(("10.0.0.3".into(), 9000)));
        assert_eq!(agent.extra_addrs.len(), 2);
    }

    #[test]
    fn tty_and_session_registration_fill_tables() {
        let mut agent = test_agent();
        agent.handle_event(Event::RegisterTty {
            sid: "s1".into(),
            ttyname: "/dev/pts/7".into(),
        });
        agent.handle_event(Event::RegisterSession {
            sid: "s1".into(),
            pid: 4242,
        });
        assert_eq!(agent.tty_to_sid.get("/dev/pts/7"), Some(&"s1".to_string()));
        assert_eq!(agent.sid_to_pid.get("s1"), Some(&4242));
    }

    #[test]
    fn reconnect_event_sets_reset() {
        let mut agent = test_agent();
        assert!(!agent.reset);
        agent.handle_event(Event::Reconnect);
        assert!(agent.reset);
    }

    #[test]
    fn reset_clears_tables_and_requests() {
        let mut agent = test_agent();
        agent.handle_event(Event::RegisterTty {
            sid: "s1".into(),
            ttyname: "/dev/pts/1".into(),
        });
        agent.requests.prepare("ping", Value::Null, 60, None);
        agent.registered = true;
        agent.reset_state();
        assert!(agent.tty_to_sid.is_empty());
        assert!(agent.requests.is_empty());
        assert!(!agent.registered);
        assert_eq!(*agent.status().borrow(), DISCONNECTED);
    }

    #[test]
    fn register_payload_shape() {
        let mut agent = test_agent();
        agent.reset_state();
        let payload = agent.register_payload();
        assert_eq!(payload["mode"], "agent");
        assert_eq!(payload["mid"], "alpha");
        assert!(payload["sid"].as_str().is_some());
        assert!(payload["properties"]["allowlist"].is_array());
    }

    #[test]
    fn download_event_queues_and_pops() {
        let mut agent = test_agent();
        agent.handle_event(Event::Download {
            ttyname: "/dev/pts/2".into(),
            path: PathBuf::from("/tmp/file"),
        });
        assert_eq!(agent.download_queue.len(), 1);
    }
}
