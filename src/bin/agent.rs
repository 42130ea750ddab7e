//! Overlord agent binary.
//!
//! Runs the long-lived control channel, the LAN discovery listener, and the
//! local IPC endpoint. The `--status`, `--reset`, and `--download` flags
//! are IPC clients that talk to an already-running agent instead.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use clap::Parser;
use serde_json::json;

use overlord::agent::{self, ipc, Agent, AgentOptions};
use overlord::constants;
use overlord::discovery;
use overlord::identity::MidPolicy;
use overlord::tls::TlsSettings;

#[derive(Parser, Debug)]
#[command(name = "overlord-agent", about = "Overlord device agent", version)]
struct Args {
    /// Use MID as the machine id.
    #[arg(long, value_name = "MID")]
    mid: Option<String>,

    /// Use a random machine id.
    #[arg(long = "rand-mid", conflicts_with = "mid")]
    rand_mid: bool,

    /// Disable LAN discovery.
    #[arg(long = "no-lan-disc")]
    no_lan_disc: bool,

    /// Disable the local IPC endpoint.
    #[arg(long = "no-rpc-server")]
    no_rpc_server: bool,

    /// Force TLS on (`y`), off (`n`), or probe the server (`detect`).
    #[arg(long, default_value = "detect", value_parser = ["y", "n", "detect"])]
    tls: String,

    /// Server TLS certificate (PEM) used as the only trust anchor.
    #[arg(long = "tls-cert-file", value_name = "FILE")]
    tls_cert_file: Option<PathBuf>,

    /// Do not verify the certificate if TLS is enabled.
    #[arg(long = "tls-no-verify")]
    tls_no_verify: bool,

    /// JSON file with client properties sent at registration.
    #[arg(long = "prop-file", value_name = "FILE")]
    prop_file: Option<PathBuf>,

    /// Comma-separated users/groups that can access this agent.
    #[arg(long)]
    allowlist: Option<String>,

    /// Enqueue FILE for download through the terminal on stdin, then exit.
    #[arg(long, value_name = "FILE")]
    download: Option<PathBuf>,

    /// Ask the running agent to reconnect, then exit.
    #[arg(long)]
    reset: bool,

    /// Print the running agent's status, then exit.
    #[arg(long)]
    status: bool,

    /// Server addresses in `host[:port]` form.
    #[arg(value_name = "ADDR")]
    addrs: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let rpc_port = constants::agent_rpc_port();

    if args.status {
        let status = ipc::call(rpc_port, "GetStatus", json!([])).await?;
        println!("{}", status.as_str().unwrap_or_default());
        return Ok(());
    }
    if args.reset {
        ipc::call(rpc_port, "Reconnect", json!([])).await?;
        return Ok(());
    }
    if let Some(file) = args.download.as_deref() {
        return enqueue_download(rpc_port, file).await;
    }

    let mut addrs = Vec::new();
    for addr in &args.addrs {
        addrs.extend(discovery::expand_addr(addr));
    }

    let mid = if args.rand_mid {
        MidPolicy::random()
    } else {
        match args.mid {
            Some(mid) => MidPolicy::Fixed(mid),
            None => MidPolicy::Stable,
        }
    };

    let mut opts = AgentOptions::control(addrs, mid);
    opts.tls = TlsSettings::new(args.tls_cert_file.clone(), !args.tls_no_verify);
    opts.tls_mode = match args.tls.as_str() {
        "y" => Some(true),
        "n" => Some(false),
        _ => None,
    };
    opts.prop_file = args.prop_file.clone();
    opts.allowlist = args.allowlist.clone();

    let mut agent = Agent::new(opts);
    if !args.no_lan_disc {
        agent::spawn_lan_discovery(&agent);
    }
    if !args.no_rpc_server {
        let events = agent.events();
        let status = agent.status();
        tokio::spawn(async move {
            if let Err(err) = ipc::serve(rpc_port, events, status).await {
                log::error!("IPC: {err}");
            }
        });
    }

    tokio::select! {
        result = agent.run() => result,
        _ = tokio::signal::ctrl_c() => {
            log::error!("received interrupt, quit");
            Ok(())
        }
    }
}

/// Validate FILE and hand it to the running agent's download queue.
async fn enqueue_download(rpc_port: u16, file: &Path) -> Result<()> {
    let path = std::fs::canonicalize(file)
        .with_context(|| format!("file `{}' does not exist", file.display()))?;
    std::fs::File::open(&path)
        .with_context(|| format!("can not open {} for reading", path.display()))?;

    let ttyname = stdin_tty().context("stdin is not a terminal")?;
    ipc::call(
        rpc_port,
        "AddToDownloadQueue",
        json!([ttyname, path.to_string_lossy()]),
    )
    .await?;
    Ok(())
}

/// Device name of the terminal on stdin.
fn stdin_tty() -> Option<String> {
    // SAFETY: ttyname returns a pointer to a static buffer, or null when
    // stdin is not a tty; it is copied out immediately.
    unsafe {
        let name = libc::ttyname(0);
        if name.is_null() {
            return None;
        }
        Some(
            std::ffi::CStr::from_ptr(name)
                .to_string_lossy()
                .into_owned(),
        )
    }
}
