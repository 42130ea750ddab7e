//! FORWARD session: bridge the byte stream to a local TCP target.

use anyhow::{Context as _, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::constants::CONNECT_TIMEOUT;
use crate::stream::{BufferedStream, Transport};
use crate::wire::Mode;

use super::Agent;

/// Connect to the session's `(host, port)` target and copy bytes both ways
/// until either side closes.
pub async fn serve(agent: &mut Agent, mut stream: BufferedStream<Transport>) -> Result<()> {
    debug_assert_eq!(agent.mode(), Mode::Forward);
    let (host, port) = agent
        .options()
        .forward
        .clone()
        .context("forward session without a target")?;

    let mut target =
        tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host.as_str(), port)))
            .await
            .with_context(|| format!("connect timeout: {host}:{port}"))?
            .with_context(|| format!("connect failed: {host}:{port}"))?;

    // Bytes that arrived behind the registration exchange belong to the
    // forwarded circuit.
    let head = stream.take_head();
    if !head.is_empty() {
        target.write_all(&head).await.context("target write failed")?;
    }

    match tokio::io::copy_bidirectional(&mut stream, &mut target).await {
        Ok((sent, received)) => {
            log::info!("forward {host}:{port}: {sent} bytes out, {received} bytes in");
        }
        Err(err) => log::error!("forward {host}:{port}: {err}"),
    }

    let _ = target.shutdown().await;
    let _ = stream.shutdown().await;
    Ok(())
}
