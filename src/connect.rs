//! Transport establishment: TCP dial, optional TLS, `/connect` upgrade.
//!
//! The server exposes the agent endpoint behind a WebSocket upgrade at
//! `/connect`. Only the HTTP handshake is spoken: once the `101 Switching
//! Protocols` response is in, the socket is hijacked and used as a raw
//! duplex byte stream with no WebSocket framing. Any bytes the handshake read
//! past the header terminator seed the [`BufferedStream`] head so nothing
//! is lost.

use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::BytesMut;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;

use crate::constants::CONNECT_TIMEOUT;
use crate::stream::{BufferedStream, Transport};
use crate::tls::TlsSettings;

/// Upper bound on the upgrade response header block.
const MAX_HEADER_BYTES: usize = 16 * 1024;

/// Dial `host:port`, wrap in TLS when enabled, perform the `/connect`
/// upgrade, and return the hijacked stream with handshake leftovers in the
/// head buffer.
pub async fn establish(
    host: &str,
    port: u16,
    tls: &TlsSettings,
) -> Result<BufferedStream<Transport>> {
    let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .context("connect timeout")?
        .context("connect failed")?;
    tcp.set_nodelay(true).ok();

    let mut transport = match tls.config() {
        Some(config) => {
            let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
                .with_context(|| format!("invalid TLS server name: {host}"))?;
            let connector = TlsConnector::from(Arc::clone(&config));
            let stream = tokio::time::timeout(CONNECT_TIMEOUT, connector.connect(server_name, tcp))
                .await
                .context("TLS handshake timeout")?
                .context("TLS handshake failed")?;
            Transport::Tls(Box::new(stream))
        }
        None => Transport::Plain(tcp),
    };

    let leftover = upgrade(&mut transport, host, port).await?;
    Ok(BufferedStream::new(transport, leftover))
}

/// Perform the client side of the WebSocket upgrade on `stream`.
///
/// Returns the bytes read past the end of the response headers.
pub async fn upgrade<S>(stream: &mut S, host: &str, port: u16) -> Result<BytesMut>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = websocket_key();
    let request = format!(
        "GET /connect HTTP/1.1\r\n\
         Host: {host}:{port}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         \r\n"
    );
    stream
        .write_all(request.as_bytes())
        .await
        .context("upgrade request write failed")?;

    let (header, leftover) = read_header_block(stream).await?;
    let header = String::from_utf8_lossy(&header);

    let status_line = header.lines().next().unwrap_or_default();
    if !status_line.contains(" 101") {
        bail!("upgrade rejected: {status_line}");
    }

    let expected = derive_accept_key(key.as_bytes());
    let accept = find_header(&header, "sec-websocket-accept")
        .context("upgrade response missing Sec-WebSocket-Accept")?;
    if accept != expected {
        bail!("upgrade key mismatch");
    }

    Ok(leftover)
}

/// 16 random bytes, base64: the `Sec-WebSocket-Key` nonce.
fn websocket_key() -> String {
    let mut nonce = [0u8; 16];
    rand::rng().fill_bytes(&mut nonce);
    BASE64.encode(nonce)
}

/// Read until the `\r\n\r\n` header terminator; split into (headers,
/// leftover bytes already read past the terminator).
pub async fn read_header_block<S>(stream: &mut S) -> Result<(Vec<u8>, BytesMut)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(end) = find_terminator(&buf) {
            let mut leftover = BytesMut::new();
            leftover.extend_from_slice(&buf[end..]);
            buf.truncate(end);
            return Ok((buf, leftover));
        }
        if buf.len() > MAX_HEADER_BYTES {
            bail!("header block too large");
        }
        let n = stream.read(&mut chunk).await.context("header read failed")?;
        if n == 0 {
            bail!("connection closed during handshake");
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Index just past `\r\n\r\n`, if present.
fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Case-insensitive single-header lookup in a raw header block.
pub fn find_header(block: &str, name: &str) -> Option<String> {
    for line in block.lines().skip(1) {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if key.trim().eq_ignore_ascii_case(name) {
            return Some(value.trim().to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upgrade_happy_path_returns_leftover() {
        let (mut client, mut server) = tokio::io::duplex(8192);

        let server_task = tokio::spawn(async move {
            let (header, _leftover) = read_header_block(&mut server).await.unwrap();
            let header = String::from_utf8(header).unwrap();
            assert!(header.starts_with("GET /connect HTTP/1.1\r\n"));
            let key = find_header(&header, "sec-websocket-key").unwrap();
            let accept = derive_accept_key(key.as_bytes());
            let response = format!(
                "HTTP/1.1 101 Switching Protocols\r\n\
                 Upgrade: websocket\r\n\
                 Connection: Upgrade\r\n\
                 Sec-WebSocket-Accept: {accept}\r\n\
                 \r\n"
            );
            server.write_all(response.as_bytes()).await.unwrap();
            // Bytes the server sends immediately after the upgrade must not
            // be lost by the client.
            server.write_all(b"early-bytes").await.unwrap();
            server
        });

        let leftover = upgrade(&mut client, "127.0.0.1", 9000).await.unwrap();
        let _server = server_task.await.unwrap();
        // The leftover may or may not contain the early bytes depending on
        // read interleaving; whatever was captured must be a prefix of them.
        assert!(b"early-bytes".starts_with(&leftover[..]));
    }

    #[tokio::test]
    async fn upgrade_rejects_non_101() {
        let (mut client, mut server) = tokio::io::duplex(8192);
        tokio::spawn(async move {
            let _ = read_header_block(&mut server).await;
            let _ = server
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
                .await;
        });
        let err = upgrade(&mut client, "h", 1).await.unwrap_err();
        assert!(err.to_string().contains("upgrade rejected"));
    }

    #[tokio::test]
    async fn upgrade_rejects_bad_accept_key() {
        let (mut client, mut server) = tokio::io::duplex(8192);
        tokio::spawn(async move {
            let _ = read_header_block(&mut server).await;
            let _ = server
                .write_all(
                    b"HTTP/1.1 101 Switching Protocols\r\n\
                      Sec-WebSocket-Accept: bogus\r\n\r\n",
                )
                .await;
        });
        let err = upgrade(&mut client, "h", 1).await.unwrap_err();
        assert!(err.to_string().contains("key mismatch"));
    }

    #[tokio::test]
    async fn header_block_split_is_exact() {
        let (mut a, mut b) = tokio::io::duplex(8192);
        b.write_all(b"HTTP/1.1 101 X\r\nA: 1\r\n\r\ntail").await.unwrap();
        let (header, leftover) = read_header_block(&mut a).await.unwrap();
        assert!(header.ends_with(b"\r\n\r\n"));
        assert_eq!(&leftover[..], b"tail");
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let block = "HTTP/1.1 101 S\r\nSec-WebSocket-Accept:  abc \r\n";
        assert_eq!(
            find_header(block, "sec-websocket-accept").as_deref(),
            Some("abc")
        );
        assert_eq!(find_header(block, "missing"), None);
    }
}
