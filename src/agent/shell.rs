//! SHELL session: run one command and bridge its stdio to the byte stream.
//!
//! stdout and stderr are multiplexed onto the socket; socket bytes go to
//! the command's stdin. The stdin-close sentinel, two adjacent copies of
//! `##STDIN_CLOSED##`, closes stdin at the split point, letting operators
//! pipe a finite input to a command that reads to EOF. When the command
//! exits the session escalates SIGTERM → one second → SIGKILL before
//! closing the socket.

use std::process::Stdio;

use anyhow::{Context as _, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};

use crate::constants::{BUFSIZE, STDIN_CLOSED};
use crate::stream::{BufferedStream, Transport};
use crate::wire::Mode;

use super::Agent;

/// Serve a SHELL session on `stream` until the command exits or the socket
/// closes.
pub async fn serve(agent: &mut Agent, mut stream: BufferedStream<Transport>) -> Result<()> {
    debug_assert_eq!(agent.mode(), Mode::Shell);
    let command = agent
        .options()
        .shell_command
        .clone()
        .context("shell session without a command")?;

    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c")
        .arg(&command)
        .current_dir(&home)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = super::tty::exe_dir() {
        let path = std::env::var("PATH").unwrap_or_default();
        cmd.env("PATH", format!("{dir}:{path}"));
    }

    let mut child = cmd.spawn().with_context(|| format!("cannot spawn `{command}`"))?;
    let mut stdin = child.stdin.take();
    let mut stdout = child.stdout.take().context("child stdout missing")?;
    let mut stderr = child.stderr.take().context("child stderr missing")?;

    // Bytes that arrived with the registration handshake are command input.
    let head = stream.take_head();
    if !head.is_empty() {
        feed_stdin(&mut stdin, &head).await;
    }

    let mut out_buf = vec![0u8; BUFSIZE];
    let mut err_buf = vec![0u8; BUFSIZE];
    let mut out_open = true;
    let mut err_open = true;
    let result: Result<()> = loop {
        // Both pipes at EOF means the command's output is fully delivered;
        // the pipes close when the process (and anything holding them) exits.
        if !out_open && !err_open {
            break Ok(());
        }
        use tokio::io::AsyncReadExt;
        tokio::select! {
            biased;
            read = stdout.read(&mut out_buf), if out_open => match read {
                Ok(0) | Err(_) => out_open = false,
                Ok(n) => {
                    if let Err(err) = stream.send(&out_buf[..n]).await {
                        break Err(err).context("socket write failed");
                    }
                }
            },
            read = stderr.read(&mut err_buf), if err_open => match read {
                Ok(0) | Err(_) => err_open = false,
                Ok(n) => {
                    if let Err(err) = stream.send(&err_buf[..n]).await {
                        break Err(err).context("socket write failed");
                    }
                }
            },
            read = stream.recv(BUFSIZE) => match read {
                Ok(data) if data.is_empty() => break Ok(()),
                Ok(data) => feed_stdin(&mut stdin, &data).await,
                Err(err) => break Err(err).context("connection terminated"),
            },
        }
    };

    terminate(&mut child).await;
    let _ = stream.shutdown().await;
    result
}

/// Write socket bytes to stdin, honoring the doubled close sentinel: the
/// prefix before the sentinel is written, then stdin is dropped (closed).
async fn feed_stdin(stdin: &mut Option<ChildStdin>, data: &[u8]) {
    let Some(pipe) = stdin.as_mut() else {
        return;
    };
    match find_close_sentinel(data) {
        Some(idx) => {
            if pipe.write_all(&data[..idx]).await.is_err() {
                log::warn!("shell stdin write failed");
            }
            let _ = pipe.flush().await;
            *stdin = None;
        }
        None => {
            if pipe.write_all(data).await.is_err() {
                log::warn!("shell stdin write failed");
            } else {
                let _ = pipe.flush().await;
            }
        }
    }
}

/// Offset of the doubled `##STDIN_CLOSED##` sentinel, if present.
pub fn find_close_sentinel(data: &[u8]) -> Option<usize> {
    let sentinel = [STDIN_CLOSED.as_bytes(), STDIN_CLOSED.as_bytes()].concat();
    data.windows(sentinel.len()).position(|w| w == sentinel)
}

/// SIGTERM, grace second, SIGKILL.
async fn terminate(child: &mut Child) {
    match child.try_wait() {
        Ok(Some(_)) => return,
        Ok(None) => {}
        Err(_) => return,
    }
    if let Some(pid) = child.id() {
        // SAFETY: pid names our own child; worst case the signal hits a
        // reaped slot and is ignored.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    if let Ok(None) = child.try_wait() {
        let _ = child.kill().await;
    }
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_must_be_doubled() {
        let single = format!("data{STDIN_CLOSED}more");
        assert_eq!(find_close_sentinel(single.as_bytes()), None);
    }

    #[test]
    fn doubled_sentinel_found_at_split_point() {
        let data = format!("input{STDIN_CLOSED}{STDIN_CLOSED}");
        assert_eq!(find_close_sentinel(data.as_bytes()), Some(5));
    }

    #[test]
    fn sentinel_at_start() {
        let data = format!("{STDIN_CLOSED}{STDIN_CLOSED}tail");
        assert_eq!(find_close_sentinel(data.as_bytes()), Some(0));
    }

    #[test]
    fn no_sentinel_in_plain_data() {
        assert_eq!(find_close_sentinel(b"just some bytes"), None);
    }

    #[tokio::test]
    async fn feed_stdin_closes_on_sentinel() {
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let mut stdin = child.stdin.take();
        let data = format!("hello{STDIN_CLOSED}{STDIN_CLOSED}");
        feed_stdin(&mut stdin, data.as_bytes()).await;
        assert!(stdin.is_none());

        // cat sees EOF after "hello" and exits with exactly that output.
        let output = child.wait_with_output().await.unwrap();
        assert_eq!(output.stdout, b"hello");
    }
}
