//! FILE session: stream one file to or from the byte stream.
//!
//! A download announces itself with `request_to_download` (so the operator
//! side can show a name and size), waits for `clear_to_download`, then
//! streams the file in 4 KiB blocks. An upload sends a fire-and-forget
//! `clear_to_upload` and then appends every received byte to the
//! destination file, creating parent directories and applying permission
//! bits first.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Result};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::constants::BLOCK_SIZE;
use crate::stream::{BufferedStream, Transport};
use crate::wire::Mode;

use super::{Agent, FileOp};

/// Serve a FILE session on `stream`.
pub async fn serve(agent: &mut Agent, mut stream: BufferedStream<Transport>) -> Result<()> {
    debug_assert_eq!(agent.mode(), Mode::File);
    let op = agent
        .options()
        .file_op
        .clone()
        .context("file session without an operation")?;

    match op {
        FileOp::Download { path } => download(agent, &mut stream, &path).await,
        FileOp::Upload { path, perm } => upload(agent, &mut stream, &path, perm).await,
    }
}

async fn download(
    agent: &mut Agent,
    stream: &mut BufferedStream<Transport>,
    path: &Path,
) -> Result<()> {
    let size = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("cannot stat {}", path.display()))?
        .len();
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let terminal_sid = agent.options().terminal_sid.clone();

    // Infinite timeout: the transfer waits for a human to accept it.
    agent
        .send_request(
            stream,
            "request_to_download",
            json!({
                "terminal_sid": terminal_sid,
                "filename": filename,
                "size": size,
            }),
            -1,
            None,
        )
        .await?;

    // Framed parsing continues until the server clears the transfer; only
    // then does the socket become a raw byte pipe.
    let _ = agent.wait_for_request(stream, "clear_to_download").await?;

    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("cannot open {}", path.display()))?;
    let mut buf = vec![0u8; BLOCK_SIZE];
    loop {
        let n = file.read(&mut buf).await.context("file read failed")?;
        if n == 0 {
            break;
        }
        stream.send(&buf[..n]).await.context("socket write failed")?;
    }
    stream.shutdown().await.ok();
    Ok(())
}

async fn upload(
    agent: &mut Agent,
    stream: &mut BufferedStream<Transport>,
    path: &Path,
    perm: Option<u32>,
) -> Result<()> {
    agent
        .send_request(stream, "clear_to_upload", json!({}), -1, None)
        .await?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }
    }

    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("cannot create {}", path.display()))?;
    if let Some(mode) = perm {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(mode);
        tokio::fs::set_permissions(path, perms)
            .await
            .with_context(|| format!("cannot chmod {}", path.display()))?;
    }

    // Head first: bytes that rode in behind the registration exchange.
    let head = stream.take_head();
    if !head.is_empty() {
        file.write_all(&head).await.context("file write failed")?;
    }

    loop {
        match stream.recv(BLOCK_SIZE).await {
            Ok(data) if data.is_empty() => break,
            Ok(data) => file.write_all(&data).await.context("file write failed")?,
            Err(err) => bail!("socket error: {err}"),
        }
    }
    file.flush().await.ok();
    Ok(())
}

/// Resolve a path supplied for reading: relative inputs live in `$HOME`.
pub fn resolve_read_path(filename: &str) -> PathBuf {
    let expanded = shellexpand::tilde(filename).into_owned();
    let path = PathBuf::from(expanded);
    if path.is_absolute() {
        path
    } else {
        home_dir().join(path)
    }
}

/// Resolve an upload destination.
///
/// Priority: an explicit `dest` (made absolute against `$HOME`; a directory
/// dest gets the filename appended), then the working directory of the
/// associated terminal's shell, then `$HOME`.
pub fn resolve_upload_dest(
    filename: &str,
    dest: Option<&str>,
    terminal_cwd: Option<PathBuf>,
) -> PathBuf {
    match dest {
        Some(dest) if !dest.is_empty() => {
            let expanded = shellexpand::tilde(dest).into_owned();
            let mut path = PathBuf::from(expanded);
            if !path.is_absolute() {
                path = home_dir().join(path);
            }
            if path.is_dir() {
                path.join(filename)
            } else {
                path
            }
        }
        _ => {
            let target_dir = terminal_cwd.unwrap_or_else(home_dir);
            target_dir.join(filename)
        }
    }
}

/// Working directory of a process, for terminal-relative uploads.
#[cfg(target_os = "linux")]
pub fn process_cwd(pid: u32) -> Result<PathBuf> {
    std::fs::read_link(format!("/proc/{pid}/cwd")).with_context(|| format!("no cwd for pid {pid}"))
}

#[cfg(target_os = "macos")]
pub fn process_cwd(pid: u32) -> Result<PathBuf> {
    let output = std::process::Command::new("lsof")
        .args(["-a", "-p", &pid.to_string(), "-d", "cwd", "-Fn"])
        .output()
        .context("lsof failed")?;
    let text = String::from_utf8_lossy(&output.stdout);
    for line in text.lines() {
        if let Some(path) = line.strip_prefix('n') {
            return Ok(PathBuf::from(path));
        }
    }
    bail!("no cwd for pid {pid}")
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn process_cwd(_pid: u32) -> Result<PathBuf> {
    bail!("process cwd lookup is unsupported on this platform")
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_read_path_is_verbatim() {
        assert_eq!(
            resolve_read_path("/var/log/syslog"),
            PathBuf::from("/var/log/syslog")
        );
    }

    #[test]
    fn relative_read_path_lands_in_home() {
        let path = resolve_read_path("notes.txt");
        assert!(path.is_absolute());
        assert!(path.ends_with("notes.txt"));
    }

    #[test]
    fn upload_dest_absolute_file() {
        let dest = resolve_upload_dest("x.bin", Some("/tmp/subdir/x.bin"), None);
        assert_eq!(dest, PathBuf::from("/tmp/subdir/x.bin"));
    }

    #[test]
    fn upload_dest_directory_gets_filename() {
        let dir = tempfile::tempdir().unwrap();
        let dest = resolve_upload_dest("x.bin", Some(dir.path().to_str().unwrap()), None);
        assert_eq!(dest, dir.path().join("x.bin"));
    }

    #[test]
    fn upload_dest_defaults_to_terminal_cwd() {
        let dest = resolve_upload_dest("x.bin", None, Some(PathBuf::from("/work/project")));
        assert_eq!(dest, PathBuf::from("/work/project/x.bin"));
    }

    #[test]
    fn upload_dest_falls_back_to_home() {
        let dest = resolve_upload_dest("x.bin", None, None);
        assert!(dest.is_absolute());
        assert!(dest.ends_with("x.bin"));
    }

    #[test]
    fn upload_dest_empty_string_is_ignored() {
        let dest = resolve_upload_dest("x.bin", Some(""), Some(PathBuf::from("/work")));
        assert_eq!(dest, PathBuf::from("/work/x.bin"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn process_cwd_of_self_exists() {
        let cwd = process_cwd(std::process::id()).unwrap();
        assert!(cwd.is_absolute());
    }
}
