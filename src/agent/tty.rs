//! TERMINAL session: bridge a pty (or an explicit tty device) to the
//! session's byte stream.
//!
//! The socket→pty direction is filtered through [`EscapeScanner`], which
//! recognizes the in-band resize sequence `ESC [ 8 ; rows ; cols t`,
//! applies it as a window-size change, and forwards every other byte
//! unchanged. A sequence split across reads is held back until the next
//! read completes it, so a resize is never half-consumed.
//!
//! EOF on either side ends the session; the shell child is killed on the
//! way out.

use std::io::Write as _;
use std::path::Path;

use anyhow::{Context as _, Result};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;

use crate::constants::BUFSIZE;
use crate::stream::{BufferedStream, Transport};
use crate::wire::Mode;

use super::{Agent, Event};

/// Default pty geometry before the first resize arrives.
const DEFAULT_ROWS: u16 = 24;
const DEFAULT_COLS: u16 = 80;

/// Longest escape sequence the scanner will hold back before giving up and
/// passing the bytes through as data.
const MAX_PENDING_ESCAPE: usize = 64;

/// Output of one scanner pass.
#[derive(Debug, PartialEq, Eq)]
pub enum ScanItem {
    /// Bytes to write to the terminal.
    Data(Vec<u8>),
    /// A consumed resize sequence.
    Resize { rows: u16, cols: u16 },
}

/// Stateful filter for the socket→terminal byte direction.
#[derive(Debug, Default)]
pub struct EscapeScanner {
    pending: Vec<u8>,
}

impl EscapeScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; returns data chunks and resize events in order.
    pub fn feed(&mut self, input: &[u8]) -> Vec<ScanItem> {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(input);

        let mut items = Vec::new();
        let mut data = Vec::new();
        let mut pos = 0;

        while pos < buf.len() {
            if buf[pos] != 0x1b {
                data.push(buf[pos]);
                pos += 1;
                continue;
            }
            match parse_csi(&buf[pos..]) {
                Csi::Incomplete => {
                    if buf.len() - pos > MAX_PENDING_ESCAPE {
                        // Not a sequence we will ever complete; stop holding
                        // the bytes hostage.
                        data.push(buf[pos]);
                        pos += 1;
                        continue;
                    }
                    self.pending = buf[pos..].to_vec();
                    break;
                }
                Csi::NotCsi => {
                    data.push(buf[pos]);
                    pos += 1;
                }
                Csi::Sequence { len, resize } => {
                    match resize {
                        Some((rows, cols)) => {
                            if !data.is_empty() {
                                items.push(ScanItem::Data(std::mem::take(&mut data)));
                            }
                            items.push(ScanItem::Resize { rows, cols });
                        }
                        None => data.extend_from_slice(&buf[pos..pos + len]),
                    }
                    pos += len;
                }
            }
        }

        if !data.is_empty() {
            items.push(ScanItem::Data(data));
        }
        items
    }

    /// Any held-back partial sequence, flushed as data.
    pub fn flush(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }
}

enum Csi {
    /// Might become a full sequence with more bytes.
    Incomplete,
    /// An ESC not starting a CSI sequence.
    NotCsi,
    /// A complete `ESC [ params final` sequence of `len` bytes; `resize` is
    /// set when it is the window-size escape.
    Sequence {
        len: usize,
        resize: Option<(u16, u16)>,
    },
}

/// Parse a CSI sequence at the start of `buf` (which begins with ESC).
fn parse_csi(buf: &[u8]) -> Csi {
    debug_assert_eq!(buf[0], 0x1b);
    if buf.len() < 2 {
        return Csi::Incomplete;
    }
    if buf[1] != b'[' {
        return Csi::NotCsi;
    }
    let mut idx = 2;
    while idx < buf.len() {
        let b = buf[idx];
        if b.is_ascii_digit() || b == b';' || b == b'?' {
            idx += 1;
            continue;
        }
        if b.is_ascii_alphabetic() {
            let params = &buf[2..idx];
            let resize = if b == b't' { parse_resize(params) } else { None };
            return Csi::Sequence {
                len: idx + 1,
                resize,
            };
        }
        // Malformed sequence; treat the ESC as plain data.
        return Csi::NotCsi;
    }
    Csi::Incomplete
}

/// `8;rows;cols` parameters of a `t` sequence.
fn parse_resize(params: &[u8]) -> Option<(u16, u16)> {
    let text = std::str::from_utf8(params).ok()?;
    let mut parts = text.split(';');
    if parts.next()? != "8" {
        return None;
    }
    let rows: u16 = parts.next()?.parse().ok()?;
    let cols: u16 = parts.next()?.parse().ok()?;
    Some((rows, cols))
}

/// The agent's end of the terminal: a fresh pty with a shell, or an
/// explicitly opened tty device.
enum Endpoint {
    Pty {
        master: Box<dyn MasterPty + Send>,
        writer: Box<dyn std::io::Write + Send>,
        child: Box<dyn Child + Send + Sync>,
    },
    Device {
        file: std::fs::File,
    },
}

impl Endpoint {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Endpoint::Pty { writer, .. } => {
                writer.write_all(data)?;
                writer.flush()?;
            }
            Endpoint::Device { file } => {
                file.write_all(data)?;
                file.flush()?;
            }
        }
        Ok(())
    }

    fn resize(&mut self, rows: u16, cols: u16) {
        log::info!("terminal resize request received: rows={rows}, cols={cols}");
        match self {
            Endpoint::Pty { master, .. } => {
                if let Err(err) = master.resize(PtySize {
                    rows,
                    cols,
                    pixel_width: 0,
                    pixel_height: 0,
                }) {
                    log::warn!("terminal resize: {err}");
                }
            }
            Endpoint::Device { file } => {
                set_winsize(file, rows, cols);
            }
        }
    }

    fn shutdown(&mut self) {
        if let Endpoint::Pty { child, .. } = self {
            let _ = child.kill();
        }
    }
}

/// Apply `TIOCSWINSZ` on a raw fd.
fn set_winsize<F: std::os::unix::io::AsRawFd>(fd: &F, rows: u16, cols: u16) {
    let size = libc::winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: fd is a valid open descriptor and winsize is a plain struct.
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCSWINSZ, &size) };
    if rc != 0 {
        log::warn!("TIOCSWINSZ failed on fd {}", fd.as_raw_fd());
    }
}

/// Serve a TERMINAL session on `stream` until either side closes.
pub async fn serve(agent: &mut Agent, mut stream: BufferedStream<Transport>) -> Result<()> {
    debug_assert_eq!(agent.mode(), Mode::Terminal);
    let sid = agent.sid().to_string();
    let parent = agent.parent_events();

    let (mut endpoint, mut reader_rx) = match agent.options().tty_device.clone() {
        Some(device) => open_device(&device)?,
        None => open_pty(&sid, parent)?,
    };

    // Bytes already buffered during registration go through the scanner
    // first.
    let mut scanner = EscapeScanner::new();
    let head = stream.take_head();
    for item in scanner.feed(&head) {
        apply(&mut endpoint, item)?;
    }

    let result: Result<()> = loop {
        tokio::select! {
            chunk = reader_rx.recv() => match chunk {
                Some(data) => {
                    if let Err(err) = stream.send(&data).await {
                        break Err(err).context("socket write failed");
                    }
                }
                None => break Ok(()),
            },
            read = stream.recv(BUFSIZE) => match read {
                Ok(data) if data.is_empty() => break Ok(()),
                Ok(data) => {
                    let mut failed = None;
                    for item in scanner.feed(&data) {
                        if let Err(err) = apply(&mut endpoint, item) {
                            failed = Some(err);
                            break;
                        }
                    }
                    if let Some(err) = failed {
                        break Err(err);
                    }
                }
                Err(err) => break Err(err).context("connection terminated"),
            },
        }
    };

    endpoint.shutdown();
    let _ = stream.shutdown().await;
    result
}

fn apply(endpoint: &mut Endpoint, item: ScanItem) -> Result<()> {
    match item {
        ScanItem::Data(data) => endpoint.write(&data).context("terminal write failed"),
        ScanItem::Resize { rows, cols } => {
            endpoint.resize(rows, cols);
            Ok(())
        }
    }
}

/// Allocate a pty, start the login shell in it, and register the tty name
/// and shell pid with the parent control agent.
fn open_pty(
    sid: &str,
    parent: Option<mpsc::UnboundedSender<Event>>,
) -> Result<(Endpoint, mpsc::Receiver<Vec<u8>>)> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
            pixel_width: 0,
            pixel_height: 0,
        })
        .context("failed to open pty")?;

    let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
    let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
    let user = std::env::var("USER").unwrap_or_else(|_| "root".to_string());

    let mut cmd = CommandBuilder::new(&shell);
    cmd.env("USER", &user);
    cmd.env("HOME", &home);
    if let Some(dir) = exe_dir() {
        let path = std::env::var("PATH").unwrap_or_default();
        cmd.env("PATH", format!("{path}:{dir}"));
    }
    cmd.cwd(&home);

    let child = pair
        .slave
        .spawn_command(cmd)
        .context("failed to spawn shell")?;
    drop(pair.slave);

    if let Some(events) = parent {
        if let Some(ttyname) = pty_name(pair.master.as_ref()) {
            let _ = events.send(Event::RegisterTty {
                sid: sid.to_string(),
                ttyname,
            });
        }
        if let Some(pid) = child.process_id() {
            let _ = events.send(Event::RegisterSession {
                sid: sid.to_string(),
                pid,
            });
        }
    }

    let mut reader = pair
        .master
        .try_clone_reader()
        .context("failed to clone pty reader")?;
    let writer = pair.master.take_writer().context("failed to take pty writer")?;
    let reader_rx = spawn_reader(move |buf| std::io::Read::read(&mut reader, buf));

    Ok((
        Endpoint::Pty {
            master: pair.master,
            writer,
            child,
        },
        reader_rx,
    ))
}

/// Open an explicit tty device raw, with software and hardware flow control
/// disabled.
fn open_device(device: &Path) -> Result<(Endpoint, mpsc::Receiver<Vec<u8>>)> {
    use std::os::unix::io::AsRawFd;

    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(device)
        .with_context(|| format!("cannot open {}", device.display()))?;

    let fd = file.as_raw_fd();
    // SAFETY: fd is a freshly opened descriptor; termios is a plain struct
    // fully initialized by tcgetattr before use.
    unsafe {
        let mut attrs: libc::termios = std::mem::zeroed();
        if libc::tcgetattr(fd, &mut attrs) != 0 {
            anyhow::bail!("tcgetattr failed on {}", device.display());
        }
        libc::cfmakeraw(&mut attrs);
        attrs.c_iflag &= !(libc::IXON | libc::IXOFF);
        attrs.c_cflag |= libc::CLOCAL;
        attrs.c_cflag &= !libc::CRTSCTS;
        if libc::tcsetattr(fd, libc::TCSANOW, &attrs) != 0 {
            anyhow::bail!("tcsetattr failed on {}", device.display());
        }
    }

    let mut reader = file.try_clone().context("cannot clone tty device")?;
    let reader_rx = spawn_reader(move |buf| std::io::Read::read(&mut reader, buf));

    Ok((Endpoint::Device { file }, reader_rx))
}

/// Blocking reader thread feeding an async channel. The channel closes on
/// EOF or read error, ending the session loop.
fn spawn_reader<F>(mut read: F) -> mpsc::Receiver<Vec<u8>>
where
    F: FnMut(&mut [u8]) -> std::io::Result<usize> + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Vec<u8>>(32);
    std::thread::spawn(move || {
        let mut buf = [0u8; BUFSIZE];
        loop {
            match read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

/// Name of the pty's slave device.
#[cfg(target_os = "linux")]
fn pty_name(master: &(dyn MasterPty + Send)) -> Option<String> {
    let fd = master.as_raw_fd()?;
    let mut buf = [0u8; 128];
    // SAFETY: fd is the pty master; buf is a valid out-buffer of its stated
    // length.
    let rc = unsafe { libc::ptsname_r(fd, buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return None;
    }
    let cstr = unsafe { std::ffi::CStr::from_ptr(buf.as_ptr() as *const libc::c_char) };
    cstr.to_str().ok().map(str::to_string)
}

#[cfg(not(target_os = "linux"))]
fn pty_name(_master: &(dyn MasterPty + Send)) -> Option<String> {
    None
}

pub(crate) fn exe_dir() -> Option<String> {
    std::env::current_exe()
        .ok()?
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(scanner: &mut EscapeScanner, input: &[u8]) -> (Vec<u8>, Vec<(u16, u16)>) {
        let mut data = Vec::new();
        let mut resizes = Vec::new();
        for item in scanner.feed(input) {
            match item {
                ScanItem::Data(d) => data.extend_from_slice(&d),
                ScanItem::Resize { rows, cols } => resizes.push((rows, cols)),
            }
        }
        (data, resizes)
    }

    #[test]
    fn plain_bytes_pass_through() {
        let mut scanner = EscapeScanner::new();
        let (data, resizes) = feed_all(&mut scanner, b"hello world");
        assert_eq!(data, b"hello world");
        assert!(resizes.is_empty());
    }

    #[test]
    fn resize_sequence_is_consumed_not_forwarded() {
        let mut scanner = EscapeScanner::new();
        let (data, resizes) = feed_all(&mut scanner, b"ab\x1b[8;40;120tcd");
        assert_eq!(data, b"abcd");
        assert_eq!(resizes, vec![(40, 120)]);
    }

    #[test]
    fn other_csi_sequences_pass_through() {
        let mut scanner = EscapeScanner::new();
        let input = b"\x1b[31mred\x1b[0m";
        let (data, resizes) = feed_all(&mut scanner, input);
        assert_eq!(data, input);
        assert!(resizes.is_empty());
    }

    #[test]
    fn non_resize_t_sequence_passes_through() {
        let mut scanner = EscapeScanner::new();
        let input = b"\x1b[9;1;2t";
        let (data, resizes) = feed_all(&mut scanner, input);
        assert_eq!(data, input);
        assert!(resizes.is_empty());
    }

    #[test]
    fn partial_sequence_defers_until_completed() {
        let mut scanner = EscapeScanner::new();
        let (data, resizes) = feed_all(&mut scanner, b"xy\x1b[8;4");
        assert_eq!(data, b"xy");
        assert!(resizes.is_empty());

        let (data, resizes) = feed_all(&mut scanner, b"0;120tz");
        assert_eq!(data, b"z");
        assert_eq!(resizes, vec![(40, 120)]);
    }

    #[test]
    fn lone_esc_at_tail_defers() {
        let mut scanner = EscapeScanner::new();
        let (data, _) = feed_all(&mut scanner, b"abc\x1b");
        assert_eq!(data, b"abc");
        let (data, _) = feed_all(&mut scanner, b"[2J");
        assert_eq!(data, b"\x1b[2J");
    }

    #[test]
    fn esc_not_followed_by_bracket_is_data() {
        let mut scanner = EscapeScanner::new();
        let (data, resizes) = feed_all(&mut scanner, b"\x1bXabc");
        assert_eq!(data, b"\x1bXabc");
        assert!(resizes.is_empty());
    }

    #[test]
    fn double_resize_yields_two_events() {
        let mut scanner = EscapeScanner::new();
        let (data, resizes) = feed_all(&mut scanner, b"\x1b[8;40;120t\x1b[8;40;120t");
        assert!(data.is_empty());
        assert_eq!(resizes, vec![(40, 120), (40, 120)]);
    }

    #[test]
    fn overlong_pending_escape_is_flushed_as_data() {
        let mut scanner = EscapeScanner::new();
        let mut input = b"\x1b[".to_vec();
        input.extend(std::iter::repeat(b'1').take(MAX_PENDING_ESCAPE + 8));
        let (data, resizes) = feed_all(&mut scanner, &input);
        assert!(resizes.is_empty());
        // Bytes are passed through rather than buffered forever.
        assert!(!data.is_empty());
    }

    #[test]
    fn flush_returns_held_bytes() {
        let mut scanner = EscapeScanner::new();
        let _ = scanner.feed(b"\x1b[8;4");
        assert_eq!(scanner.flush(), b"\x1b[8;4");
        assert!(scanner.flush().is_empty());
    }

    #[test]
    fn resize_with_extra_params_matches_prefix() {
        // Parameters beyond rows;cols are ignored, mirroring the loose
        // `8;rows;cols...` match.
        let mut scanner = EscapeScanner::new();
        let (_, resizes) = feed_all(&mut scanner, b"\x1b[8;50;100;5t");
        assert_eq!(resizes, vec![(50, 100)]);
    }
}
