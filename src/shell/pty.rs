//! PTY-backed terminal running the user's real shell.
//!
//! The shell is started without `--norc`/`--noprofile` style flags so the
//! user's aliases, functions and rc files stay in effect. A reader thread
//! splits PTY output into cleaned lines and hands them over a channel, which
//! gives the session loop a non-blocking `poll_line`.

use std::io::{ErrorKind, Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tracing::{debug, info};

use super::ansi::strip_ansi_codes;
use super::session::{LinePoll, Spawner, Terminal};

const PTY_READ_BUFFER: usize = 16384;
/// Bytes held back waiting for a newline before they are flushed as a line.
const MAX_PENDING_LINE: usize = PTY_READ_BUFFER * 64;

/// What the reader thread hands to the terminal.
#[derive(Debug, PartialEq, Eq)]
enum ReaderEvent {
    Line(String),
    /// Bytes arrived but no line is complete yet.
    Partial,
}

/// Spawns PTY terminals for a given shell binary.
#[derive(Debug, Clone)]
pub struct PtySpawner {
    shell: String,
    cols: u16,
    rows: u16,
}

impl PtySpawner {
    /// Create a spawner for `shell`.
    ///
    /// # Arguments
    /// * `shell` - Path or name of the shell binary; rc files are honoured
    /// * `cols`, `rows` - Fixed PTY window size
    pub fn new(shell: impl Into<String>, cols: u16, rows: u16) -> Self {
        Self {
            shell: shell.into(),
            cols,
            rows,
        }
    }
}

impl Spawner for PtySpawner {
    fn spawn(&self) -> Result<Box<dyn Terminal>> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: self.rows,
                cols: self.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("Failed to open PTY")?;

        let mut cmd = CommandBuilder::new(&self.shell);
        // Discourage colour and pagers; output is consumed line by line.
        cmd.env("TERM", "dumb");
        cmd.env("PAGER", "cat");
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("Failed to spawn shell {}", self.shell))?;
        // Drop slave side in parent process so EOF is observed when the shell exits.
        drop(pair.slave);

        let reader = pair.master.try_clone_reader().context("Failed to clone PTY reader")?;
        let writer = pair.master.take_writer().context("Failed to take PTY writer")?;

        let (line_tx, line_rx) = mpsc::channel::<ReaderEvent>();
        std::thread::Builder::new()
            .name("pty-reader".into())
            .spawn(move || pump_lines(reader, line_tx))
            .context("Failed to start PTY reader thread")?;

        info!("Spawned shell {} (pid {:?})", self.shell, child.process_id());

        Ok(Box::new(PtyTerminal {
            _master: pair.master,
            writer,
            child,
            lines: line_rx,
            terminated: false,
        }))
    }
}

pub struct PtyTerminal {
    // Keeps the PTY open; dropping it hangs up the shell.
    _master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
    lines: Receiver<ReaderEvent>,
    terminated: bool,
}

impl Terminal for PtyTerminal {
    fn send(&mut self, text: &str) -> Result<()> {
        self.writer
            .write_all(text.as_bytes())
            .context("Failed to write command to PTY")?;
        self.writer.flush().context("Failed to flush PTY writer")?;
        Ok(())
    }

    fn poll_line(&mut self, wait: Duration) -> LinePoll {
        match self.lines.recv_timeout(wait) {
            Ok(ReaderEvent::Line(line)) => LinePoll::Line(line),
            Ok(ReaderEvent::Partial) => LinePoll::Activity,
            Err(RecvTimeoutError::Timeout) => LinePoll::Pending,
            Err(RecvTimeoutError::Disconnected) => LinePoll::Closed,
        }
    }

    fn interrupt(&mut self) -> Result<()> {
        // ETX, what the tty driver turns into SIGINT for the foreground job.
        self.send("\x03")
    }

    fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        if let Err(e) = self.child.kill() {
            debug!("Ignoring failure to kill shell: {}", e);
        }
        if let Err(e) = self.child.wait() {
            debug!("Ignoring failure to reap shell: {}", e);
        }
    }
}

impl Drop for PtyTerminal {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Reader thread body: forward complete lines until EOF or a read error.
///
/// Only newly read bytes are scanned for `\n`. A line longer than
/// [`MAX_PENDING_LINE`] is flushed in pieces.
fn pump_lines(mut reader: Box<dyn Read + Send>, tx: Sender<ReaderEvent>) {
    let mut buf = [0u8; PTY_READ_BUFFER];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let mut scanned = pending.len();
                pending.extend_from_slice(&buf[..n]);

                let mut start = 0;
                while let Some(off) = pending[scanned..].iter().position(|b| *b == b'\n') {
                    let end = scanned + off + 1;
                    if tx.send(ReaderEvent::Line(clean_line(&pending[start..end]))).is_err() {
                        // Terminal dropped
                        return;
                    }
                    start = end;
                    scanned = end;
                }
                pending.drain(..start);

                if pending.len() >= MAX_PENDING_LINE {
                    let split = utf8_boundary(&pending);
                    let head: Vec<u8> = pending.drain(..split).collect();
                    if tx.send(ReaderEvent::Line(clean_line(&head))).is_err() {
                        return;
                    }
                } else if !pending.is_empty() && tx.send(ReaderEvent::Partial).is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                // EIO once the shell side is gone
                debug!("PTY read ended: {}", e);
                break;
            }
        }
    }

    if !pending.is_empty() && tx.send(ReaderEvent::Line(clean_line(&pending))).is_err() {
        debug!("Dropped trailing PTY output, terminal already closed");
    }
}

/// End of the longest prefix that does not cut a UTF-8 sequence in half.
fn utf8_boundary(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Err(e) if e.error_len().is_none() && e.valid_up_to() > 0 => e.valid_up_to(),
        _ => bytes.len(),
    }
}

fn clean_line(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    strip_ansi_codes(text.trim_end_matches(['\r', '\n']))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn lines_of(events: impl IntoIterator<Item = ReaderEvent>) -> Vec<String> {
        events
            .into_iter()
            .filter_map(|ev| match ev {
                ReaderEvent::Line(line) => Some(line),
                ReaderEvent::Partial => None,
            })
            .collect()
    }

    #[test]
    fn test_pump_lines_splits_and_cleans() {
        let (tx, rx) = mpsc::channel();
        let input = b"\x1b[32mgreen\x1b[0m\r\nplain\r\npartial".to_vec();
        pump_lines(Box::new(Cursor::new(input)), tx);

        assert_eq!(lines_of(rx.iter()), vec!["green", "plain", "partial"]);
    }

    /// Hands out input in fixed-size reads, like a PTY under load.
    struct Chunked {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
    }

    impl Read for Chunked {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.chunk.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn test_partial_reads_report_activity() {
        let (tx, rx) = mpsc::channel();
        let reader = Chunked {
            data: b"abcdef\n".to_vec(),
            pos: 0,
            chunk: 3,
        };
        pump_lines(Box::new(reader), tx);

        let events: Vec<ReaderEvent> = rx.iter().collect();
        assert_eq!(
            events,
            vec![
                ReaderEvent::Partial,
                ReaderEvent::Partial,
                ReaderEvent::Line("abcdef".to_string()),
            ]
        );
    }

    #[test]
    fn test_long_line_flushed_in_capped_pieces() {
        let total = 8 * 1024 * 1024;
        let mut data = vec![b'x'; total];
        data.push(b'\n');
        let reader = Chunked {
            data,
            pos: 0,
            chunk: 4096,
        };
        let (tx, rx) = mpsc::channel();

        let started = std::time::Instant::now();
        pump_lines(Box::new(reader), tx);
        assert!(started.elapsed() < Duration::from_secs(10));

        let lines = lines_of(rx.iter());
        assert!(lines.len() >= total / MAX_PENDING_LINE);
        assert!(lines.iter().all(|l| l.len() <= MAX_PENDING_LINE + PTY_READ_BUFFER));
        assert_eq!(lines.iter().map(|l| l.len()).sum::<usize>(), total);
    }

    #[test]
    fn test_flush_does_not_split_multibyte_chars() {
        // 'é' is two bytes; an odd prefix forces a split inside one of them.
        let mut data = b"a".to_vec();
        for _ in 0..MAX_PENDING_LINE {
            data.extend_from_slice("é".as_bytes());
        }
        let reader = Chunked {
            data,
            pos: 0,
            chunk: PTY_READ_BUFFER,
        };
        let (tx, rx) = mpsc::channel();
        pump_lines(Box::new(reader), tx);

        let lines = lines_of(rx.iter());
        assert!(lines.len() > 1);
        assert!(lines.iter().all(|l| !l.contains('\u{FFFD}')));
    }

    #[test]
    fn test_real_shell_round_trip() {
        if !std::path::Path::new("/bin/sh").exists() {
            return;
        }
        let mut term = match PtySpawner::new("/bin/sh", 80, 24).spawn() {
            Ok(term) => term,
            // No PTY support in this environment
            Err(_) => return,
        };
        term.send("echo pty-ok\n").unwrap();

        let mut seen = false;
        for _ in 0..100 {
            match term.poll_line(Duration::from_millis(50)) {
                LinePoll::Line(line) if line.trim() == "pty-ok" => {
                    seen = true;
                    break;
                }
                LinePoll::Closed => break,
                _ => {}
            }
        }
        assert!(seen);
        term.terminate();
    }
}
