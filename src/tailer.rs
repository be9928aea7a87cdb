/// Tails the capture process's snapshot feed (one JSON object per line).
///
/// Uses the `notify` crate (OS-level ReadDirectoryChangesWatcher on Windows)
/// to detect file modifications, then reads from the last known byte offset.
///
/// Only complete lines are consumed: a line the capture process is still
/// writing stays in the file until its newline lands.
///
/// Rotation handling: the capture process truncates or recreates the feed
/// between matches. We detect this by comparing the current file size to our
/// last known position; if the file shrank, we restart from byte 0.
///
/// Snapshots already in the file at startup are history, not live state, so
/// tailing starts at the current end of file.
use anyhow::Result;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;
use tokio::sync::mpsc::Sender;

/// How often an idle tailer checks whether its receiver is still there.
const IDLE_CHECK: Duration = Duration::from_millis(250);

pub struct TailerState {
    path:     PathBuf,
    position: u64,
}

impl TailerState {
    fn new(path: PathBuf) -> Self {
        Self { path, position: 0 }
    }

    /// Start at the current end of file (or 0 if it does not exist yet).
    fn at_end(path: PathBuf) -> Self {
        let position = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        Self { path, position }
    }

    /// Forward every complete new line. Returns `false` once the receiver is gone.
    fn read_new_lines(&mut self, tx: &Sender<String>) -> Result<bool> {
        let metadata = match std::fs::metadata(&self.path) {
            Ok(m) => m,
            Err(_) => return Ok(true), // File doesn't exist yet: wait
        };
        let file_len = metadata.len();

        // Rotation: file shrank since our last read
        if file_len < self.position {
            tracing::info!("Snapshot feed rotation detected — restarting from byte 0");
            self.position = 0;
        }

        if file_len == self.position {
            return Ok(true); // No new data
        }

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.position))?;
        let mut buf = Vec::with_capacity((file_len - self.position) as usize);
        file.take(file_len - self.position).read_to_end(&mut buf)?;

        // Consume through the last newline; a trailing partial line is re-read later.
        let Some(last_nl) = buf.iter().rposition(|b| *b == b'\n') else {
            return Ok(true);
        };
        self.position += last_nl as u64 + 1;

        for raw in buf[..last_nl].split(|b| *b == b'\n') {
            let line = String::from_utf8_lossy(raw);
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            if tx.blocking_send(line.to_owned()).is_err() {
                return Ok(false); // Receiver gone: pipeline shutting down
            }
        }
        Ok(true)
    }
}

fn tail_blocking(feed_path: PathBuf, tx: Sender<String>) -> Result<()> {
    let watch_dir = feed_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(std::path::Path::new("."))
        .to_path_buf();
    std::fs::create_dir_all(&watch_dir)?;

    let (fs_tx, fs_rx) = std_mpsc::channel::<notify::Result<Event>>();

    // notify::Config with a small poll interval as fallback
    let config = notify::Config::default()
        .with_poll_interval(Duration::from_millis(500));

    let mut watcher = RecommendedWatcher::new(fs_tx, config)?;
    watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;

    let mut state = TailerState::at_end(feed_path.clone());
    tracing::info!("Tailing {:?} from byte {}", feed_path, state.position);

    loop {
        match fs_rx.recv_timeout(IDLE_CHECK) {
            Ok(Ok(Event { kind: EventKind::Modify(_) | EventKind::Create(_), paths, .. })) => {
                if paths.iter().any(|p| p.file_name() == feed_path.file_name()) {
                    match state.read_new_lines(&tx) {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => tracing::warn!("Tailer read error: {}", e),
                    }
                }
            }
            Ok(Ok(_)) => {} // Delete / access events: ignore
            Ok(Err(e)) => tracing::error!("Watcher error: {}", e),
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                if tx.is_closed() {
                    tracing::info!("Snapshot consumer gone — tailer exiting");
                    break;
                }
            }
            Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                tracing::warn!("Watcher channel closed — tailer exiting");
                break;
            }
        }
    }
    Ok(())
}

/// Tail `feed_path` on a blocking worker until the receiver goes away.
pub async fn run(feed_path: PathBuf, tx: Sender<String>) -> Result<()> {
    tracing::info!("Tailer starting: {:?}", feed_path);
    tokio::task::spawn_blocking(move || tail_blocking(feed_path, tx)).await?
}
