/// Overlay bridge: hands the latest ranked result to the overlay process.
///
/// The overlay polls a single JSON file. Every publish replaces the whole
/// file (write to a sibling temp file, then rename) so the reader never sees
/// a half-written set and never sees entries from an older cycle mixed in.
///
/// The pipeline side only does a `try_send` into a small channel; the file
/// I/O happens on the overlay writer task. If the writer falls behind, the
/// newest frame wins and older ones are dropped.
use crate::aggregator::RankedResult;
use crate::error::SinkError;
use crate::pipeline::{CycleRecord, ResultSink};
use crate::suggestion::Source;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};

const SINK_NAME: &str = "overlay";

// ---------------------------------------------------------------------------
// Payload types (serialised as JSON for the overlay process)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlayEntry {
    pub text:     String,
    pub priority: u8,
    pub source:   Source,
    /// Overlay plays its alert sound for critical entries.
    pub critical: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlayFrame {
    pub timestamp_ms: u64,
    pub in_combat:    bool,
    pub entries:      Vec<OverlayEntry>,
}

impl OverlayFrame {
    pub fn from_result(result: &RankedResult, in_combat: bool, critical_priority: u8) -> Self {
        Self {
            timestamp_ms: result.timestamp_ms,
            in_combat,
            entries: result
                .entries
                .iter()
                .map(|s| OverlayEntry {
                    text:     s.text.clone(),
                    priority: s.priority,
                    source:   s.source,
                    critical: s.priority >= critical_priority,
                })
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sink handle (pipeline side)
// ---------------------------------------------------------------------------

pub struct OverlaySink {
    tx:                Sender<OverlayFrame>,
    critical_priority: u8,
}

/// Create the sink and the receiver its writer task drains.
pub fn channel(critical_priority: u8, capacity: usize) -> (OverlaySink, Receiver<OverlayFrame>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (OverlaySink { tx, critical_priority }, rx)
}

impl ResultSink for OverlaySink {
    fn name(&self) -> &'static str {
        SINK_NAME
    }

    fn publish(&self, record: &CycleRecord) -> Result<(), SinkError> {
        let frame = OverlayFrame::from_result(&record.result, record.snapshot.in_combat, self.critical_priority);
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_)   => SinkError::Full(SINK_NAME),
            TrySendError::Closed(_) => SinkError::Closed(SINK_NAME),
        })
    }

    fn skip_unchanged(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Writer task
// ---------------------------------------------------------------------------

/// Replace `path` with `frame` in one rename.
pub async fn write_atomic(path: &Path, frame: &OverlayFrame) -> Result<(), SinkError> {
    let io = |source: std::io::Error| SinkError::Io { sink: SINK_NAME, source };

    let body = serde_json::to_vec_pretty(frame).map_err(|e| io(e.into()))?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, body).await.map_err(io)?;
    tokio::fs::rename(&tmp, path).await.map_err(io)?;
    Ok(())
}

pub async fn run(mut rx: Receiver<OverlayFrame>, path: PathBuf) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tracing::info!("Overlay output → {}", path.display());

    while let Some(mut frame) = rx.recv().await {
        // Only the newest frame matters.
        while let Ok(newer) = rx.try_recv() {
            frame = newer;
        }
        if let Err(e) = write_atomic(&path, &frame).await {
            tracing::warn!("{}", e);
        }
    }

    tracing::info!("Overlay channel closed — writer exiting");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Snapshot;
    use crate::suggestion::Suggestion;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn record(entries: Vec<Suggestion>) -> CycleRecord {
        CycleRecord {
            snapshot: Arc::new(Snapshot { timestamp_ms: 10, in_combat: true, ..Default::default() }),
            result:   RankedResult { timestamp_ms: 10, entries },
        }
    }

    #[test]
    fn marks_critical_entries() {
        let rec = record(vec![
            Suggestion::new("q", "Use Q", 80, Source::Rule, true, 10),
            Suggestion::new("v", "Vision: peek", 40, Source::Vision, false, 10),
        ]);
        let frame = OverlayFrame::from_result(&rec.result, true, 80);
        assert!(frame.entries[0].critical);
        assert!(!frame.entries[1].critical);
        assert_eq!(frame.entries[1].source, Source::Vision);
    }

    #[tokio::test]
    async fn full_channel_reports_full_then_closed() {
        let (sink, rx) = channel(80, 1);
        let rec = record(vec![]);
        sink.publish(&rec).unwrap();
        assert!(matches!(sink.publish(&rec), Err(SinkError::Full("overlay"))));
        drop(rx);
        assert!(matches!(sink.publish(&rec), Err(SinkError::Closed("overlay"))));
    }

    #[tokio::test]
    async fn writer_replaces_file_with_latest_frame() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("overlay").join("overlay.json");
        let (sink, rx) = channel(80, 4);

        sink.publish(&record(vec![Suggestion::new("a", "Old tip", 60, Source::Rule, false, 1)])).unwrap();
        sink.publish(&record(vec![Suggestion::new("b", "New tip", 90, Source::Rule, false, 2)])).unwrap();
        drop(sink);

        run(rx, path.clone()).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let frame: OverlayFrame = serde_json::from_str(&raw).unwrap();
        assert_eq!(frame.entries.len(), 1);
        assert_eq!(frame.entries[0].text, "New tip");
        assert!(frame.entries[0].critical);
        assert!(!path.with_extension("json.tmp").exists());
    }
}
