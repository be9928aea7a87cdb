/// SQLite session log.
///
/// Uses `rusqlite` with the `bundled` feature so SQLite is compiled in and no
/// system installation is required.
///
/// The writer runs on a dedicated `std::thread` (rusqlite::Connection is !Send
/// across await points) and receives commands via a bounded sync channel.
/// Callers hold a cheap `DbWriter` handle that is Clone + Send + Sync.
///
/// Per-cycle records go through `try_send`: the pipeline never waits on disk.
/// When the writer is backed up the record is dropped and reported as
/// `SinkError::Full`.
use crate::error::SinkError;
use crate::pipeline::{CycleRecord, ResultSink};
use crate::suggestion::Suggestion;
use anyhow::Result;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use tokio::sync::oneshot;

const SINK_NAME: &str = "session log";
const QUEUE_DEPTH: usize = 512;

// ---------------------------------------------------------------------------
// Commands sent to the writer thread
// ---------------------------------------------------------------------------

pub enum DbCommand {
    InsertSession {
        reply:      oneshot::Sender<Result<i64>>,
        started_at: u64,
        game:       String,
    },
    EndSession {
        session_id: i64,
        ended_at:   u64,
    },
    InsertCycle {
        session_id:    i64,
        timestamp_ms:  u64,
        in_combat:     bool,
        snapshot_json: String,
        entries:       Vec<Suggestion>,
    },
    /// Replies once every command queued before it has been applied.
    Flush {
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

// ---------------------------------------------------------------------------
// DbWriter: cheap handle, Clone + Send + Sync
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct DbWriter {
    tx: SyncSender<DbCommand>,
}

impl DbWriter {
    /// Insert a new session row; returns the auto-generated row id.
    pub async fn insert_session(&self, started_at: u64, game: String) -> Result<i64> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(DbCommand::InsertSession { reply: reply_tx, started_at, game })
            .map_err(|_| anyhow::anyhow!("DB writer channel closed"))?;
        reply_rx.await.map_err(|_| anyhow::anyhow!("DB reply channel closed"))?
    }

    /// Stamp the session's end time (fire-and-forget).
    pub fn end_session(&self, session_id: i64, ended_at: u64) {
        let _ = self.tx.send(DbCommand::EndSession { session_id, ended_at });
    }

    /// Queue one cycle without blocking.
    pub fn record_cycle(&self, session_id: i64, record: &CycleRecord) -> Result<(), SinkError> {
        let snapshot_json = serde_json::to_string(&*record.snapshot)
            .map_err(|e| SinkError::Io { sink: SINK_NAME, source: e.into() })?;

        let cmd = DbCommand::InsertCycle {
            session_id,
            timestamp_ms: record.snapshot.timestamp_ms,
            in_combat:    record.snapshot.in_combat,
            snapshot_json,
            entries:      record.result.entries.clone(),
        };
        self.tx.try_send(cmd).map_err(|e| match e {
            TrySendError::Full(_)         => SinkError::Full(SINK_NAME),
            TrySendError::Disconnected(_) => SinkError::Closed(SINK_NAME),
        })
    }

    pub async fn flush(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(DbCommand::Flush { reply: reply_tx })
            .map_err(|_| anyhow::anyhow!("DB writer channel closed"))?;
        reply_rx.await.map_err(|_| anyhow::anyhow!("DB reply channel closed"))
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(DbCommand::Shutdown);
    }
}

/// `ResultSink` bound to one session row.
pub struct SessionLogSink {
    writer:     DbWriter,
    session_id: i64,
}

impl SessionLogSink {
    pub fn new(writer: DbWriter, session_id: i64) -> Self {
        Self { writer, session_id }
    }
}

impl ResultSink for SessionLogSink {
    fn name(&self) -> &'static str {
        SINK_NAME
    }

    fn publish(&self, record: &CycleRecord) -> Result<(), SinkError> {
        self.writer.record_cycle(self.session_id, record)
    }
}

// ---------------------------------------------------------------------------
// spawn_db_writer: initialises SQLite and starts the writer thread
// ---------------------------------------------------------------------------

/// Initialise SQLite at `db_path`, apply the schema, and spawn the writer
/// thread. Returns a `DbWriter` handle that can be cloned freely.
pub fn spawn_db_writer(db_path: &Path) -> Result<DbWriter> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(db_path)?;
    apply_schema(&conn)?;

    let (tx, rx) = std::sync::mpsc::sync_channel::<DbCommand>(QUEUE_DEPTH);

    std::thread::spawn(move || db_writer_loop(rx, conn));

    tracing::info!("SQLite writer started at {:?}", db_path);
    Ok(DbWriter { tx })
}

fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch("
        PRAGMA journal_mode = WAL;
        PRAGMA foreign_keys = ON;
        PRAGMA synchronous   = NORMAL;

        CREATE TABLE IF NOT EXISTS sessions (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            started_at  INTEGER NOT NULL,
            ended_at    INTEGER,
            game        TEXT    NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS cycles (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id    INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            timestamp_ms  INTEGER NOT NULL,
            in_combat     INTEGER NOT NULL,
            snapshot_json TEXT    NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cycle_suggestions (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            cycle_id        INTEGER NOT NULL REFERENCES cycles(id) ON DELETE CASCADE,
            rank            INTEGER NOT NULL,
            suggestion_id   TEXT    NOT NULL,
            text            TEXT    NOT NULL,
            priority        INTEGER NOT NULL,
            source          TEXT    NOT NULL,
            requires_combat INTEGER NOT NULL,
            produced_at     INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_cycles_session     ON cycles(session_id);
        CREATE INDEX IF NOT EXISTS idx_suggestions_cycle  ON cycle_suggestions(cycle_id);
        CREATE INDEX IF NOT EXISTS idx_suggestions_id     ON cycle_suggestions(suggestion_id);
    ")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Writer loop (runs on its own std::thread)
// ---------------------------------------------------------------------------

fn insert_cycle(
    conn:          &mut Connection,
    session_id:    i64,
    timestamp_ms:  u64,
    in_combat:     bool,
    snapshot_json: &str,
    entries:       &[Suggestion],
) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO cycles (session_id, timestamp_ms, in_combat, snapshot_json) VALUES (?1, ?2, ?3, ?4)",
        params![session_id, timestamp_ms, in_combat, snapshot_json],
    )?;
    let cycle_id = tx.last_insert_rowid();
    for (rank, s) in entries.iter().enumerate() {
        tx.execute(
            "INSERT INTO cycle_suggestions \
             (cycle_id, rank, suggestion_id, text, priority, source, requires_combat, produced_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                cycle_id,
                rank as i64,
                s.id,
                s.text,
                s.priority,
                s.source.as_str(),
                s.requires_combat,
                s.produced_at_ms
            ],
        )?;
    }
    tx.commit()
}

fn db_writer_loop(rx: Receiver<DbCommand>, mut conn: Connection) {
    while let Ok(cmd) = rx.recv() {
        match cmd {
            DbCommand::InsertSession { reply, started_at, game } => {
                let result = conn
                    .execute(
                        "INSERT INTO sessions (started_at, game) VALUES (?1, ?2)",
                        params![started_at, game],
                    )
                    .map(|_| conn.last_insert_rowid())
                    .map_err(anyhow::Error::from);
                let _ = reply.send(result);
            }

            DbCommand::EndSession { session_id, ended_at } => {
                if let Err(e) = conn.execute(
                    "UPDATE sessions SET ended_at = ?1 WHERE id = ?2",
                    params![ended_at, session_id],
                ) {
                    tracing::warn!("DB end_session error: {}", e);
                }
            }

            DbCommand::InsertCycle { session_id, timestamp_ms, in_combat, snapshot_json, entries } => {
                if let Err(e) = insert_cycle(&mut conn, session_id, timestamp_ms, in_combat, &snapshot_json, &entries) {
                    tracing::warn!("DB insert_cycle error: {}", e);
                }
            }

            DbCommand::Flush { reply } => {
                let _ = reply.send(());
            }

            DbCommand::Shutdown => break,
        }
    }
    tracing::debug!("SQLite writer exiting");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::RankedResult;
    use crate::snapshot::Snapshot;
    use crate::suggestion::Source;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn record(ts: u64) -> CycleRecord {
        CycleRecord {
            snapshot: Arc::new(Snapshot { timestamp_ms: ts, in_combat: true, ..Default::default() }),
            result:   RankedResult {
                timestamp_ms: ts,
                entries: vec![
                    Suggestion::new("use_ability_q", "Use your Q ability", 80, Source::Rule, true, ts),
                    Suggestion::new("vision", "Vision: hold angle", 40, Source::Vision, false, ts),
                ],
            },
        }
    }

    #[tokio::test]
    async fn logs_cycles_with_ranked_suggestions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sessions.sqlite");
        let writer = spawn_db_writer(&path).unwrap();

        let session = writer.insert_session(1_000, "valorant".into()).await.unwrap();
        let sink = SessionLogSink::new(writer.clone(), session);
        sink.publish(&record(1_100)).unwrap();
        sink.publish(&record(1_200)).unwrap();
        writer.end_session(session, 2_000);
        writer.flush().await.unwrap();

        let conn = Connection::open(&path).unwrap();
        let cycles: i64 = conn
            .query_row("SELECT COUNT(*) FROM cycles WHERE session_id = ?1", [session], |r| r.get(0))
            .unwrap();
        assert_eq!(cycles, 2);

        let (id, source, rank): (String, String, i64) = conn
            .query_row(
                "SELECT suggestion_id, source, rank FROM cycle_suggestions ORDER BY id LIMIT 1 OFFSET 1",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!((id.as_str(), source.as_str(), rank), ("vision", "vision", 1));

        let ended: Option<i64> = conn
            .query_row("SELECT ended_at FROM sessions WHERE id = ?1", [session], |r| r.get(0))
            .unwrap();
        assert_eq!(ended, Some(2_000));

        let snapshot_json: String = conn
            .query_row("SELECT snapshot_json FROM cycles ORDER BY id LIMIT 1", [], |r| r.get(0))
            .unwrap();
        assert!(snapshot_json.contains("\"in_combat\":true"));
        writer.shutdown();
    }

    #[test]
    fn closed_writer_reports_closed() {
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        drop(rx);
        let writer = DbWriter { tx };
        assert!(matches!(writer.record_cycle(1, &record(1)), Err(SinkError::Closed(_))));
    }

    #[test]
    fn backed_up_writer_reports_full() {
        let (tx, _rx) = std::sync::mpsc::sync_channel(1);
        let writer = DbWriter { tx };
        writer.record_cycle(1, &record(1)).unwrap();
        assert!(matches!(writer.record_cycle(1, &record(2)), Err(SinkError::Full(_))));
    }
}
