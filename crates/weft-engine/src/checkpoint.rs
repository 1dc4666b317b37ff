use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use weft_core::checkpoint::{Checkpoint, RunSummary};
use weft_core::error::{Result, WeftError};
use weft_core::traits::CheckpointStore;
use weft_core::types::{RunId, RunStatus, StepStatus};

const COLUMNS: &str = "run_id, workflow_id, stage, status, attempt, input_json, output_json, \
                       error, tokens, cost, duration_ms, timestamp, state_json, run_status";

/// Append-only checkpoint store backed by SQLite.
///
/// Every step outcome is a new row; the run snapshot lives in a JSON column
/// so resume only ever needs the latest row of a run.
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointStore {
    /// Open or create the checkpoint database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| WeftError::Database(format!("Failed to open checkpoint store: {}", e)))?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| WeftError::Database(format!("Failed to open checkpoint store: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS checkpoints (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 run_id TEXT NOT NULL,
                 workflow_id TEXT NOT NULL,
                 stage TEXT NOT NULL,
                 status TEXT NOT NULL,
                 attempt INTEGER NOT NULL DEFAULT 0,
                 input_json TEXT NOT NULL DEFAULT 'null',
                 output_json TEXT,
                 error TEXT,
                 tokens INTEGER NOT NULL DEFAULT 0,
                 cost REAL NOT NULL DEFAULT 0,
                 duration_ms INTEGER NOT NULL DEFAULT 0,
                 timestamp TEXT NOT NULL,
                 state_json TEXT NOT NULL,
                 run_status TEXT
             );

             CREATE INDEX IF NOT EXISTS idx_cp_run
                 ON checkpoints(run_id, id DESC);",
        )
        .map_err(|e| WeftError::Database(format!("Failed to initialize checkpoint schema: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| WeftError::Database(e.to_string()))
    }
}

/// Raw row; JSON columns are decoded after the statement finishes.
struct CheckpointRow {
    run_id: String,
    workflow_id: String,
    stage: String,
    status: String,
    attempt: i64,
    input_json: String,
    output_json: Option<String>,
    error: Option<String>,
    tokens: i64,
    cost: f64,
    duration_ms: i64,
    timestamp: String,
    state_json: String,
    run_status: Option<String>,
}

impl CheckpointRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            workflow_id: row.get(1)?,
            stage: row.get(2)?,
            status: row.get(3)?,
            attempt: row.get(4)?,
            input_json: row.get(5)?,
            output_json: row.get(6)?,
            error: row.get(7)?,
            tokens: row.get(8)?,
            cost: row.get(9)?,
            duration_ms: row.get(10)?,
            timestamp: row.get(11)?,
            state_json: row.get(12)?,
            run_status: row.get(13)?,
        })
    }

    fn decode(self) -> Result<Checkpoint> {
        let status = StepStatus::parse(&self.status).ok_or_else(|| {
            WeftError::Database(format!("unknown step status in checkpoint: {}", self.status))
        })?;
        let output = match self.output_json {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        };
        Ok(Checkpoint {
            run_id: RunId::from_string(&self.run_id),
            workflow_id: self.workflow_id,
            stage: self.stage,
            status,
            attempt: self.attempt as u32,
            input: serde_json::from_str(&self.input_json)?,
            output,
            error: self.error,
            tokens: self.tokens as u64,
            cost: self.cost,
            duration_ms: self.duration_ms as u64,
            timestamp: parse_timestamp(&self.timestamp),
            state: serde_json::from_str(&self.state_json)?,
            run_status: self.run_status.as_deref().and_then(RunStatus::parse),
        })
    }
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl CheckpointStore for SqliteCheckpointStore {
    fn save(&self, cp: &Checkpoint) -> Result<()> {
        let state_json = serde_json::to_string(&cp.state)?;
        let input_json = serde_json::to_string(&cp.input)?;
        let output_json = cp.output.as_ref().map(serde_json::to_string).transpose()?;

        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO checkpoints ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                COLUMNS
            ),
            params![
                cp.run_id.as_str(),
                cp.workflow_id,
                cp.stage,
                cp.status.as_str(),
                cp.attempt as i64,
                input_json,
                output_json,
                cp.error,
                cp.tokens as i64,
                cp.cost,
                cp.duration_ms as i64,
                cp.timestamp.to_rfc3339(),
                state_json,
                cp.run_status.map(|s| s.as_str()),
            ],
        )
        .map_err(|e| WeftError::CheckpointWrite(format!("Failed to save checkpoint: {}", e)))?;
        Ok(())
    }

    fn load_latest(&self, run_id: &RunId) -> Result<Option<Checkpoint>> {
        let row = {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM checkpoints WHERE run_id = ?1 ORDER BY id DESC LIMIT 1",
                    COLUMNS
                ))
                .map_err(|e| WeftError::Database(format!("Failed to prepare query: {}", e)))?;
            stmt.query_row(params![run_id.as_str()], CheckpointRow::from_row)
                .ok()
        };
        row.map(CheckpointRow::decode).transpose()
    }

    fn list_resumable(&self) -> Result<Vec<RunSummary>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT c.run_id, c.workflow_id, c.stage, c.timestamp, c.run_status,
                        (SELECT COUNT(*) FROM checkpoints n WHERE n.run_id = c.run_id)
                 FROM checkpoints c
                 WHERE c.id = (SELECT MAX(id) FROM checkpoints m WHERE m.run_id = c.run_id)
                   AND (c.run_status IS NULL OR c.run_status != 'success')
                 ORDER BY c.id DESC",
            )
            .map_err(|e| WeftError::Database(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map([], |row| {
                let ts: String = row.get(3)?;
                let status: Option<String> = row.get(4)?;
                Ok(RunSummary {
                    run_id: RunId::from_string(&row.get::<_, String>(0)?),
                    workflow_id: row.get(1)?,
                    last_stage: row.get(2)?,
                    updated_at: parse_timestamp(&ts),
                    run_status: status.as_deref().and_then(RunStatus::parse),
                    checkpoints: row.get::<_, i64>(5)? as usize,
                })
            })
            .map_err(|e| WeftError::Database(format!("Failed to list runs: {}", e)))?;

        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    fn load_run(&self, run_id: &RunId) -> Result<Vec<Checkpoint>> {
        let rows: Vec<CheckpointRow> = {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM checkpoints WHERE run_id = ?1 ORDER BY id ASC",
                    COLUMNS
                ))
                .map_err(|e| WeftError::Database(format!("Failed to prepare query: {}", e)))?;
            let rows = stmt
                .query_map(params![run_id.as_str()], CheckpointRow::from_row)
                .map_err(|e| WeftError::Database(format!("Failed to load run: {}", e)))?;
            rows.filter_map(|r| r.ok()).collect()
        };
        rows.into_iter().map(CheckpointRow::decode).collect()
    }
}

/// Checkpoints kept in process memory. Used for tests and for runs with
/// durability turned off.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<Vec<Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.checkpoints.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<Checkpoint>>> {
        self.checkpoints
            .lock()
            .map_err(|e| WeftError::Database(e.to_string()))
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.lock()?.push(checkpoint.clone());
        Ok(())
    }

    fn load_latest(&self, run_id: &RunId) -> Result<Option<Checkpoint>> {
        Ok(self
            .lock()?
            .iter()
            .rev()
            .find(|c| &c.run_id == run_id)
            .cloned())
    }

    fn list_resumable(&self) -> Result<Vec<RunSummary>> {
        let all = self.lock()?;
        let mut counts: HashMap<&RunId, usize> = HashMap::new();
        for cp in all.iter() {
            *counts.entry(&cp.run_id).or_default() += 1;
        }
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for cp in all.iter().rev() {
            if !seen.insert(&cp.run_id) {
                continue;
            }
            let summary = RunSummary {
                run_id: cp.run_id.clone(),
                workflow_id: cp.workflow_id.clone(),
                last_stage: cp.stage.clone(),
                checkpoints: counts.get(&cp.run_id).copied().unwrap_or(0),
                updated_at: cp.timestamp,
                run_status: cp.run_status,
            };
            if summary.is_resumable() {
                out.push(summary);
            }
        }
        Ok(out)
    }

    fn load_run(&self, run_id: &RunId) -> Result<Vec<Checkpoint>> {
        Ok(self
            .lock()?
            .iter()
            .filter(|c| &c.run_id == run_id)
            .cloned()
            .collect())
    }
}
