//! SqliteCaptureStore - 本番用の永続ストア
//!
//! # 実装詳細
//! - 1 テーブル `pending_captures`（主キー id）+ task / status / timestamp / assign の索引
//! - rusqlite は同期 API なので、各操作は spawn_blocking で実行
//! - 1 操作 = 1 トランザクション
//! - 開くだけでは既存レコードを書き換えない
//!
//! # 送信の所有者
//! `<db>-owner` という小さな SQLite ファイルを `locking_mode = EXCLUSIVE` で
//! 書き込んだ接続が所有者。ロックはその接続（= ストアのハンドル）が閉じるまで、
//! またはプロセスが死ぬまで保持される。`claim_drain` は所有者になれたときだけ
//! `syncing` を `failed` に戻す。所有者でなければ `None` を返し、何も書かない。

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior, params};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::domain::{
    AssignId, Blob, CaptureError, CaptureId, CaptureStatus, PendingCapture, StorageState, TaskId,
};
use crate::ports::{
    CaptureStore, Clock, INTERRUPTED_ERROR, IdGenerator, StoreLimits, SystemClock, UlidGenerator,
    retention_cutoff,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS pending_captures (
    id          TEXT PRIMARY KEY,
    task_id     TEXT NOT NULL,
    assign_id   TEXT NOT NULL,
    blob        BLOB NOT NULL,
    size        INTEGER NOT NULL,
    mime_type   TEXT NOT NULL,
    filename    TEXT NOT NULL,
    timestamp   INTEGER NOT NULL,
    status      TEXT NOT NULL CHECK (status IN ('pending', 'syncing', 'failed')),
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error  TEXT,
    stage       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_pending_captures_task ON pending_captures(task_id);
CREATE INDEX IF NOT EXISTS idx_pending_captures_status ON pending_captures(status);
CREATE INDEX IF NOT EXISTS idx_pending_captures_timestamp ON pending_captures(timestamp);
CREATE INDEX IF NOT EXISTS idx_pending_captures_assign ON pending_captures(assign_id);
";

const COLUMNS: &str =
    "id, task_id, assign_id, blob, mime_type, filename, timestamp, status, retry_count, last_error, stage";

const OWNER_SCHEMA: &str =
    "CREATE TABLE IF NOT EXISTS store_owner (pid INTEGER NOT NULL, since_ms INTEGER NOT NULL)";

#[derive(Debug, Clone)]
enum Location {
    File(PathBuf),
    Memory,
}

pub struct SqliteCaptureStore {
    location: Location,
    conn: Arc<Mutex<Option<Connection>>>,
    /// Open while this handle owns uploads; closing it releases the lock.
    owner: Arc<Mutex<Option<Connection>>>,
    limits: StoreLimits,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl SqliteCaptureStore {
    /// Store backed by the database file at `path` (created on initialize).
    pub fn open(path: impl AsRef<Path>, limits: StoreLimits) -> Self {
        Self::build(
            Location::File(path.as_ref().to_path_buf()),
            limits,
            Arc::new(SystemClock),
        )
    }

    /// Private in-memory database; same SQL, no durability.
    pub fn in_memory(limits: StoreLimits) -> Self {
        Self::build(Location::Memory, limits, Arc::new(SystemClock))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.ids = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        self.clock = clock;
        self
    }

    fn build(location: Location, limits: StoreLimits, clock: Arc<dyn Clock>) -> Self {
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        Self {
            location,
            conn: Arc::new(Mutex::new(None)),
            owner: Arc::new(Mutex::new(None)),
            limits,
            clock,
            ids,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.location {
            Location::File(p) => Some(p),
            Location::Memory => None,
        }
    }

    fn connect(location: &Location) -> Result<Connection, CaptureError> {
        let conn = match location {
            Location::File(path) => {
                if let Some(parent) = path.parent()
                    && !parent.as_os_str().is_empty()
                {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        CaptureError::StorageUnavailable(format!(
                            "create {}: {e}",
                            parent.display()
                        ))
                    })?;
                }
                Connection::open(path).map_err(|e| {
                    CaptureError::StorageUnavailable(format!("open {}: {e}", path.display()))
                })?
            }
            Location::Memory => Connection::open_in_memory()
                .map_err(|e| CaptureError::StorageUnavailable(e.to_string()))?,
        };
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))
            .map_err(|e| CaptureError::StorageUnavailable(e.to_string()))?;
        conn.pragma_update(None, "synchronous", "FULL")
            .map_err(|e| CaptureError::StorageUnavailable(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| CaptureError::StorageUnavailable(e.to_string()))?;
        Ok(conn)
    }

    /// Take (or confirm) upload ownership. A database in memory is private
    /// to this handle and always owned.
    async fn hold_ownership(&self) -> Result<bool, CaptureError> {
        let Location::File(path) = &self.location else {
            return Ok(true);
        };
        self.initialize().await?;
        let lock_path = owner_lock_path(path);
        let owner = Arc::clone(&self.owner);
        let now_ms = self.clock.now_millis();
        tokio::task::spawn_blocking(move || {
            let mut guard = owner
                .lock()
                .map_err(|_| CaptureError::Transaction("owner lock poisoned".into()))?;
            if guard.is_some() {
                return Ok(true);
            }
            match take_ownership(&lock_path, now_ms)? {
                Some(conn) => {
                    info!(lock = %lock_path.display(), "upload ownership taken");
                    *guard = Some(conn);
                    Ok(true)
                }
                None => {
                    debug!(lock = %lock_path.display(), "capture store is owned by another handle");
                    Ok(false)
                }
            }
        })
        .await
        .map_err(|e| CaptureError::Transaction(format!("store task failed: {e}")))?
    }

    /// Run `op` against the open connection on the blocking pool.
    async fn with_conn<T, F>(&self, op: F) -> Result<T, CaptureError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, CaptureError> + Send + 'static,
    {
        self.initialize().await?;
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| CaptureError::Transaction("connection lock poisoned".into()))?;
            let conn = guard
                .as_mut()
                .ok_or_else(|| CaptureError::StorageUnavailable("store is not open".into()))?;
            op(conn)
        })
        .await
        .map_err(|e| CaptureError::Transaction(format!("store task failed: {e}")))?
    }
}

fn owner_lock_path(db: &Path) -> PathBuf {
    let mut raw = db.as_os_str().to_owned();
    raw.push("-owner");
    PathBuf::from(raw)
}

/// Open the owner file and try to hold its exclusive lock. `Ok(None)` when
/// another connection already holds it.
fn take_ownership(path: &Path, now_ms: i64) -> Result<Option<Connection>, CaptureError> {
    let conn = Connection::open(path).map_err(|e| {
        CaptureError::StorageUnavailable(format!("open {}: {e}", path.display()))
    })?;
    match write_owner_row(&conn, now_ms) {
        Ok(()) => Ok(Some(conn)),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            Ok(None)
        }
        Err(e) => Err(CaptureError::StorageUnavailable(format!(
            "lock {}: {e}",
            path.display()
        ))),
    }
}

/// In EXCLUSIVE locking mode the first write takes a lock that is kept until
/// the connection closes.
fn write_owner_row(conn: &Connection, now_ms: i64) -> rusqlite::Result<()> {
    conn.busy_timeout(Duration::ZERO)?;
    conn.pragma_update_and_check(None, "locking_mode", "EXCLUSIVE", |_| Ok(()))?;
    conn.execute_batch(OWNER_SCHEMA)?;
    conn.execute("DELETE FROM store_owner", [])?;
    conn.execute(
        "INSERT INTO store_owner (pid, since_ms) VALUES (?1, ?2)",
        params![std::process::id(), now_ms],
    )?;
    Ok(())
}

/// A `syncing` row at drain start was left by an attempt that never
/// finished. Count it as a failed attempt so the retry path picks it up.
fn recover_interrupted(conn: &Connection) -> Result<usize, CaptureError> {
    let n = conn.execute(
        "UPDATE pending_captures
         SET status = 'failed', retry_count = retry_count + 1, last_error = ?1
         WHERE status = 'syncing'",
        params![INTERRUPTED_ERROR],
    )?;
    Ok(n)
}

fn aggregate(conn: &Connection) -> Result<StorageState, CaptureError> {
    let state = conn.query_row(
        "SELECT COUNT(*),
                COALESCE(SUM(size), 0),
                COALESCE(SUM(status = 'pending'), 0),
                COALESCE(SUM(status = 'syncing'), 0),
                COALESCE(SUM(status = 'failed'), 0)
         FROM pending_captures",
        [],
        |r| {
            Ok(StorageState {
                total_count: r.get::<_, i64>(0)? as usize,
                total_bytes: r.get::<_, i64>(1)? as u64,
                pending_count: r.get::<_, i64>(2)? as usize,
                syncing_count: r.get::<_, i64>(3)? as usize,
                failed_count: r.get::<_, i64>(4)? as usize,
            })
        },
    )?;
    Ok(state)
}

fn row_to_capture(r: &Row<'_>) -> rusqlite::Result<PendingCapture> {
    let raw_id: String = r.get(0)?;
    let ulid = Ulid::from_string(&raw_id)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;
    let raw_status: String = r.get(7)?;
    let status = raw_status
        .parse::<CaptureStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, e.into()))?;

    Ok(PendingCapture {
        id: CaptureId::from_ulid(ulid),
        task_id: TaskId::new(r.get::<_, String>(1)?),
        assign_id: AssignId::new(r.get::<_, String>(2)?),
        blob: r.get(3)?,
        mime_type: r.get(4)?,
        filename: r.get(5)?,
        timestamp: r.get(6)?,
        status,
        retry_count: r.get::<_, i64>(8)? as u32,
        last_error: r.get(9)?,
        stage: r.get(10)?,
    })
}

fn query_captures(
    conn: &Connection,
    sql: &str,
    args: impl rusqlite::Params,
) -> Result<Vec<PendingCapture>, CaptureError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(args, row_to_capture)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

#[async_trait]
impl CaptureStore for SqliteCaptureStore {
    async fn initialize(&self) -> Result<(), CaptureError> {
        let conn = Arc::clone(&self.conn);
        let location = self.location.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| CaptureError::Transaction("connection lock poisoned".into()))?;
            if guard.is_some() {
                return Ok(());
            }
            let opened = Self::connect(&location)?;
            match &location {
                Location::File(p) => info!(path = %p.display(), "capture store opened"),
                Location::Memory => debug!("in-memory sqlite capture store opened"),
            }
            *guard = Some(opened);
            Ok(())
        })
        .await
        .map_err(|e| CaptureError::StorageUnavailable(format!("store task failed: {e}")))?
    }

    async fn save(
        &self,
        task_id: TaskId,
        assign_id: AssignId,
        blob: Blob,
        stage: &str,
    ) -> Result<CaptureId, CaptureError> {
        let limits = self.limits;
        let capture = PendingCapture::new(
            self.ids.generate_capture_id(),
            task_id,
            assign_id,
            blob,
            stage,
            self.clock.now(),
        );
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            if let Err(err) = limits.check(&aggregate(&tx)?, capture.size()) {
                warn!(task_id = %capture.task_id, bytes = capture.size(), "capture rejected: {err}");
                return Err(err);
            }
            tx.execute(
                &format!(
                    "INSERT INTO pending_captures({COLUMNS}, size)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    capture.id.as_ulid().to_string(),
                    capture.task_id.as_str(),
                    capture.assign_id.as_str(),
                    capture.blob,
                    capture.mime_type,
                    capture.filename,
                    capture.timestamp,
                    capture.status.as_str(),
                    capture.retry_count as i64,
                    capture.last_error,
                    capture.stage,
                    capture.size() as i64,
                ],
            )?;
            tx.commit()?;
            info!(capture_id = %capture.id, task_id = %capture.task_id, bytes = capture.size(), "capture saved");
            Ok(capture.id)
        })
        .await
    }

    async fn get_by_task(&self, task_id: &TaskId) -> Result<Vec<PendingCapture>, CaptureError> {
        let task_id = task_id.as_str().to_string();
        self.with_conn(move |conn| {
            query_captures(
                conn,
                &format!("SELECT {COLUMNS} FROM pending_captures WHERE task_id = ?1"),
                params![task_id],
            )
        })
        .await
    }

    async fn get_by_assign(
        &self,
        assign_id: &AssignId,
    ) -> Result<Vec<PendingCapture>, CaptureError> {
        let assign_id = assign_id.as_str().to_string();
        self.with_conn(move |conn| {
            query_captures(
                conn,
                &format!("SELECT {COLUMNS} FROM pending_captures WHERE assign_id = ?1"),
                params![assign_id],
            )
        })
        .await
    }

    async fn get_by_status(
        &self,
        status: CaptureStatus,
    ) -> Result<Vec<PendingCapture>, CaptureError> {
        self.with_conn(move |conn| {
            query_captures(
                conn,
                &format!(
                    "SELECT {COLUMNS} FROM pending_captures
                     WHERE status = ?1 ORDER BY timestamp ASC, id ASC"
                ),
                params![status.as_str()],
            )
        })
        .await
    }

    async fn get_by_id(&self, id: CaptureId) -> Result<Option<PendingCapture>, CaptureError> {
        self.with_conn(move |conn| {
            let found = conn
                .query_row(
                    &format!("SELECT {COLUMNS} FROM pending_captures WHERE id = ?1"),
                    params![id.as_ulid().to_string()],
                    row_to_capture,
                )
                .optional()?;
            Ok(found)
        })
        .await
    }

    async fn update_status(
        &self,
        id: CaptureId,
        status: CaptureStatus,
        error: Option<String>,
    ) -> Result<(), CaptureError> {
        self.with_conn(move |conn| {
            let key = id.as_ulid().to_string();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current: Option<String> = tx
                .query_row(
                    "SELECT status FROM pending_captures WHERE id = ?1",
                    params![key],
                    |r| r.get(0),
                )
                .optional()?;
            let Some(current) = current else {
                return Err(CaptureError::NotFound(id));
            };
            let from = current
                .parse::<CaptureStatus>()
                .map_err(CaptureError::Transaction)?;
            if !from.can_transition_to(status) {
                warn!(capture_id = %id, from = %from, to = %status, "status transition refused");
                return Err(CaptureError::InvalidTransition { id, from, to: status });
            }

            if status == CaptureStatus::Failed {
                tx.execute(
                    "UPDATE pending_captures
                     SET status = ?1, retry_count = retry_count + 1, last_error = ?2
                     WHERE id = ?3",
                    params![status.as_str(), error, key],
                )?;
            } else {
                tx.execute(
                    "UPDATE pending_captures SET status = ?1 WHERE id = ?2",
                    params![status.as_str(), key],
                )?;
            }
            tx.commit()?;
            debug!(capture_id = %id, status = %status, "capture status updated");
            Ok(())
        })
        .await
    }

    async fn claim_drain(&self) -> Result<Option<usize>, CaptureError> {
        if !self.hold_ownership().await? {
            return Ok(None);
        }
        let recovered = self.with_conn(|conn| recover_interrupted(conn)).await?;
        if recovered > 0 {
            warn!(recovered, "marked interrupted uploads as failed");
        }
        Ok(Some(recovered))
    }

    async fn reset_failed(&self) -> Result<Vec<CaptureId>, CaptureError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let ids = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM pending_captures WHERE status = 'failed' ORDER BY id",
                )?;
                let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
                let mut ids = Vec::new();
                for raw in rows {
                    let raw = raw?;
                    let ulid = Ulid::from_string(&raw).map_err(|e| {
                        CaptureError::Transaction(format!("corrupt capture id {raw}: {e}"))
                    })?;
                    ids.push(CaptureId::from_ulid(ulid));
                }
                ids
            };
            tx.execute(
                "UPDATE pending_captures SET status = 'pending', retry_count = 0
                 WHERE status = 'failed'",
                [],
            )?;
            tx.commit()?;
            Ok(ids)
        })
        .await
    }

    async fn delete(&self, id: CaptureId) -> Result<bool, CaptureError> {
        self.with_conn(move |conn| {
            let n = conn.execute(
                "DELETE FROM pending_captures WHERE id = ?1",
                params![id.as_ulid().to_string()],
            )?;
            if n > 0 {
                debug!(capture_id = %id, "capture deleted");
            }
            Ok(n > 0)
        })
        .await
    }

    async fn delete_by_task(&self, task_id: &TaskId) -> Result<usize, CaptureError> {
        let task_id = task_id.as_str().to_string();
        self.with_conn(move |conn| {
            let n = conn.execute(
                "DELETE FROM pending_captures WHERE task_id = ?1",
                params![task_id],
            )?;
            Ok(n)
        })
        .await
    }

    async fn aggregate_state(&self) -> Result<StorageState, CaptureError> {
        self.with_conn(|conn| aggregate(conn)).await
    }

    async fn purge_older_than(&self, retention_days: u32) -> Result<usize, CaptureError> {
        let cutoff = retention_cutoff(self.clock.now_millis(), retention_days);
        self.with_conn(move |conn| {
            let n = conn.execute(
                "DELETE FROM pending_captures WHERE timestamp < ?1",
                params![cutoff],
            )?;
            if n > 0 {
                info!(removed = n, retention_days, "purged expired captures");
            }
            Ok(n)
        })
        .await
    }

    async fn clear(&self) -> Result<(), CaptureError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM pending_captures", [])?;
            info!("capture store cleared");
            Ok(())
        })
        .await
    }
}
