use crate::models::{GenerationResult, Task, TaskPayload, TaskStatus};
use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use redis::AsyncCommands;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

const TASK_TTL_SECS: u64 = 86_400;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("task {0} not found")]
    NotFound(Uuid),
    #[error("task {0} already reached a terminal state")]
    TerminalState(Uuid),
}

/// Durable ledger of tasks. Leasing is the single synchronization point
/// between workers: a claim is conditional (still queued, or lease expired)
/// so at most one worker holds a non-expired lease per task.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn enqueue(&self, payload: TaskPayload) -> Result<Uuid, StoreError>;

    /// Atomically claim one leasable task for `worker_id`, transitioning it
    /// to `processing` and incrementing its attempt count. The attempt
    /// budget is the caller's concern: a task past its budget is still
    /// returned, so the worker can settle it as failed and notify.
    async fn lease(&self, worker_id: &str) -> Result<Option<Task>, StoreError>;

    async fn complete(&self, task_id: Uuid, result: GenerationResult) -> Result<(), StoreError>;

    async fn fail(&self, task_id: Uuid, error: &str) -> Result<(), StoreError>;

    async fn get(&self, task_id: Uuid) -> Result<Option<Task>, StoreError>;

    async fn set_progress(
        &self,
        task_id: Uuid,
        progress: u8,
        message: &str,
    ) -> Result<(), StoreError>;
}

fn new_task(payload: TaskPayload) -> Task {
    let now = Utc::now();
    Task {
        id: Uuid::new_v4(),
        payload,
        status: TaskStatus::Queued,
        attempts: 0,
        created_at: now,
        updated_at: now,
        owner: None,
        error: None,
        result: None,
        progress: None,
        progress_message: None,
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

struct MemoryEntry {
    task: Task,
    lease_deadline: Option<Instant>,
}

struct MemoryState {
    tasks: HashMap<Uuid, MemoryEntry>,
    pending: VecDeque<Uuid>,
}

/// Single-process store used by tests and by local runs without `REDIS_URL`.
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    lease_timeout: Duration,
}

impl MemoryStore {
    pub fn new(lease_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                tasks: HashMap::new(),
                pending: VecDeque::new(),
            }),
            lease_timeout,
        }
    }

    fn claim(entry: &mut MemoryEntry, worker_id: &str, deadline: Instant) {
        entry.task.status = TaskStatus::Processing;
        entry.task.attempts += 1;
        entry.task.owner = Some(worker_id.to_string());
        entry.task.updated_at = Utc::now();
        entry.lease_deadline = Some(deadline);
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn enqueue(&self, payload: TaskPayload) -> Result<Uuid, StoreError> {
        let task = new_task(payload);
        let id = task.id;
        let mut state = self.state.lock().await;
        state.pending.push_back(id);
        state.tasks.insert(
            id,
            MemoryEntry {
                task,
                lease_deadline: None,
            },
        );
        Ok(id)
    }

    async fn lease(&self, worker_id: &str) -> Result<Option<Task>, StoreError> {
        let now = Instant::now();
        let deadline = now + self.lease_timeout;
        let mut state = self.state.lock().await;

        // Expired leases are reclaimed ahead of fresh work so a crashed
        // worker's task does not starve behind the queue.
        let expired = state
            .tasks
            .iter()
            .find(|(_, entry)| {
                entry.task.status == TaskStatus::Processing
                    && entry.lease_deadline.is_some_and(|d| d <= now)
            })
            .map(|(id, _)| *id);
        if let Some(id) = expired {
            let entry = state.tasks.get_mut(&id).expect("entry exists");
            Self::claim(entry, worker_id, deadline);
            return Ok(Some(entry.task.clone()));
        }

        while let Some(id) = state.pending.pop_front() {
            let Some(entry) = state.tasks.get_mut(&id) else {
                continue;
            };
            if entry.task.status != TaskStatus::Queued {
                continue;
            }
            Self::claim(entry, worker_id, deadline);
            return Ok(Some(entry.task.clone()));
        }
        Ok(None)
    }

    async fn complete(&self, task_id: Uuid, result: GenerationResult) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let entry = state
            .tasks
            .get_mut(&task_id)
            .ok_or(StoreError::NotFound(task_id))?;
        if entry.task.status.is_terminal() {
            return Err(StoreError::TerminalState(task_id));
        }
        entry.task.status = TaskStatus::Completed;
        entry.task.result = Some(result);
        entry.task.error = None;
        entry.task.progress = Some(100);
        entry.task.updated_at = Utc::now();
        entry.lease_deadline = None;
        Ok(())
    }

    async fn fail(&self, task_id: Uuid, error: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let entry = state
            .tasks
            .get_mut(&task_id)
            .ok_or(StoreError::NotFound(task_id))?;
        if entry.task.status.is_terminal() {
            return Err(StoreError::TerminalState(task_id));
        }
        entry.task.status = TaskStatus::Failed;
        entry.task.error = Some(error.to_string());
        entry.task.result = None;
        entry.task.updated_at = Utc::now();
        entry.lease_deadline = None;
        Ok(())
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<Task>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.tasks.get(&task_id).map(|entry| entry.task.clone()))
    }

    async fn set_progress(
        &self,
        task_id: Uuid,
        progress: u8,
        message: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let entry = state
            .tasks
            .get_mut(&task_id)
            .ok_or(StoreError::NotFound(task_id))?;
        if entry.task.status.is_terminal() {
            return Ok(());
        }
        entry.task.progress = Some(progress.min(100));
        entry.task.progress_message = Some(message.to_string());
        entry.task.updated_at = Utc::now();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Redis store
// ---------------------------------------------------------------------------

const QUEUE_KEY: &str = "pagecraft:queue";
const LEASE_KEY: &str = "pagecraft:leases";

fn task_key(id: Uuid) -> String {
    format!("pagecraft:task:{id}")
}

/// Claims one task id atomically: an expired lease first, else the queue
/// head. The returned id is exclusively ours until the new deadline, so the
/// follow-up read-modify-write of the task record has a single owner.
static CLAIM_SCRIPT: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
        local id = nil
        local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1], 'LIMIT', 0, 1)
        if expired[1] then
            id = expired[1]
            redis.call('ZADD', KEYS[2], ARGV[2], id)
        else
            id = redis.call('LPOP', KEYS[1])
            if id then
                redis.call('ZADD', KEYS[2], ARGV[2], id)
            end
        end
        return id
        "#,
    )
});

/// Task Store over a shared redis instance. Task records live under a 24h
/// TTL; leases are a deadline-scored set consulted by the claim script.
pub struct RedisStore {
    client: redis::Client,
    lease_timeout: Duration,
}

impl RedisStore {
    pub fn connect(url: &str, lease_timeout: Duration) -> Result<Self, StoreError> {
        Ok(Self {
            client: redis::Client::open(url)?,
            lease_timeout,
        })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    async fn write_task(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        task: &Task,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(task)?;
        conn.set_ex::<_, _, ()>(task_key(task.id), json, TASK_TTL_SECS)
            .await?;
        Ok(())
    }

    async fn read_task(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        id: Uuid,
    ) -> Result<Option<Task>, StoreError> {
        let raw: Option<String> = conn.get(task_key(id)).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn release_lease(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        id: Uuid,
    ) -> Result<(), StoreError> {
        conn.zrem::<_, _, ()>(LEASE_KEY, id.to_string()).await?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for RedisStore {
    async fn enqueue(&self, payload: TaskPayload) -> Result<Uuid, StoreError> {
        let task = new_task(payload);
        let id = task.id;
        let mut conn = self.conn().await?;
        self.write_task(&mut conn, &task).await?;
        conn.rpush::<_, _, ()>(QUEUE_KEY, id.to_string()).await?;
        Ok(id)
    }

    async fn lease(&self, worker_id: &str) -> Result<Option<Task>, StoreError> {
        let mut conn = self.conn().await?;
        // A claimed id can point at a terminal or vanished record; skip a
        // few of those rather than surfacing an empty poll cycle.
        for _ in 0..8 {
            let now_ms = Utc::now().timestamp_millis();
            let deadline_ms = now_ms + self.lease_timeout.as_millis() as i64;
            let claimed: Option<String> = CLAIM_SCRIPT
                .key(QUEUE_KEY)
                .key(LEASE_KEY)
                .arg(now_ms)
                .arg(deadline_ms)
                .invoke_async(&mut conn)
                .await?;
            let Some(raw_id) = claimed else {
                return Ok(None);
            };
            let Ok(id) = Uuid::parse_str(&raw_id) else {
                conn.zrem::<_, _, ()>(LEASE_KEY, &raw_id).await?;
                continue;
            };
            let Some(mut task) = self.read_task(&mut conn, id).await? else {
                // Record expired out from under its queue entry.
                conn.zrem::<_, _, ()>(LEASE_KEY, raw_id).await?;
                continue;
            };
            if task.status.is_terminal() {
                self.release_lease(&mut conn, id).await?;
                continue;
            }
            task.status = TaskStatus::Processing;
            task.attempts += 1;
            task.owner = Some(worker_id.to_string());
            task.updated_at = Utc::now();
            self.write_task(&mut conn, &task).await?;
            return Ok(Some(task));
        }
        Ok(None)
    }

    async fn complete(&self, task_id: Uuid, result: GenerationResult) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let mut task = self
            .read_task(&mut conn, task_id)
            .await?
            .ok_or(StoreError::NotFound(task_id))?;
        if task.status.is_terminal() {
            return Err(StoreError::TerminalState(task_id));
        }
        task.status = TaskStatus::Completed;
        task.result = Some(result);
        task.error = None;
        task.progress = Some(100);
        task.updated_at = Utc::now();
        self.write_task(&mut conn, &task).await?;
        self.release_lease(&mut conn, task_id).await
    }

    async fn fail(&self, task_id: Uuid, error: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let mut task = self
            .read_task(&mut conn, task_id)
            .await?
            .ok_or(StoreError::NotFound(task_id))?;
        if task.status.is_terminal() {
            return Err(StoreError::TerminalState(task_id));
        }
        task.status = TaskStatus::Failed;
        task.error = Some(error.to_string());
        task.result = None;
        task.updated_at = Utc::now();
        self.write_task(&mut conn, &task).await?;
        self.release_lease(&mut conn, task_id).await
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<Task>, StoreError> {
        let mut conn = self.conn().await?;
        self.read_task(&mut conn, task_id).await
    }

    async fn set_progress(
        &self,
        task_id: Uuid,
        progress: u8,
        message: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let Some(mut task) = self.read_task(&mut conn, task_id).await? else {
            return Err(StoreError::NotFound(task_id));
        };
        if task.status.is_terminal() {
            return Ok(());
        }
        task.progress = Some(progress.min(100));
        task.progress_message = Some(message.to_string());
        task.updated_at = Utc::now();
        self.write_task(&mut conn, &task).await
    }
}
