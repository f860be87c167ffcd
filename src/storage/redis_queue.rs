use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::cli::config::{QueueSettings, RetentionSettings};
use crate::crawler::task::{Job, LastError, ScrapeResult};
use crate::storage::queue::{
    ClaimedJob, EnqueueOptions, JobRecord, JobState, QueueBackend, QueueCounts, QueueError,
};

// Waiting score is priority * 1e12 + insertion sequence, so ZRANGE 0 0 is
// the lowest priority value and, within it, the oldest job.

const ENQUEUE: &str = r"
local now = tonumber(ARGV[2])
for i = 3, #ARGV, 4 do
  local id = ARGV[i]
  local priority = tonumber(ARGV[i + 2])
  local available = tonumber(ARGV[i + 3])
  local key = ARGV[1] .. id
  local state = 'waiting'
  if available > now then state = 'delayed' end
  redis.call('HSET', key, 'data', ARGV[i + 1], 'state', state, 'attempts', 0,
    'priority', ARGV[i + 2], 'enqueued_at', ARGV[2], 'available_at', ARGV[i + 3])
  if state == 'delayed' then
    redis.call('ZADD', KEYS[2], available, id)
  else
    local seq = redis.call('INCR', KEYS[3])
    redis.call('ZADD', KEYS[1], priority * 1e12 + seq, id)
  end
end
return 1
";

const CLAIM: &str = r"
local now = tonumber(ARGV[2])
local function requeue(id)
  local key = ARGV[1] .. id
  local priority = tonumber(redis.call('HGET', key, 'priority') or '0')
  local seq = redis.call('INCR', KEYS[4])
  redis.call('ZADD', KEYS[1], priority * 1e12 + seq, id)
  redis.call('HSET', key, 'state', 'waiting')
  redis.call('HDEL', key, 'token')
end
for _, id in ipairs(redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)) do
  redis.call('ZREM', KEYS[2], id)
  requeue(id)
end
for _, id in ipairs(redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', now)) do
  redis.call('ZREM', KEYS[3], id)
  requeue(id)
end
local head = redis.call('ZRANGE', KEYS[1], 0, 0)
if #head == 0 then return false end
local id = head[1]
local key = ARGV[1] .. id
redis.call('ZREM', KEYS[1], id)
redis.call('ZADD', KEYS[3], now + tonumber(ARGV[3]), id)
local attempts = redis.call('HINCRBY', key, 'attempts', 1)
redis.call('HSET', key, 'state', 'active', 'token', ARGV[4])
return {id, redis.call('HGET', key, 'data'), attempts}
";

// Transitions below take the job hash as KEYS[1] and present the lease token.

const EXTEND: &str = r"
if redis.call('HGET', KEYS[1], 'token') ~= ARGV[1] then return 0 end
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[3])
return 1
";

const FINISH: &str = r"
if redis.call('HGET', KEYS[1], 'token') ~= ARGV[1] then return 0 end
redis.call('ZREM', KEYS[2], ARGV[2])
redis.call('HDEL', KEYS[1], 'token')
redis.call('HSET', KEYS[1], 'state', ARGV[4], ARGV[5], ARGV[6], 'data', ARGV[7], 'finished_at', ARGV[3])
redis.call('ZADD', KEYS[3], ARGV[3], ARGV[2])
local cutoff = '(' .. ARGV[9]
for _, id in ipairs(redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', cutoff)) do
  redis.call('DEL', ARGV[10] .. id)
end
redis.call('ZREMRANGEBYSCORE', KEYS[3], '-inf', cutoff)
local excess = redis.call('ZCARD', KEYS[3]) - tonumber(ARGV[8])
if excess > 0 then
  for _, id in ipairs(redis.call('ZRANGE', KEYS[3], 0, excess - 1)) do
    redis.call('DEL', ARGV[10] .. id)
  end
  redis.call('ZREMRANGEBYRANK', KEYS[3], 0, excess - 1)
end
return 1
";

const RETRY: &str = r"
if redis.call('HGET', KEYS[1], 'token') ~= ARGV[1] then return 0 end
redis.call('ZREM', KEYS[2], ARGV[2])
redis.call('HDEL', KEYS[1], 'token')
redis.call('HSET', KEYS[1], 'data', ARGV[3], 'available_at', ARGV[4])
if tonumber(ARGV[4]) > tonumber(ARGV[5]) then
  redis.call('ZADD', KEYS[3], ARGV[4], ARGV[2])
  redis.call('HSET', KEYS[1], 'state', 'delayed')
else
  local priority = tonumber(redis.call('HGET', KEYS[1], 'priority') or '0')
  local seq = redis.call('INCR', KEYS[5])
  redis.call('ZADD', KEYS[4], priority * 1e12 + seq, ARGV[2])
  redis.call('HSET', KEYS[1], 'state', 'waiting')
end
return 1
";

// Released jobs go back ahead of their priority band.
const RELEASE: &str = r"
if redis.call('HGET', KEYS[1], 'token') ~= ARGV[1] then return 0 end
redis.call('ZREM', KEYS[2], ARGV[2])
redis.call('HDEL', KEYS[1], 'token')
redis.call('HINCRBY', KEYS[1], 'attempts', -1)
local priority = tonumber(redis.call('HGET', KEYS[1], 'priority') or '0')
redis.call('ZADD', KEYS[3], priority * 1e12, ARGV[2])
redis.call('HSET', KEYS[1], 'state', 'waiting')
return 1
";

/// Key names under one prefix. The prefix is a hash tag, so on a cluster
/// every key of one queue lands in the same slot and the scripts that
/// derive job keys from ids stay valid.
#[derive(Debug, Clone)]
struct Keys {
    job_prefix: String,
    waiting: String,
    delayed: String,
    active: String,
    completed: String,
    failed: String,
    seq: String,
}

impl Keys {
    fn new(prefix: &str) -> Self {
        let tag = format!("{{{}}}", prefix);
        Self {
            job_prefix: format!("{}:job:", tag),
            waiting: format!("{}:waiting", tag),
            delayed: format!("{}:delayed", tag),
            active: format!("{}:active", tag),
            completed: format!("{}:completed", tag),
            failed: format!("{}:failed", tag),
            seq: format!("{}:seq", tag),
        }
    }

    fn job(&self, id: &str) -> String {
        format!("{}{}", self.job_prefix, id)
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_ms(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

fn field_ms(fields: &HashMap<String, String>, name: &str) -> Option<DateTime<Utc>> {
    fields.get(name).and_then(|v| v.parse::<i64>().ok()).and_then(from_ms)
}

/// Rebuild a record from the job hash; `None` when the hash is gone
fn record_from_hash(id: &str, fields: &HashMap<String, String>) -> Result<Option<JobRecord>, QueueError> {
    let Some(data) = fields.get("data") else {
        return Ok(None);
    };
    let Some(state) = fields.get("state").and_then(|s| JobState::parse(s)) else {
        return Ok(None);
    };

    let job: Job = serde_json::from_str(data)?;
    let result = match fields.get("result") {
        Some(json) => Some(serde_json::from_str::<ScrapeResult>(json)?),
        None => None,
    };
    let enqueued_at = field_ms(fields, "enqueued_at").unwrap_or(job.created_at);

    Ok(Some(JobRecord {
        id: id.to_string(),
        state,
        attempts: fields.get("attempts").and_then(|v| v.parse().ok()).unwrap_or(0),
        priority: fields
            .get("priority")
            .and_then(|v| v.parse().ok())
            .or(job.priority)
            .unwrap_or(0),
        enqueued_at,
        available_at: field_ms(fields, "available_at").unwrap_or(enqueued_at),
        finished_at: field_ms(fields, "finished_at"),
        result,
        failure: fields.get("failure").cloned(),
        job,
    }))
}

/// Queue kept in Redis: one hash per job plus sorted sets per state.
/// Every transition is one Lua script, so workers in separate processes
/// never observe half-applied moves.
pub struct RedisQueue {
    /// Redis client
    _client: Client,

    conn: Mutex<MultiplexedConnection>,
    keys: Keys,
    completed_retention: RetentionSettings,
    failed_retention: RetentionSettings,
    closed: AtomicBool,

    enqueue_script: Script,
    claim_script: Script,
    extend_script: Script,
    finish_script: Script,
    retry_script: Script,
    release_script: Script,
}

impl RedisQueue {
    pub async fn connect(settings: &QueueSettings) -> Result<Self> {
        let client = Client::open(settings.redis_url.clone())
            .context(format!("Failed to connect to Redis at {}", settings.redis_url))?;

        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to get Redis connection")?;

        Ok(Self {
            _client: client,
            conn: Mutex::new(conn),
            keys: Keys::new(&settings.key_prefix),
            completed_retention: settings.completed_retention.clone(),
            failed_retention: settings.failed_retention.clone(),
            closed: AtomicBool::new(false),
            enqueue_script: Script::new(ENQUEUE),
            claim_script: Script::new(CLAIM),
            extend_script: Script::new(EXTEND),
            finish_script: Script::new(FINISH),
            retry_script: Script::new(RETRY),
            release_script: Script::new(RELEASE),
        })
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        Ok(())
    }

    async fn finish(
        &self,
        claim: &ClaimedJob,
        state: JobState,
        field: &str,
        value: &str,
        job: &Job,
        retention: &RetentionSettings,
    ) -> Result<(), QueueError> {
        self.ensure_open()?;
        let (finished_set, state_name) = match state {
            JobState::Completed => (&self.keys.completed, "completed"),
            _ => (&self.keys.failed, "failed"),
        };
        let now = now_ms();
        let min_score = now - (retention.max_age_secs as i64).saturating_mul(1_000);
        let data = serde_json::to_string(job)?;

        let mut conn = self.conn.lock().await;
        let applied: i32 = self
            .finish_script
            .key(self.keys.job(&claim.id))
            .key(&self.keys.active)
            .key(finished_set)
            .arg(&claim.token)
            .arg(&claim.id)
            .arg(now)
            .arg(state_name)
            .arg(field)
            .arg(value)
            .arg(data)
            .arg(retention.max_count)
            .arg(min_score)
            .arg(&self.keys.job_prefix)
            .invoke_async(&mut *conn)
            .await?;

        if applied == 0 {
            return Err(QueueError::LeaseLost(claim.id.clone()));
        }
        debug!("Job {} is {}", claim.id, state_name);
        Ok(())
    }
}

#[async_trait]
impl QueueBackend for RedisQueue {
    async fn enqueue(&self, job: &Job, options: EnqueueOptions) -> Result<String, QueueError> {
        let mut ids = self.enqueue_bulk(&[(job.clone(), options)]).await?;
        ids.pop().ok_or_else(|| QueueError::InvalidJobSpec("empty batch".to_string()))
    }

    async fn enqueue_bulk(&self, jobs: &[(Job, EnqueueOptions)]) -> Result<Vec<String>, QueueError> {
        self.ensure_open()?;
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let now = now_ms();
        let mut invocation = self.enqueue_script.prepare_invoke();
        invocation
            .key(&self.keys.waiting)
            .key(&self.keys.delayed)
            .key(&self.keys.seq)
            .arg(&self.keys.job_prefix)
            .arg(now);

        let mut ids = Vec::with_capacity(jobs.len());
        for (job, options) in jobs {
            let id = Uuid::new_v4().to_string();
            let available = now + options.delay.as_millis() as i64;
            invocation
                .arg(&id)
                .arg(serde_json::to_string(job)?)
                .arg(options.priority)
                .arg(available);
            ids.push(id);
        }

        let mut conn = self.conn.lock().await;
        let _: i32 = invocation.invoke_async(&mut *conn).await?;
        debug!("Enqueued {} job(s)", ids.len());
        Ok(ids)
    }

    async fn claim(&self, lease: Duration) -> Result<Option<ClaimedJob>, QueueError> {
        self.ensure_open()?;
        let token = Uuid::new_v4().to_string();

        let mut conn = self.conn.lock().await;
        let claimed: Option<(String, String, u32)> = self
            .claim_script
            .key(&self.keys.waiting)
            .key(&self.keys.delayed)
            .key(&self.keys.active)
            .key(&self.keys.seq)
            .arg(&self.keys.job_prefix)
            .arg(now_ms())
            .arg(lease.as_millis() as u64)
            .arg(&token)
            .invoke_async(&mut *conn)
            .await?;

        match claimed {
            Some((id, data, attempt)) => Ok(Some(ClaimedJob {
                job: serde_json::from_str(&data)?,
                id,
                token,
                attempt,
            })),
            None => Ok(None),
        }
    }

    async fn extend_lease(&self, claim: &ClaimedJob, lease: Duration) -> Result<(), QueueError> {
        self.ensure_open()?;
        let deadline = now_ms() + lease.as_millis() as i64;

        let mut conn = self.conn.lock().await;
        let applied: i32 = self
            .extend_script
            .key(self.keys.job(&claim.id))
            .key(&self.keys.active)
            .arg(&claim.token)
            .arg(deadline)
            .arg(&claim.id)
            .invoke_async(&mut *conn)
            .await?;

        if applied == 0 {
            return Err(QueueError::LeaseLost(claim.id.clone()));
        }
        Ok(())
    }

    async fn complete(&self, claim: &ClaimedJob, result: &ScrapeResult) -> Result<(), QueueError> {
        let result = serde_json::to_string(result)?;
        self.finish(
            claim,
            JobState::Completed,
            "result",
            &result,
            &claim.job,
            &self.completed_retention,
        )
        .await
    }

    async fn retry(&self, claim: &ClaimedJob, error: &LastError, delay: Duration) -> Result<(), QueueError> {
        self.ensure_open()?;
        let mut job = claim.job.clone();
        job.last_error = Some(error.clone());
        let now = now_ms();

        let mut conn = self.conn.lock().await;
        let applied: i32 = self
            .retry_script
            .key(self.keys.job(&claim.id))
            .key(&self.keys.active)
            .key(&self.keys.delayed)
            .key(&self.keys.waiting)
            .key(&self.keys.seq)
            .arg(&claim.token)
            .arg(&claim.id)
            .arg(serde_json::to_string(&job)?)
            .arg(now + delay.as_millis() as i64)
            .arg(now)
            .invoke_async(&mut *conn)
            .await?;

        if applied == 0 {
            return Err(QueueError::LeaseLost(claim.id.clone()));
        }
        Ok(())
    }

    async fn fail(&self, claim: &ClaimedJob, error: &LastError, reason: &str) -> Result<(), QueueError> {
        let mut job = claim.job.clone();
        job.last_error = Some(error.clone());
        self.finish(claim, JobState::Failed, "failure", reason, &job, &self.failed_retention)
            .await
    }

    async fn release(&self, claim: &ClaimedJob) -> Result<(), QueueError> {
        self.ensure_open()?;

        let mut conn = self.conn.lock().await;
        let applied: i32 = self
            .release_script
            .key(self.keys.job(&claim.id))
            .key(&self.keys.active)
            .key(&self.keys.waiting)
            .arg(&claim.token)
            .arg(&claim.id)
            .invoke_async(&mut *conn)
            .await?;

        if applied == 0 {
            return Err(QueueError::LeaseLost(claim.id.clone()));
        }
        Ok(())
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        self.ensure_open()?;

        let mut conn = self.conn.lock().await;
        let (waiting, delayed, active, completed, failed): (usize, usize, usize, usize, usize) = redis::pipe()
            .cmd("ZCARD")
            .arg(&self.keys.waiting)
            .cmd("ZCARD")
            .arg(&self.keys.delayed)
            .cmd("ZCARD")
            .arg(&self.keys.active)
            .cmd("ZCARD")
            .arg(&self.keys.completed)
            .cmd("ZCARD")
            .arg(&self.keys.failed)
            .query_async(&mut *conn)
            .await?;

        Ok(QueueCounts {
            waiting,
            delayed,
            active,
            completed,
            failed,
        })
    }

    async fn get(&self, id: &str) -> Result<Option<JobRecord>, QueueError> {
        self.ensure_open()?;

        let mut conn = self.conn.lock().await;
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.keys.job(id))
            .query_async(&mut *conn)
            .await?;

        record_from_hash(id, &fields)
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
