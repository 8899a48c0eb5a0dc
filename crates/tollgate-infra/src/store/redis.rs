//! Redis counter store.
//!
//! The admission check-and-reserve and both settle paths run as server-side
//! Lua programs, so every decision for a key is one atomic script execution.
//! Key layout: `rl:{key}:{dim}:{bucket}` for counter segments (TTL 2W) and
//! `rl:res:{reservation_id}` for reservation records (TTL 2*T_sweep).

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};

use tollgate_core::domain::{
    PerDimension, ReservationId, ReservationRecord, WindowConfig,
};
use tollgate_core::ports::{
    CounterStore, SettleOutcome, StoreAdmit, StoreDecision, StoreError,
};

/// Sum the live window per dimension, compare against the ceilings, and on
/// success apply the additions and persist the reservation record, as one
/// indivisible unit.
///
/// Returns `{admitted, used_req, used_in, used_out, retry_after}` where the
/// sums are sampled before this request's additions.
const ADMIT_PROGRAM: &str = r#"
local base = KEYS[1]
local res_key = KEYS[2]
local now = tonumber(ARGV[1])
local seg = tonumber(ARGV[2])
local n = tonumber(ARGV[3])
local bucket = math.floor(now / seg)
local oldest = bucket - n + 1

local dims = {'req', 'in', 'out'}
local limits = {tonumber(ARGV[4]), tonumber(ARGV[5]), tonumber(ARGV[6])}
local adds = {1, tonumber(ARGV[7]), tonumber(ARGV[8])}

local used = {0, 0, 0}
for i = 1, 3 do
  for b = oldest, bucket do
    local v = redis.call('GET', base .. ':' .. dims[i] .. ':' .. b)
    if v then used[i] = used[i] + tonumber(v) end
  end
end

-- For every violated dimension, find how long until enough old segments
-- expire; report the slowest one.
local retry = 0
for i = 1, 3 do
  if used[i] + adds[i] > limits[i] then
    local needed = used[i] + adds[i] - limits[i]
    local freed = 0
    local wait = n * seg
    for b = oldest, bucket do
      local v = redis.call('GET', base .. ':' .. dims[i] .. ':' .. b)
      if v then
        freed = freed + tonumber(v)
        if freed >= needed then
          wait = (b + n) * seg - now
          break
        end
      end
    end
    if wait < 1 then wait = 1 end
    if wait > retry then retry = wait end
  end
end

if retry > 0 then
  return {0, used[1], used[2], used[3], retry}
end

for i = 1, 3 do
  if adds[i] > 0 then
    local k = base .. ':' .. dims[i] .. ':' .. bucket
    redis.call('INCRBY', k, adds[i])
    redis.call('EXPIRE', k, tonumber(ARGV[9]))
  end
end
redis.call('SET', res_key, ARGV[11], 'EX', tonumber(ARGV[10]))
return {1, used[1], used[2], used[3], 0}
"#;

/// Commit or release a reservation. Deleting the record in the same program
/// that adjusts the counters makes the terminal transition exactly-once.
/// Deltas land in the bucket of origin, or the oldest live bucket when the
/// origin already left the window. Segments floor at zero.
///
/// Returns 0 = already settled, 1 = applied, 2 = applied to fallback bucket.
const SETTLE_PROGRAM: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 0 end
redis.call('DEL', KEYS[1])

local rec = cjson.decode(raw)
local now = tonumber(ARGV[4])
local seg = tonumber(ARGV[5])
local n = tonumber(ARGV[6])
local bucket = math.floor(now / seg)
local oldest = bucket - n + 1

local target = rec.bucket
local late = 0
if target < oldest then
  target = oldest
  late = 1
end

local base = ARGV[8] .. ':' .. rec.key

local function apply(dim, delta)
  if delta ~= 0 then
    local k = base .. ':' .. dim .. ':' .. target
    local v = redis.call('INCRBY', k, delta)
    if v < 0 then redis.call('SET', k, 0) end
    redis.call('EXPIRE', k, tonumber(ARGV[7]))
  end
end

if ARGV[1] == 'commit' then
  apply('in', tonumber(ARGV[2]) - rec.in_est)
  apply('out', tonumber(ARGV[3]) - rec.out_reserve)
else
  apply('req', -1)
  apply('in', -rec.in_est)
  apply('out', -rec.out_reserve)
end

if late == 1 then
  redis.call('INCR', ARGV[8] .. ':stats:late_settles')
  return 2
end
return 1
"#;

/// How often a failed settle is retried before the error propagates.
const SETTLE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Redis URL (e.g., redis://localhost:6379)
    pub url: String,
    /// Connection timeout at startup.
    pub connect_timeout: Duration,
    /// Per-operation deadline for admit/settle round-trips.
    pub op_timeout: Duration,
    /// Prefix for every key this store writes.
    pub key_prefix: String,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connect_timeout: Duration::from_secs(5),
            op_timeout: Duration::from_millis(250),
            key_prefix: "rl".to_string(),
        }
    }
}

impl RedisStoreConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: std::env::var("REDIS_URL").unwrap_or(defaults.url),
            connect_timeout: Duration::from_secs(
                std::env::var("REDIS_CONNECT_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
            ),
            op_timeout: Duration::from_millis(
                std::env::var("STORE_OP_TIMEOUT_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(250),
            ),
            key_prefix: std::env::var("STORE_KEY_PREFIX").unwrap_or(defaults.key_prefix),
        }
    }
}

/// Redis-backed counter store. Uses a connection manager for automatic
/// reconnection; scripts are sent by SHA after the first invocation.
pub struct RedisCounterStore {
    conn: ConnectionManager,
    window: WindowConfig,
    config: RedisStoreConfig,
    admit_program: Script,
    settle_program: Script,
}

impl RedisCounterStore {
    pub async fn new(config: RedisStoreConfig, window: WindowConfig) -> Result<Self, StoreError> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        // Use a timeout to avoid hanging startup when Redis is unreachable.
        let conn = tokio::time::timeout(config.connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Connection("connection timed out".to_string()))?
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        tracing::info!(url = %config.url, "Connected to Redis counter store");

        Ok(Self {
            conn,
            window,
            config,
            admit_program: Script::new(ADMIT_PROGRAM),
            settle_program: Script::new(SETTLE_PROGRAM),
        })
    }

    pub async fn from_env(window: WindowConfig) -> Result<Self, StoreError> {
        Self::new(RedisStoreConfig::from_env(), window).await
    }

    fn counter_base(&self, key: &str) -> String {
        format!("{}:{}", self.config.key_prefix, key)
    }

    fn reservation_key(&self, id: &ReservationId) -> String {
        format!("{}:res:{}", self.config.key_prefix, id)
    }

    async fn deadline<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, redis::RedisError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.config.op_timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout(self.config.op_timeout.as_millis() as u64))?
            .map_err(|e| StoreError::Operation(e.to_string()))
    }

    async fn settle_once(
        &self,
        id: &ReservationId,
        mode: &'static str,
        in_actual: u64,
        out_actual: u64,
        now_secs: i64,
    ) -> Result<SettleOutcome, StoreError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.settle_program.prepare_invoke();
        invocation
            .key(self.reservation_key(id))
            .arg(mode)
            .arg(in_actual)
            .arg(out_actual)
            .arg(now_secs)
            .arg(self.window.segment_secs())
            .arg(self.window.segments())
            .arg(self.window.segment_ttl_secs())
            .arg(self.config.key_prefix.as_str());

        let reply: i64 = self.deadline(invocation.invoke_async(&mut conn)).await?;
        match reply {
            0 => Ok(SettleOutcome::AlreadySettled),
            1 => Ok(SettleOutcome::Applied),
            2 => {
                tracing::warn!(
                    reservation = %id,
                    mode,
                    "settle past the origin bucket's lifetime, applied to oldest live bucket"
                );
                Ok(SettleOutcome::Applied)
            }
            other => Err(StoreError::Operation(format!(
                "settle program returned unexpected value {other}"
            ))),
        }
    }

    /// Settles are retried with exponential backoff; only terminal failure
    /// propagates (the sweep reclaims whatever still slips through).
    async fn settle(
        &self,
        id: &ReservationId,
        mode: &'static str,
        in_actual: u64,
        out_actual: u64,
        now_secs: i64,
    ) -> Result<SettleOutcome, StoreError> {
        let mut backoff = Duration::from_millis(50);
        let mut attempt = 0;
        loop {
            match self
                .settle_once(id, mode, in_actual, out_actual, now_secs)
                .await
            {
                Ok(outcome) => return Ok(outcome),
                Err(error) => {
                    attempt += 1;
                    if attempt >= SETTLE_ATTEMPTS {
                        return Err(error);
                    }
                    tracing::warn!(reservation = %id, mode, attempt, %error, "settle failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn admit(&self, request: StoreAdmit) -> Result<StoreDecision, StoreError> {
        let record = ReservationRecord {
            key: request.key.as_str().to_string(),
            bucket: self.window.bucket(request.now_secs),
            admitted_at: request.now_secs,
            in_est: request.cost.input_tokens,
            out_reserve: request.cost.output_tokens,
        };
        let payload = serde_json::to_string(&record)
            .map_err(|e| StoreError::Operation(e.to_string()))?;

        let mut conn = self.conn.clone();
        let mut invocation = self.admit_program.prepare_invoke();
        invocation
            .key(self.counter_base(request.key.as_str()))
            .key(self.reservation_key(&request.reservation))
            .arg(request.now_secs)
            .arg(self.window.segment_secs())
            .arg(self.window.segments())
            .arg(request.limits.rpm)
            .arg(request.limits.input_tpm)
            .arg(request.limits.output_tpm)
            .arg(request.cost.input_tokens)
            .arg(request.cost.output_tokens)
            .arg(self.window.segment_ttl_secs())
            .arg(self.window.reservation_ttl_secs())
            .arg(payload);

        let reply: Vec<i64> = self.deadline(invocation.invoke_async(&mut conn)).await?;
        let &[admitted, used_req, used_in, used_out, retry] = reply.as_slice() else {
            return Err(StoreError::Operation(format!(
                "admit program returned {} values, expected 5",
                reply.len()
            )));
        };

        Ok(StoreDecision {
            admitted: admitted == 1,
            used: PerDimension {
                input_tokens: used_in as u64,
                output_tokens: used_out as u64,
                requests: used_req as u64,
            },
            retry_after_secs: retry as u64,
        })
    }

    async fn commit(
        &self,
        id: &ReservationId,
        in_actual: u64,
        out_actual: u64,
        now_secs: i64,
    ) -> Result<SettleOutcome, StoreError> {
        self.settle(id, "commit", in_actual, out_actual, now_secs)
            .await
    }

    async fn release(
        &self,
        id: &ReservationId,
        now_secs: i64,
    ) -> Result<SettleOutcome, StoreError> {
        self.settle(id, "release", 0, 0, now_secs).await
    }

    async fn sweep(
        &self,
        cutoff_secs: i64,
        now_secs: i64,
    ) -> Result<Vec<ReservationId>, StoreError> {
        let pattern = format!("{}:res:*", self.config.key_prefix);
        let mut conn = self.conn.clone();

        let mut stale = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(|e| StoreError::Operation(e.to_string()))?;

            for key in keys {
                let payload: Option<String> = redis::cmd("GET")
                    .arg(&key)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| StoreError::Operation(e.to_string()))?;
                // Gone between SCAN and GET: another node settled it.
                let Some(payload) = payload else { continue };

                let record: ReservationRecord =
                    serde_json::from_str(&payload).map_err(|e| StoreError::Corrupt {
                        key: key.clone(),
                        detail: e.to_string(),
                    })?;
                if record.admitted_at > cutoff_secs {
                    continue;
                }

                let Some(id) = key
                    .rsplit(':')
                    .next()
                    .and_then(ReservationId::parse)
                else {
                    return Err(StoreError::Corrupt {
                        key: key.clone(),
                        detail: "key suffix is not a reservation id".to_string(),
                    });
                };
                stale.push(id);
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        let mut released = Vec::with_capacity(stale.len());
        for id in stale {
            // Races with a concurrent settle resolve inside the program.
            if self.settle_once(&id, "release", 0, 0, now_secs).await?
                == SettleOutcome::Applied
            {
                released.push(id);
            }
        }
        Ok(released)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let cmd = redis::cmd("PING");
        let pong: String = self.deadline(cmd.query_async(&mut conn)).await?;
        debug_assert_eq!(pong, "PONG");
        Ok(())
    }
}
