//! Redis-backed shared store.
//!
//! Each admission log is a sorted set scored by admission time in
//! milliseconds (taken from Redis `TIME`). Members are `"{seq}:{units}"`, where
//! `seq` comes from the companion sequence key so members stay unique. Both
//! keys expire one window after the last admission.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::fmt;
use std::time::Duration;

use super::{SharedStore, StoreError, WindowOutcome, WindowTransaction};

const ADMIT_SCRIPT: &str = r#"
local log_key = KEYS[1]
local seq_key = KEYS[2]
local window_ms = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local units = tonumber(ARGV[3])

local time_array = redis.call("TIME")
local now_ms = tonumber(time_array[1]) * 1000 + math.floor(tonumber(time_array[2]) / 1000)

if now_ms >= window_ms then
    redis.call("ZREMRANGEBYSCORE", log_key, "-inf", now_ms - window_ms)
end

local count = 0
local members = redis.call("ZRANGE", log_key, 0, -1)
for i = 1, #members do
    local sep = string.find(members[i], ":", 1, true)
    count = count + tonumber(string.sub(members[i], sep + 1))
end

local admitted = 0
if count + units <= capacity then
    local seq = redis.call("INCR", seq_key)
    redis.call("ZADD", log_key, now_ms, seq .. ":" .. units)
    redis.call("PEXPIRE", log_key, window_ms)
    redis.call("PEXPIRE", seq_key, window_ms)
    count = count + units
    admitted = 1
end

local oldest_ms = -1
local oldest = redis.call("ZRANGE", log_key, 0, 0, "WITHSCORES")
if #oldest > 0 then
    oldest_ms = tonumber(oldest[2])
end

return {admitted, count, oldest_ms, now_ms}
"#;

const INSPECT_SCRIPT: &str = r#"
local log_key = KEYS[1]
local window_ms = tonumber(ARGV[1])

local time_array = redis.call("TIME")
local now_ms = tonumber(time_array[1]) * 1000 + math.floor(tonumber(time_array[2]) / 1000)

local min_score = "-inf"
if now_ms >= window_ms then
    min_score = "(" .. string.format("%d", now_ms - window_ms)
end

local count = 0
local oldest_ms = -1
local live = redis.call("ZRANGEBYSCORE", log_key, min_score, "+inf", "WITHSCORES")
for i = 1, #live, 2 do
    local sep = string.find(live[i], ":", 1, true)
    count = count + tonumber(string.sub(live[i], sep + 1))
    if oldest_ms < 0 then
        oldest_ms = tonumber(live[i + 1])
    end
end

return {0, count, oldest_ms, now_ms}
"#;

/// Shared store on a Redis server.
pub struct RedisStore {
    connection: ConnectionManager,
    admit_script: Script,
    inspect_script: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis at `url` (e.g. `redis://127.0.0.1/`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self::from_connection(connection))
    }

    /// Wrap an existing connection manager.
    pub fn from_connection(connection: ConnectionManager) -> Self {
        Self {
            connection,
            admit_script: Script::new(ADMIT_SCRIPT),
            inspect_script: Script::new(INSPECT_SCRIPT),
        }
    }
}

fn outcome(reply: (i64, i64, i64, i64)) -> Result<WindowOutcome, StoreError> {
    let (admitted, count, oldest_ms, now_ms) = reply;
    if count < 0 || now_ms < 0 || !(admitted == 0 || admitted == 1) {
        return Err(StoreError::Protocol(format!(
            "window script returned {:?}",
            reply
        )));
    }

    Ok(WindowOutcome {
        admitted: admitted == 1,
        count: count as u64,
        oldest_ms: u64::try_from(oldest_ms).ok(),
        now_ms: now_ms as u64,
    })
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn execute(&self, tx: WindowTransaction) -> Result<WindowOutcome, StoreError> {
        let mut connection = self.connection.clone();

        let reply: (i64, i64, i64, i64) = match tx {
            WindowTransaction::Admit {
                log_key,
                seq_key,
                window_ms,
                capacity,
                units,
            } => {
                self.admit_script
                    .key(log_key)
                    .key(seq_key)
                    .arg(window_ms)
                    .arg(capacity)
                    .arg(units)
                    .invoke_async(&mut connection)
                    .await?
            }
            WindowTransaction::Inspect { log_key, window_ms } => {
                self.inspect_script
                    .key(log_key)
                    .arg(window_ms)
                    .invoke_async(&mut connection)
                    .await?
            }
        };

        outcome(reply)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut connection = self.connection.clone();
        Ok(connection.get(key).await?)
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        let ttl_ms = (ttl.as_millis() as u64).max(1);
        connection.pset_ex::<_, _, ()>(key, value, ttl_ms).await?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut connection = self.connection.clone();
        connection.del::<_, ()>(keys.to_vec()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_parsing() {
        let parsed = outcome((1, 7, 1_700_000_000_000, 1_700_000_000_500)).unwrap();
        assert!(parsed.admitted);
        assert_eq!(parsed.count, 7);
        assert_eq!(parsed.oldest_ms, Some(1_700_000_000_000));

        let parsed = outcome((0, 0, -1, 5)).unwrap();
        assert_eq!(parsed.oldest_ms, None);

        assert!(matches!(outcome((2, 0, -1, 5)), Err(StoreError::Protocol(_))));
        assert!(matches!(outcome((0, -3, -1, 5)), Err(StoreError::Protocol(_))));
    }
}
