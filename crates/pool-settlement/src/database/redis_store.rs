use super::batch::Batch;
use super::LedgerStore;
use crate::error::Result;
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Script};
use std::collections::HashMap;
use tracing::debug;

// Guards and command preconditions are checked before the first write, since
// a script error leaves earlier writes in place. Types are checked against the
// state the batch starts from. RENAME of a missing key is skipped.
const APPLY_BATCH: &str = r#"
local batch = cjson.decode(ARGV[1])
for _, g in ipairs(batch.guards) do
  if g[1] == 'member' then
    if redis.call('SISMEMBER', g[2], g[3]) == 0 then return 0 end
  elseif g[1] == 'field' then
    local v = redis.call('HGET', g[2], g[3])
    if g[4] == nil then
      if v then return 0 end
    elseif v ~= g[4] then
      return 0
    end
  end
end

local holds = {
  HINCRBY = 'hash', HINCRBYFLOAT = 'hash', HSET = 'hash', HDEL = 'hash',
  ZADD = 'zset', SADD = 'set', SMOVE = 'set'
}
local function wrong_type(key, want)
  local t = redis.call('TYPE', key).ok
  if t ~= 'none' and t ~= want then
    return redis.error_reply('WRONGTYPE ' .. key .. ' holds ' .. t .. ', batch not applied')
  end
end
for _, c in ipairs(batch.commands) do
  local want = holds[c[1]]
  if want then
    local err = wrong_type(c[2], want)
    if not err and c[1] == 'SMOVE' then err = wrong_type(c[3], want) end
    if err then return err end
  end
  if c[1] == 'HINCRBY' or c[1] == 'HINCRBYFLOAT' then
    local v = redis.call('HGET', c[2], c[3])
    if v and ((c[1] == 'HINCRBY' and not string.match(v, '^%-?%d+$')) or not tonumber(v)) then
      return redis.error_reply('NOTNUMBER ' .. c[2] .. ' ' .. c[3] .. ', batch not applied')
    end
  end
end

for _, c in ipairs(batch.commands) do
  if c[1] == 'RENAME' then
    if redis.call('EXISTS', c[2]) == 1 then redis.call('RENAME', c[2], c[3]) end
  else
    redis.call(unpack(c))
  end
end
return 1
"#;

#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
    script: Script,
}

impl RedisStore {
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client.clone()).await?;

        Ok(Self {
            client,
            conn,
            script: Script::new(APPLY_BATCH),
        })
    }

    pub fn connection_info(&self) -> &redis::ConnectionInfo {
        self.client.get_connection_info()
    }
}

#[async_trait]
impl LedgerStore for RedisStore {
    async fn apply(&self, batch: &Batch) -> Result<bool> {
        if batch.is_empty() {
            return Ok(true);
        }

        let payload = batch.to_wire()?;
        let mut conn = self.conn.clone();
        let applied: i64 = self.script.arg(payload).invoke_async(&mut conn).await?;

        debug!(
            "Applied batch of {} commands with {} guards: {}",
            batch.len(),
            batch.guards.len(),
            applied == 1
        );
        Ok(applied == 1)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.hget(key, field).await?;
        Ok(value)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        let values: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(values)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(key).await?;
        Ok(members)
    }
}
