use crate::repository::{
    sort_pre_stubs, sort_stubs, InsertOutcome, NewStub, StubRepository, WriteOutcome,
};
use crate::stub::{ContentHash, MatcherKey, PreStub, PreStubId, Stub, StubId, StubPayload};
use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use redis::{Commands, Connection, ErrorKind, RedisError, Script};
use std::collections::BTreeSet;
use std::sync::Mutex;

/// Redis implementation of StubRepository using a synchronous blocking client
///
/// Every conditional write (matcher-unique insert, content-hash
/// compare-and-set, empty-scenario delete) runs as a server-side Lua script,
/// so the guarantees hold across several server instances sharing one store.
///
/// # Key layout
///
/// - `{prefix}scenarios`: set of scenario names
/// - `{prefix}scenario:{name}:stubs`, `{prefix}scenario:{name}:prestubs`:
///   lists of ids in insertion order
/// - `{prefix}scenario:{name}:matchers`: hash of matcher key to stub id
/// - `{prefix}stub:{id}`: hash with `scenario`, `matcher`, `payload`, `content_hash`
/// - `{prefix}prestub:{id}`: hash with `scenario`, `payload`, `fingerprint`
/// - `{prefix}seq`: id counter shared by stubs and pre-stubs
///
/// Scripts touch record keys derived inside the script, so this layout
/// targets a single Redis node rather than Redis Cluster.
struct RedisConnectionManager {
    client: redis::Client,
}

impl RedisConnectionManager {
    fn new(client: redis::Client) -> Self {
        Self { client }
    }
}

impl r2d2::ManageConnection for RedisConnectionManager {
    type Connection = Mutex<Connection>;
    type Error = RedisError;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let conn = self.client.get_connection()?;
        Ok(Mutex::new(conn))
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        let conn = conn
            .get_mut()
            .map_err(|_| RedisError::from((ErrorKind::ClientError, "connection mutex poisoned")))?;
        redis::cmd("PING").query(conn)
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

const INSERT_STUB: &str = r#"
if redis.call('HEXISTS', KEYS[1], ARGV[1]) == 1 then
  return 0
end
local id = redis.call('INCR', KEYS[4])
redis.call('HSET', ARGV[3] .. id,
  'scenario', ARGV[2], 'matcher', ARGV[1], 'payload', ARGV[4], 'content_hash', ARGV[5])
redis.call('HSET', KEYS[1], ARGV[1], id)
redis.call('RPUSH', KEYS[2], id)
redis.call('SADD', KEYS[3], ARGV[2])
return id
"#;

const UPDATE_STUB_IF_HASH: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return -1
end
local current = redis.call('HGET', KEYS[1], 'content_hash') or ''
if current ~= ARGV[1] then
  return 0
end
redis.call('HSET', KEYS[1], 'payload', ARGV[2], 'content_hash', ARGV[3])
return 1
"#;

const INSERT_PRE_STUB: &str = r#"
local id = redis.call('INCR', KEYS[3])
redis.call('HSET', ARGV[2] .. id, 'scenario', ARGV[1], 'payload', ARGV[3], 'fingerprint', ARGV[4])
redis.call('RPUSH', KEYS[1], id)
redis.call('SADD', KEYS[2], ARGV[1])
return id
"#;

const DELETE_STUB: &str = r#"
if redis.call('HGET', KEYS[3], ARGV[2]) == ARGV[1] then
  redis.call('HDEL', KEYS[3], ARGV[2])
end
redis.call('LREM', KEYS[2], 0, ARGV[1])
return redis.call('DEL', KEYS[1])
"#;

const DELETE_PRE_STUB: &str = r#"
redis.call('LREM', KEYS[2], 0, ARGV[1])
return redis.call('DEL', KEYS[1])
"#;

const DELETE_ALL_FOR_SCENARIO: &str = r#"
local stubs = redis.call('LRANGE', KEYS[1], 0, -1)
for _, id in ipairs(stubs) do
  redis.call('DEL', ARGV[1] .. id)
end
local pre_stubs = redis.call('LRANGE', KEYS[2], 0, -1)
for _, id in ipairs(pre_stubs) do
  redis.call('DEL', ARGV[2] .. id)
end
redis.call('DEL', KEYS[1], KEYS[2], KEYS[3])
redis.call('SREM', KEYS[4], ARGV[3])
return {#stubs, #pre_stubs}
"#;

const DELETE_SCENARIO_IF_EMPTY: &str = r#"
if redis.call('LLEN', KEYS[1]) > 0 then
  return 0
end
redis.call('DEL', KEYS[3])
return redis.call('SREM', KEYS[2], ARGV[1])
"#;

struct Scripts {
    insert_stub: Script,
    update_stub_if_hash: Script,
    insert_pre_stub: Script,
    delete_stub: Script,
    delete_pre_stub: Script,
    delete_all_for_scenario: Script,
    delete_scenario_if_empty: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            insert_stub: Script::new(INSERT_STUB),
            update_stub_if_hash: Script::new(UPDATE_STUB_IF_HASH),
            insert_pre_stub: Script::new(INSERT_PRE_STUB),
            delete_stub: Script::new(DELETE_STUB),
            delete_pre_stub: Script::new(DELETE_PRE_STUB),
            delete_all_for_scenario: Script::new(DELETE_ALL_FOR_SCENARIO),
            delete_scenario_if_empty: Script::new(DELETE_SCENARIO_IF_EMPTY),
        }
    }
}

/// Stored hash fields of one stub: matcher, payload, content hash
type StubRow = (Option<String>, Option<String>, Option<String>);

pub struct RedisStubRepository {
    pool: r2d2::Pool<RedisConnectionManager>,
    key_prefix: String,
    scripts: Scripts,
}

impl RedisStubRepository {
    /// Create a new Redis stub repository
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g. "redis://localhost:6379")
    /// * `pool_size` - Connection pool size
    /// * `key_prefix` - Prefix for all keys (e.g. "stubo:")
    pub fn new(url: &str, pool_size: usize, key_prefix: String) -> Result<Self> {
        let client = redis::Client::open(url).context("Failed to parse Redis URL")?;

        let manager = RedisConnectionManager::new(client);

        let pool = r2d2::Pool::builder()
            .max_size(pool_size as u32)
            .connection_timeout(std::time::Duration::from_secs(5))
            .build(manager)
            .context("Failed to create Redis connection pool")?;

        let repo = Self {
            pool,
            key_prefix,
            scripts: Scripts::load(),
        };

        // Test connection with PING
        let _: String = repo.with_conn("PING", |conn| redis::cmd("PING").query(conn))?;

        tracing::info!(
            "Connected to Redis with prefix={}, pool_size={}",
            repo.key_prefix,
            pool_size
        );

        Ok(repo)
    }

    fn with_conn<T>(
        &self,
        op: &str,
        f: impl FnOnce(&mut Connection) -> redis::RedisResult<T>,
    ) -> Result<T> {
        let pooled = self
            .pool
            .get()
            .context("Failed to get Redis connection from pool")?;
        let mut conn = pooled
            .lock()
            .map_err(|_| anyhow!("Redis connection mutex poisoned"))?;
        f(&mut *conn).with_context(|| format!("Redis {op} failed"))
    }

    fn scenarios_key(&self) -> String {
        format!("{}scenarios", self.key_prefix)
    }

    fn stubs_key(&self, scenario: &str) -> String {
        format!("{}scenario:{}:stubs", self.key_prefix, scenario)
    }

    fn pre_stubs_key(&self, scenario: &str) -> String {
        format!("{}scenario:{}:prestubs", self.key_prefix, scenario)
    }

    fn matchers_key(&self, scenario: &str) -> String {
        format!("{}scenario:{}:matchers", self.key_prefix, scenario)
    }

    fn stub_prefix(&self) -> String {
        format!("{}stub:", self.key_prefix)
    }

    fn pre_stub_prefix(&self) -> String {
        format!("{}prestub:", self.key_prefix)
    }

    fn stub_key(&self, id: StubId) -> String {
        format!("{}{}", self.stub_prefix(), id)
    }

    fn pre_stub_key(&self, id: PreStubId) -> String {
        format!("{}{}", self.pre_stub_prefix(), id)
    }

    fn seq_key(&self) -> String {
        format!("{}seq", self.key_prefix)
    }

    fn load_stubs(&self, scenario: &str, ids: &[StubId]) -> Result<Vec<Stub>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<StubRow> = self.with_conn("HMGET stubs", |conn| {
            let mut pipe = redis::pipe();
            for id in ids {
                pipe.cmd("HMGET")
                    .arg(self.stub_key(*id))
                    .arg("matcher")
                    .arg("payload")
                    .arg("content_hash");
            }
            pipe.query(conn)
        })?;

        let mut stubs = Vec::with_capacity(ids.len());
        for (id, row) in ids.iter().zip(rows) {
            // Skip records deleted between the index read and the fetch
            if let (Some(matcher), Some(payload), hash) = row {
                let payload: StubPayload = serde_json::from_str(&payload)
                    .with_context(|| format!("Failed to parse stub {id} from Redis"))?;
                stubs.push(Stub::with_stored_hash(
                    *id,
                    scenario,
                    MatcherKey::new(matcher),
                    payload,
                    decode_hash(hash),
                ));
            }
        }
        Ok(stubs)
    }

    fn stub_ids(&self, scenario: &str) -> Result<Vec<StubId>> {
        let key = self.stubs_key(scenario);
        let ids: Vec<u64> = self.with_conn("LRANGE", |conn| conn.lrange(&key, 0, -1))?;
        Ok(ids.into_iter().map(StubId).collect())
    }

    fn delete_stub(&self, scenario: &str, stub: &Stub) -> Result<usize> {
        self.with_conn("EVAL delete_stub", |conn| {
            self.scripts
                .delete_stub
                .key(self.stub_key(stub.id))
                .key(self.stubs_key(scenario))
                .key(self.matchers_key(scenario))
                .arg(stub.id.0)
                .arg(stub.matcher.as_str())
                .invoke(conn)
        })
    }
}

fn encode_hash(hash: Option<&ContentHash>) -> &str {
    hash.map_or("", ContentHash::as_str)
}

fn decode_hash(raw: Option<String>) -> Option<ContentHash> {
    raw.filter(|s| !s.is_empty()).map(ContentHash::new)
}

fn encode_payload(payload: &StubPayload) -> Result<String> {
    serde_json::to_string(payload).context("Failed to serialize payload to JSON")
}

impl StubRepository for RedisStubRepository {
    fn list_scenarios(&self) -> Result<Vec<String>> {
        let key = self.scenarios_key();
        let mut names: Vec<String> = self.with_conn("SMEMBERS", |conn| conn.smembers(&key))?;
        names.sort();
        Ok(names)
    }

    fn list_record_owners(&self) -> Result<Vec<String>> {
        let mut owners: BTreeSet<String> = self.list_scenarios()?.into_iter().collect();
        // Redis drops empty lists, so an existing list key means live records
        let scenario_prefix = format!("{}scenario:", self.key_prefix);
        for suffix in [":stubs", ":prestubs"] {
            let pattern = format!("{scenario_prefix}*{suffix}");
            let keys: Vec<String> = self.with_conn("SCAN", |conn| {
                conn.scan_match::<_, String>(&pattern)
                    .map(|keys| keys.collect())
            })?;
            owners.extend(keys.iter().filter_map(|key| {
                key.strip_prefix(&scenario_prefix)?
                    .strip_suffix(suffix)
                    .map(str::to_string)
            }));
        }
        Ok(owners.into_iter().collect())
    }

    fn scenario_exists(&self, scenario: &str) -> Result<bool> {
        let key = self.scenarios_key();
        self.with_conn("SISMEMBER", |conn| conn.sismember(&key, scenario))
    }

    fn create_scenario(&self, scenario: &str) -> Result<bool> {
        let key = self.scenarios_key();
        let added: usize = self.with_conn("SADD", |conn| conn.sadd(&key, scenario))?;
        Ok(added == 1)
    }

    fn list_stubs(&self, scenario: &str) -> Result<Vec<Stub>> {
        let ids = self.stub_ids(scenario)?;
        let mut stubs = self.load_stubs(scenario, &ids)?;
        sort_stubs(&mut stubs);
        Ok(stubs)
    }

    fn list_pre_stubs(&self, scenario: &str) -> Result<Vec<PreStub>> {
        let key = self.pre_stubs_key(scenario);
        let ids: Vec<u64> = self.with_conn("LRANGE", |conn| conn.lrange(&key, 0, -1))?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows: Vec<(Option<String>, Option<String>)> =
            self.with_conn("HMGET prestubs", |conn| {
                let mut pipe = redis::pipe();
                for id in &ids {
                    pipe.cmd("HMGET")
                        .arg(self.pre_stub_key(PreStubId(*id)))
                        .arg("payload")
                        .arg("fingerprint");
                }
                pipe.query(conn)
            })?;

        let mut pre_stubs = Vec::with_capacity(ids.len());
        for (id, (payload, fingerprint)) in ids.into_iter().zip(rows) {
            let Some(payload) = payload else {
                continue;
            };
            let payload: StubPayload = serde_json::from_str(&payload)
                .with_context(|| format!("Failed to parse pre-stub {id} from Redis"))?;
            pre_stubs.push(PreStub {
                id: PreStubId(id),
                scenario: scenario.to_string(),
                fingerprint: decode_hash(fingerprint),
                payload,
            });
        }
        sort_pre_stubs(&mut pre_stubs);
        Ok(pre_stubs)
    }

    fn count_stubs(&self, scenario: &str) -> Result<usize> {
        let key = self.stubs_key(scenario);
        self.with_conn("LLEN", |conn| conn.llen(&key))
    }

    fn count_pre_stubs(&self, scenario: &str) -> Result<usize> {
        let key = self.pre_stubs_key(scenario);
        self.with_conn("LLEN", |conn| conn.llen(&key))
    }

    fn find_by_matcher(&self, scenario: &str, matcher: &MatcherKey) -> Result<Option<Stub>> {
        let key = self.matchers_key(scenario);
        let id: Option<u64> = self.with_conn("HGET", |conn| conn.hget(&key, matcher.as_str()))?;
        let Some(id) = id else {
            return Ok(None);
        };
        Ok(self.load_stubs(scenario, &[StubId(id)])?.into_iter().next())
    }

    fn insert_stub(&self, scenario: &str, stub: NewStub) -> Result<InsertOutcome> {
        let payload = encode_payload(&stub.payload)?;
        let id: u64 = self.with_conn("EVAL insert_stub", |conn| {
            self.scripts
                .insert_stub
                .key(self.matchers_key(scenario))
                .key(self.stubs_key(scenario))
                .key(self.scenarios_key())
                .key(self.seq_key())
                .arg(stub.matcher.as_str())
                .arg(scenario)
                .arg(self.stub_prefix())
                .arg(&payload)
                .arg(encode_hash(stub.content_hash.as_ref()))
                .invoke(conn)
        })?;

        if id == 0 {
            Ok(InsertOutcome::MatcherTaken)
        } else {
            Ok(InsertOutcome::Inserted(StubId(id)))
        }
    }

    fn update_stub_payload(
        &self,
        id: StubId,
        expected: Option<&ContentHash>,
        payload: StubPayload,
        content_hash: Option<ContentHash>,
    ) -> Result<WriteOutcome> {
        let payload = encode_payload(&payload)?;
        let result: i64 = self.with_conn("EVAL update_stub_if_hash", |conn| {
            self.scripts
                .update_stub_if_hash
                .key(self.stub_key(id))
                .arg(encode_hash(expected))
                .arg(&payload)
                .arg(encode_hash(content_hash.as_ref()))
                .invoke(conn)
        })?;

        Ok(match result {
            1 => WriteOutcome::Applied,
            0 => WriteOutcome::Conflict,
            _ => WriteOutcome::Missing,
        })
    }

    fn insert_pre_stub(
        &self,
        scenario: &str,
        payload: StubPayload,
        fingerprint: Option<ContentHash>,
    ) -> Result<PreStubId> {
        let payload = encode_payload(&payload)?;
        let id: u64 = self.with_conn("EVAL insert_pre_stub", |conn| {
            self.scripts
                .insert_pre_stub
                .key(self.pre_stubs_key(scenario))
                .key(self.scenarios_key())
                .key(self.seq_key())
                .arg(scenario)
                .arg(self.pre_stub_prefix())
                .arg(&payload)
                .arg(encode_hash(fingerprint.as_ref()))
                .invoke(conn)
        })?;
        Ok(PreStubId(id))
    }

    fn delete_pre_stub(&self, id: PreStubId) -> Result<bool> {
        let key = self.pre_stub_key(id);
        let scenario: Option<String> = self.with_conn("HGET", |conn| conn.hget(&key, "scenario"))?;
        let Some(scenario) = scenario else {
            return Ok(false);
        };
        let deleted: usize = self.with_conn("EVAL delete_pre_stub", |conn| {
            self.scripts
                .delete_pre_stub
                .key(&key)
                .key(self.pre_stubs_key(&scenario))
                .arg(id.0)
                .invoke(conn)
        })?;
        Ok(deleted == 1)
    }

    fn delete_stubs_older_than(&self, scenario: &str, cutoff: NaiveDate) -> Result<usize> {
        let mut deleted = 0;
        for stub in self.list_stubs(scenario)? {
            if stub.recorded() <= cutoff {
                deleted += self.delete_stub(scenario, &stub)?;
            }
        }
        Ok(deleted)
    }

    fn delete_pre_stubs_older_than(&self, scenario: &str, cutoff: NaiveDate) -> Result<usize> {
        let mut deleted = 0;
        for pre_stub in self.list_pre_stubs(scenario)? {
            if pre_stub.recorded() <= cutoff && self.delete_pre_stub(pre_stub.id)? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    fn delete_all_for_scenario(&self, scenario: &str) -> Result<(usize, usize)> {
        self.with_conn("EVAL delete_all_for_scenario", |conn| {
            self.scripts
                .delete_all_for_scenario
                .key(self.stubs_key(scenario))
                .key(self.pre_stubs_key(scenario))
                .key(self.matchers_key(scenario))
                .key(self.scenarios_key())
                .arg(self.stub_prefix())
                .arg(self.pre_stub_prefix())
                .arg(scenario)
                .invoke(conn)
        })
    }

    fn delete_scenario_if_empty(&self, scenario: &str) -> Result<bool> {
        let removed: usize = self.with_conn("EVAL delete_scenario_if_empty", |conn| {
            self.scripts
                .delete_scenario_if_empty
                .key(self.stubs_key(scenario))
                .key(self.scenarios_key())
                .key(self.matchers_key(scenario))
                .arg(scenario)
                .invoke(conn)
        })?;
        Ok(removed == 1)
    }
}
