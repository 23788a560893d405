//! A Redis-backed [`Store`] (§4.8, "Reference backend implementations"), feature-gated behind
//! `redis-backend`.
//!
//! Every multi-step sequence (`register`, `unregister`, `sweep_expired`, `report_job_type_usage`)
//! is a single Lua script submitted via `EVAL`, so the read-recompute-write cycle is atomic from
//! Redis's perspective without a client-side transaction. `heartbeat` is a plain `HSET` since it
//! isn't a CAS sequence. Allocation-change notifications are published on `channel:allocations`
//! from inside the same scripts, and a dedicated connection (pub/sub connections can't issue other
//! commands) relays them into the in-process [`tokio::sync::broadcast`] channel this module
//! exposes through [`Store::subscribe`].

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::{aio::ConnectionManager, AsyncCommands, Script};
use tokio::sync::broadcast;

use crate::{backend::Allocation, error::LimiterError, job_type::RatioConfig};

use super::store::{CoordinatorConfig, Store};

fn key(namespace: &str, suffix: &str) -> String {
    format!("{namespace}:{suffix}")
}

fn allocation_channel(namespace: &str) -> String {
    format!("{namespace}:channel:allocations")
}

fn to_backend_err(e: redis::RedisError) -> LimiterError {
    LimiterError::Backend(e.to_string())
}

fn serialize_allocations(allocations: &HashMap<String, Allocation>) -> Result<String, LimiterError> {
    serde_json::to_string(allocations).map_err(|e| LimiterError::Backend(e.to_string()))
}

fn deserialize_allocations(raw: &str) -> Result<HashMap<String, Allocation>, LimiterError> {
    serde_json::from_str(raw).map_err(|e| LimiterError::Backend(e.to_string()))
}

// The `split` helper and allocation-assembly shape below are duplicated textually (Redis has no
// mechanism to load a shared library into an ad-hoc EVAL) across REDISTRIBUTE_SCRIPT, SWEEP_SCRIPT
// and JOB_TYPE_REDISTRIBUTE_SCRIPT.

// Shared by register/unregister: `instances` is a hash of instance_id -> last_heartbeat_ms; this
// recomputes a fair split of `total_capacity`/`total_tpm`/`total_rpm` across the surviving
// members, reapplies whatever per-job-type ratio split is currently recorded in
// `job_type_ratios`, and writes the result to `allocations`, returning the new map as JSON.
// KEYS[1] = instances hash, KEYS[2] = allocations string, KEYS[3] = job_type_ratios hash
// ARGV[1] = total_capacity, ARGV[2] = total_tpm ("" if unset), ARGV[3] = total_rpm ("" if unset)
const REDISTRIBUTE_SCRIPT: &str = r#"
local ids = redis.call('HKEYS', KEYS[1])
table.sort(ids)
local n = #ids
local function split(total)
  local shares = {}
  if n == 0 or total == nil then return shares end
  local base = math.floor(total / n)
  local remainder = total % n
  for i, id in ipairs(ids) do
    shares[id] = base + (i <= remainder and 1 or 0)
  end
  return shares
end
local total_capacity = tonumber(ARGV[1])
local total_tpm = ARGV[2] ~= "" and tonumber(ARGV[2]) or nil
local total_rpm = ARGV[3] ~= "" and tonumber(ARGV[3]) or nil
local slots = split(total_capacity)
local tpm = split(total_tpm)
local rpm = split(total_rpm)

local ratio_pairs = redis.call('HGETALL', KEYS[3])
local job_type_shares = {}
for i = 1, #ratio_pairs, 2 do
  local budget = math.floor(total_capacity * tonumber(ratio_pairs[i + 1]))
  job_type_shares[ratio_pairs[i]] = split(budget)
end

local allocations = {}
for _, id in ipairs(ids) do
  local entry = {
    slots = slots[id] or 0,
    tokens_per_minute = total_tpm ~= nil and tpm[id] or cjson.null,
    requests_per_minute = total_rpm ~= nil and rpm[id] or cjson.null,
  }
  local job_types = {}
  local has_job_types = false
  for jt, shares in pairs(job_type_shares) do
    job_types[jt] = shares[id] or 0
    has_job_types = true
  end
  if has_job_types then
    entry.job_types = job_types
  end
  allocations[id] = entry
end
local encoded = cjson.encode(allocations)
redis.call('SET', KEYS[2], encoded)
return encoded
"#;

// Folds the expiry scan, membership removal and redistribution into one round trip, so no caller
// can observe a heartbeat hash that has already dropped an instance but an allocation map that
// hasn't caught up yet.
// KEYS[1] = instances hash, KEYS[2] = allocations string, KEYS[3] = job_type_ratios hash
// ARGV[1] = now_ms, ARGV[2] = timeout_ms
// ARGV[3] = total_capacity, ARGV[4] = total_tpm (""), ARGV[5] = total_rpm ("")
const SWEEP_SCRIPT: &str = r#"
local now_ms = tonumber(ARGV[1])
local timeout_ms = tonumber(ARGV[2])
local pairs_raw = redis.call('HGETALL', KEYS[1])
local expired = {}
for i = 1, #pairs_raw, 2 do
  local id = pairs_raw[i]
  local last = tonumber(pairs_raw[i + 1])
  if (now_ms - last) >= timeout_ms then
    table.insert(expired, id)
  end
end
if #expired == 0 then
  return cjson.encode({ removed = {}, allocations = redis.call('GET', KEYS[2]) or '{}' })
end
for _, id in ipairs(expired) do
  redis.call('HDEL', KEYS[1], id)
end

local ids = redis.call('HKEYS', KEYS[1])
table.sort(ids)
local n = #ids
local function split(total)
  local shares = {}
  if n == 0 or total == nil then return shares end
  local base = math.floor(total / n)
  local remainder = total % n
  for i, id in ipairs(ids) do
    shares[id] = base + (i <= remainder and 1 or 0)
  end
  return shares
end
local total_capacity = tonumber(ARGV[3])
local total_tpm = ARGV[4] ~= "" and tonumber(ARGV[4]) or nil
local total_rpm = ARGV[5] ~= "" and tonumber(ARGV[5]) or nil
local slots = split(total_capacity)
local tpm = split(total_tpm)
local rpm = split(total_rpm)

local ratio_pairs = redis.call('HGETALL', KEYS[3])
local job_type_shares = {}
for i = 1, #ratio_pairs, 2 do
  local budget = math.floor(total_capacity * tonumber(ratio_pairs[i + 1]))
  job_type_shares[ratio_pairs[i]] = split(budget)
end

local allocations = {}
for _, id in ipairs(ids) do
  local entry = {
    slots = slots[id] or 0,
    tokens_per_minute = total_tpm ~= nil and tpm[id] or cjson.null,
    requests_per_minute = total_rpm ~= nil and rpm[id] or cjson.null,
  }
  local job_types = {}
  local has_job_types = false
  for jt, shares in pairs(job_type_shares) do
    job_types[jt] = shares[id] or 0
    has_job_types = true
  end
  if has_job_types then
    entry.job_types = job_types
  end
  allocations[id] = entry
end
local encoded = cjson.encode(allocations)
redis.call('SET', KEYS[2], encoded)
return cjson.encode({ removed = expired, allocations = encoded })
"#;

// Reported by each instance on its own rebalance cadence (§4.8, `resources_per_job`): records this
// instance's latest per-job-type in-flight snapshot, aggregates every instance's last-reported
// snapshot into a per-job-type load, runs one donor/receiver rebalance pass over the global ratio
// (mirroring the local slot allocator's rebalance arithmetic, done here in Lua since the recompute
// has to happen inside the atomic round trip), then redistributes exactly like REDISTRIBUTE_SCRIPT.
// KEYS[1] = job_type_usage hash ("<instance_id>|<job_type>" -> count)
// KEYS[2] = job_type_ratios hash (job_type -> ratio)
// KEYS[3] = instances hash
// KEYS[4] = allocations string
// ARGV[1] = instance_id
// ARGV[2] = in_flight JSON ({job_type: count})
// ARGV[3] = resources_per_job JSON ({job_type: {initial_value, flexible}})
// ARGV[4] = total_capacity, ARGV[5] = total_tpm (""), ARGV[6] = total_rpm ("")
// ARGV[7..10] = low_threshold, high_threshold, min_ratio, max_adjustment
const JOB_TYPE_REDISTRIBUTE_SCRIPT: &str = r#"
local instance_id = ARGV[1]
local in_flight = cjson.decode(ARGV[2])
local resources_per_job = cjson.decode(ARGV[3])
local total_capacity = tonumber(ARGV[4])
local total_tpm = ARGV[5] ~= "" and tonumber(ARGV[5]) or nil
local total_rpm = ARGV[6] ~= "" and tonumber(ARGV[6]) or nil
local low_threshold = tonumber(ARGV[7])
local high_threshold = tonumber(ARGV[8])
local min_ratio = tonumber(ARGV[9])
local max_adjustment = tonumber(ARGV[10])

for jt, count in pairs(in_flight) do
  redis.call('HSET', KEYS[1], instance_id .. '|' .. jt, count)
end

local ratio_pairs = redis.call('HGETALL', KEYS[2])
local ratios = {}
for i = 1, #ratio_pairs, 2 do
  ratios[ratio_pairs[i]] = tonumber(ratio_pairs[i + 1])
end
local has_ratios = false
for _ in pairs(ratios) do
  has_ratios = true
  break
end
if not has_ratios then
  local explicit_total = 0.0
  local unset_count = 0
  for jt, cfg in pairs(resources_per_job) do
    if cfg.initial_value ~= nil and cfg.initial_value ~= cjson.null then
      explicit_total = explicit_total + cfg.initial_value
    else
      unset_count = unset_count + 1
    end
  end
  local remaining = math.max(1.0 - explicit_total, 0.0)
  local share_per_unset = unset_count > 0 and (remaining / unset_count) or 0.0
  local sum = 0.0
  for jt, cfg in pairs(resources_per_job) do
    local v = (cfg.initial_value ~= nil and cfg.initial_value ~= cjson.null) and cfg.initial_value or share_per_unset
    ratios[jt] = v
    sum = sum + v
  end
  if sum > 0.0 then
    for jt, v in pairs(ratios) do
      ratios[jt] = v / sum
    end
  end
end

local usage_pairs = redis.call('HGETALL', KEYS[1])
local aggregated = {}
for i = 1, #usage_pairs, 2 do
  local field = usage_pairs[i]
  local sep = string.find(field, '|', 1, true)
  local jt = string.sub(field, sep + 1)
  aggregated[jt] = (aggregated[jt] or 0) + tonumber(usage_pairs[i + 1])
end

local loads = {}
for jt, _ in pairs(resources_per_job) do
  local budget = math.floor(total_capacity * (ratios[jt] or 0.0))
  local count = aggregated[jt] or 0
  loads[jt] = budget == 0 and 0.0 or (count / budget)
end

local donor_contributions = {}
local total_contribution = 0.0
for jt, cfg in pairs(resources_per_job) do
  if cfg.flexible then
    local ratio = ratios[jt] or 0.0
    local load = loads[jt] or 0.0
    if load < low_threshold and ratio > min_ratio then
      local contribution = math.min(ratio - min_ratio, max_adjustment) * (1.0 - load)
      donor_contributions[jt] = contribution
      total_contribution = total_contribution + contribution
    end
  end
end

local receiver_load_sum = 0.0
for jt, cfg in pairs(resources_per_job) do
  if cfg.flexible and (loads[jt] or 0.0) > high_threshold then
    receiver_load_sum = receiver_load_sum + loads[jt]
  end
end

local updated = {}
for jt, cfg in pairs(resources_per_job) do
  if not cfg.flexible then
    updated[jt] = ratios[jt] or 0.0
  else
    local ratio = ratios[jt] or 0.0
    if donor_contributions[jt] ~= nil then
      ratio = ratio - donor_contributions[jt]
    elseif total_contribution > 0.0 and receiver_load_sum > 0.0 then
      local load = loads[jt] or 0.0
      if load > high_threshold then
        ratio = ratio + total_contribution * (load / receiver_load_sum)
      end
    end
    updated[jt] = ratio
  end
end
local sum = 0.0
for _, v in pairs(updated) do
  sum = sum + v
end
if sum > 0.0 then
  for jt, v in pairs(updated) do
    updated[jt] = v / sum
  end
end

redis.call('DEL', KEYS[2])
for jt, v in pairs(updated) do
  redis.call('HSET', KEYS[2], jt, tostring(v))
end

local ids = redis.call('HKEYS', KEYS[3])
table.sort(ids)
local n = #ids
local function split(total)
  local shares = {}
  if n == 0 or total == nil then return shares end
  local base = math.floor(total / n)
  local remainder = total % n
  for i, id in ipairs(ids) do
    shares[id] = base + (i <= remainder and 1 or 0)
  end
  return shares
end
local slots = split(total_capacity)
local tpm = split(total_tpm)
local rpm = split(total_rpm)
local job_type_shares = {}
for jt, ratio in pairs(updated) do
  job_type_shares[jt] = split(math.floor(total_capacity * ratio))
end

local allocations = {}
for _, id in ipairs(ids) do
  local entry = {
    slots = slots[id] or 0,
    tokens_per_minute = total_tpm ~= nil and tpm[id] or cjson.null,
    requests_per_minute = total_rpm ~= nil and rpm[id] or cjson.null,
  }
  local job_types = {}
  local has_job_types = false
  for jt, shares in pairs(job_type_shares) do
    job_types[jt] = shares[id] or 0
    has_job_types = true
  end
  if has_job_types then
    entry.job_types = job_types
  end
  allocations[id] = entry
end
local encoded = cjson.encode(allocations)
redis.call('SET', KEYS[4], encoded)
return encoded
"#;

/// A [`Store`] backed by a Redis server, using Lua scripts for atomic multi-step sequences and a
/// dedicated pub/sub connection for allocation-change notifications.
pub struct RedisStore {
    conn: ConnectionManager,
    namespace: String,
    notify: broadcast::Sender<HashMap<String, Allocation>>,
    _pubsub_task: tokio::task::JoinHandle<()>,
}

impl RedisStore {
    /// Connect to `redis_url` and start relaying `channel:allocations` notifications.
    pub async fn connect(redis_url: &str, namespace: impl Into<String>) -> Result<Self, LimiterError> {
        let namespace = namespace.into();
        let client = redis::Client::open(redis_url).map_err(to_backend_err)?;
        let conn = ConnectionManager::new(client.clone()).await.map_err(to_backend_err)?;

        let (notify, _rx) = broadcast::channel(64);
        let pubsub_task = {
            let notify = notify.clone();
            let channel = allocation_channel(&namespace);
            tokio::spawn(async move {
                loop {
                    let Ok(mut pubsub) = client.get_async_pubsub().await else {
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        continue;
                    };
                    if pubsub.subscribe(&channel).await.is_err() {
                        continue;
                    }
                    let mut stream = pubsub.on_message();
                    while let Some(msg) = stream.next().await {
                        if let Ok(payload) = msg.get_payload::<String>() {
                            if let Ok(allocations) = deserialize_allocations(&payload) {
                                let _ = notify.send(allocations);
                            }
                        }
                    }
                    // Connection dropped; on disconnect we resubscribe and, per §9's "Pub/sub
                    // liveness" note, rely on the coordinator's next `current_allocations` fetch
                    // to catch up on anything missed in between.
                }
            })
        };

        Ok(Self {
            conn,
            namespace,
            notify,
            _pubsub_task: pubsub_task,
        })
    }

    async fn publish(&self, allocations: &HashMap<String, Allocation>) -> Result<(), LimiterError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .publish(allocation_channel(&self.namespace), serialize_allocations(allocations)?)
            .await
            .map_err(to_backend_err)?;
        Ok(())
    }

    async fn redistribute(&self, config: &CoordinatorConfig) -> Result<HashMap<String, Allocation>, LimiterError> {
        let mut conn = self.conn.clone();
        let encoded: String = Script::new(REDISTRIBUTE_SCRIPT)
            .key(key(&self.namespace, "instances"))
            .key(key(&self.namespace, "allocations"))
            .key(key(&self.namespace, "job_type_ratios"))
            .arg(config.total_capacity)
            .arg(config.total_tokens_per_minute.map(|v| v.to_string()).unwrap_or_default())
            .arg(config.total_requests_per_minute.map(|v| v.to_string()).unwrap_or_default())
            .invoke_async(&mut conn)
            .await
            .map_err(to_backend_err)?;
        let allocations = deserialize_allocations(&encoded)?;
        self.publish(&allocations).await?;
        Ok(allocations)
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn register(
        &self,
        instance_id: &str,
        now_ms: u64,
        config: &CoordinatorConfig,
    ) -> Result<HashMap<String, Allocation>, LimiterError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(key(&self.namespace, "instances"), instance_id, now_ms)
            .await
            .map_err(to_backend_err)?;
        self.redistribute(config).await
    }

    async fn unregister(
        &self,
        instance_id: &str,
        config: &CoordinatorConfig,
    ) -> Result<HashMap<String, Allocation>, LimiterError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hdel(key(&self.namespace, "instances"), instance_id)
            .await
            .map_err(to_backend_err)?;
        self.redistribute(config).await
    }

    async fn heartbeat(&self, instance_id: &str, now_ms: u64) -> Result<(), LimiterError> {
        let mut conn = self.conn.clone();
        conn.hset(key(&self.namespace, "instances"), instance_id, now_ms)
            .await
            .map_err(to_backend_err)
    }

    async fn sweep_expired(
        &self,
        now_ms: u64,
        timeout_ms: u64,
        config: &CoordinatorConfig,
    ) -> Result<(Vec<String>, HashMap<String, Allocation>), LimiterError> {
        #[derive(serde::Deserialize)]
        struct SweepResult {
            removed: Vec<String>,
            allocations: String,
        }

        let mut conn = self.conn.clone();
        let encoded: String = Script::new(SWEEP_SCRIPT)
            .key(key(&self.namespace, "instances"))
            .key(key(&self.namespace, "allocations"))
            .key(key(&self.namespace, "job_type_ratios"))
            .arg(now_ms)
            .arg(timeout_ms)
            .arg(config.total_capacity)
            .arg(config.total_tokens_per_minute.map(|v| v.to_string()).unwrap_or_default())
            .arg(config.total_requests_per_minute.map(|v| v.to_string()).unwrap_or_default())
            .invoke_async(&mut conn)
            .await
            .map_err(to_backend_err)?;
        let result: SweepResult = serde_json::from_str(&encoded).map_err(|e| LimiterError::Backend(e.to_string()))?;
        let allocations = deserialize_allocations(&result.allocations)?;
        if !result.removed.is_empty() {
            self.publish(&allocations).await?;
        }
        Ok((result.removed, allocations))
    }

    async fn current_allocations(&self) -> Result<HashMap<String, Allocation>, LimiterError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(key(&self.namespace, "allocations"))
            .await
            .map_err(to_backend_err)?;
        match raw {
            Some(raw) => deserialize_allocations(&raw),
            None => Ok(HashMap::new()),
        }
    }

    async fn report_job_type_usage(
        &self,
        instance_id: &str,
        in_flight: &HashMap<String, u64>,
        config: &CoordinatorConfig,
    ) -> Result<HashMap<String, Allocation>, LimiterError> {
        let Some(resources_per_job) = config.resources_per_job.as_ref() else {
            return self.current_allocations().await;
        };
        if resources_per_job.is_empty() {
            return self.current_allocations().await;
        }

        let in_flight_json = serde_json::to_string(in_flight).map_err(|e| LimiterError::Backend(e.to_string()))?;
        let resources_json: HashMap<&String, &RatioConfig> = resources_per_job.iter().collect();
        let resources_json =
            serde_json::to_string(&resources_json).map_err(|e| LimiterError::Backend(e.to_string()))?;

        let mut conn = self.conn.clone();
        let encoded: String = Script::new(JOB_TYPE_REDISTRIBUTE_SCRIPT)
            .key(key(&self.namespace, "job_type_usage"))
            .key(key(&self.namespace, "job_type_ratios"))
            .key(key(&self.namespace, "instances"))
            .key(key(&self.namespace, "allocations"))
            .arg(instance_id)
            .arg(in_flight_json)
            .arg(resources_json)
            .arg(config.total_capacity)
            .arg(config.total_tokens_per_minute.map(|v| v.to_string()).unwrap_or_default())
            .arg(config.total_requests_per_minute.map(|v| v.to_string()).unwrap_or_default())
            .arg(config.rebalance.low_threshold)
            .arg(config.rebalance.high_threshold)
            .arg(config.rebalance.min_ratio)
            .arg(config.rebalance.max_adjustment)
            .invoke_async(&mut conn)
            .await
            .map_err(to_backend_err)?;
        let allocations = deserialize_allocations(&encoded)?;
        self.publish(&allocations).await?;
        Ok(allocations)
    }

    fn subscribe(&self) -> broadcast::Receiver<HashMap<String, Allocation>> {
        self.notify.subscribe()
    }
}
