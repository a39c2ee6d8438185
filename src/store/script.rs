//! Server-side scripts and their argument encoding.

use sha1::{Digest, Sha1};

use super::{StoreError, StoreResult};

/// A script the store runs atomically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Script {
    /// Stable name, used by stores that execute scripts natively.
    pub name: &'static str,
    /// Lua source for stores with an embedded interpreter.
    pub source: &'static str,
}

impl Script {
    /// Hex SHA-1 of the source, as used by `EVALSHA`.
    pub fn digest(&self) -> String {
        Sha1::digest(self.source.as_bytes())
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

/// Check both windows and, if either has room, count the event.
///
/// Returns 1 on admission and 0 on rejection. Argument layout is
/// described by [`AdmitArgs`].
pub const ADMIT: Script = Script {
    name: "admit",
    source: r#"
local key = KEYS[1]
local threshold = tonumber(ARGV[1])
local burst_threshold = tonumber(ARGV[2])
local increment = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])
local current = ARGV[5]
local window_len = tonumber(ARGV[6])
local burst_len = tonumber(ARGV[7])
local evict_len = tonumber(ARGV[8])

local window_from = 9
local burst_from = window_from + window_len
local evict_from = burst_from + burst_len

local function total(from, len)
  if len == 0 then
    return 0
  end
  local sum = 0
  local values = redis.call('HMGET', key, unpack(ARGV, from, from + len - 1))
  for i = 1, len do
    sum = sum + (tonumber(values[i]) or 0)
  end
  return sum
end

local admitted = false
if burst_len > 0 and total(burst_from, burst_len) < burst_threshold then
  admitted = true
elseif total(window_from, window_len) < threshold then
  admitted = true
end

if not admitted then
  return 0
end

redis.call('HINCRBY', key, current, increment)
if evict_len > 0 then
  redis.call('HDEL', key, unpack(ARGV, evict_from, evict_from + evict_len - 1))
end
redis.call('EXPIRE', key, ttl)
return 1
"#,
};

/// Arguments of the [`ADMIT`] script.
///
/// Encoded as `threshold, burst_threshold, increment, ttl, current,
/// len(window), len(burst), len(evict)` followed by the window, burst and
/// evict field lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmitArgs {
    pub threshold: u64,
    pub burst_threshold: u64,
    pub increment: i64,
    pub ttl: u64,
    pub current: String,
    pub window: Vec<String>,
    /// Empty when no burst window is configured.
    pub burst: Vec<String>,
    pub evict: Vec<String>,
}

impl AdmitArgs {
    pub fn encode(&self) -> Vec<String> {
        let mut args = vec![
            self.threshold.to_string(),
            self.burst_threshold.to_string(),
            self.increment.to_string(),
            self.ttl.to_string(),
            self.current.clone(),
            self.window.len().to_string(),
            self.burst.len().to_string(),
            self.evict.len().to_string(),
        ];
        args.extend(self.window.iter().cloned());
        args.extend(self.burst.iter().cloned());
        args.extend(self.evict.iter().cloned());
        args
    }

    pub fn decode(args: &[String]) -> StoreResult<Self> {
        if args.len() < 8 {
            return Err(StoreError::Protocol(format!(
                "admit expects at least 8 arguments, got {}",
                args.len()
            )));
        }

        let window_len: usize = parse_arg(&args[5])?;
        let burst_len: usize = parse_arg(&args[6])?;
        let evict_len: usize = parse_arg(&args[7])?;
        let lists = &args[8..];
        let expected = window_len
            .checked_add(burst_len)
            .and_then(|n| n.checked_add(evict_len))
            .ok_or_else(|| StoreError::Protocol("admit field list lengths overflow".into()))?;
        if lists.len() != expected {
            return Err(StoreError::Protocol(format!(
                "admit field lists have {} entries, header says {}",
                lists.len(),
                expected
            )));
        }

        let (window, rest) = lists.split_at(window_len);
        let (burst, evict) = rest.split_at(burst_len);

        Ok(Self {
            threshold: parse_arg(&args[0])?,
            burst_threshold: parse_arg(&args[1])?,
            increment: parse_arg(&args[2])?,
            ttl: parse_arg(&args[3])?,
            current: args[4].clone(),
            window: window.to_vec(),
            burst: burst.to_vec(),
            evict: evict.to_vec(),
        })
    }
}

fn parse_arg<T: std::str::FromStr>(arg: &str) -> StoreResult<T> {
    arg.parse()
        .map_err(|_| StoreError::Protocol(format!("invalid script argument: {:?}", arg)))
}
