//! Lua scripts for atomic family transitions in Redis.
//!
//! Scripts only touch scalar hash fields (`status`, `current_generation`,
//! `expires_at`, `revoked_at`). The JSON `record` field is written once by
//! the client and never re-encoded server side.
//!
//! Return codes:
//! - 1: applied
//! - 0: stale (family moved on, or was revoked)
//! - 2: already applied (revoke only)
//! - -2: family missing

/// Conditionally supersede the current generation and install the next.
///
/// Arguments:
/// - KEYS[1]: Family hash (`tl:family:{id}`)
/// - KEYS[2]: Expected current generation hash
/// - KEYS[3]: Next generation hash
/// - KEYS[4]: Refresh index key for the next generation
/// - KEYS[5]: Subject set (`tl:subject:{sub}`)
/// - ARGV[1]: Expected current generation number
/// - ARGV[2]: Next generation number
/// - ARGV[3]: Next generation record (JSON)
/// - ARGV[4]: Index value (`{id}:{n}`)
/// - ARGV[5]: New family `expires_at` (unix seconds)
/// - ARGV[6]: TTL for family, next generation and index (milliseconds);
///   the subject set is only ever extended to it
pub const ADVANCE_GENERATION: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return -2
end

local status = redis.call('HGET', KEYS[1], 'status')
local current = tonumber(redis.call('HGET', KEYS[1], 'current_generation'))
if status ~= 'active' or current ~= tonumber(ARGV[1]) then
    return 0
end

redis.call('HSET', KEYS[2], 'status', 'superseded')
redis.call('HSET', KEYS[3], 'record', ARGV[3], 'status', 'current')
redis.call('PEXPIRE', KEYS[3], ARGV[6])
redis.call('SET', KEYS[4], ARGV[4], 'PX', ARGV[6])
redis.call('HSET', KEYS[1], 'current_generation', ARGV[2], 'expires_at', ARGV[5])
redis.call('PEXPIRE', KEYS[1], ARGV[6])
redis.call('PEXPIRE', KEYS[5], ARGV[6], 'NX')
redis.call('PEXPIRE', KEYS[5], ARGV[6], 'GT')
return 1
"#;

/// Revoke a family and every generation passed in, and drop it from its
/// subject set.
///
/// The caller reads `current_generation` first and passes keys for
/// generations `0..=N`; if the family advanced in between the script
/// returns 0 and the caller retries with the new range.
///
/// Arguments:
/// - KEYS[1]: Family hash
/// - KEYS[2]: Subject set
/// - KEYS[3..]: Generation hashes `0..=N`
/// - ARGV[1]: N, the generation the caller observed as current
/// - ARGV[2]: Revocation time (unix seconds)
/// - ARGV[3]: Family id (subject set member)
pub const REVOKE_FAMILY: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return -2
end

local current = tonumber(redis.call('HGET', KEYS[1], 'current_generation'))
if current ~= tonumber(ARGV[1]) then
    return 0
end

local already = redis.call('HGET', KEYS[1], 'status') == 'revoked'
if not already then
    redis.call('HSET', KEYS[1], 'status', 'revoked', 'revoked_at', ARGV[2])
end

redis.call('SREM', KEYS[2], ARGV[3])

for i = 3, #KEYS do
    if redis.call('EXISTS', KEYS[i]) == 1 then
        redis.call('HSET', KEYS[i], 'status', 'revoked')
    end
end

if already then
    return 2
end
return 1
"#;
