//! Cached representations of Redis values.
//!
//! The store distinguishes value kinds at runtime; here every cached entry
//! is one case of the closed [`CachedValue`] enum, so each call site has to
//! handle every kind it can meet and an unhandled kind cannot exist.
//!
//! Reads re-materialize a [`redis::Value`] in the same shape a direct query
//! over RESP2 would produce, so the caller-side `FromRedisValue` conversion
//! is shared between the cached and the non-cached path.

use std::collections::HashMap;

use redis::Value;

/// The kind of Redis value held under a key, as used for prefetch
/// registrations and cache fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    /// A plain string key (`GET`/`SET`).
    Scalar,
    /// A hash (`HGETALL`, `HSET`, ...).
    Hash,
    /// A list (`LRANGE`, `LPUSH`, ...).
    List,
    /// A sorted set (`ZRANGE`).
    SortedSet,
}

/// One cached entry: the client-side copy of everything stored under a
/// single Redis key.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
    /// String value; `None` caches the fact that the key does not exist.
    Scalar(Option<Vec<u8>>),
    /// Field/value pairs of a hash.
    Hash(HashMap<Vec<u8>, Vec<u8>>),
    /// List elements, head first.
    List(Vec<Vec<u8>>),
    /// Members with scores, in server (score) order.
    SortedSet(Vec<(Vec<u8>, f64)>),
}

impl CachedValue {
    /// Builds an entry of the given kind from the value returned by the
    /// corresponding fetch command (`GET`, `HGETALL`, `LRANGE 0 -1`,
    /// `ZRANGE 0 -1 WITHSCORES`). Accepts both the RESP2 and the RESP3
    /// reply shapes.
    pub(crate) fn from_fetched(kind: CacheKind, value: Value) -> Option<CachedValue> {
        match kind {
            CacheKind::Scalar => match value {
                Value::Nil => Some(CachedValue::Scalar(None)),
                Value::BulkString(data) => Some(CachedValue::Scalar(Some(data))),
                Value::SimpleString(s) => Some(CachedValue::Scalar(Some(s.into_bytes()))),
                _ => None,
            },
            CacheKind::Hash => match value {
                Value::Nil => Some(CachedValue::Hash(HashMap::new())),
                Value::Array(items) => {
                    let mut map = HashMap::with_capacity(items.len() / 2);
                    let mut iter = items.into_iter();
                    while let Some(field) = iter.next() {
                        let val = iter.next()?;
                        map.insert(as_bytes(field)?, as_bytes(val)?);
                    }
                    Some(CachedValue::Hash(map))
                }
                Value::Map(pairs) => {
                    let mut map = HashMap::with_capacity(pairs.len());
                    for (field, val) in pairs {
                        map.insert(as_bytes(field)?, as_bytes(val)?);
                    }
                    Some(CachedValue::Hash(map))
                }
                _ => None,
            },
            CacheKind::List => match value {
                Value::Nil => Some(CachedValue::List(Vec::new())),
                Value::Array(items) => {
                    let mut list = Vec::with_capacity(items.len());
                    for item in items {
                        list.push(as_bytes(item)?);
                    }
                    Some(CachedValue::List(list))
                }
                _ => None,
            },
            CacheKind::SortedSet => match value {
                Value::Nil => Some(CachedValue::SortedSet(Vec::new())),
                Value::Array(items) => sorted_set_from_items(items),
                _ => None,
            },
        }
    }

    pub(crate) fn as_hash(&self) -> Option<&HashMap<Vec<u8>, Vec<u8>>> {
        match self {
            CachedValue::Hash(map) => Some(map),
            _ => None,
        }
    }

    pub(crate) fn as_hash_mut(&mut self) -> Option<&mut HashMap<Vec<u8>, Vec<u8>>> {
        match self {
            CachedValue::Hash(map) => Some(map),
            _ => None,
        }
    }

    pub(crate) fn as_list(&self) -> Option<&Vec<Vec<u8>>> {
        match self {
            CachedValue::List(list) => Some(list),
            _ => None,
        }
    }

    pub(crate) fn as_list_mut(&mut self) -> Option<&mut Vec<Vec<u8>>> {
        match self {
            CachedValue::List(list) => Some(list),
            _ => None,
        }
    }

    pub(crate) fn as_sorted_set(&self) -> Option<&Vec<(Vec<u8>, f64)>> {
        match self {
            CachedValue::SortedSet(members) => Some(members),
            _ => None,
        }
    }
}

fn as_bytes(value: Value) -> Option<Vec<u8>> {
    match value {
        Value::BulkString(data) => Some(data),
        Value::SimpleString(s) => Some(s.into_bytes()),
        Value::Int(i) => Some(i.to_string().into_bytes()),
        _ => None,
    }
}

fn as_score(value: Value) -> Option<f64> {
    match value {
        Value::Double(d) => Some(d),
        Value::Int(i) => Some(i as f64),
        Value::BulkString(data) => std::str::from_utf8(&data).ok()?.parse().ok(),
        Value::SimpleString(s) => s.parse().ok(),
        _ => None,
    }
}

// ZRANGE .. WITHSCORES is a flat member/score sequence over RESP2 and a
// sequence of two-element arrays over RESP3.
fn sorted_set_from_items(items: Vec<Value>) -> Option<CachedValue> {
    let mut members = Vec::with_capacity(items.len() / 2 + 1);
    let mut iter = items.into_iter().peekable();
    if matches!(iter.peek(), Some(Value::Array(_))) {
        for item in iter {
            match item {
                Value::Array(pair) if pair.len() == 2 => {
                    let mut pair = pair.into_iter();
                    let member = as_bytes(pair.next()?)?;
                    let score = as_score(pair.next()?)?;
                    members.push((member, score));
                }
                _ => return None,
            }
        }
    } else {
        while let Some(member) = iter.next() {
            let score = iter.next()?;
            members.push((as_bytes(member)?, as_score(score)?));
        }
    }
    Some(CachedValue::SortedSet(members))
}

/// Formats a sorted-set score the way the server prints it in a bulk
/// string reply: integral scores without a decimal part.
pub(crate) fn format_score(score: f64) -> Vec<u8> {
    if score == score.trunc() && score.is_finite() && score.abs() < 1e17 {
        format!("{}", score as i64).into_bytes()
    } else if score.is_infinite() {
        if score > 0.0 { b"inf".to_vec() } else { b"-inf".to_vec() }
    } else {
        format!("{score}").into_bytes()
    }
}

/// Resolves a Redis range index (negative counts from the end, stop is
/// inclusive) into a half-open window over a sequence of `len` elements.
pub(crate) fn range_window(len: usize, start: isize, stop: isize) -> (usize, usize) {
    let len = len as isize;
    let mut start = if start < 0 { len + start } else { start };
    let mut stop = if stop < 0 { len + stop } else { stop };
    if start < 0 {
        start = 0;
    }
    if stop >= len {
        stop = len - 1;
    }
    if start > stop || len == 0 {
        return (0, 0);
    }
    (start as usize, (stop + 1) as usize)
}

/// Matches `key` against a Redis-style glob pattern (`*`, `?`, `[...]`,
/// backslash escapes), as the server does for `SCAN`-family `MATCH`
/// arguments.
pub(crate) fn glob_match(pattern: &[u8], key: &[u8]) -> bool {
    glob_match_at(pattern, key)
}

fn glob_match_at(mut pattern: &[u8], mut key: &[u8]) -> bool {
    while let Some(&p) = pattern.first() {
        match p {
            b'*' => {
                while pattern.first() == Some(&b'*') {
                    pattern = &pattern[1..];
                }
                if pattern.is_empty() {
                    return true;
                }
                while !key.is_empty() {
                    if glob_match_at(pattern, key) {
                        return true;
                    }
                    key = &key[1..];
                }
                return glob_match_at(pattern, key);
            }
            b'?' => {
                if key.is_empty() {
                    return false;
                }
                pattern = &pattern[1..];
                key = &key[1..];
            }
            b'[' => {
                let Some(ch) = key.first().copied() else {
                    return false;
                };
                pattern = &pattern[1..];
                let negate = pattern.first() == Some(&b'^');
                if negate {
                    pattern = &pattern[1..];
                }
                let mut matched = false;
                loop {
                    match pattern {
                        [] => return false,
                        [b']', ..] => {
                            pattern = &pattern[1..];
                            break;
                        }
                        [b'\\', esc, rest @ ..] => {
                            if *esc == ch {
                                matched = true;
                            }
                            pattern = rest;
                        }
                        [lo, b'-', hi, rest @ ..] if *hi != b']' => {
                            let (lo, hi) = if lo <= hi { (*lo, *hi) } else { (*hi, *lo) };
                            if lo <= ch && ch <= hi {
                                matched = true;
                            }
                            pattern = rest;
                        }
                        [c, rest @ ..] => {
                            if *c == ch {
                                matched = true;
                            }
                            pattern = rest;
                        }
                    }
                }
                if matched == negate {
                    return false;
                }
                key = &key[1..];
            }
            b'\\' if pattern.len() >= 2 => {
                if key.first() != Some(&pattern[1]) {
                    return false;
                }
                pattern = &pattern[2..];
                key = &key[1..];
            }
            _ => {
                if key.first() != Some(&p) {
                    return false;
                }
                pattern = &pattern[1..];
                key = &key[1..];
            }
        }
    }
    key.is_empty()
}
