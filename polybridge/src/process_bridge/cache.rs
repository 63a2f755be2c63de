//! Opt-in memoization of pure-looking remote calls.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Value, json};

use super::config::CacheConfig;
use crate::bridge::protocol::Kwargs;

const MAX_CACHEABLE_ARGS: usize = 3;

/// Name fragments that mark a function as reading or computing.
const CACHEABLE_PATTERNS: &[&str] = &[
    "get", "read", "load", "fetch", "compute", "calc", "encode", "decode", "parse", "format",
    "hash", "convert", "transform", "serialize",
];

/// Name fragments that rule caching out even when a cacheable one matches.
const UNCACHEABLE_PATTERNS: &[&str] = &[
    "set", "update", "delete", "remove", "write", "save", "insert", "append", "push", "pop",
    "clear", "reset", "mutate", "modify", "random", "rand", "uuid", "shuffle", "seed", "sample",
    "choice", "now", "time", "date", "today", "clock", "sleep",
];

fn is_simple(value: &Value) -> bool {
    matches!(
        value,
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_)
    )
}

/// Lowercase words of a snake_case, kebab-case or camelCase name.
fn name_segments(name: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for c in name.chars() {
        if !c.is_alphanumeric() {
            prev_lower = false;
            if !current.is_empty() {
                segments.push(std::mem::take(&mut current));
            }
            continue;
        }
        if c.is_uppercase() && prev_lower && !current.is_empty() {
            segments.push(std::mem::take(&mut current));
        }
        prev_lower = c.is_lowercase() || c.is_ascii_digit();
        current.extend(c.to_lowercase());
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

/// Whether a call looks pure enough to memoize.
///
/// Patterns match the start of a name segment, so `get_dataset` is not a
/// setter and `get_runtime_info` is not a clock read.
pub fn is_cacheable(function: &str, args: &[Value], kwargs: Option<&Kwargs>) -> bool {
    let segments = name_segments(function);
    let matches = |patterns: &[&str]| {
        segments
            .iter()
            .any(|segment| patterns.iter().any(|p| segment.starts_with(p)))
    };
    if matches(UNCACHEABLE_PATTERNS) || !matches(CACHEABLE_PATTERNS) {
        return false;
    }
    args.len() <= MAX_CACHEABLE_ARGS
        && args.iter().all(is_simple)
        && kwargs.is_none_or(|kw| kw.values().all(is_simple))
}

pub fn cache_key(module: &str, function: &str, args: &[Value], kwargs: Option<&Kwargs>) -> String {
    json!([module, function, args, kwargs]).to_string()
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

struct Entry {
    value: Value,
    stored_at: Instant,
}

pub struct ResultCache {
    config: CacheConfig,
    entries: DashMap<String, Entry>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let fresh = self.entries.get(key).and_then(|entry| {
            (entry.stored_at.elapsed() < self.config.ttl).then(|| entry.value.clone())
        });
        match fresh {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.entries
                    .remove_if(key, |_, entry| entry.stored_at.elapsed() >= self.config.ttl);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, key: String, value: Value) {
        if self.config.capacity == 0 {
            return;
        }
        if !self.entries.contains_key(&key) && self.entries.len() >= self.config.capacity {
            self.evict();
        }
        self.entries.insert(
            key,
            Entry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    /// Drop expired entries, or the oldest one when nothing has expired.
    fn evict(&self) {
        let ttl = self.config.ttl;
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.stored_at.elapsed() < ttl);
        if self.entries.len() < before {
            return;
        }
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.stored_at)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn name_heuristics() {
        assert!(is_cacheable("compute_stats", &[json!(1), json!("a")], None));
        assert!(is_cacheable("get_version", &[], None));
        assert!(!is_cacheable("sqrt", &[json!(16)], None));
        assert!(!is_cacheable("get_random_value", &[], None));
        assert!(!is_cacheable("get_time", &[], None));
        assert!(!is_cacheable("update_record", &[json!(1)], None));
    }

    #[test]
    fn patterns_match_whole_name_segments() {
        assert!(is_cacheable("get_dataset", &[], None));
        assert!(is_cacheable("get_runtime_info", &[], None));
        assert!(is_cacheable("loadConfig", &[], None));
        assert!(!is_cacheable("getRandomValue", &[], None));
        assert!(!is_cacheable("fetch-and-delete", &[], None));
        assert!(!is_cacheable("validate_input", &[], None));
        assert_eq!(name_segments("parseHTTPHeader_v2"), vec!["parse", "httpheader", "v2"]);
    }

    #[test]
    fn only_few_simple_arguments() {
        let four = [json!(1), json!(2), json!(3), json!(4)];
        assert!(!is_cacheable("compute", &four, None));
        assert!(!is_cacheable("compute", &[json!([1, 2])], None));

        let mut kwargs = Kwargs::new();
        kwargs.insert("scale".into(), json!(2.5));
        assert!(is_cacheable("compute", &[], Some(&kwargs)));
        kwargs.insert("opts".into(), json!({"deep": true}));
        assert!(!is_cacheable("compute", &[], Some(&kwargs)));
    }

    #[test]
    fn keys_distinguish_kwargs() {
        let mut kwargs = Kwargs::new();
        kwargs.insert("n".into(), json!(1));
        assert_ne!(
            cache_key("m", "compute", &[json!(1)], None),
            cache_key("m", "compute", &[json!(1)], Some(&kwargs))
        );
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = ResultCache::new(CacheConfig {
            ttl: Duration::from_millis(20),
            capacity: 10,
        });
        cache.insert("k".into(), json!(1));
        assert_eq!(cache.get("k"), Some(json!(1)));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get("k"), None);

        let stats = cache.stats();
        assert_eq!((stats.entries, stats.hits, stats.misses), (0, 1, 1));
    }

    #[test]
    fn capacity_evicts_oldest() {
        let cache = ResultCache::new(CacheConfig {
            ttl: Duration::from_secs(60),
            capacity: 2,
        });
        cache.insert("a".into(), json!(1));
        std::thread::sleep(Duration::from_millis(2));
        cache.insert("b".into(), json!(2));
        cache.insert("c".into(), json!(3));

        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(json!(2)));
        assert_eq!(cache.get("c"), Some(json!(3)));
    }
}
