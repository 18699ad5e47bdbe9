//! Environment-driven configuration.
//!
//! The snapshot is taken once per process on first use (the same one-time
//! global init discipline the logging module follows). Tests that need
//! non-default behavior construct a [`Config`] by hand.

use std::sync::OnceLock;

#[derive(Debug, Clone)]
pub struct Config {
    /// Structural dedup cache for lazy nodes (`LAZYCACHE`, default on).
    pub lazycache: bool,
    /// Pull narrowing casts beneath views (`CAST_BEFORE_VIEW`, default on).
    pub cast_before_view: bool,
    /// Split large reductions into a two-stage rewrite (`SPLIT_REDUCEOP`, default on).
    pub split_reduceop: bool,
    /// Reduction volume threshold for the split rewrite (`REDUCEOP_SPLIT_THRESHOLD`).
    pub reduceop_split_threshold: usize,
    /// Emit best-effort graph events to the log (`GRAPH`).
    pub graph: bool,
    /// Numeric verbosity (`DEBUG`).
    pub debug: u8,
    /// If nonempty, append scheduled ASTs to this file (`LOGOPS`).
    pub logops: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            lazycache: true,
            cast_before_view: true,
            split_reduceop: true,
            reduceop_split_threshold: 32768,
            graph: false,
            debug: 0,
            logops: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Config {
        Config {
            lazycache: env_flag("LAZYCACHE", true),
            cast_before_view: env_flag("CAST_BEFORE_VIEW", true),
            split_reduceop: env_flag("SPLIT_REDUCEOP", true),
            reduceop_split_threshold: env_num("REDUCEOP_SPLIT_THRESHOLD", 32768),
            graph: env_flag("GRAPH", false),
            debug: env_num("DEBUG", 0usize) as u8,
            logops: std::env::var("LOGOPS").ok().filter(|s| !s.is_empty()),
        }
    }

    /// The process-wide snapshot, taken on first call.
    pub fn global() -> &'static Config {
        static CONFIG: OnceLock<Config> = OnceLock::new();
        CONFIG.get_or_init(Config::from_env)
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => v.parse::<i64>().map(|n| n != 0).unwrap_or(default),
        Err(_) => default,
    }
}

fn env_num(name: &str, default: usize) -> usize {
    match std::env::var(name) {
        Ok(v) => v.parse().unwrap_or(default),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert!(c.lazycache);
        assert!(c.split_reduceop);
        assert_eq!(c.reduceop_split_threshold, 32768);
        assert!(c.logops.is_none());
    }
}
