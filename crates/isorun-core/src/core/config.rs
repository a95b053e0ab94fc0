use std::{collections::HashMap, env};

use isorun_store::{FetcherOptions, INITIAL_WORKERS, MAX_WORKERS, RETRIES};

use crate::core::tooling::timings::{is_truthy, TIMINGS_ENV};

pub(crate) const FETCH_WORKERS_ENV: &str = "ISORUN_FETCH_WORKERS";
pub(crate) const FETCH_MAX_WORKERS_ENV: &str = "ISORUN_FETCH_MAX_WORKERS";
pub(crate) const FETCH_RETRIES_ENV: &str = "ISORUN_FETCH_RETRIES";

#[derive(Debug, Clone)]
pub(crate) struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    pub(crate) fn capture() -> Self {
        Self {
            vars: env::vars().collect(),
        }
    }

    pub(crate) fn var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    fn number<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.var(key).and_then(|raw| raw.trim().parse().ok())
    }

    #[cfg(test)]
    pub(crate) fn testing(pairs: &[(&str, &str)]) -> Self {
        let vars = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Self { vars }
    }
}

/// Process-level tuning read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) fetch: FetcherOptions,
    pub(crate) timings: bool,
}

impl Config {
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_snapshot(&EnvSnapshot::capture())
    }

    pub(crate) fn from_snapshot(snapshot: &EnvSnapshot) -> Self {
        let max_workers = snapshot
            .number::<usize>(FETCH_MAX_WORKERS_ENV)
            .filter(|value| *value > 0)
            .unwrap_or(MAX_WORKERS);
        let initial_workers = snapshot
            .number::<usize>(FETCH_WORKERS_ENV)
            .filter(|value| *value > 0)
            .unwrap_or(INITIAL_WORKERS)
            .min(max_workers);
        let retries = snapshot
            .number::<u32>(FETCH_RETRIES_ENV)
            .unwrap_or(RETRIES)
            .min(u32::from(u8::MAX));
        Self {
            fetch: FetcherOptions {
                initial_workers,
                max_workers,
                retries,
            },
            timings: snapshot.var(TIMINGS_ENV).is_some_and(is_truthy),
        }
    }

    #[must_use]
    pub fn fetch(&self) -> FetcherOptions {
        self.fetch
    }

    #[must_use]
    pub fn timings(&self) -> bool {
        self.timings
    }
}

/// Caller-supplied defaults for the child environment, dropping keys that are
/// already set.
pub(crate) fn missing_env_defaults(
    snapshot: &EnvSnapshot,
    defaults: &[(String, String)],
) -> Vec<(String, String)> {
    defaults
        .iter()
        .filter(|(key, _)| !snapshot.contains(key))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_tuning_defaults() {
        let config = Config::from_snapshot(&EnvSnapshot::testing(&[]));
        assert_eq!(config.fetch(), FetcherOptions::default());
        assert!(!config.timings());
    }

    #[test]
    fn timings_follow_truthy_env() {
        let on = EnvSnapshot::testing(&[(TIMINGS_ENV, "yes")]);
        assert!(Config::from_snapshot(&on).timings());
        let off = EnvSnapshot::testing(&[(TIMINGS_ENV, "0")]);
        assert!(!Config::from_snapshot(&off).timings());
    }

    #[test]
    fn fetch_tuning_reads_overrides_and_ignores_garbage() {
        let snapshot = EnvSnapshot::testing(&[
            (FETCH_WORKERS_ENV, "8"),
            (FETCH_MAX_WORKERS_ENV, "4"),
            (FETCH_RETRIES_ENV, "lots"),
        ]);
        let fetch = Config::from_snapshot(&snapshot).fetch();
        assert_eq!(fetch.max_workers, 4);
        assert_eq!(fetch.initial_workers, 4);
        assert_eq!(fetch.retries, RETRIES);

        let snapshot = EnvSnapshot::testing(&[(FETCH_RETRIES_ENV, "1000")]);
        assert_eq!(Config::from_snapshot(&snapshot).fetch().retries, 255);
    }

    #[test]
    fn env_defaults_only_fill_gaps() {
        let snapshot = EnvSnapshot::testing(&[("KEEP", "mine")]);
        let defaults = vec![
            ("KEEP".to_string(), "theirs".to_string()),
            ("ADD".to_string(), "1".to_string()),
        ];
        assert_eq!(
            missing_env_defaults(&snapshot, &defaults),
            [("ADD".to_string(), "1".to_string())]
        );
    }
}
