// ============================================================================
// Rate Limiting
// ============================================================================
//
// Pluggable admission check in front of the dispatch path. The default
// implementation keeps fixed windows in memory and understands the
// configured rule grammar, e.g. "100 per minute; 20 per second".
//
// ============================================================================

use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tokio::time::Instant;

use crate::error::ConfigError;

#[derive(Error, Debug)]
#[error("rate limit exceeded: {limit} per {window}")]
pub struct RateLimitExceeded {
    pub limit: u32,
    pub window: &'static str,
}

/// Admission check consulted before dispatch. Exceeding a limit rejects
/// the request with 429; the check itself must never block on I/O.
pub trait RateLimiter: Send + Sync {
    fn check(&self, key: &str) -> Result<(), RateLimitExceeded>;
}

/// One parsed rule: at most `max` requests per `window_secs` seconds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateRule {
    pub max: u32,
    pub window_secs: u64,
    pub unit: &'static str,
}

/// Parse a rule string: `"<n> per <unit>"` clauses joined by semicolons.
/// Units: second, minute, hour, day.
pub fn parse_rules(raw: &str) -> Result<Vec<RateRule>, ConfigError> {
    let mut rules = Vec::new();

    for clause in raw.split(';') {
        let clause = clause.trim();
        if clause.is_empty() {
            continue;
        }

        let mut parts = clause.split_whitespace();
        let (max, per, unit) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(max), Some(per), Some(unit), None) => (max, per, unit),
            _ => {
                return Err(ConfigError::Invalid(format!(
                    "rate limit clause '{}' (expected '<n> per <unit>')",
                    clause
                )))
            }
        };

        if per != "per" {
            return Err(ConfigError::Invalid(format!(
                "rate limit clause '{}' (expected '<n> per <unit>')",
                clause
            )));
        }

        let max: u32 = max.parse().map_err(|_| {
            ConfigError::Invalid(format!("rate limit count '{}' is not a number", max))
        })?;

        let (window_secs, unit) = match unit {
            "second" | "seconds" => (1, "second"),
            "minute" | "minutes" => (60, "minute"),
            "hour" | "hours" => (3600, "hour"),
            "day" | "days" => (86400, "day"),
            other => {
                return Err(ConfigError::Invalid(format!(
                    "unknown rate limit unit '{}'",
                    other
                )))
            }
        };

        rules.push(RateRule {
            max,
            window_secs,
            unit,
        });
    }

    Ok(rules)
}

struct Window {
    started: Instant,
    count: u32,
}

/// Map size at which expired windows are swept out. Keys come from
/// client-controlled headers, so the maps must not grow without bound.
const SWEEP_THRESHOLD: usize = 1024;

/// In-memory fixed-window limiter: one window per (rule, key)
pub struct FixedWindowLimiter {
    rules: Vec<RateRule>,
    windows: Vec<Mutex<HashMap<String, Window>>>,
}

impl FixedWindowLimiter {
    pub fn new(rules: Vec<RateRule>) -> Self {
        let windows = rules.iter().map(|_| Mutex::new(HashMap::new())).collect();
        Self { rules, windows }
    }

    pub fn from_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(Self::new(parse_rules(raw)?))
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.windows
            .iter()
            .map(|w| w.lock().map(|g| g.len()).unwrap_or(0))
            .sum()
    }
}

impl RateLimiter for FixedWindowLimiter {
    fn check(&self, key: &str) -> Result<(), RateLimitExceeded> {
        for (rule, windows) in self.rules.iter().zip(&self.windows) {
            let mut windows = match windows.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let now = Instant::now();

            if windows.len() > SWEEP_THRESHOLD {
                windows.retain(|_, w| {
                    now.duration_since(w.started).as_secs() < rule.window_secs
                });
            }

            let window = windows.entry(key.to_string()).or_insert(Window {
                started: now,
                count: 0,
            });

            if now.duration_since(window.started).as_secs() >= rule.window_secs {
                window.started = now;
                window.count = 0;
            }

            window.count += 1;
            if window.count > rule.max {
                return Err(RateLimitExceeded {
                    limit: rule.max,
                    window: rule.unit,
                });
            }
        }

        Ok(())
    }
}
