use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::cli::config::{BackoffSettings, RetrySettings};
use crate::utils::retry::RetryPolicy;

/// Failure taxonomy used to pick a retry strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    NetworkFailure,
    BlockedOrBanned,
    ChallengePresented,
    RateLimited,
    ContentSelectorMissing,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::NetworkFailure => "network_failure",
            ErrorKind::BlockedOrBanned => "blocked_or_banned",
            ErrorKind::ChallengePresented => "challenge_presented",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ContentSelectorMissing => "content_selector_missing",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the scrape task when it recognises what went wrong
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("network failure: {0}")]
    Network(String),

    #[error("blocked by target site: {0}")]
    Blocked(String),

    #[error("challenge presented: {0}")]
    Challenge(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("content selector missing: {0}")]
    SelectorMissing(String),
}

impl ScrapeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScrapeError::Timeout(_) => ErrorKind::Timeout,
            ScrapeError::Network(_) => ErrorKind::NetworkFailure,
            ScrapeError::Blocked(_) => ErrorKind::BlockedOrBanned,
            ScrapeError::Challenge(_) => ErrorKind::ChallengePresented,
            ScrapeError::RateLimited(_) => ErrorKind::RateLimited,
            ScrapeError::SelectorMissing(_) => ErrorKind::ContentSelectorMissing,
        }
    }
}

// Checked in this order; the first match wins.
const PATTERNS: &[(ErrorKind, &str)] = &[
    (
        ErrorKind::ChallengePresented,
        r"(?i)captcha|challenge|verify (that )?you are (a )?human|unusual traffic",
    ),
    (
        ErrorKind::RateLimited,
        r"(?i)too many requests|rate.?limit|\b429\b",
    ),
    (
        ErrorKind::BlockedOrBanned,
        r"(?i)access denied|forbidden|\b403\b|blocked|banned",
    ),
    (
        ErrorKind::ContentSelectorMissing,
        r"(?i)selector|no such element|element not found|no (products|items|records) found",
    ),
    (
        ErrorKind::Timeout,
        r"(?i)timed? ?out|timeout|deadline (has )?elapsed",
    ),
    (
        ErrorKind::NetworkFailure,
        r"(?i)net::err_|connection (refused|reset|closed|aborted)|dns|econn|socket|network|unreachable|broken pipe",
    ),
];

/// Maps arbitrary errors onto an [`ErrorKind`]
pub struct ErrorClassifier {
    patterns: Vec<(ErrorKind, Regex)>,
}

impl ErrorClassifier {
    pub fn new() -> Result<Self> {
        let patterns = PATTERNS
            .iter()
            .map(|(kind, pattern)| {
                Regex::new(pattern)
                    .map(|regex| (*kind, regex))
                    .context(format!("Invalid classification pattern for {}", kind))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { patterns })
    }

    /// Typed errors anywhere in the chain win; otherwise the full chain
    /// text is matched against the patterns.
    pub fn classify(&self, error: &anyhow::Error) -> ErrorKind {
        // also finds a ScrapeError attached as context
        if let Some(scrape) = error.downcast_ref::<ScrapeError>() {
            return scrape.kind();
        }
        for cause in error.chain() {
            if let Some(scrape) = cause.downcast_ref::<ScrapeError>() {
                return scrape.kind();
            }
            if cause.is::<tokio::time::error::Elapsed>() {
                return ErrorKind::Timeout;
            }
        }

        self.classify_message(&format!("{:#}", error))
    }

    pub fn classify_message(&self, message: &str) -> ErrorKind {
        self.patterns
            .iter()
            .find(|(_, regex)| regex.is_match(message))
            .map(|(kind, _)| *kind)
            .unwrap_or(ErrorKind::Unknown)
    }

    /// Failures worth retrying right away, inside the same attempt
    pub fn is_transient(&self, error: &anyhow::Error) -> bool {
        matches!(
            self.classify(error),
            ErrorKind::Timeout | ErrorKind::NetworkFailure
        )
    }
}

/// What to do with a job after a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    Fail { reason: String },
}

/// Per-kind backoff curves and attempt ceilings
#[derive(Debug, Clone)]
pub struct BackoffTable {
    settings: RetrySettings,
}

impl BackoffTable {
    pub fn new(settings: RetrySettings) -> Self {
        Self { settings }
    }

    fn curve(&self, kind: ErrorKind) -> &BackoffSettings {
        match kind {
            ErrorKind::RateLimited => &self.settings.rate_limited,
            ErrorKind::BlockedOrBanned => &self.settings.blocked,
            ErrorKind::ChallengePresented => &self.settings.challenge,
            ErrorKind::ContentSelectorMissing => &self.settings.selector_missing,
            ErrorKind::Timeout | ErrorKind::NetworkFailure | ErrorKind::Unknown => &self.settings.standard,
        }
    }

    pub fn policy_for(&self, kind: ErrorKind) -> RetryPolicy {
        let curve = self.curve(kind);
        RetryPolicy {
            max_attempts: self.attempt_ceiling(kind),
            initial_delay_ms: curve.initial_delay_ms,
            max_delay_ms: curve.max_delay_ms,
            factor: curve.factor,
            jitter: self.settings.jitter,
        }
    }

    /// Total attempts a job may make when failing with `kind`
    pub fn attempt_ceiling(&self, kind: ErrorKind) -> u32 {
        let global = self.settings.max_attempts.max(1);
        match kind {
            ErrorKind::BlockedOrBanned => self.settings.blocked_max_attempts.max(1).min(global),
            ErrorKind::ContentSelectorMissing => {
                self.settings.selector_missing_max_attempts.max(1).min(global)
            }
            _ => global,
        }
    }

    /// Decide after `attempt` (1-based, counting the attempt that just
    /// failed) whether the job is rescheduled and after how long.
    pub fn decide(&self, kind: ErrorKind, attempt: u32) -> RetryDecision {
        let ceiling = self.attempt_ceiling(kind);
        if attempt >= ceiling {
            let reason = match kind {
                ErrorKind::BlockedOrBanned => format!(
                    "blocked by target site on {} attempt(s); not retrying",
                    attempt
                ),
                _ => format!("{} after {} of {} attempt(s)", kind, attempt, ceiling),
            };
            return RetryDecision::Fail { reason };
        }

        RetryDecision::Retry {
            delay: self.policy_for(kind).delay_for(attempt),
        }
    }
}
