//! Error classification and the bounded retry loop.
//!
//! Backends fronting network-dependent CLIs wrap each attempt in
//! [`run_with_retry`]. After a failure the [`ErrorClassifier`] decides whether
//! the error is transient; only transient failures are retried, with a linear
//! backoff and a fresh run id per attempt.

use crate::agents::base::AgentRunResult;
use apc_protocol::config_models::RetryConfig;
use regex::Regex;
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

/// Whether an error is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Network,
    Timeout,
    RateLimit,
    ServiceUnavailable,
    Authentication,
    Authorization,
    NotFound,
    InvalidInput,
    Compilation,
    TestFailure,
    Unknown,
}

impl ErrorCategory {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network | Self::Timeout | Self::RateLimit | Self::ServiceUnavailable => {
                ErrorKind::Transient
            }
            _ => ErrorKind::Permanent,
        }
    }

    fn suggested_action(&self) -> &'static str {
        match self {
            Self::Network => "Check network connectivity; the request will be retried.",
            Self::Timeout => "The service was slow to respond; the request will be retried.",
            Self::RateLimit => "Rate limited; waiting before retrying.",
            Self::ServiceUnavailable => "The service is temporarily unavailable; retrying.",
            Self::Authentication => "Log in to the agent CLI or set its API key.",
            Self::Authorization => "The account lacks permission for this operation.",
            Self::NotFound => "A referenced resource or file does not exist.",
            Self::InvalidInput => "Fix the prompt or CLI arguments.",
            Self::Compilation => "Fix the compilation errors reported by the agent.",
            Self::TestFailure => "Fix the failing tests reported by the agent.",
            Self::Unknown => "Inspect the run log for details.",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::RateLimit => "rate_limit",
            Self::ServiceUnavailable => "service_unavailable",
            Self::Authentication => "authentication",
            Self::Authorization => "authorization",
            Self::NotFound => "not_found",
            Self::InvalidInput => "invalid_input",
            Self::Compilation => "compilation",
            Self::TestFailure => "test_failure",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorClassification {
    pub kind: ErrorKind,
    pub category: ErrorCategory,
    pub suggested_action: String,
}

impl ErrorClassification {
    pub fn from_category(category: ErrorCategory) -> Self {
        Self {
            kind: category.kind(),
            category,
            suggested_action: category.suggested_action().to_string(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

/// Maps an error message to a retry decision.
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, error: &str) -> ErrorClassification;
}

/// Regex table classifier. Patterns are tried in order; the first match wins
/// and unmatched errors are permanent.
pub struct PatternClassifier {
    patterns: Vec<(Regex, ErrorCategory)>,
}

const PATTERNS: &[(&str, ErrorCategory)] = &[
    (
        r"(?i)econnreset|econnrefused|enotfound|ehostunreach|socket hang up|network|connection (reset|refused|closed|aborted)|getaddrinfo|\bdns\b",
        ErrorCategory::Network,
    ),
    (
        r"(?i)timed? ?out|etimedout|deadline exceeded",
        ErrorCategory::Timeout,
    ),
    (
        r"(?i)rate.?limit|too many requests|\b429\b|quota",
        ErrorCategory::RateLimit,
    ),
    (
        r"(?i)service unavailable|temporarily unavailable|overloaded|bad gateway|\b50[234]\b",
        ErrorCategory::ServiceUnavailable,
    ),
    (
        r"(?i)unauthori[sz]ed|\b401\b|not logged in|login required|authentication|invalid api key",
        ErrorCategory::Authentication,
    ),
    (
        r"(?i)forbidden|\b403\b|permission denied|not permitted",
        ErrorCategory::Authorization,
    ),
    (
        r"(?i)not found|\b404\b|no such file",
        ErrorCategory::NotFound,
    ),
    (
        r"(?i)invalid (argument|input|request|option)|unknown (option|argument)|bad request|\b400\b",
        ErrorCategory::InvalidInput,
    ),
    (
        r"(?i)error\[e\d+\]|compil(e|ation) (error|failed)|syntax error|cannot find (type|value|module)",
        ErrorCategory::Compilation,
    ),
    (
        r"(?i)tests? failed|test failure|assertion (failed|error)",
        ErrorCategory::TestFailure,
    ),
];

impl PatternClassifier {
    pub fn new() -> Self {
        Self {
            patterns: PATTERNS
                .iter()
                .filter_map(|(pattern, category)| Regex::new(pattern).ok().map(|re| (re, *category)))
                .collect(),
        }
    }
}

impl Default for PatternClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorClassifier for PatternClassifier {
    fn classify(&self, error: &str) -> ErrorClassification {
        let category = self
            .patterns
            .iter()
            .find(|(re, _)| re.is_match(error))
            .map_or(ErrorCategory::Unknown, |(_, category)| *category);
        ErrorClassification::from_category(category)
    }
}

/// Bounded retry settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before retry N is `base_delay * N`.
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
        }
    }

    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay * retry
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

/// Run id of attempt `n` (0-based) of `base_id`.
pub fn attempt_id(base_id: &str, n: u32) -> String {
    if n == 0 {
        base_id.to_string()
    } else {
        format!("{base_id}_retry{n}")
    }
}

/// Run `attempt` until it succeeds, fails permanently, or retries run out.
///
/// The last result is returned unmodified. Errors that are final by
/// construction (stopped runs, max-runtime timeouts) are never retried.
pub async fn run_with_retry<F, Fut>(
    policy: &RetryPolicy,
    classifier: &dyn ErrorClassifier,
    base_id: &str,
    mut attempt: F,
) -> AgentRunResult
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = AgentRunResult>,
{
    let mut n = 0;
    loop {
        let result = attempt(attempt_id(base_id, n)).await;
        if result.success {
            if n > 0 {
                info!(run_id = %base_id, attempt = n + 1, "Agent run succeeded after retry");
            }
            return result;
        }
        let Some(err) = &result.error else {
            return result;
        };
        if err.is_final() {
            return result;
        }

        let classification = classifier.classify(&err.to_string());
        if !classification.is_transient() || n >= policy.max_retries {
            error!(
                run_id = %base_id,
                attempt = n + 1,
                category = %classification.category,
                error = %err,
                "Agent run failed"
            );
            return result;
        }

        n += 1;
        let delay = policy.delay_for(n);
        warn!(
            run_id = %base_id,
            attempt = n,
            category = %classification.category,
            ?delay,
            error = %err,
            "Transient agent failure, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::base::{AgentError, StopReason};
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn failure(run_id: &str, message: &str) -> AgentRunResult {
        AgentRunResult::failed(run_id, AgentError::Reported(message.to_string()))
    }

    fn success(run_id: &str) -> AgentRunResult {
        AgentRunResult {
            run_id: run_id.to_string(),
            success: true,
            exit_code: Some(0),
            output: "done".to_string(),
            error: None,
            duration: Duration::ZERO,
        }
    }

    #[test]
    fn test_all_patterns_compile() {
        assert_eq!(PatternClassifier::new().patterns.len(), PATTERNS.len());
    }

    #[test]
    fn test_classification() {
        let classifier = PatternClassifier::new();
        let cases = [
            ("read ECONNRESET", ErrorCategory::Network),
            ("request timed out", ErrorCategory::Timeout),
            ("HTTP 429 Too Many Requests", ErrorCategory::RateLimit),
            ("503 Service Unavailable", ErrorCategory::ServiceUnavailable),
            ("Error: not logged in", ErrorCategory::Authentication),
            ("403 Forbidden", ErrorCategory::Authorization),
            ("model not found", ErrorCategory::NotFound),
            ("unknown option --foo", ErrorCategory::InvalidInput),
            ("error[E0308]: mismatched types", ErrorCategory::Compilation),
            ("2 tests failed", ErrorCategory::TestFailure),
            ("something odd", ErrorCategory::Unknown),
        ];
        for (message, expected) in cases {
            let c = classifier.classify(message);
            assert_eq!(c.category, expected, "{message}");
            assert!(!c.suggested_action.is_empty());
        }
        assert!(classifier.classify("ECONNREFUSED").is_transient());
        assert!(!classifier.classify("401 Unauthorized").is_transient());
    }

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_permanent_runs_max_retries_plus_one() {
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_secs(5),
        };
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&calls);

        let result = run_with_retry(&policy, &PatternClassifier::new(), "run", |id| {
            let seen = Arc::clone(&seen);
            async move {
                let n = {
                    let mut seen = seen.lock();
                    seen.push(id.clone());
                    seen.len()
                };
                if n <= 2 {
                    failure(&id, "network error: ECONNRESET")
                } else {
                    failure(&id, "401 Unauthorized")
                }
            }
        })
        .await;

        assert_eq!(*calls.lock(), vec!["run", "run_retry1", "run_retry2"]);
        assert_eq!(result, failure("run_retry2", "401 Unauthorized"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_returns_last_transient_failure() {
        let policy = RetryPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(10),
        };
        let count = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&count);

        let result = run_with_retry(&policy, &PatternClassifier::new(), "r", |id| {
            let counter = Arc::clone(&counter);
            async move {
                *counter.lock() += 1;
                failure(&id, "rate limit exceeded")
            }
        })
        .await;

        assert_eq!(*count.lock(), 2);
        assert_eq!(result.run_id, "r_retry1");
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let count = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&count);

        run_with_retry(&RetryPolicy::default(), &PatternClassifier::new(), "r", |id| {
            let counter = Arc::clone(&counter);
            async move {
                *counter.lock() += 1;
                failure(&id, "invalid api key")
            }
        })
        .await;

        assert_eq!(*count.lock(), 1);
    }

    #[tokio::test]
    async fn test_final_errors_are_not_retried() {
        let count = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&count);

        let result = run_with_retry(&RetryPolicy::default(), &PatternClassifier::new(), "r", |id| {
            let counter = Arc::clone(&counter);
            async move {
                *counter.lock() += 1;
                AgentRunResult::failed(id, AgentError::Stopped(StopReason::Paused))
            }
        })
        .await;

        assert_eq!(*count.lock(), 1);
        assert_eq!(result.error, Some(AgentError::Stopped(StopReason::Paused)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_retry() {
        let count = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&count);

        let result = run_with_retry(&RetryPolicy::default(), &PatternClassifier::new(), "r", |id| {
            let counter = Arc::clone(&counter);
            async move {
                let n = {
                    let mut c = counter.lock();
                    *c += 1;
                    *c
                };
                if n == 1 {
                    failure(&id, "socket hang up")
                } else {
                    success(&id)
                }
            }
        })
        .await;

        assert!(result.success);
        assert_eq!(result.run_id, "r_retry1");
    }
}
