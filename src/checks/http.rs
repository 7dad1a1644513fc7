//! HTTP status and content checks
//!
//! A request plus a predicate: the status check passes on any 2xx response,
//! the content check additionally requires the body to match a regex.
//! Transport failures are classified by kind - a timeout means the remote
//! was unreachable in time (`Failure`), anything else means the check
//! mechanism broke (`Error`).

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::Utc;
use futures::FutureExt;
use regex::Regex;
use tracing::debug;

use crate::registry::CheckConstructor;
use crate::{CheckFn, CheckResult, Outcome};

/// Shared HTTP checker. One instance (and one reqwest client) backs every
/// http check registered through its constructors. Cloning is cheap, the
/// underlying client connection pool is shared between clones.
#[derive(Clone)]
pub struct HttpChecker {
    client: reqwest::Client,
}

impl HttpChecker {
    /// Build a checker whose requests time out after `timeout`. Redirects
    /// are not followed; a redirect status is judged as-is.
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .expect("Failed to build HTTP client"),
        }
    }

    /// Constructor for the `http` check type. Required args: `url`.
    pub fn status_constructor(&self) -> CheckConstructor {
        let checker = self.clone();
        Box::new(move |args| {
            let url = args
                .get("url")
                .context("http check missing 'url' parameter")?
                .clone();

            let checker = checker.clone();
            let check: CheckFn = Arc::new(move || {
                let checker = checker.clone();
                let url = url.clone();
                async move { checker.check_status(&url).await }.boxed()
            });
            Ok(check)
        })
    }

    /// Constructor for the `http_content` check type. Required args: `url`,
    /// `matches` (a regex the response body must satisfy).
    pub fn content_constructor(&self) -> CheckConstructor {
        let checker = self.clone();
        Box::new(move |args| {
            let url = args
                .get("url")
                .context("http_content check missing 'url' parameter")?
                .clone();
            let pattern = args
                .get("matches")
                .context("http_content check missing 'matches' parameter")?;
            let pattern = Regex::new(pattern)
                .with_context(|| format!("invalid 'matches' pattern: {pattern}"))?;

            let checker = checker.clone();
            let check: CheckFn = Arc::new(move || {
                let checker = checker.clone();
                let url = url.clone();
                let pattern = pattern.clone();
                async move { checker.check_content(&url, &pattern).await }.boxed()
            });
            Ok(check)
        })
    }

    async fn check_status(&self, url: &str) -> CheckResult {
        let timestamp = Utc::now();
        let start = Instant::now();

        match self.client.get(url).send().await {
            Ok(response) => {
                let outcome = if response.status().is_success() {
                    Outcome::Success
                } else {
                    Outcome::Failure
                };
                CheckResult {
                    timestamp,
                    outcome,
                    duration: start.elapsed(),
                }
            }
            Err(e) => CheckResult {
                timestamp,
                outcome: classify_transport_error(url, &e),
                duration: start.elapsed(),
            },
        }
    }

    async fn check_content(&self, url: &str, pattern: &Regex) -> CheckResult {
        let timestamp = Utc::now();
        let start = Instant::now();

        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                return CheckResult {
                    timestamp,
                    outcome: classify_transport_error(url, &e),
                    duration: start.elapsed(),
                };
            }
        };

        if !response.status().is_success() {
            return CheckResult {
                timestamp,
                outcome: Outcome::Failure,
                duration: start.elapsed(),
            };
        }

        let outcome = match response.text().await {
            Ok(body) if pattern.is_match(&body) => Outcome::Success,
            Ok(_) => Outcome::Failure,
            Err(e) => {
                debug!("{url}: failed to read response body: {e}");
                Outcome::Error
            }
        };

        CheckResult {
            timestamp,
            outcome,
            duration: start.elapsed(),
        }
    }
}

/// A timeout is an expected form of unreachability; everything else on the
/// transport level means the check itself could not complete.
fn classify_transport_error(url: &str, error: &reqwest::Error) -> Outcome {
    if error.is_timeout() {
        debug!("{url}: request timed out");
        Outcome::Failure
    } else {
        debug!("{url}: request failed: {error}");
        Outcome::Error
    }
}
