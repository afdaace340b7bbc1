//! Error & retry policy
//!
//! Failed attempts are retried in place (same invocation index) while the
//! error is retriable and the node's budget allows; only the final outcome is
//! handed back for recording. Continue-on-fail turns a final non-fatal failure
//! into error-marked items instead of failing the run.

use serde_json::json;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::data::{ErrorRecord, Item, NodeOutput, PairedItem};
use crate::error::{ErrorClass, NodeError};
use crate::nodes::NodeOutcome;
use crate::workflow::{Backoff, NodeSettings, OnError};

/// Upper bound for exponential backoff
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

pub fn classify(error: &NodeError) -> ErrorClass {
    match error {
        NodeError::Input(_) => ErrorClass::InputError,
        NodeError::Operational(_) | NodeError::Timeout(_) | NodeError::Other(_) => ErrorClass::Retriable,
        NodeError::Fatal(_) | NodeError::Cancelled => ErrorClass::Fatal,
        NodeError::SubWorkflow { kind, .. } => match kind {
            crate::error::ErrorKind::Input | crate::error::ErrorKind::Validation => ErrorClass::InputError,
            crate::error::ErrorKind::Operational => ErrorClass::Retriable,
            crate::error::ErrorKind::Fatal => ErrorClass::Fatal,
        },
    }
}

/// Delay before the attempt following failed attempt number `attempt` (1-based)
pub fn retry_delay(settings: &NodeSettings, attempt: u32) -> Duration {
    let base = Duration::from_millis(settings.wait_between_tries_ms);
    match settings.backoff {
        Backoff::Fixed => base.min(MAX_BACKOFF),
        Backoff::Exponential => {
            let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
            base.saturating_mul(factor).min(MAX_BACKOFF)
        }
    }
}

/// Total attempts the node is allowed
pub fn attempt_budget(settings: &NodeSettings) -> u32 {
    if settings.retry_on_fail {
        settings.max_tries.max(1)
    } else {
        1
    }
}

/// Final outcome of an invocation after retries
#[derive(Debug)]
pub struct AttemptResult {
    pub result: Result<NodeOutcome, NodeError>,
    pub attempts: u32,
}

/// Drive `invoke` through the node's retry budget, applying the timeout to each attempt
pub async fn run_attempts<F, Fut>(
    settings: &NodeSettings,
    default_timeout: Option<Duration>,
    cancellation: &CancellationToken,
    mut invoke: F,
) -> AttemptResult
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<NodeOutcome, NodeError>>,
{
    let budget = attempt_budget(settings);
    let timeout = settings.timeout_ms.map(Duration::from_millis).or(default_timeout);
    let mut attempt = 1;

    loop {
        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, invoke(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(NodeError::Timeout(limit)),
            },
            None => invoke(attempt).await,
        };

        let error = match result {
            Ok(outcome) => {
                return AttemptResult {
                    result: Ok(outcome),
                    attempts: attempt,
                }
            }
            Err(error) => error,
        };

        if classify(&error) != ErrorClass::Retriable || attempt >= budget {
            return AttemptResult {
                result: Err(error),
                attempts: attempt,
            };
        }

        let delay = retry_delay(settings, attempt);
        tracing::warn!(attempt, "Attempt {}/{} failed: {}; retrying in {:?}", attempt, budget, error, delay);
        tokio::select! {
            _ = cancellation.cancelled() => {
                tracing::debug!("Retry abandoned on cancellation after attempt {}", attempt);
                return AttemptResult {
                    result: Err(NodeError::Cancelled),
                    attempts: attempt,
                };
            }
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

/// Whether the final failure may be converted into error items
pub fn can_continue(settings: &NodeSettings, error: &NodeError) -> bool {
    settings.on_error.continues() && classify(error) != ErrorClass::Fatal
}

pub fn error_record(node: &str, error: &NodeError) -> ErrorRecord {
    ErrorRecord {
        kind: error.kind(),
        message: error.to_string(),
        node: node.to_string(),
    }
}

/// Output produced in place of a failed invocation under continue-on-fail
///
/// `output_count` includes the trailing error port when one is configured.
pub fn continue_output(
    on_error: OnError,
    record: &ErrorRecord,
    input: &[Item],
    output_count: usize,
) -> NodeOutput {
    let mut output = NodeOutput::empty(output_count.max(1));
    match on_error {
        OnError::StopWorkflow => {}
        OnError::ContinueRegularOutput => {
            let count = input.len().max(1);
            output.0[0] = (0..count)
                .map(|index| {
                    let mut item = Item::new(json!({"error": record.message})).paired_to(index);
                    item.error = Some(record.clone());
                    item
                })
                .collect();
        }
        OnError::ContinueErrorOutput => {
            let items = if input.is_empty() {
                vec![Item::new(json!({"error": record.message}))]
            } else {
                input.to_vec()
            };
            let port = output.0.len() - 1;
            output.0[port] = items
                .into_iter()
                .enumerate()
                .map(|(index, mut item)| {
                    item.paired_item = vec![PairedItem::new(index)];
                    item.error = Some(record.clone());
                    item
                })
                .collect();
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn classification() {
        assert_eq!(classify(&NodeError::input("bad")), ErrorClass::InputError);
        assert_eq!(classify(&NodeError::operational("503")), ErrorClass::Retriable);
        assert_eq!(classify(&NodeError::Timeout(Duration::from_secs(1))), ErrorClass::Retriable);
        assert_eq!(classify(&NodeError::fatal("bug")), ErrorClass::Fatal);
        assert_eq!(
            classify(&NodeError::SubWorkflow {
                workflow_id: "child".into(),
                kind: ErrorKind::Operational,
                message: "down".into()
            }),
            ErrorClass::Retriable
        );
    }

    #[test]
    fn backoff_is_capped() {
        let mut settings = NodeSettings::retrying(10);
        settings.wait_between_tries_ms = 1000;
        assert_eq!(retry_delay(&settings, 3), Duration::from_secs(1));

        settings.backoff = Backoff::Exponential;
        assert_eq!(retry_delay(&settings, 1), Duration::from_secs(1));
        assert_eq!(retry_delay(&settings, 3), Duration::from_secs(4));
        assert_eq!(retry_delay(&settings, 10), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn retries_until_success_within_budget() {
        let calls = AtomicU32::new(0);
        let outcome = run_attempts(&NodeSettings::retrying(3), None, &CancellationToken::new(), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(NodeError::operational("flaky"))
                } else {
                    Ok(NodeOutcome::items(vec![]))
                }
            }
        })
        .await;

        assert!(outcome.result.is_ok());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn input_errors_are_not_retried() {
        let outcome = run_attempts(&NodeSettings::retrying(5), None, &CancellationToken::new(), |_| async {
            Err::<NodeOutcome, _>(NodeError::input("missing field"))
        })
        .await;
        assert_eq!(outcome.attempts, 1);
        assert!(matches!(outcome.result, Err(NodeError::Input(_))));
    }

    #[tokio::test]
    async fn timeouts_are_retriable_errors() {
        let settings = NodeSettings::retrying(2).timeout_ms(10);
        let outcome = run_attempts(&settings, None, &CancellationToken::new(), |_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(NodeOutcome::items(vec![]))
        })
        .await;
        assert_eq!(outcome.attempts, 2);
        assert!(matches!(outcome.result, Err(NodeError::Timeout(_))));
    }

    #[tokio::test]
    async fn cancellation_during_backoff_reports_cancelled() {
        let settings = NodeSettings {
            wait_between_tries_ms: 30_000,
            ..NodeSettings::retrying(5)
        };
        let token = CancellationToken::new();
        let canceller = token.clone();
        let calls = AtomicU32::new(0);

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            run_attempts(&settings, None, &token, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                canceller.cancel();
                async { Err::<NodeOutcome, _>(NodeError::operational("503")) }
            }),
        )
        .await
        .expect("backoff ignored cancellation");

        assert_eq!(outcome.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(outcome.result, Err(NodeError::Cancelled)));
    }

    #[test]
    fn continue_outputs() {
        let record = ErrorRecord {
            kind: ErrorKind::Operational,
            message: "boom".into(),
            node: "X".into(),
        };
        let input = vec![Item::new(json!({"a": 1})), Item::new(json!({"a": 2}))];

        let regular = continue_output(OnError::ContinueRegularOutput, &record, &input, 1);
        assert_eq!(regular.port(0).len(), 2);
        assert!(regular.port(0)[1].is_error());
        assert_eq!(regular.port(0)[1].paired_item, vec![PairedItem::new(1)]);

        let routed = continue_output(OnError::ContinueErrorOutput, &record, &input, 2);
        assert!(routed.port(0).is_empty());
        assert_eq!(routed.port(1)[0].get("a"), Some(&json!(1)));
        assert!(routed.port(1)[0].is_error());
    }

    #[test]
    fn fatal_errors_never_continue() {
        let settings = NodeSettings::default().on_error(OnError::ContinueRegularOutput);
        assert!(can_continue(&settings, &NodeError::operational("x")));
        assert!(!can_continue(&settings, &NodeError::fatal("bug")));
        assert!(!can_continue(&NodeSettings::default(), &NodeError::operational("x")));
    }
}
