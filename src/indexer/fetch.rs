use std::future::Future;
use std::time::Duration;

use crate::indexer::span::SpanController;
use crate::rpc::{classify, ErrorClass};

/// Retry policy for "range too large" rejections.
#[derive(Debug, Clone)]
pub struct RangePolicy {
    pub max_attempts: u32,
    /// Pause between shrink attempts so a struggling endpoint is not hammered.
    pub retry_delay: Duration,
}

/// A block range that was fetched successfully.
#[derive(Debug)]
pub struct FetchedRange<T> {
    pub from: u64,
    pub to: u64,
    pub value: T,
}

impl<T> FetchedRange<T> {
    pub fn span(&self) -> u64 {
        self.to - self.from + 1
    }
}

/// Fetch `[from, ..]` towards `target` with the widest span the provider
/// accepts.
///
/// The span comes from the chain's [`SpanController`] hint. When `fetch`
/// fails with a range-too-large error the span is halved (and remembered)
/// and the call retried, up to `policy.max_attempts` times. Any other error,
/// rate limits included, is returned immediately so the caller can apply its
/// own backoff.
pub async fn fetch_range<T, F, Fut>(
    spans: &SpanController,
    chain_id: i64,
    from: u64,
    target: u64,
    policy: &RangePolicy,
    mut fetch: F,
) -> eyre::Result<FetchedRange<T>>
where
    F: FnMut(u64, u64) -> Fut,
    Fut: Future<Output = eyre::Result<T>>,
{
    if from > target {
        return Err(eyre::eyre!("Empty block range {}..={}", from, target));
    }

    let remaining = target - from + 1;
    let mut span = spans.next_span(chain_id, remaining);
    let mut attempt = 1u32;

    loop {
        let to = (from + span - 1).min(target);

        let err = match fetch(from, to).await {
            Ok(value) => {
                spans.record_success(chain_id, span, remaining);
                return Ok(FetchedRange { from, to, value });
            }
            Err(err) => err,
        };

        if classify(&err) != ErrorClass::RangeTooLarge {
            return Err(err);
        }

        if attempt >= policy.max_attempts {
            return Err(err.wrap_err(format!(
                "Block range still too large after {} attempts (span {})",
                attempt, span
            )));
        }

        let next = spans.shrink(chain_id, span, remaining);
        if next >= span {
            return Err(err.wrap_err(format!(
                "Block range too large at minimum span {}",
                span
            )));
        }

        tracing::warn!(
            chain_id,
            from,
            to,
            span,
            next_span = next,
            attempt,
            "Provider rejected block range, shrinking span"
        );

        tokio::time::sleep(policy.retry_delay).await;
        span = next;
        attempt += 1;
    }
}
