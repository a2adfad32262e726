use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Inclusive bounds on the number of blocks requested per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanBounds {
    pub min: u64,
    pub max: u64,
}

impl SpanBounds {
    /// Normalize so that `max >= min >= 1`.
    pub fn new(min: u64, max: u64) -> Self {
        let min = min.max(1);
        Self {
            min,
            max: max.max(min),
        }
    }
}

#[derive(Debug, Default)]
struct ChainSpan {
    hint: Option<u64>,
    bounds: Option<SpanBounds>,
}

/// Per-chain block span policy shared by every poller of the process.
///
/// Each chain remembers one hint: the span width that last worked. It starts
/// at the chain's max span, shrinks whenever a provider rejects a range as
/// too large, and never grows back on its own. One rejection therefore
/// benefits every later call for that chain, not just the retry loop that
/// hit it.
#[derive(Debug)]
pub struct SpanController {
    defaults: SpanBounds,
    chains: Mutex<HashMap<i64, ChainSpan>>,
}

impl SpanController {
    pub fn new(defaults: SpanBounds) -> Self {
        Self {
            defaults: SpanBounds::new(defaults.min, defaults.max),
            chains: Mutex::new(HashMap::new()),
        }
    }

    fn with_chain<R>(&self, chain_id: i64, f: impl FnOnce(&mut ChainSpan, SpanBounds) -> R) -> R {
        let mut chains = self.chains.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = chains.entry(chain_id).or_default();
        let bounds = entry.bounds.unwrap_or(self.defaults);
        f(entry, bounds)
    }

    /// Override the bounds for a chain. Pollers call this at the start of
    /// every cycle since endpoint-level overrides can change between cycles.
    pub fn set_bounds(&self, chain_id: i64, bounds: SpanBounds) {
        let bounds = SpanBounds::new(bounds.min, bounds.max);
        self.with_chain(chain_id, |entry, _| entry.bounds = Some(bounds));
    }

    pub fn bounds(&self, chain_id: i64) -> SpanBounds {
        self.with_chain(chain_id, |_, bounds| bounds)
    }

    pub fn hint(&self, chain_id: i64) -> Option<u64> {
        self.with_chain(chain_id, |entry, _| entry.hint)
    }

    /// Forget the remembered hint; the next call starts again at max span.
    pub fn reset(&self, chain_id: i64) {
        self.with_chain(chain_id, |entry, _| entry.hint = None);
    }

    /// `min(hint, max, remaining)`, raised to `min` when enough blocks remain,
    /// never below 1.
    pub fn next_span(&self, chain_id: i64, remaining: u64) -> u64 {
        self.with_chain(chain_id, |entry, bounds| {
            let hint = entry.hint.unwrap_or(bounds.max);
            let mut span = hint.min(bounds.max).min(remaining);
            if span < bounds.min && remaining >= bounds.min {
                span = bounds.min;
            }
            span.max(1)
        })
    }

    /// Halve `current`, clamp it to the chain's bounds and to `remaining`,
    /// and store the result as the new hint.
    pub fn shrink(&self, chain_id: i64, current: u64, remaining: u64) -> u64 {
        self.with_chain(chain_id, |entry, bounds| {
            let next = (current / 2)
                .clamp(bounds.min, bounds.max)
                .min(remaining)
                .max(1);
            entry.hint = Some(next);
            next
        })
    }

    /// Record a span that just succeeded. Spans truncated by the end of the
    /// range say nothing about the provider's limit and are not recorded.
    pub fn record_success(&self, chain_id: i64, span: u64, remaining: u64) {
        if span >= remaining {
            return;
        }
        self.with_chain(chain_id, |entry, _| entry.hint = Some(span));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(min: u64, max: u64) -> SpanController {
        SpanController::new(SpanBounds::new(min, max))
    }

    #[test]
    fn test_bounds_are_normalized() {
        assert_eq!(SpanBounds::new(0, 0), SpanBounds { min: 1, max: 1 });
        assert_eq!(SpanBounds::new(50, 10), SpanBounds { min: 50, max: 50 });
    }

    #[test]
    fn test_next_span_starts_at_max() {
        let spans = controller(10, 2000);
        assert_eq!(spans.next_span(1, 1_000_000), 2000);
        assert_eq!(spans.next_span(1, 500), 500);
        assert_eq!(spans.hint(1), None);
    }

    #[test]
    fn test_next_span_never_exceeds_remaining_or_max_and_never_zero() {
        let spans = controller(10, 2000);
        for remaining in [1u64, 2, 9, 10, 11, 1999, 2000, 2001, 50_000] {
            let span = spans.next_span(7, remaining);
            assert!(span <= remaining, "span {span} > remaining {remaining}");
            assert!(span <= 2000);
            assert!(span >= 1);
        }
        assert_eq!(spans.next_span(7, 0), 1);
    }

    #[test]
    fn test_next_span_raised_to_min() {
        let spans = controller(100, 2000);
        spans.shrink(1, 100, 10_000);
        // Hint is pinned at min; a smaller stored hint from older bounds is raised.
        spans.set_bounds(1, SpanBounds::new(500, 2000));
        assert_eq!(spans.next_span(1, 10_000), 500);
        // Unless fewer blocks remain than the minimum.
        assert_eq!(spans.next_span(1, 300), 100);
    }

    #[test]
    fn test_shrink_halves_and_persists_hint() {
        let spans = controller(10, 4000);
        assert_eq!(spans.shrink(1, 4000, 4000), 2000);
        assert_eq!(spans.hint(1), Some(2000));
        assert_eq!(spans.next_span(1, 4000), 2000);
        assert_eq!(spans.shrink(1, 2000, 4000), 1000);
        assert_eq!(spans.next_span(1, 4000), 1000);
        // Other chains are untouched.
        assert_eq!(spans.next_span(2, 4000), 4000);
    }

    #[test]
    fn test_shrink_is_idempotent_at_the_floor() {
        let spans = controller(10, 4000);
        assert_eq!(spans.shrink(1, 10, 4000), 10);
        assert_eq!(spans.shrink(1, 10, 4000), 10);

        let spans = controller(1, 4000);
        assert_eq!(spans.shrink(1, 1, 4000), 1);
        assert_eq!(spans.shrink(1, 1, 4000), 1);
    }

    #[test]
    fn test_shrink_respects_remaining() {
        let spans = controller(10, 4000);
        assert_eq!(spans.shrink(1, 4000, 5), 5);
    }

    #[test]
    fn test_record_success_ignores_truncated_spans() {
        let spans = controller(10, 4000);
        spans.record_success(1, 12, 12);
        assert_eq!(spans.hint(1), None);
        spans.set_bounds(1, SpanBounds::new(10, 3000));
        spans.record_success(1, 3000, 10_000);
        assert_eq!(spans.hint(1), Some(3000));
    }

    #[test]
    fn test_reset_restores_max() {
        let spans = controller(10, 4000);
        spans.shrink(1, 4000, 4000);
        spans.reset(1);
        assert_eq!(spans.next_span(1, 10_000), 4000);
    }
}
