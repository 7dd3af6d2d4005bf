//! Request queue and per-cycle deduplication.
//! Submissions land here in arrival order; each cycle drains the head under
//! a character budget into the batch state, merging duplicates and continuations.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::batch::BatchState;
use crate::handles::{HandleId, HandleRegistry};

/// One queued `(text, consumer)` submission. Holds one handle reference.
#[derive(Debug, Clone)]
pub struct TranslationRequest {
    pub text: String,
    pub handle: HandleId,
    pub enqueued_at: Instant,
}

impl TranslationRequest {
    pub fn new(text: String, handle: HandleId) -> Self {
        Self {
            text,
            handle,
            enqueued_at: Instant::now(),
        }
    }
}

#[derive(Debug, Default)]
pub struct RequestQueue {
    items: VecDeque<TranslationRequest>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, request: TranslationRequest) {
        self.items.push_back(request);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Queued texts, head first.
    pub fn texts(&self) -> Vec<String> {
        self.items.iter().map(|r| r.text.clone()).collect()
    }

    /// Empty the queue, returning every request.
    pub fn drain(&mut self) -> Vec<TranslationRequest> {
        self.items.drain(..).collect()
    }
}

/// Limits on how much of the queue one cycle may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleBudget {
    pub max_chars: usize,
    pub max_items: Option<usize>,
}

/// What one dedup pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupOutcome {
    /// Requests absorbed into the batch (including merged duplicates).
    pub taken: usize,
    /// Requests whose consumer was already dead.
    pub dead: usize,
    /// Requests that duplicated one already in the batch.
    pub merged: usize,
    /// Characters of new unique texts.
    pub chars: usize,
    /// Longest time an absorbed request spent queued.
    pub max_wait: Duration,
}

/// Strip a previously submitted prefix for the same consumer.
/// `"AB"` then `"ABC"` leaves `"C"`; anything else is returned unchanged.
pub fn strip_submitted_prefix<'a>(text: &'a str, previous: Option<&str>) -> &'a str {
    match previous {
        Some(prev) if !prev.is_empty() && text.len() > prev.len() && text.starts_with(prev) => {
            &text[prev.len()..]
        }
        _ => text,
    }
}

/// Longest earlier text of the same handle that `text` extends.
fn continuation_suffix(state: &BatchState, text: &str, handle: HandleId) -> Option<String> {
    state
        .texts_for(handle)
        .iter()
        .filter(|earlier| text.len() > earlier.len() && text.starts_with(earlier.as_str()))
        .max_by_key(|earlier| earlier.len())
        .map(|earlier| text[earlier.len()..].to_string())
}

/// Drain the queue head into `state` while the running character total of new
/// unique texts stays within budget. At least one live request is always taken.
/// Requests for dead consumers are dropped on the way.
pub fn deduplicate(
    queue: &mut RequestQueue,
    budget: &CycleBudget,
    registry: &mut HandleRegistry,
    state: &mut BatchState,
) -> DedupOutcome {
    let mut outcome = DedupOutcome::default();
    let now = Instant::now();

    while let Some(front) = queue.items.front() {
        if !registry.is_alive(front.handle) {
            if let Some(dead) = queue.items.pop_front() {
                registry.release(dead.handle);
                outcome.dead += 1;
            }
            continue;
        }
        if budget.max_items.is_some_and(|max| outcome.taken >= max) {
            break;
        }

        let text = if state.contains_text(&front.text) {
            front.text.clone()
        } else {
            continuation_suffix(state, &front.text, front.handle).unwrap_or_else(|| front.text.clone())
        };
        let new_chars = if state.contains_text(&text) {
            0
        } else {
            text.chars().count()
        };
        if outcome.taken > 0 && outcome.chars + new_chars > budget.max_chars {
            break;
        }

        let Some(request) = queue.items.pop_front() else {
            break;
        };
        outcome.taken += 1;
        outcome.chars += new_chars;
        outcome.max_wait = outcome
            .max_wait
            .max(now.saturating_duration_since(request.enqueued_at));

        if text.trim().is_empty() || !state.attach(&text, request.handle) {
            registry.release(request.handle);
            outcome.merged += 1;
        }
    }

    if outcome.taken > 0 || outcome.dead > 0 {
        debug!(
            taken = outcome.taken,
            merged = outcome.merged,
            dead = outcome.dead,
            chars = outcome.chars,
            remaining = queue.len(),
            "queue deduplicated"
        );
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handles::TextConsumer;
    use std::sync::Arc;

    struct Sink;

    impl TextConsumer for Sink {
        fn apply_translation(&self, _original: &str, _translated: &str) {}
    }

    fn consumer() -> Arc<dyn TextConsumer> {
        Arc::new(Sink)
    }

    fn budget(max_chars: usize) -> CycleBudget {
        CycleBudget {
            max_chars,
            max_items: None,
        }
    }

    #[test]
    fn strips_only_strict_prefixes() {
        assert_eq!(strip_submitted_prefix("ABC", Some("AB")), "C");
        assert_eq!(strip_submitted_prefix("AB", Some("AB")), "AB");
        assert_eq!(strip_submitted_prefix("XYZ", Some("AB")), "XYZ");
        assert_eq!(strip_submitted_prefix("ABC", None), "ABC");
        assert_eq!(strip_submitted_prefix("ABC", Some("")), "ABC");
    }

    #[test]
    fn duplicate_submission_is_merged() {
        let mut registry = HandleRegistry::new();
        let c = consumer();
        let mut queue = RequestQueue::new();
        for _ in 0..2 {
            let h = registry.acquire(&c);
            queue.push(TranslationRequest::new("你好".into(), h));
        }

        let mut state = BatchState::new();
        let outcome = deduplicate(&mut queue, &budget(100), &mut registry, &mut state);
        assert_eq!(outcome.taken, 2);
        assert_eq!(outcome.merged, 1);
        assert_eq!(state.texts(), &["你好"]);
        assert_eq!(state.handles_for("你好").len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn continuation_keeps_only_the_suffix() {
        let mut registry = HandleRegistry::new();
        let c = consumer();
        let mut queue = RequestQueue::new();
        for text in ["AB", "ABC"] {
            let h = registry.acquire(&c);
            queue.push(TranslationRequest::new(text.into(), h));
        }

        let mut state = BatchState::new();
        deduplicate(&mut queue, &budget(100), &mut registry, &mut state);
        assert_eq!(state.texts(), &["AB", "C"]);
    }

    #[test]
    fn continuation_is_per_handle() {
        let mut registry = HandleRegistry::new();
        let (a, b) = (consumer(), consumer());
        let mut queue = RequestQueue::new();
        queue.push(TranslationRequest::new("AB".into(), registry.acquire(&a)));
        queue.push(TranslationRequest::new("ABC".into(), registry.acquire(&b)));

        let mut state = BatchState::new();
        deduplicate(&mut queue, &budget(100), &mut registry, &mut state);
        assert_eq!(state.texts(), &["AB", "ABC"]);
    }

    #[test]
    fn budget_leaves_the_rest_queued_in_order() {
        let mut registry = HandleRegistry::new();
        let c = consumer();
        let mut queue = RequestQueue::new();
        for text in ["一二三", "四五六", "七八九"] {
            let h = registry.acquire(&c);
            queue.push(TranslationRequest::new(text.into(), h));
        }

        let mut state = BatchState::new();
        let outcome = deduplicate(&mut queue, &budget(6), &mut registry, &mut state);
        assert_eq!(outcome.taken, 2);
        assert_eq!(outcome.chars, 6);
        assert_eq!(queue.texts(), vec!["七八九"]);
    }

    #[test]
    fn oversized_head_is_still_taken() {
        let mut registry = HandleRegistry::new();
        let c = consumer();
        let mut queue = RequestQueue::new();
        queue.push(TranslationRequest::new("一二三四五".into(), registry.acquire(&c)));
        queue.push(TranslationRequest::new("六".into(), registry.acquire(&c)));

        let mut state = BatchState::new();
        let outcome = deduplicate(&mut queue, &budget(2), &mut registry, &mut state);
        assert_eq!(outcome.taken, 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn item_cap_limits_the_cycle() {
        let mut registry = HandleRegistry::new();
        let c = consumer();
        let mut queue = RequestQueue::new();
        for text in ["a", "b", "c"] {
            queue.push(TranslationRequest::new(text.into(), registry.acquire(&c)));
        }

        let mut state = BatchState::new();
        let cap = CycleBudget {
            max_chars: 100,
            max_items: Some(2),
        };
        deduplicate(&mut queue, &cap, &mut registry, &mut state);
        assert_eq!(state.texts(), &["a", "b"]);
        assert_eq!(queue.texts(), vec!["c"]);
    }

    #[test]
    fn dead_consumers_are_skipped() {
        let mut registry = HandleRegistry::new();
        let (a, b) = (consumer(), consumer());
        let mut queue = RequestQueue::new();
        queue.push(TranslationRequest::new("gone".into(), registry.acquire(&a)));
        queue.push(TranslationRequest::new("here".into(), registry.acquire(&b)));
        registry.mark_dead(&a);

        let mut state = BatchState::new();
        let outcome = deduplicate(&mut queue, &budget(100), &mut registry, &mut state);
        assert_eq!(outcome.dead, 1);
        assert_eq!(state.texts(), &["here"]);
    }
}
