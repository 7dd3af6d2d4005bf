//! Per-cycle batch: fragment split, cache resolution, one backend round trip,
//! reassembly and fan-out bookkeeping.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::handles::HandleId;
use crate::translate::cache::{FrequencyCache, ResultCache, FREQUENCY_THRESHOLD};
use crate::translate::fragment::{reassemble, FragmentSplitter};

/// Transient state of one cycle. Cleared and reused every cycle.
#[derive(Debug, Default)]
pub struct BatchState {
    /// Unique texts in queue order.
    texts: Vec<String>,
    /// Text -> consumers waiting on it, in registration order.
    fanout: HashMap<String, Vec<HandleId>>,
    /// Handle -> texts it was attached to this cycle, for continuation detection.
    handle_texts: HashMap<HandleId, Vec<String>>,
    fragments: HashMap<String, Vec<String>>,
    translations: HashMap<String, String>,
    pending: Vec<String>,
    pending_set: HashSet<String>,
}

impl BatchState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains_text(&self, text: &str) -> bool {
        self.fanout.contains_key(text)
    }

    /// Attach `handle` to `text`, adding the text if it is new.
    /// Returns false when the handle was already waiting on that text.
    pub fn attach(&mut self, text: &str, handle: HandleId) -> bool {
        if !self.fanout.contains_key(text) {
            self.texts.push(text.to_string());
        }
        let waiting = self.fanout.entry(text.to_string()).or_default();
        if waiting.contains(&handle) {
            return false;
        }
        waiting.push(handle);
        self.handle_texts
            .entry(handle)
            .or_default()
            .push(text.to_string());
        true
    }

    /// Texts `handle` is already waiting on this cycle.
    pub fn texts_for(&self, handle: HandleId) -> &[String] {
        self.handle_texts
            .get(&handle)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn texts(&self) -> &[String] {
        &self.texts
    }

    pub fn handles_for(&self, text: &str) -> &[HandleId] {
        self.fanout.get(text).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Distinct uncached fragments, in first-occurrence order.
    pub fn pending(&self) -> &[String] {
        &self.pending
    }

    pub fn pending_chars(&self) -> usize {
        self.pending.iter().map(|f| f.chars().count()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }

    pub fn clear(&mut self) {
        self.texts.clear();
        self.fanout.clear();
        self.handle_texts.clear();
        self.fragments.clear();
        self.translations.clear();
        self.pending.clear();
        self.pending_set.clear();
    }

    /// Remove `text` and hand back its waiting consumers.
    fn take_text(&mut self, text: &str) -> Vec<HandleId> {
        self.fragments.remove(text);
        self.fanout.remove(text).unwrap_or_default()
    }
}

/// A resolved text ready for callback fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub original: String,
    pub translated: String,
    pub handles: Vec<HandleId>,
}

pub struct BatchTranslator {
    splitter: FragmentSplitter,
}

impl BatchTranslator {
    pub fn new(splitter: FragmentSplitter) -> Self {
        Self { splitter }
    }

    pub fn splitter(&self) -> &FragmentSplitter {
        &self.splitter
    }

    /// Split every text and look its fragments up in the cache. Texts that
    /// resolve fully are delivered now; the rest leave their missing fragments
    /// in the state's pending list.
    pub fn resolve_cached(
        &self,
        state: &mut BatchState,
        cache: &mut ResultCache,
        frequency: &mut FrequencyCache,
    ) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        let texts = state.texts.clone();

        for text in texts {
            let fragments = self.splitter.split(&text);
            let mut complete = true;
            for fragment in &fragments {
                if state.translations.contains_key(fragment) {
                    continue;
                }
                if state.pending_set.contains(fragment) {
                    complete = false;
                    continue;
                }
                match cache.get(fragment) {
                    Some(hit) => {
                        state.translations.insert(fragment.clone(), hit);
                    }
                    None => {
                        complete = false;
                        if state.pending_set.insert(fragment.clone()) {
                            state.pending.push(fragment.clone());
                        }
                    }
                }
            }
            state.fragments.insert(text.clone(), fragments);

            if complete {
                if let Some(delivery) = self.finish_text(state, &text, cache, Some(&mut *frequency)) {
                    deliveries.push(delivery);
                }
            }
        }

        debug!(
            texts = state.texts.len(),
            cached = deliveries.len(),
            pending = state.pending.len(),
            "batch resolved against cache"
        );
        deliveries
    }

    /// Record the backend's answer for the pending fragments (same order),
    /// cache them and deliver every text that is now complete.
    pub fn apply_translations(
        &self,
        state: &mut BatchState,
        translated: Vec<String>,
        cache: &mut ResultCache,
    ) -> Vec<Delivery> {
        let pending = std::mem::take(&mut state.pending);
        state.pending_set.clear();
        for (source, target) in pending.into_iter().zip(translated) {
            cache.set(source.clone(), target.clone());
            state.translations.insert(source, target);
        }

        let waiting: Vec<String> = state
            .texts
            .iter()
            .filter(|t| state.fanout.contains_key(t.as_str()))
            .cloned()
            .collect();
        waiting
            .iter()
            .filter_map(|text| self.finish_text(state, text, cache, None))
            .collect()
    }

    /// Drop every text still waiting on the network. Returns the handles that
    /// were waiting so their references can be released.
    pub fn abandon(&self, state: &mut BatchState) -> Vec<HandleId> {
        let waiting: Vec<String> = state
            .texts
            .iter()
            .filter(|t| state.fanout.contains_key(t.as_str()))
            .cloned()
            .collect();
        let mut handles = Vec::new();
        for text in waiting {
            handles.extend(state.take_text(&text));
        }
        state.pending.clear();
        state.pending_set.clear();
        handles
    }

    /// Reassemble and hand out `text`. `frequency` is passed only for texts
    /// resolved purely from the cache; those count toward whole-text caching.
    fn finish_text(
        &self,
        state: &mut BatchState,
        text: &str,
        cache: &mut ResultCache,
        frequency: Option<&mut FrequencyCache>,
    ) -> Option<Delivery> {
        let fragments = state.fragments.get(text)?;
        let mut pairs = Vec::with_capacity(fragments.len());
        for fragment in fragments {
            pairs.push((fragment.as_str(), state.translations.get(fragment)?.as_str()));
        }
        let translated = reassemble(text, &pairs);

        let frequent = fragments.len() > 1
            && frequency.is_some_and(|f| f.bump(text) > FREQUENCY_THRESHOLD);
        if frequent {
            debug!(text, "frequent multi-fragment text cached whole");
            cache.set(text.to_string(), translated.clone());
        }

        let handles = state.take_text(text);
        Some(Delivery {
            original: text.to_string(),
            translated,
            handles,
        })
    }
}
