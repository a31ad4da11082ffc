use std::collections::VecDeque;

/// Values keyed by the absolute sample index at which they start applying.
///
/// Each span covers `[start, next span's start)`. The last span is open
/// ended.
#[derive(Debug)]
pub(crate) struct Spans<T> {
    spans: VecDeque<(u64, T)>,
}

impl<T> Spans<T> {
    pub(crate) fn new() -> Self {
        Self {
            spans: VecDeque::new(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Value in force at `index`.
    ///
    /// # Panics
    ///
    /// Panics if no span starts at or before `index`.
    pub(crate) fn get(&self, index: u64) -> &T {
        let pos = self.spans.partition_point(|(start, _)| *start <= index);
        assert!(pos > 0, "no span covers sample index {index}");
        &self.spans[pos - 1].1
    }

    pub(crate) fn end_value(&self) -> Option<&T> {
        self.spans.back().map(|(_, value)| value)
    }

    /// Start a new span at `start`. Replaces the last span if it starts at
    /// the same index.
    pub(crate) fn append(&mut self, start: u64, value: T) {
        if let Some((last_start, last_value)) = self.spans.back_mut() {
            assert!(start >= *last_start, "span {start} appended before {last_start}");
            if *last_start == start {
                *last_value = value;
                return;
            }
        }
        self.spans.push_back((start, value));
    }

    /// Drop spans that end at or before `index`.
    pub(crate) fn discard_to(&mut self, index: u64) {
        while self.spans.len() > 1 && self.spans[1].0 <= index {
            self.spans.pop_front();
        }
    }

    /// Drop spans that start after `index`.
    pub(crate) fn discard_from(&mut self, index: u64) {
        while self.spans.back().is_some_and(|(start, _)| *start > index) {
            self.spans.pop_back();
        }
    }

    pub(crate) fn clear(&mut self) {
        self.spans.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.spans.len()
    }
}
