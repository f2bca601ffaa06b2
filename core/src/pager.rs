/// What is left after a reveal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remaining {
    /// More results can be revealed.
    More,
    /// The cap was reached while results remain; the consumer should ask for a
    /// narrower query.
    CappedMore,
    None,
}

impl Remaining {
    pub fn as_str(self) -> &'static str {
        match self {
            Remaining::More => "more",
            Remaining::CappedMore => "cappedMore",
            Remaining::None => "none",
        }
    }
}

#[derive(Debug, PartialEq)]
pub struct Reveal<'a, T> {
    pub batch: &'a [T],
    pub remaining: Remaining,
}

#[derive(Debug, Clone, Copy)]
pub struct PagerConfig {
    pub page_size: usize,
    pub max_working_set: usize,
}

impl Default for PagerConfig {
    fn default() -> Self {
        Self { page_size: 10, max_working_set: 1000 }
    }
}

/// Hands out query results in fixed batches, never more than
/// `max_working_set` of them in total.
#[derive(Debug)]
pub struct BoundedResultPager<T> {
    results: Vec<T>,
    total: usize,
    revealed: usize,
    config: PagerConfig,
}

impl<T> BoundedResultPager<T> {
    pub fn new(config: PagerConfig) -> Self {
        let config = PagerConfig { page_size: config.page_size.max(1), ..config };
        Self { results: Vec::new(), total: 0, revealed: 0, config }
    }

    /// Start over with a new result set. Entries beyond the cap are dropped
    /// here; only their count is kept.
    pub fn reset(&mut self, mut results: Vec<T>) {
        self.total = results.len();
        results.truncate(self.config.max_working_set);
        self.results = results;
        self.revealed = 0;
    }

    pub fn reveal_next(&mut self) -> Reveal<'_, T> {
        if self.revealed >= self.total {
            return Reveal { batch: &[], remaining: Remaining::None };
        }
        if self.revealed >= self.config.max_working_set {
            return Reveal { batch: &[], remaining: Remaining::CappedMore };
        }
        let take = self.config.page_size.min(self.config.max_working_set - self.revealed);
        let start = self.revealed;
        let end = (start + take).min(self.results.len());
        self.revealed = end;
        Reveal { batch: &self.results[start..end], remaining: self.remaining() }
    }

    pub fn remaining(&self) -> Remaining {
        if self.revealed >= self.total {
            Remaining::None
        } else if self.revealed >= self.config.max_working_set {
            Remaining::CappedMore
        } else {
            Remaining::More
        }
    }

    pub fn revealed(&self) -> usize {
        self.revealed
    }

    /// Length of the last result set, including anything past the cap.
    pub fn total(&self) -> usize {
        self.total
    }
}

impl<T> Default for BoundedResultPager<T> {
    fn default() -> Self {
        Self::new(PagerConfig::default())
    }
}
