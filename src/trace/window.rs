use std::collections::{HashMap, VecDeque};

use super::dispatch::{Cumulative, DispatchKey};

/// One fixed-width bin, identified by its closing edge.
///
/// Values are cumulative totals as of `end_ms`, not per-bin deltas.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bin {
    pub end_ms: i64,
    pub values: HashMap<DispatchKey, Cumulative>,
}

impl Bin {
    fn empty(end_ms: i64) -> Self {
        Self {
            end_ms,
            values: HashMap::new(),
        }
    }
}

/// Where a bin key falls relative to the open window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    InWindow,
    TooOld,
    InFuture,
}

/// Contiguous bins ordered oldest to newest, spaced `interval_ms` apart.
///
/// Bins are only appended at the back and only removed from the front. The
/// newest key is remembered even after everything is drained so the window
/// keeps extending from the same grid.
#[derive(Debug)]
pub struct BinWindow {
    interval_ms: i64,
    bins: VecDeque<Bin>,
    last_end_ms: i64,
}

impl BinWindow {
    /// Opens a window with a single bin at the next boundary above `now_ms`.
    pub fn new(interval_ms: i64, now_ms: i64) -> Self {
        let interval_ms = interval_ms.max(1);
        let first = next_boundary(now_ms, interval_ms);
        let mut bins = VecDeque::with_capacity(64);
        bins.push_back(Bin::empty(first));

        Self {
            interval_ms,
            bins,
            last_end_ms: first,
        }
    }

    /// Appends empty bins until the window covers `now_ms`.
    ///
    /// Returns the number of bins added; repeated calls at the same instant
    /// add nothing.
    pub fn advance_to(&mut self, now_ms: i64) -> usize {
        let current = next_boundary(now_ms, self.interval_ms);
        let mut added = 0;

        while self.last_end_ms < current {
            self.last_end_ms += self.interval_ms;
            self.bins.push_back(Bin::empty(self.last_end_ms));
            added += 1;
        }

        added
    }

    /// Oldest open bin key, if any bin is open.
    pub fn first_bin(&self) -> Option<i64> {
        self.bins.front().map(|b| b.end_ms)
    }

    /// Newest bin key ever opened.
    pub fn last_bin(&self) -> i64 {
        self.last_end_ms
    }

    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bin> {
        self.bins.iter()
    }

    pub fn get(&self, end_ms: i64) -> Option<&Bin> {
        self.index_of(end_ms).and_then(|i| self.bins.get(i))
    }

    /// Classifies a bin key against `[first_bin, last_bin]`.
    pub fn placement(&self, end_ms: i64) -> Placement {
        match self.first_bin() {
            Some(first) if end_ms < first => Placement::TooOld,
            None if end_ms <= self.last_end_ms => Placement::TooOld,
            _ if end_ms > self.last_end_ms => Placement::InFuture,
            _ => Placement::InWindow,
        }
    }

    /// Returns the bin closing at `end_ms` when it is open.
    pub fn bin_mut(&mut self, end_ms: i64) -> Option<&mut Bin> {
        let idx = self.index_of(end_ms)?;
        self.bins.get_mut(idx)
    }

    /// Removes and returns every bin with key `<= cutoff_ms`, oldest first.
    pub fn drain_through(&mut self, cutoff_ms: i64) -> Vec<Bin> {
        let count = self
            .bins
            .iter()
            .take_while(|b| b.end_ms <= cutoff_ms)
            .count();
        self.bins.drain(..count).collect()
    }

    fn index_of(&self, end_ms: i64) -> Option<usize> {
        let first = self.first_bin()?;
        if end_ms < first || end_ms > self.last_end_ms {
            return None;
        }
        let offset = end_ms - first;
        if offset % self.interval_ms != 0 {
            return None;
        }
        usize::try_from(offset / self.interval_ms).ok()
    }
}

/// Next multiple of `interval_ms` strictly above `ms`.
pub fn next_boundary(ms: i64, interval_ms: i64) -> i64 {
    (ms.div_euclid(interval_ms) + 1) * interval_ms
}
