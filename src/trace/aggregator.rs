use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use crate::clock::{Clock, ClockOffset, SystemClock};
use crate::sink::metric::{MetricEntry, MetricNames};

use super::dispatch::{Cumulative, DispatchKey};
use super::queue::IngestQueue;
use super::window::{next_boundary, Bin, BinWindow, Placement};

/// Outcome of one processing pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Records taken off the ingest queue.
    pub drained: usize,
    /// Records accounted into a bin.
    pub processed: usize,
    pub dropped_too_old: usize,
    pub dropped_in_future: usize,
    /// Empty bins appended while advancing the window.
    pub bins_added: usize,
}

impl PassSummary {
    pub fn dropped(&self) -> usize {
        self.dropped_too_old + self.dropped_in_future
    }
}

/// Result of a flush: the pass that preceded it plus the extracted entries.
#[derive(Debug, Clone, Default)]
pub struct FlushOutput {
    pub pass: PassSummary,
    pub bins_flushed: usize,
    pub entries: Vec<MetricEntry>,
}

/// Bins kernel dispatches by end time and keeps per-key cumulative totals.
///
/// A single owner drives processing and flushing. Producers only ever touch
/// the shared [`IngestQueue`].
pub struct DispatchAggregator<C: Clock = SystemClock> {
    clock: C,
    interval_ms: i64,
    window_ms: i64,
    offset: ClockOffset,
    queue: Arc<IngestQueue>,
    totals: HashMap<DispatchKey, Cumulative>,
    window: BinWindow,
    names: MetricNames,
}

impl<C: Clock> DispatchAggregator<C> {
    /// Measures the clock offset and opens the first bin.
    ///
    /// Fails when either clock cannot be read.
    pub fn new(clock: C, interval: Duration, window: Duration, names: MetricNames) -> Result<Self> {
        let interval_ms = i64::try_from(interval.as_millis())
            .context("interval out of range")?
            .max(1);
        let window_ms = i64::try_from(window.as_millis()).context("window out of range")?;
        if window_ms < interval_ms {
            bail!("window ({window_ms}ms) must not be shorter than interval ({interval_ms}ms)");
        }

        let offset = ClockOffset::measure(&clock).context("measuring device clock offset")?;
        let now_ms = clock.wall_ms().context("reading wall clock")?;
        let window = BinWindow::new(interval_ms, now_ms);

        info!(
            interval_ms,
            window_ms,
            first_bin = window.last_bin(),
            "dispatch aggregator initialized",
        );

        Ok(Self {
            clock,
            interval_ms,
            window_ms,
            offset,
            queue: Arc::new(IngestQueue::new()),
            totals: HashMap::new(),
            window,
            names,
        })
    }

    /// Producer handle for request handlers.
    pub fn queue(&self) -> Arc<IngestQueue> {
        Arc::clone(&self.queue)
    }

    pub fn interval_ms(&self) -> i64 {
        self.interval_ms
    }

    pub fn window_ms(&self) -> i64 {
        self.window_ms
    }

    pub fn offset(&self) -> ClockOffset {
        self.offset
    }

    pub fn window(&self) -> &BinWindow {
        &self.window
    }

    /// Lifetime totals for a key, if it has been seen.
    pub fn cumulative(&self, key: &DispatchKey) -> Option<Cumulative> {
        self.totals.get(key).copied()
    }

    /// Number of distinct (device, kernel) pairs seen.
    pub fn tracked_keys(&self) -> usize {
        self.totals.len()
    }

    /// Advances the window to now and folds queued dispatches into it.
    pub fn process_dispatches(&mut self) -> Result<PassSummary> {
        let now_ms = self.clock.wall_ms().context("reading wall clock")?;
        let mut summary = PassSummary {
            bins_added: self.window.advance_to(now_ms),
            ..PassSummary::default()
        };

        let pending = self.queue.take();
        summary.drained = pending.len();

        for dispatch in pending {
            let end_ms = self.offset.device_to_wall_ms(dispatch.end_ns);
            let end_bin = next_boundary(end_ms, self.interval_ms);

            match self.window.placement(end_bin) {
                Placement::InWindow => {}
                Placement::TooOld => {
                    info!(
                        card = %dispatch.device_id,
                        kernel = %dispatch.kernel,
                        end_bin,
                        first_bin = ?self.window.first_bin(),
                        "dropping dispatch older than the bin window",
                    );
                    summary.dropped_too_old += 1;
                    continue;
                }
                Placement::InFuture => {
                    info!(
                        card = %dispatch.device_id,
                        kernel = %dispatch.kernel,
                        end_bin,
                        last_bin = self.window.last_bin(),
                        "dropping dispatch beyond the bin window",
                    );
                    summary.dropped_in_future += 1;
                    continue;
                }
            }

            let key = dispatch.key();
            let snapshot = self
                .totals
                .entry(key.clone())
                .or_default()
                .record(dispatch.duration_ns);

            if let Some(bin) = self.window.bin_mut(end_bin) {
                bin.values.insert(key, snapshot);
                summary.processed += 1;
            }
        }

        debug!(
            drained = summary.drained,
            processed = summary.processed,
            dropped = summary.dropped(),
            bins = self.window.len(),
            "processed dispatches",
        );

        Ok(summary)
    }

    /// Periodic flush: emits every bin older than the retention window.
    pub fn update_metrics(&mut self) -> Result<FlushOutput> {
        let pass = self.process_dispatches()?;
        let cutoff = self.window.last_bin() - self.window_ms;
        Ok(self.flush_through(pass, cutoff))
    }

    /// Terminal flush: emits every bin, including the newest.
    pub fn flush_metrics(&mut self) -> Result<FlushOutput> {
        let pass = self.process_dispatches()?;
        let cutoff = self.window.last_bin();
        let output = self.flush_through(pass, cutoff);

        info!(
            bins = output.bins_flushed,
            entries = output.entries.len(),
            "flushed all dispatch bins",
        );

        Ok(output)
    }

    fn flush_through(&mut self, pass: PassSummary, cutoff_ms: i64) -> FlushOutput {
        let bins = self.window.drain_through(cutoff_ms);
        let bins_flushed = bins.len();
        let mut entries = Vec::with_capacity(bins.iter().map(|b| b.values.len() * 2).sum());

        for bin in bins {
            self.bin_entries(bin, &mut entries);
        }

        FlushOutput {
            pass,
            bins_flushed,
            entries,
        }
    }

    fn bin_entries(&self, bin: Bin, out: &mut Vec<MetricEntry>) {
        let mut values: Vec<(DispatchKey, Cumulative)> = bin.values.into_iter().collect();
        values.sort_unstable_by(|a, b| a.0.cmp(&b.0));

        for (key, value) in values {
            out.push(MetricEntry {
                name: Arc::clone(&self.names.dispatch_count),
                device_id: Arc::clone(&key.device_id),
                kernel: Arc::clone(&key.kernel),
                value: value.dispatches,
                timestamp_ms: bin.end_ms,
            });
            out.push(MetricEntry {
                name: Arc::clone(&self.names.total_duration_ns),
                device_id: key.device_id,
                kernel: key.kernel,
                value: value.total_duration_ns,
                timestamp_ms: bin.end_ms,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::trace::dispatch::Dispatch;

    const SEC: i64 = 1_000_000_000;

    fn aggregator(clock: &ManualClock) -> DispatchAggregator<ManualClock> {
        DispatchAggregator::new(
            clock.clone(),
            Duration::from_secs(1),
            Duration::from_secs(30),
            MetricNames::default(),
        )
        .expect("aggregator")
    }

    fn key(device: &str, kernel: &str) -> DispatchKey {
        DispatchKey::new(device, kernel)
    }

    #[test]
    fn test_new_opens_first_bin() {
        let clock = ManualClock::new(0, 0);
        let agg = aggregator(&clock);
        assert_eq!(agg.window().len(), 1);
        assert_eq!(agg.window().first_bin(), Some(1000));
        assert_eq!(agg.interval_ms(), 1000);
        assert_eq!(agg.window_ms(), 30_000);
    }

    #[test]
    fn test_new_rejects_window_shorter_than_interval() {
        let clock = ManualClock::new(0, 0);
        let result = DispatchAggregator::new(
            clock,
            Duration::from_secs(5),
            Duration::from_secs(1),
            MetricNames::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_sub_millisecond_interval_clamps_to_one() {
        let clock = ManualClock::new(0, 0);
        let agg = DispatchAggregator::new(
            clock,
            Duration::from_micros(10),
            Duration::from_millis(5),
            MetricNames::default(),
        )
        .expect("aggregator");
        assert_eq!(agg.interval_ms(), 1);
    }

    #[test]
    fn test_idle_passes_extend_window() {
        let clock = ManualClock::new(0, 0);
        let mut agg = aggregator(&clock);

        for t in 1..=10 {
            clock.set_wall_secs(t);
            agg.process_dispatches().expect("pass");
        }

        let keys: Vec<i64> = agg.window().iter().map(|b| b.end_ms).collect();
        assert_eq!(keys, (1..=11).map(|s| s * 1000).collect::<Vec<_>>());
        assert!(agg.window().iter().all(|b| b.values.is_empty()));
    }

    #[test]
    fn test_dispatch_lands_in_bin_above_end_time() {
        let clock = ManualClock::new(SEC, SEC);
        let mut agg = aggregator(&clock);
        assert_eq!(agg.offset().as_ns(), 0);

        clock.set_wall_secs(3);
        // Ends at 3s minus the 1s boot offset, so 2000ms on the wall clock.
        agg.queue()
            .push_batch(vec![Dispatch::new("0", "kernel_a", 2_000_000_000, 5_000_000)]);
        let summary = agg.process_dispatches().expect("pass");
        assert_eq!(summary.processed, 1);

        let bin = agg.window().get(3000).expect("bin 3000");
        assert_eq!(
            bin.values.get(&key("0", "kernel_a")).copied(),
            Some(Cumulative::new(1, 5_000_000))
        );
        assert!(agg.window().get(2000).expect("bin 2000").values.is_empty());
    }

    #[test]
    fn test_two_dispatches_same_bin_accumulate() {
        let clock = ManualClock::new(0, 0);
        let mut agg = aggregator(&clock);
        clock.set_wall_secs(6);

        agg.queue().push_batch(vec![
            Dispatch::new("1", "k", 4_200_000_000, 100),
            Dispatch::new("1", "k", 4_900_000_000, 250),
        ]);
        agg.process_dispatches().expect("pass");

        let bin = agg.window().get(5000).expect("bin 5000");
        assert_eq!(
            bin.values.get(&key("1", "k")).copied(),
            Some(Cumulative::new(2, 350))
        );
    }

    #[test]
    fn test_bins_hold_cumulative_snapshots() {
        let clock = ManualClock::new(0, 0);
        let mut agg = aggregator(&clock);
        clock.set_wall_secs(5);

        agg.queue().push_batch(vec![
            Dispatch::new("0", "k", 1_500_000_000, 10),
            Dispatch::new("0", "k", 3_500_000_000, 20),
        ]);
        agg.process_dispatches().expect("pass");

        let k = key("0", "k");
        assert_eq!(
            agg.window().get(2000).and_then(|b| b.values.get(&k)).copied(),
            Some(Cumulative::new(1, 10))
        );
        assert_eq!(
            agg.window().get(4000).and_then(|b| b.values.get(&k)).copied(),
            Some(Cumulative::new(2, 30))
        );
        assert_eq!(agg.cumulative(&k), Some(Cumulative::new(2, 30)));
    }

    #[test]
    fn test_out_of_range_dispatches_are_dropped() {
        let clock = ManualClock::new(10 * SEC, 10 * SEC);
        let mut agg = aggregator(&clock);
        clock.set_wall_secs(12);

        agg.queue().push_batch(vec![
            Dispatch::new("0", "old", 2 * SEC as u64, 1),
            Dispatch::new("0", "future", 60 * SEC as u64, 1),
            Dispatch::new("0", "ok", 11 * SEC as u64, 1),
        ]);
        let summary = agg.process_dispatches().expect("pass");

        assert_eq!(summary.drained, 3);
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.dropped_too_old, 1);
        assert_eq!(summary.dropped_in_future, 1);
        assert_eq!(agg.cumulative(&key("0", "old")), None);
        assert_eq!(agg.cumulative(&key("0", "future")), None);
        assert_eq!(agg.tracked_keys(), 1);
    }

    #[test]
    fn test_periodic_flush_respects_window() {
        let clock = ManualClock::new(0, 0);
        let mut agg = aggregator(&clock);

        clock.set_wall_secs(40);
        agg.queue()
            .push_batch(vec![Dispatch::new("0", "k", 2_500_000_000, 7)]);
        let out = agg.update_metrics().expect("flush");

        let last = agg.window().last_bin();
        assert_eq!(last, 41_000);
        assert!(out.entries.iter().all(|e| e.timestamp_ms <= last - 30_000));
        assert_eq!(agg.window().first_bin(), Some(last - 30_000 + 1000));
        assert_eq!(out.bins_flushed, 11);

        assert_eq!(out.entries.len(), 2);
        assert_eq!(&*out.entries[0].name, "omnistat_kernel_dispatch_count");
        assert_eq!(out.entries[0].value, 1);
        assert_eq!(out.entries[0].timestamp_ms, 3000);
        assert_eq!(&*out.entries[1].name, "omnistat_kernel_total_duration_ns");
        assert_eq!(out.entries[1].value, 7);
    }

    #[test]
    fn test_periodic_flush_keeps_young_bins() {
        let clock = ManualClock::new(0, 0);
        let mut agg = aggregator(&clock);
        clock.set_wall_secs(10);

        let out = agg.update_metrics().expect("flush");
        assert!(out.entries.is_empty());
        assert_eq!(out.bins_flushed, 0);
        assert_eq!(agg.window().len(), 11);
    }

    #[test]
    fn test_terminal_flush_empties_window() {
        let clock = ManualClock::new(0, 0);
        let mut agg = aggregator(&clock);
        clock.set_wall_secs(3);

        agg.queue().push_batch(vec![
            Dispatch::new("0", "a", 1_200_000_000, 5),
            Dispatch::new("1", "b", 2_200_000_000, 9),
        ]);
        let out = agg.flush_metrics().expect("flush");

        assert!(agg.window().is_empty());
        assert_eq!(out.bins_flushed, 4);
        assert_eq!(out.entries.len(), 4);

        let stamps: Vec<i64> = out.entries.iter().map(|e| e.timestamp_ms).collect();
        assert_eq!(stamps, vec![2000, 2000, 3000, 3000]);
    }

    #[test]
    fn test_flush_includes_queued_records() {
        let clock = ManualClock::new(0, 0);
        let mut agg = aggregator(&clock);
        clock.set_wall_secs(1);

        agg.queue()
            .push_batch(vec![Dispatch::new("0", "late", 1_100_000_000, 3)]);
        let out = agg.flush_metrics().expect("flush");

        assert_eq!(out.pass.processed, 1);
        assert_eq!(out.entries.len(), 2);
        assert_eq!(out.entries[0].timestamp_ms, 2000);
    }

    #[test]
    fn test_window_extends_after_terminal_flush() {
        let clock = ManualClock::new(0, 0);
        let mut agg = aggregator(&clock);
        clock.set_wall_secs(2);
        agg.flush_metrics().expect("flush");
        assert_eq!(agg.window().last_bin(), 3000);

        clock.set_wall_secs(4);
        agg.process_dispatches().expect("pass");
        let keys: Vec<i64> = agg.window().iter().map(|b| b.end_ms).collect();
        assert_eq!(keys, vec![4000, 5000]);
    }

    #[test]
    fn test_batching_does_not_change_totals() {
        let records: Vec<Dispatch> = (0..40u64)
            .map(|i| Dispatch::new(&(i % 3).to_string(), "k", (i % 9 + 1) * SEC as u64, i))
            .collect();

        let one_batch = {
            let clock = ManualClock::new(0, 0);
            let mut agg = aggregator(&clock);
            clock.set_wall_secs(10);
            agg.queue().push_batch(records.clone());
            agg.process_dispatches().expect("pass");
            agg
        };

        let many_batches = {
            let clock = ManualClock::new(0, 0);
            let mut agg = aggregator(&clock);
            clock.set_wall_secs(10);
            for chunk in records.chunks(7) {
                agg.queue().push_batch(chunk.to_vec());
                agg.process_dispatches().expect("pass");
            }
            agg
        };

        for device in ["0", "1", "2"] {
            let k = key(device, "k");
            assert_eq!(one_batch.cumulative(&k), many_batches.cumulative(&k));
        }
    }

    #[test]
    fn test_repeated_pass_at_same_instant_is_noop() {
        let clock = ManualClock::new(0, 0);
        let mut agg = aggregator(&clock);
        clock.set_wall_secs(5);

        let first = agg.process_dispatches().expect("pass");
        let second = agg.process_dispatches().expect("pass");
        assert_eq!(first.bins_added, 5);
        assert_eq!(second, PassSummary::default());
        assert_eq!(agg.window().len(), 6);
    }
}
