use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic event count.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// One counter per domain, index-aligned with the domain list.
#[derive(Debug, Default)]
pub struct DomainCounters(Vec<Counter>);

impl DomainCounters {
    pub fn new(num_domains: usize) -> Self {
        Self((0..num_domains).map(|_| Counter::default()).collect())
    }

    /// Out-of-range indices are ignored.
    pub fn inc(&self, domain: usize) {
        if let Some(counter) = self.0.get(domain) {
            counter.inc();
        }
    }

    pub fn get(&self, domain: usize) -> u64 {
        self.0.get(domain).map_or(0, Counter::get)
    }

    pub fn snapshot(&self) -> Vec<u64> {
        self.0.iter().map(Counter::get).collect()
    }
}

/// Largest value observed so far.
#[derive(Debug, Default)]
pub struct HighWater(AtomicU64);

impl HighWater {
    pub fn observe(&self, value: u64) {
        self.0.fetch_max(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Count, total and worst case of a repeated operation's wall-clock time.
#[derive(Debug, Default)]
pub struct DurationAgg {
    count: AtomicU64,
    total_ns: AtomicU64,
    max_ns: AtomicU64,
}

impl DurationAgg {
    pub fn record(&self, dur: Duration) {
        let ns = u64::try_from(dur.as_nanos()).unwrap_or(u64::MAX);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ns.fetch_add(ns, Ordering::Relaxed);
        self.max_ns.fetch_max(ns, Ordering::Relaxed);
    }

    /// Starts a timer that records into this aggregate when dropped.
    pub fn time(&self) -> ScopedTimer<'_> {
        ScopedTimer {
            start: Instant::now(),
            agg: self,
        }
    }

    pub fn snapshot(&self) -> DurationSnapshot {
        DurationSnapshot {
            count: self.count.load(Ordering::Relaxed),
            total: Duration::from_nanos(self.total_ns.load(Ordering::Relaxed)),
            max: Duration::from_nanos(self.max_ns.load(Ordering::Relaxed)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationSnapshot {
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
}

impl DurationSnapshot {
    /// Zero when nothing was recorded.
    pub fn mean(&self) -> Duration {
        match u32::try_from(self.count) {
            Ok(0) => Duration::ZERO,
            Ok(count) => self.total / count,
            Err(_) => Duration::from_nanos(
                u64::try_from(self.total.as_nanos() / u128::from(self.count)).unwrap_or(u64::MAX),
            ),
        }
    }
}

pub struct ScopedTimer<'a> {
    start: Instant,
    agg: &'a DurationAgg,
}

impl Drop for ScopedTimer<'_> {
    fn drop(&mut self) {
        self.agg.record(self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_water_only_rises() {
        let hw = HighWater::default();
        hw.observe(5);
        hw.observe(3);
        assert_eq!(hw.get(), 5);
        hw.observe(9);
        assert_eq!(hw.get(), 9);
    }

    #[test]
    fn domain_counters_ignore_unknown_index() {
        let counters = DomainCounters::new(3);
        counters.inc(1);
        counters.inc(1);
        counters.inc(2);
        counters.inc(7);
        assert_eq!(counters.snapshot(), vec![0, 2, 1]);
        assert_eq!(counters.get(7), 0);
    }

    #[test]
    fn duration_agg_tracks_count_total_and_max() {
        let agg = DurationAgg::default();
        agg.record(Duration::from_millis(10));
        agg.record(Duration::from_millis(30));
        let snap = agg.snapshot();
        assert_eq!(snap.count, 2);
        assert_eq!(snap.total, Duration::from_millis(40));
        assert_eq!(snap.max, Duration::from_millis(30));
        assert_eq!(snap.mean(), Duration::from_millis(20));
        assert_eq!(DurationAgg::default().snapshot().mean(), Duration::ZERO);
    }

    #[test]
    fn timer_records_on_drop() {
        let agg = DurationAgg::default();
        {
            let _timer = agg.time();
        }
        assert_eq!(agg.snapshot().count, 1);
    }
}
