//! Rolls finer streamed bars up into the period a channel asked for.
//!
//! Some venues only stream one-minute aggregates. The builder keeps one open
//! bucket per channel and returns the running bar for that bucket after every
//! input, so listeners see a coarse bar that updates in place.

use std::collections::HashMap;

use crate::domain::value_objects::bar::Bar;
use crate::domain::value_objects::channel::ChannelKey;

#[derive(Debug, Clone)]
struct Bucket {
    start: i64,
    /// Merge of every input bar older than `latest`.
    settled: Option<Bar>,
    /// Most recent input; may still be replaced by an update with the same timestamp.
    latest: Bar,
}

impl Bucket {
    fn running(&self) -> Bar {
        let mut bar = match &self.settled {
            Some(settled) => merge(settled, &self.latest),
            None => self.latest,
        };
        bar.timestamp = self.start;
        bar
    }
}

#[derive(Debug, Default)]
pub struct CandleBuilder {
    buckets: HashMap<ChannelKey, Bucket>,
}

impl CandleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds `bar` into the channel's current bucket and returns the running
    /// bar. Inputs older than the latest one seen are dropped.
    pub fn fold(&mut self, channel: &ChannelKey, bar: &Bar) -> Option<Bar> {
        let span = channel.period.millis();
        let start = bar.timestamp - bar.timestamp.rem_euclid(span);

        let stale = self.buckets.get(channel).is_some_and(|bucket| {
            start < bucket.start
                || (start == bucket.start && bar.timestamp < bucket.latest.timestamp)
        });
        if stale {
            return None;
        }

        let fresh = Bucket {
            start,
            settled: None,
            latest: *bar,
        };
        let bucket = self
            .buckets
            .entry(channel.clone())
            .or_insert_with(|| fresh.clone());
        if bucket.start != start {
            *bucket = fresh;
        } else if bar.timestamp > bucket.latest.timestamp {
            bucket.settled = Some(match &bucket.settled {
                Some(settled) => merge(settled, &bucket.latest),
                None => bucket.latest,
            });
            bucket.latest = *bar;
        } else {
            bucket.latest = *bar;
        }
        Some(bucket.running())
    }

    pub fn remove(&mut self, channel: &ChannelKey) {
        self.buckets.remove(channel);
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
    }
}

fn merge(earlier: &Bar, later: &Bar) -> Bar {
    Bar {
        timestamp: earlier.timestamp,
        open: earlier.open,
        high: earlier.high.max(later.high),
        low: earlier.low.min(later.low),
        close: later.close,
        volume: earlier.volume + later.volume,
        turnover: earlier.turnover + later.turnover,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::venue::Venue;

    const MINUTE: i64 = 60_000;

    fn hourly() -> ChannelKey {
        ChannelKey::new(Venue::Polygon, "AAPL", "1H".parse().unwrap())
    }

    #[test]
    fn test_minutes_fold_into_running_hour() {
        let mut builder = CandleBuilder::new();
        let channel = hourly();

        builder.fold(&channel, &Bar::new(0, 10.0, 12.0, 9.0, 11.0, 100.0));
        let bar = builder
            .fold(&channel, &Bar::new(MINUTE, 11.0, 15.0, 10.0, 14.0, 50.0))
            .unwrap();

        assert_eq!(bar.timestamp, 0);
        assert_eq!(bar.open, 10.0);
        assert_eq!(bar.high, 15.0);
        assert_eq!(bar.low, 9.0);
        assert_eq!(bar.close, 14.0);
        assert_eq!(bar.volume, 150.0);
    }

    #[test]
    fn test_same_minute_update_replaces_instead_of_adding() {
        let mut builder = CandleBuilder::new();
        let channel = hourly();
        builder.fold(&channel, &Bar::new(0, 10.0, 11.0, 10.0, 11.0, 100.0));
        let bar = builder
            .fold(&channel, &Bar::new(0, 10.0, 12.0, 10.0, 12.0, 120.0))
            .unwrap();
        assert_eq!(bar.volume, 120.0);
        assert_eq!(bar.close, 12.0);
    }

    #[test]
    fn test_next_hour_starts_new_bucket_and_stale_input_is_dropped() {
        let mut builder = CandleBuilder::new();
        let channel = hourly();
        builder.fold(&channel, &Bar::new(59 * MINUTE, 10.0, 11.0, 9.0, 10.5, 1.0));
        let bar = builder
            .fold(&channel, &Bar::new(60 * MINUTE, 20.0, 21.0, 19.0, 20.5, 2.0))
            .unwrap();
        assert_eq!(bar.timestamp, 60 * MINUTE);
        assert_eq!(bar.open, 20.0);
        assert!(builder
            .fold(&channel, &Bar::new(58 * MINUTE, 1.0, 1.0, 1.0, 1.0, 1.0))
            .is_none());
    }
}
