use serde::{Deserialize, Serialize};

/// OHLCV bar. Timestamps are epoch milliseconds of the bar open.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default)]
    pub turnover: f64,
}

impl Bar {
    pub fn new(timestamp: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
            turnover: 0.0,
        }
    }

    pub fn with_turnover(mut self, turnover: f64) -> Self {
        self.turnover = turnover;
        self
    }
}

/// Bars ordered by timestamp. A bar whose timestamp is already present
/// replaces the stored one instead of being appended.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BarSeries {
    bars: Vec<Bar>,
}

impl BarSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, bar: Bar) {
        match self
            .bars
            .binary_search_by_key(&bar.timestamp, |existing| existing.timestamp)
        {
            Ok(index) => self.bars[index] = bar,
            Err(index) => self.bars.insert(index, bar),
        }
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn last(&self) -> Option<&Bar> {
        self.bars.last()
    }

    pub fn as_slice(&self) -> &[Bar] {
        &self.bars
    }

    pub fn into_vec(self) -> Vec<Bar> {
        self.bars
    }
}

impl FromIterator<Bar> for BarSeries {
    fn from_iter<I: IntoIterator<Item = Bar>>(iter: I) -> Self {
        let mut series = BarSeries::new();
        series.extend(iter);
        series
    }
}

impl Extend<Bar> for BarSeries {
    fn extend<I: IntoIterator<Item = Bar>>(&mut self, iter: I) {
        for bar in iter {
            self.upsert(bar);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(timestamp: i64, close: f64) -> Bar {
        Bar::new(timestamp, close, close, close, close, 1.0)
    }

    #[test]
    fn test_out_of_order_bars_are_sorted() {
        let series: BarSeries = vec![bar(3, 3.0), bar(1, 1.0), bar(2, 2.0)].into_iter().collect();
        let timestamps: Vec<i64> = series.as_slice().iter().map(|b| b.timestamp).collect();
        assert_eq!(timestamps, vec![1, 2, 3]);
    }

    #[test]
    fn test_duplicate_timestamp_overwrites() {
        let mut series = BarSeries::new();
        series.upsert(bar(60_000, 100.0));
        series.upsert(bar(60_000, 101.5));
        assert_eq!(series.len(), 1);
        assert_eq!(series.last().unwrap().close, 101.5);
    }
}
