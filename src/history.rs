use std::collections::VecDeque;

use polars::prelude::*;

pub const TIME_COLUMN_NAME: &str = "time";
pub const BLOCK_COLUMN_NAME: &str = "block";
pub const EVENTS_COLUMN_NAME: &str = "events";

/// Name of the averages column of `channel`.
pub fn average_column_name(channel: usize) -> String {
    format!("ch{channel}_avg")
}

#[derive(Debug, Clone, PartialEq)]
struct BlockRecord {
    block: u64,
    averages: Vec<f64>,
    events: u32,
}

/// Bounded record of recent block averages, exported as a `DataFrame`.
#[derive(Debug, Clone)]
pub struct AverageHistory {
    channel_count: usize,
    seconds_per_block: f64,
    capacity: usize,
    records: VecDeque<BlockRecord>,
}

impl AverageHistory {
    pub fn new(
        channel_count: usize,
        samples_per_block: usize,
        sample_rate: f64,
        capacity: usize,
    ) -> Self {
        Self {
            channel_count,
            seconds_per_block: samples_per_block as f64 / sample_rate,
            capacity,
            records: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Append one block, evicting the oldest when full.
    pub fn push(&mut self, block: u64, averages: &[f64], events: u32) {
        if self.capacity == 0 {
            return;
        }
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(BlockRecord {
            block,
            averages: averages.to_vec(),
            events,
        });
    }

    /// One row per recorded block: end-of-block time in seconds, block
    /// index, one averages column per channel, and the number of events.
    pub fn to_dataframe(&self) -> PolarsResult<DataFrame> {
        let blocks: Vec<u64> = self.records.iter().map(|r| r.block).collect();
        let times: Vec<f64> = blocks
            .iter()
            .map(|&b| (b + 1) as f64 * self.seconds_per_block)
            .collect();
        let events: Vec<u32> = self.records.iter().map(|r| r.events).collect();

        let mut columns: Vec<Column> = vec![
            Series::new(TIME_COLUMN_NAME.into(), times).into(),
            Series::new(BLOCK_COLUMN_NAME.into(), blocks).into(),
        ];
        for channel in 0..self.channel_count {
            let values: Vec<f64> = self
                .records
                .iter()
                .map(|r| r.averages.get(channel).copied().unwrap_or(f64::NAN))
                .collect();
            columns.push(Series::new(average_column_name(channel).into(), values).into());
        }
        columns.push(Series::new(EVENTS_COLUMN_NAME.into(), events).into());

        DataFrame::new(columns)
    }

    /// Per-channel mean, min and max over the recorded blocks plus the
    /// total number of events.
    pub fn summary(&self) -> PolarsResult<DataFrame> {
        let mut exprs = Vec::with_capacity(self.channel_count * 3 + 1);
        for channel in 0..self.channel_count {
            let name = average_column_name(channel);
            exprs.push(col(name.as_str()).mean().alias(format!("ch{channel}_mean")));
            exprs.push(col(name.as_str()).min().alias(format!("ch{channel}_min")));
            exprs.push(col(name.as_str()).max().alias(format!("ch{channel}_max")));
        }
        exprs.push(
            col(EVENTS_COLUMN_NAME)
                .cast(DataType::UInt64)
                .sum()
                .alias(EVENTS_COLUMN_NAME),
        );

        self.to_dataframe()?.lazy().select(exprs).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataframe_shape() {
        let mut history = AverageHistory::new(2, 200, 250.0, 8);
        history.push(0, &[1.0, 7.0], 1);
        history.push(1, &[2.0, 3.0], 0);

        let df = history.to_dataframe().unwrap();
        assert_eq!(df.height(), 2);
        assert_eq!(df.width(), 5);

        let times: Vec<f64> = df
            .column(TIME_COLUMN_NAME)
            .unwrap()
            .f64()
            .unwrap()
            .into_no_null_iter()
            .collect();
        assert!((times[0] - 0.8).abs() < 1e-12);
        assert!((times[1] - 1.6).abs() < 1e-12);

        let ch1: Vec<f64> = df
            .column(&average_column_name(1))
            .unwrap()
            .f64()
            .unwrap()
            .into_no_null_iter()
            .collect();
        assert_eq!(ch1, vec![7.0, 3.0]);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut history = AverageHistory::new(1, 10, 100.0, 2);
        for block in 0..5 {
            history.push(block, &[block as f64], 0);
        }
        assert_eq!(history.len(), 2);

        let df = history.to_dataframe().unwrap();
        let blocks: Vec<u64> = df
            .column(BLOCK_COLUMN_NAME)
            .unwrap()
            .u64()
            .unwrap()
            .into_no_null_iter()
            .collect();
        assert_eq!(blocks, vec![3, 4]);
    }

    #[test]
    fn test_disabled_history_records_nothing() {
        let mut history = AverageHistory::new(4, 200, 250.0, 0);
        history.push(0, &[0.0; 4], 0);
        assert!(history.is_empty());
        assert_eq!(history.to_dataframe().unwrap().height(), 0);
    }

    #[test]
    fn test_huge_capacity_grows_on_demand() {
        let mut history = AverageHistory::new(2, 200, 250.0, usize::MAX);
        assert!(history.is_empty());
        history.push(0, &[1.0, 2.0], 0);
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_summary() {
        let mut history = AverageHistory::new(1, 10, 100.0, 4);
        history.push(0, &[1.0], 0);
        history.push(1, &[3.0], 1);
        history.push(2, &[8.0], 1);

        let summary = history.summary().unwrap();
        assert_eq!(summary.height(), 1);
        let mean = summary.column("ch0_mean").unwrap().f64().unwrap().get(0);
        assert_eq!(mean, Some(4.0));
        let max = summary.column("ch0_max").unwrap().f64().unwrap().get(0);
        assert_eq!(max, Some(8.0));
        let events = summary.column(EVENTS_COLUMN_NAME).unwrap().u64().unwrap().get(0);
        assert_eq!(events, Some(2));
    }
}
