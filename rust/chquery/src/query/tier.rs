//! Physical table selection for metrics by query range.
//!
//! Two independent choices are made: the samples table (raw or a rollup) and
//! the time-series identity table used by the fingerprint lookup.

use crate::error::{Result, ServiceError};
use crate::models::{Temporality, TimeAggregation};

const HOUR_MS: i64 = 60 * 60 * 1000;
const DAY_MS: i64 = 24 * HOUR_MS;
const WEEK_MS: i64 = 7 * DAY_MS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesTable {
    Hourly,
    SixHourly,
    Daily,
    Weekly,
}

impl SeriesTable {
    pub fn table_name(self) -> &'static str {
        match self {
            SeriesTable::Hourly => "signoz_metrics.time_series_v4",
            SeriesTable::SixHourly => "signoz_metrics.time_series_v4_6hrs",
            SeriesTable::Daily => "signoz_metrics.time_series_v4_1day",
            SeriesTable::Weekly => "signoz_metrics.time_series_v4_1week",
        }
    }

    pub fn bucket_ms(self) -> i64 {
        match self {
            SeriesTable::Hourly => HOUR_MS,
            SeriesTable::SixHourly => 6 * HOUR_MS,
            SeriesTable::Daily => DAY_MS,
            SeriesTable::Weekly => WEEK_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplesTable {
    Raw,
    FiveMinute,
    ThirtyMinute,
    ExponentialHistogram,
}

impl SamplesTable {
    pub fn table_name(self) -> &'static str {
        match self {
            SamplesTable::Raw => "signoz_metrics.distributed_samples_v4",
            SamplesTable::FiveMinute => "signoz_metrics.distributed_samples_v4_agg_5m",
            SamplesTable::ThirtyMinute => "signoz_metrics.distributed_samples_v4_agg_30m",
            SamplesTable::ExponentialHistogram => "signoz_metrics.distributed_exp_hist",
        }
    }

    pub fn bucket_ms(self) -> Option<i64> {
        match self {
            SamplesTable::FiveMinute => Some(5 * 60 * 1000),
            SamplesTable::ThirtyMinute => Some(30 * 60 * 1000),
            SamplesTable::Raw | SamplesTable::ExponentialHistogram => None,
        }
    }

    pub fn is_rollup(self) -> bool {
        self.bucket_ms().is_some()
    }
}

fn floor_to(value: i64, bucket: i64) -> i64 {
    value - value.rem_euclid(bucket)
}

/// Picks the identity table for `[start, end]` (epoch ms) and floors the
/// start to that table's bucket.
pub fn series_table(start: i64, end: i64) -> (i64, SeriesTable) {
    let range = end - start;
    let table = if range < 6 * HOUR_MS {
        SeriesTable::Hourly
    } else if range < DAY_MS {
        SeriesTable::SixHourly
    } else if range < WEEK_MS {
        SeriesTable::Daily
    } else {
        SeriesTable::Weekly
    };
    (floor_to(start, table.bucket_ms()), table)
}

/// Picks the samples table. Distinct counts and exponential histograms
/// cannot be served from rollups.
pub fn samples_table(
    start: i64,
    end: i64,
    has_count_distinct: bool,
    exponential_histogram: bool,
) -> SamplesTable {
    if exponential_histogram {
        return SamplesTable::ExponentialHistogram;
    }
    if has_count_distinct {
        return SamplesTable::Raw;
    }
    let range = end - start;
    if range < DAY_MS {
        SamplesTable::Raw
    } else if range < WEEK_MS {
        SamplesTable::FiveMinute
    } else {
        SamplesTable::ThirtyMinute
    }
}

/// Result of tier selection for one metrics query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierSelection {
    pub temporality: Temporality,
    pub series: SeriesTable,
    pub series_start: i64,
    pub samples: SamplesTable,
    pub samples_start: i64,
    pub end: i64,
}

pub fn select_tier(
    start: i64,
    end: i64,
    temporality: Temporality,
    has_count_distinct: bool,
    exponential_histogram: bool,
) -> TierSelection {
    let (series_start, series) = series_table(start, end);
    let samples = samples_table(start, end, has_count_distinct, exponential_histogram);
    let samples_start = samples
        .bucket_ms()
        .map(|bucket| floor_to(start, bucket))
        .unwrap_or(start);

    TierSelection {
        temporality,
        series,
        series_start,
        samples,
        samples_start,
        end,
    }
}

impl TierSelection {
    /// Per-series aggregation over the selected samples table.
    pub fn value_column(&self, aggregation: TimeAggregation) -> Result<&'static str> {
        let rollup = self.samples.is_rollup();
        let column = match (aggregation, rollup) {
            (TimeAggregation::Latest, false) => "anyLast(value)",
            (TimeAggregation::Latest, true) => "anyLast(last)",
            (TimeAggregation::Sum, false) => "sum(value)",
            (TimeAggregation::Sum, true) => "sum(sum)",
            (TimeAggregation::Avg, false) => "avg(value)",
            (TimeAggregation::Avg, true) => "sum(sum) / sum(count)",
            (TimeAggregation::Min, false) => "min(value)",
            (TimeAggregation::Min, true) => "min(min)",
            (TimeAggregation::Max, false) => "max(value)",
            (TimeAggregation::Max, true) => "max(max)",
            (TimeAggregation::Count, false) => "count(value)",
            (TimeAggregation::Count, true) => "sum(count)",
            (TimeAggregation::CountDistinct, false) => "countDistinct(value)",
            (TimeAggregation::CountDistinct, true) => {
                return Err(ServiceError::unsupported(
                    "count_distinct cannot be computed from rollup tables",
                ))
            }
            (TimeAggregation::Rate | TimeAggregation::Increase, rollup) => {
                match (self.temporality, rollup) {
                    (Temporality::Delta, false) => "sum(value)",
                    (Temporality::Delta, true) => "sum(sum)",
                    (Temporality::Cumulative, false) => "max(value)",
                    (Temporality::Cumulative, true) => "max(max)",
                    (Temporality::Unspecified, _) => {
                        return Err(ServiceError::unsupported(
                            "rate and increase require a Delta or Cumulative metric",
                        ))
                    }
                }
            }
        };
        Ok(column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const START: i64 = 1_701_794_980_000;

    #[test]
    fn series_tiers_floor_start() {
        let (start, table) = series_table(START, START + HOUR_MS);
        assert_eq!(table, SeriesTable::Hourly);
        assert_eq!(start % HOUR_MS, 0);
        assert!(start <= START && START - start < HOUR_MS);

        assert_eq!(series_table(START, START + 7 * HOUR_MS).1, SeriesTable::SixHourly);
        assert_eq!(series_table(START, START + 2 * DAY_MS).1, SeriesTable::Daily);
        let (start, table) = series_table(START, START + 30 * DAY_MS);
        assert_eq!(table, SeriesTable::Weekly);
        assert_eq!(start % WEEK_MS, 0);
    }

    #[test]
    fn samples_tiers_by_range() {
        assert_eq!(samples_table(START, START + HOUR_MS, false, false), SamplesTable::Raw);
        assert_eq!(
            samples_table(START, START + 2 * DAY_MS, false, false),
            SamplesTable::FiveMinute
        );
        assert_eq!(
            samples_table(START, START + 8 * DAY_MS, false, false),
            SamplesTable::ThirtyMinute
        );
        assert_eq!(
            samples_table(START, START + 8 * DAY_MS, true, false),
            SamplesTable::Raw
        );
        assert_eq!(
            samples_table(START, START + HOUR_MS, false, true),
            SamplesTable::ExponentialHistogram
        );
    }

    #[test]
    fn rollup_start_is_bucket_aligned() {
        let tier = select_tier(START + 1234, START + 2 * DAY_MS, Temporality::Delta, false, false);
        assert_eq!(tier.samples, SamplesTable::FiveMinute);
        assert_eq!(tier.samples_start % (5 * 60 * 1000), 0);
        assert_eq!(tier.series, SeriesTable::Daily);
    }

    #[test]
    fn value_column_depends_on_temporality_and_rollup() {
        let raw = select_tier(START, START + HOUR_MS, Temporality::Cumulative, false, false);
        assert_eq!(raw.value_column(TimeAggregation::Rate).unwrap(), "max(value)");
        assert_eq!(raw.value_column(TimeAggregation::Avg).unwrap(), "avg(value)");

        let rolled = select_tier(START, START + 2 * DAY_MS, Temporality::Delta, false, false);
        assert_eq!(rolled.value_column(TimeAggregation::Increase).unwrap(), "sum(sum)");
        assert_eq!(
            rolled.value_column(TimeAggregation::Avg).unwrap(),
            "sum(sum) / sum(count)"
        );

        let gauge = select_tier(START, START + HOUR_MS, Temporality::Unspecified, false, false);
        assert!(gauge.value_column(TimeAggregation::Rate).is_err());
    }
}
