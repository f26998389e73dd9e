//! Whole-range table panels for cumulative counters.
//!
//! Rates are summed over coarse steps across the range instead of being taken
//! from the two endpoints, which would assume a linear trend.

use super::cumulative::{histogram_quantile, plain_value, unsupported};
use super::filter::series_filter;
use super::{group_by_ts, group_select, interval_bucket, samples_query, MetricContext};
use crate::error::{Result, ServiceError};
use crate::models::AggregateOperator;

const TABLE_BUCKET: &str = "toStartOfHour(now())";
const TABLE_TS: &str = "toStartOfHour(now()) as ts";

/// At most ~120 points, never finer than a minute, five times coarser past
/// half an hour.
pub(crate) fn table_step(start: i64, end: i64) -> i64 {
    let duration = (end - start + 1) / 1000;
    let step = (duration / 120).max(60);
    if duration > 1800 {
        step * 5
    } else {
        step
    }
}

pub(super) fn build(context: &MetricContext<'_>) -> Result<String> {
    let operator = context.query.aggregate_operator;
    let duration = (context.end - context.start + 1) / 1000;
    let step = table_step(context.start, context.end);
    // ranges shorter than a step still count as one point
    let points = (duration / step).max(1);

    let filter = series_filter(context, &context.group_by)?;
    let rate = context.rate_expression();
    let tags = &context.tags;
    let group_by = group_by_ts(tags);
    let group_tags = group_select(tags);
    let order_by = context.order_by(tags);

    let sql = match operator {
        AggregateOperator::Rate => {
            return Err(ServiceError::unsupported("rate is not supported for table view"))
        }
        AggregateOperator::Noop => {
            return Err(ServiceError::unsupported("noop is not supported for table view"))
        }
        AggregateOperator::SumRate
        | AggregateOperator::AvgRate
        | AggregateOperator::MaxRate
        | AggregateOperator::MinRate => {
            let func = operator.sql_function().ok_or_else(|| unsupported(operator))?;
            let per_series = samples_query(
                context,
                &format!("fingerprint, {group_tags}"),
                &interval_bucket(step),
                "max(value)",
                &filter,
                &format!("fingerprint, {group_by}"),
                &format!("fingerprint, {order_by}"),
            );
            let rates = format!(
                "SELECT {group_tags} ts, {rate}as value FROM({per_series}) WHERE isNaN(value) = 0"
            );
            format!(
                "SELECT {group_tags} {TABLE_BUCKET} as ts, {func}(value)/{points} as value FROM ({rates}) GROUP BY {group_by} ORDER BY {order_by} ts"
            )
        }
        AggregateOperator::RateSum
        | AggregateOperator::RateAvg
        | AggregateOperator::RateMax
        | AggregateOperator::RateMin => {
            let func = operator.sql_function().ok_or_else(|| unsupported(operator))?;
            let halves = (duration / 2).max(1);
            let aggregated = samples_query(
                context,
                &group_tags,
                &interval_bucket(halves),
                &format!("{func}(value)"),
                &filter,
                &group_by,
                &order_by,
            );
            format!(
                "SELECT {group_tags} {TABLE_BUCKET} as ts, {rate}as value FROM({aggregated}) WHERE isNaN(value) = 0"
            )
        }
        AggregateOperator::HistQuant50
        | AggregateOperator::HistQuant75
        | AggregateOperator::HistQuant90
        | AggregateOperator::HistQuant95
        | AggregateOperator::HistQuant99 => {
            let quantile = operator
                .histogram_quantile()
                .ok_or_else(|| unsupported(operator))?;
            let per_series = samples_query(
                context,
                &format!("fingerprint, {group_tags}"),
                &interval_bucket(step),
                "max(value)",
                &filter,
                &format!("fingerprint, {group_by}"),
                &format!("fingerprint, {order_by}"),
            );
            let rates = format!(
                "SELECT {group_tags} ts, {rate} as value FROM({per_series}) WHERE isNaN(value) = 0"
            );
            let buckets = format!(
                "SELECT {group_tags} {TABLE_BUCKET} as ts, sum(value)/{points} as value FROM ({rates}) GROUP BY {group_by} HAVING isNaN(value) = 0 ORDER BY {order_by} ts"
            );
            histogram_quantile(context, quantile, &buckets, TABLE_TS)
        }
        other => {
            let value = plain_value(other).ok_or_else(|| unsupported(other))?;
            samples_query(
                context,
                &group_tags,
                TABLE_BUCKET,
                &value,
                &filter,
                &group_by,
                &order_by,
            )
        }
    };
    Ok(sql)
}
