//! Delta temporality: samples already hold per-interval increments, so rates
//! are plain sums over the bucket divided by its width.

use super::cumulative::{histogram_quantile, noop_query, plain_value, unsupported};
use super::filter::series_filter;
use super::{group_by_ts, group_select, grouping_sets, interval_bucket, samples_query, MetricContext};
use crate::error::{Result, ServiceError};
use crate::models::AggregateOperator;
use crate::query::format::fixed;

const TABLE_BUCKET: &str = "toStartOfHour(now())";

pub(super) fn build(context: &MetricContext<'_>) -> Result<String> {
    let bucket = interval_bucket(context.step);
    let groups = grouping_sets(&context.tags);
    build_with(context, &bucket, context.step, &groups)
}

/// Whole-range variant: one bucket, rates divided by the range in seconds.
pub(super) fn build_table(context: &MetricContext<'_>) -> Result<String> {
    if context.query.aggregate_operator == AggregateOperator::Noop {
        return Err(ServiceError::unsupported("noop is not supported for table view"));
    }
    let seconds = (context.end - context.start + 1) / 1000;
    let groups = group_by_ts(&context.tags);
    build_with(context, TABLE_BUCKET, seconds, &groups)
}

fn denominator(seconds: i64, prefer_rpm: bool) -> String {
    if prefer_rpm {
        fixed(seconds as f64 / 60.0)
    } else {
        seconds.to_string()
    }
}

fn build_with(
    context: &MetricContext<'_>,
    bucket: &str,
    seconds: i64,
    groups: &str,
) -> Result<String> {
    let operator = context.query.aggregate_operator;
    let filter = series_filter(context, &context.group_by)?;
    let per = denominator(seconds, context.prefer_rpm);

    let tags = &context.tags;
    let group_tags = group_select(tags);
    let order_by = context.order_by(tags);

    let sql = match operator {
        AggregateOperator::Rate => samples_query(
            context,
            "fingerprint, any(labels) as fullLabels,",
            bucket,
            &format!("sum(value)/{per}"),
            &filter,
            "fingerprint, ts",
            "fingerprint, ",
        ),
        AggregateOperator::SumRate
        | AggregateOperator::AvgRate
        | AggregateOperator::MaxRate
        | AggregateOperator::MinRate
        | AggregateOperator::RateSum
        | AggregateOperator::RateAvg
        | AggregateOperator::RateMax
        | AggregateOperator::RateMin => {
            let func = operator.sql_function().ok_or_else(|| unsupported(operator))?;
            samples_query(
                context,
                &group_tags,
                bucket,
                &format!("{func}(value)/{per}"),
                &filter,
                groups,
                &order_by,
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
            let buckets = samples_query(
                context,
                &group_tags,
                bucket,
                &format!("sum(value)/{per}"),
                &filter,
                &group_by_ts(tags),
                &order_by,
            );
            histogram_quantile(context, quantile, &buckets, "ts")
        }
        AggregateOperator::Noop => noop_query(context, &filter, bucket),
        other => {
            let value = plain_value(other).ok_or_else(|| unsupported(other))?;
            samples_query(context, &group_tags, bucket, &value, &filter, groups, &order_by)
        }
    };
    Ok(sql)
}

#[cfg(test)]
mod tests {
    use crate::models::{
        AggregateOperator, AttributeKey, AttributeKeyType, BuilderQuery, DataSource, DataType,
        PanelType, Temporality,
    };
    use crate::query::metrics::compile;
    use pretty_assertions::assert_eq;

    const START: i64 = 1650991982000;
    const END: i64 = 1651078382000;

    fn delta_query(operator: AggregateOperator) -> BuilderQuery {
        let mut query = BuilderQuery::new(DataSource::Metrics, operator);
        query.aggregate_attribute = AttributeKey::new(
            "signoz_latency_count",
            DataType::Float64,
            AttributeKeyType::Unspecified,
        );
        query.temporality = Temporality::Delta;
        query
    }

    #[test]
    fn rate_divides_bucket_sum_by_step() {
        let sql = compile(START, END, PanelType::Graph, &delta_query(AggregateOperator::Rate), false)
            .unwrap()
            .to_string();
        assert_eq!(
            sql,
            "SELECT fingerprint, any(labels) as fullLabels, toStartOfInterval(toDateTime(intDiv(timestamp_ms, 1000)), INTERVAL 60 SECOND) as ts, sum(value)/60 as value FROM signoz_metrics.distributed_samples_v2 INNER JOIN (SELECT labels, fingerprint FROM signoz_metrics.time_series_v2 WHERE metric_name = 'signoz_latency_count' AND temporality = 'Delta' ) as filtered_time_series USING fingerprint WHERE metric_name = 'signoz_latency_count' AND timestamp_ms >= 1650991982000 AND timestamp_ms <= 1651078382000 GROUP BY fingerprint, ts ORDER BY fingerprint,  ts"
        );
    }

    #[test]
    fn prefer_rpm_uses_minutes() {
        let mut query = delta_query(AggregateOperator::SumRate);
        query.step_interval = 30;
        let sql = compile(START, END, PanelType::Graph, &query, true)
            .unwrap()
            .to_string();
        assert!(sql.contains(" sum(value)/0.500000 as value "), "got: {sql}");
    }

    #[test]
    fn table_uses_whole_range() {
        let mut query = delta_query(AggregateOperator::RateSum);
        query.group_by = vec![AttributeKey::new(
            "service_name",
            DataType::String,
            AttributeKeyType::Tag,
        )];
        let sql = compile(START, END, PanelType::Table, &query, false)
            .unwrap()
            .to_string();
        assert!(sql.starts_with("SELECT service_name,  toStartOfHour(now()) as ts, sum(value)/86400 as value FROM"));
        assert!(sql.ends_with("GROUP BY service_name,ts ORDER BY service_name ASC, ts"));
    }

    #[test]
    fn histogram_quantile_over_bucket_rates() {
        let sql = compile(
            START,
            END,
            PanelType::Graph,
            &delta_query(AggregateOperator::HistQuant50),
            false,
        )
        .unwrap()
        .to_string();
        assert!(sql.starts_with("SELECT  ts, histogramQuantile(arrayMap(x -> toFloat64(x), groupArray(le)), groupArray(value), 0.500) as value FROM (SELECT le,  toStartOfInterval"));
        assert!(sql.contains("sum(value)/60 as value"));
    }
}
