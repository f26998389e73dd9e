//! Operator pipelines for cumulative (and untagged) counters.

use super::filter::series_filter;
use super::{
    group_by_ts, group_select, grouping_sets, interval_bucket, samples_query, MetricContext,
    SAMPLES_TABLE,
};
use crate::error::{Result, ServiceError};
use crate::models::AggregateOperator;

/// Value expression of operators that aggregate samples directly, with no
/// rate stage.
pub(super) fn plain_value(operator: AggregateOperator) -> Option<String> {
    if let Some(fraction) = operator.percentile() {
        return Some(format!("quantile({fraction})(value)"));
    }
    match operator {
        AggregateOperator::Sum
        | AggregateOperator::Avg
        | AggregateOperator::Min
        | AggregateOperator::Max => operator.sql_function().map(|func| format!("{func}(value)")),
        AggregateOperator::Count => Some("toFloat64(count(*))".to_string()),
        AggregateOperator::CountDistinct => Some("toFloat64(count(distinct(value)))".to_string()),
        _ => None,
    }
}

/// Raw per-fingerprint samples, one value per bucket.
pub(super) fn noop_query(context: &MetricContext<'_>, filter: &str, bucket: &str) -> String {
    format!(
        "SELECT fingerprint, labels as fullLabels, {bucket} as ts, any(value) as value FROM {SAMPLES_TABLE} INNER JOIN ({filter}) as filtered_time_series USING fingerprint WHERE {} GROUP BY fingerprint, labels, ts ORDER BY fingerprint, labels, ts",
        context.samples_time_filter()
    )
}

pub(super) fn unsupported(operator: AggregateOperator) -> ServiceError {
    ServiceError::unsupported(format!(
        "unsupported aggregate operator {}",
        operator.as_str()
    ))
}

pub(super) fn build(context: &MetricContext<'_>) -> Result<String> {
    let operator = context.query.aggregate_operator;
    let filter = series_filter(context, &context.group_by)?;
    let bucket = interval_bucket(context.step);
    let rate = context.rate_expression();

    let tags = &context.tags;
    let group_by = group_by_ts(tags);
    let group_tags = group_select(tags);
    let sets = grouping_sets(tags);
    let order_by = context.order_by(tags);

    let sql = match operator {
        AggregateOperator::Rate => {
            let per_series = samples_query(
                context,
                "any(labels) as labels, fingerprint,",
                &bucket,
                "max(value)",
                &filter,
                "fingerprint, ts",
                "fingerprint, ",
            );
            format!(
                "SELECT labels as fullLabels, ts, {rate} as value FROM({per_series}) WHERE isNaN(value) = 0"
            )
        }
        AggregateOperator::SumRate
        | AggregateOperator::AvgRate
        | AggregateOperator::MaxRate
        | AggregateOperator::MinRate => {
            let func = operator.sql_function().ok_or_else(|| unsupported(operator))?;
            let per_series = samples_query(
                context,
                &format!("fingerprint, {group_tags}"),
                &bucket,
                "max(value)",
                &filter,
                &format!("fingerprint, {group_by}"),
                &format!("fingerprint, {order_by}"),
            );
            let rates = format!(
                "SELECT {group_tags} ts, {rate}as value FROM({per_series}) WHERE isNaN(value) = 0"
            );
            format!(
                "SELECT {group_tags} ts, {func}(value) as value FROM ({rates}) GROUP BY {sets} ORDER BY {order_by} ts"
            )
        }
        AggregateOperator::RateSum
        | AggregateOperator::RateAvg
        | AggregateOperator::RateMax
        | AggregateOperator::RateMin => {
            let func = operator.sql_function().ok_or_else(|| unsupported(operator))?;
            let aggregated = samples_query(
                context,
                &group_tags,
                &bucket,
                &format!("{func}(value)"),
                &filter,
                &sets,
                &order_by,
            );
            format!(
                "SELECT {group_tags} ts, {rate}as value FROM({aggregated}) WHERE isNaN(value) = 0"
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
                &bucket,
                "max(value)",
                &filter,
                &format!("fingerprint, {group_by}"),
                &format!("fingerprint, {order_by}"),
            );
            let rates = format!(
                "SELECT {group_tags} ts, {rate} as value FROM({per_series}) WHERE isNaN(value) = 0"
            );
            let buckets = format!(
                "SELECT {group_tags} ts, sum(value) as value FROM ({rates}) GROUP BY {sets} HAVING isNaN(value) = 0 ORDER BY {order_by} ts"
            );
            histogram_quantile(context, quantile, &buckets, "ts")
        }
        AggregateOperator::Noop => noop_query(context, &filter, &bucket),
        other => {
            let value = plain_value(other).ok_or_else(|| unsupported(other))?;
            samples_query(context, &group_tags, &bucket, &value, &filter, &sets, &order_by)
        }
    };
    Ok(sql)
}

/// Folds `le`-grouped bucket values into a quantile per remaining group.
pub(super) fn histogram_quantile(
    context: &MetricContext<'_>,
    quantile: &str,
    buckets: &str,
    ts: &str,
) -> String {
    let tags = &context.tags_without_le;
    format!(
        "SELECT {} {ts}, histogramQuantile(arrayMap(x -> toFloat64(x), groupArray(le)), groupArray(value), {quantile}) as value FROM ({buckets}) GROUP BY {} ORDER BY {} ts",
        group_select(tags),
        group_by_ts(tags),
        context.order_by(tags)
    )
}

#[cfg(test)]
mod tests {
    use crate::models::{
        AggregateOperator, AttributeKey, AttributeKeyType, BuilderQuery, DataSource, DataType,
        FilterItem, FilterOperator, FilterSet, PanelType, Temporality,
    };
    use crate::query::metrics::compile;
    use pretty_assertions::assert_eq;

    const START: i64 = 1650991982000;
    const END: i64 = 1651078382000;

    fn metric_query(operator: AggregateOperator) -> BuilderQuery {
        let mut query = BuilderQuery::new(DataSource::Metrics, operator);
        query.aggregate_attribute =
            AttributeKey::new("name", DataType::Float64, AttributeKeyType::Unspecified);
        query.temporality = Temporality::Cumulative;
        query
    }

    fn graph(query: &BuilderQuery, prefer_rpm: bool) -> String {
        compile(START, END, PanelType::Graph, query, prefer_rpm)
            .unwrap()
            .to_string()
    }

    #[test]
    fn plain_sum_uses_grouping_sets() {
        let query = metric_query(AggregateOperator::Sum);
        assert_eq!(
            graph(&query, false),
            "SELECT  toStartOfInterval(toDateTime(intDiv(timestamp_ms, 1000)), INTERVAL 60 SECOND) as ts, sum(value) as value FROM signoz_metrics.distributed_samples_v2 INNER JOIN (SELECT  fingerprint FROM signoz_metrics.time_series_v2 WHERE metric_name = 'name' AND temporality IN ['Cumulative', 'Unspecified']) as filtered_time_series USING fingerprint WHERE metric_name = 'name' AND timestamp_ms >= 1650991982000 AND timestamp_ms <= 1651078382000 GROUP BY GROUPING SETS ( (ts), () ) ORDER BY  ts"
        );
    }

    #[test]
    fn rate_is_per_fingerprint() {
        let mut query = metric_query(AggregateOperator::Rate);
        query.filters = Some(FilterSet::and(vec![FilterItem::new(
            AttributeKey::new("in", DataType::String, AttributeKeyType::Tag),
            FilterOperator::In,
            crate::models::FilterValue::Array(vec!["a".into(), "b".into(), "c".into()]),
        )]));
        let sql = graph(&query, false);
        assert!(sql.starts_with("SELECT labels as fullLabels, ts, if(runningDifference(ts) <= 0, nan, if(runningDifference(value) < 0, (value) / runningDifference(ts), runningDifference(value) / runningDifference(ts)))  as value FROM(SELECT any(labels) as labels, fingerprint, toStartOfInterval"));
        assert!(sql.contains("INNER JOIN (SELECT labels, fingerprint FROM signoz_metrics.time_series_v2 WHERE metric_name = 'name' AND temporality IN ['Cumulative', 'Unspecified'] AND JSONExtractString(labels, 'in') IN ['a','b','c']) as filtered_time_series"));
        assert!(sql.ends_with("GROUP BY fingerprint, ts ORDER BY fingerprint,  ts) WHERE isNaN(value) = 0"));
    }

    #[test]
    fn prefer_rpm_scales_rate() {
        let sql = graph(&metric_query(AggregateOperator::SumRate), true);
        assert!(sql.contains("(value*60) / runningDifference(ts)"));
        assert!(!graph(&metric_query(AggregateOperator::SumRate), false).contains("value*60"));
    }

    #[test]
    fn sum_rate_aggregates_after_rate() {
        let mut query = metric_query(AggregateOperator::SumRate);
        query.group_by = vec![AttributeKey::new(
            "service_name",
            DataType::String,
            AttributeKeyType::Tag,
        )];
        let sql = graph(&query, false);
        assert!(sql.starts_with("SELECT service_name,  ts, sum(value) as value FROM (SELECT service_name,  ts, if(runningDifference(ts)"));
        assert!(sql.contains("SELECT fingerprint, service_name,  toStartOfInterval"));
        assert!(sql.contains("(SELECT  JSONExtractString(labels, 'service_name') as service_name, fingerprint FROM signoz_metrics.time_series_v2"));
        assert!(sql.ends_with("GROUP BY GROUPING SETS ( (service_name, ts), (service_name) ) ORDER BY service_name ASC, ts"));
    }

    #[test]
    fn histogram_quantile_adds_le() {
        let mut query = metric_query(AggregateOperator::HistQuant95);
        query.group_by = vec![AttributeKey::new(
            "service_name",
            DataType::String,
            AttributeKeyType::Tag,
        )];
        let sql = graph(&query, false);
        assert!(sql.starts_with("SELECT service_name,  ts, histogramQuantile(arrayMap(x -> toFloat64(x), groupArray(le)), groupArray(value), 0.950) as value FROM (SELECT service_name,le,  ts, sum(value) as value FROM"));
        assert!(sql.contains("JSONExtractString(labels, 'le') as le,"));
        assert!(sql.ends_with("GROUP BY service_name,ts ORDER BY service_name ASC, ts"));
    }

    #[test]
    fn noop_keeps_full_labels() {
        let sql = graph(&metric_query(AggregateOperator::Noop), false);
        assert!(sql.starts_with("SELECT fingerprint, labels as fullLabels, toStartOfInterval"));
        assert!(sql.ends_with("GROUP BY fingerprint, labels, ts ORDER BY fingerprint, labels, ts"));
    }

    #[test]
    fn having_and_value_reduce_wrap_statement() {
        let mut query = metric_query(AggregateOperator::Max);
        query.having = vec![serde_json::from_value(serde_json::json!({
            "columnName": "value", "operator": ">", "value": 5
        }))
        .unwrap()];
        let sql = compile(START, END, PanelType::Value, &query, false)
            .unwrap()
            .to_string();
        assert!(sql.starts_with("SELECT anyLastIf(value, toUnixTimestamp(ts) != 0) as value, anyIf(ts, toUnixTimestamp(ts) != 0) AS timestamp  FROM (SELECT * FROM (SELECT  toStartOfInterval"));
        assert!(sql.ends_with("ORDER BY  ts) HAVING value > 5) "));
    }
}
