//! Two-stage metrics queries over the tiered tables: aggregate each series
//! in time, optionally turn counters into rates, then aggregate across
//! series.

use super::filter::tiered_series_filter;
use super::{group_by_ts, grouping_sets, MetricContext};
use crate::error::{Result, ServiceError};
use crate::models::{MetricType, SpaceAggregation, Temporality, TimeAggregation};
use crate::query::assemble::order_direction;
use crate::query::format::{fixed, quote_identifier};
use crate::query::tier::select_tier;

/// Counter gaps at least this long are treated as missing data.
const MAX_RATE_GAP_SECS: i64 = 86400;

fn window_delta(column: &str, zero: &str) -> String {
    format!("({column} - lagInFrame({column}, 1, {zero}) OVER rate_window)")
}

/// Per-series rate or increase over the `rate_window` lag. Counter resets and
/// long gaps become NaN.
fn counter_expression(aggregation: TimeAggregation, prefer_rpm: bool) -> String {
    let value_delta = window_delta("per_series_value", "0");
    let ts_delta = window_delta("ts", "toDate('1970-01-01')");
    let result = if aggregation == TimeAggregation::Increase {
        value_delta.clone()
    } else if prefer_rpm {
        format!("({value_delta} * 60) / {ts_delta}")
    } else {
        format!("{value_delta} / {ts_delta}")
    };
    format!(
        "If({value_delta} < 0, nan, If({ts_delta} >= {MAX_RATE_GAP_SECS}, nan, {result}))"
    )
}

fn space_function(aggregation: SpaceAggregation) -> String {
    match aggregation {
        SpaceAggregation::Sum => "sum".to_string(),
        SpaceAggregation::Avg => "avg".to_string(),
        SpaceAggregation::Min => "min".to_string(),
        SpaceAggregation::Max => "max".to_string(),
        SpaceAggregation::Count => "count".to_string(),
        other => format!("quantile({})", other.quantile().unwrap_or("0.500")),
    }
}

/// `a ASC, b DESC, ts ASC`
fn space_order(context: &MetricContext<'_>, tags: &[String]) -> String {
    let mut items: Vec<String> = tags
        .iter()
        .map(|tag| {
            let direction = context
                .query
                .order_by
                .iter()
                .find(|item| quote_identifier(&item.column_name) == *tag)
                .and_then(|item| order_direction(item).ok())
                .unwrap_or("ASC");
            format!("{tag} {direction}")
        })
        .collect();
    items.push("ts ASC".to_string());
    items.join(", ")
}

pub(super) fn build(context: &MetricContext<'_>) -> Result<String> {
    let query = context.query;
    let time_aggregation = query
        .time_aggregation
        .ok_or_else(|| ServiceError::invalid("time aggregation is required"))?;
    if query.metric_type == MetricType::ExponentialHistogram {
        return Err(ServiceError::unsupported(
            "exponential histogram metrics are not supported",
        ));
    }

    let tier = select_tier(
        context.start,
        context.end,
        query.temporality,
        time_aggregation == TimeAggregation::CountDistinct,
        false,
    );
    let filter = tiered_series_filter(context, &tier)?;

    let mut value_column = tier.value_column(time_aggregation)?.to_string();
    let windowed = time_aggregation.is_rate_like() && query.temporality != Temporality::Delta;
    if time_aggregation == TimeAggregation::Rate && query.temporality == Temporality::Delta {
        let seconds = context.step as f64;
        let per = if context.prefer_rpm {
            fixed(seconds / 60.0)
        } else {
            context.step.to_string()
        };
        value_column = format!("{value_column}/{per}");
    }

    let tags = &context.tags;
    let any_labels: Vec<String> = tags.iter().map(|tag| format!("any({tag}) as {tag},")).collect();
    let mut per_series = format!(
        "SELECT fingerprint, {} toStartOfInterval(toDateTime(intDiv(unix_milli, 1000)), INTERVAL {} SECOND) as ts, {value_column} as per_series_value FROM {} INNER JOIN ({filter}) as filtered_time_series USING fingerprint WHERE metric_name = {} AND unix_milli >= {} AND unix_milli < {} GROUP BY fingerprint, ts ORDER BY fingerprint, ts",
        any_labels.join(" "),
        context.step,
        tier.samples.table_name(),
        context.metric_name(),
        tier.samples_start,
        tier.end,
    );
    if windowed {
        per_series = format!(
            "SELECT {}ts, {} as per_series_value FROM ({per_series}) WINDOW rate_window as (PARTITION BY fingerprint ORDER BY fingerprint, ts)",
            select_prefix(tags),
            counter_expression(time_aggregation, context.prefer_rpm)
        );
    }

    let space = query.space_aggregation.unwrap_or(SpaceAggregation::Sum);
    if query.metric_type == MetricType::Histogram && space.quantile().is_some() {
        let quantile = space.quantile().unwrap_or("0.500");
        let buckets = format!(
            "SELECT {}ts, sum(per_series_value) as value FROM ({per_series}) WHERE isNaN(per_series_value) = 0 GROUP BY {} ORDER BY {}",
            select_prefix(tags),
            group_by_ts(tags),
            space_order(context, tags)
        );
        let outer = &context.tags_without_le;
        return Ok(format!(
            "SELECT {}ts, histogramQuantile(arrayMap(x -> toFloat64(x), groupArray(le)), groupArray(value), {quantile}) as value FROM ({buckets}) GROUP BY {} ORDER BY {}",
            select_prefix(outer),
            group_by_ts(outer),
            space_order(context, outer)
        ));
    }

    let group_clause = if tags.is_empty() {
        "ts".to_string()
    } else {
        grouping_sets(tags)
    };
    Ok(format!(
        "SELECT {}ts, {}(per_series_value) as value FROM ({per_series}) WHERE isNaN(per_series_value) = 0 GROUP BY {group_clause} ORDER BY {}",
        select_prefix(tags),
        space_function(space),
        space_order(context, tags)
    ))
}

/// `a, b, ` or empty.
fn select_prefix(tags: &[String]) -> String {
    tags.iter().map(|tag| format!("{tag}, ")).collect()
}
