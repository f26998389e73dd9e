//! Metrics compilation over the fingerprinted samples schema.
//!
//! Queries with an explicit time aggregation take the tiered two-stage path
//! in [`series`]. Everything else uses the operator pipelines: [`cumulative`]
//! and [`delta`] for graphs, [`table`] for whole-range table panels.

mod cumulative;
mod delta;
mod filter;
mod series;
mod table;

use super::assemble::order_direction;
use super::format::{format_value, quote_identifier, quote_string};
use super::{epoch_millis, CompiledQuery};
use crate::error::{Result, ServiceError};
use crate::models::{
    AggregateOperator, AttributeKey, AttributeKeyType, BuilderQuery, DataType, Having, MetricType,
    OrderBy, PanelType, ReduceTo, Temporality,
};

pub const SAMPLES_TABLE: &str = "signoz_metrics.distributed_samples_v2";
pub const TIME_SERIES_TABLE: &str = "signoz_metrics.time_series_v2";

/// Counter rate between consecutive buckets; resets yield the raw value.
const RATE_WITHOUT_NEGATIVE: &str = "if(runningDifference(ts) <= 0, nan, if(runningDifference(value) < 0, (value) / runningDifference(ts), runningDifference(value) / runningDifference(ts))) ";
const RATE_WITHOUT_NEGATIVE_MINUTE: &str = "if(runningDifference(ts) <= 0, nan, if(runningDifference(value) < 0, (value*60) / runningDifference(ts), runningDifference(value*60) / runningDifference(ts))) ";

pub(super) fn compile(
    start: i64,
    end: i64,
    panel: PanelType,
    query: &BuilderQuery,
    prefer_rpm: bool,
) -> Result<CompiledQuery> {
    if query.aggregate_attribute.key.is_empty() {
        return Err(ServiceError::invalid("metric name is required"));
    }
    if panel == PanelType::List {
        return Err(ServiceError::unsupported("list panels are not supported for metrics"));
    }
    if panel != PanelType::Table && query.step_interval <= 0 {
        return Err(ServiceError::invalid(format!(
            "step interval must be positive, got {}",
            query.step_interval
        )));
    }

    let start = epoch_millis(start);
    let end = epoch_millis(end);
    let context = MetricContext::new(start, end, query, prefer_rpm)?;

    let sql = if query.time_aggregation.is_some() {
        series::build(&context)?
    } else {
        match (query.temporality, panel) {
            (Temporality::Delta, PanelType::Table) => delta::build_table(&context)?,
            (Temporality::Delta, _) => delta::build(&context)?,
            (_, PanelType::Table) => table::build(&context)?,
            _ => cumulative::build(&context)?,
        }
    };

    let sql = if query.having.is_empty() {
        sql
    } else {
        format!("SELECT * FROM ({sql}) HAVING {}", having(&query.having))
    };
    let sql = if panel == PanelType::Value {
        reduce(&sql, query.reduce_to, query.aggregate_operator)
    } else {
        sql
    };
    Ok(CompiledQuery::new(sql))
}

/// Per-query inputs shared by the metrics builders.
pub(crate) struct MetricContext<'a> {
    pub query: &'a BuilderQuery,
    pub start: i64,
    pub end: i64,
    pub step: i64,
    pub prefer_rpm: bool,
    /// Group keys, with `le` appended for histogram quantiles.
    pub group_by: Vec<AttributeKey>,
    pub tags: Vec<String>,
    pub tags_without_le: Vec<String>,
}

impl<'a> MetricContext<'a> {
    fn new(start: i64, end: i64, query: &'a BuilderQuery, prefer_rpm: bool) -> Result<Self> {
        let mut group_by = query.group_by.clone();
        let histogram_percentile = query.metric_type == MetricType::Histogram
            && query
                .space_aggregation
                .is_some_and(|space| space.quantile().is_some());
        if (query.aggregate_operator.histogram_quantile().is_some() || histogram_percentile)
            && !group_by.iter().any(|key| key.key == "le")
        {
            group_by.push(AttributeKey::new("le", DataType::String, AttributeKeyType::Tag));
        }
        let tags: Vec<String> = group_by.iter().map(|key| quote_identifier(&key.key)).collect();
        let tags_without_le = query
            .group_by
            .iter()
            .filter(|key| key.key != "le")
            .map(|key| quote_identifier(&key.key))
            .collect();

        // Builders render directions through `order_tags` without re-checking.
        for order in &query.order_by {
            order_direction(order)?;
        }

        Ok(Self {
            query,
            start,
            end,
            step: query.step_interval,
            prefer_rpm,
            group_by,
            tags,
            tags_without_le,
        })
    }

    pub fn metric_name(&self) -> String {
        quote_string(&self.query.aggregate_attribute.key)
    }

    pub fn samples_time_filter(&self) -> String {
        format!(
            "metric_name = {} AND timestamp_ms >= {} AND timestamp_ms <= {}",
            self.metric_name(),
            self.start,
            self.end
        )
    }

    pub fn rate_expression(&self) -> &'static str {
        if self.prefer_rpm {
            RATE_WITHOUT_NEGATIVE_MINUTE
        } else {
            RATE_WITHOUT_NEGATIVE
        }
    }

    pub fn order_by(&self, tags: &[String]) -> String {
        order_tags(&self.query.order_by, tags)
    }
}

/// `toStartOfInterval` bucket over the millisecond sample timestamp.
pub(crate) fn interval_bucket(step: i64) -> String {
    format!("toStartOfInterval(toDateTime(intDiv(timestamp_ms, 1000)), INTERVAL {step} SECOND)")
}

/// Samples joined to the filtered series, bucketed and aggregated.
pub(crate) fn samples_query(
    context: &MetricContext<'_>,
    select: &str,
    bucket: &str,
    value: &str,
    filter: &str,
    group_by: &str,
    order_by: &str,
) -> String {
    format!(
        "SELECT {select} {bucket} as ts, {value} as value FROM {SAMPLES_TABLE} INNER JOIN ({filter}) as filtered_time_series USING fingerprint WHERE {} GROUP BY {group_by} ORDER BY {order_by} ts",
        context.samples_time_filter()
    )
}

/// `a,b,ts`
pub(crate) fn group_by_ts(tags: &[String]) -> String {
    tags.iter()
        .map(String::as_str)
        .chain(std::iter::once("ts"))
        .collect::<Vec<_>>()
        .join(",")
}

/// `a,b, ` or empty.
pub(crate) fn group_select(tags: &[String]) -> String {
    if tags.is_empty() {
        String::new()
    } else {
        format!("{}, ", tags.join(","))
    }
}

pub(crate) fn grouping_sets(tags: &[String]) -> String {
    let with_ts: Vec<&str> = tags
        .iter()
        .map(String::as_str)
        .chain(std::iter::once("ts"))
        .collect();
    format!(
        "GROUPING SETS ( ({}), ({}) )",
        with_ts.join(", "),
        tags.join(", ")
    )
}

/// Per-tag ordering (ASC unless the request orders that column), with a
/// trailing comma when non-empty.
pub(crate) fn order_tags(order_by: &[OrderBy], tags: &[String]) -> String {
    let items: Vec<String> = tags
        .iter()
        .map(|tag| {
            let requested = order_by
                .iter()
                .find(|item| quote_identifier(&item.column_name) == *tag)
                .and_then(|item| order_direction(item).ok());
            format!("{tag} {}", requested.unwrap_or("ASC"))
        })
        .collect();
    if items.is_empty() {
        String::new()
    } else {
        format!("{},", items.join(","))
    }
}

fn having(items: &[Having]) -> String {
    items
        .iter()
        .map(|item| format!("value {} {}", item.operator.as_sql(), format_value(&item.value)))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Collapses to one value per series. Noop and rate keep their fingerprints
/// so a multi-series result can be detected after execution.
fn reduce(sql: &str, reduce_to: ReduceTo, operator: AggregateOperator) -> String {
    let (labels, group_by) = match operator {
        AggregateOperator::Noop | AggregateOperator::Rate => {
            (", any(fullLabels) as fullLabels", "GROUP BY fingerprint")
        }
        _ => ("", ""),
    };
    let func = match reduce_to {
        ReduceTo::Last => "anyLastIf",
        ReduceTo::Sum => "sumIf",
        ReduceTo::Avg => "avgIf",
        ReduceTo::Max => "maxIf",
        ReduceTo::Min => "minIf",
    };
    format!(
        "SELECT {func}(value, toUnixTimestamp(ts) != 0) as value, anyIf(ts, toUnixTimestamp(ts) != 0) AS timestamp {labels} FROM ({sql}) {group_by}"
    )
}
