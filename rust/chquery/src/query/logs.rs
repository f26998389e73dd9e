use super::aggregate::{rate_denominator, value_expression};
use super::assemble::{
    group_keys, having_clause, list_limit, order_by_clause, reduce, select_labels, top_n_groups,
};
use super::filter::{checked_value, compile_filters, FilterScope};
use super::format::{escape, format_value};
use super::resolve::{AttributeResolver, LogsResolver};
use super::{epoch_nanos, CompiledQuery, GraphLimitPass, QueryOptions};
use crate::error::{Result, ServiceError};
use crate::models::{
    AggregateOperator, AttributeKeyType, BuilderQuery, FilterItem, FilterOperator, FilterValue,
    PanelType,
};

pub const LOGS_TABLE: &str = "signoz_logs.distributed_logs_v2";
pub const LOGS_RESOURCE_TABLE: &str = "signoz_logs.distributed_logs_v2_resource";

/// Resource buckets are written up to this long before the log rows they
/// describe.
const BUCKET_LOOKBACK_SECS: i64 = 1800;

const LIST_COLUMNS: &str = "timestamp, id, trace_id, span_id, trace_flags, severity_text, \
severity_number, body,attributes_string,attributes_number,attributes_bool,resources_string";

pub(super) fn compile(
    start: i64,
    end: i64,
    panel: PanelType,
    query: &BuilderQuery,
    options: &QueryOptions,
) -> Result<CompiledQuery> {
    if options.is_live_tail {
        return live_tail(query).map(CompiledQuery::new);
    }

    let start = epoch_nanos(start);
    let end = epoch_nanos(end);
    let bucket_start = start / 1_000_000_000 - BUCKET_LOOKBACK_SECS;
    let bucket_end = end / 1_000_000_000;
    let time_filter = format!(
        "(timestamp >= {start} AND timestamp <= {end}) AND (ts_bucket_start >= {bucket_start} AND ts_bucket_start <= {bucket_end})"
    );

    let conditions = main_conditions(query, Some((bucket_start, bucket_end)))?;
    let filter = if conditions.is_empty() {
        String::new()
    } else {
        format!(" AND {}", conditions.join(" AND "))
    };

    let resolver = LogsResolver;
    if query.aggregate_operator == AggregateOperator::Noop {
        if panel != PanelType::List {
            return Err(ServiceError::unsupported(format!(
                "noop is not supported for {panel:?} panels"
            )));
        }
        let order = order_by_clause(&resolver, panel, &query.order_by, &query.group_by)?;
        let sql = format!(
            "SELECT {LIST_COLUMNS} from {LOGS_TABLE} where {time_filter}{filter} order by {order}{}",
            list_limit(query)?
        );
        return Ok(CompiledQuery::new(sql));
    }
    if panel == PanelType::List {
        return Err(ServiceError::unsupported(format!(
            "aggregate operator {} is not supported for list panels",
            query.aggregate_operator.as_str()
        )));
    }

    let table_view = panel == PanelType::Table;
    if !table_view && query.step_interval <= 0 {
        return Err(ServiceError::invalid(format!(
            "step interval must be positive, got {}",
            query.step_interval
        )));
    }

    let rate_seconds = if table_view {
        ((end - start) / 1_000_000_000).max(1)
    } else {
        query.step_interval
    };
    let attribute = if query.aggregate_attribute.is_empty() {
        String::new()
    } else {
        resolver.column(&query.aggregate_attribute)
    };
    let value = value_expression(
        query.aggregate_operator,
        &attribute,
        rate_denominator(rate_seconds, options.prefer_rpm),
    )?;

    let labels = select_labels(&resolver, &query.group_by);
    let keys = group_keys(&query.group_by);
    let having = having_clause(&query.having);
    let order = order_by_clause(&resolver, panel, &query.order_by, &query.group_by)?;

    if options.graph_limit != GraphLimitPass::None
        && (query.group_by.is_empty() || query.limit == 0)
    {
        return Err(ServiceError::invalid(
            "top-n passes need both a group by and a limit",
        ));
    }

    if options.graph_limit == GraphLimitPass::First {
        let ranked = format!(
            "SELECT{labels} {value} as value from {LOGS_TABLE} where {time_filter}{filter} group by {keys}{having} order by {order}"
        );
        return Ok(CompiledQuery::new(top_n_groups(
            &ranked,
            &query.group_by,
            query.limit,
        )));
    }

    let (select_ts, group_clause) = if table_view {
        let group = if keys.is_empty() {
            String::new()
        } else {
            format!(" group by {keys}")
        };
        ("SELECT now() as ts,".to_string(), group)
    } else {
        let group = if keys.is_empty() {
            " group by ts".to_string()
        } else {
            format!(" group by {keys},ts")
        };
        (
            format!(
                "SELECT toStartOfInterval(fromUnixTimestamp64Nano(timestamp), INTERVAL {} SECOND) AS ts,",
                query.step_interval
            ),
            group,
        )
    };

    let head = format!("{select_ts}{labels} {value} as value from {LOGS_TABLE} where {time_filter}{filter}");
    let tail = format!("{group_clause}{having} order by {order}");
    let mut compiled = if options.graph_limit == GraphLimitPass::Second {
        CompiledQuery::with_top_n(format!("{head} AND ({keys}) GLOBAL IN ("), format!("){tail}"))
    } else {
        CompiledQuery::new(format!("{head}{tail}"))
    };

    if table_view && query.limit > 0 {
        compiled = compiled.wrap(String::new(), format!(" LIMIT {}", query.limit));
    }
    if panel == PanelType::Value {
        compiled = reduce(compiled, query.reduce_to);
    }
    Ok(compiled)
}

/// Streaming tail: the caller appends its own cursor predicate, so the
/// statement ends with an open `AND`/`where`.
fn live_tail(query: &BuilderQuery) -> Result<String> {
    let conditions = main_conditions(query, None)?;
    let mut sql = format!("SELECT {LIST_COLUMNS} from {LOGS_TABLE} where ");
    if !conditions.is_empty() {
        sql.push_str(&conditions.join(" AND "));
        sql.push_str(" AND ");
    }
    Ok(sql)
}

fn main_conditions(query: &BuilderQuery, buckets: Option<(i64, i64)>) -> Result<Vec<String>> {
    let scope = FilterScope {
        group_by: &query.group_by,
        aggregate_attribute: &query.aggregate_attribute,
        aggregate_operator: query.aggregate_operator,
        skip_resources: true,
    };
    let mut conditions = compile_filters(&LogsResolver, query.filters.as_ref(), scope)?;
    if let Some(subquery) = resource_subquery(query, buckets)? {
        conditions.push(subquery);
    }
    Ok(conditions)
}

fn resource_condition(item: &FilterItem) -> Result<Vec<String>> {
    let key = escape(&item.key.key.to_lowercase());
    let label = format!("simpleJSONExtractString(lower(labels), '{key}')");

    let value = if item.op.is_existence() {
        FilterValue::Null
    } else {
        lowered(checked_value(item)?)
    };
    let text = escape(&value.as_text());
    let hint_like = format!("lower(labels) like '%{key}%{text}%'");
    let hint_not_like = format!("lower(labels) not like '%{key}%{text}%'");

    let conditions = match item.op {
        FilterOperator::Eq => vec![format!("{label} = {}", format_value(&value)), hint_like],
        FilterOperator::NotEq => vec![
            format!("{label} != {}", format_value(&value)),
            hint_not_like,
        ],
        FilterOperator::Lt | FilterOperator::Lte | FilterOperator::Gt | FilterOperator::Gte => {
            vec![format!("{label} {} {}", item.op, format_value(&value))]
        }
        FilterOperator::Like => vec![format!("{label} LIKE '{text}'"), hint_like],
        FilterOperator::NotLike => vec![format!("{label} NOT LIKE '{text}'"), hint_not_like],
        FilterOperator::Contains => vec![format!("{label} LIKE '%{text}%'"), hint_like],
        FilterOperator::NotContains => {
            vec![format!("{label} NOT LIKE '%{text}%'"), hint_not_like]
        }
        FilterOperator::Regex | FilterOperator::NotRegex => {
            let raw = escape(&item.value.as_text());
            let matcher = format!("match(simpleJSONExtractString(labels, '{key}'), '{raw}')");
            if item.op == FilterOperator::Regex {
                vec![matcher]
            } else {
                vec![format!("NOT {matcher}")]
            }
        }
        FilterOperator::In | FilterOperator::NotIn => {
            let FilterValue::Array(values) = &value else {
                return Err(ServiceError::invalid(format!(
                    "operator {} on '{}' requires an array value",
                    item.op, item.key.key
                )));
            };
            let keyword = if item.op == FilterOperator::In { "IN" } else { "NOT IN" };
            let mut conditions = vec![format!("{label} {keyword} {}", format_value(&value))];
            if item.op == FilterOperator::In && !values.is_empty() {
                let hints: Vec<String> = values
                    .iter()
                    .map(|entry| {
                        format!("lower(labels) like '%{key}%{}%'", escape(&entry.as_text()))
                    })
                    .collect();
                conditions.push(format!("({})", hints.join(" OR ")));
            }
            conditions
        }
        FilterOperator::Exists => vec![
            format!("simpleJSONHas(lower(labels), '{key}')"),
            format!("lower(labels) like '%{key}%'"),
        ],
        FilterOperator::NotExists => vec![format!("not simpleJSONHas(lower(labels), '{key}')")],
        FilterOperator::Has | FilterOperator::NotHas => {
            return Err(ServiceError::unsupported(format!(
                "operator {} is not supported on resource attribute '{}'",
                item.op, item.key.key
            )))
        }
    };
    Ok(conditions)
}

fn lowered(value: FilterValue) -> FilterValue {
    match value {
        FilterValue::String(text) => FilterValue::String(text.to_lowercase()),
        FilterValue::Array(values) => FilterValue::Array(values.into_iter().map(lowered).collect()),
        other => other,
    }
}

/// Restricts rows to resource fingerprints matching the resource filters and
/// carrying every resource group-by key.
fn resource_subquery(query: &BuilderQuery, buckets: Option<(i64, i64)>) -> Result<Option<String>> {
    let items: Vec<&FilterItem> = query
        .filter_items()
        .iter()
        .filter(|item| item.key.key_type == AttributeKeyType::Resource)
        .collect();
    let group_keys: Vec<String> = query
        .group_by
        .iter()
        .filter(|key| key.key_type == AttributeKeyType::Resource)
        .map(|key| {
            let name = escape(&key.key.to_lowercase());
            format!("(simpleJSONHas(lower(labels), '{name}') AND lower(labels) like '%{name}%')")
        })
        .collect();

    if items.is_empty() && group_keys.is_empty() {
        return Ok(None);
    }

    let mut conditions = Vec::new();
    if let Some((start, end)) = buckets {
        conditions.push(format!("(seen_at_ts_bucket_start >= {start})"));
        conditions.push(format!("(seen_at_ts_bucket_start <= {end})"));
    }
    for item in items {
        conditions.extend(resource_condition(item)?);
    }
    if !group_keys.is_empty() {
        conditions.push(format!("( {} )", group_keys.join(" AND ")));
    }

    Ok(Some(format!(
        "(resource_fingerprint GLOBAL IN (SELECT fingerprint FROM {LOGS_RESOURCE_TABLE} WHERE {}))",
        conditions.join(" AND ")
    )))
}
