use super::aggregate::{rate_denominator, value_expression};
use super::assemble::{
    group_keys, having_clause, list_limit, order_by_clause, reduce, select_labels, top_n_groups,
};
use super::filter::{compile_filters, FilterScope};
use super::resolve::{AttributeResolver, TracesResolver};
use super::{epoch_nanos, CompiledQuery, GraphLimitPass, QueryOptions};
use crate::error::{Result, ServiceError};
use crate::models::{AggregateOperator, BuilderQuery, PanelType};

pub const TRACES_TABLE: &str = "signoz_traces.distributed_signoz_index_v2";

const LIST_COLUMNS: &str =
    "timestamp, traceID, spanID, serviceName, name, kind, durationNano, statusCode, httpMethod, responseStatusCode";

pub(super) fn compile(
    start: i64,
    end: i64,
    panel: PanelType,
    query: &BuilderQuery,
    options: &QueryOptions,
) -> Result<CompiledQuery> {
    if options.is_live_tail {
        return Err(ServiceError::unsupported("live tail is only available for logs"));
    }

    let start = epoch_nanos(start);
    let end = epoch_nanos(end);
    let time_filter = format!("(timestamp >= '{start}' AND timestamp <= '{end}')");

    let resolver = TracesResolver;
    let scope = FilterScope {
        group_by: &query.group_by,
        aggregate_attribute: &query.aggregate_attribute,
        aggregate_operator: query.aggregate_operator,
        skip_resources: false,
    };
    let conditions = compile_filters(&resolver, query.filters.as_ref(), scope)?;
    let filter = if conditions.is_empty() {
        String::new()
    } else {
        format!(" AND {}", conditions.join(" AND "))
    };

    if query.aggregate_operator == AggregateOperator::Noop {
        if panel != PanelType::List {
            return Err(ServiceError::unsupported(format!(
                "noop is not supported for {panel:?} panels"
            )));
        }
        let order = order_by_clause(&resolver, panel, &query.order_by, &query.group_by)?;
        let sql = format!(
            "SELECT {LIST_COLUMNS} from {TRACES_TABLE} where {time_filter}{filter} order by {order}{}",
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
    if options.graph_limit != GraphLimitPass::None
        && (query.group_by.is_empty() || query.limit == 0)
    {
        return Err(ServiceError::invalid(
            "top-n passes need both a group by and a limit",
        ));
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

    if options.graph_limit == GraphLimitPass::First {
        let ranked = format!(
            "SELECT{labels} {value} as value from {TRACES_TABLE} where {time_filter}{filter} group by {keys}{having} order by {order}"
        );
        return Ok(CompiledQuery::new(top_n_groups(
            &ranked,
            &query.group_by,
            query.limit,
        )));
    }

    let (select_ts, group_clause) = match (table_view, keys.is_empty()) {
        (true, true) => ("SELECT now() as ts,".to_string(), String::new()),
        (true, false) => ("SELECT now() as ts,".to_string(), format!(" group by {keys}")),
        (false, empty) => (
            format!(
                "SELECT toStartOfInterval(timestamp, INTERVAL {} SECOND) AS ts,",
                query.step_interval
            ),
            if empty {
                " group by ts".to_string()
            } else {
                format!(" group by {keys},ts")
            },
        ),
    };

    let head =
        format!("{select_ts}{labels} {value} as value from {TRACES_TABLE} where {time_filter}{filter}");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        AttributeKey, AttributeKeyType, DataSource, DataType, FilterItem, FilterOperator,
        FilterSet,
    };
    use pretty_assertions::assert_eq;

    const START: i64 = 1680066360726;
    const END: i64 = 1680066458000;
    const TIME: &str =
        "(timestamp >= '1680066360726000000' AND timestamp <= '1680066458000000000')";

    #[test]
    fn grouped_p99_latency() {
        let mut query = BuilderQuery::new(DataSource::Traces, AggregateOperator::P99);
        query.aggregate_attribute =
            AttributeKey::new("durationNano", DataType::Float64, AttributeKeyType::Tag).column();
        query.group_by = vec![AttributeKey::new(
            "serviceName",
            DataType::String,
            AttributeKeyType::Tag,
        )
        .column()];
        let sql = compile(START, END, PanelType::Graph, &query, &QueryOptions::default())
            .unwrap()
            .to_string();
        assert_eq!(
            sql,
            format!("SELECT toStartOfInterval(timestamp, INTERVAL 60 SECOND) AS ts, serviceName as `serviceName`, quantile(0.99)(durationNano) as value from signoz_traces.distributed_signoz_index_v2 where {TIME} group by `serviceName`,ts order by value DESC")
        );
    }

    #[test]
    fn tag_filters_use_ilike_and_group_guards() {
        let mut query = BuilderQuery::new(DataSource::Traces, AggregateOperator::Count);
        let route = AttributeKey::new("http.route", DataType::String, AttributeKeyType::Tag);
        query.filters = Some(FilterSet::and(vec![FilterItem::new(
            route.clone(),
            FilterOperator::Like,
            "/api/%",
        )]));
        query.group_by = vec![route];
        let sql = compile(START, END, PanelType::Table, &query, &QueryOptions::default())
            .unwrap()
            .to_string();
        assert_eq!(
            sql,
            format!("SELECT now() as ts, stringTagMap['http.route'] as `http.route`, toFloat64(count(*)) as value from signoz_traces.distributed_signoz_index_v2 where {TIME} AND stringTagMap['http.route'] ILIKE '/api/%' AND mapContains(stringTagMap, 'http.route') group by `http.route` order by value DESC")
        );
    }

    #[test]
    fn list_selects_span_identity() {
        let query = BuilderQuery::new(DataSource::Traces, AggregateOperator::Noop);
        let sql = compile(START, END, PanelType::List, &query, &QueryOptions::default())
            .unwrap()
            .to_string();
        assert_eq!(
            sql,
            format!("SELECT {LIST_COLUMNS} from signoz_traces.distributed_signoz_index_v2 where {TIME} order by timestamp DESC LIMIT 100")
        );
    }

    #[test]
    fn live_tail_is_rejected() {
        let query = BuilderQuery::new(DataSource::Traces, AggregateOperator::Noop);
        let options = QueryOptions {
            is_live_tail: true,
            ..QueryOptions::default()
        };
        assert!(matches!(
            compile(START, END, PanelType::List, &query, &options),
            Err(ServiceError::Unsupported(_))
        ));
    }
}
