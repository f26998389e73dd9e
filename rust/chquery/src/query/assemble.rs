//! Statement pieces shared by the logs and traces assemblers.

use super::format::{format_value, quote_alias};
use super::resolve::AttributeResolver;
use super::CompiledQuery;
use crate::error::{Result, ServiceError};
use crate::models::{AttributeKey, BuilderQuery, Having, OrderBy, PanelType, ReduceTo};

pub const DEFAULT_LIST_LIMIT: u64 = 100;

/// Returns the direction text as given once it is known to be asc/desc.
pub fn order_direction(order: &OrderBy) -> Result<&str> {
    let direction = order.order.trim();
    if direction.eq_ignore_ascii_case("asc") || direction.eq_ignore_ascii_case("desc") {
        Ok(direction)
    } else {
        Err(ServiceError::invalid(format!(
            "invalid order '{}' for column '{}'",
            order.order, order.column_name
        )))
    }
}

/// ` <column> as `<key>`,` for each group key.
pub fn select_labels<R: AttributeResolver>(resolver: &R, group_by: &[AttributeKey]) -> String {
    group_by
        .iter()
        .map(|key| format!(" {} as {},", resolver.column(key), quote_alias(&key.key)))
        .collect()
}

pub fn group_keys(group_by: &[AttributeKey]) -> String {
    group_by
        .iter()
        .map(|key| quote_alias(&key.key))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn order_by_clause<R: AttributeResolver>(
    resolver: &R,
    panel: PanelType,
    order_by: &[OrderBy],
    group_by: &[AttributeKey],
) -> Result<String> {
    let mut items = Vec::with_capacity(order_by.len());
    for order in order_by {
        let direction = order_direction(order)?;
        if order.is_value() {
            items.push(format!("value {direction}"));
        } else if group_by.iter().any(|key| key.key == order.column_name) {
            items.push(format!("{} {direction}", quote_alias(&order.column_name)));
        } else if panel == PanelType::List {
            let column = resolver.column(&order.attribute());
            let column = if order.is_column && !column.starts_with('`') {
                quote_alias(&column)
            } else {
                column
            };
            items.push(format!("{column} {direction}"));
        }
    }

    if items.is_empty() {
        let default = if panel == PanelType::List {
            "timestamp DESC"
        } else {
            "value DESC"
        };
        return Ok(default.to_string());
    }
    Ok(items.join(","))
}

/// ` having value > 10 AND ...`, or empty.
pub fn having_clause(having: &[Having]) -> String {
    if having.is_empty() {
        return String::new();
    }
    let conditions: Vec<String> = having
        .iter()
        .map(|item| format!("value {} {}", item.operator.as_sql(), format_value(&item.value)))
        .collect();
    format!(" having {}", conditions.join(" AND "))
}

fn ordered_by_timestamp(query: &BuilderQuery) -> bool {
    match query.order_by.as_slice() {
        [] => true,
        [only] => only.column_name == "timestamp" || only.key == "timestamp",
        _ => false,
    }
}

/// LIMIT/OFFSET tail of a list statement.
///
/// With a page size, the page is clipped to the overall limit. OFFSET is left
/// out when rows are ordered by timestamp alone; those callers page with an
/// id cursor instead.
pub fn list_limit(query: &BuilderQuery) -> Result<String> {
    if query.page_size == 0 {
        let limit = if query.limit == 0 {
            DEFAULT_LIST_LIMIT
        } else {
            query.limit
        };
        return Ok(format!(" LIMIT {limit}"));
    }

    let effective_limit = if query.limit == 0 {
        DEFAULT_LIST_LIMIT
    } else {
        query.limit
    };
    if query.offset > effective_limit {
        return Err(ServiceError::invalid("max limit exceeded"));
    }

    let page = if query.limit > 0 && query.offset.saturating_add(query.page_size) > query.limit {
        query.limit - query.offset
    } else {
        query.page_size
    };

    if ordered_by_timestamp(query) {
        Ok(format!(" LIMIT {page}"))
    } else {
        Ok(format!(" LIMIT {page} OFFSET {}", query.offset))
    }
}

/// Collapses a series query to a single row.
pub fn reduce(query: CompiledQuery, reduce_to: ReduceTo) -> CompiledQuery {
    let func = match reduce_to {
        ReduceTo::Last => "anyLast",
        ReduceTo::Sum => "sum",
        ReduceTo::Avg => "avg",
        ReduceTo::Max => "max",
        ReduceTo::Min => "min",
    };
    query.wrap(
        format!("SELECT {func}(value) as value, any(ts) as ts FROM ("),
        ")".to_string(),
    )
}

/// Outer statement of the first Top-N pass: the ranked group keys only.
pub fn top_n_groups(inner: &str, group_by: &[AttributeKey], limit: u64) -> String {
    format!("SELECT {} from ({inner}) LIMIT {limit}", group_keys(group_by))
}
