//! Filter compilation for the attribute-map schemas (logs and traces).

use super::format::{escape, format_value, validate_and_cast};
use super::json::json_filter;
use super::resolve::AttributeResolver;
use crate::error::{Result, ServiceError};
use crate::models::{
    AggregateOperator, AttributeKey, AttributeKeyType, FilterItem, FilterOperator, FilterSet,
    FilterValue, LogicalOperator,
};

/// Validates `item.value` against its key and names the key on failure.
pub fn checked_value(item: &FilterItem) -> Result<FilterValue> {
    validate_and_cast(&item.value, item.key.data_type).map_err(|err| {
        ServiceError::invalid(format!(
            "failed to validate and cast value for {}: {err}",
            item.key.key
        ))
    })
}

pub fn require_array(item: &FilterItem, value: &FilterValue) -> Result<()> {
    if matches!(value, FilterValue::Array(_)) {
        Ok(())
    } else {
        Err(ServiceError::invalid(format!(
            "operator {} on '{}' requires an array value",
            item.op, item.key.key
        )))
    }
}

fn text_pattern(value: &FilterValue, wrap: bool) -> String {
    let text = escape(&value.as_text());
    if wrap {
        format!("'%{text}%'")
    } else {
        format!("'{text}'")
    }
}

/// Condition for a single item, without any accompanying guard.
pub fn item_condition<R: AttributeResolver>(resolver: &R, item: &FilterItem) -> Result<String> {
    if item.key.is_json {
        return json_filter(item);
    }
    if item.op.is_existence() {
        return Ok(resolver.existence_guard(&item.key, item.op == FilterOperator::Exists));
    }

    let value = checked_value(item)?;
    let column = resolver.column(&item.key);
    let on_body = item.key.key == "body" && resolver.is_top_level(&item.key);
    let (like, not_like) = resolver.like_operators();

    let condition = match item.op {
        FilterOperator::Eq
        | FilterOperator::NotEq
        | FilterOperator::Lt
        | FilterOperator::Lte
        | FilterOperator::Gt
        | FilterOperator::Gte => format!("{column} {} {}", item.op, format_value(&value)),
        FilterOperator::Like
        | FilterOperator::NotLike
        | FilterOperator::Contains
        | FilterOperator::NotContains => {
            let wrap = matches!(
                item.op,
                FilterOperator::Contains | FilterOperator::NotContains
            );
            let negated = matches!(
                item.op,
                FilterOperator::NotLike | FilterOperator::NotContains
            );
            let pattern = text_pattern(&value, wrap);
            if on_body {
                let keyword = if negated { "NOT LIKE" } else { "LIKE" };
                format!("lower(body) {keyword} lower({pattern})")
            } else {
                let keyword = if negated { not_like } else { like };
                format!("{column} {keyword} {pattern}")
            }
        }
        FilterOperator::Regex => format!("match({column}, {})", text_pattern(&value, false)),
        FilterOperator::NotRegex => {
            format!("NOT match({column}, {})", text_pattern(&value, false))
        }
        FilterOperator::In => {
            require_array(item, &value)?;
            format!("{column} IN {}", format_value(&value))
        }
        FilterOperator::NotIn => {
            require_array(item, &value)?;
            format!("{column} NOT IN {}", format_value(&value))
        }
        FilterOperator::Has => format!("has({column}, {})", format_value(&value)),
        FilterOperator::NotHas => format!("NOT has({column}, {})", format_value(&value)),
        FilterOperator::Exists | FilterOperator::NotExists => {
            resolver.existence_guard(&item.key, item.op == FilterOperator::Exists)
        }
    };
    Ok(condition)
}

/// Guard required when `key` is read by a group-by or a value expression.
pub fn reference_guard<R: AttributeResolver>(resolver: &R, key: &AttributeKey) -> Option<String> {
    if key.is_json || resolver.is_top_level(key) {
        None
    } else {
        Some(resolver.existence_guard(key, true))
    }
}

fn join_units(op: LogicalOperator, units: Vec<Vec<String>>) -> Vec<String> {
    match op {
        LogicalOperator::And => units.into_iter().flatten().collect(),
        LogicalOperator::Or => {
            let rendered: Vec<String> = units
                .into_iter()
                .map(|unit| {
                    if unit.len() > 1 {
                        format!("({})", unit.join(" AND "))
                    } else {
                        unit.join("")
                    }
                })
                .collect();
            match rendered.len() {
                0 => Vec::new(),
                1 => rendered,
                _ => vec![format!("({})", rendered.join(" OR "))],
            }
        }
    }
}

/// Inputs of the main-table WHERE fragment besides the filter set itself.
#[derive(Debug, Clone, Copy)]
pub struct FilterScope<'a> {
    pub group_by: &'a [AttributeKey],
    pub aggregate_attribute: &'a AttributeKey,
    pub aggregate_operator: AggregateOperator,
    /// Resource keys are handled elsewhere (the logs resource subquery).
    pub skip_resources: bool,
}

/// Compiles the conditions that apply directly to the main table, in order:
/// filter items, group-by guards, then the aggregate attribute guard.
pub fn compile_filters<R: AttributeResolver>(
    resolver: &R,
    filters: Option<&FilterSet>,
    scope: FilterScope<'_>,
) -> Result<Vec<String>> {
    let is_skipped =
        |key: &AttributeKey| scope.skip_resources && key.key_type == AttributeKeyType::Resource;

    let mut units = Vec::new();
    let op = filters.map(|set| set.op).unwrap_or_default();
    for item in filters.map(|set| set.items.as_slice()).unwrap_or_default() {
        if is_skipped(&item.key) {
            continue;
        }
        let mut unit = vec![item_condition(resolver, item)?];
        if resolver.guards_filter_items()
            && !item.key.is_column
            && !item.key.is_json
            && !item.op.is_existence()
        {
            unit.push(resolver.existence_guard(&item.key, true));
        }
        units.push(unit);
    }
    let mut conditions = join_units(op, units);

    for key in scope.group_by.iter().filter(|key| !is_skipped(key)) {
        conditions.extend(reference_guard(resolver, key));
    }

    let aggregate = scope.aggregate_attribute;
    if !aggregate.is_empty()
        && !is_skipped(aggregate)
        && scope.aggregate_operator.guards_value_attribute()
    {
        conditions.extend(reference_guard(resolver, aggregate));
    }

    Ok(conditions)
}
