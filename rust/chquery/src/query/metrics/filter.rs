//! Time-series lookup subqueries: which fingerprints match the label filters.

use super::{MetricContext, TIME_SERIES_TABLE};
use crate::error::{Result, ServiceError};
use crate::models::{AggregateOperator, AttributeKey, FilterItem, FilterOperator, FilterValue, Temporality};
use crate::query::filter::{checked_value, require_array};
use crate::query::format::{escape, format_value, quote_identifier, quote_string};
use crate::query::tier::TierSelection;

fn label(key: &str) -> String {
    format!("JSONExtractString(labels, {})", quote_string(key))
}

/// Label predicate for one filter item. Pattern operators given an array use
/// its first element, and an empty array contributes nothing. Values are
/// checked against the key's declared type first.
pub fn label_condition(item: &FilterItem) -> Result<Option<String>> {
    let mut value = if item.op.is_existence() {
        item.value.clone()
    } else {
        checked_value(item)?
    };
    if matches!(item.op, FilterOperator::In | FilterOperator::NotIn) {
        require_array(item, &value)?;
    }
    if matches!(
        item.op,
        FilterOperator::Like
            | FilterOperator::NotLike
            | FilterOperator::Regex
            | FilterOperator::NotRegex
    ) {
        if let FilterValue::Array(values) = value {
            match values.into_iter().next() {
                Some(first) => value = first,
                None => return Ok(None),
            }
        }
    }
    if matches!(item.op, FilterOperator::Contains | FilterOperator::NotContains) {
        value = FilterValue::String(format!("%{}%", value.as_text()));
    }

    let column = label(&item.key.key);
    let literal = format_value(&value);
    let condition = match item.op {
        FilterOperator::Eq
        | FilterOperator::NotEq
        | FilterOperator::Gt
        | FilterOperator::Gte
        | FilterOperator::Lt
        | FilterOperator::Lte => format!("{column} {} {literal}", item.op),
        FilterOperator::In => format!("{column} IN {literal}"),
        FilterOperator::NotIn => format!("{column} NOT IN {literal}"),
        FilterOperator::Like | FilterOperator::Contains => format!("like({column}, {literal})"),
        FilterOperator::NotLike | FilterOperator::NotContains => {
            format!("notLike({column}, {literal})")
        }
        FilterOperator::Regex => format!("match({column}, {literal})"),
        FilterOperator::NotRegex => format!("not match({column}, {literal})"),
        FilterOperator::Exists => {
            format!("has(JSONExtractKeys(labels), '{}')", escape(&item.key.key))
        }
        FilterOperator::NotExists => {
            format!("not has(JSONExtractKeys(labels), '{}')", escape(&item.key.key))
        }
        FilterOperator::Has | FilterOperator::NotHas => {
            return Err(ServiceError::unsupported(format!(
                "operator {} is not supported on metric labels",
                item.op
            )))
        }
    };
    Ok(Some(condition))
}

fn label_conditions(items: &[FilterItem], conditions: &mut Vec<String>) -> Result<()> {
    for item in items {
        conditions.extend(label_condition(item)?);
    }
    Ok(())
}

fn label_select(group_by: &[AttributeKey]) -> String {
    group_by
        .iter()
        .map(|key| format!(" {} as {},", label(&key.key), quote_identifier(&key.key)))
        .collect()
}

/// Lookup over the legacy series table. Noop and rate keep the full label
/// set; other operators select only the group keys.
pub fn series_filter(context: &MetricContext<'_>, group_by: &[AttributeKey]) -> Result<String> {
    let query = context.query;
    let mut conditions = vec![if query.temporality == Temporality::Delta {
        format!("metric_name = {} AND temporality = 'Delta' ", context.metric_name())
    } else {
        format!(
            "metric_name = {} AND temporality IN ['Cumulative', 'Unspecified']",
            context.metric_name()
        )
    }];
    label_conditions(query.filter_items(), &mut conditions)?;

    let select = match query.aggregate_operator {
        AggregateOperator::Noop | AggregateOperator::Rate => "labels,".to_string(),
        _ => label_select(group_by),
    };
    Ok(format!(
        "SELECT {select} fingerprint FROM {TIME_SERIES_TABLE} WHERE {}",
        conditions.join(" AND ")
    ))
}

/// Lookup over the tiered series table chosen for the range.
pub(crate) fn tiered_series_filter(
    context: &MetricContext<'_>,
    tier: &TierSelection,
) -> Result<String> {
    let query = context.query;
    let mut conditions = vec![
        format!("metric_name = {}", context.metric_name()),
        format!("temporality = '{}'", query.temporality.as_str()),
        format!(
            "unix_milli >= {} AND unix_milli < {}",
            tier.series_start, tier.end
        ),
    ];
    label_conditions(query.filter_items(), &mut conditions)?;

    let select: String = context
        .group_by
        .iter()
        .map(|key| format!("{} as {}, ", label(&key.key), quote_identifier(&key.key)))
        .collect();
    Ok(format!(
        "SELECT DISTINCT {select}fingerprint FROM {} WHERE {}",
        tier.series.table_name(),
        conditions.join(" AND ")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AttributeKeyType, DataType};

    fn item(op: FilterOperator, value: impl Into<FilterValue>) -> FilterItem {
        FilterItem::new(
            AttributeKey::new("endpoint", DataType::String, AttributeKeyType::Tag),
            op,
            value,
        )
    }

    #[test]
    fn renders_label_predicates() {
        let values = FilterValue::Array(vec!["/paycallback".into(), "/payme".into()]);
        assert_eq!(
            label_condition(&item(FilterOperator::In, values)).unwrap().unwrap(),
            "JSONExtractString(labels, 'endpoint') IN ['/paycallback','/payme']"
        );
        assert_eq!(
            label_condition(&item(FilterOperator::Contains, "pay")).unwrap().unwrap(),
            "like(JSONExtractString(labels, 'endpoint'), '%pay%')"
        );
        assert_eq!(
            label_condition(&item(FilterOperator::NotExists, FilterValue::Null))
                .unwrap()
                .unwrap(),
            "not has(JSONExtractKeys(labels), 'endpoint')"
        );
    }

    #[test]
    fn pattern_arrays_use_first_element() {
        let values = FilterValue::Array(vec!["^/api".into(), "ignored".into()]);
        assert_eq!(
            label_condition(&item(FilterOperator::Regex, values)).unwrap().unwrap(),
            "match(JSONExtractString(labels, 'endpoint'), '^/api')"
        );
        assert_eq!(
            label_condition(&item(FilterOperator::Like, FilterValue::Array(vec![]))).unwrap(),
            None
        );
    }

    #[test]
    fn label_keys_are_escaped() {
        let injected = FilterItem::new(
            AttributeKey::new("a') OR 1=1 --", DataType::String, AttributeKeyType::Tag),
            FilterOperator::Eq,
            "x",
        );
        assert_eq!(
            label_condition(&injected).unwrap().unwrap(),
            "JSONExtractString(labels, 'a\\') OR 1=1 --') = 'x'"
        );
    }

    #[test]
    fn label_values_are_type_checked() {
        let latency = FilterItem::new(
            AttributeKey::new("latency", DataType::Float64, AttributeKeyType::Tag),
            FilterOperator::Gt,
            true,
        );
        let err = label_condition(&latency).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidRequest(_)));
        assert!(err.to_string().contains("latency"), "{err}");

        let err = label_condition(&item(FilterOperator::In, "GET")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid request: operator in on 'endpoint' requires an array value"
        );
    }
}
