//! Filters on fields nested inside the JSON log body.

use super::format::{escape, format_value, quote_string, validate_and_cast};
use crate::error::{Result, ServiceError};
use crate::models::{DataType, FilterItem, FilterOperator, FilterValue};

fn valid_segment(segment: &str) -> bool {
    let (name, index) = match segment.split_once('[') {
        Some((name, rest)) => match rest.strip_suffix(']') {
            Some(inner) => (name, Some(inner)),
            None => return false,
        },
        None => (segment, None),
    };

    let name_ok = !name.is_empty()
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '@'));
    let index_ok = match index {
        None | Some("*") => true,
        Some(digits) => !digits.is_empty() && digits.chars().all(|ch| ch.is_ascii_digit()),
    };
    name_ok && index_ok
}

/// Rewrites `body.a.b[*]` into the JSON path `$.a.b[*]`.
pub fn json_path(key: &str) -> Result<String> {
    let mut segments = key.split('.');
    if segments.next() != Some("body") {
        return Err(ServiceError::invalid(format!(
            "json filter key '{key}' must be rooted at body"
        )));
    }

    let rest: Vec<&str> = segments.collect();
    if rest.is_empty() {
        return Err(ServiceError::invalid(format!(
            "json filter key '{key}' has no path below body"
        )));
    }
    if let Some(bad) = rest.iter().find(|segment| !valid_segment(segment)) {
        return Err(ServiceError::invalid(format!(
            "json filter key '{key}' has malformed segment '{bad}'"
        )));
    }

    Ok(format!("$.{}", rest.join(".")))
}

fn extract_type(data_type: DataType) -> Option<&'static str> {
    match data_type {
        DataType::Int64 => Some("Int64"),
        DataType::Float64 => Some("Float64"),
        DataType::Bool => Some("Bool"),
        DataType::ArrayString => Some("Array(String)"),
        DataType::ArrayInt64 => Some("Array(Int64)"),
        DataType::ArrayFloat64 => Some("Array(Float64)"),
        DataType::ArrayBool => Some("Array(Bool)"),
        DataType::String | DataType::Unspecified => None,
    }
}

/// Expression extracting the typed value at the key's JSON path.
pub fn json_accessor(key: &str, data_type: DataType) -> Result<String> {
    let path = quote_string(&json_path(key)?);
    Ok(match extract_type(data_type) {
        None => format!("JSON_VALUE(body, {path})"),
        Some(target) => format!("JSONExtract(JSON_QUERY(body, {path}), '{target}')"),
    })
}

fn pattern(value: &FilterValue, wrap: bool) -> String {
    let text = escape(&value.as_text());
    if wrap {
        format!("'%{text}%'")
    } else {
        format!("'{text}'")
    }
}

fn exists_check(key: &str, exists: bool) -> Result<String> {
    let check = format!("JSON_EXISTS(body, {})", quote_string(&json_path(key)?));
    Ok(if exists { check } else { format!("NOT {check}") })
}

/// Compiles one filter item whose key lives in the JSON body.
pub fn json_filter(item: &FilterItem) -> Result<String> {
    let key = &item.key;
    let accessor = json_accessor(&key.key, key.data_type)?;
    let op = item.op;

    if op.is_existence() {
        return exists_check(&key.key, op == FilterOperator::Exists);
    }

    if key.data_type.is_array() {
        if !matches!(op, FilterOperator::Has | FilterOperator::NotHas) {
            return Err(ServiceError::unsupported(format!(
                "operator {op} is not supported on json array key '{}', use has or nhas",
                key.key
            )));
        }
        let value = validate_and_cast(&item.value, key.data_type.element()).map_err(|err| {
            ServiceError::invalid(format!(
                "failed to validate and cast value for {}: {err}",
                key.key
            ))
        })?;
        let has = format!("has({accessor}, {})", format_value(&value));
        return Ok(if op == FilterOperator::Has {
            has
        } else {
            format!("NOT {has}")
        });
    }

    let value = validate_and_cast(&item.value, key.data_type).map_err(|err| {
        ServiceError::invalid(format!(
            "failed to validate and cast value for {}: {err}",
            key.key
        ))
    })?;

    let condition = match op {
        FilterOperator::Eq
        | FilterOperator::NotEq
        | FilterOperator::Lt
        | FilterOperator::Lte
        | FilterOperator::Gt
        | FilterOperator::Gte => format!("{accessor} {} {}", op.as_str(), format_value(&value)),
        FilterOperator::Like => format!("{accessor} ILIKE {}", pattern(&value, false)),
        FilterOperator::NotLike => format!("{accessor} NOT ILIKE {}", pattern(&value, false)),
        FilterOperator::Contains => format!("{accessor} ILIKE {}", pattern(&value, true)),
        FilterOperator::NotContains => format!("{accessor} NOT ILIKE {}", pattern(&value, true)),
        FilterOperator::Regex => format!("match({accessor}, {})", pattern(&value, false)),
        FilterOperator::NotRegex => format!("NOT match({accessor}, {})", pattern(&value, false)),
        FilterOperator::In | FilterOperator::NotIn => {
            if !matches!(value, FilterValue::Array(_)) {
                return Err(ServiceError::invalid(format!(
                    "operator {op} on '{}' requires an array value",
                    key.key
                )));
            }
            let keyword = if op == FilterOperator::In { "IN" } else { "NOT IN" };
            format!("{accessor} {keyword} {}", format_value(&value))
        }
        FilterOperator::Has | FilterOperator::NotHas => {
            return Err(ServiceError::unsupported(format!(
                "operator {op} requires an array json key, '{}' is {:?}",
                key.key, key.data_type
            )))
        }
        FilterOperator::Exists => return exists_check(&key.key, true),
        FilterOperator::NotExists => return exists_check(&key.key, false),
    };
    Ok(condition)
}
