//! Literal and identifier rendering.
//!
//! Every value or name that reaches generated SQL passes through this module;
//! the builders never quote or escape inline.

use crate::models::{DataType, FilterValue};

/// Escapes a string for use inside a single-quoted literal.
pub fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            other => out.push(other),
        }
    }
    out
}

/// Single-quoted, escaped string literal.
pub fn quote_string(raw: &str) -> String {
    format!("'{}'", escape(raw))
}

/// Fixed six-decimal rendering used for float literals and rate denominators.
pub fn fixed(value: f64) -> String {
    format!("{value:.6}")
}

pub fn format_value(value: &FilterValue) -> String {
    match value {
        FilterValue::Null => "NULL".to_string(),
        FilterValue::Bool(v) => v.to_string(),
        FilterValue::Int(v) => v.to_string(),
        FilterValue::Float(v) => fixed(*v),
        FilterValue::String(v) => quote_string(v),
        FilterValue::Array(values) => {
            let parts: Vec<String> = values.iter().map(format_value).collect();
            format!("[{}]", parts.join(","))
        }
    }
}

fn is_simple_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

/// Back-tick quotes `name` unless it is a plain identifier.
pub fn quote_identifier(name: &str) -> String {
    if is_simple_identifier(name) {
        name.to_string()
    } else {
        quote_alias(name)
    }
}

/// Always back-tick quotes `name`.
pub fn quote_alias(name: &str) -> String {
    format!("`{}`", name.replace('`', "\\`"))
}

fn type_name(data_type: DataType) -> &'static str {
    match data_type.element() {
        DataType::Int64 => "int",
        DataType::Float64 => "float",
        DataType::Bool => "bool",
        _ => "string",
    }
}

fn mismatch(data_type: DataType, value: &FilterValue) -> String {
    format!(
        "invalid data type, expected {}, got {}",
        type_name(data_type),
        value.kind()
    )
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "1" => Some(true),
        "false" | "f" | "0" => Some(false),
        _ => None,
    }
}

fn cast_scalar(value: &FilterValue, data_type: DataType) -> Result<FilterValue, String> {
    let cast = match (data_type, value) {
        (DataType::Bool, FilterValue::Bool(_)) => Some(value.clone()),
        (DataType::Bool, FilterValue::String(raw)) => parse_bool(raw).map(FilterValue::Bool),
        (DataType::Int64, FilterValue::Int(_)) => Some(value.clone()),
        (DataType::Int64, FilterValue::Float(v)) if v.fract() == 0.0 => {
            Some(FilterValue::Int(*v as i64))
        }
        (DataType::Int64, FilterValue::String(raw)) => {
            raw.trim().parse::<i64>().ok().map(FilterValue::Int)
        }
        (DataType::Float64, FilterValue::Float(_)) => Some(value.clone()),
        (DataType::Float64, FilterValue::Int(v)) => Some(FilterValue::Float(*v as f64)),
        (DataType::Float64, FilterValue::String(raw)) => {
            raw.trim().parse::<f64>().ok().map(FilterValue::Float)
        }
        (DataType::String, FilterValue::String(_)) => Some(value.clone()),
        (DataType::String, FilterValue::Int(_) | FilterValue::Float(_) | FilterValue::Bool(_)) => {
            Some(FilterValue::String(value.as_text()))
        }
        _ => None,
    };
    cast.ok_or_else(|| mismatch(data_type, value))
}

/// Checks `value` against the declared data type and casts scalars to the
/// literal form that type expects. Array elements are checked but kept as
/// given.
pub fn validate_and_cast(value: &FilterValue, data_type: DataType) -> Result<FilterValue, String> {
    if data_type == DataType::Unspecified {
        return Ok(value.clone());
    }

    let element = data_type.element();
    match value {
        FilterValue::Array(values) => {
            for entry in values {
                if matches!(entry, FilterValue::Array(_)) {
                    return Err(mismatch(data_type, entry));
                }
                cast_scalar(entry, element)?;
            }
            Ok(value.clone())
        }
        scalar => cast_scalar(scalar, element),
    }
}
