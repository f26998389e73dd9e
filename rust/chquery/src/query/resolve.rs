//! Attribute resolution: logical keys to physical column expressions.

use super::format::{quote_alias, quote_identifier, quote_string};
use crate::models::{AttributeKey, AttributeKeyType, DataType};

/// Physical layout of one signal's attribute storage.
pub trait AttributeResolver {
    /// Expression that reads `key`.
    fn column(&self, key: &AttributeKey) -> String;

    /// Predicate that holds when `key` is present (`exists`) or absent.
    fn existence_guard(&self, key: &AttributeKey, exists: bool) -> String;

    /// True when `key` addresses a fixed top-level column.
    fn is_top_level(&self, key: &AttributeKey) -> bool;

    /// Pattern match operators for like/contains as `(positive, negative)`.
    fn like_operators(&self) -> (&'static str, &'static str) {
        ("LIKE", "NOT LIKE")
    }

    /// Whether each non-column filter item is followed by its own guard.
    fn guards_filter_items(&self) -> bool {
        true
    }
}

const LOGS_STATIC_FIELDS: &[&str] = &[
    "timestamp",
    "id",
    "trace_id",
    "span_id",
    "trace_flags",
    "severity_text",
    "severity_number",
    "body",
];

const LOGS_NUMERIC_FIELDS: &[&str] = &["trace_flags", "severity_number"];

fn storage_suffix(data_type: DataType) -> &'static str {
    match data_type {
        DataType::Int64 | DataType::Float64 => "number",
        DataType::Bool => "bool",
        _ => "string",
    }
}

fn zero_check(column: &str, numeric: bool, data_type: DataType, exists: bool) -> String {
    let op = if exists { "!=" } else { "=" };
    if numeric {
        format!("{column} {op} 0")
    } else if data_type == DataType::Bool {
        format!("{column} {op} false")
    } else {
        format!("{column} {op} ''")
    }
}

/// Wide logs table: per-type attribute maps plus materialized columns.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogsResolver;

impl LogsResolver {
    fn map_group(key: &AttributeKey) -> &'static str {
        match key.key_type {
            AttributeKeyType::Tag => "attributes",
            _ => "resources",
        }
    }

    fn materialized_name(key: &AttributeKey) -> String {
        let prefix = match key.key_type {
            AttributeKeyType::Tag => "attribute",
            _ => "resource",
        };
        format!("{prefix}_{}_{}", storage_suffix(key.data_type), key.key)
    }
}

impl AttributeResolver for LogsResolver {
    fn column(&self, key: &AttributeKey) -> String {
        if self.is_top_level(key) {
            return quote_identifier(&key.key);
        }
        if !key.is_column {
            return format!(
                "{}_{}[{}]",
                Self::map_group(key),
                storage_suffix(key.data_type),
                quote_string(&key.key)
            );
        }
        quote_alias(&Self::materialized_name(key))
    }

    fn existence_guard(&self, key: &AttributeKey, exists: bool) -> String {
        if self.is_top_level(key) {
            let numeric = LOGS_NUMERIC_FIELDS.contains(&key.key.as_str())
                || (!LOGS_STATIC_FIELDS.contains(&key.key.as_str()) && key.data_type.is_numeric());
            return zero_check(&quote_identifier(&key.key), numeric, key.data_type, exists);
        }
        if !key.is_column {
            let guard = format!(
                "mapContains({}_{}, {})",
                Self::map_group(key),
                storage_suffix(key.data_type),
                quote_string(&key.key)
            );
            return if exists { guard } else { format!("not {guard}") };
        }
        format!(
            "{}={}",
            quote_alias(&format!("{}_exists", Self::materialized_name(key))),
            exists
        )
    }

    fn is_top_level(&self, key: &AttributeKey) -> bool {
        key.key == "timestamp"
            || key.key == "id"
            || (key.key_type == AttributeKeyType::Unspecified
                && (key.is_column || LOGS_STATIC_FIELDS.contains(&key.key.as_str())))
    }
}

/// Span index table: typed tag maps and a single resource map.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracesResolver;

impl TracesResolver {
    fn map_name(key: &AttributeKey) -> &'static str {
        match (key.key_type, key.data_type) {
            (AttributeKeyType::Tag, DataType::Int64 | DataType::Float64) => "numberTagMap",
            (AttributeKeyType::Tag, DataType::Bool) => "boolTagMap",
            (AttributeKeyType::Tag, _) => "stringTagMap",
            _ => "resourceTagsMap",
        }
    }
}

impl AttributeResolver for TracesResolver {
    fn column(&self, key: &AttributeKey) -> String {
        if self.is_top_level(key) {
            return quote_identifier(&key.key);
        }
        format!("{}[{}]", Self::map_name(key), quote_string(&key.key))
    }

    fn existence_guard(&self, key: &AttributeKey, exists: bool) -> String {
        if self.is_top_level(key) {
            return zero_check(
                &quote_identifier(&key.key),
                key.data_type.is_numeric(),
                key.data_type,
                exists,
            );
        }
        let guard = format!(
            "mapContains({}, {})",
            Self::map_name(key),
            quote_string(&key.key)
        );
        if exists {
            guard
        } else {
            format!("NOT {guard}")
        }
    }

    fn is_top_level(&self, key: &AttributeKey) -> bool {
        key.is_column || key.key == "timestamp"
    }

    fn like_operators(&self) -> (&'static str, &'static str) {
        ("ILIKE", "NOT ILIKE")
    }

    fn guards_filter_items(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(name: &str, data_type: DataType) -> AttributeKey {
        AttributeKey::new(name, data_type, AttributeKeyType::Tag)
    }

    #[test]
    fn resolves_logs_columns() {
        let resolver = LogsResolver;
        assert_eq!(
            resolver.column(&tag("user_name", DataType::String)),
            "attributes_string['user_name']"
        );
        assert_eq!(
            resolver.column(&tag("bytes", DataType::Float64)),
            "attributes_number['bytes']"
        );
        assert_eq!(
            resolver.column(&AttributeKey::new(
                "mycolumn",
                DataType::Unspecified,
                AttributeKeyType::Unspecified
            )),
            "resources_string['mycolumn']"
        );
        assert_eq!(
            resolver.column(&tag("method", DataType::String).column()),
            "`attribute_string_method`"
        );
        assert_eq!(
            resolver.column(&tag("host.name", DataType::String).column()),
            "`attribute_string_host.name`"
        );
        assert_eq!(
            resolver.column(
                &AttributeKey::new("host", DataType::Unspecified, AttributeKeyType::Unspecified)
                    .column()
            ),
            "host"
        );
        // a tag that shadows a top-level column name still reads the map
        assert_eq!(
            resolver.column(&tag("trace_id", DataType::String)),
            "attributes_string['trace_id']"
        );
    }

    #[test]
    fn logs_existence_guards() {
        let resolver = LogsResolver;
        assert_eq!(
            resolver.existence_guard(&tag("method", DataType::String).column(), true),
            "`attribute_string_method_exists`=true"
        );
        assert_eq!(
            resolver.existence_guard(&tag("status", DataType::Int64).column(), false),
            "`attribute_number_status_exists`=false"
        );
        assert_eq!(
            resolver.existence_guard(&tag("user_name", DataType::String), true),
            "mapContains(attributes_string, 'user_name')"
        );
        let trace_flags = AttributeKey::new(
            "trace_flags",
            DataType::Unspecified,
            AttributeKeyType::Unspecified,
        );
        assert_eq!(
            resolver.existence_guard(&trace_flags, true),
            "trace_flags != 0"
        );
        let span_id =
            AttributeKey::new("span_id", DataType::Unspecified, AttributeKeyType::Unspecified);
        assert_eq!(resolver.existence_guard(&span_id, false), "span_id = ''");
    }

    #[test]
    fn resolves_trace_columns() {
        let resolver = TracesResolver;
        assert_eq!(
            resolver.column(&tag("http.route", DataType::String)),
            "stringTagMap['http.route']"
        );
        assert_eq!(
            resolver.column(&AttributeKey::new(
                "service.name",
                DataType::String,
                AttributeKeyType::Resource
            )),
            "resourceTagsMap['service.name']"
        );
        let duration = tag("durationNano", DataType::Float64).column();
        assert_eq!(resolver.column(&duration), "durationNano");
        assert_eq!(
            resolver.existence_guard(&duration, true),
            "durationNano != 0"
        );
    }
}
