//! Cursor encoding helpers for list pagination.
//!
//! A cursor remembers the last row of the previous page. Applying it narrows
//! the next list query to rows older than that row.

use crate::error::{Result, ServiceError};
use crate::models::{
    AttributeKey, AttributeKeyType, BuilderQuery, DataType, FilterItem, FilterOperator, FilterSet,
    LogicalOperator,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListCursor {
    pub timestamp: i64,
    pub id: String,
}

pub fn decode_cursor(cursor: &str) -> Result<ListCursor> {
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|_| ServiceError::InvalidRequest("invalid cursor".into()))?;
    let payload: ListCursor = serde_json::from_slice(&bytes)
        .map_err(|_| ServiceError::InvalidRequest("invalid cursor".into()))?;
    if payload.id.is_empty() {
        return Err(ServiceError::InvalidRequest("invalid cursor".into()));
    }
    Ok(payload)
}

pub fn encode_cursor(cursor: &ListCursor) -> String {
    URL_SAFE_NO_PAD.encode(serde_json::to_vec(cursor).unwrap_or_default())
}

/// Adds `id < '<last id>'` to the query filters.
pub fn apply_list_cursor(query: &mut BuilderQuery, cursor: &ListCursor) -> Result<()> {
    let filters = query.filters.get_or_insert_with(|| FilterSet::and(Vec::new()));
    if filters.op == LogicalOperator::Or && !filters.items.is_empty() {
        return Err(ServiceError::invalid(
            "cursor pagination cannot be combined with OR filters",
        ));
    }
    filters.items.push(FilterItem::new(
        AttributeKey::new("id", DataType::Unspecified, AttributeKeyType::Unspecified).column(),
        FilterOperator::Lt,
        cursor.id.as_str(),
    ));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AggregateOperator, DataSource, FilterValue};

    fn cursor() -> ListCursor {
        ListCursor {
            timestamp: 1680066458000000000,
            id: "2PQQGuVbXbj7vZVzvh0Vql7kpTG".to_string(),
        }
    }

    #[test]
    fn cursor_survives_encoding() {
        let encoded = encode_cursor(&cursor());
        assert!(!encoded.contains('='));
        assert_eq!(decode_cursor(&encoded).unwrap(), cursor());
    }

    #[test]
    fn garbage_is_rejected() {
        for raw in ["not base64!", "bm90IGpzb24", ""] {
            let err = decode_cursor(raw).unwrap_err();
            assert_eq!(err.to_string(), "invalid request: invalid cursor");
        }
    }

    #[test]
    fn cursor_appends_id_filter() {
        let mut query = BuilderQuery::new(DataSource::Logs, AggregateOperator::Noop);
        apply_list_cursor(&mut query, &cursor()).unwrap();
        let items = query.filter_items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].key.key, "id");
        assert!(items[0].key.is_column);
        assert_eq!(items[0].op, FilterOperator::Lt);
        assert_eq!(
            items[0].value,
            FilterValue::String("2PQQGuVbXbj7vZVzvh0Vql7kpTG".into())
        );
    }

    #[test]
    fn or_filters_cannot_take_cursor() {
        let mut query = BuilderQuery::new(DataSource::Logs, AggregateOperator::Noop);
        query.filters = Some(FilterSet {
            op: LogicalOperator::Or,
            items: vec![FilterItem::new(
                AttributeKey::new("method", DataType::String, AttributeKeyType::Tag),
                FilterOperator::Eq,
                "GET",
            )],
        });
        assert!(apply_list_cursor(&mut query, &cursor()).is_err());
    }
}
