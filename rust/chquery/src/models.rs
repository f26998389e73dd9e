//! Request model for builder queries.
//!
//! These types mirror the JSON the dashboard and alerting UIs send. They are
//! immutable once deserialized; the compiler only ever borrows them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Sentinel column name meaning "order by the computed aggregate value".
pub const ORDER_BY_VALUE: &str = "#SIGNOZ_VALUE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DataType {
    #[default]
    #[serde(rename = "")]
    Unspecified,
    #[serde(rename = "string")]
    String,
    #[serde(rename = "int64")]
    Int64,
    #[serde(rename = "float64")]
    Float64,
    #[serde(rename = "bool")]
    Bool,
    #[serde(rename = "array(string)")]
    ArrayString,
    #[serde(rename = "array(int64)")]
    ArrayInt64,
    #[serde(rename = "array(float64)")]
    ArrayFloat64,
    #[serde(rename = "array(bool)")]
    ArrayBool,
}

impl DataType {
    pub fn is_array(self) -> bool {
        matches!(
            self,
            DataType::ArrayString | DataType::ArrayInt64 | DataType::ArrayFloat64 | DataType::ArrayBool
        )
    }

    /// Element type of an array type; scalars map to themselves.
    pub fn element(self) -> DataType {
        match self {
            DataType::ArrayString => DataType::String,
            DataType::ArrayInt64 => DataType::Int64,
            DataType::ArrayFloat64 => DataType::Float64,
            DataType::ArrayBool => DataType::Bool,
            other => other,
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, DataType::Int64 | DataType::Float64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AttributeKeyType {
    #[default]
    #[serde(rename = "")]
    Unspecified,
    #[serde(rename = "tag")]
    Tag,
    #[serde(rename = "resource")]
    Resource,
}

/// Logical reference to a field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeKey {
    pub key: String,
    #[serde(default)]
    pub data_type: DataType,
    #[serde(default, rename = "type")]
    pub key_type: AttributeKeyType,
    #[serde(default)]
    pub is_column: bool,
    #[serde(default, rename = "isJSON")]
    pub is_json: bool,
}

impl AttributeKey {
    pub fn new(key: impl Into<String>, data_type: DataType, key_type: AttributeKeyType) -> Self {
        Self {
            key: key.into(),
            data_type,
            key_type,
            is_column: false,
            is_json: false,
        }
    }

    pub fn column(mut self) -> Self {
        self.is_column = true;
        self
    }

    pub fn json(mut self) -> Self {
        self.is_json = true;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }
}

// Identity excludes the JSON flag: two keys that differ only there address the
// same stored field.
impl PartialEq for AttributeKey {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
            && self.key_type == other.key_type
            && self.data_type == other.data_type
            && self.is_column == other.is_column
    }
}

impl Eq for AttributeKey {}

impl Hash for AttributeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
        self.key_type.hash(state);
        self.data_type.hash(state);
        self.is_column.hash(state);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FilterOperator {
    Eq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
    Like,
    NotLike,
    Contains,
    NotContains,
    Regex,
    NotRegex,
    In,
    NotIn,
    Exists,
    NotExists,
    Has,
    NotHas,
}

impl FilterOperator {
    pub fn as_str(self) -> &'static str {
        match self {
            FilterOperator::Eq => "=",
            FilterOperator::NotEq => "!=",
            FilterOperator::Lt => "<",
            FilterOperator::Lte => "<=",
            FilterOperator::Gt => ">",
            FilterOperator::Gte => ">=",
            FilterOperator::Like => "like",
            FilterOperator::NotLike => "nlike",
            FilterOperator::Contains => "contains",
            FilterOperator::NotContains => "ncontains",
            FilterOperator::Regex => "regex",
            FilterOperator::NotRegex => "nregex",
            FilterOperator::In => "in",
            FilterOperator::NotIn => "nin",
            FilterOperator::Exists => "exists",
            FilterOperator::NotExists => "nexists",
            FilterOperator::Has => "has",
            FilterOperator::NotHas => "nhas",
        }
    }

    pub fn is_existence(self) -> bool {
        matches!(self, FilterOperator::Exists | FilterOperator::NotExists)
    }
}

impl FromStr for FilterOperator {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let op = match raw.trim().to_ascii_lowercase().as_str() {
            "=" | "==" => FilterOperator::Eq,
            "!=" => FilterOperator::NotEq,
            "<" => FilterOperator::Lt,
            "<=" => FilterOperator::Lte,
            ">" => FilterOperator::Gt,
            ">=" => FilterOperator::Gte,
            "like" => FilterOperator::Like,
            "nlike" => FilterOperator::NotLike,
            "contains" => FilterOperator::Contains,
            "ncontains" => FilterOperator::NotContains,
            "regex" => FilterOperator::Regex,
            "nregex" => FilterOperator::NotRegex,
            "in" => FilterOperator::In,
            "nin" => FilterOperator::NotIn,
            "exists" => FilterOperator::Exists,
            "nexists" => FilterOperator::NotExists,
            "has" => FilterOperator::Has,
            "nhas" => FilterOperator::NotHas,
            other => return Err(format!("unsupported filter operator '{other}'")),
        };
        Ok(op)
    }
}

impl TryFrom<String> for FilterOperator {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FilterOperator> for String {
    fn from(op: FilterOperator) -> Self {
        op.as_str().to_string()
    }
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scalar or array filter value. Integers and floats stay distinct so that
/// literals render the way the caller typed them.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<FilterValue>),
}

impl FilterValue {
    pub fn kind(&self) -> &'static str {
        match self {
            FilterValue::Null => "null",
            FilterValue::Bool(_) => "bool",
            FilterValue::Int(_) => "int",
            FilterValue::Float(_) => "float",
            FilterValue::String(_) => "string",
            FilterValue::Array(_) => "array",
        }
    }

    /// Plain text of a scalar, without quoting. Used where a value is spliced
    /// into a pattern such as `%v%`.
    pub fn as_text(&self) -> String {
        match self {
            FilterValue::Null => String::new(),
            FilterValue::Bool(v) => v.to_string(),
            FilterValue::Int(v) => v.to_string(),
            FilterValue::Float(v) => v.to_string(),
            FilterValue::String(v) => v.clone(),
            FilterValue::Array(values) => values
                .iter()
                .map(FilterValue::as_text)
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        FilterValue::String(value.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(value: String) -> Self {
        FilterValue::String(value)
    }
}

impl From<i64> for FilterValue {
    fn from(value: i64) -> Self {
        FilterValue::Int(value)
    }
}

impl From<i32> for FilterValue {
    fn from(value: i32) -> Self {
        FilterValue::Int(i64::from(value))
    }
}

impl From<f64> for FilterValue {
    fn from(value: f64) -> Self {
        FilterValue::Float(value)
    }
}

impl From<bool> for FilterValue {
    fn from(value: bool) -> Self {
        FilterValue::Bool(value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterItem {
    pub key: AttributeKey,
    pub op: FilterOperator,
    #[serde(default)]
    pub value: FilterValue,
}

impl FilterItem {
    pub fn new(key: AttributeKey, op: FilterOperator, value: impl Into<FilterValue>) -> Self {
        Self {
            key,
            op,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LogicalOperator {
    #[default]
    #[serde(rename = "AND", alias = "and")]
    And,
    #[serde(rename = "OR", alias = "or")]
    Or,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterSet {
    #[serde(default)]
    pub op: LogicalOperator,
    #[serde(default)]
    pub items: Vec<FilterItem>,
}

impl FilterSet {
    pub fn and(items: Vec<FilterItem>) -> Self {
        Self {
            op: LogicalOperator::And,
            items,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBy {
    pub column_name: String,
    pub order: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub data_type: DataType,
    #[serde(default, rename = "type")]
    pub key_type: AttributeKeyType,
    #[serde(default)]
    pub is_column: bool,
}

impl OrderBy {
    pub fn new(column_name: impl Into<String>, order: impl Into<String>) -> Self {
        Self {
            column_name: column_name.into(),
            order: order.into(),
            ..Self::default()
        }
    }

    pub fn is_value(&self) -> bool {
        self.column_name == ORDER_BY_VALUE
    }

    /// Attribute key this order item refers to when it is not a group key.
    pub fn attribute(&self) -> AttributeKey {
        let key = if self.key.is_empty() {
            self.column_name.clone()
        } else {
            self.key.clone()
        };
        AttributeKey {
            key,
            data_type: self.data_type,
            key_type: self.key_type,
            is_column: self.is_column,
            is_json: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HavingOperator {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    NotEq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "IN", alias = "in")]
    In,
    #[serde(rename = "NOT IN", alias = "nin", alias = "not in")]
    NotIn,
}

impl HavingOperator {
    pub fn as_sql(self) -> &'static str {
        match self {
            HavingOperator::Eq => "=",
            HavingOperator::NotEq => "!=",
            HavingOperator::Lt => "<",
            HavingOperator::Lte => "<=",
            HavingOperator::Gt => ">",
            HavingOperator::Gte => ">=",
            HavingOperator::In => "IN",
            HavingOperator::NotIn => "NOT IN",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Having {
    pub column_name: String,
    pub operator: HavingOperator,
    pub value: FilterValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateOperator {
    #[default]
    Noop,
    Count,
    CountDistinct,
    Sum,
    Avg,
    Min,
    Max,
    P05,
    P10,
    P20,
    P25,
    P50,
    P75,
    P90,
    P95,
    P99,
    Rate,
    SumRate,
    AvgRate,
    MaxRate,
    MinRate,
    RateSum,
    RateAvg,
    RateMax,
    RateMin,
    #[serde(rename = "hist_quantile_50")]
    HistQuant50,
    #[serde(rename = "hist_quantile_75")]
    HistQuant75,
    #[serde(rename = "hist_quantile_90")]
    HistQuant90,
    #[serde(rename = "hist_quantile_95")]
    HistQuant95,
    #[serde(rename = "hist_quantile_99")]
    HistQuant99,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Temporality {
    #[default]
    Unspecified,
    Delta,
    Cumulative,
}

impl Temporality {
    pub fn as_str(self) -> &'static str {
        match self {
            Temporality::Unspecified => "Unspecified",
            Temporality::Delta => "Delta",
            Temporality::Cumulative => "Cumulative",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    #[default]
    #[serde(rename = "")]
    Unspecified,
    Sum,
    Gauge,
    Histogram,
    ExponentialHistogram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeAggregation {
    Latest,
    Sum,
    Avg,
    Min,
    Max,
    Count,
    CountDistinct,
    Rate,
    Increase,
}

impl TimeAggregation {
    pub fn is_rate_like(self) -> bool {
        matches!(self, TimeAggregation::Rate | TimeAggregation::Increase)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpaceAggregation {
    Sum,
    Avg,
    Min,
    Max,
    Count,
    Percentile50,
    Percentile75,
    Percentile90,
    Percentile95,
    Percentile99,
}

impl SpaceAggregation {
    pub fn quantile(self) -> Option<&'static str> {
        match self {
            SpaceAggregation::Percentile50 => Some("0.500"),
            SpaceAggregation::Percentile75 => Some("0.750"),
            SpaceAggregation::Percentile90 => Some("0.900"),
            SpaceAggregation::Percentile95 => Some("0.950"),
            SpaceAggregation::Percentile99 => Some("0.990"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReduceTo {
    #[default]
    Last,
    Sum,
    Avg,
    Max,
    Min,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PanelType {
    Graph,
    Table,
    Value,
    List,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Logs,
    Metrics,
    Traces,
}

/// Declarative descriptor of one query panel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuilderQuery {
    #[serde(default)]
    pub query_name: String,
    pub data_source: DataSource,
    #[serde(default)]
    pub aggregate_attribute: AttributeKey,
    #[serde(default)]
    pub aggregate_operator: AggregateOperator,
    #[serde(default)]
    pub time_aggregation: Option<TimeAggregation>,
    #[serde(default)]
    pub space_aggregation: Option<SpaceAggregation>,
    #[serde(default)]
    pub temporality: Temporality,
    #[serde(default)]
    pub metric_type: MetricType,
    #[serde(default)]
    pub filters: Option<FilterSet>,
    #[serde(default)]
    pub group_by: Vec<AttributeKey>,
    #[serde(default)]
    pub order_by: Vec<OrderBy>,
    #[serde(default)]
    pub having: Vec<Having>,
    #[serde(default)]
    pub step_interval: i64,
    #[serde(default)]
    pub limit: u64,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub page_size: u64,
    #[serde(default)]
    pub reduce_to: ReduceTo,
    #[serde(default)]
    pub expression: String,
    #[serde(default)]
    pub disabled: bool,
}

impl BuilderQuery {
    pub fn new(data_source: DataSource, aggregate_operator: AggregateOperator) -> Self {
        Self {
            query_name: "A".to_string(),
            data_source,
            aggregate_attribute: AttributeKey::default(),
            aggregate_operator,
            time_aggregation: None,
            space_aggregation: None,
            temporality: Temporality::Unspecified,
            metric_type: MetricType::Unspecified,
            filters: None,
            group_by: Vec::new(),
            order_by: Vec::new(),
            having: Vec::new(),
            step_interval: 60,
            limit: 0,
            offset: 0,
            page_size: 0,
            reduce_to: ReduceTo::Last,
            expression: "A".to_string(),
            disabled: false,
        }
    }

    pub fn filter_items(&self) -> &[FilterItem] {
        self.filters
            .as_ref()
            .map(|set| set.items.as_slice())
            .unwrap_or_default()
    }

    pub fn filter_op(&self) -> LogicalOperator {
        self.filters.as_ref().map(|set| set.op).unwrap_or_default()
    }
}
