//! Log pipelines transpiled into OTTL statements for the collector's
//! `signoztransform` processor.
//!
//! Every enabled pipeline first tags matching logs with a marker attribute,
//! runs its operators only on tagged logs, then removes the marker. Operators
//! that rewrite the fields referenced by the pipeline filter therefore cannot
//! cut the pipeline short.

use crate::error::{Result, ServiceError};
use crate::models::{
    AttributeKey, AttributeKeyType, FilterItem, FilterOperator, FilterSet, FilterValue,
    LogicalOperator,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const PROCESSOR_NAME: &str = "signoztransform/logs-pipelines";
const MARKER_ATTRIBUTE: &str = "__matched-log-pipeline__";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pipeline {
    pub id: String,
    pub alias: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub filter: Option<FilterSet>,
    #[serde(default)]
    pub config: Vec<PipelineOperator>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineOperator {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub field: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
}

/// Processor definitions keyed by name, plus the names in pipeline order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessorConfig {
    pub names: Vec<String>,
    pub processors: serde_json::Map<String, Value>,
}

pub trait PipelineTranspiler {
    fn transpile(&self, pipelines: &[Pipeline]) -> Result<ProcessorConfig>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OttlTranspiler;

impl PipelineTranspiler for OttlTranspiler {
    fn transpile(&self, pipelines: &[Pipeline]) -> Result<ProcessorConfig> {
        let mut statements = Vec::new();
        for pipeline in pipelines.iter().filter(|pipeline| pipeline.enabled) {
            let pipeline_statements = statements_for_pipeline(pipeline)
                .map_err(|err| err.context(&format!("pipeline {}", pipeline.alias)))?;
            statements.extend(pipeline_statements);
        }

        let mut config = ProcessorConfig::default();
        if statements.is_empty() {
            return Ok(config);
        }
        config.names.push(PROCESSOR_NAME.to_string());
        config.processors.insert(
            PROCESSOR_NAME.to_string(),
            json!({
                "error_mode": "ignore",
                "log_statements": [{
                    "context": "log",
                    "statements": statements,
                }],
            }),
        );
        Ok(config)
    }
}

struct Statement {
    editor: String,
    conditions: Vec<String>,
}

impl Statement {
    fn new(editor: String) -> Self {
        Self {
            editor,
            conditions: Vec::new(),
        }
    }

    fn when(mut self, condition: String) -> Self {
        self.conditions.push(condition);
        self
    }

    fn render(&self) -> String {
        let conditions: Vec<&str> = self
            .conditions
            .iter()
            .map(String::as_str)
            .filter(|condition| !condition.is_empty())
            .collect();
        if conditions.is_empty() {
            self.editor.clone()
        } else {
            format!("{} where {}", self.editor, conditions.join(" and "))
        }
    }
}

fn statements_for_pipeline(pipeline: &Pipeline) -> Result<Vec<String>> {
    let operators: Vec<&PipelineOperator> =
        pipeline.config.iter().filter(|op| op.enabled).collect();
    if operators.is_empty() {
        return Ok(Vec::new());
    }

    let marker = format!("{}-{}", pipeline.alias, pipeline.id);
    let mut add_marker = Statement::new(format!(
        "set(attributes[\"{MARKER_ATTRIBUTE}\"], \"{}\")",
        escape(&marker)
    ));
    if let Some(filter) = &pipeline.filter {
        add_marker = add_marker.when(filter_condition(filter)?);
    }

    let matches_marker = format!("attributes[\"{MARKER_ATTRIBUTE}\"] == \"{}\"", escape(&marker));
    let mut statements = vec![add_marker.render()];
    for operator in operators {
        for mut statement in statements_for_operator(operator)? {
            statement.conditions.insert(0, matches_marker.clone());
            statements.push(statement.render());
        }
    }
    statements.push(format!(
        "delete_key(attributes, \"{MARKER_ATTRIBUTE}\") where {matches_marker}"
    ));
    Ok(statements)
}

fn statements_for_operator(operator: &PipelineOperator) -> Result<Vec<Statement>> {
    match operator.kind.as_str() {
        "add" => Ok(vec![Statement::new(format!(
            "set({}, \"{}\")",
            ottl_path(&operator.field),
            escape(&operator.value)
        ))]),
        "remove" => Ok(vec![delete_field(&operator.field)?]),
        "copy" => Ok(vec![Statement::new(format!(
            "set({}, {})",
            ottl_path(&operator.to),
            ottl_path(&operator.from)
        ))]),
        "move" => Ok(vec![
            Statement::new(format!(
                "set({}, {})",
                ottl_path(&operator.to),
                ottl_path(&operator.from)
            )),
            delete_field(&operator.from)?,
        ]),
        other => Err(ServiceError::invalid(format!(
            "unsupported pipeline operator type: {other}"
        ))),
    }
}

/// `attributes.a.b` -> `attributes["a"]["b"]`, `resource.a` ->
/// `resource.attributes["a"]`. Top-level log fields pass through.
pub fn ottl_path(path: &str) -> String {
    let mut parts = path.split('.');
    let root = match parts.next() {
        Some("attributes") => "attributes",
        Some("resource") => "resource.attributes",
        _ => return path.to_string(),
    };
    let mut rendered = root.to_string();
    for part in parts {
        rendered.push_str(&format!("[\"{}\"]", escape(part)));
    }
    rendered
}

fn delete_field(path: &str) -> Result<Statement> {
    let rendered = ottl_path(path);
    let (target, key) = rendered
        .rsplit_once('[')
        .filter(|(target, _)| !target.is_empty())
        .ok_or_else(|| ServiceError::invalid(format!("cannot delete log field {path}")))?;
    let key = key.trim_end_matches(']');
    Ok(Statement::new(format!("delete_key({target}, {key})"))
        .when(format!("{rendered} != nil")))
}

/// Escapes `\` and `"` for an OTTL string literal.
pub fn escape(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('"', "\\\"")
}

fn regex_escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if "\\.+*?()|[]{}^$".contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn key_path(key: &AttributeKey) -> String {
    match key.key_type {
        AttributeKeyType::Tag => format!("attributes[\"{}\"]", escape(&key.key)),
        AttributeKeyType::Resource => format!("resource.attributes[\"{}\"]", escape(&key.key)),
        AttributeKeyType::Unspecified => key.key.clone(),
    }
}

fn literal(value: &FilterValue) -> Result<String> {
    match value {
        FilterValue::String(s) => Ok(format!("\"{}\"", escape(s))),
        FilterValue::Int(v) => Ok(v.to_string()),
        FilterValue::Float(v) => Ok(v.to_string()),
        FilterValue::Bool(v) => Ok(v.to_string()),
        FilterValue::Null => Ok("nil".to_string()),
        FilterValue::Array(_) => Err(ServiceError::unsupported(
            "array values are not supported in pipeline filters",
        )),
    }
}

fn item_condition(item: &FilterItem) -> Result<String> {
    let path = key_path(&item.key);
    let condition = match item.op {
        FilterOperator::Eq => format!("{path} == {}", literal(&item.value)?),
        FilterOperator::NotEq => format!("{path} != {}", literal(&item.value)?),
        FilterOperator::Lt => format!("{path} < {}", literal(&item.value)?),
        FilterOperator::Lte => format!("{path} <= {}", literal(&item.value)?),
        FilterOperator::Gt => format!("{path} > {}", literal(&item.value)?),
        FilterOperator::Gte => format!("{path} >= {}", literal(&item.value)?),
        FilterOperator::Regex => format!(
            "{path} != nil and IsMatch({path}, \"{}\")",
            escape(&item.value.as_text())
        ),
        FilterOperator::NotRegex => format!(
            "{path} != nil and not IsMatch({path}, \"{}\")",
            escape(&item.value.as_text())
        ),
        FilterOperator::Contains => format!(
            "{path} != nil and IsMatch({path}, \"{}\")",
            escape(&regex_escape(&item.value.as_text()))
        ),
        FilterOperator::NotContains => format!(
            "{path} != nil and not IsMatch({path}, \"{}\")",
            escape(&regex_escape(&item.value.as_text()))
        ),
        FilterOperator::Exists => format!("{path} != nil"),
        FilterOperator::NotExists => format!("{path} == nil"),
        other => {
            return Err(ServiceError::unsupported(format!(
                "operator {} is not supported in pipeline filters",
                other.as_str()
            )))
        }
    };
    Ok(condition)
}

/// Pipeline filter rendered as an OTTL boolean expression.
pub fn filter_condition(filter: &FilterSet) -> Result<String> {
    let conditions = filter
        .items
        .iter()
        .map(item_condition)
        .collect::<Result<Vec<_>>>()?;
    Ok(match (filter.op, conditions.len()) {
        (_, 0) => String::new(),
        (LogicalOperator::And, _) => conditions.join(" and "),
        (LogicalOperator::Or, _) => format!(
            "({})",
            conditions
                .iter()
                .map(|condition| format!("({condition})"))
                .collect::<Vec<_>>()
                .join(" or ")
        ),
    })
}
