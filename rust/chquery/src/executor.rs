//! Execution of compiled queries against the store, including the two-pass
//! Top-N flow for limited, grouped graphs.

use crate::error::{Result, ServiceError};
use crate::models::{AttributeKey, DataSource, FilterValue, PanelType};
use crate::progress::{ProgressReporter, ProgressTracker};
use crate::query::format::format_value;
use crate::query::{CompileRequest, GraphLimitPass, QueryEngine};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

pub type Row = serde_json::Map<String, Value>;

/// Runs SQL against the store and reports progress packets as they arrive.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(
        &self,
        query_id: &str,
        sql: &str,
        progress: ProgressReporter,
    ) -> anyhow::Result<Vec<Row>>;
}

pub struct QueryRunner<E> {
    engine: QueryEngine,
    executor: E,
    tracker: ProgressTracker,
    timeout: Duration,
}

impl<E: QueryExecutor> QueryRunner<E> {
    pub fn new(engine: QueryEngine, executor: E, tracker: ProgressTracker, timeout: Duration) -> Self {
        Self {
            engine,
            executor,
            tracker,
            timeout,
        }
    }

    pub async fn run(&self, query_id: &str, request: &CompileRequest) -> Result<Vec<Row>> {
        let guard = self.tracker.report_query_started(query_id)?;
        let reporter = guard.reporter();

        let rows = tokio::time::timeout(self.timeout, self.run_tracked(query_id, request, reporter))
            .await
            .map_err(|_| ServiceError::Timeout(format!("query {query_id} timed out")))??;

        if request.panel_type == PanelType::Value && rows.len() > 1 {
            return Err(ServiceError::invalid(format!(
                "value panel query returned {} rows, expected at most one",
                rows.len()
            )));
        }
        Ok(rows)
    }

    async fn run_tracked(
        &self,
        query_id: &str,
        request: &CompileRequest,
        reporter: ProgressReporter,
    ) -> Result<Vec<Row>> {
        if !needs_top_n(request) {
            let sql = self.engine.compile(request)?.into_sql()?;
            return Ok(self.executor.execute(query_id, &sql, reporter).await?);
        }

        let mut first = request.clone();
        first.options.graph_limit = GraphLimitPass::First;
        let sql = self.engine.compile(&first)?.into_sql()?;
        let groups = self.executor.execute(query_id, &sql, reporter.clone()).await?;
        if groups.is_empty() {
            debug!(query_id, "top-n pass returned no groups");
            return Ok(Vec::new());
        }

        let tuples = group_tuples(&groups, &request.query.group_by)?;
        let mut second = request.clone();
        second.options.graph_limit = GraphLimitPass::Second;
        let sql = self.engine.compile(&second)?.bind_top_n(&tuples);
        Ok(self.executor.execute(query_id, &sql, reporter).await?)
    }
}

/// Limited, grouped logs and traces graphs are split into a ranking pass
/// and a data pass restricted to the winning groups.
fn needs_top_n(request: &CompileRequest) -> bool {
    request.panel_type == PanelType::Graph
        && request.query.data_source != DataSource::Metrics
        && request.options.graph_limit == GraphLimitPass::None
        && !request.query.group_by.is_empty()
        && request.query.limit > 0
}

/// Renders first-pass rows as `('GET'),('POST')`.
pub fn group_tuples(rows: &[Row], group_by: &[AttributeKey]) -> Result<String> {
    let mut tuples = Vec::with_capacity(rows.len());
    for row in rows {
        let mut values = Vec::with_capacity(group_by.len());
        for key in group_by {
            let value = row.get(&key.key).ok_or_else(|| {
                ServiceError::Internal(anyhow::anyhow!(
                    "top-n row is missing group column {}",
                    key.key
                ))
            })?;
            values.push(format_value(&json_to_filter_value(value)));
        }
        tuples.push(format!("({})", values.join(",")));
    }
    Ok(tuples.join(","))
}

fn json_to_filter_value(value: &Value) -> FilterValue {
    match value {
        Value::Null => FilterValue::Null,
        Value::Bool(v) => FilterValue::Bool(*v),
        Value::Number(n) => match n.as_i64() {
            Some(v) => FilterValue::Int(v),
            None => FilterValue::Float(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => FilterValue::String(s.clone()),
        Value::Array(items) => FilterValue::Array(items.iter().map(json_to_filter_value).collect()),
        Value::Object(_) => FilterValue::String(value.to_string()),
    }
}
