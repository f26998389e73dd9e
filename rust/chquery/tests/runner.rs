use async_trait::async_trait;
use chquery::config::AppConfig;
use chquery::error::ServiceError;
use chquery::executor::{QueryExecutor, QueryRunner, Row};
use chquery::models::{
    AggregateOperator, AttributeKey, AttributeKeyType, BuilderQuery, DataSource, DataType,
    PanelType,
};
use chquery::progress::{ProgressReporter, ProgressTracker, QueryProgress};
use chquery::query::{CompileRequest, FeatureSet, QueryEngine, QueryOptions};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Replays canned result sets and records every statement it receives.
#[derive(Default)]
struct ScriptedExecutor {
    results: Mutex<VecDeque<Vec<Row>>>,
    statements: Arc<Mutex<Vec<String>>>,
    delay: Option<Duration>,
}

impl ScriptedExecutor {
    fn returning(results: Vec<Vec<Value>>) -> Self {
        let results = results
            .into_iter()
            .map(|rows| {
                rows.into_iter()
                    .map(|row| row.as_object().cloned().expect("rows are objects"))
                    .collect()
            })
            .collect();
        Self {
            results: Mutex::new(results),
            ..Self::default()
        }
    }
}

#[async_trait]
impl QueryExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        _query_id: &str,
        sql: &str,
        progress: ProgressReporter,
    ) -> anyhow::Result<Vec<Row>> {
        self.statements.lock().push(sql.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        progress.report(QueryProgress {
            read_rows: 10,
            read_bytes: 80,
            total_rows_to_read: 10,
            elapsed_ms: 1,
        })?;
        Ok(self.results.lock().pop_front().unwrap_or_default())
    }
}

fn engine() -> QueryEngine {
    QueryEngine::new(
        Arc::new(AppConfig::default()),
        Arc::new(FeatureSet::default()),
    )
}

fn runner(executor: ScriptedExecutor, tracker: ProgressTracker) -> QueryRunner<ScriptedExecutor> {
    QueryRunner::new(engine(), executor, tracker, Duration::from_millis(200))
}

fn request(panel_type: PanelType, query: BuilderQuery) -> CompileRequest {
    CompileRequest {
        start: 1680066360726210000,
        end: 1680066458000000000,
        panel_type,
        query,
        options: QueryOptions::default(),
        cursor: None,
    }
}

fn grouped_count() -> BuilderQuery {
    let mut query = BuilderQuery::new(DataSource::Logs, AggregateOperator::Count);
    query.group_by = vec![AttributeKey::new(
        "method",
        DataType::String,
        AttributeKeyType::Tag,
    )];
    query.limit = 2;
    query
}

#[tokio::test]
async fn limited_graph_runs_two_passes() {
    let executor = ScriptedExecutor::returning(vec![
        vec![json!({"method": "GET"}), json!({"method": "POST"})],
        vec![json!({"method": "GET", "ts": "2023-03-29 05:06:00", "value": 4.0})],
    ]);
    let statements = Arc::clone(&executor.statements);
    let tracker = ProgressTracker::default();
    let runner = runner(executor, tracker.clone());

    let rows = runner
        .run("q-top-n", &request(PanelType::Graph, grouped_count()))
        .await
        .unwrap();

    assert_eq!(rows.len(), 1);
    let statements = statements.lock();
    assert_eq!(statements.len(), 2);
    assert!(statements[0].ends_with(") LIMIT 2"), "{}", statements[0]);
    assert!(
        statements[1].contains("(`method`) GLOBAL IN (('GET'),('POST'))"),
        "{}",
        statements[1]
    );
    assert!(!tracker.is_tracking("q-top-n"));
}

#[tokio::test]
async fn empty_ranking_skips_second_pass() {
    let executor = ScriptedExecutor::returning(vec![Vec::new()]);
    let statements = Arc::clone(&executor.statements);
    let runner = runner(executor, ProgressTracker::default());

    let rows = runner
        .run("q-empty", &request(PanelType::Graph, grouped_count()))
        .await
        .unwrap();

    assert!(rows.is_empty());
    assert_eq!(statements.lock().len(), 1);
}

#[tokio::test]
async fn table_panels_run_once() {
    let executor = ScriptedExecutor::returning(vec![vec![json!({"method": "GET", "value": 9})]]);
    let statements = Arc::clone(&executor.statements);
    let runner = runner(executor, ProgressTracker::default());

    runner
        .run("q-table", &request(PanelType::Table, grouped_count()))
        .await
        .unwrap();

    let statements = statements.lock();
    assert_eq!(statements.len(), 1);
    assert!(!statements[0].contains("#LIMIT_PLACEHOLDER"));
}

#[tokio::test]
async fn value_panel_rejects_many_rows() {
    let executor = ScriptedExecutor::returning(vec![vec![json!({"value": 1}), json!({"value": 2})]]);
    let runner = runner(executor, ProgressTracker::default());
    let query = BuilderQuery::new(DataSource::Logs, AggregateOperator::Count);

    let err = runner
        .run("q-value", &request(PanelType::Value, query))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidRequest(_)), "{err}");
}

#[tokio::test]
async fn slow_store_times_out_and_stops_tracking() {
    let executor = ScriptedExecutor {
        delay: Some(Duration::from_secs(5)),
        ..ScriptedExecutor::default()
    };
    let tracker = ProgressTracker::default();
    let runner = QueryRunner::new(engine(), executor, tracker.clone(), Duration::from_millis(20));
    let query = BuilderQuery::new(DataSource::Logs, AggregateOperator::Count);

    let err = runner
        .run("q-slow", &request(PanelType::Table, query))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "timeout: query q-slow timed out");
    assert!(!tracker.is_tracking("q-slow"));
}

#[tokio::test]
async fn duplicate_query_id_is_rejected() {
    let tracker = ProgressTracker::default();
    let _running = tracker.report_query_started("q-dup").unwrap();
    let runner = runner(ScriptedExecutor::default(), tracker.clone());
    let query = BuilderQuery::new(DataSource::Logs, AggregateOperator::Count);

    let err = runner
        .run("q-dup", &request(PanelType::Table, query))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::AlreadyExists(_)));
}
