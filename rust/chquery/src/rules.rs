//! Alert rule support: the evaluator contract and the planner that turns a
//! rule's builder queries into SQL for one evaluation tick.

use crate::error::Result;
use crate::models::{BuilderQuery, PanelType};
use crate::query::{CompileRequest, CompiledQuery, QueryEngine, QueryOptions};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tracing::debug;

/// Upper bound on points per series in one evaluation.
pub const MAX_POINTS_PER_SERIES: i64 = 300;

const MINUTE_MS: i64 = 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    Inactive,
    Pending,
    Firing,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub labels: BTreeMap<String, String>,
    pub value: f64,
    pub timestamp_ms: i64,
}

#[async_trait]
pub trait RuleEvaluator: Send + Sync {
    async fn eval(&self, ts: DateTime<Utc>) -> anyhow::Result<Vec<Sample>>;

    fn state(&self) -> AlertState;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalRange {
    pub start: i64,
    pub end: i64,
}

/// Window ending at `ts`, shifted back by `eval_delay`, with both ends
/// floored to the minute so a partially written minute is never read.
pub fn prepare_query_range(ts: DateTime<Utc>, eval_window: Duration, eval_delay: Duration) -> EvalRange {
    let window = i64::try_from(eval_window.as_millis()).unwrap_or(i64::MAX);
    let delay = i64::try_from(eval_delay.as_millis()).unwrap_or(i64::MAX);
    let end = ts.timestamp_millis().saturating_sub(delay);
    let start = end.saturating_sub(window);
    EvalRange {
        start: start - start.rem_euclid(MINUTE_MS),
        end: end - end.rem_euclid(MINUTE_MS),
    }
}

/// Smallest step (seconds) that keeps `[start, end]` (epoch ms) within
/// [`MAX_POINTS_PER_SERIES`].
pub fn min_allowed_step(start: i64, end: i64) -> i64 {
    let step = (end - start) / MAX_POINTS_PER_SERIES / 1000;
    if step < 60 {
        step
    } else {
        step - step % 60
    }
}

/// Replaces characters outside `[a-zA-Z0-9_]` with `_` and prefixes `_` when
/// the name would start with anything but a letter or underscore.
pub fn normalize_label_name(name: &str) -> String {
    let normalized: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    match normalized.chars().next() {
        Some(first) if !first.is_ascii_alphabetic() && first != '_' => format!("_{normalized}"),
        _ => normalized,
    }
}

/// Stable key for one alert instance; insertion order of labels is
/// irrelevant.
pub fn label_set_fingerprint(labels: &BTreeMap<String, String>) -> u64 {
    let mut hasher = DefaultHasher::new();
    for (name, value) in labels {
        name.hash(&mut hasher);
        value.hash(&mut hasher);
    }
    hasher.finish()
}

#[derive(Debug, Clone)]
pub struct RuleQuery {
    pub name: String,
    pub range: EvalRange,
    pub query: CompiledQuery,
}

pub struct RuleQueryPlanner {
    engine: QueryEngine,
    eval_window: Duration,
    eval_delay: Duration,
}

impl RuleQueryPlanner {
    pub fn new(engine: QueryEngine, eval_window: Duration, eval_delay: Duration) -> Self {
        Self {
            engine,
            eval_window,
            eval_delay,
        }
    }

    /// Compiles every enabled query of a rule for the tick at `ts`. Rule
    /// queries always render as graphs.
    pub fn plan(
        &self,
        ts: DateTime<Utc>,
        queries: &BTreeMap<String, BuilderQuery>,
    ) -> Result<Vec<RuleQuery>> {
        let range = prepare_query_range(ts, self.eval_window, self.eval_delay);
        let step = min_allowed_step(range.start, range.end).max(60);

        let mut planned = Vec::new();
        for (name, query) in queries {
            if query.disabled {
                continue;
            }
            let mut query = query.clone();
            query.step_interval = query.step_interval.max(step);
            let request = CompileRequest {
                start: range.start,
                end: range.end,
                panel_type: PanelType::Graph,
                query,
                options: QueryOptions::default(),
                cursor: None,
            };
            let compiled = self
                .engine
                .compile(&request)
                .map_err(|err| err.context(&format!("rule query {name}")))?;
            debug!(rule_query = %name, start = range.start, end = range.end, "planned rule query");
            planned.push(RuleQuery {
                name: name.clone(),
                range,
                query: compiled,
            });
        }
        Ok(planned)
    }
}
