//! Builder query compilation.
//!
//! The compiler is a set of pure functions: the same request always yields
//! the same SQL and nothing here holds shared state.

pub mod aggregate;
pub mod assemble;
pub mod filter;
pub mod format;
pub mod json;
pub mod logs;
pub mod metrics;
pub mod resolve;
pub mod tier;
pub mod traces;

use crate::{
    config::AppConfig,
    error::{Result, ServiceError},
    models::{BuilderQuery, DataSource, PanelType},
    pagination,
};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr, PickFirst};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Text rendered in place of an unbound Top-N group list.
pub const LIMIT_PLACEHOLDER: &str = "#LIMIT_PLACEHOLDER";

/// Feature flag that switches rates from per-second to per-minute.
pub const PREFER_RPM_FEATURE: &str = "PreferRPM";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Sql(String),
    TopNGroups,
}

/// Compiled statement, possibly still waiting for the Top-N group list of a
/// first pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledQuery {
    segments: Vec<Segment>,
}

impl CompiledQuery {
    pub fn new(sql: String) -> Self {
        Self {
            segments: vec![Segment::Sql(sql)],
        }
    }

    pub(crate) fn with_top_n(before: String, after: String) -> Self {
        Self {
            segments: vec![
                Segment::Sql(before),
                Segment::TopNGroups,
                Segment::Sql(after),
            ],
        }
    }

    pub(crate) fn wrap(mut self, prefix: String, suffix: String) -> Self {
        self.segments.insert(0, Segment::Sql(prefix));
        self.segments.push(Segment::Sql(suffix));
        self
    }

    pub fn requires_top_n_groups(&self) -> bool {
        self.segments.contains(&Segment::TopNGroups)
    }

    /// Substitutes the group list (a subquery or literal tuples) for the
    /// Top-N marker.
    pub fn bind_top_n(&self, groups: &str) -> String {
        self.segments
            .iter()
            .map(|segment| match segment {
                Segment::Sql(sql) => sql.as_str(),
                Segment::TopNGroups => groups,
            })
            .collect()
    }

    /// Final SQL; fails if a Top-N marker was never bound.
    pub fn into_sql(self) -> Result<String> {
        if self.requires_top_n_groups() {
            return Err(ServiceError::Internal(anyhow::anyhow!(
                "top-n group list was not bound before execution"
            )));
        }
        Ok(self.bind_top_n(""))
    }
}

impl fmt::Display for CompiledQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.bind_top_n(LIMIT_PLACEHOLDER))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphLimitPass {
    #[default]
    None,
    First,
    Second,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueryOptions {
    #[serde(default, rename = "graphLimitQtype")]
    pub graph_limit: GraphLimitPass,
    #[serde(default, rename = "preferRPM")]
    pub prefer_rpm: bool,
    #[serde(default, rename = "isLivetailQuery")]
    pub is_live_tail: bool,
}

/// Feature flag lookup. An error means the feature is disabled.
pub trait FeatureLookup: Send + Sync {
    fn check_feature(&self, name: &str) -> anyhow::Result<()>;
}

impl<F> FeatureLookup for F
where
    F: Fn(&str) -> anyhow::Result<()> + Send + Sync,
{
    fn check_feature(&self, name: &str) -> anyhow::Result<()> {
        self(name)
    }
}

/// Static set of enabled flags, loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct FeatureSet {
    enabled: HashSet<String>,
}

impl FeatureSet {
    pub fn new<I, S>(flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            enabled: flags.into_iter().map(Into::into).collect(),
        }
    }
}

impl FeatureLookup for FeatureSet {
    fn check_feature(&self, name: &str) -> anyhow::Result<()> {
        if self.enabled.contains(name) {
            Ok(())
        } else {
            anyhow::bail!("feature {name} is not enabled")
        }
    }
}

fn feature_enabled(features: &dyn FeatureLookup, name: &str) -> bool {
    features.check_feature(name).is_ok()
}

/// Normalizes an epoch in s/ms/µs/ns to nanoseconds.
pub fn epoch_nanos(epoch: i64) -> i64 {
    let digits = if epoch == 0 {
        1
    } else {
        epoch.unsigned_abs().to_string().len() as u32
    };
    if digits >= 19 {
        epoch
    } else {
        epoch.saturating_mul(10_i64.pow(19 - digits))
    }
}

pub fn epoch_millis(epoch: i64) -> i64 {
    epoch_nanos(epoch) / 1_000_000
}

pub fn compile_logs_query(
    start: i64,
    end: i64,
    panel: PanelType,
    query: &BuilderQuery,
    options: &QueryOptions,
) -> Result<CompiledQuery> {
    logs::compile(start, end, panel, query, options)
}

pub fn compile_traces_query(
    start: i64,
    end: i64,
    panel: PanelType,
    query: &BuilderQuery,
    options: &QueryOptions,
) -> Result<CompiledQuery> {
    traces::compile(start, end, panel, query, options)
}

pub fn compile_metrics_query(
    start: i64,
    end: i64,
    panel: PanelType,
    query: &BuilderQuery,
    features: &dyn FeatureLookup,
) -> Result<CompiledQuery> {
    let prefer_rpm = feature_enabled(features, PREFER_RPM_FEATURE);
    metrics::compile(start, end, panel, query, prefer_rpm)
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileRequest {
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub start: i64,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub end: i64,
    pub panel_type: PanelType,
    pub query: BuilderQuery,
    #[serde(default)]
    pub options: QueryOptions,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileResponse {
    pub query_name: String,
    pub sql: String,
    pub requires_top_n_groups: bool,
}

/// Dispatches requests to the per-signal compilers.
#[derive(Clone)]
pub struct QueryEngine {
    config: Arc<AppConfig>,
    features: Arc<dyn FeatureLookup>,
}

impl QueryEngine {
    pub fn new(config: Arc<AppConfig>, features: Arc<dyn FeatureLookup>) -> Self {
        Self { config, features }
    }

    pub fn compile(&self, request: &CompileRequest) -> Result<CompiledQuery> {
        if request.start > request.end {
            return Err(ServiceError::invalid(format!(
                "start {} is after end {}",
                request.start, request.end
            )));
        }

        let mut query = request.query.clone();
        if let Some(cursor) = &request.cursor {
            if request.panel_type != PanelType::List {
                return Err(ServiceError::invalid("cursor is only valid for list panels"));
            }
            pagination::apply_list_cursor(&mut query, &pagination::decode_cursor(cursor)?)?;
        }
        if request.panel_type == PanelType::List && query.page_size == 0 && query.limit == 0 {
            query.limit = self.config.default_list_limit;
        }

        let mut options = request.options;
        if feature_enabled(self.features.as_ref(), PREFER_RPM_FEATURE) {
            options.prefer_rpm = true;
        }

        let compiled = match query.data_source {
            DataSource::Logs => {
                compile_logs_query(request.start, request.end, request.panel_type, &query, &options)
            }
            DataSource::Traces => compile_traces_query(
                request.start,
                request.end,
                request.panel_type,
                &query,
                &options,
            ),
            DataSource::Metrics => compile_metrics_query(
                request.start,
                request.end,
                request.panel_type,
                &query,
                self.features.as_ref(),
            ),
        }?;

        debug!(
            query_name = %query.query_name,
            data_source = ?query.data_source,
            panel = ?request.panel_type,
            sql = %compiled,
            "compiled builder query"
        );
        Ok(compiled)
    }

    pub fn compile_response(&self, request: &CompileRequest) -> Result<CompileResponse> {
        let compiled = self.compile(request)?;
        Ok(CompileResponse {
            query_name: request.query.query_name.clone(),
            requires_top_n_groups: compiled.requires_top_n_groups(),
            sql: compiled.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_epochs() {
        assert_eq!(epoch_nanos(1680066360726), 1680066360726000000);
        assert_eq!(epoch_nanos(1680066360726210000), 1680066360726210000);
        assert_eq!(epoch_nanos(1680066360), 1680066360000000000);
        assert_eq!(epoch_nanos(0), 0);
        assert_eq!(epoch_millis(1680066360726210000), 1680066360726);
    }

    #[test]
    fn placeholder_is_typed() {
        let query = CompiledQuery::with_top_n("a IN (".into(), ") b".into());
        assert!(query.requires_top_n_groups());
        assert_eq!(query.to_string(), "a IN (#LIMIT_PLACEHOLDER) b");
        assert_eq!(query.bind_top_n("('GET')"), "a IN (('GET')) b");
        assert!(query.clone().into_sql().is_err());

        let wrapped = query.wrap("SELECT * FROM (".into(), ")".into());
        assert_eq!(wrapped.to_string(), "SELECT * FROM (a IN (#LIMIT_PLACEHOLDER) b)");
    }

    #[test]
    fn plain_query_into_sql() {
        let query = CompiledQuery::new("SELECT 1".into());
        assert!(!query.requires_top_n_groups());
        assert_eq!(query.into_sql().unwrap(), "SELECT 1");
    }

    #[test]
    fn feature_errors_mean_disabled() {
        let lookup = |_: &str| -> anyhow::Result<()> { anyhow::bail!("flag store unavailable") };
        assert!(!feature_enabled(&lookup, PREFER_RPM_FEATURE));
        let set = FeatureSet::new([PREFER_RPM_FEATURE]);
        assert!(feature_enabled(&set, PREFER_RPM_FEATURE));
    }
}
