use crate::{
    config::AppConfig,
    executor::{QueryExecutor, QueryRunner},
    progress::ProgressTracker,
    query::QueryEngine,
    single_flight::{ConfigPushCoordinator, ConfigPusher},
};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub query: QueryEngine,
    pub progress: ProgressTracker,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, query: QueryEngine, progress: ProgressTracker) -> Self {
        Self {
            config,
            query,
            progress,
        }
    }

    /// Runner sharing this service's compiler and progress registry.
    pub fn query_runner<E: QueryExecutor>(&self, executor: E) -> QueryRunner<E> {
        QueryRunner::new(
            self.query.clone(),
            executor,
            self.progress.clone(),
            self.config.request_timeout,
        )
    }

    pub fn push_coordinator<P: ConfigPusher>(&self, pusher: P) -> ConfigPushCoordinator<P> {
        ConfigPushCoordinator::new(pusher, self.config.config_push_timeout)
    }
}
