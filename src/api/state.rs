use std::sync::Arc;

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::observability::Metrics;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub dispatcher: Arc<Dispatcher>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(config: Config, dispatcher: Dispatcher, metrics: Arc<Metrics>) -> Self {
        Self {
            config: Arc::new(config),
            dispatcher: Arc::new(dispatcher),
            metrics,
        }
    }
}
