use std::collections::BTreeMap;
use std::sync::Arc;

use crate::evaluator::Evaluator;
use crate::invalidation::InvalidationListener;

#[derive(Clone)]
pub struct AppState {
    pub evaluator: Arc<Evaluator>,
    /// One listener per subscribed environment.
    pub listeners: Arc<BTreeMap<String, Arc<InvalidationListener>>>,
}

impl AppState {
    pub fn new(evaluator: Arc<Evaluator>) -> Self {
        Self {
            evaluator,
            listeners: Arc::new(BTreeMap::new()),
        }
    }

    pub fn with_listeners(mut self, listeners: BTreeMap<String, Arc<InvalidationListener>>) -> Self {
        self.listeners = Arc::new(listeners);
        self
    }
}
