use std::sync::Arc;

use crate::application::coordinator::LeaseCoordinator;

#[derive(Clone)]
pub struct CoordinatorState {
    pub coordinator: Arc<LeaseCoordinator>,
    /// Bearer token required on `/render-jobs` routes; `None` leaves them open.
    pub auth_token: Option<Arc<str>>,
}

impl CoordinatorState {
    pub fn new(coordinator: Arc<LeaseCoordinator>) -> Self {
        Self {
            coordinator,
            auth_token: None,
        }
    }

    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token.filter(|t| !t.is_empty()).map(Arc::from);
        self
    }
}
