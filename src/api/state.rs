use std::sync::Arc;

use crate::scheduler::Dispatcher;
use crate::storage::ActivityStore;

#[derive(Clone)]
pub struct AppState {
    pub store: ActivityStore,
    pub dispatcher: Arc<Dispatcher>,
}
