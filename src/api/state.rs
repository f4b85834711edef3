use std::sync::Arc;

use tokio::sync::mpsc;

use crate::pipeline::{BehaviorEvent, Ueba};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Ueba>,
    pub events_tx: mpsc::Sender<BehaviorEvent>,
}
