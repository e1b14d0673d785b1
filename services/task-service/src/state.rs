use std::sync::Arc;

use crate::publisher::TaskPublisher;
use crate::rotation::RotationState;

#[derive(Clone)]
pub struct AppState {
    pub publisher: Arc<TaskPublisher>,
    pub rotation: Arc<RotationState>,
}
