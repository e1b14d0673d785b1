use std::sync::Arc;
use tokio::sync::watch;

use crate::models::Task;

// Values are swapped whole: readers see the previous task or the next one.
pub struct TaskPublisher {
    current: watch::Sender<Option<Arc<Task>>>,
}

impl Default for TaskPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskPublisher {
    pub fn new() -> Self {
        let (current, _) = watch::channel(None);
        Self { current }
    }

    pub fn current(&self) -> Option<Arc<Task>> {
        self.current.borrow().clone()
    }

    pub fn publish(&self, task: Task) {
        self.current.send_replace(Some(Arc::new(task)));
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Task>>> {
        self.current.subscribe()
    }
}
