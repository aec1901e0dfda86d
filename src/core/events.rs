use crate::core::task::TaskStatus;
use tokio::sync::broadcast;

/// Notifications published by the scheduler on task state changes.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    TaskStateChanged {
        task_id: u64,
        from: TaskStatus,
        to: TaskStatus,
    },
}

/// Broadcast bus connecting the scheduler to interested listeners.
///
/// Publishing never blocks; events sent with no subscriber are dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SchedulerEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    pub fn publish(&self, event: SchedulerEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
