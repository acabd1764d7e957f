//! Tokio integration: drive `Device::poll` from a task.
//!
//! The device sits behind a mutex, so the task never overlaps with other
//! calls into the same device. Each tick polls with a zero timeout; the
//! task itself provides the waiting.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::device::Device;

/// A running poll loop. Dropping it cancels the loop.
#[derive(Debug)]
pub struct PollTask {
    handle: JoinHandle<()>,
}

impl PollTask {
    /// Poll `device` every `period` on the current tokio runtime.
    pub fn spawn(device: Arc<Mutex<Device>>, period: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let result = device.lock().poll(Duration::ZERO);
                if let Err(e) = result {
                    tracing::warn!(error = %e, "poll failed");
                }
            }
        });
        Self { handle }
    }

    pub fn stop(self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for PollTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::LoopbackBus;

    #[tokio::test]
    async fn test_tasks_discover_each_other() {
        let bus = LoopbackBus::new();
        let a = Arc::new(Mutex::new(Device::new("a", bus.endpoint()).unwrap()));
        let b = Arc::new(Mutex::new(Device::new("b", bus.endpoint()).unwrap()));
        let ta = PollTask::spawn(a.clone(), Duration::from_millis(5));
        let tb = PollTask::spawn(b.clone(), Duration::from_millis(5));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(a.lock().graph().device_by_name("b.1").is_some());
        assert!(b.lock().graph().device_by_name("a.1").is_some());

        ta.stop();
        tb.stop();
    }
}
