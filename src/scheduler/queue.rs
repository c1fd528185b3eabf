//! Queue observability

use serde::{Deserialize, Serialize};

/// Snapshot of the scheduler's queues at a point in time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub waiting_streams: usize,
    pub running_streams: usize,
}

impl SchedulerStats {
    /// Streams the scheduler is still responsible for
    pub fn active_streams(&self) -> usize {
        self.waiting_streams + self.running_streams
    }

    pub fn is_idle(&self) -> bool {
        self.active_streams() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_stats() {
        let stats = SchedulerStats {
            waiting_streams: 0,
            running_streams: 0,
        };
        assert!(stats.is_idle());
        assert_eq!(stats.active_streams(), 0);
    }

    #[test]
    fn test_active_stats() {
        let stats = SchedulerStats {
            waiting_streams: 2,
            running_streams: 3,
        };
        assert!(!stats.is_idle());
        assert_eq!(stats.active_streams(), 5);
    }
}
