//! Resource sampling for worker processes.

use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};

#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    pub max_memory_bytes: Option<u64>,
    pub max_cpu_ms: Option<u64>,
    pub interval: Duration,
}

impl ResourceLimits {
    pub fn is_unbounded(&self) -> bool {
        self.max_memory_bytes.is_none() && self.max_cpu_ms.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitExceeded {
    Memory { used: u64, limit: u64 },
    CpuTime { used_ms: u64, limit_ms: u64 },
}

impl std::fmt::Display for LimitExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitExceeded::Memory { used, limit } => {
                write!(f, "memory limit exceeded: {} bytes resident, limit {}", used, limit)
            }
            LimitExceeded::CpuTime { used_ms, limit_ms } => {
                write!(f, "cpu time limit exceeded: {}ms used, limit {}ms", used_ms, limit_ms)
            }
        }
    }
}

/// Polls one process and resolves once it crosses a limit. Never resolves
/// for an unbounded limit set or a process that has already exited.
pub struct ResourceMonitor {
    pid: Pid,
    limits: ResourceLimits,
    system: System,
    cpu_ms: f64,
}

impl ResourceMonitor {
    pub fn new(pid: u32, limits: ResourceLimits) -> Self {
        Self {
            pid: Pid::from_u32(pid),
            limits,
            system: System::new(),
            cpu_ms: 0.0,
        }
    }

    pub async fn exceeded(mut self) -> LimitExceeded {
        if self.limits.is_unbounded() {
            return std::future::pending().await;
        }

        let mut ticker = tokio::time::interval(self.limits.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Some(exceeded) = self.sample() {
                return exceeded;
            }
        }
    }

    fn sample(&mut self) -> Option<LimitExceeded> {
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        let process = self.system.process(self.pid)?;

        // cpu_usage is a percentage of one core over the last refresh window
        let window_ms = self.limits.interval.as_millis() as f64;
        self.cpu_ms += f64::from(process.cpu_usage()) / 100.0 * window_ms;

        check(self.limits, process.memory(), self.cpu_ms as u64)
    }
}

fn check(limits: ResourceLimits, memory: u64, cpu_ms: u64) -> Option<LimitExceeded> {
    if let Some(limit) = limits.max_memory_bytes {
        if memory > limit {
            return Some(LimitExceeded::Memory { used: memory, limit });
        }
    }
    if let Some(limit_ms) = limits.max_cpu_ms {
        if cpu_ms > limit_ms {
            return Some(LimitExceeded::CpuTime { used_ms: cpu_ms, limit_ms });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(memory: Option<u64>, cpu: Option<u64>) -> ResourceLimits {
        ResourceLimits {
            max_memory_bytes: memory,
            max_cpu_ms: cpu,
            interval: Duration::from_millis(10),
        }
    }

    #[test]
    fn memory_ceiling() {
        let l = limits(Some(1000), None);
        assert_eq!(check(l, 500, 10_000), None);
        assert_eq!(check(l, 1001, 0), Some(LimitExceeded::Memory { used: 1001, limit: 1000 }));
    }

    #[test]
    fn cpu_ceiling() {
        let l = limits(None, Some(100));
        assert_eq!(check(l, u64::MAX, 100), None);
        assert!(matches!(check(l, 0, 101), Some(LimitExceeded::CpuTime { .. })));
    }

    #[tokio::test]
    async fn own_process_exceeds_a_tiny_memory_limit() {
        let monitor = ResourceMonitor::new(std::process::id(), limits(Some(1), None));
        let exceeded = tokio::time::timeout(Duration::from_secs(5), monitor.exceeded())
            .await
            .unwrap();
        assert!(matches!(exceeded, LimitExceeded::Memory { .. }));
    }
}
