// ABOUTME: System probes and pluggable resource monitors for the resource governor.
// ABOUTME: The default probe reads CPU and memory through sysinfo.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::System;

/// One reading of host CPU and memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SystemSnapshot {
    pub cpu_percent: f64,
    pub memory_total: u64,
    pub memory_used: u64,
    pub memory_available: u64,
    pub memory_percent: f64,
}

/// Source of [`SystemSnapshot`]s.
pub trait SystemProbe: Send + Sync {
    fn sample(&self) -> anyhow::Result<SystemSnapshot>;
}

/// Reads the host through `sysinfo`.
///
/// CPU usage is measured between consecutive samples, so the first reading
/// after construction may be zero.
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProbe for SysinfoProbe {
    fn sample(&self) -> anyhow::Result<SystemSnapshot> {
        let mut system = self.system.lock();
        system.refresh_cpu_usage();
        system.refresh_memory();

        let total = system.total_memory();
        let used = system.used_memory();
        Ok(SystemSnapshot {
            cpu_percent: f64::from(system.global_cpu_usage()),
            memory_total: total,
            memory_used: used,
            memory_available: system.available_memory(),
            memory_percent: if total > 0 {
                used as f64 / total as f64 * 100.0
            } else {
                0.0
            },
        })
    }
}

/// A probe that always reports the same snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticProbe(pub SystemSnapshot);

impl StaticProbe {
    pub fn new(cpu_percent: f64, memory_percent: f64) -> Self {
        Self(SystemSnapshot {
            cpu_percent,
            memory_percent,
            ..Default::default()
        })
    }
}

impl SystemProbe for StaticProbe {
    fn sample(&self) -> anyhow::Result<SystemSnapshot> {
        Ok(self.0)
    }
}

/// Inputs available to a monitor.
#[derive(Debug, Clone, Copy)]
pub struct MonitorContext<'a> {
    pub system: &'a SystemSnapshot,
    /// Tracked tasks per status name.
    pub status_counts: &'a HashMap<String, usize>,
}

/// A named measurement taken on every sample.
pub trait ResourceMonitor: Send + Sync {
    fn measure(&self, ctx: &MonitorContext<'_>) -> anyhow::Result<serde_json::Value>;
}

impl<F> ResourceMonitor for F
where
    F: Fn(&MonitorContext<'_>) -> anyhow::Result<serde_json::Value> + Send + Sync,
{
    fn measure(&self, ctx: &MonitorContext<'_>) -> anyhow::Result<serde_json::Value> {
        self(ctx)
    }
}

pub struct CpuUsageMonitor;

impl ResourceMonitor for CpuUsageMonitor {
    fn measure(&self, ctx: &MonitorContext<'_>) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::json!(ctx.system.cpu_percent))
    }
}

pub struct MemoryUsageMonitor;

impl ResourceMonitor for MemoryUsageMonitor {
    fn measure(&self, ctx: &MonitorContext<'_>) -> anyhow::Result<serde_json::Value> {
        let s = ctx.system;
        Ok(serde_json::json!({
            "total": s.memory_total,
            "used": s.memory_used,
            "available": s.memory_available,
            "percent": s.memory_percent,
        }))
    }
}

pub struct TaskCountMonitor;

impl ResourceMonitor for TaskCountMonitor {
    fn measure(&self, ctx: &MonitorContext<'_>) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::to_value(ctx.status_counts)?)
    }
}

/// Monitors every governor starts with.
pub fn default_monitors() -> Vec<(&'static str, Arc<dyn ResourceMonitor>)> {
    vec![
        ("cpu_usage", Arc::new(CpuUsageMonitor) as Arc<dyn ResourceMonitor>),
        ("memory_usage", Arc::new(MemoryUsageMonitor) as Arc<dyn ResourceMonitor>),
        ("task_count", Arc::new(TaskCountMonitor) as Arc<dyn ResourceMonitor>),
    ]
}
