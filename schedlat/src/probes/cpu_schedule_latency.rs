//! Per-cgroup CPU scheduling latency probe.
//!
//! Wakeup events stamp the moment a task becomes runnable and `sched_switch`
//! turns that stamp into a latency sample summed per cgroup in
//! `OUTPUT_CGROUP_DELAY` / `OUTPUT_CGROUP_COUNTER`. The kernel structure
//! offsets the handlers need are written to `SCHEDLAT_CONFIG` before any
//! program is attached.

use anyhow::{Context, Result, bail};
use aya::{Ebpf, maps::Array};
use log::{info, warn};
use schedlat_common::ProbeConfig;

use crate::probes::{Probe, TracepointConfig, attach_tracepoint};
use crate::telemetry;

pub const CONFIG_MAP: &str = "SCHEDLAT_CONFIG";

const WAKEUP_TRACEPOINTS: [TracepointConfig<'static>; 2] = [
    TracepointConfig {
        program_name: "handle_sched_wakeup",
        category: "sched",
        name: "sched_wakeup",
    },
    TracepointConfig {
        program_name: "handle_sched_wakeup_new",
        category: "sched",
        name: "sched_wakeup_new",
    },
];

const SWITCH_TRACEPOINT: TracepointConfig<'static> = TracepointConfig {
    program_name: "handle_sched_switch",
    category: "sched",
    name: "sched_switch",
};

pub struct CpuScheduleLatencyProbe {
    pub config: ProbeConfig,
}

impl CpuScheduleLatencyProbe {
    fn write_config(&self, bpf: &mut Ebpf) -> Result<()> {
        let mut config: Array<_, ProbeConfig> = Array::try_from(
            bpf.map_mut(CONFIG_MAP)
                .with_context(|| format!("Failed to get {} map", CONFIG_MAP))?,
        )?;
        config
            .set(0, self.config, 0)
            .context("Failed to write probe config")?;
        Ok(())
    }
}

impl Probe for CpuScheduleLatencyProbe {
    fn attach(&self, bpf: &mut Ebpf) -> Result<()> {
        if !self.config.layout.is_configured() {
            warn!(
                "Kernel task layout not configured (set KERNEL__TASK_CGROUPS_OFFSET); \
                 every sched_switch will be dropped"
            );
        }
        self.write_config(bpf)?;

        let mut attached = 0;
        for tracepoint in WAKEUP_TRACEPOINTS {
            if attach_tracepoint(bpf, tracepoint)? {
                attached += 1;
            }
        }
        if attached == 0 {
            warn!("No wakeup tracepoint attached; only preempted tasks will be sampled");
        }

        if !attach_tracepoint(bpf, SWITCH_TRACEPOINT)? {
            bail!("sched:sched_switch is required but not available");
        }
        attached += 1;

        info!("CPU schedule latency probe attached ({} programs)", attached);
        telemetry::record_active_probe("cpu_schedule_latency", attached);
        Ok(())
    }
}
