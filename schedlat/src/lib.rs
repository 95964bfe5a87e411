pub mod collector;
#[cfg(feature = "k8s")]
pub mod k8s;
pub mod probes;
pub mod settings;
pub mod tables;
pub mod telemetry;

use anyhow::{Context, Result};
use aya::Ebpf;
use log::{info, warn};
use tokio::{signal, task::JoinHandle};

use crate::{
    collector::{BpfAggregates, Collector},
    probes::{Probe, cpu_schedule_latency::CpuScheduleLatencyProbe, request_shutdown},
    settings::Settings,
};

pub struct SchedLatEngine {
    pub settings: Settings,
    bpf: Ebpf,
}

impl SchedLatEngine {
    pub fn new(settings: Settings, bytecode: &[u8]) -> Result<Self> {
        bump_memlock_rlimit()?;
        match procfs::sys::kernel::Version::current() {
            Ok(v) => info!("Kernel {}.{}.{}", v.major, v.minor, v.patch),
            Err(e) => warn!("Failed to read kernel version: {}", e),
        }
        let bpf = Ebpf::load(bytecode).context("Failed to load eBPF object")?;
        Ok(Self { settings, bpf })
    }

    pub async fn run(mut self) -> Result<()> {
        telemetry::init_metrics(self.settings.node_name.as_deref())?;

        CpuScheduleLatencyProbe {
            config: self.settings.to_probe_config(),
        }
        .attach(&mut self.bpf)?;

        let collector = self.start_collector().await?;

        info!("Monitoring active. Press Ctrl-C to exit.");
        signal::ctrl_c().await?;
        info!("Exiting...");

        request_shutdown();
        if let Some(handle) = collector {
            handle.abort();
        }
        telemetry::shutdown_metrics();

        Ok(())
    }

    async fn start_collector(&mut self) -> Result<Option<JoinHandle<()>>> {
        if !self.settings.collector_enabled() {
            info!("Collector disabled; output maps are left for external readers");
            return Ok(None);
        }

        let aggregates = BpfAggregates::from_ebpf(&mut self.bpf)?;
        let collector = Collector::new(
            aggregates,
            self.settings.collector_interval(),
            self.settings.collector_window(),
        );
        let collector = self.with_container_index(collector).await;

        Ok(Some(tokio::spawn(collector.run())))
    }

    #[cfg(feature = "k8s")]
    async fn with_container_index(
        &self,
        collector: Collector<BpfAggregates>,
    ) -> Collector<BpfAggregates> {
        let Some(node_name) = self.settings.node_name.clone() else {
            return collector;
        };

        let index = std::sync::Arc::new(k8s::ContainerIndex::new(self.settings.cgroup_driver()));
        match index.start_watcher(node_name).await {
            Ok(_) => collector.with_containers(index),
            Err(e) => {
                warn!("Container index unavailable, reporting all cgroups: {:#}", e);
                collector
            }
        }
    }

    #[cfg(not(feature = "k8s"))]
    async fn with_container_index(
        &self,
        collector: Collector<BpfAggregates>,
    ) -> Collector<BpfAggregates> {
        collector
    }
}

fn bump_memlock_rlimit() -> Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        warn!("Failed to increase rlimit");
    }
    Ok(())
}
