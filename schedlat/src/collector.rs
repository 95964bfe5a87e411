//! Periodic reader for the per-cgroup output tables.
//!
//! Each window starts by clearing both tables, lets the probe accumulate for
//! `window`, then reads the sums and counts back and turns them into average
//! latencies. The tables are read without any coordination with the writers,
//! so a window can include a few samples from its edges.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use anyhow::{Context, Result};
use aya::{
    Ebpf,
    maps::{HashMap as BpfHashMap, MapData},
};
use log::{debug, info, warn};
use schedlat_common::CgroupName;
use serde::Serialize;
use tokio::time::{self, MissedTickBehavior};

use crate::{probes::shutdown_flag, tables::LatencyTables, telemetry};

pub const DELAY_MAP: &str = "OUTPUT_CGROUP_DELAY";
pub const COUNTER_MAP: &str = "OUTPUT_CGROUP_COUNTER";

/// Lower bound for the collection interval; `tokio::time::interval` rejects zero.
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateSnapshot {
    pub delay: HashMap<CgroupName, u64>,
    pub counter: HashMap<CgroupName, u64>,
}

/// Something holding the delay and counter tables.
pub trait AggregateSource {
    fn snapshot(&mut self) -> Result<AggregateSnapshot>;

    /// Removes every key from both tables.
    fn reset(&mut self) -> Result<()>;
}

/// The output maps of the loaded eBPF object.
pub struct BpfAggregates {
    delay: BpfHashMap<MapData, CgroupName, u64>,
    counter: BpfHashMap<MapData, CgroupName, u64>,
}

impl BpfAggregates {
    pub fn from_ebpf(bpf: &mut Ebpf) -> Result<Self> {
        let delay = BpfHashMap::try_from(
            bpf.take_map(DELAY_MAP)
                .with_context(|| format!("Failed to get {} map", DELAY_MAP))?,
        )?;
        let counter = BpfHashMap::try_from(
            bpf.take_map(COUNTER_MAP)
                .with_context(|| format!("Failed to get {} map", COUNTER_MAP))?,
        )?;
        Ok(Self { delay, counter })
    }
}

fn read_map(map: &BpfHashMap<MapData, CgroupName, u64>) -> Result<HashMap<CgroupName, u64>> {
    map.iter()
        .collect::<Result<HashMap<_, _>, _>>()
        .context("Failed to iterate map")
}

fn clear_map(map: &mut BpfHashMap<MapData, CgroupName, u64>) -> Result<()> {
    let keys = map
        .keys()
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to list map keys")?;
    for key in keys {
        // A key can vanish between listing and removal; the map is still cleared.
        if let Err(e) = map.remove(&key) {
            debug!("Failed to remove {:?}: {}", key, e);
        }
    }
    Ok(())
}

impl AggregateSource for BpfAggregates {
    fn snapshot(&mut self) -> Result<AggregateSnapshot> {
        Ok(AggregateSnapshot {
            delay: read_map(&self.delay).context(DELAY_MAP)?,
            counter: read_map(&self.counter).context(COUNTER_MAP)?,
        })
    }

    fn reset(&mut self) -> Result<()> {
        clear_map(&mut self.delay).context(DELAY_MAP)?;
        clear_map(&mut self.counter).context(COUNTER_MAP)
    }
}

fn host_snapshot(tables: &LatencyTables) -> AggregateSnapshot {
    AggregateSnapshot {
        delay: tables.delay.snapshot(),
        counter: tables.counter.snapshot(),
    }
}

fn host_reset(tables: &LatencyTables) {
    tables.delay.clear();
    tables.counter.clear();
}

impl AggregateSource for LatencyTables {
    fn snapshot(&mut self) -> Result<AggregateSnapshot> {
        Ok(host_snapshot(self))
    }

    fn reset(&mut self) -> Result<()> {
        host_reset(self);
        Ok(())
    }
}

impl AggregateSource for Arc<LatencyTables> {
    fn snapshot(&mut self) -> Result<AggregateSnapshot> {
        Ok(host_snapshot(self))
    }

    fn reset(&mut self) -> Result<()> {
        host_reset(self);
        Ok(())
    }
}

/// Kubernetes identity of a container cgroup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerInfo {
    pub container_id: String,
    pub container_name: String,
    pub pod_uid: String,
    pub pod_name: String,
    pub pod_namespace: String,
}

/// Known container cgroups, keyed by the cgroup name the probe reports.
pub trait ContainerLookup: Send + Sync {
    fn containers(&self) -> Vec<(CgroupName, ContainerInfo)>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CgroupLatency {
    pub cgroup: String,
    pub samples: u64,
    pub total_delay_ns: u64,
    pub avg_ns: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerInfo>,
}

fn display_name(name: &CgroupName) -> String {
    String::from_utf8_lossy(name.as_bytes()).into_owned()
}

/// Average latency per cgroup.
///
/// With a filter only the requested cgroups are reported, and requested names
/// with no samples report zero. Results are sorted by name.
pub fn average_latency(
    snapshot: &AggregateSnapshot,
    filter: Option<&[CgroupName]>,
) -> Vec<CgroupLatency> {
    let names: HashSet<CgroupName> = match filter {
        Some(requested) => requested.iter().copied().collect(),
        None => snapshot.delay.keys().chain(snapshot.counter.keys()).copied().collect(),
    };

    let mut latencies: Vec<CgroupLatency> = names
        .into_iter()
        .map(|name| {
            let samples = snapshot.counter.get(&name).copied().unwrap_or(0);
            let total_delay_ns = snapshot.delay.get(&name).copied().unwrap_or(0);
            let avg_ns = if samples > 0 {
                total_delay_ns as f64 / samples as f64
            } else {
                0.0
            };
            CgroupLatency {
                cgroup: display_name(&name),
                samples,
                total_delay_ns,
                avg_ns,
                container: None,
            }
        })
        .collect();
    latencies.sort_by(|a, b| a.cgroup.cmp(&b.cgroup));
    latencies
}

pub struct Collector<S> {
    source: S,
    interval: Duration,
    window: Duration,
    containers: Option<Arc<dyn ContainerLookup>>,
}

impl<S: AggregateSource> Collector<S> {
    pub fn new(source: S, interval: Duration, window: Duration) -> Self {
        if interval < window {
            warn!(
                "Collector interval {:?} is shorter than the window {:?}; using {:?}",
                interval, window, window
            );
        }
        let period = interval.max(window);
        if period < MIN_INTERVAL {
            warn!(
                "Collector interval {:?} is below {:?}; using {:?}",
                period, MIN_INTERVAL, MIN_INTERVAL
            );
        }
        Self {
            source,
            interval: period.max(MIN_INTERVAL),
            window,
            containers: None,
        }
    }

    pub fn with_containers(mut self, containers: Arc<dyn ContainerLookup>) -> Self {
        self.containers = Some(containers);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Clears the tables, waits one window and reads them back.
    pub async fn collect_window(&mut self) -> Result<Vec<CgroupLatency>> {
        self.source.reset().context("Failed to reset output maps")?;
        time::sleep(self.window).await;
        let snapshot = self.source.snapshot().context("Failed to read output maps")?;
        Ok(self.summarize(&snapshot))
    }

    fn summarize(&self, snapshot: &AggregateSnapshot) -> Vec<CgroupLatency> {
        let Some(lookup) = &self.containers else {
            return average_latency(snapshot, None);
        };

        let containers: HashMap<CgroupName, ContainerInfo> = lookup.containers().into_iter().collect();
        let requested: Vec<CgroupName> = containers.keys().copied().collect();
        let mut latencies = average_latency(snapshot, Some(&requested));
        for latency in latencies.iter_mut() {
            latency.container = containers.get(&CgroupName::new(&latency.cgroup)).cloned();
        }
        latencies
    }

    pub async fn run(mut self) {
        let shutdown = shutdown_flag();
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Collector started: interval {:?}, window {:?}",
            self.interval, self.window
        );

        loop {
            ticker.tick().await;
            if shutdown.load(Ordering::Relaxed) {
                break;
            }

            match self.collect_window().await {
                Ok(latencies) => publish(&latencies),
                Err(e) => warn!("Skipping collection window: {:#}", e),
            }
        }

        info!("Collector stopped");
    }
}

fn publish(latencies: &[CgroupLatency]) {
    let samples: u64 = latencies.iter().map(|l| l.samples).sum();
    info!(
        "Scheduling latency window: {} cgroups, {} samples",
        latencies.len(),
        samples
    );
    if let Ok(json) = serde_json::to_string(latencies) {
        debug!("{}", json);
    }
    telemetry::record_cgroup_latencies(latencies);
}
