use aya_ebpf::{
    helpers::{bpf_probe_read_kernel, bpf_probe_read_kernel_str_bytes},
    macros::map,
    maps::{Array, HashMap, LruHashMap},
};
use schedlat_common::{
    CGROUP_TABLE_CAPACITY, CgroupName, MAX_CGROUP_NAME_SIZE, ProbeConfig, WAIT_TABLE_CAPACITY,
    latency::{AggregateTable, KernelMemory, Tracker, WaitTable},
};

/// Owner id -> ktime of the latest "became runnable" event.
#[map]
pub static PID_START_TIME: LruHashMap<u32, u64> =
    LruHashMap::with_max_entries(WAIT_TABLE_CAPACITY, 0);

/// Cgroup name -> summed scheduling latency (ns) since the last drain.
#[map]
pub static OUTPUT_CGROUP_DELAY: HashMap<CgroupName, u64> =
    HashMap::with_max_entries(CGROUP_TABLE_CAPACITY, 0);

/// Cgroup name -> number of samples since the last drain.
#[map]
pub static OUTPUT_CGROUP_COUNTER: HashMap<CgroupName, u64> =
    HashMap::with_max_entries(CGROUP_TABLE_CAPACITY, 0);

/// Written once by userspace before attach.
#[map]
pub static SCHEDLAT_CONFIG: Array<ProbeConfig> = Array::with_max_entries(1, 0);

pub struct WaitMap;

impl WaitTable for WaitMap {
    #[inline(always)]
    fn record(&self, owner: u32, timestamp: u64) {
        let _ = PID_START_TIME.insert(&owner, &timestamp, 0);
    }

    #[inline(always)]
    fn wait_start(&self, owner: u32) -> Option<u64> {
        unsafe { PID_START_TIME.get(&owner) }.copied()
    }

    #[inline(always)]
    fn consume(&self, owner: u32) {
        let _ = PID_START_TIME.remove(&owner);
    }
}

/// Selects one of the two per-cgroup output maps.
pub enum OutputMap {
    Delay,
    Counter,
}

impl OutputMap {
    #[inline(always)]
    fn map(&self) -> &'static HashMap<CgroupName, u64> {
        match self {
            OutputMap::Delay => &OUTPUT_CGROUP_DELAY,
            OutputMap::Counter => &OUTPUT_CGROUP_COUNTER,
        }
    }
}

impl AggregateTable for OutputMap {
    #[inline(always)]
    fn get(&self, name: &CgroupName) -> Option<u64> {
        unsafe { self.map().get(name) }.copied()
    }

    #[inline(always)]
    fn set(&self, name: &CgroupName, value: u64) {
        // BPF_ANY. New keys are rejected with E2BIG once the table is full.
        let _ = self.map().insert(name, &value, 0);
    }
}

pub struct KernelReader;

impl KernelMemory for KernelReader {
    #[inline(always)]
    fn read_ptr(&self, addr: u64) -> Option<u64> {
        unsafe { bpf_probe_read_kernel(addr as *const u64) }.ok()
    }

    #[inline(always)]
    fn read_str(&self, addr: u64, dst: &mut [u8; MAX_CGROUP_NAME_SIZE]) -> Result<usize, i64> {
        unsafe { bpf_probe_read_kernel_str_bytes(addr as *const u8, dst) }
            .map(|name| name.len())
            .map_err(|err| err as i64)
    }
}

#[inline(always)]
pub fn tracker() -> Tracker<'static, WaitMap, OutputMap> {
    Tracker::new(&WaitMap, &OutputMap::Delay, &OutputMap::Counter)
}
