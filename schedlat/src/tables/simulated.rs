//! Fake kernel memory for driving the latency core on the host.

use std::collections::HashMap;

use schedlat_common::{MAX_CGROUP_NAME_SIZE, TaskLayout, latency::KernelMemory};

const EFAULT: i64 = -14;

/// Layout used by [`SimulatedKernel`]; offsets are arbitrary but non-zero.
const SIMULATED_LAYOUT: TaskLayout = TaskLayout {
    task_cgroups: 0x920,
    css_set_subsys: 0,
    subsys_slot: 1,
    css_cgroup: 0,
    cgroup_kn: 0x108,
    kernfs_name: 0x10,
};

/// Sparse fake of the kernel objects the cgroup resolver walks.
///
/// Unmapped addresses fault, which lets tests cover every failure path.
pub struct SimulatedKernel {
    layout: TaskLayout,
    words: HashMap<u64, u64>,
    strings: HashMap<u64, Vec<u8>>,
    next_addr: u64,
}

impl Default for SimulatedKernel {
    fn default() -> Self {
        Self {
            layout: SIMULATED_LAYOUT,
            words: HashMap::new(),
            strings: HashMap::new(),
            next_addr: 0xffff_8880_0000_0000,
        }
    }
}

impl SimulatedKernel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn layout(&self) -> TaskLayout {
        self.layout
    }

    fn alloc(&mut self) -> u64 {
        let addr = self.next_addr;
        self.next_addr += 0x1000;
        addr
    }

    fn subsys_entry(&self, css_set: u64) -> u64 {
        css_set + self.layout.css_set_subsys as u64 + self.layout.subsys_slot as u64 * 8
    }

    /// A task whose controller at the configured slot lives in `cgroup`.
    pub fn spawn_task(&mut self, cgroup: &str) -> u64 {
        let (task, css_set, css, cg, kn, name) = (
            self.alloc(),
            self.alloc(),
            self.alloc(),
            self.alloc(),
            self.alloc(),
            self.alloc(),
        );
        let layout = self.layout;
        self.words.insert(task + layout.task_cgroups as u64, css_set);
        self.words.insert(self.subsys_entry(css_set), css);
        self.words.insert(css + layout.css_cgroup as u64, cg);
        self.words.insert(cg + layout.cgroup_kn as u64, kn);
        self.words.insert(kn + layout.kernfs_name as u64, name);
        self.strings.insert(name, cgroup.as_bytes().to_vec());
        task
    }

    /// A task with no controller attached at the configured slot.
    pub fn spawn_detached_task(&mut self) -> u64 {
        let (task, css_set) = (self.alloc(), self.alloc());
        self.words
            .insert(task + self.layout.task_cgroups as u64, css_set);
        self.words.insert(self.subsys_entry(css_set), 0);
        task
    }
}

impl KernelMemory for SimulatedKernel {
    fn read_ptr(&self, addr: u64) -> Option<u64> {
        self.words.get(&addr).copied()
    }

    fn read_str(&self, addr: u64, dst: &mut [u8; MAX_CGROUP_NAME_SIZE]) -> Result<usize, i64> {
        let src = self.strings.get(&addr).ok_or(EFAULT)?;
        let len = src.len().min(dst.len() - 1);
        dst[..len].copy_from_slice(&src[..len]);
        dst[len] = 0;
        Ok(len)
    }
}
