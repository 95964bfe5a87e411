#![cfg_attr(not(test), no_std)]

pub mod latency;

/// Size of a cgroup name key, NUL terminator included.
pub const MAX_CGROUP_NAME_SIZE: usize = 128;

/// Capacity of the per-owner wait record table (LRU evicted).
pub const WAIT_TABLE_CAPACITY: u32 = 65536;

/// Capacity of each per-cgroup output table.
pub const CGROUP_TABLE_CAPACITY: u32 = 1024;

/// Number of entries in `css_set::subsys`.
pub const CGROUP_SUBSYS_SLOTS: u32 = 14;

/// `prev_state` reported by sched_switch for a task preempted while runnable.
pub const TASK_RUNNING: i64 = 0;

/// Fixed-size, zero padded cgroup name used as a map key.
///
/// At most `MAX_CGROUP_NAME_SIZE - 1` bytes of payload are kept. Longer names
/// are truncated, so names sharing that prefix map to the same key.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CgroupName(pub [u8; MAX_CGROUP_NAME_SIZE]);

impl CgroupName {
    pub const fn empty() -> Self {
        Self([0; MAX_CGROUP_NAME_SIZE])
    }

    pub fn new(name: &str) -> Self {
        Self::from_bytes(name.as_bytes())
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut key = Self::empty();
        let len = bytes.len().min(MAX_CGROUP_NAME_SIZE - 1);
        key.0[..len].copy_from_slice(&bytes[..len]);
        key
    }

    /// Payload length, up to the first NUL.
    pub fn len(&self) -> usize {
        self.0
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_CGROUP_NAME_SIZE)
    }

    pub fn is_empty(&self) -> bool {
        self.0[0] == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0[..self.len()]
    }

    pub fn as_str(&self) -> Option<&str> {
        core::str::from_utf8(self.as_bytes()).ok()
    }
}

impl Default for CgroupName {
    fn default() -> Self {
        Self::empty()
    }
}

impl core::fmt::Debug for CgroupName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.as_str() {
            Some(name) => write!(f, "CgroupName({:?})", name),
            None => write!(f, "CgroupName({:?})", self.as_bytes()),
        }
    }
}

/// Byte offsets used to walk
/// `task_struct->cgroups->subsys[slot]->cgroup->kn->name`.
///
/// These are kernel build specific. Userspace writes them into the
/// `SCHEDLAT_CONFIG` map before the programs are attached.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TaskLayout {
    /// `task_struct::cgroups`
    pub task_cgroups: u32,
    /// `css_set::subsys`
    pub css_set_subsys: u32,
    /// Index into `css_set::subsys` naming the controller to report.
    pub subsys_slot: u32,
    /// `cgroup_subsys_state::cgroup`
    pub css_cgroup: u32,
    /// `cgroup::kn`
    pub cgroup_kn: u32,
    /// `kernfs_node::name`
    pub kernfs_name: u32,
}

impl TaskLayout {
    /// `task_struct::cgroups` is never at offset zero, so zero means unset.
    pub const fn is_configured(&self) -> bool {
        self.task_cgroups != 0 && self.subsys_slot < CGROUP_SUBSYS_SLOTS
    }
}

/// Configuration block shared with the eBPF side through `SCHEDLAT_CONFIG`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProbeConfig {
    pub layout: TaskLayout,
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for CgroupName {}

#[cfg(feature = "user")]
unsafe impl aya::Pod for ProbeConfig {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_name_round_trips() {
        let name = CgroupName::new("kubepods-besteffort.slice");
        assert_eq!(name.as_str(), Some("kubepods-besteffort.slice"));
        assert_eq!(name.len(), 25);
        assert!(name.0[25..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_long_name_keeps_terminator() {
        let long = "a".repeat(300);
        let name = CgroupName::new(&long);
        assert_eq!(name.len(), MAX_CGROUP_NAME_SIZE - 1);
        assert_eq!(name.0[MAX_CGROUP_NAME_SIZE - 1], 0);
    }

    #[test]
    fn test_shared_prefix_collides() {
        let prefix = "x".repeat(MAX_CGROUP_NAME_SIZE - 1);
        let a = CgroupName::new(&format!("{}-first", prefix));
        let b = CgroupName::new(&format!("{}-second", prefix));
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_name() {
        assert!(CgroupName::default().is_empty());
        assert_eq!(CgroupName::default().as_bytes(), b"");
    }

    #[test]
    fn test_layout_unconfigured_by_default() {
        assert!(!TaskLayout::default().is_configured());

        let layout = TaskLayout {
            task_cgroups: 0x920,
            subsys_slot: CGROUP_SUBSYS_SLOTS,
            ..Default::default()
        };
        assert!(!layout.is_configured());
    }
}
