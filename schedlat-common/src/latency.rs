//! Scheduling latency tracking core.
//!
//! Pairs "became runnable" events with the dispatch that follows and folds the
//! delay into per-cgroup sums and counts. The same code runs inside the eBPF
//! handlers and against the host stores in userspace, so it is written against
//! three small traits and never loops, allocates or blocks.
//!
//! Every failure mode (unreadable cgroup, missed enqueue, evicted record,
//! full output table) degrades to a missing sample. Nothing here returns an
//! error to the event source.

use crate::{CgroupName, MAX_CGROUP_NAME_SIZE, TASK_RUNNING, TaskLayout};

const POINTER_SIZE: u64 = 8;

/// Wait-start timestamps keyed by owner id.
///
/// Implementations are bounded and may drop entries at any time.
pub trait WaitTable {
    fn record(&self, owner: u32, timestamp: u64);
    fn wait_start(&self, owner: u32) -> Option<u64>;
    fn consume(&self, owner: u32);
}

/// One of the two per-cgroup output tables.
///
/// `set` on a new key may be silently dropped when the table is full.
pub trait AggregateTable {
    fn get(&self, name: &CgroupName) -> Option<u64>;
    fn set(&self, name: &CgroupName, value: u64);
}

/// Fault-tolerant reads of kernel memory.
pub trait KernelMemory {
    /// Reads the pointer-sized word at `addr`, `None` if the read faults.
    fn read_ptr(&self, addr: u64) -> Option<u64>;

    /// Copies the NUL terminated string at `addr` into `dst`, truncating to
    /// `dst.len() - 1` bytes. Returns the payload length or a negative errno.
    fn read_str(&self, addr: u64, dst: &mut [u8; MAX_CGROUP_NAME_SIZE]) -> Result<usize, i64>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolveError {
    Unconfigured,
    NullPointer,
    Fault,
}

/// Fields of a sched_switch event the core cares about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwitchEvent {
    pub prev_owner: u32,
    pub prev_state: i64,
    pub next_owner: u32,
}

impl SwitchEvent {
    /// The outgoing task was preempted rather than blocked.
    pub fn prev_runnable(&self) -> bool {
        self.prev_state == TASK_RUNNING
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwitchOutcome {
    Unresolved(ResolveError),
    MissedEnqueue,
    Sampled { latency_ns: u64 },
}

#[inline(always)]
fn follow<M: KernelMemory>(memory: &M, base: u64, offset: u64) -> Result<u64, ResolveError> {
    match memory.read_ptr(base.wrapping_add(offset)) {
        Some(0) => Err(ResolveError::NullPointer),
        Some(ptr) => Ok(ptr),
        None => Err(ResolveError::Fault),
    }
}

/// Reads the kernfs node name of the cgroup `task` belongs to for the
/// controller at `layout.subsys_slot`.
#[inline(always)]
pub fn resolve_cgroup_name<M: KernelMemory>(
    memory: &M,
    layout: &TaskLayout,
    task: u64,
) -> Result<CgroupName, ResolveError> {
    if !layout.is_configured() {
        return Err(ResolveError::Unconfigured);
    }
    if task == 0 {
        return Err(ResolveError::NullPointer);
    }

    let css_set = follow(memory, task, layout.task_cgroups as u64)?;
    let css = follow(
        memory,
        css_set,
        layout.css_set_subsys as u64 + layout.subsys_slot as u64 * POINTER_SIZE,
    )?;
    let cgroup = follow(memory, css, layout.css_cgroup as u64)?;
    let kn = follow(memory, cgroup, layout.cgroup_kn as u64)?;
    let name_ptr = follow(memory, kn, layout.kernfs_name as u64)?;

    let mut name = CgroupName::empty();
    memory
        .read_str(name_ptr, &mut name.0)
        .map_err(|_| ResolveError::Fault)?;
    Ok(name)
}

/// Borrowed view over the three tables.
pub struct Tracker<'a, W, A> {
    waits: &'a W,
    delay: &'a A,
    counter: &'a A,
}

impl<'a, W: WaitTable, A: AggregateTable> Tracker<'a, W, A> {
    pub const fn new(waits: &'a W, delay: &'a A, counter: &'a A) -> Self {
        Self {
            waits,
            delay,
            counter,
        }
    }

    /// Only the latest enqueue before a dispatch counts.
    #[inline(always)]
    pub fn record_enqueue(&self, owner: u32, now: u64) {
        self.waits.record(owner, now);
    }

    /// Handles one dispatch.
    ///
    /// The cgroup is resolved from `current_task`, the task running the
    /// handler, and the sample of `event.next_owner` is attributed to it.
    #[inline(always)]
    pub fn handle_switch<M: KernelMemory>(
        &self,
        memory: &M,
        layout: &TaskLayout,
        current_task: u64,
        event: &SwitchEvent,
        now: u64,
    ) -> SwitchOutcome {
        let name = match resolve_cgroup_name(memory, layout, current_task) {
            Ok(name) => name,
            Err(err) => return SwitchOutcome::Unresolved(err),
        };

        if event.prev_runnable() {
            self.record_enqueue(event.prev_owner, now);
        }

        let Some(wait_start) = self.waits.wait_start(event.next_owner) else {
            return SwitchOutcome::MissedEnqueue;
        };
        let latency_ns = now.saturating_sub(wait_start);

        self.accumulate(&name, latency_ns);
        self.waits.consume(event.next_owner);

        SwitchOutcome::Sampled { latency_ns }
    }

    // Plain read-then-write: concurrent updates to one key can lose samples.
    #[inline(always)]
    fn accumulate(&self, name: &CgroupName, latency_ns: u64) {
        let count = self.counter.get(name).unwrap_or(0).wrapping_add(1);
        let total = self.delay.get(name).unwrap_or(0).wrapping_add(latency_ns);
        self.counter.set(name, count);
        self.delay.set(name, total);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::RefCell, collections::HashMap};

    #[derive(Default)]
    struct FakeMemory {
        words: HashMap<u64, u64>,
        strings: HashMap<u64, Vec<u8>>,
    }

    impl KernelMemory for FakeMemory {
        fn read_ptr(&self, addr: u64) -> Option<u64> {
            self.words.get(&addr).copied()
        }

        fn read_str(&self, addr: u64, dst: &mut [u8; MAX_CGROUP_NAME_SIZE]) -> Result<usize, i64> {
            let src = self.strings.get(&addr).ok_or(-14i64)?;
            let len = src.len().min(dst.len() - 1);
            dst[..len].copy_from_slice(&src[..len]);
            dst[len] = 0;
            Ok(len)
        }
    }

    #[derive(Default)]
    struct MapTable(RefCell<HashMap<u64, u64>>);

    impl WaitTable for MapTable {
        fn record(&self, owner: u32, timestamp: u64) {
            self.0.borrow_mut().insert(owner as u64, timestamp);
        }
        fn wait_start(&self, owner: u32) -> Option<u64> {
            self.0.borrow().get(&(owner as u64)).copied()
        }
        fn consume(&self, owner: u32) {
            self.0.borrow_mut().remove(&(owner as u64));
        }
    }

    #[derive(Default)]
    struct NameTable(RefCell<HashMap<CgroupName, u64>>);

    impl AggregateTable for NameTable {
        fn get(&self, name: &CgroupName) -> Option<u64> {
            self.0.borrow().get(name).copied()
        }
        fn set(&self, name: &CgroupName, value: u64) {
            self.0.borrow_mut().insert(*name, value);
        }
    }

    const LAYOUT: TaskLayout = TaskLayout {
        task_cgroups: 0x900,
        css_set_subsys: 0,
        subsys_slot: 1,
        css_cgroup: 0,
        cgroup_kn: 0x100,
        kernfs_name: 0x10,
    };

    const TASK: u64 = 0x1000;
    const CSS_SET: u64 = 0x2000;
    const CSS: u64 = 0x3000;
    const CGROUP: u64 = 0x4000;
    const KN: u64 = 0x5000;
    const NAME: u64 = 0x6000;

    fn memory_with_cgroup(name: &[u8]) -> FakeMemory {
        let mut memory = FakeMemory::default();
        memory.words.insert(TASK + 0x900, CSS_SET);
        memory.words.insert(CSS_SET + 8, CSS);
        memory.words.insert(CSS, CGROUP);
        memory.words.insert(CGROUP + 0x100, KN);
        memory.words.insert(KN + 0x10, NAME);
        memory.strings.insert(NAME, name.to_vec());
        memory
    }

    #[test]
    fn test_resolve_reads_second_subsys_slot() {
        let memory = memory_with_cgroup(b"cri-containerd-abc.scope");
        let name = resolve_cgroup_name(&memory, &LAYOUT, TASK).unwrap();
        assert_eq!(name.as_str(), Some("cri-containerd-abc.scope"));
    }

    #[test]
    fn test_resolve_null_hop_fails() {
        let mut memory = memory_with_cgroup(b"cpu");
        memory.words.insert(CSS_SET + 8, 0);
        assert_eq!(
            resolve_cgroup_name(&memory, &LAYOUT, TASK),
            Err(ResolveError::NullPointer)
        );
    }

    #[test]
    fn test_resolve_fault_fails() {
        let mut memory = memory_with_cgroup(b"cpu");
        memory.words.remove(&(CGROUP + 0x100));
        assert_eq!(
            resolve_cgroup_name(&memory, &LAYOUT, TASK),
            Err(ResolveError::Fault)
        );

        let mut memory = memory_with_cgroup(b"cpu");
        memory.strings.clear();
        assert_eq!(
            resolve_cgroup_name(&memory, &LAYOUT, TASK),
            Err(ResolveError::Fault)
        );
    }

    #[test]
    fn test_resolve_requires_layout() {
        let memory = memory_with_cgroup(b"cpu");
        assert_eq!(
            resolve_cgroup_name(&memory, &TaskLayout::default(), TASK),
            Err(ResolveError::Unconfigured)
        );
        assert_eq!(
            resolve_cgroup_name(&memory, &LAYOUT, 0),
            Err(ResolveError::NullPointer)
        );
    }

    #[test]
    fn test_resolve_truncates_long_names() {
        let long = vec![b'n'; 200];
        let memory = memory_with_cgroup(&long);
        let name = resolve_cgroup_name(&memory, &LAYOUT, TASK).unwrap();
        assert_eq!(name.len(), MAX_CGROUP_NAME_SIZE - 1);
        assert_eq!(name.0[MAX_CGROUP_NAME_SIZE - 1], 0);
    }

    #[test]
    fn test_switch_samples_and_consumes() {
        let memory = memory_with_cgroup(b"cpu");
        let (waits, delay, counter) = (MapTable::default(), NameTable::default(), NameTable::default());
        let tracker = Tracker::new(&waits, &delay, &counter);

        tracker.record_enqueue(7, 1_000);
        let event = SwitchEvent {
            prev_owner: 3,
            prev_state: 1,
            next_owner: 7,
        };
        let outcome = tracker.handle_switch(&memory, &LAYOUT, TASK, &event, 1_750);

        assert_eq!(outcome, SwitchOutcome::Sampled { latency_ns: 750 });
        assert_eq!(waits.wait_start(7), None);
        assert_eq!(waits.wait_start(3), None);
        assert_eq!(counter.get(&CgroupName::new("cpu")), Some(1));
        assert_eq!(delay.get(&CgroupName::new("cpu")), Some(750));
    }

    #[test]
    fn test_clock_going_backwards_yields_zero() {
        let memory = memory_with_cgroup(b"cpu");
        let (waits, delay, counter) = (MapTable::default(), NameTable::default(), NameTable::default());
        let tracker = Tracker::new(&waits, &delay, &counter);

        tracker.record_enqueue(7, 2_000);
        let event = SwitchEvent {
            prev_owner: 3,
            prev_state: 1,
            next_owner: 7,
        };
        let outcome = tracker.handle_switch(&memory, &LAYOUT, TASK, &event, 1_000);
        assert_eq!(outcome, SwitchOutcome::Sampled { latency_ns: 0 });
    }
}
