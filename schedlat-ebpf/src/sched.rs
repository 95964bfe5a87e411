//! sched tracepoint handlers.
//!
//! `sched_wakeup` and `sched_wakeup_new` record the wait start of the woken
//! task. `sched_switch` re-records a preempted outgoing task and turns the
//! incoming task's wait record into a latency sample. Handlers always return 0.

use aya_ebpf::{
    cty::c_long,
    helpers::{bpf_get_current_task, bpf_ktime_get_ns},
    macros::tracepoint,
    programs::TracePointContext,
};
use schedlat_common::latency::{ResolveError, SwitchEvent, SwitchOutcome};

use crate::maps::{KernelReader, SCHEDLAT_CONFIG, tracker};

// Offsets into the tracepoint records, after the 8 byte common header:
// /sys/kernel/tracing/events/sched/<event>/format
const WAKEUP_PID_OFFSET: usize = 24;
const SWITCH_PREV_PID_OFFSET: usize = 24;
const SWITCH_PREV_STATE_OFFSET: usize = 32;
const SWITCH_NEXT_PID_OFFSET: usize = 56;

#[tracepoint]
pub fn handle_sched_wakeup(ctx: TracePointContext) -> u32 {
    let _ = try_trace_enqueue(&ctx);
    0
}

#[tracepoint]
pub fn handle_sched_wakeup_new(ctx: TracePointContext) -> u32 {
    let _ = try_trace_enqueue(&ctx);
    0
}

#[tracepoint]
pub fn handle_sched_switch(ctx: TracePointContext) -> u32 {
    let _ = try_handle_switch(&ctx);
    0
}

#[inline(always)]
fn try_trace_enqueue(ctx: &TracePointContext) -> Result<(), c_long> {
    let pid: u32 = unsafe { ctx.read_at(WAKEUP_PID_OFFSET)? };
    let now = unsafe { bpf_ktime_get_ns() };
    tracker().record_enqueue(pid, now);
    Ok(())
}

#[inline(always)]
fn try_handle_switch(ctx: &TracePointContext) -> Result<SwitchOutcome, c_long> {
    let event = unsafe {
        SwitchEvent {
            prev_owner: ctx.read_at(SWITCH_PREV_PID_OFFSET)?,
            prev_state: ctx.read_at(SWITCH_PREV_STATE_OFFSET)?,
            next_owner: ctx.read_at(SWITCH_NEXT_PID_OFFSET)?,
        }
    };

    let layout = match SCHEDLAT_CONFIG.get(0) {
        Some(config) => config.layout,
        None => return Ok(SwitchOutcome::Unresolved(ResolveError::Unconfigured)),
    };

    // The handler runs in the context of the outgoing task.
    let current = unsafe { bpf_get_current_task() };
    let now = unsafe { bpf_ktime_get_ns() };

    Ok(tracker().handle_switch(&KernelReader, &layout, current, &event, now))
}
