//! Upward interfaces toward the surrounding host debugger.

use crate::contexts::ElfImage;
use crate::coords::Coords;

/// Host-thread stop reason, as seen by the debugger's wait loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Stopped(StopSignal),
    Exited(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Trap,
    Other,
}

/// The minimal surface the debug-API callback thread needs: enumerate the
/// host debugger's threads and deliver a per-thread stop signal. This is
/// the only trait touched from outside the consumer thread, so it must be
/// `Sync`.
pub trait SignalHost: Sync {
    /// Live host thread ids, in the debugger's iteration order.
    fn thread_ids(&self) -> Vec<u32>;
    /// Delivers the stop signal to one host thread. `false` when the
    /// thread cannot accept it (exited, detached).
    fn deliver_stop_signal(&self, tid: u32) -> bool;
}

/// A resolved source position for a device PC.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceLine {
    pub filename: String,
    pub line: u32,
}

/// Everything else the core asks of the host debugger: breakpoint
/// bookkeeping, symbol and line lookup, and focus-change side effects.
/// All of it runs on the consumer thread.
pub trait HostDebugger: SignalHost {
    /// Attempt to resolve pending breakpoints against a new ELF image.
    fn resolve_breakpoints(&mut self, image: &ElfImage);
    /// Forget resolved breakpoint addresses belonging to a context.
    fn unresolve_breakpoints(&mut self, context_id: u64);
    /// Drop auto-breakpoints created for a context.
    fn cleanup_breakpoints(&mut self, context_id: u64);
    /// Plant an auto-breakpoint at a kernel entry point.
    fn create_auto_breakpoint(&mut self, addr: u64, context_id: u64);
    /// Remove all software breakpoints from device memory.
    fn remove_breakpoints(&mut self);
    /// Re-insert all software breakpoints into device memory.
    fn insert_breakpoints(&mut self);

    /// The host thread the debugger currently operates on.
    fn current_thread(&self) -> u32;
    /// Retarget the debugger to another host thread (symbol resolution
    /// happens in that thread's process context).
    fn switch_to_thread(&mut self, tid: u32);

    /// The focus moved; update frames, convenience state, ELF selection.
    fn focus_changed(&mut self, coords: &Coords);
    /// Name of the function covering a device code address.
    fn function_name(&self, addr: u64) -> Option<String>;
    /// Source position for a device PC.
    fn source_line_for_pc(&self, pc: u64) -> Option<SourceLine>;
    /// Drop cached source position and display state (a kernel finished).
    fn clear_source_state(&mut self);
}
