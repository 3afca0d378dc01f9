//! Test doubles for the two external seams: a scriptable in-memory device
//! model behind [`DebugApi`], and a recording [`HostDebugger`]. The fake
//! transport counts every API call so caching behavior is observable.

use crate::api::{
    ApiError, ApiResult, AttachState, DebugApi, ExceptionKind, GridInfo, LaneMask, MemorySegment,
    SmMask, WarpMask,
};
use crate::contexts::{Context, ElfImage};
use crate::coords::{Coords, Dim3};
use crate::events::Event;
use crate::host::{HostDebugger, SignalHost, SourceLine};
use crate::state::System;
use bitvec::field::BitField;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

#[must_use]
pub fn lane_mask(bits: u32) -> LaneMask {
    let mut mask = LaneMask::ZERO;
    mask.as_mut_bitslice()[..crate::api::MAX_LANES_PER_WARP].store_le(bits);
    mask
}

#[must_use]
pub fn warp_mask(bits: u64) -> WarpMask {
    let mut mask = WarpMask::ZERO;
    mask.as_mut_bitslice().store_le(bits);
    mask
}

#[derive(Debug, Clone)]
pub struct FakeLane {
    pub thread_idx: Dim3,
    pub pc: u64,
    pub virtual_pc: u64,
    pub exception: ExceptionKind,
    pub call_depth: i32,
    pub syscall_call_depth: i32,
    pub error_address: Option<(u64, MemorySegment)>,
}

impl Default for FakeLane {
    fn default() -> Self {
        Self {
            thread_idx: Dim3::ZERO,
            pc: 0,
            virtual_pc: 0,
            exception: ExceptionKind::None,
            call_depth: 0,
            syscall_call_depth: 0,
            error_address: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeWarp {
    pub valid: bool,
    pub broken: bool,
    pub grid_id: u64,
    pub block_idx: Dim3,
    pub valid_lanes: LaneMask,
    pub active_lanes: LaneMask,
    pub lanes: Vec<FakeLane>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeSm {
    pub warps: Vec<FakeWarp>,
}

#[derive(Debug, Clone)]
pub struct FakeDevice {
    pub num_warps: u32,
    pub num_lanes: u32,
    pub num_registers: u32,
    pub dev_type: String,
    pub sm_type: String,
    pub sms: Vec<FakeSm>,
}

/// In-memory accelerator model. Populate it with [`FakeApi::add_device`]
/// and [`FakeApi::place_warp`], then feed it to [`System::new`].
#[derive(Debug, Default)]
pub struct FakeApi {
    pub devices: Vec<FakeDevice>,
    pub sync_events: VecDeque<Event>,
    pub async_events: VecDeque<Event>,
    pub attach: AttachState,
    pub remote: bool,
    /// Overrides the mask returned by `single_step_warp`.
    pub stepped_mask: Option<WarpMask>,
    /// Overrides the exception SM mask; computed from lane exceptions
    /// otherwise.
    pub exception_sm_mask: Option<SmMask>,
    pub grids: HashMap<(u32, u64), GridInfo>,
    calls: HashMap<&'static str, usize>,
}

impl FakeApi {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a device of the given shape with every warp invalid.
    pub fn add_device(&mut self, num_sms: u32, num_warps: u32, num_lanes: u32) -> u32 {
        let dev = self.devices.len() as u32;
        self.devices.push(FakeDevice {
            num_warps,
            num_lanes,
            num_registers: 64,
            dev_type: format!("FakeAccel {dev}"),
            sm_type: "fake_sm".to_string(),
            sms: vec![
                FakeSm {
                    warps: vec![FakeWarp::default(); num_warps as usize],
                };
                num_sms as usize
            ],
        });
        dev
    }

    /// Makes a warp live: lane masks from the given bits, thread indices
    /// linear in the lane id, all lane PCs at `pc`.
    #[allow(clippy::too_many_arguments)]
    pub fn place_warp(
        &mut self,
        dev: u32,
        sm: u32,
        wp: u32,
        grid_id: u64,
        block_idx: Dim3,
        valid_lanes: u32,
        active_lanes: u32,
        pc: u64,
    ) {
        let num_lanes = self.devices[dev as usize].num_lanes;
        let warp = &mut self.devices[dev as usize].sms[sm as usize].warps[wp as usize];
        warp.valid = true;
        warp.grid_id = grid_id;
        warp.block_idx = block_idx;
        warp.valid_lanes = lane_mask(valid_lanes);
        warp.active_lanes = lane_mask(active_lanes);
        warp.lanes = (0..num_lanes)
            .map(|ln| FakeLane {
                thread_idx: Dim3::new(ln, 0, 0),
                pc,
                virtual_pc: pc,
                ..FakeLane::default()
            })
            .collect();
    }

    /// Re-bases the thread indices of a warp (one block usually spans
    /// several warps).
    pub fn offset_threads(&mut self, dev: u32, sm: u32, wp: u32, base: Dim3) {
        let warp = &mut self.devices[dev as usize].sms[sm as usize].warps[wp as usize];
        for (ln, lane) in warp.lanes.iter_mut().enumerate() {
            lane.thread_idx = Dim3::new(base.x + ln as u32, base.y, base.z);
        }
    }

    /// How many times an API entry point was hit.
    #[must_use]
    pub fn calls(&self, name: &'static str) -> usize {
        self.calls.get(name).copied().unwrap_or(0)
    }

    fn hit(&mut self, name: &'static str) {
        *self.calls.entry(name).or_insert(0) += 1;
    }

    fn device(&self, dev: u32) -> ApiResult<&FakeDevice> {
        self.devices.get(dev as usize).ok_or(ApiError::Code(2))
    }

    fn warp(&self, dev: u32, sm: u32, wp: u32) -> ApiResult<&FakeWarp> {
        self.device(dev)?
            .sms
            .get(sm as usize)
            .and_then(|s| s.warps.get(wp as usize))
            .ok_or(ApiError::Code(2))
    }

    fn lane(&self, dev: u32, sm: u32, wp: u32, ln: u32) -> ApiResult<&FakeLane> {
        self.warp(dev, sm, wp)?
            .lanes
            .get(ln as usize)
            .ok_or(ApiError::Code(2))
    }
}

impl DebugApi for FakeApi {
    fn num_devices(&mut self) -> ApiResult<u32> {
        self.hit("num_devices");
        Ok(self.devices.len() as u32)
    }

    fn num_sms(&mut self, dev: u32) -> ApiResult<u32> {
        self.hit("num_sms");
        Ok(self.device(dev)?.sms.len() as u32)
    }

    fn num_warps(&mut self, dev: u32) -> ApiResult<u32> {
        self.hit("num_warps");
        Ok(self.device(dev)?.num_warps)
    }

    fn num_lanes(&mut self, dev: u32) -> ApiResult<u32> {
        self.hit("num_lanes");
        Ok(self.device(dev)?.num_lanes)
    }

    fn num_registers(&mut self, dev: u32) -> ApiResult<u32> {
        self.hit("num_registers");
        Ok(self.device(dev)?.num_registers)
    }

    fn device_type(&mut self, dev: u32) -> ApiResult<String> {
        self.hit("device_type");
        Ok(self.device(dev)?.dev_type.clone())
    }

    fn sm_type(&mut self, dev: u32) -> ApiResult<String> {
        self.hit("sm_type");
        Ok(self.device(dev)?.sm_type.clone())
    }

    fn valid_warps(&mut self, dev: u32, sm: u32) -> ApiResult<WarpMask> {
        self.hit("valid_warps");
        let sm = self
            .device(dev)?
            .sms
            .get(sm as usize)
            .ok_or(ApiError::Code(2))?;
        let mut mask = WarpMask::ZERO;
        for (wp, warp) in sm.warps.iter().enumerate() {
            if warp.valid {
                mask.set(wp, true);
            }
        }
        Ok(mask)
    }

    fn broken_warps(&mut self, dev: u32, sm: u32) -> ApiResult<WarpMask> {
        self.hit("broken_warps");
        let sm = self
            .device(dev)?
            .sms
            .get(sm as usize)
            .ok_or(ApiError::Code(2))?;
        let mut mask = WarpMask::ZERO;
        for (wp, warp) in sm.warps.iter().enumerate() {
            if warp.valid && warp.broken {
                mask.set(wp, true);
            }
        }
        Ok(mask)
    }

    fn valid_lanes(&mut self, dev: u32, sm: u32, wp: u32) -> ApiResult<LaneMask> {
        self.hit("valid_lanes");
        Ok(self.warp(dev, sm, wp)?.valid_lanes)
    }

    fn active_lanes(&mut self, dev: u32, sm: u32, wp: u32) -> ApiResult<LaneMask> {
        self.hit("active_lanes");
        Ok(self.warp(dev, sm, wp)?.active_lanes)
    }

    fn grid_id(&mut self, dev: u32, sm: u32, wp: u32) -> ApiResult<u64> {
        self.hit("grid_id");
        Ok(self.warp(dev, sm, wp)?.grid_id)
    }

    fn block_idx(&mut self, dev: u32, sm: u32, wp: u32) -> ApiResult<Dim3> {
        self.hit("block_idx");
        Ok(self.warp(dev, sm, wp)?.block_idx)
    }

    fn thread_idx(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> ApiResult<Dim3> {
        self.hit("thread_idx");
        Ok(self.lane(dev, sm, wp, ln)?.thread_idx)
    }

    fn pc(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> ApiResult<u64> {
        self.hit("pc");
        Ok(self.lane(dev, sm, wp, ln)?.pc)
    }

    fn virtual_pc(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> ApiResult<u64> {
        self.hit("virtual_pc");
        Ok(self.lane(dev, sm, wp, ln)?.virtual_pc)
    }

    fn lane_exception(
        &mut self,
        dev: u32,
        sm: u32,
        wp: u32,
        ln: u32,
    ) -> ApiResult<ExceptionKind> {
        self.hit("lane_exception");
        Ok(self.lane(dev, sm, wp, ln)?.exception)
    }

    fn register(&mut self, dev: u32, sm: u32, wp: u32, ln: u32, regno: u32) -> ApiResult<u32> {
        self.hit("register");
        let _ = self.lane(dev, sm, wp, ln)?;
        Ok(ln * 100 + regno)
    }

    fn call_depth(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> ApiResult<i32> {
        self.hit("call_depth");
        Ok(self.lane(dev, sm, wp, ln)?.call_depth)
    }

    fn syscall_call_depth(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> ApiResult<i32> {
        self.hit("syscall_call_depth");
        Ok(self.lane(dev, sm, wp, ln)?.syscall_call_depth)
    }

    fn virtual_return_address(
        &mut self,
        dev: u32,
        sm: u32,
        wp: u32,
        ln: u32,
        level: i32,
    ) -> ApiResult<u64> {
        self.hit("virtual_return_address");
        let _ = self.lane(dev, sm, wp, ln)?;
        Ok(0xdead_0000 + level as u64)
    }

    fn device_exception_state(&mut self, dev: u32) -> ApiResult<SmMask> {
        self.hit("device_exception_state");
        if let Some(mask) = self.exception_sm_mask {
            return Ok(mask);
        }
        let device = self.device(dev)?;
        let mut mask = SmMask::ZERO;
        for (sm, s) in device.sms.iter().enumerate() {
            let dirty = s.warps.iter().any(|w| {
                w.valid
                    && w.lanes
                        .iter()
                        .any(|l| l.exception != ExceptionKind::None)
            });
            if dirty {
                mask.set(sm, true);
            }
        }
        Ok(mask)
    }

    fn memcheck_error_address(
        &mut self,
        dev: u32,
        sm: u32,
        wp: u32,
        ln: u32,
    ) -> ApiResult<(u64, MemorySegment)> {
        self.hit("memcheck_error_address");
        Ok(self
            .lane(dev, sm, wp, ln)?
            .error_address
            .unwrap_or((0, MemorySegment::Unspecified)))
    }

    fn grid_info(&mut self, dev: u32, grid_id: u64) -> ApiResult<GridInfo> {
        self.hit("grid_info");
        self.grids
            .get(&(dev, grid_id))
            .copied()
            .ok_or(ApiError::Code(4))
    }

    fn suspend_device(&mut self, _dev: u32) -> ApiResult<()> {
        self.hit("suspend_device");
        Ok(())
    }

    fn resume_device(&mut self, _dev: u32) -> ApiResult<()> {
        self.hit("resume_device");
        Ok(())
    }

    fn single_step_warp(&mut self, _dev: u32, _sm: u32, wp: u32) -> ApiResult<WarpMask> {
        self.hit("single_step_warp");
        Ok(self.stepped_mask.unwrap_or_else(|| {
            let mut mask = WarpMask::ZERO;
            mask.set(wp as usize, true);
            mask
        }))
    }

    fn next_sync_event(&mut self) -> ApiResult<Option<Event>> {
        self.hit("next_sync_event");
        Ok(self.sync_events.pop_front())
    }

    fn next_async_event(&mut self) -> ApiResult<Option<Event>> {
        self.hit("next_async_event");
        Ok(self.async_events.pop_front())
    }

    fn attach_state(&self) -> AttachState {
        self.attach
    }

    fn set_attach_state(&mut self, state: AttachState) {
        self.attach = state;
    }

    fn is_remote(&self) -> bool {
        self.remote
    }

    fn sm_block_indices(&mut self, dev: u32, sm: u32) -> ApiResult<Vec<(u32, Dim3)>> {
        self.hit("sm_block_indices");
        let sm = self
            .device(dev)?
            .sms
            .get(sm as usize)
            .ok_or(ApiError::Code(2))?;
        Ok(sm
            .warps
            .iter()
            .enumerate()
            .filter(|(_, w)| w.valid)
            .map(|(wp, w)| (wp as u32, w.block_idx))
            .collect())
    }

    fn sm_grid_ids(&mut self, dev: u32, sm: u32) -> ApiResult<Vec<(u32, u64)>> {
        self.hit("sm_grid_ids");
        let sm = self
            .device(dev)?
            .sms
            .get(sm as usize)
            .ok_or(ApiError::Code(2))?;
        Ok(sm
            .warps
            .iter()
            .enumerate()
            .filter(|(_, w)| w.valid)
            .map(|(wp, w)| (wp as u32, w.grid_id))
            .collect())
    }

    fn warp_thread_indices(&mut self, dev: u32, sm: u32, wp: u32) -> ApiResult<Vec<(u32, Dim3)>> {
        self.hit("warp_thread_indices");
        let warp = self.warp(dev, sm, wp)?;
        Ok(warp
            .valid_lanes
            .iter_ones()
            .map(|ln| (ln as u32, warp.lanes[ln].thread_idx))
            .collect())
    }
}

/// Installs a context on a device so it counts as in use by test setups
/// that do not go through the event processor.
pub fn seed_context<A: DebugApi>(sys: &mut System<A>, dev: u32, context_id: u64, tid: u32) {
    let contexts = sys.contexts_mut(dev).expect("device exists");
    contexts.add(Context::new(context_id, dev));
    contexts.stack(context_id, tid);
}

/// Recording host debugger: every hook appends to a log the assertions can
/// inspect. Signal delivery fails for thread ids listed in `dead_threads`.
#[derive(Debug, Default)]
pub struct FakeHost {
    pub threads: Vec<u32>,
    pub dead_threads: HashSet<u32>,
    pub current: u32,
    pub switches: Vec<u32>,
    pub resolved_images: usize,
    pub unresolved_contexts: Vec<u64>,
    pub cleaned_contexts: Vec<u64>,
    pub auto_breakpoints: Vec<(u64, u64)>,
    pub breakpoints_removed: usize,
    pub breakpoints_inserted: usize,
    pub focus_changes: Vec<Coords>,
    pub source_lines: HashMap<u64, SourceLine>,
    pub function_names: HashMap<u64, String>,
    pub source_state_cleared: usize,
    delivered: Mutex<Vec<u32>>,
}

impl FakeHost {
    #[must_use]
    pub fn new(threads: &[u32]) -> Self {
        Self {
            threads: threads.to_vec(),
            current: threads.first().copied().unwrap_or(0),
            ..Self::default()
        }
    }

    /// Thread ids that received a stop signal, in delivery order.
    #[must_use]
    pub fn delivered(&self) -> Vec<u32> {
        self.delivered.lock().expect("not poisoned").clone()
    }
}

impl SignalHost for FakeHost {
    fn thread_ids(&self) -> Vec<u32> {
        self.threads.clone()
    }

    fn deliver_stop_signal(&self, tid: u32) -> bool {
        if self.dead_threads.contains(&tid) {
            return false;
        }
        self.delivered.lock().expect("not poisoned").push(tid);
        true
    }
}

impl HostDebugger for FakeHost {
    fn resolve_breakpoints(&mut self, _image: &ElfImage) {
        self.resolved_images += 1;
    }

    fn unresolve_breakpoints(&mut self, context_id: u64) {
        self.unresolved_contexts.push(context_id);
    }

    fn cleanup_breakpoints(&mut self, context_id: u64) {
        self.cleaned_contexts.push(context_id);
    }

    fn create_auto_breakpoint(&mut self, addr: u64, context_id: u64) {
        self.auto_breakpoints.push((addr, context_id));
    }

    fn remove_breakpoints(&mut self) {
        self.breakpoints_removed += 1;
    }

    fn insert_breakpoints(&mut self) {
        self.breakpoints_inserted += 1;
    }

    fn current_thread(&self) -> u32 {
        self.current
    }

    fn switch_to_thread(&mut self, tid: u32) {
        self.switches.push(tid);
        self.current = tid;
    }

    fn focus_changed(&mut self, coords: &Coords) {
        self.focus_changes.push(*coords);
    }

    fn function_name(&self, addr: u64) -> Option<String> {
        self.function_names.get(&addr).cloned()
    }

    fn source_line_for_pc(&self, pc: u64) -> Option<SourceLine> {
        self.source_lines.get(&pc).cloned()
    }

    fn clear_source_state(&mut self) {
        self.source_state_cleared += 1;
    }
}

#[cfg(test)]
static INIT: std::sync::Once = std::sync::Once::new();

/// Per-process test logging setup.
#[cfg(test)]
pub fn init_test() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}
