//! Lazily populated mirror of the accelerator's hardware state.
//!
//! Every cached field is an `Option`: `Some` is the presence bit, and every
//! getter has the same shape: if present return it, otherwise fetch through
//! the debug API, store, and return. Presence, not value, decides whether a
//! re-fetch happens. Invalidation clears presence; it never talks to the
//! device.

use crate::api::{
    DebugApi, ExceptionKind, LaneMask, MemorySegment, SmMask, WarpMask, MAX_LANES_PER_WARP,
    MAX_SMS_PER_DEVICE, MAX_WARPS_PER_SM,
};
use crate::contexts::{Contexts, ElfImage};
use crate::coords::{Coords, Dim3};
use crate::host::HostDebugger;
use crate::kernels::{KernelLaunch, Kernels};
use crate::options::Options;
use crate::{Error, Result};
use console::style;

/// Logical stop counter. Bumped once per device suspension; warp and lane
/// observations are stamped with it for staleness checks.
pub type Clock = u64;

#[derive(Debug, Default, Clone, Copy)]
struct LaneState {
    thread_idx: Option<Dim3>,
    pc: Option<u64>,
    virtual_pc: Option<u64>,
    exception: Option<ExceptionKind>,
    timestamp: Option<Clock>,
}

impl LaneState {
    fn invalidate(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Default, Clone)]
struct WarpState {
    grid_id: Option<u64>,
    block_idx: Option<Dim3>,
    /// Cached kernel lookup; the flag is the presence bit, the value may
    /// legitimately be `None` when no registered kernel owns the grid.
    kernel_p: bool,
    kernel: Option<u64>,
    valid_lanes_mask: Option<LaneMask>,
    active_lanes_mask: Option<LaneMask>,
    timestamp: Option<Clock>,
    lanes: Vec<LaneState>,
}

impl WarpState {
    fn invalidate(&mut self) {
        for lane in &mut self.lanes {
            lane.invalidate();
        }
        self.grid_id = None;
        self.block_idx = None;
        self.kernel_p = false;
        self.kernel = None;
        self.valid_lanes_mask = None;
        self.active_lanes_mask = None;
        self.timestamp = None;
    }
}

#[derive(Debug, Default, Clone)]
struct SmState {
    valid_warps_mask: Option<WarpMask>,
    broken_warps_mask: Option<WarpMask>,
    warps: Vec<WarpState>,
}

#[derive(Debug, Default)]
struct DeviceState {
    num_sms: Option<u32>,
    num_warps: Option<u32>,
    num_lanes: Option<u32>,
    num_registers: Option<u32>,
    dev_type: Option<String>,
    sm_type: Option<String>,
    /// At least one live warp anywhere on the device.
    valid: Option<bool>,
    exception_state_filtered: bool,
    suspended: bool,
    sms: Vec<SmState>,
    contexts: Contexts,
}

/// The process-wide debugger state: the device mirror, the context and
/// kernel registries, the focus, and the logical clock. Touched only from
/// the host debugger's command thread.
#[derive(Debug)]
pub struct System<A: DebugApi> {
    pub api: A,
    pub options: Options,
    pub kernels: Kernels,
    num_devices: Option<u32>,
    devices: Vec<DeviceState>,
    suspended_mask: u64,
    clock: Clock,
    focus: Option<Coords>,
    current_context: Option<(u32, u64)>,
}

impl<A: DebugApi> System<A> {
    #[must_use]
    pub fn new(api: A, options: Options) -> Self {
        Self {
            api,
            options,
            kernels: Kernels::new(),
            num_devices: None,
            devices: Vec::new(),
            suspended_mask: 0,
            clock: 0,
            focus: None,
            current_context: None,
        }
    }

    // ------------------------------------------------------------------
    // System
    // ------------------------------------------------------------------

    pub fn num_devices(&mut self) -> Result<u32> {
        if let Some(n) = self.num_devices {
            return Ok(n);
        }
        let n = self.api.num_devices()?;
        assert!(n <= 64, "too many devices: {n}");
        self.num_devices = Some(n);
        self.devices.resize_with(n as usize, DeviceState::default);
        Ok(n)
    }

    /// Remote transports report the device shape up front instead of
    /// answering piecemeal sizing queries.
    pub fn set_device_spec(
        &mut self,
        dev: u32,
        num_sms: u32,
        num_warps: u32,
        num_lanes: u32,
        num_registers: u32,
        dev_type: &str,
        sm_type: &str,
    ) -> Result<()> {
        assert!(self.api.is_remote(), "device spec only arrives remotely");
        assert!(num_sms as usize <= MAX_SMS_PER_DEVICE);
        assert!(num_warps as usize <= MAX_WARPS_PER_SM);
        assert!(num_lanes as usize <= MAX_LANES_PER_WARP);
        let n = self.num_devices()?;
        assert!(dev < n, "device {dev} out of range");
        let d = &mut self.devices[dev as usize];
        d.num_sms = Some(num_sms);
        d.num_warps = Some(num_warps);
        d.num_lanes = Some(num_lanes);
        d.num_registers = Some(num_registers);
        d.dev_type = Some(dev_type.to_string());
        d.sm_type = Some(sm_type.to_string());
        Ok(())
    }

    #[must_use]
    pub fn clock(&self) -> Clock {
        self.clock
    }

    #[must_use]
    pub fn suspended_devices_mask(&self) -> u64 {
        self.suspended_mask
    }

    /// Did any warp hit a stop-worthy event at or after `clock`?
    pub fn is_broken_at(&mut self, clock: Clock) -> Result<bool> {
        let n = self.num_devices()?;
        for dev in 0..n {
            if !self.device_is_any_context_present(dev) {
                continue;
            }
            for sm in 0..self.device_num_sms(dev)? {
                for wp in 0..self.device_num_warps(dev)? {
                    if !self.warp_is_valid(dev, sm, wp)? {
                        continue;
                    }
                    // a breakpoint hit at an earlier stop is not reported again
                    if self.warp_timestamp(dev, sm, wp)? < clock {
                        continue;
                    }
                    if self.warp_is_broken(dev, sm, wp)? {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    pub fn num_present_kernels(&mut self) -> Result<u32> {
        let ids: Vec<u64> = self.kernels.iter().map(|k| k.id).collect();
        let mut count = 0;
        for id in ids {
            if self.kernel_is_present(id)? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Brute-force pass attempting to resolve every pending breakpoint
    /// against every loaded ELF image, used when there is no easy way to
    /// tell which context or module is concerned.
    pub fn resolve_breakpoints<H: HostDebugger>(&mut self, host: &mut H) -> Result<()> {
        log::debug!("system: resolve breakpoints");
        let n = self.num_devices()?;
        for dev in 0..n {
            if !self.device_is_any_context_present(dev) {
                continue;
            }
            let images: Vec<ElfImage> = self.devices[dev as usize]
                .contexts
                .iter()
                .flat_map(|c| c.modules.iter().map(|m| m.image.clone()))
                .collect();
            for image in &images {
                host.resolve_breakpoints(image);
            }
        }
        Ok(())
    }

    pub fn cleanup_breakpoints<H: HostDebugger>(&mut self, host: &mut H) -> Result<()> {
        log::debug!("system: clean up breakpoints");
        let n = self.num_devices()?;
        for dev in 0..n {
            let ids: Vec<u64> = self.devices[dev as usize]
                .contexts
                .iter()
                .map(|c| c.id)
                .collect();
            for id in ids {
                host.cleanup_breakpoints(id);
            }
        }
        Ok(())
    }

    pub fn cleanup_contexts(&mut self) -> Result<()> {
        log::debug!("system: clean up contexts");
        let n = self.num_devices()?;
        for dev in 0..n {
            self.devices[dev as usize].contexts = Contexts::new();
        }
        self.current_context = None;
        Ok(())
    }

    #[must_use]
    pub fn find_context_by_addr(&self, addr: u64) -> Option<(u32, u64)> {
        self.devices.iter().enumerate().find_map(|(dev, d)| {
            d.contexts
                .find_by_code_address(addr)
                .map(|c| (dev as u32, c.id))
        })
    }

    // ------------------------------------------------------------------
    // Focus and current context
    // ------------------------------------------------------------------

    #[must_use]
    pub fn focus(&self) -> Option<&Coords> {
        self.focus.as_ref()
    }

    pub fn set_focus(&mut self, coords: Coords) {
        assert!(coords.valid, "focus must be fully defined");
        self.focus = Some(coords);
    }

    pub fn clear_focus(&mut self) {
        self.focus = None;
    }

    #[must_use]
    pub fn current_context(&self) -> Option<(u32, u64)> {
        self.current_context
    }

    pub fn set_current_context(&mut self, ctx: Option<(u32, u64)>) {
        self.current_context = ctx;
    }

    // ------------------------------------------------------------------
    // Device
    // ------------------------------------------------------------------

    pub fn device_num_sms(&mut self, dev: u32) -> Result<u32> {
        self.check_dev(dev)?;
        if let Some(n) = self.devices[dev as usize].num_sms {
            return Ok(n);
        }
        let n = self.api.num_sms(dev)?;
        assert!(n as usize <= MAX_SMS_PER_DEVICE, "too many SMs: {n}");
        self.devices[dev as usize].num_sms = Some(n);
        Ok(n)
    }

    pub fn device_num_warps(&mut self, dev: u32) -> Result<u32> {
        self.check_dev(dev)?;
        if let Some(n) = self.devices[dev as usize].num_warps {
            return Ok(n);
        }
        let n = self.api.num_warps(dev)?;
        assert!(n as usize <= MAX_WARPS_PER_SM, "too many warps per SM: {n}");
        self.devices[dev as usize].num_warps = Some(n);
        Ok(n)
    }

    pub fn device_num_lanes(&mut self, dev: u32) -> Result<u32> {
        self.check_dev(dev)?;
        if let Some(n) = self.devices[dev as usize].num_lanes {
            return Ok(n);
        }
        let n = self.api.num_lanes(dev)?;
        assert!(n as usize <= MAX_LANES_PER_WARP, "too many lanes per warp: {n}");
        self.devices[dev as usize].num_lanes = Some(n);
        Ok(n)
    }

    pub fn device_num_registers(&mut self, dev: u32) -> Result<u32> {
        self.check_dev(dev)?;
        if let Some(n) = self.devices[dev as usize].num_registers {
            return Ok(n);
        }
        let n = self.api.num_registers(dev)?;
        self.devices[dev as usize].num_registers = Some(n);
        Ok(n)
    }

    pub fn device_type(&mut self, dev: u32) -> Result<String> {
        self.check_dev(dev)?;
        if let Some(t) = &self.devices[dev as usize].dev_type {
            return Ok(t.clone());
        }
        let t = self.api.device_type(dev)?;
        self.devices[dev as usize].dev_type = Some(t.clone());
        Ok(t)
    }

    pub fn device_sm_type(&mut self, dev: u32) -> Result<String> {
        self.check_dev(dev)?;
        if let Some(t) = &self.devices[dev as usize].sm_type {
            return Ok(t.clone());
        }
        let t = self.api.sm_type(dev)?;
        self.devices[dev as usize].sm_type = Some(t.clone());
        Ok(t)
    }

    #[must_use]
    pub fn device_is_any_context_present(&self, dev: u32) -> bool {
        self.devices
            .get(dev as usize)
            .is_some_and(|d| d.contexts.any_present())
    }

    pub fn device_num_kernels(&mut self, dev: u32) -> Result<u32> {
        self.check_dev(dev)?;
        Ok(self.kernels.num_alive_on(dev) as u32)
    }

    /// Safe on never-initialized devices: a device with no context is
    /// simply not valid.
    pub fn device_is_valid(&mut self, dev: u32) -> Result<bool> {
        self.check_dev(dev)?;
        if let Some(v) = self.devices[dev as usize].valid {
            return Ok(v);
        }
        let mut valid = false;
        if self.device_is_any_context_present(dev) {
            let num_sms = self.device_num_sms(dev)?;
            let num_warps = self.device_num_warps(dev)?;
            'scan: for sm in 0..num_sms {
                for wp in 0..num_warps {
                    if self.warp_is_valid(dev, sm, wp)? {
                        valid = true;
                        break 'scan;
                    }
                }
            }
        }
        self.devices[dev as usize].valid = Some(valid);
        Ok(valid)
    }

    pub fn device_active_sms_mask(&mut self, dev: u32) -> Result<SmMask> {
        self.check_dev(dev)?;
        let mut mask = SmMask::ZERO;
        for sm in 0..self.device_num_sms(dev)? {
            if self.sm_is_valid(dev, sm)? {
                mask.set(sm as usize, true);
            }
        }
        Ok(mask)
    }

    pub fn contexts(&self, dev: u32) -> &Contexts {
        assert!((dev as usize) < self.devices.len(), "device {dev} out of range");
        &self.devices[dev as usize].contexts
    }

    pub fn contexts_mut(&mut self, dev: u32) -> Result<&mut Contexts> {
        self.check_dev(dev)?;
        Ok(&mut self.devices[dev as usize].contexts)
    }

    /// Clears every presence bit of the device and the derived kernel
    /// caches. Sizing and type information survives.
    pub fn device_invalidate(&mut self, dev: u32) {
        log::debug!("{}", style(format!("device {dev}: invalidate")).cyan());
        let Some(d) = self.devices.get_mut(dev as usize) else {
            return;
        };
        for sm in &mut d.sms {
            for wp in &mut sm.warps {
                wp.invalidate();
            }
            sm.valid_warps_mask = None;
            sm.broken_warps_mask = None;
        }
        d.valid = None;
        d.exception_state_filtered = false;
        self.kernels.invalidate_device(dev);
    }

    pub fn device_resume(&mut self, dev: u32) -> Result<()> {
        log::debug!("{}", style(format!("device {dev}: resume")).cyan());
        self.check_dev(dev)?;
        self.device_invalidate(dev);
        if !self.devices[dev as usize].suspended {
            return Ok(());
        }
        self.api.resume_device(dev)?;
        self.devices[dev as usize].suspended = false;
        self.suspended_mask &= !(1 << dev);
        Ok(())
    }

    pub fn device_suspend(&mut self, dev: u32) -> Result<()> {
        log::debug!("{}", style(format!("device {dev}: suspend")).cyan());
        self.check_dev(dev)?;
        if !self.device_is_any_context_present(dev) {
            return Ok(());
        }
        self.api.suspend_device(dev)?;
        self.devices[dev as usize].suspended = true;
        self.suspended_mask |= 1 << dev;
        self.clock += 1;
        Ok(())
    }

    /// Reads the device's exception SM mask once per stop and stamps every
    /// lane of every SM outside the mask to "no exception", sparing the
    /// per-lane exception reads in the common case.
    pub fn device_filter_exception_state(&mut self, dev: u32) -> Result<()> {
        self.check_dev(dev)?;
        if !self.device_is_any_context_present(dev) {
            return Ok(());
        }
        if self.devices[dev as usize].exception_state_filtered {
            return Ok(());
        }
        let sm_mask = self.api.device_exception_state(dev)?;
        let num_sms = self.device_num_sms(dev)?;
        self.ensure_shape(dev)?;
        let d = &mut self.devices[dev as usize];
        for sm in 0..num_sms as usize {
            if sm_mask[sm] {
                continue;
            }
            log::debug!("device {dev} sm {sm}: no exceptions");
            for wp in &mut d.sms[sm].warps {
                for ln in &mut wp.lanes {
                    ln.exception = Some(ExceptionKind::None);
                }
            }
        }
        d.exception_state_filtered = true;
        Ok(())
    }

    // ------------------------------------------------------------------
    // SM
    // ------------------------------------------------------------------

    pub fn sm_is_valid(&mut self, dev: u32, sm: u32) -> Result<bool> {
        Ok(self.sm_valid_warps_mask(dev, sm)?.any())
    }

    pub fn sm_valid_warps_mask(&mut self, dev: u32, sm: u32) -> Result<WarpMask> {
        self.check_sm(dev, sm)?;
        if let Some(mask) = self.devices[dev as usize].sms[sm as usize].valid_warps_mask {
            return Ok(mask);
        }
        let mask = self.api.valid_warps(dev, sm)?;
        self.devices[dev as usize].sms[sm as usize].valid_warps_mask = Some(mask);
        Ok(mask)
    }

    pub fn sm_broken_warps_mask(&mut self, dev: u32, sm: u32) -> Result<WarpMask> {
        self.check_sm(dev, sm)?;
        if let Some(mask) = self.devices[dev as usize].sms[sm as usize].broken_warps_mask {
            return Ok(mask);
        }
        let mask = self.api.broken_warps(dev, sm)?;
        self.devices[dev as usize].sms[sm as usize].broken_warps_mask = Some(mask);
        Ok(mask)
    }

    /// Drops the SM's warp masks (and, recursively, every warp entry).
    fn sm_invalidate(&mut self, dev: u32, sm: u32, recursive: bool) {
        let d = &mut self.devices[dev as usize];
        let s = &mut d.sms[sm as usize];
        if recursive {
            for wp in &mut s.warps {
                wp.invalidate();
            }
        }
        s.valid_warps_mask = None;
        s.broken_warps_mask = None;
    }

    // ------------------------------------------------------------------
    // Warp
    // ------------------------------------------------------------------

    pub fn warp_is_valid(&mut self, dev: u32, sm: u32, wp: u32) -> Result<bool> {
        self.check_warp(dev, sm, wp)?;
        Ok(self.sm_valid_warps_mask(dev, sm)?[wp as usize])
    }

    pub fn warp_is_broken(&mut self, dev: u32, sm: u32, wp: u32) -> Result<bool> {
        self.check_warp(dev, sm, wp)?;
        Ok(self.sm_broken_warps_mask(dev, sm)?[wp as usize])
    }

    /// Invalidating a warp also drops the warp masks of the owning SM.
    pub fn warp_invalidate(&mut self, dev: u32, sm: u32, wp: u32) {
        let d = &mut self.devices[dev as usize];
        let s = &mut d.sms[sm as usize];
        s.warps[wp as usize].invalidate();
        s.valid_warps_mask = None;
        s.broken_warps_mask = None;
    }

    /// Single-steps one warp. The returned mask dominates the set of warps
    /// whose cache entries were dropped; stepping beyond the requested warp
    /// degrades to a full device invalidation, as does software preemption.
    pub fn warp_single_step(&mut self, dev: u32, sm: u32, wp: u32) -> Result<WarpMask> {
        log::debug!(
            "{}",
            style(format!("device {dev} sm {sm} warp {wp}: single-step")).yellow()
        );
        self.check_warp(dev, sm, wp)?;
        let mask = self.api.single_step_warp(dev, sm, wp)?;
        if self.options.software_preemption {
            self.device_invalidate(dev);
            return Ok(mask);
        }
        let mut others = mask;
        others.set(wp as usize, false);
        if others.any() {
            log::warn!("warp(s) other than the current warp had to be single-stepped");
            self.device_invalidate(dev);
            return Ok(mask);
        }
        for stepped in mask.iter_ones() {
            self.warp_invalidate(dev, sm, stepped as u32);
        }
        // the warp masks of the SM may have changed under us
        self.sm_invalidate(dev, sm, false);
        Ok(mask)
    }

    pub fn warp_grid_id(&mut self, dev: u32, sm: u32, wp: u32) -> Result<u64> {
        self.check_warp(dev, sm, wp)?;
        if self.api.is_remote()
            && self.devices[dev as usize].sms[sm as usize].warps[wp as usize]
                .grid_id
                .is_none()
            && self.sm_is_valid(dev, sm)?
        {
            self.update_grid_ids_in_sm(dev, sm)?;
        }
        if let Some(id) = self.devices[dev as usize].sms[sm as usize].warps[wp as usize].grid_id {
            return Ok(id);
        }
        let id = self.api.grid_id(dev, sm, wp)?;
        self.devices[dev as usize].sms[sm as usize].warps[wp as usize].grid_id = Some(id);
        Ok(id)
    }

    /// Kernel registered for the warp's grid, looked up by id through the
    /// registry (warps never own kernels). With deferred launch
    /// notifications the kernel is created on first observation.
    pub fn warp_kernel(&mut self, dev: u32, sm: u32, wp: u32) -> Result<Option<u64>> {
        self.check_warp(dev, sm, wp)?;
        {
            let w = &self.devices[dev as usize].sms[sm as usize].warps[wp as usize];
            if w.kernel_p {
                return Ok(w.kernel);
            }
        }
        let grid_id = self.warp_grid_id(dev, sm, wp)?;
        let mut kernel = self.kernels.find_by_grid_id(dev, grid_id).map(|k| k.id);
        if kernel.is_none() && self.options.defer_kernel_launch_notifications {
            self.create_kernel_from_grid_info(dev, grid_id)?;
            kernel = self.kernels.find_by_grid_id(dev, grid_id).map(|k| k.id);
        }
        let w = &mut self.devices[dev as usize].sms[sm as usize].warps[wp as usize];
        w.kernel_p = true;
        w.kernel = kernel;
        Ok(kernel)
    }

    pub fn warp_block_idx(&mut self, dev: u32, sm: u32, wp: u32) -> Result<Dim3> {
        self.check_warp(dev, sm, wp)?;
        if self.api.is_remote()
            && self.devices[dev as usize].sms[sm as usize].warps[wp as usize]
                .block_idx
                .is_none()
            && self.sm_is_valid(dev, sm)?
        {
            self.update_block_indices_in_sm(dev, sm)?;
        }
        if let Some(idx) = self.devices[dev as usize].sms[sm as usize].warps[wp as usize].block_idx
        {
            return Ok(idx);
        }
        let idx = self.api.block_idx(dev, sm, wp)?;
        self.devices[dev as usize].sms[sm as usize].warps[wp as usize].block_idx = Some(idx);
        Ok(idx)
    }

    pub fn warp_valid_lanes_mask(&mut self, dev: u32, sm: u32, wp: u32) -> Result<LaneMask> {
        self.check_warp(dev, sm, wp)?;
        if let Some(mask) = self.devices[dev as usize].sms[sm as usize].warps[wp as usize]
            .valid_lanes_mask
        {
            return Ok(mask);
        }
        let mask = if self.warp_is_valid(dev, sm, wp)? {
            self.api.valid_lanes(dev, sm, wp)?
        } else {
            LaneMask::ZERO
        };
        let clock = self.clock;
        let w = &mut self.devices[dev as usize].sms[sm as usize].warps[wp as usize];
        w.valid_lanes_mask = Some(mask);
        if w.timestamp.is_none() {
            w.timestamp = Some(clock);
        }
        Ok(mask)
    }

    pub fn warp_active_lanes_mask(&mut self, dev: u32, sm: u32, wp: u32) -> Result<LaneMask> {
        self.check_warp(dev, sm, wp)?;
        if let Some(mask) = self.devices[dev as usize].sms[sm as usize].warps[wp as usize]
            .active_lanes_mask
        {
            return Ok(mask);
        }
        let mask = self.api.active_lanes(dev, sm, wp)?;
        self.devices[dev as usize].sms[sm as usize].warps[wp as usize].active_lanes_mask =
            Some(mask);
        Ok(mask)
    }

    /// Valid but not active.
    pub fn warp_divergent_lanes_mask(&mut self, dev: u32, sm: u32, wp: u32) -> Result<LaneMask> {
        let valid = self.warp_valid_lanes_mask(dev, sm, wp)?;
        let active = self.warp_active_lanes_mask(dev, sm, wp)?;
        let mut divergent = LaneMask::ZERO;
        for ln in valid.iter_ones() {
            if !active[ln] {
                divergent.set(ln, true);
            }
        }
        Ok(divergent)
    }

    pub fn warp_lowest_active_lane(&mut self, dev: u32, sm: u32, wp: u32) -> Result<u32> {
        let active = self.warp_active_lanes_mask(dev, sm, wp)?;
        active
            .first_one()
            .map(|ln| ln as u32)
            .ok_or_else(|| Error::NotFound(format!("active lane in device {dev} sm {sm} warp {wp}")))
    }

    /// PC of the lowest active lane, which all active lanes share.
    pub fn warp_active_pc(&mut self, dev: u32, sm: u32, wp: u32) -> Result<u64> {
        let ln = self.warp_lowest_active_lane(dev, sm, wp)?;
        self.lane_pc(dev, sm, wp, ln)
    }

    pub fn warp_active_virtual_pc(&mut self, dev: u32, sm: u32, wp: u32) -> Result<u64> {
        let ln = self.warp_lowest_active_lane(dev, sm, wp)?;
        self.lane_virtual_pc(dev, sm, wp, ln)
    }

    pub fn warp_timestamp(&mut self, dev: u32, sm: u32, wp: u32) -> Result<Clock> {
        self.warp_valid_lanes_mask(dev, sm, wp)?;
        Ok(self.devices[dev as usize].sms[sm as usize].warps[wp as usize]
            .timestamp
            .expect("stamped on first mask observation"))
    }

    // ------------------------------------------------------------------
    // Lane
    // ------------------------------------------------------------------

    /// Validity query; also stamps the lane's observation clock, so that
    /// staleness is measured from the first time anyone looked.
    pub fn lane_is_valid(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> Result<bool> {
        self.check_lane(dev, sm, wp, ln)?;
        let mask = self.warp_valid_lanes_mask(dev, sm, wp)?;
        let clock = self.clock;
        let lane =
            &mut self.devices[dev as usize].sms[sm as usize].warps[wp as usize].lanes[ln as usize];
        if lane.timestamp.is_none() {
            lane.timestamp = Some(clock);
        }
        Ok(mask[ln as usize])
    }

    pub fn lane_is_active(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> Result<bool> {
        self.assert_lane_valid(dev, sm, wp, ln)?;
        Ok(self.warp_active_lanes_mask(dev, sm, wp)?[ln as usize])
    }

    pub fn lane_is_divergent(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> Result<bool> {
        self.assert_lane_valid(dev, sm, wp, ln)?;
        Ok(self.warp_divergent_lanes_mask(dev, sm, wp)?[ln as usize])
    }

    pub fn lane_thread_idx(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> Result<Dim3> {
        self.assert_lane_valid(dev, sm, wp, ln)?;
        // a remote session fetches the thread index of every valid lane of
        // the warp in one packet
        if self.api.is_remote()
            && self.devices[dev as usize].sms[sm as usize].warps[wp as usize].lanes[ln as usize]
                .thread_idx
                .is_none()
            && self.warp_is_valid(dev, sm, wp)?
        {
            self.update_thread_indices_in_warp(dev, sm, wp)?;
        }
        if let Some(idx) = self.devices[dev as usize].sms[sm as usize].warps[wp as usize].lanes
            [ln as usize]
            .thread_idx
        {
            return Ok(idx);
        }
        let idx = self.api.thread_idx(dev, sm, wp, ln)?;
        self.devices[dev as usize].sms[sm as usize].warps[wp as usize].lanes[ln as usize]
            .thread_idx = Some(idx);
        Ok(idx)
    }

    pub fn lane_pc(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> Result<u64> {
        self.assert_lane_valid(dev, sm, wp, ln)?;
        if let Some(pc) =
            self.devices[dev as usize].sms[sm as usize].warps[wp as usize].lanes[ln as usize].pc
        {
            return Ok(pc);
        }
        let pc = self.api.pc(dev, sm, wp, ln)?;
        self.devices[dev as usize].sms[sm as usize].warps[wp as usize].lanes[ln as usize].pc =
            Some(pc);
        // all active lanes of a warp share one PC
        if self.lane_is_active(dev, sm, wp, ln)? {
            self.share_pc_with_active_lanes(dev, sm, wp, pc, false)?;
        }
        Ok(pc)
    }

    pub fn lane_virtual_pc(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> Result<u64> {
        self.assert_lane_valid(dev, sm, wp, ln)?;
        if let Some(pc) = self.devices[dev as usize].sms[sm as usize].warps[wp as usize].lanes
            [ln as usize]
            .virtual_pc
        {
            return Ok(pc);
        }
        let pc = self.api.virtual_pc(dev, sm, wp, ln)?;
        self.devices[dev as usize].sms[sm as usize].warps[wp as usize].lanes[ln as usize]
            .virtual_pc = Some(pc);
        if self.lane_is_active(dev, sm, wp, ln)? {
            self.share_pc_with_active_lanes(dev, sm, wp, pc, true)?;
        }
        Ok(pc)
    }

    pub fn lane_exception(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> Result<ExceptionKind> {
        self.assert_lane_valid(dev, sm, wp, ln)?;
        if let Some(e) = self.devices[dev as usize].sms[sm as usize].warps[wp as usize].lanes
            [ln as usize]
            .exception
        {
            return Ok(e);
        }
        let e = self.api.lane_exception(dev, sm, wp, ln)?;
        self.devices[dev as usize].sms[sm as usize].warps[wp as usize].lanes[ln as usize]
            .exception = Some(e);
        Ok(e)
    }

    pub fn lane_register(&mut self, dev: u32, sm: u32, wp: u32, ln: u32, regno: u32) -> Result<u32> {
        self.assert_lane_valid(dev, sm, wp, ln)?;
        Ok(self.api.register(dev, sm, wp, ln, regno)?)
    }

    pub fn lane_call_depth(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> Result<i32> {
        self.assert_lane_valid(dev, sm, wp, ln)?;
        Ok(self.api.call_depth(dev, sm, wp, ln)?)
    }

    pub fn lane_syscall_call_depth(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> Result<i32> {
        self.assert_lane_valid(dev, sm, wp, ln)?;
        Ok(self.api.syscall_call_depth(dev, sm, wp, ln)?)
    }

    pub fn lane_virtual_return_address(
        &mut self,
        dev: u32,
        sm: u32,
        wp: u32,
        ln: u32,
        level: i32,
    ) -> Result<u64> {
        self.assert_lane_valid(dev, sm, wp, ln)?;
        Ok(self.api.virtual_return_address(dev, sm, wp, ln, level)?)
    }

    pub fn lane_timestamp(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> Result<Clock> {
        self.assert_lane_valid(dev, sm, wp, ln)?;
        Ok(
            self.devices[dev as usize].sms[sm as usize].warps[wp as usize].lanes[ln as usize]
                .timestamp
                .expect("stamped by lane_is_valid"),
        )
    }

    /// Error address and segment for a lane stopped on an illegal-address
    /// exception; zero otherwise.
    pub fn lane_memcheck_error_address(
        &mut self,
        dev: u32,
        sm: u32,
        wp: u32,
        ln: u32,
    ) -> Result<(u64, MemorySegment)> {
        self.assert_lane_valid(dev, sm, wp, ln)?;
        let exception = self.lane_exception(dev, sm, wp, ln)?;
        if !exception.has_error_address() {
            return Ok((0, MemorySegment::Unspecified));
        }
        Ok(self.api.memcheck_error_address(dev, sm, wp, ln)?)
    }

    // ------------------------------------------------------------------
    // Kernel-derived state
    // ------------------------------------------------------------------

    /// Is any warp currently running this kernel's grid? Cached per kernel
    /// until the next invalidation.
    pub fn kernel_is_present(&mut self, kernel_id: u64) -> Result<bool> {
        let Some(kernel) = self.kernels.get(kernel_id) else {
            return Ok(false);
        };
        if let Some(p) = kernel.present {
            return Ok(p);
        }
        let (dev, grid_id, alive) = (kernel.dev_id, kernel.grid_id, kernel.alive);
        let present = alive && self.grid_has_warps(dev, grid_id)?;
        if let Some(kernel) = self.kernels.get_mut(kernel_id) {
            kernel.present = Some(present);
        }
        Ok(present)
    }

    /// Mask of SMs with at least one warp of this kernel's grid.
    pub fn kernel_sms_mask(&mut self, kernel_id: u64) -> Result<SmMask> {
        let mut mask = SmMask::ZERO;
        let Some(kernel) = self.kernels.get(kernel_id) else {
            return Ok(mask);
        };
        let (dev, grid_id) = (kernel.dev_id, kernel.grid_id);
        for sm in 0..self.device_num_sms(dev)? {
            let warps = self.sm_valid_warps_mask(dev, sm)?;
            for wp in warps.iter_ones() {
                if self.warp_grid_id(dev, sm, wp as u32)? == grid_id {
                    mask.set(sm as usize, true);
                    break;
                }
            }
        }
        Ok(mask)
    }

    fn grid_has_warps(&mut self, dev: u32, grid_id: u64) -> Result<bool> {
        for sm in 0..self.device_num_sms(dev)? {
            let warps = self.sm_valid_warps_mask(dev, sm)?;
            for wp in warps.iter_ones() {
                if self.warp_grid_id(dev, sm, wp as u32)? == grid_id {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Registers a kernel from the debug API's grid information, used when
    /// launch notifications are deferred.
    pub(crate) fn create_kernel_from_grid_info(&mut self, dev: u32, grid_id: u64) -> Result<u64> {
        let info = self.api.grid_info(dev, grid_id)?;
        Ok(self.kernels.start(KernelLaunch {
            dev_id: dev,
            grid_id,
            entry: info.function_entry,
            context_id: info.context_id,
            module_id: info.module_id,
            grid_dim: info.grid_dim,
            block_dim: info.block_dim,
            kind: info.kind,
            origin: info.origin,
            parent_grid_id: info.parent_grid_id,
        }))
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn check_dev(&mut self, dev: u32) -> Result<()> {
        let n = self.num_devices()?;
        assert!(dev < n, "device {dev} out of range");
        Ok(())
    }

    fn check_sm(&mut self, dev: u32, sm: u32) -> Result<()> {
        self.ensure_shape(dev)?;
        assert!(sm < self.device_num_sms(dev)?, "sm {sm} out of range");
        Ok(())
    }

    fn check_warp(&mut self, dev: u32, sm: u32, wp: u32) -> Result<()> {
        self.check_sm(dev, sm)?;
        assert!(wp < self.device_num_warps(dev)?, "warp {wp} out of range");
        Ok(())
    }

    fn check_lane(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> Result<()> {
        self.check_warp(dev, sm, wp)?;
        assert!(ln < self.device_num_lanes(dev)?, "lane {ln} out of range");
        Ok(())
    }

    fn assert_lane_valid(&mut self, dev: u32, sm: u32, wp: u32, ln: u32) -> Result<()> {
        let valid = self.lane_is_valid(dev, sm, wp, ln)?;
        assert!(valid, "device {dev} sm {sm} warp {wp} lane {ln} is not valid");
        Ok(())
    }

    /// Sizes the per-device vectors once the shape is known.
    fn ensure_shape(&mut self, dev: u32) -> Result<()> {
        self.check_dev(dev)?;
        let num_sms = self.device_num_sms(dev)? as usize;
        let num_warps = self.device_num_warps(dev)? as usize;
        let num_lanes = self.device_num_lanes(dev)? as usize;
        let d = &mut self.devices[dev as usize];
        if d.sms.len() != num_sms {
            d.sms.resize_with(num_sms, SmState::default);
        }
        for sm in &mut d.sms {
            if sm.warps.len() != num_warps {
                sm.warps.resize_with(num_warps, WarpState::default);
            }
            for wp in &mut sm.warps {
                if wp.lanes.len() != num_lanes {
                    wp.lanes.resize_with(num_lanes, LaneState::default);
                }
            }
        }
        Ok(())
    }

    fn share_pc_with_active_lanes(
        &mut self,
        dev: u32,
        sm: u32,
        wp: u32,
        pc: u64,
        virtual_pc: bool,
    ) -> Result<()> {
        let valid = self.warp_valid_lanes_mask(dev, sm, wp)?;
        let active = self.warp_active_lanes_mask(dev, sm, wp)?;
        let warp = &mut self.devices[dev as usize].sms[sm as usize].warps[wp as usize];
        for ln in active.iter_ones() {
            if !valid[ln] {
                continue;
            }
            let lane = &mut warp.lanes[ln];
            if virtual_pc {
                lane.virtual_pc = Some(pc);
            } else {
                lane.pc = Some(pc);
            }
        }
        Ok(())
    }

    fn update_grid_ids_in_sm(&mut self, dev: u32, sm: u32) -> Result<()> {
        let entries = self.api.sm_grid_ids(dev, sm)?;
        for (wp, grid_id) in entries {
            assert!(wp < self.device_num_warps(dev)?, "warp {wp} out of range");
            self.devices[dev as usize].sms[sm as usize].warps[wp as usize].grid_id = Some(grid_id);
        }
        Ok(())
    }

    fn update_block_indices_in_sm(&mut self, dev: u32, sm: u32) -> Result<()> {
        let entries = self.api.sm_block_indices(dev, sm)?;
        for (wp, block_idx) in entries {
            assert!(wp < self.device_num_warps(dev)?, "warp {wp} out of range");
            self.devices[dev as usize].sms[sm as usize].warps[wp as usize].block_idx =
                Some(block_idx);
        }
        Ok(())
    }

    fn update_thread_indices_in_warp(&mut self, dev: u32, sm: u32, wp: u32) -> Result<()> {
        let entries = self.api.warp_thread_indices(dev, sm, wp)?;
        for (ln, thread_idx) in entries {
            assert!(ln < self.device_num_lanes(dev)?, "lane {ln} out of range");
            self.devices[dev as usize].sms[sm as usize].warps[wp as usize].lanes[ln as usize]
                .thread_idx = Some(thread_idx);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{init_test, FakeApi};
    use color_eyre::eyre;
    use pretty_assertions_sorted as diff;

    fn two_warp_system() -> System<FakeApi> {
        let mut api = FakeApi::new();
        api.add_device(2, 4, 8);
        api.place_warp(0, 0, 0, 11, Dim3::ZERO, 0xff, 0x0f, 0x1000);
        api.place_warp(0, 1, 2, 11, Dim3::new(1, 0, 0), 0xff, 0xff, 0x2000);
        let mut sys = System::new(api, Options::default());
        crate::testing::seed_context(&mut sys, 0, 0xa, 17);
        sys
    }

    #[test]
    fn getters_fetch_once() -> eyre::Result<()> {
        init_test();
        let mut sys = two_warp_system();
        let first = sys.sm_valid_warps_mask(0, 0)?;
        let again = sys.sm_valid_warps_mask(0, 0)?;
        diff::assert_eq!(first, again);
        assert_eq!(sys.api.calls("valid_warps"), 1);

        sys.warp_block_idx(0, 0, 0)?;
        sys.warp_block_idx(0, 0, 0)?;
        assert_eq!(sys.api.calls("block_idx"), 1);
        Ok(())
    }

    #[test]
    fn resume_clears_every_presence_bit() -> eyre::Result<()> {
        init_test();
        let mut sys = two_warp_system();
        sys.device_suspend(0)?;
        sys.warp_block_idx(0, 0, 0)?;
        sys.lane_pc(0, 0, 0, 0)?;
        assert!(sys.device_is_valid(0)?);

        sys.device_resume(0)?;
        // the next reads go back to the API
        sys.warp_block_idx(0, 0, 0)?;
        sys.lane_pc(0, 0, 0, 0)?;
        assert!(sys.device_is_valid(0)?);
        assert_eq!(sys.api.calls("block_idx"), 2);
        assert_eq!(sys.api.calls("pc"), 2);
        assert_eq!(sys.api.calls("valid_warps"), 2);
        Ok(())
    }

    #[test]
    fn suspend_resume_tracks_mask_and_clock() -> eyre::Result<()> {
        init_test();
        let mut sys = two_warp_system();
        assert_eq!(sys.clock(), 0);
        sys.device_suspend(0)?;
        assert_eq!(sys.suspended_devices_mask(), 0b1);
        assert_eq!(sys.clock(), 1);
        sys.device_resume(0)?;
        assert_eq!(sys.suspended_devices_mask(), 0);
        // resuming a non-suspended device does not reach the API
        sys.device_resume(0)?;
        assert_eq!(sys.api.calls("resume_device"), 1);
        Ok(())
    }

    #[test]
    fn active_lanes_share_fetched_pc() -> eyre::Result<()> {
        init_test();
        let mut sys = two_warp_system();
        // lanes 0..=3 are active in warp (0,0,0)
        let pc = sys.lane_pc(0, 0, 0, 1)?;
        for ln in 0..4 {
            diff::assert_eq!(sys.lane_pc(0, 0, 0, ln)?, pc);
        }
        assert_eq!(sys.api.calls("pc"), 1);
        // a divergent lane has its own PC
        sys.lane_pc(0, 0, 0, 5)?;
        assert_eq!(sys.api.calls("pc"), 2);
        Ok(())
    }

    #[test]
    fn divergent_is_valid_and_not_active() -> eyre::Result<()> {
        init_test();
        let mut sys = two_warp_system();
        let divergent = sys.warp_divergent_lanes_mask(0, 0, 0)?;
        assert_eq!(crate::api::lane_mask_bits(&divergent), 0xf0);
        assert!(sys.lane_is_divergent(0, 0, 0, 4)?);
        assert!(!sys.lane_is_divergent(0, 0, 0, 0)?);
        Ok(())
    }

    #[test]
    fn single_step_invalidates_stepped_warp_only() -> eyre::Result<()> {
        init_test();
        let mut sys = two_warp_system();
        sys.warp_block_idx(0, 0, 0)?;
        sys.warp_block_idx(0, 1, 2)?;

        let mask = sys.warp_single_step(0, 0, 0)?;
        assert_eq!(crate::api::warp_mask_bits(&mask), 0b1);
        sys.warp_block_idx(0, 0, 0)?;
        sys.warp_block_idx(0, 1, 2)?;
        // warp (0,0,0) was re-fetched, warp (0,1,2) kept its entry
        assert_eq!(sys.api.calls("block_idx"), 3);
        Ok(())
    }

    #[test]
    fn single_step_superset_falls_back_to_device_invalidation() -> eyre::Result<()> {
        init_test();
        let mut sys = two_warp_system();
        sys.warp_block_idx(0, 1, 2)?;
        let mut stepped = WarpMask::ZERO;
        stepped.set(0, true);
        stepped.set(3, true);
        sys.api.stepped_mask = Some(stepped);

        sys.warp_single_step(0, 0, 0)?;
        sys.warp_block_idx(0, 1, 2)?;
        assert_eq!(sys.api.calls("block_idx"), 2);
        Ok(())
    }

    #[test]
    fn software_preemption_always_invalidates_the_device() -> eyre::Result<()> {
        init_test();
        let mut sys = two_warp_system();
        sys.options.software_preemption = true;
        sys.warp_block_idx(0, 1, 2)?;
        sys.warp_single_step(0, 0, 0)?;
        sys.warp_block_idx(0, 1, 2)?;
        assert_eq!(sys.api.calls("block_idx"), 2);
        Ok(())
    }

    #[test]
    fn exception_filter_stamps_clean_sms() -> eyre::Result<()> {
        init_test();
        let mut sys = two_warp_system();
        // only SM 1 reports exception state
        let mut mask = SmMask::ZERO;
        mask.set(1, true);
        sys.api.exception_sm_mask = Some(mask);

        sys.device_filter_exception_state(0)?;
        diff::assert_eq!(sys.lane_exception(0, 0, 0, 0)?, ExceptionKind::None);
        assert_eq!(sys.api.calls("lane_exception"), 0);
        // second filtering pass within the same stop is free
        sys.device_filter_exception_state(0)?;
        assert_eq!(sys.api.calls("device_exception_state"), 1);
        // lanes of the flagged SM still read through
        sys.lane_exception(0, 1, 2, 0)?;
        assert_eq!(sys.api.calls("lane_exception"), 1);
        Ok(())
    }

    #[test]
    fn lane_is_valid_stamps_timestamp_eagerly() -> eyre::Result<()> {
        init_test();
        let mut sys = two_warp_system();
        sys.device_suspend(0)?;
        sys.lane_is_valid(0, 0, 0, 6)?;
        assert_eq!(sys.lane_timestamp(0, 0, 0, 6)?, 1);
        Ok(())
    }

    #[test]
    fn remote_batches_thread_indices_per_warp() -> eyre::Result<()> {
        init_test();
        let mut sys = two_warp_system();
        sys.api.remote = true;
        sys.lane_thread_idx(0, 0, 0, 0)?;
        for ln in 0..8 {
            sys.lane_thread_idx(0, 0, 0, ln)?;
        }
        assert_eq!(sys.api.calls("warp_thread_indices"), 1);
        assert_eq!(sys.api.calls("thread_idx"), 0);
        Ok(())
    }

    #[test]
    fn kernel_presence_follows_grid_occupancy() -> eyre::Result<()> {
        init_test();
        let mut sys = two_warp_system();
        let id = sys.kernels.start(crate::kernels::KernelLaunch {
            dev_id: 0,
            grid_id: 11,
            entry: 0x1000,
            context_id: 0xa,
            module_id: 1,
            grid_dim: Dim3::new(4, 1, 1),
            block_dim: Dim3::new(8, 1, 1),
            kind: crate::api::KernelKind::Application,
            origin: crate::api::KernelOrigin::Cpu,
            parent_grid_id: None,
        });
        assert!(sys.kernel_is_present(id)?);
        let mask = sys.kernel_sms_mask(id)?;
        assert_eq!(crate::api::sm_mask_bits(&mask), 0b11);

        sys.kernels.terminate(0, 11);
        assert!(!sys.kernel_is_present(id)?);
        Ok(())
    }

    #[test]
    fn deferred_launch_creates_kernel_from_grid_info() -> eyre::Result<()> {
        init_test();
        let mut sys = two_warp_system();
        sys.options.defer_kernel_launch_notifications = true;
        sys.api.grids.insert(
            (0, 11),
            crate::api::GridInfo {
                function_entry: 0x1000,
                context_id: 0xa,
                module_id: 1,
                grid_dim: Dim3::new(4, 1, 1),
                block_dim: Dim3::new(8, 1, 1),
                kind: crate::api::KernelKind::Application,
                parent_grid_id: None,
                origin: crate::api::KernelOrigin::Cpu,
            },
        );
        let kernel = sys.warp_kernel(0, 0, 0)?;
        assert!(kernel.is_some());
        assert_eq!(sys.api.calls("grid_info"), 1);
        // the lookup is cached with the warp entry
        sys.warp_kernel(0, 0, 0)?;
        assert_eq!(sys.api.calls("grid_info"), 1);
        Ok(())
    }

    #[test]
    fn unknown_grid_without_deferral_stays_unknown() -> eyre::Result<()> {
        init_test();
        let mut sys = two_warp_system();
        assert_eq!(sys.warp_kernel(0, 0, 0)?, None);
        assert_eq!(sys.api.calls("grid_info"), 0);
        Ok(())
    }

    #[test]
    fn memcheck_address_only_read_on_illegal_address() -> eyre::Result<()> {
        init_test();
        let mut sys = two_warp_system();
        assert_eq!(
            sys.lane_memcheck_error_address(0, 0, 0, 0)?,
            (0, MemorySegment::Unspecified)
        );
        assert_eq!(sys.api.calls("memcheck_error_address"), 0);

        sys.api.devices[0].sms[0].warps[0].lanes[1].exception = ExceptionKind::IllegalAddress;
        sys.api.devices[0].sms[0].warps[0].lanes[1].error_address =
            Some((0x7000_0000, MemorySegment::Global));
        sys.warp_invalidate(0, 0, 0);
        assert_eq!(
            sys.lane_memcheck_error_address(0, 0, 0, 1)?,
            (0x7000_0000, MemorySegment::Global)
        );
        Ok(())
    }

    #[test]
    fn register_and_call_depth_reads_pass_through() -> eyre::Result<()> {
        init_test();
        let mut sys = two_warp_system();
        assert_eq!(sys.lane_register(0, 0, 0, 2, 5)?, 205);
        assert_eq!(sys.lane_call_depth(0, 0, 0, 2)?, 0);
        assert_eq!(sys.lane_syscall_call_depth(0, 0, 0, 2)?, 0);
        assert_eq!(sys.lane_virtual_return_address(0, 0, 0, 2, 3)?, 0xdead_0003);
        // none of these are cached
        sys.lane_register(0, 0, 0, 2, 5)?;
        assert_eq!(sys.api.calls("register"), 2);
        Ok(())
    }

    #[test]
    fn remote_batches_block_indices_and_grid_ids() -> eyre::Result<()> {
        init_test();
        let mut sys = two_warp_system();
        sys.api.remote = true;
        sys.warp_block_idx(0, 0, 0)?;
        sys.warp_grid_id(0, 0, 0)?;
        assert_eq!(sys.api.calls("sm_block_indices"), 1);
        assert_eq!(sys.api.calls("sm_grid_ids"), 1);
        assert_eq!(sys.api.calls("block_idx"), 0);
        assert_eq!(sys.api.calls("grid_id"), 0);
        Ok(())
    }

    #[test]
    fn remote_spec_seeds_the_sizing_cache() -> eyre::Result<()> {
        init_test();
        let mut sys = two_warp_system();
        sys.api.remote = true;
        sys.set_device_spec(0, 2, 4, 8, 255, "RemoteAccel", "sm_90")?;
        assert_eq!(sys.device_num_sms(0)?, 2);
        assert_eq!(sys.device_type(0)?, "RemoteAccel");
        assert_eq!(sys.device_num_registers(0)?, 255);
        assert_eq!(sys.api.calls("num_sms"), 0);
        assert_eq!(sys.api.calls("device_type"), 0);
        Ok(())
    }

    #[test]
    fn breakpoint_sweeps_walk_every_context() -> eyre::Result<()> {
        init_test();
        use crate::contexts::{ElfImage, Module};
        use std::sync::Arc;
        let mut sys = two_warp_system();
        let image = ElfImage {
            data: Arc::new(vec![0x7f, b'E', b'L', b'F']),
            code_start: 0x1000,
            code_size: 0x100,
        };
        sys.contexts_mut(0)?
            .find_by_id_mut(0xa)
            .expect("seeded")
            .add_module(Module {
                id: 1,
                context_id: 0xa,
                image,
            });

        let mut host = crate::testing::FakeHost::new(&[17]);
        sys.resolve_breakpoints(&mut host)?;
        assert_eq!(host.resolved_images, 1);
        sys.cleanup_breakpoints(&mut host)?;
        assert_eq!(host.cleaned_contexts, vec![0xa]);
        assert_eq!(sys.find_context_by_addr(0x1080), Some((0, 0xa)));

        sys.cleanup_contexts()?;
        assert!(!sys.device_is_any_context_present(0));
        Ok(())
    }

    #[test]
    fn is_broken_at_honors_timestamps() -> eyre::Result<()> {
        init_test();
        let mut sys = two_warp_system();
        sys.api.devices[0].sms[0].warps[0].broken = true;
        sys.device_suspend(0)?; // clock -> 1
        assert!(sys.is_broken_at(1)?);
        // observations stamped at clock 1 are older than clock 2
        assert!(!sys.is_broken_at(2)?);
        Ok(())
    }
}
