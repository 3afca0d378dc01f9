//! Enumeration of coordinates matching a filter, at a chosen granularity,
//! pruned through the state cache: a warp absent from its SM's valid-warps
//! mask is never visited unless the caller asks for everything.
//!
//! The sequence is materialized at construction time (sizing queries are
//! answered up front) and iterated without further device traffic; the
//! iterator is restartable and re-creating it from the same filter yields
//! the same sequence modulo live-state changes.

use crate::api::DebugApi;
use crate::coords::{CoordValue, Coords};
use crate::state::System;
use crate::Result;
use itertools::Itertools;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Devices,
    Sms,
    Warps,
    Lanes,
    Kernels,
    Blocks,
    Threads,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Select {
    /// Every coordinate in range, live or not.
    All,
    /// Only live coordinates.
    Valid,
    /// Only coordinates stopped at a stop-worthy event.
    Broken,
}

#[derive(Debug)]
pub struct CoordIterator {
    coords: Vec<Coords>,
    pos: usize,
}

impl CoordIterator {
    pub fn new<A: DebugApi>(
        sys: &mut System<A>,
        granularity: Granularity,
        filter: &Coords,
        select: Select,
    ) -> Result<Self> {
        let coords = match granularity {
            Granularity::Devices => collect_devices(sys, filter, select)?,
            Granularity::Sms => collect_sms(sys, filter, select)?,
            Granularity::Warps => collect_warps(sys, filter, select)?,
            Granularity::Lanes => collect_lanes(sys, filter, select, false)?,
            Granularity::Kernels => collect_kernels(sys, filter, select)?,
            Granularity::Blocks => collect_blocks(sys, filter, select)?,
            Granularity::Threads => collect_lanes(sys, filter, select, true)?,
        };
        Ok(Self { coords, pos: 0 })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.coords.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    /// Rewinds to the first coordinate.
    pub fn restart(&mut self) {
        self.pos = 0;
    }
}

impl Iterator for CoordIterator {
    type Item = Coords;

    fn next(&mut self) -> Option<Coords> {
        let c = self.coords.get(self.pos).copied();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }
}

/// Does the filter constrain any logical axis? If so the logical state of
/// every visited warp must be fetched to decide membership.
fn constrains_logical(filter: &Coords) -> bool {
    !filter.kernel_id.is_wildcard()
        || !filter.grid_id.is_wildcard()
        || !filter.block_idx.is_wildcard()
        || !filter.thread_idx.is_wildcard()
}

fn collect_devices<A: DebugApi>(
    sys: &mut System<A>,
    filter: &Coords,
    select: Select,
) -> Result<Vec<Coords>> {
    let mut out = Vec::new();
    for dev in 0..sys.num_devices()? {
        let keep = match select {
            Select::All => true,
            Select::Valid => sys.device_is_valid(dev)?,
            Select::Broken => device_has_broken_warp(sys, dev)?,
        };
        if !keep {
            continue;
        }
        let mut c = Coords::wildcard();
        c.dev = CoordValue::Concrete(dev);
        if filter.matches(&c) {
            out.push(c);
        }
    }
    Ok(out)
}

fn device_has_broken_warp<A: DebugApi>(sys: &mut System<A>, dev: u32) -> Result<bool> {
    if !sys.device_is_any_context_present(dev) {
        return Ok(false);
    }
    for sm in 0..sys.device_num_sms(dev)? {
        if sys.sm_broken_warps_mask(dev, sm)?.any() {
            return Ok(true);
        }
    }
    Ok(false)
}

fn collect_sms<A: DebugApi>(
    sys: &mut System<A>,
    filter: &Coords,
    select: Select,
) -> Result<Vec<Coords>> {
    let mut out = Vec::new();
    for dev in 0..sys.num_devices()? {
        if !filter.dev.admits(&CoordValue::Concrete(dev)) {
            continue;
        }
        for sm in 0..sys.device_num_sms(dev)? {
            let keep = match select {
                Select::All => true,
                Select::Valid => sys.sm_is_valid(dev, sm)?,
                Select::Broken => sys.sm_broken_warps_mask(dev, sm)?.any(),
            };
            if !keep {
                continue;
            }
            let mut c = Coords::wildcard();
            c.dev = CoordValue::Concrete(dev);
            c.sm = CoordValue::Concrete(sm);
            if filter.matches(&c) {
                out.push(c);
            }
        }
    }
    Ok(out)
}

fn collect_warps<A: DebugApi>(
    sys: &mut System<A>,
    filter: &Coords,
    select: Select,
) -> Result<Vec<Coords>> {
    let want_logical = constrains_logical(filter);
    let mut out = Vec::new();
    for dev in 0..sys.num_devices()? {
        if !filter.dev.admits(&CoordValue::Concrete(dev)) {
            continue;
        }
        for sm in 0..sys.device_num_sms(dev)? {
            if !filter.sm.admits(&CoordValue::Concrete(sm)) {
                continue;
            }
            let valid_mask = sys.sm_valid_warps_mask(dev, sm)?;
            for wp in 0..sys.device_num_warps(dev)? {
                if !filter.wp.admits(&CoordValue::Concrete(wp)) {
                    continue;
                }
                let valid = valid_mask[wp as usize];
                let keep = match select {
                    Select::All => true,
                    Select::Valid => valid,
                    Select::Broken => sys.warp_is_broken(dev, sm, wp)?,
                };
                if !keep {
                    continue;
                }
                let mut c = Coords::wildcard();
                c.dev = CoordValue::Concrete(dev);
                c.sm = CoordValue::Concrete(sm);
                c.wp = CoordValue::Concrete(wp);
                if valid && want_logical {
                    fill_warp_logical(sys, &mut c, dev, sm, wp)?;
                }
                if filter.matches(&c) {
                    out.push(c);
                }
            }
        }
    }
    Ok(out)
}

fn fill_warp_logical<A: DebugApi>(
    sys: &mut System<A>,
    c: &mut Coords,
    dev: u32,
    sm: u32,
    wp: u32,
) -> Result<()> {
    if let Some(kernel_id) = sys.warp_kernel(dev, sm, wp)? {
        c.kernel_id = CoordValue::Concrete(kernel_id);
    }
    c.grid_id = CoordValue::Concrete(sys.warp_grid_id(dev, sm, wp)?);
    c.block_idx = CoordValue::Concrete(sys.warp_block_idx(dev, sm, wp)?);
    Ok(())
}

/// Shared by the LANES and THREADS granularities; they enumerate the same
/// lanes but differ in ordering and in dropping never-valid slots.
fn collect_lanes<A: DebugApi>(
    sys: &mut System<A>,
    filter: &Coords,
    select: Select,
    logical_order: bool,
) -> Result<Vec<Coords>> {
    let mut out = Vec::new();
    for dev in 0..sys.num_devices()? {
        if !filter.dev.admits(&CoordValue::Concrete(dev)) {
            continue;
        }
        for sm in 0..sys.device_num_sms(dev)? {
            if !filter.sm.admits(&CoordValue::Concrete(sm)) {
                continue;
            }
            let valid_warps = sys.sm_valid_warps_mask(dev, sm)?;
            for wp in 0..sys.device_num_warps(dev)? {
                if !filter.wp.admits(&CoordValue::Concrete(wp)) {
                    continue;
                }
                let warp_valid = valid_warps[wp as usize];
                if !warp_valid && select != Select::All {
                    continue;
                }
                if select == Select::Broken && !sys.warp_is_broken(dev, sm, wp)? {
                    continue;
                }
                let valid_lanes = if warp_valid {
                    sys.warp_valid_lanes_mask(dev, sm, wp)?
                } else {
                    crate::api::LaneMask::ZERO
                };
                let mut warp_logical = Coords::wildcard();
                if warp_valid {
                    fill_warp_logical(sys, &mut warp_logical, dev, sm, wp)?;
                }
                for ln in 0..sys.device_num_lanes(dev)? {
                    if !filter.ln.admits(&CoordValue::Concrete(ln)) {
                        continue;
                    }
                    let lane_valid = valid_lanes[ln as usize];
                    if !lane_valid && select != Select::All {
                        continue;
                    }
                    let mut c = warp_logical;
                    c.dev = CoordValue::Concrete(dev);
                    c.sm = CoordValue::Concrete(sm);
                    c.wp = CoordValue::Concrete(wp);
                    c.ln = CoordValue::Concrete(ln);
                    if lane_valid {
                        c.thread_idx =
                            CoordValue::Concrete(sys.lane_thread_idx(dev, sm, wp, ln)?);
                    }
                    c.update_valid();
                    if filter.matches(&c) {
                        out.push(c);
                    }
                }
            }
        }
    }
    if logical_order {
        out.sort_by(|a, b| a.compare_logical(b).then_with(|| a.compare_physical(b)));
    }
    Ok(out)
}

fn collect_kernels<A: DebugApi>(
    sys: &mut System<A>,
    filter: &Coords,
    select: Select,
) -> Result<Vec<Coords>> {
    let kernels: Vec<(u64, u32, u64)> = sys
        .kernels
        .iter()
        .map(|k| (k.id, k.dev_id, k.grid_id))
        .collect();
    let mut out = Vec::new();
    for (id, dev, grid_id) in kernels {
        let keep = match select {
            Select::All => true,
            Select::Valid | Select::Broken => sys.kernel_is_present(id)?,
        };
        if !keep {
            continue;
        }
        let mut c = Coords::wildcard();
        c.dev = CoordValue::Concrete(dev);
        c.kernel_id = CoordValue::Concrete(id);
        c.grid_id = CoordValue::Concrete(grid_id);
        if filter.matches(&c) {
            out.push(c);
        }
    }
    Ok(out)
}

fn collect_blocks<A: DebugApi>(
    sys: &mut System<A>,
    filter: &Coords,
    select: Select,
) -> Result<Vec<Coords>> {
    let mut out = Vec::new();
    for dev in 0..sys.num_devices()? {
        if !filter.dev.admits(&CoordValue::Concrete(dev)) {
            continue;
        }
        for sm in 0..sys.device_num_sms(dev)? {
            if !filter.sm.admits(&CoordValue::Concrete(sm)) {
                continue;
            }
            let valid_warps = sys.sm_valid_warps_mask(dev, sm)?;
            for wp in valid_warps.iter_ones() {
                let wp = wp as u32;
                if select == Select::Broken && !sys.warp_is_broken(dev, sm, wp)? {
                    continue;
                }
                let mut c = Coords::wildcard();
                c.dev = CoordValue::Concrete(dev);
                c.sm = CoordValue::Concrete(sm);
                fill_warp_logical(sys, &mut c, dev, sm, wp)?;
                if filter.matches(&c) {
                    out.push(c);
                }
            }
        }
    }
    out.sort_by(|a, b| a.compare_logical(b).then_with(|| a.compare_physical(b)));
    let out = out
        .into_iter()
        .dedup_by(|a, b| a.kernel_id == b.kernel_id && a.block_idx == b.block_idx)
        .collect();
    Ok(out)
}
