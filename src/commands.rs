//! The user-facing command family: the `info` reports over every
//! granularity, focus switching, and focus queries. Tables are rendered
//! with right-aligned, width-fitted columns and per-group separator lines,
//! ready for the host debugger to print.

use crate::api::{lane_mask_bits, sm_mask_bits, warp_mask_bits, DebugApi};
use crate::coords::{find_valid, CoordValue, Coords, Dim3};
use crate::host::{HostDebugger, SourceLine};
use crate::iterator::{CoordIterator, Granularity, Select};
use crate::parser::{parse, CommandKind, DefaultMeta, Mode};
use crate::state::System;
use crate::{Error, Result};
use std::cmp::Ordering;
use std::str::FromStr;
use strum::{Display, EnumIter, EnumString};

/// The closed set of `info` reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, EnumIter, Display)]
#[strum(serialize_all = "lowercase")]
pub enum InfoKind {
    Devices,
    Sms,
    Warps,
    Lanes,
    Kernels,
    Blocks,
    Threads,
}

/// Runs a closure with the focus and current context saved around it,
/// restoring both on every exit path. Info commands may temporarily move
/// both while gathering rows.
pub fn with_saved_focus<A: DebugApi, R>(
    sys: &mut System<A>,
    f: impl FnOnce(&mut System<A>) -> Result<R>,
) -> Result<R> {
    let focus = sys.focus().copied();
    let context = sys.current_context();
    let result = f(sys);
    match focus {
        Some(c) => sys.set_focus(c),
        None => sys.clear_focus(),
    }
    sys.set_current_context(context);
    result
}

/// `info <kind> [filter]`, dispatched over the closed kind set.
pub fn info<A: DebugApi, H: HostDebugger>(
    sys: &mut System<A>,
    host: &mut H,
    kind: InfoKind,
    filter: &str,
) -> Result<String> {
    with_saved_focus(sys, |sys| match kind {
        InfoKind::Devices => info_devices(sys, filter),
        InfoKind::Sms => info_sms(sys, filter),
        InfoKind::Warps => info_warps(sys, filter),
        InfoKind::Lanes => info_lanes(sys, filter),
        InfoKind::Kernels => info_kernels(sys, host, filter),
        InfoKind::Blocks => info_blocks(sys, filter),
        InfoKind::Threads => info_threads(sys, host, filter),
    })
}

/// Entry point for a raw `info` argument string: first word picks the
/// report, the rest is the filter.
pub fn info_command<A: DebugApi, H: HostDebugger>(
    sys: &mut System<A>,
    host: &mut H,
    arg: &str,
) -> Result<String> {
    let arg = arg.trim();
    if arg.is_empty() {
        return Err(Error::Parse("missing option".into()));
    }
    let (word, rest) = arg.split_once(char::is_whitespace).unwrap_or((arg, ""));
    let kind = InfoKind::from_str(word)
        .map_err(|_| Error::Parse(format!("unrecognized option: '{word}'")))?;
    info(sys, host, kind, rest)
}

/// A per-axis command (`device 1`, `thread (7,0,0)`, bare `kernel`):
/// a switch when any value is explicit, a query otherwise.
pub fn axis_command<A: DebugApi, H: HostDebugger>(
    sys: &mut System<A>,
    host: &mut H,
    axis: &str,
    arg: &str,
) -> Result<String> {
    let input = format!("{axis} {arg}");
    let parsed = parse(&input, Mode::SwitchOrQuery, DefaultMeta::Wildcard)?;
    match parsed.kind {
        CommandKind::Query => query_focus(sys, &input),
        // an unsatisfiable switch keeps the focus and informs the user
        // rather than failing the command
        _ => match switch_focus(sys, host, &input) {
            Err(Error::Unsatisfiable) => {
                Ok("Request cannot be satisfied. Focus unchanged.".into())
            }
            other => other,
        },
    }
}

/// Applies a switch expression to the focus. Physical coordinates named in
/// the request take priority over logical ones when ranking candidates.
/// A best candidate that does not match every explicitly given component
/// is [`Error::Unsatisfiable`]; the focus is left untouched.
pub fn switch_focus<A: DebugApi, H: HostDebugger>(
    sys: &mut System<A>,
    host: &mut H,
    text: &str,
) -> Result<String> {
    let current = sys.focus().copied();
    let default_meta = if current.is_some() {
        DefaultMeta::Current
    } else {
        DefaultMeta::Wildcard
    };
    let parsed = parse(text, Mode::Switch, default_meta)?;

    // unspecified axes fall back to the current coordinates when focused
    let mut processed = current.unwrap_or_else(Coords::wildcard);
    parsed.apply_to(&mut processed);
    processed.evaluate_current(current.as_ref(), true)?;
    processed.check_fully_defined(false, false, true)?;

    let candidates = find_valid(sys, &processed, Select::Valid)?;
    let solution = if parsed.names_physical_axis() {
        candidates.closest_physical
    } else {
        candidates.closest_logical
    };

    // no candidate, or a candidate whose kernel is not registered yet
    let Some(solution) = solution.filter(|s| s.valid) else {
        return Ok("Invalid coordinates. Focus unchanged.".into());
    };
    if !parsed.satisfied_by(&solution) {
        return Err(Error::Unsatisfiable);
    }
    if current == Some(solution) {
        return Ok("Focus unchanged.".into());
    }
    sys.set_focus(solution);
    host.focus_changed(&solution);
    Ok(format!("[Switching focus to {}]", solution.fancy_string()))
}

/// Renders the requested components of the current focus.
pub fn query_focus<A: DebugApi>(sys: &mut System<A>, text: &str) -> Result<String> {
    let Some(focus) = sys.focus().copied() else {
        return Ok("Focus not set on any active kernel.".into());
    };
    let parsed = parse(text, Mode::Query, DefaultMeta::Current)?;
    let mut wished = Coords::wildcard();
    parsed.apply_to(&mut wished);
    wished.evaluate_current(Some(&focus), false)?;
    // validate the full logical group: axes the user did not name take the
    // focus values for the check, so only an explicit wildcard in the query
    // comes out incomplete
    let mut checked = focus;
    parsed.apply_to(&mut checked);
    checked.evaluate_current(Some(&focus), false)?;
    checked.check_fully_defined(true, false, false)?;
    Ok(wished.fancy_string())
}

/// Builds the filter of an info command: the filter string if given, the
/// command's default otherwise, with `Current` components resolved against
/// the focus (degrading to wildcards when unfocused).
fn build_filter(
    focus: Option<&Coords>,
    text: &str,
    default_filter: &Coords,
) -> Result<Coords> {
    let mut filter = if text.trim().is_empty() {
        *default_filter
    } else {
        let parsed = parse(text, Mode::Filter, DefaultMeta::Wildcard)?;
        if parsed.kind != CommandKind::Filter {
            return Err(Error::Parse(format!("incorrect filter: '{text}'")));
        }
        let mut f = Coords::wildcard();
        parsed.apply_to(&mut f);
        f
    };
    filter.evaluate_current(focus, false)?;
    filter.check_fully_defined(false, false, true)?;
    Ok(filter)
}

// ----------------------------------------------------------------------
// Table rendering
// ----------------------------------------------------------------------

/// Right-aligns every cell to its column width; a row may carry a group
/// separator line printed above it.
fn render_table(headers: &[&str], rows: &[(Option<String>, Vec<String>)]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for (_, row) in rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.len());
        }
    }
    let mut out = String::new();
    let mut line = String::new();
    for (i, header) in headers.iter().enumerate() {
        if i > 0 {
            line.push(' ');
        }
        line.push_str(&format!("{header:>width$}", width = widths[i]));
    }
    out.push_str(line.trim_end());
    out.push('\n');
    for (group, row) in rows {
        if let Some(group) = group {
            out.push_str(group);
            out.push('\n');
        }
        let mut line = String::new();
        for (i, cell) in row.iter().enumerate() {
            if i > 0 {
                line.push(' ');
            }
            line.push_str(&format!("{cell:>width$}", width = widths[i]));
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

fn current_marker(current: bool) -> String {
    (if current { "*" } else { " " }).to_string()
}

// ----------------------------------------------------------------------
// info devices / sms / warps / lanes
// ----------------------------------------------------------------------

fn info_devices<A: DebugApi>(sys: &mut System<A>, filter_text: &str) -> Result<String> {
    let focus = sys.focus().copied();
    let filter = build_filter(focus.as_ref(), filter_text, &Coords::wildcard())?;
    let iter = CoordIterator::new(sys, Granularity::Devices, &filter, Select::All)?;
    let coords: Vec<Coords> = iter.collect();
    if coords.is_empty() {
        return Ok("No devices.".into());
    }

    let mut rows = Vec::new();
    for c in coords {
        let Some(dev) = c.dev.concrete() else {
            continue;
        };
        rows.push((
            None,
            vec![
                current_marker(c.is_current(focus.as_ref())),
                dev.to_string(),
                sys.device_type(dev)?,
                sys.device_sm_type(dev)?,
                sys.device_num_sms(dev)?.to_string(),
                sys.device_num_warps(dev)?.to_string(),
                sys.device_num_lanes(dev)?.to_string(),
                sys.device_num_registers(dev)?.to_string(),
                format!("0x{:08x}", sm_mask_bits(&sys.device_active_sms_mask(dev)?)),
            ],
        ));
    }
    Ok(render_table(
        &[
            " ",
            "Dev",
            "Description",
            "SM Type",
            "SMs",
            "Warps/SM",
            "Lanes/Warp",
            "Max Regs/Lane",
            "Active SMs Mask",
        ],
        &rows,
    ))
}

fn info_sms<A: DebugApi>(sys: &mut System<A>, filter_text: &str) -> Result<String> {
    let focus = sys.focus().copied();
    let mut default_filter = Coords::wildcard();
    default_filter.dev = CoordValue::Current;
    let filter = build_filter(focus.as_ref(), filter_text, &default_filter)?;
    let iter = CoordIterator::new(sys, Granularity::Sms, &filter, Select::All)?;
    let coords: Vec<Coords> = iter.collect();
    if coords.is_empty() {
        return Ok("No SMs.".into());
    }

    let mut rows = Vec::new();
    let mut current_device = None;
    for c in coords {
        let (Some(dev), Some(sm)) = (c.dev.concrete(), c.sm.concrete()) else {
            continue;
        };
        let group = (current_device != Some(dev)).then(|| format!("Device {dev}"));
        current_device = Some(dev);
        rows.push((
            group,
            vec![
                current_marker(c.is_current(focus.as_ref())),
                sm.to_string(),
                format!("0x{:016x}", warp_mask_bits(&sys.sm_valid_warps_mask(dev, sm)?)),
            ],
        ));
    }
    Ok(render_table(&[" ", "SM", "Active Warps Mask"], &rows))
}

fn info_warps<A: DebugApi>(sys: &mut System<A>, filter_text: &str) -> Result<String> {
    let focus = sys.focus().copied();
    let mut default_filter = Coords::wildcard();
    default_filter.dev = CoordValue::Current;
    default_filter.sm = CoordValue::Current;
    let filter = build_filter(focus.as_ref(), filter_text, &default_filter)?;
    let iter = CoordIterator::new(sys, Granularity::Warps, &filter, Select::All)?;
    let coords: Vec<Coords> = iter.collect();
    if coords.is_empty() {
        return Ok("No warps.".into());
    }

    let mut rows = Vec::new();
    let mut current_sm = None;
    for c in coords {
        let (Some(dev), Some(sm), Some(wp)) =
            (c.dev.concrete(), c.sm.concrete(), c.wp.concrete())
        else {
            continue;
        };
        let group = (current_sm != Some((dev, sm))).then(|| format!("Device {dev} SM {sm}"));
        current_sm = Some((dev, sm));

        let cells = if sys.warp_is_valid(dev, sm, wp)? {
            let kernel = sys.warp_kernel(dev, sm, wp)?;
            vec![
                current_marker(c.is_current(focus.as_ref())),
                wp.to_string(),
                format!(
                    "0x{:08x}",
                    lane_mask_bits(&sys.warp_active_lanes_mask(dev, sm, wp)?)
                ),
                format!(
                    "0x{:08x}",
                    lane_mask_bits(&sys.warp_divergent_lanes_mask(dev, sm, wp)?)
                ),
                format!("0x{:016x}", sys.warp_active_pc(dev, sm, wp)?),
                kernel.map_or_else(|| "n/a".to_string(), |k| k.to_string()),
                sys.warp_block_idx(dev, sm, wp)?.to_string(),
            ]
        } else {
            vec![
                current_marker(false),
                wp.to_string(),
                format!("0x{:08x}", 0),
                format!("0x{:08x}", 0),
                "n/a".to_string(),
                "n/a".to_string(),
                "n/a".to_string(),
            ]
        };
        rows.push((group, cells));
    }
    Ok(render_table(
        &[
            " ",
            "Wp",
            "Active Lanes Mask",
            "Divergent Lanes Mask",
            "Active Physical PC",
            "Kernel",
            "BlockIdx",
        ],
        &rows,
    ))
}

fn info_lanes<A: DebugApi>(sys: &mut System<A>, filter_text: &str) -> Result<String> {
    let focus = sys.focus().copied();
    let mut default_filter = Coords::wildcard();
    default_filter.dev = CoordValue::Current;
    default_filter.sm = CoordValue::Current;
    default_filter.wp = CoordValue::Current;
    let filter = build_filter(focus.as_ref(), filter_text, &default_filter)?;
    let iter = CoordIterator::new(sys, Granularity::Lanes, &filter, Select::All)?;
    let coords: Vec<Coords> = iter.collect();
    if coords.is_empty() {
        return Ok("No lanes.".into());
    }

    let mut rows = Vec::new();
    let mut current_warp = None;
    for c in coords {
        let (Some(dev), Some(sm), Some(wp), Some(ln)) = (
            c.dev.concrete(),
            c.sm.concrete(),
            c.wp.concrete(),
            c.ln.concrete(),
        ) else {
            continue;
        };
        let group =
            (current_warp != Some((dev, sm, wp))).then(|| format!("Device {dev} SM {sm} Warp {wp}"));
        current_warp = Some((dev, sm, wp));

        let valid = sys.warp_is_valid(dev, sm, wp)? && sys.lane_is_valid(dev, sm, wp, ln)?;
        let cells = if valid {
            let state = if sys.lane_is_active(dev, sm, wp, ln)? {
                "active"
            } else {
                "divergent"
            };
            vec![
                current_marker(c.is_current(focus.as_ref())),
                ln.to_string(),
                state.to_string(),
                format!("0x{:016x}", sys.lane_pc(dev, sm, wp, ln)?),
                sys.lane_thread_idx(dev, sm, wp, ln)?.to_string(),
            ]
        } else {
            vec![
                current_marker(false),
                ln.to_string(),
                "inactive".to_string(),
                "n/a".to_string(),
                "n/a".to_string(),
            ]
        };
        rows.push((group, cells));
    }
    Ok(render_table(
        &[" ", "Ln", "State", "Physical PC", "ThreadIdx"],
        &rows,
    ))
}

// ----------------------------------------------------------------------
// info kernels
// ----------------------------------------------------------------------

fn info_kernels<A: DebugApi, H: HostDebugger>(
    sys: &mut System<A>,
    host: &mut H,
    filter_text: &str,
) -> Result<String> {
    let focus = sys.focus().copied();
    let filter = build_filter(focus.as_ref(), filter_text, &Coords::wildcard())?;
    let iter = CoordIterator::new(sys, Granularity::Kernels, &filter, Select::Valid)?;
    let coords: Vec<Coords> = iter.collect();
    if coords.is_empty() {
        return Ok("No kernels.".into());
    }

    let mut rows = Vec::new();
    for c in coords {
        let (Some(dev), Some(kernel_id), Some(grid_id)) = (
            c.dev.concrete(),
            c.kernel_id.concrete(),
            c.grid_id.concrete(),
        ) else {
            continue;
        };
        let (entry, grid_dim, block_dim) = match sys.kernels.get(kernel_id) {
            Some(k) => (k.entry, k.grid_dim, k.block_dim),
            None => continue,
        };
        let name = host
            .function_name(entry)
            .unwrap_or_else(|| "??".to_string());
        rows.push((
            None,
            vec![
                current_marker(c.is_current(focus.as_ref())),
                kernel_id.to_string(),
                dev.to_string(),
                grid_id.to_string(),
                format!("0x{:08x}", sm_mask_bits(&sys.kernel_sms_mask(kernel_id)?)),
                grid_dim.to_string(),
                block_dim.to_string(),
                name,
            ],
        ));
    }
    Ok(render_table(
        &[
            " ",
            "Kernel",
            "Dev",
            "Grid",
            "SMs Mask",
            "GridDim",
            "BlockDim",
            "Name",
        ],
        &rows,
    ))
}

// ----------------------------------------------------------------------
// info blocks / threads (with coalescing)
// ----------------------------------------------------------------------

#[derive(Debug)]
struct BlockRow {
    current: bool,
    kernel_id: u64,
    from: Dim3,
    to: Dim3,
    count: u32,
    dev: u32,
    sm: u32,
}

fn info_blocks<A: DebugApi>(sys: &mut System<A>, filter_text: &str) -> Result<String> {
    let coalescing = sys.options.coalescing;
    let focus = sys.focus().copied();
    let mut default_filter = Coords::wildcard();
    default_filter.kernel_id = CoordValue::Current;
    let filter = build_filter(focus.as_ref(), filter_text, &default_filter)?;
    let iter = CoordIterator::new(sys, Granularity::Blocks, &filter, Select::Valid)?;
    let coords: Vec<Coords> = iter.collect();
    if coords.is_empty() {
        return Ok("No blocks.".into());
    }

    let mut rows: Vec<BlockRow> = Vec::new();
    let mut open: Option<BlockRow> = None;
    let mut expected: Option<Coords> = None;
    for c in coords {
        let (Some(kernel_id), Some(block_idx), Some(dev), Some(sm)) = (
            c.kernel_id.concrete(),
            c.block_idx.concrete(),
            c.dev.concrete(),
            c.sm.concrete(),
        ) else {
            continue;
        };
        let grid_dim = match sys.kernels.get(kernel_id) {
            Some(k) => k.grid_dim,
            None => continue,
        };

        let contiguous =
            expected.is_some_and(|e| e.compare_logical(&c) == Ordering::Equal);
        if !contiguous || !coalescing {
            if let Some(row) = open.take() {
                rows.push(row);
            }
            open = Some(BlockRow {
                current: false,
                kernel_id,
                from: block_idx,
                to: block_idx,
                count: 0,
                dev,
                sm,
            });
        }
        let row = open.as_mut().expect("a range is open");
        row.current |= c.is_current(focus.as_ref());
        row.count += 1;
        row.to = block_idx;

        let mut e = Coords::wildcard();
        e.kernel_id = CoordValue::Concrete(kernel_id);
        e.block_idx = CoordValue::Concrete(block_idx);
        e.increment_block(grid_dim);
        expected = Some(e);
    }
    if let Some(row) = open.take() {
        rows.push(row);
    }

    let mut table = Vec::new();
    let mut current_kernel = None;
    for row in &rows {
        let group =
            (current_kernel != Some(row.kernel_id)).then(|| format!("Kernel {}", row.kernel_id));
        current_kernel = Some(row.kernel_id);
        if coalescing {
            table.push((
                group,
                vec![
                    current_marker(row.current),
                    row.from.to_string(),
                    row.to.to_string(),
                    row.count.to_string(),
                    "running".to_string(),
                ],
            ));
        } else {
            table.push((
                group,
                vec![
                    current_marker(row.current),
                    row.from.to_string(),
                    "running".to_string(),
                    row.dev.to_string(),
                    row.sm.to_string(),
                ],
            ));
        }
    }
    Ok(if coalescing {
        render_table(
            &[" ", "BlockIdx", "To BlockIdx", "Count", "State"],
            &table,
        )
    } else {
        render_table(&[" ", "BlockIdx", "State", "Dev", "SM"], &table)
    })
}

#[derive(Debug)]
struct ThreadRow {
    current: bool,
    kernel_id: u64,
    from_block: Dim3,
    from_thread: Dim3,
    to_block: Dim3,
    to_thread: Dim3,
    count: u32,
    pc: u64,
    filename: String,
    line: u32,
    dev: u32,
    sm: u32,
    wp: u32,
    ln: u32,
}

fn info_threads<A: DebugApi, H: HostDebugger>(
    sys: &mut System<A>,
    host: &mut H,
    filter_text: &str,
) -> Result<String> {
    // the coalescing predicate is sampled once; flipping the option
    // mid-iteration would interleave both folds
    let coalescing = sys.options.coalescing;
    let by_line = sys.options.coalescing_by_line;
    let focus = sys.focus().copied();
    let mut default_filter = Coords::wildcard();
    default_filter.kernel_id = CoordValue::Current;
    let filter = build_filter(focus.as_ref(), filter_text, &default_filter)?;
    let iter = CoordIterator::new(sys, Granularity::Threads, &filter, Select::Valid)?;
    let coords: Vec<Coords> = iter.collect();
    if coords.is_empty() {
        return Ok("No threads.".into());
    }

    let mut rows: Vec<ThreadRow> = Vec::new();
    let mut open: Option<ThreadRow> = None;
    let mut expected: Option<Coords> = None;
    let mut prev_pc: Option<u64> = None;
    let mut prev_sal: Option<SourceLine> = None;
    for c in coords {
        let (Some(kernel_id), Some(block_idx), Some(thread_idx)) = (
            c.kernel_id.concrete(),
            c.block_idx.concrete(),
            c.thread_idx.concrete(),
        ) else {
            continue;
        };
        let (Some(dev), Some(sm), Some(wp), Some(ln)) = (
            c.dev.concrete(),
            c.sm.concrete(),
            c.wp.concrete(),
            c.ln.concrete(),
        ) else {
            continue;
        };
        let (grid_dim, block_dim) = match sys.kernels.get(kernel_id) {
            Some(k) => (k.grid_dim, k.block_dim),
            None => continue,
        };

        let pc = sys.lane_virtual_pc(dev, sm, wp, ln)?;
        let sal = if prev_pc == Some(pc) {
            prev_sal.clone()
        } else {
            host.source_line_for_pc(pc)
        };

        let contiguous = expected.is_some_and(|e| e.compare_logical(&c) == Ordering::Equal)
            && if by_line {
                sal.as_ref().map(|s| s.line) == prev_sal.as_ref().map(|s| s.line)
            } else {
                prev_pc == Some(pc)
            };
        if !contiguous || !coalescing {
            if let Some(row) = open.take() {
                rows.push(row);
            }
            open = Some(ThreadRow {
                current: false,
                kernel_id,
                from_block: block_idx,
                from_thread: thread_idx,
                to_block: block_idx,
                to_thread: thread_idx,
                count: 0,
                pc,
                filename: sal
                    .as_ref()
                    .map_or_else(|| "n/a".to_string(), |s| s.filename.clone()),
                line: sal.as_ref().map_or(0, |s| s.line),
                dev,
                sm,
                wp,
                ln,
            });
        }
        let row = open.as_mut().expect("a range is open");
        row.current |= c.is_current(focus.as_ref());
        row.count += 1;
        row.to_block = block_idx;
        row.to_thread = thread_idx;

        let mut e = Coords::wildcard();
        e.kernel_id = CoordValue::Concrete(kernel_id);
        e.block_idx = CoordValue::Concrete(block_idx);
        e.thread_idx = CoordValue::Concrete(thread_idx);
        e.increment_thread(grid_dim, block_dim);
        expected = Some(e);
        prev_pc = Some(pc);
        prev_sal = sal;
    }
    if let Some(row) = open.take() {
        rows.push(row);
    }

    let mut table = Vec::new();
    let mut current_kernel = None;
    for row in &rows {
        let group =
            (current_kernel != Some(row.kernel_id)).then(|| format!("Kernel {}", row.kernel_id));
        current_kernel = Some(row.kernel_id);
        if coalescing {
            table.push((
                group,
                vec![
                    current_marker(row.current),
                    row.from_block.to_string(),
                    row.from_thread.to_string(),
                    row.to_block.to_string(),
                    row.to_thread.to_string(),
                    row.count.to_string(),
                    format!("0x{:016x}", row.pc),
                    row.filename.clone(),
                    row.line.to_string(),
                ],
            ));
        } else {
            table.push((
                group,
                vec![
                    current_marker(row.current),
                    row.from_block.to_string(),
                    row.from_thread.to_string(),
                    format!("0x{:016x}", row.pc),
                    row.dev.to_string(),
                    row.sm.to_string(),
                    row.wp.to_string(),
                    row.ln.to_string(),
                    row.filename.clone(),
                    row.line.to_string(),
                ],
            ));
        }
    }
    Ok(if coalescing {
        render_table(
            &[
                " ",
                "BlockIdx",
                "ThreadIdx",
                "To BlockIdx",
                "ThreadIdx",
                "Count",
                "Virtual PC",
                "Filename",
                "Line",
            ],
            &table,
        )
    } else {
        render_table(
            &[
                " ",
                "BlockIdx",
                "ThreadIdx",
                "Virtual PC",
                "Dev",
                "SM",
                "Wp",
                "Ln",
                "Filename",
                "Line",
            ],
            &table,
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use crate::testing::{init_test, seed_context, FakeApi, FakeHost};
    use color_eyre::eyre;

    /// Two devices, one live warp each; a registered kernel per grid.
    fn sys() -> System<FakeApi> {
        let mut api = FakeApi::new();
        api.add_device(2, 4, 8);
        api.add_device(1, 2, 8);
        api.place_warp(0, 0, 0, 11, Dim3::ZERO, 0xff, 0xff, 0x1000);
        api.place_warp(1, 0, 0, 3, Dim3::ZERO, 0x0f, 0x0f, 0x2000);
        let mut sys = System::new(api, Options::default());
        seed_context(&mut sys, 0, 0xa, 17);
        seed_context(&mut sys, 1, 0xb, 17);
        sys.kernels.start(crate::kernels::KernelLaunch {
            dev_id: 0,
            grid_id: 11,
            entry: 0x1000,
            context_id: 0xa,
            module_id: 1,
            grid_dim: Dim3::new(1, 1, 1),
            block_dim: Dim3::new(8, 1, 1),
            kind: crate::api::KernelKind::Application,
            origin: crate::api::KernelOrigin::Cpu,
            parent_grid_id: None,
        });
        sys.kernels.start(crate::kernels::KernelLaunch {
            dev_id: 1,
            grid_id: 3,
            entry: 0x2000,
            context_id: 0xb,
            module_id: 1,
            grid_dim: Dim3::new(1, 1, 1),
            block_dim: Dim3::new(4, 1, 1),
            kind: crate::api::KernelKind::Application,
            origin: crate::api::KernelOrigin::Cpu,
            parent_grid_id: None,
        });
        sys
    }

    fn focus_on(sys: &mut System<FakeApi>, dev: u32, sm: u32, wp: u32, ln: u32) {
        let grid_id = sys.warp_grid_id(dev, sm, wp).unwrap();
        let kernel_id = sys.warp_kernel(dev, sm, wp).unwrap().unwrap();
        let block = sys.warp_block_idx(dev, sm, wp).unwrap();
        let thread = sys.lane_thread_idx(dev, sm, wp, ln).unwrap();
        sys.set_focus(Coords::fully_defined(
            dev, sm, wp, ln, kernel_id, grid_id, block, thread,
        ));
    }

    #[test]
    fn info_devices_marks_the_focused_device() -> eyre::Result<()> {
        init_test();
        let mut s = sys();
        let mut host = FakeHost::new(&[17]);
        focus_on(&mut s, 0, 0, 0, 0);
        let out = info(&mut s, &mut host, InfoKind::Devices, "")?;
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        let dev0 = lines.iter().find(|l| l.contains("FakeAccel 0")).unwrap();
        let dev1 = lines.iter().find(|l| l.contains("FakeAccel 1")).unwrap();
        assert!(dev0.trim_start().starts_with('*'));
        assert!(!dev1.contains('*'));
        Ok(())
    }

    #[test]
    fn info_warps_defaults_to_the_focused_sm() -> eyre::Result<()> {
        init_test();
        let mut s = sys();
        let mut host = FakeHost::new(&[17]);
        focus_on(&mut s, 0, 0, 0, 0);
        let out = info(&mut s, &mut host, InfoKind::Warps, "")?;
        // 4 warps of (dev 0, sm 0): one live, three n/a
        assert_eq!(out.matches("n/a").count(), 3 * 3);
        assert!(out.contains("Device 0 SM 0"));
        assert!(out.contains("0x0000000000001000"));
        Ok(())
    }

    #[test]
    fn info_lanes_reports_divergence_state() -> eyre::Result<()> {
        init_test();
        let mut s = sys();
        s.api.place_warp(0, 1, 0, 11, Dim3::ZERO, 0xff, 0x0f, 0x1000);
        let mut host = FakeHost::new(&[17]);
        let out = info(&mut s, &mut host, InfoKind::Lanes, "device 0, sm 1, warp 0")?;
        assert_eq!(out.matches("divergent").count(), 4);
        assert_eq!(out.matches("active").count(), 4);
        Ok(())
    }

    #[test]
    fn info_kernels_lists_present_kernels_with_names() -> eyre::Result<()> {
        init_test();
        let mut s = sys();
        let mut host = FakeHost::new(&[17]);
        host.function_names.insert(0x1000, "vec_add".to_string());
        let out = info(&mut s, &mut host, InfoKind::Kernels, "")?;
        assert!(out.contains("vec_add"));
        assert!(out.contains("??"));
        assert!(out.contains("(1,1,1)"));
        Ok(())
    }

    #[test]
    fn switch_by_logical_thread_updates_focus() -> eyre::Result<()> {
        init_test();
        let mut s = sys();
        let mut host = FakeHost::new(&[17]);
        focus_on(&mut s, 0, 0, 0, 0);
        let out = axis_command(&mut s, &mut host, "thread", "(7,0,0)")?;
        assert!(out.starts_with("[Switching focus to"), "got: {out}");
        let focus = s.focus().unwrap();
        assert_eq!(focus.thread_idx.concrete(), Some(Dim3::new(7, 0, 0)));
        assert_eq!(focus.ln.concrete(), Some(7));
        assert_eq!(host.focus_changes.len(), 1);

        // applying the same switch again is a no-op
        let out = axis_command(&mut s, &mut host, "thread", "(7,0,0)")?;
        assert_eq!(out, "Focus unchanged.");
        assert_eq!(host.focus_changes.len(), 1);
        Ok(())
    }

    #[test]
    fn unsatisfiable_switch_keeps_focus() -> eyre::Result<()> {
        init_test();
        let mut s = sys();
        let mut host = FakeHost::new(&[17]);
        focus_on(&mut s, 0, 0, 0, 0);
        let before = *s.focus().unwrap();
        let out = axis_command(&mut s, &mut host, "block", "(99,0,0)")?;
        assert_eq!(out, "Request cannot be satisfied. Focus unchanged.");
        assert_eq!(s.focus(), Some(&before));
        Ok(())
    }

    #[test]
    fn switch_signals_unsatisfiable_as_typed_error() {
        init_test();
        let mut s = sys();
        let mut host = FakeHost::new(&[17]);
        focus_on(&mut s, 0, 0, 0, 0);
        let before = *s.focus().unwrap();
        let err = switch_focus(&mut s, &mut host, "block (99,0,0)").unwrap_err();
        assert!(matches!(err, Error::Unsatisfiable));
        assert_eq!(s.focus(), Some(&before));
        assert!(host.focus_changes.is_empty());
    }

    #[test]
    fn query_renders_the_requested_axes() -> eyre::Result<()> {
        init_test();
        let mut s = sys();
        let mut host = FakeHost::new(&[17]);
        let out = axis_command(&mut s, &mut host, "kernel", "")?;
        assert_eq!(out, "Focus not set on any active kernel.");

        focus_on(&mut s, 0, 0, 0, 3);
        let out = axis_command(&mut s, &mut host, "kernel", "")?;
        assert_eq!(out, "kernel 0");
        let out = query_focus(&mut s, "device sm warp lane")?;
        assert_eq!(out, "device 0, sm 0, warp 0, lane 3");
        Ok(())
    }

    #[test]
    fn info_threads_coalesces_contiguous_ranges() -> eyre::Result<()> {
        init_test();
        let mut s = sys();
        let mut host = FakeHost::new(&[17]);
        host.source_lines.insert(
            0x1000,
            SourceLine {
                filename: "kernel.cu".to_string(),
                line: 42,
            },
        );
        let out = info(&mut s, &mut host, InfoKind::Threads, "device 0")?;
        // 8 threads at the same PC fold into one row
        assert!(out.contains("(0,0,0)"));
        assert!(out.contains("(7,0,0)"));
        assert!(out.contains(" 8 "), "got: {out}");
        assert!(out.contains("kernel.cu"));
        assert_eq!(out.lines().count(), 3);

        s.options.coalescing = false;
        let out = info(&mut s, &mut host, InfoKind::Threads, "device 0")?;
        // header + kernel group line + 8 rows
        assert_eq!(out.lines().count(), 10);
        Ok(())
    }

    #[test]
    fn info_threads_breaks_ranges_on_pc_changes() -> eyre::Result<()> {
        init_test();
        let mut s = sys();
        let mut host = FakeHost::new(&[17]);
        // lanes 4..8 diverged to a different PC
        for ln in 4..8 {
            s.api.devices[0].sms[0].warps[0].lanes[ln].virtual_pc = 0x1080;
        }
        s.api.devices[0].sms[0].warps[0].active_lanes = crate::testing::lane_mask(0x0f);
        let out = info(&mut s, &mut host, InfoKind::Threads, "device 0")?;
        // two coalesced ranges of 4 threads each
        assert_eq!(out.lines().count(), 4);
        assert!(out.contains("0x0000000000001080"));
        Ok(())
    }

    #[test]
    fn info_blocks_folds_blocks_of_one_kernel() -> eyre::Result<()> {
        init_test();
        let mut s = sys();
        let mut host = FakeHost::new(&[17]);
        // a second block of grid 11 on another SM, grid is (2,1,1)
        s.api.place_warp(0, 1, 1, 11, Dim3::new(1, 0, 0), 0xff, 0xff, 0x1000);
        if let Some(k) = s.kernels.get_mut(0) {
            k.grid_dim = Dim3::new(2, 1, 1);
        }
        let out = info(&mut s, &mut host, InfoKind::Blocks, "device 0")?;
        let lines: Vec<&str> = out.lines().collect();
        // header + "Kernel 0" + one folded row
        assert_eq!(lines.len(), 3, "got: {out}");
        assert!(lines[2].contains("(0,0,0)"));
        assert!(lines[2].contains("(1,0,0)"));
        assert!(lines[2].contains('2'));
        Ok(())
    }

    #[test]
    fn filters_restrict_info_output() -> eyre::Result<()> {
        init_test();
        let mut s = sys();
        let mut host = FakeHost::new(&[17]);
        let out = info(&mut s, &mut host, InfoKind::Devices, "device 1")?;
        assert!(out.contains("FakeAccel 1"));
        assert!(!out.contains("FakeAccel 0"));
        Ok(())
    }

    #[test]
    fn info_command_parses_kind_and_filter() -> eyre::Result<()> {
        init_test();
        let mut s = sys();
        let mut host = FakeHost::new(&[17]);
        let out = info_command(&mut s, &mut host, "devices device 1")?;
        assert!(out.contains("FakeAccel 1"));
        let err = info_command(&mut s, &mut host, "gizmos").unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
        Ok(())
    }

    #[test]
    fn focus_survives_info_commands() -> eyre::Result<()> {
        init_test();
        let mut s = sys();
        let mut host = FakeHost::new(&[17]);
        focus_on(&mut s, 0, 0, 0, 0);
        let before = *s.focus().unwrap();
        info(&mut s, &mut host, InfoKind::Threads, "")?;
        assert_eq!(s.focus(), Some(&before));
        Ok(())
    }
}
