//! End-to-end scenarios: events drive the registries, commands read through
//! the cache, and the notification machine wakes the consumer.

use gpudbg::api::{KernelKind, KernelOrigin};
use gpudbg::commands::{self, InfoKind};
use gpudbg::contexts::ElfImage;
use gpudbg::coords::Dim3;
use gpudbg::events::{self, Event, QueueKind};
use gpudbg::host::{StopSignal, WaitStatus};
use gpudbg::notifications::{Notifications, NotifyData};
use gpudbg::testing::{FakeApi, FakeHost};
use gpudbg::{Options, System};

use color_eyre::eyre;
use std::sync::Arc;

static INIT: std::sync::Once = std::sync::Once::new();

fn init_test() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

fn elf_image() -> ElfImage {
    ElfImage {
        data: Arc::new(vec![0x7f, b'E', b'L', b'F', 2, 1, 1, 0]),
        code_start: 0x1000,
        code_size: 0x4000,
    }
}

fn kernel_ready(dev: u32, grid_id: u64, grid_dim: Dim3, block_dim: Dim3, entry: u64) -> Event {
    Event::KernelReady {
        dev,
        context_id: 0xa00 + u64::from(dev),
        module_id: 1,
        grid_id,
        tid: 17,
        entry,
        grid_dim,
        block_dim,
        kind: KernelKind::Application,
        origin: KernelOrigin::Cpu,
        parent_grid_id: None,
    }
}

/// Two devices, one live warp each, with contexts, modules and kernels
/// registered the way the event stream would.
fn boot() -> (System<FakeApi>, FakeHost) {
    let mut api = FakeApi::new();
    api.add_device(4, 4, 32);
    api.add_device(4, 4, 32);
    api.place_warp(0, 3, 2, 11, Dim3::ZERO, 0xff, 0xff, 0x1100);
    api.place_warp(1, 0, 0, 5, Dim3::ZERO, 0xf, 0xf, 0x2100);
    api.sync_events.extend([
        Event::ContextCreate {
            dev: 0,
            context_id: 0xa00,
            tid: 17,
        },
        Event::ContextCreate {
            dev: 1,
            context_id: 0xa01,
            tid: 17,
        },
        Event::ElfImageLoaded {
            dev: 0,
            context_id: 0xa00,
            module_id: 1,
            image: elf_image(),
        },
        Event::ElfImageLoaded {
            dev: 1,
            context_id: 0xa01,
            module_id: 1,
            image: elf_image(),
        },
        kernel_ready(0, 11, Dim3::new(4, 1, 1), Dim3::new(32, 1, 1), 0x1100),
        kernel_ready(1, 5, Dim3::new(1, 1, 1), Dim3::new(4, 1, 1), 0x2100),
    ]);

    let mut sys = System::new(api, Options::default());
    let mut host = FakeHost::new(&[17, 42]);
    events::process_events(&mut sys, &mut host, QueueKind::Sync).expect("event drain");
    (sys, host)
}

fn focus_on(sys: &mut System<FakeApi>, dev: u32, sm: u32, wp: u32, ln: u32) {
    let grid_id = sys.warp_grid_id(dev, sm, wp).unwrap();
    let kernel_id = sys.warp_kernel(dev, sm, wp).unwrap().unwrap();
    let block = sys.warp_block_idx(dev, sm, wp).unwrap();
    let thread = sys.lane_thread_idx(dev, sm, wp, ln).unwrap();
    sys.set_focus(gpudbg::Coords::fully_defined(
        dev, sm, wp, ln, kernel_id, grid_id, block, thread,
    ));
}

#[test]
fn two_devices_one_live_warp_each() -> eyre::Result<()> {
    init_test();
    let (mut sys, mut host) = boot();
    focus_on(&mut sys, 0, 3, 2, 0);

    let out = commands::info(&mut sys, &mut host, InfoKind::Devices, "")?;
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines.len(), 3, "got: {out}");
    let focused: Vec<&&str> = lines.iter().filter(|l| l.trim_start().starts_with('*')).collect();
    assert_eq!(focused.len(), 1);
    assert!(focused[0].contains("FakeAccel 0"));
    Ok(())
}

#[test]
fn switch_by_logical_coordinate_then_query() -> eyre::Result<()> {
    init_test();
    let (mut sys, mut host) = boot();
    focus_on(&mut sys, 0, 3, 2, 0);

    let out = commands::axis_command(&mut sys, &mut host, "thread", "(7,0,0)")?;
    assert!(out.starts_with("[Switching focus to"), "got: {out}");

    let query = commands::axis_command(&mut sys, &mut host, "thread", "")?;
    assert_eq!(query, "thread (7,0,0)");
    let full = commands::query_focus(&mut sys, "kernel block thread device sm warp lane")?;
    assert_eq!(
        full,
        "kernel 0, block (0,0,0), thread (7,0,0), device 0, sm 3, warp 2, lane 7"
    );
    Ok(())
}

#[test]
fn unresolvable_switch_reports_and_keeps_focus() -> eyre::Result<()> {
    init_test();
    let (mut sys, mut host) = boot();
    focus_on(&mut sys, 0, 3, 2, 0);
    let before = *sys.focus().unwrap();

    // the focused kernel's grid is only (4,1,1) blocks
    let out = commands::axis_command(&mut sys, &mut host, "block", "(99,0,0)")?;
    assert_eq!(out, "Request cannot be satisfied. Focus unchanged.");
    assert_eq!(sys.focus(), Some(&before));
    Ok(())
}

#[test]
fn info_threads_coalescing_on_and_off() -> eyre::Result<()> {
    init_test();
    let mut api = FakeApi::new();
    api.add_device(1, 2, 16);
    // twelve consecutive threads at one PC
    api.place_warp(0, 0, 0, 9, Dim3::ZERO, 0xfff, 0xfff, 0x3000);
    api.sync_events.extend([
        Event::ContextCreate {
            dev: 0,
            context_id: 0xa00,
            tid: 17,
        },
        kernel_ready(0, 9, Dim3::new(1, 1, 1), Dim3::new(12, 1, 1), 0x3000),
    ]);
    let mut sys = System::new(api, Options::default());
    let mut host = FakeHost::new(&[17]);
    events::process_events(&mut sys, &mut host, QueueKind::Sync)?;
    host.source_lines.insert(
        0x3000,
        gpudbg::host::SourceLine {
            filename: "saxpy.cu".to_string(),
            line: 12,
        },
    );

    let out = commands::info(&mut sys, &mut host, InfoKind::Threads, "device 0")?;
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines.len(), 3, "got: {out}");
    let row = lines[2];
    assert!(row.contains("(0,0,0)"));
    assert!(row.contains("(11,0,0)"));
    assert!(row.contains("12"));
    assert!(row.contains("saxpy.cu"));

    sys.options.coalescing = false;
    let out = commands::info(&mut sys, &mut host, InfoKind::Threads, "device 0")?;
    assert_eq!(out.lines().count(), 2 + 12);
    Ok(())
}

#[test]
fn find_valid_exact_match_requires_liveness() -> eyre::Result<()> {
    init_test();
    let (mut sys, _host) = boot();

    let mut live = gpudbg::Coords::wildcard();
    live.dev = gpudbg::coords::CoordValue::Concrete(0);
    live.sm = gpudbg::coords::CoordValue::Concrete(3);
    live.wp = gpudbg::coords::CoordValue::Concrete(2);
    live.ln = gpudbg::coords::CoordValue::Concrete(0);
    let found = gpudbg::coords::find_valid(&mut sys, &live, gpudbg::iterator::Select::Valid)?;
    let exact = found.exact_physical.expect("lane is live");
    assert_eq!(exact.ln.concrete(), Some(0));
    assert_eq!(exact.kernel_id.concrete(), Some(0));

    let mut dead = live;
    dead.sm = gpudbg::coords::CoordValue::Concrete(0);
    let found = gpudbg::coords::find_valid(&mut sys, &dead, gpudbg::iterator::Select::Valid)?;
    assert!(found.exact_physical.is_none());
    assert!(found.closest_physical.is_some());
    Ok(())
}

#[test]
fn notification_timeout_resend_is_received() {
    init_test();
    let host = FakeHost::new(&[17, 42]);
    let notifications = Notifications::new(true);

    notifications.notify(
        NotifyData {
            tid: Some(17),
            timeout: false,
        },
        &host,
    );
    assert_eq!(host.delivered(), vec![17]);

    // the signal was lost; the wait loop timed out
    notifications.notify(
        NotifyData {
            tid: None,
            timeout: true,
        },
        &host,
    );
    assert_eq!(host.delivered(), vec![17, 17]);

    notifications.analyze(17, &WaitStatus::Stopped(StopSignal::Trap), false);
    assert!(notifications.received());
    notifications.mark_consumed();
    assert!(!notifications.pending());
}

#[test]
fn aliased_event_drains_twice_without_second_signal() {
    init_test();
    let host = FakeHost::new(&[17]);
    let notifications = Notifications::new(false);

    notifications.notify(
        NotifyData {
            tid: Some(17),
            timeout: false,
        },
        &host,
    );
    // while the consumer drains, a second event arrives
    notifications.notify(
        NotifyData {
            tid: Some(17),
            timeout: false,
        },
        &host,
    );
    assert_eq!(host.delivered(), vec![17]);
    assert!(notifications.aliased_event());

    // the consumer observes the flag, drains again, and resumes
    notifications.reset_aliased_event();
    assert!(!notifications.aliased_event());
    assert_eq!(host.delivered(), vec![17]);
}

#[test]
fn kernel_finish_and_resume_cycle() -> eyre::Result<()> {
    init_test();
    let (mut sys, mut host) = boot();

    assert_eq!(sys.num_present_kernels()?, 2);
    let out = commands::info(&mut sys, &mut host, InfoKind::Kernels, "")?;
    assert_eq!(out.lines().count(), 3);

    // device 1's kernel runs to completion
    sys.api.devices[1].sms[0].warps[0].valid = false;
    sys.api
        .sync_events
        .push_back(Event::KernelFinished { dev: 1, grid_id: 5 });
    events::process_events(&mut sys, &mut host, QueueKind::Sync)?;
    sys.device_resume(1)?;

    assert_eq!(sys.num_present_kernels()?, 1);
    let out = commands::info(&mut sys, &mut host, InfoKind::Kernels, "")?;
    assert_eq!(out.lines().count(), 2, "got: {out}");
    assert!(!sys.device_is_valid(1)?);
    assert!(sys.device_is_valid(0)?);
    Ok(())
}

#[test]
fn breakpoints_reinserted_after_each_drain() -> eyre::Result<()> {
    init_test();
    let (mut sys, mut host) = boot();
    assert_eq!(host.breakpoints_removed, 1);
    assert_eq!(host.breakpoints_inserted, 1);
    assert_eq!(host.resolved_images, 2);

    sys.api.sync_events.push_back(Event::ElfImageLoaded {
        dev: 0,
        context_id: 0xa00,
        module_id: 2,
        image: elf_image(),
    });
    events::process_events(&mut sys, &mut host, QueueKind::Sync)?;
    assert_eq!(host.resolved_images, 3);
    assert_eq!(host.breakpoints_removed, 2);
    assert_eq!(host.breakpoints_inserted, 2);
    Ok(())
}

#[test]
fn context_destroy_unwinds_breakpoints_and_current_context() -> eyre::Result<()> {
    init_test();
    let (mut sys, mut host) = boot();
    assert_eq!(sys.current_context(), Some((1, 0xa01)));
    assert_eq!(sys.find_context_by_addr(0x2000), Some((0, 0xa00)));

    sys.api.sync_events.push_back(Event::ContextDestroy {
        dev: 1,
        context_id: 0xa01,
        tid: 17,
    });
    events::process_events(&mut sys, &mut host, QueueKind::Sync)?;
    assert_eq!(sys.current_context(), None);
    assert_eq!(host.cleaned_contexts, vec![0xa01]);
    assert_eq!(host.unresolved_contexts, vec![0xa01]);
    assert!(sys.contexts(1).find_by_id(0xa01).is_none());
    Ok(())
}
