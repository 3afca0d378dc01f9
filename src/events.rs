//! Consumes the FIFO of debug-API events. Two queues exist: synchronous
//! events drained during a stop, and asynchronous events drained before the
//! host debugger resumes. A drain pass consumes every queued event before
//! any cache field is recomputed, because a recompute can transitively
//! trigger the debug API and reorder the stream.

use crate::api::{AttachState, DebugApi, KernelKind, KernelOrigin};
use crate::contexts::{Context, ElfImage, Module};
use crate::coords::Dim3;
use crate::host::HostDebugger;
use crate::kernels::KernelLaunch;
use crate::state::System;
use crate::{Error, Result};
use console::style;

/// Thread id value reported by the API when it has none; always an error
/// for context and kernel events.
pub const INVALID_TID: u32 = u32::MAX;

#[derive(Debug, Clone)]
pub enum Event {
    ContextCreate {
        dev: u32,
        context_id: u64,
        tid: u32,
    },
    ContextDestroy {
        dev: u32,
        context_id: u64,
        tid: u32,
    },
    ContextPush {
        dev: u32,
        context_id: u64,
        tid: u32,
    },
    ContextPop {
        dev: u32,
        context_id: u64,
        tid: u32,
    },
    ElfImageLoaded {
        dev: u32,
        context_id: u64,
        module_id: u64,
        image: ElfImage,
    },
    KernelReady {
        dev: u32,
        context_id: u64,
        module_id: u64,
        grid_id: u64,
        tid: u32,
        entry: u64,
        grid_dim: Dim3,
        block_dim: Dim3,
        kind: KernelKind,
        origin: KernelOrigin,
        parent_grid_id: Option<u64>,
    },
    KernelFinished {
        dev: u32,
        grid_id: u64,
    },
    InternalError {
        code: u32,
    },
    Timeout,
    AttachComplete,
    DetachComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Sync,
    Async,
}

/// Drains one queue to exhaustion, then post-processes. Returns the
/// user-visible lines produced along the way (context event chatter).
pub fn process_events<A: DebugApi, H: HostDebugger>(
    sys: &mut System<A>,
    host: &mut H,
    kind: QueueKind,
) -> Result<Vec<String>> {
    let mut messages = Vec::new();
    loop {
        let event = match kind {
            QueueKind::Sync => sys.api.next_sync_event()?,
            QueueKind::Async => sys.api.next_async_event()?,
        };
        let Some(event) = event else {
            break;
        };
        if sys.options.trace_events {
            log::debug!("{}", style(format!("event: {event:?}")).dim());
        }
        process_event(sys, host, event, &mut messages)?;
    }
    post_process(host);
    Ok(messages)
}

/// Launch events may require additional breakpoint handling: pull every
/// software breakpoint out of device memory and plant them again so newly
/// loaded images have theirs realized.
pub fn post_process<H: HostDebugger>(host: &mut H) {
    host.remove_breakpoints();
    host.insert_breakpoints();
}

pub fn process_event<A: DebugApi, H: HostDebugger>(
    sys: &mut System<A>,
    host: &mut H,
    event: Event,
    messages: &mut Vec<String>,
) -> Result<()> {
    match event {
        Event::ContextCreate {
            dev,
            context_id,
            tid,
        } => context_create(sys, dev, context_id, tid, messages),
        Event::ContextDestroy {
            dev,
            context_id,
            tid,
        } => context_destroy(sys, host, dev, context_id, tid, messages),
        Event::ContextPush {
            dev,
            context_id,
            tid,
        } => context_push(sys, dev, context_id, tid, messages),
        Event::ContextPop {
            dev,
            context_id,
            tid,
        } => context_pop(sys, dev, context_id, tid, messages),
        Event::ElfImageLoaded {
            dev,
            context_id,
            module_id,
            image,
        } => elf_image_loaded(sys, host, dev, context_id, module_id, image),
        Event::KernelReady {
            dev,
            context_id,
            module_id,
            grid_id,
            tid,
            entry,
            grid_dim,
            block_dim,
            kind,
            origin,
            parent_grid_id,
        } => kernel_ready(
            sys,
            host,
            KernelLaunch {
                dev_id: dev,
                grid_id,
                entry,
                context_id,
                module_id,
                grid_dim,
                block_dim,
                kind,
                origin,
                parent_grid_id,
            },
            tid,
        ),
        Event::KernelFinished { dev, grid_id } => kernel_finished(sys, host, dev, grid_id),
        Event::InternalError { code } => {
            log::debug!("event: internal error {code}");
            Err(Error::Internal(code))
        }
        Event::Timeout => {
            log::debug!("event: timeout");
            Ok(())
        }
        Event::AttachComplete => {
            log::debug!("event: attach complete");
            sys.api.set_attach_state(AttachState::AppReady);
            Ok(())
        }
        Event::DetachComplete => {
            log::debug!("event: detach complete");
            sys.api.set_attach_state(AttachState::DetachComplete);
            Ok(())
        }
    }
}

fn check_tid(tid: u32) -> Result<u32> {
    if tid == INVALID_TID {
        return Err(Error::InvalidThreadId);
    }
    Ok(tid)
}

fn context_create<A: DebugApi>(
    sys: &mut System<A>,
    dev: u32,
    context_id: u64,
    tid: u32,
    messages: &mut Vec<String>,
) -> Result<()> {
    log::debug!(
        "{}",
        style(format!("event: context create 0x{context_id:x} on device {dev} tid {tid}")).cyan()
    );
    let tid = check_tid(tid)?;
    let contexts = sys.contexts_mut(dev)?;
    contexts.add(Context::new(context_id, dev));
    contexts.stack(context_id, tid);
    if sys.options.show_context_events {
        messages.push(format!(
            "[Context Create of context 0x{context_id:x} on Device {dev}]"
        ));
    }
    Ok(())
}

fn context_destroy<A: DebugApi, H: HostDebugger>(
    sys: &mut System<A>,
    host: &mut H,
    dev: u32,
    context_id: u64,
    tid: u32,
    messages: &mut Vec<String>,
) -> Result<()> {
    log::debug!(
        "{}",
        style(format!("event: context destroy 0x{context_id:x} on device {dev} tid {tid}")).cyan()
    );
    let tid = check_tid(tid)?;
    let contexts = sys.contexts_mut(dev)?;
    if contexts.active(tid) == Some(context_id) {
        contexts.unstack(tid);
    }
    if sys.current_context() == Some((dev, context_id)) {
        sys.set_current_context(None);
    }
    host.cleanup_breakpoints(context_id);
    host.unresolve_breakpoints(context_id);
    sys.contexts_mut(dev)?
        .remove(context_id)
        .ok_or_else(|| Error::NotFound(format!("context 0x{context_id:x}")))?;
    if sys.options.show_context_events {
        messages.push(format!(
            "[Context Destroy of context 0x{context_id:x} on Device {dev}]"
        ));
    }
    Ok(())
}

fn context_push<A: DebugApi>(
    sys: &mut System<A>,
    dev: u32,
    context_id: u64,
    tid: u32,
    messages: &mut Vec<String>,
) -> Result<()> {
    log::debug!("event: context push 0x{context_id:x} on device {dev} tid {tid}");
    // push/pop events are ignored while an attach is in progress
    if sys.api.attach_state() != AttachState::NotStarted {
        return Ok(());
    }
    let tid = check_tid(tid)?;
    sys.contexts_mut(dev)?.stack(context_id, tid);
    if sys.options.show_context_events {
        messages.push(format!(
            "[Context Push of context 0x{context_id:x} on Device {dev}]"
        ));
    }
    Ok(())
}

fn context_pop<A: DebugApi>(
    sys: &mut System<A>,
    dev: u32,
    context_id: u64,
    tid: u32,
    messages: &mut Vec<String>,
) -> Result<()> {
    log::debug!("event: context pop 0x{context_id:x} on device {dev} tid {tid}");
    if sys.api.attach_state() != AttachState::NotStarted {
        return Ok(());
    }
    let tid = check_tid(tid)?;
    let popped = sys.contexts_mut(dev)?.unstack(tid);
    assert_eq!(popped, Some(context_id), "context stack out of sync");
    if sys.options.show_context_events {
        messages.push(format!(
            "[Context Pop of context 0x{context_id:x} on Device {dev}]"
        ));
    }
    Ok(())
}

/// A new module arrived: register it, make its context current, and give
/// the host debugger a chance to resolve pending breakpoints against it.
fn elf_image_loaded<A: DebugApi, H: HostDebugger>(
    sys: &mut System<A>,
    host: &mut H,
    dev: u32,
    context_id: u64,
    module_id: u64,
    image: ElfImage,
) -> Result<()> {
    log::debug!(
        "event: elf image loaded, context 0x{context_id:x} module 0x{module_id:x} ({} bytes)",
        image.data.len()
    );
    let context = sys
        .contexts_mut(dev)?
        .find_by_id_mut(context_id)
        .ok_or_else(|| Error::NotFound(format!("context 0x{context_id:x}")))?;
    context.add_module(Module {
        id: module_id,
        context_id,
        image: image.clone(),
    });
    sys.set_current_context(Some((dev, context_id)));
    host.resolve_breakpoints(&image);
    Ok(())
}

/// Restores the host debugger's thread selection on every exit path of the
/// kernel-ready handler.
struct ThreadRetarget<'a, H: HostDebugger> {
    host: &'a mut H,
    prev: u32,
    switched: bool,
}

impl<'a, H: HostDebugger> ThreadRetarget<'a, H> {
    fn new(host: &'a mut H, tid: u32) -> Self {
        let prev = host.current_thread();
        let switched = prev != tid && host.thread_ids().contains(&tid);
        if switched {
            host.switch_to_thread(tid);
        }
        Self {
            host,
            prev,
            switched,
        }
    }

    fn host(&mut self) -> &mut H {
        self.host
    }
}

impl<H: HostDebugger> Drop for ThreadRetarget<'_, H> {
    fn drop(&mut self) {
        if self.switched {
            self.host.switch_to_thread(self.prev);
        }
    }
}

fn kernel_ready<A: DebugApi, H: HostDebugger>(
    sys: &mut System<A>,
    host: &mut H,
    launch: KernelLaunch,
    tid: u32,
) -> Result<()> {
    log::debug!(
        "{}",
        style(format!(
            "event: kernel ready, grid {} on device {} entry 0x{:x} tid {tid}",
            launch.grid_id, launch.dev_id, launch.entry
        ))
        .green()
    );
    let tid = check_tid(tid)?;

    // Auto-breakpoint placement resolves symbols in the process context of
    // the launching CPU thread; retarget for the duration of the handler.
    let mut retarget = ThreadRetarget::new(host, tid);

    sys.kernels.start(launch);

    let break_on_launch = match launch.kind {
        KernelKind::Application => sys.options.break_on_launch_application,
        KernelKind::System => sys.options.break_on_launch_system,
    };
    if break_on_launch {
        retarget
            .host()
            .create_auto_breakpoint(launch.entry, launch.context_id);
    }
    Ok(())
}

fn kernel_finished<A: DebugApi, H: HostDebugger>(
    sys: &mut System<A>,
    host: &mut H,
    dev: u32,
    grid_id: u64,
) -> Result<()> {
    log::debug!(
        "{}",
        style(format!("event: kernel finished, grid {grid_id} on device {dev}")).green()
    );
    if sys.kernels.terminate(dev, grid_id).is_none() {
        log::warn!("finish event for unknown grid {grid_id} on device {dev}");
    }
    host.clear_source_state();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use crate::testing::{init_test, FakeApi, FakeHost};
    use color_eyre::eyre;
    use std::sync::Arc;

    fn sys() -> System<FakeApi> {
        let mut api = FakeApi::new();
        api.add_device(2, 4, 8);
        System::new(api, Options::default())
    }

    fn image() -> ElfImage {
        ElfImage {
            data: Arc::new(vec![0x7f, b'E', b'L', b'F']),
            code_start: 0x1000,
            code_size: 0x1000,
        }
    }

    fn kernel_ready_event(tid: u32) -> Event {
        Event::KernelReady {
            dev: 0,
            context_id: 0xa,
            module_id: 1,
            grid_id: 7,
            tid,
            entry: 0x1200,
            grid_dim: Dim3::new(4, 1, 1),
            block_dim: Dim3::new(32, 1, 1),
            kind: KernelKind::Application,
            origin: KernelOrigin::Cpu,
            parent_grid_id: None,
        }
    }

    #[test]
    fn context_lifecycle_tracks_registry_and_stacks() -> eyre::Result<()> {
        init_test();
        let mut sys = sys();
        let mut host = FakeHost::new(&[17, 42]);
        sys.api.sync_events.extend([
            Event::ContextCreate {
                dev: 0,
                context_id: 0xa,
                tid: 17,
            },
            Event::ElfImageLoaded {
                dev: 0,
                context_id: 0xa,
                module_id: 1,
                image: image(),
            },
        ]);
        process_events(&mut sys, &mut host, QueueKind::Sync)?;

        assert!(sys.contexts(0).find_by_id(0xa).is_some());
        assert_eq!(sys.contexts(0).active(17), Some(0xa));
        assert_eq!(sys.current_context(), Some((0, 0xa)));
        assert_eq!(host.resolved_images, 1);
        // the drain ends with a breakpoint remove/insert pass
        assert_eq!(host.breakpoints_removed, 1);
        assert_eq!(host.breakpoints_inserted, 1);

        sys.api.sync_events.push_back(Event::ContextDestroy {
            dev: 0,
            context_id: 0xa,
            tid: 17,
        });
        process_events(&mut sys, &mut host, QueueKind::Sync)?;
        assert!(sys.contexts(0).find_by_id(0xa).is_none());
        assert_eq!(sys.contexts(0).active(17), None);
        assert_eq!(sys.current_context(), None);
        assert_eq!(host.cleaned_contexts, vec![0xa]);
        assert_eq!(host.unresolved_contexts, vec![0xa]);
        Ok(())
    }

    #[test]
    fn context_chatter_is_gated_by_the_option() -> eyre::Result<()> {
        init_test();
        let mut sys = sys();
        let mut host = FakeHost::new(&[17]);
        sys.api.sync_events.push_back(Event::ContextCreate {
            dev: 0,
            context_id: 0xa,
            tid: 17,
        });
        let messages = process_events(&mut sys, &mut host, QueueKind::Sync)?;
        assert!(messages.is_empty());

        sys.options.show_context_events = true;
        sys.api.sync_events.extend([
            Event::ContextPush {
                dev: 0,
                context_id: 0xa,
                tid: 17,
            },
            Event::ContextPop {
                dev: 0,
                context_id: 0xa,
                tid: 17,
            },
        ]);
        let messages = process_events(&mut sys, &mut host, QueueKind::Sync)?;
        assert_eq!(
            messages,
            vec![
                "[Context Push of context 0xa on Device 0]".to_string(),
                "[Context Pop of context 0xa on Device 0]".to_string(),
            ]
        );
        Ok(())
    }

    #[test]
    fn invalid_tid_is_a_hard_error() {
        init_test();
        let mut sys = sys();
        let mut host = FakeHost::new(&[17]);
        sys.api.sync_events.push_back(Event::ContextCreate {
            dev: 0,
            context_id: 0xa,
            tid: INVALID_TID,
        });
        let err = process_events(&mut sys, &mut host, QueueKind::Sync).unwrap_err();
        assert!(matches!(err, Error::InvalidThreadId));
    }

    #[test]
    fn push_pop_ignored_while_attaching() -> eyre::Result<()> {
        init_test();
        let mut sys = sys();
        let mut host = FakeHost::new(&[17]);
        sys.api.attach = AttachState::InProgress;
        sys.api.sync_events.push_back(Event::ContextPush {
            dev: 0,
            context_id: 0xa,
            tid: 17,
        });
        process_events(&mut sys, &mut host, QueueKind::Sync)?;
        assert_eq!(sys.contexts(0).active(17), None);
        Ok(())
    }

    #[test]
    fn kernel_ready_registers_and_retargets() -> eyre::Result<()> {
        init_test();
        let mut sys = sys();
        let mut host = FakeHost::new(&[17, 42]);
        host.current = 17;
        sys.options.break_on_launch_application = true;
        sys.api.sync_events.push_back(kernel_ready_event(42));
        process_events(&mut sys, &mut host, QueueKind::Sync)?;

        assert!(sys.kernels.find_by_grid_id(0, 7).is_some());
        assert_eq!(host.auto_breakpoints, vec![(0x1200, 0xa)]);
        // switched to the launching thread, then back
        assert_eq!(host.switches, vec![42, 17]);
        assert_eq!(host.current, 17);
        Ok(())
    }

    #[test]
    fn kernel_ready_without_launch_break_plants_nothing() -> eyre::Result<()> {
        init_test();
        let mut sys = sys();
        let mut host = FakeHost::new(&[17]);
        sys.api.sync_events.push_back(kernel_ready_event(17));
        process_events(&mut sys, &mut host, QueueKind::Sync)?;
        assert!(host.auto_breakpoints.is_empty());
        Ok(())
    }

    #[test]
    fn kernel_finished_clears_source_state() -> eyre::Result<()> {
        init_test();
        let mut sys = sys();
        let mut host = FakeHost::new(&[17]);
        sys.api.sync_events.push_back(kernel_ready_event(17));
        sys.api
            .sync_events
            .push_back(Event::KernelFinished { dev: 0, grid_id: 7 });
        process_events(&mut sys, &mut host, QueueKind::Sync)?;
        assert!(sys.kernels.find_by_grid_id(0, 7).is_none());
        assert_eq!(host.source_state_cleared, 1);
        Ok(())
    }

    #[test]
    fn internal_error_halts_the_drain() {
        init_test();
        let mut sys = sys();
        let mut host = FakeHost::new(&[17]);
        sys.api
            .sync_events
            .push_back(Event::InternalError { code: 12 });
        sys.api.sync_events.push_back(Event::ContextCreate {
            dev: 0,
            context_id: 0xa,
            tid: 17,
        });
        let err = process_events(&mut sys, &mut host, QueueKind::Sync).unwrap_err();
        assert!(matches!(err, Error::Internal(12)));
        // the queued event behind the error was not consumed
        assert_eq!(sys.api.sync_events.len(), 1);
    }

    #[test]
    fn attach_handshake_transitions() -> eyre::Result<()> {
        init_test();
        let mut sys = sys();
        let mut host = FakeHost::new(&[17]);
        sys.api.attach = AttachState::InProgress;
        sys.api.sync_events.push_back(Event::AttachComplete);
        process_events(&mut sys, &mut host, QueueKind::Sync)?;
        assert_eq!(sys.api.attach_state(), AttachState::AppReady);

        sys.api.async_events.push_back(Event::DetachComplete);
        process_events(&mut sys, &mut host, QueueKind::Async)?;
        assert_eq!(sys.api.attach_state(), AttachState::DetachComplete);
        Ok(())
    }
}
