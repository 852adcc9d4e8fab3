//! End-to-end scheduler tests through the context API.

#[macro_use]
mod common;

use common::*;
use dnsloop::{
    Context, Delay, Descriptor, Error, ErrorKind, EventCallback, EventLoop, Operation,
    OperationId, Reactor, ReactorHandle, Result, Step, UserArg, Wait, Watcher, TIMEOUT_FOREVER,
};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

type Completions<T> = Arc<Mutex<Vec<(OperationId, std::result::Result<T, ErrorKind>)>>>;

fn collector<T: Send + 'static>(
    completions: &Completions<T>,
) -> impl FnOnce(OperationId, Result<T>) + Send + 'static {
    let completions = Arc::clone(completions);
    move |id, result| completions.lock().push((id, result.map_err(|e| e.kind())))
}

#[test]
fn delays_complete_in_deadline_order() {
    init_test("delays_complete_in_deadline_order");
    let (context, reactor) = attached_context();
    let completions: Completions<u64> = Arc::new(Mutex::new(Vec::new()));
    for ms in [300, 100, 200] {
        context
            .submit(Delay::new(ms), collector(&completions))
            .expect("submit");
    }
    assert_with_log!(context.armed_watchers() == 3, "three armed", 3usize, context.armed_watchers());

    reactor.run_for(Duration::from_millis(300));
    let order: Vec<u64> = completions
        .lock()
        .iter()
        .map(|(_, r)| *r.as_ref().expect("delay succeeds"))
        .collect();
    assert_with_log!(order == vec![100, 200, 300], "deadline order", vec![100, 200, 300], order);
    assert_with_log!(reactor.is_empty(), "no watches left", true, reactor.is_empty());
    assert_with_log!(context.pending_count() == 0, "none pending", 0usize, context.pending_count());
    test_complete!("delays_complete_in_deadline_order");
}

/// Waits on a descriptor and cancels itself from inside its first wakeup.
struct SelfCancelling {
    fd: Descriptor,
    context: Context,
    id: Arc<Mutex<Option<OperationId>>>,
    cancelled: Arc<AtomicUsize>,
}

impl Operation for SelfCancelling {
    type Output = ();

    fn start(&mut self) -> Step<()> {
        Step::Wait(Wait::readable(self.fd, TIMEOUT_FOREVER))
    }

    fn on_readable(&mut self, _fd: Descriptor) -> Step<()> {
        if let Some(id) = *self.id.lock() {
            self.context.cancel(id).expect("cancel self");
        }
        Step::Wait(Wait::readable(self.fd, TIMEOUT_FOREVER))
    }

    fn on_timeout(&mut self) -> Step<()> {
        Step::done(())
    }

    fn on_cancel(&mut self) {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn cancel_from_inside_own_step_is_honoured() {
    init_test("cancel_from_inside_own_step_is_honoured");
    let (context, reactor) = attached_context();
    let completions: Completions<()> = Arc::new(Mutex::new(Vec::new()));
    let id_slot = Arc::new(Mutex::new(None));
    let cancelled = Arc::new(AtomicUsize::new(0));

    let id = context
        .submit(
            SelfCancelling {
                fd: 12,
                context: context.clone(),
                id: Arc::clone(&id_slot),
                cancelled: Arc::clone(&cancelled),
            },
            collector(&completions),
        )
        .expect("submit");
    *id_slot.lock() = Some(id);

    reactor.set_readable(12);
    reactor.run_once();

    let completions = completions.lock().clone();
    assert_with_log!(
        completions == vec![(id, Err(ErrorKind::Cancelled))],
        "cancelled after step",
        vec![(id, Err::<(), _>(ErrorKind::Cancelled))],
        completions
    );
    let hooks = cancelled.load(Ordering::SeqCst);
    assert_with_log!(hooks == 1, "on_cancel once", 1usize, hooks);
    assert_with_log!(reactor.is_empty(), "not re-armed", true, reactor.is_empty());
    test_complete!("cancel_from_inside_own_step_is_honoured");
}

#[test]
fn cancel_one_of_many_leaves_others_running() {
    init_test("cancel_one_of_many_leaves_others_running");
    let (context, reactor) = attached_context();
    let completions: Completions<u64> = Arc::new(Mutex::new(Vec::new()));
    let a = context.submit(Delay::new(10), collector(&completions)).expect("a");
    let b = context.submit(Delay::new(20), collector(&completions)).expect("b");

    context.cancel(a).expect("cancel a");
    assert_with_log!(reactor.active_timers() == 1, "b still armed", 1usize, reactor.active_timers());
    reactor.run_for(Duration::from_millis(20));

    let completions = completions.lock().clone();
    let expected = vec![(a, Err(ErrorKind::Cancelled)), (b, Ok(20))];
    assert_with_log!(completions == expected, "outcomes", expected, completions);
    test_complete!("cancel_one_of_many_leaves_others_running");
}

#[test]
fn detach_cancels_pending_operations() {
    init_test("detach_cancels_pending_operations");
    let (context, reactor) = attached_context();
    let completions: Completions<u64> = Arc::new(Mutex::new(Vec::new()));
    for ms in [10, 20, 30, 40] {
        context.submit(Delay::new(ms), collector(&completions)).expect("submit");
    }
    reactor.run_for(Duration::from_millis(15));

    context.detach_event_loop().expect("clean detach");
    assert_with_log!(reactor.is_empty(), "drained before cleanup", true, reactor.is_empty());
    assert_with_log!(!context.has_event_loop(), "detached", false, context.has_event_loop());

    let completions = completions.lock().clone();
    let cancelled = completions
        .iter()
        .filter(|(_, r)| *r == Err(ErrorKind::Cancelled))
        .count();
    assert_with_log!(completions.len() == 4, "every op completed", 4usize, completions.len());
    assert_with_log!(cancelled == 3, "three cancelled", 3usize, cancelled);

    let err = context.submit(Delay::new(1), |_, _| {}).expect_err("no loop");
    assert_with_log!(
        err.kind() == ErrorKind::BadContext,
        "submit needs a loop",
        ErrorKind::BadContext,
        err.kind()
    );
    test_complete!("detach_cancels_pending_operations");
}

#[test]
fn shutdown_refuses_further_use() {
    init_test("shutdown_refuses_further_use");
    let (context, reactor) = attached_context();
    context.submit(Delay::new(50), |_, _| {}).expect("submit");
    context.shutdown().expect("shutdown");
    assert_with_log!(reactor.is_empty(), "drained", true, reactor.is_empty());
    assert_with_log!(context.is_shut_down(), "shut down", true, context.is_shut_down());

    let err = context.submit(Delay::new(1), |_, _| {}).expect_err("closed");
    assert_with_log!(
        err.kind() == ErrorKind::BadContext,
        "closed context",
        ErrorKind::BadContext,
        err.kind()
    );
    test_complete!("shutdown_refuses_further_use");
}

/// Event loop that remembers every armed watcher's callbacks so a test can
/// fire them by hand, including after they were cleared.
#[derive(Default)]
struct ManualLoop {
    next: AtomicU64,
    armed: Mutex<BTreeMap<u64, (Option<EventCallback>, Option<EventCallback>, UserArg)>>,
    history: Arc<Mutex<Vec<(Option<EventCallback>, Option<EventCallback>, UserArg)>>>,
}

impl EventLoop for ManualLoop {
    fn cleanup(self: Box<Self>) -> Result<()> {
        if self.armed.lock().is_empty() {
            Ok(())
        } else {
            Err(Error::contract_violation("armed watchers at cleanup"))
        }
    }

    fn schedule_read(&self, fd: Descriptor, timeout_ms: u64, watcher: &mut Watcher) -> Result<()> {
        if fd < 0 {
            watcher.mask_read();
        }
        if timeout_ms == TIMEOUT_FOREVER {
            watcher.mask_timeout();
        }
        if watcher.is_empty() {
            return Ok(());
        }
        let key = self.next.fetch_add(1, Ordering::SeqCst);
        let entry = (
            watcher.read_callback().cloned(),
            watcher.timeout_callback().cloned(),
            Arc::clone(watcher.user_arg()),
        );
        self.history.lock().push(entry.clone());
        self.armed.lock().insert(key, entry);
        watcher.mark_armed(ReactorHandle::new(key));
        Ok(())
    }

    fn clear(&self, watcher: &mut Watcher) -> Result<()> {
        let handle = watcher
            .mark_cleared()
            .ok_or_else(|| Error::contract_violation("not armed"))?;
        self.armed.lock().remove(&handle.get());
        Ok(())
    }

    fn armed_count(&self) -> usize {
        self.armed.lock().len()
    }
}

/// Counts wakeups; finishes on the third readiness.
struct CountWakeups {
    wakeups: u32,
}

impl Operation for CountWakeups {
    type Output = u32;

    fn start(&mut self) -> Step<u32> {
        Step::Wait(Wait::readable(5, 1_000))
    }

    fn on_readable(&mut self, _fd: Descriptor) -> Step<u32> {
        self.wakeups += 1;
        if self.wakeups == 3 {
            Step::done(self.wakeups)
        } else {
            Step::Wait(Wait::readable(5, 1_000))
        }
    }

    fn on_timeout(&mut self) -> Step<u32> {
        Step::fail(Error::timed_out(1))
    }
}

#[test]
fn stale_callback_from_superseded_arming_is_ignored() {
    init_test("stale_callback_from_superseded_arming_is_ignored");
    let context = Context::new();
    let manual = ManualLoop::default();
    let history = Arc::clone(&manual.history);
    context.attach_event_loop(Box::new(manual)).expect("attach");

    let completions: Completions<u32> = Arc::new(Mutex::new(Vec::new()));
    context
        .submit(CountWakeups { wakeups: 0 }, collector(&completions))
        .expect("submit");

    let fire_read = |index: usize| {
        let (read, _, arg) = history.lock()[index].clone();
        if let Some(read) = read {
            read(&arg);
        }
    };
    let fire_timeout = |index: usize| {
        let (_, timeout, arg) = history.lock()[index].clone();
        if let Some(timeout) = timeout {
            timeout(&arg);
        }
    };

    fire_read(0);
    assert_with_log!(history.lock().len() == 2, "re-armed", 2usize, history.lock().len());

    // Both callbacks of the first arming are stale now.
    fire_read(0);
    fire_timeout(0);
    assert_with_log!(history.lock().len() == 2, "stale ignored", 2usize, history.lock().len());
    assert_with_log!(completions.lock().is_empty(), "still pending", 0usize, completions.lock().len());

    fire_read(1);
    fire_read(2);
    let completions = completions.lock().clone();
    assert_with_log!(completions.len() == 1, "completed", 1usize, completions.len());
    assert_with_log!(completions[0].1 == Ok(3), "three wakeups", Ok::<u32, ErrorKind>(3), completions[0].1);
    assert_with_log!(context.armed_watchers() == 0, "all cleared", 0usize, context.armed_watchers());
    test_complete!("stale_callback_from_superseded_arming_is_ignored");
}

#[test]
fn scheduler_runs_on_any_event_loop() {
    init_test("scheduler_runs_on_any_event_loop");
    let context = Context::new();
    let manual = ManualLoop::default();
    let history = Arc::clone(&manual.history);
    context.attach_event_loop(Box::new(manual)).expect("attach");

    let completions: Completions<u64> = Arc::new(Mutex::new(Vec::new()));
    context.submit(Delay::new(5), collector(&completions)).expect("submit");
    let (read, timeout, arg) = history.lock()[0].clone();
    assert_with_log!(read.is_none(), "delay has no read callback", true, read.is_none());
    if let Some(timeout) = timeout {
        timeout(&arg);
    }
    assert_with_log!(
        completions.lock().len() == 1,
        "delay completed",
        1usize,
        completions.lock().len()
    );
    context.detach_event_loop().expect("clean detach");
    test_complete!("scheduler_runs_on_any_event_loop");
}

proptest! {
    #![proptest_config(test_proptest_config(64))]

    #[test]
    fn every_operation_completes_exactly_once(
        delays in prop::collection::vec(1u64..500, 1..24),
        cancel_mask in prop::collection::vec(any::<bool>(), 24),
    ) {
        init_test_logging();
        let (context, reactor) = attached_context();
        let completions: Completions<u64> = Arc::new(Mutex::new(Vec::new()));
        let mut ids = Vec::new();
        for ms in &delays {
            ids.push(context.submit(Delay::new(*ms), collector(&completions)).unwrap());
        }
        let mut expected_cancelled = 0usize;
        for (id, cancel) in ids.iter().zip(&cancel_mask) {
            if *cancel {
                context.cancel(*id).unwrap();
                expected_cancelled += 1;
            }
        }
        reactor.run_for(Duration::from_millis(500));

        let completions = completions.lock().clone();
        prop_assert_eq!(completions.len(), delays.len());
        let mut seen: Vec<OperationId> = completions.iter().map(|(id, _)| *id).collect();
        seen.sort();
        seen.dedup();
        prop_assert_eq!(seen.len(), delays.len());
        let cancelled = completions.iter().filter(|(_, r)| r.is_err()).count();
        prop_assert_eq!(cancelled, expected_cancelled);
        prop_assert_eq!(context.pending_count(), 0);
        prop_assert!(reactor.is_empty());
    }
}
