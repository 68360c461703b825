use super::*;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

/// Opt-in diagnostics: `RUST_LOG=eventbox=trace cargo test -- --nocapture`.
fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

// ---------------------------------------------------------------------------
// bounded queue: async producers, yield consumers

#[derive(Default)]
struct BoundedQueue {
    items: Vec<Value>,
    waiting: Vec<Completion>,
}

impl Boxable for BoundedQueue {
    fn interface() -> Interface {
        Interface::new()
            .op(OperationDef::async_call("enq"))
            .op(OperationDef::yield_call("deq"))
    }

    fn dispatch(&mut self, _scope: &mut EventScope<'_>, mut call: MethodCall) -> Result<Dispatch> {
        match call.name.as_ref() {
            "enq" => {
                self.items.push(call.arg(0));
                if !self.waiting.is_empty() {
                    let completion = self.waiting.remove(0);
                    completion.complete(self.items.remove(0))?;
                }
                Ok(Dispatch::nil())
            }
            "deq" => {
                let completion = call.take_completion().expect("deq is a yield call");
                if self.items.is_empty() {
                    self.waiting.push(completion);
                } else {
                    completion.complete(self.items.remove(0))?;
                }
                Ok(Dispatch::Pending)
            }
            other => Err(Error::invalid_access(format!("unknown operation `{other}'"))),
        }
    }
}

#[test]
fn bounded_queue_two_producers_two_consumers() {
    init_tracing();
    let bx = Eventbox::new(BoundedQueue::default());

    let mut consumers = Vec::new();
    for _ in 0..2 {
        let bx = bx.clone();
        consumers.push(thread::spawn(move || {
            let mut seen = Vec::new();
            loop {
                let v = bx.call_yield("deq", CallArgs::new()).unwrap();
                if v.is_nil() {
                    break;
                }
                seen.push(v.as_int().unwrap());
            }
            seen
        }));
    }

    // let both consumers reach their first deq before anything is produced
    thread::sleep(Duration::from_millis(50));

    let mut producers = Vec::new();
    for half in 0..2i64 {
        let bx = bx.clone();
        producers.push(thread::spawn(move || {
            for i in 0..500i64 {
                bx.call_async("enq", CallArgs::new().arg(half * 500 + i))
                    .unwrap();
                if i % 100 == 99 {
                    thread::sleep(Duration::from_millis(1));
                }
            }
            bx.call_async("enq", CallArgs::new().arg(Value::Nil)).unwrap();
        }));
    }
    for p in producers {
        p.join().unwrap();
    }

    let results: Vec<Vec<i64>> = consumers.into_iter().map(|c| c.join().unwrap()).collect();
    let total: usize = results.iter().map(Vec::len).sum();
    assert_eq!(total, 1000);
    assert!(
        results.iter().all(|r| !r.is_empty()),
        "each consumer drains at least one item"
    );
    let mut union = results.concat();
    union.sort_unstable();
    assert_eq!(union, (0..1000).collect::<Vec<_>>());
}

// ---------------------------------------------------------------------------
// shared counter under action load

#[derive(Default)]
struct Counter {
    count: i64,
    returns: Vec<Value>,
}

impl Boxable for Counter {
    fn interface() -> Interface {
        Interface::new()
            .op(OperationDef::sync_call("incr"))
            .op(OperationDef::async_call("record"))
            .op(OperationDef::sync_call("count"))
            .op(OperationDef::sync_call("returns"))
            .op(OperationDef::action("hammer"))
    }

    fn dispatch(&mut self, _scope: &mut EventScope<'_>, call: MethodCall) -> Result<Dispatch> {
        match call.name.as_ref() {
            "incr" => {
                self.count += 1;
                Ok(Dispatch::value(self.count))
            }
            "record" => {
                self.returns.push(call.arg(0));
                Ok(Dispatch::nil())
            }
            "count" => Ok(Dispatch::value(self.count)),
            "returns" => Ok(Dispatch::value(Value::list(self.returns.clone()))),
            "hammer" => Ok(Dispatch::action(move |scope| {
                for _ in 0..100 {
                    let bx = scope.eventbox()?;
                    let v = bx.call_sync("incr", CallArgs::new())?;
                    bx.call_async("record", CallArgs::new().arg(v))?;
                }
                Ok(())
            })),
            other => Err(Error::invalid_access(format!("unknown operation `{other}'"))),
        }
    }
}

#[test]
fn counter_under_three_hammering_actions() {
    init_tracing();
    let bx = Eventbox::new(Counter::default());
    let actions: Vec<Action> = (0..3)
        .map(|_| bx.start_action("hammer", CallArgs::new()).unwrap())
        .collect();
    for action in &actions {
        action.join();
    }

    assert_eq!(
        bx.call_sync("count", CallArgs::new()).unwrap(),
        Value::Int(300)
    );
    let returns = bx.call_sync("returns", CallArgs::new()).unwrap();
    let mut values: Vec<i64> = returns
        .as_list()
        .unwrap()
        .lock()
        .iter()
        .map(|v| v.as_int().unwrap())
        .collect();
    values.sort_unstable();
    assert_eq!(values, (1..=300).collect::<Vec<_>>());
    assert_eq!(bx.running_actions(), 0);
}

// ---------------------------------------------------------------------------
// yield call with external callback

struct Relay;

impl Boxable for Relay {
    fn interface() -> Interface {
        Interface::new().op(OperationDef::yield_call("doit"))
    }

    fn dispatch(&mut self, scope: &mut EventScope<'_>, mut call: MethodCall) -> Result<Dispatch> {
        match call.name.as_ref() {
            "doit" => {
                let a = call.arg(0);
                let block = call
                    .block
                    .clone()
                    .ok_or_else(|| Error::invalid_access("doit needs a block"))?;
                let completion = call.take_completion().expect("doit is a yield call");
                let reply = scope.async_proc(move |_state, _scope, args| {
                    let s = args.arg(0);
                    let s = s.as_str().unwrap_or("");
                    completion.complete(Value::from(format!("[{s}]")))?;
                    Ok(Value::Nil)
                });
                let input = format!("{}c", a.as_str().unwrap_or(""));
                scope.call_external(
                    &block,
                    CallArgs::new().arg(input),
                    Some(Value::Proc(reply)),
                )?;
                Ok(Dispatch::Pending)
            }
            other => Err(Error::invalid_access(format!("unknown operation `{other}'"))),
        }
    }
}

#[test]
fn yield_call_drives_external_block_on_caller_thread() {
    let bx = Eventbox::new(Relay);
    let ran_in_scope = Arc::new(Mutex::new(None::<bool>));

    let probe = ran_in_scope.clone();
    let bx_probe = bx.clone();
    let block = Proc::native(move |args: CallArgs| {
        *probe.lock() = Some(bx_probe.in_event_scope());
        let s = args.args[0].as_str().unwrap_or("").to_uppercase();
        Ok(Value::from(s))
    });

    let out = bx
        .call_yield(
            "doit",
            CallArgs::new().arg("x").block(Value::Proc(block)),
        )
        .unwrap();
    assert_eq!(out, Value::from("[XC]"));
    assert_eq!(
        *ran_in_scope.lock(),
        Some(false),
        "the block ran outside the event scope"
    );
}

// ---------------------------------------------------------------------------
// action interrupted mid-wait

struct Waiter {
    rescued: Arc<AtomicUsize>,
}

impl Boxable for Waiter {
    fn interface() -> Interface {
        Interface::new().op(OperationDef::action("wait_for_stop"))
    }

    fn dispatch(&mut self, _scope: &mut EventScope<'_>, call: MethodCall) -> Result<Dispatch> {
        match call.name.as_ref() {
            "wait_for_stop" => {
                let rescued = self.rescued.clone();
                Ok(Dispatch::action(move |scope| {
                    match scope.interruptible(|| scope.park()) {
                        Err(Error::Raised(v)) if v == Value::sym("stop") => {
                            rescued.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                        Err(e) => Err(e),
                        Ok(()) => Ok(()),
                    }
                }))
            }
            other => Err(Error::invalid_access(format!("unknown operation `{other}'"))),
        }
    }
}

#[test]
fn action_rescues_user_interrupt_exactly_once() {
    let rescued = Arc::new(AtomicUsize::new(0));
    let bx = Eventbox::new(Waiter {
        rescued: rescued.clone(),
    });

    let action = bx.start_action("wait_for_stop", CallArgs::new()).unwrap();
    assert_eq!(bx.running_actions(), 1);
    assert!(!action.is_current());

    action.raise(Value::sym("stop"));
    action.join();

    assert_eq!(rescued.load(Ordering::SeqCst), 1);
    assert_eq!(bx.running_actions(), 0);
}

#[test]
fn abort_penetrates_a_parked_action_without_a_window() {
    let bx = Eventbox::new(Waiter {
        rescued: Arc::new(AtomicUsize::new(0)),
    });
    let _action = bx.start_action("wait_for_stop", CallArgs::new()).unwrap();
    assert_eq!(bx.running_actions(), 1);

    bx.shutdown_and_wait().unwrap();
    assert_eq!(bx.running_actions(), 0);
}

// ---------------------------------------------------------------------------
// dissection of a partially copyable container

struct ClassifierBox;

impl Boxable for ClassifierBox {
    fn interface() -> Interface {
        Interface::new().op(OperationDef::sync_call("classify"))
    }

    fn dispatch(&mut self, _scope: &mut EventScope<'_>, call: MethodCall) -> Result<Dispatch> {
        match call.name.as_ref() {
            "classify" => {
                let v = call.arg(0);
                let list = v
                    .as_list()
                    .ok_or_else(|| Error::invalid_access("classify expects a list"))?;
                let kinds: Vec<Value> = list
                    .lock()
                    .iter()
                    .map(|item| Value::str(item.kind_name()))
                    .collect();
                Ok(Dispatch::value(Value::list(kinds)))
            }
            other => Err(Error::invalid_access(format!("unknown operation `{other}'"))),
        }
    }
}

#[test]
fn failed_deep_copy_falls_back_to_dissection() {
    let bx = Eventbox::new(ClassifierBox);

    let resource = Value::opaque(0xdead_beef_u64);
    let callable = Value::Proc(Proc::native(|_| Ok(Value::Nil)));
    let container = Value::list(vec![Value::str("abc"), callable.clone(), resource.clone()]);
    let ids_before: Vec<Option<usize>> = container
        .as_list()
        .unwrap()
        .lock()
        .iter()
        .map(Value::identity)
        .collect();

    let out = bx
        .call_sync("classify", CallArgs::new().arg(container.clone()))
        .unwrap();
    let kinds: Vec<String> = out
        .as_list()
        .unwrap()
        .lock()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    assert_eq!(kinds, ["string", "external-proc", "external-object"]);

    // the caller's container is untouched: same cell, same element identities
    let after = container.as_list().unwrap().lock();
    let ids_after: Vec<Option<usize>> = after.iter().map(Value::identity).collect();
    assert_eq!(ids_before, ids_after);
    assert_eq!(after[0], Value::str("abc"));
    assert_eq!(after.len(), 3);
}

// ---------------------------------------------------------------------------
// threadpool fairness under action load

#[derive(Default)]
struct PoolProbe {
    seen: Vec<(i64, String)>,
}

impl Boxable for PoolProbe {
    fn interface() -> Interface {
        Interface::new()
            .op(OperationDef::async_call("record"))
            .op(OperationDef::sync_call("snapshot"))
            .op(OperationDef::action("task"))
    }

    fn dispatch(&mut self, _scope: &mut EventScope<'_>, call: MethodCall) -> Result<Dispatch> {
        match call.name.as_ref() {
            "record" => {
                let idx = call.arg(0).as_int().unwrap_or(-1);
                let worker = call.arg(1).as_str().unwrap_or("?").to_string();
                self.seen.push((idx, worker));
                Ok(Dispatch::nil())
            }
            "snapshot" => Ok(Dispatch::value(Value::list(
                self.seen
                    .iter()
                    .map(|(idx, worker)| {
                        Value::list(vec![Value::Int(*idx), Value::str(worker.as_str())])
                    })
                    .collect(),
            ))),
            "task" => {
                let idx = call.arg(0);
                Ok(Dispatch::action(move |scope| {
                    let worker = thread::current().name().unwrap_or("?").to_string();
                    scope.sleep(Duration::from_millis(2))?;
                    let bx = scope.eventbox()?;
                    bx.call_async("record", CallArgs::new().arg(idx.clone()).arg(worker))?;
                    Ok(())
                }))
            }
            other => Err(Error::invalid_access(format!("unknown operation `{other}'"))),
        }
    }
}

#[test]
fn pooled_actions_are_fifo_and_spread_over_all_workers() {
    let pool = ThreadPool::new(3);
    let bx = Eventbox::with_options(
        PoolProbe::default(),
        Options {
            threadpool: ThreadPolicy::Pool(pool.clone()),
            ..Options::default()
        },
    );

    let actions: Vec<Action> = (0..50i64)
        .map(|i| bx.start_action("task", CallArgs::new().arg(i)).unwrap())
        .collect();
    for action in &actions {
        action.join();
    }

    let snapshot = bx.call_sync("snapshot", CallArgs::new()).unwrap();
    let entries: Vec<(i64, String)> = snapshot
        .as_list()
        .unwrap()
        .lock()
        .iter()
        .map(|pair| {
            let pair = pair.as_list().unwrap().lock().clone();
            (pair[0].as_int().unwrap(), pair[1].as_str().unwrap().to_string())
        })
        .collect();

    let mut indices: Vec<i64> = entries.iter().map(|(i, _)| *i).collect();
    indices.sort_unstable();
    assert_eq!(indices, (0..50).collect::<Vec<_>>(), "each task ran exactly once");

    let workers: std::collections::BTreeSet<String> =
        entries.iter().map(|(_, w)| w.clone()).collect();
    assert_eq!(workers.len(), 3, "all three pool workers served tasks");

    pool.shutdown();
}

// ---------------------------------------------------------------------------
// wrapper and proc round trips

#[derive(Default)]
struct Vault {
    stash: Option<Value>,
}

impl Boxable for Vault {
    fn interface() -> Interface {
        Interface::new()
            .op(OperationDef::sync_call("make"))
            .op(OperationDef::sync_call("is_same"))
            .op(OperationDef::sync_call("echo"))
            .op(OperationDef::sync_call("echo_kwarg"))
    }

    fn dispatch(&mut self, scope: &mut EventScope<'_>, call: MethodCall) -> Result<Dispatch> {
        match call.name.as_ref() {
            "make" => {
                let list = Value::list(vec![Value::Int(7)]);
                let shared = scope.shared_object(&list)?;
                self.stash = Some(list);
                Ok(Dispatch::Value(shared))
            }
            "is_same" => {
                let incoming = call.arg(0);
                let same = match (&self.stash, incoming.identity()) {
                    (Some(kept), Some(id)) => kept.identity() == Some(id),
                    _ => false,
                };
                Ok(Dispatch::value(same))
            }
            "echo" => Ok(Dispatch::Value(call.arg(0))),
            "echo_kwarg" => Ok(Dispatch::Value(
                call.kwarg("k").cloned().unwrap_or(Value::Nil),
            )),
            other => Err(Error::invalid_access(format!("unknown operation `{other}'"))),
        }
    }
}

#[test]
fn shared_object_round_trips_by_identity() {
    let bx = Eventbox::new(Vault::default());
    let wrapped = bx.call_sync("make", CallArgs::new()).unwrap();
    assert_eq!(wrapped.kind_name(), "wrapped-object");

    let same = bx
        .call_sync("is_same", CallArgs::new().arg(wrapped.clone()))
        .unwrap();
    assert_eq!(same, Value::Bool(true));
}

#[test]
fn external_proc_round_trips_to_the_original_callable() {
    let bx = Eventbox::new(Vault::default());
    let callable = Value::Proc(Proc::native(|_| Ok(Value::Int(5))));

    let out = bx
        .call_sync("echo", CallArgs::new().arg(callable.clone()))
        .unwrap();
    assert_eq!(out.kind_name(), "proc");
    assert_eq!(out.identity(), callable.identity());
    // and it still works
    if let Value::Proc(p) = out {
        assert_eq!(p.call(CallArgs::new()).unwrap(), Value::Int(5));
    } else {
        panic!("expected a proc back");
    }
}

#[test]
fn mutable_containers_cross_as_detached_copies() {
    let bx = Eventbox::new(Vault::default());
    let list = Value::list_of([1, 2, 3]);
    let out = bx
        .call_sync("echo", CallArgs::new().arg(list.clone()))
        .unwrap();
    assert_eq!(out, list);
    assert_ne!(out.identity(), list.identity());
    out.as_list().unwrap().lock().push(Value::Int(4));
    assert_eq!(list.as_list().unwrap().lock().len(), 3);
}

#[test]
fn keyword_arguments_travel_as_their_own_stream() {
    let bx = Eventbox::new(Vault::default());
    let out = bx
        .call_sync("echo_kwarg", CallArgs::new().arg(1).kwarg("k", "v"))
        .unwrap();
    assert_eq!(out, Value::from("v"));
}

#[test]
fn foreign_loop_tagged_values_are_rejected() {
    let bx = Eventbox::new(Vault::default());
    let foreign = Value::list(vec![]);
    crate::registry::mark(&foreign, crate::registry::ScopeId::Loop(LoopId::next())).unwrap();

    let err = bx
        .call_sync("echo", CallArgs::new().arg(foreign))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidAccess(_)));
}

// ---------------------------------------------------------------------------
// completion semantics

#[derive(Default)]
struct Doubler {
    second_failed: bool,
}

impl Boxable for Doubler {
    fn interface() -> Interface {
        Interface::new()
            .op(OperationDef::yield_call("twice"))
            .op(OperationDef::yield_call("never"))
            .op(OperationDef::yield_call("boom"))
            .op(OperationDef::sync_call("fail_sync"))
            .op(OperationDef::sync_call("second_failed"))
    }

    fn dispatch(&mut self, _scope: &mut EventScope<'_>, mut call: MethodCall) -> Result<Dispatch> {
        match call.name.as_ref() {
            "twice" => {
                let completion = call.take_completion().expect("yield call");
                completion.complete(Value::Int(1))?;
                self.second_failed = completion.complete(Value::Int(2)).is_err();
                Ok(Dispatch::Pending)
            }
            "never" => {
                // completion dropped unfired
                drop(call.take_completion());
                Ok(Dispatch::Pending)
            }
            "boom" => Err(Error::raised(Value::sym("boom"))),
            "fail_sync" => Err(Error::raised(Value::sym("sync-boom"))),
            "second_failed" => Ok(Dispatch::value(self.second_failed)),
            other => Err(Error::invalid_access(format!("unknown operation `{other}'"))),
        }
    }
}

#[test]
fn completion_is_single_shot() {
    let bx = Eventbox::new(Doubler::default());
    let first = bx.call_yield("twice", CallArgs::new()).unwrap();
    assert_eq!(first, Value::Int(1));
    assert_eq!(
        bx.call_sync("second_failed", CallArgs::new()).unwrap(),
        Value::Bool(true)
    );
}

#[test]
fn abandoned_yield_calls_do_not_hang_their_caller() {
    let bx = Eventbox::new(Doubler::default());
    let err = bx.call_yield("never", CallArgs::new()).unwrap_err();
    match err {
        Error::InvalidAccess(msg) => assert!(msg.contains("abandoned")),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn yield_body_errors_reach_the_caller_as_exceptions() {
    let bx = Eventbox::new(Doubler::default());
    let err = bx.call_yield("boom", CallArgs::new()).unwrap_err();
    match err {
        Error::Raised(v) => assert_eq!(v, Value::sym("boom")),
        other => panic!("unexpected error: {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// scope discipline

#[derive(Default)]
struct Nested {
    hits: i64,
}

impl Boxable for Nested {
    fn interface() -> Interface {
        Interface::new()
            .op(OperationDef::sync_call("outer"))
            .op(OperationDef::sync_call("inner"))
            .op(OperationDef::sync_call("push_back"))
            .op(OperationDef::async_call("push_back_later"))
            .op(OperationDef::sync_call("keep").with_plan(ArgPlan::new().shared_arg(0)))
            .op(OperationDef::sync_call("bump_via_proc"))
            .op(OperationDef::sync_call("make_bumper"))
            .op(OperationDef::sync_call("make_sync_doubler"))
            .op(OperationDef::sync_call("make_yield_doubler"))
    }

    fn dispatch(&mut self, scope: &mut EventScope<'_>, call: MethodCall) -> Result<Dispatch> {
        match call.name.as_ref() {
            "outer" => {
                let reentrant = scope.eventbox().call_sync("inner", CallArgs::new());
                Ok(Dispatch::value(matches!(
                    reentrant,
                    Err(Error::InvalidAccess(_))
                )))
            }
            "inner" => Ok(Dispatch::value(1)),
            "keep" | "push_back" | "push_back_later" => match call.arg(0) {
                Value::External(x) => {
                    x.send(scope, "push", CallArgs::new().arg(99), None)?;
                    Ok(Dispatch::nil())
                }
                other => Err(Error::invalid_access(format!(
                    "expected an external object, got {}",
                    other.kind_name()
                ))),
            },
            "bump_via_proc" => {
                let bump = scope.async_proc(|state, _scope, _args| {
                    let host = state
                        .downcast_mut::<Nested>()
                        .ok_or_else(|| Error::invalid_access("wrong state type"))?;
                    host.hits += 41;
                    Ok(Value::Int(host.hits))
                });
                let out = bump.invoke_in_scope(self, scope, ProcArgs::new(vec![]))?;
                Ok(Dispatch::value(out.as_int().unwrap_or(0) + 1))
            }
            "make_bumper" => {
                let p = scope.async_proc(|_state, _scope, _args| Ok(Value::Nil));
                Ok(Dispatch::Value(Value::Proc(p)))
            }
            "make_sync_doubler" => {
                let p = scope.sync_proc(|_state, _scope, args| {
                    Ok(Value::Int(args.arg(0).as_int().unwrap_or(0) * 2))
                });
                Ok(Dispatch::Value(Value::Proc(p)))
            }
            "make_yield_doubler" => {
                let p = scope.yield_proc(|_state, _scope, args| {
                    let completion = args
                        .completion
                        .as_ref()
                        .ok_or_else(|| Error::invalid_access("yield proc without completion"))?;
                    completion.complete(Value::Int(args.arg(0).as_int().unwrap_or(0) * 2))?;
                    Ok(Value::Nil)
                });
                Ok(Dispatch::Value(Value::Proc(p)))
            }
            other => Err(Error::invalid_access(format!("unknown operation `{other}'"))),
        }
    }
}

#[test]
fn reentrant_external_calls_are_diagnosed_not_deadlocked() {
    let bx = Eventbox::new(Nested::default());
    let out = bx.call_sync("outer", CallArgs::new()).unwrap();
    assert_eq!(out, Value::Bool(true));
}

#[test]
fn send_primitive_runs_on_the_waiting_caller() {
    let bx = Eventbox::new(Nested::default());
    let list = Value::list(vec![Value::Int(1)]);
    bx.shared_object(&list).unwrap();

    bx.call_sync("push_back", CallArgs::new().arg(list.clone()))
        .unwrap();
    // the callback preceded the sync result on the answer queue
    let items = list.as_list().unwrap().lock().clone();
    assert_eq!(items, vec![Value::Int(1), Value::Int(99)]);
}

#[test]
fn shared_argument_plan_wraps_without_marking_first() {
    let bx = Eventbox::new(Nested::default());
    // a plain, unmarked list: the operation's plan makes it cross by
    // reference instead of by copy
    let list = Value::list(vec![Value::Int(1)]);
    bx.call_sync("keep", CallArgs::new().arg(list.clone()))
        .unwrap();
    let items = list.as_list().unwrap().lock().clone();
    assert_eq!(items, vec![Value::Int(1), Value::Int(99)]);
}

#[test]
fn internal_procs_run_directly_in_scope() {
    let bx = Eventbox::new(Nested::default());
    let out = bx.call_sync("bump_via_proc", CallArgs::new()).unwrap();
    assert_eq!(out, Value::Int(42));
}

#[test]
fn async_procs_cross_out_and_reenter_the_loop() {
    let bx = Eventbox::new(Nested::default());
    let p = bx.call_sync("make_bumper", CallArgs::new()).unwrap();
    assert_eq!(p.kind_name(), "async-proc");
    if let Value::Proc(p) = p {
        let reply = p.call(CallArgs::new()).unwrap();
        assert_eq!(reply.kind_name(), "instance");
    } else {
        panic!("expected the async proc back");
    }
}

#[test]
fn sync_and_yield_procs_behave_like_their_call_kinds() {
    let bx = Eventbox::new(Nested::default());

    let doubler = bx.call_sync("make_sync_doubler", CallArgs::new()).unwrap();
    assert_eq!(doubler.kind_name(), "sync-proc");
    if let Value::Proc(p) = doubler {
        assert_eq!(p.call(CallArgs::new().arg(21)).unwrap(), Value::Int(42));
    } else {
        panic!("expected the sync proc back");
    }

    let doubler = bx.call_sync("make_yield_doubler", CallArgs::new()).unwrap();
    assert_eq!(doubler.kind_name(), "yield-proc");
    if let Value::Proc(p) = doubler {
        assert_eq!(p.call(CallArgs::new().arg(4)).unwrap(), Value::Int(8));
    } else {
        panic!("expected the yield proc back");
    }
}

#[test]
fn call_context_drives_sends_without_a_call_in_flight() {
    let bx = Eventbox::new(Nested::default());
    let ctx = bx.new_call_context(Some("driver"));

    let list = Value::list(vec![]);
    let wrapped = ctx.wrap(&list).unwrap();
    assert_eq!(wrapped.kind_name(), "external-object");

    // an async call services no answer queue, so the send falls back to the
    // context; this thread then executes the callback by driving it
    bx.call_async("push_back_later", CallArgs::new().arg(wrapped))
        .unwrap();
    assert!(ctx.process_one(Duration::from_millis(500)));
    assert_eq!(
        list.as_list().unwrap().lock().clone(),
        vec![Value::Int(99)]
    );
    ctx.close();
}

#[test]
fn sync_body_errors_surface_to_the_caller() {
    let bx = Eventbox::new(Doubler::default());
    let err = bx.call_sync("fail_sync", CallArgs::new()).unwrap_err();
    match err {
        Error::Raised(v) => assert_eq!(v, Value::sym("sync-boom")),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn undeclared_operations_and_wrong_entry_points_are_invalid_access() {
    let bx = Eventbox::new(Nested::default());
    assert!(matches!(
        bx.call_sync("no_such_op", CallArgs::new()),
        Err(Error::InvalidAccess(_))
    ));
    assert!(matches!(
        bx.call_async("inner", CallArgs::new()),
        Err(Error::InvalidAccess(_))
    ));
}

// ---------------------------------------------------------------------------
// guard time and shutdown

#[test]
fn guard_time_observer_sees_every_scope_execution() {
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    let bx = Eventbox::with_options(
        Vault::default(),
        Options {
            guard_time: GuardTime::observer(move |_, name| sink.lock().push(name.to_string())),
            ..Options::default()
        },
    );
    bx.call_sync("echo", CallArgs::new().arg(1)).unwrap();
    assert_eq!(*log.lock(), vec!["echo".to_string()]);
}

struct Host;

impl Boxable for Host {
    fn interface() -> Interface {
        Interface::new()
            .op(OperationDef::action("spin"))
            .op(OperationDef::async_call("stop"))
    }

    fn dispatch(&mut self, scope: &mut EventScope<'_>, call: MethodCall) -> Result<Dispatch> {
        match call.name.as_ref() {
            "spin" => Ok(Dispatch::action(move |scope| loop {
                scope.sleep(Duration::from_millis(10))?;
            })),
            "stop" => {
                scope.shutdown(Some(call.arg(0)))?;
                Ok(Dispatch::nil())
            }
            other => Err(Error::invalid_access(format!("unknown operation `{other}'"))),
        }
    }
}

#[test]
fn in_scope_shutdown_fires_completion_after_workers_join() {
    let bx = Eventbox::new(Host);
    let _a = bx.start_action("spin", CallArgs::new()).unwrap();
    let _b = bx.start_action("spin", CallArgs::new()).unwrap();
    assert_eq!(bx.running_actions(), 2);

    let (tx, rx) = crossbeam::channel::bounded::<()>(1);
    let done = Proc::native(move |_| {
        let _ = tx.send(());
        Ok(Value::Nil)
    });
    bx.call_async("stop", CallArgs::new().arg(Value::Proc(done)))
        .unwrap();

    rx.recv_timeout(Duration::from_secs(5))
        .expect("shutdown completion fired");
    assert_eq!(bx.running_actions(), 0);
}

#[test]
fn kind_dispatched_call_returns_matching_replies() {
    let bx = Eventbox::new(Counter::default());
    match bx.call("incr", CallArgs::new()).unwrap() {
        Reply::Value(v) => assert_eq!(v, Value::Int(1)),
        _ => panic!("sync call must return a value"),
    }
    match bx.call("record", CallArgs::new().arg(0)).unwrap() {
        Reply::Instance(handle) => assert_eq!(handle, bx),
        _ => panic!("async call must return the instance"),
    }
    match bx.call("hammer", CallArgs::new()).unwrap() {
        Reply::Action(action) => action.join(),
        _ => panic!("action call must return the action"),
    }
}

#[test]
fn late_raise_on_a_finished_action_is_silent() {
    let bx = Eventbox::new(Counter::default());
    let action = bx.start_action("hammer", CallArgs::new()).unwrap();
    action.join();
    action.raise(Value::sym("too-late"));
    action.abort();
    assert_eq!(bx.running_actions(), 0);
}
