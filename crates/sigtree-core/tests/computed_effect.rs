use serde_json::json;
use serde_json::Value;
use sigtree_core::{
    ComputedSignal, Effect, EffectDispatcher, Id, ImmediateDispatcher, NodeUsage, Scope,
    SignalCommand, SignalTree,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn set(target: Id, value: Value) -> SignalCommand {
    SignalCommand::Set {
        command_id: Id::random(),
        target,
        value: Some(value),
    }
}

/// Reads a tree's root value the way a signal would: through the scope's
/// transaction, registering the node as a dependency.
fn tracked_root_value(tree: &SignalTree, scope: &mut Scope<'_>) -> Value {
    let value = scope
        .transaction()
        .read(tree)
        .data(Id::ZERO)
        .and_then(|data| data.value.clone())
        .unwrap_or(Value::Null);
    if let Some(usage) = NodeUsage::capture_content(tree, Id::ZERO, scope.transaction()) {
        scope.register_usage(Arc::new(usage));
    }
    value
}

struct QueueDispatcher {
    tasks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl QueueDispatcher {
    fn new() -> Arc<QueueDispatcher> {
        Arc::new(QueueDispatcher {
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn queued(&self) -> usize {
        self.tasks.lock().expect("tasks lock").len()
    }

    fn run_all(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().expect("tasks lock"));
        for task in tasks {
            task();
        }
    }
}

impl EffectDispatcher for QueueDispatcher {
    fn dispatch(&self, task: Box<dyn FnOnce() + Send>) {
        self.tasks.lock().expect("tasks lock").push(task);
    }
}

#[test]
fn computed_value_is_cached_until_a_dependency_changes() {
    let tree = SignalTree::synchronous();
    tree.commit_single_command(set(Id::ZERO, json!(2)), None);

    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    let source = tree.clone();
    let doubled = ComputedSignal::new(move |scope| {
        counter.fetch_add(1, Ordering::SeqCst);
        let value = tracked_root_value(&source, scope);
        value.as_f64().unwrap_or(0.0) * 2.0
    });

    assert_eq!(doubled.peek(), 4.0);
    assert_eq!(doubled.peek(), 4.0);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    tree.commit_single_command(set(Id::ZERO, json!(5)), None);
    assert_eq!(doubled.peek(), 10.0);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn recomputing_to_an_equal_value_does_not_invalidate_dependents() {
    let tree = SignalTree::synchronous();
    tree.commit_single_command(set(Id::ZERO, json!("x")), None);

    let source = tree.clone();
    let has_value = ComputedSignal::new(move |scope| {
        tracked_root_value(&source, scope) != Value::Null
    });

    let dependent_runs = Arc::new(AtomicUsize::new(0));
    let counter = dependent_runs.clone();
    let upstream = has_value.clone();
    let dependent = ComputedSignal::new(move |scope| {
        counter.fetch_add(1, Ordering::SeqCst);
        upstream.value(scope)
    });

    assert!(dependent.peek());
    assert_eq!(dependent_runs.load(Ordering::SeqCst), 1);

    // The upstream signal recomputes but its value is unchanged, so the
    // dependent's cache stays valid.
    tree.commit_single_command(set(Id::ZERO, json!("y")), None);
    assert!(dependent.peek());
    assert_eq!(dependent_runs.load(Ordering::SeqCst), 1);

    tree.commit_single_command(
        SignalCommand::Set {
            command_id: Id::random(),
            target: Id::ZERO,
            value: None,
        },
        None,
    );
    assert!(!dependent.peek());
    assert_eq!(dependent_runs.load(Ordering::SeqCst), 2);
}

#[test]
fn effect_runs_eagerly_and_reruns_on_dependency_changes() {
    let tree = SignalTree::synchronous();
    let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = seen.clone();
    let source = tree.clone();
    let _effect = Effect::new(Arc::new(ImmediateDispatcher), move |scope| {
        let value = tracked_root_value(&source, scope);
        sink.lock().expect("seen lock").push(value);
    });

    assert_eq!(seen.lock().expect("seen lock").clone(), vec![Value::Null]);

    tree.commit_single_command(set(Id::ZERO, json!(1)), None);
    tree.commit_single_command(set(Id::ZERO, json!(2)), None);
    assert_eq!(
        seen.lock().expect("seen lock").clone(),
        vec![Value::Null, json!(1), json!(2)]
    );
}

#[test]
fn queued_dispatcher_coalesces_change_bursts() {
    let tree = SignalTree::synchronous();
    let dispatcher = QueueDispatcher::new();
    let runs = Arc::new(AtomicUsize::new(0));

    let counter = runs.clone();
    let source = tree.clone();
    let _effect = Effect::new(dispatcher.clone(), move |scope| {
        counter.fetch_add(1, Ordering::SeqCst);
        tracked_root_value(&source, scope);
    });
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    tree.commit_single_command(set(Id::ZERO, json!(1)), None);
    tree.commit_single_command(set(Id::ZERO, json!(2)), None);
    assert_eq!(dispatcher.queued(), 1);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    dispatcher.run_all();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn disposed_effect_ignores_queued_and_future_changes() {
    let tree = SignalTree::synchronous();
    let dispatcher = QueueDispatcher::new();
    let runs = Arc::new(AtomicUsize::new(0));

    let counter = runs.clone();
    let source = tree.clone();
    let effect = Effect::new(dispatcher.clone(), move |scope| {
        counter.fetch_add(1, Ordering::SeqCst);
        tracked_root_value(&source, scope);
    });

    tree.commit_single_command(set(Id::ZERO, json!(1)), None);
    effect.dispose();
    dispatcher.run_all();
    tree.commit_single_command(set(Id::ZERO, json!(2)), None);
    dispatcher.run_all();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
#[should_panic(expected = "cannot include commands in a read-only transaction")]
fn effect_action_cannot_write_to_a_regular_tree() {
    let tree = SignalTree::synchronous();
    let target = tree.clone();
    let _effect = Effect::new(Arc::new(ImmediateDispatcher), move |scope| {
        scope
            .transaction()
            .include(&target, set(Id::ZERO, json!("from effect")), None);
    });
}

#[test]
fn concurrent_dependency_commits_do_not_block_each_other() {
    let left = SignalTree::synchronous();
    let right = SignalTree::synchronous();

    let (left_reader, right_reader) = (left.clone(), right.clone());
    let sum = ComputedSignal::new(move |scope| {
        tracked_root_value(&left_reader, scope).as_f64().unwrap_or(0.0)
            + tracked_root_value(&right_reader, scope).as_f64().unwrap_or(0.0)
    });
    assert_eq!(sum.peek(), 0.0);

    // Each commit notifies the computed signal while the committing tree is
    // locked; the revalidation that follows takes both trees' locks, so it
    // must not run until the notifying thread has released its own.
    let mut workers = Vec::new();
    for tree in [left.clone(), right.clone()] {
        workers.push(std::thread::spawn(move || {
            for step in 1..=25 {
                tree.commit_single_command(set(Id::ZERO, json!(step)), None);
            }
        }));
    }
    for worker in workers {
        worker.join().expect("worker");
    }

    assert_eq!(sum.peek(), 50.0);
}

#[test]
fn effect_retracks_dependencies_on_every_run() {
    let switch = SignalTree::synchronous();
    switch.commit_single_command(set(Id::ZERO, json!("left")), None);
    let left = SignalTree::synchronous();
    let right = SignalTree::synchronous();

    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    let (switch_reader, left_reader, right_reader) =
        (switch.clone(), left.clone(), right.clone());
    let _effect = Effect::new(Arc::new(ImmediateDispatcher), move |scope| {
        counter.fetch_add(1, Ordering::SeqCst);
        if tracked_root_value(&switch_reader, scope) == json!("left") {
            tracked_root_value(&left_reader, scope);
        } else {
            tracked_root_value(&right_reader, scope);
        }
    });
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // Not a dependency while the switch points left.
    right.commit_single_command(set(Id::ZERO, json!(1)), None);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    switch.commit_single_command(set(Id::ZERO, json!("right")), None);
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    // After retracking, the roles are swapped.
    left.commit_single_command(set(Id::ZERO, json!(1)), None);
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    right.commit_single_command(set(Id::ZERO, json!(2)), None);
    assert_eq!(runs.load(Ordering::SeqCst), 3);
}
