use serde_json::json;
use serde_json::Value;
use sigtree_core::{
    Canceler, Id, ListPosition, NodeUsage, SignalCommand, SignalTree, Transaction, Usage,
    UsageTracker,
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

fn capture_root(tree: &SignalTree) -> NodeUsage {
    let mut tx = Transaction::root();
    NodeUsage::capture_content(tree, Id::ZERO, &mut tx).expect("root exists")
}

#[test]
fn content_capture_detects_value_and_child_changes() {
    let tree = SignalTree::synchronous();
    tree.commit_single_command(set(Id::ZERO, json!("v")), None);

    let usage = capture_root(&tree);
    assert!(!usage.has_changes(&mut Transaction::root()));

    tree.commit_single_command(set(Id::ZERO, json!("w")), None);
    assert!(usage.has_changes(&mut Transaction::root()));

    let usage = capture_root(&tree);
    tree.commit_single_command(
        SignalCommand::Insert {
            command_id: Id::random(),
            target: Id::ZERO,
            value: None,
            position: ListPosition::last(),
            scope_owner: None,
        },
        None,
    );
    assert!(usage.has_changes(&mut Transaction::root()));
}

#[test]
fn re_setting_equal_content_is_not_a_change() {
    let tree = SignalTree::synchronous();
    tree.commit_single_command(set(Id::ZERO, json!("v")), None);

    let usage = capture_root(&tree);
    // The update stamp advances but the observable content does not.
    tree.commit_single_command(set(Id::ZERO, json!("v")), None);
    assert!(!usage.has_changes(&mut Transaction::root()));
}

#[test]
fn removed_node_is_not_a_change() {
    let tree = SignalTree::synchronous();
    let insert = SignalCommand::Insert {
        command_id: Id::random(),
        target: Id::ZERO,
        value: Some(json!("child")),
        position: ListPosition::last(),
        scope_owner: None,
    };
    let child = insert.command_id();
    tree.commit_single_command(insert, None);

    let mut tx = Transaction::root();
    let usage = NodeUsage::capture_content(&tree, child, &mut tx).expect("child exists");

    tree.commit_single_command(
        SignalCommand::Remove {
            command_id: Id::random(),
            target: child,
            expected_parent: None,
        },
        None,
    );
    assert!(!usage.has_changes(&mut Transaction::root()));
}

#[test]
fn listener_fires_on_the_next_relevant_change() {
    let tree = SignalTree::synchronous();
    let usage = capture_root(&tree);

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let _cancel = usage.on_next_change(Box::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        false
    }));

    tree.commit_single_command(set(Id::ZERO, json!(1)), None);
    tree.commit_single_command(set(Id::ZERO, json!(2)), None);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn listener_fires_immediately_when_the_change_already_happened() {
    let tree = SignalTree::synchronous();
    let usage = capture_root(&tree);
    tree.commit_single_command(set(Id::ZERO, json!("early")), None);

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let _cancel = usage.on_next_change(Box::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        false
    }));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn content_equal_update_keeps_the_listener_armed() {
    let tree = SignalTree::synchronous();
    tree.commit_single_command(set(Id::ZERO, json!("v")), None);
    let usage = capture_root(&tree);

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let _cancel = usage.on_next_change(Box::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        false
    }));

    // Stamp-only change; the listener must survive it and still catch the
    // real change afterwards.
    tree.commit_single_command(set(Id::ZERO, json!("v")), None);
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    tree.commit_single_command(set(Id::ZERO, json!("w")), None);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn cancelled_listener_is_never_invoked() {
    let tree = SignalTree::synchronous();
    let usage = capture_root(&tree);

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let cancel = usage.on_next_change(Box::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        false
    }));
    cancel();

    tree.commit_single_command(set(Id::ZERO, json!(1)), None);
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn tracker_combines_usages_from_several_trees() {
    let first = SignalTree::synchronous();
    let second = SignalTree::synchronous();

    let mut tx = Transaction::root();
    let ((), usage) = UsageTracker::track(&mut tx, |scope| {
        let first_usage =
            NodeUsage::capture_content(&first, Id::ZERO, scope.transaction()).expect("root");
        scope.register_usage(Arc::new(first_usage));
        let second_usage =
            NodeUsage::capture_content(&second, Id::ZERO, scope.transaction()).expect("root");
        scope.register_usage(Arc::new(second_usage));
    });

    assert!(!usage.has_changes(&mut Transaction::root()));
    second.commit_single_command(set(Id::ZERO, json!("x")), None);
    assert!(usage.has_changes(&mut Transaction::root()));
}

#[test]
fn combined_listener_fires_once_and_deactivates() {
    let first = SignalTree::synchronous();
    let second = SignalTree::synchronous();

    let mut tx = Transaction::root();
    let ((), usage) = UsageTracker::track(&mut tx, |scope| {
        for tree in [&first, &second] {
            let node_usage =
                NodeUsage::capture_content(tree, Id::ZERO, scope.transaction()).expect("root");
            scope.register_usage(Arc::new(node_usage));
        }
    });

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let _cancel = usage.on_next_change(Box::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        false
    }));

    first.commit_single_command(set(Id::ZERO, json!(1)), None);
    second.commit_single_command(set(Id::ZERO, json!(2)), None);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn listener_may_cancel_its_registration_while_firing() {
    let first = SignalTree::synchronous();
    let second = SignalTree::synchronous();

    let mut tx = Transaction::root();
    let ((), usage) = UsageTracker::track(&mut tx, |scope| {
        for tree in [&first, &second] {
            let node_usage =
                NodeUsage::capture_content(tree, Id::ZERO, scope.transaction()).expect("root");
            scope.register_usage(Arc::new(node_usage));
        }
    });

    // An effect re-run cancels its previous registration from inside the
    // change notification; the cancel must not block on the registration
    // that is currently firing.
    let slot: Arc<Mutex<Option<Canceler>>> = Arc::new(Mutex::new(None));
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let own_registration = slot.clone();
    let cancel = usage.on_next_change(Box::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        if let Some(cancel) = own_registration.lock().expect("slot lock").take() {
            cancel();
        }
        false
    }));
    *slot.lock().expect("slot lock") = Some(cancel);

    first.commit_single_command(set(Id::ZERO, json!(1)), None);
    second.commit_single_command(set(Id::ZERO, json!(2)), None);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn untracked_reads_register_no_dependencies() {
    let tree = SignalTree::synchronous();

    let mut tx = Transaction::root();
    let ((), usage) = UsageTracker::track(&mut tx, |scope| {
        scope.untracked(|inner| {
            assert!(!inner.is_tracking());
            let node_usage =
                NodeUsage::capture_content(&tree, Id::ZERO, inner.transaction()).expect("root");
            inner.register_usage(Arc::new(node_usage));
        });
    });

    tree.commit_single_command(set(Id::ZERO, json!("changed")), None);
    assert!(!usage.has_changes(&mut Transaction::root()));
}
