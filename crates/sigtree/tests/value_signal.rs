use serde_json::json;
use sigtree::{
    Id, NumberSignal, Signal, SignalCommand, SignalError, SignalTree, Transaction, UsageTracker,
    ValueSignal,
};
use std::sync::{Arc, Mutex};

fn rejected_with(outcome: Option<Result<(), SignalError>>, reason: &str) -> bool {
    matches!(outcome, Some(Err(SignalError::Rejected(actual))) if actual == reason)
}

#[test]
fn new_signal_reads_back_its_initial_value() {
    let signal = ValueSignal::new(&"hello".to_string()).expect("create signal");
    let mut tx = Transaction::root();
    assert_eq!(signal.peek(&mut tx).expect("peek"), "hello");
    assert_eq!(signal.peek_confirmed().expect("peek confirmed"), "hello");
}

#[test]
fn set_commits_immediately_outside_a_staged_transaction() {
    let signal = ValueSignal::new(&1).expect("create signal");
    let mut tx = Transaction::root();

    let operation = signal.set(&mut tx, &2).expect("set");
    assert!(matches!(operation.outcome(), Some(Ok(()))));
    assert_eq!(signal.peek(&mut tx).expect("peek"), 2);
}

#[test]
fn replace_only_succeeds_against_the_expected_value() {
    let signal = ValueSignal::new(&"a".to_string()).expect("create signal");
    let mut tx = Transaction::root();

    let miss = signal
        .replace(&mut tx, &"other".to_string(), &"b".to_string())
        .expect("replace");
    assert!(rejected_with(miss.outcome(), "Unexpected value"));
    assert_eq!(signal.peek(&mut tx).expect("peek"), "a");

    let hit = signal
        .replace(&mut tx, &"a".to_string(), &"b".to_string())
        .expect("replace");
    assert!(matches!(hit.outcome(), Some(Ok(()))));
    assert_eq!(signal.peek(&mut tx).expect("peek"), "b");
}

#[test]
fn update_applies_a_function_to_the_current_value() {
    let signal = ValueSignal::new(&10).expect("create signal");
    let mut tx = Transaction::root();

    let operation = signal.update(&mut tx, |n| n + 5).expect("update");
    assert!(matches!(operation.outcome(), Some(Ok(()))));
    assert_eq!(signal.peek(&mut tx).expect("peek"), 15);
}

#[test]
fn staged_update_fails_when_the_value_changes_before_commit() {
    let signal = ValueSignal::new(&1).expect("create signal");

    let (operation, result) = Transaction::run(|tx| {
        let operation = signal.update(tx, |n| n + 1).expect("update");
        // A write that lands between the staged read and the commit
        // invalidates the update stamp the read captured.
        signal.set(&mut Transaction::root(), &100).expect("set");
        operation
    });

    assert!(matches!(result.outcome(), Some(Err(_))));
    assert!(rejected_with(operation.outcome(), "Unexpected last update"));
    assert_eq!(signal.peek(&mut Transaction::root()).expect("peek"), 100);
}

#[test]
fn tracked_staged_read_becomes_a_commit_precondition() {
    let signal = ValueSignal::new(&1).expect("create signal");

    let ((), result) = Transaction::run(|tx| {
        let read = UsageTracker::untracked(tx, |scope| signal.value(scope));
        assert_eq!(read.expect("value"), 1);
        signal.set(&mut Transaction::root(), &2).expect("set");
    });

    assert!(matches!(result.outcome(), Some(Err(_))));
}

#[test]
fn concurrent_increments_both_take_effect() {
    let counter = NumberSignal::new(0.0).expect("create signal");

    let first = counter.increment(&mut Transaction::root(), 1.0);
    let second = counter.increment(&mut Transaction::root(), 2.0);

    assert!(matches!(first.outcome(), Some(Ok(()))));
    assert!(matches!(second.outcome(), Some(Ok(()))));
    assert_eq!(counter.peek(&mut Transaction::root()).expect("peek"), 3.0);
}

#[test]
fn increment_rejects_non_numeric_values() {
    let text = ValueSignal::new(&"text".to_string()).expect("create signal");
    let counter = NumberSignal::over(text.tree().clone(), text.node());

    let operation = counter.increment(&mut Transaction::root(), 1.0);
    assert!(rejected_with(operation.outcome(), "Value is not numeric"));
}

#[test]
fn map_derives_a_computed_signal_that_follows_the_source() {
    let signal = ValueSignal::new(&3).expect("create signal");
    let doubled = signal.map(|value: Result<i32, _>| value.unwrap_or(0) * 2);

    assert_eq!(doubled.peek(), 6);

    signal.set(&mut Transaction::root(), &7).expect("set");
    assert_eq!(doubled.peek(), 14);
}

#[test]
fn signal_over_an_asynchronous_tree_settles_at_confirmation() {
    let submitted: Arc<Mutex<Vec<Vec<SignalCommand>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = submitted.clone();
    let tree = SignalTree::asynchronous(move |commands| {
        sink.lock().expect("submitted lock").push(commands);
    });
    let signal: ValueSignal<Option<i32>> = ValueSignal::over(tree.clone(), Id::ZERO);

    let operation = signal
        .set(&mut Transaction::root(), &Some(5))
        .expect("set");
    assert!(!operation.is_settled());
    assert_eq!(signal.peek(&mut Transaction::root()).expect("peek"), Some(5));
    assert_eq!(signal.peek_confirmed().expect("peek confirmed"), None);

    let batch = submitted.lock().expect("submitted lock")[0].clone();
    tree.confirm(&batch);
    assert!(matches!(operation.outcome(), Some(Ok(()))));
    assert_eq!(signal.peek_confirmed().expect("peek confirmed"), Some(5));
}

#[test]
fn absent_value_reads_as_json_null() {
    let tree = SignalTree::synchronous();
    let signal: ValueSignal<serde_json::Value> = ValueSignal::over(tree, Id::ZERO);
    assert_eq!(
        signal.peek(&mut Transaction::root()).expect("peek"),
        json!(null)
    );
}
