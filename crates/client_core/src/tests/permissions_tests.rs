use super::*;

fn request(id: &str, session_id: &str) -> PermissionRequest {
    PermissionRequest {
        request_id: id.into(),
        session_id: session_id.into(),
        permission: "bash".into(),
        patterns: vec!["cargo test".into()],
        always: Vec::new(),
        tool_message_id: None,
        tool_call_id: None,
    }
}

fn ids(queue: &PermissionQueue) -> Vec<&str> {
    queue
        .entries()
        .iter()
        .map(|entry| entry.request.request_id.as_str())
        .collect()
}

#[test]
fn push_during_in_flight_poll_is_not_pruned() {
    let mut queue = PermissionQueue::default();
    let t0 = 1_000;
    let t1 = 1_500;

    // Poll starts at T0; a push delivers reqB at T1 before the poll resolves.
    queue.upsert(request("reqB", "ses_1"), t1);
    queue.reconcile_poll(vec![request("reqA", "ses_1")], t0, 2_000);

    let mut present = ids(&queue);
    present.sort();
    assert_eq!(present, vec!["reqA", "reqB"]);
}

#[test]
fn stale_entries_absent_from_poll_are_pruned() {
    let mut queue = PermissionQueue::default();
    queue.upsert(request("old", "ses_1"), 100);
    queue.upsert(request("kept", "ses_1"), 200);

    queue.reconcile_poll(vec![request("kept", "ses_1")], 500, 600);

    assert_eq!(ids(&queue), vec!["kept"]);
    assert_eq!(queue.entries()[0].added_at_ms, 200);
}

#[test]
fn upsert_preserves_first_seen_time_and_position() {
    let mut queue = PermissionQueue::default();
    queue.upsert(request("a", "ses_1"), 10);
    queue.upsert(request("b", "ses_1"), 20);
    let mut updated = request("a", "ses_1");
    updated.permission = "edit".into();
    queue.upsert(updated, 30);

    assert_eq!(ids(&queue), vec!["a", "b"]);
    assert_eq!(queue.entries()[0].added_at_ms, 10);
    assert_eq!(queue.entries()[0].request.permission, "edit");
}

#[test]
fn failed_reply_restores_original_position() {
    let mut queue = PermissionQueue::default();
    for (i, id) in ["a", "b", "c"].into_iter().enumerate() {
        queue.upsert(request(id, "ses_1"), i as i64);
    }

    let snapshot = queue.take_for_reply("b").expect("present");
    assert_eq!(ids(&queue), vec!["a", "c"]);
    queue.upsert(request("d", "ses_1"), 10);

    queue.restore(snapshot);
    assert_eq!(ids(&queue), vec!["a", "b", "c", "d"]);
    assert_eq!(queue.entries()[1].added_at_ms, 1);
}

#[test]
fn restore_is_skipped_when_entry_was_re_added() {
    let mut queue = PermissionQueue::default();
    queue.upsert(request("a", "ses_1"), 1);
    queue.upsert(request("b", "ses_1"), 2);

    let snapshot = queue.take_for_reply("a").expect("present");
    queue.upsert(request("a", "ses_1"), 50);
    queue.restore(snapshot);

    assert_eq!(ids(&queue), vec!["b", "a"]);
    assert_eq!(queue.entries()[1].added_at_ms, 50);
}

#[test]
fn current_request_is_first_for_active_session() {
    let mut queue = PermissionQueue::default();
    queue.upsert(request("x", "ses_other"), 1);
    queue.upsert(request("y", "ses_1"), 2);
    queue.upsert(request("z", "ses_1"), 3);

    assert_eq!(
        queue
            .current_for_session("ses_1")
            .map(|r| r.request_id.as_str()),
        Some("y")
    );
    assert!(queue.current_for_session("ses_none").is_none());
}
