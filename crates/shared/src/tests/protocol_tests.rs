use super::*;
use serde_json::json;

fn frame(kind: &str, properties: Value) -> String {
    json!({
        "directory": "/work/repo",
        "payload": { "type": kind, "properties": properties }
    })
    .to_string()
}

#[test]
fn decodes_part_update_with_delta() {
    let data = frame(
        "message.part.updated",
        json!({
            "part": {
                "id": "prt_1",
                "sessionID": "ses_1",
                "messageID": "msg_1",
                "type": "text",
                "text": "Hel"
            },
            "delta": "Hel"
        }),
    );

    let event = decode_event(None, &data);
    match event {
        Event::MessagePartUpdated {
            directory,
            session_id,
            message_id,
            part,
            delta,
        } => {
            assert_eq!(directory, "/work/repo");
            assert_eq!(session_id, "ses_1");
            assert_eq!(message_id, "msg_1");
            assert_eq!(delta.as_deref(), Some("Hel"));
            assert_eq!(
                part,
                Part::Text {
                    id: Some("prt_1".into()),
                    text: "Hel".into(),
                    synthetic: false
                }
            );
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[test]
fn event_name_takes_precedence_over_payload_type() {
    let data = frame("something.else", json!({ "sessionID": "ses_1" }));
    let event = decode_event(Some("session.idle"), &data);
    assert_eq!(
        event,
        Event::SessionStatus {
            directory: "/work/repo".into(),
            session_id: "ses_1".into(),
            status: SessionStatus::Idle,
        }
    );
}

#[test]
fn maps_session_status_wire_values() {
    for (wire, expected) in [
        ("busy", SessionStatus::Running),
        ("retry", SessionStatus::Running),
        ("idle", SessionStatus::Idle),
        ("error", SessionStatus::Error),
        ("mystery", SessionStatus::Idle),
    ] {
        let data = frame(
            "session.status",
            json!({ "sessionID": "ses_1", "status": { "type": wire } }),
        );
        match decode_event(None, &data) {
            Event::SessionStatus { status, .. } => assert_eq!(status, expected, "wire={wire}"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

#[test]
fn malformed_frames_become_unknown_events() {
    let event = decode_event(Some("message.updated"), "{not json");
    assert!(matches!(event, Event::Unknown { ref event_type, .. } if event_type == "message.updated"));

    let data = frame("message.removed", json!({ "sessionID": "ses_1" }));
    assert!(matches!(decode_event(None, &data), Event::Unknown { .. }));
}

#[test]
fn decodes_permission_asked_and_updated_alias() {
    let properties = json!({
        "id": "per_1",
        "sessionID": "ses_1",
        "permission": "bash",
        "patterns": ["rm -rf *"],
        "tool": { "messageID": "msg_9", "callID": "call_3" }
    });
    for kind in ["permission.asked", "permission.updated"] {
        match decode_event(None, &frame(kind, properties.clone())) {
            Event::PermissionAsked { request, .. } => {
                assert_eq!(request.request_id, "per_1");
                assert_eq!(request.patterns, vec!["rm -rf *".to_string()]);
                assert!(request.always.is_empty());
                assert_eq!(request.tool_call_id.as_deref(), Some("call_3"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

#[test]
fn decodes_session_update_with_revert_pointer() {
    let data = frame(
        "session.updated",
        json!({
            "info": {
                "id": "ses_1",
                "directory": "/work/repo",
                "time": { "created": 1_700_000_000_000i64, "updated": 1_700_000_500_000i64 },
                "revert": { "messageID": "msg_50" }
            }
        }),
    );
    match decode_event(None, &data) {
        Event::SessionUpdated { session, .. } => {
            assert_eq!(session.revert_message_id(), Some("msg_50"));
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[test]
fn tool_part_maps_state_and_stringifies_input() {
    let dto: PartDto = serde_json::from_value(json!({
        "id": "prt_2",
        "type": "tool",
        "callID": "call_1",
        "tool": "bash",
        "state": {
            "status": "completed",
            "input": { "command": "ls" },
            "output": "Cargo.toml",
            "time": { "start": 1, "end": 2 }
        }
    }))
    .expect("part dto");

    match dto.into_domain() {
        Part::Tool {
            state,
            input,
            output,
            time,
            ..
        } => {
            assert_eq!(state, ToolStatus::Completed);
            assert_eq!(input.as_deref(), Some(r#"{"command":"ls"}"#));
            assert_eq!(output.as_deref(), Some("Cargo.toml"));
            assert_eq!(time.and_then(|t| t.end), Some(2));
        }
        other => panic!("unexpected part: {other:?}"),
    }
}

#[test]
fn unrecognised_part_type_is_kept_as_unknown() {
    let dto: PartDto =
        serde_json::from_value(json!({ "id": "prt_3", "type": "subtask" })).expect("part dto");
    match dto.into_domain() {
        Part::Unknown { kind, raw_data, .. } => {
            assert_eq!(kind, "subtask");
            assert!(raw_data.contains("subtask"));
        }
        other => panic!("unexpected part: {other:?}"),
    }
}

#[test]
fn error_message_prefers_nested_data() {
    let nested = ErrorDto {
        name: "MessageAbortedError".into(),
        data: Some(json!({ "message": "aborted by user" })),
        message: Some("legacy".into()),
    };
    assert_eq!(
        nested.into_domain(),
        ApiError::MessageAborted {
            message: "aborted by user".into()
        }
    );

    let legacy = ErrorDto {
        name: "SomethingOdd".into(),
        data: None,
        message: Some("legacy".into()),
    };
    assert_eq!(
        legacy.into_domain(),
        ApiError::Api {
            name: "SomethingOdd".into(),
            message: "legacy".into(),
            status: None
        }
    );
}

#[test]
fn abort_response_accepts_loose_success_shapes() {
    assert!(parse_abort_response(""));
    assert!(parse_abort_response("true"));
    assert!(parse_abort_response(r#"{"aborted": true}"#));
    assert!(parse_abort_response(r#"{"ok": true}"#));
    assert!(!parse_abort_response("false"));
    assert!(!parse_abort_response(r#"{"success": false}"#));
}

#[test]
fn message_with_parts_rejects_unknown_role() {
    let dto: MessageWithPartsDto = serde_json::from_value(json!({
        "info": { "id": "msg_1", "sessionID": "ses_1", "role": "system", "time": { "created": 0 } },
        "parts": []
    }))
    .expect("message dto");
    assert!(matches!(dto.into_domain(), Err(ApiError::Parse { .. })));
}
