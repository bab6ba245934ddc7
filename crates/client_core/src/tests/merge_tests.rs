use super::*;

#[test]
fn appends_delta_to_longer_base() {
    assert_eq!(merge_streaming_text("Hel", "Hel", Some("lo")), "Hello");
    assert_eq!(merge_streaming_text("Hel", "", Some("lo")), "Hello");
}

#[test]
fn duplicate_delta_is_not_appended_twice() {
    let first = merge_streaming_text("Hel", "", Some("lo"));
    let second = merge_streaming_text(&first, "", Some("lo"));
    assert_eq!(first, second);

    // Server already folded the delta into the full text.
    assert_eq!(merge_streaming_text("Hel", "Hello", Some("lo")), "Hello");
}

#[test]
fn snapshot_updates_keep_the_longer_prefix_extension() {
    assert_eq!(merge_streaming_text("Hello", "Hello world", None), "Hello world");
    assert_eq!(merge_streaming_text("Hello world", "Hello", None), "Hello world");
    assert_eq!(merge_streaming_text("Hello", "", None), "Hello");
}

#[test]
fn divergent_updates_fall_back_to_longer_text() {
    assert_eq!(merge_streaming_text("abc", "xyzw", None), "xyzw");
    assert_eq!(merge_streaming_text("abcdef", "xyz", None), "abcdef");
}

#[test]
fn merges_parts_by_id_and_appends_unknown_ids() {
    let mut parts = vec![Part::text("prt_1", "Hel")];

    merge_streaming_part(&mut parts, Part::text("prt_1", "Hel"), Some("lo"));
    merge_streaming_part(
        &mut parts,
        Part::Reasoning {
            id: Some("prt_2".into()),
            text: String::new(),
        },
        Some("thinking"),
    );

    assert_eq!(
        parts,
        vec![
            Part::text("prt_1", "Hello"),
            Part::Reasoning {
                id: Some("prt_2".into()),
                text: "thinking".into(),
            },
        ]
    );
}

#[test]
fn non_text_parts_are_replaced_wholesale() {
    let mut parts = vec![Part::Agent {
        id: Some("prt_1".into()),
        name: "build".into(),
    }];
    merge_streaming_part(
        &mut parts,
        Part::Agent {
            id: Some("prt_1".into()),
            name: "plan".into(),
        },
        None,
    );
    assert_eq!(
        parts,
        vec![Part::Agent {
            id: Some("prt_1".into()),
            name: "plan".into(),
        }]
    );
}

#[test]
fn parts_without_ids_are_always_appended() {
    let mut parts = Vec::new();
    let anonymous = Part::StepStart {
        id: None,
        snapshot: None,
    };
    merge_streaming_part(&mut parts, anonymous.clone(), None);
    merge_streaming_part(&mut parts, anonymous, None);
    assert_eq!(parts.len(), 2);
}
