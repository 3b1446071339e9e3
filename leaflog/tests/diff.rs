//! Scenario 5: committing `{x: 1}` then changing it to `{x: {y: 2}}`
//! yields a `changed` diff event at path `x` carrying the old leaf and
//! the new node — a shape mismatch still counts as `changed`.

use leaflog::{DefaultSchema, DiffEvent, Document, SetValue};
use serde_json::json;
use std::rc::Rc;
use tempfile::NamedTempFile;

#[test]
fn diff_shape_mismatch_is_changed() {
    let file = NamedTempFile::new().unwrap();
    let p = file.path().to_str().unwrap().to_owned();

    let doc = Document::open(&p, Rc::new(DefaultSchema), true, false).unwrap();
    doc.set("x", SetValue::Value(json!(1))).unwrap();
    doc.commit().unwrap();
    drop(doc);

    let doc = Document::open(&p, Rc::new(DefaultSchema), false, false).unwrap();
    doc.del("x").unwrap();
    let x = doc.ensure("x").unwrap();
    x.set("y", SetValue::Value(json!(2))).unwrap();

    let events = doc.diff().unwrap();
    let changed = events.iter().find(|e| matches!(e, DiffEvent::Changed(path, _, _) if path == &vec!["x".to_owned()]));
    match changed {
        Some(DiffEvent::Changed(_, old, new)) => {
            assert_eq!(*old, json!(1));
            assert_eq!(*new, json!({"y": 2}));
        }
        _ => panic!("expected a Changed event at path x, got {events:?}"),
    }
}

#[test]
fn diff_added_and_removed_leaves() {
    let doc = Document::open_in_memory(Rc::new(DefaultSchema), false).unwrap();
    doc.set("keep", SetValue::Value(json!("k"))).unwrap();
    doc.set("gone", SetValue::Value(json!("g"))).unwrap();
    doc.commit().unwrap();

    doc.del("gone").unwrap();
    doc.set("new", SetValue::Value(json!("n"))).unwrap();

    let events = doc.diff().unwrap();
    assert!(events.contains(&DiffEvent::Removed(vec!["gone".to_owned()], json!("g"))));
    assert!(events.contains(&DiffEvent::Added(vec!["new".to_owned()], json!("n"))));
    assert!(!events.iter().any(|e| matches!(e, DiffEvent::Changed(path, _, _) if path == &vec!["keep".to_owned()])));
}
