//! End-to-end commit/reopen scenarios (spec scenarios 1–2) plus the
//! structural round-trip and CAS properties (P3–P5, P7).

use leaflog::{DefaultSchema, Document, SetValue, TreeError, Value};
use serde_json::json;
use std::rc::Rc;
use tempfile::NamedTempFile;

fn path(file: &NamedTempFile) -> String {
    file.path().to_str().unwrap().to_owned()
}

fn leaf(doc_value: &Value) -> serde_json::Value {
    match doc_value {
        Value::Leaf(v) => v.clone(),
        Value::Tree(_) => panic!("expected a leaf"),
    }
}

// Scenario 1: create, commit, reopen, read back.
#[test]
fn create_commit_reopen() {
    let file = NamedTempFile::new().unwrap();
    let p = path(&file);

    let doc = Document::open(&p, Rc::new(DefaultSchema), true, false).unwrap();
    let a = doc.ensure("a").unwrap();
    a.set("b", SetValue::Value(json!(1))).unwrap();
    a.set("c", SetValue::Value(json!("x"))).unwrap();
    doc.commit().unwrap();
    drop(doc);

    let reopened = Document::open(&p, Rc::new(DefaultSchema), false, false).unwrap();
    let a2 = reopened.get("a").unwrap().unwrap();
    let a2 = match a2 {
        Value::Tree(t) => t,
        Value::Leaf(_) => panic!("expected a tree"),
    };
    assert_eq!(leaf(&a2.get("b").unwrap().unwrap()), json!(1));
    assert_eq!(leaf(&a2.get("c").unwrap().unwrap()), json!("x"));
}

// Scenario 2: CAS conflict between two handles open on the same file,
// then a successful retry after reloading.
#[test]
fn cas_conflict_then_retry() {
    let file = NamedTempFile::new().unwrap();
    let p = path(&file);
    Document::open(&p, Rc::new(DefaultSchema), true, false)
        .unwrap()
        .commit()
        .unwrap();

    let h1 = Document::open(&p, Rc::new(DefaultSchema), false, false).unwrap();
    let h2 = Document::open(&p, Rc::new(DefaultSchema), false, false).unwrap();

    h1.set("x", SetValue::Value(json!(1))).unwrap();
    h1.commit().unwrap();

    h2.set("y", SetValue::Value(json!(2))).unwrap();
    let err = h2.commit().unwrap_err();
    assert!(matches!(err, TreeError::Store(leaflog::StoreError::Log(leaflog::LogError::Concurrency { .. }))));

    // reload and reapply
    let h2b = Document::open(&p, Rc::new(DefaultSchema), false, false).unwrap();
    h2b.set("y", SetValue::Value(json!(2))).unwrap();
    h2b.commit().unwrap();

    let check = Document::open(&p, Rc::new(DefaultSchema), false, false).unwrap();
    assert_eq!(leaf(&check.get("x").unwrap().unwrap()), json!(1));
    assert_eq!(leaf(&check.get("y").unwrap().unwrap()), json!(2));
}

// P3/P4: commit, reopen, structural equality with the pre-commit tree.
#[test]
fn reopened_tree_matches_precommit_structure() {
    let file = NamedTempFile::new().unwrap();
    let p = path(&file);
    let doc = Document::open(&p, Rc::new(DefaultSchema), true, false).unwrap();

    let a = doc.ensure("a").unwrap();
    a.set("n", SetValue::Value(json!(42))).unwrap();
    let b = doc.ensure("b").unwrap();
    b.set("copy_of_a", SetValue::Copy(a.clone())).unwrap();
    doc.set("scratch", SetValue::Value(json!("gone"))).unwrap();
    doc.del("scratch").unwrap();

    let before = doc.to_json_value().unwrap();
    doc.commit().unwrap();
    drop(doc);

    let reopened = Document::open(&p, Rc::new(DefaultSchema), false, false).unwrap();
    let after = reopened.to_json_value().unwrap();
    assert_eq!(before, after);
    assert_eq!(after["a"]["n"], json!(42));
    assert_eq!(after["b"]["copy_of_a"]["n"], json!(42));
    assert!(after.get("scratch").is_none());
}

// P7: a move never creates a record of its own; it only re-persists the
// altered parents on the next commit. A copy, before commit, produces
// clones that carry no offset.
#[test]
fn move_reparents_without_extra_records_copy_starts_detached() {
    let file = NamedTempFile::new().unwrap();
    let p = path(&file);
    let doc = Document::open(&p, Rc::new(DefaultSchema), true, false).unwrap();

    let src = doc.ensure("src").unwrap();
    src.set("leaf", SetValue::Value(json!("hi"))).unwrap();
    doc.commit().unwrap();

    let dst = doc.ensure("dst").unwrap();
    let moved_source = doc.get("src").unwrap();
    let moved_source = match moved_source {
        Some(Value::Tree(t)) => t,
        _ => panic!("expected a tree"),
    };
    dst.set("moved", SetValue::Move(moved_source)).unwrap();
    assert!(!doc.has("src").unwrap());

    let new_root = doc.commit().unwrap();
    assert_ne!(new_root, 0);

    let reopened = Document::open(&p, Rc::new(DefaultSchema), false, false).unwrap();
    assert!(!reopened.has("src").unwrap());
    let dst2 = reopened.get("dst").unwrap();
    let dst2 = match dst2 {
        Some(Value::Tree(t)) => t,
        _ => panic!("expected a tree"),
    };
    let moved = dst2.get("moved").unwrap();
    let moved = match moved {
        Some(Value::Tree(t)) => t,
        _ => panic!("expected a tree"),
    };
    assert_eq!(leaf(&moved.get("leaf").unwrap().unwrap()), json!("hi"));
}
