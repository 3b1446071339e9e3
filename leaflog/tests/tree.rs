//! Scenario 4 (move rejects cycles) and scenario 6 (query kept-segment
//! collision) from the end-to-end scenario list.

use leaflog::{DefaultSchema, Document, SetValue, TreeError};
use serde_json::json;
use std::rc::Rc;

fn open() -> Document {
    Document::open_in_memory(Rc::new(DefaultSchema), false).unwrap()
}

// Scenario 4: given root.a.b.c as a subtree, root.a.b = Move(root.a)
// raises (move into own descendant); the tree is left unchanged.
#[test]
fn move_into_own_descendant_is_rejected() {
    let doc = open();
    let a = doc.ensure("a").unwrap();
    let b = a.ensure("b").unwrap();
    b.ensure("c").unwrap();

    let err = a.set("b", SetValue::Move(a.clone())).unwrap_err();
    assert!(matches!(err, TreeError::Invalid(_)));

    // structure is unchanged: a.b.c still resolves, a.b didn't get
    // reparented onto itself
    assert!(a.ensure("b").unwrap().has("c").unwrap());
}

#[test]
fn move_a_node_into_itself_is_rejected() {
    let doc = open();
    let a = doc.ensure("a").unwrap();
    let err = a.set("loop", SetValue::Move(a.clone())).unwrap_err();
    assert!(matches!(err, TreeError::Invalid(_)));
}

// Scenario 6: tree {a: {b: 1, c: 2}, d: {b: 3}}. Query "*.(b)" yields
// a name collision on the kept path ("b",); "(*).(b)" disambiguates by
// keeping the first segment too.
#[test]
fn query_kept_segment_collision_and_disambiguation() {
    let doc = open();
    let a = doc.ensure("a").unwrap();
    a.set("b", SetValue::Value(json!(1))).unwrap();
    a.set("c", SetValue::Value(json!(2))).unwrap();
    let d = doc.ensure("d").unwrap();
    d.set("b", SetValue::Value(json!(3))).unwrap();

    let collision = doc.query("*.(b)", None, None).unwrap_err();
    assert!(matches!(collision, TreeError::Query(_)));

    let disambiguated = doc.query("(*).(b)", None, None).unwrap();
    assert_eq!(disambiguated.len(), 2);
    assert_eq!(
        disambiguated[&vec!["a".to_owned(), "b".to_owned()]],
        json!(1)
    );
    assert_eq!(
        disambiguated[&vec!["d".to_owned(), "b".to_owned()]],
        json!(3)
    );
}
