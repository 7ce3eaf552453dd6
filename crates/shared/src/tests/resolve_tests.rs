use serde_json::json;

use super::*;
use crate::node::{Component, EventNode};
use crate::domain::HandlerId;

fn values(entries: impl IntoIterator<Item = (&'static str, Node)>) -> Values {
    entries
        .into_iter()
        .map(|(key, node)| (key.to_string(), node))
        .collect()
}

fn keys(items: &[&str]) -> BTreeSet<Key> {
    items.iter().map(|key| key.to_string()).collect()
}

fn sample_tree() -> Node {
    Component::new("Stack")
        .prop("gap", 4)
        .prop("style", Node::try_from(json!({ "color": "red", "sizes": [1, 2] })).expect("map"))
        .child(Component::new("Text").child("hello"))
        .child(Node::from(EventNode::new(HandlerId::random())))
        .into()
}

#[test]
fn trees_without_references_are_left_untouched() {
    let tree = sample_tree();
    let loaded = values([("unrelated", Node::from(1))]);

    assert!(find_references(&tree, &loaded).is_empty());
    assert_eq!(resolve(&tree, &loaded), tree);
}

#[test]
fn finds_references_transitively_through_loaded_values() {
    let root: Node = Component::new("Stack")
        .child(Node::reference("header"))
        .child(Node::List(vec![Node::reference("footer")]))
        .into();
    let loaded = values([
        ("header", Component::new("Text").child(Node::reference("title")).into()),
        ("title", Node::from("Welcome")),
    ]);

    assert_eq!(
        find_references(&root, &loaded),
        keys(&["footer", "header", "title"])
    );
}

#[test]
fn reference_cycle_produces_finite_closure() {
    let loaded = values([("a", Node::reference("b")), ("b", Node::reference("a"))]);

    assert_eq!(find_references(&loaded["a"], &loaded), keys(&["a", "b"]));
    assert!(resolve_key("a", &loaded).is_null());
}

#[test]
fn resolve_substitutes_nested_references() {
    let root: Node = Component::new("Stack")
        .prop("title", Node::reference("title"))
        .child(Node::reference("header"))
        .into();
    let loaded = values([
        ("title", Node::from("Dashboard")),
        ("header", Component::new("Text").child(Node::reference("title")).into()),
    ]);

    let resolved = resolve(&root, &loaded);
    let stack = resolved.as_component().expect("component");
    assert_eq!(stack.props["title"], Node::from("Dashboard"));

    let header = stack.children[0].as_component().expect("header");
    assert_eq!(header.children, vec![Node::from("Dashboard")]);
    assert_eq!(header.path, Some(vec![PathSegment::from("header")]));
}

#[test]
fn unknown_keys_resolve_to_null() {
    let root = Node::List(vec![Node::reference("missing"), Node::from(1)]);
    let resolved = resolve(&root, &Values::new());
    assert_eq!(resolved, Node::List(vec![Node::null(), Node::from(1)]));
}

#[test]
fn sub_path_references_pick_nested_values() {
    let loaded = values([(
        "menu",
        Node::try_from(json!({ "items": ["home", "settings"] })).expect("map"),
    )]);
    let reference = Node::reference_at("menu", [PathSegment::from("items"), PathSegment::from(1)]);

    assert_eq!(resolve(&reference, &loaded), Node::from("settings"));
}

#[test]
fn lookup_walks_component_props_and_children() {
    let tree = sample_tree();
    let path = vec![
        PathSegment::from("children"),
        PathSegment::from(0),
        PathSegment::from("children"),
        PathSegment::from(0),
    ];
    assert_eq!(lookup(&tree, &path), Some(&Node::from("hello")));

    let path = vec![PathSegment::from("props"), PathSegment::from("style"), PathSegment::from("color")];
    assert_eq!(lookup(&tree, &path), Some(&Node::from("red")));

    let path = vec![PathSegment::from("props"), PathSegment::from("nope")];
    assert_eq!(lookup(&tree, &path), None);
}

#[test]
fn lookup_through_reports_references_mid_path() {
    let tree: Node = Component::new("Stack")
        .child(Node::reference("button"))
        .into();
    let path = vec![
        PathSegment::from("children"),
        PathSegment::from(0),
        PathSegment::from("props"),
        PathSegment::from("onPress"),
    ];

    match lookup_through(&tree, &path) {
        Lookup::Redirect { reference, rest } => {
            assert_eq!(reference.key, "button");
            assert_eq!(rest, &path[2..]);
        }
        other => panic!("expected redirect, got {other:?}"),
    }
}

#[test]
fn lookup_in_follows_references_across_entries() {
    let loaded = values([
        ("", Component::new("Stack").child(Node::reference("button")).into()),
        ("button", Component::new("Button").prop("label", "Go").into()),
    ]);
    let path = vec![
        PathSegment::from("children"),
        PathSegment::from(0),
        PathSegment::from("props"),
        PathSegment::from("label"),
    ];
    assert_eq!(lookup_in(&loaded, "", &path), Some(&Node::from("Go")));
}
