//! Reference tracking over model trees.
//!
//! [`find_references`] answers "which keys does this tree need" and
//! [`resolve`] produces the tree with every reference substituted. Both work
//! against a snapshot of already-loaded values, so callers decide when and how
//! values are fetched.

use std::collections::{BTreeSet, HashMap};

use crate::{
    domain::{Key, PathSegment},
    node::{Component, Node, Reference},
};

/// Loaded values by store key.
pub type Values = HashMap<Key, Node>;

/// Upper bound on reference hops followed by a single lookup.
pub const MAX_REFERENCE_HOPS: usize = 64;

/// Keys transitively referenced from `node`.
///
/// A referenced key is recorded once and its loaded value is searched once,
/// so reference cycles produce a finite set.
pub fn find_references(node: &Node, values: &Values) -> BTreeSet<Key> {
    let mut visited = BTreeSet::new();
    collect_references(node, values, &mut visited);
    visited
}

fn collect_references(node: &Node, values: &Values, visited: &mut BTreeSet<Key>) {
    match node {
        Node::Ref(reference) => {
            if visited.insert(reference.key.clone()) {
                if let Some(target) = values.get(&reference.key) {
                    collect_references(target, values, visited);
                }
            }
        }
        Node::List(items) => {
            for item in items {
                collect_references(item, values, visited);
            }
        }
        Node::Map(map) => {
            for item in map.values() {
                collect_references(item, values, visited);
            }
        }
        Node::Component(component) => {
            for prop in component.props.values() {
                collect_references(prop, values, visited);
            }
            for child in &component.children {
                collect_references(child, values, visited);
            }
        }
        Node::Leaf(_) | Node::Event(_) | Node::Handler(_) | Node::Action(_) | Node::Response(_) => {}
    }
}

/// Copy of `node` with every reference replaced by its resolved target.
///
/// Unknown keys and references back into a key that is already being
/// resolved on the current branch become `null`.
pub fn resolve(node: &Node, values: &Values) -> Node {
    let mut stack = Vec::new();
    resolve_node(node, values, &mut stack)
}

/// Resolves the entry stored under `key`, as a reference to it would.
pub fn resolve_key(key: &str, values: &Values) -> Node {
    let mut stack = Vec::new();
    resolve_reference(&Reference::new(key), values, &mut stack)
}

fn resolve_node(node: &Node, values: &Values, stack: &mut Vec<Key>) -> Node {
    match node {
        Node::Ref(reference) => resolve_reference(reference, values, stack),
        Node::List(items) => Node::List(
            items
                .iter()
                .map(|item| resolve_node(item, values, stack))
                .collect(),
        ),
        Node::Map(map) => Node::Map(
            map.iter()
                .map(|(name, item)| (name.clone(), resolve_node(item, values, stack)))
                .collect(),
        ),
        Node::Component(component) => Node::Component(Component {
            component: component.component.clone(),
            key: component.key.clone(),
            props: component
                .props
                .iter()
                .map(|(name, prop)| (name.clone(), resolve_node(prop, values, stack)))
                .collect(),
            children: component
                .children
                .iter()
                .map(|child| resolve_node(child, values, stack))
                .collect(),
            path: component.path.clone(),
        }),
        other => other.clone(),
    }
}

fn resolve_reference(reference: &Reference, values: &Values, stack: &mut Vec<Key>) -> Node {
    if stack.contains(&reference.key) {
        return Node::null();
    }
    let Some(target) = lookup_in(values, &reference.key, &reference.path) else {
        return Node::null();
    };

    stack.push(reference.key.clone());
    let mut resolved = resolve_node(target, values, stack);
    stack.pop();

    if let Node::Component(component) = &mut resolved {
        component.path = Some(reference.full_path());
    }
    resolved
}

/// Outcome of walking a path through one stored tree.
#[derive(Debug)]
pub enum Lookup<'a> {
    /// The node at the end of the path. It may itself be a reference.
    Found(&'a Node),
    /// A reference sits in the middle of the path; continue at its target
    /// with `rest` appended.
    Redirect {
        reference: &'a Reference,
        rest: &'a [PathSegment],
    },
    Missing,
}

/// Walks `path` through `node` without following references.
///
/// Maps are indexed by field name, lists by position, and components by
/// `props/<name>` or `children/<index>`.
pub fn lookup_through<'a>(node: &'a Node, path: &'a [PathSegment]) -> Lookup<'a> {
    let mut current = node;
    let mut position = 0;
    loop {
        let Some(segment) = path.get(position) else {
            return Lookup::Found(current);
        };
        if let Node::Ref(reference) = current {
            return Lookup::Redirect {
                reference,
                rest: &path[position..],
            };
        }
        position += 1;

        let next = match current {
            Node::Map(map) => map.get(segment.to_string().as_str()),
            Node::List(items) => segment.as_index().and_then(|index| items.get(index)),
            Node::Component(component) => {
                let Some(inner) = path.get(position) else {
                    return Lookup::Missing;
                };
                position += 1;
                if segment.is_key("props") {
                    component.props.get(inner.to_string().as_str())
                } else if segment.is_key("children") {
                    inner.as_index().and_then(|index| component.children.get(index))
                } else {
                    None
                }
            }
            _ => None,
        };
        match next {
            Some(node) => current = node,
            None => return Lookup::Missing,
        }
    }
}

/// Looks up `path` inside a single tree, without following references.
pub fn lookup<'a>(node: &'a Node, path: &'a [PathSegment]) -> Option<&'a Node> {
    match lookup_through(node, path) {
        Lookup::Found(found) => Some(found),
        Lookup::Redirect { .. } | Lookup::Missing => None,
    }
}

/// Looks up `path` under the loaded value of `key`, following references
/// crossed in the middle of the path. A path ending on a reference returns
/// the reference itself.
pub fn lookup_in<'a>(values: &'a Values, key: &str, path: &'a [PathSegment]) -> Option<&'a Node> {
    let mut node = values.get(key)?;
    let mut rest = path;
    for _ in 0..MAX_REFERENCE_HOPS {
        match lookup_through(node, rest) {
            Lookup::Found(found) => return Some(found),
            Lookup::Redirect {
                reference,
                rest: remaining,
            } => {
                node = values.get(&reference.key)?;
                if !reference.path.is_empty() {
                    node = lookup(node, &reference.path)?;
                }
                rest = remaining;
            }
            Lookup::Missing => return None,
        }
    }
    None
}

#[cfg(test)]
#[path = "tests/resolve_tests.rs"]
mod tests;
