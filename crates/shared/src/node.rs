//! Published model tree.
//!
//! A [`Node`] is either plain JSON data (leaves, lists, maps) or one of the
//! tagged shapes the render layer understands. Tagged shapes carry their
//! discriminant in the `"$"` field on the wire, e.g.
//! `{"$":"ref","ref":["counter"]}`. Decoding validates the shape once, so the
//! rest of the system can match on variants instead of probing JSON objects.

use std::{collections::BTreeMap, time::Duration};

use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::{
    domain::{HandlerId, Key, Path, PathSegment},
    error::NodeError,
};

/// Field holding the discriminant of tagged nodes.
pub const TAG: &str = "$";

pub const UPDATE_STATE_ACTION: &str = "update-state";
pub const NAVIGATE_ACTION: &str = "navigate";
pub const GO_BACK_ACTION: &str = "go-back";

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Leaf(Value),
    List(Vec<Node>),
    Map(BTreeMap<String, Node>),
    Component(Component),
    Ref(Reference),
    Event(EventNode),
    Handler(HandlerNode),
    Action(Action),
    Response(Response),
}

/// A typed UI element description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "$", rename = "component")]
pub struct Component {
    pub component: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub props: BTreeMap<String, Node>,
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "one_or_many"
    )]
    pub children: Vec<Node>,
    /// Set when the component was substituted for a reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Path>,
}

/// Pointer at another store entry, optionally into a sub-path of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RefRepr", into = "RefRepr")]
pub struct Reference {
    pub key: Key,
    pub path: Path,
}

/// Bound server-side action fired by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "$", rename = "event")]
pub struct EventNode {
    #[serde(rename = "key", default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<HandlerId>,
    /// Store keys whose resolved values are passed ahead of the payload.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Key>,
    /// Client-side actions applied when the event fires.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,
    #[serde(rename = "timeout", default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Handler bound to named state entries, invoked with their current values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "$", rename = "handler")]
pub struct HandlerNode {
    pub handler: HandlerId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub state: Vec<Key>,
}

/// Instruction interpreted by the client, never executed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "$", rename = "action")]
pub struct Action {
    pub name: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
}

/// Result envelope of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "$", rename = "response", rename_all = "camelCase")]
pub struct Response {
    pub ok: bool,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

impl Node {
    pub fn null() -> Self {
        Node::Leaf(Value::Null)
    }

    pub fn leaf(value: impl Into<Value>) -> Self {
        Node::Leaf(value.into())
    }

    pub fn reference(key: impl Into<Key>) -> Self {
        Node::Ref(Reference::new(key))
    }

    pub fn reference_at(key: impl Into<Key>, path: impl IntoIterator<Item = PathSegment>) -> Self {
        Node::Ref(Reference::at(key, path))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Node::Leaf(Value::Null))
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Node::Leaf(value) => value.as_i64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Node::Leaf(value) => value.as_str(),
            _ => None,
        }
    }

    pub fn as_component(&self) -> Option<&Component> {
        match self {
            Node::Component(component) => Some(component),
            _ => None,
        }
    }

    /// JSON form of the node, as sent on the wire.
    pub fn to_value(&self) -> Value {
        // Every node serializes to JSON with string keys, so this cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl Default for Node {
    fn default() -> Self {
        Node::null()
    }
}

impl Serialize for Node {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Node::Leaf(value) => value.serialize(serializer),
            Node::List(items) => items.serialize(serializer),
            Node::Map(map) => map.serialize(serializer),
            Node::Component(component) => component.serialize(serializer),
            Node::Ref(reference) => reference.serialize(serializer),
            Node::Event(event) => event.serialize(serializer),
            Node::Handler(handler) => handler.serialize(serializer),
            Node::Action(action) => action.serialize(serializer),
            Node::Response(response) => response.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Node::try_from(value).map_err(serde::de::Error::custom)
    }
}

impl TryFrom<Value> for Node {
    type Error = NodeError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Array(items) => items
                .into_iter()
                .map(Node::try_from)
                .collect::<Result<_, _>>()
                .map(Node::List),
            Value::Object(map) => match map.get(TAG) {
                None => map
                    .into_iter()
                    .map(|(key, value)| Ok((key, Node::try_from(value)?)))
                    .collect::<Result<_, NodeError>>()
                    .map(Node::Map),
                Some(Value::String(tag)) => {
                    let tag = tag.clone();
                    decode_tagged(&tag, Value::Object(map))
                }
                Some(_) => Err(NodeError::NonStringTag),
            },
            primitive => Ok(Node::Leaf(primitive)),
        }
    }
}

fn decode_tagged(tag: &str, value: Value) -> Result<Node, NodeError> {
    fn parse<T: DeserializeOwned>(tag: &str, value: Value) -> Result<T, NodeError> {
        serde_json::from_value(value).map_err(|source| NodeError::Invalid {
            tag: tag.to_string(),
            source,
        })
    }

    match tag {
        "component" => parse(tag, value).map(Node::Component),
        "ref" => parse(tag, value).map(Node::Ref),
        "event" => parse(tag, value).map(Node::Event),
        "handler" => parse(tag, value).map(Node::Handler),
        "action" => parse(tag, value).map(Node::Action),
        "response" => parse(tag, value).map(Node::Response),
        other => Err(NodeError::UnknownTag(other.to_string())),
    }
}

fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Node>, D::Error> {
    Ok(match Option::<Node>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(Node::List(items)) => items,
        Some(node) => vec![node],
    })
}

macro_rules! node_from_leaf {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Node {
            fn from(value: $ty) -> Self {
                Node::Leaf(Value::from(value))
            }
        })*
    };
}

node_from_leaf!(&str, String, bool, i32, i64, u64, f64);

impl From<Vec<Node>> for Node {
    fn from(items: Vec<Node>) -> Self {
        Node::List(items)
    }
}

impl From<Component> for Node {
    fn from(value: Component) -> Self {
        Node::Component(value)
    }
}

impl From<Reference> for Node {
    fn from(value: Reference) -> Self {
        Node::Ref(value)
    }
}

impl From<EventNode> for Node {
    fn from(value: EventNode) -> Self {
        Node::Event(value)
    }
}

impl From<HandlerNode> for Node {
    fn from(value: HandlerNode) -> Self {
        Node::Handler(value)
    }
}

impl From<Action> for Node {
    fn from(value: Action) -> Self {
        Node::Action(value)
    }
}

impl From<Response> for Node {
    fn from(value: Response) -> Self {
        Node::Response(value)
    }
}

impl Component {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            key: None,
            props: BTreeMap::new(),
            children: Vec::new(),
            path: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn prop(mut self, name: impl Into<String>, value: impl Into<Node>) -> Self {
        self.props.insert(name.into(), value.into());
        self
    }

    pub fn child(mut self, child: impl Into<Node>) -> Self {
        self.children.push(child.into());
        self
    }
}

impl Reference {
    pub fn new(key: impl Into<Key>) -> Self {
        Self {
            key: key.into(),
            path: Vec::new(),
        }
    }

    pub fn at(key: impl Into<Key>, path: impl IntoIterator<Item = PathSegment>) -> Self {
        Self {
            key: key.into(),
            path: path.into_iter().collect(),
        }
    }

    /// `[key, ...path]`, the form used for event targets.
    pub fn full_path(&self) -> Path {
        std::iter::once(PathSegment::Key(self.key.clone()))
            .chain(self.path.iter().cloned())
            .collect()
    }
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "$", rename = "ref")]
struct RefRepr {
    #[serde(rename = "ref")]
    target: RefTarget,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RefTarget {
    Key(String),
    Path(Vec<PathSegment>),
}

impl TryFrom<RefRepr> for Reference {
    type Error = String;

    fn try_from(repr: RefRepr) -> Result<Self, Self::Error> {
        match repr.target {
            RefTarget::Key(key) => Ok(Reference::new(key)),
            RefTarget::Path(mut path) => {
                if path.is_empty() {
                    return Err("reference path is empty".to_string());
                }
                let key = path.remove(0).to_string();
                Ok(Reference { key, path })
            }
        }
    }
}

impl From<Reference> for RefRepr {
    fn from(reference: Reference) -> Self {
        RefRepr {
            target: RefTarget::Path(reference.full_path()),
        }
    }
}

impl EventNode {
    pub fn new(handler: HandlerId) -> Self {
        Self {
            handler: Some(handler),
            args: Vec::new(),
            actions: Vec::new(),
            timeout_ms: None,
        }
    }

    /// Event that only carries client-side actions.
    pub fn actions(actions: impl IntoIterator<Item = Action>) -> Self {
        Self {
            handler: None,
            args: Vec::new(),
            actions: actions.into_iter().collect(),
            timeout_ms: None,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<Key>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }
}

impl HandlerNode {
    pub fn new(handler: HandlerId, state: impl IntoIterator<Item = impl Into<Key>>) -> Self {
        Self {
            handler,
            state: state.into_iter().map(Into::into).collect(),
        }
    }
}

impl Action {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Map::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn update_state(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Action::new(UPDATE_STATE_ACTION)
            .with_param("key", key.into())
            .with_param("value", value)
    }

    pub fn navigate(route: impl Into<String>) -> Self {
        Action::new(NAVIGATE_ACTION).with_param("route", route.into())
    }

    pub fn go_back() -> Self {
        Action::new(GO_BACK_ACTION)
    }
}

impl Response {
    pub fn ok(payload: impl Into<Value>) -> Self {
        Self {
            ok: true,
            payload: payload.into(),
            actions: Vec::new(),
            status_code: None,
        }
    }

    pub fn error(payload: impl Into<Value>) -> Self {
        Self {
            ok: false,
            payload: payload.into(),
            actions: Vec::new(),
            status_code: None,
        }
    }

    pub fn status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    pub fn action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }
}
