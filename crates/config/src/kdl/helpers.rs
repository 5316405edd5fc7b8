//! Accessors for KDL child nodes used as `key value` settings.

use ::kdl::{KdlNode, KdlValue};

/// Find a direct child node by name
pub fn get_child<'a>(node: &'a KdlNode, name: &str) -> Option<&'a KdlNode> {
    node.children()?
        .nodes()
        .iter()
        .find(|child| child.name().value() == name)
}

/// Positional arguments of a node, in order
pub fn args(node: &KdlNode) -> impl Iterator<Item = &KdlValue> {
    node.entries()
        .iter()
        .filter(|entry| entry.name().is_none())
        .map(|entry| entry.value())
}

/// Named property of a node
pub fn get_prop<'a>(node: &'a KdlNode, key: &str) -> Option<&'a KdlValue> {
    node.entries()
        .iter()
        .find(|entry| entry.name().map(|n| n.value()) == Some(key))
        .map(|entry| entry.value())
}

pub fn get_first_arg_string(node: &KdlNode) -> Option<String> {
    args(node).next()?.as_string().map(str::to_string)
}

/// First argument of the child `name` as a string
pub fn get_string_entry(node: &KdlNode, name: &str) -> Option<String> {
    get_first_arg_string(get_child(node, name)?)
}

/// First argument of the child `name` as an integer
pub fn get_int_entry(node: &KdlNode, name: &str) -> Option<i128> {
    args(get_child(node, name)?).next()?.as_integer()
}

/// First argument of the child `name` as a boolean
pub fn get_bool_entry(node: &KdlNode, name: &str) -> Option<bool> {
    args(get_child(node, name)?).next()?.as_bool()
}

/// Every string argument of every child called `name`
///
/// Lists may be written on one line (`allow "a" "b"`) or repeated
/// (`allow "a"` / `allow "b"`).
pub fn get_string_list(node: &KdlNode, name: &str) -> Vec<String> {
    let Some(children) = node.children() else {
        return Vec::new();
    };

    children
        .nodes()
        .iter()
        .filter(|child| child.name().value() == name)
        .flat_map(|child| args(child).filter_map(|v| v.as_string().map(str::to_string)))
        .collect()
}

/// Convert a parsed integer into an unsigned setting
pub fn to_u64(value: i128, key: &str) -> anyhow::Result<u64> {
    u64::try_from(value).map_err(|_| anyhow::anyhow!("'{}' must be a non-negative integer", key))
}
