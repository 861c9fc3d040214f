//! Tracked-object metadata as it travels on the wire and in the model dump.

use serde::{Deserialize, Serialize};

use crate::version::VersionVector;

/// State transition of a tracked object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Create,
    Modify,
    Remove,
}

/// Object metadata. In an `Update` message the `objects` field is absent; in
/// the recursive model dump it holds the children of a directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ObjectInfo {
    pub identification: String,
    pub name: String,
    /// Root-relative, forward-slash path.
    pub path: String,
    pub directory: bool,
    /// Known identification and version without local content.
    #[serde(default)]
    pub shadow: bool,
    pub version: VersionVector,
    /// Hex content hash; absent for directories.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objects: Option<Vec<ObjectInfo>>,
}

impl ObjectInfo {
    /// All nodes of the tree in a single flat pass, parents before children.
    pub fn flatten(&self) -> Vec<&ObjectInfo> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            out.push(node);
            if let Some(children) = &node.objects {
                for child in children {
                    stack.push(child);
                }
            }
        }
        out
    }

    /// Copy without the recursive children, as carried by `Update` messages.
    pub fn without_children(&self) -> ObjectInfo {
        ObjectInfo {
            objects: None,
            ..self.clone()
        }
    }
}

/// Emitted by the model when a scan observes a transition.
#[derive(Debug, Clone)]
pub struct UpdateEvent {
    pub operation: Operation,
    pub object: ObjectInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(path: &str) -> ObjectInfo {
        ObjectInfo {
            identification: "0011223344556677".into(),
            name: crate::paths::terminal_name(path).into(),
            path: path.into(),
            directory: false,
            shadow: false,
            version: VersionVector::new(),
            content: Some(crate::hashing::hash_bytes(b"x")),
            objects: None,
        }
    }

    #[test]
    fn serde_uses_envelope_field_names() {
        let json = serde_json::to_string(&leaf("docs/notes.txt")).unwrap();
        for field in ["Identification", "Name", "Path", "Directory", "Shadow", "Version", "Content"] {
            assert!(json.contains(field), "missing field {field} in {json}");
        }
        assert!(!json.contains("Objects"));
    }

    #[test]
    fn serde_round_trip_preserves_fields() {
        let mut root = leaf("docs");
        root.directory = true;
        root.content = None;
        root.objects = Some(vec![leaf("docs/notes.txt"), leaf("docs/todo.txt")]);

        let json = serde_json::to_string(&root).unwrap();
        let back: ObjectInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, root);
    }

    #[test]
    fn flatten_visits_every_node() {
        let mut root = leaf("docs");
        root.directory = true;
        root.objects = Some(vec![leaf("docs/notes.txt"), leaf("docs/todo.txt")]);
        let flat = root.flatten();
        assert_eq!(flat.len(), 3);
        assert!(flat.iter().any(|o| o.path == "docs/todo.txt"));
    }
}
