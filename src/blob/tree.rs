use serde::{Deserialize, Deserializer, Serialize};

use crate::{crypto::hasher::hash, error::TreeErrorKind, id::Id, PackdenResult};

/// A [`Tree`] is a list of [`Node`]s
///
/// Trees are serialized as JSON and stored as `tree` blobs. The core walks
/// trees (e.g. in the checker) but does not construct them from filesystem
/// state; that is the job of the archiver.
#[derive(Default, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Tree {
    #[serde(deserialize_with = "deserialize_null_default")]
    /// The nodes contained in the tree, sorted by name
    pub nodes: Vec<Node>,
}

/// Deserializes `Option<T>` as `T::default()` if the value is `null`
pub(crate) fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    T: Default + Deserialize<'de>,
    D: Deserializer<'de>,
{
    let opt = Option::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

impl Tree {
    /// Creates a new `Tree` with no nodes.
    #[must_use]
    pub const fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    /// Adds a node to the tree.
    pub fn add(&mut self, node: Node) {
        self.nodes.push(node);
    }

    /// Serializes the tree.
    ///
    /// # Returns
    ///
    /// A tuple of the serialized tree as `Vec<u8>` and the tree's ID
    pub fn serialize(&self) -> PackdenResult<(Vec<u8>, Id)> {
        let mut chunk = serde_json::to_vec(&self).map_err(TreeErrorKind::SerializingTreeFailed)?;
        chunk.push(b'\n'); // for whatever reason, restic adds a newline, so to be compatible...
        let id = hash(&chunk);
        Ok((chunk, id))
    }

    /// Deserializes a tree from its JSON plaintext.
    pub fn from_slice(data: &[u8]) -> PackdenResult<Self> {
        Ok(serde_json::from_slice(data).map_err(TreeErrorKind::DeserializingTreeFailed)?)
    }
}

/// The type of a [`Node`], including the type-specific payload
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NodeType {
    /// Node is a regular file
    File,
    /// Node is a directory
    Dir,
    /// Node is a symlink
    Symlink {
        /// The target of the symlink
        linktarget: String,
    },
}

/// A node within a [`Tree`]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Name of the node: filename or dirname
    pub name: String,

    #[serde(flatten)]
    /// Information about the node type
    pub node_type: NodeType,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    #[serde(skip_serializing_if = "Option::is_none")]
    /// The ids of the data blobs making up the file contents
    ///
    /// # Note
    ///
    /// This is only set for regular files.
    pub content: Option<Vec<Id>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// The id of the tree blob describing the directory contents
    ///
    /// # Note
    ///
    /// This is only set for directories.
    pub subtree: Option<Id>,
}

impl Node {
    /// Creates a new file node with the given contents.
    #[must_use]
    pub fn new_file(name: String, content: Vec<Id>) -> Self {
        Self {
            name,
            node_type: NodeType::File,
            content: Some(content),
            subtree: None,
        }
    }

    /// Creates a new dir node referencing the given subtree.
    #[must_use]
    pub fn new_dir(name: String, subtree: Id) -> Self {
        Self {
            name,
            node_type: NodeType::Dir,
            content: None,
            subtree: Some(subtree),
        }
    }

    /// Creates a new symlink node with the given target.
    #[must_use]
    pub fn new_symlink(name: String, linktarget: String) -> Self {
        Self {
            name,
            node_type: NodeType::Symlink { linktarget },
            content: None,
            subtree: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_json_carries_node_type_tag() {
        let mut tree = Tree::new();
        tree.add(Node::new_file("a.txt".to_string(), vec![Id::random()]));
        tree.add(Node::new_dir("sub".to_string(), Id::random()));
        tree.add(Node::new_symlink("link".to_string(), "a.txt".to_string()));

        let (data, _) = tree.serialize().unwrap();
        let json = std::str::from_utf8(&data).unwrap();
        assert!(json.contains("\"type\":\"file\""));
        assert!(json.contains("\"type\":\"dir\""));
        assert!(json.contains("\"type\":\"symlink\""));

        assert_eq!(Tree::from_slice(&data).unwrap(), tree);
    }

    #[test]
    fn serialized_tree_id_is_hash_of_bytes() {
        let tree = Tree::new();
        let (data, id) = tree.serialize().unwrap();
        assert_eq!(id, hash(&data));
        assert_eq!(data.last(), Some(&b'\n'));
    }

    #[test]
    fn null_nodes_deserialize_to_empty_tree() {
        let tree: Tree = serde_json::from_str("{\"nodes\": null}").unwrap();
        assert!(tree.nodes.is_empty());
    }
}
