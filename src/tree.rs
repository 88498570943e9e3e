//! The in-memory namespace of a mounted archive.
//!
//! Nodes live in an arena and refer to each other by [`NodeId`]. Ids stay valid until the node
//! is removed and are never reused, so they double as inode numbers.

use std::collections::HashMap;
use std::ops::{Index, IndexMut};
use std::path::{Path, PathBuf};

use anyhow::Error;

use archivefs_store::{Entry, EntryKind};

use crate::path;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    /// The inode number reported for this node. The root gets inode 1.
    #[inline]
    pub fn inode(self) -> u64 {
        self.0 as u64 + 1
    }

    #[inline]
    pub fn from_inode(inode: u64) -> Self {
        NodeId(inode.saturating_sub(1) as usize)
    }
}

/// One path of the mounted archive.
#[derive(Debug)]
pub struct Node {
    /// Canonical path of the node in the tree.
    pub(crate) name: String,
    /// Current metadata. `entry.path` is the name this node had in the archive, hardlink
    /// targets are kept in canonical form.
    pub(crate) entry: Entry,
    /// Temporary file, directory or device node holding the materialized content.
    pub(crate) location: Option<PathBuf>,
    pub(crate) modified: bool,
    pub(crate) namechanged: bool,
    /// Whether `entry.path` names an entry of the archive file currently in use.
    pub(crate) in_archive: bool,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
}

impl Node {
    fn new(name: String, entry: Entry) -> Self {
        Self {
            name,
            entry,
            location: None,
            modified: false,
            namechanged: false,
            in_archive: false,
            parent: None,
            children: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn leaf_name(&self) -> &str {
        path::leaf(&self.name)
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    pub fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn name_changed(&self) -> bool {
        self.namechanged
    }

    pub fn in_archive(&self) -> bool {
        self.in_archive
    }

    pub fn is_dir(&self) -> bool {
        self.entry.is_dir()
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }
}

pub struct NodeTree {
    nodes: Vec<Option<Node>>,
    root: NodeId,
    absolute_names: bool,
}

impl Index<NodeId> for NodeTree {
    type Output = Node;

    /// Panics if the node has been removed.
    fn index(&self, id: NodeId) -> &Node {
        match self.nodes.get(id.0) {
            Some(Some(node)) => node,
            _ => panic!("access to removed node {:?}", id),
        }
    }
}

impl IndexMut<NodeId> for NodeTree {
    fn index_mut(&mut self, id: NodeId) -> &mut Node {
        match self.nodes.get_mut(id.0) {
            Some(Some(node)) => node,
            _ => panic!("access to removed node {:?}", id),
        }
    }
}

impl NodeTree {
    /// Create a tree containing only the root directory described by `root`.
    pub fn new(mut root: Entry) -> Self {
        root.kind = EntryKind::Directory;
        Self {
            nodes: vec![Some(Node::new("/".to_string(), root))],
            root: NodeId(0),
            absolute_names: false,
        }
    }

    #[inline]
    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    /// Number of nodes currently in the tree, the root included.
    pub fn node_count(&self) -> usize {
        self.nodes.iter().flatten().count()
    }

    /// Whether the archive spells its entry names with a leading `/`.
    pub fn absolute_names(&self) -> bool {
        self.absolute_names
    }

    pub fn set_absolute_names(&mut self, absolute: bool) {
        self.absolute_names = absolute;
    }

    /// The archive spelling of a canonical path, following the archive's convention.
    pub fn archive_name(&self, canonical: &str) -> String {
        path::archive_name(canonical, self.absolute_names)
    }

    /// Find the child of `dir` called `name`.
    pub fn child(&self, dir: NodeId, name: &str) -> Option<NodeId> {
        self[dir]
            .children
            .iter()
            .copied()
            .find(|child| self[*child].leaf_name() == name)
    }

    /// Resolve a canonical path by walking down from the root.
    pub fn lookup(&self, path: &str) -> Option<NodeId> {
        let mut current = self.root;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            current = self.child(current, component)?;
        }
        Some(current)
    }

    /// Find the node backed by the archive entry called `pathname`. Leading slashes and a
    /// leading `./` do not matter.
    pub fn resolve_by_entry(&self, pathname: &str) -> Option<NodeId> {
        let wanted = path::canonicalize(pathname);
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(index, node)| node.as_ref().map(|node| (NodeId(index), node)))
            .find(|(_, node)| node.in_archive && path::canonicalize(&node.entry.path) == wanted)
            .map(|(id, _)| id)
    }

    /// [`resolve_by_entry`](Self::resolve_by_entry) for all archive-backed nodes at once,
    /// keyed by canonical entry path.
    pub fn entry_index(&self) -> HashMap<String, NodeId> {
        let mut index = HashMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if let Some(node) = node {
                if node.in_archive && NodeId(i) != self.root {
                    index.insert(path::canonicalize(&node.entry.path), NodeId(i));
                }
            }
        }
        index
    }

    fn attach(&mut self, parent: NodeId, mut node: Node) -> NodeId {
        let id = NodeId(self.nodes.len());
        node.parent = Some(parent);
        self.nodes.push(Some(node));
        self[parent].children.push(id);
        id
    }

    /// Add the archive entry at canonical `path`, creating placeholder directories for missing
    /// ancestors.
    ///
    /// An existing node for `path` (a placeholder or an earlier duplicate) has its metadata
    /// replaced in place and keeps its children.
    pub fn insert_archive_entry(&mut self, path: &str, entry: Entry) -> Result<NodeId, Error> {
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let (last, ancestors) = match components.split_last() {
            Some(split) => split,
            None => io_return!(libc::EEXIST),
        };

        let mut current = self.root;
        let mut current_path = String::from("/");
        for component in ancestors {
            current_path = path::join(&current_path, component);
            current = match self.child(current, component) {
                Some(child) if self[child].is_dir() => child,
                Some(_) => io_return!(libc::ENOTDIR),
                None => {
                    let mut placeholder = self[self.root].entry.clone();
                    placeholder.path = self.archive_name(&current_path);
                    self.attach(current, Node::new(current_path.clone(), placeholder))
                }
            };
        }

        let id = match self.child(current, last) {
            Some(existing) => {
                if !entry.is_dir() && !self[existing].children.is_empty() {
                    io_return!(libc::EISDIR);
                }
                self[existing].entry = entry;
                existing
            }
            None => self.attach(current, Node::new(path::join(&current_path, last), entry)),
        };
        self[id].in_archive = true;
        Ok(id)
    }

    /// Add a new node at canonical `path`. Its parent must exist and be a directory.
    pub fn insert(&mut self, path: &str, entry: Entry) -> Result<NodeId, Error> {
        if self.lookup(path).is_some() {
            io_return!(libc::EEXIST);
        }
        let parent = match self.lookup(path::parent(path)) {
            Some(parent) => parent,
            None => io_return!(libc::ENOENT),
        };
        if !self[parent].is_dir() {
            io_return!(libc::ENOTDIR);
        }
        Ok(self.attach(parent, Node::new(path.to_string(), entry)))
    }

    /// Detach a node without children from the tree and return it.
    pub fn remove(&mut self, id: NodeId) -> Result<Node, Error> {
        if id == self.root {
            io_return!(libc::EBUSY);
        }
        if !self[id].children.is_empty() {
            io_return!(libc::ENOTEMPTY);
        }
        let node = match self.nodes.get_mut(id.0).and_then(Option::take) {
            Some(node) => node,
            None => io_return!(libc::ENOENT),
        };
        if let Some(parent) = node.parent {
            self[parent].children.retain(|child| *child != id);
        }
        Ok(node)
    }

    /// Move `id` (with everything below it) to the canonical path `new_path`, which must not
    /// exist yet.
    ///
    /// All moved nodes are marked as renamed, and hardlinks anywhere in the tree that point at
    /// a moved path are redirected to its new location.
    pub fn rename(&mut self, id: NodeId, new_path: &str) -> Result<(), Error> {
        if id == self.root {
            io_return!(libc::EBUSY);
        }
        let old_path = self[id].name.clone();
        if old_path == new_path {
            return Ok(());
        }
        if path::is_descendant(new_path, &old_path) {
            io_return!(libc::EINVAL);
        }
        if self.lookup(new_path).is_some() {
            io_return!(libc::EEXIST);
        }
        let new_parent = match self.lookup(path::parent(new_path)) {
            Some(parent) => parent,
            None => io_return!(libc::ENOENT),
        };
        if !self[new_parent].is_dir() {
            io_return!(libc::ENOTDIR);
        }

        let mut moved = HashMap::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let node = &mut self[current];
            let name = path::rebase(&node.name, &old_path, new_path);
            moved.insert(std::mem::replace(&mut node.name, name.clone()), name);
            node.namechanged = true;
            stack.extend(node.children.iter().copied());
        }

        if let Some(parent) = self[id].parent {
            self[parent].children.retain(|child| *child != id);
        }
        self[new_parent].children.push(id);
        self[id].parent = Some(new_parent);

        for node in self.nodes.iter_mut().flatten() {
            if let EntryKind::Hardlink(target) = &mut node.entry.kind {
                if let Some(new_target) = moved.get(target.as_str()) {
                    *target = new_target.clone();
                }
            }
        }

        Ok(())
    }

    /// All nodes in pre-order, siblings in insertion order.
    pub fn preorder(&self) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self[id].children.iter().rev().copied());
        }
        order
    }

    /// Nodes with pending changes, in pre-order.
    pub fn modified_nodes(&self) -> Vec<NodeId> {
        self.preorder()
            .into_iter()
            .filter(|id| self[*id].modified)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errno;

    fn root_entry() -> Entry {
        let mut root = Entry::new("", EntryKind::Directory);
        root.mode = 0o777;
        root.uid = 1000;
        root
    }

    fn file(path: &str) -> Entry {
        Entry::new(path, EntryKind::File)
    }

    fn dir(path: &str) -> Entry {
        let mut entry = Entry::new(path, EntryKind::Directory);
        entry.mode = 0o700;
        entry
    }

    #[test]
    fn placeholders_are_replaced_in_place() {
        let mut tree = NodeTree::new(root_entry());
        let deep = tree.insert_archive_entry("/a/b/c.txt", file("a/b/c.txt")).unwrap();

        let a = tree.lookup("/a").unwrap();
        assert!(!tree[a].in_archive());
        assert_eq!(tree[a].entry().mode, 0o777);
        assert_eq!(tree[a].entry().uid, 1000);
        assert_eq!(tree[a].entry().path, "a");

        let again = tree.insert_archive_entry("/a", dir("a/")).unwrap();
        assert_eq!(again, a);
        assert!(tree[a].in_archive());
        assert_eq!(tree[a].entry().mode, 0o700);
        assert_eq!(tree.lookup("/a/b/c.txt"), Some(deep));
        assert_eq!(tree.node_count(), 4);
    }

    #[test]
    fn file_ancestor_is_rejected() {
        let mut tree = NodeTree::new(root_entry());
        tree.insert_archive_entry("/f", file("f")).unwrap();
        let err = tree.insert_archive_entry("/f/x", file("f/x")).unwrap_err();
        assert_eq!(errno(&err), libc::ENOTDIR);

        tree.insert_archive_entry("/d/x", file("d/x")).unwrap();
        let err = tree.insert_archive_entry("/d", file("d")).unwrap_err();
        assert_eq!(errno(&err), libc::EISDIR);
    }

    #[test]
    fn lookup_and_resolve_by_entry() {
        let mut tree = NodeTree::new(root_entry());
        let id = tree.insert_archive_entry("/dir/file", file("./dir/file")).unwrap();
        assert_eq!(tree.lookup("/dir/file"), Some(id));
        assert_eq!(tree.lookup("/dir/nope"), None);
        assert_eq!(tree.lookup("/"), Some(tree.root()));
        assert_eq!(tree.resolve_by_entry("dir/file"), Some(id));
        assert_eq!(tree.resolve_by_entry("/dir/file"), Some(id));
        assert_eq!(tree.resolve_by_entry("dir"), None);
        assert_eq!(tree.entry_index().get("/dir/file"), Some(&id));
    }

    #[test]
    fn insert_checks_parent() {
        let mut tree = NodeTree::new(root_entry());
        tree.insert("/f", file("f")).unwrap();
        assert_eq!(errno(&tree.insert("/f", file("f")).unwrap_err()), libc::EEXIST);
        assert_eq!(errno(&tree.insert("/x/y", file("x/y")).unwrap_err()), libc::ENOENT);
        assert_eq!(errno(&tree.insert("/f/y", file("f/y")).unwrap_err()), libc::ENOTDIR);
    }

    #[test]
    fn remove_only_leaves() {
        let mut tree = NodeTree::new(root_entry());
        let d = tree.insert("/d", dir("d")).unwrap();
        let f = tree.insert("/d/f", file("d/f")).unwrap();
        assert_eq!(errno(&tree.remove(d).unwrap_err()), libc::ENOTEMPTY);
        assert_eq!(errno(&tree.remove(tree.root()).unwrap_err()), libc::EBUSY);

        let node = tree.remove(f).unwrap();
        assert_eq!(node.name(), "/d/f");
        assert!(tree.get(f).is_none());
        assert!(tree[d].children().is_empty());
        tree.remove(d).unwrap();
        assert_eq!(tree.lookup("/d"), None);
    }

    #[test]
    fn rename_moves_subtree_and_links() {
        let mut tree = NodeTree::new(root_entry());
        let d = tree.insert("/d", dir("d")).unwrap();
        let f = tree.insert("/d/f", file("d/f")).unwrap();
        let link = tree
            .insert("/link", Entry::new("link", EntryKind::Hardlink("/d/f".into())))
            .unwrap();
        let other = tree
            .insert("/other", Entry::new("other", EntryKind::Hardlink("/elsewhere".into())))
            .unwrap();
        tree.insert("/target", dir("target")).unwrap();

        tree.rename(d, "/target/moved").unwrap();

        assert_eq!(tree.lookup("/d"), None);
        assert_eq!(tree.lookup("/target/moved"), Some(d));
        assert_eq!(tree.lookup("/target/moved/f"), Some(f));
        assert_eq!(tree[f].name(), "/target/moved/f");
        assert!(tree[d].name_changed());
        assert!(tree[f].name_changed());
        assert_eq!(tree[f].entry().path, "d/f");
        assert_eq!(
            tree[link].entry().kind,
            EntryKind::Hardlink("/target/moved/f".into())
        );
        assert_eq!(tree[other].entry().kind, EntryKind::Hardlink("/elsewhere".into()));
    }

    #[test]
    fn rename_errors() {
        let mut tree = NodeTree::new(root_entry());
        let d = tree.insert("/d", dir("d")).unwrap();
        tree.insert("/d/sub", dir("d/sub")).unwrap();
        tree.insert("/f", file("f")).unwrap();
        assert_eq!(errno(&tree.rename(d, "/d/sub/x").unwrap_err()), libc::EINVAL);
        assert_eq!(errno(&tree.rename(d, "/f").unwrap_err()), libc::EEXIST);
        assert_eq!(errno(&tree.rename(d, "/nope/x").unwrap_err()), libc::ENOENT);
        assert_eq!(errno(&tree.rename(d, "/f/x").unwrap_err()), libc::ENOTDIR);
        tree.rename(d, "/d").unwrap();
        assert!(!tree[d].name_changed());
    }

    #[test]
    fn preorder_keeps_sibling_order() {
        let mut tree = NodeTree::new(root_entry());
        let b = tree.insert("/b", dir("b")).unwrap();
        let b1 = tree.insert("/b/1", file("b/1")).unwrap();
        let a = tree.insert("/a", file("a")).unwrap();
        let order = tree.preorder();
        assert_eq!(order, vec![tree.root(), b, b1, a]);

        tree[a].modified = true;
        tree[b1].modified = true;
        assert_eq!(tree.modified_nodes(), vec![b1, a]);
    }
}
