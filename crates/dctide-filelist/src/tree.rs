//! Arena-backed file-list tree.
//!
//! Nodes live in a slot arena and refer to each other through
//! [`NodeId`] indices, which keeps parent back-links safe without
//! interior mutability. Ownership is parent-to-children: freeing a
//! directory frees its whole subtree, and dropping the tree frees
//! everything.
//!
//! Within a directory, children are kept in canonical order: ascending
//! by case-folded name, ties broken by byte-wise name. Two siblings may
//! never compare equal case-insensitively. Directory sizes always equal
//! the sum of their descendants' file sizes; `add` and `remove` keep the
//! whole ancestor chain consistent.

use dctide_hash::Tth;

use crate::error::ListError;

/// Index of a node inside its [`FileTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

/// Local-share extension carried by file nodes that mirror a file on
/// disk; used to reconcile the share with the persistence layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalMeta {
    /// mtime of the on-disk file, unix seconds
    pub last_modified: u64,
    /// row id in the `hashfiles` table
    pub storage_id: i64,
}

/// File or directory payload of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// Leaf file
    File {
        /// File size in bytes
        size: u64,
        /// Tiger tree root, when known
        tth: Option<Tth>,
        /// Present on nodes of our own share
        local: Option<LocalMeta>,
    },
    /// Directory; `size` aggregates the subtree
    Dir {
        /// Sum of descendant file sizes
        size: u64,
        /// Child nodes in canonical order (once sorted)
        children: Vec<NodeId>,
        /// Peer marked this directory as not fully listed
        incomplete: bool,
    },
}

/// One node of a file listing.
#[derive(Debug, Clone)]
pub struct Node {
    name: String,
    parent: Option<NodeId>,
    kind: NodeKind,
}

impl Node {
    /// Node name. Immutable; renaming is delete + insert.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parent link, absent on the root and on detached nodes.
    #[must_use]
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// File/directory payload.
    #[must_use]
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// True for file nodes.
    #[must_use]
    pub fn is_file(&self) -> bool {
        matches!(self.kind, NodeKind::File { .. })
    }

    /// File size, or aggregate size for directories.
    #[must_use]
    pub fn size(&self) -> u64 {
        match self.kind {
            NodeKind::File { size, .. } | NodeKind::Dir { size, .. } => size,
        }
    }

    /// Tiger tree root for hashed files.
    #[must_use]
    pub fn tth(&self) -> Option<Tth> {
        match self.kind {
            NodeKind::File { tth, .. } => tth,
            NodeKind::Dir { .. } => None,
        }
    }

    /// Local-share extension, if any.
    #[must_use]
    pub fn local(&self) -> Option<LocalMeta> {
        match self.kind {
            NodeKind::File { local, .. } => local,
            NodeKind::Dir { .. } => None,
        }
    }

    /// Children in stored order. Empty for files.
    #[must_use]
    pub fn children(&self) -> &[NodeId] {
        match &self.kind {
            NodeKind::Dir { children, .. } => children,
            NodeKind::File { .. } => &[],
        }
    }

    /// Incomplete marker on directories.
    #[must_use]
    pub fn incomplete(&self) -> bool {
        matches!(self.kind, NodeKind::Dir { incomplete: true, .. })
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/')
}

/// Canonical sibling ordering key: case-folded name first, raw bytes as
/// the tiebreak.
fn name_cmp(a: &str, b: &str) -> std::cmp::Ordering {
    let fold = a
        .chars()
        .flat_map(char::to_lowercase)
        .cmp(b.chars().flat_map(char::to_lowercase));
    fold.then_with(|| a.cmp(b))
}

fn name_cmp_ci(a: &str, b: &str) -> std::cmp::Ordering {
    a.chars()
        .flat_map(char::to_lowercase)
        .cmp(b.chars().flat_map(char::to_lowercase))
}

/// A whole file listing.
pub struct FileTree {
    slots: Vec<Option<Node>>,
    free: Vec<u32>,
    root: NodeId,
}

impl FileTree {
    /// Empty listing: a root directory with an empty name.
    #[must_use]
    pub fn new() -> Self {
        let root = Node {
            name: String::new(),
            parent: None,
            kind: NodeKind::Dir {
                size: 0,
                children: Vec::new(),
                incomplete: false,
            },
        };
        FileTree {
            slots: vec![Some(root)],
            free: Vec::new(),
            root: NodeId(0),
        }
    }

    /// Root node id.
    #[must_use]
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Borrow a node.
    ///
    /// # Panics
    ///
    /// Panics on a stale or foreign id; ids are only handed out by this
    /// tree and become invalid when their node is removed.
    #[must_use]
    pub fn node(&self, id: NodeId) -> &Node {
        self.slots[id.0 as usize].as_ref().expect("live node id")
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.slots[id.0 as usize].as_mut().expect("live node id")
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Some(node);
            NodeId(idx)
        } else {
            self.slots.push(Some(node));
            NodeId((self.slots.len() - 1) as u32)
        }
    }

    /// Create a detached file node.
    ///
    /// # Errors
    ///
    /// Fails when the name is empty, contains `/`, or is `.` / `..`.
    pub fn create_file(
        &mut self,
        name: &str,
        size: u64,
        tth: Option<Tth>,
        local: Option<LocalMeta>,
    ) -> Result<NodeId, ListError> {
        if !valid_name(name) {
            return Err(ListError::InvalidName(name.to_string()));
        }
        Ok(self.alloc(Node {
            name: name.to_string(),
            parent: None,
            kind: NodeKind::File { size, tth, local },
        }))
    }

    /// Create a detached directory node.
    ///
    /// # Errors
    ///
    /// Fails on an invalid name, as for [`FileTree::create_file`].
    pub fn create_dir(&mut self, name: &str, incomplete: bool) -> Result<NodeId, ListError> {
        if !valid_name(name) {
            return Err(ListError::InvalidName(name.to_string()));
        }
        Ok(self.alloc(Node {
            name: name.to_string(),
            parent: None,
            kind: NodeKind::Dir {
                size: 0,
                children: Vec::new(),
                incomplete,
            },
        }))
    }

    /// Attach a detached node under a directory.
    ///
    /// Appends without sorting; run [`FileTree::sort`] once a batch of
    /// inserts is done. Ancestor sizes are updated immediately.
    ///
    /// # Errors
    ///
    /// Fails when `parent` is not a directory, `child` is already
    /// attached, or a case-insensitive sibling with the same name
    /// exists.
    pub fn add(&mut self, parent: NodeId, child: NodeId) -> Result<(), ListError> {
        if child == self.root {
            return Err(ListError::IsRoot);
        }
        if self.node(child).parent.is_some() {
            return Err(ListError::AlreadyAttached);
        }
        let child_name = self.node(child).name.clone();
        let child_size = self.node(child).size();
        {
            let pnode = self.node(parent);
            let NodeKind::Dir { children, .. } = &pnode.kind else {
                return Err(ListError::NotADirectory);
            };
            for &c in children {
                if name_cmp_ci(&self.node(c).name, &child_name).is_eq() {
                    return Err(ListError::Duplicate(child_name));
                }
            }
        }
        self.node_mut(child).parent = Some(parent);
        match &mut self.node_mut(parent).kind {
            NodeKind::Dir { children, .. } => children.push(child),
            NodeKind::File { .. } => unreachable!("checked above"),
        }
        self.bump_sizes(parent, child_size as i64);
        Ok(())
    }

    fn bump_sizes(&mut self, from: NodeId, delta: i64) {
        let mut cur = Some(from);
        while let Some(id) = cur {
            let node = self.node_mut(id);
            if let NodeKind::Dir { size, .. } = &mut node.kind {
                *size = size.wrapping_add_signed(delta);
            }
            cur = node.parent;
        }
    }

    /// Canonicalize the child order of one directory.
    pub fn sort(&mut self, dir: NodeId) {
        let mut children = match &self.node(dir).kind {
            NodeKind::Dir { children, .. } => children.clone(),
            NodeKind::File { .. } => return,
        };
        children.sort_by(|&a, &b| name_cmp(&self.node(a).name, &self.node(b).name));
        if let NodeKind::Dir { children: c, .. } = &mut self.node_mut(dir).kind {
            *c = children;
        }
    }

    /// Canonicalize the whole subtree under `dir`.
    pub fn sort_recursive(&mut self, dir: NodeId) {
        self.sort(dir);
        let children = self.node(dir).children().to_vec();
        for c in children {
            if !self.node(c).is_file() {
                self.sort_recursive(c);
            }
        }
    }

    /// Detach and free a node and its subtree.
    ///
    /// Ancestor sizes are reduced by the node's size. The id (and every
    /// id inside the subtree) is invalid afterwards.
    ///
    /// # Errors
    ///
    /// The root cannot be removed.
    pub fn remove(&mut self, id: NodeId) -> Result<(), ListError> {
        if id == self.root {
            return Err(ListError::IsRoot);
        }
        let size = self.node(id).size();
        if let Some(parent) = self.node(id).parent {
            if let NodeKind::Dir { children, .. } = &mut self.node_mut(parent).kind {
                children.retain(|&c| c != id);
            }
            self.bump_sizes(parent, -(size as i64));
        }
        self.free_subtree(id);
        Ok(())
    }

    fn free_subtree(&mut self, id: NodeId) {
        let children = self.node(id).children().to_vec();
        for c in children {
            self.free_subtree(c);
        }
        self.slots[id.0 as usize] = None;
        self.free.push(id.0);
    }

    /// Look up a child by name.
    ///
    /// Binary search over the canonical order, so the directory must be
    /// sorted. Case-insensitive by default; `strict` narrows a
    /// case-equal run down to the byte-exact name.
    #[must_use]
    pub fn find(&self, dir: NodeId, name: &str, strict: bool) -> Option<NodeId> {
        let children = self.node(dir).children();
        let mut idx = children
            .binary_search_by(|&c| name_cmp_ci(&self.node(c).name, name))
            .ok()?;
        // Walk to the start of the case-equal run.
        while idx > 0 && name_cmp_ci(&self.node(children[idx - 1]).name, name).is_eq() {
            idx -= 1;
        }
        if !strict {
            return Some(children[idx]);
        }
        while idx < children.len() {
            let c = children[idx];
            if !name_cmp_ci(&self.node(c).name, name).is_eq() {
                break;
            }
            if self.node(c).name == name {
                return Some(c);
            }
            idx += 1;
        }
        None
    }

    /// Resolve a slash-delimited path from the root.
    ///
    /// `/` denotes the root; empty segments are ignored. Lookup is
    /// case-insensitive. `.` and `..` are never valid node names, so
    /// they simply fail to resolve.
    #[must_use]
    pub fn resolve(&self, path: &str) -> Option<NodeId> {
        let mut cur = self.root;
        for seg in path.split('/').filter(|s| !s.is_empty()) {
            if self.node(cur).is_file() {
                return None;
            }
            cur = self.find(cur, seg, false)?;
        }
        Some(cur)
    }

    /// Canonical absolute path of a node, `/` for the root.
    #[must_use]
    pub fn path_of(&self, id: NodeId) -> String {
        let mut parts = Vec::new();
        let mut cur = Some(id);
        while let Some(n) = cur {
            let node = self.node(n);
            if node.parent.is_some() || n != self.root {
                parts.push(node.name.as_str());
            }
            cur = node.parent;
        }
        if parts.is_empty() {
            return "/".to_string();
        }
        let mut path = String::new();
        for p in parts.iter().rev() {
            path.push('/');
            path.push_str(p);
        }
        path
    }

    /// True iff no file in the subtree carries a TTH.
    #[must_use]
    pub fn is_empty(&self, dir: NodeId) -> bool {
        let node = self.node(dir);
        match &node.kind {
            NodeKind::File { tth, .. } => tth.is_none(),
            NodeKind::Dir { children, .. } => children.iter().all(|&c| self.is_empty(c)),
        }
    }

    /// Deep-copy a subtree into a new tree whose root is the copy.
    ///
    /// The copy's root has no parent. Copying the tree's own root
    /// clones the whole listing.
    #[must_use]
    pub fn copy(&self, id: NodeId) -> FileTree {
        let src = self.node(id);
        let mut out = FileTree {
            slots: Vec::new(),
            free: Vec::new(),
            root: NodeId(0),
        };
        let root = Node {
            name: src.name.clone(),
            parent: None,
            kind: match &src.kind {
                NodeKind::File { size, tth, local } => NodeKind::File {
                    size: *size,
                    tth: *tth,
                    local: *local,
                },
                NodeKind::Dir {
                    size, incomplete, ..
                } => NodeKind::Dir {
                    size: *size,
                    children: Vec::new(),
                    incomplete: *incomplete,
                },
            },
        };
        out.slots.push(Some(root));
        let children = src.children().to_vec();
        for c in children {
            self.copy_under(c, NodeId(0), &mut out);
        }
        out
    }

    fn copy_under(&self, src_id: NodeId, dst_parent: NodeId, out: &mut FileTree) {
        let src = self.node(src_id);
        let node = Node {
            name: src.name.clone(),
            parent: Some(dst_parent),
            kind: match &src.kind {
                NodeKind::File { size, tth, local } => NodeKind::File {
                    size: *size,
                    tth: *tth,
                    local: *local,
                },
                NodeKind::Dir {
                    size, incomplete, ..
                } => NodeKind::Dir {
                    size: *size,
                    children: Vec::new(),
                    incomplete: *incomplete,
                },
            },
        };
        let dst_id = out.alloc(node);
        if let NodeKind::Dir { children, .. } = &mut out.node_mut(dst_parent).kind {
            children.push(dst_id);
        }
        for c in self.node(src_id).children().to_vec() {
            self.copy_under(c, dst_id, out);
        }
    }

    fn structural_eq(&self, a: NodeId, other: &FileTree, b: NodeId) -> bool {
        let na = self.node(a);
        let nb = other.node(b);
        if na.name != nb.name {
            return false;
        }
        match (&na.kind, &nb.kind) {
            (
                NodeKind::File {
                    size: sa,
                    tth: ta,
                    local: la,
                },
                NodeKind::File {
                    size: sb,
                    tth: tb,
                    local: lb,
                },
            ) => sa == sb && ta == tb && la == lb,
            (
                NodeKind::Dir {
                    size: sa,
                    children: ca,
                    incomplete: ia,
                },
                NodeKind::Dir {
                    size: sb,
                    children: cb,
                    incomplete: ib,
                },
            ) => {
                sa == sb
                    && ia == ib
                    && ca.len() == cb.len()
                    && ca
                        .iter()
                        .zip(cb.iter())
                        .all(|(&x, &y)| self.structural_eq(x, other, y))
            }
            _ => false,
        }
    }
}

impl PartialEq for FileTree {
    fn eq(&self, other: &Self) -> bool {
        self.structural_eq(self.root, other, other.root)
    }
}

impl Default for FileTree {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FileTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn walk(
            tree: &FileTree,
            id: NodeId,
            depth: usize,
            f: &mut std::fmt::Formatter<'_>,
        ) -> std::fmt::Result {
            let node = tree.node(id);
            writeln!(
                f,
                "{:indent$}{}{} ({})",
                "",
                node.name(),
                if node.is_file() { "" } else { "/" },
                node.size(),
                indent = depth * 2
            )?;
            for &c in node.children() {
                walk(tree, c, depth + 1, f)?;
            }
            Ok(())
        }
        walk(self, self.root, 0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (FileTree, NodeId, NodeId) {
        let mut t = FileTree::new();
        let root = t.root();
        let dir = t.create_dir("Music", false).unwrap();
        t.add(root, dir).unwrap();
        let f1 = t.create_file("b.mp3", 100, None, None).unwrap();
        let f2 = t.create_file("A.mp3", 50, None, None).unwrap();
        t.add(dir, f1).unwrap();
        t.add(dir, f2).unwrap();
        t.sort_recursive(root);
        (t, root, dir)
    }

    #[test]
    fn test_sizes_aggregate_up() {
        let (t, root, dir) = sample();
        assert_eq!(t.node(dir).size(), 150);
        assert_eq!(t.node(root).size(), 150);
    }

    #[test]
    fn test_canonical_order() {
        let (t, _, dir) = sample();
        let names: Vec<&str> = t
            .node(dir)
            .children()
            .iter()
            .map(|&c| t.node(c).name())
            .collect();
        assert_eq!(names, ["A.mp3", "b.mp3"]);
    }

    #[test]
    fn test_case_tiebreak_is_bytewise() {
        let mut t = FileTree::new();
        let root = t.root();
        let f1 = t.create_file("ab", 1, None, None).unwrap();
        let f2 = t.create_file("Ab", 1, None, None).unwrap();
        // Same case-folded name: the second insert is a duplicate.
        t.add(root, f1).unwrap();
        assert!(matches!(t.add(root, f2), Err(ListError::Duplicate(_))));
    }

    #[test]
    fn test_find_strict_and_loose() {
        let (t, _, dir) = sample();
        let hit = t.find(dir, "a.mp3", false).unwrap();
        assert_eq!(t.node(hit).name(), "A.mp3");
        assert!(t.find(dir, "a.mp3", true).is_none());
        assert!(t.find(dir, "A.mp3", true).is_some());
        assert!(t.find(dir, "missing", false).is_none());
    }

    #[test]
    fn test_resolve_and_path_of() {
        let (t, root, _) = sample();
        assert_eq!(t.resolve("/"), Some(root));
        let f = t.resolve("/music/B.MP3").unwrap();
        assert_eq!(t.node(f).name(), "b.mp3");
        assert_eq!(t.path_of(f), "/Music/b.mp3");
        assert!(t.resolve("/Music/../Music").is_none());
    }

    #[test]
    fn test_remove_updates_sizes() {
        let (mut t, root, dir) = sample();
        let f = t.find(dir, "b.mp3", true).unwrap();
        t.remove(f).unwrap();
        assert_eq!(t.node(dir).size(), 50);
        assert_eq!(t.node(root).size(), 50);
        assert_eq!(t.node(dir).children().len(), 1);
        assert!(t.remove(root).is_err());
    }

    #[test]
    fn test_remove_subtree_frees_ids() {
        let (mut t, root, dir) = sample();
        t.remove(dir).unwrap();
        assert_eq!(t.node(root).size(), 0);
        assert!(t.node(root).children().is_empty());
        // Freed slots get reused.
        let d = t.create_dir("new", false).unwrap();
        t.add(root, d).unwrap();
    }

    #[test]
    fn test_rejects_bad_names() {
        let mut t = FileTree::new();
        assert!(t.create_dir("a/b", false).is_err());
        assert!(t.create_file("", 0, None, None).is_err());
        assert!(t.create_dir("..", false).is_err());
    }

    #[test]
    fn test_is_empty_tracks_tth() {
        let (mut t, root, dir) = sample();
        assert!(t.is_empty(root));
        let f = t
            .create_file("c.mp3", 1, Some(Tth([7u8; 24])), None)
            .unwrap();
        t.add(dir, f).unwrap();
        t.sort(dir);
        assert!(!t.is_empty(root));
        assert!(!t.is_empty(dir));
    }

    #[test]
    fn test_copy_is_detached_and_equal() {
        let (t, _, dir) = sample();
        let copy = t.copy(dir);
        assert!(copy.node(copy.root()).parent().is_none());
        assert_eq!(copy.node(copy.root()).size(), 150);
        let names: Vec<&str> = copy
            .node(copy.root())
            .children()
            .iter()
            .map(|&c| copy.node(c).name())
            .collect();
        assert_eq!(names, ["A.mp3", "b.mp3"]);
    }

    #[test]
    fn test_detached_node_needs_add() {
        let mut t = FileTree::new();
        let root = t.root();
        let f = t.create_file("x", 10, None, None).unwrap();
        assert_eq!(t.node(root).size(), 0);
        t.add(root, f).unwrap();
        assert_eq!(t.node(root).size(), 10);
        assert!(matches!(t.add(root, f), Err(ListError::AlreadyAttached)));
    }
}
