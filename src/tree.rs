use crate::checksum::Strong;

/// Kind of a filesystem entry, as recorded in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

/// Handle to a node in a [`Tree`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

/// A fixed-size chunk of a file, fingerprinted by weak and strong checksums.
/// `position` is the 0-based block index within the parent file; the parent
/// linkage itself lives in the flat block index as a [`crate::index::BlockRef`].
#[derive(Debug, Clone)]
pub struct Block {
    pub position: usize,
    pub weak: u32,
    pub strong: Strong,
}

#[derive(Debug)]
pub struct Dir {
    pub name: String,
    pub mode: u32,
    /// Digest of the canonical child listing; filled by the bottom-up pass.
    pub strong: Strong,
    pub parent: Option<NodeId>,
    pub subdirs: Vec<NodeId>,
    pub files: Vec<NodeId>,
}

#[derive(Debug)]
pub struct File {
    pub name: String,
    pub size: u64,
    pub mode: u32,
    /// Digest of the full content stream, not derived from block checksums.
    pub strong: Strong,
    pub parent: Option<NodeId>,
    pub blocks: Vec<Block>,
}

#[derive(Debug)]
pub enum FsNode {
    Dir(Dir),
    File(File),
}

impl FsNode {
    pub fn name(&self) -> &str {
        match self {
            Self::Dir(d) => &d.name,
            Self::File(f) => &f.name,
        }
    }

    pub fn mode(&self) -> u32 {
        match self {
            Self::Dir(d) => d.mode,
            Self::File(f) => f.mode,
        }
    }

    pub fn strong(&self) -> Strong {
        match self {
            Self::Dir(d) => d.strong,
            Self::File(f) => f.strong,
        }
    }

    pub fn parent(&self) -> Option<NodeId> {
        match self {
            Self::Dir(d) => d.parent,
            Self::File(f) => f.parent,
        }
    }

    pub fn kind(&self) -> EntryKind {
        match self {
            Self::Dir(_) => EntryKind::Dir,
            Self::File(_) => EntryKind::File,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Self::Dir(_))
    }

    pub fn as_file(&self) -> Option<&File> {
        match self {
            Self::File(f) => Some(f),
            Self::Dir(_) => None,
        }
    }

    pub fn as_dir(&self) -> Option<&Dir> {
        match self {
            Self::Dir(d) => Some(d),
            Self::File(_) => None,
        }
    }
}

/// An immutable content-indexed tree. Nodes live in an arena and refer to
/// each other by [`NodeId`]; the root is always index 0. After the build
/// only directory strongs are filled in (bottom-up), nothing else mutates.
#[derive(Debug)]
pub struct Tree {
    nodes: Vec<FsNode>,
}

impl Tree {
    pub(crate) fn with_root(root: FsNode) -> Self {
        Self { nodes: vec![root] }
    }

    /// Append a node and wire it into its parent's child list.
    pub(crate) fn push(&mut self, node: FsNode) -> NodeId {
        let id = NodeId(self.nodes.len());
        let parent = node.parent();
        let kind = node.kind();
        self.nodes.push(node);
        if let Some(pid) = parent {
            if let FsNode::Dir(dir) = &mut self.nodes[pid.0] {
                match kind {
                    EntryKind::Dir => dir.subdirs.push(id),
                    EntryKind::File => dir.files.push(id),
                }
            }
        }
        id
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn node(&self, id: NodeId) -> &FsNode {
        &self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Relative path of a node from the root, `/`-separated; the root
    /// itself is the empty string.
    pub fn rel_path(&self, id: NodeId) -> String {
        let mut names = Vec::new();
        let mut cur = id;
        while let Some(parent) = self.node(cur).parent() {
            names.push(self.node(cur).name());
            cur = parent;
        }
        names.reverse();
        names.join("/")
    }

    /// Pre-order traversal; within a directory sub-dirs come before files,
    /// each in indexing (name-sorted) order.
    pub fn walk(&self) -> Walk<'_> {
        Walk {
            tree: self,
            stack: vec![self.root()],
        }
    }

    /// Fill in directory strongs bottom-up. The canonical listing of a
    /// directory is `"<child_strong>\t<d|f>\t<child_name>\n"` per child,
    /// sub-dirs first then files; the dir strong is the digest of that
    /// byte stream, which makes the root strong a Merkle root.
    pub(crate) fn finalize_dir_strongs(&mut self) {
        self.fill_dir_strong(self.root());
    }

    fn fill_dir_strong(&mut self, id: NodeId) {
        let (subdirs, files) = match self.node(id) {
            FsNode::Dir(d) => (d.subdirs.clone(), d.files.clone()),
            FsNode::File(_) => return,
        };
        for &child in &subdirs {
            self.fill_dir_strong(child);
        }

        let mut listing = Vec::new();
        for (group, tag) in [(&subdirs, 'd'), (&files, 'f')] {
            for &child in group.iter() {
                let node = self.node(child);
                listing.extend_from_slice(
                    format!("{}\t{}\t{}\n", node.strong(), tag, node.name()).as_bytes(),
                );
            }
        }
        let strong = Strong::of(&listing);
        if let FsNode::Dir(d) = &mut self.nodes[id.0] {
            d.strong = strong;
        }
    }
}

pub struct Walk<'a> {
    tree: &'a Tree,
    stack: Vec<NodeId>,
}

impl Iterator for Walk<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.stack.pop()?;
        if let FsNode::Dir(d) = self.tree.node(id) {
            for &child in d.files.iter().rev() {
                self.stack.push(child);
            }
            for &child in d.subdirs.iter().rev() {
                self.stack.push(child);
            }
        }
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir(name: &str, parent: Option<NodeId>) -> FsNode {
        FsNode::Dir(Dir {
            name: name.to_owned(),
            mode: 0o755,
            strong: Strong::of(&[]),
            parent,
            subdirs: Vec::new(),
            files: Vec::new(),
        })
    }

    fn file(name: &str, content: &[u8], parent: NodeId) -> FsNode {
        FsNode::File(File {
            name: name.to_owned(),
            size: content.len() as u64,
            mode: 0o644,
            strong: Strong::of(content),
            parent: Some(parent),
            blocks: Vec::new(),
        })
    }

    fn sample_tree() -> Tree {
        let mut tree = Tree::with_root(dir("root", None));
        let sub = tree.push(dir("sub", Some(tree.root())));
        tree.push(file("inner", b"inner content", sub));
        tree.push(file("top", b"top content", tree.root()));
        tree.finalize_dir_strongs();
        tree
    }

    #[test]
    fn rel_paths_join_from_root() {
        let tree = sample_tree();
        let paths: Vec<String> = tree.walk().map(|id| tree.rel_path(id)).collect();
        assert_eq!(paths, ["", "sub", "sub/inner", "top"]);
    }

    #[test]
    fn walk_visits_subdirs_before_files() {
        let tree = sample_tree();
        let kinds: Vec<EntryKind> = tree.walk().map(|id| tree.node(id).kind()).collect();
        assert_eq!(
            kinds,
            [EntryKind::Dir, EntryKind::Dir, EntryKind::File, EntryKind::File]
        );
    }

    #[test]
    fn dir_strong_covers_names_and_content() {
        let base = sample_tree();

        // Same shape and content: same root strong.
        let same = sample_tree();
        assert_eq!(
            base.node(base.root()).strong(),
            same.node(same.root()).strong()
        );

        // Renaming a file changes every strong up to the root.
        let mut renamed = Tree::with_root(dir("root", None));
        let sub = renamed.push(dir("sub", Some(renamed.root())));
        renamed.push(file("other", b"inner content", sub));
        renamed.push(file("top", b"top content", renamed.root()));
        renamed.finalize_dir_strongs();
        assert_ne!(
            base.node(base.root()).strong(),
            renamed.node(renamed.root()).strong()
        );
    }

    #[test]
    fn root_name_does_not_affect_strong() {
        let a = sample_tree();
        let mut b = Tree::with_root(dir("elsewhere", None));
        let sub = b.push(dir("sub", Some(b.root())));
        b.push(file("inner", b"inner content", sub));
        b.push(file("top", b"top content", b.root()));
        b.finalize_dir_strongs();
        assert_eq!(a.node(a.root()).strong(), b.node(b.root()).strong());
    }
}
