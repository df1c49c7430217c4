//! Recursive search over a file listing.

use crate::tree::{FileTree, NodeId};

/// Size constraint of a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SizePred {
    /// No constraint
    #[default]
    Any,
    /// `size <= n`
    AtMost(u64),
    /// `size == n`
    Equal(u64),
    /// `size > n`
    Greater(u64),
}

impl SizePred {
    fn matches(self, size: u64) -> bool {
        match self {
            SizePred::Any => true,
            SizePred::AtMost(n) => size <= n,
            SizePred::Equal(n) => size == n,
            SizePred::Greater(n) => size > n,
        }
    }
}

/// Which node kinds a search may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TypeMask {
    /// Files and directories
    #[default]
    Any,
    /// Files only
    Files,
    /// Directories only
    Dirs,
}

/// A compiled search predicate.
///
/// All string matching is case-insensitive. `and` terms must each match
/// somewhere along the path: a term matched by a directory's name is
/// satisfied for the whole subtree. `not` terms are checked against each
/// node's own name.
#[derive(Debug, Clone, Default)]
pub struct SearchOpts {
    /// Size constraint
    pub size: SizePred,
    /// File-or-directory mask
    pub file_type: TypeMask,
    /// Extension allow-list; empty allows everything
    pub ext: Vec<String>,
    /// Substrings that must all match
    pub and: Vec<String>,
    /// Substrings that must not match
    pub not: Vec<String>,
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

fn ext_of(name: &str) -> Option<&str> {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext),
        _ => None,
    }
}

impl SearchOpts {
    fn type_allows(&self, is_file: bool) -> bool {
        match self.file_type {
            TypeMask::Any => true,
            TypeMask::Files => is_file,
            TypeMask::Dirs => !is_file,
        }
    }

    fn ext_allows(&self, name: &str) -> bool {
        if self.ext.is_empty() {
            return true;
        }
        let Some(ext) = ext_of(name) else {
            return false;
        };
        self.ext.iter().any(|e| e.eq_ignore_ascii_case(ext))
    }
}

/// Depth-first search bounded by `max` results.
///
/// Returns matching node ids in traversal order.
#[must_use]
pub fn search(tree: &FileTree, dir: NodeId, opts: &SearchOpts, max: usize) -> Vec<NodeId> {
    let mut out = Vec::new();
    if max == 0 {
        return out;
    }
    let pending: Vec<&str> = opts.and.iter().map(String::as_str).collect();
    walk(tree, dir, opts, &pending, max, &mut out);
    out
}

fn walk(
    tree: &FileTree,
    id: NodeId,
    opts: &SearchOpts,
    pending_and: &[&str],
    max: usize,
    out: &mut Vec<NodeId>,
) {
    if out.len() >= max {
        return;
    }
    let node = tree.node(id);
    let name = node.name();

    let matches = opts.type_allows(node.is_file())
        && opts.size.matches(node.size())
        && pending_and.iter().all(|t| contains_ci(name, t))
        && !opts.not.iter().any(|t| contains_ci(name, t))
        && opts.ext_allows(name);
    if matches {
        out.push(id);
        if out.len() >= max {
            return;
        }
    }

    if node.is_file() {
        return;
    }
    // Terms this directory's name satisfies are settled for the subtree.
    let remaining: Vec<&str> = pending_and
        .iter()
        .copied()
        .filter(|t| !contains_ci(name, t))
        .collect();
    for &child in node.children() {
        walk(tree, child, opts, &remaining, max, out);
        if out.len() >= max {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> FileTree {
        let mut t = FileTree::new();
        let root = t.root();
        let music = t.create_dir("Music", false).unwrap();
        t.add(root, music).unwrap();
        let live = t.create_dir("Live Sets", false).unwrap();
        t.add(music, live).unwrap();
        for (parent, name, size) in [
            (music, "intro.mp3", 1000u64),
            (music, "cover.jpg", 50),
            (live, "set one.mp3", 9000),
            (live, "set two.flac", 12000),
        ] {
            let f = t.create_file(name, size, None, None).unwrap();
            t.add(parent, f).unwrap();
        }
        t.sort_recursive(root);
        t
    }

    fn names(t: &FileTree, ids: &[NodeId]) -> Vec<String> {
        ids.iter().map(|&i| t.node(i).name().to_string()).collect()
    }

    #[test]
    fn test_empty_predicate_matches_everything() {
        let t = fixture();
        let hits = search(&t, t.root(), &SearchOpts::default(), 100);
        // Root itself matches too: empty name, no constraints.
        assert_eq!(hits.len(), 7);
    }

    #[test]
    fn test_and_terms_elide_along_path() {
        let t = fixture();
        let opts = SearchOpts {
            and: vec!["live".into(), "set".into()],
            file_type: TypeMask::Files,
            ..Default::default()
        };
        // "live" is satisfied by the "Live Sets" directory; the files
        // only need to match "set" themselves.
        let hits = search(&t, t.root(), &opts, 100);
        assert_eq!(names(&t, &hits), ["set one.mp3", "set two.flac"]);
    }

    #[test]
    fn test_not_terms_check_own_name() {
        let t = fixture();
        let opts = SearchOpts {
            and: vec!["set".into()],
            not: vec!["two".into()],
            file_type: TypeMask::Files,
            ..Default::default()
        };
        // "set" is elided under "Live Sets", so every file there would
        // match; the NOT term still knocks out "set two.flac".
        let hits = search(&t, t.root(), &opts, 100);
        assert_eq!(names(&t, &hits), ["set one.mp3"]);
    }

    #[test]
    fn test_extension_list() {
        let t = fixture();
        let opts = SearchOpts {
            ext: vec!["MP3".into()],
            ..Default::default()
        };
        let hits = search(&t, t.root(), &opts, 100);
        assert_eq!(names(&t, &hits), ["intro.mp3", "set one.mp3"]);
    }

    #[test]
    fn test_size_predicates() {
        let t = fixture();
        let opts = SearchOpts {
            size: SizePred::Greater(8000),
            file_type: TypeMask::Files,
            ..Default::default()
        };
        let hits = search(&t, t.root(), &opts, 100);
        assert_eq!(names(&t, &hits), ["set one.mp3", "set two.flac"]);

        let opts = SearchOpts {
            size: SizePred::Equal(50),
            ..Default::default()
        };
        let hits = search(&t, t.root(), &opts, 100);
        assert_eq!(names(&t, &hits), ["cover.jpg"]);
    }

    #[test]
    fn test_result_cap() {
        let t = fixture();
        let opts = SearchOpts {
            file_type: TypeMask::Files,
            ..Default::default()
        };
        let hits = search(&t, t.root(), &opts, 2);
        assert_eq!(hits.len(), 2);
        assert!(search(&t, t.root(), &opts, 0).is_empty());
    }

    #[test]
    fn test_dirs_only() {
        let t = fixture();
        let opts = SearchOpts {
            file_type: TypeMask::Dirs,
            and: vec!["music".into()],
            ..Default::default()
        };
        let hits = search(&t, t.root(), &opts, 100);
        assert_eq!(names(&t, &hits), ["Music"]);
    }
}
