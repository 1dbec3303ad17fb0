//! Interned tree paths with a depth-first total order
//!
//! Every path that enters the engine is interned behind a single
//! process-wide table, so handle equality is string equality and maps keyed
//! by path hash a pointer instead of a string. The ordering compares
//! component vectors elementwise, which places a parent directory
//! immediately before its children and never consults platform collation.
//!
//! Paths come in two flavors sharing one table: rooted (`/a/b`, the storage
//! side) and un-rooted (`a/b`, used for hard link targets inside a tar).

use crate::collections::HashMap;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

/// One interned path
///
/// Cheap to clone (an `Arc` handle). Two `TreePath` values are equal iff
/// they came from the same table slot, which the interner guarantees iff
/// their canonical texts are equal.
#[derive(Clone)]
pub struct TreePath(Arc<PathData>);

struct PathData {
    /// Canonical text: `/` for the root, `/a/b` rooted, `a/b` un-rooted
    text: String,
    /// Path components, empty for the root
    components: Vec<String>,
    /// Leading separator present
    rooted: bool,
}

fn intern_table() -> &'static RwLock<HashMap<String, TreePath>> {
    static TABLE: OnceLock<RwLock<HashMap<String, TreePath>>> = OnceLock::new();
    TABLE.get_or_init(|| RwLock::new(HashMap::new()))
}

fn canonical(components: &[String], rooted: bool) -> String {
    if components.is_empty() {
        return if rooted { "/".to_string() } else { String::new() };
    }
    let joined = components.join("/");
    if rooted {
        format!("/{}", joined)
    } else {
        joined
    }
}

impl TreePath {
    /// Look up (interning if necessary) the path for `text`
    ///
    /// Repeated separators and trailing separators are collapsed; `/a//b/`
    /// and `/a/b` intern to the same handle.
    pub fn lookup(text: &str) -> TreePath {
        let rooted = text.starts_with('/');
        let components: Vec<String> = text
            .split('/')
            .filter(|c| !c.is_empty())
            .map(|c| c.to_string())
            .collect();
        Self::intern(components, rooted)
    }

    /// The rooted root path `/`
    pub fn root() -> TreePath {
        Self::intern(Vec::new(), true)
    }

    fn intern(components: Vec<String>, rooted: bool) -> TreePath {
        let text = canonical(&components, rooted);
        {
            let table = intern_table().read();
            if let Some(p) = table.get(&text) {
                return p.clone();
            }
        }
        let mut table = intern_table().write();
        if let Some(p) = table.get(&text) {
            return p.clone();
        }
        let path = TreePath(Arc::new(PathData {
            text: text.clone(),
            components,
            rooted,
        }));
        table.insert(text, path.clone());
        path
    }

    /// Canonical text of this path
    pub fn as_str(&self) -> &str {
        &self.0.text
    }

    /// Path components, root has none
    pub fn components(&self) -> &[String] {
        &self.0.components
    }

    /// Number of components
    pub fn depth(&self) -> usize {
        self.0.components.len()
    }

    /// Last component, empty string for the root
    pub fn name(&self) -> &str {
        self.0.components.last().map(|s| s.as_str()).unwrap_or("")
    }

    /// True for the (rooted or un-rooted) empty path
    pub fn is_root(&self) -> bool {
        self.0.components.is_empty()
    }

    /// True when the canonical text carries a leading separator
    pub fn is_rooted(&self) -> bool {
        self.0.rooted
    }

    /// Parent path, `None` at the root
    pub fn parent(&self) -> Option<TreePath> {
        if self.0.components.is_empty() {
            return None;
        }
        let components = self.0.components[..self.0.components.len() - 1].to_vec();
        Some(Self::intern(components, self.0.rooted))
    }

    /// Append one component
    pub fn join(&self, name: &str) -> TreePath {
        let mut components = self.0.components.clone();
        components.push(name.to_string());
        Self::intern(components, self.0.rooted)
    }

    /// Concatenate `root`'s components before this path's components
    ///
    /// The result inherits `root`'s rootedness.
    pub fn prepend(&self, root: &TreePath) -> TreePath {
        let mut components = root.0.components.clone();
        components.extend(self.0.components.iter().cloned());
        Self::intern(components, root.0.rooted)
    }

    /// Strip the leading separator
    pub fn un_root(&self) -> TreePath {
        if !self.0.rooted {
            return self.clone();
        }
        Self::intern(self.0.components.clone(), false)
    }

    /// Drop the first `depth` components and root the remainder
    pub fn sub_path(&self, depth: usize) -> TreePath {
        let components = self.0.components.get(depth..).unwrap_or(&[]).to_vec();
        Self::intern(components, true)
    }

    /// True iff `self` equals `other` or lies below it
    pub fn is_below_or_equal(&self, other: &TreePath) -> bool {
        self.0.components.len() >= other.0.components.len()
            && self.0.components[..other.0.components.len()] == other.0.components[..]
    }
}

impl PartialEq for TreePath {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for TreePath {}

impl Hash for TreePath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state);
    }
}

impl Ord for TreePath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .components
            .cmp(&other.0.components)
            .then(self.0.rooted.cmp(&other.0.rooted))
    }
}

impl PartialOrd for TreePath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TreePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.text)
    }
}

impl fmt::Debug for TreePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TreePath({})", self.0.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_gives_handle_equality() {
        let a = TreePath::lookup("/a/b");
        let b = TreePath::lookup("/a//b/");
        assert_eq!(a, b);
        assert!(Arc::ptr_eq(&a.0, &b.0));
    }

    #[test]
    fn test_rooted_and_unrooted_are_distinct() {
        let rooted = TreePath::lookup("/a/b");
        let bare = TreePath::lookup("a/b");
        assert_ne!(rooted, bare);
        assert_eq!(rooted.un_root(), bare);
        assert_eq!(bare.as_str(), "a/b");
    }

    #[test]
    fn test_parent_and_name() {
        let p = TreePath::lookup("/a/b/c");
        assert_eq!(p.name(), "c");
        assert_eq!(p.parent().unwrap().as_str(), "/a/b");
        assert_eq!(TreePath::root().parent(), None);
        assert_eq!(TreePath::root().as_str(), "/");
    }

    #[test]
    fn test_depth_first_order() {
        let root = TreePath::root();
        let a = TreePath::lookup("/a");
        let ab = TreePath::lookup("/a/b");
        let ac = TreePath::lookup("/a/c");
        let b = TreePath::lookup("/ab");
        // Parent precedes children, children precede the lexicographic
        // successor of the parent.
        let mut v = vec![b.clone(), ac.clone(), root.clone(), ab.clone(), a.clone()];
        v.sort();
        assert_eq!(v, vec![root, a, ab, ac, b]);
    }

    #[test]
    fn test_prepend_and_sub_path() {
        let origin = TreePath::lookup("/home/user/tree");
        let rel = TreePath::lookup("docs/x.txt").prepend(&origin);
        assert_eq!(rel.as_str(), "/home/user/tree/docs/x.txt");
        assert_eq!(rel.sub_path(origin.depth()).as_str(), "/docs/x.txt");
    }

    #[test]
    fn test_is_below_or_equal() {
        let a = TreePath::lookup("/a");
        let ab = TreePath::lookup("/a/b");
        assert!(ab.is_below_or_equal(&a));
        assert!(a.is_below_or_equal(&a));
        assert!(!a.is_below_or_equal(&ab));
    }
}
