//! Bidirectional mapping between plugin ids and their source trees.
//!
//! Every registered plugin owns a tree root (the directory holding its
//! entry point). A change anywhere under that root resolves to the plugin;
//! when trees nest, the deepest root wins.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};

use super::PluginId;
use super::error::ReloadError;

/// Paths recorded for one registered plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredPlugin {
    /// Canonical entry point as registered.
    pub entry: PathBuf,
    /// Directory whose whole subtree belongs to the plugin.
    pub root: PathBuf,
}

/// Plugin id to path index with a reverse lookup from any path.
///
/// `plugin_paths` and `reverse_paths` are only mutated together through
/// [`register`](Self::register) and [`deregister`](Self::deregister).
#[derive(Debug)]
pub struct PathIndex {
    plugin_paths: BTreeMap<PluginId, RegisteredPlugin>,
    /// Entry paths and tree roots, each pointing at its owner.
    reverse_paths: BTreeMap<PathBuf, PluginId>,
    allow_nested: bool,
}

impl Default for PathIndex {
    fn default() -> Self {
        Self::new(true)
    }
}

impl PathIndex {
    pub fn new(allow_nested: bool) -> Self {
        Self {
            plugin_paths: BTreeMap::new(),
            reverse_paths: BTreeMap::new(),
            allow_nested,
        }
    }

    /// Insert or replace the mapping for `id`.
    ///
    /// Fails with `DuplicatePath` when the entry path or tree root is owned
    /// by another plugin, or, with nesting disabled, when the tree overlaps
    /// another plugin's tree. A failed call leaves the index untouched.
    pub fn register(&mut self, id: PluginId, path: &Path) -> Result<&RegisteredPlugin, ReloadError> {
        let entry = canonicalize_lossy(path);
        let root = tree_root(&entry);

        for key in [&entry, &root] {
            if let Some(owner) = self.reverse_paths.get(key) {
                if *owner != id {
                    return Err(ReloadError::DuplicatePath {
                        path: key.clone(),
                        existing: owner.clone(),
                        requested: id,
                    });
                }
            }
        }

        if !self.allow_nested {
            let overlapping = self.plugin_paths.iter().find(|(other, plugin)| {
                **other != id && (plugin.root.starts_with(&root) || root.starts_with(&plugin.root))
            });
            if let Some((other, _)) = overlapping {
                return Err(ReloadError::DuplicatePath {
                    path: root,
                    existing: other.clone(),
                    requested: id,
                });
            }
        }

        self.remove_reverse(&id);
        self.reverse_paths.insert(entry.clone(), id.clone());
        self.reverse_paths.insert(root.clone(), id.clone());

        crate::debug_event!("index", "registered", "{id} -> {}", root.display());

        self.plugin_paths.insert(id.clone(), RegisteredPlugin { entry, root });
        Ok(&self.plugin_paths[&id])
    }

    /// Remove `id` and every reverse entry pointing at it.
    ///
    /// Unknown ids are a no-op.
    pub fn deregister(&mut self, id: &PluginId) -> Option<RegisteredPlugin> {
        self.remove_reverse(id);
        let removed = self.plugin_paths.remove(id)?;
        crate::debug_event!("index", "deregistered", "{id}");
        Some(removed)
    }

    fn remove_reverse(&mut self, id: &PluginId) {
        if let Some(previous) = self.plugin_paths.get(id) {
            self.reverse_paths.remove(&previous.entry);
            self.reverse_paths.remove(&previous.root);
        }
    }

    /// Owner of the most specific tracked tree containing `path`.
    ///
    /// Matching is per path component, so `/plugins/p1` never claims
    /// `/plugins/p10/x`.
    pub fn resolve(&self, path: &Path) -> Option<&PluginId> {
        path.ancestors()
            .find_map(|ancestor| self.reverse_paths.get(ancestor))
    }

    pub fn get(&self, id: &PluginId) -> Option<&RegisteredPlugin> {
        self.plugin_paths.get(id)
    }

    /// Registered entry point for `id`.
    pub fn entry_path(&self, id: &PluginId) -> Option<&Path> {
        self.plugin_paths.get(id).map(|plugin| plugin.entry.as_path())
    }

    pub fn contains(&self, id: &PluginId) -> bool {
        self.plugin_paths.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.plugin_paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugin_paths.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PluginId, &RegisteredPlugin)> {
        self.plugin_paths.iter()
    }

    /// Minimal set of directories to watch recursively.
    ///
    /// Roots nested under another root are already covered and left out.
    pub fn watch_dirs(&self) -> BTreeSet<PathBuf> {
        let roots: BTreeSet<&PathBuf> = self.plugin_paths.values().map(|p| &p.root).collect();
        let mut dirs: BTreeSet<PathBuf> = BTreeSet::new();

        // BTreeSet order puts an ancestor before its descendants
        for root in roots {
            if !dirs.iter().any(|dir| root.starts_with(dir)) {
                dirs.insert(root.clone());
            }
        }

        dirs
    }
}

/// Directory whose subtree belongs to a plugin registered at `entry`.
fn tree_root(entry: &Path) -> PathBuf {
    if entry.is_dir() {
        return entry.to_path_buf();
    }
    match entry.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => entry.to_path_buf(),
    }
}

/// Canonical form of `path`, tolerating paths that do not exist (yet).
///
/// The deepest existing ancestor is canonicalized and the remainder is
/// appended after lexical normalization.
pub fn canonicalize_lossy(path: &Path) -> PathBuf {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return canonical;
    }

    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    let normalized = normalize_lexically(&absolute);

    for ancestor in normalized.ancestors().skip(1) {
        if let Ok(canonical) = std::fs::canonicalize(ancestor) {
            if let Ok(rest) = normalized.strip_prefix(ancestor) {
                return canonical.join(rest);
            }
        }
    }

    normalized
}

/// Drop `.` components and fold `..` without touching the filesystem.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(normalized.components().next_back(), Some(Component::Normal(_))) {
                    normalized.pop();
                } else if !normalized.has_root() {
                    normalized.push("..");
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}
