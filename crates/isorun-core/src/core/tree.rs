//! Resolution of an include tree of manifests into one set of settings.
//!
//! Nodes are merged in pre-order: a node's declarations apply only after every
//! node declared before it (earlier siblings and their subtrees, plus its
//! ancestors) has been merged, so the first declaration of a path, command or
//! flag wins. Manifest fetches run at high priority while file content is queued
//! at medium priority as soon as a node merges.

use std::{
    collections::{BTreeMap, HashMap},
    fs,
};

use isorun_domain::{Digest, FileEntry, Manifest};
use isorun_store::{ContentAddressedCache, Priority};
use tracing::{debug, trace};

use crate::core::errors::RunError;

/// The merged view of a manifest tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedSettings {
    pub command: Option<Vec<String>>,
    pub files: BTreeMap<String, FileEntry>,
    pub read_only: bool,
    pub relative_cwd: String,
}

#[derive(Debug)]
struct ManifestNode {
    digest: Digest,
    parent: Option<usize>,
    children: Vec<usize>,
    manifest: Option<Manifest>,
    eligible: bool,
    merged: bool,
}

/// Arena of manifest nodes plus the bookkeeping needed to resume resolution
/// whenever a manifest arrives.
pub struct ManifestTree<'a> {
    cache: &'a mut ContentAddressedCache,
    flavor: &'a str,
    nodes: Vec<ManifestNode>,
    /// Nodes whose manifest content has not arrived yet, by digest.
    waiting: HashMap<Digest, Vec<usize>>,
    /// Parsed manifests by digest, so a digest shared by two branches is
    /// fetched and parsed once.
    loaded: HashMap<Digest, Manifest>,
    /// Unmerged nodes in pre-order, next to merge on top.
    frontier: Vec<usize>,
    command: Option<Vec<String>>,
    files: BTreeMap<String, FileEntry>,
    read_only: Option<bool>,
    relative_cwd: Option<String>,
}

/// Resolve the tree rooted at `root` against `cache`.
pub fn resolve(
    cache: &mut ContentAddressedCache,
    root: &Digest,
    flavor: &str,
) -> Result<ResolvedSettings, RunError> {
    ManifestTree::new(cache, root, flavor).resolve()
}

impl<'a> ManifestTree<'a> {
    pub fn new(cache: &'a mut ContentAddressedCache, root: &Digest, flavor: &'a str) -> Self {
        let mut tree = Self {
            cache,
            flavor,
            nodes: Vec::new(),
            waiting: HashMap::new(),
            loaded: HashMap::new(),
            frontier: Vec::new(),
            command: None,
            files: BTreeMap::new(),
            read_only: None,
            relative_cwd: None,
        };
        let id = tree.add_node(root.clone(), None);
        tree.nodes[id].eligible = true;
        tree.frontier.push(id);
        tree.cache.retrieve(Priority::High, root, None);
        tree.waiting.entry(root.clone()).or_default().push(id);
        tree
    }

    pub fn resolve(mut self) -> Result<ResolvedSettings, RunError> {
        while !self.is_complete() {
            let wanted = self.wanted();
            let digest = self.cache.wait_for(&wanted)?;
            if let Some(nodes) = self.waiting.remove(&digest) {
                let manifest = self.load(&digest)?;
                for node in nodes {
                    self.attach(node, manifest.clone())?;
                }
            }
            self.advance();
        }
        Ok(ResolvedSettings {
            command: self.command,
            files: self.files,
            read_only: self.read_only.unwrap_or(false),
            relative_cwd: self.relative_cwd.unwrap_or_default(),
        })
    }

    fn is_complete(&self) -> bool {
        self.nodes.iter().all(|node| node.eligible && node.merged)
    }

    /// Digests still awaited, in declaration order.
    fn wanted(&self) -> Vec<Digest> {
        let mut wanted: Vec<Digest> = Vec::with_capacity(self.waiting.len());
        for node in &self.nodes {
            if node.manifest.is_none()
                && self.waiting.contains_key(&node.digest)
                && !wanted.contains(&node.digest)
            {
                wanted.push(node.digest.clone());
            }
        }
        wanted
    }

    fn add_node(&mut self, digest: Digest, parent: Option<usize>) -> usize {
        let id = self.nodes.len();
        self.nodes.push(ManifestNode {
            digest: digest.clone(),
            parent,
            children: Vec::new(),
            manifest: None,
            eligible: false,
            merged: false,
        });
        if let Some(parent) = parent {
            self.nodes[parent].children.push(id);
        }
        id
    }

    fn load(&mut self, digest: &Digest) -> Result<Manifest, RunError> {
        if let Some(manifest) = self.loaded.get(digest) {
            return Ok(manifest.clone());
        }
        let path = self.cache.path(digest);
        let bytes = fs::read(&path)
            .map_err(|err| RunError::io(format!("reading manifest {}", path.display()), err))?;
        let manifest = Manifest::parse(&bytes, self.flavor).map_err(|source| RunError::Config {
            digest: digest.clone(),
            source,
        })?;
        debug!(
            %digest,
            files = manifest.files.len(),
            includes = manifest.includes.len(),
            "loaded manifest"
        );
        self.loaded.insert(digest.clone(), manifest.clone());
        Ok(manifest)
    }

    /// Give `node` its manifest and create its children, requesting their
    /// manifests or attaching ones already parsed.
    fn attach(&mut self, node: usize, manifest: Manifest) -> Result<(), RunError> {
        let mut work = vec![(node, manifest)];
        while let Some((node, manifest)) = work.pop() {
            for include in &manifest.includes {
                self.check_cycle(node, include)?;
                let child = self.add_node(include.clone(), Some(node));
                if let Some(loaded) = self.loaded.get(include) {
                    work.push((child, loaded.clone()));
                } else {
                    trace!(digest = %include, parent = %self.nodes[node].digest, "requesting include");
                    self.cache.retrieve(Priority::High, include, None);
                    self.waiting.entry(include.clone()).or_default().push(child);
                }
            }
            self.nodes[node].manifest = Some(manifest);
        }
        Ok(())
    }

    fn check_cycle(&self, node: usize, include: &Digest) -> Result<(), RunError> {
        let mut chain = Vec::new();
        let mut current = Some(node);
        while let Some(id) = current {
            let ancestor = &self.nodes[id];
            chain.push(ancestor.digest.as_str());
            if &ancestor.digest == include {
                chain.reverse();
                chain.push(include.as_str());
                return Err(RunError::Cycle {
                    digest: include.clone(),
                    chain: chain.join(" -> "),
                });
            }
            current = ancestor.parent;
        }
        Ok(())
    }

    /// Merge every node at the top of the frontier whose manifest is present.
    fn advance(&mut self) {
        while let Some(&top) = self.frontier.last() {
            self.nodes[top].eligible = true;
            let Some(manifest) = self.nodes[top].manifest.take() else {
                break;
            };
            self.frontier.pop();
            self.merge(&manifest);
            let node = &mut self.nodes[top];
            node.merged = true;
            self.frontier.extend(node.children.iter().rev().copied());
            node.manifest = Some(manifest);
        }
    }

    fn merge(&mut self, manifest: &Manifest) {
        for (path, entry) in &manifest.files {
            if self.files.contains_key(path) {
                continue;
            }
            if let FileEntry::Content { digest, size, .. } = entry {
                self.cache.retrieve(Priority::Medium, digest, Some(*size));
            }
            self.files.insert(path.clone(), entry.clone());
        }
        if self.command.is_none() {
            self.command.clone_from(&manifest.command);
        }
        if self.read_only.is_none() {
            self.read_only = manifest.read_only;
        }
        if self.relative_cwd.is_none() {
            self.relative_cwd.clone_from(&manifest.relative_cwd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isorun_store::{CachePolicies, ContentFetcher, FileTransport};
    use std::{path::PathBuf, sync::Arc};

    const FLAVOR: &str = "linux";

    struct Remote {
        _temp: tempfile::TempDir,
        dir: PathBuf,
        cache_dir: PathBuf,
    }

    impl Remote {
        fn new() -> Self {
            let temp = tempfile::tempdir().unwrap();
            let dir = temp.path().join("remote");
            let cache_dir = temp.path().join("cache");
            fs::create_dir_all(&dir).unwrap();
            Self {
                _temp: temp,
                dir,
                cache_dir,
            }
        }

        fn put(&self, bytes: &[u8]) -> Digest {
            let digest = Digest::of_bytes(bytes);
            fs::write(self.dir.join(digest.as_str()), bytes).unwrap();
            digest
        }

        fn manifest(&self, value: &serde_json::Value) -> Digest {
            self.put(value.to_string().as_bytes())
        }

        fn cache(&self) -> ContentAddressedCache {
            let fetcher = ContentFetcher::new(Arc::new(FileTransport::new(&self.dir)));
            ContentAddressedCache::open(&self.cache_dir, CachePolicies::unbounded(), fetcher)
                .unwrap()
        }
    }

    fn content(digest: &Digest, size: usize) -> serde_json::Value {
        serde_json::json!({"h": digest.as_str(), "s": size})
    }

    fn resolve_in(remote: &Remote, root: &Digest) -> Result<ResolvedSettings, RunError> {
        let mut cache = remote.cache();
        resolve(&mut cache, root, FLAVOR)
    }

    #[test]
    fn earlier_declaration_wins() {
        let remote = Remote::new();
        let h1 = remote.put(b"one");
        let h2 = remote.put(b"two!");
        let h3 = remote.put(b"three");
        let child = remote.manifest(&serde_json::json!({
            "command": ["child"],
            "files": {"a.txt": content(&h2, 4), "b.txt": content(&h3, 5)},
            "read_only": true,
            "relative_cwd": "sub",
        }));
        let root = remote.manifest(&serde_json::json!({
            "command": ["echo", "hi"],
            "files": {"a.txt": content(&h1, 3)},
            "includes": [child.as_str()],
        }));

        let settings = resolve_in(&remote, &root).unwrap();
        assert_eq!(settings.command, Some(vec!["echo".into(), "hi".into()]));
        assert_eq!(settings.files["a.txt"].digest(), Some(&h1));
        assert_eq!(settings.files["b.txt"].digest(), Some(&h3));
        assert!(settings.read_only);
        assert_eq!(settings.relative_cwd, "sub");
    }

    #[test]
    fn earlier_sibling_subtree_beats_later_sibling() {
        let remote = Remote::new();
        let deep_blob = remote.put(b"deep");
        let late_blob = remote.put(b"late");
        let deep = remote.manifest(&serde_json::json!({
            "files": {"x": content(&deep_blob, 4)},
        }));
        let first = remote.manifest(&serde_json::json!({"includes": [deep.as_str()]}));
        let second = remote.manifest(&serde_json::json!({
            "files": {"x": content(&late_blob, 4), "link": {"l": "x"}},
        }));
        let root = remote.manifest(&serde_json::json!({
            "includes": [first.as_str(), second.as_str()],
        }));

        let settings = resolve_in(&remote, &root).unwrap();
        assert_eq!(settings.files["x"].digest(), Some(&deep_blob));
        assert!(matches!(settings.files["link"], FileEntry::Link { .. }));
        assert_eq!(settings.command, None);
        assert!(!settings.read_only);
    }

    #[test]
    fn self_inclusion_is_a_cycle() {
        let remote = Remote::new();
        // A manifest cannot name its own digest, so close the loop through a
        // pair that was written with each other's digests.
        let a_digest = Digest::parse(&"a".repeat(40)).unwrap();
        let b = remote.manifest(&serde_json::json!({"includes": [a_digest.as_str()]}));
        let a_bytes = serde_json::json!({"includes": [b.as_str()]}).to_string();
        fs::write(remote.dir.join(a_digest.as_str()), a_bytes).unwrap();

        let err = resolve_in(&remote, &a_digest).unwrap_err();
        assert!(matches!(err, RunError::Cycle { ref digest, .. } if digest == &a_digest));
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn diamond_includes_are_legal() {
        let remote = Remote::new();
        let blob = remote.put(b"shared");
        let shared = remote.manifest(&serde_json::json!({"files": {"s": content(&blob, 6)}}));
        let left = remote.manifest(&serde_json::json!({"includes": [shared.as_str()]}));
        let right = remote.manifest(&serde_json::json!({
            "includes": [shared.as_str()],
            "command": ["right"],
        }));
        let root = remote.manifest(&serde_json::json!({
            "includes": [left.as_str(), right.as_str()],
        }));

        let settings = resolve_in(&remote, &root).unwrap();
        assert_eq!(settings.files.len(), 1);
        assert_eq!(settings.command, Some(vec!["right".to_string()]));
    }

    #[test]
    fn invalid_manifest_is_a_config_error() {
        let remote = Remote::new();
        let child = remote.manifest(&serde_json::json!({"bogus": 1}));
        let root = remote.manifest(&serde_json::json!({"includes": [child.as_str()]}));

        let err = resolve_in(&remote, &root).unwrap_err();
        assert!(matches!(err, RunError::Config { ref digest, .. } if digest == &child));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn missing_include_is_a_fetch_error() {
        let remote = Remote::new();
        let absent = Digest::of_bytes(b"never uploaded");
        let root = remote.manifest(&serde_json::json!({"includes": [absent.as_str()]}));

        let err = resolve_in(&remote, &root).unwrap_err();
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn file_content_is_queued_while_resolving() {
        let remote = Remote::new();
        let blob = remote.put(b"payload");
        let root = remote.manifest(&serde_json::json!({
            "command": ["true"],
            "files": {"dir/p": content(&blob, 7)},
        }));
        let mut cache = remote.cache();
        resolve(&mut cache, &root, FLAVOR).unwrap();
        assert!(cache.is_pending(&blob) || cache.contains(&blob));
        assert_eq!(cache.wait_for(&[blob.clone()]).unwrap(), blob);
        assert!(cache.path(&blob).exists());
    }
}
