use std::{
    collections::HashMap,
    env, fs, io,
    path::{Component, Path, PathBuf},
    time::{Duration, Instant},
};

use isorun_domain::{Digest, FileEntry};
use isorun_store::{hardlink_or_copy, ContentAddressedCache};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::core::{errors::RunError, tree::ResolvedSettings};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(30);

/// Scratch directory holding a materialized tree. Dropping it restores write
/// permission and removes the tree.
pub(crate) struct Sandbox {
    dir: Option<TempDir>,
}

impl Sandbox {
    /// Create a sandbox on the same filesystem as `cache_dir` so cached content
    /// can be hardlinked into it.
    pub(crate) fn create(cache_dir: &Path) -> Result<Self, RunError> {
        let parent = sandbox_parent(cache_dir);
        let dir = tempfile::Builder::new()
            .prefix("isorun")
            .tempdir_in(&parent)
            .map_err(|err| {
                RunError::io(format!("creating sandbox under {}", parent.display()), err)
            })?;
        debug!(sandbox = %dir.path().display(), "created sandbox");
        Ok(Self { dir: Some(dir) })
    }

    pub(crate) fn root(&self) -> &Path {
        self.dir.as_ref().map_or_else(|| Path::new(""), TempDir::path)
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        let root = dir.path().to_path_buf();
        make_writable_recursive(&root);
        match dir.close() {
            Ok(()) => debug!(sandbox = %root.display(), "removed sandbox"),
            Err(err) => warn!(%err, sandbox = %root.display(), "failed to remove sandbox"),
        }
    }
}

fn sandbox_parent(cache_dir: &Path) -> PathBuf {
    let temp = env::temp_dir();
    if same_filesystem(&temp, cache_dir) {
        return temp;
    }
    cache_dir
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map_or_else(|| cache_dir.to_path_buf(), Path::to_path_buf)
}

#[cfg(unix)]
fn same_filesystem(a: &Path, b: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (fs::metadata(a), fs::metadata(b)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_filesystem(a: &Path, b: &Path) -> bool {
    a.components().next() == b.components().next()
}

/// Lay out every entry of `settings` under `root`: directories, then links,
/// then cached content as it becomes available.
pub(crate) fn materialize(
    cache: &mut ContentAddressedCache,
    settings: &ResolvedSettings,
    root: &Path,
) -> Result<(), RunError> {
    let mut by_digest: HashMap<Digest, Vec<(PathBuf, Option<u32>)>> = HashMap::new();
    let mut remaining: Vec<Digest> = Vec::new();
    let mut links = Vec::new();
    for (relative, entry) in &settings.files {
        let dest = sandbox_path(root, relative)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|err| RunError::mapping(parent, err))?;
        }
        match entry {
            FileEntry::Link { target, .. } => links.push((dest, target)),
            FileEntry::Content { digest, mode, .. } => {
                let slots = by_digest.entry(digest.clone()).or_default();
                if slots.is_empty() {
                    remaining.push(digest.clone());
                }
                slots.push((dest, *mode));
            }
        }
    }

    for (dest, target) in links {
        symlink(target, &dest).map_err(|err| RunError::mapping(&dest, err))?;
    }

    let total = remaining.len();
    let mut last_report = Instant::now();
    while !remaining.is_empty() {
        let digest = cache.wait_for(&remaining)?;
        remaining.retain(|pending| pending != &digest);
        let source = cache.path(&digest);
        for (dest, mode) in by_digest.remove(&digest).unwrap_or_default() {
            hardlink_or_copy(&source, &dest).map_err(|err| RunError::mapping(&dest, err))?;
            if let Some(mode) = mode {
                set_mode(&dest, mode).map_err(|err| RunError::mapping(&dest, err))?;
            }
        }
        if last_report.elapsed() >= PROGRESS_INTERVAL {
            info!(remaining = remaining.len(), total, "waiting for files");
            last_report = Instant::now();
        }
    }
    Ok(())
}

/// Join a manifest path onto `root`, refusing anything that would escape it.
pub(crate) fn sandbox_path(root: &Path, relative: &str) -> Result<PathBuf, RunError> {
    let path = Path::new(relative);
    let escapes = path
        .components()
        .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir));
    if relative.is_empty() || escapes {
        return Err(RunError::mapping(relative, "path must stay inside the sandbox"));
    }
    Ok(root.join(path))
}

#[cfg(unix)]
fn symlink(target: &str, dest: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, dest)
}

#[cfg(not(unix))]
fn symlink(_target: &str, _dest: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "symlinks are not supported on this platform",
    ))
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
}

#[cfg(not(unix))]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(mode & 0o200 == 0);
    fs::set_permissions(path, perms)
}

/// Strip write permission from every file and directory under `root`.
pub(crate) fn make_read_only_recursive(root: &Path) -> Result<(), RunError> {
    walk(root, &mut |path, _is_dir| {
        let mut perms = fs::symlink_metadata(path)?.permissions();
        strip_write(&mut perms);
        fs::set_permissions(path, perms)
    })
    .map_err(|err| RunError::io(format!("making {} read-only", root.display()), err))
}

fn make_writable_recursive(root: &Path) {
    let result = walk(root, &mut |path, is_dir| {
        let mut perms = fs::symlink_metadata(path)?.permissions();
        add_owner_write(&mut perms, is_dir);
        fs::set_permissions(path, perms)
    });
    if let Err(err) = result {
        warn!(%err, sandbox = %root.display(), "failed to restore write permission");
    }
}

/// Post-order walk that does not follow symlinks. Directories keep their read
/// and search bits throughout, so listing never depends on the visit order.
fn walk(path: &Path, visit: &mut dyn FnMut(&Path, bool) -> io::Result<()>) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.file_type().is_symlink() {
        return Ok(());
    }
    if meta.is_dir() {
        for entry in fs::read_dir(path)? {
            walk(&entry?.path(), visit)?;
        }
    }
    visit(path, meta.is_dir())
}

#[cfg(unix)]
fn strip_write(perms: &mut fs::Permissions) {
    use std::os::unix::fs::PermissionsExt;
    perms.set_mode(perms.mode() & !0o222);
}

#[cfg(not(unix))]
fn strip_write(perms: &mut fs::Permissions) {
    perms.set_readonly(true);
}

#[cfg(unix)]
fn add_owner_write(perms: &mut fs::Permissions, is_dir: bool) {
    use std::os::unix::fs::PermissionsExt;
    let extra = if is_dir { 0o700 } else { 0o200 };
    perms.set_mode(perms.mode() | extra);
}

#[cfg(not(unix))]
fn add_owner_write(perms: &mut fs::Permissions, _is_dir: bool) {
    #[allow(clippy::permissions_set_readonly_false)]
    perms.set_readonly(false);
}

#[cfg(test)]
mod tests {
    use super::*;
    use isorun_store::{CachePolicies, ContentFetcher, FileTransport};
    use std::{collections::BTreeMap, sync::Arc};

    fn cache_with(remote: &Path, cache_dir: &Path) -> ContentAddressedCache {
        let fetcher = ContentFetcher::new(Arc::new(FileTransport::new(remote)));
        ContentAddressedCache::open(cache_dir, CachePolicies::unbounded(), fetcher).unwrap()
    }

    fn put(remote: &Path, bytes: &[u8]) -> Digest {
        let digest = Digest::of_bytes(bytes);
        fs::create_dir_all(remote).unwrap();
        fs::write(remote.join(digest.as_str()), bytes).unwrap();
        digest
    }

    fn settings(files: Vec<(&str, FileEntry)>) -> ResolvedSettings {
        ResolvedSettings {
            files: files
                .into_iter()
                .map(|(path, entry)| (path.to_string(), entry))
                .collect::<BTreeMap<_, _>>(),
            ..ResolvedSettings::default()
        }
    }

    #[test]
    fn materializes_content_and_links() {
        let temp = tempfile::tempdir().unwrap();
        let remote = temp.path().join("remote");
        let blob = put(&remote, b"hello");
        let mut cache = cache_with(&remote, &temp.path().join("cache"));
        cache.retrieve(isorun_store::Priority::Medium, &blob, Some(5));

        let sandbox = Sandbox::create(cache.dir()).unwrap();
        let root = sandbox.root().to_path_buf();
        let content = FileEntry::Content {
            digest: blob.clone(),
            size: 5,
            mode: Some(0o750),
        };
        let resolved = settings(vec![
            ("a/b/hello.txt", content.clone()),
            ("copy.txt", content),
            (
                "a/link",
                FileEntry::Link {
                    target: "b/hello.txt".to_string(),
                    mode: None,
                },
            ),
        ]);
        materialize(&mut cache, &resolved, &root).unwrap();

        assert_eq!(fs::read(root.join("a/b/hello.txt")).unwrap(), b"hello");
        assert_eq!(fs::read(root.join("copy.txt")).unwrap(), b"hello");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert_eq!(fs::read(root.join("a/link")).unwrap(), b"hello");
            let mode = fs::metadata(root.join("copy.txt")).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o750);
        }

        make_read_only_recursive(&root).unwrap();
        assert!(fs::metadata(root.join("a/b/hello.txt"))
            .unwrap()
            .permissions()
            .readonly());
        drop(sandbox);
        assert!(!root.exists());
    }

    #[test]
    fn existing_destination_is_a_mapping_error() {
        let temp = tempfile::tempdir().unwrap();
        let remote = temp.path().join("remote");
        let blob = put(&remote, b"x");
        let mut cache = cache_with(&remote, &temp.path().join("cache"));
        cache.retrieve(isorun_store::Priority::Medium, &blob, Some(1));

        let sandbox = Sandbox::create(cache.dir()).unwrap();
        fs::write(sandbox.root().join("taken"), b"already here").unwrap();
        let resolved = settings(vec![(
            "taken",
            FileEntry::Content {
                digest: blob,
                size: 1,
                mode: None,
            },
        )]);
        let err = materialize(&mut cache, &resolved, sandbox.root()).unwrap_err();
        assert_eq!(err.exit_code(), 5);
    }

    #[test]
    fn escaping_paths_are_rejected() {
        let root = Path::new("/sandbox");
        assert!(sandbox_path(root, "../etc/passwd").is_err());
        assert!(sandbox_path(root, "/etc/passwd").is_err());
        assert!(sandbox_path(root, "").is_err());
        assert_eq!(
            sandbox_path(root, "a/./b").unwrap(),
            Path::new("/sandbox/a/./b")
        );
    }

    #[test]
    fn sandbox_lands_next_to_cache_or_in_temp() {
        let temp = tempfile::tempdir().unwrap();
        let cache_dir = temp.path().join("cache");
        fs::create_dir_all(&cache_dir).unwrap();
        let parent = sandbox_parent(&cache_dir);
        assert!(parent == env::temp_dir() || parent == temp.path());
    }
}
