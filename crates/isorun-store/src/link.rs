use std::{fs, io, path::Path};

use tracing::trace;

/// Hardlink `from` to `to`, copying when the filesystem refuses the link.
///
/// An existing `to` is an error; content is never overwritten in place.
pub fn hardlink_or_copy(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::symlink_metadata(to).is_ok() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} already exists", to.display()),
        ));
    }
    match fs::hard_link(from, to) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Err(err),
        Err(err) => {
            trace!(%err, from = %from.display(), "hardlink failed, copying");
            fs::copy(from, to)?;
            make_owner_writable(to)
        }
    }
}

// Copies inherit the source mode, which may be read-only.
#[cfg(unix)]
fn make_owner_writable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | 0o600);
    fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn make_owner_writable(path: &Path) -> io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    #[allow(clippy::permissions_set_readonly_false)]
    perms.set_readonly(false);
    fs::set_permissions(path, perms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn links_content_into_nested_destination() {
        let temp = tempfile::tempdir().unwrap();
        let from = temp.path().join("blob");
        fs::write(&from, b"payload").unwrap();
        let to = temp.path().join("a/b/c.txt");

        hardlink_or_copy(&from, &to).unwrap();
        assert_eq!(fs::read(&to).unwrap(), b"payload");
    }

    #[test]
    fn refuses_existing_destination() {
        let temp = tempfile::tempdir().unwrap();
        let from = temp.path().join("blob");
        let to = temp.path().join("taken");
        fs::write(&from, b"new").unwrap();
        fs::write(&to, b"old").unwrap();

        let err = hardlink_or_copy(&from, &to).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(fs::read(&to).unwrap(), b"old");
    }

    #[test]
    fn missing_source_is_an_error() {
        let temp = tempfile::tempdir().unwrap();
        let err = hardlink_or_copy(&temp.path().join("absent"), &temp.path().join("dest"));
        assert!(err.is_err());
    }
}
