use std::{env, path::PathBuf};

use anyhow::{anyhow, Result};
use dirs_next::home_dir;

pub const CACHE_PATH_ENV: &str = "ISORUN_CACHE_PATH";

#[derive(Debug, Clone)]
pub struct CacheLocation {
    pub path: PathBuf,
    pub source: &'static str,
}

/// Default cache directory when none is given on the command line.
pub fn resolve_cache_dir() -> Result<CacheLocation> {
    if let Some(override_path) = env::var_os(CACHE_PATH_ENV) {
        let path = absolutize(PathBuf::from(override_path))?;
        return Ok(CacheLocation {
            path,
            source: CACHE_PATH_ENV,
        });
    }

    #[cfg(target_os = "windows")]
    let (base, source) = resolve_windows_cache_base()?;
    #[cfg(not(target_os = "windows"))]
    let (base, source) = resolve_unix_cache_base()?;

    Ok(CacheLocation {
        path: base.join("isorun"),
        source,
    })
}

#[cfg(not(target_os = "windows"))]
fn resolve_unix_cache_base() -> Result<(PathBuf, &'static str)> {
    if let Some(xdg) = env::var_os("XDG_CACHE_HOME") {
        return Ok((PathBuf::from(xdg), "XDG_CACHE_HOME"));
    }
    let home = home_dir().ok_or_else(|| anyhow!("unable to determine home directory"))?;
    Ok((home.join(".cache"), "~/.cache"))
}

#[cfg(target_os = "windows")]
fn resolve_windows_cache_base() -> Result<(PathBuf, &'static str)> {
    if let Some(local) = env::var_os("LOCALAPPDATA") {
        return Ok((PathBuf::from(local), "LOCALAPPDATA"));
    }
    let home = home_dir().ok_or_else(|| anyhow!("unable to determine home directory"))?;
    Ok((home.join("AppData").join("Local"), "home/AppData/Local"))
}

fn absolutize(path: PathBuf) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(env::current_dir()?.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::{ffi::OsString, fs};

    #[test]
    #[serial]
    fn resolves_cache_path_override() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let override_path = temp.path().join("cache-root");
        fs::create_dir_all(&override_path)?;
        let previous: Option<OsString> = env::var_os(CACHE_PATH_ENV);
        env::set_var(CACHE_PATH_ENV, &override_path);
        let location = resolve_cache_dir()?;
        match previous {
            Some(value) => env::set_var(CACHE_PATH_ENV, value),
            None => env::remove_var(CACHE_PATH_ENV),
        }

        assert_eq!(location.source, CACHE_PATH_ENV);
        assert_eq!(location.path.canonicalize()?, override_path.canonicalize()?);
        Ok(())
    }
}
