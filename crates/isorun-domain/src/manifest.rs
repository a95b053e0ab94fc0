//! Manifest schema: a command, a file set, and included child manifests.
//!
//! Parsing is strict: every key is checked against the schema and anything
//! unrecognized is rejected.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::digest::Digest;

/// Errors raised while validating a manifest payload.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("[IR200] failed to parse manifest: {snippet}...")]
    Parse { snippet: String },
    #[error("[IR201] expected {expected} for `{field}`, got {found}")]
    Type {
        field: String,
        expected: &'static str,
        found: String,
    },
    #[error("[IR201] `{0}` must not be empty")]
    Empty(&'static str),
    #[error("[IR201] expected a 40 character hex digest for `{field}`, got {value}")]
    InvalidDigest { field: String, value: String },
    #[error("[IR202] unknown manifest key `{0}`")]
    UnknownKey(String),
    #[error("[IR202] unknown key `{key}` in file entry `{path}`")]
    UnknownFileKey { path: String, key: String },
    #[error("[IR203] file entry `{path}` must declare exactly one of `l` or `h`")]
    AmbiguousEntry { path: String },
    #[error("[IR203] file entry `{path}` declares a digest without a size")]
    MissingSize { path: String },
    #[error("[IR203] file entry `{path}` declares a size without a digest")]
    MissingDigest { path: String },
    #[error("[IR204] manifest targets os `{found}` but this platform is `{expected}`")]
    WrongOs { expected: String, found: String },
}

/// One entry of the `files` map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEntry {
    Link {
        target: String,
        mode: Option<u32>,
    },
    Content {
        digest: Digest,
        size: u64,
        mode: Option<u32>,
    },
}

impl FileEntry {
    pub fn mode(&self) -> Option<u32> {
        match self {
            Self::Link { mode, .. } | Self::Content { mode, .. } => *mode,
        }
    }

    pub fn digest(&self) -> Option<&Digest> {
        match self {
            Self::Content { digest, .. } => Some(digest),
            Self::Link { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub command: Option<Vec<String>>,
    pub files: BTreeMap<String, FileEntry>,
    pub includes: Vec<Digest>,
    pub read_only: Option<bool>,
    pub relative_cwd: Option<String>,
    pub os: Option<String>,
}

impl Manifest {
    /// Parse and validate a manifest payload for the platform named by `flavor`.
    pub fn parse(content: &[u8], flavor: &str) -> Result<Self, ConfigError> {
        let value: Value = serde_json::from_slice(content).map_err(|_| ConfigError::Parse {
            snippet: String::from_utf8_lossy(&content[..content.len().min(100)]).into_owned(),
        })?;
        let map = match value {
            Value::Object(map) => map,
            other => return Err(type_error("<root>", "object", &other)),
        };

        let mut manifest = Self::default();
        for (key, value) in map {
            match key.as_str() {
                "command" => manifest.command = Some(parse_command(&value)?),
                "files" => manifest.files = parse_files(&value)?,
                "includes" => manifest.includes = parse_includes(&value)?,
                "read_only" => {
                    manifest.read_only =
                        Some(value.as_bool().ok_or_else(|| type_error("read_only", "bool", &value))?);
                }
                "relative_cwd" => {
                    manifest.relative_cwd = Some(
                        value
                            .as_str()
                            .ok_or_else(|| type_error("relative_cwd", "string", &value))?
                            .to_string(),
                    );
                }
                "os" => {
                    let found = value
                        .as_str()
                        .ok_or_else(|| type_error("os", "string", &value))?;
                    if found != flavor {
                        return Err(ConfigError::WrongOs {
                            expected: flavor.to_string(),
                            found: found.to_string(),
                        });
                    }
                    manifest.os = Some(found.to_string());
                }
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }
        Ok(manifest)
    }
}

/// The os tag this build resolves manifests for.
pub fn platform_flavor() -> &'static str {
    if cfg!(windows) {
        "win"
    } else if cfg!(target_os = "macos") {
        "mac"
    } else if cfg!(target_os = "solaris") {
        "solaris"
    } else if cfg!(target_os = "freebsd") {
        "freebsd"
    } else {
        "linux"
    }
}

fn type_error(field: &str, expected: &'static str, found: &Value) -> ConfigError {
    ConfigError::Type {
        field: field.to_string(),
        expected,
        found: found.to_string(),
    }
}

fn parse_command(value: &Value) -> Result<Vec<String>, ConfigError> {
    let items = value
        .as_array()
        .ok_or_else(|| type_error("command", "list", value))?;
    if items.is_empty() {
        return Err(ConfigError::Empty("command"));
    }
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(ToOwned::to_owned)
                .ok_or_else(|| type_error("command", "string", item))
        })
        .collect()
}

fn parse_includes(value: &Value) -> Result<Vec<Digest>, ConfigError> {
    let items = value
        .as_array()
        .ok_or_else(|| type_error("includes", "list", value))?;
    if items.is_empty() {
        return Err(ConfigError::Empty("includes"));
    }
    items.iter().map(|item| parse_digest("includes", item)).collect()
}

fn parse_digest(field: &str, value: &Value) -> Result<Digest, ConfigError> {
    value
        .as_str()
        .and_then(|raw| Digest::parse(raw).ok())
        .ok_or_else(|| ConfigError::InvalidDigest {
            field: field.to_string(),
            value: value.to_string(),
        })
}

fn parse_files(value: &Value) -> Result<BTreeMap<String, FileEntry>, ConfigError> {
    let entries = value
        .as_object()
        .ok_or_else(|| type_error("files", "object", value))?;
    let mut files = BTreeMap::new();
    for (path, props) in entries {
        let props = props
            .as_object()
            .ok_or_else(|| type_error(path, "object", props))?;
        files.insert(path.clone(), parse_file_entry(path, props)?);
    }
    Ok(files)
}

fn parse_file_entry(path: &str, props: &Map<String, Value>) -> Result<FileEntry, ConfigError> {
    let mut link = None;
    let mut digest = None;
    let mut size = None;
    let mut mode = None;
    for (key, value) in props {
        let field = format!("{path}.{key}");
        match key.as_str() {
            "l" => {
                link = Some(
                    value
                        .as_str()
                        .ok_or_else(|| type_error(&field, "string", value))?
                        .to_string(),
                );
            }
            "h" => digest = Some(parse_digest(&field, value)?),
            "s" => size = Some(value.as_u64().ok_or_else(|| type_error(&field, "int", value))?),
            "m" => {
                let raw = value.as_u64().ok_or_else(|| type_error(&field, "int", value))?;
                mode = Some(u32::try_from(raw).map_err(|_| type_error(&field, "mode", value))?);
            }
            _ => {
                return Err(ConfigError::UnknownFileKey {
                    path: path.to_string(),
                    key: key.clone(),
                })
            }
        }
    }

    match (link, digest, size) {
        (Some(target), None, None) => Ok(FileEntry::Link { target, mode }),
        (None, Some(digest), Some(size)) => Ok(FileEntry::Content { digest, size, mode }),
        (None, Some(_), None) => Err(ConfigError::MissingSize {
            path: path.to_string(),
        }),
        (None, None, Some(_)) => Err(ConfigError::MissingDigest {
            path: path.to_string(),
        }),
        _ => Err(ConfigError::AmbiguousEntry {
            path: path.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const H1: &str = "1111111111111111111111111111111111111111";
    const H2: &str = "2222222222222222222222222222222222222222";

    fn parse(raw: &str) -> Result<Manifest, ConfigError> {
        Manifest::parse(raw.as_bytes(), "linux")
    }

    #[test]
    fn parses_full_manifest() {
        let raw = format!(
            r#"{{
                "command": ["python", "run.py"],
                "files": {{
                    "run.py": {{"h": "{H1}", "s": 12, "m": 493}},
                    "link": {{"l": "run.py"}}
                }},
                "includes": ["{H2}"],
                "read_only": true,
                "relative_cwd": "out",
                "os": "linux"
            }}"#
        );
        let manifest = parse(&raw).expect("manifest");
        assert_eq!(
            manifest.command,
            Some(vec!["python".to_string(), "run.py".to_string()])
        );
        assert_eq!(
            manifest.files["run.py"],
            FileEntry::Content {
                digest: Digest::parse(H1).unwrap(),
                size: 12,
                mode: Some(0o755),
            }
        );
        assert_eq!(
            manifest.files["link"],
            FileEntry::Link {
                target: "run.py".into(),
                mode: None,
            }
        );
        assert_eq!(manifest.includes, vec![Digest::parse(H2).unwrap()]);
        assert_eq!(manifest.read_only, Some(true));
        assert_eq!(manifest.relative_cwd.as_deref(), Some("out"));
    }

    #[test]
    fn empty_object_is_a_valid_manifest() {
        let manifest = parse("{}").expect("manifest");
        assert!(manifest.command.is_none());
        assert!(manifest.files.is_empty());
        assert!(manifest.includes.is_empty());
    }

    #[test]
    fn rejects_non_json_and_non_object() {
        assert!(matches!(parse("not json"), Err(ConfigError::Parse { .. })));
        assert!(matches!(parse("[1, 2]"), Err(ConfigError::Type { .. })));
    }

    #[test]
    fn rejects_empty_or_non_string_commands() {
        assert_eq!(parse(r#"{"command": []}"#), Err(ConfigError::Empty("command")));
        assert!(matches!(
            parse(r#"{"command": ["ok", 3]}"#),
            Err(ConfigError::Type { .. })
        ));
        assert!(matches!(
            parse(r#"{"command": "echo hi"}"#),
            Err(ConfigError::Type { .. })
        ));
    }

    #[test]
    fn rejects_empty_includes_and_bad_digests() {
        assert_eq!(parse(r#"{"includes": []}"#), Err(ConfigError::Empty("includes")));
        assert!(matches!(
            parse(r#"{"includes": ["abc"]}"#),
            Err(ConfigError::InvalidDigest { .. })
        ));
    }

    #[test]
    fn rejects_unknown_keys() {
        assert_eq!(
            parse(r#"{"surprise": 1}"#),
            Err(ConfigError::UnknownKey("surprise".into()))
        );
        let raw = format!(r#"{{"files": {{"a": {{"h": "{H1}", "s": 1, "x": 0}}}}}}"#);
        assert!(matches!(
            parse(&raw),
            Err(ConfigError::UnknownFileKey { ref key, .. }) if key == "x"
        ));
    }

    #[test]
    fn file_entries_need_exactly_one_kind() {
        let both = format!(r#"{{"files": {{"a": {{"h": "{H1}", "s": 1, "l": "b"}}}}}}"#);
        assert!(matches!(parse(&both), Err(ConfigError::AmbiguousEntry { .. })));
        assert!(matches!(
            parse(r#"{"files": {"a": {}}}"#),
            Err(ConfigError::AmbiguousEntry { .. })
        ));
        let no_size = format!(r#"{{"files": {{"a": {{"h": "{H1}"}}}}}}"#);
        assert!(matches!(parse(&no_size), Err(ConfigError::MissingSize { .. })));
        assert!(matches!(
            parse(r#"{"files": {"a": {"s": 3}}}"#),
            Err(ConfigError::MissingDigest { .. })
        ));
    }

    #[test]
    fn os_must_match_flavor() {
        assert_eq!(
            Manifest::parse(br#"{"os": "win"}"#, "linux"),
            Err(ConfigError::WrongOs {
                expected: "linux".into(),
                found: "win".into(),
            })
        );
        assert!(Manifest::parse(br#"{"os": "mac"}"#, "mac").is_ok());
    }

    #[test]
    fn read_only_must_be_bool() {
        assert!(matches!(
            parse(r#"{"read_only": 1}"#),
            Err(ConfigError::Type { .. })
        ));
    }
}
