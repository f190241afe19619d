//! Glob imports: `import 'glob-import:lib/*.json'` expands into an object
//! mapping every match (relative to the importing file) onto an inner
//! `import`/`importstr` of that match. Deterministic ordering and a
//! never-evicting cache keep repeated expansions cheap and stable.

use crate::importers::{Import, Imported};
use anyhow::bail;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use log::trace;
use sha2::{Digest, Sha256};
use std::{
    cell::RefCell,
    collections::HashMap,
    fmt::{Display, Formatter},
    path::{Component, Path, PathBuf},
};

/// The inner verb emitted for every match of the pattern
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GlobVerb {
    Import,
    ImportStr,
}

impl GlobVerb {
    /// Import-path prefix claimed by this verb
    fn prefix(self) -> &'static str {
        match self {
            Self::Import => "glob-import:",
            Self::ImportStr => "glob-importstr:",
        }
    }
}

impl Display for GlobVerb {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Import => write!(f, "import"),
            Self::ImportStr => write!(f, "importstr"),
        }
    }
}

/// Key of the expansion cache. Identical resolved patterns imported from
/// different directories produce different relative match strings, so the
/// relative pattern is part of the key (and of the virtual file name).
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct CacheKey {
    resolved: String,
    relative: String,
}

pub struct GlobImporter {
    verb: GlobVerb,
    cache: RefCell<HashMap<CacheKey, Result<CachedExpansion, String>>>,
}

#[derive(Clone)]
struct CachedExpansion {
    contents: String,
    canonical: String,
}

impl GlobImporter {
    pub fn new(verb: GlobVerb) -> Self {
        Self {
            verb,
            cache: RefCell::new(HashMap::new()),
        }
    }

    fn expand(
        &self,
        base: &Path,
        relative: &str,
        resolved: &str,
    ) -> anyhow::Result<CachedExpansion> {
        let matches = glob::glob(resolved).map_err(|error| {
            anyhow::anyhow!("invalid glob pattern '{relative}': {error}")
        })?;
        let mut relative_matches = Vec::new();
        for entry in matches {
            let path = entry?;
            let relative_match = pathdiff::diff_paths(&path, base)
                .unwrap_or_else(|| path.clone());
            relative_matches.push(forward_slashed(&relative_match));
        }
        // Deterministic output regardless of filesystem order
        relative_matches.sort();
        trace!(
            "Glob pattern {relative} matched {} files",
            relative_matches.len()
        );

        let mut contents = String::from("{\n");
        for relative_match in &relative_matches {
            // JSON string quoting is valid Jsonnet quoting
            let quoted = serde_json::to_string(relative_match)
                .expect("string serialization");
            contents.push_str(&format!("  {quoted}: {} {quoted},\n", self.verb));
        }
        contents.push('}');

        Ok(CachedExpansion {
            contents,
            canonical: self.canonical_name(resolved, relative),
        })
    }

    /// Virtual file name for an expansion. Hashing the verb, the resolved
    /// pattern and the relative pattern gives one cached runtime entry per
    /// distinct expansion and nothing more.
    fn canonical_name(&self, resolved: &str, relative: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.verb.prefix().as_bytes());
        hasher.update([0]);
        hasher.update(resolved.as_bytes());
        hasher.update([0]);
        hasher.update(relative.as_bytes());
        format!("glob://{}", URL_SAFE_NO_PAD.encode(hasher.finalize()))
    }
}

impl Import for GlobImporter {
    fn can_process(&self, path: &str) -> bool {
        path.starts_with(self.verb.prefix())
    }

    fn import(&self, base: &Path, path: &str) -> anyhow::Result<Imported> {
        let relative = &path[self.verb.prefix().len()..];
        if Path::new(relative).is_absolute() {
            bail!("invalid glob pattern '{relative}', cannot be absolute");
        }
        let resolved = forward_slashed(&base.join(relative));
        let key = CacheKey {
            resolved: resolved.clone(),
            relative: relative.to_owned(),
        };

        let cached = self.cache.borrow().get(&key).cloned();
        let result = match cached {
            Some(result) => result,
            None => {
                let result = self
                    .expand(base, relative, &resolved)
                    .map_err(|error| format!("{error:#}"));
                self.cache.borrow_mut().insert(key, result.clone());
                result
            }
        };
        match result {
            Ok(expansion) => Ok(Imported {
                contents: expansion.contents,
                canonical: expansion.canonical,
                base: Some(base.to_owned()),
            }),
            Err(message) => bail!("{message}"),
        }
    }
}

/// Render a path with forward slashes regardless of host OS
fn forward_slashed(path: &Path) -> String {
    let mut out = String::new();
    for component in path.components() {
        match component {
            Component::RootDir => out.push('/'),
            Component::CurDir => continue,
            component => {
                if !out.is_empty() && !out.ends_with('/') {
                    out.push('/');
                }
                out.push_str(&component.as_os_str().to_string_lossy());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::write_file;
    use pretty_assertions::assert_eq;

    fn setup() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.json", "b.json", "z.json"] {
            write_file(
                &dir.path().join("lib"),
                name,
                &format!("{{\"{name}\": \"{name}\"}}"),
            );
        }
        let base = dir.path().to_owned();
        (dir, base)
    }

    #[test]
    fn test_expansion_is_sorted() {
        let (_dir, base) = setup();
        let importer = GlobImporter::new(GlobVerb::Import);
        let imported =
            importer.import(&base, "glob-import:lib/*.json").unwrap();
        assert_eq!(
            imported.contents,
            "{\n  \"lib/a.json\": import \"lib/a.json\",\n  \
             \"lib/b.json\": import \"lib/b.json\",\n  \
             \"lib/z.json\": import \"lib/z.json\",\n}"
        );
        assert_eq!(imported.base, Some(base));
    }

    #[test]
    fn test_importstr_verb() {
        let (_dir, base) = setup();
        let importer = GlobImporter::new(GlobVerb::ImportStr);
        assert!(importer.can_process("glob-importstr:lib/*.json"));
        assert!(!importer.can_process("glob-import:lib/*.json"));
        let imported =
            importer.import(&base, "glob-importstr:lib/a*.json").unwrap();
        assert_eq!(
            imported.contents,
            "{\n  \"lib/a.json\": importstr \"lib/a.json\",\n}"
        );
    }

    #[test]
    fn test_absolute_pattern_rejected() {
        let importer = GlobImporter::new(GlobVerb::Import);
        let error = importer
            .import(Path::new("/tmp"), "glob-import:/etc/*.conf")
            .unwrap_err();
        assert_eq!(
            error.to_string(),
            "invalid glob pattern '/etc/*.conf', cannot be absolute"
        );
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let importer = GlobImporter::new(GlobVerb::Import);
        let error = importer
            .import(Path::new("/tmp"), "glob-import:lib/[oops")
            .unwrap_err();
        assert!(
            error.to_string().starts_with("invalid glob pattern 'lib/[oops'"),
            "unexpected error: {error}"
        );
    }

    #[test]
    fn test_empty_expansion() {
        let (_dir, base) = setup();
        let importer = GlobImporter::new(GlobVerb::Import);
        let imported = importer
            .import(&base, "glob-import:lib/*.libsonnet")
            .unwrap();
        assert_eq!(imported.contents, "{\n}");
    }

    #[test]
    fn test_recursive_pattern() {
        let (_dir, base) = setup();
        write_file(&base.join("lib").join("nested"), "deep.json", "{}");
        let importer = GlobImporter::new(GlobVerb::Import);
        let imported =
            importer.import(&base, "glob-import:lib/**/*.json").unwrap();
        assert!(
            imported.contents.contains("\"lib/nested/deep.json\""),
            "missing recursive match: {}",
            imported.contents
        );
    }

    #[test]
    fn test_distinct_callers_get_distinct_virtual_names() {
        let (_dir, base) = setup();
        let importer = GlobImporter::new(GlobVerb::Import);
        let from_root =
            importer.import(&base, "glob-import:lib/*.json").unwrap();
        // Same resolved files, but imported from inside lib with a
        // different relative pattern
        let from_lib = importer
            .import(&base.join("lib"), "glob-import:*.json")
            .unwrap();
        assert_ne!(from_root.canonical, from_lib.canonical);
        assert!(from_lib.contents.contains("\"a.json\": import \"a.json\""));
    }

    #[test]
    fn test_cache_returns_identical_expansion() {
        let (_dir, base) = setup();
        let importer = GlobImporter::new(GlobVerb::Import);
        let first = importer.import(&base, "glob-import:lib/*.json").unwrap();
        let second = importer.import(&base, "glob-import:lib/*.json").unwrap();
        assert_eq!(first.contents, second.contents);
        assert_eq!(first.canonical, second.canonical);
        assert_eq!(importer.cache.borrow().len(), 1);
    }

    #[test]
    fn test_forward_slashed() {
        assert_eq!(forward_slashed(Path::new("/a/b/c")), "/a/b/c");
        assert_eq!(forward_slashed(Path::new("a/b")), "a/b");
        assert_eq!(forward_slashed(Path::new("./a/b")), "a/b");
    }
}
