use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use regex::Regex;

use crate::error::{Error, Result};
use crate::templates::walk_files;

/// Files starting with `_` or named `loader*` are helpers, not recipes.
pub const DEFAULT_EXCLUDE_PATTERN: &str = "^(_|loader).*";

fn decorator_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"@(?:prodigy\.)?recipe\(\s*["']([^"']+)["']"#).expect("valid recipe decorator regex")
    })
}

/// Recipe names the workers can run, with the file that defines each custom
/// one. Built-in names have no source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    names: BTreeMap<String, Option<PathBuf>>,
}

impl Capabilities {
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(|n| (n.into(), None)).collect(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    /// File defining a custom recipe, if it came from the recipe directory.
    pub fn source(&self, name: &str) -> Option<&Path> {
        self.names.get(name).and_then(|p| p.as_deref())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

pub fn compile_exclude(pattern: Option<&str>) -> Result<Option<Regex>> {
    pattern
        .map(|p| {
            Regex::new(p).map_err(|e| Error::Config(format!("invalid recipe exclude pattern: {e}")))
        })
        .transpose()
}

pub fn is_recipe_file(filename: &str, exclude: Option<&Regex>) -> bool {
    filename.ends_with(".py") && !exclude.is_some_and(|re| re.is_match(filename))
}

/// Names registered by `@recipe("...")` / `@prodigy.recipe("...")` decorators.
pub fn recipe_names(source: &str) -> Vec<String> {
    decorator_re()
        .captures_iter(source)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// Merge the recipes exposed by files under `dir` into `starting`.
pub fn discover_capabilities<I, S>(
    dir: Option<&Path>,
    exclude: Option<&Regex>,
    starting: I,
) -> Result<Capabilities>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut caps = Capabilities::from_names(starting);
    let Some(dir) = dir else {
        return Ok(caps);
    };

    tracing::info!(dir = %dir.display(), "looking for recipes");
    let mut files = Vec::new();
    let mut skipped = Vec::new();
    walk_files(dir, &mut files, &mut skipped)?;
    files.sort();
    for (path, reason) in skipped {
        tracing::warn!(path = %path.display(), %reason, "skipping recipe directory");
    }

    let mut found = Vec::new();
    for path in files {
        let Some(filename) = path.file_name().and_then(|f| f.to_str()) else {
            continue;
        };
        if !is_recipe_file(filename, exclude) {
            continue;
        }
        tracing::info!(path = %path.display(), "loading recipes");
        let source = match std::fs::read_to_string(&path) {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "unreadable recipe file");
                continue;
            }
        };
        for name in recipe_names(&source) {
            if !caps.contains(&name) {
                found.push(name.clone());
            }
            caps.names.insert(name, Some(path.clone()));
        }
    }

    tracing::info!(count = found.len(), names = ?found, "additional recipes found");
    Ok(caps)
}

static CAPABILITIES: OnceLock<Capabilities> = OnceLock::new();

/// One-shot, process-wide recipe registration. Later calls return the set
/// from the first call unchanged.
pub fn init_capabilities<I, S>(
    dir: Option<&Path>,
    exclude_pattern: Option<&str>,
    starting: I,
) -> Result<&'static Capabilities>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    if let Some(caps) = CAPABILITIES.get() {
        tracing::debug!("recipes already registered; ignoring re-initialization");
        return Ok(caps);
    }
    let exclude = compile_exclude(exclude_pattern)?;
    let caps = discover_capabilities(dir, exclude.as_ref(), starting)?;
    Ok(CAPABILITIES.get_or_init(|| caps))
}

/// The registered set, if [`init_capabilities`] ran.
pub fn capabilities() -> Option<&'static Capabilities> {
    CAPABILITIES.get()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pattern_excludes_helpers() {
        let re = compile_exclude(Some(DEFAULT_EXCLUDE_PATTERN)).unwrap();
        let re = re.as_ref();
        assert!(is_recipe_file("my_recipes.py", re));
        assert!(!is_recipe_file("_private.py", re));
        assert!(!is_recipe_file("loader_jsonl.py", re));
        assert!(!is_recipe_file("notes.txt", re));
        assert!(is_recipe_file("_private.py", None));
    }

    #[test]
    fn invalid_pattern_is_a_config_error() {
        assert!(matches!(compile_exclude(Some("(")), Err(Error::Config(_))));
    }

    #[test]
    fn decorator_names_are_extracted() {
        let src = r#"
import prodigy

@prodigy.recipe("textcat.custom", dataset=("Dataset", "positional", None, str))
def textcat_custom(dataset):
    pass

@recipe('ner.fast')
def ner_fast():
    pass
"#;
        assert_eq!(recipe_names(src), vec!["textcat.custom", "ner.fast"]);
    }

    #[test]
    fn discovery_merges_with_starting_set() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("custom.py"),
            "@prodigy.recipe(\"custom.one\")\ndef f(): pass\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("_hidden.py"),
            "@prodigy.recipe(\"hidden.one\")\ndef f(): pass\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("loader.py"),
            "@prodigy.recipe(\"loader.one\")\ndef f(): pass\n",
        )
        .unwrap();

        let re = compile_exclude(Some(DEFAULT_EXCLUDE_PATTERN)).unwrap();
        let caps = discover_capabilities(Some(dir.path()), re.as_ref(), ["textcat.manual"]).unwrap();
        assert_eq!(caps.len(), 2);
        assert!(caps.contains("textcat.manual"));
        assert!(caps.source("textcat.manual").is_none());
        assert_eq!(caps.source("custom.one"), Some(dir.path().join("custom.py").as_path()));
        assert!(!caps.contains("hidden.one"));
        assert!(!caps.contains("loader.one"));
    }

    #[cfg(unix)]
    #[test]
    fn discovery_survives_symlink_loops() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(
            dir.path().join("sub/custom.py"),
            "@recipe(\"custom.two\")\ndef f(): pass\n",
        )
        .unwrap();
        std::os::unix::fs::symlink(dir.path(), dir.path().join("sub/back")).unwrap();

        let caps = discover_capabilities(Some(dir.path()), None, Vec::<String>::new()).unwrap();
        assert_eq!(caps.names().collect::<Vec<_>>(), vec!["custom.two"]);
    }

    #[test]
    fn init_is_idempotent() {
        let first = init_capabilities(None, None, ["a"]).unwrap();
        let second = init_capabilities(None, None, ["b"]).unwrap();
        assert!(std::ptr::eq(first, second));
        assert!(capabilities().is_some());
    }
}
