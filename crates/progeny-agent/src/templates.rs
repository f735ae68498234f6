use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result, TemplateLoadWarning};

/// Worker configuration overrides (feature flags, port, ...).
pub type WorkerConfig = Map<String, Value>;

/// A literal command, or a recipe plus arguments to derive one from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipe: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipe_args: Option<Vec<Value>>,
    /// Rendered in key order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipe_kwargs: Option<BTreeMap<String, Value>>,
}

impl CommandSpec {
    pub fn command(command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            ..Self::default()
        }
    }

    pub fn recipe<I, S>(recipe: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            recipe: Some(recipe.into()),
            recipe_args: Some(args.into_iter().map(|a| Value::String(a.into())).collect()),
            ..Self::default()
        }
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.recipe_kwargs
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    fn has_recipe_fields(&self) -> bool {
        self.recipe.is_some() || self.recipe_args.is_some() || self.recipe_kwargs.is_some()
    }

    fn is_empty(&self) -> bool {
        self.command.is_none() && !self.has_recipe_fields()
    }
}

/// A provisioning request: exactly one of a literal command, a prebaked
/// project name, or a recipe with arguments, plus optional config overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LaunchSpec {
    #[serde(flatten)]
    pub spec: CommandSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prebaked: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<WorkerConfig>,
}

impl LaunchSpec {
    pub fn prebaked(name: impl Into<String>) -> Self {
        Self {
            prebaked: Some(name.into()),
            ..Self::default()
        }
    }
}

impl From<CommandSpec> for LaunchSpec {
    fn from(spec: CommandSpec) -> Self {
        Self {
            spec,
            ..Self::default()
        }
    }
}

fn arg_token(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Turn a command spec into the literal command line.
///
/// `recipe a b --k v`; keys get a leading `--` if missing, `true` renders as
/// a bare flag and `false`/`null` drop the flag.
pub fn parse_command(spec: &CommandSpec) -> Result<String> {
    if let Some(command) = &spec.command {
        if spec.has_recipe_fields() {
            return Err(Error::AmbiguousSpec(
                "both `command` and recipe fields are set".to_string(),
            ));
        }
        return Ok(command.clone());
    }

    let recipe = spec
        .recipe
        .as_deref()
        .ok_or_else(|| Error::AmbiguousSpec("neither `command` nor `recipe` is set".to_string()))?;

    let args = spec.recipe_args.as_deref().unwrap_or_default();
    let kwargs = spec.recipe_kwargs.as_ref();
    if args.is_empty() && kwargs.is_none_or(|k| k.is_empty()) {
        return Err(Error::AmbiguousSpec(format!(
            "recipe `{recipe}` needs `recipe_args` or `recipe_kwargs`"
        )));
    }

    let mut parts = vec![recipe.to_string()];
    parts.extend(args.iter().map(arg_token));
    for (k, v) in kwargs.into_iter().flatten() {
        let key = if k.starts_with("--") {
            k.clone()
        } else {
            format!("--{k}")
        };
        match v {
            Value::Bool(false) | Value::Null => {}
            Value::Bool(true) => parts.push(key),
            other => {
                parts.push(key);
                parts.push(arg_token(other));
            }
        }
    }
    Ok(parts.join(" "))
}

/// A named, reusable command/config definition ("prebaked" project).
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub name: String,
    pub command: String,
    pub config: WorkerConfig,
    pub source: PathBuf,
}

#[derive(Debug, Deserialize)]
struct TemplateFile {
    #[serde(default)]
    name: Option<String>,
    #[serde(flatten)]
    spec: CommandSpec,
    #[serde(default)]
    config: Option<WorkerConfig>,
}

#[derive(Debug, Default)]
pub struct TemplateSet {
    pub templates: BTreeMap<String, Template>,
    pub warnings: Vec<TemplateLoadWarning>,
}

fn is_template_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yml") | Some("yaml")
    )
}

/// Files under `root`, recursively. Only an unreadable `root` is an error:
/// unreadable subdirectories are reported in `skipped`. Symlinked
/// directories are not followed; symlinked files are kept.
pub(crate) fn walk_files(
    root: &Path,
    out: &mut Vec<PathBuf>,
    skipped: &mut Vec<(PathBuf, String)>,
) -> std::io::Result<()> {
    fn walk(
        cur: &Path,
        out: &mut Vec<PathBuf>,
        skipped: &mut Vec<(PathBuf, String)>,
    ) -> std::io::Result<()> {
        for entry in std::fs::read_dir(cur)? {
            let entry = match entry {
                Ok(e) => e,
                Err(err) => {
                    skipped.push((cur.to_path_buf(), format!("unreadable entry: {err}")));
                    continue;
                }
            };
            let path = entry.path();
            let Ok(ft) = entry.file_type() else {
                skipped.push((path, "unreadable file type".to_string()));
                continue;
            };
            if ft.is_symlink() {
                if path.is_file() {
                    out.push(path);
                }
                continue;
            }
            if ft.is_dir() {
                if let Err(err) = walk(&path, out, skipped) {
                    skipped.push((path, format!("unreadable directory: {err}")));
                }
                continue;
            }
            out.push(path);
        }
        Ok(())
    }

    walk(root, out, skipped)
}

fn parse_template_file(path: &Path) -> std::result::Result<Template, String> {
    let raw = std::fs::read_to_string(path).map_err(|e| format!("unreadable: {e}"))?;
    let file: TemplateFile =
        serde_yaml::from_str(&raw).map_err(|e| format!("not a valid YAML template: {e}"))?;

    let name = file
        .name
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| "missing a `name` key".to_string())?;
    if file.spec.is_empty() {
        return Err("neither `command` nor `recipe` is set".to_string());
    }
    let command = parse_command(&file.spec).map_err(|e| e.to_string())?;

    Ok(Template {
        name,
        command,
        config: file.config.unwrap_or_default(),
        source: path.to_path_buf(),
    })
}

/// Load every template under `dir` (recursively, in path order).
///
/// Bad files are skipped with a warning. On duplicate names the file that
/// sorts last wins.
pub fn load_templates(dir: &Path) -> Result<TemplateSet> {
    tracing::info!(dir = %dir.display(), "looking for prebaked projects");

    let mut files = Vec::new();
    let mut skipped = Vec::new();
    walk_files(dir, &mut files, &mut skipped)?;
    files.sort();

    let mut set = TemplateSet::default();
    for (path, reason) in skipped {
        let w = TemplateLoadWarning { path, reason };
        tracing::warn!(%w, "skipping prebaked project directory");
        set.warnings.push(w);
    }
    for path in files {
        if !is_template_file(&path) {
            tracing::debug!(path = %path.display(), "skipping non-YAML file");
            continue;
        }
        tracing::info!(path = %path.display(), "attempting to load prebaked project");

        match parse_template_file(&path) {
            Ok(t) => {
                if let Some(prev) = set.templates.get(&t.name) {
                    tracing::warn!(
                        name = %t.name,
                        previous = %prev.source.display(),
                        path = %path.display(),
                        "duplicate prebaked project name; later file wins"
                    );
                }
                set.templates.insert(t.name.clone(), t);
            }
            Err(reason) => {
                let w = TemplateLoadWarning { path, reason };
                tracing::warn!(%w, "skipping prebaked project file");
                set.warnings.push(w);
            }
        }
    }

    let names: Vec<&str> = set.templates.keys().map(String::as_str).collect();
    tracing::info!(count = names.len(), ?names, "prebaked projects found");
    Ok(set)
}

/// Resolves provisioning requests into `(command, config)` pairs.
#[derive(Debug, Clone, Default)]
pub struct CommandBuilder {
    prebaked: BTreeMap<String, Template>,
}

impl CommandBuilder {
    pub fn new(prebaked: BTreeMap<String, Template>) -> Self {
        Self { prebaked }
    }

    pub fn from_dir(dir: Option<&Path>) -> Result<Self> {
        match dir {
            Some(dir) => Ok(Self::new(load_templates(dir)?.templates)),
            None => Ok(Self::default()),
        }
    }

    pub fn prebaked(&self) -> &BTreeMap<String, Template> {
        &self.prebaked
    }

    /// Exactly one of command / prebaked / recipe must be given. Request
    /// config overrides win over a prebaked project's config.
    pub fn resolve(&self, launch: &LaunchSpec) -> Result<(String, WorkerConfig)> {
        let overrides = launch.config.clone().unwrap_or_default();
        let has_command = launch.spec.command.is_some();
        let has_recipe = launch.spec.has_recipe_fields();

        match (&launch.prebaked, has_command, has_recipe) {
            (Some(name), false, false) => {
                let t = self
                    .prebaked
                    .get(name)
                    .ok_or_else(|| Error::UnknownTemplate(name.clone()))?;
                let mut config = t.config.clone();
                config.extend(overrides);
                Ok((t.command.clone(), config))
            }
            (None, true, _) | (None, _, true) => Ok((parse_command(&launch.spec)?, overrides)),
            (None, false, false) => Err(Error::AmbiguousSpec(
                "one of `command`, `prebaked` or `recipe` is required".to_string(),
            )),
            (Some(_), _, _) => Err(Error::AmbiguousSpec(
                "`prebaked` cannot be combined with `command` or recipe fields".to_string(),
            )),
        }
    }
}
