//! Moves files between an execution's working directory and durable storage.

use crate::error::RunnerError;
use crate::storage::{is_storage_handle, Storage};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.\-]*)\s*\}\}").expect("placeholder pattern is valid")
});

pub struct FileStaging {
    working_dir: PathBuf,
    output_dir: PathBuf,
    storage: Arc<dyn Storage>,
    namespace: String,
}

impl FileStaging {
    /// `namespace` prefixes every uploaded object name, typically the
    /// execution id.
    pub fn new(
        working_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        storage: Arc<dyn Storage>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            working_dir: working_dir.into(),
            output_dir: output_dir.into(),
            storage,
            namespace: namespace.into(),
        }
    }

    /// Materialize every input under the working directory.
    ///
    /// All names are validated before the first file is written.
    pub async fn stage_inputs(
        &self,
        inputs: &BTreeMap<String, String>,
    ) -> Result<BTreeSet<PathBuf>, RunnerError> {
        let targets = inputs
            .iter()
            .map(|(name, value)| Ok((self.working_dir.join(sanitize_relative(name)?), value)))
            .collect::<Result<Vec<_>, RunnerError>>()?;

        let mut staged = BTreeSet::new();
        for (target, value) in targets {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).await.map_err(|err| {
                    RunnerError::io(format!("Failed to create {}", parent.display()), err)
                })?;
            }

            if is_storage_handle(value) {
                let mut reader = self.storage.fetch(value).await?;
                let mut file = fs::File::create(&target).await.map_err(|err| {
                    RunnerError::io(format!("Failed to create {}", target.display()), err)
                })?;
                io::copy(&mut reader, &mut file).await.map_err(|err| {
                    RunnerError::io(format!("Failed to write {}", target.display()), err)
                })?;
            } else {
                fs::write(&target, value.as_bytes()).await.map_err(|err| {
                    RunnerError::io(format!("Failed to write {}", target.display()), err)
                })?;
            }

            debug!(path = %target.display(), "Staged input file");
            staged.insert(target);
        }

        Ok(staged)
    }

    /// Upload declared outputs plus everything left in the output directory.
    ///
    /// Returns logical name to storage handle. Declared files that do not
    /// exist are skipped, and so is anything reached through a symlink that
    /// resolves outside the working directory. Objects are named by their path
    /// under the working directory, so two logical names never share one. The
    /// first failed upload aborts collection; uploads that already completed
    /// stay in storage.
    pub async fn collect_outputs(
        &self,
        output_files: &[String],
        output_dirs: &[String],
        vars: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>, RunnerError> {
        let jail = fs::canonicalize(&self.working_dir).await.map_err(|err| {
            RunnerError::io(
                format!("Failed to resolve {}", self.working_dir.display()),
                err,
            )
        })?;
        let mut uploaded = BTreeMap::new();
        let mut seen: HashSet<PathBuf> = HashSet::new();

        for declared in output_files {
            let rendered = render_path(declared, vars)?;
            let path = self.resolve(&rendered)?;
            if !contained(&path, &jail, EntryKind::File).await {
                debug!(output = %rendered, "Declared output file not produced");
                continue;
            }
            let handle = self.upload(&rendered, &path).await?;
            seen.insert(path);
            uploaded.insert(rendered, handle);
        }

        for declared in output_dirs {
            let rendered = render_path(declared, vars)?;
            let root = self.resolve(&rendered)?;
            if !contained(&root, &jail, EntryKind::Dir).await {
                debug!(output = %rendered, "Declared output directory not produced");
                continue;
            }
            let prefix = rendered.trim_end_matches('/');
            for (relative, path) in walk_files(&root)? {
                let key = format!("{}/{}", prefix, relative);
                if seen.contains(&path) || uploaded.contains_key(&key) {
                    continue;
                }
                let handle = self.upload(&key, &path).await?;
                seen.insert(path);
                uploaded.insert(key, handle);
            }
        }

        if contained(&self.output_dir, &jail, EntryKind::Dir).await {
            for (relative, path) in walk_files(&self.output_dir)? {
                if seen.contains(&path) {
                    continue;
                }
                if uploaded.contains_key(&relative) {
                    warn!(
                        output = %relative,
                        path = %path.display(),
                        "Output name already taken by a declared output; not collecting"
                    );
                    continue;
                }
                let handle = self.upload(&relative, &path).await?;
                seen.insert(path);
                uploaded.insert(relative, handle);
            }
        }

        if !uploaded.is_empty() {
            info!(count = uploaded.len(), "Uploaded output files");
        }
        Ok(uploaded)
    }

    fn resolve(&self, rendered: &str) -> Result<PathBuf, RunnerError> {
        let path = Path::new(rendered);
        if path.is_absolute() {
            let inside = path.starts_with(&self.working_dir)
                && !path.components().any(|c| matches!(c, Component::ParentDir));
            if !inside {
                return Err(RunnerError::validation(format!(
                    "Output path '{}' is outside the working directory",
                    rendered
                )));
            }
            return Ok(path.to_path_buf());
        }
        Ok(self.working_dir.join(sanitize_relative(rendered)?))
    }

    /// Store `path` as `<namespace>/<path relative to the working directory>`.
    async fn upload(&self, key: &str, path: &Path) -> Result<String, RunnerError> {
        let relative = path.strip_prefix(&self.working_dir).map_err(|_| {
            RunnerError::validation(format!(
                "Output '{}' is outside the working directory",
                path.display()
            ))
        })?;
        let mut file = fs::File::open(path)
            .await
            .map_err(|err| RunnerError::io(format!("Failed to open {}", path.display()), err))?;
        let name = format!("{}/{}", self.namespace, slash_joined(relative));
        let handle = self.storage.store(&name, &mut file).await?;
        debug!(output = key, handle = %handle, "Uploaded output file");
        Ok(handle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    File,
    Dir,
}

/// True when `path` itself is not a symlink, has the expected kind, and its
/// real location is under `jail` (the canonical working directory).
async fn contained(path: &Path, jail: &Path, kind: EntryKind) -> bool {
    let Ok(meta) = fs::symlink_metadata(path).await else {
        return false;
    };
    if meta.file_type().is_symlink() {
        warn!(path = %path.display(), "Skipping symlinked output");
        return false;
    }
    let kind_matches = match kind {
        EntryKind::File => meta.is_file(),
        EntryKind::Dir => meta.is_dir(),
    };
    if !kind_matches {
        return false;
    }
    match fs::canonicalize(path).await {
        Ok(real) if real.starts_with(jail) => true,
        Ok(real) => {
            warn!(
                path = %path.display(),
                target = %real.display(),
                "Skipping output that resolves outside the working directory"
            );
            false
        }
        Err(_) => false,
    }
}

fn slash_joined(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Validate an input or output name as a path that stays inside the working
/// directory. Leading dots (dotfiles) are fine; `..`, roots and prefixes are
/// not.
pub fn sanitize_relative(name: &str) -> Result<PathBuf, RunnerError> {
    let mut clean = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(RunnerError::validation(format!(
                    "File name '{}' escapes the working directory",
                    name
                )));
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(RunnerError::validation(format!(
            "File name '{}' is empty",
            name
        )));
    }
    Ok(clean)
}

/// Substitute `{{ name }}` placeholders. Unknown names are rejected.
pub fn render_path(template: &str, vars: &BTreeMap<String, String>) -> Result<String, RunnerError> {
    if let Some(missing) = PLACEHOLDER
        .captures_iter(template)
        .map(|caps| caps[1].to_string())
        .find(|name| !vars.contains_key(name))
    {
        return Err(RunnerError::validation(format!(
            "Unknown variable '{}' in output path '{}'",
            missing, template
        )));
    }

    Ok(PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            vars.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned())
}

/// Regular files under `root` as `(slash-separated relative path, absolute path)`.
/// Symlinks are never followed, the root included.
fn walk_files(root: &Path) -> Result<Vec<(String, PathBuf)>, RunnerError> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .follow_root_links(false)
        .sort_by_file_name();
    for entry in walker {
        let entry = entry.map_err(|err| RunnerError::Io {
            message: format!("Failed to walk {}: {}", root.display(), err),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        files.push((slash_joined(relative), entry.into_path()));
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn sanitize_rejects_traversal_and_roots() {
        for name in ["../secret", "a/../../b", "/etc/passwd", "..", ""] {
            let err = sanitize_relative(name).unwrap_err();
            assert_eq!(err.code(), "SCRIPT_RUNNER_INVALID_REQUEST", "{}", name);
        }
    }

    #[test]
    fn sanitize_accepts_dotfiles_and_nested_names() {
        assert_eq!(sanitize_relative(".env").unwrap(), PathBuf::from(".env"));
        assert_eq!(
            sanitize_relative("./conf/.hidden").unwrap(),
            PathBuf::from("conf/.hidden")
        );
        assert_eq!(
            sanitize_relative("..hidden").unwrap(),
            PathBuf::from("..hidden")
        );
    }

    #[test]
    fn render_substitutes_known_variables() {
        let rendered = render_path(
            "{{ outputDir }}/report-{{day}}.csv",
            &vars(&[("outputDir", "/w/outputs"), ("day", "monday")]),
        )
        .unwrap();
        assert_eq!(rendered, "/w/outputs/report-monday.csv");
    }

    #[test]
    fn render_rejects_unknown_variables() {
        let err = render_path("{{ nope }}/x", &vars(&[])).unwrap_err();
        assert!(err.to_string().contains("nope"));
    }
}
