//! Workspace layout and scaffolding for `.specloop/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use crate::io::config::{SpecloopConfig, write_config};

const SAMPLE_TASKS: &str = r#"{
  "version": 1,
  "tasks": [
    {
      "id": "T1",
      "description": "Implement login",
      "dependencies": [],
      "references": ["R1"]
    }
  ]
}
"#;

const SAMPLE_SPEC: &str = "# Specification {#spec}\n\n## Requirements\n\n### Users can log in {#R1}\nA registered user with valid credentials receives a session.\n\n## Tasks\n\n### Implement login {#T1}\nAdd the login endpoint and its tests.\n";

/// All canonical paths for a project root.
#[derive(Debug, Clone)]
pub struct SpecloopPaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub state_path: PathBuf,
    pub activity_path: PathBuf,
    pub backups_dir: PathBuf,
    pub spec_path: PathBuf,
    pub tasks_path: PathBuf,
}

impl SpecloopPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = root.join(".specloop");
        Self {
            root: root.clone(),
            state_dir: state_dir.clone(),
            config_path: state_dir.join("config.toml"),
            state_path: state_dir.join("state.json"),
            activity_path: state_dir.join("activity.jsonl"),
            backups_dir: state_dir.join("backups"),
            spec_path: root.join("spec.md"),
            tasks_path: root.join("tasks.json"),
        }
    }
}

/// Options for `init_workspace`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing files.
    pub force: bool,
}

/// Create `.specloop/` with a default config, plus sample `spec.md` / `tasks.json`
/// when they do not exist yet.
pub fn init_workspace(root: &Path, options: &InitOptions) -> Result<SpecloopPaths> {
    let paths = SpecloopPaths::new(root);
    fs::create_dir_all(&paths.backups_dir)
        .with_context(|| format!("create {}", paths.backups_dir.display()))?;

    if options.force || !paths.config_path.exists() {
        write_config(&paths.config_path, &SpecloopConfig::default())?;
    }
    write_if_missing_or_force(&paths.tasks_path, SAMPLE_TASKS, options.force)?;
    write_if_missing_or_force(&paths.spec_path, SAMPLE_SPEC, options.force)?;

    info!(root = %root.display(), "workspace initialized");
    Ok(paths)
}

fn write_if_missing_or_force(path: &Path, contents: &str, force: bool) -> Result<()> {
    if !force && path.exists() {
        return Ok(());
    }
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}
