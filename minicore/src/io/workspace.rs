//! Initialization helpers for `.miniswe/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info};

use crate::io::config::{AgentConfig, write_config};

const MINISWE_GITIGNORE: &str = "data/\nlogs/\n*.tmp\n";

/// All canonical paths within `.miniswe/` for a working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentPaths {
    pub root: PathBuf,
    pub miniswe_dir: PathBuf,
    pub configs_dir: PathBuf,
    pub data_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub live_config_path: PathBuf,
    /// Default trajectory location for `mini run`.
    pub last_run_path: PathBuf,
}

impl AgentPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let miniswe_dir = root.join(".miniswe");
        let configs_dir = miniswe_dir.join("configs");
        let data_dir = miniswe_dir.join("data");
        Self {
            root,
            gitignore_path: miniswe_dir.join(".gitignore"),
            live_config_path: configs_dir.join("live.toml"),
            last_run_path: data_dir.join("last_run.traj.json"),
            logs_dir: miniswe_dir.join("logs"),
            configs_dir,
            data_dir,
            miniswe_dir,
        }
    }

    /// Path of the config file for profile `name`.
    pub fn profile_path(&self, name: &str) -> PathBuf {
        self.configs_dir.join(format!("{name}.toml"))
    }
}

/// Options for [`init_workspace`].
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// Overwrite the files init owns (`live.toml`, `.gitignore`).
    pub force: bool,
}

/// Create `.miniswe/` scaffolding in `root` for `mini init`.
///
/// Fails if `.miniswe/` already exists unless `options.force` is set.
pub fn init_workspace(root: &Path, options: &InitOptions) -> Result<AgentPaths> {
    let paths = AgentPaths::new(root);
    if paths.miniswe_dir.exists() && !paths.miniswe_dir.is_dir() {
        return Err(anyhow!(
            "mini init: {} exists but is not a directory",
            paths.miniswe_dir.display()
        ));
    }
    if paths.miniswe_dir.exists() && !options.force {
        return Err(anyhow!(
            "mini init: .miniswe already exists (use --force to overwrite)"
        ));
    }

    create_dirs(&paths)?;
    write_file(&paths.gitignore_path, MINISWE_GITIGNORE)?;
    write_config(&paths.live_config_path, &AgentConfig::default())?;
    info!(root = %root.display(), "initialized .miniswe");
    Ok(paths)
}

/// Make sure the layout exists before a run, without touching existing files.
pub fn ensure_workspace(root: &Path) -> Result<AgentPaths> {
    let paths = AgentPaths::new(root);
    if paths.miniswe_dir.exists() && !paths.miniswe_dir.is_dir() {
        return Err(anyhow!(
            "{} exists but is not a directory",
            paths.miniswe_dir.display()
        ));
    }
    create_dirs(&paths)?;
    if !paths.gitignore_path.exists() {
        write_file(&paths.gitignore_path, MINISWE_GITIGNORE)?;
    }
    if !paths.live_config_path.exists() {
        debug!(path = %paths.live_config_path.display(), "writing starter config");
        write_config(&paths.live_config_path, &AgentConfig::default())?;
    }
    Ok(paths)
}

fn create_dirs(paths: &AgentPaths) -> Result<()> {
    for dir in [&paths.configs_dir, &paths.data_dir, &paths.logs_dir] {
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    }
    Ok(())
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}
