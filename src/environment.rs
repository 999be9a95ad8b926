//! Application-data preparation run by the backend worker before it serves.
//!
//! The environment is never mutated here. The host reads it once into a
//! snapshot; storage variables the snapshot lacks get defaults under the
//! application-data directory, and the resolved paths are handed to the
//! backend as [`ServicePaths`].

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{BackendError, Result};

pub const DOCSTORE_ENV: &str = "DOCSTORE_DB";
pub const APP_SUPPORT_ENV: &str = "STEELCHAT_APP_SUPPORT";

pub type EnvSnapshot = BTreeMap<String, OsString>;

/// Bundled files seeded into the application-data directory on first run.
#[derive(Debug, Clone, Default)]
pub struct SeedResources {
    pub docstore: Option<PathBuf>,
    pub web_index: Option<PathBuf>,
    pub tmp_dir: Option<PathBuf>,
}

impl SeedResources {
    // Layout of a bundle root: docstore.db, web/index.html, tmp/
    pub fn from_bundle(root: &Path) -> Self {
        Self {
            docstore: Some(root.join("docstore.db")),
            web_index: Some(root.join("web").join("index.html")),
            tmp_dir: Some(root.join("tmp")),
        }
    }
}

/// Where the backend keeps its state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePaths {
    pub app_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub docstore_db: PathBuf,
    pub app_support: PathBuf,
}

#[derive(Debug, Clone)]
pub struct PreparedEnvironment {
    pub paths: ServicePaths,
    pub overrides: BTreeMap<String, PathBuf>,
}

// Storage variables: the snapshot's value wins, otherwise a default under app_dir
pub fn storage_overrides(env: &EnvSnapshot, app_dir: &Path) -> BTreeMap<String, PathBuf> {
    let defaults = [
        (DOCSTORE_ENV, app_dir.join("docstore.db")),
        (APP_SUPPORT_ENV, app_dir.to_path_buf()),
    ];
    defaults
        .into_iter()
        .map(|(key, default)| {
            let value = env.get(key).map(PathBuf::from).unwrap_or(default);
            (key.to_string(), value)
        })
        .collect()
}

pub fn prepare(app_dir: &Path, env: &EnvSnapshot, seeds: &SeedResources) -> Result<PreparedEnvironment> {
    ensure_dir(app_dir)?;
    let tmp_dir = app_dir.join("tmp");
    ensure_dir(&tmp_dir)?;

    let overrides = storage_overrides(env, app_dir);

    if let Some(index) = &seeds.web_index {
        seed_file(index, &app_dir.join("index.html"))?;
    }
    if let Some(src) = &seeds.tmp_dir {
        seed_dir_entries(src, &tmp_dir)?;
    }
    if let Some(docstore) = &seeds.docstore {
        seed_file(docstore, &app_dir.join("docstore.db"))?;
    }

    let paths = ServicePaths {
        app_dir: app_dir.to_path_buf(),
        tmp_dir,
        docstore_db: overrides[DOCSTORE_ENV].clone(),
        app_support: overrides[APP_SUPPORT_ENV].clone(),
    };
    Ok(PreparedEnvironment { paths, overrides })
}

fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| BackendError::io(path, e))
}

// One-time migration: an existing destination is never touched.
fn seed_file(src: &Path, dest: &Path) -> Result<bool> {
    if !src.is_file() || dest.exists() {
        return Ok(false);
    }
    fs::copy(src, dest).map_err(|e| BackendError::io(dest, e))?;
    tracing::info!(src = %src.display(), dest = %dest.display(), "seeded file");
    Ok(true)
}

fn seed_dir_entries(src: &Path, dest_dir: &Path) -> Result<()> {
    if !src.is_dir() {
        return Ok(());
    }
    let entries = fs::read_dir(src).map_err(|e| BackendError::io(src, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| BackendError::io(src, e))?;
        let from = entry.path();
        let to = dest_dir.join(entry.file_name());
        if to.exists() {
            continue;
        }
        if from.is_dir() {
            copy_tree(&from, &to)?;
            tracing::info!(src = %from.display(), dest = %to.display(), "seeded directory");
        } else if from.is_file() {
            seed_file(&from, &to)?;
        }
    }
    Ok(())
}

fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    ensure_dir(dest)?;
    for entry in fs::read_dir(src).map_err(|e| BackendError::io(src, e))? {
        let entry = entry.map_err(|e| BackendError::io(src, e))?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        if from.is_dir() {
            copy_tree(&from, &to)?;
        } else {
            fs::copy(&from, &to).map_err(|e| BackendError::io(&to, e))?;
        }
    }
    Ok(())
}
