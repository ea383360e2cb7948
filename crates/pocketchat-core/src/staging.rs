//! Copying picked model files into the models directory.
//!
//! Only one model is kept: staging a new file removes the other `.gguf` files
//! in the directory. Anything else in it is left alone.

use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagedModel {
    /// Already present, nothing copied.
    Reused(PathBuf),
    Copied(PathBuf),
}

impl StagedModel {
    pub fn path(&self) -> &Path {
        match self {
            StagedModel::Reused(path) | StagedModel::Copied(path) => path,
        }
    }
}

/// Where `source` lives once staged: its file name (or `model`) with a
/// `.gguf` extension added when missing.
pub fn staged_path(source: &Path, models_dir: &Path) -> PathBuf {
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "model".to_string());
    let name = if name.ends_with(".gguf") {
        name
    } else {
        format!("{}.gguf", name)
    };
    models_dir.join(name)
}

/// True when `source` lives anywhere under `models_dir`, subdirectories
/// included.
fn is_inside(source: &Path, models_dir: &Path) -> bool {
    match (source.canonicalize(), models_dir.canonicalize()) {
        (Ok(source), Ok(dir)) => source.starts_with(dir),
        _ => false,
    }
}

/// Remove the regular `.gguf` files directly inside `models_dir`.
fn clear_models(models_dir: &Path) -> io::Result<()> {
    for entry in fs::read_dir(models_dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_file() && path.extension().is_some_and(|ext| ext == "gguf") {
            fs::remove_file(&path)?;
            log::debug!("Removed old model {}", path.display());
        }
    }
    Ok(())
}

/// True when [`stage_model`] would copy the file.
pub fn needs_copy(source: &Path, models_dir: &Path) -> bool {
    !is_inside(source, models_dir) && !staged_path(source, models_dir).exists()
}

/// Make `source` available under `models_dir`.
pub fn stage_model(source: &Path, models_dir: &Path) -> io::Result<StagedModel> {
    if is_inside(source, models_dir) {
        return Ok(StagedModel::Reused(source.to_path_buf()));
    }
    let target = staged_path(source, models_dir);
    if target.exists() {
        return Ok(StagedModel::Reused(target));
    }
    if !source.is_file() {
        return Err(io::Error::new(
            ErrorKind::NotFound,
            format!("Model file not found: {}", source.display()),
        ));
    }

    fs::create_dir_all(models_dir)?;
    clear_models(models_dir)?;
    fs::copy(source, &target)?;
    log::info!("Staged {} at {}", source.display(), target.display());
    Ok(StagedModel::Copied(target))
}
