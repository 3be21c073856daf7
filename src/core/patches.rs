use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
};

use zip::ZipArchive;

use crate::core::domain::Workspace;

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("failed to read archive {}: {source}", path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("failed to write patch file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Per-player patch files carry an `.ap*` extension (`.apz5`, `.aplttp`, ...).
pub fn is_patch_entry(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.to_ascii_lowercase().starts_with("ap"))
}

/// Copies every patch entry of `archive` flat into the workspace output dir,
/// each prefixed with the job id. Blocking; call from `spawn_blocking`.
pub fn extract_patch_files(archive: &Path, workspace: &Workspace) -> Result<Vec<PathBuf>, PatchError> {
    let file = File::open(archive).map_err(|source| PatchError::Io {
        path: archive.to_path_buf(),
        source,
    })?;
    let mut zip = ZipArchive::new(file).map_err(|source| PatchError::Archive {
        path: archive.to_path_buf(),
        source,
    })?;

    let mut extracted = Vec::new();
    for idx in 0..zip.len() {
        let mut entry = zip.by_index(idx).map_err(|source| PatchError::Archive {
            path: archive.to_path_buf(),
            source,
        })?;
        if entry.is_dir() {
            continue;
        }

        // enclosed_name rejects absolute and `..` paths.
        let Some(base_name) = entry
            .enclosed_name()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        else {
            tracing::warn!(entry = entry.name(), "Skipping archive entry with unsafe path");
            continue;
        };
        if !is_patch_entry(&base_name) {
            continue;
        }

        let dest = workspace.patch_path(&base_name);
        let mut out = File::create(&dest).map_err(|source| PatchError::Io {
            path: dest.clone(),
            source,
        })?;
        io::copy(&mut entry, &mut out).map_err(|source| PatchError::Io {
            path: dest.clone(),
            source,
        })?;

        tracing::debug!(patch = %dest.display(), "Extracted patch file");
        extracted.push(dest);
    }

    extracted.sort();
    Ok(extracted)
}
