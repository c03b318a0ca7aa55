//! Per-request scratch workspaces.
//!
//! Each submission gets its own directory under the scratch root, named with
//! a random suffix so concurrent requests never share a path. The directory
//! is removed when the [`ScratchWorkspace`] is closed or dropped.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::debug;

use crate::error::ExecError;
use crate::types::Language;

/// File stem of the staged source and of the compiled binary.
const ENTRY_STEM: &str = "main";

/// Creates scratch workspaces under a fixed root.
#[derive(Debug, Clone)]
pub struct Stager {
    root: PathBuf,
}

impl Stager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `source` into a fresh workspace with a language-appropriate name.
    pub fn stage(&self, source: &str, language: Language) -> Result<ScratchWorkspace, ExecError> {
        fs::create_dir_all(&self.root).map_err(ExecError::Staging)?;

        let dir = tempfile::Builder::new()
            .prefix("run-")
            .tempdir_in(&self.root)
            .map_err(ExecError::Staging)?;

        let source_path = dir
            .path()
            .join(format!("{ENTRY_STEM}.{}", language.extension()));
        fs::write(&source_path, source).map_err(ExecError::Staging)?;

        debug!(workspace = %dir.path().display(), %language, "Staged source");

        Ok(ScratchWorkspace {
            dir,
            source_path,
            language,
        })
    }
}

/// An exclusively owned scratch directory holding one submission.
#[derive(Debug)]
pub struct ScratchWorkspace {
    dir: TempDir,
    source_path: PathBuf,
    language: Language,
}

impl ScratchWorkspace {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    /// File name of the staged source, relative to the workspace.
    pub fn source_file_name(&self) -> String {
        format!("{ENTRY_STEM}.{}", self.language.extension())
    }

    /// Where a compile step is expected to leave the executable.
    pub fn binary_path(&self) -> PathBuf {
        self.dir.path().join(ENTRY_STEM)
    }

    pub fn binary_file_name(&self) -> &'static str {
        ENTRY_STEM
    }

    pub const fn language(&self) -> Language {
        self.language
    }

    /// Remove the directory now, reporting any failure.
    pub fn close(self) -> std::io::Result<()> {
        let path = self.dir.path().to_path_buf();
        self.dir.close()?;
        debug!(workspace = %path.display(), "Released workspace");
        Ok(())
    }
}
