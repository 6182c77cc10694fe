//! Per-lease workspaces.
//!
//! Each lease gets a sealed temporary directory: the package materialized
//! under `package/`, exchange files and artifacts under `work/`. The
//! directory is removed on every exit path when the workspace drops.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tempfile::TempDir;

use crate::error::{ExecutorError, PackageError};
use crate::package::Package;

/// Inputs exchange file, written by the worker, read by the executor.
pub const INPUTS_FILE: &str = "inputs.json";

/// Outputs exchange file, written by the executor, read by the worker.
pub const OUTPUTS_FILE: &str = "outputs.json";

/// Well-known report files harvested as artifacts when the executor
/// leaves them in the work directory.
const REPORT_FILES: &[(&str, &str)] = &[("output.xml", "text/xml"), ("log.html", "text/html")];

/// A sealed per-lease directory.
pub struct Workspace {
    root: TempDir,
}

impl Workspace {
    /// Materialize `package` into a fresh workspace. Blocking filesystem
    /// work; callers run it off the async path.
    pub fn create(package: &Package) -> Result<Self, PackageError> {
        let root = tempfile::Builder::new()
            .prefix("task-bridge-")
            .tempdir()?;
        std::fs::create_dir(root.path().join("package"))?;
        std::fs::create_dir(root.path().join("work"))?;
        package.materialize(&root.path().join("package"))?;
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    /// Root of the unpacked package.
    pub fn package_dir(&self) -> PathBuf {
        self.root.path().join("package")
    }

    /// Scratch directory the executor runs in.
    pub fn work_dir(&self) -> PathBuf {
        self.root.path().join("work")
    }

    pub fn inputs_path(&self) -> PathBuf {
        self.work_dir().join(INPUTS_FILE)
    }

    pub fn outputs_path(&self) -> PathBuf {
        self.work_dir().join(OUTPUTS_FILE)
    }

    /// Write the inputs exchange file.
    pub fn stage_inputs(&self, inputs: &serde_json::Value) -> std::io::Result<()> {
        std::fs::write(self.inputs_path(), serde_json::to_vec(inputs)?)
    }

    /// Read the outputs exchange file. Absent file is `None`; an
    /// unparseable file is an executor contract violation.
    pub fn read_outputs(&self) -> Result<Option<OutputsFile>, ExecutorError> {
        let path = self.outputs_path();
        if !path.is_file() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)?;
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| ExecutorError::MalformedOutputs(e.to_string()))
    }

    /// Collect well-known report files left next to the outputs file.
    pub fn harvest_report_files(&self) -> Vec<HarvestedFile> {
        let mut harvested = Vec::new();
        for (name, mime_type) in REPORT_FILES {
            let path = self.work_dir().join(name);
            if let Ok(bytes) = std::fs::read(&path) {
                harvested.push(HarvestedFile {
                    name: (*name).to_string(),
                    mime_type: (*mime_type).to_string(),
                    bytes,
                });
            }
        }
        harvested
    }
}

/// A report file picked up from the work directory.
#[derive(Debug)]
pub struct HarvestedFile {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// Parsed outputs exchange file: `{outputs, errorCode?, errorMessage?,
/// artifacts?}`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputsFile {
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, ArtifactDto>,
}

/// One artifact entry in the outputs file.
#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactDto {
    #[serde(rename = "mimeType", default)]
    pub mime_type: Option<String>,
    pub base64: String,
}
