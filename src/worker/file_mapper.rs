//! Maps container paths to host paths under a task's working directory.

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};
use crate::model::{FileType, Input, Output, Task};

use super::driver::Volume;

/// An input with its host-side location.
#[derive(Debug, Clone)]
pub struct MappedInput {
    pub input: Input,
    pub host_path: PathBuf,
}

/// An output with its host-side location.
#[derive(Debug, Clone)]
pub struct MappedOutput {
    pub output: Output,
    pub host_path: PathBuf,
}

/// Host-side layout of one task.
#[derive(Debug, Clone)]
pub struct FileMapper {
    work_dir: PathBuf,
    pub volumes: Vec<Volume>,
    pub inputs: Vec<MappedInput>,
    pub outputs: Vec<MappedOutput>,
    /// Volumes bound to a single output file rather than a directory.
    pub file_mounts: Vec<PathBuf>,
}

impl FileMapper {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            volumes: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            file_mounts: Vec::new(),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Host path for a container path. The container path must be
    /// absolute and the result must stay under the working directory.
    pub fn host_path(&self, container_path: &str) -> Result<PathBuf> {
        if !container_path.starts_with('/') {
            return Err(Error::Validation(vec![format!(
                "path must be absolute: {container_path}"
            )]));
        }
        let mut rel = PathBuf::new();
        for comp in Path::new(container_path).components() {
            match comp {
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir => {
                    if !rel.pop() {
                        return Err(escape(container_path));
                    }
                }
                Component::Normal(part) => rel.push(part),
                Component::Prefix(_) => return Err(escape(container_path)),
            }
        }
        let host = self.work_dir.join(rel);
        if !host.starts_with(&self.work_dir) {
            return Err(escape(container_path));
        }
        Ok(host)
    }

    /// Bind `container_path` unless an existing volume already covers it.
    pub fn add_volume(&mut self, container_path: &str, readonly: bool) -> Result<()> {
        let host_path = self.host_path(container_path)?;
        if let Some(existing) = self
            .volumes
            .iter_mut()
            .find(|v| host_path.starts_with(&v.host_path))
        {
            // A writable volume stays writable.
            existing.readonly &= readonly;
            return Ok(());
        }
        // A new volume swallows any narrower ones already declared.
        let mut readonly = readonly;
        self.volumes.retain(|v| {
            let nested = v.host_path.starts_with(&host_path);
            if nested {
                readonly &= v.readonly;
            }
            !nested
        });
        self.volumes.push(Volume {
            host_path,
            container_path: container_path.to_string(),
            readonly,
        });
        Ok(())
    }

    /// Lay out every path the task mentions.
    ///
    /// Volumes are `/tmp`, the declared volumes, each input's path
    /// (read-only), each directory output and each file output's parent
    /// directory. A file output directly under `/` is bound on its own,
    /// since the container root cannot be a mount point.
    pub fn map_task(&mut self, task: &Task) -> Result<()> {
        self.add_volume("/tmp", false)?;
        for vol in &task.volumes {
            self.add_volume(vol, false)?;
        }
        for input in &task.inputs {
            self.add_volume(&input.path, true)?;
        }
        for output in &task.outputs {
            let mount = match output.file_type {
                FileType::Directory => output.path.as_str(),
                FileType::File => Path::new(&output.path)
                    .parent()
                    .and_then(Path::to_str)
                    .filter(|p| *p != "/")
                    .unwrap_or(&output.path),
            };
            self.add_volume(mount, false)?;
        }

        for input in &task.inputs {
            self.inputs.push(MappedInput {
                input: input.clone(),
                host_path: self.host_path(&input.path)?,
            });
        }
        for output in &task.outputs {
            let host_path = self.host_path(&output.path)?;
            if output.file_type == FileType::File
                && self.volumes.iter().any(|v| v.host_path == host_path)
            {
                self.file_mounts.push(host_path.clone());
            }
            self.outputs.push(MappedOutput {
                output: output.clone(),
                host_path,
            });
        }
        Ok(())
    }
}

fn escape(path: &str) -> Error {
    Error::Validation(vec![format!("path escapes the working directory: {path}")])
}
