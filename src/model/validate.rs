//! Task validation at creation time.
//!
//! Every violated invariant yields one message naming the offending field,
//! so clients can fix a task in a single round trip.

use super::Task;
use crate::error::{Error, Result};

/// Validate a user-submitted task.
///
/// Returns [`Error::Validation`] listing every problem found.
pub fn validate(task: &Task) -> Result<()> {
    let errs = problems(task);
    if errs.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation(errs))
    }
}

/// Collect every validation message for `task`, in field order.
pub fn problems(task: &Task) -> Vec<String> {
    let mut errs = Vec::new();

    if task.executors.is_empty() {
        errs.push("Task.Executors: at least one executor is required".to_string());
    }

    for (i, exec) in task.executors.iter().enumerate() {
        if exec.image.is_empty() {
            errs.push(format!("Task.Executors[{i}].Image: required, but empty"));
        }
        if exec.command.is_empty() {
            errs.push(format!("Task.Executors[{i}].Command: required, but empty"));
        }
        for (field, value) in [
            ("Workdir", &exec.workdir),
            ("Stdin", &exec.stdin),
            ("Stdout", &exec.stdout),
            ("Stderr", &exec.stderr),
        ] {
            if !value.is_empty() && !is_absolute(value) {
                errs.push(format!(
                    "Task.Executors[{i}].{field}: must be an absolute path"
                ));
            }
        }
    }

    for (i, input) in task.inputs.iter().enumerate() {
        if !input.content.is_empty() && !input.url.is_empty() {
            errs.push(format!("Task.Inputs[{i}].Content: Url is non-empty"));
        } else if input.url.is_empty() && input.content.is_empty() {
            errs.push(format!("Task.Inputs[{i}].Url: required, but empty"));
        }
        check_path(&mut errs, "Inputs", i, &input.path);
    }

    for (i, output) in task.outputs.iter().enumerate() {
        if output.url.is_empty() {
            errs.push(format!("Task.Outputs[{i}].Url: required, but empty"));
        }
        check_path(&mut errs, "Outputs", i, &output.path);
    }

    for (i, vol) in task.volumes.iter().enumerate() {
        if !is_absolute(vol) {
            errs.push(format!("Task.Volumes[{i}]: must be an absolute path"));
        }
    }

    for (key, value) in &task.tags {
        if key.is_empty() {
            errs.push(format!("Task.Tags[\"\"]={value}: empty key"));
        }
    }

    errs
}

fn check_path(errs: &mut Vec<String>, field: &str, i: usize, path: &str) {
    if path.is_empty() {
        errs.push(format!("Task.{field}[{i}].Path: required, but empty"));
    } else if !is_absolute(path) {
        errs.push(format!("Task.{field}[{i}].Path: must be an absolute path"));
    }
}

fn is_absolute(path: &str) -> bool {
    path.starts_with('/')
}
