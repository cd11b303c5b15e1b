//! Submit-file templates.
//!
//! Templates use `{{Name}}` placeholders. A line whose placeholders all
//! resolve to an empty or zero value is dropped, so optional scheduler
//! directives (`--mem`, `-q`, ...) disappear when the task leaves the
//! resource unset.

use std::collections::BTreeMap;

use crate::model::Task;

/// Values substituted into a submit template.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    vars: BTreeMap<&'static str, String>,
}

impl TemplateVars {
    /// Placeholders for one task.
    pub fn for_task(task: &Task, worker_command: &str, work_dir: &str) -> Self {
        let res = task.resources.clone().unwrap_or_default();
        let mut vars = BTreeMap::new();
        vars.insert("TaskId", task.id.clone());
        vars.insert("WorkerCommand", worker_command.to_string());
        vars.insert("WorkDir", work_dir.to_string());
        vars.insert("Cpus", format_number(f64::from(res.cpu_cores)));
        vars.insert("RamGb", format_number(res.ram_gb));
        vars.insert("DiskGb", format_number(res.disk_gb));
        vars.insert("Zone", res.zones.first().cloned().unwrap_or_default());
        vars.insert(
            "Project",
            res.backend_parameters
                .get("project")
                .cloned()
                .unwrap_or_default(),
        );
        Self { vars }
    }

    pub fn set(&mut self, name: &'static str, value: impl Into<String>) {
        self.vars.insert(name, value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }
}

/// Render `template`, dropping lines whose placeholders are all empty.
///
/// Unknown placeholders render as empty.
pub fn render(template: &str, vars: &TemplateVars) -> String {
    let mut out = String::with_capacity(template.len());
    for line in template.lines() {
        if let Some(rendered) = render_line(line, vars) {
            out.push_str(&rendered);
            out.push('\n');
        }
    }
    out
}

fn render_line(line: &str, vars: &TemplateVars) -> Option<String> {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;
    let mut placeholders = 0;
    let mut filled = 0;

    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        out.push_str(&rest[..start]);
        let name = rest[start + 2..start + 2 + len].trim();
        let value = vars.get(name).unwrap_or("");
        placeholders += 1;
        if !value.is_empty() {
            filled += 1;
        }
        out.push_str(value);
        rest = &rest[start + 2 + len + 2..];
    }
    out.push_str(rest);

    if placeholders > 0 && filled == 0 {
        None
    } else {
        Some(out)
    }
}

/// Zero renders as empty; whole numbers drop the fraction.
fn format_number(n: f64) -> String {
    if n <= 0.0 || !n.is_finite() {
        String::new()
    } else if n.fract() == 0.0 {
        format!("{}", n as u64)
    } else {
        format!("{n}")
    }
}
