//! Docker CLI driver.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use super::driver::{ContainerInfo, ContainerIo, ContainerSpec, ExecutorDriver};
use crate::config::ContainerConfig;
use crate::error::{Error, Result};

const STOP_GRACE_SECS: &str = "10";
const INSPECT_INTERVAL: Duration = Duration::from_millis(200);
const INSPECT_TRIES: u32 = 50;

pub struct DockerDriver {
    command: String,
    run_args: Vec<String>,
}

impl DockerDriver {
    pub fn new(conf: &ContainerConfig) -> Self {
        Self {
            command: conf.docker_command.clone(),
            run_args: conf.run_args.clone(),
        }
    }

    /// Arguments for `docker run`, without the program name.
    pub fn run_args(&self, spec: &ContainerSpec, with_stdin: bool) -> Vec<String> {
        let mut args = vec!["run".to_string()];
        args.extend(self.run_args.iter().cloned());
        args.push("--rm".into());
        if with_stdin {
            args.push("-i".into());
        }
        args.push("--name".into());
        args.push(spec.name.clone());
        if let Some(uid) = spec.user {
            args.push("--user".into());
            args.push(uid.to_string());
        }
        if !spec.workdir.is_empty() {
            args.push("-w".into());
            args.push(spec.workdir.clone());
        }
        for (key, value) in &spec.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        for vol in &spec.volumes {
            let mode = if vol.readonly { "ro" } else { "rw" };
            args.push("-v".into());
            args.push(format!(
                "{}:{}:{mode}",
                vol.host_path.display(),
                vol.container_path
            ));
        }
        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }
}

#[async_trait]
impl ExecutorDriver for DockerDriver {
    async fn run(&self, spec: &ContainerSpec, io: ContainerIo) -> Result<i32> {
        let ContainerIo {
            stdin,
            mut stdout,
            mut stderr,
        } = io;
        let args = self.run_args(spec, stdin.is_some());
        debug!(container = %spec.name, ?args, "docker run");

        let mut child = Command::new(&self.command)
            .args(&args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let feed = async {
            if let (Some(mut src), Some(mut dst)) = (stdin, child.stdin.take()) {
                tokio::io::copy(&mut src, &mut dst).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let mut out_pipe = child.stdout.take();
        let mut err_pipe = child.stderr.take();
        let drain_out = async {
            if let Some(pipe) = out_pipe.as_mut() {
                tokio::io::copy(pipe, &mut stdout).await?;
            }
            tokio::io::AsyncWriteExt::flush(&mut stdout).await
        };
        let drain_err = async {
            if let Some(pipe) = err_pipe.as_mut() {
                tokio::io::copy(pipe, &mut stderr).await?;
            }
            tokio::io::AsyncWriteExt::flush(&mut stderr).await
        };
        let (fed, out, err) = tokio::join!(feed, drain_out, drain_err);
        fed?;
        out?;
        err?;

        let status = child.wait().await?;
        // Killed by a signal: report it the way a shell would.
        Ok(status.code().unwrap_or(-1))
    }

    async fn inspect(&self, name: &str) -> Result<ContainerInfo> {
        for _ in 0..INSPECT_TRIES {
            let out = Command::new(&self.command)
                .args(["inspect", name])
                .output()
                .await?;
            if out.status.success() {
                if let Some(info) = parse_inspect(&String::from_utf8_lossy(&out.stdout))? {
                    return Ok(info);
                }
            }
            tokio::time::sleep(INSPECT_INTERVAL).await;
        }
        Err(Error::Transient(format!("container {name} never started")))
    }

    async fn stop(&self, name: &str) -> Result<()> {
        let out = Command::new(&self.command)
            .args(["stop", "-t", STOP_GRACE_SECS, name])
            .output()
            .await?;
        if !out.status.success() {
            return Err(Error::Other(format!(
                "docker stop {name}: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Inspected {
    state: InspectedState,
    #[serde(default)]
    network_settings: Option<NetworkSettings>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedState {
    running: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkSettings {
    #[serde(default, rename = "IPAddress")]
    ip_address: String,
    #[serde(default)]
    ports: Option<BTreeMap<String, Option<Vec<PortBinding>>>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PortBinding {
    #[serde(default)]
    host_port: String,
}

/// Parse `docker inspect` output. `None` until the container is running.
pub fn parse_inspect(out: &str) -> Result<Option<ContainerInfo>> {
    let list: Vec<Inspected> = serde_json::from_str(out)?;
    let Some(c) = list.into_iter().next() else {
        return Ok(None);
    };
    if !c.state.running {
        return Ok(None);
    }
    let mut info = ContainerInfo::default();
    if let Some(net) = c.network_settings {
        info.ip = net.ip_address;
        for (port, bindings) in net.ports.unwrap_or_default() {
            if let Some(binding) = bindings.and_then(|b| b.into_iter().next()) {
                info.ports.insert(port, binding.host_port);
            }
        }
    }
    Ok(Some(info))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::driver::Volume;

    #[test]
    fn run_args_map_volumes_and_user() {
        let driver = DockerDriver::new(&ContainerConfig::default());
        let spec = ContainerSpec {
            name: "t1-0".into(),
            image: "alpine".into(),
            command: vec!["echo".into(), "hi".into()],
            workdir: "/data".into(),
            volumes: vec![Volume {
                host_path: "/w/t1/data".into(),
                container_path: "/data".into(),
                readonly: true,
            }],
            user: Some(1000),
            ..Default::default()
        };
        let args = driver.run_args(&spec, false);
        assert_eq!(
            args,
            [
                "run", "--rm", "--name", "t1-0", "--user", "1000", "-w", "/data", "-v",
                "/w/t1/data:/data:ro", "alpine", "echo", "hi"
            ]
        );
    }

    #[test]
    fn inspect_waits_for_running() {
        let created = r#"[{"State":{"Running":false}}]"#;
        assert!(parse_inspect(created).unwrap().is_none());

        let running = r#"[{"State":{"Running":true},"NetworkSettings":{"IPAddress":"172.17.0.2","Ports":{"80/tcp":[{"HostIp":"0.0.0.0","HostPort":"32768"}],"443/tcp":null}}}]"#;
        let info = parse_inspect(running).unwrap().unwrap();
        assert_eq!(info.ip, "172.17.0.2");
        assert_eq!(info.ports.get("80/tcp").map(String::as_str), Some("32768"));
        assert!(!info.ports.contains_key("443/tcp"));
    }
}
