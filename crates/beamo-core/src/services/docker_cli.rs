use std::collections::{BTreeMap, HashMap, VecDeque};
use std::process::{Output, Stdio};
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{BeamoError, DaemonErrorKind, Result};
use crate::models::{
    BuildRequest, ContainerAction, ContainerDetails, ContainerEvent, ContainerSpec, PortBinding,
    ProgressFn,
};
use crate::services::daemon::DaemonGateway;

static BUILD_STEP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:\[(?:[\w.\-]+ )?|Step )(\d+)/(\d+)").unwrap());

static PULL_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9a-f]{12,64}): (.+)$").unwrap());

static PULL_BYTES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([\d.]+)\s*([kMG]?B)/([\d.]+)\s*([kMG]?B)").unwrap());

/// Highest value in-flight progress may report. Only a confirmed image reaches 1.
const PROGRESS_CEILING: f32 = 0.99;

/// Lines of build output kept for the error message when a build fails.
const BUILD_TAIL_LINES: usize = 20;

/// Maps daemon error output to a typed kind.
pub fn classify_daemon_error(stderr: &str) -> DaemonErrorKind {
    let text = stderr.to_lowercase();
    if text.contains("no such image")
        || text.contains("reference does not exist")
        || text.contains("unrecognized image id")
    {
        DaemonErrorKind::NoSuchImage
    } else if text.contains("no such container") || text.contains("no such object") {
        DaemonErrorKind::NoSuchContainer
    } else if text.contains("cannot connect to the docker daemon")
        || text.contains("is the docker daemon running")
        || text.contains("error during connect")
    {
        DaemonErrorKind::Unavailable
    } else if text.contains("conflict") || text.contains("already in use") {
        DaemonErrorKind::Conflict
    } else {
        DaemonErrorKind::Failed
    }
}

/// Arguments for `docker create`, image last.
pub fn build_create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec!["create".to_string(), "--name".to_string(), spec.name.clone()];
    if spec.auto_remove {
        args.push("--rm".into());
    }
    if let Some(cmd) = &spec.health_cmd {
        args.push("--health-cmd".into());
        args.push(cmd.clone());
    }
    for binding in &spec.port_bindings {
        args.push("-p".into());
        args.push(format!("{}:{}", binding.local_port, binding.in_container_port));
    }
    for volume in &spec.volumes {
        args.push("-v".into());
        args.push(format!("{}:{}", volume.volume_name, volume.in_container_path));
    }
    for mount in &spec.bind_mounts {
        let mut value = format!(
            "type=bind,source={},target={}",
            mount.local_path, mount.in_container_path
        );
        if mount.is_read_only {
            value.push_str(",readonly");
        }
        args.push("--mount".into());
        args.push(value);
    }
    for var in &spec.env {
        args.push("-e".into());
        args.push(format!("{}={}", var.name, var.value));
    }
    args.push(spec.image.clone());
    args
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedContainer {
    id: String,
    name: String,
    image: String,
    #[serde(default)]
    created: Option<String>,
    state: InspectedState,
    #[serde(default)]
    host_config: Option<InspectedHostConfig>,
    #[serde(default)]
    network_settings: Option<InspectedNetworkSettings>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedState {
    running: bool,
}

type PortMap = BTreeMap<String, Option<Vec<HostBinding>>>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedHostConfig {
    #[serde(default)]
    port_bindings: Option<PortMap>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedNetworkSettings {
    #[serde(default)]
    ports: Option<PortMap>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HostBinding {
    #[serde(default)]
    host_port: String,
}

fn port_bindings_from(map: &PortMap) -> Vec<PortBinding> {
    let mut bindings = Vec::new();
    for (container_port, hosts) in map {
        let in_container_port = container_port
            .split_once('/')
            .map_or(container_port.as_str(), |(port, _)| port);
        for host in hosts.iter().flatten() {
            if host.host_port.is_empty() {
                continue;
            }
            let binding = PortBinding {
                local_port: host.host_port.clone(),
                in_container_port: in_container_port.to_string(),
            };
            // IPv4 and IPv6 listeners report the same binding twice.
            if !bindings.contains(&binding) {
                bindings.push(binding);
            }
        }
    }
    bindings
}

impl From<InspectedContainer> for ContainerDetails {
    fn from(inspected: InspectedContainer) -> Self {
        let port_map = inspected
            .host_config
            .and_then(|hc| hc.port_bindings)
            .filter(|m| !m.is_empty())
            .or_else(|| inspected.network_settings.and_then(|ns| ns.ports));
        Self {
            container_id: inspected.id,
            name: inspected.name.trim_start_matches('/').to_string(),
            image_id: inspected.image,
            is_running: inspected.state.running,
            created_at: inspected
                .created
                .as_deref()
                .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
                .map(|c| c.with_timezone(&Utc)),
            port_bindings: port_map.as_ref().map(port_bindings_from).unwrap_or_default(),
        }
    }
}

/// Parses the JSON array printed by `docker container inspect`.
pub fn parse_inspect_output(json: &str) -> Result<Vec<ContainerDetails>> {
    let inspected: Vec<InspectedContainer> = serde_json::from_str(json)?;
    Ok(inspected.into_iter().map(ContainerDetails::from).collect())
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "Action", default)]
    action: String,
    #[serde(rename = "Actor", default)]
    actor: Option<RawActor>,
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawActor {
    #[serde(rename = "ID")]
    id: String,
}

/// Parses one line of `docker events --format '{{json .}}'`. Untracked actions yield `None`.
pub fn parse_event_line(line: &str) -> Option<ContainerEvent> {
    let raw: RawEvent = serde_json::from_str(line).ok()?;
    let action = ContainerAction::parse(&raw.action)?;
    let container_id = raw.actor.map(|a| a.id).or(raw.id)?;
    Some(ContainerEvent::new(container_id, action))
}

/// Turns build output into non-decreasing progress from its `[k/n]` step markers.
#[derive(Debug, Default)]
pub struct BuildProgress {
    current: f32,
}

impl BuildProgress {
    /// Returns the new progress when the line moves it forward.
    pub fn observe(&mut self, line: &str) -> Option<f32> {
        let caps = BUILD_STEP_RE.captures(line)?;
        let step: f32 = caps[1].parse().ok()?;
        let total: f32 = caps[2].parse().ok()?;
        if total <= 0.0 {
            return None;
        }
        let value = (step / total).min(PROGRESS_CEILING);
        if value > self.current {
            self.current = value;
            Some(value)
        } else {
            None
        }
    }
}

/// Per-layer download and extract progress of a `docker pull`, averaged over layers.
#[derive(Debug, Default)]
pub struct PullProgress {
    layers: HashMap<String, (f32, f32)>,
    current: f32,
}

fn parse_size(amount: &str, unit: &str) -> Option<f32> {
    let amount: f32 = amount.parse().ok()?;
    let scale = match unit {
        "B" => 1.0,
        "kB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        _ => return None,
    };
    Some(amount * scale)
}

fn fraction_of(status: &str) -> Option<f32> {
    let caps = PULL_BYTES_RE.captures(status)?;
    let done = parse_size(&caps[1], &caps[2])?;
    let total = parse_size(&caps[3], &caps[4])?;
    (total > 0.0).then(|| (done / total).min(PROGRESS_CEILING))
}

impl PullProgress {
    /// Returns the new overall progress when the line moves it forward.
    pub fn observe(&mut self, line: &str) -> Option<f32> {
        let caps = PULL_LINE_RE.captures(line.trim())?;
        let layer = caps[1].to_string();
        let status = &caps[2];
        let entry = self.layers.entry(layer).or_insert((0.0, 0.0));

        if status.starts_with("Downloading") {
            entry.0 = entry.0.max(fraction_of(status).unwrap_or(0.5));
        } else if status.starts_with("Verifying Checksum") || status.starts_with("Download complete") {
            entry.0 = 1.0;
        } else if status.starts_with("Extracting") {
            entry.0 = 1.0;
            entry.1 = entry.1.max(fraction_of(status).unwrap_or(0.5));
        } else if status.starts_with("Pull complete") || status.starts_with("Already exists") {
            *entry = (1.0, 1.0);
        }

        let total: f32 = self.layers.values().map(|(d, e)| (d + e) / 2.0).sum();
        let value = (total / self.layers.len() as f32).min(PROGRESS_CEILING);
        if value > self.current {
            self.current = value;
            Some(value)
        } else {
            None
        }
    }
}

/// [`DaemonGateway`] backed by the `docker` command-line client.
pub struct DockerCli {
    program: String,
}

impl DockerCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn output(&self, args: &[&str]) -> Result<Output> {
        debug!(args = ?args, "docker");
        Command::new(&self.program)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                BeamoError::daemon(
                    DaemonErrorKind::Unavailable,
                    format!("failed to run {}: {e}", self.program),
                )
            })
    }

    async fn run(&self, args: &[&str]) -> Result<Vec<u8>> {
        let output = self.output(args).await?;
        if !output.status.success() {
            return Err(failure(args, &output));
        }
        Ok(output.stdout)
    }

    async fn run_text(&self, args: &[&str]) -> Result<String> {
        let stdout = self.run(args).await?;
        Ok(String::from_utf8_lossy(&stdout).trim().to_string())
    }

    /// Runs a long command, feeding every output line to `on_line`.
    async fn run_streaming(&self, args: &[&str], mut on_line: impl FnMut(&str)) -> Result<()> {
        debug!(args = ?args, "docker (streaming)");
        let mut child = Command::new(&self.program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BeamoError::daemon(
                    DaemonErrorKind::Unavailable,
                    format!("failed to run {}: {e}", self.program),
                )
            })?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            let tx_out = tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = tx_out.send(line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let tx_err = tx;
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = tx_err.send(line);
                }
            });
        }

        let mut tail = VecDeque::with_capacity(BUILD_TAIL_LINES);
        while let Some(line) = rx.recv().await {
            on_line(&line);
            if tail.len() == BUILD_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }

        let status = child.wait().await?;
        if !status.success() {
            let text = Vec::from(tail).join("\n");
            return Err(BeamoError::daemon(
                classify_daemon_error(&text),
                format!(
                    "docker {} failed (exit {}): {text}",
                    args.first().copied().unwrap_or_default(),
                    status.code().unwrap_or(-1)
                ),
            ));
        }
        Ok(())
    }
}

fn failure(args: &[&str], output: &Output) -> BeamoError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    BeamoError::daemon(
        classify_daemon_error(&stderr),
        format!(
            "docker {} failed (exit {}): {}",
            args.join(" "),
            output.status.code().unwrap_or(-1),
            stderr.trim()
        ),
    )
}

#[async_trait]
impl DaemonGateway for DockerCli {
    async fn list_containers(&self) -> Result<Vec<ContainerDetails>> {
        let ids = self.run_text(&["ps", "-aq", "--no-trunc"]).await?;
        let ids: Vec<&str> = ids.lines().filter(|l| !l.is_empty()).collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut args = vec!["container", "inspect"];
        args.extend(ids.iter().copied());
        let output = self.output(&args).await?;
        // A container removed between `ps` and `inspect` fails the command but the
        // others are still printed.
        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            if stdout.trim().is_empty() {
                return Err(failure(&args, &output));
            }
            warn!(
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "some containers vanished during listing"
            );
        }
        parse_inspect_output(&String::from_utf8_lossy(&output.stdout))
    }

    async fn inspect_container(&self, container_id: &str) -> Result<ContainerDetails> {
        let json = self.run_text(&["container", "inspect", container_id]).await?;
        parse_inspect_output(&json)?.into_iter().next().ok_or_else(|| {
            BeamoError::daemon(
                DaemonErrorKind::NoSuchContainer,
                format!("no such container: {container_id}"),
            )
        })
    }

    async fn inspect_image(&self, reference: &str) -> Result<String> {
        self.run_text(&["image", "inspect", "--format", "{{.Id}}", reference])
            .await
    }

    async fn build_image(&self, request: &BuildRequest, progress: ProgressFn<'_>) -> Result<String> {
        let mut tracker = BuildProgress::default();
        self.run_streaming(
            &[
                "build",
                "-t",
                &request.tag,
                "-f",
                &request.dockerfile_path,
                "--progress=plain",
                &request.context_path,
            ],
            |line| {
                if let Some(value) = tracker.observe(line) {
                    progress(value);
                }
            },
        )
        .await?;
        let image_id = self.inspect_image(&request.tag).await?;
        progress(1.0);
        Ok(image_id)
    }

    async fn pull_image(&self, reference: &str, progress: ProgressFn<'_>) -> Result<String> {
        let mut tracker = PullProgress::default();
        self.run_streaming(&["pull", reference], |line| {
            if let Some(value) = tracker.observe(line) {
                progress(value);
            }
        })
        .await?;
        let image_id = self.inspect_image(reference).await?;
        progress(1.0);
        Ok(image_id)
    }

    async fn export_image(&self, image_id: &str) -> Result<Vec<u8>> {
        self.run(&["image", "save", image_id]).await
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let args = build_create_args(spec);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_text(&args).await
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        self.run(&["start", container_id]).await?;
        Ok(())
    }

    async fn stop_container(&self, container_id: &str) -> Result<()> {
        self.run(&["stop", container_id]).await?;
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        self.run(&["rm", "-f", container_id]).await?;
        Ok(())
    }

    async fn remove_image(&self, image_id: &str) -> Result<()> {
        self.run(&["image", "rm", "-f", image_id]).await?;
        Ok(())
    }

    async fn subscribe_events(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<ContainerEvent>> {
        let mut child = Command::new(&self.program)
            .args(["events", "--filter", "type=container", "--format", "{{json .}}"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BeamoError::daemon(
                    DaemonErrorKind::Unavailable,
                    format!("failed to run {}: {e}", self.program),
                )
            })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            BeamoError::daemon(DaemonErrorKind::Failed, "docker events has no stdout")
        })?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tx.closed() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            let Some(event) = parse_event_line(&line) else {
                                continue;
                            };
                            debug!(container = %event.container_id, action = ?event.action, "daemon event");
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            warn!("docker event stream ended");
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to read docker event stream");
                            break;
                        }
                    },
                }
            }
            let _ = child.kill().await;
        });

        Ok(rx)
    }
}
