use std::{collections::BTreeMap, process::Stdio, time::Duration};

use berth_lifecycle::IsolationKey;
use chrono::SecondsFormat;
use tokio::{io::AsyncReadExt, process::Command};

use crate::{
    ContainerRuntime, ContainerSpec, ContainerState, EventFilter, EventStream, LABEL_ISOLATION_KEY,
    LABEL_MANAGED_BY, LogQuery, MANAGED_BY_VALUE, ManagedContainer, RuntimeError,
};

const EVENT_READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct DockerConfig {
    pub bin: String,
    /// Upper bound for every one-shot CLI call.
    pub timeout: Duration,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            bin: "docker".to_string(),
            timeout: Duration::from_secs(15),
        }
    }
}

/// [`ContainerRuntime`] backed by the `docker` CLI.
#[derive(Debug, Clone, Default)]
pub struct DockerRuntime {
    config: DockerConfig,
}

impl DockerRuntime {
    pub fn new(config: DockerConfig) -> Self {
        Self { config }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.bin);
        cmd.env_remove("DOCKER_API_VERSION")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self, op: &str, subject: &str, args: &[String]) -> Result<String, RuntimeError> {
        let mut cmd = self.command();
        cmd.args(args);

        let out = match tokio::time::timeout(self.config.timeout, cmd.output()).await {
            Ok(res) => res.map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    RuntimeError::Unavailable(format!("`{}` not found in PATH", self.config.bin))
                } else {
                    RuntimeError::Io(e)
                }
            })?,
            Err(_) => {
                return Err(RuntimeError::Timeout {
                    op: op.to_string(),
                    after: self.config.timeout,
                });
            }
        };

        if out.status.success() {
            return Ok(String::from_utf8_lossy(&out.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
        Err(classify_failure(op, subject, out.status.code(), stderr))
    }
}

fn classify_failure(op: &str, subject: &str, code: Option<i32>, stderr: String) -> RuntimeError {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("no such container") || lower.contains("no such object") {
        return RuntimeError::NotFound(subject.to_string());
    }
    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("error during connect")
    {
        return RuntimeError::Unavailable(stderr);
    }
    RuntimeError::Command {
        op: op.to_string(),
        code,
        stderr,
    }
}

pub(crate) fn build_create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut out = Vec::<String>::new();

    out.push("create".to_string());
    out.push("--init".to_string());
    out.push("--name".to_string());
    out.push(spec.name.clone());
    out.push("--restart".to_string());
    out.push("no".to_string());
    out.push("--security-opt".to_string());
    out.push("no-new-privileges:true".to_string());

    if let Some(mem) = spec.memory_bytes.filter(|v| *v > 0) {
        out.push("--memory".to_string());
        out.push(mem.to_string());
    }
    if let Some(pids) = spec.pids_limit.filter(|v| *v > 0) {
        out.push("--pids-limit".to_string());
        out.push(pids.to_string());
    }
    if let Some(port) = spec.gateway_port {
        out.push("--publish".to_string());
        out.push(format!("127.0.0.1:{port}:{port}"));
    }

    for m in &spec.mounts {
        let mut value = format!(
            "type=bind,source={},target={}",
            m.source.display(),
            m.target
        );
        if m.read_only {
            value.push_str(",readonly");
        }
        out.push("--mount".to_string());
        out.push(value);
    }

    for (k, v) in &spec.env {
        out.push("--env".to_string());
        out.push(format!("{k}={v}"));
    }

    out.push("--label".to_string());
    out.push(format!("{LABEL_MANAGED_BY}={MANAGED_BY_VALUE}"));
    for (k, v) in &spec.labels {
        if k == LABEL_MANAGED_BY {
            continue;
        }
        out.push("--label".to_string());
        out.push(format!("{k}={v}"));
    }

    out.push(spec.image.clone());
    out
}

/// `--since` keeps nanoseconds so a restart in the same second does not
/// replay the previous run's lines.
pub(crate) fn build_logs_args(container_ref: &str, query: &LogQuery) -> Vec<String> {
    let mut args = vec!["logs".to_string()];
    if query.tail > 0 {
        args.push("--tail".to_string());
        args.push(query.tail.to_string());
    }
    if let Some(since) = query.since {
        args.push("--since".to_string());
        args.push(since.to_rfc3339_opts(SecondsFormat::Nanos, true));
    }
    args.push(container_ref.to_string());
    args
}

pub(crate) fn build_events_args(filter: &EventFilter) -> Vec<String> {
    let mut out = vec![
        "events".to_string(),
        "--format".to_string(),
        "{{json .}}".to_string(),
        "--filter".to_string(),
        "type=container".to_string(),
    ];
    for (k, v) in &filter.labels {
        out.push("--filter".to_string());
        out.push(format!("label={k}={v}"));
    }
    for action in &filter.actions {
        out.push("--filter".to_string());
        out.push(format!("event={action}"));
    }
    out
}

#[derive(Debug, serde::Deserialize)]
struct InspectState {
    #[serde(rename = "Running", default)]
    running: bool,
    #[serde(rename = "ExitCode", default)]
    exit_code: Option<i64>,
}

pub(crate) fn parse_inspect_state(raw: &str) -> Result<ContainerState, RuntimeError> {
    let state: InspectState = serde_json::from_str(raw.trim())
        .map_err(|e| RuntimeError::Parse(format!("inspect state: {e}")))?;
    Ok(ContainerState {
        running: state.running,
        // Docker reports 0 for containers that never exited; it only means
        // something once the container stopped.
        exit_code: if state.running { None } else { state.exit_code },
    })
}

#[derive(Debug, serde::Deserialize)]
struct PsLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names", default)]
    names: String,
    #[serde(rename = "Labels", default)]
    labels: String,
    #[serde(rename = "State", default)]
    state: String,
}

pub(crate) fn parse_label_list(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            let k = k.trim();
            if k.is_empty() {
                return None;
            }
            Some((k.to_string(), v.trim().to_string()))
        })
        .collect()
}

pub(crate) fn parse_ps_output(raw: &str) -> Vec<ManagedContainer> {
    let mut out = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let row: PsLine = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(%err, line, "skipping unparseable docker ps row");
                continue;
            }
        };
        let labels = parse_label_list(&row.labels);
        out.push(ManagedContainer {
            container_ref: row.id,
            name: row.names,
            isolation_key: labels
                .get(LABEL_ISOLATION_KEY)
                .filter(|v| !v.is_empty())
                .map(|v| IsolationKey::from_raw(v.clone())),
            running: row.state.eq_ignore_ascii_case("running"),
        });
    }
    out
}

#[async_trait::async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<String, RuntimeError> {
        let args = ["version", "--format", "{{.Server.Version}}"].map(String::from);
        let out = self.run("docker version", "-", &args).await?;
        Ok(out.trim().to_string())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let out = self
            .run("docker create", &spec.name, &build_create_args(spec))
            .await?;
        let id = out.trim().lines().last().unwrap_or_default().trim().to_string();
        if id.is_empty() {
            return Err(RuntimeError::Parse("docker create printed no container id".to_string()));
        }
        Ok(id)
    }

    async fn start(&self, container_ref: &str) -> Result<(), RuntimeError> {
        let args = ["start".to_string(), container_ref.to_string()];
        self.run("docker start", container_ref, &args).await?;
        Ok(())
    }

    async fn stop(&self, container_ref: &str, timeout: Duration) -> Result<(), RuntimeError> {
        let args = [
            "stop".to_string(),
            "--time".to_string(),
            timeout.as_secs().max(1).to_string(),
            container_ref.to_string(),
        ];
        self.run("docker stop", container_ref, &args).await?;
        Ok(())
    }

    async fn remove(&self, container_ref: &str) -> Result<(), RuntimeError> {
        let args = [
            "rm".to_string(),
            "--force".to_string(),
            container_ref.to_string(),
        ];
        match self.run("docker rm", container_ref, &args).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn get_status(&self, container_ref: &str) -> Result<Option<ContainerState>, RuntimeError> {
        let args = [
            "inspect".to_string(),
            "--type".to_string(),
            "container".to_string(),
            "--format".to_string(),
            "{{json .State}}".to_string(),
            container_ref.to_string(),
        ];
        match self.run("docker inspect", container_ref, &args).await {
            Ok(out) => parse_inspect_state(&out).map(Some),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_logs(&self, container_ref: &str, query: &LogQuery) -> Result<String, RuntimeError> {
        let args = build_logs_args(container_ref, query);
        let mut cmd = self.command();
        cmd.args(&args);
        let out = match tokio::time::timeout(self.config.timeout, cmd.output()).await {
            Ok(res) => res?,
            Err(_) => {
                return Err(RuntimeError::Timeout {
                    op: "docker logs".to_string(),
                    after: self.config.timeout,
                });
            }
        };
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            return Err(classify_failure("docker logs", container_ref, out.status.code(), stderr));
        }

        // Containers write to both streams; readiness matching only needs the text.
        let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
        if !out.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&String::from_utf8_lossy(&out.stderr));
        }
        Ok(text)
    }

    async fn subscribe_events(&self, filter: &EventFilter) -> Result<EventStream, RuntimeError> {
        let mut cmd = self.command();
        cmd.args(build_events_args(filter)).stderr(Stdio::null());

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RuntimeError::Unavailable(format!("`{}` not found in PATH", self.config.bin))
            } else {
                RuntimeError::Io(e)
            }
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::Parse("docker events has no stdout".to_string()))?;

        // The child lives in the stream state; dropping the stream kills it.
        let stream = futures_util::stream::unfold(Some((child, stdout)), |state| async move {
            let (child, mut stdout) = state?;
            let mut buf = vec![0u8; EVENT_READ_CHUNK];
            match stdout.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    Some((Ok(buf), Some((child, stdout))))
                }
                Err(e) => Some((Err(RuntimeError::Io(e)), None)),
            }
        });

        Ok(Box::pin(stream))
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, RuntimeError> {
        let args = [
            "ps".to_string(),
            "--all".to_string(),
            "--no-trunc".to_string(),
            "--filter".to_string(),
            format!("label={LABEL_MANAGED_BY}={MANAGED_BY_VALUE}"),
            "--format".to_string(),
            "{{json .}}".to_string(),
        ];
        let out = self.run("docker ps", "-", &args).await?;
        Ok(parse_ps_output(&out))
    }
}
