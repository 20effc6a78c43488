//! Container runtime client - Typed wrapper over the runtime CLI

use std::process::{Output, Stdio};

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::instance::{short_id, InstanceStatus};
use super::settings::Settings;
use crate::error::RuntimeError;

/// Operations the orchestrator needs from a container runtime
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Create and start an instance from `image`, returning its id
    async fn create(&self, image: &str) -> Result<String, RuntimeError>;

    async fn start(&self, instance_id: &str) -> Result<(), RuntimeError>;

    async fn stop(&self, instance_id: &str) -> Result<(), RuntimeError>;

    async fn restart(&self, instance_id: &str) -> Result<(), RuntimeError>;

    async fn remove(&self, instance_id: &str) -> Result<(), RuntimeError>;

    /// Report the instance status; `RuntimeError::NotFound` if it does not exist
    async fn inspect(&self, instance_id: &str) -> Result<InstanceStatus, RuntimeError>;

    /// Launch `command` inside the instance with its stdout attached
    async fn spawn_helper(
        &self,
        instance_id: &str,
        command: &[String],
    ) -> Result<HelperProcess, RuntimeError>;

    /// Terminate every process named `program` inside the instance
    async fn kill_helper(&self, instance_id: &str, program: &str) -> Result<(), RuntimeError>;
}

/// A helper process running inside an instance, read line by line.
///
/// Dropping the handle kills the process unless it was [`detach`](Self::detach)ed.
pub struct HelperProcess {
    output: Box<dyn AsyncBufRead + Send + Unpin>,
    child: Option<Child>,
}

impl HelperProcess {
    /// Wrap a spawned child whose stdout is piped
    pub fn from_child(mut child: Child) -> std::io::Result<Self> {
        let stdout = child.stdout.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "helper stdout not captured")
        })?;
        Ok(Self {
            output: Box::new(BufReader::new(stdout)),
            child: Some(child),
        })
    }

    /// Wrap any byte stream, with no process behind it
    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            output: Box::new(BufReader::new(reader)),
            child: None,
        }
    }

    /// Next output line without its line ending, or `None` at end of stream
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        let mut buf = Vec::new();
        let read = self.output.read_until(b'\n', &mut buf).await?;
        if read == 0 {
            return Ok(None);
        }
        let line = String::from_utf8_lossy(&buf);
        Ok(Some(line.trim_end_matches(['\n', '\r']).to_string()))
    }

    /// Kill the process and reap it
    pub async fn terminate(mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill credential helper: {}", e);
            }
        }
    }

    /// Leave the process running, draining its output in the background
    pub fn detach(mut self) {
        let empty: Box<dyn AsyncBufRead + Send + Unpin> = Box::new(tokio::io::empty());
        let mut output = std::mem::replace(&mut self.output, empty);
        let child = self.child.take();
        tokio::spawn(async move {
            let mut sink = Vec::new();
            loop {
                sink.clear();
                match output.read_until(b'\n', &mut sink).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            if let Some(mut child) = child {
                let _ = child.wait().await;
            }
        });
    }
}

impl Drop for HelperProcess {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
    }
}

/// Runtime client driving the docker-compatible CLI
#[derive(Debug, Clone)]
pub struct DockerCli {
    /// Executable to invoke
    binary: String,
    /// Arguments placed before every subcommand (e.g. `--context remote`)
    global_args: Vec<String>,
    /// Extra arguments for `run`
    run_args: Vec<String>,
    memory_limit: Option<String>,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            global_args: Vec::new(),
            run_args: Vec::new(),
            memory_limit: None,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            binary: settings.runtime_binary.clone(),
            global_args: settings.runtime_global_args.clone(),
            run_args: settings.run_args.clone(),
            memory_limit: settings.memory_limit.clone(),
        }
    }

    pub fn with_global_args(mut self, args: Vec<String>) -> Self {
        self.global_args = args;
        self
    }

    pub fn with_run_args(mut self, args: Vec<String>) -> Self {
        self.run_args = args;
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.global_args);
        cmd.stdin(Stdio::null());
        cmd
    }

    /// Run a subcommand to completion, capturing its output
    async fn run(&self, args: &[&str]) -> Result<Output, RuntimeError> {
        debug!("Runtime: {} {:?}", self.binary, args);
        let output = self.command().args(args).output().await?;
        Ok(output)
    }

    /// Run a lifecycle subcommand against one instance
    async fn run_on(&self, operation: &'static str, instance_id: &str) -> Result<(), RuntimeError> {
        let output = self.run(&[operation, instance_id]).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(classify_failure(operation, instance_id, &output))
        }
    }
}

/// Map a failed runtime invocation to `NotFound` or `CommandFailed`
fn classify_failure(operation: &'static str, instance_id: &str, output: &Output) -> RuntimeError {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if is_missing_instance(&stderr) {
        RuntimeError::NotFound(instance_id.to_string())
    } else {
        RuntimeError::CommandFailed {
            operation,
            code: output.status.code(),
            stderr,
        }
    }
}

fn is_missing_instance(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("no such container") || lower.contains("no such object")
}

/// Extract the instance id printed by `run -d`
fn parse_created_id(stdout: &str) -> Result<String, RuntimeError> {
    let id = stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .unwrap_or_default();
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(RuntimeError::UnexpectedOutput {
            operation: "run",
            output: stdout.to_string(),
        });
    }
    Ok(id.to_string())
}

#[async_trait]
impl RuntimeClient for DockerCli {
    async fn create(&self, image: &str) -> Result<String, RuntimeError> {
        let mut args: Vec<&str> = vec!["run", "-itd"];
        args.extend(self.run_args.iter().map(String::as_str));
        if let Some(ref memory) = self.memory_limit {
            args.push("--memory");
            args.push(memory.as_str());
        }
        args.push(image);

        let output = self.run(&args).await?;
        if !output.status.success() {
            return Err(RuntimeError::CommandFailed {
                operation: "run",
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let id = parse_created_id(&String::from_utf8_lossy(&output.stdout))?;
        debug!("Runtime created instance {} from {}", short_id(&id), image);
        Ok(id)
    }

    async fn start(&self, instance_id: &str) -> Result<(), RuntimeError> {
        self.run_on("start", instance_id).await
    }

    async fn stop(&self, instance_id: &str) -> Result<(), RuntimeError> {
        self.run_on("stop", instance_id).await
    }

    async fn restart(&self, instance_id: &str) -> Result<(), RuntimeError> {
        self.run_on("restart", instance_id).await
    }

    async fn remove(&self, instance_id: &str) -> Result<(), RuntimeError> {
        self.run_on("rm", instance_id).await
    }

    async fn inspect(&self, instance_id: &str) -> Result<InstanceStatus, RuntimeError> {
        let output = self
            .run(&["inspect", "--format", "{{.State.Status}}", instance_id])
            .await?;
        if !output.status.success() {
            // The CLI contract treats any inspect failure as absence
            return Err(RuntimeError::NotFound(instance_id.to_string()));
        }
        let status = String::from_utf8_lossy(&output.stdout);
        Ok(InstanceStatus::from_runtime(&status))
    }

    async fn spawn_helper(
        &self,
        instance_id: &str,
        command: &[String],
    ) -> Result<HelperProcess, RuntimeError> {
        let child = self
            .command()
            .arg("exec")
            .arg(instance_id)
            .args(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(HelperProcess::from_child(child)?)
    }

    async fn kill_helper(&self, instance_id: &str, program: &str) -> Result<(), RuntimeError> {
        let output = self.run(&["exec", instance_id, "pkill", program]).await?;
        match output.status.code() {
            // pkill exits 1 when nothing matched
            Some(0) | Some(1) => Ok(()),
            _ => Err(classify_failure("exec", instance_id, &output)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A runtime whose CLI is a shell script; `$1` is the subcommand.
    #[cfg(unix)]
    fn scripted(script: &str) -> DockerCli {
        DockerCli::new("sh").with_global_args(vec![
            "-c".to_string(),
            script.to_string(),
            "docker".to_string(),
        ])
    }

    #[test]
    fn test_parse_created_id_takes_last_line() {
        let out = "Unable to find image locally\nc1a2b3d4e5f6\n";
        assert_eq!(parse_created_id(out).unwrap(), "c1a2b3d4e5f6");
        assert!(parse_created_id("").is_err());
        assert!(parse_created_id("not an id\n").is_err());
    }

    #[test]
    fn test_missing_instance_detection() {
        assert!(is_missing_instance("Error response from daemon: No such container: c1a2"));
        assert!(is_missing_instance("Error: No such object: c1a2"));
        assert!(!is_missing_instance("permission denied"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_create_returns_runtime_id() {
        let cli = scripted(r#"[ "$1" = run ] && echo c1a2b3d4e5f6"#);
        assert_eq!(cli.create("ubuntu-vps").await.unwrap(), "c1a2b3d4e5f6");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_create_passes_memory_and_run_args() {
        let cli = DockerCli {
            memory_limit: Some("2g".to_string()),
            ..scripted(r#"[ "$3" = --privileged ] && [ "$5" = 2g ] && [ "$6" = img ] && echo abc123"#)
        }
        .with_run_args(vec!["--privileged".to_string()]);
        assert_eq!(cli.create("img").await.unwrap(), "abc123");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_inspect_parses_status_and_absence() {
        let cli = scripted(r#"[ "$4" = c1 ] && echo running || exit 1"#);
        assert_eq!(cli.inspect("c1").await.unwrap(), InstanceStatus::Running);
        assert!(cli.inspect("c2").await.unwrap_err().is_not_found());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_lifecycle_failure_classification() {
        let cli = scripted(
            r#"if [ "$2" = gone ]; then echo "No such container: gone" >&2; else echo "daemon down" >&2; fi; exit 1"#,
        );
        assert!(cli.stop("gone").await.unwrap_err().is_not_found());
        match cli.start("c1").await {
            Err(RuntimeError::CommandFailed { operation, stderr, .. }) => {
                assert_eq!(operation, "start");
                assert_eq!(stderr, "daemon down");
            }
            other => panic!("expected CommandFailed, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_helper_output_is_line_oriented() {
        let cli = scripted(r#"printf 'booting\nssh session: ssh abc@host\n'"#);
        let mut helper = cli.spawn_helper("c1", &["tmate".to_string()]).await.unwrap();
        assert_eq!(helper.next_line().await.unwrap().as_deref(), Some("booting"));
        assert_eq!(
            helper.next_line().await.unwrap().as_deref(),
            Some("ssh session: ssh abc@host")
        );
        assert_eq!(helper.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reader_helper_strips_crlf() {
        let mut helper = HelperProcess::from_reader(&b"one\r\ntwo"[..]);
        assert_eq!(helper.next_line().await.unwrap().as_deref(), Some("one"));
        assert_eq!(helper.next_line().await.unwrap().as_deref(), Some("two"));
        assert_eq!(helper.next_line().await.unwrap(), None);
    }
}
