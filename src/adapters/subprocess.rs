//! Adapter that shells out to an external tool command.
//!
//! Invocation contract: `<base_cmd...> call <tool> <method> --json-args-file
//! <path>`. Arguments are written to a 0600-mode temp file (POSIX) rather
//! than passed on the command line. On exit 0, stdout must be a single JSON
//! document. All expected subprocess failures surface as operational errors
//! with stable codes; stderr excerpts are redacted and truncated before they
//! are attached to error details.

use crate::adapters::{Capability, DispatchAdapter, capability_set};
use crate::core::error::{ErrorCode, PortunusError};
use crate::core::redact;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct SubprocessConfig {
    pub base_cmd: Vec<String>,
    pub adapter_id: Option<String>,
    pub timeout: Duration,
    pub cwd: Option<PathBuf>,
    pub env: Option<BTreeMap<String, String>>,
    /// Caps applied to excerpts attached to events and error details; the
    /// full stdout is always used for JSON parsing.
    pub max_stdout_chars: usize,
    pub max_stderr_chars: usize,
    pub cleanup_retry_delay: Duration,
}

impl SubprocessConfig {
    pub fn new(base_cmd: Vec<String>) -> Self {
        SubprocessConfig {
            base_cmd,
            adapter_id: None,
            timeout: Duration::from_secs(30),
            cwd: None,
            env: None,
            max_stdout_chars: 4096,
            max_stderr_chars: 2048,
            cleanup_retry_delay: Duration::from_millis(100),
        }
    }
}

#[derive(Debug)]
pub struct SubprocessAdapter {
    adapter_id: String,
    config: SubprocessConfig,
    capabilities: BTreeSet<Capability>,
    last_cleanup_failed: AtomicBool,
}

impl SubprocessAdapter {
    pub fn new(config: SubprocessConfig) -> Result<Self, PortunusError> {
        let Some(program) = config.base_cmd.first() else {
            return Err(PortunusError::Config(
                "Subprocess base_cmd must not be empty".to_string(),
            ));
        };
        let adapter_id = match &config.adapter_id {
            Some(id) => id.clone(),
            None => {
                let basename = Path::new(program)
                    .file_name()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| program.clone());
                format!("subprocess:{basename}")
            }
        };
        Ok(SubprocessAdapter {
            adapter_id,
            config,
            capabilities: capability_set(&[
                Capability::Apply,
                Capability::Timeout,
                Capability::External,
            ]),
            last_cleanup_failed: AtomicBool::new(false),
        })
    }

    /// Whether the most recent call failed to delete its temp file even
    /// after the retry. Reset at the start of each call.
    pub fn last_cleanup_failed(&self) -> bool {
        self.last_cleanup_failed.load(Ordering::SeqCst)
    }

    fn validate_env(&self) -> Result<(), PortunusError> {
        let Some(env) = &self.config.env else {
            return Ok(());
        };
        for (key, value) in env {
            if key.is_empty() || key.contains('=') || key.contains('\0') || value.contains('\0') {
                return Err(PortunusError::operational_with(
                    ErrorCode::EnvInvalid,
                    format!("Invalid environment entry '{}'", redact::redact_text(key)),
                    serde_json::json!({ "key": redact::redact_text(key) }),
                ));
            }
        }
        Ok(())
    }

    fn validate_cwd(&self) -> Result<(), PortunusError> {
        let Some(cwd) = &self.config.cwd else {
            return Ok(());
        };
        if !cwd.exists() {
            return Err(PortunusError::operational_with(
                ErrorCode::CwdNotFound,
                format!("Working directory does not exist: {}", cwd.display()),
                serde_json::json!({ "cwd": cwd.to_string_lossy() }),
            ));
        }
        if !cwd.is_dir() {
            return Err(PortunusError::operational_with(
                ErrorCode::CwdNotDirectory,
                format!("Working directory is not a directory: {}", cwd.display()),
                serde_json::json!({ "cwd": cwd.to_string_lossy() }),
            ));
        }
        Ok(())
    }

    fn write_args_file(&self, args: &JsonValue) -> Result<tempfile::TempPath, PortunusError> {
        let mut file = tempfile::Builder::new()
            .prefix("portunus-args-")
            .suffix(".json")
            .tempfile()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(file.path(), perms)?;
        }
        file.write_all(serde_json::to_string(args).unwrap_or_default().as_bytes())?;
        file.flush()?;
        Ok(file.into_temp_path())
    }

    fn cleanup_args_file(&self, temp_path: tempfile::TempPath) {
        let path = temp_path.to_path_buf();
        if temp_path.close().is_ok() {
            return;
        }
        thread::sleep(self.config.cleanup_retry_delay);
        if std::fs::remove_file(&path).is_err() && path.exists() {
            self.last_cleanup_failed.store(true, Ordering::SeqCst);
        }
    }

    fn spawn(&self, tool: &str, method: &str, args_path: &Path) -> Result<Child, PortunusError> {
        let mut command = Command::new(&self.config.base_cmd[0]);
        command
            .args(&self.config.base_cmd[1..])
            .arg("call")
            .arg(tool)
            .arg(method)
            .arg("--json-args-file")
            .arg(args_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &self.config.cwd {
            command.current_dir(cwd);
        }
        if let Some(env) = &self.config.env {
            command.envs(env);
        }
        command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PortunusError::operational_with(
                ErrorCode::CommandNotFound,
                format!("Command not found: {}", self.config.base_cmd[0]),
                serde_json::json!({ "command": self.config.base_cmd[0] }),
            ),
            std::io::ErrorKind::PermissionDenied => PortunusError::operational_with(
                ErrorCode::PermissionDenied,
                format!("Permission denied running: {}", self.config.base_cmd[0]),
                serde_json::json!({ "command": self.config.base_cmd[0] }),
            ),
            _ => e.into(),
        })
    }

    fn run_child(&self, mut child: Child) -> Result<(i32, String, String), PortunusError> {
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_reader = thread::spawn(move || read_pipe(stdout));
        let stderr_reader = thread::spawn(move || read_pipe(stderr));

        let deadline = Instant::now() + self.config.timeout;
        let status = loop {
            match child.try_wait()? {
                Some(status) => break status,
                None if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    // Drain the readers so the threads do not leak.
                    let _ = stdout_reader.join();
                    let _ = stderr_reader.join();
                    return Err(PortunusError::operational_with(
                        ErrorCode::Timeout,
                        format!(
                            "Subprocess timed out after {} ms",
                            self.config.timeout.as_millis()
                        ),
                        serde_json::json!({ "timeout_ms": self.config.timeout.as_millis() as u64 }),
                    ));
                }
                None => thread::sleep(POLL_INTERVAL),
            }
        };

        let stdout = stdout_reader.join().unwrap_or_default();
        let stderr = stderr_reader.join().unwrap_or_default();
        Ok((status.code().unwrap_or(-1), stdout, stderr))
    }

    fn stderr_excerpt(&self, stderr: &str) -> String {
        redact::redact_text(&truncate_chars(stderr, self.config.max_stderr_chars))
    }

    fn excerpt_for_json_error(&self, output: &str) -> String {
        let excerpt = head_tail_excerpt(output, 200, 100);
        redact::redact_text(&truncate_chars(&excerpt, self.config.max_stdout_chars))
    }
}

impl DispatchAdapter for SubprocessAdapter {
    fn adapter_id(&self) -> &str {
        &self.adapter_id
    }

    fn adapter_kind(&self) -> &str {
        "subprocess"
    }

    fn capabilities(&self) -> &BTreeSet<Capability> {
        &self.capabilities
    }

    fn call(
        &self,
        tool: &str,
        method: &str,
        args: &JsonValue,
    ) -> Result<JsonValue, PortunusError> {
        self.last_cleanup_failed.store(false, Ordering::SeqCst);
        self.validate_env()?;
        self.validate_cwd()?;

        let args_path = self.write_args_file(args)?;
        let result = self
            .spawn(tool, method, &args_path)
            .and_then(|child| self.run_child(child));
        self.cleanup_args_file(args_path);

        let (code, stdout, stderr) = result?;
        if code != 0 {
            return Err(PortunusError::operational_with(
                ErrorCode::NonzeroExit,
                format!("Subprocess exited with code {code}"),
                serde_json::json!({
                    "returncode": code,
                    "stderr_excerpt": self.stderr_excerpt(&stderr),
                }),
            ));
        }

        serde_json::from_str(&stdout).map_err(|e| {
            PortunusError::operational_with(
                ErrorCode::InvalidJsonOutput,
                format!("Subprocess stdout is not valid JSON: {e}"),
                serde_json::json!({ "stdout_excerpt": self.excerpt_for_json_error(&stdout) }),
            )
        })
    }
}

fn read_pipe<R: Read>(pipe: Option<R>) -> String {
    let Some(mut pipe) = pipe else {
        return String::new();
    };
    let mut buf = Vec::new();
    let _ = pipe.read_to_end(&mut buf);
    String::from_utf8_lossy(&buf).to_string()
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let kept: String = s.chars().take(max).collect();
    let dropped = s.chars().count() - max;
    format!("{kept}...[{dropped} chars truncated]")
}

/// Head and tail of a long output, with the skipped middle counted.
fn head_tail_excerpt(s: &str, head: usize, tail: usize) -> String {
    let total = s.chars().count();
    if total <= head + tail {
        return s.to_string();
    }
    let head_part: String = s.chars().take(head).collect();
    let tail_part: String = s.chars().skip(total - tail).collect();
    format!("{head_part}...[{} chars]...{tail_part}", total - head - tail)
}
