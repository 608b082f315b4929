//! Process-backed engine adapter.
//!
//! Wraps an external document-parsing command line as an
//! [`EngineAdapter`]. The command template is invoked once per task with
//! the input path, an options JSON file, and the output directory; the
//! adapter polls the child for exit while honoring cooperative
//! cancellation, then expects `output.md` (and optionally `output.json`)
//! to exist under the output directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::time::sleep;
use tracing::{debug, warn};

use super::trait_def::{CancelSignal, EngineAdapter};
use super::types::{EngineError, ParseOutcome};

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Engine adapter that shells out to an external command per parse.
///
/// The command is invoked as:
///
/// ```text
/// <binary> <args...> --input <input> --options <options.json> --output-dir <output_dir>
/// ```
///
/// `args` are any fixed flags the backend needs (e.g. a model name); the
/// positional `--input`/`--options`/`--output-dir` flags are always
/// appended.
#[derive(Clone)]
pub struct ProcessEngineAdapter {
    backend_name: String,
    binary: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ProcessEngineAdapter {
    /// Create an adapter for `backend_name` that invokes `binary` with
    /// `args`, bounded by `timeout` for the whole parse.
    pub fn new(
        backend_name: impl Into<String>,
        binary: impl Into<String>,
        args: Vec<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            backend_name: backend_name.into(),
            binary: binary.into(),
            args,
            timeout,
        }
    }

    async fn write_options_file(
        &self,
        output_dir: &Path,
        options: &serde_json::Value,
    ) -> Result<PathBuf, EngineError> {
        let options_path = output_dir.join("options.json");
        let body = serde_json::to_vec_pretty(options)
            .map_err(|e| EngineError::Permanent(format!("failed to serialize options: {e}")))?;

        let mut file = tokio::fs::File::create(&options_path)
            .await
            .map_err(|e| EngineError::Transient(format!("failed to create options file: {e}")))?;
        file.write_all(&body)
            .await
            .map_err(|e| EngineError::Transient(format!("failed to write options file: {e}")))?;

        Ok(options_path)
    }

    async fn terminate(&self, child: &mut Child) {
        let Some(pid) = child.id() else {
            return;
        };

        #[cfg(unix)]
        {
            // SAFETY: pid is a valid u32 from a child we spawned.
            let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if ret != 0 {
                warn!(pid, "SIGTERM failed, proceeding to SIGKILL");
            }
        }

        let exited = tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await;
        if exited.is_err() {
            debug!(pid, "process did not exit after SIGTERM, sending SIGKILL");
            let _ = child.kill().await;
        }
    }
}

#[async_trait::async_trait]
impl EngineAdapter for ProcessEngineAdapter {
    fn name(&self) -> &str {
        &self.backend_name
    }

    async fn parse(
        &self,
        input: &Path,
        options: &serde_json::Value,
        output_dir: &Path,
        cancel: &dyn CancelSignal,
    ) -> Result<ParseOutcome, EngineError> {
        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|e| EngineError::Transient(format!("failed to create output dir: {e}")))?;

        let options_path = self.write_options_file(output_dir, options).await?;

        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.args)
            .arg("--input")
            .arg(input)
            .arg("--options")
            .arg(&options_path)
            .arg("--output-dir")
            .arg(output_dir)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| EngineError::Transient(format!("failed to spawn '{}': {e}", self.binary)))?;

        let deadline = tokio::time::Instant::now() + self.timeout;

        let status = loop {
            if cancel.is_cancelled() {
                self.terminate(&mut child).await;
                return Err(EngineError::Transient("task cancelled".to_string()));
            }

            if tokio::time::Instant::now() >= deadline {
                self.terminate(&mut child).await;
                return Err(EngineError::Transient(format!(
                    "engine timed out after {:?}",
                    self.timeout
                )));
            }

            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    sleep(POLL_INTERVAL).await;
                }
                Err(e) => {
                    return Err(EngineError::Transient(format!(
                        "error waiting for engine process: {e}"
                    )));
                }
            }
        };

        if !status.success() {
            return Err(EngineError::Permanent(format!(
                "engine exited with status {status}"
            )));
        }

        let markdown_rel_path = PathBuf::from("output.md");
        let markdown_abs = output_dir.join(&markdown_rel_path);
        if !markdown_abs.exists() {
            return Err(EngineError::Permanent(
                "engine reported success but produced no output.md".to_string(),
            ));
        }

        let json_rel_path = {
            let candidate = PathBuf::from("output.json");
            if output_dir.join(&candidate).exists() {
                Some(candidate)
            } else {
                None
            }
        };

        Ok(ParseOutcome {
            markdown_rel_path,
            json_rel_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NeverCancelled;
    impl CancelSignal for NeverCancelled {
        fn is_cancelled(&self) -> bool {
            false
        }
    }

    struct AlwaysCancelled;
    impl CancelSignal for AlwaysCancelled {
        fn is_cancelled(&self) -> bool {
            true
        }
    }

    fn script_adapter(name: &str, script: &str, tmp: &std::path::Path) -> ProcessEngineAdapter {
        let script_path = tmp.join(format!("{name}.sh"));
        std::fs::write(&script_path, script).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        ProcessEngineAdapter::new(
            name,
            script_path.to_str().unwrap(),
            vec![],
            Duration::from_secs(10),
        )
    }

    #[tokio::test]
    async fn successful_parse_reports_outputs() {
        let tmp = tempfile::tempdir().unwrap();
        let out_dir = tmp.path().join("out");
        let adapter = script_adapter(
            "ok",
            "#!/bin/sh\nwhile [ \"$#\" -gt 0 ]; do\n  if [ \"$1\" = \"--output-dir\" ]; then shift; DIR=\"$1\"; fi\n  shift\ndone\necho md > \"$DIR/output.md\"\necho '{}' > \"$DIR/output.json\"\n",
            tmp.path(),
        );

        let outcome = adapter
            .parse(
                Path::new("/tmp/in.pdf"),
                &serde_json::json!({}),
                &out_dir,
                &NeverCancelled,
            )
            .await
            .unwrap();

        assert_eq!(outcome.markdown_rel_path, Path::new("output.md"));
        assert_eq!(outcome.json_rel_path, Some(PathBuf::from("output.json")));
    }

    #[tokio::test]
    async fn missing_markdown_output_is_permanent_error() {
        let tmp = tempfile::tempdir().unwrap();
        let out_dir = tmp.path().join("out");
        let adapter = script_adapter("no-output", "#!/bin/sh\nexit 0\n", tmp.path());

        let err = adapter
            .parse(
                Path::new("/tmp/in.pdf"),
                &serde_json::json!({}),
                &out_dir,
                &NeverCancelled,
            )
            .await
            .unwrap_err();

        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn nonzero_exit_is_permanent_error() {
        let tmp = tempfile::tempdir().unwrap();
        let out_dir = tmp.path().join("out");
        let adapter = script_adapter("fail", "#!/bin/sh\nexit 7\n", tmp.path());

        let err = adapter
            .parse(
                Path::new("/tmp/in.pdf"),
                &serde_json::json!({}),
                &out_dir,
                &NeverCancelled,
            )
            .await
            .unwrap_err();

        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn cancellation_during_run_is_transient() {
        let tmp = tempfile::tempdir().unwrap();
        let out_dir = tmp.path().join("out");
        let adapter = script_adapter("slow", "#!/bin/sh\nsleep 30\n", tmp.path());

        let err = adapter
            .parse(
                Path::new("/tmp/in.pdf"),
                &serde_json::json!({}),
                &out_dir,
                &AlwaysCancelled,
            )
            .await
            .unwrap_err();

        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn spawn_failure_is_transient() {
        let adapter = ProcessEngineAdapter::new(
            "missing",
            "/nonexistent/path/to/engine",
            vec![],
            Duration::from_secs(5),
        );
        let tmp = tempfile::tempdir().unwrap();
        let out_dir = tmp.path().join("out");

        let err = adapter
            .parse(
                Path::new("/tmp/in.pdf"),
                &serde_json::json!({}),
                &out_dir,
                &NeverCancelled,
            )
            .await
            .unwrap_err();

        assert!(err.is_transient());
    }
}
