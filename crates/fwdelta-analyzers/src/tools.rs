//! External comparator and inspector processes.
//!
//! Every tool call blocks the calling thread and is bounded by the configured
//! wall-clock limit. A timeout kills the child and is reported as a hard
//! failure for that artifact; nothing is retried.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use fwdelta_core::{FwdeltaError, ToolConfig};
use tokio::process::Command;

/// Runs an external program with a timeout and captures its stdout.
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
/// use fwdelta_analyzers::tools::ToolRunner;
///
/// let runner = ToolRunner::new(Duration::from_secs(5));
/// let out = runner.run("echo", ["hello"]).unwrap();
/// assert_eq!(out.trim(), "hello");
/// ```
#[derive(Debug, Clone, Copy)]
pub struct ToolRunner {
    timeout: Duration,
}

impl ToolRunner {
    /// Create a runner with an explicit timeout.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Create a runner using `tools.timeout_secs`.
    pub fn from_config(config: &ToolConfig) -> Self {
        Self::new(Duration::from_secs(config.timeout_secs))
    }

    /// Run `program` with `args`, returning stdout as (lossy) UTF-8.
    ///
    /// The child runs on a single-threaded tokio runtime owned by this call,
    /// so the runner can be used from plain worker threads.
    ///
    /// # Errors
    ///
    /// Returns [`FwdeltaError::Tool`] if the program cannot be started or
    /// exits unsuccessfully, and [`FwdeltaError::ToolTimeout`] if it runs
    /// past the timeout (the child is killed).
    pub fn run<I, S>(&self, program: &str, args: I) -> Result<String, FwdeltaError>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
        tracing::debug!(program, ?args, "running external tool");

        let tool_error = |message: String| FwdeltaError::Tool {
            tool: program.to_string(),
            message,
        };

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let result = runtime.block_on(async {
            let mut command = Command::new(program);
            command.args(&args).stdin(Stdio::null()).kill_on_drop(true);
            tokio::time::timeout(self.timeout, command.output()).await
        });

        let output = match result {
            Ok(output) => output.map_err(|e| tool_error(format!("failed to start: {e}")))?,
            Err(_) => {
                tracing::warn!(program, seconds = self.timeout.as_secs(), "external tool timed out, killed");
                return Err(FwdeltaError::ToolTimeout {
                    tool: program.to_string(),
                    seconds: self.timeout.as_secs(),
                });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(tool_error(format!("{}: {}", output.status, stderr.trim())));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Produces raw comparison reports for two binaries.
///
/// Implementations return the comparator's text output untouched; parsing
/// lives in [`crate::binary`].
pub trait BinaryComparator: Send + Sync {
    /// Whole-file report containing `similarity: <f> distance: <n>`.
    fn similarity_report(&self, old: &Path, new: &Path) -> Result<String, FwdeltaError>;

    /// Per-function report with `MATCH` / `UNMATCH` / `NEW` tokens.
    fn function_report(&self, old: &Path, new: &Path) -> Result<String, FwdeltaError>;
}

/// Reads named hardening properties of one binary.
pub trait HardeningInspector: Send + Sync {
    /// Property name to value, as reported.
    fn inspect(&self, binary: &Path) -> Result<BTreeMap<String, String>, FwdeltaError>;
}

/// `radiff2` backed [`BinaryComparator`].
#[derive(Debug, Clone)]
pub struct Radiff2 {
    program: String,
    runner: ToolRunner,
}

impl Radiff2 {
    /// Create a comparator from the `[tools]` table.
    pub fn from_config(config: &ToolConfig) -> Self {
        Self {
            program: config.radiff2.clone(),
            runner: ToolRunner::from_config(config),
        }
    }

    fn run(&self, mode: &str, old: &Path, new: &Path) -> Result<String, FwdeltaError> {
        let args: [OsString; 5] = [
            mode.into(),
            "-e".into(),
            "bin.relocs.apply=true".into(),
            old.into(),
            new.into(),
        ];
        self.runner.run(&self.program, args)
    }
}

impl BinaryComparator for Radiff2 {
    fn similarity_report(&self, old: &Path, new: &Path) -> Result<String, FwdeltaError> {
        self.run("-s", old, new)
    }

    fn function_report(&self, old: &Path, new: &Path) -> Result<String, FwdeltaError> {
        self.run("-AC", old, new)
    }
}

/// `checksec` backed [`HardeningInspector`].
#[derive(Debug, Clone)]
pub struct Checksec {
    program: String,
    runner: ToolRunner,
}

impl Checksec {
    /// Create an inspector from the `[tools]` table.
    pub fn from_config(config: &ToolConfig) -> Self {
        Self {
            program: config.checksec.clone(),
            runner: ToolRunner::from_config(config),
        }
    }
}

impl HardeningInspector for Checksec {
    fn inspect(&self, binary: &Path) -> Result<BTreeMap<String, String>, FwdeltaError> {
        let mut file_arg = OsString::from("--file=");
        file_arg.push(binary);
        let output = self
            .runner
            .run(&self.program, [OsString::from("--format=json"), file_arg])?;
        parse_checksec_json(&output, &binary.to_string_lossy())
    }
}

/// Extract the property map for `path` from `checksec --format=json` output.
///
/// The report is keyed by the inspected path; a report holding a single
/// entry under a different key (e.g. a canonicalized path) is accepted too.
/// Non-string values are kept in their JSON text form.
///
/// # Errors
///
/// Returns [`FwdeltaError::Parse`] if the output is not a JSON object or
/// holds no entry for `path`.
///
/// # Examples
///
/// ```
/// use fwdelta_analyzers::tools::parse_checksec_json;
///
/// let out = r#"{"/tmp/a.so": {"nx": "yes", "fortified": 3}}"#;
/// let props = parse_checksec_json(out, "/tmp/a.so").unwrap();
/// assert_eq!(props["nx"], "yes");
/// assert_eq!(props["fortified"], "3");
/// ```
pub fn parse_checksec_json(output: &str, path: &str) -> Result<BTreeMap<String, String>, FwdeltaError> {
    let value: serde_json::Value = serde_json::from_str(output)?;
    let serde_json::Value::Object(files) = value else {
        return Err(FwdeltaError::Parse("checksec output is not a JSON object".into()));
    };

    let entry = match files.get(path) {
        Some(entry) => entry,
        None if files.len() == 1 => files.values().next().ok_or_else(|| {
            FwdeltaError::Parse("checksec output is empty".into())
        })?,
        None => {
            return Err(FwdeltaError::Parse(format!(
                "checksec output has no entry for {path}"
            )))
        }
    };

    let serde_json::Value::Object(props) = entry else {
        return Err(FwdeltaError::Parse(format!(
            "checksec entry for {path} is not an object"
        )));
    };

    Ok(props
        .iter()
        .map(|(k, v)| {
            let v = match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), v)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksec_json_by_path() {
        let out = r#"{
            "/fw/new/system/bin/vold": {
                "relro": "full", "canary": "yes", "nx": "yes", "pie": "yes",
                "rpath": "no", "runpath": "no", "symbols": "no",
                "fortify_source": "yes", "fortified": "4", "fortify-able": "9"
            }
        }"#;
        let props = parse_checksec_json(out, "/fw/new/system/bin/vold").unwrap();
        assert_eq!(props.len(), 10);
        assert_eq!(props["relro"], "full");
        assert_eq!(props["fortify-able"], "9");
    }

    #[test]
    fn checksec_single_entry_under_other_key() {
        let out = r#"{"./vold": {"nx": "no"}}"#;
        let props = parse_checksec_json(out, "/abs/vold").unwrap();
        assert_eq!(props["nx"], "no");
    }

    #[test]
    fn checksec_errors() {
        assert!(parse_checksec_json("not json", "x").is_err());
        assert!(parse_checksec_json("[]", "x").is_err());
        assert!(parse_checksec_json(r#"{"a": {}, "b": {}}"#, "x").is_err());
        assert!(parse_checksec_json(r#"{"x": "yes"}"#, "x").is_err());
    }

    #[test]
    fn missing_program_is_tool_error() {
        let runner = ToolRunner::new(Duration::from_secs(1));
        let err = runner
            .run("fwdelta-definitely-missing-tool", ["--help"])
            .unwrap_err();
        assert!(matches!(err, FwdeltaError::Tool { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn captures_stdout_and_reports_failure() {
        let runner = ToolRunner::new(Duration::from_secs(10));
        let out = runner.run("sh", ["-c", "echo similarity: 1.0 distance: 0"]).unwrap();
        assert!(out.contains("distance: 0"));

        let err = runner.run("sh", ["-c", "echo boom >&2; exit 3"]).unwrap_err();
        match err {
            FwdeltaError::Tool { tool, message } => {
                assert_eq!(tool, "sh");
                assert!(message.contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn slow_tool_times_out() {
        let runner = ToolRunner::new(Duration::from_millis(200));
        let started = std::time::Instant::now();
        let err = runner.run("sleep", ["5"]).unwrap_err();
        assert!(matches!(err, FwdeltaError::ToolTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[test]
    fn timed_out_tool_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("finished");
        let script = format!("sleep 1 && touch '{}'", marker.display());

        let runner = ToolRunner::new(Duration::from_millis(100));
        let err = runner.run("sh", ["-c", script.as_str()]).unwrap_err();
        match err {
            FwdeltaError::ToolTimeout { tool, .. } => assert_eq!(tool, "sh"),
            other => panic!("unexpected error: {other}"),
        }

        std::thread::sleep(Duration::from_millis(1500));
        assert!(!marker.exists(), "killed tool kept running");
    }
}
