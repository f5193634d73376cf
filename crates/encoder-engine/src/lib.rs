//! Wrapper around an external FFmpeg transcoder.
//!
//! The engine owns a private scratch directory that stands in for the
//! transcoder's virtual filesystem: callers stage inputs under logical file
//! names, run one command at a time, and read back produced outputs. Loading
//! is verified (binary responds to `-version`, scratch round trip works)
//! before an instance is handed out, and [`EngineSlot`] provides the
//! process-wide single-flight lazy load with a bounded retry budget.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tempfile::TempDir;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

mod slot;

pub use slot::{EngineSlot, Readiness, DEFAULT_LOAD_ATTEMPTS, LOAD_WAIT_CEILING};

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors produced by the encoder engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Encoder engine failed to load: {0}")]
    Load(String),

    #[error("Transcode produced no output file: {0}")]
    OutputMissing(String),

    #[error("Invalid virtual file name: {0}")]
    InvalidFileName(String),

    #[error("Transcode command failed (exit code {code:?}): {detail}")]
    CommandFailed { code: Option<i32>, detail: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn load(msg: impl Into<String>) -> Self {
        Self::Load(msg.into())
    }
}

/// Configuration for locating and loading the transcoder binary.
///
/// The binary is always resolved from explicit local configuration, never
/// fetched from a remote origin.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path to the ffmpeg binary.
    pub ffmpeg_path: PathBuf,
    /// Ceiling for a single load attempt.
    pub load_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: std::env::var("FFMPEG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("ffmpeg")),
            load_timeout: Duration::from_secs(60),
        }
    }
}

/// Output of one engine command.
#[derive(Debug)]
pub struct RunOutput {
    /// Exit status of the command.
    pub success: bool,
    /// Exit code, when the command terminated normally.
    pub code: Option<i32>,
    /// Diagnostic lines captured from the engine (stdout and stderr).
    pub log_lines: Vec<String>,
    /// Wall-clock execution time in seconds.
    pub duration_secs: f64,
}

/// A loaded transcoder instance.
///
/// The underlying engine is not reentrant: `run` serializes all commands
/// through an internal lock, so a second concurrent call queues behind the
/// first rather than racing it.
pub struct EncoderEngine {
    ffmpeg_path: PathBuf,
    scratch: TempDir,
    run_lock: Mutex<()>,
    log_tx: Option<mpsc::UnboundedSender<String>>,
}

impl EncoderEngine {
    /// Load and verify an engine instance.
    ///
    /// Verification runs `-version` against the configured binary and then a
    /// scratch write/read/delete round trip. Every diagnostic line emitted by
    /// later commands is forwarded to `log_tx` when provided; forwarding is
    /// best-effort.
    pub async fn load(
        config: &EngineConfig,
        log_tx: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<Self> {
        let output = Command::new(&config.ffmpeg_path)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                EngineError::load(format!(
                    "failed to start {}: {}",
                    config.ffmpeg_path.display(),
                    e
                ))
            })?;

        if !output.status.success() {
            return Err(EngineError::load(format!(
                "{} -version exited with {:?}",
                config.ffmpeg_path.display(),
                output.status.code()
            )));
        }

        let banner = String::from_utf8_lossy(&output.stdout);
        if !banner.starts_with("ffmpeg version") {
            return Err(EngineError::load(format!(
                "unexpected -version banner from {}",
                config.ffmpeg_path.display()
            )));
        }

        let engine = Self::with_scratch(config.ffmpeg_path.clone(), log_tx)?;

        // Filesystem self-check before handing the instance out.
        engine.write_input("selfcheck.txt", b"hello").await?;
        let read_back = engine.read_output("selfcheck.txt").await?;
        engine.delete_file("selfcheck.txt").await;
        if read_back.as_slice() != b"hello" {
            return Err(EngineError::load(
                "scratch filesystem round trip failed".to_string(),
            ));
        }

        debug!(path = %engine.ffmpeg_path.display(), "encoder engine loaded");
        Ok(engine)
    }

    fn with_scratch(
        ffmpeg_path: PathBuf,
        log_tx: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<Self> {
        let scratch = TempDir::with_prefix("encoder-engine-")?;
        Ok(Self {
            ffmpeg_path,
            scratch,
            run_lock: Mutex::new(()),
            log_tx,
        })
    }

    /// Construct an engine over an existing scratch dir without verifying the
    /// binary. Used by unit tests that never execute commands.
    #[cfg(test)]
    fn unverified(ffmpeg_path: PathBuf) -> Result<Self> {
        Self::with_scratch(ffmpeg_path, None)
    }

    /// Stage input bytes into the engine's virtual filesystem.
    pub async fn write_input(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.resolve(name)?;
        tokio::fs::write(&path, bytes).await?;
        debug!(name, size = bytes.len(), "staged engine input");
        Ok(())
    }

    /// Read a produced file's bytes.
    ///
    /// Fails with [`EngineError::OutputMissing`] if the command did not
    /// produce the file (e.g. the encoder died without writing it).
    pub async fn read_output(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.resolve(name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(EngineError::OutputMissing(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Best-effort removal of a staged or produced file.
    ///
    /// A leaked scratch file is a space concern within one job, not a
    /// correctness one, so failures are logged and swallowed.
    pub async fn delete_file(&self, name: &str) {
        let path = match self.resolve(name) {
            Ok(path) => path,
            Err(e) => {
                warn!(name, error = %e, "refusing to delete invalid file name");
                return;
            }
        };
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(name, error = %e, "failed to delete scratch file");
            }
        }
    }

    /// Execute one transcode command.
    ///
    /// Returns [`EngineError::CommandFailed`] on a non-zero exit, with the
    /// tail of the diagnostic stream as detail.
    pub async fn run(&self, args: &[String]) -> Result<RunOutput> {
        let output = self.run_collect(args).await?;
        if !output.success {
            let detail = output
                .log_lines
                .iter()
                .rev()
                .take(8)
                .rev()
                .cloned()
                .collect::<Vec<_>>()
                .join("\n");
            return Err(EngineError::CommandFailed {
                code: output.code,
                detail,
            });
        }
        Ok(output)
    }

    /// Probe a staged file's duration in seconds.
    ///
    /// Runs a no-output pass (`-i <name> -f null -`) and parses the
    /// `Duration: HH:MM:SS.cc` line out of the diagnostic stream, since the
    /// engine exposes no structured duration query. The pass itself is
    /// allowed to exit non-zero; only a missing duration line is an error.
    pub async fn probe_duration(&self, name: &str) -> Result<f64> {
        self.resolve(name)?;
        let args = vec![
            "-i".to_string(),
            name.to_string(),
            "-f".to_string(),
            "null".to_string(),
            "-".to_string(),
        ];
        let output = self.run_collect(&args).await?;
        parse_duration_line(&output.log_lines).ok_or_else(|| {
            EngineError::OutputMissing(format!("no duration line in probe output for {}", name))
        })
    }

    /// Run a command and collect its diagnostics without failing on a
    /// non-zero exit.
    async fn run_collect(&self, args: &[String]) -> Result<RunOutput> {
        // Engine commands never run concurrently.
        let _guard = self.run_lock.lock().await;
        let start = std::time::Instant::now();

        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(["-hide_banner", "-nostats", "-y"])
            .args(args)
            .current_dir(self.scratch.path())
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(?args, "running engine command");
        let mut child = cmd.spawn()?;

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = tx.send(line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = tx.send(line);
                }
            });
        }
        drop(tx);

        let status = child.wait().await?;

        let mut log_lines = Vec::new();
        while let Some(line) = rx.recv().await {
            if let Some(log_tx) = &self.log_tx {
                let _ = log_tx.send(line.clone());
            }
            log_lines.push(line);
        }

        Ok(RunOutput {
            success: status.success(),
            code: status.code(),
            log_lines,
            duration_secs: start.elapsed().as_secs_f64(),
        })
    }

    /// Map a logical file name into the scratch directory.
    ///
    /// Only bare file names are accepted; anything that could escape the
    /// scratch dir is rejected.
    fn resolve(&self, name: &str) -> Result<PathBuf> {
        let candidate = Path::new(name);
        let is_bare = candidate.components().count() == 1
            && candidate.file_name().is_some_and(|f| f == name)
            && name != ".."
            && name != ".";
        if !is_bare {
            return Err(EngineError::InvalidFileName(name.to_string()));
        }
        Ok(self.scratch.path().join(name))
    }
}

/// Parse a duration, in seconds, from engine diagnostic lines.
///
/// Matches the `Duration: HH:MM:SS.cc` line the engine prints while opening
/// an input.
pub fn parse_duration_line(lines: &[String]) -> Option<f64> {
    static DURATION_RE: OnceLock<Regex> = OnceLock::new();
    let re = DURATION_RE.get_or_init(|| {
        Regex::new(r"Duration:\s*(\d{2}):(\d{2}):(\d{2})\.(\d{2,3})").expect("valid regex")
    });

    for line in lines {
        if let Some(caps) = re.captures(line) {
            let hours: f64 = caps[1].parse().ok()?;
            let minutes: f64 = caps[2].parse().ok()?;
            let seconds: f64 = caps[3].parse().ok()?;
            let frac: f64 = format!("0.{}", &caps[4]).parse().ok()?;
            return Some(hours * 3600.0 + minutes * 60.0 + seconds + frac);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_engine() -> EncoderEngine {
        EncoderEngine::unverified(PathBuf::from("ffmpeg")).unwrap()
    }

    #[tokio::test]
    async fn test_write_and_read_round_trip() {
        let engine = test_engine();
        engine.write_input("input.mp4", b"not really video").await.unwrap();
        let bytes = engine.read_output("input.mp4").await.unwrap();
        assert_eq!(bytes, b"not really video");
    }

    #[tokio::test]
    async fn test_read_missing_output() {
        let engine = test_engine();
        let err = engine.read_output("compressed.mp4").await.unwrap_err();
        assert!(matches!(err, EngineError::OutputMissing(name) if name == "compressed.mp4"));
    }

    #[tokio::test]
    async fn test_delete_file_is_best_effort() {
        let engine = test_engine();
        // Deleting a file that never existed must not fail.
        engine.delete_file("ghost.webm").await;

        engine.write_input("stale.webm", b"x").await.unwrap();
        engine.delete_file("stale.webm").await;
        assert!(matches!(
            engine.read_output("stale.webm").await.unwrap_err(),
            EngineError::OutputMissing(_)
        ));
    }

    #[tokio::test]
    async fn test_rejects_escaping_file_names() {
        let engine = test_engine();
        for name in ["../evil", "a/b.mp4", "/etc/passwd", "..", "."] {
            let err = engine.write_input(name, b"x").await.unwrap_err();
            assert!(matches!(err, EngineError::InvalidFileName(_)), "{name}");
        }
    }

    #[cfg(unix)]
    fn stub_binary(dir: &Path, script: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("ffmpeg-stub");
        std::fs::write(&path, script).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_command_carries_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let stub = stub_binary(dir.path(), "#!/bin/sh\necho boom >&2\nexit 3\n");
        let engine = EncoderEngine::unverified(stub).unwrap();

        let err = engine
            .run(&["-i".to_string(), "x.mp4".to_string()])
            .await
            .unwrap_err();
        match err {
            EngineError::CommandFailed { code, detail } => {
                assert_eq!(code, Some(3));
                assert!(detail.contains("boom"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_parse_duration_line() {
        let lines = vec![
            "Input #0, mov,mp4,m4a,3gp,3g2,mj2, from 'input.mp4':".to_string(),
            "  Duration: 00:01:23.45, start: 0.000000, bitrate: 1205 kb/s".to_string(),
        ];
        let duration = parse_duration_line(&lines).unwrap();
        assert!((duration - 83.45).abs() < 1e-9);
    }

    #[test]
    fn test_parse_duration_line_millis_and_hours() {
        let lines = vec!["  Duration: 01:02:03.500, start: 0.0".to_string()];
        let duration = parse_duration_line(&lines).unwrap();
        assert!((duration - 3723.5).abs() < 1e-9);
    }

    #[test]
    fn test_parse_duration_line_absent() {
        let lines = vec!["frame=  100 fps=0.0 q=-1.0".to_string()];
        assert!(parse_duration_line(&lines).is_none());
    }
}
