//! # LXC Runtime - Container Operations via the LXC Command-Line Tools
//!
//! Implements the [`ContainerRuntime`] trait by invoking `lxc-create`,
//! `lxc-copy`, `lxc-start`, `lxc-stop`, `lxc-wait`, `lxc-attach`,
//! `lxc-info` and `lxc-destroy`.
//!
//! ## Platform Requirements
//!
//! | Requirement         | Check                       |
//! |---------------------|-----------------------------|
//! | Linux OS            | LXC tools on `PATH`         |
//! | Root                | needed by `lxc-create` etc. |
//!
//! ## Container Definitions
//!
//! Definitions live under `<lxc_path>/<name>/config` (default
//! `/var/lib/lxc`). Configuration reads and edits operate on that file
//! directly; every other operation goes through the tools so the runtime
//! keeps ownership of storage backends and cgroups.
//!
//! ## Attach Semantics
//!
//! `lxc-attach --clear-env` is used so the attached process sees only the
//! environment the caller passes. stdout and stderr are both streamed into
//! the caller's sink as they arrive. The attached process is never killed
//! when the returned future is dropped.
//!
//! [`ContainerRuntime`]: crate::runtime::ContainerRuntime

use crate::constants::{LXC_PATH, NETWORK_POLL_INTERVAL};
use crate::error::{Error, Result};
use crate::runtime::{AttachOptions, ContainerRuntime, ContainerStatus, OutputSink};
use async_trait::async_trait;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Read buffer size for attached process output.
const OUTPUT_READ_BUF: usize = 8192;

/// LXC runtime driven through the `lxc-*` tools.
#[derive(Debug, Clone)]
pub struct LxcRuntime {
    lxc_path: PathBuf,
}

impl LxcRuntime {
    /// Creates a runtime using the default definition directory.
    pub fn new() -> Self {
        Self::with_lxc_path(PathBuf::from(LXC_PATH))
    }

    /// Creates a runtime using a custom definition directory.
    pub fn with_lxc_path(lxc_path: PathBuf) -> Self {
        Self { lxc_path }
    }

    /// Returns the definition directory.
    pub fn lxc_path(&self) -> &Path {
        &self.lxc_path
    }

    fn config_path(&self, name: &str) -> PathBuf {
        self.lxc_path.join(name).join("config")
    }

    fn tool(&self, tool: &str) -> Command {
        let mut cmd = Command::new(tool);
        cmd.arg("-P").arg(&self.lxc_path);
        cmd
    }

    /// Runs a tool to completion and fails on non-zero exit.
    async fn run_tool(&self, tool: &str, args: &[&str]) -> Result<String> {
        debug!("Running {} {:?}", tool, args);
        let output = self
            .tool(tool)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::RuntimeCommandFailed {
                command: tool.to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(Error::RuntimeCommandFailed {
                command: format!("{} {}", tool, args.join(" ")),
                reason: format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn read_config(&self, name: &str) -> Result<String> {
        let path = self.config_path(name);
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::RuntimeCommandFailed {
                command: format!("read {}", path.display()),
                reason: e.to_string(),
            })
    }

    async fn write_config(&self, name: &str, contents: &str) -> Result<()> {
        let path = self.config_path(name);
        tokio::fs::write(&path, contents)
            .await
            .map_err(|e| Error::RuntimeCommandFailed {
                command: format!("write {}", path.display()),
                reason: e.to_string(),
            })
    }
}

impl Default for LxcRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for LxcRuntime {
    fn name(&self) -> &str {
        "lxc"
    }

    async fn is_defined(&self, name: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.config_path(name)).await?)
    }

    async fn status(&self, name: &str) -> Result<ContainerStatus> {
        let out = self.run_tool("lxc-info", &["-n", name, "-s", "-H"]).await?;
        Ok(ContainerStatus::parse(&out))
    }

    async fn create(&self, name: &str, template: &str, args: &[String]) -> Result<()> {
        let mut argv = vec!["-n", name, "-t", template, "--"];
        argv.extend(args.iter().map(String::as_str));
        self.run_tool("lxc-create", &argv).await?;
        info!("Created container {} from template {}", name, template);
        Ok(())
    }

    async fn clone_snapshot(&self, base: &str, name: &str) -> Result<()> {
        // -s: copy-on-write snapshot, -K: keep the base hostname
        self.run_tool("lxc-copy", &["-n", base, "-N", name, "-s", "-K"])
            .await?;
        info!("Cloned container {} from {}", name, base);
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.run_tool("lxc-start", &["-n", name, "-d"]).await?;
        info!("Started container {}", name);
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.run_tool("lxc-stop", &["-n", name, "-k"]).await?;
        info!("Stopped container {}", name);
        Ok(())
    }

    async fn wait_for_state(
        &self,
        name: &str,
        state: ContainerStatus,
        timeout: Duration,
    ) -> Result<bool> {
        let secs = timeout.as_secs().max(1).to_string();
        let state = state.to_string();
        match self
            .run_tool("lxc-wait", &["-n", name, "-s", &state, "-t", &secs])
            .await
        {
            Ok(_) => Ok(true),
            Err(Error::RuntimeCommandFailed { reason, .. }) => {
                debug!("lxc-wait for {} on {} gave up: {}", state, name, reason);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn attach_run(
        &self,
        name: &str,
        command: &[String],
        opts: &AttachOptions,
        sink: &dyn OutputSink,
    ) -> Result<i32> {
        if command.is_empty() {
            return Err(Error::RuntimeCommandFailed {
                command: "lxc-attach".to_string(),
                reason: "empty command".to_string(),
            });
        }

        let mut cmd = self.tool("lxc-attach");
        cmd.arg("-n").arg(name).arg("--clear-env");
        for (key, value) in &opts.env {
            cmd.arg("-v").arg(format!("{}={}", key, value));
        }
        cmd.arg("--");

        // lxc-attach has no working-directory flag
        if let Some(ref cwd) = opts.cwd {
            cmd.arg("/bin/sh")
                .arg("-c")
                .arg("cd \"$0\" && exec \"$@\"")
                .arg(cwd);
        }
        cmd.args(command);

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::RuntimeCommandFailed {
                command: "lxc-attach".to_string(),
                reason: e.to_string(),
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let run = async {
            tokio::join!(pump_output(stdout, sink), pump_output(stderr, sink));
            child.wait().await
        };

        let status = match opts.timeout {
            Some(limit) => tokio::time::timeout(limit, run)
                .await
                .map_err(|_| Error::Timeout {
                    operation: format!("attach {:?} in container {}", command, name),
                    duration: limit,
                })?,
            None => run.await,
        }
        .map_err(|e| Error::RuntimeCommandFailed {
            command: "lxc-attach".to_string(),
            reason: e.to_string(),
        })?;

        let code = exit_code(status);
        debug!("Attached command in {} exited with {}", name, code);
        Ok(code)
    }

    async fn network_address(&self, name: &str, timeout: Duration) -> Result<Option<IpAddr>> {
        let start = Instant::now();
        loop {
            if let Ok(out) = self.run_tool("lxc-info", &["-n", name, "-i", "-H"]).await
                && let Some(addr) = first_ipv4(&out)
            {
                return Ok(Some(addr));
            }

            if start.elapsed() >= timeout {
                return Ok(None);
            }
            tokio::time::sleep(NETWORK_POLL_INTERVAL).await;
        }
    }

    async fn config_get(&self, name: &str, key: &str) -> Result<Option<String>> {
        let contents = self.read_config(name).await?;
        Ok(config_lookup(&contents, key))
    }

    async fn config_set(&self, name: &str, key: &str, value: &str) -> Result<()> {
        let contents = self.read_config(name).await?;
        let updated = config_replace(&contents, key, value);
        self.write_config(name, &updated).await
    }

    async fn config_append(&self, name: &str, key: &str, value: &str) -> Result<()> {
        let mut contents = self.read_config(name).await?;
        if !contents.is_empty() && !contents.ends_with('\n') {
            contents.push('\n');
        }
        contents.push_str(&format!("{} = {}\n", key, value));
        self.write_config(name, &contents).await
    }

    async fn destroy(&self, name: &str) -> Result<()> {
        self.run_tool("lxc-destroy", &["-n", name]).await?;
        info!("Destroyed container {}", name);
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Streams a child pipe into the sink, decoding UTF-8 across read
/// boundaries.
async fn pump_output<R: AsyncRead + Unpin>(pipe: Option<R>, sink: &dyn OutputSink) {
    let Some(mut pipe) = pipe else {
        return;
    };

    let mut buf = vec![0u8; OUTPUT_READ_BUF];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        match pipe.read(&mut buf).await {
            Ok(0) => break,
            Err(e) => {
                warn!("Failed to read command output: {}", e);
                break;
            }
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let text = take_utf8_prefix(&mut pending);
                if !text.is_empty() {
                    sink.write(&text);
                }
            }
        }
    }

    if !pending.is_empty() {
        sink.write(&String::from_utf8_lossy(&pending));
    }
}

/// Removes and returns the longest decodable prefix of `pending`.
///
/// An incomplete multi-byte sequence at the end is kept for the next read;
/// invalid bytes elsewhere are replaced.
fn take_utf8_prefix(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(s) => {
            let text = s.to_string();
            pending.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            let rest = pending.split_off(valid);
            let text = String::from_utf8_lossy(pending).into_owned();
            *pending = rest;
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            text
        }
    }
}

/// Maps an exit status to a shell-style exit code.
fn exit_code(status: ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    status.code().unwrap_or(-1)
}

/// Returns the first IPv4 address in `lxc-info -i -H` output.
fn first_ipv4(output: &str) -> Option<IpAddr> {
    output
        .split_whitespace()
        .filter_map(|s| s.parse::<IpAddr>().ok())
        .find(IpAddr::is_ipv4)
}

/// Returns the first value of `key` in an LXC config file.
fn config_lookup(contents: &str, key: &str) -> Option<String> {
    contents.lines().find_map(|line| {
        let (k, v) = line.split_once('=')?;
        (k.trim() == key).then(|| v.trim().to_string())
    })
}

/// Replaces every `key = ...` line with a single `key = value` line.
fn config_replace(contents: &str, key: &str, value: &str) -> String {
    let mut out: String = contents
        .lines()
        .filter(|line| {
            line.split_once('=')
                .map(|(k, _)| k.trim() != key)
                .unwrap_or(true)
        })
        .map(|line| format!("{}\n", line))
        .collect();
    out.push_str(&format!("{} = {}\n", key, value));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_lookup_first_match() {
        let config = "# comment\nlxc.rootfs = overlayfs:/base:/delta\nlxc.utsname = abc\n";
        assert_eq!(
            config_lookup(config, "lxc.rootfs").as_deref(),
            Some("overlayfs:/base:/delta")
        );
        assert_eq!(config_lookup(config, "lxc.arch"), None);
    }

    #[test]
    fn test_config_replace_drops_old_values() {
        let config = "lxc.aa_profile = default\nlxc.utsname = abc\nlxc.aa_profile = other\n";
        let updated = config_replace(config, "lxc.aa_profile", "unconfined");
        assert_eq!(updated, "lxc.utsname = abc\nlxc.aa_profile = unconfined\n");
    }

    #[test]
    fn test_first_ipv4_skips_ipv6() {
        let out = "fe80::1\n10.0.3.15\n";
        assert_eq!(first_ipv4(out), Some("10.0.3.15".parse().unwrap()));
        assert_eq!(first_ipv4("fe80::1\n"), None);
        assert_eq!(first_ipv4(""), None);
    }

    #[test]
    fn test_utf8_prefix_keeps_partial_sequence() {
        // "é" is 0xC3 0xA9; feed only the first byte after ASCII
        let mut pending = vec![b'a', b'b', 0xC3];
        assert_eq!(take_utf8_prefix(&mut pending), "ab");
        assert_eq!(pending, vec![0xC3]);

        pending.push(0xA9);
        assert_eq!(take_utf8_prefix(&mut pending), "é");
        assert!(pending.is_empty());
    }

    struct BrokenPipe {
        chunk: Option<Vec<u8>>,
    }

    impl AsyncRead for BrokenPipe {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            match self.chunk.take() {
                Some(chunk) => {
                    buf.put_slice(&chunk);
                    std::task::Poll::Ready(Ok(()))
                }
                None => std::task::Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "pipe closed",
                ))),
            }
        }
    }

    #[derive(Default)]
    struct Collect(std::sync::Mutex<String>);

    impl OutputSink for Collect {
        fn write(&self, chunk: &str) {
            self.0.lock().unwrap().push_str(chunk);
        }
    }

    #[tokio::test]
    async fn test_read_error_keeps_output_read_so_far() {
        let pipe = BrokenPipe {
            chunk: Some(vec![b'o', b'k', b' ', 0xC3]),
        };
        let sink = Collect::default();

        pump_output(Some(pipe), &sink).await;

        // the dangling byte is flushed lossily once the pipe fails
        assert_eq!(*sink.0.lock().unwrap(), "ok \u{FFFD}");
    }
}
