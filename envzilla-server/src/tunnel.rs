//! Tunnel process supervision.
//!
//! One tunnel child per PR exposes the preview's host port on a public
//! URL. The manager owns every child it spawns: startup output is read
//! line by line until a public URL appears, shutdown is SIGTERM → grace →
//! SIGKILL against the child's process group, and a global stop hook runs
//! on controller drain. An optional background monitor HEAD-probes the
//! active URLs; it reports but never mutates deployment state.

use envzilla_core::{ErrorKind, ExecError};
use serde::Serialize;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Grace period between SIGTERM and SIGKILL.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Informational domains the tunnel binary prints that must never be
/// adopted as the public URL.
const IGNORED_URL_HOSTS: &[&str] = &[
    "www.cloudflare.com",
    "developers.cloudflare.com",
    "dash.cloudflare.com",
    "one.dash.cloudflare.com",
];

/// Output lines that mean the tunnel will never come up.
const FATAL_PATTERNS: &[&str] = &[
    "panic",
    "fatal",
    "unable to initialize",
    "exited unexpectedly",
];

#[derive(Debug, Clone)]
pub struct TunnelSettings {
    pub binary: String,
    /// Transport protocol. Defaults to a TCP-over-TLS variant; QUIC is
    /// avoided by default because of host UDP-buffer pitfalls.
    pub protocol: String,
    pub startup_timeout: Duration,
    pub name: Option<String>,
    pub credentials_path: Option<String>,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            binary: "cloudflared".to_string(),
            protocol: "http2".to_string(),
            startup_timeout: Duration::from_secs(30),
            name: None,
            credentials_path: None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum LineClass {
    PublicUrl(String),
    Fatal(String),
    ConnectionRegistered,
    Info,
}

/// Pull the first `https://` URL out of a log line, if any.
fn extract_https_url(line: &str) -> Option<String> {
    let start = line.find("https://")?;
    let url: String = line[start..]
        .chars()
        .take_while(|c| !c.is_whitespace() && !matches!(c, '"' | '\'' | ')' | ']' | '|'))
        .collect();
    let url = url.trim_end_matches(['.', ',']).to_string();
    if url.len() > "https://".len() {
        Some(url)
    } else {
        None
    }
}

fn url_host(url: &str) -> Option<&str> {
    url.strip_prefix("https://")
        .map(|rest| rest.split(['/', ':', '?']).next().unwrap_or(rest))
}

pub(crate) fn classify_line(line: &str) -> LineClass {
    let lowered = line.to_lowercase();
    if FATAL_PATTERNS.iter().any(|p| lowered.contains(p)) {
        return LineClass::Fatal(line.trim().to_string());
    }
    if let Some(url) = extract_https_url(line) {
        let ignorable = url_host(&url)
            .is_some_and(|host| IGNORED_URL_HOSTS.iter().any(|d| host.eq_ignore_ascii_case(d)));
        if !ignorable {
            return LineClass::PublicUrl(url);
        }
    }
    if lowered.contains("registered") && lowered.contains("connection") {
        return LineClass::ConnectionRegistered;
    }
    LineClass::Info
}

struct TunnelHandle {
    child: Child,
    pid: Option<i32>,
    url: String,
    started_at: Instant,
    consecutive_failures: u32,
    last_check: Option<Instant>,
}

/// Monitor-facing view of one active tunnel.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelStatus {
    pub pr_number: u64,
    pub url: String,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub uptime_secs: u64,
}

pub struct TunnelManager {
    settings: TunnelSettings,
    active: Mutex<HashMap<u64, TunnelHandle>>,
    http: reqwest::Client,
}

impl TunnelManager {
    pub fn new(settings: TunnelSettings) -> Self {
        Self {
            settings,
            active: Mutex::new(HashMap::new()),
            http: reqwest::Client::new(),
        }
    }

    /// Starts a tunnel for `pr_number` mapping the public edge to
    /// `host_port`, returning the adopted public URL. Any previous tunnel
    /// for the PR is stopped first: at most one lives per PR.
    pub async fn start(&self, pr_number: u64, host_port: u16) -> Result<String, ExecError> {
        if self.stop(pr_number).await {
            info!("replaced existing tunnel for pr {pr_number}");
        }

        let local = format!("http://127.0.0.1:{host_port}");
        let mut cmd = Command::new(&self.settings.binary);
        cmd.arg("tunnel")
            .arg("--no-autoupdate")
            .args(["--protocol", self.settings.protocol.as_str()])
            .args(["--url", local.as_str()]);
        if let Some(creds) = &self.settings.credentials_path {
            cmd.args(["--credentials-file", creds.as_str()]);
        }
        if let Some(name) = &self.settings.name {
            cmd.args(["run", name.as_str()]);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            ExecError::new(
                ErrorKind::TunnelFailed,
                format!("could not spawn {}: {e}", self.settings.binary),
            )
        })?;
        let pid = child.id().map(|p| p as i32);

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut out_lines = stdout.map(|s| BufReader::new(s).lines());
        let mut err_lines = stderr.map(|s| BufReader::new(s).lines());

        let deadline = Instant::now() + self.settings.startup_timeout;
        let mut registered = false;
        let mut out_open = out_lines.is_some();
        let mut err_open = err_lines.is_some();
        let mut adopted: Option<String> = None;

        'read: while out_open || err_open {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            let line = tokio::select! {
                line = async {
                    match out_lines.as_mut() {
                        Some(lines) => lines.next_line().await,
                        None => std::future::pending().await,
                    }
                }, if out_open => {
                    match line {
                        Ok(Some(l)) => Some(l),
                        _ => { out_open = false; None }
                    }
                }
                line = async {
                    match err_lines.as_mut() {
                        Some(lines) => lines.next_line().await,
                        None => std::future::pending().await,
                    }
                }, if err_open => {
                    match line {
                        Ok(Some(l)) => Some(l),
                        _ => { err_open = false; None }
                    }
                }
                _ = tokio::time::sleep(remaining) => break 'read,
            };

            let Some(line) = line else { continue };
            match classify_line(&line) {
                LineClass::PublicUrl(url) => {
                    info!("tunnel for pr {pr_number} is {url}");
                    adopted = Some(url);
                    break 'read;
                }
                LineClass::Fatal(detail) => {
                    warn!("tunnel for pr {pr_number} failed at startup: {detail}");
                    Self::terminate(child, pid).await;
                    return Err(ExecError::new(ErrorKind::TunnelFailed, detail));
                }
                LineClass::ConnectionRegistered => {
                    registered = true;
                }
                LineClass::Info => debug!("tunnel[{pr_number}]: {line}"),
            }
        }

        // Timed out (or output closed) without a URL line. A registered
        // named tunnel still has a presumable address; anything else is a
        // startup failure.
        let url = match adopted {
            Some(url) => url,
            None => match (&self.settings.name, registered) {
                (Some(name), true) => {
                    let presumed = format!("https://{name}");
                    warn!(
                        "tunnel for pr {pr_number} registered without printing a URL, presuming {presumed}"
                    );
                    presumed
                }
                _ => {
                    Self::terminate(child, pid).await;
                    return Err(ExecError::new(
                        ErrorKind::TunnelFailed,
                        if out_open || err_open {
                            format!(
                                "no public URL within {:?}",
                                self.settings.startup_timeout
                            )
                        } else {
                            "tunnel exited before printing a URL".to_string()
                        },
                    ));
                }
            },
        };

        // Keep draining the child's output so the pipes never fill.
        if let Some(mut lines) = out_lines {
            let pr = pr_number;
            tokio::spawn(async move {
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("tunnel[{pr}]: {line}");
                }
            });
        }
        if let Some(mut lines) = err_lines {
            let pr = pr_number;
            tokio::spawn(async move {
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("tunnel[{pr}]: {line}");
                }
            });
        }

        let handle = TunnelHandle {
            child,
            pid,
            url: url.clone(),
            started_at: Instant::now(),
            consecutive_failures: 0,
            last_check: None,
        };
        self.active
            .lock()
            .expect("tunnel map poisoned")
            .insert(pr_number, handle);
        Ok(url)
    }

    /// Stops the tunnel for `pr_number` if one is live. Returns whether a
    /// process was actually stopped.
    pub async fn stop(&self, pr_number: u64) -> bool {
        let handle = self
            .active
            .lock()
            .expect("tunnel map poisoned")
            .remove(&pr_number);
        match handle {
            Some(handle) => {
                info!("stopping tunnel for pr {pr_number}");
                Self::terminate(handle.child, handle.pid).await;
                true
            }
            None => false,
        }
    }

    /// Global shutdown hook: terminates every registered tunnel.
    pub async fn stop_all(&self) {
        let handles: Vec<(u64, TunnelHandle)> = {
            let mut active = self.active.lock().expect("tunnel map poisoned");
            active.drain().collect()
        };
        for (pr_number, handle) in handles {
            info!("stopping tunnel for pr {pr_number} (shutdown)");
            Self::terminate(handle.child, handle.pid).await;
        }
    }

    /// SIGTERM the process group, wait out the grace period, then SIGKILL.
    async fn terminate(mut child: Child, pid: Option<i32>) {
        signal_group(pid, false, &mut child);
        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                signal_group(pid, true, &mut child);
                let _ = child.wait().await;
            }
        }
    }

    pub fn url_for(&self, pr_number: u64) -> Option<String> {
        self.active
            .lock()
            .expect("tunnel map poisoned")
            .get(&pr_number)
            .map(|h| h.url.clone())
    }

    pub fn statuses(&self) -> Vec<TunnelStatus> {
        let active = self.active.lock().expect("tunnel map poisoned");
        active
            .iter()
            .map(|(pr, h)| TunnelStatus {
                pr_number: *pr,
                url: h.url.clone(),
                healthy: h.consecutive_failures == 0,
                consecutive_failures: h.consecutive_failures,
                uptime_secs: h.started_at.elapsed().as_secs(),
            })
            .collect()
    }

    /// One monitor pass: HEAD every active URL and update failure counts.
    pub async fn check_active(&self) {
        let targets: Vec<(u64, String)> = {
            let active = self.active.lock().expect("tunnel map poisoned");
            active.iter().map(|(pr, h)| (*pr, h.url.clone())).collect()
        };
        for (pr_number, url) in targets {
            let ok = self
                .http
                .head(&url)
                .timeout(Duration::from_secs(5))
                .send()
                .await
                .map(|resp| !resp.status().is_server_error())
                .unwrap_or(false);
            let mut active = self.active.lock().expect("tunnel map poisoned");
            if let Some(handle) = active.get_mut(&pr_number) {
                handle.last_check = Some(Instant::now());
                if ok {
                    handle.consecutive_failures = 0;
                } else {
                    handle.consecutive_failures += 1;
                    warn!(
                        "tunnel for pr {pr_number} failed health check ({} consecutive)",
                        handle.consecutive_failures
                    );
                }
            }
        }
    }
}

/// Background monitor: probes every active tunnel URL on an interval.
pub fn spawn_health_monitor(
    manager: Arc<TunnelManager>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => manager.check_active().await,
            }
        }
    })
}

#[cfg(unix)]
fn signal_group(pid: Option<i32>, kill: bool, child: &mut Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;
    match pid {
        Some(pid) => {
            let sig = if kill { Signal::SIGKILL } else { Signal::SIGTERM };
            if killpg(Pid::from_raw(pid), sig).is_err() {
                let _ = child.start_kill();
            }
        }
        None => {
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<i32>, _kill: bool, child: &mut Child) {
    let _ = child.start_kill();
}

/// Two-phase public-URL verification used after tunnel creation.
#[derive(Debug, Clone)]
pub struct VerifyPolicy {
    pub get_attempts: u32,
    pub base_delay: Duration,
    pub delay_cap: Duration,
    pub request_timeout: Duration,
}

impl Default for VerifyPolicy {
    fn default() -> Self {
        Self {
            get_attempts: 6,
            base_delay: Duration::from_secs(2),
            delay_cap: Duration::from_secs(15),
            request_timeout: Duration::from_secs(8),
        }
    }
}

/// Phase one: two quick HEAD checks 500 ms apart. Phase two: GET attempts
/// with exponential backoff. Any non-5xx response counts as verified (the
/// edge routing is what is being tested, not the app).
pub async fn verify_public_url(
    client: &reqwest::Client,
    url: &str,
    policy: &VerifyPolicy,
) -> bool {
    for i in 0..2 {
        let ok = client
            .head(url)
            .timeout(Duration::from_millis(500))
            .send()
            .await
            .map(|resp| !resp.status().is_server_error())
            .unwrap_or(false);
        if ok {
            return true;
        }
        if i == 0 {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    let mut delay = policy.base_delay;
    for attempt in 1..=policy.get_attempts {
        let ok = client
            .get(url)
            .timeout(policy.request_timeout)
            .send()
            .await
            .map(|resp| !resp.status().is_server_error())
            .unwrap_or(false);
        if ok {
            return true;
        }
        if attempt < policy.get_attempts {
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(policy.delay_cap);
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_lines_are_adopted() {
        let line = "2024-05-01T00:00:00Z INF +  https://tired-cat-42.trycloudflare.com  +";
        match classify_line(line) {
            LineClass::PublicUrl(url) => {
                assert_eq!(url, "https://tired-cat-42.trycloudflare.com")
            }
            other => panic!("expected URL, got {other:?}"),
        }
    }

    #[test]
    fn informational_domains_are_not_adopted() {
        let line = "INF Terms of service: https://www.cloudflare.com/website-terms/";
        assert_eq!(classify_line(line), LineClass::Info);
    }

    #[test]
    fn fatal_patterns_abort_startup() {
        for line in [
            "panic: runtime error",
            "FATAL tunnel credential rejected",
            "ERR unable to initialize tunnel",
            "tunnel process exited unexpectedly",
        ] {
            assert!(
                matches!(classify_line(line), LineClass::Fatal(_)),
                "{line} should be fatal"
            );
        }
    }

    #[test]
    fn udp_buffer_warnings_are_informational() {
        let line = "WRN failed to sufficiently increase receive buffer size (UDP)";
        assert_eq!(classify_line(line), LineClass::Info);
    }

    #[test]
    fn connection_registration_is_detected() {
        let line = "INF Registered tunnel connection connIndex=0";
        assert_eq!(classify_line(line), LineClass::ConnectionRegistered);
    }

    #[test]
    fn url_extraction_strips_trailing_punctuation() {
        assert_eq!(
            extract_https_url("see https://a.example.com, then retry"),
            Some("https://a.example.com".to_string())
        );
        assert_eq!(extract_https_url("no url here"), None);
        assert_eq!(extract_https_url("bare https:// prefix"), None);
    }

    #[cfg(unix)]
    mod process {
        use super::super::*;
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        /// Writes a fake tunnel executable and returns settings using it.
        fn fake_tunnel(script_body: &str, startup_timeout: Duration) -> (tempfile::TempDir, TunnelSettings) {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("fake-tunnel");
            let mut file = std::fs::File::create(&path).unwrap();
            writeln!(file, "#!/bin/sh\n{script_body}").unwrap();
            let mut perms = file.metadata().unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
            drop(file);

            let settings = TunnelSettings {
                binary: path.display().to_string(),
                startup_timeout,
                ..TunnelSettings::default()
            };
            (dir, settings)
        }

        #[tokio::test]
        async fn start_adopts_url_and_stop_reaps_the_child() {
            let (_dir, settings) = fake_tunnel(
                "echo 'INF Registered tunnel connection'\n\
                 echo 'INF https://preview-42.example-tunnel.net'\n\
                 sleep 60",
                Duration::from_secs(10),
            );
            let manager = TunnelManager::new(settings);

            let url = manager.start(42, 5001).await.unwrap();
            assert_eq!(url, "https://preview-42.example-tunnel.net");
            assert_eq!(manager.url_for(42), Some(url));

            assert!(manager.stop(42).await);
            assert_eq!(manager.url_for(42), None);
            // A second stop is a no-op.
            assert!(!manager.stop(42).await);
        }

        #[tokio::test]
        async fn fatal_output_fails_startup() {
            let (_dir, settings) = fake_tunnel(
                "echo 'ERR unable to initialize tunnel' >&2\nsleep 60",
                Duration::from_secs(10),
            );
            let manager = TunnelManager::new(settings);
            let err = manager.start(7, 5001).await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::TunnelFailed);
        }

        #[tokio::test]
        async fn silent_startup_times_out() {
            let (_dir, settings) = fake_tunnel("sleep 60", Duration::from_millis(300));
            let manager = TunnelManager::new(settings);
            let err = manager.start(7, 5001).await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::TunnelFailed);
        }

        #[tokio::test]
        async fn early_exit_without_url_fails() {
            let (_dir, settings) = fake_tunnel(
                "echo 'INF shutting down'",
                Duration::from_secs(10),
            );
            let manager = TunnelManager::new(settings);
            let err = manager.start(7, 5001).await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::TunnelFailed);
        }

        #[tokio::test]
        async fn starting_twice_replaces_the_first_tunnel() {
            let (_dir, settings) = fake_tunnel(
                "echo \"INF https://preview.example-tunnel.net/$$\"\nsleep 60",
                Duration::from_secs(10),
            );
            let manager = TunnelManager::new(settings);
            let first = manager.start(42, 5001).await.unwrap();
            let second = manager.start(42, 5002).await.unwrap();
            assert_ne!(first, second);
            assert_eq!(manager.statuses().len(), 1);
            manager.stop_all().await;
            assert!(manager.statuses().is_empty());
        }
    }
}
