//! Free host-port allocation for preview containers.
//!
//! Ports are chosen from the configured range by randomized probing: a
//! probe binds the loopback address and releases it immediately. Bounded
//! concurrency keeps a full-range sweep fast; a short-lived reservation
//! cache stops two concurrent builds from being handed the same port in
//! the window before their containers bind it.

use envzilla_core::{ErrorKind, ExecError};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::debug;

/// How long a handed-out port stays excluded from further allocations.
const RESERVATION_TTL: Duration = Duration::from_secs(30);

pub struct PortAllocator {
    start: u16,
    end: u16,
    max_attempts: usize,
    probe_concurrency: usize,
    probe_timeout: Duration,
    recent: Mutex<HashMap<u16, Instant>>,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            max_attempts: 200,
            probe_concurrency: 50,
            probe_timeout: Duration::from_millis(250),
            recent: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    fn with_limits(mut self, max_attempts: usize, concurrency: usize) -> Self {
        self.max_attempts = max_attempts;
        self.probe_concurrency = concurrency.max(1);
        self
    }

    pub fn range(&self) -> (u16, u16) {
        (self.start, self.end)
    }

    /// Picks a free port, excluding `in_use` (ports held by running
    /// deployments) and recently handed-out ports. Exhausting the attempt
    /// budget yields `no-free-port`.
    pub async fn allocate(&self, in_use: &[u16]) -> Result<u16, ExecError> {
        let mut candidates: Vec<u16> = {
            let mut recent = self.recent.lock().expect("port cache poisoned");
            let now = Instant::now();
            recent.retain(|_, reserved_at| now.duration_since(*reserved_at) < RESERVATION_TTL);
            (self.start..=self.end)
                .filter(|p| !in_use.contains(p) && !recent.contains_key(p))
                .collect()
        };
        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(self.max_attempts);

        for batch in candidates.chunks(self.probe_concurrency) {
            let mut probes = JoinSet::new();
            for &port in batch {
                let timeout = self.probe_timeout;
                probes.spawn(async move {
                    let free = tokio::time::timeout(
                        timeout,
                        TcpListener::bind(("127.0.0.1", port)),
                    )
                    .await
                    .map(|r| r.is_ok())
                    .unwrap_or(false);
                    (port, free)
                });
            }

            let mut found = None;
            while let Some(result) = probes.join_next().await {
                if let Ok((port, true)) = result {
                    found.get_or_insert(port);
                }
            }
            if let Some(port) = found {
                self.recent
                    .lock()
                    .expect("port cache poisoned")
                    .insert(port, Instant::now());
                debug!("allocated host port {port}");
                return Ok(port);
            }
        }

        Err(ExecError::new(
            ErrorKind::NoFreePort,
            format!(
                "no free port in {}-{} after {} probes",
                self.start, self.end, self.max_attempts
            ),
        ))
    }

    /// Releases a reservation early (used when a build fails before the
    /// container binds the port).
    pub fn release(&self, port: u16) {
        self.recent
            .lock()
            .expect("port cache poisoned")
            .remove(&port);
    }
}
