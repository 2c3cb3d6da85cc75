//! # Process Orchestrator
//!
//! The orchestrator is the top-level supervisor: it spawns the master
//! process (the forwarder) and `W` worker processes as children of the
//! current executable, each bound to its namespaced endpoint, restarts
//! whichever of them exits, and maintains the shared view of the live
//! worker set.
//!
//! ## Worker registry
//!
//! The shared worker list lives in a small file written atomically
//! (write-then-rename) by the orchestrator and snapshot-read by the
//! forwarder. A namespace only ever enters the list after its endpoint
//! has been observed bound, so the forwarder never fans out to an
//! address nobody listens on; reads are lock free and tolerate one
//! supervision tick of staleness.
//!
//! ## Shutdown
//!
//! SIGINT or SIGTERM stops the supervision loop, forwards SIGTERM to
//! every child, waits up to ten seconds for them to become reapable,
//! and SIGKILLs survivors.

use crate::bind::BindAddress;
use crate::cli::ProcessRole;
use crate::error::FabricError;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// File-backed, process-shared list of live worker namespaces.
///
/// Only the orchestrator writes it; every write replaces the whole file
/// through a rename so readers always see a complete list.
#[derive(Debug, Clone)]
pub struct WorkerRegistry {
    path: PathBuf,
}

impl WorkerRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replaces the published worker list.
    pub fn publish(&self, workers: &[String]) -> std::io::Result<()> {
        let staging = self.path.with_extension("staging");
        let mut body = workers.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }
        std::fs::write(&staging, body)?;
        std::fs::rename(&staging, &self.path)
    }

    /// Reads the current worker list. A missing file reads as empty.
    pub fn snapshot(&self) -> Vec<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(body) => body
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Removes the registry file.
    pub fn clear(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Polls `address` until something is listening on it or the deadline
/// passes.
pub async fn await_endpoint(address: &BindAddress, deadline: Duration) -> bool {
    let start = Instant::now();
    loop {
        let bound = match address {
            BindAddress::Unix { path } => Path::new(path).exists(),
            BindAddress::Inet { .. } => {
                TcpStream::connect(address.authority()).await.is_ok()
            }
        };
        if bound {
            return true;
        }
        if start.elapsed() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(200)).await;
    }
}

/// Master/worker supervisor.
pub struct Orchestrator {
    bind: BindAddress,
    workers: usize,
    registry: WorkerRegistry,
    verbose: u8,
    quiet: bool,
    children: HashMap<String, Child>,
    ready: HashSet<String>,
    master_failures: u32,
}

impl Orchestrator {
    pub fn new(
        bind: BindAddress,
        workers: usize,
        registry: WorkerRegistry,
        verbose: u8,
        quiet: bool,
    ) -> Self {
        Self {
            bind,
            workers,
            registry,
            verbose,
            quiet,
            children: HashMap::new(),
            ready: HashSet::new(),
            master_failures: 0,
        }
    }

    /// Runs the supervision loop until SIGINT or SIGTERM.
    pub async fn run(mut self) -> Result<(), FabricError> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        self.registry.clear();
        info!(
            "supervising master and {} worker(s) on {}",
            self.workers, self.bind
        );

        let outcome = loop {
            tokio::select! {
                _ = sigint.recv() => break Ok(()),
                _ = sigterm.recv() => break Ok(()),
                result = self.tick() => {
                    if let Err(err) = result {
                        break Err(err);
                    }
                }
            }
        };

        self.shutdown().await;
        outcome
    }

    /// One supervision step: restart the master first, then the first
    /// missing worker; when everything runs, idle for a tick and refresh
    /// the published list against the live set.
    async fn tick(&mut self) -> Result<(), FabricError> {
        if !self.is_running("master") {
            self.start("master", ProcessRole::Master);
            if await_endpoint(&self.bind, crate::defaults::READY_TIMEOUT).await {
                self.master_failures = 0;
            } else {
                // A master that never binds is a configuration problem,
                // not a crash to supervise through.
                self.master_failures += 1;
                if self.master_failures >= 3 {
                    return Err(FabricError::TransportUnavailable(format!(
                        "master endpoint {} never came up",
                        self.bind
                    )));
                }
            }
            return Ok(());
        }

        for i in 0..self.workers {
            let namespace = format!("worker_{i}");
            if self.is_running(&namespace) {
                continue;
            }
            self.ready.remove(&namespace);
            self.start(&namespace, ProcessRole::Worker);
            let endpoint = self.bind.namespaced(&namespace);
            if await_endpoint(&endpoint, crate::defaults::READY_TIMEOUT).await {
                self.ready.insert(namespace);
                self.publish();
            } else {
                warn!("{namespace} endpoint {endpoint} did not come up");
            }
            return Ok(());
        }

        sleep(crate::defaults::SUPERVISION_TICK).await;
        self.refresh().await;
        Ok(())
    }

    fn is_running(&mut self, namespace: &str) -> bool {
        let Some(child) = self.children.get_mut(namespace) else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                warn!("{namespace} exited with {status}");
                self.children.remove(namespace);
                false
            }
            Err(err) => {
                warn!("could not poll {namespace}: {err}");
                false
            }
        }
    }

    fn start(&mut self, namespace: &str, role: ProcessRole) {
        let exe = match std::env::current_exe() {
            Ok(exe) => exe,
            Err(err) => {
                error!("cannot locate the server executable: {err}");
                return;
            }
        };

        info!("starting {namespace}");
        let mut command = Command::new(exe);
        command
            .arg("--bind")
            .arg(self.bind.to_string())
            .arg("--workers")
            .arg(self.workers.to_string())
            .arg("--role")
            .arg(match role {
                ProcessRole::Master => "master",
                ProcessRole::Worker => "worker",
            })
            .arg("--namespace")
            .arg(namespace)
            .arg("--registry")
            .arg(self.registry.path())
            .stdin(Stdio::null());
        for _ in 0..self.verbose {
            command.arg("-v");
        }
        if self.quiet {
            command.arg("--quiet");
        }

        match command.spawn() {
            Ok(child) => {
                debug!("{namespace} is pid {}", child.id());
                self.children.insert(namespace.to_string(), child);
            }
            Err(err) => error!("failed to spawn {namespace}: {err}"),
        }
    }

    /// Publishes the ready workers in index order.
    fn publish(&mut self) {
        let list: Vec<String> = (0..self.workers)
            .map(|i| format!("worker_{i}"))
            .filter(|namespace| self.ready.contains(namespace))
            .collect();
        if let Err(err) = self.registry.publish(&list) {
            warn!("could not publish the worker list: {err}");
        }
    }

    /// Reconciles the published list with the live set: drops namespaces
    /// whose process died and picks up running workers whose endpoint is
    /// bound but whose readiness was never observed.
    async fn refresh(&mut self) {
        for i in 0..self.workers {
            let namespace = format!("worker_{i}");
            if !self.is_running(&namespace) {
                self.ready.remove(&namespace);
            } else if !self.ready.contains(&namespace) {
                let endpoint = self.bind.namespaced(&namespace);
                if await_endpoint(&endpoint, Duration::from_millis(500)).await {
                    self.ready.insert(namespace);
                }
            }
        }
        self.publish();
    }

    async fn shutdown(&mut self) {
        info!("shutting down");
        for (namespace, child) in &self.children {
            let pid = Pid::from_raw(child.id() as i32);
            if let Err(err) = kill(pid, Signal::SIGTERM) {
                debug!("could not signal {namespace}: {err}");
            }
        }

        let deadline = Instant::now() + crate::defaults::SHUTDOWN_GRACE;
        while !self.children.is_empty() && Instant::now() < deadline {
            self.children.retain(|_, child| {
                !matches!(child.try_wait(), Ok(Some(_)))
            });
            if self.children.is_empty() {
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }

        for (namespace, child) in self.children.iter_mut() {
            warn!("{namespace} ignored SIGTERM, killing it");
            let _ = child.kill();
            let _ = child.wait();
        }
        self.children.clear();
        self.registry.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let registry = WorkerRegistry::new(dir.path().join("workers"));

        assert!(registry.snapshot().is_empty());

        registry
            .publish(&["worker_0".to_string(), "worker_1".to_string()])
            .unwrap();
        assert_eq!(registry.snapshot(), vec!["worker_0", "worker_1"]);

        registry.publish(&["worker_1".to_string()]).unwrap();
        assert_eq!(registry.snapshot(), vec!["worker_1"]);

        registry.publish(&[]).unwrap();
        assert!(registry.snapshot().is_empty());

        registry.clear();
        assert!(registry.snapshot().is_empty());
    }

    #[tokio::test]
    async fn endpoint_probe_sees_a_bound_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe.sock");
        let address = BindAddress::Unix {
            path: path.to_string_lossy().into_owned(),
        };

        assert!(!await_endpoint(&address, Duration::from_millis(50)).await);

        let _listener = tokio::net::UnixListener::bind(&path).unwrap();
        assert!(await_endpoint(&address, Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn endpoint_probe_sees_a_bound_tcp_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let address = BindAddress::parse(&format!("127.0.0.1:{port}")).unwrap();
        assert!(await_endpoint(&address, Duration::from_millis(500)).await);
    }
}
