//! Lifecycle of the external services chunkdb depends on.
//!
//! Services (the embedding model server, a UI) are declared in the same TOML
//! file as the pipeline settings:
//!
//! ```toml
//! [[services]]
//! name = "ollama"
//! program = "ollama"
//! args = ["serve"]
//! port = 11434
//! ```
//!
//! `chunkdb serve` starts them before binding the API and stops them on
//! shutdown. A service whose port already answers is assumed to be running and
//! left alone unless `force` is set, in which case whatever holds the port is
//! killed first.

use chunkdb_core::config::{DEFAULT_START_TIMEOUT_SECS, DEFAULT_STOP_GRACE_SECS};
use chunkdb_core::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_millis(500);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_start_timeout() -> u64 {
    DEFAULT_START_TIMEOUT_SECS
}

fn default_quiet() -> bool {
    true
}

/// One supervised process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    /// Seconds to wait for the port to accept connections after spawning.
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,
    /// Discard the service's stdout and stderr.
    #[serde(default = "default_quiet")]
    pub quiet: bool,
}

/// The `[[services]]` part of the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

impl SupervisorConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        for service in &config.services {
            if service.name.trim().is_empty() || service.program.trim().is_empty() {
                return Err(Error::InvalidConfig(
                    "every service needs a name and a program".into(),
                ));
            }
            if service.port == 0 {
                return Err(Error::InvalidConfig(format!(
                    "service {} needs a non-zero port",
                    service.name
                )));
            }
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}

/// Reported by [`Supervisor::health`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceHealth {
    pub name: String,
    pub port: u16,
    pub up: bool,
    /// Whether this supervisor spawned the process.
    pub managed: bool,
}

struct Running {
    name: String,
    child: Child,
}

/// Starts, health-checks and stops the configured services.
pub struct Supervisor {
    services: Vec<ServiceConfig>,
    running: Mutex<Vec<Running>>,
    stop_grace: Duration,
}

/// True if something accepts TCP connections on `host:port`.
pub fn health_check(host: &str, port: u16) -> bool {
    let Ok(addrs) = (host, port).to_socket_addrs() else {
        return false;
    };
    addrs
        .into_iter()
        .any(|addr| TcpStream::connect_timeout(&addr, HEALTH_CHECK_TIMEOUT).is_ok())
}

/// Kill whatever listens on `port`. Needs `lsof`; logs and gives up without it.
pub fn free_port(port: u16) {
    let output = match Command::new("lsof")
        .args(["-t", "-i", &format!(":{port}")])
        .stderr(Stdio::null())
        .output()
    {
        Ok(output) => output,
        Err(e) => {
            tracing::warn!(port, error = %e, "lsof unavailable, cannot free port");
            return;
        }
    };
    for pid in String::from_utf8_lossy(&output.stdout).split_whitespace() {
        tracing::info!(port, pid, "killing process holding port");
        let _ = Command::new("kill")
            .args(["-9", pid])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            services: config.services,
            running: Mutex::new(Vec::new()),
            stop_grace: Duration::from_secs(DEFAULT_STOP_GRACE_SECS),
        }
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn services(&self) -> &[ServiceConfig] {
        &self.services
    }

    /// Start every configured service that is not already up. Returns the
    /// names of the services spawned. A missing program is skipped with a
    /// warning; other spawn failures are errors.
    pub fn start(&self, force: bool) -> Result<Vec<String>> {
        let mut started = Vec::new();
        for service in &self.services {
            if health_check(&service.host, service.port) {
                if !force {
                    tracing::info!(service = %service.name, port = service.port, "port in use, assuming service is up");
                    continue;
                }
                free_port(service.port);
            }
            match self.spawn(service)? {
                Some(child) => {
                    self.running.lock().push(Running {
                        name: service.name.clone(),
                        child,
                    });
                    self.wait_until_up(service);
                    started.push(service.name.clone());
                }
                None => continue,
            }
        }
        Ok(started)
    }

    fn spawn(&self, service: &ServiceConfig) -> Result<Option<Child>> {
        let mut command = Command::new(&service.program);
        command.args(&service.args).stdin(Stdio::null());
        if let Some(cwd) = &service.cwd {
            command.current_dir(cwd);
        }
        if service.quiet {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }
        match command.spawn() {
            Ok(child) => {
                tracing::info!(service = %service.name, pid = child.id(), program = %service.program, "service started");
                Ok(Some(child))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(service = %service.name, program = %service.program, "program not installed, skipping");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn wait_until_up(&self, service: &ServiceConfig) {
        let deadline = Instant::now() + Duration::from_secs(service.start_timeout_secs);
        while Instant::now() < deadline {
            if health_check(&service.host, service.port) {
                tracing::info!(service = %service.name, port = service.port, "service is accepting connections");
                return;
            }
            thread::sleep(POLL_INTERVAL);
        }
        tracing::warn!(
            service = %service.name,
            port = service.port,
            timeout_secs = service.start_timeout_secs,
            "service did not open its port in time"
        );
    }

    /// Health-check every configured service.
    pub fn health(&self) -> Vec<ServiceHealth> {
        let running = self.running.lock();
        self.services
            .iter()
            .map(|s| ServiceHealth {
                name: s.name.clone(),
                port: s.port,
                up: health_check(&s.host, s.port),
                managed: running.iter().any(|r| r.name == s.name),
            })
            .collect()
    }

    /// Ask every spawned service to exit, then kill what is left after the
    /// grace period. Services are stopped in reverse start order.
    pub fn stop(&self) {
        let mut running = std::mem::take(&mut *self.running.lock());
        for r in running.iter_mut().rev() {
            terminate(&mut r.child);
        }
        let deadline = Instant::now() + self.stop_grace;
        for r in running.iter_mut().rev() {
            loop {
                match r.child.try_wait() {
                    Ok(Some(status)) => {
                        tracing::info!(service = %r.name, %status, "service stopped");
                        break;
                    }
                    Ok(None) if Instant::now() < deadline => thread::sleep(POLL_INTERVAL),
                    Ok(None) | Err(_) => {
                        tracing::warn!(service = %r.name, "service ignored shutdown request, killing");
                        let _ = r.child.kill();
                        let _ = r.child.wait();
                        break;
                    }
                }
            }
        }
    }

    pub fn running(&self) -> usize {
        self.running.lock().len()
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    let sent = Command::new("kill")
        .args(["-TERM", &child.id().to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|s| s.success());
    if !sent {
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.kill();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_config_parses_alongside_pipeline_settings() {
        let text = r#"
            embedding_dimension = 64

            [[services]]
            name = "ollama"
            program = "ollama"
            args = ["serve"]
            port = 11434
        "#;
        let config = SupervisorConfig::from_toml_str(text).unwrap();
        assert_eq!(config.services.len(), 1);
        assert_eq!(config.services[0].host, "127.0.0.1");
        assert!(config.services[0].quiet);

        let settings = chunkdb_core::config::Settings::from_toml_str(text).unwrap();
        assert_eq!(settings.embedding_dimension, 64);
    }

    #[test]
    fn test_config_rejects_zero_port() {
        let text = "[[services]]\nname = \"ui\"\nprogram = \"x\"\nport = 0\n";
        assert!(matches!(
            SupervisorConfig::from_toml_str(text),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_health_check_follows_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(health_check("127.0.0.1", port));
        drop(listener);
        assert!(!health_check("127.0.0.1", port));
    }

    fn service(program: &str, args: &[&str], port: u16) -> ServiceConfig {
        ServiceConfig {
            name: "test".into(),
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            cwd: None,
            host: "127.0.0.1".into(),
            port,
            start_timeout_secs: 0,
            quiet: true,
        }
    }

    #[test]
    fn test_busy_port_is_left_alone_without_force() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let sup = Supervisor::new(SupervisorConfig {
            services: vec![service("sleep", &["30"], port)],
        });
        assert!(sup.start(false).unwrap().is_empty());
        assert_eq!(sup.running(), 0);
        assert!(sup.health()[0].up);
        assert!(!sup.health()[0].managed);
    }

    #[test]
    fn test_missing_program_is_skipped() {
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let sup = Supervisor::new(SupervisorConfig {
            services: vec![service("chunkdb-no-such-program", &[], port)],
        });
        assert!(sup.start(false).unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_start_then_stop() {
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let sup = Supervisor::new(SupervisorConfig {
            services: vec![service("sleep", &["30"], port)],
        })
        .with_stop_grace(Duration::from_secs(2));
        assert_eq!(sup.start(false).unwrap(), vec!["test".to_string()]);
        assert_eq!(sup.running(), 1);
        assert!(sup.health()[0].managed);
        sup.stop();
        assert_eq!(sup.running(), 0);
    }
}
