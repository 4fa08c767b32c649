/// Shared fakes for exercising the orchestrator, channel, and provisioning
/// engine without a hypervisor or a network
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::config::{ClusterConfig, SshConfig};
use crate::driver::{Driver, DriverError, Endpoint, VmHandle, VmSpec, VmState};
use crate::health::Probe;
use crate::remote::{Connection, ConnectionError, RemoteCommand, RemoteOutput, Transport};

/// Cluster config used across tests: a fixed kubelet version and DNS
/// domain, and a fast connect-retry policy
pub fn test_config() -> ClusterConfig {
    let mut config = ClusterConfig::example();
    config.cluster_name = "test-cluster".to_string();
    config.kubernetes.version = "1.2.3".to_string();
    config.kubernetes.dns_domain = "cluster.local".to_string();
    config.connect_retry.base_delay_secs = 0;
    config
}

/// In-memory driver holding a single VM that walks the legal state chain
/// Absent → Created → Running → Stopped → Absent
pub struct MockDriver {
    state: Mutex<VmState>,
    address: Endpoint,
    create_calls: AtomicU32,
    start_calls: AtomicU32,
    stop_calls: AtomicU32,
    delete_calls: AtomicU32,
}

impl MockDriver {
    pub fn new(initial: VmState) -> Self {
        Self {
            state: Mutex::new(initial),
            address: Endpoint::new("192.168.99.100", 2376),
            create_calls: AtomicU32::new(0),
            start_calls: AtomicU32::new(0),
            stop_calls: AtomicU32::new(0),
            delete_calls: AtomicU32::new(0),
        }
    }

    pub fn vm_state(&self) -> VmState {
        *self.state.lock().unwrap()
    }

    pub fn create_calls(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn start_calls(&self) -> u32 {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> u32 {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> u32 {
        self.delete_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn create(&self, spec: &VmSpec) -> Result<VmHandle, DriverError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if *state == VmState::Absent {
            *state = VmState::Created;
        }
        Ok(VmHandle::new(spec.name.clone()))
    }

    async fn find(&self, name: &str) -> Result<Option<VmHandle>, DriverError> {
        match self.vm_state() {
            VmState::Absent => Ok(None),
            _ => Ok(Some(VmHandle::new(name))),
        }
    }

    async fn start(&self, handle: &VmHandle) -> Result<(), DriverError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        match *state {
            VmState::Created | VmState::Stopped => {
                *state = VmState::Running;
                Ok(())
            }
            VmState::Running => Ok(()),
            other => Err(DriverError::Permanent(format!(
                "cannot start {} from state {}",
                handle.id(),
                other
            ))),
        }
    }

    async fn stop(&self, _handle: &VmHandle) -> Result<(), DriverError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if *state == VmState::Running {
            *state = VmState::Stopped;
        }
        Ok(())
    }

    async fn delete(&self, _handle: &VmHandle) -> Result<(), DriverError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        *self.state.lock().unwrap() = VmState::Absent;
        Ok(())
    }

    async fn address(&self, _handle: &VmHandle) -> Result<Endpoint, DriverError> {
        Ok(self.address.clone())
    }

    async fn state(&self, _handle: &VmHandle) -> Result<VmState, DriverError> {
        Ok(self.vm_state())
    }
}

/// One recorded upload through a fake connection
#[derive(Debug, Clone)]
pub struct UploadRecord {
    pub path: String,
    pub content: String,
    pub mode: u32,
}

#[derive(Debug, Clone)]
struct FailRule {
    pattern: String,
    exit_code: i32,
    remaining: Option<u32>,
}

/// Scriptable transport: can refuse the first N connects, delay connects,
/// and fail commands matching a substring. All connections share the
/// transport's logs, so tests inspect the transport after the fact.
#[derive(Clone)]
pub struct FakeTransport {
    connect_attempts: Arc<AtomicU32>,
    failing_connects: Arc<AtomicU32>,
    connect_delay: Arc<Mutex<Option<Duration>>>,
    command_log: Arc<Mutex<Vec<String>>>,
    uploads: Arc<Mutex<Vec<UploadRecord>>>,
    fail_rules: Arc<Mutex<Vec<FailRule>>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            connect_attempts: Arc::new(AtomicU32::new(0)),
            failing_connects: Arc::new(AtomicU32::new(0)),
            connect_delay: Arc::new(Mutex::new(None)),
            command_log: Arc::new(Mutex::new(Vec::new())),
            uploads: Arc::new(Mutex::new(Vec::new())),
            fail_rules: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Refuse the next `n` connection attempts
    pub fn fail_connects(self, n: u32) -> Self {
        self.failing_connects.store(n, Ordering::SeqCst);
        self
    }

    /// Delay every connect, for provoking Busy rejections
    pub fn connect_delay(self, delay: Duration) -> Self {
        *self.connect_delay.lock().unwrap() = Some(delay);
        self
    }

    /// Fail every command containing `pattern` with the given exit code
    pub fn fail_command(self, pattern: &str, exit_code: i32) -> Self {
        self.fail_rules.lock().unwrap().push(FailRule {
            pattern: pattern.to_string(),
            exit_code,
            remaining: None,
        });
        self
    }

    /// Fail only the first command containing `pattern`
    pub fn fail_command_once(self, pattern: &str, exit_code: i32) -> Self {
        self.fail_rules.lock().unwrap().push(FailRule {
            pattern: pattern.to_string(),
            exit_code,
            remaining: Some(1),
        });
        self
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn command_log(&self) -> Vec<String> {
        self.command_log.lock().unwrap().clone()
    }

    pub fn uploads(&self) -> Vec<UploadRecord> {
        self.uploads.lock().unwrap().clone()
    }

    fn scripted_exit(&self, line: &str) -> i32 {
        let mut rules = self.fail_rules.lock().unwrap();
        for rule in rules.iter_mut() {
            if !line.contains(&rule.pattern) {
                continue;
            }
            match &mut rule.remaining {
                None => return rule.exit_code,
                Some(0) => continue,
                Some(n) => {
                    *n -= 1;
                    return rule.exit_code;
                }
            }
        }
        0
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        _credentials: &SshConfig,
    ) -> Result<Box<dyn Connection>, ConnectionError> {
        let connect_delay = *self.connect_delay.lock().unwrap();
        if let Some(delay) = connect_delay {
            tokio::time::sleep(delay).await;
        }

        self.connect_attempts.fetch_add(1, Ordering::SeqCst);

        if self.failing_connects.load(Ordering::SeqCst) > 0 {
            self.failing_connects.fetch_sub(1, Ordering::SeqCst);
            return Err(ConnectionError::Connect {
                endpoint: endpoint.to_string(),
                reason: "connection refused (scripted)".to_string(),
            });
        }

        Ok(Box::new(FakeConnection {
            transport: self.clone(),
        }))
    }
}

struct FakeConnection {
    transport: FakeTransport,
}

#[async_trait]
impl Connection for FakeConnection {
    async fn exec(&mut self, command: &RemoteCommand) -> Result<RemoteOutput, ConnectionError> {
        let line = command.to_shell();
        self.transport.command_log.lock().unwrap().push(line.clone());

        let exit_code = self.transport.scripted_exit(&line);
        Ok(RemoteOutput {
            stdout: String::new(),
            stderr: if exit_code == 0 {
                String::new()
            } else {
                "scripted failure".to_string()
            },
            exit_code,
        })
    }

    async fn write_file(
        &mut self,
        content: &str,
        remote_path: &str,
        mode: u32,
    ) -> Result<(), ConnectionError> {
        self.transport.uploads.lock().unwrap().push(UploadRecord {
            path: remote_path.to_string(),
            content: content.to_string(),
            mode,
        });
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        Ok(())
    }
}

/// Probe that reports live from the nth observation on
pub struct FakeProbe {
    ready_after: u32,
    calls: AtomicU32,
}

impl FakeProbe {
    /// Live from the `n`th call on (1 = immediately)
    pub fn ready_after(n: u32) -> Self {
        Self {
            ready_after: n,
            calls: AtomicU32::new(0),
        }
    }

    pub fn never() -> Self {
        Self {
            ready_after: u32::MAX,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Probe for FakeProbe {
    async fn is_live(&self, _endpoint: &Url) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst) + 1 >= self.ready_after
    }
}
