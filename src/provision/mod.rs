/// Provisioning engine: renders the kubelet service unit and installs it
/// on the VM over an open remote session
use handlebars::Handlebars;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::KubernetesConfig;
use crate::remote::{ConnectionError, RemoteCommand, Session};

/// Remote filesystem contract. These paths are fixed: the unit text, the
/// health of re-provisioning, and the tests all depend on them never varying
/// at runtime.
pub const KUBELET_UNIT_PATH: &str = "/etc/systemd/system/kubelet.service";
pub const KUBELET_UNIT_NAME: &str = "kubelet.service";
pub const KUBELET_UNIT_MODE: u32 = 0o644;
#[allow(dead_code)]
pub const MANIFEST_DIR: &str = "/etc/kubernetes/manifests";
#[allow(dead_code)]
pub const KUBELET_LOCK_FILE: &str = "/var/run/lock/kubelet.lock";
#[allow(dead_code)]
pub const KUBELET_POD_UUID_FILE: &str = "/var/run/kubelet-pod.uuid";

const UNIT_TEMPLATE_NAME: &str = "kubelet-unit";

/// The kubelet runs as a hyperkube container under rkt, supervised by
/// systemd. Interpolated fields come from `KubernetesConfig`; every other
/// path in here is part of the fixed filesystem contract above.
const KUBELET_UNIT_TEMPLATE: &str = r#"[Unit]
Description=Kubelet via Hyperkube ACI

[Service]
Environment="RKT_RUN_ARGS=--uuid-file-save=/var/run/kubelet-pod.uuid \
  --volume=resolv,kind=host,source=/etc/resolv.conf \
  --mount volume=resolv,target=/etc/resolv.conf \
  --volume var-lib-cni,kind=host,source=/var/lib/cni \
  --mount volume=var-lib-cni,target=/var/lib/cni \
  --volume var-log,kind=host,source=/var/log \
  --mount volume=var-log,target=/var/log \
  --volume etc-kubernetes,kind=host,source=/etc/kubernetes,readOnly=false \
  --volume etc-ssl-certs,kind=host,source=/etc/ssl/certs,readOnly=true \
  --volume usr-share-certs,kind=host,source=/usr/share/ca-certificates,readOnly=true \
  --volume var-lib-docker,kind=host,source=/var/lib/docker,readOnly=false \
  --volume var-lib-kubelet,kind=host,source=/var/lib/kubelet,readOnly=false,recursive=true \
  --volume os-release,kind=host,source=/usr/lib/os-release,readOnly=true \
  --volume run,kind=host,source=/run,readOnly=false \
  --mount volume=etc-kubernetes,target=/etc/kubernetes \
  --mount volume=etc-ssl-certs,target=/etc/ssl/certs \
  --mount volume=usr-share-certs,target=/usr/share/ca-certificates \
  --mount volume=var-lib-docker,target=/var/lib/docker \
  --mount volume=var-lib-kubelet,target=/var/lib/kubelet \
  --mount volume=os-release,target=/etc/os-release \
  --mount volume=run,target=/run"

ExecStartPre=/bin/mkdir -p /etc/kubernetes/manifests \
  /srv/kubernetes/manifests /etc/kubernetes/checkpoint-secrets \
  /etc/kubernetes/cni/net.d /var/lib/cni \
  /var/lib/docker /var/lib/kubelet /run/kubelet
ExecStartPre=-/bin/rkt rm --uuid-file=/var/run/kubelet-pod.uuid

ExecStart=/bin/rkt run ${RKT_RUN_ARGS} \
  docker://gcr.io/google_containers/hyperkube-amd64:{{kubernetes_version}} \
  --exec=/kubelet \
  -- \
  --tls-cert-file={{server_cert}} \
  --tls-private-key-file={{server_key}} \
  --cni-conf-dir=/etc/kubernetes/cni/net.d \
  --network-plugin={{network_plugin}} \
  --lock-file=/var/run/lock/kubelet.lock \
  --exit-on-lock-contention \
  --pod-manifest-path=/etc/kubernetes/manifests \
  --allow-privileged \
  --minimum-container-ttl-duration=6m0s \
  --cluster-domain={{dns_domain}} \
  --client-ca-file={{ca_cert}} \
  --anonymous-auth=false
ExecStop=-/bin/rkt stop --uuid-file=/var/run/kubelet-pod.uuid

Restart=always
RestartSec=10

[Install]
WantedBy=multi-user.target
"#;

/// Provisioning failure. Template and Config are render-time problems and
/// never retryable; CommandFailed carries the failing remote command.
#[derive(Debug, Clone, Error)]
pub enum ProvisionError {
    #[error("bad kubelet unit template: {0}")]
    Template(String),

    #[error("incomplete cluster configuration: {0}")]
    Config(String),

    #[error("remote command `{command}` failed with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Rendered unit content plus where it lands on the VM. Ephemeral: produced
/// per provisioning run, never persisted on the host side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionScript {
    pub content: String,
    pub target_path: String,
    pub mode: u32,
}

#[derive(Serialize)]
struct UnitContext<'a> {
    kubernetes_version: &'a str,
    dns_domain: &'a str,
    network_plugin: &'a str,
    server_cert: &'a str,
    server_key: &'a str,
    ca_cert: &'a str,
}

/// Renders the kubelet unit and pushes it through a remote session
pub struct ProvisioningEngine {
    registry: Handlebars<'static>,
}

impl ProvisioningEngine {
    pub fn new() -> Result<Self, ProvisionError> {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry.register_escape_fn(handlebars::no_escape);
        registry
            .register_template_string(UNIT_TEMPLATE_NAME, KUBELET_UNIT_TEMPLATE)
            .map_err(|e| ProvisionError::Template(e.to_string()))?;
        Ok(Self { registry })
    }

    /// Render the kubelet service unit for the given configuration.
    ///
    /// Pure and deterministic: identical input produces byte-identical
    /// output, which is what makes re-provisioning idempotent.
    pub fn render_unit(&self, config: &KubernetesConfig) -> Result<ProvisionScript, ProvisionError> {
        require_field("kubernetes.version", &config.version)?;
        require_field("kubernetes.dns_domain", &config.dns_domain)?;
        require_field("kubernetes.network_plugin", &config.network_plugin)?;
        require_field("kubernetes.certs.server_cert", &config.certs.server_cert)?;
        require_field("kubernetes.certs.server_key", &config.certs.server_key)?;
        require_field("kubernetes.certs.ca_cert", &config.certs.ca_cert)?;

        let context = UnitContext {
            kubernetes_version: &config.version,
            dns_domain: &config.dns_domain,
            network_plugin: &config.network_plugin,
            server_cert: &config.certs.server_cert,
            server_key: &config.certs.server_key,
            ca_cert: &config.certs.ca_cert,
        };

        let content = self
            .registry
            .render(UNIT_TEMPLATE_NAME, &context)
            .map_err(|e| ProvisionError::Config(e.to_string()))?;

        Ok(ProvisionScript {
            content,
            target_path: KUBELET_UNIT_PATH.to_string(),
            mode: KUBELET_UNIT_MODE,
        })
    }

    /// Install the rendered unit: upload it, reload unit definitions, enable
    /// the unit, then restart it, in that exact order.
    ///
    /// Restart is best-effort and only logged on failure; reload and enable
    /// failures abort the call.
    pub async fn apply(
        &self,
        session: &mut Session,
        script: &ProvisionScript,
    ) -> Result<(), ProvisionError> {
        info!("Installing kubelet unit at {}", script.target_path);
        session
            .upload(&script.content, &script.target_path, script.mode)
            .await?;

        self.run_step(
            session,
            RemoteCommand::new("systemctl").arg("daemon-reload").sudo(),
        )
        .await?;

        self.run_step(
            session,
            RemoteCommand::new("systemctl")
                .arg("enable")
                .arg(KUBELET_UNIT_NAME)
                .sudo(),
        )
        .await?;

        let restart = RemoteCommand::new("systemctl")
            .arg("restart")
            .arg(KUBELET_UNIT_NAME)
            .sudo();
        let output = session.run(&restart).await?;
        if !output.success() {
            warn!(
                "Restart of {} failed with status {} (continuing): {}",
                KUBELET_UNIT_NAME,
                output.exit_code,
                output.stderr.trim()
            );
        }

        info!("Kubelet unit installed and enabled");
        Ok(())
    }

    async fn run_step(
        &self,
        session: &mut Session,
        command: RemoteCommand,
    ) -> Result<(), ProvisionError> {
        let output = session.run(&command).await?;
        if !output.stdout.is_empty() {
            debug!("{}: {}", command, output.stdout.trim());
        }
        if output.success() {
            Ok(())
        } else {
            Err(ProvisionError::CommandFailed {
                command: command.to_shell(),
                status: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

fn require_field(name: &str, value: &str) -> Result<(), ProvisionError> {
    if value.is_empty() {
        Err(ProvisionError::Config(format!("{} is required", name)))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::config::SshConfig;
    use crate::driver::Endpoint;
    use crate::testutil::FakeTransport;
    use crate::utils::retry::RetryPolicy;
    use std::time::Duration;

    fn test_kubernetes_config() -> KubernetesConfig {
        let mut config = ClusterConfig::example().kubernetes;
        config.version = "1.2.3".to_string();
        config.dns_domain = "cluster.local".to_string();
        config
    }

    async fn open_session(transport: &FakeTransport) -> Session {
        Session::open(
            transport,
            &Endpoint::new("192.168.99.100", 2376),
            &SshConfig::default(),
            &RetryPolicy::new(1, Duration::from_millis(1), 2),
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_render_unit_is_deterministic() {
        let engine = ProvisioningEngine::new().unwrap();
        let config = test_kubernetes_config();

        let first = engine.render_unit(&config).unwrap();
        let second = engine.render_unit(&config).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_render_unit_interpolates_config() {
        let engine = ProvisioningEngine::new().unwrap();
        let script = engine.render_unit(&test_kubernetes_config()).unwrap();

        assert!(script
            .content
            .contains("docker://gcr.io/google_containers/hyperkube-amd64:1.2.3"));
        assert!(script.content.contains("--cluster-domain=cluster.local"));
        assert!(script.content.contains("--network-plugin=cni"));
        assert!(script
            .content
            .contains("--tls-cert-file=/var/lib/localkube/certs/apiserver.crt"));
        assert_eq!(script.target_path, KUBELET_UNIT_PATH);
    }

    #[test]
    fn test_render_unit_keeps_fixed_paths() {
        let engine = ProvisioningEngine::new().unwrap();
        let script = engine.render_unit(&test_kubernetes_config()).unwrap();

        assert!(script.content.contains(MANIFEST_DIR));
        assert!(script.content.contains(KUBELET_LOCK_FILE));
        assert!(script.content.contains(KUBELET_POD_UUID_FILE));
    }

    #[test]
    fn test_render_unit_rejects_missing_fields() {
        let engine = ProvisioningEngine::new().unwrap();
        let mut config = test_kubernetes_config();
        config.version = String::new();

        match engine.render_unit(&config) {
            Err(ProvisionError::Config(msg)) => assert!(msg.contains("kubernetes.version")),
            other => panic!("expected Config error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_apply_runs_service_commands_in_order() {
        let engine = ProvisioningEngine::new().unwrap();
        let transport = FakeTransport::new();
        let mut session = open_session(&transport).await;

        let script = engine.render_unit(&test_kubernetes_config()).unwrap();
        engine.apply(&mut session, &script).await.unwrap();

        let uploads = transport.uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].path, KUBELET_UNIT_PATH);
        assert_eq!(uploads[0].mode, KUBELET_UNIT_MODE);
        assert_eq!(uploads[0].content, script.content);

        let log = transport.command_log();
        assert_eq!(
            log,
            vec![
                "sudo systemctl daemon-reload".to_string(),
                "sudo systemctl enable kubelet.service".to_string(),
                "sudo systemctl restart kubelet.service".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_apply_fails_when_enable_fails() {
        let engine = ProvisioningEngine::new().unwrap();
        let transport = FakeTransport::new().fail_command("enable", 1);
        let mut session = open_session(&transport).await;

        let script = engine.render_unit(&test_kubernetes_config()).unwrap();
        let result = engine.apply(&mut session, &script).await;

        match result {
            Err(ProvisionError::CommandFailed { command, status, .. }) => {
                assert!(command.contains("enable"));
                assert_eq!(status, 1);
            }
            other => panic!("expected CommandFailed, got {:?}", other),
        }

        // The sequence stops before the restart
        let log = transport.command_log();
        assert!(!log.iter().any(|c| c.contains("restart")));
    }

    #[tokio::test]
    async fn test_apply_tolerates_restart_failure() {
        let engine = ProvisioningEngine::new().unwrap();
        let transport = FakeTransport::new().fail_command("restart", 1);
        let mut session = open_session(&transport).await;

        let script = engine.render_unit(&test_kubernetes_config()).unwrap();
        assert!(engine.apply(&mut session, &script).await.is_ok());
    }
}
