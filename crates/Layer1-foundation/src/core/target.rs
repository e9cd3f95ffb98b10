//! Target descriptors
//!
//! A `Target` is the resolved destination of one execution. Exactly one
//! variant is populated, and the variant tag selects the adapter.

use super::options::is_valid_env_name;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Adapter selector derived from a [`Target`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TargetKind {
    Local,
    Ssh,
    Docker,
    Kubernetes,
    RemoteDocker,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Ssh => "ssh",
            Self::Docker => "docker",
            Self::Kubernetes => "kubernetes",
            Self::RemoteDocker => "remote-docker",
        }
    }
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalTarget {
    /// Default working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// Default environment, merged beneath the per-call overlay
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// SSH host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshTarget {
    pub host: String,
    pub user: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<PathBuf>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default, skip_serializing)]
    pub passphrase: Option<String>,
    /// Send keepalives on the pooled session
    #[serde(default = "default_true")]
    pub keep_alive: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_true() -> bool {
    true
}

impl SshTarget {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            port: default_ssh_port(),
            private_key: None,
            password: None,
            passphrase: None,
            keep_alive: true,
            env: BTreeMap::new(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_private_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.private_key = Some(path.into());
        self
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// `ssh://user@host:port`
    pub fn label(&self) -> String {
        format!("ssh://{}@{}:{}", self.user, self.host, self.port)
    }

    fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Validation("ssh target requires a host".into()));
        }
        if self.user.trim().is_empty() {
            return Err(Error::Validation("ssh target requires a user".into()));
        }
        if self.port == 0 {
            return Err(Error::Validation("ssh port must be non-zero".into()));
        }
        if self.private_key.is_none() && self.password.is_none() {
            return Err(Error::Validation(format!(
                "{}: either a private key or a password is required",
                self.label()
            )));
        }
        Ok(())
    }
}

/// Docker container, or an image to run an ephemeral container from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    #[serde(default)]
    pub tty: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl DockerTarget {
    pub fn container(name: impl Into<String>) -> Self {
        Self {
            container: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn image(image: impl Into<String>) -> Self {
        Self {
            image: Some(image.into()),
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_workdir(mut self, dir: impl Into<String>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn label(&self) -> String {
        match (&self.container, &self.image) {
            (Some(c), _) => format!("docker://{}", c),
            (None, Some(i)) => format!("docker+image://{}", i),
            (None, None) => "docker://?".to_string(),
        }
    }

    fn validate(&self) -> Result<()> {
        match (&self.container, &self.image) {
            (Some(c), None) if !c.trim().is_empty() => Ok(()),
            (None, Some(i)) if !i.trim().is_empty() => Ok(()),
            (Some(_), Some(_)) => Err(Error::Validation(
                "docker target takes a container or an image, not both".into(),
            )),
            _ => Err(Error::Validation(
                "docker target requires a container or an image".into(),
            )),
        }
    }
}

/// Kubernetes pod
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesTarget {
    pub pod: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default)]
    pub tty: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_namespace() -> String {
    "default".to_string()
}

impl KubernetesTarget {
    pub fn new(pod: impl Into<String>) -> Self {
        Self {
            pod: pod.into(),
            namespace: default_namespace(),
            container: None,
            kubeconfig: None,
            context: None,
            tty: false,
            env: BTreeMap::new(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn label(&self) -> String {
        match &self.container {
            Some(c) => format!("k8s://{}/{}/{}", self.namespace, self.pod, c),
            None => format!("k8s://{}/{}", self.namespace, self.pod),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.pod.trim().is_empty() {
            return Err(Error::Validation("kubernetes target requires a pod".into()));
        }
        if self.namespace.trim().is_empty() {
            return Err(Error::Validation(
                "kubernetes namespace must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Docker container reached through an SSH host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDockerTarget {
    pub ssh: SshTarget,
    pub docker: DockerTarget,
}

impl RemoteDockerTarget {
    pub fn label(&self) -> String {
        format!(
            "{}/{}",
            self.ssh.label(),
            self.docker.container.as_deref().unwrap_or("?")
        )
    }

    fn validate(&self) -> Result<()> {
        self.ssh.validate()?;
        self.docker.validate()?;
        if self.docker.container.is_none() {
            return Err(Error::Validation(
                "remote docker target requires a running container".into(),
            ));
        }
        Ok(())
    }
}

/// Resolved execution destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Target {
    Local(LocalTarget),
    Ssh(SshTarget),
    Docker(DockerTarget),
    Kubernetes(KubernetesTarget),
    RemoteDocker(RemoteDockerTarget),
}

impl Default for Target {
    fn default() -> Self {
        Self::Local(LocalTarget::default())
    }
}

impl Target {
    pub fn local() -> Self {
        Self::default()
    }

    pub fn kind(&self) -> TargetKind {
        match self {
            Self::Local(_) => TargetKind::Local,
            Self::Ssh(_) => TargetKind::Ssh,
            Self::Docker(_) => TargetKind::Docker,
            Self::Kubernetes(_) => TargetKind::Kubernetes,
            Self::RemoteDocker(_) => TargetKind::RemoteDocker,
        }
    }

    /// Short display identity, also used in error messages
    pub fn label(&self) -> String {
        match self {
            Self::Local(_) => "local".to_string(),
            Self::Ssh(t) => t.label(),
            Self::Docker(t) => t.label(),
            Self::Kubernetes(t) => t.label(),
            Self::RemoteDocker(t) => t.label(),
        }
    }

    /// Default environment carried by the target
    pub fn env(&self) -> &BTreeMap<String, String> {
        match self {
            Self::Local(t) => &t.env,
            Self::Ssh(t) => &t.env,
            Self::Docker(t) => &t.env,
            Self::Kubernetes(t) => &t.env,
            Self::RemoteDocker(t) => &t.docker.env,
        }
    }

    /// Check the parameters the selected adapter needs
    pub fn validate(&self) -> Result<()> {
        if let Some(key) = self.env().keys().find(|k| !is_valid_env_name(k)) {
            return Err(Error::Validation(format!(
                "{}: invalid environment variable name: {:?}",
                self.label(),
                key
            )));
        }
        match self {
            Self::Local(_) => Ok(()),
            Self::Ssh(t) => t.validate(),
            Self::Docker(t) => t.validate(),
            Self::Kubernetes(t) => t.validate(),
            Self::RemoteDocker(t) => t.validate(),
        }
    }
}

impl From<SshTarget> for Target {
    fn from(t: SshTarget) -> Self {
        Self::Ssh(t)
    }
}

impl From<DockerTarget> for Target {
    fn from(t: DockerTarget) -> Self {
        Self::Docker(t)
    }
}

impl From<KubernetesTarget> for Target {
    fn from(t: KubernetesTarget) -> Self {
        Self::Kubernetes(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_kind_and_label() {
        let ssh: Target = SshTarget::new("example.com", "deploy")
            .with_port(2222)
            .with_password("pw")
            .into();
        assert_eq!(ssh.kind(), TargetKind::Ssh);
        assert_eq!(ssh.label(), "ssh://deploy@example.com:2222");

        let pod: Target = KubernetesTarget::new("web-0")
            .with_namespace("prod")
            .with_container("app")
            .into();
        assert_eq!(pod.label(), "k8s://prod/web-0/app");
    }

    #[test]
    fn test_validation() {
        assert!(Target::local().validate().is_ok());
        assert!(Target::Ssh(SshTarget::new("h", "u")).validate().is_err());
        assert!(Target::Ssh(SshTarget::new("h", "u").with_private_key("/k"))
            .validate()
            .is_ok());

        let both = DockerTarget {
            container: Some("c".into()),
            image: Some("alpine".into()),
            ..Default::default()
        };
        assert!(Target::Docker(both).validate().is_err());
        assert!(Target::Docker(DockerTarget::default()).validate().is_err());
        assert!(Target::Docker(DockerTarget::image("alpine")).validate().is_ok());

        let remote = RemoteDockerTarget {
            ssh: SshTarget::new("h", "u").with_password("pw"),
            docker: DockerTarget::image("alpine"),
        };
        assert!(Target::RemoteDocker(remote).validate().is_err());
    }

    #[test]
    fn test_tagged_deserialize() {
        let json = r#"{"type":"kubernetes","pod":"api-1","namespace":"staging"}"#;
        let target: Target = serde_json::from_str(json).unwrap();
        match target {
            Target::Kubernetes(k) => {
                assert_eq!(k.pod, "api-1");
                assert_eq!(k.namespace, "staging");
                assert!(k.container.is_none());
            }
            other => panic!("unexpected target: {:?}", other),
        }

        let json = r#"{"type":"ssh","host":"h","user":"u","password":"x"}"#;
        let target: Target = serde_json::from_str(json).unwrap();
        assert_eq!(target.label(), "ssh://u@h:22");
    }

    #[test]
    fn test_secrets_not_serialized() {
        let target: Target = SshTarget::new("h", "u").with_password("hunter2").into();
        let text = serde_json::to_string(&target).unwrap();
        assert!(!text.contains("hunter2"));
    }

    #[test]
    fn test_invalid_target_env_name() {
        let mut local = LocalTarget::default();
        local.env.insert("BAD-NAME".into(), "x".into());
        assert!(matches!(Target::Local(local).validate(), Err(Error::Validation(_))));
    }
}
