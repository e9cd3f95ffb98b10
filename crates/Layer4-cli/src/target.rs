//! Target flags

use clap::Args;
use std::path::PathBuf;
use xrun_foundation::{
    DockerTarget, Error, KubernetesTarget, RemoteDockerTarget, Result, SshTarget, Target,
};

/// Where to run. No target flag means the local host.
#[derive(Args, Debug, Default, Clone)]
pub struct TargetArgs {
    /// SSH host
    #[arg(long, value_name = "USER@HOST[:PORT]", conflicts_with_all = ["docker", "image", "pod"])]
    pub ssh: Option<String>,

    /// Private key for --ssh
    #[arg(long, value_name = "PATH", requires = "ssh")]
    pub key: Option<PathBuf>,

    /// Environment variable holding the key passphrase
    #[arg(long, value_name = "VAR", requires = "key")]
    pub passphrase_env: Option<String>,

    /// Environment variable holding the SSH password
    #[arg(long, value_name = "VAR", requires = "ssh")]
    pub password_env: Option<String>,

    /// Running container to exec into
    #[arg(long, value_name = "NAME", conflicts_with_all = ["image", "pod"])]
    pub docker: Option<String>,

    /// Image to run an ephemeral container from
    #[arg(long, value_name = "IMAGE", conflicts_with = "pod")]
    pub image: Option<String>,

    /// User inside the container
    #[arg(long, value_name = "USER")]
    pub user: Option<String>,

    /// Kubernetes pod
    #[arg(long, value_name = "POD")]
    pub pod: Option<String>,

    #[arg(short = 'n', long, value_name = "NAMESPACE", requires = "pod")]
    pub namespace: Option<String>,

    /// Container within the pod
    #[arg(short = 'c', long, value_name = "CONTAINER", requires = "pod")]
    pub container: Option<String>,

    #[arg(long, value_name = "CONTEXT", requires = "pod")]
    pub context: Option<String>,

    #[arg(long, value_name = "PATH", requires = "pod")]
    pub kubeconfig: Option<PathBuf>,

    /// Container on the --ssh host, reached with the remote docker CLI
    #[arg(long, value_name = "NAME", requires = "ssh")]
    pub remote_docker: Option<String>,
}

impl TargetArgs {
    pub fn to_target(&self) -> Result<Target> {
        if let Some(spec) = &self.ssh {
            let ssh = self.ssh_target(spec)?;
            return Ok(match &self.remote_docker {
                Some(container) => Target::RemoteDocker(RemoteDockerTarget {
                    ssh,
                    docker: self.docker_target(DockerTarget::container(container)),
                }),
                None => Target::Ssh(ssh),
            });
        }
        if let Some(name) = &self.docker {
            return Ok(Target::Docker(self.docker_target(DockerTarget::container(name))));
        }
        if let Some(image) = &self.image {
            return Ok(Target::Docker(self.docker_target(DockerTarget::image(image))));
        }
        if let Some(pod) = &self.pod {
            let mut target = KubernetesTarget::new(pod);
            if let Some(ns) = &self.namespace {
                target = target.with_namespace(ns);
            }
            if let Some(container) = &self.container {
                target = target.with_container(container);
            }
            if let Some(context) = &self.context {
                target = target.with_context(context);
            }
            target.kubeconfig = self.kubeconfig.clone();
            return Ok(Target::Kubernetes(target));
        }
        Ok(Target::local())
    }

    fn docker_target(&self, mut target: DockerTarget) -> DockerTarget {
        if let Some(user) = &self.user {
            target = target.with_user(user);
        }
        target
    }

    fn ssh_target(&self, spec: &str) -> Result<SshTarget> {
        let (user, host, port) = parse_ssh(spec)?;
        let mut target = SshTarget::new(host, user).with_port(port);

        if let Some(path) = &self.key {
            target = target.with_private_key(path);
            if let Some(var) = &self.passphrase_env {
                target = target.with_passphrase(read_env(var)?);
            }
        }
        if let Some(var) = &self.password_env {
            target = target.with_password(read_env(var)?);
        }
        if target.private_key.is_none() && target.password.is_none() {
            if let Some(path) = default_identity() {
                target = target.with_private_key(path);
            }
        }
        Ok(target)
    }
}

/// `user@host[:port]`
pub fn parse_ssh(spec: &str) -> Result<(String, String, u16)> {
    let invalid = || Error::Validation(format!("expected USER@HOST[:PORT], got {:?}", spec));
    let (user, rest) = spec.split_once('@').ok_or_else(invalid)?;
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
        None => (rest, 22),
    };
    if user.is_empty() || host.is_empty() {
        return Err(invalid());
    }
    Ok((user.to_string(), host.to_string(), port))
}

fn read_env(var: &str) -> Result<String> {
    std::env::var(var).map_err(|_| Error::Validation(format!("environment variable {} is not set", var)))
}

fn default_identity() -> Option<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from)?;
    ["id_ed25519", "id_ecdsa", "id_rsa"]
        .iter()
        .map(|name| home.join(".ssh").join(name))
        .find(|path| path.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ssh() {
        assert_eq!(
            parse_ssh("deploy@web-1").unwrap(),
            ("deploy".to_string(), "web-1".to_string(), 22)
        );
        assert_eq!(parse_ssh("root@10.0.0.5:2222").unwrap().2, 2222);
        assert!(parse_ssh("web-1").is_err());
        assert!(parse_ssh("@web-1").is_err());
        assert!(parse_ssh("a@b:notaport").is_err());
    }

    #[test]
    fn test_default_is_local() {
        assert_eq!(TargetArgs::default().to_target().unwrap(), Target::local());
    }

    #[test]
    fn test_pod_flags() {
        let args = TargetArgs {
            pod: Some("api-0".into()),
            namespace: Some("prod".into()),
            container: Some("app".into()),
            ..Default::default()
        };
        let Target::Kubernetes(pod) = args.to_target().unwrap() else {
            panic!("expected a kubernetes target");
        };
        assert_eq!(pod.namespace, "prod");
        assert_eq!(pod.container.as_deref(), Some("app"));
    }

    #[test]
    fn test_remote_docker_flags() {
        let args = TargetArgs {
            ssh: Some("ci@build-1".into()),
            key: Some("/tmp/id_test".into()),
            remote_docker: Some("web".into()),
            user: Some("app".into()),
            ..Default::default()
        };
        let Target::RemoteDocker(remote) = args.to_target().unwrap() else {
            panic!("expected a remote docker target");
        };
        assert_eq!(remote.ssh.host, "build-1");
        assert_eq!(remote.docker.container.as_deref(), Some("web"));
        assert_eq!(remote.docker.user.as_deref(), Some("app"));
    }
}
