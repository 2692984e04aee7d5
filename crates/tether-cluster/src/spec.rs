//! Service spec construction.
//!
//! Turns a plugin-level configuration into the concrete service spec
//! handed to the orchestrator: image selection by OS family, single
//! replica, restart and health-check policy, VIP endpoint, one network.

use tether_core::OsFamily;

use crate::api::PortConfig;
use crate::error::{ClusterError, ClusterResult};

/// Linux plugin image repository.
pub const LINUX_PLUGIN_IMAGE: &str = "tether/plugin";

/// Windows plugin image repository.
pub const WINDOWS_PLUGIN_IMAGE: &str = "tether/plugin-windows";

/// Placement constraint pinning a task to Windows workers.
pub const NT_NODE_CONSTRAINT: &str = "node.labels.os == nt";

/// Overlay network plugin services attach to.
pub const DEFAULT_NETWORK: &str = "tether-net";

/// Label the orchestrator puts on services that belong to a deployment
/// bundle; those services are never touched by this control plane.
pub const STACK_NAMESPACE_LABEL: &str = "com.docker.stack.namespace";

/// A bind mount for a plugin service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub source: String,
    pub target: String,
}

/// Plugin-level service configuration, as composed from a plugin row.
#[derive(Debug, Clone, Default)]
pub struct PluginServiceConfig {
    pub environment: Vec<String>,
    pub network: String,
    pub os: OsFamily,
    pub ports: Vec<PortConfig>,
    pub service_name: String,
    pub volumes: Vec<VolumeMount>,
    /// Node-facing address the plugin advertises, if bound.
    pub address: String,
}

/// The concrete spec sent to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub network: String,
    pub constraints: Vec<String>,
    pub replicas: u64,
    pub restart_max_attempts: u64,
    pub stop_grace_secs: u64,
    pub health_interval_secs: u64,
    pub health_timeout_secs: u64,
    pub health_retries: u64,
    /// DNS endpoint mode; always `vip`.
    pub endpoint_mode: &'static str,
    pub ports: Vec<PortConfig>,
    pub volumes: Vec<VolumeMount>,
}

impl PluginServiceConfig {
    /// Build the orchestrator spec for this plugin.
    ///
    /// `tag` is the image tag suffix from the daemon configuration.
    pub fn build(&self, tag: &str) -> ClusterResult<ServiceSpec> {
        if self.service_name.is_empty() {
            return Err(ClusterError::InvalidConfig(
                "service name must not be empty".to_string(),
            ));
        }
        if self.network.is_empty() {
            return Err(ClusterError::InvalidConfig(
                "network must not be empty".to_string(),
            ));
        }

        let (image, constraints) = match self.os {
            OsFamily::Nt => (
                format!("{WINDOWS_PLUGIN_IMAGE}:{tag}"),
                vec![NT_NODE_CONSTRAINT.to_string()],
            ),
            OsFamily::Posix | OsFamily::All => {
                (format!("{LINUX_PLUGIN_IMAGE}:{tag}"), Vec::new())
            }
        };

        Ok(ServiceSpec {
            name: self.service_name.clone(),
            image,
            env: self.environment.clone(),
            network: self.network.clone(),
            constraints,
            replicas: 1,
            restart_max_attempts: 3,
            stop_grace_secs: 1,
            health_interval_secs: 1,
            health_timeout_secs: 3,
            health_retries: 3,
            endpoint_mode: "vip",
            ports: self.ports.clone(),
            volumes: self.volumes.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::Protocol;

    fn base_config() -> PluginServiceConfig {
        PluginServiceConfig {
            environment: vec!["PLUGIN=Harness".to_string()],
            network: DEFAULT_NETWORK.to_string(),
            os: OsFamily::All,
            ports: vec![PortConfig {
                target: 5000,
                published: 5000,
                protocol: Protocol::Tcp,
            }],
            service_name: "Harness-5000".to_string(),
            volumes: vec![],
            address: String::new(),
        }
    }

    #[test]
    fn linux_image_for_posix_and_all() {
        let spec = base_config().build("latest").unwrap();
        assert_eq!(spec.image, "tether/plugin:latest");
        assert!(spec.constraints.is_empty());

        let mut config = base_config();
        config.os = OsFamily::Posix;
        let spec = config.build("dev").unwrap();
        assert_eq!(spec.image, "tether/plugin:dev");
    }

    #[test]
    fn windows_image_gets_nt_constraint() {
        let mut config = base_config();
        config.os = OsFamily::Nt;
        let spec = config.build("latest").unwrap();
        assert_eq!(spec.image, "tether/plugin-windows:latest");
        assert_eq!(spec.constraints, vec![NT_NODE_CONSTRAINT.to_string()]);
    }

    #[test]
    fn fixed_policy_fields() {
        let spec = base_config().build("latest").unwrap();
        assert_eq!(spec.replicas, 1);
        assert_eq!(spec.restart_max_attempts, 3);
        assert_eq!(spec.stop_grace_secs, 1);
        assert_eq!(spec.health_interval_secs, 1);
        assert_eq!(spec.health_timeout_secs, 3);
        assert_eq!(spec.health_retries, 3);
        assert_eq!(spec.endpoint_mode, "vip");
    }

    #[test]
    fn empty_name_is_invalid() {
        let mut config = base_config();
        config.service_name.clear();
        let err = config.build("latest").unwrap_err();
        assert!(matches!(err, ClusterError::InvalidConfig(_)));
    }

    #[test]
    fn empty_network_is_invalid() {
        let mut config = base_config();
        config.network.clear();
        let err = config.build("latest").unwrap_err();
        assert!(matches!(err, ClusterError::InvalidConfig(_)));
    }

    #[test]
    fn env_and_ports_carried_through() {
        let spec = base_config().build("latest").unwrap();
        assert_eq!(spec.env, vec!["PLUGIN=Harness".to_string()]);
        assert_eq!(spec.ports.len(), 1);
        assert_eq!(spec.ports[0].published, 5000);
    }
}
