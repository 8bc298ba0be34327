//! Client for the upstream panel that actually creates compute instances.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::config::{ProvisionerConfig, TemplateInfo};
use crate::error::{Result, TalonError};

/// Container limits sent with a creation call. Ram and disk are megabytes,
/// cpu a percentage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceLimits {
    pub memory: u64,
    pub disk: u64,
    pub cpu: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeployFlags {
    pub locations: Vec<u32>,
    pub dedicated_ip: bool,
    pub port_range: Vec<String>,
}

/// Fully resolved creation request with its template merged in. This is
/// what one upstream call carries.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateSpec {
    pub owner: String,
    pub name: String,
    pub limits: InstanceLimits,
    pub deploy: DeployFlags,
    pub template: TemplateInfo,
}

impl CreateSpec {
    /// Panel wire format.
    pub fn payload(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "user": self.owner,
            "egg": self.template.egg,
            "docker_image": self.template.docker_image,
            "startup": self.template.startup,
            "environment": self.template.environment,
            "limits": {
                "memory": self.limits.memory,
                "swap": 0,
                "disk": self.limits.disk,
                "io": 500,
                "cpu": self.limits.cpu,
            },
            "feature_limits": { "databases": 0, "backups": 0 },
            "deploy": {
                "locations": self.deploy.locations,
                "dedicated_ip": self.deploy.dedicated_ip,
                "port_range": self.deploy.port_range,
            },
        })
    }
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Exactly one call per claimed queue item. Success means the instance
    /// exists upstream; any error is reported as-is and the queue decides
    /// whether to retry.
    async fn create_instance(&self, spec: &CreateSpec) -> Result<()>;
}

pub struct HttpProvisioner {
    client: reqwest::Client,
    endpoint: String,
    token: String,
}

impl HttpProvisioner {
    pub fn new(config: &ProvisionerConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        }
    }
}

#[async_trait]
impl Provisioner for HttpProvisioner {
    async fn create_instance(&self, spec: &CreateSpec) -> Result<()> {
        let url = format!("{}/api/application/servers", self.endpoint);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&spec.payload())
            .send()
            .await
            .map_err(|e| TalonError::Upstream(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TalonError::Upstream(format!(
                "panel returned {}: {}",
                status, body
            )));
        }
        debug!("created instance `{}` for {}", spec.name, spec.owner);
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_payload_carries_template_and_limits() {
        let spec = CreateSpec {
            owner: "42".to_string(),
            name: "my-server".to_string(),
            limits: InstanceLimits {
                memory: 1024,
                disk: 2048,
                cpu: 100,
            },
            deploy: DeployFlags {
                locations: vec![1],
                dedicated_ip: false,
                port_range: vec![],
            },
            template: TemplateInfo {
                egg: 3,
                docker_image: "ghcr.io/pterodactyl/yolks:java_17".to_string(),
                startup: "java -jar server.jar".to_string(),
                environment: HashMap::from([(
                    "SERVER_JARFILE".to_string(),
                    "server.jar".to_string(),
                )]),
            },
        };
        let payload = spec.payload();
        assert_eq!(payload["user"], "42");
        assert_eq!(payload["egg"], 3);
        assert_eq!(payload["limits"]["memory"], 1024);
        assert_eq!(payload["deploy"]["locations"][0], 1);
        assert_eq!(payload["environment"]["SERVER_JARFILE"], "server.jar");
    }
}
