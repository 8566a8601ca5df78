use serde::Deserialize;
use serde_yaml::Value;
use std::collections::BTreeMap;

/// Aggregated runtime settings of an instance group.
///
/// Parsed per job reference under
/// `properties.bosh_containerization.run`, then folded onto the instance
/// group by the resolver (`calculate_role_run`).
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct RoleRun {
    #[serde(default)]
    pub scaling: Option<RunScaling>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<RunVolume>,
    #[serde(default)]
    pub memory: Option<RunRange<u64>>,
    #[serde(default)]
    pub cpu: Option<RunRange<f64>>,
    #[serde(default)]
    pub healthcheck: Option<HealthCheck>,
    #[serde(default, rename = "active-passive-probe")]
    pub active_passive_probe: String,
    #[serde(default, rename = "service-account")]
    pub service_account: String,
    #[serde(default, rename = "flight-stage")]
    pub flight_stage: String,
    #[serde(default)]
    pub affinity: Option<Affinity>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RunScaling {
    #[serde(default = "default_min")]
    pub min: u32,
    #[serde(default = "default_max")]
    pub max: u32,
    /// Instance count under high availability; 0 means "same as min".
    #[serde(default)]
    pub ha: u32,
    #[serde(default)]
    pub must_be_odd: bool,
}

fn default_min() -> u32 {
    1
}

fn default_max() -> u32 {
    1
}

impl Default for RunScaling {
    fn default() -> Self {
        Self {
            min: default_min(),
            max: default_max(),
            ha: 0,
            must_be_odd: false,
        }
    }
}

impl RunScaling {
    pub fn ha(&self) -> u32 {
        if self.ha == 0 {
            self.min
        } else {
            self.ha
        }
    }
}

/// Resource request/limit pair (memory in MiB, cpu in cores).
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct RunRange<T> {
    #[serde(default)]
    pub request: Option<T>,
    #[serde(default)]
    pub limit: Option<T>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RunVolume {
    #[serde(default, rename = "type")]
    pub volume_type: String,
    pub path: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub size: u32,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct HealthCheck {
    #[serde(default)]
    pub readiness: Option<HealthProbe>,
    #[serde(default)]
    pub liveness: Option<HealthProbe>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct HealthProbe {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub port: u32,
    #[serde(default)]
    pub initial_delay: u32,
    #[serde(default)]
    pub period: u32,
    #[serde(default)]
    pub timeout: u32,
}

/// Pod scheduling affinity. Only pod anti-affinity may be set from the role
/// manifest; node affinity comes from chart values at deploy time.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Affinity {
    #[serde(default, rename = "podAntiAffinity")]
    pub pod_anti_affinity: Option<Value>,
    #[serde(default, rename = "nodeAffinity")]
    pub node_affinity: Option<Value>,
    #[serde(default, rename = "podAffinity")]
    pub pod_affinity: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PortDef {
    pub name: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub internal: u32,
    #[serde(default)]
    pub external: Option<u32>,
    #[serde(default)]
    pub public: bool,
}

fn default_protocol() -> String {
    "TCP".to_owned()
}

impl PortDef {
    pub fn external(&self) -> u32 {
        self.external.unwrap_or(self.internal)
    }
}
