use crate::{
    meta::{condition_is_true, Condition, ObjectMeta},
    Kind, Resource,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A process attached to physical or virtual hardware, holding a long-lived
/// Listen stream into the controller.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Exporter {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ExporterSpec,
    #[serde(default)]
    pub status: ExporterStatus,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExporterSpec {
    /// Maps an externally-authenticated username onto this exporter.
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExporterStatus {
    /// Name of the secret holding this exporter's issued identity token.
    #[serde(default)]
    pub credential_ref: Option<String>,

    /// Advertised `host:port` of the exporter itself.
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,

    /// Device inventory as last reported; opaque to the controller.
    #[serde(default)]
    pub devices: Vec<DeviceReport>,

    /// Name of the lease currently holding this exporter.
    #[serde(default)]
    pub lease_ref: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceReport {
    pub uuid: String,
    #[serde(default)]
    pub parent_uuid: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

pub mod condition {
    pub const REGISTERED: &str = "Registered";
    pub const ONLINE: &str = "Online";
}

impl Exporter {
    pub fn is_online(&self) -> bool {
        condition_is_true(&self.status.conditions, condition::ONLINE)
    }

    pub fn is_registered(&self) -> bool {
        condition_is_true(&self.status.conditions, condition::REGISTERED)
    }
}

impl Resource for Exporter {
    const KIND: Kind = Kind::Exporter;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn spec_eq(&self, other: &Self) -> bool {
        self.spec == other.spec && self.metadata.labels == other.metadata.labels
    }

    fn copy_status_from(&mut self, other: &Self) {
        self.status = other.status.clone();
    }

    fn copy_spec_from(&mut self, other: &Self) {
        self.spec = other.spec.clone();
        self.metadata.labels = other.metadata.labels.clone();
    }
}
