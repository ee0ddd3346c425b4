use crate::{meta::ObjectMeta, Kind, Resource};
use serde::{Deserialize, Serialize};

/// A test driver that leases exporters and dials routed streams to them.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ClientSpec,
    #[serde(default)]
    pub status: ClientStatus,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientSpec {
    /// Maps an externally-authenticated username onto this client.
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientStatus {
    #[serde(default)]
    pub credential_ref: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl Resource for Client {
    const KIND: Kind = Kind::Client;

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
