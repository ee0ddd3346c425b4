use crate::{meta::ObjectMeta, Kind, Resource};
use serde::{Deserialize, Serialize};

/// An opaque credential blob, referenced from an exporter's or client's
/// status. Secrets have no status half.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Secret {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub data: Vec<u8>,
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secret")
            .field("metadata", &self.metadata)
            .field("data", &format_args!("[{} bytes redacted]", self.data.len()))
            .finish()
    }
}

impl Resource for Secret {
    const KIND: Kind = Kind::Secret;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn spec_eq(&self, other: &Self) -> bool {
        self.data == other.data && self.metadata.labels == other.metadata.labels
    }

    fn copy_status_from(&mut self, _other: &Self) {}

    fn copy_spec_from(&mut self, other: &Self) {
        self.data = other.data.clone();
        self.metadata.labels = other.metadata.labels.clone();
    }
}
