#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod client;
pub mod exporter;
pub mod lease;
pub mod meta;
pub mod secret;
pub mod selector;
pub mod subject;

pub use self::{
    client::{Client, ClientSpec, ClientStatus},
    exporter::{DeviceReport, Exporter, ExporterSpec, ExporterStatus},
    lease::{Lease, LeaseSpec, LeaseStatus},
    meta::{condition_is_true, get_condition, set_condition, Condition, ConditionStatus, ObjectMeta},
    secret::Secret,
    selector::Selector,
    subject::{Kind, Subject, DEFAULT_INTERNAL_PREFIX},
};

/// A declarative resource: stable name within a namespace, spec/status
/// halves, revisioned metadata.
///
/// The store needs uniform access to metadata and the ability to splice spec
/// and status writes without clobbering the other half; resources provide
/// the splicing hooks rather than exposing their halves generically.
pub trait Resource: Clone + PartialEq + std::fmt::Debug + Send + Sync + 'static {
    const KIND: Kind;

    fn metadata(&self) -> &ObjectMeta;
    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    /// True when the desired-state half (spec and labels) is unchanged;
    /// drives the generation counter.
    fn spec_eq(&self, other: &Self) -> bool;

    /// Overwrites this resource's status with `other`'s.
    fn copy_status_from(&mut self, other: &Self);

    /// Overwrites this resource's spec (and labels) with `other`'s.
    fn copy_spec_from(&mut self, other: &Self);

    fn name(&self) -> &str {
        &self.metadata().name
    }

    fn namespace(&self) -> &str {
        &self.metadata().namespace
    }

    fn subject(&self) -> Subject {
        Subject {
            namespace: self.metadata().namespace.clone(),
            kind: Self::KIND,
            name: self.metadata().name.clone(),
        }
    }
}
