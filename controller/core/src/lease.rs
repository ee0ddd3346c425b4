use crate::{
    meta::{condition_is_true, get_condition, Condition, ObjectMeta},
    Kind, Resource, Selector,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// An exclusive, time-bounded reservation of one exporter by one client.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: LeaseSpec,
    #[serde(default)]
    pub status: LeaseStatus,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LeaseSpec {
    pub selector: Selector,

    /// Requested duration. `None` is an explicitly-unbounded lease; whether
    /// those are permitted is a controller policy decision.
    #[serde(default)]
    pub duration: Option<Duration>,

    /// Explicit exporter binding, overriding the selector.
    #[serde(default)]
    pub exporter: Option<String>,

    /// Client-set flag requesting early termination. Setting it is
    /// idempotent; it never resurrects a terminal lease.
    #[serde(default)]
    pub release: bool,

    /// Name of the client the lease was created for.
    #[serde(default)]
    pub client: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LeaseStatus {
    /// Bound exporter; empty until the lease becomes ready.
    #[serde(default)]
    pub exporter: Option<String>,

    #[serde(default)]
    pub begin_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

pub mod condition {
    pub const PENDING: &str = "Pending";
    pub const READY: &str = "Ready";
    pub const UNSATISFIABLE: &str = "Unsatisfiable";
    pub const INVALID: &str = "Invalid";
    pub const EXPIRED: &str = "Expired";
}

impl Lease {
    pub fn is_ready(&self) -> bool {
        condition_is_true(&self.status.conditions, condition::READY)
    }

    pub fn is_pending(&self) -> bool {
        condition_is_true(&self.status.conditions, condition::PENDING)
    }

    pub fn is_invalid(&self) -> bool {
        condition_is_true(&self.status.conditions, condition::INVALID)
    }

    /// A lease is terminal once its end time has been written and it is no
    /// longer ready. Terminal leases are immutable except for collection.
    pub fn is_terminal(&self) -> bool {
        self.status.end_time.is_some() && !self.is_ready()
    }

    /// Reason of the dominant condition, for reporting. A terminal lease
    /// reports why it stopped being ready (Released, Expired, eviction).
    pub fn reason(&self) -> &str {
        for type_ in [
            condition::INVALID,
            condition::UNSATISFIABLE,
            condition::EXPIRED,
            condition::READY,
            condition::PENDING,
        ] {
            if let Some(cond) = get_condition(&self.status.conditions, type_) {
                if cond.is_true() {
                    return &cond.reason;
                }
            }
        }
        get_condition(&self.status.conditions, condition::READY)
            .map(|c| c.reason.as_str())
            .unwrap_or("")
    }
}

impl Resource for Lease {
    const KIND: Kind = Kind::Lease;

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
