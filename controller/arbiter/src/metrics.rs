use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct ArbiterMetrics {
    transitions: Family<TransitionLabels, Counter>,
    active_leases: Gauge,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct TransitionLabels {
    transition: &'static str,
}

impl ArbiterMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        reg.register(
            "lease_transitions",
            "Total number of lease state transitions performed by the arbiter",
            metrics.transitions.clone(),
        );
        reg.register(
            "active_leases",
            "Number of leases currently in the Ready state",
            metrics.active_leases.clone(),
        );
        metrics
    }

    pub(crate) fn transition(&self, transition: &'static str) {
        self.transitions
            .get_or_create(&TransitionLabels { transition })
            .inc();
        match transition {
            "ready" => {
                self.active_leases.inc();
            }
            "expired" | "released" | "evicted" => {
                self.active_leases.dec();
            }
            _ => {}
        }
    }
}
