use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct ControllerMetrics {
    dials: Family<OutcomeLabels, Counter>,
    lease_requests: Family<OutcomeLabels, Counter>,
    listens: Family<OutcomeLabels, Counter>,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct OutcomeLabels {
    outcome: &'static str,
}

impl ControllerMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        reg.register(
            "dials",
            "Total number of Dial RPCs by outcome",
            metrics.dials.clone(),
        );
        reg.register(
            "lease_requests",
            "Total number of LeaseExporter RPCs by outcome",
            metrics.lease_requests.clone(),
        );
        reg.register(
            "listens",
            "Total number of Listen registrations by outcome",
            metrics.listens.clone(),
        );
        metrics
    }

    pub(crate) fn dial(&self, outcome: &'static str) {
        self.dials.get_or_create(&OutcomeLabels { outcome }).inc();
    }

    pub(crate) fn lease_request(&self, outcome: &'static str) {
        self.lease_requests
            .get_or_create(&OutcomeLabels { outcome })
            .inc();
    }

    pub(crate) fn listen(&self, outcome: &'static str) {
        self.listens.get_or_create(&OutcomeLabels { outcome }).inc();
    }
}
