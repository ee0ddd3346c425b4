use prometheus_client::{
    metrics::counter::Counter,
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct RouterMetrics {
    pairings: Counter,
    expired_waiters: Counter,
    forwarded_frames: Counter,
}

impl RouterMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        reg.register(
            "pairings",
            "Total number of stream pairs successfully matched",
            metrics.pairings.clone(),
        );
        reg.register(
            "expired_waiters",
            "Total number of half-connected streams dropped at token expiry",
            metrics.expired_waiters.clone(),
        );
        reg.register(
            "forwarded_frames",
            "Total number of frames copied between paired streams",
            metrics.forwarded_frames.clone(),
        );
        metrics
    }

    pub(crate) fn pairing(&self) {
        self.pairings.inc();
    }

    pub(crate) fn expired_waiter(&self) {
        self.expired_waiters.inc();
    }

    pub(crate) fn frame(&self) {
        self.forwarded_frames.inc();
    }
}
