use crate::ArbiterMetrics;
use chrono::{DateTime, Utc};
use patchbay_controller_core::{
    exporter::condition::ONLINE,
    get_condition,
    lease::condition::{EXPIRED, INVALID, PENDING, READY, UNSATISFIABLE},
    set_condition, Condition, ConditionStatus, Exporter, Lease, Selector,
};
use patchbay_controller_store::{Error, Stores};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Writes race only with other writers of the same half of the same
/// object; a handful of retries from the latest revision always converges.
const MAX_CONFLICT_RETRIES: usize = 8;

/// Upper bound on how long the arbiter sleeps without any deadline, so a
/// missed wakeup heals itself.
const IDLE_SWEEP: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct LeaseLimits {
    pub min: Duration,
    pub max: Duration,
    pub allow_unlimited: bool,
}

impl Default for LeaseLimits {
    fn default() -> Self {
        Self {
            min: Duration::ZERO,
            max: Duration::from_secs(30 * 24 * 60 * 60),
            allow_unlimited: false,
        }
    }
}

impl LeaseLimits {
    /// Clamps a requested duration into the configured bounds. `None`
    /// requests an unbounded lease, which must be explicitly permitted.
    pub fn clamp(&self, requested: Option<Duration>) -> Result<Option<Duration>, String> {
        match requested {
            None if self.allow_unlimited => Ok(None),
            None => Err("unbounded leases are not permitted".to_string()),
            Some(d) => Ok(Some(d.clamp(self.min, self.max))),
        }
    }
}

/// The lease control loop: binds pending leases to available exporters,
/// expires and releases them, and flips exporters offline when their
/// heartbeats stop.
#[derive(Clone, Debug)]
pub struct Arbiter {
    stores: Stores,
    limits: LeaseLimits,
    offline_timeout: Duration,
    offline_grace: Duration,
    provisioning: bool,
    metrics: ArbiterMetrics,
}

impl Arbiter {
    pub fn new(
        stores: Stores,
        limits: LeaseLimits,
        offline_timeout: Duration,
        offline_grace: Duration,
        provisioning: bool,
        metrics: ArbiterMetrics,
    ) -> Self {
        Self {
            stores,
            limits,
            offline_timeout,
            offline_grace,
            provisioning,
            metrics,
        }
    }

    pub fn limits(&self) -> &LeaseLimits {
        &self.limits
    }

    /// Runs the arbiter until shutdown: a fan-in over the lease watch, the
    /// exporter watch, and a wall-clock deadline derived from the earliest
    /// lease end time or heartbeat timeout.
    pub async fn run(self, drain: drain::Watch) -> anyhow::Result<()> {
        let (_, mut leases) = self.stores.leases().list_and_watch(Selector::default());
        let (_, mut exporters) = self.stores.exporters().list_and_watch(Selector::default());

        let shutdown = drain.signaled();
        tokio::pin!(shutdown);

        let mut deadline = self.reconcile_all(Utc::now());
        loop {
            let sleep = match deadline {
                // A deadline that just passed still gets a short pause so a
                // persistently-failing write cannot spin the loop.
                Some(t) => (t - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    .clamp(Duration::from_millis(10), IDLE_SWEEP),
                None => IDLE_SWEEP,
            };

            tokio::select! {
                _ = (&mut shutdown) => {
                    info!("arbiter shutting down");
                    return Ok(());
                }
                event = leases.next() => {
                    if let Err(error) = event {
                        // Fell out of the watch window; re-list and restart.
                        warn!(%error, "lease watch expired, restarting");
                        (_, leases) = self.stores.leases().list_and_watch(Selector::default());
                    }
                }
                event = exporters.next() => {
                    if let Err(error) = event {
                        warn!(%error, "exporter watch expired, restarting");
                        (_, exporters) = self.stores.exporters().list_and_watch(Selector::default());
                    }
                }
                _ = tokio::time::sleep(sleep) => {}
            }

            deadline = self.reconcile_all(Utc::now());
        }
    }

    /// One full reconciliation pass. Returns the earliest instant at which
    /// some lease or exporter needs attention again.
    pub fn reconcile_all(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut next = self.sweep_exporters(now);

        // Pending leases are served strictly in creation order so that an
        // early requester is never starved by a later one.
        let mut leases = self.stores.leases().list(&Selector::default());
        leases.sort_by(|a, b| {
            (a.metadata.creation_timestamp, &a.metadata.name)
                .cmp(&(b.metadata.creation_timestamp, &b.metadata.name))
        });

        for lease in leases {
            match self.reconcile_lease(&lease.metadata.name, now) {
                Ok(lease) => {
                    if !lease.is_terminal() {
                        merge_deadline(&mut next, self.lease_deadline(&lease, now));
                    }
                }
                Err(error) if error.is_not_found() => {}
                Err(error) => {
                    warn!(lease = %lease.metadata.name, %error, "failed to reconcile lease");
                }
            }
        }
        next
    }

    /// Reconciles one lease to a fixed point, retrying optimistic-write
    /// conflicts from the latest revision. Returns the resulting state.
    pub fn reconcile_lease(&self, name: &str, now: DateTime<Utc>) -> Result<Lease, Error> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let lease = self.stores.leases().get(name)?;
            match self.step(&lease, now) {
                Ok(()) => return self.stores.leases().get(name),
                Err(error) if error.is_conflict() => {
                    debug!(lease = %name, %error, "write conflict, retrying");
                    continue;
                }
                Err(error) => return Err(error),
            }
        }
        // Surface the conflict; the next event will try again.
        self.stores.leases().get(name)
    }

    /// Advances the lease state machine by at most one transition.
    fn step(&self, lease: &Lease, now: DateTime<Utc>) -> Result<(), Error> {
        if lease.is_terminal() || lease.is_invalid() {
            return Ok(());
        }

        if lease.spec.release {
            return self.finish(lease, now, "Released", false);
        }

        if lease.is_ready() {
            return self.step_ready(lease, now);
        }
        self.step_pending(lease, now)
    }

    fn step_ready(&self, lease: &Lease, now: DateTime<Utc>) -> Result<(), Error> {
        if lease.status.end_time.is_some_and(|end| now >= end) {
            return self.finish(lease, now, "Expired", true);
        }

        let bound = match lease.status.exporter.as_deref() {
            Some(name) => name,
            None => {
                // Broken invariant: ready without a binding.
                warn!(lease = %lease.metadata.name, "ready lease has no exporter, terminating");
                return self.finish(lease, now, "ExporterGone", false);
            }
        };

        let exporter = match self.stores.exporters().get(bound) {
            Ok(exporter) => exporter,
            Err(_) => return self.finish(lease, now, "ExporterGone", false),
        };

        if !exporter.is_online() {
            let offline_since = get_condition(&exporter.status.conditions, ONLINE)
                .map(|c| c.last_transition_time)
                .unwrap_or(now);
            let grace_end = offline_since + chrono_duration(self.offline_grace);
            if now >= grace_end {
                return self.finish(lease, now, "ExporterOffline", false);
            }
            return Ok(());
        }

        // An extended spec duration advances the end time, but only while
        // the lease is still active; it never rolls back.
        if let (Some(begin), Some(d)) = (lease.status.begin_time, lease.spec.duration) {
            let desired = begin + chrono_duration(d);
            if lease.status.end_time.is_some_and(|end| desired > end) {
                let mut updated = lease.clone();
                updated.status.end_time = Some(desired);
                self.stores.leases().update_status(updated)?;
                self.metrics.transition("extended");
            }
        }
        Ok(())
    }

    fn step_pending(&self, lease: &Lease, now: DateTime<Utc>) -> Result<(), Error> {
        if lease.spec.duration.is_none() && !self.limits.allow_unlimited {
            return self.mark_invalid(lease, now, "UnlimitedNotAllowed");
        }

        // Resolve the set of exporters the lease could ever bind.
        let existing = match &lease.spec.exporter {
            Some(explicit) => match self.stores.exporters().get(explicit) {
                Ok(exporter) => vec![exporter],
                Err(_) if self.provisioning => Vec::new(),
                Err(_) => return self.mark_invalid(lease, now, "UnknownExporter"),
            },
            None => self.stores.exporters().list(&lease.spec.selector),
        };

        if existing.is_empty() {
            if lease.spec.duration == Some(Duration::ZERO) {
                return self.mark_invalid(lease, now, "ZeroDurationUnsatisfied");
            }
            return self.mark_unsatisfiable(lease, now);
        }

        let mut candidates = existing
            .into_iter()
            .filter(|e| e.is_online() && self.exporter_free(e, lease))
            .collect::<Vec<_>>();
        candidates.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));

        let Some(exporter) = candidates.into_iter().next() else {
            return self.mark_pending(lease, now, "NoAvailableExporter");
        };

        // Yield to any strictly older pending lease that also wants this
        // exporter; it binds first when its own reconcile runs.
        if self.older_pending_claimant(lease, &exporter) {
            return self.mark_pending(lease, now, "NoAvailableExporter");
        }

        self.acquire(lease, &exporter, now)
    }

    /// An exporter is free unless its recorded lease reference points at a
    /// live claim. References are by name only and resolved lazily; stale
    /// ones (deleted, terminal, or re-bound elsewhere) do not hold it.
    fn exporter_free(&self, exporter: &Exporter, lease: &Lease) -> bool {
        match exporter.status.lease_ref.as_deref() {
            None => true,
            Some(holder) if holder == lease.metadata.name => true,
            Some(holder) => match self.stores.leases().get(holder) {
                Err(_) => true,
                Ok(holder) => {
                    holder.is_terminal()
                        || holder.is_invalid()
                        || holder
                            .status
                            .exporter
                            .as_deref()
                            .is_some_and(|bound| bound != exporter.metadata.name)
                }
            },
        }
    }

    fn older_pending_claimant(&self, lease: &Lease, exporter: &Exporter) -> bool {
        let me = (lease.metadata.creation_timestamp, &lease.metadata.name);
        self.stores
            .leases()
            .list(&Selector::default())
            .iter()
            .any(|other| {
                if other.metadata.name == lease.metadata.name
                    || other.is_ready()
                    || other.is_terminal()
                    || other.is_invalid()
                    || other.spec.release
                {
                    return false;
                }
                if (other.metadata.creation_timestamp, &other.metadata.name) >= me {
                    return false;
                }
                match &other.spec.exporter {
                    Some(explicit) => explicit == &exporter.metadata.name,
                    None => other.spec.selector.matches(&exporter.metadata.labels),
                }
            })
    }

    /// The two-phase binding write: claim the exporter first, then mark the
    /// lease ready. The claim fails if any other lease took the exporter
    /// since selection; a crash in between is healed because the claim
    /// names us and the next reconcile completes the second write.
    fn acquire(&self, lease: &Lease, exporter: &Exporter, now: DateTime<Utc>) -> Result<(), Error> {
        if exporter.status.lease_ref.as_deref() != Some(&lease.metadata.name) {
            let mut claim = exporter.clone();
            claim.status.lease_ref = Some(lease.metadata.name.clone());
            self.stores.exporters().update_status(claim)?;
        }

        let mut ready = lease.clone();
        ready.status.exporter = Some(exporter.metadata.name.clone());
        ready.status.begin_time = Some(now);
        ready.status.end_time = lease.spec.duration.map(|d| now + chrono_duration(d));
        let generation = ready.metadata.generation;
        set_phase(
            &mut ready.status,
            generation,
            now,
            READY,
            "Acquired",
            &format!("bound to exporter {:?}", exporter.metadata.name),
        );
        self.stores.leases().update_status(ready)?;

        info!(
            lease = %lease.metadata.name,
            exporter = %exporter.metadata.name,
            "lease acquired"
        );
        self.metrics.transition("ready");
        Ok(())
    }

    fn finish(
        &self,
        lease: &Lease,
        now: DateTime<Utc>,
        reason: &'static str,
        time_based: bool,
    ) -> Result<(), Error> {
        let mut done = lease.clone();
        let was_ready = lease.is_ready();
        done.status.end_time = match (time_based, lease.status.end_time) {
            (true, Some(end)) => Some(end),
            (false, Some(end)) if end <= now => Some(end),
            _ => Some(now),
        };
        let generation = done.metadata.generation;
        let cond = |type_: &'static str, status: ConditionStatus| {
            let mut c = Condition::new(type_, status, reason, "", now);
            c.observed_generation = Some(generation);
            c
        };
        set_condition(&mut done.status.conditions, cond(READY, ConditionStatus::False));
        set_condition(&mut done.status.conditions, cond(PENDING, ConditionStatus::False));
        if time_based {
            set_condition(&mut done.status.conditions, cond(EXPIRED, ConditionStatus::True));
        }
        self.stores.leases().update_status(done)?;

        info!(lease = %lease.metadata.name, %reason, "lease terminated");
        if was_ready {
            self.metrics.transition(match reason {
                "Expired" => "expired",
                "Released" => "released",
                _ => "evicted",
            });
        }

        // Drop the exporter's claim; a conflict here is healed by the sweep.
        if let Some(bound) = &lease.status.exporter {
            if let Ok(mut exporter) = self.stores.exporters().get(bound) {
                if exporter.status.lease_ref.as_deref() == Some(&lease.metadata.name) {
                    exporter.status.lease_ref = None;
                    if let Err(error) = self.stores.exporters().update_status(exporter) {
                        debug!(exporter = %bound, %error, "failed to clear lease claim");
                    }
                }
            }
        }
        Ok(())
    }

    fn mark_pending(
        &self,
        lease: &Lease,
        now: DateTime<Utc>,
        reason: &'static str,
    ) -> Result<(), Error> {
        self.mark(lease, now, PENDING, reason, "")
    }

    fn mark_unsatisfiable(&self, lease: &Lease, now: DateTime<Utc>) -> Result<(), Error> {
        self.mark(
            lease,
            now,
            UNSATISFIABLE,
            "NoMatchingExporter",
            "selector matches no existing exporter",
        )
    }

    fn mark_invalid(
        &self,
        lease: &Lease,
        now: DateTime<Utc>,
        reason: &'static str,
    ) -> Result<(), Error> {
        self.metrics.transition("invalid");
        self.mark(lease, now, INVALID, reason, "")
    }

    fn mark(
        &self,
        lease: &Lease,
        now: DateTime<Utc>,
        phase: &'static str,
        reason: &str,
        message: &str,
    ) -> Result<(), Error> {
        // Skip the write when the dominant condition already matches.
        if get_condition(&lease.status.conditions, phase)
            .is_some_and(|c| c.is_true() && c.reason == reason)
        {
            return Ok(());
        }
        let mut updated = lease.clone();
        let generation = updated.metadata.generation;
        set_phase(&mut updated.status, generation, now, phase, reason, message);
        self.stores.leases().update_status(updated)?;
        Ok(())
    }

    /// Flips exporters offline when their heartbeat lapses and clears lease
    /// claims whose holder is gone. Returns the earliest future heartbeat
    /// deadline.
    fn sweep_exporters(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut next = None;
        for mut exporter in self.stores.exporters().list(&Selector::default()) {
            if let Some(holder) = exporter.status.lease_ref.as_deref() {
                let stale = match self.stores.leases().get(holder) {
                    Err(_) => true,
                    Ok(lease) => lease.is_terminal() || lease.is_invalid(),
                };
                if stale {
                    let mut cleared = exporter.clone();
                    cleared.status.lease_ref = None;
                    match self.stores.exporters().update_status(cleared) {
                        Ok(cleared) => exporter = cleared,
                        Err(error) => {
                            debug!(exporter = %exporter.metadata.name, %error, "failed to clear stale claim");
                            continue;
                        }
                    }
                }
            }

            if !exporter.is_online() {
                continue;
            }
            let Some(last_seen) = exporter.status.last_seen else {
                continue;
            };
            let deadline = last_seen + chrono_duration(self.offline_timeout);
            if now < deadline {
                merge_deadline(&mut next, Some(deadline));
                continue;
            }

            let mut offline = exporter.clone();
            set_condition(
                &mut offline.status.conditions,
                Condition::new(
                    ONLINE,
                    ConditionStatus::False,
                    "HeartbeatTimeout",
                    format!("no heartbeat since {last_seen}"),
                    now,
                ),
            );
            match self.stores.exporters().update_status(offline) {
                Ok(_) => {
                    info!(exporter = %exporter.metadata.name, "exporter offline");
                    self.metrics.transition("offline");
                }
                Err(error) => {
                    debug!(exporter = %exporter.metadata.name, %error, "failed to mark offline");
                }
            }
        }
        next
    }

    fn lease_deadline(&self, lease: &Lease, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !lease.is_ready() {
            return None;
        }
        let mut deadline = lease.status.end_time;
        if let Some(exporter) = lease
            .status
            .exporter
            .as_deref()
            .and_then(|name| self.stores.exporters().get(name).ok())
        {
            if !exporter.is_online() {
                let offline_since = get_condition(&exporter.status.conditions, ONLINE)
                    .map(|c| c.last_transition_time)
                    .unwrap_or(now);
                merge_deadline(
                    &mut deadline,
                    Some(offline_since + chrono_duration(self.offline_grace)),
                );
            }
        }
        deadline
    }
}

/// Writes the mutually-exclusive condition set with `phase` dominant.
fn set_phase(
    status: &mut patchbay_controller_core::LeaseStatus,
    generation: u64,
    now: DateTime<Utc>,
    phase: &'static str,
    reason: &str,
    message: &str,
) {
    for type_ in [PENDING, READY, UNSATISFIABLE, INVALID] {
        let status_value = if type_ == phase {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        };
        let mut cond = Condition::new(
            type_,
            status_value,
            if type_ == phase { reason } else { phase },
            if type_ == phase { message } else { "" },
            now,
        );
        cond.observed_generation = Some(generation);
        set_condition(&mut status.conditions, cond);
    }
}

fn merge_deadline(current: &mut Option<DateTime<Utc>>, candidate: Option<DateTime<Utc>>) {
    if let Some(t) = candidate {
        match current {
            Some(existing) if *existing <= t => {}
            _ => *current = Some(t),
        }
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}
