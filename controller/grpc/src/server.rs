use crate::{status_from_store, ControllerMetrics, Directory, Registry};
use chrono::{DateTime, Utc};
use futures::Stream;
use patchbay_api::v1::{
    self as proto,
    controller_service_server::{ControllerService, ControllerServiceServer},
};
use patchbay_controller_arbiter::Arbiter;
use patchbay_controller_auth::{Authenticator, Authorizer, Identity};
use patchbay_controller_core::{
    exporter::condition::{ONLINE, REGISTERED},
    set_condition, Condition, ConditionStatus, Exporter, Kind, Lease, LeaseSpec, ObjectMeta,
    Selector, Subject,
};
use patchbay_controller_store::{Error as StoreError, Stores};
use patchbay_controller_token::StreamSigner;
use std::{pin::Pin, sync::Arc, time::Duration};
use tonic::{Request, Response, Status};
use tracing::{debug, info};

const WRITE_RETRIES: usize = 8;

/// How often an open Listen stream refreshes its exporter's `last_seen`.
const LISTEN_HEARTBEAT: Duration = Duration::from_secs(15);

/// The public control-plane service.
#[derive(Clone)]
pub struct ControllerServer {
    stores: Stores,
    registry: Registry,
    directory: Directory,
    authenticator: Arc<Authenticator>,
    authorizer: Authorizer,
    streams: Arc<StreamSigner>,
    arbiter: Arbiter,
    provisioning: bool,
    metrics: ControllerMetrics,
    drain: drain::Watch,
}

impl ControllerServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stores: Stores,
        registry: Registry,
        directory: Directory,
        authenticator: Arc<Authenticator>,
        authorizer: Authorizer,
        streams: Arc<StreamSigner>,
        arbiter: Arbiter,
        provisioning: bool,
        metrics: ControllerMetrics,
        drain: drain::Watch,
    ) -> Self {
        Self {
            stores,
            registry,
            directory,
            authenticator,
            authorizer,
            streams,
            arbiter,
            provisioning,
            metrics,
            drain,
        }
    }

    pub fn svc(self) -> ControllerServiceServer<Self> {
        ControllerServiceServer::new(self)
    }

    fn subject<T>(&self, req: &Request<T>) -> Result<String, Status> {
        self.authenticator
            .authenticate(req.metadata())
            .map_err(Into::into)
    }

    fn client_identity<T>(&self, req: &Request<T>) -> Result<patchbay_controller_core::Client, Status> {
        let subject = self.subject(req)?;
        self.authorizer.client(&subject).map_err(Into::into)
    }

    fn exporter_identity<T>(&self, req: &Request<T>) -> Result<Exporter, Status> {
        let subject = self.subject(req)?;
        self.authorizer.exporter(&subject).map_err(Into::into)
    }

    /// Status-subresource write with optimistic retry; the closure is
    /// re-applied to the freshest copy on every attempt.
    fn touch_exporter(
        &self,
        name: &str,
        f: impl Fn(&mut Exporter),
    ) -> Result<Exporter, StoreError> {
        let mut last = None;
        for _ in 0..WRITE_RETRIES {
            let mut exporter = self.stores.exporters().get(name)?;
            f(&mut exporter);
            match self.stores.exporters().update_status(exporter) {
                Ok(exporter) => return Ok(exporter),
                Err(error) if error.is_conflict() => last = Some(error),
                Err(error) => return Err(error),
            }
        }
        Err(last.expect("retries exhausted only after a conflict"))
    }

    /// Creates the exporter resource for a registering subject when
    /// provisioning is enabled. Only internally-issued subjects carry a
    /// canonical name to provision under.
    fn provision_exporter(
        &self,
        subject: &str,
        labels: &std::collections::HashMap<String, String>,
    ) -> Result<Exporter, Status> {
        let canonical = subject
            .strip_prefix(self.authorizer.prefix())
            .and_then(|s| s.parse::<Subject>().ok())
            .filter(|s| s.kind == Kind::Exporter && s.namespace == self.stores.namespace())
            .ok_or_else(|| {
                Status::permission_denied(format!("subject {subject:?} is not an exporter"))
            })?;

        let exporter = Exporter {
            metadata: ObjectMeta::named("", &canonical.name)
                .with_labels(labels.iter().map(|(k, v)| (k.clone(), v.clone()))),
            ..Default::default()
        };
        match self.stores.exporters().create(exporter) {
            Ok(exporter) => {
                info!(exporter = %canonical.name, "provisioned exporter resource");
                Ok(exporter)
            }
            Err(StoreError::AlreadyExists { .. }) => self
                .stores
                .exporters()
                .get(&canonical.name)
                .map_err(status_from_store),
            Err(error) => Err(status_from_store(error)),
        }
    }

    /// The caller's Ready lease binding the named exporter, if any.
    fn ready_lease_for(&self, client: &str, exporter: &str, now: DateTime<Utc>) -> Option<Lease> {
        self.stores
            .leases()
            .list(&Selector::default())
            .into_iter()
            .find(|l| {
                l.spec.client == client
                    && l.is_ready()
                    && l.status.exporter.as_deref() == Some(exporter)
                    && l.status.end_time.is_none_or(|end| now < end)
            })
    }
}

#[tonic::async_trait]
impl ControllerService for ControllerServer {
    async fn register(
        &self,
        req: Request<proto::RegisterRequest>,
    ) -> Result<Response<proto::RegisterResponse>, Status> {
        let subject = self.subject(&req)?;
        let req = req.into_inner();

        let exporter = match self.authorizer.exporter(&subject) {
            Ok(exporter) => exporter,
            Err(patchbay_controller_auth::Error::PermissionDenied(_)) if self.provisioning => {
                self.provision_exporter(&subject, &req.labels)?
            }
            Err(error) => return Err(error.into()),
        };

        let now = Utc::now();
        let devices = req.devices.iter().map(device_from_proto).collect::<Vec<_>>();
        let endpoint = Some(req.endpoint).filter(|e| !e.is_empty());
        let name = exporter.metadata.name.clone();
        self.touch_exporter(&name, |e| {
            e.status.devices = devices.clone();
            if let Some(endpoint) = &endpoint {
                e.status.endpoint = Some(endpoint.clone());
            }
            e.status.last_seen = Some(now);
            set_condition(
                &mut e.status.conditions,
                Condition::new(REGISTERED, ConditionStatus::True, "Register", "", now),
            );
            set_condition(
                &mut e.status.conditions,
                Condition::new(ONLINE, ConditionStatus::True, "Heartbeat", "", now),
            );
        })
        .map_err(status_from_store)?;

        info!(exporter = %name, devices = req.devices.len(), "exporter registered");
        Ok(Response::new(proto::RegisterResponse { name }))
    }

    async fn bye(
        &self,
        req: Request<proto::ByeRequest>,
    ) -> Result<Response<proto::ByeResponse>, Status> {
        let exporter = self.exporter_identity(&req)?;
        let reason = req.into_inner().reason;

        let now = Utc::now();
        let name = exporter.metadata.name.clone();
        self.touch_exporter(&name, |e| {
            set_condition(
                &mut e.status.conditions,
                Condition::new(
                    REGISTERED,
                    ConditionStatus::False,
                    "Bye",
                    reason.clone(),
                    now,
                ),
            );
            set_condition(
                &mut e.status.conditions,
                Condition::new(ONLINE, ConditionStatus::False, "Bye", reason.clone(), now),
            );
        })
        .map_err(status_from_store)?;
        self.registry.evict(&name);

        info!(exporter = %name, %reason, "exporter said goodbye");
        Ok(Response::new(proto::ByeResponse {}))
    }

    type ListenStream =
        Pin<Box<dyn Stream<Item = Result<proto::ListenResponse, Status>> + Send + 'static>>;

    async fn listen(
        &self,
        req: Request<proto::ListenRequest>,
    ) -> Result<Response<Self::ListenStream>, Status> {
        let exporter = self.exporter_identity(&req)?;
        let name = exporter.metadata.name.clone();

        let mut registration = self.registry.register(&name).map_err(|error| {
            self.metrics.listen("already_exists");
            Status::already_exists(error.to_string())
        })?;
        self.metrics.listen("accepted");

        // The stream itself is the exporter's heartbeat while it is open.
        let now = Utc::now();
        let _ = self.touch_exporter(&name, |e| {
            e.status.last_seen = Some(now);
            set_condition(
                &mut e.status.conditions,
                Condition::new(ONLINE, ConditionStatus::True, "Heartbeat", "", now),
            );
        });

        info!(exporter = %name, "listen stream opened");
        let server = self.clone();
        let drain = self.drain.clone();
        let stream = async_stream::stream! {
            let shutdown = drain.signaled();
            tokio::pin!(shutdown);
            let mut heartbeat = tokio::time::interval(LISTEN_HEARTBEAT);
            heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    msg = registration.next() => match msg {
                        Some(msg) => yield Ok(msg),
                        None => break,
                    },
                    _ = heartbeat.tick() => {
                        let now = Utc::now();
                        let result = server.touch_exporter(registration.name(), |e| {
                            e.status.last_seen = Some(now);
                            set_condition(
                                &mut e.status.conditions,
                                Condition::new(ONLINE, ConditionStatus::True, "Heartbeat", "", now),
                            );
                        });
                        if let Err(error) = result {
                            if error.is_not_found() {
                                // Resource deleted; the stream dies with it.
                                break;
                            }
                            debug!(exporter = %registration.name(), %error, "heartbeat write failed");
                        }
                    }
                    _ = (&mut shutdown) => break,
                }
            }
            debug!(exporter = %registration.name(), "listen stream closed");
        };
        let stream: Self::ListenStream = Box::pin(stream);
        Ok(Response::new(stream))
    }

    async fn dial(
        &self,
        req: Request<proto::DialRequest>,
    ) -> Result<Response<proto::DialResponse>, Status> {
        let client = self.client_identity(&req)?;
        let req = req.into_inner();
        let now = Utc::now();

        let exporter = self
            .stores
            .exporters()
            .get(&req.exporter)
            .map_err(status_from_store)?;

        if self
            .ready_lease_for(&client.metadata.name, &exporter.metadata.name, now)
            .is_none()
        {
            self.metrics.dial("no_lease");
            return Err(Status::failed_precondition(format!(
                "client {:?} holds no ready lease on exporter {:?}",
                client.metadata.name, exporter.metadata.name
            )));
        }

        let Some(router) = self.directory.select(&exporter.metadata.labels) else {
            self.metrics.dial("no_router");
            return Err(Status::internal("no router configured for this exporter"));
        };

        let tokens = self
            .streams
            .mint_pair(&router.endpoint)
            .map_err(|e| Status::internal(format!("failed to mint stream tokens: {e}")))?;

        self.registry
            .dispatch(
                &exporter.metadata.name,
                proto::ListenResponse {
                    router_endpoint: router.endpoint.clone(),
                    router_token: tokens.exporter_token,
                    device_uuid: req.device_uuid.clone(),
                },
            )
            .map_err(|error| {
                self.metrics.dial("unavailable");
                Status::unavailable(error.to_string())
            })?;

        self.metrics.dial("ok");
        debug!(
            client = %client.metadata.name,
            exporter = %exporter.metadata.name,
            stream = %tokens.stream_id,
            router = %router.name,
            "dial routed"
        );
        Ok(Response::new(proto::DialResponse {
            router_endpoint: router.endpoint.clone(),
            router_token: tokens.client_token,
        }))
    }

    async fn list_exporters(
        &self,
        req: Request<proto::ListExportersRequest>,
    ) -> Result<Response<proto::ListExportersResponse>, Status> {
        self.client_identity(&req)?;
        let selector = req
            .into_inner()
            .label_selector
            .parse::<Selector>()
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        let exporters = self
            .stores
            .exporters()
            .list(&selector)
            .iter()
            .map(exporter_to_proto)
            .collect();
        Ok(Response::new(proto::ListExportersResponse { exporters }))
    }

    async fn get_exporter(
        &self,
        req: Request<proto::GetExporterRequest>,
    ) -> Result<Response<proto::Exporter>, Status> {
        let subject = self.subject(&req)?;
        let name = req.into_inner().name;

        // Clients may read any exporter in the namespace; an exporter may
        // only read itself.
        match self.authorizer.resolve(&subject).map_err(Status::from)? {
            Identity::Client(_) => {}
            Identity::Exporter(e) if e.metadata.name == name => {}
            Identity::Exporter(_) => {
                return Err(Status::permission_denied(
                    "exporters may only read their own resource",
                ))
            }
        }

        let exporter = self
            .stores
            .exporters()
            .get(&name)
            .map_err(status_from_store)?;
        Ok(Response::new(exporter_to_proto(&exporter)))
    }

    async fn lease_exporter(
        &self,
        req: Request<proto::LeaseExporterRequest>,
    ) -> Result<Response<proto::LeaseExporterResponse>, Status> {
        let client = self.client_identity(&req)?;
        let req = req.into_inner();

        let invalid = |reason: String| {
            self.metrics.lease_request("invalid");
            Response::new(proto::LeaseExporterResponse {
                response: Some(proto::lease_exporter_response::Response::Invalid(
                    proto::LeaseInvalid { reason },
                )),
            })
        };

        let selector = match req.label_selector.parse::<Selector>() {
            Ok(selector) => selector,
            Err(e) => return Ok(invalid(e.to_string())),
        };

        let requested = match (req.unlimited, &req.duration) {
            (true, _) => None,
            (false, Some(d)) => match duration_from_proto(d) {
                Ok(d) => Some(d),
                Err(reason) => return Ok(invalid(reason.to_string())),
            },
            (false, None) => return Ok(invalid("a lease duration is required".to_string())),
        };
        let duration = match self.arbiter.limits().clamp(requested) {
            Ok(duration) => duration,
            Err(reason) => return Ok(invalid(reason)),
        };

        // Create the lease resource on the client's behalf.
        let spec = LeaseSpec {
            selector,
            duration,
            exporter: Some(req.exporter).filter(|e| !e.is_empty()),
            release: false,
            client: client.metadata.name.clone(),
        };
        let mut created = None;
        for _ in 0..WRITE_RETRIES {
            let name = format!("{}-{:08x}", client.metadata.name, rand::random::<u32>());
            match self.stores.leases().create(Lease {
                metadata: ObjectMeta::named("", name),
                spec: spec.clone(),
                ..Default::default()
            }) {
                Ok(lease) => {
                    created = Some(lease);
                    break;
                }
                Err(StoreError::AlreadyExists { .. }) => continue,
                Err(error) => return Err(status_from_store(error)),
            }
        }
        let created =
            created.ok_or_else(|| Status::internal("failed to allocate a lease name"))?;

        // One immediate arbitration pass; the request does not otherwise
        // block until the lease becomes ready.
        let lease = self
            .arbiter
            .reconcile_lease(&created.metadata.name, Utc::now())
            .map_err(status_from_store)?;

        use proto::lease_exporter_response::Response as LeaseResponse;
        let response = if lease.is_ready() {
            self.metrics.lease_request("granted");
            info!(lease = %lease.metadata.name, client = %lease.spec.client, "lease granted");
            LeaseResponse::Granted(proto::LeaseGranted {
                name: lease.metadata.name.clone(),
                duration: lease.spec.duration.map(duration_to_proto),
            })
        } else if lease.is_invalid() {
            self.metrics.lease_request("invalid");
            LeaseResponse::Invalid(proto::LeaseInvalid {
                reason: lease.reason().to_string(),
            })
        } else {
            self.metrics.lease_request("pending");
            LeaseResponse::Pending(proto::LeasePending {
                name: lease.metadata.name.clone(),
            })
        };
        Ok(Response::new(proto::LeaseExporterResponse {
            response: Some(response),
        }))
    }

    async fn release_exporter(
        &self,
        req: Request<proto::ReleaseExporterRequest>,
    ) -> Result<Response<proto::ReleaseExporterResponse>, Status> {
        let client = self.client_identity(&req)?;
        let name = req.into_inner().name;

        let mut applied = false;
        for _ in 0..WRITE_RETRIES {
            let lease = self.stores.leases().get(&name).map_err(status_from_store)?;
            if lease.spec.client != client.metadata.name {
                return Err(Status::permission_denied(format!(
                    "lease {name:?} belongs to another client"
                )));
            }
            if lease.is_terminal() {
                return Err(Status::failed_precondition(format!(
                    "lease {name:?} is already terminal"
                )));
            }
            if lease.spec.release {
                applied = true;
                break;
            }

            let mut released = lease;
            released.spec.release = true;
            match self.stores.leases().update(released) {
                Ok(_) => {
                    applied = true;
                    break;
                }
                Err(error) if error.is_conflict() => continue,
                Err(error) => return Err(status_from_store(error)),
            }
        }
        if !applied {
            return Err(Status::aborted(format!(
                "concurrent writes kept preempting the release of lease {name:?}"
            )));
        }

        // Make the termination prompt rather than waiting for the arbiter's
        // next wakeup.
        let _ = self.arbiter.reconcile_lease(&name, Utc::now());
        info!(lease = %name, "lease released");
        Ok(Response::new(proto::ReleaseExporterResponse {}))
    }

    async fn get_lease(
        &self,
        req: Request<proto::GetLeaseRequest>,
    ) -> Result<Response<proto::Lease>, Status> {
        let client = self.client_identity(&req)?;
        let name = req.into_inner().name;

        let lease = self.stores.leases().get(&name).map_err(status_from_store)?;
        if lease.spec.client != client.metadata.name {
            return Err(Status::permission_denied(format!(
                "lease {name:?} belongs to another client"
            )));
        }
        Ok(Response::new(lease_to_proto(&lease)))
    }

    async fn list_leases(
        &self,
        req: Request<proto::ListLeasesRequest>,
    ) -> Result<Response<proto::ListLeasesResponse>, Status> {
        let client = self.client_identity(&req)?;
        let selector = req
            .into_inner()
            .label_selector
            .parse::<Selector>()
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        let leases = self
            .stores
            .leases()
            .list(&selector)
            .iter()
            .filter(|l| l.spec.client == client.metadata.name)
            .map(lease_to_proto)
            .collect();
        Ok(Response::new(proto::ListLeasesResponse { leases }))
    }
}

impl std::fmt::Debug for ControllerServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerServer")
            .field("namespace", &self.stores.namespace())
            .finish_non_exhaustive()
    }
}

fn device_from_proto(d: &proto::DeviceReport) -> patchbay_controller_core::DeviceReport {
    patchbay_controller_core::DeviceReport {
        uuid: d.uuid.clone(),
        parent_uuid: Some(d.parent_uuid.clone()).filter(|p| !p.is_empty()),
        labels: d.labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
    }
}

fn device_to_proto(d: &patchbay_controller_core::DeviceReport) -> proto::DeviceReport {
    proto::DeviceReport {
        uuid: d.uuid.clone(),
        parent_uuid: d.parent_uuid.clone().unwrap_or_default(),
        labels: d.labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
    }
}

fn exporter_to_proto(e: &Exporter) -> proto::Exporter {
    proto::Exporter {
        name: e.metadata.name.clone(),
        labels: e
            .metadata
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        registered: e.is_registered(),
        online: e.is_online(),
        devices: e.status.devices.iter().map(device_to_proto).collect(),
        lease: e.status.lease_ref.clone().unwrap_or_default(),
        last_seen: e.status.last_seen.map(timestamp_to_proto),
    }
}

fn lease_to_proto(l: &Lease) -> proto::Lease {
    proto::Lease {
        name: l.metadata.name.clone(),
        exporter: l.status.exporter.clone().unwrap_or_default(),
        client: l.spec.client.clone(),
        ready: l.is_ready(),
        reason: l.reason().to_string(),
        begin_time: l.status.begin_time.map(timestamp_to_proto),
        end_time: l.status.end_time.map(timestamp_to_proto),
        duration: l.spec.duration.map(duration_to_proto),
        release: l.spec.release,
        label_selector: l.spec.selector.to_string(),
    }
}

fn timestamp_to_proto(t: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: t.timestamp(),
        nanos: t.timestamp_subsec_nanos() as i32,
    }
}

fn duration_to_proto(d: Duration) -> prost_types::Duration {
    prost_types::Duration {
        seconds: d.as_secs() as i64,
        nanos: d.subsec_nanos() as i32,
    }
}

fn duration_from_proto(d: &prost_types::Duration) -> Result<Duration, &'static str> {
    if d.seconds < 0 || d.nanos < 0 {
        return Err("lease duration must not be negative");
    }
    Ok(Duration::new(d.seconds as u64, d.nanos as u32))
}
