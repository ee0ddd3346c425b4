use crate::{
    pending::{Arrival, PendingMap, Waiter},
    RouterMetrics,
};
use futures::Stream;
use patchbay_api::v1::{
    self as proto,
    router_service_server::{RouterService, RouterServiceServer},
};
use patchbay_controller_auth::bearer;
use patchbay_controller_token::StreamSigner;
use std::{pin::Pin, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, trace};

/// Frames buffered towards either side before backpressure propagates to
/// the peer's read loop.
const STREAM_BUFFER: usize = 32;

#[derive(Clone)]
pub struct RouterServer {
    signer: Arc<StreamSigner>,
    audience: String,
    pending: PendingMap,
    metrics: RouterMetrics,
}

impl RouterServer {
    pub fn new(signer: Arc<StreamSigner>, audience: impl Into<String>, metrics: RouterMetrics) -> Self {
        Self {
            signer,
            audience: audience.into(),
            pending: PendingMap::default(),
            metrics,
        }
    }

    pub fn svc(self) -> RouterServiceServer<Self> {
        RouterServiceServer::new(self)
    }
}

#[tonic::async_trait]
impl RouterService for RouterServer {
    type StreamStream =
        Pin<Box<dyn Stream<Item = Result<proto::StreamFrame, Status>> + Send + 'static>>;

    async fn stream(
        &self,
        req: Request<Streaming<proto::StreamFrame>>,
    ) -> Result<Response<Self::StreamStream>, Status> {
        // The stream token is the only authentication input; it is checked
        // before the pending map is consulted at all.
        let token = bearer(req.metadata()).map_err(Status::from)?;
        let claims = self
            .signer
            .verify(token, &self.audience)
            .map_err(|e| Status::unauthenticated(e.to_string()))?;

        let ttl = Duration::from_secs(
            (claims.exp - chrono::Utc::now().timestamp()).max(0) as u64,
        );
        let inbound = req.into_inner();

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let waiter = Waiter {
            nonce: self.pending.next_nonce(),
            inbound,
            tx,
            cancel: CancellationToken::new(),
        };
        let nonce = waiter.nonce;

        match self.pending.take_or_insert(&claims.sub, waiter) {
            Arrival::First => {
                // Parked until the peer arrives; the watchdog drops the
                // entry when the token deadline passes first.
                trace!(stream = %claims.sub, "first arrival parked");
                let pending = self.pending.clone();
                let metrics = self.metrics.clone();
                let stream_id = claims.sub.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(ttl).await;
                    if let Some(waiter) = pending.remove_expired(&stream_id, nonce) {
                        debug!(stream = %stream_id, "pairing timed out");
                        let _ = waiter
                            .tx
                            .try_send(Err(Status::deadline_exceeded("no peer arrived")));
                        waiter.cancel.cancel();
                        metrics.expired_waiter();
                    }
                });
            }
            Arrival::Second { own, peer } => {
                debug!(stream = %claims.sub, "pair matched, forwarding");
                self.metrics.pairing();
                let cancel = peer.cancel.clone();
                let metrics = self.metrics.clone();
                tokio::spawn(forward(*own, *peer, cancel, metrics));
            }
        }

        let stream: Self::StreamStream = Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx));
        Ok(Response::new(stream))
    }
}

/// Copies frames in both directions until either source ends, then cancels
/// the other direction and drains it. Frames are opaque; ordering within a
/// direction is preserved by the underlying transport.
async fn forward(a: Waiter, b: Waiter, cancel: CancellationToken, metrics: RouterMetrics) {
    let up = copy(a.inbound, b.tx, cancel.clone(), metrics.clone());
    let down = copy(b.inbound, a.tx, cancel.clone(), metrics);
    tokio::join!(up, down);
    debug!("stream pair closed");
}

async fn copy(
    mut from: Streaming<proto::StreamFrame>,
    to: mpsc::Sender<Result<proto::StreamFrame, Status>>,
    cancel: CancellationToken,
    metrics: RouterMetrics,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = from.message() => match frame {
                Ok(Some(frame)) => {
                    metrics.frame();
                    if to.send(Ok(frame)).await.is_err() {
                        break;
                    }
                }
                // EOF or a transport error on the source ends this
                // direction; the peer observes end-of-stream.
                Ok(None) => break,
                Err(error) => {
                    trace!(%error, "stream source failed");
                    break;
                }
            },
        }
    }
    cancel.cancel();
}

impl std::fmt::Debug for RouterServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterServer")
            .field("audience", &self.audience)
            .finish_non_exhaustive()
    }
}
