use crate::metrics::{DISPATCH_BACKLOG, DISPATCH_COUNT};
use anyhow::Context;
use beacon_api_client::{DeliveryTransport, Url};
use beacon_types::urls::delivery_tracking_url;
use beacon_types::{DeliveryDetail, DeliveryEvent, EventKind, MessageId};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// Ships delivery events to the tracking service.
///
/// Each event is a single fire-and-forget POST: there is no retry.
/// Failures are logged and counted, and never returned to the caller.
pub struct EventDispatcher {
    base_url: String,
    transport: Arc<dyn DeliveryTransport>,
    timeout: Duration,
    max_in_flight: usize,
    sema: Arc<Semaphore>,
    /// Spawned events that have not yet finished, whether posting
    /// or still waiting for a permit
    pending: AtomicUsize,
    idle: Notify,
}

/// Counts a spawned event as pending for as long as it is alive,
/// including when its task is dropped without ever being polled
struct Pending(Arc<EventDispatcher>);

impl Pending {
    fn new(dispatcher: &Arc<EventDispatcher>) -> Self {
        dispatcher.pending.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(dispatcher))
    }
}

impl Drop for Pending {
    fn drop(&mut self) {
        if self.0.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl EventDispatcher {
    pub fn new(
        base_url: impl Into<String>,
        transport: Arc<dyn DeliveryTransport>,
        max_in_flight: usize,
        timeout: Duration,
    ) -> Self {
        let max_in_flight = max_in_flight.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            base_url: base_url.into(),
            transport,
            timeout,
            max_in_flight,
            sema: Arc::new(Semaphore::new(max_in_flight)),
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    /// Build an event and send it
    pub async fn dispatch(&self, kind: EventKind, message_id: &MessageId, detail: DeliveryDetail) {
        self.send(DeliveryEvent::new(kind, message_id, detail)).await
    }

    /// Send a prepared event, logging the result
    pub async fn send(&self, event: DeliveryEvent) {
        let kind = event.event_type;
        match self.try_send(&event).await {
            Ok(()) => {
                tracing::debug!(
                    "dispatched {kind} event for {} recipient {}",
                    event.email_id,
                    event.details.recipient
                );
                DISPATCH_COUNT
                    .with_label_values(&[kind.as_str(), "ok"])
                    .inc();
            }
            Err(err) => {
                tracing::error!(
                    "failed to dispatch {kind} event for {} recipient {}: {err:#}",
                    event.email_id,
                    event.details.recipient
                );
                DISPATCH_COUNT
                    .with_label_values(&[kind.as_str(), "fail"])
                    .inc();
            }
        }
    }

    async fn try_send(&self, event: &DeliveryEvent) -> anyhow::Result<()> {
        let url = delivery_tracking_url(&self.base_url, &event.email_id);
        let url = Url::parse(&url).with_context(|| format!("invalid delivery url {url}"))?;

        tokio::time::timeout(
            self.timeout,
            self.transport.post_delivery_event(&url, event),
        )
        .await
        .with_context(|| format!("timed out after {:?} posting to {url}", self.timeout))?
    }

    /// Wait for a permit to post, counting the events that
    /// find `max_in_flight` posts already outstanding
    async fn acquire_permit(&self) -> anyhow::Result<OwnedSemaphorePermit> {
        match self.sema.clone().try_acquire_owned() {
            Ok(permit) => Ok(permit),
            Err(TryAcquireError::NoPermits) => {
                DISPATCH_BACKLOG.inc();
                tracing::debug!(
                    "{} delivery events already in flight; waiting for a slot",
                    self.max_in_flight
                );
                Ok(self.sema.clone().acquire_owned().await?)
            }
            Err(TryAcquireError::Closed) => {
                anyhow::bail!("dispatch semaphore is closed");
            }
        }
    }

    /// Send the event in the background on `runtime`, without waiting
    /// for it to complete. At most `max_in_flight` posts are outstanding
    /// at once; events beyond that wait their turn in the background.
    pub fn spawn(self: &Arc<Self>, runtime: &Handle, event: DeliveryEvent) {
        let pending = Pending::new(self);
        runtime.spawn(async move {
            let dispatcher = &pending.0;
            match dispatcher.acquire_permit().await {
                Ok(permit) => {
                    dispatcher.send(event).await;
                    drop(permit);
                }
                Err(err) => {
                    tracing::error!(
                        "dropping {} event for {} recipient {}: {err:#}",
                        event.event_type,
                        event.email_id,
                        event.details.recipient
                    );
                }
            }
        });
    }

    /// Wait until every spawned event has finished
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}
