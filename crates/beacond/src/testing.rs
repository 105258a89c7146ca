use async_trait::async_trait;
use beacon_api_client::{DeliveryTransport, Url};
use beacon_types::DeliveryEvent;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Records every event it is given, failing for any recipient
/// listed in `fail_for`
#[derive(Default)]
pub struct RecordingTransport {
    pub fail_for: Vec<String>,
    pub sent: Mutex<Vec<(Url, DeliveryEvent)>>,
}

impl RecordingTransport {
    pub fn failing_for(recipients: &[&str]) -> Self {
        Self {
            fail_for: recipients.iter().map(|r| r.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<(Url, DeliveryEvent)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryTransport for RecordingTransport {
    async fn post_delivery_event(&self, url: &Url, event: &DeliveryEvent) -> anyhow::Result<()> {
        if self.fail_for.contains(&event.details.recipient) {
            anyhow::bail!("connection refused");
        }
        self.sent.lock().unwrap().push((url.clone(), event.clone()));
        Ok(())
    }
}

/// Never completes within any reasonable timeout
pub struct StalledTransport;

#[async_trait]
impl DeliveryTransport for StalledTransport {
    async fn post_delivery_event(&self, _url: &Url, _event: &DeliveryEvent) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

/// Holds each post briefly, tracking how many overlap
#[derive(Default)]
pub struct SlowTransport {
    active: AtomicUsize,
    peak: AtomicUsize,
    completed: AtomicUsize,
}

impl SlowTransport {
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeliveryTransport for SlowTransport {
    async fn post_delivery_event(&self, _url: &Url, _event: &DeliveryEvent) -> anyhow::Result<()> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
