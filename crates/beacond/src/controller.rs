use crate::config::TrackingConfig;
use crate::dispatch::EventDispatcher;
use crate::metrics::REWRITE_COUNT;
use beacon_api_client::{DeliveryTransport, TrackingApiClient};
use beacon_rewrite::rewrite_html;
use beacon_types::{DeliveryOutcome, EventKind, MessageId};
use mimetree::MimeNode;
use std::sync::Arc;
use tokio::runtime::Handle;

/// What happened when a message body was offered for instrumentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyOutcome {
    /// The html part now carries the beacon and tracked links
    Rewritten,
    NoHtmlPart,
    /// The html part was empty or only whitespace
    EmptyBody,
    /// There is no usable base url, so nothing can be generated
    NotConfigured,
}

impl BodyOutcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Rewritten => "rewritten",
            Self::NoHtmlPart => "no_html_part",
            Self::EmptyBody => "empty_body",
            Self::NotConfigured => "not_configured",
        }
    }
}

/// Entry point for the host mail system.
///
/// The controller holds no per-message state; the message id and
/// body or outcome are supplied with each callback. Every callback
/// invokes its `next` continuation exactly once, and never waits
/// for the tracking service before doing so.
pub struct PluginController {
    base_url: Option<String>,
    dispatcher: Option<Arc<EventDispatcher>>,
    dispatch_deferred: bool,
    runtime: Handle,
}

impl PluginController {
    /// Build a controller. A missing or invalid base url is logged
    /// here, once, and leaves the controller in a state where it
    /// passes everything through untouched.
    pub fn new(
        config: &TrackingConfig,
        transport: Arc<dyn DeliveryTransport>,
        runtime: Handle,
    ) -> Self {
        let base_url = match config.tracking_base() {
            Ok(base_url) => Some(base_url),
            Err(err) => {
                tracing::error!(
                    "tracking configuration error: {err}. \
                     Messages will not be instrumented and \
                     delivery events will not be sent"
                );
                None
            }
        };

        let dispatcher = base_url.as_ref().map(|base_url| {
            Arc::new(EventDispatcher::new(
                base_url.clone(),
                transport,
                config.max_in_flight,
                config.timeout,
            ))
        });

        Self {
            base_url,
            dispatcher,
            dispatch_deferred: config.dispatch_deferred,
            runtime,
        }
    }

    /// Build a controller that sends events over http
    pub fn with_http_transport(config: &TrackingConfig, runtime: Handle) -> anyhow::Result<Self> {
        let client = TrackingApiClient::with_timeout(config.timeout)?;
        Ok(Self::new(config, Arc::new(client), runtime))
    }

    pub fn is_configured(&self) -> bool {
        self.base_url.is_some()
    }

    /// Locate the html part of the message and instrument it in place
    pub fn rewrite_body(&self, message_id: &MessageId, root: &mut MimeNode) -> BodyOutcome {
        let Some(base_url) = &self.base_url else {
            return BodyOutcome::NotConfigured;
        };
        let Some(part) = root.locate_html_mut() else {
            return BodyOutcome::NoHtmlPart;
        };
        let html = match part.text() {
            Some(html) if !html.trim().is_empty() => html,
            _ => return BodyOutcome::EmptyBody,
        };

        let rewritten = rewrite_html(html, message_id, base_url);
        part.set_text(rewritten);
        BodyOutcome::Rewritten
    }

    pub fn on_body_ready<F: FnOnce()>(&self, message_id: &MessageId, root: &mut MimeNode, next: F) {
        let outcome = self.rewrite_body(message_id, root);
        REWRITE_COUNT.with_label_values(&[outcome.as_str()]).inc();
        tracing::debug!("{message_id}: body {}", outcome.as_str());
        next();
    }

    pub fn on_delivered<F: FnOnce()>(
        &self,
        message_id: &MessageId,
        outcome: &DeliveryOutcome,
        next: F,
    ) {
        self.fan_out(EventKind::Delivered, message_id, outcome);
        next();
    }

    pub fn on_bounced<F: FnOnce()>(
        &self,
        message_id: &MessageId,
        outcome: &DeliveryOutcome,
        next: F,
    ) {
        self.fan_out(EventKind::Bounced, message_id, outcome);
        next();
    }

    pub fn on_deferred<F: FnOnce()>(
        &self,
        message_id: &MessageId,
        outcome: &DeliveryOutcome,
        next: F,
    ) {
        if self.dispatch_deferred {
            self.fan_out(EventKind::Deferred, message_id, outcome);
        } else {
            tracing::info!(
                "{message_id}: deferred for {} recipient(s); not reported",
                outcome.recipients().len()
            );
        }
        next();
    }

    /// Spawn one dispatch per recipient, returning how many were started
    fn fan_out(&self, kind: EventKind, message_id: &MessageId, outcome: &DeliveryOutcome) -> usize {
        let Some(dispatcher) = &self.dispatcher else {
            tracing::debug!("{message_id}: tracking not configured; {kind} not reported");
            return 0;
        };

        let events = outcome.events(kind, message_id);
        if events.is_empty() {
            tracing::debug!("{message_id}: {kind} outcome has no recipients");
        }

        let count = events.len();
        for event in events {
            dispatcher.spawn(&self.runtime, event);
        }
        count
    }

    /// Wait for all in-flight dispatches to finish.
    /// Hosts that exit after handling a single outcome use this
    /// to avoid cancelling the dispatches on the way out.
    pub async fn wait_idle(&self) {
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.wait_idle().await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::RecordingTransport;
    use beacon_types::Recipient;
    use std::cell::Cell;

    fn config() -> TrackingConfig {
        TrackingConfig::default().with_base_url("http://localhost:3000")
    }

    fn controller(config: &TrackingConfig) -> (PluginController, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let controller = PluginController::new(config, transport.clone(), Handle::current());
        (controller, transport)
    }

    fn message() -> MimeNode {
        MimeNode::new_multipart(
            "multipart/alternative",
            vec![
                MimeNode::new_text_plain("see https://example.com/a?x=1"),
                MimeNode::new_html(
                    "<html><body><a href=\"https://example.com/a?x=1\">go</a>\
                     <a href=\"mailto:help@example.com\">help</a></body></html>",
                ),
            ],
            Some("b"),
        )
    }

    fn recipients(addrs: &[&str]) -> DeliveryOutcome {
        DeliveryOutcome::new(addrs.iter().map(|a| Recipient::new(*a)).collect())
    }

    #[tokio::test]
    async fn body_ready_rewrites_html() {
        let (controller, _) = controller(&config());
        let id = MessageId::new("abc123");
        let mut root = message();
        let calls = Cell::new(0);

        controller.on_body_ready(&id, &mut root, || calls.set(calls.get() + 1));
        k9::assert_equal!(calls.get(), 1);

        let html = root.locate_html().and_then(|p| p.text()).unwrap();
        k9::assert_equal!(
            html,
            format!(
                "<html><body><a href=\"http://localhost:3000/track-click/abc123?url=https%3A%2F%2Fexample.com%2Fa%3Fx%3D1\">go</a>\
                 <a href=\"mailto:help@example.com\">help</a>{}</body></html>",
                beacon_rewrite::beacon_tag("http://localhost:3000/track-open/abc123")
            )
        );

        // The plain text alternative is not touched
        k9::assert_equal!(
            root.child_parts()[0].text(),
            Some("see https://example.com/a?x=1")
        );
    }

    #[tokio::test]
    async fn body_without_html_is_unchanged() {
        let (controller, _) = controller(&config());
        let id = MessageId::new("abc123");

        let mut root = MimeNode::new_multipart(
            "multipart/mixed",
            vec![
                MimeNode::new_text_plain("hello"),
                MimeNode::new_binary("image/png", b"\x89PNG"),
            ],
            Some("b"),
        );
        let before = root.clone();
        k9::assert_equal!(controller.rewrite_body(&id, &mut root), BodyOutcome::NoHtmlPart);
        k9::assert_equal!(root, before);

        let mut root = MimeNode::new_html("  \r\n ");
        let before = root.clone();
        k9::assert_equal!(controller.rewrite_body(&id, &mut root), BodyOutcome::EmptyBody);
        k9::assert_equal!(root, before);
    }

    #[tokio::test]
    async fn unconfigured_passes_through() {
        let (controller, transport) = controller(&TrackingConfig::default());
        assert!(!controller.is_configured());
        let id = MessageId::new("abc123");

        let mut root = message();
        let before = root.clone();
        let calls = Cell::new(0);
        controller.on_body_ready(&id, &mut root, || calls.set(calls.get() + 1));
        k9::assert_equal!(root, before);

        controller.on_delivered(&id, &recipients(&["a@x.com"]), || calls.set(calls.get() + 1));
        controller.on_bounced(&id, &recipients(&["a@x.com"]), || calls.set(calls.get() + 1));
        controller.wait_idle().await;

        k9::assert_equal!(calls.get(), 3);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn delivered_fans_out_per_recipient() {
        let (controller, transport) = controller(&config());
        let id = MessageId::new("abc123");
        let calls = Cell::new(0);

        controller.on_delivered(&id, &recipients(&["a@x.com", "b@x.com"]), || {
            calls.set(calls.get() + 1)
        });
        // the continuation does not wait for the dispatches
        k9::assert_equal!(calls.get(), 1);
        controller.wait_idle().await;

        let mut sent = transport.sent();
        sent.sort_by(|a, b| a.1.details.recipient.cmp(&b.1.details.recipient));
        k9::assert_equal!(sent.len(), 2);
        for ((url, event), recipient) in sent.iter().zip(["a@x.com", "b@x.com"]) {
            k9::assert_equal!(url.as_str(), "http://localhost:3000/track-delivery/abc123");
            k9::assert_equal!(event.event_type, EventKind::Delivered);
            k9::assert_equal!(event.email_id, id);
            k9::assert_equal!(event.details.recipient, recipient);
            k9::assert_equal!(event.details.dsn_status, "2.0.0");
            k9::assert_equal!(event.details.dsn_message, "Delivered");
        }
    }

    #[tokio::test]
    async fn bounced_defaults_status() {
        let (controller, transport) = controller(&config());
        controller.on_bounced(&MessageId::new("abc123"), &recipients(&["a@x.com"]), || {});
        controller.wait_idle().await;

        let sent = transport.sent();
        k9::assert_equal!(sent.len(), 1);
        k9::assert_equal!(sent[0].1.event_type, EventKind::Bounced);
        k9::assert_equal!(sent[0].1.details.dsn_status, "5.X.X");
        k9::assert_equal!(sent[0].1.details.dsn_message, "Permanent Failure");
    }

    #[tokio::test]
    async fn failed_dispatch_does_not_stop_others() {
        let transport = Arc::new(RecordingTransport::failing_for(&["a@x.com"]));
        let controller = PluginController::new(&config(), transport.clone(), Handle::current());

        let outcome = recipients(&["a@x.com", "b@x.com", "c@x.com"])
            .with_status(Some("5.1.1".to_string()), Some("no such user".to_string()));
        controller.on_bounced(&MessageId::new("abc123"), &outcome, || {});
        controller.wait_idle().await;

        let mut sent: Vec<String> = transport
            .sent()
            .into_iter()
            .map(|(_, event)| event.details.recipient)
            .collect();
        sent.sort();
        k9::assert_equal!(sent, vec!["b@x.com", "c@x.com"]);
    }

    #[tokio::test]
    async fn deferred_is_opt_in() {
        let id = MessageId::new("abc123");
        let outcome = recipients(&["a@x.com"]);

        let (controller, transport) = controller(&config());
        let calls = Cell::new(0);
        controller.on_deferred(&id, &outcome, || calls.set(calls.get() + 1));
        controller.wait_idle().await;
        k9::assert_equal!(calls.get(), 1);
        assert!(transport.sent().is_empty());

        let mut enabled = config();
        enabled.dispatch_deferred = true;
        let (controller, transport) = self::controller(&enabled);
        controller.on_deferred(&id, &outcome, || {});
        controller.wait_idle().await;
        let sent = transport.sent();
        k9::assert_equal!(sent.len(), 1);
        k9::assert_equal!(sent[0].1.event_type, EventKind::Deferred);
        k9::assert_equal!(sent[0].1.details.dsn_status, "4.X.X");
    }

    #[tokio::test]
    async fn missing_recipient_list_is_empty() {
        let (controller, transport) = controller(&config());
        let calls = Cell::new(0);
        controller.on_delivered(&MessageId::new("abc123"), &DeliveryOutcome::default(), || {
            calls.set(calls.get() + 1)
        });
        controller.wait_idle().await;
        k9::assert_equal!(calls.get(), 1);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn large_outcome_reports_every_recipient() {
        let (controller, transport) = controller(&config());
        let addrs: Vec<String> = (0..200).map(|n| format!("r{n}@x.com")).collect();
        let outcome =
            DeliveryOutcome::new(addrs.iter().map(|a| Recipient::new(a.as_str())).collect());
        let calls = Cell::new(0);

        controller.on_delivered(&MessageId::new("abc123"), &outcome, || {
            calls.set(calls.get() + 1)
        });
        k9::assert_equal!(calls.get(), 1);
        controller.wait_idle().await;

        let mut sent: Vec<String> = transport
            .sent()
            .into_iter()
            .map(|(_, event)| event.details.recipient)
            .collect();
        sent.sort();
        let mut expected = addrs.clone();
        expected.sort();
        k9::assert_equal!(sent, expected);
    }

    #[tokio::test]
    async fn saturated_dispatches_wait_their_turn() {
        let mut limited = config();
        limited.max_in_flight = 1;
        let (controller, transport) = controller(&limited);

        let id = MessageId::new("abc123");
        let outcome = recipients(&["a@x.com", "b@x.com", "c@x.com"]);
        k9::assert_equal!(controller.fan_out(EventKind::Delivered, &id, &outcome), 3);
        controller.wait_idle().await;
        k9::assert_equal!(transport.sent().len(), 3);
    }
}
