//! K8s event recording.

use k8s_openapi::api::core::v1::ObjectReference;
use kube::client::Client;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};

use crate::k8s::APP_NAME;

/// The severity of a recorded event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Normal,
    Warning,
}

/// A fire-and-forget sink of events about operator managed objects.
pub trait EventSink: Send + Sync {
    /// Record an event about the given subject.
    ///
    /// Implementations must never block or fail the caller.
    fn emit(&self, subject: ObjectReference, severity: Severity, reason: &str, message: String);
}

/// An `EventSink` publishing to the K8s Events API.
#[derive(Clone)]
pub struct KubeEventSink {
    recorder: Recorder,
}

impl KubeEventSink {
    /// Create a new instance reporting as the given pod.
    pub fn new(client: Client, pod_name: &str) -> Self {
        let reporter = Reporter {
            controller: APP_NAME.into(),
            instance: Some(pod_name.into()),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

impl EventSink for KubeEventSink {
    fn emit(&self, subject: ObjectReference, severity: Severity, reason: &str, message: String) {
        let event = Event {
            type_: match severity {
                Severity::Normal => EventType::Normal,
                Severity::Warning => EventType::Warning,
            },
            reason: reason.into(),
            note: Some(message),
            action: "Reconcile".into(),
            secondary: None,
        };
        let recorder = self.recorder.clone();
        tokio::spawn(async move {
            if let Err(err) = recorder.publish(&event, &subject).await {
                tracing::warn!(error = ?err, reason = %event.reason, "error publishing event");
            }
        });
    }
}
