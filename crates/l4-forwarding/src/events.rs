//! Service event recording.

use crate::service::Service;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::{info, warn};

pub const REASON_SYNC_LOAD_BALANCER: &str = "SyncLoadBalancer";
pub const REASON_MIXED_STATIC_IP: &str = "MixedStaticIP";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Normal,
    Warning,
}

#[derive(Debug, Clone, Error)]
#[error("failed to record event for {service}: {message}")]
pub struct EventError {
    pub service: String,
    pub message: String,
}

/// Receives human readable notifications about a Service.
pub trait EventRecorder: Send + Sync {
    fn record(
        &self,
        service: &Service,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) -> Result<(), EventError>;
}

/// Records an event, logging instead of failing if the recorder fails.
pub fn emit(
    recorder: &dyn EventRecorder,
    service: &Service,
    event_type: EventType,
    reason: &str,
    message: &str,
) {
    if let Err(e) = recorder.record(service, event_type, reason, message) {
        warn!(service = %service, reason = %reason, error = %e, "Dropping service event");
    }
}

/// Writes events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventRecorder;

impl EventRecorder for TracingEventRecorder {
    fn record(
        &self,
        service: &Service,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) -> Result<(), EventError> {
        match event_type {
            EventType::Normal => info!(service = %service, reason = %reason, "{}", message),
            EventType::Warning => warn!(service = %service, reason = %reason, "{}", message),
        }
        Ok(())
    }
}

/// One event kept by [`MemoryEventRecorder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub service: String,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
}

/// Keeps events in memory.
#[derive(Debug, Default)]
pub struct MemoryEventRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryEventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Messages of all recorded events, oldest first.
    pub fn messages(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.message).collect()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl EventRecorder for MemoryEventRecorder {
    fn record(
        &self,
        service: &Service,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) -> Result<(), EventError> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedEvent {
                service: service.key(),
                event_type,
                reason: reason.to_string(),
                message: message.to_string(),
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct Failing;

    impl EventRecorder for Failing {
        fn record(
            &self,
            service: &Service,
            _event_type: EventType,
            _reason: &str,
            _message: &str,
        ) -> Result<(), EventError> {
            Err(EventError {
                service: service.key(),
                message: "apiserver unavailable".to_string(),
            })
        }
    }

    #[test]
    fn test_memory_recorder() {
        let recorder = MemoryEventRecorder::new();
        let svc = Service::new("default", "web");
        emit(&recorder, &svc, EventType::Normal, REASON_SYNC_LOAD_BALANCER, "ForwardingRule fr created");
        emit(&recorder, &svc, EventType::Warning, REASON_MIXED_STATIC_IP, "both set");

        let events = recorder.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].service, "default/web");
        assert_eq!(events[1].event_type, EventType::Warning);
        assert_eq!(recorder.messages()[0], "ForwardingRule fr created");

        recorder.clear();
        assert!(recorder.events().is_empty());
    }

    #[test]
    fn test_emit_swallows_recorder_failure() {
        let svc = Service::new("default", "web");
        emit(&Failing, &svc, EventType::Normal, REASON_SYNC_LOAD_BALANCER, "ignored");
        emit(&TracingEventRecorder, &svc, EventType::Normal, REASON_SYNC_LOAD_BALANCER, "logged");
    }
}
