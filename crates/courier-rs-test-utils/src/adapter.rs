use async_trait::async_trait;
use courier_rs_protocol::{ClientAdapter, Event, TransportError};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Default)]
struct Recorded {
    events: Vec<Event>,
    starts: usize,
    stops: usize,
}

/// Client adapter that records every pushed event.
///
/// Clones share the same recording, so a test can hand one clone to a
/// delivery loop and inspect the other.
#[derive(Clone, Default)]
pub struct RecordingAdapter {
    recorded: Arc<Mutex<Recorded>>,
    fail_on_push: Option<usize>,
}

impl RecordingAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the `n`-th push (1-based) and every push after it.
    pub fn failing_on(n: usize) -> Self {
        Self {
            recorded: Arc::default(),
            fail_on_push: Some(n),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.recorded.lock().events.clone()
    }

    /// Event types in push order.
    pub fn event_types(&self) -> Vec<String> {
        self.recorded
            .lock()
            .events
            .iter()
            .map(|event| event.event_type().to_string())
            .collect()
    }

    pub fn starts(&self) -> usize {
        self.recorded.lock().starts
    }

    pub fn stops(&self) -> usize {
        self.recorded.lock().stops
    }

    pub fn clear(&self) {
        self.recorded.lock().events.clear();
    }
}

#[async_trait]
impl ClientAdapter for RecordingAdapter {
    async fn start(&mut self) -> Result<(), TransportError> {
        self.recorded.lock().starts += 1;
        Ok(())
    }

    async fn push(&mut self, event: &Event) -> Result<(), TransportError> {
        let mut recorded = self.recorded.lock();
        if let Some(limit) = self.fail_on_push
            && recorded.events.len() + 1 >= limit
        {
            return Err(TransportError::Disconnected);
        }
        recorded.events.push(event.clone());
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), TransportError> {
        self.recorded.lock().stops += 1;
        Ok(())
    }
}
