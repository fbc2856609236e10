//! OCPP message router and offline queue
//!
//! Inbound Calls are dispatched to registered handlers keyed by action;
//! inbound Results/Errors are correlated against the pending-request table.
//! Outbound messages are serialized and handed to the transport when
//! connected, otherwise queued FIFO and drained in order on reconnect.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};

use super::message::{Action, ErrorCode, Message};

/// Handler for an inbound Call; returns the response frame, if any.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: &Message) -> Option<Message>;
}

impl<F> MessageHandler for F
where
    F: Fn(&Message) -> Option<Message> + Send + Sync,
{
    fn handle(&self, message: &Message) -> Option<Message> {
        self(message)
    }
}

type SendFn = dyn Fn(&str) -> bool + Send + Sync;
type ResultHook = dyn Fn(Action, &Message) + Send + Sync;

/// Bound on the offline queue; overflow discards the oldest entry.
const MAX_QUEUE_SIZE: usize = 1000;

pub struct MessageProcessor {
    handlers: Mutex<HashMap<Action, Arc<dyn MessageHandler>>>,
    send_fn: Mutex<Option<Arc<SendFn>>>,
    result_hook: Mutex<Option<Arc<ResultHook>>>,
    queue: Mutex<VecDeque<String>>,
    pending: Mutex<HashMap<String, Action>>,
    connected: AtomicBool,
    dropped: AtomicU64,
}

impl MessageProcessor {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            send_fn: Mutex::new(None),
            result_hook: Mutex::new(None),
            queue: Mutex::new(VecDeque::new()),
            pending: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Install the transport send callback. Returns true when the frame was
    /// sent or buffered by the transport.
    pub fn set_send_fn(&self, f: impl Fn(&str) -> bool + Send + Sync + 'static) {
        *self.send_fn.lock() = Some(Arc::new(f));
    }

    /// Hook invoked for every correlated CallResult, with the action the
    /// original Call carried.
    pub fn set_result_hook(&self, f: impl Fn(Action, &Message) + Send + Sync + 'static) {
        *self.result_hook.lock() = Some(Arc::new(f));
    }

    pub fn register_handler(&self, action: Action, handler: Arc<dyn MessageHandler>) {
        info!(action = %action, "registered OCPP handler");
        self.handlers.lock().insert(action, handler);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Update the connection flag; a false→true edge drains the queue.
    pub fn set_connected(&self, connected: bool) {
        let was = self.connected.swap(connected, Ordering::SeqCst);
        if connected && !was {
            info!(queued = self.queue_size(), "connection established, draining queue");
            self.process_queue();
        }
    }

    pub fn queue_size(&self) -> usize {
        self.queue.lock().len()
    }

    /// Messages discarded to keep the offline queue bounded.
    pub fn dropped_messages(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    pub fn clear_queue(&self) {
        self.queue.lock().clear();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    #[cfg(test)]
    pub fn pending_action(&self, id: &str) -> Option<Action> {
        self.pending.lock().get(id).copied()
    }

    /// Send or enqueue an outbound message.
    ///
    /// For a Call the pending entry is recorded before the transport sees the
    /// frame, so a fast Result can always correlate.
    pub fn send_message(&self, message: &Message) -> bool {
        let wire = message.to_wire();

        if !self.is_connected() {
            self.queue_message(wire);
            return true;
        }

        if let Message::Call { id, action, .. } = message {
            self.pending.lock().insert(id.clone(), *action);
        }
        self.send_direct(&wire)
    }

    /// Parse, route and answer one inbound frame.
    pub fn process_incoming(&self, text: &str) -> Result<()> {
        debug!(frame = text, "processing inbound OCPP frame");
        let message = Message::from_wire(text)?;

        match &message {
            Message::Call { id, action, .. } => {
                let handler = self.handlers.lock().get(action).cloned();
                let response = match handler {
                    Some(handler) => handler.handle(&message),
                    None => {
                        warn!(action = %action, "no handler registered for inbound Call");
                        Some(Message::call_error(
                            id.clone(),
                            ErrorCode::NotImplemented,
                            format!("No handler registered for action: {action}"),
                        ))
                    }
                };
                if let Some(response) = response {
                    if !self.send_message(&response) {
                        return Err(GatewayError::network("failed to send response"));
                    }
                }
            }
            Message::CallResult { id, .. } => {
                let action = self.pending.lock().remove(id);
                match action {
                    Some(action) => {
                        debug!(id, action = %action, "correlated CallResult");
                        let hook = self.result_hook.lock().clone();
                        if let Some(hook) = hook {
                            hook(action, &message);
                        }
                    }
                    None => warn!(id, "CallResult for unknown message id, dropping"),
                }
            }
            Message::CallError {
                id,
                code,
                description,
                ..
            } => {
                let action = self.pending.lock().remove(id);
                match action {
                    Some(action) => warn!(
                        id, action = %action, code = %code, description,
                        "CSMS rejected request"
                    ),
                    None => warn!(id, "CallError for unknown message id, dropping"),
                }
            }
        }
        Ok(())
    }

    /// Drain queued frames in order; a failed send leaves the remainder
    /// queued in their original order. Returns the number sent.
    pub fn process_queue(&self) -> usize {
        if !self.is_connected() {
            warn!("cannot process queue, not connected");
            return 0;
        }

        let mut sent = 0;
        loop {
            let next = {
                let mut queue = self.queue.lock();
                match queue.front() {
                    Some(front) => front.clone(),
                    None => break,
                }
            };

            if self.send_direct(&next) {
                self.queue.lock().pop_front();
                sent += 1;
            } else {
                break;
            }
        }

        info!(sent, remaining = self.queue_size(), "processed offline queue");
        sent
    }

    fn send_direct(&self, wire: &str) -> bool {
        let send_fn = self.send_fn.lock().clone();
        match send_fn {
            Some(send_fn) => send_fn(wire),
            None => {
                warn!("cannot send message, no transport callback registered");
                false
            }
        }
    }

    fn queue_message(&self, wire: String) {
        let mut queue = self.queue.lock();
        if queue.len() >= MAX_QUEUE_SIZE {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
        queue.push_back(wire);
        debug!(queued = queue.len(), "message queued while offline");
    }
}

impl Default for MessageProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn capture() -> (Arc<StdMutex<Vec<String>>>, Arc<MessageProcessor>) {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let processor = Arc::new(MessageProcessor::new());
        let log = sent.clone();
        processor.set_send_fn(move |frame: &str| {
            log.lock().unwrap().push(frame.to_string());
            true
        });
        (sent, processor)
    }

    #[test]
    fn pending_entry_removed_on_result() {
        let (_sent, processor) = capture();
        processor.set_connected(true);

        let call = Message::call_with_id("req00001", Action::Heartbeat, json!({}));
        assert!(processor.send_message(&call));
        assert_eq!(processor.pending_action("req00001"), Some(Action::Heartbeat));

        processor
            .process_incoming(r#"[3,"req00001",{"currentTime":"2023-01-01T00:00:00Z"}]"#)
            .unwrap();
        assert_eq!(processor.pending_count(), 0);
    }

    #[test]
    fn unknown_result_id_leaves_pending_untouched() {
        let (_sent, processor) = capture();
        processor.set_connected(true);

        let call = Message::call_with_id("req00001", Action::Heartbeat, json!({}));
        processor.send_message(&call);

        processor.process_incoming(r#"[3,"nope",{}]"#).unwrap();
        assert_eq!(processor.pending_count(), 1);
    }

    #[test]
    fn call_error_clears_pending() {
        let (_sent, processor) = capture();
        processor.set_connected(true);

        let call = Message::call_with_id("req00001", Action::BootNotification, json!({}));
        processor.send_message(&call);

        processor
            .process_incoming(r#"[4,"req00001","InternalError","boom",{}]"#)
            .unwrap();
        assert_eq!(processor.pending_count(), 0);
    }

    #[test]
    fn offline_sends_queue_and_drain_in_order() {
        let (sent, processor) = capture();

        for i in 0..3 {
            let call = Message::call_with_id(format!("hb{i:05}"), Action::Heartbeat, json!({}));
            assert!(processor.send_message(&call));
        }
        assert_eq!(processor.queue_size(), 3);
        assert!(sent.lock().unwrap().is_empty());

        processor.set_connected(true);

        let frames = sent.lock().unwrap().clone();
        assert_eq!(frames.len(), 3);
        assert!(frames[0].contains("hb00000"));
        assert!(frames[1].contains("hb00001"));
        assert!(frames[2].contains("hb00002"));
        assert_eq!(processor.queue_size(), 0);
    }

    #[test]
    fn failed_drain_preserves_remaining_order() {
        let processor = Arc::new(MessageProcessor::new());
        let allowed = Arc::new(AtomicU64::new(1));
        let sent = Arc::new(StdMutex::new(Vec::new()));
        {
            let allowed = allowed.clone();
            let sent = sent.clone();
            processor.set_send_fn(move |frame: &str| {
                if allowed.load(Ordering::SeqCst) == 0 {
                    return false;
                }
                allowed.fetch_sub(1, Ordering::SeqCst);
                sent.lock().unwrap().push(frame.to_string());
                true
            });
        }

        for i in 0..3 {
            processor.send_message(&Message::call_with_id(
                format!("m{i}"),
                Action::Heartbeat,
                json!({}),
            ));
        }

        processor.set_connected(true);
        // Only the first frame went out; the rest stay queued, in order.
        assert_eq!(sent.lock().unwrap().len(), 1);
        assert_eq!(processor.queue_size(), 2);

        allowed.store(10, Ordering::SeqCst);
        processor.process_queue();
        let frames = sent.lock().unwrap().clone();
        assert!(frames[1].contains("m1"));
        assert!(frames[2].contains("m2"));
    }

    #[test]
    fn queue_overflow_drops_oldest() {
        let (_sent, processor) = capture();
        for i in 0..(MAX_QUEUE_SIZE + 5) {
            processor.send_message(&Message::call_with_id(
                format!("m{i}"),
                Action::Heartbeat,
                json!({}),
            ));
        }
        assert_eq!(processor.queue_size(), MAX_QUEUE_SIZE);
        assert_eq!(processor.dropped_messages(), 5);
        // The oldest survivor is m5.
        assert!(processor.queue.lock().front().unwrap().contains("m5"));
    }

    #[test]
    fn unhandled_call_answers_not_implemented() {
        let (sent, processor) = capture();
        processor.set_connected(true);

        processor
            .process_incoming(r#"[2,"id42","Foo",{}]"#)
            .unwrap();

        let frames = sent.lock().unwrap().clone();
        assert_eq!(frames.len(), 1);
        let parsed = Message::from_wire(&frames[0]).unwrap();
        match parsed {
            Message::CallError { id, code, .. } => {
                assert_eq!(id, "id42");
                assert_eq!(code, ErrorCode::NotImplemented);
            }
            _ => panic!("expected CallError"),
        }
    }

    #[test]
    fn registered_handler_produces_response() {
        let (sent, processor) = capture();
        processor.set_connected(true);

        processor.register_handler(
            Action::RemoteStartTransaction,
            Arc::new(|msg: &Message| {
                Some(Message::call_result(
                    msg.id().to_string(),
                    json!({"status": "Accepted"}),
                ))
            }),
        );

        processor
            .process_incoming(
                r#"[2,"rs1","RemoteStartTransaction",{"idToken":{"idToken":"TAG001"}}]"#,
            )
            .unwrap();

        let frames = sent.lock().unwrap().clone();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].starts_with(r#"[3,"rs1""#));
    }

    #[test]
    fn result_hook_sees_correlated_action() {
        let (_sent, processor) = capture();
        processor.set_connected(true);

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let log = seen.clone();
        processor.set_result_hook(move |action, _msg| {
            log.lock().unwrap().push(action);
        });

        processor.send_message(&Message::call_with_id(
            "boot0001",
            Action::BootNotification,
            json!({}),
        ));
        processor
            .process_incoming(r#"[3,"boot0001",{"status":"Accepted","interval":300,"currentTime":"2023-01-01T00:00:00Z"}]"#)
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![Action::BootNotification]);
    }

    #[test]
    fn malformed_frame_is_protocol_error() {
        let (_sent, processor) = capture();
        assert!(matches!(
            processor.process_incoming("not json"),
            Err(GatewayError::Protocol(_))
        ));
        assert!(matches!(
            processor.process_incoming(r#"{"not":"array"}"#),
            Err(GatewayError::Protocol(_))
        ));
    }
}
