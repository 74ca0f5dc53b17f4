//! Event I/O processors base.
//! For details about the concept see [W3C:The Event I/O Processors](https://www.w3.org/TR/scxml/#eventioprocessors).\
//! This module provides a trait to implement Event-I/O-Processors and the dispatcher
//! that combines target resolution with the delayed-event scheduler.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use crate::common::{debug, error};

use crate::datamodel::{Datamodel, GlobalDataArc};
use crate::event_scheduler::EventScheduler;
use crate::fsm::SessionId;
use crate::fsm::{Event, Fsm, EVENT_CANCEL_SESSION};

pub mod scxml_event_io_processor;

pub const SYS_IO_PROCESSORS: &str = "_ioprocessors";

#[derive(Debug, Clone, Default)]
pub struct ExternalQueueContainer {
    /// The FSMs that are connected to this IO Processor
    pub fsms: HashMap<SessionId, Sender<Box<Event>>>,
}

impl ExternalQueueContainer {
    pub fn new() -> ExternalQueueContainer {
        ExternalQueueContainer {
            fsms: HashMap::new(),
        }
    }

    pub fn shutdown(&mut self) {
        let cancel_event = Event::new_simple(EVENT_CANCEL_SESSION);
        for (id, sender) in &self.fsms {
            debug!("Send cancel to fsm #{}", id);
            let _ = sender.send(cancel_event.get_copy());
        }
    }
}

/// Trait for Event I/O Processors. \
/// See <https://www.w3.org/TR/scxml/#eventioprocessors>.
/// As the I/O Processors hold session related data, an instance of this trait must be bound to one session,
/// but may share backends with other sessions, e.g. a http server.
pub trait EventIOProcessor: Debug + Send {
    /// Returns the location of this session and processor.
    fn get_location(&self, id: SessionId) -> String;

    /// Returns the type names of this processor.
    fn get_types(&self) -> &[&str];

    /// True if this processor can deliver to the given target URI.
    fn can_handle(&self, target: &str) -> bool;

    /// Configuration self-check, performed when the processor is registered.
    /// Returns a list of problems, empty if the processor is usable.
    fn validate(&self) -> Vec<String> {
        Vec::new()
    }

    fn get_external_queues(&mut self) -> &mut ExternalQueueContainer;

    fn add_fsm(&mut self, _fsm: &Fsm, datamodel: &mut dyn Datamodel) {
        let global = datamodel.global().lock();
        let sender = global.externalQueue.sender.clone();
        self.get_external_queues()
            .fsms
            .insert(global.session_id, sender);
    }

    fn get_copy(&self) -> Box<dyn EventIOProcessor>;

    /// Delivers the event to the target, fire-and-forget.\
    /// Returns false if the event could not be handed over. Delivery failures
    /// put "error.communication" into the internal queue of the sending session.
    fn send(&mut self, global: &GlobalDataArc, target: &str, event: Event) -> bool;

    fn shutdown(&mut self);
}

/// Composes target resolution and the delayed-event scheduler.\
/// A \<send\> with delay 0 is delivered directly on the calling thread, everything
/// else goes through the scheduler and can be cancelled by its send-id.
#[derive(Clone)]
pub struct EventDispatcher {
    pub scheduler: Arc<EventScheduler>,
}

impl EventDispatcher {
    pub fn new(scheduler: Arc<EventScheduler>) -> EventDispatcher {
        EventDispatcher { scheduler }
    }

    /// Dispatches the event. Returns the effective send-id, to be used by \<cancel\>.
    pub fn dispatch(
        &self,
        processor: Arc<Mutex<Box<dyn EventIOProcessor>>>,
        global: GlobalDataArc,
        target: String,
        event: Event,
        delay_ms: i64,
        send_id: Option<String>,
        session_id: SessionId,
    ) -> Result<String, String> {
        if delay_ms <= 0 {
            let effective_id = match send_id {
                Some(id) if !id.is_empty() => id,
                _ => self.scheduler.next_send_id(),
            };
            let mut guard = processor.lock().unwrap();
            if !guard.send(&global, target.as_str(), event) {
                error!("Could not deliver '{}'", target);
            }
            Ok(effective_id)
        } else {
            self.scheduler.schedule(
                Box::new(move || {
                    let mut guard = processor.lock().unwrap();
                    let _ignored = guard.send(&global, target.as_str(), event);
                }),
                delay_ms,
                send_id,
                Some(session_id),
            )
        }
    }
}
