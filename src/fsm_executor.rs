//! Helper module to maintain FSM sessions.\
//! The executor owns the process-wide services (event scheduler, ECMAScript worker,
//! custom actions, I/O processors) and the registry of running sessions.
//! Parent and child sessions reference each other only by session id via this registry.

extern crate core;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::mpsc::{SendError, Sender};
use std::sync::{Arc, Mutex};

use crate::common::{info, warn};

use crate::actions::{Action, ActionWrapper};
use crate::datamodel::{
    Datamodel, GlobalDataArc, NullDatamodel, NULL_DATAMODEL_LC,
};
#[cfg(feature = "ECMAScriptModel")]
use crate::ecma_script_datamodel::{ECMAScriptDatamodel, ECMA_SCRIPT_LC};
use crate::event_io_processor::scxml_event_io_processor::ScxmlEventIOProcessor;
use crate::event_io_processor::{EventDispatcher, EventIOProcessor};
use crate::event_scheduler::EventScheduler;
use crate::fsm;
use crate::fsm::{Event, FinishMode, Fsm, InvokeId, ScxmlSession, SessionId};
#[cfg(feature = "ECMAScriptModel")]
use crate::js_engine::JsEngine;

/// Number of cancelled invoke ids that are remembered to filter out
/// late events of already cancelled children.
const CANCELLED_INVOKE_CAPACITY: usize = 10_000;

/// Collaborator interface for the SCXML reader.\
/// The runtime itself works on the in-memory model, reading and XInclude
/// resolution is provided by the host.
pub trait ScxmlParser: Send + Sync {
    /// Parses a file into a model tree. Returns the model or the list of diagnostics.
    fn parse_file(&self, path: &str) -> Result<Box<Fsm>, Vec<String>>;

    /// Parses SCXML text into a model tree. Returns the model or the list of diagnostics.
    fn parse_content(&self, text: &str) -> Result<Box<Fsm>, Vec<String>>;
}

/// Bounded FIFO of cancelled invoke-ids.
/// Events of cancelled children must be dropped silently, the membership
/// test has to be O(1).
#[derive(Default)]
pub struct CancelledInvokeLog {
    order: VecDeque<InvokeId>,
    members: HashSet<InvokeId>,
}

impl CancelledInvokeLog {
    pub fn new() -> CancelledInvokeLog {
        CancelledInvokeLog {
            order: VecDeque::new(),
            members: HashSet::new(),
        }
    }

    pub fn add(&mut self, invoke_id: &InvokeId) {
        if self.members.insert(invoke_id.clone()) {
            self.order.push_back(invoke_id.clone());
            while self.order.len() > CANCELLED_INVOKE_CAPACITY {
                // Eviction in order of cancellation.
                if let Some(evicted) = self.order.pop_front() {
                    self.members.remove(&evicted);
                }
            }
        }
    }

    pub fn contains(&self, invoke_id: &InvokeId) -> bool {
        self.members.contains(invoke_id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[derive(Default)]
pub struct ExecuteState {
    pub processors: Vec<Arc<Mutex<Box<dyn EventIOProcessor>>>>,
    pub sessions: HashMap<SessionId, ScxmlSession>,
    pub cancelled_invokes: CancelledInvokeLog,
}

impl ExecuteState {
    pub fn new() -> ExecuteState {
        ExecuteState {
            processors: Vec::new(),
            sessions: HashMap::new(),
            cancelled_invokes: CancelledInvokeLog::new(),
        }
    }
}

/// Executes FSMs in separate threads.
/// This class maintains the IO Processors, the scheduler, the script engine
/// and the running sessions.
#[derive(Clone)]
pub struct FsmExecutor {
    pub state: Arc<Mutex<ExecuteState>>,
    pub scheduler: Arc<EventScheduler>,
    #[cfg(feature = "ECMAScriptModel")]
    pub js_engine: JsEngine,
    pub actions: ActionWrapper,
    pub datamodel_options: HashMap<String, String>,
    parser: Option<Arc<dyn ScxmlParser>>,
    dispatcher: Option<EventDispatcher>,
}

impl FsmExecutor {
    pub fn new() -> FsmExecutor {
        let mut e = FsmExecutor {
            state: Arc::new(Mutex::new(ExecuteState::new())),
            scheduler: Arc::new(EventScheduler::new()),
            #[cfg(feature = "ECMAScriptModel")]
            js_engine: JsEngine::new(),
            actions: ActionWrapper::new(),
            datamodel_options: HashMap::new(),
            parser: None,
            dispatcher: None,
        };
        e.add_processor(Box::new(ScxmlEventIOProcessor::new()));
        e
    }

    /// Registers an additional I/O processor, e.g. a http handler for
    /// external targets. Configuration problems are logged, the processor is
    /// registered anyway.
    pub fn add_processor(&mut self, processor: Box<dyn EventIOProcessor>) {
        for problem in processor.validate() {
            warn!("Processor {:?}: {}", processor.get_types(), problem);
        }
        self.state
            .lock()
            .unwrap()
            .processors
            .push(Arc::new(Mutex::new(processor)));
    }

    /// Registers a custom action, callable from datamodel expressions.
    pub fn add_action(&mut self, name: &str, action: Box<dyn Action>) {
        self.actions.add_action(name, action);
    }

    /// Plugs in the SCXML reader collaborator, used by "execute" and by
    /// \<invoke\> elements with a "src".
    pub fn set_parser(&mut self, parser: Arc<dyn ScxmlParser>) {
        self.parser = Some(parser);
    }

    pub fn set_datamodel_option(&mut self, name: &str, value: &str) {
        self.datamodel_options
            .insert(name.to_string(), value.to_string());
    }

    /// Replaces the default dispatcher wiring, for applications that bring
    /// their own.
    pub fn set_dispatcher(&mut self, dispatcher: EventDispatcher) {
        self.dispatcher = Some(dispatcher);
    }

    /// The dispatcher that combines target resolution with the scheduler.
    pub fn dispatcher(&self) -> EventDispatcher {
        match &self.dispatcher {
            Some(dispatcher) => dispatcher.clone(),
            None => EventDispatcher::new(self.scheduler.clone()),
        }
    }

    /// Creates the datamodel for a new session.\
    /// Only "ecmascript" and "null" are available. Anything else (e.g. "xpath")
    /// fails fast with a diagnostic.
    pub fn create_datamodel(
        &self,
        name: &str,
        global_data: GlobalDataArc,
    ) -> Result<Box<dyn Datamodel>, String> {
        match name.to_lowercase().as_str() {
            #[cfg(feature = "ECMAScriptModel")]
            ECMA_SCRIPT_LC => Ok(Box::new(ECMAScriptDatamodel::new(
                global_data,
                self.js_engine.clone(),
                &self.datamodel_options,
            ))),
            NULL_DATAMODEL_LC => Ok(Box::new(NullDatamodel::new(global_data))),
            other => Err(format!("Unsupported data model '{}'", other)),
        }
    }

    /// Shutdown of all FSMs, IO-Processors, the scheduler and the script worker.
    pub fn shutdown(&mut self) {
        let senders: Vec<Sender<Box<Event>>> = {
            let guard = self.state.lock().unwrap();
            guard.sessions.values().map(|s| s.sender.clone()).collect()
        };
        let cancel = Event::new_simple(fsm::EVENT_CANCEL_SESSION);
        for sender in senders {
            let _ = sender.send(cancel.get_copy());
        }
        {
            let mut guard = self.state.lock().unwrap();
            while let Some(pp) = guard.processors.pop() {
                pp.lock().unwrap().shutdown();
            }
        }
        self.scheduler.shutdown(false);
        #[cfg(feature = "ECMAScriptModel")]
        self.js_engine.shutdown();
    }

    /// Starts the given model as a new top level session.
    pub fn execute_model(&mut self, fsm: Box<Fsm>) -> ScxmlSession {
        fsm::start_fsm(fsm, Box::new(self.clone()))
    }

    /// Starts the given model with initial data values.
    pub fn execute_model_with_data(
        &mut self,
        fsm: Box<Fsm>,
        data: &HashMap<String, crate::datamodel::Data>,
    ) -> ScxmlSession {
        fsm::start_fsm_with_data(fsm, Box::new(self.clone()), data)
    }

    /// Starts a model as child session of some \<invoke\>.
    pub fn execute_model_for_invoke(
        &mut self,
        mut fsm: Box<Fsm>,
        data: &HashMap<String, crate::datamodel::Data>,
        parent: SessionId,
        invoke_id: &InvokeId,
    ) -> ScxmlSession {
        fsm.caller_invoke_id = Some(invoke_id.clone());
        fsm.parent_session_id = Some(parent);
        fsm::start_fsm_with_data_and_finish_mode(
            fsm,
            Box::new(self.clone()),
            data,
            FinishMode::DISPOSE,
        )
    }

    /// Loads and starts the FSM from the given source path via the parser collaborator.
    pub fn execute(&mut self, uri: &str) -> Result<ScxmlSession, String> {
        info!("Loading FSM from {}", uri);
        let parser = self
            .parser
            .clone()
            .ok_or_else(|| "No scxml parser registered".to_string())?;
        match parser.parse_file(uri) {
            Ok(fsm) => Ok(self.execute_model(fsm)),
            Err(messages) => Err(messages.join("\n")),
        }
    }

    /// Loads and starts a FSM as invoke child via the parser collaborator.
    pub fn execute_with_data(
        &mut self,
        uri: &str,
        data: &HashMap<String, crate::datamodel::Data>,
        parent: Option<SessionId>,
        invoke_id: &InvokeId,
    ) -> Result<ScxmlSession, String> {
        info!("Loading FSM from {}", uri);
        let parser = self
            .parser
            .clone()
            .ok_or_else(|| "No scxml parser registered".to_string())?;
        match parser.parse_file(uri) {
            Ok(mut fsm) => {
                fsm.caller_invoke_id = Some(invoke_id.clone());
                fsm.parent_session_id = parent;
                Ok(fsm::start_fsm_with_data(fsm, Box::new(self.clone()), data))
            }
            Err(messages) => Err(messages.join("\n")),
        }
    }

    /// Loads and starts a FSM from SCXML text as invoke child via the parser collaborator.
    pub fn execute_with_data_from_xml(
        &mut self,
        xml: &str,
        data: &HashMap<String, crate::datamodel::Data>,
        parent: Option<SessionId>,
        invoke_id: &InvokeId,
        finish_mode: FinishMode,
    ) -> Result<ScxmlSession, String> {
        info!("Loading FSM from XML");
        let parser = self
            .parser
            .clone()
            .ok_or_else(|| "No scxml parser registered".to_string())?;
        match parser.parse_content(xml) {
            Ok(mut fsm) => {
                fsm.caller_invoke_id = Some(invoke_id.clone());
                fsm.parent_session_id = parent;
                Ok(fsm::start_fsm_with_data_and_finish_mode(
                    fsm,
                    Box::new(self.clone()),
                    data,
                    finish_mode,
                ))
            }
            Err(messages) => Err(messages.join("\n")),
        }
    }

    /// Called by FSM after session ends and FinishMode::DISPOSE.
    pub fn remove_session(&mut self, session_id: SessionId) {
        self.state.lock().unwrap().sessions.remove(&session_id);
    }

    pub fn get_session_sender(&self, session_id: SessionId) -> Option<Sender<Box<Event>>> {
        Some(
            self.state
                .lock()
                .unwrap()
                .sessions
                .get(&session_id)?
                .sender
                .clone(),
        )
    }

    pub fn send_to_session(
        &self,
        session_id: SessionId,
        event: Event,
    ) -> Result<(), SendError<Box<Event>>> {
        match self.get_session_sender(session_id) {
            None => Err(SendError(Box::new(event))),
            Some(sender) => sender.send(Box::new(event)),
        }
    }

    /// Records a cancelled invoke. Events from it are dropped from now on.
    pub fn mark_invoke_cancelled(&self, invoke_id: &InvokeId) {
        self.state
            .lock()
            .unwrap()
            .cancelled_invokes
            .add(invoke_id);
    }

    pub fn is_invoke_cancelled(&self, invoke_id: &InvokeId) -> bool {
        self.state
            .lock()
            .unwrap()
            .cancelled_invokes
            .contains(invoke_id)
    }
}

impl Default for FsmExecutor {
    fn default() -> Self {
        FsmExecutor::new()
    }
}

#[cfg(test)]
mod tests {
    use super::CancelledInvokeLog;

    #[test]
    fn cancelled_invoke_log_is_bounded_fifo() {
        let mut log = CancelledInvokeLog::new();
        for i in 0..10_100 {
            log.add(&format!("invoke_{}", i));
        }
        assert_eq!(log.len(), 10_000);
        // The oldest entries were evicted in cancellation order.
        assert!(!log.contains(&"invoke_0".to_string()));
        assert!(!log.contains(&"invoke_99".to_string()));
        assert!(log.contains(&"invoke_100".to_string()));
        assert!(log.contains(&"invoke_10099".to_string()));
    }

    #[test]
    fn duplicates_are_not_added_twice() {
        let mut log = CancelledInvokeLog::new();
        log.add(&"a".to_string());
        log.add(&"a".to_string());
        assert_eq!(log.len(), 1);
    }
}
