//! Implements the data-structures and algorithms described in the W3C scxml recommendation.\
//! As reference each type and method has the w3c description as documentation.\
//! See [W3C:Algorithm for SCXML Interpretation](https://www.w3.org/TR/scxml/#AlgorithmforSCXMLInterpretation)

#![allow(non_camel_case_types)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::{Debug, Display, Formatter};
use std::hash::Hash;
use std::ops::DerefMut;
use std::slice::Iter;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{channel, Receiver, SendError, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use std::{fmt, thread};

use crate::common::{debug, error, info};

use crate::actions::ActionWrapper;
use crate::datamodel::{Data, DataStore, Datamodel, SCXML_INVOKE_TYPE, SCXML_INVOKE_TYPE_SHORT};
use crate::event_io_processor::EventIOProcessor;
use crate::executable_content::ExecutableContent;
use crate::fsm_executor::FsmExecutor;
use crate::get_global;

/// Platform specific event to cancel the current session.
pub const EVENT_CANCEL_SESSION: &str = "error.platform.cancel";

/// Platform marker event used to wake up a blocking external dequeue
/// when an internal event arrives.
pub const INTERNAL_EVENT_ARRIVED: &str = "event.internal";

pub const EVENT_DONE_INVOKE_PREFIX: &str = "done.invoke.";
pub const EVENT_DONE_STATE_PREFIX: &str = "done.state.";

static PLATFORM_ID_COUNTER: AtomicU32 = AtomicU32::new(1);
pub(crate) static ID_COUNTER: AtomicU32 = AtomicU32::new(1);
pub(crate) static SESSION_ID_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Starts the FSM inside a worker thread.
pub fn start_fsm(sm: Box<Fsm>, executor: Box<FsmExecutor>) -> ScxmlSession {
    start_fsm_with_data(sm, executor, &HashMap::new())
}

pub fn start_fsm_with_data(
    sm: Box<Fsm>,
    executor: Box<FsmExecutor>,
    data: &HashMap<String, Data>,
) -> ScxmlSession {
    start_fsm_with_data_and_finish_mode(sm, executor, data, FinishMode::DISPOSE)
}

pub fn start_fsm_with_data_and_finish_mode(
    mut sm: Box<Fsm>,
    executor: Box<FsmExecutor>,
    data: &HashMap<String, Data>,
    finish_mode: FinishMode,
) -> ScxmlSession {
    #![allow(non_snake_case)]
    let externalQueue: BlockingQueue<Box<Event>> = BlockingQueue::new();
    let sender = externalQueue.sender.clone();

    let mut processors: Vec<Arc<Mutex<Box<dyn EventIOProcessor>>>> = Vec::new();
    {
        let guard = executor.state.lock().unwrap();
        for p in &guard.processors {
            processors.push(Arc::new(Mutex::new(p.lock().unwrap().get_copy())));
        }
    }

    let data_copy = data.clone();
    let session_id: SessionId = SESSION_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut session = ScxmlSession::new_without_join_handle(session_id, sender.clone());

    match finish_mode {
        FinishMode::DISPOSE => {}
        FinishMode::KEEP_CONFIGURATION => {
            // FSM shall record the final configuration on exit.
            let _ = session
                .global_data
                .lock()
                .final_configuration
                .insert(Vec::new());
        }
        FinishMode::NOTHING => {}
    }

    executor
        .state
        .lock()
        .unwrap()
        .sessions
        .insert(session_id, session.clone());

    let global_data = session.global_data.clone();
    let finish_mode_copy = finish_mode.clone();

    let thread = thread::Builder::new()
        .name("fsm_interpret".to_string())
        .spawn(move || {
            info!("SM starting...");
            let executor_copy = (*executor).clone();
            let monitor;
            {
                let mut global = global_data.lock();
                global.externalQueue = externalQueue;
                global.session_id = session_id;
                global.caller_invoke_id = sm.caller_invoke_id.clone();
                global.parent_session_id = sm.parent_session_id;
                global.actions = executor.actions.clone();
                for value in data_copy {
                    global.environment.set(value.0.as_str(), value.1);
                }
                for p in &processors {
                    for t in p.lock().unwrap().get_types() {
                        global.io_processors.insert(t.to_string(), p.clone());
                    }
                }
                for state in &sm.states {
                    global.state_names.insert(state.id, state.name.clone());
                    if state.states.is_empty() && state.history_type == HistoryType::None {
                        global.atomic_states.insert(state.id);
                    }
                }
                monitor = global.step_monitor.clone();
                global.executor = Some(executor);
            }
            match executor_copy.create_datamodel(sm.datamodel.as_str(), global_data.clone()) {
                Err(message) => {
                    error!("SM failed to start: {}", message);
                    let _ = global_data.lock().start_error.insert(message);
                    monitor.terminated();
                }
                Ok(mut datamodel) => {
                    for p in &processors {
                        p.lock().unwrap().add_fsm(&sm, datamodel.deref_mut());
                    }
                    sm.interpret(datamodel.deref_mut());

                    let scheduler = executor_copy.scheduler.clone();
                    scheduler.cancel_session(session_id);
                    datamodel.clear();
                    if matches!(finish_mode_copy, FinishMode::DISPOSE) {
                        let mut e = executor_copy;
                        e.remove_session(session_id);
                    }
                    monitor.terminated();
                }
            }
            info!("SM finished");
        });

    let _ = session.session_thread.insert(thread.unwrap());
    session
}

////////////////////////////////////////////////////////////////////////////////
// ## General Purpose Data types
// Structs and methods are designed to match the signatures in the W3c-Pseudo-code.

/// ## General Purpose List type, as used in the W3C algorithm.
#[derive(Clone)]
pub struct List<T: Clone> {
    data: Vec<T>,
}

impl<T: Clone + PartialEq> Default for List<T> {
    fn default() -> Self {
        List::new()
    }
}

impl<T: Clone + PartialEq> List<T> {
    pub fn new() -> List<T> {
        List {
            data: Default::default(),
        }
    }

    /// Extension to create a list from an array.
    pub fn from_array(l: &[T]) -> List<T> {
        List { data: l.to_vec() }
    }

    /// Extension to return the current size of the list.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Extension to add an element at the end of the list.
    pub fn push(&mut self, t: T) {
        self.data.push(t);
    }

    /// Extension to merge the specified set into this list.
    pub fn push_set(&mut self, l: &OrderedSet<T>) {
        for i in l.data.iter() {
            self.data.push((*i).clone());
        }
    }

    /// *W3C says*: Returns the head of the list
    pub fn head(&self) -> &T {
        self.data.first().unwrap()
    }

    /// *W3C says*:
    /// Returns the tail of the list (i.e., the rest of the list once the head is removed)
    pub fn tail(&self) -> List<T> {
        let mut t = List {
            data: self.data.clone(),
        };
        t.data.remove(0);
        t
    }

    /// *W3C says*:
    /// Returns the list appended with l
    pub fn append(&self, l: &List<T>) -> List<T> {
        let mut t = List {
            data: self.data.clone(),
        };
        for i in l.data.iter() {
            t.data.push((*i).clone());
        }
        t
    }

    /// *W3C says*:
    /// Returns the list appended with l
    pub fn append_set(&self, l: &OrderedSet<T>) -> List<T> {
        let mut t = List {
            data: self.data.clone(),
        };
        for i in l.data.iter() {
            t.data.push((*i).clone());
        }
        t
    }

    /// *W3C says*:
    /// Returns the list of elements that satisfy the predicate f
    /// # Actual Implementation:
    /// Can't name the function "filter" because this get in conflict with pre-defined "filter"
    /// that is introduced by the Iterator-implementation.
    pub fn filter_by(&self, f: &dyn Fn(&T) -> bool) -> List<T> {
        let mut t = List::new();
        for i in self.data.iter() {
            if f(i) {
                t.data.push((*i).clone());
            }
        }
        t
    }

    /// *W3C says*:
    /// Returns true if some element in the list satisfies the predicate f.  Returns false for an empty list.
    pub fn some(&self, f: &dyn Fn(&T) -> bool) -> bool {
        for si in &self.data {
            if f(si) {
                return true;
            }
        }
        false
    }

    /// *W3C says*:
    /// Returns true if every element in the list satisfies the predicate f.  Returns true for an empty list.
    pub fn every(&self, f: &dyn Fn(&T) -> bool) -> bool {
        for si in &self.data {
            if !f(si) {
                return false;
            }
        }
        true
    }

    /// Returns a sorted copy of the list.
    pub fn sort<F>(&self, compare: &F) -> List<T>
    where
        F: Fn(&T, &T) -> std::cmp::Ordering + ?Sized,
    {
        let mut t = List {
            data: self.data.clone(),
        };
        t.data.sort_by(compare);
        t
    }

    /// Extension to support "for in" semantics.
    pub fn iterator(&self) -> Iter<'_, T> {
        self.data.iter()
    }

    /// Extension to support conversion to ordered sets.\
    /// Returns a new OrderedSet with copies of the elements in this list.
    /// Duplicates are removed.
    pub fn to_set(&self) -> OrderedSet<T> {
        let mut s = OrderedSet::new();
        for e in self.data.iter() {
            s.add(e.clone());
        }
        s
    }
}

/// Set datatype used by the algorithm,
/// *W3C says*:
/// Note that the algorithm assumes a Lisp-like semantics in which the empty Set null is equivalent
/// to boolean 'false' and all other entities are equivalent to 'true'.
#[derive(Debug, Clone)]
pub struct OrderedSet<T> {
    pub(crate) data: Vec<T>,
}

impl<T: Clone + PartialEq> Default for OrderedSet<T> {
    fn default() -> Self {
        OrderedSet::new()
    }
}

impl<T: Clone + PartialEq> OrderedSet<T> {
    pub fn new() -> OrderedSet<T> {
        OrderedSet {
            data: Default::default(),
        }
    }

    pub fn from_array(l: &[T]) -> OrderedSet<T> {
        OrderedSet { data: l.to_vec() }
    }

    /// Extension: The size (only informational)
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// *W3C says*:
    /// Adds e to the set if it is not already a member
    pub fn add(&mut self, e: T) {
        if !self.data.contains(&e) {
            self.data.push(e);
        }
    }

    /// *W3C says*:
    /// Deletes e from the set
    pub fn delete(&mut self, e: &T) {
        self.data.retain(|x| *x != *e);
    }

    /// *W3C says*:
    /// Adds all members of s that are not already members of the set
    /// (s must also be an OrderedSet)
    pub fn union(&mut self, s: &OrderedSet<T>) {
        for si in &s.data {
            if !self.isMember(si) {
                self.add(si.clone());
            }
        }
    }

    /// *W3C says*:
    /// Is e a member of set?
    #[allow(non_snake_case)]
    pub fn isMember(&self, e: &T) -> bool {
        self.data.contains(e)
    }

    /// *W3C says*:
    /// Returns true if some element in the set satisfies the predicate f.
    ///
    /// Returns false for an empty set.
    pub fn some(&self, f: &dyn Fn(&T) -> bool) -> bool {
        for si in &self.data {
            if f(si) {
                return true;
            }
        }
        false
    }

    /// *W3C says*:
    /// Returns true if every element in the set satisfies the predicate f.
    ///
    /// Returns true for an empty set.
    pub fn every(&self, f: &dyn Fn(&T) -> bool) -> bool {
        for si in &self.data {
            if !f(si) {
                return false;
            }
        }
        true
    }

    /// *W3C says*:
    /// Returns true if this set and set s have at least one member in common
    #[allow(non_snake_case)]
    pub fn hasIntersection(&self, s: &OrderedSet<T>) -> bool {
        for si in &self.data {
            if s.isMember(si) {
                return true;
            }
        }
        false
    }

    /// *W3C says*:
    /// Is the set empty?
    #[allow(non_snake_case)]
    pub fn isEmpty(&self) -> bool {
        self.size() == 0
    }

    /// *W3C says*:
    /// Remove all elements from the set (make it empty)
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// *W3C says*:
    /// Converts the set to a list that reflects the order in which elements were originally added.
    #[allow(non_snake_case)]
    pub fn toList(&self) -> List<T> {
        let mut l = List::new();
        for e in self.data.iter() {
            l.push(e.clone());
        }
        l
    }

    pub fn sort<F>(&self, compare: &F) -> List<T>
    where
        F: Fn(&T, &T) -> std::cmp::Ordering + ?Sized,
    {
        let mut t = List {
            data: self.data.clone(),
        };
        t.data.sort_by(compare);
        t
    }

    pub fn iterator(&self) -> Iter<'_, T> {
        self.data.iter()
    }
}

/// Queue datatype used by the algorithm
#[derive(Debug)]
pub struct Queue<T> {
    data: VecDeque<T>,
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Queue::new()
    }
}

impl<T> Queue<T> {
    pub fn new() -> Queue<T> {
        Queue {
            data: VecDeque::new(),
        }
    }

    /// Extension to re-use exiting instances.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// *W3C says*:
    /// Puts e last in the queue
    pub fn enqueue(&mut self, e: T) {
        self.data.push_back(e);
    }

    /// *W3C says*:
    /// Removes and returns first element in queue
    pub fn dequeue(&mut self) -> T {
        self.data.pop_front().unwrap()
    }

    /// *W3C says*:
    /// Is the queue empty?
    #[allow(non_snake_case)]
    pub fn isEmpty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Blocking queue, used for the external event queue.\
/// Senders can be cloned and handed to other sessions and I/O processors.
#[derive(Debug)]
pub struct BlockingQueue<T> {
    pub sender: Sender<T>,
    pub receiver: Arc<Mutex<Receiver<T>>>,
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        BlockingQueue::new()
    }
}

impl<T> BlockingQueue<T> {
    pub fn new() -> BlockingQueue<T> {
        let (sender, receiver) = channel();
        BlockingQueue {
            receiver: Arc::new(Mutex::new(receiver)),
            sender,
        }
    }

    /// *W3C says*:
    /// Puts e last in the queue
    pub fn enqueue(&mut self, e: T) {
        let _ = self.sender.send(e);
    }

    /// *W3C says*:
    /// Removes and returns first element in queue, blocks if queue is empty
    pub fn dequeue(&mut self) -> T {
        self.receiver.lock().unwrap().recv().unwrap()
    }
}

/// *W3C says*:
/// table[foo] returns the value associated with foo.
/// table[foo] = bar sets the value associated with foo to be bar.
/// #Actual implementation:
/// Instead of the Operators, methods are used.
#[derive(Debug)]
pub struct HashTable<K, T> {
    data: HashMap<K, T>,
}

impl<K: Eq + Hash + Clone, T: Clone> Default for HashTable<K, T> {
    fn default() -> Self {
        HashTable::new()
    }
}

impl<K: Eq + Hash + Clone, T: Clone> HashTable<K, T> {
    pub fn new() -> HashTable<K, T> {
        HashTable {
            data: HashMap::new(),
        }
    }

    /// Extension to re-use exiting instances.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn put(&mut self, k: K, v: &T) {
        self.data.insert(k, v.clone());
    }

    pub fn put_move(&mut self, k: K, v: T) {
        self.data.insert(k, v);
    }

    pub fn put_all(&mut self, t: &HashTable<K, T>) {
        for (k, v) in &t.data {
            self.data.insert(k.clone(), v.clone());
        }
    }

    pub fn has(&self, k: K) -> bool {
        self.data.contains_key(&k)
    }

    pub fn get(&self, k: K) -> &T {
        self.data.get(&k).unwrap()
    }
}

/////////////////////////////////////////////////////////////
// FSM model (State etc, representing the XML-data-model)

pub type Name = String;
pub type StateId = u32;
pub type DocumentId = u32;
pub type ExecutableContentId = u32;
pub type TransitionId = u32;
pub type SessionId = u32;
pub type InvokeId = String;
pub type StateVec = Vec<State>;
pub type StateNameMap = HashMap<Name, StateId>;
pub type TransitionMap = HashMap<TransitionId, Transition>;
pub type EventSender = Sender<Box<Event>>;

/// Factory for the model of an \<invoke\> child session.
/// Set by the model builder when the child machine is assembled in-process,
/// the alternative ways are "src" and \<content\> via the parser collaborator.
pub type FsmFactory = Arc<dyn Fn() -> Box<Fsm> + Send + Sync>;

/// Datamodel binding type. See [W3C SCXML Data Binding](https://www.w3.org/TR/scxml/#DataBinding)
#[derive(Debug, Clone, PartialEq, Copy)]
pub enum BindingType {
    Early,
    Late,
}

impl FromStr for BindingType {
    type Err = ();

    fn from_str(input: &str) -> Result<BindingType, Self::Err> {
        match input.to_lowercase().as_str() {
            "early" => Ok(BindingType::Early),
            "late" => Ok(BindingType::Late),
            _ => Err(()),
        }
    }
}

/// Event type.
#[derive(Debug, Clone, PartialEq, Copy)]
pub enum EventType {
    /// for events raised by the platform itself, such as error events
    platform,
    /// for events raised by \<raise\> and \<send\> with target '_internal'
    internal,
    /// for all other events
    external,
}

impl EventType {
    pub fn name(&self) -> &'static str {
        match self {
            EventType::platform => "platform",
            EventType::internal => "internal",
            EventType::external => "external",
        }
    }
}

/// A name/value pair of a \<param\> element or a namelist entry.
/// Pairs are kept in document order, duplicate names are legal.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamPair {
    pub name: String,
    pub value: Data,
}

impl ParamPair {
    pub fn new(name: &str, value: &Data) -> ParamPair {
        ParamPair {
            name: name.to_string(),
            value: value.clone(),
        }
    }

    pub fn new_moved(name: String, value: Data) -> ParamPair {
        ParamPair { name, value }
    }
}

impl Display for ParamPair {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

/// *W3C says*:
/// ##The Internal Structure of Events.
/// Events have an internal structure which is reflected in the _event variable. This variable can be
/// accessed to condition transitions (via boolean expressions in the 'cond' attribute) or to update
/// the data model (via \<assign\>), etc.
///
/// The SCXML Processor must ensure that the following fields are present in all events, whether
/// internal or external.
///
/// - name. This is a character string giving the name of the event. It is what is matched against the
///   'event' attribute of \<transition\>.
/// - type. This field describes the event type: "platform" (for events raised by the platform itself,
///   such as error events), "internal" (for events raised by \<raise\> and \<send\> with target
///   '_internal') or "external" (for all other events).
/// - sendid. If the sending entity has specified a value for this, the Processor must set this field
///   to that value. Otherwise, in the case of error events triggered by a failed attempt to send an
///   event, the Processor must set this field to the send id of the triggering \<send\> element.
///   Otherwise it must leave it blank.
/// - origin. This is a URI, equivalent to the 'target' attribute on the \<send\> element.
/// - origintype. This is equivalent to the 'type' field on the \<send\> element.
/// - invokeid. If this event is generated from an invoked child process, the SCXML Processor must set
///   this field to the invoke id of the invocation that triggered the child process.
/// - data. This field contains whatever data the sending entity chose to include in this event.
#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub etype: EventType,
    pub sendid: Option<String>,
    pub origin: Option<String>,
    pub origin_type: Option<String>,
    pub invoke_id: Option<InvokeId>,

    /// Name-Value pairs from \<param\> elements or a namelist.
    pub param_values: Option<Vec<ParamPair>>,

    /// Payload from a \<content\> element.
    pub content: Option<Data>,
}

impl Display for Event {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl Event {
    pub fn new_simple(name: &str) -> Event {
        Event {
            name: name.to_string(),
            etype: EventType::external,
            sendid: None,
            origin: None,
            param_values: None,
            content: None,
            invoke_id: None,
            origin_type: None,
        }
    }

    pub fn new(
        prefix: &str,
        id: &str,
        data_params: Option<Vec<ParamPair>>,
        data_content: Option<Data>,
    ) -> Event {
        Event {
            name: format!("{}{}", prefix, id),
            etype: EventType::external,
            sendid: None,
            origin: None,
            param_values: data_params,
            content: data_content,
            invoke_id: None,
            origin_type: None,
        }
    }

    pub fn error(name: &str) -> Event {
        Event {
            name: format!("error.{}", name),
            etype: EventType::platform,
            sendid: None,
            origin: None,
            param_values: None,
            content: None,
            invoke_id: None,
            origin_type: None,
        }
    }

    /// W3C: Indicates that an error internal to the execution of the document has occurred,
    /// such as one arising from expression evaluation.
    pub fn error_execution(send_id: &Option<String>, invoke_id: &Option<InvokeId>) -> Event {
        Event {
            name: "error.execution".to_string(),
            etype: EventType::platform,
            sendid: send_id.clone(),
            origin: None,
            param_values: None,
            content: None,
            invoke_id: invoke_id.clone(),
            origin_type: None,
        }
    }

    /// W3C: Indicates that an error has occurred while trying to communicate with an external entity.
    pub fn error_communication(trigger: &Event) -> Event {
        Event {
            name: "error.communication".to_string(),
            etype: EventType::platform,
            sendid: trigger.sendid.clone(),
            origin: None,
            param_values: None,
            content: None,
            invoke_id: trigger.invoke_id.clone(),
            origin_type: None,
        }
    }

    pub fn platform_internal_event_arrived() -> Event {
        Event {
            name: INTERNAL_EVENT_ARRIVED.to_string(),
            etype: EventType::platform,
            sendid: None,
            origin: None,
            param_values: None,
            content: None,
            invoke_id: None,
            origin_type: None,
        }
    }

    pub fn get_copy(&self) -> Box<Event> {
        Box::new(self.clone())
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct CommonContent {
    /// content inside \<content\> child
    pub content: Option<String>,

    /// expr-attribute of \<content\> child
    pub content_expr: Option<String>,
}

impl Default for CommonContent {
    fn default() -> Self {
        CommonContent::new()
    }
}

impl CommonContent {
    pub fn new() -> CommonContent {
        CommonContent {
            content: None,
            content_expr: None,
        }
    }
}

/// Stores \<param\> elements for \<send\>, \<donedata\> or \<invoke\>
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub expr: String,
    pub location: String,
}

/// *W3C says*:
/// The \<invoke\> element is used to create an instance of an external service.
#[derive(Clone)]
pub struct Invoke {
    pub doc_id: DocumentId,

    /// *W3C says*:
    /// Attribute 'idlocation':\
    /// Location expression.\
    /// Any data model expression evaluating to a data model location.\
    /// Must not occur with the 'id' attribute.
    pub external_id_location: String,

    /// *W3C says*:
    /// Attribute 'type':\
    /// A URI specifying the type of the external service.
    pub type_name: String,

    /// *W3C says*:
    /// Attribute 'typeexpr':\
    /// A dynamic alternative to 'type'.
    pub type_expr: String,

    /// *W3C says*:
    /// List of valid location expressions
    pub name_list: Vec<String>,

    /// *W3C says*:
    /// A URI to be passed to the external service.\
    /// Must not occur with the 'srcexpr' attribute or the \<content\> element.
    pub src: String,

    /// *W3C says*:
    /// A dynamic alternative to 'src'.
    pub src_expr: String,

    /// *W3C says*:
    /// Boolean.\
    /// A flag indicating whether to forward events to the invoked process.
    pub autoforward: bool,

    /// *W3C says*:
    /// Executable content to massage the data returned from the invoked component.
    /// Occurs 0 or 1 times.
    pub finalize: ExecutableContentId,

    /// Generated invokeId (identical to "id" if specified).
    pub invoke_id: String,

    pub parent_state_name: String,

    /// \<param\> children
    pub params: Option<Vec<Parameter>>,

    pub content: Option<CommonContent>,

    /// Pre-assembled model of the child, used instead of "src"/content
    /// when the host builds machines programmatically.
    pub model: Option<FsmFactory>,
}

impl Default for Invoke {
    fn default() -> Self {
        Invoke::new()
    }
}

impl Invoke {
    pub fn new() -> Invoke {
        Invoke {
            doc_id: 0,
            invoke_id: "".to_string(),
            parent_state_name: "".to_string(),
            external_id_location: "".to_string(),
            type_name: "".to_string(),
            type_expr: "".to_string(),
            name_list: vec![],
            src: "".to_string(),
            src_expr: "".to_string(),
            autoforward: false,
            params: None,
            content: None,
            finalize: 0,
            model: None,
        }
    }
}

impl PartialEq for Invoke {
    fn eq(&self, other: &Self) -> bool {
        self.doc_id == other.doc_id && self.invoke_id == other.invoke_id
    }
}

impl Debug for Invoke {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invoke")
            .field("invokeId", &self.invoke_id)
            .field("idlocation", &self.external_id_location)
            .field("type", &self.type_name)
            .field("typeexpr", &self.type_expr)
            .field("src", &self.src)
            .field("srcexpr", &self.src_expr)
            .field("autoforward", &self.autoforward)
            .field("params", &self.params)
            .field("content", &self.content)
            .field("model", &self.model.is_some())
            .finish()
    }
}

pub struct Cancel {
    pub send_id: String,
    pub send_id_expr: String,
}

impl Default for Cancel {
    fn default() -> Self {
        Cancel::new()
    }
}

impl Cancel {
    pub fn new() -> Cancel {
        Cancel {
            send_id: String::new(),
            send_id_expr: String::new(),
        }
    }
}

impl Debug for Cancel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancel")
            .field("send_id", &self.send_id)
            .field("send_id_expr", &self.send_id_expr)
            .finish()
    }
}

/// Holds all parameters of a \<send\> call.
pub struct SendParameters {
    /// SCXML \<send\> attribute 'idlocation'
    pub name_location: String,
    /// SCXML \<send\> attribute 'id'.
    pub name: String,
    /// SCXML \<send\> attribute 'event'.
    pub event: String,
    /// SCXML \<send\> attribute 'eventexpr'.
    pub event_expr: String,
    /// SCXML \<send\> attribute 'target'.
    pub target: String,
    /// SCXML \<send\> attribute 'targetexpr'.
    pub target_expr: String,
    /// SCXML \<send\> attribute 'type'.
    pub type_value: String,
    /// SCXML \<send\> attribute 'typeexpr'.
    pub type_expr: String,
    /// SCXML \<send\> attribute 'delay' in milliseconds.
    pub delay_ms: u64,
    /// SCXML \<send\> attribute 'delayexpr'.
    pub delay_expr: String,
    /// SCXML \<send\> attribute 'namelist'. Must not be specified in conjunction with 'content'.
    pub name_list: String,
    /// \<param\> children
    pub params: Option<Vec<Parameter>>,
    pub content: Option<CommonContent>,
}

impl Default for SendParameters {
    fn default() -> Self {
        SendParameters::new()
    }
}

impl SendParameters {
    pub fn new() -> SendParameters {
        SendParameters {
            name_location: "".to_string(),
            name: "".to_string(),
            event: "".to_string(),
            event_expr: "".to_string(),
            target: "".to_string(),
            target_expr: "".to_string(),
            type_value: "".to_string(),
            type_expr: "".to_string(),
            delay_ms: 0,
            delay_expr: "".to_string(),
            name_list: "".to_string(),
            params: None,
            content: None,
        }
    }
}

impl Debug for SendParameters {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Send").field("event", &self.event).finish()
    }
}

#[derive(Clone, Debug)]
pub struct DoneData {
    /// content of \<content\> child
    pub content: Option<CommonContent>,

    /// \<param\> children
    pub params: Option<Vec<Parameter>>,
}

impl Default for DoneData {
    fn default() -> Self {
        DoneData::new()
    }
}

impl DoneData {
    pub fn new() -> DoneData {
        DoneData {
            content: None,
            params: None,
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
pub enum HistoryType {
    Shallow,
    Deep,
    None,
}

pub fn map_history_type(ts: &str) -> HistoryType {
    match ts.to_lowercase().as_str() {
        "deep" => HistoryType::Deep,
        "shallow" => HistoryType::Shallow,
        "" => HistoryType::None,
        _ => panic!("Unknown history type '{}'", ts),
    }
}

#[derive(Debug, PartialEq)]
pub enum TransitionType {
    Internal,
    External,
}

pub fn map_transition_type(ts: &str) -> TransitionType {
    match ts.to_lowercase().as_str() {
        "internal" => TransitionType::Internal,
        "external" | "" => TransitionType::External,
        _ => panic!("Unknown transition type '{}'", ts),
    }
}

/// Stores all data for a State.
/// In this model "State" is used for the SCXML elements "state", "parallel",
/// "final" and "history".
///
/// ##Definitions:
/// - An atomic state is a \<state\> that has no \<state\>, \<parallel\> or \<final\> children.
/// - A compound state is a \<state\> that has \<state\>, \<parallel\>, or \<final\> children
///   (or a combination of these).
/// - The default initial state(s) of a compound state are those specified by the 'initial' attribute
///   or \<initial\> element, if either is present. Otherwise it is the state's first child state
///   in document order.
#[allow(non_snake_case)]
pub struct State {
    /// The internal Id (not W3C). Used to reference the state.
    /// Index+1 of the state in Fsm.states
    pub id: StateId,

    /// The unique id, counting in document order.
    /// "id" is increasing on references to states, not declaration and may not result in correct order.
    pub doc_id: DocumentId,

    /// The SCXML id.
    pub name: String,

    /// The initial transition id (if the state has sub-states).
    pub initial: TransitionId,

    /// The Ids of the sub-states of this state.
    pub states: Vec<StateId>,

    /// True for "parallel" states
    pub is_parallel: bool,

    /// True for "final" states
    pub is_final: bool,

    pub history_type: HistoryType,

    /// The script that is executed if the state is entered. See W3c comments for \<onentry\> above.
    pub onentry: ExecutableContentId,

    /// The script that is executed if the state is left. See W3c comments for \<onexit\> above.
    pub onexit: ExecutableContentId,

    /// All transitions between sub-states.
    pub transitions: List<TransitionId>,

    pub invoke: List<Invoke>,
    pub history: List<StateId>,

    /// The local datamodel
    pub data: DataStore,

    /// True if the state was never entered before.
    pub isFirstEntry: bool,

    pub parent: StateId,
    pub donedata: Option<DoneData>,
}

impl State {
    pub fn new(name: &str) -> State {
        State {
            id: 0,
            doc_id: 0,
            name: name.to_string(),
            initial: 0,
            states: vec![],
            onentry: 0,
            onexit: 0,
            transitions: List::new(),
            is_parallel: false,
            is_final: false,
            history_type: HistoryType::None,
            data: DataStore::new(),
            isFirstEntry: true,
            parent: 0,
            donedata: None,
            invoke: List::new(),
            history: List::new(),
        }
    }
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// A state to state transition with references to content that shall be executed with the transition.
#[derive(Debug)]
pub struct Transition {
    pub id: TransitionId,
    pub doc_id: DocumentId,

    /// The event descriptors, splitted from the "event" attribute.
    pub events: Vec<String>,
    /// True if the transition matches any event ("*").
    pub wildcard: bool,
    pub cond: Option<String>,
    pub source: StateId,
    pub target: Vec<StateId>,
    pub transition_type: TransitionType,
    pub content: ExecutableContentId,
}

impl PartialEq for Transition {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Default for Transition {
    fn default() -> Self {
        Transition::new()
    }
}

impl Transition {
    pub fn new() -> Transition {
        let idc = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Transition {
            id: idc,
            doc_id: 0,
            events: vec![],
            wildcard: false,
            cond: None,
            source: 0,
            target: vec![],
            transition_type: TransitionType::External,
            content: 0,
        }
    }

    /// *W3C says*:
    /// An event descriptor matches an event name if its string of tokens is an exact match or a prefix
    /// of the set of tokens in the event's name. In all cases, the token matching is case sensitive.\
    /// A descriptor MAY also end with the wildcard '.*', which matches zero or more tokens at the end
    /// of the processed event's name.
    #[allow(non_snake_case)]
    pub fn nameMatch(&self, name: &str) -> bool {
        self.wildcard || self.events.iter().any(|d| descriptor_match(d, name))
    }
}

/// Token-wise prefix match of one event descriptor against an event name.
pub fn descriptor_match(descriptor: &str, name: &str) -> bool {
    let d = descriptor
        .strip_suffix(".*")
        .unwrap_or(descriptor)
        .trim_end_matches('.');
    if d == name {
        true
    } else if name.len() > d.len() && name.starts_with(d) {
        name.as_bytes()[d.len()] == b'.'
    } else {
        false
    }
}

/// Mode how the executor handles the ScxmlSession
/// if the FSM is finished.
#[derive(Debug, Clone)]
pub enum FinishMode {
    DISPOSE,
    KEEP_CONFIGURATION,
    NOTHING,
}

/// Monitors macrostep completion and termination of a session.\
/// The interpreter marks the session "idle" whenever it blocks for the next
/// external event, host threads can wait on this to observe quiescence.
#[derive(Debug)]
pub struct StepMonitor {
    state: Mutex<StepState>,
    cond: Condvar,
}

#[derive(Debug)]
struct StepState {
    macrosteps: u64,
    /// Number of external events consumed from the queue (markers and
    /// platform cancel events not counted).
    external_events: u64,
    idle: bool,
    terminated: bool,
}

impl Default for StepMonitor {
    fn default() -> Self {
        StepMonitor::new()
    }
}

impl StepMonitor {
    pub fn new() -> StepMonitor {
        StepMonitor {
            state: Mutex::new(StepState {
                macrosteps: 0,
                external_events: 0,
                idle: false,
                terminated: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Counters for [StepMonitor::wait_quiescence]: completed macrosteps and
    /// consumed external events.
    pub fn counters(&self) -> (u64, u64) {
        let state = self.state.lock().unwrap();
        (state.macrosteps, state.external_events)
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().unwrap().terminated
    }

    /// Called by the interpreter after it dequeued from the external queue.
    pub fn begin_step(&self) {
        self.state.lock().unwrap().idle = false;
    }

    /// Called by the interpreter when an external event passed all filters
    /// and will be processed.
    pub fn note_external_event(&self) {
        self.state.lock().unwrap().external_events += 1;
    }

    /// Called by the interpreter when a macrostep is complete and the
    /// session is about to wait for the next external event.
    pub fn finish_step(&self) {
        let mut state = self.state.lock().unwrap();
        state.macrosteps += 1;
        state.idle = true;
        self.cond.notify_all();
    }

    /// Called once when the session ends.
    pub fn terminated(&self) {
        let mut state = self.state.lock().unwrap();
        state.macrosteps += 1;
        state.idle = true;
        state.terminated = true;
        self.cond.notify_all();
    }

    /// Waits until the session has consumed an external event and completed a
    /// macrostep after the given counters were taken, and is idle again
    /// (or terminated). Returns false on timeout.
    pub fn wait_quiescence(
        &self,
        since_steps: u64,
        since_events: u64,
        timeout: Duration,
    ) -> bool {
        let reached = |state: &StepState| -> bool {
            state.terminated
                || (state.idle
                    && state.macrosteps > since_steps
                    && state.external_events > since_events)
        };
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if reached(&state) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (s, timeout_result) = self.cond.wait_timeout(state, deadline - now).unwrap();
            state = s;
            if timeout_result.timed_out() && !reached(&state) {
                return false;
            }
        }
    }

    /// Waits until the session has ended. Returns false on timeout.
    pub fn wait_terminated(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        while !state.terminated {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (s, _t) = self.cond.wait_timeout(state, deadline - now).unwrap();
            state = s;
        }
        true
    }
}

/// Result of a host driven [ScxmlSession::process_event] call.
#[derive(Debug, Clone)]
pub struct ProcessResult {
    pub success: bool,
    /// Active atomic states before the event was processed.
    pub from_states: Vec<String>,
    /// Active atomic states after the triggered macrostep reached quiescence.
    pub to_states: Vec<String>,
    pub error: Option<String>,
}

/// *W3C says*:
/// ##Global variables
/// The following variables are global from the point of view of the algorithm.
/// Their values will be set in the procedure interpret().
/// #Actual Implementation
/// In the W3C algorithm the datamodel is simply a global variable.
/// As the datamodel needs access to other global variables and rust doesn't like
/// accessing data of parents from inside a member, most global data is moved to
/// this struct that is owned by the datamodel.
#[allow(non_snake_case)]
pub struct GlobalData {
    pub executor: Option<Box<FsmExecutor>>,
    pub configuration: OrderedSet<StateId>,
    pub statesToInvoke: OrderedSet<StateId>,
    pub historyValue: HashTable<StateId, OrderedSet<StateId>>,
    pub running: bool,

    internalQueue: Queue<Event>,

    pub externalQueue: BlockingQueue<Box<Event>>,

    /// Invoked Sessions. Key: InvokeId.
    pub child_sessions: HashMap<InvokeId, ScxmlSession>,

    /// Runtime invoke ids of the running invokes, keyed by the document id of
    /// their \<invoke\> element. Needed because ids may be generated at
    /// invocation time.
    pub active_invoke_ids: HashMap<DocumentId, InvokeId>,

    /// Set if this FSM was created as result of some invoke.
    pub caller_invoke_id: Option<InvokeId>,
    pub parent_session_id: Option<SessionId>,

    /// Unique Id of the owning session.
    pub session_id: SessionId,

    /// Will contain after execution the final configuration, if set before.
    pub final_configuration: Option<Vec<String>>,

    /// Initial data values handed over by the host or by \<invoke\>
    /// params/namelist. Overrides document values of the root datamodel.
    pub environment: DataStore,

    /// Custom actions, shared with the executor.
    pub actions: ActionWrapper,

    /// I/O processors by type name, session bound copies.
    pub io_processors: HashMap<String, Arc<Mutex<Box<dyn EventIOProcessor>>>>,

    /// State names by id, for host side queries.
    pub state_names: HashMap<StateId, Name>,

    /// Ids of atomic states, for host side leaf-state queries.
    pub atomic_states: HashSet<StateId>,

    pub step_monitor: Arc<StepMonitor>,

    /// Set if the session failed before the first macrostep (e.g. an
    /// unsupported datamodel).
    pub start_error: Option<String>,
}

impl Default for GlobalData {
    fn default() -> Self {
        GlobalData::new()
    }
}

impl GlobalData {
    pub fn new() -> GlobalData {
        GlobalData {
            executor: None,
            configuration: OrderedSet::new(),
            historyValue: HashTable::new(),
            running: false,
            statesToInvoke: OrderedSet::new(),
            internalQueue: Queue::new(),
            externalQueue: BlockingQueue::new(),
            child_sessions: HashMap::new(),
            active_invoke_ids: HashMap::new(),
            caller_invoke_id: None,
            parent_session_id: None,
            session_id: 0,
            final_configuration: None,
            environment: DataStore::new(),
            actions: ActionWrapper::new(),
            io_processors: HashMap::new(),
            state_names: HashMap::new(),
            atomic_states: HashSet::new(),
            step_monitor: Arc::new(StepMonitor::new()),
            start_error: None,
        }
    }

    /// Puts an event into the internal queue (the "raise" operation).
    /// Internal events take priority over external ones, see the main event loop.
    pub fn enqueue_internal(&mut self, event: Event) {
        self.internalQueue.enqueue(event);
        // In case the Fsm waits on the external queue, wake it up.
        self.externalQueue
            .enqueue(Box::new(Event::platform_internal_event_arrived()));
    }

    /// Puts an event into the external queue.
    pub fn enqueue_external(&mut self, event: Event) {
        self.externalQueue.enqueue(Box::new(event));
    }

    /// True if internal events are pending.
    pub fn has_queued_internal(&self) -> bool {
        !self.internalQueue.isEmpty()
    }
}

/// Represents some external session.
/// Holds thread-handle and channel-sender to the external queue of the session.
pub struct ScxmlSession {
    pub session_id: SessionId,
    pub session_thread: Option<JoinHandle<()>>,
    pub sender: Sender<Box<Event>>,
    /// global_data should only be accessed via short lived locks to avoid
    /// blocking the interpreter thread.
    pub global_data: GlobalDataAccess,
}

pub type GlobalDataAccess = crate::datamodel::GlobalDataArc;

impl ScxmlSession {
    pub fn new(
        id: SessionId,
        jh: JoinHandle<()>,
        sender: Sender<Box<Event>>,
        global_data: GlobalDataAccess,
    ) -> ScxmlSession {
        ScxmlSession {
            session_id: id,
            session_thread: Some(jh),
            sender,
            global_data,
        }
    }

    pub fn new_without_join_handle(id: SessionId, sender: Sender<Box<Event>>) -> ScxmlSession {
        ScxmlSession {
            session_id: id,
            session_thread: None,
            sender,
            global_data: GlobalDataAccess::new(),
        }
    }

    /// Enqueues an external event, fire-and-forget.
    pub fn send_event(&self, event: Event) -> Result<(), SendError<Box<Event>>> {
        self.sender.send(Box::new(event))
    }

    /// Enqueues an external event and waits until the triggered macrostep has
    /// run to quiescence (or the session terminated).
    pub fn process_event(&self, event: Event, timeout_ms: u64) -> ProcessResult {
        let monitor = self.global_data.lock().step_monitor.clone();
        let from_states = self.active_states();
        let (since_steps, since_events) = monitor.counters();
        if let Err(e) = self.send_event(event) {
            return ProcessResult {
                success: false,
                from_states,
                to_states: Vec::new(),
                error: Some(e.to_string()),
            };
        }
        let success =
            monitor.wait_quiescence(since_steps, since_events, Duration::from_millis(timeout_ms));
        ProcessResult {
            success,
            from_states,
            to_states: self.active_states(),
            error: if success {
                None
            } else {
                Some("timeout waiting for macrostep".to_string())
            },
        }
    }

    /// The names of all states in the current configuration.
    pub fn configuration_names(&self) -> Vec<String> {
        let global = self.global_data.lock();
        let mut names = Vec::with_capacity(global.configuration.size());
        for sid in global.configuration.iterator() {
            if let Some(name) = global.state_names.get(sid) {
                names.push(name.clone());
            }
        }
        names
    }

    /// The names of the active atomic states.
    pub fn active_states(&self) -> Vec<String> {
        let global = self.global_data.lock();
        let mut names = Vec::new();
        for sid in global.configuration.iterator() {
            if global.atomic_states.contains(sid) {
                if let Some(name) = global.state_names.get(sid) {
                    names.push(name.clone());
                }
            }
        }
        names
    }

    /// The first active atomic state, in configuration order.
    pub fn current_state(&self) -> Option<String> {
        self.active_states().into_iter().next()
    }

    pub fn is_state_active(&self, name: &str) -> bool {
        let global = self.global_data.lock();
        for sid in global.configuration.iterator() {
            if let Some(n) = global.state_names.get(sid) {
                if n == name {
                    return true;
                }
            }
        }
        false
    }

    pub fn is_running(&self) -> bool {
        let global = self.global_data.lock();
        global.running && global.start_error.is_none()
    }

    pub fn start_error(&self) -> Option<String> {
        self.global_data.lock().start_error.clone()
    }

    /// Requests shutdown: the current microstep completes, then the session
    /// exits all states and releases its resources.
    pub fn stop(&mut self) {
        let _ = self.send_event(Event::new_simple(EVENT_CANCEL_SESSION));
        self.join();
    }

    /// Waits for the interpreter thread, if this instance owns the handle.
    pub fn join(&mut self) {
        if let Some(thread) = self.session_thread.take() {
            let _ = thread.join();
        }
    }

    /// Waits until the session has terminated. Returns false on timeout.
    pub fn wait_until_terminated(&self, timeout_ms: u64) -> bool {
        let monitor = self.global_data.lock().step_monitor.clone();
        monitor.wait_terminated(Duration::from_millis(timeout_ms))
    }
}

impl Clone for ScxmlSession {
    fn clone(&self) -> Self {
        ScxmlSession {
            session_id: self.session_id,
            session_thread: None,
            sender: self.sender.clone(),
            global_data: self.global_data.clone(),
        }
    }

    fn clone_from(&mut self, source: &Self) {
        self.session_id = source.session_id;
        self.session_thread = None;
        self.sender = source.sender.clone();
        self.global_data = source.global_data.clone();
    }
}

/// The FSM implementation, according to W3C proposal.
#[allow(non_snake_case)]
pub struct Fsm {
    pub datamodel: String,
    pub binding: BindingType,
    pub version: String,
    pub statesNames: StateNameMap,
    pub executableContent: HashMap<ExecutableContentId, Vec<Box<dyn ExecutableContent>>>,

    /// The "name" attribute of the \<scxml\> element, bound to "_name".
    pub name: String,

    /// An FSM can have actual multiple initial-target-states, so this state may be artificial.
    /// The model builder has to generate a parent state if needed.
    /// This state also serves as the "scxml" element.
    pub pseudo_root: StateId,

    /// The only real storage of states, identified by the Id - the zero based index + 1
    /// into the vector.
    /// If a state has no declared id, one is generated.
    pub states: Vec<State>,
    pub transitions: TransitionMap,

    pub script: ExecutableContentId,

    /// Set if this FSM was created as result of some invoke.
    /// See also Global.caller_invoke_id
    pub caller_invoke_id: Option<InvokeId>,
    pub parent_session_id: Option<SessionId>,

    pub generate_id_count: u32,
}

impl Debug for Fsm {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Fsm{{v:{} root:{} states:",
            self.version, self.pseudo_root
        )?;
        display_state_map(&self.states, f)?;
        display_transition_map(&self.transitions, f)?;
        write!(f, "}}")
    }
}

fn display_state_map(sm: &StateVec, f: &mut Formatter<'_>) -> fmt::Result {
    write!(f, "{{")?;
    let mut first = true;
    for e in sm {
        if first {
            first = false;
        } else {
            write!(f, ",")?;
        }
        write!(f, "{}", *e)?;
    }
    write!(f, "}}")
}

fn display_transition_map(sm: &TransitionMap, f: &mut Formatter<'_>) -> fmt::Result {
    write!(f, "{{")?;
    let mut first = true;
    for e in sm {
        if first {
            first = false;
        } else {
            write!(f, ",")?;
        }
        write!(f, "{}", *e.1)?;
    }
    write!(f, "}}")
}

impl Default for Fsm {
    fn default() -> Self {
        Fsm::new()
    }
}

impl Fsm {
    pub fn new() -> Fsm {
        Fsm {
            datamodel: crate::datamodel::NULL_DATAMODEL.to_string(),
            states: Vec::new(),
            transitions: HashMap::new(),
            pseudo_root: 0,
            caller_invoke_id: None,
            parent_session_id: None,
            name: "".to_string(),
            script: 0,
            version: "1.0".to_string(),
            binding: BindingType::Early,
            statesNames: StateNameMap::new(),
            executableContent: HashMap::new(),
            generate_id_count: 0,
        }
    }

    pub fn send_to_session(
        &self,
        datamodel: &mut dyn Datamodel,
        session_id: SessionId,
        event: Event,
    ) -> Result<(), SendError<Box<Event>>> {
        let executor = match &get_global!(datamodel).executor {
            None => None,
            Some(executor) => Some((**executor).clone()),
        };
        match executor {
            None => {
                error!("Send: Executor not available");
                Err(SendError(Box::new(event)))
            }
            Some(executor) => executor.send_to_session(session_id, event),
        }
    }

    pub fn get_state_by_name(&self, name: &Name) -> &State {
        self.get_state_by_id(*self.statesNames.get(name).unwrap())
    }

    pub fn get_state_by_name_mut(&mut self, name: &Name) -> &mut State {
        self.get_state_by_id_mut(*self.statesNames.get(name).unwrap())
    }

    /// Gets a state by id.
    /// The id MUST exist.
    pub fn get_state_by_id(&self, state_id: StateId) -> &State {
        self.states.get((state_id - 1) as usize).unwrap()
    }

    /// Gets a mutable state by id.
    /// The id MUST exist.
    pub fn get_state_by_id_mut(&mut self, state_id: StateId) -> &mut State {
        self.states.get_mut((state_id - 1) as usize).unwrap()
    }

    pub fn get_transition_by_id_mut(&mut self, transition_id: TransitionId) -> &mut Transition {
        self.transitions.get_mut(&transition_id).unwrap()
    }

    pub fn get_transition_by_id(&self, transition_id: TransitionId) -> &Transition {
        self.transitions.get(&transition_id).unwrap()
    }

    fn state_document_order(&self, sid1: &StateId, sid2: &StateId) -> std::cmp::Ordering {
        let s1 = self.get_state_by_id(*sid1);
        let s2 = self.get_state_by_id(*sid2);
        s1.doc_id.cmp(&s2.doc_id)
    }

    fn state_entry_order(&self, s1: &StateId, s2: &StateId) -> std::cmp::Ordering {
        // Same as Document order
        self.state_document_order(s1, s2)
    }

    fn state_exit_order(&self, s1: &StateId, s2: &StateId) -> std::cmp::Ordering {
        // Reverse Document order
        self.state_document_order(s2, s1)
    }

    fn transition_document_order(&self, t1: &&Transition, t2: &&Transition) -> std::cmp::Ordering {
        t1.doc_id.cmp(&t2.doc_id)
    }

    fn invoke_document_order(s1: &Invoke, s2: &Invoke) -> std::cmp::Ordering {
        s1.doc_id.cmp(&s2.doc_id)
    }

    /// *W3C says*:
    /// The purpose of this procedure is to initialize the interpreter and to start processing.
    ///
    /// In order to interpret an SCXML document, first (optionally) perform
    /// xinclude processing and (optionally) validate
    /// the document, throwing an exception if validation fails.
    /// Then convert initial attributes to \<initial\> container children with transitions
    /// to the state specified by the attribute. (This step is done purely to simplify the statement of
    /// the algorithm and has no effect on the system's behavior.
    ///
    /// Such transitions will not contain any executable content).
    /// Initialize the global data structures, including the data model.
    /// If binding is set to 'early', initialize the data model.
    /// Then execute the global \<script\> element, if any.
    /// Finally, call enterStates on the initial configuration, set the global running
    /// variable to true and start the interpreter's event loop.
    /// ```ignore
    /// procedure interpret(doc):
    ///     if not valid(doc): failWithError()
    ///     expandScxmlSource(doc)
    ///     configuration = new OrderedSet()
    ///     statesToInvoke = new OrderedSet()
    ///     internalQueue = new Queue()
    ///     externalQueue = new BlockingQueue()
    ///     historyValue = new HashTable()
    ///     datamodel = new Datamodel(doc)
    ///     if doc.binding == "early":
    ///         initializeDatamodel(datamodel, doc)
    ///     running = true
    ///     executeGlobalScriptElement(doc)
    ///     enterStates([doc.initial.transition])
    ///     mainEventLoop()
    /// ```
    pub fn interpret(&mut self, datamodel: &mut dyn Datamodel) {
        if !self.valid() {
            self.failWithError(datamodel);
            return;
        }
        self.expandScxmlSource();
        {
            let mut gd = get_global!(datamodel);
            gd.internalQueue.clear();
            gd.historyValue.clear();
            gd.running = true;
        }
        datamodel.add_functions(self);
        self.initializeDataModels(datamodel);
        self.executeGlobalScriptElement(datamodel);

        let mut initial_states = List::new();
        let itid = self.get_state_by_id(self.pseudo_root).initial;
        if itid != 0 {
            initial_states.push(itid);
        }
        self.enterStates(datamodel, &initial_states);
        self.mainEventLoop(datamodel);
    }

    /// Initializes the data models of all states according to the binding mode.\
    /// W3C: with "early" binding all data elements are evaluated when the document
    /// is loaded. With "late" binding the variables are created at load time but
    /// values are only assigned when the containing state is entered the first time.
    /// The top-level data is assigned in both modes.
    #[allow(non_snake_case)]
    fn initializeDataModels(&mut self, datamodel: &mut dyn Datamodel) {
        let binding = self.binding;
        let root = self.pseudo_root;
        let ids: Vec<StateId> = self.states.iter().map(|s| s.id).collect();
        for sid in ids {
            let set_data = binding == BindingType::Early || sid == root;
            datamodel.initializeDataModel(self, sid, set_data);
            if set_data {
                self.get_state_by_id_mut(sid).isFirstEntry = false;
            }
        }
    }

    /// #Actual implementation:
    /// Checks if all state references are declared (all states have a document-id).
    fn valid(&self) -> bool {
        for state in &self.states {
            if state.doc_id == 0 {
                error!("Referenced state '{}' is not declared", state.name);
                return false;
            }
        }
        true
    }

    #[allow(non_snake_case)]
    fn failWithError(&self, datamodel: &mut dyn Datamodel) {
        error!("FSM has failed");
        let mut global = get_global!(datamodel);
        let _ = global.start_error.insert("FSM model is invalid".to_string());
        global.running = false;
    }

    /// #Actual implementation:
    /// The model builder has already resolved all references,
    /// nothing left to expand here.
    #[allow(non_snake_case)]
    fn expandScxmlSource(&mut self) {}

    #[allow(non_snake_case)]
    fn executeGlobalScriptElement(&mut self, datamodel: &mut dyn Datamodel) {
        if self.script != 0 {
            datamodel.executeContent(self, self.script);
        }
    }

    /// *W3C says*:
    /// ## procedure mainEventLoop()
    /// This loop runs until we enter a top-level final state or an external entity cancels processing.
    /// In either case 'running' will be set to false (see EnterStates, below, for termination by
    /// entering a top-level final state.)
    ///
    /// At the top of the loop, we have either just entered the state machine, or we have just
    /// processed an external event. Each iteration through the loop consists of four main steps:
    /// 1) Complete the macrostep by repeatedly taking any internally enabled transitions, namely
    /// those that don't require an event or that are triggered by an internal event.
    /// After each such transition/microstep, check to see if we have reached a final state.
    /// 2) When there are no more internally enabled transitions available, the macrostep is done.
    /// Execute any \<invoke\> tags for states that we entered on the last iteration through the loop
    /// 3) If any internal events have been generated by the invokes, repeat step 1 to handle any
    /// errors raised by the \<invoke\> elements.
    /// 4) When the internal event queue is empty, wait for
    /// an external event and then execute any transitions that it triggers. However special
    /// preliminary processing is applied to the event if the state has executed any \<invoke\>
    /// elements. First, if this event was generated by an invoked process, apply \<finalize\>
    /// processing to it. Secondly, if any \<invoke\> elements have autoforwarding set, forward the
    /// event to them. These steps apply before the transitions are taken.
    ///
    /// This event loop thus enforces run-to-completion semantics, in which the system process an
    /// external event and then takes all the 'follow-up' transitions that the processing has enabled
    /// before looking for another external event.
    /// ```ignore
    /// procedure mainEventLoop():
    ///     while running:
    ///         enabledTransitions = null
    ///         macrostepDone = false
    ///         # Here we handle eventless transitions and transitions
    ///         # triggered by internal events until macrostep is complete
    ///         while running and not macrostepDone:
    ///             enabledTransitions = selectEventlessTransitions()
    ///             if enabledTransitions.isEmpty():
    ///                 if internalQueue.isEmpty():
    ///                     macrostepDone = true
    ///                 else:
    ///                     internalEvent = internalQueue.dequeue()
    ///                     datamodel["_event"] = internalEvent
    ///                     enabledTransitions = selectTransitions(internalEvent)
    ///             if not enabledTransitions.isEmpty():
    ///                 microstep(enabledTransitions.toList())
    ///         # either we're in a final state, and we break out; of the loop
    ///         if not running:
    ///             break
    ///         # or; we've completed a macrostep, so we start a new macrostep by waiting for an external event
    ///         # Here we invoke whatever needs to be invoked. The implementation of 'invoke' is platform-specific
    ///         for state in statesToInvoke.sort(entryOrder):
    ///             for inv in state.invoke.sort(documentOrder):
    ///                 invoke(inv)
    ///         statesToInvoke.clear()
    ///         # Invoking may have raised internal error events and we iterate to handle them
    ///         if not internalQueue.isEmpty():
    ///             continue;
    ///         # A blocking wait for an external event.  Alternatively, if we have been invoked
    ///         # our parent session also might cancel us.  The mechanism for this is platform specific,
    ///         # but here we assume it’s a special event we receive
    ///         externalEvent = externalQueue.dequeue()
    ///         if isCancelEvent(externalEvent):
    ///             running = false
    ///             continue;
    ///         datamodel["_event"] = externalEvent
    ///         for state in configuration:
    ///             for inv in state.invoke:
    ///                 if inv.invokeid == externalEvent.invokeid:
    ///                     applyFinalize(inv, externalEvent)
    ///                 if inv.autoforward:
    ///                     send(inv.id, externalEvent)
    ///         enabledTransitions = selectTransitions(externalEvent)
    ///         if not enabledTransitions.isEmpty():
    ///             microstep(enabledTransitions.toList())
    ///     # End of outer while running loop.  If we get here, we have reached a top-level final state or have been cancelled
    ///     exitInterpreter()
    /// ```
    #[allow(non_snake_case)]
    fn mainEventLoop(&mut self, datamodel: &mut dyn Datamodel) {
        let monitor = get_global!(datamodel).step_monitor.clone();
        while get_global!(datamodel).running {
            let mut enabledTransitions;
            let mut macrostepDone = false;
            // Here we handle eventless transitions and transitions
            // triggered by internal events until macrostep is complete
            while get_global!(datamodel).running && !macrostepDone {
                enabledTransitions = self.selectEventlessTransitions(datamodel);
                if enabledTransitions.isEmpty() {
                    if get_global!(datamodel).internalQueue.isEmpty() {
                        macrostepDone = true;
                    } else {
                        let internalEvent = { get_global!(datamodel).internalQueue.dequeue() };
                        datamodel.set_event(&internalEvent);
                        enabledTransitions = self.selectTransitions(datamodel, &internalEvent);
                    }
                }
                if !enabledTransitions.isEmpty() {
                    self.microstep(datamodel, &enabledTransitions.toList())
                }
            }
            // either we're in a final state, and we break out of the loop
            if !get_global!(datamodel).running {
                break;
            }
            // or we've completed a macrostep, so we start a new macrostep by waiting for an external event
            // Here we invoke whatever needs to be invoked.
            let sortedStatesToInvoke = get_global!(datamodel)
                .statesToInvoke
                .sort(&|s1, s2| self.state_entry_order(s1, s2));
            for sid in sortedStatesToInvoke.iterator() {
                let invokes = self
                    .get_state_by_id(*sid)
                    .invoke
                    .sort(&Fsm::invoke_document_order);
                for inv in invokes.iterator() {
                    self.invoke(datamodel, inv);
                }
            }

            let externalEvent;
            {
                let externalQueue_receiver = {
                    let mut global_lock = get_global!(datamodel);
                    global_lock.statesToInvoke.clear();
                    // Invoking may have raised internal error events and we iterate to handle them
                    if !global_lock.internalQueue.isEmpty() {
                        continue;
                    }
                    global_lock.externalQueue.receiver.clone()
                };

                // A blocking wait for an external event. Alternatively, if we have been invoked
                // our parent session also might cancel us. The mechanism for this is platform
                // specific, but here we assume it's a special event we receive.
                monitor.finish_step();
                let received = externalQueue_receiver.lock().unwrap().recv();
                monitor.begin_step();
                externalEvent = match received {
                    Ok(event) => event,
                    Err(_) => {
                        // All senders are gone, handled like a cancel.
                        get_global!(datamodel).running = false;
                        continue;
                    }
                };
                if self.isCancelEvent(&externalEvent) {
                    get_global!(datamodel).running = false;
                    continue;
                }
                if externalEvent.name.eq(INTERNAL_EVENT_ARRIVED) {
                    // Some internal event arrived
                    continue;
                }
                // Events of already cancelled invokes are dropped silently.
                if let Some(ref invoke_id) = externalEvent.invoke_id {
                    let cancelled = match &get_global!(datamodel).executor {
                        Some(executor) => executor.is_invoke_cancelled(invoke_id),
                        None => false,
                    };
                    if cancelled {
                        debug!("Drop event '{}' of cancelled invoke '{}'", externalEvent, invoke_id);
                        continue;
                    }
                }
                monitor.note_external_event();
            }
            let mut toFinalize: Vec<ExecutableContentId> = Vec::new();
            let mut toForward: Vec<InvokeId> = Vec::new();
            {
                let invokeId = match externalEvent.invoke_id {
                    None => "".to_string(),
                    Some(ref id) => id.clone(),
                };
                let global = get_global!(datamodel);
                for sid in global.configuration.iterator() {
                    let state = self.get_state_by_id(*sid);
                    for inv in state.invoke.iterator() {
                        let runtime_id = global.active_invoke_ids.get(&inv.doc_id);
                        if inv.finalize != 0 && runtime_id.map_or(false, |id| *id == invokeId) {
                            toFinalize.push(inv.finalize);
                        }
                        if inv.autoforward {
                            if let Some(id) = runtime_id {
                                toForward.push(id.clone());
                            }
                        }
                    }
                }
            }
            datamodel.set_event(&externalEvent);
            for finalizeContentId in toFinalize {
                // applyFinalize
                self.executeContent(datamodel, finalizeContentId);
            }
            for invokeId in toForward {
                // W3C: When the 'autoforward' attribute is set to true, the SCXML Processor must
                // send an exact copy of every external event it receives to the invoked process.
                // All the fields specified in 5.10.1 The Internal Structure of Events must have
                // the same values in the forwarded copy of the event.
                let sender = get_global!(datamodel)
                    .child_sessions
                    .get(&invokeId)
                    .map(|session| session.sender.clone());
                match sender {
                    None => {
                        debug!("Autoforward: invoke '{}' is gone", invokeId);
                    }
                    Some(sender) => {
                        if sender.send(externalEvent.clone()).is_err() {
                            debug!("Autoforward to '{}' failed", invokeId);
                        }
                    }
                }
            }

            enabledTransitions = self.selectTransitions(datamodel, &externalEvent);
            if !enabledTransitions.isEmpty() {
                self.microstep(datamodel, &enabledTransitions.toList());
            }
        }
        // End of outer while running loop. If we get here, we have reached a top-level final
        // state or have been cancelled
        self.exitInterpreter(datamodel);
    }

    /// *W3C says*:
    /// # procedure exitInterpreter()
    /// The purpose of this procedure is to exit the current SCXML process by exiting all active
    /// states. If the machine is in a top-level final state, a Done event is generated.
    /// (Note that in this case, the final state will be the only active state.)
    /// The implementation of returnDoneEvent is platform-dependent, but if this session is the
    /// result of an \<invoke\> in another SCXML session, returnDoneEvent will cause the event
    /// done.invoke.\<id\> to be placed in the external event queue of that session, where \<id\> is
    /// the id generated in that session when the \<invoke\> was executed.
    /// ```ignore
    /// procedure exitInterpreter():
    ///     statesToExit = configuration.toList().sort(exitOrder)
    ///     for s in statesToExit:
    ///         for content in s.onexit.sort(documentOrder):
    ///             executeContent(content)
    ///         for inv in s.invoke:
    ///             cancelInvoke(inv)
    ///         configuration.delete(s)
    ///         if isFinalState(s) and isScxmlElement(s.parent):
    ///             returnDoneEvent(s.donedata)
    /// ```
    #[allow(non_snake_case)]
    fn exitInterpreter(&mut self, datamodel: &mut dyn Datamodel) {
        let statesToExit;
        {
            let mut global = get_global!(datamodel);
            if global.final_configuration.is_some() {
                let mut fc = Vec::new();
                for sid in global.configuration.iterator() {
                    fc.push(self.get_state_by_id(*sid).name.clone());
                }
                let _ = global.final_configuration.insert(fc);
            }
            statesToExit = global
                .configuration
                .toList()
                .sort(&|s1, s2| self.state_exit_order(s1, s2));
        }
        for sid in statesToExit.iterator() {
            let mut content: Vec<ExecutableContentId> = Vec::new();
            let mut invoke_docs: Vec<DocumentId> = Vec::new();
            {
                let s = self.get_state_by_id(*sid);
                if s.onexit != 0 {
                    content.push(s.onexit);
                }
                for inv in s.invoke.iterator() {
                    invoke_docs.push(inv.doc_id);
                }
            }
            for ct in content {
                self.executeContent(datamodel, ct);
            }
            for invoke_doc in invoke_docs {
                self.cancelInvoke(datamodel, invoke_doc);
            }

            get_global!(datamodel).configuration.delete(sid);
            {
                let s = self.get_state_by_id(*sid);
                if self.isFinalState(s) && self.isSCXMLElement(s.parent) {
                    self.returnDoneEvent(&s.donedata.clone(), datamodel);
                }
            }
        }
        get_global!(datamodel).running = false;
    }

    /// *W3C says*:
    /// The implementation of returnDoneEvent is platform-dependent, but if this session is the
    /// result of an \<invoke\> in another SCXML session, returnDoneEvent will cause the event
    /// done.invoke.\<id\> to be placed in the external event queue of that session, where \<id\> is
    /// the id generated in that session when the \<invoke\> was executed.
    #[allow(non_snake_case)]
    fn returnDoneEvent(&mut self, done_data: &Option<DoneData>, datamodel: &mut dyn Datamodel) {
        let caller_invoke_id;
        let parent_session_id;
        {
            let global = get_global!(datamodel);
            caller_invoke_id = global.caller_invoke_id.clone();
            parent_session_id = global.parent_session_id;
        }
        match parent_session_id {
            None => {
                // No parent session, nothing to return.
            }
            Some(session_id) => {
                match caller_invoke_id {
                    None => {
                        error!("Caller-Invoke-Id not available but Parent-Session-Id is set.");
                    }
                    Some(invoke_id) => {
                        let (param_values, content) =
                            self.evaluate_done_data(datamodel, done_data);
                        let mut event = Event::new(
                            EVENT_DONE_INVOKE_PREFIX,
                            &invoke_id,
                            param_values,
                            content,
                        );
                        event.invoke_id = Some(invoke_id);
                        if let Err(_e) =
                            self.send_to_session(datamodel, session_id, event)
                        {
                            debug!("Failed to send 'done.invoke' to parent session.");
                        }
                    }
                }
            }
        }
    }

    /// Evaluates the \<donedata\> of a final state.
    fn evaluate_done_data(
        &mut self,
        datamodel: &mut dyn Datamodel,
        done_data: &Option<DoneData>,
    ) -> (Option<Vec<ParamPair>>, Option<Data>) {
        match done_data {
            None => (None, None),
            Some(dd) => {
                let mut values = Vec::new();
                datamodel.evaluate_params(&dd.params, &mut values, &None);
                let content = datamodel.evaluate_content(&dd.content);
                let param_values = if values.is_empty() { None } else { Some(values) };
                (param_values, content)
            }
        }
    }

    /// *W3C says*:
    /// # function selectEventlessTransitions()
    /// This function selects all transitions that are enabled in the current configuration that
    /// do not require an event trigger. First find a transition with no 'event' attribute whose
    /// condition evaluates to true. If multiple matching transitions are present, take the first
    /// in document order. If none are present, search in the state's ancestors in ancestry order
    /// until one is found. As soon as such a transition is found, add it to enabledTransitions,
    /// and proceed to the next atomic state in the configuration. If no such transition is found
    /// in the state or its ancestors, proceed to the next state in the configuration.
    /// When all atomic states have been visited and transitions selected, filter the set of enabled
    /// transitions, removing any that are preempted by other transitions, then return the
    /// resulting set.
    /// ```ignore
    /// function selectEventlessTransitions():
    ///     enabledTransitions = new OrderedSet()
    ///     atomicStates = configuration.toList().filter(isAtomicState).sort(documentOrder)
    ///     for state in atomicStates:
    ///         loop: for s in [state].append(getProperAncestors(state, null)):
    ///             for t in s.transition.sort(documentOrder):
    ///                 if not t.event and conditionMatch(t):
    ///                     enabledTransitions.add(t)
    ///                     break loop;
    ///     enabledTransitions = removeConflictingTransitions(enabledTransitions)
    ///     return enabledTransitions;
    /// ```
    #[allow(non_snake_case)]
    fn selectEventlessTransitions(
        &mut self,
        datamodel: &mut dyn Datamodel,
    ) -> OrderedSet<TransitionId> {
        let mut enabledTransitions: OrderedSet<TransitionId> = OrderedSet::new();
        let atomicStates = get_global!(datamodel)
            .configuration
            .toList()
            .filter_by(&|sid| -> bool { self.isAtomicStateId(sid) })
            .sort(&|s1, s2| self.state_document_order(s1, s2));
        for sid in atomicStates.iterator() {
            let mut states: List<StateId> = List::new();
            states.push(*sid);
            states.push_set(&self.getProperAncestors(*sid, 0));
            let mut condT = Vec::new();
            for s in states.iterator() {
                let state = self.get_state_by_id(*s);
                for t in self
                    .to_transition_list(&state.transitions)
                    .sort(&|t1: &&Transition, t2: &&Transition| {
                        self.transition_document_order(t1, t2)
                    })
                    .iterator()
                {
                    if t.events.is_empty() && !t.wildcard {
                        condT.push(t.id);
                    }
                }
            }
            for ct in condT {
                if self.conditionMatch(datamodel, ct) {
                    enabledTransitions.add(ct);
                    break;
                }
            }
        }
        self.removeConflictingTransitions(datamodel, &enabledTransitions)
    }

    /// *W3C says*:
    /// # function selectTransitions(event)
    /// The purpose of the selectTransitions() procedure is to collect the transitions that are
    /// enabled by this event in the current configuration.
    ///
    /// Create an empty set of enabledTransitions. For each atomic state, find a transition whose
    /// 'event' attribute matches event and whose condition evaluates to true. If multiple matching
    /// transitions are present, take the first in document order. If none are present, search in
    /// the state's ancestors in ancestry order until one is found. As soon as such a transition is
    /// found, add it to enabledTransitions, and proceed to the next atomic state in the
    /// configuration. If no such transition is found in the state or its ancestors, proceed to the
    /// next state in the configuration. When all atomic states have been visited and transitions
    /// selected, filter out any preempted transitions and return the resulting set.
    /// ```ignore
    /// function selectTransitions(event):
    ///     enabledTransitions = new OrderedSet()
    ///     atomicStates = configuration.toList().filter(isAtomicState).sort(documentOrder)
    ///     for state in atomicStates:
    ///         loop: for s in [state].append(getProperAncestors(state, null)):
    ///             for t in s.transition.sort(documentOrder):
    ///                 if t.event and nameMatch(t.event, event.name) and conditionMatch(t):
    ///                     enabledTransitions.add(t)
    ///                     break loop;
    ///     enabledTransitions = removeConflictingTransitions(enabledTransitions)
    ///     return enabledTransitions;
    /// ```
    #[allow(non_snake_case)]
    fn selectTransitions(
        &mut self,
        datamodel: &mut dyn Datamodel,
        event: &Event,
    ) -> OrderedSet<TransitionId> {
        let mut enabledTransitions: OrderedSet<TransitionId> = OrderedSet::new();
        let atomicStates = get_global!(datamodel)
            .configuration
            .toList()
            .filter_by(&|sid| -> bool { self.isAtomicStateId(sid) })
            .sort(&|s1, s2| self.state_document_order(s1, s2));
        for state in atomicStates.iterator() {
            let mut condT = Vec::new();
            for sid in List::from_array(&[*state])
                .append_set(&self.getProperAncestors(*state, 0))
                .iterator()
            {
                let s = self.get_state_by_id(*sid);
                let mut transition: Vec<&Transition> = Vec::new();
                for tid in s.transitions.iterator() {
                    transition.push(self.get_transition_by_id(*tid));
                }
                transition.sort_by(|t1: &&Transition, t2: &&Transition| {
                    self.transition_document_order(t1, t2)
                });
                for t in transition {
                    if (t.wildcard || !t.events.is_empty()) && t.nameMatch(&event.name) {
                        condT.push(t.id);
                    }
                }
            }
            for ct in condT {
                if self.conditionMatch(datamodel, ct) {
                    enabledTransitions.add(ct);
                    break;
                }
            }
        }
        self.removeConflictingTransitions(datamodel, &enabledTransitions)
    }

    /// *W3C says*:
    /// # function removeConflictingTransitions(enabledTransitions)
    /// enabledTransitions will contain multiple transitions only if a parallel state is active.
    /// In that case, we may have one transition selected for each of its children.
    /// These transitions may conflict with each other in the sense that they have incompatible
    /// target states. Loosely speaking, transitions are compatible when each one is contained
    /// within a single \<state\> child of the \<parallel\> element.
    /// Transitions that aren't contained within a single child force the state
    /// machine to leave the \<parallel\> ancestor (even if they reenter it later). Such transitions
    /// conflict with each other, and with transitions that remain within a single \<state\> child,
    /// in that they may have targets that cannot be simultaneously active. The test that transitions
    /// have non-intersecting exit sets captures this requirement. (If the intersection is null, the
    /// source and targets of the two transitions are contained in separate \<state\> descendants of
    /// \<parallel\>. If intersection is non-null, then at least one of the transitions is exiting
    /// the \<parallel\>). When such a conflict occurs, then if the source state of one of the
    /// transitions is a descendant of the source state of the other, we select the transition in
    /// the descendant. Otherwise we prefer the transition that was selected by the earlier state
    /// in document order and discard the other transition. Note that targetless transitions have
    /// empty exit sets and thus do not conflict with any other transitions.
    /// ```ignore
    /// function removeConflictingTransitions(enabledTransitions):
    ///     filteredTransitions = new OrderedSet()
    ///     //toList sorts the transitions in the order of the states that selected them
    ///     for t1 in enabledTransitions.toList():
    ///         t1Preempted = false
    ///         transitionsToRemove = new OrderedSet()
    ///         for t2 in filteredTransitions.toList():
    ///             if computeExitSet([t1]).hasIntersection(computeExitSet([t2])):
    ///                 if isDescendant(t1.source, t2.source):
    ///                     transitionsToRemove.add(t2)
    ///                 else:
    ///                     t1Preempted = true
    ///                     break
    ///         if not t1Preempted:
    ///             for t3 in transitionsToRemove.toList():
    ///                 filteredTransitions.delete(t3)
    ///             filteredTransitions.add(t1)
    ///     return filteredTransitions;
    /// ```
    #[allow(non_snake_case)]
    fn removeConflictingTransitions(
        &self,
        datamodel: &mut dyn Datamodel,
        enabledTransitions: &OrderedSet<TransitionId>,
    ) -> OrderedSet<TransitionId> {
        let mut filteredTransitions: OrderedSet<TransitionId> = OrderedSet::new();
        //toList sorts the transitions in the order of the states that selected them
        for tid1 in enabledTransitions.toList().iterator() {
            let t1 = self.get_transition_by_id(*tid1);
            let mut t1Preempted = false;
            let mut transitionsToRemove = OrderedSet::new();
            let filteredTransitionList = filteredTransitions.toList();
            for tid2 in filteredTransitionList.iterator() {
                if self
                    .computeExitSet(datamodel, &List::from_array(&[*tid1]))
                    .hasIntersection(&self.computeExitSet(datamodel, &List::from_array(&[*tid2])))
                {
                    let t2 = self.get_transition_by_id(*tid2);
                    if self.isDescendant(t1.source, t2.source) {
                        transitionsToRemove.add(tid2);
                    } else {
                        t1Preempted = true;
                        break;
                    }
                }
            }
            if !t1Preempted {
                for t3 in transitionsToRemove.toList().iterator() {
                    filteredTransitions.delete(t3);
                }
                filteredTransitions.add(*tid1);
            }
        }
        filteredTransitions
    }

    /// *W3C says*:
    /// # procedure microstep(enabledTransitions)
    /// The purpose of the microstep procedure is to process a single set of transitions. These may
    /// have been enabled by an external event, an internal event, or by the presence or absence of
    /// certain values in the data model at the current point in time. The processing of the enabled
    /// transitions must be done in parallel ('lock step') in the sense that their source states must
    /// first be exited, then their actions must be executed, and finally their target states entered.
    /// ```ignore
    /// procedure microstep(enabledTransitions):
    ///     exitStates(enabledTransitions)
    ///     executeTransitionContent(enabledTransitions)
    ///     enterStates(enabledTransitions)
    /// ```
    #[allow(non_snake_case)]
    fn microstep(&mut self, datamodel: &mut dyn Datamodel, enabledTransitions: &List<TransitionId>) {
        self.exitStates(datamodel, enabledTransitions);
        self.executeTransitionContent(datamodel, enabledTransitions);
        self.enterStates(datamodel, enabledTransitions);
    }

    /// *W3C says*:
    /// # procedure exitStates(enabledTransitions)
    /// Compute the set of states to exit. Then remove all the states on statesToExit from the set
    /// of states that will have invoke processing done at the start of the next macrostep.
    /// (Suppose macrostep M1 consists of microsteps m11 and m12. We may enter state s in m11 and
    /// exit it in m12. We will add s to statesToInvoke in m11, and must remove it in m12. In the
    /// subsequent macrostep M2, we will apply invoke processing to all states that were entered,
    /// and not exited, in M1.) Then convert statesToExit to a list and sort it in exitOrder.
    ///
    /// For each state s in the list, if s has a deep history state h, set the history value of h
    /// to be the list of all atomic descendants of s that are members in the current configuration,
    /// else set its value to be the list of all immediate children of s that are members of the
    /// current configuration. Again for each state s in the list, first execute any onexit handlers,
    /// then cancel any ongoing invocations, and finally remove s from the current configuration.
    /// ```ignore
    /// procedure exitStates(enabledTransitions):
    ///     statesToExit = computeExitSet(enabledTransitions)
    ///     for s in statesToExit:
    ///         statesToInvoke.delete(s)
    ///     statesToExit = statesToExit.toList().sort(exitOrder)
    ///     for s in statesToExit:
    ///         for h in s.history:
    ///             if h.type == "deep":
    ///                 f = lambda s0: isAtomicState(s0) and isDescendant(s0,s)
    ///             else:
    ///                 f = lambda s0: s0.parent == s
    ///             historyValue[h.id] = configuration.toList().filter(f)
    ///     for s in statesToExit:
    ///         for content in s.onexit.sort(documentOrder):
    ///             executeContent(content)
    ///         for inv in s.invoke:
    ///             cancelInvoke(inv)
    ///         configuration.delete(s)
    /// ```
    #[allow(non_snake_case)]
    fn exitStates(&mut self, datamodel: &mut dyn Datamodel, enabledTransitions: &List<TransitionId>) {
        let statesToExit = self.computeExitSet(datamodel, enabledTransitions);
        {
            let mut gd = get_global!(datamodel);
            for s in statesToExit.iterator() {
                gd.statesToInvoke.delete(s);
            }
        }
        let statesToExitSorted = statesToExit.sort(&|s1, s2| self.state_exit_order(s1, s2));
        let mut ahistory: HashTable<StateId, OrderedSet<StateId>> = HashTable::new();

        {
            let configuration = get_global!(datamodel).configuration.clone();
            for sid in statesToExitSorted.iterator() {
                let s = self.get_state_by_id(*sid);
                for hid in s.history.iterator() {
                    let h = self.get_state_by_id(*hid);
                    if h.history_type == HistoryType::Deep {
                        let f = configuration.toList().filter_by(&|s0| -> bool {
                            self.isAtomicStateId(s0) && self.isDescendant(*s0, s.id)
                        });
                        ahistory.put_move(h.id, f.to_set());
                    } else {
                        let f = configuration
                            .toList()
                            .filter_by(&|s0| -> bool { self.get_state_by_id(*s0).parent == s.id });
                        ahistory.put_move(h.id, f.to_set());
                    }
                }
            }
        }
        get_global!(datamodel).historyValue.put_all(&ahistory);

        for sid in statesToExitSorted.iterator() {
            let onExitId;
            let mut invoke_docs: Vec<DocumentId> = Vec::new();
            {
                let s = self.get_state_by_id(*sid);
                onExitId = s.onexit;
                for inv in s.invoke.iterator() {
                    invoke_docs.push(inv.doc_id);
                }
            }
            if onExitId != 0 {
                self.executeContent(datamodel, onExitId);
            }
            for invoke_doc in invoke_docs {
                self.cancelInvoke(datamodel, invoke_doc);
            }
            get_global!(datamodel).configuration.delete(sid)
        }
    }

    /// *W3C says*:
    /// ## procedure enterStates(enabledTransitions)
    /// First, compute the list of all the states that will be entered as a result of taking the
    /// transitions in enabledTransitions. Add them to statesToInvoke so that invoke processing can
    /// be done at the start of the next macrostep. Convert statesToEnter to a list and sort it in
    /// entryOrder. For each state s in the list, first add s to the current configuration.
    /// Then if we are using late binding, and this is the first time we have entered s, initialize
    /// its data model. Then execute any onentry handlers. If s's initial state is being entered by
    /// default, execute any executable content in the initial transition. If a history state in s
    /// was the target of a transition, and s has not been entered before, execute the content
    /// inside the history state's default transition. Finally, if s is a final state, generate
    /// relevant Done events. If we have reached a top-level final state, set running to false as a
    /// signal to stop processing.
    /// ```ignore
    /// procedure enterStates(enabledTransitions):
    ///     statesToEnter = new OrderedSet()
    ///     statesForDefaultEntry = new OrderedSet()
    ///     // initialize the temporary table for default content in history states
    ///     defaultHistoryContent = new HashTable()
    ///     computeEntrySet(enabledTransitions, statesToEnter, statesForDefaultEntry, defaultHistoryContent)
    ///     for s in statesToEnter.toList().sort(entryOrder):
    ///        configuration.add(s)
    ///        statesToInvoke.add(s)
    ///        if binding == "late" and s.isFirstEntry:
    ///           initializeDataModel(datamodel.s,doc.s)
    ///           s.isFirstEntry = false
    ///        for content in s.onentry.sort(documentOrder):
    ///           executeContent(content)
    ///        if statesForDefaultEntry.isMember(s):
    ///           executeContent(s.initial.transition)
    ///        if defaultHistoryContent[s.id]:
    ///           executeContent(defaultHistoryContent[s.id])
    ///        if isFinalState(s):
    ///           if isSCXMLElement(s.parent):
    ///              running = false
    ///           else:
    ///              parent = s.parent
    ///              grandparent = parent.parent
    ///              internalQueue.enqueue(new Event("done.state." + parent.id, s.donedata))
    ///              if isParallelState(grandparent):
    ///                 if getChildStates(grandparent).every(isInFinalState):
    ///                    internalQueue.enqueue(new Event("done.state." + grandparent.id))
    /// ```
    #[allow(non_snake_case)]
    fn enterStates(&mut self, datamodel: &mut dyn Datamodel, enabledTransitions: &List<TransitionId>) {
        let binding = self.binding;
        let mut statesToEnter = OrderedSet::new();
        let mut statesForDefaultEntry = OrderedSet::new();

        // initialize the temporary table for default content in history states
        let mut defaultHistoryContent: HashTable<StateId, ExecutableContentId> = HashTable::new();
        self.computeEntrySet(
            datamodel,
            enabledTransitions,
            &mut statesToEnter,
            &mut statesForDefaultEntry,
            &mut defaultHistoryContent,
        );
        for s in statesToEnter
            .toList()
            .sort(&|s1, s2| self.state_entry_order(s1, s2))
            .iterator()
        {
            {
                let mut gd = get_global!(datamodel);
                gd.configuration.add(*s);
                gd.statesToInvoke.add(*s);
            }
            let mut to_init: StateId = 0;
            {
                let state_s: &mut State = self.get_state_by_id_mut(*s);
                if binding == BindingType::Late && state_s.isFirstEntry {
                    to_init = *s;
                    state_s.isFirstEntry = false;
                }
            }
            if to_init != 0 {
                datamodel.initializeDataModel(self, to_init, true);
            }
            let mut exe = Vec::new();
            {
                let state_s: &State = self.get_state_by_id(*s);
                exe.push(state_s.onentry);
                if statesForDefaultEntry.isMember(s) && state_s.initial > 0 {
                    exe.push(self.get_transition_by_id(state_s.initial).content);
                }
                if defaultHistoryContent.has(*s) {
                    exe.push(*defaultHistoryContent.get(*s));
                }
            }
            for ct in exe {
                if ct > 0 {
                    self.executeContent(datamodel, ct);
                }
            }

            if self.isFinalStateId(*s) {
                let parent: StateId = self.get_state_by_id(*s).parent;
                if self.isSCXMLElement(parent) {
                    get_global!(datamodel).running = false;
                } else {
                    let donedata = self.get_state_by_id(*s).donedata.clone();
                    let (param_values, content) = self.evaluate_done_data(datamodel, &donedata);
                    let parent_name = self.get_state_by_id(parent).name.clone();
                    let mut done_event = Event::new(
                        EVENT_DONE_STATE_PREFIX,
                        parent_name.as_str(),
                        param_values,
                        content,
                    );
                    done_event.etype = EventType::platform;
                    self.enqueue_internal(datamodel, done_event);

                    let grandparent: StateId = self.get_state_by_id(parent).parent;
                    if self.isParallelState(grandparent)
                        && self
                            .getChildStates(grandparent)
                            .every(&|cs: &StateId| -> bool { self.isInFinalState(datamodel, *cs) })
                    {
                        let grandparent_name = self.get_state_by_id(grandparent).name.clone();
                        let mut done_event = Event::new(
                            EVENT_DONE_STATE_PREFIX,
                            grandparent_name.as_str(),
                            None,
                            None,
                        );
                        done_event.etype = EventType::platform;
                        self.enqueue_internal(datamodel, done_event);
                    }
                }
            }
        }
    }

    /// Put an event into the internal queue.
    pub fn enqueue_internal(&mut self, datamodel: &mut dyn Datamodel, event: Event) {
        get_global!(datamodel).enqueue_internal(event);
    }

    #[allow(non_snake_case)]
    pub fn executeContent(
        &mut self,
        datamodel: &mut dyn Datamodel,
        contentId: ExecutableContentId,
    ) -> bool {
        if contentId != 0 {
            datamodel.executeContent(self, contentId)
        } else {
            true
        }
    }

    #[allow(non_snake_case)]
    pub fn isParallelState(&self, state: StateId) -> bool {
        state > 0 && self.get_state_by_id(state).is_parallel
    }

    #[allow(non_snake_case)]
    pub fn isSCXMLElement(&self, state: StateId) -> bool {
        state == self.pseudo_root
    }

    #[allow(non_snake_case)]
    pub fn isFinalState(&self, state: &State) -> bool {
        state.is_final
    }

    #[allow(non_snake_case)]
    pub fn isFinalStateId(&self, state: StateId) -> bool {
        self.isFinalState(self.get_state_by_id(state))
    }

    #[allow(non_snake_case)]
    pub fn isAtomicState(&self, state: &State) -> bool {
        state.states.is_empty() && state.history_type == HistoryType::None
    }

    #[allow(non_snake_case)]
    pub fn isAtomicStateId(&self, sid: &StateId) -> bool {
        self.isAtomicState(self.get_state_by_id(*sid))
    }

    /// *W3C says*:
    /// # procedure computeExitSet(enabledTransitions)
    /// For each transition t in enabledTransitions, if t is targetless then do nothing, else
    /// compute the transition's domain. (This will be the source state in the case of internal
    /// transitions) or the least common compound ancestor state of the source state and target
    /// states of t (in the case of external transitions. Add to the statesToExit set all states
    /// in the configuration that are descendants of the domain.
    /// ```ignore
    /// function computeExitSet(transitions)
    ///     statesToExit = new OrderedSet
    ///     for t in transitions:
    ///         if t.target:
    ///             domain = getTransitionDomain(t)
    ///             for s in configuration:
    ///                 if isDescendant(s,domain):
    ///                     statesToExit.add(s)
    ///     return statesToExit;
    /// ```
    #[allow(non_snake_case)]
    fn computeExitSet(
        &self,
        datamodel: &mut dyn Datamodel,
        transitions: &List<TransitionId>,
    ) -> OrderedSet<StateId> {
        let mut statesToExit: OrderedSet<StateId> = OrderedSet::new();
        for tid in transitions.iterator() {
            let t = self.get_transition_by_id(*tid);
            if !t.target.is_empty() {
                let domain = self.getTransitionDomain(datamodel, t);
                for s in get_global!(datamodel).configuration.iterator() {
                    if self.isDescendant(*s, domain) {
                        statesToExit.add(*s);
                    }
                }
            }
        }
        statesToExit
    }

    /// *W3C says*:
    /// # procedure executeTransitionContent(enabledTransitions)
    /// For each transition in the list of enabledTransitions, execute its executable content.
    /// ```ignore
    /// procedure executeTransitionContent(enabledTransitions):
    ///     for t in enabledTransitions:
    ///         executeContent(t)
    /// ```
    #[allow(non_snake_case)]
    fn executeTransitionContent(
        &mut self,
        datamodel: &mut dyn Datamodel,
        enabledTransitions: &List<TransitionId>,
    ) {
        for tid in enabledTransitions.iterator() {
            let t = self.get_transition_by_id(*tid);
            if t.content > 0 {
                self.executeContent(datamodel, t.content);
            }
        }
    }

    /// *W3C says*:
    /// # procedure computeEntrySet(transitions, statesToEnter, statesForDefaultEntry, defaultHistoryContent)
    /// Compute the complete set of states that will be entered as a result of taking 'transitions'.
    /// This value will be returned in 'statesToEnter' (which is modified by this procedure). Also
    /// place in 'statesForDefaultEntry' the set of all states whose default initial states were
    /// entered. First gather up all the target states in 'transitions'. Then add them and, for all
    /// that are not atomic states, add all of their (default) descendants until we reach one or
    /// more atomic states. Then add any ancestors that will be entered within the domain of the
    /// transition. (Ancestors outside of the domain of the transition will not have been exited.)
    /// ```ignore
    /// procedure computeEntrySet(transitions, statesToEnter, statesForDefaultEntry, defaultHistoryContent)
    ///     for t in transitions:
    ///         for s in t.target:
    ///             addDescendantStatesToEnter(s,statesToEnter,statesForDefaultEntry, defaultHistoryContent)
    ///         ancestor = getTransitionDomain(t)
    ///         for s in getEffectiveTargetStates(t):
    ///             addAncestorStatesToEnter(s, ancestor, statesToEnter, statesForDefaultEntry, defaultHistoryContent)
    /// ```
    #[allow(non_snake_case)]
    fn computeEntrySet(
        &mut self,
        datamodel: &mut dyn Datamodel,
        transitions: &List<TransitionId>,
        statesToEnter: &mut OrderedSet<StateId>,
        statesForDefaultEntry: &mut OrderedSet<StateId>,
        defaultHistoryContent: &mut HashTable<StateId, ExecutableContentId>,
    ) {
        for tid in transitions.iterator() {
            let t = self.get_transition_by_id(*tid);
            for s in t.target.iter() {
                self.addDescendantStatesToEnter(
                    datamodel,
                    *s,
                    statesToEnter,
                    statesForDefaultEntry,
                    defaultHistoryContent,
                );
            }
            let ancestor = self.getTransitionDomain(datamodel, t);
            for s in self.getEffectiveTargetStates(datamodel, t).iterator() {
                self.addAncestorStatesToEnter(
                    datamodel,
                    *s,
                    ancestor,
                    statesToEnter,
                    statesForDefaultEntry,
                    defaultHistoryContent,
                );
            }
        }
    }

    /// *W3C says*:
    /// # procedure addDescendantStatesToEnter(state,statesToEnter,statesForDefaultEntry, defaultHistoryContent)
    /// The purpose of this procedure is to add to statesToEnter 'state' and any of its descendants
    /// that the state machine will end up entering when it enters 'state'. (N.B. If 'state' is a
    /// history pseudo-state, we dereference it and add the history value instead.) Note that this
    /// procedure permanently modifies both statesToEnter and statesForDefaultEntry.
    ///
    /// First, If state is a history state then add either the history values associated with state
    /// or state's default target to statesToEnter. Then (since the history value may not be an
    /// immediate descendant of 'state's parent) add any ancestors between the history value and
    /// state's parent. Else (if state is not a history state), add state to statesToEnter. Then if
    /// state is a compound state, add state to statesForDefaultEntry and recursively call
    /// addStatesToEnter on its default initial state(s). Then, since the default initial states
    /// may not be children of 'state', add any ancestors between the default initial states and
    /// 'state'. Otherwise, if state is a parallel state, recursively call addStatesToEnter on any
    /// of its child states that don't already have a descendant on statesToEnter.
    /// ```ignore
    /// procedure addDescendantStatesToEnter(state,statesToEnter,statesForDefaultEntry, defaultHistoryContent):
    ///     if isHistoryState(state):
    ///         if historyValue[state.id]:
    ///             for s in historyValue[state.id]:
    ///                 addDescendantStatesToEnter(s,statesToEnter,statesForDefaultEntry, defaultHistoryContent)
    ///             for s in historyValue[state.id]:
    ///                 addAncestorStatesToEnter(s, state.parent, statesToEnter, statesForDefaultEntry, defaultHistoryContent)
    ///         else:
    ///             defaultHistoryContent[state.parent.id] = state.transition.content
    ///             for s in state.transition.target:
    ///                 addDescendantStatesToEnter(s,statesToEnter,statesForDefaultEntry, defaultHistoryContent)
    ///             for s in state.transition.target:
    ///                 addAncestorStatesToEnter(s, state.parent, statesToEnter, statesForDefaultEntry, defaultHistoryContent)
    ///     else:
    ///         statesToEnter.add(state)
    ///         if isCompoundState(state):
    ///             statesForDefaultEntry.add(state)
    ///             for s in state.initial.transition.target:
    ///                 addDescendantStatesToEnter(s,statesToEnter,statesForDefaultEntry, defaultHistoryContent)
    ///             for s in state.initial.transition.target:
    ///                 addAncestorStatesToEnter(s, state, statesToEnter, statesForDefaultEntry, defaultHistoryContent)
    ///         else:
    ///             if isParallelState(state):
    ///                 for child in getChildStates(state):
    ///                     if not statesToEnter.some(lambda s: isDescendant(s,child)):
    ///                         addDescendantStatesToEnter(child,statesToEnter,statesForDefaultEntry, defaultHistoryContent)
    /// ```
    #[allow(non_snake_case)]
    fn addDescendantStatesToEnter(
        &self,
        datamodel: &mut dyn Datamodel,
        sid: StateId,
        statesToEnter: &mut OrderedSet<StateId>,
        statesForDefaultEntry: &mut OrderedSet<StateId>,
        defaultHistoryContent: &mut HashTable<StateId, ExecutableContentId>,
    ) {
        let state = self.get_state_by_id(sid);
        if self.isHistoryState(sid) {
            if get_global!(datamodel).historyValue.has(sid) {
                let mut stateIds: Vec<StateId> = Vec::new();
                for s in get_global!(datamodel).historyValue.get(sid).iterator() {
                    stateIds.push(*s);
                }
                for s in &stateIds {
                    self.addDescendantStatesToEnter(
                        datamodel,
                        *s,
                        statesToEnter,
                        statesForDefaultEntry,
                        defaultHistoryContent,
                    );
                }
                for s in &stateIds {
                    self.addAncestorStatesToEnter(
                        datamodel,
                        *s,
                        state.parent,
                        statesToEnter,
                        statesForDefaultEntry,
                        defaultHistoryContent,
                    );
                }
            } else {
                // A history state has exactly one transition which specifies the
                // default history configuration.
                let defaultTransition = self.get_transition_by_id(*state.transitions.head());
                defaultHistoryContent.put(state.parent, &defaultTransition.content);
                for s in &defaultTransition.target {
                    self.addDescendantStatesToEnter(
                        datamodel,
                        *s,
                        statesToEnter,
                        statesForDefaultEntry,
                        defaultHistoryContent,
                    );
                }
                for s in &defaultTransition.target {
                    self.addAncestorStatesToEnter(
                        datamodel,
                        *s,
                        state.parent,
                        statesToEnter,
                        statesForDefaultEntry,
                        defaultHistoryContent,
                    );
                }
            }
        } else {
            statesToEnter.add(sid);
            if self.isCompoundState(sid) {
                statesForDefaultEntry.add(sid);
                if state.initial != 0 {
                    let initialTransition = self.get_transition_by_id(state.initial);
                    for s in &initialTransition.target {
                        self.addDescendantStatesToEnter(
                            datamodel,
                            *s,
                            statesToEnter,
                            statesForDefaultEntry,
                            defaultHistoryContent,
                        );
                    }
                    for s in &initialTransition.target {
                        self.addAncestorStatesToEnter(
                            datamodel,
                            *s,
                            sid,
                            statesToEnter,
                            statesForDefaultEntry,
                            defaultHistoryContent,
                        )
                    }
                }
            } else if self.isParallelState(sid) {
                for child in self.getChildStates(sid).iterator() {
                    if !statesToEnter.some(&|s| self.isDescendant(*s, *child)) {
                        self.addDescendantStatesToEnter(
                            datamodel,
                            *child,
                            statesToEnter,
                            statesForDefaultEntry,
                            defaultHistoryContent,
                        )
                    }
                }
            }
        }
    }

    /// *W3C says*:
    /// # procedure addAncestorStatesToEnter(state, ancestor, statesToEnter, statesForDefaultEntry, defaultHistoryContent)
    /// Add to statesToEnter any ancestors of 'state' up to, but not including, 'ancestor' that must
    /// be entered in order to enter 'state'. If any of these ancestor states is a parallel state,
    /// we must fill in its descendants as well.
    /// ```ignore
    /// procedure addAncestorStatesToEnter(state, ancestor, statesToEnter, statesForDefaultEntry, defaultHistoryContent)
    ///     for anc in getProperAncestors(state,ancestor):
    ///         statesToEnter.add(anc)
    ///         if isParallelState(anc):
    ///             for child in getChildStates(anc):
    ///                 if not statesToEnter.some(lambda s: isDescendant(s,child)):
    ///                     addDescendantStatesToEnter(child,statesToEnter,statesForDefaultEntry, defaultHistoryContent)
    /// ```
    #[allow(non_snake_case)]
    fn addAncestorStatesToEnter(
        &self,
        datamodel: &mut dyn Datamodel,
        state: StateId,
        ancestor: StateId,
        statesToEnter: &mut OrderedSet<StateId>,
        statesForDefaultEntry: &mut OrderedSet<StateId>,
        defaultHistoryContent: &mut HashTable<StateId, ExecutableContentId>,
    ) {
        for anc in self.getProperAncestors(state, ancestor).iterator() {
            statesToEnter.add(*anc);
            if self.isParallelState(*anc) {
                for child in self.getChildStates(*anc).iterator() {
                    if !statesToEnter.some(&|s| self.isDescendant(*s, *child)) {
                        self.addDescendantStatesToEnter(
                            datamodel,
                            *child,
                            statesToEnter,
                            statesForDefaultEntry,
                            defaultHistoryContent,
                        );
                    }
                }
            }
        }
    }

    /// *W3C says*:
    /// # procedure isInFinalState(s)
    /// Return true if s is a compound \<state\> and one of its children is an active \<final\>
    /// state (i.e. is a member of the current configuration), or if s is a \<parallel\> state and
    /// isInFinalState is true of all its children.
    /// ```ignore
    /// function isInFinalState(s):
    ///     if isCompoundState(s):
    ///         return getChildStates(s).some(lambda s: isFinalState(s) and configuration.isMember(s));
    ///     elif isParallelState(s):
    ///         return getChildStates(s).every(isInFinalState);
    ///     else:
    ///         return false;
    /// ```
    #[allow(non_snake_case)]
    fn isInFinalState(&self, datamodel: &dyn Datamodel, s: StateId) -> bool {
        if self.isCompoundState(s) {
            self.getChildStates(s).some(&|cs: &StateId| -> bool {
                self.isFinalStateId(*cs) && datamodel.global_s().lock().configuration.isMember(cs)
            })
        } else if self.isParallelState(s) {
            self.getChildStates(s)
                .every(&|cs: &StateId| -> bool { self.isInFinalState(datamodel, *cs) })
        } else {
            false
        }
    }

    /// *W3C says*:
    /// # function getTransitionDomain(transition)
    /// Return the compound state such that
    /// 1) all states that are exited or entered as a result of taking 'transition'
    ///    are descendants of it
    /// 2) no descendant of it has this property.
    /// ```ignore
    /// function getTransitionDomain(t)
    ///     tstates = getEffectiveTargetStates(t)
    ///     if not tstates:
    ///         return null;
    ///     elif t.type == "internal" and isCompoundState(t.source) and tstates.every(lambda s: isDescendant(s,t.source)):
    ///         return t.source;
    ///     else:
    ///         return findLCCA([t.source].append(tstates));
    /// ```
    #[allow(non_snake_case)]
    fn getTransitionDomain(&self, datamodel: &mut dyn Datamodel, t: &Transition) -> StateId {
        let tstates = self.getEffectiveTargetStates(datamodel, t);
        if tstates.isEmpty() {
            0
        } else if t.transition_type == TransitionType::Internal
            && self.isCompoundState(t.source)
            && tstates.every(&|s| -> bool { self.isDescendant(*s, t.source) })
        {
            t.source
        } else {
            let mut l = List::new();
            l.push(t.source);
            self.findLCCA(&l.append_set(&tstates))
        }
    }

    /// *W3C says*:
    /// # function findLCCA(stateList)
    /// The Least Common Compound Ancestor is the \<state\> or \<scxml\> element s such that s is a
    /// proper ancestor of all states on stateList and no descendant of s has this property.
    /// Note that there is guaranteed to be such an element since the \<scxml\> wrapper element is a
    /// common ancestor of all states. Note also that since we are speaking of proper ancestor
    /// (parent or parent of a parent, etc.) the LCCA is never a member of stateList.
    /// ```ignore
    /// function findLCCA(stateList):
    ///     for anc in getProperAncestors(stateList.head(),null).filter(isCompoundStateOrScxmlElement):
    ///         if stateList.tail().every(lambda s: isDescendant(s,anc)):
    ///             return anc;
    /// ```
    #[allow(non_snake_case)]
    fn findLCCA(&self, stateList: &List<StateId>) -> StateId {
        let mut lcca = 0;
        for anc in self
            .getProperAncestors(*stateList.head(), 0)
            .toList()
            .filter_by(&|s| self.isCompoundStateOrScxmlElement(*s))
            .iterator()
        {
            if stateList.tail().every(&|s| self.isDescendant(*s, *anc)) {
                lcca = *anc;
                break;
            }
        }
        lcca
    }

    /// *W3C says*:
    /// # function getEffectiveTargetStates(transition)
    /// Returns the states that will be the target when 'transition' is taken, dereferencing any
    /// history states.
    /// ```ignore
    /// function getEffectiveTargetStates(transition)
    ///     targets = new OrderedSet()
    ///     for s in transition.target
    ///         if isHistoryState(s):
    ///             if historyValue[s.id]:
    ///                 targets.union(historyValue[s.id])
    ///             else:
    ///                 targets.union(getEffectiveTargetStates(s.transition))
    ///         else:
    ///             targets.add(s)
    ///     return targets;
    /// ```
    #[allow(non_snake_case)]
    fn getEffectiveTargetStates(
        &self,
        datamodel: &mut dyn Datamodel,
        transition: &Transition,
    ) -> OrderedSet<StateId> {
        let mut targets: OrderedSet<StateId> = OrderedSet::new();
        for sid in &transition.target {
            if self.isHistoryState(*sid) {
                if get_global!(datamodel).historyValue.has(*sid) {
                    targets.union(get_global!(datamodel).historyValue.get(*sid));
                } else {
                    let s = self.get_state_by_id(*sid);
                    // History states have exactly one "transition"
                    targets.union(&self.getEffectiveTargetStates(
                        datamodel,
                        self.get_transition_by_id(*s.transitions.head()),
                    ));
                }
            } else {
                targets.add(*sid);
            }
        }
        targets
    }

    /// *W3C says*:
    /// # function getProperAncestors(state1, state2)
    /// If state2 is null, returns the set of all ancestors of state1 in ancestry order
    /// (state1's parent followed by the parent's parent, etc. up to an including the \<scxml\>
    /// element). If state2 is non-null, returns in ancestry order the set of all ancestors of
    /// state1, up to but not including state2.
    /// (A "proper ancestor" of a state is its parent, or the parent's parent,
    /// or the parent's parent's parent, etc.))
    /// If state2 is state1's parent, or equal to state1, or a descendant of state1, this returns
    /// the empty set.
    #[allow(non_snake_case)]
    fn getProperAncestors(&self, state1: StateId, state2: StateId) -> OrderedSet<StateId> {
        let mut properAncestors: OrderedSet<StateId> = OrderedSet::new();
        if !self.isDescendant(state2, state1) {
            let mut currState = self.get_state_by_id(state1).parent;
            while currState != 0 && currState != state2 {
                properAncestors.add(currState);
                currState = self.get_state_by_id(currState).parent;
            }
        }
        properAncestors
    }

    /// *W3C says*:
    /// # function isDescendant(state1, state2)
    /// Returns 'true' if state1 is a descendant of state2 (a child, or a child of a child, or a
    /// child of a child of a child, etc.) Otherwise returns 'false'.
    #[allow(non_snake_case)]
    fn isDescendant(&self, state1: StateId, state2: StateId) -> bool {
        if state1 == 0 || state2 == 0 || state1 == state2 {
            false
        } else {
            let mut currState = self.get_state_by_id(state1).parent;
            while currState != 0 && currState != state2 {
                currState = self.get_state_by_id(currState).parent;
            }
            currState == state2
        }
    }

    /// *W3C says*:
    /// A Compound State: A state of type \<state\> with at least one child state.
    #[allow(non_snake_case)]
    fn isCompoundState(&self, state: StateId) -> bool {
        if state != 0 {
            let stateS = self.get_state_by_id(state);
            !(stateS.is_final || stateS.is_parallel || stateS.states.is_empty())
        } else {
            false
        }
    }

    #[allow(non_snake_case)]
    fn isCompoundStateOrScxmlElement(&self, sid: StateId) -> bool {
        sid == self.pseudo_root || self.isCompoundState(sid)
    }

    #[allow(non_snake_case)]
    fn isHistoryState(&self, state: StateId) -> bool {
        self.get_state_by_id(state).history_type != HistoryType::None
    }

    #[allow(non_snake_case)]
    fn isCancelEvent(&self, ev: &Event) -> bool {
        // Cancel-Events (outer fsm cancels a fsm instance that was started by some invoke)
        // are platform specific.
        ev.name.eq(EVENT_CANCEL_SESSION)
    }

    /// *W3C says*:
    /// # function getChildStates(state1)
    /// Returns a list containing all \<state\>, \<final\>, and \<parallel\> children of state1.
    #[allow(non_snake_case)]
    fn getChildStates(&self, state1: StateId) -> List<StateId> {
        let mut l: List<StateId> = List::new();
        let stateRef = self.get_state_by_id(state1);
        for c in &stateRef.states {
            l.push(*c);
        }
        l
    }

    /// Implements the platform specific part of the \<invoke\> processing:
    /// spawn a child session for the invoke.\
    /// W3C: if the evaluation of the \<invoke\> arguments produces an error, the
    /// SCXML Processor must terminate the processing of the element without
    /// further action.
    fn invoke(&mut self, datamodel: &mut dyn Datamodel, inv: &Invoke) {
        let mut type_name =
            match datamodel.get_expression_alternative_value(&inv.type_name, &inv.type_expr) {
                Ok(value) => value,
                Err(_) => {
                    // Error -> abort
                    return;
                }
            };
        if type_name.is_empty() || type_name.eq(SCXML_INVOKE_TYPE_SHORT) {
            type_name = SCXML_INVOKE_TYPE.to_string();
        }
        if !type_name.starts_with(SCXML_INVOKE_TYPE) {
            error!("Unsupported <invoke> type {}", type_name);
            datamodel.internal_error_execution();
            return;
        }

        #[allow(non_snake_case)]
        let invokeId = if inv.invoke_id.is_empty() {
            // W3C:
            // A conformant SCXML document may specify either the 'id' or 'idlocation' attribute, but
            // must not specify both. If the 'idlocation' attribute is present, the SCXML Processor
            // must generate an id automatically when the <invoke> element is evaluated and store it
            // in the location specified by 'idlocation'. The automatically generated identifier must
            // have the form stateid.platformid, where stateid is the id of the state containing this
            // element and platformid is automatically generated. platformid must be unique within
            // the current session.
            format!(
                "{}.{}",
                &inv.parent_state_name,
                PLATFORM_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
            )
        } else {
            inv.invoke_id.clone()
        };

        let src = match datamodel.get_expression_alternative_value(&inv.src, &inv.src_expr) {
            Err(_) => {
                // Error -> Abort
                return;
            }
            Ok(value) => value,
        };

        let mut name_values: Vec<ParamPair> = Vec::new();
        if !datamodel.evaluate_name_list(inv.name_list.as_slice(), &mut name_values, &None) {
            return;
        }
        if !datamodel.evaluate_params(&inv.params, &mut name_values, &None) {
            return;
        }

        debug!(
            "Invoke: type '{}' invokeId '{}' src '{}' namelist '{:?}'",
            type_name, invokeId, src, name_values
        );

        if !inv.external_id_location.is_empty() {
            // If "idlocation" is specified, we have to store the generated id to this location
            datamodel.set(
                inv.external_id_location.as_str(),
                Data::new(invokeId.as_str()),
            );
        }

        let mut data_map: HashMap<String, Data> = HashMap::with_capacity(name_values.len());
        for pair in name_values {
            data_map.insert(pair.name, pair.value);
        }

        let (session_id, mut executor) = {
            let global = get_global!(datamodel);
            match &global.executor {
                Some(executor) => (global.session_id, (**executor).clone()),
                None => {
                    error!("Invoke: executor not available");
                    return;
                }
            }
        };

        let result: Result<ScxmlSession, String> = if let Some(factory) = &inv.model {
            let child_fsm = factory();
            Ok(executor.execute_model_for_invoke(child_fsm, &data_map, session_id, &invokeId))
        } else if !src.is_empty() {
            executor.execute_with_data(src.as_str(), &data_map, Some(session_id), &invokeId)
        } else {
            match datamodel.evaluate_content(&inv.content) {
                None => Err("No content to execute".to_string()),
                Some(content) => executor.execute_with_data_from_xml(
                    content.string_value().as_str(),
                    &data_map,
                    Some(session_id),
                    &invokeId,
                    FinishMode::DISPOSE,
                ),
            }
        };

        match result {
            Ok(session) => {
                let mut global = get_global!(datamodel);
                global.active_invoke_ids.insert(inv.doc_id, invokeId.clone());
                global.child_sessions.insert(invokeId, session);
            }
            Err(error) => {
                // W3C: If the SCXML Processor cannot instantiate the external
                // service, it must place error.communication on the internal queue.
                error!("Invoke of '{}' failed: {}", invokeId, error);
                let mut trigger = Event::new_simple("");
                trigger.invoke_id = Some(invokeId);
                datamodel.internal_error_communication(&trigger);
            }
        }
    }

    /// Cancels the child session of the \<invoke\> with the given document id:
    /// pending events of the child are cancelled, the child receives the
    /// platform cancel event and late events of the child are dropped from
    /// now on.
    #[allow(non_snake_case)]
    fn cancelInvoke(&mut self, datamodel: &mut dyn Datamodel, invoke_doc_id: DocumentId) {
        let (invoke_id, session, executor) = {
            let mut global = get_global!(datamodel);
            let invoke_id = global.active_invoke_ids.remove(&invoke_doc_id);
            let session = match &invoke_id {
                Some(id) => global.child_sessions.remove(id),
                None => None,
            };
            let executor = global.executor.as_ref().map(|e| (**e).clone());
            (invoke_id, session, executor)
        };
        match (invoke_id, session, executor) {
            (Some(invoke_id), Some(session), Some(executor)) => {
                debug!("Cancel invoke '{}'", invoke_id);
                executor.mark_invoke_cancelled(&invoke_id);
                executor.scheduler.cancel_session(session.session_id);
                let _ = session
                    .sender
                    .send(Box::new(Event::new_simple(EVENT_CANCEL_SESSION)));
            }
            _ => {
                // Not invoked yet or executor gone, nothing to cancel.
            }
        }
    }

    /// *W3C says*:
    /// 5.9.1 Conditional Expressions
    /// Conditional expressions are used inside the 'cond' attribute of \<transition\>, \<if\> and
    /// \<elseif\>. If a conditional expression cannot be evaluated as a boolean value ('true' or
    /// 'false') or if its evaluation causes an error, the SCXML Processor must treat the expression
    /// as if it evaluated to 'false' and must place the error 'error.execution' in the internal
    /// event queue.
    #[allow(non_snake_case)]
    fn conditionMatch(&mut self, datamodel: &mut dyn Datamodel, tid: TransitionId) -> bool {
        let cond;
        {
            let t = self.get_transition_by_id(tid);
            cond = t.cond.clone();
        }
        match cond {
            Some(c) => match datamodel.execute_condition(c.as_str()) {
                Ok(v) => v,
                Err(_e) => {
                    datamodel.internal_error_execution();
                    false
                }
            },
            None => true,
        }
    }

    /// Converts a list of Transition-ids to a list of references.
    fn to_transition_list(&self, trans_ids: &List<TransitionId>) -> List<&Transition> {
        let mut l = List::new();
        for tid in trans_ids.iterator() {
            l.push(self.get_transition_by_id(*tid));
        }
        l
    }
}

////////////////////////////////////////
//// Display support

impl Display for Fsm {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Fsm{{v:{} root:{} states:",
            self.version, self.pseudo_root
        )?;
        display_state_map(&self.states, f)?;
        display_transition_map(&self.transitions, f)?;
        write!(f, "}}")
    }
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{#{} '{}' states:{} transitions:{}}}",
            self.id,
            self.name,
            vec_to_string(&self.states),
            vec_to_string(&self.transitions.data)
        )
    }
}

impl Display for Transition {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{#{} {} {:?} target:{:?}}}",
            self.id, self.transition_type, &self.events, self.target
        )
    }
}

impl Display for TransitionType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TransitionType::Internal => f.write_str("internal"),
            TransitionType::External => f.write_str("external"),
        }
    }
}

impl Display for List<u32> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(vec_to_string(&self.data).as_str())
    }
}

impl Display for OrderedSet<u32> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(vec_to_string(&self.data).as_str())
    }
}

pub(crate) fn vec_to_string<T: Display>(v: &[T]) -> String {
    let mut s = "[".to_string();
    for (i, item) in v.iter().enumerate() {
        s += format!("{}{}", if i > 0 { "," } else { "" }, item).as_str();
    }
    s += "]";
    s
}

pub(crate) fn opt_vec_to_string<T: Display>(v: &Option<Vec<T>>) -> String {
    match v {
        None => "None".to_string(),
        Some(v) => vec_to_string(v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::FsmBuilder;
    use crate::test::{run_test_manual, run_test_manual_with_send, states};

    #[test]
    fn list_can_push_and_head() {
        let mut l: List<String> = List::new();
        l.push("Abc".to_string());
        l.push("def".to_string());
        l.push("ghi".to_string());
        assert_eq!(l.size(), 3);
        assert_eq!(l.head(), &"Abc".to_string());
    }

    #[test]
    fn list_can_tail_and_append() {
        let mut l1: List<String> = List::new();
        l1.push("Abc".to_string());
        l1.push("def1".to_string());
        l1.push("ghi1".to_string());

        assert_eq!(l1.tail().size(), 2);
        assert_eq!(l1.size(), 3);

        let l2 = l1.append(&l1);
        assert_eq!(l2.size(), 2 * l1.size());
    }

    #[test]
    fn list_can_some_every_filter() {
        let mut l: List<String> = List::new();
        l.push("Abc".to_string());
        l.push("def".to_string());
        l.push("ghi".to_string());

        assert!(l.some(&|s| -> bool { *s == "Abc" }));
        assert!(l.every(&|_s| -> bool { true }));
        assert!(!l.every(&|s| -> bool { !s.eq("ghi") }));

        let l2 = l.filter_by(&|_s: &String| -> bool { true });
        assert_eq!(l2.size(), l.size());
        let l3 = l2.filter_by(&|_s: &String| -> bool { false });
        assert_eq!(l3.size(), 0);
    }

    #[test]
    fn list_can_sort() {
        let mut l1: List<String> = List::new();
        l1.push("Xyz".to_string());
        l1.push("Bef".to_string());
        l1.push("Abc".to_string());

        let l2 = l1.sort(&|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(l2.head(), &"Abc".to_string());
        // The original list is unchanged.
        assert_eq!(l1.head(), &"Xyz".to_string());
    }

    #[test]
    fn ordered_set_can_add_and_delete() {
        let mut os: OrderedSet<String> = OrderedSet::new();
        os.add("Abc".to_string());
        os.add("def".to_string());
        os.add("ghi".to_string());
        os.add("Abc".to_string()); // duplicates are ignored.
        assert_eq!(os.size(), 3);

        os.delete(&"Abc".to_string());
        os.delete(&"xxx".to_string()); // unknown, shall be ignored.
        os.delete(&"Abc".to_string()); // shall be ignored.
        assert_eq!(os.size(), 2);
    }

    #[test]
    fn ordered_set_can_union() {
        let mut os1: OrderedSet<String> = OrderedSet::new();
        os1.add("Abc".to_string());
        os1.add("def1".to_string());

        let mut os2: OrderedSet<String> = OrderedSet::new();
        os2.add("Abc".to_string());
        os2.add("def2".to_string());

        os1.union(&os2);
        assert_eq!(os1.size(), 3);
        assert!(os1.isMember(&"def2".to_string()));
        assert!(os1.isMember(&"Abc".to_string()));
    }

    #[test]
    #[allow(non_snake_case)]
    fn ordered_set_can_hasIntersection() {
        let mut os1: OrderedSet<String> = OrderedSet::new();
        os1.add("Abc".to_string());
        os1.add("def".to_string());

        let mut os2: OrderedSet<String> = OrderedSet::new();
        assert!(!os1.hasIntersection(&os2));

        os2.add("Abc".to_string());
        assert!(os1.hasIntersection(&os2));

        os1.delete(&"Abc".to_string());
        assert!(!os1.hasIntersection(&os2));

        // Always common with itself, but not if empty.
        assert!(os1.hasIntersection(&os1));
        os1.clear();
        assert!(!os1.hasIntersection(&os1));
    }

    #[test]
    fn descriptor_matching_follows_token_prefixes() {
        assert!(descriptor_match("error", "error"));
        assert!(descriptor_match("error", "error.execution"));
        assert!(descriptor_match("error.*", "error.execution"));
        assert!(descriptor_match("done.state", "done.state.P"));
        assert!(!descriptor_match("error", "errors"));
        assert!(!descriptor_match("error.execution", "error"));
        assert!(!descriptor_match("done.state.P", "done.state.Q"));
    }

    #[test]
    fn unsupported_datamodel_fails_fast() {
        let mut b = FsmBuilder::new("xpath");
        b.state("Main");
        b.initial("Main");
        let fsm = b.build().expect("model shall build");

        let mut executor = crate::fsm_executor::FsmExecutor::new();
        let session = executor.execute_model(fsm);
        assert!(session.wait_until_terminated(5000));
        let error = session.start_error().expect("start shall fail");
        assert!(error.contains("xpath"));
        executor.shutdown();
    }

    #[cfg(feature = "ECMAScriptModel")]
    mod scenarios {
        use super::*;
        use crate::builder::{assign, raise};

        /// Eventless cascade: states raise "inc" on entry, a self loop counts
        /// the events, an eventless guarded transition leaves to the final
        /// state exactly when the counter reaches 5.
        #[test]
        fn scenario_eventless_cascade() {
            let mut b = FsmBuilder::new("ecmascript");
            b.data_expr(crate::builder::SCXML_ROOT_NAME, "count", "0");
            b.state("s0");
            b.state("s1");
            b.state("s2");
            b.final_state("pass");
            b.final_state("fail");
            b.initial("s0");
            b.on_entry("s0", vec![raise("inc")]);
            b.on_entry("s1", vec![raise("inc")]);
            b.on_entry("s2", vec![raise("inc")]);
            b.transition("s0", "", &["s1"]);
            b.transition("s1", "", &["s2"]);
            b.transition_cond("s2", "", "count==5", &["pass"]);
            b.transition_cond("s2", "", "count>5", &["fail"]);
            let t = b.transition("s2", "inc", &["s2"]);
            b.transition_content(t, vec![assign("count", "count+1")]);
            let fsm = b.build().expect("model shall build");

            assert!(run_test_manual(
                "scenario_eventless_cascade",
                fsm,
                5000,
                &states(&["pass"]),
            ));
        }

        /// Internal events are processed before any further external event.
        #[test]
        fn scenario_internal_before_external() {
            let mut b = FsmBuilder::new("ecmascript");
            b.state("s1");
            b.state("s2");
            b.final_state("pass");
            b.final_state("fail");
            b.initial("s1");
            b.on_entry("s1", vec![raise("i")]);
            b.transition("s1", "i", &["s2"]);
            b.transition("s1", "x", &["fail"]);
            b.transition("s2", "x", &["pass"]);
            let fsm = b.build().expect("model shall build");

            assert!(run_test_manual_with_send(
                "scenario_internal_before_external",
                fsm,
                5000,
                &states(&["pass"]),
                |_executor, session| {
                    let _ = session.send_event(Event::new_simple("x"));
                },
            ));
        }

        /// Two raise calls in document order are dequeued in that order.
        #[test]
        fn scenario_internal_ordering() {
            let mut b = FsmBuilder::new("ecmascript");
            b.state("s0");
            b.state("s1");
            b.final_state("pass");
            b.final_state("fail");
            b.initial("s0");
            b.on_entry("s0", vec![raise("a"), raise("b")]);
            b.transition("s0", "a", &["s1"]);
            b.transition("s0", "b", &["fail"]);
            b.transition("s1", "b", &["pass"]);
            b.transition("s1", "a", &["fail"]);
            let fsm = b.build().expect("model shall build");

            assert!(run_test_manual(
                "scenario_internal_ordering",
                fsm,
                5000,
                &states(&["pass"]),
            ));
        }

        /// Shallow history: re-entering the compound via its history state
        /// restores the immediate child that was active at exit.
        #[test]
        fn scenario_shallow_history() {
            let mut b = FsmBuilder::new("ecmascript");
            b.state("C");
            b.state_in("a", "C");
            b.state_in("b", "C");
            b.history_in("hist", "C", HistoryType::Shallow);
            b.transition("hist", "", &["a"]);
            b.state("Outside");
            b.final_state("fin");
            b.initial("C");
            b.transition("a", "toB", &["b"]);
            b.transition("C", "out", &["Outside"]);
            b.transition("Outside", "back", &["hist"]);
            b.transition("b", "finish", &["fin"]);
            let fsm = b.build().expect("model shall build");

            assert!(run_test_manual_with_send(
                "scenario_shallow_history",
                fsm,
                8000,
                &states(&["fin"]),
                |_executor, session| {
                    assert!(session.process_event(Event::new_simple("toB"), 3000).success);
                    assert!(session.is_state_active("b"));
                    assert!(session.process_event(Event::new_simple("out"), 3000).success);
                    assert!(session.is_state_active("Outside"));
                    let r = session.process_event(Event::new_simple("back"), 3000);
                    assert!(r.success);
                    // The shallow history restored "b", not the default "a".
                    assert!(session.is_state_active("b"));
                    assert!(!session.is_state_active("a"));
                    let _ = session.send_event(Event::new_simple("finish"));
                },
            ));
        }

        /// Deep history restores the full atomic descendant configuration.
        #[test]
        fn scenario_deep_history() {
            let mut b = FsmBuilder::new("ecmascript");
            b.state("C");
            b.state_in("sub", "C");
            b.state_in("x", "sub");
            b.state_in("y", "sub");
            b.history_in("hist", "C", HistoryType::Deep);
            b.transition("hist", "", &["x"]);
            b.state("Outside");
            b.final_state("fin");
            b.initial("C");
            b.initial_in("C", "sub");
            b.transition("x", "toY", &["y"]);
            b.transition("C", "out", &["Outside"]);
            b.transition("Outside", "back", &["hist"]);
            b.transition("y", "finish", &["fin"]);
            let fsm = b.build().expect("model shall build");

            assert!(run_test_manual_with_send(
                "scenario_deep_history",
                fsm,
                8000,
                &states(&["fin"]),
                |_executor, session| {
                    assert!(session.process_event(Event::new_simple("toY"), 3000).success);
                    assert!(session.process_event(Event::new_simple("out"), 3000).success);
                    assert!(session.process_event(Event::new_simple("back"), 3000).success);
                    // Deep history restored the atomic descendant "y".
                    assert!(session.is_state_active("y"));
                    assert!(!session.is_state_active("x"));
                    let _ = session.send_event(Event::new_simple("finish"));
                },
            ));
        }

        /// Parallel regions: done.state of the parallel is emitted exactly
        /// when every region is in a final state.
        #[test]
        fn scenario_parallel_done_state() {
            let mut b = FsmBuilder::new("ecmascript");
            b.parallel("P");
            b.state_in("r1", "P");
            b.state_in("r1a", "r1");
            b.final_state_in("r1f", "r1");
            b.state_in("r2", "P");
            b.state_in("r2a", "r2");
            b.final_state_in("r2f", "r2");
            b.final_state("after");
            b.initial("P");
            b.transition("r1a", "e1", &["r1f"]);
            b.transition("r2a", "e2", &["r2f"]);
            b.transition("P", "done.state.P", &["after"]);
            let fsm = b.build().expect("model shall build");

            assert!(run_test_manual_with_send(
                "scenario_parallel_done_state",
                fsm,
                8000,
                &states(&["after"]),
                |_executor, session| {
                    // Configuration closure: the parallel, all regions and
                    // their active children are in the configuration.
                    for name in ["P", "r1", "r1a", "r2", "r2a"] {
                        assert!(session.is_state_active(name), "{} shall be active", name);
                    }
                    let _ = session.send_event(Event::new_simple("e1"));
                    let _ = session.send_event(Event::new_simple("e2"));
                },
            ));
        }

        fn child_sending_to_parent() -> FsmFactory {
            Arc::new(|| {
                let mut cb = FsmBuilder::new("ecmascript");
                cb.state("c0");
                cb.initial("c0");
                let mut send = SendParameters::new();
                send.event = "from_child".to_string();
                send.target = "#_parent".to_string();
                send.params = Some(vec![Parameter {
                    name: "v".to_string(),
                    expr: "42".to_string(),
                    location: "".to_string(),
                }]);
                cb.on_entry("c0", vec![Box::new(send)]);
                cb.build().expect("child model shall build")
            })
        }

        /// Invoke with finalize: the finalize block sees the child's event
        /// data before the transition is selected.
        #[test]
        fn scenario_invoke_with_finalize() {
            let mut b = FsmBuilder::new("ecmascript");
            b.data_expr(crate::builder::SCXML_ROOT_NAME, "seen", "0");
            b.state("Caller");
            b.final_state("pass");
            b.final_state("fail");
            b.initial("Caller");
            let finalize_id = b.content(vec![assign("seen", "_event.data.v")]);
            let mut inv = Invoke::new();
            inv.invoke_id = "childInv".to_string();
            inv.model = Some(child_sending_to_parent());
            inv.finalize = finalize_id;
            b.add_invoke("Caller", inv);
            b.transition_cond("Caller", "from_child", "seen==42", &["pass"]);
            b.transition("Caller", "from_child", &["fail"]);
            let fsm = b.build().expect("model shall build");

            assert!(run_test_manual(
                "scenario_invoke_with_finalize",
                fsm,
                8000,
                &states(&["pass"]),
            ));
        }

        /// A child reaching its top-level final state produces
        /// done.invoke.<invokeid> in the parent.
        #[test]
        fn scenario_invoke_done() {
            let child: FsmFactory = Arc::new(|| {
                let mut cb = FsmBuilder::new("ecmascript");
                cb.final_state("cfin");
                cb.initial("cfin");
                cb.build().expect("child model shall build")
            });

            let mut b = FsmBuilder::new("ecmascript");
            b.state("Caller");
            b.final_state("pass");
            b.final_state("fail");
            b.initial("Caller");
            let mut inv = Invoke::new();
            inv.invoke_id = "childDone".to_string();
            inv.model = Some(child);
            b.add_invoke("Caller", inv);
            b.transition_cond(
                "Caller",
                "done.invoke",
                "_event.invokeid=='childDone'",
                &["pass"],
            );
            b.transition("Caller", "done.invoke", &["fail"]);
            let fsm = b.build().expect("model shall build");

            assert!(run_test_manual(
                "scenario_invoke_done",
                fsm,
                8000,
                &states(&["pass"]),
            ));
        }

        /// With autoforward, external events of the parent are copied to the
        /// child session.
        #[test]
        fn scenario_invoke_autoforward() {
            let child: FsmFactory = Arc::new(|| {
                let mut cb = FsmBuilder::new("ecmascript");
                cb.state("c0");
                cb.final_state("cfin");
                cb.initial("c0");
                cb.transition("c0", "ping", &["cfin"]);
                cb.build().expect("child model shall build")
            });

            let mut b = FsmBuilder::new("ecmascript");
            b.state("Caller");
            b.final_state("pass");
            b.initial("Caller");
            let mut inv = Invoke::new();
            inv.invoke_id = "fwd".to_string();
            inv.autoforward = true;
            inv.model = Some(child);
            b.add_invoke("Caller", inv);
            b.transition("Caller", "done.invoke.fwd", &["pass"]);
            let fsm = b.build().expect("model shall build");

            assert!(run_test_manual_with_send(
                "scenario_invoke_autoforward",
                fsm,
                8000,
                &states(&["pass"]),
                |_executor, session| {
                    // The parent has no transition for "ping", it is only
                    // forwarded to the child, which then terminates.
                    let _ = session.send_event(Event::new_simple("ping"));
                },
            ));
        }

        /// The child session of an exited state is cancelled: it never
        /// reaches its delayed final and no done.invoke arrives.
        #[test]
        fn scenario_invoke_cancelled_on_exit() {
            let child: FsmFactory = Arc::new(|| {
                let mut cb = FsmBuilder::new("ecmascript");
                cb.state("c0");
                cb.final_state("cfin");
                cb.initial("c0");
                let mut send = SendParameters::new();
                send.event = "late".to_string();
                send.delay_ms = 400;
                cb.on_entry("c0", vec![Box::new(send)]);
                cb.transition("c0", "late", &["cfin"]);
                cb.build().expect("child model shall build")
            });

            let mut b = FsmBuilder::new("ecmascript");
            b.state("Caller");
            b.state("Idle");
            b.final_state("pass");
            b.final_state("fail");
            b.initial("Caller");
            let mut inv = Invoke::new();
            inv.invoke_id = "doomed".to_string();
            inv.model = Some(child);
            b.add_invoke("Caller", inv);
            b.transition("Caller", "leave", &["Idle"]);
            b.transition("Caller", "done.invoke", &["fail"]);
            b.transition("Idle", "done.invoke", &["fail"]);
            b.transition("Idle", "finish", &["pass"]);
            let fsm = b.build().expect("model shall build");

            assert!(run_test_manual_with_send(
                "scenario_invoke_cancelled_on_exit",
                fsm,
                8000,
                &states(&["pass"]),
                |_executor, session| {
                    // Leave the invoking state before the child's delayed
                    // event fires.
                    assert!(session.process_event(Event::new_simple("leave"), 3000).success);
                    std::thread::sleep(std::time::Duration::from_millis(700));
                    let _ = session.send_event(Event::new_simple("finish"));
                },
            ));
        }
    }
}
