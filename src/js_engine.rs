//! Session based ECMAScript engine on top of the Boa engine.\
//! Included if feature "ECMAScriptModel" is enabled.\
//! See [GitHub:Boa Engine](https://github.com/boa-dev/boa).
//!
//! Boa contexts must stay on the thread that created them and scripts of different
//! sessions must never share JS globals. All contexts of all sessions are therefore
//! owned by one dedicated worker thread and accessed via a request channel.
//! Public methods return a [JsFuture] that resolves when the worker has processed
//! the request. Requests sent from the same thread are processed in submission order.

use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::thread::JoinHandle;

use lazy_static::lazy_static;
use regex::Regex;

use crate::common::{debug, error};

use boa_engine::context::ContextBuilder;
use boa_engine::object::builtins::{JsArray, JsMap};
use boa_engine::object::ObjectInitializer;
use boa_engine::property::{Attribute, PropertyDescriptor, PropertyKey};
use boa_engine::value::Type;
use boa_engine::{
    js_string, native_function::NativeFunction, Context, JsArgs, JsData, JsError, JsResult,
    JsValue, Source,
};
use boa_gc::{empty_trace, Finalize, Trace};

use crate::datamodel::{
    Data, GlobalDataArc, EVENT_VARIABLE_FIELD_DATA, EVENT_VARIABLE_FIELD_INVOKE_ID,
    EVENT_VARIABLE_FIELD_NAME, EVENT_VARIABLE_FIELD_ORIGIN, EVENT_VARIABLE_FIELD_ORIGIN_TYPE,
    EVENT_VARIABLE_FIELD_SEND_ID, EVENT_VARIABLE_FIELD_TYPE, EVENT_VARIABLE_NAME,
    SESSION_ID_VARIABLE_NAME, SESSION_NAME_VARIABLE_NAME, SYSTEM_VARIABLE_NAMES,
};
use crate::event_io_processor::SYS_IO_PROCESSORS;
use crate::fsm::{Event, SessionId, StateId};

/// Failures crossing the worker boundary. Explicit results, never unwinding
/// across the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum JsEngineError {
    /// The location or variable is not declared in the session.
    /// W3C distinguishes "not declared" from "declared but undefined".
    NotDeclared(String),
    /// Evaluation raised a JS error (syntax or runtime). Carries the engine message.
    Eval(String),
    UnknownSession(SessionId),
    /// The worker is gone (engine shut down).
    Stopped,
}

impl std::fmt::Display for JsEngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JsEngineError::NotDeclared(name) => write!(f, "'{}' is not declared", name),
            JsEngineError::Eval(msg) => write!(f, "{}", msg),
            JsEngineError::UnknownSession(id) => write!(f, "unknown session #{}", id),
            JsEngineError::Stopped => write!(f, "engine is stopped"),
        }
    }
}

pub type JsEngineResult<T> = Result<T, JsEngineError>;

/// Handle to a pending engine request. Blocks on first inspection.
pub struct JsFuture<T> {
    receiver: Receiver<T>,
}

impl<T> JsFuture<T> {
    fn new(receiver: Receiver<T>) -> JsFuture<T> {
        JsFuture { receiver }
    }

    pub fn wait(self) -> Result<T, JsEngineError> {
        self.receiver.recv().map_err(|_| JsEngineError::Stopped)
    }
}

impl<T> JsFuture<JsEngineResult<T>> {
    /// Waits for the worker and flattens the transport error into the result.
    pub fn get(self) -> JsEngineResult<T> {
        match self.wait() {
            Ok(r) => r,
            Err(e) => Err(e),
        }
    }
}

enum JsRequest {
    CreateSession {
        session: SessionId,
        parent: Option<SessionId>,
        global: GlobalDataArc,
        reply: Sender<JsEngineResult<()>>,
    },
    DestroySession {
        session: SessionId,
        reply: Sender<JsEngineResult<()>>,
    },
    HasSession {
        session: SessionId,
        reply: Sender<bool>,
    },
    ActiveSessions {
        reply: Sender<Vec<SessionId>>,
    },
    Eval {
        session: SessionId,
        expression: String,
        reply: Sender<JsEngineResult<Data>>,
    },
    ExecuteScript {
        session: SessionId,
        code: String,
        reply: Sender<JsEngineResult<Data>>,
    },
    Validate {
        session: SessionId,
        expression: String,
        reply: Sender<JsEngineResult<()>>,
    },
    Assign {
        session: SessionId,
        location: String,
        expression: String,
        reply: Sender<JsEngineResult<()>>,
    },
    SetVariable {
        session: SessionId,
        name: String,
        // None declares the variable but leaves it undefined (late binding).
        value: Option<Data>,
        reply: Sender<JsEngineResult<()>>,
    },
    GetVariable {
        session: SessionId,
        location: String,
        reply: Sender<JsEngineResult<Data>>,
    },
    SetEvent {
        session: SessionId,
        event: Box<Event>,
        reply: Sender<JsEngineResult<()>>,
    },
    SetupSystemVariables {
        session: SessionId,
        session_name: Option<String>,
        io_processors: Vec<(String, String)>,
        reply: Sender<JsEngineResult<()>>,
    },
    InitializeReadOnly {
        session: SessionId,
        name: String,
        value: Data,
        reply: Sender<JsEngineResult<()>>,
    },
    InstallFunctions {
        session: SessionId,
        state_name_to_id: HashMap<String, StateId>,
        action_names: Vec<String>,
        reply: Sender<JsEngineResult<()>>,
    },
    ForEachSnapshot {
        session: SessionId,
        array_expression: String,
        reply: Sender<JsEngineResult<Vec<Data>>>,
    },
    Shutdown,
}

/// Cloneable handle to the engine worker.\
/// Owned by the executor, injected into the per-session datamodels.
#[derive(Clone)]
pub struct JsEngine {
    sender: Sender<JsRequest>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl JsEngine {
    pub fn new() -> JsEngine {
        let (sender, receiver) = channel::<JsRequest>();
        let worker = thread::Builder::new()
            .name("ecma_worker".to_string())
            .spawn(move || {
                JsEngineWorker::new().run(receiver);
            })
            .unwrap();
        JsEngine {
            sender,
            worker: Arc::new(Mutex::new(Some(worker))),
        }
    }

    fn submit<T>(
        &self,
        make: impl FnOnce(Sender<JsEngineResult<T>>) -> JsRequest,
    ) -> JsFuture<JsEngineResult<T>> {
        let (reply, receiver) = channel();
        if self.sender.send(make(reply.clone())).is_err() {
            let _ = reply.send(Err(JsEngineError::Stopped));
        }
        JsFuture::new(receiver)
    }

    pub fn create_session(
        &self,
        session: SessionId,
        parent: Option<SessionId>,
        global: GlobalDataArc,
    ) -> JsFuture<JsEngineResult<()>> {
        self.submit(|reply| JsRequest::CreateSession {
            session,
            parent,
            global,
            reply,
        })
    }

    pub fn destroy_session(&self, session: SessionId) -> JsFuture<JsEngineResult<()>> {
        self.submit(|reply| JsRequest::DestroySession { session, reply })
    }

    pub fn has_session(&self, session: SessionId) -> bool {
        let (reply, receiver) = channel();
        if self.sender.send(JsRequest::HasSession { session, reply }).is_err() {
            return false;
        }
        receiver.recv().unwrap_or(false)
    }

    pub fn active_sessions(&self) -> Vec<SessionId> {
        let (reply, receiver) = channel();
        if self.sender.send(JsRequest::ActiveSessions { reply }).is_err() {
            return Vec::new();
        }
        receiver.recv().unwrap_or_default()
    }

    /// Evaluates an expression, the result is converted to [Data].
    pub fn eval(&self, session: SessionId, expression: &str) -> JsFuture<JsEngineResult<Data>> {
        let expression = expression.to_string();
        self.submit(move |reply| JsRequest::Eval {
            session,
            expression,
            reply,
        })
    }

    /// Executes a script body.
    pub fn execute_script(&self, session: SessionId, code: &str) -> JsFuture<JsEngineResult<Data>> {
        let code = code.to_string();
        self.submit(move |reply| JsRequest::ExecuteScript {
            session,
            code,
            reply,
        })
    }

    /// Checks the syntax of an expression without executing it.
    pub fn validate_expression(
        &self,
        session: SessionId,
        expression: &str,
    ) -> JsFuture<JsEngineResult<()>> {
        let expression = expression.to_string();
        self.submit(move |reply| JsRequest::Validate {
            session,
            expression,
            reply,
        })
    }

    /// Assigns the value of the expression to the location.\
    /// The location must be a declared, legal left-hand-side and must not be
    /// one of the SCXML system variables.
    pub fn assign(
        &self,
        session: SessionId,
        location: &str,
        expression: &str,
    ) -> JsFuture<JsEngineResult<()>> {
        let location = location.to_string();
        let expression = expression.to_string();
        self.submit(move |reply| JsRequest::Assign {
            session,
            location,
            expression,
            reply,
        })
    }

    pub fn set_variable(
        &self,
        session: SessionId,
        name: &str,
        value: Option<Data>,
    ) -> JsFuture<JsEngineResult<()>> {
        let name = name.to_string();
        self.submit(move |reply| JsRequest::SetVariable {
            session,
            name,
            value,
            reply,
        })
    }

    pub fn get_variable(
        &self,
        session: SessionId,
        location: &str,
    ) -> JsFuture<JsEngineResult<Data>> {
        let location = location.to_string();
        self.submit(move |reply| JsRequest::GetVariable {
            session,
            location,
            reply,
        })
    }

    /// Installs system variable "_event".
    pub fn set_event(&self, session: SessionId, event: &Event) -> JsFuture<JsEngineResult<()>> {
        let event = event.get_copy();
        self.submit(move |reply| JsRequest::SetEvent {
            session,
            event,
            reply,
        })
    }

    /// Installs "_sessionid", "_name" and "_ioprocessors", read-only for SCXML code.
    pub fn setup_system_variables(
        &self,
        session: SessionId,
        session_name: Option<String>,
        io_processors: Vec<(String, String)>,
    ) -> JsFuture<JsEngineResult<()>> {
        self.submit(move |reply| JsRequest::SetupSystemVariables {
            session,
            session_name,
            io_processors,
            reply,
        })
    }

    pub fn initialize_read_only(
        &self,
        session: SessionId,
        name: &str,
        value: Data,
    ) -> JsFuture<JsEngineResult<()>> {
        let name = name.to_string();
        self.submit(move |reply| JsRequest::InitializeReadOnly {
            session,
            name,
            value,
            reply,
        })
    }

    /// Registers the "In" predicate (backed by the state table and the session
    /// configuration) and the custom action trampolines.
    pub fn install_functions(
        &self,
        session: SessionId,
        state_name_to_id: HashMap<String, StateId>,
        action_names: Vec<String>,
    ) -> JsFuture<JsEngineResult<()>> {
        self.submit(move |reply| JsRequest::InstallFunctions {
            session,
            state_name_to_id,
            action_names,
            reply,
        })
    }

    /// Evaluates the array expression and returns a shallow copy of its elements,
    /// so that \<foreach\> iterations are not affected by mutation of the source.
    pub fn for_each_snapshot(
        &self,
        session: SessionId,
        array_expression: &str,
    ) -> JsFuture<JsEngineResult<Vec<Data>>> {
        let array_expression = array_expression.to_string();
        self.submit(move |reply| JsRequest::ForEachSnapshot {
            session,
            array_expression,
            reply,
        })
    }

    /// Stops the worker. All sessions are dropped.
    pub fn shutdown(&self) {
        let _ = self.sender.send(JsRequest::Shutdown);
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }
}

impl Default for JsEngine {
    fn default() -> Self {
        JsEngine::new()
    }
}

/// Per-context data for the native callbacks ("In", "__action").
#[derive(JsData, Finalize)]
struct FsmJsWrapper {
    pub global_data: GlobalDataArc,
    pub state_name_to_id: HashMap<String, StateId>,
}

/// Dummy implementation for the Wrapper to enable us to add this class to the context.\
/// Safety: Nothing in this struct needs tracing, so this is safe.
unsafe impl Trace for FsmJsWrapper {
    empty_trace!();
}

struct JsSession {
    context: Context,
    global: GlobalDataArc,
    #[allow(dead_code)]
    parent: Option<SessionId>,
}

struct JsEngineWorker {
    sessions: HashMap<SessionId, JsSession>,
}

fn js_to_string(jv: &JsValue, ctx: &mut Context) -> String {
    match jv.to_string(ctx) {
        Ok(s) => s.to_std_string_escaped(),
        Err(_e) => jv.display().to_string(),
    }
}

fn option_to_js_value(val: &Option<String>) -> JsValue {
    match val {
        Some(s) => JsValue::from(js_string!(s.clone())),
        None => JsValue::Undefined,
    }
}

pub fn data_value_to_js(data: &Data, context: &mut Context) -> JsValue {
    match data {
        Data::Null() => JsValue::Null,
        Data::Integer(v) => {
            if *v >= i32::MIN as i64 && *v <= i32::MAX as i64 {
                JsValue::Integer(*v as i32)
            } else {
                JsValue::Rational(*v as f64)
            }
        }
        Data::Double(v) => JsValue::Rational(*v),
        Data::Boolean(v) => JsValue::Boolean(*v),
        Data::String(v) => JsValue::String(js_string!(v.clone())),
        Data::Array(v) => {
            let js_array = JsArray::new(context);
            for d in v {
                let djs = data_value_to_js(d, context);
                let _ = js_array.push(djs, context);
            }
            JsValue::from(js_array)
        }
        Data::Map(v) => {
            let mut members = Vec::with_capacity(v.len());
            for (key, d) in v {
                members.push((key.clone(), data_value_to_js(d, context)));
            }
            let mut initializer = ObjectInitializer::new(context);
            for (key, djs) in members {
                initializer.property(js_string!(key), djs, Attribute::all());
            }
            JsValue::Object(initializer.build())
        }
    }
}

pub fn js_to_data_value(value: &JsValue, ctx: &mut Context) -> Option<Data> {
    match value.get_type() {
        Type::Undefined => None,
        Type::Null => Some(Data::Null()),
        Type::Boolean => Some(Data::Boolean(value.as_boolean().unwrap())),
        Type::Number => Some(Data::Double(value.as_number().unwrap())),
        Type::Symbol | Type::String => Some(Data::String(js_to_string(value, ctx))),
        Type::BigInt => match value.to_big_int64(ctx) {
            Ok(val) => Some(Data::Integer(val)),
            Err(err) => {
                error!("Can't convert '{:?}' to Data::Integer: {}", value, err);
                Some(Data::Null())
            }
        },
        Type::Object => match value.to_object(ctx) {
            Ok(obj) => {
                if obj.is_array() {
                    let ar = JsArray::from_object(obj.clone()).unwrap();
                    let len = ar.length(ctx).unwrap_or(0) as usize;
                    let mut dv = Vec::with_capacity(len);
                    for i in 0..len {
                        if let Ok(v) = ar.get(i, ctx) {
                            if let Some(av) = js_to_data_value(&v, ctx) {
                                dv.push(av)
                            }
                        }
                    }
                    Some(Data::Array(dv))
                } else {
                    let keys = obj.own_property_keys(ctx).unwrap_or_default();
                    let mut dvm = HashMap::with_capacity(keys.len());
                    for key in &keys {
                        let name = match key {
                            PropertyKey::String(ref name) => name.to_std_string_escaped(),
                            PropertyKey::Symbol(ref name) => name.fn_name().to_std_string_escaped(),
                            PropertyKey::Index(idx) => idx.get().to_string(),
                        };
                        if let Ok(js) = obj.get(key.clone(), ctx) {
                            if let Some(dt) = js_to_data_value(&js, ctx) {
                                dvm.insert(name, dt);
                            }
                        }
                    }
                    Some(Data::Map(dvm))
                }
            }
            Err(err) => {
                error!("Can't convert '{:?}' to Data: {}", value, err);
                Some(Data::Null())
            }
        },
    }
}

lazy_static! {
    /// Legal left-hand-side of an assignment: ident(.ident|[expr])*
    static ref LOCATION_RE: Regex = Regex::new(
        r"^[A-Za-z_$][A-Za-z0-9_$]*(\.[A-Za-z_$][A-Za-z0-9_$]*|\[[^\]]+\])*$"
    )
    .unwrap();
    /// The leading identifier of a location expression.
    static ref LOCATION_HEAD_RE: Regex = Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*").unwrap();
}

/// Checks that a location expression is a legal assignment target.
pub fn is_valid_location(location: &str) -> bool {
    LOCATION_RE.is_match(location)
}

fn location_head(location: &str) -> &str {
    match LOCATION_HEAD_RE.find(location) {
        Some(m) => m.as_str(),
        None => location,
    }
}

impl JsEngineWorker {
    fn new() -> JsEngineWorker {
        JsEngineWorker {
            sessions: HashMap::new(),
        }
    }

    fn run(&mut self, receiver: Receiver<JsRequest>) {
        debug!("ECMAScript worker starting");
        while let Ok(request) = receiver.recv() {
            match request {
                JsRequest::CreateSession {
                    session,
                    parent,
                    global,
                    reply,
                } => {
                    let _ = reply.send(self.create_session(session, parent, global));
                }
                JsRequest::DestroySession { session, reply } => {
                    let r = match self.sessions.remove(&session) {
                        Some(_) => Ok(()),
                        None => Err(JsEngineError::UnknownSession(session)),
                    };
                    let _ = reply.send(r);
                }
                JsRequest::HasSession { session, reply } => {
                    let _ = reply.send(self.sessions.contains_key(&session));
                }
                JsRequest::ActiveSessions { reply } => {
                    let mut ids: Vec<SessionId> = self.sessions.keys().cloned().collect();
                    ids.sort();
                    let _ = reply.send(ids);
                }
                JsRequest::Eval {
                    session,
                    expression,
                    reply,
                } => {
                    let _ = reply.send(self.eval(session, &expression));
                }
                JsRequest::ExecuteScript {
                    session,
                    code,
                    reply,
                } => {
                    let _ = reply.send(self.eval(session, &code));
                }
                JsRequest::Validate {
                    session,
                    expression,
                    reply,
                } => {
                    let _ = reply.send(self.validate(session, &expression));
                }
                JsRequest::Assign {
                    session,
                    location,
                    expression,
                    reply,
                } => {
                    let _ = reply.send(self.assign(session, &location, &expression));
                }
                JsRequest::SetVariable {
                    session,
                    name,
                    value,
                    reply,
                } => {
                    let _ = reply.send(self.set_variable(session, &name, value));
                }
                JsRequest::GetVariable {
                    session,
                    location,
                    reply,
                } => {
                    let _ = reply.send(self.get_variable(session, &location));
                }
                JsRequest::SetEvent {
                    session,
                    event,
                    reply,
                } => {
                    let _ = reply.send(self.set_event(session, &event));
                }
                JsRequest::SetupSystemVariables {
                    session,
                    session_name,
                    io_processors,
                    reply,
                } => {
                    let _ =
                        reply.send(self.setup_system_variables(session, session_name, io_processors));
                }
                JsRequest::InitializeReadOnly {
                    session,
                    name,
                    value,
                    reply,
                } => {
                    let _ = reply.send(self.initialize_read_only(session, &name, &value));
                }
                JsRequest::InstallFunctions {
                    session,
                    state_name_to_id,
                    action_names,
                    reply,
                } => {
                    let _ =
                        reply.send(self.install_functions(session, state_name_to_id, action_names));
                }
                JsRequest::ForEachSnapshot {
                    session,
                    array_expression,
                    reply,
                } => {
                    let _ = reply.send(self.for_each_snapshot(session, &array_expression));
                }
                JsRequest::Shutdown => {
                    break;
                }
            }
        }
        self.sessions.clear();
        debug!("ECMAScript worker finished");
    }

    fn session(&mut self, session: SessionId) -> JsEngineResult<&mut JsSession> {
        self.sessions
            .get_mut(&session)
            .ok_or(JsEngineError::UnknownSession(session))
    }

    fn create_session(
        &mut self,
        session: SessionId,
        parent: Option<SessionId>,
        global: GlobalDataArc,
    ) -> JsEngineResult<()> {
        if self.sessions.contains_key(&session) {
            return Err(JsEngineError::Eval(format!(
                "session #{} already exists",
                session
            )));
        }
        let mut context = ContextBuilder::new()
            .build()
            .map_err(|e| JsEngineError::Eval(e.to_string()))?;

        // Implement "log" function.
        let _ = context.register_global_callable(
            js_string!("log"),
            1,
            NativeFunction::from_copy_closure(Self::log_js),
        );

        self.sessions.insert(
            session,
            JsSession {
                context,
                global,
                parent,
            },
        );
        Ok(())
    }

    fn eval_js(context: &mut Context, source: &str) -> JsResult<JsValue> {
        context.eval(Source::from_bytes(source))
    }

    fn eval(&mut self, session: SessionId, source: &str) -> JsEngineResult<Data> {
        let s = self.session(session)?;
        match Self::eval_js(&mut s.context, source) {
            Ok(value) => Ok(js_to_data_value(&value, &mut s.context).unwrap_or(Data::Null())),
            Err(e) => Err(JsEngineError::Eval(format!("{} => {}", source, e))),
        }
    }

    fn validate(&mut self, session: SessionId, expression: &str) -> JsEngineResult<()> {
        let s = self.session(session)?;
        // Wrapping the expression in a function body checks the syntax
        // without evaluating it.
        let probe = format!(
            "new Function(\"return ({});\");",
            expression.replace('\\', "\\\\").replace('"', "\\\"")
        );
        match Self::eval_js(&mut s.context, probe.as_str()) {
            Ok(_) => Ok(()),
            Err(e) => Err(JsEngineError::Eval(format!("{} => {}", expression, e))),
        }
    }

    fn is_declared(context: &mut Context, name: &str) -> bool {
        let probe = format!("('{}' in globalThis)", name);
        matches!(
            Self::eval_js(context, probe.as_str()),
            Ok(JsValue::Boolean(true))
        )
    }

    fn assign(
        &mut self,
        session: SessionId,
        location: &str,
        expression: &str,
    ) -> JsEngineResult<()> {
        if !is_valid_location(location) {
            return Err(JsEngineError::Eval(format!(
                "'{}' is no legal assignment target",
                location
            )));
        }
        let head = location_head(location);
        if SYSTEM_VARIABLE_NAMES.contains(&head) {
            // W3C: system variables are protected, assignments must fail.
            return Err(JsEngineError::Eval(format!(
                "system variable '{}' is read-only",
                head
            )));
        }
        let s = self.session(session)?;
        if !Self::is_declared(&mut s.context, head) {
            return Err(JsEngineError::NotDeclared(head.to_string()));
        }
        let assignment = format!("{}=({});", location, expression);
        match Self::eval_js(&mut s.context, assignment.as_str()) {
            Ok(_) => Ok(()),
            Err(e) => Err(JsEngineError::Eval(format!("{} => {}", assignment, e))),
        }
    }

    fn set_variable(
        &mut self,
        session: SessionId,
        name: &str,
        value: Option<Data>,
    ) -> JsEngineResult<()> {
        let s = self.session(session)?;
        let js = match &value {
            Some(data) => data_value_to_js(data, &mut s.context),
            None => JsValue::Undefined,
        };
        let r = s
            .context
            .global_object()
            .set(js_string!(name), js, false, &mut s.context);
        r.map(|_| ()).map_err(|e| JsEngineError::Eval(e.to_string()))
    }

    fn get_variable(&mut self, session: SessionId, location: &str) -> JsEngineResult<Data> {
        let head = location_head(location).to_string();
        let s = self.session(session)?;
        if !Self::is_declared(&mut s.context, head.as_str()) {
            return Err(JsEngineError::NotDeclared(head));
        }
        match Self::eval_js(&mut s.context, location) {
            Ok(value) => {
                // Declared but undefined is a legal value, not an error.
                Ok(js_to_data_value(&value, &mut s.context).unwrap_or(Data::Null()))
            }
            Err(e) => Err(JsEngineError::Eval(format!("{} => {}", location, e))),
        }
    }

    fn set_event(&mut self, session: SessionId, event: &Event) -> JsEngineResult<()> {
        let s = self.session(session)?;
        let ctx = &mut s.context;

        let data_value = match &event.param_values {
            None => match &event.content {
                None => JsValue::Undefined,
                Some(c) => data_value_to_js(c, ctx),
            },
            Some(pv) => {
                let mut data = Vec::with_capacity(pv.len());
                for pair in pv.iter() {
                    data.push((
                        js_string!(pair.name.clone()),
                        data_value_to_js(&pair.value, ctx),
                    ));
                }
                let mut data_object_initializer = ObjectInitializer::new(ctx);
                for (dn, dv) in data {
                    data_object_initializer.property(dn, dv, Attribute::all());
                }
                JsValue::Object(data_object_initializer.build())
            }
        };

        let mut event_object_initializer = ObjectInitializer::new(ctx);
        event_object_initializer
            .property(
                js_string!(EVENT_VARIABLE_FIELD_NAME),
                js_string!(event.name.clone()),
                Attribute::READONLY,
            )
            .property(
                js_string!(EVENT_VARIABLE_FIELD_TYPE),
                js_string!(event.etype.name().to_string()),
                Attribute::READONLY,
            )
            .property(
                js_string!(EVENT_VARIABLE_FIELD_SEND_ID),
                option_to_js_value(&event.sendid),
                Attribute::READONLY,
            )
            .property(
                js_string!(EVENT_VARIABLE_FIELD_ORIGIN),
                option_to_js_value(&event.origin),
                Attribute::READONLY,
            )
            .property(
                js_string!(EVENT_VARIABLE_FIELD_ORIGIN_TYPE),
                option_to_js_value(&event.origin_type),
                Attribute::READONLY,
            )
            .property(
                js_string!(EVENT_VARIABLE_FIELD_INVOKE_ID),
                option_to_js_value(&event.invoke_id),
                Attribute::READONLY,
            )
            .property(
                js_string!(EVENT_VARIABLE_FIELD_DATA),
                data_value,
                Attribute::READONLY,
            );
        let event_object = event_object_initializer.build();

        let _ = ctx
            .global_object()
            .delete_property_or_throw(js_string!(EVENT_VARIABLE_NAME), ctx);

        let r = ctx.global_object().define_property_or_throw(
            js_string!(EVENT_VARIABLE_NAME),
            PropertyDescriptor::builder()
                .configurable(true)
                .enumerable(false)
                .writable(false)
                .value(event_object),
            ctx,
        );
        r.map(|_| ()).map_err(|e| JsEngineError::Eval(format!("Failed to set event: {}", e)))
    }

    fn initialize_read_only(
        &mut self,
        session: SessionId,
        name: &str,
        value: &Data,
    ) -> JsEngineResult<()> {
        let s = self.session(session)?;
        let js = data_value_to_js(value, &mut s.context);
        let r = s.context.global_object().define_property_or_throw(
            js_string!(name),
            PropertyDescriptor::builder()
                .configurable(true)
                .enumerable(false)
                .writable(false)
                .value(js),
            &mut s.context,
        );
        r.map(|_| ()).map_err(|e| JsEngineError::Eval(format!("Failed to initialize {}: {}", name, e)))
    }

    fn setup_system_variables(
        &mut self,
        session: SessionId,
        session_name: Option<String>,
        io_processors: Vec<(String, String)>,
    ) -> JsEngineResult<()> {
        self.initialize_read_only(
            session,
            SESSION_ID_VARIABLE_NAME,
            &Data::String(session.to_string()),
        )?;
        if let Some(name) = session_name {
            self.initialize_read_only(session, SESSION_NAME_VARIABLE_NAME, &Data::String(name))?;
        }

        let s = self.session(session)?;
        let ctx = &mut s.context;
        // Create the I/O-Processor entries, each with its "location" member.
        let io_processors_js = JsMap::new(ctx);
        for (name, location) in io_processors {
            let processor_js = JsMap::new(ctx);
            let _ = processor_js.create_data_property(
                js_string!("location"),
                js_string!(location),
                ctx,
            );
            let _ = io_processors_js.create_data_property(js_string!(name), processor_js, ctx);
        }
        let r = ctx.global_object().define_property_or_throw(
            js_string!(SYS_IO_PROCESSORS),
            PropertyDescriptor::builder()
                .configurable(true)
                .enumerable(false)
                .writable(false)
                .value(io_processors_js),
            ctx,
        );
        r.map(|_| ()).map_err(|e| {
            JsEngineError::Eval(format!("Failed to initialize {}: {}", SYS_IO_PROCESSORS, e))
        })
    }

    fn install_functions(
        &mut self,
        session: SessionId,
        state_name_to_id: HashMap<String, StateId>,
        action_names: Vec<String>,
    ) -> JsEngineResult<()> {
        let s = self.session(session)?;
        let ctx = &mut s.context;

        // Implement "In" predicate.
        let _ = ctx.register_global_callable(
            js_string!("__In"),
            1,
            NativeFunction::from_copy_closure(Self::in_configuration),
        );

        // Implement "__action" dispatcher for custom actions.
        let _ = ctx.register_global_callable(
            js_string!("__action"),
            2,
            NativeFunction::from_copy_closure(Self::call_action),
        );

        let fw = FsmJsWrapper {
            global_data: s.global.clone(),
            state_name_to_id,
        };
        let _ = ctx.insert_data(fw);

        let _ = Self::eval_js(
            ctx,
            r##"
                function In(state) {
                   return __In( state );
                }
            "##,
        );

        let mut functions = String::new();
        for name in action_names {
            functions.push_str(
                format!(
                    "function {}(){{ return __action('{}', Array.from(arguments)); }}\n",
                    name, name
                )
                .as_str(),
            );
        }
        if !functions.is_empty() {
            if let Err(err) = Self::eval_js(ctx, functions.as_str()) {
                error!("Failed to add actions: {}", err);
            }
        }
        Ok(())
    }

    fn for_each_snapshot(
        &mut self,
        session: SessionId,
        array_expression: &str,
    ) -> JsEngineResult<Vec<Data>> {
        let s = self.session(session)?;
        let value = Self::eval_js(&mut s.context, array_expression)
            .map_err(|e| JsEngineError::Eval(format!("{} => {}", array_expression, e)))?;
        match value.as_object() {
            Some(obj) if obj.is_array() => {
                let ar = JsArray::from_object(obj.clone()).unwrap();
                let len = ar
                    .length(&mut s.context)
                    .map_err(|e| JsEngineError::Eval(e.to_string()))? as usize;
                let mut items = Vec::with_capacity(len);
                for i in 0..len {
                    let v = ar
                        .get(i, &mut s.context)
                        .map_err(|e| JsEngineError::Eval(e.to_string()))?;
                    items.push(js_to_data_value(&v, &mut s.context).unwrap_or(Data::Null()));
                }
                Ok(items)
            }
            _ => Err(JsEngineError::Eval(format!(
                "'{}' is not a supported collection",
                array_expression
            ))),
        }
    }

    fn in_configuration(
        _this: &JsValue,
        args: &[JsValue],
        context: &mut Context,
    ) -> JsResult<JsValue> {
        let state = args.get_or_undefined(0);
        if let Ok(name) = state.to_string(context) {
            if let Some(fsm) = context.get_data::<FsmJsWrapper>() {
                if let Some(state_id) = fsm.state_name_to_id.get(&name.to_std_string_escaped()) {
                    if fsm
                        .global_data
                        .lock()
                        .configuration
                        .data
                        .contains(state_id)
                    {
                        return Ok(JsValue::Boolean(true));
                    }
                }
            }
        }
        Ok(JsValue::Boolean(false))
    }

    fn call_action(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
        let action_name = js_to_string(args.get_or_undefined(0), ctx);
        let mut arg_list = Vec::<Data>::new();
        {
            let arguments = args.get_or_undefined(1);
            if let Some(obj) = arguments.as_object() {
                if obj.is_array() {
                    let ar = JsArray::from_object(obj.clone()).unwrap();
                    let len = ar.length(ctx).unwrap_or(0) as usize;
                    arg_list.reserve(len);
                    for i in 0..len {
                        if let Ok(v) = ar.get(i, ctx) {
                            if let Some(av) = js_to_data_value(&v, ctx) {
                                arg_list.push(av)
                            }
                        }
                    }
                } else {
                    error!("Arguments must be specified as Array: {:?}", obj);
                }
            }
        }
        let r = if let Some(fsm) = ctx.get_data::<FsmJsWrapper>() {
            let global = fsm.global_data.clone();
            let action = {
                let data = global.lock();
                data.actions.get(action_name.as_str())
            };
            match action {
                Some(action) => action.execute(&arg_list, &global),
                None => Err(format!("Action '{}' not found", action_name)),
            }
        } else {
            Err("Action context not available".to_string())
        };
        match r {
            Ok(v) => Ok(data_value_to_js(&v, ctx)),
            Err(v) => Err(JsError::from_opaque(JsValue::from(js_string!(v)))),
        }
    }

    fn log_js(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
        let mut msg = String::new();
        for arg in args {
            msg.push_str(js_to_string(arg, ctx).as_str());
        }
        println!("{}", msg);
        Ok(JsValue::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datamodel::GlobalDataArc;

    fn engine_with_session(id: SessionId) -> JsEngine {
        let engine = JsEngine::new();
        engine
            .create_session(id, None, GlobalDataArc::new())
            .get()
            .unwrap();
        engine
    }

    #[test]
    fn evaluates_expressions_per_session() {
        let engine = engine_with_session(1);
        assert_eq!(engine.eval(1, "1 + 2").get().unwrap(), Data::Double(3.0));
        assert_eq!(
            engine.eval(1, "'a' + 'b'").get().unwrap(),
            Data::String("ab".to_string())
        );
        engine.shutdown();
    }

    #[test]
    fn sessions_are_isolated() {
        let engine = JsEngine::new();
        engine
            .create_session(1, None, GlobalDataArc::new())
            .get()
            .unwrap();
        engine
            .create_session(2, Some(1), GlobalDataArc::new())
            .get()
            .unwrap();

        engine
            .set_variable(1, "x", Some(Data::Integer(11)))
            .get()
            .unwrap();
        engine
            .set_variable(2, "x", Some(Data::Integer(22)))
            .get()
            .unwrap();

        assert_eq!(engine.eval(1, "x").get().unwrap(), Data::Double(11.0));
        assert_eq!(engine.eval(2, "x").get().unwrap(), Data::Double(22.0));
        engine.shutdown();
    }

    #[test]
    fn undeclared_is_distinguished_from_undefined() {
        let engine = engine_with_session(7);
        match engine.get_variable(7, "ghost").get() {
            Err(JsEngineError::NotDeclared(name)) => assert_eq!(name, "ghost"),
            other => panic!("expected NotDeclared, got {:?}", other),
        }
        // Declared but undefined is a legal value.
        engine.set_variable(7, "present", None).get().unwrap();
        assert_eq!(engine.get_variable(7, "present").get(), Ok(Data::Null()));
        engine.shutdown();
    }

    #[test]
    fn assign_rejects_system_variables_and_bad_locations() {
        let engine = engine_with_session(3);
        assert!(engine.assign(3, "_event", "1").get().is_err());
        assert!(engine.assign(3, "1bad", "1").get().is_err());
        assert!(matches!(
            engine.assign(3, "nope", "1").get(),
            Err(JsEngineError::NotDeclared(_))
        ));
        engine.set_variable(3, "ok", Some(Data::Integer(0))).get().unwrap();
        assert!(engine.assign(3, "ok", "41 + 1").get().is_ok());
        assert_eq!(engine.eval(3, "ok").get().unwrap(), Data::Double(42.0));
        engine.shutdown();
    }

    #[test]
    fn validate_does_not_execute() {
        let engine = engine_with_session(4);
        engine
            .set_variable(4, "counter", Some(Data::Integer(0)))
            .get()
            .unwrap();
        engine.validate_expression(4, "counter = 5").get().unwrap();
        assert_eq!(engine.eval(4, "counter").get().unwrap(), Data::Double(0.0));
        assert!(engine.validate_expression(4, "this is no js").get().is_err());
        engine.shutdown();
    }

    #[test]
    fn session_lifecycle() {
        let engine = engine_with_session(9);
        assert!(engine.has_session(9));
        assert_eq!(engine.active_sessions(), vec![9]);
        engine.destroy_session(9).get().unwrap();
        assert!(!engine.has_session(9));
        assert!(matches!(
            engine.eval(9, "1").get(),
            Err(JsEngineError::UnknownSession(9))
        ));
        engine.shutdown();
    }

    #[test]
    fn system_variables_are_read_only() {
        let engine = engine_with_session(5);
        engine
            .setup_system_variables(
                5,
                Some("machine".to_string()),
                vec![(
                    "http://www.w3.org/TR/scxml/#SCXMLEventProcessor".to_string(),
                    "#_scxml_5".to_string(),
                )],
            )
            .get()
            .unwrap();
        assert_eq!(
            engine.eval(5, "_sessionid").get().unwrap(),
            Data::String("5".to_string())
        );
        assert_eq!(
            engine.eval(5, "_name").get().unwrap(),
            Data::String("machine".to_string())
        );
        // Silent failure in non-strict mode, but the value must not change.
        let _ = engine.eval(5, "_sessionid = 'other'").get();
        assert_eq!(
            engine.eval(5, "_sessionid").get().unwrap(),
            Data::String("5".to_string())
        );
        engine.shutdown();
    }

    #[test]
    fn foreach_snapshot_is_shallow_copy() {
        let engine = engine_with_session(6);
        engine
            .execute_script(6, "var arr = [1,2,3];")
            .get()
            .unwrap();
        let snapshot = engine.for_each_snapshot(6, "arr").get().unwrap();
        assert_eq!(snapshot.len(), 3);
        // Mutating the source afterwards does not change the snapshot.
        engine.execute_script(6, "arr.push(4);").get().unwrap();
        assert_eq!(snapshot.len(), 3);
        engine.shutdown();
    }
}
