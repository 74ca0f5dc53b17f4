//! Defines the API used to access the data models.

use lazy_static::lazy_static;
use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::common::error;
use regex::Regex;

use crate::event_io_processor::EventIOProcessor;
use crate::fsm::{
    vec_to_string, CommonContent, Event, ExecutableContentId, Fsm, GlobalData, InvokeId, ParamPair,
    Parameter, StateId,
};

pub const DATAMODEL_OPTION_PREFIX: &str = "datamodel:";

pub const NULL_DATAMODEL: &str = "NULL";
pub const NULL_DATAMODEL_LC: &str = "null";

pub const SCXML_INVOKE_TYPE: &str = "http://www.w3.org/TR/scxml";

/// W3C: Processors MAY define short form notations as an authoring convenience
/// (e.g., "scxml" as equivalent to http://www.w3.org/TR/scxml/).
pub const SCXML_INVOKE_TYPE_SHORT: &str = "scxml";

pub const SCXML_EVENT_PROCESSOR: &str = "http://www.w3.org/TR/scxml/#SCXMLEventProcessor";

/// Name of system variable "_sessionid".\
/// *W3C says*:\
/// The SCXML Processor MUST bind the variable _sessionid at load time to the system-generated id
/// for the current SCXML session. (This is of type NMTOKEN.) The Processor MUST keep the variable
/// bound to this value until the session terminates.
pub const SESSION_ID_VARIABLE_NAME: &str = "_sessionid";

/// Name of system variable "_name".
/// *W3C says*:\
/// The SCXML Processor MUST bind the variable _name at load time to the value of the 'name'
/// attribute of the \<scxml\> element. The Processor MUST keep the variable bound to this
/// value until the session terminates.
pub const SESSION_NAME_VARIABLE_NAME: &str = "_name";

/// Name of system variable "_event" for events
pub const EVENT_VARIABLE_NAME: &str = "_event";

/// Name of field "name" of system variable "_event"
pub const EVENT_VARIABLE_FIELD_NAME: &str = "name";

/// Name of field "type" of system variable "_event"
pub const EVENT_VARIABLE_FIELD_TYPE: &str = "type";

/// Name of field of system variable "_event" "sendid"
pub const EVENT_VARIABLE_FIELD_SEND_ID: &str = "sendid";

/// Name of field "origin" of system variable "_event"
pub const EVENT_VARIABLE_FIELD_ORIGIN: &str = "origin";

/// Name of field "origintype" of system variable "_event"
pub const EVENT_VARIABLE_FIELD_ORIGIN_TYPE: &str = "origintype";

/// Name of field "invokeid" of system variable "_event"
pub const EVENT_VARIABLE_FIELD_INVOKE_ID: &str = "invokeid";

/// Name of field "data" of system variable "_event"
pub const EVENT_VARIABLE_FIELD_DATA: &str = "data";

/// All names that are reserved for the SCXML processor.
/// SCXML code must not assign to them.
pub const SYSTEM_VARIABLE_NAMES: &[&str] = &[
    EVENT_VARIABLE_NAME,
    SESSION_ID_VARIABLE_NAME,
    SESSION_NAME_VARIABLE_NAME,
    crate::event_io_processor::SYS_IO_PROCESSORS,
];

/// Factory trait to handle creation of data-models dynamically.
pub trait DatamodelFactory: Send {
    /// Create a NEW datamodel.
    fn create(
        &mut self,
        global_data: GlobalDataArc,
        options: &HashMap<String, String>,
    ) -> Box<dyn Datamodel>;
}

/// Gets the global data store from datamodel.
#[macro_export]
macro_rules! get_global {
    ($x:expr) => {
        $x.global().lock()
    };
}

pub type GlobalDataLock<'a> = MutexGuard<'a, GlobalData>;

/// Currently we assume that we need access to the global-data via a mutex.
/// If not, change this type to "GlobalData" and adapt implementation.
#[derive(Clone)]
pub struct GlobalDataArc {
    arc: Arc<Mutex<GlobalData>>,
}

impl Default for GlobalDataArc {
    fn default() -> Self {
        GlobalDataArc::new()
    }
}

impl GlobalDataArc {
    pub fn new() -> GlobalDataArc {
        GlobalDataArc {
            arc: Arc::new(Mutex::new(GlobalData::new())),
        }
    }

    pub fn lock(&self) -> GlobalDataLock {
        self.arc.lock().unwrap()
    }
}

/// Data model interface trait.
/// *W3C says*:
/// The Data Model offers the capability of storing, reading, and modifying a set of data that is internal to the state machine.
/// This specification does not mandate any specific data model, but instead defines a set of abstract capabilities that can
/// be realized by various languages, such as ECMAScript or XML/XPath. Implementations may choose the set of data models that
/// they support. In addition to the underlying data structure, the data model defines a set of expressions as described in
/// 5.9 Expressions. These expressions are used to refer to specific locations in the data model, to compute values to
/// assign to those locations, and to evaluate boolean conditions.\
/// Finally, the data model includes a set of system variables, as defined in 5.10 System Variables, which are automatically maintained
/// by the SCXML processor.
pub trait Datamodel {
    /// Returns the global data.\
    /// As the data model needs access to other global variables and rust doesn't like
    /// accessing data of parents (Fsm in this case) from inside a member (the actual Datamodel), most global data is
    /// store in the "GlobalData" struct that is owned by the data model.
    fn global(&mut self) -> &mut GlobalDataArc;

    fn global_s(&self) -> &GlobalDataArc;

    /// Get the name of the data model as defined by the \<scxml\> attribute "datamodel".
    fn get_name(&self) -> &str;

    /// Adds the "In" predicate and other functions.\
    /// If needed, adds also the "log" function and sets '_ioprocessors'.
    fn add_functions(&mut self, fsm: &Fsm);

    /// Initialize the data model for one data-store.
    /// This method is called for the global data and for the data of each state.
    /// If "set_data" is false, the variables are only declared but left undefined
    /// (used for late binding).
    #[allow(non_snake_case)]
    fn initializeDataModel(&mut self, fsm: &mut Fsm, data_state: StateId, set_data: bool);

    /// Initialize a global read-only variable.
    fn initialize_read_only(&mut self, name: &str, value: Data);

    /// Sets a global variable.
    fn set(&mut self, name: &str, data: Data);

    /// Sets system variable "_event"
    fn set_event(&mut self, event: &Event);

    /// Execute an assign expression.
    /// Returns true if the assignment was correct. On errors "error.execution"
    /// is put in the internal queue and false is returned.
    fn assign(&mut self, left_expr: &str, right_expr: &str) -> bool;

    /// Gets a global variable by a location expression.\
    /// Undeclared locations and invalid expressions are reported as Err,
    /// the caller decides which error event to raise.
    fn get_by_location(&mut self, location: &str) -> Result<Data, String>;

    /// Convenient function to retrieve a value that has an alternative expression-value.\
    /// If value_expression is empty, Ok(value) is returned (if empty or not). If the expression
    /// results in an error, Err(message) is returned and "error.execution" is put in the internal queue.
    fn get_expression_alternative_value(
        &mut self,
        value: &str,
        value_expression: &str,
    ) -> Result<String, String> {
        if value_expression.is_empty() {
            Ok(value.to_string())
        } else {
            match self.evaluate(value_expression) {
                Err(msg) => {
                    self.internal_error_execution();
                    Err(msg)
                }
                Ok(value) => Ok(value.string_value()),
            }
        }
    }

    /// Get an _ioprocessor by type name.
    fn get_io_processor(&mut self, name: &str) -> Option<Arc<Mutex<Box<dyn EventIOProcessor>>>> {
        self.global().lock().io_processors.get(name).cloned()
    }

    /// Send an event via io-processor.
    fn send(&mut self, io_processor: &str, target: &str, event: Event) -> bool {
        let ioc = self.get_io_processor(io_processor);
        if let Some(ic) = ioc {
            let global = self.global().clone();
            let mut icg = ic.lock().unwrap();
            icg.send(&global, target, event)
        } else {
            false
        }
    }

    /// Releases all session resources of this datamodel.
    /// Called when the session terminates.
    fn clear(&mut self);

    /// "log" function, used for \<log\> content.
    fn log(&mut self, msg: &str);

    /// Executes a script.\
    /// If the script execution fails, "error.execution" is put
    /// inside the internal event queue.
    fn execute(&mut self, script: &str) -> Result<String, String>;

    /// Evaluates an expression and returns the resulting data value.
    fn evaluate(&mut self, expression: &str) -> Result<Data, String>;

    /// Executes a for-each loop.
    /// W3C requires that the iteration works on a shallow copy of the collection,
    /// mutations of the source inside the body must not affect the iteration.
    fn execute_for_each(
        &mut self,
        array_expression: &str,
        item: &str,
        index: &str,
        execute_body: &mut dyn FnMut(&mut dyn Datamodel) -> bool,
    ) -> bool;

    /// *W3C says*:\
    /// The set of operators in conditional expressions varies depending on the data model,
    /// but all data models must support the 'In()' predicate, which takes a state ID as its
    /// argument and returns true if the state machine is in that state.\
    /// Conditional expressions in conformant SCXML documents should not have side effects.
    /// #Actual Implementation:
    /// As no side effects shall occur, this method should be "&self". But we assume that most script-engines have
    /// no read-only "eval" function and such method may be hard to implement.
    fn execute_condition(&mut self, script: &str) -> Result<bool, String>;

    /// Executes content by id. Returns false if the block was aborted by some failing element.
    #[allow(non_snake_case)]
    fn executeContent(&mut self, fsm: &Fsm, contentId: ExecutableContentId) -> bool;

    /// *W3C says*:\
    /// Indicates that an error internal to the execution of the document has occurred, such as one
    /// arising from expression evaluation.
    fn internal_error_execution_for_event(
        &mut self,
        send_id: &Option<String>,
        invoke_id: &Option<InvokeId>,
    ) {
        get_global!(self).enqueue_internal(Event::error_execution(send_id, invoke_id));
    }

    /// *W3C says*:\
    /// Indicates that an error internal to the execution of the document has occurred, such as one
    /// arising from expression evaluation.
    fn internal_error_execution(&mut self) {
        get_global!(self).enqueue_internal(Event::error_execution(&None, &None));
    }

    /// *W3C says*:\
    /// Indicates that an error has occurred while trying to communicate with an external entity.
    fn internal_error_communication(&mut self, event: &Event) {
        get_global!(self).enqueue_internal(Event::error_communication(event));
    }

    /// Evaluates a content element.\
    /// Returns the static content or executes the expression.
    fn evaluate_content(&mut self, content: &Option<CommonContent>) -> Option<Data> {
        match content {
            None => None,
            Some(ct) => match &ct.content_expr {
                None => ct.content.as_ref().map(|text| Data::from_json_text(text)),
                Some(expr) => {
                    match self.evaluate(expr.as_str()) {
                        Err(msg) => {
                            // W3C:\
                            // If the evaluation of 'expr' produces an error, the Processor must place
                            // error.execution in the internal event queue and use the empty string as
                            // the value of the <content> element.
                            error!("content expr '{}' is invalid ({})", expr, msg);
                            self.internal_error_execution();
                            None
                        }
                        Ok(value) => Some(value),
                    }
                }
            },
        }
    }

    /// Evaluates a list of Param-elements and appends the resulting pairs.
    /// Returns false if some param was invalid. The raised "error.execution"
    /// carries the given send-id, if the params belong to a \<send\>.
    fn evaluate_params(
        &mut self,
        params: &Option<Vec<Parameter>>,
        values: &mut Vec<ParamPair>,
        send_id: &Option<String>,
    ) -> bool {
        match &params {
            None => true,
            Some(params) => {
                let mut ok = true;
                for param in params {
                    if !param.location.is_empty() {
                        match self.get_by_location(&param.location) {
                            Err(msg) => {
                                // W3C:\
                                // If the 'location' attribute does not refer to a valid location in
                                // the data model, ..., the SCXML Processor must place the error
                                // 'error.execution' on the internal event queue and must ignore the name
                                // and value.
                                error!("location of param {} is invalid ({})", param, msg);
                                self.internal_error_execution_for_event(send_id, &None);
                                ok = false;
                            }
                            Ok(value) => {
                                values.push(ParamPair::new_moved(param.name.clone(), value));
                            }
                        }
                    } else if !param.expr.is_empty() {
                        match self.evaluate(param.expr.as_str()) {
                            Err(msg) => {
                                // W3C:\
                                // ...if the evaluation of the 'expr' produces an error, the SCXML
                                // Processor must place the error 'error.execution' on the internal event
                                // queue and must ignore the name and value.
                                error!("expr of param {} is invalid ({})", param, msg);
                                self.internal_error_execution_for_event(send_id, &None);
                                ok = false;
                            }
                            Ok(value) => {
                                values.push(ParamPair::new_moved(param.name.clone(), value));
                            }
                        }
                    }
                }
                ok
            }
        }
    }

    /// Copies the values of the listed datamodel locations.
    /// Returns false if some location was invalid.
    fn evaluate_name_list(
        &mut self,
        names: &[String],
        values: &mut Vec<ParamPair>,
        send_id: &Option<String>,
    ) -> bool {
        for name in names {
            match self.get_by_location(name) {
                Err(msg) => {
                    error!("namelist entry '{}' is invalid ({})", name, msg);
                    self.internal_error_execution_for_event(send_id, &None);
                    return false;
                }
                Ok(value) => {
                    values.push(ParamPair::new_moved(name.clone(), value));
                }
            }
        }
        true
    }
}

/// ## W3C says:
/// ###B.1 The Null Data Model
/// The value "null" for the 'datamodel' attribute results in an absent or empty data model. In particular:
/// - B.1.1 Data Model
///
///   There is no underlying data model.
/// - B.1.2 Conditional Expressions
///
///   The boolean expression language consists of the In predicate only. It has the form 'In(id)',
///   where id is the id of a state in the enclosing state machine.
///   The predicate must return 'true' if and only if that state is in the current state configuration.
/// - B.1.3 Location Expressions
///
///   There is no location expression language.
/// - B.1.4 Value Expressions
///
///   There is no value expression language.
/// - B.1.5 Scripting
///
///   There is no scripting language.
/// - B.1.6 System Variables
///
///   System variables are not accessible.
/// - B.1.7 Unsupported Elements
///
///   The \<foreach\> element and the elements defined in 5 Data Model and Data Manipulation are not
///   supported in the Null Data Model.
pub struct NullDatamodel {
    pub global: GlobalDataArc,
    pub state_name_to_id: HashMap<String, StateId>,
}

pub struct NullDatamodelFactory {}

impl DatamodelFactory for NullDatamodelFactory {
    fn create(
        &mut self,
        global_data: GlobalDataArc,
        _options: &HashMap<String, String>,
    ) -> Box<dyn Datamodel> {
        Box::new(NullDatamodel::new(global_data))
    }
}

impl NullDatamodel {
    pub fn new(global_data: GlobalDataArc) -> NullDatamodel {
        NullDatamodel {
            global: global_data,
            state_name_to_id: HashMap::new(),
        }
    }
}

impl Datamodel for NullDatamodel {
    fn global(&mut self) -> &mut GlobalDataArc {
        &mut self.global
    }

    fn global_s(&self) -> &GlobalDataArc {
        &self.global
    }

    fn get_name(&self) -> &str {
        NULL_DATAMODEL
    }

    fn add_functions(&mut self, fsm: &Fsm) {
        for state in fsm.states.as_slice() {
            self.state_name_to_id.insert(state.name.clone(), state.id);
        }
    }

    #[allow(non_snake_case)]
    fn initializeDataModel(&mut self, _fsm: &mut Fsm, _data_state: StateId, _set_data: bool) {
        // nothing to do
    }

    fn initialize_read_only(&mut self, _name: &str, _value: Data) {
        // nothing to do
    }

    fn set(&mut self, _name: &str, _data: Data) {
        // nothing to do
    }

    fn set_event(&mut self, _event: &Event) {
        // nothing to do
    }

    fn assign(&mut self, _left_expr: &str, _right_expr: &str) -> bool {
        // nothing to do
        true
    }

    fn get_by_location(&mut self, _name: &str) -> Result<Data, String> {
        Err("unimplemented".to_string())
    }

    fn clear(self: &mut NullDatamodel) {}

    fn log(self: &mut NullDatamodel, msg: &str) {
        println!("{}", msg);
    }

    fn execute(&mut self, _script: &str) -> Result<String, String> {
        Err("unimplemented".to_string())
    }

    fn evaluate(&mut self, _expression: &str) -> Result<Data, String> {
        Err("unimplemented".to_string())
    }

    fn execute_for_each(
        &mut self,
        _array_expression: &str,
        _item: &str,
        _index: &str,
        _execute_body: &mut dyn FnMut(&mut dyn Datamodel) -> bool,
    ) -> bool {
        // nothing to do
        true
    }

    /// *W3C says*:
    /// The boolean expression language consists of the In predicate only.
    /// It has the form 'In(id)', where id is the id of a state in the enclosing state machine.
    /// The predicate must return 'true' if and only if that state is in the current state configuration.
    fn execute_condition(&mut self, script: &str) -> Result<bool, String> {
        lazy_static! {
            static ref IN_RE: Regex = Regex::new(r"In\((.*)\)").unwrap();
        }

        let caps = IN_RE.captures(script);
        if caps.is_none() {
            Ok(false)
        } else {
            let mut value = caps.unwrap().get(1).map_or("", |m| m.as_str()).trim();
            if value.starts_with('\'') && value.ends_with('\'') {
                value = &value[1..value.len() - 1];
            }
            match self.state_name_to_id.get(value) {
                None => Ok(false),
                Some(state_id) => Ok(self.global.lock().configuration.data.contains(state_id)),
            }
        }
    }

    #[allow(non_snake_case)]
    fn executeContent(&mut self, fsm: &Fsm, content_id: ExecutableContentId) -> bool {
        if let Some(ec) = fsm.executableContent.get(&content_id) {
            for e in ec.iter() {
                if !e.execute(self, fsm) {
                    return false;
                }
            }
        }
        true
    }
}

/// Data Variant used to handle data type-safe but
/// Datamodel-agnostic way.
#[derive(Clone, PartialEq)]
pub enum Data {
    Integer(i64),
    Double(f64),
    String(String),
    Boolean(bool),
    Array(Vec<Data>),
    Map(HashMap<String, Data>),
    Null(),
}

impl Data {
    pub fn new(value: &str) -> Data {
        Data::String(value.to_string())
    }

    /// The plain text of the value, without the quotes
    /// the Display implementation puts around strings.
    pub fn string_value(&self) -> String {
        match self {
            Data::String(v) => v.clone(),
            Data::Null() => String::new(),
            other => format!("{}", other),
        }
    }

    /// W3C requires that the processor re-formats payloads to match its data model
    /// but must not otherwise modify them. Content that parses as JSON is taken
    /// as the structured value, anything else is passed through as a string.
    pub fn from_json_text(text: &str) -> Data {
        match serde_json::from_str::<serde_json::Value>(text.trim()) {
            Ok(value) => Data::from_json(&value),
            Err(_) => Data::String(text.to_string()),
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Data {
        match value {
            serde_json::Value::Null => Data::Null(),
            serde_json::Value::Bool(b) => Data::Boolean(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Data::Integer(i)
                } else {
                    Data::Double(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Data::String(s.clone()),
            serde_json::Value::Array(a) => Data::Array(a.iter().map(Data::from_json).collect()),
            serde_json::Value::Object(o) => {
                let mut m = HashMap::with_capacity(o.len());
                for (k, v) in o {
                    m.insert(k.clone(), Data::from_json(v));
                }
                Data::Map(m)
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Data::Null() => serde_json::Value::Null,
            Data::Boolean(b) => serde_json::Value::Bool(*b),
            Data::Integer(i) => serde_json::Value::from(*i),
            Data::Double(d) => serde_json::Value::from(*d),
            Data::String(s) => serde_json::Value::String(s.clone()),
            Data::Array(a) => serde_json::Value::Array(a.iter().map(Data::to_json).collect()),
            Data::Map(m) => {
                let mut o = serde_json::Map::with_capacity(m.len());
                for (k, v) in m {
                    o.insert(k.clone(), v.to_json());
                }
                serde_json::Value::Object(o)
            }
        }
    }
}

impl Debug for Data {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self) // Display
    }
}

impl Display for Data {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self {
            Data::String(v) => {
                write!(f, "'{}'", v)
            }
            Data::Integer(v) => {
                write!(f, "{}", v)
            }
            Data::Double(v) => {
                write!(f, "{}", v)
            }
            Data::Boolean(v) => {
                write!(f, "{}", v)
            }
            Data::Array(v) => {
                write!(f, "{}", vec_to_string(v))
            }
            Data::Map(v) => {
                write!(f, "{:?}", v)
            }
            Data::Null() => {
                write!(f, "Null")
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct DataStore {
    pub values: HashMap<String, Data>,
}

impl DataStore {
    pub fn new() -> DataStore {
        DataStore {
            values: HashMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Data> {
        self.values.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Data> {
        self.values.get_mut(key)
    }

    pub fn set(&mut self, key: &str, data: Data) {
        self.values.insert(key.to_string(), data);
    }
}

#[cfg(test)]
mod tests {
    use super::Data;

    #[test]
    fn data_string_value_strips_quotes() {
        assert_eq!(Data::String("abc".to_string()).string_value(), "abc");
        assert_eq!(Data::Integer(42).string_value(), "42");
        assert_eq!(Data::Null().string_value(), "");
    }

    #[test]
    fn content_is_reformatted_but_not_modified() {
        match Data::from_json_text("{\"v\": 42}") {
            Data::Map(m) => {
                assert_eq!(m.get("v"), Some(&Data::Integer(42)));
            }
            other => panic!("expected map, got {}", other),
        }
        // Not JSON: passed through unchanged.
        assert_eq!(
            Data::from_json_text("some plain text"),
            Data::String("some plain text".to_string())
        );
    }
}
