//! Implementation of "executable content" elements.\
//! See [W3C:Executable Content](https://www.w3.org/TR/scxml/#executable).
//!
//! Every element returns false if the containing block must be aborted:
//! W3C requires that a failing element stops the execution of the remaining
//! elements of its block.

use std::fmt;
use std::fmt::{Debug, Display, Formatter};

use lazy_static::lazy_static;
use regex::Regex;

use crate::common::{error, info, warn};

use crate::datamodel::{Data, Datamodel, SCXML_EVENT_PROCESSOR};
use crate::event_io_processor::scxml_event_io_processor::SCXML_TARGET_INTERNAL;
use crate::fsm::{
    opt_vec_to_string, Cancel, Event, EventType, ExecutableContentId, Fsm, ParamPair, Parameter,
    SendParameters,
};
use crate::get_global;

pub const TYPE_IF: &str = "if";
pub const TYPE_EXPRESSION: &str = "expression";
pub const TYPE_SCRIPT: &str = "script";
pub const TYPE_LOG: &str = "log";
pub const TYPE_FOREACH: &str = "foreach";
pub const TYPE_SEND: &str = "send";
pub const TYPE_RAISE: &str = "raise";
pub const TYPE_CANCEL: &str = "cancel";
pub const TYPE_ASSIGN: &str = "assign";

pub trait ExecutableContent: Debug + Send {
    /// Executes the element. Returns false if the enclosing block shall be aborted.
    fn execute(&self, datamodel: &mut dyn Datamodel, fsm: &Fsm) -> bool;
    fn get_type(&self) -> &str;
}

/// Holds a block of sub-content, used for the global \<script\> element.
#[derive(Debug)]
pub struct Script {
    pub content: Vec<ExecutableContentId>,
}

/// A raw script or expression body.
#[derive(Debug)]
pub struct Expression {
    pub content: String,
}

#[derive(Debug)]
pub struct Log {
    pub label: String,
    pub expression: String,
}

#[derive(Debug)]
pub struct If {
    pub condition: String,
    pub content: ExecutableContentId,
    pub else_content: ExecutableContentId,
}

#[derive(Debug)]
pub struct ForEach {
    pub array: String,
    pub item: String,
    pub index: String,
    pub content: ExecutableContentId,
}

/// *W3C says*:
/// The \<raise\> element raises an event in the current SCXML session.\
/// Note that the event will not be processed until the current block of executable content has completed
/// and all events that are already in the internal event queue have been processed. For example, suppose
/// the \<raise\> element occurs first in the \<onentry\> handler of state S followed by executable content
/// elements ec1 and ec2. If event e1 is already in the internal event queue when S is entered, the event
/// generated by \<raise\> will not be processed until ec1 and ec2 have finished execution and e1 has been
/// processed.
pub struct Raise {
    pub event: String,
}

pub struct Assign {
    pub location: String,
    pub expr: String,
}

impl Assign {
    pub fn new() -> Assign {
        Assign {
            location: String::new(),
            expr: String::new(),
        }
    }
}

impl Default for Assign {
    fn default() -> Self {
        Assign::new()
    }
}

impl Debug for Assign {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Assign")
            .field("location", &self.location)
            .field("expr", &self.expr)
            .finish()
    }
}

impl ExecutableContent for Assign {
    fn execute(&self, datamodel: &mut dyn Datamodel, _fsm: &Fsm) -> bool {
        datamodel.assign(self.location.as_str(), self.expr.as_str())
    }

    fn get_type(&self) -> &str {
        TYPE_ASSIGN
    }
}

impl Raise {
    pub fn new() -> Raise {
        Raise {
            event: String::new(),
        }
    }
}

impl Default for Raise {
    fn default() -> Self {
        Raise::new()
    }
}

impl Debug for Raise {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Raise").field("event", &self.event).finish()
    }
}

impl ExecutableContent for Raise {
    fn execute(&self, datamodel: &mut dyn Datamodel, _fsm: &Fsm) -> bool {
        let mut event = Event::new_simple(self.event.as_str());
        event.etype = EventType::internal;
        get_global!(datamodel).enqueue_internal(event);
        true
    }

    fn get_type(&self) -> &str {
        TYPE_RAISE
    }
}

impl Script {
    pub fn new() -> Script {
        Script {
            content: Vec::new(),
        }
    }
}

impl Default for Script {
    fn default() -> Self {
        Script::new()
    }
}

impl ExecutableContent for Script {
    fn execute(&self, datamodel: &mut dyn Datamodel, fsm: &Fsm) -> bool {
        for s in &self.content {
            if !datamodel.executeContent(fsm, *s) {
                return false;
            }
        }
        true
    }

    fn get_type(&self) -> &str {
        TYPE_SCRIPT
    }
}

impl Expression {
    pub fn new() -> Expression {
        Expression {
            content: String::new(),
        }
    }
}

impl Default for Expression {
    fn default() -> Self {
        Expression::new()
    }
}

impl ExecutableContent for Expression {
    fn execute(&self, datamodel: &mut dyn Datamodel, _fsm: &Fsm) -> bool {
        match datamodel.execute(&self.content) {
            Ok(_) => true,
            Err(_) => {
                datamodel.internal_error_execution();
                false
            }
        }
    }

    fn get_type(&self) -> &str {
        TYPE_EXPRESSION
    }
}

impl Log {
    pub fn new(label: &Option<&String>, expression: &str) -> Log {
        Log {
            label: label.unwrap_or(&"".to_string()).clone(),
            expression: expression.to_string(),
        }
    }
}

impl ExecutableContent for Log {
    /// \<log\> never aborts the block, a failing expression only raises
    /// "error.execution".
    fn execute(&self, datamodel: &mut dyn Datamodel, _fsm: &Fsm) -> bool {
        if self.expression.is_empty() {
            datamodel.log(self.label.as_str());
            return true;
        }
        match datamodel.evaluate(&self.expression) {
            Ok(value) => {
                let msg = value.string_value();
                if self.label.is_empty() {
                    datamodel.log(msg.as_str());
                } else {
                    datamodel.log(format!("{}: {}", self.label, msg).as_str());
                }
            }
            Err(msg) => {
                warn!("log expr '{}' failed. {}", self.expression, msg);
                datamodel.internal_error_execution();
            }
        }
        true
    }

    fn get_type(&self) -> &str {
        TYPE_LOG
    }
}

impl If {
    pub fn new(condition: &str) -> If {
        If {
            condition: condition.to_string(),
            content: 0,
            else_content: 0,
        }
    }
}

impl ExecutableContent for If {
    fn execute(&self, datamodel: &mut dyn Datamodel, fsm: &Fsm) -> bool {
        match datamodel.execute_condition(&self.condition) {
            Ok(r) => {
                if r {
                    if self.content != 0 {
                        return datamodel.executeContent(fsm, self.content);
                    }
                } else if self.else_content != 0 {
                    return datamodel.executeContent(fsm, self.else_content);
                }
                true
            }
            Err(e) => {
                warn!("Condition {} can't be evaluated. {}", self.condition, e);
                datamodel.internal_error_execution();
                false
            }
        }
    }

    fn get_type(&self) -> &str {
        TYPE_IF
    }
}

pub const INDEX_TEMP: &str = "__$index";

impl ForEach {
    pub fn new() -> ForEach {
        ForEach {
            array: "".to_string(),
            item: "".to_string(),
            index: "".to_string(),
            content: 0,
        }
    }
}

impl Default for ForEach {
    fn default() -> Self {
        ForEach::new()
    }
}

impl ExecutableContent for ForEach {
    fn execute(&self, datamodel: &mut dyn Datamodel, fsm: &Fsm) -> bool {
        let idx = if self.index.is_empty() {
            INDEX_TEMP.to_string()
        } else {
            self.index.clone()
        };
        datamodel.execute_for_each(&self.array, &self.item, &idx, &mut |datamodel| {
            if self.content != 0 {
                datamodel.executeContent(fsm, self.content)
            } else {
                true
            }
        })
    }

    fn get_type(&self) -> &str {
        TYPE_FOREACH
    }
}

impl Parameter {
    pub fn new() -> Parameter {
        Parameter {
            name: "".to_string(),
            expr: "".to_string(),
            location: "".to_string(),
        }
    }
}

impl Default for Parameter {
    fn default() -> Self {
        Parameter::new()
    }
}

impl Display for Parameter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Parameter{{name:{} expr:{} location:{}}}",
            self.name, self.expr, self.location
        )
    }
}

impl ExecutableContent for Cancel {
    /// W3C: The \<cancel\> element is used to cancel a delayed \<send\> event.
    /// The SCXML Processor must NOT raise an error if the sendid does not
    /// correspond to an existing delayed event.
    fn execute(&self, datamodel: &mut dyn Datamodel, _fsm: &Fsm) -> bool {
        let send_id =
            match datamodel.get_expression_alternative_value(&self.send_id, &self.send_id_expr) {
                Ok(value) => value,
                Err(_) => {
                    // Error -> abort
                    return false;
                }
            };

        let scheduler = match &get_global!(datamodel).executor {
            Some(executor) => executor.scheduler.clone(),
            None => {
                error!("Cancel: executor not available");
                return false;
            }
        };
        scheduler.cancel(send_id.as_str());
        true
    }

    fn get_type(&self) -> &str {
        TYPE_CANCEL
    }
}

/// Implements the execution of the \<send\> element.
impl ExecutableContent for SendParameters {
    /// If unable to dispatch, place "error.communication" in the internal queue.\
    /// If the target is not supported, place "error.execution" in the internal queue.\
    /// Any sub-evaluation failure raises "error.execution" carrying this send's id
    /// and aborts the block.
    fn execute(&self, datamodel: &mut dyn Datamodel, _fsm: &Fsm) -> bool {
        let global_clone = datamodel.global().clone();

        let (session_id, caller_invoke_id, executor) = {
            let global = get_global!(datamodel);
            match &global.executor {
                Some(executor) => (
                    global.session_id,
                    global.caller_invoke_id.clone(),
                    executor.clone(),
                ),
                None => {
                    error!("Send: executor not available");
                    return false;
                }
            }
        };

        let send_id = if self.name_location.is_empty() {
            if self.name.is_empty() {
                None
            } else {
                Some(self.name.clone())
            }
        } else {
            // W3C: If 'idlocation' is present, the Processor must generate an id
            // and store it in this location when the element is evaluated.
            let id = executor.scheduler.next_send_id();
            datamodel.set(self.name_location.as_str(), Data::String(id.clone()));
            Some(id)
        };

        let target =
            match datamodel.get_expression_alternative_value(&self.target, &self.target_expr) {
                Ok(value) => value,
                Err(_) => {
                    datamodel.internal_error_execution_for_event(&send_id, &None);
                    return false;
                }
            };

        // W3C (tests 159, 194): a target that is no valid URI, e.g. starting
        // with "!", raises error.execution and stops the block.
        if target.starts_with('!') {
            error!("Send: target '{}' is invalid", target);
            datamodel.internal_error_execution_for_event(&send_id, &None);
            return false;
        }

        let event_name =
            match datamodel.get_expression_alternative_value(&self.event, &self.event_expr) {
                Ok(value) => value,
                Err(_) => {
                    datamodel.internal_error_execution_for_event(&send_id, &None);
                    return false;
                }
            };

        let mut data_values: Vec<ParamPair> = Vec::new();
        if !self.name_list.is_empty() {
            let names: Vec<String> = self
                .name_list
                .split_ascii_whitespace()
                .map(|s| s.to_string())
                .collect();
            if !datamodel.evaluate_name_list(&names, &mut data_values, &send_id) {
                return false;
            }
        }
        if !datamodel.evaluate_params(&self.params, &mut data_values, &send_id) {
            return false;
        }

        let content = datamodel.evaluate_content(&self.content);

        let delay_ms = if !self.delay_expr.is_empty() {
            match datamodel.evaluate(&self.delay_expr) {
                Err(_) => {
                    datamodel.internal_error_execution_for_event(&send_id, &None);
                    return false;
                }
                Ok(delay) => parse_duration_to_milliseconds(&delay.string_value()),
            }
        } else {
            self.delay_ms as i64
        };

        // Un-parseable delay text counts as "no delay".
        let delay_ms = delay_ms.max(0);

        if delay_ms > 0 && target.eq(SCXML_TARGET_INTERNAL) {
            // Can't delay events for the internal queue.
            error!("Send: illegal delay for target {}", target);
            datamodel.internal_error_execution_for_event(&send_id, &None);
            return false;
        }

        let type_result =
            datamodel.get_expression_alternative_value(&self.type_value, &self.type_expr);
        let type_val = match type_result {
            Ok(val) => val,
            Err(err) => {
                error!("Failed to evaluate send type: {}", err);
                datamodel.internal_error_execution_for_event(&send_id, &None);
                return false;
            }
        };

        let mut type_val_str = type_val.as_str();
        if type_val_str.is_empty() || type_val_str == "scxml" {
            type_val_str = SCXML_EVENT_PROCESSOR;
        }

        match datamodel.get_io_processor(type_val_str) {
            Some(iop) => {
                let event = Event {
                    name: event_name,
                    etype: EventType::external,
                    sendid: send_id.clone(),
                    origin: None,
                    origin_type: None,
                    invoke_id: caller_invoke_id,
                    param_values: if data_values.is_empty() {
                        None
                    } else {
                        Some(data_values)
                    },
                    content,
                };

                info!("schedule {} for {}ms", event, delay_ms);

                let dispatcher = executor.dispatcher();
                match dispatcher.dispatch(
                    iop,
                    global_clone,
                    target,
                    event,
                    delay_ms,
                    send_id.clone(),
                    session_id,
                ) {
                    Ok(_effective_id) => true,
                    Err(msg) => {
                        // A send-id that is still scheduled was re-used.
                        error!("Send: {}", msg);
                        datamodel.internal_error_execution_for_event(&send_id, &None);
                        false
                    }
                }
            }
            None => {
                // W3C: If the SCXML Processor does not support the type or the
                // target, it must place the event error.communication on the
                // internal event queue.
                error!("Send: no I/O processor for type '{}'", type_val_str);
                let mut error_event = Event::error("communication");
                error_event.sendid = send_id.clone();
                get_global!(datamodel).enqueue_internal(error_event);
                false
            }
        }
    }

    fn get_type(&self) -> &str {
        TYPE_SEND
    }
}

impl Display for SendParameters {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Send{{event:{} target:{} delay:{} params:{}}}",
            self.event,
            self.target,
            self.delay_ms,
            opt_vec_to_string(&self.params)
        )
    }
}

/// Parses a duration according to the CSS2 time surface used by SCXML:
/// `<number>(s|ms|min|h)`.\
/// Returns -1 for text that does not match, the caller decides whether
/// this counts as "no delay" or an error.
pub fn parse_duration_to_milliseconds(d: &str) -> i64 {
    lazy_static! {
        static ref DURATION_RE: Regex = Regex::new(r"^(\d*(\.\d+)?)(ms|s|min|h)$").unwrap();
    }
    if d.is_empty() {
        0
    } else {
        let lowered = d.trim().to_lowercase();
        let caps = DURATION_RE.captures(lowered.as_str());
        match caps {
            None => -1,
            Some(cap) => {
                let value = cap.get(1).map_or("", |m| m.as_str());
                let unit = cap.get(3).map_or("", |m| m.as_str());

                if value.is_empty() {
                    0
                } else {
                    let mut v: f64 = value.parse::<f64>().unwrap();
                    match unit {
                        "h" => {
                            v = v * 60.0 * 60.0 * 1000.0;
                        }
                        "min" => {
                            v *= 60000.0;
                        }
                        "s" => {
                            v *= 1000.0;
                        }
                        "ms" => {}
                        _ => {
                            return -1;
                        }
                    }
                    v.round() as i64
                }
            }
        }
    }
}

#[allow(dead_code)]
pub(crate) fn type_names(content: &[Box<dyn ExecutableContent>]) -> Vec<String> {
    content.iter().map(|c| c.get_type().to_string()).collect()
}

#[cfg(test)]
mod tests {
    use crate::executable_content::parse_duration_to_milliseconds;

    #[test]
    fn delay_parse() {
        assert_eq!(parse_duration_to_milliseconds("6.7s"), 6700);
        assert_eq!(parse_duration_to_milliseconds("1min"), 60 * 1000);
        assert_eq!(parse_duration_to_milliseconds("0.5h"), 30 * 60 * 1000);
        assert_eq!(parse_duration_to_milliseconds("0.001s"), 1);
        assert_eq!(parse_duration_to_milliseconds("100ms"), 100);
        assert_eq!(parse_duration_to_milliseconds("6.7S"), 6700);
        assert_eq!(parse_duration_to_milliseconds(""), 0);

        assert_eq!(parse_duration_to_milliseconds("x1s"), -1);
        assert_eq!(parse_duration_to_milliseconds("1sx"), -1);
        assert_eq!(parse_duration_to_milliseconds("1d"), -1);
    }
}
