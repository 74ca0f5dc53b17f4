//! Implements the SCXML Data model for ECMAScript.\
//! Included if feature "ECMAScriptModel" is enabled.\
//! See [W3C:The ECMAScript Data Model](https://www.w3.org/TR/scxml/#ecma-profile).
//!
//! This is a thin per-session facade: all evaluation is delegated to the
//! [JsEngine](crate::js_engine::JsEngine) worker, which serializes the requests of all sessions.

use std::collections::HashMap;

use crate::common::{error, info};

use crate::datamodel::{Data, Datamodel, DatamodelFactory, GlobalDataArc};
use crate::fsm::{Event, ExecutableContentId, Fsm, SessionId, StateId};
use crate::js_engine::{is_valid_location, JsEngine, JsEngineError};

pub const ECMA_SCRIPT: &str = "ECMAScript";
pub const ECMA_SCRIPT_LC: &str = "ecmascript";

pub struct ECMAScriptDatamodel {
    pub global_data: GlobalDataArc,
    pub session_id: SessionId,
    engine: JsEngine,
}

pub struct ECMAScriptDatamodelFactory {
    pub engine: JsEngine,
}

impl DatamodelFactory for ECMAScriptDatamodelFactory {
    fn create(
        &mut self,
        global_data: GlobalDataArc,
        options: &HashMap<String, String>,
    ) -> Box<dyn Datamodel> {
        Box::new(ECMAScriptDatamodel::new(
            global_data,
            self.engine.clone(),
            options,
        ))
    }
}

impl ECMAScriptDatamodel {
    /// Creates the datamodel and its engine session.\
    /// The session id and the parent relation must already be set in the global data.
    pub fn new(
        global_data: GlobalDataArc,
        engine: JsEngine,
        _options: &HashMap<String, String>,
    ) -> ECMAScriptDatamodel {
        let (session_id, parent) = {
            let global = global_data.lock();
            (global.session_id, global.parent_session_id)
        };
        if let Err(e) = engine
            .create_session(session_id, parent, global_data.clone())
            .get()
        {
            error!("Failed to create script session #{}: {}", session_id, e);
        }
        ECMAScriptDatamodel {
            global_data,
            session_id,
            engine,
        }
    }

    fn set_from_data_store(&mut self, data: &HashMap<String, Data>, set_data: bool) {
        for (name, value) in data {
            if set_data {
                match value {
                    Data::String(expression) => {
                        // <data> values are expressions, evaluated in document context.
                        match self.engine.eval(self.session_id, expression.as_str()).get() {
                            Ok(val) => {
                                let _ = self
                                    .engine
                                    .set_variable(self.session_id, name.as_str(), Some(val))
                                    .get();
                            }
                            Err(err) => {
                                error!("Error on initialize '{}': {}", name, err);
                                // W3C says:
                                // If the value specified for a <data> element (by 'src', children, or
                                // the environment) is not a legal data value, the SCXML Processor MUST
                                // raise place error.execution in the internal event queue and MUST
                                // create an empty data element in the data model with the specified id.
                                let _ = self
                                    .engine
                                    .set_variable(self.session_id, name.as_str(), None)
                                    .get();
                                self.internal_error_execution();
                            }
                        }
                    }
                    other => {
                        let _ = self
                            .engine
                            .set_variable(self.session_id, name.as_str(), Some(other.clone()))
                            .get();
                    }
                }
            } else {
                let _ = self
                    .engine
                    .set_variable(self.session_id, name.as_str(), None)
                    .get();
            }
        }
    }
}

impl Drop for ECMAScriptDatamodel {
    fn drop(&mut self) {
        let _ = self.engine.destroy_session(self.session_id);
    }
}

impl Datamodel for ECMAScriptDatamodel {
    fn global(&mut self) -> &mut GlobalDataArc {
        &mut self.global_data
    }

    fn global_s(&self) -> &GlobalDataArc {
        &self.global_data
    }

    fn get_name(&self) -> &str {
        ECMA_SCRIPT
    }

    fn add_functions(&mut self, fsm: &Fsm) {
        let mut state_name_to_id: HashMap<String, StateId> = HashMap::new();
        for state in fsm.states.as_slice() {
            state_name_to_id.insert(state.name.clone(), state.id);
        }

        // Collect the processor handles under the global lock, resolve the
        // locations after releasing it (processors lock the global data on send).
        let (action_names, processor_handles) = {
            let global = self.global_data.lock();
            let action_names = global.actions.action_names();
            let handles: Vec<_> = global
                .io_processors
                .iter()
                .map(|(name, p)| (name.clone(), p.clone()))
                .collect();
            (action_names, handles)
        };
        let mut io_processors = Vec::with_capacity(processor_handles.len());
        for (name, processor) in processor_handles {
            let location = processor.lock().unwrap().get_location(self.session_id);
            io_processors.push((name, location));
        }

        if let Err(e) = self
            .engine
            .install_functions(self.session_id, state_name_to_id, action_names)
            .get()
        {
            error!("Failed to install functions: {}", e);
        }

        let session_name = if fsm.name.is_empty() {
            None
        } else {
            Some(fsm.name.clone())
        };
        if let Err(e) = self
            .engine
            .setup_system_variables(self.session_id, session_name, io_processors)
            .get()
        {
            error!("Failed to set up system variables: {}", e);
        }
    }

    #[allow(non_snake_case)]
    fn initializeDataModel(&mut self, fsm: &mut Fsm, data_state: StateId, set_data: bool) {
        let data = fsm.get_state_by_id(data_state).data.values.clone();
        self.set_from_data_store(&data, set_data);
        if data_state == fsm.pseudo_root {
            // Values handed over by the host or by <invoke> params/namelist
            // override the document values.
            let environment = self.global_data.lock().environment.values.clone();
            for (name, value) in environment {
                let _ = self
                    .engine
                    .set_variable(self.session_id, name.as_str(), Some(value))
                    .get();
            }
        }
    }

    fn initialize_read_only(&mut self, name: &str, value: Data) {
        if let Err(e) = self
            .engine
            .initialize_read_only(self.session_id, name, value)
            .get()
        {
            error!("Failed to initialize read only {}: {}", name, e);
        }
    }

    fn set(&mut self, name: &str, data: Data) {
        if let Err(e) = self
            .engine
            .set_variable(self.session_id, name, Some(data))
            .get()
        {
            error!("Failed to set '{}': {}", name, e);
        }
    }

    fn set_event(&mut self, event: &Event) {
        if let Err(e) = self.engine.set_event(self.session_id, event).get() {
            error!("Failed to set event: {}", e);
        }
    }

    fn assign(&mut self, left_expr: &str, right_expr: &str) -> bool {
        match self.engine.assign(self.session_id, left_expr, right_expr).get() {
            Ok(()) => true,
            Err(err) => {
                // W3C says:\
                // If the location expression does not denote a valid location in the data model or
                // if the value specified (by 'expr' or children) is not a legal value for the
                // location specified, the SCXML Processor must place the error 'error.execution'
                // in the internal event queue.
                self.log(format!("Could not assign {}={}, '{}'.", left_expr, right_expr, err).as_str());
                self.internal_error_execution();
                false
            }
        }
    }

    fn get_by_location(&mut self, location: &str) -> Result<Data, String> {
        self.engine
            .get_variable(self.session_id, location)
            .get()
            .map_err(|e| e.to_string())
    }

    fn clear(&mut self) {
        let _ = self.engine.destroy_session(self.session_id).get();
    }

    fn log(&mut self, msg: &str) {
        info!("{}", msg);
    }

    fn execute(&mut self, script: &str) -> Result<String, String> {
        match self.engine.execute_script(self.session_id, script).get() {
            Ok(value) => Ok(value.string_value()),
            Err(e) => {
                error!("Script error: {}", e);
                Err(e.to_string())
            }
        }
    }

    fn evaluate(&mut self, expression: &str) -> Result<Data, String> {
        self.engine
            .eval(self.session_id, expression)
            .get()
            .map_err(|e| e.to_string())
    }

    fn execute_for_each(
        &mut self,
        array_expression: &str,
        item_name: &str,
        index: &str,
        execute_body: &mut dyn FnMut(&mut dyn Datamodel) -> bool,
    ) -> bool {
        // W3C: the processor must declare a new variable if the one specified
        // by 'item' is not already defined, and raise error.execution if 'item'
        // is no valid variable name.
        if !is_valid_location(item_name) {
            error!("ForEach: item '{}' is no valid location", item_name);
            self.internal_error_execution();
            return false;
        }
        // The snapshot keeps the iteration unaffected by mutations of the source.
        let items = match self
            .engine
            .for_each_snapshot(self.session_id, array_expression)
            .get()
        {
            Ok(items) => items,
            Err(JsEngineError::Eval(msg)) => {
                self.log(&msg);
                self.internal_error_execution();
                return false;
            }
            Err(e) => {
                self.log(&e.to_string());
                self.internal_error_execution();
                return false;
            }
        };
        for (idx, item) in items.into_iter().enumerate() {
            if self
                .engine
                .set_variable(self.session_id, item_name, Some(item))
                .get()
                .is_err()
            {
                self.internal_error_execution();
                return false;
            }
            if !index.is_empty()
                && self
                    .engine
                    .set_variable(self.session_id, index, Some(Data::Integer(idx as i64)))
                    .get()
                    .is_err()
            {
                self.internal_error_execution();
                return false;
            }
            if !execute_body(self) {
                return false;
            }
        }
        true
    }

    fn execute_condition(&mut self, script: &str) -> Result<bool, String> {
        // W3C:
        // B.2.3 Conditional Expressions
        //   The Processor must convert ECMAScript expressions used in conditional expressions
        //   into their effective boolean value using the ToBoolean operator
        //   as described in Section 9.2 of [ECMASCRIPT-262].
        let to_boolean_expression = format!("({})?true:false", script);
        match self.evaluate(to_boolean_expression.as_str()) {
            Ok(Data::Boolean(v)) => Ok(v),
            Ok(other) => Err(format!("condition '{}' is no boolean: {}", script, other)),
            Err(msg) => Err(msg),
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

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use crate::builder::{assign, if_content, raise, script_expr, FsmBuilder, SCXML_ROOT_NAME};
    use crate::executable_content::ForEach;
    use crate::fsm::{Cancel, DoneData, Event, Parameter, SendParameters};
    use crate::test::{run_test_manual, run_test_manual_with_send, states};

    #[test]
    fn in_predicate_reflects_the_configuration() {
        let mut b = FsmBuilder::new("ecmascript");
        b.state("s0");
        b.final_state("pass");
        b.final_state("fail");
        b.initial("s0");
        let check = if_content(&mut b, "In('s0') && !In('pass')", vec![raise("yes")], vec![raise("no")]);
        b.on_entry("s0", vec![check]);
        b.transition("s0", "yes", &["pass"]);
        b.transition("s0", "no", &["fail"]);
        let fsm = b.build().expect("model shall build");

        assert!(run_test_manual(
            "in_predicate",
            fsm,
            5000,
            &states(&["pass"]),
        ));
    }

    /// Delayed send plus cancel: the timeout must never be observed and the
    /// pending entry disappears from the scheduler.
    #[test]
    fn delayed_send_is_cancellable() {
        let mut b = FsmBuilder::new("ecmascript");
        b.state("s0");
        b.state("s1");
        b.final_state("pass");
        b.final_state("fail");
        b.initial("s0");
        let mut send = SendParameters::new();
        send.name = "t".to_string();
        send.event = "timeout".to_string();
        send.delay_ms = 500;
        b.on_entry("s0", vec![Box::new(send)]);
        let mut cancel = Cancel::new();
        cancel.send_id = "t".to_string();
        b.on_entry("s1", vec![Box::new(cancel)]);
        b.transition("s0", "timeout", &["fail"]);
        b.transition("s0", "cancel", &["s1"]);
        b.transition("s1", "timeout", &["fail"]);
        b.transition("s1", "finish", &["pass"]);
        let fsm = b.build().expect("model shall build");

        assert!(run_test_manual_with_send(
            "delayed_send_is_cancellable",
            fsm,
            8000,
            &states(&["pass"]),
            |executor, session| {
                // Quiesce once so the onentry <send> is surely scheduled.
                assert!(session.process_event(Event::new_simple("noop"), 3000).success);
                assert!(executor.scheduler.has_event("t"));
                assert!(session.process_event(Event::new_simple("cancel"), 3000).success);
                assert!(!executor.scheduler.has_event("t"));
                // Wait past the original deadline: the timeout must not fire.
                thread::sleep(Duration::from_millis(700));
                let _ = session.send_event(Event::new_simple("finish"));
            },
        ));
    }

    /// W3C: \<foreach\> iterates over a shallow copy, mutating the source
    /// array inside the body does not change the iteration count.
    #[test]
    fn foreach_iterates_a_snapshot() {
        let mut b = FsmBuilder::new("ecmascript");
        b.data_expr(SCXML_ROOT_NAME, "arr", "[1,2,3]");
        b.data_expr(SCXML_ROOT_NAME, "n", "0");
        b.state("s0");
        b.final_state("pass");
        b.final_state("fail");
        b.initial("s0");
        let body = b.content(vec![assign("n", "n+1"), script_expr("arr.push(99)")]);
        let mut each = ForEach::new();
        each.array = "arr".to_string();
        each.item = "it".to_string();
        each.content = body;
        b.on_entry("s0", vec![Box::new(each)]);
        b.transition_cond("s0", "", "n==3 && arr.length==6", &["pass"]);
        b.transition_cond("s0", "", "true", &["fail"]);
        let fsm = b.build().expect("model shall build");

        assert!(run_test_manual(
            "foreach_iterates_a_snapshot",
            fsm,
            5000,
            &states(&["pass"]),
        ));
    }

    /// Assigning to a system variable raises error.execution and aborts the
    /// block; the error event matches an "error" prefix descriptor.
    #[test]
    fn assign_to_system_variable_fails() {
        let mut b = FsmBuilder::new("ecmascript");
        b.state("s0");
        b.final_state("pass");
        b.final_state("fail");
        b.initial("s0");
        b.on_entry("s0", vec![assign("_sessionid", "'other'"), raise("after")]);
        b.transition("s0", "error", &["pass"]);
        b.transition("s0", "after", &["fail"]);
        let fsm = b.build().expect("model shall build");

        assert!(run_test_manual(
            "assign_to_system_variable_fails",
            fsm,
            5000,
            &states(&["pass"]),
        ));
    }

    /// done.state of a compound carries the evaluated \<donedata\>.
    #[test]
    fn done_state_carries_donedata() {
        let mut b = FsmBuilder::new("ecmascript");
        b.state("Main");
        b.final_state_in("subfin", "Main");
        b.final_state("pass");
        b.final_state("fail");
        b.initial("Main");
        b.initial_in("Main", "subfin");
        b.done_data(
            "subfin",
            DoneData {
                content: None,
                params: Some(vec![Parameter {
                    name: "v".to_string(),
                    expr: "7".to_string(),
                    location: "".to_string(),
                }]),
            },
        );
        b.transition_cond("Main", "done.state.Main", "_event.data.v==7", &["pass"]);
        b.transition("Main", "done.state.Main", &["fail"]);
        let fsm = b.build().expect("model shall build");

        assert!(run_test_manual(
            "done_state_carries_donedata",
            fsm,
            5000,
            &states(&["pass"]),
        ));
    }

    /// Late binding: nested data is evaluated on first entry of its state.
    #[test]
    fn late_binding_initializes_on_first_entry() {
        let mut b = FsmBuilder::new("ecmascript");
        b.set_binding(crate::fsm::BindingType::Late);
        b.data_expr(SCXML_ROOT_NAME, "top", "1");
        b.state("s0");
        b.state("s1");
        b.data_expr("s1", "nested", "top + 41");
        b.final_state("pass");
        b.final_state("fail");
        b.initial("s0");
        // Before s1 was entered, "nested" is declared but undefined.
        b.transition_cond("s0", "go", "typeof nested == 'undefined'", &["s1"]);
        b.transition("s0", "go", &["fail"]);
        b.transition_cond("s1", "", "nested == 42", &["pass"]);
        b.transition_cond("s1", "", "true", &["fail"]);
        let fsm = b.build().expect("model shall build");

        assert!(run_test_manual_with_send(
            "late_binding",
            fsm,
            5000,
            &states(&["pass"]),
            |_executor, session| {
                let _ = session.send_event(Event::new_simple("go"));
            },
        ));
    }
}
