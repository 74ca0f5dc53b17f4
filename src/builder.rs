//! Programmatic assembly of the FSM model tree.\
//! The runtime works on the in-memory model of [crate::fsm]; reading SCXML
//! documents is the duty of the parser collaborator (see
//! [crate::fsm_executor::ScxmlParser]). This module lets hosts and tests build
//! the same model directly, preserving document order and validating references
//! like the reader would.

use crate::common::debug;

use crate::datamodel::Data;
use crate::executable_content::{Assign, Expression, ExecutableContent, If, Log, Raise};
use crate::fsm::{
    BindingType, DocumentId, DoneData, ExecutableContentId, Fsm, HistoryType, Invoke, State,
    StateId, Transition, TransitionId, TransitionType,
};

/// Name of the artificial root state that represents the \<scxml\> element.
pub const SCXML_ROOT_NAME: &str = "__scxml__";

pub struct FsmBuilder {
    pub fsm: Box<Fsm>,
    doc_id_counter: DocumentId,
    content_id_counter: ExecutableContentId,
    errors: Vec<String>,
}

impl FsmBuilder {
    /// Creates a builder for a machine with the given datamodel
    /// ("ecmascript" or "null").
    pub fn new(datamodel: &str) -> FsmBuilder {
        let mut builder = FsmBuilder {
            fsm: Box::new(Fsm::new()),
            doc_id_counter: 0,
            content_id_counter: 0,
            errors: Vec::new(),
        };
        builder.fsm.datamodel = datamodel.to_string();
        let root = builder.declare_state(SCXML_ROOT_NAME);
        builder.fsm.pseudo_root = root;
        builder
    }

    pub fn set_name(&mut self, name: &str) -> &mut Self {
        self.fsm.name = name.to_string();
        self
    }

    pub fn set_binding(&mut self, binding: BindingType) -> &mut Self {
        self.fsm.binding = binding;
        self
    }

    fn next_doc_id(&mut self) -> DocumentId {
        self.doc_id_counter += 1;
        self.doc_id_counter
    }

    /// Gets the id of the named state, creating an undeclared placeholder if
    /// needed. Placeholders keep doc_id 0 until the state is declared,
    /// [FsmBuilder::build] reports the leftovers.
    pub fn state_id(&mut self, name: &str) -> StateId {
        if let Some(id) = self.fsm.statesNames.get(name) {
            return *id;
        }
        let mut state = State::new(name);
        let id = (self.fsm.states.len() + 1) as StateId;
        state.id = id;
        self.fsm.statesNames.insert(name.to_string(), id);
        self.fsm.states.push(state);
        id
    }

    fn declare_state(&mut self, name: &str) -> StateId {
        let id = self.state_id(name);
        let doc_id = self.next_doc_id();
        let state = self.fsm.get_state_by_id_mut(id);
        if state.doc_id != 0 {
            self.errors.push(format!("State '{}' is declared twice", name));
        } else {
            state.doc_id = doc_id;
        }
        id
    }

    fn add_child(&mut self, name: &str, parent: &str) -> StateId {
        let parent_id = self.state_id(parent);
        let id = self.declare_state(name);
        self.fsm.get_state_by_id_mut(id).parent = parent_id;
        self.fsm.get_state_by_id_mut(parent_id).states.push(id);
        id
    }

    /// Declares a top level state.
    pub fn state(&mut self, name: &str) -> StateId {
        self.add_child(name, SCXML_ROOT_NAME)
    }

    /// Declares a child state.
    pub fn state_in(&mut self, name: &str, parent: &str) -> StateId {
        self.add_child(name, parent)
    }

    /// Declares a top level parallel state.
    pub fn parallel(&mut self, name: &str) -> StateId {
        let id = self.add_child(name, SCXML_ROOT_NAME);
        self.fsm.get_state_by_id_mut(id).is_parallel = true;
        id
    }

    /// Declares a child parallel state.
    pub fn parallel_in(&mut self, name: &str, parent: &str) -> StateId {
        let id = self.add_child(name, parent);
        self.fsm.get_state_by_id_mut(id).is_parallel = true;
        id
    }

    /// Declares a top level final state.
    pub fn final_state(&mut self, name: &str) -> StateId {
        let id = self.add_child(name, SCXML_ROOT_NAME);
        self.fsm.get_state_by_id_mut(id).is_final = true;
        id
    }

    /// Declares a child final state.
    pub fn final_state_in(&mut self, name: &str, parent: &str) -> StateId {
        let id = self.add_child(name, parent);
        self.fsm.get_state_by_id_mut(id).is_final = true;
        id
    }

    /// Declares a history pseudo state of the parent.\
    /// History states are recorded in the parent's history list, they are no
    /// regular children. The default configuration is given by a transition,
    /// see [FsmBuilder::transition].
    pub fn history_in(&mut self, name: &str, parent: &str, history_type: HistoryType) -> StateId {
        let parent_id = self.state_id(parent);
        let id = self.declare_state(name);
        self.fsm.get_state_by_id_mut(id).parent = parent_id;
        self.fsm.get_state_by_id_mut(id).history_type = history_type;
        self.fsm.get_state_by_id_mut(parent_id).history.push(id);
        id
    }

    /// Sets the initial target of the \<scxml\> element.
    pub fn initial(&mut self, target: &str) -> &mut Self {
        self.initial_in(SCXML_ROOT_NAME, target)
    }

    /// Sets the initial target of a compound state, as by an "initial"
    /// attribute or an \<initial\> element.
    pub fn initial_in(&mut self, parent: &str, target: &str) -> &mut Self {
        let parent_id = self.state_id(parent);
        let target_id = self.state_id(target);
        let mut t = Transition::new();
        t.doc_id = self.next_doc_id();
        t.source = parent_id;
        t.target.push(target_id);
        let tid = t.id;
        self.fsm.transitions.insert(tid, t);
        self.fsm.get_state_by_id_mut(parent_id).initial = tid;
        self
    }

    /// Adds a \<data\> entry whose value is an expression, evaluated according
    /// to the binding mode.
    pub fn data_expr(&mut self, state: &str, id: &str, expr: &str) -> &mut Self {
        let state_id = self.state_id(state);
        self.fsm
            .get_state_by_id_mut(state_id)
            .data
            .set(id, Data::String(expr.to_string()));
        self
    }

    /// Adds a \<data\> entry with a literal value.
    pub fn data_value(&mut self, state: &str, id: &str, value: Data) -> &mut Self {
        let state_id = self.state_id(state);
        self.fsm.get_state_by_id_mut(state_id).data.set(id, value);
        self
    }

    /// Registers a block of executable content and returns its id.
    pub fn content(&mut self, content: Vec<Box<dyn ExecutableContent>>) -> ExecutableContentId {
        self.content_id_counter += 1;
        let id = self.content_id_counter;
        self.fsm.executableContent.insert(id, content);
        id
    }

    /// Sets the global \<script\> element.
    pub fn script(&mut self, content: Vec<Box<dyn ExecutableContent>>) -> &mut Self {
        let id = self.content(content);
        self.fsm.script = id;
        self
    }

    pub fn on_entry(&mut self, state: &str, content: Vec<Box<dyn ExecutableContent>>) -> &mut Self {
        let id = self.content(content);
        let state_id = self.state_id(state);
        self.fsm.get_state_by_id_mut(state_id).onentry = id;
        self
    }

    pub fn on_exit(&mut self, state: &str, content: Vec<Box<dyn ExecutableContent>>) -> &mut Self {
        let id = self.content(content);
        let state_id = self.state_id(state);
        self.fsm.get_state_by_id_mut(state_id).onexit = id;
        self
    }

    pub fn done_data(&mut self, state: &str, done_data: DoneData) -> &mut Self {
        let state_id = self.state_id(state);
        self.fsm.get_state_by_id_mut(state_id).donedata = Some(done_data);
        self
    }

    /// Attaches an \<invoke\> to a state. Document id and parent state name
    /// are filled in here.
    pub fn add_invoke(&mut self, state: &str, mut invoke: Invoke) -> &mut Self {
        let state_id = self.state_id(state);
        invoke.doc_id = self.next_doc_id();
        invoke.parent_state_name = state.to_string();
        self.fsm.get_state_by_id_mut(state_id).invoke.push(invoke);
        self
    }

    /// Adds a transition.\
    /// "events" holds the space separated event descriptors of the "event"
    /// attribute, an empty string declares an eventless transition.
    pub fn transition(&mut self, source: &str, events: &str, targets: &[&str]) -> TransitionId {
        self.transition_with(source, events, None, targets, TransitionType::External)
    }

    /// Adds a transition with a guard condition.
    pub fn transition_cond(
        &mut self,
        source: &str,
        events: &str,
        cond: &str,
        targets: &[&str],
    ) -> TransitionId {
        self.transition_with(source, events, Some(cond), targets, TransitionType::External)
    }

    pub fn transition_with(
        &mut self,
        source: &str,
        events: &str,
        cond: Option<&str>,
        targets: &[&str],
        transition_type: TransitionType,
    ) -> TransitionId {
        let source_id = self.state_id(source);
        let mut t = Transition::new();
        t.doc_id = self.next_doc_id();
        t.source = source_id;
        t.transition_type = transition_type;
        t.cond = cond.map(|c| c.to_string());
        for descriptor in events.split_ascii_whitespace() {
            if descriptor == "*" {
                t.wildcard = true;
            } else {
                t.events.push(descriptor.to_string());
            }
        }
        for target in targets {
            let target_id = self.state_id(target);
            t.target.push(target_id);
        }
        let tid = t.id;
        self.fsm.transitions.insert(tid, t);
        self.fsm
            .get_state_by_id_mut(source_id)
            .transitions
            .push(tid);
        tid
    }

    /// Attaches executable content to a transition.
    pub fn transition_content(
        &mut self,
        transition: TransitionId,
        content: Vec<Box<dyn ExecutableContent>>,
    ) -> &mut Self {
        let id = self.content(content);
        self.fsm.get_transition_by_id_mut(transition).content = id;
        self
    }

    /// Finishes the model.\
    /// Validates that all referenced states are declared, that history states
    /// carry a default transition, and synthesizes the default initial
    /// transitions of compound states without one (first child in document
    /// order, as W3C requires).
    pub fn build(mut self) -> Result<Box<Fsm>, Vec<String>> {
        for state in &self.fsm.states {
            if state.doc_id == 0 {
                self.errors
                    .push(format!("State '{}' is referenced but not declared", state.name));
            }
            if state.history_type != HistoryType::None && state.transitions.size() != 1 {
                self.errors.push(format!(
                    "History state '{}' must have exactly one default transition",
                    state.name
                ));
            }
        }
        if !self.errors.is_empty() {
            return Err(self.errors);
        }

        // Default initial targets: the first child state in document order.
        let mut defaults: Vec<(StateId, StateId)> = Vec::new();
        for state in &self.fsm.states {
            if state.initial == 0 && !state.states.is_empty() && !state.is_parallel {
                let first_child = *state
                    .states
                    .iter()
                    .min_by_key(|sid| self.fsm.get_state_by_id(**sid).doc_id)
                    .unwrap();
                defaults.push((state.id, first_child));
            }
        }
        for (parent, child) in defaults {
            debug!(
                "Synthesize initial transition {} -> {}",
                self.fsm.get_state_by_id(parent).name,
                self.fsm.get_state_by_id(child).name
            );
            let mut t = Transition::new();
            t.doc_id = self.doc_id_counter + 1;
            self.doc_id_counter += 1;
            t.source = parent;
            t.target.push(child);
            let tid = t.id;
            self.fsm.transitions.insert(tid, t);
            self.fsm.get_state_by_id_mut(parent).initial = tid;
        }

        Ok(self.fsm)
    }
}

/// Shorthand for a \<raise\> element.
pub fn raise(event: &str) -> Box<dyn ExecutableContent> {
    let mut r = Raise::new();
    r.event = event.to_string();
    Box::new(r)
}

/// Shorthand for an \<assign\> element.
pub fn assign(location: &str, expr: &str) -> Box<dyn ExecutableContent> {
    let mut a = Assign::new();
    a.location = location.to_string();
    a.expr = expr.to_string();
    Box::new(a)
}

/// Shorthand for a \<script\> body.
pub fn script_expr(code: &str) -> Box<dyn ExecutableContent> {
    let mut e = Expression::new();
    e.content = code.to_string();
    Box::new(e)
}

/// Shorthand for a \<log\> element.
pub fn log_expr(label: &str, expr: &str) -> Box<dyn ExecutableContent> {
    Box::new(Log::new(&Some(&label.to_string()), expr))
}

/// Shorthand for an \<if\> element with optional else block.
pub fn if_content(
    builder: &mut FsmBuilder,
    condition: &str,
    then_content: Vec<Box<dyn ExecutableContent>>,
    else_content: Vec<Box<dyn ExecutableContent>>,
) -> Box<dyn ExecutableContent> {
    let mut i = If::new(condition);
    i.content = builder.content(then_content);
    if !else_content.is_empty() {
        i.else_content = builder.content(else_content);
    }
    Box::new(i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::HistoryType;

    #[test]
    fn builds_a_minimal_machine() {
        let mut b = FsmBuilder::new("null");
        b.state("Main");
        b.final_state("Done");
        b.initial("Main");
        b.transition("Main", "go", &["Done"]);
        let fsm = b.build().expect("model shall build");
        assert_eq!(fsm.states.len(), 3); // root + 2
        let root = fsm.get_state_by_id(fsm.pseudo_root);
        assert_ne!(root.initial, 0);
    }

    #[test]
    fn synthesizes_default_initial_transitions() {
        let mut b = FsmBuilder::new("null");
        b.state("Main");
        b.state_in("A", "Main");
        b.state_in("B", "Main");
        let fsm = b.build().expect("model shall build");
        // Root and "Main" both got a default initial transition to their
        // first child in document order.
        let main = fsm.get_state_by_name(&"Main".to_string());
        assert_ne!(main.initial, 0);
        let t = fsm.get_transition_by_id(main.initial);
        let a = fsm.get_state_by_name(&"A".to_string());
        assert_eq!(t.target, vec![a.id]);
        let root = fsm.get_state_by_id(fsm.pseudo_root);
        let rt = fsm.get_transition_by_id(root.initial);
        assert_eq!(rt.target, vec![main.id]);
    }

    #[test]
    fn undeclared_reference_is_an_error() {
        let mut b = FsmBuilder::new("null");
        b.state("Main");
        b.transition("Main", "go", &["Ghost"]);
        let errors = b.build().expect_err("undeclared target shall fail");
        assert!(errors.iter().any(|e| e.contains("Ghost")));
    }

    #[test]
    fn history_needs_a_default_transition() {
        let mut b = FsmBuilder::new("null");
        b.state("Main");
        b.state_in("A", "Main");
        b.history_in("H", "Main", HistoryType::Shallow);
        let errors = b.build().expect_err("history without default shall fail");
        assert!(errors.iter().any(|e| e.contains("H")));
    }

    #[test]
    fn history_states_are_no_regular_children() {
        let mut b = FsmBuilder::new("null");
        b.state("Main");
        b.state_in("A", "Main");
        b.history_in("H", "Main", HistoryType::Deep);
        b.transition("H", "", &["A"]);
        let fsm = b.build().expect("model shall build");
        let main = fsm.get_state_by_name(&"Main".to_string());
        assert_eq!(main.states.len(), 1);
        assert_eq!(main.history.size(), 1);
    }
}
