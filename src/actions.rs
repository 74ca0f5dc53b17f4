//! Custom actions, callable from datamodel expressions and scripts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::datamodel::{Data, GlobalDataArc};

/// Trait to inject custom actions into the datamodel.\
/// Registered actions appear as global functions to SCXML expressions and scripts.
pub trait Action: Send {
    /// Executes the action.
    fn execute(&self, arguments: &[Data], global: &GlobalDataArc) -> Result<Data, String>;

    fn get_copy(&self) -> Box<dyn Action>;
}

/// Shared registry of custom actions.\
/// Cloned into every session started by the executor.
#[derive(Clone, Default)]
pub struct ActionWrapper {
    pub actions: Arc<Mutex<HashMap<String, Box<dyn Action>>>>,
}

impl ActionWrapper {
    pub fn new() -> ActionWrapper {
        ActionWrapper {
            actions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn add_action(&mut self, name: &str, action: Box<dyn Action>) {
        self.actions
            .lock()
            .unwrap()
            .insert(name.to_string(), action);
    }

    /// Returns a copy of the named action, usable without holding the registry lock.
    pub fn get(&self, name: &str) -> Option<Box<dyn Action>> {
        self.actions
            .lock()
            .unwrap()
            .get(name)
            .map(|action| action.get_copy())
    }

    pub fn action_names(&self) -> Vec<String> {
        self.actions.lock().unwrap().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct Doubler {}

    impl Action for Doubler {
        fn execute(&self, arguments: &[Data], _global: &GlobalDataArc) -> Result<Data, String> {
            match arguments.first() {
                Some(Data::Double(v)) => Ok(Data::Double(v * 2.0)),
                Some(Data::Integer(v)) => Ok(Data::Integer(v * 2)),
                _ => Err("expected a number".to_string()),
            }
        }

        fn get_copy(&self) -> Box<dyn Action> {
            Box::new(self.clone())
        }
    }

    #[test]
    fn registry_returns_copies() {
        let mut wrapper = ActionWrapper::new();
        wrapper.add_action("double", Box::new(Doubler {}));

        let action = wrapper.get("double").expect("action shall be registered");
        let global = GlobalDataArc::new();
        assert_eq!(
            action.execute(&[Data::Integer(21)], &global),
            Ok(Data::Integer(42))
        );
        assert!(wrapper.get("unknown").is_none());
        assert_eq!(wrapper.action_names(), vec!["double".to_string()]);
    }
}
