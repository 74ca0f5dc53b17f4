//! A library implementation of a W3C SCXML conformant state machine runtime.\
//! See <https://www.w3.org/TR/scxml/>.
//!
//! The machine model is built programmatically (see [builder]) or delivered by
//! a parser collaborator (see [fsm_executor::ScxmlParser]); the [fsm] module
//! implements the W3C interpretation algorithm on top of it. Sessions run in
//! their own threads, managed by the [fsm_executor::FsmExecutor].

extern crate core;

pub mod common;

pub mod actions;
pub mod builder;
pub mod datamodel;
pub mod event_io_processor;
pub mod event_scheduler;
pub mod executable_content;
pub mod fsm;
pub mod fsm_executor;

#[cfg(feature = "ECMAScriptModel")]
pub mod ecma_script_datamodel;
#[cfg(feature = "ECMAScriptModel")]
pub mod js_engine;

pub mod test;

pub use common::init_logging;
