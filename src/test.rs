//! Support to run machines to completion and verify the final configuration.\
//! Used by the tests of this crate, usable by hosts as well.

use std::collections::HashMap;

use crate::common::{error, info};

use crate::fsm;
use crate::fsm::{FinishMode, Fsm, ScxmlSession};
use crate::fsm_executor::FsmExecutor;

/// Runs the machine until it terminates on its own.
/// Returns false if the expected final configuration was not reached.
pub fn run_test_manual(
    test_name: &str,
    fsm: Box<Fsm>,
    timeout_ms: u64,
    expected_final_configuration: &[String],
) -> bool {
    run_test_manual_with_send(
        test_name,
        fsm,
        timeout_ms,
        expected_final_configuration,
        move |_executor, _session| {},
    )
}

/// Runs the machine, lets the callback drive it (send events, inspect the
/// session) and waits for termination.
/// Returns false if the machine did not terminate in time or the expected
/// final configuration was not reached.
pub fn run_test_manual_with_send(
    test_name: &str,
    fsm: Box<Fsm>,
    timeout_ms: u64,
    expected_final_configuration: &[String],
    cb: impl FnOnce(&mut FsmExecutor, &ScxmlSession),
) -> bool {
    let mut executor = FsmExecutor::new();
    let mut session = fsm::start_fsm_with_data_and_finish_mode(
        fsm,
        Box::new(executor.clone()),
        &HashMap::new(),
        FinishMode::KEEP_CONFIGURATION,
    );

    cb(&mut executor, &session);

    info!("[{}] FSM started. Waiting to terminate...", test_name);
    let terminated = session.wait_until_terminated(timeout_ms);
    if !terminated {
        error!("[{}] ==> FSM did not terminate in time", test_name);
        session.stop();
        executor.shutdown();
        return false;
    }
    session.join();

    let final_configuration = session
        .global_data
        .lock()
        .final_configuration
        .clone()
        .unwrap_or_default();
    executor.shutdown();

    if let Some(error_message) = session.start_error() {
        error!("[{}] ==> FSM failed to start: {}", test_name, error_message);
        return false;
    }

    match verify_final_configuration(expected_final_configuration, &final_configuration) {
        Ok(states) => {
            info!("[{}] ==> Final configuration '{}' reached", test_name, states);
            true
        }
        Err(missing) => {
            error!(
                "[{}] ==> Expected final state '{}' not reached. Final configuration: {}",
                test_name,
                missing,
                final_configuration.join(",")
            );
            false
        }
    }
}

/// Checks that every expected state is part of the final configuration.
pub fn verify_final_configuration(
    expected: &[String],
    configuration: &[String],
) -> Result<String, String> {
    for state in expected {
        if !configuration.contains(state) {
            return Err(state.clone());
        }
    }
    Ok(expected.join(","))
}

/// Convenience to build the expected-configuration argument.
pub fn states(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}
