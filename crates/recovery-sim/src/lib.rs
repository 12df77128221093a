//! Recovery Sim - seeded end-to-end exercise of the recovery core
//!
//! Backs the `recovery-sim` binary; exposed as a library so the simulator can
//! also run from tests.

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod simulator;

pub use simulator::{
    run_simulator, simulation_config, SimulatorConfig, SimulatorReport, SimulatorStats, Violation,
};
