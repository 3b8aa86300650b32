//! Custom Resource Definitions for Machina
//!
//! This module contains the VirtualMachine CRD the controller reconciles.

mod vm;

pub use vm::{object_key, split_key, VirtualMachine, VirtualMachineSpec, VirtualMachineStatus};
