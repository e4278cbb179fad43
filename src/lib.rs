#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod cli;
pub mod cloudinit;
pub mod config;
pub mod error;
pub mod fleet;
pub mod hypervisor;
pub mod lifecycle;
pub mod logging;
pub mod observer;
pub mod paths;
pub mod readiness;
pub mod seed;
pub mod source;
pub mod status;
pub mod vm;
