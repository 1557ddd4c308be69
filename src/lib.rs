//! Client side engine of the GDB remote serial protocol.
//!
//! The engine turns high level requests (memory and register access, breakpoints,
//! resumption, trace control) into protocol packets, drives the acknowledgement and
//! retry cycle, demultiplexes asynchronous stop notifications and keeps a model of the
//! remote threads and processes. See [`remote::RemoteTarget`] for the entry point.

pub mod config;
pub mod log;
pub mod remote;
