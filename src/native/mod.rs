/// Native module contains implementations of core traits
/// that talk to the host directly: subprocesses, process groups
/// and resource limits via syscalls.
pub mod generator;
