//! # Built-in Sequences
//!
//! The sequences shipped with the harness. Each module returns the
//! [`SequenceBuilder`](crate::registry::SequenceBuilder) for its sequences;
//! [`registry`] registers all of them in dependency order.

pub mod connection;
pub mod launch;
pub mod patient;

use crate::error::RegistrationError;
use crate::registry::Registry;

/// Registers every built-in sequence. Parents come before the sequences
/// extending them.
pub fn register_all(registry: &mut Registry) -> Result<(), RegistrationError> {
    registry.register(connection::connection_sequence())?;
    registry.register(launch::standalone_launch_sequence())?;
    registry.register(launch::onc_standalone_launch_sequence())?;
    registry.register(launch::ehr_launch_sequence())?;
    registry.register(launch::onc_ehr_launch_sequence())?;
    registry.register(patient::patient_read_sequence())?;
    Ok(())
}

pub fn registry() -> Result<Registry, RegistrationError> {
    let mut registry = Registry::new();
    register_all(&mut registry)?;
    Ok(registry)
}
