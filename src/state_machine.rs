//! Collaborator traits for the application side of the engine.
//!
//! The engine never interprets command payloads itself: a [`CommandRegistry`]
//! turns a persisted `(name, payload)` pair back into an executable
//! [`Command`], and the [`StateMachine`] provides the opaque save/restore
//! image used for snapshotting.

use std::any::Any;
use std::fmt;

use crate::Result;

/// The application state machine, captured and restored wholesale during
/// snapshotting. Applying individual commands goes through [`Command`], not
/// through this trait.
pub trait StateMachine: Send {
    /// Serializes the full state into an opaque image.
    fn save(&self) -> Result<Vec<u8>>;

    /// Replaces the full state with a previously saved image.
    fn recovery(&mut self, state: &[u8]) -> Result<()>;
}

/// An executable command replicated through the log.
///
/// `apply` receives the opaque context the server was constructed with;
/// applications downcast it to reach their own state. Apply must not block
/// indefinitely: it runs synchronously on the commit path.
pub trait Command: fmt::Debug + Send + Sync {
    /// The registered name under which this command is persisted.
    fn command_name(&self) -> &str;

    /// Serializes the command payload for log persistence.
    fn serialize(&self) -> Result<Vec<u8>>;

    /// Executes the command against the application, returning the result
    /// handed back to the submitting client.
    fn apply(&self, context: &(dyn Any + Send + Sync)) -> Result<Vec<u8>>;
}

/// Turns a persisted command name and payload back into an executable
/// [`Command`]. Unknown names are an error: the log cannot apply what it
/// cannot decode.
pub trait CommandRegistry: Send + Sync {
    fn deserialize(&self, name: &str, payload: &[u8]) -> Result<Box<dyn Command>>;
}
