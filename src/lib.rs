//! MQTT v3.1.1 client engine.
//!
//! The [`v3`] module contains the packet codec, usable on its own. The [`sync`] module contains a
//! blocking client with QoS 1 acknowledgment tracking, keep alive and routing of the received
//! messages to the handlers of the subscriptions.

#![warn(missing_docs, missing_debug_implementations)]

mod bytes;
#[cfg(feature = "sync")]
pub mod sync;
pub mod v3;
