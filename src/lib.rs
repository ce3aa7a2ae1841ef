//! Messaging core of the loghive distributed log-storage system.
//!
//! One `Worker` per thread owns a `Sender`, which multiplexes authenticated
//!  peer connections over TCP: handshake with protocol negotiation, typed
//!  binary frames, per-peer-class output budgets with a guaranteed per-socket
//!  minimum, and asynchronous send/close completions delivered to request
//!  state machines. The control plane reads its state through a versioned
//!  config store with strict conditional updates.

pub mod config;
pub mod messaging;
pub mod status;
