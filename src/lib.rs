//! `arsdk-core`: the client-side core of a UDP control stack for
//! Parrot-family consumer drones (Bebop, Jumping Sumo family, Mambo,
//! SkyController).
//!
//! Three layers, leaves-first:
//!
//! - [`wire`] + [`seq`] + [`transport`]: frame-level UDP send/receive and
//!   liveness ("NetworkAL").
//! - [`channel`]: per-buffer sequencing, ack/retry, ping/pong ("Network").
//! - [`schema`] + [`codec`]: bind schema names to wire bytes, loaded from
//!   external XML descriptors.
//! - [`state`]: a queryable, blocking-wait device-state store fed by
//!   decoded event commands.
//! - [`device`]: the orchestrator gluing all of the above behind
//!   `send`/`wait_for`.
//!
//! [`handshake`] and [`discovery`] are thin wrappers around the two
//! external collaborators spec.md scopes out of the core proper (the TCP
//! JSON port-negotiation handshake and MDNS discovery).

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod channel;
pub mod codec;
pub mod device;
pub mod discovery;
pub mod handshake;
pub mod schema;
pub mod seq;
pub mod state;
pub mod transport;
pub mod wire;

pub use channel::{Channel, ChannelListener, SendStatus};
pub use codec::{Codec, CodecError, DecodedCommand, Value};
pub use device::{BufferPlan, Device, DeviceError};
pub use schema::{BufferKind, Catalogue, CommandDef, ListKind, ScalarKind, SchemaError};
pub use state::{Slot, Store};
pub use transport::{DatagramListener, Transport};
pub use wire::{DataType, Frame, WireError};
