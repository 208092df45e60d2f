//! # dprov-device: Secure-Element Command Channel
//!
//! Talks to the manufacturing command interpreter running on a freshly
//! attached microcontroller:
//!
//! - [`loader`]: uploads the interpreter stub (`esptool.py load_ram`).
//! - [`transport`]: the line transport seam and the serial-port backend.
//! - [`channel`]: the request/response state machine with timeouts and
//!   cancellation.
//! - [`commands`]: the read sequence that yields a [`DeviceIdentity`].
//! - [`sim`]: an in-process simulated device implementing the same contract.
//!
//! A channel is an owned resource handle. Callers construct one per device
//! and pass it to the manifest builder; there is no module-level port state.

#![deny(missing_docs)]

pub mod channel;
pub mod commands;
pub mod error;
pub mod loader;
pub mod sim;
pub mod transport;

pub use channel::{CancelToken, ChannelState, ChannelTimeouts, CommandChannel, Response};
pub use commands::{read_identity, DeviceIdentity};
pub use error::{ChannelError, LoaderError};
pub use loader::{DeviceEndpoint, EsptoolLoader, StubLoader};
pub use transport::{SerialOpener, SerialTransport, Transport, TransportOpener};
