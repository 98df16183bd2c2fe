//! # Aquarium Stream Client Library
//!
//! Live camera streams for the aquarium monitoring dashboard. The heart of the crate
//! is [`connection::StreamConnection`], the per-tile state machine that connects to a
//! camera feed, shows frames, retries with backoff after transient failures and stops
//! cleanly when the tile is paused, unmounted or switched to another device.
//!
//! ## Crate Structure
//!
//! - **`connection`**: `StreamConnection`, its phases, state snapshots and the
//!   `DisplaySurface` trait frames are rendered through.
//! - **`backoff`**: retry delay policies (exponential, fixed step, or any closure).
//! - **`transport`**: the `FrameTransport`/`FrameSource` traits with polling (HTTP),
//!   socket (WebSocket) and mock implementations.
//! - **`wall`**: `StreamWall`, one connection per active device, synced with the
//!   backend's device list.
//! - **`capture`**: the pause, settle, capture, resume workflow.
//! - **`client`**: typed REST client for the backend.
//! - **`address`**: backend URL normalization and precedence.
//! - **`config`**: figment-based configuration (TOML file plus `AQUARIUM_` environment).
//! - **`logging`**: tracing-subscriber initialization.
//! - **`error`**: error taxonomy.

pub mod address;
pub mod backoff;
pub mod capture;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod transport;
pub mod wall;

pub use connection::{ConnectionConfig, ConnectionState, DisplaySurface, Phase, StreamConnection};
pub use error::{AppResult, AquariumError, StreamError, TransportError};
pub use transport::{DeviceId, Frame};
