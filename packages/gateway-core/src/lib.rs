//! Gateway Core - shared library for the real-time translation gateway.
//!
//! This crate provides the core runtime for a multi-tenant translation
//! gateway: downstream clients join a call over WebSocket, their audio is
//! batched into commits and forwarded to a translation provider, and the
//! provider's streamed audio/transcript output is normalized and fanned
//! back out to every other participant of the call.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`runtime`]: Task spawning abstraction for async runtime independence
//! - [`bus`]: Named publish/fan-out event registry used by every pipeline stage
//! - [`queue`]: Bounded FIFO queue backing each bus handler
//! - [`protocol`]: Downstream/upstream wire envelope encode and decode
//! - [`protocol_constants`]: Shared numeric and string constants for the wire protocol
//! - [`model`]: Domain types shared across components (commits, provider output events)
//! - [`audio`]: Commit batching, voice activity state, the outbound gate, output normalization
//! - [`upstream`]: One logical WebSocket connection to a translation provider
//! - [`provider`]: Provider adapter abstraction and the factory that resolves a configured provider
//! - [`pipeline`]: Per-call or per-participant session pipeline and barge-in control plane
//! - [`call`]: Call registry and participant membership
//! - [`router`]: Downstream WebSocket accept loop and first-message routing
//! - [`config`]: Layered runtime configuration
//! - [`error`]: Centralized error types
//!
//! # Abstraction Traits
//!
//! - [`TaskSpawner`](runtime::TaskSpawner): spawning background tasks
//! - [`BusHandler`](bus::BusHandler): consuming one kind of event published on a bus
//! - [`ProviderAdapter`](provider::ProviderAdapter): connecting a call to a translation provider

#![allow(missing_docs)]
#![warn(clippy::all)]

pub mod audio;
pub mod bus;
pub mod call;
pub mod config;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod protocol;
pub mod protocol_constants;
pub mod provider;
pub mod queue;
pub mod router;
pub mod runtime;
pub mod upstream;
pub mod utils;

pub use bus::{BusHandler, EventBus, HandlerConfig};
pub use call::{Call, CallManager, ParticipantHandle};
pub use config::GatewayConfig;
pub use error::{ErrorCode, GatewayError, GatewayResult, RouterError};
pub use model::{AudioFormat, Commit, DoneReason, ProviderOutputEvent};
pub use pipeline::{RoutingStrategy, SessionPipeline};
pub use provider::{AdapterFactory, ProviderAdapter};
pub use queue::{BoundedQueue, OverflowPolicy};
pub use router::{build_router, AppState, SessionRouter};
pub use runtime::{TaskSpawner, TokioSpawner};
pub use utils::now_millis;
