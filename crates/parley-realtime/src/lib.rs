//! # parley-realtime
//!
//! Realtime connection lifecycle for the Parley messaging API.
//!
//! The [`ConnectionManager`] owns a single logical connection to the
//! backend. It resolves a credential before every attempt, moves through a
//! guarded set of [`ConnectionState`]s, reconnects with exponential backoff
//! after abnormal closures, and routes inbound events to per-tag handlers.
//!
//! Two transports ship with the crate: [`WebSocketTransport`] and
//! [`SseTransport`]. Anything implementing [`Transport`] can be plugged in.
//!
//! ```no_run
//! use parley_realtime::{ConnectionManager, Event, EventTag, RealtimeConfig};
//!
//! # async fn run() -> parley_realtime::Result<()> {
//! let config = RealtimeConfig::builder()
//!     .tenant_id("acme")
//!     .endpoint("wss://realtime.example.com/hub")
//!     .api_key("pk_live_123")
//!     .workflow("support")
//!     .participant("visitor-42")
//!     .build()?;
//!
//! let manager = ConnectionManager::websocket(config);
//! manager.on(EventTag::ChatMessage, |event| {
//!     if let Event::ChatMessage(payload) = event {
//!         println!("chat: {payload}");
//!     }
//! });
//! manager.connect().await?;
//! manager.send_chat("hello").await?;
//! # Ok(())
//! # }
//! ```
//!
//! The crate logs through `tracing` and never installs a subscriber.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod manager;
pub mod reconnect;
pub mod state;
pub mod transport;

pub use auth::{AuthProvider, BoxError, Credential, TokenCallback};
pub use config::{ConnectionTarget, RealtimeConfig, RealtimeConfigBuilder, RealtimeSettings};
pub use dispatch::{DispatchOutcome, EventDispatcher, EventHandlers, Handler};
pub use error::{Error, Result};
pub use events::{Event, EventTag};
pub use manager::ConnectionManager;
pub use reconnect::{Closure, ReconnectCounter, ReconnectPolicy};
pub use state::{ConnectionState, ObserverId, StateMachine, Transition};
pub use transport::{
    CloseInfo, OpenRequest, SseTransport, Transport, TransportConnection, TransportError,
    TransportEvent, WebSocketTransport,
};

pub use parley_proto::{FrameKind, InboundFrame, OutboundFrame};
