//! `RoomRelay` SFU (Selective Forwarding Unit) orchestration
//!
//! Signaling and session orchestration for multi-party rooms. Clients never
//! send media to each other: each one negotiates WebRTC transports with a
//! central media engine, publishes its tracks as producers and pulls every
//! other participant's tracks as consumers.
//!
//! ## Architecture
//!
//! - **`engine`**: boundary to the media engine (workers, routers, transports,
//!   producers, consumers); [`LocalEngine`] in-process, mediasoup behind the
//!   `mediasoup` feature
//! - **`RoomRegistry`**: room id → room (one router each), created on first
//!   join and dropped when the last peer leaves
//! - **`SessionStore`**: per-connection state and owned engine objects
//! - **`Relay`**: the negotiation protocol (join, transports, produce, consume,
//!   resume) and the entry point for a signaling server
//! - **`cleanup`**: teardown on disconnect
//! - **`notifier`**: `newProducer` / `producerClosed` fan-out
//!
//! ## Usage
//!
//! ```rust,ignore
//! use roomrelay_sfu::{LocalEngine, Relay, SfuConfig, WorkerSettings};
//!
//! let relay = Relay::new(Arc::new(LocalEngine::new()), WorkerSettings::default(), SfuConfig::default());
//! let (events_tx, events_rx) = tokio::sync::mpsc::channel(256);
//! relay.connect(peer_id.clone(), events_tx);
//! let reply = relay.handle(&peer_id, request).await?;
//! ```

mod cleanup;
mod codecs;
mod config;
pub mod engine;
mod error;
mod handler;
mod notifier;
mod registry;
mod room;
pub mod rtp;
mod session;
pub mod signaling;
mod stats;
mod types;
mod worker;

pub use cleanup::CleanupSummary;
pub use codecs::media_codecs;
pub use config::SfuConfig;
pub use engine::{LocalEngine, MediaEngine, WorkerLogLevel, WorkerSettings};
pub use error::{EngineError, Result, SfuError};
pub use handler::Relay;
pub use notifier::PeerEvent;
pub use registry::RoomRegistry;
pub use room::{Room, RoomStats};
pub use session::{OwnedResources, PeerPhase, PeerSession, Rejection, SessionStore};
pub use stats::RelayStats;
pub use types::{ConsumerId, PeerId, ProducerId, RoomId, RouterId, TransportDirection, TransportId};
pub use worker::WorkerSupervisor;

#[cfg(feature = "mediasoup")]
pub use engine::mediasoup::MediasoupEngine;
