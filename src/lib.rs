//! # Samovar
//! Rust-native background runtime for Kafka-style consumer clients.
//!
//! This crate provides the asynchronous machinery behind a consumer client:
//! a dedicated background thread that owns all protocol state and network
//! I/O, fed by an event queue that any application thread can submit to and
//! block on with a deadline. Group membership, offset commits, offset
//! resolution, metadata refresh, and record fetching each live in their own
//! request manager, all driven by one cooperative loop; no protocol state is
//! ever shared across threads, so none of it needs a lock.
//!
//! ## Goals
//! - Easy to understand code
//! - Leverage best in class libraries such as Tokio to do the heavy lifting
//! - Keep all protocol state on one thread and make that impossible to get wrong
//! - Be a good building block for future works based around Kafka
//!
//! ## Getting started
//! Spawn a [`ConsumerRuntime`](prelude::ConsumerRuntime) through its builder,
//! handing it a [`Transport`](prelude::Transport) for the wire. Every method
//! on the handle is synchronous and deadline-bounded.
//! ```no_run
//! use samovar::prelude::*;
//!
//! # fn run<C: WireCodec>(codec: C) -> Result<()> {
//! let mut runtime = ConsumerRuntime::builder()
//!     .group("the-data-boyz")
//!     .bootstrap(vec![BrokerAddress {
//!         host: "127.0.0.1".to_string(),
//!         port: 9092,
//!     }])
//!     .topics(vec!["my-topic".to_string()])
//!     .spawn(TcpTransport::new(codec))?;
//!
//! loop {
//!     let records = runtime.fetch()?;
//!     for record in records {
//!         println!("{:?}", record);
//!     }
//!     if records_done(&runtime) {
//!         break;
//!     }
//! }
//!
//! // Flushes pending commits and leaves the group before stopping.
//! runtime.shutdown()?;
//! # Ok(())
//! # }
//! # fn records_done(_: &ConsumerRuntime) -> bool { true }
//! ```
//!
//! ## Resources
//! - [Kafka Protocol Spec](https://kafka.apache.org/protocol.html)
//! - [KIP-848: The Next Generation of the Consumer Rebalance Protocol](https://cwiki.apache.org/confluence/display/KAFKA/KIP-848)

mod background;
mod config;
mod delegate;
mod error;
mod events;
mod facade;
mod managers;
mod metadata;
mod processor;
mod protocol;
mod runtime;
mod transport;

const DEFAULT_CLIENT_ID: &str = "samovar";

pub mod prelude {
    //! Main export of various structures and methods
    //!
    //! The runtime is used through three surfaces:
    //! - [`ConsumerRuntime`] and [`RuntimeBuilder`], the handle an
    //!   application spawns and calls into
    //! - [`ClusterStateFacade`], a synchronous read-only cluster view for
    //!   callers that cannot await
    //! - [`Transport`] and [`WireCodec`], the seams where the wire plugs in
    //!   ([`TcpTransport`] for real brokers, [`InMemoryTransport`] for tests)

    pub use crate::config::{FetchParams, OffsetResetStrategy, RuntimeConfig};
    pub use crate::error::{Error, KafkaCode, Result};
    pub use crate::events::{ApplicationEvent, CompletionHandle, EventQueue};
    pub use crate::facade::ClusterStateFacade;
    pub use crate::metadata::ClusterSnapshot;
    pub use crate::runtime::{ConsumerRuntime, RuntimeBuilder};
    pub use crate::transport::mock::InMemoryTransport;
    pub use crate::transport::tcp::TcpTransport;
    pub use crate::transport::{
        BrokerAddress, ConnectionState, Transport, TransportEvent, WireCodec, WireRequest,
    };

    pub use bytes;

    pub mod protocol {
        pub use crate::protocol::*;
    }
}
