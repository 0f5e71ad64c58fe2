#![deny(
    // The following are allowed by default lints according to
    // https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
    anonymous_parameters,
    bare_trait_objects,
    unstable_features,
    unused_extern_crates,
    unused_import_braces,
)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    trivial_numeric_casts,
    unreachable_pub,
    unused_qualifications,
    unused_results,

    clippy::all,
    clippy::pedantic,
    clippy::cargo,
)]
#![allow(
    // Some explicitly allowed Clippy lints, must have clear reason to allow
    clippy::module_name_repetitions, // repeation of module name in a struct name is not big deal
    clippy::multiple_crate_versions, // multi-version dependency crates is not able to fix
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::new_ret_no_self,
)]

//! An event-driven network transport engine.
//!
//! A [`Service`] owns a read poller, a send poller, a timer queue and a task
//! worker. Transports, acceptors and dialers register themselves as channels
//! on a running service and get readiness and posted events dispatched to them
//! on the poller threads. Results arrive through the callbacks handed over at
//! start.

#[allow(missing_docs)]
pub mod log;

/// Error codes of the public API.
pub mod error;

/// Socket addresses.
pub mod address;

/// Service configuration.
pub mod config;

/// Pollers, fd trackers and the channel registry.
#[allow(missing_docs)]
pub mod poll;

/// One-shot and repeating timers.
pub mod time;

/// The event loop service.
pub mod service;

/// Low level socket flows.
#[allow(missing_docs)]
pub mod flow;

/// TLS sessions.
pub mod tls;

/// Transports, acceptors, dialers and the TLS handshaker.
#[allow(missing_docs)]
pub mod transport;

pub use address::Address;
pub use config::Config;
pub use error::{ErrorCode, Result};
pub use service::Service;
pub use transport::tcp::TcpTransport;
pub use transport::tcp_acceptor::TcpAcceptor;
pub use transport::tcp_dialer::TcpDialer;
pub use transport::tls::TlsTransport;
pub use transport::tls_acceptor::TlsAcceptor;
pub use transport::tls_dialer::TlsDialer;
pub use transport::udp::UdpTransport;
pub use transport::{ReadMode, TransportState, TransportType};
