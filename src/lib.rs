//! pacegate - Forwarding proxy that paces outbound requests.
//!
//! Requests name their destination in the `X-Proxy-To` header. However many
//! arrive at once, the proxy releases them to their targets one at a time, in
//! arrival order, with a guaranteed minimum spacing between releases. Every
//! exchange gets a correlation id and exactly one audit record.
//!
//! # Components
//!
//! - [`admission`]: FIFO queue of in-flight requests and the rate gate
//! - [`forwarder`]: relays released requests and streams responses back
//! - [`exchange`]: exactly-once slot reclamation and audit emission
//! - [`audit`]: audit sinks, including the Loggly bulk shipper
//! - [`proxy_service`]: the tower service wiring it all together

pub mod admission;
pub mod audit;
pub mod config;
pub mod error;
pub mod exchange;
pub mod exchange_body;
pub mod forwarder;
pub mod logging_layer;
pub mod metrics;
pub mod proxy_service;
pub mod timeout;
