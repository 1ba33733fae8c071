//! relaydns
//!
//! A caching, forwarding DNS proxy daemon.
//!
//! Clients send recursive queries to a local UDP listener; the daemon
//! forwards each query to one or more upstream servers -- potentially
//! fanning out across several egress interfaces -- aggregates the first
//! usable reply, caches it, and returns it to the client. Upstream
//! liveness is tracked continuously: servers that stop answering are
//! deactivated and probed periodically until they recover.
//!
//! # Architecture
//!
//! Everything lives behind one [`dns::daemon::Daemon`] value driven by a
//! single-threaded `mio` event loop -- there is no thread pool and no
//! locking in the hot path beyond what the response cache needs. See
//! `dns` for the component breakdown.

/// DNS forwarding engine: framing, topology, query table, dispatch,
/// correlation, liveness, and the ambient cache/masterfile stack.
pub mod dns;

/// Command-line and file-based configuration, external to the core.
pub mod config;
