//! Forwarding DNS proxy core
//!
//! # Module structure
//!
//! * `framing` - byte-level DNS header/QID access, question decoding (C1)
//! * `topology` - interfaces and their server rings (C2)
//! * `qid` - the process-wide QID allocator (C3)
//! * `query_table` - the outstanding-query arena and lifecycle (C4)
//! * `egress` - ephemeral upstream socket allocation (C5)
//! * `dispatcher` - upstream/interface selection and send (C6)
//! * `correlator` - reply receipt, validation and client delivery (C7)
//! * `liveness` - timeout sweep and retry-probe scheduling (C8)
//! * `cache` - response cache (C9, ambient)
//! * `masterfile` - optional "don't know" / blacklist responder (ambient)
//! * `context` - the `Daemon` value tying every component together
//! * `daemon` - the single-threaded `mio` event loop
//! * `errors` - shared error types

pub mod cache;
pub mod context;
pub mod correlator;
pub mod daemon;
pub mod dispatcher;
pub mod egress;
pub mod errors;
pub mod framing;
pub mod liveness;
pub mod masterfile;
pub mod qid;
pub mod query_table;
pub mod topology;
