//! Shared daemon-level error aggregation.
//!
//! Each subsystem (framing, topology, qid, query table, egress, cache)
//! owns its own small error enum and local `Result` alias. `DaemonError`
//! exists only to aggregate them with `From` at the points -- config
//! loading, daemon setup, the event loop -- where more than one
//! subsystem's errors can surface together, built with `derive_more`
//! like the rest of `src/dns`.

use derive_more::{Display, Error, From};

use crate::dns::cache::CacheError;
use crate::dns::egress::EgressError;
use crate::dns::framing::FramingError;
use crate::dns::qid::QidPoolExhausted;
use crate::dns::topology::TopologyError;

#[derive(Debug, Display, From, Error)]
pub enum DaemonError {
    Framing(FramingError),
    Topology(TopologyError),
    QidPool(QidPoolExhausted),
    Egress(EgressError),
    Cache(CacheError),
    Io(std::io::Error),
    #[display(fmt = "configuration error: {}", _0)]
    Config(String),
}

pub type Result<T> = std::result::Result<T, DaemonError>;
