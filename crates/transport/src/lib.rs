//! Stream utilities for the relay data path: replaying demultiplexer
//! look-ahead bytes, one-shot first-payload sniffing, and rate-limited
//! byte pumping.

mod forward;
mod limit;
mod rewind;
mod sniff;

pub use forward::{copy_rate_limited, COPY_BUFFER_SIZE, RELAY_IO_TIMEOUT};
pub use limit::{FlowLimiter, LIMIT_SHARDS};
pub use rewind::Rewind;
pub use sniff::SniffStream;
