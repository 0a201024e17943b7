//! Wire format and delivery seams
//!
//! `protocol` owns the message enum and its bincode encoding; `transport`
//! owns packets, the factory trait that builds them and the sink that
//! receives each observer's batch.

pub mod protocol;
pub mod transport;
