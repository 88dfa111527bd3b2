pub mod sink;
pub mod streams;
pub mod worker;

pub use sink::{BatchSink, PostgresSink};
pub use streams::RedisStreamSource;
pub use worker::{StreamEntry, StreamSource, StreamWorker};
