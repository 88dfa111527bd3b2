pub mod controller;
pub mod flush;
pub mod mqtt;

pub use controller::SubscriberController;
pub use flush::{BatchFlusher, BatchSink, PostgresSink};
pub use mqtt::MqttIngest;
