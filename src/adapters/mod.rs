// Adapters layer: concrete implementations of the domain ports (stores, dispatchers, stream payloads)

pub mod dynamo_stream;
pub mod memory;
pub mod spade;

#[cfg(feature = "lambda")]
pub mod dynamo;
