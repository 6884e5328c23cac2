// Domain layer: ferry/cargo models and the ports the consumers talk through.

pub mod model;
pub mod ports;
