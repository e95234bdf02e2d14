// Domain layer: core models and ports (interfaces). No I/O here.

pub mod graph;
pub mod model;
pub mod ports;
