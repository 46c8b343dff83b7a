// Vehicle counting pipeline: detectors, fusion, tracking, crossing counts

pub mod batch;
pub mod counting;
pub mod crossing;
pub mod detection;
pub mod ensemble;
pub mod fusion;
pub mod render;
pub mod still;
pub mod tracker;
pub mod types;
