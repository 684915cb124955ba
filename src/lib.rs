pub mod cli;
pub mod clustering;
pub mod config;
pub mod device;
pub mod display;
pub mod frame;
pub mod markers;
pub mod pipeline;
pub mod source;
pub mod storage;
pub mod tracking;
