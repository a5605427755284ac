pub mod calibration;
pub mod config;
pub mod error;
pub mod pose;
pub mod projection;
pub mod recording;
pub mod scene;
pub mod tracker;
