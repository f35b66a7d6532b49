pub mod app;
pub mod audio;
pub mod checkin;
pub mod config;
pub mod relay;
pub mod telemetry;
