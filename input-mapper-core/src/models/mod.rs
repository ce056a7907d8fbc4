pub mod config;
pub mod device;
pub mod error;
pub mod frame;
pub mod notification;
pub mod report;
pub mod state;
