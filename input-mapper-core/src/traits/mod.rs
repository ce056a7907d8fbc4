pub mod capture_delegate;
pub mod device_platform;
pub mod device_session;
pub mod frame_sink;
pub mod notification_source;
