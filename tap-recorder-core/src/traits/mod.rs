pub mod capture_delegate;
pub mod file_sink;
pub mod hal_gateway;
pub mod transport;
