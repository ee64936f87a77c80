pub mod multipart;
pub mod multiplexer;
pub mod transport;
