pub mod capture;
pub mod recorder;
pub mod tap_manager;
