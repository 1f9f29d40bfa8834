pub mod cache;
pub mod daemon;
pub mod debug;
