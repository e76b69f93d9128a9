pub mod cache;
pub mod config;
pub mod conflicts;
pub mod init;
pub mod providers;
pub mod sync;
