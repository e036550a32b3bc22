pub mod archive;
pub mod init;
pub mod store;
pub mod tokens;
pub mod views;
