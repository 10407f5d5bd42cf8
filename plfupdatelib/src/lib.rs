pub mod check;
pub mod checksum;
pub mod constants;
pub mod downloader;
pub mod error;
pub mod file;
pub mod guard;
pub mod http;
pub mod install;
pub mod manager;
pub mod plf;
pub mod product;
mod run;
pub mod store;
pub mod transfer;
pub mod transport;
pub mod uploader;
pub mod version;

#[cfg(test)]
mod mock;
