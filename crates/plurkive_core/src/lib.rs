pub mod archive;
pub mod config;
pub mod fts;
pub mod import;
pub mod links;
pub mod migrate;
pub mod preview;
pub mod runtime;
pub mod scan;
pub mod search;
pub mod server;
pub mod store;
