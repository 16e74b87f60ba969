pub mod app;
pub mod config;
pub mod config_io;
pub mod coordinator;
pub mod crawl;
pub mod dedup;
pub mod logging;
pub mod net;
pub mod protocol;
pub mod single_instance;
