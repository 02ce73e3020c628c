//! On-demand application pool for a local development proxy

pub mod admin;
pub mod app;
pub mod config;
pub mod docker;
pub mod error;
pub mod events;
pub mod group;
pub mod linebuffer;
pub mod pool;
pub mod process;
pub mod proxy;
pub mod watch;
