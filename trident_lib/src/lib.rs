use std::io;

use thiserror::Error;

pub mod app;
pub mod common;

pub use app::dns::{
    DnsConfig, DnsError, FakeDns, IpOption, NameServer, NameServerConfig, QueryStrategy, Resolver,
};
pub use app::logging::setup_logging;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    IpNet(#[from] ipnet::AddrParseError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("dns error: {0}")]
    DNSError(String),
}
