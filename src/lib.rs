pub mod config;
pub mod proxy;

pub use config::{ConfigError, Endpoint, Family};
pub use proxy::{
    classify, BackendKind, Backends, Mux, MuxConfig, MuxStats, Session, SniffConfig,
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_SNIFF_TIMEOUT,
};
