pub mod matcher;
pub mod singleflight;
pub mod tls;
