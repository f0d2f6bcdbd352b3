mod error;

pub mod gateway;
pub mod utils;

pub use error::{MeterError, Result};

pub use gateway::{
    MeteredProxy, ProxyError, ProxyErrorKind, ProxyRequest, ProxyResponse, ProxySettings,
};
