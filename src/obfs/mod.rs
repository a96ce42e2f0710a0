//! Built-in obfuscation protocols
//!
//! Protocols are selected by name at configuration time; each provides a
//! [`ProtocolFactory`] the engine clones per listener.

mod null;
mod xor;

pub use null::{NullFactory, NullProtocol};
pub use xor::{XorFactory, XorProtocol};

use std::sync::Arc;

use crate::core::protocol::ProtocolFactory;
use crate::error::{Result, TunnelError};

/// Look up a protocol factory by name
pub fn factory(name: &str, key: Option<&str>) -> Result<Arc<dyn ProtocolFactory>> {
    match name {
        "null" => Ok(Arc::new(NullFactory)),
        "xor" => {
            let key = key
                .filter(|k| !k.is_empty())
                .ok_or_else(|| TunnelError::Config("xor protocol requires a key".to_string()))?;
            Ok(Arc::new(XorFactory::new(key.as_bytes())))
        }
        other => Err(TunnelError::Config(format!(
            "unknown protocol '{}'",
            other
        ))),
    }
}
