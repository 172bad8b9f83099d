//! Passthrough-only proxy.
//!
//! A proxy has no local functions. Every request for its UID is forwarded to
//! the upstream daemon according to the device's passthrough policy, so a
//! real device behind another daemon appears as if it were connected here.

use brickemu_daemon::{FunctionTable, TableError};

/// Device type name.
pub const TYPE_NAME: &str = "ProxyDevice";

/// Builds the (empty) function table of the proxy.
///
/// # Errors
///
/// Returns an error if a registration is rejected.
pub fn table() -> Result<FunctionTable<()>, TableError> {
    FunctionTable::builder(TYPE_NAME).build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_has_no_local_functions() {
        let table = table().unwrap();
        assert!(table.request_ids().is_empty());
        assert!(!table.capabilities().enumerate);
        assert!(table.autoruns().is_empty());
    }
}
