//! Security objects of the satellite.

use log::debug;
use parking_lot::RwLock;

/// Holds the master key used to decrypt encrypted volume definitions.
#[derive(Debug, Default)]
pub struct SecurityObjects {
    crypt_key: RwLock<Option<Vec<u8>>>,
}

impl SecurityObjects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_crypt_key(&self, key: Vec<u8>) {
        debug!("Master key received");
        *self.crypt_key.write() = Some(key);
    }

    pub fn clear_crypt_key(&self) {
        *self.crypt_key.write() = None;
    }

    pub fn is_crypt_key_available(&self) -> bool {
        self.crypt_key.read().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crypt_key_availability() {
        let security = SecurityObjects::new();
        assert!(!security.is_crypt_key_available());
        security.set_crypt_key(vec![1, 2, 3]);
        assert!(security.is_crypt_key_available());
        security.clear_crypt_key();
        assert!(!security.is_crypt_key_available());
    }
}
