use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

/// Device key store consulted while verifying MACs.
pub trait DeviceStore: Send + Sync {
    /// Returns the unpadded base64 ed25519 fingerprint of a known device.
    fn device_fingerprint(&self, user_id: &str, device_id: &str) -> Option<String>;

    /// Records that a device has been verified.
    fn mark_verified(&self, user_id: &str, device_id: &str);

    /// Whether a device has been verified locally.
    fn is_verified(&self, user_id: &str, device_id: &str) -> bool;
}

/// Cross-signing state consulted for QR codes and master key MACs.
pub trait CrossSigning: Send + Sync {
    /// Whether our own cross-signing identity is set up and trusted.
    fn is_trusted(&self) -> bool;

    /// Our own master key, if any.
    fn my_master_key(&self) -> Option<String>;

    /// The master key we know for another user.
    fn user_master_key(&self, user_id: &str) -> Option<String>;

    /// Marks another user's master key as verified.
    fn mark_master_key_trusted(&self, user_id: &str);
}

/// In-memory [`DeviceStore`].
#[derive(Debug, Default)]
pub struct MemoryDeviceStore {
    devices: RwLock<HashMap<(String, String), String>>,
    verified: RwLock<HashSet<(String, String)>>,
}

impl MemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a device's fingerprint.
    pub fn add_device(&self, user_id: &str, device_id: &str, fingerprint: &str) {
        self.devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key(user_id, device_id), fingerprint.to_string());
    }
}

fn key(user_id: &str, device_id: &str) -> (String, String) {
    (user_id.to_string(), device_id.to_string())
}

impl DeviceStore for MemoryDeviceStore {
    fn device_fingerprint(&self, user_id: &str, device_id: &str) -> Option<String> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key(user_id, device_id))
            .cloned()
    }

    fn mark_verified(&self, user_id: &str, device_id: &str) {
        self.verified
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key(user_id, device_id));
    }

    fn is_verified(&self, user_id: &str, device_id: &str) -> bool {
        self.verified
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&key(user_id, device_id))
    }
}

/// In-memory [`CrossSigning`] state. Untrusted and empty by default.
#[derive(Debug, Default)]
pub struct MemoryCrossSigning {
    my_master_key: RwLock<Option<String>>,
    master_keys: RwLock<HashMap<String, String>>,
    trusted_users: RwLock<HashSet<String>>,
}

impl MemoryCrossSigning {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets our own trusted master key.
    pub fn set_my_master_key(&self, key: &str) {
        *self.my_master_key.write().unwrap_or_else(PoisonError::into_inner) = Some(key.to_string());
    }

    /// Records the master key published by another user.
    pub fn add_user_master_key(&self, user_id: &str, key: &str) {
        self.master_keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id.to_string(), key.to_string());
    }

    /// Whether a user's master key was marked trusted.
    pub fn is_user_trusted(&self, user_id: &str) -> bool {
        self.trusted_users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(user_id)
    }
}

impl CrossSigning for MemoryCrossSigning {
    fn is_trusted(&self) -> bool {
        self.my_master_key().is_some()
    }

    fn my_master_key(&self) -> Option<String> {
        self.my_master_key.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn user_master_key(&self, user_id: &str) -> Option<String> {
        self.master_keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .cloned()
    }

    fn mark_master_key_trusted(&self, user_id: &str) {
        self.trusted_users
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_store() {
        let store = MemoryDeviceStore::new();
        store.add_device("@bob:example.org", "BOBDEVICE", "fingerprint");

        assert_eq!(
            store.device_fingerprint("@bob:example.org", "BOBDEVICE").as_deref(),
            Some("fingerprint")
        );
        assert!(store.device_fingerprint("@bob:example.org", "OTHER").is_none());

        assert!(!store.is_verified("@bob:example.org", "BOBDEVICE"));
        store.mark_verified("@bob:example.org", "BOBDEVICE");
        assert!(store.is_verified("@bob:example.org", "BOBDEVICE"));
    }

    #[test]
    fn test_cross_signing_trust() {
        let cross_signing = MemoryCrossSigning::new();
        assert!(!cross_signing.is_trusted());

        cross_signing.set_my_master_key("master");
        cross_signing.add_user_master_key("@bob:example.org", "bob-master");
        assert!(cross_signing.is_trusted());
        assert_eq!(cross_signing.user_master_key("@bob:example.org").as_deref(), Some("bob-master"));

        cross_signing.mark_master_key_trusted("@bob:example.org");
        assert!(cross_signing.is_user_trusted("@bob:example.org"));
    }
}
