//! Backend credentials in the OS credential store.
//!
//! Windows Credential Manager, macOS Keychain and the Linux Secret Service
//! are reached through the `keyring` crate. Environment variables take
//! precedence; see `config`.

use keyring::Entry;
use tracing::{info, warn};

const SERVICE_NAME: &str = "printshop-sync";

pub const KEY_BACKEND_URL: &str = "backend_url";
pub const KEY_API_KEY: &str = "api_key";
pub const KEY_MACHINE_ID: &str = "machine_id";

const ALL_KEYS: &[&str] = &[KEY_BACKEND_URL, KEY_API_KEY, KEY_MACHINE_ID];

/// Retrieve a single credential. Returns `None` when the entry does not exist
/// or the platform store is unavailable.
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw).filter(|v| !v.trim().is_empty()),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

pub fn set_credential(key: &str, value: &str) -> Result<(), keyring::Error> {
    Entry::new(SERVICE_NAME, key)?.set_password(value)
}

/// Silently succeeds if the entry does not exist.
pub fn delete_credential(key: &str) -> Result<(), keyring::Error> {
    match Entry::new(SERVICE_NAME, key)?.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Remove every stored credential.
pub fn clear_credentials() -> Result<(), keyring::Error> {
    info!("Clearing stored backend credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(())
}
