//! Session credential storage consulted by the request builder.
//!
//! The pipeline reads the credential when it builds a request and writes it back
//! whenever a response carries a renewed token header, so implementations must
//! tolerate concurrent `get`/`set` from different tasks.

use std::sync::RwLock;

/// Source of the bearer credential attached to outgoing requests.
pub trait CredentialProvider: Send + Sync {
    /// Current credential, or `None` when signed out.
    fn get(&self) -> Option<String>;

    /// Replace the stored credential.
    fn set(&self, token: String);

    /// Forget the stored credential.
    fn clear(&self) {}
}

/// In-memory credential cell.
#[derive(Debug, Default)]
pub struct MemoryCredentials {
    token: RwLock<Option<String>>,
}

impl MemoryCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        let token = token.into();
        Self {
            token: RwLock::new(Some(token).filter(|t| !t.trim().is_empty())),
        }
    }
}

impl CredentialProvider for MemoryCredentials {
    fn get(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set(&self, token: String) {
        let mut slot = self
            .token
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(token).filter(|t| !t.trim().is_empty());
    }

    fn clear(&self) {
        let mut slot = self
            .token
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_tokens_are_treated_as_signed_out() {
        let creds = MemoryCredentials::new("  ");
        assert_eq!(creds.get(), None);
        creds.set("tok".into());
        assert_eq!(creds.get().as_deref(), Some("tok"));
        creds.clear();
        assert_eq!(creds.get(), None);
    }
}
