use std::sync::{Arc, RwLock};

/// Everything needed to dial and authenticate against the coordination
/// service. Never mutated in place: updates build a new value and swap it in.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct ConnectionSettings {
    pub address: String,
    pub api_key: String,
    pub insecure: bool,
    pub tls: Option<TlsMaterial>,
}

impl std::fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("address", &self.address)
            .field("api_key", &api_key_prefix(&self.api_key))
            .field("insecure", &self.insecure)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
    pub ca: Option<Vec<u8>>,
    pub server_name: Option<String>,
}

/// Transport chosen for a dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Tls,
    Plaintext,
    /// Neither TLS material nor `insecure` configured.
    Unspecified,
}

impl ConnectionSettings {
    pub fn transport_mode(&self) -> TransportMode {
        if self.tls.is_some() {
            TransportMode::Tls
        } else if self.insecure {
            TransportMode::Plaintext
        } else {
            TransportMode::Unspecified
        }
    }

    pub fn with_api_key(&self, api_key: String) -> Self {
        Self {
            api_key,
            ..self.clone()
        }
    }
}

/// The part of a key before the first `.`, safe to log.
pub fn api_key_prefix(key: &str) -> &str {
    key.split('.').next().unwrap_or_default()
}

/// Live settings published by whole-value replacement.
#[derive(Debug, Default)]
pub struct SharedSettings {
    current: RwLock<Arc<ConnectionSettings>>,
}

impl SharedSettings {
    pub fn new(settings: ConnectionSettings) -> Self {
        Self {
            current: RwLock::new(Arc::new(settings)),
        }
    }

    pub fn load(&self) -> Arc<ConnectionSettings> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn replace(&self, settings: ConnectionSettings) {
        let next = Arc::new(settings);
        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    pub fn set_api_key(&self, api_key: String) {
        let next = self.load().with_api_key(api_key);
        self.replace(next);
    }
}

/// Extra CA certificates (PEM) trusted for every TLS dial by this manager.
#[derive(Debug, Default)]
pub struct TrustPool {
    certs: RwLock<Arc<Vec<Vec<u8>>>>,
}

impl TrustPool {
    /// Add a PEM bundle. Returns false when it was already present.
    pub fn add(&self, pem: &[u8]) -> bool {
        let current = self.certificates();
        if current.iter().any(|c| c.as_slice() == pem) {
            return false;
        }
        let mut next = current.as_ref().clone();
        next.push(pem.to_vec());
        let next = Arc::new(next);
        match self.certs.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        true
    }

    pub fn certificates(&self) -> Arc<Vec<Vec<u8>>> {
        match self.certs.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }
}
