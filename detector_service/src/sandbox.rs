use crate::error::DetectorError;
use parking_lot::Mutex;
use std::{collections::HashMap, fmt, path::PathBuf};

/// Identity of a connected client, derived from the service and connection names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientName(String);

impl ClientName {
    pub fn new(service_name: &str, connection_name: &str) -> Self {
        Self(format!("{}_{}", service_name, connection_name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Directory name for this client. Alphanumerics and `-` are kept, every
    /// other byte is written as `_xx`, so distinct names never collide.
    fn dir_name(&self) -> String {
        let mut out = String::with_capacity(self.0.len());
        for c in self.0.chars() {
            if c.is_ascii_alphanumeric() || c == '-' {
                out.push(c);
            } else {
                let mut buf = [0u8; 4];
                for byte in c.encode_utf8(&mut buf).bytes() {
                    out.push_str(&format!("_{:02x}", byte));
                }
            }
        }
        out
    }
}

impl fmt::Display for ClientName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug)]
pub struct SandboxManager {
    root: PathBuf,
    clients: Mutex<HashMap<ClientName, PathBuf>>,
}

impl SandboxManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the client's working directory, creating it on first use.
    pub fn client_dir(&self, client: &ClientName) -> Result<PathBuf, DetectorError> {
        let mut clients = self.clients.lock();
        if let Some(dir) = clients.get(client) {
            if dir.is_dir() {
                return Ok(dir.clone());
            }
        }

        let dir = self.root.join(client.dir_name());
        std::fs::create_dir_all(&dir).map_err(|source| DetectorError::SandboxCreationFailed {
            path: dir.clone(),
            source,
        })?;
        tracing::debug!("Created sandbox {:?} for client {}", dir, client);

        clients.insert(client.clone(), dir.clone());
        Ok(dir)
    }

    /// Removes the client's directory. Returns whether one existed.
    pub fn clear(&self, client: &ClientName) -> std::io::Result<bool> {
        let dir = self
            .clients
            .lock()
            .remove(client)
            .unwrap_or_else(|| self.root.join(client.dir_name()));

        if dir.is_dir() {
            std::fs::remove_dir_all(&dir)?;
            tracing::debug!("Cleared sandbox {:?} for client {}", dir, client);
            return Ok(true);
        }
        Ok(false)
    }

    /// Ends every client session and removes its directory. Returns how many
    /// directories were removed.
    pub fn clear_all(&self) -> usize {
        let clients: Vec<ClientName> = self.clients.lock().keys().cloned().collect();
        clients
            .iter()
            .filter(|client| match self.clear(client) {
                Ok(removed) => removed,
                Err(e) => {
                    tracing::warn!("Cannot clear sandbox of {}: {}", client, e);
                    false
                }
            })
            .count()
    }
}
