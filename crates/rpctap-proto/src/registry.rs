use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::RwLock;

use prost_reflect::{DescriptorPool, MessageDescriptor};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read descriptor set {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to decode descriptor set: {0}")]
    Decode(#[from] prost_reflect::DescriptorError),
}

/// Maps `service/method` to request and response message descriptors.
///
/// Entries are installed lazily on first encounter of a method, trying the
/// service descriptor first and naming conventions second. A miss (including
/// a partial one) is remembered and never retried; absence is a valid
/// terminal state the decoder reports per frame.
pub struct MessageRegistry {
    pool: DescriptorPool,
    state: RwLock<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    requests: HashMap<String, MessageDescriptor>,
    responses: HashMap<String, MessageDescriptor>,
    attempted: HashSet<String>,
}

const NAMING_PATTERNS: [(&str, &str); 3] = [("Request", "Response"), ("Req", "Resp"), ("", "Response")];

impl Default for MessageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::with_pool(DescriptorPool::new())
    }

    pub fn with_pool(pool: DescriptorPool) -> Self {
        Self {
            pool,
            state: RwLock::new(RegistryState::default()),
        }
    }

    pub fn from_descriptor_set_bytes(bytes: &[u8]) -> Result<Self, RegistryError> {
        Ok(Self::with_pool(DescriptorPool::decode(bytes)?))
    }

    pub fn from_descriptor_set_file(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| RegistryError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_descriptor_set_bytes(&bytes)
    }

    /// Populates the `(service, method)` entry if it has never been tried.
    pub fn ensure(&self, service: &str, method: &str) {
        if service.is_empty() || method.is_empty() {
            return;
        }
        let key = registry_key(service, method);
        {
            let state = self.state.read().expect("registry lock poisoned");
            if state.attempted.contains(&key) {
                return;
            }
        }

        let resolved = self
            .resolve_from_service_descriptor(service, method)
            .or_else(|| self.resolve_from_naming_conventions(service, method));

        let mut state = self.state.write().expect("registry lock poisoned");
        state.attempted.insert(key.clone());
        if let Some((request, response)) = resolved {
            if let Some(descriptor) = request {
                state.requests.insert(key.clone(), descriptor);
            }
            if let Some(descriptor) = response {
                state.responses.insert(key, descriptor);
            }
        }
    }

    pub fn request_type(&self, service: &str, method: &str) -> Option<MessageDescriptor> {
        let state = self.state.read().expect("registry lock poisoned");
        state.requests.get(&registry_key(service, method)).cloned()
    }

    pub fn response_type(&self, service: &str, method: &str) -> Option<MessageDescriptor> {
        let state = self.state.read().expect("registry lock poisoned");
        state.responses.get(&registry_key(service, method)).cloned()
    }

    /// Explicit installation, overriding whatever lazy resolution would find.
    pub fn register(
        &self,
        service: &str,
        method: &str,
        request: Option<MessageDescriptor>,
        response: Option<MessageDescriptor>,
    ) {
        let key = registry_key(service, method);
        let mut state = self.state.write().expect("registry lock poisoned");
        state.attempted.insert(key.clone());
        if let Some(descriptor) = request {
            state.requests.insert(key.clone(), descriptor);
        }
        if let Some(descriptor) = response {
            state.responses.insert(key, descriptor);
        }
    }

    pub fn register_by_name(
        &self,
        service: &str,
        method: &str,
        request_type: &str,
        response_type: &str,
    ) -> bool {
        let request = self.pool.get_message_by_name(request_type);
        let response = self.pool.get_message_by_name(response_type);
        if request.is_none() && response.is_none() {
            return false;
        }
        self.register(service, method, request, response);
        true
    }

    pub fn message_by_name(&self, name: &str) -> Option<MessageDescriptor> {
        self.pool.get_message_by_name(name)
    }

    #[allow(clippy::type_complexity)]
    fn resolve_from_service_descriptor(
        &self,
        service: &str,
        method: &str,
    ) -> Option<(Option<MessageDescriptor>, Option<MessageDescriptor>)> {
        let descriptor = self.pool.get_service_by_name(service)?;
        let method = descriptor
            .methods()
            .find(|candidate| candidate.name() == method)?;
        Some((Some(method.input()), Some(method.output())))
    }

    #[allow(clippy::type_complexity)]
    fn resolve_from_naming_conventions(
        &self,
        service: &str,
        method: &str,
    ) -> Option<(Option<MessageDescriptor>, Option<MessageDescriptor>)> {
        let package = service.rsplit_once('.').map(|(package, _)| package)?;

        for (request_suffix, response_suffix) in NAMING_PATTERNS {
            let request = self
                .pool
                .get_message_by_name(&format!("{package}.{method}{request_suffix}"));
            let response = self
                .pool
                .get_message_by_name(&format!("{package}.{method}{response_suffix}"));
            if request.is_some() || response.is_some() {
                return Some((request, response));
            }
        }
        None
    }
}

fn registry_key(service: &str, method: &str) -> String {
    format!("{service}/{method}")
}
