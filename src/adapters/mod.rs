//! Endpoint implementations and the protocol registry.

use std::collections::HashMap;

use anyhow::{Result, bail};

use crate::core::endpoint::Endpoint;

pub mod local;
pub mod memory;

/// Builds an endpoint for a host string such as `user@example.org:21`.
pub type EndpointFactory = Box<dyn Fn(&str) -> Result<Box<dyn Endpoint>> + Send + Sync>;

/// Protocol name to endpoint constructor, resolved once per endpoint.
#[derive(Default)]
pub struct EndpointRegistry {
    factories: HashMap<String, EndpointFactory>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `file` protocol.
    pub fn with_builtin(sync_files: bool) -> Self {
        let mut registry = Self::new();
        registry.register(
            "file",
            Box::new(move |_host: &str| -> Result<Box<dyn Endpoint>> {
                Ok(Box::new(local::LocalEndpoint::new(sync_files)))
            }),
        );
        registry
    }

    pub fn register(&mut self, protocol: &str, factory: EndpointFactory) {
        self.factories.insert(protocol.to_string(), factory);
    }

    pub fn protocols(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn open(&self, protocol: &str, host: &str) -> Result<Box<dyn Endpoint>> {
        match self.factories.get(protocol) {
            Some(factory) => factory(host),
            None => bail!(
                "unsupported protocol '{}' (known: {})",
                protocol,
                self.protocols().join(", ")
            ),
        }
    }
}

/// A `protocol://host/path` location. Plain paths are local files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub protocol: String,
    pub host: String,
    pub path: String,
}

impl Location {
    pub fn parse(location: &str) -> Self {
        let Some((protocol, rest)) = location.split_once("://") else {
            return Self {
                protocol: "file".to_string(),
                host: String::new(),
                path: location.to_string(),
            };
        };
        let (host, path) = match rest.find('/') {
            Some(index) => (&rest[..index], &rest[index..]),
            None => (rest, "/"),
        };
        Self {
            protocol: protocol.to_string(),
            host: host.to_string(),
            path: path.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_path_is_local() {
        let location = Location::parse("/tmp/data");
        assert_eq!(location.protocol, "file");
        assert_eq!(location.path, "/tmp/data");
    }

    #[test]
    fn test_parse_url() {
        let location = Location::parse("sftp://joe@example.org:22/home/joe");
        assert_eq!(location.protocol, "sftp");
        assert_eq!(location.host, "joe@example.org:22");
        assert_eq!(location.path, "/home/joe");

        let location = Location::parse("file:///var/tmp");
        assert_eq!(location.host, "");
        assert_eq!(location.path, "/var/tmp");
    }

    #[test]
    fn test_unknown_protocol_rejected() {
        let registry = EndpointRegistry::with_builtin(false);
        let error = registry.open("gopher", "example.org").err().unwrap();
        assert!(error.to_string().contains("known: file"));
        assert!(registry.open("file", "").is_ok());
    }
}
