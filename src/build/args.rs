//! Insertion-ordered build arguments.

use serde::Serialize;

/// `--build-arg` values in the order they were first set. Setting a key
/// again replaces its value without moving it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildArgs(Vec<(String, String)>);

impl BuildArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn keys(&self) -> Vec<&str> {
        self.0.iter().map(|(k, _)| k.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `--build-arg=KEY=VALUE` flags.
    pub fn to_flags(&self) -> Vec<String> {
        self.iter()
            .map(|(k, v)| format!("--build-arg={k}={v}"))
            .collect()
    }
}
