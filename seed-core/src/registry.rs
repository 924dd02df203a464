//! Tracker directory: who is registered, which files they hold, and on which port they serve.
//!
//! Plain data; the tracker shares one instance behind a readers-writer lock.

use std::collections::{HashMap, VecDeque};

use crate::protocol::FileBitmap;

/// One registered peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRecord {
    pub client_id: String,
    pub bitmap: FileBitmap,
    pub service_port: u16,
}

/// Answer to a file lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Holder {
    pub client_id: String,
    pub port: u16,
}

/// Completed downloads kept in memory; older entries are dropped first.
pub const COMPLETION_HISTORY: usize = 1024;

/// A completed download reported through `LOG`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRecord {
    pub file_id: u32,
    pub client_id: String,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("client {0} is already registered")]
    Duplicate(String),
}

/// clientId -> record, fileId -> holders in registration order.
#[derive(Debug, Default)]
pub struct Registry {
    clients: HashMap<String, ClientRecord>,
    index: Vec<Vec<String>>,
    completions: VecDeque<CompletionRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.clients.contains_key(client_id)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Insert a record and append its id to the bucket of every file it holds.
    /// An existing registration with the same id wins.
    pub fn register(&mut self, record: ClientRecord) -> Result<(), RegistryError> {
        if self.clients.contains_key(&record.client_id) {
            return Err(RegistryError::Duplicate(record.client_id));
        }
        if self.index.len() < record.bitmap.len() {
            self.index.resize_with(record.bitmap.len(), Vec::new);
        }
        for file_id in record.bitmap.held_ids() {
            self.index[file_id].push(record.client_id.clone());
        }
        self.clients.insert(record.client_id.clone(), record);
        Ok(())
    }

    /// Remove a client and purge it from every bucket its bitmap names.
    pub fn remove(&mut self, client_id: &str) -> Option<ClientRecord> {
        let record = self.clients.remove(client_id)?;
        for file_id in record.bitmap.held_ids() {
            if let Some(bucket) = self.index.get_mut(file_id) {
                bucket.retain(|id| id != client_id);
            }
        }
        Some(record)
    }

    /// Oldest registered holder of `file_id`.
    pub fn lookup(&self, file_id: u32) -> Option<Holder> {
        let first = self.holders(file_id).first()?;
        let record = self.clients.get(first)?;
        Some(Holder {
            client_id: record.client_id.clone(),
            port: record.service_port,
        })
    }

    /// Holders of `file_id` in registration order. Empty when out of range.
    pub fn holders(&self, file_id: u32) -> &[String] {
        usize::try_from(file_id)
            .ok()
            .and_then(|i| self.index.get(i))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Append to the completion history, evicting the oldest entry past [`COMPLETION_HISTORY`].
    pub fn record_completion(&mut self, file_id: u32, client_id: &str) {
        if self.completions.len() == COMPLETION_HISTORY {
            self.completions.pop_front();
        }
        self.completions.push_back(CompletionRecord {
            file_id,
            client_id: client_id.to_string(),
        });
    }

    /// Most recent completions, oldest first.
    pub fn completions(&self) -> &VecDeque<CompletionRecord> {
        &self.completions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, bits: &str, port: u16) -> ClientRecord {
        ClientRecord {
            client_id: id.to_string(),
            bitmap: FileBitmap::from_bits(bits.chars().map(|c| c == '1').collect()),
            service_port: port,
        }
    }

    #[test]
    fn lookup_returns_oldest_holder() {
        let mut reg = Registry::new();
        reg.register(record("A", "0100", 9001)).unwrap();
        reg.register(record("B", "0110", 9002)).unwrap();
        assert_eq!(
            reg.lookup(1),
            Some(Holder {
                client_id: "A".into(),
                port: 9001
            })
        );
        assert_eq!(reg.lookup(2).map(|h| h.port), Some(9002));
        assert_eq!(reg.holders(1), &["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn out_of_range_and_unheld_lookups() {
        let mut reg = Registry::new();
        reg.register(record("A", "0100", 9001)).unwrap();
        assert_eq!(reg.lookup(0), None);
        assert_eq!(reg.lookup(4), None);
        assert_eq!(reg.lookup(u32::MAX), None);
    }

    #[test]
    fn duplicate_registration_rejected_existing_wins() {
        let mut reg = Registry::new();
        reg.register(record("A", "0100", 9001)).unwrap();
        assert_eq!(
            reg.register(record("A", "1000", 9999)),
            Err(RegistryError::Duplicate("A".into()))
        );
        assert_eq!(reg.lookup(1).map(|h| h.port), Some(9001));
        assert_eq!(reg.lookup(0), None);
        assert_eq!(reg.client_count(), 1);
    }

    #[test]
    fn remove_purges_buckets() {
        let mut reg = Registry::new();
        reg.register(record("A", "0110", 9001)).unwrap();
        reg.register(record("B", "0100", 9002)).unwrap();
        assert!(reg.remove("A").is_some());
        assert_eq!(reg.lookup(1).map(|h| h.client_id), Some("B".into()));
        assert_eq!(reg.lookup(2), None);
        assert!(!reg.contains("A"));
        assert!(reg.remove("A").is_none());
    }

    #[test]
    fn completions_are_recorded_in_order() {
        let mut reg = Registry::new();
        reg.record_completion(1, "A");
        reg.record_completion(3, "B");
        assert_eq!(reg.completions().len(), 2);
        assert_eq!(reg.completions()[1].file_id, 3);
    }

    #[test]
    fn completion_history_is_bounded() {
        let mut reg = Registry::new();
        for i in 0..COMPLETION_HISTORY as u32 + 10 {
            reg.record_completion(i, "A");
        }
        assert_eq!(reg.completions().len(), COMPLETION_HISTORY);
        assert_eq!(reg.completions()[0].file_id, 10);
        assert_eq!(
            reg.completions().back().map(|c| c.file_id),
            Some(COMPLETION_HISTORY as u32 + 9)
        );
    }
}
