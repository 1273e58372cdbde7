use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct DataStore {
    entries: HashMap<u16, Vec<u8>>,
}

/// Splits the wParam of a save/restore request into `(ident, length)`.
pub fn split_data_param(wparam: usize) -> (u16, u16) {
    (((wparam >> 16) & 0xFFFF) as u16, (wparam & 0xFFFF) as u16)
}

impl DataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&mut self, ident: u16, data: &[u8]) -> bool {
        if data.is_empty() {
            return false;
        }
        self.entries.insert(ident, data.to_vec());
        true
    }

    pub fn release(&mut self, ident: u16, len: usize) -> Option<Vec<u8>> {
        let mut data = self.entries.remove(&ident)?;
        data.truncate(len);
        Some(data)
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
