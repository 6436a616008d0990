use serde_json::{Map, Value};

use crate::error::Result;

/// Arbitrary JSON side channel. The container stores it verbatim and
/// never inspects it; an empty map occupies no bytes on disk.
#[derive(Debug, Default)]
pub struct Metadata {
    data: Map<String, Value>,
}

impl Metadata {
    pub fn new() -> Self {
        Metadata::default()
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.data
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub(crate) fn load(block: &[u8]) -> Result<Self> {
        if block.is_empty() {
            return Ok(Metadata::default());
        }
        Ok(Metadata {
            data: serde_json::from_slice(block)?,
        })
    }

    pub(crate) fn dump(&self) -> Vec<u8> {
        if self.data.is_empty() {
            return Vec::new();
        }
        serde_json::to_vec(&self.data).expect("metadata serialization")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_occupies_no_bytes() {
        let meta = Metadata::new();
        assert!(meta.dump().is_empty());
        assert!(Metadata::load(&[]).expect("load failed").is_empty());
    }

    #[test]
    fn roundtrip() {
        let mut meta = Metadata::new();
        meta.data_mut().insert("source".to_string(), json!("camera-3"));
        meta.data_mut().insert("frame".to_string(), json!(17));

        let block = meta.dump();
        let loaded = Metadata::load(&block).expect("load failed");
        assert_eq!(loaded.data()["source"], json!("camera-3"));
        assert_eq!(loaded.data()["frame"], json!(17));
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(Metadata::load(b"{not json").is_err());
    }
}
