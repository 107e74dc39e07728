//! Key container records consumed from the external store.
//!
//! The store itself (encryption, persistence, UI) lives outside this
//! crate; what crosses the boundary is groups of slots with key
//! material as hex strings. Conversion to [`KeyItem`] happens here so
//! hex never travels through the protocol core. Field names match the
//! KFDtool desktop container JSON.

use serde::{Deserialize, Serialize};

use crate::error::KfdError;
use crate::p25::{AlgorithmId, KeyItem};

/// One key within a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySlot {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub algorithm_id: u8,
    pub key_id: u16,
    pub sln: u16,
    pub key_hex: String,
    #[serde(default = "default_selected")]
    pub selected: bool,
}

fn default_selected() -> bool {
    true
}

impl KeySlot {
    pub fn algorithm(&self) -> AlgorithmId {
        AlgorithmId::from(self.algorithm_id)
    }

    /// Decode the hex material and build a protocol key item, checking
    /// the length against the declared algorithm.
    pub fn to_key_item(&self, keyset_id: u8) -> Result<KeyItem, KfdError> {
        let material = hex::decode(&self.key_hex)
            .map_err(|err| KfdError::Config(format!("key '{}': bad hex: {err}", self.name)))?;
        KeyItem::new(keyset_id, self.sln, self.key_id, self.algorithm(), material)
            .map_err(|err| KfdError::Config(format!("key '{}': {err}", self.name)))
    }
}

/// A named collection of keys sharing a keyset id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyGroup {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub keyset_id: u8,
    #[serde(default)]
    pub keys: Vec<KeySlot>,
}

impl KeyGroup {
    pub fn selected_slots(&self) -> impl Iterator<Item = &KeySlot> {
        self.keys.iter().filter(|slot| slot.selected)
    }

    /// Convert the selected subset into protocol key items, ready for
    /// `keyload_multiple`.
    pub fn selected_key_items(&self) -> Result<Vec<KeyItem>, KfdError> {
        self.selected_slots()
            .map(|slot| slot.to_key_item(self.keyset_id))
            .collect()
    }
}
