use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Identifier of a binary asset (tree icon) in the backend blob table.
pub type AssetId = i32;

/// Result of one asset round trip: `None` when the backend holds a null blob.
/// Ids the backend does not know at all are simply absent from the map.
pub type AssetMap = HashMap<AssetId, Option<Bytes>>;

/// Parent id carried by top-level nodes.
pub const ROOT_PARENT_ID: &str = "0";

/// One row of the backend node list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRow {
    /// Backend table the row was read from
    #[serde(default)]
    pub table: String,
    pub owner_id: i32,
    /// Backend row identity; documents link to folders through it
    pub key: i32,
    pub name: String,
    #[serde(default)]
    pub image_id: AssetId,
    pub id: String,
    /// `ROOT_PARENT_ID` (or empty) for top-level nodes
    #[serde(default)]
    pub parent_id: String,
    #[serde(default)]
    pub rank: i32,
}

impl NodeRow {
    /// Whether this row sits directly under the catalog root.
    pub fn is_top_level(&self) -> bool {
        let parent = self.parent_id.trim();
        parent.is_empty() || parent == ROOT_PARENT_ID
    }
}

/// One row of the backend document table.
///
/// Linking keys are optional because the backend table allows nulls;
/// a row with a zero or missing key is not a valid document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRow {
    /// `key` of the owning folder node
    #[serde(default)]
    pub owner_class_id: Option<i32>,
    #[serde(default)]
    pub doc_id: Option<i32>,
    #[serde(default)]
    pub designation: Option<String>,
    pub name: String,
    #[serde(default)]
    pub image_id: AssetId,
    #[serde(default)]
    pub rank: Option<i32>,
}

impl DocumentRow {
    /// Owning folder key, if the row carries a usable one.
    pub fn owner_key(&self) -> Option<i32> {
        self.owner_class_id.filter(|k| *k != 0)
    }

    /// Whether both linking keys are present and non-zero.
    pub fn is_linked(&self) -> bool {
        self.owner_key().is_some() && self.doc_id.is_some_and(|d| d != 0)
    }

    /// Display name: designation and name joined when a designation is present.
    pub fn display_name(&self) -> String {
        match self.designation.as_deref().map(str::trim) {
            Some(designation) if !designation.is_empty() => {
                format!("{} {}", designation, self.name.trim())
            }
            _ => self.name.trim().to_string(),
        }
    }
}
