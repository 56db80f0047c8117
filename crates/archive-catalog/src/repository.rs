//! Node repository: the in-memory arena behind the catalog tree.
//!
//! The backend returns a flat node list and a flat document table. The
//! repository links the nodes into a parent -> children index on load and
//! merges a folder's documents into that index the first time the folder
//! is expanded.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use archive_catalog_core::{AssetId, CatalogSource, DocumentRow, NodeRow, ROOT_PARENT_ID};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::error::RepositoryError;

/// Id under which top-level nodes are indexed.
pub const ROOT_ID: &str = ROOT_PARENT_ID;

/// Kind of a catalog node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Folder,
    Document,
}

/// One entry of the catalog hierarchy. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogNode {
    pub id: String,
    /// `ROOT_ID` for top-level nodes
    pub parent_id: String,
    pub name: String,
    pub owner_id: i32,
    /// Backend row identity
    pub key: i32,
    pub image_id: AssetId,
    pub rank: i32,
    pub kind: NodeKind,
    /// True only for folders that hold child nodes or documents
    pub has_children: bool,
}

impl CatalogNode {
    pub fn is_folder(&self) -> bool {
        self.kind == NodeKind::Folder
    }
}

/// Sibling order: rank, then case-insensitive name, then id.
fn sibling_order(a: &CatalogNode, b: &CatalogNode) -> Ordering {
    a.rank
        .cmp(&b.rank)
        .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        .then_with(|| a.id.cmp(&b.id))
}

fn document_node_id(folder_id: &str, doc_id: i32) -> String {
    format!("{}/{}", folder_id, doc_id)
}

/// Arena of nodes plus the id-indexed parent -> children map.
#[derive(Debug, Default)]
struct CatalogIndex {
    nodes: Vec<CatalogNode>,
    by_id: HashMap<String, usize>,
    /// parent id -> arena slots, kept in sibling order
    children: HashMap<String, Vec<usize>>,
    /// Linked document rows grouped by owning folder key
    documents: HashMap<i32, Vec<DocumentRow>>,
    /// Folders whose documents have been merged
    expanded: HashSet<String>,
}

impl CatalogIndex {
    /// Build and validate a complete index from backend rows.
    fn build(rows: Vec<NodeRow>, document_rows: Vec<DocumentRow>) -> Result<Self, RepositoryError> {
        let total_documents = document_rows.len();
        let mut documents: HashMap<i32, Vec<DocumentRow>> = HashMap::new();
        for row in document_rows {
            if !row.is_linked() {
                continue;
            }
            if let Some(owner) = row.owner_key() {
                documents.entry(owner).or_default().push(row);
            }
        }
        let linked: usize = documents.values().map(Vec::len).sum();
        if linked < total_documents {
            debug!(
                "Skipped {} document row(s) without linking keys",
                total_documents - linked
            );
        }

        // Pass 1: normalize ids and reject duplicates.
        let mut seen: HashSet<String> = HashSet::with_capacity(rows.len());
        let mut normalized = Vec::with_capacity(rows.len());
        for mut row in rows {
            row.id = row.id.trim().to_string();
            if row.id.is_empty() {
                return Err(RepositoryError::MalformedRow(format!(
                    "node '{}' has an empty id",
                    row.name
                )));
            }
            if row.id == ROOT_ID {
                return Err(RepositoryError::MalformedRow(format!(
                    "node '{}' uses the reserved root id",
                    row.name
                )));
            }
            row.parent_id = if row.is_top_level() {
                ROOT_ID.to_string()
            } else {
                row.parent_id.trim().to_string()
            };
            if !seen.insert(row.id.clone()) {
                return Err(RepositoryError::DuplicateNode(row.id));
            }
            normalized.push(row);
        }

        // Pass 2: every parent must exist.
        let mut child_count: HashMap<&str, usize> = HashMap::new();
        for row in &normalized {
            if row.parent_id != ROOT_ID && !seen.contains(&row.parent_id) {
                return Err(RepositoryError::DanglingParent {
                    node_id: row.id.clone(),
                    parent_id: row.parent_id.clone(),
                });
            }
            *child_count.entry(row.parent_id.as_str()).or_default() += 1;

            // Document ids are derived from their folder and must not shadow a node.
            for doc in documents.get(&row.key).into_iter().flatten() {
                let Some(doc_id) = doc.doc_id else {
                    continue;
                };
                let id = document_node_id(&row.id, doc_id);
                if seen.contains(&id) {
                    return Err(RepositoryError::MalformedRow(format!(
                        "document {} of folder {} collides with node id {}",
                        doc_id, row.id, id
                    )));
                }
            }
        }

        // Pass 3: materialize the arena.
        let nodes: Vec<CatalogNode> = normalized
            .iter()
            .map(|row| CatalogNode {
                id: row.id.clone(),
                parent_id: row.parent_id.clone(),
                name: row.name.trim().to_string(),
                owner_id: row.owner_id,
                key: row.key,
                image_id: row.image_id,
                rank: row.rank,
                kind: NodeKind::Folder,
                has_children: child_count.contains_key(row.id.as_str())
                    || documents.contains_key(&row.key),
            })
            .collect();

        let mut index = Self {
            by_id: nodes
                .iter()
                .enumerate()
                .map(|(slot, node)| (node.id.clone(), slot))
                .collect(),
            nodes,
            children: HashMap::new(),
            documents,
            expanded: HashSet::new(),
        };
        for (slot, node) in index.nodes.iter().enumerate() {
            index
                .children
                .entry(node.parent_id.clone())
                .or_default()
                .push(slot);
        }
        for parent in index.children.keys().cloned().collect::<Vec<_>>() {
            index.sort_children(&parent);
        }

        // Parent links can still form cycles that never reach the root.
        let reachable = index.count_reachable();
        if reachable < index.nodes.len() {
            return Err(RepositoryError::Unreachable {
                count: index.nodes.len() - reachable,
            });
        }

        Ok(index)
    }

    fn count_reachable(&self) -> usize {
        let mut queue: VecDeque<&str> = VecDeque::from([ROOT_ID]);
        let mut reached = 0;
        while let Some(parent) = queue.pop_front() {
            for &slot in self.children.get(parent).into_iter().flatten() {
                reached += 1;
                queue.push_back(self.nodes[slot].id.as_str());
            }
        }
        reached
    }

    fn sort_children(&mut self, parent: &str) {
        let nodes = &self.nodes;
        if let Some(slots) = self.children.get_mut(parent) {
            slots.sort_by(|&a, &b| sibling_order(&nodes[a], &nodes[b]));
        }
    }

    fn node(&self, id: &str) -> Option<&CatalogNode> {
        self.by_id.get(id).map(|&slot| &self.nodes[slot])
    }

    fn children_of(&self, id: &str) -> Vec<CatalogNode> {
        self.children
            .get(id)
            .map(|slots| slots.iter().map(|&slot| self.nodes[slot].clone()).collect())
            .unwrap_or_default()
    }

    /// Merge the folder's documents into the index once.
    ///
    /// Returns the number of document nodes added by this call.
    fn merge_documents(&mut self, folder_id: &str) -> usize {
        if self.expanded.contains(folder_id) {
            return 0;
        }
        let Some(folder) = self.node(folder_id).cloned() else {
            return 0;
        };
        if !folder.is_folder() {
            return 0;
        }

        let rows = self.documents.get(&folder.key).cloned().unwrap_or_default();
        let mut added = 0;
        for row in rows {
            let Some(doc_id) = row.doc_id else {
                continue;
            };
            let id = document_node_id(&folder.id, doc_id);
            // Node ids were checked against collisions on load.
            if self.by_id.contains_key(&id) {
                warn!("Duplicate document row {} under folder {}", doc_id, folder.id);
                continue;
            }
            let slot = self.nodes.len();
            self.nodes.push(CatalogNode {
                name: row.display_name(),
                id: id.clone(),
                parent_id: folder.id.clone(),
                owner_id: folder.owner_id,
                key: doc_id,
                image_id: row.image_id,
                rank: row.rank.unwrap_or(0),
                kind: NodeKind::Document,
                has_children: false,
            });
            self.by_id.insert(id, slot);
            self.children.entry(folder.id.clone()).or_default().push(slot);
            added += 1;
        }

        self.sort_children(&folder.id);
        self.expanded.insert(folder.id);
        added
    }
}

/// Lazily expanded catalog tree backed by a `CatalogSource`.
///
/// Constructed once per session and shared by reference. Loads replace the
/// whole index atomically; a failed load leaves the previous index in place.
pub struct NodeRepository {
    source: Arc<dyn CatalogSource>,
    index: RwLock<CatalogIndex>,
}

impl NodeRepository {
    pub fn new(source: Arc<dyn CatalogSource>) -> Self {
        Self {
            source,
            index: RwLock::new(CatalogIndex::default()),
        }
    }

    /// Fetch the node list and the document table and swap in a fresh index.
    #[instrument(skip(self), level = "debug")]
    pub async fn load_root(&self) -> Result<(), RepositoryError> {
        let rows = self.source.list_nodes().await?;
        let documents = self.source.list_documents().await?;
        let (row_count, document_count) = (rows.len(), documents.len());

        let index = CatalogIndex::build(rows, documents).inspect_err(|e| {
            warn!("Catalog load rejected: {}", e);
        })?;

        *self.index.write().await = index;
        info!(
            "Loaded catalog: {} node(s), {} document row(s)",
            row_count, document_count
        );
        Ok(())
    }

    /// Direct children of a node in sibling order.
    ///
    /// Unknown ids and leaves yield an empty list.
    pub async fn children_of(&self, node_id: &str) -> Vec<CatalogNode> {
        self.index.read().await.children_of(node_id)
    }

    /// Top-level nodes in sibling order.
    pub async fn roots(&self) -> Vec<CatalogNode> {
        self.children_of(ROOT_ID).await
    }

    /// Merge a folder's documents on first call and return its children.
    ///
    /// Repeated calls return the already merged children without adding
    /// anything. Unknown ids and document nodes behave like `children_of`.
    #[instrument(skip(self), level = "debug")]
    pub async fn expand_documents(&self, folder_id: &str) -> Vec<CatalogNode> {
        let mut index = self.index.write().await;
        let added = index.merge_documents(folder_id);
        if added > 0 {
            debug!("Merged {} document(s) into folder {}", added, folder_id);
        }
        index.children_of(folder_id)
    }

    pub async fn node(&self, node_id: &str) -> Option<CatalogNode> {
        self.index.read().await.node(node_id).cloned()
    }

    /// Whether the folder's documents have already been merged.
    pub async fn is_expanded(&self, folder_id: &str) -> bool {
        self.index.read().await.expanded.contains(folder_id)
    }

    /// Number of nodes in the index, merged documents included.
    pub async fn len(&self) -> usize {
        self.index.read().await.nodes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
