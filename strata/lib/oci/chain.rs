//! Layer-chain reconstruction from a manifest's unordered history rows.

use std::collections::HashMap;

use getset::Getters;

use super::manifest::{LayerHistory, RuntimeConfig};
use crate::{StrataError, StrataResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// One layer of a resolved chain. Links are indices into the owning
/// [`LayerChain`]'s vector, which keeps the structure trivially
/// serializable and free of ownership cycles.
#[derive(Debug, Clone, Getters)]
#[getset(get = "pub with_prefix")]
pub struct LayerRecord {
    /// The layer id.
    id: String,

    /// The id of the parent layer; `None` on the eldest layer.
    parent: Option<String>,

    /// The digest of this layer's blob.
    blob_sum: String,

    /// The runtime configuration carried by this layer's history row.
    config: Option<RuntimeConfig>,

    /// Index of the parent record.
    parent_index: Option<usize>,

    /// Index of the child record.
    child_index: Option<usize>,
}

/// The linear parent→child chain of an image's layers, eldest (no parent)
/// to youngest (no child).
#[derive(Debug, Getters)]
#[getset(get = "pub with_prefix")]
pub struct LayerChain {
    /// The layer records; linked through `parent_index`/`child_index`.
    layers: Vec<LayerRecord>,

    /// Index of the eldest layer.
    eldest: usize,

    /// Index of the youngest layer.
    youngest: usize,
}

/// Iterates a chain eldest→youngest.
pub struct ChainIter<'a> {
    chain: &'a LayerChain,
    next: Option<usize>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LayerChain {
    /// Resolves the linear chain from parsed history rows paired with their
    /// blob sums (index-aligned manifest order; input order is irrelevant).
    ///
    /// Fails when no row lacks a parent, when more than one does, or when
    /// two rows with different ids claim the same parent. A row repeating
    /// an already-seen `(parent, id)` pair is skipped, which some builders
    /// emit for cache hits.
    pub fn resolve(histories: Vec<(LayerHistory, String)>) -> StrataResult<Self> {
        let mut layers: Vec<LayerRecord> = Vec::new();
        let mut by_parent: HashMap<String, usize> = HashMap::new();
        let mut eldest: Option<usize> = None;

        for (history, blob_sum) in histories {
            let record = LayerRecord {
                id: history.get_id().clone(),
                parent: history.get_parent().clone(),
                blob_sum,
                config: history.get_config().clone(),
                parent_index: None,
                child_index: None,
            };

            match record.parent.clone() {
                None => {
                    if eldest.is_some() {
                        return Err(StrataError::ManifestMalformed(
                            "found more than one layer with no parent".into(),
                        ));
                    }
                    layers.push(record);
                    eldest = Some(layers.len() - 1);
                }
                Some(parent) => {
                    if let Some(&existing) = by_parent.get(&parent) {
                        if layers[existing].id == record.id {
                            // duplicated history row
                            continue;
                        }
                        return Err(StrataError::ManifestMalformed(format!(
                            "multiple inheritance from layer {parent}"
                        )));
                    }
                    layers.push(record);
                    by_parent.insert(parent, layers.len() - 1);
                }
            }
        }

        let eldest = eldest.ok_or_else(|| {
            StrataError::ManifestMalformed(
                "unable to find a layer without parent, cannot identify terminal layer".into(),
            )
        })?;

        // Walk eldest→youngest, consuming the parent map so a malformed
        // self-referential row cannot loop.
        let mut current = eldest;
        while let Some(child) = by_parent.remove(&layers[current].id) {
            layers[current].child_index = Some(child);
            layers[child].parent_index = Some(current);
            current = child;
        }

        Ok(Self {
            layers,
            eldest,
            youngest: current,
        })
    }

    /// Returns the eldest (base) layer.
    pub fn eldest_layer(&self) -> &LayerRecord {
        &self.layers[self.eldest]
    }

    /// Returns the youngest (tip) layer, whose history row carries the
    /// image's runtime configuration.
    pub fn youngest_layer(&self) -> &LayerRecord {
        &self.layers[self.youngest]
    }

    /// Iterates the chain in composition order, eldest first.
    pub fn iter(&self) -> ChainIter<'_> {
        ChainIter {
            chain: self,
            next: Some(self.eldest),
        }
    }

    /// Returns the number of layers reachable from the eldest.
    pub fn chain_len(&self) -> usize {
        self.iter().count()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl<'a> Iterator for ChainIter<'a> {
    type Item = &'a LayerRecord;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.next?;
        let record = &self.chain.layers[index];
        self.next = record.child_index;
        Some(record)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
