use super::{QueryRange, TilesetConfig, VectorLayer};

/// One layer's selection for a zoom. `range` is `None` when no range of the
/// layer covers the zoom; such a layer contributes nothing to the tile.
#[derive(Debug, Clone, Copy)]
pub struct PlannedLayer<'a> {
    pub layer: &'a VectorLayer,
    pub range: Option<&'a QueryRange>,
}

impl PlannedLayer<'_> {
    pub fn name(&self) -> &str {
        &self.layer.name
    }

    pub fn is_selected(&self) -> bool {
        self.range.is_some()
    }
}

/// Select the query range of every layer for `zoom`, in layer declaration order.
///
/// Ranges within a layer never overlap (config validation guarantees it), so at
/// most one range matches per layer.
pub fn plan(config: &TilesetConfig, zoom: u8) -> Vec<PlannedLayer<'_>> {
    config
        .layers
        .iter()
        .map(|layer| PlannedLayer {
            layer,
            range: layer.range_for(zoom),
        })
        .collect()
}
