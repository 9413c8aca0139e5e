//! Which committed layers belong to the image under construction

use crate::store::Digest;
use std::collections::HashSet;

#[derive(Debug, Clone, Default)]
pub struct LayerLedger {
    layers: Vec<Digest>,
    seen: HashSet<Digest>,
    skipped: Vec<Digest>,
    skip_mode: bool,
}

impl LayerLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an image's layers in order; already-seen layers are ignored
    pub fn add_image(&mut self, layers: &[Digest]) {
        for layer in layers {
            if !self.seen.insert(layer.clone()) {
                continue;
            }
            if self.skip_mode {
                self.skipped.push(layer.clone());
            } else {
                self.layers.push(layer.clone());
            }
        }
    }

    pub fn set_skip_mode(&mut self, on: bool) {
        self.skip_mode = on;
    }

    pub fn skip_mode(&self) -> bool {
        self.skip_mode
    }

    /// Retained layers in the order they were observed
    pub fn layers(&self) -> &[Digest] {
        &self.layers
    }

    pub fn skipped(&self) -> &[Digest] {
        &self.skipped
    }

    /// Whether the final image must be rebuilt without skipped layers
    pub fn needs_rebuild(&self) -> bool {
        !self.skipped.is_empty()
    }

    /// Start over from a freshly produced image
    pub fn reset(&mut self, layers: &[Digest]) {
        let skip_mode = self.skip_mode;
        *self = Self::default();
        self.add_image(layers);
        self.skip_mode = skip_mode;
    }
}
