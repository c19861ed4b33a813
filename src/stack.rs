use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};

use image::RgbaImage;

use crate::blend::{BlendMode, composite_onto};
use crate::canvas::TiledImage;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::{LayerChange, LayerEvent, ListenerId, Listeners};
use crate::io::{self, LayerDocument, LayerRecord, RasterFormat, RasterSource};
use crate::layer::{Layer, LayerId, LayerOptions};
use crate::ops::shapes::{Primitive, StrokeStyle};

/// Handle for an in-flight raster decode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodeTicket {
    pub layer_id: LayerId,
    pub generation: u64,
}

#[derive(Debug)]
pub enum DecodeOutcome {
    Applied,
    /// A newer decode was issued for the layer; this result was dropped.
    Stale,
    /// The layer no longer exists.
    LayerGone,
    /// Decoding failed; the layer keeps its prior content.
    Failed(EngineError),
}

/// Result of one finished decode, as applied by `poll_decodes`.
#[derive(Debug)]
pub struct DecodeReport {
    pub ticket: DecodeTicket,
    pub outcome: DecodeOutcome,
}

/// Message sent from a rayon worker back to the owning stack.
struct DecodedRaster {
    ticket: DecodeTicket,
    result: Result<RgbaImage>,
}

/// Z-ordered layers (index 0 = bottom) with an active layer.
///
/// Always holds at least one layer and `active_index` is always in range.
/// All mutation happens on the owner; only raster decoding runs on the rayon
/// pool, and its results are applied through [`LayerStack::poll_decodes`].
pub struct LayerStack {
    layers: Vec<Layer>,
    active_index: usize,
    width: u32,
    height: u32,
    config: EngineConfig,
    listeners: Listeners,
    decode_sender: Sender<DecodedRaster>,
    decode_receiver: Receiver<DecodedRaster>,
    pending_decodes: usize,
}

impl std::fmt::Debug for LayerStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerStack")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("layers", &self.layers)
            .field("active_index", &self.active_index)
            .field("listeners", &self.listeners)
            .field("pending_decodes", &self.pending_decodes)
            .finish()
    }
}

impl LayerStack {
    /// Stack of `width × height` with default settings and a white background.
    pub fn new(width: u32, height: u32) -> Result<Self> {
        Self::with_config(EngineConfig { width, height, ..EngineConfig::default() })
    }

    pub fn with_config(config: EngineConfig) -> Result<Self> {
        let background = Layer::background(
            config.background_name.clone(),
            config.width,
            config.height,
            config.background(),
            config.max_pixels,
        )?;
        let (decode_sender, decode_receiver) = mpsc::channel();
        log::debug!("new layer stack {}×{}", config.width, config.height);
        Ok(Self {
            layers: vec![background],
            active_index: 0,
            width: config.width,
            height: config.height,
            config,
            listeners: Listeners::default(),
            decode_sender,
            decode_receiver,
            pending_decodes: 0,
        })
    }

    // ---- queries ------------------------------------------------------------

    pub fn width(&self) -> u32 { self.width }
    pub fn height(&self) -> u32 { self.height }
    pub fn config(&self) -> &EngineConfig { &self.config }
    pub fn layer_count(&self) -> usize { self.layers.len() }
    pub fn active_index(&self) -> usize { self.active_index }

    pub fn get_layer(&self, index: usize) -> Option<&Layer> {
        self.layers.get(index)
    }

    pub fn get_active_layer(&self) -> &Layer {
        &self.layers[self.active_index]
    }

    pub fn get_layer_by_id(&self, id: LayerId) -> Option<&Layer> {
        self.layers.iter().find(|l| l.id() == id)
    }

    pub fn index_of(&self, id: LayerId) -> Option<usize> {
        self.layers.iter().position(|l| l.id() == id)
    }

    /// Bottom to top.
    pub fn layers(&self) -> impl Iterator<Item = &Layer> {
        self.layers.iter()
    }

    // ---- notifications ------------------------------------------------------

    pub fn subscribe<F>(&mut self, listener: F) -> ListenerId
    where
        F: FnMut(&LayerEvent) + Send + 'static,
    {
        self.listeners.subscribe(Box::new(listener))
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    fn emit_active_changed(&mut self) {
        let id = self.layers[self.active_index].id();
        let index = self.active_index;
        self.listeners.emit(LayerEvent::ActiveLayerChanged { id, index });
    }

    fn emit_layer_changed(&mut self, index: usize, change: LayerChange) {
        let id = self.layers[index].id();
        self.listeners.emit(LayerEvent::LayerChanged { id, index, change });
    }

    // ---- structural edits ---------------------------------------------------

    /// Append a layer on top. With `name == None` it is called "<prefix> <n>".
    /// The new layer becomes active only if the stack held just the background.
    pub fn add_layer(&mut self, name: Option<&str>, options: LayerOptions) -> Result<LayerId> {
        let name = match name {
            Some(n) => n.to_string(),
            None => format!("{} {}", self.config.default_layer_prefix, self.layers.len() + 1),
        };
        let layer = Layer::with_limit(name, self.width, self.height, options, self.config.max_pixels)?;
        let id = layer.id();
        log::debug!("add layer '{}' at {}", layer.name(), self.layers.len());
        self.layers.push(layer);
        let index = self.layers.len() - 1;
        self.listeners.emit(LayerEvent::LayerAdded { id, index });

        if self.layers.len() == 2 {
            self.active_index = index;
            self.emit_active_changed();
        }
        Ok(id)
    }

    /// Remove the layer at `index`. Refuses to remove the last layer.
    pub fn remove_layer(&mut self, index: usize) -> bool {
        if index >= self.layers.len() || self.layers.len() <= 1 {
            log::warn!("remove_layer({}) rejected with {} layers", index, self.layers.len());
            return false;
        }
        let removed = self.layers.remove(index);
        let old_active = self.active_index;
        if self.active_index >= index && self.active_index > 0 {
            self.active_index -= 1;
        }
        log::debug!("removed layer '{}' from {}", removed.name(), index);
        self.listeners.emit(LayerEvent::LayerRemoved { id: removed.id(), index });
        if index <= old_active {
            self.emit_active_changed();
        }
        true
    }

    pub fn set_active_layer(&mut self, index: usize) -> bool {
        if index >= self.layers.len() {
            return false;
        }
        self.active_index = index;
        self.emit_active_changed();
        true
    }

    /// Move one layer; the active index keeps pointing at the same layer.
    pub fn move_layer(&mut self, from: usize, to: usize) -> bool {
        let len = self.layers.len();
        if from >= len || to >= len || from == to {
            return false;
        }
        let layer = self.layers.remove(from);
        let id = layer.id();
        self.layers.insert(to, layer);

        let old_active = self.active_index;
        if self.active_index == from {
            self.active_index = to;
        } else if from < self.active_index && to >= self.active_index {
            self.active_index -= 1;
        } else if from > self.active_index && to <= self.active_index {
            self.active_index += 1;
        }
        log::debug!("moved layer {} -> {}", from, to);
        self.listeners.emit(LayerEvent::LayerMoved { id, from, to });
        if self.active_index != old_active {
            self.emit_active_changed();
        }
        true
    }

    pub fn bring_to_front(&mut self) -> bool {
        let top = self.layers.len() - 1;
        self.move_layer(self.active_index, top)
    }

    pub fn bring_forward(&mut self) -> bool {
        self.move_layer(self.active_index, self.active_index + 1)
    }

    pub fn send_backward(&mut self) -> bool {
        match self.active_index.checked_sub(1) {
            Some(to) => self.move_layer(self.active_index, to),
            None => false,
        }
    }

    pub fn send_to_back(&mut self) -> bool {
        self.move_layer(self.active_index, 0)
    }

    /// Copy the layer at `index` into a new layer directly above it, which
    /// becomes active. Raster and modifiers are copied; the name gets " Copy".
    pub fn duplicate_layer(&mut self, index: usize) -> Option<LayerId> {
        let source = self.layers.get(index)?;
        let copy = source.duplicate(format!("{} Copy", source.name()));
        let id = copy.id();
        let new_index = index + 1;
        self.layers.insert(new_index, copy);
        log::debug!("duplicated layer {} -> {}", index, new_index);
        self.listeners.emit(LayerEvent::LayerAdded { id, index: new_index });
        self.active_index = new_index;
        self.emit_active_changed();
        Some(id)
    }

    /// Composite the layer at `index` onto the one below with its blend mode
    /// and opacity, then remove it. A hidden upper layer contributes nothing.
    /// Lock state does not prevent merging.
    pub fn merge_down(&mut self, index: usize) -> bool {
        if index == 0 || index >= self.layers.len() {
            return false;
        }
        let upper = self.layers.remove(index);
        let lower = &mut self.layers[index - 1];
        if upper.is_visible() {
            let mut merged = lower.surface().clone();
            composite_onto(&mut merged, upper.surface(), upper.blend_mode(), upper.opacity());
            lower.install_surface(merged);
        }
        let old_active = self.active_index;
        if self.active_index >= index && self.active_index > 0 {
            self.active_index -= 1;
        }
        log::debug!("merged layer '{}' down onto {}", upper.name(), index - 1);
        self.listeners.emit(LayerEvent::LayerRemoved { id: upper.id(), index });
        self.emit_layer_changed(index - 1, LayerChange::Content);
        if index <= old_active {
            self.emit_active_changed();
        }
        true
    }

    /// Resize every layer, anchored at the origin. Either every layer is
    /// resized or (on allocation failure) none is.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        let surfaces = self
            .layers
            .iter()
            .map(|l| l.resized_surface(width, height))
            .collect::<Result<Vec<TiledImage>>>()?;
        for (layer, surface) in self.layers.iter_mut().zip(surfaces) {
            layer.install_surface(surface);
        }
        log::info!("canvas resized {}×{} -> {}×{}", self.width, self.height, width, height);
        self.width = width;
        self.height = height;
        self.listeners.emit(LayerEvent::CanvasResized { width, height });
        Ok(())
    }

    /// Clear every layer (background layers go back to their fill colour).
    pub fn clear(&mut self) {
        for layer in &mut self.layers {
            layer.clear();
        }
        self.listeners.emit(LayerEvent::Cleared);
    }

    /// Replace all layers with a single background layer holding the composite.
    pub fn flatten(&mut self) -> Result<LayerId> {
        let composite = self.render_tiled();
        let mut background = Layer::background(
            self.config.background_name.clone(),
            self.width,
            self.height,
            self.config.background(),
            self.config.max_pixels,
        )?;
        background.install_surface(composite);
        let id = background.id();
        log::info!("flattened {} layers", self.layers.len());
        self.layers = vec![background];
        self.active_index = 0;
        self.listeners.emit(LayerEvent::Flattened { id });
        self.emit_active_changed();
        Ok(id)
    }

    // ---- per-layer modifiers ------------------------------------------------

    fn modify(&mut self, index: usize, change: LayerChange, f: impl FnOnce(&mut Layer)) -> bool {
        let Some(layer) = self.layers.get_mut(index) else {
            return false;
        };
        f(layer);
        self.emit_layer_changed(index, change);
        true
    }

    pub fn set_layer_visible(&mut self, index: usize, visible: bool) -> bool {
        self.modify(index, LayerChange::Visibility, |l| l.set_visible(visible))
    }

    pub fn toggle_visibility(&mut self, index: usize) -> bool {
        self.modify(index, LayerChange::Visibility, |l| l.set_visible(!l.is_visible()))
    }

    pub fn set_layer_locked(&mut self, index: usize, locked: bool) -> bool {
        self.modify(index, LayerChange::Lock, |l| l.set_locked(locked))
    }

    pub fn toggle_lock(&mut self, index: usize) -> bool {
        self.modify(index, LayerChange::Lock, |l| l.set_locked(!l.is_locked()))
    }

    pub fn set_layer_opacity(&mut self, index: usize, opacity: f32) -> bool {
        self.modify(index, LayerChange::Opacity, |l| l.set_opacity(opacity))
    }

    pub fn set_layer_blend_mode(&mut self, index: usize, mode: BlendMode) -> bool {
        self.modify(index, LayerChange::BlendMode, |l| l.set_blend_mode(mode))
    }

    /// Parse a blend mode name first; an unknown name leaves the layer untouched.
    pub fn set_layer_blend_mode_name(&mut self, index: usize, name: &str) -> Result<bool> {
        let mode: BlendMode = name.parse()?;
        Ok(self.set_layer_blend_mode(index, mode))
    }

    pub fn rename_layer(&mut self, index: usize, name: &str) -> bool {
        self.modify(index, LayerChange::Name, |l| l.set_name(name))
    }

    // ---- drawing ------------------------------------------------------------

    pub fn draw_on_active(&mut self, primitive: &Primitive, style: &StrokeStyle) -> bool {
        self.draw_on_layer(self.active_index, primitive, style)
    }

    /// Draw onto the layer at `index`. False if out of range, locked, or nothing was drawn.
    pub fn draw_on_layer(&mut self, index: usize, primitive: &Primitive, style: &StrokeStyle) -> bool {
        let Some(layer) = self.layers.get_mut(index) else {
            return false;
        };
        if !layer.draw(primitive, style) {
            return false;
        }
        self.emit_layer_changed(index, LayerChange::Content);
        true
    }

    // ---- compositing --------------------------------------------------------

    fn render_tiled(&self) -> TiledImage {
        let mut out = TiledImage::blank(self.width, self.height);
        for layer in self.layers.iter().filter(|l| l.is_visible()) {
            composite_onto(&mut out, layer.surface(), layer.blend_mode(), layer.opacity());
        }
        out
    }

    /// Composite all visible layers bottom to top onto a transparent canvas.
    pub fn render(&self) -> RgbaImage {
        self.render_tiled().to_rgba_image()
    }

    /// Same as [`render`](Self::render) but reuses `out` when the size matches.
    pub fn render_into(&self, out: &mut RgbaImage) {
        self.render_tiled().write_into(out);
    }

    // ---- async raster loading -----------------------------------------------

    fn spawn_decode(&mut self, index: usize, source: RasterSource) -> DecodeTicket {
        let layer = &mut self.layers[index];
        let ticket = DecodeTicket { layer_id: layer.id(), generation: layer.begin_decode() };
        let tx = self.decode_sender.clone();
        self.pending_decodes += 1;
        rayon::spawn(move || {
            let result = io::decode_raster(&source);
            // The receiver is gone once the stack is dropped; the result is discarded.
            let _ = tx.send(DecodedRaster { ticket, result });
        });
        ticket
    }

    /// Decode `source` on the rayon pool and load it into the layer at `index`
    /// when it is next polled. A later load on the same layer supersedes this one.
    pub fn load_raster(&mut self, index: usize, source: RasterSource) -> Option<DecodeTicket> {
        if index >= self.layers.len() {
            return None;
        }
        Some(self.spawn_decode(index, source))
    }

    pub fn pending_decodes(&self) -> usize {
        self.pending_decodes
    }

    /// Apply every finished decode without blocking.
    pub fn poll_decodes(&mut self) -> Vec<DecodeReport> {
        let mut reports = Vec::new();
        while let Ok(msg) = self.decode_receiver.try_recv() {
            reports.push(self.apply_decode(msg));
        }
        reports
    }

    /// Block until every outstanding decode has been applied.
    pub fn wait_for_decodes(&mut self) -> Vec<DecodeReport> {
        let mut reports = Vec::new();
        while self.pending_decodes > 0 {
            match self.decode_receiver.recv() {
                Ok(msg) => reports.push(self.apply_decode(msg)),
                Err(_) => break,
            }
        }
        reports
    }

    fn apply_decode(&mut self, msg: DecodedRaster) -> DecodeReport {
        self.pending_decodes = self.pending_decodes.saturating_sub(1);
        let ticket = msg.ticket;
        let Some(index) = self.index_of(ticket.layer_id) else {
            log::warn!("decode finished for removed layer {}", ticket.layer_id);
            return DecodeReport { ticket, outcome: DecodeOutcome::LayerGone };
        };
        let layer = &mut self.layers[index];
        if layer.decode_generation() != ticket.generation {
            log::warn!(
                "dropping stale decode {} for layer '{}'",
                ticket.generation,
                layer.name()
            );
            return DecodeReport { ticket, outcome: DecodeOutcome::Stale };
        }
        let outcome = match msg.result {
            Err(e) => {
                log::error!("decode failed for layer '{}': {}", layer.name(), e);
                DecodeOutcome::Failed(e)
            }
            Ok(image) => {
                if layer.apply_decoded(ticket.generation, &image) {
                    self.emit_layer_changed(index, LayerChange::Content);
                    DecodeOutcome::Applied
                } else {
                    DecodeOutcome::Stale
                }
            }
        };
        DecodeReport { ticket, outcome }
    }

    // ---- export / import ----------------------------------------------------

    /// Export every layer bottom to top, using the configured raster format.
    pub fn export_layers(&self) -> Result<Vec<LayerRecord>> {
        self.export_layers_as(self.config.export_format, self.config.export_quality)
    }

    pub fn export_layers_as(&self, format: RasterFormat, quality: u8) -> Result<Vec<LayerRecord>> {
        let records = self
            .layers
            .iter()
            .map(|layer| {
                Ok(LayerRecord {
                    name: layer.name().to_string(),
                    visible: layer.is_visible(),
                    opacity: layer.opacity(),
                    blend_mode: layer.blend_mode().name().to_string(),
                    locked: layer.is_locked(),
                    raster: layer.snapshot_raster(format, quality)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        log::info!("exported {} layers as {:?}", records.len(), format);
        Ok(records)
    }

    /// Replace the stack's content with `records`.
    ///
    /// Every layer above the bottom one is dropped, the bottom layer takes the
    /// first record's modifiers in place, and new layers are appended for the
    /// rest. Rasters decode asynchronously; until a layer's decode is applied
    /// it renders with its prior content (new layers are transparent).
    /// Records are validated before anything is touched.
    pub fn import_layers(&mut self, records: &[LayerRecord]) -> Result<Vec<DecodeTicket>> {
        if records.is_empty() {
            return Err(EngineError::InvalidFormat("no layers to import".into()));
        }
        let mut options = Vec::with_capacity(records.len());
        for record in records {
            if record.opacity.is_nan() {
                return Err(EngineError::InvalidFormat(format!("layer '{}' has NaN opacity", record.name)));
            }
            options.push(LayerOptions {
                visible: record.visible,
                opacity: record.opacity,
                blend_mode: record.blend_mode.parse()?,
                locked: record.locked,
            });
        }
        let fresh = records
            .iter()
            .zip(&options)
            .skip(1)
            .map(|(r, opts)| Layer::with_limit(r.name.clone(), self.width, self.height, *opts, self.config.max_pixels))
            .collect::<Result<Vec<_>>>()?;

        while self.layers.len() > 1 {
            if let Some(layer) = self.layers.pop() {
                let index = self.layers.len();
                self.listeners.emit(LayerEvent::LayerRemoved { id: layer.id(), index });
            }
        }

        let bottom = &mut self.layers[0];
        bottom.set_name(records[0].name.clone());
        bottom.set_visible(options[0].visible);
        bottom.set_opacity(options[0].opacity);
        bottom.set_blend_mode(options[0].blend_mode);
        bottom.set_locked(options[0].locked);
        self.emit_layer_changed(0, LayerChange::Properties);

        for layer in fresh {
            let id = layer.id();
            self.layers.push(layer);
            let index = self.layers.len() - 1;
            self.listeners.emit(LayerEvent::LayerAdded { id, index });
        }
        self.active_index = if self.layers.len() > 1 { 1 } else { 0 };
        self.emit_active_changed();

        let tickets = records
            .iter()
            .enumerate()
            .map(|(i, r)| self.spawn_decode(i, RasterSource::Encoded(r.raster.clone())))
            .collect();
        log::info!("importing {} layers", records.len());
        Ok(tickets)
    }

    // ---- documents ----------------------------------------------------------

    /// Write all layers plus canvas size and active index. Rasters use the
    /// configured export format when it is lossless, PNG otherwise.
    pub fn save_document(&self, path: &Path) -> Result<()> {
        let format = if self.config.export_format.is_lossless() {
            self.config.export_format
        } else {
            RasterFormat::Png
        };
        let records = self.export_layers_as(format, 100)?;
        let doc = LayerDocument::new(self.width, self.height, self.active_index, records);
        io::write_document(&doc, path)?;
        log::info!("saved document {}", path.display());
        Ok(())
    }

    /// Build a stack from a saved document, waiting for every raster to decode.
    pub fn load_document(path: &Path, config: EngineConfig) -> Result<Self> {
        let doc = io::read_document(path)?;
        let mut stack = Self::with_config(EngineConfig { width: doc.width, height: doc.height, ..config })?;
        stack.import_layers(&doc.layers)?;
        for report in stack.wait_for_decodes() {
            if let DecodeOutcome::Failed(e) = report.outcome {
                return Err(e);
            }
        }
        if doc.active_layer_index < stack.layers.len() {
            stack.active_index = doc.active_layer_index;
        }
        log::info!("loaded document {}", path.display());
        Ok(stack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;
    use std::sync::{Arc, Mutex};

    const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);
    const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);

    fn stack_with(n: usize) -> LayerStack {
        let mut s = LayerStack::new(16, 16).unwrap();
        for _ in 0..n {
            s.add_layer(None, LayerOptions::default()).unwrap();
        }
        s
    }

    fn names(s: &LayerStack) -> Vec<String> {
        s.layers().map(|l| l.name().to_string()).collect()
    }

    fn record_events(s: &mut LayerStack) -> Arc<Mutex<Vec<LayerEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        s.subscribe(move |e| sink.lock().unwrap().push(e.clone()));
        events
    }

    #[test]
    fn fresh_stack_has_background() {
        let s = LayerStack::new(16, 16).unwrap();
        assert_eq!(s.layer_count(), 1);
        assert!(s.get_active_layer().is_background());
        assert_eq!(s.get_layer(0).unwrap().pixel(5, 5), WHITE);
    }

    #[test]
    fn only_second_layer_becomes_active() {
        let mut s = stack_with(1);
        assert_eq!(s.active_index(), 1);
        s.add_layer(Some("Ink"), LayerOptions::default()).unwrap();
        assert_eq!(s.active_index(), 1);
        assert_eq!(names(&s), ["Background", "Layer 2", "Ink"]);
    }

    #[test]
    fn remove_adjusts_active_and_keeps_floor() {
        let mut s = stack_with(3);
        s.set_active_layer(3);
        assert!(s.remove_layer(1));
        assert_eq!(s.active_index(), 2);
        assert!(!s.remove_layer(7));
        assert!(s.remove_layer(0));
        assert!(s.remove_layer(0));
        assert_eq!(s.layer_count(), 1);
        assert_eq!(s.active_index(), 0);
        assert!(!s.remove_layer(0));
        assert_eq!(s.layer_count(), 1);
    }

    #[test]
    fn move_tracks_active_layer() {
        let mut s = stack_with(3);
        s.set_active_layer(2);
        let active = s.get_active_layer().id();
        assert!(s.move_layer(0, 3));
        assert_eq!(s.get_active_layer().id(), active);
        assert_eq!(s.active_index(), 1);
        assert!(s.move_layer(3, 0));
        assert_eq!(s.get_active_layer().id(), active);
        assert!(!s.move_layer(1, 1));
        assert!(!s.move_layer(0, 4));
    }

    #[test]
    fn z_order_wrappers_stop_at_boundaries() {
        let mut s = stack_with(2);
        s.set_active_layer(2);
        assert!(!s.bring_forward());
        assert!(!s.bring_to_front());
        assert!(s.send_backward());
        assert_eq!(s.active_index(), 1);
        assert!(s.send_to_back());
        assert_eq!(s.active_index(), 0);
        assert!(!s.send_backward());
        assert!(!s.send_to_back());
        assert!(s.bring_to_front());
        assert_eq!(s.active_index(), 2);
    }

    #[test]
    fn duplicate_inserts_above_and_activates() {
        let mut s = stack_with(2);
        s.set_layer_opacity(0, 0.4);
        let id = s.duplicate_layer(0).unwrap();
        assert_eq!(s.index_of(id), Some(1));
        assert_eq!(s.active_index(), 1);
        let copy = s.get_layer(1).unwrap();
        assert_eq!(copy.name(), "Background Copy");
        assert!(!copy.is_background());
        assert_eq!(copy.opacity(), 0.4);
        assert_eq!(copy.pixel(0, 0), WHITE);
        assert!(s.duplicate_layer(9).is_none());
    }

    #[test]
    fn merge_down_uses_upper_modifiers() {
        let mut s = stack_with(1);
        s.set_layer_opacity(1, 0.5);
        s.draw_on_layer(1, &Primitive::Rect { x: 0.0, y: 0.0, width: 16.0, height: 16.0 }, &StrokeStyle::fill(RED));
        let before = s.render();
        assert!(s.merge_down(1));
        assert_eq!(s.layer_count(), 1);
        assert_eq!(s.active_index(), 0);
        assert_eq!(s.get_layer(0).unwrap().pixel(8, 8), Rgba([255, 128, 128, 255]));
        assert_eq!(s.render(), before);
        assert!(!s.merge_down(0));
        assert!(!s.merge_down(1));
    }

    #[test]
    fn hidden_upper_layer_merges_as_nothing() {
        let mut s = stack_with(1);
        s.draw_on_active(&Primitive::Rect { x: 0.0, y: 0.0, width: 16.0, height: 16.0 }, &StrokeStyle::fill(RED));
        s.set_layer_visible(1, false);
        assert!(s.merge_down(1));
        assert_eq!(s.get_layer(0).unwrap().pixel(3, 3), WHITE);
    }

    #[test]
    fn failed_add_leaves_stack_untouched() {
        let mut s = stack_with(2);
        s.set_active_layer(1);
        let events = record_events(&mut s);
        s.config.max_pixels = 0;

        let err = s.add_layer(Some("Too big"), LayerOptions::default()).unwrap_err();
        assert!(matches!(err, EngineError::Allocation { width: 16, height: 16 }));
        assert_eq!(s.layer_count(), 3);
        assert_eq!(s.active_index(), 1);
        assert!(s.layers().all(|l| l.name() != "Too big"));
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn failed_resize_is_atomic() {
        let mut s = LayerStack::with_config(EngineConfig {
            width: 10,
            height: 10,
            max_pixels: 4096,
            ..EngineConfig::default()
        })
        .unwrap();
        s.add_layer(None, LayerOptions::default()).unwrap();
        assert!(matches!(s.resize(100, 100), Err(EngineError::Allocation { .. })));
        assert_eq!((s.width(), s.height()), (10, 10));
        assert!(s.layers().all(|l| l.width() == 10 && l.height() == 10));
    }

    #[test]
    fn setters_emit_layer_changed() {
        let mut s = stack_with(1);
        let events = record_events(&mut s);
        assert!(s.toggle_visibility(1));
        assert!(s.toggle_lock(1));
        assert!(s.rename_layer(1, "Sky"));
        assert!(s.set_layer_blend_mode_name(1, "screen").unwrap());
        assert!(s.set_layer_blend_mode_name(1, "bogus").is_err());
        assert!(!s.set_layer_visible(5, true));
        let layer = s.get_layer(1).unwrap();
        assert!(!layer.is_visible());
        assert!(layer.is_locked());
        assert_eq!(layer.name(), "Sky");
        assert_eq!(layer.blend_mode(), BlendMode::Screen);
        let changes: Vec<LayerChange> = events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                LayerEvent::LayerChanged { change, .. } => Some(*change),
                _ => None,
            })
            .collect();
        assert_eq!(
            changes,
            [LayerChange::Visibility, LayerChange::Lock, LayerChange::Name, LayerChange::BlendMode]
        );
    }

    #[test]
    fn locked_layer_draw_is_a_silent_no_op() {
        let mut s = stack_with(1);
        s.set_layer_locked(1, true);
        let events = record_events(&mut s);
        let rect = Primitive::Rect { x: 0.0, y: 0.0, width: 4.0, height: 4.0 };
        assert!(!s.draw_on_active(&rect, &StrokeStyle::fill(RED)));
        assert!(events.lock().unwrap().is_empty());
        assert!(s.get_active_layer().surface().is_empty());
    }

    #[test]
    fn flatten_keeps_the_composite() {
        let mut s = stack_with(2);
        s.draw_on_layer(2, &Primitive::Rect { x: 0.0, y: 0.0, width: 8.0, height: 8.0 }, &StrokeStyle::fill(RED));
        let before = s.render();
        s.flatten().unwrap();
        assert_eq!(s.layer_count(), 1);
        assert!(s.get_active_layer().is_background());
        assert_eq!(s.render(), before);
    }

    #[test]
    fn render_into_matches_render() {
        let mut s = stack_with(1);
        s.draw_on_active(&Primitive::Circle { cx: 8.0, cy: 8.0, radius: 5.0 }, &StrokeStyle::fill(RED));
        let mut buf = RgbaImage::new(3, 3);
        s.render_into(&mut buf);
        assert_eq!(buf, s.render());
    }

    #[test]
    fn newer_load_supersedes_older() {
        let mut s = stack_with(1);
        let red = RgbaImage::from_pixel(16, 16, RED);
        let blue = RgbaImage::from_pixel(16, 16, Rgba([0, 0, 255, 255]));
        let first = s.load_raster(1, red.into()).unwrap();
        let second = s.load_raster(1, blue.into()).unwrap();
        assert!(second.generation > first.generation);
        let reports = s.wait_for_decodes();
        assert_eq!(reports.len(), 2);
        assert_eq!(s.pending_decodes(), 0);
        for r in &reports {
            if r.ticket == first {
                assert!(matches!(r.outcome, DecodeOutcome::Stale));
            } else {
                assert!(matches!(r.outcome, DecodeOutcome::Applied));
            }
        }
        assert_eq!(s.get_layer(1).unwrap().pixel(0, 0), Rgba([0, 0, 255, 255]));
    }

    #[test]
    fn decode_for_removed_layer_is_dropped() {
        let mut s = stack_with(1);
        s.load_raster(1, RgbaImage::from_pixel(16, 16, RED).into()).unwrap();
        s.remove_layer(1);
        let reports = s.wait_for_decodes();
        assert!(matches!(reports[0].outcome, DecodeOutcome::LayerGone));
        assert_eq!(s.render().get_pixel(0, 0), &WHITE);
    }

    #[test]
    fn failed_decode_keeps_prior_content() {
        let mut s = stack_with(1);
        s.draw_on_active(&Primitive::Rect { x: 0.0, y: 0.0, width: 16.0, height: 16.0 }, &StrokeStyle::fill(RED));
        s.load_raster(1, RasterSource::Encoded(b"garbage".to_vec())).unwrap();
        let reports = s.wait_for_decodes();
        assert!(matches!(reports[0].outcome, DecodeOutcome::Failed(EngineError::Decode(_))));
        assert_eq!(s.get_layer(1).unwrap().pixel(4, 4), RED);
    }

    #[test]
    fn import_rejects_bad_records_without_mutating() {
        let mut s = stack_with(2);
        let mut records = s.export_layers_as(RasterFormat::Png, 100).unwrap();
        records[2].blend_mode = "glow".into();
        assert!(matches!(s.import_layers(&records), Err(EngineError::InvalidBlendMode(_))));
        assert!(s.import_layers(&[]).is_err());
        assert_eq!(s.layer_count(), 3);
    }
}
