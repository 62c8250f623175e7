// ============================================================================
// PIPELINE — the compositing orchestrator
// ============================================================================
//
// Owns the backend, the buffer pool, and the ordered pass list.  The host
// drives it with three kinds of traffic:
//
//   sync(descriptors)      — structural edits; diffed against live passes.
//   update_* / pointer     — per-frame uniform traffic, no reconstruction.
//   render(time, delta)    — draws only when dirty or a pass is continuous.
//
// Rendering ping-pongs between two pooled offscreen buffers: each active
// pass reads the composited stack so far and writes the other buffer, then
// the read/write indices swap.  A pass that fails is isolated (marked failed,
// skipped) and the rest of the stack keeps compositing.

use std::collections::{HashMap, HashSet};

use image::ImageEncoder;
use tracing::{debug, trace, warn};

use crate::backend::{BufferConfig, BufferId, RenderBackend, Target};
use crate::effects::EffectRegistry;
use crate::error::PipelineError;
use crate::layer::{LayerDescriptor, LayerKind, LayerParam, MediaStatus, PointerState};
use crate::pass::Pass;
use crate::pool::BufferPool;
use crate::sources::{build_source, construct_pass, MediaEvent, MediaLoader, NullLoader};

#[derive(Clone, Copy, Debug)]
pub struct PipelineOptions {
    pub width: u32,
    pub height: u32,
    /// Stack background, filled into the first ping-pong buffer every frame.
    pub base_color: [f32; 4],
    pub buffer_config: BufferConfig,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            base_color: [0.0, 0.0, 0.0, 1.0],
            buffer_config: BufferConfig::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportFormat {
    Png,
    Jpeg,
}

#[derive(Clone, Copy, Debug)]
pub struct ExportOptions {
    pub width: u32,
    pub height: u32,
    pub format: ExportFormat,
    /// JPEG quality, 1-100.  Ignored for PNG.
    pub quality: u8,
}

/// Host-facing status channel.  Every callback is deduplicated: a condition
/// is reported when it appears, not on every frame it persists.
pub trait StatusSink {
    fn on_shader_error(&mut self, _layer_id: &str, _message: &str) {}
    fn on_out_of_memory(&mut self, _layer_id: &str, _message: &str) {}
    fn on_media_status(&mut self, _layer_id: &str, _status: MediaStatus, _message: Option<&str>) {}
}

/// Discards all status traffic.
pub struct NullSink;

impl StatusSink for NullSink {}

pub struct Pipeline<B: RenderBackend> {
    backend: B,
    pool: BufferPool,
    registry: EffectRegistry,
    loader: Box<dyn MediaLoader>,
    sink: Box<dyn StatusSink>,

    passes: Vec<Pass>,
    index: HashMap<String, usize>,
    /// Indices of passes whose source consumes pointer traffic.
    interactive: Vec<usize>,

    ping_pong: [BufferId; 2],
    width: u32,
    height: u32,
    base_color: [f32; 4],
    buffer_config: BufferConfig,

    dirty: bool,
    export_mode: bool,
    pointer: PointerState,

    /// Last requested (url, version) per media layer; coalesces repeats and
    /// identifies stale completions.
    requested_versions: HashMap<String, (String, u64)>,
    reported_failures: HashSet<String>,
    reported_media: HashMap<String, MediaStatus>,
}

impl<B: RenderBackend> Pipeline<B> {
    pub fn new(mut backend: B, options: PipelineOptions) -> Result<Self, PipelineError> {
        let mut options = options;
        options.width = options.width.max(1);
        options.height = options.height.max(1);
        backend.resize_display(options.width, options.height)?;
        let mut pool = BufferPool::new();
        let ping = pool.acquire(
            &mut backend,
            options.width,
            options.height,
            &options.buffer_config,
        )?;
        let pong = pool.acquire(
            &mut backend,
            options.width,
            options.height,
            &options.buffer_config,
        )?;
        debug!(width = options.width, height = options.height, "pipeline ready");
        Ok(Self {
            backend,
            pool,
            registry: EffectRegistry::with_builtins(),
            loader: Box::new(NullLoader),
            sink: Box::new(NullSink),
            passes: Vec::new(),
            index: HashMap::new(),
            interactive: Vec::new(),
            ping_pong: [ping, pong],
            width: options.width,
            height: options.height,
            base_color: options.base_color,
            buffer_config: options.buffer_config,
            dirty: true,
            export_mode: false,
            pointer: PointerState::default(),
            requested_versions: HashMap::new(),
            reported_failures: HashSet::new(),
            reported_media: HashMap::new(),
        })
    }

    pub fn set_loader(&mut self, loader: Box<dyn MediaLoader>) {
        self.loader = loader;
    }

    pub fn set_status_sink(&mut self, sink: Box<dyn StatusSink>) {
        self.sink = sink;
    }

    pub fn registry_mut(&mut self) -> &mut EffectRegistry {
        &mut self.registry
    }

    // ---- structural sync ----

    /// Reconcile the pass list with the host's layer stack (bottom layer
    /// first).  Passes keep their compiled materials whenever the change is
    /// uniform-only; removed layers release every resource they held.
    pub fn sync(&mut self, descriptors: &[LayerDescriptor]) {
        self.reported_failures.clear();

        let mut old: HashMap<String, Pass> = self
            .passes
            .drain(..)
            .map(|pass| (pass.id.clone(), pass))
            .collect();

        let mut passes = Vec::with_capacity(descriptors.len());
        for desc in descriptors {
            let pass = match old.remove(&desc.id) {
                Some(mut pass) if pass.kind == desc.kind => {
                    self.refresh_pass(&mut pass, desc);
                    pass
                }
                Some(mut stale) => {
                    // Same id, different kind: rebuild from scratch.
                    stale.dispose(&mut self.backend);
                    self.forget(&desc.id);
                    self.construct(desc)
                }
                None => self.construct(desc),
            };
            passes.push(pass);
        }

        for (id, mut stale) in old {
            stale.dispose(&mut self.backend);
            self.forget(&id);
        }

        self.passes = passes;
        self.rebuild_index();
        self.dirty = true;
    }

    fn construct(&mut self, desc: &LayerDescriptor) -> Pass {
        let (pass, err) = construct_pass(
            desc,
            &self.registry,
            &mut self.backend,
            self.width,
            self.height,
        );
        if let Some(err) = err {
            self.report_error(&desc.id, &err);
        }
        if desc.kind.is_media() || desc.kind == LayerKind::Model {
            self.request_media(desc);
        }
        pass
    }

    fn refresh_pass(&mut self, pass: &mut Pass, desc: &LayerDescriptor) {
        pass.enabled = desc.visible;
        pass.clear_failed();
        pass.update_opacity(desc.opacity);
        pass.update_mask_texture(desc.mask);

        let modes = pass
            .update_blend_mode(&mut self.backend, desc.blend_mode)
            .and_then(|_| pass.update_composite_mode(&mut self.backend, desc.composite_mode));
        if let Err(err) = modes {
            pass.mark_failed();
            self.report_error(&desc.id, &err);
            return;
        }

        if desc.kind == LayerKind::Shader && pass.source_ref != desc.source {
            let rebuilt = build_source(
                desc,
                &self.registry,
                &mut self.backend,
                self.width,
                self.height,
            )
            .and_then(|source| pass.rebuild_source(&mut self.backend, desc, source));
            if let Err(err) = rebuilt {
                pass.mark_failed();
                self.report_error(&desc.id, &err);
            }
            return;
        }

        pass.update_params(&desc.params);
        if desc.kind.is_media() || desc.kind == LayerKind::Model {
            self.request_media(desc);
        }
    }

    /// Ask the loader for the layer's media unless the exact (url, version)
    /// is already in flight or delivered.
    fn request_media(&mut self, desc: &LayerDescriptor) {
        let Some(url) = desc.source.as_deref() else {
            return;
        };
        let want = (url.to_string(), desc.media_version);
        if self.requested_versions.get(&desc.id) == Some(&want) {
            return;
        }
        self.loader.request(&desc.id, url, desc.media_version);
        self.requested_versions.insert(desc.id.clone(), want);
        self.report_media_status(&desc.id, MediaStatus::Loading, None);
    }

    fn forget(&mut self, layer_id: &str) {
        self.requested_versions.remove(layer_id);
        self.reported_media.remove(layer_id);
        let prefix = format!("{layer_id}|");
        self.reported_failures.retain(|k| !k.starts_with(&prefix));
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        self.interactive.clear();
        for (i, pass) in self.passes.iter_mut().enumerate() {
            self.index.insert(pass.id.clone(), i);
            if pass.is_interactive() {
                self.interactive.push(i);
            }
        }
    }

    // ---- per-frame uniform traffic ----

    pub fn update_layer_params(&mut self, layer_id: &str, params: &[LayerParam]) -> bool {
        match self.index.get(layer_id) {
            Some(&idx) => {
                self.passes[idx].update_params(params);
                self.dirty = true;
                true
            }
            None => false,
        }
    }

    pub fn update_layer_opacity(&mut self, layer_id: &str, opacity: f32) -> bool {
        match self.index.get(layer_id) {
            Some(&idx) => {
                self.passes[idx].update_opacity(opacity);
                self.dirty = true;
                true
            }
            None => false,
        }
    }

    /// Broadcast pointer state to interactive passes only.
    pub fn set_pointer_state(&mut self, pointer: PointerState) {
        self.pointer = pointer;
        let mut consumed = false;
        for &idx in &self.interactive {
            if self.passes[idx].set_pointer(&pointer) {
                consumed = true;
            }
        }
        if consumed {
            self.dirty = true;
        }
    }

    pub fn add_click_event(&mut self, u: f32, v: f32) {
        let mut consumed = false;
        for &idx in &self.interactive {
            if self.passes[idx].add_click(u, v) {
                consumed = true;
            }
        }
        if consumed {
            self.dirty = true;
        }
    }

    // ---- rendering ----

    /// Render one frame to the display if anything warrants it.  Returns
    /// whether a frame was actually drawn.
    pub fn render(&mut self, time: f32, delta: f32) -> Result<bool, PipelineError> {
        self.pump_media();
        if self.export_mode {
            return Ok(false);
        }
        if !self.dirty && !self.needs_continuous_render() {
            return Ok(false);
        }
        self.render_frame(time, delta, Target::Display)?;
        self.dirty = false;
        Ok(true)
    }

    pub fn needs_continuous_render(&self) -> bool {
        self.passes.iter().any(Pass::needs_continuous_render)
    }

    fn render_frame(&mut self, time: f32, delta: f32, dest: Target) -> Result<(), PipelineError> {
        let bufs = self.ping_pong;
        let mut read = 0usize;
        let mut write = 1usize;

        // The base fill must succeed; without it there is no frame at all.
        self.backend.fill(bufs[read], self.base_color)?;

        let mut failures: Vec<(String, PipelineError)> = Vec::new();
        for pass in &mut self.passes {
            if !pass.active() {
                continue;
            }
            match pass.render(&mut self.backend, bufs[read], bufs[write], time, delta) {
                Ok(()) => std::mem::swap(&mut read, &mut write),
                Err(err) => {
                    // Isolate the failure: this pass drops out, the stack
                    // continues from the last good buffer.
                    pass.mark_failed();
                    failures.push((pass.id.clone(), err));
                }
            }
        }
        if !failures.is_empty() {
            self.dirty = true;
            for (layer_id, err) in failures {
                warn!(layer = %layer_id, error = %err, "pass failed during render");
                self.report_error(&layer_id, &err);
            }
        }

        self.backend.blit(bufs[read], dest)?;
        Ok(())
    }

    // ---- media ----

    fn pump_media(&mut self) {
        for event in self.loader.poll() {
            match event {
                MediaEvent::Ready {
                    layer_id,
                    version,
                    frame,
                } => {
                    if !self.is_current_version(&layer_id, version) {
                        trace!(layer = %layer_id, version, "discarding stale media frame");
                        continue;
                    }
                    let Some(&idx) = self.index.get(&layer_id) else {
                        continue;
                    };
                    match self.passes[idx].accept_media(&mut self.backend, &frame) {
                        Ok(()) => {
                            self.report_media_status(&layer_id, MediaStatus::Ready, None);
                            self.dirty = true;
                        }
                        Err(err) => {
                            self.passes[idx].mark_failed();
                            self.report_error(&layer_id, &err);
                        }
                    }
                }
                MediaEvent::Failed {
                    layer_id,
                    version,
                    message,
                } => {
                    if !self.is_current_version(&layer_id, version) {
                        continue;
                    }
                    if let Some(&idx) = self.index.get(&layer_id) {
                        self.passes[idx].mark_failed();
                    }
                    let err = PipelineError::Media {
                        layer_id: layer_id.clone(),
                        message,
                    };
                    self.report_error(&layer_id, &err);
                }
            }
        }
    }

    fn is_current_version(&self, layer_id: &str, version: u64) -> bool {
        self.requested_versions
            .get(layer_id)
            .is_some_and(|(_, v)| *v == version)
    }

    // ---- export ----

    /// Suspend live rendering; `render` becomes a no-op until the session
    /// ends.  Export frames are driven explicitly by the host.
    pub fn begin_export_session(&mut self) {
        self.export_mode = true;
    }

    pub fn end_export_session(&mut self) {
        self.export_mode = false;
        self.dirty = true;
    }

    /// Render one export frame to a caller-chosen destination, ignoring
    /// dirty gating.
    pub fn render_export_frame(
        &mut self,
        time: f32,
        delta: f32,
        dest: Target,
    ) -> Result<(), PipelineError> {
        self.render_frame(time, delta, dest)
    }

    /// Render a single frame at the requested resolution and encode it.
    /// The live resolution is restored afterwards; the next live frame is
    /// re-rendered from scratch.
    pub fn export_image(
        &mut self,
        time: f32,
        options: &ExportOptions,
    ) -> Result<Vec<u8>, PipelineError> {
        let mut options = *options;
        options.width = options.width.max(1);
        options.height = options.height.max(1);
        let options = &options;
        let (live_w, live_h) = (self.width, self.height);
        let scaled = options.width != live_w || options.height != live_h;
        if scaled {
            self.resize_buffers(options.width, options.height)?;
        }

        let target = self.pool.acquire(
            &mut self.backend,
            options.width,
            options.height,
            &self.buffer_config,
        )?;
        let rendered = self
            .render_frame(time, 0.0, Target::Buffer(target))
            .and_then(|_| {
                self.backend
                    .read_pixels(Target::Buffer(target))
                    .map_err(PipelineError::from)
            });
        self.pool.release(target);

        if scaled {
            self.resize_buffers(live_w, live_h)?;
        }
        self.dirty = true;

        encode_image(&rendered?, options)
    }

    // ---- sizing ----

    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), PipelineError> {
        // A minimized host window reports 0x0; a zero-pixel target is
        // unrenderable, so clamp to the smallest real surface.
        let width = width.max(1);
        let height = height.max(1);
        if width == self.width && height == self.height {
            return Ok(());
        }
        self.backend.resize_display(width, height)?;
        self.resize_buffers(width, height)?;
        self.dirty = true;
        Ok(())
    }

    /// Resize the ping-pong chain and every pass-owned target.  The display
    /// is left alone so exports can run at a different resolution.
    fn resize_buffers(&mut self, width: u32, height: u32) -> Result<(), PipelineError> {
        for id in self.ping_pong {
            self.backend.resize_buffer(id, width, height)?;
        }
        for pass in &mut self.passes {
            pass.resize(&mut self.backend, width, height)?;
        }
        self.width = width;
        self.height = height;
        Ok(())
    }

    // ---- status plumbing ----

    fn report_error(&mut self, layer_id: &str, err: &PipelineError) {
        let key = format!("{layer_id}|{err}");
        if !self.reported_failures.insert(key) {
            return;
        }
        if err.is_memory_class() {
            self.sink.on_out_of_memory(layer_id, &err.to_string());
        } else if let PipelineError::Media { message, .. } = err {
            self.report_media_status(layer_id, MediaStatus::Error, Some(message.as_str()));
        } else {
            self.sink.on_shader_error(layer_id, &err.to_string());
        }
    }

    fn report_media_status(&mut self, layer_id: &str, status: MediaStatus, message: Option<&str>) {
        if self.reported_media.get(layer_id) == Some(&status) {
            return;
        }
        self.reported_media.insert(layer_id.to_string(), status);
        self.sink.on_media_status(layer_id, status, message);
    }

    // ---- introspection / teardown ----

    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn material_version(&self, layer_id: &str) -> Option<u64> {
        self.index
            .get(layer_id)
            .map(|&idx| self.passes[idx].material_version())
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Read back the displayed frame as packed RGBA8.
    pub fn read_display(&mut self) -> Result<Vec<u8>, PipelineError> {
        Ok(self.backend.read_pixels(Target::Display)?)
    }

    /// Release every pass and pooled buffer.  The pipeline is unusable
    /// afterwards; call before dropping when the backend outlives it.
    pub fn shutdown(&mut self) {
        for pass in &mut self.passes {
            pass.dispose(&mut self.backend);
        }
        self.passes.clear();
        self.index.clear();
        self.interactive.clear();
        self.pool.dispose_all(&mut self.backend);
    }
}

fn encode_image(rgba: &[u8], options: &ExportOptions) -> Result<Vec<u8>, PipelineError> {
    let mut out = Vec::new();
    match options.format {
        ExportFormat::Png => {
            image::codecs::png::PngEncoder::new(&mut out)
                .write_image(rgba, options.width, options.height, image::ColorType::Rgba8)
                .map_err(|e| PipelineError::Encode(e.to_string()))?;
        }
        ExportFormat::Jpeg => {
            let rgb: Vec<u8> = rgba
                .chunks_exact(4)
                .flat_map(|px| [px[0], px[1], px[2]])
                .collect();
            let quality = options.quality.clamp(1, 100);
            image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality)
                .encode(&rgb, options.width, options.height, image::ColorType::Rgb8)
                .map_err(|e| PipelineError::Encode(e.to_string()))?;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::SoftwareBackend;
    use crate::layer::{BlendMode, ParamValue};

    fn solid_layer(id: &str, color: [f32; 4]) -> LayerDescriptor {
        let mut desc = LayerDescriptor::new(id, LayerKind::Shader);
        desc.source = Some("solid".to_string());
        desc.params = vec![LayerParam::new("color", ParamValue::Color(color))];
        desc
    }

    fn pipeline(w: u32, h: u32) -> Pipeline<SoftwareBackend> {
        let options = PipelineOptions {
            width: w,
            height: h,
            ..Default::default()
        };
        Pipeline::new(SoftwareBackend::new(), options).unwrap()
    }

    #[test]
    fn sync_is_idempotent() {
        let mut p = pipeline(8, 8);
        let layers = vec![solid_layer("a", [1.0, 0.0, 0.0, 1.0])];
        p.sync(&layers);
        let version = p.material_version("a").unwrap();
        let (buffers, _, materials) = p.backend().resource_counts();

        p.sync(&layers);
        p.sync(&layers);
        assert_eq!(p.pass_count(), 1);
        assert_eq!(p.material_version("a"), Some(version));
        assert_eq!(p.backend().resource_counts(), (buffers, 0, materials));
    }

    #[test]
    fn removed_layer_releases_resources() {
        let mut p = pipeline(8, 8);
        p.sync(&[
            solid_layer("a", [1.0, 0.0, 0.0, 1.0]),
            solid_layer("b", [0.0, 1.0, 0.0, 1.0]),
        ]);
        let (_, _, materials_before) = p.backend().resource_counts();

        p.sync(&[solid_layer("a", [1.0, 0.0, 0.0, 1.0])]);
        assert_eq!(p.pass_count(), 1);
        let (_, _, materials_after) = p.backend().resource_counts();
        assert_eq!(materials_after, materials_before - 1);
    }

    #[test]
    fn blend_mode_edit_recompiles_param_edit_does_not() {
        let mut p = pipeline(8, 8);
        let mut layer = solid_layer("a", [1.0, 0.0, 0.0, 1.0]);
        p.sync(&[layer.clone()]);
        assert_eq!(p.material_version("a"), Some(0));

        layer.params = vec![LayerParam::new("color", ParamValue::Color([0.0, 0.0, 1.0, 1.0]))];
        layer.opacity = 0.5;
        p.sync(&[layer.clone()]);
        assert_eq!(p.material_version("a"), Some(0));

        layer.blend_mode = BlendMode::Multiply;
        p.sync(&[layer.clone()]);
        assert_eq!(p.material_version("a"), Some(1));
    }

    #[test]
    fn export_session_suspends_live_rendering() {
        let mut p = pipeline(8, 8);
        p.sync(&[solid_layer("a", [1.0, 1.0, 1.0, 1.0])]);

        p.begin_export_session();
        assert!(!p.render(0.0, 0.0).unwrap());
        assert!(p.is_dirty(), "dirty state survives the export session");

        p.end_export_session();
        assert!(p.render(0.0, 0.0).unwrap());
    }

    #[test]
    fn zero_size_resize_clamps_instead_of_panicking() {
        let mut p = pipeline(8, 8);
        p.sync(&[solid_layer("a", [1.0, 0.0, 0.0, 1.0])]);

        // Minimized window: the host reports a 0x0 surface.
        p.resize(0, 0).unwrap();
        assert_eq!(p.size(), (1, 1));
        assert!(p.render(0.0, 0.0).unwrap());

        p.resize(8, 8).unwrap();
        assert!(p.render(0.016, 0.0).unwrap());
    }

    #[test]
    fn zero_size_export_clamps_instead_of_panicking() {
        let mut p = pipeline(8, 8);
        p.sync(&[solid_layer("a", [1.0, 0.0, 0.0, 1.0])]);

        let png = p
            .export_image(
                0.0,
                &ExportOptions {
                    width: 0,
                    height: 0,
                    format: ExportFormat::Png,
                    quality: 0,
                },
            )
            .unwrap();
        assert_eq!(&png[1..4], b"PNG");
        assert_eq!(p.size(), (8, 8));
    }

    #[test]
    fn jpeg_and_png_exports_encode() {
        let mut p = pipeline(8, 8);
        p.sync(&[solid_layer("a", [0.5, 0.2, 0.9, 1.0])]);

        let png = p
            .export_image(
                0.0,
                &ExportOptions {
                    width: 8,
                    height: 8,
                    format: ExportFormat::Png,
                    quality: 0,
                },
            )
            .unwrap();
        assert_eq!(&png[1..4], b"PNG");

        let jpeg = p
            .export_image(
                0.0,
                &ExportOptions {
                    width: 8,
                    height: 8,
                    format: ExportFormat::Jpeg,
                    quality: 90,
                },
            )
            .unwrap();
        assert_eq!(&jpeg[0..2], &[0xFF, 0xD8]);
    }
}
