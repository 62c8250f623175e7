// ============================================================================
// PASS SOURCES — where each layer's pixels come from
// ============================================================================

use tracing::debug;

use crate::backend::{BindingTable, EffectKernel, RenderBackend, TextureId};
use crate::effects::{media_kernel, model_kernel, passthrough_kernel, EffectRegistry};
use crate::error::PipelineError;
use crate::layer::{LayerDescriptor, LayerKind, LayerParam, PointerState};
use crate::pass::{Interactive, Pass, PassSource};

/// One decoded RGBA8 frame delivered by a media loader.
#[derive(Clone, Debug)]
pub struct DecodedFrame {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

/// Completion events polled from a [`MediaLoader`] once per frame.
#[derive(Clone, Debug)]
pub enum MediaEvent {
    Ready {
        layer_id: String,
        version: u64,
        frame: DecodedFrame,
    },
    Failed {
        layer_id: String,
        version: u64,
        message: String,
    },
}

/// Asynchronous media decoding seam.  The pipeline requests loads during
/// `sync` and polls for results at the top of every `render`; decode work
/// never blocks the render thread.
pub trait MediaLoader {
    fn request(&mut self, layer_id: &str, url: &str, version: u64);
    fn poll(&mut self) -> Vec<MediaEvent>;
}

/// Loader that never delivers anything.  Placeholder for hosts that upload
/// media textures themselves.
#[derive(Default)]
pub struct NullLoader;

impl MediaLoader for NullLoader {
    fn request(&mut self, _layer_id: &str, _url: &str, _version: u64) {}

    fn poll(&mut self) -> Vec<MediaEvent> {
        Vec::new()
    }
}

// ---- Shader ----

/// Procedural effect layer: pixels come from a registry-built kernel.
pub struct ShaderSource {
    kernel: EffectKernel,
}

impl ShaderSource {
    pub fn new(kernel: EffectKernel) -> Self {
        Self { kernel }
    }
}

impl PassSource for ShaderSource {
    fn kind(&self) -> LayerKind {
        LayerKind::Shader
    }

    fn kernel(&self) -> &EffectKernel {
        &self.kernel
    }

    fn update_params(&mut self, params: &[LayerParam], bindings: &mut BindingTable) {
        for param in params {
            bindings.set_param(param);
        }
    }

    fn needs_continuous_render(&self) -> bool {
        self.kernel.animated
    }

    fn as_interactive(&mut self) -> Option<&mut dyn Interactive> {
        if self.kernel.interactive {
            Some(self)
        } else {
            None
        }
    }
}

impl Interactive for ShaderSource {
    fn set_pointer(&mut self, pointer: &PointerState, bindings: &mut BindingTable) {
        bindings.set_float("pointer_u", pointer.u);
        bindings.set_float("pointer_v", pointer.v);
        bindings.set_float("pointer_du", pointer.du);
        bindings.set_float("pointer_dv", pointer.dv);
        bindings.set_float("pointer_active", if pointer.active { 1.0 } else { 0.0 });
    }

    fn add_click(&mut self, u: f32, v: f32, bindings: &mut BindingTable) {
        let count = bindings.float("click_count", 0.0);
        bindings.set_float("click_u", u);
        bindings.set_float("click_v", v);
        bindings.set_float("click_count", count + 1.0);
    }
}

// ---- Media (image / video / webcam) ----

/// Externally decoded pixels bound to the `media` texture slot.  Frames
/// arrive through `accept_media`; each replaces the previous texture.
pub struct MediaSource {
    kind: LayerKind,
    kernel: EffectKernel,
    texture: Option<TextureId>,
}

impl MediaSource {
    pub fn new(kind: LayerKind) -> Self {
        Self {
            kind,
            kernel: media_kernel(),
            texture: None,
        }
    }
}

impl PassSource for MediaSource {
    fn kind(&self) -> LayerKind {
        self.kind
    }

    fn kernel(&self) -> &EffectKernel {
        &self.kernel
    }

    fn update_params(&mut self, params: &[LayerParam], bindings: &mut BindingTable) {
        for param in params {
            bindings.set_param(param);
        }
    }

    /// Video and webcam feeds deliver new frames as long as they play.
    fn needs_continuous_render(&self) -> bool {
        matches!(self.kind, LayerKind::Video | LayerKind::Webcam)
    }

    fn accept_media(
        &mut self,
        backend: &mut dyn RenderBackend,
        frame: &DecodedFrame,
        bindings: &mut BindingTable,
    ) -> Result<(), PipelineError> {
        let fresh = backend.create_texture(frame.width, frame.height, &frame.rgba)?;
        if let Some(old) = self.texture.replace(fresh) {
            backend.destroy_texture(old);
        }
        bindings.set_texture("media", Some(fresh));
        debug!(width = frame.width, height = frame.height, "media frame bound");
        Ok(())
    }

    fn dispose(&mut self, backend: &mut dyn RenderBackend) {
        if let Some(texture) = self.texture.take() {
            backend.destroy_texture(texture);
        }
    }
}

// ---- Model ----

/// 3D model layer.  The external model renderer draws into a private
/// depth-enabled sub-target owned by this source (never pooled) and delivers
/// the shaded frame through `accept_media`; the pass composites it like any
/// other effect.
pub struct ModelSource {
    kernel: EffectKernel,
    sub_target: crate::backend::BufferId,
    texture: Option<TextureId>,
    auto_rotate: bool,
}

impl ModelSource {
    pub fn new(
        backend: &mut dyn RenderBackend,
        width: u32,
        height: u32,
    ) -> Result<Self, PipelineError> {
        let config = crate::backend::BufferConfig {
            depth: true,
            ..Default::default()
        };
        let sub_target = backend.create_buffer(width, height, &config)?;
        Ok(Self {
            kernel: model_kernel(),
            sub_target,
            texture: None,
            auto_rotate: false,
        })
    }

    pub fn sub_target(&self) -> crate::backend::BufferId {
        self.sub_target
    }
}

impl PassSource for ModelSource {
    fn kind(&self) -> LayerKind {
        LayerKind::Model
    }

    fn kernel(&self) -> &EffectKernel {
        &self.kernel
    }

    fn update_params(&mut self, params: &[LayerParam], bindings: &mut BindingTable) {
        for param in params {
            if param.key == "auto_rotate" {
                if let crate::layer::ParamValue::Bool(v) = param.value {
                    self.auto_rotate = v;
                }
            }
            bindings.set_param(param);
        }
    }

    fn needs_continuous_render(&self) -> bool {
        self.auto_rotate
    }

    fn resize(
        &mut self,
        backend: &mut dyn RenderBackend,
        width: u32,
        height: u32,
    ) -> Result<(), PipelineError> {
        backend.resize_buffer(self.sub_target, width, height)?;
        Ok(())
    }

    fn accept_media(
        &mut self,
        backend: &mut dyn RenderBackend,
        frame: &DecodedFrame,
        bindings: &mut BindingTable,
    ) -> Result<(), PipelineError> {
        let fresh = backend.create_texture(frame.width, frame.height, &frame.rgba)?;
        if let Some(old) = self.texture.replace(fresh) {
            backend.destroy_texture(old);
        }
        bindings.set_texture("model", Some(fresh));
        Ok(())
    }

    fn dispose(&mut self, backend: &mut dyn RenderBackend) {
        if let Some(texture) = self.texture.take() {
            backend.destroy_texture(texture);
        }
        backend.destroy_buffer(self.sub_target);
    }
}

// ---- Passthrough fallback ----

/// Transparent stand-in used when a layer's real source fails to construct.
/// Keeps the layer's slot in the stack without contributing pixels.
pub struct PassthroughSource {
    kernel: EffectKernel,
}

impl PassthroughSource {
    pub fn new() -> Self {
        Self {
            kernel: passthrough_kernel(),
        }
    }
}

impl Default for PassthroughSource {
    fn default() -> Self {
        Self::new()
    }
}

impl PassSource for PassthroughSource {
    fn kind(&self) -> LayerKind {
        LayerKind::Shader
    }

    fn kernel(&self) -> &EffectKernel {
        &self.kernel
    }

    fn update_params(&mut self, _params: &[LayerParam], _bindings: &mut BindingTable) {}
}

/// Construct the right source for a descriptor.
pub fn build_source(
    desc: &LayerDescriptor,
    registry: &EffectRegistry,
    backend: &mut dyn RenderBackend,
    width: u32,
    height: u32,
) -> Result<Box<dyn PassSource>, PipelineError> {
    match desc.kind {
        LayerKind::Shader => {
            let name = desc
                .source
                .as_deref()
                .ok_or_else(|| PipelineError::Construction {
                    layer_id: desc.id.clone(),
                    message: "shader layer has no effect name".to_string(),
                })?;
            let kernel = registry.build(name, &desc.params)?;
            Ok(Box::new(ShaderSource::new(kernel)))
        }
        LayerKind::Image | LayerKind::Video | LayerKind::Webcam => {
            Ok(Box::new(MediaSource::new(desc.kind)))
        }
        LayerKind::Model => Ok(Box::new(ModelSource::new(backend, width, height)?)),
    }
}

/// Build a pass for a descriptor, degrading on failure: a layer whose source
/// or material cannot be built becomes a transparent passthrough (or, if even
/// that fails, an inert pass) so the rest of the stack keeps rendering.
pub(crate) fn construct_pass(
    desc: &LayerDescriptor,
    registry: &EffectRegistry,
    backend: &mut dyn RenderBackend,
    width: u32,
    height: u32,
) -> (Pass, Option<PipelineError>) {
    let err = match build_source(desc, registry, backend, width, height)
        .and_then(|source| Pass::new(backend, desc, source))
    {
        Ok(pass) => return (pass, None),
        Err(err) => err,
    };
    match Pass::new(backend, desc, Box::new(PassthroughSource::new())) {
        Ok(mut pass) => {
            pass.mark_failed();
            (pass, Some(err))
        }
        Err(_) => (
            Pass::new_inert(desc, Box::new(PassthroughSource::new())),
            Some(err),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::SoftwareBackend;

    #[test]
    fn media_source_replaces_texture_per_frame() {
        let mut backend = SoftwareBackend::new();
        let mut source = MediaSource::new(LayerKind::Image);
        let mut bindings = BindingTable::new();

        let frame = DecodedFrame {
            width: 2,
            height: 2,
            rgba: vec![255; 16],
        };
        source
            .accept_media(&mut backend, &frame, &mut bindings)
            .unwrap();
        let first = bindings.texture("media").unwrap();

        source
            .accept_media(&mut backend, &frame, &mut bindings)
            .unwrap();
        let second = bindings.texture("media").unwrap();
        assert_ne!(first, second);

        let (_, textures, _) = backend.resource_counts();
        assert_eq!(textures, 1, "stale media texture must be destroyed");

        source.dispose(&mut backend);
        let (_, textures, _) = backend.resource_counts();
        assert_eq!(textures, 0);
    }

    #[test]
    fn media_continuity_by_kind() {
        assert!(!MediaSource::new(LayerKind::Image).needs_continuous_render());
        assert!(MediaSource::new(LayerKind::Video).needs_continuous_render());
        assert!(MediaSource::new(LayerKind::Webcam).needs_continuous_render());
    }

    #[test]
    fn model_source_owns_a_private_sub_target() {
        let mut backend = SoftwareBackend::new();
        let mut source = ModelSource::new(&mut backend, 16, 16).unwrap();
        assert_eq!(backend.buffer_size(source.sub_target()), Some((16, 16)));

        source.resize(&mut backend, 32, 8).unwrap();
        assert_eq!(backend.buffer_size(source.sub_target()), Some((32, 8)));

        source.dispose(&mut backend);
        assert_eq!(backend.buffer_size(source.sub_target()), None);
    }

    #[test]
    fn model_auto_rotate_drives_continuity() {
        let mut backend = SoftwareBackend::new();
        let mut source = ModelSource::new(&mut backend, 8, 8).unwrap();
        let mut bindings = BindingTable::new();
        assert!(!source.needs_continuous_render());

        source.update_params(
            &[LayerParam::new(
                "auto_rotate",
                crate::layer::ParamValue::Bool(true),
            )],
            &mut bindings,
        );
        assert!(source.needs_continuous_render());
    }

    #[test]
    fn shader_layer_without_effect_name_fails_construction() {
        let mut backend = SoftwareBackend::new();
        let registry = EffectRegistry::with_builtins();
        let desc = LayerDescriptor::new("s", LayerKind::Shader);
        let Err(err) = build_source(&desc, &registry, &mut backend, 8, 8) else {
            panic!("shader layer without an effect name must not build");
        };
        assert!(matches!(err, PipelineError::Construction { .. }));
    }

    #[test]
    fn construct_pass_degrades_to_passthrough() {
        let mut backend = SoftwareBackend::new();
        let registry = EffectRegistry::with_builtins();
        let mut desc = LayerDescriptor::new("s", LayerKind::Shader);
        desc.source = Some("no-such-effect".to_string());

        let (pass, err) = construct_pass(&desc, &registry, &mut backend, 8, 8);
        assert!(matches!(err, Some(PipelineError::UnknownEffect(_))));
        assert!(pass.failed);
        assert!(!pass.active());
    }
}
