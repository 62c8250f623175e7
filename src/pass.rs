// ============================================================================
// PASS — one layer's compiled render state
// ============================================================================
//
// A pass binds a `PassSource` (where the pixels come from) to a compiled
// backend material (how they are blended over the stack).  The update split
// is the core performance contract:
//
//   uniform path   — opacity, params, mask, pointer state: binding rewrites,
//                    material untouched.
//   recompile path — blend mode or composite mode: the material is rebuilt
//                    and `material_version` increments.

use tracing::debug;

use crate::backend::{
    BindingTable, DrawCall, EffectKernel, MaterialDesc, MaterialId, RenderBackend, ShadeUniforms,
};
use crate::error::PipelineError;
use crate::layer::{BlendMode, CompositeMode, LayerDescriptor, LayerKind, LayerParam, PointerState};
use crate::sources::DecodedFrame;

/// Optional capability: a source that consumes pointer input.  Resolved once
/// per pass; non-interactive sources never see pointer traffic.
pub trait Interactive {
    fn set_pointer(&mut self, pointer: &PointerState, bindings: &mut BindingTable);
    fn add_click(&mut self, u: f32, v: f32, bindings: &mut BindingTable);
}

/// Where a pass gets its effect pixels from (procedural shader, decoded
/// media, model sub-render, ...).  Implementations live in `crate::sources`.
pub trait PassSource {
    fn kind(&self) -> LayerKind;

    /// The compiled effect topology this source renders with.
    fn kernel(&self) -> &EffectKernel;

    /// Push current parameter values into the binding table.
    fn update_params(&mut self, params: &[LayerParam], bindings: &mut BindingTable);

    /// True while the source produces new pixels without any input change.
    fn needs_continuous_render(&self) -> bool {
        false
    }

    fn resize(
        &mut self,
        _backend: &mut dyn RenderBackend,
        _width: u32,
        _height: u32,
    ) -> Result<(), PipelineError> {
        Ok(())
    }

    fn dispose(&mut self, _backend: &mut dyn RenderBackend) {}

    fn as_interactive(&mut self) -> Option<&mut dyn Interactive> {
        None
    }

    /// Deliver an asynchronously decoded frame (media sources only).
    fn accept_media(
        &mut self,
        _backend: &mut dyn RenderBackend,
        _frame: &DecodedFrame,
        _bindings: &mut BindingTable,
    ) -> Result<(), PipelineError> {
        Ok(())
    }
}

pub struct Pass {
    pub id: String,
    pub kind: LayerKind,
    pub enabled: bool,
    /// Set when the last render attempt failed; cleared on the next sync.
    pub failed: bool,
    opacity: f32,
    blend: BlendMode,
    mode: CompositeMode,
    material: Option<MaterialId>,
    material_version: u64,
    bindings: BindingTable,
    source: Box<dyn PassSource>,
    /// Effect name / media URL this pass was built from.
    pub source_ref: Option<String>,
}

impl Pass {
    pub fn new(
        backend: &mut dyn RenderBackend,
        desc: &LayerDescriptor,
        source: Box<dyn PassSource>,
    ) -> Result<Self, PipelineError> {
        let mut pass = Self {
            id: desc.id.clone(),
            kind: desc.kind,
            enabled: desc.visible,
            failed: false,
            opacity: desc.opacity.clamp(0.0, 1.0),
            blend: desc.blend_mode,
            mode: desc.composite_mode,
            material: None,
            material_version: 0,
            bindings: BindingTable::new(),
            source,
            source_ref: desc.source.clone(),
        };
        pass.update_params(&desc.params);
        pass.update_mask_texture(desc.mask);
        pass.material = Some(pass.compile(backend)?);
        Ok(pass)
    }

    /// A pass with no material at all: the last-resort stand-in when even the
    /// passthrough fallback failed to compile.  Never renders.
    pub fn new_inert(desc: &LayerDescriptor, source: Box<dyn PassSource>) -> Self {
        Self {
            id: desc.id.clone(),
            kind: desc.kind,
            enabled: false,
            failed: true,
            opacity: desc.opacity.clamp(0.0, 1.0),
            blend: desc.blend_mode,
            mode: desc.composite_mode,
            material: None,
            material_version: 0,
            bindings: BindingTable::new(),
            source,
            source_ref: desc.source.clone(),
        }
    }

    fn compile(&self, backend: &mut dyn RenderBackend) -> Result<MaterialId, PipelineError> {
        backend
            .compile_material(&MaterialDesc {
                kernel: self.source.kernel(),
                blend: self.blend,
                mode: self.mode,
                label: &self.id,
            })
            .map_err(|e| PipelineError::Construction {
                layer_id: self.id.clone(),
                message: e.to_string(),
            })
    }

    /// Included in the frame loop: enabled, healthy, compiled.
    pub fn active(&self) -> bool {
        self.enabled && !self.failed && self.material.is_some()
    }

    pub fn render(
        &self,
        backend: &mut dyn RenderBackend,
        input: crate::backend::BufferId,
        target: crate::backend::BufferId,
        time: f32,
        delta: f32,
    ) -> Result<(), PipelineError> {
        let material = self.material.ok_or_else(|| PipelineError::Render {
            layer_id: self.id.clone(),
            message: "no compiled material".to_string(),
        })?;
        backend.draw(&DrawCall {
            material,
            input,
            target,
            uniforms: ShadeUniforms {
                opacity: self.opacity,
                time,
                delta,
            },
            bindings: &self.bindings,
        })?;
        Ok(())
    }

    // ---- uniform-path updates ----

    pub fn update_opacity(&mut self, opacity: f32) {
        self.opacity = opacity.clamp(0.0, 1.0);
    }

    pub fn update_params(&mut self, params: &[LayerParam]) {
        self.source.update_params(params, &mut self.bindings);
    }

    pub fn update_mask_texture(&mut self, mask: Option<crate::backend::TextureId>) {
        self.bindings.set_texture("mask", mask);
    }

    // ---- recompile-path updates ----

    /// Returns true when the mode actually changed (and the material was
    /// recompiled).
    pub fn update_blend_mode(
        &mut self,
        backend: &mut dyn RenderBackend,
        blend: BlendMode,
    ) -> Result<bool, PipelineError> {
        if self.blend == blend {
            return Ok(false);
        }
        self.blend = blend;
        self.recompile(backend)?;
        Ok(true)
    }

    pub fn update_composite_mode(
        &mut self,
        backend: &mut dyn RenderBackend,
        mode: CompositeMode,
    ) -> Result<bool, PipelineError> {
        if self.mode == mode {
            return Ok(false);
        }
        self.mode = mode;
        self.recompile(backend)?;
        Ok(true)
    }

    /// Swap in a different source (effect name changed) and recompile.
    pub fn rebuild_source(
        &mut self,
        backend: &mut dyn RenderBackend,
        desc: &LayerDescriptor,
        source: Box<dyn PassSource>,
    ) -> Result<(), PipelineError> {
        self.source.dispose(backend);
        self.source = source;
        self.source_ref = desc.source.clone();
        self.bindings = BindingTable::new();
        self.update_params(&desc.params);
        self.update_mask_texture(desc.mask);
        self.recompile(backend)
    }

    fn recompile(&mut self, backend: &mut dyn RenderBackend) -> Result<(), PipelineError> {
        let fresh = self.compile(backend)?;
        if let Some(old) = self.material.replace(fresh) {
            backend.destroy_material(old);
        }
        self.material_version += 1;
        debug!(pass = %self.id, version = self.material_version, "recompiled material");
        Ok(())
    }

    pub fn material_version(&self) -> u64 {
        self.material_version
    }

    // ---- source passthroughs ----

    pub fn needs_continuous_render(&self) -> bool {
        self.enabled && !self.failed && self.source.needs_continuous_render()
    }

    pub fn is_interactive(&mut self) -> bool {
        self.source.as_interactive().is_some()
    }

    /// Returns true when the source consumed the pointer update.
    pub fn set_pointer(&mut self, pointer: &PointerState) -> bool {
        match self.source.as_interactive() {
            Some(interactive) => {
                interactive.set_pointer(pointer, &mut self.bindings);
                true
            }
            None => false,
        }
    }

    pub fn add_click(&mut self, u: f32, v: f32) -> bool {
        match self.source.as_interactive() {
            Some(interactive) => {
                interactive.add_click(u, v, &mut self.bindings);
                true
            }
            None => false,
        }
    }

    pub fn accept_media(
        &mut self,
        backend: &mut dyn RenderBackend,
        frame: &DecodedFrame,
    ) -> Result<(), PipelineError> {
        self.source.accept_media(backend, frame, &mut self.bindings)
    }

    pub fn resize(
        &mut self,
        backend: &mut dyn RenderBackend,
        width: u32,
        height: u32,
    ) -> Result<(), PipelineError> {
        self.source.resize(backend, width, height)
    }

    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    pub fn clear_failed(&mut self) {
        self.failed = false;
    }

    pub fn dispose(&mut self, backend: &mut dyn RenderBackend) {
        if let Some(material) = self.material.take() {
            backend.destroy_material(material);
        }
        self.source.dispose(backend);
    }

    #[cfg(test)]
    pub(crate) fn bindings(&self) -> &BindingTable {
        &self.bindings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::SoftwareBackend;
    use crate::layer::ParamValue;
    use crate::sources::build_source;
    use crate::effects::EffectRegistry;

    fn shader_desc(id: &str, effect: &str) -> LayerDescriptor {
        let mut desc = LayerDescriptor::new(id, LayerKind::Shader);
        desc.source = Some(effect.to_string());
        desc
    }

    fn make_pass(backend: &mut SoftwareBackend, desc: &LayerDescriptor) -> Pass {
        let registry = EffectRegistry::with_builtins();
        let source = build_source(desc, &registry, backend, 8, 8).unwrap();
        Pass::new(backend, desc, source).unwrap()
    }

    #[test]
    fn uniform_updates_keep_material_version() {
        let mut backend = SoftwareBackend::new();
        let desc = shader_desc("a", "solid");
        let mut pass = make_pass(&mut backend, &desc);
        let v0 = pass.material_version();

        pass.update_opacity(0.4);
        pass.update_params(&[LayerParam::new(
            "color",
            ParamValue::Color([1.0, 0.0, 0.0, 1.0]),
        )]);
        pass.update_mask_texture(None);
        assert_eq!(pass.material_version(), v0);
    }

    #[test]
    fn blend_mode_change_recompiles_once() {
        let mut backend = SoftwareBackend::new();
        let desc = shader_desc("a", "solid");
        let mut pass = make_pass(&mut backend, &desc);

        let changed = pass
            .update_blend_mode(&mut backend, BlendMode::Multiply)
            .unwrap();
        assert!(changed);
        assert_eq!(pass.material_version(), 1);

        // Same mode again: no-op, no recompile.
        let changed = pass
            .update_blend_mode(&mut backend, BlendMode::Multiply)
            .unwrap();
        assert!(!changed);
        assert_eq!(pass.material_version(), 1);
    }

    #[test]
    fn composite_mode_change_recompiles() {
        let mut backend = SoftwareBackend::new();
        let desc = shader_desc("a", "solid");
        let mut pass = make_pass(&mut backend, &desc);

        assert!(pass
            .update_composite_mode(&mut backend, CompositeMode::Mask)
            .unwrap());
        assert_eq!(pass.material_version(), 1);
        assert!(!pass
            .update_composite_mode(&mut backend, CompositeMode::Mask)
            .unwrap());
        assert_eq!(pass.material_version(), 1);
    }

    #[test]
    fn opacity_is_clamped() {
        let mut backend = SoftwareBackend::new();
        let mut desc = shader_desc("a", "solid");
        desc.opacity = 3.5;
        let pass = make_pass(&mut backend, &desc);
        // Render over opaque red base with a white solid; a clamped opacity
        // of 1.0 must fully replace the base.
        let config = crate::backend::BufferConfig::default();
        let input = backend.create_buffer(8, 8, &config).unwrap();
        let target = backend.create_buffer(8, 8, &config).unwrap();
        backend.fill(input, [1.0, 0.0, 0.0, 1.0]).unwrap();
        pass.render(&mut backend, input, target, 0.0, 0.0).unwrap();
        let px = backend
            .read_pixels(crate::backend::Target::Buffer(target))
            .unwrap();
        assert_eq!(&px[0..4], &[255, 255, 255, 255]);
    }

    #[test]
    fn failed_pass_is_inactive() {
        let mut backend = SoftwareBackend::new();
        let desc = shader_desc("a", "solid");
        let mut pass = make_pass(&mut backend, &desc);
        assert!(pass.active());
        pass.mark_failed();
        assert!(!pass.active());
        pass.clear_failed();
        assert!(pass.active());
    }

    #[test]
    fn pointer_only_reaches_interactive_sources() {
        let mut backend = SoftwareBackend::new();
        let mut solid = make_pass(&mut backend, &shader_desc("a", "solid"));
        let mut ripple = make_pass(&mut backend, &shader_desc("b", "ripple"));

        let pointer = PointerState {
            u: 0.25,
            v: 0.75,
            du: 0.0,
            dv: 0.0,
            active: true,
        };
        assert!(!solid.set_pointer(&pointer));
        assert!(ripple.set_pointer(&pointer));
        assert_eq!(ripple.bindings().float("pointer_u", 0.0), 0.25);
        assert_eq!(ripple.bindings().float("pointer_v", 0.0), 0.75);
        assert_eq!(ripple.bindings().float("pointer_active", 0.0), 1.0);
    }
}
