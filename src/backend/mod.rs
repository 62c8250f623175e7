// ============================================================================
// RENDER BACKEND — the seam between the pipeline and the GPU
// ============================================================================
//
// The orchestrator is written against this trait.  Two implementations ship:
//
//   software.rs — CPU reference renderer (rayon row-parallel).  Used when no
//                 adapter is available and by the test suite.
//   wgpu.rs     — production wgpu renderer (uber-shader compositing).
//
// An effect is an *immutable compiled topology* (`EffectKernel`) plus a
// mutable `BindingTable` of named value/texture slots.  Rewriting a binding
// never recompiles; swapping kernels or blend/composite modes does.

pub mod software;
pub mod wgpu;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::layer::{BlendMode, CompositeMode};

// ---- Handles ----

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct BufferId(pub u64);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct TextureId(pub u64);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct MaterialId(pub u64);

// ---- Offscreen buffer configuration ----

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Filtering {
    Linear,
    Nearest,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgba8,
    Rgba16F,
}

/// Attachment configuration of an offscreen buffer.  The pool buckets free
/// buffers by the canonical `key()` so a lease never returns a buffer with
/// an incompatible configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferConfig {
    pub filtering: Filtering,
    pub format: PixelFormat,
    pub depth: bool,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            filtering: Filtering::Linear,
            format: PixelFormat::Rgba8,
            depth: false,
        }
    }
}

impl BufferConfig {
    /// Canonical serialization used as the pool bucket key.
    pub fn key(&self) -> String {
        format!("{:?}|{:?}|depth={}", self.filtering, self.format, self.depth)
    }
}

// ---- Errors ----

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("allocation of {size} bytes failed: {message}")]
    AllocFailed { size: usize, message: String },
    #[error("unknown buffer handle {0:?}")]
    UnknownBuffer(BufferId),
    #[error("unknown texture handle {0:?}")]
    UnknownTexture(TextureId),
    #[error("unknown material handle {0:?}")]
    UnknownMaterial(MaterialId),
    #[error("shader compilation failed: {0}")]
    Compile(String),
    #[error("pixel readback failed: {0}")]
    Readback(String),
    #[error("blit size mismatch: {src_w}x{src_h} -> {dst_w}x{dst_h}")]
    BlitMismatch {
        src_w: u32,
        src_h: u32,
        dst_w: u32,
        dst_h: u32,
    },
    #[error("device lost: {0}")]
    DeviceLost(String),
    #[error("invalid upload: expected {expected} bytes, got {actual}")]
    BadUpload { expected: usize, actual: usize },
}

// ---- Effect kernels & bindings ----

/// CPU-side evaluator for one effect pixel.
pub type CpuEval = Arc<dyn Fn(&EvalCtx<'_>) -> [f32; 4] + Send + Sync>;

/// Texture slot sampler handed to CPU evaluators by the software backend.
pub type SlotSampler<'a> = &'a (dyn Fn(&str, f32, f32) -> [f32; 4] + Sync);

/// Per-pixel evaluation context for the CPU path.
pub struct EvalCtx<'a> {
    pub bindings: &'a BindingTable,
    pub u: f32,
    pub v: f32,
    pub time: f32,
    pub delta: f32,
    pub sampler: SlotSampler<'a>,
}

impl EvalCtx<'_> {
    #[inline]
    pub fn float(&self, key: &str, default: f32) -> f32 {
        self.bindings.float(key, default)
    }

    #[inline]
    pub fn sample(&self, slot: &str, u: f32, v: f32) -> [f32; 4] {
        (self.sampler)(slot, u, v)
    }
}

/// An immutable compiled effect topology.
///
/// Carries both representations the crate renders with: a WGSL expression
/// body for the GPU backend and a CPU evaluator mirroring it.  `slots` fixes
/// the order float bindings are packed into the GPU uniform array; `aux_slot`
/// names the texture binding (if any) exposed to the kernel as `aux_tex`.
#[derive(Clone)]
pub struct EffectKernel {
    /// WGSL body of `fn effect_color(uv: vec2<f32>) -> vec4<f32>`.
    pub wgsl: String,
    /// Float binding names in GPU packing order (index = `slot(i)`).
    pub slots: Vec<String>,
    /// Texture binding sampled as `aux_tex` on the GPU.
    pub aux_slot: Option<String>,
    pub eval: CpuEval,
    /// Output changes over time even with no input changes.
    pub animated: bool,
    /// Kernel consumes pointer state (forwarded via pointer_* slots).
    pub interactive: bool,
}

impl fmt::Debug for EffectKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectKernel")
            .field("wgsl_len", &self.wgsl.len())
            .field("slots", &self.slots)
            .field("aux_slot", &self.aux_slot)
            .field("animated", &self.animated)
            .field("interactive", &self.interactive)
            .finish()
    }
}

/// Named binding slots: the mutable half of an effect.  Rewritten freely
/// between frames; never triggers a recompile.
#[derive(Clone, Debug, Default)]
pub struct BindingTable {
    floats: BTreeMap<String, f32>,
    textures: BTreeMap<String, TextureId>,
}

impl BindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_float(&mut self, key: impl Into<String>, value: f32) {
        self.floats.insert(key.into(), value);
    }

    pub fn float(&self, key: &str, default: f32) -> f32 {
        self.floats.get(key).copied().unwrap_or(default)
    }

    /// `None` clears the slot.
    pub fn set_texture(&mut self, key: &str, texture: Option<TextureId>) {
        match texture {
            Some(id) => {
                self.textures.insert(key.to_string(), id);
            }
            None => {
                self.textures.remove(key);
            }
        }
    }

    pub fn texture(&self, key: &str) -> Option<TextureId> {
        self.textures.get(key).copied()
    }

    /// Flatten a layer parameter into float slots.  Multi-component values
    /// get component suffixes (`key_r`…, `key_x`/`key_y`).
    pub fn set_param(&mut self, param: &crate::layer::LayerParam) {
        use crate::layer::ParamValue;
        let key = &param.key;
        match &param.value {
            ParamValue::Float(v) => self.set_float(key.clone(), *v),
            ParamValue::Int(v) => self.set_float(key.clone(), *v as f32),
            ParamValue::Bool(v) => self.set_float(key.clone(), if *v { 1.0 } else { 0.0 }),
            ParamValue::Enum(v) => self.set_float(key.clone(), *v as f32),
            ParamValue::Vec2(v) => {
                self.set_float(format!("{key}_x"), v[0]);
                self.set_float(format!("{key}_y"), v[1]);
            }
            ParamValue::Color(c) => {
                self.set_float(format!("{key}_r"), c[0]);
                self.set_float(format!("{key}_g"), c[1]);
                self.set_float(format!("{key}_b"), c[2]);
                self.set_float(format!("{key}_a"), c[3]);
            }
        }
    }
}

// ---- Draw submission ----

/// Scalar uniforms rewritten on every draw.
#[derive(Clone, Copy, Debug)]
pub struct ShadeUniforms {
    pub opacity: f32,
    pub time: f32,
    pub delta: f32,
}

/// Everything a compiled material needs to know at compile time.  Blend and
/// composite mode are baked into the material; changing either recompiles.
pub struct MaterialDesc<'a> {
    pub kernel: &'a EffectKernel,
    pub blend: BlendMode,
    pub mode: CompositeMode,
    /// Debug label surfaced in backend diagnostics.
    pub label: &'a str,
}

/// One fullscreen-quad draw: sample `input` as the composited base, evaluate
/// the material's effect kernel, blend, write `target`.
pub struct DrawCall<'a> {
    pub material: MaterialId,
    pub input: BufferId,
    pub target: BufferId,
    pub uniforms: ShadeUniforms,
    pub bindings: &'a BindingTable,
}

/// Blit / readback destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    /// The visible destination surface.
    Display,
    Buffer(BufferId),
}

/// The rendering backend contract.
///
/// One render thread; no call blocks on asynchronous work except
/// `read_pixels`, which synchronizes with the device by design.
pub trait RenderBackend {
    fn create_buffer(
        &mut self,
        width: u32,
        height: u32,
        config: &BufferConfig,
    ) -> Result<BufferId, BackendError>;
    fn resize_buffer(&mut self, buffer: BufferId, width: u32, height: u32)
        -> Result<(), BackendError>;
    fn destroy_buffer(&mut self, buffer: BufferId);
    fn buffer_size(&self, buffer: BufferId) -> Option<(u32, u32)>;

    /// Upload straight-alpha RGBA8 pixels as a sampleable texture.
    fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        rgba: &[u8],
    ) -> Result<TextureId, BackendError>;
    fn destroy_texture(&mut self, texture: TextureId);

    fn compile_material(&mut self, desc: &MaterialDesc<'_>) -> Result<MaterialId, BackendError>;
    fn destroy_material(&mut self, material: MaterialId);

    /// Fill a buffer with a constant straight-alpha color.
    fn fill(&mut self, target: BufferId, color: [f32; 4]) -> Result<(), BackendError>;
    fn draw(&mut self, call: &DrawCall<'_>) -> Result<(), BackendError>;
    fn blit(&mut self, source: BufferId, target: Target) -> Result<(), BackendError>;

    fn resize_display(&mut self, width: u32, height: u32) -> Result<(), BackendError>;

    /// Read back packed straight-alpha RGBA8 pixels.
    fn read_pixels(&mut self, target: Target) -> Result<Vec<u8>, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{LayerParam, ParamValue};

    #[test]
    fn config_key_is_canonical() {
        let a = BufferConfig::default();
        let b = BufferConfig::default();
        assert_eq!(a.key(), b.key());
        let c = BufferConfig {
            depth: true,
            ..BufferConfig::default()
        };
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn binding_table_float_roundtrip() {
        let mut t = BindingTable::new();
        t.set_float("speed", 2.5);
        assert_eq!(t.float("speed", 0.0), 2.5);
        assert_eq!(t.float("missing", 7.0), 7.0);
    }

    #[test]
    fn binding_table_texture_clear() {
        let mut t = BindingTable::new();
        t.set_texture("mask", Some(TextureId(3)));
        assert_eq!(t.texture("mask"), Some(TextureId(3)));
        t.set_texture("mask", None);
        assert_eq!(t.texture("mask"), None);
    }

    #[test]
    fn param_flattening() {
        let mut t = BindingTable::new();
        t.set_param(&LayerParam::new("color", ParamValue::Color([0.1, 0.2, 0.3, 0.4])));
        t.set_param(&LayerParam::new("offset", ParamValue::Vec2([5.0, 6.0])));
        t.set_param(&LayerParam::new("invert", ParamValue::Bool(true)));
        assert_eq!(t.float("color_g", 0.0), 0.2);
        assert_eq!(t.float("offset_y", 0.0), 6.0);
        assert_eq!(t.float("invert", 0.0), 1.0);
    }
}
