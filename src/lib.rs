// ============================================================================
// STRATA — layered GPU compositing pipeline
// ============================================================================
//
// Core of a layer-stack effects editor: the host owns the layer list and the
// UI; this crate owns everything between a `Vec<LayerDescriptor>` and pixels
// on the display.
//
//   layer    — descriptors, blend/composite modes, parameter values
//   blend    — reference blend math (W3C separable + non-separable modes)
//   effects  — named effect registry producing compiled kernels
//   backend  — the render seam: wgpu production path, CPU reference path
//   pool     — leased offscreen buffer pool
//   pass     — one layer's compiled render state
//   sources  — shader / media / model pass sources and the loader seam
//   pipeline — the orchestrator: sync, dirty gating, ping-pong, export

pub mod backend;
pub mod blend;
pub mod effects;
pub mod error;
pub mod layer;
pub mod pass;
pub mod pipeline;
pub mod pool;
pub mod sources;

pub use backend::software::SoftwareBackend;
pub use backend::wgpu::WgpuBackend;
pub use backend::{BufferConfig, Filtering, PixelFormat, RenderBackend, TextureId};
pub use effects::{EffectBuilder, EffectRegistry};
pub use error::PipelineError;
pub use layer::{
    BlendMode, CompositeMode, LayerDescriptor, LayerKind, LayerParam, MediaStatus, ParamValue,
    PointerState,
};
pub use pipeline::{
    ExportFormat, ExportOptions, NullSink, Pipeline, PipelineOptions, StatusSink,
};
pub use sources::{DecodedFrame, MediaEvent, MediaLoader, NullLoader};
