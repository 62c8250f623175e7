// ============================================================================
// LAYER MODEL — descriptors handed to the pipeline by the host editor
// ============================================================================
//
// The host (UI + state store) owns the layer list.  Every structural edit
// produces a fresh `Vec<LayerDescriptor>` passed to `Pipeline::sync`, ordered
// bottom layer first (painter's order).  Descriptors are plain data; the
// pipeline diffs them against its pass map and never mutates them.

use serde::{Deserialize, Serialize};

use crate::backend::TextureId;

/// What kind of content a layer sources its pixels from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerKind {
    /// Procedural effect graph (params -> pixels).
    Shader,
    /// Decoded still image.
    Image,
    /// Decoded video; a new frame arrives continuously while playing.
    Video,
    /// Live camera feed.
    Webcam,
    /// 3D model rendered into a private sub-target.
    Model,
}

impl LayerKind {
    /// Kinds whose pixels arrive asynchronously from an external loader.
    pub fn is_media(&self) -> bool {
        matches!(self, LayerKind::Image | LayerKind::Video | LayerKind::Webcam)
    }
}

/// The 16 supported blend modes.  The first twelve are separable (per-channel
/// formulas); the last four operate on whole colors via the W3C
/// SetLum / ClipColor / SetSat family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BlendMode {
    #[default]
    Normal,
    Multiply,
    Screen,
    Overlay,
    Darken,
    Lighten,
    ColorDodge,
    ColorBurn,
    HardLight,
    SoftLight,
    Difference,
    Exclusion,
    Hue,
    Saturation,
    Color,
    Luminosity,
}

impl BlendMode {
    /// Every mode, in UI display order.
    pub fn all() -> &'static [BlendMode] {
        &[
            BlendMode::Normal,
            BlendMode::Multiply,
            BlendMode::Screen,
            BlendMode::Overlay,
            BlendMode::Darken,
            BlendMode::Lighten,
            BlendMode::ColorDodge,
            BlendMode::ColorBurn,
            BlendMode::HardLight,
            BlendMode::SoftLight,
            BlendMode::Difference,
            BlendMode::Exclusion,
            BlendMode::Hue,
            BlendMode::Saturation,
            BlendMode::Color,
            BlendMode::Luminosity,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            BlendMode::Normal => "normal",
            BlendMode::Multiply => "multiply",
            BlendMode::Screen => "screen",
            BlendMode::Overlay => "overlay",
            BlendMode::Darken => "darken",
            BlendMode::Lighten => "lighten",
            BlendMode::ColorDodge => "color-dodge",
            BlendMode::ColorBurn => "color-burn",
            BlendMode::HardLight => "hard-light",
            BlendMode::SoftLight => "soft-light",
            BlendMode::Difference => "difference",
            BlendMode::Exclusion => "exclusion",
            BlendMode::Hue => "hue",
            BlendMode::Saturation => "saturation",
            BlendMode::Color => "color",
            BlendMode::Luminosity => "luminosity",
        }
    }

    pub fn from_name(name: &str) -> Option<BlendMode> {
        BlendMode::all().iter().copied().find(|m| m.name() == name)
    }

    /// Stable integer id used by the GPU shader switch.
    pub fn to_u32(&self) -> u32 {
        match self {
            BlendMode::Normal => 0,
            BlendMode::Multiply => 1,
            BlendMode::Screen => 2,
            BlendMode::Overlay => 3,
            BlendMode::Darken => 4,
            BlendMode::Lighten => 5,
            BlendMode::ColorDodge => 6,
            BlendMode::ColorBurn => 7,
            BlendMode::HardLight => 8,
            BlendMode::SoftLight => 9,
            BlendMode::Difference => 10,
            BlendMode::Exclusion => 11,
            BlendMode::Hue => 12,
            BlendMode::Saturation => 13,
            BlendMode::Color => 14,
            BlendMode::Luminosity => 15,
        }
    }

    /// Whether the mode can be computed independently per RGB channel.
    pub fn is_separable(&self) -> bool {
        !matches!(
            self,
            BlendMode::Hue | BlendMode::Saturation | BlendMode::Color | BlendMode::Luminosity
        )
    }
}

/// Whether a layer transforms the pixels beneath it (filter) or contributes
/// an independently-rendered overlay gated by a reveal weight (mask).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CompositeMode {
    #[default]
    Filter,
    Mask,
}

impl CompositeMode {
    pub fn name(&self) -> &'static str {
        match self {
            CompositeMode::Filter => "filter",
            CompositeMode::Mask => "mask",
        }
    }

    pub fn to_u32(&self) -> u32 {
        match self {
            CompositeMode::Filter => 0,
            CompositeMode::Mask => 1,
        }
    }
}

/// A single effect parameter value, already evaluated for the current frame.
/// If a timeline/keyframe system is active it interpolates *before* the value
/// reaches the pipeline; the pipeline never interpolates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    Float(f32),
    Int(i32),
    Bool(bool),
    Color([f32; 4]),
    Vec2([f32; 2]),
    Enum(u32),
}

impl ParamValue {
    /// Declared-type discriminant.  A parameter whose kind is unchanged must
    /// only ever rewrite uniform values, never rebuild the effect graph.
    pub fn kind(&self) -> ParamKind {
        match self {
            ParamValue::Float(_) => ParamKind::Float,
            ParamValue::Int(_) => ParamKind::Int,
            ParamValue::Bool(_) => ParamKind::Bool,
            ParamValue::Color(_) => ParamKind::Color,
            ParamValue::Vec2(_) => ParamKind::Vec2,
            ParamValue::Enum(_) => ParamKind::Enum,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamKind {
    Float,
    Int,
    Bool,
    Color,
    Vec2,
    Enum,
}

/// A named parameter with optional UI metadata (range / step / enum options).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerParam {
    pub key: String,
    pub value: ParamValue,
    #[serde(default)]
    pub range: Option<(f32, f32)>,
    #[serde(default)]
    pub step: Option<f32>,
    #[serde(default)]
    pub options: Vec<String>,
}

impl LayerParam {
    pub fn new(key: impl Into<String>, value: ParamValue) -> Self {
        Self {
            key: key.into(),
            value,
            range: None,
            step: None,
            options: Vec::new(),
        }
    }
}

/// One layer of the stack, as supplied by the host on every structural edit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LayerDescriptor {
    /// Stable identity across edits.
    pub id: String,
    pub kind: LayerKind,
    pub visible: bool,
    /// Clamped to [0, 1] by the pipeline.
    pub opacity: f32,
    pub blend_mode: BlendMode,
    pub composite_mode: CompositeMode,
    pub params: Vec<LayerParam>,
    /// Effect name for shader layers; media / model URL otherwise.
    pub source: Option<String>,
    /// Painted mask texture uploaded by the host, if any.
    pub mask: Option<TextureId>,
    /// Bumped by the host to request a reload of the same `source`.
    pub media_version: u64,
}

impl LayerDescriptor {
    pub fn new(id: impl Into<String>, kind: LayerKind) -> Self {
        Self {
            id: id.into(),
            kind,
            visible: true,
            opacity: 1.0,
            blend_mode: BlendMode::Normal,
            composite_mode: CompositeMode::Filter,
            params: Vec::new(),
            source: None,
            mask: None,
            media_version: 0,
        }
    }
}

/// Pointer state forwarded to interactive pass variants.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PointerState {
    pub u: f32,
    pub v: f32,
    pub du: f32,
    pub dv: f32,
    pub active: bool,
}

/// Lifecycle of an asynchronous media / model load, reported via
/// `StatusSink::on_media_status`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaStatus {
    Loading,
    Ready,
    Error,
}

impl MediaStatus {
    pub fn name(&self) -> &'static str {
        match self {
            MediaStatus::Loading => "loading",
            MediaStatus::Ready => "ready",
            MediaStatus::Error => "error",
        }
    }
}
