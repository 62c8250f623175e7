// ============================================================================
// BLEND COMPOSITOR — pure per-pixel compositing math
// ============================================================================
//
// The single source of truth for blend-mode behavior.  The software backend
// calls these functions per pixel; the wgpu backend's WGSL template mirrors
// them function-for-function.  All channels are normalized to [0, 1];
// opacity and mask weights are clamped before multiplication.

use crate::layer::{BlendMode, CompositeMode};

/// Relative luminance weights (Rec. 709).
const LUMA_R: f32 = 0.2126;
const LUMA_G: f32 = 0.7152;
const LUMA_B: f32 = 0.0722;

#[inline]
pub fn luminance(c: [f32; 3]) -> f32 {
    LUMA_R * c[0] + LUMA_G * c[1] + LUMA_B * c[2]
}

#[inline]
fn mix(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

// ---- Separable channel formulas ----

#[inline]
fn overlay_ch(base: f32, top: f32) -> f32 {
    if base < 0.5 {
        2.0 * base * top
    } else {
        1.0 - 2.0 * (1.0 - base) * (1.0 - top)
    }
}

#[inline]
fn color_dodge_ch(base: f32, top: f32) -> f32 {
    if top >= 1.0 {
        1.0
    } else {
        (base / (1.0 - top)).min(1.0)
    }
}

#[inline]
fn color_burn_ch(base: f32, top: f32) -> f32 {
    if top <= 0.0 {
        0.0
    } else {
        (1.0 - (1.0 - base) / top).max(0.0)
    }
}

/// Soft Light, W3C three-branch formula keyed on top < 0.5 and base <= 0.25.
#[inline]
fn soft_light_ch(base: f32, top: f32) -> f32 {
    if top <= 0.5 {
        base - (1.0 - 2.0 * top) * base * (1.0 - base)
    } else {
        let d = if base <= 0.25 {
            ((16.0 * base - 12.0) * base + 4.0) * base
        } else {
            base.sqrt()
        };
        base + (2.0 * top - 1.0) * (d - base)
    }
}

#[inline]
fn separable(base: [f32; 3], top: [f32; 3], f: fn(f32, f32) -> f32) -> [f32; 3] {
    [f(base[0], top[0]), f(base[1], top[1]), f(base[2], top[2])]
}

// ---- Non-separable primitives (W3C SetLum / ClipColor / SetSat) ----

/// max − min channel.
#[inline]
pub fn saturation(c: [f32; 3]) -> f32 {
    let max = c[0].max(c[1]).max(c[2]);
    let min = c[0].min(c[1]).min(c[2]);
    max - min
}

/// Re-center an out-of-range color around its luminance, then the caller
/// clamps.  Keeps SetLum results inside the displayable gamut.
fn clip_color(c: [f32; 3]) -> [f32; 3] {
    let l = luminance(c);
    let n = c[0].min(c[1]).min(c[2]);
    let x = c[0].max(c[1]).max(c[2]);
    let mut out = c;
    if n < 0.0 {
        for ch in &mut out {
            *ch = l + (*ch - l) * l / (l - n);
        }
    }
    if x > 1.0 {
        for ch in &mut out {
            *ch = l + (*ch - l) * (1.0 - l) / (x - l);
        }
    }
    out.map(|ch| ch.clamp(0.0, 1.0))
}

fn set_lum(c: [f32; 3], l: f32) -> [f32; 3] {
    let d = l - luminance(c);
    clip_color([c[0] + d, c[1] + d, c[2] + d])
}

/// Reassign saturation while preserving the sorted order of the channels.
fn set_sat(c: [f32; 3], s: f32) -> [f32; 3] {
    // Index channels by rank: min, mid, max.
    let mut idx = [0usize, 1, 2];
    idx.sort_by(|&a, &b| c[a].partial_cmp(&c[b]).unwrap_or(std::cmp::Ordering::Equal));
    let (lo, mid, hi) = (idx[0], idx[1], idx[2]);

    let mut out = [0.0f32; 3];
    if c[hi] > c[lo] {
        out[mid] = (c[mid] - c[lo]) * s / (c[hi] - c[lo]);
        out[hi] = s;
    }
    out[lo] = 0.0;
    out
}

/// Apply one of the 16 blend modes to straight-alpha RGB color values.
pub fn blend_rgb(mode: BlendMode, base: [f32; 3], effect: [f32; 3]) -> [f32; 3] {
    match mode {
        BlendMode::Normal => effect,
        BlendMode::Multiply => separable(base, effect, |b, t| b * t),
        BlendMode::Screen => separable(base, effect, |b, t| 1.0 - (1.0 - b) * (1.0 - t)),
        BlendMode::Overlay => separable(base, effect, overlay_ch),
        BlendMode::Darken => separable(base, effect, f32::min),
        BlendMode::Lighten => separable(base, effect, f32::max),
        BlendMode::ColorDodge => separable(base, effect, color_dodge_ch),
        BlendMode::ColorBurn => separable(base, effect, color_burn_ch),
        // Hard light is overlay with base/top swapped.
        BlendMode::HardLight => separable(effect, base, overlay_ch),
        BlendMode::SoftLight => separable(base, effect, soft_light_ch),
        BlendMode::Difference => separable(base, effect, |b, t| (b - t).abs()),
        BlendMode::Exclusion => separable(base, effect, |b, t| b + t - 2.0 * b * t),
        BlendMode::Hue => set_lum(set_sat(effect, saturation(base)), luminance(base)),
        BlendMode::Saturation => set_lum(set_sat(base, saturation(effect)), luminance(base)),
        BlendMode::Color => set_lum(effect, luminance(base)),
        BlendMode::Luminosity => set_lum(base, luminance(effect)),
    }
}

/// Composite one effect pixel over one base pixel.
///
/// * Filter mode: `final = mix(base, mode(base, effect), opacity * maskLuma)`
///   where the mask luma is 1 when no external mask is bound.
/// * Mask mode: the painted mask's luminance drives the reveal weight when a
///   mask is bound; otherwise the effect's own luminance does.
///
/// Colors are straight alpha.  The effect's own alpha scales the weight, so
/// a fully transparent effect (a media layer before its first frame arrives)
/// leaves the base untouched.  The output alpha is the base covered by the
/// weighted effect (standard over).
pub fn composite(
    mode: BlendMode,
    composite_mode: CompositeMode,
    base: [f32; 4],
    effect: [f32; 4],
    opacity: f32,
    mask: Option<[f32; 4]>,
) -> [f32; 4] {
    let opacity = opacity.clamp(0.0, 1.0) * effect[3].clamp(0.0, 1.0);
    let mask_luma = mask.map(|m| luminance([m[0], m[1], m[2]]).clamp(0.0, 1.0));

    let weight = match composite_mode {
        CompositeMode::Filter => opacity * mask_luma.unwrap_or(1.0),
        CompositeMode::Mask => {
            let reveal =
                mask_luma.unwrap_or_else(|| luminance([effect[0], effect[1], effect[2]]));
            opacity * reveal.clamp(0.0, 1.0)
        }
    };

    let base_rgb = [base[0], base[1], base[2]];
    let blended = blend_rgb(mode, base_rgb, [effect[0], effect[1], effect[2]]);

    [
        mix(base[0], blended[0], weight).clamp(0.0, 1.0),
        mix(base[1], blended[1], weight).clamp(0.0, 1.0),
        mix(base[2], blended[2], weight).clamp(0.0, 1.0),
        (base[3] + (1.0 - base[3]) * weight).clamp(0.0, 1.0),
    ]
}
