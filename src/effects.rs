// ============================================================================
// EFFECT REGISTRY — named effect constructors
// ============================================================================
//
// A shader layer names an effect; the registry turns that name plus the
// layer's parameters into an `EffectKernel`.  Construction is the expensive
// step (the backend compiles a material from it), so a kernel is only
// rebuilt when the effect *name* changes.  Parameter edits rewrite bindings.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::backend::EffectKernel;
use crate::error::PipelineError;
use crate::layer::LayerParam;

pub type EffectBuilder =
    Arc<dyn Fn(&[LayerParam]) -> Result<EffectKernel, PipelineError> + Send + Sync>;

pub struct EffectRegistry {
    builders: HashMap<String, EffectBuilder>,
}

impl Default for EffectRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl EffectRegistry {
    pub fn new() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("solid", Arc::new(|_| Ok(solid_kernel())));
        registry.register("gradient", Arc::new(|_| Ok(gradient_kernel())));
        registry.register("pulse", Arc::new(|_| Ok(pulse_kernel())));
        registry.register("ripple", Arc::new(|_| Ok(ripple_kernel())));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, builder: EffectBuilder) {
        let name = name.into();
        debug!(effect = %name, "registered effect");
        self.builders.insert(name, builder);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.builders.contains_key(name)
    }

    pub fn build(&self, name: &str, params: &[LayerParam]) -> Result<EffectKernel, PipelineError> {
        let builder = self
            .builders
            .get(name)
            .ok_or_else(|| PipelineError::UnknownEffect(name.to_string()))?;
        builder(params)
    }
}

fn slots(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// Constant color from the `color` parameter.
fn solid_kernel() -> EffectKernel {
    EffectKernel {
        wgsl: "    return vec4<f32>(slot(0u), slot(1u), slot(2u), slot(3u));".to_string(),
        slots: slots(&["color_r", "color_g", "color_b", "color_a"]),
        aux_slot: None,
        eval: Arc::new(|ctx| {
            [
                ctx.float("color_r", 1.0),
                ctx.float("color_g", 1.0),
                ctx.float("color_b", 1.0),
                ctx.float("color_a", 1.0),
            ]
        }),
        animated: false,
        interactive: false,
    }
}

/// Horizontal two-stop gradient between the `start` and `end` colors.
fn gradient_kernel() -> EffectKernel {
    EffectKernel {
        wgsl: "    let a = vec4<f32>(slot(0u), slot(1u), slot(2u), slot(3u));\n    \
               let b = vec4<f32>(slot(4u), slot(5u), slot(6u), slot(7u));\n    \
               return mix(a, b, uv.x);"
            .to_string(),
        slots: slots(&[
            "start_r", "start_g", "start_b", "start_a", "end_r", "end_g", "end_b", "end_a",
        ]),
        aux_slot: None,
        eval: Arc::new(|ctx| {
            let a = [
                ctx.float("start_r", 0.0),
                ctx.float("start_g", 0.0),
                ctx.float("start_b", 0.0),
                ctx.float("start_a", 1.0),
            ];
            let b = [
                ctx.float("end_r", 1.0),
                ctx.float("end_g", 1.0),
                ctx.float("end_b", 1.0),
                ctx.float("end_a", 1.0),
            ];
            let t = ctx.u;
            [
                a[0] + (b[0] - a[0]) * t,
                a[1] + (b[1] - a[1]) * t,
                a[2] + (b[2] - a[2]) * t,
                a[3] + (b[3] - a[3]) * t,
            ]
        }),
        animated: false,
        interactive: false,
    }
}

/// Time-driven brightness oscillation.  Animated: forces continuous
/// rendering while a layer using it is active.
fn pulse_kernel() -> EffectKernel {
    EffectKernel {
        wgsl: "    let speed = slot(4u);\n    \
               let l = 0.5 + 0.5 * sin(u.time * speed);\n    \
               return vec4<f32>(slot(0u) * l, slot(1u) * l, slot(2u) * l, slot(3u));"
            .to_string(),
        slots: slots(&["color_r", "color_g", "color_b", "color_a", "speed"]),
        aux_slot: None,
        eval: Arc::new(|ctx| {
            let speed = ctx.float("speed", 1.0);
            let l = 0.5 + 0.5 * (ctx.time * speed).sin();
            [
                ctx.float("color_r", 1.0) * l,
                ctx.float("color_g", 1.0) * l,
                ctx.float("color_b", 1.0) * l,
                ctx.float("color_a", 1.0),
            ]
        }),
        animated: true,
        interactive: false,
    }
}

/// Radial falloff around the pointer.  Interactive: the pipeline forwards
/// pointer state into the `pointer_*` slots every frame the pointer moves.
fn ripple_kernel() -> EffectKernel {
    EffectKernel {
        wgsl: "    let d = distance(uv, vec2<f32>(slot(0u), slot(1u)));\n    \
               let l = clamp(1.0 - d / max(slot(3u), 0.001), 0.0, 1.0) * slot(2u);\n    \
               return vec4<f32>(l, l, l, 1.0);"
            .to_string(),
        slots: slots(&["pointer_u", "pointer_v", "pointer_active", "radius"]),
        aux_slot: None,
        eval: Arc::new(|ctx| {
            let du = ctx.u - ctx.float("pointer_u", 0.5);
            let dv = ctx.v - ctx.float("pointer_v", 0.5);
            let d = (du * du + dv * dv).sqrt();
            let radius = ctx.float("radius", 0.25).max(0.001);
            let l = (1.0 - d / radius).clamp(0.0, 1.0) * ctx.float("pointer_active", 0.0);
            [l, l, l, 1.0]
        }),
        animated: false,
        interactive: true,
    }
}

/// Samples the decoded media texture bound to the `media` slot.
pub(crate) fn media_kernel() -> EffectKernel {
    EffectKernel {
        wgsl: "    return textureSample(aux_tex, aux_samp, uv);".to_string(),
        slots: Vec::new(),
        aux_slot: Some("media".to_string()),
        eval: Arc::new(|ctx| ctx.sample("media", ctx.u, ctx.v)),
        animated: false,
        interactive: false,
    }
}

/// Samples the model layer's private sub-target via the `model` slot.
pub(crate) fn model_kernel() -> EffectKernel {
    EffectKernel {
        wgsl: "    return textureSample(aux_tex, aux_samp, uv);".to_string(),
        slots: Vec::new(),
        aux_slot: Some("model".to_string()),
        eval: Arc::new(|ctx| ctx.sample("model", ctx.u, ctx.v)),
        animated: false,
        interactive: false,
    }
}

/// Fully transparent output: the stand-in for a pass whose construction
/// failed, so the rest of the stack keeps compositing.
pub(crate) fn passthrough_kernel() -> EffectKernel {
    EffectKernel {
        wgsl: "    return vec4<f32>(0.0, 0.0, 0.0, 0.0);".to_string(),
        slots: Vec::new(),
        aux_slot: None,
        eval: Arc::new(|_| [0.0, 0.0, 0.0, 0.0]),
        animated: false,
        interactive: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BindingTable, EvalCtx};
    use crate::layer::ParamValue;

    fn eval(kernel: &EffectKernel, bindings: &BindingTable, u: f32, v: f32, time: f32) -> [f32; 4] {
        let sampler = |_: &str, _: f32, _: f32| [0.0f32; 4];
        let ctx = EvalCtx {
            bindings,
            u,
            v,
            time,
            delta: 0.0,
            sampler: &sampler,
        };
        (kernel.eval)(&ctx)
    }

    #[test]
    fn unknown_effect_is_an_error() {
        let registry = EffectRegistry::with_builtins();
        let err = registry.build("does-not-exist", &[]).unwrap_err();
        assert!(matches!(err, PipelineError::UnknownEffect(_)));
    }

    #[test]
    fn solid_reads_color_bindings() {
        let registry = EffectRegistry::with_builtins();
        let kernel = registry.build("solid", &[]).unwrap();
        let mut bindings = BindingTable::new();
        bindings.set_param(&LayerParam::new(
            "color",
            ParamValue::Color([0.2, 0.4, 0.6, 1.0]),
        ));
        let px = eval(&kernel, &bindings, 0.5, 0.5, 0.0);
        assert_eq!(px, [0.2, 0.4, 0.6, 1.0]);
    }

    #[test]
    fn gradient_interpolates_horizontally() {
        let registry = EffectRegistry::with_builtins();
        let kernel = registry.build("gradient", &[]).unwrap();
        let mut bindings = BindingTable::new();
        bindings.set_param(&LayerParam::new(
            "start",
            ParamValue::Color([0.0, 0.0, 0.0, 1.0]),
        ));
        bindings.set_param(&LayerParam::new("end", ParamValue::Color([1.0, 1.0, 1.0, 1.0])));
        let left = eval(&kernel, &bindings, 0.0, 0.5, 0.0);
        let mid = eval(&kernel, &bindings, 0.5, 0.5, 0.0);
        let right = eval(&kernel, &bindings, 1.0, 0.5, 0.0);
        assert_eq!(left[0], 0.0);
        assert!((mid[0] - 0.5).abs() < 1e-6);
        assert_eq!(right[0], 1.0);
    }

    #[test]
    fn pulse_is_animated_and_time_dependent() {
        let registry = EffectRegistry::with_builtins();
        let kernel = registry.build("pulse", &[]).unwrap();
        assert!(kernel.animated);
        let bindings = BindingTable::new();
        let a = eval(&kernel, &bindings, 0.5, 0.5, 0.0);
        let b = eval(&kernel, &bindings, 0.5, 0.5, std::f32::consts::FRAC_PI_2);
        assert!(a[0] < b[0]);
    }

    #[test]
    fn ripple_is_interactive_and_pointer_gated() {
        let registry = EffectRegistry::with_builtins();
        let kernel = registry.build("ripple", &[]).unwrap();
        assert!(kernel.interactive);
        let mut bindings = BindingTable::new();
        bindings.set_float("pointer_u", 0.5);
        bindings.set_float("pointer_v", 0.5);
        bindings.set_float("pointer_active", 0.0);
        let idle = eval(&kernel, &bindings, 0.5, 0.5, 0.0);
        assert_eq!(idle[0], 0.0);
        bindings.set_float("pointer_active", 1.0);
        let active = eval(&kernel, &bindings, 0.5, 0.5, 0.0);
        assert_eq!(active[0], 1.0);
    }

    #[test]
    fn custom_registration_overrides() {
        let mut registry = EffectRegistry::with_builtins();
        assert!(registry.contains("solid"));
        registry.register(
            "noise",
            Arc::new(|_| {
                Ok(EffectKernel {
                    wgsl: "    return vec4<f32>(0.5, 0.5, 0.5, 1.0);".to_string(),
                    slots: Vec::new(),
                    aux_slot: None,
                    eval: Arc::new(|_| [0.5, 0.5, 0.5, 1.0]),
                    animated: false,
                    interactive: false,
                })
            }),
        );
        assert!(registry.contains("noise"));
        let kernel = registry.build("noise", &[]).unwrap();
        let px = eval(&kernel, &BindingTable::new(), 0.0, 0.0, 0.0);
        assert_eq!(px, [0.5, 0.5, 0.5, 1.0]);
    }
}
