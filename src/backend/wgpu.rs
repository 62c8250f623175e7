// ============================================================================
// WGPU BACKEND — production GPU renderer
// ============================================================================
//
// One uber-shader template implements the whole compositing contract: the
// fragment shader samples the composited base, evaluates the spliced effect
// kernel, applies the baked blend/composite mode, and writes the result with
// hardware blending DISABLED (the shader does all blend math).
//
// Blend and composite mode are compile-time constants of the material, so a
// mode change is a recompile and everything else is a uniform rewrite —
// exactly the performance contract the pipeline enforces.

use std::collections::HashMap;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use tracing::{debug, warn};
use wgpu::util::DeviceExt;

use super::{
    BackendError, BufferConfig, BufferId, DrawCall, MaterialDesc, MaterialId, PixelFormat,
    RenderBackend, Target, TextureId,
};

/// Scalar uniforms plus 64 packed float slots, rewritten every draw.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct ComposeUniforms {
    opacity: f32,
    time: f32,
    delta: f32,
    has_mask: u32,
    slots: [[f32; 4]; 16],
}

struct GpuBuffer {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    _depth: Option<wgpu::TextureView>,
    config: BufferConfig,
    width: u32,
    height: u32,
}

struct GpuTexture {
    _texture: wgpu::Texture,
    view: wgpu::TextureView,
}

struct GpuMaterial {
    module: wgpu::ShaderModule,
    layout: wgpu::PipelineLayout,
    /// Pipelines cached per target format (created lazily at first draw).
    pipelines: HashMap<wgpu::TextureFormat, wgpu::RenderPipeline>,
    uniform_buf: wgpu::Buffer,
    uniform_bg: wgpu::BindGroup,
    slots: Vec<String>,
    aux_slot: Option<String>,
}

/// wgpu implementation of [`RenderBackend`].
pub struct WgpuBackend {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    pub adapter_name: String,
    pub max_texture_dim: u32,

    uniform_bgl: wgpu::BindGroupLayout,
    tex_bgl: wgpu::BindGroupLayout,
    sampler_linear: wgpu::Sampler,
    sampler_nearest: wgpu::Sampler,
    /// Bound in place of absent mask / aux textures.
    white_view: wgpu::TextureView,

    buffers: HashMap<BufferId, GpuBuffer>,
    textures: HashMap<TextureId, GpuTexture>,
    materials: HashMap<MaterialId, GpuMaterial>,
    display: Option<GpuBuffer>,
    staging: Option<(wgpu::Buffer, u64)>,
    next_id: u64,
}

impl WgpuBackend {
    /// Attempt to create a GPU backend.  Tries hardware first, then falls
    /// back to a software rasterizer (`force_fallback_adapter`) so rendering
    /// always works even without a real GPU.
    pub fn new(preferred_gpu: &str) -> Result<Self, BackendError> {
        if let Some(backend) = pollster::block_on(Self::new_async(preferred_gpu, false)) {
            return Ok(backend);
        }
        warn!("hardware adapter unavailable, trying software fallback");
        pollster::block_on(Self::new_async(preferred_gpu, true)).ok_or_else(|| {
            BackendError::DeviceLost("no wgpu adapter available".to_string())
        })
    }

    async fn new_async(preferred_gpu: &str, force_fallback: bool) -> Option<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let power = match preferred_gpu.to_lowercase().as_str() {
            "low power" | "integrated" => wgpu::PowerPreference::LowPower,
            _ => wgpu::PowerPreference::HighPerformance,
        };

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: power,
                compatible_surface: None, // headless: offscreen composition only
                force_fallback_adapter: force_fallback,
            })
            .await?;

        let adapter_name = adapter.get_info().name.clone();
        let limits = adapter.limits();

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("strata GPU"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits {
                        max_texture_dimension_2d: limits.max_texture_dimension_2d,
                        ..wgpu::Limits::downlevel_defaults()
                    },
                },
                None,
            )
            .await
            .ok()?;

        let uniform_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("compose_uniform_bgl"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });

        // Texture + sampler pair, shared by base / mask / aux groups.
        let tex_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("compose_tex_bgl"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let sampler_linear = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("sampler_linear"),
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });
        let sampler_nearest = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("sampler_nearest"),
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let white = device.create_texture_with_data(
            &queue,
            &wgpu::TextureDescriptor {
                label: Some("white_1x1"),
                size: wgpu::Extent3d {
                    width: 1,
                    height: 1,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::Rgba8Unorm,
                usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            },
            wgpu::util::TextureDataOrder::LayerMajor,
            &[255, 255, 255, 255],
        );
        let white_view = white.create_view(&wgpu::TextureViewDescriptor::default());

        debug!(adapter = %adapter_name, fallback = force_fallback, "wgpu backend ready");

        Some(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            adapter_name,
            max_texture_dim: limits.max_texture_dimension_2d,
            uniform_bgl,
            tex_bgl,
            sampler_linear,
            sampler_nearest,
            white_view,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            materials: HashMap::new(),
            display: None,
            staging: None,
            next_id: 1,
        })
    }

    fn next(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn texture_format(format: PixelFormat) -> wgpu::TextureFormat {
        match format {
            PixelFormat::Rgba8 => wgpu::TextureFormat::Rgba8Unorm,
            PixelFormat::Rgba16F => wgpu::TextureFormat::Rgba16Float,
        }
    }

    fn make_buffer(&self, width: u32, height: u32, config: &BufferConfig) -> GpuBuffer {
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("offscreen_buffer"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: Self::texture_format(config.format),
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let depth = config.depth.then(|| {
            self.device
                .create_texture(&wgpu::TextureDescriptor {
                    label: Some("offscreen_depth"),
                    size: wgpu::Extent3d {
                        width,
                        height,
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: wgpu::TextureFormat::Depth24Plus,
                    usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                    view_formats: &[],
                })
                .create_view(&wgpu::TextureViewDescriptor::default())
        });
        GpuBuffer {
            texture,
            view,
            _depth: depth,
            config: *config,
            width,
            height,
        }
    }

    fn aligned_bytes_per_row(width: u32) -> u32 {
        let unaligned = width * 4;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        (unaligned + align - 1) / align * align
    }

    /// Synchronous aligned readback of an Rgba8 texture: copy to a cached
    /// staging buffer, map, strip row padding.
    fn readback(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        staging_cache: &mut Option<(wgpu::Buffer, u64)>,
        texture: &wgpu::Texture,
        width: u32,
        height: u32,
    ) -> Result<Vec<u8>, BackendError> {
        let bytes_per_row = Self::aligned_bytes_per_row(width);
        let buffer_size = (bytes_per_row * height) as u64;

        let need_new = match staging_cache {
            Some((_, sz)) if *sz >= buffer_size => false,
            _ => true,
        };
        if need_new {
            let buf = device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("readback_staging"),
                size: buffer_size,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            *staging_cache = Some((buf, buffer_size));
        }
        let staging = &staging_cache.as_ref().unwrap().0;

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("readback_encoder"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: staging,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(bytes_per_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        device.poll(wgpu::Maintain::Wait);
        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(BackendError::Readback(format!("{e:?}"))),
            Err(e) => return Err(BackendError::Readback(format!("{e:?}"))),
        }

        let mapped = slice.get_mapped_range();
        let tight = (width * 4) as usize;
        let mut result = Vec::with_capacity(tight * height as usize);
        for row in 0..height as usize {
            let start = row * bytes_per_row as usize;
            result.extend_from_slice(&mapped[start..start + tight]);
        }
        drop(mapped);
        staging.unmap();
        Ok(result)
    }

    fn pack_uniforms(material: &GpuMaterial, call: &DrawCall<'_>) -> ComposeUniforms {
        let mut slots = [[0.0f32; 4]; 16];
        for (i, name) in material.slots.iter().enumerate().take(64) {
            slots[i / 4][i % 4] = call.bindings.float(name, 0.0);
        }
        ComposeUniforms {
            opacity: call.uniforms.opacity,
            time: call.uniforms.time,
            delta: call.uniforms.delta,
            has_mask: u32::from(call.bindings.texture("mask").is_some()),
            slots,
        }
    }
}

/// Assemble the full WGSL source for one material: blend helpers mirroring
/// `crate::blend`, the spliced effect kernel, and the baked mode constants.
fn build_shader_source(desc: &MaterialDesc<'_>) -> String {
    format!(
        r#"
const BLEND_MODE: u32 = {blend}u;
const COMPOSITE_MASK: u32 = {mode}u;

struct ComposeUniforms {{
    opacity: f32,
    time: f32,
    delta: f32,
    has_mask: u32,
    slots: array<vec4<f32>, 16>,
}};

@group(0) @binding(0) var<uniform> u: ComposeUniforms;
@group(1) @binding(0) var base_tex: texture_2d<f32>;
@group(1) @binding(1) var base_samp: sampler;
@group(2) @binding(0) var mask_tex: texture_2d<f32>;
@group(2) @binding(1) var mask_samp: sampler;
@group(3) @binding(0) var aux_tex: texture_2d<f32>;
@group(3) @binding(1) var aux_samp: sampler;

struct VertexOutput {{
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}};

@vertex
fn vs_compose(@builtin(vertex_index) vi: u32) -> VertexOutput {{
    var positions = array<vec2<f32>, 6>(
        vec2<f32>(0.0, 0.0),
        vec2<f32>(1.0, 0.0),
        vec2<f32>(0.0, 1.0),
        vec2<f32>(0.0, 1.0),
        vec2<f32>(1.0, 0.0),
        vec2<f32>(1.0, 1.0),
    );
    let pos = positions[vi];
    var out: VertexOutput;
    // uv row 0 lands on the framebuffer's top row: the one fixed vertical
    // convention, so chained passes never accumulate flips.
    out.position = vec4<f32>(pos.x * 2.0 - 1.0, 1.0 - pos.y * 2.0, 0.0, 1.0);
    out.uv = pos;
    return out;
}}

fn slot(i: u32) -> f32 {{
    return u.slots[i / 4u][i % 4u];
}}

fn lum(c: vec3<f32>) -> f32 {{
    return dot(c, vec3<f32>(0.2126, 0.7152, 0.0722));
}}

fn sat(c: vec3<f32>) -> f32 {{
    return max(c.r, max(c.g, c.b)) - min(c.r, min(c.g, c.b));
}}

fn clip_color(c: vec3<f32>) -> vec3<f32> {{
    let l = lum(c);
    let n = min(c.r, min(c.g, c.b));
    let x = max(c.r, max(c.g, c.b));
    var out = c;
    if (n < 0.0) {{
        out = l + (out - l) * l / (l - n);
    }}
    if (x > 1.0) {{
        out = l + (out - l) * (1.0 - l) / (x - l);
    }}
    return clamp(out, vec3<f32>(0.0), vec3<f32>(1.0));
}}

fn set_lum(c: vec3<f32>, l: f32) -> vec3<f32> {{
    return clip_color(c + vec3<f32>(l - lum(c)));
}}

fn set_sat(c: vec3<f32>, s: f32) -> vec3<f32> {{
    let mn = min(c.r, min(c.g, c.b));
    let mx = max(c.r, max(c.g, c.b));
    if (mx > mn) {{
        return (c - vec3<f32>(mn)) * s / (mx - mn);
    }}
    return vec3<f32>(0.0);
}}

fn overlay_ch(base: f32, top: f32) -> f32 {{
    if (base < 0.5) {{
        return 2.0 * base * top;
    }}
    return 1.0 - 2.0 * (1.0 - base) * (1.0 - top);
}}

fn color_dodge_ch(base: f32, top: f32) -> f32 {{
    if (top >= 1.0) {{ return 1.0; }}
    return min(base / (1.0 - top), 1.0);
}}

fn color_burn_ch(base: f32, top: f32) -> f32 {{
    if (top <= 0.0) {{ return 0.0; }}
    return max(1.0 - (1.0 - base) / top, 0.0);
}}

fn soft_light_ch(base: f32, top: f32) -> f32 {{
    if (top <= 0.5) {{
        return base - (1.0 - 2.0 * top) * base * (1.0 - base);
    }}
    var d: f32;
    if (base <= 0.25) {{
        d = ((16.0 * base - 12.0) * base + 4.0) * base;
    }} else {{
        d = sqrt(base);
    }}
    return base + (2.0 * top - 1.0) * (d - base);
}}

fn blend_rgb(base: vec3<f32>, eff: vec3<f32>) -> vec3<f32> {{
    switch (BLEND_MODE) {{
        case 0u: {{ return eff; }}
        case 1u: {{ return base * eff; }}
        case 2u: {{ return vec3<f32>(1.0) - (vec3<f32>(1.0) - base) * (vec3<f32>(1.0) - eff); }}
        case 3u: {{
            return vec3<f32>(
                overlay_ch(base.r, eff.r),
                overlay_ch(base.g, eff.g),
                overlay_ch(base.b, eff.b),
            );
        }}
        case 4u: {{ return min(base, eff); }}
        case 5u: {{ return max(base, eff); }}
        case 6u: {{
            return vec3<f32>(
                color_dodge_ch(base.r, eff.r),
                color_dodge_ch(base.g, eff.g),
                color_dodge_ch(base.b, eff.b),
            );
        }}
        case 7u: {{
            return vec3<f32>(
                color_burn_ch(base.r, eff.r),
                color_burn_ch(base.g, eff.g),
                color_burn_ch(base.b, eff.b),
            );
        }}
        case 8u: {{
            return vec3<f32>(
                overlay_ch(eff.r, base.r),
                overlay_ch(eff.g, base.g),
                overlay_ch(eff.b, base.b),
            );
        }}
        case 9u: {{
            return vec3<f32>(
                soft_light_ch(base.r, eff.r),
                soft_light_ch(base.g, eff.g),
                soft_light_ch(base.b, eff.b),
            );
        }}
        case 10u: {{ return abs(base - eff); }}
        case 11u: {{ return base + eff - 2.0 * base * eff; }}
        case 12u: {{ return set_lum(set_sat(eff, sat(base)), lum(base)); }}
        case 13u: {{ return set_lum(set_sat(base, sat(eff)), lum(base)); }}
        case 14u: {{ return set_lum(eff, lum(base)); }}
        default: {{ return set_lum(base, lum(eff)); }}
    }}
}}

fn effect_color(uv: vec2<f32>) -> vec4<f32> {{
{kernel}
}}

@fragment
fn fs_compose(in: VertexOutput) -> @location(0) vec4<f32> {{
    let base = textureSample(base_tex, base_samp, in.uv);
    let mask_px = textureSample(mask_tex, mask_samp, in.uv);
    let eff = effect_color(in.uv);

    var weight = clamp(u.opacity, 0.0, 1.0) * clamp(eff.a, 0.0, 1.0);
    if (COMPOSITE_MASK == 1u) {{
        var reveal = lum(eff.rgb);
        if (u.has_mask == 1u) {{
            reveal = lum(mask_px.rgb);
        }}
        weight = weight * clamp(reveal, 0.0, 1.0);
    }} else {{
        if (u.has_mask == 1u) {{
            weight = weight * clamp(lum(mask_px.rgb), 0.0, 1.0);
        }}
    }}

    let blended = blend_rgb(base.rgb, eff.rgb);
    let rgb = clamp(mix(base.rgb, blended, vec3<f32>(weight)), vec3<f32>(0.0), vec3<f32>(1.0));
    let a = clamp(base.a + (1.0 - base.a) * weight, 0.0, 1.0);
    return vec4<f32>(rgb, a);
}}
"#,
        blend = desc.blend.to_u32(),
        mode = desc.mode.to_u32(),
        kernel = desc.kernel.wgsl,
    )
}

impl RenderBackend for WgpuBackend {
    fn create_buffer(
        &mut self,
        width: u32,
        height: u32,
        config: &BufferConfig,
    ) -> Result<BufferId, BackendError> {
        if width > self.max_texture_dim || height > self.max_texture_dim {
            return Err(BackendError::AllocFailed {
                size: (width as usize) * (height as usize) * 4,
                message: format!("exceeds max texture dimension {}", self.max_texture_dim),
            });
        }
        let buffer = self.make_buffer(width, height, config);
        let id = BufferId(self.next());
        self.buffers.insert(id, buffer);
        Ok(id)
    }

    fn resize_buffer(
        &mut self,
        buffer: BufferId,
        width: u32,
        height: u32,
    ) -> Result<(), BackendError> {
        let config = {
            let buf = self
                .buffers
                .get(&buffer)
                .ok_or(BackendError::UnknownBuffer(buffer))?;
            if buf.width == width && buf.height == height {
                return Ok(());
            }
            buf.config
        };
        let fresh = self.make_buffer(width, height, &config);
        self.buffers.insert(buffer, fresh);
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        self.buffers.remove(&buffer);
    }

    fn buffer_size(&self, buffer: BufferId) -> Option<(u32, u32)> {
        self.buffers.get(&buffer).map(|b| (b.width, b.height))
    }

    fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        rgba: &[u8],
    ) -> Result<TextureId, BackendError> {
        let expected = (width * height * 4) as usize;
        if rgba.len() != expected {
            return Err(BackendError::BadUpload {
                expected,
                actual: rgba.len(),
            });
        }
        let texture = self.device.create_texture_with_data(
            &self.queue,
            &wgpu::TextureDescriptor {
                label: Some("layer_texture"),
                size: wgpu::Extent3d {
                    width,
                    height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::Rgba8Unorm,
                usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            },
            wgpu::util::TextureDataOrder::LayerMajor,
            rgba,
        );
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let id = TextureId(self.next());
        self.textures.insert(
            id,
            GpuTexture {
                _texture: texture,
                view,
            },
        );
        Ok(id)
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        self.textures.remove(&texture);
    }

    fn compile_material(&mut self, desc: &MaterialDesc<'_>) -> Result<MaterialId, BackendError> {
        let source = build_shader_source(desc);

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(desc.label),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(BackendError::Compile(err.to_string()));
        }

        let layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("compose_pipeline_layout"),
                bind_group_layouts: &[
                    &self.uniform_bgl,
                    &self.tex_bgl,
                    &self.tex_bgl,
                    &self.tex_bgl,
                ],
                push_constant_ranges: &[],
            });

        let uniform_buf = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("compose_uniform_buf"),
                contents: bytemuck::bytes_of(&ComposeUniforms::zeroed()),
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            });
        let uniform_bg = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("compose_uniform_bg"),
            layout: &self.uniform_bgl,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: uniform_buf.as_entire_binding(),
            }],
        });

        let id = MaterialId(self.next());
        self.materials.insert(
            id,
            GpuMaterial {
                module,
                layout,
                pipelines: HashMap::new(),
                uniform_buf,
                uniform_bg,
                slots: desc.kernel.slots.clone(),
                aux_slot: desc.kernel.aux_slot.clone(),
            },
        );
        debug!(material = id.0, label = desc.label, blend = desc.blend.name(), "compiled material");
        Ok(id)
    }

    fn destroy_material(&mut self, material: MaterialId) {
        self.materials.remove(&material);
    }

    fn fill(&mut self, target: BufferId, color: [f32; 4]) -> Result<(), BackendError> {
        let buf = self
            .buffers
            .get(&target)
            .ok_or(BackendError::UnknownBuffer(target))?;
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("fill_encoder"),
            });
        {
            let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("fill_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &buf.view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color {
                            r: color[0] as f64,
                            g: color[1] as f64,
                            b: color[2] as f64,
                            a: color[3] as f64,
                        }),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn draw(&mut self, call: &DrawCall<'_>) -> Result<(), BackendError> {
        // Field-split so the material (mutable, for the lazy pipeline cache)
        // and the buffers/textures (shared) can be borrowed together.
        let Self {
            device,
            queue,
            buffers,
            textures,
            materials,
            tex_bgl,
            sampler_linear,
            sampler_nearest,
            white_view,
            ..
        } = self;

        let material = materials
            .get_mut(&call.material)
            .ok_or(BackendError::UnknownMaterial(call.material))?;
        let input = buffers
            .get(&call.input)
            .ok_or(BackendError::UnknownBuffer(call.input))?;
        let target = buffers
            .get(&call.target)
            .ok_or(BackendError::UnknownBuffer(call.target))?;

        let uniforms = Self::pack_uniforms(material, call);
        queue.write_buffer(&material.uniform_buf, 0, bytemuck::bytes_of(&uniforms));

        let target_format = Self::texture_format(target.config.format);
        let pipeline = material.pipelines.entry(target_format).or_insert_with(|| {
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("compose_pipeline"),
                layout: Some(&material.layout),
                vertex: wgpu::VertexState {
                    module: &material.module,
                    entry_point: "vs_compose",
                    buffers: &[],
                    compilation_options: Default::default(),
                },
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    ..Default::default()
                },
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                fragment: Some(wgpu::FragmentState {
                    module: &material.module,
                    entry_point: "fs_compose",
                    targets: &[Some(wgpu::ColorTargetState {
                        format: target_format,
                        blend: None, // shader handles all blend math
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: Default::default(),
                }),
                multiview: None,
            })
        });

        let input_sampler = match input.config.filtering {
            super::Filtering::Linear => &*sampler_linear,
            super::Filtering::Nearest => &*sampler_nearest,
        };
        let base_bg = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("base_bg"),
            layout: tex_bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&input.view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(input_sampler),
                },
            ],
        });

        let mask_view = call
            .bindings
            .texture("mask")
            .and_then(|id| textures.get(&id))
            .map(|t| &t.view)
            .unwrap_or(white_view);
        let mask_bg = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("mask_bg"),
            layout: tex_bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(mask_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(sampler_linear),
                },
            ],
        });

        let aux_view = material
            .aux_slot
            .as_deref()
            .and_then(|slot| call.bindings.texture(slot))
            .and_then(|id| textures.get(&id))
            .map(|t| &t.view)
            .unwrap_or(white_view);
        let aux_bg = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("aux_bg"),
            layout: tex_bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(aux_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(sampler_linear),
                },
            ],
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("compose_encoder"),
        });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("compose_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &target.view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &material.uniform_bg, &[]);
            pass.set_bind_group(1, &base_bg, &[]);
            pass.set_bind_group(2, &mask_bg, &[]);
            pass.set_bind_group(3, &aux_bg, &[]);
            pass.draw(0..6, 0..1);
        }
        queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn blit(&mut self, source: BufferId, target: Target) -> Result<(), BackendError> {
        let src = self
            .buffers
            .get(&source)
            .ok_or(BackendError::UnknownBuffer(source))?;

        let (dst_tex, dst_w, dst_h) = match target {
            Target::Display => {
                let display = self.display.as_ref().ok_or_else(|| {
                    BackendError::Readback("display not configured".to_string())
                })?;
                (&display.texture, display.width, display.height)
            }
            Target::Buffer(id) => {
                let buf = self
                    .buffers
                    .get(&id)
                    .ok_or(BackendError::UnknownBuffer(id))?;
                (&buf.texture, buf.width, buf.height)
            }
        };

        if src.width != dst_w || src.height != dst_h {
            return Err(BackendError::BlitMismatch {
                src_w: src.width,
                src_h: src.height,
                dst_w,
                dst_h,
            });
        }

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("blit_encoder"),
            });
        encoder.copy_texture_to_texture(
            wgpu::ImageCopyTexture {
                texture: &src.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyTexture {
                texture: dst_tex,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::Extent3d {
                width: src.width,
                height: src.height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn resize_display(&mut self, width: u32, height: u32) -> Result<(), BackendError> {
        let needs_new = match &self.display {
            Some(d) => d.width != width || d.height != height,
            None => true,
        };
        if needs_new {
            self.display = Some(self.make_buffer(width, height, &BufferConfig::default()));
        }
        Ok(())
    }

    fn read_pixels(&mut self, target: Target) -> Result<Vec<u8>, BackendError> {
        let Self {
            device,
            queue,
            buffers,
            display,
            staging,
            ..
        } = self;
        let (texture, width, height) = match target {
            Target::Display => {
                let d = display.as_ref().ok_or_else(|| {
                    BackendError::Readback("display not configured".to_string())
                })?;
                (&d.texture, d.width, d.height)
            }
            Target::Buffer(id) => {
                let buf = buffers.get(&id).ok_or(BackendError::UnknownBuffer(id))?;
                if buf.config.format != PixelFormat::Rgba8 {
                    return Err(BackendError::Readback(
                        "readback supports Rgba8 buffers only".to_string(),
                    ));
                }
                (&buf.texture, buf.width, buf.height)
            }
        };
        Self::readback(device, queue, staging, texture, width, height)
    }
}
