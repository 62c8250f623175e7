// ============================================================================
// SOFTWARE BACKEND — CPU reference renderer
// ============================================================================
//
// Rendering always works even without a GPU: this backend evaluates effect
// kernels and the blend compositor on the CPU, one rayon task per row.  It is
// also what the test suite runs against, since its output is deterministic
// and directly inspectable.
//
// Buffers hold straight-alpha f32 pixels; readback converts to RGBA8.

use std::collections::HashMap;

use rayon::prelude::*;
use tracing::debug;

use super::{
    BackendError, BufferConfig, BufferId, DrawCall, EvalCtx, MaterialDesc, MaterialId,
    RenderBackend, Target, TextureId,
};
use crate::blend;
use crate::layer::{BlendMode, CompositeMode};

#[derive(Clone)]
struct CpuBuffer {
    width: u32,
    height: u32,
    config: BufferConfig,
    pixels: Vec<[f32; 4]>,
}

impl CpuBuffer {
    fn new(width: u32, height: u32, config: BufferConfig) -> Self {
        Self {
            width,
            height,
            config,
            pixels: vec![[0.0; 4]; (width * height) as usize],
        }
    }

    #[inline]
    fn sample(&self, u: f32, v: f32) -> [f32; 4] {
        let x = ((u * self.width as f32) as i64).clamp(0, self.width as i64 - 1) as usize;
        let y = ((v * self.height as f32) as i64).clamp(0, self.height as i64 - 1) as usize;
        self.pixels[y * self.width as usize + x]
    }
}

#[derive(Clone)]
struct CpuTexture {
    width: u32,
    height: u32,
    pixels: Vec<[f32; 4]>,
}

impl CpuTexture {
    #[inline]
    fn sample(&self, u: f32, v: f32) -> [f32; 4] {
        let x = ((u * self.width as f32) as i64).clamp(0, self.width as i64 - 1) as usize;
        let y = ((v * self.height as f32) as i64).clamp(0, self.height as i64 - 1) as usize;
        self.pixels[y * self.width as usize + x]
    }
}

#[derive(Clone)]
struct CpuMaterial {
    kernel: super::EffectKernel,
    blend: BlendMode,
    mode: CompositeMode,
}

/// CPU implementation of [`RenderBackend`].
pub struct SoftwareBackend {
    buffers: HashMap<BufferId, CpuBuffer>,
    textures: HashMap<TextureId, CpuTexture>,
    materials: HashMap<MaterialId, CpuMaterial>,
    display: CpuBuffer,
    next_id: u64,
}

impl SoftwareBackend {
    pub fn new() -> Self {
        Self {
            buffers: HashMap::new(),
            textures: HashMap::new(),
            materials: HashMap::new(),
            display: CpuBuffer::new(1, 1, BufferConfig::default()),
            next_id: 1,
        }
    }

    fn next(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Live handle counts, for leak assertions in tests.
    pub fn resource_counts(&self) -> (usize, usize, usize) {
        (self.buffers.len(), self.textures.len(), self.materials.len())
    }

    fn pack_rgba8(pixels: &[[f32; 4]]) -> Vec<u8> {
        let mut out = Vec::with_capacity(pixels.len() * 4);
        for px in pixels {
            for ch in px {
                out.push((ch.clamp(0.0, 1.0) * 255.0).round() as u8);
            }
        }
        out
    }
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderBackend for SoftwareBackend {
    fn create_buffer(
        &mut self,
        width: u32,
        height: u32,
        config: &BufferConfig,
    ) -> Result<BufferId, BackendError> {
        let id = BufferId(self.next());
        self.buffers.insert(id, CpuBuffer::new(width, height, *config));
        debug!(buffer = id.0, width, height, "created software buffer");
        Ok(id)
    }

    fn resize_buffer(
        &mut self,
        buffer: BufferId,
        width: u32,
        height: u32,
    ) -> Result<(), BackendError> {
        let buf = self
            .buffers
            .get_mut(&buffer)
            .ok_or(BackendError::UnknownBuffer(buffer))?;
        if buf.width != width || buf.height != height {
            *buf = CpuBuffer::new(width, height, buf.config);
        }
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
        let pixels = rgba
            .chunks_exact(4)
            .map(|c| {
                [
                    c[0] as f32 / 255.0,
                    c[1] as f32 / 255.0,
                    c[2] as f32 / 255.0,
                    c[3] as f32 / 255.0,
                ]
            })
            .collect();
        let id = TextureId(self.next());
        self.textures.insert(
            id,
            CpuTexture {
                width,
                height,
                pixels,
            },
        );
        Ok(id)
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        self.textures.remove(&texture);
    }

    fn compile_material(&mut self, desc: &MaterialDesc<'_>) -> Result<MaterialId, BackendError> {
        let id = MaterialId(self.next());
        self.materials.insert(
            id,
            CpuMaterial {
                kernel: desc.kernel.clone(),
                blend: desc.blend,
                mode: desc.mode,
            },
        );
        debug!(material = id.0, label = desc.label, blend = desc.blend.name(), "compiled software material");
        Ok(id)
    }

    fn destroy_material(&mut self, material: MaterialId) {
        self.materials.remove(&material);
    }

    fn fill(&mut self, target: BufferId, color: [f32; 4]) -> Result<(), BackendError> {
        let buf = self
            .buffers
            .get_mut(&target)
            .ok_or(BackendError::UnknownBuffer(target))?;
        buf.pixels.fill(color);
        Ok(())
    }

    fn draw(&mut self, call: &DrawCall<'_>) -> Result<(), BackendError> {
        let material = self
            .materials
            .get(&call.material)
            .ok_or(BackendError::UnknownMaterial(call.material))?
            .clone();
        let input = self
            .buffers
            .get(&call.input)
            .ok_or(BackendError::UnknownBuffer(call.input))?
            .clone();

        // The sampler borrows the texture map while the target row slices are
        // borrowed mutably from the buffer map, so split the two fields.
        let Self {
            buffers, textures, ..
        } = self;
        let target = buffers
            .get_mut(&call.target)
            .ok_or(BackendError::UnknownBuffer(call.target))?;

        let sampler = |slot: &str, u: f32, v: f32| -> [f32; 4] {
            call.bindings
                .texture(slot)
                .and_then(|id| textures.get(&id))
                .map(|tex| tex.sample(u, v))
                .unwrap_or([0.0; 4])
        };

        let mask_tex = call
            .bindings
            .texture("mask")
            .and_then(|id| textures.get(&id));

        // A zero-pixel target has no rows to chunk; nothing to draw.
        if target.width == 0 || target.height == 0 || input.width == 0 || input.height == 0 {
            return Ok(());
        }

        let width = target.width as usize;
        let th = target.height as f32;
        let tw = target.width as f32;
        let uniforms = call.uniforms;

        target
            .pixels
            .par_chunks_mut(width)
            .enumerate()
            .for_each(|(y, row)| {
                let v = (y as f32 + 0.5) / th;
                for (x, out) in row.iter_mut().enumerate() {
                    let u = (x as f32 + 0.5) / tw;
                    let base = input.sample(u, v);
                    let ctx = EvalCtx {
                        bindings: call.bindings,
                        u,
                        v,
                        time: uniforms.time,
                        delta: uniforms.delta,
                        sampler: &sampler,
                    };
                    let effect = (material.kernel.eval)(&ctx);
                    let mask = mask_tex.map(|t| t.sample(u, v));
                    *out = blend::composite(
                        material.blend,
                        material.mode,
                        base,
                        effect,
                        uniforms.opacity,
                        mask,
                    );
                }
            });

        Ok(())
    }

    fn blit(&mut self, source: BufferId, target: Target) -> Result<(), BackendError> {
        let src = self
            .buffers
            .get(&source)
            .ok_or(BackendError::UnknownBuffer(source))?
            .clone();
        match target {
            Target::Display => {
                // The display tracks the blit source's dimensions.
                self.display = src;
                Ok(())
            }
            Target::Buffer(dst_id) => {
                let dst = self
                    .buffers
                    .get_mut(&dst_id)
                    .ok_or(BackendError::UnknownBuffer(dst_id))?;
                if dst.width != src.width || dst.height != src.height {
                    return Err(BackendError::BlitMismatch {
                        src_w: src.width,
                        src_h: src.height,
                        dst_w: dst.width,
                        dst_h: dst.height,
                    });
                }
                dst.pixels.copy_from_slice(&src.pixels);
                Ok(())
            }
        }
    }

    fn resize_display(&mut self, width: u32, height: u32) -> Result<(), BackendError> {
        if self.display.width != width || self.display.height != height {
            self.display = CpuBuffer::new(width, height, BufferConfig::default());
        }
        Ok(())
    }

    fn read_pixels(&mut self, target: Target) -> Result<Vec<u8>, BackendError> {
        match target {
            Target::Display => Ok(Self::pack_rgba8(&self.display.pixels)),
            Target::Buffer(id) => {
                let buf = self
                    .buffers
                    .get(&id)
                    .ok_or(BackendError::UnknownBuffer(id))?;
                Ok(Self::pack_rgba8(&buf.pixels))
            }
        }
    }
}
