//! wgpu implementation of the batch driver.
//!
//! Headless: the output surface is an offscreen texture sized by the last
//! viewport, read back over a mapped buffer. Every program is one shader
//! module built by joining the batcher's vertex and fragment halves, with
//! the projection at group 0 and the sampler plus slot textures at group 1.

use std::collections::HashMap;

use crate::foundation::core::Rgba8Premul;
use crate::foundation::error::{ZoetropeError, ZoetropeResult};
use crate::render::driver::{BatchUpload, DriverLimits, GpuDriver, GpuTextureHandle, ProgramHandle};

struct GpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
}

struct Program {
    pipeline: wgpu::RenderPipeline,
    texture_layout: wgpu::BindGroupLayout,
    texture_count: usize,
}

struct VertexBuffers {
    positions: wgpu::Buffer,
    uvs: wgpu::Buffer,
    tex_indices: wgpu::Buffer,
    alphas: wgpu::Buffer,
    capacity: usize,
}

pub struct WgpuDriver {
    device: wgpu::Device,
    queue: wgpu::Queue,
    limits: DriverLimits,

    sampler: wgpu::Sampler,
    uniform_layout: wgpu::BindGroupLayout,
    uniform_buffer: wgpu::Buffer,
    uniform_group: wgpu::BindGroup,

    programs: Vec<Program>,
    textures: HashMap<u64, GpuTexture>,
    next_texture: u64,
    vertices: Option<VertexBuffers>,

    output: Option<GpuTexture>,
    bound_target: Option<GpuTextureHandle>,
    viewport: (u32, u32),
}

impl WgpuDriver {
    pub fn new() -> ZoetropeResult<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| match e {
            wgpu::RequestAdapterError::NotFound { .. } => {
                ZoetropeError::render("no gpu adapter available")
            }
            other => ZoetropeError::render(format!("wgpu request_adapter failed: {other:?}")),
        })?;

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: None,
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            experimental_features: wgpu::ExperimentalFeatures::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::Off,
        }))
        .map_err(|e| ZoetropeError::render(format!("wgpu request_device failed: {e:?}")))?;

        let device_limits = device.limits();
        let limits = DriverLimits {
            max_texture_size: device_limits.max_texture_dimension_2d,
            max_texture_slots: device_limits.max_sampled_textures_per_shader_stage as usize,
        };

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("zoetrope_batch_sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let uniform_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("zoetrope_uniform_bgl"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: Some(std::num::NonZeroU64::new(64).unwrap()),
                },
                count: None,
            }],
        });

        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("zoetrope_projection"),
            size: 64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let uniform_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("zoetrope_uniform_bg"),
            layout: &uniform_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: uniform_buffer.as_entire_binding(),
            }],
        });

        Ok(Self {
            device,
            queue,
            limits,
            sampler,
            uniform_layout,
            uniform_buffer,
            uniform_group,
            programs: Vec::new(),
            textures: HashMap::new(),
            next_texture: 1,
            vertices: None,
            output: None,
            bound_target: None,
            viewport: (0, 0),
        })
    }

    fn make_texture(&self, width: u32, height: u32, as_target: bool) -> GpuTexture {
        let mut usage = wgpu::TextureUsages::TEXTURE_BINDING
            | wgpu::TextureUsages::COPY_SRC
            | wgpu::TextureUsages::COPY_DST;
        if as_target {
            usage |= wgpu::TextureUsages::RENDER_ATTACHMENT;
        }
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(if as_target {
                "zoetrope_render_target"
            } else {
                "zoetrope_texture"
            }),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        GpuTexture {
            texture,
            view,
            width,
            height,
        }
    }

    fn insert_texture(&mut self, width: u32, height: u32, as_target: bool) -> GpuTextureHandle {
        let texture = self.make_texture(width, height, as_target);
        let id = self.next_texture;
        self.next_texture += 1;
        self.textures.insert(id, texture);
        GpuTextureHandle(id)
    }

    fn check_dims(&self, width: u32, height: u32) -> ZoetropeResult<()> {
        if width == 0 || height == 0 {
            return Err(ZoetropeError::texture("texture dimensions must be nonzero"));
        }
        if width > self.limits.max_texture_size || height > self.limits.max_texture_size {
            return Err(ZoetropeError::texture(format!(
                "texture {width}x{height} exceeds the device limit of {}",
                self.limits.max_texture_size
            )));
        }
        Ok(())
    }

    /// The output surface tracks the viewport; it is replaced when the
    /// viewport changes while unbound targets are in effect.
    fn ensure_output(&mut self) -> ZoetropeResult<()> {
        let (width, height) = self.viewport;
        if width == 0 || height == 0 {
            return Err(ZoetropeError::render("viewport has not been set"));
        }
        let needs_create = self
            .output
            .as_ref()
            .map(|o| o.width != width || o.height != height)
            .unwrap_or(true);
        if needs_create {
            self.output = Some(self.make_texture(width, height, true));
        }
        Ok(())
    }

    fn target_texture(&self, target: Option<GpuTextureHandle>) -> ZoetropeResult<&GpuTexture> {
        match target {
            Some(handle) => self
                .textures
                .get(&handle.0)
                .ok_or_else(|| ZoetropeError::render("render target was destroyed")),
            None => self
                .output
                .as_ref()
                .ok_or_else(|| ZoetropeError::render("output surface has not been created")),
        }
    }

    fn ensure_vertex_capacity(&mut self, vertex_count: usize) {
        let needs_create = self
            .vertices
            .as_ref()
            .map(|v| v.capacity < vertex_count)
            .unwrap_or(true);
        if !needs_create {
            return;
        }
        let capacity = vertex_count.max(4096);
        let vec2 = (capacity * 2 * 4) as u64;
        let scalar = (capacity * 4) as u64;
        let make = |label: &str, size: u64| {
            self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        };
        self.vertices = Some(VertexBuffers {
            positions: make("zoetrope_positions", vec2),
            uvs: make("zoetrope_uvs", vec2),
            tex_indices: make("zoetrope_tex_indices", scalar),
            alphas: make("zoetrope_alphas", scalar),
            capacity,
        });
    }
}

impl GpuDriver for WgpuDriver {
    fn limits(&self) -> DriverLimits {
        self.limits
    }

    fn compile_program(
        &mut self,
        label: &str,
        vertex: &str,
        fragment: &str,
        texture_count: usize,
    ) -> ZoetropeResult<ProgramHandle> {
        let source = format!("{vertex}\n\n{fragment}");

        // Module and pipeline validation both land in this scope, so an
        // over-provisioned texture count fails here and the batcher can
        // retry with fewer slots.
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let shader = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });

        let mut entries = vec![wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
            count: None,
        }];
        for i in 0..texture_count {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: (i + 1) as u32,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    multisampled: false,
                    view_dimension: wgpu::TextureViewDimension::D2,
                    sample_type: wgpu::TextureSampleType::Float { filterable: true },
                },
                count: None,
            });
        }
        let texture_layout =
            self.device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some("zoetrope_texture_bgl"),
                    entries: &entries,
                });

        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("zoetrope_pipeline_layout"),
                bind_group_layouts: &[&self.uniform_layout, &texture_layout],
                push_constant_ranges: &[],
            });

        let vertex_buffers = [
            wgpu::VertexBufferLayout {
                array_stride: 8,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: &[wgpu::VertexAttribute {
                    format: wgpu::VertexFormat::Float32x2,
                    offset: 0,
                    shader_location: 0,
                }],
            },
            wgpu::VertexBufferLayout {
                array_stride: 8,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: &[wgpu::VertexAttribute {
                    format: wgpu::VertexFormat::Float32x2,
                    offset: 0,
                    shader_location: 1,
                }],
            },
            wgpu::VertexBufferLayout {
                array_stride: 4,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: &[wgpu::VertexAttribute {
                    format: wgpu::VertexFormat::Float32,
                    offset: 0,
                    shader_location: 2,
                }],
            },
            wgpu::VertexBufferLayout {
                array_stride: 4,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: &[wgpu::VertexAttribute {
                    format: wgpu::VertexFormat::Float32,
                    offset: 0,
                    shader_location: 3,
                }],
            },
        ];

        let pipeline = self
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(label),
                layout: Some(&pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &shader,
                    entry_point: Some("vs_main"),
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    buffers: &vertex_buffers,
                },
                fragment: Some(wgpu::FragmentState {
                    module: &shader,
                    entry_point: Some("fs_main"),
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: wgpu::TextureFormat::Rgba8Unorm,
                        blend: Some(wgpu::BlendState::PREMULTIPLIED_ALPHA_BLENDING),
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                }),
                primitive: wgpu::PrimitiveState::default(),
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            });

        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(ZoetropeError::render(format!(
                "program '{label}' failed to build: {err}"
            )));
        }

        let handle = ProgramHandle(self.programs.len() as u32);
        self.programs.push(Program {
            pipeline,
            texture_layout,
            texture_count,
        });
        Ok(handle)
    }

    fn create_texture(&mut self, width: u32, height: u32) -> ZoetropeResult<GpuTextureHandle> {
        self.check_dims(width, height)?;
        Ok(self.insert_texture(width, height, false))
    }

    fn create_render_target(
        &mut self,
        width: u32,
        height: u32,
    ) -> ZoetropeResult<GpuTextureHandle> {
        self.check_dims(width, height)?;
        Ok(self.insert_texture(width, height, true))
    }

    fn upload_pixels(
        &mut self,
        handle: GpuTextureHandle,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> ZoetropeResult<()> {
        let texture = self
            .textures
            .get(&handle.0)
            .ok_or_else(|| ZoetropeError::texture("upload to a destroyed texture"))?;
        if texture.width != width || texture.height != height {
            return Err(ZoetropeError::texture(format!(
                "upload {width}x{height} does not match texture {}x{}",
                texture.width, texture.height
            )));
        }
        let expected = (width as usize) * (height as usize) * 4;
        if pixels.len() != expected {
            return Err(ZoetropeError::texture(format!(
                "upload expected {expected} bytes, got {}",
                pixels.len()
            )));
        }

        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &texture.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            pixels,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(width * 4),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn destroy_texture(&mut self, handle: GpuTextureHandle) {
        if let Some(texture) = self.textures.remove(&handle.0) {
            texture.texture.destroy();
        }
    }

    fn set_viewport(&mut self, width: u32, height: u32) {
        self.viewport = (width, height);
    }

    fn bind_target(&mut self, target: Option<GpuTextureHandle>) {
        self.bound_target = target;
    }

    fn clear(&mut self, color: Rgba8Premul) -> ZoetropeResult<()> {
        if self.bound_target.is_none() {
            self.ensure_output()?;
        }
        let target = self.target_texture(self.bound_target)?;
        let clear = wgpu::Color {
            r: f64::from(color.r) / 255.0,
            g: f64::from(color.g) / 255.0,
            b: f64::from(color.b) / 255.0,
            a: f64::from(color.a) / 255.0,
        };

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("zoetrope_clear_encoder"),
            });
        {
            let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("zoetrope_clear_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &target.view,
                    resolve_target: None,
                    depth_slice: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(clear),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn draw(&mut self, upload: &BatchUpload<'_>) -> ZoetropeResult<()> {
        let program_index = upload.program.0 as usize;
        let texture_count = self
            .programs
            .get(program_index)
            .map(|p| p.texture_count)
            .ok_or_else(|| ZoetropeError::render("draw with an unknown program"))?;
        if upload.slots.len() != texture_count {
            return Err(ZoetropeError::render(format!(
                "batch bound {} textures for a {} slot program",
                upload.slots.len(),
                texture_count
            )));
        }
        if upload.vertex_count == 0 {
            return Ok(());
        }

        if self.bound_target.is_none() {
            self.ensure_output()?;
        }
        self.ensure_vertex_capacity(upload.vertex_count);

        let vertices = self
            .vertices
            .as_ref()
            .ok_or_else(|| ZoetropeError::render("vertex buffers missing"))?;
        self.queue
            .write_buffer(&vertices.positions, 0, bytemuck::cast_slice(upload.positions));
        self.queue
            .write_buffer(&vertices.uvs, 0, bytemuck::cast_slice(upload.uvs));
        self.queue.write_buffer(
            &vertices.tex_indices,
            0,
            bytemuck::cast_slice(upload.tex_indices),
        );
        self.queue
            .write_buffer(&vertices.alphas, 0, bytemuck::cast_slice(upload.alphas));
        self.queue
            .write_buffer(&self.uniform_buffer, 0, bytemuck::cast_slice(upload.projection));

        let program = &self.programs[program_index];
        let target = self.target_texture(self.bound_target)?;

        let mut slot_views = Vec::with_capacity(upload.slots.len());
        for handle in upload.slots {
            let texture = self
                .textures
                .get(&handle.0)
                .ok_or_else(|| ZoetropeError::render("batch slot holds a destroyed texture"))?;
            slot_views.push(&texture.view);
        }

        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: wgpu::BindingResource::Sampler(&self.sampler),
        }];
        for (i, view) in slot_views.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: (i + 1) as u32,
                resource: wgpu::BindingResource::TextureView(view),
            });
        }
        let texture_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("zoetrope_texture_bg"),
            layout: &program.texture_layout,
            entries: &entries,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("zoetrope_batch_encoder"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("zoetrope_batch_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &target.view,
                    resolve_target: None,
                    depth_slice: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&program.pipeline);
            pass.set_bind_group(0, &self.uniform_group, &[]);
            pass.set_bind_group(1, &texture_group, &[]);
            pass.set_vertex_buffer(0, vertices.positions.slice(..));
            pass.set_vertex_buffer(1, vertices.uvs.slice(..));
            pass.set_vertex_buffer(2, vertices.tex_indices.slice(..));
            pass.set_vertex_buffer(3, vertices.alphas.slice(..));
            pass.draw(0..upload.vertex_count as u32, 0..1);
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn read_pixels(
        &mut self,
        target: Option<GpuTextureHandle>,
        width: u32,
        height: u32,
    ) -> ZoetropeResult<Vec<u8>> {
        if target.is_none() {
            self.ensure_output()?;
        }
        let texture = self.target_texture(target)?;
        if texture.width < width || texture.height < height {
            return Err(ZoetropeError::render(format!(
                "read {width}x{height} exceeds target {}x{}",
                texture.width, texture.height
            )));
        }

        let bytes_per_row_unpadded = width
            .checked_mul(4)
            .ok_or_else(|| ZoetropeError::render("readback width overflow"))?;
        let bytes_per_row = align_to(bytes_per_row_unpadded, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
        let buffer_size = (bytes_per_row as u64)
            .checked_mul(u64::from(height))
            .ok_or_else(|| ZoetropeError::render("readback buffer size overflow"))?;

        let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("zoetrope_readback"),
            size: buffer_size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("zoetrope_readback_encoder"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &texture.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &readback,
                layout: wgpu::TexelCopyBufferLayout {
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
        self.queue.submit(Some(encoder.finish()));

        let buffer_slice = readback.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = tx.send(res);
        });
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|e| ZoetropeError::render(format!("wgpu poll failed: {e:?}")))?;
        rx.recv()
            .map_err(|_| ZoetropeError::render("readback channel closed"))?
            .map_err(|e| ZoetropeError::render(format!("readback map failed: {e:?}")))?;

        let mapped = buffer_slice.get_mapped_range();
        let row_bytes = (width as usize) * 4;
        let padded_row_bytes = bytes_per_row as usize;
        let mut out = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * padded_row_bytes;
            out.extend_from_slice(&mapped[start..start + row_bytes]);
        }
        drop(mapped);
        readback.unmap();

        Ok(out)
    }
}

fn align_to(value: u32, alignment: u32) -> u32 {
    let mask = alignment - 1;
    (value + mask) & !mask
}
