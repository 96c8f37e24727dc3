use std::{borrow::Cow, num::NonZeroU64};

use wgpu::util::DeviceExt;

use crate::{
    config::{ErrorMetric, FilterMode},
    correlation::{Block, CandidateError, ScoreBuffer, ScoreError},
};

use super::{
    GpuContext, GpuError,
    surface::{COLOR_FORMAT, ComparisonSurface, DEPTH_FORMAT},
    texture::GpuTexture,
};

/// Binding names of the shader interface and their indices in group 0.
pub const BINDINGS: [(&str, u32); 4] = [
    ("params", 0),
    ("source_texture", 1),
    ("target_texture", 2),
    ("texture_sampler", 3),
];

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MatchParams {
    pub source_origin: [i32; 2],
    pub block_extent: [i32; 2],
    pub source_size: [i32; 2],
    pub target_size: [i32; 2],
    pub surface_size: [i32; 2],
    pub target_offset: [i32; 2],
    pub metric: u32,
    pub subpixel: i32,
    pub filter_mode: u32,
    _pad: u32,
}

/// How a scorer compares a source block with the shifted target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sampling {
    pub metric: ErrorMetric,
    pub filter_mode: FilterMode,
    /// Candidate offsets are counted in `1 / subpixel` rows.
    pub subpixel: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
pub struct QuadVertex {
    pub position: [f32; 2],
    pub texcoord: [f32; 2],
}

/// Full-surface triangle strip; texcoord (0, 0) is the top-left surface pixel.
const QUAD: [QuadVertex; 4] = [
    QuadVertex {
        position: [-1.0, 1.0],
        texcoord: [0.0, 0.0],
    },
    QuadVertex {
        position: [-1.0, -1.0],
        texcoord: [0.0, 1.0],
    },
    QuadVertex {
        position: [1.0, 1.0],
        texcoord: [1.0, 0.0],
    },
    QuadVertex {
        position: [1.0, -1.0],
        texcoord: [1.0, 1.0],
    },
];

pub struct MatchingProgram {
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    vertex_buffer: wgpu::Buffer,
}

/// Per-scorer bind group with a uniform buffer holding up to `capacity` candidates.
pub struct ProgramBindings {
    bind_group: wgpu::BindGroup,
    uniforms: wgpu::Buffer,
    stride: u64,
    capacity: usize,
    source_size: [i32; 2],
    target_size: [i32; 2],
    sampling: Sampling,
}

/// Fragment entry point writing errors in `color_format`.
fn fragment_entry_point(color_format: wgpu::TextureFormat) -> &'static str {
    if color_format == COLOR_FORMAT {
        "fs_main"
    } else {
        "fs_packed"
    }
}

impl MatchingProgram {
    /// `color_format` must be the format of the surfaces the program renders into, see
    /// `attachment_format`.
    pub fn new(
        context: &GpuContext,
        color_format: wgpu::TextureFormat,
    ) -> Result<MatchingProgram, GpuError> {
        context
            .capture(|device| {
                let shader_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some("matching"),
                    source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(include_str!(
                        "matching.wgsl"
                    ))),
                });
                let texture_entry = |binding| wgpu::BindGroupLayoutEntry {
                    binding,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                };
                let bind_group_layout =
                    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                        label: Some("matching"),
                        entries: &[
                            wgpu::BindGroupLayoutEntry {
                                binding: binding_index("params"),
                                visibility: wgpu::ShaderStages::FRAGMENT,
                                ty: wgpu::BindingType::Buffer {
                                    ty: wgpu::BufferBindingType::Uniform,
                                    has_dynamic_offset: true,
                                    min_binding_size: NonZeroU64::new(
                                        std::mem::size_of::<MatchParams>() as u64,
                                    ),
                                },
                                count: None,
                            },
                            texture_entry(binding_index("source_texture")),
                            texture_entry(binding_index("target_texture")),
                            wgpu::BindGroupLayoutEntry {
                                binding: binding_index("texture_sampler"),
                                visibility: wgpu::ShaderStages::FRAGMENT,
                                ty: wgpu::BindingType::Sampler(
                                    wgpu::SamplerBindingType::Filtering,
                                ),
                                count: None,
                            },
                        ],
                    });
                let pipeline_layout =
                    device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                        label: Some("matching"),
                        bind_group_layouts: &[&bind_group_layout],
                        push_constant_ranges: &[],
                    });
                let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                    label: Some("matching"),
                    layout: Some(&pipeline_layout),
                    vertex: wgpu::VertexState {
                        module: &shader_module,
                        entry_point: Some("vs_main"),
                        compilation_options: Default::default(),
                        buffers: &[wgpu::VertexBufferLayout {
                            array_stride: std::mem::size_of::<QuadVertex>() as wgpu::BufferAddress,
                            step_mode: wgpu::VertexStepMode::Vertex,
                            attributes: &wgpu::vertex_attr_array![
                                0 => Float32x2,
                                1 => Float32x2
                            ],
                        }],
                    },
                    primitive: wgpu::PrimitiveState {
                        topology: wgpu::PrimitiveTopology::TriangleStrip,
                        ..Default::default()
                    },
                    depth_stencil: Some(wgpu::DepthStencilState {
                        format: DEPTH_FORMAT,
                        depth_write_enabled: true,
                        depth_compare: wgpu::CompareFunction::Always,
                        stencil: wgpu::StencilState::default(),
                        bias: wgpu::DepthBiasState::default(),
                    }),
                    multisample: wgpu::MultisampleState::default(),
                    fragment: Some(wgpu::FragmentState {
                        module: &shader_module,
                        entry_point: Some(fragment_entry_point(color_format)),
                        compilation_options: Default::default(),
                        targets: &[Some(wgpu::ColorTargetState {
                            format: color_format,
                            blend: None,
                            write_mask: wgpu::ColorWrites::ALL,
                        })],
                    }),
                    multiview: None,
                    cache: None,
                });
                let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("quad"),
                    contents: bytemuck::cast_slice(&QUAD),
                    usage: wgpu::BufferUsages::VERTEX,
                });
                MatchingProgram {
                    pipeline,
                    bind_group_layout,
                    vertex_buffer,
                }
            })
            .map_err(GpuError::Program)
    }

    /// Binding index of a named shader resource.
    pub fn binding(name: &str) -> Option<u32> {
        BINDINGS
            .iter()
            .find(|(binding_name, _)| *binding_name == name)
            .map(|(_, index)| *index)
    }

    pub fn bind_textures(
        &self,
        context: &GpuContext,
        source: &GpuTexture,
        target: &GpuTexture,
        sampler: &wgpu::Sampler,
        sampling: Sampling,
        capacity: usize,
    ) -> Result<ProgramBindings, GpuError> {
        let capacity = capacity.max(1);
        let alignment = context.limits().min_uniform_buffer_offset_alignment as u64;
        let stride = (std::mem::size_of::<MatchParams>() as u64).div_ceil(alignment) * alignment;
        let (bind_group, uniforms) = context
            .capture(|device| {
                let uniforms = device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("match params"),
                    size: stride * capacity as u64,
                    usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                });
                let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("matching"),
                    layout: &self.bind_group_layout,
                    entries: &[
                        wgpu::BindGroupEntry {
                            binding: binding_index("params"),
                            resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                                buffer: &uniforms,
                                offset: 0,
                                size: NonZeroU64::new(std::mem::size_of::<MatchParams>() as u64),
                            }),
                        },
                        wgpu::BindGroupEntry {
                            binding: binding_index("source_texture"),
                            resource: wgpu::BindingResource::TextureView(source.view()),
                        },
                        wgpu::BindGroupEntry {
                            binding: binding_index("target_texture"),
                            resource: wgpu::BindingResource::TextureView(target.view()),
                        },
                        wgpu::BindGroupEntry {
                            binding: binding_index("texture_sampler"),
                            resource: wgpu::BindingResource::Sampler(sampler),
                        },
                    ],
                });
                (bind_group, uniforms)
            })
            .map_err(GpuError::Program)?;
        let size = |(width, height): (u32, u32)| [width as i32, height as i32];
        Ok(ProgramBindings {
            bind_group,
            uniforms,
            stride,
            capacity,
            source_size: size(source.dimensions()),
            target_size: size(target.dimensions()),
            sampling,
        })
    }

    pub fn score(
        &self,
        context: &GpuContext,
        surface: &mut ComparisonSurface,
        bindings: &ProgramBindings,
        block: &Block,
        offset: i32,
    ) -> Result<ScoreBuffer, ScoreError> {
        self.score_batch(context, surface, bindings, block, &[offset])
            .map_err(|err| err.source)?
            .pop()
            .ok_or(ScoreError::CandidateCount {
                expected: 1,
                actual: 0,
            })
    }

    /// Renders every candidate of a block, one submission per `capacity` candidates. A
    /// failure names the candidates of the submission that failed.
    pub fn score_batch(
        &self,
        context: &GpuContext,
        surface: &mut ComparisonSurface,
        bindings: &ProgramBindings,
        block: &Block,
        offsets: &[i32],
    ) -> Result<Vec<ScoreBuffer>, CandidateError> {
        surface
            .reserve_slots(context, bindings.capacity.min(offsets.len()))
            .map_err(|err| candidate_error(offsets, err.into()))?;
        let mut buffers = Vec::with_capacity(offsets.len());
        for batch in offsets.chunks(bindings.capacity) {
            let batch_buffers = self
                .render_batch(context, surface, bindings, block, batch)
                .map_err(|err| candidate_error(batch, err))?;
            buffers.extend(batch_buffers);
        }
        Ok(buffers)
    }

    fn render_batch(
        &self,
        context: &GpuContext,
        surface: &ComparisonSurface,
        bindings: &ProgramBindings,
        block: &Block,
        batch: &[i32],
    ) -> Result<Vec<ScoreBuffer>, ScoreError> {
        let mut uniforms = vec![0u8; bindings.stride as usize * batch.len()];
        for (i, &offset) in batch.iter().enumerate() {
            let params = bindings.params(surface.size(), block, offset);
            let start = i * bindings.stride as usize;
            uniforms[start..start + std::mem::size_of::<MatchParams>()]
                .copy_from_slice(bytemuck::bytes_of(&params));
        }
        context
            .capture(|_| {
                context
                    .queue()
                    .write_buffer(&bindings.uniforms, 0, &uniforms)
            })
            .map_err(ScoreError::Render)?;

        let mut encoder = context
            .device()
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("matching"),
            });
        for slot in 0..batch.len() {
            {
                let mut binding = surface.bind(&mut encoder);
                let pass = binding.pass();
                pass.set_pipeline(&self.pipeline);
                pass.set_bind_group(
                    0,
                    &bindings.bind_group,
                    &[(slot as u64 * bindings.stride) as u32],
                );
                pass.set_vertex_buffer(0, self.vertex_buffer.slice(..));
                pass.draw(0..QUAD.len() as u32, 0..1);
            }
            surface.copy_to_slot(&mut encoder, slot);
        }
        context
            .submit_and_wait(encoder)
            .map_err(ScoreError::Render)?;
        Ok(surface.read_slots(context, batch.len())?)
    }
}

fn candidate_error(batch: &[i32], source: ScoreError) -> CandidateError {
    CandidateError {
        first: batch.first().copied().unwrap_or_default(),
        last: batch.last().copied().unwrap_or_default(),
        source,
    }
}

impl ProgramBindings {
    fn params(&self, surface_size: u32, block: &Block, offset: i32) -> MatchParams {
        MatchParams {
            source_origin: [block.x as i32, block.y as i32],
            block_extent: [block.width as i32, block.height as i32],
            source_size: self.source_size,
            target_size: self.target_size,
            surface_size: [surface_size as i32; 2],
            target_offset: [0, offset],
            metric: self.sampling.metric.shader_id(),
            subpixel: self.sampling.subpixel.max(1) as i32,
            filter_mode: self.sampling.filter_mode.shader_id(),
            _pad: 0,
        }
    }
}

fn binding_index(name: &str) -> u32 {
    MatchingProgram::binding(name).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_match_shader_layout() {
        assert_eq!(std::mem::size_of::<MatchParams>(), 64);
        assert_eq!(std::mem::size_of::<QuadVertex>(), 16);
    }

    #[test]
    fn packed_format_uses_packing_entry_point() {
        assert_eq!(fragment_entry_point(COLOR_FORMAT), "fs_main");
        assert_eq!(
            fragment_entry_point(crate::correlation::gpu::PACKED_COLOR_FORMAT),
            "fs_packed"
        );
        let source = include_str!("matching.wgsl");
        assert!(source.contains("fn fs_main("));
        assert!(source.contains("fn fs_packed("));
    }

    #[test]
    fn candidate_errors_name_the_failing_submission() {
        let err = candidate_error(&[4, 5, 6], ScoreError::Render("lost".to_string()));
        assert_eq!((err.first, err.last), (4, 6));
    }

    #[test]
    fn bindings_are_named() {
        assert_eq!(MatchingProgram::binding("params"), Some(0));
        assert_eq!(MatchingProgram::binding("texture_sampler"), Some(3));
        assert_eq!(MatchingProgram::binding("missing"), None);
    }

    #[test]
    fn shader_declares_interface() {
        let source = include_str!("matching.wgsl");
        for (name, index) in BINDINGS {
            let declaration = format!("@binding({index}) var");
            let line = source
                .lines()
                .find(|line| line.contains(&declaration))
                .unwrap();
            assert!(line.contains(name), "{line} does not declare {name}");
        }
        assert!(source.contains("@location(0) vertex_position"));
        assert!(source.contains("@location(1) vertex_texcoord"));
        assert!(source.contains("@location(0) FragColor"));
    }
}
