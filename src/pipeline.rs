// Pipeline-state objects
//
// PSOs are built against the single bindless pipeline layout and dynamic
// rendering, so a graphics pipeline needs only attachment formats, never a
// render pass. Viewport and scissor are dynamic state; everything else is
// baked from the desc.

use anyhow::{Context, Result};
use ash::vk;

use crate::types::{
    ComputePsoDesc, GraphicsPsoDesc, PrimitiveType, RasterizerDesc, VertexLayout,
    MAX_VERTEX_STREAMS,
};

#[derive(Clone)]
pub enum PsoDesc {
    Graphics(Box<GraphicsPsoDesc>),
    Compute(ComputePsoDesc),
}

impl PsoDesc {
    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        match self {
            PsoDesc::Graphics(_) => vk::PipelineBindPoint::GRAPHICS,
            PsoDesc::Compute(_) => vk::PipelineBindPoint::COMPUTE,
        }
    }
}

/// PSO registry record.
#[derive(Default)]
pub struct Pso {
    pub name: String,
    pub desc: Option<PsoDesc>,
    pub pipeline: vk::Pipeline,
    pub refcount: u32,
}

fn topology(prim: PrimitiveType) -> vk::PrimitiveTopology {
    match prim {
        PrimitiveType::PointList => vk::PrimitiveTopology::POINT_LIST,
        PrimitiveType::LineList => vk::PrimitiveTopology::LINE_LIST,
        PrimitiveType::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
        PrimitiveType::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
        PrimitiveType::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
    }
}

/// Expands a vertex layout into vk bindings and attributes. Attribute
/// locations follow declaration order; shader inputs must be declared the
/// same way. Per-stream offsets pack elements in declaration order.
pub fn vertex_input_descs(
    layout: &VertexLayout,
) -> (
    Vec<vk::VertexInputBindingDescription>,
    Vec<vk::VertexInputAttributeDescription>,
) {
    let mut stream_offsets = [0u32; MAX_VERTEX_STREAMS];
    let mut stream_rates = [None::<bool>; MAX_VERTEX_STREAMS];
    let mut attributes = Vec::with_capacity(layout.elements.len());

    for (location, elem) in layout.elements.iter().enumerate() {
        let stream = elem.stream as usize;
        attributes.push(
            vk::VertexInputAttributeDescription::builder()
                .location(location as u32)
                .binding(elem.stream as u32)
                .format(elem.format.to_vk())
                .offset(stream_offsets[stream])
                .build(),
        );
        stream_offsets[stream] += elem.format.size_in_bytes();

        // A stream is wholly per-vertex or wholly per-instance.
        match stream_rates[stream] {
            None => stream_rates[stream] = Some(elem.is_instance_data),
            Some(rate) => assert_eq!(
                rate, elem.is_instance_data,
                "stream {stream} mixes vertex and instance elements"
            ),
        }
    }

    let bindings = (0..MAX_VERTEX_STREAMS)
        .filter_map(|stream| {
            let instanced = stream_rates[stream]?;
            Some(
                vk::VertexInputBindingDescription::builder()
                    .binding(stream as u32)
                    .stride(stream_offsets[stream])
                    .input_rate(if instanced {
                        vk::VertexInputRate::INSTANCE
                    } else {
                        vk::VertexInputRate::VERTEX
                    })
                    .build(),
            )
        })
        .collect();

    (bindings, attributes)
}

fn rasterization_state(desc: &RasterizerDesc) -> vk::PipelineRasterizationStateCreateInfo {
    let bias_enabled = desc.depth_bias != 0.0 || desc.slope_scaled_depth_bias != 0.0;
    vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(match desc.fill_mode {
            crate::types::FillMode::Solid => vk::PolygonMode::FILL,
            crate::types::FillMode::Wireframe => vk::PolygonMode::LINE,
        })
        .line_width(1.0)
        .cull_mode(match desc.cull_mode {
            crate::types::CullMode::None => vk::CullModeFlags::NONE,
            crate::types::CullMode::Front => vk::CullModeFlags::FRONT,
            crate::types::CullMode::Back => vk::CullModeFlags::BACK,
        })
        .front_face(if desc.front_face_ccw {
            vk::FrontFace::COUNTER_CLOCKWISE
        } else {
            vk::FrontFace::CLOCKWISE
        })
        .depth_bias_enable(bias_enabled)
        .depth_bias_constant_factor(desc.depth_bias)
        .depth_bias_slope_factor(desc.slope_scaled_depth_bias)
        .build()
}

/// Builds a graphics pipeline from the desc and resolved shader modules.
pub fn create_graphics_pipeline(
    device: &ash::Device,
    layout: vk::PipelineLayout,
    desc: &GraphicsPsoDesc,
    vs_module: vk::ShaderModule,
    ps_module: vk::ShaderModule,
    name: &str,
) -> Result<vk::Pipeline> {
    let entry_point = std::ffi::CString::new("main").map_err(anyhow::Error::msg)?;

    let mut shader_stages = vec![vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::VERTEX)
        .module(vs_module)
        .name(&entry_point)
        .build()];
    // Depth-only passes run without a fragment shader.
    if ps_module != vk::ShaderModule::null() {
        shader_stages.push(
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(ps_module)
                .name(&entry_point)
                .build(),
        );
    }

    let (bindings, attributes) = vertex_input_descs(&desc.vertex_layout);
    let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(topology(desc.prim_type))
        .primitive_restart_enable(false);

    // Counts only; the actual rects are dynamic state.
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);

    let rasterizer = rasterization_state(&desc.raster);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1)
        .alpha_to_coverage_enable(desc.blend.alpha_to_coverage);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(desc.depth_stencil.depth_enable)
        .depth_write_enable(desc.depth_stencil.depth_write)
        .depth_compare_op(desc.depth_stencil.depth_fn.to_vk())
        .depth_bounds_test_enable(false)
        .stencil_test_enable(desc.depth_stencil.stencil_enable);

    let blend = &desc.blend;
    let attachment = if blend.blend_enable {
        vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(true)
            .src_color_blend_factor(blend.src_blend.to_vk())
            .dst_color_blend_factor(blend.dest_blend.to_vk())
            .color_blend_op(blend.blend_op.to_vk())
            .src_alpha_blend_factor(blend.src_alpha.to_vk())
            .dst_alpha_blend_factor(blend.dest_alpha.to_vk())
            .alpha_blend_op(blend.blend_op_alpha.to_vk())
            .build()
    } else {
        vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build()
    };
    let color_blend_attachments = vec![attachment; desc.num_render_targets as usize];
    let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    let color_formats: Vec<vk::Format> = desc.render_target_formats
        [..desc.num_render_targets as usize]
        .iter()
        .map(|f| f.to_vk())
        .collect();
    let mut rendering_info = vk::PipelineRenderingCreateInfo::builder()
        .color_attachment_formats(&color_formats)
        .depth_attachment_format(desc.depth_format.to_vk());

    let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input_info)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .push_next(&mut rendering_info);

    let pipelines = unsafe {
        device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info.build()], None)
            .map_err(|(_, e)| e)
            .with_context(|| format!("Failed to create graphics pipeline '{name}'"))?
    };
    Ok(pipelines[0])
}

pub fn create_compute_pipeline(
    device: &ash::Device,
    layout: vk::PipelineLayout,
    cs_module: vk::ShaderModule,
    name: &str,
) -> Result<vk::Pipeline> {
    let entry_point = std::ffi::CString::new("main").map_err(anyhow::Error::msg)?;
    let stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(cs_module)
        .name(&entry_point);
    let pipeline_info = vk::ComputePipelineCreateInfo::builder()
        .stage(stage.build())
        .layout(layout);

    let pipelines = unsafe {
        device
            .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info.build()], None)
            .map_err(|(_, e)| e)
            .with_context(|| format!("Failed to create compute pipeline '{name}'"))?
    };
    Ok(pipelines[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Format, VertexSemantic};

    #[test]
    fn vertex_input_packs_offsets_per_stream() {
        let layout = VertexLayout::new()
            .add(Format::R32G32B32Float, VertexSemantic::Position, false)
            .add(Format::R32G32Float, VertexSemantic::TexCoord, false);
        let (bindings, attrs) = vertex_input_descs(&layout);

        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].stride, 20);
        assert_eq!(bindings[0].input_rate, vk::VertexInputRate::VERTEX);

        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0].location, 0);
        assert_eq!(attrs[0].offset, 0);
        assert_eq!(attrs[1].location, 1);
        assert_eq!(attrs[1].offset, 12);
    }

    #[test]
    fn instance_stream_gets_instance_rate() {
        let mut layout = VertexLayout::new();
        layout.add_entry(crate::types::VertexDeclEntry {
            format: Format::R32G32B32Float,
            semantic: VertexSemantic::Position,
            semantic_index: 0,
            stream: 0,
            is_instance_data: false,
        });
        layout.add_entry(crate::types::VertexDeclEntry {
            format: Format::R32G32B32A32Float,
            semantic: VertexSemantic::TexCoord,
            semantic_index: 1,
            stream: 1,
            is_instance_data: true,
        });
        let (bindings, attrs) = vertex_input_descs(&layout);

        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].input_rate, vk::VertexInputRate::VERTEX);
        assert_eq!(bindings[1].input_rate, vk::VertexInputRate::INSTANCE);
        assert_eq!(attrs[1].binding, 1);
        assert_eq!(attrs[1].offset, 0);
    }

    #[test]
    #[should_panic(expected = "mixes vertex and instance")]
    fn mixed_rate_stream_panics() {
        let mut layout = VertexLayout::new();
        layout.add_entry(crate::types::VertexDeclEntry {
            format: Format::R32Float,
            semantic: VertexSemantic::Position,
            semantic_index: 0,
            stream: 0,
            is_instance_data: false,
        });
        layout.add_entry(crate::types::VertexDeclEntry {
            format: Format::R32Float,
            semantic: VertexSemantic::TexCoord,
            semantic_index: 0,
            stream: 0,
            is_instance_data: true,
        });
        let _ = vertex_input_descs(&layout);
    }

    #[test]
    fn empty_layout_has_no_bindings() {
        let (bindings, attrs) = vertex_input_descs(&VertexLayout::new());
        assert!(bindings.is_empty());
        assert!(attrs.is_empty());
    }
}
