// Shared GPU types: formats, resource states, descs, vertex layouts
//
// These are the plain-data vocabulary the rest of the crate speaks. Anything
// that ends up in a PSO cache key implements Hash/Eq field-wise.

use ash::vk;

use crate::handle::ShaderHandle;

/// Frames the CPU may record ahead of the GPU. Frame-local allocators
/// (upload pages, linear descriptor regions, ring reclaim) are sized by this.
pub const MAX_BUFFERED_FRAMES: usize = 3;

pub const CBV_TABLE_SIZE: u32 = 16;
pub const SRV_TABLE_SIZE: u32 = 16;
pub const UAV_TABLE_SIZE: u32 = 16;

pub const MAX_RENDER_TARGETS: usize = 8;
pub const MAX_VERTEX_STREAMS: usize = 8;
pub const MAX_VERTEX_ELEMENTS: usize = 16;

/// Texture/buffer element format.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum Format {
    #[default]
    Unknown,

    R8G8Unorm,
    R8G8Snorm,

    R8G8B8A8Unorm,
    R8G8B8A8UnormSrgb,
    R8G8B8A8Snorm,

    // Swapped-channel surface formats; desktop swapchains usually pick BGRA.
    B8G8R8A8Unorm,
    B8G8R8A8UnormSrgb,

    R10G10B10A2Unorm,

    R32Float,
    R32G32Float,
    R32G32B32Float,
    R32G32B32A32Float,

    R16Float,
    R16G16Float,
    R16G16B16A16Float,

    R16Uint,
    R32Uint,

    D32Float,
}

impl Format {
    pub fn size_in_bytes(self) -> u32 {
        match self {
            Format::Unknown => 0,
            Format::R8G8Unorm | Format::R8G8Snorm => 2,
            Format::R8G8B8A8Unorm | Format::R8G8B8A8UnormSrgb | Format::R8G8B8A8Snorm => 4,
            Format::B8G8R8A8Unorm | Format::B8G8R8A8UnormSrgb => 4,
            Format::R10G10B10A2Unorm => 4,
            Format::R32Float => 4,
            Format::R32G32Float => 8,
            Format::R32G32B32Float => 12,
            Format::R32G32B32A32Float => 16,
            Format::R16Float => 2,
            Format::R16G16Float => 4,
            Format::R16G16B16A16Float => 8,
            Format::R16Uint => 2,
            Format::R32Uint => 4,
            Format::D32Float => 4,
        }
    }

    pub fn is_depth(self) -> bool {
        matches!(self, Format::D32Float)
    }

    pub fn is_srgb(self) -> bool {
        matches!(self, Format::R8G8B8A8UnormSrgb | Format::B8G8R8A8UnormSrgb)
    }

    pub fn to_vk(self) -> vk::Format {
        match self {
            Format::Unknown => vk::Format::UNDEFINED,
            Format::R8G8Unorm => vk::Format::R8G8_UNORM,
            Format::R8G8Snorm => vk::Format::R8G8_SNORM,
            Format::R8G8B8A8Unorm => vk::Format::R8G8B8A8_UNORM,
            Format::R8G8B8A8UnormSrgb => vk::Format::R8G8B8A8_SRGB,
            Format::R8G8B8A8Snorm => vk::Format::R8G8B8A8_SNORM,
            Format::B8G8R8A8Unorm => vk::Format::B8G8R8A8_UNORM,
            Format::B8G8R8A8UnormSrgb => vk::Format::B8G8R8A8_SRGB,
            Format::R10G10B10A2Unorm => vk::Format::A2B10G10R10_UNORM_PACK32,
            Format::R32Float => vk::Format::R32_SFLOAT,
            Format::R32G32Float => vk::Format::R32G32_SFLOAT,
            Format::R32G32B32Float => vk::Format::R32G32B32_SFLOAT,
            Format::R32G32B32A32Float => vk::Format::R32G32B32A32_SFLOAT,
            Format::R16Float => vk::Format::R16_SFLOAT,
            Format::R16G16Float => vk::Format::R16G16_SFLOAT,
            Format::R16G16B16A16Float => vk::Format::R16G16B16A16_SFLOAT,
            Format::R16Uint => vk::Format::R16_UINT,
            Format::R32Uint => vk::Format::R32_UINT,
            Format::D32Float => vk::Format::D32_SFLOAT,
        }
    }

    /// Maps back the subset of vk formats a swapchain surface may report.
    pub fn from_vk_surface(format: vk::Format) -> Option<Format> {
        match format {
            vk::Format::R8G8B8A8_UNORM => Some(Format::R8G8B8A8Unorm),
            vk::Format::R8G8B8A8_SRGB => Some(Format::R8G8B8A8UnormSrgb),
            vk::Format::B8G8R8A8_UNORM => Some(Format::B8G8R8A8Unorm),
            vk::Format::B8G8R8A8_SRGB => Some(Format::B8G8R8A8UnormSrgb),
            _ => None,
        }
    }
}

/// Logical resource state driving barriers. Each state fixes the pipeline
/// stages, access mask and (for textures) image layout a resource is usable in.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum ResourceState {
    /// Never-used resources start here. Transitions out of `Unknown` discard
    /// prior contents.
    #[default]
    Unknown,
    Common,

    IndexBuffer,
    VertexBuffer,
    ConstantBuffer,

    RenderTarget,

    DepthStencilTarget,
    DepthStencilTargetReadOnly,

    ShaderResource,
    UnorderedAccess,

    CopyDest,
    CopySrc,

    IndirectArg,

    Present,
}

/// Pipeline stage, access mask and image layout a [`ResourceState`] maps to.
#[derive(Clone, Copy, Debug)]
pub struct VkStateInfo {
    pub stage: vk::PipelineStageFlags,
    pub access: vk::AccessFlags,
    pub layout: vk::ImageLayout,
}

const SHADER_STAGES: vk::PipelineStageFlags = vk::PipelineStageFlags::from_raw(
    vk::PipelineStageFlags::VERTEX_SHADER.as_raw()
        | vk::PipelineStageFlags::FRAGMENT_SHADER.as_raw()
        | vk::PipelineStageFlags::COMPUTE_SHADER.as_raw(),
);

const DEPTH_STAGES: vk::PipelineStageFlags = vk::PipelineStageFlags::from_raw(
    vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS.as_raw()
        | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS.as_raw(),
);

impl ResourceState {
    pub fn to_vk(self) -> VkStateInfo {
        match self {
            ResourceState::Unknown => VkStateInfo {
                stage: vk::PipelineStageFlags::TOP_OF_PIPE,
                access: vk::AccessFlags::empty(),
                layout: vk::ImageLayout::UNDEFINED,
            },
            ResourceState::Common => VkStateInfo {
                stage: vk::PipelineStageFlags::ALL_COMMANDS,
                access: vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
                layout: vk::ImageLayout::GENERAL,
            },
            ResourceState::IndexBuffer => VkStateInfo {
                stage: vk::PipelineStageFlags::VERTEX_INPUT,
                access: vk::AccessFlags::INDEX_READ,
                layout: vk::ImageLayout::UNDEFINED,
            },
            ResourceState::VertexBuffer => VkStateInfo {
                stage: vk::PipelineStageFlags::VERTEX_INPUT,
                access: vk::AccessFlags::VERTEX_ATTRIBUTE_READ,
                layout: vk::ImageLayout::UNDEFINED,
            },
            ResourceState::ConstantBuffer => VkStateInfo {
                stage: SHADER_STAGES,
                access: vk::AccessFlags::UNIFORM_READ,
                layout: vk::ImageLayout::UNDEFINED,
            },
            ResourceState::RenderTarget => VkStateInfo {
                stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                access: vk::AccessFlags::COLOR_ATTACHMENT_READ
                    | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            },
            ResourceState::DepthStencilTarget => VkStateInfo {
                stage: DEPTH_STAGES,
                access: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            },
            ResourceState::DepthStencilTargetReadOnly => VkStateInfo {
                stage: DEPTH_STAGES,
                access: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ,
                layout: vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
            },
            ResourceState::ShaderResource => VkStateInfo {
                stage: SHADER_STAGES,
                access: vk::AccessFlags::SHADER_READ,
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            },
            ResourceState::UnorderedAccess => VkStateInfo {
                stage: SHADER_STAGES,
                access: vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
                layout: vk::ImageLayout::GENERAL,
            },
            ResourceState::CopyDest => VkStateInfo {
                stage: vk::PipelineStageFlags::TRANSFER,
                access: vk::AccessFlags::TRANSFER_WRITE,
                layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            },
            ResourceState::CopySrc => VkStateInfo {
                stage: vk::PipelineStageFlags::TRANSFER,
                access: vk::AccessFlags::TRANSFER_READ,
                layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            },
            ResourceState::IndirectArg => VkStateInfo {
                stage: vk::PipelineStageFlags::DRAW_INDIRECT,
                access: vk::AccessFlags::INDIRECT_COMMAND_READ,
                layout: vk::ImageLayout::UNDEFINED,
            },
            ResourceState::Present => VkStateInfo {
                stage: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                access: vk::AccessFlags::empty(),
                layout: vk::ImageLayout::PRESENT_SRC_KHR,
            },
        }
    }

    /// True when the state includes GPU writes. Write states always force a
    /// barrier even without a state change.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            ResourceState::Common
                | ResourceState::RenderTarget
                | ResourceState::DepthStencilTarget
                | ResourceState::UnorderedAccess
                | ResourceState::CopyDest
        )
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum ResourceType {
    #[default]
    Buffer,
    Texture1D,
    Texture2D,
    Texture3D,
    TextureCube,
}

impl ResourceType {
    pub fn is_texture(self) -> bool {
        !matches!(self, ResourceType::Buffer)
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
    pub struct BufferFlags: u32 {
        const VERTEX            = 0x1;
        const INDEX             = 0x2;
        const UNORDERED_ACCESS  = 0x4;
        const SHADER_RESOURCE   = 0x8;
        const CONSTANT          = 0x10;
        /// Backed by frame upload memory; must be rewritten each frame it is
        /// used and is never valid across frames.
        const TRANSIENT         = 0x20;
        /// CPU-updatable after creation.
        const DYNAMIC           = 0x40;
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
    pub struct TextureUsageFlags: u32 {
        const SHADER_RESOURCE   = 0x1;
        const UNORDERED_ACCESS  = 0x2;
        const RENDER_TARGET     = 0x4;
        const DEPTH_STENCIL     = 0x8;
    }
}

#[derive(Clone, Copy, Debug)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

impl Default for ClearValue {
    fn default() -> Self {
        ClearValue::Color([0.0; 4])
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BufferDesc {
    pub flags: BufferFlags,
    pub format: Format,
    pub size_in_bytes: u32,
    pub stride_in_bytes: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct TextureDesc {
    pub resource_type: ResourceType,
    pub format: Format,
    pub usage: TextureUsageFlags,

    pub width: u32,
    pub height: u32,
    pub depth: u32,

    pub mip_levels: u32,
    pub array_slices: u32,

    pub clear: ClearValue,
}

impl TextureDesc {
    pub fn tex_1d(width: u32, usage: TextureUsageFlags, format: Format) -> Self {
        Self {
            resource_type: ResourceType::Texture1D,
            format,
            usage,
            width,
            height: 1,
            depth: 1,
            mip_levels: 1,
            array_slices: 1,
            clear: ClearValue::default(),
        }
    }

    pub fn tex_2d(width: u32, height: u32, usage: TextureUsageFlags, format: Format) -> Self {
        Self {
            resource_type: ResourceType::Texture2D,
            format,
            usage,
            width,
            height,
            depth: 1,
            mip_levels: 1,
            array_slices: 1,
            clear: ClearValue::default(),
        }
    }

    pub fn tex_3d(
        width: u32,
        height: u32,
        depth: u32,
        usage: TextureUsageFlags,
        format: Format,
    ) -> Self {
        Self {
            resource_type: ResourceType::Texture3D,
            format,
            usage,
            width,
            height,
            depth,
            mip_levels: 1,
            array_slices: 1,
            clear: ClearValue::default(),
        }
    }

    pub fn tex_cube(width: u32, height: u32, usage: TextureUsageFlags, format: Format) -> Self {
        Self {
            resource_type: ResourceType::TextureCube,
            format,
            usage,
            width,
            height,
            depth: 1,
            mip_levels: 1,
            array_slices: 6,
            clear: ClearValue::default(),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ShaderType {
    Vertex,
    Pixel,
    Compute,
}

impl ShaderType {
    pub fn to_vk(self) -> vk::ShaderStageFlags {
        match self {
            ShaderType::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderType::Pixel => vk::ShaderStageFlags::FRAGMENT,
            ShaderType::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum VertexSemantic {
    Position,
    TexCoord,
    Normal,
    Tangent,
    Bitangent,
    Color,
}

/// One vertex attribute. `semantic` + `semantic_index` identify the shader
/// input location; `stream` picks the source vertex buffer binding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct VertexDeclEntry {
    pub format: Format,
    pub semantic: VertexSemantic,
    pub semantic_index: u8,
    pub stream: u8,
    pub is_instance_data: bool,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct VertexLayout {
    pub elements: Vec<VertexDeclEntry>,
}

impl VertexLayout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        mut self,
        format: Format,
        semantic: VertexSemantic,
        is_instance_data: bool,
    ) -> Self {
        self.add_entry(VertexDeclEntry {
            format,
            semantic,
            semantic_index: 0,
            stream: 0,
            is_instance_data,
        });
        self
    }

    pub fn add_entry(&mut self, entry: VertexDeclEntry) -> &mut Self {
        assert!((entry.stream as usize) < MAX_VERTEX_STREAMS);
        assert!(self.elements.len() < MAX_VERTEX_ELEMENTS);
        self.elements.push(entry);
        self
    }

    /// Byte stride of one stream (sum of its element sizes, packed in
    /// declaration order).
    pub fn stream_stride(&self, stream: u8) -> u32 {
        self.elements
            .iter()
            .filter(|e| e.stream == stream)
            .map(|e| e.format.size_in_bytes())
            .sum()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum PrimitiveType {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum FillMode {
    #[default]
    Solid,
    Wireframe,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum CullMode {
    None,
    Front,
    #[default]
    Back,
}

#[derive(Clone, Copy, Debug)]
pub struct RasterizerDesc {
    pub fill_mode: FillMode,
    pub cull_mode: CullMode,
    pub front_face_ccw: bool,
    pub depth_bias: f32,
    pub slope_scaled_depth_bias: f32,
}

impl Default for RasterizerDesc {
    fn default() -> Self {
        Self {
            fill_mode: FillMode::Solid,
            cull_mode: CullMode::Back,
            front_face_ccw: false,
            depth_bias: 0.0,
            slope_scaled_depth_bias: 0.0,
        }
    }
}

// Bias floats are compared and hashed by bit pattern so the desc can key the
// PSO cache.
impl PartialEq for RasterizerDesc {
    fn eq(&self, other: &Self) -> bool {
        self.fill_mode == other.fill_mode
            && self.cull_mode == other.cull_mode
            && self.front_face_ccw == other.front_face_ccw
            && self.depth_bias.to_bits() == other.depth_bias.to_bits()
            && self.slope_scaled_depth_bias.to_bits() == other.slope_scaled_depth_bias.to_bits()
    }
}

impl Eq for RasterizerDesc {}

impl std::hash::Hash for RasterizerDesc {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.fill_mode.hash(state);
        self.cull_mode.hash(state);
        self.front_face_ccw.hash(state);
        self.depth_bias.to_bits().hash(state);
        self.slope_scaled_depth_bias.to_bits().hash(state);
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ComparisonFn {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

impl ComparisonFn {
    pub fn to_vk(self) -> vk::CompareOp {
        match self {
            ComparisonFn::Never => vk::CompareOp::NEVER,
            ComparisonFn::Less => vk::CompareOp::LESS,
            ComparisonFn::Equal => vk::CompareOp::EQUAL,
            ComparisonFn::LessEqual => vk::CompareOp::LESS_OR_EQUAL,
            ComparisonFn::Greater => vk::CompareOp::GREATER,
            ComparisonFn::NotEqual => vk::CompareOp::NOT_EQUAL,
            ComparisonFn::GreaterEqual => vk::CompareOp::GREATER_OR_EQUAL,
            ComparisonFn::Always => vk::CompareOp::ALWAYS,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct DepthStencilDesc {
    pub depth_enable: bool,
    pub depth_write: bool,
    pub depth_fn: ComparisonFn,
    pub stencil_enable: bool,
}

impl Default for DepthStencilDesc {
    fn default() -> Self {
        Self {
            depth_enable: true,
            depth_write: true,
            depth_fn: ComparisonFn::Less,
            stencil_enable: false,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum BlendMode {
    Zero,
    One,
    SrcColor,
    InvSrcColor,
    SrcAlpha,
    InvSrcAlpha,
    DestAlpha,
    InvDestAlpha,
    DestColor,
    InvDestColor,
}

impl BlendMode {
    pub fn to_vk(self) -> vk::BlendFactor {
        match self {
            BlendMode::Zero => vk::BlendFactor::ZERO,
            BlendMode::One => vk::BlendFactor::ONE,
            BlendMode::SrcColor => vk::BlendFactor::SRC_COLOR,
            BlendMode::InvSrcColor => vk::BlendFactor::ONE_MINUS_SRC_COLOR,
            BlendMode::SrcAlpha => vk::BlendFactor::SRC_ALPHA,
            BlendMode::InvSrcAlpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            BlendMode::DestAlpha => vk::BlendFactor::DST_ALPHA,
            BlendMode::InvDestAlpha => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
            BlendMode::DestColor => vk::BlendFactor::DST_COLOR,
            BlendMode::InvDestColor => vk::BlendFactor::ONE_MINUS_DST_COLOR,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum BlendOp {
    Add,
    Sub,
    RevSub,
    Min,
    Max,
}

impl BlendOp {
    pub fn to_vk(self) -> vk::BlendOp {
        match self {
            BlendOp::Add => vk::BlendOp::ADD,
            BlendOp::Sub => vk::BlendOp::SUBTRACT,
            BlendOp::RevSub => vk::BlendOp::REVERSE_SUBTRACT,
            BlendOp::Min => vk::BlendOp::MIN,
            BlendOp::Max => vk::BlendOp::MAX,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct BlendDesc {
    pub blend_enable: bool,
    pub alpha_to_coverage: bool,

    pub src_blend: BlendMode,
    pub dest_blend: BlendMode,
    pub blend_op: BlendOp,

    pub src_alpha: BlendMode,
    pub dest_alpha: BlendMode,
    pub blend_op_alpha: BlendOp,
}

impl Default for BlendDesc {
    fn default() -> Self {
        // Opaque
        Self {
            blend_enable: false,
            alpha_to_coverage: false,
            src_blend: BlendMode::One,
            dest_blend: BlendMode::Zero,
            blend_op: BlendOp::Add,
            src_alpha: BlendMode::One,
            dest_alpha: BlendMode::Zero,
            blend_op_alpha: BlendOp::Add,
        }
    }
}

impl BlendDesc {
    pub fn alpha_blended() -> Self {
        Self {
            blend_enable: true,
            src_blend: BlendMode::SrcAlpha,
            dest_blend: BlendMode::InvSrcAlpha,
            src_alpha: BlendMode::One,
            dest_alpha: BlendMode::InvSrcAlpha,
            ..Self::default()
        }
    }

    pub fn additive() -> Self {
        Self {
            blend_enable: true,
            src_blend: BlendMode::One,
            dest_blend: BlendMode::One,
            src_alpha: BlendMode::One,
            dest_alpha: BlendMode::One,
            ..Self::default()
        }
    }
}

/// Full fixed-function + shader description of a graphics pipeline.
/// Field-wise Hash/Eq makes this the PSO-cache key directly.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct GraphicsPsoDesc {
    pub vs: ShaderHandle,
    pub ps: ShaderHandle,

    pub raster: RasterizerDesc,
    pub depth_stencil: DepthStencilDesc,
    pub blend: BlendDesc,
    pub vertex_layout: VertexLayout,
    pub prim_type: PrimitiveType,

    pub render_target_formats: [Format; MAX_RENDER_TARGETS],
    pub num_render_targets: u32,
    pub depth_format: Format,
}

impl Default for GraphicsPsoDesc {
    fn default() -> Self {
        Self {
            vs: ShaderHandle::INVALID,
            ps: ShaderHandle::INVALID,
            raster: RasterizerDesc::default(),
            depth_stencil: DepthStencilDesc::default(),
            blend: BlendDesc::default(),
            vertex_layout: VertexLayout::default(),
            prim_type: PrimitiveType::TriangleList,
            render_target_formats: [Format::Unknown; MAX_RENDER_TARGETS],
            num_render_targets: 1,
            depth_format: Format::Unknown,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ComputePsoDesc {
    pub cs: ShaderHandle,
}

#[derive(Clone, Copy, Debug)]
pub struct IndexedDrawArguments {
    pub indices_per_instance: u32,
    pub instance_count: u32,
    pub index_start: u32,
    pub base_vertex: i32,
    pub start_instance: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_sizes() {
        assert_eq!(Format::R8G8B8A8Unorm.size_in_bytes(), 4);
        assert_eq!(Format::R32G32B32Float.size_in_bytes(), 12);
        assert_eq!(Format::R16Uint.size_in_bytes(), 2);
        assert_eq!(Format::Unknown.size_in_bytes(), 0);
        assert!(Format::D32Float.is_depth());
        assert!(Format::R8G8B8A8UnormSrgb.is_srgb());
    }

    #[test]
    fn surface_formats_map_both_ways() {
        for f in [
            Format::R8G8B8A8Unorm,
            Format::R8G8B8A8UnormSrgb,
            Format::B8G8R8A8Unorm,
            Format::B8G8R8A8UnormSrgb,
        ] {
            assert_eq!(Format::from_vk_surface(f.to_vk()), Some(f));
        }
        assert!(Format::B8G8R8A8UnormSrgb.is_srgb());
        assert_eq!(
            Format::from_vk_surface(vk::Format::R5G6B5_UNORM_PACK16),
            None
        );
    }

    #[test]
    fn vertex_layout_strides() {
        let layout = VertexLayout::new()
            .add(Format::R32G32B32Float, VertexSemantic::Position, false)
            .add(Format::R32G32Float, VertexSemantic::TexCoord, false)
            .add(Format::R8G8B8A8Unorm, VertexSemantic::Color, false);
        assert_eq!(layout.stream_stride(0), 12 + 8 + 4);
        assert_eq!(layout.stream_stride(1), 0);
    }

    #[test]
    #[should_panic]
    fn vertex_layout_rejects_too_many_elements() {
        let mut layout = VertexLayout::new();
        for _ in 0..=MAX_VERTEX_ELEMENTS {
            layout.add_entry(VertexDeclEntry {
                format: Format::R32Float,
                semantic: VertexSemantic::TexCoord,
                semantic_index: 0,
                stream: 0,
                is_instance_data: false,
            });
        }
    }

    #[test]
    fn write_states_force_barriers() {
        assert!(ResourceState::UnorderedAccess.is_write());
        assert!(ResourceState::CopyDest.is_write());
        assert!(!ResourceState::ShaderResource.is_write());
        assert!(!ResourceState::VertexBuffer.is_write());
    }

    #[test]
    fn state_translation_is_consistent() {
        // Read-only states never carry write access.
        for state in [
            ResourceState::IndexBuffer,
            ResourceState::VertexBuffer,
            ResourceState::ConstantBuffer,
            ResourceState::ShaderResource,
            ResourceState::CopySrc,
            ResourceState::IndirectArg,
            ResourceState::Present,
        ] {
            let info = state.to_vk();
            assert!(
                !info.access.intersects(
                    vk::AccessFlags::SHADER_WRITE
                        | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                        | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
                        | vk::AccessFlags::TRANSFER_WRITE
                        | vk::AccessFlags::MEMORY_WRITE
                ),
                "{state:?} translated with write access"
            );
        }
        assert_eq!(
            ResourceState::Present.to_vk().layout,
            vk::ImageLayout::PRESENT_SRC_KHR
        );
    }

    #[test]
    fn pso_desc_hash_matches_field_equality() {
        use std::hash::{Hash, Hasher};

        let a = GraphicsPsoDesc::default();
        let mut b = GraphicsPsoDesc::default();
        assert_eq!(a, b);

        let hash = |d: &GraphicsPsoDesc| {
            let mut h = rustc_hash::FxHasher::default();
            d.hash(&mut h);
            h.finish()
        };
        assert_eq!(hash(&a), hash(&b));

        b.raster.depth_bias = 1.5;
        assert_ne!(a, b);
        assert_ne!(hash(&a), hash(&b));
    }
}
