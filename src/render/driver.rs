use crate::foundation::core::Rgba8Premul;
use crate::foundation::error::ZoetropeResult;

/// Driver-side texture object. Opaque to the batcher; only the driver knows
/// what the number refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GpuTextureHandle(pub u64);

/// Compiled shader program handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProgramHandle(pub u32);

/// Hard limits reported by the driver before any resources exist.
#[derive(Clone, Copy, Debug)]
pub struct DriverLimits {
    /// Largest width or height a texture may have.
    pub max_texture_size: u32,
    /// Number of textures one draw can sample from.
    pub max_texture_slots: usize,
}

/// One batch worth of vertex data, handed to the driver by slice so the
/// batcher's buffers are reused across draws.
///
/// All four attribute slices cover the same `vertex_count` vertices:
/// `positions` and `uvs` hold two floats per vertex, `tex_indices` and
/// `alphas` one. `slots[i]` is the texture sampled by vertices whose
/// `tex_indices` value rounds to `i`; the slice length always equals the
/// texture count the program was compiled with.
#[derive(Debug)]
pub struct BatchUpload<'a> {
    pub positions: &'a [f32],
    pub uvs: &'a [f32],
    pub tex_indices: &'a [f32],
    pub alphas: &'a [f32],
    pub vertex_count: usize,
    pub slots: &'a [GpuTextureHandle],
    pub projection: &'a [f32; 16],
    pub program: ProgramHandle,
}

/// Abstraction over the GPU API the batcher draws through.
///
/// The batcher owns all policy (slot assignment, batching, caches); the
/// driver only creates resources and replays uploads and draws. State set by
/// [`bind_target`](GpuDriver::bind_target) and
/// [`set_viewport`](GpuDriver::set_viewport) persists until changed.
pub trait GpuDriver {
    fn limits(&self) -> DriverLimits;

    /// Compile a program from WGSL vertex and fragment halves. The driver
    /// joins the halves into one module (entry points `vs_main`/`fs_main`).
    /// `texture_count` is the number of sampled textures the fragment half
    /// declares, which the driver needs to lay out bindings up front.
    fn compile_program(
        &mut self,
        label: &str,
        vertex: &str,
        fragment: &str,
        texture_count: usize,
    ) -> ZoetropeResult<ProgramHandle>;

    fn create_texture(&mut self, width: u32, height: u32) -> ZoetropeResult<GpuTextureHandle>;

    /// Create a texture that can also be bound as a draw target.
    fn create_render_target(&mut self, width: u32, height: u32)
    -> ZoetropeResult<GpuTextureHandle>;

    /// Upload premultiplied RGBA8 pixels covering the whole texture.
    fn upload_pixels(
        &mut self,
        handle: GpuTextureHandle,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> ZoetropeResult<()>;

    fn destroy_texture(&mut self, handle: GpuTextureHandle);

    fn set_viewport(&mut self, width: u32, height: u32);

    /// Direct subsequent draws into a render target, or into the output
    /// surface when `None`.
    fn bind_target(&mut self, target: Option<GpuTextureHandle>);

    /// Clear the bound target to a flat color.
    fn clear(&mut self, color: Rgba8Premul) -> ZoetropeResult<()>;

    fn draw(&mut self, upload: &BatchUpload<'_>) -> ZoetropeResult<()>;

    /// Read the bound target (or the output surface when `None`) back as
    /// premultiplied RGBA8 rows.
    fn read_pixels(
        &mut self,
        target: Option<GpuTextureHandle>,
        width: u32,
        height: u32,
    ) -> ZoetropeResult<Vec<u8>>;
}
