//! WGSL sources for the batch pipeline and the filter/cover passes.
//!
//! A program is a vertex half plus a fragment half; the driver joins the two
//! strings into one module, so the fragment halves lean on the `VertexOut`
//! struct declared by the vertex half. Entry points are `vs_main` and
//! `fs_main`.

/// Shared vertex stage. Four attribute buffers (position, uv, texture index,
/// alpha) and a projection matrix uniform at group 0, binding 0.
pub const BATCH_VERTEX: &str = r#"
struct Uniforms {
    projection: mat4x4<f32>,
};

@group(0) @binding(0) var<uniform> uniforms: Uniforms;

struct VertexIn {
    @location(0) position: vec2<f32>,
    @location(1) uv: vec2<f32>,
    @location(2) tex_index: f32,
    @location(3) alpha: f32,
};

struct VertexOut {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
    @location(1) tex_index: f32,
    @location(2) alpha: f32,
};

@vertex
fn vs_main(in: VertexIn) -> VertexOut {
    var out: VertexOut;
    out.position = uniforms.projection * vec4<f32>(in.position, 0.0, 1.0);
    out.uv = in.uv;
    out.tex_index = in.tex_index;
    out.alpha = in.alpha;
    return out;
}
"#;

/// Fragment template for the multi-texture batch. `{{textures}}` becomes one
/// binding declaration per slot, `{{alternates}}` the chain that picks the
/// slot by vertex texture index. Unmatched indices keep the magenta debug
/// color.
const BATCH_FRAGMENT_TEMPLATE: &str = r#"
{{textures}}
@fragment
fn fs_main(in: VertexOut) -> @location(0) vec4<f32> {
    var color = vec4<f32>(1.0, 0.0, 1.0, 1.0);
{{alternates}}
    return color * in.alpha;
}
"#;

/// Expand the batch fragment template for `texture_count` slots.
///
/// Sampling uses `textureSampleLevel` so the branch chain stays legal WGSL;
/// `textureSample` needs uniform control flow for its derivatives.
pub fn build_batch_fragment(texture_count: usize) -> String {
    let mut textures = String::from("@group(1) @binding(0) var batch_sampler: sampler;\n");
    for i in 0..texture_count {
        textures.push_str(&format!(
            "@group(1) @binding({}) var batch_texture_{i}: texture_2d<f32>;\n",
            i + 1
        ));
    }

    let mut alternates = String::new();
    for i in 0..texture_count {
        if i > 0 {
            alternates.push_str(" else ");
        } else {
            alternates.push_str("    ");
        }
        alternates.push_str(&format!(
            "if (in.tex_index < {i}.5) {{\n        color = textureSampleLevel(batch_texture_{i}, batch_sampler, in.uv, 0.0);\n    }}"
        ));
    }
    alternates.push('\n');

    BATCH_FRAGMENT_TEMPLATE
        .replace("{{textures}}", &textures)
        .replace("{{alternates}}", &alternates)
}

/// Wrap a filter body into a complete fragment half.
///
/// The body is the function body of `fs_main`: it must `return` a
/// premultiplied `vec4<f32>`, and it can read `in.uv` and `in.alpha` and
/// sample the previous pass through `cover_texture`/`cover_sampler`.
pub fn build_filter_fragment(body: &str) -> String {
    format!(
        r#"
@group(1) @binding(0) var cover_sampler: sampler;
@group(1) @binding(1) var cover_texture: texture_2d<f32>;

@fragment
fn fs_main(in: VertexOut) -> @location(0) vec4<f32> {{
{body}
}}
"#
    )
}

/// Pass-through filter body used for the plain cover draw.
pub const COVER_FRAGMENT_BODY: &str =
    "    return textureSampleLevel(cover_texture, cover_sampler, in.uv, 0.0);";

pub fn cover_fragment() -> String {
    build_filter_fragment(COVER_FRAGMENT_BODY)
}

/// Column-major projection from pixel coordinates (origin top left) to clip
/// space, used when drawing to the output surface.
pub fn projection(width: u32, height: u32) -> [f32; 16] {
    let w = f64::from(width.max(1));
    let h = f64::from(height.max(1));
    [
        (2.0 / w) as f32,
        0.0,
        0.0,
        0.0,
        0.0,
        (-2.0 / h) as f32,
        0.0,
        0.0,
        0.0,
        0.0,
        1.0,
        0.0,
        -1.0,
        1.0,
        0.1,
        1.0,
    ]
}

/// Vertically flipped projection used when drawing into a render target, so
/// the target samples right side up with untouched texture coordinates.
pub fn projection_flipped(width: u32, height: u32) -> [f32; 16] {
    let w = f64::from(width.max(1));
    let h = f64::from(height.max(1));
    [
        (2.0 / w) as f32,
        0.0,
        0.0,
        0.0,
        0.0,
        (2.0 / h) as f32,
        0.0,
        0.0,
        0.0,
        0.0,
        1.0,
        0.0,
        -1.0,
        -1.0,
        0.1,
        1.0,
    ]
}
