//! Fixed parts of every program: the vertex stage, helpers, output plumbing and the entry point.

/// The vertex stage shared by every program. Passes the quad through untouched.
pub const VERTEX: &str = r"struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@vertex
fn vs_main(@location(0) position: vec3<f32>, @location(1) uv: vec2<f32>) -> VertexOutput {
    var output: VertexOutput;
    output.position = vec4<f32>(position, 1.0);
    output.uv = uv;
    return output;
}
";

const HELPERS: &str = r"struct ivec5 {
    x: i32,
    y: i32,
    z: i32,
    w: i32,
    u: i32,
}

struct ivec6 {
    x: i32,
    y: i32,
    z: i32,
    w: i32,
    u: i32,
    v: i32,
}

var<private> frag_coord: vec4<f32>;
var<private> out_color: vec4<f32>;

fn is_nan(x: f32) -> bool {
    return !(x < 0.0 || 0.0 < x || x == 0.0);
}

fn is_inf(x: f32) -> bool {
    return abs(x) == u.infinity_value;
}

fn round_half_even(x: f32) -> f32 {
    let base = floor(x);
    let frac = x - base;
    if (frac < 0.5) {
        return base;
    }
    if (frac > 0.5) {
        return base + 1.0;
    }
    if (base % 2.0 == 0.0) {
        return base;
    }
    return base + 1.0;
}

fn imod(x: i32, y: i32) -> i32 {
    return x - y * (x / y);
}
";

const CHANNEL: &str = r"fn get_channel(texel: vec4<f32>, rc: vec2<i32>) -> f32 {
    let parity = vec2<f32>(rc) % 2.0;
    if (parity.x < 0.5) {
        if (parity.y < 0.5) {
            return texel.x;
        }
        return texel.y;
    }
    if (parity.y < 0.5) {
        return texel.z;
    }
    return texel.w;
}

fn get_channel_1d(texel: vec4<f32>, c: i32) -> f32 {
    if (f32(c) % 2.0 < 0.5) {
        return texel.x;
    }
    return texel.y;
}
";

const SET_OUTPUT: &str = r"fn set_output(value: f32) {
    out_color = vec4<f32>(value, 0.0, 0.0, 0.0);
}
";

const SET_OUTPUT_PACKED: &str = r"fn set_output(value: vec4<f32>) {
    out_color = value;
}
";

pub const ENTRY: &str = r"@fragment
fn fs_main(@builtin(position) position: vec4<f32>) -> @location(0) vec4<f32> {
    frag_coord = position;
    op_main();
    return out_color;
}
";

/// Helpers, plus lane selection when anything is packed, plus `set_output` for the output layout.
pub fn prologue(packed_output: bool, any_packed: bool) -> String {
    let mut source = HELPERS.to_string();
    if any_packed {
        source.push('\n');
        source.push_str(CHANNEL);
    }
    source.push('\n');
    source.push_str(match packed_output {
        true => SET_OUTPUT_PACKED,
        false => SET_OUTPUT,
    });
    source
}
