//! Programs the engine itself dispatches: layout conversions, slice materialization and
//! float encoding for readback.

use std::fmt::Write;

use itertools::Itertools;

use crate::{
    layout::{TextureUsage, batch_dim, rows_cols},
    shader::{GpgpuProgram, coords::component},
    shape::Shape,
};

/// The `[batch, rows, cols]` view of a shape, which has the same packed layout.
pub fn view_3d(shape: &[usize]) -> [usize; 3] {
    let (rows, cols) = rows_cols(shape);
    [batch_dim(shape), rows, cols]
}

/// Arguments of `get_x` at the output coordinates, with the innermost two axes replaced.
fn args(rank: usize, row: &str, col: &str) -> String {
    let mut args = (0..rank.saturating_sub(2))
        .map(|axis| component(rank, axis))
        .collect_vec();
    if rank >= 2 {
        args.push(row.to_string());
    }
    if rank >= 1 {
        args.push(col.to_string());
    }
    args.join(", ")
}

/// Innermost two coordinates of the output block, as `r` and `c`.
fn block_origin(rank: usize) -> String {
    let mut source = String::new();
    if rank == 0 {
        return source;
    }
    let _ = writeln!(source, "    let coords = get_output_coords();");
    match rank {
        1 => {
            let _ = writeln!(source, "    let r = 0;");
        }
        _ => {
            let _ = writeln!(source, "    let r = {};", component(rank, rank - 2));
        }
    }
    let _ = writeln!(source, "    let c = {};", component(rank, rank - 1));
    source
}

/// Turns unpacked data into 2×2 packed texels.
#[derive(Debug, Clone)]
pub struct PackProgram {
    shape: Shape,
}

impl PackProgram {
    pub fn new(shape: Shape) -> Self {
        Self { shape }
    }
}

impl GpgpuProgram for PackProgram {
    fn name(&self) -> &str {
        "pack"
    }

    fn variable_names(&self) -> Vec<&str> {
        vec!["x"]
    }

    fn output_shape(&self) -> Shape {
        self.shape.clone()
    }

    fn user_code(&self) -> String {
        let rank = self.shape.len();
        if rank == 0 {
            return "fn op_main() {\n    set_output(vec4<f32>(get_x(), 0.0, 0.0, 0.0));\n}\n".into();
        }

        let (rows, cols) = rows_cols(&self.shape);
        let mut source = "fn op_main() {\n".to_string();
        source.push_str(&block_origin(rank));
        let _ = writeln!(source, "    let right = c + 1 < {cols};");
        let _ = writeln!(source, "    let below = r + 1 < {rows};");
        let _ = writeln!(source, "    var result = vec4<f32>(0.0);");
        let _ = writeln!(source, "    result.x = get_x({});", args(rank, "r", "c"));
        let _ = writeln!(source, "    if (right) {{");
        let _ = writeln!(source, "        result.y = get_x({});", args(rank, "r", "c + 1"));
        let _ = writeln!(source, "    }}");
        if rank >= 2 {
            let _ = writeln!(source, "    if (below) {{");
            let _ = writeln!(source, "        result.z = get_x({});", args(rank, "r + 1", "c"));
            let _ = writeln!(source, "    }}");
            let _ = writeln!(source, "    if (below && right) {{");
            let _ = writeln!(
                source,
                "        result.w = get_x({});",
                args(rank, "r + 1", "c + 1")
            );
            let _ = writeln!(source, "    }}");
        }
        let _ = writeln!(source, "    set_output(result);");
        source.push_str("}\n");
        source
    }

    fn packed_output(&self) -> bool {
        true
    }
}

/// Turns packed texels back into one value per texel.
#[derive(Debug, Clone)]
pub struct UnpackProgram {
    shape: Shape,
}

impl UnpackProgram {
    pub fn new(shape: Shape) -> Self {
        Self { shape }
    }
}

impl GpgpuProgram for UnpackProgram {
    fn name(&self) -> &str {
        "unpack"
    }

    fn variable_names(&self) -> Vec<&str> {
        vec!["x"]
    }

    fn output_shape(&self) -> Shape {
        self.shape.clone()
    }

    fn user_code(&self) -> String {
        let rank = self.shape.len();
        let body = match rank {
            0 => "    set_output(get_x().x);\n".to_string(),
            1 => "    let c = get_output_coords();\n    set_output(get_channel_1d(get_x(c), c));\n"
                .to_string(),
            _ => {
                let mut body = block_origin(rank);
                let texel = format!("get_x({})", args(rank, "r", "c"));
                let _ = writeln!(body, "    set_output(get_channel({texel}, vec2<i32>(r, c)));");
                body
            }
        };
        format!("fn op_main() {{\n{body}}}\n")
    }

    fn packed_inputs(&self) -> bool {
        true
    }
}

/// Copies unpacked data, materializing slice views.
#[derive(Debug, Clone)]
pub struct CopyProgram {
    shape: Shape,
}

impl CopyProgram {
    pub fn new(shape: Shape) -> Self {
        Self { shape }
    }
}

impl GpgpuProgram for CopyProgram {
    fn name(&self) -> &str {
        "copy"
    }

    fn variable_names(&self) -> Vec<&str> {
        vec!["x"]
    }

    fn output_shape(&self) -> Shape {
        self.shape.clone()
    }

    fn user_code(&self) -> String {
        "fn op_main() {\n    set_output(get_x_at_out_coords());\n}\n".into()
    }

    fn enable_shape_uniforms(&self) -> bool {
        true
    }
}

/// Rearranges packed data between two 3-D views `[batch, rows, cols]` of the same size.
#[derive(Debug, Clone)]
pub struct ReshapePackedProgram {
    input: [usize; 3],
    output: [usize; 3],
}

impl ReshapePackedProgram {
    pub fn new(input: &[usize], output: &[usize]) -> Self {
        Self {
            input: view_3d(input),
            output: view_3d(output),
        }
    }

    /// The 3-D view of the input.
    pub fn input_shape(&self) -> Shape {
        self.input.into()
    }
}

impl GpgpuProgram for ReshapePackedProgram {
    fn name(&self) -> &str {
        "reshape_packed"
    }

    fn variable_names(&self) -> Vec<&str> {
        vec!["x"]
    }

    fn output_shape(&self) -> Shape {
        self.output.into()
    }

    fn user_code(&self) -> String {
        let [_, in_rows, in_cols] = self.input;
        let [_, rows, cols] = self.output;
        let lanes = [("x", "0", "0"), ("y", "0", "1"), ("z", "1", "0"), ("w", "1", "1")];

        let mut source = String::new();
        let _ = writeln!(source, "fn get_flat(flat: i32) -> f32 {{");
        let _ = writeln!(source, "    let b = flat / {};", in_rows * in_cols);
        let _ = writeln!(source, "    let r = flat / {in_cols} % {in_rows};");
        let _ = writeln!(source, "    let c = flat % {in_cols};");
        let _ = writeln!(source, "    return get_channel(get_x(b, r, c), vec2<i32>(r, c));");
        let _ = writeln!(source, "}}\n");

        let _ = writeln!(source, "fn op_main() {{");
        let _ = writeln!(source, "    let coords = get_output_coords();");
        let _ = writeln!(source, "    var result = vec4<f32>(0.0);");
        for (lane, dr, dc) in lanes {
            let _ = writeln!(source, "    {{");
            let _ = writeln!(source, "        let r = coords.y + {dr};");
            let _ = writeln!(source, "        let c = coords.z + {dc};");
            let _ = writeln!(source, "        if (r < {rows} && c < {cols}) {{");
            let _ = writeln!(
                source,
                "            result.{lane} = get_flat(coords.x * {} + r * {cols} + c);",
                rows * cols
            );
            let _ = writeln!(source, "        }}");
            let _ = writeln!(source, "    }}");
        }
        let _ = writeln!(source, "    set_output(result);");
        let _ = writeln!(source, "}}");
        source
    }

    fn packed_inputs(&self) -> bool {
        true
    }

    fn packed_output(&self) -> bool {
        true
    }
}

/// Writes the IEEE-754 bytes of every value into the four 8-bit channels of its texel,
/// least significant byte first.
#[derive(Debug, Clone)]
pub struct EncodeFloatProgram {
    shape: Shape,
}

impl EncodeFloatProgram {
    pub fn new(shape: Shape) -> Self {
        Self { shape }
    }
}

impl GpgpuProgram for EncodeFloatProgram {
    fn name(&self) -> &str {
        "encode_float"
    }

    fn variable_names(&self) -> Vec<&str> {
        vec!["x"]
    }

    fn output_shape(&self) -> Shape {
        self.shape.clone()
    }

    fn user_code(&self) -> String {
        // all four channels are written, so bypass the single channel `set_output`
        r"fn op_main() {
    let bits = bitcast<u32>(get_x_at_out_coords());
    let bytes = vec4<u32>(bits, bits >> 8u, bits >> 16u, bits >> 24u) & vec4<u32>(255u);
    out_color = vec4<f32>(bytes) / 255.0;
}
"
        .into()
    }

    fn output_usage(&self) -> TextureUsage {
        TextureUsage::Download
    }

    fn enable_shape_uniforms(&self) -> bool {
        true
    }
}
