//! Per-input sampling functions.

use std::fmt::Write;

use itertools::Itertools;

use super::{
    InputInfo, ShaderError,
    coords::{Dims, MAX_RANK, component},
};
use crate::shape::broadcast_dims;

/// Emits `get_<name>(...)`, `get_<name>_at_out_coords()` and their texel fetch helper.
/// The latter is only emitted when the input's rank does not exceed the output's.
pub fn sampler(input: &InputInfo, dims: &Dims, out_shape: &[usize]) -> Result<String, ShaderError> {
    let rank = input.shape.len();
    if rank > MAX_RANK {
        return Err(ShaderError::UnsupportedRank {
            name: input.name.clone(),
            rank,
        });
    }

    let mut source = match input.packed {
        false => unpacked(input, dims),
        true => packed(input, dims),
    };
    source.push('\n');
    source.push_str(&fetch(input, dims));
    if rank <= out_shape.len() {
        source.push('\n');
        source.push_str(&at_out_coords(input, out_shape));
    }
    Ok(source)
}

fn params(rank: usize) -> String {
    (0..rank).map(|axis| format!("d{axis}: i32")).join(", ")
}

fn unpacked(input: &InputInfo, dims: &Dims) -> String {
    let name = &input.name;
    let rank = input.shape.len();

    let mut index = (0..rank)
        .map(|axis| match axis + 1 == rank {
            true => format!("d{axis}"),
            false => format!("d{axis} * {}", dims.stride(axis)),
        })
        .collect_vec();
    if index.is_empty() {
        index.push("0".into());
    }
    if input.offset {
        index.push(format!("u.offset_{name}"));
    }

    let mut source = String::new();
    let _ = writeln!(source, "fn get_{name}({}) -> f32 {{", params(rank));
    let _ = writeln!(source, "    let index = {};", index.join(" + "));
    let _ = writeln!(source, "    return sample_{name}(index);");
    let _ = writeln!(source, "}}");
    source
}

fn packed(input: &InputInfo, dims: &Dims) -> String {
    let name = &input.name;
    let rank = input.shape.len();

    let mut source = String::new();
    let _ = writeln!(source, "fn get_{name}({}) -> vec4<f32> {{", params(rank));
    let index = match rank {
        0 => "0".to_string(),
        1 => "d0 / 2".to_string(),
        _ => {
            let (r, c) = (rank - 2, rank - 1);
            let row_texels = dims.row_texels();
            let batch_texels = dims.batch_texels();
            let batch = (0..r)
                .map(|axis| format!("d{axis} * {}", dims.product(axis + 1..r)))
                .collect_vec();
            let mut terms = vec![];
            if !batch.is_empty() {
                let _ = writeln!(source, "    let b = {};", batch.join(" + "));
                terms.push(format!("b * {batch_texels}"));
            }
            terms.push(format!("d{r} / 2 * {row_texels}"));
            terms.push(format!("d{c} / 2"));
            terms.join(" + ")
        }
    };
    let _ = writeln!(source, "    let index = {index};");
    let _ = writeln!(source, "    return sample_{name}(index);");
    let _ = writeln!(source, "}}");
    source
}

/// Reads the texel at a flat texel index.
fn fetch(input: &InputInfo, dims: &Dims) -> String {
    let name = &input.name;
    let (ty, lane) = match input.packed {
        true => ("vec4<f32>", ""),
        false => ("f32", ".x"),
    };

    let mut source = String::new();
    let _ = writeln!(source, "fn sample_{name}(index: i32) -> {ty} {{");
    if input.uniform {
        // bounded scan over the uniform array
        let len = input.shape.iter().product::<usize>().div_ceil(4).max(1);
        let _ = writeln!(source, "    for (var i = 0; i < {len}; i++) {{");
        let _ = writeln!(source, "        if (i == index / 4) {{");
        let _ = writeln!(source, "            let texel = u.{name}_values[i];");
        let _ = writeln!(source, "            switch (index % 4) {{");
        let _ = writeln!(source, "                case 0: {{ return texel.x; }}");
        let _ = writeln!(source, "                case 1: {{ return texel.y; }}");
        let _ = writeln!(source, "                case 2: {{ return texel.z; }}");
        let _ = writeln!(source, "                default: {{ return texel.w; }}");
        let _ = writeln!(source, "            }}");
        let _ = writeln!(source, "        }}");
        let _ = writeln!(source, "    }}");
        let _ = writeln!(source, "    return 0.0;");
        let _ = writeln!(source, "}}");
        return source;
    }

    let uv = match dims.baked_texels() {
        Some(texels) if texels.rows == 1 => "vec2<i32>(index, 0)".to_string(),
        Some(texels) if texels.cols == 1 => "vec2<i32>(0, index)".to_string(),
        _ => {
            let _ = writeln!(source, "    let cols = {};", dims.tex_cols());
            "vec2<i32>(index % cols, index / cols)".to_string()
        }
    };
    let _ = writeln!(source, "    return textureLoad(tex_{name}, {uv}, 0){lane};");
    let _ = writeln!(source, "}}");
    source
}

/// Samples the input at the output coordinates, aligning trailing dimensions and zeroing
/// broadcast ones.
fn at_out_coords(input: &InputInfo, out_shape: &[usize]) -> String {
    let name = &input.name;
    let rank = input.shape.len();
    let out_rank = out_shape.len();
    let diff = out_rank - rank;
    let broadcast = broadcast_dims(&input.shape, out_shape);

    let args = (0..rank)
        .map(|axis| match broadcast.contains(&axis) {
            true => "0".to_string(),
            false => component(out_rank, axis + diff),
        })
        .join(", ");

    let swizzle = match input.packed {
        false => "",
        true => swizzle(&input.shape, out_shape),
    };
    let ty = match input.packed {
        true => "vec4<f32>",
        false => "f32",
    };

    let mut source = String::new();
    let _ = writeln!(source, "fn get_{name}_at_out_coords() -> {ty} {{");
    if rank > 0 {
        let _ = writeln!(source, "    let coords = get_output_coords();");
    }
    let _ = writeln!(source, "    return get_{name}({args}){swizzle};");
    let _ = writeln!(source, "}}");
    source
}

/// Replicates lanes of a packed texel whose rows or columns are broadcast.
///
/// Depends only on the ranks and the broadcast dims, both part of the program key. A missing
/// axis of the input counts as broadcast whatever the output's extent along it.
fn swizzle(shape: &[usize], out_shape: &[usize]) -> &'static str {
    let rank = shape.len();
    let out_rank = out_shape.len();
    let broadcast = |axis_from_end: usize| match (
        rank.checked_sub(axis_from_end),
        out_rank.checked_sub(axis_from_end),
    ) {
        (Some(axis), Some(out)) => shape[axis] == 1 && out_shape[out] > 1,
        (None, Some(_)) => true,
        (_, None) => false,
    };
    match (rank, broadcast(2), broadcast(1)) {
        (0, _, _) => ".xxxx",
        (_, _, true) if rank == 1 || broadcast(2) => ".xxxx",
        (_, true, false) => ".xyxy",
        (_, false, true) => ".xxzz",
        _ => "",
    }
}
