//! Output coordinate functions, and the shape arithmetic shared with samplers.

use std::{fmt::Write, ops::Range};

use itertools::Itertools;

use super::ShaderError;
use crate::layout::PhysicalShape;

pub const MAX_RANK: usize = 6;

const COMPONENTS: [&str; MAX_RANK] = ["x", "y", "z", "w", "u", "v"];

/// Shape constants of one tensor in generated code: baked literals or uniform references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dims {
    Baked {
        shape: Vec<usize>,
        /// Texel dimensions of the texture.
        texels: PhysicalShape,
    },
    /// Read from the `<prefix>_shape` and `<prefix>_tex_shape` uniforms.
    Uniform { prefix: String, rank: usize },
}

impl Dims {
    pub fn baked(shape: &[usize], texels: PhysicalShape) -> Self {
        let shape = shape.to_vec();
        Self::Baked { shape, texels }
    }

    pub fn uniform(prefix: &str, rank: usize) -> Self {
        let prefix = prefix.to_string();
        Self::Uniform { prefix, rank }
    }

    pub fn rank(&self) -> usize {
        match self {
            Dims::Baked { shape, .. } => shape.len(),
            Dims::Uniform { rank, .. } => *rank,
        }
    }

    /// Expression of dimension `axis`.
    pub fn dim(&self, axis: usize) -> String {
        match self {
            Dims::Baked { shape, .. } => shape[axis].to_string(),
            Dims::Uniform { prefix, rank: 1 } => format!("u.{prefix}_shape"),
            Dims::Uniform { prefix, .. } => format!("u.{prefix}_shape[{axis}]"),
        }
    }

    /// Expression of the product of the dimensions in `range`; constant-folded when baked.
    pub fn product(&self, range: Range<usize>) -> String {
        match self {
            Dims::Baked { shape, .. } => shape[range].iter().product::<usize>().to_string(),
            Dims::Uniform { .. } if range.is_empty() => "1".into(),
            Dims::Uniform { .. } => format!("({})", range.map(|axis| self.dim(axis)).join(" * ")),
        }
    }

    /// Row-major stride of `axis`.
    #[inline]
    pub fn stride(&self, axis: usize) -> String {
        self.product(axis + 1..self.rank())
    }

    pub fn tex_rows(&self) -> String {
        match self {
            Dims::Baked { texels, .. } => texels.rows.to_string(),
            Dims::Uniform { prefix, .. } => format!("u.{prefix}_tex_shape[0]"),
        }
    }

    pub fn tex_cols(&self) -> String {
        match self {
            Dims::Baked { texels, .. } => texels.cols.to_string(),
            Dims::Uniform { prefix, .. } => format!("u.{prefix}_tex_shape[1]"),
        }
    }

    /// Baked texel dimensions, if known at compile time.
    pub fn baked_texels(&self) -> Option<PhysicalShape> {
        match self {
            Dims::Baked { texels, .. } => Some(*texels),
            Dims::Uniform { .. } => None,
        }
    }

    /// Texels per logical row pair of a packed layout.
    pub fn row_texels(&self) -> String {
        let rank = self.rank();
        match self {
            Dims::Baked { shape, .. } => match rank {
                0 => "1".into(),
                _ => shape[rank - 1].div_ceil(2).to_string(),
            },
            Dims::Uniform { .. } => format!("(({} + 1) / 2)", self.dim(rank - 1)),
        }
    }

    /// Texels per batch of a packed layout.
    pub fn batch_texels(&self) -> String {
        let rank = self.rank();
        match self {
            Dims::Baked { shape, .. } => {
                let rows = match rank {
                    0 | 1 => 1,
                    _ => shape[rank - 2],
                };
                let cols = shape.last().copied().unwrap_or(1);
                (rows.div_ceil(2) * cols.div_ceil(2)).to_string()
            }
            Dims::Uniform { .. } if rank < 2 => self.row_texels(),
            Dims::Uniform { .. } => {
                let rows = self.dim(rank - 2);
                format!("((({rows} + 1) / 2) * {})", self.row_texels())
            }
        }
    }
}

/// WGSL type of logical coordinates of `rank`.
pub fn coords_type(rank: usize) -> String {
    match rank {
        0 | 1 => "i32".into(),
        2..=4 => format!("vec{rank}<i32>"),
        _ => format!("ivec{rank}"),
    }
}

/// Expression for coordinate `axis` of the variable `coords` of `rank`.
pub fn component(rank: usize, axis: usize) -> String {
    match rank {
        1 => "coords".into(),
        _ => format!("coords.{}", COMPONENTS[axis]),
    }
}

/// Builds a coordinates value of `rank` from per-axis expressions.
pub fn construct(rank: usize, components: &[String]) -> String {
    match rank {
        0 => "0".into(),
        1 => components[0].clone(),
        2..=4 => format!("vec{rank}<i32>({})", components.iter().join(", ")),
        _ => format!("ivec{rank}({})", components.iter().join(", ")),
    }
}

/// Emits `get_output_coords()`, mapping the fragment position to the logical coordinates written.
///
/// Packed outputs yield the coordinates of the top-left element of the written 2×2 block.
pub fn output_coords(dims: &Dims, packed: bool) -> Result<String, ShaderError> {
    let rank = dims.rank();
    if rank > MAX_RANK {
        return Err(ShaderError::UnsupportedRank {
            name: "output".into(),
            rank,
        });
    }

    let ty = coords_type(rank);
    let mut source = format!("fn get_output_coords() -> {ty} {{\n");
    let body = match (rank, packed) {
        (0, _) => "    return 0;\n".into(),
        (_, false) => unpacked_body(dims),
        (_, true) => packed_body(dims),
    };
    source.push_str(&body);
    source.push_str("}\n");
    Ok(source)
}

fn unpacked_body(dims: &Dims) -> String {
    let rank = dims.rank();
    match (rank, dims.baked_texels()) {
        (1, Some(PhysicalShape { rows: 1, .. })) => return "    return i32(frag_coord.x);\n".into(),
        (1, Some(PhysicalShape { cols: 1, .. })) => return "    return i32(frag_coord.y);\n".into(),
        _ => {}
    }

    let mut source = String::new();
    let _ = writeln!(source, "    let rc = vec2<i32>(frag_coord.yx);");
    let _ = writeln!(source, "    let index = rc.x * {} + rc.y;", dims.tex_cols());
    if rank == 1 {
        let _ = writeln!(source, "    return index;");
        return source;
    }

    let _ = writeln!(source, "    var rem = index;");
    for axis in 0..rank - 1 {
        let stride = dims.stride(axis);
        let _ = writeln!(source, "    let d{axis} = rem / {stride};");
        let _ = writeln!(source, "    rem -= d{axis} * {stride};");
    }
    let _ = writeln!(source, "    let d{} = rem;", rank - 1);
    let components = (0..rank).map(|axis| format!("d{axis}")).collect_vec();
    let _ = writeln!(source, "    return {};", construct(rank, &components));
    source
}

fn packed_body(dims: &Dims) -> String {
    let rank = dims.rank();
    let row_texels = dims.row_texels();
    let batch_texels = dims.batch_texels();

    let mut source = String::new();
    let _ = writeln!(source, "    let rc = vec2<i32>(frag_coord.yx);");
    let _ = writeln!(source, "    let index = rc.x * {} + rc.y;", dims.tex_cols());
    let _ = writeln!(source, "    let b = index / {batch_texels};");
    let _ = writeln!(source, "    let rem = index - b * {batch_texels};");
    let _ = writeln!(source, "    let r = rem / {row_texels} * 2;");
    let _ = writeln!(source, "    let c = rem % {row_texels} * 2;");

    let batch = rank.saturating_sub(2);
    let mut components = vec![];
    if batch > 0 {
        let _ = writeln!(source, "    var brem = b;");
        for axis in 0..batch - 1 {
            let stride = dims.product(axis + 1..batch);
            let _ = writeln!(source, "    let b{axis} = brem / {stride};");
            let _ = writeln!(source, "    brem -= b{axis} * {stride};");
        }
        let _ = writeln!(source, "    let b{} = brem;", batch - 1);
        components.extend((0..batch).map(|axis| format!("b{axis}")));
    }
    if rank >= 2 {
        components.push("r".into());
    }
    components.push("c".into());
    let _ = writeln!(source, "    return {};", construct(rank, &components));
    source
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{Dims, component, construct, output_coords};
    use crate::{
        layout::{PhysicalShape, TextureLimits, packed_geometry, plan_layout, rows_cols, texel::packed_location},
        shader::{ShaderError, tests::eval},
        shape::{flat_index, unravel},
    };

    #[test]
    fn test_output_coords_match_layout() -> Result<(), Box<dyn Error>> {
        let shapes: [&[usize]; 8] = [
            &[],
            &[7],
            &[3, 5],
            &[2, 3, 5],
            &[3, 1, 1, 5],
            &[2, 1, 3, 4],
            &[2, 1, 2, 1, 3],
            &[1, 2, 1, 2, 3, 3],
        ];
        for (shape, packed) in shapes.into_iter().flat_map(|x| [(x, false), (x, true)]) {
            let rank = shape.len();
            let size: usize = shape.iter().product();
            // the small limit forces the near-square fallback
            for limits in [TextureLimits::new(4096), TextureLimits::new(6)] {
                let Ok(tex_shape) = plan_layout(shape, packed, limits) else {
                    continue;
                };
                let texels = tex_shape.texels(packed);
                let mut all = vec![Dims::baked(shape, texels)];
                if rank <= 4 {
                    all.push(Dims::uniform("out", rank));
                }
                for dims in all {
                    let source = output_coords(&dims, packed)?;
                    for (row, col) in (0..texels.rows).flat_map(|r| (0..texels.cols).map(move |c| (r, c))) {
                        let index = row * texels.cols + col;
                        let mut env = eval::uniforms("out", shape, texels);
                        env.insert("rc.x".into(), row as i64);
                        env.insert("rc.y".into(), col as i64);
                        env.insert("frag_coord.x".into(), col as i64);
                        env.insert("frag_coord.y".into(), row as i64);
                        let coords = eval::run(&source, "get_output_coords", &mut env)?;
                        let coords: Vec<usize> = coords.into_iter().map(|x| x as usize).collect();
                        if rank == 0 {
                            assert_eq!(coords, vec![0]);
                            continue;
                        }

                        let context = format!("{shape:?} packed {packed} {dims:?} at ({row}, {col})");
                        match packed {
                            false if index < size => assert_eq!(coords, unravel(shape, index), "{context}"),
                            false => {}
                            true => {
                                let (batch, _, batch_texels) = packed_geometry(shape);
                                if index >= batch * batch_texels {
                                    continue;
                                }
                                let (rows, cols) = rows_cols(shape);
                                let lead = rank.saturating_sub(2);
                                let b = flat_index(&shape[..lead], &coords[..lead]);
                                let (r, c) = match rank {
                                    1 => (0, coords[0]),
                                    _ => (coords[rank - 2], coords[rank - 1]),
                                };
                                assert!(r % 2 == 0 && c % 2 == 0 && r < rows && c < cols, "{context}");
                                assert_eq!(packed_location(shape, b, r, c), (index, 0), "{context}");
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_dims() {
        let dims = Dims::baked(&[2, 3, 4], PhysicalShape::new(6, 4));
        assert_eq!(dims.stride(0), "12");
        assert_eq!(dims.stride(2), "1");
        assert_eq!(dims.row_texels(), "2");
        assert_eq!(dims.batch_texels(), "4");

        let dims = Dims::uniform("x", 3);
        assert_eq!(dims.stride(0), "(u.x_shape[1] * u.x_shape[2])");
        assert_eq!(dims.stride(2), "1");
        assert_eq!(dims.tex_cols(), "u.x_tex_shape[1]");
        assert_eq!(Dims::uniform("x", 1).dim(0), "u.x_shape");
    }

    #[test]
    fn test_components() {
        assert_eq!(component(1, 0), "coords");
        assert_eq!(component(3, 2), "coords.z");
        assert_eq!(component(6, 5), "coords.v");
        let parts = ["a".to_string(), "b".to_string()];
        assert_eq!(construct(2, &parts), "vec2<i32>(a, b)");
    }

    #[test]
    fn test_output_coords() -> Result<(), ShaderError> {
        let source = output_coords(&Dims::baked(&[], PhysicalShape::new(1, 1)), false)?;
        assert!(source.contains("return 0;"));

        let source = output_coords(&Dims::baked(&[7], PhysicalShape::new(1, 7)), false)?;
        assert!(source.contains("return i32(frag_coord.x);"));

        let source = output_coords(&Dims::baked(&[3, 4], PhysicalShape::new(3, 4)), false)?;
        assert!(source.contains("let index = rc.x * 4 + rc.y;"));
        assert!(source.contains("return vec2<i32>(d0, d1);"));

        let source = output_coords(&Dims::baked(&[2, 2, 3, 5], PhysicalShape::new(6, 3)), true)?;
        assert!(source.contains("let b = index / 6;"));
        assert!(source.contains("return vec4<i32>(b0, b1, r, c);"));

        let dims = Dims::baked(&[1, 1, 1, 1, 1, 1, 1], PhysicalShape::new(1, 1));
        assert!(matches!(
            output_coords(&dims, false),
            Err(ShaderError::UnsupportedRank { rank: 7, .. })
        ));
        Ok(())
    }
}
