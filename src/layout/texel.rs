//! Host-side conversion between flat row-major values and texel data.

use half::f16;

use super::{packed_geometry, rows_cols};

/// Spreads `values` over `texels` texels of `channels` channels, one value per texel.
pub fn encode_unpacked(values: &[f32], channels: usize, texels: usize) -> Vec<f32> {
    let mut data = vec![0.0; texels * channels];
    for (index, &value) in values.iter().enumerate() {
        data[index * channels] = value;
    }
    data
}

/// Reads one value per texel from channel 0.
pub fn decode_unpacked(texels: &[f32], channels: usize, size: usize) -> Vec<f32> {
    texels.iter().step_by(channels).take(size).copied().collect()
}

/// Index of the texel and lane that hold `(batch, row, col)` of a packed tensor.
#[inline]
pub fn packed_location(shape: &[usize], batch: usize, row: usize, col: usize) -> (usize, usize) {
    let (_, row_texels, batch_texels) = packed_geometry(shape);
    let texel = batch * batch_texels + (row / 2) * row_texels + col / 2;
    let lane = (row % 2) * 2 + col % 2;
    (texel, lane)
}

/// Packs row-major `values` of `shape` into RGBA texels, `texels` of them.
pub fn encode_packed(values: &[f32], shape: &[usize], texels: usize) -> Vec<f32> {
    let (rows, cols) = rows_cols(shape);
    let mut data = vec![0.0; texels * 4];
    for (index, &value) in values.iter().enumerate() {
        let batch = index / (rows * cols);
        let row = index / cols % rows;
        let col = index % cols;
        let (texel, lane) = packed_location(shape, batch, row, col);
        data[texel * 4 + lane] = value;
    }
    data
}

/// Unpacks RGBA texels of a packed tensor of `shape` into row-major values.
pub fn decode_packed(texels: &[f32], shape: &[usize]) -> Vec<f32> {
    let (rows, cols) = rows_cols(shape);
    let size: usize = shape.iter().product();
    (0..size)
        .map(|index| {
            let batch = index / (rows * cols);
            let row = index / cols % rows;
            let col = index % cols;
            let (texel, lane) = packed_location(shape, batch, row, col);
            texels.get(texel * 4 + lane).copied().unwrap_or_default()
        })
        .collect()
}

/// Decodes floats written byte by byte into an RGBA8 texture, one float per texel.
pub fn decode_float_bytes(bytes: &[u8], size: usize) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .take(size)
        .map(|x| f32::from_le_bytes([x[0], x[1], x[2], x[3]]))
        .collect()
}

/// Widens half float channel data.
pub fn decode_half(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|x| f16::from_le_bytes([x[0], x[1]]).to_f32())
        .collect()
}

/// Reinterprets single float channel data.
pub fn decode_float(bytes: &[u8]) -> Vec<f32> {
    bytemuck::pod_collect_to_vec(bytes)
}
