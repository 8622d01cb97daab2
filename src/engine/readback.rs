//! Fenced reads of device data back to the host.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use flume::{Receiver, Sender, TryRecvError};
use itertools::Itertools;

use super::{
    CopyProgram, DataId, Engine, EngineError, EngineInner, Packing, TensorInfo, check_representable,
};
use crate::{
    device::{FenceId, PixelBufferId, TextureFormat},
    engine::EncodeFloatProgram,
    layout::{
        PhysicalFormat,
        texel::{decode_float, decode_float_bytes, decode_half, decode_packed, decode_unpacked},
    },
    num::{DataType, Values},
    platform::Instant,
    shape::Shape,
};

pub(super) type Reader = Sender<Result<Values, EngineError>>;

/// How the bytes of a pixel buffer turn into values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decode {
    /// Texels of a float texture; packed textures carry their logical shape.
    Texels {
        format: TextureFormat,
        packed: Option<Shape>,
        size: usize,
    },
    /// Floats encoded byte by byte into an RGBA8 texture.
    Bytes { size: usize },
}

impl Decode {
    pub fn decode(&self, bytes: &[u8]) -> Vec<f32> {
        match self {
            Decode::Texels {
                format,
                packed,
                size,
            } => {
                let texels = match format {
                    TextureFormat::R16Float | TextureFormat::Rgba16Float => decode_half(bytes),
                    TextureFormat::R32Float | TextureFormat::Rgba32Float => decode_float(bytes),
                    TextureFormat::Rgba8Unorm => bytes.iter().map(|&x| x as f32 / 255.0).collect(),
                };
                match packed {
                    Some(shape) => decode_packed(&texels, shape),
                    None => decode_unpacked(&texels, format.channels(), *size),
                }
            }
            Decode::Bytes { size } => decode_float_bytes(bytes, *size),
        }
    }
}

/// A read waiting on its fence.
#[derive(Debug)]
pub(super) struct PendingRead {
    pub id: DataId,
    pub dtype: DataType,
    pub fence: FenceId,
    pub pixels: PixelBufferId,
    pub decode: Decode,
    /// Buckets created only for this read.
    pub temporaries: Vec<DataId>,
}

impl EngineInner {
    /// Subscribes to the values of `id`, issuing a device read unless one is in flight.
    pub(super) fn read(&mut self, id: DataId) -> Receiver<Result<Values, EngineError>> {
        let (sender, receiver) = flume::unbounded();
        let data = match self.bucket_mut(id) {
            Ok(data) => data,
            Err(err) => {
                let _ = sender.send(Err(err));
                return receiver;
            }
        };
        if let Some(values) = &data.values {
            let _ = sender.send(Ok(values.clone()));
            return receiver;
        }
        if let Some(readers) = &mut data.readers {
            readers.push(sender);
            return receiver;
        }

        match self.issue_read(id) {
            Ok(read) => {
                log::debug!("read {id} behind {}", read.fence);
                self.pending.push_back(read);
                if let Ok(data) = self.bucket_mut(id) {
                    data.readers = Some(vec![sender]);
                }
            }
            Err(err) => {
                let _ = sender.send(Err(err));
            }
        }
        receiver
    }

    fn issue_read(&mut self, id: DataId) -> Result<PendingRead, EngineError> {
        let dtype = self.bucket(id)?.dtype;
        let mut temporaries = vec![];
        match self.encode_read(id, &mut temporaries) {
            Ok((fence, pixels, decode)) => Ok(PendingRead {
                id,
                dtype,
                fence,
                pixels,
                decode,
                temporaries,
            }),
            Err(err) => {
                self.dispose_all(temporaries);
                Err(err)
            }
        }
    }

    /// Copies the texture of `id` into a pixel buffer and fences it.
    fn encode_read(
        &mut self,
        id: DataId,
        temporaries: &mut Vec<DataId>,
    ) -> Result<(FenceId, PixelBufferId, Decode), EngineError> {
        let data = self.bucket(id)?;
        let mut info = TensorInfo {
            id,
            shape: data.shape.clone(),
            dtype: data.dtype,
        };
        if data.slice.is_some() {
            let program = CopyProgram::new(info.shape.clone());
            let packing = Packing::of(&program);
            let copy = self.run_program(&program, packing, &[info.clone()], info.dtype, &[])?;
            temporaries.push(copy.id);
            info = copy;
        }

        let size = info.size();
        let (texture, decode) = match self.context.capabilities().download_float {
            true => {
                let texture = self.bucket(info.id)?.texture;
                let texture = texture.ok_or(EngineError::UnknownData(info.id))?;
                let render_float32 = self.context.capabilities().render_float32;
                let format = PhysicalFormat::new(texture.usage, texture.packed, render_float32);
                let decode = Decode::Texels {
                    format: self.context.texture_format(format),
                    packed: texture.packed.then(|| info.shape.clone()),
                    size,
                };
                (texture.texture, decode)
            }
            false => {
                let program = EncodeFloatProgram::new(info.shape.clone());
                let packing = Packing::of(&program);
                let encoded = self.run_program(&program, packing, &[info.clone()], info.dtype, &[])?;
                temporaries.push(encoded.id);
                let texture = self.bucket(encoded.id)?.texture;
                let texture = texture.ok_or(EngineError::UnknownData(encoded.id))?;
                (texture.texture, Decode::Bytes { size })
            }
        };

        let pixels = self.context.read_pixels(texture)?;
        let fence = self.context.create_fence()?;
        Ok((fence, pixels, decode))
    }

    /// Resolves every read up to the last one whose fence has completed, in issuance order.
    pub(super) fn tick(&mut self) -> usize {
        let context = &self.context;
        let ready = self
            .pending
            .iter()
            .rposition(|read| context.poll_fence(read.fence).unwrap_or(true))
            .map_or(0, |index| index + 1);
        let reads = self.pending.drain(..ready).collect_vec();

        for read in reads {
            let start = Instant::now();
            self.context.delete_fence(read.fence);
            let result = self
                .context
                .map_pixels(read.pixels)
                .map_err(EngineError::from)
                .and_then(|bytes| {
                    let values = read.decode.decode(&bytes);
                    if self.numerics_checked() {
                        check_representable(&values)?;
                    }
                    Ok(Values::from_f32(read.dtype, &values))
                });
            self.timings.download += start.elapsed();
            self.timings.downloads += 1;

            self.dispose_all(read.temporaries);
            self.resolve(read.id, result);
        }
        ready
    }

    /// Hands a finished read to every reader and caches its values.
    fn resolve(&mut self, id: DataId, result: Result<Values, EngineError>) {
        let Some(Some(data)) = self.data.get_mut(id.0) else {
            return;
        };
        let readers = data.readers.take().unwrap_or_default();
        if let Ok(values) = &result {
            data.values = Some(values.clone());
        }
        for reader in readers {
            let _ = reader.send(result.clone());
        }
        if data.released {
            self.release(id);
        }
    }
}

/// Values of a read, once the device has produced them.
///
/// Polling drives [`Engine::tick`], so any executor works.
#[derive(Debug)]
pub struct ReadFuture {
    engine: Engine,
    receiver: Receiver<Result<Values, EngineError>>,
}

impl ReadFuture {
    pub(super) fn new(engine: Engine, receiver: Receiver<Result<Values, EngineError>>) -> Self {
        Self { engine, receiver }
    }
}

impl Future for ReadFuture {
    type Output = Result<Values, EngineError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Ok(mut inner) = self.engine.0.try_borrow_mut() {
            inner.tick();
        }
        match self.receiver.try_recv() {
            Ok(result) => Poll::Ready(result),
            Err(TryRecvError::Empty) => {
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            Err(TryRecvError::Disconnected) => Poll::Ready(Err(EngineError::ReadAbandoned)),
        }
    }
}

#[cfg(test)]
mod tests {
    use half::f16;

    use super::Decode;
    use crate::device::TextureFormat;

    #[test]
    fn test_decode() {
        let decode = Decode::Texels {
            format: TextureFormat::R16Float,
            packed: None,
            size: 3,
        };
        let bytes: Vec<u8> = [1.5f32, -2.0, 0.25, 0.0]
            .into_iter()
            .flat_map(|x| f16::from_f32(x).to_le_bytes())
            .collect();
        assert_eq!(decode.decode(&bytes), vec![1.5, -2.0, 0.25]);

        // a 2x1 tensor fills lanes 0 and 2 of one texel
        let decode = Decode::Texels {
            format: TextureFormat::Rgba32Float,
            packed: Some([2, 1].into()),
            size: 2,
        };
        let bytes: Vec<u8> = [1.0f32, 2.0, 3.0, 4.0]
            .into_iter()
            .flat_map(|x| x.to_le_bytes())
            .collect();
        assert_eq!(decode.decode(&bytes), vec![1.0, 3.0]);

        let decode = Decode::Bytes { size: 1 };
        let bytes = [(-7.5f32).to_le_bytes(), 9.0f32.to_le_bytes()].concat();
        assert_eq!(decode.decode(&bytes), vec![-7.5]);
    }
}
