use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Logical element type of a tensor. Every type is stored as floats on the device.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DataType {
    #[default]
    #[display("float32")]
    F32,
    #[display("int32")]
    I32,
    #[display("bool")]
    Bool,
}

/// Host-side tensor contents.
#[derive(Debug, Clone, PartialEq)]
pub enum Values {
    F32(Box<[f32]>),
    I32(Box<[i32]>),
    Bool(Box<[bool]>),
}

impl Values {
    #[inline]
    pub fn data_type(&self) -> DataType {
        match self {
            Values::F32(_) => DataType::F32,
            Values::I32(_) => DataType::I32,
            Values::Bool(_) => DataType::Bool,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        match self {
            Values::F32(x) => x.len(),
            Values::I32(x) => x.len(),
            Values::Bool(x) => x.len(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Widens the values to the float representation used in textures and uniforms.
    pub fn to_f32(&self) -> Vec<f32> {
        match self {
            Values::F32(x) => x.to_vec(),
            Values::I32(x) => x.iter().map(|&x| x as f32).collect(),
            Values::Bool(x) => x.iter().map(|&x| if x { 1.0 } else { 0.0 }).collect(),
        }
    }

    /// Converts raw floats read back from the device into values of `r#type`.
    pub fn from_f32(r#type: DataType, data: &[f32]) -> Self {
        match r#type {
            DataType::F32 => Values::F32(data.into()),
            DataType::I32 => Values::I32(data.iter().map(|x| x.round() as i32).collect()),
            DataType::Bool => Values::Bool(data.iter().map(|&x| x != 0.0).collect()),
        }
    }
}

impl From<Vec<f32>> for Values {
    fn from(value: Vec<f32>) -> Self {
        Self::F32(value.into())
    }
}

impl From<Vec<i32>> for Values {
    fn from(value: Vec<i32>) -> Self {
        Self::I32(value.into())
    }
}

impl From<Vec<bool>> for Values {
    fn from(value: Vec<bool>) -> Self {
        Self::Bool(value.into())
    }
}

/// Largest finite magnitude representable by a half float texture.
pub const F16_MAX: f32 = 65504.0;
/// Smallest positive subnormal representable by a half float texture.
pub const F16_MIN_POSITIVE: f32 = 5.96e-8;

/// Returns `false` if `x` would be lost when stored in a half float texture.
#[inline]
pub fn representable_in_f16(x: f32) -> bool {
    !x.is_finite() || x == 0.0 || (x.abs() >= F16_MIN_POSITIVE && x.abs() <= F16_MAX)
}

#[cfg(test)]
mod tests {
    use super::{DataType, Values, representable_in_f16};

    #[test]
    fn test_from_f32() {
        let data = [0.0, 1.0, -2.4, 2.6];
        assert_eq!(
            Values::from_f32(DataType::I32, &data),
            Values::from(vec![0, 1, -2, 3])
        );
        assert_eq!(
            Values::from_f32(DataType::Bool, &data),
            Values::from(vec![false, true, true, true])
        );
        assert_eq!(Values::from(vec![true, false]).to_f32(), vec![1.0, 0.0]);
    }

    #[test]
    fn test_f16_range() {
        assert!(representable_in_f16(0.0));
        assert!(representable_in_f16(65504.0));
        assert!(representable_in_f16(f32::NAN));
        assert!(!representable_in_f16(70000.0));
        assert!(!representable_in_f16(1e-9));
    }
}
