use ndarray::{ArrayD, Slice};
use std::fmt;
use std::ops::Range;

use crate::error::{ExpandError, Result};
use crate::models::DataType;

/// Array values in their stored element type.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    Float32(ArrayD<f32>),
    Float64(ArrayD<f64>),
    Int32(ArrayD<i32>),
    Int64(ArrayD<i64>),
}

/// Apply `$body` to the typed array inside an `ArrayData`.
macro_rules! map_array {
    ($data:expr, $array:ident => $body:expr) => {
        match $data {
            ArrayData::Float32($array) => $body,
            ArrayData::Float64($array) => $body,
            ArrayData::Int32($array) => $body,
            ArrayData::Int64($array) => $body,
        }
    };
}

/// Run `$body` with `$T` bound to the Rust element type of `$dtype`.
macro_rules! with_element_type {
    ($dtype:expr, $T:ident => $body:expr) => {
        match $dtype {
            $crate::models::DataType::Float32 => {
                type $T = f32;
                $body
            }
            $crate::models::DataType::Float64 => {
                type $T = f64;
                $body
            }
            $crate::models::DataType::Int32 => {
                type $T = i32;
                $body
            }
            $crate::models::DataType::Int64 => {
                type $T = i64;
                $body
            }
        }
    };
}

pub(crate) use with_element_type;

/// Element types an `ArrayData` can hold.
pub trait Element: Copy + Send + Sync + PartialEq + fmt::Debug + 'static {
    const DTYPE: DataType;

    fn wrap(array: ArrayD<Self>) -> ArrayData;

    fn unwrap_ref(data: &ArrayData) -> Option<&ArrayD<Self>>;
}

macro_rules! impl_element {
    ($ty:ty, $variant:ident) => {
        impl Element for $ty {
            const DTYPE: DataType = DataType::$variant;

            fn wrap(array: ArrayD<Self>) -> ArrayData {
                ArrayData::$variant(array)
            }

            fn unwrap_ref(data: &ArrayData) -> Option<&ArrayD<Self>> {
                match data {
                    ArrayData::$variant(array) => Some(array),
                    _ => None,
                }
            }
        }
    };
}

impl_element!(f32, Float32);
impl_element!(f64, Float64);
impl_element!(i32, Int32);
impl_element!(i64, Int64);

impl<T: Element> From<ArrayD<T>> for ArrayData {
    fn from(array: ArrayD<T>) -> Self {
        T::wrap(array)
    }
}

impl ArrayData {
    pub fn dtype(&self) -> DataType {
        match self {
            ArrayData::Float32(_) => DataType::Float32,
            ArrayData::Float64(_) => DataType::Float64,
            ArrayData::Int32(_) => DataType::Int32,
            ArrayData::Int64(_) => DataType::Int64,
        }
    }

    pub fn shape(&self) -> &[usize] {
        map_array!(self, array => array.shape())
    }

    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    pub fn len(&self) -> usize {
        map_array!(self, array => array.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The typed array, if the element type is `T`.
    pub fn typed<T: Element>(&self) -> Option<&ArrayD<T>> {
        T::unwrap_ref(self)
    }

    /// Owned copy of `ranges` along each axis.
    pub fn slice_block(&self, ranges: &[Range<usize>]) -> Result<ArrayData> {
        let shape = self.shape();
        let in_bounds = ranges.len() == shape.len()
            && ranges
                .iter()
                .zip(shape)
                .all(|(r, &size)| r.start <= r.end && r.end <= size);
        if !in_bounds {
            return Err(ExpandError::config(format!(
                "Block {:?} is outside an array of shape {:?}",
                ranges, shape
            )));
        }

        Ok(map_array!(self, array => ArrayData::from(
            array
                .slice_each_axis(|ax| Slice::from(ranges[ax.axis.index()].clone()))
                .to_owned()
        )))
    }

    /// Values as integer labels. Float labels must be finite whole numbers.
    pub fn to_labels(&self, name: &str) -> Result<Vec<i64>> {
        match self {
            ArrayData::Int32(array) => Ok(array.iter().map(|&v| i64::from(v)).collect()),
            ArrayData::Int64(array) => Ok(array.iter().copied().collect()),
            ArrayData::Float32(array) => array
                .iter()
                .map(|&v| float_label(name, f64::from(v)))
                .collect(),
            ArrayData::Float64(array) => array.iter().map(|&v| float_label(name, v)).collect(),
        }
    }
}

fn float_label(name: &str, value: f64) -> Result<i64> {
    // i64::MAX as f64 rounds up to 2^63, so the bound is exclusive
    if !value.is_finite() || value.fract() != 0.0 || value.abs() >= i64::MAX as f64 {
        return Err(ExpandError::config(format!(
            "Coordinate '{}' has label {} that is not a whole number",
            name, value
        )));
    }
    Ok(value as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, Array2};

    #[test]
    fn test_element_type_follows_variant() {
        let data = ArrayData::from(arr1(&[1i64, 2, 3]).into_dyn());
        assert_eq!(data.dtype(), DataType::Int64);
        assert!(data.typed::<i64>().is_some());
        assert!(data.typed::<f64>().is_none());
    }

    #[test]
    fn test_slice_block_keeps_type() {
        let data = ArrayData::from(Array2::from_shape_fn((4, 3), |(i, j)| (i * 10 + j) as i32).into_dyn());
        let block = data.slice_block(&[1..3, 0..2]).unwrap();

        assert_eq!(block.shape(), &[2, 2]);
        assert_eq!(
            block.typed::<i32>().unwrap().iter().copied().collect::<Vec<_>>(),
            vec![10, 11, 20, 21]
        );
        assert!(data.slice_block(&[0..5, 0..3]).is_err());
        assert!(data.slice_block(&[0..1]).is_err());
    }

    #[test]
    fn test_integral_float_labels_accepted() {
        let data = ArrayData::from(arr1(&[1.0f64, 2.0, 366.0]).into_dyn());
        assert_eq!(data.to_labels("dayofyear").unwrap(), vec![1, 2, 366]);
    }

    #[test]
    fn test_fractional_and_nan_labels_rejected() {
        for bad in [1.5f64, f64::NAN, f64::INFINITY] {
            let data = ArrayData::from(arr1(&[1.0, bad]).into_dyn());
            assert!(matches!(
                data.to_labels("dayofyear"),
                Err(ExpandError::Configuration(ref m)) if m.contains("dayofyear")
            ));
        }

        let data = ArrayData::from(arr1(&[0.5f32]).into_dyn());
        assert!(data.to_labels("hour").is_err());
    }

    #[test]
    fn test_large_int64_labels_exact() {
        let big = (1i64 << 53) + 1;
        let data = ArrayData::from(arr1(&[big]).into_dyn());
        assert_eq!(data.to_labels("x").unwrap(), vec![big]);
    }
}
