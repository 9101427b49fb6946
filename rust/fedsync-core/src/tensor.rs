//! Tensors and their transport encoding.
//!
//! A [`Weight`] is an n-dimensional array with a fixed element type. Before it
//! is sent over the wire it is converted into a [`SerializedWeight`], which
//! carries the element type by name, the shape and the raw little-endian
//! element bytes. Booleans are encoded as one byte per element.
//!
//! The coordinator never aggregates [`Weight`]s directly: it [`stack`]s the
//! serialized weight lists of all clients into one batched tensor per
//! parameter position and reduces those along the leading axis.

use std::{fmt, str::FromStr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors which can occur while converting or stacking tensors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unsupported data type: {0}")]
    UnsupportedDtype(String),
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("ragged update: update {index} does not match the layout of the first update ({reason})")]
    RaggedUpdate { index: usize, reason: String },
    #[error("cannot stack an empty list of updates")]
    EmptyStack,
}

/// The element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Float32,
    Int32,
    Bool,
}

impl DType {
    /// Number of bytes one element occupies on the wire.
    pub fn bytes_per_element(self) -> usize {
        match self {
            DType::Float32 | DType::Int32 => 4,
            DType::Bool => 1,
        }
    }

    /// The wire name of the data type.
    pub fn as_str(self) -> &'static str {
        match self {
            DType::Float32 => "float32",
            DType::Int32 => "int32",
            DType::Bool => "bool",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DType {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "float32" => Ok(DType::Float32),
            "int32" => Ok(DType::Int32),
            "bool" => Ok(DType::Bool),
            other => Err(CodecError::UnsupportedDtype(other.to_string())),
        }
    }
}

/// The flat, row-major elements of a tensor.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    Float32(Vec<f32>),
    Int32(Vec<i32>),
    Bool(Vec<bool>),
}

impl TensorData {
    pub fn dtype(&self) -> DType {
        match self {
            TensorData::Float32(_) => DType::Float32,
            TensorData::Int32(_) => DType::Int32,
            TensorData::Bool(_) => DType::Bool,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::Float32(v) => v.len(),
            TensorData::Int32(v) => v.len(),
            TensorData::Bool(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slice(&self, start: usize, end: usize) -> TensorData {
        match self {
            TensorData::Float32(v) => TensorData::Float32(v[start..end].to_vec()),
            TensorData::Int32(v) => TensorData::Int32(v[start..end].to_vec()),
            TensorData::Bool(v) => TensorData::Bool(v[start..end].to_vec()),
        }
    }

    fn extend_from(&mut self, other: &TensorData) -> Result<(), CodecError> {
        match (self, other) {
            (TensorData::Float32(a), TensorData::Float32(b)) => a.extend_from_slice(b),
            (TensorData::Int32(a), TensorData::Int32(b)) => a.extend_from_slice(b),
            (TensorData::Bool(a), TensorData::Bool(b)) => a.extend_from_slice(b),
            (a, b) => {
                return Err(CodecError::ShapeMismatch(format!(
                    "cannot concatenate {} and {} tensors",
                    a.dtype(),
                    b.dtype()
                )))
            }
        }
        Ok(())
    }
}

/// An n-dimensional array with a fixed element type.
#[derive(Debug, Clone, PartialEq)]
pub struct Weight {
    shape: Vec<usize>,
    data: TensorData,
}

fn num_elements(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1_usize, |acc, dim| acc.checked_mul(*dim))
}

impl Weight {
    /// Creates a new weight.
    ///
    /// # Errors
    /// Fails with [`CodecError::ShapeMismatch`] if the number of elements does
    /// not equal the product of the shape.
    pub fn new(shape: Vec<usize>, data: TensorData) -> Result<Self, CodecError> {
        match num_elements(&shape) {
            Some(n) if n == data.len() => Ok(Self { shape, data }),
            _ => Err(CodecError::ShapeMismatch(format!(
                "{} elements cannot form shape {:?}",
                data.len(),
                shape
            ))),
        }
    }

    /// Creates a new `float32` weight.
    pub fn from_f32(shape: Vec<usize>, values: Vec<f32>) -> Result<Self, CodecError> {
        Self::new(shape, TensorData::Float32(values))
    }

    /// Creates a weight of the given type from `float32` values, rounding
    /// integers and thresholding booleans at `0.5`.
    pub fn from_f32_as(
        dtype: DType,
        shape: Vec<usize>,
        values: Vec<f32>,
    ) -> Result<Self, CodecError> {
        let data = match dtype {
            DType::Float32 => TensorData::Float32(values),
            DType::Int32 => TensorData::Int32(values.iter().map(|v| v.round() as i32).collect()),
            DType::Bool => TensorData::Bool(values.iter().map(|v| *v >= 0.5).collect()),
        };
        Self::new(shape, data)
    }

    /// Creates a weight filled with zeros (or `false`).
    pub fn zeros(dtype: DType, shape: Vec<usize>) -> Result<Self, CodecError> {
        let n = num_elements(&shape)
            .ok_or_else(|| CodecError::ShapeMismatch(format!("shape {:?} overflows", shape)))?;
        let data = match dtype {
            DType::Float32 => TensorData::Float32(vec![0.; n]),
            DType::Int32 => TensorData::Int32(vec![0; n]),
            DType::Bool => TensorData::Bool(vec![false; n]),
        };
        Ok(Self { shape, data })
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Gets the elements if this is a `float32` weight.
    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::Float32(v) => Some(v),
            _ => None,
        }
    }

    /// Gets the elements mutably if this is a `float32` weight.
    pub fn as_f32_mut(&mut self) -> Option<&mut [f32]> {
        match &mut self.data {
            TensorData::Float32(v) => Some(v),
            _ => None,
        }
    }

    /// Copies the elements into a `float32` vector, whatever the element type.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match &self.data {
            TensorData::Float32(v) => v.clone(),
            TensorData::Int32(v) => v.iter().map(|x| *x as f32).collect(),
            TensorData::Bool(v) => v.iter().map(|x| if *x { 1. } else { 0. }).collect(),
        }
    }

    /// The size of the leading dimension. A scalar has no rows.
    pub fn num_rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// The shape of a single row.
    pub fn row_shape(&self) -> &[usize] {
        self.shape.get(1..).unwrap_or(&[])
    }

    fn row_len(&self) -> usize {
        num_elements(self.row_shape()).unwrap_or(0)
    }

    /// Copies the rows `start..end` into a new weight.
    ///
    /// # Errors
    /// Fails if the range is out of bounds.
    pub fn slice_rows(&self, start: usize, end: usize) -> Result<Weight, CodecError> {
        if start > end || end > self.num_rows() {
            return Err(CodecError::ShapeMismatch(format!(
                "rows {}..{} out of bounds for shape {:?}",
                start, end, self.shape
            )));
        }
        let row_len = self.row_len();
        let mut shape = self.shape.clone();
        shape[0] = end - start;
        Ok(Weight {
            shape,
            data: self.data.slice(start * row_len, end * row_len),
        })
    }

    /// Concatenates weights along their leading dimension.
    ///
    /// # Errors
    /// Fails if the list is empty or the parts disagree on element type or row
    /// shape.
    pub fn concat_rows(parts: &[Weight]) -> Result<Weight, CodecError> {
        let (first, rest) = parts
            .split_first()
            .ok_or_else(|| CodecError::ShapeMismatch("nothing to concatenate".to_string()))?;
        if first.shape.is_empty() {
            return Err(CodecError::ShapeMismatch(
                "cannot concatenate scalars".to_string(),
            ));
        }
        let mut out = first.clone();
        for part in rest {
            if part.row_shape() != first.row_shape() || part.shape.is_empty() {
                return Err(CodecError::ShapeMismatch(format!(
                    "cannot concatenate rows of shape {:?} and {:?}",
                    first.row_shape(),
                    part.row_shape()
                )));
            }
            out.data.extend_from(&part.data)?;
            out.shape[0] += part.num_rows();
        }
        Ok(out)
    }
}

/// The transport-safe form of a [`Weight`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedWeight {
    /// The wire name of the element type.
    pub dtype: String,
    pub shape: Vec<u64>,
    /// Little-endian element bytes.
    pub data: Bytes,
}

impl SerializedWeight {
    /// Creates a serialized weight from any owned byte container.
    pub fn new(dtype: impl Into<String>, shape: Vec<u64>, data: impl Into<Bytes>) -> Self {
        Self {
            dtype: dtype.into(),
            shape,
            data: data.into(),
        }
    }

    /// Creates a serialized weight by copying a borrowed byte slice.
    pub fn from_slice(dtype: impl Into<String>, shape: Vec<u64>, data: &[u8]) -> Self {
        Self::new(dtype, shape, Bytes::copy_from_slice(data))
    }
}

impl From<&Weight> for SerializedWeight {
    fn from(weight: &Weight) -> Self {
        serialize(weight)
    }
}

impl TryFrom<&SerializedWeight> for Weight {
    type Error = CodecError;

    fn try_from(serialized: &SerializedWeight) -> Result<Self, Self::Error> {
        deserialize(serialized)
    }
}

/// Serializes a weight into its transport form. The result owns a copy of the
/// elements.
pub fn serialize(weight: &Weight) -> SerializedWeight {
    let mut data = BytesMut::with_capacity(weight.dtype().bytes_per_element() * weight.len());
    match weight.data() {
        TensorData::Float32(v) => v.iter().for_each(|x| data.put_f32_le(*x)),
        TensorData::Int32(v) => v.iter().for_each(|x| data.put_i32_le(*x)),
        TensorData::Bool(v) => v.iter().for_each(|x| data.put_u8(*x as u8)),
    }
    SerializedWeight {
        dtype: weight.dtype().to_string(),
        shape: weight.shape().iter().map(|d| *d as u64).collect(),
        data: data.freeze(),
    }
}

/// Reconstructs a weight from its transport form.
///
/// # Errors
/// Fails with [`CodecError::UnsupportedDtype`] for an unknown element type and
/// with [`CodecError::ShapeMismatch`] if the payload length does not match the
/// shape.
pub fn deserialize(serialized: &SerializedWeight) -> Result<Weight, CodecError> {
    let dtype: DType = serialized.dtype.parse()?;
    let shape = serialized
        .shape
        .iter()
        .map(|d| usize::try_from(*d))
        .collect::<Result<Vec<usize>, _>>()
        .map_err(|_| {
            CodecError::ShapeMismatch(format!("shape {:?} overflows", serialized.shape))
        })?;
    let bytes: &[u8] = serialized.data.as_ref();
    let expected = num_elements(&shape).and_then(|n| n.checked_mul(dtype.bytes_per_element()));
    if expected != Some(bytes.len()) {
        return Err(CodecError::ShapeMismatch(format!(
            "{} bytes of {} cannot form shape {:?}",
            bytes.len(),
            dtype,
            shape
        )));
    }

    let n = bytes.len() / dtype.bytes_per_element();
    let mut buf = bytes;
    let data = match dtype {
        DType::Float32 => TensorData::Float32((0..n).map(|_| buf.get_f32_le()).collect()),
        DType::Int32 => TensorData::Int32((0..n).map(|_| buf.get_i32_le()).collect()),
        DType::Bool => TensorData::Bool((0..n).map(|_| buf.get_u8() != 0).collect()),
    };
    Ok(Weight { shape, data })
}

/// Serializes every weight of a weight set.
pub fn serialize_all(weights: &[Weight]) -> Vec<SerializedWeight> {
    weights.iter().map(serialize).collect()
}

/// Deserializes every weight of a weight set.
pub fn deserialize_all(weights: &[SerializedWeight]) -> Result<Vec<Weight>, CodecError> {
    weights.iter().map(deserialize).collect()
}

/// Stacks `K` weight lists into one weight per parameter position, each with a
/// new leading dimension of size `K`.
///
/// # Errors
/// Fails with [`CodecError::RaggedUpdate`] if the lists differ in length or in
/// the element type or shape at any position, and with
/// [`CodecError::EmptyStack`] if there is nothing to stack.
pub fn stack(updates: &[Vec<SerializedWeight>]) -> Result<Vec<SerializedWeight>, CodecError> {
    let first = updates.first().ok_or(CodecError::EmptyStack)?;
    for (index, update) in updates.iter().enumerate().skip(1) {
        if update.len() != first.len() {
            return Err(CodecError::RaggedUpdate {
                index,
                reason: format!("{} weights instead of {}", update.len(), first.len()),
            });
        }
        for (position, (a, b)) in first.iter().zip(update).enumerate() {
            if a.dtype != b.dtype || a.shape != b.shape {
                return Err(CodecError::RaggedUpdate {
                    index,
                    reason: format!(
                        "weight {} is {} {:?} instead of {} {:?}",
                        position, b.dtype, b.shape, a.dtype, a.shape
                    ),
                });
            }
        }
    }

    let k = updates.len() as u64;
    Ok((0..first.len())
        .map(|position| {
            let mut data = BytesMut::with_capacity(first[position].data.len() * updates.len());
            for update in updates {
                data.extend_from_slice(&update[position].data);
            }
            let mut shape = Vec::with_capacity(first[position].shape.len() + 1);
            shape.push(k);
            shape.extend_from_slice(&first[position].shape);
            SerializedWeight {
                dtype: first[position].dtype.clone(),
                shape,
                data: data.freeze(),
            }
        })
        .collect())
}
