use crate::error::ShapeError;

/// Dense `f32` buffer with a shape. The solver state and its derivatives are
/// carried in this type; the checkpoint layer treats the values as opaque.
#[derive(Debug, Clone, PartialEq)]
pub struct NumericBuffer {
    shape: Vec<usize>,
    values: Vec<f32>,
}

impl NumericBuffer {
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Result<Self, ShapeError> {
        let Some(expected) = element_count(&shape) else {
            return Err(ShapeError::Overflow(shape));
        };
        if expected != values.len() {
            return Err(ShapeError::Mismatch {
                shape,
                expected,
                actual: values.len(),
            });
        }
        Ok(NumericBuffer { shape, values })
    }

    /// One-dimensional buffer over `values`.
    pub fn from_vec(values: Vec<f32>) -> Self {
        NumericBuffer {
            shape: vec![values.len()],
            values,
        }
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        NumericBuffer {
            shape,
            values: vec![0.0; len],
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn same_shape(&self, other: &NumericBuffer) -> bool {
        self.shape == other.shape
    }

    /// `self - other`, elementwise.
    pub fn sub(&self, other: &NumericBuffer) -> NumericBuffer {
        self.zip_with(other, |a, b| a - b)
    }

    /// `self + alpha * other`, elementwise.
    pub fn add_scaled(&self, alpha: f32, other: &NumericBuffer) -> NumericBuffer {
        self.zip_with(other, |a, b| a + alpha * b)
    }

    pub fn scale(&self, alpha: f32) -> NumericBuffer {
        self.map(|v| v * alpha)
    }

    pub fn map(&self, mut f: impl FnMut(f32) -> f32) -> NumericBuffer {
        NumericBuffer {
            shape: self.shape.clone(),
            values: self.values.iter().map(|&v| f(v)).collect(),
        }
    }

    /// Linear combination `sum(coeff_i * buf_i)`. All terms must share `self`'s shape.
    pub fn combine(&self, terms: &[(f32, &NumericBuffer)]) -> NumericBuffer {
        let mut out = NumericBuffer::zeros(self.shape.clone());
        for (coeff, buf) in terms {
            for (o, v) in out.values.iter_mut().zip(buf.values.iter()) {
                *o += coeff * v;
            }
        }
        out
    }

    /// Little-endian byte image of the values.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.values.len() * 4);
        for v in &self.values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes
    }

    /// Rebuild a buffer from its shape and little-endian byte image.
    pub fn from_le_bytes(shape: Vec<usize>, bytes: &[u8]) -> Result<Self, ShapeError> {
        let Some(expected) = element_count(&shape) else {
            return Err(ShapeError::Overflow(shape));
        };
        if bytes.len() % 4 != 0 || bytes.len() / 4 != expected {
            return Err(ShapeError::Mismatch {
                shape,
                expected,
                actual: bytes.len() / 4,
            });
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(NumericBuffer { shape, values })
    }

    fn zip_with(&self, other: &NumericBuffer, f: impl Fn(f32, f32) -> f32) -> NumericBuffer {
        NumericBuffer {
            shape: self.shape.clone(),
            values: self
                .values
                .iter()
                .zip(other.values.iter())
                .map(|(&a, &b)| f(a, b))
                .collect(),
        }
    }
}

/// Number of elements in `shape`, or `None` if the product overflows.
fn element_count(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
}
