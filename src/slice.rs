use ndarray::Array2;

use crate::header::{SeriesFields, SpatialInfo};

/// Raw samples of one plane as decoded from the file.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleBuffer {
    I16(Array2<i16>),
    I32(Array2<i32>),
    F32(Array2<f32>),
}

impl SampleBuffer {
    /// (rows, columns)
    pub fn dim(&self) -> (usize, usize) {
        match self {
            SampleBuffer::I16(data) => data.dim(),
            SampleBuffer::I32(data) => data.dim(),
            SampleBuffer::F32(data) => data.dim(),
        }
    }

    pub fn to_f32(&self) -> Array2<f32> {
        match self {
            SampleBuffer::I16(data) => data.mapv(f32::from),
            SampleBuffer::I32(data) => data.mapv(|v| v as f32),
            SampleBuffer::F32(data) => data.clone(),
        }
    }
}

/// One 2D sample plane and its placement.
#[derive(Debug, Clone)]
pub struct Slice {
    /// File path or other identifier of where the slice came from.
    pub source: String,
    pub spatial: SpatialInfo,
    pub rows: usize,
    pub columns: usize,
    pub samples: SampleBuffer,
    /// Position in the resolved order; never taken from the input.
    pub instance_index: usize,
    pub fields: SeriesFields,
}

impl Slice {
    pub fn new(source: impl Into<String>, spatial: SpatialInfo, samples: SampleBuffer) -> Self {
        let (rows, columns) = samples.dim();
        Self {
            source: source.into(),
            spatial,
            rows,
            columns,
            samples,
            instance_index: 0,
            fields: SeriesFields::default(),
        }
    }

    pub fn with_fields(mut self, fields: SeriesFields) -> Self {
        self.fields = fields;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn integer_samples_widen_to_float() {
        let buffer = SampleBuffer::I16(array![[-1024, 0], [1, 3071]]);
        assert_eq!(buffer.dim(), (2, 2));
        assert_eq!(buffer.to_f32(), array![[-1024.0, 0.0], [1.0, 3071.0]]);
    }
}
