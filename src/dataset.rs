//! In-memory dataset of flattened data points
//!
//! Data points are stored as flat `f32` rows of `prod(input_dim)` values and
//! batched into `[n, D]` tensors. Rows can be read from a CSV file with one
//! data point per line.

use crate::error::{Result, RhvaeError};
use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::tensor::{Tensor, TensorData, backend::Backend};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// One flattened data point
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RhvaeItem {
    pub data: Vec<f32>,
}

/// Batch of data points, `[batch_size, D]`
#[derive(Debug, Clone)]
pub struct RhvaeBatch<B: Backend> {
    pub data: Tensor<B, 2>,
}

/// Simple dataset wrapper over rows of equal length
#[derive(Debug, Clone)]
pub struct RhvaeDataset {
    pub items: Vec<RhvaeItem>,
    input_size: usize,
}

impl RhvaeDataset {
    /// Build a dataset, checking that every row has `input_size` values.
    pub fn new(rows: Vec<Vec<f32>>, input_size: usize) -> Result<Self> {
        if input_size == 0 {
            return Err(RhvaeError::InvalidData(
                "data points must hold at least one value".to_string(),
            ));
        }
        for (index, row) in rows.iter().enumerate() {
            if row.len() != input_size {
                return Err(RhvaeError::InvalidData(format!(
                    "row {index} holds {} values, expected {input_size}",
                    row.len()
                )));
            }
            if row.iter().any(|v| !v.is_finite()) {
                return Err(RhvaeError::InvalidData(format!(
                    "row {index} holds non finite values"
                )));
            }
        }

        Ok(Self {
            items: rows.into_iter().map(|data| RhvaeItem { data }).collect(),
            input_size,
        })
    }

    /// Build a dataset from a `[n, D]` tensor.
    pub fn from_tensor<B: Backend>(data: Tensor<B, 2>) -> Result<Self> {
        let [n, size] = data.dims();
        let values = data
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|err| RhvaeError::InvalidData(format!("{err:?}")))?;
        let rows = (0..n)
            .map(|i| values[i * size..(i + 1) * size].to_vec())
            .collect();
        Self::new(rows, size)
    }

    /// Read a CSV file holding one data point per record.
    pub fn from_csv(path: impl AsRef<Path>, input_size: usize, has_headers: bool) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(has_headers)
            .from_path(path)
            .map_err(|err| RhvaeError::InvalidData(format!("{}: {err}", path.display())))?;

        let mut rows = Vec::new();
        for (index, record) in reader.records().enumerate() {
            let record = record.map_err(|err| RhvaeError::InvalidData(err.to_string()))?;
            let row = record
                .iter()
                .map(|field| {
                    field.trim().parse::<f32>().map_err(|err| {
                        RhvaeError::InvalidData(format!("record {index}: `{field}`: {err}"))
                    })
                })
                .collect::<Result<Vec<f32>>>()?;
            rows.push(row);
        }

        info!(path = %path.display(), rows = rows.len(), "loaded data points from CSV");
        Self::new(rows, input_size)
    }

    /// Number of values in a data point.
    pub fn input_size(&self) -> usize {
        self.input_size
    }
}

impl Dataset<RhvaeItem> for RhvaeDataset {
    fn get(&self, index: usize) -> Option<RhvaeItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// Batcher stacking items into a `[batch_size, D]` tensor
#[derive(Clone, Default)]
pub struct RhvaeBatcher<B: Backend> {
    _phantom: std::marker::PhantomData<B>,
}

impl<B: Backend> RhvaeBatcher<B> {
    pub fn new() -> Self {
        Self {
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<B: Backend> Batcher<B, RhvaeItem, RhvaeBatch<B>> for RhvaeBatcher<B> {
    fn batch(&self, items: Vec<RhvaeItem>, device: &B::Device) -> RhvaeBatch<B> {
        let batch_size = items.len();
        let input_size = items.first().map_or(0, |item| item.data.len());

        let mut values = Vec::with_capacity(batch_size * input_size);
        for item in items {
            values.extend(item.data);
        }

        let data = Tensor::from_data(TensorData::new(values, [batch_size, input_size]), device);
        RhvaeBatch { data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use std::io::Write;

    type TestBackend = NdArray;

    #[test]
    fn test_rejects_ragged_rows() {
        let result = RhvaeDataset::new(vec![vec![0.0, 1.0], vec![0.5]], 2);
        assert!(matches!(result, Err(RhvaeError::InvalidData(_))));

        let result = RhvaeDataset::new(vec![vec![0.0, f32::NAN]], 2);
        assert!(matches!(result, Err(RhvaeError::InvalidData(_))));
    }

    #[test]
    fn test_batcher_layout() {
        let device = Default::default();
        let dataset =
            RhvaeDataset::new(vec![vec![0.0, 0.1, 0.2], vec![1.0, 1.1, 1.2]], 3).unwrap();
        assert_eq!(dataset.len(), 2);

        let items = (0..dataset.len())
            .filter_map(|i| dataset.get(i))
            .collect::<Vec<_>>();
        let batch = RhvaeBatcher::<TestBackend>::new().batch(items, &device);

        assert_eq!(batch.data.dims(), [2, 3]);
        assert_eq!(
            batch.data.into_data().to_vec::<f32>().unwrap(),
            vec![0.0, 0.1, 0.2, 1.0, 1.1, 1.2]
        );
    }

    #[test]
    fn test_from_tensor() {
        let device = Default::default();
        let data = Tensor::<TestBackend, 2>::ones([4, 5], &device);
        let dataset = RhvaeDataset::from_tensor(data).unwrap();

        assert_eq!(dataset.len(), 4);
        assert_eq!(dataset.input_size(), 5);
        assert_eq!(dataset.get(3).unwrap().data, vec![1.0; 5]);
    }

    #[test]
    fn test_from_csv() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "p0,p1,p2,p3").unwrap();
        writeln!(file, "0,0.5,1,0.25").unwrap();
        writeln!(file, "1, 1, 0, 0").unwrap();

        let dataset = RhvaeDataset::from_csv(file.path(), 4, true).unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.get(0).unwrap().data, vec![0.0, 0.5, 1.0, 0.25]);

        assert!(RhvaeDataset::from_csv(file.path(), 3, true).is_err());
        // The header is not a number
        assert!(RhvaeDataset::from_csv(file.path(), 4, false).is_err());
    }
}
