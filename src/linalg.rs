//! Batched linear algebra on small symmetric positive definite matrices.
//!
//! Burn has no Cholesky, inverse or log-determinant, so these are assembled
//! entry by entry from differentiable tensor ops. Every routine works on a batch
//! `[n, d, d]` and is meant for latent-sized matrices (`d` in the tens at most).

use burn::tensor::{Tensor, TensorData, backend::Backend};

type Entries<B> = Vec<Vec<Tensor<B, 1>>>;

fn entries<B: Backend>(matrices: Tensor<B, 3>) -> Entries<B> {
    let [n, d, _] = matrices.dims();
    (0..d)
        .map(|i| {
            (0..d)
                .map(|j| {
                    matrices
                        .clone()
                        .slice([0..n, i..i + 1, j..j + 1])
                        .reshape([n])
                })
                .collect()
        })
        .collect()
}

fn assemble<B: Backend>(rows: Entries<B>) -> Tensor<B, 3> {
    let rows = rows
        .into_iter()
        .map(|row| Tensor::stack::<2>(row, 1))
        .collect();
    Tensor::stack::<3>(rows, 1)
}

/// Lower Cholesky factors as a triangular array of `[n]` entries.
fn cholesky_entries<B: Backend>(matrices: Tensor<B, 3>) -> Entries<B> {
    let a = entries(matrices);
    let d = a.len();
    let mut l: Entries<B> = Vec::with_capacity(d);

    for i in 0..d {
        let mut row: Vec<Tensor<B, 1>> = Vec::with_capacity(i + 1);
        for j in 0..=i {
            let mut acc = a[i][j].clone();
            for k in 0..j {
                let lj: &Tensor<B, 1> = if i == j { &row[k] } else { &l[j][k] };
                acc = acc - row[k].clone() * lj.clone();
            }
            let value = if i == j {
                acc.sqrt()
            } else {
                acc / l[j][j].clone()
            };
            row.push(value);
        }
        l.push(row);
    }
    l
}

fn pad_lower<B: Backend>(lower: Entries<B>, n: usize, device: &B::Device) -> Entries<B> {
    let d = lower.len();
    lower
        .into_iter()
        .map(|mut row| {
            row.extend((row.len()..d).map(|_| Tensor::zeros([n], device)));
            row
        })
        .collect()
}

/// Lower triangular `L` with `A = L L^T`.
pub fn cholesky<B: Backend>(matrices: Tensor<B, 3>) -> Tensor<B, 3> {
    let [n, _, _] = matrices.dims();
    let device = matrices.device();
    assemble(pad_lower(cholesky_entries(matrices), n, &device))
}

/// `log det A` for each matrix of the batch, shape `[n]`.
pub fn log_det<B: Backend>(matrices: Tensor<B, 3>) -> Tensor<B, 1> {
    let l = cholesky_entries(matrices);
    let diag: Vec<Tensor<B, 1>> = l
        .iter()
        .enumerate()
        .map(|(i, row)| row[i].clone().log())
        .collect();
    Tensor::stack::<2>(diag, 1).sum_dim(1).flatten::<1>(0, 1) * 2.0
}

/// `A^-1` through the Cholesky factor: `A^-1 = L^-T L^-1`.
pub fn inverse<B: Backend>(matrices: Tensor<B, 3>) -> Tensor<B, 3> {
    let [n, d, _] = matrices.dims();
    let device = matrices.device();
    let l = cholesky_entries(matrices);

    // Forward substitution for the lower triangular L^-1.
    let mut l_inv: Vec<Vec<Option<Tensor<B, 1>>>> = vec![vec![None; d]; d];
    for i in 0..d {
        let diag_inv = l[i][i].clone().recip();
        l_inv[i][i] = Some(diag_inv.clone());
        for j in 0..i {
            let mut acc: Option<Tensor<B, 1>> = None;
            for k in j..i {
                if let Some(inv_kj) = &l_inv[k][j] {
                    let term = l[i][k].clone() * inv_kj.clone();
                    acc = Some(match acc {
                        Some(sum) => sum + term,
                        None => term,
                    });
                }
            }
            l_inv[i][j] = acc.map(|sum| sum.neg() * diag_inv.clone());
        }
    }

    let rows = (0..d)
        .map(|i| {
            (0..d)
                .map(|j| {
                    (i.max(j)..d)
                        .filter_map(|k| match (&l_inv[k][i], &l_inv[k][j]) {
                            (Some(a), Some(b)) => Some(a.clone() * b.clone()),
                            _ => None,
                        })
                        .reduce(|sum, term| sum + term)
                        .unwrap_or_else(|| Tensor::zeros([n], &device))
                })
                .collect()
        })
        .collect();
    assemble(rows)
}

/// `[n, d, d] x [n, d] -> [n, d]`
pub fn matvec<B: Backend>(matrices: Tensor<B, 3>, vectors: Tensor<B, 2>) -> Tensor<B, 2> {
    let [n, d] = vectors.dims();
    matrices
        .matmul(vectors.unsqueeze_dim::<3>(2))
        .reshape([n, d])
}

/// `v^T A v` for each pair of the batch, shape `[n]`.
pub fn quadratic_form<B: Backend>(matrices: Tensor<B, 3>, vectors: Tensor<B, 2>) -> Tensor<B, 1> {
    let [n, _] = vectors.dims();
    (matvec(matrices, vectors.clone()) * vectors)
        .sum_dim(1)
        .reshape([n])
}

/// Identity matrix `[d, d]`.
pub fn eye<B: Backend>(d: usize, device: &B::Device) -> Tensor<B, 2> {
    let mut values = vec![0.0f32; d * d];
    for i in 0..d {
        values[i * d + i] = 1.0;
    }
    Tensor::from_data(TensorData::new(values, [d, d]), device)
}

/// Batch of lower triangular matrices from a diagonal `[n, d]` and the strictly
/// lower part `[n, d (d - 1) / 2]` listed row by row.
pub fn lower_triangular<B: Backend>(
    diagonal: Tensor<B, 2>,
    strictly_lower: Option<Tensor<B, 2>>,
) -> Tensor<B, 3> {
    let [n, d] = diagonal.dims();
    let device = diagonal.device();

    let mut diag_selector = vec![0.0f32; d * d * d];
    for i in 0..d {
        diag_selector[i * d * d + i * d + i] = 1.0;
    }
    let diag_selector = Tensor::<B, 2>::from_data(TensorData::new(diag_selector, [d, d * d]), &device);
    let mut flat = diagonal.matmul(diag_selector);

    if let Some(lower) = strictly_lower {
        let n_lower = d * (d - 1) / 2;
        let mut lower_selector = vec![0.0f32; n_lower * d * d];
        let mut index = 0;
        for i in 0..d {
            for j in 0..i {
                lower_selector[index * d * d + i * d + j] = 1.0;
                index += 1;
            }
        }
        let lower_selector =
            Tensor::<B, 2>::from_data(TensorData::new(lower_selector, [n_lower, d * d]), &device);
        flat = flat + lower.matmul(lower_selector);
    }

    flat.reshape([n, d, d])
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn spd_batch(device: &<TestBackend as Backend>::Device) -> Tensor<TestBackend, 3> {
        Tensor::from_data(
            TensorData::new(
                vec![
                    4.0f32, 2.0, 0.4, //
                    2.0, 5.0, 1.0, //
                    0.4, 1.0, 3.0, //
                    1.0, 0.0, 0.0, //
                    0.0, 2.0, 0.0, //
                    0.0, 0.0, 9.0,
                ],
                [2, 3, 3],
            ),
            device,
        )
    }

    fn assert_close(actual: Vec<f32>, expected: Vec<f32>, tol: f32) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected.iter()) {
            assert!((a - e).abs() < tol, "{a} != {e}");
        }
    }

    #[test]
    fn test_cholesky_reconstructs_matrix() {
        let device = Default::default();
        let a = spd_batch(&device);
        let l = cholesky(a.clone());

        let rebuilt = l.clone().matmul(l.clone().swap_dims(1, 2));
        assert_close(
            rebuilt.into_data().to_vec::<f32>().unwrap(),
            a.into_data().to_vec::<f32>().unwrap(),
            1e-5,
        );

        // Upper triangle is zero
        let values = l.into_data().to_vec::<f32>().unwrap();
        assert_eq!(values[1], 0.0);
        assert_eq!(values[2], 0.0);
        assert_eq!(values[5], 0.0);
    }

    #[test]
    fn test_inverse() {
        let device = Default::default();
        let a = spd_batch(&device);
        let product = a.clone().matmul(inverse(a));

        let identity = eye::<TestBackend>(3, &device)
            .unsqueeze_dim::<3>(0)
            .repeat_dim(0, 2);
        assert_close(
            product.into_data().to_vec::<f32>().unwrap(),
            identity.into_data().to_vec::<f32>().unwrap(),
            1e-5,
        );
    }

    #[test]
    fn test_log_det() {
        let device = Default::default();
        let a = spd_batch(&device);

        // det of the first matrix: 4(15 - 1) - 2(6 - 0.4) + 0.4(2 - 2) = 44.8
        let expected = vec![44.8f32.ln(), 18.0f32.ln()];
        assert_close(log_det(a).into_data().to_vec::<f32>().unwrap(), expected, 1e-4);
    }

    #[test]
    fn test_quadratic_form() {
        let device = Default::default();
        let a = spd_batch(&device);
        let v = Tensor::<TestBackend, 2>::from_data(
            TensorData::new(vec![1.0f32, 0.0, 1.0, 1.0, 1.0, 1.0], [2, 3]),
            &device,
        );
        assert_close(
            quadratic_form(a, v).into_data().to_vec::<f32>().unwrap(),
            vec![4.0 + 0.8 + 3.0, 12.0],
            1e-5,
        );
    }

    #[test]
    fn test_lower_triangular_layout() {
        let device = Default::default();
        let diagonal = Tensor::<TestBackend, 2>::from_data(
            TensorData::new(vec![1.0f32, 2.0, 3.0], [1, 3]),
            &device,
        );
        let lower = Tensor::<TestBackend, 2>::from_data(
            TensorData::new(vec![4.0f32, 5.0, 6.0], [1, 3]),
            &device,
        );

        let l = lower_triangular(diagonal, Some(lower));
        assert_eq!(l.dims(), [1, 3, 3]);
        assert_eq!(
            l.into_data().to_vec::<f32>().unwrap(),
            vec![1.0, 0.0, 0.0, 4.0, 2.0, 0.0, 5.0, 6.0, 3.0]
        );
    }
}
