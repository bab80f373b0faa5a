//! Per-batch E-step: infer document-topic distributions and push the
//! resulting additive updates into the accumulator matrix.

use crate::batch::Batch;
use crate::matrix::PhiMatrix;
use crate::store::StoreError;
use crate::EPS;

/// Compressed sparse row matrix over one batch: rows are documents, columns
/// are batch-local tokens, values are token weights.
#[derive(Debug, Clone)]
pub struct CsrMatrix {
    num_cols: usize,
    vals: Vec<f32>,
    row_ptr: Vec<usize>,
    col_ind: Vec<usize>,
}

impl CsrMatrix {
    pub fn from_batch(batch: &Batch) -> Self {
        let mut vals = Vec::new();
        let mut row_ptr = Vec::with_capacity(batch.items.len() + 1);
        let mut col_ind = Vec::new();

        for item in &batch.items {
            row_ptr.push(vals.len());
            for (&token_id, &weight) in item.token_ids.iter().zip(&item.token_weights) {
                vals.push(weight);
                col_ind.push(token_id);
            }
        }
        row_ptr.push(vals.len());

        Self {
            num_cols: batch.token_count(),
            vals,
            row_ptr,
            col_ind,
        }
    }

    pub fn row_count(&self) -> usize {
        self.row_ptr.len() - 1
    }

    pub fn col_count(&self) -> usize {
        self.num_cols
    }

    pub fn row_range(&self, row: usize) -> std::ops::Range<usize> {
        self.row_ptr[row]..self.row_ptr[row + 1]
    }

    pub fn vals(&self) -> &[f32] {
        &self.vals
    }

    pub fn col_ind(&self) -> &[usize] {
        &self.col_ind
    }

    /// Swaps rows and columns by a counting sort over the column indices.
    pub fn transposed(&self) -> CsrMatrix {
        let mut row_ptr = vec![0usize; self.num_cols + 1];
        for &col in &self.col_ind {
            row_ptr[col + 1] += 1;
        }
        for col in 0..self.num_cols {
            row_ptr[col + 1] += row_ptr[col];
        }

        let mut vals = vec![0.0; self.vals.len()];
        let mut col_ind = vec![0usize; self.col_ind.len()];
        let mut cursor = row_ptr.clone();
        for row in 0..self.row_count() {
            for i in self.row_range(row) {
                let slot = cursor[self.col_ind[i]];
                vals[slot] = self.vals[i];
                col_ind[slot] = row;
                cursor[self.col_ind[i]] += 1;
            }
        }

        CsrMatrix {
            num_cols: self.row_count(),
            vals,
            row_ptr,
            col_ind,
        }
    }
}

/// Dense topic-by-item matrix, one column per document; columns are
/// contiguous so the kernel works on slices.
#[derive(Debug, Clone)]
pub struct ThetaMatrix {
    num_topics: usize,
    num_items: usize,
    data: Vec<f32>,
}

impl ThetaMatrix {
    /// Every entry starts at `1 / num_topics`.
    pub fn uniform(num_topics: usize, num_items: usize) -> Self {
        Self {
            num_topics,
            num_items,
            data: vec![1.0 / num_topics as f32; num_topics * num_items],
        }
    }

    pub fn item_count(&self) -> usize {
        self.num_items
    }

    pub fn column(&self, item: usize) -> &[f32] {
        &self.data[item * self.num_topics..(item + 1) * self.num_topics]
    }

    pub fn column_mut(&mut self, item: usize) -> &mut [f32] {
        &mut self.data[item * self.num_topics..(item + 1) * self.num_topics]
    }

    /// Scales the column to sum 1 over its positive entries and floors
    /// everything below [`EPS`] to zero. A column with no positive mass is
    /// zeroed.
    pub fn normalize_column(&mut self, item: usize) {
        let column = self.column_mut(item);
        let sum: f32 = column.iter().filter(|&&v| v > 0.0).sum();
        let inv = if sum > 0.0 { 1.0 / sum } else { 0.0 };
        for value in column.iter_mut() {
            *value *= inv;
            if *value < EPS {
                *value = 0.0;
            }
        }
    }
}

/// The dense kernels the per-document inference runs on. Passed explicitly
/// to keep the numerical seam visible and swappable.
#[derive(Debug, Default, Clone, Copy)]
pub struct Numerics;

impl Numerics {
    pub fn dot(&self, a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    /// `y += alpha * x`
    pub fn axpy(&self, alpha: f32, x: &[f32], y: &mut [f32]) {
        for (yi, xi) in y.iter_mut().zip(x) {
            *yi += alpha * xi;
        }
    }
}

/// Maps every batch-local token to its global id in `matrix`, `None` for
/// tokens outside the vocabulary.
pub fn resolve_token_ids<S, M: PhiMatrix<S>>(batch: &Batch, matrix: &M) -> Vec<Option<usize>> {
    (0..batch.token_count())
        .map(|index| matrix.token_index(&batch.token_at(index)))
        .collect()
}

/// Runs the per-document inference for one batch and stores the accumulator
/// updates, returning the batch's perplexity contribution
/// (`sum of n_wd * ln p_wd` over all counted slots).
///
/// `theta` starts uniform; `num_inner_iters` passes refine it per document,
/// then the converged distributions produce one additive update per token
/// row of `n_wt`.
#[allow(clippy::too_many_arguments)]
pub fn infer_theta_and_update_nwt<S, P, N>(
    batch: &Batch,
    n_dw: &CsrMatrix,
    p_wt: &P,
    n_wt: &N,
    store: &mut S,
    theta: &mut ThetaMatrix,
    numerics: &Numerics,
    num_inner_iters: usize,
) -> Result<f64, StoreError>
where
    P: PhiMatrix<S>,
    N: PhiMatrix<S>,
{
    let num_topics = p_wt.topic_count();
    let docs_count = theta.item_count();
    let token_ids = resolve_token_ids(batch, p_wt);

    let max_item_len = (0..docs_count)
        .map(|d| n_dw.row_range(d).len())
        .max()
        .unwrap_or(0);

    let mut local_phi = vec![0.0f32; max_item_len * num_topics];
    let mut helper = vec![0.0f32; num_topics];
    let mut n_td = vec![0.0f32; num_topics];

    for d in 0..docs_count {
        let range = n_dw.row_range(d);

        local_phi[..range.len() * num_topics].fill(0.0);
        let mut item_has_tokens = false;
        for (slot, i) in range.clone().enumerate() {
            let Some(token_id) = token_ids[n_dw.col_ind()[i]] else {
                continue;
            };
            item_has_tokens = true;
            p_wt.get(store, token_id, &mut helper)?;
            local_phi[slot * num_topics..(slot + 1) * num_topics].copy_from_slice(&helper);
        }
        if !item_has_tokens {
            continue;
        }

        for _ in 0..num_inner_iters {
            n_td.fill(0.0);
            for (slot, i) in range.clone().enumerate() {
                let phi_row = &local_phi[slot * num_topics..(slot + 1) * num_topics];
                let p_dw = numerics.dot(phi_row, theta.column(d));
                if p_dw == 0.0 {
                    continue;
                }
                numerics.axpy(n_dw.vals()[i] / p_dw, phi_row, &mut n_td);
            }

            for (value, factor) in theta.column_mut(d).iter_mut().zip(&n_td) {
                *value *= factor;
            }
            theta.normalize_column(d);
        }
    }

    // Converged theta in hand: transpose to walk token-major and emit one
    // accumulator update per token row.
    let n_wd = n_dw.transposed();
    let mut p_wt_local = vec![0.0f32; num_topics];
    let mut n_wt_local = vec![0.0f32; num_topics];
    let mut values = vec![0.0f32; num_topics];
    let mut perplexity = 0.0f64;

    for w in 0..batch.token_count() {
        let Some(token_id) = token_ids[w] else {
            continue;
        };

        p_wt.get(store, token_id, &mut p_wt_local)?;
        n_wt_local.fill(0.0);
        let mut counted = false;

        for i in n_wd.row_range(w) {
            let d = n_wd.col_ind()[i];
            let p_wd = numerics.dot(&p_wt_local, theta.column(d));
            if p_wd < EPS {
                continue;
            }
            numerics.axpy(n_wd.vals()[i] / p_wd, theta.column(d), &mut n_wt_local);
            perplexity += n_wd.vals()[i] as f64 * (p_wd as f64).ln();
            counted = true;
        }

        if !counted {
            continue;
        }
        for ((value, &phi), &acc) in values.iter_mut().zip(&p_wt_local).zip(&n_wt_local) {
            *value = phi * acc;
        }
        n_wt.increase(store, token_id, &values)?;
    }

    Ok(perplexity)
}

/// Convenience wrapper: builds the sparse matrix and the uniform theta for
/// `batch`, runs the kernel, returns the perplexity contribution.
pub fn process_batch<S, P, N>(
    batch: &Batch,
    p_wt: &P,
    n_wt: &N,
    store: &mut S,
    numerics: &Numerics,
    num_inner_iters: usize,
) -> Result<f64, StoreError>
where
    P: PhiMatrix<S>,
    N: PhiMatrix<S>,
{
    let n_dw = CsrMatrix::from_batch(batch);
    let mut theta = ThetaMatrix::uniform(p_wt.topic_count(), batch.items.len());
    infer_theta_and_update_nwt(
        batch,
        &n_dw,
        p_wt,
        n_wt,
        store,
        &mut theta,
        numerics,
        num_inner_iters,
    )
}
