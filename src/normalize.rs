//! The M-step: turning accumulator rows into probabilities by dividing with
//! per-class column sums. The distributed two-phase dance around these
//! functions lives with the executor (worker half) and the master (reduce
//! and broadcast half).

use std::ops::Range;

use crate::matrix::PhiMatrix;
use crate::store::{Normalizers, StoreError};
use crate::EPS;

/// Partial normalizer over one token range: for every class appearing in
/// the range, the topic-wise sum of the positive accumulator entries.
pub fn find_nt<S, M: PhiMatrix<S>>(
    n_wt: &M,
    store: &mut S,
    token_range: Range<usize>,
) -> Result<Normalizers, StoreError> {
    let num_topics = n_wt.topic_count();
    let mut helper = vec![0.0f32; num_topics];
    let mut normalizers = Normalizers::new();

    for token_id in token_range {
        n_wt.get(store, token_id, &mut helper)?;
        let entry = normalizers
            .entry(n_wt.token(token_id).class_id.clone())
            .or_insert_with(|| vec![0.0f64; num_topics]);
        for (sum, &value) in entry.iter_mut().zip(&helper) {
            if value > 0.0 {
                *sum += value as f64;
            }
        }
    }
    Ok(normalizers)
}

/// Elementwise merge of a partial normalizer into the running total.
pub fn merge_normalizers(total: &mut Normalizers, part: Normalizers) {
    for (class_id, values) in part {
        match total.get_mut(&class_id) {
            Some(entry) => {
                for (sum, value) in entry.iter_mut().zip(values) {
                    *sum += value;
                }
            }
            None => {
                total.insert(class_id, values);
            }
        }
    }
}

/// Phase B of the normalization: rewrites every `p_wt` row in the range as
/// `max(n, 0) / normalizer`, flooring results below [`EPS`] to zero and
/// zeroing topics whose class normalizer is empty. With `reset` the
/// accumulator row is swapped to zero in the same store round-trip.
pub fn scale_rows<S, P, N>(
    p_wt: &P,
    n_wt: &N,
    store: &mut S,
    token_range: Range<usize>,
    normalizers: &Normalizers,
    reset: bool,
) -> Result<(), StoreError>
where
    P: PhiMatrix<S>,
    N: PhiMatrix<S>,
{
    let num_topics = n_wt.topic_count();
    let zeros = vec![0.0f32; num_topics];
    let mut n_row = vec![0.0f32; num_topics];
    let mut p_row = vec![0.0f32; num_topics];

    for token_id in token_range {
        if reset {
            n_wt.get_and_set(store, token_id, &mut n_row, &zeros)?;
        } else {
            n_wt.get(store, token_id, &mut n_row)?;
        }

        let class_nt = normalizers.get(&n_wt.token(token_id).class_id);
        for topic in 0..num_topics {
            let denominator = class_nt.map(|nt| nt[topic]).unwrap_or(0.0);
            p_row[topic] = if denominator > 0.0 {
                let value = (n_row[topic].max(0.0) as f64 / denominator) as f32;
                if value < EPS {
                    0.0
                } else {
                    value
                }
            } else {
                0.0
            };
        }
        p_wt.set(store, token_id, &p_row)?;
    }
    Ok(())
}

/// Single-process normalization over the full row set; the accumulator is
/// left intact so further passes keep extending it.
pub fn normalize_local<S, P, N>(p_wt: &P, n_wt: &N, store: &mut S) -> Result<(), StoreError>
where
    P: PhiMatrix<S>,
    N: PhiMatrix<S>,
{
    let normalizers = find_nt(n_wt, store, 0..n_wt.token_count())?;
    scale_rows(p_wt, n_wt, store, 0..n_wt.token_count(), &normalizers, false)
}

#[cfg(test)]
mod test {
    use approx::assert_relative_eq;

    use super::*;
    use crate::matrix::DensePhiMatrix;
    use crate::token::Token;

    fn accumulator(rows: &[(Token, [f32; 2])]) -> (DensePhiMatrix, DensePhiMatrix) {
        let mut p_wt = DensePhiMatrix::new("pwt", 2);
        let mut n_wt = DensePhiMatrix::new("nwt", 2);
        for (token, row) in rows {
            p_wt.add_token(&mut (), token.clone(), true, &[0.0, 0.0])
                .unwrap();
            n_wt.add_token(&mut (), token.clone(), true, row).unwrap();
        }
        (p_wt, n_wt)
    }

    #[test]
    fn class_columns_sum_to_one_after_normalization() {
        let (p_wt, n_wt) = accumulator(&[
            (Token::plain("a"), [3.0, 1.0]),
            (Token::plain("b"), [1.0, 1.0]),
        ]);

        normalize_local(&p_wt, &n_wt, &mut ()).unwrap();

        for topic in 0..2 {
            let sum: f32 = (0..2).map(|id| p_wt.row(id)[topic]).sum();
            assert_relative_eq!(sum, 1.0, epsilon = 1e-6);
        }
        assert_relative_eq!(p_wt.row(0)[0], 0.75, epsilon = 1e-6);
    }

    #[test]
    fn negative_accumulator_entries_count_as_zero() {
        let (p_wt, n_wt) = accumulator(&[
            (Token::plain("a"), [-2.0, 1.0]),
            (Token::plain("b"), [4.0, 1.0]),
        ]);

        normalize_local(&p_wt, &n_wt, &mut ()).unwrap();

        assert_eq!(p_wt.row(0)[0], 0.0);
        assert_relative_eq!(p_wt.row(1)[0], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn empty_class_column_yields_zero_rows() {
        let (p_wt, n_wt) = accumulator(&[
            (Token::plain("a"), [0.0, 2.0]),
            (Token::plain("b"), [0.0, 2.0]),
        ]);

        normalize_local(&p_wt, &n_wt, &mut ()).unwrap();

        for id in 0..2 {
            assert_eq!(p_wt.row(id)[0], 0.0);
            assert_relative_eq!(p_wt.row(id)[1], 0.5, epsilon = 1e-6);
        }
    }

    #[test]
    fn classes_normalize_independently() {
        let (p_wt, n_wt) = accumulator(&[
            (Token::plain("a"), [2.0, 0.0]),
            (Token::new("@labels", "x"), [5.0, 0.0]),
            (Token::new("@labels", "y"), [15.0, 0.0]),
        ]);

        normalize_local(&p_wt, &n_wt, &mut ()).unwrap();

        assert_relative_eq!(p_wt.row(0)[0], 1.0, epsilon = 1e-6);
        assert_relative_eq!(p_wt.row(1)[0], 0.25, epsilon = 1e-6);
        assert_relative_eq!(p_wt.row(2)[0], 0.75, epsilon = 1e-6);
    }

    #[test]
    fn reset_swaps_the_accumulator_to_zero() {
        let (p_wt, n_wt) = accumulator(&[(Token::plain("a"), [2.0, 2.0])]);

        let normalizers = find_nt(&n_wt, &mut (), 0..1).unwrap();
        scale_rows(&p_wt, &n_wt, &mut (), 0..1, &normalizers, true).unwrap();

        assert_eq!(n_wt.row(0), vec![0.0, 0.0]);
        assert_relative_eq!(p_wt.row(0)[0], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn merge_adds_elementwise_by_class() {
        let mut total = Normalizers::new();
        total.insert("@default_class".to_string(), vec![1.0, 2.0]);

        let mut part = Normalizers::new();
        part.insert("@default_class".to_string(), vec![0.5, 0.5]);
        part.insert("@labels".to_string(), vec![3.0, 0.0]);

        merge_normalizers(&mut total, part);

        assert_eq!(total.get("@default_class").unwrap(), &vec![1.5, 2.5]);
        assert_eq!(total.get("@labels").unwrap(), &vec![3.0, 0.0]);
    }
}
