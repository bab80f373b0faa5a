use rand::Rng;
use rand_mt::Mt;

use crate::token::{Token, DEFAULT_CLASS};

/// 64-bit prime salt for the per-token seed hash.
const SEED_SALT: u64 = 1_125_899_906_842_597;

/// Deterministic seed for a token's initial accumulator row.
///
/// Depends only on (class id, keyword) and the optional run seed, never on
/// which executor computes it. The whole fit is reproducible regardless of
/// worker count because every worker derives identical rows from this.
pub fn token_seed(token: &Token, run_seed: Option<u32>) -> u64 {
    let mut h = SEED_SALT;

    if token.class_id != DEFAULT_CLASS {
        for byte in token.class_id.bytes() {
            h = h.wrapping_mul(31).wrapping_add(byte as u64);
        }
    }

    // separates class id and keyword
    h = h.wrapping_mul(31).wrapping_add(255);

    for byte in token.keyword.bytes() {
        h = h.wrapping_mul(31).wrapping_add(byte as u64);
    }

    if let Some(seed) = run_seed {
        h = h.wrapping_mul(31).wrapping_add(seed as u64);
    }

    h
}

/// `len` uniform floats in `[0, 1)` from a Mersenne Twister seeded with
/// `seed`, normalized to sum 1.
pub fn random_probability_vector(len: usize, seed: u64) -> Vec<f32> {
    let mut rng = Mt::new(seed as u32);
    let mut values: Vec<f32> = (0..len).map(|_| rng.gen::<f32>()).collect();

    let sum: f32 = values.iter().sum();
    if sum > 0.0 {
        for value in values.iter_mut() {
            *value /= sum;
        }
    }
    values
}

/// Seeded initial row for a token's accumulator matrix entry.
pub fn initial_nwt_row(num_topics: usize, token: &Token, run_seed: Option<u32>) -> Vec<f32> {
    random_probability_vector(num_topics, token_seed(token, run_seed))
}

#[cfg(test)]
mod test {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn seed_depends_only_on_token_and_run_seed() {
        let token = Token::plain("ostrich");
        assert_eq!(token_seed(&token, None), token_seed(&Token::plain("ostrich"), None));
        assert_ne!(token_seed(&token, None), token_seed(&Token::plain("ostrick"), None));
        assert_ne!(
            token_seed(&token, None),
            token_seed(&Token::new("@labels", "ostrich"), None)
        );
        assert_ne!(token_seed(&token, None), token_seed(&token, Some(7)));
    }

    #[test]
    fn rows_are_reproducible_and_normalized() {
        let token = Token::plain("gazelle");
        let a = initial_nwt_row(16, &token, None);
        let b = initial_nwt_row(16, &token, None);
        assert_eq!(a, b);

        assert_relative_eq!(a.iter().sum::<f32>(), 1.0, epsilon = 1e-5);
        assert!(a.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn different_tokens_get_different_rows() {
        let a = initial_nwt_row(8, &Token::plain("left"), None);
        let b = initial_nwt_row(8, &Token::plain("right"), None);
        assert_ne!(a, b);
    }
}
