//! Condensed pairwise addressing
//!
//! A batch of n rows has n(n-1)/2 unordered pairs. They are stored flat, row
//! by row over the upper triangle with j varying fastest:
//!
//! ```text
//!      0 1 2 3 4
//!   0  . 0 1 2 3
//!   1  . . 4 5 6        =>   0 1 2 3 4 5 6 7 8 9
//!   2  . . . 7 8
//!   3  . . . . 9
//! ```
//!
//! Everything here is integer arithmetic on indices; tensors only appear in
//! [`square_form`].

use crate::{
    error::{ForgeError, ForgeResult},
    tensor::Tensor,
};

/// Number of unordered pairs in a batch of `n` rows
pub fn condensed_len(n: usize) -> usize {
    n * n.saturating_sub(1) / 2
}

/// Offset of the unordered pair {i, j} in a condensed vector for `n` rows.
///
/// Argument order does not matter. `i == j` has no offset and is a domain
/// error.
pub fn condensed_index(n: usize, i: usize, j: usize) -> ForgeResult<usize> {
    if i == j {
        return Err(ForgeError::domain_error(
            "condensed_index",
            &format!("i and j should be different, both are {}", i),
        ));
    }
    if i >= n || j >= n {
        return Err(ForgeError::InvalidInput(format!(
            "pair ({}, {}) out of range for a batch of {}",
            i, j, n
        )));
    }
    let (i, j) = if i < j { (i, j) } else { (j, i) };
    Ok(i * n - i * (i + 1) / 2 - i + j - 1)
}

/// Vectorized [`condensed_index`] over paired index lists
pub fn condensed_indices(n: usize, rows: &[usize], cols: &[usize]) -> ForgeResult<Vec<usize>> {
    if rows.len() != cols.len() {
        return Err(ForgeError::shape_error(
            &format!("{} column indices", rows.len()),
            &format!("{}", cols.len()),
            None,
        ));
    }
    rows.iter()
        .zip(cols)
        .map(|(&i, &j)| condensed_index(n, i, j))
        .collect()
}

/// Inverse of [`condensed_index`]: the pair (i, j), i < j, stored at offset `k`
pub fn condensed_pair(n: usize, k: usize) -> ForgeResult<(usize, usize)> {
    let len = condensed_len(n);
    if k >= len {
        return Err(ForgeError::InvalidInput(format!(
            "offset {} out of range for {} pairs",
            k, len
        )));
    }
    let mut i = 0;
    let mut rest = k;
    while rest >= n - 1 - i {
        rest -= n - 1 - i;
        i += 1;
    }
    Ok((i, i + 1 + rest))
}

/// Expand a condensed vector into a dense symmetric (n, n) matrix with a
/// zero diagonal
pub fn square_form(n: usize, condensed: &[f32]) -> ForgeResult<Tensor> {
    if condensed.len() != condensed_len(n) {
        return Err(ForgeError::shape_error(
            &format!("{} condensed distances for a batch of {}", condensed_len(n), n),
            &format!("{}", condensed.len()),
            None,
        ));
    }
    let mut dense = vec![0.0f32; n * n];
    let mut k = 0;
    for i in 0..n {
        for j in (i + 1)..n {
            dense[i * n + j] = condensed[k];
            dense[j * n + i] = condensed[k];
            k += 1;
        }
    }
    Tensor::from_vec(dense, &[n, n])
}
