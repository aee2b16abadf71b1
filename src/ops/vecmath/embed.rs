//! Parallel row gather and scatter-add.

use rayon::prelude::*;

use crate::ops::Buckets;

/// `out[i] = w[x[i]]`, one row per task.
pub fn embed_forward(w: &[f32], dim: usize, x: &[i32]) -> Vec<f32> {
    let mut out = vec![0.0f32; x.len() * dim];
    if dim == 0 {
        return out;
    }
    out.par_chunks_mut(dim)
        .zip(x.par_iter())
        .for_each(|(row, &ix)| {
            let src = ix as usize * dim;
            row.copy_from_slice(&w[src..src + dim]);
        });
    out
}

/// `gw[x[i]] += gy[i]`, partitioned by destination row.
///
/// Each worker owns a disjoint set of rows of `gw` and walks the positions
/// that scatter into them in ascending order, so repeated indices accumulate
/// exactly and in the same order as the sequential loop.
pub fn embed_backward(gw: &mut [f32], dim: usize, x: &[i32], gy: &[f32]) {
    if dim == 0 || x.is_empty() {
        return;
    }
    let rows = gw.len() / dim;
    let buckets = Buckets::build(x, rows);
    gw.par_chunks_mut(dim).enumerate().for_each(|(row, dst)| {
        for &pos in buckets.bucket(row) {
            let src = pos as usize * dim;
            for (d, &g) in dst.iter_mut().zip(&gy[src..src + dim]) {
                *d += g;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::reference;

    #[test]
    fn gather_copies_rows() {
        let w: Vec<f32> = (0..8).map(|v| v as f32).collect();
        assert_eq!(embed_forward(&w, 2, &[3, 0, 3]), vec![6.0, 7.0, 0.0, 1.0, 6.0, 7.0]);
    }

    #[test]
    fn scatter_matches_sequential_bitwise() {
        let x: Vec<i32> = (0..200).map(|i| (i * 7 % 13) as i32).collect();
        let gy: Vec<f32> = (0..200 * 3).map(|i| (i as f32 * 0.37).sin()).collect();
        let mut a = vec![0.5f32; 13 * 3];
        let mut b = a.clone();
        embed_backward(&mut a, 3, &x, &gy);
        reference::embed_backward(&mut b, 3, &x, &gy);
        assert_eq!(a, b);
    }
}
