//! Running-state form of causal linear attention.
//!
//! Causal linear attention is a recurrence over positions. For every
//! `(batch, head)` sequence we keep
//!
//! * `S = Σ_{j≤t} K′ⱼ ⊗ Vⱼ`, a `head_dim × value_dim` matrix, and
//! * `z = Σ_{j≤t} K′ⱼ`, a `head_dim` vector,
//!
//! and emit `Outₜ = (Q′ₜ · S) / (Q′ₜ · z + ε)`. Scanning a whole sequence from a
//! zero state is the prefix-sum causal path; carrying the state across calls
//! turns it into an `O(1)`-per-token decoder.

use candle_core::{DType, Device, Tensor};
use rayon::prelude::*;

use crate::core::{AttentionError, Config, HeadShape};

/// Accumulated `S` / `z` sums for a batch of head sequences.
#[derive(Debug, Clone)]
pub struct DecodeState {
    batch: usize,
    num_heads: usize,
    head_dim: usize,
    value_dim: usize,
    kv: Vec<f32>,
    k_sum: Vec<f32>,
    position: usize,
}

impl DecodeState {
    /// A zeroed state for `batch × num_heads` sequences.
    pub fn new(batch: usize, num_heads: usize, head_dim: usize, value_dim: usize) -> Self {
        let sequences = batch * num_heads;
        Self {
            batch,
            num_heads,
            head_dim,
            value_dim,
            kv: vec![0.0; sequences * head_dim * value_dim],
            k_sum: vec![0.0; sequences * head_dim],
            position: 0,
        }
    }

    /// Number of positions folded into the state so far.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Forgets every consumed position.
    pub fn reset(&mut self) {
        self.kv.fill(0.0);
        self.k_sum.fill(0.0);
        self.position = 0;
    }

    /// Current `z = Σ K′` as `[batch, heads, head_dim]`.
    pub fn key_sum(&self, device: &Device) -> candle_core::Result<Tensor> {
        Tensor::from_slice(
            &self.k_sum,
            (self.batch, self.num_heads, self.head_dim),
            device,
        )
    }

    /// Current `S = Σ K′ ⊗ V` as `[batch, heads, head_dim, value_dim]`.
    pub fn key_value_sum(&self, device: &Device) -> candle_core::Result<Tensor> {
        Tensor::from_slice(
            &self.kv,
            (self.batch, self.num_heads, self.head_dim, self.value_dim),
            device,
        )
    }

    /// Folds `t >= 1` new positions into the state and returns their outputs.
    ///
    /// Inputs follow the [`Attention`](crate::core::Attention) layout with
    /// `seq_len = t`; the result is `[batch, heads, t, value_dim]` in `v`'s
    /// dtype. Position `i` of the chunk sees every earlier chunk plus chunk
    /// positions `<= i`.
    pub fn step(
        &mut self,
        q_prime: &Tensor,
        k_prime: &Tensor,
        v: &Tensor,
        config: &Config,
    ) -> Result<Tensor, AttentionError> {
        let shape = HeadShape::of(q_prime, k_prime, v)?;
        if (shape.batch, shape.num_heads, shape.head_dim, shape.value_dim)
            != (self.batch, self.num_heads, self.head_dim, self.value_dim)
        {
            return Err(AttentionError::shape(format!(
                "decode state expects [{}, {}, _, {}] features and {} value dims, got q {:?} v {:?}",
                self.batch,
                self.num_heads,
                self.head_dim,
                self.value_dim,
                q_prime.dims(),
                v.dims()
            )));
        }

        let q = host_values(q_prime)?;
        let k = host_values(k_prime)?;
        let vals = host_values(v)?;
        let mut out = vec![0f32; shape.sequences() * shape.seq_len * shape.value_dim];

        causal_scan(
            &shape,
            &q,
            &k,
            &vals,
            &mut self.kv,
            &mut self.k_sum,
            &mut out,
            config.normalizer_epsilon as f32,
        );
        self.position += shape.seq_len;

        let output = Tensor::from_vec(
            out,
            (shape.batch, shape.num_heads, shape.seq_len, shape.value_dim),
            v.device(),
        )?;
        Ok(output.to_dtype(v.dtype())?)
    }
}

fn host_values(tensor: &Tensor) -> candle_core::Result<Vec<f32>> {
    tensor
        .to_dtype(DType::F32)?
        .contiguous()?
        .flatten_all()?
        .to_vec1::<f32>()
}

/// Advances `kv` / `k_sum` over every position of every sequence, writing
/// outputs into `out`. Sequences are independent and run in parallel.
#[allow(clippy::too_many_arguments)]
pub(crate) fn causal_scan(
    shape: &HeadShape,
    q: &[f32],
    k: &[f32],
    v: &[f32],
    kv: &mut [f32],
    k_sum: &mut [f32],
    out: &mut [f32],
    epsilon: f32,
) {
    let (n, d, e) = (shape.seq_len, shape.head_dim, shape.value_dim);

    out.par_chunks_mut(n * e)
        .zip(kv.par_chunks_mut(d * e))
        .zip(k_sum.par_chunks_mut(d))
        .enumerate()
        .for_each(|(seq, ((out, kv), k_sum))| {
            let q = &q[seq * n * d..(seq + 1) * n * d];
            let k = &k[seq * n * d..(seq + 1) * n * d];
            let v = &v[seq * n * e..(seq + 1) * n * e];

            for t in 0..n {
                let k_t = &k[t * d..(t + 1) * d];
                let v_t = &v[t * e..(t + 1) * e];
                for (dd, &k_val) in k_t.iter().enumerate() {
                    k_sum[dd] += k_val;
                    let row = &mut kv[dd * e..(dd + 1) * e];
                    for (acc, &v_val) in row.iter_mut().zip(v_t) {
                        *acc += k_val * v_val;
                    }
                }

                let q_t = &q[t * d..(t + 1) * d];
                let denom: f32 = q_t
                    .iter()
                    .zip(k_sum.iter())
                    .map(|(a, b)| a * b)
                    .sum::<f32>()
                    + epsilon;
                let out_t = &mut out[t * e..(t + 1) * e];
                out_t.fill(0.0);
                for (dd, &q_val) in q_t.iter().enumerate() {
                    let row = &kv[dd * e..(dd + 1) * e];
                    for (acc, &s) in out_t.iter_mut().zip(row) {
                        *acc += q_val * s;
                    }
                }
                for value in out_t.iter_mut() {
                    *value /= denom;
                }
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(device: &Device, seed: f32, dims: (usize, usize, usize, usize)) -> Tensor {
        let total = dims.0 * dims.1 * dims.2 * dims.3;
        let data: Vec<f32> = (0..total)
            .map(|i| ((i as f32 * 0.37 + seed).sin() + 1.1) * 0.5)
            .collect();
        Tensor::from_vec(data, dims, device).unwrap()
    }

    #[test]
    fn single_position_returns_its_value() {
        let device = Device::Cpu;
        let q = features(&device, 0.1, (1, 1, 1, 3));
        let k = features(&device, 0.7, (1, 1, 1, 3));
        let v = Tensor::from_vec(vec![2f32, -1.0], (1, 1, 1, 2), &device).unwrap();

        let mut state = DecodeState::new(1, 1, 3, 2);
        let out = state
            .step(&q, &k, &v, &Config::default())
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!((out[0] - 2.0).abs() < 1e-4);
        assert!((out[1] + 1.0).abs() < 1e-4);
        assert_eq!(state.position(), 1);
    }

    #[test]
    fn chunked_steps_match_one_shot_scan() {
        let device = Device::Cpu;
        let dims = (2, 2, 5, 3);
        let q = features(&device, 0.2, dims);
        let k = features(&device, 1.3, dims);
        let v = features(&device, 2.9, (2, 2, 5, 4));
        let config = Config::default();

        let mut whole = DecodeState::new(2, 2, 3, 4);
        let expected = whole.step(&q, &k, &v, &config).unwrap();

        let mut chunked = DecodeState::new(2, 2, 3, 4);
        let mut pieces = Vec::new();
        for (start, len) in [(0, 2), (2, 1), (3, 2)] {
            pieces.push(
                chunked
                    .step(
                        &q.narrow(2, start, len).unwrap(),
                        &k.narrow(2, start, len).unwrap(),
                        &v.narrow(2, start, len).unwrap(),
                        &config,
                    )
                    .unwrap(),
            );
        }
        let stitched = Tensor::cat(&pieces, 2).unwrap();
        let max = stitched
            .sub(&expected)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_vec0::<f32>()
            .unwrap();
        assert!(max < 1e-6, "max diff {max}");
        assert_eq!(chunked.position(), 5);

        let z = chunked.key_sum(&device).unwrap();
        let expected_z = k.sum(2).unwrap();
        let z_diff = z.sub(&expected_z).unwrap().abs().unwrap().max_all().unwrap();
        assert!(z_diff.to_vec0::<f32>().unwrap() < 1e-5);

        assert_eq!((chunked.batch(), chunked.num_heads()), (2, 2));
        let s = chunked.key_value_sum(&device).unwrap();
        assert_eq!(s.dims(), &[2, 2, 3, 4]);
        let expected_s = k
            .transpose(2, 3)
            .unwrap()
            .contiguous()
            .unwrap()
            .matmul(&v)
            .unwrap();
        let s_diff = s.sub(&expected_s).unwrap().abs().unwrap().max_all().unwrap();
        assert!(s_diff.to_vec0::<f32>().unwrap() < 1e-5);
        let whole_s = whole.key_value_sum(&device).unwrap();
        let whole_diff = s.sub(&whole_s).unwrap().abs().unwrap().max_all().unwrap();
        assert!(whole_diff.to_vec0::<f32>().unwrap() < 1e-5);
    }

    #[test]
    fn mismatched_state_shape_is_rejected() {
        let device = Device::Cpu;
        let q = features(&device, 0.0, (1, 2, 1, 3));
        let mut state = DecodeState::new(1, 1, 3, 3);
        assert!(matches!(
            state.step(&q, &q, &q, &Config::default()),
            Err(AttentionError::InvalidShape { .. })
        ));
    }

    #[test]
    fn reset_clears_history() {
        let device = Device::Cpu;
        let q = features(&device, 0.4, (1, 1, 2, 2));
        let config = Config::default();
        let mut state = DecodeState::new(1, 1, 2, 2);
        let first = state.step(&q, &q, &q, &config).unwrap();
        state.reset();
        assert_eq!(state.position(), 0);
        let again = state.step(&q, &q, &q, &config).unwrap();
        assert_eq!(
            first.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            again.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
    }
}
