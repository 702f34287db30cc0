mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::Result;
use attention::{AttentionPath, KernelTransform};
use candle_core::{DType, Device, Tensor};
use common::{max_abs_diff, overwrite_token, random_block, random_hidden};
use model::{BlockConfig, BlockWeights, ModelError, MultiHeadAttentionBlock, PARAMETER_NAMES};
use static_assertions::assert_impl_all;

assert_impl_all!(MultiHeadAttentionBlock: Send, Sync);
assert_impl_all!(model::AttentionStack: Send, Sync);

fn identity_block(path: AttentionPath) -> Result<MultiHeadAttentionBlock> {
    let config = BlockConfig::new(4, 2).with_path(path);
    let weights = BlockWeights::identity(4, DType::F32, &Device::Cpu)?;
    Ok(MultiHeadAttentionBlock::new(
        config,
        weights,
        Some(KernelTransform::shifted_identity()),
    )?)
}

#[test]
fn construction_rejects_uneven_head_split() {
    let weights = BlockWeights::identity(10, DType::F32, &Device::Cpu).unwrap();
    let err = MultiHeadAttentionBlock::new(BlockConfig::new(10, 3), weights, None).unwrap_err();
    assert!(matches!(err, ModelError::InvalidConfig(_)), "{err}");

    let err = MultiHeadAttentionBlock::with_init(
        BlockConfig::new(10, 3),
        &layers::LinearInit::XavierUniform,
        None,
    )
    .unwrap_err();
    assert!(matches!(err, ModelError::InvalidConfig(_)));
}

#[test]
fn construction_rejects_misshaped_weights() -> Result<()> {
    let mut weights = BlockWeights::identity(4, DType::F32, &Device::Cpu)?;
    weights.wk = Tensor::eye(3, DType::F32, &Device::Cpu)?;
    let err = MultiHeadAttentionBlock::new(BlockConfig::new(4, 2), weights, None).unwrap_err();
    assert!(matches!(err, ModelError::Tensor(_)), "{err}");
    Ok(())
}

#[test]
fn identity_block_reproduces_hand_computed_output() -> Result<()> {
    let tokens = Tensor::from_slice(
        &[1f32, -1., 1., -1., 3., -3., 1., -1., 1., -1., 3., -3.],
        (1, 3, 4),
        &Device::Cpu,
    )?;
    let expected = Tensor::from_slice(
        &[
            0.9999995f32, -0.9999995, 0.9999995, -0.9999995,
            1.1621372, -1.1621372, 0.8058754, -0.8058754,
            0.9999994, -0.9999994, 0.9999997, -0.9999997,
        ],
        (1, 3, 4),
        &Device::Cpu,
    )?;

    for path in [AttentionPath::Causal, AttentionPath::CausalQuadratic] {
        let block = identity_block(path)?;
        let out = block.forward(&tokens, &tokens, &tokens)?;
        assert_eq!(out.dims(), &[1, 3, 4]);
        let diff = max_abs_diff(&out, &expected)?;
        assert!(diff < 1e-5, "{path}: max diff {diff}");
    }
    Ok(())
}

#[test]
fn output_keeps_input_shape_and_dtype() -> Result<()> {
    for path in [
        AttentionPath::Causal,
        AttentionPath::CausalQuadratic,
        AttentionPath::Bidirectional,
    ] {
        let block = random_block(BlockConfig::new(8, 2).with_path(path))?;
        let hidden = random_hidden(2, 5, 8)?;
        let out = block.forward(&hidden, &hidden, &hidden)?;
        assert_eq!(out.dims(), &[2, 5, 8]);
        assert_eq!(out.dtype(), DType::F32);
    }

    let mut config = BlockConfig::new(8, 4);
    config.dtype = DType::BF16;
    let block = random_block(config)?;
    let hidden = random_hidden(1, 6, 8)?.to_dtype(DType::BF16)?;
    let out = block.forward(&hidden, &hidden, &hidden)?;
    assert_eq!(out.dims(), &[1, 6, 8]);
    assert_eq!(out.dtype(), DType::BF16);
    Ok(())
}

#[test]
fn causal_paths_ignore_future_tokens() -> Result<()> {
    let hidden = random_hidden(1, 4, 8)?;
    let changed = overwrite_token(&hidden, 3, &[5., -4., 3., -2., 1., 0., -1., 2.])?;

    for path in [AttentionPath::Causal, AttentionPath::CausalQuadratic] {
        let block = random_block(BlockConfig::new(8, 2).with_path(path))?;
        let before = block.forward(&hidden, &hidden, &hidden)?;
        let after = block.forward(&changed, &changed, &changed)?;
        let diff = max_abs_diff(&before.narrow(1, 0, 3)?, &after.narrow(1, 0, 3)?)?;
        assert!(diff < 1e-5, "{path}: earlier positions moved by {diff}");
    }

    let block = random_block(BlockConfig::new(8, 2).with_path(AttentionPath::Bidirectional))?;
    let before = block.forward(&hidden, &hidden, &hidden)?;
    let after = block.forward(&changed, &changed, &changed)?;
    assert!(max_abs_diff(&before.narrow(1, 0, 1)?, &after.narrow(1, 0, 1)?)? > 1e-4);
    Ok(())
}

#[test]
fn prefix_and_quadratic_blocks_agree() -> Result<()> {
    let causal = random_block(BlockConfig::new(8, 2))?;
    let mut weights_from_causal = Vec::new();
    for (_, tensor) in causal.parameters() {
        weights_from_causal.push(tensor.clone());
    }
    let weights = BlockWeights {
        wq: weights_from_causal[0].clone(),
        wk: weights_from_causal[1].clone(),
        wv: weights_from_causal[2].clone(),
        out_weight: weights_from_causal[3].clone(),
        out_bias: weights_from_causal[4].clone(),
        norm_weight: weights_from_causal[5].clone(),
        norm_bias: weights_from_causal[6].clone(),
    };
    let quadratic = MultiHeadAttentionBlock::new(
        BlockConfig::new(8, 2).with_path(AttentionPath::CausalQuadratic),
        weights,
        None,
    )?;

    let hidden = random_hidden(2, 7, 8)?;
    let a = causal.forward(&hidden, &hidden, &hidden)?;
    let b = quadratic.forward(&hidden, &hidden, &hidden)?;
    let diff = max_abs_diff(&a, &b)?;
    assert!(diff < 1e-5, "paths diverged by {diff}");
    Ok(())
}

#[test]
fn decode_steps_match_full_forward() -> Result<()> {
    let block = random_block(BlockConfig::new(8, 2))?;
    let hidden = random_hidden(2, 5, 8)?;
    let full = block.forward(&hidden, &hidden, &hidden)?;

    let mut state = block.new_decode_state(2);
    for position in 0..5 {
        let token = hidden.narrow(1, position, 1)?;
        let step = block.decode_step(&mut state, &token, &token, &token)?;
        assert_eq!(step.dims(), &[2, 1, 8]);
        let diff = max_abs_diff(&step, &full.narrow(1, position, 1)?)?;
        assert!(diff < 1e-4, "position {position} diverged by {diff}");
    }
    assert_eq!(state.position(), 5);
    Ok(())
}

#[test]
fn decode_is_rejected_for_bidirectional_blocks() -> Result<()> {
    let block = random_block(BlockConfig::new(8, 2).with_path(AttentionPath::Bidirectional))?;
    let token = random_hidden(1, 1, 8)?;
    let mut state = block.new_decode_state(1);
    let err = block
        .decode_step(&mut state, &token, &token, &token)
        .unwrap_err();
    assert!(matches!(err, ModelError::InvalidInput(_)));
    assert_eq!(state.position(), 0);
    Ok(())
}

#[test]
fn mismatched_inputs_are_errors() -> Result<()> {
    let block = random_block(BlockConfig::new(8, 2))?;
    let q = random_hidden(1, 4, 8)?;
    let short = random_hidden(1, 3, 8)?;
    assert!(matches!(
        block.forward(&q, &short, &short),
        Err(ModelError::InvalidInput(_))
    ));

    let wrong_width = random_hidden(1, 4, 6)?;
    assert!(block
        .forward(&wrong_width, &wrong_width, &wrong_width)
        .is_err());

    let mut state = block.new_decode_state(2);
    assert!(block.decode_step(&mut state, &q, &q, &q).is_err());
    Ok(())
}

#[test]
fn parameters_are_listed_in_stable_order() -> Result<()> {
    let block = random_block(BlockConfig::new(8, 2))?;
    let params = block.parameters();
    let names: Vec<_> = params.iter().map(|(name, _)| *name).collect();
    assert_eq!(names, PARAMETER_NAMES);
    assert_eq!(params[0].1.dims(), &[8, 8]);
    assert_eq!(params[4].1.dims(), &[8]);
    assert_eq!(params[6].1.dims(), &[8]);
    Ok(())
}

#[test]
fn parameter_updates_change_the_output() -> Result<()> {
    let mut block = random_block(BlockConfig::new(8, 2))?;
    let hidden = random_hidden(1, 4, 8)?;
    let before = block.forward(&hidden, &hidden, &hidden)?;

    let mut visited = Vec::new();
    block.update_parameters(|name, tensor| {
        visited.push(name.to_string());
        if name == "norm.bias" {
            tensor.affine(1.0, 0.5)
        } else {
            Ok(tensor.clone())
        }
    })?;
    assert_eq!(visited, PARAMETER_NAMES);

    let after = block.forward(&hidden, &hidden, &hidden)?;
    let shift = (after - &before)?.mean_all()?.to_vec0::<f32>()?;
    assert!((shift - 0.5).abs() < 1e-5, "bias shift was {shift}");
    Ok(())
}

#[test]
fn misshaped_updates_leave_the_block_untouched() -> Result<()> {
    let mut block = random_block(BlockConfig::new(8, 2))?;
    let original = block.parameters()[0].1.clone();

    let err = block
        .update_parameters(|name, tensor| match name {
            "wk" => Tensor::zeros((4, 8), DType::F32, &Device::Cpu),
            _ => tensor.zeros_like(),
        })
        .unwrap_err();
    assert!(
        matches!(err, ModelError::ParameterShape { name: "wk", .. }),
        "{err}"
    );
    assert_eq!(max_abs_diff(block.parameters()[0].1, &original)?, 0.0);
    Ok(())
}

#[test]
fn custom_kernel_is_applied_to_queries_and_keys() -> Result<()> {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let kernel = KernelTransform::custom(move |x: &Tensor| {
        counter.fetch_add(1, Ordering::SeqCst);
        x.exp()
    });

    let config = BlockConfig::new(8, 2);
    let weights = BlockWeights::identity(8, DType::F32, &Device::Cpu)?;
    let block = MultiHeadAttentionBlock::new(config, weights, Some(kernel))?;
    assert_eq!(block.kernel().name(), "custom");

    let hidden = random_hidden(1, 3, 8)?;
    block.forward(&hidden, &hidden, &hidden)?;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    Ok(())
}

#[test]
fn concurrent_forward_passes_share_the_block() -> Result<()> {
    let block = random_block(BlockConfig::new(8, 2))?;
    let hidden = random_hidden(2, 6, 8)?;
    let reference = block.forward(&hidden, &hidden, &hidden)?;

    let outputs = thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| scope.spawn(|| block.forward(&hidden, &hidden, &hidden)))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("forward thread panicked"))
            .collect::<Result<Vec<_>, _>>()
    })?;

    for out in &outputs {
        assert_eq!(max_abs_diff(out, &reference)?, 0.0);
    }
    Ok(())
}
