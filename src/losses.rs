/// Domain alignment losses
///
/// Pure functions over candle tensors. Feature batches are `[batch, dim]`,
/// probabilities are row-stochastic `[batch, classes]`.
use candle_core::{bail, DType, Result, Tensor};

/// Kernel bandwidth multiplier between consecutive Gaussian kernels
const KERNEL_MUL: f64 = 2.0;
/// Number of Gaussian kernels summed by the MMD estimator
const KERNEL_NUM: usize = 5;
/// Floor applied to probabilities before taking logs
const PROB_EPS: f64 = 1e-7;
/// Weight of the gradient penalty inside the critic loss
pub const GRADIENT_PENALTY_WEIGHT: f64 = 10.0;

/// A critic whose input gradient can be expressed as a differentiable tensor
///
/// candle does not record a graph while computing gradients, so the gradient
/// penalty needs the critic to spell out `d(sum of outputs)/d(input)` itself.
pub trait Critic {
    /// Critic scores `[batch, k]`
    fn score(&self, xs: &Tensor) -> Result<Tensor>;

    /// Gradient of the summed scores with respect to `xs`, `[batch, dim]`
    fn input_gradient(&self, xs: &Tensor) -> Result<Tensor>;
}

/// `log` with probabilities floored away from zero
pub fn safe_log(probs: &Tensor) -> Result<Tensor> {
    probs.maximum(PROB_EPS)?.log()
}

/// Sum of Gaussian kernels over the pairwise squared distances of `[a; b]`
fn gaussian_kernel(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let total = Tensor::cat(&[a, b], 0)?;
    let n = total.dim(0)?;

    let sq_norms = total.sqr()?.sum_keepdim(1)?;
    let gram = total.matmul(&total.t()?)?;
    // Rounding can push tiny distances below zero
    let l2 = sq_norms
        .broadcast_add(&sq_norms.t()?)?
        .sub(&(gram * 2.0)?)?
        .relu()?;

    let pairs = (n * n - n).max(1) as f64;
    let mean_l2 = l2.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()? / pairs;
    let base = (mean_l2 / KERNEL_MUL.powi((KERNEL_NUM / 2) as i32)).max(1e-12);

    let mut kernels = Vec::with_capacity(KERNEL_NUM);
    for i in 0..KERNEL_NUM {
        let bandwidth = base * KERNEL_MUL.powi(i as i32);
        kernels.push((l2.clone() * (-1.0 / bandwidth))?.exp()?);
    }
    Tensor::stack(&kernels, 0)?.sum(0)
}

/// Multi-kernel maximum mean discrepancy between two feature batches
///
/// `weights` re-weights the samples of `b` (class-balance correction). A
/// `[batch, k]` weight tensor is reduced to one weight per sample by its row
/// mean.
pub fn mmd(a: &Tensor, b: &Tensor, weights: Option<&Tensor>) -> Result<Tensor> {
    let m = a.dim(0)?;
    let n = b.dim(0)?;
    let kernels = gaussian_kernel(a, b)?;

    let xx = kernels.narrow(0, 0, m)?.narrow(1, 0, m)?;
    let yy = kernels.narrow(0, m, n)?.narrow(1, m, n)?;
    let xy = kernels.narrow(0, 0, m)?.narrow(1, m, n)?;
    let yx = kernels.narrow(0, m, n)?.narrow(1, 0, m)?;

    match weights {
        None => {
            let loss = (xx.mean_all()? + yy.mean_all()?)?;
            loss.sub(&(xy.mean_all()? + yx.mean_all()?)?)
        }
        Some(w) => {
            let w = match w.rank() {
                1 => w.clone(),
                2 => w.mean(1)?,
                r => bail!("mmd weights must be rank 1 or 2, got rank {}", r),
            };
            if w.dim(0)? != n {
                bail!("mmd weights cover {} samples, expected {}", w.dim(0)?, n);
            }
            let w = w.to_dtype(kernels.dtype())?;
            let w_row = w.reshape((1, n))?;
            let w_col = w.reshape((n, 1))?;

            let yy = yy.broadcast_mul(&w_col.matmul(&w_row)?)?;
            let xy = xy.broadcast_mul(&w_row)?;
            let yx = yx.broadcast_mul(&w_col)?;

            let loss = (xx.mean_all()? + yy.mean_all()?)?;
            loss.sub(&(xy.mean_all()? + yx.mean_all()?)?)
        }
    }
}

/// Sum of `mmd` over every unordered pair of feature batches
///
/// Returns the summed loss and the number of pairs, `n * (n - 1) / 2`.
pub fn pairwise_mmd(features: &[Tensor]) -> Result<(Tensor, usize)> {
    let first = match features.first() {
        Some(f) => f,
        None => bail!("pairwise_mmd needs at least one feature batch"),
    };

    let mut total = Tensor::zeros((), first.dtype(), first.device())?;
    let mut pairs = 0;
    for i in 0..features.len() {
        for j in (i + 1)..features.len() {
            total = (total + mmd(&features[i], &features[j], None)?)?;
            pairs += 1;
        }
    }
    Ok((total, pairs))
}

/// Wasserstein-GP regularizer: `mean((‖∇D(x̂)‖₂ − 1)²)` at random
/// interpolates `x̂` between `real` and `fake`
pub fn gradient_penalty<C: Critic + ?Sized>(critic: &C, real: &Tensor, fake: &Tensor) -> Result<Tensor> {
    let batch = real.dim(0)?;
    if fake.dim(0)? != batch {
        bail!(
            "gradient_penalty needs equal batches, got {} and {}",
            batch,
            fake.dim(0)?
        );
    }

    let alpha = Tensor::rand(0f32, 1f32, (batch, 1), real.device())?.to_dtype(real.dtype())?;
    let interpolates = (alpha.broadcast_mul(real)? + alpha.affine(-1.0, 1.0)?.broadcast_mul(fake)?)?;

    let grads = critic.input_gradient(&interpolates)?;
    let norms = grads.sqr()?.sum(1)?.sqrt()?;
    norms.affine(1.0, -1.0)?.sqr()?.mean_all()
}

/// Critic loss `−ΣD(real) + ΣD(fake) + 10·GP`, and the scores on `fake`
pub fn wasserstein_critic_loss<C: Critic + ?Sized>(
    critic: &C,
    real: &Tensor,
    fake: &Tensor,
) -> Result<(Tensor, Tensor)> {
    let real_scores = critic.score(real)?;
    let fake_scores = critic.score(fake)?;
    let penalty = gradient_penalty(critic, real, fake)?;

    let loss = (fake_scores.sum_all()? - real_scores.sum_all()?)?;
    let loss = (loss + (penalty * GRADIENT_PENALTY_WEIGHT)?)?;
    Ok((loss, fake_scores))
}

/// Weighted entropy of the known-class distribution
///
/// `−Σᵢ (wᵢ / Σw) Σₖ pᵢₖ log pᵢₖ` with `weights` `[batch]` (typically the
/// probability of *not* being unknown) and `class_probs` `[batch, known]`.
pub fn entropy_shared_private_loss(weights: &Tensor, class_probs: &Tensor) -> Result<Tensor> {
    let weights = weights.flatten_all()?;
    let normalized = weights.broadcast_div(&weights.sum_all()?)?;

    let entropy = class_probs
        .mul(&safe_log(class_probs)?)?
        .sum(1)?
        .neg()?;
    normalized.mul(&entropy)?.sum_all()
}

/// Pushes up the unknown-class probability of the samples that already sit
/// at or above the batch mean: `−Σ_{pᵢ ≥ mean} log pᵢ / batch`
pub fn unknown_class_loss(unknown_probs: &Tensor) -> Result<Tensor> {
    let probs = unknown_probs.flatten_all()?;
    let batch = probs.dim(0)?;

    let mean = probs.mean_all()?;
    let mask = probs.broadcast_ge(&mean)?.to_dtype(probs.dtype())?;
    let selected = mask.mul(&safe_log(&probs)?)?.sum_all()?;
    selected.neg()? / batch as f64
}

/// Constant domain-index labels `[output.dim(0)]` for domain-identity losses
pub fn gate_label(output: &Tensor, domain_index: usize) -> Result<Tensor> {
    let n = output.dim(0)?;
    Tensor::from_vec(vec![domain_index as u32; n], n, output.device())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, D};

    /// Linear critic `D(x) = x·w`, whose input gradient is `w` for every row
    struct LinearCritic {
        w: Tensor,
    }

    impl Critic for LinearCritic {
        fn score(&self, xs: &Tensor) -> Result<Tensor> {
            xs.matmul(&self.w)
        }

        fn input_gradient(&self, xs: &Tensor) -> Result<Tensor> {
            self.w.t()?.broadcast_as(xs.shape())?.contiguous()
        }
    }

    #[test]
    fn test_mmd_reflexive() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (8, 16), &device)?;

        let loss = mmd(&x, &x, None)?.to_scalar::<f32>()?;
        assert!(loss.abs() < 1e-5, "mmd(X, X) = {}", loss);

        Ok(())
    }

    #[test]
    fn test_mmd_separates_shifted_batches() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (16, 4), &device)?;
        let y = (Tensor::randn(0f32, 1.0, (16, 4), &device)? + 5.0)?;

        let near = mmd(&x, &x, None)?.to_scalar::<f32>()?;
        let far = mmd(&x, &y, None)?.to_scalar::<f32>()?;
        assert!(far > near + 0.1);

        Ok(())
    }

    #[test]
    fn test_weighted_mmd_unit_weights_match_plain() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (6, 5), &device)?;
        let y = Tensor::randn(0f32, 1.0, (6, 5), &device)?;
        let ones = Tensor::ones((6, 1), DType::F32, &device)?;

        let plain = mmd(&x, &y, None)?.to_scalar::<f32>()?;
        let weighted = mmd(&x, &y, Some(&ones))?.to_scalar::<f32>()?;
        assert!((plain - weighted).abs() < 1e-5);

        Ok(())
    }

    #[test]
    fn test_pairwise_counts() -> Result<()> {
        let device = Device::Cpu;
        let feats: Vec<Tensor> = (0..3)
            .map(|_| Tensor::randn(0f32, 1.0, (4, 8), &device))
            .collect::<Result<_>>()?;

        let (_, pairs) = pairwise_mmd(&feats[..2])?;
        assert_eq!(pairs, 1);
        let (_, pairs) = pairwise_mmd(&feats)?;
        assert_eq!(pairs, 3);
        let (loss, pairs) = pairwise_mmd(&feats[..1])?;
        assert_eq!(pairs, 0);
        assert_eq!(loss.to_scalar::<f32>()?, 0.0);

        Ok(())
    }

    #[test]
    fn test_gradient_penalty_non_negative() -> Result<()> {
        let device = Device::Cpu;
        let critic = LinearCritic {
            w: Tensor::randn(0f32, 1.0, (8, 1), &device)?,
        };

        for _ in 0..5 {
            let real = Tensor::randn(0f32, 1.0, (4, 8), &device)?;
            let fake = Tensor::randn(0f32, 3.0, (4, 8), &device)?;
            let gp = gradient_penalty(&critic, &real, &fake)?.to_scalar::<f32>()?;
            assert!(gp >= 0.0);
        }

        Ok(())
    }

    #[test]
    fn test_gradient_penalty_zero_for_unit_gradient() -> Result<()> {
        let device = Device::Cpu;
        let critic = LinearCritic {
            w: Tensor::new(&[[0.6f32], [0.8]], &device)?,
        };
        let real = Tensor::randn(0f32, 1.0, (4, 2), &device)?;
        let fake = Tensor::randn(0f32, 1.0, (4, 2), &device)?;

        let gp = gradient_penalty(&critic, &real, &fake)?.to_scalar::<f32>()?;
        assert!(gp.abs() < 1e-6);

        Ok(())
    }

    #[test]
    fn test_gradient_penalty_rejects_uneven_batches() -> Result<()> {
        let device = Device::Cpu;
        let critic = LinearCritic {
            w: Tensor::ones((3, 1), DType::F32, &device)?,
        };
        let real = Tensor::zeros((4, 3), DType::F32, &device)?;
        let fake = Tensor::zeros((2, 3), DType::F32, &device)?;
        assert!(gradient_penalty(&critic, &real, &fake).is_err());
        Ok(())
    }

    #[test]
    fn test_entropy_loss_uniform_vs_confident() -> Result<()> {
        let device = Device::Cpu;
        let weights = Tensor::new(&[1f32, 1.0], &device)?;
        let uniform = Tensor::new(&[[0.5f32, 0.5], [0.5, 0.5]], &device)?;
        let confident = Tensor::new(&[[0.999f32, 0.001], [0.001, 0.999]], &device)?;

        let high = entropy_shared_private_loss(&weights, &uniform)?.to_scalar::<f32>()?;
        let low = entropy_shared_private_loss(&weights, &confident)?.to_scalar::<f32>()?;

        assert!((high - std::f32::consts::LN_2).abs() < 1e-5);
        assert!(low < high);
        Ok(())
    }

    #[test]
    fn test_unknown_loss_uses_above_mean_samples() -> Result<()> {
        let device = Device::Cpu;
        // mean 0.4: only 0.8 contributes, -ln(0.8) / 3
        let probs = Tensor::new(&[0.8f32, 0.2, 0.2], &device)?;
        let loss = unknown_class_loss(&probs)?.to_scalar::<f32>()?;
        assert!((loss - (-(0.8f32).ln() / 3.0)).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_gate_label() -> Result<()> {
        let device = Device::Cpu;
        let output = Tensor::zeros((7, 3), DType::F32, &device)?;

        let labels = gate_label(&output, 2)?;
        assert_eq!(labels.dims(), &[7]);
        assert!(labels.to_vec1::<u32>()?.iter().all(|&l| l == 2));

        let argmax = output.argmax(D::Minus1)?;
        assert_eq!(argmax.dtype(), labels.dtype());
        Ok(())
    }

    #[test]
    fn test_gate_label_drives_nll() -> Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::new(
            &[[0.1f32, 0.2, 0.7], [1.0, 0.0, 0.5], [0.3, 0.3, 0.3], [2.0, -1.0, 0.0]],
            &device,
        )?;
        let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;

        let labels = gate_label(&log_probs, 2)?;
        assert!(labels.is_contiguous());

        // nll picks column 2 of every row
        let loss = candle_nn::loss::nll(&log_probs, &labels)?.to_scalar::<f32>()?;
        let expected = log_probs.narrow(1, 2, 1)?.mean_all()?.neg()?.to_scalar::<f32>()?;
        assert!((loss - expected).abs() < 1e-6);

        let ce = candle_nn::loss::cross_entropy(&logits, &labels)?.to_scalar::<f32>()?;
        assert!((ce - expected).abs() < 1e-6);
        Ok(())
    }
}
