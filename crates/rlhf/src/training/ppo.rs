//! PPO loss functions.

use candle_core::{DType, Tensor, D};

/// Log-ratios are clamped to `[-MAX_LOG_RATIO, MAX_LOG_RATIO]` before `exp`.
pub const MAX_LOG_RATIO: f64 = 20.0;

/// Compute PPO clipped policy loss
///
/// `-mean(min(ratio * adv, clip(ratio, 1 - c, 1 + c) * adv))`
///
/// # Arguments
/// * `advantages` - Whitened advantages [M, L]
/// * `log_probs` - Log probs under the current policy [M, L]
/// * `old_log_probs` - Log probs recorded at rollout time [M, L]
/// * `cliprange` - Ratio clip coefficient
///
/// # Returns
/// Scalar loss and the fraction of positions where the clipped term won
pub fn ppo_policy_loss(
    advantages: &Tensor,
    log_probs: &Tensor,
    old_log_probs: &Tensor,
    cliprange: f64,
) -> candle_core::Result<(Tensor, Tensor)> {
    let log_ratio = (log_probs - old_log_probs)?.clamp(-MAX_LOG_RATIO, MAX_LOG_RATIO)?;
    let ratio = log_ratio.exp()?;

    let pg_losses = (advantages.neg()? * &ratio)?;
    let pg_losses2 =
        (advantages.neg()? * ratio.clamp(1.0 - cliprange, 1.0 + cliprange)?)?;

    let loss = pg_losses.maximum(&pg_losses2)?.mean_all()?;
    let clipfrac = pg_losses2.gt(&pg_losses)?.to_dtype(DType::F32)?.mean_all()?;
    Ok((loss, clipfrac))
}

/// Compute clipped value loss
///
/// `mean(max((v - R)^2, (clip(v, v_old - c, v_old + c) - R)^2))`, unweighted.
///
/// # Arguments
/// * `values` - Current value predictions [M, L]
/// * `old_values` - Values recorded at rollout time [M, L]
/// * `returns` - GAE returns [M, L]
/// * `cliprange_value` - Value clip coefficient
///
/// # Returns
/// Scalar loss and the fraction of positions where the clipped term won
pub fn ppo_value_loss(
    values: &Tensor,
    old_values: &Tensor,
    returns: &Tensor,
    cliprange_value: f64,
) -> candle_core::Result<(Tensor, Tensor)> {
    let values_clipped =
        (old_values + (values - old_values)?.clamp(-cliprange_value, cliprange_value)?)?;

    let vf_losses1 = (values - returns)?.sqr()?;
    let vf_losses2 = (&values_clipped - returns)?.sqr()?;

    let loss = vf_losses1.maximum(&vf_losses2)?.mean_all()?;
    let clipfrac = vf_losses2.gt(&vf_losses1)?.to_dtype(DType::F32)?.mean_all()?;
    Ok((loss, clipfrac))
}

/// Mean per-position entropy of the distributions given by `logits` `[.., vocab]`.
pub fn mean_entropy(logits: &Tensor) -> candle_core::Result<Tensor> {
    let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    let probs = log_probs.exp()?;
    (probs * log_probs)?.sum(D::Minus1)?.neg()?.mean_all()
}

/// Scalar diagnostics from one mini-batch loss evaluation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LossStats {
    pub policy_loss: f64,
    pub value_loss: f64,
    pub total_loss: f64,
    pub entropy: f64,
    pub approxkl: f64,
    pub policykl: f64,
    pub clipfrac: f64,
    pub vf_clipfrac: f64,
    pub vpred: f64,
    pub val_error: f64,
}

impl LossStats {
    /// Field-wise mean over mini-batch steps
    pub fn mean(steps: &[LossStats]) -> LossStats {
        if steps.is_empty() {
            return LossStats::default();
        }
        let n = steps.len() as f64;
        let avg = |f: fn(&LossStats) -> f64| steps.iter().map(f).sum::<f64>() / n;
        LossStats {
            policy_loss: avg(|s| s.policy_loss),
            value_loss: avg(|s| s.value_loss),
            total_loss: avg(|s| s.total_loss),
            entropy: avg(|s| s.entropy),
            approxkl: avg(|s| s.approxkl),
            policykl: avg(|s| s.policykl),
            clipfrac: avg(|s| s.clipfrac),
            vf_clipfrac: avg(|s| s.vf_clipfrac),
            vpred: avg(|s| s.vpred),
            val_error: avg(|s| s.val_error),
        }
    }
}

/// Inputs to [`ppo_loss`], all `[m, response_len]` except `logits`.
pub struct LossInputs<'a> {
    pub logits: &'a Tensor,
    pub log_probs: &'a Tensor,
    pub values: &'a Tensor,
    pub old_log_probs: &'a Tensor,
    pub old_values: &'a Tensor,
    pub advantages: &'a Tensor,
    pub returns: &'a Tensor,
}

/// Total PPO loss: `policy_loss + vf_coef * value_loss`.
///
/// # Arguments
/// * `inputs` - Current forward pass and stored rollout statistics
/// * `cliprange` - Ratio clip coefficient
/// * `cliprange_value` - Value clip coefficient
/// * `vf_coef` - Weight of the value loss
///
/// # Returns
/// Differentiable total loss and detached diagnostics
pub fn ppo_loss(
    inputs: &LossInputs<'_>,
    cliprange: f64,
    cliprange_value: f64,
    vf_coef: f64,
) -> candle_core::Result<(Tensor, LossStats)> {
    let (policy_loss, clipfrac) = ppo_policy_loss(
        inputs.advantages,
        inputs.log_probs,
        inputs.old_log_probs,
        cliprange,
    )?;
    let (value_loss, vf_clipfrac) = ppo_value_loss(
        inputs.values,
        inputs.old_values,
        inputs.returns,
        cliprange_value,
    )?;
    let total = (&policy_loss + (&value_loss * vf_coef)?)?;

    let diff = (inputs.log_probs - inputs.old_log_probs)?.detach();
    let policykl = scalar(&diff.mean_all()?)?;
    let approxkl = 0.5 * scalar(&diff.sqr()?.mean_all()?)?;
    let values = inputs.values.detach();

    let stats = LossStats {
        policy_loss: scalar(&policy_loss)?,
        value_loss: scalar(&value_loss)?,
        total_loss: scalar(&total)?,
        entropy: scalar(&mean_entropy(&inputs.logits.detach())?)?,
        approxkl,
        policykl,
        clipfrac: scalar(&clipfrac)?,
        vf_clipfrac: scalar(&vf_clipfrac)?,
        vpred: scalar(&values.mean_all()?)?,
        val_error: scalar(&(&values - inputs.returns)?.sqr()?.mean_all()?)?,
    };

    Ok((total, stats))
}

fn scalar(t: &Tensor) -> candle_core::Result<f64> {
    t.to_dtype(DType::F64)?.to_scalar::<f64>()
}
