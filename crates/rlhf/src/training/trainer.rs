//! PPO trainer: statistics, clipped updates and KL control for one round.

use super::buffer::RolloutBuffer;
use super::kl::{self, KlController};
use super::ppo::{ppo_loss, LossInputs, LossStats};
use super::sampler::ResponseSampler;
use super::stats::{
    batched_forward_pass, compute_gae_batch, compute_rewards, mean_var, response_forward,
    round_kl_mean, row_sums, whiten,
};
use crate::config::PpoConfig;
use crate::policy::{HasVarMap, SequencePolicy};
use crate::{Result, RlhfError};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::time::Instant;

/// Aggregate statistics for one round.
#[derive(Clone, Debug, Default)]
pub struct StepStats {
    /// Round index (0-based)
    pub round: u64,
    /// Coefficient used for this round's rewards
    pub kl_coef: f64,
    /// Mean over rollouts of summed per-token KL
    pub kl_mean: f64,
    pub kl_min: f64,
    pub kl_max: f64,
    /// Mean summed policy log-probability of a response
    pub logprobs: f64,
    /// Mean summed reference log-probability of a response
    pub ref_logprobs: f64,
    /// Mean summed negative log-probability of a response
    pub entropy: f64,
    pub mean_non_score_reward: f64,
    pub mean_scores: f64,
    /// Mini-batch statistics averaged over every optimizer step
    pub loss: LossStats,
    pub advantages_mean: f64,
    pub advantages_var: f64,
    pub returns_mean: f64,
    pub returns_var: f64,
    pub values_mean: f64,
    pub values_var: f64,
    pub var_explained: f64,
    pub time_forward_pass: f64,
    pub time_compute_rewards: f64,
    pub time_compute_advantages: f64,
    pub time_optimize_step: f64,
    pub time_total: f64,
}

impl StepStats {
    /// Flatten into named scalars for a metric logger
    pub fn to_metrics(&self) -> HashMap<String, f64> {
        let entries = [
            ("objective/kl", self.kl_mean),
            ("objective/kl_dist/min", self.kl_min),
            ("objective/kl_dist/max", self.kl_max),
            ("objective/logprobs", self.logprobs),
            ("objective/ref_logprobs", self.ref_logprobs),
            ("objective/kl_coef", self.kl_coef),
            ("objective/entropy", self.entropy),
            ("ppo/mean_non_score_reward", self.mean_non_score_reward),
            ("ppo/mean_scores", self.mean_scores),
            ("ppo/loss/policy", self.loss.policy_loss),
            ("ppo/loss/value", self.loss.value_loss),
            ("ppo/loss/total", self.loss.total_loss),
            ("ppo/policy/entropy", self.loss.entropy),
            ("ppo/policy/approxkl", self.loss.approxkl),
            ("ppo/policy/policykl", self.loss.policykl),
            ("ppo/policy/clipfrac", self.loss.clipfrac),
            ("ppo/policy/advantages_mean", self.advantages_mean),
            ("ppo/policy/advantages_var", self.advantages_var),
            ("ppo/returns/mean", self.returns_mean),
            ("ppo/returns/var", self.returns_var),
            ("ppo/val/vpred", self.loss.vpred),
            ("ppo/val/error", self.loss.val_error),
            ("ppo/val/clipfrac", self.loss.vf_clipfrac),
            ("ppo/val/mean", self.values_mean),
            ("ppo/val/var", self.values_var),
            ("ppo/val/var_explained", self.var_explained),
            ("time/ppo/forward_pass", self.time_forward_pass),
            ("time/ppo/compute_rewards", self.time_compute_rewards),
            ("time/ppo/compute_advantages", self.time_compute_advantages),
            ("time/ppo/optimize_step", self.time_optimize_step),
            ("time/ppo/total", self.time_total),
        ];
        entries
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect()
    }
}

/// PPO trainer for a sequence policy against a frozen reference.
///
/// Owns the trainable policy, the reference, the optimizer and the KL
/// controller. `step` is the only place policy parameters change.
pub struct PpoTrainer<P: SequencePolicy + HasVarMap, R: SequencePolicy> {
    config: PpoConfig,
    policy: P,
    ref_policy: R,
    optimizer: AdamW,
    kl_ctl: Box<dyn KlController>,
    sampler: ResponseSampler,
    rng: StdRng,
    round: u64,
}

impl<P: SequencePolicy + HasVarMap, R: SequencePolicy> PpoTrainer<P, R> {
    /// Create a new trainer; the configuration is validated here.
    pub fn new(policy: P, ref_policy: R, config: PpoConfig) -> Result<Self> {
        config.validate()?;

        let optimizer = AdamW::new(
            policy.var_map().all_vars(),
            ParamsAdamW {
                lr: config.lr,
                weight_decay: 0.0,
                ..ParamsAdamW::default()
            },
        )?;

        tracing::info!(
            parameters = policy.num_parameters(),
            batch_size = config.batch_size,
            ppo_epochs = config.ppo_epochs,
            "Initialized PPO trainer"
        );

        Ok(Self {
            kl_ctl: kl::from_config(&config),
            sampler: ResponseSampler::from_config(&config),
            rng: StdRng::seed_from_u64(config.seed),
            config,
            policy,
            ref_policy,
            optimizer,
            round: 0,
        })
    }

    /// Replace the KL controller chosen from the configuration.
    pub fn with_kl_controller(mut self, controller: Box<dyn KlController>) -> Self {
        self.kl_ctl = controller;
        self
    }

    pub fn config(&self) -> &PpoConfig {
        &self.config
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn ref_policy(&self) -> &R {
        &self.ref_policy
    }

    /// Current KL penalty coefficient
    pub fn kl_coef(&self) -> f64 {
        self.kl_ctl.value()
    }

    /// Rounds completed so far
    pub fn round(&self) -> u64 {
        self.round
    }

    /// Shared random stream for sampling, shuffling and prompt selection
    pub fn rng_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Sample one fixed-length response per prompt from the trainable policy.
    pub fn generate(&mut self, queries: &[Vec<u32>]) -> Result<Vec<Vec<u32>>> {
        self.sampler.generate(&self.policy, queries, &mut self.rng)
    }

    /// Run one PPO round on scored rollouts and update the KL coefficient.
    pub fn step(
        &mut self,
        queries: Vec<Vec<u32>>,
        responses: Vec<Vec<u32>>,
        scores: Vec<f32>,
    ) -> Result<StepStats> {
        self.check_round_shape(&queries, &responses, &scores)?;
        let start = Instant::now();
        let kl_coef = self.kl_ctl.value();
        let fbs = self.config.forward_batch_size;

        let timer = Instant::now();
        let (logprobs, values) = batched_forward_pass(&self.policy, &queries, &responses, fbs)?;
        let (ref_logprobs, _) = batched_forward_pass(&self.ref_policy, &queries, &responses, fbs)?;
        let time_forward_pass = timer.elapsed().as_secs_f64();

        let timer = Instant::now();
        let (rewards, non_score_rewards, kl) =
            compute_rewards(&scores, &logprobs, &ref_logprobs, kl_coef)?;
        let time_compute_rewards = timer.elapsed().as_secs_f64();

        let timer = Instant::now();
        let (raw_advantages, returns) =
            compute_gae_batch(&rewards, &values, self.config.gamma, self.config.lam);
        let advantages = whiten(&raw_advantages);
        let time_compute_advantages = timer.elapsed().as_secs_f64();

        let buffer = RolloutBuffer {
            queries,
            responses,
            scores,
            logprobs,
            ref_logprobs,
            values,
            kl_mean: round_kl_mean(&kl),
            kl,
            rewards,
            non_score_rewards,
            advantages,
            raw_advantages,
            returns,
        };

        let timer = Instant::now();
        let loss = self.optimize(&buffer)?;
        let time_optimize_step = timer.elapsed().as_secs_f64();

        self.kl_ctl.update(buffer.kl_mean, self.config.batch_size);

        let mut stats = round_stats(&buffer, kl_coef, loss);
        stats.round = self.round;
        stats.time_forward_pass = time_forward_pass;
        stats.time_compute_rewards = time_compute_rewards;
        stats.time_compute_advantages = time_compute_advantages;
        stats.time_optimize_step = time_optimize_step;
        stats.time_total = start.elapsed().as_secs_f64();

        tracing::debug!(
            round = self.round,
            kl = stats.kl_mean,
            kl_coef,
            next_kl_coef = self.kl_ctl.value(),
            policy_loss = stats.loss.policy_loss,
            value_loss = stats.loss.value_loss,
            "PPO step"
        );

        self.round += 1;
        Ok(stats)
    }

    /// `ppo_epochs` passes over the buffer in shuffled mini-batches.
    fn optimize(&mut self, buffer: &RolloutBuffer) -> Result<LossStats> {
        let device = self.policy.device().clone();
        let mut steps = Vec::with_capacity(self.config.ppo_epochs * buffer.len());

        for epoch in 0..self.config.ppo_epochs {
            let batches = buffer.minibatch_indices(self.config.mini_batch_size, &mut self.rng);
            for (minibatch, indices) in batches.iter().enumerate() {
                let batch = buffer.minibatch(indices, &device)?;
                let forward = response_forward(&self.policy, &batch.input_ids, batch.query_len)?;

                let inputs = LossInputs {
                    logits: &forward.logits,
                    log_probs: &forward.logprobs,
                    values: &forward.values,
                    old_log_probs: &batch.old_logprobs,
                    old_values: &batch.old_values,
                    advantages: &batch.advantages,
                    returns: &batch.returns,
                };
                let (loss, stats) = ppo_loss(
                    &inputs,
                    self.config.cliprange,
                    self.config.cliprange_value,
                    self.config.vf_coef,
                )?;

                if !stats.total_loss.is_finite() {
                    tracing::error!(epoch, minibatch, loss = stats.total_loss, "Non-finite loss");
                    return Err(RlhfError::NonFiniteLoss {
                        epoch,
                        minibatch,
                        loss: stats.total_loss,
                    });
                }

                self.optimizer.backward_step(&loss)?;
                steps.push(stats);
            }
        }

        Ok(LossStats::mean(&steps))
    }

    fn check_round_shape(
        &self,
        queries: &[Vec<u32>],
        responses: &[Vec<u32>],
        scores: &[f32],
    ) -> Result<()> {
        let batch_size = self.config.batch_size;
        for len in [queries.len(), responses.len(), scores.len()] {
            if len != batch_size {
                return Err(RlhfError::ShapeMismatch {
                    expected: vec![batch_size],
                    actual: vec![len],
                });
            }
        }

        let expected = vec![self.config.txt_in_len, self.config.txt_out_len];
        for (query, response) in queries.iter().zip(responses) {
            if query.len() != expected[0] || response.len() != expected[1] {
                return Err(RlhfError::ShapeMismatch {
                    expected,
                    actual: vec![query.len(), response.len()],
                });
            }
        }
        Ok(())
    }
}

fn round_stats(buffer: &RolloutBuffer, kl_coef: f64, loss: LossStats) -> StepStats {
    let kl_sums = row_sums(&buffer.kl);
    let logprob_sums = row_sums(&buffer.logprobs);
    let logprobs = logprob_sums.mean().unwrap_or(0.0);
    let (advantages_mean, advantages_var) = mean_var(&buffer.raw_advantages);
    let (returns_mean, returns_var) = mean_var(&buffer.returns);
    let (values_mean, values_var) = mean_var(&buffer.values);
    let (_, residual_var) = mean_var(&(&buffer.returns - &buffer.values));
    let var_explained = if returns_var > 0.0 {
        1.0 - residual_var / returns_var
    } else {
        0.0
    };

    StepStats {
        kl_coef,
        kl_mean: buffer.kl_mean,
        kl_min: kl_sums.fold(f64::INFINITY, |a, &b| a.min(b)),
        kl_max: kl_sums.fold(f64::NEG_INFINITY, |a, &b| a.max(b)),
        logprobs,
        ref_logprobs: row_sums(&buffer.ref_logprobs).mean().unwrap_or(0.0),
        entropy: -logprobs,
        mean_non_score_reward: row_sums(&buffer.non_score_rewards).mean().unwrap_or(0.0),
        mean_scores: Array1::from_iter(buffer.scores.iter().map(|&s| f64::from(s)))
            .mean()
            .unwrap_or(0.0),
        loss,
        advantages_mean,
        advantages_var,
        returns_mean,
        returns_var,
        values_mean,
        values_var,
        var_explained,
        ..StepStats::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{PolicyOutput, TinyLm, TinyLmConfig};
    use candle_core::{DType, Device, Tensor, Var};
    use candle_nn::{Init, VarMap};

    /// Uniform over the first `support` of `vocab` tokens; values come from one trainable bias.
    struct UniformPolicy {
        support: usize,
        vocab: usize,
        var_map: VarMap,
        bias: Tensor,
        device: Device,
    }

    impl UniformPolicy {
        fn new(support: usize, vocab: usize, bias: f64) -> Self {
            let device = Device::Cpu;
            let var_map = VarMap::new();
            let bias = var_map
                .get((1, 1), "v_bias", Init::Const(bias), DType::F32, &device)
                .unwrap();
            Self {
                support,
                vocab,
                var_map,
                bias,
                device,
            }
        }
    }

    impl SequencePolicy for UniformPolicy {
        fn forward(&self, input_ids: &Tensor) -> candle_core::Result<PolicyOutput> {
            let (batch, seq) = input_ids.dims2()?;
            let row: Vec<f32> = (0..self.vocab)
                .map(|i| if i < self.support { 0.0 } else { -1e9 })
                .collect();
            let logits = Tensor::from_vec(row, (1, 1, self.vocab), &self.device)?
                .broadcast_as((batch, seq, self.vocab))?
                .contiguous()?;
            let values = self.bias.broadcast_as((batch, seq))?;
            Ok(PolicyOutput { logits, values })
        }

        fn device(&self) -> &Device {
            &self.device
        }
    }

    impl HasVarMap for UniformPolicy {
        fn var_map(&self) -> &VarMap {
            &self.var_map
        }
    }

    fn small_config() -> PpoConfig {
        PpoConfig::default()
            .with_batch_size(4, 2)
            .with_mini_batch_size(2)
            .with_lengths(2, 3)
            .with_ppo_epochs(2)
            .with_lr(1e-2)
    }

    fn snapshot(var_map: &VarMap) -> Vec<Vec<f32>> {
        let mut vars: Vec<(String, Var)> = var_map
            .data()
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        vars.iter()
            .map(|(_, v)| v.as_tensor().flatten_all().unwrap().to_vec1().unwrap())
            .collect()
    }

    #[test]
    fn test_kl_at_target_leaves_coefficient_unchanged() {
        let queries = vec![vec![0, 1]; 4];
        let responses = vec![vec![1, 0, 1]; 4];

        // Probe the exact round KL these two policies produce.
        let probe_policy = UniformPolicy::new(2, 4, 0.0);
        let probe_ref = UniformPolicy::new(4, 4, 0.0);
        let (lp, _) = batched_forward_pass(&probe_policy, &queries, &responses, 2).unwrap();
        let (ref_lp, _) = batched_forward_pass(&probe_ref, &queries, &responses, 2).unwrap();
        let (_, _, kl) = compute_rewards(&[0.0; 4], &lp, &ref_lp, 0.2).unwrap();
        let target = round_kl_mean(&kl);
        assert!((target - 3.0 * 2f64.ln()).abs() < 1e-5);

        let config = small_config().with_kl(0.2, target, 10_000.0);
        let mut trainer = PpoTrainer::new(
            UniformPolicy::new(2, 4, 0.0),
            UniformPolicy::new(4, 4, 0.0),
            config,
        )
        .unwrap();

        let stats = trainer.step(queries, responses, vec![1.0; 4]).unwrap();
        assert_eq!(stats.kl_mean, target);
        assert_eq!(stats.kl_coef, 0.2);
        assert_eq!(trainer.kl_coef(), 0.2);
    }

    #[test]
    fn test_kl_above_target_raises_coefficient() {
        let config = small_config().with_kl(0.2, 0.5, 10_000.0);
        let mut trainer = PpoTrainer::new(
            UniformPolicy::new(2, 4, 0.0),
            UniformPolicy::new(4, 4, 0.0),
            config,
        )
        .unwrap();

        trainer
            .step(vec![vec![0, 1]; 4], vec![vec![1, 0, 1]; 4], vec![0.0; 4])
            .unwrap();
        assert!(trainer.kl_coef() > 0.2);
    }

    #[test]
    fn test_step_updates_policy_not_reference() {
        let policy = TinyLm::new(TinyLmConfig::new(8), &Device::Cpu).unwrap();
        let reference = policy.frozen_copy().unwrap();
        let mut trainer = PpoTrainer::new(policy, reference, small_config()).unwrap();

        let before_policy = snapshot(trainer.policy().var_map());
        let before_ref = snapshot(trainer.ref_policy().var_map());

        let queries = vec![vec![1, 2], vec![3, 4], vec![5, 6], vec![7, 0]];
        let responses = trainer.generate(&queries).unwrap();
        assert!(responses.iter().all(|r| r.len() == 3));

        let stats = trainer
            .step(queries, responses, vec![1.0, -1.0, 0.5, 2.0])
            .unwrap();

        assert_ne!(snapshot(trainer.policy().var_map()), before_policy);
        assert_eq!(snapshot(trainer.ref_policy().var_map()), before_ref);
        assert_eq!(trainer.round(), 1);
        assert_eq!(stats.round, 0);

        // First round: policy equals reference, so no KL and no penalty.
        assert!(stats.kl_mean.abs() < 1e-5);
        assert!((stats.mean_scores - 0.625).abs() < 1e-6);
        for (name, value) in stats.to_metrics() {
            assert!(value.is_finite(), "{name} = {value}");
        }
    }

    #[test]
    fn test_metrics_keys() {
        let metrics = StepStats::default().to_metrics();
        for key in [
            "objective/kl",
            "objective/kl_coef",
            "ppo/loss/policy",
            "ppo/loss/value",
            "ppo/policy/advantages_mean",
            "ppo/policy/advantages_var",
            "ppo/val/var_explained",
            "time/ppo/total",
        ] {
            assert!(metrics.contains_key(key), "missing {key}");
        }
    }

    #[test]
    fn test_rejects_wrong_round_size() {
        let policy = TinyLm::new(TinyLmConfig::new(8), &Device::Cpu).unwrap();
        let reference = policy.frozen_copy().unwrap();
        let mut trainer = PpoTrainer::new(policy, reference, small_config()).unwrap();

        let err = trainer
            .step(vec![vec![1, 2]; 3], vec![vec![1, 2, 3]; 3], vec![0.0; 3])
            .unwrap_err();
        assert!(matches!(err, RlhfError::ShapeMismatch { .. }));

        let err = trainer
            .step(vec![vec![1, 2]; 4], vec![vec![1, 2]; 4], vec![0.0; 4])
            .unwrap_err();
        assert!(matches!(err, RlhfError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_non_finite_loss_aborts_before_update() {
        let config = small_config();
        let mut trainer = PpoTrainer::new(
            UniformPolicy::new(2, 4, f64::NAN),
            UniformPolicy::new(4, 4, 0.0),
            config,
        )
        .unwrap();

        let err = trainer
            .step(vec![vec![0, 1]; 4], vec![vec![1, 0, 1]; 4], vec![1.0; 4])
            .unwrap_err();
        assert!(matches!(
            err,
            RlhfError::NonFiniteLoss {
                epoch: 0,
                minibatch: 0,
                ..
            }
        ));
        assert_eq!(trainer.round(), 0);
        assert_eq!(trainer.kl_coef(), 0.2);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let policy = TinyLm::new(TinyLmConfig::new(8), &Device::Cpu).unwrap();
        let reference = policy.frozen_copy().unwrap();
        let config = PpoConfig::default().with_batch_size(10, 3);
        assert!(matches!(
            PpoTrainer::new(policy, reference, config),
            Err(RlhfError::Config(_))
        ));
    }
}
