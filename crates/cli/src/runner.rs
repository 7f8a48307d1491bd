//! Synthetic workload runner.
//!
//! Builds random dense expert weights and activations from a seed, packs the
//! weights into Marlin layout, runs the grouped GEMM (or the fused two-GEMM
//! MoE), checks the result against a dense computation on the dequantized
//! weights and reports timings.

use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use marlin_moe_core::moe::{
    marlin_gemm_moe, topk_softmax, FusedMarlinMoEConfig, MarlinMoELayer, MarlinMoeBlockConfig,
    MarlinMoeWorkspace, MoETokenGrouper, TopKSoftmaxConfig,
};
use marlin_moe_core::quantization::{marlin_quantize_experts, MarlinMoeQuantConfig};
use marlin_moe_core::testing::{dense_reference, max_rel_error, swiglu_reference};

use crate::config::BenchConfig;

/// Workload kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    /// One grouped GEMM with weighted top-k reduction.
    Gemm,
    /// Gate+up GEMM, SiLU-and-mul, down GEMM.
    Fused,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gemm => "gemm",
            Self::Fused => "fused",
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "gemm" => Ok(Self::Gemm),
            "fused" => Ok(Self::Fused),
            other => bail!("unknown mode '{other}', expected 'gemm' or 'fused'"),
        }
    }
}

/// Fully resolved run settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    pub mode: Mode,
    pub num_tokens: usize,
    pub size_n: usize,
    pub size_k: usize,
    pub intermediate_size: usize,
    pub num_experts: usize,
    pub topk: usize,
    pub bits: u32,
    pub group_size: i32,
    pub moe_block_size: Option<usize>,
    pub iterations: usize,
    pub warmup: usize,
    pub seed: u64,
    pub tolerance: f32,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            mode: Mode::Gemm,
            num_tokens: 64,
            size_n: 512,
            size_k: 512,
            intermediate_size: 256,
            num_experts: 8,
            topk: 2,
            bits: 4,
            group_size: 128,
            moe_block_size: None,
            iterations: 10,
            warmup: 2,
            seed: 0,
            tolerance: 1e-3,
        }
    }
}

impl RunSettings {
    /// Fill unset values of `config` with defaults.
    pub fn resolve(config: &BenchConfig) -> anyhow::Result<Self> {
        let d = Self::default();
        let mode = match &config.mode {
            Some(m) => m.parse()?,
            None => d.mode,
        };
        let settings = Self {
            mode,
            num_tokens: config.num_tokens.unwrap_or(d.num_tokens),
            size_n: config.size_n.unwrap_or(d.size_n),
            size_k: config.size_k.unwrap_or(d.size_k),
            intermediate_size: config.intermediate_size.unwrap_or(d.intermediate_size),
            num_experts: config.num_experts.unwrap_or(d.num_experts),
            topk: config.topk.unwrap_or(d.topk),
            bits: config.bits.unwrap_or(d.bits),
            group_size: config.group_size.unwrap_or(d.group_size),
            moe_block_size: config.moe_block_size.or(d.moe_block_size),
            iterations: config.iterations.unwrap_or(d.iterations),
            warmup: config.warmup.unwrap_or(d.warmup),
            seed: config.seed.unwrap_or(d.seed),
            tolerance: config.tolerance.unwrap_or(d.tolerance),
        };
        if settings.iterations == 0 {
            bail!("iterations must be at least 1");
        }
        if settings.num_tokens == 0 {
            bail!("num_tokens must be at least 1");
        }
        Ok(settings)
    }

    fn quant(&self) -> MarlinMoeQuantConfig {
        MarlinMoeQuantConfig {
            bits: self.bits,
            group_size: self.group_size,
            desc_act: false,
            is_sym: true,
        }
    }
}

/// Outcome of one run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub mode: Mode,
    pub moe_block_size: usize,
    pub max_rel_error: f32,
    pub mean: Duration,
    pub min: Duration,
    /// Multiply-accumulates per call, counting every routed slot.
    pub macs: u64,
}

impl RunReport {
    pub fn gflops(&self) -> f64 {
        let secs = self.mean.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        2.0 * self.macs as f64 / secs / 1e9
    }
}

fn uniform(rng: &mut StdRng, len: usize, scale: f32) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(-1.0f32..1.0) * scale).collect()
}

fn time_calls(
    warmup: usize,
    iterations: usize,
    mut call: impl FnMut() -> anyhow::Result<Tensor>,
) -> anyhow::Result<(Tensor, Duration, Duration)> {
    for _ in 0..warmup {
        call()?;
    }
    let mut total = Duration::ZERO;
    let mut min = Duration::MAX;
    let mut last = None;
    for _ in 0..iterations {
        let start = Instant::now();
        let out = call()?;
        let elapsed = start.elapsed();
        total += elapsed;
        min = min.min(elapsed);
        last = Some(out);
    }
    let out = last.context("no iterations were run")?;
    Ok((out, total.div_f64(iterations as f64), min))
}

fn to_vec(t: &Tensor) -> anyhow::Result<Vec<f32>> {
    Ok(t.flatten_all()?.to_vec1()?)
}

/// Run the workload described by `settings`.
pub fn run(settings: &RunSettings) -> anyhow::Result<RunReport> {
    tracing::info!(?settings, "starting run");
    let report = match settings.mode {
        Mode::Gemm => run_gemm(settings)?,
        Mode::Fused => run_fused(settings)?,
    };
    if report.max_rel_error > settings.tolerance {
        bail!(
            "result deviates from the dense reference: max relative error {} > {}",
            report.max_rel_error,
            settings.tolerance
        );
    }
    Ok(report)
}

fn run_gemm(s: &RunSettings) -> anyhow::Result<RunReport> {
    let device = Device::Cpu;
    let mut rng = StdRng::seed_from_u64(s.seed);
    let scalar_type = s.quant().validate(None)?;

    let a = Tensor::from_vec(
        uniform(&mut rng, s.num_tokens * s.size_k, 1.0),
        (s.num_tokens, s.size_k),
        &device,
    )?;
    let w = Tensor::from_vec(
        uniform(&mut rng, s.num_experts * s.size_k * s.size_n, 0.1),
        (s.num_experts, s.size_k, s.size_n),
        &device,
    )?;
    let logits = Tensor::from_vec(
        uniform(&mut rng, s.num_tokens * s.num_experts, 2.0),
        (s.num_tokens, s.num_experts),
        &device,
    )?;

    let experts = marlin_quantize_experts(&w, scalar_type, s.group_size)?;
    let (topk_weights, topk_ids) = topk_softmax(&logits, &TopKSoftmaxConfig::new(s.topk, true))?;
    let block = match s.moe_block_size {
        Some(bs) => MarlinMoeBlockConfig::new(bs)?,
        None => MarlinMoeBlockConfig::auto_select(s.num_tokens, s.topk, s.num_experts),
    };
    let aligned =
        MoETokenGrouper::from_config(&block, s.num_experts).align_block_size(&topk_ids)?;
    tracing::debug!(
        moe_block_size = block.moe_block_size,
        num_tokens_post_padded = aligned.num_tokens_post_padded,
        "aligned tokens"
    );

    let mut workspace = MarlinMoeWorkspace::new(s.size_n, s.size_k, block.moe_block_size);
    let (out, mean, min) = time_calls(s.warmup, s.iterations, || {
        Ok(marlin_gemm_moe(
            &a,
            &experts.qweight,
            &aligned.sorted_token_ids,
            Some(&topk_weights),
            &experts.scales,
            &aligned.expert_offsets,
            &mut workspace,
            s.num_tokens,
            s.size_n,
            s.size_k,
            aligned.num_tokens_post_padded,
            s.num_experts,
            s.topk,
            block.moe_block_size,
            true,
            true,
        )?)
    })?;

    let expected = dense_reference(&a, &experts.w_ref, &topk_ids, Some(&topk_weights))?;

    Ok(RunReport {
        mode: Mode::Gemm,
        moe_block_size: block.moe_block_size,
        max_rel_error: max_rel_error(&to_vec(&out)?, &to_vec(&expected)?),
        mean,
        min,
        macs: (s.num_tokens * s.topk * s.size_k * s.size_n) as u64,
    })
}

fn run_fused(s: &RunSettings) -> anyhow::Result<RunReport> {
    let device = Device::Cpu;
    let mut rng = StdRng::seed_from_u64(s.seed);
    let hidden = s.size_n;
    let inter = s.intermediate_size;

    let mut config = FusedMarlinMoEConfig::new(s.num_experts, s.topk, hidden, inter, true)
        .with_quant(s.quant());
    if let Some(bs) = s.moe_block_size {
        config = config.with_block_config(MarlinMoeBlockConfig::new(bs)?);
    }
    let w13 = Tensor::from_vec(
        uniform(&mut rng, s.num_experts * hidden * 2 * inter, 0.1),
        (s.num_experts, hidden, 2 * inter),
        &device,
    )?;
    let w2 = Tensor::from_vec(
        uniform(&mut rng, s.num_experts * inter * hidden, 0.1),
        (s.num_experts, inter, hidden),
        &device,
    )?;
    let layer = MarlinMoELayer::from_dense(config, &w13, &w2)?;
    let block = layer.config().block_config_for(s.num_tokens);

    let x = Tensor::from_vec(
        uniform(&mut rng, s.num_tokens * hidden, 1.0),
        (s.num_tokens, hidden),
        &device,
    )?;
    let logits = Tensor::from_vec(
        uniform(&mut rng, s.num_tokens * s.num_experts, 2.0),
        (s.num_tokens, s.num_experts),
        &device,
    )?;

    let (out, mean, min) = time_calls(s.warmup, s.iterations, || Ok(layer.forward(&x, &logits)?))?;

    let (weights, ids) = topk_softmax(&logits, &TopKSoftmaxConfig::new(s.topk, true))?;
    let expected = swiglu_reference(&x, &layer.w13().w_ref, &layer.w2().w_ref, &ids, &weights)?;

    Ok(RunReport {
        mode: Mode::Fused,
        moe_block_size: block.moe_block_size,
        max_rel_error: max_rel_error(&to_vec(&out)?, &to_vec(&expected)?),
        mean,
        min,
        macs: (s.num_tokens * s.topk * 3 * hidden * inter) as u64,
    })
}
