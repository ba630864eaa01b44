//! The streaming `generate` surface.
//!
//! A generation runs on a blocking worker that feeds decoded fragments into
//! a bounded channel; the caller consumes them as a lazy, finite,
//! non-restartable stream. Cancellation is an atomic flag checked at
//! decode-step boundaries; at most one generation runs per engine.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use ts_rs::TS;

use doppler_model::weights::ShardLoader;
use doppler_model::{ModelDescriptor, ModelManifest};
use doppler_runtime::Runtime;
use doppler_tokenizer::Tokenizer;

use crate::chat::apply_chat_template;
use crate::pipeline::Pipeline;
use crate::sampling::{LogitsSampler, SamplerConfig, GREEDY_TEMPERATURE};
use crate::speculative::{speculative_step, SpeculativeStats};
use crate::{EngineError, Result};

fn default_max_tokens() -> usize {
    512
}
fn default_temperature() -> f32 {
    0.7
}
fn default_top_p() -> f32 {
    0.9
}
fn default_top_k() -> usize {
    40
}
fn default_repetition_penalty() -> f32 {
    1.1
}
fn default_speculative_depth() -> usize {
    4
}

/// Cooperative cancellation: raised by the caller, observed between decode
/// steps. The current step always finishes cleanly first.
#[derive(Debug, Clone, Default)]
pub struct CancellationSignal {
    flag: Arc<AtomicBool>,
}

impl CancellationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Recognized generation options. Unknown keys in the JSON form are ignored.
#[derive(Debug, Clone, Deserialize, TS)]
#[ts(export)]
pub struct GenerationOptions {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f32,
    #[serde(default)]
    pub stop_sequences: Vec<String>,
    #[serde(default)]
    pub use_speculative: bool,
    #[serde(default = "default_speculative_depth")]
    pub speculative_depth: usize,
    #[serde(default)]
    pub use_chat_template: bool,
    /// Fixed seed reproduces the token stream; `None` draws entropy.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(skip)]
    #[ts(skip)]
    pub cancellation: CancellationSignal,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialize")
    }
}

impl GenerationOptions {
    pub fn sampler_config(&self) -> SamplerConfig {
        SamplerConfig {
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
            repetition_penalty: self.repetition_penalty,
        }
    }
}

/// Per-request telemetry, available after the stream finishes.
#[derive(Debug, Clone, Serialize, TS)]
#[ts(export)]
pub struct GenerationStats {
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub duration_ms: u64,
    pub tokens_per_second: f64,
    pub speculative: Option<SpeculativeStats>,
}

/// Finite, non-restartable sequence of decoded fragments.
pub struct TokenStream {
    rx: mpsc::Receiver<String>,
}

impl std::fmt::Debug for TokenStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStream").finish_non_exhaustive()
    }
}

impl TokenStream {
    pub async fn next(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    pub fn blocking_next(&mut self) -> Option<String> {
        self.rx.blocking_recv()
    }

    pub fn into_stream(self) -> ReceiverStream<String> {
        ReceiverStream::new(self.rx)
    }

    /// Drain the stream to a single string.
    pub async fn collect_text(mut self) -> String {
        let mut text = String::new();
        while let Some(fragment) = self.next().await {
            text.push_str(&fragment);
        }
        text
    }
}

/// Receives each emitted token id alongside the text stream.
pub type TokenObserver = Arc<dyn Fn(u32) + Send + Sync>;

/// One loaded model plus the serial-generation guard around it.
pub struct InferenceEngine {
    pipeline: Arc<Mutex<Option<Pipeline>>>,
    is_generating: Arc<AtomicBool>,
    last_stats: Arc<Mutex<Option<GenerationStats>>>,
}

/// Clears the generating flag on every worker exit path.
struct GeneratingGuard(Arc<AtomicBool>);

impl Drop for GeneratingGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl InferenceEngine {
    /// Load a model and wrap it in an engine.
    pub fn load_model(
        runtime: Arc<Runtime>,
        manifest: &ModelManifest,
        shards: Arc<dyn ShardLoader>,
    ) -> Result<Self> {
        let pipeline = Pipeline::load(runtime, manifest, shards)?;
        Ok(Self {
            pipeline: Arc::new(Mutex::new(Some(pipeline))),
            is_generating: Arc::new(AtomicBool::new(false)),
            last_stats: Arc::new(Mutex::new(None)),
        })
    }

    pub fn is_loaded(&self) -> bool {
        self.pipeline.lock().is_some()
    }

    pub fn is_generating(&self) -> bool {
        self.is_generating.load(Ordering::SeqCst)
    }

    /// Stats of the most recently finished generation.
    pub fn stats(&self) -> Option<GenerationStats> {
        self.last_stats.lock().clone()
    }

    /// Clear the KV cache and transient state; weights stay loaded.
    pub fn reset(&self) -> Result<()> {
        if self.is_generating() {
            return Err(EngineError::AlreadyGenerating);
        }
        let mut guard = self.pipeline.lock();
        guard.as_mut().ok_or(EngineError::NotLoaded)?.reset();
        Ok(())
    }

    /// Release all GPU buffers and weights.
    pub fn unload(&self) -> Result<()> {
        if self.is_generating() {
            return Err(EngineError::AlreadyGenerating);
        }
        let mut guard = self.pipeline.lock();
        if let Some(mut pipeline) = guard.take() {
            pipeline.unload();
        }
        Ok(())
    }

    pub fn generate(&self, prompt: &str, options: GenerationOptions) -> Result<TokenStream> {
        self.generate_with_observer(prompt, options, None)
    }

    /// Start a generation; fragments arrive on the returned stream and the
    /// optional observer sees each raw token id.
    pub fn generate_with_observer(
        &self,
        prompt: &str,
        options: GenerationOptions,
        observer: Option<TokenObserver>,
    ) -> Result<TokenStream> {
        if !self.is_loaded() {
            return Err(EngineError::NotLoaded);
        }
        if self
            .is_generating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(EngineError::AlreadyGenerating);
        }

        let (tx, rx) = mpsc::channel(32);
        let pipeline = self.pipeline.clone();
        let stats_slot = self.last_stats.clone();
        let guard = GeneratingGuard(self.is_generating.clone());
        let prompt = prompt.to_string();

        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            if let Err(e) = run_generation(&pipeline, &prompt, &options, observer, &tx, &stats_slot)
            {
                warn!("generation failed: {}", e);
            }
        });

        Ok(TokenStream { rx })
    }
}

/// Stop-condition tracking: token ids and decoded-tail sequence matches.
struct StopChecker {
    stop_ids: HashSet<u32>,
    stop_sequences: Vec<String>,
    tail: String,
    tail_cap: usize,
}

impl StopChecker {
    fn new(options: &GenerationOptions, descriptor: &ModelDescriptor, tokenizer: &Tokenizer) -> Self {
        let mut stop_ids: HashSet<u32> = descriptor.stop_token_ids.iter().copied().collect();
        if let Some(eos) = tokenizer.specials().eos {
            stop_ids.insert(eos);
        }
        let tail_cap = options
            .stop_sequences
            .iter()
            .map(|s| s.len())
            .max()
            .unwrap_or(0)
            * 4;
        Self {
            stop_ids,
            stop_sequences: options.stop_sequences.clone(),
            tail: String::new(),
            tail_cap,
        }
    }

    fn is_stop_token(&self, id: u32) -> bool {
        self.stop_ids.contains(&id)
    }

    fn push_fragment(&mut self, fragment: &str) {
        if self.stop_sequences.is_empty() {
            return;
        }
        self.tail.push_str(fragment);
        if self.tail.len() > self.tail_cap {
            let cut = self.tail.len() - self.tail_cap;
            let boundary = (cut..self.tail.len())
                .find(|&i| self.tail.is_char_boundary(i))
                .unwrap_or(0);
            self.tail.drain(..boundary);
        }
    }

    fn matches_sequence(&self) -> bool {
        self.stop_sequences.iter().any(|s| self.tail.ends_with(s))
    }
}

enum EmitOutcome {
    Continue,
    Stop,
}

fn run_generation(
    pipeline_slot: &Mutex<Option<Pipeline>>,
    prompt: &str,
    options: &GenerationOptions,
    observer: Option<TokenObserver>,
    tx: &mpsc::Sender<String>,
    stats_slot: &Mutex<Option<GenerationStats>>,
) -> Result<()> {
    let start = Instant::now();
    let mut guard = pipeline_slot.lock();
    let pipeline = guard.as_mut().ok_or(EngineError::NotLoaded)?;

    // Fresh cache per request; weights stay resident.
    pipeline.reset();

    let tokenizer = pipeline.tokenizer();
    let rendered = if options.use_chat_template {
        apply_chat_template(pipeline.descriptor().chat_template.as_ref(), prompt)
    } else {
        prompt.to_string()
    };
    let prompt_ids = tokenizer.encode(&rendered)?;
    if prompt_ids.is_empty() {
        return Err(EngineError::EmptyPrompt);
    }
    debug!("prompt: {} tokens", prompt_ids.len());

    let mut sampler = LogitsSampler::new(options.sampler_config(), options.seed);
    let mut stop = StopChecker::new(options, pipeline.descriptor(), &tokenizer);
    let vocab = pipeline.descriptor().vocab_size;

    let mut all_ids = prompt_ids.clone();
    let mut generated = 0usize;
    let mut spec_stats = SpeculativeStats::default();

    let mut emit = |id: u32,
                    all_ids: &mut Vec<u32>,
                    generated: &mut usize,
                    stop: &mut StopChecker|
     -> Result<EmitOutcome> {
        all_ids.push(id);
        *generated += 1;
        if let Some(observer) = &observer {
            observer(id);
        }
        let fragment = tokenizer.decode(&[id], true, false).unwrap_or_default();
        stop.push_fragment(&fragment);
        if tx.blocking_send(fragment).is_err() {
            // Consumer dropped the stream; treat as cancellation.
            return Ok(EmitOutcome::Stop);
        }
        if options.cancellation.is_cancelled()
            || *generated >= options.max_tokens
            || stop.is_stop_token(id)
            || stop.matches_sequence()
        {
            return Ok(EmitOutcome::Stop);
        }
        Ok(EmitOutcome::Continue)
    };

    // Prefill: the whole prompt in one pass, then sample the first token on
    // the host (repetition penalty needs the full logits row).
    let logits = pipeline.forward(&prompt_ids, 0)?;
    let t = prompt_ids.len();
    let mut last_row: Vec<f32> = logits.narrow(0, t - 1, 1)?.squeeze(0)?.to_vec1()?;
    drop(logits);
    let first = sampler.sample(&mut last_row, &all_ids);

    let mut last = first;
    let finished = matches!(
        emit(first, &mut all_ids, &mut generated, &mut stop)?,
        EmitOutcome::Stop
    );

    let speculative = options.use_speculative && pipeline.has_draft();
    if speculative && !finished {
        let mut draft = pipeline.take_draft().expect("draft checked above");
        // Draft prefill mirrors the main prefill.
        let result = (|| -> Result<()> {
            draft.forward(&prompt_ids, 0)?;
            'outer: loop {
                if options.cancellation.is_cancelled() {
                    break;
                }
                let tokens = speculative_step(
                    pipeline,
                    draft.as_mut(),
                    last,
                    options.speculative_depth.max(1),
                    &mut sampler,
                    &mut spec_stats,
                )?;
                for token in tokens {
                    last = token;
                    if matches!(
                        emit(token, &mut all_ids, &mut generated, &mut stop)?,
                        EmitOutcome::Stop
                    ) {
                        break 'outer;
                    }
                }
            }
            Ok(())
        })();
        pipeline.put_draft(Some(draft));
        result?;
    } else if !finished {
        // The GPU sampling fast path covers configs its kernel can express;
        // anything needing the repetition penalty or nucleus filtering reads
        // the row back.
        let gpu_fast_path = !pipeline.debug_inspect()
            && (options.repetition_penalty - 1.0).abs() < f32::EPSILON
            && options.top_p >= 1.0;

        loop {
            if options.cancellation.is_cancelled() {
                break;
            }
            let pos = pipeline.seq_len();
            let next = if gpu_fast_path {
                let noise = if options.temperature < GREEDY_TEMPERATURE {
                    Vec::new()
                } else {
                    sampler.gumbel_noise(vocab)
                };
                let top_k = (options.top_k > 0).then_some(options.top_k);
                pipeline.decode_step_gpu(last, pos, options.temperature, top_k, &noise)?
            } else {
                let mut row = pipeline.decode_logits(last, pos)?;
                row.truncate(vocab);
                sampler.sample(&mut row, &all_ids)
            };
            last = next;
            if matches!(
                emit(next, &mut all_ids, &mut generated, &mut stop)?,
                EmitOutcome::Stop
            ) {
                break;
            }
        }
    }

    let duration = start.elapsed();
    let stats = GenerationStats {
        prompt_tokens: prompt_ids.len(),
        generated_tokens: generated,
        duration_ms: duration.as_millis() as u64,
        tokens_per_second: if duration.as_secs_f64() > 0.0 {
            generated as f64 / duration.as_secs_f64()
        } else {
            0.0
        },
        speculative: speculative.then_some(spec_stats),
    };
    info!(
        "generated {} tokens in {:?} ({:.1} tok/s)",
        generated,
        duration,
        stats.tokens_per_second
    );
    *stats_slot.lock() = Some(stats);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_defaults() {
        let options = GenerationOptions::default();
        assert_eq!(options.max_tokens, 512);
        assert!((options.temperature - 0.7).abs() < 1e-6);
        assert!((options.top_p - 0.9).abs() < 1e-6);
        assert_eq!(options.top_k, 40);
        assert!((options.repetition_penalty - 1.1).abs() < 1e-6);
        assert!(!options.use_speculative);
        assert!(options.seed.is_none());
    }

    #[test]
    fn test_options_ignore_unknown_keys() {
        let options: GenerationOptions = serde_json::from_str(
            r#"{"max_tokens": 3, "definitely_not_a_key": true}"#,
        )
        .unwrap();
        assert_eq!(options.max_tokens, 3);
    }

    #[test]
    fn test_cancellation_signal_is_shared() {
        let signal = CancellationSignal::new();
        let clone = signal.clone();
        assert!(!clone.is_cancelled());
        signal.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_stop_checker_sequence_suffix() {
        let mut options = GenerationOptions::default();
        options.stop_sequences = vec!["END".to_string()];
        let manifest: ModelManifest = serde_json::from_value(serde_json::json!({
            "num_layers": 1,
            "hidden_size": 4,
            "num_heads": 2,
            "intermediate_size": 4,
            "vocab_size": 8,
            "max_seq_len": 8,
            "tokenizer": {"type": "bpe", "vocab": {"a": 0}},
        }))
        .unwrap();
        let descriptor = manifest.resolve().unwrap();
        let tokenizer = Tokenizer::from_config(&descriptor.tokenizer).unwrap();

        let mut checker = StopChecker::new(&options, &descriptor, &tokenizer);
        checker.push_fragment("the ");
        assert!(!checker.matches_sequence());
        checker.push_fragment("EN");
        checker.push_fragment("D");
        assert!(checker.matches_sequence());
    }
}
