//! Worker command-line and environment construction.
//!
//! The argument vector is built deterministically: executable (plus any
//! arguments baked into the runner `path`), then `--model`/`--host`/`--port`,
//! then the mapped tunables in a fixed order, then the model's free-form
//! `args`, then the runner's `extra_args`.

use std::collections::BTreeMap;

use crate::config::{ModelConfig, RunnerConfig};

/// A runner `path` split into its parts. Older configs smuggle environment
/// assignments into the path (`env CUDA_VISIBLE_DEVICES=0 llama-server ...`);
/// those are parsed out so they can be applied as real environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPath {
    pub executable: String,
    pub initial_args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// Parse a runner `path` that may contain leading `NAME=VALUE` assignments or
/// an `env` wrapper. Falls back to whitespace splitting when the string is
/// not valid shell syntax.
pub fn parse_runner_path(runner_name: &str, raw: &str) -> ParsedPath {
    let tokens = match shlex::split(raw) {
        Some(tokens) => tokens,
        None => {
            tracing::warn!(
                "Runner {runner_name}: Failed to parse path '{raw}'. Using simple split as fallback."
            );
            raw.split_whitespace().map(str::to_string).collect()
        }
    };

    let mut env = BTreeMap::new();
    if tokens.is_empty() {
        return ParsedPath {
            executable: raw.to_string(),
            initial_args: Vec::new(),
            env,
        };
    }

    let mut index = 0;
    if tokens[0] == "env" {
        index = 1;
    }

    while index < tokens.len() && tokens[index].contains('=') && !tokens[index].starts_with("--") {
        match tokens[index].split_once('=') {
            Some((name, value)) => {
                env.insert(name.to_string(), value.to_string());
                index += 1;
            }
            None => break,
        }
    }

    if index >= tokens.len() {
        // No executable token found; treat the entire string as a path.
        return ParsedPath {
            executable: raw.to_string(),
            initial_args: Vec::new(),
            env,
        };
    }

    ParsedPath {
        executable: tokens[index].clone(),
        initial_args: tokens[index + 1..].to_vec(),
        env,
    }
}

/// Whether the worker inherits the gateway's environment. The model-level
/// setting overrides the runner-level one.
pub fn resolve_inherit_env(runner: &RunnerConfig, model: &ModelConfig) -> bool {
    model.inherit_env.unwrap_or(runner.inherit_env)
}

/// Environment overrides in application order (last wins): runner env, then
/// model env, then assignments parsed from the runner path.
pub fn overlay_env(
    runner: &RunnerConfig,
    model: &ModelConfig,
    env_from_path: &BTreeMap<String, String>,
) -> Vec<(String, String)> {
    let mut overlay = Vec::new();
    for (k, v) in &runner.env {
        overlay.push((k.clone(), v.clone()));
    }
    for (k, v) in &model.env {
        overlay.push((k.clone(), v.clone()));
    }
    for (k, v) in env_from_path {
        overlay.push((k.clone(), v.clone()));
    }
    overlay
}

/// Build the worker argument vector for a model, returning it together with
/// any environment assignments found in the runner path.
pub fn build_command(
    runner_name: &str,
    runner: &RunnerConfig,
    model: &ModelConfig,
    host: &str,
    port: u16,
) -> (Vec<String>, BTreeMap<String, String>) {
    let parsed = parse_runner_path(runner_name, runner.executable());

    let mut cmd = vec![parsed.executable];
    cmd.extend(parsed.initial_args);

    cmd.push("--model".to_string());
    cmd.push(model.model.clone());
    cmd.push("--host".to_string());
    cmd.push(host.to_string());
    cmd.push("--port".to_string());
    cmd.push(port.to_string());

    if let Some(mmproj) = &model.mmproj {
        cmd.push("--mmproj".to_string());
        cmd.push(mmproj.clone());
    }
    if let Some(alias) = &model.model_alias {
        cmd.push("--alias".to_string());
        cmd.push(alias.clone());
    }
    if let Some(n_ctx) = model.n_ctx {
        cmd.push("--ctx-size".to_string());
        cmd.push(n_ctx.to_string());
    }
    if let Some(n_batch) = model.n_batch {
        cmd.push("--batch-size".to_string());
        cmd.push(n_batch.to_string());
    }
    if let Some(n_threads) = model.n_threads {
        cmd.push("--threads".to_string());
        cmd.push(n_threads.to_string());
    }
    if let Some(template) = &model.chat_template {
        cmd.push("--chat-template".to_string());
        cmd.push(template.clone());
    }
    if let Some(split_mode) = &model.split_mode {
        cmd.push("--split-mode".to_string());
        cmd.push(split_mode.clone());
    }
    if model.embedding {
        cmd.push("--embedding".to_string());
    }
    if model.reranking {
        cmd.push("--reranking".to_string());
    }
    if model.offload_kqv == Some(false) {
        cmd.push("--no-kv-offload".to_string());
    }
    if model.jinja {
        cmd.push("--jinja".to_string());
    }
    if let Some(pooling) = &model.pooling {
        cmd.push("--pooling".to_string());
        cmd.push(pooling.clone());
    }
    if let Some(flash_attn) = &model.flash_attn {
        cmd.push("--flash-attn".to_string());
        cmd.push(flash_attn.clone());
    }
    if model.use_mlock {
        cmd.push("--mlock".to_string());
    }
    if let Some(main_gpu) = model.main_gpu {
        cmd.push("--main-gpu".to_string());
        cmd.push(main_gpu.to_string());
    }
    if let Some(tensor_split) = &model.tensor_split {
        cmd.push("--tensor-split".to_string());
        cmd.push(
            tensor_split
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(","),
        );
    }
    if let Some(n_gpu_layers) = model.n_gpu_layers {
        cmd.push("--n-gpu-layers".to_string());
        cmd.push(n_gpu_layers.to_string());
    }
    if let Some(cache_type_k) = &model.cache_type_k {
        cmd.push("--cache-type-k".to_string());
        cmd.push(cache_type_k.clone());
    }
    if let Some(cache_type_v) = &model.cache_type_v {
        cmd.push("--cache-type-v".to_string());
        cmd.push(cache_type_v.clone());
    }
    if let Some(rope_scaling) = &model.rope_scaling {
        cmd.push("--rope-scaling".to_string());
        cmd.push(rope_scaling.clone());
    }
    if let Some(rope_scale) = model.rope_scale {
        cmd.push("--rope-scale".to_string());
        cmd.push(rope_scale.to_string());
    }
    if let Some(yarn_orig_ctx) = model.yarn_orig_ctx {
        cmd.push("--yarn-orig-ctx".to_string());
        cmd.push(yarn_orig_ctx.to_string());
    }

    if let Some(args) = model.args.as_deref().map(str::trim).filter(|a| !a.is_empty()) {
        match shlex::split(args) {
            Some(parts) => cmd.extend(parts),
            None => {
                tracing::error!(
                    "Failed to parse model args '{args}': unmatched quotes or invalid shell syntax. \
                     Using simple split as fallback."
                );
                cmd.extend(args.split_whitespace().map(str::to_string));
            }
        }
    }

    cmd.extend(runner.extra_args.iter().cloned());

    (cmd, parsed.env)
}
