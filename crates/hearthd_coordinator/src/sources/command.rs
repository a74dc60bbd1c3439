use std::process::Stdio;

use anyhow::Context;
use async_trait::async_trait;
use linkme::distributed_slice;
use serde_json::Value;
use tokio::process::Command;

use super::REGISTRY;
use super::SourceContext;
use super::SourceFactoryResult;
use crate::config::SourceConfig;
use crate::coordinator::Fetcher;
use crate::coordinator::UpdateFailed;

#[distributed_slice(REGISTRY)]
fn init_command(ctx: &SourceContext) -> SourceFactoryResult {
    let SourceConfig::Command { program, args } = &ctx.config.source else {
        return Ok(None);
    };

    Ok(Some(Box::new(CommandSource::new(program.clone(), args.clone()))))
}

/// Runs a program and reads its stdout.
///
/// The child is killed if the fetch is dropped (e.g. on timeout).
pub struct CommandSource {
    program: String,
    args: Vec<String>,
}

impl CommandSource {
    pub fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }
}

#[async_trait]
impl Fetcher<Value> for CommandSource {
    async fn fetch(&self) -> anyhow::Result<Value> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(UpdateFailed::new(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            ))
            .into());
        }

        parse_output(&output.stdout)
    }
}

/// JSON if stdout parses as JSON, otherwise the trimmed text.
fn parse_output(stdout: &[u8]) -> anyhow::Result<Value> {
    let text = std::str::from_utf8(stdout)
        .map_err(|e| UpdateFailed::new(format!("Output is not UTF-8: {}", e)))?
        .trim();

    Ok(serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string())))
}
