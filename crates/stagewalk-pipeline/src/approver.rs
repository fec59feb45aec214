use async_trait::async_trait;
use stagewalk_core::approval::ChangeCounts;
use stagewalk_core::config::StepKey;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use crate::Result;

/// Decides a manual approval gate.
#[async_trait]
pub trait Approver: Send + Sync {
    async fn approve(&self, step: &StepKey, counts: &ChangeCounts, plan: &str) -> Result<bool>;
}

/// Fixed answer: `--yes` allows every gate, `--no-input` denies it.
#[derive(Debug, Clone, Copy)]
pub struct StaticApprover(pub bool);

#[async_trait]
impl Approver for StaticApprover {
    async fn approve(&self, _step: &StepKey, _counts: &ChangeCounts, _plan: &str) -> Result<bool> {
        Ok(self.0)
    }
}

/// Prompts on the terminal. Concurrent gates are asked one at a time.
#[derive(Debug, Default)]
pub struct StdinApprover {
    prompt: Mutex<()>,
}

impl StdinApprover {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Approver for StdinApprover {
    async fn approve(&self, step: &StepKey, counts: &ChangeCounts, plan: &str) -> Result<bool> {
        let _turn = self.prompt.lock().await;

        let mut err = tokio::io::stderr();
        let text = format!("{plan}\nstep '{step}': {counts}. Apply? [y/N] ");
        err.write_all(text.as_bytes()).await?;
        err.flush().await?;

        let mut answer = String::new();
        BufReader::new(tokio::io::stdin()).read_line(&mut answer).await?;
        Ok(is_yes(&answer))
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
