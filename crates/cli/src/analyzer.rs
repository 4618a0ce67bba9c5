use async_trait::async_trait;
use context_knowledge::{AnalysisContext, Analyzer, GenerationError};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Analyzer backed by an external program.
///
/// The node content goes to stdin and stdout becomes the artifact text. The program also sees
/// `CONTEXT_KB_PATH`, `CONTEXT_KB_KIND` and `CONTEXT_KB_SIBLINGS` (newline separated).
pub(crate) struct CommandAnalyzer {
    program: String,
    args: Vec<String>,
}

impl CommandAnalyzer {
    pub(crate) fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl Analyzer for CommandAnalyzer {
    async fn analyze(
        &self,
        content: &str,
        context: &AnalysisContext,
    ) -> Result<String, GenerationError> {
        let fail = |message: String| GenerationError::new(&context.relative_path, message);

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("CONTEXT_KB_PATH", &context.relative_path)
            .env("CONTEXT_KB_KIND", context.kind.as_str())
            .env("CONTEXT_KB_SIBLINGS", context.sibling_context.join("\n"))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| fail(format!("spawn {}: {err}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A program that exits without reading stdin closes the pipe; its exit status decides.
            if let Err(err) = stdin.write_all(content.as_bytes()).await {
                log::debug!("Analyzer stdin closed early: {err}");
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|err| fail(format!("wait for {}: {err}", self.program)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(fail(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        if text.trim().is_empty() {
            return Err(fail(format!("{} produced no output", self.program)));
        }
        Ok(text)
    }
}
