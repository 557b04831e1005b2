use crate::kubectl::KubectlError;

/// Abstraction over kubectl execution for testability.
///
/// Production code uses [`RealExecutor`], tests use mockall-generated mocks.
#[async_trait::async_trait]
pub trait KubectlExecutor: Send + Sync {
    /// Execute a kubectl command and capture stdout.
    async fn exec(&self, args: &[String]) -> Result<String, KubectlError>;

    /// Execute a kubectl command with data piped to stdin.
    async fn exec_with_stdin(
        &self,
        args: &[String],
        stdin_data: &[u8],
    ) -> Result<String, KubectlError>;
}

/// Real kubectl CLI executor.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealExecutor;

#[async_trait::async_trait]
impl KubectlExecutor for RealExecutor {
    async fn exec(&self, args: &[String]) -> Result<String, KubectlError> {
        use std::process::Stdio;

        let output = tokio::process::Command::new("kubectl")
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| KubectlError::NotFound { source: e })?;

        finish(args, output)
    }

    async fn exec_with_stdin(
        &self,
        args: &[String],
        stdin_data: &[u8],
    ) -> Result<String, KubectlError> {
        use std::process::Stdio;
        use tokio::io::AsyncWriteExt;

        let mut child = tokio::process::Command::new("kubectl")
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| KubectlError::NotFound { source: e })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(stdin_data)
                .await
                .map_err(|e| KubectlError::StdinWrite { source: e })?;
            stdin
                .shutdown()
                .await
                .map_err(|e| KubectlError::StdinWrite { source: e })?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| KubectlError::NotFound { source: e })?;

        finish(args, output)
    }
}

fn finish(args: &[String], output: std::process::Output) -> Result<String, KubectlError> {
    if output.status.success() {
        String::from_utf8(output.stdout).map_err(|e| KubectlError::InvalidUtf8 { source: e })
    } else {
        Err(KubectlError::CommandFailed {
            args: args.to_vec(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
