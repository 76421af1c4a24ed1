//! Subprocess hook capability (§4.7 item 2, §9 design note): "run command
//! with optional stdin payload", fire-and-forget with a wall-clock timeout.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// What (if anything) is written to the hook subprocess's stdin.
#[derive(Debug, Clone)]
pub enum StdinPolicy {
    None,
    Text(String),
    Json(serde_json::Value),
    Name(String),
}

/// A configured hook: the command to run plus how to feed it.
#[derive(Debug, Clone)]
pub struct HookConfig {
    pub argv: Vec<String>,
    pub stdin: StdinPolicy,
}

/// Spawns `hook` and writes its stdin payload, detached from the caller
/// (§9: fire-and-forget). stderr is captured and logged; the exit code is
/// recorded but never affects satellite state (`ErrHook` is log-only).
pub async fn run_hook(hook: HookConfig, label: &'static str) {
    tokio::spawn(async move {
        if let Err(e) = run_hook_inner(hook).await {
            tracing::warn!(hook = label, error = %e, "hook failed");
        }
    });
}

async fn run_hook_inner(hook: HookConfig) -> Result<(), crate::error::SatelliteError> {
    let (program, args) = hook
        .argv
        .split_first()
        .ok_or_else(|| crate::error::SatelliteError::Hook("empty hook command".into()))?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| crate::error::SatelliteError::Hook(format!("spawn failed: {e}")))?;

    if let Some(mut stdin) = child.stdin.take() {
        let payload: Option<Vec<u8>> = match hook.stdin {
            StdinPolicy::None => None,
            StdinPolicy::Text(s) => Some(s.into_bytes()),
            StdinPolicy::Json(v) => Some(serde_json::to_vec(&v).unwrap_or_default()),
            StdinPolicy::Name(s) => Some(s.into_bytes()),
        };
        if let Some(payload) = payload {
            let _ = stdin.write_all(&payload).await;
        }
        drop(stdin);
    }

    match tokio::time::timeout(DEFAULT_HOOK_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => {
            if !status.success() {
                tracing::debug!(?status, "hook exited non-zero");
            }
            Ok(())
        }
        Ok(Err(e)) => Err(crate::error::SatelliteError::Hook(format!("wait failed: {e}"))),
        Err(_) => {
            let _ = child.start_kill();
            Err(crate::error::SatelliteError::Hook(
                "hook timed out after 5s".into(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hook_with_empty_argv_errors_without_panicking() {
        let hook = HookConfig {
            argv: vec![],
            stdin: StdinPolicy::None,
        };
        let err = run_hook_inner(hook).await.unwrap_err();
        assert!(matches!(err, crate::error::SatelliteError::Hook(_)));
    }

    #[tokio::test]
    async fn text_stdin_policy_runs_true_successfully() {
        let hook = HookConfig {
            argv: vec!["true".to_string()],
            stdin: StdinPolicy::Text("hello".into()),
        };
        run_hook_inner(hook).await.unwrap();
    }
}
