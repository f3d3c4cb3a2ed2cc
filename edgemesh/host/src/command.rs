use crate::{Error, Result};
use std::process::Stdio;
use tokio::process::Command;

/// The outcome of a command that ran to completion.
#[derive(Debug)]
pub(crate) struct Output {
    pub success: bool,
    pub stdout: String,
    pub error: Option<Error>,
}

/// Runs `program` with `args`, capturing its output. Failing to spawn the program is an error; a
/// non-zero exit status is reported through [`Output`].
pub(crate) async fn run(program: &str, args: &[String]) -> Result<Output> {
    let command = format!("{program} {}", args.join(" "));
    tracing::trace!(%command, "Running");
    let out = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| Error::Spawn {
            command: command.clone(),
            source,
        })?;

    let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
    let error = (!out.status.success()).then(|| Error::Command {
        command,
        status: out.status,
        stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
    });
    Ok(Output {
        success: out.status.success(),
        stdout,
        error,
    })
}

/// Runs a command that is expected to succeed.
pub(crate) async fn check(program: &str, args: &[String]) -> Result<String> {
    let out = run(program, args).await?;
    match out.error {
        None => Ok(out.stdout),
        Some(error) => Err(error),
    }
}

pub(crate) fn args<I, S>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: ToString,
{
    args.into_iter().map(|a| a.to_string()).collect()
}
