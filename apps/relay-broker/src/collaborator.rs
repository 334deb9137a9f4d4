use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::identifier::Identifier;

/// One result handed back by the sensing/acting side, published on
/// `<identifier>_<topic>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub topic: String,
    pub payload: Bytes,
}

impl Outcome {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// The external collaborator a capability feeds frames or text into.
#[async_trait]
pub trait Collaborator: Send + Sync {
    async fn invoke(&self, identifier: &Identifier, input: Bytes) -> anyhow::Result<Vec<Outcome>>;
}

/// Collaborator that does nothing; sessions still run their state machines.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCollaborator;

#[async_trait]
impl Collaborator for NoopCollaborator {
    async fn invoke(
        &self,
        _identifier: &Identifier,
        _input: Bytes,
    ) -> anyhow::Result<Vec<Outcome>> {
        Ok(Vec::new())
    }
}

/// Runs a program once per input: input on stdin, `RELAY_IDENTIFIER` in the
/// environment, one `topic payload` outcome per stdout line.
#[derive(Debug, Clone)]
pub struct CommandCollaborator {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    default_topic: String,
}

impl CommandCollaborator {
    pub fn new(program: impl Into<String>, default_topic: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: Duration::from_secs(30),
            default_topic: default_topic.into(),
        }
    }

    /// Splits a command line on whitespace into program and arguments.
    pub fn from_command_line(line: &str, default_topic: impl Into<String>) -> anyhow::Result<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or_else(|| anyhow!("collaborator command is empty"))?;
        Ok(Self {
            args: parts.collect(),
            ..Self::new(program, default_topic)
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, identifier: &Identifier, input: Bytes) -> anyhow::Result<Vec<Outcome>> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("RELAY_IDENTIFIER", identifier.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning collaborator `{}`", self.program))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("collaborator stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("collaborator stdout unavailable"))?;

        let writer = async move {
            stdin.write_all(&input).await?;
            stdin.shutdown().await
        };
        let reader = async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut collected = Vec::new();
            while let Some(line) = lines.next_line().await? {
                collected.push(line);
            }
            Ok::<_, std::io::Error>(collected)
        };
        let (written, lines) = tokio::join!(writer, reader);
        if let Err(err) = written {
            // A collaborator may exit without reading its input.
            debug!(identifier = %identifier, error = %err, "collaborator stdin closed early");
        }
        let lines = lines.context("reading collaborator output")?;

        let status = child.wait().await.context("waiting for collaborator")?;
        if !status.success() {
            bail!("collaborator `{}` exited with {status}", self.program);
        }
        Ok(parse_outcomes(&lines, &self.default_topic))
    }
}

#[async_trait]
impl Collaborator for CommandCollaborator {
    async fn invoke(&self, identifier: &Identifier, input: Bytes) -> anyhow::Result<Vec<Outcome>> {
        tokio::time::timeout(self.timeout, self.run(identifier, input))
            .await
            .map_err(|_| {
                anyhow!(
                    "collaborator `{}` timed out after {:?}",
                    self.program,
                    self.timeout
                )
            })?
    }
}

/// `topic payload` per line; a line without a space goes to `default_topic`.
/// Blank lines are skipped.
pub fn parse_outcomes(lines: &[String], default_topic: &str) -> Vec<Outcome> {
    lines
        .iter()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty())
        .map(|line| match line.split_once(' ') {
            Some((topic, payload)) if !topic.is_empty() => {
                Outcome::new(topic.to_string(), Bytes::copy_from_slice(payload.as_bytes()))
            }
            _ => Outcome::new(default_topic.to_string(), Bytes::copy_from_slice(line.as_bytes())),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn parses_topic_and_payload() {
        let lines = vec![
            "recognised_face 3".to_string(),
            "positive".to_string(),
            "".to_string(),
            "detected_person 0.91 0.12".to_string(),
        ];
        let outcomes = parse_outcomes(&lines, "text_sentiment");
        assert_eq!(
            outcomes,
            vec![
                Outcome::new("recognised_face", "3"),
                Outcome::new("text_sentiment", "positive"),
                Outcome::new("detected_person", "0.91 0.12"),
            ]
        );
    }

    #[test_timeout::timeout]
    fn empty_command_line_is_rejected() {
        assert!(CommandCollaborator::from_command_line("   ", "x").is_err());
        let command = CommandCollaborator::from_command_line("sh -c cat", "x").unwrap();
        assert_eq!(command.program, "sh");
        assert_eq!(command.args, vec!["-c", "cat"]);
    }

    #[cfg(unix)]
    #[test_timeout::tokio_timeout_test(10)]
    async fn command_output_becomes_outcomes() {
        let collaborator = CommandCollaborator {
            program: "sh".into(),
            args: vec![
                "-c".into(),
                "read line; echo \"text_sentiment $line\"; echo \"who $RELAY_IDENTIFIER\"".into(),
            ],
            timeout: Duration::from_secs(5),
            default_topic: "text_sentiment".into(),
        };
        let id = Identifier::parse("frank-ABCDEF").unwrap();
        let outcomes = collaborator
            .invoke(&id, Bytes::from_static(b"I am happy\n"))
            .await
            .unwrap();
        assert_eq!(
            outcomes,
            vec![
                Outcome::new("text_sentiment", "I am happy"),
                Outcome::new("who", "frank-ABCDEF"),
            ]
        );
    }

    #[cfg(unix)]
    #[test_timeout::tokio_timeout_test(10)]
    async fn failing_and_slow_commands_error() {
        let id = Identifier::parse("frank-ABCDEF").unwrap();
        let failing = CommandCollaborator {
            program: "sh".into(),
            args: vec!["-c".into(), "exit 3".into()],
            timeout: Duration::from_secs(5),
            default_topic: "x".into(),
        };
        assert!(failing.invoke(&id, Bytes::new()).await.is_err());

        let slow = CommandCollaborator {
            program: "sh".into(),
            args: vec!["-c".into(), "sleep 5".into()],
            timeout: Duration::from_millis(100),
            default_topic: "x".into(),
        };
        let err = slow.invoke(&id, Bytes::new()).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
