//! External speech commands.
//!
//! Both directions shell out to a user-configured template. Placeholders are
//! replaced with POSIX single-quoted arguments, so the text being spoken can
//! never break out of its argument.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{SpeechError, Synthesizer};

pub const TEXT_PLACEHOLDER: &str = "{{TEXT}}";
pub const OUTPUT_PLACEHOLDER: &str = "{{OUTPUT}}";
pub const INPUT_PLACEHOLDER: &str = "{{INPUT}}";

/// Quote `value` as a single POSIX shell word.
pub fn shell_escape(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Substitute each `(placeholder, value)` with the escaped value.
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (placeholder, value)| {
        acc.replace(placeholder, &shell_escape(value))
    })
}

/// Run `command` through `sh -c` and return its stdout.
async fn run_shell(command: &str, timeout: Duration) -> Result<Vec<u8>, SpeechError> {
    debug!(command, "Running speech command");
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(SpeechError::Spawn)?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| SpeechError::Timeout(timeout))??;

    if !output.status.success() {
        return Err(SpeechError::Failed {
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output.stdout)
}

fn scratch_path(prefix: &str, extension: &str) -> PathBuf {
    std::env::temp_dir().join(format!("clawtime-{prefix}-{}.{extension}", uuid::Uuid::new_v4()))
}

/// Text-to-speech through a command template.
///
/// With `{{OUTPUT}}` in the template the audio is read from that file;
/// without it, from the command's stdout.
#[derive(Debug, Clone)]
pub struct CommandSynthesizer {
    template: String,
    timeout: Duration,
}

impl CommandSynthesizer {
    pub fn new(template: impl Into<String>, timeout: Duration) -> Self {
        Self {
            template: template.into(),
            timeout,
        }
    }

    async fn run(&self, text: &str) -> Result<Vec<u8>, SpeechError> {
        if !self.template.contains(OUTPUT_PLACEHOLDER) {
            let command = render_template(&self.template, &[(TEXT_PLACEHOLDER, text)]);
            let audio = run_shell(&command, self.timeout).await?;
            return if audio.is_empty() {
                Err(SpeechError::EmptyOutput)
            } else {
                Ok(audio)
            };
        }

        let output = scratch_path("tts", "mp3");
        let output_str = output.to_string_lossy();
        let command = render_template(
            &self.template,
            &[(TEXT_PLACEHOLDER, text), (OUTPUT_PLACEHOLDER, &output_str)],
        );
        let result = run_shell(&command, self.timeout).await;
        let audio = match result {
            Ok(_) => tokio::fs::read(&output).await.map_err(SpeechError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = tokio::fs::remove_file(&output).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %output.display(), error = %e, "Failed to remove synthesis output");
        }
        match audio {
            Ok(bytes) if bytes.is_empty() => Err(SpeechError::EmptyOutput),
            other => other,
        }
    }
}

impl Synthesizer for CommandSynthesizer {
    fn synthesize<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<Vec<u8>, SpeechError>> {
        self.run(text).boxed()
    }
}

/// Speech-to-text through a command template with `{{INPUT}}`; the
/// transcript is the command's stdout.
#[derive(Debug, Clone)]
pub struct CommandTranscriber {
    template: String,
    timeout: Duration,
}

impl CommandTranscriber {
    pub fn new(template: impl Into<String>, timeout: Duration) -> Self {
        Self {
            template: template.into(),
            timeout,
        }
    }

    pub async fn transcribe(&self, audio: &[u8]) -> Result<String, SpeechError> {
        if audio.is_empty() {
            return Err(SpeechError::InvalidAudio("empty recording".into()));
        }
        let input = scratch_path("stt", "webm");
        tokio::fs::write(&input, audio).await?;
        let input_str = input.to_string_lossy();
        let command = render_template(&self.template, &[(INPUT_PLACEHOLDER, &input_str)]);
        let result = run_shell(&command, self.timeout).await;
        if let Err(e) = tokio::fs::remove_file(&input).await {
            warn!(path = %input.display(), error = %e, "Failed to remove recording");
        }
        let text = String::from_utf8_lossy(&result?).trim().to_string();
        if text.is_empty() {
            return Err(SpeechError::EmptyOutput);
        }
        Ok(text)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn escapes_single_quotes() {
        assert_eq!(shell_escape("plain"), "'plain'");
        assert_eq!(shell_escape("it's"), r"'it'\''s'");
        assert_eq!(shell_escape("$(rm -rf /)"), "'$(rm -rf /)'");
    }

    #[test]
    fn renders_every_placeholder() {
        let rendered = render_template(
            "say {{TEXT}} -o {{OUTPUT}} && echo {{TEXT}}",
            &[(TEXT_PLACEHOLDER, "hi"), (OUTPUT_PLACEHOLDER, "/tmp/a b.mp3")],
        );
        assert_eq!(rendered, "say 'hi' -o '/tmp/a b.mp3' && echo 'hi'");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn synthesizes_from_output_file() {
        let synth = CommandSynthesizer::new("printf %s {{TEXT}} > {{OUTPUT}}", Duration::from_secs(5));
        let audio = synth.synthesize("it's $HOME").await.unwrap();
        assert_eq!(audio, b"it's $HOME");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn synthesizes_from_stdout() {
        let synth = CommandSynthesizer::new("printf %s {{TEXT}}", Duration::from_secs(5));
        assert_eq!(synth.synthesize("abc").await.unwrap(), b"abc");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_is_an_error() {
        let synth = CommandSynthesizer::new("exit 3", Duration::from_secs(5));
        assert!(matches!(
            synth.synthesize("x").await,
            Err(SpeechError::Failed { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_command_times_out() {
        let synth = CommandSynthesizer::new("sleep 5", Duration::from_millis(100));
        assert!(matches!(
            synth.synthesize("x").await,
            Err(SpeechError::Timeout(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn transcribes_from_stdout() {
        let stt = CommandTranscriber::new("wc -c < {{INPUT}}", Duration::from_secs(5));
        assert_eq!(stt.transcribe(b"12345").await.unwrap(), "5");
        assert!(matches!(
            stt.transcribe(b"").await,
            Err(SpeechError::InvalidAudio(_))
        ));
    }
}
