//! Subtitle translation helper
//!
//! Translates SRT or WebVTT documents through an OpenAI-compatible chat
//! completions endpoint. Cue text lines go out in numbered batches; indices,
//! timings and non-cue blocks (`WEBVTT`, `NOTE`, `STYLE`) pass through
//! untouched.
//!
//! Consistency across batches comes from a [`TranslationContext`] that each
//! batch call receives and returns. It is owned by one
//! [`translate_document`] invocation.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Characters of previous output carried into the next batch prompt
const CONTEXT_MAX_CHARS: usize = 1_000;

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("translation service is not configured")]
    NotConfigured,

    #[error("subtitle document contains no cues")]
    EmptyDocument,

    #[error("translation request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("translation service returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("translation response not understood: {0}")]
    Decode(String),

    #[error("translation returned {got} lines for a batch of {expected}")]
    LineCountMismatch { expected: usize, got: usize },
}

/// Running context threaded from one batch to the next
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranslationContext {
    previous: Option<String>,
}

impl TranslationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for the batch after one that produced `translated`
    pub fn after(translated: &[String]) -> Self {
        let joined = translated.join("\n");
        let start = joined
            .char_indices()
            .rev()
            .nth(CONTEXT_MAX_CHARS.saturating_sub(1))
            .map(|(idx, _)| idx)
            .unwrap_or(0);
        let previous = joined[start..].trim().to_string();
        Self {
            previous: (!previous.is_empty()).then_some(previous),
        }
    }

    pub fn previous(&self) -> Option<&str> {
        self.previous.as_deref()
    }
}

/// One model call translating a batch of lines
#[async_trait]
pub trait BatchTranslator: Send + Sync {
    async fn translate_lines(
        &self,
        lines: &[String],
        target_language: &str,
        context: &TranslationContext,
    ) -> Result<Vec<String>, TranslateError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Block {
    /// Header, comment or style block reproduced as-is
    Verbatim(Vec<String>),
    /// Cue: identifier/timing lines, then text lines
    Cue { header: Vec<String>, text: Vec<String> },
}

/// Parsed SRT/WebVTT document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtitleDocument {
    blocks: Vec<Block>,
}

impl SubtitleDocument {
    pub fn parse(raw: &str) -> Self {
        let normalized = raw.replace("\r\n", "\n").replace('\r', "\n");
        let mut blocks = Vec::new();
        let mut current: Vec<String> = Vec::new();

        for line in normalized.lines().chain(std::iter::once("")) {
            if line.trim().is_empty() {
                if !current.is_empty() {
                    blocks.push(Self::block(std::mem::take(&mut current)));
                }
            } else {
                current.push(line.trim_end().to_string());
            }
        }

        Self { blocks }
    }

    fn block(lines: Vec<String>) -> Block {
        match lines.iter().position(|l| l.contains("-->")) {
            Some(timing) => {
                let mut header = lines;
                let text = header.split_off(timing + 1);
                Block::Cue { header, text }
            }
            None => Block::Verbatim(lines),
        }
    }

    pub fn cue_count(&self) -> usize {
        self.blocks
            .iter()
            .filter(|b| matches!(b, Block::Cue { .. }))
            .count()
    }

    /// All cue text lines in document order
    pub fn text_lines(&self) -> Vec<String> {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                Block::Cue { text, .. } => Some(text.iter().cloned()),
                Block::Verbatim(_) => None,
            })
            .flatten()
            .collect()
    }

    /// Replace cue text lines in order; `lines` must match [`Self::text_lines`] in length
    fn with_text_lines(&self, lines: Vec<String>) -> Self {
        let mut replacements = lines.into_iter();
        let blocks = self
            .blocks
            .iter()
            .map(|block| match block {
                Block::Cue { header, text } => Block::Cue {
                    header: header.clone(),
                    text: text
                        .iter()
                        .map(|original| replacements.next().unwrap_or_else(|| original.clone()))
                        .collect(),
                },
                other => other.clone(),
            })
            .collect();
        Self { blocks }
    }

    pub fn render(&self) -> String {
        let mut out = self
            .blocks
            .iter()
            .map(|block| match block {
                Block::Verbatim(lines) => lines.join("\n"),
                Block::Cue { header, text } => {
                    header.iter().chain(text.iter()).cloned().collect::<Vec<_>>().join("\n")
                }
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        out.push('\n');
        out
    }
}

/// Translate one batch and compute the context for the next
pub async fn translate_batch(
    translator: &dyn BatchTranslator,
    lines: &[String],
    target_language: &str,
    context: TranslationContext,
) -> Result<(Vec<String>, TranslationContext), TranslateError> {
    let translated = translator
        .translate_lines(lines, target_language, &context)
        .await?;
    if translated.len() != lines.len() {
        return Err(TranslateError::LineCountMismatch {
            expected: lines.len(),
            got: translated.len(),
        });
    }
    let next = TranslationContext::after(&translated);
    Ok((translated, next))
}

/// Translate a whole subtitle document
pub async fn translate_document(
    translator: &dyn BatchTranslator,
    subtitles: &str,
    target_language: &str,
    batch_size: usize,
) -> Result<String, TranslateError> {
    let document = SubtitleDocument::parse(subtitles);
    if document.cue_count() == 0 {
        return Err(TranslateError::EmptyDocument);
    }

    let lines = document.text_lines();
    let batch_size = batch_size.max(1);
    let mut context = TranslationContext::new();
    let mut translated = Vec::with_capacity(lines.len());

    for (index, batch) in lines.chunks(batch_size).enumerate() {
        debug!(batch = index, lines = batch.len(), "Translating batch");
        let (out, next) = translate_batch(translator, batch, target_language, context).await?;
        translated.extend(out);
        context = next;
    }

    info!(
        cues = document.cue_count(),
        lines = lines.len(),
        target_language,
        "Subtitle translation complete"
    );
    Ok(document.with_text_lines(translated).render())
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: String,
}

/// OpenAI-compatible chat completions translator
#[derive(Debug, Clone)]
pub struct ChatTranslator {
    http_client: Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl ChatTranslator {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, TranslateError> {
        Ok(Self {
            http_client: Client::builder().timeout(timeout).build()?,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    fn prompt(lines: &[String], target_language: &str, context: &TranslationContext) -> String {
        let mut prompt = format!(
            "Translate each numbered subtitle line into {}. Reply with exactly {} lines, \
             keeping the numbering, and nothing else.\n",
            target_language,
            lines.len()
        );
        if let Some(previous) = context.previous() {
            prompt.push_str("\nPreviously translated lines, for consistency (do not repeat them):\n");
            prompt.push_str(previous);
            prompt.push('\n');
        }
        prompt.push('\n');
        for (i, line) in lines.iter().enumerate() {
            prompt.push_str(&format!("{}. {}\n", i + 1, line));
        }
        prompt
    }
}

#[async_trait]
impl BatchTranslator for ChatTranslator {
    async fn translate_lines(
        &self,
        lines: &[String],
        target_language: &str,
        context: &TranslationContext,
    ) -> Result<Vec<String>, TranslateError> {
        let messages = [
            ChatMessage {
                role: "system",
                content: "You are a professional subtitle translator.".to_string(),
            },
            ChatMessage {
                role: "user",
                content: Self::prompt(lines, target_language, context),
            },
        ];

        let response = self
            .http_client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": messages,
                "temperature": 0.2,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TranslateError::Status {
                status,
                body: body.chars().take(300).collect(),
            });
        }

        let reply: ChatResponse = response
            .json()
            .await
            .map_err(|e| TranslateError::Decode(e.to_string()))?;
        let content = reply
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| TranslateError::Decode("no choices in response".to_string()))?;

        Ok(parse_numbered_lines(&content))
    }
}

/// Model reply → lines, with `N.` / `N)` numbering stripped
fn parse_numbered_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|line| {
            let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
            if digits == 0 {
                return line.to_string();
            }
            match line[digits..].strip_prefix('.').or_else(|| line[digits..].strip_prefix(')')) {
                Some(rest) => rest.trim().to_string(),
                None => line.to_string(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const SRT: &str = "1\r\n00:00:01,000 --> 00:00:02,500\r\nHello there\r\n\r\n\
2\r\n00:00:03,000 --> 00:00:04,000\r\nGeneral Kenobi\r\nYou are a bold one\r\n\r\n\
3\r\n00:00:05,000 --> 00:00:06,000\r\nKill him\r\n";

    const VTT: &str = "WEBVTT\n\nNOTE translated by tests\n\n00:01.000 --> 00:02.000 align:start\n- Hi\n\ncue-2\n00:03.000 --> 00:04.000\nBye\n";

    /// Uppercases lines and records the context each batch received
    #[derive(Default)]
    struct Shouting {
        contexts: Mutex<Vec<Option<String>>>,
        drop_one: bool,
    }

    #[async_trait]
    impl BatchTranslator for Shouting {
        async fn translate_lines(
            &self,
            lines: &[String],
            _target_language: &str,
            context: &TranslationContext,
        ) -> Result<Vec<String>, TranslateError> {
            self.contexts
                .lock()
                .unwrap()
                .push(context.previous().map(str::to_string));
            let mut out: Vec<String> = lines.iter().map(|l| l.to_uppercase()).collect();
            if self.drop_one {
                out.pop();
            }
            Ok(out)
        }
    }

    #[test]
    fn test_parse_srt_cues() {
        let doc = SubtitleDocument::parse(SRT);
        assert_eq!(doc.cue_count(), 3);
        assert_eq!(
            doc.text_lines(),
            vec!["Hello there", "General Kenobi", "You are a bold one", "Kill him"]
        );
    }

    #[test]
    fn test_parse_vtt_keeps_header_blocks() {
        let doc = SubtitleDocument::parse(VTT);
        assert_eq!(doc.cue_count(), 2);
        assert_eq!(doc.text_lines(), vec!["- Hi", "Bye"]);
        assert_eq!(doc.render(), VTT);
    }

    #[tokio::test]
    async fn test_timings_pass_through_and_context_threads() {
        let translator = Shouting::default();
        let out = translate_document(&translator, SRT, "fr", 2).await.unwrap();

        assert!(out.contains("00:00:01,000 --> 00:00:02,500\nHELLO THERE"));
        assert!(out.contains("2\n00:00:03,000 --> 00:00:04,000\nGENERAL KENOBI\nYOU ARE A BOLD ONE"));
        assert!(out.ends_with("KILL HIM\n"));

        let contexts = translator.contexts.lock().unwrap().clone();
        assert_eq!(
            contexts,
            vec![None, Some("HELLO THERE\nGENERAL KENOBI".to_string())]
        );
    }

    #[tokio::test]
    async fn test_line_count_mismatch_is_error() {
        let translator = Shouting {
            drop_one: true,
            ..Default::default()
        };
        match translate_document(&translator, SRT, "fr", 20).await {
            Err(TranslateError::LineCountMismatch { expected, got }) => {
                assert_eq!((expected, got), (4, 3));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_document_without_cues_rejected() {
        let translator = Shouting::default();
        assert!(matches!(
            translate_document(&translator, "just some text", "fr", 20).await,
            Err(TranslateError::EmptyDocument)
        ));
    }

    #[test]
    fn test_context_keeps_tail_only() {
        let long = vec!["x".repeat(CONTEXT_MAX_CHARS), "tail".to_string()];
        let context = TranslationContext::after(&long);
        let previous = context.previous().unwrap();
        assert!(previous.ends_with("tail"));
        assert_eq!(previous.chars().count(), CONTEXT_MAX_CHARS);
        assert_eq!(TranslationContext::after(&[]).previous(), None);
    }

    #[test]
    fn test_numbered_reply_parsing() {
        assert_eq!(
            parse_numbered_lines("1. Bonjour\n\n2) Au revoir\n3 ans plus tard"),
            vec!["Bonjour", "Au revoir", "3 ans plus tard"]
        );
    }

    #[test]
    fn test_prompt_mentions_previous_context() {
        let context = TranslationContext::after(&["Bonjour".to_string()]);
        let prompt = ChatTranslator::prompt(&["Bye".to_string()], "fr", &context);
        assert!(prompt.contains("Bonjour"));
        assert!(prompt.contains("1. Bye"));
    }
}
