/// Question files and answer logs.
///
/// Question files are either JSON Lines of `{"question", "option_a", "option_b"}`
/// objects, a JSON array of strings, or plain text with one question per line.
/// Answer logs are JSON Lines of `AnswerRecord`.
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use pairpoll_core::AnswerRow;
use serde::{Deserialize, Serialize};

use crate::queue::{AnsweredQuestion, OptionPair};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionRecord {
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub option_a: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub option_b: Option<String>,
}

impl QuestionRecord {
    pub fn plain(question: impl Into<String>) -> Self {
        QuestionRecord {
            question: question.into(),
            option_a: None,
            option_b: None,
        }
    }

    pub fn with_options(question: impl Into<String>, option_a: impl Into<String>, option_b: impl Into<String>) -> Self {
        QuestionRecord {
            question: question.into(),
            option_a: Some(option_a.into()),
            option_b: Some(option_b.into()),
        }
    }

    /// Both options, if the record names both.
    pub fn options(&self) -> Option<OptionPair> {
        match (&self.option_a, &self.option_b) {
            (Some(a), Some(b)) => Some(OptionPair {
                option_a: a.clone(),
                option_b: b.clone(),
            }),
            _ => None,
        }
    }
}

/// One line of an answer log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerRecord {
    #[serde(default)]
    pub question: String,
    pub option_a: String,
    pub option_b: String,
    pub answer: String,
}

impl From<AnsweredQuestion> for Option<AnswerRecord> {
    fn from(answered: AnsweredQuestion) -> Self {
        let options = answered.options?;
        Some(AnswerRecord {
            question: answered.question,
            option_a: options.option_a,
            option_b: options.option_b,
            answer: answered.answer,
        })
    }
}

impl From<&AnswerRecord> for AnswerRow {
    fn from(record: &AnswerRecord) -> Self {
        AnswerRow::new(&*record.option_a, &*record.option_b, &*record.answer)
    }
}

/// Parse a question file's contents. Auto-detects JSON array, JSON Lines, or plain text.
pub fn parse_questions_from_str(content: &str) -> Result<Vec<QuestionRecord>> {
    let trimmed = content.trim();

    if trimmed.starts_with('[') {
        let items: Vec<String> = serde_json::from_str(trimmed)
            .context("file looks like a JSON array but failed to parse")?;
        return Ok(items
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(QuestionRecord::plain)
            .collect());
    }

    let mut records = Vec::new();
    for (line_no, line) in trimmed.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('{') {
            let record: QuestionRecord = serde_json::from_str(line)
                .with_context(|| format!("line {}: invalid question record", line_no + 1))?;
            if record.question.trim().is_empty() {
                bail!("line {}: question text is empty", line_no + 1);
            }
            records.push(record);
        } else {
            records.push(QuestionRecord::plain(line));
        }
    }
    Ok(records)
}

pub fn load_questions(path: &Path) -> Result<Vec<QuestionRecord>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read questions file {}", path.display()))?;
    parse_questions_from_str(&content)
}

pub fn read_answer_log(path: &Path) -> Result<Vec<AnswerRecord>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open answer log {}", path.display()))?;

    let mut records = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: AnswerRecord = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid answer record", path.display(), line_no + 1))?;
        records.push(record);
    }
    Ok(records)
}

pub fn write_answer_log(path: &Path, records: &[AnswerRecord]) -> Result<()> {
    let mut file = std::fs::File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    for record in records {
        let line = serde_json::to_string(record)?;
        writeln!(file, "{line}").with_context(|| format!("failed to write {}", path.display()))?;
    }
    file.flush()?;
    Ok(())
}

/// Replace anything outside `[A-Za-z0-9_.-]` with an underscore.
pub fn safe_filename(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') { c } else { '_' })
        .collect()
}

/// Log name without directories or extension, used as a column label.
pub fn log_label(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
