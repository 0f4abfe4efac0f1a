// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ReplyParseError {
  #[error("Reply line was empty")]
  Empty,
  #[error("Reply is missing its kind after topic {0:?}")]
  MissingKind(String),
  #[error("Unterminated quoted value in reply")]
  UnterminatedQuote,
}

/// A single SAM reply line: `TOPIC KIND KEY=VALUE ...`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
  pub topic: String,
  pub kind: String,
  pairs: Vec<(String, String)>,
}

impl Reply {
  pub fn parse(line: &str) -> Result<Self, ReplyParseError> {
    let mut tokens = tokenize(line.trim_end_matches(['\r', '\n']))?.into_iter();
    let topic = tokens.next().ok_or(ReplyParseError::Empty)?;
    let kind = tokens
      .next()
      .ok_or_else(|| ReplyParseError::MissingKind(topic.clone()))?;
    let pairs = tokens
      .map(|token| match token.split_once('=') {
        Some((key, value)) => (key.to_string(), value.to_string()),
        None => (token, String::new()),
      })
      .collect();
    Ok(Self { topic, kind, pairs })
  }

  pub fn is(&self, topic: &str, kind: &str) -> bool {
    self.topic == topic && self.kind == kind
  }

  pub fn get(&self, key: &str) -> Option<&str> {
    self
      .pairs
      .iter()
      .find(|(k, _)| k == key)
      .map(|(_, v)| v.as_str())
  }

  pub fn result(&self) -> Option<&str> {
    self.get("RESULT")
  }

  pub fn message(&self) -> Option<&str> {
    self.get("MESSAGE")
  }
}

/// Split on spaces, treating double-quoted runs (with backslash escapes) as part of one token
fn tokenize(line: &str) -> Result<Vec<String>, ReplyParseError> {
  let mut tokens = Vec::new();
  let mut current = String::new();
  let mut in_token = false;
  let mut chars = line.chars();
  while let Some(c) = chars.next() {
    match c {
      ' ' | '\t' => {
        if in_token {
          tokens.push(std::mem::take(&mut current));
          in_token = false;
        }
      }
      '"' => {
        in_token = true;
        loop {
          match chars.next() {
            None => return Err(ReplyParseError::UnterminatedQuote),
            Some('"') => break,
            Some('\\') => match chars.next() {
              None => return Err(ReplyParseError::UnterminatedQuote),
              Some(escaped) => current.push(escaped),
            },
            Some(other) => current.push(other),
          }
        }
      }
      other => {
        in_token = true;
        current.push(other);
      }
    }
  }
  if in_token {
    tokens.push(current);
  }
  Ok(tokens)
}
