//! Soft references: relations embedded in free text.
//!
//! A [`SoftRefParser`] scans a value and returns every match together with a
//! tokenized copy of the text in which each match is replaced by
//! `{softref:<id>}`. Ids are derived from the field location and the match
//! index, so re-parsing unchanged text yields the same ids and therefore the
//! same index fingerprints. Parsers are looked up by key in a
//! [`SoftRefRegistry`].

use std::{collections::BTreeMap, sync::LazyLock};

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::entry::RefTarget;

/// Start of every placeholder token.
pub const TOKEN_PREFIX: &str = "{softref:";

pub fn token(id: &str) -> String { format!("{TOKEN_PREFIX}{id}}}") }

// ─── Parse results ───────────────────────────────────────────────────────────

/// Location of the text being parsed; seeds the match ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenContext<'a> {
  pub table: &'a str,
  pub uid:   i64,
  pub field: &'a str,
  pub path:  &'a str,
  pub key:   &'a str,
}

impl TokenContext<'_> {
  pub fn token_id(&self, index: usize) -> String {
    let seed = format!(
      "{}:{}:{}:{}:{}:{}",
      self.table, self.uid, self.field, self.path, self.key, index
    );
    let digest = Sha256::digest(seed.as_bytes());
    hex::encode(&digest[..16])
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftRefElement {
  pub id:      String,
  /// The original text the token replaced.
  pub matched: String,
  pub target:  RefTarget,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftRefResult {
  pub tokenized: String,
  pub elements:  Vec<SoftRefElement>,
}

impl SoftRefResult {
  pub fn element(&self, id: &str) -> Option<&SoftRefElement> {
    self.elements.iter().find(|e| e.id == id)
  }

  /// Rebuild the text with element `id` replaced by `replacement` (removed
  /// when `None`) and every other token restored to its original match.
  pub fn substitute(&self, id: &str, replacement: Option<&str>) -> String {
    let mut out = self.tokenized.clone();
    for element in &self.elements {
      let with = if element.id == id {
        replacement.unwrap_or("")
      } else {
        element.matched.as_str()
      };
      out = out.replace(&token(&element.id), with);
    }
    out
  }

  /// Build a result from non-overlapping `(start, end, target)` spans in
  /// ascending order.
  fn from_spans(
    content: &str,
    spans: Vec<(usize, usize, RefTarget)>,
    ctx: &TokenContext<'_>,
  ) -> Option<Self> {
    if spans.is_empty() {
      return None;
    }
    let mut tokenized = String::with_capacity(content.len());
    let mut elements = Vec::with_capacity(spans.len());
    let mut cursor = 0;
    for (index, (start, end, target)) in spans.into_iter().enumerate() {
      let id = ctx.token_id(index);
      tokenized.push_str(&content[cursor..start]);
      tokenized.push_str(&token(&id));
      elements.push(SoftRefElement { id, matched: content[start..end].to_owned(), target });
      cursor = end;
    }
    tokenized.push_str(&content[cursor..]);
    Some(Self { tokenized, elements })
  }
}

// ─── Parser capability ───────────────────────────────────────────────────────

pub trait SoftRefParser: Send + Sync {
  /// `None` when the text holds nothing this parser recognizes.
  fn parse(&self, content: &str, ctx: &TokenContext<'_>) -> Option<SoftRefResult>;
}

/// Recognizers by key.
#[derive(Default)]
pub struct SoftRefRegistry {
  parsers: BTreeMap<String, Box<dyn SoftRefParser>>,
}

impl SoftRefRegistry {
  pub fn new() -> Self { Self::default() }

  /// `substitute`, `email`, `url` and `typolink`.
  pub fn with_defaults() -> Self {
    let mut registry = Self::new();
    registry.register("substitute", SubstituteParser);
    registry.register("email", EmailParser);
    registry.register("url", UrlParser);
    registry.register("typolink", TypolinkParser::default());
    registry
  }

  pub fn register(&mut self, key: impl Into<String>, parser: impl SoftRefParser + 'static) {
    self.parsers.insert(key.into(), Box::new(parser));
  }

  pub fn get(&self, key: &str) -> Option<&dyn SoftRefParser> {
    self.parsers.get(key).map(|p| p.as_ref())
  }

  pub fn keys(&self) -> impl Iterator<Item = &str> { self.parsers.keys().map(String::as_str) }
}

// ─── Built-in recognizers ────────────────────────────────────────────────────

/// The whole value is one literal token.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubstituteParser;

impl SoftRefParser for SubstituteParser {
  fn parse(&self, content: &str, ctx: &TokenContext<'_>) -> Option<SoftRefResult> {
    let value = content.trim();
    if value.is_empty() {
      return None;
    }
    SoftRefResult::from_spans(
      content,
      vec![(0, content.len(), RefTarget::Literal { value: value.to_owned() })],
      ctx,
    )
  }
}

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"(?i)[a-z0-9._%+-]+@[a-z0-9-]+(?:\.[a-z0-9-]+)*\.[a-z]{2,}").expect("valid regex")
});

static URL: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r#"https?://[^\s"'<>]+"#).expect("valid regex"));

static TYPOLINK: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r#"t3://(page|record|file)\?([^\s"'<>]+)"#).expect("valid regex")
});

fn literal_spans(re: &Regex, content: &str) -> Vec<(usize, usize, RefTarget)> {
  re.find_iter(content)
    .map(|m| (m.start(), m.end(), RefTarget::Literal { value: m.as_str().to_owned() }))
    .collect()
}

/// Email addresses as literal tokens.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmailParser;

impl SoftRefParser for EmailParser {
  fn parse(&self, content: &str, ctx: &TokenContext<'_>) -> Option<SoftRefResult> {
    SoftRefResult::from_spans(content, literal_spans(&EMAIL, content), ctx)
  }
}

/// External `http(s)` URLs as literal tokens.
#[derive(Debug, Clone, Copy, Default)]
pub struct UrlParser;

impl SoftRefParser for UrlParser {
  fn parse(&self, content: &str, ctx: &TokenContext<'_>) -> Option<SoftRefResult> {
    SoftRefResult::from_spans(content, literal_spans(&URL, content), ctx)
  }
}

/// `t3://` links to pages, records and files.
///
/// - `t3://page?uid=5` → record `5` of [`page_table`](Self::page_table)
/// - `t3://record?identifier=news&uid=3` → record `3` of `news`
/// - `t3://file?path=uploads/a.pdf` → file `uploads/a.pdf`
#[derive(Debug, Clone)]
pub struct TypolinkParser {
  pub page_table: String,
}

impl Default for TypolinkParser {
  fn default() -> Self { Self { page_table: "page".to_owned() } }
}

impl TypolinkParser {
  fn target(&self, kind: &str, query: &str) -> Option<RefTarget> {
    let params: BTreeMap<&str, &str> = query
      .split('&')
      .map(|p| p.strip_prefix("amp;").unwrap_or(p))
      .filter_map(|p| p.split_once('='))
      .collect();
    let uid = || params.get("uid").and_then(|u| u.parse::<i64>().ok()).filter(|u| *u > 0);
    match kind {
      "page" => Some(RefTarget::Record { table: self.page_table.clone(), uid: uid()? }),
      "record" => {
        let table = params.get("identifier").or_else(|| params.get("table"))?;
        Some(RefTarget::Record { table: (*table).to_owned(), uid: uid()? })
      }
      "file" => {
        let path = params.get("path").filter(|p| !p.is_empty())?;
        Some(RefTarget::File { path: (*path).to_owned() })
      }
      _ => None,
    }
  }
}

impl SoftRefParser for TypolinkParser {
  fn parse(&self, content: &str, ctx: &TokenContext<'_>) -> Option<SoftRefResult> {
    let spans = TYPOLINK
      .captures_iter(content)
      .filter_map(|caps| {
        let whole = caps.get(0)?;
        let target = self.target(caps.get(1)?.as_str(), caps.get(2)?.as_str())?;
        Some((whole.start(), whole.end(), target))
      })
      .collect();
    SoftRefResult::from_spans(content, spans, ctx)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn ctx(key: &str) -> TokenContext<'_> {
    TokenContext { table: "item", uid: 1, field: "body", path: "", key }
  }

  #[test]
  fn token_ids_are_stable_and_location_bound() {
    let c = ctx("url");
    assert_eq!(c.token_id(0), c.token_id(0));
    assert_ne!(c.token_id(0), c.token_id(1));
    assert_ne!(c.token_id(0), TokenContext { uid: 2, ..c }.token_id(0));
    assert_eq!(c.token_id(0).len(), 32);
  }

  #[test]
  fn typolink_recognizes_pages_records_and_files() {
    let text = r#"See <a href="t3://page?uid=5">home</a>, t3://record?identifier=news&amp;uid=3 and t3://file?path=uploads/a.pdf"#;
    let result = TypolinkParser::default().parse(text, &ctx("typolink")).unwrap();
    let targets: Vec<_> = result.elements.iter().map(|e| e.target.clone()).collect();
    assert_eq!(targets, [
      RefTarget::Record { table: "page".into(), uid: 5 },
      RefTarget::Record { table: "news".into(), uid: 3 },
      RefTarget::File { path: "uploads/a.pdf".into() },
    ]);
    assert!(!result.tokenized.contains("t3://"));
    assert_eq!(result.tokenized.matches(TOKEN_PREFIX).count(), 3);
  }

  #[test]
  fn typolink_skips_unparsable_links() {
    assert!(TypolinkParser::default().parse("t3://page?uid=abc", &ctx("typolink")).is_none());
  }

  #[test]
  fn substitute_restores_or_replaces_matches() {
    let text = "Mail a@example.com or b@example.org";
    let result = EmailParser.parse(text, &ctx("email")).unwrap();
    assert_eq!(result.elements.len(), 2);

    let first = result.elements[0].id.clone();
    assert_eq!(result.substitute("unknown", None), text);
    assert_eq!(result.substitute(&first, Some("c@example.net")), "Mail c@example.net or b@example.org");
    assert_eq!(result.substitute(&first, None), "Mail  or b@example.org");
  }

  #[test]
  fn substitute_parser_takes_the_whole_value() {
    let result = SubstituteParser.parse("  fileadmin/a.txt ", &ctx("substitute")).unwrap();
    assert_eq!(result.elements[0].target, RefTarget::Literal { value: "fileadmin/a.txt".into() });
    assert_eq!(result.tokenized, token(&result.elements[0].id));
    assert!(SubstituteParser.parse("   ", &ctx("substitute")).is_none());
  }

  #[test]
  fn url_parser_finds_external_links() {
    let result = UrlParser.parse("go to https://example.com/x?a=1 now", &ctx("url")).unwrap();
    assert_eq!(result.elements[0].matched, "https://example.com/x?a=1");
  }

  #[test]
  fn registry_defaults() {
    let registry = SoftRefRegistry::with_defaults();
    assert_eq!(registry.keys().collect::<Vec<_>>(), ["email", "substitute", "typolink", "url"]);
    assert!(registry.get("nope").is_none());
  }
}
