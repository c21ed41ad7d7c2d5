//! Match-and-act rule pipeline.
//!
//! Rule documents arrive as YAML or JSON, are deserialized into a strict
//! schema (unknown fields rejected), and compiled into a [`Ruleset`] whose
//! regexes are built once at ingest. Handlers then run [`Ruleset::apply`] on
//! the hot path against plain data only.

use bytes::Bytes;
use regex::Regex;
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::RuleError;

/// Pipeline phase a rule fires in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Inbound to the proxy, before the upstream fetch.
    #[default]
    Request,
    /// After the upstream fetch (or mock).
    Response,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Request => write!(f, "request"),
            Phase::Response => write!(f, "response"),
        }
    }
}

/// Top-level rule document: a `rules:` list.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RulesDoc {
    /// Rules in declared order.
    #[serde(default)]
    pub rules: Vec<RuleDoc>,
}

impl RulesDoc {
    /// Parse a YAML rule document. Unknown fields are rejected.
    pub fn from_yaml(text: &str) -> Result<Self, RuleError> {
        Ok(serde_yml::from_str(text)?)
    }

    /// Parse a JSON rule document. Unknown fields are rejected.
    pub fn from_json(text: &str) -> Result<Self, RuleError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// One declared rule.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleDoc {
    /// Human-readable name, used in diagnostics.
    pub name: String,
    /// Phase the rule fires in.
    #[serde(default, rename = "on")]
    pub phase: Phase,
    /// Match predicate; an empty match applies to every flow in the phase.
    #[serde(rename = "match")]
    pub matches: MatchDoc,
    /// Action taken when the predicate holds.
    pub action: ActionDoc,
    /// Disabled rules are kept in the document but never fire.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Match predicate: every present constraint must hold.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatchDoc {
    /// Regular expression searched (not anchored) against the URL.
    #[serde(default)]
    pub url_regex: Option<String>,
    /// Case-insensitive HTTP method equality.
    #[serde(default)]
    pub method: Option<String>,
    /// Exact status code; meaningful in the response phase only.
    #[serde(default)]
    pub status: Option<u16>,
}

/// Rule action. Fields apply in a fixed order: URL rewrite, header sets,
/// header removes, body replacement, mock.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionDoc {
    /// Replace the target URL (request phase only).
    #[serde(default)]
    pub rewrite_url: Option<String>,
    /// Header assignments, overwriting by case-insensitive name.
    #[serde(default, deserialize_with = "ordered_pairs")]
    pub set_headers: Vec<(String, String)>,
    /// Header removals by case-insensitive name.
    #[serde(default)]
    pub remove_headers: Vec<String>,
    /// Replace the request body (UTF-8 encoded).
    #[serde(default)]
    pub set_request_body: Option<String>,
    /// Replace the response body (UTF-8 encoded).
    #[serde(default)]
    pub set_response_body: Option<String>,
    /// Synthesize a response instead of fetching upstream (request phase
    /// only); suppresses later rules in the same application.
    #[serde(default)]
    pub mock_response: Option<MockDoc>,
}

/// Declared mock response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MockDoc {
    /// Status code.
    #[serde(default = "default_status")]
    pub status: u16,
    /// Headers in declared order.
    #[serde(default, deserialize_with = "ordered_pairs")]
    pub headers: Vec<(String, String)>,
    /// Body text, UTF-8 encoded on emission.
    #[serde(default)]
    pub body: String,
}

fn default_status() -> u16 {
    200
}

/// Deserialize a mapping into insertion-ordered pairs, stringifying scalar
/// values so `X-Test: 1` reads as `"1"`.
fn ordered_pairs<'de, D>(deserializer: D) -> Result<Vec<(String, String)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct PairsVisitor;

    impl<'de> Visitor<'de> for PairsVisitor {
        type Value = Vec<(String, String)>;

        fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("a mapping of names to scalar values")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut pairs = Vec::new();
            while let Some((name, value)) = map.next_entry::<String, ScalarString>()? {
                pairs.push((name, value.0));
            }
            Ok(pairs)
        }
    }

    deserializer.deserialize_map(PairsVisitor)
}

/// A string that also accepts numeric and boolean scalars.
struct ScalarString(String);

impl<'de> Deserialize<'de> for ScalarString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ScalarVisitor;

        impl Visitor<'_> for ScalarVisitor {
            type Value = ScalarString;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a string, number, or boolean")
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Ok(ScalarString(v.to_string()))
            }

            fn visit_string<E: serde::de::Error>(self, v: String) -> Result<Self::Value, E> {
                Ok(ScalarString(v))
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Self::Value, E> {
                Ok(ScalarString(v.to_string()))
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(ScalarString(v.to_string()))
            }

            fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<Self::Value, E> {
                Ok(ScalarString(v.to_string()))
            }

            fn visit_bool<E: serde::de::Error>(self, v: bool) -> Result<Self::Value, E> {
                Ok(ScalarString(v.to_string()))
            }
        }

        deserializer.deserialize_any(ScalarVisitor)
    }
}

/// A compiled rule: the declared fields with the url regex pre-built.
#[derive(Debug)]
struct Rule {
    name: String,
    phase: Phase,
    url: Option<Regex>,
    method: Option<String>,
    status: Option<u16>,
    action: ActionDoc,
    enabled: bool,
}

impl Rule {
    fn matches(&self, url: &str, method: &str, status: Option<u16>) -> bool {
        if let Some(re) = &self.url {
            if !re.is_match(url) {
                return false;
            }
        }
        if let Some(m) = &self.method {
            if !m.eq_ignore_ascii_case(method) {
                return false;
            }
        }
        if let Some(s) = self.status {
            if status != Some(s) {
                return false;
            }
        }
        true
    }
}

/// Synthesized response supplied by a rule instead of upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct MockResponse {
    /// Status code.
    pub status: u16,
    /// Headers, titlecased, in declared order.
    pub headers: Vec<(String, String)>,
    /// UTF-8 body bytes.
    pub body: Bytes,
}

/// Result of applying a ruleset to one phase of a flow.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    /// Possibly rewritten URL.
    pub url: String,
    /// Headers with names titlecased, in post-modification order.
    pub headers: Vec<(String, String)>,
    /// Possibly replaced body.
    pub body: Bytes,
    /// Present when a request-phase rule mocked the response.
    pub mock: Option<MockResponse>,
}

/// Ordered set of compiled rules.
#[derive(Debug, Default)]
pub struct Ruleset {
    rules: Vec<Rule>,
}

impl Ruleset {
    /// Compile a parsed document, building each `url_regex` up front.
    pub fn compile(doc: RulesDoc) -> Result<Self, RuleError> {
        let mut rules = Vec::with_capacity(doc.rules.len());
        for rule in doc.rules {
            let url = match &rule.matches.url_regex {
                Some(pattern) => Some(Regex::new(pattern).map_err(|source| {
                    RuleError::InvalidRegex {
                        rule: rule.name.clone(),
                        source,
                    }
                })?),
                None => None,
            };
            rules.push(Rule {
                name: rule.name,
                phase: rule.phase,
                url,
                method: rule.matches.method,
                status: rule.matches.status,
                action: rule.action,
                enabled: rule.enabled,
            });
        }
        Ok(Self { rules })
    }

    /// Parse and compile a YAML document in one step.
    pub fn from_yaml(text: &str) -> Result<Self, RuleError> {
        Self::compile(RulesDoc::from_yaml(text)?)
    }

    /// Parse and compile a JSON document in one step.
    pub fn from_json(text: &str) -> Result<Self, RuleError> {
        Self::compile(RulesDoc::from_json(text)?)
    }

    /// Number of compiled rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the set holds no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Run the pipeline for one phase.
    ///
    /// Enabled rules of the given phase fire in declared order; each one that
    /// matches applies its URL rewrite (request phase only), header sets,
    /// header removes, and phase-appropriate body replacement. A
    /// `mock_response` on a matching request-phase rule short-circuits the
    /// remaining rules. Emitted header names are titlecased.
    pub fn apply(
        &self,
        phase: Phase,
        url: &str,
        method: &str,
        status: Option<u16>,
        headers: &[(String, String)],
        body: &[u8],
    ) -> Applied {
        let mut url = url.to_string();
        let mut body = Bytes::copy_from_slice(body);

        // Case-fold into an insertion-preserving map: later duplicates
        // overwrite the value in place.
        let mut folded: Vec<(String, String)> = Vec::with_capacity(headers.len());
        for (name, value) in headers {
            set_header(&mut folded, name, value);
        }

        let mut mock = None;
        for rule in self.rules.iter().filter(|r| r.enabled && r.phase == phase) {
            if !rule.matches(&url, method, status) {
                continue;
            }
            tracing::debug!(rule = %rule.name, %phase, "rule matched");

            let action = &rule.action;
            if phase == Phase::Request {
                if let Some(rewrite) = &action.rewrite_url {
                    url = rewrite.clone();
                }
            }
            for (name, value) in &action.set_headers {
                set_header(&mut folded, name, value);
            }
            for name in &action.remove_headers {
                let lower = name.to_ascii_lowercase();
                folded.retain(|(n, _)| *n != lower);
            }
            if phase == Phase::Request {
                if let Some(text) = &action.set_request_body {
                    body = Bytes::from(text.clone().into_bytes());
                }
            }
            if phase == Phase::Response {
                if let Some(text) = &action.set_response_body {
                    body = Bytes::from(text.clone().into_bytes());
                }
            }
            if phase == Phase::Request {
                if let Some(m) = &action.mock_response {
                    mock = Some(MockResponse {
                        status: m.status,
                        headers: m
                            .headers
                            .iter()
                            .map(|(name, value)| (titlecase(name), value.clone()))
                            .collect(),
                        body: Bytes::from(m.body.clone().into_bytes()),
                    });
                    break;
                }
            }
        }

        let headers = folded
            .into_iter()
            .map(|(name, value)| (titlecase(&name), value))
            .collect();
        Applied {
            url,
            headers,
            body,
            mock,
        }
    }
}

fn set_header(folded: &mut Vec<(String, String)>, name: &str, value: &str) {
    let lower = name.to_ascii_lowercase();
    match folded.iter_mut().find(|(n, _)| *n == lower) {
        Some(slot) => slot.1 = value.to_string(),
        None => folded.push((lower, value.to_string())),
    }
}

/// Titlecase a header name: uppercase each alphabetic run's first character,
/// lowercase the rest ("content-type" becomes "Content-Type").
fn titlecase(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut start_of_word = true;
    for c in name.chars() {
        if c.is_ascii_alphabetic() {
            if start_of_word {
                out.push(c.to_ascii_uppercase());
            } else {
                out.push(c.to_ascii_lowercase());
            }
            start_of_word = false;
        } else {
            out.push(c);
            start_of_word = true;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn mock_doc() -> RulesDoc {
        RulesDoc::from_yaml(
            r#"
rules:
  - name: mock
    on: request
    match:
      url_regex: "example\\.com"
    action:
      mock_response:
        status: 200
        headers:
          X-Test: 1
        body: ok
"#,
        )
        .unwrap()
    }

    #[test]
    fn mock_short_circuits_upstream() {
        let ruleset = Ruleset::compile(mock_doc()).unwrap();
        let applied = ruleset.apply(
            Phase::Request,
            "http://example.com",
            "GET",
            None,
            &[],
            b"",
        );
        let mock = applied.mock.expect("mock should fire");
        assert_eq!(mock.status, 200);
        assert_eq!(mock.headers, vec![("X-Test".to_string(), "1".to_string())]);
        assert_eq!(mock.body, Bytes::from_static(b"ok"));
    }

    #[test]
    fn mock_suppresses_later_rules() {
        let ruleset = Ruleset::from_yaml(
            r#"
rules:
  - name: first
    match: {}
    action:
      mock_response: { status: 418, body: teapot }
  - name: second
    match: {}
    action:
      set_headers: { X-Late: too-late }
"#,
        )
        .unwrap();
        let applied = ruleset.apply(Phase::Request, "http://x", "GET", None, &[], b"");
        assert_eq!(applied.mock.unwrap().status, 418);
        assert!(applied.headers.is_empty());
    }

    #[test]
    fn set_and_remove_headers_are_case_insensitive() {
        let ruleset = Ruleset::from_yaml(
            r#"
rules:
  - name: set
    match: {}
    action:
      set_headers: { Content-Type: text/plain }
"#,
        )
        .unwrap();
        let initial = vec![("content-type".to_string(), "x".to_string())];
        let applied = ruleset.apply(Phase::Request, "http://x", "GET", None, &initial, b"");
        assert_eq!(
            applied.headers,
            vec![("Content-Type".to_string(), "text/plain".to_string())]
        );

        let ruleset = Ruleset::from_yaml(
            r#"
rules:
  - name: remove
    match: {}
    action:
      remove_headers: [content-type]
"#,
        )
        .unwrap();
        let applied = ruleset.apply(
            Phase::Request,
            "http://x",
            "GET",
            None,
            &applied.headers,
            b"",
        );
        assert!(applied.headers.is_empty());
    }

    #[test]
    fn phases_are_isolated() {
        let ruleset = Ruleset::from_yaml(
            r#"
rules:
  - name: response-only
    on: response
    match: {}
    action:
      set_headers: { X-Resp: "1" }
      set_response_body: patched
"#,
        )
        .unwrap();
        let applied = ruleset.apply(Phase::Request, "http://x", "GET", None, &[], b"body");
        assert!(applied.headers.is_empty());
        assert_eq!(applied.body, Bytes::from_static(b"body"));

        let applied = ruleset.apply(Phase::Response, "http://x", "GET", Some(200), &[], b"body");
        assert_eq!(
            applied.headers,
            vec![("X-Resp".to_string(), "1".to_string())]
        );
        assert_eq!(applied.body, Bytes::from_static(b"patched"));
    }

    #[test]
    fn disabled_rules_never_fire() {
        let ruleset = Ruleset::from_yaml(
            r#"
rules:
  - name: off
    enabled: false
    match: {}
    action:
      set_headers: { X-Off: "1" }
"#,
        )
        .unwrap();
        let applied = ruleset.apply(Phase::Request, "http://x", "GET", None, &[], b"");
        assert!(applied.headers.is_empty());
    }

    #[test]
    fn method_match_is_case_insensitive() {
        let ruleset = Ruleset::from_yaml(
            r#"
rules:
  - name: posts
    match: { method: post }
    action:
      set_headers: { X-Post: "1" }
"#,
        )
        .unwrap();
        let applied = ruleset.apply(Phase::Request, "http://x", "POST", None, &[], b"");
        assert_eq!(applied.headers.len(), 1);
        let applied = ruleset.apply(Phase::Request, "http://x", "GET", None, &[], b"");
        assert!(applied.headers.is_empty());
    }

    #[test]
    fn status_match_requires_exact_code() {
        let ruleset = Ruleset::from_yaml(
            r#"
rules:
  - name: not-found
    on: response
    match: { status: 404 }
    action:
      set_response_body: gone
"#,
        )
        .unwrap();
        let applied = ruleset.apply(Phase::Response, "http://x", "GET", Some(404), &[], b"");
        assert_eq!(applied.body, Bytes::from_static(b"gone"));
        let applied = ruleset.apply(Phase::Response, "http://x", "GET", Some(200), &[], b"old");
        assert_eq!(applied.body, Bytes::from_static(b"old"));
    }

    #[test]
    fn url_rewrite_applies_to_request_phase_only() {
        let ruleset = Ruleset::from_yaml(
            r#"
rules:
  - name: redirect
    match: { url_regex: "old" }
    action:
      rewrite_url: "http://new.test/"
"#,
        )
        .unwrap();
        let applied = ruleset.apply(Phase::Request, "http://old.test/", "GET", None, &[], b"");
        assert_eq!(applied.url, "http://new.test/");
    }

    #[test]
    fn rules_fire_in_declared_order() {
        let ruleset = Ruleset::from_yaml(
            r#"
rules:
  - name: first
    match: {}
    action:
      set_headers: { X-Order: first }
  - name: second
    match: {}
    action:
      set_headers: { X-Order: second }
"#,
        )
        .unwrap();
        let applied = ruleset.apply(Phase::Request, "http://x", "GET", None, &[], b"");
        assert_eq!(
            applied.headers,
            vec![("X-Order".to_string(), "second".to_string())]
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = RulesDoc::from_yaml(
            r#"
rules:
  - name: bad
    match: {}
    action: {}
    surprise: true
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("surprise"), "{err}");

        assert!(RulesDoc::from_json(r#"{"rules": [], "extra": 1}"#).is_err());
    }

    #[test]
    fn invalid_regex_is_rejected_at_compile() {
        let doc = RulesDoc::from_yaml(
            r#"
rules:
  - name: broken
    match: { url_regex: "(" }
    action: {}
"#,
        )
        .unwrap();
        let err = Ruleset::compile(doc).unwrap_err();
        assert!(matches!(err, RuleError::InvalidRegex { ref rule, .. } if rule == "broken"));
    }

    #[test]
    fn json_documents_parse_too() {
        let ruleset = Ruleset::from_json(
            r#"{"rules": [{"name": "j", "match": {"url_regex": "x"},
                "action": {"set_headers": {"a": "b"}}}]}"#,
        )
        .unwrap();
        assert_eq!(ruleset.len(), 1);
    }

    #[test]
    fn titlecase_recases_header_names() {
        assert_eq!(titlecase("content-type"), "Content-Type");
        assert_eq!(titlecase("x-test"), "X-Test");
        assert_eq!(titlecase("ETAG"), "Etag");
    }
}
