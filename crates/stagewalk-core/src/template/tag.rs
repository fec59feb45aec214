use crate::error::{Result, RolloutError};
use regex::Regex;
use std::sync::OnceLock;

static TAG_RE: OnceLock<Regex> = OnceLock::new();
static CANDIDATE_RE: OnceLock<Regex> = OnceLock::new();

/// `{{ <chain> }}` or `{{ `literal` }}`. Group 1 is the tag body.
pub fn tag_re() -> &'static Regex {
    TAG_RE.get_or_init(|| {
        Regex::new(r"\{\{\s*((?:`.*`)|(?:[^{}]+(?:\|[^{}]+)*))\s*\}\}").unwrap()
    })
}

fn candidate_re() -> &'static Regex {
    CANDIDATE_RE.get_or_init(|| {
        Regex::new(r"^([a-zA-Z][a-zA-Z-]*)\.([^\[\]]+?)(?:\[(\d+)(?:-(\d+))?\])?$").unwrap()
    })
}

// ---------------------------------------------------------------------------
// TagKind
// ---------------------------------------------------------------------------

/// How an output-style lookup derives its parameter name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addressing {
    /// `<step>.<module>.<key>`
    Step,
    /// `<key>`, used verbatim as the parameter name.
    Custom,
    /// `<moduleType>.<key>`, located through the module's type tag.
    Typed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    Output { addressing: Addressing, optional: bool },
    Config,
    /// Resolved in the deferred pass.
    Agent,
    Module,
    TypedModule,
    TypedStepModule,
}

impl TagKind {
    pub fn parse(name: &str) -> Result<Self> {
        use Addressing::*;
        let output = |addressing, optional| TagKind::Output {
            addressing,
            optional,
        };
        Ok(match name {
            "output" | "ssm" | "gcsm" => output(Step, false),
            "optout" | "optssm" | "optgcsm" => output(Step, true),
            "output-custom" | "ssm-custom" | "gcsm-custom" => output(Custom, false),
            "optout-custom" | "optssm-custom" | "optgcsm-custom" => output(Custom, true),
            "toutput" | "tssm" | "tgcsm" => output(Typed, false),
            "toptout" | "toptssm" | "toptgcsm" => output(Typed, true),
            "config" => TagKind::Config,
            "agent" => TagKind::Agent,
            "module" => TagKind::Module,
            "tmodule" => TagKind::TypedModule,
            "tsmodule" => TagKind::TypedStepModule,
            other => return Err(RolloutError::UnknownTagType(other.to_string())),
        })
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, TagKind::Agent)
    }

    pub fn is_optional(&self) -> bool {
        matches!(self, TagKind::Output { optional: true, .. })
    }
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Index {
    Single(usize),
    /// Inclusive.
    Range(usize, usize),
}

impl Index {
    /// Address a comma-joined value.
    pub fn apply(&self, name: &str, value: &str) -> Result<String> {
        let items: Vec<&str> = value.split(',').map(str::trim).collect();
        let out_of_range = |index| RolloutError::IndexOutOfRange {
            name: name.to_string(),
            index,
            len: items.len(),
        };
        match *self {
            Index::Single(i) => items
                .get(i)
                .map(|s| s.to_string())
                .ok_or_else(|| out_of_range(i)),
            Index::Range(start, end) => {
                if start > end {
                    return Err(RolloutError::InvalidRange {
                        name: name.to_string(),
                        start,
                        end,
                    });
                }
                if end >= items.len() {
                    return Err(out_of_range(end));
                }
                Ok(items[start..=end].join(","))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tag / Candidate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lookup {
    pub kind: TagKind,
    pub path: Vec<String>,
    pub index: Option<Index>,
    /// Candidate text as written, for error messages.
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidate {
    Literal(String),
    Lookup(Lookup),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tag {
    /// Backtick-wrapped body, emitted without resolution.
    Escaped(String),
    Chain(Vec<Candidate>),
}

impl Tag {
    pub fn parse(body: &str) -> Result<Self> {
        let body = body.trim();
        if body.len() >= 2 && body.starts_with('`') && body.ends_with('`') {
            return Ok(Tag::Escaped(body[1..body.len() - 1].to_string()));
        }
        let candidates = body
            .split('|')
            .map(|c| parse_candidate(c.trim()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Tag::Chain(candidates))
    }

    pub fn is_deferred(&self) -> bool {
        match self {
            Tag::Escaped(_) => false,
            Tag::Chain(candidates) => candidates
                .iter()
                .any(|c| matches!(c, Candidate::Lookup(l) if l.kind.is_deferred())),
        }
    }
}

fn parse_candidate(text: &str) -> Result<Candidate> {
    if text.len() >= 2 && text.starts_with('"') && text.ends_with('"') {
        return Ok(Candidate::Literal(text[1..text.len() - 1].to_string()));
    }
    let caps = candidate_re()
        .captures(text)
        .ok_or_else(|| RolloutError::MalformedTag(text.to_string()))?;
    let kind = TagKind::parse(&caps[1])?;
    let path = caps[2].split('.').map(str::to_string).collect();
    let number = |i: usize| -> Result<Option<usize>> {
        caps.get(i)
            .map(|m| {
                m.as_str()
                    .parse::<usize>()
                    .map_err(|_| RolloutError::MalformedTag(text.to_string()))
            })
            .transpose()
    };
    let index = match (number(3)?, number(4)?) {
        (Some(start), Some(end)) => Some(Index::Range(start, end)),
        (Some(i), None) => Some(Index::Single(i)),
        _ => None,
    };
    Ok(Candidate::Lookup(Lookup {
        kind,
        path,
        index,
        raw: text.to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bodies(text: &str) -> Vec<String> {
        tag_re()
            .captures_iter(text)
            .map(|c| c[1].trim().to_string())
            .collect()
    }

    #[test]
    fn tag_regex_finds_chains_and_escapes() {
        let text = "a: {{ output.net.vpc.id }}\nb: {{optout.x.y.z|\"fallback\"}}\nc: {{ `{{ .Values.x }}` }}";
        assert_eq!(
            bodies(text),
            [
                "output.net.vpc.id",
                "optout.x.y.z|\"fallback\"",
                "`{{ .Values.x }}`"
            ]
        );
    }

    #[test]
    fn parses_chain_with_literal() {
        let tag = Tag::parse(" optout.net.vpc.id | config.prefix | \"none\" ").unwrap();
        let Tag::Chain(c) = tag else { panic!("expected chain") };
        assert_eq!(c.len(), 3);
        assert!(matches!(&c[0], Candidate::Lookup(l) if l.kind.is_optional() && l.path == ["net", "vpc", "id"]));
        assert!(matches!(&c[1], Candidate::Lookup(l) if l.kind == TagKind::Config));
        assert_eq!(c[2], Candidate::Literal("none".into()));
    }

    #[test]
    fn parses_index_and_range() {
        let Tag::Chain(c) = Tag::parse("ssm.net.vpc.subnets[1]").unwrap() else { panic!() };
        let Candidate::Lookup(l) = &c[0] else { panic!() };
        assert_eq!(l.index, Some(Index::Single(1)));
        assert_eq!(l.path, ["net", "vpc", "subnets"]);

        let Tag::Chain(c) = Tag::parse("output-custom.shared/ids[0-2]").unwrap() else { panic!() };
        let Candidate::Lookup(l) = &c[0] else { panic!() };
        assert_eq!(l.index, Some(Index::Range(0, 2)));
        assert_eq!(
            l.kind,
            TagKind::Output {
                addressing: Addressing::Custom,
                optional: false
            }
        );
    }

    #[test]
    fn escaped_tag() {
        assert_eq!(Tag::parse("`{{ x }}`").unwrap(), Tag::Escaped("{{ x }}".into()));
    }

    #[test]
    fn unknown_type_and_malformed() {
        assert!(matches!(
            Tag::parse("vault.a.b"),
            Err(RolloutError::UnknownTagType(t)) if t == "vault"
        ));
        assert!(matches!(
            Tag::parse("nodot"),
            Err(RolloutError::MalformedTag(_))
        ));
    }

    #[test]
    fn agent_tags_are_deferred() {
        assert!(Tag::parse("agent.version.net.vpc").unwrap().is_deferred());
        assert!(Tag::parse("optout.a.b.c|agent.accountId").unwrap().is_deferred());
        assert!(!Tag::parse("output.a.b.c").unwrap().is_deferred());
    }

    #[test]
    fn index_addressing() {
        assert_eq!(Index::Single(1).apply("p", "a,b,c").unwrap(), "b");
        assert_eq!(Index::Range(0, 1).apply("p", "a,b,c").unwrap(), "a,b");
        assert!(matches!(
            Index::Single(5).apply("p", "a,b,c"),
            Err(RolloutError::IndexOutOfRange { index: 5, len: 3, .. })
        ));
        assert!(matches!(
            Index::Range(2, 1).apply("p", "a,b,c"),
            Err(RolloutError::InvalidRange { .. })
        ));
    }
}
