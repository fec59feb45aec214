//! `{{ ... }}` replacement tags.
//!
//! A tag body is either a backtick-escaped literal or a `|`-separated chain
//! of candidates (`<type>.<path>[<start>-<end>]` or a `"literal"`). Rendering
//! runs two fixed passes: immediate tags first, then `agent.*` tags, which
//! may depend on version decisions made later in the same release.

mod engine;
mod tag;

pub use engine::{
    checksum, validate, AgentValues, ModuleScope, Phase, Rendered, RenderedValue,
    TemplateContext,
};
pub use tag::{tag_re, Addressing, Candidate, Index, Lookup, Tag, TagKind};
