//! Single-pass `${...}` resolver with token caching
//!
//! Templates are tokenized once and cached (DashMap, Arc for zero-copy
//! sharing). Resolution is type-preserving: a string that is exactly one
//! placeholder resolves to the referenced value's JSON type; placeholders
//! embedded in surrounding text substitute textually.
//!
//! Placeholder forms:
//! - `${path}` - resolve against the context, fail/substitute on miss
//! - `${path | literal}` - substitute the literal when the path misses

use std::ops::Range;
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::context::ResolutionContext;
use crate::error::WeftError;

/// What to do when a placeholder has no default and fails to resolve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMode {
    /// Fail the task before its executor runs
    #[default]
    Strict,
    /// Substitute a diagnostic placeholder and continue
    Lenient,
}

/// Token representing a parsed template fragment
#[derive(Debug, Clone, PartialEq)]
enum Token {
    /// Literal text (stores range in the original string)
    Literal(Range<usize>),
    /// Placeholder: `${path}` or `${path | default}`
    Placeholder {
        path: String,
        default: Option<Value>,
    },
}

/// Template resolver with a shared token cache
pub struct TemplateResolver {
    cache: DashMap<String, Arc<Vec<Token>>>,
}

impl Default for TemplateResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateResolver {
    pub fn new() -> Self {
        Self {
            cache: DashMap::new(),
        }
    }

    /// Parse a template into tokens (cached)
    fn tokenize(&self, template: &str) -> Result<Arc<Vec<Token>>, WeftError> {
        if let Some(cached) = self.cache.get(template) {
            return Ok(Arc::clone(&cached));
        }

        let bytes = template.as_bytes();
        let mut tokens = Vec::new();
        let mut literal_start = 0;
        let mut i = 0;

        while i < bytes.len() {
            if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
                let close = template[i + 2..]
                    .find('}')
                    .map(|p| i + 2 + p)
                    .ok_or_else(|| WeftError::TemplateParse {
                        position: i,
                        details: "unterminated '${'".to_string(),
                    })?;

                if i > literal_start {
                    tokens.push(Token::Literal(literal_start..i));
                }
                tokens.push(parse_placeholder(&template[i + 2..close], i)?);
                i = close + 1;
                literal_start = i;
            } else {
                i += 1;
            }
        }

        if literal_start < template.len() {
            tokens.push(Token::Literal(literal_start..template.len()));
        }

        let tokens = Arc::new(tokens);
        self.cache.insert(template.to_string(), Arc::clone(&tokens));
        Ok(tokens)
    }

    /// Resolve a template string, preserving the value type when the whole
    /// string is a single placeholder
    pub fn resolve(
        &self,
        template: &str,
        ctx: &ResolutionContext,
        mode: ResolutionMode,
        task_id: &str,
    ) -> Result<Value, WeftError> {
        let tokens = self.tokenize(template)?;

        if let [Token::Placeholder { path, default }] = tokens.as_slice() {
            return self.resolve_placeholder(path, default.as_ref(), ctx, mode, task_id);
        }

        let mut out = String::with_capacity(template.len());
        for token in tokens.iter() {
            match token {
                Token::Literal(range) => out.push_str(&template[range.clone()]),
                Token::Placeholder { path, default } => {
                    let value =
                        self.resolve_placeholder(path, default.as_ref(), ctx, mode, task_id)?;
                    match value {
                        Value::String(s) => out.push_str(&s),
                        other => out.push_str(&other.to_string()),
                    }
                }
            }
        }
        Ok(Value::String(out))
    }

    /// Recursively resolve an input template: strings resolve, containers
    /// recurse, scalars pass through
    pub fn resolve_value(
        &self,
        value: &Value,
        ctx: &ResolutionContext,
        mode: ResolutionMode,
        task_id: &str,
    ) -> Result<Value, WeftError> {
        match value {
            Value::String(template) => self.resolve(template, ctx, mode, task_id),
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve_value(item, ctx, mode, task_id))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, item) in map {
                    out.insert(key.clone(), self.resolve_value(item, ctx, mode, task_id)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    fn resolve_placeholder(
        &self,
        path: &str,
        default: Option<&Value>,
        ctx: &ResolutionContext,
        mode: ResolutionMode,
        task_id: &str,
    ) -> Result<Value, WeftError> {
        if let Some(value) = ctx.lookup(path) {
            return Ok(value);
        }
        if let Some(default) = default {
            return Ok(default.clone());
        }
        match mode {
            ResolutionMode::Strict => Err(WeftError::UnresolvedVariable {
                path: path.to_string(),
                task_id: task_id.to_string(),
            }),
            ResolutionMode::Lenient => {
                tracing::warn!(task_id, path, "unresolved variable, substituting diagnostic");
                Ok(Value::String(format!("<unresolved:{}>", path)))
            }
        }
    }
}

fn parse_placeholder(content: &str, position: usize) -> Result<Token, WeftError> {
    let (path_part, default_part) = match content.find('|') {
        Some(pipe) => (&content[..pipe], Some(&content[pipe + 1..])),
        None => (content, None),
    };

    let path = path_part.trim();
    if path.is_empty() {
        return Err(WeftError::TemplateParse {
            position,
            details: "empty placeholder path".to_string(),
        });
    }

    Ok(Token::Placeholder {
        path: path.to_string(),
        default: default_part.map(|raw| parse_default_literal(raw.trim())),
    })
}

/// Parse a default literal: single-quoted strings, then JSON scalars, then
/// the bare word as a string
fn parse_default_literal(raw: &str) -> Value {
    if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
        return Value::String(raw[1..raw.len() - 1].to_string());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Global resolver instance sharing one token cache
static RESOLVER: Lazy<TemplateResolver> = Lazy::new(TemplateResolver::new);

/// Resolve a single template string via the shared resolver
pub fn resolve_str(
    template: &str,
    ctx: &ResolutionContext,
    mode: ResolutionMode,
    task_id: &str,
) -> Result<Value, WeftError> {
    RESOLVER.resolve(template, ctx, mode, task_id)
}

/// Resolve a template string to text (prompts, not structured inputs)
pub fn resolve_text(
    template: &str,
    ctx: &ResolutionContext,
    mode: ResolutionMode,
    task_id: &str,
) -> Result<String, WeftError> {
    Ok(match resolve_str(template, ctx, mode, task_id)? {
        Value::String(s) => s,
        other => other.to_string(),
    })
}

/// Resolve a full input template via the shared resolver
pub fn resolve_input(
    input: &Value,
    ctx: &ResolutionContext,
    mode: ResolutionMode,
    task_id: &str,
) -> Result<Value, WeftError> {
    RESOLVER.resolve_value(input, ctx, mode, task_id)
}
