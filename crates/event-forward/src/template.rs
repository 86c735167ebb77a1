// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Destination templates.
//!
//! Topic names and producer names are built per event from a template such
//! as `application/{{ .applicationID }}/device/{{ .devEUI }}`. A template is
//! compiled once when an integration is constructed and rendered against the
//! variables of every event afterwards.
//!
//! Unknown variables render as the empty string, so a single template can be
//! shared by event kinds that carry different variable sets.

use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

const ACTION_OPEN: &str = "{{";
const ACTION_CLOSE: &str = "}}";

/// Template errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("unclosed action at offset {0}")]
    UnclosedAction(usize),

    #[error("empty action at offset {0}")]
    EmptyAction(usize),

    #[error("unsupported action '{action}' at offset {offset} (expected '.name')")]
    UnsupportedAction { offset: usize, action: String },

    #[error("invalid variable name '{name}' at offset {offset}")]
    InvalidVariable { offset: usize, name: String },

    #[error("template '{0}' rendered an empty destination")]
    EmptyDestination(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Variable(String),
}

/// A compiled destination template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl DestinationTemplate {
    /// Compile a template string.
    pub fn compile(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = source;
        let mut offset = 0;

        while let Some(start) = rest.find(ACTION_OPEN) {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }

            let action_offset = offset + start;
            let body_start = start + ACTION_OPEN.len();
            let body_len = rest[body_start..]
                .find(ACTION_CLOSE)
                .ok_or(TemplateError::UnclosedAction(action_offset))?;

            let body = rest[body_start..body_start + body_len].trim();
            segments.push(Segment::Variable(parse_action(body, action_offset)?));

            let consumed = body_start + body_len + ACTION_CLOSE.len();
            rest = &rest[consumed..];
            offset += consumed;
        }

        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// The template text this was compiled from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Names of the variables referenced by the template, in order.
    ///
    /// Integrations log these at startup.
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Variable(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Render against a variable mapping. Missing variables render empty.
    pub fn render(&self, vars: &HashMap<String, String>) -> String {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Variable(name) => {
                    if let Some(value) = vars.get(name) {
                        out.push_str(value);
                    }
                }
            }
        }
        out
    }

    /// Render a destination name, rejecting blank results.
    pub fn render_destination(&self, vars: &HashMap<String, String>) -> Result<String, TemplateError> {
        let rendered = self.render(vars);
        if rendered.trim().is_empty() {
            return Err(TemplateError::EmptyDestination(self.source.clone()));
        }
        Ok(rendered)
    }
}

impl fmt::Display for DestinationTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn parse_action(body: &str, offset: usize) -> Result<String, TemplateError> {
    if body.is_empty() {
        return Err(TemplateError::EmptyAction(offset));
    }

    let name = body
        .strip_prefix('.')
        .ok_or_else(|| TemplateError::UnsupportedAction {
            offset,
            action: body.to_string(),
        })?;

    let valid = !name.is_empty()
        && !name.starts_with('.')
        && !name.ends_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));

    if !valid {
        return Err(TemplateError::InvalidVariable {
            offset,
            name: name.to_string(),
        });
    }

    Ok(name.to_string())
}
