// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Topic name templates.
//!
//! Templates use `{name}` placeholders, with `{{` and `}}` for literal braces:
//!
//! ```text
//! vt/cvra/{deviceid}/cardata/{timestamp_ms}
//! ```
//!
//! Placeholders are checked when the template is parsed, so a bad template is
//! rejected at startup rather than on the first publish.

use std::fmt;
use thiserror::Error;

/// Topic template errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("unknown placeholder '{{{name}}}' in topic template '{template}'")]
    UnknownPlaceholder { template: String, name: String },

    #[error("unterminated placeholder in topic template '{0}'")]
    Unterminated(String),

    #[error("unmatched '}}' in topic template '{0}'")]
    UnmatchedBrace(String),

    #[error("topic template is empty")]
    Empty,
}

/// Variables a template can reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicVar {
    /// `{deviceid}`
    DeviceId,
    /// `{timestamp_ms}`
    TimestampMs,
}

impl TopicVar {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "deviceid" => Some(Self::DeviceId),
            "timestamp_ms" => Some(Self::TimestampMs),
            _ => None,
        }
    }
}

/// Values substituted into a template.
#[derive(Debug, Clone, Copy)]
pub struct TopicVars<'a> {
    pub deviceid: &'a str,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Var(TopicVar),
}

/// A parsed topic template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl TopicTemplate {
    /// Parse and validate a template.
    pub fn parse(template: &str) -> Result<Self, TopicError> {
        if template.is_empty() {
            return Err(TopicError::Empty);
        }

        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(ch) => name.push(ch),
                            None => return Err(TopicError::Unterminated(template.to_string())),
                        }
                    }
                    let var = TopicVar::from_name(&name).ok_or_else(|| {
                        TopicError::UnknownPlaceholder {
                            template: template.to_string(),
                            name: name.clone(),
                        }
                    })?;
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Var(var));
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '}' => return Err(TopicError::UnmatchedBrace(template.to_string())),
                other => literal.push(other),
            }
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: template.to_string(),
            segments,
        })
    }

    /// Render the topic for one message.
    pub fn render(&self, vars: &TopicVars<'_>) -> String {
        let mut topic = String::with_capacity(self.source.len() + 16);
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => topic.push_str(text),
                Segment::Var(TopicVar::DeviceId) => topic.push_str(vars.deviceid),
                Segment::Var(TopicVar::TimestampMs) => {
                    topic.push_str(&vars.timestamp_ms.to_string())
                }
            }
        }
        topic
    }

    /// Whether the template references `var`.
    pub fn uses(&self, var: TopicVar) -> bool {
        self.segments.contains(&Segment::Var(var))
    }

    /// Template text as configured.
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for TopicTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Parse `template` and render it in one step.
pub fn render(template: &str, vars: &TopicVars<'_>) -> Result<String, TopicError> {
    Ok(TopicTemplate::parse(template)?.render(vars))
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: TopicVars<'static> = TopicVars {
        deviceid: "Bot",
        timestamp_ms: 42,
    };

    #[test]
    fn test_render_car_data_topic() {
        let topic = render("vt/cvra/{deviceid}/cardata/{timestamp_ms}", &VARS).expect("render");
        assert_eq!(topic, "vt/cvra/Bot/cardata/42");
    }

    #[test]
    fn test_literal_only_template() {
        let template = TopicTemplate::parse("dt/cvra/cardata").expect("parse");
        assert_eq!(template.render(&VARS), "dt/cvra/cardata");
        assert!(!template.uses(TopicVar::DeviceId));
    }

    #[test]
    fn test_escaped_braces() {
        let topic = render("raw/{{literal}}/{deviceid}", &VARS).expect("render");
        assert_eq!(topic, "raw/{literal}/Bot");
    }

    #[test]
    fn test_unknown_placeholder_rejected() {
        let err = TopicTemplate::parse("vt/{vin}/data").expect_err("unknown");
        assert_eq!(
            err,
            TopicError::UnknownPlaceholder {
                template: "vt/{vin}/data".into(),
                name: "vin".into(),
            }
        );
        assert!(TopicTemplate::parse("vt/{}/data").is_err());
    }

    #[test]
    fn test_malformed_templates_rejected() {
        assert_eq!(
            TopicTemplate::parse("vt/{deviceid"),
            Err(TopicError::Unterminated("vt/{deviceid".into()))
        );
        assert_eq!(
            TopicTemplate::parse("vt/deviceid}"),
            Err(TopicError::UnmatchedBrace("vt/deviceid}".into()))
        );
        assert_eq!(TopicTemplate::parse(""), Err(TopicError::Empty));
    }

    #[test]
    fn test_negative_timestamp() {
        let vars = TopicVars {
            deviceid: "car-7",
            timestamp_ms: -5,
        };
        assert_eq!(render("t/{deviceid}/{timestamp_ms}", &vars).expect("render"), "t/car-7/-5");
    }
}
