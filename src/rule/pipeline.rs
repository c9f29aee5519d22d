//! Extraction pipeline expressions
//!
//! A pipeline describes how a value is pulled out of a document or a matched node:
//!
//! | expression | meaning |
//! |------------|---------|
//! | `$raw` | serialized source of the current node (raw bytes at the root) |
//! | `$title` | text of the first `title` element |
//! | `$[selector]` | first node matched by `selector`, as text |
//! | `$[selector].$text` | text of the first match |
//! | `$[selector].$html` | inner markup of the first match |
//! | `$[selector].$attr[name]` | attribute `name` of the first match |
//! | `$text`, `$html`, `$attr[name]` | the same actions applied to the current node |
//!
//! Anything that does not start with `$` (or that starts with a `$var[..]`
//! placeholder) is a literal. Expressions are compiled once when a rule is parsed.

use crate::RuleError;
use std::fmt;

/// What to extract from a selected node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Text,
    Html,
    Attr(String),
}

impl Action {
    fn parse(expr: &str, action: &str) -> Result<Self, RuleError> {
        match action {
            "text" => Ok(Action::Text),
            "html" => Ok(Action::Html),
            _ => {
                let name = action
                    .strip_prefix("attr[")
                    .and_then(|rest| rest.strip_suffix(']'))
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .ok_or_else(|| RuleError::InvalidPipeline(expr.to_string()))?;
                Ok(Action::Attr(name.to_string()))
            }
        }
    }
}

/// A compiled pipeline expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pipeline {
    Raw,
    Title,
    /// Select the first node matching `selector` and apply `action` (text when absent)
    Select {
        selector: String,
        action: Option<Action>,
    },
    /// Apply an action to the current node
    Act(Action),
    Literal(String),
}

impl Pipeline {
    /// Compiles a pipeline expression
    ///
    /// # Returns
    ///
    /// * `Ok(Pipeline)` - The compiled expression
    /// * `Err(RuleError::InvalidPipeline)` - A `$` expression that matches no known form
    pub fn parse(expr: &str) -> Result<Self, RuleError> {
        let trimmed = expr.trim();

        if !trimmed.starts_with('$') || trimmed.starts_with("$var[") {
            return Ok(Pipeline::Literal(expr.to_string()));
        }

        match trimmed {
            "$raw" => return Ok(Pipeline::Raw),
            "$title" => return Ok(Pipeline::Title),
            _ => {}
        }

        if let Some(body) = trimmed.strip_prefix("$[") {
            // The selector runs to the last `]` before the next `$`, so selectors such as
            // `a[href]` keep their own brackets.
            let limit = body.find('$').unwrap_or(body.len());
            let close = body[..limit]
                .rfind(']')
                .ok_or_else(|| RuleError::InvalidPipeline(expr.to_string()))?;
            let selector = body[..close].trim();
            if selector.is_empty() {
                return Err(RuleError::InvalidPipeline(expr.to_string()));
            }

            let rest = &body[close + 1..];
            let action = if rest.is_empty() {
                None
            } else {
                let action = rest
                    .strip_prefix(".$")
                    .ok_or_else(|| RuleError::InvalidPipeline(expr.to_string()))?;
                Some(Action::parse(expr, action)?)
            };

            return Ok(Pipeline::Select {
                selector: selector.to_string(),
                action,
            });
        }

        Action::parse(expr, &trimmed[1..]).map(Pipeline::Act)
    }

    /// Compiles an optional expression, treating an empty string as absent
    pub fn parse_optional(expr: Option<&str>) -> Result<Option<Self>, RuleError> {
        match expr.map(str::trim) {
            None | Some("") => Ok(None),
            Some(expr) => Self::parse(expr).map(Some),
        }
    }

    /// Returns true if the expression yields a fixed string
    pub fn is_literal(&self) -> bool {
        matches!(self, Pipeline::Literal(_))
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn action(f: &mut fmt::Formatter<'_>, action: &Action) -> fmt::Result {
            match action {
                Action::Text => write!(f, "$text"),
                Action::Html => write!(f, "$html"),
                Action::Attr(name) => write!(f, "$attr[{}]", name),
            }
        }

        match self {
            Pipeline::Raw => write!(f, "$raw"),
            Pipeline::Title => write!(f, "$title"),
            Pipeline::Select {
                selector,
                action: act,
            } => {
                write!(f, "$[{}]", selector)?;
                if let Some(act) = act {
                    write!(f, ".")?;
                    action(f, act)?;
                }
                Ok(())
            }
            Pipeline::Act(act) => action(f, act),
            Pipeline::Literal(s) => write!(f, "{}", s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_forms() {
        assert_eq!(Pipeline::parse("$raw").unwrap(), Pipeline::Raw);
        assert_eq!(Pipeline::parse("$title").unwrap(), Pipeline::Title);
        assert_eq!(Pipeline::parse("$text").unwrap(), Pipeline::Act(Action::Text));
        assert_eq!(
            Pipeline::parse("$attr[href]").unwrap(),
            Pipeline::Act(Action::Attr("href".to_string()))
        );
    }

    #[test]
    fn test_parse_selector_with_action() {
        assert_eq!(
            Pipeline::parse("$[div.book > h2].$text").unwrap(),
            Pipeline::Select {
                selector: "div.book > h2".to_string(),
                action: Some(Action::Text),
            }
        );
        assert_eq!(
            Pipeline::parse("$[a[href]].$attr[href]").unwrap(),
            Pipeline::Select {
                selector: "a[href]".to_string(),
                action: Some(Action::Attr("href".to_string())),
            }
        );
        assert_eq!(
            Pipeline::parse("$[data.items.0.name]").unwrap(),
            Pipeline::Select {
                selector: "data.items.0.name".to_string(),
                action: None,
            }
        );
    }

    #[test]
    fn test_literals() {
        assert_eq!(
            Pipeline::parse("book-$var[page]").unwrap(),
            Pipeline::Literal("book-$var[page]".to_string())
        );
        assert!(Pipeline::parse("$var[page]").unwrap().is_literal());
        assert!(Pipeline::parse("https://abc.com/").unwrap().is_literal());
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(Pipeline::parse("$[]").is_err());
        assert!(Pipeline::parse("$[div").is_err());
        assert!(Pipeline::parse("$[div].text").is_err());
        assert!(Pipeline::parse("$[div].$bogus").is_err());
        assert!(Pipeline::parse("$attr[]").is_err());
        assert!(Pipeline::parse("$unknown").is_err());
    }

    #[test]
    fn test_parse_optional() {
        assert_eq!(Pipeline::parse_optional(None).unwrap(), None);
        assert_eq!(Pipeline::parse_optional(Some("  ")).unwrap(), None);
        assert_eq!(
            Pipeline::parse_optional(Some("$title")).unwrap(),
            Some(Pipeline::Title)
        );
    }

    #[test]
    fn test_display_round_trips_text() {
        for expr in ["$raw", "$[a[href]].$attr[href]", "$[h1].$html", "$text", "plain"] {
            assert_eq!(Pipeline::parse(expr).unwrap().to_string(), expr);
        }
    }
}
