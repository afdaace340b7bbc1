//! Native fast path for plain data references
//!
//! Expressions that are nothing more than a reference such as `$json.user.name`,
//! `$node["Fetch"].json.id` or `$("Fetch").first().json.items[0]` never touch
//! the Lua sandbox. They are parsed into a JSONPath and selected directly.

use serde_json::Value;

use super::ExpressionError;

/// Which item a reference starts from
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Root {
    /// Current item (`$json`, `$binary`, `$input.item`)
    Item,
    InputFirst,
    InputLast,
    /// Item of another node paired to the current one
    NodePaired(String),
    NodeFirst(String),
    NodeLast(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Section {
    Json,
    Binary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PathRef {
    pub root: Root,
    pub section: Section,
    pub json_path: String,
}

/// Parse a plain reference; `None` means the expression needs the Lua evaluator
pub(crate) fn parse(expr: &str) -> Option<PathRef> {
    let mut parser = Parser { rest: expr.trim() };
    let (root, section) = parser.root()?;
    let json_path = parser.segments()?;
    if !parser.rest.is_empty() {
        return None;
    }
    Some(PathRef {
        root,
        section,
        json_path,
    })
}

/// First value selected by `path`, or null when nothing matches
pub(crate) fn select(value: &Value, path: &str) -> Result<Value, ExpressionError> {
    if path == "$" {
        return Ok(value.clone());
    }
    let selected = jsonpath_lib::select(value, path).map_err(|e| ExpressionError::Evaluation {
        expression: path.to_string(),
        message: format!("{:?}", e),
    })?;
    Ok(selected.first().map(|v| (*v).clone()).unwrap_or(Value::Null))
}

struct Parser<'a> {
    rest: &'a str,
}

impl<'a> Parser<'a> {
    fn eat(&mut self, literal: &str) -> bool {
        match self.rest.strip_prefix(literal) {
            Some(rest) => {
                self.rest = rest;
                true
            }
            None => false,
        }
    }

    fn root(&mut self) -> Option<(Root, Section)> {
        if self.eat("$json") {
            return Some((Root::Item, Section::Json));
        }
        if self.eat("$binary") {
            return Some((Root::Item, Section::Binary));
        }
        if self.eat("$input") {
            let root = if self.eat(".item") {
                Root::Item
            } else if self.eat(".first()") {
                Root::InputFirst
            } else if self.eat(".last()") {
                Root::InputLast
            } else {
                return None;
            };
            return Some((root, self.section()?));
        }
        if self.eat("$node[") {
            let name = self.string_literal()?;
            if !self.eat("]") {
                return None;
            }
            return Some((Root::NodePaired(name), self.section()?));
        }
        if self.eat("$(") {
            let name = self.string_literal()?;
            if !self.eat(")") {
                return None;
            }
            let root = if self.eat(".item") {
                Root::NodePaired(name)
            } else if self.eat(".first()") {
                Root::NodeFirst(name)
            } else if self.eat(".last()") {
                Root::NodeLast(name)
            } else {
                return None;
            };
            return Some((root, self.section()?));
        }
        None
    }

    fn section(&mut self) -> Option<Section> {
        if self.eat(".json") {
            Some(Section::Json)
        } else if self.eat(".binary") {
            Some(Section::Binary)
        } else {
            None
        }
    }

    fn string_literal(&mut self) -> Option<String> {
        let quote = self.rest.chars().next().filter(|c| *c == '"' || *c == '\'')?;
        let body = &self.rest[1..];
        let end = body.find(quote)?;
        let value = &body[..end];
        if value.contains('\\') {
            return None;
        }
        self.rest = &body[end + 1..];
        Some(value.to_string())
    }

    fn identifier(&mut self) -> Option<&'a str> {
        let end = self
            .rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(self.rest.len());
        if end == 0 {
            return None;
        }
        let (ident, rest) = self.rest.split_at(end);
        self.rest = rest;
        Some(ident)
    }

    /// Remaining `.key`, `["key"]` and `[0]` segments as a JSONPath
    fn segments(&mut self) -> Option<String> {
        let mut path = String::from("$");
        loop {
            if self.eat(".") {
                let key = self.identifier()?;
                push_key(&mut path, key)?;
            } else if self.eat("[") {
                if let Some(key) = self.string_literal() {
                    push_key(&mut path, &key)?;
                } else {
                    let end = self.rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(self.rest.len());
                    if end == 0 {
                        return None;
                    }
                    path.push('[');
                    path.push_str(&self.rest[..end]);
                    path.push(']');
                    self.rest = &self.rest[end..];
                }
                if !self.eat("]") {
                    return None;
                }
            } else {
                return Some(path);
            }
        }
    }
}

fn push_key(path: &mut String, key: &str) -> Option<()> {
    if key.contains('\'') {
        return None;
    }
    if !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        path.push('.');
        path.push_str(key);
    } else {
        path.push_str("['");
        path.push_str(key);
        path.push_str("']");
    }
    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_plain_references() {
        let r = parse("$json.user.name").unwrap();
        assert_eq!(r.root, Root::Item);
        assert_eq!(r.json_path, "$.user.name");

        let r = parse(r#" $node["Fetch Users"].json.items[0] "#).unwrap();
        assert_eq!(r.root, Root::NodePaired("Fetch Users".into()));
        assert_eq!(r.json_path, "$.items[0]");

        let r = parse("$('Fetch').first().json['display name']").unwrap();
        assert_eq!(r.root, Root::NodeFirst("Fetch".into()));
        assert_eq!(r.json_path, "$['display name']");

        let r = parse("$input.last().binary").unwrap();
        assert_eq!(r.root, Root::InputLast);
        assert_eq!(r.section, Section::Binary);
        assert_eq!(r.json_path, "$");
    }

    #[test]
    fn anything_else_falls_through() {
        assert!(parse("$json.value % 2 == 0").is_none());
        assert!(parse("$json.name .. '!'").is_none());
        assert!(parse("$('A').all()").is_none());
        assert!(parse("1 + 1").is_none());
    }

    #[test]
    fn select_returns_null_for_missing_fields() {
        let value = json!({"user": {"name": "ada"}, "tags": ["a", "b"]});
        assert_eq!(select(&value, "$.user.name").unwrap(), json!("ada"));
        assert_eq!(select(&value, "$.tags[1]").unwrap(), json!("b"));
        assert_eq!(select(&value, "$.missing").unwrap(), Value::Null);
        assert_eq!(select(&value, "$").unwrap(), value);
    }
}
