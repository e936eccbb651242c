//! Task description templates and argument bindings.
//!
//! A template such as `"merge {a} and {b}, sort them"` is split into text fragments
//! and placeholders. Bindings are matched to placeholders by name, and positional
//! bindings fill the remaining placeholders in order of first appearance.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::core::LambdaValue;

/// One piece of a parsed task template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Fragment {
    Text(String),
    Placeholder(String),
}

/// A parsed task template. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescription {
    fragments: Vec<Fragment>,
}

/// A live argument value, optionally addressed by placeholder name.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub name: Option<String>,
    pub value: LambdaValue,
}

impl Binding {
    pub fn positional(value: impl Into<LambdaValue>) -> Self {
        Self {
            name: None,
            value: value.into(),
        }
    }

    pub fn named(name: impl Into<String>, value: impl Into<LambdaValue>) -> Self {
        Self {
            name: Some(name.into()),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindError {
    #[error("placeholder '{{{0}}}' has no bound argument")]
    Unbound(String),

    #[error("named argument '{0}' does not match any placeholder")]
    UnknownName(String),

    #[error("argument '{0}' is bound more than once")]
    Duplicate(String),

    #[error("unterminated placeholder starting at byte {0}")]
    Unterminated(usize),
}

/// The bindings of one call, resolved into ordered parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedArgs {
    pub names: Vec<String>,
    pub values: Vec<LambdaValue>,
}

impl ResolvedArgs {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &LambdaValue)> {
        self.names.iter().map(String::as_str).zip(self.values.iter())
    }
}

impl TaskDescription {
    /// Parses a template. `{{` and `}}` are literal braces.
    pub fn parse(template: &str) -> Result<Self, BindError> {
        let mut fragments = Vec::new();
        let mut text = String::new();
        let mut chars = template.char_indices().peekable();

        while let Some((i, c)) = chars.next() {
            match c {
                '{' if matches!(chars.peek(), Some((_, '{'))) => {
                    chars.next();
                    text.push('{');
                }
                '}' if matches!(chars.peek(), Some((_, '}'))) => {
                    chars.next();
                    text.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for (_, c) in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        name.push(c);
                    }
                    if !closed {
                        return Err(BindError::Unterminated(i));
                    }
                    if !text.is_empty() {
                        fragments.push(Fragment::Text(std::mem::take(&mut text)));
                    }
                    fragments.push(Fragment::Placeholder(name.trim().to_string()));
                }
                _ => text.push(c),
            }
        }
        if !text.is_empty() {
            fragments.push(Fragment::Text(text));
        }
        Ok(Self { fragments })
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    /// Distinct placeholder names in order of first appearance.
    pub fn placeholders(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for fragment in &self.fragments {
            if let Fragment::Placeholder(name) = fragment {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
        }
        names
    }

    /// Matches bindings to placeholders and returns the ordered parameter list.
    ///
    /// Named bindings take their placeholder; positional bindings fill the
    /// remaining placeholders in order, and any surplus becomes `arg<i>`.
    pub fn bind(&self, bindings: &[Binding]) -> Result<ResolvedArgs, BindError> {
        let placeholders = self.placeholders();
        let mut slots: Vec<Option<LambdaValue>> = vec![None; placeholders.len()];
        let mut extra_names = Vec::new();
        let mut extra_values = Vec::new();

        for binding in bindings.iter().filter(|b| b.name.is_some()) {
            let name = binding.name.as_deref().unwrap_or_default();
            let index = placeholders
                .iter()
                .position(|p| *p == name)
                .ok_or_else(|| BindError::UnknownName(name.to_string()))?;
            if slots[index].is_some() {
                return Err(BindError::Duplicate(name.to_string()));
            }
            slots[index] = Some(binding.value.clone());
        }

        let mut positional = bindings.iter().filter(|b| b.name.is_none());
        for slot in slots.iter_mut().filter(|s| s.is_none()) {
            match positional.next() {
                Some(binding) => *slot = Some(binding.value.clone()),
                None => break,
            }
        }
        for binding in positional {
            extra_names.push(format!("arg{}", placeholders.len() + extra_names.len()));
            extra_values.push(binding.value.clone());
        }

        let mut names = Vec::with_capacity(slots.len() + extra_names.len());
        let mut values = Vec::with_capacity(slots.len() + extra_values.len());
        for (name, slot) in placeholders.iter().zip(slots) {
            let value = slot.ok_or_else(|| BindError::Unbound(name.to_string()))?;
            names.push(name.to_string());
            values.push(value);
        }
        names.extend(extra_names);
        values.extend(extra_values);
        Ok(ResolvedArgs { names, values })
    }

    /// Whitespace-collapsed prompt with placeholders rendered by parameter position.
    pub fn normalized(&self) -> String {
        let placeholders = self.placeholders();
        let mut out = String::new();
        for fragment in &self.fragments {
            match fragment {
                Fragment::Text(text) => out.push_str(text),
                Fragment::Placeholder(name) => {
                    let index = placeholders.iter().position(|p| p == name).unwrap_or(0);
                    out.push_str(&format!("{{#{}}}", index));
                }
            }
        }
        out.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// The prompt as written, with placeholders shown by name.
    pub fn display_with_names(&self) -> String {
        let mut out = String::new();
        for fragment in &self.fragments {
            match fragment {
                Fragment::Text(text) => out.push_str(text),
                Fragment::Placeholder(name) => {
                    out.push('{');
                    out.push_str(name);
                    out.push('}');
                }
            }
        }
        out.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

impl fmt::Display for TaskDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_with_names())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_fragments() {
        let task = TaskDescription::parse("merge {a} and {b}").unwrap();
        assert_eq!(
            task.fragments(),
            &[
                Fragment::Text("merge ".into()),
                Fragment::Placeholder("a".into()),
                Fragment::Text(" and ".into()),
                Fragment::Placeholder("b".into()),
            ]
        );
    }

    #[test]
    fn test_escaped_braces() {
        let task = TaskDescription::parse("return {{\"k\": {x}}}").unwrap();
        assert_eq!(task.placeholders(), vec!["x"]);
        assert_eq!(task.normalized(), "return {\"k\": {#0}}");
    }

    #[test]
    fn test_unterminated_placeholder() {
        assert_eq!(
            TaskDescription::parse("read {file").unwrap_err(),
            BindError::Unterminated(5)
        );
    }

    #[test]
    fn test_normalization_ignores_whitespace_and_names() {
        let a = TaskDescription::parse("parse  csv file {fname},\n return header").unwrap();
        let b = TaskDescription::parse("parse csv file {path}, return header ").unwrap();
        assert_eq!(a.normalized(), b.normalized());
        assert_eq!(a.normalized(), "parse csv file {#0}, return header");
    }

    #[test]
    fn test_positional_binding_order_of_appearance() {
        let task = TaskDescription::parse("join {r1} {r2} with headers {h1}, {h2}, again {r1}")
            .unwrap();
        let args = task
            .bind(&[
                Binding::positional(json!(1)),
                Binding::positional(json!(2)),
                Binding::positional(json!(3)),
                Binding::positional(json!(4)),
            ])
            .unwrap();
        assert_eq!(args.names, vec!["r1", "r2", "h1", "h2"]);
        assert_eq!(args.values, vec![json!(1), json!(2), json!(3), json!(4)]);
    }

    #[test]
    fn test_named_and_positional_mix() {
        let task = TaskDescription::parse("{a} then {b}").unwrap();
        let args = task
            .bind(&[Binding::named("b", json!("B")), Binding::positional(json!("A"))])
            .unwrap();
        assert_eq!(args.values, vec![json!("A"), json!("B")]);
    }

    #[test]
    fn test_surplus_and_missing_bindings() {
        let task = TaskDescription::parse("sum numbers").unwrap();
        let args = task.bind(&[Binding::positional(json!([1, 2]))]).unwrap();
        assert_eq!(args.names, vec!["arg0"]);

        let task = TaskDescription::parse("{a} and {b}").unwrap();
        assert_eq!(
            task.bind(&[Binding::positional(json!(1))]).unwrap_err(),
            BindError::Unbound("b".into())
        );
        assert_eq!(
            task.bind(&[Binding::named("c", json!(1))]).unwrap_err(),
            BindError::UnknownName("c".into())
        );
    }

    #[test]
    fn test_empty_bindings_allowed() {
        let task = TaskDescription::parse("return the first ten primes").unwrap();
        let args = task.bind(&[]).unwrap();
        assert!(args.is_empty());
    }
}
