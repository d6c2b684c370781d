//! `{{currentUser.email}}`-style placeholders in condition tree values.

use std::sync::OnceLock;

use regex::{Captures, Regex};

use crate::caller::Caller;
use crate::condition_tree::ConditionTree;
use crate::error::{Result, ToolkitError};
use crate::value::{Record, Value};

const USER_PREFIX: &str = "currentUser.";
const USER_TAG_PREFIX: &str = "currentUser.tags.";
const USER_TEAM_PREFIX: &str = "currentUser.team.";

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| Regex::new(r"\{\{([^}]+)\}\}").unwrap_or_else(|_| unreachable!()))
}

/// Values a placeholder can resolve to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextVariables {
    pub team: Record,
    pub user: Record,
    pub request: Record,
}

impl ContextVariables {
    #[must_use]
    pub fn new(team: Record, user: Record, request: Record) -> Self {
        Self { team, user, request }
    }

    /// Variables describing `caller`: its user record, its team and its
    /// request values.
    #[must_use]
    pub fn from_caller(caller: &Caller) -> Self {
        let mut team = Record::new();
        team.insert("name".into(), Value::from(caller.team.as_str()));
        Self::new(team, caller.user_record(), caller.request.clone())
    }

    /// Resolves one key.
    ///
    /// `currentUser.team.X` reads the team, `currentUser.tags.X` the user
    /// tags, `currentUser.X` the user, anything else the request.
    ///
    /// # Errors
    ///
    /// Returns [`ToolkitError::ConditionTree`] for unknown keys.
    pub fn get_value(&self, key: &str) -> Result<Value> {
        let found = if let Some(name) = key.strip_prefix(USER_TEAM_PREFIX) {
            self.team.get(name)
        } else if let Some(name) = key.strip_prefix(USER_TAG_PREFIX) {
            self.user.get("tags").and_then(Value::as_record).and_then(|tags| tags.get(name))
        } else if let Some(name) = key.strip_prefix(USER_PREFIX) {
            self.user.get(name)
        } else {
            self.request.get(key)
        };
        found
            .cloned()
            .ok_or_else(|| ToolkitError::condition_tree(format!("unknown context variable '{key}'")))
    }

    /// Substitutes placeholders inside a value.
    ///
    /// A string made of a single placeholder takes the variable's value
    /// as is, so `{{currentUser.id}}` stays a number. Otherwise each
    /// placeholder is replaced by its textual rendering. Arrays are walked.
    ///
    /// # Errors
    ///
    /// See [`ContextVariables::get_value`].
    pub fn inject_in_value(&self, value: &Value) -> Result<Value> {
        match value {
            Value::String(text) => {
                if let Some(captures) = placeholder().captures(text) {
                    if captures.get(0).map(|m| m.as_str().len()) == Some(text.len()) {
                        return self.get_value(&captures[1]);
                    }
                } else {
                    return Ok(value.clone());
                }
                let mut failure = None;
                let replaced = placeholder().replace_all(text, |captures: &Captures<'_>| {
                    match self.get_value(&captures[1]) {
                        Ok(value) => value.display(),
                        Err(err) => {
                            failure.get_or_insert(err);
                            String::new()
                        }
                    }
                });
                match failure {
                    Some(err) => Err(err),
                    None => Ok(Value::String(replaced.into_owned())),
                }
            }
            Value::Array(items) => items
                .iter()
                .map(|item| self.inject_in_value(item))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            other => Ok(other.clone()),
        }
    }

    /// Substitutes placeholders in every leaf value of `tree`.
    ///
    /// # Errors
    ///
    /// See [`ContextVariables::get_value`].
    pub fn inject_in_tree(&self, tree: &ConditionTree) -> Result<ConditionTree> {
        tree.replace_leafs(|leaf| {
            Ok(ConditionTree::Leaf(leaf.override_value(self.inject_in_value(&leaf.value)?)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Operator;

    fn variables() -> ContextVariables {
        let caller = Caller::new(42, "ada@example.com")
            .with_name("Ada", "Lovelace")
            .with_team("Operations")
            .with_tag("region", "eu")
            .with_request_value("ip", "10.0.0.1");
        ContextVariables::from_caller(&caller)
    }

    #[test]
    fn resolves_each_prefix() {
        let vars = variables();
        assert_eq!(vars.get_value("currentUser.email").unwrap(), Value::from("ada@example.com"));
        assert_eq!(vars.get_value("currentUser.team.name").unwrap(), Value::from("Operations"));
        assert_eq!(vars.get_value("currentUser.tags.region").unwrap(), Value::from("eu"));
        assert_eq!(vars.get_value("ip").unwrap(), Value::from("10.0.0.1"));
        assert!(vars.get_value("currentUser.nope").is_err());
    }

    #[test]
    fn whole_placeholder_keeps_value_type() {
        let vars = variables();
        assert_eq!(vars.inject_in_value(&Value::from("{{currentUser.id}}")).unwrap(), Value::Int(42));
        assert_eq!(
            vars.inject_in_value(&Value::from("{{currentUser.firstName}}@{{currentUser.team.name}}")).unwrap(),
            Value::from("Ada@Operations")
        );
        assert_eq!(vars.inject_in_value(&Value::from("plain")).unwrap(), Value::from("plain"));
    }

    #[test]
    fn injects_in_tree_leaves() {
        let tree = ConditionTree::and(vec![
            ConditionTree::leaf("owner_id", Operator::Equal, "{{currentUser.id}}"),
            ConditionTree::leaf("region", Operator::In, vec![Value::from("{{currentUser.tags.region}}")]),
        ]);
        let injected = variables().inject_in_tree(&tree).unwrap();
        assert_eq!(injected.to_string(), "and(owner_id equal 42, region in [\"eu\"])");
    }

    #[test]
    fn unknown_variable_in_tree_fails() {
        let tree = ConditionTree::leaf("x", Operator::Equal, "{{missing}}");
        assert!(variables().inject_in_tree(&tree).is_err());
    }
}
