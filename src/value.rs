use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;

/// Runtime value. The union is closed: no other kinds exist at runtime.
///
/// Lists and maps are shared references, so values reached through two
/// variables alias each other (a method mutating its receiver is visible
/// to the caller). Strings are immutable; sequence operations on them
/// rebuild the string and rebind the variable.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
    #[default]
    Nil,
    Int(i64),
    Str(String),
    List(Rc<RefCell<Vec<Value>>>),
    Map(Rc<RefCell<IndexMap<String, Value>>>),
}

impl Value {
    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn map(entries: IndexMap<String, Value>) -> Self {
        Value::Map(Rc::new(RefCell::new(entries)))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Int(_) => "int",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    /// Rendering used by `prt`, `str` and string concatenation: bare
    /// strings stay unquoted at the top level, container elements render
    /// in literal form.
    pub fn display(&self) -> String {
        match self {
            Value::Str(text) => text.clone(),
            other => other.repr(),
        }
    }

    fn repr(&self) -> String {
        match self {
            Value::Nil => "nil".to_string(),
            Value::Int(value) => value.to_string(),
            Value::Str(text) => format!("'{text}'"),
            Value::List(items) => {
                let rendered = items
                    .borrow()
                    .iter()
                    .map(Value::repr)
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("[{rendered}]")
            }
            Value::Map(entries) => {
                let rendered = entries
                    .borrow()
                    .iter()
                    .map(|(key, value)| format!("'{key}': {}", value.repr()))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{{{rendered}}}")
            }
        }
    }

    /// Map keys are strings; integer keys are accepted through their
    /// decimal form.
    pub fn as_map_key(&self) -> Option<String> {
        match self {
            Value::Str(text) => Some(text.clone()),
            Value::Int(value) => Some(value.to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_equality_is_deep() {
        let left = Value::list(vec![Value::Int(1), Value::Str("a".to_string())]);
        let right = Value::list(vec![Value::Int(1), Value::Str("a".to_string())]);
        assert_eq!(left, right);

        let shorter = Value::list(vec![Value::Int(1)]);
        assert_ne!(left, shorter);

        let nested_left = Value::list(vec![left.clone()]);
        let nested_right = Value::list(vec![right.clone()]);
        assert_eq!(nested_left, nested_right);
    }

    #[test]
    fn lists_alias_through_clone() {
        let original = Value::list(vec![Value::Int(1)]);
        let alias = original.clone();
        if let Value::List(items) = &alias {
            items.borrow_mut().push(Value::Int(2));
        }
        if let Value::List(items) = &original {
            assert_eq!(items.borrow().len(), 2);
        }
    }

    #[test]
    fn display_keeps_top_level_strings_raw() {
        assert_eq!(Value::Str("ab".to_string()).display(), "ab");
        assert_eq!(Value::Int(7).display(), "7");
        assert_eq!(Value::Nil.display(), "nil");
        let list = Value::list(vec![Value::Int(1), Value::Str("a".to_string())]);
        assert_eq!(list.display(), "[1, 'a']");
        let mut entries = IndexMap::new();
        entries.insert("k".to_string(), Value::Int(1));
        assert_eq!(Value::map(entries).display(), "{'k': 1}");
    }

    #[test]
    fn map_keys_coerce_from_ints() {
        assert_eq!(Value::Int(3).as_map_key().as_deref(), Some("3"));
        assert_eq!(
            Value::Str("x".to_string()).as_map_key().as_deref(),
            Some("x")
        );
        assert_eq!(Value::Nil.as_map_key(), None);
    }
}
