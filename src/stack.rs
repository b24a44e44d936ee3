//! Stack frames of the interpreted call stack.

use rpds::{RedBlackTreeMap, RedBlackTreeMapSync};

use crate::machine::CType;
use crate::types::ObjectId;

/// Label of the object holding a function's return value.
pub const RETVAL_LABEL: &str = "__retval__";

/// What the domain needs to know about a called function.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FunctionDecl {
    pub name: String,
    /// `None` for `void` functions.
    pub return_type: Option<CType>,
    pub parameters: Vec<(String, CType)>,
}

impl FunctionDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            return_type: None,
            parameters: Vec::new(),
        }
    }

    pub fn returning(mut self, ty: CType) -> Self {
        self.return_type = Some(ty);
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, ty: CType) -> Self {
        self.parameters.push((name.into(), ty));
        self
    }
}

/// One activation record: the local variables of a function call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    function: String,
    variables: RedBlackTreeMapSync<String, ObjectId>,
    return_object: Option<ObjectId>,
}

impl StackFrame {
    pub fn new(function: impl Into<String>, return_object: Option<ObjectId>) -> Self {
        Self {
            function: function.into(),
            variables: RedBlackTreeMap::new_sync(),
            return_object,
        }
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn variable(&self, name: &str) -> Option<ObjectId> {
        self.variables.get(name).copied()
    }

    pub fn contains_variable(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    /// Variables in name order.
    pub fn variables(&self) -> impl Iterator<Item = (&str, ObjectId)> {
        self.variables.iter().map(|(name, id)| (name.as_str(), *id))
    }

    pub fn return_object(&self) -> Option<ObjectId> {
        self.return_object
    }

    /// Every object owned by the frame, the return object included.
    pub fn objects(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.variables.values().copied().chain(self.return_object)
    }

    /// The frame with `name` bound to `object`. Callers check for duplicates first.
    pub(crate) fn with_variable(&self, name: &str, object: ObjectId) -> Self {
        Self {
            variables: self.variables.insert(name.to_string(), object),
            ..self.clone()
        }
    }

    /// Checks whether both frames belong to the same function and declare the same names.
    pub fn same_layout(&self, other: &StackFrame) -> bool {
        self.function == other.function
            && self.return_object.is_some() == other.return_object.is_some()
            && self.variables.size() == other.variables.size()
            && self.variables.keys().all(|name| other.variables.contains_key(name))
    }
}
