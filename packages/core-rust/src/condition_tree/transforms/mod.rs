//! Rewrite rules turning one operator into a tree of other operators.

mod comparison;
mod pattern;
mod time;

use std::collections::HashMap;
use std::sync::OnceLock;

use super::{ConditionTree, ConditionTreeLeaf};
use crate::clock::TimeContext;
use crate::error::Result;
use crate::schema::{ColumnType, Operator, PrimitiveType};

pub(crate) type Replacer =
    Box<dyn Fn(&ConditionTreeLeaf, &TimeContext, &ColumnType) -> Result<ConditionTree> + Send + Sync>;

/// One way of expressing an operator through others.
pub(crate) struct Alternative {
    /// Operators the produced tree uses.
    pub depends_on: Vec<Operator>,
    /// Column types the rule applies to; `None` means any.
    pub for_types: Option<Vec<PrimitiveType>>,
    pub replacer: Replacer,
}

impl Alternative {
    fn new(
        depends_on: impl Into<Vec<Operator>>,
        replacer: impl Fn(&ConditionTreeLeaf, &TimeContext, &ColumnType) -> Result<ConditionTree>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self { depends_on: depends_on.into(), for_types: None, replacer: Box::new(replacer) }
    }

    fn for_types(mut self, types: impl Into<Vec<PrimitiveType>>) -> Self {
        self.for_types = Some(types.into());
        self
    }

    pub(crate) fn applies_to(&self, column_type: &ColumnType) -> bool {
        match &self.for_types {
            None => true,
            Some(types) => column_type
                .as_primitive()
                .is_some_and(|primitive| types.contains(&primitive)),
        }
    }
}

/// Alternatives per operator, tried in order.
pub(crate) fn alternatives() -> &'static HashMap<Operator, Vec<Alternative>> {
    static TABLE: OnceLock<HashMap<Operator, Vec<Alternative>>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = HashMap::new();
        comparison::register(&mut table);
        pattern::register(&mut table);
        time::register(&mut table);
        table
    })
}
