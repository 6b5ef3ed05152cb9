//! Breakpoint data model.

use serde::{Deserialize, Serialize};

/// Whether a breakpoint applies to every instance of a definition or to a
/// single process instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakpointScope {
    Definition,
    Instance,
}

/// Interrupts execution of a flow node when it reaches a given state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakpoint {
    /// Assigned by the store on insert.
    pub id: i64,
    pub definition_id: i64,
    /// Set for instance-scoped breakpoints only.
    pub instance_id: Option<i64>,
    pub element_name: String,
    pub state_id: i32,
    /// Interrupt after the state is executed rather than before.
    pub interrupt_after: bool,
    pub scope: BreakpointScope,
}

impl Breakpoint {
    pub fn for_definition(
        definition_id: i64,
        element_name: impl Into<String>,
        state_id: i32,
        interrupt_after: bool,
    ) -> Self {
        Self {
            id: 0,
            definition_id,
            instance_id: None,
            element_name: element_name.into(),
            state_id,
            interrupt_after,
            scope: BreakpointScope::Definition,
        }
    }

    pub fn for_instance(
        definition_id: i64,
        instance_id: i64,
        element_name: impl Into<String>,
        state_id: i32,
        interrupt_after: bool,
    ) -> Self {
        Self {
            id: 0,
            definition_id,
            instance_id: Some(instance_id),
            element_name: element_name.into(),
            state_id,
            interrupt_after,
            scope: BreakpointScope::Instance,
        }
    }

    /// Cache key: owner is the instance for instance scope, the definition
    /// otherwise.
    pub fn key(&self) -> BreakpointKey {
        let owner_id = match (self.scope, self.instance_id) {
            (BreakpointScope::Instance, Some(instance_id)) => instance_id,
            _ => self.definition_id,
        };
        BreakpointKey {
            scope: self.scope,
            owner_id,
            element_name: self.element_name.clone(),
            state_id: self.state_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BreakpointKey {
    pub scope: BreakpointScope,
    pub owner_id: i64,
    pub element_name: String,
    pub state_id: i32,
}

impl BreakpointKey {
    pub fn new(
        scope: BreakpointScope,
        owner_id: i64,
        element_name: impl Into<String>,
        state_id: i32,
    ) -> Self {
        Self {
            scope,
            owner_id,
            element_name: element_name.into(),
            state_id,
        }
    }
}
