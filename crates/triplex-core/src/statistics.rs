//! Diagnostics reports produced by the indexes
//!
//! Every structure can describe itself as a tree of named integer and floating-point
//! items. Reporting tools consume the tree either as indented text or as JSON.

use crate::error::StoreResult;
use serde::Serialize;
use std::fmt;

/// Value of a single report item
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StatisticsValue {
    Integer(u64),
    Float(f64),
}

impl fmt::Display for StatisticsValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatisticsValue::Integer(value) => write!(f, "{value}"),
            StatisticsValue::Float(value) => write!(f, "{value:.2}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatisticsItem {
    pub name: String,
    pub value: StatisticsValue,
}

/// Named set of metrics with nested subcomponents
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentStatistics {
    name: String,
    items: Vec<StatisticsItem>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    subcomponents: Vec<ComponentStatistics>,
}

impl ComponentStatistics {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), items: Vec::new(), subcomponents: Vec::new() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn items(&self) -> &[StatisticsItem] {
        &self.items
    }

    pub fn subcomponents(&self) -> &[ComponentStatistics] {
        &self.subcomponents
    }

    pub fn add_integer_item(&mut self, name: impl Into<String>, value: u64) {
        self.items.push(StatisticsItem { name: name.into(), value: StatisticsValue::Integer(value) });
    }

    pub fn add_float_item(&mut self, name: impl Into<String>, value: f64) {
        self.items.push(StatisticsItem { name: name.into(), value: StatisticsValue::Float(value) });
    }

    pub fn add_subcomponent(&mut self, subcomponent: ComponentStatistics) {
        self.subcomponents.push(subcomponent);
    }

    pub fn integer_item(&self, name: &str) -> Option<u64> {
        self.items.iter().find(|item| item.name == name).and_then(|item| match item.value {
            StatisticsValue::Integer(value) => Some(value),
            StatisticsValue::Float(_) => None,
        })
    }

    pub fn float_item(&self, name: &str) -> Option<f64> {
        self.items.iter().find(|item| item.name == name).and_then(|item| match item.value {
            StatisticsValue::Float(value) => Some(value),
            StatisticsValue::Integer(_) => None,
        })
    }

    pub fn subcomponent(&self, name: &str) -> Option<&ComponentStatistics> {
        self.subcomponents.iter().find(|component| component.name == name)
    }

    pub fn to_json(&self) -> StoreResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    fn write_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let indent = "    ".repeat(depth);
        writeln!(f, "{indent}{}", self.name)?;
        for item in &self.items {
            writeln!(f, "{indent}    {}: {}", item.name, item.value)?;
        }
        for subcomponent in &self.subcomponents {
            subcomponent.write_indented(f, depth + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for ComponentStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_indented(f, 0)
    }
}
