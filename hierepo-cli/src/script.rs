//! JSON change scripts
//!
//! A script is a JSON array of steps addressed by absolute paths:
//!
//! ```json
//! [
//!   { "op": "add_node", "parent": "/", "name": "docs" },
//!   { "op": "add_property", "parent": "/docs", "name": "title", "values": [{ "String": "Docs" }] },
//!   { "op": "set_mixins", "node": "/docs", "mixins": ["mix:versionable"] }
//! ]
//! ```
//!
//! All steps of a script are applied as one change log.

use anyhow::{anyhow, Context, Result};
use hierepo_core::{ChangeLog, IdFactory, Name, NodeId, Operation, Path, PropertyId, QValue};
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", deny_unknown_fields)]
pub enum Step {
    AddNode {
        parent: Path,
        name: Name,
        #[serde(default)]
        node_type: Option<Name>,
        #[serde(default)]
        uuid: Option<String>,
    },
    /// A single value makes a single-valued property unless `multi` is set
    AddProperty {
        parent: Path,
        name: Name,
        values: Vec<QValue>,
        #[serde(default)]
        multi: bool,
    },
    SetValue {
        property: Path,
        values: Vec<QValue>,
        #[serde(default)]
        multi: bool,
    },
    RemoveNode {
        path: Path,
    },
    RemoveProperty {
        path: Path,
    },
    SetMixins {
        node: Path,
        mixins: Vec<Name>,
    },
    Reorder {
        parent: Path,
        insert: Path,
        #[serde(default)]
        before: Option<Path>,
    },
    Move {
        source: Path,
        dest_parent: Path,
        dest_name: Name,
    },
}

pub fn parse(data: &str) -> Result<Vec<Step>> {
    serde_json::from_str(data).context("Failed to parse change script")
}

/// Translate `steps` into one change log targeting the root
pub fn change_log(steps: &[Step], ids: &dyn IdFactory) -> Result<ChangeLog> {
    let mut log = ChangeLog::new(node(&Path::root())?);
    for (index, step) in steps.iter().enumerate() {
        let operation = operation(step, ids).with_context(|| format!("step {}", index + 1))?;
        log.push(operation);
    }
    Ok(log)
}

fn operation(step: &Step, ids: &dyn IdFactory) -> Result<Operation> {
    let op = match step {
        Step::AddNode {
            parent,
            name,
            node_type,
            uuid,
        } => Operation::AddNode {
            parent: node(parent)?,
            name: name.clone(),
            node_type: match node_type {
                Some(node_type) => node_type.clone(),
                None => Name::new("nt:unstructured")?,
            },
            uuid: uuid.clone(),
        },
        Step::AddProperty {
            parent,
            name,
            values,
            multi,
        } => {
            let property_type = value_type(values)?;
            Operation::AddProperty {
                parent: node(parent)?,
                name: name.clone(),
                property_type,
                values: values.clone(),
                multi_valued: *multi || values.len() != 1,
            }
        }
        Step::SetValue {
            property: path,
            values,
            multi,
        } => Operation::SetPropertyValue {
            property: property(path, ids)?,
            property_type: value_type(values)?,
            values: values.clone(),
            multi_valued: *multi || values.len() != 1,
        },
        Step::RemoveNode { path } => Operation::remove(node(path)?),
        Step::RemoveProperty { path } => Operation::remove(property(path, ids)?),
        Step::SetMixins { node: path, mixins } => Operation::SetMixin {
            node: node(path)?,
            mixins: mixins.clone(),
        },
        Step::Reorder {
            parent,
            insert,
            before,
        } => Operation::ReorderNodes {
            parent: node(parent)?,
            insert: node(insert)?,
            before: before.as_ref().map(node).transpose()?,
        },
        Step::Move {
            source,
            dest_parent,
            dest_name,
        } => Operation::move_node(node(source)?, node(dest_parent)?, dest_name.clone()),
    };
    Ok(op)
}

pub fn node(path: &Path) -> Result<NodeId> {
    Ok(NodeId::from_path(path.clone())?)
}

fn property(path: &Path, ids: &dyn IdFactory) -> Result<PropertyId> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("{} does not name a property", path))?;
    let name = path
        .name()
        .cloned()
        .ok_or_else(|| anyhow!("{} does not name a property", path))?;
    Ok(ids.create_property_id(&node(&parent)?, name))
}

fn value_type(values: &[QValue]) -> Result<hierepo_core::PropertyType> {
    values
        .first()
        .map(QValue::property_type)
        .ok_or_else(|| anyhow!("at least one value is required"))
}
