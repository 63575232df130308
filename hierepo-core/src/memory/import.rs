//! Document-view XML import
//!
//! Each element becomes a node named after the element; attributes become
//! string properties, except `jcr:primaryType`, `jcr:mixinTypes` and
//! `jcr:uuid` which set the node's types and identity. Text content is
//! ignored.

use super::batch::{check_referential_integrity, sync_type_properties};
use super::schema::{is_protected, Schema};
use super::tree::{MemProperty, WorkspaceTree};
use super::versions::VersionStore;
use crate::error::{RepositoryError, Result};
use crate::event::Event;
use crate::name::{names, well_known, Name};
use crate::service::ImportUuidBehavior;
use crate::value::QValue;
use quick_xml::events::{BytesStart, Event as XmlEvent};
use quick_xml::Reader;

/// Element of the parsed document
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ImportedNode {
    pub name: Name,
    pub attributes: Vec<(Name, String)>,
    pub children: Vec<ImportedNode>,
}

impl ImportedNode {
    fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(n, _)| n.as_str() == name)
            .map(|(_, v)| v.as_str())
    }
}

fn invalid(e: impl std::fmt::Display) -> RepositoryError {
    RepositoryError::InvalidPayload(format!("malformed import document: {}", e))
}

fn element(start: &BytesStart<'_>) -> Result<ImportedNode> {
    let qname = start.name();
    let name = std::str::from_utf8(qname.as_ref()).map_err(invalid)?;
    let mut attributes = Vec::new();
    for attribute in start.attributes() {
        let attribute = attribute.map_err(invalid)?;
        let key = std::str::from_utf8(attribute.key.as_ref()).map_err(invalid)?;
        if key == "xmlns" || key.starts_with("xmlns:") {
            continue;
        }
        let value = attribute.unescape_value().map_err(invalid)?;
        attributes.push((Name::new(key)?, value.into_owned()));
    }
    Ok(ImportedNode {
        name: Name::new(name)?,
        attributes,
        children: Vec::new(),
    })
}

/// Parse a document-view XML document into its element tree
pub(crate) fn parse_document(xml: &[u8]) -> Result<ImportedNode> {
    let text = std::str::from_utf8(xml).map_err(invalid)?;
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut stack: Vec<ImportedNode> = Vec::new();
    let mut document = None;

    loop {
        let finished = match reader.read_event_into(&mut buf).map_err(invalid)? {
            XmlEvent::Start(ref e) => {
                stack.push(element(e)?);
                None
            }
            XmlEvent::Empty(ref e) => Some(element(e)?),
            XmlEvent::End(_) => Some(stack.pop().ok_or_else(|| invalid("unbalanced end tag"))?),
            XmlEvent::Eof => break,
            _ => None,
        };
        if let Some(node) = finished {
            match stack.last_mut() {
                Some(parent) => parent.children.push(node),
                None if document.is_none() => document = Some(node),
                None => return Err(invalid("more than one root element")),
            }
        }
        buf.clear();
    }

    if !stack.is_empty() {
        return Err(invalid("unexpected end of document"));
    }
    document.ok_or_else(|| invalid("no root element"))
}

struct Importer<'a> {
    tree: &'a mut WorkspaceTree,
    store: &'a mut VersionStore,
    schema: Schema<'a>,
    behavior: ImportUuidBehavior,
    events: Vec<Event>,
    removed: Vec<String>,
}

impl Importer<'_> {
    /// Parent and unique id for a node carrying `uuid`, after resolving a
    /// collision with an existing node.
    fn place(&mut self, parent: &str, uuid: Option<&str>) -> Result<(String, Option<String>)> {
        let Some(uuid) = uuid.filter(|u| self.tree.contains(u)) else {
            return Ok((parent.to_string(), uuid.map(str::to_string)));
        };
        let existing_parent = self.tree.node(uuid)?.parent.clone();

        match self.behavior {
            ImportUuidBehavior::CreateNew => Ok((parent.to_string(), None)),
            ImportUuidBehavior::CollisionThrow => Err(RepositoryError::ItemExists(format!(
                "node with id {} already exists at {}",
                uuid,
                self.tree.path_of(uuid)?
            ))),
            ImportUuidBehavior::RemoveExisting | ImportUuidBehavior::ReplaceExisting => {
                if uuid == parent || self.tree.is_ancestor(uuid, parent) {
                    return Err(RepositoryError::ConstraintViolation(format!(
                        "importing {} would remove the import target",
                        uuid
                    )));
                }
                let Some(existing_parent) = existing_parent else {
                    return Err(RepositoryError::ConstraintViolation(
                        "cannot replace the root node".to_string(),
                    ));
                };
                self.removed.extend(self.tree.descendants(uuid));
                self.events.extend(self.tree.remove_node(uuid)?);
                let target = if self.behavior == ImportUuidBehavior::ReplaceExisting {
                    existing_parent
                } else {
                    parent.to_string()
                };
                Ok((target, Some(uuid.to_string())))
            }
        }
    }

    fn import(&mut self, parent: &str, node: &ImportedNode) -> Result<()> {
        self.schema.check_name(&node.name)?;
        let primary_type = match node.attribute(names::JCR_PRIMARY_TYPE) {
            Some(raw) => Name::new(raw)?,
            None => well_known(names::NT_UNSTRUCTURED),
        };
        self.schema.check_primary_type(&primary_type)?;
        let mixins = node
            .attribute(names::JCR_MIXIN_TYPES)
            .map(|raw| raw.split_whitespace().map(Name::new).collect::<Result<Vec<_>>>())
            .transpose()?
            .unwrap_or_default();
        for mixin in &mixins {
            self.schema.check_mixin(mixin)?;
        }

        let (parent, uuid) = self.place(parent, node.attribute(names::JCR_UUID))?;
        let (uuid, event) = self.tree.add_node(&parent, node.name.clone(), primary_type, uuid)?;
        self.events.push(event);
        self.events.extend(self.tree.set_mixins(&uuid, mixins)?);

        for (name, value) in &node.attributes {
            if is_protected(name) {
                continue;
            }
            self.schema.check_name(name)?;
            let property = MemProperty::single(QValue::String(value.clone()));
            self.events.extend(self.tree.set_property(&uuid, name, property)?);
        }
        self.events
            .extend(sync_type_properties(self.tree, self.store, self.schema, &uuid)?);

        for child in &node.children {
            self.import(&uuid, child)?;
        }
        Ok(())
    }
}

/// Import `document` below `parent`; returns the events of the import.
pub(crate) fn import_document(
    tree: &mut WorkspaceTree,
    store: &mut VersionStore,
    schema: Schema<'_>,
    parent: &str,
    document: &ImportedNode,
    behavior: ImportUuidBehavior,
) -> Result<Vec<Event>> {
    let mut importer = Importer {
        tree,
        store,
        schema,
        behavior,
        events: Vec::new(),
        removed: Vec::new(),
    };
    importer.import(parent, document)?;
    check_referential_integrity(importer.tree, &importer.removed)?;
    Ok(importer.events)
}
