//! Session-scoped node locks

use super::tree::{node_id, LockRecord, MemProperty, WorkspaceTree};
use crate::error::{RepositoryError, Result};
use crate::event::Event;
use crate::name::{names, well_known};
use crate::service::LockInfo;
use crate::value::QValue;
use chrono::Utc;

fn lock_info(holder: &str, lock: &LockRecord, tokens: &[String]) -> LockInfo {
    LockInfo {
        node: node_id(holder),
        token: tokens.contains(&lock.token).then(|| lock.token.clone()),
        owner: lock.owner.clone(),
        is_deep: lock.is_deep,
        is_session_scoped: true,
        created_at: lock.created_at,
    }
}

/// Lock that applies to `uuid`, either its own or a deep lock above it
pub(crate) fn lock_info_for(tree: &WorkspaceTree, uuid: &str, tokens: &[String]) -> Option<LockInfo> {
    tree.lock_holder(uuid)
        .map(|(holder, lock)| lock_info(holder, lock, tokens))
}

/// Lock `uuid`; returns the new lock and the events of the lock properties.
pub(crate) fn lock(
    tree: &mut WorkspaceTree,
    uuid: &str,
    session_id: &str,
    owner: &str,
    deep: bool,
) -> Result<(LockInfo, Vec<Event>)> {
    if let Some((holder, _)) = tree.lock_holder(uuid) {
        return Err(RepositoryError::Lock(format!(
            "{} is already locked",
            tree.path_of(holder)?
        )));
    }
    if deep {
        let below = tree.descendants(uuid);
        if let Some(locked) = below.iter().skip(1).find(|d| tree.locks.contains_key(d.as_str())) {
            return Err(RepositoryError::Lock(format!(
                "{} holds a lock below the requested deep lock",
                tree.path_of(locked)?
            )));
        }
    }

    let record = LockRecord {
        token: uuid::Uuid::new_v4().to_string(),
        owner: owner.to_string(),
        session_id: session_id.to_string(),
        is_deep: deep,
        created_at: Utc::now(),
    };
    let mut events = Vec::new();
    events.extend(tree.set_property(
        uuid,
        &well_known(names::JCR_LOCK_OWNER),
        MemProperty::single(QValue::String(owner.to_string())),
    )?);
    events.extend(tree.set_property(
        uuid,
        &well_known(names::JCR_LOCK_IS_DEEP),
        MemProperty::single(QValue::Boolean(deep)),
    )?);
    let info = lock_info(uuid, &record, std::slice::from_ref(&record.token));
    tree.locks.insert(uuid.to_string(), record);
    Ok((info, events))
}

fn held_lock<'t>(tree: &'t WorkspaceTree, uuid: &str, tokens: &[String]) -> Result<&'t LockRecord> {
    let Some(lock) = tree.locks.get(uuid) else {
        return Err(RepositoryError::Lock(format!("{} is not locked", tree.path_of(uuid)?)));
    };
    if !tokens.contains(&lock.token) {
        return Err(RepositoryError::Lock(format!(
            "session does not hold the lock on {}",
            tree.path_of(uuid)?
        )));
    }
    Ok(lock)
}

/// Session-scoped locks never expire, so a refresh only validates ownership
pub(crate) fn refresh(tree: &WorkspaceTree, uuid: &str, tokens: &[String]) -> Result<()> {
    held_lock(tree, uuid, tokens).map(|_| ())
}

/// Release the lock on `uuid`; returns the released token
pub(crate) fn unlock(
    tree: &mut WorkspaceTree,
    uuid: &str,
    tokens: &[String],
) -> Result<(String, Vec<Event>)> {
    let token = held_lock(tree, uuid, tokens)?.token.clone();
    tree.locks.remove(uuid);
    Ok((token, remove_lock_properties(tree, uuid)?))
}

fn remove_lock_properties(tree: &mut WorkspaceTree, uuid: &str) -> Result<Vec<Event>> {
    let mut events = Vec::new();
    for name in [names::JCR_LOCK_OWNER, names::JCR_LOCK_IS_DEEP] {
        events.extend(tree.remove_property_if_present(uuid, &well_known(name))?);
    }
    Ok(events)
}

/// Drop every lock taken by a session; returns the released tokens
pub(crate) fn release_session(
    tree: &mut WorkspaceTree,
    session_id: &str,
) -> Result<(Vec<String>, Vec<Event>)> {
    let held: Vec<(String, String)> = tree
        .locks
        .iter()
        .filter(|(_, lock)| lock.session_id == session_id)
        .map(|(uuid, lock)| (uuid.clone(), lock.token.clone()))
        .collect();

    let mut tokens = Vec::new();
    let mut events = Vec::new();
    for (uuid, token) in held {
        tree.locks.remove(&uuid);
        events.extend(remove_lock_properties(tree, &uuid)?);
        tokens.push(token);
    }
    Ok((tokens, events))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::tree::ROOT_UUID;
    use crate::name::Name;

    fn tree_with_child() -> (WorkspaceTree, String, String) {
        let mut tree = WorkspaceTree::new("default");
        let (a, _) = tree
            .add_node(ROOT_UUID, Name::new("a").unwrap(), well_known(names::NT_UNSTRUCTURED), None)
            .unwrap();
        let (b, _) = tree
            .add_node(&a, Name::new("b").unwrap(), well_known(names::NT_UNSTRUCTURED), None)
            .unwrap();
        (tree, a, b)
    }

    #[test]
    fn test_lock_unlock_roundtrip() {
        let (mut tree, a, _) = tree_with_child();
        let (info, events) = lock(&mut tree, &a, "s1", "alice", false).unwrap();
        assert_eq!(events.len(), 2);
        let token = info.token.clone().unwrap();
        assert_eq!(info.owner, "alice");

        let seen_by_other = lock_info_for(&tree, &a, &[]).unwrap();
        assert_eq!(seen_by_other.token, None);
        assert!(lock(&mut tree, &a, "s2", "bob", false).is_err());

        assert!(refresh(&tree, &a, &[]).is_err());
        refresh(&tree, &a, std::slice::from_ref(&token)).unwrap();

        assert!(unlock(&mut tree, &a, &[]).is_err());
        let (released, events) = unlock(&mut tree, &a, &[token.clone()]).unwrap();
        assert_eq!(released, token);
        assert_eq!(events.len(), 2);
        assert!(lock_info_for(&tree, &a, &[]).is_none());
    }

    #[test]
    fn test_deep_lock_conflicts() {
        let (mut tree, a, b) = tree_with_child();
        lock(&mut tree, &b, "s1", "alice", false).unwrap();
        assert!(lock(&mut tree, &a, "s2", "bob", true).is_err());
        lock(&mut tree, &a, "s2", "bob", false).unwrap();

        let (tokens, events) = release_session(&mut tree, "s1").unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(events.len(), 2);
        assert!(tree.locks.contains_key(&a));
        assert!(!tree.locks.contains_key(&b));
    }
}
