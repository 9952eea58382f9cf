use crate::support::{ConnId, OpHandle, PackageId};
use crate::PACKAGE_ID_LEN;
use hashbrown::HashMap;
use indexmap::IndexSet;

/// Correlation tables mapping request handles, link/connection ids and
/// package ids to the contexts that care about them. Several contexts can
/// legitimately share a key, so every entry is a set; entries are pruned as
/// soon as they empty out. Contexts are referenced by handle only.
pub struct Registry {
    handle_map: HashMap<OpHandle, IndexSet<OpHandle>>,
    id_map: HashMap<String, IndexSet<OpHandle>>,
    package_map: HashMap<(PackageId, ConnId), IndexSet<OpHandle>>,

    // Packages received before any context registered their package id,
    // buffered raw (prefix included) until a registration drains them.
    unassociated: HashMap<PackageId, Vec<Vec<u8>>>,
}

impl Registry {
    #[inline]
    pub fn new() -> Registry {
        Registry {
            handle_map: HashMap::new(),
            id_map: HashMap::new(),
            package_map: HashMap::new(),
            unassociated: HashMap::new(),
        }
    }

    #[inline]
    pub fn register_handle(&mut self, key: OpHandle, context: OpHandle) {
        self.handle_map.entry(key).or_default().insert(context);
    }

    #[inline]
    pub fn register_id(&mut self, key: &str, context: OpHandle) {
        self.id_map.entry(key.into()).or_default().insert(context);
    }

    /// Registers a package id scoped to a connection and drains any packages
    /// that were buffered against that id before the registration. The
    /// returned payloads have the prefix stripped; each buffered package is
    /// delivered exactly once.
    pub fn register_package_id(
        &mut self,
        package_id: PackageId,
        conn_id: &ConnId,
        context: OpHandle,
    ) -> Vec<Vec<u8>> {
        self.package_map
            .entry((package_id, conn_id.clone()))
            .or_default()
            .insert(context);

        match self.unassociated.remove(&package_id) {
            Some(packages) => packages
                .into_iter()
                .map(|raw| raw[PACKAGE_ID_LEN..].to_vec())
                .collect(),
            None => Vec::new(),
        }
    }

    #[inline]
    pub fn unregister_handle(&mut self, key: OpHandle, context: OpHandle) {
        if let Some(contexts) = self.handle_map.get_mut(&key) {
            contexts.shift_remove(&context);
            if contexts.is_empty() {
                self.handle_map.remove(&key);
            }
        }
    }

    /// Buffers a package whose id nothing has registered yet.
    #[inline]
    pub fn buffer_unassociated(&mut self, package_id: PackageId, raw: Vec<u8>) {
        self.unassociated.entry(package_id).or_default().push(raw);
    }

    #[inline]
    pub fn contexts_for_handle(&self, key: OpHandle) -> Vec<OpHandle> {
        match self.handle_map.get(&key) {
            Some(contexts) => contexts.iter().copied().collect(),
            None => Vec::new(),
        }
    }

    #[inline]
    pub fn contexts_for_id(&self, key: &str) -> Vec<OpHandle> {
        match self.id_map.get(key) {
            Some(contexts) => contexts.iter().copied().collect(),
            None => Vec::new(),
        }
    }

    #[inline]
    pub fn contexts_for_package(&self, package_id: PackageId, conn_id: &ConnId) -> Vec<OpHandle> {
        match self.package_map.get(&(package_id, conn_id.clone())) {
            Some(contexts) => contexts.iter().copied().collect(),
            None => Vec::new(),
        }
    }

    /// Union of the handle and id lookups, first-registration order, no
    /// duplicates.
    pub fn contexts_for_union(&self, handle: OpHandle, id: &str) -> Vec<OpHandle> {
        let mut contexts: IndexSet<OpHandle> = IndexSet::new();

        for context in self.contexts_for_handle(handle) {
            contexts.insert(context);
        }
        for context in self.contexts_for_id(id) {
            contexts.insert(context);
        }

        contexts.into_iter().collect()
    }

    /// Removes every registration the context holds, pruning emptied keys.
    pub fn remove_context(&mut self, context: OpHandle) {
        self.handle_map.retain(|_, contexts| {
            contexts.shift_remove(&context);
            !contexts.is_empty()
        });
        self.id_map.retain(|_, contexts| {
            contexts.shift_remove(&context);
            !contexts.is_empty()
        });
        self.package_map.retain(|_, contexts| {
            contexts.shift_remove(&context);
            !contexts.is_empty()
        });
    }

    #[inline]
    pub fn handle_entries(&self) -> usize {
        self.handle_map.len()
    }

    #[inline]
    pub fn id_entries(&self) -> usize {
        self.id_map.len()
    }

    #[inline]
    pub fn package_entries(&self) -> usize {
        self.package_map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn package_id(tag: u8) -> PackageId {
        PackageId::new([tag; PACKAGE_ID_LEN])
    }

    #[test]
    fn test_register_lookup_unregister() {
        let mut registry = Registry::new();

        registry.register_handle(10, 1);
        registry.register_handle(10, 2);
        registry.register_id("connId", 2);

        assert_eq!(registry.contexts_for_handle(10), vec![1, 2]);
        assert_eq!(registry.contexts_for_id("connId"), vec![2]);
        assert_eq!(registry.contexts_for_union(10, "connId"), vec![1, 2]);

        registry.unregister_handle(10, 1);
        assert_eq!(registry.contexts_for_handle(10), vec![2]);

        registry.unregister_handle(10, 2);
        assert_eq!(registry.handle_entries(), 0);
    }

    #[test]
    fn test_remove_context_sweeps_all_maps() {
        let mut registry = Registry::new();

        registry.register_handle(10, 1);
        registry.register_handle(11, 1);
        registry.register_id("linkId", 1);
        registry.register_package_id(package_id(1), &"connId".to_string(), 1);

        registry.remove_context(1);

        assert_eq!(registry.handle_entries(), 0);
        assert_eq!(registry.id_entries(), 0);
        assert_eq!(registry.package_entries(), 0);
    }

    #[test]
    fn test_shared_key_survives_partial_removal() {
        let mut registry = Registry::new();

        registry.register_id("connId", 1);
        registry.register_id("connId", 2);
        registry.remove_context(1);

        assert_eq!(registry.contexts_for_id("connId"), vec![2]);
    }

    #[test]
    fn test_unassociated_drained_once_with_prefix_stripped() {
        let mut registry = Registry::new();
        let id = package_id(7);
        let conn = "connId".to_string();

        let mut raw = id.as_bytes().to_vec();
        raw.extend_from_slice(b"payload");
        registry.buffer_unassociated(id, raw);

        let drained = registry.register_package_id(id, &conn, 1);
        assert_eq!(drained, vec![b"payload".to_vec()]);

        // A second registration finds nothing left.
        let drained = registry.register_package_id(id, &conn, 2);
        assert!(drained.is_empty());
    }
}
