//! Per-tag member lists.
//!
//! Each tag owns one list, stored in the same backend as the records it
//! indexes, at `tag!<tag key>`. The list is an index, not the authority on
//! membership: a stale member only costs one extra no-op delete during
//! invalidation.

use std::collections::HashSet;

use cairn_core::CairnResult;

/// Prefix of every tag list key.
pub const TAG_LIST_PREFIX: &str = "tag!";

/// List key holding the members of `tag_key`.
pub fn tag_list_key(tag_key: &str) -> String {
    format!("{TAG_LIST_PREFIX}{tag_key}")
}

/// List primitives a pool provides for its tag lists.
pub trait TagListStore {
    /// Members in insertion order. A missing list reads as empty.
    fn read_list(&self, list_key: &str) -> CairnResult<Vec<String>>;

    fn append_list_item(&self, list_key: &str, member: &str) -> CairnResult<()>;

    /// Remove every occurrence of `member`.
    fn remove_list_item(&self, list_key: &str, member: &str) -> CairnResult<()>;

    fn remove_list(&self, list_key: &str) -> CairnResult<()>;
}

/// Tag bookkeeping over a [`TagListStore`].
pub struct TagIndex<'a, S: TagListStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: TagListStore + ?Sized> TagIndex<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    pub fn add_member(&self, tag_key: &str, member: &str) -> CairnResult<()> {
        self.store.append_list_item(&tag_list_key(tag_key), member)
    }

    pub fn remove_member(&self, tag_key: &str, member: &str) -> CairnResult<()> {
        self.store.remove_list_item(&tag_list_key(tag_key), member)
    }

    /// Members with duplicates dropped, first occurrence wins.
    pub fn members(&self, tag_key: &str) -> CairnResult<Vec<String>> {
        let raw = self.store.read_list(&tag_list_key(tag_key))?;
        let mut seen = HashSet::with_capacity(raw.len());
        Ok(raw.into_iter().filter(|m| seen.insert(m.clone())).collect())
    }

    /// Drop the tag's own list, leaving its members alone. Returns the list key.
    pub fn reset_tag(&self, tag_key: &str) -> CairnResult<String> {
        let list_key = tag_list_key(tag_key);
        self.store.remove_list(&list_key)?;
        Ok(list_key)
    }

    /// Reset each tag in turn. A failure leaves earlier tags reset.
    pub fn reset_all(&self, tag_keys: &[String]) -> CairnResult<Vec<String>> {
        tag_keys.iter().map(|tag| self.reset_tag(tag)).collect()
    }
}

/// Append `member` unless it is already listed.
pub(crate) fn push_unique(list: &mut Vec<String>, member: &str) -> bool {
    if list.iter().any(|m| m == member) {
        return false;
    }
    list.push(member.to_string());
    true
}
