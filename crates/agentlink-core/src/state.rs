//! Keyed state tables owned by the bridge
//!
//! Open items live in a slot arena indexed by item id. Subagent threading is
//! a pair of maps: child thread -> parent tool-use id (and the call that set
//! it), and collaboration call id -> the threads it registered.

use std::collections::HashMap;

use tokio::time::Instant;

use crate::config::CollaborationMode;
use crate::messages::{RateLimitSnapshot, TokenUsage};

/// Kind of an open item, enough to route deltas
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    AgentMessage,
    Reasoning,
    Plan,
    Command,
    FileChange,
    WebSearch,
    McpTool,
    Collab,
    DynamicTool,
    Other,
}

/// An item between its start and completion
#[derive(Debug, Clone)]
pub struct OpenItem {
    pub id: String,
    pub kind: ItemKind,
    pub text: String,
    pub started_at: Instant,
    pub thread_id: Option<String>,
    /// False for a placeholder opened by a delta that beat `item/started`
    pub started: bool,
}

impl OpenItem {
    pub fn new(id: impl Into<String>, kind: ItemKind, thread_id: Option<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            text: String::new(),
            started_at: Instant::now(),
            thread_id,
            started: true,
        }
    }

    fn placeholder(id: &str, kind: ItemKind) -> Self {
        Self {
            started: false,
            ..Self::new(id, kind, None)
        }
    }
}

/// Arena of open items with an id index and a free list
#[derive(Debug, Default)]
pub struct ItemTable {
    slots: Vec<Option<OpenItem>>,
    index: HashMap<String, usize>,
    free: Vec<usize>,
}

impl ItemTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an item. A placeholder with the same id is upgraded in place
    /// and keeps its text. Returns false if the id was already started.
    pub fn open(&mut self, item: OpenItem) -> bool {
        if let Some(existing) = self.get_mut(&item.id) {
            if existing.started {
                return false;
            }
            existing.kind = item.kind;
            existing.started_at = item.started_at;
            existing.started = item.started;
            if item.thread_id.is_some() {
                existing.thread_id = item.thread_id;
            }
            return true;
        }
        let id = item.id.clone();
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(item);
                slot
            }
            None => {
                self.slots.push(Some(item));
                self.slots.len() - 1
            }
        };
        self.index.insert(id, slot);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&OpenItem> {
        let slot = *self.index.get(id)?;
        self.slots.get(slot)?.as_ref()
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut OpenItem> {
        let slot = *self.index.get(id)?;
        self.slots.get_mut(slot)?.as_mut()
    }

    /// Append delta text to an open item, opening it first if needed
    pub fn append(&mut self, id: &str, kind: ItemKind, delta: &str) {
        if !self.contains(id) {
            self.open(OpenItem::placeholder(id, kind));
        }
        if let Some(item) = self.get_mut(id) {
            item.text.push_str(delta);
        }
    }

    /// Remove an item, returning it if it was open
    pub fn close(&mut self, id: &str) -> Option<OpenItem> {
        let slot = self.index.remove(id)?;
        let item = self.slots.get_mut(slot)?.take();
        self.free.push(slot);
        item
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.index.clear();
        self.free.clear();
    }
}

#[derive(Debug, Clone)]
struct ParentLink {
    parent: String,
    call_id: String,
}

/// Child thread -> parent tool-use id
#[derive(Debug, Default)]
pub struct SubagentMap {
    parents: HashMap<String, ParentLink>,
    registered: HashMap<String, Vec<String>>,
}

impl SubagentMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register receiver threads for a collaboration call.
    ///
    /// A call made from an already-mapped thread groups its receivers under
    /// that thread's parent. Returns the parent id used.
    pub fn register(
        &mut self,
        call_id: &str,
        sender_thread: Option<&str>,
        receivers: &[String],
    ) -> String {
        let parent = sender_thread
            .and_then(|t| self.parents.get(t))
            .map(|link| link.parent.clone())
            .unwrap_or_else(|| call_id.to_string());

        let threads = self.registered.entry(call_id.to_string()).or_default();
        for thread in receivers {
            let link = ParentLink {
                parent: parent.clone(),
                call_id: call_id.to_string(),
            };
            self.parents.insert(thread.clone(), link);
            if !threads.contains(thread) {
                threads.push(thread.clone());
            }
        }
        parent
    }

    pub fn parent_of(&self, thread_id: &str) -> Option<&str> {
        self.parents.get(thread_id).map(|link| link.parent.as_str())
    }

    /// Clear the mappings registered by `call_id`. A thread that a later call
    /// registered again keeps that call's mapping. Returns how many threads
    /// were unmapped.
    pub fn clear(&mut self, call_id: &str) -> usize {
        let Some(threads) = self.registered.remove(call_id) else {
            return 0;
        };
        let mut cleared = 0;
        for thread in &threads {
            if self.parents.get(thread).is_some_and(|link| link.call_id == call_id) {
                self.parents.remove(thread);
                cleared += 1;
            }
        }
        cleared
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }
}

/// The agent thread this session is bound to
#[derive(Debug, Clone, Default)]
pub struct SessionThread {
    pub thread_id: Option<String>,
    pub turn_id: Option<String>,
    pub collaboration_mode: CollaborationMode,
}

/// Token counters reported by the agent
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageSnapshot {
    pub last: TokenUsage,
    pub total: TokenUsage,
    pub context_window: Option<u64>,
}

/// Account-level data overwritten on every update
#[derive(Debug, Clone, Default)]
pub struct AccountState {
    pub rate_limits: Option<RateLimitSnapshot>,
    pub usage: Option<UsageSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_table_reuses_slots() {
        let mut table = ItemTable::new();
        assert!(table.open(OpenItem::new("a", ItemKind::Command, None)));
        assert!(table.open(OpenItem::new("b", ItemKind::Reasoning, None)));
        assert!(!table.open(OpenItem::new("a", ItemKind::Command, None)));
        assert_eq!(table.len(), 2);

        let a = table.close("a").unwrap();
        assert_eq!(a.kind, ItemKind::Command);
        assert!(table.close("a").is_none());

        assert!(table.open(OpenItem::new("c", ItemKind::Plan, None)));
        assert_eq!(table.slots.len(), 2);
        assert_eq!(table.get("c").unwrap().kind, ItemKind::Plan);
        assert_eq!(table.get("b").unwrap().kind, ItemKind::Reasoning);
    }

    #[test]
    fn test_append_opens_missing_item() {
        let mut table = ItemTable::new();
        table.append("r1", ItemKind::Reasoning, "think");
        table.append("r1", ItemKind::Reasoning, "ing");
        assert_eq!(table.get("r1").unwrap().text, "thinking");
        assert!(!table.get("r1").unwrap().started);
    }

    #[test]
    fn test_start_upgrades_placeholder_once() {
        let mut table = ItemTable::new();
        table.append("cmd", ItemKind::Other, "partial ");

        assert!(table.open(OpenItem::new("cmd", ItemKind::Command, Some("thr_1".into()))));
        let item = table.get("cmd").unwrap();
        assert!(item.started);
        assert_eq!(item.kind, ItemKind::Command);
        assert_eq!(item.thread_id.as_deref(), Some("thr_1"));
        assert_eq!(item.text, "partial ");
        assert_eq!(table.len(), 1);

        // A second start is a genuine duplicate
        assert!(!table.open(OpenItem::new("cmd", ItemKind::Command, None)));
        assert_eq!(table.get("cmd").unwrap().thread_id.as_deref(), Some("thr_1"));
    }

    #[test]
    fn test_subagent_register_and_clear() {
        let mut map = SubagentMap::new();
        let parent = map.register("call_1", Some("main"), &["t1".into(), "t2".into()]);
        assert_eq!(parent, "call_1");
        assert_eq!(map.parent_of("t1"), Some("call_1"));

        assert_eq!(map.clear("call_1"), 2);
        assert_eq!(map.parent_of("t1"), None);
        assert_eq!(map.parent_of("t2"), None);
        assert_eq!(map.clear("call_1"), 0);
    }

    #[test]
    fn test_nested_call_inherits_parent() {
        let mut map = SubagentMap::new();
        map.register("call_outer", None, &["child".into()]);
        let parent = map.register("call_inner", Some("child"), &["grandchild".into()]);
        assert_eq!(parent, "call_outer");
        assert_eq!(map.parent_of("grandchild"), Some("call_outer"));

        // Clearing the inner call leaves the outer mapping alone
        map.clear("call_inner");
        assert_eq!(map.parent_of("grandchild"), None);
        assert_eq!(map.parent_of("child"), Some("call_outer"));
    }

    #[test]
    fn test_clear_keeps_mapping_set_by_later_call() {
        let mut map = SubagentMap::new();
        map.register("call_1", None, &["t1".into(), "t2".into()]);
        map.register("call_2", None, &["t1".into()]);
        assert_eq!(map.parent_of("t1"), Some("call_2"));

        assert_eq!(map.clear("call_1"), 1);
        assert_eq!(map.parent_of("t1"), Some("call_2"));
        assert_eq!(map.parent_of("t2"), None);

        assert_eq!(map.clear("call_2"), 1);
        assert!(map.is_empty());
    }
}
