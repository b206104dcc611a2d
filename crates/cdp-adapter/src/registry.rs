//! Page bookkeeping: which CDP target and flattened session belong to each page.

use dashmap::DashMap;

use crate::ids::{PageId, SessionId};

#[derive(Clone, Debug)]
pub struct PageEntry {
    pub session_id: SessionId,
    pub target_id: String,
    pub cdp_session: Option<String>,
    pub recent_url: Option<String>,
}

#[derive(Default)]
pub struct Registry {
    pages: DashMap<PageId, PageEntry>,
    targets: DashMap<String, PageId>,
    sessions: DashMap<String, PageId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a page target, returning the existing page if the target is already known.
    pub fn insert_target(&self, target_id: &str, url: Option<String>) -> PageId {
        if let Some(page) = self.page_for_target(target_id) {
            return page;
        }
        let page = PageId::new();
        self.pages.insert(
            page,
            PageEntry {
                session_id: SessionId::new(),
                target_id: target_id.to_string(),
                cdp_session: None,
                recent_url: url,
            },
        );
        self.targets.insert(target_id.to_string(), page);
        page
    }

    pub fn bind_session(&self, target_id: &str, cdp_session: &str) -> Option<PageId> {
        let page = self.page_for_target(target_id)?;
        if let Some(mut entry) = self.pages.get_mut(&page) {
            entry.cdp_session = Some(cdp_session.to_string());
        }
        self.sessions.insert(cdp_session.to_string(), page);
        Some(page)
    }

    pub fn unbind_session(&self, cdp_session: &str) {
        if let Some((_, page)) = self.sessions.remove(cdp_session) {
            if let Some(mut entry) = self.pages.get_mut(&page) {
                entry.cdp_session = None;
            }
        }
    }

    pub fn remove_target(&self, target_id: &str) -> Option<PageId> {
        let (_, page) = self.targets.remove(target_id)?;
        self.sessions.retain(|_, bound| *bound != page);
        self.pages.remove(&page);
        Some(page)
    }

    /// Forgets everything; returns the pages that were registered.
    pub fn clear(&self) -> Vec<PageId> {
        let pages: Vec<PageId> = self.pages.iter().map(|kv| *kv.key()).collect();
        self.pages.clear();
        self.targets.clear();
        self.sessions.clear();
        pages
    }

    pub fn get(&self, page: &PageId) -> Option<PageEntry> {
        self.pages.get(page).map(|entry| entry.value().clone())
    }

    pub fn page_for_target(&self, target_id: &str) -> Option<PageId> {
        self.targets.get(target_id).map(|entry| *entry.value())
    }

    pub fn page_for_session(&self, cdp_session: Option<&str>) -> Option<PageId> {
        cdp_session.and_then(|sid| self.sessions.get(sid).map(|entry| *entry.value()))
    }

    pub fn cdp_session(&self, page: &PageId) -> Option<String> {
        self.pages
            .get(page)
            .and_then(|entry| entry.cdp_session.clone())
    }

    pub fn set_recent_url(&self, page: &PageId, url: String) {
        if let Some(mut entry) = self.pages.get_mut(page) {
            entry.recent_url = Some(url);
        }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}
