use std::collections::HashSet;

use shared::domain::PermissionRequest;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionEntry {
    pub request: PermissionRequest,
    pub added_at_ms: i64,
}

/// State needed to put an optimistically removed entry back where it was.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplySnapshot {
    pub entry: PermissionEntry,
    order: Vec<String>,
}

/// Pending permission prompts in first-seen order, fed by polls and pushes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionQueue {
    entries: Vec<PermissionEntry>,
}

impl PermissionQueue {
    pub fn entries(&self) -> &[PermissionEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.position(request_id).is_some()
    }

    fn position(&self, request_id: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.request.request_id == request_id)
    }

    /// Inserts or refreshes a request. A known request keeps its position and
    /// its original `added_at_ms`.
    pub fn upsert(&mut self, request: PermissionRequest, now_ms: i64) {
        match self.position(&request.request_id) {
            Some(index) => self.entries[index].request = request,
            None => self.entries.push(PermissionEntry {
                request,
                added_at_ms: now_ms,
            }),
        }
    }

    pub fn remove(&mut self, request_id: &str) -> Option<PermissionEntry> {
        let index = self.position(request_id)?;
        Some(self.entries.remove(index))
    }

    /// Applies a poll that was started at `refresh_started_at_ms`. Entries the
    /// poll does not mention are pruned only if they were already known when
    /// the poll started; anything pushed while it was in flight survives.
    pub fn reconcile_poll(
        &mut self,
        requests: Vec<PermissionRequest>,
        refresh_started_at_ms: i64,
        now_ms: i64,
    ) {
        let reported: HashSet<String> = requests
            .iter()
            .map(|request| request.request_id.clone())
            .collect();
        for request in requests {
            self.upsert(request, now_ms);
        }
        self.entries.retain(|entry| {
            entry.added_at_ms >= refresh_started_at_ms
                || reported.contains(&entry.request.request_id)
        });
    }

    /// Removes an entry ahead of a reply call, remembering the key order.
    pub fn take_for_reply(&mut self, request_id: &str) -> Option<ReplySnapshot> {
        let order = self
            .entries
            .iter()
            .map(|entry| entry.request.request_id.clone())
            .collect();
        let entry = self.remove(request_id)?;
        Some(ReplySnapshot { entry, order })
    }

    /// Puts a failed reply's entry back at its original position unless it was
    /// re-added in the meantime.
    pub fn restore(&mut self, snapshot: ReplySnapshot) {
        let restored_id = snapshot.entry.request.request_id.clone();
        if self.contains(&restored_id) {
            return;
        }

        let mut current = std::mem::take(&mut self.entries);
        let mut rebuilt = Vec::with_capacity(current.len() + 1);
        let mut restored = Some(snapshot.entry);
        for id in &snapshot.order {
            if *id == restored_id {
                if let Some(entry) = restored.take() {
                    rebuilt.push(entry);
                }
            } else if let Some(index) = current
                .iter()
                .position(|entry| entry.request.request_id == *id)
            {
                rebuilt.push(current.remove(index));
            }
        }
        rebuilt.extend(restored);
        rebuilt.extend(current);
        self.entries = rebuilt;
    }

    /// First request, in arrival order, that belongs to `session_id`.
    pub fn current_for_session(&self, session_id: &str) -> Option<&PermissionRequest> {
        self.entries
            .iter()
            .map(|entry| &entry.request)
            .find(|request| request.session_id == session_id)
    }
}

#[cfg(test)]
#[path = "tests/permissions_tests.rs"]
mod tests;
