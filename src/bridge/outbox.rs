//! Unacknowledged results
//!
//! Results stay here until the backend acknowledges their `command_id`.
//! A result pushed twice for the same id replaces the earlier one in place.
//! The only other way out is `reject`, once the backend has refused the
//! same result `limit` times.

use crate::command::{CommandId, CommandResult};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct Outbox {
    pending: Vec<CommandResult>,
    rejections: HashMap<CommandId, u32>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, result: CommandResult) {
        match self
            .pending
            .iter_mut()
            .find(|r| r.command_id == result.command_id)
        {
            Some(existing) => *existing = result,
            None => self.pending.push(result),
        }
    }

    pub fn pending(&self) -> &[CommandResult] {
        &self.pending
    }

    /// Drop acknowledged results; returns how many were removed.
    pub fn acknowledge(&mut self, ids: &[CommandId]) -> usize {
        let before = self.pending.len();
        self.pending.retain(|r| !ids.contains(&r.command_id));
        for id in ids {
            self.rejections.remove(id);
        }
        before - self.pending.len()
    }

    /// Count a rejection of `id`. At `limit` rejections the result is
    /// removed and handed back to the caller.
    pub fn reject(&mut self, id: &CommandId, limit: u32) -> Option<CommandResult> {
        let index = self.pending.iter().position(|r| &r.command_id == id)?;
        let count = self.rejections.entry(id.clone()).or_insert(0);
        *count += 1;
        if *count < limit.max(1) {
            return None;
        }
        self.rejections.remove(id);
        Some(self.pending.remove(index))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_push_replaces_same_id() {
        let mut outbox = Outbox::new();
        outbox.push(CommandResult::failed(CommandId::new("a"), "first", Duration::ZERO));
        outbox.push(CommandResult::ok(CommandId::new("b"), "b", Duration::ZERO));
        outbox.push(CommandResult::ok(CommandId::new("a"), "second", Duration::ZERO));

        assert_eq!(outbox.len(), 2);
        assert_eq!(outbox.pending()[0].command_id.as_str(), "a");
        assert_eq!(outbox.pending()[0].stdout, "second");
    }

    #[test]
    fn test_acknowledge_keeps_unacked() {
        let mut outbox = Outbox::new();
        for id in ["a", "b", "c"] {
            outbox.push(CommandResult::ok(CommandId::new(id), "", Duration::ZERO));
        }
        let removed = outbox.acknowledge(&[CommandId::new("a"), CommandId::new("c"), CommandId::new("z")]);
        assert_eq!(removed, 2);
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox.pending()[0].command_id.as_str(), "b");
    }

    #[test]
    fn test_reject_gives_up_at_limit() {
        let mut outbox = Outbox::new();
        outbox.push(CommandResult::ok(CommandId::new("bad"), "", Duration::ZERO));
        outbox.push(CommandResult::ok(CommandId::new("good"), "", Duration::ZERO));
        let bad = CommandId::new("bad");

        assert!(outbox.reject(&bad, 3).is_none());
        assert!(outbox.reject(&bad, 3).is_none());
        assert_eq!(outbox.len(), 2);
        let dropped = outbox.reject(&bad, 3).unwrap();
        assert_eq!(dropped.command_id, bad);
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox.pending()[0].command_id.as_str(), "good");
        assert!(outbox.reject(&bad, 3).is_none());
    }

    #[test]
    fn test_acknowledge_resets_rejections() {
        let mut outbox = Outbox::new();
        let id = CommandId::new("a");
        outbox.push(CommandResult::ok(id.clone(), "", Duration::ZERO));
        assert!(outbox.reject(&id, 2).is_none());
        outbox.acknowledge(&[id.clone()]);

        outbox.push(CommandResult::ok(id.clone(), "", Duration::ZERO));
        assert!(outbox.reject(&id, 2).is_none());
        assert_eq!(outbox.len(), 1);
    }
}
