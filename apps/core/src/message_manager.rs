use std::collections::{BTreeSet, HashMap};

use crate::host::ShellHost;
use crate::messages::WindowHandle;

#[derive(Debug, Default)]
pub struct MessageManager {
    by_window: HashMap<WindowHandle, BTreeSet<u32>>,
    // Recipients per id, in registration order.
    by_message: HashMap<u32, Vec<WindowHandle>>,
}

impl MessageManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_messages(&mut self, window: WindowHandle, ids: &[u32]) {
        if window.is_null() {
            return;
        }
        for &id in ids.iter().filter(|id| **id != 0) {
            if self.by_window.entry(window).or_default().insert(id) {
                self.by_message.entry(id).or_default().push(window);
            }
        }
    }

    pub fn remove_messages(&mut self, window: WindowHandle, ids: &[u32]) {
        let Some(registered) = self.by_window.get_mut(&window) else {
            return;
        };
        for id in ids {
            if registered.remove(id) {
                detach(&mut self.by_message, *id, window);
            }
        }
        if registered.is_empty() {
            self.by_window.remove(&window);
        }
    }

    pub fn remove_window(&mut self, window: WindowHandle) {
        if let Some(ids) = self.by_window.remove(&window) {
            for id in ids {
                detach(&mut self.by_message, id, window);
            }
        }
    }

    pub fn handler_exists(&self, id: u32) -> bool {
        self.by_message.contains_key(&id)
    }

    /// Sends `id` to every registered window and returns the last recipient's
    /// result, or 0 when nobody received it. Recipients the host no longer
    /// knows as windows are skipped and pruned.
    pub fn send_message(&mut self, host: &dyn ShellHost, id: u32, wparam: usize, lparam: isize) -> isize {
        let recipients = self.recipients(id);
        let (result, stale) = deliver(host, &recipients, id, wparam, lparam);
        self.prune(&stale);
        result
    }

    pub fn recipients(&self, id: u32) -> Vec<WindowHandle> {
        self.by_message.get(&id).cloned().unwrap_or_default()
    }

    pub fn prune(&mut self, stale: &[WindowHandle]) {
        for window in stale {
            tracing::debug!(window = window.0, "pruning registrations of destroyed window");
            self.remove_window(*window);
        }
    }

    pub fn clear_messages(&mut self) {
        self.by_window.clear();
        self.by_message.clear();
    }

    pub fn messages_for(&self, window: WindowHandle) -> Vec<u32> {
        self.by_window
            .get(&window)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }
}

pub fn deliver(
    host: &dyn ShellHost,
    recipients: &[WindowHandle],
    id: u32,
    wparam: usize,
    lparam: isize,
) -> (isize, Vec<WindowHandle>) {
    let mut result = 0;
    let mut stale = Vec::new();
    for &window in recipients {
        if host.is_window(window) {
            result = host.send_message(window, id, wparam, lparam);
        } else {
            stale.push(window);
        }
    }
    (result, stale)
}

fn detach(by_message: &mut HashMap<u32, Vec<WindowHandle>>, id: u32, window: WindowHandle) {
    if let Some(windows) = by_message.get_mut(&id) {
        windows.retain(|w| *w != window);
        if windows.is_empty() {
            by_message.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::MessageManager;
    use crate::host::MockShellHost;
    use crate::messages::WindowHandle;
    use proptest::prelude::*;

    const A: WindowHandle = WindowHandle(10);
    const B: WindowHandle = WindowHandle(20);

    fn windows(manager: &MessageManager) -> Vec<WindowHandle> {
        manager.by_window.keys().copied().collect()
    }

    #[test]
    fn removing_last_id_drops_window() {
        let mut manager = MessageManager::new();
        manager.add_messages(A, &[9265, 9504]);
        manager.remove_messages(A, &[9265]);
        assert_eq!(windows(&manager), vec![A]);

        manager.remove_messages(A, &[9504]);
        assert!(windows(&manager).is_empty());
        assert!(!manager.handler_exists(9504));
    }

    #[test]
    fn removing_unknown_pair_is_noop() {
        let mut manager = MessageManager::new();
        manager.remove_messages(A, &[1, 2]);
        manager.add_messages(A, &[1]);
        manager.remove_messages(A, &[2]);
        manager.remove_messages(B, &[1]);
        assert_eq!(manager.messages_for(A), vec![1]);
    }

    #[test]
    fn broadcast_returns_last_recipient_result() {
        let host = MockShellHost::default();
        host.set_reply(A, 1);
        host.set_reply(B, 2);

        let mut manager = MessageManager::new();
        manager.add_messages(A, &[500]);
        manager.add_messages(B, &[500]);

        assert_eq!(manager.send_message(&host, 500, 3, 4), 2);
        assert_eq!(host.sent().len(), 2);
        assert_eq!(manager.send_message(&host, 501, 0, 0), 0);
    }

    #[test]
    fn destroyed_window_is_pruned_on_send() {
        let host = MockShellHost::default();
        let mut manager = MessageManager::new();
        manager.add_messages(A, &[500]);
        manager.add_messages(B, &[500, 600]);
        host.destroy_window(B);

        manager.send_message(&host, 500, 0, 0);
        manager.send_message(&host, 500, 0, 0);

        assert_eq!(windows(&manager), vec![A]);
        assert!(!manager.handler_exists(600));
        assert!(host.sent().iter().all(|m| m.window == A));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(u8, Vec<u8>),
        Remove(u8, Vec<u8>),
    }

    fn op() -> impl Strategy<Value = Op> {
        let ids = prop::collection::vec(1u8..6, 0..4);
        prop_oneof![
            (1u8..4, ids.clone()).prop_map(|(w, ids)| Op::Add(w, ids)),
            (1u8..4, ids).prop_map(|(w, ids)| Op::Remove(w, ids)),
        ]
    }

    proptest! {
        #[test]
        fn window_present_iff_it_has_ids(ops in prop::collection::vec(op(), 0..40)) {
            let mut manager = MessageManager::new();
            let mut model: std::collections::HashMap<u8, std::collections::BTreeSet<u8>> =
                std::collections::HashMap::new();

            for op in ops {
                match op {
                    Op::Add(w, ids) => {
                        let ids32: Vec<u32> = ids.iter().map(|id| *id as u32).collect();
                        manager.add_messages(WindowHandle(w as isize), &ids32);
                        model.entry(w).or_default().extend(ids);
                    }
                    Op::Remove(w, ids) => {
                        let ids32: Vec<u32> = ids.iter().map(|id| *id as u32).collect();
                        manager.remove_messages(WindowHandle(w as isize), &ids32);
                        if let Some(set) = model.get_mut(&w) {
                            for id in ids {
                                set.remove(&id);
                            }
                        }
                    }
                }
                model.retain(|_, set| !set.is_empty());

                let mut present: Vec<isize> = windows(&manager).iter().map(|w| w.0).collect();
                present.sort();
                let mut expected: Vec<isize> = model.keys().map(|w| *w as isize).collect();
                expected.sort();
                prop_assert_eq!(present, expected);

                for id in 1u32..6 {
                    let expected = model.values().any(|set| set.contains(&(id as u8)));
                    prop_assert_eq!(manager.handler_exists(id), expected);
                }
            }
        }
    }
}
