use super::{Flow, FlowId};
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Snapshot store for flows.
///
/// Active flows are keyed by id. Terminal flows move into a bounded retention
/// buffer so a late subscriber can still see recent history.
pub struct FlowTable {
    active: DashMap<FlowId, Flow>,
    retained: Mutex<Retained>,
    retention: usize,
}

/// Retired flows by id plus their retirement order.
#[derive(Default)]
struct Retained {
    flows: HashMap<FlowId, Flow>,
    order: VecDeque<FlowId>,
}

impl FlowTable {
    pub fn new(retention: usize) -> Self {
        Self {
            active: DashMap::new(),
            retained: Mutex::new(Retained {
                flows: HashMap::with_capacity(retention.min(1024)),
                order: VecDeque::with_capacity(retention.min(1024)),
            }),
            retention,
        }
    }

    fn retained(&self) -> std::sync::MutexGuard<'_, Retained> {
        self.retained.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn upsert(&self, flow: &Flow) {
        self.active.insert(flow.id.clone(), flow.clone());
    }

    /// Moves a finished flow out of active memory.
    pub fn retire(&self, flow: Flow) {
        self.active.remove(&flow.id);
        if self.retention == 0 {
            return;
        }
        let mut retained = self.retained();
        if retained.flows.remove(&flow.id).is_some() {
            retained.order.retain(|id| id != &flow.id);
        }
        while retained.order.len() >= self.retention {
            if let Some(oldest) = retained.order.pop_front() {
                retained.flows.remove(&oldest);
            }
        }
        retained.order.push_back(flow.id.clone());
        retained.flows.insert(flow.id.clone(), flow);
    }

    pub fn get(&self, id: &FlowId) -> Option<Flow> {
        if let Some(flow) = self.active.get(id) {
            return Some(flow.clone());
        }
        self.retained().flows.get(id).cloned()
    }

    pub fn is_retired(&self, id: &FlowId) -> bool {
        !self.active.contains_key(id) && self.retained().flows.contains_key(id)
    }

    pub fn active(&self) -> Vec<Flow> {
        let mut flows: Vec<Flow> = self.active.iter().map(|e| e.value().clone()).collect();
        flows.sort_by_key(|f| f.timestamps.created);
        flows
    }

    /// Retained terminal flows, oldest first.
    pub fn recent(&self) -> Vec<Flow> {
        let retained = self.retained();
        retained
            .order
            .iter()
            .filter_map(|id| retained.flows.get(id).cloned())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowStatus;

    fn finished(id: &str) -> Flow {
        let mut flow = Flow::new(id.into());
        flow.transition(FlowStatus::Aborted).unwrap();
        flow
    }

    #[test]
    fn test_retire_moves_flow_to_history() {
        let table = FlowTable::new(10);
        let flow = Flow::new("a".into());
        table.upsert(&flow);
        assert_eq!(table.active_count(), 1);

        table.retire(finished("a"));

        assert_eq!(table.active_count(), 0);
        assert!(table.is_retired(&"a".into()));
        assert_eq!(table.get(&"a".into()).unwrap().status, FlowStatus::Aborted);
    }

    #[test]
    fn test_retention_is_bounded() {
        let table = FlowTable::new(2);
        for id in ["a", "b", "c"] {
            table.retire(finished(id));
        }

        let ids: Vec<_> = table.recent().into_iter().map(|f| f.id.to_string()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert!(table.get(&"a".into()).is_none());
    }

    #[test]
    fn test_retiring_twice_keeps_one_entry() {
        let table = FlowTable::new(3);
        table.retire(finished("a"));
        table.retire(finished("b"));
        table.retire(finished("a"));

        let ids: Vec<_> = table.recent().into_iter().map(|f| f.id.to_string()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert!(table.is_retired(&"a".into()));
        assert!(!table.is_retired(&"c".into()));
    }
}
