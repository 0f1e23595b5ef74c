//! 任务集合
//!
//! 槽位数组 + 代号：删除任务只把槽位置空（墓碑），不移动其他任务；
//! 每次重建集合代号加一，旧代号的 `SlotKey` 自动失效。

use std::collections::HashMap;
use std::sync::Arc;

use super::handle::TaskHandle;

/// 槽位键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    index: usize,
    generation: u64,
}

/// 当前任务集合
#[derive(Debug, Default)]
pub struct TaskCollection {
    generation: u64,
    slots: Vec<Option<TaskHandle>>,
}

impl TaskCollection {
    pub fn new(generation: u64, handles: Vec<TaskHandle>) -> Self {
        Self {
            generation,
            slots: handles.into_iter().map(Some).collect(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// 追加任务
    pub fn push(&mut self, handle: TaskHandle) -> SlotKey {
        debug_assert!(self.find(handle.id()).is_none());
        self.slots.push(Some(handle));
        SlotKey {
            index: self.slots.len() - 1,
            generation: self.generation,
        }
    }

    pub fn get(&self, key: SlotKey) -> Option<&TaskHandle> {
        if key.generation != self.generation {
            return None;
        }
        self.slots.get(key.index).and_then(Option::as_ref)
    }

    pub fn find(&self, id: &str) -> Option<(SlotKey, &TaskHandle)> {
        self.slots.iter().enumerate().find_map(|(index, slot)| {
            slot.as_ref().filter(|h| h.id() == id).map(|h| {
                (
                    SlotKey {
                        index,
                        generation: self.generation,
                    },
                    h,
                )
            })
        })
    }

    /// 把任务槽位置空，返回是否找到
    pub fn tombstone(&mut self, id: &str) -> bool {
        match self.find(id).map(|(key, _)| key.index) {
            Some(index) => {
                self.slots[index] = None;
                true
            }
            None => false,
        }
    }

    /// 按插入顺序遍历存活任务
    pub fn iter(&self) -> impl Iterator<Item = &TaskHandle> {
        self.slots.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 从上一代集合接过同一任务的终态和通知基线
    pub(crate) fn inherit_from(&self, previous: &TaskCollection) {
        let previous: HashMap<&str, &TaskHandle> =
            previous.iter().map(|h| (h.id(), h)).collect();
        for handle in self.iter() {
            if let Some(old) = previous.get(handle.id()) {
                handle.inherit_from(old);
            }
        }
    }

    /// 按文件名过滤（不区分大小写的子串匹配），空过滤串返回全部
    pub fn view(&self, filter: &str) -> TaskListView {
        let needle = filter.to_lowercase();
        let tasks: Vec<TaskHandle> = self
            .iter()
            .filter(|h| needle.is_empty() || h.file_name().to_lowercase().contains(&needle))
            .cloned()
            .collect();
        TaskListView {
            generation: self.generation,
            tasks: tasks.into(),
        }
    }
}

/// 只读任务列表视图
#[derive(Debug, Clone)]
pub struct TaskListView {
    generation: u64,
    tasks: Arc<[TaskHandle]>,
}

impl TaskListView {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&TaskHandle> {
        self.tasks.get(index)
    }

    pub fn find(&self, id: &str) -> Option<&TaskHandle> {
        self.tasks.iter().find(|h| h.id() == id)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TaskHandle> {
        self.tasks.iter()
    }
}

impl<'a> IntoIterator for &'a TaskListView {
    type Item = &'a TaskHandle;
    type IntoIter = std::slice::Iter<'a, TaskHandle>;

    fn into_iter(self) -> Self::IntoIter {
        self.tasks.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::record::{TaskRecord, TaskStatus};
    use proptest::prelude::*;

    fn handle(name: &str) -> TaskHandle {
        TaskHandle::new(TaskRecord::new("http://x/", name, "tok", ""), None, None)
    }

    #[test]
    fn test_tombstone_keeps_order() {
        let mut collection = TaskCollection::new(1, vec![handle("a"), handle("b")]);
        let c = handle("c");
        let c_id = c.id().to_string();
        let key = collection.push(c);

        let b_id = collection.iter().nth(1).unwrap().id().to_string();
        assert!(collection.tombstone(&b_id));
        assert!(!collection.tombstone(&b_id));

        let names: Vec<String> = collection.iter().map(|h| h.file_name()).collect();
        assert_eq!(names, vec!["a", "c"]);
        assert_eq!(collection.len(), 2);
        assert_eq!(collection.get(key).unwrap().id(), c_id);
    }

    #[test]
    fn test_stale_generation_key() {
        let mut collection = TaskCollection::new(1, vec![]);
        let key = collection.push(handle("a"));
        assert!(collection.get(key).is_some());

        let rebuilt = TaskCollection::new(2, collection.iter().cloned().collect());
        assert!(rebuilt.get(key).is_none());
        assert_eq!(rebuilt.len(), 1);
    }

    #[test]
    fn test_view_filter() {
        let collection = TaskCollection::new(
            3,
            vec![handle("Report.PDF"), handle("movie.mkv"), handle("report-2.pdf")],
        );

        assert_eq!(collection.view("").len(), 3);
        let view = collection.view("report");
        assert_eq!(view.len(), 2);
        assert_eq!(view.generation(), 3);
        assert_eq!(collection.view("PDF").len(), 2);
        assert!(collection.view("zip").is_empty());
    }

    #[tokio::test]
    async fn test_rebuild_inherits_final_status() {
        let canceled = handle("a");
        let stored = canceled.record();
        canceled.cancel().await.unwrap();
        let other = handle("b");

        let previous = TaskCollection::new(1, vec![canceled, other.clone()]);
        let rebuilt = TaskCollection::new(
            2,
            vec![
                TaskHandle::new(stored, None, None),
                TaskHandle::new(other.record(), None, None),
                handle("c"),
            ],
        );
        rebuilt.inherit_from(&previous);

        let statuses: Vec<TaskStatus> = rebuilt.iter().map(TaskHandle::status).collect();
        assert_eq!(
            statuses,
            vec![TaskStatus::Canceled, TaskStatus::Queued, TaskStatus::Queued]
        );
    }

    proptest! {
        #[test]
        fn prop_view_matches_substring(
            names in proptest::collection::vec("[a-zA-Z]{0,8}", 0..12),
            filter in "[a-zA-Z]{0,3}",
        ) {
            let collection = TaskCollection::new(
                0,
                names.iter().map(|n| handle(n)).collect(),
            );
            let view = collection.view(&filter);

            let expected: Vec<&String> = names
                .iter()
                .filter(|n| n.to_lowercase().contains(&filter.to_lowercase()))
                .collect();

            prop_assert_eq!(view.len(), expected.len());
            for (task, name) in view.iter().zip(expected) {
                prop_assert_eq!(&task.file_name(), name);
            }
        }
    }
}
