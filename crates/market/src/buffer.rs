use klinefeed_core::feed::error::BufferError;
use std::collections::HashMap;

/// 链上的一个槽位，前后指针均为槽位下标。
#[derive(Debug)]
struct Slot<T> {
    key: i64,
    value: T,
    prev: Option<usize>,
    next: Option<usize>,
}

/// # Summary
/// 以开盘时间为键的有序双向链容器，支持 O(1) 键查找与 O(1) 首尾操作。
///
/// # Invariants
/// - 键唯一。
/// - 从 head 沿 next 前进恰好 `len()` 步到达 tail，且键严格递增。
///   容器本身不排序，调用方只能在与现有端点一致的位置插入。
/// - `len()` 恒等于索引中存活键的数量。
/// - 槽位存放在 arena 中并通过键到下标的映射寻址，释放的槽位会被复用。
#[derive(Debug)]
pub struct TimeIndexedBuffer<T> {
    // 槽位 arena
    slots: Vec<Option<Slot<T>>>,
    // 可复用的空闲槽位下标
    free: Vec<usize>,
    // 键到槽位下标的索引
    index: HashMap<i64, usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl<T> Default for TimeIndexedBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimeIndexedBuffer<T> {
    /// 创建空容器。
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
        }
    }

    /// 预分配 `capacity` 个槽位的空容器。
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            index: HashMap::with_capacity(capacity),
            head: None,
            tail: None,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, key: i64) -> bool {
        self.index.contains_key(&key)
    }

    fn slot(&self, idx: usize) -> Option<&Slot<T>> {
        self.slots.get(idx).and_then(Option::as_ref)
    }

    fn slot_mut(&mut self, idx: usize) -> Option<&mut Slot<T>> {
        self.slots.get_mut(idx).and_then(Option::as_mut)
    }

    fn slot_of(&self, key: i64) -> Result<&Slot<T>, BufferError> {
        self.index
            .get(&key)
            .and_then(|&idx| self.slot(idx))
            .ok_or(BufferError::NotFound(key))
    }

    fn alloc(&mut self, slot: Slot<T>) -> usize {
        match self.free.pop() {
            Some(idx) => {
                if let Some(cell) = self.slots.get_mut(idx) {
                    *cell = Some(slot);
                }
                idx
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        }
    }

    /// # Summary
    /// 在尾部追加一个元素。
    ///
    /// # Logic
    /// 1. 键已存在则返回 `DuplicateKey`，容器不变。
    /// 2. 新槽位的 prev 指向旧尾部；空容器时同时成为 head 与 tail。
    ///
    /// # Arguments
    /// * `key`: 开盘时间。
    /// * `value`: 元素值。
    ///
    /// # Returns
    /// 成功返回 Ok。
    pub fn push_back(&mut self, key: i64, value: T) -> Result<(), BufferError> {
        if self.index.contains_key(&key) {
            return Err(BufferError::DuplicateKey(key));
        }
        let old_tail = self.tail;
        let idx = self.alloc(Slot {
            key,
            value,
            prev: old_tail,
            next: None,
        });
        match old_tail.and_then(|t| self.slot_mut(t)) {
            Some(tail) => tail.next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        self.index.insert(key, idx);
        Ok(())
    }

    /// # Summary
    /// 在头部前插一个元素。
    ///
    /// # Logic
    /// 与 `push_back` 对称：键已存在返回 `DuplicateKey`，新槽位的 next 指向旧头部。
    ///
    /// # Arguments
    /// * `key`: 开盘时间。
    /// * `value`: 元素值。
    ///
    /// # Returns
    /// 成功返回 Ok。
    pub fn push_front(&mut self, key: i64, value: T) -> Result<(), BufferError> {
        if self.index.contains_key(&key) {
            return Err(BufferError::DuplicateKey(key));
        }
        let old_head = self.head;
        let idx = self.alloc(Slot {
            key,
            value,
            prev: None,
            next: old_head,
        });
        match old_head.and_then(|h| self.slot_mut(h)) {
            Some(head) => head.prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
        self.index.insert(key, idx);
        Ok(())
    }

    pub fn head(&self) -> Result<&T, BufferError> {
        self.head
            .and_then(|idx| self.slot(idx))
            .map(|s| &s.value)
            .ok_or(BufferError::Empty)
    }

    pub fn tail(&self) -> Result<&T, BufferError> {
        self.tail
            .and_then(|idx| self.slot(idx))
            .map(|s| &s.value)
            .ok_or(BufferError::Empty)
    }

    /// # Summary
    /// 从头部向内走 `step` 步后的键，`head_key(0)` 即头部键。
    ///
    /// # Returns
    /// 链长度不足时返回 `StepOutOfRange`，属于未找到一类 (见 `BufferError::is_not_found`)。
    pub fn head_key(&self, step: usize) -> Result<i64, BufferError> {
        self.walk(self.head, step, |s| s.next)
    }

    /// # Summary
    /// 从尾部向内走 `step` 步后的键，`tail_key(0)` 即尾部键。
    ///
    /// # Returns
    /// 链长度不足时返回 `StepOutOfRange`，属于未找到一类 (见 `BufferError::is_not_found`)。
    pub fn tail_key(&self, step: usize) -> Result<i64, BufferError> {
        self.walk(self.tail, step, |s| s.prev)
    }

    fn walk(
        &self,
        start: Option<usize>,
        step: usize,
        advance: impl Fn(&Slot<T>) -> Option<usize>,
    ) -> Result<i64, BufferError> {
        let out_of_range = BufferError::StepOutOfRange {
            step,
            len: self.len(),
        };
        let mut cur = start.and_then(|idx| self.slot(idx)).ok_or(out_of_range.clone())?;
        for _ in 0..step {
            cur = advance(cur)
                .and_then(|idx| self.slot(idx))
                .ok_or(out_of_range.clone())?;
        }
        Ok(cur.key)
    }

    /// 摘除槽位并重新链接相邻节点，返回被摘除的值。
    fn unlink(&mut self, idx: usize) -> Option<T> {
        let slot = self.slots.get_mut(idx)?.take()?;
        self.free.push(idx);
        match slot.prev.and_then(|p| self.slot_mut(p)) {
            Some(prev) => prev.next = slot.next,
            None => self.head = slot.next,
        }
        match slot.next.and_then(|n| self.slot_mut(n)) {
            Some(next) => next.prev = slot.prev,
            None => self.tail = slot.prev,
        }
        self.index.remove(&slot.key);
        Some(slot.value)
    }

    /// 移除并返回头部元素，空容器返回 `Empty`。
    pub fn pop_front(&mut self) -> Result<T, BufferError> {
        let idx = self.head.ok_or(BufferError::Empty)?;
        self.unlink(idx).ok_or(BufferError::Empty)
    }

    /// 移除并返回尾部元素，空容器返回 `Empty`。
    pub fn pop_back(&mut self) -> Result<T, BufferError> {
        let idx = self.tail.ok_or(BufferError::Empty)?;
        self.unlink(idx).ok_or(BufferError::Empty)
    }

    /// # Summary
    /// 按键移除任意节点。
    ///
    /// # Logic
    /// 重新链接前后邻居；若节点位于端点则更新 head / tail。
    ///
    /// # Returns
    /// 键不存在时返回 `NotFound`。
    pub fn pop_index(&mut self, key: i64) -> Result<T, BufferError> {
        let idx = *self.index.get(&key).ok_or(BufferError::NotFound(key))?;
        self.unlink(idx).ok_or(BufferError::NotFound(key))
    }

    pub fn get(&self, key: i64) -> Result<&T, BufferError> {
        self.slot_of(key).map(|s| &s.value)
    }

    /// # Summary
    /// 链顺序上的下一个键。
    ///
    /// # Returns
    /// 键不存在返回 `NotFound`，位于尾部返回 `NoNeighbor`。
    pub fn next(&self, key: i64) -> Result<i64, BufferError> {
        let slot = self.slot_of(key)?;
        slot.next
            .and_then(|idx| self.slot(idx))
            .map(|s| s.key)
            .ok_or(BufferError::NoNeighbor(key))
    }

    /// # Summary
    /// 链顺序上的上一个键。
    ///
    /// # Returns
    /// 键不存在返回 `NotFound`，位于头部返回 `NoNeighbor`。
    pub fn prev(&self, key: i64) -> Result<i64, BufferError> {
        let slot = self.slot_of(key)?;
        slot.prev
            .and_then(|idx| self.slot(idx))
            .map(|s| s.key)
            .ok_or(BufferError::NoNeighbor(key))
    }

    /// 从头到尾按链顺序遍历 (键, 值)。
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            buffer: self,
            cursor: self.head,
        }
    }

    /// 从头到尾按链顺序收集全部键。
    pub fn keys(&self) -> Vec<i64> {
        self.iter().map(|(k, _)| k).collect()
    }
}

/// 链顺序迭代器。
pub struct Iter<'a, T> {
    buffer: &'a TimeIndexedBuffer<T>,
    cursor: Option<usize>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (i64, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let slot = self.cursor.and_then(|idx| self.buffer.slot(idx))?;
        self.cursor = slot.next;
        Some((slot.key, &slot.value))
    }
}
