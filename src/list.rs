use crate::state::{TXG_SIZE, txg_index};
use crate::sync::{AtomicPtr, AtomicU8, AtomicU64, Mutex, Ordering};
use std::ptr;
use std::sync::Arc;

// List ids start at 1; 0 marks an unowned node.
static NEXT_LIST_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

const UNOWNED: u64 = 0;

/// Per-generation link slots embedded in a tracked object.
///
/// One `TxgNode` lets its owner sit on up to [`TXG_SIZE`] per-generation
/// lists of a single [`TxgList`] at once, without any allocation on insert.
/// The membership bitmap is the source of truth for `member` queries.
///
/// While any of its bits are set, a node is owned by the `TxgList` that
/// linked it; other lists treat the object as not linked and refuse to link
/// it. An object that must be tracked by several lists at once embeds one
/// node per list.
///
/// 嵌入在被跟踪对象中的每事务组链接槽。
///
/// 一个 `TxgNode` 让其所有者同时位于单个 [`TxgList`] 的最多 [`TXG_SIZE`] 个
/// 每事务组链表上，插入时无需任何分配。成员位图是 `member` 查询的唯一依据。
///
/// 只要还有成员位被设置，节点就归链接它的那个 `TxgList` 所有；其他链表把该对象视为
/// 未链接，并拒绝链接它。需要同时被多个链表跟踪的对象为每个链表嵌入一个节点。
#[derive(Debug)]
pub struct TxgNode<T> {
    // Only touched with the owning list's lock held.
    next: [AtomicPtr<T>; TXG_SIZE],
    member: AtomicU8,
    /// Id of the list holding the links, or `UNOWNED`.
    owner: AtomicU64,
}

impl<T> TxgNode<T> {
    /// Create an unlinked node.
    /// 创建一个未链接的节点。
    pub fn new() -> Self {
        Self {
            next: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            member: AtomicU8::new(0),
            owner: AtomicU64::new(UNOWNED),
        }
    }

    #[inline]
    fn is_owned_by(&self, list: u64) -> bool {
        self.owner.load(Ordering::Acquire) == list
    }

    /// Claim the node for `list`; fails if another list owns it.
    #[inline]
    fn claim(&self, list: u64) -> bool {
        match self
            .owner
            .compare_exchange(UNOWNED, list, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(owner) => owner == list,
        }
    }

    #[inline]
    fn next(&self, t: usize) -> *const T {
        self.next[t].load(Ordering::Relaxed)
    }

    #[inline]
    fn set_next(&self, t: usize, next: *const T) {
        self.next[t].store(next as *mut T, Ordering::Relaxed);
    }

    #[inline]
    fn is_member(&self, t: usize) -> bool {
        self.member.load(Ordering::Relaxed) & (1 << t) != 0
    }

    #[inline]
    fn set_member(&self, t: usize, on: bool) {
        let member = self.member.load(Ordering::Relaxed);
        let member = if on { member | (1 << t) } else { member & !(1 << t) };
        self.member.store(member, Ordering::Relaxed);
    }

    /// Clear slot `t`'s link and bit; give the node up once no bit is left.
    #[inline]
    fn unlink(&self, t: usize) {
        self.set_next(t, ptr::null());
        self.set_member(t, false);
        if self.member.load(Ordering::Relaxed) == 0 {
            self.owner.store(UNOWNED, Ordering::Release);
        }
    }
}

impl<T> Default for TxgNode<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A set of per-generation singly linked lists threaded through [`TxgNode`]s.
///
/// Used to track objects with obligations in specific generations (dirty
/// objects to write out, frees to apply). The list holds one strong
/// reference for every slot an object is linked into, so links never
/// dangle; dropping the list unlinks and releases every member.
///
/// All operations on one list are serialized by that list's lock. Every
/// operation except `remove_this` is O(1); `remove_this` walks the slot.
///
/// **Typical Usage**:
/// ```
/// use std::sync::Arc;
/// use txg_pipeline::{TxgList, TxgNode};
///
/// struct Dirty {
///     id: u64,
///     node: TxgNode<Dirty>,
/// }
///
/// fn dirty_node(d: &Dirty) -> &TxgNode<Dirty> {
///     &d.node
/// }
///
/// let list = TxgList::new(dirty_node);
/// let obj = Arc::new(Dirty { id: 1, node: TxgNode::new() });
///
/// assert!(list.add(&obj, 10));
/// assert!(!list.add(&obj, 10)); // already linked for txg 10
/// assert!(list.member(&obj, 10));
/// assert_eq!(list.remove(10).map(|d| d.id), Some(1));
/// assert!(list.is_empty(10));
/// ```
///
/// 一组通过 [`TxgNode`] 串起来的每事务组单向链表。
///
/// 用于跟踪在特定事务组中有待办义务的对象（需要写出的脏对象、需要应用的释放）。
/// 对象每链接到一个槽，链表就持有一个强引用，因此链接永远不会悬空；
/// drop 链表会解除链接并释放所有成员。
///
/// 对同一链表的所有操作都由该链表的锁串行化。除 `remove_this` 需要遍历外，所有操作都是 O(1)。
pub struct TxgList<T> {
    id: u64,
    slots: Mutex<Slots<T>>,
    node_of: fn(&T) -> &TxgNode<T>,
}

struct Slots<T> {
    head: [*const T; TXG_SIZE],
    tail: [*const T; TXG_SIZE],
}

// SAFETY: the raw head/tail pointers are strong `Arc<T>` references owned by
// the list and only dereferenced with the list lock held. A node's links are
// only read by the list that owns the node.
unsafe impl<T: Send + Sync> Send for TxgList<T> {}
unsafe impl<T: Send + Sync> Sync for TxgList<T> {}

impl<T> TxgList<T> {
    /// Create an empty list. `node_of` locates the embedded node for this list.
    /// 创建一个空链表。`node_of` 定位此链表对应的嵌入节点。
    pub fn new(node_of: fn(&T) -> &TxgNode<T>) -> Self {
        Self {
            id: NEXT_LIST_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            slots: Mutex::new(Slots {
                head: [ptr::null(); TXG_SIZE],
                tail: [ptr::null(); TXG_SIZE],
            }),
            node_of,
        }
    }

    #[inline]
    fn node<'a>(&self, obj: &'a T) -> &'a TxgNode<T> {
        (self.node_of)(obj)
    }

    /// Link `obj` at the head of `txg`'s list.
    ///
    /// Returns `false` (and changes nothing) if it is already on that list,
    /// or if its node is linked into a different list.
    ///
    /// 将 `obj` 链接到 `txg` 链表的头部。
    /// 如果它已经在该链表上，或者其节点已链接到另一个链表，返回 `false`（且不做任何修改）。
    pub fn add(&self, obj: &Arc<T>, txg: u64) -> bool {
        let t = txg_index(txg);
        let node = self.node(obj);
        let mut slots = self.slots.lock();

        if !node.claim(self.id) || node.is_member(t) {
            return false;
        }
        node.set_member(t, true);
        node.set_next(t, slots.head[t]);
        let raw = Arc::into_raw(Arc::clone(obj));
        if slots.tail[t].is_null() {
            slots.tail[t] = raw;
        }
        slots.head[t] = raw;
        true
    }

    /// Link `obj` at the tail of `txg`'s list, preserving insertion order.
    ///
    /// Returns `false` if it is already on that list, or if its node is
    /// linked into a different list.
    ///
    /// 将 `obj` 链接到 `txg` 链表的尾部，保持插入顺序。
    pub fn add_tail(&self, obj: &Arc<T>, txg: u64) -> bool {
        let t = txg_index(txg);
        let node = self.node(obj);
        let mut slots = self.slots.lock();

        if !node.claim(self.id) || node.is_member(t) {
            return false;
        }
        node.set_member(t, true);
        node.set_next(t, ptr::null());
        let raw = Arc::into_raw(Arc::clone(obj));

        let tail = slots.tail[t];
        if tail.is_null() {
            slots.head[t] = raw;
        } else {
            // SAFETY: every linked pointer is a live strong reference held by
            // this list, and we hold the list lock.
            self.node(unsafe { &*tail }).set_next(t, raw);
        }
        slots.tail[t] = raw;
        true
    }

    /// Unlink and return the head of `txg`'s list.
    /// 解除链接并返回 `txg` 链表的头部。
    pub fn remove(&self, txg: u64) -> Option<Arc<T>> {
        let t = txg_index(txg);
        let mut slots = self.slots.lock();

        let head = slots.head[t];
        if head.is_null() {
            return None;
        }
        // SAFETY: `head` is a strong reference owned by this list.
        let node = self.node(unsafe { &*head });
        slots.head[t] = node.next(t);
        if slots.head[t].is_null() {
            slots.tail[t] = ptr::null();
        }
        node.unlink(t);

        // SAFETY: hands the list's strong reference back to the caller.
        Some(unsafe { Arc::from_raw(head) })
    }

    /// Unlink `obj` from `txg`'s list and return the list's reference to it,
    /// or `None` if it was not linked there.
    ///
    /// 从 `txg` 的链表中解除 `obj` 的链接并返回链表持有的引用；
    /// 如果它不在该链表上，返回 `None`。
    pub fn remove_this(&self, obj: &T, txg: u64) -> Option<Arc<T>> {
        let t = txg_index(txg);
        let target: *const T = obj;
        let mut slots = self.slots.lock();

        let node = self.node(obj);
        if !node.is_owned_by(self.id) || !node.is_member(t) {
            return None;
        }

        let mut prev: *const T = ptr::null();
        let mut cur = slots.head[t];
        while !cur.is_null() {
            // SAFETY: see `add_tail`.
            let cur_node = self.node(unsafe { &*cur });
            let next = cur_node.next(t);
            if ptr::eq(cur, target) {
                if prev.is_null() {
                    slots.head[t] = next;
                } else {
                    // SAFETY: see `add_tail`.
                    self.node(unsafe { &*prev }).set_next(t, next);
                }
                if ptr::eq(slots.tail[t], cur) {
                    slots.tail[t] = prev;
                }
                cur_node.unlink(t);
                // SAFETY: hands the list's strong reference back to the caller.
                return Some(unsafe { Arc::from_raw(cur) });
            }
            prev = cur;
            cur = next;
        }
        None
    }

    /// Whether `obj` is on `txg`'s list. O(1).
    /// `obj` 是否在 `txg` 的链表上。O(1)。
    pub fn member(&self, obj: &T, txg: u64) -> bool {
        let _slots = self.slots.lock();
        let node = self.node(obj);
        node.is_owned_by(self.id) && node.is_member(txg_index(txg))
    }

    /// First object on `txg`'s list, without unlinking it.
    /// `txg` 链表上的第一个对象，不解除链接。
    pub fn head(&self, txg: u64) -> Option<Arc<T>> {
        let slots = self.slots.lock();
        // SAFETY: the pointer is live while we hold the lock.
        unsafe { clone_raw(slots.head[txg_index(txg)]) }
    }

    /// Object after `obj` on `txg`'s list, without unlinking anything.
    ///
    /// Returns `None` at the end of the list or if `obj` is not linked there.
    ///
    /// `txg` 链表上 `obj` 之后的对象，不解除任何链接。
    pub fn next(&self, obj: &T, txg: u64) -> Option<Arc<T>> {
        let t = txg_index(txg);
        let _slots = self.slots.lock();
        let node = self.node(obj);
        // Links of a node owned by another list are guarded by that list's
        // lock, not ours.
        if !node.is_owned_by(self.id) || !node.is_member(t) {
            return None;
        }
        // SAFETY: see `head`.
        unsafe { clone_raw(node.next(t)) }
    }

    /// Whether `txg`'s list is empty.
    pub fn is_empty(&self, txg: u64) -> bool {
        self.slots.lock().head[txg_index(txg)].is_null()
    }

    /// Whether every per-generation list is empty.
    pub fn all_empty(&self) -> bool {
        self.slots.lock().head.iter().all(|head| head.is_null())
    }
}

impl<T> Drop for TxgList<T> {
    fn drop(&mut self) {
        for t in 0..TXG_SIZE {
            while self.remove(t as u64).is_some() {}
        }
    }
}

impl<T> std::fmt::Debug for TxgList<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots = self.slots.lock();
        let occupied: Vec<bool> = slots.head.iter().map(|head| !head.is_null()).collect();
        f.debug_struct("TxgList").field("occupied", &occupied).finish()
    }
}

/// Take a new strong reference to a linked object.
///
/// # Safety
/// `raw` must be null or a live pointer obtained from `Arc::into_raw`.
unsafe fn clone_raw<T>(raw: *const T) -> Option<Arc<T>> {
    if raw.is_null() {
        return None;
    }
    unsafe {
        Arc::increment_strong_count(raw);
        Some(Arc::from_raw(raw))
    }
}
