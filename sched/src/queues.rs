//! Ready, timed, and blocked queue disciplines.
//!
//! All three are intrusive doubly-linked index lists through the task
//! arena. The ready and timed lists are circular with the CPU's host
//! task as sentinel: its `HOST_PRIORITY` terminates priority walks and
//! its `RT_TIME_END` resume time terminates deadline walks, so no walk
//! needs an explicit end check.
//!
//! A subtlety inherited from the design: the *running* task stays on its
//! ready queue. The decision just reads the queue head and compares it
//! with `current`, which is also what makes yield and priority rotation
//! plain list surgery.

use quartz_abi::task::{QueueOrder, TaskState};
use quartz_abi::time::RTime;

use crate::task::{NO_SYNC, NO_TASK, SchedCore, SyncId, TaskId};

impl SchedCore {
    // --- Ready list ---------------------------------------------------------

    /// Insert by ascending effective priority, FIFO within a priority
    /// class (`>=` walks past peers of equal priority).
    pub fn enq_ready_task(&mut self, tid: TaskId) {
        let cpu = self.tasks[tid as usize].runnable_on_cpu as usize;
        let sentinel = self.host_of(cpu);
        if tid == sentinel {
            return;
        }
        let prio = self.tasks[tid as usize].priority;
        let mut q = self.tasks[sentinel as usize].rq_next;
        while q != sentinel && prio >= self.tasks[q as usize].priority {
            q = self.tasks[q as usize].rq_next;
        }
        let prev = self.tasks[q as usize].rq_prev;
        self.tasks[tid as usize].rq_prev = prev;
        self.tasks[tid as usize].rq_next = q;
        self.tasks[prev as usize].rq_next = tid;
        self.tasks[q as usize].rq_prev = tid;
    }

    /// Unlink from the ready list if the task is runnable (blocked tasks
    /// were already unlinked by the blocking path).
    pub fn rem_ready_task(&mut self, tid: TaskId) {
        if self.tasks[tid as usize].is_runnable() {
            self.rem_ready_current(tid);
        }
    }

    /// Unconditional ready-list unlink; the caller knows the task is
    /// linked (it is the running task entering a blocking state).
    pub fn rem_ready_current(&mut self, tid: TaskId) {
        let prev = self.tasks[tid as usize].rq_prev;
        let next = self.tasks[tid as usize].rq_next;
        if prev == NO_TASK || next == NO_TASK {
            return;
        }
        self.tasks[prev as usize].rq_next = next;
        self.tasks[next as usize].rq_prev = prev;
        self.tasks[tid as usize].rq_prev = NO_TASK;
        self.tasks[tid as usize].rq_next = NO_TASK;
    }

    /// Apply a new effective priority, repositioning a runnable task in
    /// its priority class. Returns true when the value changed and a
    /// reschedule is warranted.
    pub fn renq_ready_task(&mut self, tid: TaskId, priority: i32) -> bool {
        if self.tasks[tid as usize].priority == priority {
            return false;
        }
        self.tasks[tid as usize].priority = priority;
        if self.tasks[tid as usize].is_runnable() {
            self.rem_ready_current(tid);
            self.enq_ready_task(tid);
        }
        true
    }

    /// Move a runnable task behind its equal-priority peers: the manual
    /// round-robin used by yield and by a same-value priority change.
    pub fn rotate_within_class(&mut self, tid: TaskId) -> bool {
        if !self.tasks[tid as usize].is_runnable() {
            return false;
        }
        let prio = self.tasks[tid as usize].priority;
        let mut peer = self.tasks[tid as usize].rq_next;
        let sentinel = self.host_of(self.tasks[tid as usize].runnable_on_cpu as usize);
        while peer != sentinel && self.tasks[peer as usize].priority == prio {
            peer = self.tasks[peer as usize].rq_next;
        }
        if peer == self.tasks[tid as usize].rq_next {
            return false;
        }
        self.rem_ready_current(tid);
        let prev = self.tasks[peer as usize].rq_prev;
        self.tasks[tid as usize].rq_prev = prev;
        self.tasks[tid as usize].rq_next = peer;
        self.tasks[prev as usize].rq_next = tid;
        self.tasks[peer as usize].rq_prev = tid;
        true
    }

    /// The highest-priority runnable task on a CPU (the host task when
    /// nothing real-time is ready).
    #[inline]
    pub fn ready_head(&self, cpu: usize) -> TaskId {
        self.tasks[self.host_of(cpu) as usize].rq_next
    }

    // --- Timed list ---------------------------------------------------------

    /// Insert by ascending resume time; `>=` keeps equal deadlines in
    /// arrival order so same-instant releases reach the ready queue
    /// FIFO.
    pub fn enq_timed_task(&mut self, tid: TaskId) {
        let cpu = self.tasks[tid as usize].runnable_on_cpu as usize;
        let sentinel = self.host_of(cpu);
        if tid == sentinel {
            return;
        }
        let resume = self.tasks[tid as usize].resume_time;
        let mut q = self.tasks[sentinel as usize].tq_next;
        while q != sentinel && resume >= self.tasks[q as usize].resume_time {
            q = self.tasks[q as usize].tq_next;
        }
        let prev = self.tasks[q as usize].tq_prev;
        self.tasks[tid as usize].tq_prev = prev;
        self.tasks[tid as usize].tq_next = q;
        self.tasks[prev as usize].tq_next = tid;
        self.tasks[q as usize].tq_prev = tid;
    }

    /// Unlink from the timed list if the task is delayed. The DELAYED
    /// bit itself is the caller's to clear.
    pub fn rem_timed_task(&mut self, tid: TaskId) {
        if !self.tasks[tid as usize].state.contains(TaskState::DELAYED) {
            return;
        }
        let prev = self.tasks[tid as usize].tq_prev;
        let next = self.tasks[tid as usize].tq_next;
        if prev == NO_TASK || next == NO_TASK {
            return;
        }
        self.tasks[prev as usize].tq_next = next;
        self.tasks[next as usize].tq_prev = prev;
        self.tasks[tid as usize].tq_prev = NO_TASK;
        self.tasks[tid as usize].tq_next = NO_TASK;
    }

    #[inline]
    pub fn timed_head(&self, cpu: usize) -> TaskId {
        let sentinel = self.host_of(cpu);
        let head = self.tasks[sentinel as usize].tq_next;
        if head == sentinel { NO_TASK } else { head }
    }

    /// Release every timed task due by `time_h`, moving the runnable
    /// ones onto the ready queue. A task whose timed semaphore wait
    /// expires wakes with DELAYED and SEMAPHORE cleared but stays on the
    /// semaphore's blocked queue; the waiter classifies that as a
    /// timeout when it resumes.
    pub fn wake_up_timed_tasks(&mut self, cpu: usize, time_h: RTime) {
        let sentinel = self.host_of(cpu);
        let mut tid = self.tasks[sentinel as usize].tq_next;
        while tid != sentinel && self.tasks[tid as usize].resume_time <= time_h {
            let next = self.tasks[tid as usize].tq_next;
            let task = &mut self.tasks[tid as usize];
            task.state.remove(TaskState::DELAYED | TaskState::SEMAPHORE);
            task.tq_prev = NO_TASK;
            task.tq_next = NO_TASK;
            let runnable = task.is_runnable();
            if runnable {
                self.enq_ready_task(tid);
            }
            tid = next;
        }
        self.tasks[sentinel as usize].tq_next = tid;
        self.tasks[tid as usize].tq_prev = sentinel;
    }

    // --- Blocked queues -----------------------------------------------------

    /// Park the task on a sync object's wait queue, priority-ordered or
    /// FIFO per the object's discipline. Equal priorities queue FIFO.
    pub fn enqueue_blocked(&mut self, tid: TaskId, sync: SyncId) {
        self.tasks[tid as usize].blocked_on = sync;
        let slot = &self.syncs[sync as usize];
        let (head, qtype) = (slot.wq_head, slot.qtype);

        let insert_before = match qtype {
            QueueOrder::Fifo => NO_TASK,
            QueueOrder::Priority => {
                let prio = self.tasks[tid as usize].priority;
                let mut q = head;
                while q != NO_TASK && self.tasks[q as usize].priority <= prio {
                    q = self.tasks[q as usize].bq_next;
                }
                q
            }
        };

        self.blocked_insert_before(tid, sync, insert_before);
    }

    fn blocked_insert_before(&mut self, tid: TaskId, sync: SyncId, before: TaskId) {
        let slot = &mut self.syncs[sync as usize];
        if before == NO_TASK {
            // Append at tail.
            let tail = slot.wq_tail;
            self.tasks[tid as usize].bq_prev = tail;
            self.tasks[tid as usize].bq_next = NO_TASK;
            slot.wq_tail = tid;
            if tail == NO_TASK {
                slot.wq_head = tid;
            } else {
                self.tasks[tail as usize].bq_next = tid;
            }
        } else {
            let prev = self.tasks[before as usize].bq_prev;
            self.tasks[tid as usize].bq_prev = prev;
            self.tasks[tid as usize].bq_next = before;
            self.tasks[before as usize].bq_prev = tid;
            if prev == NO_TASK {
                self.syncs[sync as usize].wq_head = tid;
            } else {
                self.tasks[prev as usize].bq_next = tid;
            }
        }
    }

    /// Remove the task from whatever wait queue it is on and forget any
    /// in-flight priority pass.
    pub fn dequeue_blocked(&mut self, tid: TaskId) {
        self.tasks[tid as usize].prio_passed_to = NO_TASK;
        let sync = self.tasks[tid as usize].blocked_on;
        if sync == NO_SYNC {
            return;
        }
        let prev = self.tasks[tid as usize].bq_prev;
        let next = self.tasks[tid as usize].bq_next;
        if prev == NO_TASK {
            self.syncs[sync as usize].wq_head = next;
        } else {
            self.tasks[prev as usize].bq_next = next;
        }
        if next == NO_TASK {
            self.syncs[sync as usize].wq_tail = prev;
        } else {
            self.tasks[next as usize].bq_prev = prev;
        }
        let task = &mut self.tasks[tid as usize];
        task.bq_prev = NO_TASK;
        task.bq_next = NO_TASK;
        task.blocked_on = NO_SYNC;
    }

    /// Reposition a blocked task after its priority changed, preserving
    /// FIFO among its new peers. FIFO-ordered queues are left alone.
    pub fn requeue_blocked(&mut self, tid: TaskId) {
        let sync = self.tasks[tid as usize].blocked_on;
        if sync == NO_SYNC || self.syncs[sync as usize].qtype == QueueOrder::Fifo {
            return;
        }
        // Plain unlink (keep blocked_on and prio_passed_to intact).
        let prev = self.tasks[tid as usize].bq_prev;
        let next = self.tasks[tid as usize].bq_next;
        if prev == NO_TASK {
            self.syncs[sync as usize].wq_head = next;
        } else {
            self.tasks[prev as usize].bq_next = next;
        }
        if next == NO_TASK {
            self.syncs[sync as usize].wq_tail = prev;
        } else {
            self.tasks[next as usize].bq_prev = prev;
        }

        let prio = self.tasks[tid as usize].priority;
        let mut q = self.syncs[sync as usize].wq_head;
        while q != NO_TASK && self.tasks[q as usize].priority <= prio {
            q = self.tasks[q as usize].bq_next;
        }
        self.blocked_insert_before(tid, sync, q);
    }

    // --- Priority inheritance ----------------------------------------------

    /// Propagate `waiter`'s priority through the ownership chain
    /// starting at `owner`. Returns a bitmask of CPUs whose ready queue
    /// changed and therefore need a scheduling decision.
    pub fn pass_prio(&mut self, owner: TaskId, waiter: TaskId) -> u32 {
        let mut schedmap = 0u32;
        let prio = self.tasks[waiter as usize].priority;
        self.tasks[waiter as usize].prio_passed_to = owner;

        let mut walked = 0;
        let mut to = owner;
        while to != NO_TASK && self.tasks[to as usize].priority > prio {
            self.tasks[to as usize].priority = prio;
            if self.tasks[to as usize].is_runnable() {
                self.rem_ready_current(to);
                self.enq_ready_task(to);
                schedmap |= 1 << self.tasks[to as usize].runnable_on_cpu;
            } else if self.tasks[to as usize].blocked_on != NO_SYNC {
                self.requeue_blocked(to);
            }
            to = self.tasks[to as usize].prio_passed_to;

            // The ownership graph is acyclic by construction; the bound
            // turns a corrupted chain into a fatal freeze elsewhere
            // instead of a silent infinite walk here.
            walked += 1;
            if walked >= quartz_abi::task::MAX_TASKS {
                break;
            }
        }
        schedmap
    }
}
