//! Worker slot table: a fixed arena of slots plus index maps.
//!
//! Slots are reused, never destroyed. The connection is referenced only by
//! its `ConnId` and a directive sender, so there is no ownership link from
//! a slot to a socket. Dropping the sender is how a slot lets go of its
//! connection.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use tokio::sync::mpsc;

use super::connection::{ConnId, Directive};
use crate::domain::{ExternalJobId, SlotId, TaskRef};
use crate::wire::CapturePaths;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Nothing launched.
    Empty,
    /// Launch request accepted, waiting for the worker to connect.
    Launching,
    /// Connected, handshake in progress.
    Handshake,
    Idle,
    /// Idle with no ready work; gets a wakeup when work appears.
    AwaitingWakeup,
    Assigned,
    /// Told to terminate because only deep sleepers are running.
    Retired,
}

#[derive(Debug)]
pub struct ConnHandle {
    pub id: ConnId,
    pub directives: mpsc::UnboundedSender<Directive>,
}

#[derive(Debug)]
pub struct Slot {
    pub id: SlotId,
    pub job_id: Option<ExternalJobId>,
    pub conn: Option<ConnHandle>,
    pub state: SlotState,
    pub assignment: Option<TaskRef>,
    pub tmp_base: PathBuf,
    pub capture: Option<CapturePaths>,
    /// Number of launch requests issued for this slot.
    pub launches: u32,
}

impl Slot {
    /// A worker is connected to this slot.
    pub fn is_active(&self) -> bool {
        self.conn.is_some()
    }
}

#[derive(Debug)]
pub struct SlotTable {
    slots: Vec<Slot>,
    by_job: HashMap<ExternalJobId, SlotId>,
    by_conn: HashMap<ConnId, SlotId>,
    wakeup: BTreeSet<SlotId>,
    resubmit: BTreeSet<SlotId>,
    restart: BTreeSet<SlotId>,
}

impl SlotTable {
    /// `count` empty slots with temp bases `<tmp_prefix>_<n>`.
    pub fn new(count: usize, tmp_prefix: &Path) -> Self {
        let prefix = tmp_prefix.to_string_lossy();
        let slots = (0..count)
            .map(|n| Slot {
                id: SlotId(n),
                job_id: None,
                conn: None,
                state: SlotState::Empty,
                assignment: None,
                tmp_base: PathBuf::from(format!("{prefix}_{n}")),
                capture: None,
                launches: 0,
            })
            .collect();
        Self {
            slots,
            by_job: HashMap::new(),
            by_conn: HashMap::new(),
            wakeup: BTreeSet::new(),
            resubmit: BTreeSet::new(),
            restart: BTreeSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, id: SlotId) -> Option<&Slot> {
        self.slots.get(id.0)
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut Slot> {
        self.slots.get_mut(id.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Slot> {
        self.slots.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = SlotId> + use<> {
        (0..self.slots.len()).map(SlotId)
    }

    pub fn slot_for_job(&self, job_id: ExternalJobId) -> Option<SlotId> {
        self.by_job.get(&job_id).copied()
    }

    pub fn slot_for_conn(&self, conn: ConnId) -> Option<SlotId> {
        self.by_conn.get(&conn).copied()
    }

    pub fn connected(&self) -> usize {
        self.by_conn.len()
    }

    pub fn state(&self, id: SlotId) -> Option<SlotState> {
        self.get(id).map(|s| s.state)
    }

    pub fn set_state(&mut self, id: SlotId, state: SlotState) {
        if let Some(slot) = self.slots.get_mut(id.0) {
            slot.state = state;
        }
    }

    /// Record a successful launch.
    pub fn bind_job(&mut self, id: SlotId, job_id: ExternalJobId) {
        let Some(slot) = self.slots.get_mut(id.0) else {
            return;
        };
        if let Some(old) = slot.job_id.replace(job_id) {
            self.by_job.remove(&old);
        }
        slot.state = SlotState::Launching;
        slot.launches += 1;
        self.by_job.insert(job_id, id);
        self.restart.remove(&id);
        self.resubmit.remove(&id);
    }

    /// A worker connected and passed the job id check.
    pub fn attach(&mut self, id: SlotId, handle: ConnHandle) {
        let Some(slot) = self.slots.get_mut(id.0) else {
            return;
        };
        self.by_conn.insert(handle.id, id);
        slot.conn = Some(handle);
        slot.state = SlotState::Handshake;
    }

    pub fn register(&mut self, id: SlotId, capture: CapturePaths) {
        if let Some(slot) = self.slots.get_mut(id.0) {
            slot.capture = Some(capture);
            slot.state = SlotState::Idle;
        }
    }

    pub fn assign(&mut self, id: SlotId, task: TaskRef) {
        if let Some(slot) = self.slots.get_mut(id.0) {
            slot.assignment = Some(task);
            slot.state = SlotState::Assigned;
        }
        self.wakeup.remove(&id);
    }

    /// Clear the assignment, leaving the slot idle.
    pub fn take_assignment(&mut self, id: SlotId) -> Option<TaskRef> {
        let slot = self.slots.get_mut(id.0)?;
        let task = slot.assignment.take();
        if slot.state == SlotState::Assigned {
            slot.state = SlotState::Idle;
        }
        task
    }

    /// Send a directive to the slot's connection. False when nobody listens.
    pub fn send(&self, id: SlotId, directive: Directive) -> bool {
        self.get(id)
            .and_then(|s| s.conn.as_ref())
            .is_some_and(|c| c.directives.send(directive).is_ok())
    }

    /// Forget the worker. Dropping the handle closes its connection.
    pub fn reset(&mut self, id: SlotId) {
        let Some(slot) = self.slots.get_mut(id.0) else {
            return;
        };
        if let Some(job) = slot.job_id.take() {
            self.by_job.remove(&job);
        }
        if let Some(conn) = slot.conn.take() {
            self.by_conn.remove(&conn.id);
        }
        slot.assignment = None;
        slot.capture = None;
        slot.state = SlotState::Empty;
        self.wakeup.remove(&id);
    }

    /// Reset and park for relaunch on the next tick.
    pub fn park_restart(&mut self, id: SlotId) {
        self.reset(id);
        self.restart.insert(id);
    }

    /// Reset and park until new ready work appears.
    pub fn retire(&mut self, id: SlotId) {
        self.reset(id);
        self.set_state(id, SlotState::Retired);
        self.resubmit.insert(id);
    }

    pub fn await_wakeup(&mut self, id: SlotId) {
        self.set_state(id, SlotState::AwaitingWakeup);
        self.wakeup.insert(id);
    }

    /// Failed launches stay parked here until a relaunch succeeds.
    pub fn mark_restart(&mut self, id: SlotId) {
        self.restart.insert(id);
    }

    pub fn take_wakeups(&mut self) -> Vec<SlotId> {
        std::mem::take(&mut self.wakeup).into_iter().collect()
    }

    pub fn take_resubmits(&mut self) -> Vec<SlotId> {
        std::mem::take(&mut self.resubmit).into_iter().collect()
    }

    pub fn take_restarts(&mut self) -> Vec<SlotId> {
        std::mem::take(&mut self.restart).into_iter().collect()
    }

    pub fn awaiting_wakeup(&self) -> Vec<SlotId> {
        self.wakeup.iter().copied().collect()
    }

    pub fn pending_restarts(&self) -> usize {
        self.restart.len()
    }

    pub fn pending_resubmits(&self) -> usize {
        self.resubmit.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::GroupId;

    fn handle(id: u64) -> (ConnHandle, mpsc::UnboundedReceiver<Directive>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ConnHandle {
                id: ConnId(id),
                directives: tx,
            },
            rx,
        )
    }

    #[test]
    fn temp_bases_follow_the_prefix() {
        let table = SlotTable::new(3, Path::new("/scratch/run"));
        assert_eq!(table.len(), 3);
        assert_eq!(
            table.get(SlotId(2)).unwrap().tmp_base,
            PathBuf::from("/scratch/run_2")
        );
        assert!(table.iter().all(|s| s.state == SlotState::Empty));
    }

    #[test]
    fn lifecycle_updates_the_index_maps() {
        let mut table = SlotTable::new(2, Path::new("t"));
        let slot = SlotId(1);

        table.bind_job(slot, ExternalJobId(500));
        assert_eq!(table.slot_for_job(ExternalJobId(500)), Some(slot));
        assert_eq!(table.state(slot), Some(SlotState::Launching));

        let (h, _rx) = handle(7);
        table.attach(slot, h);
        assert_eq!(table.slot_for_conn(ConnId(7)), Some(slot));
        assert_eq!(table.connected(), 1);

        table.register(slot, CapturePaths::from_base(Path::new("t_1")));
        assert_eq!(table.state(slot), Some(SlotState::Idle));

        let task = TaskRef::new(GroupId(0), 3);
        table.assign(slot, task);
        assert_eq!(table.state(slot), Some(SlotState::Assigned));
        assert_eq!(table.take_assignment(slot), Some(task));
        assert_eq!(table.state(slot), Some(SlotState::Idle));

        table.park_restart(slot);
        assert_eq!(table.slot_for_job(ExternalJobId(500)), None);
        assert_eq!(table.slot_for_conn(ConnId(7)), None);
        assert_eq!(table.connected(), 0);
        assert_eq!(table.take_restarts(), vec![slot]);
        assert!(table.take_restarts().is_empty());
    }

    #[test]
    fn reset_drops_the_directive_sender() {
        let mut table = SlotTable::new(1, Path::new("t"));
        let (h, mut rx) = handle(1);
        table.bind_job(SlotId(0), ExternalJobId(1));
        table.attach(SlotId(0), h);

        assert!(table.send(SlotId(0), Directive::Terminate));
        table.reset(SlotId(0));
        assert_eq!(rx.try_recv(), Ok(Directive::Terminate));
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert!(!table.send(SlotId(0), Directive::Ack));
    }

    #[test]
    fn retire_and_wakeup_sets() {
        let mut table = SlotTable::new(3, Path::new("t"));
        table.await_wakeup(SlotId(0));
        table.await_wakeup(SlotId(2));
        table.retire(SlotId(1));

        assert_eq!(table.awaiting_wakeup(), vec![SlotId(0), SlotId(2)]);
        assert_eq!(table.state(SlotId(1)), Some(SlotState::Retired));
        assert_eq!(table.pending_resubmits(), 1);

        // assignment takes a slot out of the wakeup set
        table.assign(SlotId(2), TaskRef::new(GroupId(0), 0));
        assert_eq!(table.take_wakeups(), vec![SlotId(0)]);

        // relaunching clears the parked entry
        table.bind_job(SlotId(1), ExternalJobId(9));
        assert!(table.take_resubmits().is_empty());
        assert_eq!(table.get(SlotId(1)).unwrap().launches, 1);
    }
}
