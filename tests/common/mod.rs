//! Multi-node test harness over the in-process group bus.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use uuid::Uuid;

use lockstep::repl::{ApplyError, DonateError, ReplicationHooks, StateRequest};
use lockstep::ws::KEY_ACTION_UPDATE;
use lockstep::{
    Error, MemGroup, NodeId, NodeState, ReplConfig, Replicator, Seqno, TrxId, ViewInfo, WriteSet,
};

/// Observable events in the order the host saw them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Applied(Seqno),
    Committed(Seqno),
    View(Seqno),
    Synced,
}

#[derive(Default)]
struct GateState {
    closed: bool,
    waiting: Vec<Seqno>,
}

/// Blocks the apply callback while closed, letting tests pin a write-set
/// mid-apply.
pub struct Gate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl Gate {
    fn new() -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            cond: Condvar::new(),
        }
    }

    pub fn close(&self) {
        self.state.lock().expect("gate lock").closed = true;
    }

    pub fn open(&self) {
        self.state.lock().expect("gate lock").closed = false;
        self.cond.notify_all();
    }

    /// Test side: wait until an apply of `seqno` is parked on the gate.
    pub fn wait_blocked(&self, seqno: Seqno) {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut state = self.state.lock().expect("gate lock");
        while !state.waiting.contains(&seqno) {
            assert!(Instant::now() < deadline, "apply of {seqno} never blocked");
            let (next, _) = self
                .cond
                .wait_timeout(state, Duration::from_millis(10))
                .expect("gate lock");
            state = next;
        }
    }

    fn pass(&self, seqno: Seqno) {
        let mut state = self.state.lock().expect("gate lock");
        if !state.closed {
            return;
        }
        state.waiting.push(seqno);
        self.cond.notify_all();
        while state.closed {
            state = self.cond.wait(state).expect("gate lock");
        }
        state.waiting.retain(|s| *s != seqno);
    }
}

/// A toy storage engine: every applied key maps to the seqno of its last
/// writer, with an event log for ordering assertions.
pub struct TestStore {
    pub data: Mutex<BTreeMap<Vec<u8>, Seqno>>,
    pub events: Mutex<Vec<Event>>,
    pub donations: Mutex<Vec<(StateRequest, Seqno)>>,
    pub synced_flag: AtomicBool,
    pub gate: Gate,
}

impl TestStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(BTreeMap::new()),
            events: Mutex::new(Vec::new()),
            donations: Mutex::new(Vec::new()),
            synced_flag: AtomicBool::new(false),
            gate: Gate::new(),
        })
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("events lock").clone()
    }

    pub fn applied(&self) -> Vec<Seqno> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Applied(seqno) => Some(seqno),
                _ => None,
            })
            .collect()
    }

    pub fn committed(&self) -> Vec<Seqno> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Committed(seqno) => Some(seqno),
                _ => None,
            })
            .collect()
    }

    pub fn last_writer(&self, key: &str) -> Option<Seqno> {
        self.data
            .lock()
            .expect("data lock")
            .get(key.as_bytes())
            .copied()
    }

    /// The host engine committing a local transaction (between
    /// `pre_commit` and `post_commit`).
    pub fn record_local_commit(&self, ws: &WriteSet, seqno: Seqno) {
        let mut data = self.data.lock().expect("data lock");
        for key in ws.keys() {
            data.insert(key.key().to_vec(), seqno);
        }
        drop(data);
        self.events
            .lock()
            .expect("events lock")
            .push(Event::Committed(seqno));
    }
}

impl ReplicationHooks for TestStore {
    fn view_changed(&self, view: &ViewInfo) {
        self.events
            .lock()
            .expect("events lock")
            .push(Event::View(view.id.seqno));
    }

    fn apply(&self, ws: &[u8], global_seqno: Seqno) -> Result<(), ApplyError> {
        self.gate.pass(global_seqno);
        let write_set =
            WriteSet::decode(ws, false).map_err(|err| ApplyError::new(err.to_string()))?;
        let mut data = self.data.lock().expect("data lock");
        for key in write_set.keys() {
            data.insert(key.key().to_vec(), global_seqno);
        }
        drop(data);
        self.events
            .lock()
            .expect("events lock")
            .push(Event::Applied(global_seqno));
        Ok(())
    }

    fn commit(&self, global_seqno: Seqno) -> Result<(), ApplyError> {
        self.events
            .lock()
            .expect("events lock")
            .push(Event::Committed(global_seqno));
        Ok(())
    }

    fn donate(
        &self,
        request: &StateRequest,
        _state_uuid: Uuid,
        seqno: Seqno,
    ) -> Result<(), DonateError> {
        self.donations
            .lock()
            .expect("donations lock")
            .push((request.clone(), seqno));
        Ok(())
    }

    fn synced(&self) {
        self.synced_flag.store(true, Ordering::SeqCst);
        self.events.lock().expect("events lock").push(Event::Synced);
    }

    fn sst_request(&self) -> Bytes {
        Bytes::from_static(b"test-sst-descriptor")
    }
}

pub struct TestNode {
    pub id: NodeId,
    pub replicator: Arc<Replicator>,
    pub store: Arc<TestStore>,
    receivers: Vec<JoinHandle<Result<(), Error>>>,
    pub dir: Option<tempfile::TempDir>,
}

pub fn node_config(dir: &std::path::Path) -> ReplConfig {
    ReplConfig {
        data_dir: dir.to_path_buf(),
        report_interval: 1,
        ..ReplConfig::default()
    }
}

pub fn start_node(group: &MemGroup, receivers: usize) -> TestNode {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = node_config(dir.path());
    start_node_with(group, NodeId::random(), config, Some(dir), receivers)
}

pub fn start_node_with(
    group: &MemGroup,
    id: NodeId,
    config: ReplConfig,
    dir: Option<tempfile::TempDir>,
    receivers: usize,
) -> TestNode {
    let channel = group.join(id);
    let store = TestStore::new();
    let hooks: Arc<dyn ReplicationHooks> = store.clone();
    let replicator =
        Arc::new(Replicator::new(config, Arc::new(channel), hooks).expect("replicator"));
    replicator.connect().expect("connect");

    let receivers = (0..receivers.max(1))
        .map(|_| {
            let replicator = Arc::clone(&replicator);
            thread::spawn(move || replicator.run_receiver())
        })
        .collect();

    TestNode {
        id,
        replicator,
        store,
        receivers,
        dir,
    }
}

impl TestNode {
    /// Runs a whole local transaction through the pipeline: stage keys,
    /// replicate, certify, engine-commit, finish. Returns the global
    /// seqno.
    pub fn commit_trx(&self, trx_id: i64, keys: &[&str]) -> Seqno {
        let trx = self
            .replicator
            .local_trx(TrxId::new(trx_id), true)
            .expect("trx");
        {
            let mut inner = trx.lock();
            for key in keys {
                inner
                    .write_set_mut()
                    .append_row_key("t", key.as_bytes().to_vec(), KEY_ACTION_UPDATE);
            }
            inner.write_set_mut().append_data(b"row image");
        }
        self.replicator.replicate(&trx).expect("replicate");
        self.replicator.pre_commit(&trx).expect("pre_commit");
        let seqno = trx.lock().global_seqno();
        self.store.record_local_commit(trx.lock().write_set(), seqno);
        self.replicator.post_commit(&trx).expect("post_commit");
        self.replicator.discard_local_trx(TrxId::new(trx_id));
        seqno
    }

    pub fn shutdown(mut self) -> Option<tempfile::TempDir> {
        self.replicator.close().expect("close");
        for join in self.receivers.drain(..) {
            join.join().expect("receiver join").expect("receiver result");
        }
        self.dir.take()
    }
}

pub fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

pub fn wait_synced(node: &TestNode) {
    wait_until("node synced", || {
        node.replicator.state() == NodeState::Synced
    });
}

/// Starts the group's founding member and waits for it to bootstrap.
pub fn start_first_node(group: &MemGroup) -> TestNode {
    let node = start_node(group, 1);
    wait_synced(&node);
    node
}

/// Plays the host side of a state transfer: waits for the group-chosen
/// donor to receive the request, copies the (incremental when possible)
/// key range into the joiner's store, and completes the handoff. Returns
/// the donor that served.
pub fn serve_transfer<'a>(donors: &[&'a TestNode], joiner: &TestNode) -> &'a TestNode {
    wait_until("donation requested", || {
        donors
            .iter()
            .any(|donor| !donor.store.donations.lock().expect("donations lock").is_empty())
    });
    let donor = donors
        .iter()
        .copied()
        .find(|donor| !donor.store.donations.lock().expect("donations lock").is_empty())
        .expect("donor vanished");
    let (request, donor_seqno) = donor
        .store
        .donations
        .lock()
        .expect("donations lock")
        .remove(0);

    // The donated snapshot must cover everything ordered before the
    // request.
    wait_until("donor caught up", || {
        donor.replicator.last_committed() >= donor_seqno
    });
    let seqno = donor.replicator.last_committed();
    let uuid = donor.replicator.state_uuid();

    {
        let donor_data = donor.store.data.lock().expect("data lock");
        let mut joiner_data = joiner.store.data.lock().expect("data lock");
        for (key, writer) in donor_data.iter() {
            if *writer > request.last_applied {
                joiner_data.insert(key.clone(), *writer);
            }
        }
    }

    joiner
        .replicator
        .sst_received(uuid, seqno)
        .expect("sst_received");
    donor.replicator.sst_sent(uuid, seqno).expect("sst_sent");
    donor
}

/// Adds a member to a running group, serving its state transfer from
/// whichever of `donors` the group picks, and waits until both joiner
/// and donor are synced again.
pub fn add_node(group: &MemGroup, donors: &[&TestNode], receivers: usize) -> TestNode {
    let node = start_node(group, receivers);
    let donor = serve_transfer(donors, &node);
    wait_synced(&node);
    wait_synced(donor);
    node
}
