//! Connection state: one transport pipe per datacenter per class (§3, §4.E).

use std::collections::{HashSet, VecDeque};

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// The six-plus-one connection classes of §3/§6, each with its own
/// admission ceiling and failure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionClass {
    Generic,
    GenericMedia,
    Download,
    Upload,
    Push,
    Temp,
    Proxy,
}

/// Observable connection states surfaced to the delegate (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    WaitingForNetwork,
    Connecting,
    ConnectingViaProxy,
    Connected,
}

/// Result of `Connection::note_message_id` (§4.E).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageIdStatus {
    Unseen,
    AlreadyDelivered,
    SeenNeedsResession,
}

/// Maximum messages tracked for idempotency per connection before FIFO
/// eviction kicks in (§5).
const MAX_PROCESSED_IDS: usize = 10_000;
const EVICTION_BATCH: usize = 1_000;

/// A bounded, FIFO-evicting set of processed message ids, used for the
/// idempotency contract in §4.E/§5 ("late duplicates after session
/// recreation are suppressed").
pub struct BoundedIdSet {
    set: HashSet<i64>,
    order: VecDeque<i64>,
    /// Ids that were seen once already and are now being watched for a
    /// second non-empty-body reoccurrence (status 2 in §4.E).
    flagged: HashSet<i64>,
}

impl BoundedIdSet {
    pub fn new() -> Self {
        Self {
            set: HashSet::with_capacity(MAX_PROCESSED_IDS),
            order: VecDeque::with_capacity(MAX_PROCESSED_IDS),
            flagged: HashSet::new(),
        }
    }

    fn evict_if_full(&mut self) {
        if self.set.len() >= MAX_PROCESSED_IDS {
            for _ in 0..EVICTION_BATCH {
                if let Some(old) = self.order.pop_front() {
                    self.set.remove(&old);
                    self.flagged.remove(&old);
                } else {
                    break;
                }
            }
        }
    }

    /// Returns the idempotency status for `id` and records it as seen.
    pub fn note(&mut self, id: i64, body_nonempty: bool) -> MessageIdStatus {
        if self.flagged.contains(&id) {
            return MessageIdStatus::SeenNeedsResession;
        }
        if self.set.contains(&id) {
            if body_nonempty {
                self.flagged.insert(id);
                return MessageIdStatus::SeenNeedsResession;
            }
            return MessageIdStatus::AlreadyDelivered;
        }
        self.evict_if_full();
        self.set.insert(id);
        self.order.push_back(id);
        MessageIdStatus::Unseen
    }
}

impl Default for BoundedIdSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Maximum bytes batched into one encrypted frame before a second
/// frame is started (§4.E "~3 KiB").
pub const MAX_FRAME_BYTES: usize = 3 * 1024;

pub struct Connection {
    pub class: ConnectionClass,
    pub datacenter_id: i32,
    pub session_id: u64,
    seq_no: i32,
    pub pending_acks: Vec<i64>,
    processed_ids: BoundedIdSet,
    processed_session_unique_ids: HashSet<i64>,
    pub last_activity_secs: i64,
    pub connection_token: u64,
    pub state: ConnectionState,
    /// Highest `invokeAfter` message id previously sent on this
    /// connection, used to chain new `InvokeAfter` requests (§4.G
    /// Phase 4).
    pub last_invoke_after_message_id: i64,
}

impl Connection {
    pub fn new(class: ConnectionClass, datacenter_id: i32) -> Self {
        let mut rng = ChaCha20Rng::from_entropy();
        Self {
            class,
            datacenter_id,
            session_id: rng.next_u64(),
            seq_no: 0,
            pending_acks: Vec::new(),
            processed_ids: BoundedIdSet::new(),
            processed_session_unique_ids: HashSet::new(),
            last_activity_secs: 0,
            connection_token: 0,
            state: ConnectionState::WaitingForNetwork,
            last_invoke_after_message_id: 0,
        }
    }

    /// Content messages increment the session sequence counter by 2;
    /// odd seqnos are reserved for acks/pings (§4.E).
    pub fn next_seq_no(&mut self, is_content_related: bool) -> i32 {
        let result = if is_content_related {
            let s = self.seq_no;
            self.seq_no += 2;
            s
        } else {
            self.seq_no | 1
        };
        result
    }

    pub fn note_message_id(&mut self, id: i64, body_nonempty: bool) -> MessageIdStatus {
        self.processed_ids.note(id, body_nonempty)
    }

    /// `new_session_created` notifications for the same `unique_id`
    /// are idempotent — first occurrence acts, later ones are no-ops
    /// (§4.G response table, §8 scenario 6).
    pub fn note_session_unique_id(&mut self, unique_id: i64) -> bool {
        self.processed_session_unique_ids.insert(unique_id)
    }

    pub fn recreate_session(&mut self) {
        let mut rng = ChaCha20Rng::from_entropy();
        self.session_id = rng.next_u64();
        self.seq_no = 0;
        self.processed_session_unique_ids.clear();
        self.connection_token += 1;
    }

    pub fn bump_connection_token(&mut self) {
        self.connection_token += 1;
    }

    pub fn queue_ack(&mut self, message_id: i64) {
        self.pending_acks.push(message_id);
    }

    pub fn take_pending_acks(&mut self) -> Vec<i64> {
        std::mem::take(&mut self.pending_acks)
    }

    /// Tears down and marks this connection for reconnection once
    /// `now_secs` exceeds its class-specific inactivity ceiling (§4.B
    /// event loop step 7). A connection that has never seen activity
    /// (`last_activity_secs == 0`, i.e. not yet connected) never times
    /// out here — it has nothing to time out from.
    pub fn check_timeout(&mut self, now_secs: i64) -> bool {
        if self.last_activity_secs == 0 {
            return false;
        }
        if now_secs - self.last_activity_secs < disconnect_delay_secs(self.class) {
            return false;
        }
        self.bump_connection_token();
        self.state = ConnectionState::WaitingForNetwork;
        self.last_activity_secs = 0;
        true
    }
}

/// Per-class inactivity ceiling before `check_timeout` tears the
/// connection down; generic mirrors the generic ping's disconnect
/// delay, push mirrors the push ping's, and the remaining classes use
/// the same 35 s ceiling absent a class-specific ping to anchor to.
fn disconnect_delay_secs(class: ConnectionClass) -> i64 {
    match class {
        ConnectionClass::Push => 7 * 60,
        ConnectionClass::Download | ConnectionClass::Upload => 40,
        _ => 35,
    }
}
