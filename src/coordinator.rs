//! The coordinator: scheduler pass, response dispatch, migration,
//! ping/sleep (§4.G). This is the glue component — 40% of the system
//! by the budget table in §2.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::clock::MessageIdGenerator;
use crate::connection::{ConnectionClass, MessageIdStatus};
use crate::datacenter::{Datacenter, HandshakeState, KeySlot, ServerSalt, BAD_SALT_VALIDITY_SECS};
use crate::delegate::Delegate;
use crate::error::RpcError;
use crate::gzip;
use crate::request::{CompletionCallback, QuickAckCallback, Request, RequestFlags, RequestRegistry, CURRENT_DATACENTER};
use crate::wire::{self, InnerMessage, RpcResultBody, ServerMessage};

/// A unit of work submitted from outside the coordinator's owning
/// thread — or scheduled by the coordinator itself to continue after an
/// RPC round trip completes (§4.B "external entry points enqueue a task
/// and wakeup; they do not touch shared state directly"). Drained by
/// the event loop every tick.
pub type Task = Box<dyn FnOnce(&mut Coordinator) + Send>;

/// Admission caps (§4.G Phase 3, §8 invariants).
pub const MAX_GENERIC_IN_FLIGHT: usize = 60;
pub const MAX_DOWNLOADS_PER_DC: usize = 6;
pub const MAX_UPLOADS_IN_FLIGHT: usize = 10;

/// `TryDifferentDc` dispatch timeouts (§3).
pub const STANDARD_DC_TIMEOUT_SECS: i64 = 30;
pub const CONFIG_FETCH_DC_TIMEOUT_SECS: i64 = 60;

const GENERIC_PING_INTERVAL_SECS: i64 = 19;
const GENERIC_PING_DISCONNECT_DELAY_SECS: i32 = 35;
const PUSH_PING_INTERVAL_SECS: i64 = 3 * 60;
const PUSH_PING_DISCONNECT_DELAY_SECS: i32 = 7 * 60;
const PUSH_PING_MISSED_SUSPEND_SECS: i64 = 3 * 60 + 10;
const SESSION_DESTROY_MIN_INTERVAL_SECS: i64 = 2;
const DETAILED_INFO_RESEND_THROTTLE_SECS: i64 = 60;
/// How long the engine must sit idle (no transfers, no pending salt
/// requests) since the last resume before it suspends connections
/// (§4.G Sleep).
const NEXT_SLEEP_TIMEOUT_SECS: i64 = 30;
/// `ping_id` threshold distinguishing a proxy-probe pong from a
/// regular time-sync pong (§4.G Ping, SUPPLEMENTED section).
const PROXY_PING_ID_BASE: i64 = 2_000_000;

/// A single content message ready to be handed to a connection.
pub struct NetworkMessage {
    pub msg_id: i64,
    pub seq_no: i32,
    pub body: Vec<u8>,
    pub request_token: Option<u32>,
    pub invoke_after: bool,
    pub need_quick_ack: bool,
}

/// Frames the scheduler pass wants the transport to send, grouped by
/// datacenter and connection class (§4.G Phase 4).
pub struct DispatchBatch {
    pub datacenter_id: i32,
    pub class: ConnectionClass,
    pub messages: Vec<NetworkMessage>,
}

/// "Consequences" recorded during Phase 1-3 and acted on in Phase 5.
#[derive(Default)]
struct Consequences {
    unknown_dcs: Vec<i32>,
    handshakes_needed: Vec<(i32, KeySlot)>,
    export_auth_needed: Vec<i32>,
}

pub struct PingTracker {
    last_ping_id: i64,
    last_ping_time_secs: i64,
    last_push_ping_time_secs: i64,
    outstanding_ping_id: Option<i64>,
    outstanding_ping_sent_at_monotonic_secs: i64,
    current_ping_time_ms: f64,
    last_proxy_ping_id: i64,
    outstanding_proxy_pings: HashMap<i64, i64>,
}

impl Default for PingTracker {
    fn default() -> Self {
        Self {
            last_ping_id: 0,
            last_ping_time_secs: 0,
            last_push_ping_time_secs: 0,
            outstanding_ping_id: None,
            outstanding_ping_sent_at_monotonic_secs: 0,
            current_ping_time_ms: 0.0,
            last_proxy_ping_id: PROXY_PING_ID_BASE,
            outstanding_proxy_pings: HashMap::new(),
        }
    }
}

pub struct Coordinator {
    datacenters: HashMap<i32, Datacenter>,
    registry: RequestRegistry,
    message_ids: MessageIdGenerator,
    delegate: Arc<dyn Delegate>,

    pub current_datacenter_id: i32,
    pub moving_to_datacenter_id: Option<i32>,
    pub current_user_id: i64,
    pub network_available: bool,
    pub network_paused: bool,

    pings: PingTracker,
    last_destroy_time_secs: i64,
    sessions_to_destroy: Vec<i64>,
    last_detailed_info_resend: HashMap<i64, i64>,
    resend_requests: HashMap<i64, i64>,

    /// Pending auth-export bytes per dc while migrating (§4.G Migration
    /// step 2).
    export_auth_in_flight: Vec<i32>,
    /// Datacenters with an outstanding `getFutureSalts` round trip,
    /// consulted by `can_sleep` (§4.G Sleep "pending salt requests").
    pending_salt_requests: HashSet<i32>,
    last_resume_secs: i64,

    tasks_tx: mpsc::UnboundedSender<Task>,
    tasks_rx: Option<mpsc::UnboundedReceiver<Task>>,
}

impl Coordinator {
    pub fn new(delegate: Arc<dyn Delegate>, message_ids: MessageIdGenerator, current_dc: i32) -> Self {
        let (tasks_tx, tasks_rx) = mpsc::unbounded_channel();
        Self {
            datacenters: HashMap::new(),
            registry: RequestRegistry::new(),
            message_ids,
            delegate,
            current_datacenter_id: current_dc,
            moving_to_datacenter_id: None,
            current_user_id: 0,
            network_available: true,
            network_paused: false,
            pings: PingTracker::default(),
            last_destroy_time_secs: 0,
            sessions_to_destroy: Vec::new(),
            last_detailed_info_resend: HashMap::new(),
            resend_requests: HashMap::new(),
            export_auth_in_flight: Vec::new(),
            pending_salt_requests: HashSet::new(),
            last_resume_secs: 0,
            tasks_tx,
            tasks_rx: Some(tasks_rx),
        }
    }

    /// A handle external callers (or the coordinator's own completion
    /// callbacks) use to schedule work on the owning thread without
    /// touching coordinator state directly (§4.B, §5).
    pub fn task_sender(&self) -> mpsc::UnboundedSender<Task> {
        self.tasks_tx.clone()
    }

    /// Hands the receiving half of the task channel to whatever owns
    /// this coordinator's tick loop. Callable once per coordinator —
    /// the event loop takes it at construction time.
    pub fn take_task_receiver(&mut self) -> mpsc::UnboundedReceiver<Task> {
        self.tasks_rx.take().expect("task receiver already taken")
    }

    pub fn add_datacenter(&mut self, dc: Datacenter) {
        self.datacenters.insert(dc.id, dc);
    }

    pub fn datacenter_mut(&mut self, id: i32) -> Option<&mut Datacenter> {
        self.datacenters.get_mut(&id)
    }

    fn resolve_dc(&self, request_dc: i32) -> i32 {
        if request_dc == CURRENT_DATACENTER {
            self.current_datacenter_id
        } else {
            request_dc
        }
    }

    // ---- Public API (§6) ----------------------------------------------

    pub fn send_request(
        &mut self,
        payload: Vec<u8>,
        flags: RequestFlags,
        datacenter_id: i32,
        class: ConnectionClass,
        on_complete: CompletionCallback,
    ) -> u32 {
        let token = self.registry.next_token();
        let request = Request::new(token, payload, datacenter_id, class, flags, on_complete);
        self.registry.enqueue(request);
        token
    }

    pub fn cancel_request(&mut self, token: u32, notify_server: bool) -> Option<NetworkMessage> {
        let info = self.registry.cancel(token, notify_server)?;
        let (msg_id, _class) = info;
        // `rpc_drop_answer` is fire-and-forget; the caller is expected
        // to route it to the same dc's generic connection (§4.F, §8
        // scenario 4).
        Some(NetworkMessage {
            msg_id: self.message_ids.generate(),
            seq_no: 0,
            body: msg_id.to_le_bytes().to_vec(),
            request_token: None,
            invoke_after: false,
            need_quick_ack: false,
        })
    }

    pub fn bind_request_to_guid(&mut self, token: u32, guid: u32) {
        self.registry.bind_to_guid(token, guid);
    }

    pub fn cancel_requests_for_guid(&mut self, guid: u32) {
        for token in self.registry.tokens_for_guid(guid) {
            self.registry.cancel(token, false);
        }
    }

    pub fn set_user_id(&mut self, user_id: i64) {
        self.current_user_id = user_id;
    }

    // ---- Scheduler pass (§4.G) -----------------------------------------

    /// Run one full scheduler pass. `now_secs`/`now_millis_monotonic`
    /// come from the event loop tick (§4.B step 8).
    pub fn scheduler_pass(&mut self, now_secs: i64, now_millis_monotonic: i64) -> Vec<DispatchBatch> {
        let mut consequences = Consequences::default();
        let mut generic_batch: HashMap<i32, Vec<NetworkMessage>> = HashMap::new();
        let mut generic_media_batch: HashMap<i32, Vec<NetworkMessage>> = HashMap::new();
        let mut temp_batch: HashMap<i32, Vec<NetworkMessage>> = HashMap::new();
        let mut immediate_batches: Vec<DispatchBatch> = Vec::new();

        self.phase1_running_requests(now_secs, now_millis_monotonic, &mut consequences, &mut generic_batch, &mut generic_media_batch, &mut temp_batch, &mut immediate_batches);
        self.phase2_session_destroy(now_secs, &mut generic_batch);
        self.phase3_queued_requests(now_secs, &mut consequences, &mut generic_batch, &mut generic_media_batch, &mut temp_batch, &mut immediate_batches);

        let mut batches = self.phase4_dispatch(generic_batch, generic_media_batch, temp_batch);
        batches.append(&mut immediate_batches);

        self.phase5_consequences(consequences);
        batches
    }

    /// Per-dc download counts plus two global counts (generic, upload).
    /// Uploads are capped globally, not per dc — mirroring the
    /// original's single `uploadRunningRequestCount` (§4.G Phase 1/3,
    /// §8 invariants), unlike downloads which are capped per dc.
    fn admitted_counts(&self) -> (HashMap<i32, usize>, usize, usize) {
        let mut downloads_per_dc: HashMap<i32, usize> = HashMap::new();
        let mut generic_count = 0usize;
        let mut uploads_count = 0usize;
        for r in &self.registry.running {
            match r.connection_class {
                ConnectionClass::Download => *downloads_per_dc.entry(r.datacenter_id).or_insert(0) += 1,
                ConnectionClass::Upload => uploads_count += 1,
                ConnectionClass::Generic if !r.flags.contains(RequestFlags::USE_UNBOUND_KEY) => {
                    generic_count += 1;
                }
                _ => {}
            }
        }
        (downloads_per_dc, generic_count, uploads_count)
    }

    #[allow(clippy::too_many_arguments)]
    fn phase1_running_requests(
        &mut self,
        now_secs: i64,
        now_millis: i64,
        consequences: &mut Consequences,
        generic_batch: &mut HashMap<i32, Vec<NetworkMessage>>,
        generic_media_batch: &mut HashMap<i32, Vec<NetworkMessage>>,
        temp_batch: &mut HashMap<i32, Vec<NetworkMessage>>,
        immediate: &mut Vec<DispatchBatch>,
    ) {
        let tokens: Vec<u32> = self.registry.running.iter().map(|r| r.token).collect();
        for token in tokens {
            let Some(idx) = self.registry.running.iter().position(|r| r.token == token) else { continue };
            if self.registry.running[idx].cancelled || self.registry.running[idx].completed {
                continue;
            }

            // Resolve placeholder dc when no migration is in progress.
            if self.registry.running[idx].datacenter_id == CURRENT_DATACENTER && self.moving_to_datacenter_id.is_none() {
                self.registry.running[idx].datacenter_id = self.current_datacenter_id;
            }
            let dc_id = self.registry.running[idx].datacenter_id;

            if !self.datacenters.contains_key(&dc_id) {
                consequences.unknown_dcs.push(dc_id);
                continue;
            }

            let flags = self.registry.running[idx].flags;
            let class = self.registry.running[idx].connection_class;

            if flags.contains(RequestFlags::TRY_DIFFERENT_DC) {
                let timeout = if flags.contains(RequestFlags::WITHOUT_LOGIN) { CONFIG_FETCH_DC_TIMEOUT_SECS } else { STANDARD_DC_TIMEOUT_SECS };
                if now_secs - self.registry.running[idx].start_time_secs >= timeout && self.registry.running[idx].start_time_secs != 0 {
                    self.registry.demote_to_queue(token);
                    continue;
                }
            }

            let slot = media_slot_for_class(class);
            let has_key = {
                let dc = self.datacenters.get(&dc_id).unwrap();
                dc.has_auth_key(class, flags.contains(RequestFlags::USE_UNBOUND_KEY))
            };
            if !has_key {
                consequences.handshakes_needed.push((dc_id, slot));
                continue;
            }

            let request_failed_by_flood_wait = self.registry.running[idx].failed_by_flood_wait;
            let min_start_time = self.registry.running[idx].min_start_time;
            let start_time = self.registry.running[idx].start_time_secs;

            let age_exceeded = start_time != 0 && (now_secs - start_time).abs() > CONFIG_FETCH_DC_TIMEOUT_SECS;
            let may_retry = start_time == 0
                || (age_exceeded
                    && (now_secs >= min_start_time
                        || (request_failed_by_flood_wait != 0 && (min_start_time - now_secs) > request_failed_by_flood_wait as i64)
                        || (request_failed_by_flood_wait == 0 && (now_secs - min_start_time).abs() >= 60)));

            if !may_retry {
                continue;
            }

            self.registry.running[idx].retry_count += 1;

            if !self.registry.running[idx].failed_by_salt {
                if class == ConnectionClass::Download || class == ConnectionClass::Upload {
                    let limit = if class == ConnectionClass::Download {
                        self.registry.running[idx].download_retry_limit()
                    } else {
                        self.registry.running[idx].upload_retry_limit()
                    };
                    if self.registry.running[idx].retry_count >= limit {
                        let mut finished = self.registry.running.remove(idx);
                        finished.complete(Err(RpcError::retry_limit()));
                        continue;
                    }
                }
            } else {
                self.registry.running[idx].failed_by_salt = false;
            }

            if self.registry.running[idx].message_seq_no == 0 {
                let seq = {
                    let dc = self.datacenters.get_mut(&dc_id).unwrap();
                    let conn = dc.get_connection(class, true).unwrap();
                    conn.next_seq_no(true)
                };
                self.registry.running[idx].message_seq_no = seq;
                self.registry.running[idx].message_id = self.message_ids.generate();
            }
            self.registry.running[idx].start_time_secs = now_secs;
            self.registry.running[idx].start_time_millis = now_millis;

            let msg = NetworkMessage {
                msg_id: self.registry.running[idx].message_id,
                seq_no: self.registry.running[idx].message_seq_no,
                body: self.registry.running[idx].wrapped_payload.clone(),
                request_token: Some(token),
                invoke_after: flags.contains(RequestFlags::INVOKE_AFTER),
                need_quick_ack: flags.contains(RequestFlags::NEED_QUICK_ACK),
            };
            if msg.need_quick_ack {
                self.registry.register_quick_ack(quick_ack_key(msg.msg_id), vec![token]);
            }

            match class {
                ConnectionClass::Generic => generic_batch.entry(dc_id).or_default().push(msg),
                ConnectionClass::GenericMedia => generic_media_batch.entry(dc_id).or_default().push(msg),
                ConnectionClass::Temp => temp_batch.entry(dc_id).or_default().push(msg),
                other => immediate.push(DispatchBatch { datacenter_id: dc_id, class: other, messages: vec![msg] }),
            }
        }
    }

    fn phase2_session_destroy(&mut self, now_secs: i64, generic_batch: &mut HashMap<i32, Vec<NetworkMessage>>) {
        if self.sessions_to_destroy.is_empty() {
            return;
        }
        if now_secs - self.last_destroy_time_secs < SESSION_DESTROY_MIN_INTERVAL_SECS {
            return;
        }
        let dc_id = self.current_datacenter_id;
        let alive = self
            .datacenters
            .get_mut(&dc_id)
            .map(|dc| dc.has_connection(ConnectionClass::Generic))
            .unwrap_or(false);
        if !alive {
            return;
        }
        if let Some(session_id) = self.sessions_to_destroy.pop() {
            self.last_destroy_time_secs = now_secs;
            let msg = NetworkMessage {
                msg_id: self.message_ids.generate(),
                seq_no: 0,
                body: session_id.to_le_bytes().to_vec(),
                request_token: None,
                invoke_after: false,
                need_quick_ack: false,
            };
            generic_batch.entry(dc_id).or_default().push(msg);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn phase3_queued_requests(
        &mut self,
        now_secs: i64,
        consequences: &mut Consequences,
        generic_batch: &mut HashMap<i32, Vec<NetworkMessage>>,
        generic_media_batch: &mut HashMap<i32, Vec<NetworkMessage>>,
        temp_batch: &mut HashMap<i32, Vec<NetworkMessage>>,
        immediate: &mut Vec<DispatchBatch>,
    ) {
        let (mut downloads_per_dc, mut generic_count, mut uploads_count) = self.admitted_counts();

        let mut remaining = Vec::new();
        for mut request in std::mem::take(&mut self.registry.queue) {
            if request.cancelled {
                continue;
            }

            if request.flags.contains(RequestFlags::TRY_DIFFERENT_DC) {
                let tripped = request.min_start_time != 0 && now_secs >= request.min_start_time;
                if tripped {
                    let candidates: Vec<i32> = self.datacenters.values().filter(|d| !d.is_cdn).map(|d| d.id).collect();
                    if !candidates.is_empty() {
                        use rand::seq::SliceRandom;
                        let mut rng = rand::thread_rng();
                        if let Some(&picked) = candidates.choose(&mut rng) {
                            if request.flags.contains(RequestFlags::WITHOUT_LOGIN) {
                                request.datacenter_id = picked;
                            } else {
                                self.current_datacenter_id = picked;
                                request.datacenter_id = picked;
                            }
                        }
                    }
                }
            }

            let dc_id = self.resolve_dc(request.datacenter_id);
            if !self.datacenters.contains_key(&dc_id) {
                consequences.unknown_dcs.push(dc_id);
                remaining.push(request);
                continue;
            }

            // Admission caps (§4.G Phase 3, §8 invariants).
            let admitted = match request.connection_class {
                ConnectionClass::Generic if !request.flags.contains(RequestFlags::USE_UNBOUND_KEY) => generic_count < MAX_GENERIC_IN_FLIGHT,
                ConnectionClass::Download => *downloads_per_dc.get(&dc_id).unwrap_or(&0) < MAX_DOWNLOADS_PER_DC,
                ConnectionClass::Upload => uploads_count < MAX_UPLOADS_IN_FLIGHT,
                _ => true,
            };
            if !admitted {
                remaining.push(request);
                continue;
            }

            if request.flags.contains(RequestFlags::CAN_COMPRESS) {
                if let Some(compressed) = gzip::try_compress(&request.wrapped_payload) {
                    request.wrapped_payload = compressed;
                }
                request.flags.remove(RequestFlags::CAN_COMPRESS);
            }

            let class = request.connection_class;
            let seq = {
                let dc = self.datacenters.get_mut(&dc_id).unwrap();
                let conn = dc.get_connection(class, true).unwrap();
                conn.next_seq_no(true)
            };
            request.message_seq_no = seq;
            request.message_id = self.message_ids.generate();
            request.start_time_secs = now_secs;
            request.datacenter_id = dc_id;

            match class {
                ConnectionClass::Generic if !request.flags.contains(RequestFlags::USE_UNBOUND_KEY) => generic_count += 1,
                ConnectionClass::Download => *downloads_per_dc.entry(dc_id).or_insert(0) += 1,
                ConnectionClass::Upload => uploads_count += 1,
                _ => {}
            }

            let msg = NetworkMessage {
                msg_id: request.message_id,
                seq_no: request.message_seq_no,
                body: request.wrapped_payload.clone(),
                request_token: Some(request.token),
                invoke_after: request.flags.contains(RequestFlags::INVOKE_AFTER),
                need_quick_ack: request.flags.contains(RequestFlags::NEED_QUICK_ACK),
            };
            if msg.need_quick_ack {
                self.registry.register_quick_ack(quick_ack_key(msg.msg_id), vec![request.token]);
            }

            match class {
                ConnectionClass::Generic => generic_batch.entry(dc_id).or_default().push(msg),
                ConnectionClass::GenericMedia => generic_media_batch.entry(dc_id).or_default().push(msg),
                ConnectionClass::Temp => temp_batch.entry(dc_id).or_default().push(msg),
                other => immediate.push(DispatchBatch { datacenter_id: dc_id, class: other, messages: vec![msg] }),
            }

            self.registry.promote_to_running(request);
        }
        self.registry.queue = remaining;
    }

    fn phase4_dispatch(
        &mut self,
        generic_batch: HashMap<i32, Vec<NetworkMessage>>,
        generic_media_batch: HashMap<i32, Vec<NetworkMessage>>,
        temp_batch: HashMap<i32, Vec<NetworkMessage>>,
    ) -> Vec<DispatchBatch> {
        let mut out = Vec::new();
        for (class, per_dc) in [
            (ConnectionClass::Generic, generic_batch),
            (ConnectionClass::GenericMedia, generic_media_batch),
            (ConnectionClass::Temp, temp_batch),
        ] {
            for (dc_id, mut messages) in per_dc {
                if messages.is_empty() {
                    continue;
                }
                if let Some(dc) = self.datacenters.get_mut(&dc_id) {
                    if let Some(conn) = dc.get_connection(class, true) {
                        let acks = conn.take_pending_acks();
                        if !acks.is_empty() {
                            messages.push(NetworkMessage {
                                msg_id: self.message_ids.generate(),
                                seq_no: conn.next_seq_no(false),
                                body: Vec::new(),
                                request_token: None,
                                invoke_after: false,
                                need_quick_ack: false,
                            });
                        }
                        if messages.iter().any(|m| m.invoke_after) {
                            let highest = conn.last_invoke_after_message_id;
                            if highest != 0 {
                                for m in messages.iter_mut().filter(|m| m.invoke_after) {
                                    // The wrapper is a transport-level
                                    // concern; record the chain target
                                    // alongside the body so the codec
                                    // can wrap it (§4.G Phase 4).
                                    m.body.extend_from_slice(&highest.to_le_bytes());
                                }
                            }
                            if let Some(last) = messages.iter().filter(|m| m.invoke_after).map(|m| m.msg_id).max() {
                                conn.last_invoke_after_message_id = last;
                            }
                        }
                    }
                }
                out.push(DispatchBatch { datacenter_id: dc_id, class, messages });
            }
        }
        out
    }

    fn phase5_consequences(&mut self, consequences: Consequences) {
        for dc_id in consequences.unknown_dcs {
            debug!(dc_id, "unknown datacenter; scheduling discovery");
            self.delegate.on_request_new_server_ip_and_port(1);
        }
        for (dc_id, slot) in consequences.handshakes_needed {
            if let Some(dc) = self.datacenters.get_mut(&dc_id) {
                if dc.handshake_state(slot) == HandshakeState::None {
                    let _ = dc.begin_handshake(slot);
                    info!(dc_id, ?slot, "beginning handshake");
                }
            }
        }
        if self.current_user_id != 0 {
            let moving = self.moving_to_datacenter_id;
            let current = self.current_datacenter_id;
            let unauthorized: Vec<i32> = self
                .datacenters
                .values()
                .filter(|d| !d.authorized_for_user && d.id != current && Some(d.id) != moving && !d.is_cdn)
                .map(|d| d.id)
                .collect();
            for dc_id in unauthorized {
                if !self.export_auth_in_flight.contains(&dc_id) {
                    self.export_auth_in_flight.push(dc_id);
                    info!(dc_id, "exporting authorization to unauthorized datacenter");
                }
            }
        }
    }

    // ---- Migration (§4.G Migration) ------------------------------------

    /// Step 1 of §4.G Migration: record the moving-to dc, demote
    /// in-flight requests back to the queue, and — if a user is set —
    /// kick off the export/import round trip that actually switches
    /// `current_datacenter_id` once it completes.
    pub fn move_to_datacenter(&mut self, target: i32) {
        self.moving_to_datacenter_id = Some(target);
        for token in self.registry.running.iter().map(|r| r.token).collect::<Vec<_>>() {
            self.registry.demote_to_queue(token);
        }
        info!(target, "moving to datacenter");

        if self.current_user_id == 0 {
            // No user to re-authorize on the target dc; the bookkeeping
            // switch alone is sufficient.
            self.finish_migration(target);
            return;
        }

        let current = self.current_datacenter_id;
        let tasks_tx = self.tasks_tx.clone();
        self.send_request(
            b"auth.exportAuthorization".to_vec(),
            RequestFlags::empty(),
            current,
            ConnectionClass::Generic,
            Box::new(move |result| {
                if let Ok(exported_bytes) = result {
                    let _ = tasks_tx.send(Box::new(move |c: &mut Coordinator| {
                        c.authorize_on_moving_datacenter(target, exported_bytes);
                    }));
                }
                // On export failure the engine just stays in the moving
                // state; the next 303 (or an explicit retry) drives
                // another attempt (§4.G Migration step 2 "on failure,
                // retry from step 1").
            }),
        );
    }

    /// Step 3 of §4.G Migration: clear the target's salts if it has no
    /// permanent key yet, then submit `auth.importAuthorization` on the
    /// target dc. `finish_migration` only runs once that import
    /// completes (step 4), never synchronously with the move.
    pub fn authorize_on_moving_datacenter(&mut self, target: i32, exported_bytes: Vec<u8>) {
        if let Some(dc) = self.datacenters.get_mut(&target) {
            if dc.permanent_auth_key_id.is_none() {
                dc.clear_server_salts();
            }
        }

        let tasks_tx = self.tasks_tx.clone();
        self.send_request(
            exported_bytes,
            RequestFlags::WITHOUT_LOGIN,
            target,
            ConnectionClass::Generic,
            Box::new(move |result| {
                if result.is_ok() {
                    let _ = tasks_tx.send(Box::new(move |c: &mut Coordinator| {
                        c.finish_migration(target);
                    }));
                }
            }),
        );
    }

    pub fn finish_migration(&mut self, target: i32) {
        self.current_datacenter_id = target;
        self.moving_to_datacenter_id = None;
        info!(target, "migration complete");
    }

    // ---- Response dispatch (§4.G Response Dispatch) --------------------

    pub fn handle_server_message(&mut self, dc_id: i32, class: ConnectionClass, msg_id: i64, message: ServerMessage) {
        match message {
            ServerMessage::NewSessionCreated { unique_id, first_msg_id, server_salt } => {
                let is_new = self
                    .datacenters
                    .get_mut(&dc_id)
                    .and_then(|dc| dc.get_connection(class, false))
                    .map(|conn| conn.note_session_unique_id(unique_id))
                    .unwrap_or(false);
                if !is_new {
                    return;
                }
                if let Some(dc) = self.datacenters.get_mut(&dc_id) {
                    dc.add_server_salt(ServerSalt { salt: server_salt, valid_since: 0, valid_until: i64::MAX });
                }
                for r in self.registry.running.iter_mut() {
                    if r.datacenter_id == dc_id && r.connection_class == class && r.message_id != 0 && r.message_id < first_msg_id {
                        r.message_id = 0;
                        r.message_seq_no = 0;
                        r.start_time_secs = 0;
                    }
                }
                if class == ConnectionClass::Push {
                    self.delegate.on_internal_push_received();
                }
                if class == ConnectionClass::Generic {
                    self.delegate.on_session_created();
                }
            }
            ServerMessage::MsgContainer(inner) => {
                for m in inner {
                    self.handle_inner_message(dc_id, class, m);
                }
            }
            ServerMessage::Pong { msg_id: ping_msg_id, ping_id } => self.handle_pong(dc_id, ping_msg_id, ping_id),
            ServerMessage::FutureSalts { salts, .. } => {
                if let Some(dc) = self.datacenters.get_mut(&dc_id) {
                    dc.merge_server_salts(salts.into_iter().map(|(salt, since, until)| ServerSalt { salt, valid_since: since, valid_until: until }).collect());
                }
                self.pending_salt_requests.remove(&dc_id);
            }
            ServerMessage::DestroySessionRes { session_id } => {
                debug!(session_id, "destroy_session_res");
            }
            ServerMessage::RpcResult { req_msg_id, body } => self.handle_rpc_result(dc_id, class, req_msg_id, body),
            ServerMessage::MsgsAck { .. } => {}
            ServerMessage::BadMsgNotification { bad_msg_id, error_code, .. } => {
                self.handle_bad_msg(dc_id, class, bad_msg_id, error_code);
            }
            ServerMessage::BadServerSalt { bad_msg_id, new_server_salt, .. } => {
                let now = self.message_ids.monotonic_secs();
                if let Some(dc) = self.datacenters.get_mut(&dc_id) {
                    dc.add_server_salt(ServerSalt {
                        salt: new_server_salt,
                        valid_since: now,
                        valid_until: now + BAD_SALT_VALIDITY_SECS,
                    });
                }
                for r in self.registry.running.iter_mut() {
                    if r.message_id == bad_msg_id || (r.datacenter_id == dc_id && r.connection_class == ConnectionClass::Download) {
                        r.failed_by_salt = true;
                        r.start_time_secs = 0;
                    }
                }
                self.request_future_salts(dc_id);
            }
            ServerMessage::MsgsStateInfo { req_msg_id, .. } => {
                if let Some(&orig) = self.resend_requests.get(&req_msg_id) {
                    for r in self.registry.running.iter_mut() {
                        if r.message_id == orig {
                            r.start_time_secs = 0;
                        }
                    }
                }
            }
            ServerMessage::MsgDetailedInfo { msg_id: orig_msg_id, .. } | ServerMessage::MsgNewDetailedInfo { answer_msg_id: orig_msg_id } => {
                let now = self.message_ids.monotonic_secs();
                let last = self.last_detailed_info_resend.get(&orig_msg_id).copied().unwrap_or(0);
                if now - last >= DETAILED_INFO_RESEND_THROTTLE_SECS {
                    self.last_detailed_info_resend.insert(orig_msg_id, now);
                }
            }
            ServerMessage::GzipPacked(bytes) => {
                if let Ok(inflated) = gzip::inflate(&bytes) {
                    self.delegate.on_unparsed_message_received(inflated);
                }
            }
            ServerMessage::UpdatesTooLong => {
                if class == ConnectionClass::Push {
                    self.delegate.on_update(Vec::new());
                } else {
                    self.delegate.on_unparsed_message_received(Vec::new());
                }
            }
            ServerMessage::Unparsed(bytes) => self.delegate.on_unparsed_message_received(bytes),
        }
        let _ = msg_id;
    }

    fn handle_inner_message(&mut self, dc_id: i32, class: ConnectionClass, inner: InnerMessage) {
        let status = self
            .datacenters
            .get_mut(&dc_id)
            .and_then(|dc| dc.get_connection(class, false))
            .map(|conn| conn.note_message_id(inner.msg_id, !matches!(inner.body, ServerMessage::MsgsAck { .. })))
            .unwrap_or(MessageIdStatus::Unseen);

        match status {
            MessageIdStatus::AlreadyDelivered => return,
            MessageIdStatus::SeenNeedsResession => {
                if let Some(dc) = self.datacenters.get_mut(&dc_id) {
                    if let Some(conn) = dc.get_connection(class, false) {
                        conn.recreate_session();
                    }
                }
                return;
            }
            MessageIdStatus::Unseen => {}
        }
        self.handle_server_message(dc_id, class, inner.msg_id, inner.body);
    }

    fn handle_bad_msg(&mut self, dc_id: i32, class: ConnectionClass, bad_msg_id: i32, error_code: i32) {
        if wire::TIME_SKEW_BAD_MSG_CODES.contains(&error_code) {
            if let Some(dc) = self.datacenters.get_mut(&dc_id) {
                dc.reset_on_bad_message(media_slot_for_class(class));
                dc.recreate_sessions(&[ConnectionClass::Generic, ConnectionClass::GenericMedia, ConnectionClass::Download, ConnectionClass::Upload, ConnectionClass::Temp]);
            }
            for r in self.registry.running.iter_mut().filter(|r| r.datacenter_id == dc_id) {
                r.message_id = 0;
                r.message_seq_no = 0;
                r.start_time_secs = 0;
            }
        } else if error_code == 20 {
            for r in self.registry.running.iter_mut() {
                if r.message_id == bad_msg_id as i64 {
                    r.start_time_secs = 0;
                }
            }
        }
    }

    fn handle_rpc_result(&mut self, dc_id: i32, class: ConnectionClass, req_msg_id: i64, body: RpcResultBody) {
        let body = match body {
            RpcResultBody::GzipPacked(bytes) => match gzip::inflate(&bytes) {
                Ok(inflated) => RpcResultBody::Ok(inflated),
                Err(_) => RpcResultBody::Error { code: -1000, message: String::new() },
            },
            other => other,
        };

        let Some(idx) = self.registry.running.iter().position(|r| r.message_id == req_msg_id) else { return };

        if self.registry.running[idx].cancelled {
            // The caller already gave up and a drop_answer went out;
            // a late response must not reach the callback (§5
            // "Cancellation").
            self.registry.running.remove(idx);
            return;
        }

        match body {
            RpcResultBody::Error { code, message } => {
                if code == 303 {
                    if let Some(target) = wire::parse_migrate_dc(&message) {
                        self.move_to_datacenter(target);
                        return;
                    }
                }

                let mut discard = false;
                let flags = self.registry.running[idx].flags;

                if code == 401 && wire::is_auth_key_perm_empty(&message) {
                    discard = true;
                    self.registry.running[idx].min_start_time = self.message_ids.monotonic_secs() + 1;
                    self.registry.running[idx].start_time_secs = 0;
                    let slot = media_slot_for_class(class);
                    if let Some(dc) = self.datacenters.get_mut(&dc_id) {
                        if dc.handshake_state(slot) != HandshakeState::Handshaking {
                            dc.clear_ephemeral_key(slot);
                            let _ = dc.begin_handshake(slot);
                        }
                    }
                } else if !flags.contains(RequestFlags::FAIL_ON_SERVER_ERRORS) || wire::is_auth_restart(&message) {
                    if code == 500 || code < 0 {
                        discard = true;
                        if wire::is_worker_busy(&message) {
                            self.registry.running[idx].min_start_time = 0;
                        } else {
                            let failures = self.registry.running[idx].server_failure_count;
                            self.registry.running[idx].min_start_time = self.registry.running[idx].start_time_secs + failures.min(10) as i64;
                            self.registry.running[idx].server_failure_count += 1;
                        }
                    } else if code == 420 {
                        let wait = wire::parse_flood_wait_secs(&message);
                        discard = true;
                        self.registry.running[idx].failed_by_flood_wait = wait;
                        self.registry.running[idx].start_time_secs = 0;
                        self.registry.running[idx].start_time_millis = 0;
                        self.registry.running[idx].min_start_time = self.message_ids.monotonic_secs() + wait as i64;
                    } else if code == 400 && wire::is_msg_wait_failed(&message) {
                        discard = true;
                        self.registry.running[idx].min_start_time = self.message_ids.monotonic_secs() + 1;
                        self.registry.running[idx].start_time_secs = 0;
                        self.registry.running[idx].start_time_millis = 0;
                    }
                }

                if !discard {
                    if code == 401 {
                        if wire::is_session_password_needed(&message) {
                            // ignore — caller still needs 2FA; not an
                            // authentication failure for this engine.
                        } else if dc_id == self.current_datacenter_id || Some(dc_id) == self.moving_to_datacenter_id {
                            if (class == ConnectionClass::Generic) && self.current_user_id != 0 {
                                self.current_user_id = 0;
                                self.delegate.on_logout();
                            }
                        } else {
                            if let Some(dc) = self.datacenters.get_mut(&dc_id) {
                                dc.authorized_for_user = false;
                            }
                        }
                    } else if self.current_user_id == 0 && code == 406 && wire::is_auth_key_duplicated(&message) {
                        for dc in self.datacenters.values_mut() {
                            dc.permanent_auth_key_id = None;
                            dc.clear_server_salts();
                        }
                    }
                    let mut finished = self.registry.running.remove(idx);
                    finished.complete(Err(RpcError::new(code, message)));
                }
            }
            RpcResultBody::Ok(bytes) => {
                let request = &mut self.registry.running[idx];
                if request.is_init_request || request.is_init_media_request {
                    if let Some(dc) = self.datacenters.get_mut(&dc_id) {
                        let media = class != ConnectionClass::Generic;
                        dc.last_init_version.insert(media, 1);
                    }
                }
                let mut finished = self.registry.running.remove(idx);
                finished.complete(Ok(bytes));
            }
            RpcResultBody::GzipPacked(_) => unreachable!("handled above"),
        }
    }

    fn handle_pong(&mut self, _dc_id: i32, _ping_msg_id: i64, ping_id: i64) {
        if ping_id >= PROXY_PING_ID_BASE {
            if let Some(sent_at) = self.pings.outstanding_proxy_pings.remove(&ping_id) {
                let rtt = self.message_ids.monotonic_secs() - sent_at;
                debug!(ping_id, rtt, "proxy probe rtt");
            }
            return;
        }
        if self.pings.outstanding_ping_id != Some(ping_id) {
            return;
        }
        self.pings.outstanding_ping_id = None;
        let now_ms = self.message_ids.monotonic_millis();
        let delta_ms = (now_ms - self.pings.outstanding_ping_sent_at_monotonic_secs * 1000) as f64;
        if delta_ms < 10_000.0 {
            if self.pings.current_ping_time_ms == 0.0 {
                self.pings.current_ping_time_ms = delta_ms;
            } else {
                self.pings.current_ping_time_ms = self.pings.current_ping_time_ms * 0.7 + delta_ms * 0.3;
            }
        }
        // Anchor the time offset from the pong's message id (§4.G
        // Ping, §8 scenario 5): the server's message id encodes its
        // own wall-clock, accurate to within the generator's formula.
        let server_time_secs = (_ping_msg_id as f64) / 4294967296.0;
        let local_time_secs = (self.message_ids.monotonic_millis() as f64) / 1000.0;
        let new_offset = server_time_secs - local_time_secs;
        self.message_ids.set_time_offset(new_offset);
    }

    // ---- Ping & sleep (§4.G Ping & Sleep) -------------------------------

    pub fn maybe_send_generic_ping(&mut self, now_secs: i64) -> Option<(i32, NetworkMessage)> {
        if now_secs - self.pings.last_ping_time_secs < GENERIC_PING_INTERVAL_SECS {
            return None;
        }
        self.pings.last_ping_time_secs = now_secs;
        self.pings.last_ping_id += 1;
        let ping_id = self.pings.last_ping_id;
        self.pings.outstanding_ping_id = Some(ping_id);
        self.pings.outstanding_ping_sent_at_monotonic_secs = now_secs;
        let _ = GENERIC_PING_DISCONNECT_DELAY_SECS;
        let dc_id = self.current_datacenter_id;
        let msg_id = self.message_ids.generate();
        let seq = self
            .datacenters
            .get_mut(&dc_id)
            .and_then(|dc| dc.get_connection(ConnectionClass::Generic, true))
            .map(|c| c.next_seq_no(false))
            .unwrap_or(0);
        Some((
            dc_id,
            NetworkMessage { msg_id, seq_no: seq, body: ping_id.to_le_bytes().to_vec(), request_token: None, invoke_after: false, need_quick_ack: false },
        ))
    }

    /// Skip the push ping when no user is set (Open Question #1 in
    /// SPEC_FULL.md, resolving the vacuous duplicate condition in the
    /// original's `sendPing`).
    pub fn maybe_send_push_ping(&mut self, now_secs: i64) -> Option<(i32, NetworkMessage)> {
        if self.current_user_id == 0 {
            return None;
        }
        if now_secs - self.pings.last_push_ping_time_secs < PUSH_PING_INTERVAL_SECS {
            return None;
        }
        self.pings.last_push_ping_time_secs = now_secs;
        let _ = PUSH_PING_DISCONNECT_DELAY_SECS;
        let dc_id = self.current_datacenter_id;
        let msg_id = self.message_ids.generate();
        Some((dc_id, NetworkMessage { msg_id, seq_no: 0, body: Vec::new(), request_token: None, invoke_after: false, need_quick_ack: false }))
    }

    pub fn push_ping_is_stale(&self, now_secs: i64) -> bool {
        self.pings.last_push_ping_time_secs != 0 && now_secs - self.pings.last_push_ping_time_secs >= PUSH_PING_MISSED_SUSPEND_SECS
    }

    /// Seconds until the push ping is next due, for the event loop's
    /// wakeup-deadline computation (§4.B step 2 "push-ping deadline").
    /// Returns the full interval when no user is set, since no push
    /// ping will be sent until one is (§4.G Ping).
    pub fn push_ping_deadline_secs(&self, now_secs: i64) -> i64 {
        if self.current_user_id == 0 {
            return PUSH_PING_INTERVAL_SECS;
        }
        (PUSH_PING_INTERVAL_SECS - (now_secs - self.pings.last_push_ping_time_secs)).max(0)
    }

    pub fn check_proxy(&mut self, on_result: CompletionCallback) -> i64 {
        self.pings.last_proxy_ping_id += 1;
        let ping_id = self.pings.last_proxy_ping_id;
        self.pings.outstanding_proxy_pings.insert(ping_id, self.message_ids.monotonic_secs());
        let token = self.send_request(Vec::new(), RequestFlags::WITHOUT_LOGIN, CURRENT_DATACENTER, ConnectionClass::Proxy, on_result);
        let _ = token;
        ping_id
    }

    /// Whether the engine may suspend all datacenter connections
    /// (§4.G Sleep): no in-flight downloads/uploads and no pending
    /// `getFutureSalts` round trips.
    pub fn can_sleep(&self) -> bool {
        let no_transfers = !self.registry.running.iter().any(|r| matches!(r.connection_class, ConnectionClass::Download | ConnectionClass::Upload));
        no_transfers && self.pending_salt_requests.is_empty()
    }

    /// Exits the paused state; any resume call or an `Immediate`
    /// request does this (§4.G Sleep).
    pub fn resume(&mut self, now_secs: i64) {
        self.network_paused = false;
        self.last_resume_secs = now_secs;
    }

    /// Suspends connections once the engine has been idle for
    /// `NEXT_SLEEP_TIMEOUT_SECS` since the last resume and `can_sleep`
    /// holds (§4.G Sleep).
    pub fn maybe_sleep(&mut self, now_secs: i64) {
        if self.network_paused {
            return;
        }
        if now_secs - self.last_resume_secs < NEXT_SLEEP_TIMEOUT_SECS {
            return;
        }
        if self.can_sleep() {
            self.network_paused = true;
        }
    }

    /// Fetches a fresh salt list for `dc_id` if one isn't already in
    /// flight (§4.G response table "bad-server-salt: ... request fresh
    /// salt list"). The completion is a no-op — the actual salts arrive
    /// via the `FutureSalts` server message, which clears the pending
    /// marker this sets.
    fn request_future_salts(&mut self, dc_id: i32) {
        if !self.pending_salt_requests.insert(dc_id) {
            return;
        }
        self.send_request(
            b"messages.getFutureSalts".to_vec(),
            RequestFlags::empty(),
            dc_id,
            ConnectionClass::Generic,
            Box::new(|_| {}),
        );
    }

    /// Entry point for an early quick-ack signal from the transport
    /// (§3 `NeedQuickAck`, §4.F quick-ack index): the real ack key is
    /// derived from the outgoing frame's ciphertext by the out-of-scope
    /// transport layer; this crate only needs it to look up which
    /// tokens requested the ack (`quick_ack_key` is how dispatch
    /// registers that lookup).
    pub fn handle_quick_ack(&mut self, ack_key: i32) {
        for token in self.registry.take_quick_ack_tokens(ack_key) {
            if let Some(r) = self.registry.running.iter_mut().find(|r| r.token == token) {
                r.quick_ack();
            }
        }
    }

    /// Attaches a quick-ack callback to an already-submitted request
    /// (queued or running), mirroring the `onQuickAck` parameter of the
    /// public `sendRequest` call (§6).
    pub fn set_quick_ack_callback(&mut self, token: u32, cb: QuickAckCallback) {
        if let Some(r) = self.registry.queue.iter_mut().find(|r| r.token == token) {
            r.on_quick_ack = Some(cb);
            return;
        }
        if let Some(r) = self.registry.running.iter_mut().find(|r| r.token == token) {
            r.on_quick_ack = Some(cb);
        }
    }

    pub fn queue_session_destroy(&mut self, session_id: i64) {
        self.sessions_to_destroy.push(session_id);
    }

    pub fn registry(&self) -> &RequestRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut RequestRegistry {
        &mut self.registry
    }

    pub fn message_ids(&self) -> &MessageIdGenerator {
        &self.message_ids
    }

    pub fn message_ids_mut(&mut self) -> &mut MessageIdGenerator {
        &mut self.message_ids
    }

    /// Every live datacenter, for the event loop's per-connection
    /// timeout sweep (§4.B step 7).
    pub fn datacenters_mut(&mut self) -> impl Iterator<Item = &mut Datacenter> {
        self.datacenters.values_mut()
    }

    /// Drops salts past their validity window across every datacenter
    /// (§4.B step 8 "stale-salt refresh").
    pub fn drop_expired_salts(&mut self, now_secs: i64) {
        for dc in self.datacenters.values_mut() {
            dc.drop_expired_salts(now_secs);
        }
    }
}

/// Approximates the transport's real quick-ack key (the first bytes of
/// the outgoing frame's ciphertext, masked to 31 bits) with the
/// message's own id, since the actual framing/encryption is out of
/// scope here; both are unique per outgoing message, which is all the
/// registry needs for the ack-key → token lookup.
fn quick_ack_key(msg_id: i64) -> i32 {
    (msg_id & 0x7fff_ffff) as i32
}

fn media_slot_for_class(class: ConnectionClass) -> KeySlot {
    match class {
        ConnectionClass::Download | ConnectionClass::Upload | ConnectionClass::GenericMedia => KeySlot::MediaTemp,
        _ => KeySlot::Temp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::datacenter::Datacenter;
    use crate::delegate::NullDelegate;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn coordinator() -> Coordinator {
        let mut c = Coordinator::new(Arc::new(NullDelegate), MessageIdGenerator::new(Box::new(SystemClock::new())), 2);
        let mut dc2 = Datacenter::new(2, vec![], false);
        dc2.permanent_auth_key_id = Some(1);
        c.add_datacenter(dc2);
        let mut dc5 = Datacenter::new(5, vec![], false);
        dc5.permanent_auth_key_id = Some(1);
        c.add_datacenter(dc5);
        c
    }

    /// Runs every task currently queued on the coordinator's own task
    /// channel — stands in for the event loop's drain step in tests
    /// that don't spin up a full `EventLoop`.
    fn drain_tasks(c: &mut Coordinator) {
        let mut rx = c.tasks_rx.take().expect("task receiver already taken");
        while let Ok(task) = rx.try_recv() {
            task(c);
        }
        c.tasks_rx = Some(rx);
    }

    #[test]
    fn migration_on_303_exports_then_imports_before_switching_datacenter() {
        let mut c = coordinator();
        c.set_user_id(7);
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let token = c.send_request(vec![1, 2, 3], RequestFlags::empty(), CURRENT_DATACENTER, ConnectionClass::Generic, Box::new(move |_| {
            fired2.store(true, Ordering::SeqCst);
        }));
        let _ = c.scheduler_pass(1000, 1000);
        // pretend the request is now running with dc 2 assigned
        assert!(c.registry.running.iter().any(|r| r.token == token));
        let msg_id = c.registry.running.iter().find(|r| r.token == token).unwrap().message_id;

        c.handle_server_message(2, ConnectionClass::Generic, msg_id, ServerMessage::RpcResult {
            req_msg_id: msg_id,
            body: RpcResultBody::Error { code: 303, message: "USER_MIGRATE_5".into() },
        });

        // Migration has started but hasn't switched yet: it still owes
        // an export round trip on the current dc.
        assert_eq!(c.moving_to_datacenter_id, Some(5));
        assert_eq!(c.current_datacenter_id, 2);
        assert!(!fired.load(Ordering::SeqCst), "no error callback should fire on migration");
        // the original request survives, demoted back to the queue for redispatch.
        assert!(c.registry.queue.iter().any(|r| r.token == token));

        let export = c.registry.running.iter().find(|r| r.raw_payload == b"auth.exportAuthorization").unwrap();
        let export_msg_id = export.message_id;
        assert_eq!(export.datacenter_id, 2);

        c.handle_server_message(2, ConnectionClass::Generic, export_msg_id, ServerMessage::RpcResult {
            req_msg_id: export_msg_id,
            body: RpcResultBody::Ok(vec![9, 9, 9]),
        });
        drain_tasks(&mut c);

        // export completion still hasn't switched the dc — the import
        // on the target dc is now in flight instead.
        assert_eq!(c.current_datacenter_id, 2);
        let import = c.registry.running.iter().find(|r| r.raw_payload == vec![9, 9, 9]).unwrap();
        let import_msg_id = import.message_id;
        assert_eq!(import.datacenter_id, 5);

        c.handle_server_message(5, ConnectionClass::Generic, import_msg_id, ServerMessage::RpcResult {
            req_msg_id: import_msg_id,
            body: RpcResultBody::Ok(vec![]),
        });
        drain_tasks(&mut c);

        assert_eq!(c.current_datacenter_id, 5);
        assert!(c.moving_to_datacenter_id.is_none());
    }

    #[test]
    fn quick_ack_fires_registered_callback() {
        let mut c = coordinator();
        let acked = Arc::new(AtomicBool::new(false));
        let acked2 = acked.clone();
        let token = c.send_request(vec![], RequestFlags::NEED_QUICK_ACK, 2, ConnectionClass::Generic, Box::new(|_| {}));
        c.set_quick_ack_callback(token, Box::new(move || acked2.store(true, Ordering::SeqCst)));
        c.scheduler_pass(0, 0);
        let msg_id = c.registry.running.iter().find(|r| r.token == token).unwrap().message_id;

        c.handle_quick_ack(quick_ack_key(msg_id));

        assert!(acked.load(Ordering::SeqCst));
    }

    #[test]
    fn flood_wait_defers_without_completing() {
        let mut c = coordinator();
        let token = c.send_request(vec![], RequestFlags::empty(), 2, ConnectionClass::Generic, Box::new(|_| {
            panic!("should not complete yet");
        }));
        c.scheduler_pass(0, 0);
        let msg_id = c.registry.running.iter().find(|r| r.token == token).unwrap().message_id;
        c.handle_server_message(2, ConnectionClass::Generic, msg_id, ServerMessage::RpcResult {
            req_msg_id: msg_id,
            body: RpcResultBody::Error { code: 420, message: "FLOOD_WAIT_7".into() },
        });
        let r = c.registry.running.iter().find(|r| r.token == token).unwrap();
        assert_eq!(r.failed_by_flood_wait, 7);
        assert!(!r.completed);
    }

    #[test]
    fn cancel_running_emits_drop_answer_and_never_completes() {
        let mut c = coordinator();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let token = c.send_request(vec![], RequestFlags::empty(), 2, ConnectionClass::Generic, Box::new(move |_| {
            fired2.store(true, Ordering::SeqCst);
        }));
        c.scheduler_pass(0, 0);
        let drop_msg = c.cancel_request(token, true);
        assert!(drop_msg.is_some());
        assert!(!fired.load(Ordering::SeqCst));
        assert!(!c.registry.running.iter().any(|r| r.token == token && !r.cancelled));
    }

    #[test]
    fn admission_caps_hold_under_flood() {
        let mut c = coordinator();
        for _ in 0..70 {
            c.send_request(vec![], RequestFlags::empty(), 2, ConnectionClass::Generic, Box::new(|_| {}));
        }
        c.scheduler_pass(0, 0);
        let running_generic = c.registry.running.iter().filter(|r| r.connection_class == ConnectionClass::Generic).count();
        assert!(running_generic <= MAX_GENERIC_IN_FLIGHT);
    }
}
