//! Request data model and registry (§3, §4.F).

use std::collections::{HashMap, HashSet};

use crate::connection::ConnectionClass;
use crate::error::RpcError;

bitflags::bitflags! {
    /// Per-request behavior flags (§3 "Request flags").
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RequestFlags: u32 {
        const WITHOUT_LOGIN      = 1 << 0;
        const ENABLE_UNAUTHORIZED= 1 << 1;
        const FAIL_ON_SERVER_ERRORS = 1 << 2;
        const IMMEDIATE          = 1 << 3;
        const INVOKE_AFTER       = 1 << 4;
        const NEED_QUICK_ACK     = 1 << 5;
        const CAN_COMPRESS       = 1 << 6;
        const USE_UNBOUND_KEY    = 1 << 7;
        const TRY_DIFFERENT_DC   = 1 << 8;
        const FORCE_DOWNLOAD     = 1 << 9;
    }
}

/// The caller-supplied result of an RPC: either a raw (still-typed as
/// an opaque blob from the engine's point of view — deserialization is
/// the wire codec's job, §1 OUT OF SCOPE) success payload or a logical
/// error.
pub type RequestResult = Result<Vec<u8>, RpcError>;

pub type CompletionCallback = Box<dyn FnOnce(RequestResult) + Send>;
pub type QuickAckCallback = Box<dyn FnOnce() + Send>;

/// "current datacenter" sentinel for `Request::datacenter_id` (§3).
pub const CURRENT_DATACENTER: i32 = 0;

/// An outstanding RPC (§3 "Request").
pub struct Request {
    pub token: u32,
    pub raw_payload: Vec<u8>,
    pub wrapped_payload: Vec<u8>,
    pub datacenter_id: i32,
    pub connection_class: ConnectionClass,
    pub flags: RequestFlags,

    pub message_id: i64,
    pub message_seq_no: i32,
    pub connection_token: u64,

    pub retry_count: u32,
    pub last_resend_time: i64,
    pub min_start_time: i64,
    pub failed_by_flood_wait: i32,
    pub failed_by_salt: bool,
    pub server_failure_count: u32,

    pub start_time_secs: i64,
    pub start_time_millis: i64,

    pub is_init_request: bool,
    pub is_init_media_request: bool,

    pub cancelled: bool,
    pub completed: bool,

    pub guid: Option<u32>,

    pub on_complete: Option<CompletionCallback>,
    pub on_quick_ack: Option<QuickAckCallback>,
}

impl Request {
    pub fn new(
        token: u32,
        raw_payload: Vec<u8>,
        datacenter_id: i32,
        connection_class: ConnectionClass,
        flags: RequestFlags,
        on_complete: CompletionCallback,
    ) -> Self {
        Self {
            token,
            wrapped_payload: raw_payload.clone(),
            raw_payload,
            datacenter_id,
            connection_class,
            flags,
            message_id: 0,
            message_seq_no: 0,
            connection_token: 0,
            retry_count: 0,
            last_resend_time: 0,
            min_start_time: 0,
            failed_by_flood_wait: 0,
            failed_by_salt: false,
            server_failure_count: 0,
            start_time_secs: 0,
            start_time_millis: 0,
            is_init_request: false,
            is_init_media_request: false,
            cancelled: false,
            completed: false,
            guid: None,
            on_complete: Some(on_complete),
            on_quick_ack: None,
        }
    }

    /// Download retry ceiling per §3 `ForceDownload` and §4.G Phase 1.
    pub fn download_retry_limit(&self) -> u32 {
        if self.flags.contains(RequestFlags::FORCE_DOWNLOAD) {
            10
        } else if self.failed_by_flood_wait != 0 {
            1
        } else {
            6
        }
    }

    /// Upload retry ceiling; symmetric with downloads per the Open
    /// Questions ledger (the original has no corresponding branch).
    pub fn upload_retry_limit(&self) -> u32 {
        self.download_retry_limit()
    }

    /// Invoke the completion callback exactly once, moving it out of
    /// the request so a re-entrant `sendRequest` from inside the
    /// callback cannot observe a half-destroyed request (§9 "Callbacks
    /// and lifetimes").
    pub fn complete(&mut self, result: RequestResult) {
        if self.completed {
            return;
        }
        self.completed = true;
        if let Some(cb) = self.on_complete.take() {
            cb(result);
        }
    }

    pub fn quick_ack(&mut self) {
        if let Some(cb) = self.on_quick_ack.take() {
            cb();
        }
    }
}

/// Two ordered collections (queue, running) plus the GUID and
/// quick-ack indices (§4.F).
#[derive(Default)]
pub struct RequestRegistry {
    pub queue: Vec<Request>,
    pub running: Vec<Request>,
    next_token: u32,
    requests_by_guid: HashMap<u32, Vec<u32>>,
    guid_by_request: HashMap<u32, u32>,
    quick_ack_index: HashMap<i32, Vec<u32>>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self { next_token: 1, ..Default::default() }
    }

    pub fn next_token(&mut self) -> u32 {
        let t = self.next_token;
        self.next_token += 1;
        t
    }

    pub fn enqueue(&mut self, request: Request) {
        self.queue.push(request);
    }

    pub fn bind_to_guid(&mut self, token: u32, guid: u32) {
        self.requests_by_guid.entry(guid).or_default().push(token);
        self.guid_by_request.insert(token, guid);
    }

    /// Remove `token` from the vector under `requests_by_guid[guid]`,
    /// dropping the entry entirely when empty. Resolves the Open
    /// Question around the original's `removeRequestFromGuid` typo.
    fn remove_from_guid(&mut self, token: u32) {
        if let Some(guid) = self.guid_by_request.remove(&token) {
            if let Some(tokens) = self.requests_by_guid.get_mut(&guid) {
                tokens.retain(|&t| t != token);
                if tokens.is_empty() {
                    self.requests_by_guid.remove(&guid);
                }
            }
        }
    }

    /// Cancel every request token-grouped under `guid` (§6 public API).
    pub fn tokens_for_guid(&self, guid: u32) -> Vec<u32> {
        self.requests_by_guid.get(&guid).cloned().unwrap_or_default()
    }

    pub fn register_quick_ack(&mut self, ack_key: i32, tokens: Vec<u32>) {
        self.quick_ack_index.entry(ack_key).or_default().extend(tokens);
    }

    pub fn take_quick_ack_tokens(&mut self, ack_key: i32) -> Vec<u32> {
        self.quick_ack_index.remove(&ack_key).unwrap_or_default()
    }

    /// Setting `cancelled = true` removes a queued request immediately
    /// (§4.F). Returns the completion callback's result payload if the
    /// request was running, so the caller can fire `rpc_drop_answer`.
    pub fn cancel(&mut self, token: u32, notify_server: bool) -> Option<(i64, i32)> {
        if let Some(pos) = self.queue.iter().position(|r| r.token == token) {
            let mut r = self.queue.remove(pos);
            r.cancelled = true;
            self.remove_from_guid(token);
            return None;
        }
        if let Some(r) = self.running.iter_mut().find(|r| r.token == token) {
            if r.completed {
                // A cancel racing a completion is a no-op (§5 "Cancellation").
                return None;
            }
            r.cancelled = true;
            let info = if notify_server { Some((r.message_id, r.connection_class as i32)) } else { None };
            return info;
        }
        None
    }

    /// Drop all cancelled/completed running requests, returning them
    /// for final cleanup (e.g. `cleanUp`, §6).
    pub fn drain_finished(&mut self) -> Vec<Request> {
        let mut finished = Vec::new();
        let mut remaining = Vec::with_capacity(self.running.len());
        for r in self.running.drain(..) {
            if r.cancelled || r.completed {
                finished.push(r);
            } else {
                remaining.push(r);
            }
        }
        self.running = remaining;
        finished
    }

    pub fn running_for_message_id(&mut self, message_id: i64) -> Option<&mut Request> {
        self.running.iter_mut().find(|r| r.message_id == message_id && !r.cancelled)
    }

    pub fn running_tokens_on_dc_class(&self, dc: i32, class: ConnectionClass) -> Vec<u32> {
        self.running
            .iter()
            .filter(|r| r.datacenter_id == dc && r.connection_class == class)
            .map(|r| r.token)
            .collect()
    }

    pub fn promote_to_running(&mut self, request: Request) {
        self.running.push(request);
    }

    pub fn demote_to_queue(&mut self, token: u32) {
        if let Some(pos) = self.running.iter().position(|r| r.token == token) {
            let r = self.running.remove(pos);
            self.queue.push(r);
        }
    }

    pub fn unique_guids(&self) -> HashSet<u32> {
        self.requests_by_guid.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_request(token: u32) -> Request {
        Request::new(token, vec![], 0, ConnectionClass::Generic, RequestFlags::empty(), Box::new(|_| {}))
    }

    #[test]
    fn completion_fires_exactly_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let mut r = Request::new(1, vec![], 0, ConnectionClass::Generic, RequestFlags::empty(), Box::new(move |_| {
            calls2.fetch_add(1, Ordering::SeqCst);
        }));
        r.complete(Ok(vec![]));
        r.complete(Ok(vec![])); // second call must be a no-op
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn guid_removal_drops_empty_bucket() {
        let mut reg = RequestRegistry::new();
        reg.enqueue(mk_request(1));
        reg.bind_to_guid(1, 42);
        assert_eq!(reg.tokens_for_guid(42), vec![1]);
        reg.remove_from_guid(1);
        assert!(reg.tokens_for_guid(42).is_empty());
        assert!(!reg.requests_by_guid.contains_key(&42));
    }

    #[test]
    fn cancel_queue_is_immediate() {
        let mut reg = RequestRegistry::new();
        reg.enqueue(mk_request(1));
        assert_eq!(reg.queue.len(), 1);
        reg.cancel(1, false);
        assert_eq!(reg.queue.len(), 0);
    }

    #[test]
    fn cancel_running_race_with_completion_is_noop() {
        let mut reg = RequestRegistry::new();
        let mut r = mk_request(1);
        r.completed = true;
        reg.promote_to_running(r);
        let result = reg.cancel(1, true);
        assert!(result.is_none());
    }
}
