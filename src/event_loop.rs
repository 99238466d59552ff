//! The single-threaded tick loop that actually drives a `Coordinator`
//! (§4.B). Everything else in this crate is data and pure
//! transitions; this module is the one place time passes and channels
//! get polled.
//!
//! The wire codec and socket/TLS layer are out of scope, so "readiness"
//! here is represented by an `InboundFrame` channel rather than real
//! file descriptors — whatever owns the transport decodes bytes into
//! frames and forwards them here instead of handing raw sockets to the
//! loop directly.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::connection::ConnectionClass;
use crate::coordinator::Task;
use crate::instance::Engine;

/// A decoded-but-undispatched message arriving from the transport
/// layer, routed back into the owning coordinator (§4.B step 6
/// "dispatch readiness callbacks to connections").
pub struct InboundFrame {
    pub dc_id: i32,
    pub class: ConnectionClass,
    pub msg_id: i64,
    pub message: crate::wire::ServerMessage,
}

/// Upper bound on the tick deadline regardless of push-ping or event
/// timing (§4.B step 2 "min(earliest event, push-ping deadline, 1000
/// ms)").
const MAX_TICK_MILLIS: u64 = 1000;

pub struct EventLoop {
    engine: Engine,
    tasks_rx: mpsc::UnboundedReceiver<Task>,
    frames_rx: mpsc::UnboundedReceiver<InboundFrame>,
    frames_tx: mpsc::UnboundedSender<InboundFrame>,
}

impl EventLoop {
    pub fn new(mut engine: Engine) -> Self {
        let tasks_rx = engine.coordinator.take_task_receiver();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        Self { engine, tasks_rx, frames_rx, frames_tx }
    }

    /// A handle other components use to hand decoded frames to this
    /// loop from outside (e.g. the transport's read task).
    pub fn frame_sender(&self) -> mpsc::UnboundedSender<InboundFrame> {
        self.frames_tx.clone()
    }

    /// A handle to schedule work on the loop's owning thread (§4.B,
    /// §5 "external entry points enqueue a task and wakeup").
    pub fn task_sender(&self) -> mpsc::UnboundedSender<Task> {
        self.engine.coordinator.task_sender()
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }

    /// Runs ticks forever (§4.B steps 1-8). Callers bound this with
    /// `tokio::time::timeout` or similar — the loop itself has no exit
    /// condition, mirroring the original's run-until-shutdown socket
    /// loop.
    pub async fn run(&mut self) {
        loop {
            self.tick().await;
        }
    }

    /// One full iteration of the §4.B tick.
    async fn tick(&mut self) {
        // Step 1: drain the pending-task queue.
        self.drain_tasks();

        // Step 2: compute the next wake deadline. The "earliest
        // scheduled event" term collapses into the 1000ms ceiling here
        // — request retry/min-start times are found by re-scanning the
        // queue every tick rather than a separate timer wheel, so the
        // only other deadline this loop needs is the push ping's.
        let now_secs = self.monotonic_secs();
        let deadline_secs = self.engine.coordinator.push_ping_deadline_secs(now_secs).max(0) as u64;
        let deadline_millis = (deadline_secs.saturating_mul(1000)).min(MAX_TICK_MILLIS).max(1);
        let deadline = Instant::now() + Duration::from_millis(deadline_millis);

        // Step 3: block on readiness (task/frame channels) until the
        // deadline or an event.
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {}
            Some(task) = self.tasks_rx.recv() => {
                task(&mut self.engine.coordinator);
            }
            Some(frame) = self.frames_rx.recv() => {
                self.dispatch_frame(frame);
            }
        }

        // Step 4: drain the pending-task queue again, in case the
        // select branch above enqueued follow-up work.
        self.drain_tasks();

        // Step 5 + 8: fire expired timed events and run housekeeping.
        // Housekeeping folds the original's separate "fire timed
        // events" step into the scheduler pass, since requests are
        // this crate's only timed events (§4.B, §4.G).
        self.tick_housekeeping();
    }

    fn drain_tasks(&mut self) {
        while let Ok(task) = self.tasks_rx.try_recv() {
            task(&mut self.engine.coordinator);
        }
    }

    fn dispatch_frame(&mut self, frame: InboundFrame) {
        self.engine.coordinator.handle_server_message(frame.dc_id, frame.class, frame.msg_id, frame.message);
    }

    fn monotonic_secs(&self) -> i64 {
        self.engine.coordinator.message_ids().monotonic_secs()
    }

    /// Steps 6-8: dispatch readiness (already folded into `tick`'s
    /// select), per-connection timeout sweep, then push-ping/sleep/
    /// salt-refresh housekeeping.
    fn tick_housekeeping(&mut self) {
        let now_secs = self.monotonic_secs();
        let now_millis = now_secs * 1000;

        // Step 7: tear down connections past their inactivity ceiling.
        for dc in self.engine.coordinator.datacenters_mut() {
            for conn in dc.connections_mut() {
                if conn.check_timeout(now_secs) {
                    debug!(dc_id = dc.id, class = ?conn.class, "connection timed out");
                }
            }
        }

        // Step 8: per-tick request-queue scan (admission, retries,
        // dispatch).
        let batches = self.engine.coordinator.scheduler_pass(now_secs, now_millis);
        debug!(batches = batches.len(), "scheduler pass complete");

        // Step 8: push ping.
        if let Some((dc_id, _msg)) = self.engine.coordinator.maybe_send_push_ping(now_secs) {
            debug!(dc_id, "push ping sent");
        }

        // Step 8: sleep/resume.
        self.engine.coordinator.maybe_sleep(now_secs);

        // Step 8: stale-salt refresh.
        self.engine.coordinator.drop_expired_salts(now_secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::NullDelegate;
    use std::sync::Arc;

    #[test]
    fn deadline_never_exceeds_one_second() {
        // `push_ping_deadline_secs` can return minutes; the tick loop
        // must still clamp to the 1000ms ceiling (§4.B step 2).
        let dir = std::env::temp_dir().join(format!("montane-evloop-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let engine = Engine::new(1, dir.clone(), true, Arc::new(NullDelegate));
        let event_loop = EventLoop::new(engine);
        let now = event_loop.engine().coordinator.message_ids().monotonic_secs();
        let raw = event_loop.engine().coordinator.push_ping_deadline_secs(now);
        let clamped = ((raw.max(0) as u64).saturating_mul(1000)).min(MAX_TICK_MILLIS).max(1);
        assert!(clamped <= MAX_TICK_MILLIS);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
