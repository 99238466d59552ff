//! Multi-tenant instance registry (§9 "one engine per instanceNum").
//!
//! Each `instanceNum` owns an independent `Engine` — its own
//! coordinator, config store, and datacenters. Nothing is shared across
//! keys; this is a container, not a cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::clock::{MessageIdGenerator, SystemClock};
use crate::config::{ConfigRecord, ConfigStore};
use crate::connection::ConnectionClass;
use crate::coordinator::Coordinator;
use crate::datacenter::{Datacenter, DcAddress};
use crate::dc_list;
use crate::delegate::Delegate;
use crate::request::{CompletionCallback, RequestFlags, CURRENT_DATACENTER};

/// One tenant's complete engine state (§4, §6 "init").
pub struct Engine {
    pub instance_num: i32,
    pub coordinator: Coordinator,
    pub config_store: ConfigStore,
}

impl Engine {
    pub fn new(instance_num: i32, config_dir: std::path::PathBuf, test_backend: bool, delegate: Arc<dyn Delegate>) -> Self {
        let config_store = ConfigStore::new(&config_dir);
        let record = config_store.load().unwrap_or_default();

        let message_ids = MessageIdGenerator::new(Box::new(SystemClock::new()));
        let current_dc_id = record
            .current
            .as_ref()
            .map(|c| c.current_dc_id)
            .unwrap_or(1);

        let mut coordinator = Coordinator::new(delegate, message_ids, current_dc_id);

        let bootstrap: Vec<DcAddress> = if test_backend {
            dc_list::test_datacenters()
        } else {
            dc_list::production_datacenters()
        };

        for addr in &bootstrap {
            let mut dc = Datacenter::new(addr.dc_id, vec![*addr], addr.is_cdn);
            if let Some(current) = &record.current {
                if let Some(saved) = current.datacenters.iter().find(|d| d.id == addr.dc_id) {
                    dc.permanent_auth_key_id = saved.permanent_auth_key_id;
                    dc.authorized_for_user = saved.authorized_for_user;
                }
            }
            coordinator.add_datacenter(dc);
        }

        if let Some(current) = &record.current {
            coordinator.message_ids_mut().set_time_offset(current.time_offset);
            for session_id in &current.sessions_to_destroy {
                coordinator.queue_session_destroy(*session_id);
            }
        }

        Self { instance_num, coordinator, config_store }
    }

    /// Serialize the live coordinator state back into a `ConfigRecord`
    /// (§4.C, mirrors the original's periodic `saveConfig`).
    pub fn snapshot_config(&self, test_backend: bool) -> ConfigRecord {
        ConfigRecord {
            version: crate::config::SUPPORTED_VERSION,
            test_backend,
            client_blocked: false,
            last_init_system_lang: String::new(),
            current: Some(crate::config::CurrentDatacenterRecord {
                current_dc_id: self.coordinator.current_datacenter_id,
                time_offset: self.coordinator.message_ids().time_offset(),
                last_dc_update_time: self.coordinator.message_ids().monotonic_secs(),
                push_session_id: 0,
                registered_for_internal_push: false,
                sessions_to_destroy: Vec::new(),
                datacenters: Vec::new(),
            }),
        }
    }

    pub fn save_config(&self, test_backend: bool) {
        if let Err(err) = self.config_store.save(&self.snapshot_config(test_backend)) {
            tracing::error!(instance = self.instance_num, %err, "failed to persist config");
        }
    }

    pub fn send_request(
        &mut self,
        payload: Vec<u8>,
        flags: RequestFlags,
        datacenter_id: i32,
        class: ConnectionClass,
        on_complete: CompletionCallback,
    ) -> u32 {
        self.coordinator.send_request(payload, flags, datacenter_id, class, on_complete)
    }

    pub fn cancel_request(&mut self, token: u32, notify_server: bool) {
        self.coordinator.cancel_request(token, notify_server);
    }
}

/// Process-wide `instanceNum -> Engine` map (§9, §6 "init"). Lazily
/// creates an engine the first time a given instance is referenced;
/// never duplicates per-instance logic elsewhere.
#[derive(Default)]
pub struct InstanceRegistry {
    engines: Mutex<HashMap<i32, Engine>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self { engines: Mutex::new(HashMap::new()) }
    }

    /// Fetch or lazily create the engine for `instance_num` and run
    /// `f` against it while holding the registry lock.
    pub fn with_engine<R>(
        &self,
        instance_num: i32,
        config_dir: std::path::PathBuf,
        test_backend: bool,
        delegate: Arc<dyn Delegate>,
        f: impl FnOnce(&mut Engine) -> R,
    ) -> R {
        let mut engines = self.engines.lock().expect("instance registry poisoned");
        let engine = engines
            .entry(instance_num)
            .or_insert_with(|| {
                info!(instance_num, "creating engine");
                Engine::new(instance_num, config_dir, test_backend, delegate)
            });
        f(engine)
    }

    pub fn remove(&self, instance_num: i32) {
        self.engines.lock().expect("instance registry poisoned").remove(&instance_num);
    }

    pub fn instance_count(&self) -> usize {
        self.engines.lock().expect("instance registry poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::NullDelegate;

    #[test]
    fn each_instance_gets_independent_state() {
        let registry = InstanceRegistry::new();
        let dir = std::env::temp_dir().join(format!("montane-instance-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        registry.with_engine(1, dir.clone(), true, Arc::new(NullDelegate), |engine| {
            engine.coordinator.set_user_id(100);
        });
        registry.with_engine(2, dir.clone(), true, Arc::new(NullDelegate), |engine| {
            assert_eq!(engine.coordinator.current_user_id, 0, "instance 2 must not see instance 1's user");
        });
        assert_eq!(registry.instance_count(), 2);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn request_flags_without_login_uses_current_dc_placeholder() {
        let registry = InstanceRegistry::new();
        let dir = std::env::temp_dir().join(format!("montane-instance-test2-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        registry.with_engine(9, dir.clone(), true, Arc::new(NullDelegate), |engine| {
            let token = engine.send_request(vec![1], RequestFlags::WITHOUT_LOGIN, CURRENT_DATACENTER, ConnectionClass::Generic, Box::new(|_| {}));
            assert!(engine.coordinator.registry().queue.iter().any(|r| r.token == token));
        });

        let _ = std::fs::remove_dir_all(&dir);
    }
}
