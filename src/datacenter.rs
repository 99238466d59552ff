//! Per-datacenter shard state (§3 "Datacenter", §4.D).

use std::collections::HashMap;

use crate::connection::{Connection, ConnectionClass};
use crate::error::DatacenterError;

/// Which ephemeral key slot a handshake targets, mirroring the
/// original's `HandshakeType{Temp,MediaTemp}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeySlot {
    Permanent,
    Temp,
    MediaTemp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    None,
    Handshaking,
    Done,
}

/// One entry in the per-dc salt pool (§3 invariants: strictly ordered
/// by `valid_since`, no overlapping identical salts).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSalt {
    pub salt: i64,
    pub valid_since: i64,
    pub valid_until: i64,
}

/// Validity window granted to a salt learned from `bad_server_salt`
/// (§8 scenario 2: "valid for 30 min").
pub const BAD_SALT_VALIDITY_SECS: i64 = 30 * 60;

/// Render a key id the way logs and diagnostics display it elsewhere
/// in the stack — lowercase hex, big-endian.
pub fn key_id_hex(key_id: i64) -> String {
    hex::encode(key_id.to_be_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DcAddress {
    pub dc_id: i32,
    pub ipv4: std::net::SocketAddrV4,
    pub ipv6: Option<std::net::SocketAddrV6>,
    pub is_cdn: bool,
}

pub struct Datacenter {
    pub id: i32,
    pub addresses: Vec<DcAddress>,
    pub is_cdn: bool,

    pub permanent_auth_key_id: Option<i64>,
    ephemeral_keys: HashMap<KeySlot, i64>,
    handshake_state: HashMap<KeySlot, HandshakeState>,

    salts: Vec<ServerSalt>,

    connections: HashMap<ConnectionClass, Connection>,

    pub authorized_for_user: bool,
    /// Tracks `initConnection` de-duplication per (dc, media) tuple
    /// per client version (§3, §4.G "allowInitConnection").
    pub last_init_version: HashMap<bool, u32>,
}

impl Datacenter {
    pub fn new(id: i32, addresses: Vec<DcAddress>, is_cdn: bool) -> Self {
        Self {
            id,
            addresses,
            is_cdn,
            permanent_auth_key_id: None,
            ephemeral_keys: HashMap::new(),
            handshake_state: HashMap::new(),
            salts: Vec::new(),
            connections: HashMap::new(),
            authorized_for_user: false,
            last_init_version: HashMap::new(),
        }
    }

    pub fn get_connection(&mut self, class: ConnectionClass, create: bool) -> Option<&mut Connection> {
        if create {
            Some(self.connections.entry(class).or_insert_with(|| Connection::new(class, self.id)))
        } else {
            self.connections.get_mut(&class)
        }
    }

    pub fn has_connection(&self, class: ConnectionClass) -> bool {
        self.connections.contains_key(&class)
    }

    /// Every connection currently open on this datacenter, for the
    /// event loop's per-tick timeout sweep (§4.B step 7).
    pub fn connections_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.connections.values_mut()
    }

    pub fn has_auth_key(&self, class: ConnectionClass, can_use_unbound: bool) -> bool {
        if self.permanent_auth_key_id.is_some() {
            return true;
        }
        let slot = if matches!(class, ConnectionClass::Download | ConnectionClass::Upload | ConnectionClass::GenericMedia) {
            KeySlot::MediaTemp
        } else {
            KeySlot::Temp
        };
        if !can_use_unbound {
            return false;
        }
        self.ephemeral_keys.contains_key(&slot)
    }

    pub fn begin_handshake(&mut self, slot: KeySlot) -> Result<(), DatacenterError> {
        let state = self.handshake_state.entry(slot).or_insert(HandshakeState::None);
        if *state == HandshakeState::Handshaking {
            return Err(DatacenterError::HandshakeInProgress);
        }
        *state = HandshakeState::Handshaking;
        Ok(())
    }

    pub fn complete_handshake(&mut self, slot: KeySlot, key_id: i64) {
        tracing::debug!(dc_id = self.id, ?slot, key_id = %key_id_hex(key_id), "handshake complete");
        self.ephemeral_keys.insert(slot, key_id);
        self.handshake_state.insert(slot, HandshakeState::Done);
    }

    pub fn handshake_state(&self, slot: KeySlot) -> HandshakeState {
        *self.handshake_state.get(&slot).unwrap_or(&HandshakeState::None)
    }

    /// `-404` clears the ephemeral key for `slot` without touching the
    /// permanent key (§3 invariants).
    pub fn clear_ephemeral_key(&mut self, slot: KeySlot) {
        self.ephemeral_keys.remove(&slot);
        self.handshake_state.insert(slot, HandshakeState::None);
    }

    /// Bad-msg codes {16,17,19,32,33,64} also reset the handshake
    /// state for the affected slot back to `None` (§4.D transitions).
    pub fn reset_on_bad_message(&mut self, slot: KeySlot) {
        self.clear_ephemeral_key(slot);
    }

    pub fn add_server_salt(&mut self, salt: ServerSalt) {
        if self.salts.iter().any(|s| s.salt == salt.salt && s.valid_since == salt.valid_since) {
            return;
        }
        self.salts.push(salt);
        self.salts.sort_by_key(|s| s.valid_since);
    }

    pub fn merge_server_salts(&mut self, mut new_salts: Vec<ServerSalt>) {
        new_salts.sort_by_key(|s| s.valid_since);
        for s in new_salts {
            self.add_server_salt(s);
        }
    }

    pub fn clear_server_salts(&mut self) {
        self.salts.clear();
    }

    pub fn current_salt(&self, now_secs: i64) -> Option<i64> {
        self.salts
            .iter()
            .filter(|s| s.valid_since <= now_secs && now_secs < s.valid_until)
            .map(|s| s.salt)
            .last()
            .or_else(|| self.salts.last().map(|s| s.salt))
    }

    pub fn drop_expired_salts(&mut self, now_secs: i64) {
        self.salts.retain(|s| s.valid_until > now_secs);
    }

    pub fn salts_ordered(&self) -> &[ServerSalt] {
        &self.salts
    }

    /// Rotate session ids for the classes affected by a server-side
    /// session drop notification (§4.D `recreateSessions`).
    pub fn recreate_sessions(&mut self, classes: &[ConnectionClass]) {
        for class in classes {
            if let Some(conn) = self.connections.get_mut(class) {
                conn.recreate_session();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dc() -> Datacenter {
        Datacenter::new(2, vec![], false)
    }

    #[test]
    fn salts_stay_ordered_by_valid_since() {
        let mut d = dc();
        d.add_server_salt(ServerSalt { salt: 3, valid_since: 300, valid_until: 600 });
        d.add_server_salt(ServerSalt { salt: 1, valid_since: 100, valid_until: 400 });
        d.add_server_salt(ServerSalt { salt: 2, valid_since: 200, valid_until: 500 });
        let since: Vec<i64> = d.salts_ordered().iter().map(|s| s.valid_since).collect();
        assert_eq!(since, vec![100, 200, 300]);
    }

    #[test]
    fn duplicate_identical_salts_are_not_stored_twice() {
        let mut d = dc();
        d.add_server_salt(ServerSalt { salt: 1, valid_since: 100, valid_until: 400 });
        d.add_server_salt(ServerSalt { salt: 1, valid_since: 100, valid_until: 400 });
        assert_eq!(d.salts_ordered().len(), 1);
    }

    #[test]
    fn handshake_cannot_double_start() {
        let mut d = dc();
        d.begin_handshake(KeySlot::Temp).unwrap();
        assert!(d.begin_handshake(KeySlot::Temp).is_err());
    }

    #[test]
    fn clearing_ephemeral_key_keeps_permanent() {
        let mut d = dc();
        d.permanent_auth_key_id = Some(42);
        d.complete_handshake(KeySlot::Temp, 7);
        d.clear_ephemeral_key(KeySlot::Temp);
        assert_eq!(d.permanent_auth_key_id, Some(42));
        assert_eq!(d.handshake_state(KeySlot::Temp), HandshakeState::None);
    }
}
