//! Server-ID catalog.
//!
//! The catalog of every server this one knows: a primary table mapping SID
//! to its record, one secondary index per attribute for the policy
//! selector's joins, and a type table recording which roles each server
//! plays. All four sit on the abstract ordered engine; index keys encode
//! integers big-endian so lexicographic order is numeric order.

mod policy;
mod textfmt;

pub use policy::{
    CmpOp, JoinCriterion, NewObject, Policy, PolicyTag, SetCriterion, select_servers,
};
pub use textfmt::{load, save, savelist};

use std::collections::HashMap;
use std::sync::Arc;

use bitflags::bitflags;
use log::debug;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::store::{CursorOp, Dbase, MemDb};
use crate::types::Sid;

/// Number of user-defined attributes a server record carries.
pub const SID_NUM_ATTR: usize = 6;

/// Attribute names, in record order. Load matches config names against
/// these; anything else is discarded.
pub const SID_ATTR_NAMES: [&str; SID_NUM_ATTR] =
    ["rack", "zone", "site", "tier", "capacity", "load"];

/// Index of a named attribute.
pub fn attr_index(name: &str) -> Option<usize> {
    SID_ATTR_NAMES.iter().position(|&n| n == name)
}

bitflags! {
    /// Roles a server can play. A server may hold any combination.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct ServerTypes: u32 {
        /// Holds the filesystem root directory.
        const ROOT = 0o0001;
        /// The prime server for configuration decisions.
        const PRIME = 0o0002;
        /// Serves configuration.
        const CONFIG = 0o0004;
        /// Running in this process.
        const LOCAL = 0o0010;
        /// Stores metadata objects.
        const META = 0o0020;
        /// Stores file data.
        const DATA = 0o0040;
        /// Stores directory metadata.
        const DIRM = 0o0100;
        /// Stores directory data.
        const DIRD = 0o0200;
        /// Issues and validates security tokens.
        const SECURITY = 0o0400;
        /// Marks this server's own record.
        const ME = 0o20000000000;
    }
}

/// The OR of every legal type bit.
pub fn valid_types() -> ServerTypes {
    ServerTypes::all()
}

impl ServerTypes {
    /// Parse one type word from the server definition format.
    pub fn from_word(word: &str) -> Option<ServerTypes> {
        match word {
            "ROOT" => Some(ServerTypes::ROOT),
            "PRIME" => Some(ServerTypes::PRIME),
            "CONFIG" => Some(ServerTypes::CONFIG),
            "LOCAL" => Some(ServerTypes::LOCAL),
            "META" => Some(ServerTypes::META),
            "DATA" => Some(ServerTypes::DATA),
            "DIRM" => Some(ServerTypes::DIRM),
            "DIRD" => Some(ServerTypes::DIRD),
            "SECURITY" => Some(ServerTypes::SECURITY),
            "ME" => Some(ServerTypes::ME),
            _ => None,
        }
    }

    /// Type words in the server definition format, canonical order.
    pub fn words(self) -> Vec<&'static str> {
        let table = [
            (ServerTypes::ROOT, "ROOT"),
            (ServerTypes::PRIME, "PRIME"),
            (ServerTypes::CONFIG, "CONFIG"),
            (ServerTypes::LOCAL, "LOCAL"),
            (ServerTypes::META, "META"),
            (ServerTypes::DATA, "DATA"),
            (ServerTypes::DIRM, "DIRM"),
            (ServerTypes::DIRD, "DIRD"),
            (ServerTypes::SECURITY, "SECURITY"),
            (ServerTypes::ME, "ME"),
        ];
        table
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|&(_, w)| w)
            .collect()
    }
}

/// One server's catalog record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRecord {
    /// The server's id.
    pub sid: Sid,
    /// Resolved transport address; 0 until first resolution.
    pub bmi_addr: i64,
    /// Transport URL the address resolves from.
    pub url: String,
    /// Attribute vector; -1 marks an unset attribute.
    pub attrs: [i32; SID_NUM_ATTR],
    /// Optional human-readable name.
    pub alias: Option<String>,
}

impl ServerRecord {
    /// Record with no attributes set.
    pub fn new(sid: Sid, url: &str) -> ServerRecord {
        ServerRecord {
            sid,
            bmi_addr: 0,
            url: url.to_string(),
            attrs: [-1; SID_NUM_ATTR],
            alias: None,
        }
    }
}

/// Resolves transport URLs to addresses. Supplied by the transport layer.
pub trait Resolver: Send + Sync {
    /// Resolve `url` to a nonzero address.
    fn resolve(&self, url: &str) -> Result<i64>;
}

fn encode_record(rec: &ServerRecord) -> Vec<u8> {
    let alias = rec.alias.as_deref().unwrap_or("");
    let mut out = Vec::with_capacity(8 + SID_NUM_ATTR * 4 + 4 + rec.url.len() + alias.len());
    out.extend_from_slice(&rec.bmi_addr.to_le_bytes());
    for a in rec.attrs {
        out.extend_from_slice(&a.to_le_bytes());
    }
    out.extend_from_slice(&(rec.url.len() as u16).to_le_bytes());
    out.extend_from_slice(rec.url.as_bytes());
    out.extend_from_slice(&(alias.len() as u16).to_le_bytes());
    out.extend_from_slice(alias.as_bytes());
    out
}

fn decode_record(sid: Sid, raw: &[u8]) -> Result<ServerRecord> {
    let fixed = 8 + SID_NUM_ATTR * 4 + 2;
    if raw.len() < fixed {
        return Err(Error::Corrupt("server record too short"));
    }
    let bmi_addr = i64::from_le_bytes(raw[..8].try_into().expect("sized slice"));
    let mut attrs = [0i32; SID_NUM_ATTR];
    for (i, a) in attrs.iter_mut().enumerate() {
        let off = 8 + i * 4;
        *a = i32::from_le_bytes(raw[off..off + 4].try_into().expect("sized slice"));
    }
    let mut off = 8 + SID_NUM_ATTR * 4;
    let url_len = u16::from_le_bytes(raw[off..off + 2].try_into().expect("sized slice")) as usize;
    off += 2;
    if raw.len() < off + url_len + 2 {
        return Err(Error::Corrupt("server record url truncated"));
    }
    let url = String::from_utf8(raw[off..off + url_len].to_vec())
        .map_err(|_| Error::Corrupt("server record url is not utf-8"))?;
    off += url_len;
    let alias_len =
        u16::from_le_bytes(raw[off..off + 2].try_into().expect("sized slice")) as usize;
    off += 2;
    if raw.len() < off + alias_len {
        return Err(Error::Corrupt("server record alias truncated"));
    }
    let alias = if alias_len == 0 {
        None
    } else {
        Some(
            String::from_utf8(raw[off..off + alias_len].to_vec())
                .map_err(|_| Error::Corrupt("server record alias is not utf-8"))?,
        )
    };
    Ok(ServerRecord {
        sid,
        bmi_addr,
        url,
        attrs,
        alias,
    })
}

fn attr_key(value: i32, sid: &Sid) -> Vec<u8> {
    let mut key = Vec::with_capacity(20);
    // big-endian with the sign bit flipped keeps numeric order
    key.extend_from_slice(&((value as u32) ^ 0x8000_0000).to_be_bytes());
    key.extend_from_slice(sid.as_bytes());
    key
}

fn type_key(bit: u32, sid: &Sid) -> Vec<u8> {
    let mut key = Vec::with_capacity(20);
    key.extend_from_slice(&bit.to_be_bytes());
    key.extend_from_slice(sid.as_bytes());
    key
}

fn type_index_key(sid: &Sid, bit: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(20);
    key.extend_from_slice(sid.as_bytes());
    key.extend_from_slice(&bit.to_be_bytes());
    key
}

fn sid_from_suffix(raw: &[u8]) -> Result<Sid> {
    let bytes: [u8; 16] = raw
        .try_into()
        .map_err(|_| Error::Corrupt("index key suffix is not a sid"))?;
    Ok(Sid(bytes))
}

/// The server catalog.
pub struct SidCache {
    primary: Arc<dyn Dbase>,
    attr_index: Vec<Arc<dyn Dbase>>,
    type_table: Arc<dyn Dbase>,
    type_index: Arc<dyn Dbase>,
    policies: Mutex<HashMap<PolicyTag, Arc<Policy>>>,
}

impl std::fmt::Debug for SidCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SidCache")
            .field("servers", &self.primary.record_count())
            .finish()
    }
}

impl Default for SidCache {
    fn default() -> Self {
        SidCache::new()
    }
}

impl SidCache {
    /// Catalog over fresh in-memory engines.
    pub fn new() -> SidCache {
        SidCache::with_engine_factory(|| Arc::new(MemDb::new()))
    }

    /// Catalog over engines produced by `factory`; one database per index.
    pub fn with_engine_factory<F>(factory: F) -> SidCache
    where
        F: Fn() -> Arc<dyn Dbase>,
    {
        let mut policies: HashMap<PolicyTag, Arc<Policy>> = HashMap::new();
        policies.insert(PolicyTag::Meta, Arc::new(Policy::default_meta()));
        policies.insert(PolicyTag::Data, Arc::new(Policy::default_data()));
        SidCache {
            primary: factory(),
            attr_index: (0..SID_NUM_ATTR).map(|_| factory()).collect(),
            type_table: factory(),
            type_index: factory(),
            policies: Mutex::new(policies),
        }
    }

    /// Add a server. `Exists` when the SID is already cataloged.
    pub fn add(&self, rec: &ServerRecord, types: ServerTypes) -> Result<()> {
        self.primary.put_once(rec.sid.as_bytes(), &encode_record(rec))?;
        for (i, &value) in rec.attrs.iter().enumerate() {
            if value >= 0 {
                self.attr_index[i].put(&attr_key(value, &rec.sid), &[])?;
            }
        }
        for word_bit in iter_bits(types) {
            self.add_type(&rec.sid, word_bit)?;
        }
        debug!("sid cache: added {} ({})", rec.sid, rec.url);
        Ok(())
    }

    /// Fetch one record.
    pub fn get(&self, sid: &Sid) -> Result<ServerRecord> {
        let raw = self.primary.get(sid.as_bytes())?;
        decode_record(*sid, &raw)
    }

    /// Replace a record wholesale, keeping the secondary indexes aligned.
    pub fn update(&self, rec: &ServerRecord) -> Result<()> {
        let old = self.get(&rec.sid)?;
        for (i, &value) in old.attrs.iter().enumerate() {
            if value >= 0 {
                let _ = self.attr_index[i].del(&attr_key(value, &old.sid));
            }
        }
        self.primary.put(rec.sid.as_bytes(), &encode_record(rec))?;
        for (i, &value) in rec.attrs.iter().enumerate() {
            if value >= 0 {
                self.attr_index[i].put(&attr_key(value, &rec.sid), &[])?;
            }
        }
        Ok(())
    }

    /// Update only the attribute vector.
    pub fn update_attrs(&self, sid: &Sid, attrs: &[i32; SID_NUM_ATTR]) -> Result<()> {
        let mut rec = self.get(sid)?;
        rec.attrs = *attrs;
        self.update(&rec)
    }

    /// Update only the resolved transport address.
    pub fn update_bmi_addr(&self, sid: &Sid, bmi_addr: i64) -> Result<()> {
        let mut rec = self.get(sid)?;
        rec.bmi_addr = bmi_addr;
        self.primary.put(sid.as_bytes(), &encode_record(&rec))
    }

    /// Update only the URL, clearing any stale resolved address.
    pub fn update_url(&self, sid: &Sid, url: &str) -> Result<()> {
        let mut rec = self.get(sid)?;
        rec.url = url.to_string();
        rec.bmi_addr = 0;
        self.primary.put(sid.as_bytes(), &encode_record(&rec))
    }

    /// Remove a server and every index entry that references it.
    pub fn delete(&self, sid: &Sid) -> Result<()> {
        let rec = self.get(sid)?;
        for (i, &value) in rec.attrs.iter().enumerate() {
            if value >= 0 {
                let _ = self.attr_index[i].del(&attr_key(value, sid));
            }
        }
        for bit in iter_bits(self.types_of(sid)?) {
            let _ = self.type_table.del(&type_key(bit.bits(), sid));
            let _ = self.type_index.del(&type_index_key(sid, bit.bits()));
        }
        self.primary.del(sid.as_bytes())?;
        debug!("sid cache: deleted {sid}");
        Ok(())
    }

    /// Number of cataloged servers.
    pub fn count(&self) -> usize {
        self.primary.record_count()
    }

    /// Record a role for a server.
    pub fn add_type(&self, sid: &Sid, bit: ServerTypes) -> Result<()> {
        if !valid_types().contains(bit) || bit.bits().count_ones() != 1 {
            return Err(Error::BadArg("not a single valid type bit"));
        }
        self.type_table.put(&type_key(bit.bits(), sid), &[])?;
        self.type_index.put(&type_index_key(sid, bit.bits()), &[])?;
        Ok(())
    }

    /// Every role recorded for `sid`.
    pub fn types_of(&self, sid: &Sid) -> Result<ServerTypes> {
        let mut out = ServerTypes::empty();
        let mut cursor = self.type_index.cursor();
        let mut probe = sid.as_bytes().to_vec();
        probe.extend_from_slice(&0u32.to_be_bytes());
        let mut op = CursorOp::SetRange;
        loop {
            let (key, _) = match cursor.step(op, &probe) {
                Ok(kv) => kv,
                Err(Error::NotFound) => break,
                Err(other) => return Err(other),
            };
            op = CursorOp::Next;
            if key.len() != 20 || &key[..16] != sid.as_bytes() {
                break;
            }
            let bits = u32::from_be_bytes(key[16..20].try_into().expect("sized slice"));
            out |= ServerTypes::from_bits_truncate(bits);
        }
        Ok(out)
    }

    /// All servers holding a role, ascending by SID.
    pub fn servers_of_type(&self, bit: ServerTypes) -> Result<Vec<Sid>> {
        let mut out = Vec::new();
        let mut cursor = self.type_table.cursor();
        let probe = type_key(bit.bits(), &Sid::NULL);
        let mut op = CursorOp::SetRange;
        loop {
            let (key, _) = match cursor.step(op, &probe) {
                Ok(kv) => kv,
                Err(Error::NotFound) => break,
                Err(other) => return Err(other),
            };
            op = CursorOp::Next;
            if key.len() != 20
                || u32::from_be_bytes(key[..4].try_into().expect("sized slice")) != bit.bits()
            {
                break;
            }
            out.push(sid_from_suffix(&key[4..])?);
        }
        Ok(out)
    }

    /// First server of a role, with its record.
    pub fn get_server_first(&self, bit: ServerTypes) -> Result<ServerRecord> {
        let sids = self.servers_of_type(bit)?;
        match sids.first() {
            Some(sid) => self.get(sid),
            None => Err(Error::NotFound),
        }
    }

    /// Next server of a role after `prev`, with its record.
    pub fn get_server_next(&self, bit: ServerTypes, prev: &Sid) -> Result<ServerRecord> {
        let sids = self.servers_of_type(bit)?;
        match sids.iter().find(|s| *s > prev) {
            Some(sid) => self.get(sid),
            None => Err(Error::NotFound),
        }
    }

    /// SIDs whose attribute `attr` equals `value`, ascending.
    pub fn sids_with_attr(&self, attr: usize, value: i32) -> Result<Vec<Sid>> {
        if attr >= SID_NUM_ATTR {
            return Err(Error::BadArg("attribute index out of range"));
        }
        let mut out = Vec::new();
        let mut cursor = self.attr_index[attr].cursor();
        let probe = attr_key(value, &Sid::NULL);
        let mut op = CursorOp::SetRange;
        loop {
            let (key, _) = match cursor.step(op, &probe) {
                Ok(kv) => kv,
                Err(Error::NotFound) => break,
                Err(other) => return Err(other),
            };
            op = CursorOp::Next;
            if key.len() != 20 || key[..4] != attr_key(value, &Sid::NULL)[..4] {
                break;
            }
            out.push(sid_from_suffix(&key[4..])?);
        }
        Ok(out)
    }

    /// Every record, ascending by SID.
    pub fn all_records(&self) -> Result<Vec<ServerRecord>> {
        let mut out = Vec::new();
        let mut cursor = self.primary.cursor();
        let mut op = CursorOp::First;
        loop {
            let (key, value) = match cursor.step(op, &[]) {
                Ok(kv) => kv,
                Err(Error::NotFound) => break,
                Err(other) => return Err(other),
            };
            op = CursorOp::Next;
            let sid = sid_from_suffix(&key)?;
            out.push(decode_record(sid, &value)?);
        }
        Ok(out)
    }

    /// Transport address for `sid`, resolving and writing back the URL on
    /// first use.
    pub fn get_addr(&self, sid: &Sid, resolver: &dyn Resolver) -> Result<i64> {
        let rec = self.get(sid)?;
        if rec.bmi_addr != 0 {
            return Ok(rec.bmi_addr);
        }
        let addr = resolver.resolve(&rec.url)?;
        self.update_bmi_addr(sid, addr)?;
        debug!("sid cache: resolved {} -> {addr}", rec.url);
        Ok(addr)
    }

    /// Install the policy used for `tag`.
    pub fn set_policy(&self, tag: PolicyTag, policy: Policy) {
        self.policies.lock().insert(tag, Arc::new(policy));
    }

    /// The policy installed for `tag`.
    pub fn policy(&self, tag: PolicyTag) -> Arc<Policy> {
        self.policies
            .lock()
            .get(&tag)
            .cloned()
            .unwrap_or_else(|| Arc::new(Policy::default_meta()))
    }
}

fn iter_bits(types: ServerTypes) -> impl Iterator<Item = ServerTypes> {
    ServerTypes::all()
        .iter()
        .filter(move |bit| types.contains(*bit))
}
