//! Codec for the solver<->world-model protocol.

use bytes::Bytes;

use crate::types::{GrailTime, Uri};
use crate::wire::buffer::{WireError, WireReader, WireWriter};

pub const HANDSHAKE: &[u8; 16] = b"GRAIL solver wm.";

pub mod tag {
    pub const KEEP_ALIVE: u8 = 0;
    pub const TYPE_ANNOUNCE: u8 = 1;
    pub const START_ON_DEMAND: u8 = 2;
    pub const STOP_ON_DEMAND: u8 = 3;
    pub const SOLVER_DATA: u8 = 4;
    pub const CREATE_URI: u8 = 5;
    pub const EXPIRE_URI: u8 = 6;
    pub const DELETE_URI: u8 = 7;
    pub const EXPIRE_ATTRIBUTE: u8 = 8;
    pub const DELETE_ATTRIBUTE: u8 = 9;
}

/// A registered attribute type and its wire alias. Aliases are assigned by
/// the solver, starting at 1; alias 0 is never issued.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AliasType {
    pub alias: u32,
    pub name: String,
    pub on_demand: bool,
}

/// One attribute update as transmitted, with the type name replaced by its
/// alias.
#[derive(Clone, Debug, PartialEq)]
pub struct SolutionData {
    pub alias: u32,
    pub time: GrailTime,
    pub target: Uri,
    pub data: Bytes,
}

/// `(alias, patterns)` pairs carried by start/stop on-demand messages.
pub type OnDemandRequest = (u32, Vec<String>);

pub fn make_handshake_msg() -> Vec<u8> {
    HANDSHAKE.to_vec()
}

pub fn encode_keep_alive() -> Vec<u8> {
    WireWriter::tagged(tag::KEEP_ALIVE).into_body()
}

pub fn encode_type_announce(types: &[AliasType], origin: &str) -> Vec<u8> {
    let mut w = WireWriter::tagged(tag::TYPE_ANNOUNCE);
    w.put_utf16(origin);
    w.put_u32(types.len() as u32);
    for at in types {
        w.put_u32(at.alias);
        w.put_utf16(&at.name);
        w.put_bool(at.on_demand);
    }
    w.into_body()
}

pub fn decode_type_announce(body: &[u8]) -> Result<(Vec<AliasType>, String), WireError> {
    let mut r = WireReader::new(body);
    r.expect_tag(tag::TYPE_ANNOUNCE)?;
    let origin = r.utf16("origin")?;
    let count = r.u32("type_count")?;
    let mut types = Vec::with_capacity(count as usize);
    for _ in 0..count {
        types.push(AliasType {
            alias: r.u32("alias")?,
            name: r.utf16("type_name")?,
            on_demand: r.bool("on_demand")?,
        });
    }
    r.finish()?;
    Ok((types, origin))
}

pub fn encode_solver_data(create_uris: bool, solutions: &[SolutionData]) -> Vec<u8> {
    let mut w = WireWriter::tagged(tag::SOLVER_DATA);
    w.put_bool(create_uris);
    w.put_u32(solutions.len() as u32);
    for sd in solutions {
        w.put_u32(sd.alias);
        w.put_i64(sd.time);
        w.put_utf16(&sd.target);
        w.put_bytes(&sd.data);
    }
    w.into_body()
}

pub fn decode_solver_data(body: &[u8]) -> Result<(bool, Vec<SolutionData>), WireError> {
    let mut r = WireReader::new(body);
    r.expect_tag(tag::SOLVER_DATA)?;
    let create_uris = r.bool("create_uris")?;
    let count = r.u32("solution_count")?;
    let mut solutions = Vec::with_capacity(count as usize);
    for _ in 0..count {
        solutions.push(SolutionData {
            alias: r.u32("alias")?,
            time: r.i64("time")?,
            target: r.utf16("target")?,
            data: r.bytes("data")?,
        });
    }
    r.finish()?;
    Ok((create_uris, solutions))
}

fn encode_on_demand(msg_tag: u8, requests: &[OnDemandRequest]) -> Vec<u8> {
    let mut w = WireWriter::tagged(msg_tag);
    w.put_u32(requests.len() as u32);
    for (alias, patterns) in requests {
        w.put_u32(*alias);
        w.put_u32(patterns.len() as u32);
        for pattern in patterns {
            w.put_utf16(pattern);
        }
    }
    w.into_body()
}

fn decode_on_demand(msg_tag: u8, body: &[u8]) -> Result<Vec<OnDemandRequest>, WireError> {
    let mut r = WireReader::new(body);
    r.expect_tag(msg_tag)?;
    let count = r.u32("request_count")?;
    let mut requests = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let alias = r.u32("alias")?;
        let pattern_count = r.u32("pattern_count")?;
        let mut patterns = Vec::with_capacity(pattern_count as usize);
        for _ in 0..pattern_count {
            patterns.push(r.utf16("pattern")?);
        }
        requests.push((alias, patterns));
    }
    r.finish()?;
    Ok(requests)
}

pub fn encode_start_on_demand(requests: &[OnDemandRequest]) -> Vec<u8> {
    encode_on_demand(tag::START_ON_DEMAND, requests)
}

pub fn decode_start_on_demand(body: &[u8]) -> Result<Vec<OnDemandRequest>, WireError> {
    decode_on_demand(tag::START_ON_DEMAND, body)
}

pub fn encode_stop_on_demand(requests: &[OnDemandRequest]) -> Vec<u8> {
    encode_on_demand(tag::STOP_ON_DEMAND, requests)
}

pub fn decode_stop_on_demand(body: &[u8]) -> Result<Vec<OnDemandRequest>, WireError> {
    decode_on_demand(tag::STOP_ON_DEMAND, body)
}

pub fn encode_create_uri(uri: &str, created: GrailTime, origin: &str) -> Vec<u8> {
    let mut w = WireWriter::tagged(tag::CREATE_URI);
    w.put_utf16(uri);
    w.put_i64(created);
    w.put_utf16(origin);
    w.into_body()
}

pub fn encode_expire_uri(uri: &str, expires: GrailTime, origin: &str) -> Vec<u8> {
    let mut w = WireWriter::tagged(tag::EXPIRE_URI);
    w.put_utf16(uri);
    w.put_i64(expires);
    w.put_utf16(origin);
    w.into_body()
}

pub fn encode_delete_uri(uri: &str, origin: &str) -> Vec<u8> {
    let mut w = WireWriter::tagged(tag::DELETE_URI);
    w.put_utf16(uri);
    w.put_utf16(origin);
    w.into_body()
}

pub fn encode_expire_attribute(
    uri: &str,
    name: &str,
    origin: &str,
    expires: GrailTime,
) -> Vec<u8> {
    let mut w = WireWriter::tagged(tag::EXPIRE_ATTRIBUTE);
    w.put_utf16(uri);
    w.put_utf16(name);
    w.put_utf16(origin);
    w.put_i64(expires);
    w.into_body()
}

pub fn encode_delete_attribute(uri: &str, name: &str, origin: &str) -> Vec<u8> {
    let mut w = WireWriter::tagged(tag::DELETE_ATTRIBUTE);
    w.put_utf16(uri);
    w.put_utf16(name);
    w.put_utf16(origin);
    w.into_body()
}
