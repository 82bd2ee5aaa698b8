//! Codec for the client<->world-model protocol.

use bytes::Bytes;

use crate::types::{GrailTime, Request, Uri};
use crate::wire::buffer::{WireError, WireReader, WireWriter};

pub const HANDSHAKE: &[u8; 16] = b"GRAIL client wm.";

pub mod tag {
    pub const KEEP_ALIVE: u8 = 0;
    pub const SNAPSHOT_REQUEST: u8 = 1;
    pub const RANGE_REQUEST: u8 = 2;
    pub const STREAM_REQUEST: u8 = 3;
    pub const ATTRIBUTE_ALIAS: u8 = 4;
    pub const ORIGIN_ALIAS: u8 = 5;
    pub const REQUEST_COMPLETE: u8 = 6;
    pub const DATA_RESPONSE: u8 = 7;
}

/// `alias -> name` association announced by the world model.
pub type AliasEntry = (u32, String);

/// One attribute of a data response before alias resolution.
#[derive(Clone, Debug, PartialEq)]
pub struct AliasedAttribute {
    pub name_alias: u32,
    pub creation_date: GrailTime,
    pub expiration_date: GrailTime,
    pub origin_alias: u32,
    pub data: Bytes,
}

/// One object's worth of attributes in a data response.
#[derive(Clone, Debug, PartialEq)]
pub struct AliasedWorldData {
    pub object_uri: Uri,
    pub attributes: Vec<AliasedAttribute>,
}

pub fn make_handshake_msg() -> Vec<u8> {
    HANDSHAKE.to_vec()
}

pub fn encode_keep_alive() -> Vec<u8> {
    WireWriter::tagged(tag::KEEP_ALIVE).into_body()
}

fn encode_query(msg_tag: u8, request: &Request, ticket: u32) -> Vec<u8> {
    let mut w = WireWriter::tagged(msg_tag);
    w.put_u32(ticket);
    w.put_utf16(&request.object_uri);
    w.put_u32(request.attributes.len() as u32);
    for attr in &request.attributes {
        w.put_utf16(attr);
    }
    w.put_i64(request.start);
    w.put_i64(request.stop);
    w.into_body()
}

fn decode_query(msg_tag: u8, body: &[u8]) -> Result<(Request, u32), WireError> {
    let mut r = WireReader::new(body);
    r.expect_tag(msg_tag)?;
    let ticket = r.u32("ticket")?;
    let object_uri = r.utf16("object_uri")?;
    let count = r.u32("attribute_count")?;
    let mut attributes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        attributes.push(r.utf16("attribute")?);
    }
    let start = r.i64("start")?;
    let stop = r.i64("stop")?;
    r.finish()?;
    Ok((
        Request {
            object_uri,
            attributes,
            start,
            stop,
        },
        ticket,
    ))
}

pub fn encode_snapshot_request(request: &Request, ticket: u32) -> Vec<u8> {
    encode_query(tag::SNAPSHOT_REQUEST, request, ticket)
}

pub fn decode_snapshot_request(body: &[u8]) -> Result<(Request, u32), WireError> {
    decode_query(tag::SNAPSHOT_REQUEST, body)
}

pub fn encode_range_request(request: &Request, ticket: u32) -> Vec<u8> {
    encode_query(tag::RANGE_REQUEST, request, ticket)
}

pub fn decode_range_request(body: &[u8]) -> Result<(Request, u32), WireError> {
    decode_query(tag::RANGE_REQUEST, body)
}

/// Streaming queries reuse the request layout with `stop` carrying the
/// update interval.
pub fn encode_stream_request(request: &Request, ticket: u32) -> Vec<u8> {
    encode_query(tag::STREAM_REQUEST, request, ticket)
}

pub fn decode_stream_request(body: &[u8]) -> Result<(Request, u32), WireError> {
    decode_query(tag::STREAM_REQUEST, body)
}

fn encode_alias(msg_tag: u8, entries: &[AliasEntry]) -> Vec<u8> {
    let mut w = WireWriter::tagged(msg_tag);
    w.put_u32(entries.len() as u32);
    for (alias, name) in entries {
        w.put_u32(*alias);
        w.put_utf16(name);
    }
    w.into_body()
}

fn decode_alias(msg_tag: u8, body: &[u8]) -> Result<Vec<AliasEntry>, WireError> {
    let mut r = WireReader::new(body);
    r.expect_tag(msg_tag)?;
    let count = r.u32("alias_count")?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let alias = r.u32("alias")?;
        let name = r.utf16("name")?;
        entries.push((alias, name));
    }
    r.finish()?;
    Ok(entries)
}

pub fn encode_attribute_alias(entries: &[AliasEntry]) -> Vec<u8> {
    encode_alias(tag::ATTRIBUTE_ALIAS, entries)
}

pub fn decode_attribute_alias(body: &[u8]) -> Result<Vec<AliasEntry>, WireError> {
    decode_alias(tag::ATTRIBUTE_ALIAS, body)
}

pub fn encode_origin_alias(entries: &[AliasEntry]) -> Vec<u8> {
    encode_alias(tag::ORIGIN_ALIAS, entries)
}

pub fn decode_origin_alias(body: &[u8]) -> Result<Vec<AliasEntry>, WireError> {
    decode_alias(tag::ORIGIN_ALIAS, body)
}

pub fn encode_data_response(data: &AliasedWorldData, ticket: u32) -> Vec<u8> {
    let mut w = WireWriter::tagged(tag::DATA_RESPONSE);
    w.put_u32(ticket);
    w.put_utf16(&data.object_uri);
    w.put_u32(data.attributes.len() as u32);
    for attr in &data.attributes {
        w.put_u32(attr.name_alias);
        w.put_i64(attr.creation_date);
        w.put_i64(attr.expiration_date);
        w.put_u32(attr.origin_alias);
        w.put_bytes(&attr.data);
    }
    w.into_body()
}

pub fn decode_data_response(body: &[u8]) -> Result<(AliasedWorldData, u32), WireError> {
    let mut r = WireReader::new(body);
    r.expect_tag(tag::DATA_RESPONSE)?;
    let ticket = r.u32("ticket")?;
    let object_uri = r.utf16("object_uri")?;
    let count = r.u32("attribute_count")?;
    let mut attributes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        attributes.push(AliasedAttribute {
            name_alias: r.u32("name_alias")?,
            creation_date: r.i64("creation_date")?,
            expiration_date: r.i64("expiration_date")?,
            origin_alias: r.u32("origin_alias")?,
            data: r.bytes("data")?,
        });
    }
    r.finish()?;
    Ok((
        AliasedWorldData {
            object_uri,
            attributes,
        },
        ticket,
    ))
}

pub fn encode_request_complete(ticket: u32) -> Vec<u8> {
    let mut w = WireWriter::tagged(tag::REQUEST_COMPLETE);
    w.put_u32(ticket);
    w.into_body()
}

pub fn decode_request_complete(body: &[u8]) -> Result<u32, WireError> {
    let mut r = WireReader::new(body);
    r.expect_tag(tag::REQUEST_COMPLETE)?;
    let ticket = r.u32("ticket")?;
    r.finish()?;
    Ok(ticket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_roundtrip_carries_ticket() {
        let request = Request {
            object_uri: "building/.*".into(),
            attributes: vec!["location".into(), "temperature".into()],
            start: 0,
            stop: 1_700_000_000_000,
        };
        let body = encode_range_request(&request, 9);
        assert_eq!(decode_range_request(&body).unwrap(), (request, 9));
    }

    #[test]
    fn data_response_roundtrip() {
        let data = AliasedWorldData {
            object_uri: "room/7".into(),
            attributes: vec![AliasedAttribute {
                name_alias: 2,
                creation_date: 10,
                expiration_date: 0,
                origin_alias: 1,
                data: Bytes::from_static(b"xy"),
            }],
        };
        let body = encode_data_response(&data, 3);
        assert_eq!(decode_data_response(&body).unwrap(), (data, 3));
    }

    #[test]
    fn request_complete_roundtrip() {
        let body = encode_request_complete(11);
        assert_eq!(decode_request_complete(&body).unwrap(), 11);
    }
}
