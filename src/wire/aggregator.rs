//! Codec for the aggregator<->solver protocol.

use crate::types::{Sample, Subscription, SubscriptionRule, Transmitter};
use crate::wire::buffer::{WireError, WireReader, WireWriter};

/// Fixed handshake pattern; both peers send it and expect the echo.
pub const HANDSHAKE: &[u8; 16] = b"GRAIL aggregator";

pub mod tag {
    pub const KEEP_ALIVE: u8 = 0;
    pub const SUBSCRIPTION_REQUEST: u8 = 1;
    pub const SUBSCRIPTION_RESPONSE: u8 = 2;
    pub const SERVER_SAMPLE: u8 = 3;
}

pub fn make_handshake_msg() -> Vec<u8> {
    HANDSHAKE.to_vec()
}

pub fn encode_keep_alive() -> Vec<u8> {
    WireWriter::tagged(tag::KEEP_ALIVE).into_body()
}

fn put_subscription(w: &mut WireWriter, sub: &Subscription) {
    w.put_u8(sub.physical_layer);
    w.put_u32(sub.rules.len() as u32);
    for rule in &sub.rules {
        w.put_u32(rule.transmitters.len() as u32);
        for tx in &rule.transmitters {
            w.put_u64(tx.base_id);
            w.put_u64(tx.mask);
        }
        w.put_u64(rule.update_interval);
    }
}

fn read_subscription(r: &mut WireReader<'_>) -> Result<Subscription, WireError> {
    let physical_layer = r.u8("physical_layer")?;
    let rule_count = r.u32("rule_count")?;
    let mut rules = Vec::with_capacity(rule_count as usize);
    for _ in 0..rule_count {
        let tx_count = r.u32("tx_count")?;
        let mut transmitters = Vec::with_capacity(tx_count as usize);
        for _ in 0..tx_count {
            transmitters.push(Transmitter {
                base_id: r.u64("base_id")?,
                mask: r.u64("mask")?,
            });
        }
        let update_interval = r.u64("update_interval")?;
        rules.push(SubscriptionRule {
            transmitters,
            update_interval,
        });
    }
    Ok(Subscription {
        physical_layer,
        rules,
    })
}

pub fn encode_subscription_request(sub: &Subscription) -> Vec<u8> {
    let mut w = WireWriter::tagged(tag::SUBSCRIPTION_REQUEST);
    put_subscription(&mut w, sub);
    w.into_body()
}

/// Used by aggregator-side test fixtures; the response body mirrors the
/// request with the server's possibly adjusted rule set.
pub fn encode_subscription_response(sub: &Subscription) -> Vec<u8> {
    let mut w = WireWriter::tagged(tag::SUBSCRIPTION_RESPONSE);
    put_subscription(&mut w, sub);
    w.into_body()
}

pub fn decode_subscription_request(body: &[u8]) -> Result<Subscription, WireError> {
    let mut r = WireReader::new(body);
    r.expect_tag(tag::SUBSCRIPTION_REQUEST)?;
    let sub = read_subscription(&mut r)?;
    r.finish()?;
    Ok(sub)
}

pub fn decode_subscription_response(body: &[u8]) -> Result<Subscription, WireError> {
    let mut r = WireReader::new(body);
    r.expect_tag(tag::SUBSCRIPTION_RESPONSE)?;
    let sub = read_subscription(&mut r)?;
    r.finish()?;
    Ok(sub)
}

pub fn encode_sample(sample: &Sample) -> Vec<u8> {
    let mut w = WireWriter::tagged(tag::SERVER_SAMPLE);
    w.put_u8(sample.physical_layer);
    w.put_u64(sample.tx_id);
    w.put_u64(sample.rx_id);
    w.put_i64(sample.rx_timestamp);
    w.put_f32(sample.rss);
    w.put_bool(sample.valid);
    w.put_bytes(&sample.sense_data);
    w.into_body()
}

pub fn decode_sample(body: &[u8]) -> Result<Sample, WireError> {
    let mut r = WireReader::new(body);
    r.expect_tag(tag::SERVER_SAMPLE)?;
    let sample = Sample {
        physical_layer: r.u8("physical_layer")?,
        tx_id: r.u64("tx_id")?,
        rx_id: r.u64("rx_id")?,
        rx_timestamp: r.i64("rx_timestamp")?,
        rss: r.f32("rss")?,
        valid: r.bool("valid")?,
        sense_data: r.bytes("sense_data")?,
    };
    r.finish()?;
    Ok(sample)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn subscription_roundtrip() {
        let sub = Subscription {
            physical_layer: 1,
            rules: vec![SubscriptionRule {
                transmitters: vec![Transmitter {
                    base_id: 0xdead_beef,
                    mask: u64::MAX,
                }],
                update_interval: 500,
            }],
        };
        let body = encode_subscription_request(&sub);
        assert_eq!(decode_subscription_request(&body).unwrap(), sub);
    }

    #[test]
    fn sample_roundtrip_keeps_validity() {
        let sample = Sample {
            physical_layer: 1,
            tx_id: 42,
            rx_id: 7,
            rx_timestamp: 1_700_000_000_000,
            rss: -71.5,
            valid: false,
            sense_data: Bytes::from_static(&[0xab, 0xcd]),
        };
        let body = encode_sample(&sample);
        assert_eq!(decode_sample(&body).unwrap(), sample);
    }

    #[test]
    fn sample_decoder_rejects_wrong_tag() {
        let body = encode_keep_alive();
        assert!(matches!(
            decode_sample(&body),
            Err(WireError::UnexpectedTag { .. })
        ));
    }
}
