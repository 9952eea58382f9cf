use crate::encoding::base64;
use crate::support::{ChannelId, LinkAddress, PackageId};
use serde_derive::{Deserialize, Serialize};

// Control messages the runtime multiplexes over a channel are framed as a
// fixed-length package id prefix followed by a UTF-8 JSON object. Hellos are
// framed with a zero prefix (the real package id travels base64-encoded
// inside the envelope); responses are framed with the real package id so
// the peer's registration catches them.

/// Hello envelope for `dial` and `send_receive`. Carries the caller's
/// receive link, the channel the reply is expected on, the package id
/// replies must be tagged with, and the first user payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloEnvelope {
    #[serde(rename = "packageId")]
    pub package_id: String,
    #[serde(rename = "linkAddress")]
    pub link_address: LinkAddress,
    #[serde(rename = "replyChannel")]
    pub reply_channel: ChannelId,
    pub message: String,
}

impl HelloEnvelope {
    #[inline]
    pub fn new(
        package_id: PackageId,
        link_address: &str,
        reply_channel: &str,
        message: &[u8],
    ) -> HelloEnvelope {
        HelloEnvelope {
            package_id: base64::encode(package_id.as_bytes()),
            link_address: link_address.into(),
            reply_channel: reply_channel.into(),
            message: base64::encode(message),
        }
    }

    #[inline]
    pub fn package_id(&self) -> Option<PackageId> {
        decode_package_id(&self.package_id)
    }

    #[inline]
    pub fn message_bytes(&self) -> Option<Vec<u8>> {
        base64::decode(&self.message).ok()
    }
}

/// Bootstrap hello. In addition to the package id and first payload it may
/// carry link addresses for the legs the recipient is expected to load;
/// field names are relative to the recipient.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootstrapEnvelope {
    #[serde(rename = "packageId")]
    pub package_id: String,
    #[serde(rename = "message", default)]
    pub message: String,
    #[serde(rename = "initSendLinkAddress", skip_serializing_if = "Option::is_none")]
    pub init_send_link_address: Option<LinkAddress>,
    #[serde(rename = "initSendChannel", skip_serializing_if = "Option::is_none")]
    pub init_send_channel: Option<ChannelId>,
    #[serde(rename = "finalRecvLinkAddress", skip_serializing_if = "Option::is_none")]
    pub final_recv_link_address: Option<LinkAddress>,
    #[serde(rename = "finalRecvChannel", skip_serializing_if = "Option::is_none")]
    pub final_recv_channel: Option<ChannelId>,
    #[serde(rename = "finalSendLinkAddress", skip_serializing_if = "Option::is_none")]
    pub final_send_link_address: Option<LinkAddress>,
    #[serde(rename = "finalSendChannel", skip_serializing_if = "Option::is_none")]
    pub final_send_channel: Option<ChannelId>,
}

impl BootstrapEnvelope {
    #[inline]
    pub fn package_id(&self) -> Option<PackageId> {
        decode_package_id(&self.package_id)
    }

    #[inline]
    pub fn message_bytes(&self) -> Option<Vec<u8>> {
        base64::decode(&self.message).ok()
    }
}

#[inline]
fn decode_package_id(encoded: &str) -> Option<PackageId> {
    let bytes = base64::decode(encoded).ok()?;
    PackageId::from_prefix(&bytes)
}

/// Prefixes `payload` with the supplied tag.
#[inline]
pub fn frame(package_id: PackageId, payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(package_id.as_bytes().len() + payload.len());
    framed.extend_from_slice(package_id.as_bytes());
    framed.extend_from_slice(payload);
    framed
}

/// Serializes an envelope behind the given prefix tag.
#[inline]
pub fn frame_envelope<E: serde::Serialize>(package_id: PackageId, envelope: &E) -> Vec<u8> {
    let json = serde_json::to_vec(envelope).expect("Envelope serialization failed");
    frame(package_id, &json)
}

/// Parses an envelope out of an unframed JSON payload.
#[inline]
pub fn parse_envelope<'a, E: serde::Deserialize<'a>>(payload: &'a [u8]) -> Option<E> {
    serde_json::from_slice(payload).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PACKAGE_ID_LEN;

    #[test]
    fn test_hello_round_trip() {
        let id = PackageId::new([9; PACKAGE_ID_LEN]);
        let hello = HelloEnvelope::new(id, "linkAddr", "replyChannel", b"payload");

        let framed = frame_envelope(PackageId::zero(), &hello);
        assert_eq!(&framed[..PACKAGE_ID_LEN], &[0; PACKAGE_ID_LEN]);

        let parsed: HelloEnvelope = parse_envelope(&framed[PACKAGE_ID_LEN..]).unwrap();
        assert_eq!(parsed.package_id(), Some(id));
        assert_eq!(parsed.link_address, "linkAddr");
        assert_eq!(parsed.reply_channel, "replyChannel");
        assert_eq!(parsed.message_bytes().unwrap(), b"payload");
    }

    #[test]
    fn test_bootstrap_envelope_omits_absent_legs() {
        let envelope = BootstrapEnvelope {
            package_id: crate::encoding::base64::encode([3u8; PACKAGE_ID_LEN]),
            message: crate::encoding::base64::encode(b"hi"),
            final_recv_link_address: Some("addr".into()),
            final_recv_channel: Some("chan".into()),
            ..Default::default()
        };

        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("finalRecvLinkAddress"));
        assert!(!json.contains("initSendLinkAddress"));

        let parsed: BootstrapEnvelope = parse_envelope(json.as_bytes()).unwrap();
        assert_eq!(parsed.final_recv_link_address.as_deref(), Some("addr"));
        assert_eq!(parsed.message_bytes().unwrap(), b"hi");
    }

    #[test]
    fn test_parse_rejects_non_json() {
        assert!(parse_envelope::<HelloEnvelope>(b"not json").is_none());
    }
}
