use std::fmt;
use std::str::FromStr;

pub mod content;
pub mod correlator;
pub mod group_key;
pub mod inbox;
pub mod node;
pub mod storage;
pub mod wire;

pub use libp2p::Multiaddr;
pub use libp2p::PeerId;
pub use libp2p::StreamProtocol;

/// Broadcast topic on which nodes ask the overlay for artifacts they do not
/// hold locally. The payload is the artifact identifier as raw UTF-8.
pub const CONTENT_NEED_TOPIC: &str = "content-need";

/// Broadcast topic for addressed inbox messages awaiting a direct
/// acknowledgement stream.
pub const INBOX_TOPIC: &str = "inbox";

pub const IMAGE_TRANSFER_PROTOCOL: StreamProtocol =
    StreamProtocol::new("/haven/image-transfer/1.0.0");
pub const KEY_TRANSFER_PROTOCOL: StreamProtocol = StreamProtocol::new("/haven/key-transfer/1.0.0");
pub const INBOX_ACK_PROTOCOL: StreamProtocol = StreamProtocol::new("/haven/inbox-ack/1.0.0");

/// Identifier of an artifact as routed on the overlay: `wallet:postId:localId`.
///
/// `wallet` is the uploader's ledger address, `post_id` the logical post
/// reference on the external ledger and `local_id` the integer assigned by the
/// uploader's node at store time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactId {
    pub wallet: String,
    pub post_id: String,
    pub local_id: i64,
}

#[derive(Debug, thiserror::Error)]
#[error("malformed artifact id: {0}")]
pub struct ParseArtifactIdError(String);

impl FromStr for ArtifactId {
    type Err = ParseArtifactIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let (Some(wallet), Some(post_id), Some(local_id), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ParseArtifactIdError(s.to_string()));
        };

        if wallet.is_empty() || post_id.is_empty() {
            return Err(ParseArtifactIdError(s.to_string()));
        }

        let local_id = local_id
            .parse::<i64>()
            .map_err(|_| ParseArtifactIdError(s.to_string()))?;

        Ok(Self {
            wallet: wallet.to_string(),
            post_id: post_id.to_string(),
            local_id,
        })
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.wallet, self.post_id, self.local_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_id() {
        let id = "wAllEt123:post-9:42".parse::<ArtifactId>().unwrap();

        assert_eq!(id.wallet, "wAllEt123");
        assert_eq!(id.post_id, "post-9");
        assert_eq!(id.local_id, 42);
        assert_eq!(id.to_string(), "wAllEt123:post-9:42");
    }

    #[test]
    fn rejects_malformed_ids() {
        for raw in [
            "",
            "wallet",
            "wallet:post",
            "wallet:post:one",
            "wallet:post:1:extra",
            ":post:1",
            "wallet::1",
        ] {
            assert!(raw.parse::<ArtifactId>().is_err(), "accepted {raw:?}");
        }
    }
}
