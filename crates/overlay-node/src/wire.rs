use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use futures::AsyncRead;
use futures::AsyncReadExt;
use futures::AsyncWrite;
use futures::AsyncWriteExt;
use prost::Message;

/// Upper bound on a single stream payload. Streams carrying more than this
/// are refused before decoding.
pub const MAX_TRANSFER_BYTES: usize = 16 * 1024 * 1024;

/// Artifact bytes sent back to a requesting peer over an `image-transfer`
/// stream. `id` is the artifact identifier the bytes answer.
#[derive(Clone, PartialEq, Message)]
pub struct ImageTransfer {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
}

/// A user public key sent back over a `key-transfer` stream. `id` is the
/// wallet address, `key` the RSA public key in JWK form.
#[derive(Clone, PartialEq, Message)]
pub struct KeyTransfer {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub key: String,
}

/// An addressed message broadcast on the `inbox` topic.
#[derive(Clone, PartialEq, Message)]
pub struct InboxMessage {
    #[prost(string, tag = "1")]
    pub user: String,
    #[prost(string, tag = "2")]
    pub sender: String,
    #[prost(string, tag = "3")]
    pub message: String,
    #[prost(int64, tag = "4")]
    pub timestamp: i64,
    #[prost(string, tag = "5")]
    pub message_id: String,
}

/// Delivery acknowledgement returned over an `inbox-ack` stream.
#[derive(Clone, PartialEq, Message)]
pub struct InboxAck {
    #[prost(bool, tag = "1")]
    pub received: bool,
    #[prost(string, tag = "2")]
    pub message_id: String,
}

/// Writes a single length-delimited message and closes the stream.
pub async fn write_message<M, S>(stream: &mut S, message: &M) -> Result<()>
where
    M: Message,
    S: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(message.encoded_len() + 8);
    message
        .encode_length_delimited(&mut buf)
        .context("Failed to encode message")?;

    stream
        .write_all(&buf)
        .await
        .context("Failed to write message")?;
    stream.close().await.context("Failed to close stream")?;

    Ok(())
}

/// Reads the stream to EOF and decodes a single length-delimited message.
///
/// Refuses streams carrying more than `max_bytes`.
pub async fn read_message<M, S>(stream: &mut S, max_bytes: usize) -> Result<M>
where
    M: Message + Default,
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    stream
        .take(max_bytes as u64 + 1)
        .read_to_end(&mut buf)
        .await
        .context("Failed to read stream")?;

    if buf.len() > max_bytes {
        bail!("Stream exceeds the {max_bytes} byte limit");
    }

    let message = M::decode_length_delimited(buf.as_slice()).context("Failed to decode message")?;

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::io::Cursor;

    #[tokio::test]
    async fn round_trips_a_transfer_over_a_stream() {
        let transfer = ImageTransfer {
            id: "wallet:post:1".to_string(),
            data: vec![0xde, 0xad, 0xbe, 0xef],
        };

        let mut stream = Cursor::new(Vec::new());
        write_message(&mut stream, &transfer).await.unwrap();

        let mut stream = Cursor::new(stream.into_inner());
        let decoded = read_message::<ImageTransfer, _>(&mut stream, MAX_TRANSFER_BYTES)
            .await
            .unwrap();

        assert_eq!(decoded, transfer);
    }

    #[tokio::test]
    async fn refuses_oversized_streams() {
        let transfer = ImageTransfer {
            id: "w:p:1".to_string(),
            data: vec![0u8; 4096],
        };

        let mut stream = Cursor::new(Vec::new());
        write_message(&mut stream, &transfer).await.unwrap();

        let mut stream = Cursor::new(stream.into_inner());
        let result = read_message::<ImageTransfer, _>(&mut stream, 1024).await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn refuses_garbage() {
        let mut stream = Cursor::new(vec![0xff; 32]);
        let result = read_message::<InboxAck, _>(&mut stream, MAX_TRANSFER_BYTES).await;

        assert!(result.is_err());
    }
}
