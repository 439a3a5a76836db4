//! Newline-delimited framing over TCP.
//!
//! Each connection is split into a [`LineReader`] and a [`LineWriter`].
//! A message is exactly one line, so a single `send` never interleaves with
//! another as long as each socket has one writer.

use futures_util::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use crate::error::ProtocolError;
use crate::protocol::WireMessage;

/// Longest accepted line. Anything longer ends the connection.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

pub type LineReader = FramedRead<OwnedReadHalf, LinesCodec>;
pub type LineWriter = FramedWrite<OwnedWriteHalf, LinesCodec>;

/// Split a stream into line-framed halves.
pub fn split(stream: TcpStream) -> (LineReader, LineWriter) {
    let (read_half, write_half) = stream.into_split();
    (
        FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_BYTES)),
        FramedWrite::new(write_half, LinesCodec::new_with_max_length(MAX_LINE_BYTES)),
    )
}

/// Next non-blank line, or `None` once the peer closes the stream.
pub async fn next_line(reader: &mut LineReader) -> Result<Option<String>, ProtocolError> {
    while let Some(line) = reader.next().await {
        let line = line?;
        if !line.trim().is_empty() {
            return Ok(Some(line));
        }
    }
    Ok(None)
}

/// Next line that decodes as `T`.
///
/// Lines that fail to decode are logged and skipped; the connection stays
/// open.
pub async fn next_message<T: WireMessage>(
    reader: &mut LineReader,
) -> Result<Option<T>, ProtocolError> {
    while let Some(line) = next_line(reader).await? {
        match T::decode(&line) {
            Ok(msg) => return Ok(Some(msg)),
            Err(e) => log::debug!("Dropping malformed line: {e}"),
        }
    }
    Ok(None)
}

/// Encode and write one message.
pub async fn send_message<T: WireMessage>(
    writer: &mut LineWriter,
    msg: &T,
) -> Result<(), ProtocolError> {
    let line = msg.encode()?;
    writer.send(line).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ClientMessage, ServerMessage};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let (mut raw, server_side) = pair().await;
        let (mut reader, _writer) = split(server_side);

        raw.write_all(b"garbage\n\n{\"type\":\"CHOICE\"}\n{\"type\":\"PING\"}\n")
            .await
            .unwrap();

        let msg = next_message::<ClientMessage>(&mut reader).await.unwrap();
        assert_eq!(msg, Some(ClientMessage::Ping));
    }

    #[tokio::test]
    async fn test_many_messages_on_one_connection() {
        let (client, server_side) = pair().await;
        let (_r, mut writer) = split(server_side);
        let (mut reader, _w) = split(client);

        for id in 1..=3 {
            send_message(&mut writer, &ServerMessage::AssignId { id }).await.unwrap();
        }
        for id in 1..=3 {
            let msg = next_message::<ServerMessage>(&mut reader).await.unwrap();
            assert_eq!(msg, Some(ServerMessage::AssignId { id }));
        }
    }

    #[tokio::test]
    async fn test_clean_close_yields_none() {
        let (client, server_side) = pair().await;
        let (mut reader, _w) = split(server_side);
        drop(client);

        assert!(next_line(&mut reader).await.unwrap().is_none());
    }
}
