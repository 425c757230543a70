use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::SocketError;

/// Largest body accepted from a peer.
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

const HEADER: usize = 4;

/// One message on the wire: `[len: u32][context: u32][body]`, where `len` covers context and body.
///
/// The context correlates a reply with its request, publications use context zero.
#[derive(Debug)]
pub(crate) struct Frame {
    pub context: u32,
    pub body: Vec<u8>,
}

pub(crate) async fn read_frame<R>(reader: &mut R) -> Result<Frame, SocketError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if len < HEADER {
        return Err(SocketError::Transport(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame shorter than header",
        )));
    }
    let size = len - HEADER;
    if size > MAX_FRAME {
        return Err(SocketError::FrameTooLarge { size });
    }

    let context = reader.read_u32().await?;
    let mut body = vec![0; size];
    reader.read_exact(&mut body).await?;
    Ok(Frame { context, body })
}

pub(crate) async fn write_frame<W>(writer: &mut W, context: u32, body: &[u8]) -> Result<(), SocketError>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > MAX_FRAME {
        return Err(SocketError::FrameTooLarge { size: body.len() });
    }
    writer.write_u32((body.len() + HEADER) as u32).await?;
    writer.write_u32(context).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_that_frame_survives_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_frame(&mut client, 7, b"{\"task\":\"get\"}").await.unwrap();
        let frame = read_frame(&mut server).await.unwrap();

        assert_eq!(frame.context, 7);
        assert_eq!(frame.body, b"{\"task\":\"get\"}");
    }

    #[tokio::test]
    async fn test_that_oversized_length_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        client.write_u32((MAX_FRAME + HEADER + 1) as u32).await.unwrap();
        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, SocketError::FrameTooLarge { .. }));
    }
}
