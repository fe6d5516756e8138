//! Async frame I/O over the session transport.
//!
//! Every frame starts with the 4-byte prelude; the kind byte tells the
//! reader how many more bytes to expect. DATA frames carry `length` payload
//! bytes after the fixed header. Anything that fails to parse is a protocol
//! violation and tears the connection down — there is no resynchronization
//! inside a TCP stream.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zerocopy::{AsBytes, FromBytes};

use ringline_core::seq::Seq;
use ringline_core::wire::{
    AckFrame, FrameKind, GapFrame, Hello, HelloAck, Prelude, RecordHeader, WireError,
};
use ringline_store::Gap;

/// A parsed inbound frame.
#[derive(Debug)]
pub enum Frame {
    Hello(Hello),
    HelloAck(HelloAck),
    Data { header: RecordHeader, payload: Bytes },
    Ack { low: Seq, high: Seq },
    GapDeclare(Gap),
    GapAbandon(Gap),
    Heartbeat,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Wire(#[from] WireError),
}

/// Read one frame. `max_payload` bounds DATA allocations to the slot size.
pub async fn read_frame<R>(rd: &mut R, max_payload: usize) -> Result<Frame, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut prelude_buf = [0u8; 4];
    rd.read_exact(&mut prelude_buf).await?;
    let prelude = Prelude::read_from(&prelude_buf[..]).expect("prelude is 4 bytes");
    let kind = prelude.classify()?;

    match kind {
        FrameKind::Heartbeat => Ok(Frame::Heartbeat),

        FrameKind::Hello => {
            let hello = read_rest::<Hello, R>(rd, &prelude_buf).await?;
            Ok(Frame::Hello(hello))
        }

        FrameKind::HelloAck => {
            let ack = read_rest::<HelloAck, R>(rd, &prelude_buf).await?;
            Ok(Frame::HelloAck(ack))
        }

        FrameKind::Ack => {
            let ack = read_rest::<AckFrame, R>(rd, &prelude_buf).await?;
            Ok(Frame::Ack {
                low: Seq::new(ack.low),
                high: Seq::new(ack.high),
            })
        }

        FrameKind::GapDeclare | FrameKind::GapAbandon => {
            let gap = read_rest::<GapFrame, R>(rd, &prelude_buf).await?;
            let range = Gap::new(Seq::new(gap.start), Seq::new(gap.end));
            if kind == FrameKind::GapDeclare {
                Ok(Frame::GapDeclare(range))
            } else {
                Ok(Frame::GapAbandon(range))
            }
        }

        FrameKind::Data => {
            let header = read_rest::<RecordHeader, R>(rd, &prelude_buf).await?;
            let length = header.length as usize;
            if length > max_payload {
                return Err(WireError::PayloadTooLarge {
                    length,
                    record_size: max_payload,
                }
                .into());
            }
            let mut payload = vec![0u8; length];
            rd.read_exact(&mut payload).await?;
            Ok(Frame::Data {
                header,
                payload: Bytes::from(payload),
            })
        }
    }
}

/// Read the remainder of a fixed-size frame whose first 4 bytes are already
/// in hand, and parse the whole thing.
async fn read_rest<T, R>(rd: &mut R, prelude: &[u8; 4]) -> Result<T, FrameError>
where
    T: FromBytes,
    R: AsyncRead + Unpin,
{
    let size = std::mem::size_of::<T>();
    let mut buf = vec![0u8; size];
    buf[..4].copy_from_slice(prelude);
    rd.read_exact(&mut buf[4..]).await?;
    Ok(T::read_from(&buf[..]).expect("exact-size read"))
}

/// Write any fixed-size frame struct.
pub async fn write_frame<W, T>(wr: &mut W, frame: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: AsBytes,
{
    wr.write_all(frame.as_bytes()).await
}

/// Write a DATA frame: header then payload.
pub async fn write_record<W>(
    wr: &mut W,
    header: &RecordHeader,
    payload: &[u8],
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    wr.write_all(header.as_bytes()).await?;
    wr.write_all(payload).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_round_trip_through_a_duplex_pipe() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        let hello = Hello::new(Some(Seq::new(7)), 500, 512, "STA1", false);
        write_frame(&mut a, &hello).await.unwrap();

        let header = RecordHeader::new(Seq::new(7), b"payload", 123, false);
        write_record(&mut a, &header, b"payload").await.unwrap();

        write_frame(&mut a, &AckFrame::new(Seq::new(1), Seq::new(7))).await.unwrap();
        write_frame(&mut a, &Prelude::new(FrameKind::Heartbeat, 0)).await.unwrap();

        match read_frame(&mut b, 512).await.unwrap() {
            Frame::Hello(h) => {
                let resume = h.resume;
                assert_eq!(Seq::decode(resume), Some(Seq::new(7)));
            }
            other => panic!("expected Hello, got {other:?}"),
        }
        match read_frame(&mut b, 512).await.unwrap() {
            Frame::Data { header, payload } => {
                assert_eq!(header.seq(), Seq::new(7));
                assert_eq!(&payload[..], b"payload");
                header.verify(&payload).unwrap();
            }
            other => panic!("expected Data, got {other:?}"),
        }
        match read_frame(&mut b, 512).await.unwrap() {
            Frame::Ack { low, high } => {
                assert_eq!(low, Seq::new(1));
                assert_eq!(high, Seq::new(7));
            }
            other => panic!("expected Ack, got {other:?}"),
        }
        assert!(matches!(read_frame(&mut b, 512).await.unwrap(), Frame::Heartbeat));
    }

    #[tokio::test]
    async fn garbage_is_a_wire_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        use tokio::io::AsyncWriteExt;
        a.write_all(&[0xDE, 0xAD, 0xBE, 0xEF]).await.unwrap();

        match read_frame(&mut b, 512).await {
            Err(FrameError::Wire(WireError::BadMarker(_))) => {}
            other => panic!("expected BadMarker, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_data_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let big = vec![0u8; 600];
        let header = RecordHeader::new(Seq::new(1), &big, 0, false);
        write_record(&mut a, &header, &big).await.unwrap();

        match read_frame(&mut b, 512).await {
            Err(FrameError::Wire(WireError::PayloadTooLarge { length: 600, .. })) => {}
            other => panic!("expected PayloadTooLarge, got {other:?}"),
        }
    }
}
