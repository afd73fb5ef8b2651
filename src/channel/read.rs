//! `fsread1` — stream a file's contents in bounded chunks.
//!
//! Grounded on `cockpitfsread.c`: open, stat for the tag, stream in small
//! chunks, close carrying the tag observed at open time and a
//! `change-conflict` problem if the file moved on under us.

use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use super::file::{current_tag, validate_path, MISSING_TAG};
use super::{ChannelBase, ChannelEvent, ChannelInbound, ChannelRuntime};
use crate::error::Problem;

/// Largest chunk streamed per read; larger reads are split across several
/// payload sends.
const CHUNK_SIZE: usize = 4096;

pub async fn run(
    base: ChannelBase,
    inbound: mpsc::UnboundedReceiver<ChannelInbound>,
    done_tx: mpsc::UnboundedSender<String>,
) {
    let mut runtime = ChannelRuntime::new(base, inbound);
    let id = runtime.base.id.clone();
    stream_file(&mut runtime).await;
    done_tx.send(id).ok();
}

async fn stream_file(runtime: &mut ChannelRuntime) {
    let Some(path) = runtime.base.option_str("path").map(str::to_owned) else {
        finish(runtime, None, Some(Problem::ProtocolError));
        return;
    };
    if let Err(problem) = validate_path(&path) {
        finish(runtime, None, Some(problem));
        return;
    }

    let open_tag = match current_tag(&path).await {
        Ok(tag) => tag,
        Err(problem) => {
            finish(runtime, None, Some(problem));
            return;
        }
    };

    if open_tag == MISSING_TAG {
        finish(runtime, Some(MISSING_TAG.to_owned()), None);
        return;
    }

    let mut file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(err) => {
            finish(runtime, None, Some(Problem::from_io_error(&err)));
            return;
        }
    };

    let flushed = runtime.base.mark_ready();
    for payload in flushed {
        drop(payload); // fsread1 ignores inbound payloads entirely
    }

    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        tokio::select! {
            biased;
            event = runtime.recv_event() => {
                match event {
                    Some(ChannelEvent::Close(problem)) => {
                        finish(runtime, None, problem);
                        return;
                    }
                    Some(_) => continue, // payloads/control are not meaningful for fsread1
                    None => {
                        finish(runtime, None, None);
                        return;
                    }
                }
            }
            read = file.read(&mut buf) => {
                match read {
                    Ok(0) => break,
                    Ok(n) => runtime.base.send(&buf[..n]),
                    Err(err) => {
                        finish(runtime, None, Some(Problem::from_io_error(&err)));
                        return;
                    }
                }
            }
        }
    }

    let close_tag = match current_tag(&path).await {
        Ok(tag) => tag,
        Err(problem) => {
            finish(runtime, None, Some(problem));
            return;
        }
    };
    if close_tag != open_tag {
        finish(runtime, Some(open_tag), Some(Problem::ChangeConflict));
    } else {
        finish(runtime, Some(open_tag), None);
    }
}

fn finish(runtime: &mut ChannelRuntime, tag: Option<String>, problem: Option<Problem>) {
    if let Some(tag) = tag {
        runtime.base.close_option("tag", tag);
    }
    runtime.base.emit_close(problem);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;
    use tokio::io::{duplex, AsyncReadExt as _, AsyncWriteExt};

    async fn open_channel(
        path: &str,
    ) -> (tokio::io::DuplexStream, mpsc::UnboundedSender<String>, mpsc::UnboundedReceiver<String>) {
        let (client, server) = duplex(65536);
        let (transport, handle, _events) = Transport::new(server);
        tokio::spawn(transport.run());
        let base = ChannelBase::new(
            handle,
            "1".into(),
            serde_json::json!({"payload": "fsread1", "path": path}),
        )
        .unwrap();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(base, inbound_rx, done_tx.clone()));
        (client, inbound_tx, done_rx)
    }

    #[tokio::test]
    async fn streams_small_file_then_closes_with_tag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        tokio::fs::write(&path, b"hello world").await.unwrap();

        let (mut client, _inbound_tx, mut done_rx) = open_channel(path.to_str().unwrap()).await;

        let mut dec = crate::transport::frame::FrameDecoder::new();
        let mut got = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = client.read(&mut buf).await.unwrap();
            let frames = dec.feed(&buf[..n]).unwrap();
            for frame in frames {
                if frame.is_control() {
                    let v: serde_json::Value = serde_json::from_slice(&frame.payload).unwrap();
                    assert_eq!(v["command"], "close");
                    assert!(v.get("problem").is_none());
                    done_rx.recv().await;
                    return;
                }
                got.extend_from_slice(&frame.payload);
            }
            assert_eq!(got, b"hello world");
        }
    }

    #[tokio::test]
    async fn missing_file_closes_with_dash_tag_no_payload() {
        let (mut client, _inbound_tx, _done_rx) =
            open_channel("/definitely/does/not/exist/anywhere").await;

        let mut buf = [0u8; 1024];
        let n = client.read(&mut buf).await.unwrap();
        let mut dec = crate::transport::frame::FrameDecoder::new();
        let frames = dec.feed(&buf[..n]).unwrap();
        assert_eq!(frames.len(), 1);
        let v: serde_json::Value = serde_json::from_slice(&frames[0].payload).unwrap();
        assert_eq!(v["tag"], "-");
        assert!(v.get("problem").is_none());
    }
}
