//! `fsreplace1` — atomically replace a file's contents.
//!
//! Grounded on `cockpitfsreplace.c`: write into a uniquely-named temp file
//! alongside the target, `fsync` + re-check the tag on `done`, then
//! `rename()` into place. Any error or close-with-problem unlinks the temp
//! file; the teacher's `scopeguard` crate is the natural fit for that
//! "clean up unless we explicitly disarm it" shape, same as `crypto.rs`
//! zeroizing a buffer on every exit path.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use super::file::{current_tag, validate_path, MISSING_TAG};
use super::{ChannelBase, ChannelEvent, ChannelInbound, ChannelRuntime};
use crate::error::Problem;

const MAX_TEMP_ATTEMPTS: u32 = 10_000;

pub async fn run(
    base: ChannelBase,
    inbound: mpsc::UnboundedReceiver<ChannelInbound>,
    done_tx: mpsc::UnboundedSender<String>,
) {
    let mut runtime = ChannelRuntime::new(base, inbound);
    let id = runtime.base.id.clone();
    replace_file(&mut runtime).await;
    done_tx.send(id).ok();
}

async fn replace_file(runtime: &mut ChannelRuntime) {
    let Some(path) = runtime.base.option_str("path").map(str::to_owned) else {
        runtime.base.emit_close(Some(Problem::ProtocolError));
        return;
    };
    if let Err(problem) = validate_path(&path) {
        runtime.base.emit_close(Some(problem));
        return;
    }
    let expected_tag = runtime.base.option_str("tag").map(str::to_owned);

    if let Some(expected) = &expected_tag {
        match current_tag(&path).await {
            Ok(actual) if &actual == expected => {}
            Ok(_) => {
                runtime.base.emit_close(Some(Problem::ChangeConflict));
                return;
            }
            Err(problem) => {
                runtime.base.emit_close(Some(problem));
                return;
            }
        }
    }

    let (mut temp_file, temp_path) = match create_temp_sibling(Path::new(&path)).await {
        Ok(pair) => pair,
        Err(problem) => {
            runtime.base.emit_close(Some(problem));
            return;
        }
    };

    let mut guard = scopeguard::guard(Some(temp_path.clone()), |leftover| {
        if let Some(path) = leftover {
            let _ = std::fs::remove_file(path);
        }
    });

    let mut got_content = false;
    let flushed = runtime.base.mark_ready();
    for payload in flushed {
        if let Err(problem) = write_chunk(&mut temp_file, &payload, &mut got_content).await {
            runtime.base.emit_close(Some(problem));
            return;
        }
    }

    loop {
        match runtime.recv_event().await {
            Some(ChannelEvent::Payload(payload)) => {
                if let Err(problem) = write_chunk(&mut temp_file, &payload, &mut got_content).await
                {
                    runtime.base.emit_close(Some(problem));
                    return;
                }
            }
            Some(ChannelEvent::Control(command, _)) if command == "done" => break,
            Some(ChannelEvent::Control(_, _)) => continue,
            Some(ChannelEvent::Close(problem)) => {
                runtime.base.emit_close(problem);
                return;
            }
            None => {
                runtime.base.emit_close(None);
                return;
            }
        }
    }

    if let Err(err) = temp_file.sync_all().await {
        runtime.base.emit_close(Some(Problem::from_io_error(&err)));
        return;
    }
    drop(temp_file);

    if let Some(expected) = &expected_tag {
        match current_tag(&path).await {
            Ok(actual) if &actual == expected => {}
            Ok(_) => {
                runtime.base.emit_close(Some(Problem::ChangeConflict));
                return;
            }
            Err(problem) => {
                runtime.base.emit_close(Some(problem));
                return;
            }
        }
    }

    if !got_content {
        // No payload was ever sent: remove the target and report it gone.
        // The scope guard still owns cleanup of the (empty) temp file.
        let _ = tokio::fs::remove_file(&path).await;
        runtime.base.close_option("tag", MISSING_TAG);
        runtime.base.emit_close(None);
        return;
    }

    if let Err(err) = tokio::fs::rename(&temp_path, &path).await {
        runtime.base.emit_close(Some(Problem::from_io_error(&err)));
        return;
    }
    // Rename succeeded: disarm the cleanup guard, the temp path no longer exists under that name.
    *guard = None;

    match current_tag(&path).await {
        Ok(tag) => runtime.base.close_option("tag", tag),
        Err(_) => {} // best-effort; the rename already succeeded
    }
    runtime.base.emit_close(None);
}

async fn write_chunk(
    file: &mut tokio::fs::File,
    payload: &[u8],
    got_content: &mut bool,
) -> Result<(), Problem> {
    *got_content = true;
    file.write_all(payload).await.map_err(|err| Problem::from_io_error(&err))
}

async fn create_temp_sibling(target: &Path) -> Result<(tokio::fs::File, PathBuf), Problem> {
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let file_name = target.file_name().and_then(|n| n.to_str()).unwrap_or("file");
    for attempt in 0..MAX_TEMP_ATTEMPTS {
        let candidate = dir.join(format!(".{file_name}.{}.tmp", attempt ^ rand::random::<u32>()));
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(file) => return Ok((file, candidate)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(Problem::from_io_error(&err)),
        }
    }
    Err(Problem::InternalError)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt as _};

    async fn open_channel(
        path: &str,
        tag: Option<&str>,
    ) -> (tokio::io::DuplexStream, mpsc::UnboundedSender<ChannelInbound>, mpsc::UnboundedReceiver<String>)
    {
        let (client, server) = duplex(65536);
        let (transport, handle, _events) = Transport::new(server);
        tokio::spawn(transport.run());
        let mut options = serde_json::json!({"payload": "fsreplace1", "path": path});
        if let Some(tag) = tag {
            options["tag"] = serde_json::Value::String(tag.to_owned());
        }
        let base = ChannelBase::new(handle, "1".into(), options).unwrap();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(base, inbound_rx, done_tx));
        (client, inbound_tx, done_rx)
    }

    #[tokio::test]
    async fn writes_content_and_renames_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let (mut client, inbound_tx, mut done_rx) = open_channel(path.to_str().unwrap(), None).await;

        inbound_tx.send(ChannelInbound::Payload(b"new content".to_vec())).unwrap();
        inbound_tx
            .send(ChannelInbound::Control("done".into(), serde_json::json!({"command":"done"})))
            .unwrap();

        let mut buf = [0u8; 1024];
        let n = client.read(&mut buf).await.unwrap();
        let mut dec = crate::transport::frame::FrameDecoder::new();
        let frames = dec.feed(&buf[..n]).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&frames[0].payload).unwrap();
        assert_eq!(v["command"], "close");
        assert!(v.get("problem").is_none());

        done_rx.recv().await;
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, "new content");
        // no leftover temp file
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["out.txt".to_string()]);
    }

    #[tokio::test]
    async fn stale_tag_closes_change_conflict_without_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        tokio::fs::write(&path, b"original").await.unwrap();

        let (mut client, _inbound_tx, _done_rx) =
            open_channel(path.to_str().unwrap(), Some("bogus:tag:0:0")).await;

        let mut buf = [0u8; 1024];
        let n = client.read(&mut buf).await.unwrap();
        let mut dec = crate::transport::frame::FrameDecoder::new();
        let frames = dec.feed(&buf[..n]).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&frames[0].payload).unwrap();
        assert_eq!(v["problem"], "change-conflict");

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, "original");
    }
}
