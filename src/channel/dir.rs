//! `fsdir1` / `fslist1` — enumerate a directory, optionally following up
//! with live change events.
//!
//! Grounded on `cockpitfslist.c`: list in small batches, announce
//! completion with a sentinel event, then either close or fall through into
//! the same watch vocabulary `fswatch1` uses.

use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use super::file::{current_tag, entry_type_name, validate_path};
use super::{ChannelBase, ChannelEvent, ChannelInbound, ChannelRuntime};
use crate::error::Problem;

/// Directory entries announced per batch before yielding back to the event
/// loop, so a very large directory doesn't starve control-message handling.
const BATCH_SIZE: usize = 10;

pub async fn run(
    base: ChannelBase,
    inbound: mpsc::UnboundedReceiver<ChannelInbound>,
    done_tx: mpsc::UnboundedSender<String>,
) {
    let mut runtime = ChannelRuntime::new(base, inbound);
    let id = runtime.base.id.clone();
    list_dir(&mut runtime).await;
    done_tx.send(id).ok();
}

async fn list_dir(runtime: &mut ChannelRuntime) {
    let Some(path) = runtime.base.option_str("path").map(str::to_owned) else {
        runtime.base.emit_close(Some(Problem::ProtocolError));
        return;
    };
    if let Err(problem) = validate_path(&path) {
        runtime.base.emit_close(Some(problem));
        return;
    }
    let watch = runtime.base.option_bool("watch").unwrap_or(true);

    let mut entries = match tokio::fs::read_dir(&path).await {
        Ok(entries) => entries,
        Err(err) => {
            runtime.base.emit_close(Some(Problem::from_io_error(&err)));
            return;
        }
    };

    let _ = runtime.base.mark_ready();

    let mut batch = Vec::with_capacity(BATCH_SIZE);
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                let file_type = match entry.file_type().await {
                    Ok(ft) => ft,
                    Err(_) => continue,
                };
                let mut obj = serde_json::Map::new();
                obj.insert("event".into(), "present".into());
                obj.insert("path".into(), entry.file_name().to_string_lossy().into_owned().into());
                obj.insert("type".into(), entry_type_name(file_type).into());
                batch.push(obj);
                if batch.len() >= BATCH_SIZE {
                    flush_batch(runtime, &mut batch);
                }
            }
            Ok(None) => break,
            Err(err) => {
                runtime.base.emit_close(Some(Problem::from_io_error(&err)));
                return;
            }
        }
    }
    flush_batch(runtime, &mut batch);

    let mut obj = serde_json::Map::new();
    obj.insert("event".into(), "present-done".into());
    let payload = serde_json::to_vec(&serde_json::Value::Object(obj)).unwrap();
    runtime.base.send(&payload);

    if !watch {
        runtime.base.emit_close(None);
        return;
    }

    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
    let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            let _ = notify_tx.send(event);
        }
    });
    let mut watcher = match watcher {
        Ok(watcher) => watcher,
        Err(_) => {
            runtime.base.emit_close(Some(Problem::InternalError));
            return;
        }
    };
    if watcher.watch(std::path::Path::new(&path), RecursiveMode::NonRecursive).is_err() {
        runtime.base.emit_close(Some(Problem::InternalError));
        return;
    }

    loop {
        tokio::select! {
            biased;
            event = runtime.recv_event() => {
                match event {
                    Some(ChannelEvent::Close(problem)) => {
                        runtime.base.emit_close(problem);
                        return;
                    }
                    Some(_) => continue,
                    None => {
                        runtime.base.emit_close(None);
                        return;
                    }
                }
            }
            Some(fs_event) = notify_rx.recv() => {
                emit_watch_event(runtime, fs_event).await;
            }
        }
    }
}

fn flush_batch(runtime: &mut ChannelRuntime, batch: &mut Vec<serde_json::Map<String, serde_json::Value>>) {
    for obj in batch.drain(..) {
        let payload = serde_json::to_vec(&serde_json::Value::Object(obj)).unwrap();
        runtime.base.send(&payload);
    }
}

async fn emit_watch_event(runtime: &mut ChannelRuntime, event: Event) {
    let name = match event.kind {
        EventKind::Create(_) => "created",
        EventKind::Modify(notify::event::ModifyKind::Metadata(_)) => "attribute-changed",
        EventKind::Modify(_) => "changed",
        EventKind::Remove(_) => "deleted",
        _ => return,
    };
    for path in event.paths {
        let path_str = path.to_string_lossy().into_owned();
        let tag = current_tag(&path_str).await.unwrap_or_else(|_| "-".into());
        let mut obj = serde_json::Map::new();
        obj.insert("event".into(), name.into());
        obj.insert("path".into(), path_str.into());
        obj.insert("tag".into(), tag.into());
        let payload = serde_json::to_vec(&serde_json::Value::Object(obj)).unwrap();
        runtime.base.send(&payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn lists_entries_then_present_done_then_closes_when_not_watching() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a"), b"").await.unwrap();
        tokio::fs::write(dir.path().join("b"), b"").await.unwrap();

        let (mut client, server) = duplex(65536);
        let (transport, handle, _events) = Transport::new(server);
        tokio::spawn(transport.run());
        let base = ChannelBase::new(
            handle,
            "1".into(),
            serde_json::json!({"payload": "fsdir1", "path": dir.path().to_str().unwrap(), "watch": false}),
        )
        .unwrap();
        let (_inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (done_tx, _done_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(base, inbound_rx, done_tx));

        let mut dec = crate::transport::frame::FrameDecoder::new();
        let mut events = Vec::new();
        loop {
            let mut buf = [0u8; 4096];
            let n = client.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            for frame in dec.feed(&buf[..n]).unwrap() {
                let v: serde_json::Value = serde_json::from_slice(&frame.payload).unwrap();
                if v.get("command") == Some(&serde_json::Value::String("close".into())) {
                    return;
                }
                events.push(v);
            }
            if events.iter().any(|e| e["event"] == "present-done") {
                break;
            }
        }
        assert!(events.iter().any(|e| e["event"] == "present" && e["path"] == "a"));
        assert!(events.iter().any(|e| e["event"] == "present" && e["path"] == "b"));
        assert!(events.iter().any(|e| e["event"] == "present-done"));
    }
}
