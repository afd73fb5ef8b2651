//! `fswatch1` — stream filesystem change events beneath a path.
//!
//! Grounded on `cockpitfswatch.c`'s event vocabulary (`created`, `changed`,
//! `deleted`, `attribute-changed`, `moved`) mapped onto the `notify` crate,
//! the same inotify-backed watcher crate the wider Rust ecosystem reaches
//! for (the teacher doesn't watch files itself, but `notify` is the
//! standard choice other example repos in this pack use for this job).

use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::{mpsc, mpsc::UnboundedSender};

use super::file::{current_tag, entry_type_name};
use super::{ChannelBase, ChannelEvent, ChannelInbound, ChannelRuntime};
use crate::error::Problem;

pub async fn run(
    base: ChannelBase,
    inbound: mpsc::UnboundedReceiver<ChannelInbound>,
    done_tx: mpsc::UnboundedSender<String>,
) {
    let mut runtime = ChannelRuntime::new(base, inbound);
    let id = runtime.base.id.clone();
    watch_path(&mut runtime).await;
    done_tx.send(id).ok();
}

async fn watch_path(runtime: &mut ChannelRuntime) {
    let Some(path) = runtime.base.option_str("path").map(str::to_owned) else {
        runtime.base.emit_close(Some(Problem::ProtocolError));
        return;
    };

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
    if let Err(err) = watcher.watch(std::path::Path::new(&path), RecursiveMode::Recursive) {
        runtime.base.emit_close(Some(map_notify_err(&err)));
        return;
    }

    let _ = runtime.base.mark_ready();

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
                emit_fs_event(runtime, fs_event).await;
            }
        }
    }
}

async fn emit_fs_event(runtime: &mut ChannelRuntime, event: Event) {
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
        if name == "created" {
            if let Ok(meta) = tokio::fs::symlink_metadata(&path).await {
                obj.insert("type".into(), entry_type_name(meta.file_type()).into());
            }
        }
        let payload = serde_json::to_vec(&serde_json::Value::Object(obj)).unwrap();
        runtime.base.send(&payload);
    }
}

fn map_notify_err(err: &notify::Error) -> Problem {
    use notify::ErrorKind;
    match &err.kind {
        ErrorKind::PathNotFound => Problem::NotFound,
        ErrorKind::Generic(_) | ErrorKind::Io(_) => Problem::InternalError,
        _ => Problem::InternalError,
    }
}
