//! Line-oriented control surface: one JSON command per stdin line, one JSON
//! line per result or event on stdout.

use samepage_core::{
    DocumentView, Error, Event, NotebookId, OutboundAction, PageState, RangeAnnotation,
    SamePageCore,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::actor::Input;
use crate::host::FsHost;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum Command {
    Connect,
    Disconnect,
    Status,
    Notifications,
    Share {
        page: String,
        #[serde(default)]
        targets: Vec<NotebookId>,
    },
    Invite {
        page: String,
        target: NotebookId,
    },
    Accept {
        notification: Uuid,
    },
    Reject {
        notification: Uuid,
    },
    MarkRead {
        notification: Uuid,
    },
    Insert {
        page: String,
        index: usize,
        text: String,
    },
    Delete {
        page: String,
        index: usize,
        count: usize,
    },
    Annotate {
        page: String,
        annotation: RangeAnnotation,
    },
    RemoveAnnotation {
        page: String,
        annotation: RangeAnnotation,
    },
    /// Replace the page text wholesale, then diff it into the replica.
    Write {
        page: String,
        text: String,
    },
    Refresh {
        page: String,
    },
    Close {
        page: String,
    },
    Remove {
        page: String,
    },
    Read {
        page: String,
    },
}

/// Run one command. Connection commands hand their actions back through `out`.
pub fn apply(
    core: &mut SamePageCore,
    files: &FsHost,
    command: Command,
    out: &mut Vec<OutboundAction>,
) -> Result<Value, Error> {
    match command {
        Command::Connect => {
            out.extend(core.try_connect()?);
            Ok(json!({ "status": core.status() }))
        }
        Command::Disconnect => {
            out.extend(core.disconnect());
            Ok(json!({ "status": core.status() }))
        }
        Command::Status => Ok(json!({
            "status": core.status(),
            "notebook": core.notebook(),
            "directPeers": core.direct_peers(),
            "directInFlight": core.direct_in_flight(),
        })),
        Command::Notifications => Ok(json!(core.notifications())),
        Command::Share { page, targets } => {
            if files.read_page(&page).is_err() {
                files.write_page(&page, &DocumentView::default())?;
            }
            let uuid = core.share_page(&page, &targets)?;
            Ok(json!({ "pageUuid": uuid }))
        }
        Command::Invite { page, target } => {
            core.invite(&page, target)?;
            Ok(Value::Null)
        }
        Command::Accept { notification } => {
            core.accept(&notification)?;
            Ok(Value::Null)
        }
        Command::Reject { notification } => {
            core.reject(&notification)?;
            Ok(Value::Null)
        }
        Command::MarkRead { notification } => {
            core.mark_read(&notification)?;
            Ok(Value::Null)
        }
        Command::Insert { page, index, text } => {
            let mut view = files.read_page(&page).unwrap_or_default();
            let at = byte_offset(&view.text, index);
            view.text.insert_str(at, &text);
            files.write_page(&page, &view)?;
            if core.page_state(&page) == PageState::Open {
                core.insert(&page, index, &text)?;
            }
            Ok(Value::Null)
        }
        Command::Delete { page, index, count } => {
            let mut view = files.read_page(&page)?;
            let range = char_range(&view.text, index, count)?;
            view.text.replace_range(range, "");
            files.write_page(&page, &view)?;
            if core.page_state(&page) == PageState::Open {
                core.delete(&page, index, count)?;
            }
            Ok(Value::Null)
        }
        Command::Annotate { page, annotation } => {
            let mut view = files.read_page(&page)?;
            view.annotations.push(annotation.clone());
            files.write_page(&page, &view)?;
            if core.page_state(&page) == PageState::Open {
                core.annotate(&page, annotation)?;
            }
            Ok(Value::Null)
        }
        Command::RemoveAnnotation { page, annotation } => {
            let mut view = files.read_page(&page)?;
            view.annotations.retain(|a| a != &annotation);
            files.write_page(&page, &view)?;
            if core.page_state(&page) == PageState::Open {
                core.remove_annotation(&page, annotation)?;
            }
            Ok(Value::Null)
        }
        Command::Write { page, text } => {
            let mut view = files.read_page(&page).unwrap_or_default();
            view.text = text;
            files.write_page(&page, &view)?;
            if core.page_state(&page) == PageState::Open {
                core.refresh(&page)?;
            }
            Ok(Value::Null)
        }
        Command::Refresh { page } => {
            core.refresh(&page)?;
            Ok(Value::Null)
        }
        Command::Close { page } => {
            core.close_page(&page)?;
            Ok(Value::Null)
        }
        Command::Remove { page } => {
            core.remove_page(&page)?;
            Ok(Value::Null)
        }
        Command::Read { page } => {
            let view = files.read_page(&page)?;
            Ok(json!({
                "text": view.text,
                "annotations": view.annotations,
                "state": core.page_state(&page),
                "checksum": core.page_checksum(&page),
            }))
        }
    }
}

fn byte_offset(text: &str, chars: usize) -> usize {
    text.char_indices()
        .nth(chars)
        .map(|(i, _)| i)
        .unwrap_or(text.len())
}

/// Byte range of `count` characters from `index`. Refuses ranges past the end.
fn char_range(text: &str, index: usize, count: usize) -> Result<std::ops::Range<usize>, Error> {
    let len = text.chars().count();
    match index.checked_add(count) {
        Some(end) if end <= len => Ok(byte_offset(text, index)..byte_offset(text, end)),
        _ => Err(Error::InvalidState(format!(
            "cannot delete {} characters at {} from {} characters",
            count, index, len
        ))),
    }
}

pub fn result_line(result: Result<Value, String>) -> String {
    match result {
        Ok(value) => json!({ "type": "result", "ok": true, "value": value }),
        Err(error) => json!({ "type": "result", "ok": false, "error": error }),
    }
    .to_string()
}

pub fn event_line(event: &Event) -> String {
    json!({ "type": "event", "event": event }).to_string()
}

/// Read commands from stdin until EOF or the core goes away.
pub async fn run_stdin(inputs: mpsc::UnboundedSender<Input>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "stdin read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Command>(&line) {
            Ok(command) => {
                if inputs.send(Input::Command(command)).is_err() {
                    break;
                }
            }
            Err(e) => println!("{}", result_line(Err(format!("bad command: {}", e)))),
        }
    }
    tracing::debug!("control input closed");
}
