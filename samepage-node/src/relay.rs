//! Relay socket: a WebSocket carrying one JSON text message per frame.

use futures_util::{SinkExt, StreamExt};
use samepage_core::wire::{self, FrameDecodeError};
use samepage_core::{Channel, Frame, Target};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::actor::Input;

#[derive(Debug)]
pub enum RelayCommand {
    Open,
    Close,
    Send { target: Target, frames: Vec<Frame> },
}

/// What an inbound text message means for the core.
fn classify(text: &str) -> Option<Input> {
    match wire::frame_from_text(text) {
        Ok(frame) => Some(Input::Frame(Channel::Primary, frame)),
        Err(FrameDecodeError::ServerError(reason)) => Some(Input::ServerError(reason)),
        Err(e) => {
            tracing::warn!(error = %e, "dropping unparseable relay message");
            None
        }
    }
}

/// Open the socket on `Open`, close it on `Close`, report open/close/frames to the core.
pub async fn run_relay(
    url: String,
    mut commands: mpsc::UnboundedReceiver<RelayCommand>,
    inputs: mpsc::UnboundedSender<Input>,
) {
    loop {
        match commands.recv().await {
            None => return,
            Some(RelayCommand::Open) => {}
            Some(other) => {
                tracing::debug!(command = ?other, "relay closed, dropping command");
                continue;
            }
        }
        tracing::info!(%url, "connecting to relay");
        let ws = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                tracing::warn!(%url, error = %e, "relay connect failed");
                let _ = inputs.send(Input::TransportClosed);
                continue;
            }
        };
        let _ = inputs.send(Input::TransportOpen);
        let (mut sink, mut stream) = ws.split();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    None => {
                        let _ = sink.close().await;
                        return;
                    }
                    Some(RelayCommand::Open) => {}
                    Some(RelayCommand::Close) => {
                        let _ = sink.close().await;
                        break;
                    }
                    Some(RelayCommand::Send { target, frames }) => {
                        let mut failed = false;
                        for frame in &frames {
                            let text = match wire::relay_text(target, frame) {
                                Ok(text) => text,
                                Err(e) => {
                                    tracing::warn!(error = %e, "dropping unencodable frame");
                                    continue;
                                }
                            };
                            if let Err(e) = sink.send(Message::Text(text.into())).await {
                                tracing::warn!(error = %e, "relay send failed");
                                failed = true;
                                break;
                            }
                        }
                        if failed {
                            let _ = inputs.send(Input::TransportClosed);
                            break;
                        }
                    }
                },
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(input) = classify(text.as_str()) {
                            let _ = inputs.send(input);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!("relay closed the connection");
                        let _ = inputs.send(Input::TransportClosed);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "relay read failed");
                        let _ = inputs.send(Input::TransportClosed);
                        break;
                    }
                },
            }
        }
    }
}
