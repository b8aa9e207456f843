//! Commands the UI sends into a running session

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{SessionError, SessionResult};

/// Inbound command capacity; senders wait when the loop falls behind.
pub const COMMAND_BUFFER: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", content = "value", rename_all = "snake_case")]
pub enum UiCommand {
    ToggleMute,
    ToggleVideo,
    ToggleScreenShare,
    SetVirtualBackground(bool),
    SetBeautyFilter(bool),
    SetNoiseCancellation(bool),
    StartRecording,
    StopRecording,
    ToggleMinimize,
    EndCall,
    /// End-of-call rating, 1 to 5.
    Rate(u8),
}

impl UiCommand {
    pub fn name(&self) -> &'static str {
        match self {
            UiCommand::ToggleMute => "toggle_mute",
            UiCommand::ToggleVideo => "toggle_video",
            UiCommand::ToggleScreenShare => "toggle_screen_share",
            UiCommand::SetVirtualBackground(_) => "set_virtual_background",
            UiCommand::SetBeautyFilter(_) => "set_beauty_filter",
            UiCommand::SetNoiseCancellation(_) => "set_noise_cancellation",
            UiCommand::StartRecording => "start_recording",
            UiCommand::StopRecording => "stop_recording",
            UiCommand::ToggleMinimize => "toggle_minimize",
            UiCommand::EndCall => "end_call",
            UiCommand::Rate(_) => "rate",
        }
    }
}

/// Cloneable sending side of a session's command channel.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<UiCommand>,
}

impl SessionHandle {
    /// Handle plus the receiver to pass to the session loop.
    pub fn channel() -> (Self, mpsc::Receiver<UiCommand>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        (Self { tx }, rx)
    }

    pub async fn send(&self, command: UiCommand) -> SessionResult<()> {
        debug!(command = command.name(), "UI command");
        self.tx
            .send(command)
            .await
            .map_err(|_| SessionError::InvalidState {
                op: command.name(),
                state: "Ended".into(),
            })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn toggle_mute(&self) -> SessionResult<()> {
        self.send(UiCommand::ToggleMute).await
    }

    pub async fn toggle_video(&self) -> SessionResult<()> {
        self.send(UiCommand::ToggleVideo).await
    }

    pub async fn toggle_screen_share(&self) -> SessionResult<()> {
        self.send(UiCommand::ToggleScreenShare).await
    }

    pub async fn set_virtual_background(&self, on: bool) -> SessionResult<()> {
        self.send(UiCommand::SetVirtualBackground(on)).await
    }

    pub async fn set_beauty_filter(&self, on: bool) -> SessionResult<()> {
        self.send(UiCommand::SetBeautyFilter(on)).await
    }

    pub async fn set_noise_cancellation(&self, on: bool) -> SessionResult<()> {
        self.send(UiCommand::SetNoiseCancellation(on)).await
    }

    pub async fn start_recording(&self) -> SessionResult<()> {
        self.send(UiCommand::StartRecording).await
    }

    pub async fn stop_recording(&self) -> SessionResult<()> {
        self.send(UiCommand::StopRecording).await
    }

    pub async fn toggle_minimize(&self) -> SessionResult<()> {
        self.send(UiCommand::ToggleMinimize).await
    }

    pub async fn end_call(&self) -> SessionResult<()> {
        self.send(UiCommand::EndCall).await
    }

    pub async fn rate(&self, rating: u8) -> SessionResult<()> {
        self.send(UiCommand::Rate(rating)).await
    }
}
