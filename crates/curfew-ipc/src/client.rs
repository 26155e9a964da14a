//! IPC client implementation

use curfew_api::{Command, Event, Request, Response, ResponsePayload, ResponseResult};
use serde::de::DeserializeOwned;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

use crate::{IpcError, IpcResult};

/// Connection to curfewd. Requests are answered in order.
pub struct IpcClient {
    lines: BufReader<OwnedReadHalf>,
    sink: OwnedWriteHalf,
    last_request_id: u64,
}

impl IpcClient {
    pub async fn connect(socket_path: impl AsRef<Path>) -> IpcResult<Self> {
        let (read_half, write_half) = UnixStream::connect(socket_path).await?.into_split();

        Ok(Self {
            lines: BufReader::new(read_half),
            sink: write_half,
            last_request_id: 0,
        })
    }

    /// Send a command and wait for the matching response
    pub async fn send(&mut self, command: Command) -> IpcResult<Response> {
        self.last_request_id += 1;
        let request_id = self.last_request_id;

        let mut frame = serde_json::to_vec(&Request::new(request_id, command))?;
        frame.push(b'\n');
        self.sink.write_all(&frame).await?;

        let response: Response = read_frame(&mut self.lines).await?;
        if response.request_id != request_id {
            return Err(IpcError::InvalidMessage(format!(
                "response to request {} while waiting for {request_id}",
                response.request_id
            )));
        }
        Ok(response)
    }

    /// Like [`send`](Self::send), with error responses turned into [`IpcError::Rejected`]
    pub async fn request(&mut self, command: Command) -> IpcResult<ResponsePayload> {
        match self.send(command).await?.result {
            ResponseResult::Ok(payload) => Ok(payload),
            ResponseResult::Err(e) => Err(IpcError::Rejected {
                code: e.code,
                message: e.message,
            }),
        }
    }

    /// Turn this connection into an event stream
    pub async fn subscribe(mut self) -> IpcResult<EventStream> {
        self.request(Command::SubscribeEvents).await?;

        Ok(EventStream {
            lines: self.lines,
            _sink: self.sink,
        })
    }
}

/// Events pushed by curfewd after a subscription
pub struct EventStream {
    lines: BufReader<OwnedReadHalf>,
    // The server treats a closed write half as a disconnect
    _sink: OwnedWriteHalf,
}

impl EventStream {
    pub async fn next(&mut self) -> IpcResult<Event> {
        read_frame(&mut self.lines).await
    }
}

async fn read_frame<T: DeserializeOwned>(lines: &mut BufReader<OwnedReadHalf>) -> IpcResult<T> {
    let mut line = String::new();
    if lines.read_line(&mut line).await? == 0 {
        return Err(IpcError::ConnectionClosed);
    }
    Ok(serde_json::from_str(line.trim())?)
}
